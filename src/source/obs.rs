use std::{collections::BTreeMap, path::Path};

use log::debug;

use rinex::prelude::{Constellation, Epoch, Rinex, SV, TimeScale, obs::EpochFlag};

use crate::{
    error::Error,
    record::MeasurementRecord,
    source::{RecordSource, Records},
};

/// Speed of light (m/s)
const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Ionospheric refraction constant (m³.s⁻²)
const IONO_CONSTANT: f64 = 40.308;

/// 1 TECu = 1e16 el.m⁻²
const TECU: f64 = 1.0E16;

/// Observation RINEX [RecordSource]: derives
/// dual frequency TEC from phase and pseudo range observations.
#[derive(Debug, Default, Copy, Clone)]
pub struct RinexSource;

/// Pair of carriers we combine, as (RINEX band code, frequency in Hz)
#[derive(Debug, Copy, Clone, PartialEq)]
struct BandPair {
    first: (char, f64),
    second: (char, f64),
}

impl BandPair {
    fn new(constellation: Constellation) -> Option<Self> {
        match constellation {
            Constellation::GPS | Constellation::QZSS => Some(Self {
                first: ('1', 1575.42E6),
                second: ('2', 1227.60E6),
            }),
            Constellation::Galileo => Some(Self {
                first: ('1', 1575.42E6),
                second: ('5', 1176.45E6),
            }),
            Constellation::BeiDou => Some(Self {
                first: ('2', 1561.098E6),
                second: ('7', 1207.14E6),
            }),
            _ => None,
        }
    }

    /// TECu per meter of differential delay
    fn tec_factor(&self) -> f64 {
        let (f1, f2) = (self.first.1.powi(2), self.second.1.powi(2));
        f1 * f2 / (IONO_CONSTANT * (f1 - f2)) / TECU
    }

    fn index(&self, band: char) -> Option<usize> {
        if band == self.first.0 {
            Some(0)
        } else if band == self.second.0 {
            Some(1)
        } else {
            None
        }
    }
}

/// Signals gathered for one satellite at one epoch
#[derive(Debug, Default, Copy, Clone)]
struct DualFrequency {
    /// phase (cycles)
    phase: [Option<f64>; 2],

    /// pseudo range (m)
    range: [Option<f64>; 2],
}

impl DualFrequency {
    /// Latch a new observation, identified by its RINEX code
    fn latch(&mut self, pair: &BandPair, code: &str, value: f64) {
        let mut chars = code.chars();

        let (Some(kind), Some(band)) = (chars.next(), chars.next()) else {
            return;
        };

        let Some(index) = pair.index(band) else {
            return;
        };

        match kind {
            'L' => {
                self.phase[index].get_or_insert(value);
            },
            // P code (V2) prevails over C/A
            'P' => self.range[index] = Some(value),
            'C' => {
                self.range[index].get_or_insert(value);
            },
            _ => {},
        }
    }

    /// Returns (phase TEC, pseudo range TEC) when all four observations exist
    fn tec(&self, pair: &BandPair) -> Option<(f64, f64)> {
        let (l1, l2) = (self.phase[0]?, self.phase[1]?);
        let (p1, p2) = (self.range[0]?, self.range[1]?);

        let (lambda1, lambda2) = (SPEED_OF_LIGHT / pair.first.1, SPEED_OF_LIGHT / pair.second.1);

        let k = pair.tec_factor();

        Some((k * (l1 * lambda1 - l2 * lambda2), k * (p2 - p1)))
    }
}

impl RecordSource for RinexSource {
    fn open(&self, path: &Path) -> Result<Records, Error> {
        let decode_error = |reason: String| Error::Decode {
            path: path.to_path_buf(),
            reason,
        };

        let rinex = Rinex::from_file(&*path.to_string_lossy())
            .map_err(|e| decode_error(e.to_string()))?;

        if !rinex.is_observation_rinex() {
            return Err(decode_error("not an observation RINEX".to_string()));
        }

        let mut gathered = BTreeMap::<(Epoch, SV), DualFrequency>::new();

        for (key, signal) in rinex.signal_observations_iter() {
            if key.flag != EpochFlag::Ok {
                continue;
            }

            let Some(pair) = BandPair::new(signal.sv.constellation) else {
                continue;
            };

            gathered
                .entry((key.epoch, signal.sv))
                .or_default()
                .latch(&pair, &signal.observable.to_string(), signal.value);
        }

        debug!(
            "{}: {} (epoch, sv) combinations",
            path.display(),
            gathered.len()
        );

        let records = gathered.into_iter().filter_map(|((epoch, sv), dual)| {
            let pair = BandPair::new(sv.constellation)?;
            let (phase_tec, pseudorange_tec) = dual.tec(&pair)?;

            Some(Ok(MeasurementRecord::new(
                epoch.to_time_scale(TimeScale::UTC),
                sv,
                phase_tec,
                pseudorange_tec,
            )))
        });

        Ok(Box::new(records))
    }
}
