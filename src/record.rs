use std::str::FromStr;

use hifitime::{
    efmt::Format,
    prelude::{Duration, Epoch, Formatter, TimeScale},
};
use rinex::prelude::SV;

use crate::error::ParseError;

/// One TEC measurement, for one satellite at one instant.
/// Its [std::fmt::Display] implementation is the wire format:
/// `YYYY-MM-DD HH:MM:SS <sv>: <phase_tec> <pseudorange_tec>`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MeasurementRecord {
    /// [Epoch] of measurement, expressed in UTC
    pub epoch: Epoch,

    /// Measured [SV]
    pub sv: SV,

    /// Phase derived TEC (TECu)
    pub phase_tec: f64,

    /// Pseudo range derived TEC (TECu)
    pub pseudorange_tec: f64,
}

impl MeasurementRecord {
    pub fn new(epoch: Epoch, sv: SV, phase_tec: f64, pseudorange_tec: f64) -> Self {
        Self {
            epoch,
            sv,
            phase_tec,
            pseudorange_tec,
        }
    }
}

impl std::fmt::Display for MeasurementRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: {} {}",
            format_utc(self.epoch),
            self.sv,
            format_value(self.phase_tec),
            format_value(self.pseudorange_tec),
        )
    }
}

impl FromStr for MeasurementRecord {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (epoch, rest) = split_timestamp(s)?;

        let (sv, values) = rest.split_once(':').ok_or(ParseError::MissingFields)?;

        let sv = SV::from_str(sv.trim())
            .map_err(|_| ParseError::InvalidSatellite(sv.trim().to_string()))?;

        let mut values = values.split_whitespace();

        let mut next_value = || -> Result<f64, ParseError> {
            let value = values.next().ok_or(ParseError::MissingFields)?;
            value
                .parse::<f64>()
                .map_err(|_| ParseError::InvalidValue(value.to_string()))
        };

        let phase_tec = next_value()?;
        let pseudorange_tec = next_value()?;

        Ok(Self::new(epoch, sv, phase_tec, pseudorange_tec))
    }
}

/// Wire timestamp format
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats [Epoch] as `YYYY-MM-DD HH:MM:SS` (UTC), rounded to the second.
pub fn format_utc(epoch: Epoch) -> String {
    let epoch = epoch
        .to_time_scale(TimeScale::UTC)
        .round(Duration::from_seconds(1.0));

    let fmt = Format::from_str(TIMESTAMP_FORMAT).unwrap();
    Formatter::new(epoch, fmt).to_string()
}

/// Formats a TEC value: shortest representation that reads back identically,
/// exponents being signed and padded to two digits (`1.5e-05`, `1e+16`).
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }

    let formatted = format!("{:?}", value);

    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        },
        None => formatted,
    }
}

/// Splits a wire message on its first two spaces and interprets
/// the leading `YYYY-MM-DD HH:MM:SS` as a UTC [Epoch].
/// Returns the [Epoch] and the remaining payload.
pub fn split_timestamp(message: &str) -> Result<(Epoch, &str), ParseError> {
    let mut parts = message.splitn(3, ' ');

    let (date, time, rest) = match (parts.next(), parts.next(), parts.next()) {
        (Some(date), Some(time), Some(rest)) => (date, time, rest),
        _ => return Err(ParseError::MissingFields),
    };

    let timestamp = &message[..date.len() + 1 + time.len()];

    let epoch = Epoch::from_format_str(timestamp, TIMESTAMP_FORMAT)
        .map_err(|_| ParseError::InvalidTimestamp(timestamp.to_string()))?;

    // zero padded fields only
    if format_utc(epoch) != timestamp {
        return Err(ParseError::InvalidTimestamp(timestamp.to_string()));
    }

    Ok((epoch, rest))
}
