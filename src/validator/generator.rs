use std::time::Duration as StdDuration;

use hifitime::prelude::{Duration, Epoch};
use log::{debug, error, info, warn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rinex::prelude::{Constellation, SV};
use tokio::{
    sync::{oneshot, watch},
    time::MissedTickBehavior,
};

use crate::{
    bus::{Publisher, topic},
    record::MeasurementRecord,
    runtime::Runtime,
    settings::Settings,
    validator::DedupCache,
};

/// Number of simulated satellites (G01..G20)
pub const SATELLITES: u8 = 20;

/// Phase TEC range (TECu)
const PHASE_TEC_RANGE: (f64, f64) = (-500.0, 500.0);

/// Pseudo range TEC range (TECu)
const PSEUDORANGE_TEC_RANGE: (f64, f64) = (-50.0, 50.0);

/// Returns the simulated constellation
pub fn satellites() -> Vec<SV> {
    (1..=SATELLITES)
        .map(|prn| SV::new(Constellation::GPS, prn))
        .collect()
}

/// Synthesizes one random measurement on every `cadence` boundary
#[derive(Debug)]
pub struct SimulatedGenerator<P: Publisher> {
    topic: String,
    publisher: P,
    runtime: Runtime,
    cadence: Duration,
    tick: StdDuration,
    satellites: Vec<SV>,
    cache: DedupCache,
    rng: StdRng,
}

impl<P: Publisher> SimulatedGenerator<P> {
    pub fn new(receiver: &str, publisher: P, runtime: Runtime, settings: &Settings) -> Self {
        let cadence = settings.cadence();
        Self {
            topic: topic(receiver),
            publisher,
            runtime,
            cadence,
            tick: settings.tick(),
            satellites: satellites(),
            cache: DedupCache::new(Duration::from_seconds(2.0 * cadence.to_seconds())),
            rng: StdRng::from_os_rng(),
        }
    }

    /// Makes the random sequence reproducible
    #[cfg(test)]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// First boundary strictly after `t`, cadence being aligned on UTC midnight
    fn next_boundary(&self, t: Epoch) -> Epoch {
        let (y, m, d, hh, mm, ss, ns) = t.to_gregorian_utc();
        let midnight = Epoch::from_gregorian_utc_at_midnight(y, m, d);

        let seconds_of_day =
            hh as f64 * 3600.0 + mm as f64 * 60.0 + ss as f64 + ns as f64 * 1.0E-9;

        let cadence_s = self.cadence.to_seconds();
        let periods = (seconds_of_day / cadence_s).floor() + 1.0;

        midnight + Duration::from_seconds(periods * cadence_s)
    }

    /// Draws a new [MeasurementRecord]
    pub fn synthesize(&mut self, epoch: Epoch) -> MeasurementRecord {
        let sv = self.satellites[self.rng.random_range(0..self.satellites.len())];
        let phase_tec = self
            .rng
            .random_range(PHASE_TEC_RANGE.0..=PHASE_TEC_RANGE.1);
        let pseudorange_tec = self
            .rng
            .random_range(PSEUDORANGE_TEC_RANGE.0..=PSEUDORANGE_TEC_RANGE.1);

        MeasurementRecord::new(epoch, sv, phase_tec, pseudorange_tec)
    }

    /// Synthesizes and publishes the measurement due at `boundary`.
    /// Returns true if something was published.
    async fn emit(&mut self, boundary: Epoch, now: Epoch) -> bool {
        self.cache.evict(now);

        let message = self.synthesize(boundary).to_string();

        if self.cache.contains(&message) {
            debug!("already published: {}", message);
            return false;
        }

        match self.publisher.publish(&self.topic, &message).await {
            Ok(_) => {
                info!("published message: {}", message);
                self.cache.insert(&message, now);
                true
            },
            Err(e) => {
                error!("failed to send message to topic {}: {}", self.topic, e);
                false
            },
        }
    }

    /// Waits for the subscription `gate`, then generates until shutdown.
    /// Returns the number of published messages.
    pub async fn run(
        mut self,
        gate: oneshot::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> usize {
        tokio::select! {
            _ = shutdown.changed() => return 0,
            opened = gate => {
                if opened.is_err() {
                    warn!("subscription was never established: aborting simulation");
                    return 0;
                }
            },
        }

        let mut boundary = self.next_boundary(self.runtime.utc_time());

        info!(
            "{} - simulating {} (first measurement at {})",
            self.runtime.utc_seconds(),
            self.topic,
            boundary
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut published = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let now = self.runtime.utc_time();

                    if now >= boundary {
                        if self.emit(boundary, now).await {
                            published += 1;
                        }
                        boundary = self.next_boundary(now);
                    } else if boundary - now > self.cadence {
                        // system time was stepped backwards
                        boundary = self.next_boundary(now);
                    }
                },
            }
        }

        published
    }
}
