use hifitime::prelude::{Duration, Epoch};
use log::{debug, error, info, trace, warn};
use tokio::sync::{oneshot, watch};

pub mod cache;
pub mod generator;

pub use cache::DedupCache;
pub use generator::SimulatedGenerator;

use crate::{
    bus::{Bus, BusEvent},
    error::ParseError,
    record::split_timestamp,
    runtime::Runtime,
};

/// Reason a message was turned down
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Already accepted
    Duplicate,

    /// Not a `YYYY-MM-DD HH:MM:SS ...` message
    Malformed(ParseError),

    /// Outside of the freshness window
    Stale { age: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
}

/// Message counters
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ValidatorStats {
    pub accepted: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub stale: usize,
}

impl std::fmt::Display for ValidatorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "accepted={} duplicates={} malformed={} stale={}",
            self.accepted, self.duplicates, self.malformed, self.stale
        )
    }
}

/// [MessageValidator] accepts each message once, as long as
/// its timestamp lies within `window` of current time.
#[derive(Debug, Clone)]
pub struct MessageValidator {
    window: Duration,
    cache: DedupCache,
    stats: ValidatorStats,
}

impl MessageValidator {
    /// Builds a new [MessageValidator]. Accepted payloads are remembered
    /// for twice the freshness window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            cache: DedupCache::new(Duration::from_seconds(2.0 * window.to_seconds())),
            stats: Default::default(),
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> ValidatorStats {
        self.stats
    }

    /// Number of payloads currently remembered
    #[cfg(test)]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Validates one raw message, at `now`
    pub fn on_message(&mut self, raw: &str, now: Epoch) -> Verdict {
        self.cache.evict(now);

        if self.cache.contains(raw) {
            self.stats.duplicates += 1;
            return Verdict::Rejected(Rejection::Duplicate);
        }

        let (timestamp, _) = match split_timestamp(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.malformed += 1;
                return Verdict::Rejected(Rejection::Malformed(e));
            },
        };

        let age = (now - timestamp).abs();

        if age <= self.window {
            self.cache.insert(raw, now);
            self.stats.accepted += 1;
            Verdict::Accepted
        } else {
            self.stats.stale += 1;
            Verdict::Rejected(Rejection::Stale { age })
        }
    }

    /// Consumes `topic` until shutdown is signaled.
    /// `gate` is fired once the first subscription is established.
    pub async fn run<B: Bus>(
        mut self,
        mut bus: B,
        topic: String,
        runtime: Runtime,
        mut gate: Option<oneshot::Sender<()>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, ValidatorStats) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = bus.recv() => match event {
                    Some(BusEvent::Connected) => match bus.subscribe(&topic).await {
                        Ok(_) => {
                            info!(
                                "{} - subscribed to topic: {}",
                                runtime.utc_seconds(),
                                topic
                            );

                            if let Some(gate) = gate.take() {
                                let _ = gate.send(());
                            }
                        },
                        Err(e) => {
                            error!("{} - {}", runtime.utc_seconds(), e);
                        },
                    },
                    Some(BusEvent::Disconnected(reason)) => {
                        warn!(
                            "{} - disconnected from broker: {}",
                            runtime.utc_seconds(),
                            reason
                        );
                    },
                    Some(BusEvent::Message { topic: origin, payload }) => {
                        if origin == topic {
                            self.handle(&payload, runtime.utc_time());
                        } else {
                            trace!("ignoring message on \"{}\"", origin);
                        }
                    },
                    None => {
                        warn!("{} - bus closed for good", runtime.utc_seconds());
                        break;
                    },
                },
            }
        }

        bus.close().await;

        let stats = self.stats;
        info!("{} - validator stopped: {}", runtime.utc_seconds(), stats);

        (self, stats)
    }

    fn handle(&mut self, payload: &str, now: Epoch) {
        match self.on_message(payload, now) {
            Verdict::Accepted => info!("processed message: {}", payload),
            Verdict::Rejected(Rejection::Duplicate) => trace!("duplicate message: {}", payload),
            Verdict::Rejected(Rejection::Malformed(e)) => {
                error!("error parsing message: {} - {}", e, payload)
            },
            Verdict::Rejected(Rejection::Stale { age }) => {
                debug!("stale message ({}): {}", age, payload)
            },
        }
    }
}
