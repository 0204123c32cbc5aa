use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Duration as StdDuration,
};

use hifitime::prelude::Duration;
use serde::Deserialize;

use crate::error::Error;

/// Shortest accepted period (s)
const MIN_PERIOD_SECS: f64 = 1.0E-3;

/// Longest accepted period (s): one week
const MAX_PERIOD_SECS: f64 = 7.0 * 86_400.0;

fn check_period(name: &str, value: f64) -> Result<(), Error> {
    if !(MIN_PERIOD_SECS..=MAX_PERIOD_SECS).contains(&value) {
        return Err(Error::Config(format!(
            "{} must lie within [{}; {}] seconds (got {})",
            name, MIN_PERIOD_SECS, MAX_PERIOD_SECS, value
        )));
    }
    Ok(())
}

/// Application [Settings].
/// Every field may be omitted from the configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// MQTT broker host
    pub broker: String,

    /// MQTT broker port
    pub port: u16,

    /// Custom MQTT client ID. Defaults to the receiver name.
    pub client_id: Option<String>,

    /// Keep alive period (s)
    pub keep_alive_secs: u64,

    /// Root of the `<receiver>/<receiver>_R_*.rnx` tree
    pub data_root: PathBuf,

    /// Delay between two publications (s)
    pub pacing_secs: f64,

    /// Directory polling period (s)
    pub poll_interval_secs: f64,

    /// Maximal message age (s)
    pub freshness_window_secs: f64,

    /// Simulated measurement cadence (s)
    pub cadence_secs: f64,

    /// Simulator clock check period (s)
    pub tick_secs: f64,

    /// [ReconnectPolicy]
    pub reconnect: ReconnectPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: "broker.emqx.io".to_string(),
            port: 1883,
            client_id: None,
            keep_alive_secs: 30,
            data_root: PathBuf::from("rnx_files"),
            pacing_secs: 30.0,
            poll_interval_secs: 60.0,
            freshness_window_secs: 30.0,
            cadence_secs: 30.0,
            tick_secs: 1.0,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Settings {
    /// Loads [Settings] from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let fd = File::open(path)?;
        let settings: Self = serde_json::from_reader(BufReader::new(fd))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Verifies all periods are meaningful
    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("pacing_secs", self.pacing_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("freshness_window_secs", self.freshness_window_secs),
            ("cadence_secs", self.cadence_secs),
            ("tick_secs", self.tick_secs),
        ] {
            check_period(name, value)?;
        }

        if self.reconnect.enabled {
            check_period("initial_backoff_secs", self.reconnect.initial_backoff_secs)?;
            check_period("max_backoff_secs", self.reconnect.max_backoff_secs)?;
        }

        if self.keep_alive_secs > u16::MAX as u64 {
            return Err(Error::Config(format!(
                "keep_alive_secs must not exceed {} (got {})",
                u16::MAX,
                self.keep_alive_secs
            )));
        }

        if self.broker.is_empty() {
            return Err(Error::Config("empty broker host".to_string()));
        }

        Ok(())
    }

    pub fn pacing(&self) -> StdDuration {
        StdDuration::from_secs_f64(self.pacing_secs)
    }

    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn tick(&self) -> StdDuration {
        StdDuration::from_secs_f64(self.tick_secs)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_seconds(self.freshness_window_secs)
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_seconds(self.cadence_secs)
    }
}

/// Bus reconnection policy. Retries with exponential backoff,
/// from `initial_backoff_secs` up to `max_backoff_secs`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect at all
    pub enabled: bool,

    /// First retry delay (s)
    pub initial_backoff_secs: f64,

    /// Retry delay upper bound (s)
    pub max_backoff_secs: f64,

    /// Consecutive attempts before giving up. Unlimited when omitted.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_secs: 1.0,
            max_backoff_secs: 60.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Returns the delay to wait before retry #`attempt` (0 based),
    /// or None when we should give up.
    pub fn backoff(&self, attempt: u32) -> Option<StdDuration> {
        if !self.enabled {
            return None;
        }

        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let factor = 2.0_f64.powi(attempt.min(32) as i32);
        let delay = (self.initial_backoff_secs * factor).min(self.max_backoff_secs);
        Some(StdDuration::from_secs_f64(delay.max(0.0)))
    }
}
