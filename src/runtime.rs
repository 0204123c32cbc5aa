use hifitime::prelude::{Duration, Epoch, TimeScale};
use log::error;
use tokio::time::Instant;

/// Where [Runtime] reads current time from
#[derive(Debug, Copy, Clone, PartialEq)]
enum Clock {
    /// System (wall) clock, follows NTP steps and host suspension
    System,

    /// Deployment [Epoch] followed by the monotonic (tokio) clock,
    /// which makes timed logic deterministic under paused time.
    #[cfg(test)]
    Simulated(Epoch),
}

/// [Runtime] is the application clock.
#[derive(Debug, Copy, Clone)]
pub struct Runtime {
    clock: Clock,

    /// Monotonic instant of deployment
    deploy_instant: Instant,
}

impl Runtime {
    /// Deploys a new [Runtime] that follows system time
    pub fn new() -> Result<Self, hifitime::HifitimeError> {
        // fails early if system time is not available
        let _ = Epoch::now()?;

        Ok(Self {
            clock: Clock::System,
            deploy_instant: Instant::now(),
        })
    }

    /// Deploys a new [Runtime] as if current time were `epoch`
    #[cfg(test)]
    pub fn deploy(epoch: Epoch) -> Self {
        Self {
            clock: Clock::Simulated(epoch.to_time_scale(TimeScale::UTC)),
            deploy_instant: Instant::now(),
        }
    }

    /// Returns uptime as [Duration]
    pub fn uptime(&self) -> Duration {
        let elapsed = self.deploy_instant.elapsed();
        Duration::from_total_nanoseconds(elapsed.as_nanos() as i128)
    }

    /// Returns current epoch in [TimeScale::UTC]
    pub fn utc_time(&self) -> Epoch {
        match self.clock {
            Clock::System => match Epoch::now() {
                Ok(now) => now.to_time_scale(TimeScale::UTC),
                Err(e) => {
                    error!("failed to read system time: {}", e);
                    Epoch::from_unix_seconds(0.0) + self.uptime()
                },
            },
            #[cfg(test)]
            Clock::Simulated(deploy_time) => deploy_time + self.uptime(),
        }
    }

    /// Returns current epoch rounded to the second, for logging purposes
    pub fn utc_seconds(&self) -> Epoch {
        self.utc_time().round(Duration::from_seconds(1.0))
    }
}

#[cfg(test)]
mod test {
    use super::Runtime;
    use hifitime::prelude::{Duration, Epoch};

    #[tokio::test(start_paused = true)]
    async fn simulated_clock() {
        let t0 = Epoch::from_gregorian_utc_hms(2024, 1, 1, 0, 0, 0);
        let runtime = Runtime::deploy(t0);

        assert_eq!(runtime.utc_time(), t0);

        tokio::time::sleep(std::time::Duration::from_secs(42)).await;

        assert_eq!(runtime.uptime(), Duration::from_seconds(42.0));
        assert_eq!(runtime.utc_time(), t0 + Duration::from_seconds(42.0));
    }

    #[tokio::test(start_paused = true)]
    async fn system_clock() {
        let runtime = Runtime::new().unwrap();

        let before = Epoch::now().unwrap();
        let now = runtime.utc_time();
        let after = Epoch::now().unwrap();

        assert!(before <= now && now <= after);

        // monotonic time drifts away from wall time: we keep following the latter
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;

        assert_eq!(runtime.uptime(), Duration::from_seconds(3600.0));

        let error = (runtime.utc_time() - Epoch::now().unwrap()).abs();
        assert!(error < Duration::from_seconds(1.0), "off by {}", error);
    }
}
