use std::time::Duration;

use log::{error, info};
use tokio::time::Instant;

use crate::{bus::Publisher, error::Error, source::Records};

/// Outcome of [StreamPublisher::publish_next]
#[derive(Debug)]
pub enum Step {
    /// Record went out
    Published,

    /// Record was lost (bus failure)
    Dropped,

    /// End of file
    Exhausted,

    /// Decoding failed: the file should be abandoned
    Failed(Error),
}

/// Publishes [Records] in order, one every `pacing`
pub struct StreamPublisher {
    topic: String,
    records: Records,
    pacing: Duration,
    next_at: Instant,
    published: usize,
    dropped: usize,
}

impl std::fmt::Debug for StreamPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPublisher")
            .field("topic", &self.topic)
            .field("pacing", &self.pacing)
            .field("published", &self.published)
            .field("dropped", &self.dropped)
            .finish()
    }
}

impl StreamPublisher {
    /// Builds new [StreamPublisher]. First record is due immediately.
    pub fn new(topic: &str, records: Records, pacing: Duration) -> Self {
        Self {
            topic: topic.to_string(),
            records,
            pacing,
            next_at: Instant::now(),
            published: 0,
            dropped: 0,
        }
    }

    /// Instant the next record is due
    pub fn deadline(&self) -> Instant {
        self.next_at
    }

    /// Number of records published so far
    pub fn published(&self) -> usize {
        self.published
    }

    /// Number of records lost so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Pulls and publishes the next record, then arms the pacing delay.
    /// Publication failures are not retried.
    pub async fn publish_next<P: Publisher>(&mut self, publisher: &P) -> Step {
        let record = match self.records.next() {
            None => return Step::Exhausted,
            Some(Err(e)) => return Step::Failed(e),
            Some(Ok(record)) => record,
        };

        self.next_at = Instant::now() + self.pacing;

        let message = record.to_string();

        match publisher.publish(&self.topic, &message).await {
            Ok(_) => {
                info!("published \"{}\"", message);
                self.published += 1;
                Step::Published
            },
            Err(e) => {
                error!("{} - record dropped", e);
                self.dropped += 1;
                Step::Dropped
            },
        }
    }
}
