use std::time::Duration;

use log::{debug, error, info, trace, warn};

use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};

pub mod publisher;
pub mod watcher;

use crate::{
    bus::{Bus, BusEvent, topic},
    runtime::Runtime,
    settings::Settings,
    source::RecordSource,
};

pub use watcher::discover_receivers;

use publisher::{Step, StreamPublisher};
use watcher::{FileWatcher, WatchEvent};

/// Receiver daemon state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Streaming,
    IdlePolling,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Link {
    Connecting,
    Connected,
    Disconnected,
}

/// [ReceiverDaemon] streams the latest observation file
/// of one receiver, record per record, on `gnss/data/<receiver>`.
pub struct ReceiverDaemon<B: Bus, S: RecordSource> {
    /// Receiver name
    receiver: String,

    /// Publication topic
    topic: String,

    /// Owned [Bus] connection
    bus: B,

    /// Publication handle, on our own [Bus]
    publisher: B::Publisher,

    /// Observation decoder
    source: S,

    watcher: FileWatcher,

    /// Application clock
    runtime: Runtime,

    pacing: Duration,
    poll_interval: Duration,

    link: Link,

    /// Polling starts on first connection
    armed: bool,

    /// Ongoing stream
    stream: Option<StreamPublisher>,

    /// Next directory scan
    next_poll: Instant,
}

impl<B: Bus, S: RecordSource> std::fmt::Debug for ReceiverDaemon<B, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverDaemon")
            .field("receiver", &self.receiver)
            .field("state", &self.state())
            .field("active", &self.watcher.active())
            .finish()
    }
}

impl<B: Bus, S: RecordSource> ReceiverDaemon<B, S> {
    pub fn new(receiver: &str, settings: &Settings, bus: B, source: S, runtime: Runtime) -> Self {
        let publisher = bus.publisher();
        Self {
            receiver: receiver.to_string(),
            topic: topic(receiver),
            bus,
            publisher,
            source,
            watcher: FileWatcher::new(&settings.data_root, receiver),
            runtime,
            pacing: settings.pacing(),
            poll_interval: settings.poll_interval(),
            link: Link::Connecting,
            armed: false,
            stream: None,
            next_poll: Instant::now(),
        }
    }

    /// Current [State]
    pub fn state(&self) -> State {
        match (self.link, self.stream.is_some()) {
            (Link::Connecting, _) => State::Connecting,
            (Link::Disconnected, _) => State::Disconnected,
            (Link::Connected, true) => State::Streaming,
            (Link::Connected, false) => State::IdlePolling,
        }
    }

    fn deadline(&self) -> Instant {
        match &self.stream {
            Some(stream) => stream.deadline(),
            None => self.next_poll,
        }
    }

    /// Runs until shutdown is signaled, then closes the [Bus]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "{} - {} daemon deployed (topic \"{}\")",
            self.runtime.utc_seconds(),
            self.receiver,
            self.topic
        );

        let mut bus_closed = false;

        loop {
            let deadline = self.deadline();

            tokio::select! {
                _ = shutdown.changed() => break,
                event = self.bus.recv(), if !bus_closed => match event {
                    Some(event) => self.on_bus_event(event),
                    None => {
                        warn!(
                            "{} - {}: bus closed for good",
                            self.runtime.utc_seconds(),
                            self.receiver
                        );
                        bus_closed = true;
                        self.link = Link::Disconnected;
                    },
                },
                _ = sleep_until(deadline), if self.armed => self.step().await,
            }
        }

        self.bus.close().await;

        info!(
            "{} - {} daemon shutdown (uptime {})",
            self.runtime.utc_seconds(),
            self.receiver,
            self.runtime.uptime().round(hifitime::prelude::Duration::from_seconds(1.0)),
        );
    }

    fn on_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected => {
                info!(
                    "{} - {}: connected to broker",
                    self.runtime.utc_seconds(),
                    self.receiver
                );

                self.link = Link::Connected;

                if !self.armed {
                    self.armed = true;
                    self.next_poll = Instant::now();
                }
            },
            BusEvent::Disconnected(reason) => {
                warn!(
                    "{} - {}: disconnected from broker: {}",
                    self.runtime.utc_seconds(),
                    self.receiver,
                    reason
                );
                self.link = Link::Disconnected;
            },
            BusEvent::Message { topic, .. } => {
                trace!("{}: ignoring message on \"{}\"", self.receiver, topic);
            },
        }
    }

    /// Publishes the next record or scans the receiver directory
    async fn step(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            match stream.publish_next(&self.publisher).await {
                Step::Published | Step::Dropped => {},
                Step::Exhausted => {
                    info!(
                        "{} - {}: consumed all content ({} published, {} dropped)",
                        self.runtime.utc_seconds(),
                        self.receiver,
                        stream.published(),
                        stream.dropped(),
                    );
                    self.stream = None;
                    self.next_poll = Instant::now() + self.poll_interval;
                },
                Step::Failed(e) => {
                    error!(
                        "{} - {}: abandoning file: {}",
                        self.runtime.utc_seconds(),
                        self.receiver,
                        e
                    );
                    self.stream = None;
                    self.next_poll = Instant::now() + self.poll_interval;
                },
            }
            return;
        }

        self.next_poll = Instant::now() + self.poll_interval;

        match self.watcher.poll(self.runtime.utc_time()) {
            Ok(WatchEvent::NewFile(active)) => {
                info!(
                    "{} - {}: streaming {} (discovered {})",
                    self.runtime.utc_seconds(),
                    active.receiver,
                    active.path.display(),
                    active.discovered_at.round(hifitime::prelude::Duration::from_seconds(1.0)),
                );

                match self.source.open(&active.path) {
                    Ok(records) => {
                        self.stream = Some(StreamPublisher::new(&self.topic, records, self.pacing));
                    },
                    Err(e) => {
                        error!(
                            "{} - {}: {}",
                            self.runtime.utc_seconds(),
                            self.receiver,
                            e
                        );
                    },
                }
            },
            Ok(WatchEvent::Unchanged) => {
                debug!("{}: no new file", self.receiver);
            },
            Ok(WatchEvent::NotFound) => {
                info!(
                    "{} - {}: no matching file found",
                    self.runtime.utc_seconds(),
                    self.receiver
                );
            },
            Err(e) => {
                error!(
                    "{} - {}: directory scan failed: {}",
                    self.runtime.utc_seconds(),
                    self.receiver,
                    e
                );
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        fs,
        path::Path,
        sync::{Arc, Mutex},
    };

    use hifitime::prelude::{Duration as Span, Epoch};
    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        bus::{MemoryBroker, memory::MemoryBus},
        record::{MeasurementRecord, format_utc},
        source::test::LineSource,
        validator::{MessageValidator, Rejection, Verdict},
    };

    fn t0() -> Epoch {
        Epoch::from_gregorian_utc_hms(2024, 1, 1, 12, 0, 0)
    }

    fn settings(root: &Path, pacing_secs: f64) -> Settings {
        Settings {
            data_root: root.to_path_buf(),
            pacing_secs,
            poll_interval_secs: 60.0,
            ..Default::default()
        }
    }

    /// Writes `n` records, `spacing_s` apart, starting at `t`
    fn write_records(path: &Path, t: Epoch, n: usize, spacing_s: f64, prn_offset: u8) -> Vec<String> {
        let lines = (0..n)
            .map(|i| {
                format!(
                    "{} G{:02}: {:?} {:?}",
                    format_utc(t + Span::from_seconds(spacing_s * i as f64)),
                    i as u8 + 1 + prn_offset,
                    10.0 + i as f64,
                    -1.5 * i as f64
                )
            })
            .collect::<Vec<_>>();

        fs::write(path, lines.join("\n")).unwrap();
        lines
    }

    /// Collects every payload seen on `topic`
    fn spy(mut bus: MemoryBus, topic: &str) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let topic = topic.to_string();

        tokio::spawn({
            let seen = seen.clone();
            async move {
                while let Some(event) = bus.recv().await {
                    match event {
                        BusEvent::Connected => bus.subscribe(&topic).await.unwrap(),
                        BusEvent::Message { payload, .. } => seen.lock().unwrap().push(payload),
                        BusEvent::Disconnected(_) => {},
                    }
                }
            }
        });

        seen
    }

    #[tokio::test(start_paused = true)]
    async fn states() {
        let root = tempfile::tempdir().unwrap();
        let broker = MemoryBroker::new();

        let mut daemon = ReceiverDaemon::new(
            "R1",
            &settings(root.path(), 30.0),
            broker.connect(),
            LineSource,
            Runtime::deploy(t0()),
        );

        assert_eq!(daemon.state(), State::Connecting);

        daemon.on_bus_event(BusEvent::Connected);
        assert_eq!(daemon.state(), State::IdlePolling);

        daemon.on_bus_event(BusEvent::Disconnected("broker down".to_string()));
        assert_eq!(daemon.state(), State::Disconnected);

        daemon.on_bus_event(BusEvent::Connected);
        assert_eq!(daemon.state(), State::IdlePolling);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_then_idles() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("R1")).unwrap();

        let file = root.path().join("R1").join("R1_R_20240101.rnx");
        let lines = write_records(&file, t0(), 3, 10.0, 0);

        let broker = MemoryBroker::new();
        let seen = spy(broker.connect(), "gnss/data/R1");

        let mut daemon = ReceiverDaemon::new(
            "R1",
            &settings(root.path(), 30.0),
            broker.connect(),
            LineSource,
            Runtime::deploy(t0()),
        );

        daemon.on_bus_event(BusEvent::Connected);

        // scan + first record
        daemon.step().await;
        assert_eq!(daemon.state(), State::Streaming);

        let t = Instant::now();
        assert_eq!(daemon.deadline(), t);

        daemon.step().await;
        assert_eq!(daemon.deadline(), t + Duration::from_secs(30));

        daemon.step().await;
        daemon.step().await;
        assert_eq!(daemon.state(), State::Streaming);

        // end of file
        daemon.step().await;
        assert_eq!(daemon.state(), State::IdlePolling);
        assert_eq!(daemon.deadline(), Instant::now() + Duration::from_secs(60));

        // same file: nothing to do
        daemon.step().await;
        assert_eq!(daemon.state(), State::IdlePolling);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(*seen.lock().unwrap(), lines);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_waits_for_completion() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("R1");
        fs::create_dir(&dir).unwrap();

        let first = write_records(&dir.join("R1_R_20240101.rnx"), t0(), 2, 10.0, 0);

        let broker = MemoryBroker::new();
        let seen = spy(broker.connect(), "gnss/data/R1");

        let daemon = ReceiverDaemon::new(
            "R1",
            &settings(root.path(), 10.0),
            broker.connect(),
            LineSource,
            Runtime::deploy(t0()),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(daemon.run(shutdown_rx));

        // newer file shows up while the first one is being streamed
        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = write_records(&dir.join("R1_R_20240102.rnx"), t0(), 2, 10.0, 10);

        // first file: 0s, 10s, exhausted at 20s; next scan at 80s
        tokio::time::sleep(Duration::from_secs(70)).await;
        assert_eq!(*seen.lock().unwrap(), first);

        tokio::time::sleep(Duration::from_secs(20)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let expected = first.into_iter().chain(second).collect::<Vec<_>>();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_file_is_abandoned() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("R1");
        fs::create_dir(&dir).unwrap();

        fs::write(dir.join("R1_R_20240101.rnx"), "garbage\n").unwrap();

        let broker = MemoryBroker::new();

        let mut daemon = ReceiverDaemon::new(
            "R1",
            &settings(root.path(), 10.0),
            broker.connect(),
            LineSource,
            Runtime::deploy(t0()),
        );

        daemon.on_bus_event(BusEvent::Connected);

        daemon.step().await;
        assert_eq!(daemon.state(), State::Streaming);

        daemon.step().await;
        assert_eq!(daemon.state(), State::IdlePolling);

        // not retried
        daemon.step().await;
        assert_eq!(daemon.state(), State::IdlePolling);
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_does_not_halt_streaming() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("R1");
        fs::create_dir(&dir).unwrap();

        let lines = write_records(&dir.join("R1_R_20240101.rnx"), t0(), 4, 10.0, 0);

        let broker = MemoryBroker::new();
        let seen = spy(broker.connect(), "gnss/data/R1");

        let daemon = ReceiverDaemon::new(
            "R1",
            &settings(root.path(), 10.0),
            broker.connect(),
            LineSource,
            Runtime::deploy(t0()),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(daemon.run(shutdown_rx));

        // publications at 0s, 10s, 20s, 30s: lose the link over [5s; 15s]
        tokio::time::sleep(Duration::from_secs(5)).await;
        broker.disconnect_all("maintenance");

        tokio::time::sleep(Duration::from_secs(10)).await;
        broker.reconnect_all();

        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![lines[0].clone(), lines[2].clone(), lines[3].clone()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_pacing() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("R1");
        fs::create_dir(&dir).unwrap();

        let lines = write_records(&dir.join("R1_R_20240101.rnx"), t0(), 10, 30.0, 0);

        let broker = MemoryBroker::new();
        let seen = spy(broker.connect(), "gnss/data/R1");

        let daemon = ReceiverDaemon::new(
            "R1",
            &settings(root.path(), 30.0),
            broker.connect(),
            LineSource,
            Runtime::deploy(t0()),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(daemon.run(shutdown_rx));

        // publications at 0s and 30s, next one due at 60s
        tokio::time::sleep(Duration::from_secs(45)).await;

        let t = Instant::now();
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(Instant::now(), t);
        assert_eq!(*seen.lock().unwrap(), lines[..2].to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_freshness() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("R1");
        fs::create_dir(&dir).unwrap();

        // 3 records, 10s apart, streamed in real time
        let lines = write_records(&dir.join("R1_R_20240101.rnx"), t0(), 3, 10.0, 0);

        let runtime = Runtime::deploy(t0());
        let broker = MemoryBroker::new();
        let settings = settings(root.path(), 10.0);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (gate_tx, gate_rx) = oneshot::channel();

        let validator = MessageValidator::new(settings.freshness_window());
        let validator = tokio::spawn(validator.run(
            broker.connect(),
            "gnss/data/R1".to_string(),
            runtime,
            Some(gate_tx),
            shutdown_rx.clone(),
        ));

        gate_rx.await.unwrap();

        let daemon = ReceiverDaemon::new("R1", &settings, broker.connect(), LineSource, runtime);
        let daemon = tokio::spawn(daemon.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(45)).await;
        shutdown_tx.send(true).unwrap();

        daemon.await.unwrap();
        let (mut validator, stats) = validator.await.unwrap();

        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stats.stale, 0);

        // replays are rejected
        for line in lines.iter() {
            let record = line.parse::<MeasurementRecord>().unwrap();
            assert_eq!(
                validator.on_message(line, record.epoch),
                Verdict::Rejected(Rejection::Duplicate)
            );
        }
    }
}
