use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use hifitime::prelude::Epoch;
use itertools::Itertools;
use log::debug;

use crate::error::Error;

/// Observation file extension
const EXTENSION: &str = ".rnx";

/// Observation file currently bound to a receiver
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveFile {
    pub receiver: String,
    pub path: PathBuf,
    pub discovered_at: Epoch,
}

/// Outcome of [FileWatcher::poll]
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A different file is now bound
    NewFile(ActiveFile),

    /// Bound file is still the latest one
    Unchanged,

    /// Nothing matches yet
    NotFound,
}

/// Tracks the latest `<receiver>_R_*.rnx` file in `<data_root>/<receiver>/`
#[derive(Debug)]
pub struct FileWatcher {
    receiver: String,
    directory: PathBuf,
    prefix: String,
    active: Option<ActiveFile>,
}

impl FileWatcher {
    pub fn new(data_root: &Path, receiver: &str) -> Self {
        Self {
            receiver: receiver.to_string(),
            directory: data_root.join(receiver),
            prefix: format!("{}_R_", receiver),
            active: None,
        }
    }

    /// Currently bound [ActiveFile]
    pub fn active(&self) -> Option<&ActiveFile> {
        self.active.as_ref()
    }

    /// Scans the receiver directory. When several files match,
    /// the lexicographically largest name wins, which is the most recent
    /// one for standard (V3) file names.
    pub fn poll(&mut self, now: Epoch) -> Result<WatchEvent, Error> {
        let Some(latest) = self.latest()? else {
            debug!(
                "no file matching {}/{}*{}",
                self.directory.display(),
                self.prefix,
                EXTENSION
            );
            return Ok(WatchEvent::NotFound);
        };

        if let Some(active) = &self.active {
            if active.path == latest {
                return Ok(WatchEvent::Unchanged);
            }
        }

        let active = ActiveFile {
            receiver: self.receiver.clone(),
            path: latest,
            discovered_at: now,
        };

        self.active = Some(active.clone());
        Ok(WatchEvent::NewFile(active))
    }

    fn latest(&self) -> Result<Option<PathBuf>, Error> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest = Option::<String>::None;

        for entry in entries {
            let entry = entry?;

            if !entry.file_type()?.is_file() {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if !name.starts_with(&self.prefix) || !name.ends_with(EXTENSION) {
                continue;
            }

            if latest.as_deref().is_none_or(|current| name > current) {
                latest = Some(name.to_string());
            }
        }

        Ok(latest.map(|name| self.directory.join(name)))
    }
}

/// Lists receivers (sub directories) available in `data_root`, sorted by name
pub fn discover_receivers(data_root: &Path) -> Result<Vec<String>, Error> {
    let mut receivers = Vec::new();

    for entry in fs::read_dir(data_root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                receivers.push(name.to_string());
            }
        }
    }

    Ok(receivers.into_iter().sorted().collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;

    fn t0() -> Epoch {
        Epoch::from_gregorian_utc_hms(2024, 1, 1, 0, 0, 0)
    }

    #[test]
    fn missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut watcher = FileWatcher::new(root.path(), "R1");
        assert_eq!(watcher.poll(t0()).unwrap(), WatchEvent::NotFound);
        assert!(watcher.active().is_none());
    }

    #[test]
    fn pattern_matching() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("R1");
        fs::create_dir(&dir).unwrap();

        File::create(dir.join("R1_R_20240101.crx")).unwrap();
        File::create(dir.join("R2_R_20240101.rnx")).unwrap();
        File::create(dir.join("R1_S_20240101.rnx")).unwrap();
        fs::create_dir(dir.join("R1_R_20991231.rnx")).unwrap();

        let mut watcher = FileWatcher::new(root.path(), "R1");
        assert_eq!(watcher.poll(t0()).unwrap(), WatchEvent::NotFound);
    }

    #[test]
    fn rotation() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("R1");
        fs::create_dir(&dir).unwrap();

        File::create(dir.join("R1_R_20240101.rnx")).unwrap();
        File::create(dir.join("R1_R_20231231.rnx")).unwrap();

        let mut watcher = FileWatcher::new(root.path(), "R1");

        match watcher.poll(t0()).unwrap() {
            WatchEvent::NewFile(active) => {
                assert_eq!(active.receiver, "R1");
                assert_eq!(active.path, dir.join("R1_R_20240101.rnx"));
                assert_eq!(active.discovered_at, t0());
            },
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(watcher.poll(t0()).unwrap(), WatchEvent::Unchanged);

        File::create(dir.join("R1_R_20240102.rnx")).unwrap();

        match watcher.poll(t0()).unwrap() {
            WatchEvent::NewFile(active) => {
                assert_eq!(active.path, dir.join("R1_R_20240102.rnx"));
            },
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            watcher.active().map(|active| active.path.clone()),
            Some(dir.join("R1_R_20240102.rnx"))
        );
    }

    #[test]
    fn receivers_discovery() {
        let root = tempfile::tempdir().unwrap();

        for name in ["ZWE2", "ARTU", "BRST"] {
            fs::create_dir(root.path().join(name)).unwrap();
        }

        File::create(root.path().join("2024-01-01.zip")).unwrap();

        assert_eq!(
            discover_receivers(root.path()).unwrap(),
            vec!["ARTU", "BRST", "ZWE2"]
        );
    }
}
