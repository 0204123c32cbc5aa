use std::path::Path;

use crate::{error::Error, record::MeasurementRecord};

mod obs;

pub use obs::RinexSource;

/// Forward only, finite sequence of [MeasurementRecord]s.
/// Dropping it releases all underlying resources.
pub type Records = Box<dyn Iterator<Item = Result<MeasurementRecord, Error>> + Send>;

/// Exposes the content of an observation file as [Records].
pub trait RecordSource: Send + Sync {
    /// Opens (or re-opens from the start) this file
    fn open(&self, path: &Path) -> Result<Records, Error>;
}
