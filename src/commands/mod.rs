pub mod batch;
pub mod updater;

pub use batch::{BatchConfig, BatchProcessor, BatchReport, BatchSummary};
pub use updater::{RecordUpdater, SalesforceUpdater};
