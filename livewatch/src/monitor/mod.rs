//! Poll → diff → confirm pipeline.

pub mod confirm;
pub mod daemon;
pub mod diff;
pub mod service;

pub use confirm::{ApplyReport, ConfirmationPolicy, ObservationBatch, StatusConfirmer};
pub use daemon::{CheckerDaemon, DaemonHandle, PollOutcome, PollRequest, StatusResults};
pub use diff::{SiteDiff, StatusEvent, diff, selector_dropouts};
pub use service::{CycleOutcome, SitePollSettings, SitePoller, StatusMonitor};
