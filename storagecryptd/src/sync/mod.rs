pub mod changes;
mod classify;
mod conflict;
pub mod documents;
pub mod events;
mod import;
pub mod queue;
pub mod report;

pub use changes::ChangesSyncEngine;
pub use documents::DocumentSyncEngine;
pub use events::{EventBus, SyncEvent};
pub use report::{Outcome, ReportEntry, SyncReport};
