pub mod disk;
pub mod drive;
pub mod swift;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub use disk::DiskStorage;
pub use drive::DriveStorage;
pub use swift::{SwiftConfig, SwiftStorage};

/// Folder created inside each account to hold managed files.
pub const APP_FOLDER_NAME: &str = "StorageCrypt";

pub(crate) const DEFAULT_PAGE_SIZE: u32 = 200;

pub(crate) fn rfc3339_millis(value: &str) -> Option<i64> {
    let at = OffsetDateTime::parse(value, &Rfc3339).ok()?;
    Some((at.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// Joins a parent id and a child name for path-addressed providers.
pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') || parent.ends_with(':') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}
