pub mod accounts;
pub mod backoff;
pub mod config;
pub mod crypto;
pub mod error;
pub mod index;
pub mod logging;
pub mod model;
pub mod paths;
pub mod service;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use error::SyncError;
pub use service::StorageCryptService;
