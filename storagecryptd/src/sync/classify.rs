use std::time::Duration;

use storagecrypt_core::Reason;

use crate::backoff::Backoff;
use crate::error::SyncError;

/// What an engine does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Persistence is closed: stop the pass and touch nothing.
    Abort,
    /// Back to Planned without counting a failure.
    Canceled,
    /// The remote entry is gone.
    Vanished,
    /// Planned again after the delay.
    Retry(Duration),
    /// Failed until someone replans it.
    Fail,
}

/// Maps an error to a disposition. `failures` is the counter after this
/// attempt was recorded.
pub fn classify(err: &SyncError, failures: i64, max_failures: i64, backoff: &Backoff) -> Disposition {
    if err.is_connection_closed() {
        return Disposition::Abort;
    }
    let reason = err.reason();
    match reason {
        Reason::UserCanceled => Disposition::Canceled,
        Reason::NotFound => Disposition::Vanished,
        _ if reason.is_transient() && failures < max_failures => {
            let attempt = u32::try_from(failures.max(1) - 1).unwrap_or(u32::MAX);
            let delay = backoff.delay(attempt);
            Disposition::Retry(err.retry_after().map_or(delay, |after| after.max(delay)))
        }
        _ => Disposition::Fail,
    }
}

/// Whether the failure counts towards the document's failure counter.
pub fn counts_as_failure(disposition: Disposition) -> bool {
    matches!(disposition, Disposition::Retry(_) | Disposition::Fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexError;
    use storagecrypt_core::StorageError;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(10), false)
    }

    #[test]
    fn network_errors_retry_until_the_limit() {
        let err = SyncError::from(StorageError::new(Reason::Network, "reset"));
        assert_eq!(
            classify(&err, 1, 3, &backoff()),
            Disposition::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            classify(&err, 2, 3, &backoff()),
            Disposition::Retry(Duration::from_millis(200))
        );
        assert_eq!(classify(&err, 3, 3, &backoff()), Disposition::Fail);
    }

    #[test]
    fn retry_after_raises_the_delay() {
        let err = SyncError::from(
            StorageError::new(Reason::TooManyRequests, "slow down")
                .with_retry_after(Some(Duration::from_secs(5))),
        );
        assert_eq!(
            classify(&err, 1, 3, &backoff()),
            Disposition::Retry(Duration::from_secs(5))
        );
    }

    #[test]
    fn permanent_reasons_fail() {
        for reason in [
            Reason::Conflict,
            Reason::PreconditionFailed,
            Reason::AuthRevoked,
            Reason::AppKeysNotFound,
            Reason::AccessTokenIsNull,
        ] {
            let err = SyncError::from(StorageError::new(reason, "x"));
            assert_eq!(classify(&err, 1, 10, &backoff()), Disposition::Fail);
        }
    }

    #[test]
    fn cancellation_and_closure_are_not_failures() {
        let canceled = SyncError::from(StorageError::canceled());
        assert_eq!(classify(&canceled, 0, 3, &backoff()), Disposition::Canceled);
        assert!(!counts_as_failure(Disposition::Canceled));

        let closed = SyncError::from(IndexError::ConnectionClosed);
        assert_eq!(classify(&closed, 0, 3, &backoff()), Disposition::Abort);
    }
}
