use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Listing,
    Changes,
    Upload,
    Download,
    Encrypt,
    Decrypt,
}

/// Observer polled by every paged remote call and every streaming copy.
///
/// Implementations must be cheap: `is_canceled` runs once per page or chunk.
#[async_trait]
pub trait ProgressListener: Send + Sync {
    fn on_set_max(&self, _phase: Phase, _max: u64) {}

    fn on_progress(&self, _phase: Phase, _progress: u64) {}

    /// Blocks while the owner has paused work.
    async fn pause_if_needed(&self) {}

    fn is_canceled(&self) -> bool {
        false
    }
}

pub type SharedListener = Arc<dyn ProgressListener>;

pub struct NoProgress;

impl ProgressListener for NoProgress {}

pub fn no_progress() -> SharedListener {
    Arc::new(NoProgress)
}

/// Poll point used at page and chunk boundaries.
pub async fn checkpoint(listener: &dyn ProgressListener) -> Result<(), StorageError> {
    listener.pause_if_needed().await;
    if listener.is_canceled() {
        return Err(StorageError::canceled());
    }
    Ok(())
}

/// Cancellation and pause switch handed down the call chain.
///
/// Children share the pause flag but can be canceled on their own, which is
/// how a single running action is aborted without stopping the whole pass.
#[derive(Clone)]
pub struct SyncControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for SyncControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            paused: Arc::clone(&self.paused),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn canceled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub async fn wait_while_paused(&self) {
        let mut rx = self.paused.subscribe();
        tokio::select! {
            _ = rx.wait_for(|paused| !*paused) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

#[async_trait]
impl ProgressListener for SyncControl {
    async fn pause_if_needed(&self) {
        self.wait_while_paused().await;
    }

    fn is_canceled(&self) -> bool {
        SyncControl::is_canceled(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Reason;
    use std::time::Duration;

    #[tokio::test]
    async fn checkpoint_fails_once_canceled() {
        let control = SyncControl::new();
        assert!(checkpoint(&control).await.is_ok());
        control.cancel();
        let err = checkpoint(&control).await.expect_err("expected cancel");
        assert_eq!(err.reason(), Reason::UserCanceled);
    }

    #[tokio::test]
    async fn child_cancel_does_not_touch_parent() {
        let parent = SyncControl::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_canceled());
        assert!(!parent.is_canceled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_canceled());
    }

    #[tokio::test]
    async fn pause_blocks_until_resumed() {
        let control = SyncControl::new();
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        control.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resume")
            .unwrap();
    }
}
