use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storagecrypt_core::SyncControl;
use tokio::sync::{Notify, watch};

struct Inner<T> {
    pending: VecDeque<T>,
    queued: HashSet<T>,
    in_flight: HashSet<T>,
    delayed: usize,
}

impl<T> Inner<T> {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.delayed == 0
    }
}

/// De-duplicating work queue drained by a pool of workers.
///
/// An item is handed to at most one worker at a time; re-enqueuing an item
/// that is in flight schedules one more pass after the current one ends.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    idle: watch::Sender<bool>,
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                queued: HashSet::new(),
                in_flight: HashSet::new(),
                delayed: 0,
            }),
            notify: Notify::new(),
            idle,
        }
    }

    /// Returns `false` when the item was already waiting.
    pub fn enqueue(&self, item: T) -> bool {
        let added = {
            let mut inner = self.lock();
            if inner.queued.insert(item.clone()) {
                inner.pending.push_back(item);
                true
            } else {
                false
            }
        };
        if added {
            self.idle.send_replace(false);
            self.notify.notify_waiters();
        }
        added
    }

    pub fn enqueue_all<I: IntoIterator<Item = T>>(&self, items: I) -> usize {
        items.into_iter().filter(|item| self.enqueue(item.clone())).count()
    }

    /// Enqueues after `delay` unless `control` is canceled first. The queue
    /// does not report idle while the timer is pending.
    pub fn enqueue_after(self: &Arc<Self>, item: T, delay: Duration, control: &SyncControl) {
        self.lock().delayed += 1;
        self.idle.send_replace(false);
        let queue = Arc::clone(self);
        let control = control.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.release_delayed(Some(item)),
                _ = control.canceled() => queue.release_delayed(None),
            }
        });
    }

    fn release_delayed(&self, item: Option<T>) {
        let idle = {
            let mut inner = self.lock();
            inner.delayed = inner.delayed.saturating_sub(1);
            if let Some(item) = item
                && inner.queued.insert(item.clone())
            {
                inner.pending.push_back(item);
            }
            inner.is_idle()
        };
        self.idle.send_replace(idle);
        self.notify.notify_waiters();
    }

    /// Drops everything waiting; in-flight items are left alone.
    pub fn clear(&self) -> usize {
        let (dropped, idle) = {
            let mut inner = self.lock();
            let dropped = inner.pending.len();
            inner.pending.clear();
            inner.queued.clear();
            (dropped, inner.is_idle())
        };
        if idle {
            self.idle.send_replace(true);
        }
        dropped
    }

    /// Waits for the next item that is not already being worked on.
    /// Returns `None` once `control` is canceled.
    pub async fn next(&self, control: &SyncControl) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if control.is_canceled() {
                return None;
            }
            if let Some(item) = self.try_take() {
                return Some(item);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = control.canceled() => return None,
            }
        }
    }

    fn try_take(&self) -> Option<T> {
        let mut inner = self.lock();
        let position = inner
            .pending
            .iter()
            .position(|item| !inner.in_flight.contains(item))?;
        let item = inner.pending.remove(position)?;
        inner.queued.remove(&item);
        inner.in_flight.insert(item.clone());
        Some(item)
    }

    /// Marks `item` as no longer in flight.
    pub fn finish(&self, item: &T) {
        let idle = {
            let mut inner = self.lock();
            inner.in_flight.remove(item);
            inner.is_idle()
        };
        if idle {
            self.idle.send_replace(true);
        }
        self.notify.notify_waiters();
    }

    pub fn is_queued(&self, item: &T) -> bool {
        self.lock().queued.contains(item)
    }

    pub fn is_in_flight(&self, item: &T) -> bool {
        self.lock().in_flight.contains(item)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Resolves once nothing is pending, delayed or in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
