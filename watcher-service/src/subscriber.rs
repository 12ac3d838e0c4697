//! Change listeners and the dispatcher that calls them.
//!
//! One dispatcher task per running service takes coalesced events off a queue
//! and calls every listener in registration order. Each call runs on the
//! blocking pool under a time limit. An error or panic stops at the call; a
//! call that overruns keeps running, still tracked, while delivery moves on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::event::ChangeEvent;

/// Callback invoked for every delivered change.
pub type Listener = dyn Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static;

/// Identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Counters shared between the service and the dispatcher.
#[derive(Debug, Default)]
pub(crate) struct DeliveryStats {
    delivered: AtomicU64,
    failures: AtomicU64,
}

impl DeliveryStats {
    fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Listener list in registration order.
#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: u64,
    listeners: Vec<(SubscriptionId, Arc<Listener>)>,
}

impl Subscribers {
    pub(crate) fn subscribe(list: &Arc<Mutex<Subscribers>>, listener: Arc<Listener>) -> Subscription {
        let id = list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
        debug!("Registered {id}");

        Subscription {
            id,
            list: Arc::downgrade(list),
        }
    }

    fn push(&mut self, listener: Arc<Listener>) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.listeners.push((id, listener));
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        before != self.listeners.len()
    }

    fn snapshot(&self) -> Vec<(SubscriptionId, Arc<Listener>)> {
        self.listeners.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}

/// Calls listeners for each queued event.
pub(crate) struct Dispatcher {
    list: Arc<Mutex<Subscribers>>,
    stats: Arc<DeliveryStats>,
    calls: TaskTracker,
    call_timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn new(
        list: Arc<Mutex<Subscribers>>,
        stats: Arc<DeliveryStats>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            list,
            stats,
            calls: TaskTracker::new(),
            call_timeout,
        }
    }

    /// Deliver queued events until cancelled or the queue closes.
    ///
    /// Returns the number of events left undelivered.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<ChangeEvent>,
        cancel: CancellationToken,
    ) -> usize {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = queue.recv() => match event {
                    Some(event) => event,
                    None => return 0,
                },
            };

            if !self.deliver(Arc::new(event), &cancel).await {
                break;
            }
        }

        let mut discarded = 0;
        while queue.try_recv().is_ok() {
            discarded += 1;
        }
        debug!("Dispatcher stopped with {discarded} events undelivered");
        discarded
    }

    /// Call every listener with `event`, in registration order.
    ///
    /// Returns false if cancelled partway.
    async fn deliver(&self, event: Arc<ChangeEvent>, cancel: &CancellationToken) -> bool {
        let listeners = self
            .list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot();
        self.stats.record_delivery();

        for (id, listener) in listeners {
            if cancel.is_cancelled() {
                return false;
            }

            let call_event = Arc::clone(&event);
            let call = self.calls.spawn_blocking(move || listener(&call_event));

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                outcome = tokio::time::timeout(self.call_timeout, call) => outcome,
            };

            match outcome {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    self.stats.record_failure();
                    warn!("{id} failed handling change to {}: {e:#}", event.path.display());
                }
                Ok(Err(e)) => {
                    self.stats.record_failure();
                    error!("{id} panicked handling change to {}: {e}", event.path.display());
                }
                Err(_) => {
                    self.stats.record_failure();
                    warn!(
                        "{id} still busy with {} after {:?}, moving on",
                        event.path.display(),
                        self.call_timeout
                    );
                }
            }
        }
        true
    }

    /// Wait for every listener call still running, overrun ones included.
    pub(crate) async fn wait_idle(&self) {
        self.calls.close();
        self.calls.wait().await;
        self.calls.reopen();
    }
}

/// Returned by [`crate::WatcherService::on_change`].
///
/// Dropping it leaves the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    list: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the listener. A call already running finishes.
    ///
    /// Returns false if the service is gone.
    pub fn unsubscribe(self) -> bool {
        let Some(list) = self.list.upgrade() else {
            return false;
        };
        let removed = list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.id);
        if removed {
            debug!("Unregistered {}", self.id);
        }
        removed
    }
}
