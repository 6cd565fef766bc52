//! Dynamic host sets and snapshot delivery to registered watchers.
//!
//! A [`HostSetDispatcher`] holds the latest snapshot of a host set and the
//! watchers registered against it. Every published snapshot is offered to
//! each watcher in registration order, skipping watchers that already saw
//! an equal snapshot. Callbacks run one at a time under a per-callback
//! budget so a slow watcher delays, but never stalls, delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::snapshot::HostSnapshot;

/// Receives the host set every time it changes.
#[async_trait]
pub trait HostChangeMonitor<T: Send + Sync + 'static>: Send + Sync + 'static {
    /// The complete set of live hosts. Never a diff.
    async fn on_change(&self, hosts: HostSnapshot<T>);

    /// Membership can no longer be observed; the last snapshot may be
    /// stale. A later `on_change` supersedes this.
    async fn on_indeterminate(&self) {}
}

/// A set of hosts that can be watched for changes.
#[async_trait]
pub trait DynamicHostSet<T: Send + Sync + 'static>: Send + Sync {
    /// Register `monitor` and deliver the current host set to it before
    /// returning. The monitor keeps receiving changes until the returned
    /// handle is dropped or unregistered.
    async fn monitor(&self, monitor: Arc<dyn HostChangeMonitor<T>>) -> MonitorHandle;
}

/// What a [`ChannelMonitor`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostUpdate<T: Ord> {
    Changed(HostSnapshot<T>),
    Indeterminate,
}

/// Forwards every notification into an unbounded channel.
pub struct ChannelMonitor<T: Ord> {
    tx: mpsc::UnboundedSender<HostUpdate<T>>,
}

impl<T: Ord> ChannelMonitor<T> {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HostUpdate<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl<T: Ord + Send + Sync + 'static> HostChangeMonitor<T> for ChannelMonitor<T> {
    async fn on_change(&self, hosts: HostSnapshot<T>) {
        let _ = self.tx.send(HostUpdate::Changed(hosts));
    }

    async fn on_indeterminate(&self) {
        let _ = self.tx.send(HostUpdate::Indeterminate);
    }
}

/// Calls a synchronous closure with every snapshot. Indeterminate
/// notifications are ignored.
pub struct FnMonitor<F> {
    f: F,
}

impl<F> FnMonitor<F> {
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<T, F> HostChangeMonitor<T> for FnMonitor<F>
where
    T: Send + Sync + 'static,
    F: Fn(HostSnapshot<T>) + Send + Sync + 'static,
{
    async fn on_change(&self, hosts: HostSnapshot<T>) {
        (self.f)(hosts)
    }
}

/// Registration of a monitor. Dropping it unregisters the monitor; it
/// receives nothing after the next delivery round starts.
#[derive(Debug)]
pub struct MonitorHandle {
    token: CancellationToken,
}

impl MonitorHandle {
    pub fn unregister(self) {
        drop(self);
    }

    pub fn is_registered(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// The host set as last published.
enum Published<T> {
    /// No listing has completed yet.
    Pending,
    Live(HostSnapshot<T>),
    Indeterminate,
}

impl<T> Clone for Published<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending => Self::Pending,
            Self::Live(snapshot) => Self::Live(snapshot.clone()),
            Self::Indeterminate => Self::Indeterminate,
        }
    }
}

struct Watcher<T: Send + Sync + 'static> {
    monitor: Arc<dyn HostChangeMonitor<T>>,
    token: CancellationToken,
    /// The last snapshot this watcher was given; `None` after an
    /// indeterminate notification.
    last: Option<HostSnapshot<T>>,
}

/// Delivery timing.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// How long `monitor` waits for the first listing before delivering
    /// an empty snapshot.
    pub initial_listing_timeout: Duration,
    /// Budget for a single watcher callback.
    pub callback_timeout: Duration,
}

/// Holds the current snapshot and fans it out to watchers.
pub struct HostSetDispatcher<T: Send + Sync + 'static> {
    name: String,
    config: DispatchConfig,
    /// Exclusive section for delivery and registration.
    watchers: Mutex<Vec<Watcher<T>>>,
    published: watch::Sender<Published<T>>,
}

impl<T> HostSetDispatcher<T>
where
    T: Ord + Send + Sync + 'static,
{
    /// `name` identifies the host set in logs.
    pub fn new(name: impl Into<String>, config: DispatchConfig) -> Self {
        let (published, _) = watch::channel(Published::Pending);
        Self {
            name: name.into(),
            config,
            watchers: Mutex::new(Vec::new()),
            published,
        }
    }

    /// The latest published snapshot, if any listing has completed and
    /// membership is not indeterminate.
    pub fn current(&self) -> Option<HostSnapshot<T>> {
        match &*self.published.borrow() {
            Published::Live(snapshot) => Some(snapshot.clone()),
            Published::Pending | Published::Indeterminate => None,
        }
    }

    /// Number of registered watchers, including ones unregistered since
    /// the last delivery round.
    pub async fn watcher_count(&self) -> usize {
        self.watchers.lock().await.len()
    }

    /// Publish a new snapshot and deliver it to every watcher that has not
    /// seen an equal one.
    pub async fn publish(&self, snapshot: HostSnapshot<T>) {
        let mut watchers = self.watchers.lock().await;
        self.published.send_replace(Published::Live(snapshot.clone()));
        watchers.retain(|w| !w.token.is_cancelled());

        let mut delivered = 0usize;
        for watcher in watchers.iter_mut() {
            if watcher.token.is_cancelled() || watcher.last.as_ref() == Some(&snapshot) {
                continue;
            }
            self.deliver(watcher, &snapshot).await;
            delivered += 1;
        }
        debug!(host_set = %self.name, hosts = snapshot.len(), watchers = delivered, "host set published");
    }

    /// Tell every watcher membership is indeterminate.
    pub async fn publish_indeterminate(&self) {
        let mut watchers = self.watchers.lock().await;
        self.published.send_replace(Published::Indeterminate);
        watchers.retain(|w| !w.token.is_cancelled());

        for watcher in watchers.iter_mut() {
            if watcher.token.is_cancelled() {
                continue;
            }
            self.notify_indeterminate(watcher).await;
        }
        warn!(host_set = %self.name, watchers = watchers.len(), "host set membership is indeterminate");
    }

    /// Register a watcher; see [`DynamicHostSet::monitor`].
    pub async fn register(&self, monitor: Arc<dyn HostChangeMonitor<T>>) -> MonitorHandle {
        let mut published = self.published.subscribe();
        let first_listing = async {
            published
                .wait_for(|p| !matches!(p, Published::Pending))
                .await
                .is_ok()
        };
        if tokio::time::timeout(self.config.initial_listing_timeout, first_listing)
            .await
            .is_err()
        {
            warn!(host_set = %self.name, timeout = ?self.config.initial_listing_timeout,
                "no listing before the initial timeout; delivering an empty host set");
        }

        let mut watchers = self.watchers.lock().await;
        let token = CancellationToken::new();
        let mut watcher = Watcher {
            monitor,
            token: token.clone(),
            last: None,
        };

        let current = self.published.borrow().clone();
        match current {
            Published::Live(snapshot) => self.deliver(&mut watcher, &snapshot).await,
            Published::Pending => self.deliver(&mut watcher, &HostSnapshot::empty()).await,
            Published::Indeterminate => self.notify_indeterminate(&mut watcher).await,
        }

        watchers.retain(|w| !w.token.is_cancelled());
        watchers.push(watcher);
        debug!(host_set = %self.name, watchers = watchers.len(), "watcher registered");
        MonitorHandle { token }
    }

    async fn deliver(&self, watcher: &mut Watcher<T>, snapshot: &HostSnapshot<T>) {
        let budget = self.config.callback_timeout;
        if tokio::time::timeout(budget, watcher.monitor.on_change(snapshot.clone()))
            .await
            .is_err()
        {
            warn!(host_set = %self.name, ?budget, "watcher callback exceeded its budget; abandoned");
        }
        watcher.last = Some(snapshot.clone());
    }

    async fn notify_indeterminate(&self, watcher: &mut Watcher<T>) {
        let budget = self.config.callback_timeout;
        if tokio::time::timeout(budget, watcher.monitor.on_indeterminate())
            .await
            .is_err()
        {
            warn!(host_set = %self.name, ?budget, "watcher callback exceeded its budget; abandoned");
        }
        watcher.last = None;
    }
}

#[async_trait]
impl<T> DynamicHostSet<T> for HostSetDispatcher<T>
where
    T: Ord + Send + Sync + 'static,
{
    async fn monitor(&self, monitor: Arc<dyn HostChangeMonitor<T>>) -> MonitorHandle {
        self.register(monitor).await
    }
}
