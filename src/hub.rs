//! Distribution hub between the producer thread and connected clients.
//!
//! The hub keeps exactly one latest frame and one latest snapshot, each an
//! immutable `Arc` swapped in per cycle through a `watch` channel. Image
//! stream clients read the frame slot whenever they are ready for another
//! chunk, so slow readers skip frames instead of queueing them. Push clients
//! receive every cycle's serialized snapshot over a small `broadcast`
//! channel and are dropped once they fall behind its capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ClientDisconnect;
use crate::snapshot::Snapshot;

/// One encoded, fully rendered frame.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub jpeg: Bytes,
    pub sequence: u64,
    pub frame_number: u64,
    pub loop_number: u64,
    pub captured_at: DateTime<Utc>,
}

/// A snapshot together with its wire form, serialized once per cycle.
#[derive(Debug)]
pub struct PublishedSnapshot {
    pub snapshot: Snapshot,
    pub json: Arc<str>,
}

pub type FrameSlot = Option<Arc<FramePacket>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Image,
    Push,
}

impl ClientKind {
    fn as_str(self) -> &'static str {
        match self {
            ClientKind::Image => "image",
            ClientKind::Push => "push",
        }
    }
}

/// Client connection counters.
#[derive(Debug, Default)]
pub struct HubStats {
    image_clients: AtomicU64,
    image_clients_total: AtomicU64,
    push_clients: AtomicU64,
    push_clients_total: AtomicU64,
    push_dropped_lagged: AtomicU64,
    push_dropped_stalled: AtomicU64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct HubStatsSnapshot {
    pub image_clients: u64,
    pub image_clients_total: u64,
    pub push_clients: u64,
    pub push_clients_total: u64,
    pub push_dropped_lagged: u64,
    pub push_dropped_stalled: u64,
}

impl HubStats {
    fn current(&self, kind: ClientKind) -> &AtomicU64 {
        match kind {
            ClientKind::Image => &self.image_clients,
            ClientKind::Push => &self.push_clients,
        }
    }

    fn total(&self, kind: ClientKind) -> &AtomicU64 {
        match kind {
            ClientKind::Image => &self.image_clients_total,
            ClientKind::Push => &self.push_clients_total,
        }
    }

    pub fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            image_clients: self.image_clients.load(Ordering::Relaxed),
            image_clients_total: self.image_clients_total.load(Ordering::Relaxed),
            push_clients: self.push_clients.load(Ordering::Relaxed),
            push_clients_total: self.push_clients_total.load(Ordering::Relaxed),
            push_dropped_lagged: self.push_dropped_lagged.load(Ordering::Relaxed),
            push_dropped_stalled: self.push_dropped_stalled.load(Ordering::Relaxed),
        }
    }
}

/// Registered for as long as a client is connected.
pub struct ClientGuard {
    inner: Arc<Inner>,
    kind: ClientKind,
    id: u64,
}

impl ClientGuard {
    fn register(inner: Arc<Inner>, kind: ClientKind) -> Self {
        let stats = &inner.stats;
        let now = stats.current(kind).fetch_add(1, Ordering::Relaxed) + 1;
        let id = stats.total(kind).fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("traffic_clients", "kind" => kind.as_str()).set(now as f64);
        metrics::counter!("traffic_client_connections_total", "kind" => kind.as_str())
            .increment(1);
        info!(kind = kind.as_str(), client = id, connected = now, "Client connected");
        Self { inner, kind, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let now = self
            .inner
            .stats
            .current(self.kind)
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        metrics::gauge!("traffic_clients", "kind" => self.kind.as_str()).set(now as f64);
        info!(
            kind = self.kind.as_str(),
            client = self.id,
            connected = now,
            "Client disconnected"
        );
    }
}

/// A push client's view of the snapshot stream.
pub struct PushSubscription {
    first: Option<Arc<str>>,
    rx: broadcast::Receiver<Arc<str>>,
    guard: ClientGuard,
}

impl PushSubscription {
    /// Next message for this client: the snapshot current at connect time
    /// first, then one per published cycle.
    pub async fn next(&mut self) -> Result<Arc<str>, ClientDisconnect> {
        if let Some(first) = self.first.take() {
            return Ok(first);
        }
        match self.rx.recv().await {
            Ok(json) => Ok(json),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Err(ClientDisconnect::Lagged { missed })
            }
            Err(broadcast::error::RecvError::Closed) => Err(ClientDisconnect::Closed),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.guard.id()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HubOptions {
    /// Messages a push client may fall behind before it is dropped.
    pub push_backlog: usize,
    /// Producer cycle period; bounds a push client's socket write.
    pub cycle_period: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            push_backlog: 1,
            cycle_period: Duration::from_secs(1) / 30,
        }
    }
}

struct Inner {
    frame_tx: watch::Sender<FrameSlot>,
    snapshot_tx: watch::Sender<Option<Arc<PublishedSnapshot>>>,
    push_tx: broadcast::Sender<Arc<str>>,
    options: HubOptions,
    shutdown: CancellationToken,
    stats: HubStats,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    pub fn new(options: HubOptions) -> Self {
        let (frame_tx, _) = watch::channel(None);
        let (snapshot_tx, _) = watch::channel(None);
        let (push_tx, _) = broadcast::channel(options.push_backlog.max(1));
        Self {
            inner: Arc::new(Inner {
                frame_tx,
                snapshot_tx,
                push_tx,
                options,
                shutdown: CancellationToken::new(),
                stats: HubStats::default(),
            }),
        }
    }

    /// Swaps in a cycle's frame and snapshot and fans the snapshot out to
    /// push clients. Never blocks on clients.
    pub fn publish(&self, frame: FramePacket, snapshot: Snapshot) -> Result<(), serde_json::Error> {
        let json: Arc<str> = snapshot.to_json()?.into();
        let sequence = frame.sequence;

        self.inner.frame_tx.send_replace(Some(Arc::new(frame)));
        self.inner.snapshot_tx.send_replace(Some(Arc::new(PublishedSnapshot {
            snapshot,
            json: json.clone(),
        })));
        // No subscribers is not an error.
        let receivers = self.inner.push_tx.send(json).unwrap_or(0);

        debug!(sequence, receivers, "Cycle published");
        Ok(())
    }

    pub fn latest_frame(&self) -> FrameSlot {
        self.inner.frame_tx.borrow().clone()
    }

    pub fn latest_snapshot(&self) -> Option<Arc<PublishedSnapshot>> {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Receiver over the latest-frame slot, for image stream clients.
    pub fn frames(&self) -> watch::Receiver<FrameSlot> {
        self.inner.frame_tx.subscribe()
    }

    pub fn image_client(&self) -> ClientGuard {
        ClientGuard::register(self.inner.clone(), ClientKind::Image)
    }

    pub fn push_subscribe(&self) -> PushSubscription {
        let rx = self.inner.push_tx.subscribe();
        let first = self.latest_snapshot().map(|p| p.json.clone());
        PushSubscription {
            first,
            rx,
            guard: ClientGuard::register(self.inner.clone(), ClientKind::Push),
        }
    }

    /// Counts a push client dropped by the hub's delivery policy.
    pub fn record_drop(&self, reason: &ClientDisconnect) {
        let stats = &self.inner.stats;
        match reason {
            ClientDisconnect::Lagged { .. } => {
                stats.push_dropped_lagged.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("traffic_push_dropped_total", "reason" => "lagged").increment(1);
            }
            ClientDisconnect::Stalled => {
                stats.push_dropped_stalled.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("traffic_push_dropped_total", "reason" => "stalled").increment(1);
            }
            ClientDisconnect::Closed => {}
        }
    }

    /// Deadline for a single push write.
    pub fn write_deadline(&self) -> Duration {
        self.inner.options.cycle_period
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Hub shutting down");
            self.inner.shutdown.cancel();
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
