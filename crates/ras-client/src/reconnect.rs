//! Reconnection controller
//!
//! Turns address-change notifications into reconnection attempts. A single
//! worker handles them one at a time, in arrival order. Every queued item
//! carries the generation it was submitted under; `stop()` bumps the
//! generation and cancels whatever is in flight, and outcomes are only
//! applied while holding the same lock and only for the current generation.
//! Once `stop()` returns the reconnector is not invoked again and no
//! observer hears about anything submitted before it.
//!
//! Transport errors coalesce: while one is queued or being retried
//! (backoff included) further errors are dropped.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ras_core::config::BackoffConfig;
use ras_protocol::IpChangeNotification;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;

/// Re-establishes the channel at a new daemon address
#[async_trait]
pub trait Reconnector: Send + Sync {
    /// `Ok(true)` on success; `Ok(false)` and `Err(_)` both count as a failure
    async fn reconnect(&self, ip: IpAddr, port: u16) -> anyhow::Result<bool>;
}

/// What observers are told
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// Channel re-established at `addr`
    Reconnected { addr: SocketAddr },
    /// An attempt at `addr` failed
    AttemptFailed {
        addr: SocketAddr,
        consecutive_failures: u32,
    },
}

/// Counters since the controller was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectStats {
    /// Attempts whose outcome was applied
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Times the backoff was reset by a success
    pub resets: u32,
}

struct Gate {
    running: bool,
    generation: u64,
    cancel: CancellationToken,
    stats: ReconnectStats,
    backoff: ExponentialBackoff,
    transport_pending: bool,
}

struct Shared {
    gate: Mutex<Gate>,
    disconnecting: AtomicBool,
    events: broadcast::Sender<ReconnectEvent>,
}

impl Shared {
    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Queued {
    generation: u64,
    addr: SocketAddr,
    transport_error: bool,
}

/// Serializes reconnection attempts and gates them on start/stop
pub struct ReconnectController {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Queued>,
    worker: JoinHandle<()>,
}

impl ReconnectController {
    /// Spawn the worker; the controller starts running
    pub fn spawn(reconnector: Arc<dyn Reconnector>, backoff: &BackoffConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            gate: Mutex::new(Gate {
                running: true,
                generation: 0,
                cancel: CancellationToken::new(),
                stats: ReconnectStats::default(),
                backoff: ExponentialBackoff::from_config(backoff),
                transport_pending: false,
            }),
            disconnecting: AtomicBool::new(false),
            events,
        });

        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(shared.clone(), reconnector, rx));

        Self {
            shared,
            queue,
            worker,
        }
    }

    /// Observe reconnection outcomes
    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.shared.events.subscribe()
    }

    /// Counters of applied attempts
    pub fn stats(&self) -> ReconnectStats {
        self.shared.gate().stats
    }

    /// Whether new requests are accepted
    pub fn is_running(&self) -> bool {
        self.shared.gate().running
    }

    /// Whether a user disconnect is in progress or done
    pub fn is_disconnect_requested(&self) -> bool {
        self.shared.disconnecting.load(Ordering::SeqCst)
    }

    /// Queue a reconnection for an address-change notification.
    ///
    /// Returns `false` when the controller is stopped and the notification
    /// was discarded.
    pub fn submit(&self, notification: &IpChangeNotification) -> bool {
        self.enqueue(notification.socket_addr(), false)
    }

    fn enqueue(&self, addr: SocketAddr, transport_error: bool) -> bool {
        let mut gate = self.shared.gate();
        if !gate.running {
            debug!("Reconnection to {} discarded: controller stopped", addr);
            return false;
        }
        if transport_error {
            if gate.transport_pending {
                debug!("Transport error coalesced with the pending reconnection");
                return false;
            }
            gate.transport_pending = true;
        }
        self.queue
            .send(Queued {
                generation: gate.generation,
                addr,
                transport_error,
            })
            .is_ok()
    }

    /// A transport error on the live channel.
    ///
    /// Ignored while a user disconnect is in progress, and while an earlier
    /// transport error is still queued or being retried.
    pub fn on_transport_error(&self, addr: SocketAddr) -> bool {
        if self.is_disconnect_requested() {
            debug!("Transport error during user disconnect ignored");
            return false;
        }
        self.enqueue(addr, true)
    }

    /// Stop processing. Queued and in-flight attempts are discarded.
    pub fn stop(&self) {
        let mut gate = self.shared.gate();
        if gate.running {
            info!("Reconnection stopped");
        }
        gate.running = false;
        gate.transport_pending = false;
        gate.generation += 1;
        gate.cancel.cancel();
        gate.cancel = CancellationToken::new();
    }

    /// Resume processing and clear a previous disconnect request
    pub fn start(&self) {
        let mut gate = self.shared.gate();
        self.shared.disconnecting.store(false, Ordering::SeqCst);
        if !gate.running {
            info!("Reconnection started");
        }
        gate.running = true;
    }

    /// User-initiated disconnect.
    ///
    /// The disconnect flag is raised and the controller stopped before
    /// `teardown` runs, so errors caused by the teardown are not mistaken
    /// for network failures.
    pub async fn request_disconnect<F, Fut>(&self, teardown: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.shared.disconnecting.store(true, Ordering::SeqCst);
        self.stop();
        teardown().await
    }
}

impl Drop for ReconnectController {
    fn drop(&mut self) {
        self.stop();
        self.worker.abort();
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    reconnector: Arc<dyn Reconnector>,
    mut rx: mpsc::UnboundedReceiver<Queued>,
) {
    while let Some(item) = rx.recv().await {
        attempt(&shared, reconnector.as_ref(), &item).await;

        if item.transport_error {
            let mut gate = shared.gate();
            if gate.generation == item.generation {
                gate.transport_pending = false;
            }
        }
    }
}

async fn attempt(shared: &Shared, reconnector: &dyn Reconnector, item: &Queued) {
    let cancel = {
        let gate = shared.gate();
        if !gate.running || gate.generation != item.generation {
            return;
        }
        gate.cancel.clone()
    };

    debug!("Reconnecting to {}", item.addr);
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = reconnector.reconnect(item.addr.ip(), item.addr.port()) => result,
    };

    let succeeded = match result {
        Ok(succeeded) => succeeded,
        Err(e) => {
            warn!("Reconnect to {} errored: {:#}", item.addr, e);
            false
        }
    };

    let delay = {
        let mut gate = shared.gate();
        if !gate.running || gate.generation != item.generation {
            return;
        }

        gate.stats.attempts += 1;
        if succeeded {
            gate.stats.successes += 1;
            gate.stats.consecutive_failures = 0;
            gate.stats.resets += 1;
            gate.backoff.reset();
            info!("Reconnected to {}", item.addr);
            let _ = shared
                .events
                .send(ReconnectEvent::Reconnected { addr: item.addr });
            return;
        }

        gate.stats.failures += 1;
        gate.stats.consecutive_failures += 1;
        let delay = gate.backoff.next_delay();
        warn!(
            "Reconnect to {} failed ({} in a row), next attempt in {:?}",
            item.addr, gate.stats.consecutive_failures, delay
        );
        let _ = shared.events.send(ReconnectEvent::AttemptFailed {
            addr: item.addr,
            consecutive_failures: gate.stats.consecutive_failures,
        });
        delay
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}
