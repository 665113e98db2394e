// =============================================================================
// Shared state hub — snapshot exchange between producers and the decision loop
// =============================================================================
//
// One market-data producer and one account producer overwrite their snapshot
// under the hub mutex and signal the decision consumer. The consumer always
// reads a consistent pair, never a torn one. Freshness and last-order clocks
// are monotonic (`Instant`). The hub also carries the engine-wide running and
// allow-fetch flags.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::{AccountSnapshot, MarketSnapshot};

struct HubInner {
    market: MarketSnapshot,
    account: AccountSnapshot,
    market_data_timestamp: Option<Instant>,
    last_order_timestamp: Option<Instant>,
}

pub struct SharedStateHub {
    inner: Mutex<HubInner>,
    data_ready: Notify,
    has_market: AtomicBool,
    has_account: AtomicBool,
    running: AtomicBool,
    allow_fetch: AtomicBool,
}

impl SharedStateHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                market: MarketSnapshot::default(),
                account: AccountSnapshot::default(),
                market_data_timestamp: None,
                last_order_timestamp: None,
            }),
            data_ready: Notify::new(),
            has_market: AtomicBool::new(false),
            has_account: AtomicBool::new(false),
            running: AtomicBool::new(true),
            allow_fetch: AtomicBool::new(true),
        }
    }

    // -----------------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------------

    /// Replace the market snapshot wholesale and stamp its freshness clock.
    pub fn publish_market(&self, snapshot: MarketSnapshot) {
        {
            let mut inner = self.inner.lock();
            inner.market = snapshot;
            inner.market_data_timestamp = Some(Instant::now());
        }
        self.has_market.store(true, Ordering::SeqCst);
        self.data_ready.notify_waiters();
    }

    pub fn publish_account(&self, snapshot: AccountSnapshot) {
        {
            let mut inner = self.inner.lock();
            inner.account = snapshot;
        }
        self.has_account.store(true, Ordering::SeqCst);
        self.data_ready.notify_waiters();
    }

    // -----------------------------------------------------------------------
    // Consumer
    // -----------------------------------------------------------------------

    /// Block until both snapshots are present, bounded by `timeout`. Spurious
    /// wakes re-check the flags. Returns false on timeout or shutdown.
    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.both_ready() {
                return true;
            }
            if !self.is_running() {
                return false;
            }
            let notified = self.data_ready.notified();
            // Re-check after registering interest so a publish between the
            // first check and here is not lost.
            if self.both_ready() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return false;
            }
        }
    }

    fn both_ready(&self) -> bool {
        self.has_market.load(Ordering::SeqCst) && self.has_account.load(Ordering::SeqCst)
    }

    /// Atomically read both snapshots and clear the market flag. The account
    /// flag stays set so liveness does not depend on account cadence.
    pub fn consume_snapshots(&self) -> (MarketSnapshot, AccountSnapshot) {
        let inner = self.inner.lock();
        let pair = (inner.market.clone(), inner.account.clone());
        self.has_market.store(false, Ordering::SeqCst);
        pair
    }

    /// Age of the newest market snapshot; `None` before the first publish.
    pub fn market_data_age(&self) -> Option<Duration> {
        self.inner
            .lock()
            .market_data_timestamp
            .map(|at| at.elapsed())
    }

    // -----------------------------------------------------------------------
    // Order clock (written only by the execution engine)
    // -----------------------------------------------------------------------

    pub fn record_order_timestamp(&self) {
        self.inner.lock().last_order_timestamp = Some(Instant::now());
    }

    /// Seconds since the last accepted order; `None` when no order has been
    /// accepted yet.
    pub fn seconds_since_last_order(&self) -> Option<u64> {
        self.inner
            .lock()
            .last_order_timestamp
            .map(|at| at.elapsed().as_secs())
    }

    // -----------------------------------------------------------------------
    // Engine flags
    // -----------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cooperative shutdown: flip the flag and wake every waiter.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.data_ready.notify_waiters();
    }

    pub fn allow_fetch(&self) -> bool {
        self.allow_fetch.load(Ordering::SeqCst)
    }

    pub fn set_allow_fetch(&self, allowed: bool) {
        self.allow_fetch.store(allowed, Ordering::SeqCst);
    }
}

impl Default for SharedStateHub {
    fn default() -> Self {
        Self::new()
    }
}
