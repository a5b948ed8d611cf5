//! Resource broker for the full-browser tier.
//!
//! Gates browser sessions under three limits at once: bounded concurrency,
//! a monthly cost-unit quota, and a bounded FIFO wait queue.
//!
//! ## Session lifecycle
//!
//! `acquire` either activates a session immediately or queues the caller.
//! A queued caller is promoted only when a slot frees and it is at the head
//! of the queue. An active session ends on `release` (explicit or by
//! dropping its `SessionPermit`) or when its forced-release timer fires at
//! `max_session_duration_ms`, whichever comes first. Cost is accounted
//! exactly once either way.
//!
//! All state sits behind one `std::sync::Mutex` that is never held across
//! an `.await`, so `release` is synchronous and safe to call from `Drop`.

pub mod config;
pub mod ledger;
pub mod retry;

pub use config::{BrokerConfig, Plan};
pub use ledger::{units_for, UsageLedger, UsageSnapshot, UNIT_DURATION_MS};
pub use retry::{retry_delay, should_retry};

use crate::error::{BrokerError, BrokerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Point-in-time view of broker usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub plan: Plan,
    pub units_used: u64,
    pub units_remaining: u64,
    pub monthly_unit_quota: u64,
    pub active_sessions: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub total_requests: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub forced_releases: u64,
    pub quota_reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseCause {
    Manual,
    Forced,
    Shutdown,
}

struct ActiveSession {
    lease: u64,
    started_at: Instant,
    max_duration: Duration,
    timer: Option<AbortHandle>,
}

struct Waiter {
    ticket: u64,
    session_id: String,
    enqueued_at: Instant,
    grant: oneshot::Sender<BrokerResult<u64>>,
}

struct BrokerState {
    config: BrokerConfig,
    ledger: UsageLedger,
    active: HashMap<String, ActiveSession>,
    queue: VecDeque<Waiter>,
    next_lease: u64,
    next_ticket: u64,
    closed: bool,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
}

/// Shared handle to the broker. Clones refer to the same state.
#[derive(Clone)]
pub struct ResourceBroker {
    inner: Arc<BrokerInner>,
}

impl ResourceBroker {
    pub fn new(config: BrokerConfig) -> Self {
        tracing::info!(
            "resource broker: plan={} max_concurrent={} quota={} queue={}",
            config.plan,
            config.max_concurrent,
            config.monthly_unit_quota,
            config.queue_capacity
        );
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    config,
                    ledger: UsageLedger::new(Utc::now()),
                    active: HashMap::new(),
                    queue: VecDeque::new(),
                    next_lease: 1,
                    next_ticket: 1,
                    closed: false,
                }),
            }),
        }
    }

    pub fn for_plan(plan: Plan) -> Self {
        Self::new(plan.limits())
    }

    pub fn from_env() -> Self {
        Self::new(BrokerConfig::from_env())
    }

    pub fn config(&self) -> BrokerConfig {
        self.inner.lock().config.clone()
    }

    /// Swap limits. Queued requests are promoted if the new limit allows.
    pub fn set_config(&self, config: BrokerConfig) {
        let mut state = self.inner.lock();
        tracing::info!("resource broker: switching plan {} -> {}", state.config.plan, config.plan);
        state.config = config;
        promote(&mut state, &Arc::downgrade(&self.inner));
    }

    /// Obtain a browser session slot for `session_id`.
    ///
    /// Fails fast with `QuotaExceeded` or `QueueFull`; otherwise activates
    /// immediately or waits in FIFO order up to `connection_timeout_ms`.
    pub async fn acquire(&self, session_id: &str) -> BrokerResult<SessionPermit> {
        let (ticket, rx, timeout, enqueued_at) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BrokerError::Shutdown);
            }
            state.ledger.roll_over(Utc::now());
            state.ledger.note_request();

            let quota = state.config.monthly_unit_quota;
            if !state.ledger.has_capacity(quota) {
                state.ledger.note_rejected();
                return Err(BrokerError::QuotaExceeded {
                    used: state.ledger.units_used(),
                    quota,
                    resets_at: state.ledger.quota_reset_at(),
                });
            }

            if state.active.contains_key(session_id)
                || state.queue.iter().any(|w| w.session_id == session_id)
            {
                state.ledger.note_rejected();
                return Err(BrokerError::SessionActive(session_id.to_string()));
            }

            // Callers that abandoned their wait leave closed senders behind.
            state.queue.retain(|w| !w.grant.is_closed());

            if state.active.len() < state.config.max_concurrent && state.queue.is_empty() {
                let lease = activate(&mut state, Arc::downgrade(&self.inner), session_id);
                tracing::debug!(
                    "session {session_id} active ({}/{})",
                    state.active.len(),
                    state.config.max_concurrent
                );
                return Ok(self.permit(session_id, lease));
            }

            let capacity = state.config.queue_capacity;
            if state.queue.len() >= capacity {
                state.ledger.note_rejected();
                tracing::debug!("session {session_id} rejected: queue full ({capacity})");
                return Err(BrokerError::QueueFull { capacity });
            }

            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let enqueued_at = Instant::now();
            state.queue.push_back(Waiter {
                ticket,
                session_id: session_id.to_string(),
                enqueued_at,
                grant: tx,
            });
            tracing::debug!(
                "session {session_id} queued at position {}",
                state.queue.len()
            );
            (ticket, rx, state.config.connection_timeout(), enqueued_at)
        };

        let mut wait = QueuedWait {
            inner: &self.inner,
            ticket,
            session_id,
            rx,
            settled: false,
        };

        match tokio::time::timeout(timeout, &mut wait.rx).await {
            Ok(Ok(Ok(lease))) => {
                wait.settled = true;
                Ok(self.permit(session_id, lease))
            }
            Ok(Ok(Err(e))) => {
                wait.settled = true;
                Err(e)
            }
            Ok(Err(_)) => {
                wait.settled = true;
                Err(BrokerError::Shutdown)
            }
            Err(_) => {
                let mut state = self.inner.lock();
                // A grant may have raced the timer; it was sent under this lock.
                if let Ok(granted) = wait.rx.try_recv() {
                    wait.settled = true;
                    return granted.map(|lease| self.permit(session_id, lease));
                }
                state.queue.retain(|w| w.ticket != ticket);
                state.ledger.note_timeout();
                wait.settled = true;
                let waited_ms = enqueued_at.elapsed().as_millis() as u64;
                tracing::debug!("session {session_id} timed out after {waited_ms}ms in queue");
                Err(BrokerError::Timeout { waited_ms })
            }
        }
    }

    /// `acquire`, retrying transient failures with backoff.
    pub async fn acquire_with_retry(
        &self,
        session_id: &str,
        max_attempts: u32,
    ) -> BrokerResult<SessionPermit> {
        let mut attempt = 1;
        loop {
            match self.acquire(session_id).await {
                Ok(permit) => return Ok(permit),
                Err(e) if should_retry(&e, attempt, max_attempts) => {
                    let delay = retry_delay(attempt);
                    tracing::debug!(
                        "acquire {session_id} attempt {attempt}/{max_attempts} failed: {e}; retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// End a session and charge its cost. Returns the units charged, or
    /// `None` if the session was not active.
    pub fn release(&self, session_id: &str) -> Option<u64> {
        self.inner.release_lease(session_id, None, ReleaseCause::Manual)
    }

    /// Force-release every active session and reject every queued waiter.
    /// The broker refuses further acquires afterwards.
    pub fn cleanup(&self) -> usize {
        let mut state = self.inner.lock();
        state.closed = true;

        let ids: Vec<String> = state.active.keys().cloned().collect();
        let released = ids.len();
        for id in ids {
            finish_session(&mut state, &id, None, ReleaseCause::Shutdown);
        }

        let waiters = state.queue.len();
        for waiter in state.queue.drain(..) {
            let _ = waiter.grant.send(Err(BrokerError::Shutdown));
        }
        tracing::info!(
            "resource broker shut down: released {released} session(s), rejected {waiters} waiter(s)"
        );
        released
    }

    pub fn stats(&self) -> BrokerStats {
        let mut state = self.inner.lock();
        state.ledger.roll_over(Utc::now());
        let quota = state.config.monthly_unit_quota;
        let usage = state.ledger.snapshot();
        BrokerStats {
            plan: state.config.plan,
            units_used: usage.units_used,
            units_remaining: state.ledger.units_remaining(quota),
            monthly_unit_quota: quota,
            active_sessions: state.active.len(),
            queued: state.queue.len(),
            max_concurrent: state.config.max_concurrent,
            total_requests: usage.total_requests,
            timed_out: usage.timed_out,
            rejected: usage.rejected,
            forced_releases: usage.forced_releases,
            quota_reset_at: usage.quota_reset_at,
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.inner.lock().active.contains_key(session_id)
    }

    pub fn export_usage(&self) -> UsageSnapshot {
        let mut state = self.inner.lock();
        state.ledger.roll_over(Utc::now());
        state.ledger.snapshot()
    }

    /// Replace the ledger with a persisted snapshot. A snapshot from an
    /// earlier period is rolled over immediately.
    pub fn import_usage(&self, snapshot: &UsageSnapshot) {
        let mut state = self.inner.lock();
        state.ledger = UsageLedger::restore(snapshot);
        state.ledger.roll_over(Utc::now());
    }

    fn permit(&self, session_id: &str, lease: u64) -> SessionPermit {
        SessionPermit {
            inner: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
            lease,
            released: false,
        }
    }
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release_lease(
        self: &Arc<Self>,
        session_id: &str,
        lease: Option<u64>,
        cause: ReleaseCause,
    ) -> Option<u64> {
        let mut state = self.lock();
        let units = finish_session(&mut state, session_id, lease, cause)?;
        promote(&mut state, &Arc::downgrade(self));
        Some(units)
    }
}

/// Start a session and its forced-release timer. Caller holds the lock.
fn activate(state: &mut BrokerState, broker: Weak<BrokerInner>, session_id: &str) -> u64 {
    let lease = state.next_lease;
    state.next_lease += 1;

    let max_duration = state.config.max_session_duration();
    let started_at = Instant::now();
    let deadline = started_at + max_duration;
    let id = session_id.to_string();
    let timer = match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(inner) = broker.upgrade() {
                    inner.release_lease(&id, Some(lease), ReleaseCause::Forced);
                }
            });
            Some(task.abort_handle())
        }
        Err(_) => {
            tracing::warn!("session {session_id} started outside a tokio runtime; no forced-release timer");
            None
        }
    };

    state.active.insert(
        session_id.to_string(),
        ActiveSession {
            lease,
            started_at,
            max_duration,
            timer,
        },
    );
    lease
}

/// Remove an active session and charge it. `lease` pins a specific
/// activation; `None` releases whatever is active under the id.
fn finish_session(
    state: &mut BrokerState,
    session_id: &str,
    lease: Option<u64>,
    cause: ReleaseCause,
) -> Option<u64> {
    let current = state.active.get(session_id)?;
    if lease.is_some_and(|l| l != current.lease) {
        return None;
    }
    let session = state.active.remove(session_id)?;
    if cause != ReleaseCause::Forced {
        if let Some(timer) = &session.timer {
            timer.abort();
        }
    }

    let mut elapsed = session.started_at.elapsed();
    if cause == ReleaseCause::Forced {
        // The timer fires at or just after the cap; bill the cap itself.
        elapsed = elapsed.min(session.max_duration);
    }
    let units = units_for(elapsed);
    state.ledger.roll_over(Utc::now());
    state.ledger.charge(units);

    match cause {
        ReleaseCause::Forced => {
            state.ledger.note_forced_release();
            tracing::warn!(
                "session {session_id} force-released after {}ms ({units} units)",
                elapsed.as_millis()
            );
        }
        ReleaseCause::Shutdown => {
            tracing::info!("session {session_id} released at shutdown ({units} units)");
        }
        ReleaseCause::Manual => {
            tracing::debug!(
                "session {session_id} released after {}ms ({units} units)",
                elapsed.as_millis()
            );
        }
    }
    Some(units)
}

/// Hand free slots to queued waiters, head first. Caller holds the lock.
fn promote(state: &mut BrokerState, broker: &Weak<BrokerInner>) {
    if state.closed {
        return;
    }
    while state.active.len() < state.config.max_concurrent {
        let Some(waiter) = state.queue.pop_front() else {
            break;
        };
        if waiter.grant.is_closed() {
            continue;
        }
        let lease = activate(state, broker.clone(), &waiter.session_id);
        tracing::debug!(
            "session {} promoted after {}ms in queue",
            waiter.session_id,
            waiter.enqueued_at.elapsed().as_millis()
        );
        if waiter.grant.send(Ok(lease)).is_err() {
            // Receiver vanished between the check and the send.
            if let Some(session) = state.active.remove(&waiter.session_id) {
                if let Some(timer) = session.timer {
                    timer.abort();
                }
            }
        }
    }
}

/// A queued acquire in flight. Dropping it early (caller cancelled) leaves
/// the queue and returns any slot that was granted meanwhile.
struct QueuedWait<'a> {
    inner: &'a Arc<BrokerInner>,
    ticket: u64,
    session_id: &'a str,
    rx: oneshot::Receiver<BrokerResult<u64>>,
    settled: bool,
}

impl Drop for QueuedWait<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let granted = {
            let mut state = self.inner.lock();
            state.queue.retain(|w| w.ticket != self.ticket);
            self.rx.try_recv().ok().and_then(|r| r.ok())
        };
        if let Some(lease) = granted {
            self.inner
                .release_lease(self.session_id, Some(lease), ReleaseCause::Manual);
        }
    }
}

/// Proof of an active browser session. Releasing it (or dropping it) ends
/// the session; a forced release in the meantime makes that a no-op.
pub struct SessionPermit {
    inner: Arc<BrokerInner>,
    session_id: String,
    lease: u64,
    released: bool,
}

impl SessionPermit {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// End the session now. Returns the units charged, or `None` if it had
    /// already been force-released.
    pub fn release(mut self) -> Option<u64> {
        self.released = true;
        self.inner
            .release_lease(&self.session_id, Some(self.lease), ReleaseCause::Manual)
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        if !self.released {
            self.inner
                .release_lease(&self.session_id, Some(self.lease), ReleaseCause::Manual);
        }
    }
}

impl std::fmt::Debug for SessionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPermit")
            .field("session_id", &self.session_id)
            .field("lease", &self.lease)
            .finish()
    }
}
