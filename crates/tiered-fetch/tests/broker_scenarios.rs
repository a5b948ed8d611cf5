//! Resource broker behavior under concurrency, quota and timers.
//!
//! All tests run on a paused tokio clock so session durations, queue
//! timeouts and forced releases are exact.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_test::{assert_err, assert_ok};

use tiered_fetch::{BrokerConfig, BrokerError, Plan, ResourceBroker, UsageSnapshot};

// ─────────────────────── helpers ───────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn broker(max_concurrent: usize, queue_capacity: usize) -> ResourceBroker {
    ResourceBroker::new(BrokerConfig {
        plan: Plan::Team,
        max_concurrent,
        max_session_duration_ms: 600_000,
        monthly_unit_quota: 1_000,
        queue_capacity,
        connection_timeout_ms: 30_000,
    })
}

/// Yield until `queued` callers are waiting.
async fn wait_for_queue(broker: &ResourceBroker, queued: usize) {
    while broker.stats().queued < queued {
        tokio::task::yield_now().await;
    }
}

// ─────────────────────── scenarios ───────────────────────

#[tokio::test(start_paused = true)]
async fn test_queued_sessions_promoted_in_fifo_order() {
    init_tracing();
    let broker = broker(1, 10);
    let a = assert_ok!(broker.acquire("A").await);

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (i, id) in ["B", "C", "D"].into_iter().enumerate() {
        let b = broker.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let permit = b.acquire(id).await.unwrap();
            order.lock().unwrap().push(id);
            tokio::time::sleep(Duration::from_secs(1)).await;
            permit.release();
        }));
        wait_for_queue(&broker, i + 1).await;
    }

    assert_eq!(broker.stats().active_sessions, 1);
    assert_eq!(broker.stats().queued, 3);

    a.release();
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["B", "C", "D"]);
    assert_eq!(broker.stats().active_sessions, 0);
}

#[tokio::test(start_paused = true)]
async fn test_b_promoted_when_a_releases() {
    let broker = broker(1, 5);
    let a = assert_ok!(broker.acquire("A").await);

    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.acquire("B").await })
    };
    wait_for_queue(&broker, 1).await;
    assert!(!broker.is_active("B"));

    a.release();
    let b = waiter.await.unwrap().unwrap();
    assert_eq!(b.session_id(), "B");
    assert!(broker.is_active("B"));
    assert_eq!(broker.stats().queued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_quota_checks_only_minimum_estimate() {
    let broker = broker(2, 2);
    let mut usage = broker.export_usage();
    usage.units_used = 999;
    broker.import_usage(&usage);

    // 999/1000: one unit left, so the session starts.
    let permit = assert_ok!(broker.acquire("expensive").await);
    tokio::time::advance(Duration::from_secs(45)).await;
    assert_eq!(permit.release(), Some(2));
    assert_eq!(broker.stats().units_used, 1_001);
    assert_eq!(broker.stats().units_remaining, 0);

    let err = assert_err!(broker.acquire("next").await);
    assert!(matches!(err, BrokerError::QuotaExceeded { used: 1_001, quota: 1_000, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn test_queue_capacity_boundary() {
    let broker = broker(1, 2);
    let _a = assert_ok!(broker.acquire("A").await);

    let b = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.acquire("B").await })
    };
    wait_for_queue(&broker, 1).await;

    // One below capacity: accepted.
    let c = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.acquire("C").await })
    };
    wait_for_queue(&broker, 2).await;

    // At capacity: rejected immediately.
    let err = assert_err!(broker.acquire("D").await);
    assert_eq!(err, BrokerError::QueueFull { capacity: 2 });
    assert!(err.is_retryable());
    assert_eq!(broker.stats().rejected, 1);

    broker.cleanup();
    assert_eq!(b.await.unwrap().unwrap_err(), BrokerError::Shutdown);
    assert_eq!(c.await.unwrap().unwrap_err(), BrokerError::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_forced_release_at_max_duration() {
    let broker = ResourceBroker::new(BrokerConfig {
        plan: Plan::Free,
        max_concurrent: 1,
        max_session_duration_ms: 60_000,
        monthly_unit_quota: 1_000,
        queue_capacity: 1,
        connection_timeout_ms: 120_000,
    });
    let permit = assert_ok!(broker.acquire("long").await);

    tokio::time::sleep(Duration::from_millis(59_999)).await;
    assert!(broker.is_active("long"));

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(!broker.is_active("long"));

    let stats = broker.stats();
    assert_eq!(stats.units_used, 2);
    assert_eq!(stats.forced_releases, 1);

    // Manual release after the forced one changes nothing.
    assert_eq!(permit.release(), None);
    assert_eq!(broker.release("long"), None);
    assert_eq!(broker.stats().units_used, 2);
}

#[tokio::test(start_paused = true)]
async fn test_forced_release_promotes_waiter() {
    let broker = ResourceBroker::new(BrokerConfig {
        plan: Plan::Free,
        max_concurrent: 1,
        max_session_duration_ms: 10_000,
        monthly_unit_quota: 1_000,
        queue_capacity: 1,
        connection_timeout_ms: 30_000,
    });
    let _stuck = assert_ok!(broker.acquire("stuck").await);

    let next = assert_ok!(broker.acquire_with_retry("next", 1).await);
    assert_eq!(next.session_id(), "next");
    assert!(!broker.is_active("stuck"));
    assert_eq!(broker.stats().forced_releases, 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout_removes_waiter() {
    let broker = broker(1, 3);
    let a = assert_ok!(broker.acquire("A").await);

    let err = assert_err!(broker.acquire("B").await);
    assert!(matches!(err, BrokerError::Timeout { waited_ms } if waited_ms >= 30_000));

    let stats = broker.stats();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.timed_out, 1);

    a.release();
    assert!(!broker.is_active("B"));
    assert_eq!(broker.stats().active_sessions, 0);
}

#[tokio::test(start_paused = true)]
async fn test_one_timeout_does_not_disturb_later_waiters() {
    let broker = broker(1, 3);
    let a = assert_ok!(broker.acquire("A").await);

    let b = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.acquire("B").await })
    };
    wait_for_queue(&broker, 1).await;

    tokio::time::advance(Duration::from_secs(10)).await;
    let c = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.acquire("C").await })
    };
    wait_for_queue(&broker, 2).await;

    // B expires at t=30s; C keeps waiting until t=40s.
    let b_err = b.await.unwrap().unwrap_err();
    assert!(matches!(b_err, BrokerError::Timeout { .. }));
    assert_eq!(broker.stats().queued, 1);

    a.release();
    let c_permit = c.await.unwrap().unwrap();
    assert_eq!(c_permit.session_id(), "C");
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_wait_leaves_queue() {
    let broker = broker(1, 1);
    let a = assert_ok!(broker.acquire("A").await);

    let cancelled = tokio::time::timeout(Duration::from_secs(1), broker.acquire("B")).await;
    assert!(cancelled.is_err());
    assert_eq!(broker.stats().queued, 0);

    // The freed queue slot is usable again, and the slot goes to C.
    let c = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.acquire("C").await })
    };
    wait_for_queue(&broker, 1).await;
    a.release();
    assert_eq!(c.await.unwrap().unwrap().session_id(), "C");
    assert!(!broker.is_active("B"));
}

#[tokio::test(start_paused = true)]
async fn test_active_never_exceeds_max_concurrent() {
    let broker = broker(3, 20);
    let mut handles = Vec::new();
    for i in 0..12 {
        let b = broker.clone();
        handles.push(tokio::spawn(async move {
            let permit = b.acquire(&format!("s{i}")).await.unwrap();
            let active = b.stats().active_sessions;
            tokio::time::sleep(Duration::from_millis(700)).await;
            permit.release();
            active
        }));
    }

    for h in handles {
        let active = h.await.unwrap();
        assert!(active <= 3, "saw {active} active sessions");
    }
    let stats = broker.stats();
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.total_requests, 12);
    assert_eq!(stats.units_used, 12);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_from_full_queue() {
    let broker = broker(1, 0);
    let a = assert_ok!(broker.acquire("A").await);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        a.release();
    });

    let permit = assert_ok!(broker.acquire_with_retry("B", 3).await);
    assert_eq!(permit.session_id(), "B");
    assert_eq!(broker.stats().rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_gives_up_on_quota() {
    let broker = broker(1, 0);
    let mut usage = broker.export_usage();
    usage.units_used = 5_000;
    broker.import_usage(&usage);

    let err = assert_err!(broker.acquire_with_retry("B", 5).await);
    assert!(matches!(err, BrokerError::QuotaExceeded { .. }));
    assert_eq!(broker.stats().total_requests, 1);
}

#[tokio::test]
async fn test_usage_snapshot_from_past_period_rolls_over() {
    let broker = broker(1, 1);
    let stale = UsageSnapshot {
        units_used: 900,
        quota_reset_at: Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap(),
        total_requests: 40,
        timed_out: 2,
        rejected: 1,
        forced_releases: 0,
    };
    broker.import_usage(&stale);

    let stats = broker.stats();
    assert_eq!(stats.units_used, 0);
    assert_eq!(stats.total_requests, 0);
    assert!(stats.quota_reset_at > Utc::now());

    let json = serde_json::to_string(&broker.export_usage()).unwrap();
    let back: UsageSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(back, broker.export_usage());
}
