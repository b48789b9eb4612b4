// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Lockheed Contributors
//
// This file is part of Lockheed.
//
// Lockheed is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Lockheed is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Lockheed. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end lock flows over the in-memory driver.
//!
//! Exercises mutual exclusion, force takeover, background renewal, the
//! query façade, and the event stream through the public handle API.

use std::sync::Arc;
use std::time::Duration;

use lockheed::backend::memory::MemoryDriver;
use lockheed::{get_locks, Condition, Event, EventCode, Lock, LockError, LockOptions};
use tokio::sync::mpsc;
use tokio::time::sleep;

fn options(duration: Duration) -> LockOptions {
    LockOptions {
        duration,
        ..LockOptions::default()
    }
}

/// Drain whatever events are currently buffered.
fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn mutex_exclusion_between_handles() {
    let driver = Arc::new(MemoryDriver::new());
    let lock_a = Lock::new("testlock", driver.clone(), options(Duration::from_secs(10)));
    let lock_b = Lock::new("testlock", driver.clone(), options(Duration::from_secs(10)));

    lock_a.acquire().await.unwrap();

    let err = lock_b
        .acquire_retry(2, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LockError::AlreadyHeld {
            holder: lock_a.instance_id().to_string()
        }
    );

    lock_a.release().await.unwrap();
    lock_b.acquire().await.unwrap();
    lock_b.release().await.unwrap();
}

#[tokio::test]
async fn force_takeover_by_tag() {
    let driver = Arc::new(MemoryDriver::new());

    let lock_a = Lock::new(
        "testlockx",
        driver.clone(),
        LockOptions {
            duration: Duration::from_secs(30),
            tags: vec!["forceme".to_string()],
            ..LockOptions::default()
        },
    );
    lock_a.acquire().await.unwrap();

    // no force: blocked by A's live lease
    let lock_b = Lock::new("testlockx", driver.clone(), options(Duration::from_secs(30)));
    assert!(matches!(
        lock_b.acquire().await,
        Err(LockError::AlreadyHeld { .. })
    ));

    // force on the tag, clearing it in the same acquire
    let forced = LockOptions {
        duration: Duration::from_secs(30),
        reset_tags: true,
        force_condition: Some(Condition::has_tag("forceme")),
        ..LockOptions::default()
    };
    let lock_c = Lock::new("testlockx", driver.clone(), forced.clone());
    lock_c.acquire().await.unwrap();

    // C holds and the forceme tag is gone, so the same policy no longer fires
    let lock_d = Lock::new("testlockx", driver.clone(), forced);
    assert!(matches!(
        lock_d.acquire().await,
        Err(LockError::AlreadyHeld { .. })
    ));

    lock_c.release().await.unwrap();
}

#[tokio::test]
async fn maintenance_loop_keeps_lease_alive() {
    let driver = Arc::new(MemoryDriver::new());
    let lock_a = Lock::new(
        "renewed",
        driver.clone(),
        LockOptions {
            duration: Duration::from_secs(2),
            renew_interval: Duration::from_millis(500),
            ..LockOptions::default()
        },
    );
    lock_a.acquire().await.unwrap();

    // well past the original expiry; the loop must have renewed by now
    sleep(Duration::from_secs(3)).await;

    let lock_b = Lock::new("renewed", driver.clone(), options(Duration::from_secs(2)));
    assert!(matches!(
        lock_b.acquire().await,
        Err(LockError::AlreadyHeld { .. })
    ));

    lock_a.release().await.unwrap();
}

#[tokio::test]
async fn release_stops_maintenance() {
    let driver = Arc::new(MemoryDriver::new());
    let lock_a = Lock::new(
        "short",
        driver.clone(),
        LockOptions {
            duration: Duration::from_secs(1),
            renew_interval: Duration::from_millis(200),
            ..LockOptions::default()
        },
    );
    lock_a.acquire().await.unwrap();
    sleep(Duration::from_millis(500)).await;
    lock_a.release().await.unwrap();

    // with the loop latched off nothing renews; the record is free
    let lock_b = Lock::new("short", driver.clone(), options(Duration::from_secs(1)));
    lock_b.acquire().await.unwrap();
    lock_b.release().await.unwrap();
}

#[tokio::test]
async fn cancellation_stops_maintenance_without_releasing() {
    let driver = Arc::new(MemoryDriver::new());
    let (lock_a, mut events) = Lock::with_event_channel(
        "cancelled",
        driver.clone(),
        LockOptions {
            duration: Duration::from_secs(1),
            renew_interval: Duration::from_millis(200),
            ..LockOptions::default()
        },
    );
    lock_a.acquire().await.unwrap();
    sleep(Duration::from_millis(300)).await;
    lock_a.cancel();

    // lease stays on the record until it expires on its own
    let lock_b = Lock::new("cancelled", driver.clone(), options(Duration::from_secs(5)));
    sleep(Duration::from_millis(200)).await;
    let codes: Vec<EventCode> = drain(&mut events).iter().map(|e| e.code).collect();
    assert!(codes.contains(&EventCode::MaintainStopped));

    sleep(Duration::from_millis(1500)).await;
    lock_b.acquire().await.unwrap();
    lock_b.release().await.unwrap();
}

#[tokio::test]
async fn query_filters_by_condition() {
    let driver = Arc::new(MemoryDriver::new());

    let plain = Lock::new("testlock", driver.clone(), options(Duration::from_secs(30)));
    plain.acquire().await.unwrap();

    let tagged = Lock::new(
        "testlock2",
        driver.clone(),
        LockOptions {
            duration: Duration::from_secs(30),
            tags: vec!["testtag".to_string()],
            ..LockOptions::default()
        },
    );
    tagged.acquire().await.unwrap();

    let cond = Condition::and(vec![
        Condition::acquired(true),
        Condition::has_tag("testtag"),
    ]);
    let matching = get_locks(driver.as_ref(), Some(&cond)).await.unwrap();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].name, "testlock2");

    // unfiltered enumeration sees both records
    let all = get_locks(driver.as_ref(), None).await.unwrap();
    assert_eq!(all.len(), 2);

    plain.release().await.unwrap();
    tagged.release().await.unwrap();
}

#[tokio::test]
async fn release_is_idempotent() {
    let driver = Arc::new(MemoryDriver::new());
    let lock = Lock::new("testlock", driver.clone(), options(Duration::from_secs(10)));
    lock.acquire().await.unwrap();
    lock.release().await.unwrap();
    lock.release().await.unwrap();
}

#[tokio::test]
async fn reacquire_after_release() {
    let driver = Arc::new(MemoryDriver::new());
    let lock = Lock::new("testlock", driver.clone(), options(Duration::from_secs(10)));
    lock.acquire().await.unwrap();
    lock.release().await.unwrap();
    lock.acquire().await.unwrap();
    lock.release().await.unwrap();
}

#[tokio::test]
async fn zero_duration_lease_never_expires() {
    let driver = Arc::new(MemoryDriver::new());
    let lock_a = Lock::new("forever", driver.clone(), options(Duration::ZERO));
    lock_a.acquire().await.unwrap();

    let records = get_locks(driver.as_ref(), None).await.unwrap();
    let lease = &records[0].leases[lock_a.instance_id()];
    assert_eq!(
        lease
            .expires
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "9999-12-31T23:59:59Z"
    );
    assert!(!lease.expired());

    let lock_b = Lock::new("forever", driver.clone(), options(Duration::from_secs(10)));
    assert!(matches!(
        lock_b.acquire().await,
        Err(LockError::AlreadyHeld { .. })
    ));

    lock_a.release().await.unwrap();
}

#[tokio::test]
async fn expired_lease_is_reclaimable() {
    let driver = Arc::new(MemoryDriver::new());
    let lock_a = Lock::new("brief", driver.clone(), options(Duration::from_millis(300)));
    lock_a.acquire().await.unwrap();
    sleep(Duration::from_millis(400)).await;

    // renewing a lapsed lease fails; re-acquiring from another handle works
    assert!(matches!(
        lock_a.renew().await,
        Err(LockError::LeaseExpired { .. })
    ));
    let lock_b = Lock::new("brief", driver.clone(), options(Duration::from_secs(10)));
    lock_b.acquire().await.unwrap();
    lock_b.release().await.unwrap();
}

#[tokio::test]
async fn renew_without_lease_fails() {
    let driver = Arc::new(MemoryDriver::new());
    let lock = Lock::new("unheld", driver.clone(), options(Duration::from_secs(10)));
    let err = lock.renew().await.unwrap_err();
    assert_eq!(
        err,
        LockError::NoLease {
            instance_id: lock.instance_id().to_string()
        }
    );
}

#[tokio::test]
async fn tags_union_across_holders_and_reset_replaces() {
    let driver = Arc::new(MemoryDriver::new());

    let lock_a = Lock::new(
        "tagged",
        driver.clone(),
        LockOptions {
            duration: Duration::from_secs(10),
            tags: vec!["a".to_string()],
            ..LockOptions::default()
        },
    );
    lock_a.acquire().await.unwrap();
    lock_a.release().await.unwrap();

    let lock_b = Lock::new(
        "tagged",
        driver.clone(),
        LockOptions {
            duration: Duration::from_secs(10),
            tags: vec!["b".to_string()],
            ..LockOptions::default()
        },
    );
    lock_b.acquire().await.unwrap();

    let records = get_locks(driver.as_ref(), None).await.unwrap();
    assert_eq!(records[0].tags, vec!["a", "b"]);
    lock_b.release().await.unwrap();

    let lock_c = Lock::new(
        "tagged",
        driver.clone(),
        LockOptions {
            duration: Duration::from_secs(10),
            tags: vec!["c".to_string()],
            reset_tags: true,
            ..LockOptions::default()
        },
    );
    lock_c.acquire().await.unwrap();
    let records = get_locks(driver.as_ref(), None).await.unwrap();
    assert_eq!(records[0].tags, vec!["c"]);
    lock_c.release().await.unwrap();
}

#[tokio::test]
async fn events_report_outcomes() {
    let driver = Arc::new(MemoryDriver::new());
    let (lock, mut events) =
        Lock::with_event_channel("observed", driver.clone(), options(Duration::from_secs(10)));

    lock.acquire().await.unwrap();
    lock.renew().await.unwrap();
    lock.release().await.unwrap();

    let codes: Vec<EventCode> = drain(&mut events).iter().map(|e| e.code).collect();
    assert_eq!(
        codes,
        vec![
            EventCode::AcquireSuccessful,
            EventCode::RenewSuccessful,
            EventCode::ReleaseSuccessful,
        ]
    );
}

#[tokio::test]
async fn failed_acquire_emits_error_event_per_attempt() {
    let driver = Arc::new(MemoryDriver::new());
    let holder = Lock::new("contended", driver.clone(), options(Duration::from_secs(30)));
    holder.acquire().await.unwrap();

    let (contender, mut events) = Lock::with_event_channel(
        "contended",
        driver.clone(),
        options(Duration::from_secs(30)),
    );
    let err = contender
        .acquire_retry(2, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(err.retryable());

    let events = drain(&mut events);
    let failures = events
        .iter()
        .filter(|e| e.code == EventCode::AcquireFailed)
        .count();
    let debugs = events.iter().filter(|e| e.code == EventCode::Debug).count();
    assert_eq!(failures, 3, "one failure event per attempt");
    assert_eq!(debugs, 2, "one debug event per retry");
    assert!(events
        .iter()
        .filter(|e| e.code == EventCode::AcquireFailed)
        .all(|e| e.error.is_some()));

    holder.release().await.unwrap();
}

#[tokio::test]
async fn maintenance_loop_reports_start_and_stop() {
    let driver = Arc::new(MemoryDriver::new());
    let (lock, mut events) = Lock::with_event_channel(
        "maintained",
        driver.clone(),
        LockOptions {
            duration: Duration::from_secs(5),
            renew_interval: Duration::from_millis(100),
            ..LockOptions::default()
        },
    );

    lock.acquire().await.unwrap();
    sleep(Duration::from_millis(350)).await;
    lock.release().await.unwrap();
    // next tick observes the cleared latch and stops
    sleep(Duration::from_millis(250)).await;

    let codes: Vec<EventCode> = drain(&mut events).iter().map(|e| e.code).collect();
    assert!(codes.contains(&EventCode::MaintainStarted));
    assert!(codes.contains(&EventCode::RenewSuccessful));
    assert!(codes.contains(&EventCode::MaintainStopped));
}
