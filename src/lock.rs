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

//! Lock handle: acquire / renew / release and the maintenance loop.
//!
//! ## Purpose
//! A [`Lock`] binds a name to a backend driver under a fresh instance id.
//! Operations run the state machine against the record read through the
//! driver, post their outcome on the handle's event stream, and keep an
//! acquired lease alive from a background renewal task.
//!
//! ## Concurrency
//! A per-handle mutex totally orders Acquire/Renew/Release issued through
//! one handle, so the maintenance loop cannot race an application-level
//! release. Exclusion *between* handles is the backend's job. Cancelling
//! the handle stops the maintenance loop at the next tick boundary and
//! never releases the remote lease by itself: shutdown semantics belong to
//! the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{self, Driver};
use crate::condition::Condition;
use crate::error::{LockError, LockResult};
use crate::event::{spawn_default_consumer, Event, EventSink, EVENT_BUFFER};
use crate::record::{new_expiry, Lease, LockRecord, LockType};

/// Behavior knobs for a lock handle.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Tags reconciled into the record on acquire and release
    pub tags: Vec<String>,
    /// Lease duration; zero means a non-expiring lease
    pub duration: Duration,
    /// Renewal cadence of the maintenance loop; zero disables maintenance
    pub renew_interval: Duration,
    /// Replace the persisted tag set instead of adding to it
    pub reset_tags: bool,
    /// Evict the current holder when this evaluates true on the record
    pub force_condition: Option<Condition>,
    /// Emit events to a consumer; disabled handles stay silent
    pub emit_events: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            tags: Vec::new(),
            duration: Duration::ZERO,
            renew_interval: Duration::ZERO,
            reset_tags: false,
            force_condition: None,
            emit_events: true,
        }
    }
}

struct LockInner {
    name: String,
    instance_id: String,
    driver: Arc<dyn Driver>,
    options: LockOptions,
    cancel: CancellationToken,
    sink: EventSink,
    maintained: AtomicBool,
    op_lock: tokio::sync::Mutex<()>,
}

/// Handle on a named distributed lock.
///
/// Cloning shares the underlying handle (same instance id, same event
/// stream); it does not create a new contender.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    /// Create a handle whose events go to the default logging consumer.
    pub fn new(name: impl Into<String>, driver: Arc<dyn Driver>, options: LockOptions) -> Self {
        let name = name.into();
        let instance_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let sink = if options.emit_events {
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            spawn_default_consumer(rx, cancel.clone());
            EventSink::new(Some(tx), &name, &instance_id)
        } else {
            EventSink::new(None, &name, &instance_id)
        };
        Lock {
            inner: Arc::new(LockInner {
                name,
                instance_id,
                driver,
                options,
                cancel,
                sink,
                maintained: AtomicBool::new(false),
                op_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a handle handing the event stream to the caller instead of
    /// the default logging consumer.
    ///
    /// The caller must keep receiving: emission awaits channel capacity.
    pub fn with_event_channel(
        name: impl Into<String>,
        driver: Arc<dyn Driver>,
        options: LockOptions,
    ) -> (Self, mpsc::Receiver<Event>) {
        let name = name.into();
        let instance_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let sink = EventSink::new(Some(tx), &name, &instance_id);
        let lock = Lock {
            inner: Arc::new(LockInner {
                name,
                instance_id,
                driver,
                options,
                cancel: CancellationToken::new(),
                sink,
                maintained: AtomicBool::new(false),
                op_lock: tokio::sync::Mutex::new(()),
            }),
        };
        (lock, rx)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// This handle's identity on the backend record.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Cancellation signal observed by the maintenance loop and the
    /// default event consumer.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Stop the maintenance loop at its next tick and the default event
    /// consumer. Does not release the remote lease.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Acquire the lock, spawning the maintenance loop on success when a
    /// renewal cadence is configured.
    pub async fn acquire(&self) -> LockResult<()> {
        let inner = &self.inner;
        let _guard = inner.op_lock.lock().await;
        let result = backend::mutate(
            inner.driver.as_ref(),
            &inner.name,
            &inner.instance_id,
            |record| {
                apply_acquire(
                    record,
                    &inner.instance_id,
                    new_expiry(inner.options.duration),
                    &inner.options.tags,
                    inner.options.reset_tags,
                    inner.options.force_condition.as_ref(),
                )
            },
        )
        .await;
        match result {
            Ok(()) => {
                if !inner.options.renew_interval.is_zero() {
                    self.spawn_maintain();
                }
                inner.sink.acquire_successful().await;
                Ok(())
            }
            Err(err) => {
                inner.sink.acquire_failed(&err).await;
                Err(err)
            }
        }
    }

    /// Acquire with up to `retries` additional attempts, sleeping `delay`
    /// between them. Returns the last error when every attempt fails.
    pub async fn acquire_retry(&self, retries: u32, delay: Duration) -> LockResult<()> {
        let mut outcome = self.acquire().await;
        let mut attempt = 0;
        while let Err(err) = &outcome {
            if attempt >= retries {
                break;
            }
            attempt += 1;
            self.inner
                .sink
                .debug(&format!(
                    "retrying acquire after error: {err} (attempt {attempt} of {retries})"
                ))
                .await;
            tokio::time::sleep(delay).await;
            outcome = self.acquire().await;
        }
        outcome
    }

    /// Refresh this handle's lease expiry.
    pub async fn renew(&self) -> LockResult<()> {
        let inner = &self.inner;
        let _guard = inner.op_lock.lock().await;
        let result = backend::mutate(
            inner.driver.as_ref(),
            &inner.name,
            &inner.instance_id,
            |record| {
                apply_renew(
                    record,
                    &inner.name,
                    &inner.instance_id,
                    new_expiry(inner.options.duration),
                )
            },
        )
        .await;
        match result {
            Ok(()) => {
                inner.sink.renew_successful().await;
                Ok(())
            }
            Err(err) => {
                inner.sink.renew_failed(&err).await;
                Err(err)
            }
        }
    }

    /// Remove this handle's lease from the record.
    ///
    /// Idempotent at the record level: releasing without a lease is a
    /// successful no-op. The maintenance latch is cleared before the
    /// backend call so a concurrent tick cannot renew a lease we have
    /// already decided to give up.
    pub async fn release(&self) -> LockResult<()> {
        let inner = &self.inner;
        let _guard = inner.op_lock.lock().await;
        inner.maintained.store(false, Ordering::SeqCst);
        let result = backend::mutate(
            inner.driver.as_ref(),
            &inner.name,
            &inner.instance_id,
            |record| {
                apply_release(
                    record,
                    &inner.instance_id,
                    &inner.options.tags,
                    inner.options.reset_tags,
                )
            },
        )
        .await;
        match result {
            Ok(()) => {
                inner.sink.release_successful().await;
                Ok(())
            }
            Err(err) => {
                inner.sink.release_failed(&err).await;
                Err(err)
            }
        }
    }

    fn spawn_maintain(&self) {
        let lock = self.clone();
        tokio::spawn(async move {
            lock.maintain().await;
        });
    }

    /// Background renewer. Strictly a renewer: it never releases, and it
    /// observes cancellation cooperatively at tick boundaries.
    async fn maintain(&self) {
        let inner = &self.inner;
        inner.maintained.store(true, Ordering::SeqCst);
        inner.sink.maintain_started().await;

        let mut ticker = tokio::time::interval(inner.options.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval fires immediately; the first renewal is due one cadence
        // after acquire
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    inner.maintained.store(false, Ordering::SeqCst);
                    inner.sink.maintain_stopped().await;
                    return;
                }
                _ = ticker.tick() => {
                    if !inner.maintained.load(Ordering::SeqCst) {
                        inner.sink.maintain_stopped().await;
                        return;
                    }
                    // failures are reported on the event stream; the loop
                    // keeps trying until released or cancelled
                    let _ = self.renew().await;
                }
            }
        }
    }
}

/// Acquire transition over a freshly read record.
fn apply_acquire(
    record: &mut LockRecord,
    instance_id: &str,
    expires: DateTime<Utc>,
    tags: &[String],
    reset_tags: bool,
    force_condition: Option<&Condition>,
) -> LockResult<()> {
    if record.lock_type.is_empty() {
        record.lock_type = LockType::mutex();
    }
    if !record.lock_type.is_mutex() {
        return Err(LockError::UnsupportedLockType(record.lock_type.to_string()));
    }

    let force = match force_condition {
        Some(condition) => condition.evaluate(record)?,
        None => false,
    };

    let lease_count = record.leases.len();
    if lease_count > 1 {
        return Err(LockError::InvariantViolation(format!(
            "invalid number of leases for mutex lock: {lease_count}"
        )));
    }
    if let Some((key, lease)) = record.leases.iter().next() {
        if key.as_str() != instance_id && !lease.expired() && !force {
            return Err(LockError::AlreadyHeld {
                holder: lease.instance_id.clone(),
            });
        }
    }

    // single-writer semantics: the new lease replaces whatever was there,
    // expired remnants included
    record.leases = HashMap::from([(
        instance_id.to_string(),
        Lease::new(instance_id, expires),
    )]);
    record.sync_tags(tags, reset_tags);
    Ok(())
}

/// Renew transition: only a live lease of our own can be extended.
fn apply_renew(
    record: &mut LockRecord,
    name: &str,
    instance_id: &str,
    expires: DateTime<Utc>,
) -> LockResult<()> {
    let lease = record.leases.get_mut(instance_id).ok_or(LockError::NoLease {
        instance_id: instance_id.to_string(),
    })?;
    if lease.expired() {
        return Err(LockError::LeaseExpired {
            name: name.to_string(),
            instance_id: instance_id.to_string(),
        });
    }
    lease.expires = expires;
    Ok(())
}

/// Release transition: removing an absent lease is a no-op.
fn apply_release(
    record: &mut LockRecord,
    instance_id: &str,
    tags: &[String],
    reset_tags: bool,
) -> LockResult<()> {
    record.leases.remove(instance_id);
    record.sync_tags(tags, reset_tags);
    Ok(())
}
