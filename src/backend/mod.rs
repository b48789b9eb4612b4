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

//! Backend driver contract and the safe read-modify-write sequence.
//!
//! ## Purpose
//! A backend is any strongly-consistent store that can read a lock record,
//! update it under a per-record concurrency precondition, and enumerate all
//! records it knows about. Drivers own their concurrency primitive
//! internally: a store with a native version token (document stores) checks
//! it at commit time; a store without one (cluster object stores) takes a
//! short-lived reservation at read time and clears it in the commit write.
//! Consumers never observe either mechanism.
//!
//! ## Update sequence
//! [`mutate`] runs every mutation the same way:
//! 1. read the record through [`Driver::read_state`], which also creates it
//!    on first contact and captures whatever token or reservation the
//!    driver needs,
//! 2. validate the snapshot and apply the state-machine closure to it,
//! 3. on success, commit the new payload under the captured precondition;
//!    on failure, abort so a reservation never survives the caller's error.
//!
//! A stale token or stolen reservation surfaces as [`LockError::Conflict`].

pub mod memory;
pub mod reservation;

#[cfg(feature = "ddb-backend")]
pub mod dynamodb;

#[cfg(feature = "kube-backend")]
pub mod kube;

use async_trait::async_trait;
use tracing::warn;

use crate::condition::Condition;
use crate::error::{LockError, LockResult};
use crate::record::LockRecord;

/// Capability a concrete store must fulfill.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Read the record for `name`, creating an empty one if the backend has
    /// never seen it, and return the snapshot together with the commit
    /// handle for this update round.
    ///
    /// `instance_id` identifies the caller to stores that reserve the
    /// record while the new state is computed.
    async fn read_state(&self, name: &str, instance_id: &str) -> LockResult<LockState>;

    /// Enumerate all lock records known to this backend instance.
    async fn list_records(&self) -> LockResult<Vec<LockRecord>>;
}

/// One update round against a single record: the snapshot plus the driver's
/// commit/abort handle for it.
pub struct LockState {
    pub record: LockRecord,
    handle: Box<dyn StateHandle>,
}

impl LockState {
    pub fn new(record: LockRecord, handle: Box<dyn StateHandle>) -> Self {
        LockState { record, handle }
    }

    /// Persist the (mutated) record under the driver's precondition.
    pub async fn commit(self) -> LockResult<()> {
        self.handle.commit(&self.record).await
    }

    /// Give up without writing a new payload, clearing any reservation.
    pub async fn abort(self) -> LockResult<()> {
        self.handle.abort().await
    }
}

/// Driver-private continuation of a [`Driver::read_state`] call.
///
/// `commit` must clear any reservation in the same write that persists the
/// payload; `abort` must clear it without touching the payload.
#[async_trait]
pub trait StateHandle: Send {
    async fn commit(self: Box<Self>, record: &LockRecord) -> LockResult<()>;
    async fn abort(self: Box<Self>) -> LockResult<()>;
}

/// Run one state-machine mutation against the backend.
///
/// The reservation (where the driver uses one) is released on every exit
/// path: a failed validation or transition aborts before the error is
/// returned to the caller.
pub(crate) async fn mutate<F>(
    driver: &dyn Driver,
    name: &str,
    instance_id: &str,
    transition: F,
) -> LockResult<()>
where
    F: FnOnce(&mut LockRecord) -> LockResult<()>,
{
    let mut state = driver.read_state(name, instance_id).await?;
    let outcome = state
        .record
        .validate()
        .and_then(|()| transition(&mut state.record));
    match outcome {
        Ok(()) => state.commit().await,
        Err(err) => {
            if let Err(abort_err) = state.abort().await {
                warn!(lock = %name, error = %abort_err, "failed to clear reservation after aborted update");
            }
            Err(err)
        }
    }
}

/// Enumerate all locks, keeping those matching `condition` when given.
///
/// Evaluation errors abort the enumeration and surface to the caller.
pub async fn get_locks(
    driver: &dyn Driver,
    condition: Option<&Condition>,
) -> LockResult<Vec<LockRecord>> {
    let records = driver.list_records().await?;
    let Some(condition) = condition else {
        return Ok(records);
    };
    let mut matching = Vec::new();
    for record in records {
        if condition.evaluate(&record)? {
            matching.push(record);
        }
    }
    Ok(matching)
}
