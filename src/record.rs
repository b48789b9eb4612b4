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

//! Persisted lock record and lease arithmetic.
//!
//! ## Purpose
//! The record is the unit of coordination stored in the backend: a name, a
//! lock type, a lease map keyed by holder instance id, and a tag set. All
//! mutation goes through the state machine in [`crate::lock`]; backends and
//! applications treat the record as read-only data.
//!
//! ## Wire format
//! Records serialize to JSON with the field names `name`, `lockType`,
//! `leases` (values carry `instanceID` and an RFC3339 `expires`), and `tags`
//! (omitted when empty). Handle-local state is never persisted.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{LockError, LockResult};

/// Lock type tag persisted on the record.
///
/// Only `mutex` is implemented. Other values are reserved: acquiring a
/// record carrying one fails with [`LockError::UnsupportedLockType`]
/// rather than silently downgrading it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockType(String);

impl LockType {
    pub const MUTEX: &'static str = "mutex";

    pub fn mutex() -> Self {
        LockType(Self::MUTEX.to_string())
    }

    pub fn is_mutex(&self) -> bool {
        self.0 == Self::MUTEX
    }

    /// A freshly created record has no lock type until first acquire.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A time-bounded claim of a lock by a specific instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    pub expires: DateTime<Utc>,
}

impl Lease {
    pub fn new(instance_id: impl Into<String>, expires: DateTime<Utc>) -> Self {
        Lease {
            instance_id: instance_id.into(),
            expires,
        }
    }

    /// A lease at exactly `now == expires` counts as expired.
    pub fn expired(&self) -> bool {
        Utc::now() >= self.expires
    }
}

/// Far-future timestamp denoting a non-expiring lease (zero duration).
pub fn expiry_sentinel() -> DateTime<Utc> {
    match Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59) {
        chrono::LocalResult::Single(t) => t,
        _ => DateTime::<Utc>::MAX_UTC,
    }
}

/// Expiry for a lease granted now with the given duration.
///
/// Zero duration yields the far-future sentinel, so [`Lease::expired`]
/// stays false indefinitely.
pub fn new_expiry(duration: Duration) -> DateTime<Utc> {
    if duration.is_zero() {
        return expiry_sentinel();
    }
    Utc::now() + duration
}

/// Persisted state of a named lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    #[serde(rename = "lockType", default, skip_serializing_if = "LockType::is_empty")]
    pub lock_type: LockType,
    #[serde(default)]
    pub leases: HashMap<String, Lease>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl LockRecord {
    /// Empty record carrying only the name, as written on first contact
    /// with a backend that has never seen the lock.
    pub fn named(name: impl Into<String>) -> Self {
        LockRecord {
            name: name.into(),
            ..LockRecord::default()
        }
    }

    /// Whether any lease on the record is still live.
    pub fn held(&self) -> bool {
        self.leases.values().any(|lease| !lease.expired())
    }

    /// Check structural invariants of a freshly read record.
    ///
    /// Every lease must be keyed by its own instance id; a record failing
    /// this is malformed and no mutation may be based on it.
    pub fn validate(&self) -> LockResult<()> {
        for (key, lease) in &self.leases {
            if *key != lease.instance_id {
                return Err(LockError::InvariantViolation(format!(
                    "lease keyed by {key} carries instance id {}",
                    lease.instance_id
                )));
            }
        }
        Ok(())
    }

    /// Reconcile the handle's tags into the persisted tag set.
    ///
    /// Tags are only ever added, never removed, unless `reset` is set, in
    /// which case the incoming tags replace the persisted set entirely.
    /// Either way the result is duplicate-free.
    pub fn sync_tags(&mut self, tags: &[String], reset: bool) {
        if reset {
            self.tags.clear();
        }
        for tag in tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
    }
}
