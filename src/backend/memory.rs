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

//! In-memory driver (for testing and single-process scenarios).
//!
//! Mirrors the document-store flavor: records are JSON payloads guarded by
//! a version token that every commit checks and rotates.
//!
//! ## Limitations
//! - Not persistent (records lost on drop)
//! - Not distributed (single process only)

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use ulid::Ulid;

use super::{Driver, LockState, StateHandle};
use crate::error::{LockError, LockResult};
use crate::record::LockRecord;

struct StoredRecord {
    payload: String,
    version: String,
}

/// In-memory lock driver.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    records: Arc<RwLock<HashMap<String, StoredRecord>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver::default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn read_state(&self, name: &str, _instance_id: &str) -> LockResult<LockState> {
        let mut records = self.records.write().await;
        let stored = match records.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let payload = serde_json::to_string(&LockRecord::named(name))?;
                entry.insert(StoredRecord {
                    payload,
                    version: Ulid::new().to_string(),
                })
            }
        };
        let record: LockRecord = serde_json::from_str(&stored.payload)?;
        Ok(LockState::new(
            record,
            Box::new(MemoryStateHandle {
                records: self.records.clone(),
                name: name.to_string(),
                expected_version: stored.version.clone(),
            }),
        ))
    }

    async fn list_records(&self) -> LockResult<Vec<LockRecord>> {
        let records = self.records.read().await;
        let mut result = Vec::with_capacity(records.len());
        for stored in records.values() {
            result.push(serde_json::from_str(&stored.payload)?);
        }
        Ok(result)
    }
}

struct MemoryStateHandle {
    records: Arc<RwLock<HashMap<String, StoredRecord>>>,
    name: String,
    expected_version: String,
}

#[async_trait]
impl StateHandle for MemoryStateHandle {
    async fn commit(self: Box<Self>, record: &LockRecord) -> LockResult<()> {
        let mut records = self.records.write().await;
        let stored = records.get_mut(&self.name).ok_or_else(|| {
            LockError::Conflict(format!("record {} disappeared during update", self.name))
        })?;
        if stored.version != self.expected_version {
            return Err(LockError::Conflict(format!(
                "version token stale for {}",
                self.name
            )));
        }
        stored.payload = serde_json::to_string(record)?;
        stored.version = Ulid::new().to_string();
        Ok(())
    }

    async fn abort(self: Box<Self>) -> LockResult<()> {
        // version-token flavor holds nothing between read and commit
        Ok(())
    }
}
