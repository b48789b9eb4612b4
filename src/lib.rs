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

//! # Lockheed
//!
//! ## Purpose
//! Distributed mutual exclusion with lease semantics for processes that do
//! not share memory. A holder acquires a named lock backed by a
//! strongly-consistent store; the lease expires unless renewed, so a
//! crashed holder cannot wedge the resource forever. A newcomer may
//! forcibly take a lock whose metadata matches a declarative condition.
//!
//! ## Design Decisions
//! - **Lease-based**: expiry arithmetic is local, with a far-future
//!   sentinel for non-expiring leases
//! - **Backend-agnostic**: drivers expose read / CAS-commit / list; stores
//!   without a version token reserve the record for the read-modify-write
//!   window
//! - **Background renewal**: one maintenance task per acquired lock keeps
//!   the lease alive at a configurable cadence
//! - **Observable**: every outcome is posted on a per-handle event stream
//!
//! ## Backend Support
//! - **Memory**: in-process (always available, for testing)
//! - **DynamoDB**: document-store flavor with conditional writes
//!   (feature: `ddb-backend`)
//! - **Kubernetes ConfigMaps**: object-store flavor with reservation
//!   annotations (feature: `kube-backend`)
//!
//! ## Example
//! ```rust,no_run
//! use lockheed::{backend::memory::MemoryDriver, Condition, Lock, LockOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> lockheed::LockResult<()> {
//! let driver = Arc::new(MemoryDriver::new());
//!
//! let lock = Lock::new(
//!     "scheduler-leader",
//!     driver.clone(),
//!     LockOptions {
//!         duration: Duration::from_secs(30),
//!         renew_interval: Duration::from_secs(5),
//!         tags: vec!["scheduler".to_string()],
//!         ..LockOptions::default()
//!     },
//! );
//!
//! lock.acquire().await?;
//! // ... do leader-only work; the maintenance loop renews the lease ...
//! lock.release().await?;
//!
//! // enumerate held locks carrying the scheduler tag
//! let cond = Condition::and(vec![
//!     Condition::acquired(true),
//!     Condition::has_tag("scheduler"),
//! ]);
//! let held = lockheed::get_locks(driver.as_ref(), Some(&cond)).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod condition;
pub mod error;
pub mod event;
pub mod lock;
pub mod record;

pub use backend::{get_locks, Driver, LockState, StateHandle};
pub use condition::{Condition, Field, Predicate, Value};
pub use error::{LockError, LockResult};
pub use event::{Event, EventCode};
pub use lock::{Lock, LockOptions};
pub use record::{Lease, LockRecord, LockType};
