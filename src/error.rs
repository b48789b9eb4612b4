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

//! Error types for lock operations.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
///
/// Variants are cheap to clone so they can travel on the event stream
/// alongside being returned to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Mutex lock held by a live lease of another instance
    #[error("lock already held by {holder}")]
    AlreadyHeld { holder: String },

    /// Renew called without a lease on the record
    #[error("no lease to renew for {instance_id}")]
    NoLease { instance_id: String },

    /// Renew called after the caller's lease expired
    #[error("lease on lock {name} for {instance_id} already expired")]
    LeaseExpired { name: String, instance_id: String },

    /// Persisted record violates the lock-type invariants (e.g. more than
    /// one lease on a mutex, or a lease keyed under a foreign instance id)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Lock types other than `mutex` are reserved but not implemented
    #[error("unsupported lock type: {0}")]
    UnsupportedLockType(String),

    /// Condition combines a field with an operation it does not support
    #[error("unsupported predicate {predicate} for field {field}")]
    UnsupportedPredicate { field: String, predicate: String },

    /// Condition value has the wrong type for its field
    #[error("type mismatch for field {field}: expected {expected} value")]
    TypeMismatch { field: String, expected: String },

    /// Compare-and-swap precondition failed or the reservation was lost
    #[error("update conflict: {0}")]
    Conflict(String),

    /// Network or transport failure talking to the backend
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LockError {
    /// Whether a caller can reasonably retry the failed operation.
    ///
    /// `AlreadyHeld` clears when the holder releases or its lease expires,
    /// `Conflict` when the competing writer finishes, `BackendUnavailable`
    /// when the transport recovers. Everything else is either a programming
    /// error or a corrupt record and retrying cannot help.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            LockError::AlreadyHeld { .. }
                | LockError::Conflict(_)
                | LockError::BackendUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for LockError {
    fn from(err: serde_json::Error) -> Self {
        LockError::Serialization(err.to_string())
    }
}

#[cfg(feature = "kube-backend")]
impl From<kube::Error> for LockError {
    fn from(err: kube::Error) -> Self {
        LockError::BackendUnavailable(format!("Kubernetes API error: {err}"))
    }
}
