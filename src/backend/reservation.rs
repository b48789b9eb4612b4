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

//! Record reservation for stores without a native version-token CAS.
//!
//! Such stores get a read-modify-write window by annotating the record with
//! the reserving instance and a short expiry before computing the new
//! state. The reservation write itself rides on the store's weakest
//! concurrency check, and a lost race backs off and retries a bounded
//! number of times before surfacing [`LockError::Conflict`]. The expiry
//! bounds how long a crashed reserver can wedge the record.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::error::{LockError, LockResult};

/// Annotation naming the reserving instance.
pub const RESERVED_BY_KEY: &str = "reserved/by";
/// Annotation carrying the reservation expiry as an RFC3339 timestamp.
pub const RESERVED_EXPIRES_KEY: &str = "reserved/expires";

/// How long a reservation shields the record.
pub const RESERVATION_TTL: Duration = Duration::from_secs(30);
/// Reservation attempts before the operation fails with `Conflict`.
pub const RESERVE_ATTEMPTS: u32 = 5;
/// Backoff between reservation attempts.
pub const RESERVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Check whether the record can be reserved at `now`.
///
/// A missing or expired reservation is available; a live one is a
/// conflict. A reservation whose expiry does not parse never expires on
/// its own, so it is reported as a malformed record instead of a conflict
/// the caller would retry forever.
pub fn check_available(annotations: &BTreeMap<String, String>, now: DateTime<Utc>) -> LockResult<()> {
    let Some(holder) = annotations.get(RESERVED_BY_KEY) else {
        return Ok(());
    };
    let Some(raw_expires) = annotations.get(RESERVED_EXPIRES_KEY) else {
        return Err(LockError::InvariantViolation(format!(
            "reservation by {holder} has no expiry"
        )));
    };
    let expires = DateTime::parse_from_rfc3339(raw_expires)
        .map_err(|err| {
            LockError::InvariantViolation(format!(
                "reservation by {holder} has malformed expiry {raw_expires}: {err}"
            ))
        })?
        .with_timezone(&Utc);
    if now < expires {
        return Err(LockError::Conflict(format!(
            "record reserved by {holder} until {raw_expires}"
        )));
    }
    Ok(())
}

/// Stamp a fresh reservation for `instance_id` expiring at `now + TTL`.
pub fn stamp(annotations: &mut BTreeMap<String, String>, instance_id: &str, now: DateTime<Utc>) {
    annotations.insert(RESERVED_BY_KEY.to_string(), instance_id.to_string());
    annotations.insert(
        RESERVED_EXPIRES_KEY.to_string(),
        (now + RESERVATION_TTL).to_rfc3339_opts(SecondsFormat::Secs, true),
    );
}

/// Remove any reservation annotations.
pub fn clear(annotations: &mut BTreeMap<String, String>) {
    annotations.remove(RESERVED_BY_KEY);
    annotations.remove(RESERVED_EXPIRES_KEY);
}

/// Whether the current reservation belongs to `instance_id`.
pub fn held_by(annotations: &BTreeMap<String, String>, instance_id: &str) -> bool {
    annotations.get(RESERVED_BY_KEY).map(String::as_str) == Some(instance_id)
}

/// Drive `attempt` until it succeeds or the attempt budget is spent.
///
/// Only [`LockError::Conflict`] is retried; every other error aborts
/// immediately. The last conflict is returned once the budget runs out.
pub(crate) async fn retry<T, F, Fut>(attempts: u32, delay: Duration, mut attempt: F) -> LockResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LockResult<T>>,
{
    let mut last_conflict = None;
    for round in 0..attempts.max(1) {
        if round > 0 {
            tokio::time::sleep(delay).await;
        }
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err @ LockError::Conflict(_)) => {
                debug!(round = round + 1, attempts, error = %err, "reservation attempt lost, backing off");
                last_conflict = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_conflict
        .unwrap_or_else(|| LockError::Conflict("reservation attempts exhausted".to_string())))
}
