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

//! Kubernetes ConfigMap driver (cluster object-store flavor).
//!
//! ## Purpose
//! Stores each lock as a namespaced ConfigMap named `<prefix>-<name>` whose
//! `lock` data key carries the JSON-encoded record. ConfigMaps have no
//! caller-visible version-token precondition usable across the whole
//! read-modify-write, so the driver reserves the object with the
//! annotations from [`crate::backend::reservation`] before computing the
//! new state, and clears them in the write that commits it. The
//! reservation write itself rides on the object's `resourceVersion`, so a
//! lost race is detected instead of clobbered.
//!
//! Objects are labeled `lockheed/lock` for enumeration.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use tracing::{debug, instrument};

use super::reservation;
use super::{Driver, LockState, StateHandle};
use crate::error::{LockError, LockResult};
use crate::record::LockRecord;

/// Default ConfigMap name prefix.
pub const DEFAULT_PREFIX: &str = "lockheed";
/// Label marking ConfigMaps enumerable as lock records.
pub const LOCK_LABEL: &str = "lockheed/lock";

const LOCK_DATA_KEY: &str = "lock";

/// Kubernetes-backed lock driver.
#[derive(Clone)]
pub struct KubeDriver {
    api: Api<ConfigMap>,
    prefix: String,
    reserve_attempts: u32,
    reserve_delay: std::time::Duration,
}

impl KubeDriver {
    pub fn new(client: Client, namespace: &str) -> Self {
        KubeDriver {
            api: Api::namespaced(client, namespace),
            prefix: DEFAULT_PREFIX.to_string(),
            reserve_attempts: reservation::RESERVE_ATTEMPTS,
            reserve_delay: reservation::RESERVE_RETRY_DELAY,
        }
    }

    /// Override the ConfigMap name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn object_name(&self, name: &str) -> String {
        format!("{}-{}", self.prefix, name)
    }

    async fn ensure_exists(&self, name: &str) -> LockResult<()> {
        let object_name = self.object_name(name);
        match self.api.get(&object_name).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {}
            Err(err) => return Err(err.into()),
        }

        let payload = serde_json::to_string(&LockRecord::named(name))?;
        let cmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(object_name.clone()),
                labels: Some(BTreeMap::from([(LOCK_LABEL.to_string(), String::new())])),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(LOCK_DATA_KEY.to_string(), payload)])),
            ..ConfigMap::default()
        };
        match self.api.create(&PostParams::default(), &cmap).await {
            Ok(_) => Ok(()),
            // created concurrently
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// One reservation round: read, check, stamp, write under the object's
    /// resourceVersion. A lost write races back as `Conflict` for the
    /// retry loop.
    async fn try_reserve_once(&self, object_name: &str, instance_id: &str) -> LockResult<ConfigMap> {
        let mut cmap = self.api.get(object_name).await?;
        let annotations = cmap.metadata.annotations.get_or_insert_with(BTreeMap::new);
        reservation::check_available(annotations, chrono::Utc::now())?;
        reservation::stamp(annotations, instance_id, chrono::Utc::now());
        match self.api.replace(object_name, &PostParams::default(), &cmap).await {
            Ok(reserved) => Ok(reserved),
            Err(kube::Error::Api(response)) if response.code == 409 => Err(LockError::Conflict(
                format!("reservation write for {object_name} lost"),
            )),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Driver for KubeDriver {
    #[instrument(skip(self), fields(lock = %name))]
    async fn read_state(&self, name: &str, instance_id: &str) -> LockResult<LockState> {
        self.ensure_exists(name).await?;
        let object_name = self.object_name(name);
        let cmap = reservation::retry(self.reserve_attempts, self.reserve_delay, || {
            self.try_reserve_once(&object_name, instance_id)
        })
        .await?;

        let payload = cmap
            .data
            .as_ref()
            .and_then(|data| data.get(LOCK_DATA_KEY))
            .cloned();
        let handle = Box::new(KubeStateHandle {
            api: self.api.clone(),
            object_name: object_name.clone(),
            instance_id: instance_id.to_string(),
            cmap,
        });
        let record: LockRecord = match payload {
            Some(payload) => match serde_json::from_str(&payload) {
                Ok(record) => record,
                Err(err) => {
                    // the reservation must not survive our failure to parse
                    let _ = handle.abort().await;
                    return Err(err.into());
                }
            },
            None => {
                let _ = handle.abort().await;
                return Err(LockError::InvariantViolation(format!(
                    "ConfigMap {object_name} has no lock payload"
                )));
            }
        };
        Ok(LockState::new(record, handle))
    }

    #[instrument(skip(self))]
    async fn list_records(&self) -> LockResult<Vec<LockRecord>> {
        let params = ListParams::default().labels(LOCK_LABEL);
        let objects = self.api.list(&params).await?;
        let mut result = Vec::with_capacity(objects.items.len());
        for cmap in objects.items {
            let Some(payload) = cmap.data.as_ref().and_then(|data| data.get(LOCK_DATA_KEY)) else {
                debug!(object = ?cmap.metadata.name, "skipping labeled ConfigMap without lock payload");
                continue;
            };
            result.push(serde_json::from_str(payload)?);
        }
        Ok(result)
    }
}

struct KubeStateHandle {
    api: Api<ConfigMap>,
    object_name: String,
    instance_id: String,
    cmap: ConfigMap,
}

#[async_trait]
impl StateHandle for KubeStateHandle {
    async fn commit(mut self: Box<Self>, record: &LockRecord) -> LockResult<()> {
        let payload = serde_json::to_string(record)?;
        self.cmap
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(LOCK_DATA_KEY.to_string(), payload);
        // clearing the reservation rides in the same write as the payload
        if let Some(annotations) = self.cmap.metadata.annotations.as_mut() {
            reservation::clear(annotations);
        }
        match self
            .api
            .replace(&self.object_name, &PostParams::default(), &self.cmap)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(LockError::Conflict(format!(
                    "reservation on {} expired and was taken over",
                    self.object_name
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn abort(self: Box<Self>) -> LockResult<()> {
        let mut cmap = self.cmap;
        for _ in 0..2 {
            let Some(annotations) = cmap.metadata.annotations.as_mut() else {
                return Ok(());
            };
            if !reservation::held_by(annotations, &self.instance_id) {
                return Ok(());
            }
            reservation::clear(annotations);
            match self
                .api
                .replace(&self.object_name, &PostParams::default(), &cmap)
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(response)) if response.code == 409 => {
                    cmap = self.api.get(&self.object_name).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        // someone re-stamped under us; their reservation is theirs to clear
        Ok(())
    }
}
