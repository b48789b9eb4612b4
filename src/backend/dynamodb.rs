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

//! DynamoDB driver (document-store flavor).
//!
//! ## Purpose
//! Stores each lock as one item whose `lock` attribute carries the
//! JSON-encoded record, guarded by a `version` attribute that every commit
//! checks with a conditional write and rotates. The version token is this
//! driver's private concurrency primitive; no reservation is needed.
//!
//! ## Table schema
//! ```text
//! Partition key: pk = lock name (String)
//! Attributes:
//!   - lock: String (JSON-encoded record)
//!   - version: String (ULID, rotated on every write)
//! ```
//! The table is created on initialization if it does not exist
//! (PAY_PER_REQUEST, idempotent).

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::ProvideErrorMetadata,
    types::{
        AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
        ScalarAttributeType, TableStatus,
    },
    Client as DynamoDbClient,
};
use tracing::{debug, instrument, warn};
use ulid::Ulid;

use super::{Driver, LockState, StateHandle};
use crate::error::{LockError, LockResult};
use crate::record::LockRecord;

const PK_ATTR: &str = "pk";
const LOCK_ATTR: &str = "lock";
const VERSION_ATTR: &str = "version";

/// DynamoDB-backed lock driver.
#[derive(Clone)]
pub struct DynamoDbDriver {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoDbDriver {
    /// Connect and ensure the lock table exists.
    ///
    /// `endpoint_url` points the client at DynamoDB Local for testing;
    /// `None` uses the regular AWS endpoint resolution.
    #[instrument(skip(region, table_name, endpoint_url), fields(table_name = %table_name))]
    pub async fn new(
        region: String,
        table_name: String,
        endpoint_url: Option<String>,
    ) -> LockResult<Self> {
        let start_time = std::time::Instant::now();

        let mut config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));
        if let Some(endpoint) = endpoint_url {
            config_builder = config_builder.endpoint_url(endpoint);
        }
        let config = config_builder.load().await;
        let client = DynamoDbClient::new(&config);

        Self::ensure_table_exists(&client, &table_name).await?;

        metrics::histogram!("lockheed_ddb_init_duration_seconds")
            .record(start_time.elapsed().as_secs_f64());

        Ok(Self { client, table_name })
    }

    /// Driver over an already-configured client and existing table.
    pub fn with_client(client: DynamoDbClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    #[instrument(skip(client), fields(table_name = %table_name))]
    async fn ensure_table_exists(client: &DynamoDbClient, table_name: &str) -> LockResult<()> {
        match client.describe_table().table_name(table_name).send().await {
            Ok(_) => {
                debug!(table_name = %table_name, "DynamoDB table already exists");
                return Ok(());
            }
            Err(e) => {
                let code = e.code().unwrap_or("unknown");
                if code != "ResourceNotFoundException" {
                    return Err(LockError::BackendUnavailable(format!(
                        "failed to check table existence: {} (code: {code})",
                        e.message().unwrap_or("no message")
                    )));
                }
            }
        }

        debug!(table_name = %table_name, "creating DynamoDB lock table");

        let pk_key_schema = KeySchemaElement::builder()
            .attribute_name(PK_ATTR)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| LockError::BackendUnavailable(format!("failed to build key schema: {e}")))?;
        let pk_attr = AttributeDefinition::builder()
            .attribute_name(PK_ATTR)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| {
                LockError::BackendUnavailable(format!("failed to build attribute definition: {e}"))
            })?;

        let create_result = client
            .create_table()
            .table_name(table_name)
            .billing_mode(BillingMode::PayPerRequest)
            .key_schema(pk_key_schema)
            .attribute_definitions(pk_attr)
            .send()
            .await;

        match create_result {
            Ok(_) => Self::wait_for_table_active(client, table_name).await,
            Err(e) if e.to_string().contains("ResourceInUseException") => {
                // created concurrently
                Self::wait_for_table_active(client, table_name).await
            }
            Err(e) => Err(LockError::BackendUnavailable(format!(
                "failed to create DynamoDB table: {e}"
            ))),
        }
    }

    async fn wait_for_table_active(client: &DynamoDbClient, table_name: &str) -> LockResult<()> {
        let max_attempts = 30;
        for _ in 0..max_attempts {
            let describe = client
                .describe_table()
                .table_name(table_name)
                .send()
                .await
                .map_err(|e| {
                    LockError::BackendUnavailable(format!("failed to describe table: {e}"))
                })?;
            match describe.table().and_then(|t| t.table_status()) {
                Some(TableStatus::Active) => return Ok(()),
                Some(TableStatus::Creating) => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                status => {
                    return Err(LockError::BackendUnavailable(format!(
                        "table in unexpected status: {status:?}"
                    )))
                }
            }
        }
        Err(LockError::BackendUnavailable(format!(
            "table creation timeout after {max_attempts} attempts"
        )))
    }

    fn record_from_item(
        item: &std::collections::HashMap<String, AttributeValue>,
    ) -> LockResult<(LockRecord, String)> {
        let payload = item
            .get(LOCK_ATTR)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| {
                LockError::InvariantViolation("item missing lock attribute".to_string())
            })?;
        let version = item
            .get(VERSION_ATTR)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| {
                LockError::InvariantViolation("item missing version attribute".to_string())
            })?;
        Ok((serde_json::from_str(payload)?, version.clone()))
    }

    /// Create the record on first contact. Loses gracefully to a
    /// concurrent creator; the follow-up read picks up whichever item won.
    async fn create_record(&self, name: &str) -> LockResult<()> {
        let payload = serde_json::to_string(&LockRecord::named(name))?;
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(PK_ATTR, AttributeValue::S(name.to_string()))
            .item(LOCK_ATTR, AttributeValue::S(payload))
            .item(VERSION_ATTR, AttributeValue::S(Ulid::new().to_string()))
            .condition_expression("attribute_not_exists(pk)")
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_conditional_check_failed_exception() {
                    debug!(lock = %name, "record created concurrently");
                    Ok(())
                } else {
                    Err(LockError::BackendUnavailable(format!(
                        "DynamoDB put_item failed: {service_err}"
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl Driver for DynamoDbDriver {
    #[instrument(skip(self), fields(lock = %name))]
    async fn read_state(&self, name: &str, _instance_id: &str) -> LockResult<LockState> {
        for _ in 0..2 {
            let response = self
                .client
                .get_item()
                .table_name(&self.table_name)
                .key(PK_ATTR, AttributeValue::S(name.to_string()))
                .consistent_read(true)
                .send()
                .await
                .map_err(|e| {
                    LockError::BackendUnavailable(format!("DynamoDB get_item failed: {e}"))
                })?;

            match response.item() {
                Some(item) => {
                    let (record, version) = Self::record_from_item(item)?;
                    return Ok(LockState::new(
                        record,
                        Box::new(DynamoDbStateHandle {
                            client: self.client.clone(),
                            table_name: self.table_name.clone(),
                            name: name.to_string(),
                            expected_version: version,
                        }),
                    ));
                }
                None => self.create_record(name).await?,
            }
        }
        Err(LockError::BackendUnavailable(format!(
            "record for {name} not readable after creation"
        )))
    }

    #[instrument(skip(self))]
    async fn list_records(&self) -> LockResult<Vec<LockRecord>> {
        let mut result = Vec::new();
        let mut stream = self
            .client
            .scan()
            .table_name(&self.table_name)
            .into_paginator()
            .items()
            .send();
        while let Some(item) = stream.next().await {
            let item = item.map_err(|e| {
                LockError::BackendUnavailable(format!("DynamoDB scan failed: {e}"))
            })?;
            let (record, _version) = Self::record_from_item(&item)?;
            result.push(record);
        }
        Ok(result)
    }
}

struct DynamoDbStateHandle {
    client: DynamoDbClient,
    table_name: String,
    name: String,
    expected_version: String,
}

#[async_trait]
impl StateHandle for DynamoDbStateHandle {
    async fn commit(self: Box<Self>, record: &LockRecord) -> LockResult<()> {
        let payload = serde_json::to_string(record)?;
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(PK_ATTR, AttributeValue::S(self.name.clone()))
            .item(LOCK_ATTR, AttributeValue::S(payload))
            .item(VERSION_ATTR, AttributeValue::S(Ulid::new().to_string()))
            .condition_expression("version = :expected")
            .expression_attribute_values(
                ":expected",
                AttributeValue::S(self.expected_version.clone()),
            )
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_conditional_check_failed_exception() {
                    metrics::counter!("lockheed_ddb_commit_conflicts_total").increment(1);
                    Err(LockError::Conflict(format!(
                        "version token stale for {}",
                        self.name
                    )))
                } else {
                    warn!(lock = %self.name, error = %service_err, "DynamoDB commit failed");
                    Err(LockError::BackendUnavailable(format!(
                        "DynamoDB put_item failed: {service_err}"
                    )))
                }
            }
        }
    }

    async fn abort(self: Box<Self>) -> LockResult<()> {
        // version-token flavor holds nothing between read and commit
        Ok(())
    }
}
