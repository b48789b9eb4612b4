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

//! Structured outcome reporting for lock handles.
//!
//! Every state-machine outcome is posted as an [`Event`] to a single
//! consumer. Delivery is synchronous into a bounded channel: emission
//! awaits channel capacity, and a consumer task started in the handle
//! constructor keeps the channel drained, so emission never blocks
//! application progress for longer than the consumer takes to log. If the
//! consumer is gone (handle cancelled and dropped), events are dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LockError;

/// Buffered events per handle before emission has to wait on the consumer.
pub(crate) const EVENT_BUFFER: usize = 32;

/// Outcome kind. The numeric code carries a class (2xx success, 5xx
/// failure) and a kind digit shared between the classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    RenewSuccessful,
    RenewFailed,
    ReleaseSuccessful,
    ReleaseFailed,
    AcquireSuccessful,
    AcquireFailed,
    MaintainStarted,
    MaintainStopped,
    Debug,
}

impl EventCode {
    pub fn code(self) -> u16 {
        match self {
            EventCode::RenewSuccessful => 211,
            EventCode::RenewFailed => 511,
            EventCode::ReleaseSuccessful => 212,
            EventCode::ReleaseFailed => 512,
            EventCode::AcquireSuccessful => 213,
            EventCode::AcquireFailed => 513,
            EventCode::MaintainStarted => 214,
            EventCode::MaintainStopped => 215,
            EventCode::Debug => 299,
        }
    }

    pub fn is_failure(self) -> bool {
        self.code() >= 500
    }
}

/// A single reported outcome.
#[derive(Debug, Clone)]
pub struct Event {
    pub code: EventCode,
    pub message: String,
    pub error: Option<LockError>,
}

/// Per-handle emission side of the event stream.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: Option<mpsc::Sender<Event>>,
    name: Arc<str>,
    instance_id: Arc<str>,
}

impl EventSink {
    pub(crate) fn new(tx: Option<mpsc::Sender<Event>>, name: &str, instance_id: &str) -> Self {
        EventSink {
            tx,
            name: name.into(),
            instance_id: instance_id.into(),
        }
    }

    async fn emit(&self, code: EventCode, verdict: &str, error: Option<LockError>) {
        let Some(tx) = &self.tx else { return };
        let event = Event {
            code,
            message: format!(
                "lock {} {} (instance {})",
                self.name, verdict, self.instance_id
            ),
            error,
        };
        if tx.send(event).await.is_err() {
            debug!(lock = %self.name, code = code.code(), "event consumer gone, dropping event");
        }
    }

    pub(crate) async fn acquire_successful(&self) {
        self.emit(EventCode::AcquireSuccessful, "acquire successful", None)
            .await;
    }

    pub(crate) async fn acquire_failed(&self, err: &LockError) {
        self.emit(EventCode::AcquireFailed, "acquire failed", Some(err.clone()))
            .await;
    }

    pub(crate) async fn renew_successful(&self) {
        self.emit(EventCode::RenewSuccessful, "renewal successful", None)
            .await;
    }

    pub(crate) async fn renew_failed(&self, err: &LockError) {
        self.emit(EventCode::RenewFailed, "renewal failed", Some(err.clone()))
            .await;
    }

    pub(crate) async fn release_successful(&self) {
        self.emit(EventCode::ReleaseSuccessful, "release successful", None)
            .await;
    }

    pub(crate) async fn release_failed(&self, err: &LockError) {
        self.emit(EventCode::ReleaseFailed, "release failed", Some(err.clone()))
            .await;
    }

    pub(crate) async fn maintain_started(&self) {
        self.emit(EventCode::MaintainStarted, "maintain loop started", None)
            .await;
    }

    pub(crate) async fn maintain_stopped(&self) {
        self.emit(EventCode::MaintainStopped, "maintain loop stopped", None)
            .await;
    }

    pub(crate) async fn debug(&self, detail: &str) {
        self.emit(EventCode::Debug, detail, None).await;
    }
}

/// Default consumer: logs every event through `tracing` and drains the
/// channel. Stops once the handle is cancelled (draining what is already
/// buffered) or once every sender is gone.
pub(crate) fn spawn_default_consumer(
    mut rx: mpsc::Receiver<Event>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        log_event(&event);
                    }
                    return;
                }
                event = rx.recv() => match event {
                    Some(event) => log_event(&event),
                    None => return,
                },
            }
        }
    })
}

fn log_event(event: &Event) {
    match &event.error {
        Some(err) if event.code.is_failure() => {
            warn!(code = event.code.code(), error = %err, "{}", event.message);
        }
        _ if event.code == EventCode::Debug => {
            debug!(code = event.code.code(), "{}", event.message);
        }
        _ => {
            info!(code = event.code.code(), "{}", event.message);
        }
    }
}
