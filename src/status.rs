//! Notification status records and their state machine.
//!
//! Records live in the shared store under `status:<notification_id>` as JSON.
//! Every write after the initial PENDING record is a compare-and-set against
//! the exact bytes that were read, so a stale writer can never overwrite a
//! terminal status.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::store::StatusStore,
    error::{StatusError, StoreError},
    models::{
        audit::StatusEvent,
        notification::NotificationEnvelope,
        status::{NotificationStatus, StatusRecord, StatusUpdate},
    },
};

const MAX_WRITE_ATTEMPTS: usize = 5;

/// Best-effort observer of status transitions.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn record(&self, event: &StatusEvent) -> Result<(), Error>;
}

pub struct NullStatusSink;

#[async_trait]
impl StatusSink for NullStatusSink {
    async fn record(&self, _event: &StatusEvent) -> Result<(), Error> {
        Ok(())
    }
}

pub fn status_key(notification_id: &str) -> String {
    format!("status:{}", notification_id)
}

#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn StatusStore>,
    sink: Arc<dyn StatusSink>,
    ttl: Duration,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn StatusStore>, sink: Arc<dyn StatusSink>, ttl: Duration) -> Self {
        Self { store, sink, ttl }
    }

    /// Writes the PENDING record for a freshly assembled envelope.
    pub async fn initialize(
        &self,
        envelope: &NotificationEnvelope,
    ) -> Result<StatusRecord, StoreError> {
        let record = StatusRecord::pending(
            envelope.notification_id.clone(),
            envelope.channel,
            envelope.user_id.clone(),
        );

        let value = encode(&record)?;
        self.store
            .put(&status_key(&record.notification_id), &value, self.ttl)
            .await?;

        self.emit(&record).await;
        Ok(record)
    }

    pub async fn get(&self, notification_id: &str) -> Result<Option<StatusRecord>, StatusError> {
        let key = status_key(notification_id);

        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    /// Moves a record to `update.status`.
    ///
    /// Fails with `NotFound` for unknown ids and `InvalidTransition` when the
    /// target is not a successor of the current state. Entering PROCESSING counts
    /// one delivery attempt. Supplied metadata is merged into the existing map.
    pub async fn apply(&self, update: StatusUpdate) -> Result<StatusRecord, StatusError> {
        let key = status_key(&update.notification_id);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| StatusError::NotFound(update.notification_id.clone()))?;
            let current = decode(&key, &raw)?;

            if !current.status.can_transition_to(update.status) {
                return Err(StatusError::InvalidTransition {
                    from: current.status,
                    to: update.status,
                });
            }

            let next = advance(current, &update);
            let value = encode(&next)?;

            if self
                .store
                .compare_and_set(&key, &raw, &value, self.ttl)
                .await?
            {
                debug!(
                    notification_id = %next.notification_id,
                    status = %next.status,
                    attempts = next.attempts,
                    "Status updated"
                );
                self.emit(&next).await;
                return Ok(next);
            }

            debug!(
                notification_id = %update.notification_id,
                "Concurrent status write detected, re-reading"
            );
        }

        Err(StatusError::Contention(update.notification_id))
    }

    /// Worker-side update. Failures are logged and swallowed so that a store
    /// outage never blocks delivery.
    pub async fn record(
        &self,
        notification_id: &str,
        status: NotificationStatus,
        error: Option<String>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Option<StatusRecord> {
        let mut update = StatusUpdate::new(notification_id, status);
        update.error = error;
        update.metadata = metadata;

        match self.apply(update).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    notification_id,
                    status = %status,
                    error = %e,
                    "Status update skipped"
                );
                None
            }
        }
    }

    /// Removes the record of a notification that was never published.
    pub async fn discard(&self, notification_id: &str) -> Result<(), StoreError> {
        self.store.delete(&status_key(notification_id)).await
    }

    async fn emit(&self, record: &StatusRecord) {
        if let Err(e) = self.sink.record(&StatusEvent::from_record(record)).await {
            warn!(
                notification_id = %record.notification_id,
                error = %e,
                "Failed to forward status event"
            );
        }
    }
}

fn advance(current: StatusRecord, update: &StatusUpdate) -> StatusRecord {
    let mut next = current;

    if update.status == NotificationStatus::Processing {
        next.attempts += 1;
    }

    next.status = update.status;
    next.updated_at = Utc::now();
    next.error = update.error.clone();

    if let Some(extra) = &update.metadata {
        next.metadata
            .get_or_insert_with(HashMap::new)
            .extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    next
}

fn encode(record: &StatusRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
        key: status_key(&record.notification_id),
        reason: e.to_string(),
    })
}

fn decode(key: &str, raw: &str) -> Result<StatusRecord, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
