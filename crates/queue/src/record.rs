//! Record store port: best-effort persistence of delivery outcomes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::PayloadRef;

use crate::transport::Confirmation;

/// Delivery status as seen by the durable, user-facing record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// An attempt is starting
    Sending,
    /// Delivered
    Sent,
    /// Attempt failed, another one is scheduled
    Retrying,
    /// Retries exhausted
    Failed,
}

/// Fields written to the external record after each step of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub status: RecordStatus,
    pub attempt: u32,
    pub error: Option<String>,
    pub confirmation: Option<Confirmation>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl RecordUpdate {
    pub fn sending(attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            status: RecordStatus::Sending,
            attempt,
            error: None,
            confirmation: None,
            next_attempt_at: None,
            at,
        }
    }

    pub fn sent(attempt: u32, confirmation: Confirmation, at: DateTime<Utc>) -> Self {
        Self {
            confirmation: Some(confirmation),
            ..Self::with_status(RecordStatus::Sent, attempt, at)
        }
    }

    pub fn retrying(
        attempt: u32,
        error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            next_attempt_at: Some(next_attempt_at),
            ..Self::with_status(RecordStatus::Retrying, attempt, at)
        }
    }

    pub fn failed(attempt: u32, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(RecordStatus::Failed, attempt, at)
        }
    }

    fn with_status(status: RecordStatus, attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            status,
            ..Self::sending(attempt, at)
        }
    }
}

/// Record store error. Never affects scheduling; the executor only logs it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordStoreError {
    #[error("record not found: {0}")]
    NotFound(PayloadRef),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record store write timed out after {0:?}")]
    Timeout(Duration),
}

/// Durable store of user-facing delivery records.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn update_record(
        &self,
        payload_ref: &PayloadRef,
        update: RecordUpdate,
    ) -> Result<(), RecordStoreError>;
}

/// Record store that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecordStore;

#[async_trait]
impl RecordStore for NoopRecordStore {
    async fn update_record(
        &self,
        _payload_ref: &PayloadRef,
        _update: RecordUpdate,
    ) -> Result<(), RecordStoreError> {
        Ok(())
    }
}

/// In-memory record store for tests/dev; keeps every update in order.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    updates: Mutex<HashMap<PayloadRef, Vec<RecordUpdate>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All updates written for `payload_ref`, oldest first.
    pub fn updates_for(&self, payload_ref: &PayloadRef) -> Vec<RecordUpdate> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(payload_ref)
            .cloned()
            .unwrap_or_default()
    }

    pub fn latest(&self, payload_ref: &PayloadRef) -> Option<RecordUpdate> {
        self.updates_for(payload_ref).pop()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn update_record(
        &self,
        payload_ref: &PayloadRef,
        update: RecordUpdate,
    ) -> Result<(), RecordStoreError> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(payload_ref.clone())
            .or_default()
            .push(update);
        Ok(())
    }
}
