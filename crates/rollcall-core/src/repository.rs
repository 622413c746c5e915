//! Boundaries to the external store and the attendance sink.
//!
//! The core never owns a schema. It reads enrolled subjects and the last
//! event time per subject, and hands accepted events to a sink.

use crate::types::{AttendanceEvent, SubjectId, SubjectRecord};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("repository query failed: {0}")]
    Query(String),
}

pub trait Repository: Send + Sync {
    /// Every enrolled subject with its stored encoding, in stable id order.
    fn subject_encodings(&self) -> Result<Vec<SubjectRecord>, RepositoryError>;

    /// Most recent recorded attendance time for the subject, if any.
    fn last_event_timestamp(
        &self,
        subject_id: SubjectId,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError>;

    fn record_event(&self, event: &AttendanceEvent) -> Result<(), RepositoryError>;
}

/// Receives accepted attendance events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AttendanceEvent);
}
