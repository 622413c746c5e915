//! Per-subject cooldown between accepted attendance events.
//!
//! The in-memory map is a warm cache. When a subject has no entry the
//! repository's most recent event seeds it, so a restart keeps cooldowns.

use crate::repository::Repository;
use crate::types::SubjectId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted { at: DateTime<Utc> },
    Rejected { remaining: Duration },
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted { .. })
    }
}

pub struct CooldownGate {
    window: Duration,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<SubjectId, DateTime<Utc>>>,
}

impl CooldownGate {
    pub fn new(window: Duration, repository: Arc<dyn Repository>) -> Self {
        Self::with_clock(window, repository, Arc::new(SystemClock))
    }

    pub fn with_clock(
        window: Duration,
        repository: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            window,
            repository,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_in_cooldown(&self, subject_id: SubjectId) -> bool {
        self.remaining(subject_id).is_some()
    }

    /// Time left before the subject can be accepted again, or `None` if
    /// it can be accepted now.
    pub fn remaining(&self, subject_id: SubjectId) -> Option<Duration> {
        self.warm(subject_id);
        let now = self.clock.now();
        let entries = self.entries();
        entries
            .get(&subject_id)
            .and_then(|last| self.left_in_window(*last, now))
    }

    /// Accept the subject if its window has elapsed, recording `now` as the
    /// last accepted time before returning.
    ///
    /// The check and the update happen under one lock, so of two concurrent
    /// calls for the same subject at most one is accepted.
    pub fn try_accept(&self, subject_id: SubjectId) -> Admission {
        self.warm(subject_id);
        let now = self.clock.now();
        let mut entries = self.entries();
        if let Some(remaining) = entries
            .get(&subject_id)
            .and_then(|last| self.left_in_window(*last, now))
        {
            return Admission::Rejected { remaining };
        }
        entries.insert(subject_id, now);
        Admission::Accepted { at: now }
    }

    /// Forget the in-memory entry. The next check falls back to the repository.
    pub fn reset(&self, subject_id: SubjectId) {
        if self.entries().remove(&subject_id).is_some() {
            tracing::info!(subject = %subject_id, "cooldown reset");
        }
    }

    fn left_in_window(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
        let elapsed = now.signed_duration_since(last);
        if elapsed >= self.window {
            None
        } else {
            Some(self.window - elapsed)
        }
    }

    /// Seed a missing entry from the repository. The lookup runs without
    /// the lock held; an entry inserted meanwhile by another caller wins.
    fn warm(&self, subject_id: SubjectId) {
        if self.entries().contains_key(&subject_id) {
            return;
        }
        match self.repository.last_event_timestamp(subject_id) {
            Ok(Some(last)) => {
                self.entries().entry(subject_id).or_insert(last);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    subject = %subject_id,
                    error = %e,
                    "cooldown history unavailable; using in-memory state only"
                );
            }
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SubjectId, DateTime<Utc>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
