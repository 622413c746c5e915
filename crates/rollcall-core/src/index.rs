//! In-memory nearest-neighbour index over enrolled subjects.
//!
//! The index is an immutable snapshot behind an `Arc`. `load_index` swaps
//! the whole snapshot, so a concurrent `match_nearest` sees either the old
//! or the new set of subjects, never a mixture.

use crate::repository::{Repository, RepositoryError};
use crate::types::{Encoding, SubjectId, SubjectRecord};
use std::sync::{Arc, PoisonError, RwLock};

/// Result of a nearest-neighbour search.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// No subjects are indexed.
    Empty,
    /// No indexed encoding has the probe's length (or the probe is empty).
    NonComparable,
    Nearest(NearestMatch),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearestMatch {
    pub subject_id: SubjectId,
    pub display_name: String,
    pub distance: f32,
    /// `distance < threshold`.
    pub accepted: bool,
}

impl MatchOutcome {
    /// The nearest match, only if it clears the threshold.
    pub fn accepted(&self) -> Option<&NearestMatch> {
        match self {
            MatchOutcome::Nearest(m) if m.accepted => Some(m),
            _ => None,
        }
    }
}

pub struct MatchIndex {
    threshold: f32,
    snapshot: RwLock<Arc<Vec<SubjectRecord>>>,
}

impl MatchIndex {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Replace the indexed subjects wholesale. Returns the new size.
    pub fn load_index(&self, subjects: Vec<SubjectRecord>) -> usize {
        let count = subjects.len();
        let next = Arc::new(subjects);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = next;
        tracing::debug!(subjects = count, "match index replaced");
        count
    }

    /// Reload from the repository. On failure the current snapshot is kept.
    pub fn reload_from(&self, repository: &dyn Repository) -> Result<usize, RepositoryError> {
        match repository.subject_encodings() {
            Ok(subjects) => Ok(self.load_index(subjects)),
            Err(e) => {
                tracing::warn!(error = %e, kept = self.len(), "index reload failed; keeping previous subjects");
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    /// Find the closest indexed subject.
    ///
    /// The nearest result is returned even when it does not clear the
    /// threshold. On exactly equal distances the earlier entry in index
    /// order wins.
    pub fn match_nearest(&self, probe: &Encoding) -> MatchOutcome {
        let snapshot = self.current();
        if snapshot.is_empty() {
            return MatchOutcome::Empty;
        }

        let mut best: Option<(&SubjectRecord, f32)> = None;
        for record in snapshot.iter() {
            let Some(distance) = probe.distance(&record.encoding) else {
                continue;
            };
            match best {
                Some((_, d)) if d <= distance => {}
                _ => best = Some((record, distance)),
            }
        }

        match best {
            None => MatchOutcome::NonComparable,
            Some((record, distance)) => MatchOutcome::Nearest(NearestMatch {
                subject_id: record.id,
                display_name: record.display_name.clone(),
                distance,
                accepted: distance < self.threshold,
            }),
        }
    }

    fn current(&self) -> Arc<Vec<SubjectRecord>> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }
}
