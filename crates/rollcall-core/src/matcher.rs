//! Nearest-neighbour matching of a probe embedding against the roster.

use crate::types::{Embedding, Identity, MatchResult, RosterEntry};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("roster is empty")]
    EmptyRoster,
    #[error("embedding dimension mismatch: probe has {probe}, roster entry {name:?} has {entry}")]
    DimensionMismatch {
        probe: usize,
        entry: usize,
        name: String,
    },
}

/// Strategy for comparing a probe embedding against the roster.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        roster: &[RosterEntry],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Linear-scan Euclidean matcher.
///
/// Scans the whole roster; on equal distances the earliest entry wins.
/// A match requires `distance < threshold`.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        roster: &[RosterEntry],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in roster.iter().enumerate() {
            if entry.embedding.dimension() != probe.dimension() {
                return Err(MatchError::DimensionMismatch {
                    probe: probe.dimension(),
                    entry: entry.embedding.dimension(),
                    name: entry.name.clone(),
                });
            }
            let dist = probe.euclidean_distance(&entry.embedding);
            // Strict comparison keeps the first minimum on ties.
            if best.is_none_or(|(_, d)| dist < d) {
                best = Some((i, dist));
            }
        }

        let (idx, distance) = best.ok_or(MatchError::EmptyRoster)?;
        let identity = if distance < threshold {
            Identity::Known(roster[idx].name.clone())
        } else {
            Identity::Unidentified
        };

        Ok(MatchResult {
            identity,
            distance,
            nearest: idx,
        })
    }
}
