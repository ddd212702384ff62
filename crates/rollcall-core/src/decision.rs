//! Match Decision Engine.
//!
//! Owns one state machine per visible face track. Per-frame gallery matches
//! are noisy (pose, lighting, motion blur), so identity only changes after a
//! run of consecutive agreeing frames:
//!
//! ```text
//!            confirm_run matches               holdout_run misses
//!  PENDING ───────────────────────▶ CONFIRMED ─────────────────────▶ UNKNOWN
//!     │                                 ▲                               │
//!     └──────── holdout_run misses ─────┼───────────────────────────────┘
//!                                       └──── confirm_run matches ──────┘
//! ```
//!
//! Frames must arrive in timestamp order; the engine is single-threaded.

use crate::gallery::{Nearest, SharedGallery};
use crate::types::{Embedding, FaceRegion, PersonId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecisionError {
    #[error("frame at {timestamp_ms} ms is older than the last processed frame ({last_ms} ms)")]
    StaleFrame { timestamp_ms: u64, last_ms: u64 },
}

/// Deployment-tunable decision thresholds. None of the defaults are
/// calibrated; tune them against real footage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// A gallery distance at or below this counts as a match.
    pub match_threshold: f32,
    /// Consecutive matching frames needed to confirm an identity.
    pub confirm_run: u32,
    /// Consecutive non-matching frames needed to declare a track unknown.
    pub holdout_run: u32,
    /// Tracks unseen for longer than this are destroyed.
    pub track_timeout_ms: u64,
    /// Maximum centre displacement (pixels) for associating a region with a track.
    pub max_displacement_px: f32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            confirm_run: 3,
            holdout_run: 2,
            track_timeout_ms: 2_000,
            max_displacement_px: 120.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackStatus {
    /// Not enough evidence yet.
    Pending,
    Confirmed(PersonId),
    Unknown,
}

/// Evolving state of one observed face.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub status: TrackStatus,
    /// Identity the current match run is counting toward.
    pub candidate: Option<PersonId>,
    pub match_run: u32,
    pub miss_run: u32,
    pub last_seen_ms: u64,
    pub center: (f32, f32),
}

impl Track {
    fn new(id: u64, timestamp_ms: u64, center: (f32, f32)) -> Self {
        Self {
            id,
            status: TrackStatus::Pending,
            candidate: None,
            match_run: 0,
            miss_run: 0,
            last_seen_ms: timestamp_ms,
            center,
        }
    }

    /// Fold one gallery result into the run counters.
    ///
    /// Returns the person when this frame newly confirms them.
    fn apply(&mut self, nearest: Option<&Nearest>, config: &DecisionConfig) -> Option<PersonId> {
        match nearest {
            Some(hit) if hit.distance <= config.match_threshold => {
                self.miss_run = 0;
                if self.candidate.as_ref() == Some(&hit.person_id) {
                    self.match_run = self.match_run.saturating_add(1);
                } else {
                    // No partial credit across identities
                    self.candidate = Some(hit.person_id.clone());
                    self.match_run = 1;
                }

                let already = matches!(&self.status, TrackStatus::Confirmed(p) if *p == hit.person_id);
                if self.match_run >= config.confirm_run.max(1) && !already {
                    self.status = TrackStatus::Confirmed(hit.person_id.clone());
                    return Some(hit.person_id.clone());
                }
                None
            }
            _ => {
                self.candidate = None;
                self.match_run = 0;
                self.miss_run = self.miss_run.saturating_add(1);
                if self.miss_run >= config.holdout_run.max(1) && self.status != TrackStatus::Unknown {
                    tracing::debug!(track = self.id, previous = ?self.status, "track became unknown");
                    self.status = TrackStatus::Unknown;
                }
                None
            }
        }
    }
}

/// A located face together with its embedding.
#[derive(Debug, Clone)]
pub struct Observation {
    pub region: FaceRegion,
    pub embedding: Embedding,
}

/// Per-track outcome of one frame.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub track_id: u64,
    pub status: TrackStatus,
    pub nearest: Option<Nearest>,
}

/// A track that reached `Confirmed` on this frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub track_id: u64,
    pub person_id: PersonId,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FrameDecisions {
    pub verdicts: Vec<Verdict>,
    pub confirmations: Vec<Confirmation>,
    /// Tracks destroyed by timeout before this frame was applied.
    pub expired: Vec<u64>,
}

pub struct DecisionEngine {
    config: DecisionConfig,
    gallery: SharedGallery,
    tracks: BTreeMap<u64, Track>,
    next_track_id: u64,
    last_frame_ms: Option<u64>,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig, gallery: SharedGallery) -> Self {
        Self {
            config,
            gallery,
            tracks: BTreeMap::new(),
            next_track_id: 1,
            last_frame_ms: None,
        }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn track(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    fn check_order(&mut self, timestamp_ms: u64) -> Result<(), DecisionError> {
        if let Some(last_ms) = self.last_frame_ms {
            if timestamp_ms < last_ms {
                return Err(DecisionError::StaleFrame { timestamp_ms, last_ms });
            }
        }
        self.last_frame_ms = Some(timestamp_ms);
        Ok(())
    }

    /// Destroy tracks unseen for longer than the timeout.
    ///
    /// Call this for frames that produced no analysis so tracks still age.
    pub fn expire(&mut self, now_ms: u64) -> Result<Vec<u64>, DecisionError> {
        self.check_order(now_ms)?;
        Ok(self.collect_expired(now_ms))
    }

    fn collect_expired(&mut self, now_ms: u64) -> Vec<u64> {
        let timeout = self.config.track_timeout_ms;
        let expired: Vec<u64> = self
            .tracks
            .values()
            .filter(|t| now_ms.saturating_sub(t.last_seen_ms) > timeout)
            .map(|t| t.id)
            .collect();
        for id in &expired {
            if let Some(track) = self.tracks.remove(id) {
                tracing::debug!(track = id, status = ?track.status, "track timed out");
            }
        }
        expired
    }

    /// Apply one frame's observations.
    pub fn observe(&mut self, timestamp_ms: u64, observations: Vec<Observation>) -> Result<FrameDecisions, DecisionError> {
        self.check_order(timestamp_ms)?;
        let expired = self.collect_expired(timestamp_ms);

        // Match first so regions the gallery rejects never touch a track
        let mut matched: Vec<(FaceRegion, Option<Nearest>)> = Vec::with_capacity(observations.len());
        for obs in observations {
            match self.gallery.nearest(&obs.embedding) {
                Ok(nearest) => matched.push((obs.region, nearest)),
                Err(e) => tracing::warn!(error = %e, "dropping observation rejected by gallery"),
            }
        }

        let assignments = self.associate(&matched);
        let mut decisions = FrameDecisions {
            expired,
            ..FrameDecisions::default()
        };

        for (idx, (region, nearest)) in matched.into_iter().enumerate() {
            let track_id = match assignments[idx] {
                Some(id) => id,
                None => self.spawn_track(timestamp_ms, region.bbox.center()),
            };
            let Some(track) = self.tracks.get_mut(&track_id) else {
                continue;
            };

            track.last_seen_ms = timestamp_ms;
            track.center = region.bbox.center();
            if let Some(person_id) = track.apply(nearest.as_ref(), &self.config) {
                tracing::info!(track = track_id, person = %person_id, "identity confirmed");
                decisions.confirmations.push(Confirmation {
                    track_id,
                    person_id,
                    timestamp_ms,
                });
            }
            decisions.verdicts.push(Verdict {
                track_id,
                status: track.status.clone(),
                nearest,
            });
        }

        Ok(decisions)
    }

    /// Greedy nearest-centroid association.
    ///
    /// Tracks, oldest first, each claim the closest unclaimed region whose
    /// centre lies within `max_displacement_px` of the track's last centre.
    /// Returns the claiming track per region index.
    fn associate(&self, matched: &[(FaceRegion, Option<Nearest>)]) -> Vec<Option<u64>> {
        let mut assigned: Vec<Option<u64>> = vec![None; matched.len()];

        for track in self.tracks.values() {
            let best = matched
                .iter()
                .enumerate()
                .filter(|(idx, _)| assigned[*idx].is_none())
                .map(|(idx, (region, _))| {
                    let (cx, cy) = region.bbox.center();
                    let dist = ((cx - track.center.0).powi(2) + (cy - track.center.1).powi(2)).sqrt();
                    (idx, dist)
                })
                .filter(|(_, dist)| *dist <= self.config.max_displacement_px)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            if let Some((idx, _)) = best {
                assigned[idx] = Some(track.id);
            }
        }

        assigned
    }

    fn spawn_track(&mut self, timestamp_ms: u64, center: (f32, f32)) -> u64 {
        let id = self.next_track_id;
        self.next_track_id += 1;
        self.tracks.insert(id, Track::new(id, timestamp_ms, center));
        tracing::debug!(track = id, x = center.0, y = center.1, "new track");
        id
    }
}
