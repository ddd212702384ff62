//! Pipeline stages.
//!
//! [`Analyzer`] is the heavy, parallelizable half (locate + embed); it owns
//! model sessions and may run on worker threads. [`Session`] is the ordered,
//! single-threaded half (decide + record).

use crate::decision::{DecisionEngine, FrameDecisions, Observation};
use crate::detector::FaceLocator;
use crate::extractor::EmbeddingExtractor;
use crate::recorder::{AttendanceEvent, AttendanceRecorder, SessionWindow};
use crate::types::{Embedding, FaceRegion, Frame};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of analyzing one frame.
#[derive(Debug)]
pub enum FrameAnalysis {
    Observed {
        timestamp_ms: u64,
        observations: Vec<Observation>,
    },
    /// The locator failed; the frame is skipped, never retried.
    DetectorUnavailable { timestamp_ms: u64, reason: String },
}

impl FrameAnalysis {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Self::Observed { timestamp_ms, .. } | Self::DetectorUnavailable { timestamp_ms, .. } => *timestamp_ms,
        }
    }
}

/// Best face found in an enrollment image.
#[derive(Debug)]
pub struct EnrollSample {
    pub embedding: Embedding,
    pub region: FaceRegion,
}

pub struct Analyzer<L, E> {
    locator: L,
    extractor: E,
    min_confidence: f32,
}

impl<L: FaceLocator, E: EmbeddingExtractor> Analyzer<L, E> {
    /// `min_confidence`: regions must score strictly above this to be embedded.
    pub fn new(locator: L, extractor: E, min_confidence: f32) -> Self {
        Self {
            locator,
            extractor,
            min_confidence,
        }
    }

    fn confident_regions(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, String> {
        let regions = self.locator.locate(frame).map_err(|e| e.to_string())?;
        let total = regions.len();
        let kept: Vec<FaceRegion> = regions
            .into_iter()
            .filter(|r| r.confidence > self.min_confidence)
            .collect();
        if kept.len() < total {
            tracing::debug!(dropped = total - kept.len(), "regions below minimum confidence");
        }
        Ok(kept)
    }

    /// Locate and embed every confident face. Consumes the frame.
    pub fn analyze(&mut self, frame: Frame) -> FrameAnalysis {
        let timestamp_ms = frame.timestamp_ms;
        let regions = match self.confident_regions(&frame) {
            Ok(regions) => regions,
            Err(reason) => {
                tracing::warn!(seq = frame.sequence, %reason, "face locator unavailable; skipping frame");
                return FrameAnalysis::DetectorUnavailable { timestamp_ms, reason };
            }
        };

        let mut observations = Vec::with_capacity(regions.len());
        for region in regions {
            match self.extractor.embed(&frame, &region) {
                Ok(embedding) => observations.push(Observation { region, embedding }),
                Err(e) => tracing::warn!(seq = frame.sequence, error = %e, "dropping region"),
            }
        }

        FrameAnalysis::Observed {
            timestamp_ms,
            observations,
        }
    }

    /// Embedding of the most confident face, for enrollment.
    pub fn enroll_sample(&mut self, frame: &Frame) -> Result<Option<EnrollSample>, String> {
        let regions = self.confident_regions(frame)?;
        // Locator output is sorted; fall through to the next face if the best crop fails
        for region in regions {
            match self.extractor.embed(frame, &region) {
                Ok(embedding) => return Ok(Some(EnrollSample { embedding, region })),
                Err(e) => tracing::warn!(error = %e, "enrollment candidate rejected"),
            }
        }
        Ok(None)
    }
}

/// Detector health as seen by the decision stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    /// The locator has failed on several consecutive frames.
    Degraded,
}

impl fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionReport {
    pub decisions: FrameDecisions,
    pub events: Vec<AttendanceEvent>,
    /// Set only when health changed on this frame.
    pub health_change: Option<ServiceHealth>,
}

/// Single-threaded decision stage: engine, recorder, and detector health.
pub struct Session {
    engine: DecisionEngine,
    recorder: AttendanceRecorder,
    degraded_after: u32,
    detector_failures: u32,
    health: ServiceHealth,
}

impl Session {
    /// `degraded_after`: consecutive detector failures before reporting degraded.
    pub fn new(engine: DecisionEngine, recorder: AttendanceRecorder, degraded_after: u32) -> Self {
        Self {
            engine,
            recorder,
            degraded_after: degraded_after.max(1),
            detector_failures: 0,
            health: ServiceHealth::Healthy,
        }
    }

    pub fn health(&self) -> ServiceHealth {
        self.health
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn recorder(&self) -> &AttendanceRecorder {
        &self.recorder
    }

    fn set_health(&mut self, health: ServiceHealth) -> Option<ServiceHealth> {
        if self.health == health {
            return None;
        }
        match health {
            ServiceHealth::Degraded => {
                tracing::warn!(failures = self.detector_failures, "face locator degraded")
            }
            ServiceHealth::Healthy => tracing::info!("face locator recovered"),
        }
        self.health = health;
        Some(health)
    }

    /// Apply one analysis. Stale frames are dropped and reported as an empty report.
    pub fn apply(&mut self, analysis: FrameAnalysis, window: &SessionWindow) -> SessionReport {
        let timestamp_ms = analysis.timestamp_ms();
        let mut report = SessionReport::default();

        match analysis {
            FrameAnalysis::DetectorUnavailable { .. } => {
                self.detector_failures = self.detector_failures.saturating_add(1);
                if self.detector_failures >= self.degraded_after {
                    report.health_change = self.set_health(ServiceHealth::Degraded);
                }
                match self.engine.expire(timestamp_ms) {
                    Ok(expired) => report.decisions.expired = expired,
                    Err(e) => tracing::warn!(error = %e, "dropping out-of-order frame"),
                }
            }
            FrameAnalysis::Observed { observations, .. } => {
                self.detector_failures = 0;
                report.health_change = self.set_health(ServiceHealth::Healthy);

                match self.engine.observe(timestamp_ms, observations) {
                    Ok(decisions) => report.decisions = decisions,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping out-of-order frame");
                        return report;
                    }
                }
                for confirmation in &report.decisions.confirmations {
                    if let Some(event) =
                        self.recorder
                            .on_confirmed(&confirmation.person_id, confirmation.timestamp_ms, window)
                    {
                        report.events.push(event);
                    }
                }
            }
        }

        report
    }
}
