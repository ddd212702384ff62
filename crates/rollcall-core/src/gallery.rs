//! Identity Gallery: enrolled people and their reference embeddings.

use crate::types::{DistanceMetric, Embedding, PersonId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("embedding contains non-finite values")]
    NonFinite,
    #[error("embedding dimension {actual} does not match gallery dimension {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding is empty")]
    Empty,
    #[error("person id must not be empty")]
    InvalidPerson,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GalleryConfig {
    /// References kept per person; the oldest is evicted on overflow.
    pub max_references: usize,
    pub metric: DistanceMetric,
    /// Fixed embedding dimension. `None` adopts the first enrolled dimension.
    pub dimension: Option<usize>,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            max_references: 10,
            metric: DistanceMetric::Cosine,
            dimension: None,
        }
    }
}

/// One enrolled sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub embedding: Embedding,
    /// Free-form tag for the sample (e.g., "glasses").
    pub label: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

impl Reference {
    pub fn new(embedding: Embedding, label: Option<String>) -> Self {
        Self {
            embedding,
            label,
            enrolled_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub person_id: PersonId,
    /// Oldest first.
    pub references: VecDeque<Reference>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    Added,
    /// Added, and the oldest reference was dropped to stay within the cap.
    Evicted,
    /// The exact vector is already enrolled for this person.
    Duplicate,
}

/// Closest enrolled reference to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest {
    pub person_id: PersonId,
    pub distance: f32,
}

/// Enrolled identities keyed by person, iterated in person-id order.
#[derive(Debug, Default)]
pub struct Gallery {
    config: GalleryConfig,
    entries: BTreeMap<PersonId, GalleryEntry>,
    dimension: Option<usize>,
}

impl Gallery {
    pub fn new(config: GalleryConfig) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
            dimension: config.dimension,
        }
    }

    pub fn config(&self) -> &GalleryConfig {
        &self.config
    }

    fn check(&self, embedding: &Embedding) -> Result<(), GalleryError> {
        if embedding.values.is_empty() {
            return Err(GalleryError::Empty);
        }
        if !embedding.is_finite() {
            return Err(GalleryError::NonFinite);
        }
        match self.dimension {
            Some(expected) if expected != embedding.dim() => Err(GalleryError::Dimension {
                expected,
                actual: embedding.dim(),
            }),
            _ => Ok(()),
        }
    }

    /// Enroll a sample taken now.
    pub fn enroll(&mut self, person_id: &PersonId, embedding: Embedding) -> Result<EnrollOutcome, GalleryError> {
        self.enroll_reference(person_id, Reference::new(embedding, None))
    }

    /// Append `reference` to `person_id`'s entry, creating it if absent.
    pub fn enroll_reference(
        &mut self,
        person_id: &PersonId,
        reference: Reference,
    ) -> Result<EnrollOutcome, GalleryError> {
        if person_id.as_str().trim().is_empty() {
            return Err(GalleryError::InvalidPerson);
        }
        self.check(&reference.embedding)?;

        let dim = reference.embedding.dim();
        let max_refs = self.config.max_references.max(1);
        let entry = self.entries.entry(person_id.clone()).or_insert_with(|| GalleryEntry {
            person_id: person_id.clone(),
            references: VecDeque::new(),
            created_at: reference.enrolled_at,
        });

        if entry
            .references
            .iter()
            .any(|r| r.embedding.same_values(&reference.embedding))
        {
            tracing::debug!(person = %person_id, "duplicate reference ignored");
            return Ok(EnrollOutcome::Duplicate);
        }

        entry.references.push_back(reference);
        let mut outcome = EnrollOutcome::Added;
        while entry.references.len() > max_refs {
            entry.references.pop_front();
            outcome = EnrollOutcome::Evicted;
        }
        self.dimension.get_or_insert(dim);

        tracing::info!(
            person = %person_id,
            references = entry.references.len(),
            evicted = outcome == EnrollOutcome::Evicted,
            "reference enrolled"
        );
        Ok(outcome)
    }

    /// Enroll into a copy of `person_id`'s entry, leaving this gallery
    /// untouched. Publish the result with [`commit`](Self::commit).
    pub fn stage_enroll(
        &self,
        person_id: &PersonId,
        reference: Reference,
    ) -> Result<(EnrollOutcome, GalleryEntry), GalleryError> {
        let mut staged = Gallery {
            config: self.config,
            entries: BTreeMap::new(),
            dimension: self.dimension,
        };
        if let Some(existing) = self.entries.get(person_id) {
            staged.entries.insert(person_id.clone(), existing.clone());
        }
        let outcome = staged.enroll_reference(person_id, reference)?;
        let entry = staged.entries.remove(person_id).ok_or(GalleryError::InvalidPerson)?;
        Ok((outcome, entry))
    }

    /// Install an entry built by [`stage_enroll`](Self::stage_enroll),
    /// replacing the person's current one.
    pub fn commit(&mut self, entry: GalleryEntry) {
        if let Some(first) = entry.references.front() {
            self.dimension.get_or_insert(first.embedding.dim());
        }
        self.entries.insert(entry.person_id.clone(), entry);
    }

    /// Replace or insert a whole entry, e.g. when loading from storage.
    ///
    /// References that fail validation are skipped and counted in the result.
    pub fn restore(&mut self, entry: GalleryEntry) -> usize {
        let person_id = entry.person_id.clone();
        self.entries.remove(&person_id);
        let mut rejected = 0;
        for reference in entry.references {
            if self.enroll_reference(&person_id, reference).is_err() {
                rejected += 1;
            }
        }
        if let Some(restored) = self.entries.get_mut(&person_id) {
            restored.created_at = entry.created_at;
        }
        if rejected > 0 {
            tracing::warn!(person = %person_id, rejected, "skipped invalid stored references");
        }
        rejected
    }

    /// Remove a person. Returns whether anything was removed.
    pub fn revoke(&mut self, person_id: &PersonId) -> bool {
        let removed = self.entries.remove(person_id).is_some();
        if removed {
            tracing::info!(person = %person_id, "person revoked");
        }
        if self.entries.is_empty() {
            self.dimension = self.config.dimension;
        }
        removed
    }

    /// Closest reference across every entry, or `None` for an empty gallery.
    ///
    /// Every reference is compared (no early exit); ties keep the candidate
    /// seen first in person-id order. References whose distance is not
    /// finite are never returned.
    pub fn nearest(&self, query: &Embedding) -> Result<Option<Nearest>, GalleryError> {
        self.check(query)?;

        let mut best: Option<(&PersonId, f32)> = None;
        for (person_id, entry) in &self.entries {
            for reference in &entry.references {
                let distance = query.distance(&reference.embedding, self.config.metric);
                // Finite vectors can still overflow to inf or NaN
                if !distance.is_finite() {
                    tracing::debug!(person = %person_id, "skipping reference with non-finite distance");
                    continue;
                }
                let closer = match best {
                    Some((_, d)) => distance < d,
                    None => true,
                };
                if closer {
                    best = Some((person_id, distance));
                }
            }
        }

        Ok(best.map(|(person_id, distance)| Nearest {
            person_id: person_id.clone(),
            distance,
        }))
    }

    pub fn get(&self, person_id: &PersonId) -> Option<&GalleryEntry> {
        self.entries.get(person_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &GalleryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reference_count(&self) -> usize {
        self.entries.values().map(|e| e.references.len()).sum()
    }
}

/// Shared gallery: concurrent readers, one serialized writer.
#[derive(Clone, Default)]
pub struct SharedGallery {
    inner: Arc<RwLock<Gallery>>,
}

impl SharedGallery {
    pub fn new(gallery: Gallery) -> Self {
        Self {
            inner: Arc::new(RwLock::new(gallery)),
        }
    }

    /// A panicked writer cannot leave a half-applied entry behind, so a
    /// poisoned lock is still safe to read.
    pub fn read(&self) -> RwLockReadGuard<'_, Gallery> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Gallery> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn nearest(&self, query: &Embedding) -> Result<Option<Nearest>, GalleryError> {
        self.read().nearest(query)
    }

    pub fn enroll(&self, person_id: &PersonId, reference: Reference) -> Result<EnrollOutcome, GalleryError> {
        self.write().enroll_reference(person_id, reference)
    }

    pub fn revoke(&self, person_id: &PersonId) -> bool {
        self.write().revoke(person_id)
    }

    pub fn stage_enroll(
        &self,
        person_id: &PersonId,
        reference: Reference,
    ) -> Result<(EnrollOutcome, GalleryEntry), GalleryError> {
        self.read().stage_enroll(person_id, reference)
    }

    pub fn commit(&self, entry: GalleryEntry) {
        self.write().commit(entry)
    }

    /// Copy of one person's entry, for persistence.
    pub fn snapshot(&self, person_id: &PersonId) -> Option<GalleryEntry> {
        self.read().get(person_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec(), 0)
    }

    fn gallery(max_references: usize) -> Gallery {
        Gallery::new(GalleryConfig {
            max_references,
            ..GalleryConfig::default()
        })
    }

    #[test]
    fn test_enroll_same_embedding_twice_is_deduplicated() {
        let mut g = gallery(5);
        let alice = PersonId::from("alice");
        assert_eq!(g.enroll(&alice, emb(&[1.0, 0.0])), Ok(EnrollOutcome::Added));
        assert_eq!(g.enroll(&alice, emb(&[1.0, 0.0])), Ok(EnrollOutcome::Duplicate));
        assert_eq!(g.get(&alice).unwrap().references.len(), 1);
        assert_eq!(g.reference_count(), 1);
    }

    #[test]
    fn test_enroll_evicts_oldest_fifo() {
        let mut g = gallery(2);
        let alice = PersonId::from("alice");
        g.enroll(&alice, emb(&[1.0, 0.0])).unwrap();
        g.enroll(&alice, emb(&[0.0, 1.0])).unwrap();
        assert_eq!(g.enroll(&alice, emb(&[0.6, 0.8])), Ok(EnrollOutcome::Evicted));

        let refs = &g.get(&alice).unwrap().references;
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].embedding.values, vec![0.0, 1.0]);
        assert_eq!(refs[1].embedding.values, vec![0.6, 0.8]);
    }

    #[test]
    fn test_enroll_rejects_nan() {
        let mut g = gallery(5);
        let alice = PersonId::from("alice");
        assert_eq!(g.enroll(&alice, emb(&[f32::NAN, 1.0])), Err(GalleryError::NonFinite));
        assert!(g.is_empty());
    }

    #[test]
    fn test_enroll_rejects_dimension_mismatch() {
        let mut g = gallery(5);
        g.enroll(&PersonId::from("alice"), emb(&[1.0, 0.0])).unwrap();
        assert_eq!(
            g.enroll(&PersonId::from("bob"), emb(&[1.0, 0.0, 0.0])),
            Err(GalleryError::Dimension { expected: 2, actual: 3 })
        );
    }

    #[test]
    fn test_enroll_rejects_blank_person() {
        let mut g = gallery(5);
        assert_eq!(g.enroll(&PersonId::from("  "), emb(&[1.0])), Err(GalleryError::InvalidPerson));
    }

    #[test]
    fn test_revoke_idempotent() {
        let mut g = gallery(5);
        let alice = PersonId::from("alice");
        g.enroll(&alice, emb(&[1.0, 0.0])).unwrap();
        assert!(g.revoke(&alice));
        assert!(!g.revoke(&alice));
        assert!(g.is_empty());
        // Dimension resets once the gallery is empty
        assert!(g.enroll(&alice, emb(&[1.0, 0.0, 0.0])).is_ok());
    }

    #[test]
    fn test_stage_enroll_leaves_gallery_untouched_until_commit() {
        let mut g = gallery(2);
        let alice = PersonId::from("alice");
        g.enroll(&alice, emb(&[1.0, 0.0])).unwrap();
        g.enroll(&alice, emb(&[0.0, 1.0])).unwrap();

        let (outcome, staged) = g
            .stage_enroll(&alice, Reference::new(emb(&[0.6, 0.8]), None))
            .unwrap();
        assert_eq!(outcome, EnrollOutcome::Evicted);
        assert_eq!(staged.references.len(), 2);
        assert_eq!(g.get(&alice).unwrap().references[0].embedding.values, vec![1.0, 0.0]);

        g.commit(staged);
        let refs = &g.get(&alice).unwrap().references;
        assert_eq!(refs[0].embedding.values, vec![0.0, 1.0]);
        assert_eq!(refs[1].embedding.values, vec![0.6, 0.8]);
    }

    #[test]
    fn test_stage_enroll_checks_gallery_dimension() {
        let mut g = gallery(5);
        g.enroll(&PersonId::from("alice"), emb(&[1.0, 0.0])).unwrap();
        assert!(matches!(
            g.stage_enroll(&PersonId::from("bob"), Reference::new(emb(&[1.0, 0.0, 0.0]), None)),
            Err(GalleryError::Dimension { .. })
        ));
        assert!(g.get(&PersonId::from("bob")).is_none());
    }

    #[test]
    fn test_nearest_empty_gallery() {
        let g = gallery(5);
        assert_eq!(g.nearest(&emb(&[1.0, 0.0])), Ok(None));
    }

    #[test]
    fn test_nearest_picks_closest_across_people() {
        let mut g = gallery(5);
        g.enroll(&PersonId::from("alice"), emb(&[1.0, 0.0, 0.0])).unwrap();
        g.enroll(&PersonId::from("bob"), emb(&[0.0, 1.0, 0.0])).unwrap();
        g.enroll(&PersonId::from("bob"), emb(&[0.0, 0.0, 1.0])).unwrap();

        let hit = g.nearest(&emb(&[0.1, 0.0, 0.9])).unwrap().unwrap();
        assert_eq!(hit.person_id, PersonId::from("bob"));
        assert!(hit.distance < 0.01);
    }

    #[test]
    fn test_nearest_deterministic_with_ties() {
        let mut g = gallery(5);
        g.enroll(&PersonId::from("zed"), emb(&[1.0, 0.0])).unwrap();
        g.enroll(&PersonId::from("amy"), emb(&[1.0, 0.0])).unwrap();

        let query = emb(&[0.7, 0.7]);
        let first = g.nearest(&query).unwrap();
        for _ in 0..10 {
            assert_eq!(g.nearest(&query).unwrap(), first);
        }
        assert_eq!(first.unwrap().person_id, PersonId::from("amy"));
    }

    #[test]
    fn test_nearest_rejects_nan_query() {
        let mut g = gallery(5);
        g.enroll(&PersonId::from("alice"), emb(&[1.0, 0.0])).unwrap();
        assert_eq!(g.nearest(&emb(&[f32::NAN, 0.0])), Err(GalleryError::NonFinite));
        // Also rejected against an empty gallery
        assert_eq!(gallery(5).nearest(&emb(&[f32::NAN, 0.0])), Err(GalleryError::NonFinite));
    }

    #[test]
    fn test_nearest_skips_overflowing_distance() {
        let mut g = gallery(5);
        g.enroll(&PersonId::from("alice"), emb(&[f32::MAX, f32::MAX])).unwrap();
        g.enroll(&PersonId::from("bob"), emb(&[1.0, 0.0])).unwrap();

        let hit = g.nearest(&emb(&[f32::MAX, 0.0])).unwrap().unwrap();
        assert_eq!(hit.person_id, PersonId::from("bob"));
        assert!(hit.distance.is_finite());
    }

    #[test]
    fn test_nearest_euclidean_metric() {
        let mut g = Gallery::new(GalleryConfig {
            metric: DistanceMetric::Euclidean,
            ..GalleryConfig::default()
        });
        g.enroll(&PersonId::from("alice"), emb(&[3.0, 4.0])).unwrap();
        let hit = g.nearest(&emb(&[0.0, 0.0])).unwrap().unwrap();
        assert!((hit.distance - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_restore_skips_invalid_references() {
        let mut g = gallery(5);
        let alice = PersonId::from("alice");
        let entry = GalleryEntry {
            person_id: alice.clone(),
            references: VecDeque::from(vec![
                Reference::new(emb(&[1.0, 0.0]), Some("normal".into())),
                Reference::new(emb(&[f32::INFINITY, 0.0]), None),
            ]),
            created_at: Utc::now(),
        };
        assert_eq!(g.restore(entry), 1);
        assert_eq!(g.get(&alice).unwrap().references.len(), 1);
    }

    #[test]
    fn test_shared_gallery_concurrent_readers() {
        let shared = SharedGallery::new(gallery(5));
        shared
            .enroll(&PersonId::from("alice"), Reference::new(emb(&[1.0, 0.0]), None))
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let g = shared.clone();
                std::thread::spawn(move || g.nearest(&emb(&[1.0, 0.0])).unwrap().unwrap().person_id)
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), PersonId::from("alice"));
        }
    }
}
