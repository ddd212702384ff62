use crate::engine::{EngineError, EngineHandle};
use crate::store::Store;
use rollcall_core::gallery::EnrollOutcome;
use rollcall_core::{DistanceMetric, PersonId, Reference, SessionWindow, SharedGallery};
use std::path::PathBuf;
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    engine: EngineHandle,
    gallery: SharedGallery,
    store: Store,
    metric: DistanceMetric,
    /// Serializes gallery mutations with their persistence.
    writes: tokio::sync::Mutex<()>,
}

impl RollcallService {
    pub fn new(engine: EngineHandle, gallery: SharedGallery, store: Store, metric: DistanceMetric) -> Self {
        Self {
            engine,
            gallery,
            store,
            metric,
            writes: tokio::sync::Mutex::new(()),
        }
    }
}

fn person_arg(person_id: &str) -> fdo::Result<PersonId> {
    let trimmed = person_id.trim();
    if trimmed.is_empty() {
        return Err(fdo::Error::InvalidArgs("person id must not be empty".into()));
    }
    Ok(PersonId::new(trimmed))
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

fn failed(context: &str, e: impl std::fmt::Display) -> fdo::Error {
    tracing::error!(error = %e, "{context}");
    fdo::Error::Failed(format!("{context}: {e}"))
}

/// Persist the updated entry, then publish it for matching. A failed write
/// leaves the in-memory gallery as it was.
async fn persist_enrollment(
    gallery: &SharedGallery,
    store: &Store,
    person: &PersonId,
    reference: Reference,
) -> fdo::Result<(EnrollOutcome, usize)> {
    let (outcome, entry) = gallery
        .stage_enroll(person, reference)
        .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
    let references = entry.references.len();
    if outcome != EnrollOutcome::Duplicate {
        store
            .save_entry(entry.clone())
            .await
            .map_err(|e| failed("failed to persist enrollment", e))?;
        gallery.commit(entry);
    }
    Ok((outcome, references))
}

/// Delete from storage, then from memory.
async fn persist_revocation(gallery: &SharedGallery, store: &Store, person: &PersonId) -> fdo::Result<bool> {
    let persisted = store
        .delete_person(person)
        .await
        .map_err(|e| failed("failed to delete person", e))?;
    let in_memory = gallery.revoke(person);
    Ok(in_memory || persisted)
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Enroll the most confident face in an image file as a reference for `person_id`.
    async fn enroll_image(&self, person_id: &str, path: &str, label: &str) -> fdo::Result<String> {
        let person = person_arg(person_id)?;
        tracing::info!(person = %person, path, label, "enroll_image requested");

        let image_path = PathBuf::from(path);
        let frame = tokio::task::spawn_blocking(move || rollcall_hw::load_image(&image_path, now_ms(), 0))
            .await
            .map_err(|e| failed("image loader panicked", e))?
            .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;

        let sample = match self.engine.enroll(frame).await {
            Ok(sample) => sample,
            Err(EngineError::NoFaceDetected) => {
                return Err(fdo::Error::Failed("no face detected in image".into()))
            }
            Err(e) => return Err(failed("enrollment failed", e)),
        };

        let label = (!label.trim().is_empty()).then(|| label.trim().to_string());
        let _guard = self.writes.lock().await;
        let (outcome, references) = persist_enrollment(
            &self.gallery,
            &self.store,
            &person,
            Reference::new(sample.embedding, label),
        )
        .await?;

        let outcome = match outcome {
            EnrollOutcome::Added => "added",
            EnrollOutcome::Evicted => "added_evicted_oldest",
            EnrollOutcome::Duplicate => "duplicate",
        };
        Ok(serde_json::json!({
            "person_id": person,
            "outcome": outcome,
            "references": references,
            "confidence": sample.region.confidence,
        })
        .to_string())
    }

    /// Remove a person and every reference they own.
    async fn revoke(&self, person_id: &str) -> fdo::Result<bool> {
        let person = person_arg(person_id)?;
        tracing::info!(person = %person, "revoke requested");

        let _guard = self.writes.lock().await;
        persist_revocation(&self.gallery, &self.store, &person).await
    }

    /// Enrolled people as a JSON array. Embeddings are never exposed.
    async fn list_people(&self) -> fdo::Result<String> {
        let gallery = self.gallery.read();
        let people: Vec<serde_json::Value> = gallery
            .entries()
            .map(|entry| {
                let labels: Vec<&str> = entry.references.iter().filter_map(|r| r.label.as_deref()).collect();
                serde_json::json!({
                    "person_id": entry.person_id,
                    "references": entry.references.len(),
                    "labels": labels,
                    "created_at": entry.created_at.to_rfc3339(),
                })
            })
            .collect();
        Ok(serde_json::Value::Array(people).to_string())
    }

    /// Attendance events for `window` (today when empty) as a JSON array.
    async fn attendance(&self, window: &str) -> fdo::Result<String> {
        let window = if window.trim().is_empty() {
            SessionWindow::daily_local(now_ms())
        } else {
            SessionWindow::new(window.trim())
        };
        let events = self
            .store
            .events_in_window(&window)
            .await
            .map_err(|e| failed("failed to query attendance", e))?;
        serde_json::to_string(&events).map_err(|e| failed("failed to encode attendance", e))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let engine = self.engine.status();
        let (people, references) = {
            let gallery = self.gallery.read();
            (gallery.len(), gallery.reference_count())
        };
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "health": engine.health,
            "window": SessionWindow::daily_local(now_ms()),
            "people": people,
            "references": references,
            "metric": self.metric.to_string(),
            "live_tracks": engine.live_tracks,
            "frames_captured": engine.frames_captured,
            "frames_analyzed": engine.frames_analyzed,
            "frames_dropped": engine.frames_dropped,
            "queue_len": engine.queue_len,
        })
        .to_string())
    }

    /// Emitted once per person per window.
    #[zbus(signal)]
    pub async fn attendance_recorded(
        emitter: &SignalEmitter<'_>,
        person_id: &str,
        window: &str,
        timestamp_ms: u64,
    ) -> zbus::Result<()>;

    /// Emitted when the face locator degrades or recovers.
    #[zbus(signal)]
    pub async fn health_changed(emitter: &SignalEmitter<'_>, health: &str) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{Embedding, Gallery, GalleryConfig};

    fn reference(values: &[f32]) -> Reference {
        Reference::new(Embedding::new(values.to_vec(), 0), None)
    }

    fn gallery_with_alice() -> SharedGallery {
        let gallery = SharedGallery::new(Gallery::new(GalleryConfig::default()));
        gallery.enroll(&PersonId::from("alice"), reference(&[1.0, 0.0])).unwrap();
        gallery
    }

    #[test]
    fn test_person_arg_trims_and_rejects_blank() {
        assert_eq!(person_arg("  s1234 ").unwrap(), PersonId::from("s1234"));
        assert!(person_arg("   ").is_err());
    }

    #[tokio::test]
    async fn test_enrollment_is_persisted_then_published() {
        let store = Store::open_in_memory().await.unwrap();
        let gallery = gallery_with_alice();
        let alice = PersonId::from("alice");

        let (outcome, references) = persist_enrollment(&gallery, &store, &alice, reference(&[0.0, 1.0]))
            .await
            .unwrap();
        assert_eq!(outcome, EnrollOutcome::Added);
        assert_eq!(references, 2);
        assert_eq!(gallery.snapshot(&alice).unwrap().references.len(), 2);
        assert_eq!(store.load_gallery().await.unwrap()[0].references.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_enrollment_write_leaves_gallery_unchanged() {
        let store = Store::open_in_memory().await.unwrap();
        store.drop_schema().await.unwrap();
        let gallery = gallery_with_alice();
        let alice = PersonId::from("alice");
        let bob = PersonId::from("bob");

        assert!(persist_enrollment(&gallery, &store, &alice, reference(&[0.0, 1.0])).await.is_err());
        assert!(persist_enrollment(&gallery, &store, &bob, reference(&[0.0, 1.0])).await.is_err());

        assert_eq!(gallery.snapshot(&alice).unwrap().references.len(), 1);
        assert!(gallery.snapshot(&bob).is_none());
        let hit = gallery.nearest(&Embedding::new(vec![0.0, 1.0], 0)).unwrap().unwrap();
        assert_eq!(hit.person_id, alice);
    }

    #[tokio::test]
    async fn test_failed_revocation_keeps_person() {
        let store = Store::open_in_memory().await.unwrap();
        store.drop_schema().await.unwrap();
        let gallery = gallery_with_alice();
        let alice = PersonId::from("alice");

        assert!(persist_revocation(&gallery, &store, &alice).await.is_err());
        assert!(gallery.snapshot(&alice).is_some());
    }

    #[tokio::test]
    async fn test_revocation_removes_from_store_and_memory() {
        let store = Store::open_in_memory().await.unwrap();
        let gallery = gallery_with_alice();
        let alice = PersonId::from("alice");
        store.save_entry(gallery.snapshot(&alice).unwrap()).await.unwrap();

        assert!(persist_revocation(&gallery, &store, &alice).await.unwrap());
        assert!(gallery.snapshot(&alice).is_none());
        assert!(store.load_gallery().await.unwrap().is_empty());
        assert!(!persist_revocation(&gallery, &store, &alice).await.unwrap());
    }
}
