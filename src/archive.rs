//! Event archive: the persistence handoff for finalized bundles.
//!
//! Artifacts are uploaded to `<owner>/<eventId>/<fileName>` first, then the
//! event record is appended. A failure at any step is reported as a
//! persistence notice naming the step and path; nothing is retried.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::artifact::EventBundle;
use crate::notice::{NoticeCategory, Notifier};
use crate::storage::{BlobStore, EventRecord, EventStore, StoreError};

#[derive(Debug, Error)]
#[error("{step} failed for {path}: {source}")]
pub struct PersistError {
    pub step: &'static str,
    pub path: String,
    #[source]
    pub source: StoreError,
}

#[derive(Clone)]
pub struct EventArchive {
    owner: String,
    events: Arc<dyn EventStore>,
    blobs: Arc<dyn BlobStore>,
    notifier: Notifier,
}

impl EventArchive {
    pub fn new(
        owner: impl Into<String>,
        events: Arc<dyn EventStore>,
        blobs: Arc<dyn BlobStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            owner: owner.into(),
            events,
            blobs,
            notifier,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Persist `bundle` in the background.
    ///
    /// The returned handle resolves to the stored record, or `None` after a
    /// failure has been published as a notice.
    pub fn submit(&self, bundle: EventBundle) -> JoinHandle<Option<EventRecord>> {
        let archive = self.clone();
        tokio::spawn(async move {
            let event_id = bundle.event().id.clone();
            let worker = archive.clone();
            let result = tokio::task::spawn_blocking(move || worker.persist(&bundle)).await;
            match result {
                Ok(Ok(record)) => Some(record),
                Ok(Err(e)) => {
                    archive.notifier.error(
                        NoticeCategory::Persistence,
                        format!("Could not save event {}: {}", event_id, e),
                    );
                    None
                }
                Err(e) => {
                    archive.notifier.error(
                        NoticeCategory::Persistence,
                        format!("Could not save event {}: task failed: {}", event_id, e),
                    );
                    None
                }
            }
        })
    }

    /// Upload artifacts and append the record. Blocking.
    pub fn persist(&self, bundle: &EventBundle) -> Result<EventRecord, PersistError> {
        let event = bundle.event();
        let upload = |file_name: &str, bytes: &[u8]| {
            let path = format!("{}/{}/{}", self.owner, event.id, file_name);
            self.blobs.put(&path, bytes).map_err(|source| PersistError {
                step: "upload",
                path,
                source,
            })
        };

        let video = match &bundle.video {
            Some(a) => Some(upload(&a.file_name, &a.bytes)?),
            None => None,
        };
        let photo = match &bundle.photo {
            Some(a) => Some(upload(&a.file_name, &a.bytes)?),
            None => None,
        };
        let report = upload(&bundle.report.file_name, &bundle.report.bytes)?;

        let record = EventRecord {
            id: event.id.clone(),
            owner: self.owner.clone(),
            source: event.source,
            captured_at: event.captured_at,
            media_name: event.media_name.clone(),
            verdict: bundle.verdict.clone(),
            video,
            photo,
            report,
            issues: bundle.issues.clone(),
            created_at: Utc::now(),
        };
        self.events.append(&record).map_err(|source| PersistError {
            step: "append record",
            path: record.id.clone(),
            source,
        })?;
        log::info!(
            "EventArchive: stored event {} ({} artifacts)",
            record.id,
            record.blobs().count()
        );
        Ok(record)
    }

    /// Events for this owner, newest first. Blocking.
    pub fn list(&self) -> Result<Vec<EventRecord>, StoreError> {
        self.events.list_by_owner(&self.owner)
    }

    /// Remove every event for this owner and its blobs. Blocking.
    pub fn delete_all(&self) -> Result<usize, PersistError> {
        let records = self.list().map_err(|source| PersistError {
            step: "list events",
            path: self.owner.clone(),
            source,
        })?;
        for record in &records {
            for blob in record.blobs() {
                self.blobs.delete(&blob.path).map_err(|source| PersistError {
                    step: "delete blob",
                    path: blob.path.clone(),
                    source,
                })?;
            }
        }
        let removed = self
            .events
            .delete_all(&self.owner)
            .map_err(|source| PersistError {
                step: "delete events",
                path: self.owner.clone(),
                source,
            })?;
        log::info!("EventArchive: deleted {} events for {}", removed, self.owner);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Artifact, BundleIssue, CaptureContext};
    use crate::settings::Settings;
    use crate::storage::{InMemoryBlobStore, InMemoryEventStore, StoredBlob};
    use crate::{CaptureEvent, TriggerSource};

    fn bundle(with_photo: bool) -> EventBundle {
        let event = CaptureEvent::new(TriggerSource::Manual, Utc::now());
        let name = event.media_name.clone();
        EventBundle {
            context: CaptureContext {
                event,
                device_label: "cam".to_string(),
                facing: None,
                width: 64,
                height: 48,
                settings: Settings::default(),
            },
            verdict: None,
            video: Some(Artifact {
                file_name: format!("{}_video_5s.mjpeg", name),
                mime_type: "video/x-motion-jpeg".to_string(),
                bytes: vec![1, 2, 3],
            }),
            photo: with_photo.then(|| Artifact {
                file_name: format!("{}_photo.jpg", name),
                mime_type: "image/jpeg".to_string(),
                bytes: vec![4, 5],
            }),
            report: Artifact {
                file_name: format!("{}_data.txt", name),
                mime_type: "text/plain".to_string(),
                bytes: b"report".to_vec(),
            },
            issues: vec![BundleIssue::AnalysisUnavailable("offline".to_string())],
        }
    }

    struct FailingBlobs;

    impl BlobStore for FailingBlobs {
        fn put(&self, path: &str, _bytes: &[u8]) -> Result<StoredBlob, StoreError> {
            Err(StoreError::InvalidPath(path.to_string()))
        }

        fn delete(&self, _path: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn submit_uploads_artifacts_then_appends_record() {
        let events = Arc::new(InMemoryEventStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let archive = EventArchive::new("ana", events.clone(), blobs.clone(), Notifier::disabled());

        let b = bundle(false);
        let id = b.event().id.clone();
        let record = archive.submit(b).await.unwrap().unwrap();

        assert_eq!(record.id, id);
        assert!(record.photo.is_none());
        assert!(record.verdict.is_none());
        assert_eq!(blobs.len(), 2);
        assert!(record.report.path.starts_with(&format!("ana/{}/", id)));
        assert_eq!(archive.list().unwrap().len(), 1);

        assert_eq!(archive.delete_all().unwrap(), 1);
        assert!(blobs.is_empty());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn upload_failure_publishes_persistence_notice() {
        let (notifier, mut rx) = Notifier::channel();
        let events = Arc::new(InMemoryEventStore::new());
        let archive = EventArchive::new("ana", events.clone(), Arc::new(FailingBlobs), notifier);

        assert!(archive.submit(bundle(true)).await.unwrap().is_none());
        assert!(events.is_empty());
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.category, NoticeCategory::Persistence);
        assert!(notice.message.contains("upload failed for ana/"));
    }
}
