//! In-memory fakes for the store and enhancer boundaries, plus log capture.

use crate::ai::{EnhanceError, Enhancer};
use crate::db::DbHandle;
use crate::store::{ProjectStore, StoreError};
use crate::{ImageCounts, JobId, ProjectContext, ProjectId, Status, StatusReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::subscriber::DefaultGuard;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub title: String,
    pub original_description: String,
    pub enhanced_description: Option<String>,
    pub status: Status,
    pub processing_error: Option<String>,
    pub presentation_token: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub images: ImageCounts,
}

impl ProjectRecord {
    pub fn draft(title: &str, description: &str) -> Self {
        ProjectRecord {
            title: title.into(),
            original_description: description.into(),
            enhanced_description: None,
            status: Status::Draft,
            processing_error: None,
            presentation_token: format!("tok-{}", title.to_lowercase().replace(' ', "-")),
            completed_at: None,
            images: ImageCounts {
                before: 2,
                after: 3,
            },
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    projects: Mutex<HashMap<ProjectId, ProjectRecord>>,
    /// Every status written, in order.
    writes: Mutex<Vec<(ProjectId, Status)>>,
    fail_complete_with: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn with_project(id: ProjectId, record: ProjectRecord) -> Self {
        let store = MemoryStore::default();
        store.insert(id, record);
        store
    }

    pub fn insert(&self, id: ProjectId, record: ProjectRecord) {
        self.projects.lock().unwrap().insert(id, record);
    }

    pub fn get(&self, id: ProjectId) -> ProjectRecord {
        self.projects.lock().unwrap()[&id].clone()
    }

    pub fn set_status(&self, id: ProjectId, status: Status) {
        if let Some(record) = self.projects.lock().unwrap().get_mut(&id) {
            record.status = status;
        }
    }

    pub fn writes(&self) -> Vec<(ProjectId, Status)> {
        self.writes.lock().unwrap().clone()
    }

    /// Make the next `complete` calls fail without writing.
    pub fn fail_complete(&self, message: &str) {
        *self.fail_complete_with.lock().unwrap() = Some(message.into());
    }

    fn write(
        &self,
        id: ProjectId,
        status: Status,
        apply: impl FnOnce(&mut ProjectRecord),
    ) -> Result<Status, StoreError> {
        let mut projects = self.projects.lock().unwrap();
        let record = projects.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let previous = record.status;
        record.status = status;
        apply(record);
        self.writes.lock().unwrap().push((id, status));
        Ok(previous)
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn begin_processing(&self, id: ProjectId) -> Result<Status, StoreError> {
        self.write(id, Status::Processing, |r| r.processing_error = None)
    }

    async fn load_context(&self, id: ProjectId) -> Result<ProjectContext, StoreError> {
        let projects = self.projects.lock().unwrap();
        let record = projects.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(ProjectContext {
            id,
            title: record.title.clone(),
            original_description: record.original_description.clone(),
            status: record.status,
            images: record.images,
        })
    }

    async fn complete(&self, id: ProjectId, description: &str) -> Result<Status, StoreError> {
        if let Some(message) = self.fail_complete_with.lock().unwrap().clone() {
            return Err(StoreError::Database(sqlx::Error::Protocol(message)));
        }
        self.write(id, Status::Completed, |r| {
            r.enhanced_description = Some(description.to_owned());
            r.processing_error = None;
            r.completed_at = Some(Utc::now());
        })
    }

    async fn fail(&self, id: ProjectId, message: &str) -> Result<Status, StoreError> {
        self.write(id, Status::Failed, |r| {
            r.processing_error = Some(message.to_owned())
        })
    }

    async fn status_report(&self, id: ProjectId) -> Result<StatusReport, StoreError> {
        let projects = self.projects.lock().unwrap();
        let record = projects.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(StatusReport::new(
            id,
            record.status,
            Some(record.presentation_token.clone()),
            record.processing_error.clone(),
            record.completed_at,
        ))
    }
}

pub struct StaticEnhancer {
    text: String,
    pub calls: AtomicUsize,
}

impl StaticEnhancer {
    pub fn new(text: &str) -> Self {
        StaticEnhancer {
            text: text.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enhancer for StaticEnhancer {
    async fn enhance(&self, _: &str, _: &str, _: ImageCounts) -> Result<String, EnhanceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

pub struct FailingEnhancer;

#[async_trait]
impl Enhancer for FailingEnhancer {
    async fn enhance(&self, _: &str, _: &str, _: ImageCounts) -> Result<String, EnhanceError> {
        Err(EnhanceError::Api {
            status: 500,
            body: "overloaded".into(),
        })
    }
}

/// Sleeps for the given duration before answering.
pub struct SlowEnhancer(pub Duration);

#[async_trait]
impl Enhancer for SlowEnhancer {
    async fn enhance(&self, original: &str, _: &str, _: ImageCounts) -> Result<String, EnhanceError> {
        tokio::time::sleep(self.0).await;
        Ok(format!("slow: {original}"))
    }
}

/// Records the project status the store reports while the enhancement call
/// is in flight.
pub struct ObservingEnhancer {
    store: Arc<MemoryStore>,
    project_id: ProjectId,
    seen: Mutex<Option<Status>>,
}

impl ObservingEnhancer {
    pub fn new(store: Arc<MemoryStore>, project_id: ProjectId) -> Self {
        ObservingEnhancer {
            store,
            project_id,
            seen: Mutex::new(None),
        }
    }

    pub fn seen(&self) -> Option<Status> {
        *self.seen.lock().unwrap()
    }
}

#[async_trait]
impl Enhancer for ObservingEnhancer {
    async fn enhance(&self, original: &str, _: &str, _: ImageCounts) -> Result<String, EnhanceError> {
        let status = self
            .store
            .status_report(self.project_id)
            .await
            .ok()
            .map(|report| report.status);
        *self.seen.lock().unwrap() = status;
        Ok(format!("enhanced: {original}"))
    }
}

#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Send this thread's events to a buffer until the guard is dropped.
pub fn capture_logs() -> (LogBuffer, DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

/// Insert a DRAFT project with the given number of images of each kind.
pub async fn seed_project(
    handle: &DbHandle,
    title: &str,
    description: &str,
    images: ImageCounts,
) -> ProjectId {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO projects (id, title, description_original, presentation_token) \
        VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(title)
    .bind(description)
    .bind(format!("tok-{id}"))
    .execute(&*handle.pool)
    .await
    .unwrap();

    for (kind, count) in [("BEFORE", images.before), ("AFTER", images.after)] {
        for order_index in 0..count {
            sqlx::query(
                "INSERT INTO project_images (id, project_id, kind, order_index) \
                VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(kind)
            .bind(order_index as i32)
            .execute(&*handle.pool)
            .await
            .unwrap();
        }
    }
    id
}

/// Make a queued job eligible right away, skipping its backoff.
pub async fn make_due(handle: &DbHandle, job_id: JobId) {
    sqlx::query("UPDATE jobq SET run_at = now() WHERE id = $1")
        .bind(job_id)
        .execute(&*handle.pool)
        .await
        .unwrap();
}
