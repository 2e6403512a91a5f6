use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{TaskRecord, TaskResult, TaskStatus};

#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    NotFound,
    AlreadyFinished,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskRecord>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, kind: &'static str) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = TaskRecord {
            id: id.clone(),
            kind,
            created_at: now,
            updated_at: now,
            status: TaskStatus::Pending,
            progress: 0.0,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            result: None,
            error: None,
        };
        self.tasks.write().await.insert(id.clone(), record);
        id
    }

    pub async fn get(&self, id: &str) -> Option<TaskRecord> {
        self.tasks.read().await.get(id).cloned()
    }

    pub async fn cancel_token(&self, id: &str) -> Option<CancelToken> {
        self.tasks
            .read()
            .await
            .get(id)
            .map(|task| CancelToken(task.cancel_flag.clone()))
    }

    pub async fn request_cancel(&self, id: &str) -> Result<(), CancelError> {
        let tasks = self.tasks.read().await;
        let Some(task) = tasks.get(id) else {
            return Err(CancelError::NotFound);
        };
        if task.status.is_terminal() {
            return Err(CancelError::AlreadyFinished);
        }
        task.cancel_flag.store(true, Ordering::Relaxed);
        info!(task_id = %id, "Cancellation requested");
        Ok(())
    }

    pub async fn start(&self, id: &str, floor: f64) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Processing;
                task.progress = floor.clamp(0.0, 100.0);
                task.updated_at = Utc::now();
            }
        }
    }

    pub async fn set_progress(&self, id: &str, progress: f64) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            if !task.status.is_terminal() {
                task.progress = progress.clamp(0.0, 100.0);
                task.updated_at = Utc::now();
            }
        }
    }

    pub async fn complete(&self, id: &str, result: TaskResult) -> bool {
        self.finish(id, TaskStatus::Completed, Some(result), None).await
    }

    pub async fn fail(&self, id: &str, message: impl Into<String>) -> bool {
        self.finish(id, TaskStatus::Error, None, Some(message.into()))
            .await
    }

    pub async fn cancelled(&self, id: &str) -> bool {
        self.finish(id, TaskStatus::Cancelled, None, None).await
    }

    async fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<TaskResult>,
        error: Option<String>,
    ) -> bool {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(id) else {
            warn!(task_id = %id, "Finish requested for unknown task");
            return false;
        };
        if task.status.is_terminal() {
            warn!(
                task_id = %id,
                current = task.status.as_str(),
                requested = status.as_str(),
                "Ignoring terminal transition on finished task"
            );
            return false;
        }
        task.status = status;
        if status == TaskStatus::Completed {
            task.progress = 100.0;
        }
        task.result = result;
        task.error = error;
        task.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(name: &str) -> TaskResult {
        TaskResult {
            file_name: name.to_string(),
            download_url: format!("/files/{name}"),
            title: None,
        }
    }

    #[tokio::test]
    async fn create_inserts_pending_record() {
        let registry = TaskRegistry::new();
        let id = registry.create("download").await;
        let task = registry.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);
        assert!(task.result.is_none());
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn concurrent_creates_yield_distinct_ids() {
        let registry = Arc::new(TaskRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(
                async move { registry.create("transcode").await },
            ));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 32);
    }

    #[tokio::test]
    async fn get_unknown_id_is_none() {
        let registry = TaskRegistry::new();
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn cancel_unknown_id_is_not_found() {
        let registry = TaskRegistry::new();
        assert_eq!(
            registry.request_cancel("missing").await,
            Err(CancelError::NotFound)
        );
    }

    #[tokio::test]
    async fn cancel_sets_flag_and_is_idempotent() {
        let registry = TaskRegistry::new();
        let id = registry.create("download").await;
        let token = registry.cancel_token(&id).await.unwrap();
        assert!(!token.is_cancelled());

        registry.request_cancel(&id).await.unwrap();
        assert!(token.is_cancelled());
        registry.request_cancel(&id).await.unwrap();
        assert!(token.is_cancelled());
        assert_eq!(registry.get(&id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_on_terminal_task_is_rejected() {
        let registry = TaskRegistry::new();
        let id = registry.create("download").await;
        registry.start(&id, 10.0).await;
        assert!(registry.complete(&id, artifact("out.mp3")).await);

        assert_eq!(
            registry.request_cancel(&id).await,
            Err(CancelError::AlreadyFinished)
        );
        let task = registry.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(!task.cancel_flag.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn terminal_states_absorb_later_transitions() {
        let registry = TaskRegistry::new();
        let id = registry.create("transcode").await;
        registry.start(&id, 10.0).await;
        assert!(registry.fail(&id, "disk full").await);

        assert!(!registry.complete(&id, artifact("out.mp3")).await);
        assert!(!registry.cancelled(&id).await);
        registry.set_progress(&id, 50.0).await;

        let task = registry.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error.as_deref(), Some("disk full"));
        assert!(task.result.is_none());
        assert_eq!(task.progress, 10.0);
    }

    #[tokio::test]
    async fn completion_snaps_progress_to_100() {
        let registry = TaskRegistry::new();
        let id = registry.create("download").await;
        registry.start(&id, 10.0).await;
        registry.set_progress(&id, 63.0).await;
        registry.complete(&id, artifact("clip.mp4")).await;

        let task = registry.get(&id).await.unwrap();
        assert_eq!(task.progress, 100.0);
        assert_eq!(task.result.unwrap().file_name, "clip.mp4");
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let registry = TaskRegistry::new();
        let id = registry.create("download").await;
        registry.start(&id, 10.0).await;
        registry.set_progress(&id, 250.0).await;
        assert_eq!(registry.get(&id).await.unwrap().progress, 100.0);
        registry.set_progress(&id, -5.0).await;
        assert_eq!(registry.get(&id).await.unwrap().progress, 0.0);
    }

    #[tokio::test]
    async fn start_only_moves_pending_forward() {
        let registry = TaskRegistry::new();
        let id = registry.create("speech").await;
        registry.start(&id, 10.0).await;
        assert_eq!(
            registry.get(&id).await.unwrap().status,
            TaskStatus::Processing
        );

        registry.cancelled(&id).await;
        registry.start(&id, 10.0).await;
        assert_eq!(
            registry.get(&id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }
}
