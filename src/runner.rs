use tracing::{error, info, warn};

use crate::{
    artifact_store::delete_file_if_exists,
    history::HistoryEntry,
    models::TaskResult,
    work::{ProgressHandle, WorkContext, WorkFunction, WorkOutcome, PROGRESS_FLOOR},
    AppState,
};

pub fn spawn(state: AppState, task_id: String, work: Box<dyn WorkFunction>) {
    tokio::spawn(async move {
        supervise(state, task_id, work).await;
    });
}

async fn supervise(state: AppState, task_id: String, work: Box<dyn WorkFunction>) {
    let registry = state.registry.clone();
    let kind = work.kind();

    let Some(cancel) = registry.cancel_token(&task_id).await else {
        warn!(task_id = %task_id, kind, "No task record for launched work");
        return;
    };

    registry.start(&task_id, PROGRESS_FLOOR).await;
    info!(task_id = %task_id, kind, "Task processing");

    let ctx = WorkContext {
        task_id: task_id.clone(),
        config: state.config.clone(),
        progress: ProgressHandle::new(registry.clone(), task_id.clone()),
        cancel,
    };

    let outcome = match tokio::spawn(work.run(ctx)).await {
        Ok(outcome) => outcome,
        Err(err) => Err(anyhow::anyhow!("work function panicked: {err}")),
    };

    match outcome {
        Ok(WorkOutcome::Finished(artifact)) => {
            let result = TaskResult {
                file_name: artifact.file_name.clone(),
                download_url: format!("/files/{}", artifact.file_name),
                title: artifact.title,
            };
            registry.complete(&task_id, result).await;
            info!(task_id = %task_id, kind, artifact = %artifact.file_name, "Task completed");
        }
        Ok(WorkOutcome::Cancelled { partial }) => {
            if let Some(path) = partial {
                if let Err(err) = delete_file_if_exists(&path).await {
                    warn!(
                        task_id = %task_id,
                        "Failed removing partial output {}: {err:#}",
                        path.display()
                    );
                }
            }
            registry.cancelled(&task_id).await;
            info!(task_id = %task_id, kind, "Task cancelled");
        }
        Err(err) => {
            let message = format!("{err:#}");
            error!(task_id = %task_id, kind, "Task failed: {message}");
            registry.fail(&task_id, message).await;
        }
    }

    if let Some(task) = registry.get(&task_id).await {
        let entry = HistoryEntry {
            task_id: task.id.clone(),
            kind: task.kind.to_string(),
            status: task.status.as_str().to_string(),
            file_name: task.result.as_ref().map(|r| r.file_name.clone()),
            error: task.error.clone(),
            finished_at: task.updated_at,
        };
        let history = state.history.clone();
        match tokio::task::spawn_blocking(move || history.record_task(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(task_id = %task_id, "Failed to record history: {err:#}"),
            Err(err) => warn!(task_id = %task_id, "History write join error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    };

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::{fs, time};

    use super::*;
    use crate::{
        config::Config,
        history::HistoryStore,
        models::TaskStatus,
        registry::TaskRegistry,
        work::ArtifactSpec,
    };

    fn test_state(root: &Path) -> AppState {
        AppState {
            config: Config {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                storage_root: root.to_path_buf(),
                history_db: root.join("history.db"),
                retention_seconds: 3600,
                max_upload_bytes: 1024,
                ffmpeg_path: "ffmpeg".into(),
                ffprobe_path: "ffprobe".into(),
                ytdlp_path: "yt-dlp".into(),
                espeak_path: "espeak-ng".into(),
                cookies_file: None,
            },
            registry: Arc::new(TaskRegistry::new()),
            history: Arc::new(HistoryStore::open_in_memory().unwrap()),
        }
    }

    async fn wait_for_terminal(state: &AppState, id: &str) -> crate::models::TaskRecord {
        for _ in 0..200 {
            let task = state.registry.get(id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    struct SleepThenFinish {
        delay: Duration,
        artifact: String,
    }

    #[async_trait]
    impl WorkFunction for SleepThenFinish {
        fn kind(&self) -> &'static str {
            "sleepy"
        }

        async fn run(self: Box<Self>, ctx: WorkContext) -> Result<WorkOutcome> {
            time::sleep(self.delay).await;
            ctx.progress.set(60.0).await;
            let path = ctx.config.storage_root.join(&self.artifact);
            fs::write(&path, b"data").await?;
            Ok(WorkOutcome::Finished(ArtifactSpec {
                file_name: self.artifact,
                title: None,
            }))
        }
    }

    struct CancelAware {
        partial: PathBuf,
    }

    #[async_trait]
    impl WorkFunction for CancelAware {
        fn kind(&self) -> &'static str {
            "cancel-aware"
        }

        async fn run(self: Box<Self>, ctx: WorkContext) -> Result<WorkOutcome> {
            fs::write(&self.partial, b"partial").await?;
            for _ in 0..100 {
                if ctx.cancel.is_cancelled() {
                    return Ok(WorkOutcome::Cancelled {
                        partial: Some(self.partial),
                    });
                }
                time::sleep(Duration::from_millis(10)).await;
            }
            Ok(WorkOutcome::Finished(ArtifactSpec {
                file_name: "never.mp3".into(),
                title: None,
            }))
        }
    }

    struct FailsWith(&'static str);

    #[async_trait]
    impl WorkFunction for FailsWith {
        fn kind(&self) -> &'static str {
            "failing"
        }

        async fn run(self: Box<Self>, _ctx: WorkContext) -> Result<WorkOutcome> {
            anyhow::bail!("{}", self.0)
        }
    }

    struct Panics;

    #[async_trait]
    impl WorkFunction for Panics {
        fn kind(&self) -> &'static str {
            "panicking"
        }

        async fn run(self: Box<Self>, _ctx: WorkContext) -> Result<WorkOutcome> {
            panic!("unreachable tool state")
        }
    }

    #[tokio::test]
    async fn job_runs_off_request_path_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = state.registry.create("sleepy").await;

        spawn(
            state.clone(),
            id.clone(),
            Box::new(SleepThenFinish {
                delay: Duration::from_millis(200),
                artifact: "X".into(),
            }),
        );

        time::sleep(Duration::from_millis(50)).await;
        let task = state.registry.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.progress > 0.0);

        let task = wait_for_terminal(&state, &id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100.0);
        let result = task.result.unwrap();
        assert_eq!(result.file_name, "X");
        assert_eq!(result.download_url, "/files/X");
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn immediate_cancel_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = state.registry.create("cancel-aware").await;
        let partial = dir.path().join("partial.mp4");

        state.registry.request_cancel(&id).await.unwrap();
        spawn(
            state.clone(),
            id.clone(),
            Box::new(CancelAware {
                partial: partial.clone(),
            }),
        );

        let task = wait_for_terminal(&state, &id).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.result.is_none());
        assert!(task.error.is_none());
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn cancel_during_processing_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = state.registry.create("cancel-aware").await;
        let partial = dir.path().join("partial.mp4");

        spawn(
            state.clone(),
            id.clone(),
            Box::new(CancelAware {
                partial: partial.clone(),
            }),
        );

        time::sleep(Duration::from_millis(50)).await;
        state.registry.request_cancel(&id).await.unwrap();

        let task = wait_for_terminal(&state, &id).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn failure_is_contained_and_message_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = state.registry.create("failing").await;

        spawn(state.clone(), id.clone(), Box::new(FailsWith("disk full")));

        let task = wait_for_terminal(&state, &id).await;
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.error.unwrap().contains("disk full"));
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn panic_in_work_function_becomes_error_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = state.registry.create("panicking").await;

        spawn(state.clone(), id.clone(), Box::new(Panics));

        let task = wait_for_terminal(&state, &id).await;
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn concurrent_jobs_do_not_interfere() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let mut ids = Vec::new();
        for i in 0u64..16 {
            let id = state.registry.create("sleepy").await;
            spawn(
                state.clone(),
                id.clone(),
                Box::new(SleepThenFinish {
                    delay: Duration::from_millis(20 + (i % 4) * 15),
                    artifact: format!("out-{i}.mp3"),
                }),
            );
            ids.push((id, format!("out-{i}.mp3")));
        }

        let unique: std::collections::HashSet<_> = ids.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(unique.len(), 16);

        for (id, artifact) in ids {
            let task = wait_for_terminal(&state, &id).await;
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.result.unwrap().file_name, artifact);
        }
    }

    #[tokio::test]
    async fn terminal_outcome_is_recorded_in_history() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let id = state.registry.create("failing").await;

        spawn(state.clone(), id.clone(), Box::new(FailsWith("disk full")));
        wait_for_terminal(&state, &id).await;

        time::sleep(Duration::from_millis(50)).await;
        let entries = state.history.recent_tasks(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, id);
        assert_eq!(entries[0].status, "error");
        assert!(entries[0].error.as_deref().unwrap().contains("disk full"));
    }
}
