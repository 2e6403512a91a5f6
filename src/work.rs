use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    config::Config,
    registry::{CancelToken, TaskRegistry},
};

pub const PROGRESS_FLOOR: f64 = 10.0;
pub const PROGRESS_CAP: f64 = 95.0;

#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    pub file_name: String,
    pub title: Option<String>,
}

#[derive(Debug)]
pub enum WorkOutcome {
    Finished(ArtifactSpec),
    Cancelled { partial: Option<PathBuf> },
}

#[derive(Clone)]
pub struct ProgressHandle {
    registry: Arc<TaskRegistry>,
    task_id: String,
}

impl ProgressHandle {
    pub fn new(registry: Arc<TaskRegistry>, task_id: String) -> Self {
        Self { registry, task_id }
    }

    pub async fn set(&self, progress: f64) {
        self.registry.set_progress(&self.task_id, progress).await;
    }
}

pub struct WorkContext {
    pub task_id: String,
    pub config: Config,
    pub progress: ProgressHandle,
    pub cancel: CancelToken,
}

#[async_trait]
pub trait WorkFunction: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    async fn run(self: Box<Self>, ctx: WorkContext) -> Result<WorkOutcome>;
}
