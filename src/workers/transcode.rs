use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

use crate::{
    artifact_store::{delete_file_if_exists, task_output_path},
    progress::{parse_duration_line, parse_time_position, ProgressEstimator},
    work::{ArtifactSpec, WorkContext, WorkFunction, WorkOutcome, PROGRESS_CAP, PROGRESS_FLOOR},
    workers::drive_child,
};

pub struct MediaTranscode {
    pub input: PathBuf,
}

#[async_trait]
impl WorkFunction for MediaTranscode {
    fn kind(&self) -> &'static str {
        "convert-video"
    }

    async fn run(self: Box<Self>, ctx: WorkContext) -> Result<WorkOutcome> {
        let outcome = extract_audio(&ctx, &self.input).await;
        if let Err(err) = delete_file_if_exists(&self.input).await {
            warn!(task_id = %ctx.task_id, "Failed removing staged input: {err:#}");
        }
        outcome
    }
}

async fn extract_audio(ctx: &WorkContext, input: &Path) -> Result<WorkOutcome> {
    if ctx.cancel.is_cancelled() {
        return Ok(WorkOutcome::Cancelled { partial: None });
    }

    let mut estimator = ProgressEstimator::new(PROGRESS_FLOOR, PROGRESS_CAP);
    match probe_duration(ctx, input).await {
        Ok(Some(seconds)) => estimator.set_total(seconds),
        Ok(None) => {}
        Err(err) => warn!(task_id = %ctx.task_id, "Duration probe failed: {err:#}"),
    }
    if !estimator.has_total() {
        warn!(task_id = %ctx.task_id, "No duration available, progress falls back to checkpoints");
    }

    let output = task_output_path(&ctx.config.storage_root, &ctx.task_id, "mp3");
    let mut child = Command::new(&ctx.config.ffmpeg_path)
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-vn")
        .args(["-acodec", "libmp3lame", "-q:a", "2"])
        .arg(&output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to launch {}", ctx.config.ffmpeg_path.display()))?;

    let stderr = child.stderr.take().context("ffmpeg stderr not captured")?;
    let run = drive_child(child, stderr, &ctx.cancel, &ctx.progress, |line| {
        if let Some(total) = parse_duration_line(line) {
            estimator.set_total(total);
        }
        parse_time_position(line).map(|pos| estimator.estimate(pos))
    })
    .await?;

    if run.cancelled() {
        return Ok(WorkOutcome::Cancelled {
            partial: Some(output),
        });
    }

    if !run.succeeded() {
        delete_file_if_exists(&output).await?;
        anyhow::bail!("ffmpeg failed: {}", run.diagnostics());
    }

    let file_name = output
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .context("Output file name is not valid UTF-8")?;
    Ok(WorkOutcome::Finished(ArtifactSpec {
        file_name,
        title: None,
    }))
}

async fn probe_duration(ctx: &WorkContext, input: &Path) -> Result<Option<f64>> {
    let output = Command::new(&ctx.config.ffprobe_path)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
        ])
        .arg(input)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to launch {}", ctx.config.ffprobe_path.display()))?;

    if !output.status.success() {
        return Ok(None);
    }

    let parsed = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f64>()
        .ok();
    Ok(parsed.filter(|seconds| seconds.is_finite() && *seconds > 0.0))
}
