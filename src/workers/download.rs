use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::{
    artifact_store::{find_task_output, finalize_with_title, remove_task_files},
    progress::{parse_percent, ProgressEstimator},
    work::{ArtifactSpec, WorkContext, WorkFunction, WorkOutcome, PROGRESS_CAP, PROGRESS_FLOOR},
    workers::{drive_child, spawn_tail_collector},
};

pub struct UrlDownload {
    pub url: String,
    pub quality: String,
}

fn format_selector(quality: &str) -> &'static str {
    match quality {
        "audio" => "bestaudio/best",
        "4k" => "bestvideo[height<=2160]+bestaudio/best[height<=2160]",
        "2k" => "bestvideo[height<=1440]+bestaudio/best[height<=1440]",
        "hd" => "bestvideo+bestaudio/best",
        "480p" => "bestvideo[height<=480]+bestaudio/best[height<=480]",
        "360p" => "bestvideo[height<=360]+bestaudio/best[height<=360]",
        "240p" => "bestvideo[height<=240]+bestaudio/best[height<=240]",
        "144p" => "bestvideo[height<=144]+bestaudio/best[height<=144]",
        _ => "best",
    }
}

enum AttemptEnd {
    Done,
    Cancelled,
    Failed(String),
}

#[async_trait]
impl WorkFunction for UrlDownload {
    fn kind(&self) -> &'static str {
        "download"
    }

    async fn run(self: Box<Self>, ctx: WorkContext) -> Result<WorkOutcome> {
        if ctx.cancel.is_cancelled() {
            return Ok(WorkOutcome::Cancelled { partial: None });
        }

        let title = probe_title(&ctx, &self.url).await;
        if ctx.cancel.is_cancelled() {
            return Ok(WorkOutcome::Cancelled { partial: None });
        }

        let audio_only = self.quality == "audio";
        let selector = format_selector(&self.quality);

        let mut end = run_attempt(&ctx, &self.url, selector, audio_only).await?;
        if let AttemptEnd::Failed(reason) = &end {
            if selector != "best" {
                warn!(
                    task_id = %ctx.task_id,
                    "Download failed ({reason}), retrying with format 'best'"
                );
                remove_task_files(&ctx.config.storage_root, &ctx.task_id).await?;
                end = run_attempt(&ctx, &self.url, "best", audio_only).await?;
            }
        }

        match end {
            AttemptEnd::Cancelled => {
                remove_task_files(&ctx.config.storage_root, &ctx.task_id).await?;
                Ok(WorkOutcome::Cancelled { partial: None })
            }
            AttemptEnd::Failed(reason) => {
                remove_task_files(&ctx.config.storage_root, &ctx.task_id).await?;
                anyhow::bail!("yt-dlp failed: {reason}");
            }
            AttemptEnd::Done => {
                let output = find_task_output(&ctx.config.storage_root, &ctx.task_id)
                    .await?
                    .context("Download finished but produced no output file")?;
                let ext = output
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or(if audio_only { "mp3" } else { "mp4" })
                    .to_string();
                let base_title = title.clone().unwrap_or_else(|| ctx.task_id.clone());
                let file_name =
                    finalize_with_title(&ctx.config.storage_root, &output, &base_title, &ext)
                        .await?;
                info!(task_id = %ctx.task_id, artifact = %file_name, "Download finished");
                Ok(WorkOutcome::Finished(ArtifactSpec { file_name, title }))
            }
        }
    }
}

async fn run_attempt(
    ctx: &WorkContext,
    url: &str,
    selector: &str,
    audio_only: bool,
) -> Result<AttemptEnd> {
    let template = ctx
        .config
        .storage_root
        .join(format!("{}.%(ext)s", ctx.task_id));

    let mut command = Command::new(&ctx.config.ytdlp_path);
    command
        .args(["--newline", "--no-playlist", "--no-warnings"])
        .args(["-f", selector])
        .arg("-o")
        .arg(&template);

    if audio_only {
        command.args(["-x", "--audio-format", "mp3", "--audio-quality", "192K"]);
    } else {
        command.args(["--merge-output-format", "mp4"]);
    }

    if let Some(cookies) = &ctx.config.cookies_file {
        command.arg("--cookies").arg(cookies);
    }

    let mut child = command
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to launch {}", ctx.config.ytdlp_path.display()))?;

    let stdout = child.stdout.take().context("yt-dlp stdout not captured")?;
    let stderr = child.stderr.take().context("yt-dlp stderr not captured")?;
    let stderr_tail = spawn_tail_collector(stderr);

    let estimator = ProgressEstimator::new(PROGRESS_FLOOR, PROGRESS_CAP);
    let run = drive_child(child, stdout, &ctx.cancel, &ctx.progress, |line| {
        parse_percent(line).map(|percent| estimator.from_percent(percent))
    })
    .await?;

    if run.cancelled() {
        stderr_tail.abort();
        return Ok(AttemptEnd::Cancelled);
    }

    if !run.succeeded() {
        let mut reason = stderr_tail.await.unwrap_or_default().join(" | ");
        if reason.is_empty() {
            reason = run.diagnostics();
        }
        return Ok(AttemptEnd::Failed(reason));
    }

    Ok(AttemptEnd::Done)
}

async fn probe_title(ctx: &WorkContext, url: &str) -> Option<String> {
    let mut command = Command::new(&ctx.config.ytdlp_path);
    command
        .args(["--skip-download", "--no-playlist", "--no-warnings"])
        .args(["--print", "title"]);

    if let Some(cookies) = &ctx.config.cookies_file {
        command.arg("--cookies").arg(cookies);
    }

    match command.arg(url).stdin(Stdio::null()).output().await {
        Ok(output) if output.status.success() => {
            let title = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            (!title.is_empty()).then_some(title)
        }
        Ok(_) => None,
        Err(err) => {
            warn!(task_id = %ctx.task_id, "Title probe failed: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_quality_to_format_selector() {
        assert_eq!(format_selector("audio"), "bestaudio/best");
        assert_eq!(format_selector("hd"), "bestvideo+bestaudio/best");
        assert_eq!(
            format_selector("480p"),
            "bestvideo[height<=480]+bestaudio/best[height<=480]"
        );
        assert_eq!(format_selector("potato"), "best");
    }
}
