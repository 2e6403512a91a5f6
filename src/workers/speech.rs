use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    artifact_store::{delete_file_if_exists, task_output_path},
    work::{ArtifactSpec, WorkContext, WorkFunction, WorkOutcome},
    workers::{spawn_tail_collector, wait_with_cancel},
};

pub struct TextToSpeech {
    pub text: String,
    pub voice: String,
}

fn voice_lang(voice: &str) -> &'static str {
    match voice {
        "robot" => "en",
        _ => "fr",
    }
}

#[async_trait]
impl WorkFunction for TextToSpeech {
    fn kind(&self) -> &'static str {
        "convert-text"
    }

    async fn run(self: Box<Self>, ctx: WorkContext) -> Result<WorkOutcome> {
        if ctx.cancel.is_cancelled() {
            return Ok(WorkOutcome::Cancelled { partial: None });
        }

        let wav = task_output_path(&ctx.config.storage_root, &ctx.task_id, "wav");
        let mp3 = task_output_path(&ctx.config.storage_root, &ctx.task_id, "mp3");

        let mut child = Command::new(&ctx.config.espeak_path)
            .args(["-v", voice_lang(&self.voice), "--stdin", "-w"])
            .arg(&wav)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch {}", ctx.config.espeak_path.display()))?;

        let mut stdin = child.stdin.take().context("espeak stdin not captured")?;
        let stderr = child.stderr.take().context("espeak stderr not captured")?;
        let stderr_tail = spawn_tail_collector(stderr);
        stdin
            .write_all(self.text.as_bytes())
            .await
            .context("Failed to feed text to espeak")?;
        drop(stdin);

        let status = wait_with_cancel(&mut child, &ctx.cancel).await?;
        match status {
            None => {
                stderr_tail.abort();
                delete_file_if_exists(&wav).await?;
                return Ok(WorkOutcome::Cancelled { partial: None });
            }
            Some(status) if !status.success() => {
                delete_file_if_exists(&wav).await?;
                let tail = stderr_tail.await.unwrap_or_default().join(" | ");
                anyhow::bail!("espeak failed: {tail}");
            }
            Some(_) => {}
        }

        ctx.progress.set(50.0).await;

        if ctx.cancel.is_cancelled() {
            delete_file_if_exists(&wav).await?;
            return Ok(WorkOutcome::Cancelled { partial: None });
        }

        let encode = Command::new(&ctx.config.ffmpeg_path)
            .arg("-y")
            .arg("-i")
            .arg(&wav)
            .args(["-acodec", "libmp3lame", "-q:a", "4"])
            .arg(&mp3)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to launch {}", ctx.config.ffmpeg_path.display()))?;

        delete_file_if_exists(&wav).await?;

        if !encode.status.success() {
            delete_file_if_exists(&mp3).await?;
            let stderr = String::from_utf8_lossy(&encode.stderr);
            let tail = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            anyhow::bail!("ffmpeg failed encoding speech: {tail}");
        }

        ctx.progress.set(90.0).await;

        if ctx.cancel.is_cancelled() {
            return Ok(WorkOutcome::Cancelled { partial: Some(mp3) });
        }

        let file_name = mp3
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .context("Output file name is not valid UTF-8")?;
        Ok(WorkOutcome::Finished(ArtifactSpec {
            file_name,
            title: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_voice_to_language() {
        assert_eq!(voice_lang("robot"), "en");
        assert_eq!(voice_lang("thomas"), "fr");
        assert_eq!(voice_lang("default"), "fr");
    }
}
