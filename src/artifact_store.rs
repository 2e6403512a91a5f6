use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{fs, time};
use tracing::{info, warn};

use crate::config::Config;

pub async fn ensure_storage_root(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create storage root at {}", path.display()))
}

pub fn staged_input_path(root: &Path, task_id: &str, original_name: &str) -> PathBuf {
    let safe = sanitize_file_name(original_name);
    root.join(format!("{task_id}_{safe}"))
}

pub fn task_output_path(root: &Path, task_id: &str, ext: &str) -> PathBuf {
    root.join(format!("{task_id}.{ext}"))
}

pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') && !c.is_control())
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "media".to_string()
    } else {
        trimmed.to_string()
    }
}

pub async fn finalize_with_title(
    root: &Path,
    current: &Path,
    title: &str,
    ext: &str,
) -> Result<String> {
    let base = sanitize_file_name(title);
    let mut file_name = format!("{base}.{ext}");
    let mut counter = 1;
    while root.join(&file_name) != current
        && fs::try_exists(root.join(&file_name)).await.unwrap_or(false)
    {
        file_name = format!("{base} ({counter}).{ext}");
        counter += 1;
    }

    let target = root.join(&file_name);
    fs::rename(current, &target).await.with_context(|| {
        format!(
            "Failed to move {} to {}",
            current.display(),
            target.display()
        )
    })?;
    Ok(file_name)
}

pub fn artifact_path(root: &Path, file_name: &str) -> Option<PathBuf> {
    if file_name.is_empty()
        || file_name.contains('/')
        || file_name.contains('\\')
        || file_name.contains("..")
    {
        return None;
    }
    Some(root.join(file_name))
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

pub async fn remove_task_files(root: &Path, task_id: &str) -> Result<()> {
    let mut entries = fs::read_dir(root)
        .await
        .with_context(|| format!("Failed to list {}", root.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(task_id) {
            delete_file_if_exists(&entry.path()).await?;
        }
    }
    Ok(())
}

pub async fn find_task_output(root: &Path, task_id: &str) -> Result<Option<PathBuf>> {
    let prefix = format!("{task_id}.");
    let mut entries = fs::read_dir(root)
        .await
        .with_context(|| format!("Failed to list {}", root.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(&prefix) && !name.ends_with(".part") && !name.ends_with(".ytdl") {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

pub fn spawn_cleanup_worker(config: Config) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_expired_artifacts(&config).await {
                warn!("Cleanup worker error: {err:#}");
            }
        }
    });
}

async fn cleanup_expired_artifacts(config: &Config) -> Result<()> {
    let retention = Duration::from_secs(config.retention_seconds);
    let mut entries = fs::read_dir(&config.storage_root)
        .await
        .with_context(|| format!("Failed to list {}", config.storage_root.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("Failed to stat {}: {err}", entry.path().display());
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let expired = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age > retention)
            .unwrap_or(false);

        if expired {
            info!("Expiring artifact {}", entry.path().display());
            if let Err(err) = delete_file_if_exists(&entry.path()).await {
                warn!("Failed to delete expired artifact: {err:#}");
            }
        }
    }

    Ok(())
}
