use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub storage_root: PathBuf,
    pub history_db: PathBuf,
    pub retention_seconds: u64,
    pub max_upload_bytes: usize,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub ytdlp_path: PathBuf,
    pub espeak_path: PathBuf,
    pub cookies_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("MEDIAFORGE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:5000".to_string());
        let bind_addr = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 5000)));

        let storage_root = PathBuf::from(
            env::var("MEDIAFORGE_STORAGE_ROOT").unwrap_or_else(|_| "downloads".to_string()),
        );

        let history_db = PathBuf::from(
            env::var("MEDIAFORGE_HISTORY_DB").unwrap_or_else(|_| "history.db".to_string()),
        );

        let retention_seconds = env::var("MEDIAFORGE_RETENTION_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(24 * 60 * 60);

        let max_upload_bytes = env::var("MEDIAFORGE_MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(512 * 1024 * 1024);

        let cookies_file = resolve_cookies_file();

        Ok(Self {
            bind_addr,
            storage_root,
            history_db,
            retention_seconds,
            max_upload_bytes,
            ffmpeg_path: resolve_tool("ffmpeg", "MEDIAFORGE_FFMPEG_PATH"),
            ffprobe_path: resolve_tool("ffprobe", "MEDIAFORGE_FFPROBE_PATH"),
            ytdlp_path: resolve_tool("yt-dlp", "MEDIAFORGE_YTDLP_PATH"),
            espeak_path: resolve_tool("espeak-ng", "MEDIAFORGE_ESPEAK_PATH"),
            cookies_file,
        })
    }
}

fn resolve_tool(name: &str, env_key: &str) -> PathBuf {
    if let Ok(value) = env::var(env_key) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    let local = PathBuf::from("bin").join(name);
    if local.exists() {
        return local;
    }

    PathBuf::from(name)
}

fn resolve_cookies_file() -> Option<PathBuf> {
    if let Ok(value) = env::var("MEDIAFORGE_COOKIES_FILE") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let local = PathBuf::from("cookies.txt");
    if local.exists() {
        return Some(local);
    }
    None
}
