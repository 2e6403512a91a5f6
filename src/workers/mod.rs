use std::{collections::VecDeque, process::ExitStatus, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    time,
};

use crate::{registry::CancelToken, work::ProgressHandle};

pub mod download;
pub mod speech;
pub mod transcode;

const TAIL_LINES: usize = 8;

pub(crate) struct ChildRun {
    pub status: Option<ExitStatus>,
    pub tail: Vec<String>,
}

impl ChildRun {
    pub fn cancelled(&self) -> bool {
        self.status.is_none()
    }

    pub fn succeeded(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn diagnostics(&self) -> String {
        if self.tail.is_empty() {
            "no diagnostic output".to_string()
        } else {
            self.tail.join(" | ")
        }
    }
}

pub(crate) fn spawn_tail_collector<R>(stream: R) -> tokio::task::JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.trim().to_string());
        }
        tail.into()
    })
}

pub(crate) async fn wait_with_cancel(
    child: &mut Child,
    cancel: &CancelToken,
) -> Result<Option<ExitStatus>> {
    let mut poll = time::interval(Duration::from_millis(250));
    loop {
        if cancel.is_cancelled() {
            child.kill().await.ok();
            return Ok(None);
        }
        tokio::select! {
            status = child.wait() => return Ok(Some(status?)),
            _ = poll.tick() => {}
        }
    }
}

pub(crate) async fn drive_child<R, F>(
    mut child: Child,
    stream: R,
    cancel: &CancelToken,
    progress: &ProgressHandle,
    mut map_line: F,
) -> Result<ChildRun>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str) -> Option<f64>,
{
    let mut lines = BufReader::new(stream).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
    let mut poll = time::interval(Duration::from_millis(250));

    loop {
        if cancel.is_cancelled() {
            child.kill().await.ok();
            return Ok(ChildRun {
                status: None,
                tail: tail.into(),
            });
        }

        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !line.trim().is_empty() {
                        if tail.len() == TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.trim().to_string());
                    }
                    if let Some(progress_value) = map_line(&line) {
                        progress.set(progress_value).await;
                    }
                }
                None => break,
            },
            _ = poll.tick() => {}
        }
    }

    let status = child.wait().await?;
    Ok(ChildRun {
        status: Some(status),
        tail: tail.into(),
    })
}
