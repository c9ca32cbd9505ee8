//! Camera subprocess supervision: spawns the camera command, reads its raw
//! H.264 Annex-B stdout, and emits framed NAL units on a bounded channel.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dropqueue::{self, DropOldestReceiver, DropOldestSender};
use crate::error::{AppError, Result};
use crate::nal::NalUnit;

/// Read buffer size for the camera's stdout pipe.
const READ_CHUNK: usize = 256 * 1024;

/// Default capacity of the NAL channel between the camera reader and the
/// broadcaster. On overflow the reader drops the *oldest* queued unit, never
/// the newest — blocking here would stall the camera's stdout pipe.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 2_000;

/// Incremental Annex-B framer over a byte stream that may arrive in arbitrary
/// chunks. Mirrors [`crate::nal::split_annex_b`]'s start-code rules but keeps
/// a pending prefix across calls instead of requiring the whole buffer up front.
#[derive(Default)]
pub struct NalSplitter {
    buf: Vec<u8>,
}

impl NalSplitter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed newly read bytes in; returns every NAL unit that is now fully
    /// framed (i.e. followed by a subsequent start code). Any trailing bytes
    /// after the last complete unit remain buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<NalUnit> {
        self.buf.extend_from_slice(chunk);

        let mut units = Vec::new();
        let Some((mut start, mut start_len)) = find_start_code(&self.buf, 0) else {
            // No start code seen yet at all; keep accumulating but bound growth
            // by discarding leading garbage before the first start code.
            if self.buf.len() > READ_CHUNK * 4 {
                self.buf.clear();
            }
            return units;
        };

        // Discard any bytes preceding the first start code; they can never
        // become a NAL unit.
        if start > 0 {
            self.buf.drain(0..start);
            start = 0;
        }

        loop {
            let payload_start = start + start_len;
            match find_start_code(&self.buf, payload_start) {
                Some((next_start, next_len)) => {
                    units.push(NalUnit::from_payload(&self.buf[payload_start..next_start]));
                    start = next_start;
                    start_len = next_len;
                }
                None => break,
            }
        }

        // Retain from the last (incomplete) start code onward.
        if start > 0 {
            self.buf.drain(0..start);
        }

        units
    }
}

fn find_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 {
            if buf[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= buf.len() && buf[i + 2] == 0 && buf[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Supervises the camera subprocess and owns the NAL emission channel.
pub struct CameraSource {
    command: String,
    running: Arc<AtomicBool>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    tx: std::sync::Mutex<Option<DropOldestSender<NalUnit>>>,
}

impl CameraSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            running: Arc::new(AtomicBool::new(false)),
            reader_task: std::sync::Mutex::new(None),
            child: Arc::new(tokio::sync::Mutex::new(None)),
            tx: std::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of NAL units dropped from the ingest channel so far (drop-oldest).
    pub fn dropped_count(&self) -> u64 {
        self.tx
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.dropped_count())
            .unwrap_or(0)
    }

    /// Spawns the camera command and returns the NAL receiver. Before
    /// spawning, makes a best-effort attempt to kill any prior instance of
    /// the same command (the camera device is exclusive).
    pub async fn start(&self, channel_capacity: usize) -> Result<DropOldestReceiver<NalUnit>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::Config("camera already running".into()));
        }

        self.kill_prior_instance().await;

        info!(command = %self.command, "spawning camera process");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AppError::Config(format!("failed to spawn camera process: {e}"))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            self.running.store(false, Ordering::SeqCst);
            AppError::Config("camera process has no stdout pipe".into())
        })?;

        *self.child.lock().await = Some(child);

        let (tx, rx) = dropqueue::channel(channel_capacity);
        *self.tx.lock().unwrap() = Some(tx.clone());
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            run_reader(stdout, tx, running).await;
        });

        *self.reader_task.lock().unwrap() = Some(handle);
        Ok(rx)
    }

    async fn kill_prior_instance(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            debug!("killing prior camera instance before respawn");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Stops the camera: sends a kill signal to the child, waits for the
    /// reader task to observe EOF, and marks the source as not running.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        let handle = self.reader_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Some(tx) = self.tx.lock().unwrap().take() {
            tx.close();
        }
        info!("camera stopped");
    }
}

async fn run_reader(
    mut stdout: tokio::process::ChildStdout,
    tx: DropOldestSender<NalUnit>,
    running: Arc<AtomicBool>,
) {
    let mut splitter = NalSplitter::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => {
                info!("camera stdout closed (EOF)");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!("camera stdout read failed: {e}");
                break;
            }
        };

        for unit in splitter.push(&chunk[..n]) {
            tx.push(unit);
        }
    }

    running.store(false, Ordering::SeqCst);
    tx.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_handles_arbitrary_chunk_boundaries() {
        let mut full = Vec::new();
        full.extend_from_slice(&[0, 0, 0, 1, 0x67, 1, 2, 3]);
        full.extend_from_slice(&[0, 0, 0, 1, 0x68, 4, 5]);
        full.extend_from_slice(&[0, 0, 0, 1, 0x65, 6, 7, 8, 9]);

        for split_at in 0..full.len() {
            let (a, b) = full.split_at(split_at);
            let mut splitter = NalSplitter::new();
            let mut units = splitter.push(a);
            units.extend(splitter.push(b));
            assert_eq!(units.len(), 2, "split at {split_at} produced {} units", units.len());
        }
    }

    #[test]
    fn splitter_emits_nothing_until_second_start_code_seen() {
        let mut splitter = NalSplitter::new();
        let units = splitter.push(&[0, 0, 0, 1, 0x67, 1, 2, 3]);
        assert!(units.is_empty());
        let units = splitter.push(&[0, 0, 0, 1, 0x65, 4]);
        assert_eq!(units.len(), 1);
        assert!(units[0].is_sps());
    }

    #[test]
    fn splitter_accepts_3_byte_start_codes() {
        let mut splitter = NalSplitter::new();
        let units = splitter.push(&[0, 0, 1, 0x67, 1, 0, 0, 1, 0x65, 2]);
        assert_eq!(units.len(), 1);
        assert!(units[0].data.starts_with(crate::nal::START_CODE));
    }
}
