//! Per-task output buffering with bounded memory and spill-to-file.
//!
//! Chunks are appended under a single lock, so concurrent appenders for
//! the same task serialise and each append is one read-modify-write step.
//! When a task's buffer exceeds the byte cap, the globally oldest chunks
//! (across both streams) are evicted and readers see a truncation marker
//! prepended. At persist time, output larger than the file threshold is
//! written to a sidecar JSON file and only the path is kept in SQL.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use delegate_db::queries::outputs;

use crate::config::DelegateConfig;
use crate::events::OutputStream;

/// Marker readers see in place of evicted chunks.
pub const TRUNCATION_MARKER: &str = "[earlier output truncated]";

#[derive(Debug, Default)]
struct TaskBuffer {
    stdout: VecDeque<(u64, String)>,
    stderr: VecDeque<(u64, String)>,
    /// Bytes currently held in the two deques.
    buffered_bytes: usize,
    /// Bytes ever captured, eviction notwithstanding.
    total_bytes: usize,
    truncated: bool,
    seq: u64,
}

/// Snapshot of a task's captured output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub task_id: Uuid,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub total_size: usize,
    pub truncated: bool,
}

/// Shared output capture for all live workers.
pub struct OutputCapture {
    max_buffer_bytes: usize,
    file_threshold: usize,
    output_dir: PathBuf,
    buffers: Mutex<HashMap<Uuid, TaskBuffer>>,
}

impl OutputCapture {
    pub fn new(config: &DelegateConfig, output_dir: PathBuf) -> Self {
        Self {
            max_buffer_bytes: config.max_output_buffer as usize,
            file_threshold: config.file_storage_threshold_bytes as usize,
            output_dir,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Append one chunk. Returns the chunk size in bytes.
    pub fn capture(&self, task_id: Uuid, stream: OutputStream, chunk: &str) -> usize {
        let bytes = chunk.len();
        let mut buffers = self.buffers.lock().expect("capture buffers poisoned");
        let buffer = buffers.entry(task_id).or_default();

        buffer.seq += 1;
        let seq = buffer.seq;
        match stream {
            OutputStream::Stdout => buffer.stdout.push_back((seq, chunk.to_string())),
            OutputStream::Stderr => buffer.stderr.push_back((seq, chunk.to_string())),
        }
        buffer.buffered_bytes += bytes;
        buffer.total_bytes += bytes;

        // Evict the globally oldest chunks until we fit again.
        while buffer.buffered_bytes > self.max_buffer_bytes {
            let evicted = match (buffer.stdout.front(), buffer.stderr.front()) {
                (Some((a, _)), Some((b, _))) => {
                    if a < b {
                        buffer.stdout.pop_front()
                    } else {
                        buffer.stderr.pop_front()
                    }
                }
                (Some(_), None) => buffer.stdout.pop_front(),
                (None, Some(_)) => buffer.stderr.pop_front(),
                (None, None) => None,
            };
            match evicted {
                Some((_, chunk)) => {
                    buffer.buffered_bytes -= chunk.len();
                    buffer.truncated = true;
                }
                None => break,
            }
        }

        bytes
    }

    /// Snapshot a task's output. With `tail = Some(n)`, only the last `n`
    /// lines per stream are returned.
    pub fn get_output(&self, task_id: Uuid, tail: Option<usize>) -> Option<CapturedOutput> {
        let buffers = self.buffers.lock().expect("capture buffers poisoned");
        let buffer = buffers.get(&task_id)?;

        let mut stdout: Vec<String> = buffer.stdout.iter().map(|(_, c)| c.clone()).collect();
        let mut stderr: Vec<String> = buffer.stderr.iter().map(|(_, c)| c.clone()).collect();
        if buffer.truncated {
            stdout.insert(0, TRUNCATION_MARKER.to_string());
        }
        if let Some(n) = tail {
            stdout = tail_lines(&stdout, n);
            stderr = tail_lines(&stderr, n);
        }

        Some(CapturedOutput {
            task_id,
            stdout,
            stderr,
            total_size: buffer.total_bytes,
            truncated: buffer.truncated,
        })
    }

    /// Persist a task's buffer to the repository, spilling to a file when
    /// it exceeds the threshold, then drop the in-memory buffer.
    pub async fn persist_and_release(&self, pool: &SqlitePool, task_id: Uuid) -> Result<()> {
        let snapshot = {
            let mut buffers = self.buffers.lock().expect("capture buffers poisoned");
            let Some(buffer) = buffers.remove(&task_id) else {
                return Ok(());
            };
            let mut stdout: Vec<String> = buffer.stdout.into_iter().map(|(_, c)| c).collect();
            let stderr: Vec<String> = buffer.stderr.into_iter().map(|(_, c)| c).collect();
            if buffer.truncated {
                stdout.insert(0, TRUNCATION_MARKER.to_string());
            }
            CapturedOutput {
                task_id,
                stdout,
                stderr,
                total_size: buffer.total_bytes,
                truncated: buffer.truncated,
            }
        };

        let buffered: usize = snapshot.stdout.iter().map(String::len).sum::<usize>()
            + snapshot.stderr.iter().map(String::len).sum::<usize>();

        if buffered > self.file_threshold {
            std::fs::create_dir_all(&self.output_dir).with_context(|| {
                format!(
                    "failed to create output directory {}",
                    self.output_dir.display()
                )
            })?;
            let file_path = self.output_dir.join(format!("{task_id}.json"));
            let contents =
                serde_json::to_string_pretty(&snapshot).context("failed to serialize output")?;
            std::fs::write(&file_path, contents)
                .with_context(|| format!("failed to write {}", file_path.display()))?;
            outputs::mark_spilled(
                pool,
                task_id,
                &file_path.to_string_lossy(),
                snapshot.total_size as i64,
            )
            .await?;
        } else {
            outputs::upsert_output(
                pool,
                task_id,
                &snapshot.stdout,
                &snapshot.stderr,
                snapshot.total_size as i64,
                snapshot.truncated,
            )
            .await?;
        }

        Ok(())
    }

    /// Drop a task's buffer without persisting.
    pub fn release(&self, task_id: Uuid) {
        self.buffers
            .lock()
            .expect("capture buffers poisoned")
            .remove(&task_id);
    }
}

/// Last `n` lines across the given chunks.
fn tail_lines(chunks: &[String], n: usize) -> Vec<String> {
    let joined = chunks.concat();
    let lines: Vec<&str> = joined.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture_with(max_buffer: u64, threshold: u64, dir: PathBuf) -> OutputCapture {
        let mut config = DelegateConfig::default();
        config.max_output_buffer = max_buffer;
        config.file_storage_threshold_bytes = threshold;
        OutputCapture::new(&config, dir)
    }

    #[test]
    fn capture_and_get_roundtrip() {
        let capture = capture_with(1024, 1024, PathBuf::from("/tmp"));
        let id = Uuid::new_v4();

        capture.capture(id, OutputStream::Stdout, "line one\n");
        capture.capture(id, OutputStream::Stderr, "warning\n");
        capture.capture(id, OutputStream::Stdout, "line two\n");

        let output = capture.get_output(id, None).unwrap();
        assert_eq!(output.stdout, vec!["line one\n", "line two\n"]);
        assert_eq!(output.stderr, vec!["warning\n"]);
        assert_eq!(output.total_size, 26);
        assert!(!output.truncated);
    }

    #[test]
    fn get_missing_task_is_none() {
        let capture = capture_with(1024, 1024, PathBuf::from("/tmp"));
        assert!(capture.get_output(Uuid::new_v4(), None).is_none());
    }

    #[test]
    fn overflow_evicts_oldest_and_marks_truncation() {
        // 32-byte budget; each chunk is 10 bytes.
        let capture = capture_with(32, 1024, PathBuf::from("/tmp"));
        let id = Uuid::new_v4();

        for i in 0..5 {
            capture.capture(id, OutputStream::Stdout, &format!("chunk-{i:03}\n"));
        }

        let output = capture.get_output(id, None).unwrap();
        assert!(output.truncated);
        assert_eq!(output.stdout[0], TRUNCATION_MARKER);
        // The last chunks survive.
        assert!(output.stdout.last().unwrap().contains("chunk-004"));
        // total_size still counts everything ever captured.
        assert_eq!(output.total_size, 50);
    }

    #[test]
    fn eviction_is_oldest_first_across_streams() {
        let capture = capture_with(24, 1024, PathBuf::from("/tmp"));
        let id = Uuid::new_v4();

        capture.capture(id, OutputStream::Stderr, "e-oldest\n"); // 9 bytes
        capture.capture(id, OutputStream::Stdout, "o-middle\n"); // 9 bytes
        capture.capture(id, OutputStream::Stdout, "o-newest\n"); // 9 bytes -> evict stderr front

        let output = capture.get_output(id, None).unwrap();
        assert!(output.stderr.is_empty());
        assert_eq!(output.stdout.len(), 3); // marker + two chunks
        assert_eq!(output.stdout[0], TRUNCATION_MARKER);
    }

    #[test]
    fn tail_returns_last_lines_per_stream() {
        let capture = capture_with(4096, 1024, PathBuf::from("/tmp"));
        let id = Uuid::new_v4();

        capture.capture(id, OutputStream::Stdout, "a\nb\nc\n");
        capture.capture(id, OutputStream::Stdout, "d\ne\n");
        capture.capture(id, OutputStream::Stderr, "x\ny\n");

        let output = capture.get_output(id, Some(2)).unwrap();
        assert_eq!(output.stdout, vec!["d", "e"]);
        assert_eq!(output.stderr, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn persist_small_output_stays_in_sql() {
        let pool = delegate_db::pool::create_memory_pool().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let capture = capture_with(4096, 1024, tmp.path().to_path_buf());

        let task = delegate_db::queries::tasks::insert_task(
            &pool,
            &delegate_db::models::NewTask::new("t", "/tmp"),
        )
        .await
        .unwrap();

        capture.capture(task.id, OutputStream::Stdout, "short output\n");
        capture.persist_and_release(&pool, task.id).await.unwrap();

        let row = outputs::get_output(&pool, task.id).await.unwrap().unwrap();
        assert_eq!(row.stdout.0, vec!["short output\n"]);
        assert!(row.file_path.is_none());
        // Buffer is gone after persist.
        assert!(capture.get_output(task.id, None).is_none());
    }

    #[tokio::test]
    async fn persist_large_output_spills_to_file() {
        let pool = delegate_db::pool::create_memory_pool().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let capture = capture_with(1024 * 1024, 64, tmp.path().join("output"));

        let task = delegate_db::queries::tasks::insert_task(
            &pool,
            &delegate_db::models::NewTask::new("t", "/tmp"),
        )
        .await
        .unwrap();

        let big = "x".repeat(256);
        capture.capture(task.id, OutputStream::Stdout, &big);
        capture.persist_and_release(&pool, task.id).await.unwrap();

        let row = outputs::get_output(&pool, task.id).await.unwrap().unwrap();
        let path = row.file_path.expect("output should have spilled");
        assert!(row.stdout.0.is_empty());
        assert!(row.stderr.0.is_empty());
        assert_eq!(row.total_size, 256);

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: CapturedOutput = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.stdout, vec![big]);
    }
}
