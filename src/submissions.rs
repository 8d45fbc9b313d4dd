use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(test)]
use std::io;

use crate::config::AppConfig;
#[cfg(test)]
use crate::errors::AppError;
use crate::errors::AppResult;

const LOG_FILE_NAME: &str = "submissions.jsonl";

/// Append-only JSONL log of venue suggestions. Entries are kept for manual
/// review and never fed back into the canonical set.
pub struct SubmissionLog {
    path: PathBuf,
    max_file_bytes: u64,
    max_file_count: usize,
    write_lock: Mutex<()>,
    #[cfg(test)]
    fault_injector: Option<Arc<TestFaultInjector>>,
}

#[derive(Debug, Serialize)]
struct Submission<'a> {
    received_at: DateTime<Utc>,
    payload: &'a serde_json::Value,
}

impl SubmissionLog {
    pub fn new<P: AsRef<Path>>(dir: P, max_file_bytes: u64, max_file_count: usize) -> AppResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            max_file_bytes,
            max_file_count: max_file_count.max(1),
            write_lock: Mutex::new(()),
            #[cfg(test)]
            fault_injector: None,
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Self::new(
            &config.submissions_dir,
            config.submissions_max_bytes,
            config.submissions_max_files,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one `{ received_at, payload }` line and flushes it.
    pub fn append(&self, payload: &serde_json::Value) -> AppResult<()> {
        let mut line = serde_json::to_vec(&Submission {
            received_at: Utc::now(),
            payload,
        })?;
        line.push(b'\n');

        let _guard = self.write_lock.lock();
        self.rotate_if_needed(line.len() as u64)?;
        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .map(|hooks| hooks.take_disk_full())
            .unwrap_or(false)
        {
            return Err(AppError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "simulated disk full",
            )));
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        debug!(target: "submissions", bytes = line.len(), "submission recorded");
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current_size = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current_size == 0 || current_size + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .map(|hooks| hooks.take_permission_error())
            .unwrap_or(false)
        {
            return Err(AppError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "simulated permission error",
            )));
        }

        if self.max_file_count <= 1 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            return Ok(());
        }

        let rotated_path = self.rotation_path(Utc::now());
        fs::rename(&self.path, &rotated_path)?;
        info!(target: "submissions", rotated = %rotated_path.display(), "submission log rotated");

        self.prune_rotations()?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Picks `submissions-<timestamp>.jsonl`, suffixing a counter when two
    /// rotations land in the same second.
    fn rotation_path(&self, now: DateTime<Utc>) -> PathBuf {
        let stamp = now.format("%Y%m%d%H%M%S");
        let mut candidate = self.sibling(&format!("{}-{stamp}.jsonl", self.stem()));
        let mut counter = 1;
        while candidate.exists() {
            candidate = self.sibling(&format!("{}-{stamp}-{counter}.jsonl", self.stem()));
            counter += 1;
        }
        candidate
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let prefix = format!("{}-", self.stem());
        let mut rotations = fs::read_dir(parent)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                (name.starts_with(&prefix) && name.ends_with(".jsonl")).then_some(name)
            })
            .collect::<Vec<_>>();

        rotations.sort_by_key(|name| rotation_order(name, &prefix));
        let allowed = self.max_file_count.saturating_sub(1);
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for name in rotations.into_iter().take(excess) {
                debug!(target: "submissions", file = %name, "pruning old submission log");
                let _ = fs::remove_file(parent.join(name));
            }
        }
        Ok(())
    }

    fn sibling(&self, file_name: &str) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(file_name)
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "submissions".into())
    }
}

/// Sort key for `<stem>-<timestamp>[-<n>].jsonl`, oldest first.
fn rotation_order(name: &str, prefix: &str) -> (String, u32) {
    let body = name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(".jsonl"))
        .unwrap_or(name);
    match body.split_once('-') {
        Some((stamp, counter)) => (stamp.to_string(), counter.parse().unwrap_or(0)),
        None => (body.to_string(), 0),
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct TestFaultInjector {
    disk_full: AtomicBool,
    permission_error: AtomicBool,
}

#[cfg(test)]
impl TestFaultInjector {
    pub fn fail_next_disk_full(&self) {
        self.disk_full.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_permission_error(&self) {
        self.permission_error.store(true, Ordering::SeqCst);
    }

    fn take_disk_full(&self) -> bool {
        self.disk_full.swap(false, Ordering::SeqCst)
    }

    fn take_permission_error(&self) -> bool {
        self.permission_error.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
impl SubmissionLog {
    pub fn enable_test_hooks(&mut self) -> Arc<TestFaultInjector> {
        let hooks = Arc::new(TestFaultInjector::default());
        self.fault_injector = Some(hooks.clone());
        hooks
    }
}
