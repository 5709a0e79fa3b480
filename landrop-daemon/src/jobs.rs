//! Send jobs: directory expansion and aggregate progress.
//!
//! One `send()` call is one job, whether the path is a file or a directory
//! tree. A directory expands into per-file work items delivered to the
//! session FIFO; progress aggregates bytes across all of them.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

pub type JobId = Uuid;

/// One file queued for sending, tagged with its owning job.
#[derive(Debug, Clone)]
pub struct FileJob {
    pub parent: JobId,
    pub path: PathBuf,
    /// Name announced to the peer. For directory sends this is the
    /// '/'-separated path relative to the directory's parent, so the tree
    /// shape survives on the other side.
    pub file_name: String,
    pub file_size: u64,
}

/// Expand a path into file work items, FIFO-ordered by relative path.
pub fn expand(parent: JobId, path: &Path) -> io::Result<Vec<FileJob>> {
    let meta = std::fs::metadata(path)?;
    if meta.is_file() {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into());
        return Ok(vec![FileJob {
            parent,
            path: path.to_path_buf(),
            file_name,
            file_size: meta.len(),
        }]);
    }
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a file or directory",
        ));
    }
    let root_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".into());
    let mut out = Vec::new();
    walk(parent, path, &root_name, &mut out)?;
    out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(out)
}

fn walk(parent: JobId, dir: &Path, prefix: &str, out: &mut Vec<FileJob>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = format!("{prefix}/{name}");
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk(parent, &path, &rel, out)?;
        } else if meta.is_file() {
            out.push(FileJob {
                parent,
                path,
                file_name: rel,
                file_size: meta.len(),
            });
        }
        // Symlinks and special files are skipped.
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Active,
    Reconnecting,
    Complete,
    Failed,
    Cancelled,
    Stalled,
}

/// Aggregate progress of one job, as handed to `progress()`.
#[derive(Debug, Clone, Copy)]
pub struct JobProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub state: JobState,
}

#[derive(Debug)]
struct JobEntry {
    peer_device_id: String,
    progress: JobProgress,
    files_total: usize,
    files_done: usize,
    cancelled: bool,
}

/// Book-keeping for every job this process has accepted.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<JobId, JobEntry>,
}

impl JobTable {
    pub fn create(&mut self, id: JobId, peer_device_id: &str, files: &[FileJob]) {
        let bytes_total = files.iter().map(|f| f.file_size).sum();
        let state = if files.is_empty() {
            // An empty directory has nothing to do.
            JobState::Complete
        } else {
            JobState::Queued
        };
        self.jobs.insert(
            id,
            JobEntry {
                peer_device_id: peer_device_id.to_string(),
                progress: JobProgress {
                    bytes_done: 0,
                    bytes_total,
                    state,
                },
                files_total: files.len(),
                files_done: 0,
                cancelled: false,
            },
        );
    }

    pub fn progress(&self, id: JobId) -> Option<JobProgress> {
        self.jobs.get(&id).map(|e| e.progress)
    }

    pub fn peer(&self, id: JobId) -> Option<&str> {
        self.jobs.get(&id).map(|e| e.peer_device_id.as_str())
    }

    pub fn set_state(&mut self, id: JobId, state: JobState) {
        if let Some(e) = self.jobs.get_mut(&id) {
            // Terminal states stick.
            if !matches!(
                e.progress.state,
                JobState::Complete | JobState::Cancelled | JobState::Failed
            ) {
                e.progress.state = state;
            }
        }
    }

    pub fn add_bytes(&mut self, id: JobId, n: u64) {
        if let Some(e) = self.jobs.get_mut(&id) {
            e.progress.bytes_done = (e.progress.bytes_done + n).min(e.progress.bytes_total);
        }
    }

    /// One file of the job finished; completes the job when it was the last.
    pub fn file_done(&mut self, id: JobId) {
        if let Some(e) = self.jobs.get_mut(&id) {
            e.files_done += 1;
            if e.files_done >= e.files_total {
                e.progress.state = JobState::Complete;
            }
        }
    }

    /// Flag a job cancelled; the owning session observes the flag and stops
    /// after the in-flight chunk.
    pub fn cancel(&mut self, id: JobId) -> bool {
        match self.jobs.get_mut(&id) {
            Some(e) => {
                e.cancelled = true;
                e.progress.state = JobState::Cancelled;
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, id: JobId) -> bool {
        self.jobs.get(&id).map(|e| e.cancelled).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn expand_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solo.txt");
        fs::write(&path, b"hello").unwrap();
        let files = expand(Uuid::new_v4(), &path).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "solo.txt");
        assert_eq!(files[0].file_size, 5);
    }

    #[test]
    fn expand_directory_tree_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("photos");
        fs::create_dir_all(root.join("b")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("b/2.jpg"), b"22").unwrap();
        fs::write(root.join("a/1.jpg"), b"1").unwrap();
        fs::write(root.join("top.txt"), b"333").unwrap();
        let files = expand(Uuid::new_v4(), &root).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["photos/a/1.jpg", "photos/b/2.jpg", "photos/top.txt"]);
        assert_eq!(files.iter().map(|f| f.file_size).sum::<u64>(), 6);
    }

    #[test]
    fn job_aggregates_bytes_and_completes() {
        let mut table = JobTable::default();
        let id = Uuid::new_v4();
        let files = vec![
            FileJob {
                parent: id,
                path: "/tmp/a".into(),
                file_name: "a".into(),
                file_size: 100,
            },
            FileJob {
                parent: id,
                path: "/tmp/b".into(),
                file_name: "b".into(),
                file_size: 50,
            },
        ];
        table.create(id, "B-u-2222", &files);
        table.set_state(id, JobState::Active);
        table.add_bytes(id, 100);
        table.file_done(id);
        let p = table.progress(id).unwrap();
        assert_eq!(p.bytes_done, 100);
        assert_eq!(p.bytes_total, 150);
        assert_eq!(p.state, JobState::Active);
        table.add_bytes(id, 50);
        table.file_done(id);
        assert_eq!(table.progress(id).unwrap().state, JobState::Complete);
    }

    #[test]
    fn cancel_sticks() {
        let mut table = JobTable::default();
        let id = Uuid::new_v4();
        table.create(id, "B-u-2222", &[]);
        assert!(table.cancel(id));
        table.set_state(id, JobState::Active);
        assert_eq!(table.progress(id).unwrap().state, JobState::Cancelled);
        assert!(table.is_cancelled(id));
    }
}
