use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::snapshot::Snapshot;
use crate::{BlockAction, ChangeType, DiffStat, FileAction, FileDiff, TaskId, differ, stat};

/// Lifecycle of the live task review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Ready,
    Clean,
    Applying,
    Resolved,
    Error,
}

/// The single live review for the current task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskReview {
    pub task_id: Option<TaskId>,
    pub files: Vec<FileDiff>,
    pub status: TaskStatus,
    pub cursor_by_path: BTreeMap<String, usize>,
    pub expanded: bool,
    pub last_error: Option<String>,
}

/// Counts for a review at a glance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReviewSummary {
    pub status: TaskStatus,
    pub total_files: usize,
    pub files_pending: usize,
    pub total_blocks: usize,
    pub pending: usize,
    pub kept: usize,
    pub reverted: usize,
    pub stat: DiffStat,
}

/// Diff every file that differs between `baseline` and `current`.
///
/// Files come out sorted by path. Block ids are `path#index`.
pub fn build_task_diffs(baseline: &Snapshot, current: &Snapshot) -> Vec<FileDiff> {
    let paths: BTreeSet<&str> = baseline.paths().chain(current.paths()).collect();
    paths
        .into_iter()
        .filter_map(|path| {
            let before = baseline.get(path);
            let after = current.get(path);
            if before == after {
                return None;
            }
            let change_type = match (before, after) {
                (None, _) => ChangeType::Added,
                (_, None) => ChangeType::Deleted,
                _ => ChangeType::Modified,
            };
            let before_text = before.unwrap_or("");
            let after_text = after.unwrap_or("");
            let mut blocks = differ::diff_lines(before_text, after_text);
            for (index, block) in blocks.iter_mut().enumerate() {
                block.id = format!("{path}#{index}");
            }
            Some(FileDiff {
                path: path.to_string(),
                before: before.map(str::to_owned),
                after: after.map(str::to_owned),
                change_type,
                stat: stat::diff_stat(before_text, after_text),
                blocks,
                fallback_action: FileAction::Pending,
            })
        })
        .collect()
}

/// Task status implied by the files' decisions.
///
/// No files means nothing to review. While any file is still pending the
/// caller's `fallback` applies.
pub fn compute_task_status(files: &[FileDiff], fallback: TaskStatus) -> TaskStatus {
    if files.is_empty() {
        TaskStatus::Clean
    } else if files.iter().any(|f| f.action() == FileAction::Pending) {
        fallback
    } else {
        TaskStatus::Resolved
    }
}

impl TaskReview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, path: &str) -> Option<&FileDiff> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn file_mut(&mut self, path: &str) -> Option<&mut FileDiff> {
        self.files.iter_mut().find(|f| f.path == path)
    }

    /// Replace the file diffs. Cursors survive for paths that still have
    /// blocks, clamped to the new block count.
    pub fn replace_files(&mut self, files: Vec<FileDiff>) {
        self.files = files;
        let files = &self.files;
        self.cursor_by_path.retain(|path, cursor| {
            match files.iter().find(|f| f.path == *path) {
                Some(file) if !file.blocks.is_empty() => {
                    *cursor = (*cursor).min(file.blocks.len() - 1);
                    true
                }
                _ => false,
            }
        });
    }

    /// Recompute `status` from the files.
    pub fn recompute_status(&mut self, fallback: TaskStatus) {
        self.status = compute_task_status(&self.files, fallback);
    }

    /// Point the cursor of `path` at `block_index`, clamped to the file's
    /// blocks. Returns the index actually set.
    pub fn set_cursor(&mut self, path: &str, block_index: usize) -> Option<usize> {
        let count = self.file(path)?.blocks.len();
        if count == 0 {
            return None;
        }
        let index = block_index.min(count - 1);
        self.cursor_by_path.insert(path.to_string(), index);
        Some(index)
    }

    pub fn cursor(&self, path: &str) -> Option<usize> {
        self.cursor_by_path.get(path).copied()
    }

    /// Move the cursor of `path` off a decided block.
    ///
    /// Goes to the next pending block at or after the cursor, else the
    /// nearest pending block before it. Stays put when nothing is pending.
    pub fn advance_cursor(&mut self, path: &str) {
        let Some(file) = self.file(path) else {
            return;
        };
        let current = self.cursor(path).unwrap_or(0);
        let is_pending = |i: &usize| file.blocks[*i].action == BlockAction::Pending;
        let next = (current..file.blocks.len())
            .find(is_pending)
            .or_else(|| (0..current.min(file.blocks.len())).rev().find(is_pending));
        if let Some(index) = next {
            self.cursor_by_path.insert(path.to_string(), index);
        }
    }

    pub fn toggle_expanded(&mut self) -> bool {
        self.expanded = !self.expanded;
        self.expanded
    }

    pub fn summary(&self) -> ReviewSummary {
        let mut summary = ReviewSummary {
            status: self.status,
            total_files: self.files.len(),
            ..ReviewSummary::default()
        };
        for file in &self.files {
            if file.action() == FileAction::Pending {
                summary.files_pending += 1;
            }
            summary.stat.added += file.stat.added;
            summary.stat.removed += file.stat.removed;
            for block in &file.blocks {
                summary.total_blocks += 1;
                match block.action {
                    BlockAction::Pending => summary.pending += 1,
                    BlockAction::Kept => summary.kept += 1,
                    BlockAction::Reverted => summary.reverted += 1,
                }
            }
        }
        summary
    }
}
