use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::document::{Document, DocumentError, DocumentEvent};
use crate::locate::Location;
use crate::reconcile::{ChangeDetection, ReconcileError, Reconciler};
use crate::review::{ReviewSummary, TaskReview, TaskStatus, build_task_diffs};
use crate::snapshot::{Snapshot, Workspace, WorkspaceError};
use crate::{BlockAction, ChangeType, TaskId};

/// Default period between incremental recomputes while an agent runs.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1500);

/// Errors surfaced by review operations.
///
/// Every variant scoped to a file or block names it, so the operation can
/// be retried.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("workspace snapshot failed: {0}")]
    Snapshot(#[source] WorkspaceError),
    #[error("failed to apply {block_id} in {path}: {source}")]
    Apply {
        path: String,
        block_id: String,
        source: ReconcileError,
    },
    #[error("failed to update {path} on disk: {source}")]
    RevertIo {
        path: String,
        source: WorkspaceError,
    },
    #[error("failed to read document {path}: {source}")]
    Document {
        path: String,
        source: DocumentError,
    },
    #[error("no file {0} in the current review")]
    UnknownFile(String),
    #[error("no block {block_id} in {path}")]
    UnknownBlock { path: String, block_id: String },
    #[error("task {0} has no active baseline")]
    NotActive(TaskId),
}

pub type Result<T> = std::result::Result<T, ReviewError>;

/// Owner of the live [`TaskReview`].
///
/// Every operation takes `&mut self`, so operations never interleave. Block
/// decisions edit the document first and only record the decision once the
/// edit went through.
pub struct ReviewController<W, D> {
    workspace: Arc<W>,
    document: Arc<D>,
    review: TaskReview,
    baseline: Option<(TaskId, Snapshot)>,
    reconciler: Reconciler,
    interval: Duration,
}

impl<W: Workspace, D: Document> ReviewController<W, D> {
    pub fn new(workspace: Arc<W>, document: Arc<D>) -> Self {
        Self {
            workspace,
            document,
            review: TaskReview::new(),
            baseline: None,
            reconciler: Reconciler::default(),
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Period between incremental rebuilds, at least one millisecond.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_change_detection(mut self, detection: ChangeDetection) -> Self {
        self.reconciler = Reconciler::new(detection);
        self
    }

    pub fn review(&self) -> &TaskReview {
        &self.review
    }

    pub fn summary(&self) -> ReviewSummary {
        self.review.summary()
    }

    pub fn toggle_expanded(&mut self) -> bool {
        self.review.toggle_expanded()
    }

    pub fn set_cursor(&mut self, path: &str, block_index: usize) -> Option<usize> {
        self.review.set_cursor(path, block_index)
    }

    /// Capture the baseline for `task_id` and mark the review running.
    ///
    /// The previous task's baseline is dropped; its file diffs stay visible
    /// until the first rebuild replaces them.
    pub async fn start_review(&mut self, task_id: TaskId) -> Result<()> {
        self.baseline = None;
        self.review.task_id = Some(task_id);
        self.review.last_error = None;
        match self.workspace.snapshot().await {
            Ok(snapshot) => {
                info!(task = task_id, files = snapshot.len(), "task review started");
                self.baseline = Some((task_id, snapshot));
                self.review.status = TaskStatus::Running;
                Ok(())
            }
            Err(err) => {
                warn!(task = task_id, error = %err, "baseline snapshot failed");
                self.review.status = TaskStatus::Error;
                self.review.last_error = Some(err.to_string());
                Err(ReviewError::Snapshot(err))
            }
        }
    }

    /// Rebuild the diffs of a running task against its baseline.
    ///
    /// Returns `false` when the result was discarded because the review
    /// moved on (another task, or no longer running). Decisions made on the
    /// previous blocks are not carried over.
    pub async fn incremental_update(&mut self, task_id: TaskId) -> Result<bool> {
        if !self.is_running(task_id) {
            return Ok(false);
        }
        let current = self.workspace.snapshot().await.map_err(|err| {
            warn!(task = task_id, error = %err, "incremental snapshot failed");
            ReviewError::Snapshot(err)
        })?;
        if !self.is_running(task_id) {
            debug!(task = task_id, "discarding stale incremental snapshot");
            return Ok(false);
        }
        let Some((_, baseline)) = &self.baseline else {
            return Ok(false);
        };

        let files = build_task_diffs(baseline, &current);
        debug!(task = task_id, files = files.len(), "incremental review rebuilt");
        self.reconciler.clear();
        self.review.expanded |= !files.is_empty();
        self.review.replace_files(files);
        self.refresh(&current).await;
        Ok(true)
    }

    /// Produce the definitive diff set for `task_id` and drop its baseline.
    pub async fn finalize(&mut self, task_id: TaskId) -> Result<()> {
        let baseline = match self.baseline.take() {
            Some((id, baseline)) if id == task_id => baseline,
            other => {
                self.baseline = other;
                return Err(ReviewError::NotActive(task_id));
            }
        };

        let current = match self.workspace.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(task = task_id, error = %err, "final snapshot failed");
                if self.review.task_id == Some(task_id) {
                    self.review.status = TaskStatus::Error;
                    self.review.last_error = Some(err.to_string());
                }
                return Err(ReviewError::Snapshot(err));
            }
        };

        let files = build_task_diffs(&baseline, &current);
        self.reconciler.clear();
        self.review.task_id = Some(task_id);
        self.review.expanded |= !files.is_empty();
        self.review.status = if files.is_empty() {
            TaskStatus::Clean
        } else {
            TaskStatus::Ready
        };
        self.review.replace_files(files);
        info!(
            task = task_id,
            files = self.review.files.len(),
            status = ?self.review.status,
            "task review finalized"
        );
        self.refresh(&current).await;
        Ok(())
    }

    /// Start a review for `task_id`, rebuild it on every interval tick while
    /// `agent` runs, then finalize. Ticks that would land while a rebuild
    /// is still in flight are skipped.
    pub async fn supervise<F: Future>(&mut self, task_id: TaskId, agent: F) -> Result<F::Output> {
        self.start_review(task_id).await?;
        tokio::pin!(agent);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        let output = loop {
            if !self.is_running(task_id) {
                break (&mut agent).await;
            }
            tokio::select! {
                output = &mut agent => break output,
                _ = ticker.tick() => {
                    if let Err(err) = self.incremental_update(task_id).await {
                        warn!(task = task_id, error = %err, "incremental update failed");
                    }
                }
            }
        };

        self.finalize(task_id).await?;
        Ok(output)
    }

    pub async fn keep_block(&mut self, path: &str, block_id: &str) -> Result<()> {
        self.decide_block(path, block_id, BlockAction::Kept).await
    }

    pub async fn revert_block(&mut self, path: &str, block_id: &str) -> Result<()> {
        self.decide_block(path, block_id, BlockAction::Reverted).await
    }

    /// Forget the decision on one block. The document is not touched.
    pub fn reset_block(&mut self, path: &str, block_id: &str) -> Result<()> {
        let index = self.block_index(path, block_id)?;
        if let Some(file) = self.review.file_mut(path) {
            file.blocks[index].action = BlockAction::Pending;
        }
        self.reconciler.forget_file(path);
        self.review.recompute_status(TaskStatus::Ready);
        Ok(())
    }

    pub async fn keep_file(&mut self, path: &str) -> Result<()> {
        self.decide_file(path, BlockAction::Kept).await
    }

    pub async fn revert_file(&mut self, path: &str) -> Result<()> {
        self.decide_file(path, BlockAction::Reverted).await
    }

    /// Forget every decision in one file. The document is not touched.
    pub fn reset_file(&mut self, path: &str) -> Result<()> {
        let file = self
            .review
            .file_mut(path)
            .ok_or_else(|| ReviewError::UnknownFile(path.to_string()))?;
        file.set_all(BlockAction::Pending);
        self.reconciler.forget_file(path);
        self.review.recompute_status(TaskStatus::Ready);
        Ok(())
    }

    pub async fn keep_all(&mut self) -> Result<()> {
        self.decide_all(BlockAction::Kept).await
    }

    pub async fn revert_all(&mut self) -> Result<()> {
        self.decide_all(BlockAction::Reverted).await
    }

    /// React to a change of a live document.
    ///
    /// Decided blocks whose previous content the change brought back are
    /// reset to pending. Returns the ids of those blocks.
    pub async fn handle_document_change(&mut self, event: &DocumentEvent) -> Result<Vec<String>> {
        let Some(file) = self.review.file(&event.path) else {
            return Ok(Vec::new());
        };
        if file.change_type != ChangeType::Modified
            || file.blocks.iter().all(|b| b.action == BlockAction::Pending)
        {
            return Ok(Vec::new());
        }
        if self.reconciler.detection() == ChangeDetection::UndoFlags && !event.change.is_history() {
            return Ok(Vec::new());
        }

        let lines = self.read_document(&event.path).await?;
        let Some(file) = self.review.file(&event.path) else {
            return Ok(Vec::new());
        };
        let restored = self.reconciler.restored_blocks(file, &lines, event.change);
        if restored.is_empty() {
            return Ok(Vec::new());
        }

        let fallback = self.decision_fallback();
        let mut ids = Vec::with_capacity(restored.len());
        if let Some(file) = self.review.file_mut(&event.path) {
            for &index in &restored {
                let block = &mut file.blocks[index];
                block.action = BlockAction::Pending;
                ids.push(block.id.clone());
            }
        }
        self.reconciler.forget_file(&event.path);
        for id in &ids {
            info!(path = %event.path, block = %id, "document history restored block, reset to pending");
        }
        self.review.set_cursor(&event.path, restored[0]);
        self.review.recompute_status(fallback);
        Ok(ids)
    }

    /// Where a block currently sits in the live document.
    pub async fn locate_block(&self, path: &str, block_id: &str) -> Result<Location> {
        let index = self.block_index(path, block_id)?;
        let lines = self.read_document(path).await?;
        let file = self
            .review
            .file(path)
            .ok_or_else(|| ReviewError::UnknownFile(path.to_string()))?;
        Reconciler::locate_block(file, index, &lines).ok_or_else(|| ReviewError::UnknownBlock {
            path: path.to_string(),
            block_id: block_id.to_string(),
        })
    }

    /// The block covering 1-based `line` of the live document, if any.
    pub async fn block_at_line(&self, path: &str, line: usize) -> Result<Option<String>> {
        if self.review.file(path).is_none() {
            return Err(ReviewError::UnknownFile(path.to_string()));
        }
        let lines = self.read_document(path).await?;
        let Some(file) = self.review.file(path) else {
            return Ok(None);
        };
        for (index, block) in file.blocks.iter().enumerate() {
            let Some(location) = Reconciler::locate_block(file, index, &lines) else {
                continue;
            };
            if !location.matched {
                continue;
            }
            let first = location.anchor_line;
            let last = first + block.displayed_lines().len().max(1) - 1;
            if (first..=last).contains(&line) {
                return Ok(Some(block.id.clone()));
            }
        }
        Ok(None)
    }

    async fn decide_block(&mut self, path: &str, block_id: &str, target: BlockAction) -> Result<()> {
        let index = self.block_index(path, block_id)?;
        let fallback = self.decision_fallback();
        let whole_file = self
            .review
            .file(path)
            .is_some_and(|f| f.change_type != ChangeType::Modified);

        let applied = if whole_file {
            self.apply_whole_file(path, target).await
        } else {
            self.apply_block(path, index, target).await
        };
        if let Err(err) = applied {
            let status = self.review.status;
            self.fail_applying(status, &err);
            return Err(err);
        }

        self.review.set_cursor(path, index);
        self.review.advance_cursor(path);
        self.review.recompute_status(fallback);
        debug!(path, block = block_id, action = ?target, "block decided");
        Ok(())
    }

    async fn decide_file(&mut self, path: &str, target: BlockAction) -> Result<()> {
        if self.review.file(path).is_none() {
            return Err(ReviewError::UnknownFile(path.to_string()));
        }
        let previous = self.review.status;
        let fallback = self.decision_fallback();
        self.review.status = TaskStatus::Applying;

        if let Err(err) = self.apply_file(path, target).await {
            self.fail_applying(previous, &err);
            return Err(err);
        }
        self.review.recompute_status(fallback);
        self.refresh_from_disk().await;
        info!(path, action = ?target, "file decided");
        Ok(())
    }

    async fn decide_all(&mut self, target: BlockAction) -> Result<()> {
        if self.review.files.is_empty() {
            self.review.status = TaskStatus::Clean;
            self.review.expanded = false;
            return Ok(());
        }
        let previous = self.review.status;
        let fallback = self.decision_fallback();
        self.review.status = TaskStatus::Applying;

        let paths: Vec<String> = self.review.files.iter().map(|f| f.path.clone()).collect();
        for path in &paths {
            if let Err(err) = self.apply_file(path, target).await {
                self.fail_applying(previous, &err);
                return Err(err);
            }
        }
        self.review.recompute_status(fallback);
        self.review.expanded = false;
        self.refresh_from_disk().await;
        info!(files = paths.len(), action = ?target, "all files decided");
        Ok(())
    }

    /// Bring a whole file into `target`, block by block from the bottom up
    /// so earlier blocks keep their positions. Each block is marked as soon
    /// as its edit succeeds.
    async fn apply_file(&mut self, path: &str, target: BlockAction) -> Result<()> {
        let file = self
            .review
            .file(path)
            .ok_or_else(|| ReviewError::UnknownFile(path.to_string()))?;
        if file.change_type != ChangeType::Modified {
            return self.apply_whole_file(path, target).await;
        }
        for index in (0..file.blocks.len()).rev() {
            self.apply_block(path, index, target).await?;
        }
        if let Some(file) = self.review.file_mut(path) {
            file.set_all(target);
        }
        Ok(())
    }

    async fn apply_block(&mut self, path: &str, index: usize, target: BlockAction) -> Result<()> {
        let file = self
            .review
            .file(path)
            .ok_or_else(|| ReviewError::UnknownFile(path.to_string()))?;
        let block_id = file.blocks.get(index).map(|b| b.id.clone()).unwrap_or_default();
        self.reconciler
            .apply_block(&*self.document, file, index, target)
            .await
            .map_err(|source| ReviewError::Apply {
                path: path.to_string(),
                block_id,
                source,
            })?;
        if let Some(block) = self
            .review
            .file_mut(path)
            .and_then(|f| f.blocks.get_mut(index))
        {
            block.action = target;
        }
        Ok(())
    }

    /// Added and deleted files are kept or reverted on disk as a whole.
    /// What gets written or deleted follows the file's current state on
    /// disk, so a decision after a reset still lands.
    async fn apply_whole_file(&mut self, path: &str, target: BlockAction) -> Result<()> {
        let file = self
            .review
            .file(path)
            .ok_or_else(|| ReviewError::UnknownFile(path.to_string()))?;
        let wanted = match target {
            BlockAction::Kept => file.after.clone(),
            BlockAction::Reverted => file.before.clone(),
            BlockAction::Pending => {
                return Err(ReviewError::Apply {
                    path: path.to_string(),
                    block_id: file.blocks.first().map(|b| b.id.clone()).unwrap_or_default(),
                    source: ReconcileError::InvalidTarget(target),
                });
            }
        };

        let to_err = |source: WorkspaceError| {
            warn!(path, error = %source, "whole-file update failed");
            ReviewError::RevertIo {
                path: path.to_string(),
                source,
            }
        };
        let current = self.workspace.snapshot().await.map_err(to_err)?;
        let result = match (wanted.as_deref(), current.get(path)) {
            (Some(content), Some(on_disk)) if content == on_disk => Ok(()),
            (Some(content), _) => self.workspace.write(path, content).await,
            (None, Some(_)) => self.workspace.delete(path).await,
            (None, None) => Ok(()),
        };
        result.map_err(to_err)?;

        if let Some(file) = self.review.file_mut(path) {
            file.set_all(target);
        }
        Ok(())
    }

    fn block_index(&self, path: &str, block_id: &str) -> Result<usize> {
        let file = self
            .review
            .file(path)
            .ok_or_else(|| ReviewError::UnknownFile(path.to_string()))?;
        file.block_index(block_id)
            .ok_or_else(|| ReviewError::UnknownBlock {
                path: path.to_string(),
                block_id: block_id.to_string(),
            })
    }

    fn is_running(&self, task_id: TaskId) -> bool {
        self.review.task_id == Some(task_id)
            && self.review.status == TaskStatus::Running
            && self.baseline.as_ref().is_some_and(|(id, _)| *id == task_id)
    }

    /// Status to fall back to while files are still pending.
    fn decision_fallback(&self) -> TaskStatus {
        if self.review.status == TaskStatus::Running {
            TaskStatus::Running
        } else {
            TaskStatus::Ready
        }
    }

    fn fail_applying(&mut self, previous: TaskStatus, err: &ReviewError) {
        warn!(error = %err, "review decision failed");
        if self.review.status == TaskStatus::Applying {
            self.review.status = if previous == TaskStatus::Running {
                TaskStatus::Running
            } else {
                TaskStatus::Ready
            };
        }
        self.review.last_error = Some(err.to_string());
    }

    async fn read_document(&self, path: &str) -> Result<Vec<String>> {
        self.document
            .lines(path)
            .await
            .map_err(|source| ReviewError::Document {
                path: path.to_string(),
                source,
            })
    }

    async fn refresh(&self, snapshot: &Snapshot) {
        if let Err(err) = self.workspace.refresh(snapshot).await {
            warn!(error = %err, "workspace refresh failed");
        }
    }

    async fn refresh_from_disk(&self) {
        match self.workspace.snapshot().await {
            Ok(snapshot) => self.refresh(&snapshot).await,
            Err(err) => warn!(error = %err, "snapshot for workspace refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileAction;
    use crate::document::MemoryDocument;
    use crate::snapshot::MemoryWorkspace;

    async fn reviewed(
        before: &str,
        after: &str,
    ) -> ReviewController<MemoryWorkspace, MemoryDocument> {
        let workspace = Arc::new(MemoryWorkspace::with_files([("f.txt", before)]));
        let (document, _events) = MemoryDocument::new();
        document.open("f.txt", after);
        let mut controller = ReviewController::new(workspace.clone(), Arc::new(document));
        controller.start_review(1).await.unwrap();
        workspace.set("f.txt", after);
        controller.finalize(1).await.unwrap();
        controller
    }

    #[tokio::test]
    async fn finalize_without_changes_is_clean() {
        let workspace = Arc::new(MemoryWorkspace::with_files([("f.txt", "same")]));
        let (document, _events) = MemoryDocument::new();
        let mut controller = ReviewController::new(workspace, Arc::new(document));
        controller.start_review(7).await.unwrap();
        assert_eq!(controller.review().status, TaskStatus::Running);
        controller.finalize(7).await.unwrap();
        assert_eq!(controller.review().status, TaskStatus::Clean);
        assert!(!controller.review().expanded);
    }

    #[tokio::test]
    async fn finalize_with_changes_is_ready_and_expanded() {
        let controller = reviewed("a\nb\nc", "a\nX\nc").await;
        assert_eq!(controller.review().status, TaskStatus::Ready);
        assert!(controller.review().expanded);
        assert_eq!(controller.review().files[0].blocks[0].id, "f.txt#0");
    }

    #[tokio::test]
    async fn finalize_for_other_task_is_rejected() {
        let mut controller = reviewed("a", "b").await;
        controller.start_review(2).await.unwrap();
        assert!(matches!(
            controller.finalize(1).await,
            Err(ReviewError::NotActive(1))
        ));
        controller.finalize(2).await.unwrap();
    }

    #[tokio::test]
    async fn revert_block_edits_document_then_records() {
        let mut controller = reviewed("a\nb\nc", "a\nX\nc").await;
        controller.revert_block("f.txt", "f.txt#0").await.unwrap();
        let file = &controller.review().files[0];
        assert_eq!(file.blocks[0].action, BlockAction::Reverted);
        assert_eq!(file.action(), FileAction::Reverted);
        assert_eq!(controller.review().status, TaskStatus::Resolved);
        assert_eq!(
            controller.document.lines("f.txt").await.unwrap().join("\n"),
            "a\nb\nc"
        );
    }

    #[tokio::test]
    async fn reset_block_returns_to_ready() {
        let mut controller = reviewed("a\nb\nc", "a\nX\nc").await;
        controller.keep_block("f.txt", "f.txt#0").await.unwrap();
        assert_eq!(controller.review().status, TaskStatus::Resolved);
        controller.reset_block("f.txt", "f.txt#0").unwrap();
        assert_eq!(controller.review().status, TaskStatus::Ready);
        assert_eq!(controller.review().files[0].action(), FileAction::Pending);
    }

    #[tokio::test]
    async fn unknown_block_is_reported() {
        let mut controller = reviewed("a", "b").await;
        assert!(matches!(
            controller.keep_block("f.txt", "f.txt#9").await,
            Err(ReviewError::UnknownBlock { .. })
        ));
        assert!(matches!(
            controller.keep_file("nope").await,
            Err(ReviewError::UnknownFile(_))
        ));
    }

    #[tokio::test]
    async fn keep_all_without_files_is_clean() {
        let workspace = Arc::new(MemoryWorkspace::new());
        let (document, _events) = MemoryDocument::new();
        let mut controller = ReviewController::new(workspace, Arc::new(document));
        controller.keep_all().await.unwrap();
        assert_eq!(controller.review().status, TaskStatus::Clean);
    }

    #[tokio::test]
    async fn block_at_line_finds_covering_block() {
        let controller = reviewed("a\nb\nc\nd", "a\nX\nY\nd").await;
        assert_eq!(
            controller.block_at_line("f.txt", 3).await.unwrap().as_deref(),
            Some("f.txt#0")
        );
        assert_eq!(controller.block_at_line("f.txt", 4).await.unwrap(), None);
        let location = controller.locate_block("f.txt", "f.txt#0").await.unwrap();
        assert_eq!(location.anchor_line, 2);
    }
}
