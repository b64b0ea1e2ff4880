use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::document::{ContentChange, Document, DocumentError, LineEdit};
use crate::locate::{Location, Needle, locate};
use crate::{BlockAction, FileDiff};

/// Errors that can occur while applying a decision to a document.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0:?} is not a decision that can be applied")]
    InvalidTarget(BlockAction),
    #[error("block index {index} out of range for {path}")]
    BlockOutOfRange { path: String, index: usize },
    #[error(transparent)]
    Document(#[from] DocumentError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// How the reconciler notices that the user's own history restored a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeDetection {
    /// Check decided blocks only on changes flagged undo or redo.
    #[default]
    UndoFlags,
    /// Check decided blocks on every change whose content differs from the
    /// last one checked. For documents that do not report undo flags.
    ContentHash,
}

/// What [`Reconciler::apply_block`] did to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The document already shows the requested state.
    Unchanged,
    /// One edit replaced the block starting at `start_index`.
    /// `located` is false when the block was not found and the edit went to
    /// the clamped preferred index.
    Applied { start_index: usize, located: bool },
}

/// Turns block decisions into document edits and watches for them being
/// undone.
#[derive(Debug, Default)]
pub struct Reconciler {
    detection: ChangeDetection,
    /// SHA-256 of each document as last checked in content-hash mode.
    checked: HashMap<String, String>,
}

impl Reconciler {
    pub fn new(detection: ChangeDetection) -> Self {
        Self {
            detection,
            checked: HashMap::new(),
        }
    }

    pub fn detection(&self) -> ChangeDetection {
        self.detection
    }

    /// Make the document show block `index` of `file` in state `next`.
    ///
    /// Only `Kept` and `Reverted` are valid targets. Both sides of the block
    /// are looked up in the document. When it already shows the target the
    /// document is left alone; otherwise the other side is replaced in one
    /// edit. The recorded action only decides when neither side is found.
    pub async fn apply_block<D: Document + ?Sized>(
        &mut self,
        document: &D,
        file: &FileDiff,
        index: usize,
        next: BlockAction,
    ) -> Result<ApplyOutcome> {
        let block = file
            .blocks
            .get(index)
            .ok_or_else(|| ReconcileError::BlockOutOfRange {
                path: file.path.clone(),
                index,
            })?;
        let (target, opposite): (&[String], &[String]) = match next {
            BlockAction::Kept => (&block.after_lines, &block.before_lines),
            BlockAction::Reverted => (&block.before_lines, &block.after_lines),
            BlockAction::Pending => return Err(ReconcileError::InvalidTarget(next)),
        };

        let lines = document.lines(&file.path).await?;
        let preferred = file.preferred_index(index);
        let shown = find_side(file, index, target, &lines);
        let replaced = find_side(file, index, opposite, &lines);
        let already_shown = match (shown.matched, replaced.matched) {
            (true, false) => true,
            (false, true) => false,
            // One side is a prefix of the other; the longer one is really there.
            (true, true) if target.len() != opposite.len() => target.len() > opposite.len(),
            (true, true) => {
                shown.start_index.abs_diff(preferred) <= replaced.start_index.abs_diff(preferred)
            }
            (false, false) => block.displayed_lines() == target,
        };
        self.checked.remove(&file.path);
        if already_shown {
            debug!(path = %file.path, block = %block.id, action = ?next, "document already shows decision");
            return Ok(ApplyOutcome::Unchanged);
        }

        if !replaced.matched {
            warn!(
                path = %file.path,
                block = %block.id,
                index = replaced.start_index,
                "block not found in document, applying at best-effort position"
            );
        }
        let start = replaced.start_index;
        let end = (start + opposite.len()).min(lines.len());
        document
            .apply_edit(
                &file.path,
                LineEdit {
                    start,
                    end,
                    lines: target.to_vec(),
                },
            )
            .await?;

        debug!(path = %file.path, block = %block.id, action = ?next, start, "applied block decision");
        Ok(ApplyOutcome::Applied {
            start_index: start,
            located: replaced.matched,
        })
    }

    /// Indexes of decided blocks whose pre-decision content is back in the
    /// document after `change`.
    ///
    /// In content-hash mode a document whose hash equals the last one
    /// checked for its path is skipped.
    pub fn restored_blocks(
        &mut self,
        file: &FileDiff,
        document_lines: &[String],
        change: ContentChange,
    ) -> Vec<usize> {
        match self.detection {
            ChangeDetection::UndoFlags if !change.is_history() => return Vec::new(),
            ChangeDetection::UndoFlags => {}
            ChangeDetection::ContentHash => {
                let hash = fingerprint(document_lines);
                if self.checked.get(&file.path) == Some(&hash) {
                    return Vec::new();
                }
                self.checked.insert(file.path.clone(), hash);
            }
        }
        (0..file.blocks.len())
            .filter(|&index| undo_restored(file, index, document_lines))
            .collect()
    }

    /// Find where block `index` currently sits in `document_lines`.
    pub fn locate_block(file: &FileDiff, index: usize, document_lines: &[String]) -> Option<Location> {
        let block = file.blocks.get(index)?;
        Some(locate(
            document_lines,
            &Needle {
                lines: block.displayed_lines(),
                context_before: &block.context_before,
                context_after: &block.context_after,
                preferred_index: file.preferred_index(index),
            },
        ))
    }

    /// Decisions in `path` changed; check its next document content again.
    pub fn forget_file(&mut self, path: &str) {
        self.checked.remove(path);
    }

    /// Drop every recorded hash. Block ids do not survive a rebuild.
    pub fn clear(&mut self) {
        self.checked.clear();
    }
}

/// Locate one side of block `index`. A match only counts when there was
/// something to anchor it: an empty needle with no context matches anywhere.
fn find_side(file: &FileDiff, index: usize, side: &[String], document_lines: &[String]) -> Location {
    let block = &file.blocks[index];
    let location = locate(
        document_lines,
        &Needle {
            lines: side,
            context_before: &block.context_before,
            context_after: &block.context_after,
            preferred_index: file.preferred_index(index),
        },
    );
    let anchored =
        !side.is_empty() || !block.context_before.is_empty() || !block.context_after.is_empty();
    Location {
        matched: location.matched && anchored,
        ..location
    }
}

fn undo_restored(file: &FileDiff, index: usize, document_lines: &[String]) -> bool {
    file.blocks[index]
        .pre_decision_lines()
        .is_some_and(|previous| find_side(file, index, previous, document_lines).matched)
}

fn fingerprint(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MemoryDocument;
    use crate::{ChangeType, DiffStat, FileAction, differ};

    fn file_diff(path: &str, before: &str, after: &str) -> FileDiff {
        let blocks = differ::diff_lines(before, after);
        FileDiff {
            path: path.to_string(),
            before: Some(before.to_string()),
            after: Some(after.to_string()),
            change_type: ChangeType::Modified,
            stat: DiffStat::default(),
            blocks,
            fallback_action: FileAction::Pending,
        }
    }

    #[tokio::test]
    async fn revert_then_keep_restores_after_text() {
        let (document, _events) = MemoryDocument::new();
        document.open("f.txt", "a\nX\nc");
        let mut file = file_diff("f.txt", "a\nb\nc", "a\nX\nc");
        let mut reconciler = Reconciler::default();

        let outcome = reconciler
            .apply_block(&document, &file, 0, BlockAction::Reverted)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                start_index: 1,
                located: true
            }
        );
        assert_eq!(document.text("f.txt").unwrap(), "a\nb\nc");
        file.blocks[0].action = BlockAction::Reverted;

        reconciler
            .apply_block(&document, &file, 0, BlockAction::Kept)
            .await
            .unwrap();
        assert_eq!(document.text("f.txt").unwrap(), "a\nX\nc");
    }

    #[tokio::test]
    async fn keeping_a_displayed_block_does_not_edit() {
        let (document, mut events) = MemoryDocument::new();
        document.open("f.txt", "a\nX\nc");
        events.recv().await.unwrap();
        let file = file_diff("f.txt", "a\nb\nc", "a\nX\nc");
        let mut reconciler = Reconciler::default();

        let outcome = reconciler
            .apply_block(&document, &file, 0, BlockAction::Kept)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn pending_is_not_a_valid_target() {
        let (document, _events) = MemoryDocument::new();
        document.open("f.txt", "a\nX\nc");
        let file = file_diff("f.txt", "a\nb\nc", "a\nX\nc");
        let err = Reconciler::default()
            .apply_block(&document, &file, 0, BlockAction::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTarget(BlockAction::Pending)));
    }

    #[tokio::test]
    async fn drifted_document_is_edited_at_the_shifted_block() {
        let (document, _events) = MemoryDocument::new();
        document.open("f.txt", "u1\nu2\na\nX\nc");
        let file = file_diff("f.txt", "a\nb\nc", "a\nX\nc");
        let outcome = Reconciler::default()
            .apply_block(&document, &file, 0, BlockAction::Reverted)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                start_index: 3,
                located: true
            }
        );
        assert_eq!(document.text("f.txt").unwrap(), "u1\nu2\na\nb\nc");
    }

    #[tokio::test]
    async fn locate_miss_still_applies_at_clamped_index() {
        let (document, _events) = MemoryDocument::new();
        document.open("f.txt", "totally\ndifferent");
        let file = file_diff("f.txt", "a\nb\nc", "a\nX\nc");
        let outcome = Reconciler::default()
            .apply_block(&document, &file, 0, BlockAction::Reverted)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                start_index: 1,
                located: false
            }
        );
        assert_eq!(document.text("f.txt").unwrap(), "totally\nb");
    }

    #[test]
    fn undo_flags_detect_restored_kept_block() {
        let mut file = file_diff("f.txt", "a\nb\nc", "a\nX\nc");
        file.blocks[0].action = BlockAction::Kept;
        let mut reconciler = Reconciler::default();
        let lines = crate::split_lines("a\nb\nc");

        assert_eq!(
            reconciler.restored_blocks(&file, &lines, ContentChange::undo()),
            vec![0]
        );
        assert!(
            reconciler
                .restored_blocks(&file, &lines, ContentChange::edit())
                .is_empty()
        );
        let after = crate::split_lines("a\nX\nc");
        assert!(
            reconciler
                .restored_blocks(&file, &after, ContentChange::undo())
                .is_empty()
        );
    }

    #[test]
    fn undo_flags_ignore_pending_blocks() {
        let file = file_diff("f.txt", "a\nb\nc", "a\nX\nc");
        let lines = crate::split_lines("a\nb\nc");
        assert!(
            Reconciler::default()
                .restored_blocks(&file, &lines, ContentChange::undo())
                .is_empty()
        );
    }

    #[tokio::test]
    async fn keep_edits_document_that_shows_before_text_again() {
        let (document, _events) = MemoryDocument::new();
        document.open("f.txt", "a\nb\nc");
        let file = file_diff("f.txt", "a\nb\nc", "a\nX\nc");

        let outcome = Reconciler::default()
            .apply_block(&document, &file, 0, BlockAction::Kept)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                start_index: 1,
                located: true
            }
        );
        assert_eq!(document.text("f.txt").unwrap(), "a\nX\nc");
    }

    #[tokio::test]
    async fn insertion_at_end_of_file_reverts_and_keeps() {
        let (document, _events) = MemoryDocument::new();
        document.open("f.txt", "a\nf\ng");
        let mut file = file_diff("f.txt", "a\nf", "a\nf\ng");
        let mut reconciler = Reconciler::default();

        reconciler
            .apply_block(&document, &file, 0, BlockAction::Reverted)
            .await
            .unwrap();
        assert_eq!(document.text("f.txt").unwrap(), "a\nf");
        file.blocks[0].action = BlockAction::Reverted;

        reconciler
            .apply_block(&document, &file, 0, BlockAction::Kept)
            .await
            .unwrap();
        assert_eq!(document.text("f.txt").unwrap(), "a\nf\ng");
    }

    #[test]
    fn content_hash_detects_restore_after_unrelated_edit() {
        let mut file = file_diff("f.txt", "a\nb\nc", "a\nX\nc");
        file.blocks[0].action = BlockAction::Reverted;
        let mut reconciler = Reconciler::new(ChangeDetection::ContentHash);

        let reverted = crate::split_lines("a\nb\nc\nzz");
        assert!(
            reconciler
                .restored_blocks(&file, &reverted, ContentChange::edit())
                .is_empty()
        );
        let restored = crate::split_lines("a\nX\nc\nzz");
        assert_eq!(
            reconciler.restored_blocks(&file, &restored, ContentChange::edit()),
            vec![0]
        );
    }

    #[test]
    fn content_hash_skips_content_already_checked() {
        let mut file = file_diff("f.txt", "a\nb\nc", "a\nX\nc");
        file.blocks[0].action = BlockAction::Kept;
        let mut reconciler = Reconciler::new(ChangeDetection::ContentHash);
        let lines = crate::split_lines("a\nb\nc");

        assert_eq!(
            reconciler.restored_blocks(&file, &lines, ContentChange::edit()),
            vec![0]
        );
        assert!(
            reconciler
                .restored_blocks(&file, &lines, ContentChange::flush())
                .is_empty()
        );

        reconciler.forget_file("f.txt");
        assert_eq!(
            reconciler.restored_blocks(&file, &lines, ContentChange::flush()),
            vec![0]
        );
    }

    #[test]
    fn change_detection_parses_kebab_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: ChangeDetection,
        }
        let parsed: Wrapper = toml::from_str("mode = \"content-hash\"").unwrap();
        assert_eq!(parsed.mode, ChangeDetection::ContentHash);
    }
}
