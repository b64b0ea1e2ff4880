pub mod cli;
pub mod config;
pub mod controller;
pub mod differ;
pub mod document;
pub mod locate;
pub mod reconcile;
pub mod review;
pub mod snapshot;
pub mod stat;

use serde::Serialize;

/// Identifier of one unit of agent work.
pub type TaskId = u64;

/// How a block (or a whole file) differs between the two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Deleted,
    Modified,
}

impl ChangeType {
    /// Classify a change from the number of lines on each side.
    pub fn classify(before_len: usize, after_len: usize) -> Self {
        if before_len == 0 {
            ChangeType::Added
        } else if after_len == 0 {
            ChangeType::Deleted
        } else {
            ChangeType::Modified
        }
    }
}

/// The user's decision on a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockAction {
    Pending,
    Kept,
    Reverted,
}

/// Aggregate decision across all blocks of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Pending,
    Kept,
    Reverted,
    Mixed,
}

/// Added/removed line counts between two texts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStat {
    pub added: usize,
    pub removed: usize,
}

/// One contiguous change inside one file's diff.
///
/// Ranges are 0-based and half-open, in the coordinates of the snapshot
/// they refer to. The context windows hold unchanged after-snapshot lines
/// and are only used to re-locate the block in a drifted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    pub id: String,
    pub before_start: usize,
    pub before_end: usize,
    pub after_start: usize,
    pub after_end: usize,
    pub before_lines: Vec<String>,
    pub after_lines: Vec<String>,
    pub change_type: ChangeType,
    pub action: BlockAction,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
}

impl Block {
    pub fn before_text(&self) -> String {
        self.before_lines.join("\n")
    }

    pub fn after_text(&self) -> String {
        self.after_lines.join("\n")
    }

    /// Lines the document shows for this block in its current state.
    pub fn displayed_lines(&self) -> &[String] {
        match self.action {
            BlockAction::Reverted => &self.before_lines,
            BlockAction::Pending | BlockAction::Kept => &self.after_lines,
        }
    }

    /// Lines the document showed before the current decision was applied.
    ///
    /// `None` for pending blocks, which have no decision to undo.
    pub fn pre_decision_lines(&self) -> Option<&[String]> {
        match self.action {
            BlockAction::Pending => None,
            BlockAction::Kept => Some(&self.before_lines),
            BlockAction::Reverted => Some(&self.after_lines),
        }
    }

    /// Line delta this block contributes when shown reverted instead of kept.
    fn reverted_shift(&self) -> isize {
        self.before_lines.len() as isize - self.after_lines.len() as isize
    }
}

/// One file's changes for the current task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDiff {
    pub path: String,
    pub before: Option<String>,
    pub after: Option<String>,
    pub change_type: ChangeType,
    pub stat: DiffStat,
    pub blocks: Vec<Block>,
    /// Only consulted when `blocks` is empty.
    pub fallback_action: FileAction,
}

impl FileDiff {
    /// Aggregate action derived from the blocks.
    pub fn action(&self) -> FileAction {
        if self.blocks.is_empty() {
            return self.fallback_action;
        }
        let mut kept = 0;
        let mut reverted = 0;
        for block in &self.blocks {
            match block.action {
                BlockAction::Pending => return FileAction::Pending,
                BlockAction::Kept => kept += 1,
                BlockAction::Reverted => reverted += 1,
            }
        }
        if kept == self.blocks.len() {
            FileAction::Kept
        } else if reverted == self.blocks.len() {
            FileAction::Reverted
        } else {
            FileAction::Mixed
        }
    }

    pub fn block_index(&self, block_id: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == block_id)
    }

    /// Best guess of where block `index` starts in a document that shows
    /// every block in its current state.
    ///
    /// Starts from the block's after-snapshot position and shifts it by
    /// the blocks above it that are currently shown reverted.
    pub fn preferred_index(&self, index: usize) -> usize {
        let Some(block) = self.blocks.get(index) else {
            return 0;
        };
        let shift: isize = self.blocks[..index]
            .iter()
            .filter(|b| b.action == BlockAction::Reverted)
            .map(Block::reverted_shift)
            .sum();
        (block.after_start as isize + shift).max(0) as usize
    }

    /// Set every block to `action`, or the fallback when there are none.
    pub fn set_all(&mut self, action: BlockAction) {
        for block in &mut self.blocks {
            block.action = action;
        }
        self.fallback_action = match action {
            BlockAction::Pending => FileAction::Pending,
            BlockAction::Kept => FileAction::Kept,
            BlockAction::Reverted => FileAction::Reverted,
        };
    }
}

/// Split text into lines on `\n`. The empty text has no lines.
pub fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split('\n').map(str::to_owned).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(action: BlockAction) -> Block {
        Block {
            id: "f#0".to_string(),
            before_start: 0,
            before_end: 1,
            after_start: 0,
            after_end: 1,
            before_lines: vec!["old".to_string()],
            after_lines: vec!["new".to_string()],
            change_type: ChangeType::Modified,
            action,
            context_before: Vec::new(),
            context_after: Vec::new(),
        }
    }

    fn file_with(actions: &[BlockAction]) -> FileDiff {
        FileDiff {
            path: "f".to_string(),
            before: Some("old".to_string()),
            after: Some("new".to_string()),
            change_type: ChangeType::Modified,
            stat: DiffStat::default(),
            blocks: actions.iter().map(|a| block(*a)).collect(),
            fallback_action: FileAction::Pending,
        }
    }

    #[test]
    fn aggregation_all_kept() {
        let file = file_with(&[BlockAction::Kept, BlockAction::Kept]);
        assert_eq!(file.action(), FileAction::Kept);
    }

    #[test]
    fn aggregation_kept_and_reverted_is_mixed() {
        let file = file_with(&[BlockAction::Kept, BlockAction::Reverted]);
        assert_eq!(file.action(), FileAction::Mixed);
    }

    #[test]
    fn aggregation_any_pending_wins() {
        let file = file_with(&[BlockAction::Pending, BlockAction::Kept]);
        assert_eq!(file.action(), FileAction::Pending);
    }

    #[test]
    fn aggregation_all_reverted() {
        let file = file_with(&[BlockAction::Reverted, BlockAction::Reverted]);
        assert_eq!(file.action(), FileAction::Reverted);
    }

    #[test]
    fn aggregation_without_blocks_uses_fallback() {
        let mut file = file_with(&[]);
        assert_eq!(file.action(), FileAction::Pending);
        file.set_all(BlockAction::Kept);
        assert_eq!(file.action(), FileAction::Kept);
    }

    #[test]
    fn split_lines_empty_text_has_no_lines() {
        assert!(split_lines("").is_empty());
        assert_eq!(split_lines("a\n"), vec!["a".to_string(), String::new()]);
        assert_eq!(split_lines("a\nb").join("\n"), "a\nb");
    }

    #[test]
    fn preferred_index_shifts_for_reverted_blocks_above() {
        let mut file = file_with(&[BlockAction::Reverted, BlockAction::Pending]);
        file.blocks[0].before_lines = vec!["x".into(), "y".into(), "z".into()];
        file.blocks[1].after_start = 10;
        assert_eq!(file.preferred_index(1), 12);
        file.blocks[0].action = BlockAction::Kept;
        assert_eq!(file.preferred_index(1), 10);
    }
}
