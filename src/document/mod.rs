use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::split_lines;

/// Errors raised by document collaborators.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("no document open for {0}")]
    NotOpen(String),
    #[error("edit {start}..{end} out of range for {path} ({len} lines)")]
    OutOfRange {
        path: String,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("document io error for {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Replace lines `start..end` with `lines`.
///
/// An empty range inserts before line `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEdit {
    pub start: usize,
    pub end: usize,
    pub lines: Vec<String>,
}

impl LineEdit {
    fn apply_to(self, path: &str, target: &mut Vec<String>) -> Result<()> {
        if self.start > self.end || self.end > target.len() {
            return Err(DocumentError::OutOfRange {
                path: path.to_string(),
                start: self.start,
                end: self.end,
                len: target.len(),
            });
        }
        target.splice(self.start..self.end, self.lines);
        Ok(())
    }
}

/// Why a document's content changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentChange {
    pub is_undo: bool,
    pub is_redo: bool,
    /// The whole content was replaced (reload, reopen).
    pub is_flush: bool,
}

impl ContentChange {
    pub fn edit() -> Self {
        Self::default()
    }

    pub fn undo() -> Self {
        Self {
            is_undo: true,
            ..Self::default()
        }
    }

    pub fn redo() -> Self {
        Self {
            is_redo: true,
            ..Self::default()
        }
    }

    pub fn flush() -> Self {
        Self {
            is_flush: true,
            ..Self::default()
        }
    }

    /// Undo or redo that did not replace the whole content.
    pub fn is_history(&self) -> bool {
        !self.is_flush && (self.is_undo || self.is_redo)
    }
}

/// A content change on one document, delivered as a discrete event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEvent {
    pub path: String,
    pub change: ContentChange,
}

/// The live, user-editable text of workspace files.
#[async_trait]
pub trait Document: Send + Sync {
    async fn lines(&self, path: &str) -> Result<Vec<String>>;

    /// Apply one atomic edit, undoable on its own.
    async fn apply_edit(&self, path: &str, edit: LineEdit) -> Result<()>;
}

#[derive(Debug, Default)]
struct Buffer {
    lines: Vec<String>,
    undo: Vec<Vec<String>>,
    redo: Vec<Vec<String>>,
}

/// In-memory editor buffers with per-document undo/redo history.
///
/// Every content change is announced on the channel handed out by
/// [`MemoryDocument::new`]; send errors are ignored once the receiver is
/// dropped.
#[derive(Debug)]
pub struct MemoryDocument {
    buffers: Mutex<HashMap<String, Buffer>>,
    events: mpsc::UnboundedSender<DocumentEvent>,
}

impl MemoryDocument {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DocumentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let document = Self {
            buffers: Mutex::new(HashMap::new()),
            events: tx,
        };
        (document, rx)
    }

    /// Open (or reload) a document with fresh history.
    pub fn open(&self, path: &str, text: &str) {
        self.lock().insert(
            path.to_string(),
            Buffer {
                lines: split_lines(text),
                ..Buffer::default()
            },
        );
        self.notify(path, ContentChange::flush());
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.lock().get(path).map(|b| b.lines.join("\n"))
    }

    /// A user edit.
    pub fn edit(&self, path: &str, edit: LineEdit) -> Result<()> {
        self.push_edit(path, edit)?;
        self.notify(path, ContentChange::edit());
        Ok(())
    }

    /// Step back one edit. Returns `false` when there is nothing to undo.
    pub fn undo(&self, path: &str) -> bool {
        let stepped = {
            let mut buffers = self.lock();
            match buffers.get_mut(path) {
                Some(buffer) => match buffer.undo.pop() {
                    Some(previous) => {
                        let current = std::mem::replace(&mut buffer.lines, previous);
                        buffer.redo.push(current);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if stepped {
            self.notify(path, ContentChange::undo());
        }
        stepped
    }

    /// Re-apply one undone edit. Returns `false` when there is nothing to redo.
    pub fn redo(&self, path: &str) -> bool {
        let stepped = {
            let mut buffers = self.lock();
            match buffers.get_mut(path) {
                Some(buffer) => match buffer.redo.pop() {
                    Some(next) => {
                        let current = std::mem::replace(&mut buffer.lines, next);
                        buffer.undo.push(current);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if stepped {
            self.notify(path, ContentChange::redo());
        }
        stepped
    }

    fn push_edit(&self, path: &str, edit: LineEdit) -> Result<()> {
        let mut buffers = self.lock();
        let buffer = buffers
            .get_mut(path)
            .ok_or_else(|| DocumentError::NotOpen(path.to_string()))?;
        let mut next = buffer.lines.clone();
        edit.apply_to(path, &mut next)?;
        let previous = std::mem::replace(&mut buffer.lines, next);
        buffer.undo.push(previous);
        buffer.redo.clear();
        Ok(())
    }

    fn notify(&self, path: &str, change: ContentChange) {
        let _ = self.events.send(DocumentEvent {
            path: path.to_string(),
            change,
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Buffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Document for MemoryDocument {
    async fn lines(&self, path: &str) -> Result<Vec<String>> {
        self.lock()
            .get(path)
            .map(|b| b.lines.clone())
            .ok_or_else(|| DocumentError::NotOpen(path.to_string()))
    }

    async fn apply_edit(&self, path: &str, edit: LineEdit) -> Result<()> {
        self.push_edit(path, edit)?;
        self.notify(path, ContentChange::edit());
        Ok(())
    }
}

/// Documents read from and written straight to files under a root.
///
/// There is no history, so no undo/redo events are ever produced.
#[derive(Debug, Clone)]
pub struct FsDocument {
    root: PathBuf,
}

impl FsDocument {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read(&self, path: &str) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(self.root.join(path)).await {
            Ok(text) => Ok(split_lines(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(DocumentError::NotOpen(path.to_string()))
            }
            Err(source) => Err(DocumentError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl Document for FsDocument {
    async fn lines(&self, path: &str) -> Result<Vec<String>> {
        self.read(path).await
    }

    async fn apply_edit(&self, path: &str, edit: LineEdit) -> Result<()> {
        let mut lines = self.read(path).await?;
        edit.apply_to(path, &mut lines)?;
        tokio::fs::write(self.root.join(path), lines.join("\n"))
            .await
            .map_err(|source| DocumentError::Io {
                path: path.to_string(),
                source,
            })
    }
}
