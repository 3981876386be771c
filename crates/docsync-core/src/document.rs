//! Editor document handling
//!
//! The editing surface owns the document; this module defines the view of it
//! the sync core needs. All offsets and lengths count `char`s.

use std::sync::Mutex;

use ropey::{Rope, RopeSlice};
use thiserror::Error;

/// Errors that can occur when applying a change to a document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Range {from}..{to} is out of bounds for a document of length {len}")]
    OutOfBounds { from: usize, to: usize, len: usize },
}

/// A single replacement: `removed_len` chars at `offset` are replaced by
/// `inserted`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextChange {
    pub offset: usize,
    pub removed_len: usize,
    pub inserted: String,
}

impl TextChange {
    pub fn new(offset: usize, removed_len: usize, inserted: impl Into<String>) -> Self {
        Self {
            offset,
            removed_len,
            inserted: inserted.into(),
        }
    }

    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::new(offset, 0, text)
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self::new(offset, len, "")
    }

    /// A change that leaves the text as it was
    pub fn is_empty(&self) -> bool {
        self.removed_len == 0 && self.inserted.is_empty()
    }

    /// Number of chars inserted
    pub fn inserted_len(&self) -> usize {
        self.inserted.chars().count()
    }

    /// End of the replaced range in the document before the change
    pub fn removed_end(&self) -> usize {
        self.offset + self.removed_len
    }
}

/// Cursor or selection, as a half-open char range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectionRange {
    pub from: usize,
    pub to: usize,
}

impl SelectionRange {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    pub fn caret(offset: usize) -> Self {
        Self::new(offset, offset)
    }

    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }

    /// Move the range so it describes the same text after `change`
    pub fn map(self, change: &TextChange) -> Self {
        Self {
            from: map_position(self.from, change),
            to: map_position(self.to, change),
        }
    }
}

/// Positions before the change stay put; a position at the change offset
/// moves past the inserted text
fn map_position(pos: usize, change: &TextChange) -> usize {
    if pos < change.offset {
        pos
    } else if pos >= change.removed_end() {
        pos - change.removed_len + change.inserted_len()
    } else {
        change.offset + change.inserted_len()
    }
}

/// Read-only copy of the document content
///
/// Cloning shares the rope's nodes, so snapshots do not copy the text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentSnapshot {
    pub text: Rope,
    pub selection: SelectionRange,
}

impl DocumentSnapshot {
    pub fn new(text: &str) -> Self {
        Self {
            text: Rope::from_str(text),
            selection: SelectionRange::default(),
        }
    }

    /// Length in chars
    pub fn len(&self) -> usize {
        self.text.len_chars()
    }

    pub fn is_empty(&self) -> bool {
        self.text.len_chars() == 0
    }

    /// Text between two char offsets
    pub fn slice(&self, from: usize, to: usize) -> Result<RopeSlice<'_>, DocumentError> {
        self.check_range(from, to)?;
        Ok(self.text.slice(from..to))
    }

    /// Apply a change in place, mapping the selection through it
    pub fn apply(&mut self, change: &TextChange) -> Result<(), DocumentError> {
        self.check_range(change.offset, change.removed_end())?;
        self.text.remove(change.offset..change.removed_end());
        self.text.insert(change.offset, &change.inserted);
        self.selection = self.selection.map(change);
        Ok(())
    }

    /// The selection if non-empty, otherwise the whole document
    pub fn format_range(&self) -> SelectionRange {
        if self.selection.is_empty() {
            SelectionRange::new(0, self.len())
        } else {
            self.selection
        }
    }

    fn check_range(&self, from: usize, to: usize) -> Result<(), DocumentError> {
        let len = self.len();
        if from <= to && to <= len {
            Ok(())
        } else {
            Err(DocumentError::OutOfBounds { from, to, len })
        }
    }
}

/// The editing surface as seen by the sync core
///
/// `apply` is used for changes that originate remotely (formatting); local
/// edits reach the core through the tracker, which applies them itself.
pub trait DocumentSource: Send + Sync {
    fn snapshot(&self) -> DocumentSnapshot;

    fn apply(&self, change: &TextChange) -> Result<(), DocumentError>;

    fn set_selection(&self, selection: SelectionRange);
}

/// In-memory document shared between an editing surface and the sync core
#[derive(Debug, Default)]
pub struct SharedDocument {
    inner: Mutex<DocumentSnapshot>,
}

impl SharedDocument {
    pub fn new(text: &str) -> Self {
        Self {
            inner: Mutex::new(DocumentSnapshot::new(text)),
        }
    }

    pub fn text(&self) -> String {
        self.lock().text.to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DocumentSnapshot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DocumentSource for SharedDocument {
    fn snapshot(&self) -> DocumentSnapshot {
        self.lock().clone()
    }

    fn apply(&self, change: &TextChange) -> Result<(), DocumentError> {
        self.lock().apply(change)
    }

    fn set_selection(&self, selection: SelectionRange) {
        self.lock().selection = selection;
    }
}

/// Describe the difference between two texts as one replacement
///
/// Returns `None` when the texts are equal.
pub fn diff_texts(old: &str, new: &str) -> Option<TextChange> {
    if old == new {
        return None;
    }
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
    Some(TextChange::new(
        prefix,
        old_chars.len() - suffix - prefix,
        inserted,
    ))
}
