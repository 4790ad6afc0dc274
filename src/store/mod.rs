//! Persistent stores: the per-day log files and the publish cursor record.
//!
//! Both are collaborators; the tasks own a handle only between their open and
//! close states and always release it before reaching their wait state.

pub mod cursor;
pub mod memory;
pub mod record;

use crate::clock::FileName;

pub use cursor::{CURSOR_RECORD_LEN, Cursor, CursorError};
pub use memory::{MemoryCursorStore, MemoryLogStore};
pub use record::{LINE_LEN, LogRecord, Line};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    /// Medium missing or not mounted.
    Unavailable,
    NotFound,
    /// No room for another file, handle or byte.
    Full,
    /// A line did not fit the caller's buffer.
    LineTooLong,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FileMode {
    Read,
    /// Create if absent, position at the end. Existing bytes are never rewritten.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileHandle(pub u8);

/// File-like log store (SD card).
pub trait LogStore {
    fn open_store(&mut self) -> Result<(), StoreError>;
    fn close_store(&mut self);
    /// Whether the medium would accept `open_store` right now.
    fn is_ready(&self) -> bool;
    fn open(&mut self, name: &str, mode: FileMode) -> Result<FileHandle, StoreError>;
    /// Appends `line` followed by a newline.
    fn append(&mut self, handle: FileHandle, line: &[u8]) -> Result<(), StoreError>;
    /// Next line without its newline, `None` at end of file. A line longer
    /// than `buf` is skipped and reported as [`StoreError::LineTooLong`].
    fn read_line(&mut self, handle: FileHandle, buf: &mut [u8])
    -> Result<Option<usize>, StoreError>;
    fn close(&mut self, handle: FileHandle);
    /// Day files in name order: the first one after `after`, or the first of all.
    fn next_file(&mut self, after: Option<&str>) -> Option<FileName>;
}

/// Single fixed-size record holding the publish cursor.
///
/// `write` must be an atomic overwrite: after a power loss `read` returns
/// either the previous record or the new one, never a mix.
pub trait CursorStore {
    fn open(&mut self) -> Result<(), StoreError>;
    /// `Ok(false)` when no record was ever written.
    fn read(&mut self, buf: &mut [u8; CURSOR_RECORD_LEN]) -> Result<bool, StoreError>;
    fn write(&mut self, record: &[u8; CURSOR_RECORD_LEN]) -> Result<(), StoreError>;
    fn close(&mut self);
}
