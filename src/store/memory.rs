//! RAM-backed stores.
//!
//! Used by the firmware on boards without an SD card slot and by the tests,
//! which inject faults with `set_available` and simulate restarts with
//! `power_cycle`.

use heapless::Vec;

use super::{CURSOR_RECORD_LEN, CursorStore, FileHandle, FileMode, LogStore, StoreError};
use crate::clock::FileName;

const MAX_HANDLES: usize = 4;

struct MemoryFile<const BYTES: usize> {
    name: FileName,
    data: Vec<u8, BYTES>,
}

#[derive(Clone, Copy)]
struct OpenFile {
    file: usize,
    mode: FileMode,
    pos: usize,
}

pub struct MemoryLogStore<const FILES: usize = 8, const BYTES: usize = 8192> {
    files: Vec<MemoryFile<BYTES>, FILES>,
    handles: [Option<OpenFile>; MAX_HANDLES],
    mounted: bool,
    available: bool,
}

impl<const FILES: usize, const BYTES: usize> Default for MemoryLogStore<FILES, BYTES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const FILES: usize, const BYTES: usize> MemoryLogStore<FILES, BYTES> {
    pub const fn new() -> Self {
        Self {
            files: Vec::new(),
            handles: [None; MAX_HANDLES],
            mounted: false,
            available: true,
        }
    }

    /// Simulates the card being pulled out or put back.
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
        if !available {
            self.power_cycle();
        }
    }

    /// Drops every open handle and unmounts, keeping the data.
    pub fn power_cycle(&mut self) {
        self.handles = [None; MAX_HANDLES];
        self.mounted = false;
    }

    pub fn file(&self, name: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|f| f.name.as_str() == name)
            .map(|f| f.data.as_slice())
    }

    pub fn open_handles(&self) -> usize {
        self.handles.iter().filter(|h| h.is_some()).count()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available && self.mounted {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn handle(&mut self, handle: FileHandle) -> Result<&mut OpenFile, StoreError> {
        self.handles
            .get_mut(usize::from(handle.0))
            .and_then(|h| h.as_mut())
            .ok_or(StoreError::NotFound)
    }
}

impl<const FILES: usize, const BYTES: usize> LogStore for MemoryLogStore<FILES, BYTES> {
    fn open_store(&mut self) -> Result<(), StoreError> {
        if !self.available {
            return Err(StoreError::Unavailable);
        }
        self.mounted = true;
        Ok(())
    }

    fn close_store(&mut self) {
        if self.open_handles() == 0 {
            self.mounted = false;
        }
    }

    fn is_ready(&self) -> bool {
        self.available
    }

    fn open(&mut self, name: &str, mode: FileMode) -> Result<FileHandle, StoreError> {
        self.check()?;
        let slot = self
            .handles
            .iter()
            .position(|h| h.is_none())
            .ok_or(StoreError::Full)?;

        let file = match self.files.iter().position(|f| f.name.as_str() == name) {
            Some(file) => file,
            None if mode == FileMode::Append => {
                let name = FileName::try_from(name).map_err(|_| StoreError::Io)?;
                self.files
                    .push(MemoryFile {
                        name,
                        data: Vec::new(),
                    })
                    .map_err(|_| StoreError::Full)?;
                self.files.len() - 1
            }
            None => return Err(StoreError::NotFound),
        };

        let pos = match mode {
            FileMode::Read => 0,
            FileMode::Append => self.files[file].data.len(),
        };
        self.handles[slot] = Some(OpenFile { file, mode, pos });
        Ok(FileHandle(slot as u8))
    }

    fn append(&mut self, handle: FileHandle, line: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        let open = *self.handle(handle)?;
        if open.mode != FileMode::Append {
            return Err(StoreError::Io);
        }
        let data = &mut self.files[open.file].data;
        if data.capacity() - data.len() < line.len() + 1 {
            return Err(StoreError::Full);
        }
        data.extend_from_slice(line).map_err(|_| StoreError::Full)?;
        data.push(b'\n').map_err(|_| StoreError::Full)?;
        Ok(())
    }

    fn read_line(
        &mut self,
        handle: FileHandle,
        buf: &mut [u8],
    ) -> Result<Option<usize>, StoreError> {
        self.check()?;
        let open = *self.handle(handle)?;
        let data = &self.files[open.file].data;
        if open.pos >= data.len() {
            return Ok(None);
        }
        let rest = &data[open.pos..];
        let (line, consumed) = match rest.iter().position(|b| *b == b'\n') {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        let len = line.len();
        if len > buf.len() {
            self.handle(handle)?.pos += consumed;
            return Err(StoreError::LineTooLong);
        }
        buf[..len].copy_from_slice(line);
        self.handle(handle)?.pos += consumed;
        Ok(Some(len))
    }

    fn close(&mut self, handle: FileHandle) {
        if let Some(slot) = self.handles.get_mut(usize::from(handle.0)) {
            *slot = None;
        }
    }

    fn next_file(&mut self, after: Option<&str>) -> Option<FileName> {
        if self.check().is_err() {
            return None;
        }
        self.files
            .iter()
            .map(|f| &f.name)
            .filter(|name| after.is_none_or(|after| name.as_str() > after))
            .min()
            .cloned()
    }
}

/// Cursor record kept in RAM. A write replaces the whole record at once.
#[derive(Default)]
pub struct MemoryCursorStore {
    record: Option<[u8; CURSOR_RECORD_LEN]>,
    open: bool,
    fail_writes: bool,
    writes: u32,
}

impl MemoryCursorStore {
    pub const fn new() -> Self {
        Self {
            record: None,
            open: false,
            fail_writes: false,
            writes: 0,
        }
    }

    pub fn raw(&self) -> Option<[u8; CURSOR_RECORD_LEN]> {
        self.record
    }

    /// Overwrites the stored bytes, e.g. with a corrupted record.
    pub fn set_raw(&mut self, raw: [u8; CURSOR_RECORD_LEN]) {
        self.record = Some(raw);
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn writes(&self) -> u32 {
        self.writes
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn power_cycle(&mut self) {
        self.open = false;
    }
}

impl CursorStore for MemoryCursorStore {
    fn open(&mut self) -> Result<(), StoreError> {
        self.open = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8; CURSOR_RECORD_LEN]) -> Result<bool, StoreError> {
        if !self.open {
            return Err(StoreError::NotFound);
        }
        match self.record {
            Some(record) => {
                *buf = record;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write(&mut self, record: &[u8; CURSOR_RECORD_LEN]) -> Result<(), StoreError> {
        if !self.open {
            return Err(StoreError::NotFound);
        }
        if self.fail_writes {
            return Err(StoreError::Io);
        }
        self.record = Some(*record);
        self.writes += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}
