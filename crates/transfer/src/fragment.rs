use std::collections::BTreeMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use assetcache_protocol::FileFragment;
use tracing::{debug, warn};

use crate::TransferError;

/// Returns `(fragment_size, fragment_count)` for a file.
///
/// The fragment size is the smaller of `max_fragment_size` and the file
/// size; the count rounds up so the last fragment may be short.
pub fn fragment_layout(file_size: u64, max_fragment_size: usize) -> (usize, u32) {
    if file_size == 0 || max_fragment_size == 0 {
        return (0, 0);
    }
    let fragment_size = (max_fragment_size as u64).min(file_size);
    let count = file_size.div_ceil(fragment_size);
    (fragment_size as usize, count as u32)
}

// ---------------------------------------------------------------------------
// FragmentReader
// ---------------------------------------------------------------------------

/// Reads a file sequentially as indexed fragments.
pub struct FragmentReader {
    file: File,
    file_size: u64,
    fragment_size: usize,
    fragment_count: u32,
    next_id: u32,
    offset: u64,
}

impl FragmentReader {
    /// Opens `path` for fragmented reading.
    ///
    /// Empty files are rejected with [`TransferError::EmptyFile`].
    pub fn open(path: &Path, max_fragment_size: usize) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size == 0 {
            return Err(TransferError::EmptyFile(path.display().to_string()));
        }

        let (fragment_size, fragment_count) = fragment_layout(file_size, max_fragment_size);
        Ok(Self {
            file,
            file_size,
            fragment_size,
            fragment_count,
            next_id: 0,
            offset: 0,
        })
    }

    /// Reads the next fragment. Returns `None` once the whole file is read.
    pub fn next_fragment(&mut self) -> Result<Option<FileFragment>, TransferError> {
        let remaining = self.file_size - self.offset;
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = (remaining as usize).min(self.fragment_size);
        let mut buf = vec![0u8; read_size];
        match self.file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(TransferError::ShortRead {
                    fragment_id: self.next_id,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let fragment = FileFragment::new(self.next_id, buf);
        self.next_id += 1;
        self.offset += read_size as u64;
        Ok(Some(fragment))
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    /// Bytes read so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

// ---------------------------------------------------------------------------
// FragmentWriter
// ---------------------------------------------------------------------------

/// Reassembles indexed fragments into a file.
///
/// Fragments are written strictly in index order. Anything that arrives
/// ahead of `next_index` is buffered until the gap closes; anything below
/// `next_index` is a duplicate and is dropped.
pub struct FragmentWriter {
    path: PathBuf,
    file: Option<File>,
    total: u32,
    next_index: u32,
    pending: BTreeMap<u32, Vec<u8>>,
    bytes_written: u64,
}

impl FragmentWriter {
    /// Creates (or truncates) the destination file.
    pub fn create(path: &Path, total: u32) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            total,
            next_index: 0,
            pending: BTreeMap::new(),
            bytes_written: 0,
        })
    }

    /// Accepts one fragment in any order.
    pub fn write_fragment(&mut self, fragment_id: u32, data: Vec<u8>) -> Result<(), TransferError> {
        if fragment_id >= self.total {
            return Err(TransferError::FragmentOutOfRange {
                fragment_id,
                total: self.total,
            });
        }

        if fragment_id < self.next_index {
            debug!(fragment_id, next = self.next_index, "duplicate fragment ignored");
            return Ok(());
        }

        if fragment_id > self.next_index {
            self.pending.entry(fragment_id).or_insert(data);
            return Ok(());
        }

        self.append(&data)?;
        while let Some(data) = self.pending.remove(&self.next_index) {
            self.append(&data)?;
        }
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> Result<(), TransferError> {
        let Some(file) = self.file.as_mut() else {
            return Err(TransferError::Io(std::io::Error::other(
                "fragment writer already closed",
            )));
        };
        file.write_all(data)?;
        self.next_index += 1;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// `true` once every fragment has been written.
    pub fn is_complete(&self) -> bool {
        self.next_index == self.total
    }

    /// Flushes and closes the file.
    pub fn finish(&mut self) -> Result<(), TransferError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Closes and deletes the partial file.
    pub fn discard(&mut self) {
        self.file.take();
        self.pending.clear();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove partial file: {e}");
            }
        }
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of fragments held back waiting for a gap to close.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
