//! Bounds-checked random access over a binary file.
//!
//! The file size is snapshotted at open and treated as constant. Reads go
//! through a small LRU page cache so repeated nearby reads stay cheap even
//! for files far larger than RAM; the full file is never loaded at once.

use std::{
    cell::RefCell,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("offset {offset} + length {length} is not addressable")]
    InvalidOffset { offset: u64, length: u64 },
    #[error("read failed: {0}")]
    Io(String),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReaderOptions {
    pub page_size: u64,
    pub cache_pages: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            cache_pages: 16,
        }
    }
}

struct Page {
    index: u64,
    data: Vec<u8>,
}

/// Most-recently-used page at the back; linear scan is fine for the handful
/// of pages kept.
struct PageCache {
    pages: Vec<Page>,
    limit: usize,
}

impl PageCache {
    fn promote(&mut self, index: u64) -> Option<&[u8]> {
        let pos = self.pages.iter().position(|p| p.index == index)?;
        let page = self.pages.remove(pos);
        self.pages.push(page);
        self.pages.last().map(|p| p.data.as_slice())
    }

    fn insert(&mut self, index: u64, data: Vec<u8>) -> &[u8] {
        if self.pages.len() >= self.limit {
            self.pages.remove(0);
        }
        self.pages.push(Page { index, data });
        self.pages.last().map(|p| p.data.as_slice()).unwrap_or(&[])
    }
}

/// Read-only byte source over a file. Owns the file handle; not shared
/// between threads (each thread opens its own).
pub struct Reader {
    path: PathBuf,
    size: u64,
    page_size: u64,
    file: RefCell<File>,
    cache: RefCell<PageCache>,
}

impl Reader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReaderError> {
        Self::open_with(path, ReaderOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Self, ReaderError> {
        let path = path.as_ref();
        debug_assert!(options.page_size > 0 && options.cache_pages > 0);
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ReaderError::NotFound(path.to_owned()),
            _ => ReaderError::Io(e.to_string()),
        })?;
        let size = file
            .metadata()
            .map_err(|e| ReaderError::Io(e.to_string()))?
            .len();
        Ok(Self {
            path: path.to_owned(),
            size,
            page_size: options.page_size,
            file: RefCell::new(file),
            cache: RefCell::new(PageCache {
                pages: Vec::with_capacity(options.cache_pages),
                limit: options.cache_pages,
            }),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `length` bytes starting at `offset`.
    ///
    /// `offset >= size` returns empty; a read crossing EOF is truncated. An
    /// unaddressable range (`offset + length` overflows) is rejected.
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, ReaderError> {
        let end = offset
            .checked_add(length)
            .ok_or(ReaderError::InvalidOffset { offset, length })?;
        if length == 0 || offset >= self.size {
            return Ok(Vec::new());
        }
        let end = end.min(self.size);
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let page_index = pos / self.page_size;
            let within = (pos - page_index * self.page_size) as usize;
            let take = self.with_page(page_index, |data| {
                let take = data
                    .len()
                    .saturating_sub(within)
                    .min((end - pos) as usize);
                out.extend_from_slice(&data[within..within + take]);
                take
            })?;
            if take == 0 {
                break;
            }
            pos += take as u64;
        }
        Ok(out)
    }

    /// The byte at `offset`, `None` at or past EOF.
    pub fn byte_at(&self, offset: u64) -> Option<u8> {
        if offset >= self.size {
            return None;
        }
        let page_index = offset / self.page_size;
        let within = (offset - page_index * self.page_size) as usize;
        self.with_page(page_index, |data| data.get(within).copied())
            .ok()
            .flatten()
    }

    fn with_page<T>(
        &self,
        index: u64,
        f: impl FnOnce(&[u8]) -> T,
    ) -> Result<T, ReaderError> {
        let mut cache = self.cache.borrow_mut();
        if let Some(data) = cache.promote(index) {
            return Ok(f(data));
        }
        let start = index * self.page_size;
        let data = if start >= self.size {
            Vec::new()
        } else {
            let to_read = self.page_size.min(self.size - start) as usize;
            let mut buf = vec![0u8; to_read];
            let mut file = self.file.borrow_mut();
            file.seek(SeekFrom::Start(start))
                .map_err(|e| ReaderError::Io(e.to_string()))?;
            let mut filled = 0;
            while filled < buf.len() {
                let n = file
                    .read(&mut buf[filled..])
                    .map_err(|e| ReaderError::Io(e.to_string()))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            buf
        };
        Ok(f(cache.insert(index, data)))
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}
