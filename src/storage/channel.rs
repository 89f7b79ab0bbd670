//! Storage channel implementation.
//!
//! The storage channel reads and writes fixed-size pages by id and hands
//! out new page ids. It abstracts the file I/O behind a trait so the
//! buffer manager can be pointed at other backends in tests.

use crate::error::{IndexError, Result};
use crate::storage::{FileHeader, FreeList};
use crate::types::{PageId, TreeConfig};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Trait for page I/O and allocation
pub trait StorageChannel: Send + Sync {
    /// Fixed page size of this channel
    fn page_size(&self) -> usize;

    /// Read a page by id
    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>>;

    /// Write a page image
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Allocate a new page id (reusing freed pages first)
    fn allocate_page(&self) -> Result<PageId>;

    /// Return a page to the free list
    fn free_page(&self, page_id: PageId) -> Result<()>;

    /// Flush everything to durable storage
    fn sync(&self) -> Result<()>;

    /// Root page id recorded at the last commit (0 = no tree yet)
    fn root_page(&self) -> PageId;

    /// Persist the root page id (the commit's final step before sync)
    fn set_root_page(&self, page_id: PageId) -> Result<()>;

    /// Total number of pages, header included
    fn page_count(&self) -> usize;
}

/// File-backed storage channel
pub struct FileChannel {
    file: RwLock<File>,
    header: RwLock<FileHeader>,
    free_list: RwLock<FreeList>,
    page_size: usize,
    sync_on_write: bool,
}

impl FileChannel {
    /// Open or create an index file.
    ///
    /// An existing file must agree with `cfg` on page size, mode and
    /// value size.
    pub fn open(path: &Path, cfg: TreeConfig, sync_on_write: bool) -> Result<Self> {
        cfg.validate()?;
        let exists = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let header = if exists && file.metadata()?.len() >= cfg.page_size as u64 {
            let mut file_ref = &file;
            let mut buf = vec![0u8; cfg.page_size];
            file_ref.seek(SeekFrom::Start(0))?;
            file_ref.read_exact(&mut buf)?;
            let header = FileHeader::read(&buf)?;

            if header.page_size as usize != cfg.page_size {
                return Err(IndexError::invalid_db(format!(
                    "file has page size {}, configuration wants {}",
                    header.page_size, cfg.page_size
                )));
            }
            if header.unique != cfg.unique || header.value_size as usize != cfg.value_size {
                return Err(IndexError::invalid_db(
                    "file tree mode does not match the configuration",
                ));
            }
            header
        } else {
            let header = FileHeader::new(cfg.page_size as u32, cfg.unique, cfg.value_size as u8);
            let mut buf = vec![0u8; cfg.page_size];
            header.write(&mut buf);

            let mut file_ref = &file;
            file_ref.seek(SeekFrom::Start(0))?;
            file_ref.write_all(&buf)?;
            file_ref.sync_all()?;
            header
        };

        Ok(Self {
            file: RwLock::new(file),
            header: RwLock::new(header),
            free_list: RwLock::new(FreeList::new()),
            page_size: cfg.page_size,
            sync_on_write,
        })
    }

    fn flush_header(&self) -> Result<()> {
        let header = self.header.read();
        let mut buf = vec![0u8; self.page_size];
        header.write(&mut buf);
        drop(header);

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        if self.sync_on_write {
            file.sync_data()?;
        }
        Ok(())
    }

    fn check_id(&self, page_id: PageId) -> Result<()> {
        if page_id == PageId::HEADER {
            return Err(IndexError::invariant("page 0 is the header, not a node page"));
        }
        if page_id.is_transient() || !page_id.is_valid() {
            return Err(IndexError::PageNotFound(page_id));
        }
        if page_id.value() >= self.header.read().page_count {
            return Err(IndexError::PageNotFound(page_id));
        }
        Ok(())
    }
}

impl StorageChannel for FileChannel {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        self.check_id(page_id)?;

        let offset = page_id.file_offset(self.page_size);
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.check_id(page_id)?;
        if data.len() != self.page_size {
            return Err(IndexError::invariant(format!(
                "page data must be {} bytes, got {}",
                self.page_size,
                data.len()
            )));
        }

        let offset = page_id.file_offset(self.page_size);
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        if self.sync_on_write {
            file.sync_data()?;
        }
        Ok(())
    }

    fn allocate_page(&self) -> Result<PageId> {
        {
            let mut free_list = self.free_list.write();
            if let Some(page_id) = free_list.pop() {
                let mut header = self.header.write();
                header.free_page_count = free_list.len() as u32;
                header.first_free_page = free_list.head().unwrap_or(PageId::new(0));
                return Ok(page_id);
            }
        }

        let page_id = {
            let mut header = self.header.write();
            header.allocate_page()
        };

        // Extend the file so the new page is addressable
        let offset = page_id.file_offset(self.page_size);
        let zeros = vec![0u8; self.page_size];
        {
            let mut file = self.file.write();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&zeros)?;
        }
        self.flush_header()?;

        Ok(page_id)
    }

    fn free_page(&self, page_id: PageId) -> Result<()> {
        self.check_id(page_id)?;

        let mut free_list = self.free_list.write();
        free_list.push(page_id);
        {
            let mut header = self.header.write();
            header.free_page_count = free_list.len() as u32;
            header.first_free_page = page_id;
        }
        drop(free_list);
        self.flush_header()
    }

    fn sync(&self) -> Result<()> {
        self.flush_header()?;
        let file = self.file.write();
        file.sync_all()?;
        Ok(())
    }

    fn root_page(&self) -> PageId {
        self.header.read().root_page
    }

    fn set_root_page(&self, page_id: PageId) -> Result<()> {
        if page_id.is_transient() {
            return Err(IndexError::invariant(
                "root must be written before it is recorded",
            ));
        }
        {
            let mut header = self.header.write();
            header.root_page = page_id;
        }
        self.flush_header()
    }

    fn page_count(&self) -> usize {
        self.header.read().page_count as usize
    }
}
