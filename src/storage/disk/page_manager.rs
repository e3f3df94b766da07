use crate::storage::error::StorageError;
use crate::storage::page::{PageId, METADATA_PAGE_ID};
use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 4096;
pub const DB_SIGNATURE: &[u8; 6] = b"MINIDB";
pub const FORMAT_VERSION: i16 = 1;

/// Contents of page 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub version: i16,
    pub page_size: i32,
    pub page_count: i32,
}

/// Raw page I/O against a single database file.
///
/// The page count lives in memory and is persisted into page 0 by
/// [`PageManager::sync_metadata`]. Allocation extends the file right away, so after a
/// crash the file length still accounts for every page handed out.
pub struct PageManager {
    file: File,
    num_pages: u32,
    free_pages: Vec<PageId>,
}

impl PageManager {
    /// Opens the database file at `path`, initialising it when it is missing or empty.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open database file: {:?}", path))?;
        let file_len = file.metadata()?.len();

        let mut manager = Self {
            file,
            num_pages: 1,
            free_pages: Vec::new(),
        };

        if file_len == 0 {
            manager.sync_metadata()?;
            info!("initialised database file {:?}", path);
            return Ok(manager);
        }

        if file_len < PAGE_SIZE as u64 {
            bail!(StorageError::InvalidDatabaseFile(format!(
                "file is {} bytes, shorter than the metadata page",
                file_len
            )));
        }

        let metadata = manager.read_metadata()?;
        let on_disk = (file_len / PAGE_SIZE as u64) as u32;
        let recorded = u32::try_from(metadata.page_count).map_err(|_| {
            StorageError::InvalidDatabaseFile(format!(
                "negative page count {}",
                metadata.page_count
            ))
        })?;
        manager.num_pages = recorded.max(on_disk).max(1);

        info!(
            "opened database file {:?} ({} pages, {} recorded in metadata)",
            path, manager.num_pages, recorded
        );
        Ok(manager)
    }

    /// Reads page 0 and validates signature, version and page size.
    pub fn read_metadata(&mut self) -> Result<FileMetadata> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file
            .seek(SeekFrom::Start(0))
            .context("Failed to seek to metadata page")?;
        self.file
            .read_exact(&mut buf)
            .context("Failed to read metadata page")?;

        if &buf[..DB_SIGNATURE.len()] != DB_SIGNATURE {
            bail!(StorageError::InvalidDatabaseFile(
                "missing MINIDB signature".to_string()
            ));
        }

        let mut cursor = Cursor::new(&buf[DB_SIGNATURE.len()..]);
        let version = cursor.read_i16::<BigEndian>()?;
        let page_size = cursor.read_i32::<BigEndian>()?;
        let page_count = cursor.read_i32::<BigEndian>()?;

        if version != FORMAT_VERSION {
            bail!(StorageError::UnsupportedVersion {
                found: version,
                expected: FORMAT_VERSION,
            });
        }
        if page_size != PAGE_SIZE as i32 {
            bail!(StorageError::PageSizeMismatch {
                found: page_size,
                expected: PAGE_SIZE as i32,
            });
        }

        Ok(FileMetadata {
            version,
            page_size,
            page_count,
        })
    }

    /// Rewrites page 0 with the current page count and forces the file to disk.
    pub fn sync_metadata(&mut self) -> Result<()> {
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[..DB_SIGNATURE.len()].copy_from_slice(DB_SIGNATURE);
        {
            let mut cursor = Cursor::new(&mut buf[DB_SIGNATURE.len()..]);
            cursor.write_i16::<BigEndian>(FORMAT_VERSION)?;
            cursor.write_i32::<BigEndian>(PAGE_SIZE as i32)?;
            cursor.write_i32::<BigEndian>(self.num_pages as i32)?;
        }

        self.file
            .seek(SeekFrom::Start(0))
            .context("Failed to seek to metadata page")?;
        self.file
            .write_all(&buf)
            .context("Failed to write metadata page")?;
        self.file.sync_all().context("Failed to sync database file")?;
        debug!("synced metadata ({} pages)", self.num_pages);
        Ok(())
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            bail!(
                "Buffer size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                buf.len()
            );
        }
        self.check_allocated(page_id)?;

        self.file
            .seek(SeekFrom::Start(Self::page_offset(page_id)))
            .context("Failed to seek")?;
        self.file
            .read_exact(buf)
            .with_context(|| format!("Failed to read page {}", page_id))?;
        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            bail!(
                "Data size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                data.len()
            );
        }
        if page_id == METADATA_PAGE_ID {
            bail!("Page 0 is reserved for file metadata");
        }
        self.check_allocated(page_id)?;

        self.file
            .seek(SeekFrom::Start(Self::page_offset(page_id)))
            .context("Failed to seek")?;
        self.file
            .write_all(data)
            .with_context(|| format!("Failed to write page {}", page_id))?;
        Ok(())
    }

    /// Hands out a previously freed page id, or extends the file by one page.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        if let Some(page_id) = self.free_pages.pop() {
            debug!("reusing freed page {}", page_id);
            return Ok(page_id);
        }

        let page_id = PageId(self.num_pages);
        let new_len = (self.num_pages as u64 + 1) * PAGE_SIZE as u64;
        self.file
            .set_len(new_len)
            .context("Failed to extend file")?;
        self.num_pages += 1;
        debug!("allocated page {}", page_id);
        Ok(page_id)
    }

    /// Returns a page id to the free list. The list is not persisted.
    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        if page_id == METADATA_PAGE_ID {
            bail!("Page 0 is reserved for file metadata");
        }
        self.check_allocated(page_id)?;
        if self.free_pages.contains(&page_id) {
            bail!("Page {} is already free", page_id);
        }
        self.free_pages.push(page_id);
        Ok(())
    }

    /// Flushes file contents (not metadata) to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data().context("Failed to sync database file")
    }

    pub fn close(&mut self) -> Result<()> {
        self.sync_metadata()
    }

    /// Number of pages in the file, including the metadata page.
    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn is_free(&self, page_id: PageId) -> bool {
        self.free_pages.contains(&page_id)
    }

    pub fn free_page_count(&self) -> usize {
        self.free_pages.len()
    }

    fn check_allocated(&self, page_id: PageId) -> Result<()> {
        if page_id.0 >= self.num_pages {
            bail!(StorageError::PageNotAllocated(page_id));
        }
        Ok(())
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}
