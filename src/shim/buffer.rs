//! Buffer-object bookkeeping.
//!
//! A buffer object ties an opaque handle to an allocated device region,
//! an optional export backing file and an optional host mapping.
//! Handles are never reused while the object is live. Exported buffers
//! additionally appear in a duplicate-handle table keyed by file
//! descriptor, which is how an import finds the backing file of a
//! buffer another handle (or process) exported.

use memmap2::{MmapMut, MmapOptions};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Sentinel handle value, never assigned to a live object.
pub const NULL_HANDLE: u32 = u32::MAX;

/// Low bits of the flags word select the target bank.
pub const FLAG_BANK_MASK: u32 = 0xFFFF;
/// The buffer is eligible for peer-to-peer export.
pub const FLAG_P2P: u32 = 1 << 30;
/// The buffer lives on the device only, with no ordinary host shadow.
pub const FLAG_HOST_ONLY: u32 = 1 << 29;

/// Bank index encoded in a flags word.
pub fn bank_index(flags: u32) -> u32 {
    flags & FLAG_BANK_MASK
}

/// Whether the flags make a buffer peer-to-peer eligible.
pub fn is_p2p(flags: u32) -> bool {
    flags & (FLAG_P2P | FLAG_HOST_ONLY) != 0
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("unknown buffer handle {0:#x}")]
    UnknownHandle(u32),
    #[error("buffer {0:#x} was not created with peer-to-peer flags")]
    NotExportable(u32),
    #[error("buffer {0:#x} is not mapped")]
    NotMapped(u32),
    #[error("no exported buffer behind file descriptor {0}")]
    UnknownExport(RawFd),
    #[error("i/o on backing file failed: {0}")]
    BackingFile(String),
}

/// Host mapping of a buffer: either the shared export file or anonymous
/// page-aligned memory.
#[derive(Debug)]
pub enum Mapping {
    FileBacked { map: MmapMut, _file: File },
    Anonymous { map: MmapMut },
}

impl Mapping {
    pub fn as_ptr(&mut self) -> *mut u8 {
        match self {
            Self::FileBacked { map, .. } | Self::Anonymous { map } => map.as_mut_ptr(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::FileBacked { map, .. } | Self::Anonymous { map } => map,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::FileBacked { map, .. } | Self::Anonymous { map } => map,
        }
    }
}

/// One caller-visible buffer.
#[derive(Debug)]
pub struct BufferObject {
    pub handle: u32,
    /// Device address of the allocated region.
    pub base: u64,
    pub size: u64,
    pub flags: u32,
    /// Backing file for peer-to-peer export; None for ordinary buffers.
    pub export_path: Option<PathBuf>,
    pub mapping: Option<Mapping>,
    /// For imported objects, the descriptor they were imported from.
    pub imported_fd: Option<RawFd>,
}

/// Static properties reported for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferProperties {
    pub handle: u32,
    pub flags: u32,
    pub size: u64,
    pub paddr: u64,
}

#[derive(Debug)]
struct ExportRecord {
    path: PathBuf,
    size: u64,
    /// Keeps the descriptor alive for the duration of the export.
    _file: File,
}

/// Registry of live buffer objects for one device session.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    objects: BTreeMap<u32, BufferObject>,
    next_handle: u32,
    exports: BTreeMap<RawFd, ExportRecord>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new object and hand out its handle.
    pub fn insert(&mut self, mut object: BufferObject) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        object.handle = handle;
        self.objects.insert(handle, object);
        handle
    }

    pub fn get(&self, handle: u32) -> Option<&BufferObject> {
        self.objects.get(&handle)
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut BufferObject> {
        self.objects.get_mut(&handle)
    }

    /// Remove an object. Unknown handles yield None; freeing twice is
    /// the caller's bug and stays a no-op.
    pub fn remove(&mut self, handle: u32) -> Option<BufferObject> {
        self.objects.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drop every mapping and export record. Used at image reload and
    /// session close.
    pub fn release_host_state(&mut self) {
        for object in self.objects.values_mut() {
            object.mapping = None;
        }
        self.exports.clear();
    }

    /// Map the object into host memory.
    ///
    /// Peer-to-peer buffers map their backing file (shared, persisted);
    /// others get anonymous page-aligned memory. Returns the mapping
    /// base pointer; mapping twice remaps.
    pub fn map(&mut self, handle: u32, _for_write: bool) -> Result<*mut u8, BufferError> {
        let object = self.objects.get_mut(&handle).ok_or(BufferError::UnknownHandle(handle))?;

        let mut mapping = match &object.export_path {
            Some(path) => {
                let file = open_backing_file(path, object.size)?;
                let map = unsafe { MmapOptions::new().len(object.size as usize).map_mut(&file) }
                    .map_err(|e| BufferError::BackingFile(e.to_string()))?;
                Mapping::FileBacked { map, _file: file }
            }
            None => {
                let map = MmapOptions::new()
                    .len(object.size as usize)
                    .map_anon()
                    .map_err(|e| BufferError::BackingFile(e.to_string()))?;
                Mapping::Anonymous { map }
            }
        };
        let ptr = mapping.as_ptr();
        object.mapping = Some(mapping);
        Ok(ptr)
    }

    /// Release exactly what `map` established.
    pub fn unmap(&mut self, handle: u32) -> Result<(), BufferError> {
        let object = self.objects.get_mut(&handle).ok_or(BufferError::UnknownHandle(handle))?;
        if object.mapping.take().is_none() {
            return Err(BufferError::NotMapped(handle));
        }
        Ok(())
    }

    /// Materialize the export file and record the descriptor in the
    /// duplicate-handle table.
    pub fn export(&mut self, handle: u32) -> Result<RawFd, BufferError> {
        let object = self.objects.get(&handle).ok_or(BufferError::UnknownHandle(handle))?;
        let path = object.export_path.clone().ok_or(BufferError::NotExportable(handle))?;

        let file = open_backing_file(&path, object.size)?;
        let fd = file.as_raw_fd();
        self.exports.insert(fd, ExportRecord { path, size: object.size, _file: file });
        Ok(fd)
    }

    /// Resolve an exported descriptor back to its backing file.
    pub fn lookup_export(&self, fd: RawFd) -> Result<(PathBuf, u64), BufferError> {
        self.exports
            .get(&fd)
            .map(|record| (record.path.clone(), record.size))
            .ok_or(BufferError::UnknownExport(fd))
    }

    pub fn properties(&self, handle: u32) -> Result<BufferProperties, BufferError> {
        let object = self.objects.get(&handle).ok_or(BufferError::UnknownHandle(handle))?;
        Ok(BufferProperties {
            handle: object.handle,
            flags: object.flags,
            size: object.size,
            paddr: object.base,
        })
    }
}

/// Open an export backing file sized exactly to the buffer.
fn open_backing_file(path: &Path, size: u64) -> Result<File, BufferError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| BufferError::BackingFile(format!("{}: {}", path.display(), e)))?;
    file.set_len(size)
        .map_err(|e| BufferError::BackingFile(format!("{}: {}", path.display(), e)))?;
    Ok(file)
}

/// Pick an unused path by suffixing a counter until nothing collides.
pub fn unique_path(dir: &Path, stem: &str) -> PathBuf {
    let mut candidate = dir.join(stem);
    let mut counter = 0u32;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}{counter:x}"));
        counter += 1;
    }
    candidate
}
