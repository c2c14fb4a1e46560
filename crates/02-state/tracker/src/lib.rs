//! Named shared-memory trackers: fixed-length typed vectors readable and
//! writable from any process on the host.
//!
//! A tracker is a small file-backed mmap region holding a header and a
//! vector of word-sized cells. Scalar reads and writes are atomic per cell;
//! vector-wide consistency is intentionally not provided. Consumers must
//! tolerate observing a write that has been partially superseded by another
//! write to a different index.
//!
//! Regions live under `/dev/shm` when available (plain temp dir otherwise)
//! so external visualizer processes can attach by name alone.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use thiserror::Error;

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Maximum tracker name length, matching the platform shm-name limit.
pub const MAX_NAME_LEN: usize = 63;

const MAGIC: u32 = 0x544B_5231; // "TKR1"
const HEADER_LEN: usize = 16;
/// Every element occupies one 8-byte slot so cells stay word-aligned for
/// atomic access regardless of the scalar width.
const SLOT_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker region '{0}' already exists")]
    AlreadyExists(String),

    #[error("tracker region '{0}' not found")]
    NotFound(String),

    #[error("index {index} out of bounds for tracker of length {len}")]
    Bounds { index: usize, len: usize },

    #[error("tracker name '{0}' is not ascii or exceeds {MAX_NAME_LEN} bytes")]
    InvalidName(String),

    #[error("tracker region '{name}' holds dtype {found:?}, expected {expected:?}")]
    DtypeMismatch {
        name: String,
        expected: Dtype,
        found: Dtype,
    },

    #[error("tracker region '{0}' is malformed")]
    Malformed(String),

    #[error("tracker i/o failure: {0}")]
    Io(#[from] io::Error),
}

/// Scalar type tag persisted in the region header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Dtype {
    U32 = 1,
    U64 = 2,
    F64 = 3,
}

impl Dtype {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Dtype::U32),
            2 => Some(Dtype::U64),
            3 => Some(Dtype::F64),
            _ => None,
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
    impl Sealed for f64 {}
}

/// Scalars a tracker can hold. Sealed: the cell layout is fixed at one
/// 8-byte word per element.
pub trait TrackerScalar: sealed::Sealed + Copy {
    const DTYPE: Dtype;

    fn to_word(self) -> u64;
    fn from_word(word: u64) -> Self;
}

impl TrackerScalar for u32 {
    const DTYPE: Dtype = Dtype::U32;

    fn to_word(self) -> u64 {
        u64::from(self)
    }

    fn from_word(word: u64) -> Self {
        word as u32
    }
}

impl TrackerScalar for u64 {
    const DTYPE: Dtype = Dtype::U64;

    fn to_word(self) -> u64 {
        self
    }

    fn from_word(word: u64) -> Self {
        word
    }
}

impl TrackerScalar for f64 {
    const DTYPE: Dtype = Dtype::F64;

    fn to_word(self) -> u64 {
        self.to_bits()
    }

    fn from_word(word: u64) -> Self {
        f64::from_bits(word)
    }
}

/// Directory holding tracker regions on this host.
pub fn tracker_root() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Canonical tracker name for a module-owned purpose.
pub fn tracker_name(module_type: u8, module_id: u8, purpose: &str) -> String {
    format!("{module_type}_{module_id}_{purpose}_tracker")
}

/// Handle to a named shared tracker region.
///
/// Dropping the handle disconnects without destroying the backing region;
/// exactly one holder (the creator) should call [`destroy`](Self::destroy)
/// once all other holders have disconnected.
pub struct SharedTracker<T: TrackerScalar> {
    name: String,
    path: PathBuf,
    map: MmapMut,
    len: usize,
    destroy_on_drop: bool,
    _marker: PhantomData<T>,
}

// SAFETY: all cell access goes through `AtomicU64` operations on the mapped
// words; the mmap itself is never reborrowed mutably after construction.
unsafe impl<T: TrackerScalar> Send for SharedTracker<T> {}
// SAFETY: as above; concurrent `read`/`write` calls are per-cell atomic.
unsafe impl<T: TrackerScalar> Sync for SharedTracker<T> {}

impl<T: TrackerScalar> SharedTracker<T> {
    /// Creates (or, with `exist_ok`, re-opens and zero-fills) a named region
    /// under the default tracker root.
    pub fn create(name: &str, len: usize, exist_ok: bool) -> TrackerResult<Self> {
        Self::create_in(&tracker_root(), name, len, exist_ok)
    }

    /// Connects to an existing region under the default tracker root.
    pub fn connect(name: &str) -> TrackerResult<Self> {
        Self::connect_in(&tracker_root(), name)
    }

    /// As [`create`](Self::create), rooted at an explicit directory.
    pub fn create_in(root: &Path, name: &str, len: usize, exist_ok: bool) -> TrackerResult<Self> {
        validate_name(name)?;
        let path = root.join(name);
        let total = HEADER_LEN + len * SLOT_LEN;

        let mut file = if exist_ok {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?
        } else {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(TrackerError::AlreadyExists(name.to_owned()));
                }
                Err(err) => return Err(err.into()),
            }
        };

        file.set_len(total as u64)?;
        write_header::<T>(&mut file, len)?;

        // SAFETY: the file is sized above and stays alive for the mapping's
        // lifetime via the descriptor held by the kernel mapping.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        // Zero-fill the data section; `exist_ok` re-creation must not leak a
        // previous run's values.
        map[HEADER_LEN..total].fill(0);

        Ok(Self {
            name: name.to_owned(),
            path,
            map,
            len,
            destroy_on_drop: false,
            _marker: PhantomData,
        })
    }

    /// As [`connect`](Self::connect), rooted at an explicit directory.
    pub fn connect_in(root: &Path, name: &str) -> TrackerResult<Self> {
        validate_name(name)?;
        let path = root.join(name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TrackerError::NotFound(name.to_owned()));
            }
            Err(err) => return Err(err.into()),
        };

        // SAFETY: mapping a live descriptor; see `create_in`.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let len = read_header::<T>(name, &map)?;
        if map.len() < HEADER_LEN + len * SLOT_LEN {
            return Err(TrackerError::Malformed(name.to_owned()));
        }

        Ok(Self {
            name: name.to_owned(),
            path,
            map,
            len,
            destroy_on_drop: false,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Atomically reads one element.
    pub fn read(&self, index: usize) -> TrackerResult<T> {
        let cell = self.cell(index)?;
        Ok(T::from_word(cell.load(Ordering::Acquire)))
    }

    /// Atomically writes one element.
    pub fn write(&self, index: usize, value: T) -> TrackerResult<()> {
        let cell = self.cell(index)?;
        cell.store(value.to_word(), Ordering::Release);
        Ok(())
    }

    /// Copies a range of elements. The copy is element-wise atomic only;
    /// concurrent writers may interleave across indices.
    pub fn read_slice(&self, range: std::ops::Range<usize>) -> TrackerResult<Vec<T>> {
        if range.end > self.len || range.start > range.end {
            return Err(TrackerError::Bounds {
                index: range.end,
                len: self.len,
            });
        }
        range.map(|index| self.read(index)).collect()
    }

    /// Releases this handle without touching the backing region.
    pub fn disconnect(self) {
        drop(self);
    }

    /// Removes the backing region. The creator calls this exactly once,
    /// after the last holder has disconnected.
    pub fn destroy(mut self) -> TrackerResult<()> {
        self.destroy_on_drop = false;
        let path = self.path.clone();
        drop(self);
        match remove_region(&path) {
            Ok(()) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Arms (or disarms) region removal when this handle drops. The creating
    /// holder uses this to tie the region's lifetime to its own.
    pub fn set_destroy_on_drop(&mut self, destroy: bool) {
        self.destroy_on_drop = destroy;
    }

    fn cell(&self, index: usize) -> TrackerResult<&AtomicU64> {
        if index >= self.len {
            return Err(TrackerError::Bounds {
                index,
                len: self.len,
            });
        }
        let offset = HEADER_LEN + index * SLOT_LEN;
        let ptr = self.map[offset..offset + SLOT_LEN].as_ptr();
        debug_assert_eq!(ptr as usize % SLOT_LEN, 0, "cells must stay word aligned");
        // SAFETY: the slot is within the mapping, 8-byte aligned (the header
        // is 16 bytes and the mapping is page aligned), and only ever
        // accessed through AtomicU64 operations.
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }
}

impl<T: TrackerScalar> Drop for SharedTracker<T> {
    fn drop(&mut self) {
        if self.destroy_on_drop {
            let _ = remove_region(&self.path);
        }
    }
}

fn remove_region(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn validate_name(name: &str) -> TrackerResult<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || !name.is_ascii()
        || name.contains(['/', '\\'])
    {
        return Err(TrackerError::InvalidName(name.to_owned()));
    }
    Ok(())
}

fn write_header<T: TrackerScalar>(file: &mut File, len: usize) -> TrackerResult<()> {
    use std::io::Seek;

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4] = 0; // layout version
    header[5] = T::DTYPE as u8;
    header[8..12].copy_from_slice(&(len as u32).to_le_bytes());
    file.seek(io::SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

fn read_header<T: TrackerScalar>(name: &str, map: &MmapMut) -> TrackerResult<usize> {
    if map.len() < HEADER_LEN {
        return Err(TrackerError::Malformed(name.to_owned()));
    }
    let magic = u32::from_le_bytes(map[0..4].try_into().expect("len checked"));
    if magic != MAGIC {
        return Err(TrackerError::Malformed(name.to_owned()));
    }
    let dtype =
        Dtype::from_byte(map[5]).ok_or_else(|| TrackerError::Malformed(name.to_owned()))?;
    if dtype != T::DTYPE {
        return Err(TrackerError::DtypeMismatch {
            name: name.to_owned(),
            expected: T::DTYPE,
            found: dtype,
        });
    }
    Ok(u32::from_le_bytes(map[8..12].try_into().expect("len checked")) as usize)
}
