//! Memory-mapped data plane shared by the host and one plugin.
//!
//! The region is a file beside the rendezvous socket, named after it with an
//! `.shm` extension. It holds two byte rings, one per direction, and each
//! ring has a single producer: the host writes the first ring and the plugin
//! the second. A sender copies a payload into its ring and then writes a
//! [`FrameKind::Mapped`](crate::FrameKind::Mapped) frame carrying only the
//! length; the receiver copies that many bytes out when the frame arrives.
//! The socket keeps ordering, stream routing and liveness while payload
//! bytes travel through the mapping.
//!
//! Layout, with counters as native-endian `u64` words:
//!
//! | offset | contents |
//! |---|---|
//! | 0 | magic |
//! | 8 | ring capacity in bytes |
//! | 64 | host ring head, tail |
//! | 128 | plugin ring head, tail |
//! | 4096 | host ring bytes, then plugin ring bytes |
//!
//! Heads and tails only ever grow; a ring position is the counter masked by
//! the (power of two) capacity.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use memmap2::MmapRaw;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::session::Role;

const REGION_TARGET: &str = "otelplug_ipc::region";

const MAGIC: u64 = u64::from_be_bytes(*b"OTPLSHM1");
const MAGIC_AT: usize = 0;
const CAPACITY_AT: usize = 8;
const DATA_AT: usize = 4_096;

/// Smallest ring a region accepts.
pub const MIN_RING_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ring {
    Host,
    Plugin,
}

impl Ring {
    const fn written_by(role: Role) -> Self {
        match role {
            Role::Host => Self::Host,
            Role::Plugin => Self::Plugin,
        }
    }

    const fn read_by(role: Role) -> Self {
        match role {
            Role::Host => Self::Plugin,
            Role::Plugin => Self::Host,
        }
    }

    const fn head_at(self) -> usize {
        match self {
            Self::Host => 64,
            Self::Plugin => 128,
        }
    }

    const fn tail_at(self) -> usize {
        self.head_at() + 8
    }

    const fn data_at(self, capacity: usize) -> usize {
        match self {
            Self::Host => DATA_AT,
            Self::Plugin => DATA_AT + capacity,
        }
    }
}

/// One side's view of a plugin's shared-memory region.
pub struct SharedRegion {
    map: MmapRaw,
    path: Utf8PathBuf,
    capacity: usize,
    role: Role,
    push_lock: Mutex<()>,
    pull_lock: Mutex<()>,
}

impl SharedRegion {
    /// Host side: creates and maps a fresh region at `path` with two rings
    /// of `capacity` bytes.
    ///
    /// `capacity` must be a power of two no smaller than
    /// [`MIN_RING_CAPACITY`]. The file is created with mode `0600` and must
    /// not already exist.
    pub fn create(path: &Utf8Path, capacity: usize) -> Result<Self, TransportError> {
        let len = region_len(capacity).ok_or_else(|| TransportError::InvalidRegion {
            path: path.to_path_buf(),
            message: format!("ring capacity {capacity} is not a power of two of at least {MIN_RING_CAPACITY} bytes"),
        })?;
        let region_error = |source: io::Error| TransportError::Region {
            path: path.to_path_buf(),
            source: Arc::new(source),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path.as_std_path())
            .map_err(region_error)?;
        let mapped = file
            .set_len(widen(len))
            .and_then(|()| MmapRaw::map_raw(&file));
        let map = match mapped {
            Ok(map) => map,
            Err(source) => {
                if let Err(error) = remove_region_file(path) {
                    warn!(target: REGION_TARGET, error = %error, "cleanup after mapping failure failed");
                }
                return Err(region_error(source));
            }
        };

        let region = Self::from_map(map, path, capacity, Role::Host);
        region.word(CAPACITY_AT).store(widen(capacity), Ordering::Relaxed);
        region.word(MAGIC_AT).store(MAGIC, Ordering::Release);
        debug!(target: REGION_TARGET, path = %path, capacity, "shared-memory region created");
        Ok(region)
    }

    /// Plugin side: maps the region the host created at `path`.
    pub fn open(path: &Utf8Path) -> Result<Self, TransportError> {
        let invalid = |message: &str| TransportError::InvalidRegion {
            path: path.to_path_buf(),
            message: message.to_owned(),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_std_path())
            .map_err(|source| TransportError::Region {
                path: path.to_path_buf(),
                source: Arc::new(source),
            })?;
        let map = MmapRaw::map_raw(&file).map_err(|source| TransportError::Region {
            path: path.to_path_buf(),
            source: Arc::new(source),
        })?;
        if map.len() < DATA_AT {
            return Err(invalid("region is shorter than its header"));
        }

        let mut region = Self::from_map(map, path, 0, Role::Plugin);
        if region.word(MAGIC_AT).load(Ordering::Acquire) != MAGIC {
            return Err(invalid("region header carries the wrong magic"));
        }
        let capacity =
            usize::try_from(region.word(CAPACITY_AT).load(Ordering::Relaxed)).unwrap_or(0);
        if region_len(capacity) != Some(region.map.len()) {
            return Err(invalid("ring capacity does not match the region size"));
        }
        region.capacity = capacity;
        debug!(target: REGION_TARGET, path = %path, capacity, "shared-memory region mapped");
        Ok(region)
    }

    fn from_map(map: MmapRaw, path: &Utf8Path, capacity: usize, role: Role) -> Self {
        Self {
            map,
            path: path.to_path_buf(),
            capacity,
            role,
            push_lock: Mutex::new(()),
            pull_lock: Mutex::new(()),
        }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Bytes in each ring.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes this side has pushed since the region was created.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.word(Ring::written_by(self.role).head_at())
            .load(Ordering::Acquire)
    }

    /// Copies `payload` into this side's ring.
    ///
    /// Returns `false`, leaving the ring untouched, when the payload does not
    /// fit in the space the peer has released so far.
    #[must_use]
    pub fn push(&self, payload: &[u8]) -> bool {
        let _guard = self.push_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let ring = Ring::written_by(self.role);
        let head = self.word(ring.head_at()).load(Ordering::Relaxed);
        let tail = self.word(ring.tail_at()).load(Ordering::Acquire);
        let used = usize::try_from(head.wrapping_sub(tail)).unwrap_or(usize::MAX);
        if payload.len() > self.capacity.saturating_sub(used) {
            return false;
        }
        self.copy_in(ring, head, payload);
        self.word(ring.head_at())
            .store(head.wrapping_add(widen(payload.len())), Ordering::Release);
        true
    }

    /// Copies the next `len` bytes out of the peer's ring and releases them.
    pub fn pull(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        let _guard = self.pull_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let ring = Ring::read_by(self.role);
        let head = self.word(ring.head_at()).load(Ordering::Acquire);
        let tail = self.word(ring.tail_at()).load(Ordering::Relaxed);
        let available = usize::try_from(head.wrapping_sub(tail)).unwrap_or(usize::MAX);
        if len > available || available > self.capacity {
            return Err(TransportError::MalformedFrame {
                message: format!(
                    "mapped frame of {len} bytes but the ring holds {available} bytes"
                ),
            });
        }
        let mut payload = vec![0_u8; len];
        self.copy_out(ring, tail, &mut payload);
        self.word(ring.tail_at())
            .store(tail.wrapping_add(widen(len)), Ordering::Release);
        Ok(payload)
    }

    #[expect(
        clippy::cast_ptr_alignment,
        reason = "header words sit at 8-byte offsets in a page-aligned mapping"
    )]
    fn word(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: callers pass fixed header offsets that are multiples of 8
        // and lie inside the first page, the mapping is page aligned and
        // lives as long as `self`, and both processes only touch these words
        // through atomics.
        unsafe { &*self.map.as_mut_ptr().add(offset).cast::<AtomicU64>() }
    }

    /// Ring offset of `position` and the lengths of the two segments a copy
    /// of `len` bytes splits into.
    fn segments(&self, position: u64, len: usize) -> (usize, usize) {
        let mask = widen(self.capacity.saturating_sub(1));
        let start = usize::try_from(position & mask).unwrap_or(0);
        (start, len.min(self.capacity.saturating_sub(start)))
    }

    fn copy_in(&self, ring: Ring, position: u64, payload: &[u8]) {
        let (start, first) = self.segments(position, payload.len());
        let (head, tail) = payload.split_at(first);
        let base = self.map.as_mut_ptr();
        let data_at = ring.data_at(self.capacity);
        // SAFETY: `start + head.len()` and `tail.len()` never exceed the
        // ring capacity, so both copies stay inside this ring's slice of the
        // mapping. The free-space check in `push` guarantees the peer has
        // released these bytes and will not read them until the head moves.
        unsafe {
            let ring_base = base.add(data_at);
            ptr::copy_nonoverlapping(head.as_ptr(), ring_base.add(start), head.len());
            ptr::copy_nonoverlapping(tail.as_ptr(), ring_base, tail.len());
        }
    }

    fn copy_out(&self, ring: Ring, position: u64, out: &mut [u8]) {
        let (start, first) = self.segments(position, out.len());
        let (head, tail) = out.split_at_mut(first);
        let base = self.map.as_ptr();
        let data_at = ring.data_at(self.capacity);
        // SAFETY: bounds as in `copy_in`; `pull` only copies bytes the peer
        // published before its head store, and the peer will not overwrite
        // them until the tail moves past.
        unsafe {
            let ring_base = base.add(data_at);
            ptr::copy_nonoverlapping(ring_base.add(start), head.as_mut_ptr(), head.len());
            ptr::copy_nonoverlapping(ring_base, tail.as_mut_ptr(), tail.len());
        }
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Removes a region file; returns whether a file was removed.
///
/// Mappings already established stay valid until dropped.
pub fn remove_region_file(path: &Utf8Path) -> Result<bool, TransportError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(TransportError::Cleanup {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }),
    }
}

fn region_len(capacity: usize) -> Option<usize> {
    if capacity < MIN_RING_CAPACITY || !capacity.is_power_of_two() {
        return None;
    }
    capacity
        .checked_mul(2)
        .and_then(|rings| rings.checked_add(DATA_AT))
}

fn widen(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
