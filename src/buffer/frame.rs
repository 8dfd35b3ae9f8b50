//! Native buffers and the ownership-tagged handle used to access them
//!
//! A [`NativeBuffer`] is the pipeline-side storage: a byte region behind a
//! reader/writer lock plus its [`BufferMeta`]. A [`FrameBuffer`] is the
//! handle the application and the bridge hold. It either owns the native
//! buffer (releasing it may free the storage) or borrows it (releasing only
//! drops the view).
//!
//! # Mapping
//!
//! A handle is at any time unmapped, mapped readable or mapped writable.
//! Mapping takes the native lock and holds it until `unmap()`, `release()`
//! or drop. Mapping fails with [`Error::Map`] when the lock is held in a
//! conflicting mode by another handle, or when a borrowed view outlived
//! its owner.

use bytes::BytesMut;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use std::sync::{Arc, Weak};

use super::meta::{BufferMeta, FrameTiming};
use crate::error::{Error, Result};

/// Access mode requested when mapping a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Read-only access
    Read,
    /// Read-write access
    Write,
}

impl std::fmt::Display for MapMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapMode::Read => write!(f, "readable"),
            MapMode::Write => write!(f, "writable"),
        }
    }
}

/// Current mapping of a [`FrameBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// No lock held
    Unmapped,
    /// Shared lock held
    Readable,
    /// Exclusive lock held
    Writable,
}

type Recycle = Box<dyn FnOnce(BytesMut) + Send>;

/// Pipeline-side storage of one frame
pub struct NativeBuffer {
    memory: Arc<RwLock<BytesMut>>,
    meta: Mutex<BufferMeta>,
    recycle: Mutex<Option<Recycle>>,
}

impl NativeBuffer {
    /// Create a zero-filled buffer of `size` bytes
    pub fn zeroed(size: usize) -> Arc<Self> {
        Self::from_bytes_mut(BytesMut::zeroed(size))
    }

    /// Create a buffer holding a copy of `data`
    pub fn from_slice(data: &[u8]) -> Arc<Self> {
        Self::from_bytes_mut(BytesMut::from(data))
    }

    /// Create a buffer taking over `data`
    pub fn from_bytes_mut(data: BytesMut) -> Arc<Self> {
        Arc::new(Self {
            memory: Arc::new(RwLock::new(data)),
            meta: Mutex::new(BufferMeta::default()),
            recycle: Mutex::new(None),
        })
    }

    /// Create a buffer whose storage is handed to `recycle` when it is freed
    pub(crate) fn with_recycler(data: BytesMut, recycle: Recycle) -> Arc<Self> {
        Arc::new(Self {
            memory: Arc::new(RwLock::new(data)),
            meta: Mutex::new(BufferMeta::default()),
            recycle: Mutex::new(Some(recycle)),
        })
    }

    /// Snapshot of the buffer metadata
    pub fn meta(&self) -> BufferMeta {
        *self.meta.lock()
    }

    /// Modify the buffer metadata in place
    pub fn update_meta<R>(&self, f: impl FnOnce(&mut BufferMeta) -> R) -> R {
        f(&mut self.meta.lock())
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        let Some(recycle) = self.recycle.get_mut().take() else {
            return;
        };
        // A view still mapped keeps the lock; hand back empty storage instead.
        let data = self
            .memory
            .try_write()
            .map(|mut memory| std::mem::take(&mut *memory))
            .unwrap_or_default();
        recycle(data);
    }
}

impl std::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("meta", &self.meta())
            .field("pooled", &self.recycle.lock().is_some())
            .finish()
    }
}

enum Handle {
    Owned(Arc<NativeBuffer>),
    Borrowed(Weak<NativeBuffer>),
}

enum Mapping {
    Unmapped,
    Readable(ArcRwLockReadGuard<RawRwLock, BytesMut>),
    Writable(ArcRwLockWriteGuard<RawRwLock, BytesMut>),
}

/// Owned or borrowed handle to a native buffer
///
/// Dropping the handle releases it. A moved-from handle no longer exists in
/// Rust, so there is no inert state to guard against except after an
/// explicit [`FrameBuffer::release`], after which every operation fails
/// and release is a no-op.
pub struct FrameBuffer {
    handle: Option<Handle>,
    mapping: Mapping,
}

impl FrameBuffer {
    /// Wrap a native buffer, taking ownership of this reference
    pub fn owned(native: Arc<NativeBuffer>) -> Self {
        Self {
            handle: Some(Handle::Owned(native)),
            mapping: Mapping::Unmapped,
        }
    }

    /// Borrow a native buffer without keeping it alive
    pub fn borrowed(native: &Arc<NativeBuffer>) -> Self {
        Self {
            handle: Some(Handle::Borrowed(Arc::downgrade(native))),
            mapping: Mapping::Unmapped,
        }
    }

    /// Owned buffer holding a copy of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        Self::owned(NativeBuffer::from_slice(data))
    }

    /// Owned zero-filled buffer
    pub fn zeroed(size: usize) -> Self {
        Self::owned(NativeBuffer::zeroed(size))
    }

    /// Whether releasing this handle drops a reference to the storage
    pub fn owns(&self) -> bool {
        matches!(self.handle, Some(Handle::Owned(_)))
    }

    /// Whether `release()` already ran
    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    /// Current mapping state
    pub fn map_state(&self) -> MapState {
        match self.mapping {
            Mapping::Unmapped => MapState::Unmapped,
            Mapping::Readable(_) => MapState::Readable,
            Mapping::Writable(_) => MapState::Writable,
        }
    }

    /// The native buffer behind this handle
    pub fn native(&self) -> Result<Arc<NativeBuffer>> {
        match &self.handle {
            Some(Handle::Owned(native)) => Ok(Arc::clone(native)),
            Some(Handle::Borrowed(weak)) => weak.upgrade().ok_or(Error::BufferReleased),
            None => Err(Error::BufferReleased),
        }
    }

    /// Map for reading and return the bytes
    ///
    /// A writable mapping is also readable and is kept as is.
    pub fn map_read(&mut self) -> Result<&[u8]> {
        if matches!(self.mapping, Mapping::Unmapped) {
            let memory = self.memory(MapMode::Read)?;
            let guard = memory.try_read_arc().ok_or(Error::Map {
                mode: MapMode::Read,
                reason: "buffer is mapped writable by another handle",
            })?;
            self.mapping = Mapping::Readable(guard);
        }
        match &self.mapping {
            Mapping::Readable(guard) => Ok(&guard[..]),
            Mapping::Writable(guard) => Ok(&guard[..]),
            Mapping::Unmapped => Err(Error::BufferReleased),
        }
    }

    /// Map for writing and return the bytes
    ///
    /// A readable mapping is dropped first and replaced by a writable one.
    pub fn map_write(&mut self) -> Result<&mut [u8]> {
        if !matches!(self.mapping, Mapping::Writable(_)) {
            self.unmap();
            let memory = self.memory(MapMode::Write)?;
            let guard = memory.try_write_arc().ok_or(Error::Map {
                mode: MapMode::Write,
                reason: "buffer is mapped by another handle",
            })?;
            self.mapping = Mapping::Writable(guard);
        }
        match &mut self.mapping {
            Mapping::Writable(guard) => Ok(&mut guard[..]),
            _ => Err(Error::BufferReleased),
        }
    }

    /// Drop the current mapping, if any
    pub fn unmap(&mut self) {
        self.mapping = Mapping::Unmapped;
    }

    /// Payload size in bytes, mapping readable if unmapped
    pub fn size(&mut self) -> Result<usize> {
        Ok(self.map_read()?.len())
    }

    /// Unmap and drop this handle's reference
    ///
    /// Only an owning handle can free the storage; a borrowed view just
    /// forgets it. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        self.unmap();
        self.handle = None;
    }

    /// Snapshot of the metadata
    pub fn meta(&self) -> Result<BufferMeta> {
        Ok(self.native()?.meta())
    }

    /// Timing fields
    pub fn timing(&self) -> Result<FrameTiming> {
        Ok(self.meta()?.timing)
    }

    /// Overwrite the timing fields
    pub fn set_timing(&self, timing: FrameTiming) -> Result<()> {
        self.native()?.update_meta(|meta| meta.timing = timing);
        Ok(())
    }

    /// Correspondence id attached through the metadata side-channel
    pub fn correspondence_id(&self) -> Result<Option<u64>> {
        Ok(self.meta()?.correspondence_id)
    }

    /// Attach a correspondence id
    pub fn set_correspondence_id(&self, id: u64) -> Result<()> {
        self.native()?.update_meta(|meta| meta.correspondence_id = Some(id));
        Ok(())
    }

    /// Copy payload and metadata into a new, owned, unpooled buffer
    ///
    /// The mapping state of this handle is left as it was.
    pub fn deep_copy(&mut self) -> Result<FrameBuffer> {
        let was_mapped = !matches!(self.mapping, Mapping::Unmapped);
        let meta = self.meta()?;
        let copy = NativeBuffer::from_slice(self.map_read()?);
        if !was_mapped {
            self.unmap();
        }
        copy.update_meta(|m| *m = meta);
        Ok(FrameBuffer::owned(copy))
    }

    fn memory(&self, mode: MapMode) -> Result<Arc<RwLock<BytesMut>>> {
        let native = self.native().map_err(|_| Error::Map {
            mode,
            reason: "buffer was released or its owner was freed",
        })?;
        Ok(Arc::clone(&native.memory))
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("owns", &self.owns())
            .field("released", &self.is_released())
            .field("map_state", &self.map_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_release_rewrap_read() {
        let native = NativeBuffer::zeroed(4);

        let mut writer = FrameBuffer::borrowed(&native);
        writer.map_write().unwrap().copy_from_slice(&[1, 2, 3, 4]);
        writer.release();

        let mut reader = FrameBuffer::owned(native);
        assert_eq!(reader.map_read().unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_size_maps_readable() {
        let mut buffer = FrameBuffer::from_slice(&[0u8; 16]);
        assert_eq!(buffer.map_state(), MapState::Unmapped);
        assert_eq!(buffer.size().unwrap(), 16);
        assert_eq!(buffer.map_state(), MapState::Readable);
    }

    #[test]
    fn test_readable_to_writable_remaps() {
        let mut buffer = FrameBuffer::from_slice(&[7u8; 2]);
        buffer.map_read().unwrap();
        buffer.map_write().unwrap()[0] = 9;
        assert_eq!(buffer.map_state(), MapState::Writable);

        // Writable mapping also serves reads
        assert_eq!(buffer.map_read().unwrap(), &[9, 7]);
        assert_eq!(buffer.map_state(), MapState::Writable);
    }

    #[test]
    fn test_conflicting_mapping_fails() {
        let native = NativeBuffer::zeroed(8);
        let mut a = FrameBuffer::borrowed(&native);
        let mut b = FrameBuffer::borrowed(&native);

        a.map_write().unwrap();
        let err = b.map_read().unwrap_err();
        assert!(matches!(err, Error::Map { mode: MapMode::Read, .. }));

        a.unmap();
        assert!(b.map_read().is_ok());
        assert!(matches!(
            a.map_write().unwrap_err(),
            Error::Map { mode: MapMode::Write, .. }
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut buffer = FrameBuffer::zeroed(4);
        buffer.map_write().unwrap();
        buffer.release();
        buffer.release();

        assert!(buffer.is_released());
        assert_eq!(buffer.map_state(), MapState::Unmapped);
        assert!(matches!(buffer.map_read(), Err(Error::Map { .. })));
    }

    #[test]
    fn test_borrowed_view_does_not_keep_owner_alive() {
        let mut owner = FrameBuffer::zeroed(4);
        let mut view = FrameBuffer::borrowed(&owner.native().unwrap());
        assert!(!view.owns());
        assert!(view.map_read().is_ok());
        view.unmap();

        owner.release();
        assert!(matches!(view.map_read(), Err(Error::Map { .. })));
    }

    #[test]
    fn test_deep_copy_carries_metadata() {
        let mut original = FrameBuffer::from_slice(b"frame");
        original.set_correspondence_id(42).unwrap();
        original
            .set_timing(FrameTiming {
                offset: 42,
                ..Default::default()
            })
            .unwrap();

        let mut copy = original.deep_copy().unwrap();
        assert_eq!(original.map_state(), MapState::Unmapped);
        original.release();

        assert_eq!(copy.map_read().unwrap(), b"frame");
        assert_eq!(copy.correspondence_id().unwrap(), Some(42));
        assert_eq!(copy.timing().unwrap().offset, 42);
    }

    #[test]
    fn test_recycler_runs_when_owner_freed() {
        let returned = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&returned);
        let native = NativeBuffer::with_recycler(
            BytesMut::zeroed(3),
            Box::new(move |data| *sink.lock() = Some(data.len())),
        );

        let mut owner = FrameBuffer::owned(native);
        assert!(returned.lock().is_none());
        owner.release();
        assert_eq!(*returned.lock(), Some(3));
    }
}
