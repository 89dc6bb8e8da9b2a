//! Device buffers and host mappings.
//!
//! A [`MemoryBuffer`] is a fixed-size device allocation. The host reaches its
//! contents only through a mapping:
//!
//! - [`MemoryBuffer::map_for_write`] / [`MemoryBuffer::map_for_read`] block
//!   until the region is available and return a [`MappedView`];
//! - [`MemoryBuffer::enqueue_map`] returns a [`PendingMap`], whose view is
//!   handed out by [`PendingMap::finish`] only after the queue has drained.
//!
//! Mapping borrows the buffer mutably, so a second map while a view is alive
//! does not compile. A leaked view is still caught at runtime
//! ([`Error::AlreadyMapped`]), and a kernel holding a mapped buffer refuses
//! to launch.

use crate::context::Context;
use crate::diagnostics;
use crate::driver::{HostRegion, MapAccess, MemAccess, MemId};
use crate::error::{Error, Result};
use crate::queue::CommandQueue;
use bytemuck::Pod;
use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub(crate) struct BufferInner {
    id: MemId,
    size: usize,
    access: MemAccess,
    host_initialised: bool,
    pub(crate) mapped: AtomicBool,
    context: Context,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Err(status) = self.context.driver().release_mem_object(self.id) {
            warn!(mem = %self.id, %status, "failed to release buffer");
        }
    }
}

/// A device buffer.
pub struct MemoryBuffer {
    pub(crate) inner: Arc<BufferInner>,
}

impl MemoryBuffer {
    /// Allocates `size` uninitialised bytes.
    ///
    /// # Errors
    ///
    /// [`Error::BufferCreateFailed`].
    pub fn new(context: &Context, access: MemAccess, size: usize) -> Result<Self> {
        Self::create(context, access, size, None)
    }

    /// Allocates a buffer initialised with a copy of `data`.
    ///
    /// # Errors
    ///
    /// [`Error::BufferCreateFailed`].
    pub fn from_slice<T: Pod>(context: &Context, access: MemAccess, data: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Self::create(context, access, bytes.len(), Some(bytes))
    }

    fn create(context: &Context, access: MemAccess, size: usize, host: Option<&[u8]>) -> Result<Self> {
        let id = diagnostics::check(
            context.driver().create_buffer(context.id(), access, size, host),
            "failed to create buffer",
        )
        .map_err(|status| Error::BufferCreateFailed { size, status })?;
        debug!(mem = %id, size, ?access, host_initialised = host.is_some(), "buffer created");
        Ok(Self {
            inner: Arc::new(BufferInner {
                id,
                size,
                access,
                host_initialised: host.is_some(),
                mapped: AtomicBool::new(false),
                context: context.clone(),
            }),
        })
    }

    /// Driver handle.
    #[must_use]
    pub fn id(&self) -> MemId {
        self.inner.id
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Kernel-side access mode.
    #[must_use]
    pub fn access(&self) -> MemAccess {
        self.inner.access
    }

    /// Whether a host mapping is outstanding.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.inner.mapped.load(Ordering::Acquire)
    }

    /// Blocking map of the whole buffer for host writes.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnlyMapWrite`] for a host-initialised `READ_ONLY`
    /// buffer, [`Error::AlreadyMapped`], or [`Error::MapFailed`].
    pub fn map_for_write<'a>(&'a mut self, queue: &'a CommandQueue) -> Result<MappedView<'a>> {
        self.map(queue, MapAccess::Write)
    }

    /// Blocking map of the whole buffer for host reads.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyMapped`] or [`Error::MapFailed`].
    pub fn map_for_read<'a>(&'a mut self, queue: &'a CommandQueue) -> Result<MappedView<'a>> {
        self.map(queue, MapAccess::Read)
    }

    /// Blocking map of the whole buffer.
    ///
    /// # Errors
    ///
    /// See [`map_for_write`](MemoryBuffer::map_for_write).
    pub fn map<'a>(&'a mut self, queue: &'a CommandQueue, access: MapAccess) -> Result<MappedView<'a>> {
        self.map_region(queue, access, true)
    }

    /// Non-blocking map. The contents are reachable only through
    /// [`PendingMap::finish`].
    ///
    /// # Errors
    ///
    /// See [`map_for_write`](MemoryBuffer::map_for_write).
    pub fn enqueue_map<'a>(&'a mut self, queue: &'a CommandQueue, access: MapAccess) -> Result<PendingMap<'a>> {
        self.map_region(queue, access, false).map(|view| PendingMap { view })
    }

    fn map_region<'a>(&'a self, queue: &'a CommandQueue, access: MapAccess, blocking: bool) -> Result<MappedView<'a>> {
        let inner = &*self.inner;
        if access.writes_back() && inner.access == MemAccess::ReadOnly && inner.host_initialised {
            return Err(Error::ReadOnlyMapWrite);
        }
        if inner.mapped.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyMapped);
        }
        let mapped = diagnostics::check(
            inner
                .context
                .driver()
                .enqueue_map_buffer(queue.id(), inner.id, blocking, access, 0, inner.size),
            "failed to map buffer",
        );
        match mapped {
            Ok(region) => Ok(MappedView {
                buffer: inner,
                queue,
                region: Some(region),
            }),
            Err(status) => {
                inner.mapped.store(false, Ordering::Release);
                Err(Error::MapFailed(status))
            }
        }
    }

    /// Fills `len` bytes at `offset` with a repeating `pattern`.
    ///
    /// # Errors
    ///
    /// [`Error::FillFailed`]; the driver checks the pattern size and that
    /// `offset`/`len` are whole patterns inside the buffer.
    pub fn fill(&self, queue: &CommandQueue, pattern: &[u8], offset: usize, len: usize) -> Result<()> {
        diagnostics::check(
            self.inner
                .context
                .driver()
                .enqueue_fill_buffer(queue.id(), self.inner.id, pattern, offset, len),
            "failed to fill buffer",
        )
        .map_err(Error::FillFailed)
    }

    /// Fills the whole buffer with a repeating `pattern`.
    ///
    /// # Errors
    ///
    /// See [`fill`](MemoryBuffer::fill).
    pub fn fill_all(&self, queue: &CommandQueue, pattern: &[u8]) -> Result<()> {
        self.fill(queue, pattern, 0, self.inner.size)
    }

    /// Maps for reading, copies the contents out as `T`s and unmaps.
    ///
    /// # Errors
    ///
    /// Any map, cast or unmap error.
    pub fn read_to_vec<T: Pod>(&mut self, queue: &CommandQueue) -> Result<Vec<T>> {
        let view = self.map_for_read(queue)?;
        let out = view.to_vec()?;
        view.unmap()?;
        Ok(out)
    }

    /// Maps for writing, copies `data` in and unmaps.
    ///
    /// # Errors
    ///
    /// Any map, cast or unmap error.
    pub fn write_from_slice<T: Pod>(&mut self, queue: &CommandQueue, data: &[T]) -> Result<()> {
        let mut view = self.map_for_write(queue)?;
        view.copy_from_slice(data)?;
        view.unmap()
    }
}

impl fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("access", &self.inner.access)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Host view of a mapped buffer.
///
/// Unmap explicitly with [`unmap`](MappedView::unmap) to observe failures;
/// dropping the view unmaps too and only logs them.
pub struct MappedView<'a> {
    buffer: &'a BufferInner,
    queue: &'a CommandQueue,
    region: Option<HostRegion>,
}

impl MappedView<'_> {
    /// The mapped bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.region.as_ref().map_or(&[][..], |r| r.bytes.as_slice())
    }

    /// The mapped bytes, writable. Changes reach the device on unmap when
    /// the map access writes back.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self.region.as_mut() {
            Some(region) => region.bytes.as_mut_slice(),
            None => &mut [],
        }
    }

    /// Host access the view was mapped with.
    #[must_use]
    pub fn access(&self) -> Option<MapAccess> {
        self.region.as_ref().map(|r| r.access)
    }

    /// Copies the contents out as `T`s.
    ///
    /// # Errors
    ///
    /// [`Error::ViewCast`] if the length is not a multiple of `size_of::<T>()`.
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let bytes = self.bytes();
        let elem = size_of::<T>();
        if elem == 0 || bytes.len() % elem != 0 {
            return Err(Error::ViewCast {
                len: bytes.len(),
                elem,
            });
        }
        Ok(bytes.chunks_exact(elem).map(bytemuck::pod_read_unaligned).collect())
    }

    /// Overwrites the start of the view with `data`.
    ///
    /// # Errors
    ///
    /// [`Error::ViewCast`] if `data` is larger than the view.
    pub fn copy_from_slice<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let src: &[u8] = bytemuck::cast_slice(data);
        let dst = self.bytes_mut();
        let len = dst.len();
        dst.get_mut(..src.len())
            .ok_or(Error::ViewCast {
                len,
                elem: size_of::<T>(),
            })?
            .copy_from_slice(src);
        Ok(())
    }

    /// Element `index` read as `T`, or `None` past the end.
    #[must_use]
    pub fn get<T: Pod>(&self, index: usize) -> Option<T> {
        let size = size_of::<T>();
        let start = index.checked_mul(size)?;
        let end = start.checked_add(size)?;
        self.bytes().get(start..end).map(bytemuck::pod_read_unaligned)
    }

    /// Writes element `index` as `T`. Returns `false` past the end.
    pub fn set<T: Pod>(&mut self, index: usize, value: T) -> bool {
        let size = size_of::<T>();
        let Some(end) = index.checked_mul(size).and_then(|start| start.checked_add(size)) else {
            return false;
        };
        match self.bytes_mut().get_mut(end - size..end) {
            Some(dst) => {
                dst.copy_from_slice(bytemuck::bytes_of(&value));
                true
            }
            None => false,
        }
    }

    /// Ends the mapping.
    ///
    /// # Errors
    ///
    /// [`Error::UnmapFailed`].
    pub fn unmap(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(region) = self.region.take() else {
            return Ok(());
        };
        let result = diagnostics::check(
            self.buffer
                .context
                .driver()
                .enqueue_unmap_mem_object(self.queue.id(), self.buffer.id, region),
            "failed to unmap buffer",
        );
        self.buffer.mapped.store(false, Ordering::Release);
        result.map_err(Error::UnmapFailed)
    }
}

impl Drop for MappedView<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(mem = %self.buffer.id, %err, "unmap on drop failed");
        }
    }
}

impl fmt::Debug for MappedView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedView")
            .field("mem", &self.buffer.id)
            .field("len", &self.bytes().len())
            .field("access", &self.access())
            .finish()
    }
}

/// A non-blocking map whose contents are not yet guaranteed.
///
/// Dropping it without [`finish`](PendingMap::finish) unmaps.
#[derive(Debug)]
#[must_use = "the mapping is only usable after `finish`"]
pub struct PendingMap<'a> {
    view: MappedView<'a>,
}

impl<'a> PendingMap<'a> {
    /// Drains the queue and hands out the view.
    ///
    /// # Errors
    ///
    /// [`Error::SyncFailed`] if the queue cannot be finished; the mapping is
    /// released in that case.
    pub fn finish(self) -> Result<MappedView<'a>> {
        self.view.queue.finish()?;
        Ok(self.view)
    }
}
