//! Kernel argument binding and N-D range dispatch.

use crate::buffer::{BufferInner, MemoryBuffer};
use crate::diagnostics;
use crate::driver::{ArgValue, KernelId};
use crate::error::{Error, Result};
use crate::program::Program;
use crate::queue::CommandQueue;
use bytemuck::Pod;
use core::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// A value for one kernel argument slot.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    /// A memory buffer. The kernel keeps it alive while bound.
    Buffer(&'a MemoryBuffer),
    /// Raw bytes of a scalar, vector or plain struct.
    Bytes(&'a [u8]),
}

impl<'a> KernelArg<'a> {
    /// The bytes of a plain-old-data value.
    ///
    /// ```
    /// use briny_cl::KernelArg;
    ///
    /// let dim = 8u32;
    /// assert!(matches!(KernelArg::scalar(&dim), KernelArg::Bytes(b) if b.len() == 4));
    /// ```
    pub fn scalar<T: Pod>(value: &'a T) -> Self {
        Self::Bytes(bytemuck::bytes_of(value))
    }
}

impl<'a> From<&'a MemoryBuffer> for KernelArg<'a> {
    fn from(buffer: &'a MemoryBuffer) -> Self {
        Self::Buffer(buffer)
    }
}

/// Global and optional local sizes of a dispatch.
///
/// Geometry is checked by the driver when the range is enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdRange {
    global: Vec<usize>,
    local: Option<Vec<usize>>,
}

impl NdRange {
    /// A range over `global` work-items per dimension; the driver picks the
    /// work-group size.
    pub fn new(global: impl Into<Vec<usize>>) -> Self {
        Self {
            global: global.into(),
            local: None,
        }
    }

    /// A one-dimensional range.
    #[must_use]
    pub fn linear(size: usize) -> Self {
        Self::new([size])
    }

    /// Sets an explicit work-group size.
    #[must_use]
    pub fn local(mut self, local: impl Into<Vec<usize>>) -> Self {
        self.local = Some(local.into());
        self
    }

    /// Number of dimensions.
    #[must_use]
    pub fn work_dim(&self) -> usize {
        self.global.len()
    }

    /// Global sizes.
    #[must_use]
    pub fn global(&self) -> &[usize] {
        &self.global
    }

    /// Local sizes, if set.
    #[must_use]
    pub fn local_sizes(&self) -> Option<&[usize]> {
        self.local.as_deref()
    }

    /// Total number of work-items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.global.iter().product()
    }

    /// Whether the range holds no work-items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A kernel entry point with its argument table.
pub struct Kernel {
    id: KernelId,
    name: String,
    bound: Vec<Option<Arc<BufferInner>>>,
    program: Program,
}

impl Kernel {
    pub(crate) fn new(program: &Program, name: &str) -> Result<Self> {
        let driver = program.context().driver();
        let status_err = |status| Error::KernelCreateFailed {
            name: name.to_owned(),
            status,
        };
        let id = diagnostics::check(driver.create_kernel(program.id(), name), "failed to create kernel")
            .map_err(status_err)?;
        let mut kernel = Self {
            id,
            name: name.to_owned(),
            bound: Vec::new(),
            program: program.clone(),
        };
        let args = diagnostics::check(driver.kernel_num_args(id), "failed to query kernel arguments")
            .map_err(status_err)?;
        kernel.bound = vec![None; args];
        debug!(kernel = name, args, "kernel created");
        Ok(kernel)
    }

    /// Entry point name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driver handle.
    #[must_use]
    pub fn id(&self) -> KernelId {
        self.id
    }

    /// Number of argument slots.
    #[must_use]
    pub fn num_args(&self) -> usize {
        self.bound.len()
    }

    /// Binds `arg` to slot `index`.
    ///
    /// # Errors
    ///
    /// [`Error::ArgumentBinding`] carrying `CL_INVALID_ARG_INDEX`,
    /// `CL_INVALID_ARG_SIZE` or whatever else the driver reports.
    pub fn set_arg<'a>(&mut self, index: usize, arg: impl Into<KernelArg<'a>>) -> Result<()> {
        let arg = arg.into();
        let value = match arg {
            KernelArg::Buffer(buffer) => ArgValue::Mem(buffer.id()),
            KernelArg::Bytes(bytes) => ArgValue::Bytes(bytes),
        };
        diagnostics::check(
            self.program.context().driver().set_kernel_arg(self.id, index, value),
            "failed to set kernel argument",
        )
        .map_err(|status| Error::ArgumentBinding {
            kernel: self.name.clone(),
            index,
            status,
        })?;

        if let Some(slot) = self.bound.get_mut(index) {
            *slot = match arg {
                KernelArg::Buffer(buffer) => Some(Arc::clone(&buffer.inner)),
                KernelArg::Bytes(_) => None,
            };
        }
        Ok(())
    }

    /// Binds `args` to slots `0..args.len()` in order.
    ///
    /// # Errors
    ///
    /// The first failing [`set_arg`](Kernel::set_arg).
    pub fn set_args(&mut self, args: &[KernelArg<'_>]) -> Result<()> {
        for (index, &arg) in args.iter().enumerate() {
            self.set_arg(index, arg)?;
        }
        Ok(())
    }

    /// Enqueues the kernel over `range`. Returns once the launch is queued;
    /// observe completion with a blocking map or [`CommandQueue::finish`].
    ///
    /// # Errors
    ///
    /// [`Error::BufferMapped`] if a bound buffer is mapped by the host, and
    /// [`Error::DispatchFailed`] for anything the driver rejects.
    pub fn enqueue(&self, queue: &CommandQueue, range: &NdRange) -> Result<()> {
        if let Some(index) = self
            .bound
            .iter()
            .position(|b| b.as_ref().is_some_and(|b| b.mapped.load(Ordering::Acquire)))
        {
            return Err(Error::BufferMapped {
                kernel: self.name.clone(),
                index,
            });
        }
        diagnostics::check(
            self.program.context().driver().enqueue_nd_range_kernel(
                queue.id(),
                self.id,
                range.global(),
                range.local_sizes(),
            ),
            "failed to enqueue kernel",
        )
        .map_err(|status| Error::DispatchFailed {
            kernel: self.name.clone(),
            status,
        })?;
        debug!(kernel = %self.name, global = ?range.global(), local = ?range.local_sizes(), "kernel enqueued");
        Ok(())
    }

    /// The program this kernel came from.
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Err(status) = self.program.context().driver().release_kernel(self.id) {
            warn!(kernel = %self.name, %status, "failed to release kernel");
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("args", &self.bound.len())
            .finish()
    }
}
