//! Runtime program builds.
//!
//! [`ProgramBuilder`] turns kernel source (or a previously exported binary)
//! into a [`Program`] built for one device. On failure the build log is read
//! in full and returned verbatim in [`Error::BuildFailed`]; the failed
//! program is released before the error reaches the caller.
//!
//! ```
//! use briny_cl::{samples, CommandQueue, PlatformSelector, ProgramBuilder};
//! use briny_cl::driver::DeviceClass;
//!
//! let driver = samples::reference_driver();
//! let context = PlatformSelector::new(driver).select(DeviceClass::Gpu).unwrap();
//! let queue = CommandQueue::provision(&context).unwrap();
//!
//! let err = ProgramBuilder::new(&context, queue.device())
//!     .build("__kernel void broken(__global flaot *x) {}")
//!     .unwrap_err();
//! assert!(err.build_log().unwrap().contains("unknown type name 'flaot'"));
//! ```

use crate::context::Context;
use crate::diagnostics;
use crate::driver::{DeviceId, Driver, ProgramId};
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::queue::CommandQueue;
use core::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Reads a program's build log for `device`.
///
/// Two phases: query the size, then fill a buffer one byte larger. The text
/// is cut at the first NUL and decoded lossily, so a driver that writes less
/// than it announced (or forgets the terminator) still yields a usable log.
pub fn read_build_log(driver: &dyn Driver, program: ProgramId, device: DeviceId) -> String {
    let size = match driver.program_build_log(program, device, None) {
        Ok(size) => size,
        Err(status) => {
            warn!(%status, "build log size query failed");
            return String::new();
        }
    };
    let mut buf = vec![0u8; size + 1];
    if let Err(status) = driver.program_build_log(program, device, Some(&mut buf)) {
        warn!(%status, "build log read failed");
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub(crate) struct ProgramInner {
    pub(crate) id: ProgramId,
    pub(crate) device: DeviceId,
    log: String,
    pub(crate) context: Context,
}

impl Drop for ProgramInner {
    fn drop(&mut self) {
        if let Err(status) = self.context.driver().release_program(self.id) {
            warn!(program = %self.id, %status, "failed to release program");
        }
    }
}

/// A program built for one device.
#[derive(Clone)]
pub struct Program {
    pub(crate) inner: Arc<ProgramInner>,
}

impl Program {
    /// Extracts the kernel `name`.
    ///
    /// # Errors
    ///
    /// [`Error::KernelCreateFailed`].
    pub fn create_kernel(&self, name: &str) -> Result<Kernel> {
        Kernel::new(self, name)
    }

    /// The build log. Empty, or warnings only, for a successful build.
    #[must_use]
    pub fn build_log(&self) -> &str {
        &self.inner.log
    }

    /// Exports the built executable.
    ///
    /// # Errors
    ///
    /// [`Error::BinaryUnavailable`].
    pub fn binary(&self) -> Result<Vec<u8>> {
        diagnostics::check(
            self.inner.context.driver().program_binary(self.inner.id, self.inner.device),
            "failed to read program binary",
        )
        .map_err(Error::BinaryUnavailable)
    }

    /// Driver handle.
    #[must_use]
    pub fn id(&self) -> ProgramId {
        self.inner.id
    }

    /// The device the program was built for.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    /// The owning context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.inner.context
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .field("log_len", &self.inner.log.len())
            .finish()
    }
}

/// Builds programs for one device of a context.
#[derive(Debug, Clone)]
pub struct ProgramBuilder<'a> {
    context: &'a Context,
    device: DeviceId,
    options: String,
}

impl<'a> ProgramBuilder<'a> {
    /// A builder targeting `device` with no compiler options.
    #[must_use]
    pub fn new(context: &'a Context, device: DeviceId) -> Self {
        Self {
            context,
            device,
            options: String::new(),
        }
    }

    /// A builder targeting the queue's device.
    #[must_use]
    pub fn for_queue(queue: &'a CommandQueue) -> Self {
        Self::new(queue.context(), queue.device())
    }

    /// Compiler options, passed to the driver verbatim.
    #[must_use]
    pub fn options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    /// Builds a program from source.
    ///
    /// # Errors
    ///
    /// [`Error::ProgramCreateFailed`] if the driver rejects the source
    /// container, [`Error::BuildFailed`] with the full log if compilation
    /// fails.
    pub fn build(&self, source: &str) -> Result<Program> {
        let id = diagnostics::check(
            self.context.driver().create_program_with_source(self.context.id(), source),
            "failed to create program from source",
        )
        .map_err(Error::ProgramCreateFailed)?;
        self.finish_build(id)
    }

    /// Builds a program from a binary exported with [`Program::binary`].
    ///
    /// # Errors
    ///
    /// As [`build`](ProgramBuilder::build); a corrupt binary is
    /// [`Error::ProgramCreateFailed`] carrying `CL_INVALID_BINARY`.
    pub fn build_binary(&self, binary: &[u8]) -> Result<Program> {
        let id = diagnostics::check(
            self.context
                .driver()
                .create_program_with_binary(self.context.id(), self.device, binary),
            "failed to create program from binary",
        )
        .map_err(Error::ProgramCreateFailed)?;
        self.finish_build(id)
    }

    fn finish_build(&self, id: ProgramId) -> Result<Program> {
        let driver = self.context.driver();
        let mut inner = ProgramInner {
            id,
            device: self.device,
            log: String::new(),
            context: self.context.clone(),
        };
        let built = driver.build_program(id, self.device, &self.options);
        inner.log = read_build_log(driver.as_ref(), id, self.device);

        match built {
            Ok(()) => {
                if !inner.log.trim().is_empty() {
                    warn!(program = %id, "build succeeded with diagnostics:\n{}", inner.log);
                }
                debug!(program = %id, options = %self.options, "program built");
                Ok(Program {
                    inner: Arc::new(inner),
                })
            }
            Err(status) => {
                error!(program = %id, %status, "program build failed:\n{}", inner.log);
                let log = core::mem::take(&mut inner.log);
                drop(inner);
                Err(Error::BuildFailed { status, log })
            }
        }
    }
}
