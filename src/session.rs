//! One-shot compute sessions.
//!
//! A [`Session`] owns the context and queue of a single run: it selects a
//! platform, provisions a queue, builds programs, and on drop drains the
//! queue before releasing it. Buffers, kernels and programs created through
//! it keep the context alive on their own, so they may be dropped in any
//! order; the driver still sees reverse-acquisition release.
//!
//! ```
//! use briny_cl::{samples, HarnessConfig, KernelArg, MemAccess, MemoryBuffer, NdRange, Session};
//!
//! let session = Session::open(samples::reference_driver(), &HarnessConfig::default()).unwrap();
//! let program = session.build(samples::VECTOR_ADD_CL).unwrap();
//!
//! let a: Vec<f32> = (0..16).map(|i| i as f32).collect();
//! let ctx = session.context();
//! let buf_a = MemoryBuffer::from_slice(ctx, MemAccess::ReadOnly, &a).unwrap();
//! let buf_b = MemoryBuffer::from_slice(ctx, MemAccess::ReadOnly, &a).unwrap();
//! let mut out = MemoryBuffer::new(ctx, MemAccess::WriteOnly, 16 * 4).unwrap();
//!
//! let mut kernel = program.create_kernel("vector_add").unwrap();
//! kernel.set_args(&[KernelArg::Buffer(&buf_a), KernelArg::Buffer(&buf_b), KernelArg::Buffer(&out)]).unwrap();
//! kernel.enqueue(session.queue(), &NdRange::linear(16)).unwrap();
//!
//! let sums: Vec<f32> = out.read_to_vec(session.queue()).unwrap();
//! assert_eq!(sums[15], 30.0);
//! ```

use crate::config::HarnessConfig;
use crate::context::Context;
use crate::driver::{Driver, MemAccess};
use crate::buffer::MemoryBuffer;
use crate::error::{Result, ResultExt};
use crate::platform::PlatformSelector;
use crate::program::{Program, ProgramBuilder};
use crate::queue::CommandQueue;
use crate::source::SourceLoader;
use bytemuck::Pod;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Context, queue and build settings of one run.
#[derive(Debug)]
pub struct Session {
    queue: CommandQueue,
    context: Context,
    loader: SourceLoader,
    config: HarnessConfig,
}

impl Session {
    /// Selects a platform and provisions a queue.
    ///
    /// # Errors
    ///
    /// Configuration, discovery and resource-creation errors.
    pub fn open(driver: Arc<dyn Driver>, config: &HarnessConfig) -> Result<Self> {
        config.validate()?;
        let context = PlatformSelector::new(driver)
            .strategy(config.strategy)
            .policy(config.error_policy.clone())
            .select(config.device_class)?;
        let queue = CommandQueue::with_properties(&context, config.queue_properties)?;
        info!(
            platform = context.platform_name(),
            device = %queue.device_info().name,
            class = %queue.device_info().class,
            "session open"
        );
        Ok(Self {
            queue,
            context,
            loader: SourceLoader::new(&config.kernel_dir),
            config: config.clone(),
        })
    }

    /// Like [`open`](Session::open), but reports the failure and exits the
    /// process instead of returning it.
    #[must_use]
    pub fn open_or_exit(driver: Arc<dyn Driver>, config: &HarnessConfig) -> Self {
        Self::open(driver, config).or_exit("failed to open a compute session")
    }

    /// Builds `source` for the session's device with the configured options.
    ///
    /// # Errors
    ///
    /// [`Error::ProgramCreateFailed`](crate::Error::ProgramCreateFailed) or
    /// [`Error::BuildFailed`](crate::Error::BuildFailed).
    pub fn build(&self, source: &str) -> Result<Program> {
        ProgramBuilder::for_queue(&self.queue)
            .options(self.config.build_options.as_str())
            .build(source)
    }

    /// Loads `name` from the kernel directory and builds it.
    ///
    /// # Errors
    ///
    /// Source errors, then as [`build`](Session::build).
    pub fn build_named(&self, name: impl AsRef<Path>) -> Result<Program> {
        let source = self.loader.load_source(name)?;
        self.build(&source)
    }

    /// Builds a previously exported program binary.
    ///
    /// # Errors
    ///
    /// As [`ProgramBuilder::build_binary`].
    pub fn build_binary(&self, binary: &[u8]) -> Result<Program> {
        ProgramBuilder::for_queue(&self.queue)
            .options(self.config.build_options.as_str())
            .build_binary(binary)
    }

    /// Allocates an uninitialised buffer.
    ///
    /// # Errors
    ///
    /// [`Error::BufferCreateFailed`](crate::Error::BufferCreateFailed).
    pub fn buffer(&self, access: MemAccess, size: usize) -> Result<MemoryBuffer> {
        MemoryBuffer::new(&self.context, access, size)
    }

    /// Allocates a buffer initialised from `data`.
    ///
    /// # Errors
    ///
    /// [`Error::BufferCreateFailed`](crate::Error::BufferCreateFailed).
    pub fn buffer_from<T: Pod>(&self, access: MemAccess, data: &[T]) -> Result<MemoryBuffer> {
        MemoryBuffer::from_slice(&self.context, access, data)
    }

    /// Waits for every enqueued command.
    ///
    /// # Errors
    ///
    /// [`Error::SyncFailed`](crate::Error::SyncFailed).
    pub fn finish(&self) -> Result<()> {
        self.queue.finish()
    }

    /// The run's context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The run's queue.
    #[must_use]
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// The configuration the session was opened with.
    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Where [`build_named`](Session::build_named) looks for sources.
    #[must_use]
    pub fn loader(&self) -> &SourceLoader {
        &self.loader
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.queue.finish() {
            warn!(%err, "failed to drain queue before release");
        }
    }
}
