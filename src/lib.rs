//! briny_cl: a host-side harness for heterogeneous compute devices.
//!
//! Discovers platforms and devices, creates an execution context with a
//! bounded fallback between device classes, compiles kernels at runtime,
//! manages mapped host/device buffers, binds kernel arguments and dispatches
//! N-D ranges, releasing everything in reverse acquisition order.
//!
//! # Features
//!
//! - Two platform selection strategies behind one interface.
//! - Per-context error hook with a fatal or reporting [`ErrorPolicy`].
//! - Build failures carry the driver's build log verbatim.
//! - RAII handles: queues, programs, kernels and buffers keep their parents
//!   alive, so release order is always correct.
//! - Host mappings are borrow-checked; non-blocking maps only hand out their
//!   contents after the queue has drained.
//!
//! # Drivers
//!
//! All device access goes through the [`Driver`] trait.
//!
//! - `driver::opencl::OpenClDriver`: installed OpenCL runtimes through
//!   `opencl3`, kernels in OpenCL C. Enabled with the `opencl` feature.
//! - `driver::wgpu::WgpuDriver`: real GPUs through `wgpu`, kernels in WGSL.
//!   Enabled with the `wgpu` feature.
//! - [`driver::reference::ReferenceDriver`]: the in-process test double. It
//!   parses OpenCL C signatures and runs each kernel through a host
//!   implementation registered for that exact kernel body. Always available;
//!   used by the tests and demos.
//!
//! # Modules
//!
//! - [`platform`]: platform selection.
//! - [`context`]: contexts and error policies.
//! - [`queue`]: command queue provisioning.
//! - [`program`]: runtime builds and build logs.
//! - [`buffer`]: buffers and host mappings.
//! - [`kernel`]: argument binding and dispatch.
//! - [`session`]: the whole pipeline for one run.
//! - [`diagnostics`]: status codes and failure logging.
//!
//! # Example
//!
//! ```rust
//! use briny_cl::{samples, HarnessConfig, KernelArg, MemAccess, NdRange, Session};
//!
//! let session = Session::open(samples::reference_driver(), &HarnessConfig::default()).unwrap();
//! let program = session.build(samples::CONVOLUTION_CL).unwrap();
//!
//! let input = session.buffer_from(MemAccess::ReadOnly, &samples::CONVOLUTION_INPUT).unwrap();
//! let mask = session.buffer_from(MemAccess::ReadOnly, &samples::CONVOLUTION_MASK).unwrap();
//! let mut output = session.buffer(MemAccess::WriteOnly, samples::OUT_DIM * samples::OUT_DIM * 4).unwrap();
//!
//! let (in_dim, mask_dim) = (samples::IN_DIM as u32, samples::MASK_DIM as u32);
//! let mut kernel = program.create_kernel("convolve").unwrap();
//! kernel
//!     .set_args(&[
//!         KernelArg::Buffer(&input),
//!         KernelArg::Buffer(&mask),
//!         KernelArg::Buffer(&output),
//!         KernelArg::scalar(&in_dim),
//!         KernelArg::scalar(&mask_dim),
//!     ])
//!     .unwrap();
//! kernel.enqueue(session.queue(), &NdRange::new([6, 6]).local([2, 2])).unwrap();
//!
//! let result: Vec<u32> = output.read_to_vec(session.queue()).unwrap();
//! assert_eq!(result[0], 22);
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod kernel;
pub mod platform;
pub mod program;
pub mod queue;
pub mod samples;
pub mod session;
pub mod source;

pub use buffer::{MappedView, MemoryBuffer, PendingMap};
pub use config::{HarnessConfig, HarnessConfigBuilder};
pub use context::{Context, ErrorPolicy};
pub use diagnostics::Status;
pub use driver::{DeviceClass, DeviceInfo, Driver, MapAccess, MemAccess, QueueProperties, SourceDialect};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use kernel::{Kernel, KernelArg, NdRange};
pub use platform::{PlatformSelector, SelectionStrategy};
pub use program::{Program, ProgramBuilder};
pub use queue::CommandQueue;
pub use session::Session;
pub use source::SourceLoader;
