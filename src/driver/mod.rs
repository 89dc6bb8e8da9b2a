//! # Device driver boundary
//!
//! The harness never talks to hardware directly. Everything it needs from a
//! compute runtime goes through the [`Driver`] trait, whose operations mirror
//! the runtime's entry points one-to-one: enumerate platforms, create a
//! context from a device class, create queues, build programs, bind kernel
//! arguments, map buffers and enqueue N-D ranges. Each call either succeeds or
//! returns a [`Status`]; the harness layers above turn those statuses into
//! [`Error`](crate::Error)s.
//!
//! ## Implementations
//!
//! - [`reference`]: CPU reference implementation of the runtime. Runs
//!   kernels declared in OpenCL C against registered host implementations,
//!   with fault injection and an object ledger for tests.
//! - `opencl` (behind the `opencl` feature): installed OpenCL runtimes
//!   through `opencl3`, with kernels in OpenCL C.
//! - `wgpu` (behind the `wgpu` feature): real GPUs through `wgpu`, with
//!   kernels in WGSL.
//!
//! ## Handles
//!
//! Handles are plain copyable ids. Ownership (and therefore release) lives in
//! the harness's RAII wrappers, not here.

use crate::diagnostics::Status;
use core::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[cfg(feature = "opencl")]
pub mod opencl;
pub mod reference;
#[cfg(feature = "wgpu")]
pub mod wgpu;

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

handle!(
    /// Opaque platform handle.
    PlatformId
);
handle!(
    /// Opaque device handle.
    DeviceId
);
handle!(
    /// Opaque context handle.
    ContextId
);
handle!(
    /// Opaque command-queue handle.
    QueueId
);
handle!(
    /// Opaque program handle.
    ProgramId
);
handle!(
    /// Opaque kernel handle.
    KernelId
);
handle!(
    /// Opaque memory-object handle.
    MemId
);

/// Capability class of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceClass {
    /// A graphics processor.
    #[default]
    Gpu,
    /// The host processor.
    Cpu,
    /// A dedicated accelerator.
    Accelerator,
}

impl DeviceClass {
    /// Every class, in fallback order.
    pub const FALLBACK_ORDER: [DeviceClass; 3] =
        [DeviceClass::Accelerator, DeviceClass::Gpu, DeviceClass::Cpu];

    /// The classes to try, in order, when `self` is preferred: `self`
    /// followed by every class after it in `ACCELERATOR → GPU → CPU`.
    ///
    /// ```
    /// use briny_cl::driver::DeviceClass;
    ///
    /// assert_eq!(DeviceClass::Gpu.fallback_chain(), &[DeviceClass::Gpu, DeviceClass::Cpu]);
    /// assert_eq!(DeviceClass::Cpu.fallback_chain(), &[DeviceClass::Cpu]);
    /// ```
    #[must_use]
    pub fn fallback_chain(self) -> &'static [DeviceClass] {
        let start = Self::FALLBACK_ORDER
            .iter()
            .position(|&c| c == self)
            .unwrap_or(0);
        &Self::FALLBACK_ORDER[start..]
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => write!(f, "GPU"),
            Self::Cpu => write!(f, "CPU"),
            Self::Accelerator => write!(f, "ACCELERATOR"),
        }
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(Self::Gpu),
            "cpu" => Ok(Self::Cpu),
            "accelerator" | "acc" => Ok(Self::Accelerator),
            other => Err(format!("unknown device class `{other}`")),
        }
    }
}

/// Static description of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Marketing name.
    pub name: String,
    /// Vendor string.
    pub vendor: String,
    /// Capability class.
    pub class: DeviceClass,
    /// Number of parallel compute units.
    pub compute_units: u32,
    /// Upper bound on the product of a work-group's local sizes.
    pub max_work_group_size: usize,
    /// Upper bound on each local size, per dimension.
    pub max_work_item_sizes: [usize; 3],
    /// Upper bound on the total number of work-items in one dispatch.
    pub max_global_work_items: usize,
    /// Size of global memory in bytes.
    pub global_mem_bytes: u64,
}

/// Kernel-side access mode of a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccess {
    /// Kernels may only read.
    ReadOnly,
    /// Kernels may only write.
    WriteOnly,
    /// Kernels may read and write.
    ReadWrite,
}

impl MemAccess {
    /// Whether a kernel may store into a buffer with this access mode.
    #[must_use]
    pub const fn kernel_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Host access requested by a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapAccess {
    /// The host reads the region.
    Read,
    /// The host writes the region; it is copied back on unmap.
    Write,
    /// Both.
    ReadWrite,
}

impl MapAccess {
    /// Whether unmapping must copy the host region back to the device.
    #[must_use]
    pub const fn writes_back(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Command-queue creation properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueProperties {
    /// Allow commands to execute out of submission order.
    pub out_of_order: bool,
    /// Record profiling timestamps.
    pub profiling: bool,
}

/// Which kernel language a driver compiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDialect {
    /// OpenCL C.
    OpenClC,
    /// WebGPU Shading Language.
    Wgsl,
}

/// A value bound to a kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgValue<'a> {
    /// A memory object. Its size is the size of a handle.
    Mem(MemId),
    /// Raw scalar (or vector / plain struct) bytes.
    Bytes(&'a [u8]),
}

impl ArgValue<'_> {
    /// Size of a memory-object handle as seen by a kernel signature.
    pub const MEM_HANDLE_SIZE: usize = core::mem::size_of::<u64>();

    /// Size in bytes this value occupies in an argument slot.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::Mem(_) => Self::MEM_HANDLE_SIZE,
            Self::Bytes(bytes) => bytes.len(),
        }
    }
}

/// A host-addressable view of a mapped buffer region.
///
/// Returned by [`Driver::enqueue_map_buffer`] and handed back to
/// [`Driver::enqueue_unmap_mem_object`]. The token identifies the mapping to
/// the driver; the bytes are the host side of the region.
#[derive(Debug)]
pub struct HostRegion {
    /// Driver-issued mapping token.
    pub token: u64,
    /// Byte offset of the region inside the buffer.
    pub offset: usize,
    /// Host access the region was mapped with.
    pub access: MapAccess,
    /// Host copy of the region.
    pub bytes: Vec<u8>,
}

/// Asynchronous error hook installed on a context.
///
/// Drivers invoke it (possibly from another thread) for runtime errors that
/// are not tied to the return value of a call.
pub type ContextNotify = Arc<dyn Fn(&str) + Send + Sync>;

/// The external device driver.
///
/// Methods take `&self`; implementations synchronise internally. Handles
/// passed in must have been returned by the same driver.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// The kernel language accepted by [`create_program_with_source`](Driver::create_program_with_source).
    fn source_dialect(&self) -> SourceDialect;

    /// Every platform, in driver order.
    fn platform_ids(&self) -> Result<Vec<PlatformId>, Status>;

    /// Display name of a platform.
    fn platform_name(&self, platform: PlatformId) -> Result<String, Status>;

    /// Creates a context holding every device of `class` on `platform`.
    fn create_context_from_type(
        &self,
        platform: PlatformId,
        class: DeviceClass,
        notify: Option<ContextNotify>,
    ) -> Result<ContextId, Status>;

    /// Number of devices bound to a context.
    fn context_num_devices(&self, context: ContextId) -> Result<usize, Status>;

    /// Devices bound to a context, in driver order.
    fn context_devices(&self, context: ContextId) -> Result<Vec<DeviceId>, Status>;

    /// Releases a context.
    fn release_context(&self, context: ContextId) -> Result<(), Status>;

    /// Describes a device.
    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo, Status>;

    /// Creates a command queue for one device of a context.
    fn create_command_queue(
        &self,
        context: ContextId,
        device: DeviceId,
        properties: QueueProperties,
    ) -> Result<QueueId, Status>;

    /// Blocks until every command enqueued on `queue` has completed.
    fn finish(&self, queue: QueueId) -> Result<(), Status>;

    /// Submits every enqueued command without waiting.
    fn flush(&self, queue: QueueId) -> Result<(), Status>;

    /// Releases a command queue.
    fn release_command_queue(&self, queue: QueueId) -> Result<(), Status>;

    /// Creates a program object from source text. Syntax is not checked here.
    fn create_program_with_source(&self, context: ContextId, source: &str)
    -> Result<ProgramId, Status>;

    /// Creates a program object from a binary previously returned by
    /// [`program_binary`](Driver::program_binary).
    fn create_program_with_binary(
        &self,
        context: ContextId,
        device: DeviceId,
        binary: &[u8],
    ) -> Result<ProgramId, Status>;

    /// Compiles and links a program for one device.
    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str)
    -> Result<(), Status>;

    /// Two-phase build-log accessor.
    ///
    /// With `buf == None` returns the size of the log including its
    /// terminating NUL. With a buffer, copies as much of the log as fits,
    /// NUL-terminates it when there is room, and returns the full size.
    fn program_build_log(
        &self,
        program: ProgramId,
        device: DeviceId,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, Status>;

    /// Executable binary of a program built for `device`.
    fn program_binary(&self, program: ProgramId, device: DeviceId) -> Result<Vec<u8>, Status>;

    /// Releases a program.
    fn release_program(&self, program: ProgramId) -> Result<(), Status>;

    /// Extracts a kernel entry point by name.
    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId, Status>;

    /// Number of parameters in the kernel's signature.
    fn kernel_num_args(&self, kernel: KernelId) -> Result<usize, Status>;

    /// Binds a value to a parameter slot.
    fn set_kernel_arg(&self, kernel: KernelId, index: usize, value: ArgValue<'_>)
    -> Result<(), Status>;

    /// Releases a kernel.
    fn release_kernel(&self, kernel: KernelId) -> Result<(), Status>;

    /// Allocates a buffer, optionally initialised from `host_data`
    /// (`host_data.len()` must equal `size`).
    fn create_buffer(
        &self,
        context: ContextId,
        access: MemAccess,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> Result<MemId, Status>;

    /// Releases a memory object.
    fn release_mem_object(&self, mem: MemId) -> Result<(), Status>;

    /// Fills `size` bytes at `offset` with a repeating pattern.
    fn enqueue_fill_buffer(
        &self,
        queue: QueueId,
        mem: MemId,
        pattern: &[u8],
        offset: usize,
        size: usize,
    ) -> Result<(), Status>;

    /// Maps a region for host access.
    ///
    /// With `blocking == false` the region's contents are only guaranteed
    /// once the queue has been finished.
    fn enqueue_map_buffer(
        &self,
        queue: QueueId,
        mem: MemId,
        blocking: bool,
        access: MapAccess,
        offset: usize,
        size: usize,
    ) -> Result<HostRegion, Status>;

    /// Ends a mapping, copying written regions back to the device.
    fn enqueue_unmap_mem_object(
        &self,
        queue: QueueId,
        mem: MemId,
        region: HostRegion,
    ) -> Result<(), Status>;

    /// Enqueues an N-D range execution of a kernel.
    fn enqueue_nd_range_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<(), Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_chains() {
        assert_eq!(
            DeviceClass::Accelerator.fallback_chain(),
            &[DeviceClass::Accelerator, DeviceClass::Gpu, DeviceClass::Cpu]
        );
        assert_eq!(DeviceClass::Gpu.fallback_chain(), &[DeviceClass::Gpu, DeviceClass::Cpu]);
        assert_eq!(DeviceClass::Cpu.fallback_chain(), &[DeviceClass::Cpu]);
    }

    #[test]
    fn device_class_parsing() {
        assert_eq!("GPU".parse::<DeviceClass>(), Ok(DeviceClass::Gpu));
        assert_eq!(" cpu ".parse::<DeviceClass>(), Ok(DeviceClass::Cpu));
        assert_eq!("acc".parse::<DeviceClass>(), Ok(DeviceClass::Accelerator));
        assert!("fpga".parse::<DeviceClass>().is_err());
        assert_eq!(DeviceClass::Accelerator.to_string(), "ACCELERATOR");
    }

    #[test]
    fn arg_sizes() {
        assert_eq!(ArgValue::Mem(MemId(3)).size(), 8);
        assert_eq!(ArgValue::Bytes(&[0; 4]).size(), 4);
    }

    #[test]
    fn access_modes() {
        assert!(!MemAccess::ReadOnly.kernel_writable());
        assert!(MemAccess::WriteOnly.kernel_writable());
        assert!(!MapAccess::Read.writes_back());
        assert!(MapAccess::ReadWrite.writes_back());
    }

    #[test]
    fn handle_display() {
        assert_eq!(MemId(7).to_string(), "MemId#7");
    }
}
