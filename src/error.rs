//! Harness errors.
//!
//! Every fallible harness operation returns [`Result<T>`], whose error carries
//! the failing stage ([`ErrorKind`]) and, where the failure came from the
//! driver, the originating [`Status`].

use crate::diagnostics::Status;
use crate::driver::DeviceClass;
use std::path::PathBuf;
use thiserror::Error;

/// Shorthand for harness results.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The pipeline stage an [`Error`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No platform could be enumerated.
    Discovery,
    /// A context, queue, program, kernel or buffer could not be created.
    ResourceCreation,
    /// A kernel program failed to compile or link.
    Build,
    /// A kernel argument could not be bound.
    ArgumentBinding,
    /// A kernel launch was rejected.
    Dispatch,
    /// A map, unmap, fill or synchronisation failed.
    Transfer,
    /// Kernel source or binary could not be loaded.
    Source,
    /// The harness configuration is invalid.
    Config,
}

/// One failed attempt to create a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextAttempt {
    /// Platform name (or id when the name query failed).
    pub platform: String,
    /// Device class requested.
    pub class: DeviceClass,
    /// Status returned by the driver.
    pub status: Status,
}

impl core::fmt::Display for ContextAttempt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} on `{}`: {}", self.class, self.platform, self.status)
    }
}

fn list_attempts(attempts: &[ContextAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A harness failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Platform enumeration returned nothing (or failed).
    #[error("no compute platform found ({0})")]
    NoPlatformFound(Status),

    /// A context was created but holds no devices.
    #[error("context holds no devices")]
    NoDevicesAvailable,

    /// Every context-creation attempt failed.
    #[error("failed to create a {requested} context: {}", list_attempts(.attempts))]
    ContextCreationFailed {
        /// Preferred device class.
        requested: DeviceClass,
        /// Every attempt made, in order.
        attempts: Vec<ContextAttempt>,
    },

    /// A driver query on a live context failed.
    #[error("context query failed: {0}")]
    ContextQueryFailed(Status),

    /// No device of the context accepted a command queue.
    #[error("no device accepted a command queue ({devices} tried, last: {status})")]
    QueueCreationFailed {
        /// Number of devices tried.
        devices: usize,
        /// Status of the last attempt.
        status: Status,
    },

    /// The driver rejected the program container.
    #[error("failed to create program: {0}")]
    ProgramCreateFailed(Status),

    /// Compilation failed; `log` is the driver's build log verbatim.
    #[error("program build failed ({status}):\n{log}")]
    BuildFailed {
        /// Build status.
        status: Status,
        /// Full build log.
        log: String,
    },

    /// The program binary could not be retrieved.
    #[error("failed to read program binary: {0}")]
    BinaryUnavailable(Status),

    /// The named kernel could not be extracted.
    #[error("failed to create kernel `{name}`: {status}")]
    KernelCreateFailed {
        /// Kernel entry point name.
        name: String,
        /// Driver status.
        status: Status,
    },

    /// A buffer could not be allocated.
    #[error("failed to allocate a {size}-byte buffer: {status}")]
    BufferCreateFailed {
        /// Requested size in bytes.
        size: usize,
        /// Driver status.
        status: Status,
    },

    /// A kernel argument could not be bound.
    #[error("failed to set argument {index} of `{kernel}`: {status}")]
    ArgumentBinding {
        /// Kernel name.
        kernel: String,
        /// Argument slot.
        index: usize,
        /// Driver status.
        status: Status,
    },

    /// The driver rejected a kernel launch.
    #[error("failed to enqueue `{kernel}`: {status}")]
    DispatchFailed {
        /// Kernel name.
        kernel: String,
        /// Driver status.
        status: Status,
    },

    /// A kernel was launched while one of its bound buffers is mapped.
    #[error("argument {index} of `{kernel}` is mapped by the host")]
    BufferMapped {
        /// Kernel name.
        kernel: String,
        /// Argument slot holding the mapped buffer.
        index: usize,
    },

    /// Mapping a buffer failed.
    #[error("failed to map buffer: {0}")]
    MapFailed(Status),

    /// Unmapping a buffer failed.
    #[error("failed to unmap buffer: {0}")]
    UnmapFailed(Status),

    /// Filling a buffer failed.
    #[error("failed to fill buffer: {0}")]
    FillFailed(Status),

    /// The buffer already has an outstanding host mapping.
    #[error("buffer is already mapped")]
    AlreadyMapped,

    /// A host-initialised `READ_ONLY` buffer was mapped for writing.
    #[error("read-only buffer initialised from host data cannot be mapped for writing")]
    ReadOnlyMapWrite,

    /// The mapped region does not hold a whole number of elements.
    #[error("mapped region of {len} bytes is not a whole number of {elem}-byte elements")]
    ViewCast {
        /// Region length in bytes.
        len: usize,
        /// Element size requested.
        elem: usize,
    },

    /// `finish` or `flush` failed.
    #[error("queue synchronisation failed: {0}")]
    SyncFailed(Status),

    /// The kernel source file does not exist.
    #[error("kernel source `{}` not found", .0.display())]
    SourceNotFound(PathBuf),

    /// The kernel source file exists but could not be read.
    #[error("failed to read kernel source `{}`", .path.display())]
    SourceRead {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Fewer bytes were read than the file's reported size.
    #[error("kernel source `{}` truncated: read {read} of {expected} bytes", .path.display())]
    SourceTruncated {
        /// File path.
        path: PathBuf,
        /// Bytes read.
        read: usize,
        /// Size reported by the file system.
        expected: usize,
    },

    /// The kernel source is not valid UTF-8.
    #[error("kernel source `{}` is not valid UTF-8", .0.display())]
    SourceEncoding(PathBuf),

    /// Invalid harness configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An error with a caller-supplied message attached.
    #[error("{message}: {source}")]
    Context {
        /// Caller message.
        message: String,
        /// Wrapped error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The stage this error belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoPlatformFound(_) | Self::NoDevicesAvailable => ErrorKind::Discovery,
            Self::ContextCreationFailed { .. }
            | Self::ContextQueryFailed(_)
            | Self::QueueCreationFailed { .. }
            | Self::ProgramCreateFailed(_)
            | Self::KernelCreateFailed { .. }
            | Self::BufferCreateFailed { .. } => ErrorKind::ResourceCreation,
            Self::BuildFailed { .. } | Self::BinaryUnavailable(_) => ErrorKind::Build,
            Self::ArgumentBinding { .. } => ErrorKind::ArgumentBinding,
            Self::DispatchFailed { .. } | Self::BufferMapped { .. } => ErrorKind::Dispatch,
            Self::MapFailed(_)
            | Self::UnmapFailed(_)
            | Self::FillFailed(_)
            | Self::AlreadyMapped
            | Self::ReadOnlyMapWrite
            | Self::ViewCast { .. }
            | Self::SyncFailed(_) => ErrorKind::Transfer,
            Self::SourceNotFound(_)
            | Self::SourceRead { .. }
            | Self::SourceTruncated { .. }
            | Self::SourceEncoding(_) => ErrorKind::Source,
            Self::Config(_) => ErrorKind::Config,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// The driver status that caused this error, if any.
    ///
    /// For [`Error::ContextCreationFailed`] this is the status of the last
    /// attempt.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::NoPlatformFound(s)
            | Self::ContextQueryFailed(s)
            | Self::ProgramCreateFailed(s)
            | Self::BinaryUnavailable(s)
            | Self::MapFailed(s)
            | Self::UnmapFailed(s)
            | Self::FillFailed(s)
            | Self::SyncFailed(s) => Some(*s),
            Self::QueueCreationFailed { status, .. }
            | Self::BuildFailed { status, .. }
            | Self::KernelCreateFailed { status, .. }
            | Self::BufferCreateFailed { status, .. }
            | Self::ArgumentBinding { status, .. }
            | Self::DispatchFailed { status, .. } => Some(*status),
            Self::ContextCreationFailed { attempts, .. } => attempts.last().map(|a| a.status),
            Self::Context { source, .. } => source.status(),
            _ => None,
        }
    }

    /// The build log, for build failures.
    #[must_use]
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Self::BuildFailed { log, .. } => Some(log),
            Self::Context { source, .. } => source.build_log(),
            _ => None,
        }
    }
}

/// Extension methods for harness results.
pub trait ResultExt<T> {
    /// Wraps the error with a message describing what was being attempted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Context`] wrapping the original error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Terminating path: on error, logs `message` with the error and exits
    /// the process with a failure status.
    fn or_exit(self, message: &str) -> T;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|source| Error::Context {
            message: message.into(),
            source: Box::new(source),
        })
    }

    fn or_exit(self, message: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(kind = ?err.kind(), status = ?err.status(), "{message}: {err}");
                eprintln!("{message}: {err}");
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_stage() {
        assert_eq!(Error::NoPlatformFound(Status::PLATFORM_NOT_FOUND_KHR).kind(), ErrorKind::Discovery);
        assert_eq!(Error::NoDevicesAvailable.kind(), ErrorKind::Discovery);
        assert_eq!(
            Error::BuildFailed { status: Status::BUILD_PROGRAM_FAILURE, log: String::new() }.kind(),
            ErrorKind::Build
        );
        assert_eq!(Error::AlreadyMapped.kind(), ErrorKind::Transfer);
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::Config);
    }

    #[test]
    fn context_preserves_kind_and_status() {
        let res: Result<()> = Err(Error::DispatchFailed {
            kernel: "vector_add".into(),
            status: Status::INVALID_WORK_GROUP_SIZE,
        });
        let err = res.context("running vector add").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dispatch);
        assert_eq!(err.status(), Some(Status::INVALID_WORK_GROUP_SIZE));
        assert!(err.to_string().starts_with("running vector add: "));
    }

    #[test]
    fn context_creation_lists_attempts() {
        let err = Error::ContextCreationFailed {
            requested: DeviceClass::Gpu,
            attempts: vec![
                ContextAttempt {
                    platform: "Reference".into(),
                    class: DeviceClass::Gpu,
                    status: Status::DEVICE_NOT_FOUND,
                },
                ContextAttempt {
                    platform: "Reference".into(),
                    class: DeviceClass::Cpu,
                    status: Status::DEVICE_NOT_AVAILABLE,
                },
            ],
        };
        assert_eq!(err.status(), Some(Status::DEVICE_NOT_AVAILABLE));
        let msg = err.to_string();
        assert!(msg.contains("GPU on `Reference`: CL_DEVICE_NOT_FOUND (-1)"));
        assert!(msg.contains("CPU on `Reference`: CL_DEVICE_NOT_AVAILABLE (-2)"));
    }

    #[test]
    fn build_log_is_reachable_through_context() {
        let res: Result<()> = Err(Error::BuildFailed {
            status: Status::BUILD_PROGRAM_FAILURE,
            log: "<source>:1:1: error: boom".into(),
        });
        let err = res.context("building").unwrap_err();
        assert_eq!(err.build_log(), Some("<source>:1:1: error: boom"));
    }
}
