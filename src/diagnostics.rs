//! Driver status codes and failure reporting.
//!
//! Every call across the [`Driver`](crate::driver::Driver) boundary yields a
//! [`Status`] on failure. This module turns those codes into their symbolic
//! names (`CL_INVALID_ARG_SIZE`, ...) and a short human-readable description,
//! and provides [`check`], the single place where a failed driver call is
//! logged together with the caller's message.
//!
//! The numeric values follow the OpenCL runtime so that a driver backed by a
//! real ICD can pass its codes through untouched.

use core::fmt;

/// A driver status code.
///
/// `0` is success, negative values are errors. Unknown codes are preserved
/// and reported as `UNRECOGNIZED ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Status(pub i32);

macro_rules! status_codes {
    ($( $(#[$doc:meta])* $konst:ident = $code:literal, $sym:literal, $desc:literal; )*) => {
        impl Status {
            $( $(#[$doc])* pub const $konst: Status = Status($code); )*

            /// The symbolic name of the code, e.g. `CL_INVALID_ARG_SIZE`.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self.0 {
                    $( $code => $sym, )*
                    _ => "UNRECOGNIZED ERROR",
                }
            }

            /// A short human-readable description of the code.
            #[must_use]
            pub const fn description(self) -> &'static str {
                match self.0 {
                    $( $code => $desc, )*
                    _ => "unrecognized driver status",
                }
            }
        }
    };
}

status_codes! {
    SUCCESS = 0, "CL_SUCCESS", "success";
    DEVICE_NOT_FOUND = -1, "CL_DEVICE_NOT_FOUND", "no device of the requested type";
    DEVICE_NOT_AVAILABLE = -2, "CL_DEVICE_NOT_AVAILABLE", "device is not available";
    COMPILER_NOT_AVAILABLE = -3, "CL_COMPILER_NOT_AVAILABLE", "no compiler available";
    MEM_OBJECT_ALLOCATION_FAILURE = -4, "CL_MEM_OBJECT_ALLOCATION_FAILURE", "memory object allocation failed";
    OUT_OF_RESOURCES = -5, "CL_OUT_OF_RESOURCES", "device out of resources";
    OUT_OF_HOST_MEMORY = -6, "CL_OUT_OF_HOST_MEMORY", "host out of memory";
    PROFILING_INFO_NOT_AVAILABLE = -7, "CL_PROFILING_INFO_NOT_AVAILABLE", "profiling information not available";
    MEM_COPY_OVERLAP = -8, "CL_MEM_COPY_OVERLAP", "source and destination regions overlap";
    IMAGE_FORMAT_MISMATCH = -9, "CL_IMAGE_FORMAT_MISMATCH", "image formats do not match";
    IMAGE_FORMAT_NOT_SUPPORTED = -10, "CL_IMAGE_FORMAT_NOT_SUPPORTED", "image format not supported";
    BUILD_PROGRAM_FAILURE = -11, "CL_BUILD_PROGRAM_FAILURE", "program build failed";
    MAP_FAILURE = -12, "CL_MAP_FAILURE", "memory map failed";
    MISALIGNED_SUB_BUFFER_OFFSET = -13, "CL_MISALIGNED_SUB_BUFFER_OFFSET", "sub-buffer offset is misaligned";
    EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST = -14, "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST", "an event in the wait list failed";
    COMPILE_PROGRAM_FAILURE = -15, "CL_COMPILE_PROGRAM_FAILURE", "program compilation failed";
    LINKER_NOT_AVAILABLE = -16, "CL_LINKER_NOT_AVAILABLE", "no linker available";
    LINK_PROGRAM_FAILURE = -17, "CL_LINK_PROGRAM_FAILURE", "program link failed";
    DEVICE_PARTITION_FAILED = -18, "CL_DEVICE_PARTITION_FAILED", "device partition failed";
    KERNEL_ARG_INFO_NOT_AVAILABLE = -19, "CL_KERNEL_ARG_INFO_NOT_AVAILABLE", "kernel argument info not available";
    INVALID_VALUE = -30, "CL_INVALID_VALUE", "invalid value";
    INVALID_DEVICE_TYPE = -31, "CL_INVALID_DEVICE_TYPE", "invalid device type";
    INVALID_PLATFORM = -32, "CL_INVALID_PLATFORM", "invalid platform";
    INVALID_DEVICE = -33, "CL_INVALID_DEVICE", "invalid device";
    INVALID_CONTEXT = -34, "CL_INVALID_CONTEXT", "invalid context";
    INVALID_QUEUE_PROPERTIES = -35, "CL_INVALID_QUEUE_PROPERTIES", "unsupported queue properties";
    INVALID_COMMAND_QUEUE = -36, "CL_INVALID_COMMAND_QUEUE", "invalid command queue";
    INVALID_HOST_PTR = -37, "CL_INVALID_HOST_PTR", "invalid host pointer";
    INVALID_MEM_OBJECT = -38, "CL_INVALID_MEM_OBJECT", "invalid memory object";
    INVALID_IMAGE_FORMAT_DESCRIPTOR = -39, "CL_INVALID_IMAGE_FORMAT_DESCRIPTOR", "invalid image format descriptor";
    INVALID_IMAGE_SIZE = -40, "CL_INVALID_IMAGE_SIZE", "invalid image size";
    INVALID_SAMPLER = -41, "CL_INVALID_SAMPLER", "invalid sampler";
    INVALID_BINARY = -42, "CL_INVALID_BINARY", "invalid program binary";
    INVALID_BUILD_OPTIONS = -43, "CL_INVALID_BUILD_OPTIONS", "invalid build options";
    INVALID_PROGRAM = -44, "CL_INVALID_PROGRAM", "invalid program";
    INVALID_PROGRAM_EXECUTABLE = -45, "CL_INVALID_PROGRAM_EXECUTABLE", "program has no successfully built executable";
    INVALID_KERNEL_NAME = -46, "CL_INVALID_KERNEL_NAME", "kernel name not found in program";
    INVALID_KERNEL_DEFINITION = -47, "CL_INVALID_KERNEL_DEFINITION", "invalid kernel definition";
    INVALID_KERNEL = -48, "CL_INVALID_KERNEL", "invalid kernel";
    INVALID_ARG_INDEX = -49, "CL_INVALID_ARG_INDEX", "invalid argument index";
    INVALID_ARG_VALUE = -50, "CL_INVALID_ARG_VALUE", "invalid argument value";
    INVALID_ARG_SIZE = -51, "CL_INVALID_ARG_SIZE", "argument size does not match the kernel signature";
    INVALID_KERNEL_ARGS = -52, "CL_INVALID_KERNEL_ARGS", "kernel arguments not fully specified";
    INVALID_WORK_DIMENSION = -53, "CL_INVALID_WORK_DIMENSION", "invalid work dimension";
    INVALID_WORK_GROUP_SIZE = -54, "CL_INVALID_WORK_GROUP_SIZE", "invalid work-group size";
    INVALID_WORK_ITEM_SIZE = -55, "CL_INVALID_WORK_ITEM_SIZE", "invalid work-item size";
    INVALID_GLOBAL_OFFSET = -56, "CL_INVALID_GLOBAL_OFFSET", "invalid global offset";
    INVALID_EVENT_WAIT_LIST = -57, "CL_INVALID_EVENT_WAIT_LIST", "invalid event wait list";
    INVALID_EVENT = -58, "CL_INVALID_EVENT", "invalid event";
    INVALID_OPERATION = -59, "CL_INVALID_OPERATION", "invalid operation";
    INVALID_GL_OBJECT = -60, "CL_INVALID_GL_OBJECT", "invalid GL object";
    INVALID_BUFFER_SIZE = -61, "CL_INVALID_BUFFER_SIZE", "invalid buffer size";
    INVALID_MIP_LEVEL = -62, "CL_INVALID_MIP_LEVEL", "invalid mip level";
    INVALID_GLOBAL_WORK_SIZE = -63, "CL_INVALID_GLOBAL_WORK_SIZE", "invalid global work size";
    INVALID_PROPERTY = -64, "CL_INVALID_PROPERTY", "invalid property";
    INVALID_IMAGE_DESCRIPTOR = -65, "CL_INVALID_IMAGE_DESCRIPTOR", "invalid image descriptor";
    INVALID_COMPILER_OPTIONS = -66, "CL_INVALID_COMPILER_OPTIONS", "invalid compiler options";
    INVALID_LINKER_OPTIONS = -67, "CL_INVALID_LINKER_OPTIONS", "invalid linker options";
    INVALID_DEVICE_PARTITION_COUNT = -68, "CL_INVALID_DEVICE_PARTITION_COUNT", "invalid device partition count";
    /// Returned by ICD loaders when no platform is installed.
    PLATFORM_NOT_FOUND_KHR = -1001, "CL_PLATFORM_NOT_FOUND_KHR", "no platform found";
}

impl Status {
    /// The raw numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }

    /// `true` for [`Status::SUCCESS`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Converts a raw code into a `Result`, mapping success to `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns the status itself for every non-success code.
    pub const fn into_result(self) -> Result<(), Status> {
        if self.is_success() { Ok(()) } else { Err(self) }
    }
}

impl From<i32> for Status {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

impl core::error::Error for Status {}

/// Logs a failed driver call with the caller's message and passes the result
/// through unchanged.
///
/// This is the harness's one choke point for driver failures: the symbolic
/// code and the message are emitted together so every failure is traceable
/// to the stage that caused it.
///
/// # Errors
///
/// Returns the original status when `result` is an error.
///
/// # Example
///
/// ```
/// use briny_cl::diagnostics::{check, Status};
///
/// let failed: Result<(), Status> = Err(Status::INVALID_ARG_SIZE);
/// assert_eq!(check(failed, "failed to set kernel argument"), Err(Status::INVALID_ARG_SIZE));
/// ```
pub fn check<T>(result: Result<T, Status>, message: &str) -> Result<T, Status> {
    if let Err(status) = &result {
        tracing::error!(
            status = status.name(),
            code = status.code(),
            "{message}: {}",
            status.description()
        );
    }
    result
}

/// Logs a failed driver call at debug level; used where a failure is an
/// expected outcome (e.g. skipping a device that refuses a queue).
pub(crate) fn check_quiet<T>(result: Result<T, Status>, message: &str) -> Result<T, Status> {
    if let Err(status) = &result {
        tracing::debug!(status = status.name(), code = status.code(), "{message}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_names() {
        assert_eq!(Status::SUCCESS.name(), "CL_SUCCESS");
        assert_eq!(Status::INVALID_ARG_SIZE.name(), "CL_INVALID_ARG_SIZE");
        assert_eq!(Status::BUILD_PROGRAM_FAILURE.name(), "CL_BUILD_PROGRAM_FAILURE");
        assert_eq!(Status::PLATFORM_NOT_FOUND_KHR.name(), "CL_PLATFORM_NOT_FOUND_KHR");
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let s = Status(-9999);
        assert_eq!(s.name(), "UNRECOGNIZED ERROR");
        assert_eq!(s.code(), -9999);
        assert_eq!(s.to_string(), "UNRECOGNIZED ERROR (-9999)");
    }

    #[test]
    fn into_result() {
        assert_eq!(Status::SUCCESS.into_result(), Ok(()));
        assert_eq!(Status::MAP_FAILURE.into_result(), Err(Status::MAP_FAILURE));
        assert!(Status::from(0).is_success());
    }

    #[test]
    fn check_passes_results_through() {
        assert_eq!(check(Ok::<_, Status>(7), "unused"), Ok(7));
        assert_eq!(
            check(Err::<(), _>(Status::INVALID_WORK_GROUP_SIZE), "enqueue"),
            Err(Status::INVALID_WORK_GROUP_SIZE)
        );
    }
}
