//! Driver for installed OpenCL runtimes, through `opencl3`.
//!
//! Platforms and devices are enumerated once, in [`OpenClDriver::new`], and
//! handed out as plain ids. Every other call forwards to the runtime and
//! passes its status code through unchanged.
//!
//! Maps are blocking read-backs into host memory; written regions go back to
//! the device on unmap. The context error hook receives the runtime's
//! `pfn_notify` messages.

use super::{
    ArgValue, ContextId, ContextNotify, DeviceClass, DeviceId, DeviceInfo, Driver, HostRegion,
    KernelId, MapAccess, MemAccess, MemId, PlatformId, ProgramId, QueueId, QueueProperties,
    SourceDialect,
};
use crate::diagnostics::Status;
use opencl3::command_queue::{
    CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE, CL_QUEUE_PROFILING_ENABLE, CommandQueue,
};
use opencl3::context::Context;
use opencl3::device::{
    CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU, Device,
};
use opencl3::error_codes::ClError;
use opencl3::kernel::Kernel;
use opencl3::memory::{
    Buffer, CL_MEM_COPY_HOST_PTR, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY, ClMem,
};
use opencl3::platform::{Platform, get_platforms};
use opencl3::program::Program;
use opencl3::types::{
    CL_BLOCKING, cl_command_queue_properties, cl_context_properties, cl_device_id, cl_device_type,
    cl_mem_flags, cl_uint,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, c_char, c_void};
use std::fmt;
use std::ptr;
use tracing::{debug, info, warn};

const CL_CONTEXT_PLATFORM: cl_context_properties = 0x1084;

fn status(err: ClError) -> Status {
    Status(err.0)
}

fn class_of(device_type: cl_device_type) -> Option<DeviceClass> {
    if device_type & CL_DEVICE_TYPE_GPU != 0 {
        Some(DeviceClass::Gpu)
    } else if device_type & CL_DEVICE_TYPE_CPU != 0 {
        Some(DeviceClass::Cpu)
    } else if device_type & CL_DEVICE_TYPE_ACCELERATOR != 0 {
        Some(DeviceClass::Accelerator)
    } else {
        None
    }
}

fn mem_flags(access: MemAccess, from_host: bool) -> cl_mem_flags {
    let flags = match access {
        MemAccess::ReadOnly => CL_MEM_READ_ONLY,
        MemAccess::WriteOnly => CL_MEM_WRITE_ONLY,
        MemAccess::ReadWrite => CL_MEM_READ_WRITE,
    };
    if from_host { flags | CL_MEM_COPY_HOST_PTR } else { flags }
}

fn queue_flags(properties: QueueProperties) -> cl_command_queue_properties {
    let mut flags = 0;
    if properties.out_of_order {
        flags |= CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE;
    }
    if properties.profiling {
        flags |= CL_QUEUE_PROFILING_ENABLE;
    }
    flags
}

/// Forwards a runtime error report to the context's hook.
unsafe extern "C" fn notify_trampoline(
    errinfo: *const c_char,
    _private_info: *const c_void,
    _cb: usize,
    user_data: *mut c_void,
) {
    if errinfo.is_null() || user_data.is_null() {
        return;
    }
    // SAFETY: `user_data` points at the boxed hook of a live `ContextState`,
    // which is dropped only after its `Context`. `errinfo` is a NUL-terminated
    // string owned by the runtime for the duration of the call.
    let (hook, message) = unsafe { (&*user_data.cast::<ContextNotify>(), CStr::from_ptr(errinfo)) };
    hook(&message.to_string_lossy());
}

fn device_info(device: &Device) -> Result<DeviceInfo, ClError> {
    let sizes = device.max_work_item_sizes()?;
    let mut max_work_item_sizes = [1usize; 3];
    for (slot, size) in max_work_item_sizes.iter_mut().zip(sizes) {
        *slot = size;
    }
    Ok(DeviceInfo {
        name: device.name()?,
        vendor: device.vendor()?,
        class: class_of(device.dev_type()?).unwrap_or(DeviceClass::Accelerator),
        compute_units: device.max_compute_units()?,
        max_work_group_size: device.max_work_group_size()?,
        max_work_item_sizes,
        // The runtime checks work sizes against `size_t` itself.
        max_global_work_items: usize::MAX,
        global_mem_bytes: device.global_mem_size()?,
    })
}

// ── Driver state ────────────────────────────────────────────────────────────

struct PlatformEntry {
    id: PlatformId,
    platform: Platform,
    name: String,
    devices: Vec<DeviceId>,
}

struct DeviceEntry {
    raw: cl_device_id,
    available: bool,
    info: DeviceInfo,
}

struct ContextState {
    // Dropped before `notify`, which the runtime may still call into.
    context: Context,
    devices: Vec<DeviceId>,
    notify: Option<Box<ContextNotify>>,
}

struct QueueState {
    context: ContextId,
    queue: CommandQueue,
}

struct ProgramState {
    context: ContextId,
    program: Program,
    devices: Vec<DeviceId>,
    built_for: Option<DeviceId>,
}

struct KernelState {
    program: ProgramId,
    context: ContextId,
    kernel: Kernel,
}

struct MemState {
    context: ContextId,
    buffer: Buffer<u8>,
    size: usize,
    maps: HashMap<u64, (usize, usize, MapAccess)>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    contexts: HashMap<ContextId, ContextState>,
    queues: HashMap<QueueId, QueueState>,
    programs: HashMap<ProgramId, ProgramState>,
    kernels: HashMap<KernelId, KernelState>,
    mems: HashMap<MemId, MemState>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn queue(&self, queue: QueueId) -> Result<&QueueState, Status> {
        self.queues.get(&queue).ok_or(Status::INVALID_COMMAND_QUEUE)
    }
}

/// Driver backed by the system's OpenCL ICD loader.
pub struct OpenClDriver {
    platforms: Vec<PlatformEntry>,
    devices: HashMap<DeviceId, DeviceEntry>,
    state: Mutex<State>,
}

// SAFETY: the raw OpenCL handles held here are thread-safe runtime objects
// (OpenCL 1.2 §A.2); every mutation of driver-side state goes through the
// mutex.
unsafe impl Send for OpenClDriver {}
unsafe impl Sync for OpenClDriver {}

impl OpenClDriver {
    /// Enumerates every platform and device the ICD loader reports. A
    /// missing loader or an empty system yields a driver without platforms.
    #[must_use]
    pub fn new() -> Self {
        let mut next = 0u64;
        let mut platforms = Vec::new();
        let mut devices = HashMap::new();
        let found = get_platforms().unwrap_or_else(|err| {
            debug!(status = %status(err), "no OpenCL platforms");
            Vec::new()
        });
        for platform in found {
            next += 1;
            let mut entry = PlatformEntry {
                id: PlatformId(next),
                name: platform.name().unwrap_or_default(),
                platform,
                devices: Vec::new(),
            };
            let raw_ids = entry.platform.get_devices(CL_DEVICE_TYPE_ALL).unwrap_or_default();
            for raw in raw_ids {
                let device = Device::new(raw);
                let info = match device_info(&device) {
                    Ok(info) => info,
                    Err(err) => {
                        warn!(platform = %entry.name, status = %status(err), "device query failed; skipped");
                        continue;
                    }
                };
                next += 1;
                let id = DeviceId(next);
                debug!(device = %info.name, vendor = %info.vendor, class = %info.class, "OpenCL device found");
                entry.devices.push(id);
                devices.insert(
                    id,
                    DeviceEntry {
                        raw,
                        available: device.available().unwrap_or(false),
                        info,
                    },
                );
            }
            platforms.push(entry);
        }
        Self {
            platforms,
            devices,
            state: Mutex::new(State::default()),
        }
    }

    fn raw_device(&self, device: DeviceId) -> Result<cl_device_id, Status> {
        self.devices.get(&device).map(|d| d.raw).ok_or(Status::INVALID_DEVICE)
    }

    fn check_region(size: usize, offset: usize, len: usize) -> Result<(), Status> {
        if len == 0 || offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(Status::INVALID_VALUE);
        }
        Ok(())
    }
}

impl Default for OpenClDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OpenClDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClDriver")
            .field("platforms", &self.platforms.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl Driver for OpenClDriver {
    fn name(&self) -> &str {
        "opencl"
    }

    fn source_dialect(&self) -> SourceDialect {
        SourceDialect::OpenClC
    }

    fn platform_ids(&self) -> Result<Vec<PlatformId>, Status> {
        if self.platforms.is_empty() {
            return Err(Status::PLATFORM_NOT_FOUND_KHR);
        }
        Ok(self.platforms.iter().map(|p| p.id).collect())
    }

    fn platform_name(&self, platform: PlatformId) -> Result<String, Status> {
        self.platforms
            .iter()
            .find(|p| p.id == platform)
            .map(|p| p.name.clone())
            .ok_or(Status::INVALID_PLATFORM)
    }

    fn create_context_from_type(
        &self,
        platform: PlatformId,
        class: DeviceClass,
        notify: Option<ContextNotify>,
    ) -> Result<ContextId, Status> {
        let plat = self
            .platforms
            .iter()
            .find(|p| p.id == platform)
            .ok_or(Status::INVALID_PLATFORM)?;
        let of_class: Vec<DeviceId> = plat
            .devices
            .iter()
            .copied()
            .filter(|d| self.devices.get(d).is_some_and(|e| e.info.class == class))
            .collect();
        if of_class.is_empty() {
            return Err(Status::DEVICE_NOT_FOUND);
        }
        let usable: Vec<DeviceId> = of_class
            .into_iter()
            .filter(|d| self.devices.get(d).is_some_and(|e| e.available))
            .collect();
        if usable.is_empty() {
            return Err(Status::DEVICE_NOT_AVAILABLE);
        }
        let raw: Vec<cl_device_id> = usable.iter().map(|&d| self.raw_device(d)).collect::<Result<_, _>>()?;

        let properties = [CL_CONTEXT_PLATFORM, plat.platform.id() as cl_context_properties, 0];
        let notify = notify.map(Box::new);
        let user_data = notify
            .as_ref()
            .map_or(ptr::null_mut(), |hook| ptr::from_ref::<ContextNotify>(&**hook).cast_mut().cast::<c_void>());
        let callback = notify.as_ref().map(|_| notify_trampoline as unsafe extern "C" fn(_, _, _, _));
        let context = Context::from_devices(&raw, &properties, callback, user_data).map_err(status)?;

        let mut st = self.state.lock();
        let id = ContextId(st.next_id());
        st.contexts.insert(
            id,
            ContextState {
                context,
                devices: usable,
                notify,
            },
        );
        info!(platform = %plat.name, %class, "OpenCL context created");
        Ok(id)
    }

    fn context_num_devices(&self, context: ContextId) -> Result<usize, Status> {
        self.state
            .lock()
            .contexts
            .get(&context)
            .map(|c| c.context.devices().len())
            .ok_or(Status::INVALID_CONTEXT)
    }

    fn context_devices(&self, context: ContextId) -> Result<Vec<DeviceId>, Status> {
        self.state
            .lock()
            .contexts
            .get(&context)
            .map(|c| c.devices.clone())
            .ok_or(Status::INVALID_CONTEXT)
    }

    fn release_context(&self, context: ContextId) -> Result<(), Status> {
        self.state.lock().contexts.remove(&context).map(|_| ()).ok_or(Status::INVALID_CONTEXT)
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo, Status> {
        self.devices
            .get(&device)
            .map(|d| d.info.clone())
            .ok_or(Status::INVALID_DEVICE)
    }

    fn create_command_queue(
        &self,
        context: ContextId,
        device: DeviceId,
        properties: QueueProperties,
    ) -> Result<QueueId, Status> {
        let raw = self.raw_device(device)?;
        let mut st = self.state.lock();
        let ctx = st.contexts.get(&context).ok_or(Status::INVALID_CONTEXT)?;
        if !ctx.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        // SAFETY: `raw` is a device of `ctx.context`.
        let queue = unsafe {
            CommandQueue::create_with_properties(&ctx.context, raw, queue_flags(properties), 0)
        }
        .map_err(status)?;
        let id = QueueId(st.next_id());
        st.queues.insert(id, QueueState { context, queue });
        Ok(id)
    }

    fn finish(&self, queue: QueueId) -> Result<(), Status> {
        self.state.lock().queue(queue)?.queue.finish().map_err(status)
    }

    fn flush(&self, queue: QueueId) -> Result<(), Status> {
        self.state.lock().queue(queue)?.queue.flush().map_err(status)
    }

    fn release_command_queue(&self, queue: QueueId) -> Result<(), Status> {
        self.state.lock().queues.remove(&queue).map(|_| ()).ok_or(Status::INVALID_COMMAND_QUEUE)
    }

    fn create_program_with_source(&self, context: ContextId, source: &str) -> Result<ProgramId, Status> {
        if source.is_empty() || source.contains('\0') {
            return Err(Status::INVALID_VALUE);
        }
        let mut st = self.state.lock();
        let ctx = st.contexts.get(&context).ok_or(Status::INVALID_CONTEXT)?;
        let program = Program::create_from_source(&ctx.context, source).map_err(status)?;
        let devices = ctx.devices.clone();
        let id = ProgramId(st.next_id());
        st.programs.insert(
            id,
            ProgramState {
                context,
                program,
                devices,
                built_for: None,
            },
        );
        Ok(id)
    }

    fn create_program_with_binary(
        &self,
        context: ContextId,
        device: DeviceId,
        binary: &[u8],
    ) -> Result<ProgramId, Status> {
        if binary.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        let raw = self.raw_device(device)?;
        let mut st = self.state.lock();
        let ctx = st.contexts.get(&context).ok_or(Status::INVALID_CONTEXT)?;
        if !ctx.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        // SAFETY: one binary for one device of the context.
        let program = unsafe { Program::create_from_binary(&ctx.context, &[raw], &[binary]) }.map_err(status)?;
        let id = ProgramId(st.next_id());
        st.programs.insert(
            id,
            ProgramState {
                context,
                program,
                devices: vec![device],
                built_for: None,
            },
        );
        Ok(id)
    }

    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str) -> Result<(), Status> {
        let raw = self.raw_device(device)?;
        let mut st = self.state.lock();
        if st.kernels.values().any(|k| k.program == program) {
            return Err(Status::INVALID_OPERATION);
        }
        let prog = st.programs.get_mut(&program).ok_or(Status::INVALID_PROGRAM)?;
        if !prog.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        prog.built_for = None;
        prog.program.build(&[raw], options).map_err(status)?;
        prog.built_for = Some(device);
        Ok(())
    }

    fn program_build_log(
        &self,
        program: ProgramId,
        device: DeviceId,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let raw = self.raw_device(device)?;
        let st = self.state.lock();
        let prog = st.programs.get(&program).ok_or(Status::INVALID_PROGRAM)?;
        let log = prog.program.get_build_log(raw).map_err(status)?;
        let log = log.trim_end_matches('\0').as_bytes();
        if let Some(buf) = buf {
            let n = log.len().min(buf.len());
            buf[..n].copy_from_slice(&log[..n]);
            if let Some(nul) = buf.get_mut(n) {
                *nul = 0;
            }
        }
        Ok(log.len() + 1)
    }

    fn program_binary(&self, program: ProgramId, device: DeviceId) -> Result<Vec<u8>, Status> {
        let st = self.state.lock();
        let prog = st.programs.get(&program).ok_or(Status::INVALID_PROGRAM)?;
        if prog.built_for != Some(device) {
            return Err(Status::INVALID_PROGRAM_EXECUTABLE);
        }
        let slot = prog
            .devices
            .iter()
            .position(|&d| d == device)
            .ok_or(Status::INVALID_DEVICE)?;
        prog.program
            .get_binaries()
            .map_err(status)?
            .into_iter()
            .nth(slot)
            .filter(|binary| !binary.is_empty())
            .ok_or(Status::INVALID_PROGRAM_EXECUTABLE)
    }

    fn release_program(&self, program: ProgramId) -> Result<(), Status> {
        self.state.lock().programs.remove(&program).map(|_| ()).ok_or(Status::INVALID_PROGRAM)
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId, Status> {
        let mut st = self.state.lock();
        let prog = st.programs.get(&program).ok_or(Status::INVALID_PROGRAM)?;
        if prog.built_for.is_none() {
            return Err(Status::INVALID_PROGRAM_EXECUTABLE);
        }
        let context = prog.context;
        let kernel = Kernel::create(&prog.program, name).map_err(status)?;
        let id = KernelId(st.next_id());
        st.kernels.insert(
            id,
            KernelState {
                program,
                context,
                kernel,
            },
        );
        Ok(id)
    }

    fn kernel_num_args(&self, kernel: KernelId) -> Result<usize, Status> {
        let st = self.state.lock();
        let k = st.kernels.get(&kernel).ok_or(Status::INVALID_KERNEL)?;
        k.kernel.num_args().map(|n| n as usize).map_err(status)
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: usize, value: ArgValue<'_>) -> Result<(), Status> {
        let index = cl_uint::try_from(index).map_err(|_| Status::INVALID_ARG_INDEX)?;
        let st = self.state.lock();
        let k = st.kernels.get(&kernel).ok_or(Status::INVALID_KERNEL)?;
        match value {
            ArgValue::Mem(mem) => {
                let m = st.mems.get(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
                if m.context != k.context {
                    return Err(Status::INVALID_MEM_OBJECT);
                }
                // SAFETY: the handle is a live buffer of the kernel's context.
                unsafe { k.kernel.set_arg(index, &m.buffer.get()) }.map_err(status)
            }
            // SAFETY: the runtime copies `bytes.len()` bytes before returning.
            ArgValue::Bytes(bytes) => unsafe {
                k.kernel.set_arg_raw(index, bytes.len(), bytes.as_ptr().cast::<c_void>())
            }
            .map_err(status),
        }
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<(), Status> {
        self.state.lock().kernels.remove(&kernel).map(|_| ()).ok_or(Status::INVALID_KERNEL)
    }

    fn create_buffer(
        &self,
        context: ContextId,
        access: MemAccess,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> Result<MemId, Status> {
        if size == 0 {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        if host_data.is_some_and(|data| data.len() != size) {
            return Err(Status::INVALID_HOST_PTR);
        }
        let mut st = self.state.lock();
        let ctx = st.contexts.get(&context).ok_or(Status::INVALID_CONTEXT)?;
        let host_ptr = host_data.map_or(ptr::null_mut(), |data| data.as_ptr().cast_mut().cast::<c_void>());
        // SAFETY: with CL_MEM_COPY_HOST_PTR the runtime only reads `size`
        // bytes from `host_ptr` during the call.
        let buffer = unsafe { Buffer::<u8>::create(&ctx.context, mem_flags(access, host_data.is_some()), size, host_ptr) }
            .map_err(status)?;
        let id = MemId(st.next_id());
        st.mems.insert(
            id,
            MemState {
                context,
                buffer,
                size,
                maps: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn release_mem_object(&self, mem: MemId) -> Result<(), Status> {
        self.state.lock().mems.remove(&mem).map(|_| ()).ok_or(Status::INVALID_MEM_OBJECT)
    }

    fn enqueue_fill_buffer(
        &self,
        queue: QueueId,
        mem: MemId,
        pattern: &[u8],
        offset: usize,
        size: usize,
    ) -> Result<(), Status> {
        let mut st = self.state.lock();
        let State { queues, mems, .. } = &mut *st;
        let q = queues.get(&queue).ok_or(Status::INVALID_COMMAND_QUEUE)?;
        let m = mems.get_mut(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
        if m.context != q.context {
            return Err(Status::INVALID_CONTEXT);
        }
        // SAFETY: the runtime validates the pattern and region.
        let event = unsafe { q.queue.enqueue_fill_buffer(&mut m.buffer, pattern, offset, size, &[]) }.map_err(status)?;
        event.wait().map_err(status)
    }

    fn enqueue_map_buffer(
        &self,
        queue: QueueId,
        mem: MemId,
        _blocking: bool,
        access: MapAccess,
        offset: usize,
        size: usize,
    ) -> Result<HostRegion, Status> {
        let mut st = self.state.lock();
        let q = st.queue(queue)?;
        let m = st.mems.get(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
        if m.context != q.context {
            return Err(Status::INVALID_CONTEXT);
        }
        Self::check_region(m.size, offset, size)?;
        let mut bytes = vec![0u8; size];
        // SAFETY: blocking read into a host slice of exactly `size` bytes.
        unsafe { q.queue.enqueue_read_buffer(&m.buffer, CL_BLOCKING, offset, &mut bytes, &[]) }.map_err(status)?;

        let token = st.next_id();
        st.mems
            .get_mut(&mem)
            .ok_or(Status::INVALID_MEM_OBJECT)?
            .maps
            .insert(token, (offset, size, access));
        Ok(HostRegion {
            token,
            offset,
            access,
            bytes,
        })
    }

    fn enqueue_unmap_mem_object(&self, queue: QueueId, mem: MemId, region: HostRegion) -> Result<(), Status> {
        let mut st = self.state.lock();
        let State { queues, mems, .. } = &mut *st;
        let q = queues.get(&queue).ok_or(Status::INVALID_COMMAND_QUEUE)?;
        let m = mems.get_mut(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
        if m.context != q.context {
            return Err(Status::INVALID_CONTEXT);
        }
        match m.maps.get(&region.token) {
            Some(&(offset, len, _)) if offset == region.offset && len == region.bytes.len() => {}
            _ => return Err(Status::INVALID_VALUE),
        }
        let Some((offset, _, access)) = m.maps.remove(&region.token) else {
            return Err(Status::INVALID_VALUE);
        };
        if access.writes_back() {
            // SAFETY: blocking write of a region validated at map time.
            unsafe { q.queue.enqueue_write_buffer(&mut m.buffer, CL_BLOCKING, offset, &region.bytes, &[]) }
                .map_err(status)?;
        }
        Ok(())
    }

    fn enqueue_nd_range_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<(), Status> {
        let dims = cl_uint::try_from(global.len())
            .ok()
            .filter(|d| (1..=3).contains(d))
            .ok_or(Status::INVALID_WORK_DIMENSION)?;
        if local.is_some_and(|l| l.len() != global.len()) {
            return Err(Status::INVALID_WORK_DIMENSION);
        }
        if global.iter().try_fold(1usize, |acc, &g| acc.checked_mul(g)).is_none() {
            return Err(Status::INVALID_GLOBAL_WORK_SIZE);
        }
        let st = self.state.lock();
        let q = st.queue(queue)?;
        let k = st.kernels.get(&kernel).ok_or(Status::INVALID_KERNEL)?;
        if k.context != q.context {
            return Err(Status::INVALID_CONTEXT);
        }
        let local_ptr = local.map_or(ptr::null(), <[usize]>::as_ptr);
        // SAFETY: `global` and `local` hold `dims` sizes each and outlive the
        // call; arguments were bound through `set_kernel_arg`.
        let event = unsafe {
            q.queue
                .enqueue_nd_range_kernel(k.kernel.get(), dims, ptr::null(), global.as_ptr(), local_ptr, &[])
        }
        .map_err(status)?;
        debug!(?global, ?local, "OpenCL dispatch");
        drop(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_types_map_to_classes() {
        assert_eq!(class_of(CL_DEVICE_TYPE_GPU), Some(DeviceClass::Gpu));
        assert_eq!(class_of(CL_DEVICE_TYPE_CPU), Some(DeviceClass::Cpu));
        assert_eq!(class_of(CL_DEVICE_TYPE_ACCELERATOR), Some(DeviceClass::Accelerator));
        assert_eq!(class_of(0), None);
    }

    #[test]
    fn access_flags() {
        assert_eq!(mem_flags(MemAccess::ReadOnly, false), CL_MEM_READ_ONLY);
        assert_eq!(mem_flags(MemAccess::WriteOnly, false), CL_MEM_WRITE_ONLY);
        let flags = mem_flags(MemAccess::ReadWrite, true);
        assert_ne!(flags & CL_MEM_READ_WRITE, 0);
        assert_ne!(flags & CL_MEM_COPY_HOST_PTR, 0);
    }

    #[test]
    fn queue_property_flags() {
        assert_eq!(queue_flags(QueueProperties::default()), 0);
        let both = queue_flags(QueueProperties {
            out_of_order: true,
            profiling: true,
        });
        assert_ne!(both & CL_QUEUE_PROFILING_ENABLE, 0);
        assert_ne!(both & CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE, 0);
    }

    #[test]
    fn map_regions() {
        assert_eq!(OpenClDriver::check_region(16, 0, 16), Ok(()));
        assert_eq!(OpenClDriver::check_region(16, 4, 0), Err(Status::INVALID_VALUE));
        assert_eq!(OpenClDriver::check_region(16, 8, 9), Err(Status::INVALID_VALUE));
        assert_eq!(OpenClDriver::check_region(16, usize::MAX, 2), Err(Status::INVALID_VALUE));
    }

    #[test]
    fn notify_reaches_the_hook() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let hook: ContextNotify = Arc::new(move |msg| {
            assert_eq!(msg, "CL_OUT_OF_RESOURCES on enqueue");
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let boxed = Box::new(hook);
        let user_data = ptr::from_ref::<ContextNotify>(&*boxed).cast_mut().cast::<c_void>();
        let msg = c"CL_OUT_OF_RESOURCES on enqueue";
        unsafe {
            notify_trampoline(msg.as_ptr(), ptr::null(), 0, user_data);
            notify_trampoline(ptr::null(), ptr::null(), 0, user_data);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enumerate_does_not_panic() {
        let driver = OpenClDriver::new();
        match driver.platform_ids() {
            Ok(ids) => {
                for id in ids {
                    assert!(driver.platform_name(id).is_ok());
                }
            }
            Err(status) => assert_eq!(status, Status::PLATFORM_NOT_FOUND_KHR),
        }
    }
}
