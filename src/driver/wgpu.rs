//! GPU driver using WGPU + WGSL.
//!
//! Maps the [`Driver`] boundary onto `wgpu`:
//!
//! - **platforms** are wgpu backends (Vulkan, Metal, DX12, GL) that expose at
//!   least one adapter;
//! - **devices** are adapters, classed by their [`wgpu::DeviceType`];
//! - a **context** opens one `wgpu::Device`/`wgpu::Queue` pair on the first
//!   adapter of the requested class, and forwards uncaptured device errors to
//!   the context's error hook;
//! - **programs** are WGSL modules, compiled inside a validation error scope;
//!   the build log is rendered from the module's compilation messages;
//! - **kernels** are `@compute` entry points. Their argument slots are the
//!   `@group(0)` bindings in binding order: `var<storage>` slots take
//!   buffers, `var<uniform>` slots take raw bytes;
//! - **maps** copy through staging buffers and always complete before
//!   returning; writes are uploaded on unmap;
//! - `finish` waits for the device to go idle.
//!
//! Kernel interfaces come from parsing the module with `naga`; WGSL syntax
//! errors are reported from that parse, validation errors from `wgpu`.
//!
//! The work-group size of a kernel is fixed by its `@workgroup_size`
//! attribute. An explicit local size must match it and divide the global
//! size. Without one the dispatch covers the global size with
//! `ceil(global / workgroup_size)` groups, so kernels must bounds-check their
//! invocation ids.

use super::{
    ArgValue, ContextId, ContextNotify, DeviceClass, DeviceId, DeviceInfo, Driver, HostRegion,
    KernelId, MapAccess, MemAccess, MemId, PlatformId, ProgramId, QueueId, QueueProperties,
    SourceDialect,
};
use crate::diagnostics::Status;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

lazy_static::lazy_static! {
    static ref INSTANCE: wgpu::Instance = wgpu::Instance::default();
}

const BINARY_MAGIC: &[u8; 8] = b"BRWGSL\0\0";
const COPY_ALIGN: usize = wgpu::COPY_BUFFER_ALIGNMENT as usize;
/// Invocation ids are `u32`.
const MAX_GLOBAL_WORK_ITEMS: usize = u32::MAX as usize;

// ── WGSL interface ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingClass {
    Storage { read_only: bool },
    Uniform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    binding: u32,
    name: String,
    class: BindingClass,
    /// Byte size a uniform argument must have; zero for storage slots.
    uniform_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryPoint {
    name: String,
    workgroup_size: [u32; 3],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Interface {
    bindings: Vec<Binding>,
    entry_points: Vec<EntryPoint>,
}

/// Parses a WGSL module and extracts its `@group(0)` buffer bindings (in
/// binding order) and `@compute` entry points. A parse failure comes back as
/// a rendered diagnostic.
fn parse_interface(source: &str) -> Result<Interface, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|err| err.emit_to_string(source))?;
    let mut iface = Interface::default();

    for (_, var) in module.global_variables.iter() {
        let Some(binding) = var.binding.as_ref().filter(|b| b.group == 0) else {
            continue;
        };
        let name = var.name.clone().unwrap_or_default();
        let (class, uniform_size) = match var.space {
            naga::AddressSpace::Storage { access } => (
                BindingClass::Storage {
                    read_only: !access.contains(naga::StorageAccess::STORE),
                },
                0,
            ),
            naga::AddressSpace::Uniform => {
                let size = module.types[var.ty].inner.size(module.to_ctx()) as usize;
                (BindingClass::Uniform, size)
            }
            space => {
                debug!(binding = binding.binding, %name, ?space, "non-buffer binding skipped");
                continue;
            }
        };
        iface.bindings.push(Binding {
            binding: binding.binding,
            name,
            class,
            uniform_size,
        });
    }
    iface.bindings.sort_by_key(|b| b.binding);

    iface.entry_points = module
        .entry_points
        .iter()
        .filter(|e| e.stage == naga::ShaderStage::Compute)
        .map(|e| EntryPoint {
            name: e.name.clone(),
            workgroup_size: e.workgroup_size,
        })
        .collect();
    Ok(iface)
}

/// Work-group counts that cover `global` with a kernel whose work-group size
/// is fixed at `workgroup_size`.
///
/// An explicit `local` must equal the fixed size and divide `global`. Without
/// one the counts round up, and the kernel bounds-checks its ids.
fn workgroup_counts(
    global: &[usize],
    local: Option<&[usize]>,
    workgroup_size: [u32; 3],
    max_groups: u32,
    max_items: usize,
) -> Result<[u32; 3], Status> {
    let dims = global.len();
    if !(1..=3).contains(&dims) {
        return Err(Status::INVALID_WORK_DIMENSION);
    }
    if global.contains(&0) {
        return Err(Status::INVALID_GLOBAL_WORK_SIZE);
    }
    if let Some(local) = local {
        if local.len() != dims {
            return Err(Status::INVALID_WORK_DIMENSION);
        }
        let fixed = workgroup_size.iter().map(|&w| w as usize);
        if local.iter().zip(fixed).any(|(&l, w)| l != w)
            || global.iter().zip(local).any(|(g, l)| g % l != 0)
        {
            return Err(Status::INVALID_WORK_GROUP_SIZE);
        }
    }
    global
        .iter()
        .try_fold(1usize, |acc, &g| acc.checked_mul(g))
        .filter(|&total| total <= max_items)
        .ok_or(Status::INVALID_GLOBAL_WORK_SIZE)?;

    let mut groups = [1u32; 3];
    for (dim, &g) in global.iter().enumerate() {
        let n = g.div_ceil(workgroup_size[dim].max(1) as usize);
        groups[dim] = u32::try_from(n)
            .ok()
            .filter(|&n| n <= max_groups)
            .ok_or(Status::INVALID_GLOBAL_WORK_SIZE)?;
    }
    Ok(groups)
}

fn render_log(source: &str, info: &wgpu::CompilationInfo, scope_error: Option<&wgpu::Error>) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let mut log = String::new();
    let mut errors = 0usize;
    for msg in &info.messages {
        let severity = match msg.message_type {
            wgpu::CompilationMessageType::Error => {
                errors += 1;
                "error"
            }
            wgpu::CompilationMessageType::Warning => "warning",
            wgpu::CompilationMessageType::Info => "note",
        };
        match &msg.location {
            Some(loc) => {
                let _ = writeln!(
                    log,
                    "<source>:{}:{}: {severity}: {}",
                    loc.line_number, loc.line_position, msg.message
                );
                let line = loc.line_number.saturating_sub(1) as usize;
                if let Some(text) = lines.get(line) {
                    let caret = " ".repeat(loc.line_position.saturating_sub(1) as usize);
                    let _ = writeln!(log, "{text}\n{caret}^");
                }
            }
            None => {
                let _ = writeln!(log, "<source>: {severity}: {}", msg.message);
            }
        }
    }
    if let Some(err) = scope_error {
        if errors == 0 {
            errors = 1;
            let _ = writeln!(log, "<source>: error: {err}");
        }
    }
    if errors > 0 {
        let plural = if errors == 1 { "" } else { "s" };
        let _ = writeln!(log, "{errors} error{plural} generated.");
    }
    log
}

fn encode_binary(source: &str) -> Vec<u8> {
    let mut out = BINARY_MAGIC.to_vec();
    out.extend_from_slice(source.as_bytes());
    out
}

fn decode_binary(binary: &[u8]) -> Option<String> {
    let body = binary.strip_prefix(BINARY_MAGIC.as_slice())?;
    String::from_utf8(body.to_vec()).ok().filter(|s| !s.is_empty())
}

// ── Driver state ────────────────────────────────────────────────────────────

struct Gpu {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl Gpu {
    fn wait(&self) -> Result<(), Status> {
        self.device.poll(wgpu::PollType::Wait).map(|_| ()).map_err(|err| {
            warn!(%err, "device poll failed");
            Status::OUT_OF_RESOURCES
        })
    }

    /// Reads `len` bytes at `offset`, widening the copy to the required
    /// alignment.
    fn read(&self, buffer: &wgpu::Buffer, offset: usize, len: usize) -> Result<Vec<u8>, Status> {
        let start = offset - offset % COPY_ALIGN;
        let end = (offset + len).next_multiple_of(COPY_ALIGN);
        let span = (end - start) as u64;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: span,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("read_encoder") });
        encoder.copy_buffer_to_buffer(buffer, start as u64, &staging, 0, span);
        self.queue.submit(Some(encoder.finish()));

        let (tx, rx) = std::sync::mpsc::channel();
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait()?;
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => return Err(Status::MAP_FAILURE),
        }
        let data = slice.get_mapped_range();
        let out = data[offset - start..offset - start + len].to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }

    /// Writes `bytes` at `offset`, merging unaligned edges with the current
    /// contents.
    fn write(&self, buffer: &wgpu::Buffer, offset: usize, bytes: &[u8]) -> Result<(), Status> {
        if offset % COPY_ALIGN == 0 && bytes.len() % COPY_ALIGN == 0 {
            self.queue.write_buffer(buffer, offset as u64, bytes);
            return Ok(());
        }
        let start = offset - offset % COPY_ALIGN;
        let end = (offset + bytes.len()).next_multiple_of(COPY_ALIGN);
        let mut merged = self.read(buffer, start, end - start)?;
        merged[offset - start..offset - start + bytes.len()].copy_from_slice(bytes);
        self.queue.write_buffer(buffer, start as u64, &merged);
        Ok(())
    }
}

struct PlatformEntry {
    id: PlatformId,
    name: String,
    devices: Vec<DeviceId>,
}

struct AdapterEntry {
    adapter: wgpu::Adapter,
    info: DeviceInfo,
}

struct ContextState {
    device: DeviceId,
    gpu: Arc<Gpu>,
}

struct ProgramState {
    context: ContextId,
    source: String,
    log: Option<(DeviceId, String)>,
    module: Option<(wgpu::ShaderModule, Interface)>,
}

enum Bound {
    Mem(MemId),
    Bytes(Vec<u8>),
}

struct KernelState {
    program: ProgramId,
    context: ContextId,
    name: String,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    bindings: Vec<Binding>,
    workgroup_size: [u32; 3],
    args: Vec<Option<Bound>>,
}

struct MemState {
    context: ContextId,
    buffer: wgpu::Buffer,
    size: usize,
    maps: HashMap<u64, (usize, usize, MapAccess)>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    contexts: HashMap<ContextId, ContextState>,
    queues: HashMap<QueueId, ContextId>,
    programs: HashMap<ProgramId, ProgramState>,
    kernels: HashMap<KernelId, KernelState>,
    mems: HashMap<MemId, MemState>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn gpu(&self, context: ContextId) -> Result<Arc<Gpu>, Status> {
        self.contexts
            .get(&context)
            .map(|c| Arc::clone(&c.gpu))
            .ok_or(Status::INVALID_CONTEXT)
    }

    fn queue_gpu(&self, queue: QueueId) -> Result<(ContextId, Arc<Gpu>), Status> {
        let context = *self.queues.get(&queue).ok_or(Status::INVALID_COMMAND_QUEUE)?;
        Ok((context, self.gpu(context)?))
    }
}

fn classify(device_type: wgpu::DeviceType) -> DeviceClass {
    match device_type {
        wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu | wgpu::DeviceType::VirtualGpu => {
            DeviceClass::Gpu
        }
        wgpu::DeviceType::Cpu => DeviceClass::Cpu,
        wgpu::DeviceType::Other => DeviceClass::Accelerator,
    }
}

/// Driver backed by `wgpu`.
pub struct WgpuDriver {
    platforms: Vec<PlatformEntry>,
    adapters: HashMap<DeviceId, AdapterEntry>,
    state: Mutex<State>,
}

impl WgpuDriver {
    /// Enumerates every adapter on every backend of the process-wide
    /// instance.
    #[must_use]
    pub fn new() -> Self {
        let mut next = 0u64;
        let mut platforms: Vec<PlatformEntry> = Vec::new();
        let mut adapters = HashMap::new();
        for adapter in INSTANCE.enumerate_adapters(wgpu::Backends::all()) {
            let info = adapter.get_info();
            let limits = adapter.limits();
            let name = format!("wgpu {:?}", info.backend);
            let platform = match platforms.iter().position(|p| p.name == name) {
                Some(i) => i,
                None => {
                    next += 1;
                    platforms.push(PlatformEntry {
                        id: PlatformId(next),
                        name,
                        devices: Vec::new(),
                    });
                    platforms.len() - 1
                }
            };
            next += 1;
            let id = DeviceId(next);
            debug!(adapter = %info.name, backend = ?info.backend, kind = ?info.device_type, "adapter found");
            platforms[platform].devices.push(id);
            adapters.insert(
                id,
                AdapterEntry {
                    info: DeviceInfo {
                        name: info.name.clone(),
                        vendor: format!("{:#06x}", info.vendor),
                        class: classify(info.device_type),
                        compute_units: 1,
                        max_work_group_size: limits.max_compute_invocations_per_workgroup as usize,
                        max_work_item_sizes: [
                            limits.max_compute_workgroup_size_x as usize,
                            limits.max_compute_workgroup_size_y as usize,
                            limits.max_compute_workgroup_size_z as usize,
                        ],
                        max_global_work_items: MAX_GLOBAL_WORK_ITEMS,
                        global_mem_bytes: limits.max_buffer_size,
                    },
                    adapter,
                },
            );
        }
        Self {
            platforms,
            adapters,
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for WgpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WgpuDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuDriver")
            .field("platforms", &self.platforms.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

impl Driver for WgpuDriver {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn source_dialect(&self) -> SourceDialect {
        SourceDialect::Wgsl
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
        let device = plat
            .devices
            .iter()
            .copied()
            .find(|d| self.adapters.get(d).is_some_and(|a| a.info.class == class))
            .ok_or(Status::DEVICE_NOT_FOUND)?;
        let entry = self.adapters.get(&device).ok_or(Status::INVALID_DEVICE)?;

        let (device_handle, queue) = pollster::block_on(entry.adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_cl"),
            required_features: wgpu::Features::empty(),
            required_limits: entry.adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| {
            warn!(%err, "request_device failed");
            Status::DEVICE_NOT_AVAILABLE
        })?;
        if let Some(hook) = notify {
            device_handle.on_uncaptured_error(Box::new(move |err: wgpu::Error| hook(&err.to_string())));
        }

        let mut st = self.state.lock();
        let id = ContextId(st.next_id());
        st.contexts.insert(
            id,
            ContextState {
                device,
                gpu: Arc::new(Gpu {
                    device: device_handle,
                    queue,
                }),
            },
        );
        info!(device = %entry.info.name, "wgpu device opened");
        Ok(id)
    }

    fn context_num_devices(&self, context: ContextId) -> Result<usize, Status> {
        self.state.lock().contexts.get(&context).map(|_| 1).ok_or(Status::INVALID_CONTEXT)
    }

    fn context_devices(&self, context: ContextId) -> Result<Vec<DeviceId>, Status> {
        self.state
            .lock()
            .contexts
            .get(&context)
            .map(|c| vec![c.device])
            .ok_or(Status::INVALID_CONTEXT)
    }

    fn release_context(&self, context: ContextId) -> Result<(), Status> {
        self.state.lock().contexts.remove(&context).map(|_| ()).ok_or(Status::INVALID_CONTEXT)
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo, Status> {
        self.adapters
            .get(&device)
            .map(|a| a.info.clone())
            .ok_or(Status::INVALID_DEVICE)
    }

    fn create_command_queue(
        &self,
        context: ContextId,
        device: DeviceId,
        properties: QueueProperties,
    ) -> Result<QueueId, Status> {
        let mut st = self.state.lock();
        let ctx = st.contexts.get(&context).ok_or(Status::INVALID_CONTEXT)?;
        if ctx.device != device {
            return Err(Status::INVALID_DEVICE);
        }
        if properties.out_of_order || properties.profiling {
            return Err(Status::INVALID_QUEUE_PROPERTIES);
        }
        let id = QueueId(st.next_id());
        st.queues.insert(id, context);
        Ok(id)
    }

    fn finish(&self, queue: QueueId) -> Result<(), Status> {
        let (_, gpu) = self.state.lock().queue_gpu(queue)?;
        gpu.wait()
    }

    fn flush(&self, queue: QueueId) -> Result<(), Status> {
        let (_, gpu) = self.state.lock().queue_gpu(queue)?;
        gpu.device.poll(wgpu::PollType::Poll).map(|_| ()).map_err(|_| Status::OUT_OF_RESOURCES)
    }

    fn release_command_queue(&self, queue: QueueId) -> Result<(), Status> {
        self.state.lock().queues.remove(&queue).map(|_| ()).ok_or(Status::INVALID_COMMAND_QUEUE)
    }

    fn create_program_with_source(&self, context: ContextId, source: &str) -> Result<ProgramId, Status> {
        if source.is_empty() || source.contains('\0') {
            return Err(Status::INVALID_VALUE);
        }
        let mut st = self.state.lock();
        st.gpu(context)?;
        let id = ProgramId(st.next_id());
        st.programs.insert(
            id,
            ProgramState {
                context,
                source: source.to_owned(),
                log: None,
                module: None,
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
        let source = decode_binary(binary).ok_or(Status::INVALID_BINARY)?;
        {
            let st = self.state.lock();
            let ctx = st.contexts.get(&context).ok_or(Status::INVALID_CONTEXT)?;
            if ctx.device != device {
                return Err(Status::INVALID_DEVICE);
            }
        }
        self.create_program_with_source(context, &source)
    }

    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str) -> Result<(), Status> {
        if !options.trim().is_empty() {
            debug!(options, "build options are ignored for WGSL");
        }
        let (gpu, source) = {
            let st = self.state.lock();
            let prog = st.programs.get(&program).ok_or(Status::INVALID_PROGRAM)?;
            let ctx = st.contexts.get(&prog.context).ok_or(Status::INVALID_CONTEXT)?;
            if ctx.device != device {
                return Err(Status::INVALID_DEVICE);
            }
            if st.kernels.values().any(|k| k.program == program) {
                return Err(Status::INVALID_OPERATION);
            }
            (Arc::clone(&ctx.gpu), prog.source.clone())
        };

        let iface = match parse_interface(&source) {
            Ok(iface) => iface,
            Err(diagnostic) => {
                let mut st = self.state.lock();
                let prog = st.programs.get_mut(&program).ok_or(Status::INVALID_PROGRAM)?;
                prog.log = Some((device, format!("{diagnostic}1 error generated.\n")));
                prog.module = None;
                return Err(Status::BUILD_PROGRAM_FAILURE);
            }
        };

        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("briny_cl_program"),
            source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
        });
        let scope_error = pollster::block_on(gpu.device.pop_error_scope());
        let compilation = pollster::block_on(module.get_compilation_info());
        let failed = scope_error.is_some()
            || compilation
                .messages
                .iter()
                .any(|m| m.message_type == wgpu::CompilationMessageType::Error);
        let log = render_log(&source, &compilation, scope_error.as_ref());

        let mut st = self.state.lock();
        let prog = st.programs.get_mut(&program).ok_or(Status::INVALID_PROGRAM)?;
        prog.log = Some((device, log));
        if failed {
            prog.module = None;
            return Err(Status::BUILD_PROGRAM_FAILURE);
        }
        prog.module = Some((module, iface));
        Ok(())
    }

    fn program_build_log(
        &self,
        program: ProgramId,
        device: DeviceId,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let st = self.state.lock();
        let prog = st.programs.get(&program).ok_or(Status::INVALID_PROGRAM)?;
        let log = prog
            .log
            .as_ref()
            .filter(|(d, _)| *d == device)
            .map_or("", |(_, log)| log.as_str())
            .as_bytes();
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
        match (&prog.module, &prog.log) {
            (Some(_), Some((d, _))) if *d == device => Ok(encode_binary(&prog.source)),
            _ => Err(Status::INVALID_PROGRAM_EXECUTABLE),
        }
    }

    fn release_program(&self, program: ProgramId) -> Result<(), Status> {
        self.state.lock().programs.remove(&program).map(|_| ()).ok_or(Status::INVALID_PROGRAM)
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId, Status> {
        let (gpu, context, module, iface) = {
            let st = self.state.lock();
            let prog = st.programs.get(&program).ok_or(Status::INVALID_PROGRAM)?;
            let (module, iface) = prog.module.as_ref().ok_or(Status::INVALID_PROGRAM_EXECUTABLE)?;
            (st.gpu(prog.context)?, prog.context, module.clone(), iface.clone())
        };
        let entry = iface
            .entry_points
            .iter()
            .find(|e| e.name == name)
            .ok_or(Status::INVALID_KERNEL_NAME)?;

        let entries: Vec<wgpu::BindGroupLayoutEntry> = iface
            .bindings
            .iter()
            .map(|b| wgpu::BindGroupLayoutEntry {
                binding: b.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match b.class {
                        BindingClass::Storage { read_only } => wgpu::BufferBindingType::Storage { read_only },
                        BindingClass::Uniform => wgpu::BufferBindingType::Uniform,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let layout = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kernel_bgl"),
            entries: &entries,
        });
        let pipeline_layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kernel_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(name),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(gpu.device.pop_error_scope()) {
            warn!(kernel = name, %err, "compute pipeline rejected");
            return Err(Status::INVALID_KERNEL_DEFINITION);
        }

        let mut st = self.state.lock();
        let id = KernelId(st.next_id());
        st.kernels.insert(
            id,
            KernelState {
                program,
                context,
                name: name.to_owned(),
                pipeline,
                layout,
                args: iface.bindings.iter().map(|_| None).collect(),
                bindings: iface.bindings,
                workgroup_size: entry.workgroup_size,
            },
        );
        Ok(id)
    }

    fn kernel_num_args(&self, kernel: KernelId) -> Result<usize, Status> {
        self.state
            .lock()
            .kernels
            .get(&kernel)
            .map(|k| k.bindings.len())
            .ok_or(Status::INVALID_KERNEL)
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: usize, value: ArgValue<'_>) -> Result<(), Status> {
        let mut st = self.state.lock();
        let k = st.kernels.get(&kernel).ok_or(Status::INVALID_KERNEL)?;
        let binding = k.bindings.get(index).ok_or(Status::INVALID_ARG_INDEX)?;
        let bound = match (binding.class, value) {
            (BindingClass::Storage { .. }, ArgValue::Mem(mem)) => {
                let m = st.mems.get(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
                if m.context != k.context {
                    return Err(Status::INVALID_MEM_OBJECT);
                }
                Bound::Mem(mem)
            }
            (BindingClass::Uniform, ArgValue::Bytes(bytes)) => {
                if bytes.len() != binding.uniform_size {
                    return Err(Status::INVALID_ARG_SIZE);
                }
                Bound::Bytes(bytes.to_vec())
            }
            (BindingClass::Storage { .. }, ArgValue::Bytes(_)) => return Err(Status::INVALID_ARG_SIZE),
            (BindingClass::Uniform, ArgValue::Mem(_)) => return Err(Status::INVALID_ARG_VALUE),
        };
        if let Some(slot) = st.kernels.get_mut(&kernel).and_then(|k| k.args.get_mut(index)) {
            *slot = Some(bound);
        }
        Ok(())
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
        let mut st = self.state.lock();
        let gpu = st.gpu(context)?;
        if size == 0 || size as u64 > gpu.device.limits().max_buffer_size {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        let padded = size.next_multiple_of(COPY_ALIGN);
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        let label = format!("briny_cl_{access:?}");
        let buffer = match host_data {
            Some(data) if data.len() == size => {
                let mut contents = data.to_vec();
                contents.resize(padded, 0);
                gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(&label),
                    contents: &contents,
                    usage,
                })
            }
            Some(_) => return Err(Status::INVALID_HOST_PTR),
            None => gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&label),
                size: padded as u64,
                usage,
                mapped_at_creation: false,
            }),
        };
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
        let state = self.state.lock().mems.remove(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
        state.buffer.destroy();
        Ok(())
    }

    fn enqueue_fill_buffer(
        &self,
        queue: QueueId,
        mem: MemId,
        pattern: &[u8],
        offset: usize,
        size: usize,
    ) -> Result<(), Status> {
        let p = pattern.len();
        if !p.is_power_of_two() || p > 128 || offset % p != 0 || size % p != 0 {
            return Err(Status::INVALID_VALUE);
        }
        let (gpu, buffer, len) = self.resolve(queue, mem)?;
        if offset.checked_add(size).is_none_or(|end| end > len) {
            return Err(Status::INVALID_VALUE);
        }
        let bytes: Vec<u8> = pattern.iter().copied().cycle().take(size).collect();
        gpu.write(&buffer, offset, &bytes)
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
        let (gpu, buffer, len) = self.resolve(queue, mem)?;
        if size == 0 || offset.checked_add(size).is_none_or(|end| end > len) {
            return Err(Status::INVALID_VALUE);
        }
        let bytes = gpu.read(&buffer, offset, size)?;
        let mut st = self.state.lock();
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
        let (gpu, buffer, _) = self.resolve(queue, mem)?;
        let record = {
            let mut st = self.state.lock();
            let state = st.mems.get_mut(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
            match state.maps.get(&region.token) {
                Some(&(offset, len, _)) if offset == region.offset && len == region.bytes.len() => {}
                _ => return Err(Status::INVALID_VALUE),
            }
            state.maps.remove(&region.token)
        };
        match record {
            Some((offset, _, access)) if access.writes_back() => gpu.write(&buffer, offset, &region.bytes),
            _ => Ok(()),
        }
    }

    fn enqueue_nd_range_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<(), Status> {
        let st = self.state.lock();
        let (context, gpu) = st.queue_gpu(queue)?;
        let k = st.kernels.get(&kernel).ok_or(Status::INVALID_KERNEL)?;
        if k.context != context {
            return Err(Status::INVALID_CONTEXT);
        }
        let limits = gpu.device.limits();
        let groups = workgroup_counts(
            global,
            local,
            k.workgroup_size,
            limits.max_compute_workgroups_per_dimension,
            MAX_GLOBAL_WORK_ITEMS,
        )?;

        let mut uniforms = Vec::new();
        let mut buffers = Vec::with_capacity(k.args.len());
        for (binding, arg) in k.bindings.iter().zip(&k.args) {
            match arg {
                None => return Err(Status::INVALID_KERNEL_ARGS),
                Some(Bound::Mem(mem)) => {
                    let m = st.mems.get(mem).ok_or(Status::INVALID_MEM_OBJECT)?;
                    buffers.push((binding.binding, m.buffer.clone()));
                }
                Some(Bound::Bytes(bytes)) => {
                    let mut contents = bytes.clone();
                    contents.resize(bytes.len().next_multiple_of(16), 0);
                    let buffer = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("kernel_uniform"),
                        contents: &contents,
                        usage: wgpu::BufferUsages::UNIFORM,
                    });
                    uniforms.push(binding.binding);
                    buffers.push((binding.binding, buffer));
                }
            }
        }
        let entries: Vec<wgpu::BindGroupEntry<'_>> = buffers
            .iter()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_bind_group"),
            layout: &k.layout,
            entries: &entries,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(&k.name) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&k.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&k.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        debug!(kernel = %k.name, ?groups, uniforms = uniforms.len(), "wgpu dispatch");
        drop(st);
        gpu.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}

impl WgpuDriver {
    fn resolve(&self, queue: QueueId, mem: MemId) -> Result<(Arc<Gpu>, wgpu::Buffer, usize), Status> {
        let st = self.state.lock();
        let (context, gpu) = st.queue_gpu(queue)?;
        let m = st.mems.get(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
        if m.context != context {
            return Err(Status::INVALID_CONTEXT);
        }
        Ok((gpu, m.buffer.clone(), m.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHADER: &str = r"
// two inputs, one output
struct Params {
    n: u32,
    scale: f32,
}

@group(0) @binding(2) var<storage, read_write> dst: array<f32>;
@binding(0) @group(0) var<storage, read> a: array<f32>;
@group(0)
@binding(1) var<storage> b: array<f32>;
@group(0) @binding(3) var<uniform> n: u32;
@group(0) @binding(4) var<uniform> params: Params;
@group(1) @binding(0) var<uniform> ignored: vec4<f32>;

/* @compute @workgroup_size(1) fn hidden() {} */
@compute @workgroup_size(64, 2u)
fn vector_add(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < n) { dst[id.x] = a[id.x] + b[id.x]; }
}

// @compute @workgroup_size(4) fn also_hidden() {}
@compute
@workgroup_size(8, 8, 1)
fn tile(@builtin(global_invocation_id) id: vec3<u32>) {
    dst[id.x + id.y] = params.scale;
}
";

    #[test]
    fn parses_bindings_in_order() {
        let iface = parse_interface(SHADER).unwrap();
        let names: Vec<_> = iface.bindings.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "dst", "n", "params"]);
        assert_eq!(iface.bindings[0].class, BindingClass::Storage { read_only: true });
        assert_eq!(iface.bindings[1].class, BindingClass::Storage { read_only: true });
        assert_eq!(iface.bindings[2].class, BindingClass::Storage { read_only: false });
        assert_eq!(iface.bindings[3].class, BindingClass::Uniform);
        assert_eq!(iface.bindings[3].uniform_size, 4);
        assert_eq!(iface.bindings[4].uniform_size, 8);
    }

    #[test]
    fn parses_entry_points() {
        let iface = parse_interface(SHADER).unwrap();
        assert_eq!(
            iface.entry_points,
            vec![
                EntryPoint {
                    name: "vector_add".into(),
                    workgroup_size: [64, 2, 1],
                },
                EntryPoint {
                    name: "tile".into(),
                    workgroup_size: [8, 8, 1],
                },
            ]
        );
    }

    #[test]
    fn sample_kernels_parse() {
        let iface = parse_interface(crate::samples::CONVOLUTION_WGSL).unwrap();
        assert_eq!(iface.bindings.len(), 5);
        assert_eq!(iface.bindings[3].uniform_size, 4);
        assert_eq!(iface.entry_points[0].workgroup_size, [2, 2, 1]);

        let iface = parse_interface(crate::samples::VECTOR_ADD_WGSL).unwrap();
        assert_eq!(iface.entry_points[0].name, "vector_add");
        assert_eq!(iface.entry_points[0].workgroup_size, [64, 1, 1]);
    }

    #[test]
    fn syntax_errors_become_diagnostics() {
        let err = parse_interface("@compute @workgroup_size(1) fn broken( {}").unwrap_err();
        assert!(err.contains("error"), "{err}");
    }

    #[test]
    fn groups_cover_the_global_size() {
        let run = |g: &[usize], l: Option<&[usize]>| workgroup_counts(g, l, [64, 1, 1], 65_535, MAX_GLOBAL_WORK_ITEMS);
        assert_eq!(run(&[128], None), Ok([2, 1, 1]));
        assert_eq!(run(&[100], None), Ok([2, 1, 1]));
        assert_eq!(run(&[128, 3], None), Ok([2, 3, 1]));
        assert_eq!(run(&[128], Some(&[64])), Ok([2, 1, 1]));
    }

    #[test]
    fn explicit_local_sizes_must_match_and_divide() {
        let run = |g: &[usize], l: Option<&[usize]>| workgroup_counts(g, l, [64, 1, 1], 65_535, MAX_GLOBAL_WORK_ITEMS);
        assert_eq!(run(&[100], Some(&[64])), Err(Status::INVALID_WORK_GROUP_SIZE));
        assert_eq!(run(&[128], Some(&[32])), Err(Status::INVALID_WORK_GROUP_SIZE));
        assert_eq!(run(&[128], Some(&[64, 1])), Err(Status::INVALID_WORK_DIMENSION));
    }

    #[test]
    fn degenerate_geometry_is_rejected() {
        let run = |g: &[usize]| workgroup_counts(g, None, [8, 8, 1], 1024, MAX_GLOBAL_WORK_ITEMS);
        assert_eq!(run(&[]), Err(Status::INVALID_WORK_DIMENSION));
        assert_eq!(run(&[1, 1, 1, 1]), Err(Status::INVALID_WORK_DIMENSION));
        assert_eq!(run(&[8, 0]), Err(Status::INVALID_GLOBAL_WORK_SIZE));
        assert_eq!(run(&[usize::MAX, 2]), Err(Status::INVALID_GLOBAL_WORK_SIZE));
        // 1025 groups along x exceeds the per-dimension limit.
        assert_eq!(run(&[8 * 1025]), Err(Status::INVALID_GLOBAL_WORK_SIZE));
        assert_eq!(run(&[8 * 1024, 8]), Ok([1024, 1, 1]));
    }

    #[test]
    fn binary_container() {
        let bin = encode_binary(SHADER);
        assert_eq!(decode_binary(&bin).as_deref(), Some(SHADER));
        assert_eq!(decode_binary(b"garbage"), None);
        assert_eq!(decode_binary(BINARY_MAGIC), None);
    }
}
