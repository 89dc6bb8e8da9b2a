//! # CPU reference driver
//!
//! A complete in-process implementation of the [`Driver`] boundary. It
//! behaves like an OpenCL runtime with a configurable set of platforms and
//! devices, so every harness path (class fallback, queue probing, build
//! failures, argument validation, geometry checks, mapping) can run without
//! hardware.
//!
//! - Programs are OpenCL C. The reference front end (`compiler`) extracts
//!   kernel signatures and produces clang-style build logs; kernel bodies run
//!   as [`HostKernel`]s looked up by name in a [`KernelLibrary`].
//! - Commands complete at enqueue time, in submission order. Blocking and
//!   non-blocking maps therefore behave alike here; the harness still treats
//!   non-blocking maps as pending until the queue is finished.
//! - Work-items of one dispatch run in parallel on the `rayon` pool against a
//!   snapshot of the arguments. Their stores are committed in work-item order
//!   once the whole range has run.
//! - Kernel faults (out-of-bounds accesses, stores into `READ_ONLY` buffers)
//!   are reported through the context's error hook. The hook is never
//!   called with the driver's lock held.
//!
//! Every object creation and release is counted in a [`Ledger`], and any
//! operation can be made to fail once with [`ReferenceDriver::inject_fault`].
//!
//! ## Example
//!
//! ```
//! use briny_cl::driver::reference::{DeviceSpec, PlatformSpec, ReferenceDriver};
//! use briny_cl::driver::{DeviceClass, Driver};
//!
//! let driver = ReferenceDriver::builder()
//!     .platform(PlatformSpec::new("Test").device(DeviceSpec::cpu("Host CPU")))
//!     .build();
//! let platform = driver.platform_ids().unwrap()[0];
//! let ctx = driver.create_context_from_type(platform, DeviceClass::Cpu, None).unwrap();
//! assert_eq!(driver.context_num_devices(ctx).unwrap(), 1);
//! driver.release_context(ctx).unwrap();
//! assert!(driver.ledger().is_balanced());
//! ```

mod compiler;
mod kernels;

pub use kernels::{ArgView, HostKernel, KernelLibrary, Stores, WorkItem};

use self::compiler::{ParamKind, Signature};
use self::kernels::ArgData;
use super::{
    ArgValue, ContextId, ContextNotify, DeviceClass, DeviceId, DeviceInfo, Driver, HostRegion,
    KernelId, MapAccess, MemAccess, MemId, PlatformId, ProgramId, QueueId, QueueProperties,
    SourceDialect,
};
use crate::diagnostics::Status;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{debug, warn};

// ── Platform and device descriptions ────────────────────────────────────────

/// Work-items per dispatch every simulated device accepts unless overridden.
pub const DEFAULT_MAX_GLOBAL_WORK_ITEMS: usize = 1 << 28;

/// Description of one simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    info: DeviceInfo,
    available: bool,
    accepts_queues: bool,
}

impl DeviceSpec {
    fn with_class(name: &str, class: DeviceClass, limits: (u32, usize, [usize; 3], u64)) -> Self {
        let (compute_units, max_work_group_size, max_work_item_sizes, global_mem_bytes) = limits;
        let max_global_work_items = DEFAULT_MAX_GLOBAL_WORK_ITEMS;
        Self {
            info: DeviceInfo {
                name: name.to_owned(),
                vendor: "briny".to_owned(),
                class,
                compute_units,
                max_work_group_size,
                max_work_item_sizes,
                max_global_work_items,
                global_mem_bytes,
            },
            available: true,
            accepts_queues: true,
        }
    }

    /// A GPU: 256 work-items per group, `[256, 256, 64]` per dimension.
    #[must_use]
    pub fn gpu(name: &str) -> Self {
        Self::with_class(name, DeviceClass::Gpu, (16, 256, [256, 256, 64], 1 << 30))
    }

    /// A CPU with one compute unit per `rayon` worker.
    #[must_use]
    pub fn cpu(name: &str) -> Self {
        let units = u32::try_from(rayon::current_num_threads()).unwrap_or(u32::MAX);
        Self::with_class(name, DeviceClass::Cpu, (units, 1024, [1024, 1024, 1024], 2 << 30))
    }

    /// An accelerator: 128 work-items per group.
    #[must_use]
    pub fn accelerator(name: &str) -> Self {
        Self::with_class(name, DeviceClass::Accelerator, (4, 128, [128, 128, 128], 512 << 20))
    }

    /// Marks the device unavailable; contexts of its class fail with
    /// `CL_DEVICE_NOT_AVAILABLE` when no other device can serve them.
    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Makes every queue creation on this device fail with `CL_OUT_OF_RESOURCES`.
    #[must_use]
    pub fn rejecting_queues(mut self) -> Self {
        self.accepts_queues = false;
        self
    }

    /// Overrides the maximum work-group size.
    #[must_use]
    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.info.max_work_group_size = size;
        self
    }

    /// Overrides the per-dimension work-item limits.
    #[must_use]
    pub fn max_work_item_sizes(mut self, sizes: [usize; 3]) -> Self {
        self.info.max_work_item_sizes = sizes;
        self
    }

    /// Overrides the largest number of work-items one dispatch may launch.
    #[must_use]
    pub fn max_global_work_items(mut self, items: usize) -> Self {
        self.info.max_global_work_items = items;
        self
    }

    /// Overrides the global memory size (the largest allocation allowed).
    #[must_use]
    pub fn global_mem_bytes(mut self, bytes: u64) -> Self {
        self.info.global_mem_bytes = bytes;
        self
    }

    /// Overrides the vendor string.
    #[must_use]
    pub fn vendor(mut self, vendor: &str) -> Self {
        vendor.clone_into(&mut self.info.vendor);
        self
    }
}

/// Description of one simulated platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSpec {
    name: String,
    devices: Vec<DeviceSpec>,
}

impl PlatformSpec {
    /// A platform with no devices.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            devices: Vec::new(),
        }
    }

    /// One GPU followed by one CPU.
    #[must_use]
    pub fn standard() -> Self {
        Self::new("Briny Reference Platform")
            .device(DeviceSpec::gpu("Briny Reference GPU"))
            .device(DeviceSpec::cpu("Briny Reference CPU"))
    }

    /// Appends a device.
    #[must_use]
    pub fn device(mut self, device: DeviceSpec) -> Self {
        self.devices.push(device);
        self
    }
}

// ── Ledger ──────────────────────────────────────────────────────────────────

/// Kinds of driver objects tracked by the [`Ledger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Contexts.
    Context,
    /// Command queues.
    CommandQueue,
    /// Programs.
    Program,
    /// Kernels.
    Kernel,
    /// Buffers.
    MemObject,
}

impl ObjectKind {
    /// Every kind.
    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::Context,
        ObjectKind::CommandQueue,
        ObjectKind::Program,
        ObjectKind::Kernel,
        ObjectKind::MemObject,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

/// Creation and release counts per object kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ledger {
    created: [usize; 5],
    released: [usize; 5],
    premature: usize,
}

impl Ledger {
    /// Objects of `kind` created so far.
    #[must_use]
    pub const fn created(&self, kind: ObjectKind) -> usize {
        self.created[kind.index()]
    }

    /// Objects of `kind` released so far.
    #[must_use]
    pub const fn released(&self, kind: ObjectKind) -> usize {
        self.released[kind.index()]
    }

    /// Objects of `kind` still alive.
    #[must_use]
    pub const fn live(&self, kind: ObjectKind) -> usize {
        self.created(kind) - self.released(kind)
    }

    /// Releases of an object that was still referenced: a context with live
    /// queues, programs or buffers; a program with live kernels; a buffer
    /// still bound to a kernel or mapped; a queue with outstanding maps.
    #[must_use]
    pub const fn premature_releases(&self) -> usize {
        self.premature
    }

    /// Everything created was released, in dependency order.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.premature == 0 && self.created == self.released
    }
}

/// One `create_context_from_type` call as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextRequest {
    /// Platform requested.
    pub platform: PlatformId,
    /// Device class requested.
    pub class: DeviceClass,
    /// Outcome.
    pub status: Status,
    /// Whether an error hook was supplied.
    pub with_notify: bool,
}

/// Driver operations that can be made to fail with
/// [`ReferenceDriver::inject_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    /// `platform_ids`.
    PlatformIds,
    /// `create_context_from_type`.
    CreateContext,
    /// `create_command_queue`.
    CreateCommandQueue,
    /// `create_program_with_source` / `create_program_with_binary`.
    CreateProgram,
    /// `build_program`.
    BuildProgram,
    /// `create_kernel`.
    CreateKernel,
    /// `set_kernel_arg`.
    SetKernelArg,
    /// `create_buffer`.
    CreateBuffer,
    /// `enqueue_fill_buffer`.
    EnqueueFill,
    /// `enqueue_map_buffer`.
    EnqueueMap,
    /// `enqueue_unmap_mem_object`.
    EnqueueUnmap,
    /// `enqueue_nd_range_kernel`.
    EnqueueNdRange,
    /// `finish`.
    Finish,
}

// ── Object state ────────────────────────────────────────────────────────────

const BINARY_MAGIC: &[u8; 8] = b"BRCLBIN\0";
const BINARY_VERSION: u32 = 1;

struct PlatformState {
    id: PlatformId,
    name: String,
    devices: Vec<DeviceId>,
}

struct DeviceState {
    info: DeviceInfo,
    available: bool,
    accepts_queues: bool,
}

struct ContextState {
    devices: Vec<DeviceId>,
    notify: Option<ContextNotify>,
}

struct QueueState {
    context: ContextId,
    device: DeviceId,
}

struct BuildState {
    device: DeviceId,
    log: String,
    kernels: Option<Vec<Signature>>,
}

struct ProgramState {
    context: ContextId,
    source: String,
    build: Option<BuildState>,
}

enum BoundArg {
    Mem(MemId),
    Bytes(Vec<u8>),
}

struct KernelState {
    program: ProgramId,
    context: ContextId,
    signature: Signature,
    host: Arc<dyn HostKernel>,
    args: Vec<Option<BoundArg>>,
}

struct MapRecord {
    queue: QueueId,
    offset: usize,
    len: usize,
    access: MapAccess,
}

struct MemState {
    context: ContextId,
    access: MemAccess,
    bytes: Vec<u8>,
    maps: HashMap<u64, MapRecord>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    platforms: Vec<PlatformState>,
    devices: HashMap<DeviceId, DeviceState>,
    contexts: HashMap<ContextId, ContextState>,
    queues: HashMap<QueueId, QueueState>,
    programs: HashMap<ProgramId, ProgramState>,
    kernels: HashMap<KernelId, KernelState>,
    mems: HashMap<MemId, MemState>,
    ledger: Ledger,
    requests: Vec<ContextRequest>,
    faults: HashMap<DriverOp, Status>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_fault(&mut self, op: DriverOp) -> Result<(), Status> {
        match self.faults.remove(&op) {
            Some(status) => {
                debug!(?op, status = status.name(), "injected fault");
                Err(status)
            }
            None => Ok(()),
        }
    }

    fn created(&mut self, kind: ObjectKind) {
        self.ledger.created[kind.index()] += 1;
    }

    fn released(&mut self, kind: ObjectKind, premature: bool) {
        self.ledger.released[kind.index()] += 1;
        if premature {
            warn!(?kind, "released while still referenced");
            self.ledger.premature += 1;
        }
    }

    fn context(&self, id: ContextId) -> Result<&ContextState, Status> {
        self.contexts.get(&id).ok_or(Status::INVALID_CONTEXT)
    }

    fn queue(&self, id: QueueId) -> Result<&QueueState, Status> {
        self.queues.get(&id).ok_or(Status::INVALID_COMMAND_QUEUE)
    }

    /// The buffer `mem`, checked to share `queue`'s context.
    fn queue_mem(&mut self, queue: QueueId, mem: MemId) -> Result<&mut MemState, Status> {
        let context = self.queue(queue)?.context;
        let state = self.mems.get_mut(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
        if state.context != context {
            return Err(Status::INVALID_CONTEXT);
        }
        Ok(state)
    }

    fn max_alloc(&self, context: &ContextState) -> u64 {
        context
            .devices
            .iter()
            .filter_map(|d| self.devices.get(d))
            .map(|d| d.info.global_mem_bytes)
            .max()
            .unwrap_or(0)
    }
}

fn encode_binary(source: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(BINARY_MAGIC.len() + 8 + source.len());
    out.extend_from_slice(BINARY_MAGIC);
    out.extend_from_slice(&BINARY_VERSION.to_le_bytes());
    out.extend_from_slice(&u32::try_from(source.len()).unwrap_or(u32::MAX).to_le_bytes());
    out.extend_from_slice(source.as_bytes());
    out
}

fn decode_binary(binary: &[u8]) -> Option<String> {
    let rest = binary.strip_prefix(BINARY_MAGIC.as_slice())?;
    let (version, rest) = rest.split_first_chunk::<4>()?;
    let (len, rest) = rest.split_first_chunk::<4>()?;
    if u32::from_le_bytes(*version) != BINARY_VERSION
        || usize::try_from(u32::from_le_bytes(*len)).ok()? != rest.len()
    {
        return None;
    }
    String::from_utf8(rest.to_vec()).ok()
}

/// Largest local size per dimension that divides the global size and fits
/// the device limits.
fn default_local(global: &[usize], info: &DeviceInfo) -> [usize; 3] {
    let mut local = [1usize; 3];
    let mut budget = info.max_work_group_size.max(1);
    for (dim, &g) in global.iter().enumerate() {
        let cap = budget.min(info.max_work_item_sizes[dim]).min(g).max(1);
        let size = (1..=cap).rev().find(|d| g % d == 0).unwrap_or(1);
        local[dim] = size;
        budget /= size;
    }
    local
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// The CPU reference driver.
pub struct ReferenceDriver {
    library: KernelLibrary,
    state: Mutex<State>,
}

/// Builder for [`ReferenceDriver`].
#[derive(Debug, Default)]
pub struct ReferenceDriverBuilder {
    platforms: Vec<PlatformSpec>,
    library: KernelLibrary,
}

impl ReferenceDriverBuilder {
    /// Appends a platform. Platforms enumerate in the order added.
    #[must_use]
    pub fn platform(mut self, platform: PlatformSpec) -> Self {
        self.platforms.push(platform);
        self
    }

    /// Sets the host kernels programs may declare.
    #[must_use]
    pub fn kernels(mut self, library: KernelLibrary) -> Self {
        self.library = library;
        self
    }

    /// Builds the driver.
    #[must_use]
    pub fn build(self) -> ReferenceDriver {
        let mut state = State::default();
        for spec in self.platforms {
            let platform = PlatformId(state.next_id());
            let mut devices = Vec::with_capacity(spec.devices.len());
            for dev in spec.devices {
                let id = DeviceId(state.next_id());
                state.devices.insert(
                    id,
                    DeviceState {
                        info: dev.info,
                        available: dev.available,
                        accepts_queues: dev.accepts_queues,
                    },
                );
                devices.push(id);
            }
            state.platforms.push(PlatformState {
                id: platform,
                name: spec.name,
                devices,
            });
        }
        ReferenceDriver {
            library: self.library,
            state: Mutex::new(state),
        }
    }
}

impl ReferenceDriver {
    /// Starts an empty configuration: no platforms, no kernels.
    #[must_use]
    pub fn builder() -> ReferenceDriverBuilder {
        ReferenceDriverBuilder::default()
    }

    /// A driver with the [standard](PlatformSpec::standard) platform.
    #[must_use]
    pub fn new(library: KernelLibrary) -> Self {
        Self::builder()
            .platform(PlatformSpec::standard())
            .kernels(library)
            .build()
    }

    /// Snapshot of the object ledger.
    #[must_use]
    pub fn ledger(&self) -> Ledger {
        self.state.lock().ledger
    }

    /// Every context request made so far, in order.
    #[must_use]
    pub fn context_requests(&self) -> Vec<ContextRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of host mappings not yet unmapped, across all buffers.
    #[must_use]
    pub fn outstanding_maps(&self) -> usize {
        self.state.lock().mems.values().map(|m| m.maps.len()).sum()
    }

    /// Makes the next call of `op` fail with `status`.
    pub fn inject_fault(&self, op: DriverOp, status: Status) {
        self.state.lock().faults.insert(op, status);
    }

    /// Removes every device from `context`, as a runtime does after device
    /// loss. Later queue creation on it finds nothing to try.
    ///
    /// # Errors
    ///
    /// `CL_INVALID_CONTEXT` for an unknown context.
    pub fn revoke_devices(&self, context: ContextId) -> Result<(), Status> {
        let mut st = self.state.lock();
        let ctx = st.contexts.get_mut(&context).ok_or(Status::INVALID_CONTEXT)?;
        ctx.devices.clear();
        Ok(())
    }

    fn report(&self, notify: Option<&ContextNotify>, messages: &[String]) {
        for message in messages {
            warn!(driver = self.name(), "{message}");
            if let Some(hook) = notify {
                hook(message.as_str());
            }
        }
    }
}

impl fmt::Debug for ReferenceDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReferenceDriver")
            .field("platforms", &state.platforms.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("kernels", &self.library)
            .field("ledger", &state.ledger)
            .finish()
    }
}

impl Driver for ReferenceDriver {
    fn name(&self) -> &str {
        "reference"
    }

    fn source_dialect(&self) -> SourceDialect {
        SourceDialect::OpenClC
    }

    fn platform_ids(&self) -> Result<Vec<PlatformId>, Status> {
        let mut st = self.state.lock();
        st.take_fault(DriverOp::PlatformIds)?;
        if st.platforms.is_empty() {
            return Err(Status::PLATFORM_NOT_FOUND_KHR);
        }
        Ok(st.platforms.iter().map(|p| p.id).collect())
    }

    fn platform_name(&self, platform: PlatformId) -> Result<String, Status> {
        let st = self.state.lock();
        st.platforms
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
        let mut st = self.state.lock();
        let with_notify = notify.is_some();
        let result = st.take_fault(DriverOp::CreateContext).and_then(|()| {
            let plat = st
                .platforms
                .iter()
                .find(|p| p.id == platform)
                .ok_or(Status::INVALID_PLATFORM)?;
            let matching: Vec<DeviceId> = plat
                .devices
                .iter()
                .copied()
                .filter(|d| st.devices.get(d).is_some_and(|s| s.info.class == class))
                .collect();
            if matching.is_empty() {
                return Err(Status::DEVICE_NOT_FOUND);
            }
            let available: Vec<DeviceId> = matching
                .into_iter()
                .filter(|d| st.devices.get(d).is_some_and(|s| s.available))
                .collect();
            if available.is_empty() {
                return Err(Status::DEVICE_NOT_AVAILABLE);
            }
            Ok(available)
        });
        let result = result.map(|devices| {
            let id = ContextId(st.next_id());
            st.contexts.insert(id, ContextState { devices, notify });
            st.created(ObjectKind::Context);
            id
        });
        st.requests.push(ContextRequest {
            platform,
            class,
            status: result.as_ref().err().copied().unwrap_or(Status::SUCCESS),
            with_notify,
        });
        result
    }

    fn context_num_devices(&self, context: ContextId) -> Result<usize, Status> {
        Ok(self.state.lock().context(context)?.devices.len())
    }

    fn context_devices(&self, context: ContextId) -> Result<Vec<DeviceId>, Status> {
        Ok(self.state.lock().context(context)?.devices.clone())
    }

    fn release_context(&self, context: ContextId) -> Result<(), Status> {
        let mut st = self.state.lock();
        st.contexts.remove(&context).ok_or(Status::INVALID_CONTEXT)?;
        let referenced = st.queues.values().any(|q| q.context == context)
            || st.programs.values().any(|p| p.context == context)
            || st.mems.values().any(|m| m.context == context);
        st.released(ObjectKind::Context, referenced);
        Ok(())
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo, Status> {
        let st = self.state.lock();
        st.devices
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
        let mut st = self.state.lock();
        st.take_fault(DriverOp::CreateCommandQueue)?;
        if !st.context(context)?.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        let dev = st.devices.get(&device).ok_or(Status::INVALID_DEVICE)?;
        if !dev.accepts_queues {
            return Err(Status::OUT_OF_RESOURCES);
        }
        if properties.out_of_order {
            return Err(Status::INVALID_QUEUE_PROPERTIES);
        }
        let id = QueueId(st.next_id());
        st.queues.insert(id, QueueState { context, device });
        st.created(ObjectKind::CommandQueue);
        Ok(id)
    }

    fn finish(&self, queue: QueueId) -> Result<(), Status> {
        let mut st = self.state.lock();
        st.take_fault(DriverOp::Finish)?;
        st.queue(queue).map(|_| ())
    }

    fn flush(&self, queue: QueueId) -> Result<(), Status> {
        self.state.lock().queue(queue).map(|_| ())
    }

    fn release_command_queue(&self, queue: QueueId) -> Result<(), Status> {
        let mut st = self.state.lock();
        st.queues.remove(&queue).ok_or(Status::INVALID_COMMAND_QUEUE)?;
        let referenced = st
            .mems
            .values()
            .any(|m| m.maps.values().any(|r| r.queue == queue));
        st.released(ObjectKind::CommandQueue, referenced);
        Ok(())
    }

    fn create_program_with_source(&self, context: ContextId, source: &str) -> Result<ProgramId, Status> {
        let mut st = self.state.lock();
        st.take_fault(DriverOp::CreateProgram)?;
        st.context(context)?;
        if source.is_empty() || source.contains('\0') {
            return Err(Status::INVALID_VALUE);
        }
        let id = ProgramId(st.next_id());
        st.programs.insert(
            id,
            ProgramState {
                context,
                source: source.to_owned(),
                build: None,
            },
        );
        st.created(ObjectKind::Program);
        Ok(id)
    }

    fn create_program_with_binary(
        &self,
        context: ContextId,
        device: DeviceId,
        binary: &[u8],
    ) -> Result<ProgramId, Status> {
        let mut st = self.state.lock();
        st.take_fault(DriverOp::CreateProgram)?;
        if !st.context(context)?.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        let source = decode_binary(binary).ok_or(Status::INVALID_BINARY)?;
        let id = ProgramId(st.next_id());
        st.programs.insert(
            id,
            ProgramState {
                context,
                source,
                build: None,
            },
        );
        st.created(ObjectKind::Program);
        Ok(id)
    }

    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str) -> Result<(), Status> {
        let mut st = self.state.lock();
        st.take_fault(DriverOp::BuildProgram)?;
        let prog = st.programs.get(&program).ok_or(Status::INVALID_PROGRAM)?;
        if !st.context(prog.context)?.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        if st.kernels.values().any(|k| k.program == program) {
            return Err(Status::INVALID_OPERATION);
        }
        let compiled = compiler::compile(&prog.source, options, &self.library);
        let result = compiled.result.as_ref().map(|_| ()).map_err(|s| *s);
        debug!(
            program = program.0,
            ok = result.is_ok(),
            log_bytes = compiled.log.len(),
            "reference build finished"
        );
        if let Some(prog) = st.programs.get_mut(&program) {
            prog.build = Some(BuildState {
                device,
                log: compiled.log,
                kernels: compiled.result.ok(),
            });
        }
        result
    }

    fn program_build_log(
        &self,
        program: ProgramId,
        device: DeviceId,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let st = self.state.lock();
        let prog = st.programs.get(&program).ok_or(Status::INVALID_PROGRAM)?;
        if !st.context(prog.context)?.devices.contains(&device) {
            return Err(Status::INVALID_DEVICE);
        }
        let log = prog
            .build
            .as_ref()
            .filter(|b| b.device == device)
            .map_or("", |b| b.log.as_str())
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
        match &prog.build {
            Some(b) if b.device == device && b.kernels.is_some() => Ok(encode_binary(&prog.source)),
            _ => Err(Status::INVALID_PROGRAM_EXECUTABLE),
        }
    }

    fn release_program(&self, program: ProgramId) -> Result<(), Status> {
        let mut st = self.state.lock();
        st.programs.remove(&program).ok_or(Status::INVALID_PROGRAM)?;
        let referenced = st.kernels.values().any(|k| k.program == program);
        st.released(ObjectKind::Program, referenced);
        Ok(())
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId, Status> {
        let mut st = self.state.lock();
        st.take_fault(DriverOp::CreateKernel)?;
        let prog = st.programs.get(&program).ok_or(Status::INVALID_PROGRAM)?;
        let signatures = prog
            .build
            .as_ref()
            .and_then(|b| b.kernels.as_ref())
            .ok_or(Status::INVALID_PROGRAM_EXECUTABLE)?;
        let signature = signatures
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or(Status::INVALID_KERNEL_NAME)?;
        let host = self.library.get(name).ok_or(Status::INVALID_KERNEL_DEFINITION)?;
        let context = prog.context;
        let id = KernelId(st.next_id());
        let args = signature.params.iter().map(|_| None).collect();
        st.kernels.insert(
            id,
            KernelState {
                program,
                context,
                signature,
                host,
                args,
            },
        );
        st.created(ObjectKind::Kernel);
        Ok(id)
    }

    fn kernel_num_args(&self, kernel: KernelId) -> Result<usize, Status> {
        let st = self.state.lock();
        st.kernels
            .get(&kernel)
            .map(|k| k.signature.params.len())
            .ok_or(Status::INVALID_KERNEL)
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: usize, value: ArgValue<'_>) -> Result<(), Status> {
        let mut st = self.state.lock();
        st.take_fault(DriverOp::SetKernelArg)?;
        let k = st.kernels.get(&kernel).ok_or(Status::INVALID_KERNEL)?;
        let param = k.signature.params.get(index).ok_or(Status::INVALID_ARG_INDEX)?;
        if value.size() != param.size {
            return Err(Status::INVALID_ARG_SIZE);
        }
        let bound = match (param.kind, value) {
            (ParamKind::Pointer, ArgValue::Mem(mem)) => {
                let m = st.mems.get(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
                if m.context != k.context {
                    return Err(Status::INVALID_MEM_OBJECT);
                }
                BoundArg::Mem(mem)
            }
            (ParamKind::Scalar, ArgValue::Bytes(bytes)) => BoundArg::Bytes(bytes.to_vec()),
            _ => return Err(Status::INVALID_ARG_VALUE),
        };
        if let Some(slot) = st.kernels.get_mut(&kernel).and_then(|k| k.args.get_mut(index)) {
            *slot = Some(bound);
        }
        Ok(())
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<(), Status> {
        let mut st = self.state.lock();
        st.kernels.remove(&kernel).ok_or(Status::INVALID_KERNEL)?;
        st.released(ObjectKind::Kernel, false);
        Ok(())
    }

    fn create_buffer(
        &self,
        context: ContextId,
        access: MemAccess,
        size: usize,
        host_data: Option<&[u8]>,
    ) -> Result<MemId, Status> {
        let mut st = self.state.lock();
        st.take_fault(DriverOp::CreateBuffer)?;
        let ctx = st.context(context)?;
        let too_large = u64::try_from(size).map_or(true, |s| s > st.max_alloc(ctx));
        if size == 0 || too_large {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        let bytes = match host_data {
            Some(data) if data.len() == size => data.to_vec(),
            Some(_) => return Err(Status::INVALID_HOST_PTR),
            None => vec![0; size],
        };
        let id = MemId(st.next_id());
        st.mems.insert(
            id,
            MemState {
                context,
                access,
                bytes,
                maps: HashMap::new(),
            },
        );
        st.created(ObjectKind::MemObject);
        Ok(id)
    }

    fn release_mem_object(&self, mem: MemId) -> Result<(), Status> {
        let mut st = self.state.lock();
        let state = st.mems.remove(&mem).ok_or(Status::INVALID_MEM_OBJECT)?;
        let bound = st
            .kernels
            .values()
            .flat_map(|k| &k.args)
            .any(|a| matches!(a, Some(BoundArg::Mem(m)) if *m == mem));
        st.released(ObjectKind::MemObject, bound || !state.maps.is_empty());
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
        let mut st = self.state.lock();
        st.take_fault(DriverOp::EnqueueFill)?;
        let target = st.queue_mem(queue, mem)?;
        let p = pattern.len();
        if !p.is_power_of_two() || p > 128 || offset % p != 0 || size % p != 0 {
            return Err(Status::INVALID_VALUE);
        }
        let region = offset
            .checked_add(size)
            .and_then(|end| target.bytes.get_mut(offset..end))
            .ok_or(Status::INVALID_VALUE)?;
        for chunk in region.chunks_exact_mut(p) {
            chunk.copy_from_slice(pattern);
        }
        Ok(())
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
        st.take_fault(DriverOp::EnqueueMap)?;
        let token = st.next_id();
        let target = st.queue_mem(queue, mem)?;
        let bytes = offset
            .checked_add(size)
            .filter(|_| size > 0)
            .and_then(|end| target.bytes.get(offset..end))
            .ok_or(Status::INVALID_VALUE)?
            .to_vec();
        target.maps.insert(
            token,
            MapRecord {
                queue,
                offset,
                len: size,
                access,
            },
        );
        Ok(HostRegion {
            token,
            offset,
            access,
            bytes,
        })
    }

    fn enqueue_unmap_mem_object(&self, queue: QueueId, mem: MemId, region: HostRegion) -> Result<(), Status> {
        let mut st = self.state.lock();
        st.take_fault(DriverOp::EnqueueUnmap)?;
        let target = st.queue_mem(queue, mem)?;
        let record = target.maps.get(&region.token).ok_or(Status::INVALID_VALUE)?;
        if record.len != region.bytes.len() || record.offset != region.offset {
            return Err(Status::INVALID_VALUE);
        }
        if record.access.writes_back() {
            let (offset, len) = (record.offset, record.len);
            target.bytes[offset..offset + len].copy_from_slice(&region.bytes);
        }
        target.maps.remove(&region.token);
        Ok(())
    }

    fn enqueue_nd_range_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<(), Status> {
        // Validate and snapshot under the lock.
        let mut st = self.state.lock();
        st.take_fault(DriverOp::EnqueueNdRange)?;
        let q = st.queue(queue)?;
        let (context, device) = (q.context, q.device);
        let k = st.kernels.get(&kernel).ok_or(Status::INVALID_KERNEL)?;
        if k.context != context {
            return Err(Status::INVALID_CONTEXT);
        }
        let built_for = st
            .programs
            .get(&k.program)
            .and_then(|p| p.build.as_ref())
            .map(|b| b.device);
        if built_for != Some(device) {
            return Err(Status::INVALID_PROGRAM_EXECUTABLE);
        }
        let info = &st.devices.get(&device).ok_or(Status::INVALID_DEVICE)?.info;

        let dims = global.len();
        if !(1..=3).contains(&dims) {
            return Err(Status::INVALID_WORK_DIMENSION);
        }
        if global.contains(&0) {
            return Err(Status::INVALID_GLOBAL_WORK_SIZE);
        }
        let local = match local {
            Some(local) => {
                if local.len() != dims {
                    return Err(Status::INVALID_WORK_DIMENSION);
                }
                if local.contains(&0) {
                    return Err(Status::INVALID_WORK_GROUP_SIZE);
                }
                if local.iter().zip(info.max_work_item_sizes).any(|(&l, max)| l > max) {
                    return Err(Status::INVALID_WORK_ITEM_SIZE);
                }
                let group = local.iter().try_fold(1usize, |acc, &l| acc.checked_mul(l));
                if global.iter().zip(local).any(|(g, l)| g % l != 0)
                    || group.is_none_or(|group| group > info.max_work_group_size)
                {
                    return Err(Status::INVALID_WORK_GROUP_SIZE);
                }
                let mut out = [1; 3];
                out[..dims].copy_from_slice(local);
                out
            }
            None => default_local(global, info),
        };
        let mut global3 = [1; 3];
        global3[..dims].copy_from_slice(global);
        let total = global3
            .iter()
            .try_fold(1usize, |acc, &g| acc.checked_mul(g))
            .filter(|&total| total <= info.max_global_work_items)
            .ok_or(Status::INVALID_GLOBAL_WORK_SIZE)?;

        let mut args = Vec::with_capacity(k.args.len());
        for bound in &k.args {
            match bound {
                None => return Err(Status::INVALID_KERNEL_ARGS),
                Some(BoundArg::Bytes(bytes)) => args.push(ArgData::Bytes(bytes.clone())),
                Some(BoundArg::Mem(mem)) => {
                    let m = st.mems.get(mem).ok_or(Status::INVALID_MEM_OBJECT)?;
                    args.push(ArgData::Buffer {
                        mem: *mem,
                        access: m.access,
                        bytes: m.bytes.clone(),
                    });
                }
            }
        }
        let name = k.signature.name.clone();
        let host = Arc::clone(&k.host);
        drop(st);

        // Run every work-item.
        debug!(kernel = %name, ?global3, ?local, total, "reference dispatch");
        let faults: Vec<AtomicBool> = args.iter().map(|_| AtomicBool::new(false)).collect();
        let view = ArgView::new(&args, &faults);
        let stores: Vec<Stores> = (0..total)
            .into_par_iter()
            .map(|linear| {
                let item = WorkItem::from_linear(linear, dims, global3, local);
                let mut out = Stores::default();
                host.execute(&item, &view, &mut out);
                out
            })
            .collect();

        // Commit in work-item order.
        let mut read_only: BTreeMap<usize, usize> = BTreeMap::new();
        let mut out_of_bounds: BTreeMap<usize, usize> = BTreeMap::new();
        let mut st = self.state.lock();
        for store in stores.iter().flat_map(|s| &s.writes) {
            let Some(ArgData::Buffer { mem, access, .. }) = args.get(store.slot) else {
                *out_of_bounds.entry(store.slot).or_default() += 1;
                continue;
            };
            if !access.kernel_writable() {
                *read_only.entry(store.slot).or_default() += 1;
                continue;
            }
            let Some(target) = st.mems.get_mut(mem) else {
                continue;
            };
            let dst = store
                .offset
                .checked_add(store.bytes.len())
                .and_then(|end| target.bytes.get_mut(store.offset..end));
            match dst {
                Some(dst) => dst.copy_from_slice(&store.bytes),
                None => *out_of_bounds.entry(store.slot).or_default() += 1,
            }
        }
        let notify = st.contexts.get(&context).and_then(|c| c.notify.clone());
        drop(st);

        let mut messages = Vec::new();
        for (slot, flag) in faults.iter().enumerate() {
            if flag.load(std::sync::atomic::Ordering::Relaxed) {
                messages.push(format!("kernel `{name}`: out-of-bounds read from argument {slot}"));
            }
        }
        for (slot, n) in out_of_bounds {
            messages.push(format!("kernel `{name}`: {n} out-of-bounds store(s) to argument {slot} dropped"));
        }
        for (slot, n) in read_only {
            messages.push(format!("kernel `{name}`: {n} store(s) to READ_ONLY argument {slot} dropped"));
        }
        self.report(notify.as_ref(), &messages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy_kernel(item: &WorkItem, args: &ArgView<'_>, out: &mut Stores) {
        let i = item.global_id(0);
        out.store(1, i, args.load::<u32>(0, i));
    }

    const COPY_SRC: &str = "__kernel void copy(__global const uint *src, __global uint *dst) {\n    dst[get_global_id(0)] = src[get_global_id(0)];\n}\n";

    fn driver() -> ReferenceDriver {
        ReferenceDriver::new(KernelLibrary::new().with("copy", copy_kernel))
    }

    struct Fixture {
        ctx: ContextId,
        device: DeviceId,
        queue: QueueId,
    }

    fn fixture(drv: &ReferenceDriver, notify: Option<ContextNotify>) -> Fixture {
        let platform = drv.platform_ids().unwrap()[0];
        let ctx = drv.create_context_from_type(platform, DeviceClass::Gpu, notify).unwrap();
        let device = drv.context_devices(ctx).unwrap()[0];
        let queue = drv
            .create_command_queue(ctx, device, QueueProperties::default())
            .unwrap();
        Fixture { ctx, device, queue }
    }

    #[test]
    fn context_classes() {
        let drv = ReferenceDriver::builder()
            .platform(
                PlatformSpec::new("p")
                    .device(DeviceSpec::gpu("g").unavailable())
                    .device(DeviceSpec::cpu("c")),
            )
            .build();
        let p = drv.platform_ids().unwrap()[0];
        assert_eq!(
            drv.create_context_from_type(p, DeviceClass::Gpu, None),
            Err(Status::DEVICE_NOT_AVAILABLE)
        );
        assert_eq!(
            drv.create_context_from_type(p, DeviceClass::Accelerator, None),
            Err(Status::DEVICE_NOT_FOUND)
        );
        let ctx = drv.create_context_from_type(p, DeviceClass::Cpu, None).unwrap();
        assert_eq!(drv.context_num_devices(ctx), Ok(1));
        assert_eq!(drv.context_requests().len(), 3);
        drv.release_context(ctx).unwrap();
        assert_eq!(drv.release_context(ctx), Err(Status::INVALID_CONTEXT));
    }

    #[test]
    fn no_platforms() {
        let drv = ReferenceDriver::builder().build();
        assert_eq!(drv.platform_ids(), Err(Status::PLATFORM_NOT_FOUND_KHR));
    }

    #[test]
    fn runs_a_kernel() {
        let drv = driver();
        let f = fixture(&drv, None);
        let prog = drv.create_program_with_source(f.ctx, COPY_SRC).unwrap();
        drv.build_program(prog, f.device, "").unwrap();
        let kernel = drv.create_kernel(prog, "copy").unwrap();
        let input: Vec<u8> = bytemuck::cast_slice(&[1u32, 2, 3, 4]).to_vec();
        let src = drv.create_buffer(f.ctx, MemAccess::ReadOnly, 16, Some(&input)).unwrap();
        let dst = drv.create_buffer(f.ctx, MemAccess::WriteOnly, 16, None).unwrap();
        drv.set_kernel_arg(kernel, 0, ArgValue::Mem(src)).unwrap();
        drv.set_kernel_arg(kernel, 1, ArgValue::Mem(dst)).unwrap();
        drv.enqueue_nd_range_kernel(f.queue, kernel, &[4], Some(&[2])).unwrap();

        let region = drv.enqueue_map_buffer(f.queue, dst, true, MapAccess::Read, 0, 16).unwrap();
        assert_eq!(region.bytes, input);
        assert_eq!(drv.outstanding_maps(), 1);
        drv.enqueue_unmap_mem_object(f.queue, dst, region).unwrap();

        drv.release_kernel(kernel).unwrap();
        drv.release_mem_object(src).unwrap();
        drv.release_mem_object(dst).unwrap();
        drv.release_program(prog).unwrap();
        drv.release_command_queue(f.queue).unwrap();
        drv.release_context(f.ctx).unwrap();
        let ledger = drv.ledger();
        assert!(ledger.is_balanced(), "{ledger:?}");
        assert_eq!(ledger.created(ObjectKind::MemObject), 2);
    }

    #[test]
    fn premature_release_is_counted() {
        let drv = driver();
        let f = fixture(&drv, None);
        drv.release_context(f.ctx).unwrap();
        drv.release_command_queue(f.queue).unwrap();
        let ledger = drv.ledger();
        assert_eq!(ledger.premature_releases(), 1);
        assert!(!ledger.is_balanced());
    }

    #[test]
    fn build_log_two_phase() {
        let drv = driver();
        let f = fixture(&drv, None);
        let prog = drv
            .create_program_with_source(f.ctx, "__kernel void copy(__global uint *a) {")
            .unwrap();
        assert_eq!(drv.build_program(prog, f.device, ""), Err(Status::BUILD_PROGRAM_FAILURE));
        let size = drv.program_build_log(prog, f.device, None).unwrap();
        let mut buf = vec![0xFFu8; size + 1];
        assert_eq!(drv.program_build_log(prog, f.device, Some(&mut buf)), Ok(size));
        assert_eq!(buf[size - 1], 0);
        let log = std::str::from_utf8(&buf[..size - 1]).unwrap();
        assert!(log.starts_with("<source>:1:"));
        assert!(log.ends_with("1 error generated.\n"));
        assert_eq!(drv.create_kernel(prog, "copy"), Err(Status::INVALID_PROGRAM_EXECUTABLE));

        let mut short = [0u8; 4];
        assert_eq!(drv.program_build_log(prog, f.device, Some(&mut short)), Ok(size));
        assert_eq!(&short, b"<sou");
    }

    #[test]
    fn malformed_sources() {
        let drv = driver();
        let f = fixture(&drv, None);
        assert_eq!(drv.create_program_with_source(f.ctx, ""), Err(Status::INVALID_VALUE));
        assert_eq!(drv.create_program_with_source(f.ctx, "a\0b"), Err(Status::INVALID_VALUE));
    }

    #[test]
    fn binaries() {
        let drv = driver();
        let f = fixture(&drv, None);
        let prog = drv.create_program_with_source(f.ctx, COPY_SRC).unwrap();
        assert_eq!(drv.program_binary(prog, f.device), Err(Status::INVALID_PROGRAM_EXECUTABLE));
        drv.build_program(prog, f.device, "").unwrap();
        let bin = drv.program_binary(prog, f.device).unwrap();
        assert!(bin.starts_with(BINARY_MAGIC));
        assert_eq!(decode_binary(&bin).as_deref(), Some(COPY_SRC));

        let mut corrupt = bin.clone();
        corrupt.truncate(bin.len() - 3);
        assert_eq!(
            drv.create_program_with_binary(f.ctx, f.device, &corrupt),
            Err(Status::INVALID_BINARY)
        );
        assert_eq!(
            drv.create_program_with_binary(f.ctx, f.device, b"not a binary"),
            Err(Status::INVALID_BINARY)
        );
        let again = drv.create_program_with_binary(f.ctx, f.device, &bin).unwrap();
        drv.build_program(again, f.device, "").unwrap();
        assert!(drv.create_kernel(again, "copy").is_ok());
    }

    #[test]
    fn argument_checks() {
        let drv = driver();
        let f = fixture(&drv, None);
        let prog = drv.create_program_with_source(f.ctx, COPY_SRC).unwrap();
        drv.build_program(prog, f.device, "").unwrap();
        let kernel = drv.create_kernel(prog, "copy").unwrap();
        let mem = drv.create_buffer(f.ctx, MemAccess::ReadWrite, 16, None).unwrap();

        assert_eq!(drv.kernel_num_args(kernel), Ok(2));
        assert_eq!(drv.set_kernel_arg(kernel, 2, ArgValue::Mem(mem)), Err(Status::INVALID_ARG_INDEX));
        assert_eq!(drv.set_kernel_arg(kernel, 0, ArgValue::Bytes(&[0; 4])), Err(Status::INVALID_ARG_SIZE));
        assert_eq!(drv.set_kernel_arg(kernel, 0, ArgValue::Bytes(&[0; 8])), Err(Status::INVALID_ARG_VALUE));
        assert_eq!(
            drv.set_kernel_arg(kernel, 0, ArgValue::Mem(MemId(9999))),
            Err(Status::INVALID_MEM_OBJECT)
        );
        drv.set_kernel_arg(kernel, 0, ArgValue::Mem(mem)).unwrap();
        assert_eq!(
            drv.enqueue_nd_range_kernel(f.queue, kernel, &[4], None),
            Err(Status::INVALID_KERNEL_ARGS)
        );
        assert_eq!(drv.create_kernel(prog, "missing"), Err(Status::INVALID_KERNEL_NAME));
    }

    #[test]
    fn geometry_checks() {
        let drv = driver();
        let f = fixture(&drv, None);
        let prog = drv.create_program_with_source(f.ctx, COPY_SRC).unwrap();
        drv.build_program(prog, f.device, "").unwrap();
        let kernel = drv.create_kernel(prog, "copy").unwrap();
        let mem = drv.create_buffer(f.ctx, MemAccess::ReadWrite, 64, None).unwrap();
        drv.set_kernel_arg(kernel, 0, ArgValue::Mem(mem)).unwrap();
        drv.set_kernel_arg(kernel, 1, ArgValue::Mem(mem)).unwrap();

        let run = |g: &[usize], l: Option<&[usize]>| drv.enqueue_nd_range_kernel(f.queue, kernel, g, l);
        assert_eq!(run(&[], None), Err(Status::INVALID_WORK_DIMENSION));
        assert_eq!(run(&[1, 1, 1, 1], None), Err(Status::INVALID_WORK_DIMENSION));
        assert_eq!(run(&[0], None), Err(Status::INVALID_GLOBAL_WORK_SIZE));
        assert_eq!(run(&[6], Some(&[4])), Err(Status::INVALID_WORK_GROUP_SIZE));
        assert_eq!(run(&[512], Some(&[512])), Err(Status::INVALID_WORK_ITEM_SIZE));
        assert_eq!(run(&[16, 16], Some(&[16, 32])), Err(Status::INVALID_WORK_GROUP_SIZE));
        assert_eq!(run(&[16], Some(&[4, 4])), Err(Status::INVALID_WORK_DIMENSION));
        assert_eq!(run(&[16], Some(&[4])), Ok(()));
        assert_eq!(run(&[7], None), Ok(()));

        // Totals that overflow or exceed the device limit never run.
        assert_eq!(run(&[usize::MAX, 2], None), Err(Status::INVALID_GLOBAL_WORK_SIZE));
        assert_eq!(run(&[usize::MAX, usize::MAX, 2], None), Err(Status::INVALID_GLOBAL_WORK_SIZE));
        assert_eq!(
            run(&[DEFAULT_MAX_GLOBAL_WORK_ITEMS, 2], None),
            Err(Status::INVALID_GLOBAL_WORK_SIZE)
        );
    }

    #[test]
    fn dispatch_limit_is_per_device() {
        let drv = ReferenceDriver::builder()
            .platform(PlatformSpec::new("tiny").device(DeviceSpec::gpu("g").max_global_work_items(64)))
            .kernels(KernelLibrary::new().with("copy", copy_kernel))
            .build();
        let f = fixture(&drv, None);
        let prog = drv.create_program_with_source(f.ctx, COPY_SRC).unwrap();
        drv.build_program(prog, f.device, "").unwrap();
        let kernel = drv.create_kernel(prog, "copy").unwrap();
        let mem = drv.create_buffer(f.ctx, MemAccess::ReadWrite, 1024, None).unwrap();
        drv.set_kernel_arg(kernel, 0, ArgValue::Mem(mem)).unwrap();
        drv.set_kernel_arg(kernel, 1, ArgValue::Mem(mem)).unwrap();

        assert_eq!(drv.enqueue_nd_range_kernel(f.queue, kernel, &[8, 8], None), Ok(()));
        assert_eq!(
            drv.enqueue_nd_range_kernel(f.queue, kernel, &[8, 9], None),
            Err(Status::INVALID_GLOBAL_WORK_SIZE)
        );
    }

    #[test]
    fn default_local_sizes_fit_limits() {
        let info = DeviceSpec::gpu("g").info;
        assert_eq!(default_local(&[6, 6], &info), [6, 6, 1]);
        assert_eq!(default_local(&[1024], &info), [256, 1, 1]);
        assert_eq!(default_local(&[7], &info), [7, 1, 1]);
        let local = default_local(&[512, 512, 512], &info);
        assert!(local.iter().product::<usize>() <= 256);
    }

    #[test]
    fn read_only_stores_reach_the_hook() {
        let drv = driver();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let notify: ContextNotify = Arc::new(move |msg: &str| sink.lock().push(msg.to_owned()));
        let f = fixture(&drv, Some(notify));
        let prog = drv.create_program_with_source(f.ctx, COPY_SRC).unwrap();
        drv.build_program(prog, f.device, "").unwrap();
        let kernel = drv.create_kernel(prog, "copy").unwrap();
        let src = drv.create_buffer(f.ctx, MemAccess::ReadOnly, 8, Some(&[1; 8])).unwrap();
        let dst = drv.create_buffer(f.ctx, MemAccess::ReadOnly, 8, Some(&[0; 8])).unwrap();
        drv.set_kernel_arg(kernel, 0, ArgValue::Mem(src)).unwrap();
        drv.set_kernel_arg(kernel, 1, ArgValue::Mem(dst)).unwrap();
        drv.enqueue_nd_range_kernel(f.queue, kernel, &[3], None).unwrap();

        let messages = seen.lock().clone();
        assert_eq!(
            messages,
            vec![
                "kernel `copy`: out-of-bounds read from argument 0".to_owned(),
                "kernel `copy`: 3 store(s) to READ_ONLY argument 1 dropped".to_owned(),
            ]
        );
        let region = drv.enqueue_map_buffer(f.queue, dst, true, MapAccess::Read, 0, 8).unwrap();
        assert_eq!(region.bytes, vec![0; 8]);
    }

    #[test]
    fn fill_and_map_checks() {
        let drv = driver();
        let f = fixture(&drv, None);
        let mem = drv.create_buffer(f.ctx, MemAccess::ReadWrite, 16, None).unwrap();
        assert_eq!(drv.enqueue_fill_buffer(f.queue, mem, &[1, 2, 3], 0, 15), Err(Status::INVALID_VALUE));
        assert_eq!(drv.enqueue_fill_buffer(f.queue, mem, &[1, 2], 1, 2), Err(Status::INVALID_VALUE));
        assert_eq!(drv.enqueue_fill_buffer(f.queue, mem, &[1, 2], 0, 18), Err(Status::INVALID_VALUE));
        drv.enqueue_fill_buffer(f.queue, mem, &[1, 2], 4, 4).unwrap();

        let mut region = drv.enqueue_map_buffer(f.queue, mem, false, MapAccess::Write, 0, 16).unwrap();
        assert_eq!(&region.bytes[..8], &[0, 0, 0, 0, 1, 2, 1, 2]);
        region.bytes[0] = 9;
        let forged = HostRegion {
            token: region.token + 100,
            offset: 0,
            access: MapAccess::Write,
            bytes: vec![0; 16],
        };
        assert_eq!(drv.enqueue_unmap_mem_object(f.queue, mem, forged), Err(Status::INVALID_VALUE));
        drv.enqueue_unmap_mem_object(f.queue, mem, region).unwrap();

        let region = drv.enqueue_map_buffer(f.queue, mem, true, MapAccess::Read, 0, 1).unwrap();
        assert_eq!(region.bytes, vec![9]);
        assert_eq!(
            drv.enqueue_map_buffer(f.queue, mem, true, MapAccess::Read, 8, 9).err(),
            Some(Status::INVALID_VALUE)
        );
        drv.enqueue_unmap_mem_object(f.queue, mem, region).unwrap();
    }

    #[test]
    fn buffer_creation_checks() {
        let drv = driver();
        let f = fixture(&drv, None);
        assert_eq!(drv.create_buffer(f.ctx, MemAccess::ReadWrite, 0, None), Err(Status::INVALID_BUFFER_SIZE));
        assert_eq!(
            drv.create_buffer(f.ctx, MemAccess::ReadWrite, 4, Some(&[0; 3])),
            Err(Status::INVALID_HOST_PTR)
        );
        assert_eq!(
            drv.create_buffer(f.ctx, MemAccess::ReadWrite, usize::MAX, None),
            Err(Status::INVALID_BUFFER_SIZE)
        );
    }

    #[test]
    fn injected_faults_fire_once() {
        let drv = driver();
        let f = fixture(&drv, None);
        drv.inject_fault(DriverOp::CreateBuffer, Status::MEM_OBJECT_ALLOCATION_FAILURE);
        assert_eq!(
            drv.create_buffer(f.ctx, MemAccess::ReadWrite, 4, None),
            Err(Status::MEM_OBJECT_ALLOCATION_FAILURE)
        );
        assert!(drv.create_buffer(f.ctx, MemAccess::ReadWrite, 4, None).is_ok());
    }

    #[test]
    fn queue_properties() {
        let drv = ReferenceDriver::builder()
            .platform(PlatformSpec::new("p").device(DeviceSpec::gpu("g").rejecting_queues()))
            .build();
        let p = drv.platform_ids().unwrap()[0];
        let ctx = drv.create_context_from_type(p, DeviceClass::Gpu, None).unwrap();
        let dev = drv.context_devices(ctx).unwrap()[0];
        assert_eq!(
            drv.create_command_queue(ctx, dev, QueueProperties::default()),
            Err(Status::OUT_OF_RESOURCES)
        );

        let drv = driver();
        let f = fixture(&drv, None);
        let ooo = QueueProperties {
            out_of_order: true,
            profiling: false,
        };
        assert_eq!(
            drv.create_command_queue(f.ctx, f.device, ooo),
            Err(Status::INVALID_QUEUE_PROPERTIES)
        );
    }
}
