//! Host implementations of device kernels.
//!
//! The reference driver compiles OpenCL C only far enough to learn each
//! kernel's signature; the body is executed by a [`HostKernel`] registered
//! under the same name in a [`KernelLibrary`]. A host kernel sees one
//! work-item at a time: it reads its arguments through an [`ArgView`] (a
//! snapshot taken when the range was enqueued) and records its writes in a
//! [`Stores`] list that the driver commits once every work-item has run.
//!
//! A host kernel registered with [`KernelLibrary::with_source`] is tied to
//! one definition: programs whose body for that kernel differs fail to build.

use super::compiler;
use crate::driver::{MemAccess, MemId};
use bytemuck::Pod;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Position of one work-item inside an N-D range.
///
/// Dimensions past [`work_dim`](WorkItem::work_dim) behave as in OpenCL C:
/// ids are `0` and sizes are `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub(crate) work_dim: usize,
    pub(crate) global_id: [usize; 3],
    pub(crate) global_size: [usize; 3],
    pub(crate) local_size: [usize; 3],
}

impl WorkItem {
    pub(crate) fn from_linear(linear: usize, work_dim: usize, global: [usize; 3], local: [usize; 3]) -> Self {
        let x = linear % global[0];
        let y = (linear / global[0]) % global[1];
        let z = linear / (global[0] * global[1]);
        Self {
            work_dim,
            global_id: [x, y, z],
            global_size: global,
            local_size: local,
        }
    }

    /// Number of dimensions in use.
    #[must_use]
    pub const fn work_dim(&self) -> usize {
        self.work_dim
    }

    /// `get_global_id(dim)`.
    #[must_use]
    pub fn global_id(&self, dim: usize) -> usize {
        self.global_id.get(dim).copied().unwrap_or(0)
    }

    /// `get_global_size(dim)`.
    #[must_use]
    pub fn global_size(&self, dim: usize) -> usize {
        self.global_size.get(dim).copied().unwrap_or(1)
    }

    /// `get_local_size(dim)`.
    #[must_use]
    pub fn local_size(&self, dim: usize) -> usize {
        self.local_size.get(dim).copied().unwrap_or(1)
    }

    /// `get_local_id(dim)`.
    #[must_use]
    pub fn local_id(&self, dim: usize) -> usize {
        self.global_id(dim) % self.local_size(dim)
    }

    /// `get_group_id(dim)`.
    #[must_use]
    pub fn group_id(&self, dim: usize) -> usize {
        self.global_id(dim) / self.local_size(dim)
    }

    /// `get_num_groups(dim)`.
    #[must_use]
    pub fn num_groups(&self, dim: usize) -> usize {
        self.global_size(dim) / self.local_size(dim)
    }

    /// Row-major linear index of this work-item (x fastest).
    #[must_use]
    pub const fn linear_id(&self) -> usize {
        (self.global_id[2] * self.global_size[1] + self.global_id[1]) * self.global_size[0]
            + self.global_id[0]
    }
}

/// Snapshot of one bound argument.
#[derive(Debug, Clone)]
pub(crate) enum ArgData {
    Buffer { mem: MemId, access: MemAccess, bytes: Vec<u8> },
    Bytes(Vec<u8>),
}

/// Read access to a dispatch's arguments.
///
/// Reads never fail: an out-of-range or mistyped read yields a zeroed value
/// and marks the argument as faulted, which the driver reports through the
/// context's error hook after the dispatch.
pub struct ArgView<'a> {
    args: &'a [ArgData],
    faults: &'a [AtomicBool],
}

impl<'a> ArgView<'a> {
    pub(crate) fn new(args: &'a [ArgData], faults: &'a [AtomicBool]) -> Self {
        Self { args, faults }
    }

    fn fault(&self, slot: usize) {
        if let Some(flag) = self.faults.get(slot) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Element `index` of the buffer bound at `slot`, read as `T`.
    #[must_use]
    pub fn load<T: Pod>(&self, slot: usize, index: usize) -> T {
        let size = size_of::<T>();
        match self.args.get(slot) {
            Some(ArgData::Buffer { bytes, .. }) => {
                let start = index.saturating_mul(size);
                match bytes.get(start..start.saturating_add(size)) {
                    Some(raw) => bytemuck::pod_read_unaligned(raw),
                    None => {
                        self.fault(slot);
                        T::zeroed()
                    }
                }
            }
            _ => {
                self.fault(slot);
                T::zeroed()
            }
        }
    }

    /// The scalar bound at `slot`, read as `T`.
    #[must_use]
    pub fn scalar<T: Pod>(&self, slot: usize) -> T {
        match self.args.get(slot) {
            Some(ArgData::Bytes(raw)) if raw.len() == size_of::<T>() => {
                bytemuck::pod_read_unaligned(raw)
            }
            _ => {
                self.fault(slot);
                T::zeroed()
            }
        }
    }

    /// Number of whole `T` elements in the buffer bound at `slot`.
    #[must_use]
    pub fn len<T: Pod>(&self, slot: usize) -> usize {
        match self.args.get(slot) {
            Some(ArgData::Buffer { bytes, .. }) if size_of::<T>() > 0 => bytes.len() / size_of::<T>(),
            _ => 0,
        }
    }
}

/// One pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Store {
    pub(crate) slot: usize,
    pub(crate) offset: usize,
    pub(crate) bytes: Vec<u8>,
}

/// Writes recorded by one work-item.
#[derive(Debug, Default)]
pub struct Stores {
    pub(crate) writes: Vec<Store>,
}

impl Stores {
    /// Writes `value` to element `index` of the buffer bound at `slot`.
    pub fn store<T: Pod>(&mut self, slot: usize, index: usize, value: T) {
        self.writes.push(Store {
            slot,
            offset: index.saturating_mul(size_of::<T>()),
            bytes: bytemuck::bytes_of(&value).to_vec(),
        });
    }
}

/// Host-side body of a device kernel.
pub trait HostKernel: Send + Sync {
    /// Runs one work-item.
    fn execute(&self, item: &WorkItem, args: &ArgView<'_>, out: &mut Stores);
}

impl<F> HostKernel for F
where
    F: Fn(&WorkItem, &ArgView<'_>, &mut Stores) + Send + Sync,
{
    fn execute(&self, item: &WorkItem, args: &ArgView<'_>, out: &mut Stores) {
        self(item, args, out);
    }
}

#[derive(Clone)]
struct Entry {
    kernel: Arc<dyn HostKernel>,
    body: Option<String>,
}

/// Named host kernels available to the reference compiler.
#[derive(Clone, Default)]
pub struct KernelLibrary {
    kernels: HashMap<String, Entry>,
}

impl KernelLibrary {
    /// An empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a kernel, replacing any previous one of the same name.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, kernel: impl HostKernel + 'static) -> Self {
        self.insert(name, kernel);
        self
    }

    /// Adds a kernel that stands in for the definition of `name` in
    /// `source` only. Building a program whose `name` has any other body
    /// fails with a diagnostic; a `source` without that definition matches
    /// nothing.
    #[must_use]
    pub fn with_source(mut self, name: impl Into<String>, source: &str, kernel: impl HostKernel + 'static) -> Self {
        let name = name.into();
        let body = compiler::kernel_body(source, &name).unwrap_or_default();
        self.kernels.insert(
            name,
            Entry {
                kernel: Arc::new(kernel),
                body: Some(body),
            },
        );
        self
    }

    /// Adds a kernel, replacing any previous one of the same name.
    pub fn insert(&mut self, name: impl Into<String>, kernel: impl HostKernel + 'static) {
        self.kernels.insert(
            name.into(),
            Entry {
                kernel: Arc::new(kernel),
                body: None,
            },
        );
    }

    /// Merges another library into this one.
    #[must_use]
    pub fn merge(mut self, other: KernelLibrary) -> Self {
        self.kernels.extend(other.kernels);
        self
    }

    /// Whether a kernel of this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn HostKernel>> {
        self.kernels.get(name).map(|e| Arc::clone(&e.kernel))
    }

    pub(crate) fn pinned_body(&self, name: &str) -> Option<&str> {
        self.kernels.get(name).and_then(|e| e.body.as_deref())
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLibrary").field("kernels", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_item_ids() {
        let item = WorkItem::from_linear(7, 2, [3, 4, 1], [1, 2, 1]);
        assert_eq!(item.global_id(0), 1);
        assert_eq!(item.global_id(1), 2);
        assert_eq!(item.global_id(2), 0);
        assert_eq!(item.global_id(5), 0);
        assert_eq!(item.global_size(5), 1);
        assert_eq!(item.group_id(1), 1);
        assert_eq!(item.local_id(1), 0);
        assert_eq!(item.num_groups(1), 2);
        assert_eq!(item.linear_id(), 7);
    }

    #[test]
    fn loads_fault_out_of_bounds() {
        let args = vec![
            ArgData::Buffer {
                mem: MemId(1),
                access: MemAccess::ReadOnly,
                bytes: bytemuck::cast_slice(&[1.0f32, 2.0]).to_vec(),
            },
            ArgData::Bytes(7u32.to_ne_bytes().to_vec()),
        ];
        let faults = [AtomicBool::new(false), AtomicBool::new(false)];
        let view = ArgView::new(&args, &faults);

        assert_eq!(view.load::<f32>(0, 1), 2.0);
        assert_eq!(view.len::<f32>(0), 2);
        assert_eq!(view.scalar::<u32>(1), 7);
        assert!(!faults[0].load(Ordering::Relaxed));

        assert_eq!(view.load::<f32>(0, 2), 0.0);
        assert!(faults[0].load(Ordering::Relaxed));
        assert_eq!(view.scalar::<u64>(1), 0);
        assert!(faults[1].load(Ordering::Relaxed));
    }

    #[test]
    fn stores_record_byte_offsets() {
        let mut out = Stores::default();
        out.store(2, 3, 0xAABB_CCDDu32);
        assert_eq!(out.writes[0].slot, 2);
        assert_eq!(out.writes[0].offset, 12);
        assert_eq!(out.writes[0].bytes, 0xAABB_CCDDu32.to_ne_bytes());
    }

    #[test]
    fn library_accepts_closures() {
        let lib = KernelLibrary::new()
            .with("b", |_: &WorkItem, _: &ArgView<'_>, _: &mut Stores| {})
            .with("a", |_: &WorkItem, _: &ArgView<'_>, _: &mut Stores| {});
        assert!(lib.contains("a"));
        assert_eq!(lib.names(), vec!["a", "b"]);
        assert!(lib.get("c").is_none());
    }
}
