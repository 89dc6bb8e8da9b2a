//! Sample kernels.
//!
//! Each sample ships its device source (OpenCL C, and WGSL where the
//! `wgpu` driver can run it), a host implementation the reference driver
//! executes in place of the OpenCL C body, and a plain CPU version of the
//! same computation to check results against.

use crate::driver::SourceDialect;
use crate::driver::reference::{ArgView, KernelLibrary, ReferenceDriver, Stores, WorkItem};
use std::sync::Arc;

/// OpenCL C source of `vector_add`.
pub const VECTOR_ADD_CL: &str = include_str!("../../kernels/vector_add.cl");
/// WGSL source of `vector_add`.
pub const VECTOR_ADD_WGSL: &str = include_str!("../../kernels/vector_add.wgsl");
/// OpenCL C source of `convolve`.
pub const CONVOLUTION_CL: &str = include_str!("../../kernels/convolution.cl");
/// WGSL source of `convolve`.
pub const CONVOLUTION_WGSL: &str = include_str!("../../kernels/convolution.wgsl");
/// OpenCL C source of `cast_rays`.
pub const RAY_CAST_CL: &str = include_str!("../../kernels/ray_cast.cl");
/// OpenCL C source of `stamp`.
pub const STAMP_CL: &str = include_str!("../../kernels/stamp.cl");

/// A sample kernel and its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Entry point name.
    pub kernel: &'static str,
    /// File name under `kernels/`.
    pub file: &'static str,
    /// OpenCL C source.
    pub opencl: &'static str,
    /// WGSL source, if the sample has one.
    pub wgsl: Option<&'static str>,
}

impl Sample {
    /// The source for a driver's dialect.
    #[must_use]
    pub const fn source(&self, dialect: SourceDialect) -> Option<&'static str> {
        match dialect {
            SourceDialect::OpenClC => Some(self.opencl),
            SourceDialect::Wgsl => self.wgsl,
        }
    }
}

/// `c[i] = a[i] + b[i]` over `float`s.
pub const VECTOR_ADD: Sample = Sample {
    kernel: "vector_add",
    file: "vector_add.cl",
    opencl: VECTOR_ADD_CL,
    wgsl: Some(VECTOR_ADD_WGSL),
};

/// 2-D valid-region convolution over `uint`s.
pub const CONVOLUTION: Sample = Sample {
    kernel: "convolve",
    file: "convolution.cl",
    opencl: CONVOLUTION_CL,
    wgsl: Some(CONVOLUTION_WGSL),
};

/// Orthographic ray cast of a sphere into a character canvas.
pub const RAY_CAST: Sample = Sample {
    kernel: "cast_rays",
    file: "ray_cast.cl",
    opencl: RAY_CAST_CL,
    wgsl: None,
};

/// Sparse byte writer.
pub const STAMP: Sample = Sample {
    kernel: "stamp",
    file: "stamp.cl",
    opencl: STAMP_CL,
    wgsl: None,
};

/// Every sample.
pub const ALL: [Sample; 4] = [VECTOR_ADD, CONVOLUTION, RAY_CAST, STAMP];

/// Side of the convolution input grid.
pub const IN_DIM: usize = 8;
/// Side of the convolution mask.
pub const MASK_DIM: usize = 3;
/// Side of the convolution output grid.
pub const OUT_DIM: usize = IN_DIM - MASK_DIM + 1;

/// The convolution input grid, row-major.
#[rustfmt::skip]
pub const CONVOLUTION_INPUT: [u32; IN_DIM * IN_DIM] = [
    3, 1, 1, 4, 8, 2, 1, 3,
    4, 2, 1, 1, 2, 1, 2, 3,
    4, 4, 4, 4, 3, 2, 2, 2,
    9, 8, 3, 8, 9, 0, 0, 0,
    9, 3, 3, 9, 0, 0, 0, 0,
    0, 9, 0, 8, 0, 0, 0, 0,
    3, 0, 8, 8, 9, 4, 4, 4,
    5, 9, 8, 1, 8, 1, 1, 1,
];

/// Neighbourhood-sum mask: ones everywhere except the centre.
#[rustfmt::skip]
pub const CONVOLUTION_MASK: [u32; MASK_DIM * MASK_DIM] = [
    1, 1, 1,
    1, 0, 1,
    1, 1, 1,
];

/// Side of the ray-cast canvas.
pub const IMG_DIM: usize = 16;

// ── host kernels ────────────────────────────────────────────────────────────

/// Host body of `vector_add(a, b, c)`.
pub fn vector_add(item: &WorkItem, args: &ArgView<'_>, out: &mut Stores) {
    let i = item.global_id(0);
    out.store(2, i, args.load::<f32>(0, i) + args.load::<f32>(1, i));
}

/// Host body of `convolve(input, mask, output, in_dim, mask_dim)`.
pub fn convolve(item: &WorkItem, args: &ArgView<'_>, out: &mut Stores) {
    let (x, y) = (item.global_id(0), item.global_id(1));
    let in_dim = args.scalar::<u32>(3) as usize;
    let mask_dim = args.scalar::<u32>(4) as usize;
    let out_dim = (in_dim + 1).saturating_sub(mask_dim);

    let mut sum = 0u32;
    for r in 0..mask_dim {
        for c in 0..mask_dim {
            let m = args.load::<u32>(1, r * mask_dim + c);
            let v = args.load::<u32>(0, (y + r) * in_dim + x + c);
            sum = sum.wrapping_add(m.wrapping_mul(v));
        }
    }
    out.store(2, y * out_dim + x, sum);
}

/// Host body of `cast_rays(starts, sphere, canvas, width)`.
pub fn cast_rays(item: &WorkItem, args: &ArgView<'_>, out: &mut Stores) {
    let width = args.scalar::<u32>(3) as usize;
    let i = item.global_id(1) * width + item.global_id(0);
    let start = args.load::<[f32; 4]>(0, i);
    let sphere = args.scalar::<[f32; 4]>(1);
    out.store(2, i, shade(start, sphere));
}

/// Host body of `stamp(canvas, stride, mark)`.
pub fn stamp(item: &WorkItem, args: &ArgView<'_>, out: &mut Stores) {
    let i = item.global_id(0);
    let stride = args.scalar::<u32>(1) as usize;
    if stride != 0 && i % stride == 0 {
        out.store(0, i, args.scalar::<u8>(2));
    }
}

fn shade(start: [f32; 4], sphere: [f32; 4]) -> u8 {
    let dx = start[0] - sphere[0];
    let dy = start[1] - sphere[1];
    if dx * dx + dy * dy <= sphere[3] * sphere[3] { b'#' } else { b'.' }
}

/// Host implementations of every sample, each tied to its sample source.
#[must_use]
pub fn library() -> KernelLibrary {
    KernelLibrary::new()
        .with_source(VECTOR_ADD.kernel, VECTOR_ADD_CL, vector_add)
        .with_source(CONVOLUTION.kernel, CONVOLUTION_CL, convolve)
        .with_source(RAY_CAST.kernel, RAY_CAST_CL, cast_rays)
        .with_source(STAMP.kernel, STAMP_CL, stamp)
}

/// A reference driver on the standard platform with [`library`] loaded.
#[must_use]
pub fn reference_driver() -> Arc<ReferenceDriver> {
    Arc::new(ReferenceDriver::new(library()))
}

// ── CPU versions ────────────────────────────────────────────────────────────

/// Valid-region convolution of a square `input` with a square `mask`.
#[must_use]
pub fn convolve_cpu(input: &[u32], in_dim: usize, mask: &[u32], mask_dim: usize) -> Vec<u32> {
    let out_dim = (in_dim + 1).saturating_sub(mask_dim);
    let mut output = vec![0u32; out_dim * out_dim];
    for y in 0..out_dim {
        for x in 0..out_dim {
            let mut sum = 0u32;
            for r in 0..mask_dim {
                for c in 0..mask_dim {
                    sum = sum.wrapping_add(mask[r * mask_dim + c].wrapping_mul(input[(y + r) * in_dim + x + c]));
                }
            }
            output[y * out_dim + x] = sum;
        }
    }
    output
}

/// Ray origins for a `dim`×`dim` canvas: element `i * dim + j` starts at
/// `(i, j, 0)`.
#[must_use]
pub fn ray_starts(dim: usize) -> Vec<[f32; 4]> {
    (0..dim * dim)
        .map(|k| [(k / dim) as f32, (k % dim) as f32, 0.0, 0.0])
        .collect()
}

/// What `cast_rays` draws for `starts`.
#[must_use]
pub fn cast_rays_cpu(starts: &[[f32; 4]], sphere: [f32; 4]) -> Vec<u8> {
    starts.iter().map(|&s| shade(s, sphere)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convolution_reference_values() {
        let out = convolve_cpu(&CONVOLUTION_INPUT, IN_DIM, &CONVOLUTION_MASK, MASK_DIM);
        assert_eq!(out.len(), OUT_DIM * OUT_DIM);
        // Top-left: 3+1+1 + 4+1 + 4+4+4
        assert_eq!(out[0], 22);
        assert_eq!(&out[..6], &[22, 21, 27, 25, 22, 16]);
        assert_eq!(out[OUT_DIM * OUT_DIM - 1], 11);
    }

    #[test]
    fn sources_by_dialect() {
        assert!(VECTOR_ADD.source(SourceDialect::Wgsl).is_some());
        assert!(RAY_CAST.source(SourceDialect::Wgsl).is_none());
        for sample in ALL {
            let src = sample.source(SourceDialect::OpenClC).unwrap();
            assert!(src.contains(&format!("__kernel void {}(", sample.kernel)));
        }
        assert_eq!(library().names(), vec!["cast_rays", "convolve", "stamp", "vector_add"]);
    }

    #[test]
    fn ray_starts_layout() {
        let starts = ray_starts(4);
        assert_eq!(starts[4 + 2], [1.0, 2.0, 0.0, 0.0]);
        let canvas = cast_rays_cpu(&starts, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(canvas.iter().filter(|&&c| c == b'#').count(), 3);
    }
}
