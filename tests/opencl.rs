//! Runs the sample kernels on whatever OpenCL runtime is installed. Every
//! test returns early when no platform or device can be opened.
#![cfg(feature = "opencl")]

use briny_cl::driver::opencl::OpenClDriver;
use briny_cl::driver::DeviceClass;
use briny_cl::*;
use std::sync::Arc;

fn open() -> Option<Session> {
    let driver = Arc::new(OpenClDriver::new());
    [DeviceClass::Gpu, DeviceClass::Cpu, DeviceClass::Accelerator]
        .into_iter()
        .find_map(|class| {
            let config = HarnessConfig::builder()
                .device_class(class)
                .strategy(SelectionStrategy::FirstMatching)
                .error_policy(ErrorPolicy::LogOnly)
                .build()
                .ok()?;
            Session::open(driver.clone(), &config).ok()
        })
}

#[test]
fn test_opencl_vector_add() {
    let Some(session) = open() else {
        return;
    };
    let program = session.build(samples::VECTOR_ADD_CL).unwrap();
    let a: Vec<f32> = (0..64).map(|i| i as f32).collect();
    let buf_a = session.buffer_from(MemAccess::ReadOnly, &a).unwrap();
    let buf_b = session.buffer_from(MemAccess::ReadOnly, &a).unwrap();
    let mut out = session.buffer(MemAccess::WriteOnly, 64 * 4).unwrap();

    let mut kernel = program.create_kernel("vector_add").unwrap();
    kernel
        .set_args(&[KernelArg::Buffer(&buf_a), KernelArg::Buffer(&buf_b), KernelArg::Buffer(&out)])
        .unwrap();
    kernel.enqueue(session.queue(), &NdRange::linear(64)).unwrap();
    let sums: Vec<f32> = out.read_to_vec(session.queue()).unwrap();
    assert!(sums.iter().enumerate().all(|(i, &s)| s == 2.0 * i as f32));
}

#[test]
fn test_opencl_convolution_matches_cpu() {
    let Some(session) = open() else {
        return;
    };
    let program = session.build(samples::CONVOLUTION_CL).unwrap();
    let input = session.buffer_from(MemAccess::ReadOnly, &samples::CONVOLUTION_INPUT).unwrap();
    let mask = session.buffer_from(MemAccess::ReadOnly, &samples::CONVOLUTION_MASK).unwrap();
    let mut output = session
        .buffer(MemAccess::WriteOnly, samples::OUT_DIM * samples::OUT_DIM * 4)
        .unwrap();

    let (in_dim, mask_dim) = (samples::IN_DIM as u32, samples::MASK_DIM as u32);
    let mut kernel = program.create_kernel("convolve").unwrap();
    kernel
        .set_args(&[
            KernelArg::Buffer(&input),
            KernelArg::Buffer(&mask),
            KernelArg::Buffer(&output),
            KernelArg::scalar(&in_dim),
            KernelArg::scalar(&mask_dim),
        ])
        .unwrap();
    kernel
        .enqueue(session.queue(), &NdRange::new([samples::OUT_DIM, samples::OUT_DIM]))
        .unwrap();
    let got: Vec<u32> = output.read_to_vec(session.queue()).unwrap();
    let expected = samples::convolve_cpu(
        &samples::CONVOLUTION_INPUT,
        samples::IN_DIM,
        &samples::CONVOLUTION_MASK,
        samples::MASK_DIM,
    );
    assert_eq!(got, expected);
}

#[test]
fn test_opencl_build_failure_has_log() {
    let Some(session) = open() else {
        return;
    };
    let err = session
        .build("__kernel void broken(__global flaot *x) {}\n")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Build);
    assert!(err.build_log().is_some_and(|log| !log.is_empty()));
}
