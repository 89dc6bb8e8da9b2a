use briny_cl::driver::reference::{DriverOp, ObjectKind, ReferenceDriver};
use briny_cl::*;
use parking_lot::Mutex;
use std::sync::Arc;

const BROKEN: &str = "__kernel void broken(__global flaot *x) {}\n";

fn open_with(policy: ErrorPolicy) -> (Arc<ReferenceDriver>, Session) {
    let driver = samples::reference_driver();
    let config = HarnessConfig::builder().error_policy(policy).build().unwrap();
    let session = Session::open(driver.clone(), &config).unwrap();
    (driver, session)
}

fn open() -> (Arc<ReferenceDriver>, Session) {
    open_with(ErrorPolicy::LogOnly)
}

#[test]
fn test_build_failure_carries_log() {
    let (driver, session) = open();
    let err = session.build(BROKEN).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Build);
    assert_eq!(err.status(), Some(Status::BUILD_PROGRAM_FAILURE));

    let log = err.build_log().unwrap();
    assert!(log.starts_with("<source>:1:"), "{log}");
    assert!(log.contains("error: unknown type name 'flaot'"), "{log}");
    assert!(log.contains("__kernel void broken(__global flaot *x) {}"), "{log}");
    assert!(log.trim_end().ends_with("generated."), "{log}");
    // Display includes the whole log.
    assert!(err.to_string().contains(log));

    let ledger = driver.ledger();
    assert_eq!(ledger.created(ObjectKind::Program), 1);
    assert_eq!(ledger.live(ObjectKind::Program), 0);
    assert_eq!(ledger.created(ObjectKind::Kernel), 0);
    drop(session);
    assert!(driver.ledger().is_balanced());
}

#[test]
fn test_edited_sample_body_does_not_build() {
    let (_driver, session) = open();
    let edited = samples::VECTOR_ADD_CL.replace("a[i] + b[i]", "a[i] - b[i]");
    let err = session.build(&edited).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Build);
    let log = err.build_log().unwrap();
    assert!(log.contains("error: body of kernel 'vector_add' differs"), "{log}");

    // A host kernel only exists for the registered sample names.
    let err = session
        .build("__kernel void scale(__global float *x) { x[get_global_id(0)] *= 2.0f; }")
        .unwrap_err();
    assert!(err.build_log().unwrap().contains("no host implementation registered for kernel 'scale'"));
}

#[test]
fn test_unknown_kernel_name() {
    let (_driver, session) = open();
    let program = session.build(samples::VECTOR_ADD_CL).unwrap();
    let err = program.create_kernel("vector_sub").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceCreation);
    assert_eq!(err.status(), Some(Status::INVALID_KERNEL_NAME));
}

#[test]
fn test_argument_size_mismatch() {
    let (_driver, session) = open();
    let program = session.build(samples::CONVOLUTION_CL).unwrap();
    let mut kernel = program.create_kernel("convolve").unwrap();
    let err = kernel.set_arg(3, KernelArg::scalar(&8u8)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentBinding);
    assert_eq!(err.status(), Some(Status::INVALID_ARG_SIZE));
    match err {
        Error::ArgumentBinding { kernel, index, .. } => {
            assert_eq!(kernel, "convolve");
            assert_eq!(index, 3);
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = kernel.set_arg(5, KernelArg::scalar(&8u32)).unwrap_err();
    assert_eq!(err.status(), Some(Status::INVALID_ARG_INDEX));
}

#[test]
fn test_dispatch_rejections() {
    let (_driver, session) = open();
    let program = session.build(samples::CONVOLUTION_CL).unwrap();
    let input = session.buffer_from(MemAccess::ReadOnly, &samples::CONVOLUTION_INPUT).unwrap();
    let mask = session.buffer_from(MemAccess::ReadOnly, &samples::CONVOLUTION_MASK).unwrap();
    let output = session.buffer(MemAccess::WriteOnly, samples::OUT_DIM * samples::OUT_DIM * 4).unwrap();

    let mut kernel = program.create_kernel("convolve").unwrap();
    let err = kernel
        .enqueue(session.queue(), &NdRange::new([6, 6]).local([2, 2]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dispatch);
    assert_eq!(err.status(), Some(Status::INVALID_KERNEL_ARGS));

    let (in_dim, mask_dim) = (samples::IN_DIM as u32, samples::MASK_DIM as u32);
    kernel
        .set_args(&[
            KernelArg::Buffer(&input),
            KernelArg::Buffer(&mask),
            KernelArg::Buffer(&output),
            KernelArg::scalar(&in_dim),
            KernelArg::scalar(&mask_dim),
        ])
        .unwrap();
    let err = kernel
        .enqueue(session.queue(), &NdRange::new([6, 6]).local([4, 4]))
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::INVALID_WORK_GROUP_SIZE));
    let err = kernel.enqueue(session.queue(), &NdRange::new([6, 0])).unwrap_err();
    assert_eq!(err.status(), Some(Status::INVALID_GLOBAL_WORK_SIZE));
    let err = kernel.enqueue(session.queue(), &NdRange::new([usize::MAX, 2])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dispatch);
    assert_eq!(err.status(), Some(Status::INVALID_GLOBAL_WORK_SIZE));
    assert!(kernel.enqueue(session.queue(), &NdRange::new([6, 6]).local([2, 2])).is_ok());
}

#[test]
fn test_read_only_store_is_reported() {
    let reports = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&reports);
    let (driver, session) = open_with(ErrorPolicy::report(move |msg| sink.lock().push(msg.to_owned())));
    {
        let program = session.build(samples::VECTOR_ADD_CL).unwrap();
        let a = [1.0f32; 8];
        let buf_a = session.buffer_from(MemAccess::ReadOnly, &a).unwrap();
        let buf_b = session.buffer_from(MemAccess::ReadOnly, &a).unwrap();
        let mut out = session.buffer(MemAccess::ReadOnly, 8 * 4).unwrap();

        let mut kernel = program.create_kernel("vector_add").unwrap();
        kernel
            .set_args(&[KernelArg::Buffer(&buf_a), KernelArg::Buffer(&buf_b), KernelArg::Buffer(&out)])
            .unwrap();
        kernel.enqueue(session.queue(), &NdRange::linear(8)).unwrap();

        let values: Vec<f32> = out.read_to_vec(session.queue()).unwrap();
        assert_eq!(values, vec![0.0; 8]);
    }
    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("READ_ONLY argument 2"), "{}", reports[0]);
    drop(session);
    assert!(driver.ledger().is_balanced());
}

#[test]
fn test_read_only_host_buffer_cannot_be_written() {
    let (_driver, session) = open();
    let mut buf = session.buffer_from(MemAccess::ReadOnly, &[1u32, 2]).unwrap();
    let err = buf.map_for_write(session.queue()).unwrap_err();
    assert!(matches!(err, Error::ReadOnlyMapWrite));
    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert!(!buf.is_mapped());
    assert_eq!(buf.read_to_vec::<u32>(session.queue()).unwrap(), vec![1, 2]);
}

#[test]
fn test_double_map() {
    let (driver, session) = open();
    let mut buf = session.buffer(MemAccess::ReadWrite, 16).unwrap();
    let view = buf.map_for_read(session.queue()).unwrap();
    std::mem::forget(view);
    assert!(buf.is_mapped());

    let err = buf.map_for_write(session.queue()).unwrap_err();
    assert!(matches!(err, Error::AlreadyMapped));
    assert_eq!(driver.outstanding_maps(), 1);
}

#[test]
fn test_view_index_past_the_end() {
    let (_driver, session) = open();
    let mut buf = session.buffer_from(MemAccess::ReadWrite, &[7u32, 8]).unwrap();
    let mut view = buf.map_for_write(session.queue()).unwrap();
    assert_eq!(view.get::<u32>(1), Some(8));
    assert_eq!(view.get::<u32>(2), None);
    assert_eq!(view.get::<u32>(usize::MAX / 4), None);
    assert_eq!(view.get::<u64>(usize::MAX / 8), None);
    assert!(!view.set(usize::MAX / 4, 1u32));
    assert!(!view.set(usize::MAX, 1u8));
    assert!(view.set(0, 9u32));
    view.unmap().unwrap();
    assert_eq!(buf.read_to_vec::<u32>(session.queue()).unwrap(), vec![9, 8]);
}

#[test]
fn test_view_to_vec_of_unaligned_width() {
    let (_driver, session) = open();
    let mut buf = session.buffer_from(MemAccess::ReadWrite, &[1u16, 2, 3]).unwrap();
    let view = buf.map_for_read(session.queue()).unwrap();
    assert_eq!(view.to_vec::<u16>().unwrap(), vec![1, 2, 3]);
    assert!(matches!(view.to_vec::<u32>(), Err(Error::ViewCast { len: 6, elem: 4 })));
    view.unmap().unwrap();
}

#[test]
fn test_dispatch_while_mapped() {
    let (_driver, session) = open();
    let program = session.build(samples::STAMP_CL).unwrap();
    let mut canvas = session.buffer(MemAccess::ReadWrite, 8).unwrap();
    let mut kernel = program.create_kernel("stamp").unwrap();
    kernel
        .set_args(&[KernelArg::Buffer(&canvas), KernelArg::scalar(&2u32), KernelArg::scalar(&b'*')])
        .unwrap();

    let view = canvas.map_for_read(session.queue()).unwrap();
    let err = kernel.enqueue(session.queue(), &NdRange::linear(8)).unwrap_err();
    assert!(matches!(err, Error::BufferMapped { index: 0, .. }));
    view.unmap().unwrap();
    assert!(kernel.enqueue(session.queue(), &NdRange::linear(8)).is_ok());
}

#[test]
fn test_injected_allocation_failure_releases_everything() {
    let (driver, session) = open();
    {
        let program = session.build(samples::VECTOR_ADD_CL).unwrap();
        let _kernel = program.create_kernel("vector_add").unwrap();
        let _a = session.buffer(MemAccess::ReadOnly, 64).unwrap();

        driver.inject_fault(DriverOp::CreateBuffer, Status::MEM_OBJECT_ALLOCATION_FAILURE);
        let err = session.buffer(MemAccess::ReadOnly, 64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceCreation);
        assert!(matches!(
            err,
            Error::BufferCreateFailed {
                size: 64,
                status: Status::MEM_OBJECT_ALLOCATION_FAILURE
            }
        ));

        // The fault fires once.
        assert!(session.buffer(MemAccess::ReadOnly, 64).is_ok());
    }
    drop(session);
    let ledger = driver.ledger();
    assert_eq!(ledger.live(ObjectKind::MemObject), 0);
    assert!(ledger.is_balanced());
}

#[test]
fn test_injected_queue_failure() {
    let driver = samples::reference_driver();
    driver.inject_fault(DriverOp::CreateCommandQueue, Status::OUT_OF_HOST_MEMORY);
    let config = HarnessConfig::builder()
        .error_policy(ErrorPolicy::LogOnly)
        .build()
        .unwrap();
    let err = Session::open(driver.clone(), &config).unwrap_err();
    assert_eq!(err.status(), Some(Status::OUT_OF_HOST_MEMORY));
    assert!(driver.ledger().is_balanced());
}

#[test]
fn test_bad_config_is_rejected_before_discovery() {
    let driver = samples::reference_driver();
    let mut config = HarnessConfig::default();
    config.build_options = "-DX\0".into();
    let err = Session::open(driver.clone(), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(driver.context_requests().is_empty());
}

#[test]
fn test_error_context() {
    let (_driver, session) = open();
    let err = session
        .build(BROKEN)
        .context("building the broken sample")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Build);
    assert!(err.build_log().is_some());
    assert!(err.to_string().starts_with("building the broken sample: "));
}
