use briny_cl::driver::opencl::OpenClDriver;
use briny_cl::*;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LEN: usize = 1024;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = HarnessConfig::from_env().or_exit("bad configuration");
    let session = Session::open_or_exit(Arc::new(OpenClDriver::new()), &config);
    let program = session.build(samples::VECTOR_ADD_CL).or_exit("failed to build vector_add");

    let a: Vec<f32> = (0..LEN).map(|i| i as f32).collect();
    let b: Vec<f32> = (0..LEN).map(|i| (LEN - i) as f32).collect();
    let buf_a = session.buffer_from(MemAccess::ReadOnly, &a).or_exit("failed to allocate a");
    let buf_b = session.buffer_from(MemAccess::ReadOnly, &b).or_exit("failed to allocate b");
    let mut buf_c = session.buffer(MemAccess::WriteOnly, LEN * 4).or_exit("failed to allocate c");

    let mut kernel = program.create_kernel("vector_add").or_exit("failed to create kernel");
    kernel
        .set_args(&[KernelArg::Buffer(&buf_a), KernelArg::Buffer(&buf_b), KernelArg::Buffer(&buf_c)])
        .or_exit("failed to set kernel arguments");
    kernel
        .enqueue(session.queue(), &NdRange::linear(LEN))
        .or_exit("failed to enqueue kernel");

    let c: Vec<f32> = buf_c.read_to_vec(session.queue()).or_exit("failed to read results");
    let wrong = c.iter().filter(|&&v| v != LEN as f32).count();
    println!("{} on {}: {wrong} of {LEN} sums wrong", session.queue().device_info().name, session.context().platform_name());
}
