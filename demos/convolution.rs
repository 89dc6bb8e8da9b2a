use briny_cl::samples::{CONVOLUTION_INPUT, CONVOLUTION_MASK, IN_DIM, MASK_DIM, OUT_DIM};
use briny_cl::*;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = HarnessConfig::from_env().or_exit("bad configuration");
    let session = Session::open_or_exit(samples::reference_driver(), &config);
    let program = session
        .build_named(samples::CONVOLUTION.file)
        .or_else(|err| {
            tracing::warn!(%err, "falling back to the built-in convolution source");
            session.build(samples::CONVOLUTION_CL)
        })
        .or_exit("failed to build convolve");

    let input = session
        .buffer_from(MemAccess::ReadOnly, &CONVOLUTION_INPUT)
        .or_exit("failed to allocate input");
    let mask = session
        .buffer_from(MemAccess::ReadOnly, &CONVOLUTION_MASK)
        .or_exit("failed to allocate mask");
    let mut output = session
        .buffer(MemAccess::WriteOnly, OUT_DIM * OUT_DIM * 4)
        .or_exit("failed to allocate output");

    let (in_dim, mask_dim) = (IN_DIM as u32, MASK_DIM as u32);
    let mut kernel = program.create_kernel("convolve").or_exit("failed to create kernel");
    kernel
        .set_args(&[
            KernelArg::Buffer(&input),
            KernelArg::Buffer(&mask),
            KernelArg::Buffer(&output),
            KernelArg::scalar(&in_dim),
            KernelArg::scalar(&mask_dim),
        ])
        .or_exit("failed to set kernel arguments");
    kernel
        .enqueue(session.queue(), &NdRange::new([OUT_DIM, OUT_DIM]).local([2, 2]))
        .or_exit("failed to enqueue kernel");

    let result: Vec<u32> = output.read_to_vec(session.queue()).or_exit("failed to read results");
    for row in result.chunks(OUT_DIM) {
        let line: Vec<String> = row.iter().map(|v| format!("{v:3}")).collect();
        println!("{}", line.join(" "));
    }
}
