use briny_cl::samples::IMG_DIM;
use briny_cl::*;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = HarnessConfig::from_env().or_exit("bad configuration");
    let session = Session::open_or_exit(samples::reference_driver(), &config);
    let program = session.build(samples::RAY_CAST_CL).or_exit("failed to build cast_rays");

    let mut starts = session
        .buffer(MemAccess::ReadOnly, IMG_DIM * IMG_DIM * 16)
        .or_exit("failed to allocate ray starts");
    starts
        .write_from_slice(session.queue(), &samples::ray_starts(IMG_DIM))
        .or_exit("failed to upload ray starts");

    let mut canvas = session
        .buffer(MemAccess::WriteOnly, IMG_DIM * IMG_DIM)
        .or_exit("failed to allocate canvas");

    let centre = (IMG_DIM / 2) as f32;
    let sphere = [centre, centre, 0.0f32, centre * 0.75];
    let width = IMG_DIM as u32;
    let mut kernel = program.create_kernel("cast_rays").or_exit("failed to create kernel");
    kernel
        .set_args(&[
            KernelArg::Buffer(&starts),
            KernelArg::scalar(&sphere),
            KernelArg::Buffer(&canvas),
            KernelArg::scalar(&width),
        ])
        .or_exit("failed to set kernel arguments");
    kernel
        .enqueue(session.queue(), &NdRange::new([IMG_DIM, IMG_DIM]))
        .or_exit("failed to enqueue kernel");

    let pixels: Vec<u8> = canvas.read_to_vec(session.queue()).or_exit("failed to read canvas");
    for row in pixels.chunks(IMG_DIM) {
        println!("{}", String::from_utf8_lossy(row));
    }
}
