use briny_cl::driver::DeviceClass;
use briny_cl::*;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let context = PlatformSelector::new(samples::reference_driver())
        .strategy(SelectionStrategy::FirstPlatformFallback)
        .select(DeviceClass::Gpu)
        .or_exit("failed to create a GPU or CPU context");

    println!("Selecting platform: {}", context.platform_name());
    println!("Context holds {} {} device(s)", context.num_devices().unwrap_or(0), context.class());
}
