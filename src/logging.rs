use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "APPVISOR_LOG";

pub fn init(verbose: bool) {
    let default = if verbose { "appvisor=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
