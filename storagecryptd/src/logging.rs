use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "storagecryptd=info,storagecrypt_core=info";

/// Installs the stderr subscriber. `RUST_LOG` overrides the default filter.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
