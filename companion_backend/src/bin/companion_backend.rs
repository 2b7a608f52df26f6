use anyhow::{Context, Result};
use companion_backend::config::BackendConfig;
use companion_backend::runtime::BackendRuntime;
use companion_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,companion_backend=debug")),
        )
        .init();

    let config = BackendConfig::load();
    let runtime =
        BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting companion backend (data dir {:?}; override bind address with COMPANION_BACKEND_BIND)",
        runtime.config.data_dir
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime))
}
