mod api;
mod repl;

use tracing_subscriber::EnvFilter;

use api::ApiClient;
use repl::Repl;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,companion=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let api_client = ApiClient::from_env();
    tracing::info!("Backend API: {}", api_client.base_url());

    let persona_id = std::env::var("COMPANION_PERSONA")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| "assistant".to_string());

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(Repl::new(api_client, persona_id).run()) {
        tracing::error!("Companion exited with error: {:#}", e);
        std::process::exit(1);
    }
}
