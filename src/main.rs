use dotenv::dotenv;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();

    let app = loris_tunnel::App::new()?;
    info!(config = %app.config_path().display(), "daemon initialized");

    app.startup().await;

    tokio::signal::ctrl_c().await?;
    app.shutdown().await;

    Ok(())
}

fn init_tracing() {
    let level = match std::env::var("LORIS_TUNNEL_LOG_LEVEL")
        .unwrap_or_default()
        .trim()
        .to_lowercase()
        .as_str()
    {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();
}
