use anyhow::Result;
use turnstile_server::config::Config;
use turnstile_server::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration from environment variables and CLI arguments
    let config = Config::from_env_and_args()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("turnstile={}", config.log_level).parse()?)
                .add_directive(format!("turnstile_server={}", config.log_level).parse()?),
        )
        .init();

    server::run(config).await
}
