use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = botmon_chatbot::app::run().await {
        tracing::error!("chatbot test console failed: {err}");
        std::process::exit(1);
    }
}
