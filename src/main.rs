use chat_relay::relay::{RelayConfig, RelayError, RelayState};
use chat_relay::server;
use clap::Parser;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(about = "Relays chat requests to a completion provider and streams the reply back")]
struct CliArgs {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    #[arg(long, default_value = "https://api.openai.com/v1/chat/completions")]
    upstream_url: String,

    #[arg(long, default_value = "o3-mini")]
    model: String,

    #[arg(long, default_value_t = 4000)]
    max_completion_tokens: u32,

    /// Ceiling in seconds for one whole request, stream included.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // The relay cannot authenticate upstream without this; refuse to start.
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| RelayError::MissingCredential("OPENAI_API_KEY"))?;

    let config = RelayConfig {
        host: args.host,
        port: args.port,
        upstream_url: args.upstream_url,
        model: args.model,
        max_completion_tokens: args.max_completion_tokens,
        timeout: args.timeout,
        api_key,
    };
    let relay_state = RelayState::new(&config)?;

    actix_web::rt::System::new().block_on(async move {
        tokio::select! {
            res = server::startup(config, relay_state) => {
                res.map_err(anyhow::Error::from)
            }
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down");
                Ok(())
            }
        }
    })
}
