use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tracing::debug;

use modelgate_core_sdk::{
    config::Config,
    conversation,
    llm::{self, ChatProvider},
    models::ChatRequest,
    registry::ProviderRegistry,
    server,
    stream::{translate, StreamEvent},
    telemetry,
};

/**
 * \brief Command-line entry for the gateway: run the server or talk to a provider directly.
 */
#[derive(Parser, Debug)]
#[command(name = "modelgate", version, about = "Multi-provider LLM gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief Start the HTTP gateway.
     */
    Serve {
        /** \brief HOST:PORT, overrides MODELGATE_HOST / PORT */
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief Send one prompt and print the reply as it streams in.
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = false)]
        no_stream: bool,
    },

    /**
     * \brief List models per provider.
     */
    Models {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().context("load configuration failed")?;
    telemetry::init(&config.telemetry()).context("init logging failed")?;

    match cli.command {
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                apply_addr(&mut config, &addr)?;
            }
            config.validate()?;
            server::run(&config).await?;
        }
        Commands::Chat {
            prompt,
            provider,
            model,
            no_stream,
        } => {
            let registry = build_registry(&config)?;
            let request = ChatRequest {
                provider,
                model,
                ..ChatRequest::from_prompt(prompt)
            };
            let messages = conversation::normalize(&request)?;
            let provider = registry.resolve(request.provider.as_deref())?;
            let model = provider.resolve_model(request.model.as_deref()).await;
            debug!(provider = provider.name(), model = %model, "cli chat");

            if no_stream {
                let reply = provider.generate(&messages, Some(&model)).await?;
                println!("{reply}");
                return Ok(());
            }

            let mut events = Box::pin(translate(provider, model, messages));
            let mut stdout = std::io::stdout();
            while let Some(event) = events.next().await {
                match event {
                    StreamEvent::Metadata { model, provider } => {
                        eprintln!("[{provider} / {model}]");
                    }
                    StreamEvent::Chunk { content } => {
                        print!("{content}");
                        stdout.flush().ok();
                    }
                    StreamEvent::Done => println!(),
                    StreamEvent::Error { message } => {
                        println!();
                        bail!("stream error: {message}");
                    }
                }
            }
        }
        Commands::Models { provider, refresh } => {
            let registry = build_registry(&config)?;
            let names = match provider {
                Some(name) => vec![registry.resolve(Some(&name))?.name().to_string()],
                None => registry.list_available(),
            };
            for name in names {
                let provider = registry.resolve(Some(&name))?;
                let models = provider.list_models(refresh).await?;
                let default = provider.default_model().await;
                println!("{name} (default: {default})");
                for model in models {
                    let marker = if model == default { "*" } else { " " };
                    println!("  {marker} {model}");
                }
            }
        }
    }

    Ok(())
}

fn build_registry(config: &Config) -> Result<ProviderRegistry> {
    let client = llm::http_client().context("build http client failed")?;
    Ok(ProviderRegistry::from_config(config, client))
}

fn apply_addr(config: &mut Config, addr: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("--addr must be HOST:PORT, got {addr}");
    };
    config.host = host.to_string();
    config.port = port
        .parse()
        .with_context(|| format!("invalid port in --addr: {port}"))?;
    Ok(())
}
