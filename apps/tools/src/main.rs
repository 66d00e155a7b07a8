use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use server_api::{filter_options, historical_events, recent_events, ApiContext};
use shared::error::ApiError;
use storage::Storage;

#[derive(Parser, Debug)]
#[command(about = "Inspect a hook event store")]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/events.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Newest events, printed oldest first.
    Recent {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// One page of events strictly older than `before` (RFC 3339 or epoch ms).
    Historical {
        before: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    FilterOptions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = ApiContext {
        storage: Storage::new(&cli.database_url).await?,
    };

    match cli.command {
        Command::Recent { limit } => {
            print_json(&recent_events(&ctx, limit).await.map_err(describe)?)?;
        }
        Command::Historical { before, limit } => {
            let page = historical_events(&ctx, Some(before.as_str()), limit)
                .await
                .map_err(describe)?;
            print_json(&page)?;
        }
        Command::FilterOptions => {
            print_json(&filter_options(&ctx).await.map_err(describe)?)?;
        }
    }

    ctx.storage.close().await;
    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn describe(err: ApiError) -> anyhow::Error {
    anyhow!("{:?}: {}", err.code, err.message)
}
