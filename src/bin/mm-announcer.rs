//! Matchmaking announcer CLI tool
//!
//! Writes match-creation announcements onto the partitioned matchmaking
//! streams, the way the matchmaking service would, for manual testing.
//!
//! Usage:
//!   cargo run --bin mm-announcer -- announce --match-id m1
//!   cargo run --bin mm-announcer -- announce --count 5 --game sudoku
//!   cargo run --bin mm-announcer -- ping

use anyhow::Result;
use clap::{Parser, Subcommand};
use sudoku_engine::partition::Partitioner;
use sudoku_engine::store::{MatchStore, RedisConfig, RedisStore};
use sudoku_engine::MatchmakingAnnouncement;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "mm-announcer")]
#[command(about = "Publish matchmaking announcements for the sudoku engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Redis URL
    #[arg(long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Base name of the matchmaking streams
    #[arg(long, default_value = "mm:matches")]
    stream_prefix: String,

    /// Partition count of the matchmaking streams
    #[arg(long, default_value = "3")]
    partitions: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Announce one or more new matches
    Announce {
        /// Match id; a random one is generated per match when omitted
        #[arg(short, long)]
        match_id: Option<String>,
        /// Game tag carried by the announcement
        #[arg(short, long, default_value = "sudoku")]
        game: String,
        /// Number of announcements (only with a generated id)
        #[arg(short, long, default_value = "1")]
        count: u32,
    },
    /// Test the Redis connection
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let store = RedisStore::connect(RedisConfig {
        url: cli.redis_url.clone(),
        max_retries: 1,
        ..RedisConfig::default()
    })
    .await?;

    match cli.command {
        Commands::Ping => {
            store.ping().await?;
            println!("Connected to {}", cli.redis_url);
        }
        Commands::Announce {
            match_id,
            game,
            count,
        } => {
            let partitioner = Partitioner::new(cli.partitions);
            let ids: Vec<String> = match match_id {
                Some(id) => vec![id],
                None => (0..count.max(1)).map(|_| Uuid::new_v4().to_string()).collect(),
            };

            for match_id in ids {
                let stream = partitioner.name_for(&cli.stream_prefix, &match_id);
                let announcement = MatchmakingAnnouncement {
                    game: game.clone(),
                    match_id: match_id.clone(),
                };
                let entry_id = store.append(&stream, announcement.to_fields()).await?;
                println!("{} -> {} ({})", match_id, stream, entry_id);
            }
        }
    }

    Ok(())
}
