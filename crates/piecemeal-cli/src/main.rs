mod app;
mod config;
mod console;
mod logging;
mod serve;

use anyhow::{bail, Context, Result};
use app::{progress_file_name, puzzle_file_name, App};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use console::EventSink;
use piecemeal_core::PieceId;
use piecemeal_engine::{CompletionOutcome, RewardStatus, WipeTarget};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "piecemeal")]
#[command(about = "Puzzle piece drops for chat communities", long_about = None)]
struct Cli {
    /// Config file (default: $PIECEMEAL_CONFIG or ~/.config/piecemeal/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Data document, overrides `data_path`
    #[arg(long, global = true)]
    data: Option<PathBuf>,
    /// Asset root, overrides `asset_root`
    #[arg(long, global = true)]
    assets: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the drop scheduler and read platform events from stdin
    Serve {
        #[arg(long)]
        tick_secs: Option<u64>,
    },
    /// Give a user a piece
    Grant {
        user: String,
        puzzle: String,
        piece: PieceId,
    },
    /// Take a piece away from a user
    Revoke {
        user: String,
        puzzle: String,
        piece: PieceId,
    },
    /// Clear collected pieces for one user or everyone
    #[command(group(ArgGroup::new("target").required(true).args(["user", "all"])))]
    Wipe {
        puzzle: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Check puzzles and channel configs
    Validate,
    /// Drop a piece on a channel now
    Spawn { channel: String },
    /// Rankings for one puzzle, or overall
    Leaderboard { puzzle: Option<String> },
    /// Render a puzzle with an explicit set of pieces
    Render {
        puzzle: String,
        #[arg(long, value_delimiter = ',')]
        owned: Vec<PieceId>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Render a user's progress
    Progress {
        user: String,
        puzzle: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Retry a completion reward that failed earlier
    RetryReward { user: String, puzzle: String },
    /// Settle a reward grant whose outcome was never saved
    ResolveReward {
        user: String,
        puzzle: String,
        /// The reward did reach the user; without this flag it may be granted again
        #[arg(long, default_value_t = false)]
        granted: bool,
    },
    /// Re-run completion detection for a user and puzzle
    CheckCompletion { user: String, puzzle: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = config::config_path(cli.config.as_deref());
    let mut settings = config::load_settings(&config_path)?;
    if let Some(data) = cli.data {
        settings.data_path = data;
    }
    if let Some(assets) = cli.assets {
        settings.asset_root = assets;
    }
    let log_file = logging::init_logging(cli.debug, settings.log_file_path().as_deref());
    info!(
        event = "config_loaded",
        path = %config_path.display(),
        log_file = ?log_file
    );

    let app = App::open(settings, EventSink::stdout())?;
    let now = Utc::now();

    match cli.command {
        Commands::Serve { tick_secs } => {
            let tick = match tick_secs {
                Some(secs) => Duration::from_secs(secs.max(1)),
                None => app.settings.tick_interval(),
            };
            serve::run(&app, tick).await?;
        }
        Commands::Grant {
            user,
            puzzle,
            piece,
        } => {
            let outcome = app.admin.grant_piece(&user, &puzzle, piece, now)?;
            if outcome.added {
                println!("Granted piece #{piece} of {puzzle} to {user}");
            } else {
                println!("{user} already owns piece #{piece} of {puzzle}");
            }
            if let Some(completion) = &outcome.completion {
                print_completion(&user, &puzzle, completion);
            }
        }
        Commands::Revoke {
            user,
            puzzle,
            piece,
        } => {
            if app.admin.revoke_piece(&user, &puzzle, piece)? {
                println!("Removed piece #{piece} of {puzzle} from {user}");
            } else {
                println!("{user} does not own piece #{piece} of {puzzle}");
            }
        }
        Commands::Wipe { puzzle, user, all } => {
            let target = match (user, all) {
                (Some(user), false) => WipeTarget::User(user),
                (None, true) => WipeTarget::All,
                _ => bail!("wipe needs exactly one of --user or --all"),
            };
            let affected = app.admin.wipe(&puzzle, &target)?;
            match target {
                WipeTarget::User(user) => {
                    println!("Wiped {affected} pieces of {puzzle} from {user}")
                }
                WipeTarget::All => println!("Wiped {puzzle} for {affected} users"),
            }
        }
        Commands::Validate => {
            let issues = app.admin.validate_config();
            if issues.is_empty() {
                println!("Config OK");
            } else {
                for issue in &issues {
                    println!("- {issue}");
                }
                bail!("{} config issues found", issues.len());
            }
        }
        Commands::Spawn { channel } => {
            let spawned = app.admin.force_spawn(&channel, now)?;
            println!(
                "Dropped piece #{} of {} in {} (session {}, {} slots)",
                spawned.piece_id,
                spawned.slug,
                spawned.channel_id,
                spawned.session_id,
                spawned.claim_limit
            );
        }
        Commands::Leaderboard { puzzle } => match puzzle {
            Some(puzzle) => {
                let ranked = app.leaderboard.rank(&puzzle)?;
                if ranked.is_empty() {
                    println!("Nobody has collected {puzzle} yet");
                }
                for (index, entry) in ranked.iter().enumerate() {
                    let finisher = entry
                        .finisher_position
                        .map(|position| format!("  finisher #{position}"))
                        .unwrap_or_default();
                    println!("{:>3}. {} {}{}", index + 1, entry.user_id, entry.count, finisher);
                }
            }
            None => {
                for (index, entry) in app.leaderboard.overall().iter().enumerate() {
                    println!(
                        "{:>3}. {} completed {} pieces {}",
                        index + 1,
                        entry.user_id,
                        entry.completed,
                        entry.pieces
                    );
                }
            }
        },
        Commands::Render { puzzle, owned, out } => {
            let rendered = app.render_owned(&puzzle, &owned)?;
            let path = app.write_render(&rendered, out.as_deref(), &puzzle_file_name(&puzzle)?)?;
            println!("{} ({}) -> {}", puzzle, rendered.label, path.display());
        }
        Commands::Progress { user, puzzle, out } => {
            let file_name = progress_file_name(&puzzle, &user)?;
            let rendered = app.render_progress(&user, &puzzle)?;
            let path = app.write_render(&rendered, out.as_deref(), &file_name)?;
            println!("{user} on {puzzle}: {} -> {}", rendered.label, path.display());
        }
        Commands::RetryReward { user, puzzle } => {
            let status = app
                .admin
                .retry_reward(&user, &puzzle)
                .with_context(|| format!("Failed to retry reward for {user} on {puzzle}"))?;
            print_reward(&user, &puzzle, &status);
        }
        Commands::ResolveReward {
            user,
            puzzle,
            granted,
        } => {
            if app.admin.resolve_reward(&user, &puzzle, granted)? {
                let verdict = if granted { "granted" } else { "not granted" };
                println!("Reward for {puzzle} to {user} recorded as {verdict}");
            } else {
                println!("No unsettled reward for {puzzle} to {user}");
            }
        }
        Commands::CheckCompletion { user, puzzle } => {
            let outcome = app
                .admin
                .check_completion(&user, &puzzle, now)
                .with_context(|| format!("Failed to check {puzzle} for {user}"))?;
            print_completion(&user, &puzzle, &outcome);
        }
    }

    Ok(())
}

fn print_completion(user: &str, puzzle: &str, completion: &CompletionOutcome) {
    match completion {
        CompletionOutcome::Incomplete { owned, total } => {
            println!("{user} has {owned}/{total} pieces of {puzzle}")
        }
        CompletionOutcome::AlreadyRecorded => println!("{user} already completed {puzzle}"),
        CompletionOutcome::Completed {
            finisher_position,
            reward,
        } => {
            println!("{user} completed {puzzle} (finisher #{finisher_position})");
            print_reward(user, puzzle, reward);
        }
    }
}

fn print_reward(user: &str, puzzle: &str, status: &RewardStatus) {
    match status {
        RewardStatus::NotConfigured => println!("{puzzle} has no reward"),
        RewardStatus::Granted => println!("Reward for {puzzle} granted to {user}"),
        RewardStatus::AlreadyGranted => println!("{user} already has the {puzzle} reward"),
        RewardStatus::Failed(reason) => {
            println!("Reward for {puzzle} not granted to {user}: {reason}")
        }
        RewardStatus::Unconfirmed => println!(
            "Reward for {puzzle} to {user} may have been granted; \
             confirm it, then run resolve-reward"
        ),
    }
}
