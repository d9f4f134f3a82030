use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use story_manager::{
    EngineConfig, FileStateStore, GameEvent, RecalcOutcome, StateStore, StoryEngine, WorldState,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod handlers;

#[derive(Parser)]
#[command(name = "story")]
#[command(about = "Inspect and drive a branching story history")]
#[command(version)]
struct Cli {
    /// Directory holding the story documents
    #[arg(long, env = "STORY_DATA_DIR", default_value = "./story-data")]
    data_dir: PathBuf,

    /// Engine configuration (TOML)
    #[arg(long, env = "STORY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a user turn
    User { text: String },
    /// Add an assistant page (a new swipe when the last turn is the assistant's)
    Assistant { text: String },
    /// Capture the initial world state from a JSON file
    Genesis { file: PathBuf },
    /// Select a swipe and rebuild the world state for it
    Swipe { turn: usize, page: usize },
    /// Fork the active branch after the given turn
    Branch { from_turn: usize },
    /// Make another branch active
    Switch { branch: String },
    /// Remove a turn from the active branch
    DeleteTurn { turn: usize },
    /// Print the current timeline
    Timeline,
    /// Print the event log, or the events leading to a message
    Events {
        #[arg(long)]
        until: Option<String>,
    },
    /// Rebuild the world state as of a message
    Recalc { message_id: String },
    /// Print the live world state
    State,
    /// Replace the history with a migrated v1 export
    Migrate { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(cli.debug)
                .with_line_number(cli.debug),
        )
        .init();

    let config = EngineConfig::load(cli.config.as_deref()).context("loading engine config")?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&cli.data_dir));
    let engine = StoryEngine::new(store, config)?;
    handlers::register_defaults(&engine);

    tracing::debug!(data_dir = %cli.data_dir.display(), "story: Store opened");

    match cli.command {
        Commands::User { text } => {
            let id = engine.history().add_user_turn(&text).await?;
            println!("{} {}", "user".cyan(), id);
        }
        Commands::Assistant { text } => {
            let id = engine.history().add_assistant_message_page(&text).await?;
            let added = engine.ingest_message(&id).await?;
            println!("{} {} ({} new events)", "assistant".magenta(), id, added);
        }
        Commands::Genesis { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let initial: WorldState = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", file.display()))?;
            engine.initialize_genesis(initial).await?;
            println!("{}", "Genesis captured".green());
        }
        Commands::Swipe { turn, page } => {
            match engine.history().set_active_page(turn, page).await? {
                Some(change) => {
                    println!(
                        "{} {} -> {}",
                        "swiped".cyan(),
                        change.previous_message_id.as_deref().unwrap_or("-"),
                        change.new_message_id
                    );
                    print_outcome(&engine.on_active_page_changed(&change).await);
                }
                None => println!("{}", "selection unchanged".dimmed()),
            }
        }
        Commands::Branch { from_turn } => {
            let id = engine.history().create_branch(from_turn).await?;
            println!("{} {}", "branch".cyan(), id);
        }
        Commands::Switch { branch } => {
            engine.history().switch_branch(&branch).await?;
            println!("{} {}", "active".cyan(), branch);
        }
        Commands::DeleteTurn { turn } => {
            engine.history().delete_turn(turn).await?;
            println!("{} turn {}", "deleted".yellow(), turn);
        }
        Commands::Timeline => print_timeline(&engine).await?,
        Commands::Events { until } => {
            let events = match until {
                Some(target) => engine.event_log().get_events_until(&target, None).await?,
                None => engine.event_log().reload().await?,
            };
            print_events(&events);
        }
        Commands::Recalc { message_id } => print_outcome(&engine.recalculate(&message_id).await),
        Commands::State => {
            let state = engine.world_state().await?;
            println!("{}", serde_json::to_string_pretty(&state.stripped(&[]))?);
        }
        Commands::Migrate { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let legacy: serde_json::Value = serde_json::from_str(&content)?;
            let history = engine.history().import_legacy(&legacy).await?;
            let turns = history.active_branch()?.len();
            println!("{} {} turns", "migrated".green(), turns);
        }
    }

    Ok(())
}

async fn print_timeline(engine: &StoryEngine) -> anyhow::Result<()> {
    let history = engine.history().load().await?;
    let branch = history.active_branch()?;
    println!(
        "{} {} ({} turns)",
        "branch".bold(),
        history.active_branch_id,
        branch.len()
    );

    for (index, turn) in &branch.turns {
        let Some(page) = turn.active_page() else {
            println!("{:>4}  {}", index, "(empty)".dimmed());
            continue;
        };
        let first_line = page.content.lines().next().unwrap_or_default();
        let swipes = if turn.pages.len() > 1 {
            format!(" [{}/{}]", turn.active_page_index + 1, turn.pages.len())
        } else {
            String::new()
        };
        println!(
            "{:>4}  {:<9} {}{}  {}",
            index,
            format!("{:?}", page.role).to_lowercase(),
            page.id.dimmed(),
            swipes.yellow(),
            first_line
        );
    }
    Ok(())
}

fn print_events(events: &[GameEvent]) {
    if events.is_empty() {
        println!("{}", "no events".dimmed());
        return;
    }
    for event in events {
        println!(
            "{}  {}  {}",
            event.event_id.dimmed(),
            event.event_type.cyan(),
            event.payload
        );
    }
}

fn print_outcome(outcome: &RecalcOutcome) {
    match outcome {
        RecalcOutcome::Completed(report) => {
            println!(
                "{} turn {} on {} ({} events, {} applied, {} unhandled, {} failed)",
                "recalculated".green(),
                report.turn_index,
                report.branch_id,
                report.events_replayed,
                report.dispatch.applied,
                report.dispatch.unhandled,
                report.dispatch.failed
            );
            if let Some(id) = &report.snapshot_written {
                println!("  snapshot written at {}", id);
            }
            if report.snapshots_backfilled > 0 {
                println!(
                    "  {}",
                    format!("{} approximate snapshots backfilled", report.snapshots_backfilled)
                        .yellow()
                );
            }
        }
        RecalcOutcome::Failed(reason) => println!("{} {}", "recalculation failed:".red(), reason),
        RecalcOutcome::Skipped => println!("{}", "recalculation already running".yellow()),
    }
}
