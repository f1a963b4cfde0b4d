mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use recollect::config::RecollectConfig;

#[derive(Parser)]
#[command(name = "recollect", version, about = "Conversation memory service for character chat")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone)]
pub struct ScopeArgs {
    #[arg(long)]
    pub channel: String,
    #[arg(long)]
    pub character: String,
    #[arg(long)]
    pub persona: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run the writeback workers until Ctrl-C
    Serve,
    /// Print the effective settings for a user and character
    Resolve {
        #[arg(long)]
        user: String,
        #[arg(long)]
        character: String,
    },
    /// Print the generation context for a conversation
    Context {
        #[arg(long)]
        user: String,
        #[command(flatten)]
        scope: ScopeArgs,
        /// Memory query, usually the incoming message
        #[arg(long, default_value = "")]
        query: String,
    },
    /// Hide a conversation's history from context (memories are kept)
    Clear {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Remove the most recent turns of a conversation
    Undo {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Permanently delete history for a channel and character
    HardDelete {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        character: String,
        /// Limit to one persona (default: every persona)
        #[arg(long)]
        persona: Option<String>,
        /// Also delete memories formed from the removed turns
        #[arg(long, conflicts_with = "keep_memories")]
        purge_memories: bool,
        /// Keep derived memories even if config says to purge
        #[arg(long)]
        keep_memories: bool,
    },
    /// Inspect or repair the writeback queue
    Pending {
        #[command(subcommand)]
        action: PendingAction,
    },
    /// Manage settings override layers
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Create or update a persona
    Persona {
        id: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
        /// Let this persona see memories formed under the user's other personas
        #[arg(long)]
        share_memories: bool,
    },
    /// Manage individual memories
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Export memories as JSON to stdout
    Export {
        /// Only this character's memories
        #[arg(long)]
        character: Option<String>,
    },
    /// Import memories from a JSON file
    Import {
        /// Path to the JSON file
        file: PathBuf,
    },
    /// Regenerate all embeddings with the configured model
    ReEmbed,
    /// Run database diagnostics
    Doctor,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum PendingAction {
    /// List queued writes
    List {
        /// pending, claimed, or exhausted (default: all)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Give an exhausted write a fresh attempt budget
    Requeue { id: String },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show a stored layer
    Show {
        #[command(flatten)]
        key: cli::admin::LayerKey,
    },
    /// Set one field; the value is JSON (`null` is an explicit null)
    Set {
        #[command(flatten)]
        key: cli::admin::LayerKey,
        field: String,
        value: String,
    },
    /// Remove one field so it inherits again
    Unset {
        #[command(flatten)]
        key: cli::admin::LayerKey,
        field: String,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Show a memory and the rest of its chunk group
    Show { id: String },
    /// Exclude from retrieval
    Hide { id: String },
    /// Include in retrieval again
    Unhide { id: String },
    /// Protect from forget and purge
    Lock { id: String },
    Unlock { id: String },
    /// Permanently delete (refused for locked memories)
    Forget { id: String },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.recollect/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RecollectConfig::load()?;

    // Log to stderr so stdout stays clean for command output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => {
            recollect::server::serve(config).await?;
        }
        Command::Resolve { user, character } => {
            cli::admin::resolve(&config, &user, &character)?;
        }
        Command::Context { user, scope, query } => {
            cli::admin::context(config, user, scope.into(), query).await?;
        }
        Command::Clear { scope } => {
            cli::admin::clear(&config, &scope.into())?;
        }
        Command::Undo { scope, count } => {
            cli::admin::undo(&config, &scope.into(), count)?;
        }
        Command::HardDelete {
            channel,
            character,
            persona,
            purge_memories,
            keep_memories,
        } => {
            let purge = if purge_memories {
                Some(true)
            } else if keep_memories {
                Some(false)
            } else {
                None
            };
            let target = recollect::deletion::HardDeleteTarget {
                character_id: character,
                channel_id: channel,
                persona_id: persona,
            };
            cli::admin::hard_delete(&config, &target, purge)?;
        }
        Command::Pending { action } => match action {
            PendingAction::List { status, limit } => {
                cli::admin::pending_list(&config, status.as_deref(), limit)?;
            }
            PendingAction::Requeue { id } => {
                cli::admin::pending_requeue(&config, &id)?;
            }
        },
        Command::Settings { action } => match action {
            SettingsAction::Show { key } => cli::admin::settings_show(&config, &key)?,
            SettingsAction::Set { key, field, value } => {
                cli::admin::settings_set(&config, &key, &field, &value)?;
            }
            SettingsAction::Unset { key, field } => {
                cli::admin::settings_unset(&config, &key, &field)?;
            }
        },
        Command::Persona {
            id,
            user,
            name,
            share_memories,
        } => {
            cli::admin::persona_set(&config, &id, &user, &name, share_memories)?;
        }
        Command::Memory { action } => {
            use cli::memory::Toggle;
            match action {
                MemoryAction::Show { id } => cli::memory::show(&config, &id)?,
                MemoryAction::Hide { id } => cli::memory::toggle(&config, &id, Toggle::Hide)?,
                MemoryAction::Unhide { id } => cli::memory::toggle(&config, &id, Toggle::Unhide)?,
                MemoryAction::Lock { id } => cli::memory::toggle(&config, &id, Toggle::Lock)?,
                MemoryAction::Unlock { id } => cli::memory::toggle(&config, &id, Toggle::Unlock)?,
                MemoryAction::Forget { id } => cli::memory::forget(&config, &id)?,
            }
        }
        Command::Export { character } => {
            cli::export::export(&config, character.as_deref())?;
        }
        Command::Import { file } => {
            cli::import::import(&config, &file).await?;
        }
        Command::ReEmbed => {
            cli::re_embed::re_embed(&config).await?;
        }
        Command::Doctor => {
            cli::doctor::doctor(&config)?;
        }
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.embedding).await?;
            }
        },
    }

    Ok(())
}

impl From<ScopeArgs> for recollect::history::ConversationScope {
    fn from(args: ScopeArgs) -> Self {
        Self::new(args.channel, args.character, args.persona)
    }
}
