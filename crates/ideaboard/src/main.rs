//! Ideaboard: shared idea board on an ATProto PDS
//!
//! Main binary with subcommands:
//! - `list`: Show every idea on the board
//! - `add`, `vote`, `edit`, `remove`: Change ideas
//! - `whoami`, `delete-account`: Account management

use clap::{Args, Parser, Subcommand};
use ideaboard_store::{IDEA_COLLECTION, SyncPolicy};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "ideaboard")]
#[command(about = "Share and vote on ideas stored in your PDS", long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: Connection,

    #[command(subcommand)]
    command: Commands,
}

/// Where the board lives and how to sign in.
#[derive(Args)]
pub struct Connection {
    /// PDS URL
    #[arg(long, env = "IDEABOARD_PDS_URL", default_value = "https://bsky.social")]
    pub pds_url: String,

    /// Account handle
    #[arg(long, env = "IDEABOARD_HANDLE")]
    pub handle: String,

    /// App password
    #[arg(long, env = "IDEABOARD_APP_PASSWORD", hide_env_values = true)]
    pub app_password: String,

    /// Collection NSID holding idea records
    #[arg(long, env = "IDEABOARD_COLLECTION", default_value = IDEA_COLLECTION)]
    pub collection: String,

    /// How the local copy is refreshed after a write
    #[arg(long, env = "IDEABOARD_SYNC_POLICY", default_value = "full-refetch")]
    pub sync_policy: SyncPolicy,
}

#[derive(Subcommand)]
enum Commands {
    /// List all ideas
    List {
        /// Print the ideas as JSON
        #[arg(long)]
        json: bool,
    },

    /// Share a new idea
    Add {
        /// Idea title
        #[arg(long)]
        title: String,

        /// Longer description
        #[arg(long, default_value = "")]
        description: String,

        /// Tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Upvote an idea
    Vote {
        /// Idea id
        id: String,
    },

    /// Change an idea's title, description or tags
    Edit {
        /// Idea id
        id: String,

        /// New title
        #[arg(long)]
        title: Option<String>,

        /// New description
        #[arg(long)]
        description: Option<String>,

        /// Replacement tag set, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Delete an idea
    Remove {
        /// Idea id
        id: String,
    },

    /// Show the signed-in account
    Whoami,

    /// Permanently delete the signed-in account
    DeleteAccount {
        /// Confirmation token sent by the PDS
        #[arg(long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ideaboard=info,ideaboard_store=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let board = commands::Board::connect(&cli.connection).await?;

    let result = match cli.command {
        Commands::List { json } => board.list(json).await,
        Commands::Add {
            title,
            description,
            tags,
        } => board.add(title, description, tags).await,
        Commands::Vote { id } => board.vote(&id).await,
        Commands::Edit {
            id,
            title,
            description,
            tags,
        } => board.edit(&id, title, description, tags).await,
        Commands::Remove { id } => board.remove(&id).await,
        Commands::Whoami => board.whoami(),
        Commands::DeleteAccount { token } => {
            board
                .delete_account(&cli.connection.app_password, &token)
                .await
        }
    };

    board.close().await;
    result
}
