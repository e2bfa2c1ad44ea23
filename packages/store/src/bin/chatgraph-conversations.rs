#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI for browsing and auditing chatgraph conversations.
//!
//! ```text
//! chatgraph-conversations list --user <user_client_id>
//! chatgraph-conversations show --user <user_client_id> <id>
//! chatgraph-conversations export --user <user_client_id> <id> <out-file>
//! chatgraph-conversations delete --user <user_client_id> <id> [--yes]
//! ```
//!
//! Running with no subcommand enters interactive mode.

use std::path::{Path, PathBuf};

use chatgraph_store::interactive;
use chatgraph_store::{ConversationStore, SqliteConversationStore, DEFAULT_DB_PATH};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "chatgraph-conversations",
    about = "Browse and audit chatgraph conversation history"
)]
struct Cli {
    /// Path to the conversations database.
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    /// Owning user's client ID.
    #[arg(long = "user")]
    user_client_id: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations for a user
    List,
    /// Show a conversation in readable format
    Show {
        /// Conversation ID
        id: String,
    },
    /// Export a conversation's formatted history to a file
    Export {
        /// Conversation ID
        id: String,
        /// Output file path
        out: PathBuf,
    },
    /// Delete a conversation
    Delete {
        /// Conversation ID
        id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let store = SqliteConversationStore::open(&cli.db).await?;

    let Some(command) = cli.command else {
        let user_client_id = cli.user_client_id.unwrap_or_else(prompt_user_client_id);
        return run_interactive(&store, &user_client_id).await;
    };

    let user_client_id = cli.user_client_id.ok_or("--user is required for this subcommand")?;

    match command {
        Commands::List => interactive::handle_list(&store, &user_client_id).await?,
        Commands::Show { id } => interactive::handle_show(&store, &user_client_id, &id).await?,
        Commands::Export { id, out } => {
            interactive::handle_export(&store, &user_client_id, &id, &out).await?;
        }
        Commands::Delete { id, yes } => {
            interactive::handle_delete(&store, &user_client_id, &id, yes).await?;
        }
    }

    Ok(())
}

fn prompt_user_client_id() -> String {
    dialoguer::Input::new()
        .with_prompt("User client ID")
        .interact_text()
        .unwrap_or_default()
}

async fn run_interactive(
    store: &dyn ConversationStore,
    user_client_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match interactive::prompt_action()? {
            interactive::ConversationAction::List => {
                interactive::handle_list(store, user_client_id).await?;
            }
            interactive::ConversationAction::Show => {
                let Some(meta) = interactive::pick_conversation(store, user_client_id).await?
                else {
                    continue;
                };
                interactive::handle_show(store, user_client_id, &meta.conversation_id).await?;
            }
            interactive::ConversationAction::Export => {
                let Some(meta) = interactive::pick_conversation(store, user_client_id).await?
                else {
                    continue;
                };
                let out_path = Path::new(&meta.conversation_id).with_extension("txt");
                interactive::handle_export(store, user_client_id, &meta.conversation_id, &out_path)
                    .await?;
            }
            interactive::ConversationAction::Delete => {
                let Some(meta) = interactive::pick_conversation(store, user_client_id).await?
                else {
                    continue;
                };
                interactive::handle_delete(store, user_client_id, &meta.conversation_id, false)
                    .await?;
            }
            interactive::ConversationAction::Quit => return Ok(()),
        }
    }
}
