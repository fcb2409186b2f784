use clap::{Parser, Subcommand};
use std::path::PathBuf;
use to_cloud::config::BackendKind;
use to_cloud::todo::ItemId;

#[derive(Parser, Debug)]
#[command(name = "tocloud")]
#[command(about = "A todo list kept in sync with a hosted backend, with one image per todo", long_about = None)]
pub struct Cli {
    /// Backend to use instead of the configured one (local or remote)
    #[arg(short, long, global = true)]
    pub backend: Option<BackendKind>,

    /// Log to stderr instead of the log file
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the todo list (default)
    List,
    Add {
        text: String,
        /// Image to attach to the new todo
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Toggle the completed flag
    Toggle { id: ItemId },
    Rename { id: ItemId, text: String },
    Delete { id: ItemId },
    /// Attach an image to a todo that has none
    Attach { id: ItemId, path: PathBuf },
    /// Remove the image of a todo
    Detach { id: ItemId },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Request a password reset email
    ResetPassword {
        #[arg(long)]
        email: String,
    },
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Write hosted backend settings to the config file
    Configure {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        anon_key: Option<String>,
    },
}

impl Commands {
    /// Commands that talk to the item store need a loaded list first
    pub fn needs_list(&self) -> bool {
        !matches!(
            self,
            Commands::ResetPassword { .. } | Commands::Configure { .. }
        )
    }
}
