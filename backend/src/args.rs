use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// idtable-admin - maintenance commands for an idtable identity store
#[derive(Parser, Debug)]
#[command(name = "idtable-admin")]
#[command(author = "idtable contributors")]
#[command(version)]
#[command(about = "Inspect and repair identity aggregates stored in idtable", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults are used when it does not exist)
    #[arg(short = 'c', long = "config", default_value = "idtable.toml")]
    pub config: PathBuf,

    /// Override `storage.data_path`
    #[arg(long = "data-path")]
    pub data_path: Option<String>,

    /// Log at debug level regardless of configuration
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Look a user up by name, id, email or external login
    FindUser(FindUserArgs),

    /// Move a user onto a new user name
    RenameUser {
        /// Current user name
        from: String,
        /// New user name
        to: String,
        /// Finish a rename that stopped after the new rows were written
        #[arg(long = "resume")]
        resume: bool,
    },

    /// Delete a user and all of its dependent and index rows
    DeleteUser {
        user_name: String,
    },

    /// Move users stored under legacy SHA-1 keys onto the current key format
    MigrateKeys {
        /// User names to migrate
        #[arg(required = true)]
        user_names: Vec<String>,
    },

    /// Verify index rows and write the missing ones
    RepairIndexes {
        /// User names whose aggregates are checked
        user_names: Vec<String>,
        /// Also scan this index partition for entries no aggregate accounts for
        #[arg(long = "index-partition")]
        index_partition: Option<String>,
        /// Report only, change nothing
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
#[group(required = true, multiple = false)]
pub struct FindUserArgs {
    #[arg(long = "name")]
    pub name: Option<String>,

    #[arg(long = "id")]
    pub id: Option<String>,

    #[arg(long = "email")]
    pub email: Option<String>,

    /// External login as `provider:key`
    #[arg(long = "login")]
    pub login: Option<String>,
}
