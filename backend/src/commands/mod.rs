//! Maintenance commands.
//!
//! Each command renders a plain-text report; `main` prints it to stdout.

mod delete_user;
mod find_user;
mod migrate_keys;
mod rename_user;
mod repair_indexes;

pub use delete_user::delete_user;
pub use find_user::find_user;
pub use migrate_keys::migrate_keys;
pub use rename_user::rename_user;
pub use repair_indexes::repair_indexes;

use anyhow::Result;
use idtable_identity::{IdentityContext, IdentityResult};
use tokio_util::sync::CancellationToken;

use crate::args::Command;

/// Run one command against an initialized identity context.
pub async fn execute(ctx: &IdentityContext, command: &Command, cancel: &CancellationToken) -> Result<String> {
    match command {
        Command::FindUser(args) => find_user(ctx, args, cancel).await,
        Command::RenameUser { from, to, resume } => rename_user(ctx, from, to, *resume, cancel).await,
        Command::DeleteUser { user_name } => delete_user(ctx, user_name, cancel).await,
        Command::MigrateKeys { user_names } => migrate_keys(ctx, user_names, cancel).await,
        Command::RepairIndexes {
            user_names,
            index_partition,
            dry_run,
        } => repair_indexes(ctx, user_names, index_partition.as_deref(), *dry_run, cancel).await,
    }
}

/// Turn a failed `IdentityResult` into an error carrying every failure.
pub(crate) fn ensure_succeeded(result: IdentityResult, action: &str) -> Result<()> {
    if result.succeeded() {
        return Ok(());
    }
    let details: Vec<String> = result.errors().iter().map(|e| e.to_string()).collect();
    Err(anyhow::anyhow!("{} failed: {}", action, details.join("; ")))
}
