use std::fmt::Write;

use anyhow::Result;
use idtable_identity::{IdentityContext, KeyMigrator};
use tokio_util::sync::CancellationToken;

pub async fn migrate_keys(ctx: &IdentityContext, user_names: &[String], cancel: &CancellationToken) -> Result<String> {
    let migrator = KeyMigrator::new(ctx.clone())?;
    let report = migrator.migrate_users(user_names, cancel).await?;

    let mut out = String::new();
    for user in &report.users {
        writeln!(out, "{}: {}", user.user_name, user.outcome)?;
    }
    writeln!(
        out,
        "{} migrated, {} failed, {} total",
        report.migrated(),
        report.failed(),
        report.users.len()
    )?;

    if !report.is_success() {
        return Err(anyhow::anyhow!("Key migration incomplete:\n{}", out));
    }
    Ok(out)
}
