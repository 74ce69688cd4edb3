use std::fmt::Write;

use anyhow::Result;
use idtable_identity::{IdentityContext, IndexVerifier};
use log::warn;
use tokio_util::sync::CancellationToken;

/// Verify (and unless `dry_run`, repair) the index rows of `user_names`,
/// then optionally sweep one index partition for stale entries.
pub async fn repair_indexes(
    ctx: &IdentityContext,
    user_names: &[String],
    index_partition: Option<&str>,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<String> {
    if user_names.is_empty() && index_partition.is_none() {
        return Err(anyhow::anyhow!("Give at least one user name or --index-partition"));
    }

    let verifier = IndexVerifier::new(ctx.clone());
    let repair = !dry_run;
    let mut out = String::new();

    for user_name in user_names {
        match verifier.verify_user_by_name(user_name, repair, cancel).await? {
            None => writeln!(out, "{}: not found", user_name)?,
            Some(check) if check.missing.is_empty() => {
                writeln!(out, "{}: {} index rows ok", user_name, check.expected)?
            }
            Some(check) => {
                warn!(
                    "User {} under {} is missing {} of {} index rows",
                    user_name,
                    check.primary_key,
                    check.missing.len(),
                    check.expected
                );
                writeln!(
                    out,
                    "{}: {} of {} index rows missing, {} repaired",
                    user_name,
                    check.missing.len(),
                    check.expected,
                    check.repaired
                )?;
                for entry in &check.missing {
                    writeln!(out, "  missing {} / {}", entry.partition_key, entry.row_key)?;
                }
            }
        }
    }

    if let Some(partition) = index_partition {
        let stale = verifier.stale_entries_in(partition, repair, cancel).await?;
        let action = if repair { "removed" } else { "found" };
        writeln!(out, "{}: {} stale entries {}", partition, stale.len(), action)?;
        for entry in &stale {
            writeln!(out, "  stale {} -> {}", entry.row_key, entry.primary_key)?;
        }
    }

    Ok(out)
}
