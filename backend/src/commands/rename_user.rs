use anyhow::Result;
use idtable_identity::{IdentityContext, UserStore};
use log::info;
use tokio_util::sync::CancellationToken;

use super::ensure_succeeded;

/// Rename `from` to `to`. With `resume`, finish a rename whose rows were
/// already written under `to` but not yet removed from `from`.
pub async fn rename_user(
    ctx: &IdentityContext,
    from: &str,
    to: &str,
    resume: bool,
    cancel: &CancellationToken,
) -> Result<String> {
    let users = UserStore::new(ctx.clone());

    if resume {
        let mut user = users
            .find_by_name(to, cancel)
            .await?
            .ok_or_else(|| anyhow::anyhow!("No user is stored under '{}' yet; run without --resume", to))?;
        let result = users.resume_rename(&mut user, from, cancel).await?;
        ensure_succeeded(result, "Resuming rename")?;
        info!("Resumed rename of {} onto {}", user.id.as_str(), user.user_name);
        return Ok(format!("Renamed '{}' to '{}' (resumed)\n", from, user.user_name));
    }

    let mut user = users
        .find_by_name(from, cancel)
        .await?
        .ok_or_else(|| anyhow::anyhow!("User '{}' not found", from))?;
    let result = users.set_user_name(&mut user, to, cancel).await?;
    ensure_succeeded(result, "Rename")?;
    info!("Renamed user {} from {} to {}", user.id.as_str(), from, to);
    Ok(format!("Renamed '{}' to '{}'\n", from, user.user_name))
}
