use anyhow::Result;
use idtable_identity::{IdentityContext, UserStore};
use log::info;
use tokio_util::sync::CancellationToken;

use super::ensure_succeeded;

pub async fn delete_user(ctx: &IdentityContext, user_name: &str, cancel: &CancellationToken) -> Result<String> {
    let users = UserStore::new(ctx.clone());
    let user = match users.find_by_name(user_name, cancel).await? {
        Some(user) => user,
        None => return Ok(format!("User '{}' not found, nothing to delete\n", user_name)),
    };

    let result = users.delete(&user, cancel).await?;
    ensure_succeeded(result, "Delete")?;
    info!("Deleted user {} ({})", user.id.as_str(), user_name);
    Ok(format!("Deleted '{}' ({})\n", user_name, user.id.as_str()))
}
