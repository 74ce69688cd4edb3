use std::fmt::Write;

use anyhow::Result;
use idtable_commons::User;
use idtable_identity::{IdentityContext, UserLoginStore, UserRoleStore, UserStore};
use tokio_util::sync::CancellationToken;

use crate::args::FindUserArgs;

pub async fn find_user(ctx: &IdentityContext, args: &FindUserArgs, cancel: &CancellationToken) -> Result<String> {
    let users = UserStore::new(ctx.clone());

    let found = if let Some(name) = &args.name {
        users.find_by_name(name, cancel).await?
    } else if let Some(id) = &args.id {
        users.find_by_id(id, cancel).await?
    } else if let Some(email) = &args.email {
        users.find_by_email(email, cancel).await?
    } else if let Some(login) = &args.login {
        let (provider, key) = login
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Login must be given as provider:key (got '{}')", login))?;
        users.find_by_login(provider, key, cancel).await?
    } else {
        return Err(anyhow::anyhow!("One of --name, --id, --email or --login is required"));
    };

    let user = match found {
        Some(user) => user,
        None => return Ok("User not found\n".to_string()),
    };

    let roles = users.get_roles(&user, cancel).await?;
    let logins = users.get_logins(&user, cancel).await?;
    let location = locate(ctx, &users, &user, cancel).await?;

    let mut out = String::new();
    render_user(&mut out, &user)?;
    if let Some((primary_key, version)) = location {
        writeln!(out, "Primary key:  {} (key version {})", primary_key, version)?;
    }
    writeln!(out, "Roles:        {}", list_or_none(&roles))?;
    let logins: Vec<String> = logins
        .iter()
        .map(|l| format!("{}:{}", l.login_provider, l.provider_key))
        .collect();
    writeln!(out, "Logins:       {}", list_or_none(&logins))?;
    Ok(out)
}

/// Partition key and key format the user's entity row is stored under.
async fn locate(
    ctx: &IdentityContext,
    users: &UserStore,
    user: &User,
    cancel: &CancellationToken,
) -> Result<Option<(String, String)>> {
    for keys in ctx.lookup_keys() {
        let primary_key = keys.user_key(&user.normalized_user_name)?;
        if let Some((stored, version)) = users.aggregates().read_user(&primary_key, cancel).await? {
            if stored.id == user.id {
                return Ok(Some((primary_key, version.to_string())));
            }
        }
    }
    Ok(None)
}

fn render_user(out: &mut String, user: &User) -> std::fmt::Result {
    writeln!(out, "Id:           {}", user.id.as_str())?;
    writeln!(out, "User name:    {}", user.user_name)?;
    writeln!(
        out,
        "Email:        {}{}",
        user.email.as_deref().unwrap_or("-"),
        if user.email_confirmed { " (confirmed)" } else { "" }
    )?;
    if let Some(lockout_end) = user.lockout_end {
        writeln!(out, "Lockout end:  {}", lockout_end)?;
    }
    writeln!(out, "Failed logins: {}", user.access_failed_count)
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
