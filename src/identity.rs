//! The OS principal that owns this process's endpoints.

/// Current user, as used to scope socket directories and pipe names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// Login name, or the numeric uid when no passwd entry exists.
    pub name: String,
    /// Effective uid. `None` on platforms without numeric uids.
    pub uid: Option<u32>,
}

#[cfg(unix)]
pub fn current_user() -> UserIdentity {
    use nix::unistd::{Uid, User};

    let uid = Uid::effective();
    let name = match User::from_uid(uid) {
        // The name becomes a path component; fall back to the uid if it can't be one.
        Ok(Some(user)) if crate::endpoint::validate(&user.name) => user.name,
        Ok(_) => uid.to_string(),
        Err(e) => {
            tracing::debug!(uid = uid.as_raw(), error = %e, "passwd lookup failed, using numeric uid");
            uid.to_string()
        }
    };
    UserIdentity {
        name,
        uid: Some(uid.as_raw()),
    }
}

#[cfg(not(unix))]
pub fn current_user() -> UserIdentity {
    let name = std::env::var("USERNAME")
        .ok()
        .filter(|n| crate::endpoint::validate(n))
        .unwrap_or_else(|| "default".to_string());
    UserIdentity { name, uid: None }
}
