use nix::unistd::{getuid, User};

/// Returns the name of the current user.
///
/// Prefers `$USER`, then the passwd entry for the real uid, and finally the
/// numeric uid itself.
pub fn get_username() -> String {
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            return user;
        }
    }

    let uid = getuid();
    match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// Returns true when running as root.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}
