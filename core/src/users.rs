//! User identity and access control
//!
//! Identity is never authenticated by this crate: it is handed to us,
//! already-authenticated, as an opaque string (normally the value of an
//! upstream `X-Forwarded-User` header). All we do here is decide whether a
//! given user may see a given job.
use std::collections::HashSet;

/// An opaque, already-authenticated user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User(String);

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The set of administrator usernames, parsed once at startup from a
/// comma-separated CLI flag
#[derive(Debug, Clone, Default)]
pub struct AdminSet(HashSet<String>);

impl AdminSet {
    /// Parses a comma-separated list of usernames
    ///
    /// An empty string yields an empty set (mirroring the source, which
    /// splits `""` into a single empty element and so would otherwise treat
    /// the empty user as an administrator -- we filter that out
    /// explicitly).
    pub fn parse(list: &str) -> Self {
        Self(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn is_admin(&self, user: &User) -> bool {
        self.0.contains(user.as_str())
    }

    /// A user may access a job iff they own it or are an administrator
    pub fn can_access_job(&self, user: &User, owner: &User) -> bool {
        user == owner || self.is_admin(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_admin_list_admits_nobody() {
        let admins = AdminSet::parse("");
        assert!(!admins.is_admin(&User::new("")));
        assert!(!admins.is_admin(&User::new("alice")));
    }

    #[test]
    fn owner_can_always_access_their_job() {
        let admins = AdminSet::parse("root");
        let alice = User::new("alice");
        assert!(admins.can_access_job(&alice, &alice));
    }

    #[test]
    fn admin_can_access_any_job() {
        let admins = AdminSet::parse("root, ops");
        assert!(admins.can_access_job(&User::new("ops"), &User::new("alice")));
        assert!(!admins.can_access_job(&User::new("bob"), &User::new("alice")));
    }
}
