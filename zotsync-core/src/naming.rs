//! Library identifiers and partition names
//!
//! Remote library identifiers look like `users/12345` or `groups/999`. Each
//! library is stored in its own scope, named by a [`PartitionNamer`].

use std::fmt;

const USER_PREFIX: &str = "users/";
const GROUP_PREFIX: &str = "groups/";

/// Maps a remote library identifier to a scope name.
///
/// Implementations must be deterministic and must not map two identifiers in
/// use to the same name. Closures `Fn(&str) -> String` implement this trait.
pub trait PartitionNamer: Send + Sync {
    fn partition_name(&self, library_id: &str) -> String;
}

impl<F> PartitionNamer for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn partition_name(&self, library_id: &str) -> String {
        self(library_id)
    }
}

/// `users/<id>` becomes `u<id>`, `groups/<id>` becomes `g<id>`, and any other
/// `/` is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNamer;

impl PartitionNamer for DefaultNamer {
    fn partition_name(&self, library_id: &str) -> String {
        let shortened = if let Some(rest) = library_id.strip_prefix(USER_PREFIX) {
            format!("u{}", rest)
        } else if let Some(rest) = library_id.strip_prefix(GROUP_PREFIX) {
            format!("g{}", rest)
        } else {
            library_id.to_string()
        };
        shortened.replace('/', "")
    }
}

/// Whether a library belongs to a user or a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    User,
    Group,
}

impl LibraryKind {
    /// Group libraries start with `groups/` (or the `group:` shorthand);
    /// everything else is a personal library.
    pub fn from_library_id(library_id: &str) -> Self {
        if library_id.starts_with(GROUP_PREFIX) || library_id.starts_with("group:") {
            LibraryKind::Group
        } else {
            LibraryKind::User
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryKind::User => "user",
            LibraryKind::Group => "group",
        }
    }
}

impl fmt::Display for LibraryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
