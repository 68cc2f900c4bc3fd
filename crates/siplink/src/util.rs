//! Small shared utilities.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for unique token generation.
static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique token with the given prefix.
///
/// Combines the process id with a monotonic counter, so tokens are unique
/// within a process and collide across restarts only with negligible
/// probability. Used for dialog tags, Call-IDs, Via branches, and tuple
/// ids.
pub fn unique_string(prefix: &str) -> String {
    let id = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    format!("{}-{:x}-{:x}", prefix, pid, id)
}

/// Generate a Via branch token with the RFC 3261 magic cookie.
pub fn unique_branch() -> String {
    unique_string("z9hG4bK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_string_distinct() {
        let a = unique_string("tag");
        let b = unique_string("tag");
        assert_ne!(a, b);
        assert!(a.starts_with("tag-"));
    }

    #[test]
    fn test_branch_magic_cookie() {
        assert!(unique_branch().starts_with("z9hG4bK"));
    }
}
