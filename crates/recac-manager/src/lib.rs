//! Persisted directory of background sessions.
//!
//! Each background run is a detached child process with its stdio redirected
//! to a per-session log file and a JSON state file under
//! `~/.recac/sessions/`. Archived entries move to a parallel `archived/`
//! directory. Control is signal-based: SIGTERM to stop, SIGSTOP/SIGCONT to
//! pause and resume.

mod manager;
mod state;

pub use manager::SessionManager;
pub use state::{BackgroundStatus, SessionState};

/// Directory under the user home holding session files.
pub const SESSIONS_DIR: &str = ".recac/sessions";
/// Subdirectory holding archived sessions.
pub const ARCHIVE_DIR: &str = "archived";

/// Validate a session name: `^[A-Za-z0-9_.-]+$`, no path separators.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["build-1", "nightly_run", "v1.2.3", "A"] {
            assert!(validate_name(name), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["../evil", "/tmp/evil", "a/b", "", "a b", "x\\y", "név"] {
            assert!(!validate_name(name), "{name} should be rejected");
        }
    }
}
