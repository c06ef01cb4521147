use std::path::{Path, PathBuf};

use crate::error::{Result, TransportError};

/// The directory channel sockets are created in by default.
///
/// Server and client must agree on the directory for a name to rendezvous;
/// callers needing isolation (tests, multi-user hosts) pass an explicit
/// directory via [`channel_path_in`].
pub fn default_channel_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Map a channel name to its socket path in the default directory.
pub fn channel_path(name: &str) -> Result<PathBuf> {
    channel_path_in(default_channel_dir(), name)
}

/// Map a channel name to its socket path in an explicit directory.
///
/// Names are plain identifiers, not paths: empty names, path separators,
/// and NUL bytes are rejected so a name can never escape the directory.
pub fn channel_path_in(dir: impl AsRef<Path>, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    Ok(dir.as_ref().join(format!("{name}.sock")))
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TransportError::InvalidName {
            name: name.to_string(),
            reason: "name is empty",
        });
    }
    if name.contains(['/', '\\']) {
        return Err(TransportError::InvalidName {
            name: name.to_string(),
            reason: "name contains a path separator",
        });
    }
    if name.contains('\0') {
        return Err(TransportError::InvalidName {
            name: name.to_string(),
            reason: "name contains a NUL byte",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_name_into_directory() {
        let path = channel_path_in("/run/app", "chat").unwrap();
        assert_eq!(path, PathBuf::from("/run/app/chat.sock"));
    }

    #[test]
    fn default_dir_is_used() {
        let path = channel_path("chat").unwrap();
        assert!(path.starts_with(default_channel_dir()));
        assert!(path.to_string_lossy().ends_with("chat.sock"));
    }

    #[test]
    fn rejects_empty_name() {
        let err = channel_path("").unwrap_err();
        assert!(matches!(err, TransportError::InvalidName { .. }));
    }

    #[test]
    fn rejects_path_separators() {
        for name in ["../escape", "a/b", "a\\b"] {
            let err = channel_path(name).unwrap_err();
            assert!(matches!(err, TransportError::InvalidName { .. }));
        }
    }

    #[test]
    fn rejects_nul_bytes() {
        let err = channel_path("bad\0name").unwrap_err();
        assert!(matches!(err, TransportError::InvalidName { .. }));
    }

    #[test]
    fn counter_suffixed_names_are_valid() {
        // Private channel names are "{rendezvous}_{N}".
        let path = channel_path_in("/tmp", "chat_17").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/chat_17.sock"));
    }
}
