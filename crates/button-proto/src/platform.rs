use std::path::PathBuf;

/// Default TCP port for the framed control socket.
pub const DAEMON_TCP_PORT: u16 = 9876;

/// Default port for the HTTP control API.
pub const DAEMON_HTTP_PORT: u16 = 8989;

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

pub fn data_dir() -> PathBuf {
    // ~/.local/share/moppy-buttons on unix (XDG layout even on macOS)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("moppy-buttons")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("moppy-buttons")
    }
}

pub fn default_log_file() -> PathBuf {
    data_dir().join("buttons.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_file_under_data_dir() {
        let log = default_log_file();
        assert!(log.starts_with(data_dir()));
        assert!(log.ends_with("buttons.log"));
    }
}
