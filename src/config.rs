//! Daemon configuration parsing from duskdm.conf
//!
//! Plain `key=value` lines, `#` comments, optional quoting:
//! - greeter-socket=/run/duskdm/greeter.sock
//! - greeter-service / session-service / autologin-service (PAM stacks)
//! - autologin-user=<name> (logins for this account skip the prompts)
//! - allow-guest=true|false, guest-session=<name>
//! - default-session=<name>
//! - sessions-dir / remote-sessions-dir (where .desktop files live)
//! - shared-data-dir (per-user shared directories)
//! - log-dir, backup-logs=true|false

use std::fs;
use std::path::PathBuf;

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Unix socket the greeter connects to
    pub greeter_socket: PathBuf,
    /// PAM service for greeter-driven logins
    pub session_service: String,
    /// PAM service the greeter itself runs under
    pub greeter_service: String,
    /// PAM service for autologin (no credential prompts)
    pub autologin_service: String,
    /// Account whose logins go through the autologin stack
    pub autologin_user: Option<String>,
    /// Whether guest logins are offered at all
    pub allow_guest: bool,
    /// Session started for guest logins
    pub guest_session: String,
    /// Session used when the greeter names none
    pub default_session: String,
    /// Directory of local session .desktop files
    pub sessions_dir: PathBuf,
    /// Directory of remote (XDMCP-style) session .desktop files
    pub remote_sessions_dir: PathBuf,
    /// Root under which per-user shared directories are created
    pub shared_data_dir: PathBuf,
    /// Where session log files go when the user's home is unusable
    pub log_dir: PathBuf,
    /// Rotate existing session logs to .old instead of truncating
    pub backup_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            greeter_socket: PathBuf::from("/run/duskdm/greeter.sock"),
            session_service: "duskdm".to_string(),
            greeter_service: "duskdm-greeter".to_string(),
            autologin_service: "duskdm-autologin".to_string(),
            autologin_user: None,
            allow_guest: false,
            guest_session: "guest".to_string(),
            default_session: "default".to_string(),
            sessions_dir: PathBuf::from("/usr/share/xsessions"),
            remote_sessions_dir: PathBuf::from("/usr/share/duskdm/remote-sessions"),
            shared_data_dir: PathBuf::from("/var/lib/duskdm/data"),
            log_dir: PathBuf::from("/var/log/duskdm"),
            backup_logs: true,
        }
    }
}

impl Config {
    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/duskdm/duskdm.conf")
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub fn load() -> Self {
        Self::from_file(&Self::default_path()).unwrap_or_default()
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &PathBuf) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = Config::default();

        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = parse_assignment(line) {
                let value = unquote(&value);

                match key.as_str() {
                    "greeter-socket" => config.greeter_socket = PathBuf::from(value),
                    "session-service" => config.session_service = value,
                    "greeter-service" => config.greeter_service = value,
                    "autologin-service" => config.autologin_service = value,
                    "autologin-user" => config.autologin_user = Some(value),
                    "allow-guest" => config.allow_guest = parse_bool(&value),
                    "guest-session" => config.guest_session = value,
                    "default-session" => config.default_session = value,
                    "sessions-dir" => config.sessions_dir = PathBuf::from(value),
                    "remote-sessions-dir" => config.remote_sessions_dir = PathBuf::from(value),
                    "shared-data-dir" => config.shared_data_dir = PathBuf::from(value),
                    "log-dir" => config.log_dir = PathBuf::from(value),
                    "backup-logs" => config.backup_logs = parse_bool(&value),
                    _ => {}
                }
            }
        }

        config
    }
}

/// Parse an assignment (key=value or key="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return None;
    }

    Some((key, value))
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "true" | "yes" | "1" | "on")
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    if s.starts_with('"') && s.ends_with('"') && s.len() >= 2 {
        return s[1..s.len() - 1].to_string();
    }

    if s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2 {
        return s[1..s.len() - 1].to_string();
    }

    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config = Config::parse("");
        assert_eq!(config, Config::default());
        assert!(!config.allow_guest);
    }

    #[test]
    fn test_parse_overrides() {
        let content = r#"
# Site configuration
greeter-socket="/tmp/test-greeter.sock"
session-service=site-login
autologin-user=kiosk
allow-guest=true
guest-session=kiosk
backup-logs=no
"#;
        let config = Config::parse(content);

        assert_eq!(config.greeter_socket, PathBuf::from("/tmp/test-greeter.sock"));
        assert_eq!(config.session_service, "site-login");
        assert_eq!(config.autologin_user.as_deref(), Some("kiosk"));
        assert!(config.allow_guest);
        assert_eq!(config.guest_session, "kiosk");
        assert!(!config.backup_logs);
        // Untouched keys keep their defaults
        assert_eq!(config.default_session, "default");
    }

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let config = Config::parse("no-such-key=x\nnot a line at all\n");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_bool_forms() {
        assert!(parse_bool("true"));
        assert!(parse_bool("Yes"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("nonsense"));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
    }
}
