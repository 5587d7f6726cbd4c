//! User account lookup and per-user .dmrc state
//!
//! The daemon resolves usernames through the system account database and
//! remembers each user's last session and language choice in `~/.dmrc`,
//! a two-key ini fragment shared with other display managers:
//!
//! ```text
//! [Desktop]
//! Session=plasma
//! Language=en_GB.UTF-8
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::unistd::{chown, Gid, Uid, User};

/// A resolved system account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl UserRecord {
    /// Look up by name. `Ok(None)` means the account does not exist;
    /// `Err` means the lookup itself failed.
    pub fn lookup(username: &str) -> Result<Option<Self>> {
        let user = User::from_name(username)
            .with_context(|| format!("looking up account {username:?}"))?;
        Ok(user.map(|u| UserRecord {
            name: u.name,
            uid: u.uid,
            gid: u.gid,
            home: u.dir,
            shell: u.shell,
        }))
    }

    pub fn dmrc_path(&self) -> PathBuf {
        self.home.join(".dmrc")
    }

    /// Read the stored session/language choices. Missing or unreadable
    /// files are treated as empty.
    pub fn read_dmrc(&self) -> Dmrc {
        match fs::read_to_string(self.dmrc_path()) {
            Ok(content) => Dmrc::parse(&content),
            Err(_) => Dmrc::default(),
        }
    }

    /// Persist session/language choices, chowning the file to the user so
    /// their own tools can update it later.
    pub fn write_dmrc(&self, dmrc: &Dmrc) -> Result<()> {
        let path = self.dmrc_path();
        fs::write(&path, dmrc.to_string())
            .with_context(|| format!("writing {}", path.display()))?;
        chown(&path, Some(self.uid), Some(self.gid))
            .with_context(|| format!("chowning {}", path.display()))?;
        Ok(())
    }
}

/// The `[Desktop]` section of ~/.dmrc.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dmrc {
    pub session: Option<String>,
    pub language: Option<String>,
}

impl Dmrc {
    pub fn parse(content: &str) -> Self {
        let mut dmrc = Dmrc::default();
        let mut in_desktop = false;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                in_desktop = line == "[Desktop]";
                continue;
            }
            if !in_desktop {
                continue;
            }
            if let Some(eq) = line.find('=') {
                let key = line[..eq].trim();
                let value = line[eq + 1..].trim();
                match key {
                    "Session" if !value.is_empty() => dmrc.session = Some(value.to_string()),
                    "Language" if !value.is_empty() => dmrc.language = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        dmrc
    }
}

impl std::fmt::Display for Dmrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "[Desktop]")?;
        if let Some(session) = &self.session {
            writeln!(f, "Session={session}")?;
        }
        if let Some(language) = &self.language {
            writeln!(f, "Language={language}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dmrc_parse() {
        let dmrc = Dmrc::parse("[Desktop]\nSession=plasma\nLanguage=de_DE.UTF-8\n");
        assert_eq!(dmrc.session.as_deref(), Some("plasma"));
        assert_eq!(dmrc.language.as_deref(), Some("de_DE.UTF-8"));
    }

    #[test]
    fn test_dmrc_other_sections_ignored() {
        let dmrc = Dmrc::parse("[Other]\nSession=nope\n[Desktop]\nSession=sway\n");
        assert_eq!(dmrc.session.as_deref(), Some("sway"));
    }

    #[test]
    fn test_dmrc_empty_values_ignored() {
        let dmrc = Dmrc::parse("[Desktop]\nSession=\nLanguage=\n");
        assert_eq!(dmrc, Dmrc::default());
    }

    #[test]
    fn test_dmrc_roundtrip() {
        let dmrc = Dmrc {
            session: Some("sway".to_string()),
            language: Some("fr_FR.UTF-8".to_string()),
        };
        assert_eq!(Dmrc::parse(&dmrc.to_string()), dmrc);
    }

    #[test]
    fn test_lookup_root_exists() {
        let root = UserRecord::lookup("root").unwrap().unwrap();
        assert_eq!(root.uid, Uid::from_raw(0));
        assert_eq!(root.home, PathBuf::from("/root"));
    }

    #[test]
    fn test_lookup_missing_user() {
        assert!(UserRecord::lookup("no-such-user-xyzzy").unwrap().is_none());
    }
}
