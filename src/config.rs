use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shell::probe::OsVersion;

pub const DEFAULT_TERM: &str = "xterm-256color";
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_LOG_FILTER: &str = "rshd=info";

/// Top-level server config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// `[shell]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell run inside a pseudo-terminal. Defaults to `$SHELL` or `/bin/sh`.
    pub program: Option<String>,
    pub args: Vec<String>,
    /// Shell run on plain pipes when no pseudo-terminal is available.
    pub raw_program: Option<String>,
    pub raw_args: Option<Vec<String>>,
    /// `TERM` exported to pseudo-terminal shells.
    pub term: Option<String>,
    /// Bound on waiting for the copy loops once a session is torn down.
    pub drain_timeout_ms: Option<u64>,
    /// Overrides host detection, `major.minor.build`.
    pub os_version: Option<String>,
}

/// `[log]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

impl ShellConfig {
    pub fn pty_command(&self) -> (String, Vec<String>) {
        let program = self.program.clone().unwrap_or_else(default_pty_shell);
        (program, self.args.clone())
    }

    pub fn raw_command(&self) -> (String, Vec<String>) {
        match &self.raw_program {
            Some(program) => (program.clone(), self.raw_args.clone().unwrap_or_default()),
            None => {
                let (program, args) = default_raw_shell();
                let args = self
                    .raw_args
                    .clone()
                    .unwrap_or_else(|| args.iter().map(|a| a.to_string()).collect());
                (program.to_string(), args)
            }
        }
    }

    pub fn term(&self) -> &str {
        self.term.as_deref().unwrap_or(DEFAULT_TERM)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms.unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS))
    }

    pub fn os_version_override(&self) -> Result<Option<OsVersion>, ConfigError> {
        self.os_version
            .as_deref()
            .map(|v| v.parse::<OsVersion>().map_err(|_| ConfigError::InvalidOsVersion(v.to_string())))
            .transpose()
    }
}

impl LogConfig {
    pub fn filter(&self) -> &str {
        self.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

#[cfg(not(windows))]
fn default_pty_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(windows)]
fn default_pty_shell() -> String {
    r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe".to_string()
}

#[cfg(not(windows))]
fn default_raw_shell() -> (&'static str, &'static [&'static str]) {
    ("/bin/sh", &["-i"])
}

#[cfg(windows)]
fn default_raw_shell() -> (&'static str, &'static [&'static str]) {
    (
        "powershell.exe",
        &["-NoProfile", "-WindowStyle", "hidden", "-NoLogo"],
    )
}

impl ServerConfig {
    /// `<config dir>/rshd/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rshd").join("config.toml"))
    }

    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.shell.os_version_override()?;
        Ok(Some(config))
    }

    /// Load from `path`, or the default location when `None`. A missing
    /// file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        Ok(Self::load(&path)?.unwrap_or_default())
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)
    }
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    WriteFailed(PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
    InvalidOsVersion(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
            Self::InvalidOsVersion(v) => {
                write!(f, "Invalid shell.os_version {:?}, expected major.minor.build", v)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.shell, ShellConfig::default());
        assert_eq!(config.log.filter(), DEFAULT_LOG_FILTER);
        assert_eq!(config.shell.term(), DEFAULT_TERM);
        assert_eq!(config.shell.drain_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [shell]
            program = "/bin/bash"
            args = ["-l"]
            raw_program = "/bin/dash"
            raw_args = []
            term = "vt100"
            drain_timeout_ms = 250
            os_version = "10.0.17134"

            [log]
            filter = "rshd=debug"
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.shell.pty_command(),
            ("/bin/bash".to_string(), vec!["-l".to_string()])
        );
        assert_eq!(config.shell.raw_command(), ("/bin/dash".to_string(), vec![]));
        assert_eq!(config.shell.term(), "vt100");
        assert_eq!(config.shell.drain_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.shell.os_version_override().unwrap(),
            Some(OsVersion::new(10, 0, 17134))
        );
        assert_eq!(config.log.filter(), "rshd=debug");
    }

    #[cfg(not(windows))]
    #[test]
    fn raw_command_defaults_to_interactive_sh() {
        let shell = ShellConfig::default();
        assert_eq!(
            shell.raw_command(),
            ("/bin/sh".to_string(), vec!["-i".to_string()])
        );
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(ServerConfig::load(&path).unwrap().is_none());
        let config = ServerConfig::load_or_default(Some(&path)).unwrap();
        assert!(config.shell.program.is_none());
    }

    #[test]
    fn load_rejects_bad_os_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[shell]\nos_version = \"win10\"\n").unwrap();
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOsVersion(ref v) if v == "win10"));
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[shell\n").unwrap();
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = ServerConfig::default();
        config.shell.program = Some("/bin/zsh".into());
        config.shell.drain_timeout_ms = Some(500);
        config.log.filter = Some("rshd=trace".into());
        config.save(&path).unwrap();

        let loaded = ServerConfig::load(&path).unwrap().unwrap();
        assert_eq!(loaded.shell, config.shell);
        assert_eq!(loaded.log, config.log);
    }
}
