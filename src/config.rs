use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Repository-local configuration file name
pub const LOCAL_CONFIG_FILE: &str = ".releasegate.yml";

/// Main configuration structure for releasegate
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Local scratch repository
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Remote name used for pushes and fetches
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Branch to publish (current branch when unset)
    #[serde(default)]
    pub branch: Option<String>,

    /// Exclusion rules on top of the built-in denylist
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Foreground git behaviour
    #[serde(default)]
    pub git: GitConfig,

    /// Hosted release settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Event ledger
    #[serde(default)]
    pub history: HistoryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Additional exclusion rules
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct PolicyConfig {
    /// Extra suffixes, matched against the file name and its stem
    #[serde(default)]
    pub exclude_suffixes: Vec<String>,

    /// Extra leading directories
    #[serde(default)]
    pub exclude_dirs: Vec<String>,

    /// Glob patterns (`*` wildcard) matched against the whole path
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// Watcher tick interval
    #[serde(default = "default_interval")]
    pub interval: String, // "5m"

    /// Upper bound for a single tick
    #[serde(default = "default_tick_timeout")]
    pub tick_timeout: String, // "2m"

    /// Push the branch after an auto-commit
    #[serde(default)]
    pub auto_push: bool,

    /// PID marker location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Seconds to wait after SIGTERM before SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
}

/// Git configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitConfig {
    /// Timeout for a single foreground git invocation in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Working-tree lock location (inside .git when unset)
    #[serde(default)]
    pub lock_file: Option<String>,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token"

    /// Repository owner (parsed from the remote URL if null)
    pub owner: Option<String>,

    /// Repository name (parsed from the remote URL if null)
    pub repo: Option<String>,

    /// Create a hosted release after the tag is pushed
    #[serde(default = "default_true")]
    pub create_releases: bool,
}

/// Event ledger configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_history_db")]
    pub db_path: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact" or "json"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_repository() -> String {
    ".".to_string()
}
fn default_remote() -> String {
    "origin".to_string()
}
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    300
}
fn default_interval() -> String {
    "5m".to_string()
}
fn default_tick_timeout() -> String {
    "2m".to_string()
}
fn default_stop_timeout() -> u64 {
    10
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/releasegate.pid", runtime_dir)
    } else {
        "/tmp/releasegate.pid".to_string()
    }
}

fn data_home() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/releasegate", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/releasegate", home)
    } else {
        "/tmp/releasegate".to_string()
    }
}

fn default_log_file() -> String {
    format!("{}/daemon.log", data_home())
}
fn default_history_db() -> String {
    format!("{}/history.db", data_home())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            tick_timeout: default_tick_timeout(),
            auto_push: false,
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            lock_file: None,
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            auth_method: default_auth_method(),
            owner: None,
            repo: None,
            create_releases: default_true(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            db_path: default_history_db(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            remote: default_remote(),
            branch: None,
            policy: PolicyConfig::default(),
            daemon: DaemonConfig::default(),
            git: GitConfig::default(),
            github: GitHubConfig::default(),
            history: HistoryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Resolve configuration: repository-local file first, then the XDG
    /// location, creating a default config there if none exists.
    pub fn load_or_default() -> Result<Self> {
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::load(&local);
        }

        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("releasegate").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.repository = shellexpand::full(&self.repository)
            .context("Failed to expand repository path")?
            .into_owned();

        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        self.history.db_path = shellexpand::full(&self.history.db_path)
            .context("Failed to expand history db_path")?
            .into_owned();

        if let Some(lock_file) = &self.git.lock_file {
            self.git.lock_file = Some(
                shellexpand::full(lock_file)
                    .context("Failed to expand lock_file path")?
                    .into_owned(),
            );
        }

        Ok(())
    }

    pub fn repository_path(&self) -> PathBuf {
        PathBuf::from(&self.repository)
    }

    pub fn pid_file_path(&self) -> PathBuf {
        PathBuf::from(&self.daemon.pid_file)
    }

    pub fn log_file_path(&self) -> PathBuf {
        PathBuf::from(&self.daemon.log_file)
    }

    /// Working-tree lock, `<repository>/.git/releasegate.lock` by default
    pub fn lock_file_path(&self) -> PathBuf {
        match &self.git.lock_file {
            Some(path) => PathBuf::from(path),
            None => self.repository_path().join(".git").join("releasegate.lock"),
        }
    }

    pub fn watch_interval(&self) -> Result<Duration> {
        parse_duration(&self.daemon.interval)
            .context("Failed to parse daemon interval")
            .map(Duration::from_secs)
    }

    pub fn tick_timeout(&self) -> Result<Duration> {
        parse_duration(&self.daemon.tick_timeout)
            .context("Failed to parse daemon tick_timeout")
            .map(Duration::from_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git.timeout)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.stop_timeout)
    }
}

/// Longest accepted interval or timeout
const MAX_DURATION_SECS: u64 = 365 * 86400;

/// Parse duration strings like "30s", "5m", "1h", "2d" or raw seconds
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();

    let (value, unit, what) = if let Some(value) = duration_str.strip_suffix('s') {
        (value, 1, "seconds")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value, 60, "minutes")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value, 3600, "hours")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        (value, 86400, "days")
    } else {
        let seconds = duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30s', '5m', '1h'")?;
        return check_range(seconds);
    };

    let seconds = value
        .trim()
        .parse::<u64>()
        .with_context(|| format!("Invalid {} value", what))?
        .checked_mul(unit)
        .ok_or_else(|| anyhow!("Duration '{}' is too large", duration_str))?;

    check_range(seconds)
}

fn check_range(seconds: u64) -> Result<u64> {
    if seconds == 0 {
        return Err(anyhow!("Duration must be greater than zero"));
    }
    if seconds > MAX_DURATION_SECS {
        return Err(anyhow!("Duration must not exceed 365 days"));
    }
    Ok(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    // Helper function to create a temporary config directory
    fn setup_test_config_dir() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("releasegate");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");
        (temp_dir, config_dir)
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.repository, ".");
        assert_eq!(config.remote, "origin");
        assert!(config.branch.is_none());
        assert_eq!(config.daemon.interval, "5m");
        assert!(!config.daemon.auto_push);
        assert_eq!(config.git.timeout, 300);
        assert!(config.github.create_releases);
        assert!(config.history.enabled);
        assert!(config.policy.exclude_patterns.is_empty());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("5m").unwrap(), 300);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("2d").unwrap(), 172800);
        assert_eq!(parse_duration(" 45 ").unwrap(), 45);
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_huge_values() {
        let err = parse_duration("999999999999999999d").unwrap_err();
        assert!(err.to_string().contains("too large"));
        assert!(parse_duration("18446744073709551615h").is_err());
        assert!(parse_duration("400d").is_err());
        assert!(parse_duration("99999999999").is_err());
        assert_eq!(parse_duration("365d").unwrap(), 365 * 86400);
    }

    #[test]
    fn test_lock_file_default_inside_git_dir() {
        let mut config = Config::default();
        config.repository = "/work/scratch".to_string();
        assert_eq!(
            config.lock_file_path(),
            PathBuf::from("/work/scratch/.git/releasegate.lock")
        );

        config.git.lock_file = Some("/run/gate.lock".to_string());
        assert_eq!(config.lock_file_path(), PathBuf::from("/run/gate.lock"));
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_RELEASEGATE_HOME", "/test/home");

        let mut config = Config::default();
        config.repository = "${TEST_RELEASEGATE_HOME}/scratch".to_string();
        config.daemon.pid_file = "$TEST_RELEASEGATE_HOME/gate.pid".to_string();

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.repository, "/test/home/scratch");
        assert_eq!(config.daemon.pid_file, "/test/home/gate.pid");

        env::remove_var("TEST_RELEASEGATE_HOME");
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let nonexistent_path = Path::new("/nonexistent/path/config.yml");
        assert!(Config::load(nonexistent_path).is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let (_temp_dir, config_dir) = setup_test_config_dir();
        let config_path = config_dir.join("config.yml");

        let mut config = Config::default();
        config.repository = "/custom/path".to_string();
        config.branch = Some("main".to_string());
        config.policy.exclude_dirs = vec!["sandbox".to_string()];
        config.daemon.auto_push = true;

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.repository, "/custom/path");
        assert_eq!(loaded.branch, Some("main".to_string()));
        assert_eq!(loaded.policy.exclude_dirs, vec!["sandbox".to_string()]);
        assert!(loaded.daemon.auto_push);
    }

    #[test]
    fn test_config_default_path_xdg() {
        let default_path = Config::default_config_path().expect("Failed to get default path");
        assert!(default_path.to_string_lossy().contains("releasegate"));
        assert!(default_path.to_string_lossy().ends_with("config.yml"));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
repository: "/srv/scratch"
remote: "upstream"
branch: "main"
policy:
  exclude_suffixes: [".log"]
  exclude_patterns: ["*.parquet"]
daemon:
  interval: "30s"
  tick_timeout: "20s"
  auto_push: true
  stop_timeout: 3
git:
  timeout: 60
github:
  auth_method: "token"
  owner: "acme"
  repo: "signals"
  create_releases: false
history:
  enabled: false
logging:
  level: "debug"
  format: "json"
  color: false
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.repository, "/srv/scratch");
        assert_eq!(config.remote, "upstream");
        assert_eq!(config.branch.as_deref(), Some("main"));
        assert_eq!(config.policy.exclude_suffixes, vec![".log".to_string()]);
        assert_eq!(config.watch_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(config.tick_timeout().unwrap(), Duration::from_secs(20));
        assert!(config.daemon.auto_push);
        assert_eq!(config.stop_timeout(), Duration::from_secs(3));
        assert_eq!(config.git_timeout(), Duration::from_secs(60));
        assert_eq!(config.github.owner.as_deref(), Some("acme"));
        assert!(!config.github.create_releases);
        assert!(!config.history.enabled);
        assert_eq!(config.logging.format, "json");
        assert!(!config.logging.color);
    }
}
