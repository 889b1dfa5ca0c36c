//! Process configuration: which accounts to sync and how to reach them.
//! Loaded from TOML via `serde`, under a directory resolved with `dirs`,
//! following the same `Config::load`/`save`/`config_dir` shape the
//! teacher application uses.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::constants::DEFAULT_SLOW_REFRESH_INTERVAL_SECS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Which IMAP dialect this account should be synced as. `Gmail` gets the
/// X-GM-LABELS/X-GM-THRID label-reconciliation path; everything else gets
/// the generic CONDSTORE-if-available path.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Generic,
    Gmail,
}

/// Authentication method for an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    Password {
        /// Optional inline password; if absent, the OS keyring is
        /// consulted at connect time.
        #[serde(default)]
        password: Option<String>,
    },
    OAuth2 {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[serde(default)]
        token_url: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapEndpoint {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    /// `true` for implicit TLS (usually port 993); `false` to connect in
    /// the clear and upgrade via STARTTLS.
    #[serde(default = "default_true")]
    pub implicit_tls: bool,
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_slow_refresh_interval_secs() -> u64 {
    DEFAULT_SLOW_REFRESH_INTERVAL_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable identifier for this account, used as the credential
    /// provider's lookup key and the connection pool registry key.
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub provider: Provider,
    pub imap: ImapEndpoint,
    pub auth: AuthMethod,
    /// Folder names excluded from sync entirely (not even catalogued).
    #[serde(default)]
    pub excluded_folders: Vec<String>,
    /// Set when the provider has asked us to back off; shrinks the
    /// connection pool to one connection regardless of the defaults.
    #[serde(default)]
    pub throttled: bool,
    #[serde(default = "default_slow_refresh_interval_secs")]
    pub slow_refresh_interval_secs: u64,
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("imap-sync-core");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("imap-sync-core");
        Ok(dir)
    }

    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_account_config_with_mixed_auth() {
        let toml = r#"
            [[accounts]]
            id = "personal"
            email = "me@gmail.com"
            provider = "gmail"

            [accounts.imap]
            host = "imap.gmail.com"

            [accounts.auth]
            type = "oauth2"
            client_id = "abc"
            client_secret = "def"
            refresh_token = "ghi"

            [[accounts]]
            id = "work"
            email = "me@work.example.com"

            [accounts.imap]
            host = "imap.work.example.com"
            port = 143
            implicit_tls = false

            [accounts.auth]
            type = "password"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].provider, Provider::Gmail);
        assert_eq!(config.accounts[1].imap.port, 143);
        assert!(!config.accounts[1].imap.implicit_tls);
        match &config.accounts[1].auth {
            AuthMethod::Password { password } => assert!(password.is_none()),
            _ => panic!("expected password auth"),
        }
    }

    #[test]
    fn slow_refresh_interval_defaults_when_absent() {
        let toml = r#"
            [[accounts]]
            id = "a"
            email = "a@example.com"

            [accounts.imap]
            host = "imap.example.com"

            [accounts.auth]
            type = "password"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.accounts[0].slow_refresh_interval_secs,
            DEFAULT_SLOW_REFRESH_INTERVAL_SECS
        );
    }
}
