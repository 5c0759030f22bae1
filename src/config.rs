// 配置管理
use crate::cli::Cli;
use crate::utils::error::ConnectionError;
use anyhow::{anyhow, Context, Result};
use dialoguer::{Confirm, Password};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;
pub const DEFAULT_THREADS: usize = 4;

/// Everything needed to reach and authenticate against one remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(String),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl ConnectionTarget {
    pub fn with_password(host: &str, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port: DEFAULT_PORT,
            username: username.to_string(),
            auth: AuthMethod::Password(password.to_string()),
        }
    }

    pub fn with_key(host: &str, username: &str, path: impl Into<PathBuf>, passphrase: Option<&str>) -> Self {
        Self {
            host: host.to_string(),
            port: DEFAULT_PORT,
            username: username.to_string(),
            auth: AuthMethod::PrivateKey {
                path: path.into(),
                passphrase: passphrase.map(str::to_string),
            },
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// known_hosts 中使用的主机标识，非 22 端口写成 `[host]:port`
    pub fn host_id(&self) -> String {
        host_id(&self.host, self.port)
    }
}

pub fn host_id(host: &str, port: u16) -> String {
    if port == DEFAULT_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Unknown hosts are rejected until explicitly accepted.
    #[default]
    RequireExplicitAccept,
    /// Unknown hosts are accepted once authentication succeeds (trust on first use).
    AutoAcceptFirstUse,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk_size: usize,
    /// Maximum number of transfers streaming at the same time.
    pub threads: usize,
    pub trust_policy: TrustPolicy,
    pub known_hosts_path: PathBuf,
    pub connect_timeout: Option<Duration>,
    /// Bounds each `exec`. libssh2 applies it to the whole session, so
    /// chunk reads and writes of transfers running meanwhile share it.
    pub command_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            threads: DEFAULT_THREADS,
            trust_policy: TrustPolicy::default(),
            known_hosts_path: default_known_hosts_path(),
            connect_timeout: None,
            command_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            chunk_size: cli.chunk_size.max(1),
            threads: cli.threads.max(1),
            trust_policy: if cli.accept_new {
                TrustPolicy::AutoAcceptFirstUse
            } else {
                TrustPolicy::RequireExplicitAccept
            },
            known_hosts_path: cli
                .known_hosts
                .clone()
                .unwrap_or_else(default_known_hosts_path),
            connect_timeout: cli.connect_timeout.map(Duration::from_secs),
            command_timeout: cli.command_timeout.map(Duration::from_secs),
        }
    }
}

pub fn default_known_hosts_path() -> PathBuf {
    home::home_dir()
        .map(|home| home.join(".ssh").join("known_hosts"))
        .unwrap_or_else(|| PathBuf::from("known_hosts"))
}

pub fn default_profiles_path() -> PathBuf {
    home::home_dir()
        .map(|home| home.join(".config").join("scp-client").join("connections.json"))
        .unwrap_or_else(|| PathBuf::from("connections.json"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
    Password,
    PrivateKey,
}

/// A saved connection record. Profiles are only ever read here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ConnectionProfile {
    pub fn load_all<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read connection profiles: {}", path.display()))?;
        let profiles: Vec<ConnectionProfile> = serde_json::from_str(&content)
            .context("Failed to parse connection profiles")?;
        Ok(profiles)
    }

    pub fn find<'a>(profiles: &'a [Self], name: &str) -> Option<&'a Self> {
        profiles.iter().find(|p| p.name == name)
    }

    /// `secret` 是密码或私钥口令
    pub fn into_target(self, secret: Option<String>) -> Result<ConnectionTarget, ConnectionError> {
        let auth = match self.auth_type {
            AuthType::Password => AuthMethod::Password(secret.unwrap_or_default()),
            AuthType::PrivateKey => {
                let path = self
                    .private_key_path
                    .ok_or_else(|| ConnectionError::InvalidKeyPath(PathBuf::new()))?;
                AuthMethod::PrivateKey {
                    path,
                    passphrase: secret,
                }
            }
        };

        Ok(ConnectionTarget {
            host: self.host,
            port: self.port,
            username: self.username,
            auth,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub target: ConnectionTarget,
    pub engine: EngineConfig,
    pub verbose: bool,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let engine = EngineConfig::from_cli(cli);

        let profile = match &cli.profile {
            Some(name) => {
                let path = cli.profiles.clone().unwrap_or_else(default_profiles_path);
                let profiles = ConnectionProfile::load_all(&path)?;
                let profile = ConnectionProfile::find(&profiles, name)
                    .cloned()
                    .ok_or_else(|| anyhow!("No connection profile named '{}' in {}", name, path.display()))?;
                Some(profile)
            }
            None => None,
        };

        let host = cli
            .host
            .clone()
            .or_else(|| profile.as_ref().map(|p| p.host.clone()))
            .ok_or_else(|| anyhow!("No host given; use --host or --profile"))?;
        let username = cli
            .username
            .clone()
            .or_else(|| profile.as_ref().map(|p| p.username.clone()))
            .ok_or_else(|| anyhow!("No username given; use --username or --profile"))?;
        let port = match (&profile, cli.port) {
            (Some(p), DEFAULT_PORT) => p.port,
            (_, port) => port,
        };

        let auth = match profile {
            Some(p) if cli.password.is_none() && cli.key_file.is_none() => {
                let secret = match p.auth_type {
                    AuthType::Password => Some(prompt_password(&username, &host)?),
                    AuthType::PrivateKey => cli.passphrase.clone(),
                };
                p.into_target(secret)?.auth
            }
            _ => Self::determine_auth_method(cli, &username, &host)?,
        };

        Ok(Config {
            target: ConnectionTarget {
                host,
                port,
                username,
                auth,
            },
            engine,
            verbose: cli.verbose,
        })
    }

    fn determine_auth_method(cli: &Cli, username: &str, host: &str) -> Result<AuthMethod> {
        // 命令行提供了密码，直接使用
        if let Some(password) = &cli.password {
            return Ok(AuthMethod::Password(password.clone()));
        }

        // 提供了密钥文件路径
        if let Some(key_file) = &cli.key_file {
            return Ok(AuthMethod::PrivateKey {
                path: key_file.clone(),
                passphrase: cli.passphrase.clone(),
            });
        }

        // 尝试查找默认的SSH密钥
        if let Some(home) = home::home_dir() {
            let ssh_dir = home.join(".ssh");
            for key_name in ["id_ed25519", "id_ecdsa", "id_rsa"] {
                let key_path = ssh_dir.join(key_name);
                if key_path.exists() {
                    let use_key = Confirm::new()
                        .with_prompt(format!("Use SSH key {} for authentication?", key_path.display()))
                        .default(true)
                        .interact()?;

                    if use_key {
                        return Ok(AuthMethod::PrivateKey {
                            path: key_path,
                            passphrase: cli.passphrase.clone(),
                        });
                    }
                }
            }
        }

        Ok(AuthMethod::Password(prompt_password(username, host)?))
    }
}

fn prompt_password(username: &str, host: &str) -> Result<String> {
    let password = Password::new()
        .with_prompt(format!("Enter password for {}@{}", username, host))
        .interact()?;
    Ok(password)
}
