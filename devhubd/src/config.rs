//! Daemon configuration: optional `devhub.toml`, then environment, then CLI flags.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use devhub_core::config::{
    default_auth_timeout_secs, default_secret, default_task_retention_secs,
};
use devhub_core::HubConfig;
use serde::Deserialize;
use tracing::warn;

pub const CONFIG_FILE_NAME: &str = "devhub.toml";
pub const CONFIG_ENV: &str = "DEVHUB_CONFIG";
pub const SECRET_ENV: &str = "DEVHUB_SECRET";
pub const PORT_ENV: &str = "PORT";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub hub: HubConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Bearer tokens accepted on the `/api` routes. Empty means the API is open.
    pub tokens: HashSet<String>,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl HttpConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub secret: Option<String>,
    pub tokens: Vec<String>,
    pub tokens_file: Option<PathBuf>,
    pub cors_origins: Vec<String>,
}

/// Parsed `devhub.toml`, with relative paths already resolved against its directory.
#[derive(Debug, Default, Clone)]
pub struct FileConfig {
    pub hub: FileHubConfig,
    pub http: FileHttpConfig,
}

#[derive(Debug, Default, Clone)]
pub struct FileHubConfig {
    pub secret: Option<String>,
    pub auth_timeout_secs: Option<u64>,
    pub task_retention_secs: Option<u64>,
    pub fail_pending_on_disconnect: Option<bool>,
}

#[derive(Debug, Default, Clone)]
pub struct FileHttpConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tokens: Vec<String>,
    pub tokens_file: Option<PathBuf>,
    pub allowed_origins: Vec<String>,
}

#[derive(Deserialize)]
struct RootConfig {
    #[serde(default)]
    hub: Option<RawHubSection>,
    #[serde(default)]
    http: Option<RawHttpSection>,
}

#[derive(Deserialize, Default)]
struct RawHubSection {
    secret: Option<String>,
    auth_timeout_secs: Option<u64>,
    task_retention_secs: Option<u64>,
    fail_pending_on_disconnect: Option<bool>,
}

#[derive(Deserialize, Default)]
struct RawHttpSection {
    host: Option<String>,
    port: Option<u16>,
    tokens: Option<Vec<String>>,
    tokens_file: Option<String>,
    allowed_origins: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TokenFile {
    tokens: Vec<TokenEntry>,
}

#[derive(Deserialize)]
struct TokenEntry {
    token: String,
}

/// Picks the config file: explicit path, then `DEVHUB_CONFIG`, then `./devhub.toml` if present.
pub fn locate_config(
    explicit: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Option<PathBuf> {
    explicit
        .or_else(|| env(CONFIG_ENV).filter(|v| !v.trim().is_empty()).map(PathBuf::from))
        .or_else(|| {
            let candidate = std::env::current_dir().ok()?.join(CONFIG_FILE_NAME);
            candidate.is_file().then_some(candidate)
        })
}

pub fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };

    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read devhub config from {}", path.display()))?;
    let parsed: RootConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;

    let base = path.parent().unwrap_or(Path::new("."));
    Ok(Some(FileConfig {
        hub: parsed.hub.unwrap_or_default().into_runtime_config(),
        http: parsed.http.unwrap_or_default().into_runtime_config(base),
    }))
}

/// Merges CLI, environment and file into the final configuration.
///
/// Secret: CLI, `DEVHUB_SECRET`, file, built-in default. Port: CLI, `PORT`, file, 8000.
pub fn resolve(
    cli: &CliOverrides,
    file_cfg: Option<&FileConfig>,
    env: impl Fn(&str) -> Option<String>,
    working_dir: &Path,
) -> Result<DaemonConfig> {
    let file_hub = file_cfg.map(|cfg| &cfg.hub);
    let file_http = file_cfg.map(|cfg| &cfg.http);

    let secret = cli
        .secret
        .clone()
        .or_else(|| env(SECRET_ENV))
        .or_else(|| file_hub.and_then(|hub| hub.secret.clone()))
        .filter(|secret| !secret.is_empty())
        .unwrap_or_else(default_secret);

    let hub = HubConfig {
        secret,
        auth_timeout_secs: file_hub
            .and_then(|hub| hub.auth_timeout_secs)
            .unwrap_or_else(default_auth_timeout_secs),
        task_retention_secs: file_hub
            .and_then(|hub| hub.task_retention_secs)
            .unwrap_or_else(default_task_retention_secs),
        fail_pending_on_disconnect: file_hub
            .and_then(|hub| hub.fail_pending_on_disconnect)
            .unwrap_or(false),
    };

    let env_port = env(PORT_ENV).and_then(|raw| match raw.trim().parse::<u16>() {
        Ok(port) => Some(port),
        Err(err) => {
            warn!("Invalid {} value '{}': {}", PORT_ENV, raw, err);
            None
        }
    });

    let http = HttpConfig {
        host: cli
            .host
            .clone()
            .or_else(|| file_http.and_then(|http| http.host.clone()))
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: cli
            .port
            .or(env_port)
            .or_else(|| file_http.and_then(|http| http.port))
            .unwrap_or(DEFAULT_PORT),
        tokens: collect_tokens(cli, file_http, working_dir)?,
        allowed_origins: collect_origins(cli, file_http),
    };

    Ok(DaemonConfig { hub, http })
}

fn collect_tokens(
    cli: &CliOverrides,
    file_http: Option<&FileHttpConfig>,
    working_dir: &Path,
) -> Result<HashSet<String>> {
    let mut tokens: HashSet<String> = HashSet::new();

    if let Some(http) = file_http {
        tokens.extend(http.tokens.iter().cloned());
        if let Some(path) = http.tokens_file.as_ref() {
            tokens.extend(load_tokens_from_file(path)?);
        }
    }

    if let Some(path) = cli.tokens_file.as_ref() {
        tokens.extend(load_tokens_from_file(&resolve_relative(working_dir, path))?);
    }

    tokens.extend(cli.tokens.iter().cloned());
    tokens.retain(|token| !token.trim().is_empty());
    Ok(tokens)
}

fn collect_origins(cli: &CliOverrides, file_http: Option<&FileHttpConfig>) -> Vec<String> {
    let mut origins: Vec<String> = Vec::new();
    if let Some(http) = file_http {
        origins.extend(http.allowed_origins.iter().cloned());
    }
    origins.extend(cli.cors_origins.iter().cloned());
    origins.sort();
    origins.dedup();
    origins
}

fn load_tokens_from_file(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tokens file {}", path.display()))?;
    let parsed: TokenFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse tokens file {}", path.display()))?;
    Ok(parsed.tokens.into_iter().map(|entry| entry.token).collect())
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl RawHubSection {
    fn into_runtime_config(self) -> FileHubConfig {
        FileHubConfig {
            secret: self.secret,
            auth_timeout_secs: self.auth_timeout_secs,
            task_retention_secs: self.task_retention_secs,
            fail_pending_on_disconnect: self.fail_pending_on_disconnect,
        }
    }
}

impl RawHttpSection {
    fn into_runtime_config(self, base: &Path) -> FileHttpConfig {
        FileHttpConfig {
            host: self.host,
            port: self.port,
            tokens: self.tokens.unwrap_or_default(),
            tokens_file: self
                .tokens_file
                .map(|value| resolve_relative(base, Path::new(&value))),
            allowed_origins: self.allowed_origins.unwrap_or_default(),
        }
    }
}
