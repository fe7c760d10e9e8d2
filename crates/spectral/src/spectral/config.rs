use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use p384::SecretKey;
use serde::Deserialize;

use crate::spectral::keys;
use crate::spectral::protocol::{disconnect_packet, SimpleStatus};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os("SPECTRAL_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(meta) = fs::metadata(p) {
        if meta.is_dir() {
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("spectral.toml"));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["spectral.toml", "spectral.yaml", "spectral.yml"] {
        let p = dir.join(c);
        if p.is_file() {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no spectral.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj = directories::ProjectDirs::from("io", "spectral", "spectral")
        .context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("spectral.toml"))
}

/// Create a commented starter config on first run. Returns true when a file
/// was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    fs::write(path, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {ext:?}"),
    };

    Config::from_file_config(fc, path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOption {
    Cache,
    AlwaysOnline,
    AlwaysOffline,
}

impl StateOption {
    fn parse(option: &str) -> Self {
        match option.trim().to_ascii_lowercase().as_str() {
            "online" => Self::AlwaysOnline,
            "offline" => Self::AlwaysOffline,
            _ => Self::Cache,
        }
    }
}

/// Global runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_to: String,
    pub default_status: SimpleStatus,
    pub verify_conn_msg: String,
    pub number_of_workers: usize,
    pub number_of_listeners: usize,
    pub accept_proxy_protocol: bool,
    pub io_deadline: Duration,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub reload: ReloadConfig,
    pub backends: Vec<BackendFileConfig>,
    /// Directory of the loaded config file; generated RealIP keys land here.
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

/// Per-backend settings as read from the file, before key loading and packet
/// pre-serialization.
#[derive(Debug, Clone)]
pub struct BackendFileConfig {
    pub name: String,
    pub domains: Vec<String>,
    pub proxy_to: String,
    pub proxy_bind: Option<String>,
    pub dial_timeout: Duration,
    pub use_old_real_ip: bool,
    pub use_new_real_ip: bool,
    pub real_ip_key_path: Option<PathBuf>,
    pub send_proxy_protocol: bool,
    pub disconnect_message: String,
    pub cache_status: bool,
    pub cache_update_cooldown: Duration,
    pub valid_protocol: i32,
    pub offline_status: SimpleStatus,
    pub rate_limit: u32,
    pub rate_cooldown: Duration,
    pub ban_list_cooldown: Duration,
    pub unverify_cooldown: Duration,
    pub limit_bots: bool,
    pub rate_limit_status: bool,
    pub reconnect_msg: String,
    pub check_state_option: String,
    pub state_update_cooldown: Duration,
}

/// Static post-bind configuration a backend agent is built from.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub proxy_to: String,
    pub proxy_bind: Option<String>,
    pub dial_timeout: Duration,
    pub send_proxy_protocol: bool,
    pub use_old_real_ip: bool,
    pub use_new_real_ip: bool,
    pub real_ip_key: Option<SecretKey>,
    pub state_option: StateOption,
    pub state_update_cooldown: Duration,
    pub cache_status: bool,
    pub cache_update_cooldown: Duration,
    pub valid_protocol: i32,
    pub offline_status_packet: Vec<u8>,
    pub disconnect_packet: Vec<u8>,
    pub rate_limit: u32,
    pub rate_limit_status: bool,
    pub rate_limit_duration: Duration,
    pub rate_ban_cooldown: Duration,
    pub unverify_cooldown: Duration,
    pub limit_bots: bool,
    pub rate_disconnect_packet: Vec<u8>,
}

impl BackendFileConfig {
    /// Bind the file config: load or generate the RealIP key when needed and
    /// pre-serialize the response packets the agent hands out.
    ///
    /// A backend that should sign RealIP tokens but cannot obtain a key fails
    /// here; the caller logs and skips it without taking the process down.
    pub fn bind(&self, config_dir: &Path) -> anyhow::Result<BackendConfig> {
        if self.domains.is_empty() {
            anyhow::bail!("backend {:?} has no domains", self.name);
        }
        if self.proxy_to.trim().is_empty() {
            anyhow::bail!("backend {:?} has no proxy_to", self.name);
        }

        let real_ip_key = if self.use_new_real_ip {
            let key = keys::provide_key(
                config_dir,
                &self.domains[0],
                self.real_ip_key_path.as_deref(),
            )
            .with_context(|| format!("backend {:?}: realip key", self.name))?;
            Some(key)
        } else {
            None
        };

        let name = if self.name.trim().is_empty() {
            self.domains[0].clone()
        } else {
            self.name.clone()
        };

        Ok(BackendConfig {
            name,
            proxy_to: self.proxy_to.clone(),
            proxy_bind: self.proxy_bind.clone(),
            dial_timeout: self.dial_timeout,
            send_proxy_protocol: self.send_proxy_protocol,
            use_old_real_ip: self.use_old_real_ip,
            use_new_real_ip: self.use_new_real_ip,
            real_ip_key,
            state_option: StateOption::parse(&self.check_state_option),
            state_update_cooldown: self.state_update_cooldown,
            cache_status: self.cache_status,
            cache_update_cooldown: self.cache_update_cooldown,
            valid_protocol: self.valid_protocol,
            offline_status_packet: self.offline_status.marshal().encode(),
            disconnect_packet: disconnect_packet(&self.disconnect_message).encode(),
            rate_limit: self.rate_limit,
            rate_limit_status: self.rate_limit_status,
            rate_limit_duration: self.rate_cooldown,
            rate_ban_cooldown: self.ban_list_cooldown,
            unverify_cooldown: self.unverify_cooldown,
            limit_bots: self.limit_bots,
            rate_disconnect_packet: disconnect_packet(&self.reconnect_msg).encode(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_to: Option<String>,
    default_status: Option<SimpleStatus>,
    verify_conn_msg: Option<String>,
    number_of_workers: Option<usize>,
    number_of_listeners: Option<usize>,
    #[serde(default)]
    accept_proxy_protocol: bool,
    io_deadline: Option<String>,
    admin_addr: Option<String>,
    logging: Option<FileLogging>,
    reload: Option<FileReload>,
    #[serde(default)]
    backends: Vec<FileBackend>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileReload {
    #[serde(default = "default_true")]
    enabled: bool,
    poll_interval: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBackend {
    #[serde(default)]
    name: String,
    domains: Vec<String>,
    proxy_to: String,
    proxy_bind: Option<String>,
    dial_timeout: Option<String>,
    #[serde(default)]
    use_old_real_ip: bool,
    #[serde(default)]
    use_new_real_ip: bool,
    real_ip_key_path: Option<PathBuf>,
    #[serde(default)]
    send_proxy_protocol: bool,
    disconnect_message: Option<String>,
    cache_status: Option<bool>,
    cache_update_cooldown: Option<String>,
    valid_protocol: Option<i32>,
    offline_status: Option<SimpleStatus>,
    rate_limit: Option<u32>,
    rate_cooldown: Option<String>,
    ban_list_cooldown: Option<String>,
    unverify_cooldown: Option<String>,
    limit_bots: Option<bool>,
    #[serde(default)]
    rate_limit_status: bool,
    reconnect_msg: Option<String>,
    #[serde(default)]
    check_state_option: String,
    state_update_cooldown: Option<String>,
}

fn default_true() -> bool {
    true
}

fn parse_duration(
    field: &str,
    value: Option<&str>,
    default: Duration,
) -> anyhow::Result<Duration> {
    match value {
        None => Ok(default),
        Some(s) if s.trim().is_empty() => Ok(default),
        Some(s) => humantime::parse_duration(s.trim())
            .map_err(|e| anyhow::anyhow!("config: {field} {s:?}: {e}")),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig, path: &Path) -> anyhow::Result<Self> {
        let mut backends = Vec::with_capacity(fc.backends.len());
        for (i, b) in fc.backends.iter().enumerate() {
            let ctx = |field: &str| format!("backends[{i}].{field}");
            backends.push(BackendFileConfig {
                name: b.name.trim().to_string(),
                domains: b
                    .domains
                    .iter()
                    .map(|d| d.trim().to_ascii_lowercase())
                    .filter(|d| !d.is_empty())
                    .collect(),
                proxy_to: b.proxy_to.trim().to_string(),
                proxy_bind: b
                    .proxy_bind
                    .as_deref()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                dial_timeout: parse_duration(
                    &ctx("dial_timeout"),
                    b.dial_timeout.as_deref(),
                    Duration::from_secs(1),
                )?,
                use_old_real_ip: b.use_old_real_ip,
                use_new_real_ip: b.use_new_real_ip,
                real_ip_key_path: b.real_ip_key_path.clone(),
                send_proxy_protocol: b.send_proxy_protocol,
                disconnect_message: b
                    .disconnect_message
                    .clone()
                    .unwrap_or_else(|| r#"{"text": "Server is offline"}"#.to_string()),
                cache_status: b.cache_status.unwrap_or(true),
                cache_update_cooldown: parse_duration(
                    &ctx("cache_update_cooldown"),
                    b.cache_update_cooldown.as_deref(),
                    Duration::from_secs(60),
                )?,
                valid_protocol: b.valid_protocol.unwrap_or(0),
                offline_status: b.offline_status.clone().unwrap_or_default(),
                rate_limit: b.rate_limit.unwrap_or(5),
                rate_cooldown: parse_duration(
                    &ctx("rate_cooldown"),
                    b.rate_cooldown.as_deref(),
                    Duration::from_secs(1),
                )?,
                ban_list_cooldown: parse_duration(
                    &ctx("ban_list_cooldown"),
                    b.ban_list_cooldown.as_deref(),
                    Duration::from_secs(5 * 60),
                )?,
                unverify_cooldown: parse_duration(
                    &ctx("unverify_cooldown"),
                    b.unverify_cooldown.as_deref(),
                    Duration::from_secs(10 * 60),
                )?,
                limit_bots: b.limit_bots.unwrap_or(true),
                rate_limit_status: b.rate_limit_status,
                reconnect_msg: b
                    .reconnect_msg
                    .clone()
                    .unwrap_or_else(|| r#"{"text": "Please reconnect to verify yourself"}"#.to_string()),
                check_state_option: b.check_state_option.clone(),
                state_update_cooldown: parse_duration(
                    &ctx("state_update_cooldown"),
                    b.state_update_cooldown.as_deref(),
                    Duration::from_secs(5),
                )?,
            });
        }

        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            listen_to: fc.listen_to.unwrap_or_else(|| ":25565".to_string()),
            default_status: fc.default_status.unwrap_or(SimpleStatus {
                name: "Spectral".to_string(),
                protocol: 0,
                description: "No backend serves this domain".to_string(),
            }),
            verify_conn_msg: fc
                .verify_conn_msg
                .unwrap_or_else(|| r#"{"text": "Please reconnect to verify yourself"}"#.to_string()),
            number_of_workers: fc.number_of_workers.unwrap_or(10).max(1),
            number_of_listeners: fc.number_of_listeners.unwrap_or(1).max(1),
            accept_proxy_protocol: fc.accept_proxy_protocol,
            io_deadline: parse_duration(
                "io_deadline",
                fc.io_deadline.as_deref(),
                Duration::from_secs(1),
            )?,
            admin_addr: fc.admin_addr.unwrap_or_default().trim().to_string(),
            logging: LoggingConfig {
                level: fc
                    .logging
                    .as_ref()
                    .and_then(|l| l.level.clone())
                    .unwrap_or_else(|| "info".to_string()),
                format: fc
                    .logging
                    .as_ref()
                    .and_then(|l| l.format.clone())
                    .unwrap_or_else(|| "text".to_string()),
                output: fc
                    .logging
                    .as_ref()
                    .and_then(|l| l.output.clone())
                    .unwrap_or_else(|| "stderr".to_string()),
            },
            reload: ReloadConfig {
                enabled: fc.reload.as_ref().map(|r| r.enabled).unwrap_or(true),
                poll_interval: parse_duration(
                    "reload.poll_interval",
                    fc.reload.as_ref().and_then(|r| r.poll_interval.as_deref()),
                    Duration::from_secs(1),
                )?,
            },
            backends,
            config_dir,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Spectral configuration (auto-generated)
#
# Spectral routes Minecraft connections by the virtual host in the client
# handshake. Every backend lists the domains it serves; unknown domains get
# the default status below.

listen_to = ":25565"
verify_conn_msg = '{"text": "Please reconnect to verify yourself"}'
number_of_workers = 10
number_of_listeners = 1
accept_proxy_protocol = false
io_deadline = "1s"
admin_addr = "127.0.0.1:9099"

[default_status]
name = "Spectral"
protocol = 0
description = "No backend serves this domain"

[logging]
level = "info"
format = "text"
output = "stderr"

[reload]
enabled = true
poll_interval = "1s"

# [[backends]]
# name = "example"
# domains = ["example.local"]
# proxy_to = "127.0.0.1:25600"
# dial_timeout = "1s"
# send_proxy_protocol = false
# cache_status = true
# cache_update_cooldown = "1m"
# valid_protocol = 765
# rate_limit = 5
# rate_cooldown = "1s"
# ban_list_cooldown = "5m"
# state_update_cooldown = "5s"
# [backends.offline_status]
# name = "example"
# protocol = 765
# description = "Server is offline"
"#;
