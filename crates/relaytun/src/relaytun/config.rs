use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::relaytun::tunnel::{
    broker::BrokerOptions,
    client::ClientOptions,
    listener::{EndpointOptions, LocalPort},
    policy::PolicyKind,
    session::LegClose,
    target::Target,
    transport::parse_transport,
};

pub const CONFIG_ENV: &str = "RELAYTUN_CONFIG";
pub const DEFAULT_TOKEN_ENV: &str = "RELAYTUN_ACCESS_TOKEN";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

    // clap maps RELAYTUN_CONFIG into the flag already; this covers library callers.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
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
    if fs::metadata(p).is_ok_and(|m| m.is_dir()) {
        return discover_config_path(p).or_else(|_| Ok(p.join("relaytun.toml")));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["relaytun.toml", "relaytun.yaml", "relaytun.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no relaytun.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("dev", "relaytun", "relaytun")
        .context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("relaytun.toml"))
}

/// Loads the resolved file. Only a missing file at the OS default location falls back to
/// built-in defaults; an explicit path must exist.
pub fn load(resolved: &ResolvedConfigPath) -> anyhow::Result<Config> {
    if resolved.source == ConfigPathSource::Default && !resolved.path.exists() {
        return Config::from_file_config(FileConfig::default());
    }
    load_config(&resolved.path)
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
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .toml or .yaml/.yml)", ext),
    };

    Config::from_file_config(fc).with_context(|| format!("config: {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub relay: RelayConfig,
    pub reconnect: ReconnectConfig,
    pub tunnel: TunnelDefaults,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub admin_addr: String,
    pub tunnels: Vec<TunnelEntry>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub endpoint: String,
    /// websocket | tcp
    pub transport: String,
    pub handshake_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub connect_attempts: u32,
    pub reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct TunnelDefaults {
    pub keepalive: Duration,
    pub idle_grace: Duration,
    pub connect_timeout: Duration,
    pub send_buffer_high_water: usize,
    pub ack_threshold: u64,
    pub leg_close: LegClose,
    pub local_port: LocalPort,
    pub bind_ip: IpAddr,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub token_env: String,
    pub token_command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct TunnelEntry {
    pub target: Target,
    pub policy: PolicyKind,
}

impl Config {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            handshake_timeout: self.relay.handshake_timeout,
            connect_attempts: self.reconnect.connect_attempts,
            reconnect_attempts: self.reconnect.reconnect_attempts,
            initial_backoff: self.reconnect.initial_backoff,
            max_backoff: self.reconnect.max_backoff,
            keepalive_interval: self.tunnel.keepalive,
            send_high_water: self.tunnel.send_buffer_high_water,
            ack_threshold: self.tunnel.ack_threshold,
        }
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            client: self.client_options(),
            idle_grace: self.tunnel.idle_grace,
            leg_close: self.tunnel.leg_close,
            endpoint: EndpointOptions {
                bind_ip: self.tunnel.bind_ip,
                port: self.tunnel.local_port,
            },
        }
    }

    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let relay = fc.relay.unwrap_or_default();
        let rc = fc.reconnect.unwrap_or_default();
        let td = fc.tunnel.unwrap_or_default();
        let auth = fc.auth.unwrap_or_default();
        let logging = fc.logging.unwrap_or_default();

        let cfg = Config {
            relay: RelayConfig {
                endpoint: relay.endpoint.unwrap_or_default().trim().to_string(),
                transport: parse_transport(relay.transport.as_deref().unwrap_or(""))?,
                handshake_timeout: millis(relay.handshake_timeout_ms, 10_000),
            },
            reconnect: ReconnectConfig {
                connect_attempts: rc.connect_attempts.unwrap_or(3).max(1),
                reconnect_attempts: rc.reconnect_attempts.unwrap_or(5),
                initial_backoff: millis(rc.initial_backoff_ms, 500),
                max_backoff: millis(rc.max_backoff_ms, 10_000),
            },
            tunnel: TunnelDefaults {
                keepalive: millis(td.keepalive_ms, 30_000),
                idle_grace: millis(td.idle_grace_ms, 30_000),
                connect_timeout: millis(td.connect_timeout_ms, 60_000),
                send_buffer_high_water: td.send_buffer_high_water.unwrap_or(4 << 20).max(0) as usize,
                ack_threshold: td.ack_threshold.unwrap_or(1 << 20).max(1) as u64,
                leg_close: td.leg_close.as_deref().unwrap_or("").parse()?,
                local_port: match td.local_port {
                    None => LocalPort::Ephemeral,
                    Some(StringOrPort::Port(0)) => LocalPort::Ephemeral,
                    Some(StringOrPort::Port(p)) => LocalPort::Fixed(p),
                    Some(StringOrPort::Name(s)) => s.parse()?,
                },
                bind_ip: match td.bind.as_deref().map(str::trim) {
                    None | Some("") => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    Some(s) => s
                        .parse()
                        .with_context(|| format!("config: bad tunnel.bind {s:?}"))?,
                },
            },
            auth: AuthConfig {
                token_env: auth
                    .token_env
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|| DEFAULT_TOKEN_ENV.to_string()),
                token_command: auth
                    .token_command
                    .map(StringOrVec::into_vec)
                    .unwrap_or_default(),
            },
            logging: LoggingConfig {
                level: logging.level.unwrap_or_else(|| "info".into()),
                format: logging.format.unwrap_or_else(|| "text".into()),
                output: logging.output.unwrap_or_else(|| "stderr".into()),
                add_source: logging.add_source,
            },
            admin_addr: fc.admin_addr.trim().to_string(),
            tunnels: fc
                .tunnels
                .into_iter()
                .enumerate()
                .map(|(i, t)| t.into_entry().with_context(|| format!("config: tunnels[{i}]")))
                .collect::<anyhow::Result<_>>()?,
        };

        if !cfg.tunnel.bind_ip.is_loopback() {
            anyhow::bail!("config: tunnel.bind must be a loopback address, got {}", cfg.tunnel.bind_ip);
        }
        if cfg.relay.handshake_timeout.is_zero() {
            anyhow::bail!("config: relay.handshake_timeout_ms must be greater than 0");
        }
        if cfg.reconnect.max_backoff < cfg.reconnect.initial_backoff {
            anyhow::bail!("config: reconnect.max_backoff_ms is smaller than initial_backoff_ms");
        }
        Ok(cfg)
    }
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|v| v.max(0) as u64).unwrap_or(default))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    relay: Option<FileRelay>,
    reconnect: Option<FileReconnect>,
    tunnel: Option<FileTunnelDefaults>,
    auth: Option<FileAuth>,
    logging: Option<FileLogging>,
    #[serde(default)]
    tunnels: Vec<FileTunnel>,
}

#[derive(Debug, Default, Deserialize)]
struct FileRelay {
    endpoint: Option<String>,
    transport: Option<String>,
    handshake_timeout_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileReconnect {
    connect_attempts: Option<u32>,
    reconnect_attempts: Option<u32>,
    initial_backoff_ms: Option<i64>,
    max_backoff_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileTunnelDefaults {
    keepalive_ms: Option<i64>,
    idle_grace_ms: Option<i64>,
    connect_timeout_ms: Option<i64>,
    send_buffer_high_water: Option<i64>,
    ack_threshold: Option<i64>,
    leg_close: Option<String>,
    local_port: Option<StringOrPort>,
    bind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileAuth {
    token_env: Option<String>,
    token_command: Option<StringOrVec>,
}

#[derive(Debug, Default, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    project: String,
    zone: String,
    instance: String,
    port: u16,
    interface: Option<String>,
    policy: Option<String>,
}

impl FileTunnel {
    fn into_entry(self) -> anyhow::Result<TunnelEntry> {
        let mut target = Target::new(
            self.project.trim(),
            self.zone.trim(),
            self.instance.trim(),
            self.port,
        );
        if let Some(nic) = self.interface.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            target.interface = nic.to_string();
        }
        target.validate()?;
        Ok(TunnelEntry {
            target,
            policy: self.policy.as_deref().unwrap_or("").parse()?,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    /// A single string is split on whitespace, so `"gcloud auth print-access-token"` works.
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => s.split_whitespace().map(str::to_string).collect(),
            StringOrVec::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrPort {
    Port(u16),
    Name(String),
}
