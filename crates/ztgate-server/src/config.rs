//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use ztgate_core::{GateError, GateResult, IpCidr};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub listen: ListenSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub overlay: OverlaySection,
    #[serde(default)]
    pub marking: MarkingSection,
    #[serde(default)]
    pub mirror: MirrorSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

/// `[listen]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_true")]
    pub http_enabled: bool,
    #[serde(default = "default_true")]
    pub tcp_enabled: bool,
    #[serde(default = "default_true")]
    pub udp_enabled: bool,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_port: default_http_port(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            http_enabled: true,
            tcp_enabled: true,
            udp_enabled: true,
        }
    }
}

/// `[policy]` section: where rules come from and how often.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    #[serde(default)]
    pub rules_url: Option<String>,
    #[serde(default)]
    pub rules_token: Option<String>,
    #[serde(default = "default_refresh_min")]
    pub refresh_min_secs: u64,
    #[serde(default = "default_refresh_max")]
    pub refresh_max_secs: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_initial_attempts")]
    pub initial_fetch_attempts: u32,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            rules_url: None,
            rules_token: None,
            refresh_min_secs: default_refresh_min(),
            refresh_max_secs: default_refresh_max(),
            fetch_timeout_secs: default_fetch_timeout(),
            initial_fetch_attempts: default_initial_attempts(),
        }
    }
}

/// `[auth]` section: token validation collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub validate_url: Option<String>,
    #[serde(default)]
    pub validate_token: Option<String>,
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            validate_url: None,
            validate_token: None,
            timeout_secs: default_auth_timeout(),
            max_failures: default_max_failures(),
            failure_window_secs: default_failure_window(),
        }
    }
}

/// `[overlay]` section: private address space of tunnel endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlaySection {
    #[serde(default = "default_overlay_cidr")]
    pub cidr: String,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default)]
    pub source_addr: Option<IpAddr>,
    #[serde(default)]
    pub static_peers: Vec<String>,
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            cidr: default_overlay_cidr(),
            interface: default_interface(),
            source_addr: None,
            static_peers: Vec::new(),
        }
    }
}

/// `[marking]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkingSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mark")]
    pub mark: u32,
    #[serde(default = "default_chain")]
    pub chain: String,
}

impl Default for MarkingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            mark: default_mark(),
            chain: default_chain(),
        }
    }
}

/// `[mirror]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub collector: Option<String>,
    #[serde(default = "default_mirror_queue")]
    pub queue_size: usize,
    #[serde(default = "default_mirror_payload")]
    pub max_payload: usize,
}

impl Default for MirrorSection {
    fn default() -> Self {
        Self {
            enabled: false,
            collector: None,
            queue_size: default_mirror_queue(),
            max_payload: default_mirror_payload(),
        }
    }
}

/// `[limits]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,
    #[serde(default = "default_preamble_timeout")]
    pub preamble_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_udp_reply_timeout")]
    pub udp_reply_timeout_secs: u64,
    #[serde(default = "default_idle_pool_timeout")]
    pub idle_pool_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_relay_linger")]
    pub relay_linger_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_flows: default_max_flows(),
            preamble_timeout_secs: default_preamble_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            udp_reply_timeout_secs: default_udp_reply_timeout(),
            idle_pool_timeout_secs: default_idle_pool_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            relay_linger_secs: default_relay_linger(),
        }
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_http_port() -> u16 {
    8080
}
fn default_tcp_port() -> u16 {
    9000
}
fn default_udp_port() -> u16 {
    9001
}
fn default_true() -> bool {
    true
}
fn default_refresh_min() -> u64 {
    30
}
fn default_refresh_max() -> u64 {
    90
}
fn default_fetch_timeout() -> u64 {
    15
}
fn default_initial_attempts() -> u32 {
    3
}
fn default_auth_timeout() -> u64 {
    5
}
fn default_max_failures() -> u32 {
    10
}
fn default_failure_window() -> u64 {
    60
}
fn default_overlay_cidr() -> String {
    "10.200.0.0/16".to_string()
}
fn default_interface() -> String {
    "wg0".to_string()
}
fn default_mark() -> u32 {
    0x5a7e
}
fn default_chain() -> String {
    "PREROUTING".to_string()
}
fn default_mirror_queue() -> usize {
    1024
}
fn default_mirror_payload() -> usize {
    4096
}
fn default_max_flows() -> usize {
    4096
}
fn default_preamble_timeout() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_udp_reply_timeout() -> u64 {
    5
}
fn default_idle_pool_timeout() -> u64 {
    90
}
fn default_shutdown_grace() -> u64 {
    15
}
fn default_relay_linger() -> u64 {
    30
}

/// Environment fallbacks for secrets kept out of the config file.
const RULES_TOKEN_ENV: &str = "ZTGATE_RULES_TOKEN";
const VALIDATE_TOKEN_ENV: &str = "ZTGATE_VALIDATE_TOKEN";

/// CLI values that override the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub http_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub rules_url: Option<String>,
}

/// Resolved server configuration (validated, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: Option<SocketAddr>,
    pub tcp_addr: Option<SocketAddr>,
    pub udp_addr: Option<SocketAddr>,

    pub rules_url: String,
    pub rules_token: Option<String>,
    pub refresh_min: Duration,
    pub refresh_max: Duration,
    pub fetch_timeout: Duration,
    pub initial_fetch_attempts: u32,

    pub validate_url: String,
    pub validate_token: Option<String>,
    pub auth_timeout: Duration,
    pub max_auth_failures: u32,
    pub auth_failure_window: Duration,

    pub overlay_cidr: IpCidr,
    pub overlay_interface: String,
    pub overlay_source_addr: Option<IpAddr>,
    pub static_peers: Vec<IpCidr>,

    pub marking_enabled: bool,
    pub mark: u32,
    pub mark_chain: String,

    pub mirror_enabled: bool,
    pub mirror_collector: Option<String>,
    pub mirror_queue_size: usize,
    pub mirror_max_payload: usize,

    pub max_flows: usize,
    pub preamble_timeout: Duration,
    pub connect_timeout: Duration,
    pub udp_reply_timeout: Duration,
    pub idle_pool_timeout: Duration,
    pub shutdown_grace: Duration,
    pub relay_linger: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| GateError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    /// Validate a parsed file and merge overrides.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> GateResult<Self> {
        let listen = &file.listen;
        let bind = |enabled: bool, port: u16| enabled.then(|| SocketAddr::new(listen.bind_addr, port));

        let rules_url = cli
            .rules_url
            .or(file.policy.rules_url)
            .ok_or_else(|| GateError::Config("policy.rules_url is required".into()))?;
        let validate_url = file
            .auth
            .validate_url
            .ok_or_else(|| GateError::Config("auth.validate_url is required".into()))?;

        if file.policy.refresh_min_secs == 0 || file.policy.refresh_min_secs > file.policy.refresh_max_secs {
            return Err(GateError::Config(format!(
                "invalid refresh window {}..{}s",
                file.policy.refresh_min_secs, file.policy.refresh_max_secs
            )));
        }

        let overlay_cidr = file
            .overlay
            .cidr
            .parse::<IpCidr>()
            .map_err(|e| GateError::Config(format!("overlay.cidr: {e}")))?;
        let static_peers = file
            .overlay
            .static_peers
            .iter()
            .map(|p| p.parse::<IpCidr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| GateError::Config(format!("overlay.static_peers: {e}")))?;

        let timeouts = [
            ("policy.fetch_timeout_secs", file.policy.fetch_timeout_secs),
            ("auth.timeout_secs", file.auth.timeout_secs),
            ("auth.failure_window_secs", file.auth.failure_window_secs),
            ("limits.preamble_timeout_secs", file.limits.preamble_timeout_secs),
            ("limits.connect_timeout_secs", file.limits.connect_timeout_secs),
            ("limits.udp_reply_timeout_secs", file.limits.udp_reply_timeout_secs),
            ("limits.idle_pool_timeout_secs", file.limits.idle_pool_timeout_secs),
            ("limits.shutdown_grace_secs", file.limits.shutdown_grace_secs),
            ("limits.relay_linger_secs", file.limits.relay_linger_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(GateError::Config(format!("{name} must be greater than zero")));
        }

        if file.mirror.enabled && file.mirror.collector.is_none() {
            return Err(GateError::Config("mirror.collector is required when mirroring is enabled".into()));
        }

        Ok(Self {
            http_addr: bind(listen.http_enabled, cli.http_port.unwrap_or(listen.http_port)),
            tcp_addr: bind(listen.tcp_enabled, cli.tcp_port.unwrap_or(listen.tcp_port)),
            udp_addr: bind(listen.udp_enabled, cli.udp_port.unwrap_or(listen.udp_port)),

            rules_url,
            rules_token: file
                .policy
                .rules_token
                .or_else(|| std::env::var(RULES_TOKEN_ENV).ok()),
            refresh_min: Duration::from_secs(file.policy.refresh_min_secs),
            refresh_max: Duration::from_secs(file.policy.refresh_max_secs),
            fetch_timeout: Duration::from_secs(file.policy.fetch_timeout_secs),
            initial_fetch_attempts: file.policy.initial_fetch_attempts.max(1),

            validate_url,
            validate_token: file
                .auth
                .validate_token
                .or_else(|| std::env::var(VALIDATE_TOKEN_ENV).ok()),
            auth_timeout: Duration::from_secs(file.auth.timeout_secs),
            max_auth_failures: file.auth.max_failures,
            auth_failure_window: Duration::from_secs(file.auth.failure_window_secs),

            overlay_cidr,
            overlay_interface: file.overlay.interface,
            overlay_source_addr: file.overlay.source_addr,
            static_peers,

            marking_enabled: file.marking.enabled,
            mark: file.marking.mark,
            mark_chain: file.marking.chain,

            mirror_enabled: file.mirror.enabled,
            mirror_collector: file.mirror.collector,
            mirror_queue_size: file.mirror.queue_size.max(1),
            mirror_max_payload: file.mirror.max_payload,

            max_flows: file.limits.max_flows,
            preamble_timeout: Duration::from_secs(file.limits.preamble_timeout_secs),
            connect_timeout: Duration::from_secs(file.limits.connect_timeout_secs),
            udp_reply_timeout: Duration::from_secs(file.limits.udp_reply_timeout_secs),
            idle_pool_timeout: Duration::from_secs(file.limits.idle_pool_timeout_secs),
            shutdown_grace: Duration::from_secs(file.limits.shutdown_grace_secs),
            relay_linger: Duration::from_secs(file.limits.relay_linger_secs),
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [policy]
        rules_url = "http://mgmt.local/api/rules"
        [auth]
        validate_url = "http://mgmt.local/api/validate"
    "#;

    fn parse(s: &str) -> ConfigFile {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let cfg = ServerConfig::resolve(parse(MINIMAL), CliOverrides::default()).unwrap();
        assert_eq!(cfg.http_addr.unwrap().port(), 8080);
        assert_eq!(cfg.tcp_addr.unwrap().port(), 9000);
        assert_eq!(cfg.udp_addr.unwrap().port(), 9001);
        assert_eq!(cfg.refresh_min, Duration::from_secs(30));
        assert_eq!(cfg.refresh_max, Duration::from_secs(90));
        assert_eq!(cfg.overlay_cidr.to_string(), "10.200.0.0/16");
        assert!(!cfg.mirror_enabled);
        assert!(!cfg.marking_enabled);
    }

    #[test]
    fn cli_overrides_win() {
        let cli = CliOverrides {
            http_port: Some(18080),
            rules_url: Some("http://other/rules".into()),
            ..Default::default()
        };
        let cfg = ServerConfig::resolve(parse(MINIMAL), cli).unwrap();
        assert_eq!(cfg.http_addr.unwrap().port(), 18080);
        assert_eq!(cfg.rules_url, "http://other/rules");
    }

    #[test]
    fn disabled_front_end_has_no_addr() {
        let cfg = ServerConfig::resolve(
            parse(&format!("{MINIMAL}\n[listen]\nudp_enabled = false\n")),
            CliOverrides::default(),
        )
        .unwrap();
        assert!(cfg.udp_addr.is_none());
        assert!(cfg.tcp_addr.is_some());
    }

    #[test]
    fn rejects_invalid_settings() {
        let missing = ServerConfig::resolve(ConfigFile::default(), CliOverrides::default());
        assert!(missing.is_err());

        let inverted = format!("{MINIMAL}\n[limits]\n").replace(
            "[policy]",
            "[policy]\nrefresh_min_secs = 100\nrefresh_max_secs = 50",
        );
        assert!(ServerConfig::resolve(parse(&inverted), CliOverrides::default()).is_err());

        let bad_cidr = format!("{MINIMAL}\n[overlay]\ncidr = \"10.0.0.0/99\"\n");
        assert!(ServerConfig::resolve(parse(&bad_cidr), CliOverrides::default()).is_err());

        let mirror = format!("{MINIMAL}\n[mirror]\nenabled = true\n");
        assert!(ServerConfig::resolve(parse(&mirror), CliOverrides::default()).is_err());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        for field in ["preamble_timeout_secs", "udp_reply_timeout_secs", "shutdown_grace_secs", "relay_linger_secs"] {
            let zeroed = format!("{MINIMAL}\n[limits]\n{field} = 0\n");
            let err = ServerConfig::resolve(parse(&zeroed), CliOverrides::default()).unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
        }

        let zero_auth = MINIMAL.replace("[auth]", "[auth]\ntimeout_secs = 0");
        assert!(ServerConfig::resolve(parse(&zero_auth), CliOverrides::default()).is_err());
    }
}
