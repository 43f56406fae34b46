//! Configuration file model.
//!
//! The file is read at boot and on reload; [`snapshot`](crate::snapshot)
//! compiles it into the immutable lookup structures the hot path uses.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PbxConfig {
    pub sip: SipConfig,

    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub timers: Timers,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    #[serde(default, rename = "extension")]
    pub extensions: Vec<ExtensionConfig>,

    #[serde(default, rename = "trunk")]
    pub trunks: Vec<TrunkConfig>,

    #[serde(default, rename = "inbound_number")]
    pub inbound_numbers: Vec<InboundNumberConfig>,

    #[serde(default, rename = "ring_group")]
    pub ring_groups: Vec<RingGroupConfig>,

    #[serde(default, rename = "outbound_route")]
    pub outbound_routes: Vec<OutboundRouteConfig>,

    #[serde(default, rename = "feature_code")]
    pub feature_codes: Vec<FeatureCodeConfig>,
}

impl PbxConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source: Box::new(source),
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SipConfig {
    /// The SIP domain, also used as the digest realm
    pub domain: String,

    #[serde(default = "default_udp_bind")]
    pub bind_udp: SocketAddr,

    #[serde(default = "default_tcp_bind")]
    pub bind_tcp: SocketAddr,

    /// TLS listener, enabled when certificates are configured
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Message trace verbosity: off, brief or full
    #[serde(default = "default_trace")]
    pub trace: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default = "default_tls_bind")]
    pub bind: SocketAddr,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,
    #[serde(default = "default_max_registrations")]
    pub max_registrations: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Sustained INVITEs per second per peer
    #[serde(default = "default_invite_rate")]
    pub invite_rate: u32,
    /// Burst capacity of the per-peer token bucket
    #[serde(default = "default_invite_burst")]
    pub invite_burst: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            max_registrations: default_max_registrations(),
            max_connections: default_max_connections(),
            invite_rate: default_invite_rate(),
            invite_burst: default_invite_burst(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timers {
    pub t1_ms: Option<u64>,
    pub t2_ms: Option<u64>,
    pub t4_ms: Option<u64>,
}

impl Timers {
    pub fn to_timer_config(&self) -> sip_core::transaction::TimerConfig {
        let defaults = sip_core::transaction::TimerConfig::default();

        sip_core::transaction::TimerConfig {
            t1: self.t1_ms.map(Duration::from_millis).unwrap_or(defaults.t1),
            t2: self.t2_ms.map(Duration::from_millis).unwrap_or(defaults.t2),
            t4: self.t4_ms.map(Duration::from_millis).unwrap_or(defaults.t4),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaConfig {
    /// Codec priority for answer generation
    #[serde(default = "default_codecs")]
    pub codecs: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            codecs: default_codecs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    #[default]
    Never,
    OnDemand,
    Always,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionConfig {
    pub number: String,
    pub password: String,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub recording_mode: RecordingMode,

    /// Cap on simultaneous contact bindings
    #[serde(default = "default_ext_max_registrations")]
    pub max_registrations: usize,

    /// Ring this long before fall-through, seconds
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout: u64,

    #[serde(default)]
    pub follow_me: Option<FollowMeConfig>,

    /// Opaque push token registered by the mobile client
    #[serde(default)]
    pub push_token: Option<String>,

    /// Where unanswered calls land: "voicemail" or none
    #[serde(default)]
    pub unanswered_fallback: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingStrategy {
    #[default]
    Simultaneous,
    Sequential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FollowMeConfig {
    #[serde(default)]
    pub strategy: RingStrategy,

    #[serde(default)]
    pub entries: Vec<FollowMeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FollowMeEntry {
    /// External number or extension to ring
    pub target: String,

    /// Start offset in seconds (simultaneous strategy)
    #[serde(default)]
    pub delay: u64,

    /// Branch deadline in seconds
    #[serde(default = "default_ring_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrunkType {
    Register,
    Ip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerIdMode {
    #[default]
    PassThrough,
    PrependName,
    Substitute,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrunkConfig {
    pub id: String,

    #[serde(rename = "type")]
    pub trunk_type: TrunkType,

    pub host: String,

    #[serde(default = "default_sip_port")]
    pub port: u16,

    /// udp, tcp or tls
    #[serde(default = "default_transport")]
    pub transport: String,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Requested REGISTER expiry, seconds
    #[serde(default = "default_trunk_expiry")]
    pub expiry: u64,

    /// Source addresses accepted as this trunk (type = ip)
    #[serde(default)]
    pub remote_hosts: Vec<String>,

    #[serde(default)]
    pub caller_id_mode: CallerIdMode,

    #[serde(default)]
    pub caller_id_name: Option<String>,

    #[serde(default)]
    pub caller_id_number: Option<String>,

    #[serde(default)]
    pub recording_mode: RecordingMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RingGroupConfig {
    /// The number the group answers on
    pub number: String,

    #[serde(default)]
    pub strategy: RingStrategy,

    /// Extension numbers rung as members
    pub members: Vec<String>,

    /// Per-member ring time before moving on, seconds
    #[serde(default = "default_group_timeout")]
    pub ring_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundNumberConfig {
    /// The DID as presented by the trunk
    pub number: String,
    /// Extension number the call is sent to
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutboundRouteConfig {
    /// Digit pattern; `X` matches any digit, `N` 2-9, `.` any trailing run
    pub pattern: String,
    pub trunk: String,
    #[serde(default = "default_route_priority")]
    pub priority: u32,
    /// Digits stripped from the front before dialing
    #[serde(default)]
    pub strip: usize,
    /// Digits prepended after stripping
    #[serde(default)]
    pub prepend: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureCodeConfig {
    pub code: String,
    /// voicemail_retrieval, voicemail_deposit or pickup
    pub action: String,
}

fn default_shutdown_grace() -> u64 {
    15
}

fn default_udp_bind() -> SocketAddr {
    "0.0.0.0:5060".parse().expect("valid literal")
}

fn default_tcp_bind() -> SocketAddr {
    "0.0.0.0:5060".parse().expect("valid literal")
}

fn default_tls_bind() -> SocketAddr {
    "0.0.0.0:5061".parse().expect("valid literal")
}

fn default_trace() -> String {
    "off".into()
}

fn default_max_calls() -> usize {
    500
}

fn default_max_registrations() -> usize {
    10_000
}

fn default_max_connections() -> usize {
    1024
}

fn default_invite_rate() -> u32 {
    10
}

fn default_invite_burst() -> u32 {
    20
}

fn default_codecs() -> Vec<String> {
    vec![
        "PCMU".into(),
        "PCMA".into(),
        "G722".into(),
        "opus".into(),
    ]
}

fn default_ext_max_registrations() -> usize {
    5
}

fn default_ring_timeout() -> u64 {
    30
}

fn default_group_timeout() -> u64 {
    15
}

fn default_sip_port() -> u16 {
    5060
}

fn default_transport() -> String {
    "udp".into()
}

fn default_trunk_expiry() -> u64 {
    300
}

fn default_route_priority() -> u32 {
    100
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: PbxConfig = toml::from_str(
            r#"
            [sip]
            domain = "pbx.example.org"

            [[extension]]
            number = "100"
            password = "hunter2"

            [[trunk]]
            id = "upstream"
            type = "register"
            host = "sip.provider.example"
            username = "acct"
            password = "pw"
            enabled = true

            [[outbound_route]]
            pattern = "9."
            trunk = "upstream"
            strip = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.extensions.len(), 1);
        assert_eq!(config.trunks[0].trunk_type, TrunkType::Register);
        assert_eq!(config.limits.max_calls, 500);
        assert_eq!(config.outbound_routes[0].strip, 1);
    }
}
