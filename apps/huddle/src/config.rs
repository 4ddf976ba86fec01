use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::MeshError;

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/ws";
const OPENRELAY_CREDENTIAL: &str = "openrelayproject";

/// Fixed delays of the negotiation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationTimings {
    /// Wait between applying a local description and sending it, so the
    /// first candidates ride along in the description.
    pub gather_window: Duration,
    /// Delay before the single retry of a buffered remote answer.
    pub answer_retry: Duration,
    /// Delay between observing `failed` and rebuilding the transport.
    pub repair_delay: Duration,
    /// How long a `disconnected` transport may stay so before repair.
    pub disconnect_grace: Duration,
    pub join_timeout: Duration,
    /// Spacing between offers sent to the roster after a join.
    pub offer_stagger: Duration,
}

impl Default for NegotiationTimings {
    fn default() -> Self {
        Self {
            gather_window: Duration::from_millis(1_000),
            answer_retry: Duration::from_millis(2_000),
            repair_delay: Duration::from_millis(2_000),
            disconnect_grace: Duration::from_millis(5_000),
            join_timeout: Duration::from_millis(10_000),
            offer_stagger: Duration::from_millis(500),
        }
    }
}

impl NegotiationTimings {
    fn apply_env(&mut self) {
        let overrides: [(&str, &mut Duration); 6] = [
            ("HUDDLE_GATHER_WINDOW_MS", &mut self.gather_window),
            ("HUDDLE_ANSWER_RETRY_MS", &mut self.answer_retry),
            ("HUDDLE_REPAIR_DELAY_MS", &mut self.repair_delay),
            ("HUDDLE_DISCONNECT_GRACE_MS", &mut self.disconnect_grace),
            ("HUDDLE_JOIN_TIMEOUT_MS", &mut self.join_timeout),
            ("HUDDLE_OFFER_STAGGER_MS", &mut self.offer_stagger),
        ];
        for (var, slot) in overrides {
            if let Some(ms) = env_parse::<u64>(var) {
                *slot = Duration::from_millis(ms);
            }
        }
    }
}

/// How a session recovers when its relay connection drops: up to
/// `max_attempts` reconnects, `interval` apart, then the room is rejoined.
/// Zero attempts disables recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_millis(2_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

/// Public STUN plus the free openrelay TURN servers for restrictive NATs.
fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
        IceServerConfig::turn(
            "turn:openrelay.metered.ca:80",
            OPENRELAY_CREDENTIAL,
            OPENRELAY_CREDENTIAL,
        ),
        IceServerConfig::turn(
            "turn:openrelay.metered.ca:443",
            OPENRELAY_CREDENTIAL,
            OPENRELAY_CREDENTIAL,
        ),
    ]
}

/// Client configuration.
///
/// Layering: defaults, then an optional TOML file, then `HUDDLE_*`
/// environment variables. CLI flags are applied by the binary last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuddleConfig {
    pub signaling_url: String,
    pub display_identity: Option<String>,
    pub ice_servers: Vec<IceServerConfig>,
    pub timings: NegotiationTimings,
    pub reconnect: ReconnectPolicy,
}

impl Default for HuddleConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            display_identity: None,
            ice_servers: default_ice_servers(),
            timings: NegotiationTimings::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// On-disk shape; every field optional so partial files work.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    signaling_url: Option<String>,
    display_identity: Option<String>,
    ice_servers: Option<Vec<IceServerConfig>>,
    #[serde(default)]
    timings: FileTimings,
    #[serde(default)]
    reconnect: FileReconnect,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileReconnect {
    max_attempts: Option<u32>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimings {
    gather_window_ms: Option<u64>,
    answer_retry_ms: Option<u64>,
    repair_delay_ms: Option<u64>,
    disconnect_grace_ms: Option<u64>,
    join_timeout_ms: Option<u64>,
    offer_stagger_ms: Option<u64>,
}

impl HuddleConfig {
    /// Defaults, then the TOML file at `path` if given, then `HUDDLE_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, MeshError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|err| {
                    MeshError::Config(format!("read config {}: {err}", path.display()))
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, MeshError> {
        let file: FileConfig = toml::from_str(text)
            .map_err(|err| MeshError::Config(format!("invalid config: {err}")))?;
        let mut config = Self::default();
        if let Some(url) = file.signaling_url {
            config.signaling_url = url;
        }
        config.display_identity = file.display_identity;
        if let Some(servers) = file.ice_servers {
            config.ice_servers = servers;
        }
        let t = &mut config.timings;
        let pairs = [
            (file.timings.gather_window_ms, &mut t.gather_window),
            (file.timings.answer_retry_ms, &mut t.answer_retry),
            (file.timings.repair_delay_ms, &mut t.repair_delay),
            (file.timings.disconnect_grace_ms, &mut t.disconnect_grace),
            (file.timings.join_timeout_ms, &mut t.join_timeout),
            (file.timings.offer_stagger_ms, &mut t.offer_stagger),
        ];
        for (value, slot) in pairs {
            if let Some(ms) = value {
                *slot = Duration::from_millis(ms);
            }
        }
        if let Some(attempts) = file.reconnect.max_attempts {
            config.reconnect.max_attempts = attempts;
        }
        if let Some(ms) = file.reconnect.interval_ms {
            config.reconnect.interval = Duration::from_millis(ms);
        }
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("HUDDLE_SIGNALING_URL") {
            self.signaling_url = url;
        }
        if let Ok(name) = env::var("HUDDLE_DISPLAY_NAME") {
            if !name.trim().is_empty() {
                self.display_identity = Some(name);
            }
        }
        if env_truthy("HUDDLE_LOCALHOST_ONLY") {
            self.ice_servers.clear();
        }
        self.timings.apply_env();
        if let Some(attempts) = env_parse::<u32>("HUDDLE_RECONNECT_ATTEMPTS") {
            self.reconnect.max_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("HUDDLE_RECONNECT_INTERVAL_MS") {
            self.reconnect.interval = Duration::from_millis(ms);
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub(crate) fn env_truthy(key: &str) -> bool {
    match env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_client_constants() {
        let timings = NegotiationTimings::default();
        assert_eq!(timings.gather_window, Duration::from_secs(1));
        assert_eq!(timings.answer_retry, Duration::from_secs(2));
        assert_eq!(timings.disconnect_grace, Duration::from_secs(5));
        assert_eq!(timings.join_timeout, Duration::from_secs(10));
        assert_eq!(timings.offer_stagger, Duration::from_millis(500));
        let config = HuddleConfig::default();
        assert_eq!(config.ice_servers.len(), 4);
        let turn: Vec<_> = config
            .ice_servers
            .iter()
            .filter(|server| server.urls[0].starts_with("turn:"))
            .collect();
        assert_eq!(turn.len(), 2);
        assert!(turn.iter().all(|server| server.username.as_deref() == Some("openrelayproject")));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.interval, Duration::from_secs(2));
    }

    #[test]
    fn toml_overrides_only_given_fields() {
        let config = HuddleConfig::from_toml(
            r#"
            signaling_url = "wss://relay.example.com/ws"
            display_identity = "ada@example.com"

            [[ice_servers]]
            urls = ["turn:turn.example.com:3478"]
            username = "u"
            credential = "p"

            [timings]
            gather_window_ms = 250

            [reconnect]
            max_attempts = 0
            "#,
        )
        .expect("parse config");

        assert_eq!(config.signaling_url, "wss://relay.example.com/ws");
        assert_eq!(config.display_identity.as_deref(), Some("ada@example.com"));
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("u"));
        assert_eq!(config.timings.gather_window, Duration::from_millis(250));
        assert_eq!(config.timings.answer_retry, Duration::from_secs(2));
        assert_eq!(config.reconnect.max_attempts, 0);
        assert_eq!(config.reconnect.interval, Duration::from_secs(2));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = HuddleConfig::from_toml("room_capacity = 4").expect_err("unknown key");
        assert!(matches!(err, MeshError::Config(_)));
    }
}
