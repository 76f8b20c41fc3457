use peercall_protocol::IceServer;
use serde::Deserialize;

/// Relay configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// IP address to bind on (default "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port for client control connections.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent users.
    #[serde(default = "default_max_users")]
    pub max_users: u32,

    /// Path to TLS certificate file (PEM).
    #[serde(default = "default_cert_path")]
    pub cert_path: String,

    /// Path to TLS private key file (PEM).
    #[serde(default = "default_key_path")]
    pub key_path: String,

    /// Signals a user may burst before being throttled.
    #[serde(default = "default_signal_burst")]
    pub signal_burst: u32,

    /// Sustained signals per second per user.
    #[serde(default = "default_signal_rate")]
    pub signal_rate: u32,

    /// ICE servers handed to clients for their peer transports.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    9443
}

fn default_max_users() -> u32 {
    256
}

fn default_cert_path() -> String {
    "certs/relay.crt".into()
}

fn default_key_path() -> String {
    "certs/relay.key".into()
}

fn default_signal_burst() -> u32 {
    100
}

fn default_signal_rate() -> u32 {
    50
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun("stun:stun.l.google.com:19302")]
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_users: default_max_users(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            signal_burst: default_signal_burst(),
            signal_rate: default_signal_rate(),
            ice_servers: default_ice_servers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 9443);
        assert_eq!(config.max_users, 256);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            port = 1234
            max_users = 8
            cert_path = "test.crt"
            key_path = "test.key"

            [[ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "relay"
            credential = "secret"
        "#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.port, 1234);
        assert_eq!(config.max_users, 8);
        assert_eq!(config.cert_path, "test.crt");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.ice_servers[0].urls, vec!["turn:turn.example.org:3478"]);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("relay"));
    }
}
