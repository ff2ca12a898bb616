//! Serde model for the engine's YAML configuration document.
//!
//! Field names follow the engine's kebab-case keys via serde renames.
//! Struct field order is fixed, so serialization is deterministic.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// Built-in pseudo target: connect directly, no proxy. Always kept as the
/// last member of the selection group.
pub const DIRECT: &str = "DIRECT";

/// Name of the group newly added servers are inserted into.
pub const SELECTION_GROUP: &str = "PROXY";

/// The engine's full configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// HTTP proxy listen port
    pub port: u16,
    /// SOCKS proxy listen port
    #[serde(rename = "socks-port")]
    pub socks_port: u16,
    #[serde(rename = "allow-lan")]
    pub allow_lan: bool,
    pub mode: String,
    #[serde(rename = "log-level")]
    pub log_level: String,
    /// Control API bind address, loopback only
    #[serde(rename = "external-controller")]
    pub external_controller: String,
    pub dns: DnsConfig,
    #[serde(default)]
    pub proxies: Vec<ProxyServer>,
    #[serde(rename = "proxy-groups", default)]
    pub proxy_groups: Vec<ProxyGroup>,
    /// Ordered `TYPE,VALUE,TARGET` rule strings, ending in a catch-all
    #[serde(default)]
    pub rules: Vec<String>,
}

/// DNS block with fake-IP mode enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub enable: bool,
    pub listen: String,
    #[serde(rename = "enhanced-mode")]
    pub enhanced_mode: String,
    #[serde(rename = "fake-ip-range")]
    pub fake_ip_range: String,
    pub nameserver: Vec<String>,
    pub fallback: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            listen: "0.0.0.0:53".to_string(),
            enhanced_mode: "fake-ip".to_string(),
            fake_ip_range: "198.18.0.1/16".to_string(),
            nameserver: vec!["223.5.5.5".to_string(), "119.29.29.29".to_string()],
            fallback: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 7890,
            socks_port: 7891,
            allow_lan: true,
            mode: "rule".to_string(),
            log_level: "info".to_string(),
            external_controller: "127.0.0.1:9090".to_string(),
            dns: DnsConfig::default(),
            proxies: Vec::new(),
            proxy_groups: vec![ProxyGroup {
                name: SELECTION_GROUP.to_string(),
                kind: "select".to_string(),
                proxies: vec![DIRECT.to_string()],
            }],
            rules: vec![format!("MATCH,{SELECTION_GROUP}")],
        }
    }
}

/// One proxy server entry.
///
/// The common fields are typed; protocol-specific credential fields live
/// in the flattened `options` map so foreign documents with proxy types
/// we never construct still load and round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyServer {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    pub port: u16,
    #[serde(flatten)]
    pub options: Mapping,
}

impl ProxyServer {
    /// Build a shadowsocks server entry.
    pub fn shadowsocks(
        name: &str,
        server: &str,
        port: u16,
        password: &str,
        cipher: &str,
    ) -> Self {
        let mut options = Mapping::new();
        options.insert(Value::from("cipher"), Value::from(cipher));
        options.insert(Value::from("password"), Value::from(password));
        options.insert(Value::from("udp"), Value::from(true));

        Self {
            name: name.to_string(),
            kind: "ss".to_string(),
            server: server.to_string(),
            port,
            options,
        }
    }

    /// Build a vmess-over-websocket server entry.
    pub fn vmess(name: &str, server: &str, port: u16, uuid: &str, ws_path: &str) -> Self {
        let mut headers = Mapping::new();
        headers.insert(Value::from("Host"), Value::from(server));

        let mut ws_opts = Mapping::new();
        ws_opts.insert(Value::from("path"), Value::from(ws_path));
        ws_opts.insert(Value::from("headers"), Value::Mapping(headers));

        let mut options = Mapping::new();
        options.insert(Value::from("uuid"), Value::from(uuid));
        options.insert(Value::from("alterId"), Value::from(0));
        options.insert(Value::from("cipher"), Value::from("auto"));
        options.insert(Value::from("tls"), Value::from(true));
        options.insert(Value::from("network"), Value::from("ws"));
        options.insert(Value::from("ws-opts"), Value::Mapping(ws_opts));

        Self {
            name: name.to_string(),
            kind: "vmess".to_string(),
            server: server.to_string(),
            port,
            options,
        }
    }
}

/// One proxy group: an ordered member list under a selection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub proxies: Vec<String>,
}
