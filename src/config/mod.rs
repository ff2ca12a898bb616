//! Engine configuration synthesis and mutation.
//!
//! The engine reads its configuration file once at launch and is never
//! hot-reloaded, so mutations take effect through a supervisor restart.
//! Every write goes through a sibling temp file and a rename, so the
//! engine can never observe a half-written document.

pub mod model;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::model::{EngineConfig, ProxyGroup, ProxyServer, DIRECT, SELECTION_GROUP};

/// Pseudo targets the engine resolves without a proxy definition.
const BUILTIN_TARGETS: &[&str] = &[DIRECT, "REJECT"];

/// Errors produced while loading or mutating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An existing file failed to parse. Surfaced, never silently
    /// replaced with the default.
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("proxy or group named '{0}' already exists")]
    DuplicateName(String),

    #[error("group '{group}' references unknown member '{member}'")]
    DanglingReference { group: String, member: String },

    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

impl EngineConfig {
    /// Parse the file at `path` if it exists, or return the built-in
    /// default configuration.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no config at {}; using defaults", path.display());
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Append a proxy server and register it in the selection group,
    /// immediately before the trailing `DIRECT` sentinel.
    ///
    /// Fails without mutating anything if the name is already taken or
    /// the document is already referentially inconsistent.
    pub fn add_proxy(&mut self, spec: ProxyServer) -> Result<()> {
        self.validate()?;

        let taken = self.proxies.iter().any(|p| p.name == spec.name)
            || self.proxy_groups.iter().any(|g| g.name == spec.name);
        if taken {
            return Err(ConfigError::DuplicateName(spec.name));
        }

        let name = spec.name.clone();
        self.proxies.push(spec);

        match self
            .proxy_groups
            .iter_mut()
            .find(|g| g.name == SELECTION_GROUP)
        {
            Some(group) => {
                // Keep the sentinel reachable as the last fallback choice.
                match group.proxies.iter().rposition(|m| m == DIRECT) {
                    Some(sentinel) => group.proxies.insert(sentinel, name.clone()),
                    None => group.proxies.push(name.clone()),
                }
            }
            None => self.proxy_groups.push(ProxyGroup {
                name: SELECTION_GROUP.to_string(),
                kind: "select".to_string(),
                proxies: vec![name.clone(), DIRECT.to_string()],
            }),
        }

        log::info!("added proxy server '{name}'");
        Ok(())
    }

    /// Check that every group member resolves to a known proxy, a known
    /// group, or a built-in pseudo target.
    pub fn validate(&self) -> Result<()> {
        let mut known: HashSet<&str> = BUILTIN_TARGETS.iter().copied().collect();
        known.extend(self.proxies.iter().map(|p| p.name.as_str()));
        known.extend(self.proxy_groups.iter().map(|g| g.name.as_str()));

        for group in &self.proxy_groups {
            for member in &group.proxies {
                if !known.contains(member.as_str()) {
                    return Err(ConfigError::DanglingReference {
                        group: group.name.clone(),
                        member: member.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate, then serialize and write atomically (temp file in the
    /// same directory, then rename). A validation failure aborts before
    /// any byte is written.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let text = serde_yaml::to_string(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, text)?;
        fs::rename(&tmp_path, path)?;

        log::info!("saved config to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_shape() {
        let config = EngineConfig::default();
        assert_eq!(config.port, 7890);
        assert_eq!(config.socks_port, 7891);
        assert_eq!(config.external_controller, "127.0.0.1:9090");
        assert_eq!(config.dns.enhanced_mode, "fake-ip");
        assert!(config.proxies.is_empty());
        assert_eq!(config.proxy_groups.len(), 1);
        assert_eq!(config.proxy_groups[0].proxies, vec![DIRECT]);
        assert_eq!(config.rules.last().unwrap(), "MATCH,PROXY");
        config.validate().unwrap();
    }

    #[test]
    fn test_add_proxy_inserts_before_sentinel() {
        let mut config = EngineConfig::default();
        config
            .add_proxy(ProxyServer::shadowsocks(
                "SS-1",
                "203.0.113.5",
                8443,
                "secret",
                "aes-256-gcm",
            ))
            .unwrap();

        assert_eq!(config.proxies.len(), 1);
        let group = &config.proxy_groups[0];
        assert_eq!(group.proxies, vec!["SS-1", DIRECT]);
    }

    #[test]
    fn test_add_proxy_preserves_call_order() {
        let mut config = EngineConfig::default();
        for name in ["A", "B", "C"] {
            config
                .add_proxy(ProxyServer::shadowsocks(name, "h", 443, "pw", "aes-256-gcm"))
                .unwrap();
        }

        let group = &config.proxy_groups[0];
        assert_eq!(group.proxies, vec!["A", "B", "C", DIRECT]);
    }

    #[test]
    fn test_add_proxy_rejects_duplicate_unchanged() {
        let mut config = EngineConfig::default();
        config
            .add_proxy(ProxyServer::vmess("VM-1", "example.com", 443, "uuid", "/"))
            .unwrap();
        let before = config.clone();

        let err = config
            .add_proxy(ProxyServer::shadowsocks("VM-1", "h", 443, "pw", "aes-256-gcm"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(name) if name == "VM-1"));
        assert_eq!(config, before);
    }

    #[test]
    fn test_validate_rejects_dangling_member() {
        let mut config = EngineConfig::default();
        config.proxy_groups[0].proxies.insert(0, "GHOST".to_string());

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DanglingReference { ref member, .. } if member == "GHOST"
        ));
    }

    #[test]
    fn test_group_may_reference_other_groups() {
        let mut config = EngineConfig::default();
        config.proxy_groups.push(ProxyGroup {
            name: "FALLBACK".to_string(),
            kind: "fallback".to_string(),
            proxies: vec![SELECTION_GROUP.to_string(), DIRECT.to_string()],
        });
        config.validate().unwrap();
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_or_default(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_or_default_surfaces_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "port: [not a port").unwrap();

        assert!(matches!(
            EngineConfig::load_or_default(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = EngineConfig::default();
        config
            .add_proxy(ProxyServer::shadowsocks(
                "SS-1",
                "203.0.113.5",
                8443,
                "secret",
                "chacha20-ietf-poly1305",
            ))
            .unwrap();
        config.save(&path).unwrap();

        let reloaded = EngineConfig::load_or_default(&path).unwrap();
        assert_eq!(reloaded, config);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_save_rejects_dangling_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        EngineConfig::default().save(&path).unwrap();
        let original = std::fs::read_to_string(&path).unwrap();

        let mut broken = EngineConfig::default();
        broken.proxy_groups[0].proxies.push("GHOST".to_string());
        assert!(broken.save(&path).is_err());

        // The previous file is intact and no temp file is left behind.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        EngineConfig::default().save(&path).unwrap();

        let mut updated = EngineConfig::default();
        updated.port = 8890;
        updated.save(&path).unwrap();

        let reloaded = EngineConfig::load_or_default(&path).unwrap();
        assert_eq!(reloaded.port, 8890);
    }

    #[test]
    fn test_vmess_options_shape() {
        let proxy = ProxyServer::vmess("VM-1", "example.com", 443, "some-uuid", "/ws");
        assert_eq!(proxy.kind, "vmess");

        let ws_opts = proxy
            .options
            .get(serde_yaml::Value::from("ws-opts"))
            .and_then(|v| v.as_mapping())
            .unwrap();
        assert_eq!(
            ws_opts.get(serde_yaml::Value::from("path")),
            Some(&serde_yaml::Value::from("/ws"))
        );
    }
}
