//! Process configuration: which servers exist, which backends run where,
//! and client-side limits.
//!
//! The on-disk format is INI-style:
//!
//! ```ini
//! [clients]
//! max-connections=16
//!
//! [servers]
//! object=alpha:4711;beta:4711
//! kv=alpha:4711
//!
//! [object]
//! backend=posix
//! component=server
//! path=/var/lib/shoal/objects
//!
//! [kv]
//! backend=memory
//! component=server
//! path=
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

const CONFIG_DIR: &str = "shoal";
const CONFIG_NAME: &str = "shoal";
const CONFIG_ENV: &str = "SHOAL_CONFIG";

/// Which side of the wire runs a store's backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: String,
    pub component: Component,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub max_connections: usize,
    pub object_servers: Vec<String>,
    pub kv_servers: Vec<String>,
    pub object: StoreConfig,
    pub kv: StoreConfig,
}

impl Configuration {
    /// Locate and parse the configuration, honoring `$SHOAL_CONFIG`
    /// (an absolute path wins; a relative value names the file to look
    /// up), then `$XDG_CONFIG_HOME/shoal/<name>`, then every directory
    /// in `$XDG_CONFIG_DIRS`.
    pub fn load() -> crate::Result<Self> {
        let mut name = CONFIG_NAME.to_string();

        if let Ok(env) = std::env::var(CONFIG_ENV) {
            let env = PathBuf::from(env);
            if env.is_absolute() {
                return Self::from_file(&env);
            }
            name = env.to_string_lossy().into_owned();
        }

        let mut candidates = Vec::new();
        if let Some(home) = dirs::config_dir() {
            candidates.push(home.join(CONFIG_DIR).join(&name));
        }
        if let Ok(dirs) = std::env::var("XDG_CONFIG_DIRS") {
            for dir in dirs.split(':').filter(|d| !d.is_empty()) {
                candidates.push(Path::new(dir).join(CONFIG_DIR).join(&name));
            }
        }

        for candidate in &candidates {
            if candidate.is_file() {
                return Self::from_file(candidate);
            }
        }
        Err(crate::Error::Config(format!(
            "no configuration named '{name}' found"
        )))
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            crate::Error::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Self::parse(&text)
    }

    /// Parse the INI-style configuration text.
    pub fn parse(text: &str) -> crate::Result<Self> {
        let mut max_connections = DEFAULT_MAX_CONNECTIONS;
        let mut object_servers = Vec::new();
        let mut kv_servers = Vec::new();
        let mut object: Option<PartialStore> = None;
        let mut kv: Option<PartialStore> = None;

        let mut section = String::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                if section == "object" && object.is_none() {
                    object = Some(PartialStore::default());
                }
                if section == "kv" && kv.is_none() {
                    kv = Some(PartialStore::default());
                }
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                crate::Error::Config(format!("line {}: expected key=value", number + 1))
            })?;
            let (key, value) = (key.trim(), value.trim());

            match (section.as_str(), key) {
                ("clients", "max-connections") => {
                    max_connections = value.parse().map_err(|_| {
                        crate::Error::Config(format!(
                            "line {}: max-connections must be an integer",
                            number + 1
                        ))
                    })?;
                }
                ("servers", "object") => object_servers = split_servers(value),
                ("servers", "kv") => kv_servers = split_servers(value),
                ("object", _) | ("kv", _) => {
                    let store = if section == "object" {
                        object.as_mut()
                    } else {
                        kv.as_mut()
                    };
                    // The section header was seen first; the option is Some.
                    if let Some(store) = store {
                        store.set(key, value, number + 1)?;
                    }
                }
                _ => {
                    tracing::debug!(section, key, "ignoring unknown configuration key");
                }
            }
        }

        let config = Configuration {
            max_connections,
            object_servers,
            kv_servers,
            object: object
                .ok_or_else(|| crate::Error::Config("missing [object] section".into()))?
                .finish("object")?,
            kv: kv
                .ok_or_else(|| crate::Error::Config("missing [kv] section".into()))?
                .finish("kv")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections == 0 {
            return Err(crate::Error::Config(
                "max-connections must be at least 1".into(),
            ));
        }
        if self.object.component == Component::Server && self.object_servers.is_empty() {
            return Err(crate::Error::Config(
                "a remote object store needs at least one server".into(),
            ));
        }
        if self.kv.component == Component::Server && self.kv_servers.is_empty() {
            return Err(crate::Error::Config(
                "a remote kv store needs at least one server".into(),
            ));
        }
        Ok(())
    }
}

fn split_servers(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Default)]
struct PartialStore {
    backend: Option<String>,
    component: Option<Component>,
    path: Option<String>,
}

impl PartialStore {
    fn set(&mut self, key: &str, value: &str, line: usize) -> crate::Result<()> {
        match key {
            "backend" => self.backend = Some(value.to_string()),
            "component" => {
                self.component = Some(match value {
                    "client" => Component::Client,
                    "server" => Component::Server,
                    other => {
                        return Err(crate::Error::Config(format!(
                            "line {line}: unknown component '{other}'"
                        )))
                    }
                })
            }
            "path" => self.path = Some(value.to_string()),
            other => {
                tracing::debug!(key = other, "ignoring unknown store key");
            }
        }
        Ok(())
    }

    fn finish(self, section: &str) -> crate::Result<StoreConfig> {
        Ok(StoreConfig {
            backend: self
                .backend
                .ok_or_else(|| crate::Error::Config(format!("[{section}] is missing backend")))?,
            component: self.component.ok_or_else(|| {
                crate::Error::Config(format!("[{section}] is missing component"))
            })?,
            path: self.path.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const EXAMPLE: &str = r#"
# client limits
[clients]
max-connections=4

[servers]
object=alpha:4711; beta
kv=gamma:4712

[object]
backend=posix
component=server
path=/tmp/shoal-objects

[kv]
backend=memory
component=client
path=
"#;

    #[test]
    fn parses_the_example() {
        let config = Configuration::parse(EXAMPLE).unwrap();
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            serde_json::json!({
                "max_connections": 4,
                "object_servers": ["alpha:4711", "beta"],
                "kv_servers": ["gamma:4712"],
                "object": {
                    "backend": "posix",
                    "component": "server",
                    "path": "/tmp/shoal-objects",
                },
                "kv": {
                    "backend": "memory",
                    "component": "client",
                    "path": "",
                },
            })
        );
    }

    #[test]
    fn missing_servers_for_remote_store_fail_validation() {
        let text = EXAMPLE.replace("object=alpha:4711; beta", "object=");
        match Configuration::parse(&text) {
            Err(crate::Error::Config(reason)) => {
                assert!(reason.contains("object store"), "{reason}")
            }
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn local_component_needs_no_servers() {
        let text = EXAMPLE
            .replace("object=alpha:4711; beta", "object=")
            .replace("component=server", "component=client");
        let config = Configuration::parse(&text).unwrap();
        assert_eq!(config.object.component, Component::Client);
        assert!(config.object_servers.is_empty());
    }

    #[test]
    fn rejects_malformed_lines_and_values() {
        assert!(Configuration::parse("[clients]\nmax-connections=lots").is_err());
        assert!(Configuration::parse("[clients]\nnonsense").is_err());

        let text = EXAMPLE.replace("component=client", "component=sideways");
        assert!(Configuration::parse(&text).is_err());
    }

    #[test]
    fn missing_sections_are_errors() {
        assert!(matches!(
            Configuration::parse("[servers]\nobject=alpha\nkv=alpha"),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shoal");
        std::fs::write(&path, EXAMPLE).unwrap();

        let config = Configuration::from_file(&path).unwrap();
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.kv_servers, vec!["gamma:4712"]);
    }
}
