//! Tool-server discovery from TOML manifests.
//!
//! A manifest lists servers as `[[servers]]` tables. The registry can load a
//! single manifest file or every `*.toml` file in a directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Immutable description of an installable tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Capabilities the server declares (e.g. `metrics`, `swarm`).
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ServerDescriptor {
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            env: BTreeMap::new(),
            capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    servers: Vec<ServerDescriptor>,
}

/// Errors while loading manifests.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Tool server '{name}' is declared more than once")]
    Duplicate { name: String },
}

/// Lookup table of known tool servers. Holds no process state.
#[derive(Debug, Clone, Default)]
pub struct ToolServerRegistry {
    servers: BTreeMap<String, ServerDescriptor>,
}

impl ToolServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ServerDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.insert(descriptor)?;
        }
        Ok(registry)
    }

    /// Load from a manifest file or a directory of manifests.
    ///
    /// A missing path yields an empty registry.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(|source| RegistryError::Io {
                    path: path.to_path_buf(),
                    source,
                })?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
                .collect();
            files.sort();
            for file in files {
                registry.load_file(&file)?;
            }
        } else if path.exists() {
            registry.load_file(path)?;
        } else {
            debug!(path = %path.display(), "No tool-server manifest found");
        }

        info!(
            path = %path.display(),
            servers = registry.servers.len(),
            "Tool-server registry loaded"
        );
        Ok(registry)
    }

    fn load_file(&mut self, path: &Path) -> Result<(), RegistryError> {
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Manifest = toml::from_str(&content).map_err(|e| RegistryError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        for descriptor in manifest.servers {
            self.insert(descriptor)?;
        }
        Ok(())
    }

    fn insert(&mut self, descriptor: ServerDescriptor) -> Result<(), RegistryError> {
        if self.servers.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate {
                name: descriptor.name,
            });
        }
        self.servers.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ServerDescriptor> {
        self.servers.get(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.values()
    }

    /// Servers declaring `capability`.
    pub fn with_capability<'a>(
        &'a self,
        capability: &'a str,
    ) -> impl Iterator<Item = &'a ServerDescriptor> + 'a {
        self.servers
            .values()
            .filter(move |d| d.capabilities.iter().any(|c| c == capability))
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
