//! Module byte loaders.
//!
//! The instance store asks a [`ModuleLoader`] for module bytes whenever an
//! instance id is not live. Loaders are injected at construction; the store
//! bounds every call with the configured fetch timeout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use wasm_sandbox_common::{ConfigFile, SandboxError};

/// Source of module bytes for an instance id.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Fetch the module for `instance_id`.
    ///
    /// The bytes may be a binary module or WAT text.
    async fn load(&self, instance_id: &str) -> Result<Vec<u8>, SandboxError>;
}

/// Loads modules from the filesystem.
///
/// Ids are resolved first against explicit entries, then as
/// `<module_dir>/<id>.wasm`.
#[derive(Debug, Clone, Default)]
pub struct FsLoader {
    modules: HashMap<String, PathBuf>,
    module_dir: Option<PathBuf>,
}

impl FsLoader {
    /// Create a loader with no modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a loader from the `[loader]` and `[[modules]]` config sections.
    pub fn from_config(config: &ConfigFile) -> Self {
        let mut loader = Self::new();
        if let Some(dir) = &config.loader.module_dir {
            loader = loader.with_module_dir(dir);
        }
        for entry in &config.modules {
            loader = loader.with_module(&entry.id, &entry.path);
        }
        loader
    }

    /// Map an instance id to an explicit file.
    #[must_use]
    pub fn with_module(mut self, instance_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.modules.insert(instance_id.into(), path.into());
        self
    }

    /// Search `dir` for `<id>.wasm`.
    #[must_use]
    pub fn with_module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.module_dir = Some(dir.into());
        self
    }

    /// Resolve the file backing an instance id.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::LoadFailed`] for ids that could escape the
    /// module directory or that nothing is registered for.
    pub fn resolve(&self, instance_id: &str) -> Result<PathBuf, SandboxError> {
        if let Some(path) = self.modules.get(instance_id) {
            return Ok(path.clone());
        }

        validate_id(instance_id)?;

        self.module_dir
            .as_deref()
            .map(|dir| dir.join(format!("{instance_id}.wasm")))
            .ok_or_else(|| SandboxError::load_failed(instance_id, "no module registered"))
    }
}

#[async_trait]
impl ModuleLoader for FsLoader {
    async fn load(&self, instance_id: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.resolve(instance_id)?;
        debug!(instance_id, path = %path.display(), "Reading module");

        tokio::fs::read(&path)
            .await
            .map_err(|e| SandboxError::load_failed(instance_id, format!("{}: {e}", path.display())))
    }
}

/// Serves modules from memory.
///
/// Useful for embedding modules in the binary and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticLoader {
    modules: HashMap<String, Arc<[u8]>>,
}

impl StaticLoader {
    /// Create a loader with no modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register module bytes for an instance id.
    #[must_use]
    pub fn with_module(mut self, instance_id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.modules
            .insert(instance_id.into(), Arc::from(bytes.into()));
        self
    }
}

#[async_trait]
impl ModuleLoader for StaticLoader {
    async fn load(&self, instance_id: &str) -> Result<Vec<u8>, SandboxError> {
        self.modules
            .get(instance_id)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| SandboxError::load_failed(instance_id, "no module registered"))
    }
}

fn validate_id(instance_id: &str) -> Result<(), SandboxError> {
    let escapes = instance_id.is_empty()
        || instance_id.contains(['/', '\\'])
        || instance_id.contains("..")
        || Path::new(instance_id).is_absolute();

    if escapes {
        return Err(SandboxError::load_failed(
            instance_id,
            "instance id is not a valid module name",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_sandbox_common::config_file::{LoaderConfig, ModuleEntry};

    #[test]
    fn test_resolve_prefers_explicit_entry() {
        let loader = FsLoader::new()
            .with_module_dir("/srv/modules")
            .with_module("chat", "/opt/chat.wasm");

        assert_eq!(loader.resolve("chat").unwrap(), PathBuf::from("/opt/chat.wasm"));
        assert_eq!(
            loader.resolve("echo").unwrap(),
            PathBuf::from("/srv/modules/echo.wasm")
        );
    }

    #[test]
    fn test_resolve_rejects_path_escapes() {
        let loader = FsLoader::new().with_module_dir("/srv/modules");

        for id in ["", "../secret", "a/b", "a\\b", ".."] {
            assert!(
                matches!(loader.resolve(id), Err(SandboxError::LoadFailed { .. })),
                "{id:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_resolve_without_dir() {
        let loader = FsLoader::new();
        let err = loader.resolve("chat").unwrap_err();
        assert!(err.to_string().contains("no module registered"));
    }

    #[test]
    fn test_from_config() {
        let config = ConfigFile {
            loader: LoaderConfig {
                module_dir: Some("./modules".into()),
            },
            modules: vec![ModuleEntry {
                id: "chat".into(),
                path: "./chat.wasm".into(),
            }],
            ..Default::default()
        };

        let loader = FsLoader::from_config(&config);
        assert_eq!(loader.resolve("chat").unwrap(), PathBuf::from("./chat.wasm"));
        assert_eq!(
            loader.resolve("room").unwrap(),
            PathBuf::from("./modules/room.wasm")
        );
    }

    #[tokio::test]
    async fn test_fs_load() {
        let dir = std::env::temp_dir().join(format!("wasm-sandbox-loader-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("mod-a.wasm"), b"(module)").await.unwrap();

        let loader = FsLoader::new().with_module_dir(&dir);
        assert_eq!(loader.load("mod-a").await.unwrap(), b"(module)");

        let err = loader.load("mod-b").await.unwrap_err();
        assert!(matches!(err, SandboxError::LoadFailed { ref instance_id, .. } if instance_id == "mod-b"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_static_loader() {
        let loader: Arc<dyn ModuleLoader> =
            Arc::new(StaticLoader::new().with_module("mod-a", b"(module)".to_vec()));

        assert_eq!(loader.load("mod-a").await.unwrap(), b"(module)");
        assert!(loader.load("mod-b").await.is_err());
    }
}
