// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Stack Filesystem Layout
//!
//! One directory per stack under the stacks root:
//!
//! ```text
//! <root>/
//!   .berth/stacks.json      metadata store (dot-dirs are never stacks)
//!   media/compose.yaml
//!   media/.env
//!   legacy.yml              flat layout, moved by `migrate_layout`
//! ```
//!
//! The directory name is the stack id. Compose files are looked up under
//! the usual compose file names in [`COMPOSE_FILENAMES`] order.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::domain::stack::{StackError, StackId};

pub const COMPOSE_FILENAMES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

pub const ENV_FILENAME: &str = ".env";

/// A stack in the flat single-file layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyStackFile {
    /// File stem, used as the display name.
    pub name: String,
    pub compose: PathBuf,
    /// Sibling `<name>.env`, when present.
    pub env: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StackFilesystem {
    root: PathBuf,
}

impl StackFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stack_dir(&self, id: &StackId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// The stack's existing compose file, or the default name for a new one.
    pub fn compose_path(&self, id: &StackId) -> PathBuf {
        let dir = self.stack_dir(id);
        COMPOSE_FILENAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
            .unwrap_or_else(|| dir.join(COMPOSE_FILENAMES[0]))
    }

    pub fn env_path(&self, id: &StackId) -> PathBuf {
        self.stack_dir(id).join(ENV_FILENAME)
    }

    pub fn exists(&self, id: &StackId) -> bool {
        self.stack_dir(id).is_dir()
    }

    pub async fn read_compose(&self, id: &StackId) -> Result<String, StackError> {
        let path = self.compose_path(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StackError::NotFound(format!(
                "no compose file for stack '{}' in {}",
                id,
                self.stack_dir(id).display()
            ))),
            Err(e) => Err(StackError::io(path, e)),
        }
    }

    /// Overlay text, empty when the stack has no `.env`.
    pub async fn read_env(&self, id: &StackId) -> Result<String, StackError> {
        let path = self.env_path(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(StackError::io(path, e)),
        }
    }

    /// Write the compose document and, when given, the overlay. An empty
    /// overlay removes the `.env` file.
    pub async fn write(&self, id: &StackId, compose: &str, env: Option<&str>) -> Result<(), StackError> {
        let dir = self.stack_dir(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StackError::io(&dir, e))?;

        let compose_path = self.compose_path(id);
        tokio::fs::write(&compose_path, compose)
            .await
            .map_err(|e| StackError::io(&compose_path, e))?;

        if let Some(env) = env {
            let env_path = self.env_path(id);
            if env.is_empty() {
                match tokio::fs::remove_file(&env_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StackError::io(&env_path, e)),
                }
            } else {
                tokio::fs::write(&env_path, env)
                    .await
                    .map_err(|e| StackError::io(&env_path, e))?;
            }
        }
        debug!("Wrote stack files for {} to {:?}", id, dir);
        Ok(())
    }

    /// Stack directories that hold a compose file, sorted. Dot-directories and
    /// names that are not valid ids are skipped.
    pub async fn list_stack_dirs(&self) -> Result<Vec<StackId>, StackError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StackError::io(&self.root, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StackError::io(&self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            let Ok(id) = StackId::new(name.as_str()) else {
                warn!("Ignoring directory '{}' in stacks root: not a valid stack id", name);
                continue;
            };
            if COMPOSE_FILENAMES.iter().any(|f| entry.path().join(f).is_file()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Move a stack directory. Fails with `Conflict` when the target exists.
    pub async fn rename(&self, from: &StackId, to: &StackId) -> Result<(), StackError> {
        let source = self.stack_dir(from);
        let target = self.stack_dir(to);
        if target.exists() {
            return Err(StackError::Conflict(format!(
                "target directory {} already exists",
                target.display()
            )));
        }
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| StackError::io(&source, e))
    }

    pub async fn remove(&self, id: &StackId) -> Result<(), StackError> {
        let dir = self.stack_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StackError::io(&dir, e)),
        }
    }

    /// Top-level `*.yml` / `*.yaml` files in the flat layout.
    pub async fn legacy_files(&self) -> Result<Vec<LegacyStackFile>, StackError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StackError::io(&self.root, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StackError::io(&self.root, e))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            );
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_yaml || stem.starts_with('.') {
                continue;
            }
            let env = self.root.join(format!("{}.env", stem));
            files.push(LegacyStackFile {
                name: stem.to_string(),
                env: env.is_file().then_some(env),
                compose: path.clone(),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(s: &str) -> StackId {
        StackId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_roundtrip_and_listing() {
        let dir = TempDir::new().unwrap();
        let fs = StackFilesystem::new(dir.path());

        fs.write(&id("media"), "services: {}\n", Some("TZ=UTC\n")).await.unwrap();
        fs.write(&id("web"), "services: {}\n", None).await.unwrap();
        std::fs::create_dir_all(dir.path().join(".berth")).unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        assert_eq!(fs.read_compose(&id("media")).await.unwrap(), "services: {}\n");
        assert_eq!(fs.read_env(&id("media")).await.unwrap(), "TZ=UTC\n");
        assert_eq!(fs.read_env(&id("web")).await.unwrap(), "");
        assert_eq!(fs.list_stack_dirs().await.unwrap(), vec![id("media"), id("web")]);

        fs.write(&id("media"), "services: {}\n", Some("")).await.unwrap();
        assert!(!fs.env_path(&id("media")).exists());
    }

    #[tokio::test]
    async fn test_existing_compose_filename_is_reused() {
        let dir = TempDir::new().unwrap();
        let fs = StackFilesystem::new(dir.path());
        std::fs::create_dir_all(dir.path().join("old")).unwrap();
        std::fs::write(dir.path().join("old/docker-compose.yml"), "services: {}\n").unwrap();

        assert!(fs.compose_path(&id("old")).ends_with("docker-compose.yml"));
        fs.write(&id("old"), "services: {a: {image: x}}\n", None).await.unwrap();
        assert!(!dir.path().join("old/compose.yaml").exists());
    }

    #[test]
    fn test_rename_conflict_and_missing_compose() {
        let dir = TempDir::new().unwrap();
        let fs = StackFilesystem::new(dir.path());
        tokio_test::block_on(fs.write(&id("a"), "services: {}\n", None)).unwrap();
        tokio_test::block_on(fs.write(&id("b"), "services: {}\n", None)).unwrap();

        let conflict = tokio_test::block_on(fs.rename(&id("a"), &id("b")));
        assert!(matches!(conflict, Err(StackError::Conflict(_))));
        tokio_test::block_on(fs.rename(&id("a"), &id("c"))).unwrap();
        assert!(fs.exists(&id("c")));
        let missing = tokio_test::block_on(fs.read_compose(&id("a")));
        assert!(matches!(missing, Err(StackError::NotFound(_))));
    }

    #[test]
    fn test_legacy_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Plex Server.yml"), "services: {}\n").unwrap();
        std::fs::write(dir.path().join("Plex Server.env"), "A=1\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let fs = StackFilesystem::new(dir.path());

        let legacy = tokio_test::block_on(fs.legacy_files()).unwrap();
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[0].name, "Plex Server");
        assert!(legacy[0].env.is_some());
    }
}
