//! Scene served from disk: one description file plus a directory of
//! asset blobs named by tag.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use simpub_bus::SceneSource;

pub struct FileScene {
    description: String,
    asset_dir: PathBuf,
}

impl FileScene {
    pub fn load(scene_path: &Path, asset_dir: &Path) -> Result<Self> {
        let description = std::fs::read_to_string(scene_path)
            .with_context(|| format!("failed to read scene {}", scene_path.display()))?;
        Ok(Self::new(description, asset_dir))
    }

    pub fn new(description: String, asset_dir: &Path) -> Self {
        Self {
            description,
            asset_dir: asset_dir.to_path_buf(),
        }
    }

    fn asset_path(&self, tag: &str) -> Option<PathBuf> {
        // Tags are plain file names; anything that could leave the
        // directory is refused.
        let valid = !tag.is_empty()
            && tag != "."
            && tag != ".."
            && !tag.contains(|c: char| matches!(c, '/' | '\\' | '\0'));
        valid.then(|| self.asset_dir.join(tag))
    }
}

impl SceneSource for FileScene {
    fn scene_description(&self) -> String {
        self.description.clone()
    }

    fn asset(&self, tag: &str) -> Option<Bytes> {
        let path = self.asset_path(tag)?;
        match std::fs::read(&path) {
            Ok(bytes) => {
                tracing::debug!(tag, bytes = bytes.len(), "serving asset");
                Some(Bytes::from(bytes))
            }
            Err(e) => {
                tracing::debug!(tag, path = %path.display(), error = %e, "asset not readable");
                None
            }
        }
    }
}
