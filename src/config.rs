use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use serde::{Deserialize, Serialize};

use crate::AesKey;
use crate::mount::UnmountPolicy;
use crate::streamable::LoadMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory logical paths are resolved against by the physical layer.
    pub root_dir: PathBuf,
    /// Logical content directory paks are mounted on.
    pub content_dir: String,
    /// Root of the object namespace the content directory maps to.
    pub virtual_root: String,
    /// Download caches live under here.
    pub saved_dir: PathBuf,
    pub map_extension: String,
    pub asset_extension: String,
    pub mount_order: u32,
    /// Initial platform file chain, top-down, by declared layer name.
    pub platform_layers: Vec<String>,
    pub sandbox_dir: Option<PathBuf>,
    /// Hex or base64 AES-256 key for encrypted paks.
    pub aes_key: Option<String>,
    pub unmount_policy: UnmountPolicy,
    pub load_mode: LoadMode,
    /// References resolved per tick when loading asynchronously.
    pub async_batch_size: usize,
    pub engine_version: String,
    pub target_platforms: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            content_dir: "Content/".to_string(),
            virtual_root: "/Game/".to_string(),
            saved_dir: PathBuf::from("Saved"),
            map_extension: ".umap".to_string(),
            asset_extension: ".uasset".to_string(),
            mount_order: 5,
            platform_layers: vec!["PhysicalFile".to_string()],
            sandbox_dir: None,
            aes_key: None,
            unmount_policy: UnmountPolicy::default(),
            load_mode: LoadMode::default(),
            async_batch_size: 8,
            engine_version: "4.14.0".to_string(),
            target_platforms: vec![],
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        serde_json::from_slice(&data).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn aes_key(&self) -> Result<Option<AesKey>> {
        self.aes_key.as_deref().map(|key| key.parse::<AesKey>()).transpose()
    }
}
