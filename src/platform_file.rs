//! The platform file chain: an ordered stack of file layers where each layer
//! may serve, remap or pass a request through to the layers below it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs_err as fs;
use strum::{AsRefStr, EnumString, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::archive::PakArchive;
use crate::{Config, PakError, Result, UEPath, UEPathBuf, make_standard_directory, make_standard_filename, strip_prefix_ignore_case};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, IntoStaticStr)]
pub enum LayerRole {
    #[strum(serialize = "PhysicalFile")]
    Physical,
    #[strum(serialize = "CachedReadFile")]
    CachedRead,
    #[strum(serialize = "SandboxFile")]
    Sandbox,
    #[strum(serialize = "PakFile")]
    Pak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Above,
    Below,
}

/// Where a new pak layer is spliced relative to the current top layer, keyed
/// by the top layer's role. Cached reads must still see pak content, so the
/// pak layer goes underneath a cache.
const PAK_PLACEMENT: &[(LayerRole, Placement)] = &[(LayerRole::CachedRead, Placement::Below)];

fn pak_placement(top: LayerRole) -> Placement {
    PAK_PLACEMENT.iter().find(|(role, _)| *role == top).map(|(_, placement)| *placement).unwrap_or(Placement::Above)
}

/// Stable handle to a layer; survives later splices above or below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(u32);

pub trait PlatformFile: Send {
    fn role(&self) -> LayerRole;
    fn name(&self) -> &'static str {
        self.role().into()
    }
    fn file_exists(&self, path: &UEPath, lower: Lower<'_>) -> bool;
    fn read(&self, path: &UEPath, lower: Lower<'_>) -> Result<Vec<u8>>;
    fn filename_on_disk(&self, path: &UEPath, lower: Lower<'_>) -> PathBuf {
        lower.filename_on_disk(path)
    }
    /// Drop anything cached from layers below.
    fn flush(&self) {}
    fn as_pak(&self) -> Option<&PakPlatformFile> {
        None
    }
    fn as_pak_mut(&mut self) -> Option<&mut PakPlatformFile> {
        None
    }
}

struct Link {
    id: LayerId,
    layer: Box<dyn PlatformFile>,
}

/// The part of the chain below the layer currently handling a request.
#[derive(Clone, Copy)]
pub struct Lower<'a> {
    links: &'a [Link],
}
impl Lower<'_> {
    pub fn file_exists(self, path: &UEPath) -> bool {
        match self.links.split_first() {
            Some((link, rest)) => link.layer.file_exists(path, Lower { links: rest }),
            None => false,
        }
    }
    pub fn read(self, path: &UEPath) -> Result<Vec<u8>> {
        match self.links.split_first() {
            Some((link, rest)) => link.layer.read(path, Lower { links: rest }),
            None => Err(PakError::NotFound(path.to_string())),
        }
    }
    pub fn filename_on_disk(self, path: &UEPath) -> PathBuf {
        match self.links.split_first() {
            Some((link, rest)) => link.layer.filename_on_disk(path, Lower { links: rest }),
            None => PathBuf::from(path.as_str()),
        }
    }
}

/// Result of locating or creating the pak layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PakLayerSplice {
    pub id: LayerId,
    pub created: bool,
    /// A sandbox layer is present, so paths handed out must be resolved to
    /// their on-disk location.
    pub sandboxed: bool,
}

/// Layers ordered top (index 0) to bottom.
#[derive(Default)]
pub struct PlatformFileChain {
    links: Vec<Link>,
    next_id: u32,
}
impl PlatformFileChain {
    pub fn new(bottom: Box<dyn PlatformFile>) -> Self {
        let mut chain = Self::default();
        chain.push_top(bottom);
        chain
    }

    /// Builds the initial chain from `config.platform_layers`, listed top-down
    /// by declared layer name.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut chain = Self::default();
        for name in config.platform_layers.iter().rev() {
            let role: LayerRole = name.parse().map_err(|_| PakError::Configuration(format!("unknown platform file layer {name:?}")))?;
            let layer: Box<dyn PlatformFile> = match role {
                LayerRole::Physical => Box::new(PhysicalPlatformFile::new(&config.root_dir)),
                LayerRole::CachedRead => Box::new(CachedReadPlatformFile::default()),
                LayerRole::Sandbox => {
                    let dir = config.sandbox_dir.as_ref().ok_or_else(|| PakError::Configuration("SandboxFile layer requires sandbox_dir".to_string()))?;
                    Box::new(SandboxPlatformFile::new(dir))
                }
                LayerRole::Pak => Box::new(PakPlatformFile::default()),
            };
            chain.push_top(layer);
        }
        Ok(chain)
    }

    fn insert(&mut self, index: usize, layer: Box<dyn PlatformFile>) -> LayerId {
        let id = LayerId(self.next_id);
        self.next_id += 1;
        self.links.insert(index, Link { id, layer });
        id
    }

    /// Installs `layer` as the new top of the chain.
    pub fn push_top(&mut self, layer: Box<dyn PlatformFile>) -> LayerId {
        self.insert(0, layer)
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
    pub fn top(&self) -> Option<&dyn PlatformFile> {
        self.links.first().map(|link| link.layer.as_ref())
    }
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.links.iter().map(|link| link.layer.name()).collect()
    }
    pub fn find(&self, role: LayerRole) -> Option<LayerId> {
        self.links.iter().find(|link| link.layer.role() == role).map(|link| link.id)
    }
    pub fn layer(&self, id: LayerId) -> Option<&dyn PlatformFile> {
        self.links.iter().find(|link| link.id == id).map(|link| link.layer.as_ref())
    }
    pub fn pak_layer(&self, id: LayerId) -> Option<&PakPlatformFile> {
        self.layer(id).and_then(|layer| layer.as_pak())
    }
    pub fn pak_layer_mut(&mut self, id: LayerId) -> Option<&mut PakPlatformFile> {
        self.links.iter_mut().find(|link| link.id == id).and_then(|link| link.layer.as_pak_mut())
    }

    /// Finds the pak layer, splicing a new one in if the chain has none.
    pub fn ensure_pak_layer(&mut self) -> Result<PakLayerSplice> {
        let Some(top) = self.top() else {
            return Err(PakError::Configuration("no lower level platform file to mount paks above".to_string()));
        };
        let top_role = top.role();
        let top_name = top.name();

        let (id, created) = match self.find(LayerRole::Pak) {
            Some(id) => {
                info!(target: "pakloader", "Found existing {} layer", LayerRole::Pak.as_ref());
                (id, false)
            }
            None => {
                let layer = Box::new(PakPlatformFile::default());
                let id = match pak_placement(top_role) {
                    Placement::Above => {
                        info!(target: "pakloader", "Created new {} layer above {top_name}", LayerRole::Pak.as_ref());
                        self.insert(0, layer)
                    }
                    Placement::Below => {
                        info!(target: "pakloader", "Created new {} layer below {top_name}", LayerRole::Pak.as_ref());
                        self.insert(1, layer)
                    }
                };
                (id, true)
            }
        };

        let mut sandboxed = false;
        for link in &self.links {
            debug!(target: "pakloader", "{}", link.layer.name());
            sandboxed |= link.layer.role() == LayerRole::Sandbox;
        }

        Ok(PakLayerSplice { id, created, sandboxed })
    }

    fn lower(&self) -> Lower<'_> {
        Lower { links: &self.links }
    }
    pub fn file_exists(&self, path: &UEPath) -> bool {
        self.lower().file_exists(path)
    }
    pub fn read(&self, path: &UEPath) -> Result<Vec<u8>> {
        self.lower().read(path)
    }
    pub fn filename_on_disk(&self, path: &UEPath) -> PathBuf {
        self.lower().filename_on_disk(path)
    }
    pub fn flush(&self) {
        for link in &self.links {
            link.layer.flush();
        }
    }
}

/// Bottom of the chain: logical paths resolved against a root directory.
pub struct PhysicalPlatformFile {
    root: PathBuf,
}
impl PhysicalPlatformFile {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
    fn disk_path(&self, path: &UEPath) -> PathBuf {
        self.root.join(path.as_str())
    }
}
impl PlatformFile for PhysicalPlatformFile {
    fn role(&self) -> LayerRole {
        LayerRole::Physical
    }
    fn file_exists(&self, path: &UEPath, _lower: Lower<'_>) -> bool {
        self.disk_path(path).is_file()
    }
    fn read(&self, path: &UEPath, _lower: Lower<'_>) -> Result<Vec<u8>> {
        match fs::read(self.disk_path(path)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(PakError::NotFound(path.to_string())),
            Err(err) => Err(err.into()),
        }
    }
    fn filename_on_disk(&self, path: &UEPath, _lower: Lower<'_>) -> PathBuf {
        self.disk_path(path)
    }
}

/// Memoises reads from the layers below it.
#[derive(Default)]
pub struct CachedReadPlatformFile {
    cache: Mutex<HashMap<String, Vec<u8>>>,
}
impl PlatformFile for CachedReadPlatformFile {
    fn role(&self) -> LayerRole {
        LayerRole::CachedRead
    }
    fn file_exists(&self, path: &UEPath, lower: Lower<'_>) -> bool {
        self.cache.lock().unwrap().contains_key(path.as_str()) || lower.file_exists(path)
    }
    fn read(&self, path: &UEPath, lower: Lower<'_>) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.lock().unwrap().get(path.as_str()) {
            return Ok(data.clone());
        }
        let data = lower.read(path)?;
        self.cache.lock().unwrap().insert(path.to_string(), data.clone());
        Ok(data)
    }
    fn flush(&self) {
        self.cache.lock().unwrap().clear();
    }
}

/// Files present under the sandbox directory shadow the layers below.
pub struct SandboxPlatformFile {
    dir: PathBuf,
}
impl SandboxPlatformFile {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }
    fn sandbox_path(&self, path: &UEPath) -> PathBuf {
        self.dir.join(make_standard_filename(path.as_str()).trim_start_matches('/'))
    }
}
impl PlatformFile for SandboxPlatformFile {
    fn role(&self) -> LayerRole {
        LayerRole::Sandbox
    }
    fn file_exists(&self, path: &UEPath, lower: Lower<'_>) -> bool {
        self.sandbox_path(path).is_file() || lower.file_exists(path)
    }
    fn read(&self, path: &UEPath, lower: Lower<'_>) -> Result<Vec<u8>> {
        let sandboxed = self.sandbox_path(path);
        if sandboxed.is_file() {
            return Ok(fs::read(sandboxed)?);
        }
        lower.read(path)
    }
    fn filename_on_disk(&self, path: &UEPath, lower: Lower<'_>) -> PathBuf {
        let sandboxed = self.sandbox_path(path);
        if sandboxed.is_file() { sandboxed } else { lower.filename_on_disk(path) }
    }
}

struct MountedPak {
    pak_path: PathBuf,
    order: u32,
    mount_point: String,
    archive: Box<dyn PakArchive>,
    /// lowercased entry name -> entry name as stored in the archive
    entries: HashMap<String, String>,
}
impl MountedPak {
    fn entry(&self, path: &str) -> Option<&str> {
        let relative = strip_prefix_ignore_case(path, &self.mount_point)?;
        self.entries.get(&relative.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Serves files out of every mounted archive, highest mount order first.
#[derive(Default)]
pub struct PakPlatformFile {
    paks: Vec<MountedPak>,
}
impl PakPlatformFile {
    /// Mounts `archive` so its entries appear under `mount_point`, ignoring the
    /// mount point recorded in the archive itself.
    pub fn mount(&mut self, pak_path: &Path, archive: Box<dyn PakArchive>, order: u32, mount_point: &str) -> bool {
        if self.is_mounted(pak_path) {
            warn!(target: "pakloader", "Pak already mounted in layer: {}", pak_path.display());
            return false;
        }
        let entries = archive.files().into_iter().map(|entry| (make_standard_filename(&entry).to_ascii_lowercase(), entry)).collect();
        let mounted = MountedPak {
            pak_path: pak_path.to_path_buf(),
            order,
            mount_point: make_standard_directory(mount_point),
            archive,
            entries,
        };
        let index = self.paks.iter().position(|pak| pak.order < order).unwrap_or(self.paks.len());
        self.paks.insert(index, mounted);
        true
    }
    pub fn unmount(&mut self, pak_path: &Path) -> bool {
        match self.paks.iter().position(|pak| pak.pak_path == pak_path) {
            Some(index) => {
                self.paks.remove(index);
                true
            }
            None => false,
        }
    }
    pub fn is_mounted(&self, pak_path: &Path) -> bool {
        self.paks.iter().any(|pak| pak.pak_path == pak_path)
    }
    pub fn mounted_paks(&self) -> impl Iterator<Item = &Path> {
        self.paks.iter().map(|pak| pak.pak_path.as_path())
    }

    /// Every file `pak_path` serves under `directory`, recursively, as full
    /// logical paths.
    pub fn find_files_at_path(&self, pak_path: &Path, directory: &str) -> Vec<UEPathBuf> {
        let Some(pak) = self.paks.iter().find(|pak| pak.pak_path == pak_path) else {
            return vec![];
        };
        let directory = make_standard_directory(directory);
        let mut files: Vec<UEPathBuf> = pak
            .entries
            .values()
            .map(|entry| format!("{}{}", pak.mount_point, make_standard_filename(entry)))
            .filter(|path| strip_prefix_ignore_case(path, &directory).is_some())
            .map(UEPathBuf::from)
            .collect();
        files.sort();
        files
    }

    fn find(&self, path: &UEPath) -> Option<(&MountedPak, &str)> {
        let path = make_standard_filename(path.as_str());
        self.paks.iter().find_map(|pak| pak.entry(&path).map(|entry| (pak, entry)))
    }
}
impl PlatformFile for PakPlatformFile {
    fn role(&self) -> LayerRole {
        LayerRole::Pak
    }
    fn file_exists(&self, path: &UEPath, lower: Lower<'_>) -> bool {
        self.find(path).is_some() || lower.file_exists(path)
    }
    fn read(&self, path: &UEPath, lower: Lower<'_>) -> Result<Vec<u8>> {
        match self.find(path) {
            Some((pak, entry)) => pak.archive.read(entry),
            None => lower.read(path),
        }
    }
    fn as_pak(&self) -> Option<&PakPlatformFile> {
        Some(self)
    }
    fn as_pak_mut(&mut self) -> Option<&mut PakPlatformFile> {
        Some(self)
    }
}
