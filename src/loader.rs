use std::path::{Path, PathBuf};
use std::sync::mpsc;

use tracing::{info, warn};

use crate::level_streaming::LevelLoader;
use crate::mount::{MountRecord, PakMountService};
use crate::objects::{ObjectHandle, ObjectRegistry, PackageFileLoader, PackageLoader};
use crate::package_name::{is_short_package_name, short_name};
use crate::platform_file::PlatformFileChain;
use crate::streamable::{LoadCallback, LoadMode, LoadedAssets, RequestId, StreamableManager};
use crate::{AssetPathTranslator, AssetReference, Config, Result, UEPath};

/// Mounts paks, enumerates what they serve and loads their assets.
pub struct PakLoader {
    mounts: PakMountService,
    objects: ObjectRegistry,
    streamable: StreamableManager,
    load_mode: LoadMode,
    map_extension: String,
    asset_extension: String,
}
impl PakLoader {
    pub fn new(mounts: PakMountService, objects: ObjectRegistry, config: &Config) -> Self {
        Self {
            mounts,
            objects,
            streamable: StreamableManager::new(config.async_batch_size),
            load_mode: config.load_mode,
            map_extension: config.map_extension.clone(),
            asset_extension: config.asset_extension.clone(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mounts = PakMountService::from_config(config)?;
        let translator = AssetPathTranslator::new(mounts.content_dir(), mounts.virtual_root());
        let packages = PackageFileLoader::new(translator, vec![config.asset_extension.clone(), config.map_extension.clone()]);
        Ok(Self::new(mounts, ObjectRegistry::new(Box::new(packages)), config))
    }

    /// Replaces the object registry with one fed by `packages`.
    pub fn with_package_loader(mut self, packages: Box<dyn PackageLoader>) -> Self {
        self.objects = ObjectRegistry::new(packages);
        self
    }
    pub fn with_load_mode(mut self, load_mode: LoadMode) -> Self {
        self.load_mode = load_mode;
        self
    }

    pub fn mounts(&self) -> &PakMountService {
        &self.mounts
    }
    pub fn mounts_mut(&mut self) -> &mut PakMountService {
        &mut self.mounts
    }
    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }
    pub fn objects_mut(&mut self) -> &mut ObjectRegistry {
        &mut self.objects
    }
    pub fn chain(&self) -> &PlatformFileChain {
        self.mounts.chain()
    }
    pub fn load_mode(&self) -> LoadMode {
        self.load_mode
    }

    pub fn mount_pak(&mut self, pak_path: &Path) -> Result<&MountRecord> {
        self.mounts.mount(pak_path)
    }

    pub fn unmount_pak(&mut self, pak_path: &Path) -> Result<()> {
        self.mounts.unmount(pak_path, &mut self.objects)
    }

    /// Unmounts every mounted pak, carrying on past failures. Returns how many
    /// were unmounted.
    pub fn unmount_all(&mut self) -> usize {
        let paths: Vec<PathBuf> = self.mounts.mounted_paths().map(Path::to_path_buf).collect();
        let unmounted = paths.iter().filter(|path| self.unmount_pak(path).is_ok()).count();
        self.objects.collect_garbage();
        unmounted
    }

    /// Mounts `pak_path` if needed and returns the maps it serves.
    pub fn levels_from_pak(&mut self, pak_path: &Path) -> Result<Vec<AssetReference>> {
        let extension = self.map_extension.clone();
        let levels = self.asset_references_from_pak(pak_path, &extension)?;
        for level in &levels {
            info!(target: "pakloader", "Got level: {level}");
        }
        Ok(levels)
    }

    /// Mounts `pak_path` if needed and returns the references of every file
    /// ending with `extension`.
    pub fn asset_references_from_pak(&mut self, pak_path: &Path, extension: &str) -> Result<Vec<AssetReference>> {
        self.mounts.mount(pak_path)?;
        self.mounts.asset_references(pak_path, extension)
    }

    /// Mounts `pak_path` if needed and loads every asset it serves. In sync
    /// mode `callback` has run by the time this returns; in async mode it runs
    /// from a later `tick`.
    pub fn load_assets_from(&mut self, pak_path: &Path, callback: LoadCallback) -> Result<RequestId> {
        let extension = self.asset_extension.clone();
        let references = self.asset_references_from_pak(pak_path, &extension)?;
        let id = self.streamable.request(references, callback);
        if self.load_mode == LoadMode::Sync {
            self.streamable.flush(id, &mut self.objects, self.mounts.chain());
        }
        Ok(id)
    }

    /// Loads every asset of `pak_path` now, whatever the load mode.
    pub fn load_assets_blocking(&mut self, pak_path: &Path) -> Result<LoadedAssets> {
        let (tx, rx) = mpsc::channel();
        let id = self.load_assets_from(
            pak_path,
            Box::new(move |assets| {
                tx.send(assets).ok();
            }),
        )?;
        self.streamable.flush(id, &mut self.objects, self.mounts.chain());
        Ok(rx.try_recv().unwrap_or_default())
    }

    pub fn has_pending_loads(&self) -> bool {
        self.streamable.pending_requests() > 0
    }

    /// Advances asynchronous loads. Returns the number of requests completed.
    pub fn tick(&mut self) -> usize {
        self.streamable.tick(&mut self.objects, self.mounts.chain())
    }

    pub fn convert_to_sandbox_path(&self, path: &UEPath) -> PathBuf {
        self.mounts.convert_to_sandbox_path(path)
    }

    fn translator(&self) -> AssetPathTranslator {
        AssetPathTranslator::new(self.mounts.content_dir(), self.mounts.virtual_root())
    }
}

impl LevelLoader for PakLoader {
    /// Long names are checked through the platform file chain; short names
    /// are looked up among the maps of every mounted pak.
    fn search_for_package(&self, name: &str) -> Option<String> {
        if !is_short_package_name(name) {
            let path = self.translator().to_content_path(name, &self.map_extension)?;
            return self.chain().file_exists(&path).then(|| name.to_string());
        }
        self.mounts
            .mounted_paths()
            .filter_map(|pak| self.mounts.asset_references(pak, &self.map_extension).ok())
            .flatten()
            .find(|map| short_name(map.package_name()) == name)
            .map(|map| map.package_name().to_string())
    }

    fn load_level(&mut self, package: &str) -> Option<Vec<ObjectHandle>> {
        match self.objects.load_package(self.mounts.chain(), package) {
            Ok(objects) => objects.map(<[ObjectHandle]>::to_vec),
            Err(err) => {
                warn!(target: "pakloader", "Couldn't load level {package}: {err}");
                None
            }
        }
    }
}
