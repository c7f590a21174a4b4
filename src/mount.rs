//! Mount table for paks served through the platform file chain.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{DefaultOpener, PakOpener};
use crate::objects::ObjectRegistry;
use crate::platform_file::{LayerId, PlatformFileChain};
use crate::{AssetPathTranslator, AssetReference, Config, PakError, Result, UEPath, UEPathBuf, make_standard_directory, to_ue_path};

/// What happens to objects a pak contributed when the pak is unmounted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnmountPolicy {
    /// Rename every resident package out of the way.
    RenameResident,
    /// Drop unreferenced packages, rename the rest.
    #[default]
    Evict,
    /// Fail while anything outside the registry holds an object of the pak.
    RefuseWhileReferenced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pak_path: PathBuf,
    layer: LayerId,
    mount_point: UEPathBuf,
    translator: AssetPathTranslator,
}
impl MountRecord {
    pub fn pak_path(&self) -> &Path {
        &self.pak_path
    }
    pub fn layer(&self) -> LayerId {
        self.layer
    }
    pub fn mount_point(&self) -> &UEPath {
        &self.mount_point
    }
    pub fn translator(&self) -> &AssetPathTranslator {
        &self.translator
    }
}

/// Owns the platform file chain and every pak mounted into it.
pub struct PakMountService {
    chain: PlatformFileChain,
    opener: Box<dyn PakOpener>,
    content_dir: String,
    virtual_root: String,
    mount_order: u32,
    unmount_policy: UnmountPolicy,
    pak_layer: Option<LayerId>,
    sandboxed: bool,
    mounts: IndexMap<PathBuf, MountRecord>,
    unload_generation: u32,
}
impl PakMountService {
    pub fn new(chain: PlatformFileChain, opener: Box<dyn PakOpener>, content_dir: &str, virtual_root: &str) -> Self {
        Self {
            chain,
            opener,
            content_dir: make_standard_directory(content_dir),
            virtual_root: virtual_root.to_string(),
            mount_order: 5,
            unmount_policy: UnmountPolicy::default(),
            pak_layer: None,
            sandboxed: false,
            mounts: IndexMap::new(),
            unload_generation: 0,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let chain = PlatformFileChain::from_config(config)?;
        let key = config.aes_key().map_err(|err| PakError::Configuration(format!("{err:#}")))?;
        Ok(Self::new(chain, Box::new(DefaultOpener::new(key)), &config.content_dir, &config.virtual_root)
            .with_mount_order(config.mount_order)
            .with_unmount_policy(config.unmount_policy))
    }

    pub fn with_mount_order(mut self, mount_order: u32) -> Self {
        self.mount_order = mount_order;
        self
    }
    pub fn with_unmount_policy(mut self, unmount_policy: UnmountPolicy) -> Self {
        self.unmount_policy = unmount_policy;
        self
    }

    pub fn chain(&self) -> &PlatformFileChain {
        &self.chain
    }
    pub fn chain_mut(&mut self) -> &mut PlatformFileChain {
        &mut self.chain
    }
    pub fn content_dir(&self) -> &str {
        &self.content_dir
    }
    pub fn virtual_root(&self) -> &str {
        &self.virtual_root
    }
    pub fn unmount_policy(&self) -> UnmountPolicy {
        self.unmount_policy
    }
    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }
    pub fn is_mounted(&self, pak_path: &Path) -> bool {
        self.mounts.contains_key(pak_path)
    }
    pub fn record(&self, pak_path: &Path) -> Option<&MountRecord> {
        self.mounts.get(pak_path)
    }
    /// In mount order.
    pub fn mounted_paths(&self) -> impl Iterator<Item = &Path> {
        self.mounts.keys().map(PathBuf::as_path)
    }
    pub fn unload_generation(&self) -> u32 {
        self.unload_generation
    }

    /// Mounts `pak_path` at the current content directory. Mounting a path
    /// that is already mounted returns its existing record.
    pub fn mount(&mut self, pak_path: &Path) -> Result<&MountRecord> {
        if self.mounts.contains_key(pak_path) {
            debug!(target: "pakloader", "Already mounted: {}", pak_path.display());
            return Ok(&self.mounts[pak_path]);
        }

        let splice = self.chain.ensure_pak_layer()?;
        self.pak_layer = Some(splice.id);
        self.sandboxed |= splice.sandboxed;

        let on_disk = self.chain.filename_on_disk(&to_ue_path(pak_path));
        if !on_disk.exists() {
            error!(target: "pakloader", "Pak file doesn't exist: {}", pak_path.display());
            return Err(PakError::NotFound(pak_path.display().to_string()));
        }
        let archive = self.opener.open(&on_disk).inspect_err(|err| {
            error!(target: "pakloader", "Couldn't open pak {}: {err}", pak_path.display());
        })?;

        let mount_point = self.content_dir.clone();
        info!(target: "pakloader", "Content dir: {mount_point}, archive mount point: {}", archive.mount_point());
        let layer = self
            .chain
            .pak_layer_mut(splice.id)
            .ok_or_else(|| PakError::Configuration("pak layer missing from the platform file chain".to_string()))?;
        if !layer.mount(pak_path, archive, self.mount_order, &mount_point) {
            return Err(PakError::Configuration(format!("pak layer refused to mount {}", pak_path.display())));
        }
        self.chain.flush();

        info!(target: "pakloader", "Mounted pak file: {} at {mount_point}", pak_path.display());
        let record = MountRecord {
            pak_path: pak_path.to_path_buf(),
            layer: splice.id,
            translator: AssetPathTranslator::new(&mount_point, &self.virtual_root),
            mount_point: UEPathBuf::from(mount_point),
        };
        Ok(self.mounts.entry(pak_path.to_path_buf()).or_insert(record))
    }

    /// Unmounts `pak_path`, dealing with objects it contributed according to
    /// the unmount policy. The unload generation advances once per call that
    /// gets past the policy check.
    pub fn unmount(&mut self, pak_path: &Path, objects: &mut ObjectRegistry) -> Result<()> {
        let Some(record) = self.mounts.get(pak_path) else {
            error!(target: "pakloader", "Pak file isn't mounted: {}", pak_path.display());
            return Err(PakError::NotMounted(pak_path.to_path_buf()));
        };
        let layer = record.layer;

        let packages: Vec<String> = self.asset_references(pak_path, "")?.iter().map(|r| r.package_name().to_string()).unique().collect();

        if self.unmount_policy == UnmountPolicy::RefuseWhileReferenced {
            let count: usize = packages.iter().map(|package| objects.live_handles(package)).sum();
            if count > 0 {
                warn!(target: "pakloader", "Not unmounting {}: {count} live handles", pak_path.display());
                return Err(PakError::InUse {
                    path: pak_path.to_path_buf(),
                    count,
                });
            }
        }

        if !self.chain.pak_layer(layer).is_some_and(|pak| pak.is_mounted(pak_path)) {
            error!(target: "pakloader", "Couldn't unmount pak file: {}", pak_path.display());
            return Err(PakError::UnmountFailed(pak_path.to_path_buf()));
        }

        let generation = self.unload_generation;
        self.unload_generation += 1;

        for package in packages.iter().filter(|package| objects.contains_package(package)) {
            let evict = match self.unmount_policy {
                UnmountPolicy::RenameResident => false,
                UnmountPolicy::Evict | UnmountPolicy::RefuseWhileReferenced => objects.live_handles(package) == 0,
            };
            if evict {
                debug!(target: "pakloader", "Evicting {package}");
                objects.evict_package(package);
            } else {
                let renamed = format!("{package}-Unloaded___{generation}");
                info!(target: "pakloader", "Asset still in memory: {package}, renaming it to {renamed}");
                objects.rename_package(package, &renamed);
            }
        }

        let unmounted = self.chain.pak_layer_mut(layer).is_some_and(|pak| pak.unmount(pak_path));
        if !unmounted {
            error!(target: "pakloader", "Couldn't unmount pak file: {}", pak_path.display());
            return Err(PakError::UnmountFailed(pak_path.to_path_buf()));
        }
        self.mounts.shift_remove(pak_path);
        self.chain.flush();
        info!(target: "pakloader", "Unmounted: {}", pak_path.display());
        Ok(())
    }

    /// Logical references for every file `pak_path` serves that ends with
    /// `extension` (all files when empty), sorted.
    #[instrument(skip_all)]
    pub fn asset_references(&self, pak_path: &Path, extension: &str) -> Result<Vec<AssetReference>> {
        let record = self.mounts.get(pak_path).ok_or_else(|| PakError::NotMounted(pak_path.to_path_buf()))?;
        let layer = self
            .chain
            .pak_layer(record.layer)
            .ok_or_else(|| PakError::Configuration("pak layer missing from the platform file chain".to_string()))?;
        let references = layer
            .find_files_at_path(pak_path, record.mount_point.as_str())
            .iter()
            .filter_map(|path| {
                let reference = record.translator.translate(path.as_str(), extension)?;
                debug!(target: "pakloader", "Asset {path} => {reference}");
                Some(reference)
            })
            .sorted()
            .dedup()
            .collect();
        Ok(references)
    }

    /// On-disk location of a logical path when a sandbox layer does its own
    /// remapping, the path unchanged otherwise.
    pub fn convert_to_sandbox_path(&self, path: &UEPath) -> PathBuf {
        if self.sandboxed {
            self.chain.filename_on_disk(path)
        } else {
            PathBuf::from(path.as_str())
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use fs_err as fs;

    use super::*;
    use crate::objects::PackageFileLoader;
    use pretty_assertions::assert_eq;

    /// `content/maps/Arena.map` and `content/bp/Turret.asset` as a loose pak.
    pub(crate) fn arena_pak(root: &Path) -> anyhow::Result<PathBuf> {
        let pak = root.join("arena_pak");
        fs::create_dir_all(pak.join("maps"))?;
        fs::create_dir_all(pak.join("bp"))?;
        fs::write(pak.join("maps/Arena.map"), b"arena")?;
        fs::write(pak.join("bp/Turret.asset"), b"turret")?;
        Ok(pak)
    }

    pub(crate) fn config(root: &Path) -> Config {
        Config {
            root_dir: root.to_path_buf(),
            content_dir: "content/".to_string(),
            map_extension: ".map".to_string(),
            asset_extension: ".asset".to_string(),
            ..Default::default()
        }
    }

    fn registry() -> ObjectRegistry {
        let translator = AssetPathTranslator::new("content/", "/Game/");
        ObjectRegistry::new(Box::new(PackageFileLoader::new(translator, vec![".asset".to_string(), ".map".to_string()])))
    }

    #[test]
    fn test_mount_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pak = arena_pak(dir.path())?;
        let mut service = PakMountService::from_config(&config(dir.path()))?;

        let first = service.mount(&pak)?.clone();
        let second = service.mount(&pak)?.clone();
        assert_eq!(first, second);
        assert_eq!(first.mount_point().as_str(), "content/");
        assert_eq!(service.chain().layer_names(), vec!["PakFile", "PhysicalFile"]);
        assert_eq!(service.mounted_paths().count(), 1);
        Ok(())
    }

    #[test]
    fn test_mount_missing_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut service = PakMountService::from_config(&config(dir.path()))?;
        assert!(matches!(service.mount(&dir.path().join("missing.pak")), Err(PakError::NotFound(_))));
        assert!(!service.is_mounted(&dir.path().join("missing.pak")));
        Ok(())
    }

    #[test]
    fn test_enumerate() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pak = arena_pak(dir.path())?;
        let mut service = PakMountService::from_config(&config(dir.path()))?;
        service.mount(&pak)?;

        assert_eq!(service.asset_references(&pak, ".map")?, vec![AssetReference::new("/Game/maps/Arena")]);
        assert_eq!(service.asset_references(&pak, ".asset")?, vec![AssetReference::new("/Game/bp/Turret")]);
        assert_eq!(service.asset_references(&pak, "")?.len(), 2);
        assert_eq!(service.chain().read(UEPath::new("content/maps/Arena.map"))?, b"arena");
        Ok(())
    }

    #[test]
    fn test_unmount_not_mounted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pak = arena_pak(dir.path())?;
        let mut service = PakMountService::from_config(&config(dir.path()))?;
        let mut objects = registry();

        assert!(matches!(service.unmount(&pak, &mut objects), Err(PakError::NotMounted(_))));
        assert_eq!(service.unload_generation(), 0);
        assert_eq!(service.mounted_paths().count(), 0);
        Ok(())
    }

    #[test]
    fn test_remount_after_unmount() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pak = arena_pak(dir.path())?;
        let mut service = PakMountService::from_config(&config(dir.path()))?;
        let mut objects = registry();

        service.mount(&pak)?;
        service.unmount(&pak, &mut objects)?;
        assert!(!service.chain().file_exists(UEPath::new("content/maps/Arena.map")));
        service.mount(&pak)?;
        assert_eq!(service.asset_references(&pak, ".map")?, vec![AssetReference::new("/Game/maps/Arena")]);
        assert_eq!(service.chain().layer_names(), vec!["PakFile", "PhysicalFile"]);
        Ok(())
    }

    #[test]
    fn test_generation_advances_once_per_unmount() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pak = arena_pak(dir.path())?;
        let mut service = PakMountService::from_config(&config(dir.path()))?.with_unmount_policy(UnmountPolicy::RenameResident);
        let mut objects = registry();

        service.mount(&pak)?;
        let turret = objects.try_load(service.chain(), "/Game/bp/Turret").unwrap();
        let arena = objects.try_load(service.chain(), "/Game/maps/Arena").unwrap();
        service.unmount(&pak, &mut objects)?;
        assert_eq!(service.unload_generation(), 1);
        assert_eq!(turret.path(), "/Game/bp/Turret-Unloaded___0.Turret");
        assert_eq!(arena.package(), "/Game/maps/Arena-Unloaded___0");

        service.mount(&pak)?;
        let reloaded = objects.try_load(service.chain(), "/Game/bp/Turret").unwrap();
        service.unmount(&pak, &mut objects)?;
        assert_eq!(service.unload_generation(), 2);
        assert_eq!(reloaded.package(), "/Game/bp/Turret-Unloaded___1");
        Ok(())
    }

    #[test]
    fn test_evict_policy() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pak = arena_pak(dir.path())?;
        let mut service = PakMountService::from_config(&config(dir.path()))?;
        let mut objects = registry();

        service.mount(&pak)?;
        let turret = objects.try_load(service.chain(), "/Game/bp/Turret").unwrap();
        drop(objects.try_load(service.chain(), "/Game/maps/Arena"));
        service.unmount(&pak, &mut objects)?;

        assert!(!objects.contains_package("/Game/maps/Arena"));
        assert!(!objects.contains_package("/Game/maps/Arena-Unloaded___0"));
        assert_eq!(turret.package(), "/Game/bp/Turret-Unloaded___0");
        Ok(())
    }

    #[test]
    fn test_refuse_while_referenced() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pak = arena_pak(dir.path())?;
        let mut service = PakMountService::from_config(&config(dir.path()))?.with_unmount_policy(UnmountPolicy::RefuseWhileReferenced);
        let mut objects = registry();

        service.mount(&pak)?;
        let turret = objects.try_load(service.chain(), "/Game/bp/Turret").unwrap();
        assert!(matches!(service.unmount(&pak, &mut objects), Err(PakError::InUse { count: 1, .. })));
        assert!(service.is_mounted(&pak));
        assert_eq!(service.unload_generation(), 0);

        drop(turret);
        service.unmount(&pak, &mut objects)?;
        assert!(!objects.contains_package("/Game/bp/Turret"));
        assert_eq!(service.unload_generation(), 1);
        Ok(())
    }

    #[test]
    fn test_mount_shadows_cached_read() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pak = arena_pak(dir.path())?;
        fs::create_dir_all(dir.path().join("content/bp"))?;
        fs::write(dir.path().join("content/bp/Turret.asset"), b"loose")?;
        let config = Config {
            platform_layers: vec!["CachedReadFile".to_string(), "PhysicalFile".to_string()],
            ..config(dir.path())
        };
        let mut service = PakMountService::from_config(&config)?;
        let turret = UEPath::new("content/bp/Turret.asset");

        assert_eq!(service.chain().read(turret)?, b"loose");
        service.mount(&pak)?;
        assert_eq!(service.chain().layer_names(), vec!["CachedReadFile", "PakFile", "PhysicalFile"]);
        assert_eq!(service.chain().read(turret)?, b"turret");
        Ok(())
    }

    #[test]
    fn test_failed_unmount_has_no_side_effects() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pak = arena_pak(dir.path())?;
        let mut service = PakMountService::from_config(&config(dir.path()))?.with_unmount_policy(UnmountPolicy::RenameResident);
        let mut objects = registry();

        let layer = service.mount(&pak)?.layer();
        let turret = objects.try_load(service.chain(), "/Game/bp/Turret").unwrap();
        assert!(service.chain_mut().pak_layer_mut(layer).unwrap().unmount(&pak));

        assert!(matches!(service.unmount(&pak, &mut objects), Err(PakError::UnmountFailed(_))));
        assert_eq!(service.unload_generation(), 0);
        assert!(service.is_mounted(&pak));
        assert_eq!(turret.package(), "/Game/bp/Turret");
        Ok(())
    }

    #[test]
    fn test_sandbox_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sandbox = dir.path().join("sandbox");
        fs::create_dir_all(sandbox.join("content"))?;
        fs::write(sandbox.join("content/Local.asset"), b"")?;
        let pak = arena_pak(dir.path())?;
        let config = Config {
            sandbox_dir: Some(sandbox.clone()),
            platform_layers: vec!["SandboxFile".to_string(), "PhysicalFile".to_string()],
            ..config(dir.path())
        };
        let mut service = PakMountService::from_config(&config)?;
        assert_eq!(service.convert_to_sandbox_path(UEPath::new("content/Local.asset")), PathBuf::from("content/Local.asset"));

        service.mount(&pak)?;
        assert!(service.is_sandboxed());
        assert_eq!(service.convert_to_sandbox_path(UEPath::new("content/Local.asset")), sandbox.join("content/Local.asset"));
        Ok(())
    }
}
