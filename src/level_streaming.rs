//! Streaming level placeholders for maps served out of paks.

use std::path::Path;

use bitflags::bitflags;
use glam::Vec3;
use indexmap::IndexMap;
use strum::{AsRefStr, EnumString};
use tracing::{debug, info, warn};

use crate::loader::PakLoader;
use crate::objects::ObjectHandle;
use crate::package_name::{is_short_package_name, long_package_path, object_path, object_path_to_package_name, short_name};
use crate::{AssetReference, Result};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rotator {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}
impl Rotator {
    pub fn new(pitch: f32, yaw: f32, roll: f32) -> Self {
        Self { pitch, yaw, roll }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub rotation: Rotator,
    pub translation: Vec3,
    pub scale: Vec3,
}
impl Transform {
    pub fn new(rotation: Rotator, translation: Vec3) -> Self {
        Self {
            rotation,
            translation,
            scale: Vec3::ONE,
        }
    }
}
impl Default for Transform {
    fn default() -> Self {
        Self::new(Rotator::default(), Vec3::ZERO)
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct LevelFlags: u8 {
        const SHOULD_BE_LOADED = 0b00_0001;
        const SHOULD_BE_VISIBLE = 0b00_0010;
        const SHOULD_BLOCK_ON_LOAD = 0b00_0100;
        const INITIALLY_LOADED = 0b00_1000;
        const INITIALLY_VISIBLE = 0b01_0000;
        const REQUESTING_UNLOAD_AND_REMOVAL = 0b10_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
pub enum LevelState {
    Unregistered,
    Registered,
    Loading,
    LoadedHidden,
    LoadedVisible,
    Unloading,
    Removed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
pub enum WorldType {
    #[default]
    Game,
    #[strum(serialize = "PIE")]
    Pie,
    Editor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LevelId(u32);

#[derive(Debug)]
pub struct StreamingLevel {
    id: LevelId,
    /// Map package to load, usually `/Game/maps/Arena.Arena`.
    package_name_to_load: String,
    /// Unique instance name the level is registered under.
    world_asset: String,
    transform: Transform,
    flags: LevelFlags,
    state: LevelState,
    actors: Option<Vec<ObjectHandle>>,
}
impl StreamingLevel {
    fn new(id: LevelId, package_name_to_load: String, world_asset: String, transform: Transform) -> Self {
        Self {
            id,
            package_name_to_load,
            world_asset,
            transform,
            flags: LevelFlags::empty(),
            state: LevelState::Unregistered,
            actors: None,
        }
    }

    pub fn id(&self) -> LevelId {
        self.id
    }
    pub fn package_name_to_load(&self) -> &str {
        &self.package_name_to_load
    }
    /// Map package name without the object part.
    pub fn level_to_load_name(&self) -> &str {
        object_path_to_package_name(&self.package_name_to_load)
    }
    pub fn level_instance_name(&self) -> &str {
        &self.world_asset
    }
    pub fn world_asset_package_name(&self) -> &str {
        object_path_to_package_name(&self.world_asset)
    }
    pub fn transform(&self) -> &Transform {
        &self.transform
    }
    pub fn flags(&self) -> LevelFlags {
        self.flags
    }
    pub fn state(&self) -> LevelState {
        self.state
    }
    pub fn is_loaded(&self) -> bool {
        self.actors.is_some()
    }
    /// Actors of the loaded level; empty until it's loaded.
    pub fn actors(&self) -> &[ObjectHandle] {
        self.actors.as_deref().unwrap_or_default()
    }

    /// Whether `name` (long, short or object path) refers to this level.
    fn answers_to(&self, name: &str) -> bool {
        let package = object_path_to_package_name(name);
        if is_short_package_name(package) {
            short_name(self.level_to_load_name()) == package || short_name(self.world_asset_package_name()) == package
        } else {
            self.level_to_load_name() == package || self.world_asset_package_name() == package
        }
    }
}

/// Host side of level streaming.
pub trait LevelLoader {
    /// Resolves a long or short package name to the long name of a map that
    /// exists.
    fn search_for_package(&self, name: &str) -> Option<String>;
    /// Loads the map package and returns its actors.
    fn load_level(&mut self, package: &str) -> Option<Vec<ObjectHandle>>;
}

/// Told whenever a level is activated or deactivated.
pub trait StreamingStatusListener: Send {
    fn level_streaming_status_changed(&mut self, level: &StreamingLevel, should_be_loaded: bool, should_be_visible: bool, should_block_on_load: bool);
}

#[derive(Default)]
pub struct StreamingWorld {
    world_type: WorldType,
    streaming_levels_prefix: String,
    levels: Vec<StreamingLevel>,
    deferred_transforms: IndexMap<String, Transform>,
    listeners: Vec<Box<dyn StreamingStatusListener>>,
    next_id: u32,
}
impl StreamingWorld {
    pub fn new(world_type: WorldType) -> Self {
        Self {
            world_type,
            ..Default::default()
        }
    }
    /// Play-in-editor worlds mangle streaming level package names with this.
    pub fn with_streaming_levels_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.streaming_levels_prefix = prefix.into();
        self
    }
    pub fn add_listener(&mut self, listener: Box<dyn StreamingStatusListener>) {
        self.listeners.push(listener);
    }

    pub fn world_type(&self) -> WorldType {
        self.world_type
    }
    pub fn streaming_levels_prefix(&self) -> &str {
        &self.streaming_levels_prefix
    }
    pub fn is_play_in_editor(&self) -> bool {
        self.world_type == WorldType::Pie
    }
    pub fn levels(&self) -> &[StreamingLevel] {
        &self.levels
    }
    pub fn level(&self, id: LevelId) -> Option<&StreamingLevel> {
        self.levels.iter().find(|level| level.id == id)
    }
    fn level_mut(&mut self, id: LevelId) -> Option<&mut StreamingLevel> {
        self.levels.iter_mut().find(|level| level.id == id)
    }
    pub fn deferred_transform(&self, map_name: &str) -> Option<&Transform> {
        self.deferred_transforms.get(map_name)
    }

    pub fn make_safe_level_name(&self, level_name: &str) -> String {
        if self.streaming_levels_prefix.is_empty() {
            return level_name.to_string();
        }
        let package_name = format!("{}{}", self.streaming_levels_prefix, short_name(level_name));
        if is_short_package_name(level_name) {
            package_name
        } else {
            format!("{}/{package_name}", long_package_path(level_name))
        }
    }

    /// The level registered under the exact instance package name.
    fn find_instance(&self, instance_name: &str) -> Option<LevelId> {
        let package = object_path_to_package_name(instance_name);
        self.levels.iter().find(|level| level.world_asset_package_name() == package).map(|level| level.id)
    }

    fn register(&mut self, package_name_to_load: String, world_asset: String, transform: Transform) -> LevelId {
        let id = LevelId(self.next_id);
        self.next_id += 1;
        let mut level = StreamingLevel::new(id, package_name_to_load, world_asset, transform);
        let deferred = self.deferred_transforms.keys().find(|key| level.answers_to(key)).cloned();
        if let Some(key) = deferred {
            if let Some(transform) = self.deferred_transforms.shift_remove(&key) {
                debug!(target: "pakloader", "Applying deferred transform for {key}");
                level.transform = transform;
            }
        }
        level.state = LevelState::Registered;
        info!(target: "pakloader", "Added streaming level {}", level.world_asset);
        self.levels.push(level);
        id
    }

    /// Placeholders for every map reference, reusing any already registered.
    pub fn register_maps(&mut self, maps: &[AssetReference]) -> Vec<LevelId> {
        maps.iter()
            .map(|map| {
                let map_name = map.package_name();
                let package_name_to_load = object_path(map_name);
                match self.find_instance(&package_name_to_load) {
                    Some(id) => id,
                    None => self.register(package_name_to_load.clone(), package_name_to_load, Transform::default()),
                }
            })
            .collect()
    }

    /// Mounts `pak_path` and registers a placeholder for each map it serves.
    pub fn levels_from_pak(&mut self, loader: &mut PakLoader, pak_path: &Path) -> Result<Vec<LevelId>> {
        let maps = loader.levels_from_pak(pak_path)?;
        Ok(self.register_maps(&maps))
    }

    /// Registers a uniquely named instance of `level_name`, or returns the
    /// instance already registered for `level_uid`. `None` if no such map
    /// exists.
    pub fn create_level_instance(&mut self, loader: &dyn LevelLoader, level_name: &str, level_uid: &str, location: Vec3, rotation: Rotator) -> Option<LevelId> {
        let level_name = object_path_to_package_name(level_name);
        let Some(long_package_name) = loader.search_for_package(level_name) else {
            warn!(target: "pakloader", "No such level: {level_name}");
            return None;
        };

        let unique = format!(
            "{}/{}{}_LevelInstance_{level_uid}",
            long_package_path(&long_package_name),
            self.streaming_levels_prefix,
            short_name(&long_package_name)
        );
        if let Some(id) = self.find_instance(&unique) {
            return Some(id);
        }
        Some(self.register(long_package_name, unique, Transform::new(rotation, location)))
    }

    /// Applies `transform` to the level registered for `map_name`, or keeps it
    /// for the next placeholder created for that map. Returns whether a level
    /// was found.
    pub fn set_level_transform(&mut self, map_name: &str, transform: Transform) -> bool {
        let safe_name = self.make_safe_level_name(map_name);
        match self.levels.iter_mut().find(|level| level.answers_to(&safe_name)) {
            Some(level) => {
                level.transform = transform;
                true
            }
            None => {
                debug!(target: "pakloader", "Deferring transform for {map_name}");
                self.deferred_transforms.insert(map_name.to_string(), transform);
                false
            }
        }
    }

    pub fn activate_level_instance(&mut self, id: LevelId, loading: bool) -> bool {
        let Some(level) = self.levels.iter_mut().find(|level| level.id == id) else {
            return false;
        };
        if loading {
            info!(target: "pakloader", "Streaming in level {}...", level.world_asset);
            level.flags.insert(LevelFlags::SHOULD_BE_LOADED | LevelFlags::SHOULD_BE_VISIBLE);
            level.flags.remove(LevelFlags::SHOULD_BLOCK_ON_LOAD);
        } else {
            info!(target: "pakloader", "Streaming out level {}...", level.world_asset);
            level.flags.remove(LevelFlags::SHOULD_BE_LOADED | LevelFlags::SHOULD_BE_VISIBLE);
        }

        let level = &*level;
        let flags = level.flags;
        for listener in &mut self.listeners {
            debug!(target: "pakloader", "ActivateLevel {} {flags:?}", level.world_asset);
            listener.level_streaming_status_changed(
                level,
                flags.contains(LevelFlags::SHOULD_BE_LOADED),
                flags.contains(LevelFlags::SHOULD_BE_VISIBLE),
                flags.contains(LevelFlags::SHOULD_BLOCK_ON_LOAD),
            );
        }
        true
    }

    /// Flags the level for removal and streams it out if needed; it leaves the
    /// world once `update_streaming` has unloaded it.
    pub fn remove_streaming_level(&mut self, id: LevelId) -> bool {
        let Some(level) = self.level_mut(id) else {
            return false;
        };
        level.flags.insert(LevelFlags::REQUESTING_UNLOAD_AND_REMOVAL);
        if level.flags.contains(LevelFlags::SHOULD_BE_LOADED) {
            self.activate_level_instance(id, false);
        }
        true
    }

    pub fn level_to_load_name(&self, id: LevelId) -> Option<&str> {
        self.level(id).map(StreamingLevel::level_to_load_name)
    }
    pub fn level_instance_name(&self, id: LevelId) -> Option<&str> {
        self.level(id).map(StreamingLevel::level_instance_name)
    }
    pub fn level_instance_actors(&self, id: LevelId) -> Vec<ObjectHandle> {
        self.level(id).map(|level| level.actors().to_vec()).unwrap_or_default()
    }

    /// Actors of the first level loading `level_name`.
    pub fn level_actors(&self, level_name: &str) -> Vec<ObjectHandle> {
        let long_name = object_path(level_name);
        self.levels
            .iter()
            .find(|level| level.package_name_to_load == long_name)
            .map(|level| level.actors().to_vec())
            .unwrap_or_default()
    }

    /// Moves every level one step towards what its flags ask for. Returns the
    /// number of levels that changed state.
    pub fn update_streaming(&mut self, loader: &mut dyn LevelLoader) -> usize {
        let mut changed = 0;
        for level in &mut self.levels {
            let should_load = level.flags.contains(LevelFlags::SHOULD_BE_LOADED);
            let should_show = level.flags.contains(LevelFlags::SHOULD_BE_VISIBLE);
            let removing = level.flags.contains(LevelFlags::REQUESTING_UNLOAD_AND_REMOVAL);
            let current = level.state;
            let next = match current {
                LevelState::Registered if removing => LevelState::Removed,
                LevelState::Registered if should_load => LevelState::Loading,
                LevelState::Loading if !should_load => LevelState::Registered,
                LevelState::Loading => match loader.load_level(level.level_to_load_name()) {
                    Some(actors) => {
                        level.actors = Some(actors);
                        LevelState::LoadedHidden
                    }
                    None => {
                        warn!(target: "pakloader", "Couldn't load level {}", level.package_name_to_load);
                        level.flags.remove(LevelFlags::SHOULD_BE_LOADED | LevelFlags::SHOULD_BE_VISIBLE);
                        LevelState::Registered
                    }
                },
                LevelState::LoadedHidden | LevelState::LoadedVisible if !should_load => LevelState::Unloading,
                LevelState::LoadedHidden if should_show => LevelState::LoadedVisible,
                LevelState::LoadedVisible if !should_show => LevelState::LoadedHidden,
                LevelState::Unloading if should_load => LevelState::LoadedHidden,
                LevelState::Unloading => {
                    level.actors = None;
                    LevelState::Registered
                }
                state => state,
            };
            if next != current {
                debug!(target: "pakloader", "Level {}: {} -> {}", level.world_asset, current.as_ref(), next.as_ref());
                level.state = next;
                changed += 1;
            }
        }
        self.levels.retain(|level| {
            let removed = level.state == LevelState::Removed;
            if removed {
                info!(target: "pakloader", "Removed streaming level {}", level.world_asset);
            }
            !removed
        });
        changed
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::objects::test::actor;
    use pretty_assertions::assert_eq;

    struct FakeLevels;
    impl LevelLoader for FakeLevels {
        fn search_for_package(&self, name: &str) -> Option<String> {
            match name {
                "/Game/maps/Arena" | "Arena" => Some("/Game/maps/Arena".to_string()),
                _ => None,
            }
        }
        fn load_level(&mut self, package: &str) -> Option<Vec<ObjectHandle>> {
            (package == "/Game/maps/Arena").then(|| vec![actor("/Game/maps/Arena", "Spawn")])
        }
    }

    type Events = Arc<Mutex<Vec<(String, bool, bool)>>>;
    struct Recorder(Events);
    impl StreamingStatusListener for Recorder {
        fn level_streaming_status_changed(&mut self, level: &StreamingLevel, should_be_loaded: bool, should_be_visible: bool, _should_block_on_load: bool) {
            self.0.lock().unwrap().push((level.level_instance_name().to_string(), should_be_loaded, should_be_visible));
        }
    }

    fn arena() -> Vec<AssetReference> {
        vec![AssetReference::new("/Game/maps/Arena")]
    }

    #[test]
    fn test_register_maps_reuses_placeholders() {
        let mut world = StreamingWorld::new(WorldType::Game);
        let first = world.register_maps(&arena());
        let second = world.register_maps(&arena());
        assert_eq!(first, second);
        assert_eq!(world.levels().len(), 1);

        let level = &world.levels()[0];
        assert_eq!(level.package_name_to_load(), "/Game/maps/Arena.Arena");
        assert_eq!(level.level_to_load_name(), "/Game/maps/Arena");
        assert_eq!(level.state(), LevelState::Registered);
        assert_eq!(level.flags(), LevelFlags::empty());
    }

    #[test]
    fn test_deferred_transform() {
        let mut world = StreamingWorld::new(WorldType::Game);
        let transform = Transform::new(Rotator::new(0.0, 90.0, 0.0), Vec3::new(100.0, 0.0, 0.0));

        assert!(!world.set_level_transform("Arena", transform));
        assert!(world.deferred_transform("Arena").is_some());

        let id = world.create_level_instance(&FakeLevels, "Arena", "1", Vec3::ZERO, Rotator::default()).unwrap();
        assert_eq!(*world.level(id).unwrap().transform(), transform);
        assert!(world.deferred_transform("Arena").is_none());

        // consumed: a second instance keeps its own transform
        let other = world.create_level_instance(&FakeLevels, "Arena", "2", Vec3::ONE, Rotator::default()).unwrap();
        assert_eq!(world.level(other).unwrap().transform().translation, Vec3::ONE);

        let moved = Transform::new(Rotator::default(), Vec3::new(0.0, 0.0, 50.0));
        assert!(world.set_level_transform("/Game/maps/Arena_LevelInstance_2", moved));
        assert_eq!(*world.level(other).unwrap().transform(), moved);
    }

    #[test]
    fn test_create_level_instance() {
        let mut world = StreamingWorld::new(WorldType::Pie).with_streaming_levels_prefix("UEDPIE_0_");
        let id = world.create_level_instance(&FakeLevels, "/Game/maps/Arena.Arena", "7", Vec3::ZERO, Rotator::default()).unwrap();
        assert_eq!(world.level_instance_name(id), Some("/Game/maps/UEDPIE_0_Arena_LevelInstance_7"));
        assert_eq!(world.level_to_load_name(id), Some("/Game/maps/Arena"));
        assert_eq!(world.create_level_instance(&FakeLevels, "Arena", "7", Vec3::ONE, Rotator::default()), Some(id));
        assert_eq!(world.levels().len(), 1);
        assert!(world.create_level_instance(&FakeLevels, "Nowhere", "7", Vec3::ZERO, Rotator::default()).is_none());
        assert_eq!(world.make_safe_level_name("/Game/maps/Arena"), "/Game/maps/UEDPIE_0_Arena");
        assert_eq!(world.make_safe_level_name("Arena"), "UEDPIE_0_Arena");
    }

    #[test]
    fn test_streaming_lifecycle() {
        let events: Events = Default::default();
        let mut world = StreamingWorld::new(WorldType::Game);
        world.add_listener(Box::new(Recorder(events.clone())));
        let mut loader = FakeLevels;
        let id = world.register_maps(&arena())[0];
        let state = |world: &StreamingWorld| world.level(id).map(StreamingLevel::state);

        assert_eq!(world.update_streaming(&mut loader), 0);
        assert!(world.activate_level_instance(id, true));
        world.update_streaming(&mut loader);
        assert_eq!(state(&world), Some(LevelState::Loading));
        world.update_streaming(&mut loader);
        assert_eq!(state(&world), Some(LevelState::LoadedHidden));
        world.update_streaming(&mut loader);
        assert_eq!(state(&world), Some(LevelState::LoadedVisible));

        let actors = world.level_actors("/Game/maps/Arena");
        assert_eq!(actors.len(), 1);
        assert_eq!(actors[0].name(), "Spawn");
        assert_eq!(world.level_instance_actors(id).len(), 1);

        assert!(world.remove_streaming_level(id));
        world.update_streaming(&mut loader);
        assert_eq!(state(&world), Some(LevelState::Unloading));
        world.update_streaming(&mut loader);
        assert_eq!(state(&world), Some(LevelState::Registered));
        assert!(world.level_actors("/Game/maps/Arena").is_empty());
        world.update_streaming(&mut loader);
        assert_eq!(state(&world), None);

        let name = "/Game/maps/Arena.Arena".to_string();
        assert_eq!(*events.lock().unwrap(), vec![(name.clone(), true, true), (name, false, false)]);
    }

    #[test]
    fn test_failed_load_returns_to_registered() {
        let mut world = StreamingWorld::new(WorldType::Game);
        let mut loader = FakeLevels;
        let id = world.register_maps(&[AssetReference::new("/Game/maps/Broken")])[0];
        world.activate_level_instance(id, true);
        world.update_streaming(&mut loader);
        world.update_streaming(&mut loader);
        let level = world.level(id).unwrap();
        assert_eq!(level.state(), LevelState::Registered);
        assert!(!level.flags().contains(LevelFlags::SHOULD_BE_LOADED));
    }
}
