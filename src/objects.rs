//! The in-memory object namespace packages are loaded into.

use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::package_name::{short_name, split_object_path};
use crate::platform_file::PlatformFileChain;
use crate::{AssetPathTranslator, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Class,
    /// Source definition of a class; `generated_class` is the object path of
    /// the compiled class, if it has one.
    Blueprint { generated_class: Option<String> },
    Object,
}

#[derive(Debug)]
pub struct LoadedObject {
    name: String,
    kind: ObjectKind,
    package: RwLock<String>,
}
impl LoadedObject {
    pub fn new<S: Into<String>>(package: &str, name: S, kind: ObjectKind) -> Self {
        Self {
            name: name.into(),
            kind,
            package: RwLock::new(package.to_string()),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }
    /// Current owning package; changes if the package is renamed on unmount.
    pub fn package(&self) -> String {
        self.package.read().unwrap().clone()
    }
    pub fn path(&self) -> String {
        format!("{}.{}", self.package(), self.name)
    }
}

pub type ObjectHandle = Arc<LoadedObject>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDesc {
    pub name: String,
    pub kind: ObjectKind,
}
impl ExportDesc {
    pub fn new<S: Into<String>>(name: S, kind: ObjectKind) -> Self {
        Self { name: name.into(), kind }
    }
}

/// Turns a package name into the objects it exports.
pub trait PackageLoader: Send {
    /// `Ok(None)` when no such package exists.
    fn load_package(&self, files: &PlatformFileChain, package: &str) -> Result<Option<Vec<ExportDesc>>>;
}

/// Finds the package file through the platform file chain and exposes a
/// single plain object named after the package.
pub struct PackageFileLoader {
    translator: AssetPathTranslator,
    extensions: Vec<String>,
}
impl PackageFileLoader {
    pub fn new(translator: AssetPathTranslator, extensions: Vec<String>) -> Self {
        Self { translator, extensions }
    }
}
impl PackageLoader for PackageFileLoader {
    fn load_package(&self, files: &PlatformFileChain, package: &str) -> Result<Option<Vec<ExportDesc>>> {
        for extension in &self.extensions {
            let Some(path) = self.translator.to_content_path(package, extension) else {
                return Ok(None);
            };
            if files.file_exists(&path) {
                let data = files.read(&path)?;
                debug!(target: "pakloader", "Read package {package} from {path} ({} bytes)", data.len());
                return Ok(Some(vec![ExportDesc::new(short_name(package), ObjectKind::Object)]));
            }
        }
        Ok(None)
    }
}

struct Package {
    objects: Vec<ObjectHandle>,
    /// Renamed away on unmount; reclaimed by `collect_garbage` once nothing
    /// outside the registry holds its objects.
    unloaded: bool,
}

pub struct ObjectRegistry {
    loader: Box<dyn PackageLoader>,
    packages: IndexMap<String, Package>,
}
impl ObjectRegistry {
    pub fn new(loader: Box<dyn PackageLoader>) -> Self {
        Self {
            loader,
            packages: IndexMap::new(),
        }
    }

    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }
    pub fn contains_package(&self, package: &str) -> bool {
        self.packages.contains_key(package)
    }
    pub fn find_object(&self, reference: &str) -> Option<ObjectHandle> {
        let (package, object) = split_object_path(reference);
        self.packages.get(package)?.objects.iter().find(|o| o.name == object).cloned()
    }

    pub fn load_package(&mut self, files: &PlatformFileChain, package: &str) -> Result<Option<&[ObjectHandle]>> {
        if !self.packages.contains_key(package) {
            let Some(exports) = self.loader.load_package(files, package)? else {
                return Ok(None);
            };
            let objects = exports.into_iter().map(|export| Arc::new(LoadedObject::new(package, export.name, export.kind))).collect();
            self.packages.insert(package.to_string(), Package { objects, unloaded: false });
        }
        Ok(self.packages.get(package).map(|p| p.objects.as_slice()))
    }

    /// Resolves `reference`, loading its package if needed. A bare
    /// `/Path/Name_C` whose own package doesn't exist refers to the generated
    /// class inside `/Path/Name`.
    pub fn try_load(&mut self, files: &PlatformFileChain, reference: &str) -> Option<ObjectHandle> {
        let (package, object) = split_object_path(reference);
        if let Some(found) = self.load_object(files, package, object) {
            return Some(found);
        }
        if !reference.contains('.') {
            if let Some(owner) = package.strip_suffix("_C") {
                return self.load_object(files, owner, object);
            }
        }
        None
    }

    fn load_object(&mut self, files: &PlatformFileChain, package: &str, object: &str) -> Option<ObjectHandle> {
        match self.load_package(files, package) {
            Ok(Some(objects)) => objects.iter().find(|o| o.name == object).cloned(),
            Ok(None) => None,
            Err(err) => {
                warn!(target: "pakloader", "Couldn't load package {package}: {err}");
                None
            }
        }
    }

    /// The class `object` represents, directly or through the class its
    /// source definition generates.
    pub fn class_of(&mut self, files: &PlatformFileChain, object: &ObjectHandle) -> Option<ObjectHandle> {
        match object.kind() {
            ObjectKind::Class => Some(object.clone()),
            ObjectKind::Blueprint { generated_class: Some(class) } => self.try_load(files, class).filter(|class| *class.kind() == ObjectKind::Class),
            _ => None,
        }
    }

    /// Handles to objects of `package` held outside the registry.
    pub fn live_handles(&self, package: &str) -> usize {
        self.packages.get(package).map(|p| p.objects.iter().map(|o| Arc::strong_count(o) - 1).sum()).unwrap_or(0)
    }

    pub fn rename_package(&mut self, package: &str, new_name: &str) -> bool {
        let Some(mut renamed) = self.packages.shift_remove(package) else {
            return false;
        };
        for object in &renamed.objects {
            *object.package.write().unwrap() = new_name.to_string();
        }
        renamed.unloaded = true;
        self.packages.insert(new_name.to_string(), renamed);
        true
    }

    pub fn evict_package(&mut self, package: &str) -> bool {
        self.packages.shift_remove(package).is_some()
    }

    /// Drops renamed packages nobody references any more.
    pub fn collect_garbage(&mut self) -> usize {
        let before = self.packages.len();
        self.packages.retain(|_, p| !(p.unloaded && p.objects.iter().all(|o| Arc::strong_count(o) == 1)));
        before - self.packages.len()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Cooked `Turret` blueprint (class only), editor `Drone` blueprint
    /// (source + class) and a plain data asset.
    pub(crate) struct FakePackages;
    impl PackageLoader for FakePackages {
        fn load_package(&self, _files: &PlatformFileChain, package: &str) -> Result<Option<Vec<ExportDesc>>> {
            Ok(match package {
                "/Game/bp/Turret" => Some(vec![ExportDesc::new("Turret_C", ObjectKind::Class)]),
                "/Game/bp/Drone" => Some(vec![
                    ExportDesc::new(
                        "Drone",
                        ObjectKind::Blueprint {
                            generated_class: Some("/Game/bp/Drone.Drone_C".to_string()),
                        },
                    ),
                    ExportDesc::new("Drone_C", ObjectKind::Class),
                ]),
                "/Game/data/Table" => Some(vec![ExportDesc::new("Table", ObjectKind::Object)]),
                _ => None,
            })
        }
    }

    pub(crate) fn actor(package: &str, name: &str) -> ObjectHandle {
        Arc::new(LoadedObject::new(package, name, ObjectKind::Object))
    }

    #[test]
    fn test_class_suffix_resolution() {
        let files = PlatformFileChain::default();
        let mut registry = ObjectRegistry::new(Box::new(FakePackages));

        assert!(registry.try_load(&files, "/Game/bp/Turret").is_none());
        let class = registry.try_load(&files, "/Game/bp/Turret_C").unwrap();
        assert_eq!(class.path(), "/Game/bp/Turret.Turret_C");
        assert_eq!(*class.kind(), ObjectKind::Class);
        assert!(registry.try_load(&files, "/Game/bp/Missing").is_none());
    }

    #[test]
    fn test_class_of() {
        let files = PlatformFileChain::default();
        let mut registry = ObjectRegistry::new(Box::new(FakePackages));

        let blueprint = registry.try_load(&files, "/Game/bp/Drone").unwrap();
        let class = registry.class_of(&files, &blueprint).unwrap();
        assert_eq!(class.path(), "/Game/bp/Drone.Drone_C");

        let table = registry.try_load(&files, "/Game/data/Table").unwrap();
        assert!(registry.class_of(&files, &table).is_none());
    }

    #[test]
    fn test_rename_and_collect() {
        let files = PlatformFileChain::default();
        let mut registry = ObjectRegistry::new(Box::new(FakePackages));

        let table = registry.try_load(&files, "/Game/data/Table").unwrap();
        assert_eq!(registry.live_handles("/Game/data/Table"), 1);

        assert!(registry.rename_package("/Game/data/Table", "/Game/data/Table-Unloaded___0"));
        assert_eq!(table.path(), "/Game/data/Table-Unloaded___0.Table");
        assert!(registry.find_object("/Game/data/Table").is_none());

        // a fresh load doesn't collide with the renamed package
        let reloaded = registry.try_load(&files, "/Game/data/Table").unwrap();
        assert!(!Arc::ptr_eq(&table, &reloaded));

        assert_eq!(registry.collect_garbage(), 0);
        drop(table);
        assert_eq!(registry.collect_garbage(), 1);
        assert!(!registry.contains_package("/Game/data/Table-Unloaded___0"));
        assert!(registry.contains_package("/Game/data/Table"));
    }
}
