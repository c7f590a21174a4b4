use std::fmt::{Display, Formatter};

use crate::{UEPathBuf, ends_with_ignore_case, make_standard_directory, make_standard_filename, package_name, strip_prefix_ignore_case};

/// A logical path into the object namespace, e.g. `/Game/maps/Arena`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetReference(String);
impl AssetReference {
    pub fn new<S: Into<String>>(reference: S) -> Self {
        Self(reference.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn package_name(&self) -> &str {
        package_name::object_path_to_package_name(&self.0)
    }
    /// Compiled blueprint classes have a _C suffix
    pub fn with_class_suffix(&self) -> Self {
        Self(format!("{}_C", self.0))
    }
}
impl Display for AssetReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl AsRef<str> for AssetReference {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Maps paths served by a mounted pak (`Content/maps/Arena.umap`) to logical
/// references (`/Game/maps/Arena`) and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPathTranslator {
    content_root: String,
    virtual_root: String,
}
impl AssetPathTranslator {
    pub fn new(content_root: &str, virtual_root: &str) -> Self {
        let mut virtual_root = make_standard_directory(virtual_root);
        if !virtual_root.starts_with('/') {
            virtual_root.insert(0, '/');
        }
        Self {
            content_root: make_standard_directory(content_root),
            virtual_root,
        }
    }
    pub fn content_root(&self) -> &str {
        &self.content_root
    }
    pub fn virtual_root(&self) -> &str {
        &self.virtual_root
    }

    /// Returns the reference for `pak_path`, or `None` if the path doesn't
    /// carry `extension_filter` (an empty filter keeps everything) or lies
    /// outside the content root.
    pub fn translate(&self, pak_path: &str, extension_filter: &str) -> Option<AssetReference> {
        let path = make_standard_filename(pak_path);
        if !extension_filter.is_empty() && !ends_with_ignore_case(&path, extension_filter) {
            return None;
        }
        let base = strip_extension(&path);
        let relative = strip_prefix_ignore_case(base, &self.content_root)?;
        Some(AssetReference(format!("{}{}", self.virtual_root, relative)))
    }

    /// Inverse of [`Self::translate`]: the path a package is served from.
    pub fn to_content_path(&self, reference: &str, extension: &str) -> Option<UEPathBuf> {
        let package = package_name::object_path_to_package_name(reference);
        let relative = strip_prefix_ignore_case(package, &self.virtual_root)?;
        Some(UEPathBuf::from(format!("{}{}{}", self.content_root, relative, extension)))
    }
}

/// Strips the extension from the last path component only.
fn strip_extension(path: &str) -> &str {
    let file_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[file_start..].rfind('.') {
        Some(dot) if dot > 0 => &path[..file_start + dot],
        _ => path,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_translate() {
        let translator = AssetPathTranslator::new("content", "/Game/");
        assert_eq!(translator.translate("content/maps/Arena.map", ".map"), Some(AssetReference::new("/Game/maps/Arena")));
        assert_eq!(translator.translate("content/bp/Turret.asset", ".map"), None);
        assert_eq!(translator.translate("content/bp/Turret.asset", ""), Some(AssetReference::new("/Game/bp/Turret")));
        assert_eq!(translator.translate("elsewhere/bp/Turret.asset", ""), None);
        assert_eq!(translator.translate("content\\bp\\Turret.ASSET", ".asset"), Some(AssetReference::new("/Game/bp/Turret")));
    }

    #[test]
    fn test_translate_is_pure() {
        let translator = AssetPathTranslator::new("../../../Game/Content/", "Game");
        let first = translator.translate("../../../Game/Content/bp/Turret.uasset", ".uasset");
        let second = translator.translate("../../../Game/Content/bp/Turret.uasset", ".uasset");
        assert_eq!(first, second);
        assert_eq!(first, Some(AssetReference::new("/Game/bp/Turret")));
    }

    #[test]
    fn test_to_content_path() {
        let translator = AssetPathTranslator::new("Content/", "/Game/");
        assert_eq!(translator.to_content_path("/Game/maps/Arena.Arena", ".umap").map(|p| p.to_string()), Some("Content/maps/Arena.umap".to_string()));
        assert_eq!(translator.to_content_path("/Engine/Foo", ".uasset"), None);
    }

    #[test]
    fn test_strip_extension() {
        assert_eq!(strip_extension("a.b/c.uasset"), "a.b/c");
        assert_eq!(strip_extension("a.b/c"), "a.b/c");
        assert_eq!(strip_extension("dir/.hidden"), "dir/.hidden");
    }
}
