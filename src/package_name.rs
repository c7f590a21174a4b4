//! Helpers for long package names (`/Game/maps/Arena`) and object paths
//! (`/Game/maps/Arena.Arena`).

/// `/Game/maps/Arena.Arena` -> `/Game/maps/Arena`
pub fn object_path_to_package_name(object_path: &str) -> &str {
    match object_path.find(['.', ':']) {
        Some(index) => &object_path[..index],
        None => object_path,
    }
}

/// `/Game/maps/Arena` -> `Arena`
pub fn short_name(package_name: &str) -> &str {
    match package_name.rfind('/') {
        Some(index) => &package_name[index + 1..],
        None => package_name,
    }
}

/// `/Game/maps/Arena` -> `/Game/maps`
pub fn long_package_path(package_name: &str) -> &str {
    match package_name.rfind('/') {
        Some(index) => &package_name[..index],
        None => "",
    }
}

pub fn is_short_package_name(name: &str) -> bool {
    !name.contains('/')
}

/// `/Game/maps/Arena` -> `/Game/maps/Arena.Arena`
pub fn object_path(package_name: &str) -> String {
    format!("{package_name}.{}", short_name(package_name))
}

/// Splits a reference into `(package, object)`. A bare package name refers to
/// the object named after the package.
pub fn split_object_path(reference: &str) -> (&str, &str) {
    match reference.split_once('.') {
        Some((package, object)) => (package, object),
        None => (reference, short_name(reference)),
    }
}
