pub mod archive;
pub mod config;
pub mod error;
pub mod fetch;
pub mod level_streaming;
pub mod loader;
pub mod logging;
pub mod mount;
pub mod objects;
pub mod package_name;
pub mod platform;
pub mod platform_file;
pub mod streamable;
pub mod translate;

use std::path::Path;

use anyhow::Context as _;

pub use config::Config;
pub use error::{PakError, Result};
pub use loader::PakLoader;
pub use mount::{MountRecord, PakMountService, UnmountPolicy};
pub use translate::{AssetPathTranslator, AssetReference};

// UTF-8 path with '/' as separator
pub type UEPath = typed_path::Utf8UnixPath;
pub type UEPathBuf = typed_path::Utf8UnixPathBuf;

pub fn to_ue_path(path: &Path) -> UEPathBuf {
    UEPathBuf::from(path.to_string_lossy().replace('\\', "/"))
}

/// Normalizes a logical path to the standard form: forward slashes, no empty
/// or `.` segments, and `dir/..` pairs collapsed where a parent is known.
/// Leading `..` segments are kept, as are a leading `/` and a trailing `/`.
pub fn make_standard_filename(path: &str) -> String {
    let path = path.replace('\\', "/");
    let absolute = path.starts_with('/');
    let trailing = path.len() > 1 && path.ends_with('/');

    let mut parts: Vec<&str> = vec![];
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            part => parts.push(part),
        }
    }

    let mut out = parts.join("/");
    if absolute {
        out.insert(0, '/');
    }
    if trailing && !out.ends_with('/') {
        out.push('/');
    }
    out
}

/// Same as [`make_standard_filename`] but guarantees a trailing `/` (used for
/// directories such as mount points and content roots).
pub fn make_standard_directory(path: &str) -> String {
    let mut dir = make_standard_filename(path);
    if !dir.is_empty() && !dir.ends_with('/') {
        dir.push('/');
    }
    dir
}

pub(crate) fn ends_with_ignore_case(s: &str, suffix: &str) -> bool {
    s.len() >= suffix.len() && s.is_char_boundary(s.len() - suffix.len()) && s[s.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

pub(crate) fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s.is_char_boundary(prefix.len()) && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct AesKey(pub(crate) aes::Aes256);
impl std::str::FromStr for AesKey {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        use aes::cipher::KeyInit;
        use base64::{Engine as _, engine::general_purpose};
        let try_parse = |bytes: Vec<_>| aes::Aes256::new_from_slice(&bytes).ok().map(AesKey);
        hex::decode(s.strip_prefix("0x").unwrap_or(s))
            .ok()
            .and_then(try_parse)
            .or_else(|| general_purpose::STANDARD_NO_PAD.decode(s.trim_end_matches('=')).ok().and_then(try_parse))
            .context("invalid AES key")
    }
}
