use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs_err as fs;
use tracing::debug;

use crate::{AesKey, PakError, Result, make_standard_directory, to_ue_path};

/// Directory index and entry access for an opened archive. Entry names are
/// relative to the archive's own mount point.
pub trait PakArchive: Send {
    fn mount_point(&self) -> &str;
    fn files(&self) -> Vec<String>;
    fn read(&self, entry: &str) -> Result<Vec<u8>>;
    fn contains(&self, entry: &str) -> bool {
        self.files().iter().any(|f| f.eq_ignore_ascii_case(entry))
    }
}

/// A `.pak` file read with repak.
pub struct RepakArchive {
    pak: repak::PakReader,
    file: Mutex<BufReader<fs::File>>,
}
impl RepakArchive {
    pub fn open<P: Into<PathBuf>>(path: P, key: Option<&AesKey>) -> Result<Self> {
        let mut file = BufReader::new(fs::File::open(path.into())?);
        let mut builder = repak::PakBuilder::new();
        if let Some(key) = key {
            builder = builder.key(key.0.clone());
        }
        let pak = builder.reader(&mut file)?;
        debug!(target: "pakloader", "Opened pak version {:?}, mount point {}", pak.version(), pak.mount_point());
        Ok(Self { pak, file: Mutex::new(file) })
    }
}
impl PakArchive for RepakArchive {
    fn mount_point(&self) -> &str {
        self.pak.mount_point()
    }
    fn files(&self) -> Vec<String> {
        self.pak.files()
    }
    fn read(&self, entry: &str) -> Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        match self.pak.get(entry, &mut *file) {
            Ok(data) => Ok(data),
            Err(repak::Error::MissingEntry(_)) => Err(PakError::NotFound(entry.to_string())),
            Err(err) => Err(err.into()),
        }
    }
}

/// A loose directory served as if it were a pak.
pub struct DirectoryArchive {
    dir: PathBuf,
    mount_point: String,
}
impl DirectoryArchive {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        let dir = dir.into();
        let mount_point = make_standard_directory(to_ue_path(&dir).as_str());
        Self { dir, mount_point }
    }
}
impl PakArchive for DirectoryArchive {
    fn mount_point(&self) -> &str {
        &self.mount_point
    }
    fn files(&self) -> Vec<String> {
        fn visit_dirs<F>(dir: &Path, cb: &mut F) -> std::io::Result<()>
        where
            F: FnMut(&Path),
        {
            if dir.is_dir() {
                for entry in fs::read_dir(dir)? {
                    let path = entry?.path();
                    if path.is_dir() {
                        visit_dirs(&path, cb)?;
                    } else {
                        cb(&path);
                    }
                }
            }
            Ok(())
        }

        let mut files = vec![];
        let result = visit_dirs(&self.dir, &mut |path| {
            if let Ok(relative) = path.strip_prefix(&self.dir) {
                files.push(to_ue_path(relative).to_string());
            }
        });
        if let Err(err) = result {
            debug!(target: "pakloader", "Couldn't list {}: {err}", self.dir.display());
        }
        files.sort();
        files
    }
    fn read(&self, entry: &str) -> Result<Vec<u8>> {
        match fs::read(self.dir.join(entry)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(PakError::NotFound(entry.to_string())),
            Err(err) => Err(err.into()),
        }
    }
    fn contains(&self, entry: &str) -> bool {
        self.dir.join(entry).is_file()
    }
}

/// Opens the archive a mount request refers to.
pub trait PakOpener: Send {
    fn open(&self, path: &Path) -> Result<Box<dyn PakArchive>>;
}

/// Directories open as [`DirectoryArchive`], anything else as [`RepakArchive`].
#[derive(Default)]
pub struct DefaultOpener {
    key: Option<AesKey>,
}
impl DefaultOpener {
    pub fn new(key: Option<AesKey>) -> Self {
        Self { key }
    }
}
impl PakOpener for DefaultOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn PakArchive>> {
        Ok(if path.is_dir() {
            Box::new(DirectoryArchive::new(path))
        } else {
            Box::new(RepakArchive::open(path, self.key.as_ref())?)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_directory_archive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("maps"))?;
        fs::write(dir.path().join("maps/Arena.umap"), b"arena")?;
        fs::write(dir.path().join("Turret.uasset"), b"turret")?;

        let archive = DefaultOpener::default().open(dir.path())?;
        assert_eq!(archive.files(), vec!["Turret.uasset".to_string(), "maps/Arena.umap".to_string()]);
        assert_eq!(archive.read("maps/Arena.umap")?, b"arena");
        assert!(archive.contains("Turret.uasset"));
        assert!(matches!(archive.read("missing.uasset"), Err(PakError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_repak_archive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pak_path = dir.path().join("content.pak");
        {
            let file = std::io::BufWriter::new(fs::File::create(&pak_path)?);
            let mut writer = repak::PakBuilder::new().writer(file, repak::Version::V11, "../../../Game/Content/".to_string(), None);
            writer.write_file("maps/Arena.umap", false, b"arena")?;
            writer.write_file("bp/Turret.uasset", false, b"turret")?;
            writer.write_index()?;
        }

        let archive = RepakArchive::open(&pak_path, None)?;
        assert_eq!(archive.mount_point(), "../../../Game/Content/");
        let mut files = archive.files();
        files.sort();
        assert_eq!(files, vec!["bp/Turret.uasset".to_string(), "maps/Arena.umap".to_string()]);
        assert_eq!(archive.read("bp/Turret.uasset")?, b"turret");
        assert!(matches!(archive.read("bp/Missing.uasset"), Err(PakError::NotFound(_))));
        Ok(())
    }
}
