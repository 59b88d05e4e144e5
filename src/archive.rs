use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use log::debug;
use thiserror::Error;

use crate::paths::Paths;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors from installing, exporting, deleting or renaming containers on
/// disk.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The target container name is already taken.
    #[error("container '{0}' already exists")]
    AlreadyExists(String),
    /// The named container has no directory on disk.
    #[error("container '{0}' is not installed")]
    NotInstalled(String),
    /// A path argument does not name a usable file.
    #[error("invalid path '{0}'")]
    InvalidPath(String),
    /// A file operation hit a directory.
    #[error("'{0}' is a directory")]
    IsADirectory(String),
    /// Underlying filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Unpack `archive` into a fresh container directory named `name`.
///
/// Plain and gzip-compressed tars are both accepted; partial unpacks are
/// cleaned up so a failed install leaves nothing behind.
pub fn install(paths: &Paths, archive: &Path, name: &str) -> Result<(), ArchiveError> {
    if archive.is_dir() {
        return Err(ArchiveError::IsADirectory(archive.display().to_string()));
    }
    if !archive.is_file() {
        return Err(ArchiveError::InvalidPath(archive.display().to_string()));
    }
    let dir = paths.container_dir(name);
    if dir.exists() {
        return Err(ArchiveError::AlreadyExists(name.to_string()));
    }

    fs::create_dir_all(&dir)?;
    match unpack(archive, &dir) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("install of '{name}' failed, removing partial directory");
            let _ = fs::remove_dir_all(&dir);
            Err(e.into())
        }
    }
}

fn unpack(archive: &Path, dir: &Path) -> io::Result<()> {
    let mut file = File::open(archive)?;
    let mut magic = [0u8; 2];
    let gzipped = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(_) => false,
    };
    file.seek(SeekFrom::Start(0))?;

    if gzipped {
        tar::Archive::new(GzDecoder::new(file)).unpack(dir)
    } else {
        tar::Archive::new(file).unpack(dir)
    }
}

/// Export a stopped container's `config.json` and `hdd.qcow2` as a tar at
/// `out`.
pub fn export(paths: &Paths, name: &str, out: &Path) -> Result<(), ArchiveError> {
    let dir = paths.container_dir(name);
    if !dir.is_dir() {
        return Err(ArchiveError::NotInstalled(name.to_string()));
    }
    for file in [paths.container_config(name), paths.container_disk(name)] {
        if !file.is_file() {
            return Err(ArchiveError::InvalidPath(file.display().to_string()));
        }
    }

    let file =
        File::create(out).map_err(|_| ArchiveError::InvalidPath(out.display().to_string()))?;
    let mut builder = tar::Builder::new(file);
    builder.append_path_with_name(paths.container_config(name), "config.json")?;
    builder.append_path_with_name(paths.container_disk(name), "hdd.qcow2")?;
    builder.finish()?;
    Ok(())
}

/// Recursively remove a stopped container's directory.
pub fn delete(paths: &Paths, name: &str) -> Result<(), ArchiveError> {
    let dir = paths.container_dir(name);
    if !dir.is_dir() {
        return Err(ArchiveError::NotInstalled(name.to_string()));
    }
    fs::remove_dir_all(dir)?;
    Ok(())
}

/// Rename a stopped container's directory.
pub fn rename(paths: &Paths, old: &str, new: &str) -> Result<(), ArchiveError> {
    let src = paths.container_dir(old);
    if !src.is_dir() {
        return Err(ArchiveError::NotInstalled(old.to_string()));
    }
    let dst = paths.container_dir(new);
    if dst.exists() {
        return Err(ArchiveError::AlreadyExists(new.to_string()));
    }
    fs::rename(src, dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn setup() -> (Paths, TempDir) {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_home(tmp.path());
        fs::create_dir_all(paths.container_home()).unwrap();
        (paths, tmp)
    }

    fn fake_container(paths: &Paths, name: &str) {
        fs::create_dir_all(paths.container_dir(name)).unwrap();
        fs::write(paths.container_config(name), b"{\"demo\": true}").unwrap();
        fs::write(paths.container_disk(name), b"not a real qcow2").unwrap();
    }

    #[test]
    fn test_export_then_install_round_trips_config() {
        let (paths, tmp) = setup();
        fake_container(&paths, "demo");
        let out = tmp.path().join("demo.tar");
        export(&paths, "demo", &out).unwrap();

        install(&paths, &out, "copy").unwrap();
        let original = fs::read(paths.container_config("demo")).unwrap();
        let copied = fs::read(paths.container_config("copy")).unwrap();
        assert_eq!(original, copied);
        assert!(paths.container_disk("copy").is_file());
    }

    #[test]
    fn test_install_rejects_existing_name() {
        let (paths, tmp) = setup();
        fake_container(&paths, "demo");
        let out = tmp.path().join("demo.tar");
        export(&paths, "demo", &out).unwrap();
        let err = install(&paths, &out, "demo").unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyExists(_)));
    }

    #[test]
    fn test_install_accepts_gzip() {
        let (paths, tmp) = setup();
        fake_container(&paths, "demo");
        let tar_path = tmp.path().join("demo.tar");
        export(&paths, "demo", &tar_path).unwrap();

        let gz_path = tmp.path().join("demo.tar.gz");
        let mut encoder = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
        encoder.write_all(&fs::read(&tar_path).unwrap()).unwrap();
        encoder.finish().unwrap();

        install(&paths, &gz_path, "fromgz").unwrap();
        assert!(paths.container_config("fromgz").is_file());
    }

    #[test]
    fn test_install_missing_archive() {
        let (paths, tmp) = setup();
        let err = install(&paths, &tmp.path().join("nope.tar"), "x").unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidPath(_)));
    }

    #[test]
    fn test_install_directory_as_archive() {
        let (paths, tmp) = setup();
        let err = install(&paths, tmp.path(), "x").unwrap_err();
        assert!(matches!(err, ArchiveError::IsADirectory(_)));
    }

    #[test]
    fn test_install_cleans_up_partial_unpack() {
        let (paths, tmp) = setup();
        let bogus = tmp.path().join("bogus.tar");
        fs::write(&bogus, b"definitely not a tar archive").unwrap();
        assert!(install(&paths, &bogus, "broken").is_err());
        assert!(!paths.container_dir("broken").exists());
    }

    #[test]
    fn test_delete_removes_directory() {
        let (paths, _tmp) = setup();
        fake_container(&paths, "demo");
        delete(&paths, "demo").unwrap();
        assert!(!paths.container_dir("demo").exists());
    }

    #[test]
    fn test_delete_unknown_container() {
        let (paths, _tmp) = setup();
        let err = delete(&paths, "ghost").unwrap_err();
        assert!(matches!(err, ArchiveError::NotInstalled(_)));
    }

    #[test]
    fn test_rename_moves_directory() {
        let (paths, _tmp) = setup();
        fake_container(&paths, "old");
        rename(&paths, "old", "new").unwrap();
        assert!(!paths.container_dir("old").exists());
        assert!(paths.container_config("new").is_file());
    }

    #[test]
    fn test_rename_refuses_to_clobber() {
        let (paths, _tmp) = setup();
        fake_container(&paths, "a");
        fake_container(&paths, "b");
        let err = rename(&paths, "a", "b").unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyExists(_)));
    }
}
