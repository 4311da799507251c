//! `std::fs` backed storage used by the host simulator and, on the device, on
//! top of the mounted SPIFFS partition.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use crate::hal::{ConfigStorage, Filesystem, FsInfo, HalError, HalResult};

/// Config region persisted as a single file. A missing file reads as erased
/// flash.
#[derive(Debug, Clone)]
pub struct FileRegion {
    path: PathBuf,
}

impl FileRegion {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigStorage for FileRegion {
    fn read_region(&mut self, buf: &mut [u8]) -> HalResult<()> {
        buf.fill(0xFF);
        match fs::read(&self.path) {
            Ok(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(HalError::Storage(format!(
                "read {}: {err}",
                self.path.display()
            ))),
        }
    }

    fn write_region(&mut self, data: &[u8]) -> HalResult<()> {
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, data)
            .and_then(|()| fs::rename(&staging, &self.path))
            .map_err(|err| HalError::Storage(format!("write {}: {err}", self.path.display())))
    }
}

/// Flat filesystem rooted at a directory. Paths are absolute within the root.
#[derive(Debug, Clone)]
pub struct DirFs {
    root: PathBuf,
    capacity: u64,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            root: root.into(),
            capacity,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> HalResult<PathBuf> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "..") {
            return Err(HalError::fs(
                path,
                std::io::Error::new(ErrorKind::InvalidInput, "path escapes filesystem root"),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn used_bytes(&self) -> u64 {
        fn walk(dir: &Path) -> u64 {
            let Ok(entries) = fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|entry| match entry.metadata() {
                    Ok(meta) if meta.is_dir() => walk(&entry.path()),
                    Ok(meta) => meta.len(),
                    Err(_) => 0,
                })
                .sum()
        }
        walk(&self.root)
    }
}

impl Filesystem for DirFs {
    fn read(&self, path: &str) -> HalResult<Vec<u8>> {
        fs::read(self.resolve(path)?).map_err(|err| HalError::fs(path, err))
    }

    fn write(&self, path: &str, data: &[u8]) -> HalResult<()> {
        fs::write(self.resolve(path)?, data).map_err(|err| HalError::fs(path, err))
    }

    fn append(&self, path: &str, data: &[u8]) -> HalResult<()> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.resolve(path)?)
            .and_then(|mut file| file.write_all(data))
            .map_err(|err| HalError::fs(path, err))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|resolved| resolved.is_file())
    }

    fn remove(&self, path: &str) -> HalResult<()> {
        fs::remove_file(self.resolve(path)?).map_err(|err| HalError::fs(path, err))
    }

    fn rename(&self, from: &str, to: &str) -> HalResult<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?).map_err(|err| HalError::fs(from, err))
    }

    fn info(&self) -> HalResult<FsInfo> {
        Ok(FsInfo {
            total_bytes: self.capacity,
            used_bytes: self.used_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::device_config::{self, DeviceConfig, REGION_SIZE};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "irblaster-storage-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_region_file_reads_as_erased_flash() {
        let dir = scratch_dir("erased");
        let mut region = FileRegion::new(dir.join("config.bin"));

        let mut buf = [0_u8; REGION_SIZE];
        region.read_region(&mut buf).unwrap();
        assert!(buf.iter().all(|byte| *byte == 0xFF));
        assert_eq!(device_config::load(&mut region).unwrap(), DeviceConfig::default());
    }

    #[test]
    fn region_file_persists_config() {
        let dir = scratch_dir("persist");
        let path = dir.join("config.bin");
        let config = DeviceConfig::new("den", "HomeNet", "secret");

        device_config::save(&mut FileRegion::new(&path), &config).unwrap();
        let loaded = device_config::load(&mut FileRegion::new(&path)).unwrap();

        assert_eq!(loaded, config);
        assert_eq!(fs::metadata(&path).unwrap().len(), REGION_SIZE as u64);
    }

    #[test]
    fn dir_fs_supports_append_and_rename() {
        let dir = scratch_dir("dirfs");
        let fs_root = DirFs::new(&dir, 1_000_000);

        fs_root.append("/signals.txt", b"a\n").unwrap();
        fs_root.append("/signals.txt", b"b\n").unwrap();
        assert_eq!(fs_root.read("/signals.txt").unwrap(), b"a\nb\n");

        fs_root.write("/page.html.new", b"new").unwrap();
        fs_root.rename("/page.html.new", "/page.html").unwrap();
        assert!(fs_root.exists("/page.html"));
        assert!(!fs_root.exists("/page.html.new"));

        let info = fs_root.info().unwrap();
        assert_eq!(info.used_bytes, 7);
        assert_eq!(info.free_bytes(), 1_000_000 - 7);
    }

    #[test]
    fn dir_fs_missing_file_is_not_found_and_escapes_are_rejected() {
        let dir = scratch_dir("escape");
        let fs_root = DirFs::new(&dir, 1_000);

        assert!(fs_root.read("/nope").unwrap_err().is_not_found());
        assert!(fs_root.read("/../etc/passwd").is_err());
        assert!(!fs_root.exists("/../etc/passwd"));
    }
}
