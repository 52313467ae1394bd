//! Block devices backed by image files or device nodes

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use super::{BlockDevice, DeviceId, IoStats, SECTOR_SIZE};

/// A file treated as a block device
pub struct FileDevice {
    id: DeviceId,
    name: String,
    path: PathBuf,
    file: File,
    sectors: u64,
    stats: IoStats,
}

impl FileDevice {
    /// Open `path` read-write under the given identity
    pub fn open<P: AsRef<Path>>(path: P, id: DeviceId) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let sectors = file.metadata()?.len() / SECTOR_SIZE;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(FileDevice {
            id,
            name,
            path,
            file,
            sectors,
            stats: IoStats::default(),
        })
    }

    /// Path this device was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn whole_disk(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size_sectors(&self) -> u64 {
        self.sectors
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)?;
        self.stats.record_read(buf.len() as u64 / SECTOR_SIZE);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)?;
        self.stats.record_write(buf.len() as u64 / SECTOR_SIZE);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn stats(&self) -> &IoStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_device_io() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(64 * SECTOR_SIZE).unwrap();

        let dev = FileDevice::open(tmp.path(), DeviceId::new(7, 0)).unwrap();
        assert_eq!(dev.size_sectors(), 64);

        dev.write_at(&[0xabu8; 1024], 4096).unwrap();
        dev.flush().unwrap();

        let mut buf = [0u8; 1024];
        dev.read_at(&mut buf, 4096).unwrap();
        assert!(buf.iter().all(|b| *b == 0xab));
        assert_eq!(dev.stats().sectors_written(), 2);
    }

    #[test]
    fn test_short_read_fails() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(SECTOR_SIZE).unwrap();
        let dev = FileDevice::open(tmp.path(), DeviceId::new(7, 1)).unwrap();

        let mut buf = [0u8; 1024];
        assert!(dev.read_at(&mut buf, 0).is_err());
    }
}
