//! FAT access to the boot partition of a written image.
//!
//! The device is opened whole; a partition-bounded proxy translates all file
//! offsets so `fatfs` only ever sees the first partition. Devices without a
//! partition table (bare FAT images, as used by the tests) are mounted from
//! offset zero.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::writer::device::normalize_device_path;

const SECTOR_BYTES: u64 = 512;
const MBR_SIGNATURE: u16 = 0xAA55;
const PARTITION_TABLE_OFFSET: usize = 446;

/// Byte range of the first partition, if the device carries an MBR.
fn first_partition_extent(boot_sector: &[u8; 512]) -> Option<(u64, u64)> {
    if LittleEndian::read_u16(&boot_sector[510..512]) != MBR_SIGNATURE {
        return None;
    }
    let entry = &boot_sector[PARTITION_TABLE_OFFSET..PARTITION_TABLE_OFFSET + 16];
    let partition_type = entry[4];
    let start_lba = LittleEndian::read_u32(&entry[8..12]) as u64;
    let total_sectors = LittleEndian::read_u32(&entry[12..16]) as u64;
    if partition_type == 0 || total_sectors == 0 {
        return None;
    }
    Some((start_lba * SECTOR_BYTES, total_sectors * SECTOR_BYTES))
}

/// Read/Write/Seek view of a byte range inside a larger file.
///
/// Every operation seeks the underlying file to the translated position, so
/// the proxy never goes stale when the inner handle moves.
pub struct PartitionSlice<T> {
    inner: T,
    offset: u64,
    len: u64,
    pos: u64,
}

impl<T> PartitionSlice<T> {
    pub fn new(inner: T, offset: u64, len: u64) -> Self {
        Self {
            inner,
            offset,
            len,
            pos: 0,
        }
    }

    fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }
}

impl<T: Read + Seek> Read for PartitionSlice<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let allowed = self.remaining().min(buf.len() as u64) as usize;
        if allowed == 0 {
            return Ok(0);
        }
        self.inner.seek(SeekFrom::Start(self.offset + self.pos))?;
        let n = self.inner.read(&mut buf[..allowed])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<T: Write + Seek> Write for PartitionSlice<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let allowed = self.remaining().min(buf.len() as u64) as usize;
        if allowed == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past the end of the partition",
            ));
        }
        self.inner.seek(SeekFrom::Start(self.offset + self.pos))?;
        let n = self.inner.write(&buf[..allowed])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<T: Seek> Seek for PartitionSlice<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.len as i64 + d,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the partition",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// The boot partition mounted as a FAT filesystem.
pub struct BootFilesystem {
    fs: fatfs::FileSystem<PartitionSlice<File>>,
}

impl BootFilesystem {
    /// Open the boot partition of `device_path`.
    pub fn open(device_path: &str) -> Result<Self> {
        let path = normalize_device_path(device_path);
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("cannot open {path} for FAT access"))?;

        let mut boot_sector = [0u8; 512];
        file.read_exact(&mut boot_sector)
            .with_context(|| format!("cannot read the first sector of {path}"))?;

        let (offset, len) = match first_partition_extent(&boot_sector) {
            Some(extent) => extent,
            None => {
                // No table: treat the whole device as one FAT volume
                let len = file.seek(SeekFrom::End(0)).context("cannot size device")?;
                (0, len)
            }
        };
        debug!("mounting FAT volume at offset {offset}, length {len}");

        let slice = PartitionSlice::new(file, offset, len);
        let fs = fatfs::FileSystem::new(slice, fatfs::FsOptions::new())
            .with_context(|| format!("no FAT filesystem on {path}"))?;
        Ok(Self { fs })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.fs.root_dir().open_file(name).is_ok()
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let mut file = self
            .fs
            .root_dir()
            .open_file(name)
            .map_err(|e| anyhow!("cannot open {name}: {e}"))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .with_context(|| format!("cannot read {name}"))?;
        Ok(data)
    }

    pub fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let root = self.fs.root_dir();
        let mut file = root
            .create_file(name)
            .map_err(|e| anyhow!("cannot create {name}: {e}"))?;
        file.truncate()
            .with_context(|| format!("cannot truncate {name}"))?;
        file.write_all(data)
            .with_context(|| format!("cannot write {name}"))?;
        file.flush().with_context(|| format!("cannot flush {name}"))?;
        Ok(())
    }

    /// Flush everything back to the device.
    pub fn sync(self) -> Result<()> {
        self.fs.unmount().context("FAT unmount failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn slice_bounds_reads_and_writes() {
        let backing = Cursor::new(vec![0u8; 4096]);
        let mut slice = PartitionSlice::new(backing, 1024, 512);

        slice.write_all(&[0xAB; 512]).unwrap();
        assert!(slice.write_all(&[0x01]).is_err());

        slice.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = vec![0u8; 1024];
        let n = slice.read(&mut buf).unwrap();
        assert_eq!(n, 512);
        assert!(buf[..512].iter().all(|&b| b == 0xAB));

        let inner = slice.inner.into_inner();
        assert!(inner[..1024].iter().all(|&b| b == 0));
        assert!(inner[1024..1536].iter().all(|&b| b == 0xAB));
        assert!(inner[1536..].iter().all(|&b| b == 0));
    }

    #[test]
    fn slice_rejects_negative_seek() {
        let backing = Cursor::new(vec![0u8; 64]);
        let mut slice = PartitionSlice::new(backing, 0, 64);
        assert!(slice.seek(SeekFrom::Current(-1)).is_err());
    }

    #[test]
    fn partition_extent_parsing() {
        let mut sector = [0u8; 512];
        LittleEndian::write_u16(&mut sector[510..512], MBR_SIGNATURE);
        let entry = &mut sector[PARTITION_TABLE_OFFSET..PARTITION_TABLE_OFFSET + 16];
        entry[4] = 0x0C; // FAT32 (LBA)
        LittleEndian::write_u32(&mut entry[8..12], 2048);
        LittleEndian::write_u32(&mut entry[12..16], 4096);

        assert_eq!(
            first_partition_extent(&sector),
            Some((2048 * 512, 4096 * 512))
        );
    }

    #[test]
    fn missing_signature_means_no_table() {
        let sector = [0u8; 512];
        assert_eq!(first_partition_extent(&sector), None);
    }

    #[test]
    fn empty_entry_means_no_table() {
        let mut sector = [0u8; 512];
        LittleEndian::write_u16(&mut sector[510..512], MBR_SIGNATURE);
        assert_eq!(first_partition_extent(&sector), None);
    }
}
