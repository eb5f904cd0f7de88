//! Raw-device write engine.
//!
//! The image body is streamed in 10 MiB chunks while the first sector is
//! held back and written last, so the OS cannot start mounting partitions
//! from a half-written disk. A rolling SHA-256 over the source bytes is
//! produced as a side effect and kept for a later VERIFY.

pub mod device;
pub mod diskpart;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::progress::ProgressPacer;
use crate::protocol::ProgressKind;
use device::DeviceHandle;
use diskpart::DiskManagement;

/// Streaming chunk size.
pub const CHUNK_BYTES: usize = 10 * 1024 * 1024;

const MBR_BYTES: usize = 512;
const WRITE_RETRY_PAUSE: Duration = Duration::from_secs(1);
const MBR_RETRY_PAUSE: Duration = Duration::from_millis(500);
const POST_CLOSE_SETTLE: Duration = Duration::from_secs(2);

/// Outcome of a completed write.
pub struct WriteReport {
    pub total_bytes: u64,
    pub digest: [u8; 32],
}

/// Full write pipeline: prepare the disk, acquire the device, stream the
/// image, finish the MBR, and repair partition visibility.
pub fn write_image(
    source_path: &Path,
    device_path: &str,
    disk: &dyn DiskManagement,
    pacer: &mut ProgressPacer<'_>,
) -> Result<WriteReport> {
    let mut source = File::open(source_path)
        .with_context(|| format!("cannot open source image {}", source_path.display()))?;
    let total_bytes = source
        .metadata()
        .with_context(|| format!("cannot stat {}", source_path.display()))?
        .len();

    pacer.force(ProgressKind::Write, 0, total_bytes)?;

    let drive_number = device::parse_physical_drive_number(device_path);
    if let Some(n) = drive_number {
        info!("preparing physical drive {n} for raw write");
        disk.prepare_disk(n)?;
    }

    let mut dev = acquire_device(device_path, drive_number.is_some())?;
    info!(
        "writing {} bytes to {} (sector size {})",
        total_bytes,
        device_path,
        dev.sector_size()
    );

    let sector_size = dev.sector_size();
    let report = stream_image(&mut source, dev.file_mut(), total_bytes, sector_size, pacer)?;

    // Bytes written in full is the success criterion; a failed flush is only
    // worth a warning.
    if let Err(e) = dev.file_mut().sync_all() {
        warn!("flush after write failed: {e}");
    }

    if let Some(n) = drive_number {
        drop(dev);
        std::thread::sleep(POST_CLOSE_SETTLE);
        disk.rescan_and_assign(n)?;
    } else {
        dev.unlock_volume();
    }

    Ok(report)
}

#[cfg(windows)]
fn acquire_device(device_path: &str, physical: bool) -> Result<DeviceHandle> {
    if physical {
        let mut dev = DeviceHandle::open_physical(device_path)?;
        dev.allow_extended_dasd();
        dev.lock_volume();
        dev.dismount_volume();
        Ok(dev)
    } else {
        Ok(DeviceHandle::open_volume(device_path)?)
    }
}

#[cfg(not(windows))]
fn acquire_device(device_path: &str, _physical: bool) -> Result<DeviceHandle> {
    Ok(DeviceHandle::open_path(device_path)?)
}

/// Stream `total_bytes` from `source` into `target`.
///
/// When the source is at least one sector long, the first 512 bytes are
/// captured up front and written only after the body completes. If the
/// target cannot seek, the engine degrades to a strictly sequential write
/// with the first sector in its natural position.
pub fn stream_image<R: Read, W: Write + Seek>(
    source: &mut R,
    target: &mut W,
    total_bytes: u64,
    sector_size: u32,
    pacer: &mut ProgressPacer<'_>,
) -> Result<WriteReport> {
    let sector = sector_size.max(1) as usize;
    let mut hasher = Sha256::new();
    let mut bytes_written: u64 = 0;

    // Two independent facts about this write: whether the boot sector is
    // held back for the end, and whether the target can be repositioned.
    // Retry eligibility tracks the latter, never the image size.
    let mut deferred_mbr: Option<Vec<u8>> = None;
    let mut can_reposition = true;

    if total_bytes >= MBR_BYTES as u64 {
        let mut mbr = vec![0u8; MBR_BYTES];
        source
            .read_exact(&mut mbr)
            .context("cannot read the first sector of the source")?;
        hasher.update(&mbr);
        match target.seek(SeekFrom::Start(MBR_BYTES as u64)) {
            Ok(_) => deferred_mbr = Some(mbr),
            Err(e) => {
                warn!("target is not seekable ({e}), writing strictly sequentially");
                can_reposition = false;
                write_chunk(target, None, &mbr)?;
                bytes_written = MBR_BYTES as u64;
            }
        }
    } else if let Err(e) = target.seek(SeekFrom::Start(0)) {
        debug!("target is not seekable ({e})");
        can_reposition = false;
    }

    let mut buf = vec![0u8; CHUNK_BYTES + sector];
    let body_offset = if deferred_mbr.is_some() { MBR_BYTES as u64 } else { 0 };

    loop {
        let n = read_full(source, &mut buf[..CHUNK_BYTES])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);

        // Round the write up to a sector multiple; the zero tail is written
        // but never hashed.
        let write_len = round_up(n, sector);
        buf[n..write_len].fill(0);

        let offset = if can_reposition {
            Some(bytes_written + body_offset)
        } else {
            None
        };
        write_chunk(target, offset, &buf[..write_len])?;
        bytes_written += n as u64;
        pacer.tick(ProgressKind::Write, bytes_written, total_bytes)?;
    }

    if let Some(mbr) = deferred_mbr {
        write_mbr_last(target, &mbr, sector)?;
    }

    pacer.force(ProgressKind::Write, total_bytes, total_bytes)?;

    Ok(WriteReport {
        total_bytes,
        digest: hasher.finalize().into(),
    })
}

/// Write one chunk, retrying once after a pause. `offset` is where the
/// chunk belongs when the target can be repositioned; without it the retry
/// still happens, it just cannot re-seek first.
fn write_chunk<W: Write + Seek>(target: &mut W, offset: Option<u64>, data: &[u8]) -> Result<()> {
    for attempt in 0..2 {
        if let Some(off) = offset {
            target
                .seek(SeekFrom::Start(off))
                .context("seek before chunk write failed")?;
        }
        match target.write_all(data) {
            Ok(()) => return Ok(()),
            Err(e) if attempt == 0 => {
                warn!("chunk write failed ({e}), retrying once");
                std::thread::sleep(WRITE_RETRY_PAUSE);
            }
            Err(e) => {
                return Err(crate::error::HelperError::WriteFailed(e.to_string()).into());
            }
        }
    }
    unreachable!("write_chunk loops at most twice")
}

/// Write the held-back first sector, padded to the sector size. Up to three
/// attempts with a short pause between them.
fn write_mbr_last<W: Write + Seek>(target: &mut W, mbr: &[u8], sector: usize) -> Result<()> {
    let mut padded = mbr.to_vec();
    padded.resize(round_up(mbr.len(), sector), 0);

    let mut last_err = None;
    for attempt in 0..3 {
        if attempt > 0 {
            std::thread::sleep(MBR_RETRY_PAUSE);
        }
        let result = target
            .seek(SeekFrom::Start(0))
            .and_then(|_| target.write_all(&padded));
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("final boot-sector write failed (attempt {}): {e}", attempt + 1);
                last_err = Some(e);
            }
        }
    }
    let e = last_err.unwrap();
    Err(crate::error::HelperError::WriteFailed(format!("boot sector: {e}")).into())
}

fn read_full(source: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source
            .read(&mut buf[filled..])
            .context("source read failed")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}
