//! Post-write verification.
//!
//! Re-reads the written device and compares a SHA-256 over exactly the bytes
//! the write engine hashed. Requires the digest and byte count retained from
//! the WRITE earlier in the same session.

use std::io::Read;

use anyhow::{bail, Context, Result};
use log::info;
use sha2::{Digest, Sha256};

use crate::error::HelperError;
use crate::progress::ProgressPacer;
use crate::protocol::ProgressKind;
use crate::writer::device::normalize_device_path;
use crate::writer::CHUNK_BYTES;

/// Read `total_bytes` back from `device_path` and compare the digest with
/// the hash retained from the write.
pub fn verify_image(
    device_path: &str,
    total_bytes: u64,
    expected: &[u8; 32],
    pacer: &mut ProgressPacer<'_>,
) -> Result<()> {
    if total_bytes == 0 {
        bail!("nothing to verify: no bytes were written in this session");
    }

    let path = normalize_device_path(device_path);
    let mut device = std::fs::OpenOptions::new()
        .read(true)
        .open(&path)
        .with_context(|| format!("cannot open {path} for verification"))?;

    pacer.force(ProgressKind::Verify, 0, total_bytes)?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut verified: u64 = 0;
    while verified < total_bytes {
        let want = ((total_bytes - verified) as usize).min(CHUNK_BYTES);
        device
            .read_exact(&mut buf[..want])
            .with_context(|| format!("device read failed at offset {verified}"))?;
        hasher.update(&buf[..want]);
        verified += want as u64;
        pacer.tick(ProgressKind::Verify, verified, total_bytes)?;
    }
    pacer.force(ProgressKind::Verify, total_bytes, total_bytes)?;

    let actual: [u8; 32] = hasher.finalize().into();
    if &actual != expected {
        return Err(HelperError::VerificationMismatch {
            expected: hex(expected),
            actual: hex(&actual),
        }
        .into());
    }

    info!("verification passed for {total_bytes} bytes on {device_path}");
    Ok(())
}

fn hex(digest: &[u8; 32]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
