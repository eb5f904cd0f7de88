//! Partition-table bookkeeping behind a mockable interface.
//!
//! The real implementation shells out to `diskpart /s <script>` with a
//! temporary script file, the same way the OS tool is driven interactively.
//! Tests substitute their own `DiskManagement` implementation.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info};

/// Disk preparation and repair operations the write engine depends on.
pub trait DiskManagement {
    /// Take the disk offline, clear the read-only attribute and wipe the
    /// partition table. The image carries its own table.
    fn prepare_disk(&self, disk_number: u32) -> Result<()>;

    /// Bring the disk back online, rescan, and assign drive letters to
    /// partitions 1 and 2 if they exist.
    fn rescan_and_assign(&self, disk_number: u32) -> Result<()>;

    /// Quick-format a volume as FAT32.
    fn format_volume(&self, drive: &str) -> Result<()>;
}

/// `diskpart`-backed implementation.
pub struct DiskpartRunner;

impl DiskpartRunner {
    fn run_script(script: &str) -> Result<String> {
        let path = script_path();
        std::fs::write(&path, script)
            .with_context(|| format!("cannot write diskpart script {}", path.display()))?;

        let output = Command::new("diskpart")
            .args(["/s", &path.to_string_lossy()])
            .output();
        let _ = std::fs::remove_file(&path);

        let output = output.context("failed to run diskpart")?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        debug!("diskpart output:\n{}", stdout.trim_end());

        if !output.status.success() {
            bail!(
                "diskpart exited with {}: {}",
                output.status,
                tail(&stdout, 400)
            );
        }
        Ok(stdout)
    }
}

impl DiskManagement for DiskpartRunner {
    fn prepare_disk(&self, disk_number: u32) -> Result<()> {
        // Log what is about to be destroyed before cleaning the table
        if let Ok(listing) = Self::run_script(&list_partitions_script(disk_number)) {
            let partitions = parse_partition_numbers(&listing);
            info!(
                "disk {} carries {} partition(s) before clean: {:?}",
                disk_number,
                partitions.len(),
                partitions
            );
        }

        Self::run_script(&prepare_script(disk_number))
            .with_context(|| format!("failed to prepare disk {disk_number}"))?;
        Ok(())
    }

    fn rescan_and_assign(&self, disk_number: u32) -> Result<()> {
        Self::run_script(&rescan_script(disk_number))
            .with_context(|| format!("failed to rescan disk {disk_number}"))?;

        // Give the OS time to surface the rewritten table
        std::thread::sleep(Duration::from_secs(3));

        let listing = Self::run_script(&list_partitions_script(disk_number))?;
        let partitions = parse_partition_numbers(&listing);
        info!(
            "disk {} exposes partitions {:?} after rescan",
            disk_number, partitions
        );

        for partition in [1, 2] {
            if partitions.contains(&partition) {
                Self::run_script(&assign_script(disk_number, partition)).with_context(|| {
                    format!("failed to assign a letter to partition {partition}")
                })?;
            }
        }
        Ok(())
    }

    fn format_volume(&self, drive: &str) -> Result<()> {
        let script = format_script(drive)
            .with_context(|| format!("cannot build a format script for {drive}"))?;
        let output = Self::run_script(&script)?;
        // diskpart reports failures in prose while still exiting zero
        if !output.to_lowercase().contains("successfully") {
            bail!("format did not complete: {}", tail(&output, 400));
        }
        Ok(())
    }
}

fn script_path() -> PathBuf {
    std::env::temp_dir().join(format!("rpi-imager-helper-diskpart-{}.txt", std::process::id()))
}

fn tail(text: &str, max: usize) -> &str {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed;
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

pub(crate) fn prepare_script(disk_number: u32) -> String {
    format!(
        "select disk {disk_number}\n\
         offline disk noerr\n\
         attributes disk clear readonly\n\
         clean\n"
    )
}

pub(crate) fn rescan_script(disk_number: u32) -> String {
    format!(
        "select disk {disk_number}\n\
         online disk noerr\n\
         attributes disk clear readonly\n\
         rescan\n"
    )
}

pub(crate) fn list_partitions_script(disk_number: u32) -> String {
    format!("select disk {disk_number}\nlist partition\n")
}

pub(crate) fn assign_script(disk_number: u32, partition: u32) -> String {
    format!(
        "select disk {disk_number}\n\
         select partition {partition}\n\
         assign noerr\n"
    )
}

/// Build the FAT32 quick-format script for either a volume letter or a
/// physical drive path. Physical drives get a fresh single-partition layout;
/// no success is reported unless diskpart confirms the format.
pub(crate) fn format_script(drive: &str) -> Option<String> {
    if let Some(n) = super::device::parse_physical_drive_number(drive) {
        return Some(format!(
            "select disk {n}\n\
             attributes disk clear readonly\n\
             clean\n\
             create partition primary\n\
             format fs=fat32 quick\n\
             assign\n"
        ));
    }

    let letter = drive.trim_end_matches('\\').trim_end_matches(':');
    if letter.len() == 1 && letter.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(format!(
            "select volume {letter}\n\
             format fs=fat32 quick override\n"
        ));
    }
    None
}

/// Pull partition numbers out of `list partition` output. Lines look like
/// `  Partition 1    Primary    256 MB   1024 KB`.
pub(crate) fn parse_partition_numbers(output: &str) -> Vec<u32> {
    let mut numbers = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("Partition ") else {
            continue;
        };
        if line.contains("###") {
            continue;
        }
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(n) = digits.parse::<u32>() {
            numbers.push(n);
        }
    }
    numbers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_script_cleans_after_offline() {
        let script = prepare_script(3);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "select disk 3");
        let offline = lines.iter().position(|l| l.starts_with("offline")).unwrap();
        let clean = lines.iter().position(|l| *l == "clean").unwrap();
        assert!(offline < clean);
    }

    #[test]
    fn parse_partition_listing() {
        let output = "\
  Partition ###  Type              Size     Offset
  -------------  ----------------  -------  -------
  Partition 1    Primary            256 MB  1024 KB
  Partition 2    Primary             14 GB   257 MB
";
        assert_eq!(parse_partition_numbers(output), vec![1, 2]);
    }

    #[test]
    fn parse_partition_listing_skips_header() {
        assert_eq!(parse_partition_numbers("  Partition ###  Type"), Vec::<u32>::new());
    }

    #[test]
    fn format_script_for_volume_letter() {
        let script = format_script("E:").unwrap();
        assert!(script.contains("select volume E"));
        assert!(script.contains("format fs=fat32 quick"));
    }

    #[test]
    fn format_script_for_physical_drive() {
        let script = format_script(r"\\.\PHYSICALDRIVE2").unwrap();
        assert!(script.contains("select disk 2"));
        assert!(script.contains("create partition primary"));
    }

    #[test]
    fn format_script_rejects_garbage() {
        assert!(format_script("/dev/null/whatever").is_none());
    }
}
