//! First-boot customisation of a freshly written image.
//!
//! Applies `config.txt` entries, picks the init flavour, and drops the
//! firstrun / cloud-init payloads onto the boot partition.

pub mod fat;

use anyhow::{Context, Result};
use log::info;

use crate::protocol::command::InitFormat;
use fat::BootFilesystem;

/// Kernel command line appended when a firstrun script is installed.
pub const FIRSTRUN_CMDLINE: &str = " systemd.run=/boot/firstrun.sh systemd.run_success_action=reboot systemd.unit=kernel-command-line.target";

/// File-level access to the boot partition. `BootFilesystem` implements it
/// over fatfs; unit tests use an in-memory stand-in.
pub trait BootFiles {
    fn exists(&self, name: &str) -> bool;
    fn read_file(&self, name: &str) -> Result<Vec<u8>>;
    fn write_file(&self, name: &str, data: &[u8]) -> Result<()>;
}

impl BootFiles for BootFilesystem {
    fn exists(&self, name: &str) -> bool {
        BootFilesystem::exists(self, name)
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        BootFilesystem::read_file(self, name)
    }

    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        BootFilesystem::write_file(self, name, data)
    }
}

/// Everything a CUSTOMIZE command carries. Empty blobs mean "leave alone".
pub struct CustomizationPlan {
    pub config: Vec<u8>,
    pub cmdline: Vec<u8>,
    pub firstrun: Vec<u8>,
    pub cloudinit: Vec<u8>,
    pub network: Vec<u8>,
    pub init_format: InitFormat,
}

/// Apply `plan` to the boot partition of `device_path` and sync.
pub fn customize_image(device_path: &str, plan: &CustomizationPlan) -> Result<()> {
    let fs = BootFilesystem::open(device_path)?;
    apply(&fs, plan)?;
    fs.sync()
}

/// The customisation steps, separated from device handling so they can run
/// against any `BootFiles` implementation.
pub fn apply(fs: &dyn BootFiles, plan: &CustomizationPlan) -> Result<()> {
    if !plan.config.is_empty() {
        let items = std::str::from_utf8(&plan.config).context("config items are not UTF-8")?;
        let existing = read_text_or_empty(fs, "config.txt")?;
        let merged = merge_config_items(&existing, items);
        fs.write_file("config.txt", merged.as_bytes())?;
    }

    let resolved = resolve_init_format(fs, plan.init_format);
    info!("init format resolved to {}", resolved.as_str());

    match resolved {
        InitFormat::Systemd => {
            if !plan.firstrun.is_empty() {
                fs.write_file("firstrun.sh", &plan.firstrun)?;
                append_to_cmdline(fs, FIRSTRUN_CMDLINE)?;
            }
        }
        InitFormat::CloudInit | InitFormat::Auto => {
            if !plan.cloudinit.is_empty() {
                let mut user_data = b"#cloud-config\n".to_vec();
                user_data.extend_from_slice(&plan.cloudinit);
                fs.write_file("user-data", &user_data)?;
            }
            if !plan.network.is_empty() {
                fs.write_file("network-config", &plan.network)?;
            }
        }
    }

    if !plan.cmdline.is_empty() {
        let extra = std::str::from_utf8(&plan.cmdline).context("cmdline is not UTF-8")?;
        append_to_cmdline(fs, extra)?;
    }

    Ok(())
}

/// Detect the init flavour the image expects. `user-data` in the boot
/// partition marks a cloud-init image; a pi-gen `issue.txt` marks systemd;
/// cloud-init is the fallback.
pub fn resolve_init_format(fs: &dyn BootFiles, requested: InitFormat) -> InitFormat {
    if requested != InitFormat::Auto {
        return requested;
    }
    if fs.exists("user-data") {
        return InitFormat::CloudInit;
    }
    if let Ok(issue) = fs.read_file("issue.txt") {
        if String::from_utf8_lossy(&issue).contains("pi-gen") {
            return InitFormat::Systemd;
        }
    }
    InitFormat::CloudInit
}

/// Merge newline-separated config entries into an existing `config.txt`.
/// A commented-out copy of the entry is uncommented in place; an already
/// active copy is left alone; otherwise the entry is appended.
pub fn merge_config_items(existing: &str, items: &str) -> String {
    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();

    for item in items.lines() {
        let item = item.trim_end();
        if item.is_empty() {
            continue;
        }
        let commented = format!("#{item}");
        if let Some(pos) = lines.iter().position(|l| l.trim_end() == commented) {
            lines[pos] = item.to_string();
        } else if !lines.iter().any(|l| l.trim_end() == item) {
            lines.push(item.to_string());
        }
    }

    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn read_text_or_empty(fs: &dyn BootFiles, name: &str) -> Result<String> {
    if !fs.exists(name) {
        return Ok(String::new());
    }
    let data = fs.read_file(name)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Append `extra` to the trimmed contents of `cmdline.txt`.
fn append_to_cmdline(fs: &dyn BootFiles, extra: &str) -> Result<()> {
    let existing = read_text_or_empty(fs, "cmdline.txt")?;
    let base = existing.trim_end();
    let combined = if base.is_empty() {
        extra.trim_start().to_string()
    } else if extra.starts_with(' ') {
        format!("{base}{extra}")
    } else {
        format!("{base} {extra}")
    };
    fs.write_file("cmdline.txt", combined.as_bytes())
}
