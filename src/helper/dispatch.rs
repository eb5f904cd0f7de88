//! Routes parsed commands to the engines.

use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

use crate::customize::{self, CustomizationPlan};
use crate::error::HelperError;
use crate::progress::ProgressPacer;
use crate::protocol::command::Command;
use crate::verify;
use crate::writer::{self, diskpart::DiskManagement};

/// What the server should do once the completion frame has gone out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Quit,
}

/// Session-lifetime state the engines share: the digest and size of the last
/// successful write, consumed by a later VERIFY.
pub struct EngineContext<'a> {
    pub disk: &'a dyn DiskManagement,
    pub source_hash: &'a mut Option<[u8; 32]>,
    pub total_bytes: &'a mut u64,
}

/// Execute one command. Any error becomes a FAILURE completion at the
/// session layer; `Ok` carries whether the helper keeps serving.
pub fn execute(
    command: Command,
    ctx: &mut EngineContext<'_>,
    pacer: &mut ProgressPacer<'_>,
) -> Result<Disposition> {
    match command {
        Command::Format { drive } => {
            info!("FORMAT {drive}");
            ctx.disk
                .format_volume(&drive)
                .with_context(|| format!("format of {drive} failed"))?;
            Ok(Disposition::Continue)
        }
        Command::Write { drive, source } => {
            info!("WRITE {drive} from {source}");
            let report = writer::write_image(Path::new(&source), &drive, ctx.disk, pacer)?;
            *ctx.source_hash = Some(report.digest);
            *ctx.total_bytes = report.total_bytes;
            Ok(Disposition::Continue)
        }
        Command::Customize {
            drive,
            config,
            cmdline,
            firstrun,
            cloudinit,
            network,
            init_format,
        } => {
            info!("CUSTOMIZE {drive} ({})", init_format.as_str());
            let plan = CustomizationPlan {
                config,
                cmdline,
                firstrun,
                cloudinit,
                network,
                init_format,
            };
            customize::customize_image(&drive, &plan)
                .map_err(|e| HelperError::CustomizationFailed(format!("{e:#}")))?;
            Ok(Disposition::Continue)
        }
        Command::Verify { drive, source, .. } => {
            info!("VERIFY {drive} against {source}");
            let Some(expected) = *ctx.source_hash else {
                bail!("VERIFY requires a WRITE earlier in this session");
            };
            verify::verify_image(&drive, *ctx.total_bytes, &expected, pacer)?;
            Ok(Disposition::Continue)
        }
        Command::Shutdown => {
            info!("SHUTDOWN");
            Ok(Disposition::Quit)
        }
    }
}
