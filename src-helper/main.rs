//! Elevated helper executable.
//!
//! `--daemon` serves the session protocol on the local socket until a
//! SHUTDOWN arrives. The one-shot `--format` and `--write` modes run a
//! single operation, optionally streaming progress frames to a client that
//! connects on `--socket`.
//!
//! Exit codes: 0 success, 1 operation failed, 2 argument validation failed,
//! 3 no operation requested.

use std::io::Write as _;
use std::path::Path;
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser};
use log::{error, info, warn};

use rpi_imager_helper::diag;
use rpi_imager_helper::helper::{self, HelperConfig, ServeOutcome};
use rpi_imager_helper::progress::{ProgressPacer, ProgressSink};
use rpi_imager_helper::protocol::{wire, ProgressKind, DEFAULT_SOCKET_NAME};
use rpi_imager_helper::transport::{LocalListener, LocalStream};
use rpi_imager_helper::writer::{self, diskpart::DiskManagement, diskpart::DiskpartRunner};

#[derive(Parser, Debug)]
#[command(
    name = "rpi-imager-helper",
    version = env!("APP_VERSION"),
    about = "Privileged disk-writer helper for Raspberry Pi imaging"
)]
struct Args {
    /// Serve commands over the local socket until shut down
    #[arg(long)]
    daemon: bool,

    /// Format the drive
    #[arg(short = 'f', long, value_name = "drive")]
    format: Option<String>,

    /// Write an image to the drive (requires --source)
    #[arg(short = 'w', long, value_name = "drive", requires = "source")]
    write: Option<String>,

    /// Source image file
    #[arg(short = 's', long, value_name = "file")]
    source: Option<String>,

    /// Local-socket name for the session or progress channel
    #[arg(long, value_name = "name", default_value = DEFAULT_SOCKET_NAME)]
    socket: String,
}

fn main() {
    env_logger::builder()
        .format_timestamp_millis()
        .parse_default_env()
        .init();

    // Argument validation failures exit with code 2 via clap
    let args = Args::parse();
    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    if is_elevated() {
        info!("helper running with administrator privileges");
    } else {
        warn!("helper is NOT running with administrator privileges");
        warn!("raw disk writes will most likely fail");
    }

    let disk = DiskpartRunner;

    if args.daemon {
        let marker = diag::write_start_marker("daemon");
        let config = HelperConfig {
            socket_name: args.socket,
            daemon: true,
        };
        let code = match helper::run(&config, &disk) {
            Ok(ServeOutcome::Shutdown) => 0,
            Ok(ServeOutcome::PeerLostMidCommand) => {
                error!("client disappeared while a command was running");
                1
            }
            Err(e) => {
                error!("daemon failed: {e}");
                1
            }
        };
        if let Some(path) = marker {
            diag::remove_start_marker(&path);
        }
        return code;
    }

    if let Some(drive) = args.format {
        let marker = diag::write_start_marker("format");
        let code = match disk.format_volume(&drive) {
            Ok(()) => 0,
            Err(e) => {
                error!("format failed: {e:#}");
                1
            }
        };
        if let Some(path) = marker {
            diag::remove_start_marker(&path);
        }
        return code;
    }

    if let Some(drive) = args.write {
        // clap enforces the pairing, but keep the invariant local too
        let Some(source) = args.source else {
            error!("--write requires --source");
            return 2;
        };

        let marker = diag::write_start_marker("write");
        let mut sink = OneShotProgress::connect(&args.socket);
        let mut pacer = ProgressPacer::new(&mut sink);
        let code = match writer::write_image(Path::new(&source), &drive, &disk, &mut pacer) {
            Ok(report) => {
                info!("wrote {} bytes to {drive}", report.total_bytes);
                0
            }
            Err(e) => {
                error!("write failed: {e:#}");
                1
            }
        };
        if let Some(path) = marker {
            diag::remove_start_marker(&path);
        }
        return code;
    }

    // No operation requested: show usage, exit 3
    let _ = Args::command().print_help();
    println!();
    3
}

/// Progress channel for the one-shot modes. Binds the socket and waits
/// briefly for a client; running without one is fine, and losing the client
/// mid-operation never fails the operation itself.
struct OneShotProgress {
    stream: Option<LocalStream>,
}

impl OneShotProgress {
    fn connect(socket_name: &str) -> Self {
        let listener = match LocalListener::bind(socket_name) {
            Ok(listener) => listener,
            Err(e) => {
                warn!("progress socket unavailable: {e}");
                return Self { stream: None };
            }
        };

        let deadline = Instant::now() + Duration::from_millis(500);
        let stream = loop {
            match listener.try_accept() {
                Ok(Some(stream)) => break Some(stream),
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                _ => break None,
            }
        };
        if stream.is_none() {
            info!("no progress client connected, continuing without one");
        }
        Self { stream }
    }
}

impl ProgressSink for OneShotProgress {
    fn emit(&mut self, kind: ProgressKind, now: u64, total: u64) -> std::io::Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            let sent = wire::write_progress(stream, kind, now as i64, total as i64)
                .and_then(|()| stream.flush());
            if let Err(e) = sent {
                warn!("progress client lost: {e}");
                self.stream = None;
            }
        }
        Ok(())
    }
}

#[cfg(windows)]
fn is_elevated() -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token: HANDLE = 0;
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }
        let mut elevation: TOKEN_ELEVATION = std::mem::zeroed();
        let mut returned = 0u32;
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut TOKEN_ELEVATION as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        );
        CloseHandle(token);
        ok != 0 && elevation.TokenIsElevated != 0
    }
}

#[cfg(not(windows))]
fn is_elevated() -> bool {
    // Development hosts: writing to raw devices needs root
    extern "C" {
        fn geteuid() -> u32;
    }
    unsafe { geteuid() == 0 }
}
