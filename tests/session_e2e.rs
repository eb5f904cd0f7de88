//! End-to-end client/helper session tests.
//!
//! A real helper server runs on a background thread, speaking the real wire
//! protocol over the Unix local-socket transport; the real client session
//! manager talks to it. Targets are plain files, so the volume-path write
//! path is exercised without touching hardware. The diskpart interface is
//! mocked.
//!
//! Run with: cargo test --test session_e2e

#![cfg(unix)]

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use rpi_imager_helper::customize::fat::BootFilesystem;
use rpi_imager_helper::helper::{self, HelperConfig, ServeOutcome};
use rpi_imager_helper::protocol::command::{Command, InitFormat};
use rpi_imager_helper::protocol::wire::{self, FrameReader};
use rpi_imager_helper::protocol::{Frame, ProgressKind, FAILURE, HELLO, READY, SUCCESS};
use rpi_imager_helper::error::HelperError;
use rpi_imager_helper::session::{
    Completion, ProgressObserver, Session, SessionConfig, SessionManager,
};
use rpi_imager_helper::transport;
use rpi_imager_helper::writer::diskpart::DiskManagement;

static NEXT_SOCKET: AtomicU32 = AtomicU32::new(0);

fn unique_socket_name() -> String {
    format!(
        "rpi-helper-e2e-{}-{}",
        std::process::id(),
        NEXT_SOCKET.fetch_add(1, Ordering::Relaxed)
    )
}

struct NoopDisk;

impl DiskManagement for NoopDisk {
    fn prepare_disk(&self, _disk_number: u32) -> anyhow::Result<()> {
        Ok(())
    }

    fn rescan_and_assign(&self, _disk_number: u32) -> anyhow::Result<()> {
        Ok(())
    }

    fn format_volume(&self, _drive: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Start a daemon-mode helper on its own thread.
fn start_helper(socket_name: &str) -> thread::JoinHandle<ServeOutcome> {
    let config = HelperConfig {
        socket_name: socket_name.to_string(),
        daemon: true,
    };
    thread::spawn(move || helper::run(&config, &NoopDisk).expect("helper run failed"))
}

fn client_config(socket_name: &str) -> SessionConfig {
    SessionConfig {
        socket_name: socket_name.to_string(),
        ..SessionConfig::default()
    }
}

#[derive(Default)]
struct FrameLog {
    frames: Vec<(ProgressKind, i64, i64)>,
}

impl ProgressObserver for FrameLog {
    fn on_progress(&mut self, kind: ProgressKind, now: i64, total: i64) {
        self.frames.push((kind, now, total));
    }
}

#[test]
fn handshake_then_clean_shutdown() {
    let socket = unique_socket_name();
    let server = start_helper(&socket);

    let session = Session::connect(client_config(&socket), None).unwrap();
    session.shutdown().unwrap();

    assert_eq!(server.join().unwrap(), ServeOutcome::Shutdown);
}

#[test]
fn write_then_verify_one_mib_of_zeros() {
    let socket = unique_socket_name();
    let server = start_helper(&socket);
    let dir = tempfile::tempdir().unwrap();

    const TOTAL: u64 = 1_048_576;
    let source_path = dir.path().join("zeros.img");
    std::fs::write(&source_path, vec![0u8; TOTAL as usize]).unwrap();

    let target_path = dir.path().join("device.img");
    std::fs::File::create(&target_path)
        .unwrap()
        .set_len(TOTAL)
        .unwrap();

    let mut session = Session::connect(client_config(&socket), None).unwrap();

    // WRITE
    let mut log = FrameLog::default();
    let completion = session
        .execute(
            &Command::Write {
                drive: target_path.to_string_lossy().into_owned(),
                source: source_path.to_string_lossy().into_owned(),
            },
            &mut log,
        )
        .unwrap();
    assert_eq!(completion, Completion::Success);

    // Progress stream: starts at (3, 0, total), ends at (3, total, total),
    // and never moves backwards
    assert_eq!(
        log.frames.first(),
        Some(&(ProgressKind::Write, 0, TOTAL as i64))
    );
    assert_eq!(
        log.frames.last(),
        Some(&(ProgressKind::Write, TOTAL as i64, TOTAL as i64))
    );
    let mut prev = 0;
    for &(kind, now, total) in &log.frames {
        assert_eq!(kind, ProgressKind::Write);
        assert_eq!(total, TOTAL as i64);
        assert!(now >= prev);
        assert!(now <= total);
        prev = now;
    }

    // The target now equals the source
    let written = std::fs::read(&target_path).unwrap();
    assert_eq!(written.len() as u64, TOTAL);
    assert!(written.iter().all(|&b| b == 0));

    // VERIFY against the session-held hash
    let mut log = FrameLog::default();
    let completion = session
        .execute(
            &Command::Verify {
                drive: target_path.to_string_lossy().into_owned(),
                source: source_path.to_string_lossy().into_owned(),
                expected_hash: Vec::new(),
            },
            &mut log,
        )
        .unwrap();
    assert_eq!(completion, Completion::Success);
    assert!(log
        .frames
        .iter()
        .all(|&(kind, _, _)| kind == ProgressKind::Verify));

    session.shutdown().unwrap();
    assert_eq!(server.join().unwrap(), ServeOutcome::Shutdown);
}

#[test]
fn verify_fails_after_device_corruption() {
    let socket = unique_socket_name();
    let server = start_helper(&socket);
    let dir = tempfile::tempdir().unwrap();

    let source_path = dir.path().join("image.img");
    let payload: Vec<u8> = (0..65_536u32).map(|i| (i % 255) as u8).collect();
    std::fs::write(&source_path, &payload).unwrap();

    let target_path = dir.path().join("device.img");
    std::fs::File::create(&target_path)
        .unwrap()
        .set_len(payload.len() as u64)
        .unwrap();

    let mut session = Session::connect(client_config(&socket), None).unwrap();
    let drive = target_path.to_string_lossy().into_owned();
    let source = source_path.to_string_lossy().into_owned();

    let completion = session
        .execute(
            &Command::Write {
                drive: drive.clone(),
                source: source.clone(),
            },
            &mut FrameLog::default(),
        )
        .unwrap();
    assert_eq!(completion, Completion::Success);

    // Flip one byte on the device
    let mut contents = std::fs::read(&target_path).unwrap();
    contents[4242] ^= 0xFF;
    std::fs::write(&target_path, &contents).unwrap();

    let completion = session
        .execute(
            &Command::Verify {
                drive,
                source,
                expected_hash: Vec::new(),
            },
            &mut FrameLog::default(),
        )
        .unwrap();
    assert_eq!(completion, Completion::Failure);

    // A FAILURE completion is an answer, not an error: the session keeps working
    session.shutdown().unwrap();
    server.join().unwrap();
}

/// Scenario S4: a malformed command yields FAILURE and the session stays in
/// Ready for the next command. Spoken raw so the malformed frame can
/// actually be produced.
#[test]
fn malformed_command_leaves_session_usable() {
    let socket = unique_socket_name();
    let server = start_helper(&socket);

    let mut stream = loop {
        match transport::connect(&socket) {
            Ok(stream) => break stream,
            Err(_) => thread::sleep(std::time::Duration::from_millis(20)),
        }
    };

    let mut reader = FrameReader::new();
    let read_text = |stream: &mut transport::LocalStream, reader: &mut FrameReader| loop {
        if let Some(frame) = reader.next_frame().unwrap() {
            match frame {
                Frame::Text(text) => break text,
                Frame::Progress { .. } => continue,
            }
        }
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "server closed the stream unexpectedly");
        reader.push(&buf[..n]);
    };

    assert_eq!(read_text(&mut stream, &mut reader), HELLO);
    wire::write_text(&mut stream, READY).unwrap();
    stream.flush().unwrap();

    // WRITE with no arguments: rejected, session survives
    wire::write_text(&mut stream, "WRITE").unwrap();
    stream.flush().unwrap();
    assert_eq!(read_text(&mut stream, &mut reader), FAILURE);

    // The next, well-formed command is accepted
    wire::write_text(&mut stream, "SHUTDOWN").unwrap();
    stream.flush().unwrap();
    assert_eq!(read_text(&mut stream, &mut reader), SUCCESS);

    assert_eq!(server.join().unwrap(), ServeOutcome::Shutdown);
}

/// Property 6: the first SHUTDOWN succeeds and stops the helper; a second
/// one fails at the transport, never as a stale success.
#[test]
fn second_shutdown_fails_at_transport() {
    let socket = unique_socket_name();
    let server = start_helper(&socket);

    let session = Session::connect(client_config(&socket), None).unwrap();
    session.shutdown().unwrap();
    server.join().unwrap();

    assert!(transport::connect(&socket).is_err());
}

/// Scenario S6: CUSTOMIZE with init-format auto against a boot partition
/// containing `user-data` selects cloud-init.
#[test]
fn customize_auto_selects_cloudinit() {
    let socket = unique_socket_name();
    let server = start_helper(&socket);
    let dir = tempfile::tempdir().unwrap();

    // Build a bare FAT image holding the marker files
    let image_path = dir.path().join("boot.img");
    {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&image_path)
            .unwrap();
        file.set_len(8 * 1024 * 1024).unwrap();
        fatfs::format_volume(&file, fatfs::FormatVolumeOptions::new()).unwrap();
        let fs = fatfs::FileSystem::new(&file, fatfs::FsOptions::new()).unwrap();
        let root = fs.root_dir();
        root.create_file("user-data")
            .unwrap()
            .write_all(b"")
            .unwrap();
        root.create_file("cmdline.txt")
            .unwrap()
            .write_all(b"console=serial0 rootwait\n")
            .unwrap();
        drop(root);
        fs.unmount().unwrap();
    }

    let mut session = Session::connect(client_config(&socket), None).unwrap();
    let completion = session
        .execute(
            &Command::Customize {
                drive: image_path.to_string_lossy().into_owned(),
                config: Vec::new(),
                cmdline: Vec::new(),
                firstrun: b"#!/bin/sh\ntrue\n".to_vec(),
                cloudinit: b"hostname: testpi\n".to_vec(),
                network: b"version: 2\n".to_vec(),
                init_format: InitFormat::Auto,
            },
            &mut FrameLog::default(),
        )
        .unwrap();
    assert_eq!(completion, Completion::Success);
    session.shutdown().unwrap();
    server.join().unwrap();

    // cloud-init was chosen: user-data got the header, firstrun.sh was not
    // written
    let fs = BootFilesystem::open(image_path.to_str().unwrap()).unwrap();
    assert_eq!(
        fs.read_file("user-data").unwrap(),
        b"#cloud-config\nhostname: testpi\n".to_vec()
    );
    assert_eq!(fs.read_file("network-config").unwrap(), b"version: 2\n".to_vec());
    assert!(!fs.exists("firstrun.sh"));
}

/// One completion per accepted command, in order (testable property 2).
#[test]
fn completion_count_matches_command_count() {
    let socket = unique_socket_name();
    let server = start_helper(&socket);
    let dir = tempfile::tempdir().unwrap();

    let source_path = dir.path().join("src.img");
    std::fs::write(&source_path, vec![0xA5u8; 4096]).unwrap();
    let target_path = dir.path().join("dst.img");
    std::fs::File::create(&target_path)
        .unwrap()
        .set_len(4096)
        .unwrap();

    let mut session = Session::connect(client_config(&socket), None).unwrap();
    let drive = target_path.to_string_lossy().into_owned();
    let source = source_path.to_string_lossy().into_owned();

    let mut completions = Vec::new();
    for _ in 0..3 {
        let completion = session
            .execute(
                &Command::Write {
                    drive: drive.clone(),
                    source: source.clone(),
                },
                &mut FrameLog::default(),
            )
            .unwrap();
        completions.push(completion);
    }
    assert_eq!(completions, vec![Completion::Success; 3]);

    session.shutdown().unwrap();
    server.join().unwrap();
}

/// The session manager front-end: refuses commands before a session exists,
/// then drives a full attach/execute/shutdown cycle.
#[test]
fn session_manager_attach_and_shutdown() {
    let socket = unique_socket_name();
    let server = start_helper(&socket);
    let dir = tempfile::tempdir().unwrap();

    let source_path = dir.path().join("src.img");
    std::fs::write(&source_path, vec![0x5Au8; 2048]).unwrap();
    let target_path = dir.path().join("dst.img");
    std::fs::File::create(&target_path)
        .unwrap()
        .set_len(2048)
        .unwrap();

    let mut manager = SessionManager::new(client_config(&socket));

    let before = manager.execute(
        &Command::Format {
            drive: "E:".to_string(),
        },
        &mut rpi_imager_helper::session::NullObserver,
    );
    assert!(matches!(before, Err(HelperError::NotConnected)));

    manager.attach().unwrap();
    let completion = manager
        .execute(
            &Command::Write {
                drive: target_path.to_string_lossy().into_owned(),
                source: source_path.to_string_lossy().into_owned(),
            },
            &mut FrameLog::default(),
        )
        .unwrap();
    assert_eq!(completion, Completion::Success);

    manager.shutdown();
    server.join().unwrap();
}

/// The helper with an Arc-shared mock, checking physical-drive routing hits
/// the disk-management interface.
#[test]
fn physical_drive_path_goes_through_disk_preparation() {
    use std::sync::Mutex;

    struct RecordingDisk {
        calls: Mutex<Vec<String>>,
    }

    impl DiskManagement for RecordingDisk {
        fn prepare_disk(&self, n: u32) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("prepare {n}"));
            anyhow::bail!("stop before touching a real device")
        }

        fn rescan_and_assign(&self, n: u32) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("rescan {n}"));
            Ok(())
        }

        fn format_volume(&self, drive: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("format {drive}"));
            Ok(())
        }
    }

    let socket = unique_socket_name();
    let disk = Arc::new(RecordingDisk {
        calls: Mutex::new(Vec::new()),
    });

    let server = {
        let disk = Arc::clone(&disk);
        let config = HelperConfig {
            socket_name: socket.clone(),
            daemon: true,
        };
        thread::spawn(move || helper::run(&config, &*disk).expect("helper run failed"))
    };

    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("src.img");
    std::fs::write(&source_path, vec![0u8; 4096]).unwrap();

    let mut session = Session::connect(client_config(&socket), None).unwrap();
    let completion = session
        .execute(
            &Command::Write {
                drive: r"\\.\PHYSICALDRIVE9".to_string(),
                source: source_path.to_string_lossy().into_owned(),
            },
            &mut FrameLog::default(),
        )
        .unwrap();
    // The mock aborts during preparation, so the command fails cleanly and
    // no device is ever opened
    assert_eq!(completion, Completion::Failure);

    session.shutdown().unwrap();
    server.join().unwrap();

    assert_eq!(
        *disk.calls.lock().unwrap(),
        vec!["prepare 9".to_string()]
    );
}
