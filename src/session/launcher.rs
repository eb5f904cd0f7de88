//! Launches the elevated helper and keeps hold of its process.
//!
//! The helper executable lives next to the caller. On Windows the launch
//! goes through the shell with the `runas` verb so the OS raises the UAC
//! prompt; a denied prompt is a distinct error from a missing executable.
//! The bridge that launched a helper is also responsible for killing it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::HelperError;

#[cfg(windows)]
const HELPER_EXE: &str = "rpi-imager-helper.exe";
#[cfg(not(windows))]
const HELPER_EXE: &str = "rpi-imager-helper";

static LAUNCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per-launch endpoint name: unique across processes and launches so a stale
/// helper can never hijack a new session.
pub fn generate_socket_name() -> String {
    let seq = LAUNCH_SEQ.fetch_add(1, Ordering::Relaxed);
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
        .unwrap_or(0);
    format!(
        "rpi-imager-helper-{}-{}-{:x}",
        std::process::id(),
        seq,
        nonce
    )
}

/// Locate the helper binary adjacent to the current executable.
pub fn helper_executable() -> Result<PathBuf, HelperError> {
    let exe = std::env::current_exe().map_err(HelperError::Io)?;
    let dir = exe
        .parent()
        .ok_or_else(|| HelperError::HelperNotFound(exe.display().to_string()))?;
    let helper = dir.join(HELPER_EXE);
    if !helper.exists() {
        return Err(HelperError::HelperNotFound(helper.display().to_string()));
    }
    Ok(helper)
}

/// A launched helper process.
pub struct HelperProcess {
    #[cfg(windows)]
    handle: isize,
    #[cfg(not(windows))]
    child: std::process::Child,
}

#[cfg(windows)]
mod win {
    use log::{debug, warn};
    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_CANCELLED, ERROR_FILE_NOT_FOUND,
        ERROR_PATH_NOT_FOUND, HANDLE,
    };
    use windows_sys::Win32::System::Threading::{GetExitCodeProcess, TerminateProcess};
    use windows_sys::Win32::UI::Shell::{ShellExecuteExW, SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW};
    use windows_sys::Win32::UI::WindowsAndMessaging::SW_HIDE;

    use super::{helper_executable, HelperProcess};
    use crate::error::HelperError;

    // GetExitCodeProcess reports this while the process is alive
    const STILL_ACTIVE_CODE: u32 = 259;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// Launch the helper elevated in daemon mode on `socket_name`.
    pub fn launch_elevated(socket_name: &str) -> Result<HelperProcess, HelperError> {
        let helper = helper_executable()?;
        let path = wide(&helper.to_string_lossy());
        let verb = wide("runas");
        let params = wide(&format!("--daemon --socket \"{socket_name}\""));

        let mut info: SHELLEXECUTEINFOW = unsafe { std::mem::zeroed() };
        info.cbSize = std::mem::size_of::<SHELLEXECUTEINFOW>() as u32;
        info.fMask = SEE_MASK_NOCLOSEPROCESS;
        info.lpVerb = verb.as_ptr();
        info.lpFile = path.as_ptr();
        info.lpParameters = params.as_ptr();
        info.nShow = SW_HIDE;

        let ok = unsafe { ShellExecuteExW(&mut info) };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            return Err(match code {
                ERROR_CANCELLED => HelperError::ElevationCancelled,
                ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => {
                    HelperError::HelperNotFound(helper.display().to_string())
                }
                ERROR_ACCESS_DENIED => {
                    HelperError::AccessDenied(format!("error code {code} launching helper"))
                }
                other => HelperError::AccessDenied(format!(
                    "shell launch failed with error code {other}"
                )),
            });
        }

        debug!("helper launched elevated on socket {socket_name}");
        Ok(HelperProcess {
            handle: info.hProcess as isize,
        })
    }

    impl HelperProcess {
        /// Exit code if the helper has terminated.
        pub fn exit_code(&mut self) -> Option<i32> {
            let mut code = 0u32;
            let ok = unsafe { GetExitCodeProcess(self.handle as HANDLE, &mut code) };
            if ok == 0 || code == STILL_ACTIVE_CODE {
                None
            } else {
                Some(code as i32)
            }
        }

        /// Best-effort kill; used on shutdown and abnormal client exit.
        pub fn terminate(&mut self) {
            if self.exit_code().is_none() {
                warn!("terminating helper process");
                unsafe {
                    TerminateProcess(self.handle as HANDLE, 1);
                }
            }
        }
    }

    impl Drop for HelperProcess {
        fn drop(&mut self) {
            self.terminate();
            unsafe {
                CloseHandle(self.handle as HANDLE);
            }
        }
    }
}

#[cfg(windows)]
pub use win::launch_elevated;

#[cfg(not(windows))]
mod posix {
    use std::process::Command;

    use log::warn;

    use super::{helper_executable, HelperProcess};
    use crate::error::HelperError;

    /// Spawn the helper directly. Development hosts only; there is no
    /// elevation boundary here.
    pub fn launch_elevated(socket_name: &str) -> Result<HelperProcess, HelperError> {
        let helper = helper_executable()?;
        let child = Command::new(&helper)
            .args(["--daemon", "--socket", socket_name])
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    HelperError::HelperNotFound(helper.display().to_string())
                }
                std::io::ErrorKind::PermissionDenied => {
                    HelperError::AccessDenied(e.to_string())
                }
                _ => HelperError::Io(e),
            })?;
        Ok(HelperProcess { child })
    }

    impl HelperProcess {
        pub fn exit_code(&mut self) -> Option<i32> {
            match self.child.try_wait() {
                Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
                _ => None,
            }
        }

        pub fn terminate(&mut self) {
            if self.exit_code().is_none() {
                warn!("terminating helper process");
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
    }

    impl Drop for HelperProcess {
        fn drop(&mut self) {
            self.terminate();
        }
    }
}

#[cfg(not(windows))]
pub use posix::launch_elevated;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_names_are_unique_per_call() {
        let a = generate_socket_name();
        let b = generate_socket_name();
        assert_ne!(a, b);
        assert!(a.starts_with("rpi-imager-helper-"));
        assert!(a.is_ascii());
    }
}
