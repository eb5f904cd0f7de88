//! Exclusive block-device access.
//!
//! Opening a physical drive on Windows is unreliable enough that three open
//! strategies are tried in sequence, and the volume lock is retried once
//! before being downgraded to a warning. The handle is released on every
//! exit path; callers only see a `DeviceHandle` that closes on drop.

use std::fs::File;

use crate::error::HelperError;

/// Sector size assumed when the OS will not answer the geometry query.
pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

/// Recognise `\\.\PHYSICALDRIVEn` (any case) and extract `n`.
pub fn parse_physical_drive_number(path: &str) -> Option<u32> {
    let upper = path.to_ascii_uppercase();
    let rest = upper.strip_prefix(r"\\.\PHYSICALDRIVE")?;
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

/// Map a bare volume letter (`E:` or `E:\`) to its device path `\\.\E:`.
/// Anything else is passed through untouched.
pub fn normalize_device_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('\\');
    let mut chars = trimmed.chars();
    if let (Some(letter), Some(':'), None) = (chars.next(), chars.next(), chars.next()) {
        if letter.is_ascii_alphabetic() {
            return format!(r"\\.\{}:", letter.to_ascii_uppercase());
        }
    }
    path.to_string()
}

/// An open, exclusively held block device.
pub struct DeviceHandle {
    file: File,
    sector_size: u32,
    #[cfg(windows)]
    locked: bool,
}

impl DeviceHandle {
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

#[cfg(windows)]
mod win {
    use std::fs::File;
    use std::os::windows::io::{AsRawHandle, FromRawHandle};
    use std::time::Duration;

    use log::{debug, warn};
    use windows_sys::Win32::Foundation::{
        GetLastError, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_SHARING_VIOLATION,
        GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
    };
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH, FILE_SHARE_READ,
        FILE_SHARE_WRITE, OPEN_EXISTING,
    };
    use windows_sys::Win32::System::Ioctl::{
        DISK_GEOMETRY, FSCTL_ALLOW_EXTENDED_DASD_IO, FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME,
        FSCTL_UNLOCK_VOLUME, IOCTL_DISK_GET_DRIVE_GEOMETRY,
    };
    use windows_sys::Win32::System::IO::DeviceIoControl;

    use super::{normalize_device_path, DeviceHandle, DEFAULT_SECTOR_SIZE};
    use crate::error::HelperError;

    const OPEN_RETRY_PAUSE: Duration = Duration::from_secs(2);
    const LOCK_RETRY_PAUSE: Duration = Duration::from_secs(2);

    /// Attach the well-known refinements to a raw error code, mirroring what
    /// the OS reports plus the situations we know how to explain.
    pub(super) fn describe_open_error(code: u32) -> String {
        let mut message = std::io::Error::from_raw_os_error(code as i32).to_string();
        match code {
            ERROR_ACCESS_DENIED => {
                message.push_str(" - Access denied, helper requires administrator privileges");
            }
            ERROR_FILE_NOT_FOUND => {
                message.push_str(" - Device not found, invalid path");
            }
            ERROR_SHARING_VIOLATION => {
                message.push_str(" - Device is in use by another process");
            }
            _ => {}
        }
        message
    }

    fn open_raw(path: &str, share_mode: u32, flags: u32) -> Result<File, u32> {
        let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                share_mode,
                std::ptr::null_mut(),
                OPEN_EXISTING,
                flags,
                0,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(unsafe { GetLastError() });
        }
        Ok(unsafe { File::from_raw_handle(handle as *mut _) })
    }

    fn ioctl(file: &File, code: u32) -> bool {
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                file.as_raw_handle() as HANDLE,
                code,
                std::ptr::null_mut(),
                0,
                std::ptr::null_mut(),
                0,
                &mut returned,
                std::ptr::null_mut(),
            )
        };
        ok != 0
    }

    fn query_sector_size(file: &File) -> u32 {
        let mut geometry: DISK_GEOMETRY = unsafe { std::mem::zeroed() };
        let mut returned = 0u32;
        let ok = unsafe {
            DeviceIoControl(
                file.as_raw_handle() as HANDLE,
                IOCTL_DISK_GET_DRIVE_GEOMETRY,
                std::ptr::null_mut(),
                0,
                &mut geometry as *mut DISK_GEOMETRY as *mut _,
                std::mem::size_of::<DISK_GEOMETRY>() as u32,
                &mut returned,
                std::ptr::null_mut(),
            )
        };
        if ok != 0 && geometry.BytesPerSector > 0 {
            geometry.BytesPerSector
        } else {
            warn!("sector size query failed, assuming {DEFAULT_SECTOR_SIZE}");
            DEFAULT_SECTOR_SIZE
        }
    }

    impl DeviceHandle {
        /// Open a physical drive for raw writes. Three strategies, two-second
        /// pauses between them; the last error code is reported if all fail.
        pub fn open_physical(path: &str) -> Result<Self, HelperError> {
            let strategies: [(u32, u32); 3] = [
                (FILE_SHARE_READ | FILE_SHARE_WRITE, FILE_FLAG_NO_BUFFERING),
                (0, FILE_FLAG_NO_BUFFERING),
                (0, 0),
            ];

            let mut last_code = 0;
            for (attempt, (share, flags)) in strategies.iter().enumerate() {
                if attempt > 0 {
                    std::thread::sleep(OPEN_RETRY_PAUSE);
                }
                match open_raw(path, *share, *flags) {
                    Ok(file) => {
                        debug!("opened {path} with strategy {}", attempt + 1);
                        let sector_size = query_sector_size(&file);
                        return Ok(DeviceHandle {
                            file,
                            sector_size,
                            locked: false,
                        });
                    }
                    Err(code) => {
                        warn!(
                            "open strategy {} failed for {path}: {}",
                            attempt + 1,
                            describe_open_error(code)
                        );
                        last_code = code;
                    }
                }
            }

            Err(HelperError::DeviceOpenFailed {
                code: last_code,
                message: describe_open_error(last_code),
            })
        }

        /// Open a mounted volume exclusively. Write-through first, then
        /// no-buffering combined with write-through.
        pub fn open_volume(path: &str) -> Result<Self, HelperError> {
            let device_path = normalize_device_path(path);
            let attempts: [u32; 2] = [
                FILE_FLAG_WRITE_THROUGH,
                FILE_FLAG_NO_BUFFERING | FILE_FLAG_WRITE_THROUGH,
            ];

            let mut last_code = 0;
            for flags in attempts {
                match open_raw(&device_path, 0, flags) {
                    Ok(file) => {
                        let sector_size = query_sector_size(&file);
                        return Ok(DeviceHandle {
                            file,
                            sector_size,
                            locked: false,
                        });
                    }
                    Err(code) => {
                        warn!(
                            "exclusive open failed for {device_path}: {}",
                            describe_open_error(code)
                        );
                        last_code = code;
                    }
                }
            }

            Err(HelperError::DeviceOpenFailed {
                code: last_code,
                message: describe_open_error(last_code),
            })
        }

        /// Permit raw I/O past the filesystem's notion of the volume extent.
        pub fn allow_extended_dasd(&self) {
            if !ioctl(&self.file, FSCTL_ALLOW_EXTENDED_DASD_IO) {
                debug!("extended DASD I/O request refused");
            }
        }

        /// Lock the volume, retrying once. A failed lock is logged and the
        /// write proceeds; the dismount usually succeeds regardless.
        pub fn lock_volume(&mut self) {
            for attempt in 0..2 {
                if ioctl(&self.file, FSCTL_LOCK_VOLUME) {
                    self.locked = true;
                    return;
                }
                if attempt == 0 {
                    std::thread::sleep(LOCK_RETRY_PAUSE);
                }
            }
            warn!("could not lock volume, continuing without the lock");
        }

        pub fn dismount_volume(&self) {
            if !ioctl(&self.file, FSCTL_DISMOUNT_VOLUME) {
                warn!("volume dismount refused");
            }
        }

        pub fn unlock_volume(&self) {
            if !ioctl(&self.file, FSCTL_UNLOCK_VOLUME) {
                debug!("volume unlock refused");
            }
        }
    }
}

#[cfg(not(windows))]
impl DeviceHandle {
    /// Open a target path read+write. Development and test hosts only; the
    /// production target is the Windows build.
    pub fn open_path(path: &str) -> Result<Self, HelperError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| HelperError::DeviceOpenFailed {
                code: e.raw_os_error().unwrap_or(0) as u32,
                message: format!("{path}: {e}"),
            })?;
        Ok(DeviceHandle {
            file,
            sector_size: 512,
        })
    }

    pub fn unlock_volume(&self) {}
}

#[cfg(windows)]
impl DeviceHandle {
    /// Open either flavour of target based on the path shape.
    pub fn open(path: &str) -> Result<Self, HelperError> {
        if parse_physical_drive_number(path).is_some() {
            Self::open_physical(path)
        } else {
            Self::open_volume(path)
        }
    }
}

#[cfg(not(windows))]
impl DeviceHandle {
    pub fn open(path: &str) -> Result<Self, HelperError> {
        Self::open_path(path)
    }
}
