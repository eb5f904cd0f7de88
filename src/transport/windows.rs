//! Named pipe endpoint `\\.\pipe\<name>`.
//!
//! The server side creates a single pipe instance with a world-access
//! security descriptor so the unprivileged client can connect to the
//! elevated helper. Only one client is served at a time; while an instance
//! is connected there is no listening instance, so a second connector is
//! refused by the OS at connect time.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, LocalFree, ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND,
    ERROR_PIPE_BUSY, ERROR_PIPE_CONNECTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows_sys::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, ReadFile, WriteFile, OPEN_EXISTING, PIPE_ACCESS_DUPLEX,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PeekNamedPipe, PIPE_READMODE_BYTE,
    PIPE_TYPE_BYTE, PIPE_WAIT,
};

const PIPE_BUFFER_BYTES: u32 = 64 * 1024;

// Allow GENERIC_ALL to Everyone ("WD"); the pipe must be reachable from the
// unprivileged client across the elevation boundary.
const WORLD_ACCESS_SDDL: &str = "D:(A;;GA;;;WD)";

fn pipe_path(name: &str) -> Vec<u16> {
    format!(r"\\.\pipe\{name}")
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect()
}

fn last_os_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

/// Owns the security descriptor allocated by the SDDL conversion.
struct WorldAccessDescriptor {
    descriptor: PSECURITY_DESCRIPTOR,
}

impl WorldAccessDescriptor {
    fn new() -> io::Result<Self> {
        let sddl: Vec<u16> = WORLD_ACCESS_SDDL
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let mut descriptor: PSECURITY_DESCRIPTOR = std::ptr::null_mut();
        let ok = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl.as_ptr(),
                SDDL_REVISION_1,
                &mut descriptor,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(last_os_error());
        }
        Ok(Self { descriptor })
    }

    fn attributes(&self) -> SECURITY_ATTRIBUTES {
        SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: self.descriptor,
            bInheritHandle: 0,
        }
    }
}

impl Drop for WorldAccessDescriptor {
    fn drop(&mut self) {
        unsafe {
            LocalFree(self.descriptor as _);
        }
    }
}

pub struct LocalListener {
    path: Vec<u16>,
    security: WorldAccessDescriptor,
}

impl LocalListener {
    pub fn bind(name: &str) -> io::Result<Self> {
        if !name.is_ascii() || name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "endpoint name must be a non-empty ASCII identifier",
            ));
        }
        Ok(Self {
            path: pipe_path(name),
            security: WorldAccessDescriptor::new()?,
        })
    }

    /// Block until a client connects to a fresh pipe instance.
    pub fn accept(&self) -> io::Result<LocalStream> {
        let mut attributes = self.security.attributes();
        let handle = unsafe {
            CreateNamedPipeW(
                self.path.as_ptr(),
                PIPE_ACCESS_DUPLEX,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                1,
                PIPE_BUFFER_BYTES,
                PIPE_BUFFER_BYTES,
                0,
                &mut attributes,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(last_os_error());
        }

        let connected = unsafe { ConnectNamedPipe(handle, std::ptr::null_mut()) };
        if connected == 0 {
            let code = unsafe { GetLastError() };
            // The client may have connected between create and listen
            if code != ERROR_PIPE_CONNECTED {
                unsafe { CloseHandle(handle) };
                return Err(io::Error::from_raw_os_error(code as i32));
            }
        }

        Ok(LocalStream {
            handle,
            server_end: true,
            read_timeout: std::cell::Cell::new(None),
        })
    }

    /// Non-blocking accept. While a client is being served there is no
    /// listening instance, so there is never a second pending connection to
    /// pick up here.
    pub fn try_accept(&self) -> io::Result<Option<LocalStream>> {
        Ok(None)
    }
}

pub struct LocalStream {
    handle: HANDLE,
    server_end: bool,
    read_timeout: std::cell::Cell<Option<Duration>>,
}

impl LocalStream {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout.set(timeout);
        Ok(())
    }

    pub fn shutdown(&self) {
        unsafe {
            FlushFileBuffers(self.handle);
            if self.server_end {
                DisconnectNamedPipe(self.handle);
            }
        }
    }

    fn bytes_available(&self) -> io::Result<u32> {
        let mut available = 0u32;
        let ok = unsafe {
            PeekNamedPipe(
                self.handle,
                std::ptr::null_mut(),
                0,
                std::ptr::null_mut(),
                &mut available,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            if code == ERROR_BROKEN_PIPE {
                return Ok(0);
            }
            return Err(io::Error::from_raw_os_error(code as i32));
        }
        Ok(available)
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Named pipes have no native receive timeout; poll the pipe until
        // data arrives or the deadline passes.
        if let Some(timeout) = self.read_timeout.get() {
            let deadline = Instant::now() + timeout;
            while self.bytes_available()? == 0 {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe read timed out"));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        let mut read = 0u32;
        let ok = unsafe {
            ReadFile(
                self.handle,
                buf.as_mut_ptr(),
                buf.len() as u32,
                &mut read,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            // Peer hangup reads as end-of-stream, like a closed socket
            if code == ERROR_BROKEN_PIPE {
                return Ok(0);
            }
            return Err(io::Error::from_raw_os_error(code as i32));
        }
        Ok(read as usize)
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0u32;
        let ok = unsafe {
            WriteFile(
                self.handle,
                buf.as_ptr(),
                buf.len() as u32,
                &mut written,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(last_os_error());
        }
        Ok(written as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        if unsafe { FlushFileBuffers(self.handle) } == 0 {
            return Err(last_os_error());
        }
        Ok(())
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.shutdown();
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

pub fn connect(name: &str) -> io::Result<LocalStream> {
    let path = pipe_path(name);
    let handle = unsafe {
        CreateFileW(
            path.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            0,
            std::ptr::null_mut(),
            OPEN_EXISTING,
            0,
            0,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        let code = unsafe { GetLastError() };
        let kind = match code {
            ERROR_FILE_NOT_FOUND => io::ErrorKind::NotFound,
            ERROR_PIPE_BUSY => io::ErrorKind::ConnectionRefused,
            _ => io::ErrorKind::Other,
        };
        return Err(io::Error::new(
            kind,
            format!("cannot open pipe (error code {code})"),
        ));
    }
    Ok(LocalStream {
        handle,
        server_end: false,
        read_timeout: std::cell::Cell::new(None),
    })
}
