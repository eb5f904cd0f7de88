//! Unix domain socket endpoint, used on development hosts and by the test
//! suite. The socket file lives in the temp directory and is world-writable
//! so an unprivileged peer can connect, matching the Windows pipe ACL.

use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

fn endpoint_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.sock"))
}

pub struct LocalListener {
    inner: UnixListener,
    path: PathBuf,
}

impl LocalListener {
    pub fn bind(name: &str) -> io::Result<Self> {
        let path = endpoint_path(name);
        // Remove a stale socket file from a previous run
        let _ = std::fs::remove_file(&path);
        let inner = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner, path })
    }

    /// Accept a pending connection without blocking.
    pub fn try_accept(&self) -> io::Result<Option<LocalStream>> {
        match self.inner.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(LocalStream { inner: stream }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Block until a client connects.
    pub fn accept(&self) -> io::Result<LocalStream> {
        loop {
            if let Some(stream) = self.try_accept()? {
                return Ok(stream);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct LocalStream {
    inner: UnixStream,
}

impl LocalStream {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(std::net::Shutdown::Both);
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub fn connect(name: &str) -> io::Result<LocalStream> {
    let stream = UnixStream::connect(endpoint_path(name))?;
    Ok(LocalStream { inner: stream })
}
