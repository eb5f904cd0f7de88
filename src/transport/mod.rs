//! Local-socket endpoint shared by the client and the helper.
//!
//! On Windows the endpoint is a named pipe `\\.\pipe\<name>` whose security
//! descriptor grants world access, so the unprivileged client can reach the
//! elevated server. On Unix hosts (development and the test suite) the same
//! API is backed by a Unix domain socket under the temp directory.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use self::unix::{connect, LocalListener, LocalStream};
#[cfg(windows)]
pub use self::windows::{connect, LocalListener, LocalStream};
