//! Wire protocol shared by the client session manager and the helper.
//!
//! A session speaks length-prefixed binary frames over a local socket. A
//! frame is either a single string (handshake tokens, commands, completion
//! statuses) or a progress triple. Strings travel as a `u32` big-endian byte
//! length followed by UTF-16BE code units; progress triples are
//! `i32 kind, i64 now, i64 total`, also big-endian.

pub mod command;
pub mod wire;

/// Serialisation revision shared by both endpoints. Compile-time only: it
/// pins the string encoding (UTF-16BE, u32 length prefix) and the integer
/// widths. Peers built with a different revision fail frame parsing and the
/// state machines treat that as a protocol violation.
pub const WIRE_REVISION: u32 = 6;

/// First frame, helper to client.
pub const HELLO: &str = "HELLO";
/// Handshake reply, client to helper.
pub const READY: &str = "READY";
/// Completion status for a command that succeeded.
pub const SUCCESS: &str = "SUCCESS";
/// Completion status for a command that failed.
pub const FAILURE: &str = "FAILURE";

/// Default local-socket endpoint name.
pub const DEFAULT_SOCKET_NAME: &str = "rpihelperlocalsocket";

/// Upper bound on a single frame. CUSTOMIZE carries Base64 blobs, so this is
/// generous, but a parse that claims more than this is treated as garbage.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Kind discriminant carried in a progress frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Download = 1,
    Verify = 2,
    Write = 3,
}

impl ProgressKind {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(ProgressKind::Download),
            2 => Some(ProgressKind::Verify),
            3 => Some(ProgressKind::Write),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Progress {
        kind: ProgressKind,
        now: i64,
        total: i64,
    },
}
