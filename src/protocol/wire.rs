//! Frame encoding and a partial-read-tolerant decoder.
//!
//! The leading `u32` of every frame disambiguates its type: the values 1-3
//! are progress kinds, anything else is the byte length of a UTF-16BE string.
//! Protocol strings are at least five characters, so the two ranges never
//! collide.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use super::{Frame, ProgressKind, MAX_FRAME_BYTES};

const PROGRESS_FRAME_LEN: usize = 4 + 8 + 8;

/// Encode a string frame: u32 BE byte length, then UTF-16BE code units.
pub fn write_text(w: &mut impl Write, text: &str) -> io::Result<()> {
    let units: Vec<u16> = text.encode_utf16().collect();
    w.write_u32::<BigEndian>((units.len() * 2) as u32)?;
    for unit in units {
        w.write_u16::<BigEndian>(unit)?;
    }
    Ok(())
}

/// Encode a progress frame: i32 kind, i64 now, i64 total.
pub fn write_progress(w: &mut impl Write, kind: ProgressKind, now: i64, total: i64) -> io::Result<()> {
    w.write_i32::<BigEndian>(kind.as_raw())?;
    w.write_i64::<BigEndian>(now)?;
    w.write_i64::<BigEndian>(total)?;
    Ok(())
}

fn malformed(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Accumulates bytes from the socket and yields complete frames.
///
/// A short read leaves the partial frame buffered; `next_frame` returns
/// `Ok(None)` until the rest arrives. Malformed data is an error, never a
/// silent resync.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the peer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull readable bytes from `r` into the buffer. Returns the number of
    /// bytes read; 0 means the peer closed the stream.
    pub fn fill_from(&mut self, r: &mut impl Read) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let n = r.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Decode the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let head = BigEndian::read_u32(&self.buf[..4]);

        if let Some(kind) = ProgressKind::from_raw(head as i32) {
            if self.buf.len() < PROGRESS_FRAME_LEN {
                return Ok(None);
            }
            let mut cursor = &self.buf[4..PROGRESS_FRAME_LEN];
            let now = cursor.read_i64::<BigEndian>()?;
            let total = cursor.read_i64::<BigEndian>()?;
            self.buf.drain(..PROGRESS_FRAME_LEN);
            return Ok(Some(Frame::Progress { kind, now, total }));
        }

        let len = head as usize;
        if len > MAX_FRAME_BYTES {
            return Err(malformed(format!("frame too large: {len} bytes")));
        }
        if len % 2 != 0 {
            return Err(malformed(format!("odd string frame length: {len}")));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }

        let units: Vec<u16> = self.buf[4..4 + len]
            .chunks_exact(2)
            .map(BigEndian::read_u16)
            .collect();
        let text = String::from_utf16(&units)
            .map_err(|_| malformed("string frame is not valid UTF-16"))?;
        self.buf.drain(..4 + len);
        Ok(Some(Frame::Text(text)))
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_text(s: &str) -> Vec<u8> {
        let mut out = Vec::new();
        write_text(&mut out, s).unwrap();
        out
    }

    #[test]
    fn text_frame_round_trip() {
        let mut reader = FrameReader::new();
        reader.push(&encode_text("HELLO"));
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::Text("HELLO".to_string()))
        );
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn progress_frame_round_trip() {
        let mut out = Vec::new();
        write_progress(&mut out, ProgressKind::Write, 1024, 1048576).unwrap();
        assert_eq!(out.len(), 20);

        let mut reader = FrameReader::new();
        reader.push(&out);
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::Progress {
                kind: ProgressKind::Write,
                now: 1024,
                total: 1048576,
            })
        );
    }

    #[test]
    fn partial_reads_accumulate() {
        let bytes = encode_text("SUCCESS");
        let mut reader = FrameReader::new();
        for b in &bytes[..bytes.len() - 1] {
            reader.push(std::slice::from_ref(b));
            assert_eq!(reader.next_frame().unwrap(), None);
        }
        reader.push(&bytes[bytes.len() - 1..]);
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::Text("SUCCESS".to_string()))
        );
    }

    #[test]
    fn back_to_back_frames() {
        let mut bytes = encode_text("FAILURE");
        write_progress(&mut bytes, ProgressKind::Verify, 7, 9).unwrap();
        bytes.extend_from_slice(&encode_text("SUCCESS"));

        let mut reader = FrameReader::new();
        reader.push(&bytes);
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::Text("FAILURE".to_string()))
        );
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::Progress {
                kind: ProgressKind::Verify,
                now: 7,
                total: 9,
            })
        );
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::Text("SUCCESS".to_string()))
        );
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut reader = FrameReader::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((MAX_FRAME_BYTES as u32 + 2).to_be_bytes()));
        reader.push(&bytes);
        assert!(reader.next_frame().is_err());
    }

    #[test]
    fn odd_length_is_rejected() {
        let mut reader = FrameReader::new();
        reader.push(&11u32.to_be_bytes());
        reader.push(&[0u8; 11]);
        assert!(reader.next_frame().is_err());
    }

    #[test]
    fn non_ascii_round_trip() {
        let mut reader = FrameReader::new();
        reader.push(&encode_text("pfad\u{00e9} \u{20ac}"));
        assert_eq!(
            reader.next_frame().unwrap(),
            Some(Frame::Text("pfad\u{00e9} \u{20ac}".to_string()))
        );
    }
}
