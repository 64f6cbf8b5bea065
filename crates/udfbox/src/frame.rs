//! Length-prefixed message framing over a duplex byte stream.
//!
//! Wire shape, host and worker alike:
//!
//! ```text
//! [8 bytes little-endian unsigned length N] [N bytes payload]
//! ```
//!
//! Payloads are opaque here; the typed façade chooses the encoding.
//!
//! Two entry points:
//!
//! - [`read_frame`] / [`write_frame`] block on an ordinary `Read`/`Write`
//!   stream (worker binaries, the control-plane handshake path)
//! - [`FrameDecoder`] accumulates partial non-blocking reads until a full
//!   frame is available (dispatcher response watchers)
//!
//! Writes are atomic at the framing layer: [`FrameWriter`] poisons itself
//! on the first short write and every later write fails.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Frames larger than this are rejected as malformed.
pub const DEFAULT_MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

const HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    /// EOF before a complete frame.
    #[error("peer closed before a complete frame")]
    PeerClosed,

    /// Announced length exceeds the configured cap.
    #[error("frame length {len} exceeds cap {cap}")]
    Malformed { len: u64, cap: u64 },

    /// A previous write failed part-way; the channel is unusable.
    #[error("channel poisoned by an earlier failed write")]
    Poisoned,

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Read one complete frame, blocking until it arrives.
pub fn read_frame<R: Read>(reader: &mut R, cap: u64) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut header)?;
    let len = u64::from_le_bytes(header);
    if len > cap {
        return Err(FrameError::Malformed { len, cap });
    }
    let mut payload = vec![0u8; len as usize];
    read_exact_or_closed(reader, &mut payload)?;
    Ok(payload)
}

/// Write one complete frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8], cap: u64) -> Result<(), FrameError> {
    let len = payload.len() as u64;
    if len > cap {
        return Err(FrameError::Malformed { len, cap });
    }
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

fn read_exact_or_closed<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::PeerClosed
        } else {
            FrameError::Io(e)
        }
    })
}

/// Framing writer that poisons itself on a short write.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    cap: u64,
    poisoned: bool,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, cap: u64) -> Self {
        Self {
            inner,
            cap,
            poisoned: false,
        }
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        match write_frame(&mut self.inner, payload, self.cap) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

/// Incremental decoder for non-blocking reads.
///
/// Feed whatever bytes arrived with [`extend`](Self::extend), then ask for
/// a frame with [`try_frame`](Self::try_frame). Oversized announced
/// lengths are detected as soon as the header is complete, before any
/// payload is buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    cap: u64,
}

impl FrameDecoder {
    pub fn new(cap: u64) -> Self {
        Self {
            buf: Vec::new(),
            cap,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one has accumulated.
    pub fn try_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u64::from_le_bytes(self.buf[..HEADER_LEN].try_into().expect("header length"));
        if len > self.cap {
            return Err(FrameError::Malformed { len, cap: self.cap });
        }
        let total = HEADER_LEN + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(payload))
    }

    /// Bytes buffered beyond the last complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_frame(&mut out, payload, DEFAULT_MAX_FRAME_LEN).unwrap();
        out
    }

    #[test]
    fn round_trip() {
        for payload in [&b""[..], b"x", b"hello frame", &[0u8; 4096][..]] {
            let encoded = frame_bytes(payload);
            let decoded = read_frame(&mut Cursor::new(&encoded), DEFAULT_MAX_FRAME_LEN).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn header_is_little_endian() {
        let encoded = frame_bytes(b"ab");
        assert_eq!(&encoded[..8], &[2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&encoded[8..], b"ab");
    }

    #[test]
    fn eof_before_header_is_peer_closed() {
        let err = read_frame(&mut Cursor::new(&[]), DEFAULT_MAX_FRAME_LEN).unwrap_err();
        assert!(matches!(err, FrameError::PeerClosed));
    }

    #[test]
    fn eof_mid_payload_is_peer_closed() {
        let mut encoded = frame_bytes(b"truncated");
        encoded.truncate(11);
        let err = read_frame(&mut Cursor::new(&encoded), DEFAULT_MAX_FRAME_LEN).unwrap_err();
        assert!(matches!(err, FrameError::PeerClosed));
    }

    #[test]
    fn oversized_length_is_malformed() {
        let mut encoded = (DEFAULT_MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        encoded.extend_from_slice(b"whatever");
        let err = read_frame(&mut Cursor::new(&encoded), DEFAULT_MAX_FRAME_LEN).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));
    }

    #[test]
    fn write_respects_cap() {
        let mut out = Vec::new();
        let err = write_frame(&mut out, &[0u8; 32], 16).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { len: 32, cap: 16 }));
        assert!(out.is_empty());
    }

    #[test]
    fn decoder_handles_partial_feeds() {
        let encoded = frame_bytes(b"split me");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        for chunk in encoded.chunks(3) {
            decoder.extend(chunk);
        }
        assert_eq!(decoder.try_frame().unwrap().unwrap(), b"split me");
        assert!(decoder.try_frame().unwrap().is_none());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_returns_none_until_complete() {
        let encoded = frame_bytes(b"payload");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.extend(&encoded[..10]);
        assert!(decoder.try_frame().unwrap().is_none());
        decoder.extend(&encoded[10..]);
        assert_eq!(decoder.try_frame().unwrap().unwrap(), b"payload");
    }

    #[test]
    fn decoder_yields_back_to_back_frames_in_order() {
        let mut stream = frame_bytes(b"first");
        stream.extend_from_slice(&frame_bytes(b"second"));
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.extend(&stream);
        assert_eq!(decoder.try_frame().unwrap().unwrap(), b"first");
        assert_eq!(decoder.try_frame().unwrap().unwrap(), b"second");
        assert!(decoder.try_frame().unwrap().is_none());
    }

    #[test]
    fn decoder_rejects_oversized_header_immediately() {
        let mut decoder = FrameDecoder::new(8);
        decoder.extend(&1024u64.to_le_bytes());
        assert!(matches!(
            decoder.try_frame(),
            Err(FrameError::Malformed { len: 1024, cap: 8 })
        ));
    }

    #[test]
    fn writer_poisons_after_short_write() {
        struct Choke;
        impl std::io::Write for Choke {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "choked"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut writer = FrameWriter::new(Choke, DEFAULT_MAX_FRAME_LEN);
        assert!(matches!(writer.send(b"x"), Err(FrameError::Io(_))));
        assert!(matches!(writer.send(b"x"), Err(FrameError::Poisoned)));
    }
}
