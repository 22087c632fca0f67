//! Incremental decoding of gzipped, record-marked XDR streams.
//!
//! Category files are gzip-compressed sequences of XDR records, each
//! preceded by a 4-byte big-endian record mark (RFC 5531). Bit 31 of the
//! mark is the "last fragment" flag and has to be cleared to get the length:
//!
//! ```text
//! [1LLLLLLL LLLLLLLL LLLLLLLL LLLLLLLL] [payload: L bytes] [mark] [payload] ...
//! ```
//!
//! Files are consumed as they arrive over HTTP, so both layers work on
//! arbitrary chunk boundaries: [`GzipStreamDecoder`] inflates whatever bytes
//! it is fed, and [`RecordFrameSplitter`] emits complete records once all
//! their bytes have been seen.

use std::io::{self, Write};

use bytes::{Buf, Bytes, BytesMut};
use flate2::write::GzDecoder;

const RECORD_MARK_LEN: usize = 4;
const LENGTH_MASK: u32 = 0x7fff_ffff;

/// Largest record accepted. Ledger headers, transaction sets and result
/// sets are far below this.
pub const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;

/// Framing problems in a record stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("record length {0} exceeds the {MAX_RECORD_LEN} byte limit")]
    TooLarge(usize),

    #[error("stream ended inside a record ({0} trailing bytes)")]
    Truncated(usize),
}

/// Splits a byte stream into XDR records.
#[derive(Debug, Default)]
pub struct RecordFrameSplitter {
    buffer: BytesMut,
}

impl RecordFrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every record it completed.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        while self.buffer.len() >= RECORD_MARK_LEN {
            let mark = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]);
            let len = (mark & LENGTH_MASK) as usize;
            if len > MAX_RECORD_LEN {
                return Err(FrameError::TooLarge(len));
            }
            if self.buffer.len() < RECORD_MARK_LEN + len {
                break;
            }
            self.buffer.advance(RECORD_MARK_LEN);
            frames.push(self.buffer.split_to(len).freeze());
        }
        Ok(frames)
    }

    /// Bytes received that do not yet form a complete record.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Succeeds only if the stream ended on a record boundary.
    pub fn finish(self) -> Result<(), FrameError> {
        match self.buffer.len() {
            0 => Ok(()),
            n => Err(FrameError::Truncated(n)),
        }
    }
}

/// Push-style gzip decoder writing inflated bytes into `W`.
pub struct GzipStreamDecoder<W: Write> {
    decoder: GzDecoder<W>,
}

impl<W: Write> GzipStreamDecoder<W> {
    pub fn new(sink: W) -> Self {
        Self {
            decoder: GzDecoder::new(sink),
        }
    }

    pub fn feed(&mut self, compressed: &[u8]) -> io::Result<()> {
        self.decoder.write_all(compressed)
    }

    pub fn sink_mut(&mut self) -> &mut W {
        self.decoder.get_mut()
    }

    /// Flush remaining output and check the gzip trailer.
    pub fn finish(self) -> io::Result<W> {
        self.decoder.finish()
    }
}

impl GzipStreamDecoder<Vec<u8>> {
    /// Take the bytes inflated so far.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.decoder.get_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn record(payload: &[u8]) -> Vec<u8> {
        let mark = (payload.len() as u32) | 0x8000_0000;
        let mut out = mark.to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_split_clears_continuation_bit() {
        let mut splitter = RecordFrameSplitter::new();
        let mut data = record(b"abcd");
        data.extend(record(b"efghijkl"));
        let frames = splitter.push(&data).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efghijkl")]);
        splitter.finish().unwrap();
    }

    #[test]
    fn test_split_across_chunk_boundaries() {
        let mut data = record(b"first");
        data.extend(record(b"second!!"));
        let mut splitter = RecordFrameSplitter::new();
        let mut frames = Vec::new();
        for byte in &data {
            frames.extend(splitter.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1][..], b"second!!");
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let mut splitter = RecordFrameSplitter::new();
        let data = record(b"abcdefgh");
        assert!(splitter.push(&data[..7]).unwrap().is_empty());
        assert!(matches!(splitter.finish(), Err(FrameError::Truncated(7))));
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut splitter = RecordFrameSplitter::new();
        let mark = 0xffff_ffffu32.to_be_bytes();
        assert!(matches!(splitter.push(&mark), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn test_gzip_decoder_in_pieces() {
        let payload: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let compressed = gzip(&payload);
        let mut decoder = GzipStreamDecoder::new(Vec::new());
        let mut out = Vec::new();
        for chunk in compressed.chunks(97) {
            decoder.feed(chunk).unwrap();
            out.extend(decoder.take_output());
        }
        out.extend(decoder.finish().unwrap());
        assert_eq!(out, payload);
    }

    #[test]
    fn test_gzip_decoder_rejects_garbage() {
        let mut decoder = GzipStreamDecoder::new(Vec::new());
        let fed = decoder.feed(b"this is not gzip at all, not even close");
        assert!(fed.is_err() || decoder.finish().is_err());
    }
}
