//! Framed blob envelope: length prefix, BlobHeader, Blob.
//!
//! The outer frame is a 4-byte big-endian size followed by a `BlobHeader`
//! message, followed by `datasize` bytes holding a `Blob` message. The Blob
//! carries the (possibly compressed) block payload.
//!
//! # Limits
//! - `BlobHeader` may not exceed [`MAX_BLOB_HEADER_SIZE`] (64 KiB).
//! - `datasize` and the uncompressed payload may not exceed
//!   [`MAX_UNCOMPRESSED_BLOB_SIZE`] (32 MiB).
//!
//! EOF is normal only *between* blobs: a short read inside a frame is an
//! I/O error, which is how a mid-blob truncation surfaces. The framer does
//! not attempt to re-sync after corruption.

use std::cell::RefCell;
use std::io::{self, Read, Write};

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use prost::Message;
use tracing::trace;

use super::proto;
use crate::error::Error;

/// Maximum serialized BlobHeader size (64 KiB).
pub const MAX_BLOB_HEADER_SIZE: usize = 64 * 1024;

/// Maximum blob payload size, compressed or not (32 MiB).
pub const MAX_UNCOMPRESSED_BLOB_SIZE: usize = 32 * 1024 * 1024;

/// Blob type of the file header block.
pub const OSM_HEADER_TYPE: &str = "OSMHeader";

/// Blob type of data blocks.
pub const OSM_DATA_TYPE: &str = "OSMData";

thread_local! {
    // Reused inflate state; blob decompression runs once per task on a
    // pool thread, so per-thread reuse removes all steady-state allocation
    // of zlib internals.
    static INFLATER: RefCell<Decompress> = RefCell::new(Decompress::new(true));
}

/// Inflates a zlib stream that must produce exactly `expected` bytes.
fn inflate_exact(input: &[u8], expected: usize) -> Result<Vec<u8>, Error> {
    INFLATER.with(|cell| {
        let mut de = cell.borrow_mut();
        de.reset(true);

        let mut out = Vec::with_capacity(expected);
        let mut in_pos = 0usize;
        loop {
            let before_in = de.total_in() as usize;
            let before_out = de.total_out() as usize;
            let status = de
                .decompress_vec(&input[in_pos..], &mut out, FlushDecompress::Finish)
                .map_err(|e| Error::format(format!("zlib inflate failed: {e}")))?;
            let consumed = de.total_in() as usize - before_in;
            let produced = de.total_out() as usize - before_out;
            in_pos += consumed;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if out.len() >= expected || in_pos >= input.len() {
                        return Err(Error::format(
                            "zlib stream does not match declared raw_size",
                        ));
                    }
                    if consumed == 0 && produced == 0 {
                        return Err(Error::format("zlib inflate stalled"));
                    }
                }
            }
        }
        if out.len() != expected {
            return Err(Error::format(format!(
                "zlib raw_size mismatch: got {}, expected {expected}",
                out.len()
            )));
        }
        Ok(out)
    })
}

/// Compresses a block payload for a `zlib_data` blob.
pub(crate) fn deflate(input: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(input.len() / 2 + 64),
        Compression::default(),
    );
    encoder.write_all(input)?;
    Ok(encoder.finish()?)
}

/// Decompresses a Blob message into its block payload.
///
/// Dispatch: `raw` passes through, `zlib_data` inflates to exactly
/// `raw_size` bytes, `lzma_data` fails with unsupported-compression.
pub fn decode_blob(blob_bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let blob = proto::Blob::decode(blob_bytes)?;

    if let Some(raw) = blob.raw {
        if raw.len() > MAX_UNCOMPRESSED_BLOB_SIZE {
            return Err(Error::format(format!("raw blob too large: {}", raw.len())));
        }
        return Ok(raw);
    }
    if let Some(zlib) = blob.zlib_data {
        let raw_size = blob
            .raw_size
            .ok_or_else(|| Error::format("zlib blob without raw_size"))?;
        if raw_size < 0 || raw_size as usize > MAX_UNCOMPRESSED_BLOB_SIZE {
            return Err(Error::format(format!("invalid raw_size: {raw_size}")));
        }
        return inflate_exact(&zlib, raw_size as usize);
    }
    if blob.lzma_data.is_some() {
        return Err(Error::UnsupportedCompression);
    }
    Err(Error::format("blob contains no data"))
}

/// Reads framed blobs from a serial stream.
#[derive(Debug)]
pub struct BlobReader<R> {
    input: R,
}

impl<R: Read> BlobReader<R> {
    /// Wraps a byte stream positioned at the start of a frame.
    pub fn new(input: R) -> Self {
        Self { input }
    }

    /// Reads the 4-byte frame length, allowing clean EOF before it.
    fn read_frame_len(&mut self) -> Result<Option<u32>, Error> {
        let mut buf = [0u8; 4];
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.input.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated blob frame length",
                    )
                    .into())
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(u32::from_be_bytes(buf)))
    }

    fn read_exact(&mut self, len: usize, what: &str) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        self.input.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("truncated {what}"),
                ))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(buf)
    }

    /// Reads the next blob of the expected type.
    ///
    /// Returns the raw Blob message bytes (still compressed), or `None` on
    /// clean EOF between blobs. Fails on oversized headers or payloads, a
    /// type mismatch, or truncation inside the frame.
    pub fn read_blob(&mut self, expected_type: &str) -> Result<Option<Vec<u8>>, Error> {
        let header_size = match self.read_frame_len()? {
            None => return Ok(None),
            Some(n) => n as usize,
        };
        if header_size > MAX_BLOB_HEADER_SIZE {
            return Err(Error::format(format!(
                "BlobHeader too large: {header_size} bytes"
            )));
        }

        let header_bytes = self.read_exact(header_size, "BlobHeader")?;
        let header = proto::BlobHeader::decode(header_bytes.as_slice())?;

        let blob_type = header
            .r#type
            .ok_or_else(|| Error::format("BlobHeader without type"))?;
        if blob_type != expected_type {
            return Err(Error::format(format!(
                "unexpected blob type {blob_type:?} (expected {expected_type:?})"
            )));
        }

        let datasize = header
            .datasize
            .ok_or_else(|| Error::format("BlobHeader without datasize"))?;
        if datasize <= 0 || datasize as usize > MAX_UNCOMPRESSED_BLOB_SIZE {
            return Err(Error::format(format!("invalid blob size: {datasize}")));
        }

        trace!(blob_type = %blob_type, datasize, "read blob frame");
        let blob = self.read_exact(datasize as usize, "blob body")?;
        Ok(Some(blob))
    }
}

/// Writes framed blobs to a serial stream.
#[derive(Debug)]
pub struct BlobWriter<W> {
    out: W,
}

impl<W: Write> BlobWriter<W> {
    /// Wraps an output stream.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Frames and writes one blob.
    ///
    /// `payload` is the uncompressed block message; with `compress` it is
    /// deflated into a `zlib_data` blob, otherwise stored `raw`.
    pub fn write_blob(
        &mut self,
        blob_type: &str,
        payload: &[u8],
        compress: bool,
    ) -> Result<(), Error> {
        if payload.len() > MAX_UNCOMPRESSED_BLOB_SIZE {
            return Err(Error::format(format!(
                "block too large for one blob: {} bytes",
                payload.len()
            )));
        }

        let blob = if compress {
            proto::Blob {
                raw: None,
                raw_size: Some(payload.len() as i32),
                zlib_data: Some(deflate(payload)?),
                lzma_data: None,
            }
        } else {
            proto::Blob {
                raw: Some(payload.to_vec()),
                raw_size: None,
                zlib_data: None,
                lzma_data: None,
            }
        };
        let blob_bytes = blob.encode_to_vec();

        let header = proto::BlobHeader {
            r#type: Some(blob_type.to_owned()),
            indexdata: None,
            datasize: Some(blob_bytes.len() as i32),
        };
        let header_bytes = header.encode_to_vec();
        assert!(header_bytes.len() <= MAX_BLOB_HEADER_SIZE);

        trace!(
            blob_type,
            payload = payload.len(),
            framed = blob_bytes.len(),
            "write blob frame"
        );
        self.out
            .write_all(&(header_bytes.len() as u32).to_be_bytes())?;
        self.out.write_all(&header_bytes)?;
        self.out.write_all(&blob_bytes)?;
        Ok(())
    }

    /// Flushes the underlying stream.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(blob_type: &str, payload: &[u8], compress: bool) -> Vec<u8> {
        let mut out = Vec::new();
        BlobWriter::new(&mut out)
            .write_blob(blob_type, payload, compress)
            .unwrap();
        out
    }

    #[test]
    fn raw_round_trip() {
        let bytes = frame(OSM_DATA_TYPE, b"hello block", false);
        let mut reader = BlobReader::new(bytes.as_slice());
        let blob = reader.read_blob(OSM_DATA_TYPE).unwrap().unwrap();
        assert_eq!(decode_blob(&blob).unwrap(), b"hello block");
        assert!(reader.read_blob(OSM_DATA_TYPE).unwrap().is_none());
    }

    #[test]
    fn zlib_round_trip() {
        let payload = vec![42u8; 100_000];
        let bytes = frame(OSM_DATA_TYPE, &payload, true);
        assert!(bytes.len() < payload.len());
        let mut reader = BlobReader::new(bytes.as_slice());
        let blob = reader.read_blob(OSM_DATA_TYPE).unwrap().unwrap();
        assert_eq!(decode_blob(&blob).unwrap(), payload);
    }

    #[test]
    fn type_mismatch_fails() {
        let bytes = frame(OSM_DATA_TYPE, b"x", false);
        let mut reader = BlobReader::new(bytes.as_slice());
        let err = reader.read_blob(OSM_HEADER_TYPE).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn oversized_header_fails() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((MAX_BLOB_HEADER_SIZE as u32) + 1).to_be_bytes());
        let mut reader = BlobReader::new(bytes.as_slice());
        let err = reader.read_blob(OSM_DATA_TYPE).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn lzma_is_unsupported() {
        let blob = proto::Blob {
            raw: None,
            raw_size: Some(4),
            zlib_data: None,
            lzma_data: Some(vec![1, 2, 3]),
        };
        let err = decode_blob(&blob.encode_to_vec()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCompression));
    }

    #[test]
    fn truncated_body_is_io_error() {
        let bytes = frame(OSM_DATA_TYPE, b"some payload data", false);
        let cut = &bytes[..bytes.len() - 5];
        let mut reader = BlobReader::new(cut);
        let err = reader.read_blob(OSM_DATA_TYPE).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn truncated_length_prefix_is_io_error() {
        let bytes = frame(OSM_DATA_TYPE, b"x", false);
        let cut = &bytes[..2];
        let mut reader = BlobReader::new(cut);
        let err = reader.read_blob(OSM_DATA_TYPE).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn raw_size_mismatch_fails() {
        let blob = proto::Blob {
            raw: None,
            raw_size: Some(3),
            zlib_data: Some(deflate(b"longer than three").unwrap()),
            lzma_data: None,
        };
        let err = decode_blob(&blob.encode_to_vec()).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }
}
