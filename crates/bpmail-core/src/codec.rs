//! Zlib payload codec.
//!
//! Inbound payloads are inflated into a buffer that starts at
//! [`INITIAL_OUTPUT_CAPACITY`] and doubles whenever the stream fills it, so
//! there is no fixed ceiling on the decompressed size. Outbound payloads are
//! deflated into a buffer presized by [`compress_bound`].

use flate2::{
    Compress, Compression, Decompress, DecompressError, FlushCompress, FlushDecompress, Status,
};
use thiserror::Error;

/// Capacity of the inflate output buffer before the first doubling.
pub const INITIAL_OUTPUT_CAPACITY: usize = 16 * 1024;

/// Payload codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input does not fit the codec's 32-bit length field.
    #[error("input of {0} bytes is too large for the codec")]
    InputTooLarge(usize),
    /// Stream state is inconsistent (for example a preset dictionary is required).
    #[error("decompression stream error: {0}")]
    Stream(String),
    /// Compressed data is corrupt.
    #[error("corrupt compressed data: {0}")]
    Data(String),
    /// Output buffer could not be grown.
    #[error("could not grow output buffer to {0} bytes")]
    Memory(usize),
    /// Input ran out before the end-of-stream marker.
    #[error("compressed stream is truncated")]
    Truncated,
    /// Deflate stream failed or stalled.
    #[error("compression failed: {0}")]
    Compress(String),
}

/// Inflates a complete zlib stream.
///
/// Fails with [`CodecError::Truncated`] rather than returning partial output
/// when `input` ends before the end-of-stream marker.
pub fn inflate(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    inflate_with_capacity(input, INITIAL_OUTPUT_CAPACITY)
}

/// Inflates `input` starting from an output buffer of `initial_capacity` bytes.
pub fn inflate_with_capacity(input: &[u8], initial_capacity: usize) -> Result<Vec<u8>, CodecError> {
    if u32::try_from(input.len()).is_err() {
        return Err(CodecError::InputTooLarge(input.len()));
    }

    let mut stream = Decompress::new(true);
    let mut out = Vec::new();
    let initial_capacity = initial_capacity.max(1);
    out.try_reserve_exact(initial_capacity)
        .map_err(|_| CodecError::Memory(initial_capacity))?;

    loop {
        let before_in = stream.total_in();
        let before_out = stream.total_out();
        let consumed = usize::try_from(before_in).unwrap_or(input.len());
        let remaining = input.get(consumed..).unwrap_or_default();

        let status = stream
            .decompress_vec(remaining, &mut out, FlushDecompress::None)
            .map_err(decompress_error)?;
        if status == Status::StreamEnd {
            break;
        }

        if out.len() == out.capacity() {
            grow(&mut out)?;
        } else if stream.total_in() == before_in && stream.total_out() == before_out {
            return Err(CodecError::Truncated);
        }
    }

    tracing::trace!(
        compressed = input.len(),
        decompressed = out.len(),
        capacity = out.capacity(),
        "inflated payload"
    );
    Ok(out)
}

/// Worst-case zlib output size for `len` input bytes.
#[must_use]
pub fn compress_bound(len: usize) -> usize {
    len.saturating_add(len >> 12)
        .saturating_add(len >> 14)
        .saturating_add(len >> 25)
        .saturating_add(13)
}

/// Deflates `input` into a zlib stream.
pub fn deflate(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut stream = Compress::new(Compression::default(), true);
    let mut out = Vec::with_capacity(compress_bound(input.len()));

    loop {
        let before_in = stream.total_in();
        let before_out = stream.total_out();
        let consumed = usize::try_from(before_in).unwrap_or(input.len());
        let remaining = input.get(consumed..).unwrap_or_default();

        let status = stream
            .compress_vec(remaining, &mut out, FlushCompress::Finish)
            .map_err(|e| CodecError::Compress(e.to_string()))?;
        if status == Status::StreamEnd {
            return Ok(out);
        }
        if out.len() == out.capacity() {
            tracing::debug!(capacity = out.capacity(), "deflate output exceeded estimate");
            grow(&mut out)?;
        } else if stream.total_in() == before_in && stream.total_out() == before_out {
            return Err(CodecError::Compress("deflate made no progress".to_owned()));
        }
    }
}

fn grow(out: &mut Vec<u8>) -> Result<(), CodecError> {
    let additional = out.capacity();
    out.try_reserve_exact(additional)
        .map_err(|_| CodecError::Memory(out.capacity().saturating_add(additional)))
}

fn decompress_error(err: DecompressError) -> CodecError {
    if err.needs_dictionary().is_some() {
        CodecError::Stream(err.to_string())
    } else {
        CodecError::Data(err.to_string())
    }
}
