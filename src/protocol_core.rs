//! Frame header logic shared by the server engine and the client agent
//!
//! Frame headers are 8 ASCII decimal digits giving the payload length.
//! The helpers here are transport-agnostic; async frame I/O lives in `codec`.

use anyhow::{bail, Result};

use crate::protocol::{HEADER_LEN, MAX_FRAME_SIZE};

/// Validate frame payload size against what the header can describe
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        bail!(
            "frame payload too large: {} bytes (max: {})",
            size,
            MAX_FRAME_SIZE
        );
    }
    Ok(())
}

/// Build frame header (8 bytes, zero-padded ASCII decimal)
pub fn build_frame_header(payload_len: usize) -> Result<[u8; HEADER_LEN]> {
    validate_frame_size(payload_len)?;
    let text = format!("{:0width$}", payload_len, width = HEADER_LEN);
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Parse frame header, returning the payload length
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<usize> {
    if !header.iter().all(u8::is_ascii_digit) {
        bail!(
            "invalid frame header {:?}: expected {} ASCII digits",
            String::from_utf8_lossy(header),
            HEADER_LEN
        );
    }
    // All digits, so this is valid UTF-8 and fits in usize
    let text = std::str::from_utf8(header)?;
    Ok(text.parse::<usize>()?)
}
