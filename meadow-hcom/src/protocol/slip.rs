//! SLIP byte stuffing (RFC 1055) for HCom frames.
//!
//! `END` delimits frames. Inside a frame `END` is sent as `ESC ESC_END` and
//! `ESC` as `ESC ESC_ESC`, so a raw `END` never appears in a frame body.

use crate::error::FrameError;

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape introducer.
pub const ESC: u8 = 0xDB;
/// Escaped `END`.
pub const ESC_END: u8 = 0xDC;
/// Escaped `ESC`.
pub const ESC_ESC: u8 = 0xDD;

/// Escape `data` and wrap it in delimiters.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() + data.len() / 8 + 2);
    encoded.push(END);
    for &byte in data {
        match byte {
            END => encoded.extend_from_slice(&[ESC, ESC_END]),
            ESC => encoded.extend_from_slice(&[ESC, ESC_ESC]),
            _ => encoded.push(byte),
        }
    }
    encoded.push(END);
    encoded
}

/// Reverse [`encode`] for a single frame.
///
/// Leading and trailing delimiters are ignored. A delimiter in the middle of
/// the body means the frame was cut short and another one began.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let start = data
        .iter()
        .position(|&b| b != END)
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|&b| b != END)
        .map_or(start, |i| i + 1);
    let body = &data[start..end];

    let mut decoded = Vec::with_capacity(body.len());
    let mut iter = body
        .iter()
        .enumerate();
    while let Some((offset, &byte)) = iter.next() {
        match byte {
            END => return Err(FrameError::Truncated { len: decoded.len() }),
            ESC => match iter.next() {
                Some((_, &ESC_END)) => decoded.push(END),
                Some((_, &ESC_ESC)) => decoded.push(ESC),
                _ => return Err(FrameError::InvalidEscape { offset }),
            },
            _ => decoded.push(byte),
        }
    }
    Ok(decoded)
}
