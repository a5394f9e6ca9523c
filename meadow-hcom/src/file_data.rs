//! Parsing of device file listing entries.
//!
//! The device reports each file as
//! `<path> [0x<8 hex crc>] <human size> (<N> bytes)`, for example
//! `/meadow0/App.pdb [0x0c74a77c] 12 KB (9908 bytes)`.

use std::fmt;

/// One entry of a file listing with CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileData {
    /// Full path on the device.
    pub full_path: String,
    /// Last path component.
    pub name: String,
    /// CRC32 reported by the device.
    pub crc: u32,
    /// Size in bytes.
    pub file_size: u64,
}

impl FileData {
    /// Parse a listing line; returns `None` for anything malformed.
    pub fn try_parse(line: &str) -> Option<Self> {
        let line = line.trim();

        let open_bracket = line.find('[')?;
        let full_path = line[..open_bracket].trim();
        if full_path.is_empty() {
            return None;
        }

        let rest = &line[open_bracket + 1..];
        let close_bracket = rest.find(']')?;
        let crc = parse_crc(rest[..close_bracket].trim())?;

        let rest = &rest[close_bracket + 1..];
        let open_paren = rest.find('(')?;
        let rest = &rest[open_paren + 1..];
        let close_paren = rest.find(')')?;

        let mut size_parts = rest[..close_paren].split_whitespace();
        let file_size = size_parts
            .next()?
            .parse::<u64>()
            .ok()?;
        if size_parts.next()? != "bytes" || size_parts.next().is_some() {
            return None;
        }

        let name = full_path
            .rsplit('/')
            .next()
            .unwrap_or(full_path)
            .to_string();

        Some(Self {
            full_path: full_path.to_string(),
            name,
            crc,
            file_size,
        })
    }
}

fn parse_crc(field: &str) -> Option<u32> {
    let hex = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))?;
    if hex.len() != 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

impl fmt::Display for FileData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [0x{:08x}] ({} bytes)",
            self.full_path, self.crc, self.file_size
        )
    }
}
