//! Checksums used on the wire and for transferred files.
//!
//! - CRC16-XMODEM (poly 0x1021, init 0) protects every HCom frame.
//! - CRC32 (IEEE) identifies file contents; it is what the device reports in
//!   file listings and what a transfer result carries.

use {
    crc::{CRC_16_XMODEM, Crc},
    std::io::{self, Read},
};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Size of the read buffer used when checksumming a stream.
const STREAM_BUFFER_SIZE: usize = 8 * 1024;

/// Calculate CRC16-XMODEM over `data`.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Calculate CRC16-XMODEM over several slices as if they were one.
pub fn crc16_xmodem_parts(parts: &[&[u8]]) -> u16 {
    let mut digest = CRC16.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}

/// Calculate the IEEE CRC32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Stream `reader` to its end, returning its CRC32 and length.
///
/// Memory use is constant regardless of the stream length.
pub fn crc32_reader<R: Read>(mut reader: R) -> io::Result<(u32, u64)> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hasher.finalize(), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_crc16_empty() {
        assert_eq!(crc16_xmodem(&[]), 0);
    }

    #[test]
    fn test_crc16_parts_match_oneshot() {
        assert_eq!(crc16_xmodem_parts(&[b"12345", b"6789"]), 0x31C3);
        assert_eq!(crc16_xmodem_parts(&[]), 0);
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_crc32_reader_matches_oneshot() {
        let data: Vec<u8> = (0..20_000u32)
            .map(|i| (i % 251) as u8)
            .collect();
        let (crc, len) = crc32_reader(data.as_slice()).unwrap();
        assert_eq!(len, 20_000);
        assert_eq!(crc, crc32(&data));
    }

    #[test]
    fn test_crc32_reader_empty() {
        let (crc, len) = crc32_reader(io::empty()).unwrap();
        assert_eq!((crc, len), (0, 0));
    }
}
