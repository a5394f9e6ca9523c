//! HCom frame layout and the pluggable frame codec.
//!
//! ## Frame Format (codec version 1)
//!
//! ```text
//! +-----+----------+---------+------+--------+-------+-----------+--------+-----+
//! | END | Sequence | Version | Type | Length | Extra |  Payload  | CRC16  | END |
//! +-----+----------+---------+------+--------+-------+-----------+--------+-----+
//! |  1  |    2     |    2    |  2   |   2    |   4   |  Length   |   2    |  1  |
//! +-----+----------+---------+------+--------+-------+-----------+--------+-----+
//! ```
//!
//! All header fields and the CRC are little-endian. Everything between the
//! two `END` delimiters is SLIP-escaped. The CRC16-XMODEM covers header and
//! payload before escaping.
//!
//! The exact scheme used by a given firmware build is versioned behind
//! [`FrameCodec`]; [`HcomCodecV1`] is the only strategy shipped here.

use {
    crate::{
        error::FrameError,
        protocol::{
            crc::{crc16_xmodem, crc16_xmodem_parts},
            slip,
        },
    },
    byteorder::{ByteOrder, LittleEndian},
    log::warn,
};

/// Width of the fixed frame header.
pub const HEADER_SIZE: usize = 12;

/// Offset of the first payload byte in a decoded response frame.
pub const RESPONSE_PAYLOAD_OFFSET: usize = HEADER_SIZE;

/// Width of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 2;

/// Largest payload carried by a single frame.
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Protocol version written into every request header.
pub const PROTOCOL_VERSION: u16 = 0x0007;

/// Upper bound on an escaped frame on the wire, delimiters included.
pub const MAX_ENCODED_FRAME_SIZE: usize = 2 * (HEADER_SIZE + MAX_PAYLOAD_SIZE + CHECKSUM_SIZE) + 2;

/// Fixed header carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Correlation marker. Zero marks an unsolicited device message.
    pub sequence: u16,
    /// Protocol version of the sender.
    pub version: u16,
    /// Request or response type code.
    pub type_code: u16,
    /// Number of payload bytes following the header.
    pub payload_length: u16,
    /// Per-type scalar argument (chunk index, trace level, ...).
    pub extra_data: u32,
}

impl FrameHeader {
    fn write_to(&self, buf: &mut [u8; HEADER_SIZE]) {
        LittleEndian::write_u16(&mut buf[0..2], self.sequence);
        LittleEndian::write_u16(&mut buf[2..4], self.version);
        LittleEndian::write_u16(&mut buf[4..6], self.type_code);
        LittleEndian::write_u16(&mut buf[6..8], self.payload_length);
        LittleEndian::write_u32(&mut buf[8..12], self.extra_data);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            sequence: LittleEndian::read_u16(&buf[0..2]),
            version: LittleEndian::read_u16(&buf[2..4]),
            type_code: LittleEndian::read_u16(&buf[4..6]),
            payload_length: LittleEndian::read_u16(&buf[6..8]),
            extra_data: LittleEndian::read_u32(&buf[8..12]),
        }
    }
}

/// One decoded unit of the serial protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header.
    pub header: FrameHeader,
    /// Unescaped payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame; the header length field is derived from `payload`.
    ///
    /// The length field saturates; [`FrameCodec::encode`] rejects payloads
    /// over [`MAX_PAYLOAD_SIZE`] before that matters.
    pub fn new(sequence: u16, type_code: u16, extra_data: u32, payload: Vec<u8>) -> Self {
        Self {
            header: FrameHeader {
                sequence,
                version: PROTOCOL_VERSION,
                type_code,
                payload_length: u16::try_from(payload.len()).unwrap_or(u16::MAX),
                extra_data,
            },
            payload,
        }
    }
}

/// A versioned wire encoding for [`Frame`]s.
///
/// Codecs are pure: no I/O, no blocking, no retries.
pub trait FrameCodec: Send + Sync {
    /// Version identifier of this encoding.
    fn version(&self) -> u16;

    /// Byte that separates frames on the wire.
    fn delimiter(&self) -> u8;

    /// Encode a frame into wire bytes, delimiters included.
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameError>;

    /// Decode one frame, with or without its surrounding delimiters.
    fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameError>;

    /// Best-effort sequence number of a frame that failed to decode.
    ///
    /// Nothing about the result is verified. The default never guesses.
    fn peek_sequence(&self, _bytes: &[u8]) -> Option<u16> {
        None
    }
}

/// SLIP-escaped frames with a CRC16-XMODEM trailer.
#[derive(Debug, Clone, Copy, Default)]
pub struct HcomCodecV1;

impl FrameCodec for HcomCodecV1 {
    fn version(&self) -> u16 {
        1
    }

    fn delimiter(&self) -> u8 {
        slip::END
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let len = frame
            .payload
            .len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut header = frame.header;
        #[allow(clippy::cast_possible_truncation)] // Bounded by MAX_PAYLOAD_SIZE
        {
            header.payload_length = len as u16;
        }

        let mut raw = Vec::with_capacity(HEADER_SIZE + len + CHECKSUM_SIZE);
        let mut header_bytes = [0u8; HEADER_SIZE];
        header.write_to(&mut header_bytes);
        raw.extend_from_slice(&header_bytes);
        raw.extend_from_slice(&frame.payload);
        let crc = crc16_xmodem_parts(&[&header_bytes, &frame.payload]);
        raw.extend_from_slice(&crc.to_le_bytes());

        Ok(slip::encode(&raw))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameError> {
        let raw = slip::decode(bytes)?;
        if raw.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(FrameError::Truncated { len: raw.len() });
        }

        let (body, trailer) = raw.split_at(raw.len() - CHECKSUM_SIZE);
        let expected = LittleEndian::read_u16(trailer);
        let actual = crc16_xmodem(body);
        if expected != actual {
            return Err(FrameError::ChecksumInvalid { expected, actual });
        }

        let header = FrameHeader::read_from(&body[..HEADER_SIZE]);
        let payload = &body[RESPONSE_PAYLOAD_OFFSET..];
        if usize::from(header.payload_length) != payload.len() {
            return Err(FrameError::LengthMismatch {
                declared: usize::from(header.payload_length),
                actual: payload.len(),
            });
        }

        Ok(Frame {
            header,
            payload: payload.to_vec(),
        })
    }

    fn peek_sequence(&self, bytes: &[u8]) -> Option<u16> {
        let raw = slip::decode(bytes).ok()?;
        (raw.len() >= HEADER_SIZE + CHECKSUM_SIZE).then(|| LittleEndian::read_u16(&raw[..2]))
    }
}

/// Splits a raw byte stream into delimited frame bodies.
///
/// Bytes are buffered until a delimiter arrives. A body that grows past
/// `max_frame_size` without a delimiter is line noise and is dropped.
#[derive(Debug)]
pub struct FrameAccumulator {
    delimiter: u8,
    max_frame_size: usize,
    buffer: Vec<u8>,
    overflowed: bool,
}

impl FrameAccumulator {
    /// Create an accumulator for the given delimiter byte.
    pub fn new(delimiter: u8, max_frame_size: usize) -> Self {
        Self {
            delimiter,
            max_frame_size,
            buffer: Vec::new(),
            overflowed: false,
        }
    }

    /// Create an accumulator matching `codec`.
    pub fn for_codec(codec: &dyn FrameCodec) -> Self {
        Self::new(codec.delimiter(), MAX_ENCODED_FRAME_SIZE)
    }

    /// Feed bytes read from the port; returns every body completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if byte == self.delimiter {
                if !self.buffer.is_empty() && !self.overflowed {
                    frames.push(std::mem::take(&mut self.buffer));
                }
                self.buffer.clear();
                self.overflowed = false;
                continue;
            }
            if self.overflowed {
                continue;
            }
            if self.buffer.len() >= self.max_frame_size {
                warn!(
                    "Discarding {} bytes without a frame delimiter",
                    self.buffer.len()
                );
                self.buffer.clear();
                self.overflowed = true;
                continue;
            }
            self.buffer.push(byte);
        }
        frames
    }

    /// Bytes buffered since the last delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame::new(3, 0x0802, 0, b"Meadow OK".to_vec())
    }

    #[test]
    fn test_header_layout() {
        let codec = HcomCodecV1;
        let frame = Frame::new(0x0102, 0x0111, 0x0a0b0c0d, Vec::new());
        let encoded = codec
            .encode(&frame)
            .unwrap();
        let raw = slip::decode(&encoded).unwrap();

        assert_eq!(
            &raw[..HEADER_SIZE],
            &[0x02, 0x01, 0x07, 0x00, 0x11, 0x01, 0x00, 0x00, 0x0d, 0x0c, 0x0b, 0x0a]
        );
        assert_eq!(raw.len(), HEADER_SIZE + CHECKSUM_SIZE);
    }

    #[test]
    fn test_peek_sequence_survives_checksum_damage() {
        let codec = HcomCodecV1;
        let encoded = codec
            .encode(&sample_frame())
            .unwrap();
        let mut raw = slip::decode(&encoded).unwrap();
        raw[HEADER_SIZE] ^= 0x01;
        let damaged = slip::encode(&raw);

        assert!(matches!(
            codec.decode(&damaged),
            Err(FrameError::ChecksumInvalid { .. })
        ));
        assert_eq!(codec.peek_sequence(&damaged), Some(3));
        assert_eq!(codec.peek_sequence(&slip::encode(&[0x03, 0x00])), None);
    }

    #[test]
    fn test_encode_decode_preserves_frame() {
        let codec = HcomCodecV1;
        let frame = sample_frame();
        let decoded = codec
            .decode(&codec.encode(&frame).unwrap())
            .unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_payload_with_reserved_bytes_is_escaped() {
        let codec = HcomCodecV1;
        let payload = vec![slip::END, 0x00, slip::ESC, slip::END, 0xFF];
        let frame = Frame::new(9, 0x0601, 1, payload.clone());
        let encoded = codec
            .encode(&frame)
            .unwrap();

        let interior = &encoded[1..encoded.len() - 1];
        assert!(!interior.contains(&slip::END));
        assert_eq!(
            codec
                .decode(&encoded)
                .unwrap()
                .payload,
            payload
        );
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = HcomCodecV1;
        let frame = Frame::new(1, 0x0601, 0, vec![0; MAX_PAYLOAD_SIZE + 1]);
        assert_eq!(
            codec.encode(&frame),
            Err(FrameError::PayloadTooLarge {
                len: MAX_PAYLOAD_SIZE + 1,
                max: MAX_PAYLOAD_SIZE
            })
        );
    }

    #[test]
    fn test_decode_short_frame_is_truncated() {
        let codec = HcomCodecV1;
        let short = slip::encode(&[0u8; RESPONSE_PAYLOAD_OFFSET - 1]);
        assert!(matches!(
            codec.decode(&short),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let codec = HcomCodecV1;
        let mut raw = slip::decode(
            &codec
                .encode(&sample_frame())
                .unwrap(),
        )
        .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(matches!(
            codec.decode(&slip::encode(&raw)),
            Err(FrameError::ChecksumInvalid { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let codec = HcomCodecV1;
        let mut header = [0u8; HEADER_SIZE];
        FrameHeader {
            sequence: 1,
            version: PROTOCOL_VERSION,
            type_code: 0x0802,
            payload_length: 10,
            extra_data: 0,
        }
        .write_to(&mut header);
        let mut raw = header.to_vec();
        raw.extend_from_slice(b"abc");
        let crc = crc16_xmodem(&raw);
        raw.extend_from_slice(&crc.to_le_bytes());

        assert_eq!(
            codec.decode(&slip::encode(&raw)),
            Err(FrameError::LengthMismatch {
                declared: 10,
                actual: 3
            })
        );
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let codec = HcomCodecV1;
        let payloads: [&[u8]; 3] = [
            b"",
            b"/meadow0/App.dll",
            &[slip::END, slip::ESC, 0x00, 0xFF, 0x7E, slip::ESC_END],
        ];

        for payload in payloads {
            let frame = Frame::new(0x1234, 0x0805, 77, payload.to_vec());
            let encoded = codec
                .encode(&frame)
                .unwrap();

            for index in 1..encoded.len() - 1 {
                for bit in 0..8 {
                    let mut corrupted = encoded.clone();
                    corrupted[index] ^= 1 << bit;
                    assert!(
                        codec
                            .decode(&corrupted)
                            .is_err(),
                        "flip of bit {bit} in byte {index} went undetected for {payload:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_accumulator_splits_stream() {
        let codec = HcomCodecV1;
        let a = codec
            .encode(&Frame::new(1, 0x0802, 0, b"one".to_vec()))
            .unwrap();
        let b = codec
            .encode(&Frame::new(2, 0x0802, 0, b"two".to_vec()))
            .unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut acc = FrameAccumulator::for_codec(&codec);
        let (first, second) = stream.split_at(5);
        let mut bodies = acc.push(first);
        assert!(bodies.is_empty());
        bodies.extend(acc.push(second));

        assert_eq!(bodies.len(), 2);
        assert_eq!(
            codec
                .decode(&bodies[0])
                .unwrap()
                .payload,
            b"one"
        );
        assert_eq!(
            codec
                .decode(&bodies[1])
                .unwrap()
                .payload,
            b"two"
        );
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_accumulator_drops_oversized_noise() {
        let mut acc = FrameAccumulator::new(slip::END, 4);
        assert!(
            acc.push(&[1, 2, 3, 4, 5, 6, slip::END])
                .is_empty()
        );
        assert_eq!(acc.push(&[7, slip::END]), vec![vec![7]]);
    }
}
