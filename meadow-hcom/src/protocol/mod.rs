//! HCom protocol implementation.

pub mod crc;
pub mod frame;
pub mod request;
pub mod response;
pub mod slip;

// Re-export common types
pub use {
    frame::{
        Frame, FrameAccumulator, FrameCodec, FrameHeader, HcomCodecV1, MAX_PAYLOAD_SIZE,
        RESPONSE_PAYLOAD_OFFSET,
    },
    request::{FileStart, Request, RequestType},
    response::{DataPacket, ResponseType, SerialResponse, TextMessage, UNSOLICITED_SEQUENCE},
};
