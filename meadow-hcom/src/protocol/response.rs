//! Responses decoded from device frames.
//!
//! The header type code selects a [`SerialResponse`] variant before any
//! payload is interpreted. Unknown codes are a [`FrameError::UnknownType`].

use crate::{
    error::FrameError,
    protocol::frame::{Frame, FrameCodec, FrameHeader},
};

/// Sequence number the device uses for unsolicited output.
pub const UNSOLICITED_SEQUENCE: u16 = 0;

/// Wire codes for device responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResponseType {
    /// Raw file bytes.
    UploadDataPacket = 0x0701,
    /// Debugger protocol bytes.
    DebuggerData = 0x0702,
    /// The request was refused.
    TextRejected = 0x0801,
    /// The request was accepted.
    TextAccepted = 0x0802,
    /// End of a multi-frame answer.
    TextConcluded = 0x0803,
    /// The device reported an error.
    TextError = 0x0804,
    /// Informational text.
    TextInformation = 0x0805,
    /// Heading of a listing.
    TextListHeader = 0x0806,
    /// One entry of a listing.
    TextListMember = 0x0807,
    /// One entry of a listing with CRC.
    TextCrcMember = 0x0808,
    /// Managed application stdout.
    MonoStdout = 0x0809,
    /// Device information text.
    DeviceInfo = 0x080A,
    /// Firmware trace output.
    TraceMessage = 0x080B,
    /// The device is about to reset and reconnect.
    Reconnect = 0x080C,
    /// Managed application stderr.
    MonoStderr = 0x080D,
    /// A file transfer was accepted.
    FileStartOkay = 0x080E,
    /// A file transfer was refused.
    FileStartFail = 0x080F,
}

impl ResponseType {
    const ALL: [Self; 17] = [
        Self::UploadDataPacket,
        Self::DebuggerData,
        Self::TextRejected,
        Self::TextAccepted,
        Self::TextConcluded,
        Self::TextError,
        Self::TextInformation,
        Self::TextListHeader,
        Self::TextListMember,
        Self::TextCrcMember,
        Self::MonoStdout,
        Self::DeviceInfo,
        Self::TraceMessage,
        Self::Reconnect,
        Self::MonoStderr,
        Self::FileStartOkay,
        Self::FileStartFail,
    ];

    /// Numeric wire code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Look up a response type by wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
    }
}

/// A text-bearing response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    header: FrameHeader,
    response_type: ResponseType,
    payload: Vec<u8>,
}

impl TextMessage {
    /// Response type code.
    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    /// Payload decoded as text. Invalid UTF-8 is replaced, trailing NULs and
    /// line endings are dropped.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload)
            .trim_end_matches(['\0', '\r', '\n'])
            .to_string()
    }
}

/// A binary response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    header: FrameHeader,
    response_type: ResponseType,
    payload: Vec<u8>,
}

impl DataPacket {
    /// Response type code.
    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialResponse {
    /// The device accepted the request.
    TextAccepted(TextMessage),
    /// The device refused the request or reported an error.
    TextRejected(TextMessage),
    /// Any other text output: listings, trace, stdout, conclusions.
    TextRequest(TextMessage),
    /// Raw bytes from the device.
    UploadDataPacket(DataPacket),
    /// Device information text.
    DeviceInfo(TextMessage),
}

impl SerialResponse {
    /// Type a decoded frame by its header code.
    pub fn from_frame(frame: Frame) -> Result<Self, FrameError> {
        let code = frame
            .header
            .type_code;
        let response_type = ResponseType::from_code(code).ok_or(FrameError::UnknownType(code))?;
        let Frame { header, payload } = frame;

        Ok(match response_type {
            ResponseType::UploadDataPacket | ResponseType::DebuggerData => {
                Self::UploadDataPacket(DataPacket {
                    header,
                    response_type,
                    payload,
                })
            },
            other => {
                let message = TextMessage {
                    header,
                    response_type: other,
                    payload,
                };
                match other {
                    ResponseType::TextAccepted | ResponseType::FileStartOkay => {
                        Self::TextAccepted(message)
                    },
                    ResponseType::TextRejected
                    | ResponseType::FileStartFail
                    | ResponseType::TextError => Self::TextRejected(message),
                    ResponseType::DeviceInfo => Self::DeviceInfo(message),
                    _ => Self::TextRequest(message),
                }
            },
        })
    }

    /// Decode wire bytes with `codec` and type the result.
    pub fn decode(codec: &dyn FrameCodec, bytes: &[u8]) -> Result<Self, FrameError> {
        codec
            .decode(bytes)
            .and_then(Self::from_frame)
    }

    /// Frame header.
    pub fn header(&self) -> &FrameHeader {
        match self {
            Self::TextAccepted(m) | Self::TextRejected(m) | Self::TextRequest(m) | Self::DeviceInfo(m) => {
                &m.header
            },
            Self::UploadDataPacket(p) => &p.header,
        }
    }

    /// Correlation marker.
    pub fn sequence(&self) -> u16 {
        self.header()
            .sequence
    }

    /// Whether the device sent this on its own rather than in reply.
    pub fn is_unsolicited(&self) -> bool {
        self.sequence() == UNSOLICITED_SEQUENCE
    }

    /// Response type code.
    pub fn response_type(&self) -> ResponseType {
        match self {
            Self::TextAccepted(m) | Self::TextRejected(m) | Self::TextRequest(m) | Self::DeviceInfo(m) => {
                m.response_type
            },
            Self::UploadDataPacket(p) => p.response_type,
        }
    }

    /// Payload bytes after the header.
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::TextAccepted(m) | Self::TextRejected(m) | Self::TextRequest(m) | Self::DeviceInfo(m) => {
                &m.payload
            },
            Self::UploadDataPacket(p) => &p.payload,
        }
    }

    /// Decoded text for text-bearing variants.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::TextAccepted(m) | Self::TextRejected(m) | Self::TextRequest(m) | Self::DeviceInfo(m) => {
                Some(m.text())
            },
            Self::UploadDataPacket(_) => None,
        }
    }

    /// Whether the device rejected the request.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::TextRejected(_))
    }

    /// Consume the response, keeping only its payload.
    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Self::TextAccepted(m) | Self::TextRejected(m) | Self::TextRequest(m) | Self::DeviceInfo(m) => {
                m.payload
            },
            Self::UploadDataPacket(p) => p.payload,
        }
    }
}
