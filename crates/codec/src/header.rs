//! Frame headers.
//!
//! Every RPC frame starts with a 16-byte [`MessageHeader`]. Function calls
//! and their answers follow it with a 12-byte [`CallHeader`]; stream frames
//! follow it with a 12-byte [`StreamHeader`]. The outer transport framing
//! (length prefix on TCP and the rings, message boundary on WebSocket and
//! UDP) is the transport's business and never appears here.

use crate::{Error, FlatBuffer, flat};

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const MESSAGE_HEADER_SIZE: usize = 16;
pub const CALL_HEADER_SIZE: usize = 12;
pub const STREAM_HEADER_SIZE: usize = 12;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum MessageId {
    FunctionCall = 0,
    /// Success with an output payload following the header.
    BlockResponse = 1,
    /// Success without outputs.
    Success = 2,
    ErrorObjectNotExist = 3,
    ErrorUnknownFunction = 4,
    ErrorBadFrame = 5,
    ErrorProtocol = 6,
    /// A user-defined exception payload follows.
    ErrorUserException = 7,
    ErrorMessageTooLarge = 8,
    ErrorBufferFull = 9,
    /// Fire-and-forget notice that the sender dropped its last reference
    /// to the object named by the CallHeader.
    ReleaseObject = 10,
    StreamInitialization = 16,
    StreamDataChunk = 17,
    StreamCompletion = 18,
    StreamError = 19,
    StreamWindowUpdate = 20,
    StreamCancel = 21,
}

impl MessageId {
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            Self::StreamInitialization
                | Self::StreamDataChunk
                | Self::StreamCompletion
                | Self::StreamError
                | Self::StreamWindowUpdate
                | Self::StreamCancel
        )
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ErrorObjectNotExist
                | Self::ErrorUnknownFunction
                | Self::ErrorBadFrame
                | Self::ErrorProtocol
                | Self::ErrorUserException
                | Self::ErrorMessageTooLarge
                | Self::ErrorBufferFull
        )
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum MessageType {
    Request = 0,
    Answer = 1,
}

/// First 16 bytes of every frame.
///
/// `size` is the length of everything after the size field itself, so a
/// complete frame occupies `size + 4` bytes.
///
/// ```text
/// 0  size        u32
/// 4  msg_id      u8
/// 5  msg_type    u8
/// 6  (reserved)  u16
/// 8  request_id  u32
/// 12 (reserved)  u32
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub size: u32,
    pub msg_id: MessageId,
    pub msg_type: MessageType,
    pub request_id: u32,
}

impl MessageHeader {
    pub fn new(msg_id: MessageId, msg_type: MessageType, request_id: u32) -> Self {
        Self {
            size: 0,
            msg_id,
            msg_type,
            request_id,
        }
    }

    /// Append the header at the write cursor, returning the frame base.
    /// `size` is stamped as zero; [`MessageHeader::patch_size`] fills it in
    /// once the payload is complete.
    pub fn encode(&self, buf: &mut FlatBuffer) -> Result<usize, Error> {
        let base = flat::reserve_struct(buf, MESSAGE_HEADER_SIZE)?;
        flat::put(buf, base, self.size)?;
        flat::put(buf, base + 4, u8::from(self.msg_id))?;
        flat::put(buf, base + 5, u8::from(self.msg_type))?;
        flat::put(buf, base + 8, self.request_id)?;

        Ok(base)
    }

    pub fn decode(buf: &FlatBuffer, offset: usize) -> Result<Self, Error> {
        buf.get(offset, MESSAGE_HEADER_SIZE)?;

        Ok(Self {
            size: flat::get(buf, offset)?,
            msg_id: MessageId::try_from(flat::get::<u8>(buf, offset + 4)?)
                .map_err(|_| Error::UnknownEnumValue)?,
            msg_type: MessageType::try_from(flat::get::<u8>(buf, offset + 5)?)
                .map_err(|_| Error::UnknownEnumValue)?,
            request_id: flat::get(buf, offset + 8)?,
        })
    }

    /// Stamp the size field of the frame starting at `base` from the
    /// current write cursor.
    pub fn patch_size(buf: &mut FlatBuffer, base: usize) -> Result<(), Error> {
        let size = (buf.write_pos() - base - 4) as u32;
        flat::put(buf, base, size)
    }
}

/// Call routing block, directly after the header on `FunctionCall`,
/// `ReleaseObject` and their answers.
///
/// ```text
/// 0  object_id      u64
/// 8  poa_idx        u16
/// 10 interface_idx  u8
/// 11 function_idx   u8
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub object_id: u64,
    pub poa_idx: u16,
    pub interface_idx: u8,
    pub function_idx: u8,
}

impl CallHeader {
    pub fn encode(&self, buf: &mut FlatBuffer) -> Result<usize, Error> {
        let base = flat::reserve_struct(buf, CALL_HEADER_SIZE)?;
        flat::put(buf, base, self.object_id)?;
        flat::put(buf, base + 8, self.poa_idx)?;
        flat::put(buf, base + 10, self.interface_idx)?;
        flat::put(buf, base + 11, self.function_idx)?;

        Ok(base)
    }

    pub fn decode(buf: &FlatBuffer, offset: usize) -> Result<Self, Error> {
        buf.get(offset, CALL_HEADER_SIZE)?;

        Ok(Self {
            object_id: flat::get(buf, offset)?,
            poa_idx: flat::get(buf, offset + 8)?,
            interface_idx: flat::get(buf, offset + 10)?,
            function_idx: flat::get(buf, offset + 11)?,
        })
    }
}

/// Stream routing block, directly after the header on stream frames.
///
/// `arg` is overloaded per message id: the credit count on
/// `StreamWindowUpdate`, the error code on `StreamError`, the final
/// sequence on `StreamCompletion`, and zero elsewhere.
///
/// ```text
/// 0  stream_id  u32
/// 4  sequence   u32
/// 8  arg        u32
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub stream_id: u32,
    pub sequence: u32,
    pub arg: u32,
}

impl StreamHeader {
    pub fn encode(&self, buf: &mut FlatBuffer) -> Result<usize, Error> {
        let base = flat::reserve_struct(buf, STREAM_HEADER_SIZE)?;
        flat::put(buf, base, self.stream_id)?;
        flat::put(buf, base + 4, self.sequence)?;
        flat::put(buf, base + 8, self.arg)?;

        Ok(base)
    }

    pub fn decode(buf: &FlatBuffer, offset: usize) -> Result<Self, Error> {
        buf.get(offset, STREAM_HEADER_SIZE)?;

        Ok(Self {
            stream_id: flat::get(buf, offset)?,
            sequence: flat::get(buf, offset + 4)?,
            arg: flat::get(buf, offset + 8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut buf = FlatBuffer::new();
        let base = MessageHeader::new(MessageId::FunctionCall, MessageType::Request, 77)
            .encode(&mut buf)
            .unwrap();

        CallHeader {
            object_id: 0xDEAD_BEEF,
            poa_idx: 2,
            interface_idx: 1,
            function_idx: 4,
        }
        .encode(&mut buf)
        .unwrap();

        MessageHeader::patch_size(&mut buf, base).unwrap();

        let header = MessageHeader::decode(&buf, 0).unwrap();
        assert_eq!(header.msg_id, MessageId::FunctionCall);
        assert_eq!(header.msg_type, MessageType::Request);
        assert_eq!(header.request_id, 77);
        assert_eq!(
            header.size as usize,
            MESSAGE_HEADER_SIZE + CALL_HEADER_SIZE - 4
        );

        let call = CallHeader::decode(&buf, MESSAGE_HEADER_SIZE).unwrap();
        assert_eq!(call.object_id, 0xDEAD_BEEF);
        assert_eq!(call.poa_idx, 2);
        assert_eq!(call.function_idx, 4);
    }

    #[test]
    fn unknown_message_id_rejected() {
        let mut buf = FlatBuffer::new();
        MessageHeader::new(MessageId::Success, MessageType::Answer, 0)
            .encode(&mut buf)
            .unwrap();

        flat::put(&mut buf, 4, 0xEEu8).unwrap();
        assert!(matches!(
            MessageHeader::decode(&buf, 0),
            Err(Error::UnknownEnumValue)
        ));
    }

    #[test]
    fn stream_header_roundtrip() {
        let mut buf = FlatBuffer::new();
        StreamHeader {
            stream_id: 9,
            sequence: 1000,
            arg: 16,
        }
        .encode(&mut buf)
        .unwrap();

        let header = StreamHeader::decode(&buf, 0).unwrap();
        assert_eq!(header.stream_id, 9);
        assert_eq!(header.sequence, 1000);
        assert_eq!(header.arg, 16);
    }
}
