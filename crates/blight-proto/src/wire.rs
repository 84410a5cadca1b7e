//! Data-plane wire format.
//!
//! Every message is a fixed 12-byte [`Header`] immediately followed by
//! `header.size` bytes of payload. Payload structs are `#[repr(C)]` and use
//! native byte order; they are only reinterpreted after their length has been
//! checked.
//!
//! # Message flow
//!
//! - `Ping` / `Ack`: keepalive. A `Ping` is always answered by an `Ack`
//!   carrying the same `ack_id`.
//! - `Repaint`: copy a region of a surface to the screen. Acked once the
//!   refresh has completed.
//! - `Move`: change a surface's on-screen offset. Acked immediately.
//! - `Info`: ask for a surface's geometry. The `Ack` carries a [`SurfaceInfo`].
//! - `Event`: input event, server to client, only on the input socket.

use bytemuck::{Pod, Zeroable};
use std::mem;
use thiserror::Error;

use crate::format::{PixelFormat, WaveformMode};

/// Message kinds understood on the data plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    /// Decode-failure sentinel, never sent
    Invalid = 0,
    Ack = 1,
    Ping = 2,
    Repaint = 3,
    Move = 4,
    Info = 5,
    Event = 6,
}

impl MessageType {
    /// Unknown values map to [`MessageType::Invalid`]
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Ack,
            2 => Self::Ping,
            3 => Self::Repaint,
            4 => Self::Move,
            5 => Self::Info,
            6 => Self::Event,
            _ => Self::Invalid,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// Errors produced when a message cannot be turned into a typed payload.
///
/// All of these are recoverable: drop the message and keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid message")]
    Invalid,
    #[error("message has no payload")]
    NoData,
    #[error("payload too small: expected {expected} bytes, got {actual}")]
    TooSmall { expected: usize, actual: usize },
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct RawHeader {
    kind: i32,
    ack_id: u32,
    size: u32,
}

/// Size of an encoded header in bytes
pub const HEADER_SIZE: usize = mem::size_of::<RawHeader>();

/// Fixed-size message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    /// Correlates a request with its `Ack`; unique per outstanding request on
    /// one socket only
    pub ack_id: u32,
    /// Exact payload length in bytes
    pub size: u32,
}

impl Header {
    pub fn new(kind: MessageType, ack_id: u32, size: u32) -> Self {
        Self { kind, ack_id, size }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        bytemuck::cast(RawHeader {
            kind: self.kind.as_raw(),
            ack_id: self.ack_id,
            size: self.size,
        })
    }

    /// Parse the leading [`HEADER_SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::TooSmall {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let raw: RawHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        Ok(Self {
            kind: MessageType::from_raw(raw.kind),
            ack_id: raw.ack_id,
            size: raw.size,
        })
    }
}

/// A header plus its payload. A zero-length payload is carried as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Option<Vec<u8>>,
}

impl Message {
    pub fn new(kind: MessageType, ack_id: u32, payload: Option<Vec<u8>>) -> Self {
        let size = payload.as_ref().map_or(0, |p| p.len() as u32);
        Self {
            header: Header::new(kind, ack_id, size),
            payload,
        }
    }

    pub fn ping(ack_id: u32) -> Self {
        Self::new(MessageType::Ping, ack_id, None)
    }

    pub fn ack(ack_id: u32, payload: Option<Vec<u8>>) -> Self {
        Self::new(MessageType::Ack, ack_id, payload)
    }

    /// Build a message whose kind and payload come from a typed packet
    pub fn from_payload<P: Payload>(ack_id: u32, payload: &P) -> Self {
        Self::new(P::KIND, ack_id, Some(payload.to_bytes()))
    }

    /// The `Ack` answering this message
    pub fn reply(&self, payload: Option<Vec<u8>>) -> Self {
        Self::ack(self.header.ack_id, payload)
    }

    /// The `Ack` refusing this message, carrying an errno value
    pub fn reject(&self, errno: i32) -> Self {
        self.reply(Some(errno.to_ne_bytes().to_vec()))
    }

    /// Errno carried by a refusing `Ack`, if this is one
    pub fn rejection(&self) -> Option<i32> {
        if self.kind() != MessageType::Ack {
            return None;
        }
        let bytes: [u8; REJECTION_SIZE] = self.payload.as_deref()?.try_into().ok()?;
        Some(i32::from_ne_bytes(bytes))
    }

    pub fn kind(&self) -> MessageType {
        self.header.kind
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(&self.header, self.payload.as_deref())
    }

    pub fn as_repaint(&self) -> Result<RepaintCommand, DecodeError> {
        as_repaint(Some(self))
    }

    pub fn as_move(&self) -> Result<MoveCommand, DecodeError> {
        as_move(Some(self))
    }

    pub fn as_surface_info(&self) -> Result<SurfaceInfo, DecodeError> {
        as_surface_info(Some(self))
    }
}

const REJECTION_SIZE: usize = mem::size_of::<i32>();

/// Serialize a header and payload back to back. The size field is taken from
/// the payload so the two can never disagree.
pub fn encode(header: &Header, payload: Option<&[u8]>) -> Vec<u8> {
    let payload = payload.unwrap_or_default();
    let header = Header {
        size: payload.len() as u32,
        ..*header
    };
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parse one complete message from `bytes`. Trailing bytes are ignored.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let header = Header::from_bytes(bytes)?;
    if header.kind == MessageType::Invalid {
        return Err(DecodeError::Invalid);
    }
    let size = header.size as usize;
    let body = &bytes[HEADER_SIZE..];
    if body.len() < size {
        return Err(DecodeError::TooSmall {
            expected: size,
            actual: body.len(),
        });
    }
    let payload = (size > 0).then(|| body[..size].to_vec());
    Ok(Message { header, payload })
}

/// A typed payload with a fixed binary layout.
pub trait Payload: Sized {
    /// Message kind this payload travels in
    const KIND: MessageType;
    /// Wire representation
    type Raw: Pod;

    fn to_raw(&self) -> Self::Raw;
    fn from_raw(raw: Self::Raw) -> Result<Self, DecodeError>;

    fn to_bytes(&self) -> Vec<u8> {
        bytemuck::bytes_of(&self.to_raw()).to_vec()
    }
}

/// Turn a message into a typed payload.
///
/// Checks run in a fixed order: missing message or wrong kind is `Invalid`,
/// missing payload is `NoData`, short payload is `TooSmall`.
pub fn cast<P: Payload>(message: Option<&Message>) -> Result<P, DecodeError> {
    let Some(message) = message else {
        return Err(DecodeError::Invalid);
    };
    if message.header.kind != P::KIND {
        return Err(DecodeError::Invalid);
    }
    let Some(data) = message.payload.as_deref() else {
        return Err(DecodeError::NoData);
    };
    let expected = mem::size_of::<P::Raw>();
    if data.len() < expected {
        return Err(DecodeError::TooSmall {
            expected,
            actual: data.len(),
        });
    }
    P::from_raw(bytemuck::pod_read_unaligned(&data[..expected]))
}

pub fn as_repaint(message: Option<&Message>) -> Result<RepaintCommand, DecodeError> {
    cast(message)
}

pub fn as_move(message: Option<&Message>) -> Result<MoveCommand, DecodeError> {
    cast(message)
}

pub fn as_surface_info(message: Option<&Message>) -> Result<SurfaceInfo, DecodeError> {
    cast(message)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RawRepaint {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub waveform: i32,
    pub marker: u32,
    pub surface_id: u32,
}

/// Copy a surface-local region to the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepaintCommand {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub waveform: WaveformMode,
    /// Caller-chosen tag reported back once the refresh completes
    pub marker: u32,
    pub surface_id: u32,
}

impl Payload for RepaintCommand {
    const KIND: MessageType = MessageType::Repaint;
    type Raw = RawRepaint;

    fn to_raw(&self) -> RawRepaint {
        RawRepaint {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            waveform: self.waveform.as_raw(),
            marker: self.marker,
            surface_id: self.surface_id,
        }
    }

    fn from_raw(raw: RawRepaint) -> Result<Self, DecodeError> {
        let waveform = WaveformMode::from_raw(raw.waveform).ok_or(DecodeError::Invalid)?;
        if raw.width < 0 || raw.height < 0 {
            return Err(DecodeError::Invalid);
        }
        Ok(Self {
            x: raw.x,
            y: raw.y,
            width: raw.width,
            height: raw.height,
            waveform,
            marker: raw.marker,
            surface_id: raw.surface_id,
        })
    }
}

/// Change a surface's on-screen offset
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MoveCommand {
    pub surface_id: u32,
    pub x: i32,
    pub y: i32,
}

impl Payload for MoveCommand {
    const KIND: MessageType = MessageType::Move;
    type Raw = MoveCommand;

    fn to_raw(&self) -> MoveCommand {
        *self
    }

    fn from_raw(raw: MoveCommand) -> Result<Self, DecodeError> {
        Ok(raw)
    }
}

/// Request for a surface's geometry
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct InfoRequest {
    pub surface_id: u32,
}

impl Payload for InfoRequest {
    const KIND: MessageType = MessageType::Info;
    type Raw = InfoRequest;

    fn to_raw(&self) -> InfoRequest {
        *self
    }

    fn from_raw(raw: InfoRequest) -> Result<Self, DecodeError> {
        Ok(raw)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RawSurfaceInfo {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: i32,
}

/// Geometry of the buffer backing a surface, sent in the `Ack` of an `Info`
/// request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: PixelFormat,
}

impl Payload for SurfaceInfo {
    const KIND: MessageType = MessageType::Ack;
    type Raw = RawSurfaceInfo;

    fn to_raw(&self) -> RawSurfaceInfo {
        RawSurfaceInfo {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format.as_raw(),
        }
    }

    fn from_raw(raw: RawSurfaceInfo) -> Result<Self, DecodeError> {
        Ok(Self {
            x: raw.x,
            y: raw.y,
            width: raw.width,
            height: raw.height,
            stride: raw.stride,
            format: PixelFormat::from_raw(raw.format).ok_or(DecodeError::Invalid)?,
        })
    }
}

/// `type`, `code`, `value` of a kernel `input_event`, without the timestamp
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RawInputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

/// Input event tagged with the device it came from
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct EventPacket {
    pub device_id: u32,
    pub event: RawInputEvent,
}

impl Payload for EventPacket {
    const KIND: MessageType = MessageType::Event;
    type Raw = EventPacket;

    fn to_raw(&self) -> EventPacket {
        *self
    }

    fn from_raw(raw: EventPacket) -> Result<Self, DecodeError> {
        Ok(raw)
    }
}
