//! Blight display protocol
//!
//! Shared types for the session daemon and its clients. The daemon is found
//! over D-Bus (the control plane, see [`bus`]); everything high-frequency
//! travels as framed binary messages over a stream socket obtained from it
//! (the data plane, see [`wire`] and [`socket`]).

pub mod bus;
pub mod buffer;
pub mod client;
pub mod format;
pub mod geometry;
pub mod socket;
pub mod wire;

pub use buffer::{Buffer, BufferError, create_buffer};
pub use geometry::Rect;
pub use format::{PixelFormat, WaveformMode};
pub use wire::{
    DecodeError, EventPacket, Header, InfoRequest, Message, MessageType, MoveCommand,
    RawInputEvent, RepaintCommand, SurfaceInfo,
};

/// Well-known bus name of the session daemon
pub const SERVICE: &str = "org.blight.Display1";

/// Interface exposed by the session daemon
pub const INTERFACE: &str = "org.blight.Display1.Compositor";

/// Object path the interface is served at
pub const OBJECT_PATH: &str = "/";
