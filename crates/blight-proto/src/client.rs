//! Blocking data-plane client.
//!
//! Used by applications on their own thread. Every wait answers keepalive
//! pings from the daemon while it blocks, so a client stuck waiting for a
//! slow refresh is never considered dead.

use nix::errno::Errno;
use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::socket::{MessageReader, send_message};
use crate::wire::{
    EventPacket, InfoRequest, Message, MessageType, MoveCommand, Payload, RepaintCommand,
    SurfaceInfo, cast,
};
use crate::{DecodeError, WaveformMode};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Socket(#[from] Errno),
    #[error("malformed reply: {0}")]
    Decode(#[from] DecodeError),
    #[error("timed out waiting for ack {0}")]
    Timeout(u32),
    #[error("no input socket open")]
    NoInput,
    #[error("request {ack_id} refused: {errno}")]
    Rejected { ack_id: u32, errno: Errno },
}

/// Client end of a data-plane connection
pub struct Connection {
    data: OwnedFd,
    reader: MessageReader,
    input: Option<(OwnedFd, MessageReader)>,
    next_ack_id: u32,
    /// Acks that arrived while waiting for a different one
    unclaimed: HashMap<u32, Message>,
}

impl Connection {
    pub fn new(data: OwnedFd) -> Self {
        Self {
            data,
            reader: MessageReader::new(),
            input: None,
            next_ack_id: 0,
            unclaimed: HashMap::new(),
        }
    }

    /// Attach the read-only input socket
    pub fn with_input(mut self, input: OwnedFd) -> Self {
        self.input = Some((input, MessageReader::new()));
        self
    }

    fn next_id(&mut self) -> u32 {
        self.next_ack_id = self.next_ack_id.wrapping_add(1).max(1);
        self.next_ack_id
    }

    /// Send a request and return the ack id to wait for
    pub fn send(&mut self, kind: MessageType, payload: Option<Vec<u8>>) -> Result<u32, ClientError> {
        let ack_id = self.next_id();
        send_message(self.data.as_fd(), &Message::new(kind, ack_id, payload))?;
        Ok(ack_id)
    }

    fn send_payload<P: Payload>(&mut self, payload: &P) -> Result<u32, ClientError> {
        self.send(P::KIND, Some(payload.to_bytes()))
    }

    /// Block until the `Ack` for `ack_id` arrives
    pub fn wait_for_ack(
        &mut self,
        ack_id: u32,
        timeout: Option<Duration>,
    ) -> Result<Message, ClientError> {
        if let Some(ack) = self.unclaimed.remove(&ack_id) {
            return Self::accepted(ack);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                Some(deadline) => Some(
                    deadline
                        .checked_duration_since(Instant::now())
                        .ok_or(ClientError::Timeout(ack_id))?,
                ),
                None => None,
            };
            let message = match self.reader.read_blocking(self.data.as_fd(), remaining) {
                Ok(message) => message,
                Err(Errno::ETIMEDOUT) => return Err(ClientError::Timeout(ack_id)),
                Err(err) => return Err(err.into()),
            };
            match message.kind() {
                MessageType::Ack if message.header.ack_id == ack_id => {
                    return Self::accepted(message);
                }
                MessageType::Ack => {
                    self.unclaimed.insert(message.header.ack_id, message);
                }
                MessageType::Ping => self.answer(&message)?,
                kind => tracing::warn!("Unexpected {:?} message from server", kind),
            }
        }
    }

    fn accepted(ack: Message) -> Result<Message, ClientError> {
        match ack.rejection() {
            Some(errno) => Err(ClientError::Rejected {
                ack_id: ack.header.ack_id,
                errno: Errno::from_raw(errno),
            }),
            None => Ok(ack),
        }
    }

    fn answer(&mut self, ping: &Message) -> Result<(), ClientError> {
        send_message(self.data.as_fd(), &ping.reply(None))?;
        Ok(())
    }

    /// Answer any pings already waiting on the socket without blocking
    pub fn process_pending(&mut self) -> Result<(), ClientError> {
        loop {
            match self.reader.read(self.data.as_fd()) {
                Ok(message) if message.kind() == MessageType::Ping => self.answer(&message)?,
                Ok(message) if message.kind() == MessageType::Ack => {
                    self.unclaimed.insert(message.header.ack_id, message);
                }
                Ok(message) => tracing::warn!("Unexpected {:?} message from server", message.kind()),
                Err(Errno::EAGAIN) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Round-trip a ping
    pub fn ping(&mut self, timeout: Option<Duration>) -> Result<(), ClientError> {
        let ack_id = self.send(MessageType::Ping, None)?;
        self.wait_for_ack(ack_id, timeout)?;
        Ok(())
    }

    /// Queue a repaint and return the ack id that completes with its refresh
    pub fn repaint_async(&mut self, command: &RepaintCommand) -> Result<u32, ClientError> {
        self.send_payload(command)
    }

    /// Repaint a region of a surface and block until the panel has refreshed
    pub fn repaint(
        &mut self,
        surface_id: u32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        waveform: WaveformMode,
        marker: u32,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        let ack_id = self.repaint_async(&RepaintCommand {
            x,
            y,
            width,
            height,
            waveform,
            marker,
            surface_id,
        })?;
        self.wait_for_ack(ack_id, timeout)?;
        Ok(())
    }

    pub fn move_surface(
        &mut self,
        surface_id: u32,
        x: i32,
        y: i32,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        let ack_id = self.send_payload(&MoveCommand { surface_id, x, y })?;
        self.wait_for_ack(ack_id, timeout)?;
        Ok(())
    }

    pub fn surface_info(
        &mut self,
        surface_id: u32,
        timeout: Option<Duration>,
    ) -> Result<SurfaceInfo, ClientError> {
        let ack_id = self.send_payload(&InfoRequest { surface_id })?;
        let reply = self.wait_for_ack(ack_id, timeout)?;
        Ok(cast(Some(&reply))?)
    }

    /// Next input event, `None` if nothing arrived before the timeout
    pub fn read_event(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<EventPacket>, ClientError> {
        let (fd, reader) = self.input.as_mut().ok_or(ClientError::NoInput)?;
        loop {
            match reader.read_blocking(fd.as_fd(), timeout) {
                Ok(message) => match cast::<EventPacket>(Some(&message)) {
                    Ok(event) => return Ok(Some(event)),
                    Err(err) => tracing::warn!("Dropping malformed input message: {}", err),
                },
                Err(Errno::ETIMEDOUT) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }
}
