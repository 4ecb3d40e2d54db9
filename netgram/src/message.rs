//! A single datagram: its `(senderId, tag)` header plus the payload that
//! follows it.
//!
//! The wire header is fixed at six bytes. `senderId: i16` and `tag: u16`
//! account for only four of those; the remaining two are a zero-filled
//! reserved field skipped on read and written as zero on encode — see the
//! header-length resolution in `DESIGN.md`.

use crate::buffer::{MessageBuffer, Reader, Writer};

/// `senderId(2) + tag(2) + reserved(2)`.
pub const HEADER_SIZE: usize = 6;

/// Which direction a [`Message`] was constructed in, tracked only so
/// [`Message::reader`]/[`Message::writer`] can hand back the matching
/// codec view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

/// A single datagram, wrapping a [`MessageBuffer`] and the decoded (or
/// not-yet-assigned) `(senderId, tag)` header.
#[derive(Clone)]
pub struct Message {
    buffer: MessageBuffer,
    sender_id: i16,
    tag: u16,
    direction: Direction,
}

impl Message {
    /// Builds an outgoing message: allocates a `Write`-mode buffer at the
    /// process default capacity and writes the placeholder header
    /// `(senderId = 0, tag)`. The sender id is patched in later, right
    /// before the message is sent, via [`Message::patch_sender_id`].
    pub fn outgoing(tag: u16) -> Self {
        Self::outgoing_with_capacity(tag, crate::buffer::default_capacity())
    }

    /// Like [`Message::outgoing`] but with an explicit buffer capacity.
    pub fn outgoing_with_capacity(tag: u16, capacity: usize) -> Self {
        let mut buffer = MessageBuffer::new_write(capacity);
        {
            let mut w = buffer.writer();
            w.write_i16(0);
            w.write_u16(tag);
            w.write_u16(0); // reserved
        }
        Self { buffer, sender_id: 0, tag, direction: Direction::Outgoing }
    }

    /// Wraps a received datagram, immediately decoding its header and
    /// leaving the read cursor at the payload start (offset
    /// [`HEADER_SIZE`]).
    pub fn incoming(data: Vec<u8>) -> Self {
        let mut buffer = MessageBuffer::new_read(data);
        let (sender_id, tag) = {
            let mut r = buffer.reader();
            let sender_id = r.read_i16();
            let tag = r.read_u16();
            r.read_u16(); // reserved
            (sender_id, tag)
        };
        Self { buffer, sender_id, tag, direction: Direction::Incoming }
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    pub fn sender_id(&self) -> i16 {
        self.sender_id
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    /// The full framed datagram (header + payload), ready to hand to a
    /// socket's `send`.
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Patches the sender-id field in place, without touching the append
    /// cursor. Used by [`crate::client::Client::send`] to stamp the
    /// client's assigned id into an already-framed outgoing message.
    pub fn patch_sender_id(&mut self, id: i16) {
        self.sender_id = id;
        self.buffer.patch_at(0, &id.to_be_bytes());
    }

    /// A payload writer, valid only if this message is `Outgoing`.
    /// Requesting it on an `Incoming` message returns an inert writer that
    /// rejects every write (see [`crate::buffer::Writer`]).
    pub fn writer(&mut self) -> Writer<'_> {
        self.buffer.writer()
    }

    /// A payload reader, valid only if this message is `Incoming`.
    /// Requesting it on an `Outgoing` message returns an inert reader that
    /// returns defaults for every read.
    pub fn reader(&mut self) -> Reader<'_> {
        self.buffer.reader()
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }
}
