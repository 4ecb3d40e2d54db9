//! The user-defined-value contract, and the two payload types the wire
//! format reserves for protocol-internal use.

use crate::buffer::{Reader, Writer};

/// Implemented by any value that should be carried as a message payload.
///
/// Reading an unknown-typed value first default-constructs it
/// ([`Default`]), then delegates to [`deserialize`](Self::deserialize) —
/// see [`crate::buffer::Reader::read_serializable`].
pub trait Serializable {
    /// Writes `self` into `writer`, returning the number of bytes written.
    fn serialize(&self, writer: &mut Writer<'_>) -> usize;

    /// Reads fields from `reader` into `self`, in the same order
    /// [`serialize`](Self::serialize) wrote them.
    fn deserialize(&mut self, reader: &mut Reader<'_>);
}

/// Handshake payload carried by both `ClientConnected` messages: the
/// client's request (`id = 0`, `success = false`) and the server's ack
/// (`id` = newly assigned id, `success = true`). Also carried by
/// `ClientDisconnected` messages, where `success` indicates whether the
/// disconnect was client-initiated ("local").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConnectionInfo {
    pub name: String,
    pub id: i16,
    pub success: bool,
}

impl ClientConnectionInfo {
    pub fn new(name: impl Into<String>, id: i16, success: bool) -> Self {
        Self { name: name.into(), id, success }
    }
}

impl Serializable for ClientConnectionInfo {
    fn serialize(&self, writer: &mut Writer<'_>) -> usize {
        let mut n = 0usize;
        let r = writer.write_string(&self.name);
        n += r.max(0) as usize;
        n += writer.write_i16(self.id).max(0) as usize;
        n += writer.write_bool(self.success).max(0) as usize;
        n
    }

    fn deserialize(&mut self, reader: &mut Reader<'_>) {
        self.name = reader.read_string();
        self.id = reader.read_i16();
        self.success = reader.read_bool();
    }
}

/// Optional registration payload a client may send to tell the server
/// which user tags it wants delivered. Defined by the wire format (§6 of
/// the specification) but not wired into any automatic protocol behavior —
/// an application is free to send it under a user tag and consume it via
/// the [`crate::dispatcher::Dispatcher`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMessageTagRegistration {
    pub tags: Vec<u16>,
}

impl Serializable for ClientMessageTagRegistration {
    fn serialize(&self, writer: &mut Writer<'_>) -> usize {
        let mut n = writer.write_u16(self.tags.len() as u16).max(0) as usize;
        for tag in &self.tags {
            n += writer.write_u16(*tag).max(0) as usize;
        }
        n
    }

    fn deserialize(&mut self, reader: &mut Reader<'_>) {
        let count = reader.read_u16();
        self.tags = (0..count).map(|_| reader.read_u16()).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MessageBuffer;

    #[test]
    fn client_connection_info_round_trips() {
        let original = ClientConnectionInfo::new("alice", 7, true);
        let mut buf = MessageBuffer::new_write(64);
        original.serialize(&mut buf.writer());

        let mut read_buf = MessageBuffer::new_read(buf.as_slice().to_vec());
        let mut decoded = ClientConnectionInfo::default();
        decoded.deserialize(&mut read_buf.reader());
        assert_eq!(decoded, original);
    }

    #[test]
    fn tag_registration_round_trips() {
        let original = ClientMessageTagRegistration { tags: vec![201, 5000, 65000] };
        let mut buf = MessageBuffer::new_write(64);
        original.serialize(&mut buf.writer());

        let mut read_buf = MessageBuffer::new_read(buf.as_slice().to_vec());
        let decoded: ClientMessageTagRegistration = read_buf.reader().read_serializable();
        assert_eq!(decoded, original);
    }
}
