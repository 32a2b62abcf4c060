//! Binary packet codec.
//!
//! Each notification type code has one registered [`NotificationHandler`]
//! that owns the layout of its type-specific fields. The codec frames
//! handlers' output, resolves senders and enforces packet-level limits.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ubot_id::{NodeNumber, PoolId, ResultHash, HASH_LEN};

use crate::error::CodecError;
use crate::node::NetConfig;
use crate::types::{
    CloudKind, Notification, NotificationBody, TYPE_CLOUD, TYPE_STARTING_CONTRACT,
};

/// Packet type carrying a batch of notifications.
pub const PACKET_TYPE_NOTIFICATIONS: u8 = 1;

/// Upper bound on the declared notification count of one packet.
pub const MAX_NOTIFICATIONS_PER_PACKET: i64 = 1000;

/// Upper bound on storage name length in bytes.
pub const MAX_STORAGE_NAME_LEN: usize = 255;

const CLOUD_EXEC_RESULT: u8 = 1;
const CLOUD_SINGLE_STORAGE: u8 = 2;
const CLOUD_MULTI_STORAGE: u8 = 3;

// =============================================================================
// Reader
// =============================================================================

/// Bounds-checked cursor over a byte slice.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    /// Wrap a slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.len() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn i32(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidField(format!("bool byte {other}"))),
        }
    }

    /// Take exactly `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn digest(&mut self) -> Result<[u8; HASH_LEN], CodecError> {
        let bytes = self.take(HASH_LEN)?;
        let mut digest = [0u8; HASH_LEN];
        digest.copy_from_slice(bytes);
        Ok(digest)
    }

    /// A `u16`-length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::InvalidField("string is not UTF-8".to_string()))
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes(self.buf.len()))
        }
    }
}

fn put_string(out: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len())
        .map_err(|_| CodecError::InvalidField(format!("string of {} bytes", s.len())))?;
    out.put_u16(len);
    out.put_slice(s.as_bytes());
    Ok(())
}

/// Check a storage name fits the wire format: 1 to [`MAX_STORAGE_NAME_LEN`] bytes.
pub fn validate_storage_name(name: &str) -> Result<(), CodecError> {
    if name.is_empty() || name.len() > MAX_STORAGE_NAME_LEN {
        return Err(CodecError::InvalidField(format!(
            "storage name of {} bytes",
            name.len()
        )));
    }
    Ok(())
}

fn put_storage_name(out: &mut BytesMut, name: &str) -> Result<(), CodecError> {
    validate_storage_name(name)?;
    put_string(out, name)
}

fn storage_name(name: String) -> Result<String, CodecError> {
    validate_storage_name(&name)?;
    Ok(name)
}

// =============================================================================
// Handlers
// =============================================================================

/// Field layout for one notification type code.
pub trait NotificationHandler: Send + Sync {
    /// The type code this handler is registered for.
    fn type_code(&self) -> u16;

    /// Append the type-specific fields of `body`.
    fn encode_fields(&self, body: &NotificationBody, out: &mut BytesMut) -> Result<(), CodecError>;

    /// Read the type-specific fields.
    fn decode_fields(&self, input: &mut Reader<'_>) -> Result<NotificationBody, CodecError>;
}

/// Download invite/answer: no fields beyond the common prefix.
struct StartingContractHandler;

impl NotificationHandler for StartingContractHandler {
    fn type_code(&self) -> u16 {
        TYPE_STARTING_CONTRACT
    }

    fn encode_fields(&self, body: &NotificationBody, _out: &mut BytesMut) -> Result<(), CodecError> {
        match body {
            NotificationBody::StartingContract => Ok(()),
            other => Err(CodecError::InvalidField(format!(
                "type {} body routed to starting contract handler",
                other.type_code()
            ))),
        }
    }

    fn decode_fields(&self, _input: &mut Reader<'_>) -> Result<NotificationBody, CodecError> {
        Ok(NotificationBody::StartingContract)
    }
}

/// Cloud envelope: `[kind:u8]` then kind-specific fields.
struct CloudHandler;

impl NotificationHandler for CloudHandler {
    fn type_code(&self) -> u16 {
        TYPE_CLOUD
    }

    fn encode_fields(&self, body: &NotificationBody, out: &mut BytesMut) -> Result<(), CodecError> {
        let NotificationBody::Cloud(kind) = body else {
            return Err(CodecError::InvalidField(format!(
                "type {} body routed to cloud handler",
                body.type_code()
            )));
        };

        match kind {
            CloudKind::ExecResult { hash } => {
                out.put_u8(CLOUD_EXEC_RESULT);
                out.put_slice(hash.as_bytes());
            }
            CloudKind::SingleStorage { name, seq, hash } => {
                out.put_u8(CLOUD_SINGLE_STORAGE);
                put_storage_name(out, name)?;
                out.put_u32(*seq);
                out.put_slice(hash.as_bytes());
            }
            CloudKind::MultiStorage { name, seq, hash } => {
                out.put_u8(CLOUD_MULTI_STORAGE);
                put_storage_name(out, name)?;
                out.put_u32(*seq);
                out.put_slice(hash.as_bytes());
            }
        }
        Ok(())
    }

    fn decode_fields(&self, input: &mut Reader<'_>) -> Result<NotificationBody, CodecError> {
        let kind = match input.u8()? {
            CLOUD_EXEC_RESULT => CloudKind::ExecResult {
                hash: ResultHash::from_bytes(input.digest()?),
            },
            CLOUD_SINGLE_STORAGE => CloudKind::SingleStorage {
                name: storage_name(input.string()?)?,
                seq: input.u32()?,
                hash: ResultHash::from_bytes(input.digest()?),
            },
            CLOUD_MULTI_STORAGE => CloudKind::MultiStorage {
                name: storage_name(input.string()?)?,
                seq: input.u32()?,
                hash: ResultHash::from_bytes(input.digest()?),
            },
            other => {
                return Err(CodecError::InvalidField(format!("cloud kind {other}")));
            }
        };
        Ok(NotificationBody::Cloud(kind))
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Packet codec with the statically registered handler set.
pub struct Codec {
    handlers: BTreeMap<u16, Box<dyn NotificationHandler>>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// Create a codec with every known notification type registered.
    pub fn new() -> Self {
        let mut codec = Self {
            handlers: BTreeMap::new(),
        };
        codec.register(Box::new(StartingContractHandler));
        codec.register(Box::new(CloudHandler));
        codec
    }

    fn register(&mut self, handler: Box<dyn NotificationHandler>) {
        self.handlers.insert(handler.type_code(), handler);
    }

    /// Registered type codes, ascending.
    pub fn type_codes(&self) -> impl Iterator<Item = u16> + '_ {
        self.handlers.keys().copied()
    }

    fn handler(&self, type_code: u16) -> Result<&dyn NotificationHandler, CodecError> {
        self.handlers
            .get(&type_code)
            .map(|h| h.as_ref())
            .ok_or(CodecError::UnknownTypeCode(type_code))
    }

    /// Encode notifications sent by `from` into one packet.
    pub fn encode_packet(
        &self,
        from: NodeNumber,
        notifications: &[Notification],
    ) -> Result<Bytes, CodecError> {
        let count = notifications.len() as i64;
        if count > MAX_NOTIFICATIONS_PER_PACKET {
            return Err(CodecError::InvalidCount(count));
        }

        let mut out = BytesMut::with_capacity(16 + notifications.len() * 64);
        out.put_u8(PACKET_TYPE_NOTIFICATIONS);
        out.put_u32(from.value());
        out.put_i32(count as i32);

        for notification in notifications {
            let type_code = notification.body.type_code();
            let handler = self.handler(type_code)?;

            let mut body = BytesMut::new();
            body.put_slice(notification.pool_id.as_bytes());
            body.put_u8(u8::from(notification.is_answer));
            handler.encode_fields(&notification.body, &mut body)?;

            out.put_u16(type_code);
            out.put_u32(body.len() as u32);
            out.put_slice(&body);
        }

        Ok(out.freeze())
    }

    /// Decode a packet, resolving the sender through `net`.
    ///
    /// The packet is rejected as a unit if any part of it is malformed.
    pub fn decode_packet(
        &self,
        data: &[u8],
        net: &NetConfig,
    ) -> Result<Vec<Notification>, CodecError> {
        let mut input = Reader::new(data);

        let packet_type = input.u8()?;
        if packet_type != PACKET_TYPE_NOTIFICATIONS {
            return Err(CodecError::UnknownPacketType(packet_type));
        }

        let from_number = NodeNumber::new(input.u32()?);
        let from = net
            .get(from_number)
            .cloned()
            .ok_or(CodecError::UnknownSender(from_number))?;

        let count = i64::from(input.i32()?);
        if !(0..=MAX_NOTIFICATIONS_PER_PACKET).contains(&count) {
            return Err(CodecError::InvalidCount(count));
        }

        let mut notifications = Vec::with_capacity(count as usize);
        for index in 0..count as usize {
            let notification = self
                .decode_notification(&mut input, &from)
                .map_err(|source| CodecError::Notification {
                    index,
                    source: Box::new(source),
                })?;
            notifications.push(notification);
        }

        input.finish()?;
        Ok(notifications)
    }

    fn decode_notification(
        &self,
        input: &mut Reader<'_>,
        from: &crate::node::NodeDescriptor,
    ) -> Result<Notification, CodecError> {
        let type_code = input.u16()?;
        let handler = self.handler(type_code)?;
        let len = input.u32()? as usize;
        let mut body = Reader::new(input.take(len)?);

        let pool_id = PoolId::from_bytes(body.digest()?);
        let is_answer = body.bool()?;
        let payload = handler.decode_fields(&mut body)?;
        body.finish()?;

        Ok(Notification {
            from: from.clone(),
            pool_id,
            is_answer,
            body: payload,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
