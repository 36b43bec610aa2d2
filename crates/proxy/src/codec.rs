//! DNS wire codec and TCP framing.
//!
//! DNS over TCP prefixes every message with a big-endian 2-byte length
//! (RFC 1035 §4.2.2); UDP carries bare messages up to 65,535 bytes.

use corten_dns_domain::ProxyError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 12-byte header plus the smallest possible question (root name, type, class).
pub const MIN_PACKET_SIZE: usize = 17;

/// Largest message either framing can carry.
pub const MAX_MESSAGE_SIZE: usize = 65_535;

pub fn unpack(bytes: &[u8]) -> Result<Message, ProxyError> {
    if bytes.len() < MIN_PACKET_SIZE {
        return Err(ProxyError::InvalidPacket(format!(
            "packet too short: {} bytes",
            bytes.len()
        )));
    }
    Message::from_vec(bytes).map_err(|e| ProxyError::InvalidPacket(e.to_string()))
}

pub fn pack(message: &Message) -> Result<Vec<u8>, ProxyError> {
    message.to_vec().map_err(|e| ProxyError::Encode(e.to_string()))
}

/// Prepends the 2-byte big-endian length prefix used on stream transports.
pub fn frame_tcp(bytes: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    framed.extend_from_slice(bytes);
    framed
}

/// Reads one length-prefixed message from a stream. Fails on EOF and on
/// lengths above [`MAX_MESSAGE_SIZE`].
pub async fn read_prefixed<S>(stream: &mut S) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| ProxyError::Framing(format!("failed to read message length: {}", e)))?;

    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProxyError::Framing(format!(
            "message too large: {} bytes (max {})",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| ProxyError::Framing(format!("failed to read message body: {}", e)))?;

    Ok(body)
}

/// Writes one length-prefixed message to a stream.
pub async fn write_prefixed<S>(stream: &mut S, bytes: &[u8]) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&(bytes.len() as u16).to_be_bytes())
        .await
        .map_err(|e| ProxyError::Framing(format!("failed to write length prefix: {}", e)))?;
    stream
        .write_all(bytes)
        .await
        .map_err(|e| ProxyError::Framing(format!("failed to write message body: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| ProxyError::Framing(format!("failed to flush stream: {}", e)))?;
    Ok(())
}

/// Builds a recursion-desired query with a random ID.
pub fn new_query(name: Name, record_type: RecordType) -> Message {
    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);

    let mut message = Message::new();
    message.set_id(fastrand::u16(..));
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(query);
    message
}
