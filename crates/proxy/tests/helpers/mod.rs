#![allow(dead_code)]

pub mod mock_dns_server;

use async_trait::async_trait;
use corten_dns_domain::ProxyError;
use corten_dns_proxy::codec;
use corten_dns_proxy::Upstream;
use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

pub fn make_query(host: &str, record_type: RecordType) -> Message {
    let name = Name::from_str(&format!("{}.", host.trim_end_matches('.'))).unwrap();
    codec::new_query(name, record_type)
}

/// One UDP round trip against a server; `None` when no reply arrives within
/// the wait.
pub async fn udp_exchange(
    server: SocketAddr,
    request: &Message,
    wait: Duration,
) -> Option<Message> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let wire = request.to_vec().unwrap();
    socket.send_to(&wire, server).await.unwrap();

    let mut buf = vec![0u8; 65_535];
    match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(Message::from_vec(&buf[..len]).unwrap()),
        _ => None,
    }
}

/// One length-prefixed round trip over a fresh TCP connection.
pub async fn tcp_exchange(server: SocketAddr, request: &Message) -> Message {
    let mut stream = TcpStream::connect(server).await.unwrap();
    let wire = request.to_vec().unwrap();
    stream
        .write_all(&(wire.len() as u16).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&wire).await.unwrap();

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    Message::from_vec(&body).unwrap()
}

/// In-process upstream for driving the pipeline without sockets: answers A
/// questions with a fixed address, everything else with an empty NOERROR.
pub struct StaticUpstream {
    address: String,
    answer: Ipv4Addr,
}

impl StaticUpstream {
    pub fn new(address: &str, answer: Ipv4Addr) -> Self {
        Self {
            address: address.to_string(),
            answer,
        }
    }
}

#[async_trait]
impl Upstream for StaticUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message, ProxyError> {
        let mut reply = Message::new();
        reply.set_id(request.id());
        reply.set_message_type(MessageType::Response);
        reply.set_op_code(OpCode::Query);
        reply.set_recursion_available(true);
        for q in request.queries() {
            reply.add_query(q.clone());
        }
        if let Some(q) = request.queries().first() {
            if q.query_type() == RecordType::A {
                reply.add_answer(Record::from_rdata(
                    q.name().clone(),
                    100,
                    RData::A(A(self.answer)),
                ));
            }
        }
        Ok(reply)
    }

    fn address(&self) -> &str {
        &self.address
    }
}
