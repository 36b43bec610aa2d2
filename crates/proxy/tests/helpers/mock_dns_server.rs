//! Scriptable UDP DNS server for end-to-end tests.

use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

#[derive(Clone)]
pub enum MockBehavior {
    /// Answer A questions with this address; AAAA questions get NOERROR with
    /// no answers.
    StaticA(Ipv4Addr),
    /// DNS64 resolver: `ipv4only.arpa. AAAA` probes get a synthesized answer
    /// under `prefix`; everything else behaves like `StaticA(a)`.
    Dns64 { prefix: [u8; 12], a: Ipv4Addr },
    /// Swallow every query.
    Silent,
}

pub struct MockDnsServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockDnsServer {
    pub async fn start(behavior: MockBehavior) -> std::io::Result<Self> {
        Self::start_on("127.0.0.1:0", behavior).await
    }

    /// Binds on the given address; DNS64 probe targets need `[::1]:0`.
    pub async fn start_on(bind: &str, behavior: MockBehavior) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        let addr = socket.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    received = socket.recv_from(&mut buf) => {
                        let Ok((len, peer)) = received else { break };
                        if matches!(behavior, MockBehavior::Silent) {
                            continue;
                        }
                        if let Some(reply) = build_reply(&buf[..len], &behavior) {
                            let _ = socket.send_to(&reply, peer).await;
                        }
                    }
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockDnsServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn build_reply(query: &[u8], behavior: &MockBehavior) -> Option<Vec<u8>> {
    let request = Message::from_vec(query).ok()?;
    let question = request.queries().first()?.clone();

    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(OpCode::Query);
    reply.set_recursion_available(true);
    reply.add_query(question.clone());

    match (behavior, question.query_type()) {
        (MockBehavior::StaticA(a) | MockBehavior::Dns64 { a, .. }, RecordType::A) => {
            reply.add_answer(Record::from_rdata(
                question.name().clone(),
                100,
                RData::A(A(*a)),
            ));
        }
        (MockBehavior::Dns64 { prefix, .. }, RecordType::AAAA)
            if question.name().to_utf8().eq_ignore_ascii_case("ipv4only.arpa.") =>
        {
            let mut octets = [0u8; 16];
            octets[..12].copy_from_slice(prefix);
            octets[12..].copy_from_slice(&Ipv4Addr::new(192, 0, 0, 170).octets());
            reply.add_answer(Record::from_rdata(
                question.name().clone(),
                600,
                RData::AAAA(AAAA(Ipv6Addr::from(octets))),
            ));
        }
        // AAAA for ordinary names stays empty: an IPv4-only world.
        _ => {}
    }

    reply.to_vec().ok()
}
