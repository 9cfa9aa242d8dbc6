use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use serde::Deserialize;
use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::log::LogSink;

/// Largest datagram/frame we accept from an upstream.
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
/// Short UDP queries are padded toward this encoded length so certificate
/// lookups are not distinguishable by size.
const QUERY_PAD_TO: usize = 480;
/// EDNS0 option code for padding (RFC 7830).
const EDNS_PADDING_CODE: u16 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Udp,
    Tcp,
}

/// Wraps an encoded packet for relay delivery, prepending whatever header and
/// addressing the relay protocol needs to reach `server`.
pub trait RelayFramer: Send + Sync {
    fn wrap_for_relay(&self, server: SocketAddr, packet: &mut Vec<u8>);
}

/// Dials TCP through a forward proxy instead of connecting directly.
pub trait ProxyDialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        addr: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send + 'a>>;
}

#[derive(Debug)]
pub struct ExchangeReply {
    pub response: Message,
    pub rtt: Duration,
    /// Whether the final successful attempt went through the relay. False
    /// after a relay->direct fallback or when no relay was supplied.
    pub via_relay: bool,
}

/// Sends one DNS query and reads one response. Each attempt uses a fresh
/// socket; the configured timeout bounds the whole dial/write/read of an
/// attempt.
pub struct Exchanger {
    timeout: Duration,
    framer: Option<Arc<dyn RelayFramer>>,
    dialer: Option<Arc<dyn ProxyDialer>>,
    sink: LogSink,
}

impl Exchanger {
    pub fn new(timeout: Duration, sink: LogSink) -> Self {
        Self {
            timeout,
            framer: None,
            dialer: None,
            sink,
        }
    }

    pub fn with_relay_framer(mut self, framer: Arc<dyn RelayFramer>) -> Self {
        self.framer = Some(framer);
        self
    }

    pub fn with_proxy_dialer(mut self, dialer: Arc<dyn ProxyDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// One exchange with the relay->direct fallback: a failed relayed attempt
    /// is retried exactly once over a direct connection.
    pub async fn exchange(
        &self,
        proto: Transport,
        query: &Message,
        server: SocketAddr,
        relay: Option<SocketAddr>,
        server_name: &str,
    ) -> anyhow::Result<ExchangeReply> {
        match self.exchange_once(proto, query, server, relay).await {
            Ok((response, rtt)) => Ok(ExchangeReply {
                response,
                rtt,
                via_relay: relay.is_some(),
            }),
            Err(err) => {
                let Some(relay_addr) = relay else {
                    return Err(err);
                };
                self.sink.debug(&format!(
                    "failed to get a certificate for [{server_name}] via relay [{relay_addr}], \
                     retrying over a direct connection: {err:#}"
                ));
                let (response, rtt) = self.exchange_once(proto, query, server, None).await?;
                self.sink.info(&format!(
                    "direct certificate retrieval for [{server_name}] succeeded"
                ));
                Ok(ExchangeReply {
                    response,
                    rtt,
                    via_relay: false,
                })
            }
        }
    }

    async fn exchange_once(
        &self,
        proto: Transport,
        query: &Message,
        server: SocketAddr,
        relay: Option<SocketAddr>,
    ) -> anyhow::Result<(Message, Duration)> {
        let mut query = query.clone();
        if proto == Transport::Udp {
            let qname_len = query
                .queries()
                .first()
                .map(|q| q.name().to_string().len())
                .unwrap_or(0);
            if qname_len < QUERY_PAD_TO {
                let mut edns = Edns::new();
                edns.set_max_payload(MAX_DNS_PACKET_SIZE as u16);
                edns.options_mut().insert(EdnsOption::Unknown(
                    EDNS_PADDING_CODE,
                    vec![0u8; QUERY_PAD_TO - qname_len],
                ));
                query.set_edns(edns);
            }
        }

        let mut packet = Vec::with_capacity(512);
        {
            let mut encoder = BinEncoder::new(&mut packet);
            query.emit(&mut encoder).context("pack query")?;
        }

        let mut upstream = server;
        if let Some(relay_addr) = relay {
            let framer = self
                .framer
                .as_ref()
                .context("relay requested without a relay framer")?;
            framer.wrap_for_relay(server, &mut packet);
            upstream = relay_addr;
        }

        let start = Instant::now();
        let raw = match proto {
            Transport::Udp => self.exchange_udp(&packet, upstream).await?,
            Transport::Tcp => self.exchange_tcp(&packet, upstream).await?,
        };
        let rtt = start.elapsed();

        let response = Message::from_bytes(&raw).context("unpack response")?;
        Ok((response, rtt))
    }

    async fn exchange_udp(&self, packet: &[u8], upstream: SocketAddr) -> anyhow::Result<Bytes> {
        let std_sock = self.bound_udp_socket(upstream)?;
        let sock = UdpSocket::from_std(std_sock).context("register udp socket")?;
        let io = async {
            sock.connect(upstream).await?;
            sock.send(packet).await?;
            let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
            let len = sock.recv(&mut buf).await?;
            Ok::<_, anyhow::Error>(Bytes::copy_from_slice(&buf[..len]))
        };
        match timeout(self.timeout, io).await {
            Ok(res) => res,
            Err(_) => anyhow::bail!("udp exchange with {upstream} timed out"),
        }
    }

    async fn exchange_tcp(&self, packet: &[u8], upstream: SocketAddr) -> anyhow::Result<Bytes> {
        if packet.len() > u16::MAX as usize {
            anyhow::bail!("query too large for tcp framing");
        }
        let io = async {
            let mut stream = match &self.dialer {
                Some(dialer) => dialer.dial(upstream).await?,
                None => TcpStream::connect(upstream).await?,
            };
            stream
                .write_all(&(packet.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(packet).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let resp_len = u16::from_be_bytes(len_buf) as usize;
            if resp_len == 0 || resp_len > MAX_DNS_PACKET_SIZE {
                anyhow::bail!("bad tcp frame length: {resp_len}");
            }
            let mut buf = vec![0u8; resp_len];
            stream.read_exact(&mut buf).await?;
            Ok::<_, anyhow::Error>(Bytes::from(buf))
        };
        match timeout(self.timeout, io).await {
            Ok(res) => res,
            Err(_) => anyhow::bail!("tcp exchange with {upstream} timed out"),
        }
    }

    fn bound_udp_socket(&self, remote: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
        let domain = if remote.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        if let Err(e) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
            self.sink
                .warn(&format!("failed to set udp recv buffer size: {e}"));
        }
        if let Err(e) = socket.set_send_buffer_size(4 * 1024 * 1024) {
            self.sink
                .warn(&format!("failed to set udp send buffer size: {e}"));
        }
        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        socket.bind(&bind.into()).context("bind")?;
        socket.set_nonblocking(true).context("set nonblocking")?;
        Ok(socket.into())
    }
}
