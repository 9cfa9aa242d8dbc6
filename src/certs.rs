use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow, bail};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};

use crate::codec::{CLIENT_MAGIC_LEN, Certificate, Construction};
use crate::config::ResolverConfig;
use crate::log::LogSink;
use crate::transport::{ExchangeReply, Exchanger, Transport};

/// Trust material for one server session, produced once per successful
/// certificate resolution and immutable afterwards.
#[derive(Debug, Clone)]
pub struct CertInfo {
    pub server_pk: [u8; 32],
    pub shared_key: [u8; 32],
    pub magic_query: [u8; CLIENT_MAGIC_LEN],
    pub construction: Construction,
    pub forward_secure: bool,
}

#[derive(Debug)]
pub struct CertResolution {
    /// Relays whose attempt completed without falling back to direct.
    pub usable_relays: Vec<SocketAddr>,
    pub cert: CertInfo,
    pub rtt_ms: u64,
}

/// Derives the session shared key from the winning certificate. The
/// XSalsa20/XChaCha20 box construction lives outside this crate.
pub trait SharedKeyDeriver: Send + Sync {
    fn derive_shared_key(
        &self,
        construction: Construction,
        secret_key: &[u8; 32],
        server_pk: &[u8; 32],
        provider_name: &str,
    ) -> [u8; 32];
}

static NEXT_QUERY_ID: AtomicU16 = AtomicU16::new(1);

const STANDARD_PROVIDER_PREFIX: &str = "2.dnscrypt-cert.";
const SEVEN_DAYS_SECS: u32 = 86400 * 7;

/// Fetches and verifies a server's current certificate over DNS.
///
/// Concurrent resolutions against the same server are each fully executed;
/// deduplication, if wanted, belongs to the caller.
pub struct CertResolver {
    config: Arc<ResolverConfig>,
    exchanger: Exchanger,
    key_deriver: Arc<dyn SharedKeyDeriver>,
    sink: LogSink,
}

impl CertResolver {
    pub fn new(
        config: Arc<ResolverConfig>,
        exchanger: Exchanger,
        key_deriver: Arc<dyn SharedKeyDeriver>,
        sink: LogSink,
    ) -> Self {
        Self {
            config,
            exchanger,
            key_deriver,
            sink,
        }
    }

    /// Resolves the certificate published under `provider_name`, trying each
    /// relay in order before a direct exchange. Only the response from the
    /// last attempted relay is parsed for certificates.
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve(
        &self,
        server_name: &str,
        proto: Transport,
        server_pk: &[u8],
        server_addr: SocketAddr,
        provider_name: &str,
        is_new: bool,
        relays: &[SocketAddr],
    ) -> anyhow::Result<CertResolution> {
        let pk: [u8; 32] = server_pk
            .try_into()
            .map_err(|_| anyhow!("invalid public key length"))?;
        let verifying_key = VerifyingKey::from_bytes(&pk).context("invalid ed25519 public key")?;

        let mut provider_name = provider_name.to_string();
        if !provider_name.ends_with('.') {
            provider_name.push('.');
        }
        if !provider_name.starts_with(STANDARD_PROVIDER_PREFIX) {
            self.sink.warn(&format!(
                "[{server_name}] uses a non-standard provider name \
                 ('{provider_name}' doesn't start with '{STANDARD_PROVIDER_PREFIX}')"
            ));
        }

        let mut query = Message::new();
        query.set_id(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed));
        query.set_op_code(OpCode::Query);
        query.set_message_type(MessageType::Query);
        query.set_recursion_desired(true);
        query.add_query(Query::query(
            Name::from_str(&provider_name).context("provider name is not a valid dns name")?,
            RecordType::TXT,
        ));

        let mut usable_relays = Vec::new();
        let reply = if relays.is_empty() {
            self.exchanger
                .exchange(proto, &query, server_addr, None, server_name)
                .await?
        } else {
            let mut last: Option<anyhow::Result<ExchangeReply>> = None;
            for (i, relay) in relays.iter().enumerate() {
                match self
                    .exchanger
                    .exchange(proto, &query, server_addr, Some(*relay), server_name)
                    .await
                {
                    Ok(reply) => {
                        if reply.via_relay {
                            usable_relays.push(*relay);
                        } else {
                            self.sink
                                .notice(&format!("relay [{}] failed for [{server_name}]", i + 1));
                        }
                        last = Some(Ok(reply));
                    }
                    Err(err) => {
                        self.sink.debug(&format!("{err:#}"));
                        last = Some(Err(err));
                    }
                }
            }
            if usable_relays.is_empty() {
                self.sink
                    .notice(&format!("all relays failed for [{server_name}]"));
                bail!("all relays failed");
            }
            // only the last attempt's response is considered
            last.expect("relay list is non-empty")?
        };

        let now = unix_now();
        let cert = self.pick_certificate(
            server_name,
            &provider_name,
            &verifying_key,
            &reply.response,
            now,
            is_new,
            reply.rtt,
        )?;
        Ok(CertResolution {
            usable_relays,
            cert,
            rtt_ms: reply.rtt.as_millis() as u64,
        })
    }

    /// Walks every TXT answer as a certificate candidate and keeps the best
    /// one: highest serial, ties broken toward the higher construction.
    #[allow(clippy::too_many_arguments)]
    fn pick_certificate(
        &self,
        server_name: &str,
        provider_name: &str,
        verifying_key: &VerifyingKey,
        response: &Message,
        now: u32,
        is_new: bool,
        rtt: Duration,
    ) -> anyhow::Result<CertInfo> {
        let mut cert_info = CertInfo {
            server_pk: [0u8; 32],
            shared_key: [0u8; 32],
            magic_query: [0u8; CLIENT_MAGIC_LEN],
            construction: Construction::Undefined,
            forward_secure: false,
        };
        let mut highest_serial = 0u32;
        let mut cert_count_marker = "";

        for answer in response.answers() {
            let Some(RData::TXT(txt)) = answer.data() else {
                self.sink.notice(&format!(
                    "[{server_name}] extra record of type [{}] found in certificate",
                    answer.record_type()
                ));
                continue;
            };
            let mut bin = Vec::new();
            for part in txt.txt_data() {
                bin.extend_from_slice(part);
            }
            let cert = match Certificate::parse(&bin) {
                Ok(cert) => cert,
                Err(err) => {
                    self.sink.warn(&format!("[{server_name}] {err:#}"));
                    continue;
                }
            };

            let sig = Signature::from_bytes(&cert.signature);
            if verifying_key.verify(&cert.signed, &sig).is_err() {
                self.sink.warn(&format!(
                    "[{server_name}] incorrect signature for provider name: [{provider_name}]"
                ));
                continue;
            }
            if cert.ts_begin >= cert.ts_end {
                self.sink.warn(&format!(
                    "[{server_name}] certificate ends before it starts ({} >= {})",
                    cert.ts_begin, cert.ts_end
                ));
                continue;
            }

            let window = cert.ts_end - cert.ts_begin;
            if window > SEVEN_DAYS_SECS {
                self.sink.info(&format!(
                    "[{server_name}] the key validity period for this server is excessively \
                     long ({} days), significantly reducing reliability and forward security",
                    window / 86400
                ));
                let days_left = cert.ts_end.saturating_sub(now) / 86400;
                if days_left < 1 {
                    self.sink.critical(&format!(
                        "[{server_name}] certificate will expire today -- switch to a \
                         different resolver as soon as possible"
                    ));
                } else if days_left <= 7 {
                    self.sink.warn(&format!(
                        "[{server_name}] certificate is about to expire -- if you don't \
                         manage this server, tell the server operator about it"
                    ));
                } else if days_left <= 30 {
                    self.sink.info(&format!(
                        "[{server_name}] certificate will expire in {days_left} days"
                    ));
                }
                cert_info.forward_secure = false;
            } else {
                cert_info.forward_secure = true;
            }

            if !self.config.cert_ignore_timestamp && (now > cert.ts_end || now < cert.ts_begin) {
                self.sink.debug(&format!(
                    "certificate of [{server_name}] is invalid at the current date \
                     (now: {now} is not in [{}..{}])",
                    cert.ts_begin, cert.ts_end
                ));
                continue;
            }
            if cert.serial < highest_serial {
                self.sink
                    .debug(&format!("[{server_name}] superseded by a previous certificate"));
                continue;
            }
            if cert.serial == highest_serial {
                if cert.construction <= cert_info.construction {
                    self.sink.debug(&format!(
                        "[{server_name}] keeping the previous, preferred crypto construction"
                    ));
                    continue;
                }
                self.sink.debug(&format!(
                    "[{server_name}] upgrading the construction from {} to {}",
                    cert_info.construction, cert.construction
                ));
            }

            cert_info.shared_key = self.key_deriver.derive_shared_key(
                cert.construction,
                &self.config.secret_key,
                &cert.server_pk,
                provider_name,
            );
            highest_serial = cert.serial;
            cert_info.construction = cert.construction;
            cert_info.server_pk = cert.server_pk;
            cert_info.magic_query = cert.magic_query;

            let message = format!(
                "[{server_name}] OK (DNSCrypt V{}) - rtt: {}ms{cert_count_marker}",
                cert.es_version,
                rtt.as_millis()
            );
            if is_new {
                self.sink.notice(&message);
            } else {
                self.sink.info(&message);
            }
            cert_count_marker = " - additional certificate";
        }

        if cert_info.construction == Construction::Undefined {
            bail!("no useable certificate found");
        }
        Ok(cert_info)
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use hickory_proto::rr::Record;
    use hickory_proto::rr::rdata::TXT;
    use tokio::net::UdpSocket;

    use crate::codec::CERT_MAGIC;
    use crate::transport::MAX_DNS_PACKET_SIZE;

    const PROVIDER: &str = "2.dnscrypt-cert.example.com.";

    struct XorDeriver;

    impl SharedKeyDeriver for XorDeriver {
        fn derive_shared_key(
            &self,
            construction: Construction,
            secret_key: &[u8; 32],
            server_pk: &[u8; 32],
            _provider_name: &str,
        ) -> [u8; 32] {
            let mut key = [0u8; 32];
            for i in 0..32 {
                key[i] = secret_key[i] ^ server_pk[i];
            }
            key[0] ^= construction as u8;
            key
        }
    }

    fn provider_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn make_cert(
        signer: &SigningKey,
        es_version: u16,
        serial: u32,
        ts_begin: u32,
        ts_end: u32,
    ) -> Vec<u8> {
        let mut signed = Vec::new();
        signed.extend_from_slice(&[0x55; 32]); // session server pk
        signed.extend_from_slice(&[0x66; CLIENT_MAGIC_LEN]);
        signed.extend_from_slice(&serial.to_be_bytes());
        signed.extend_from_slice(&ts_begin.to_be_bytes());
        signed.extend_from_slice(&ts_end.to_be_bytes());
        let signature = signer.sign(&signed);

        let mut bin = Vec::new();
        bin.extend_from_slice(&CERT_MAGIC);
        bin.extend_from_slice(&es_version.to_be_bytes());
        bin.extend_from_slice(&[0, 0]);
        bin.extend_from_slice(&signature.to_bytes());
        bin.extend_from_slice(&signed);
        bin
    }

    fn response_with_certs(certs: &[Vec<u8>]) -> Message {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        let name = Name::from_str(PROVIDER).expect("name");
        for cert in certs {
            msg.add_answer(Record::from_rdata(
                name.clone(),
                3600,
                RData::TXT(TXT::from_bytes(vec![cert.as_slice()])),
            ));
        }
        msg
    }

    fn resolver(ignore_timestamp: bool) -> CertResolver {
        let config = Arc::new(ResolverConfig {
            secret_key: [3u8; 32],
            timeout: Duration::from_millis(300),
            relays: Vec::new(),
            cert_ignore_timestamp: ignore_timestamp,
        });
        let exchanger = Exchanger::new(config.timeout, LogSink::default());
        CertResolver::new(config, exchanger, Arc::new(XorDeriver), LogSink::default())
    }

    fn pick(resolver: &CertResolver, response: &Message, now: u32) -> anyhow::Result<CertInfo> {
        let verifying_key = provider_key().verifying_key();
        resolver.pick_certificate(
            "test-server",
            PROVIDER,
            &verifying_key,
            response,
            now,
            true,
            Duration::from_millis(20),
        )
    }

    #[test]
    fn higher_serial_supersedes_lower() {
        let key = provider_key();
        let now = 1_000_000;
        let response = response_with_certs(&[
            make_cert(&key, 1, 10, now - 100, now + 100),
            make_cert(&key, 1, 12, now - 100, now + 100),
            make_cert(&key, 1, 11, now - 100, now + 100),
        ]);
        let cert = pick(&resolver(false), &response, now).expect("resolution");
        // serial 12 won even though serial 11 came later
        assert_eq!(cert.construction, Construction::XSalsa20Poly1305);
        assert_eq!(cert.server_pk, [0x55; 32]);
        let mut expected = [0u8; 32];
        for i in 0..32 {
            expected[i] = 3 ^ 0x55;
        }
        expected[0] ^= Construction::XSalsa20Poly1305 as u8;
        assert_eq!(cert.shared_key, expected);
    }

    #[test]
    fn equal_serial_upgrades_construction_but_never_downgrades() {
        let key = provider_key();
        let now = 1_000_000;
        let upgrade = response_with_certs(&[
            make_cert(&key, 1, 5, now - 100, now + 100),
            make_cert(&key, 2, 5, now - 100, now + 100),
        ]);
        let cert = pick(&resolver(false), &upgrade, now).expect("resolution");
        assert_eq!(cert.construction, Construction::XChaCha20Poly1305);

        let downgrade = response_with_certs(&[
            make_cert(&key, 2, 5, now - 100, now + 100),
            make_cert(&key, 1, 5, now - 100, now + 100),
        ]);
        let cert = pick(&resolver(false), &downgrade, now).expect("resolution");
        assert_eq!(cert.construction, Construction::XChaCha20Poly1305);
    }

    #[test]
    fn bad_signature_never_selected_regardless_of_serial() {
        let key = provider_key();
        let now = 1_000_000;
        let mut forged = make_cert(&key, 2, 99, now - 100, now + 100);
        forged[120] ^= 1; // flip a signed byte after signing
        let response = response_with_certs(&[
            forged,
            make_cert(&key, 1, 1, now - 100, now + 100),
        ]);
        let cert = pick(&resolver(false), &response, now).expect("resolution");
        assert_eq!(cert.construction, Construction::XSalsa20Poly1305);
    }

    #[test]
    fn short_or_mangled_candidates_are_skipped() {
        let key = provider_key();
        let now = 1_000_000;
        let mut bad_magic = make_cert(&key, 1, 50, now - 100, now + 100);
        bad_magic[0] = b'X';
        let response = response_with_certs(&[
            vec![0u8; 60],
            bad_magic,
            make_cert(&key, 1, 2, now - 100, now + 100),
        ]);
        let cert = pick(&resolver(false), &response, now).expect("resolution");
        assert_eq!(cert.server_pk, [0x55; 32]);
    }

    #[test]
    fn inverted_validity_window_rejected() {
        let key = provider_key();
        let now = 1_000_000;
        let response = response_with_certs(&[make_cert(&key, 1, 1, now + 100, now - 100)]);
        assert!(pick(&resolver(false), &response, now).is_err());
    }

    #[test]
    fn expired_certificate_rejected_unless_timestamps_ignored() {
        let key = provider_key();
        let now = 1_000_000;
        let response = response_with_certs(&[make_cert(&key, 1, 1, now - 200, now - 100)]);
        assert!(pick(&resolver(false), &response, now).is_err());
        assert!(pick(&resolver(true), &response, now).is_ok());
    }

    #[test]
    fn long_validity_window_clears_forward_secrecy() {
        let key = provider_key();
        let now = 1_000_000_000;
        let long = response_with_certs(&[make_cert(
            &key,
            1,
            1,
            now - 100,
            now + 86400 * 60,
        )]);
        let cert = pick(&resolver(false), &long, now).expect("resolution");
        assert!(!cert.forward_secure);

        let short = response_with_certs(&[make_cert(&key, 1, 1, now - 100, now + 3600)]);
        let cert = pick(&resolver(false), &short, now).expect("resolution");
        assert!(cert.forward_secure);
    }

    #[test]
    fn empty_answer_is_no_useable_certificate() {
        let response = response_with_certs(&[]);
        let err = pick(&resolver(false), &response, 1_000_000).unwrap_err();
        assert!(err.to_string().contains("no useable certificate"));
    }

    #[tokio::test]
    async fn resolve_rejects_bad_public_key_length() {
        let resolver = resolver(false);
        let err = resolver
            .resolve(
                "test-server",
                Transport::Udp,
                &[0u8; 31],
                "127.0.0.1:5353".parse().unwrap(),
                PROVIDER,
                true,
                &[],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid public key length"));
    }

    async fn spawn_cert_server(certs: Vec<Vec<u8>>) -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = sock.local_addr().expect("local addr");
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
            loop {
                let Ok((len, peer)) = sock.recv_from(&mut buf).await else {
                    break;
                };
                use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
                let Ok(request) = Message::from_bytes(&buf[..len]) else {
                    continue;
                };
                let mut response = response_with_certs(&certs);
                response.set_id(request.id());
                response.add_queries(request.queries().to_vec());
                let mut out = Vec::with_capacity(1024);
                {
                    let mut encoder = BinEncoder::new(&mut out);
                    response.emit(&mut encoder).expect("encode");
                }
                let _ = sock.send_to(&out, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn resolve_end_to_end_over_udp() {
        let key = provider_key();
        let now = unix_now();
        let certs = vec![
            make_cert(&key, 1, 3, now - 100, now + 3600),
            make_cert(&key, 2, 3, now - 100, now + 3600),
        ];
        let addr = spawn_cert_server(certs).await;

        let resolver = resolver(false);
        let resolution = resolver
            .resolve(
                "test-server",
                Transport::Udp,
                provider_key().verifying_key().as_bytes(),
                addr,
                "2.dnscrypt-cert.example.com",
                true,
                &[],
            )
            .await
            .expect("resolution");

        assert!(resolution.usable_relays.is_empty());
        assert_eq!(resolution.cert.construction, Construction::XChaCha20Poly1305);
        assert_eq!(resolution.cert.magic_query, [0x66; CLIENT_MAGIC_LEN]);
        assert!(resolution.cert.forward_secure);
    }

    #[tokio::test]
    async fn all_relays_failed_is_a_named_error() {
        // neither the relay nor the fallback server answer
        let dead = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let dead_addr = dead.local_addr().expect("local addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let _ = dead.recv_from(&mut buf).await;
            }
        });
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let server_addr = server.local_addr().expect("local addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let _ = server.recv_from(&mut buf).await;
            }
        });

        struct NoopFramer;
        impl crate::transport::RelayFramer for NoopFramer {
            fn wrap_for_relay(&self, _server: SocketAddr, _packet: &mut Vec<u8>) {}
        }

        let config = Arc::new(ResolverConfig {
            secret_key: [3u8; 32],
            timeout: Duration::from_millis(150),
            relays: vec![dead_addr],
            cert_ignore_timestamp: false,
        });
        let exchanger = Exchanger::new(config.timeout, LogSink::default())
            .with_relay_framer(Arc::new(NoopFramer));
        let resolver =
            CertResolver::new(config.clone(), exchanger, Arc::new(XorDeriver), LogSink::default());

        let err = resolver
            .resolve(
                "test-server",
                Transport::Udp,
                provider_key().verifying_key().as_bytes(),
                server_addr,
                PROVIDER,
                true,
                &config.relays,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("all relays failed"));
    }
}
