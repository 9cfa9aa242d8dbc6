use std::fmt;

use anyhow::bail;

/// Certificate magic, first four bytes of every DNSCrypt certificate.
pub const CERT_MAGIC: [u8; 4] = *b"DNSC";
/// Fixed length of the client-magic query prefix.
pub const CLIENT_MAGIC_LEN: usize = 8;
/// Minimum certificate length; the signed payload may extend past this.
pub const CERT_MIN_LEN: usize = 124;

/// Authenticated-encryption scheme a session will use. Ordered: on a serial
/// tie the higher construction wins, so upgrades are possible but never
/// downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Construction {
    Undefined,
    XSalsa20Poly1305,
    XChaCha20Poly1305,
}

impl Construction {
    pub fn from_es_version(version: u16) -> Option<Self> {
        match version {
            0x0001 => Some(Construction::XSalsa20Poly1305),
            0x0002 => Some(Construction::XChaCha20Poly1305),
            _ => None,
        }
    }
}

impl fmt::Display for Construction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Construction::Undefined => write!(f, "undefined"),
            Construction::XSalsa20Poly1305 => write!(f, "XSalsa20Poly1305"),
            Construction::XChaCha20Poly1305 => write!(f, "XChaCha20Poly1305"),
        }
    }
}

/// Decodes the escaped text form used by DNS TXT records into raw bytes.
///
/// A backslash introduces either a 3-digit decimal byte escape (`\DDD`,
/// byte-wrapping arithmetic), one of the `\t`/`\r`/`\n` control escapes, or a
/// literal escaped character. A lone backslash at the end of input terminates
/// decoding silently; that is the defined behavior, not an error.
pub fn unescape_txt(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'\\' {
            out.push(input[i]);
            i += 1;
            continue;
        }
        i += 1;
        if i == input.len() {
            break;
        }
        if i + 2 < input.len()
            && input[i].is_ascii_digit()
            && input[i + 1].is_ascii_digit()
            && input[i + 2].is_ascii_digit()
        {
            let byte = (input[i] - b'0')
                .wrapping_mul(100)
                .wrapping_add((input[i + 1] - b'0').wrapping_mul(10))
                .wrapping_add(input[i + 2] - b'0');
            out.push(byte);
            i += 3;
        } else {
            out.push(match input[i] {
                b't' => b'\t',
                b'r' => b'\r',
                b'n' => b'\n',
                other => other,
            });
            i += 1;
        }
    }
    out
}

/// One parsed certificate candidate. `signed` holds bytes `[72..]`, the exact
/// payload covered by the signature, including any trailing bytes past the
/// fixed layout.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub es_version: u16,
    pub construction: Construction,
    pub signature: [u8; 64],
    pub signed: Vec<u8>,
    pub server_pk: [u8; 32],
    pub magic_query: [u8; CLIENT_MAGIC_LEN],
    pub serial: u32,
    pub ts_begin: u32,
    pub ts_end: u32,
}

impl Certificate {
    /// Parses the fixed binary layout. Rejections here are per-candidate:
    /// callers log and move on to the next TXT record.
    pub fn parse(bin: &[u8]) -> anyhow::Result<Self> {
        if bin.len() < CERT_MIN_LEN {
            bail!("certificate is too short ({} bytes)", bin.len());
        }
        if bin[..4] != CERT_MAGIC {
            bail!("invalid certificate magic");
        }
        let es_version = u16::from_be_bytes([bin[4], bin[5]]);
        let Some(construction) = Construction::from_es_version(es_version) else {
            bail!("unsupported crypto construction (es-version {es_version})");
        };
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bin[8..72]);
        let mut server_pk = [0u8; 32];
        server_pk.copy_from_slice(&bin[72..104]);
        let mut magic_query = [0u8; CLIENT_MAGIC_LEN];
        magic_query.copy_from_slice(&bin[104..112]);
        Ok(Certificate {
            es_version,
            construction,
            signature,
            signed: bin[72..].to_vec(),
            server_pk,
            magic_query,
            serial: u32::from_be_bytes([bin[112], bin[113], bin[114], bin[115]]),
            ts_begin: u32::from_be_bytes([bin[116], bin[117], bin[118], bin[119]]),
            ts_end: u32::from_be_bytes([bin[120], bin[121], bin[122], bin[123]]),
        })
    }

    /// Parses a certificate supplied in escaped text form (zone files, static
    /// configuration). Over-the-wire TXT rdata already carries raw bytes.
    pub fn from_presentation(text: &str) -> anyhow::Result<Self> {
        Self::parse(&unescape_txt(text.as_bytes()))
    }
}
