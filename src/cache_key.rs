use sha2::{Digest, Sha512_256};

/// Sole identity for cache entries. A 256-bit digest; collisions are accepted
/// as a cryptographically negligible risk rather than resolved by comparison.
pub type CacheKey = [u8; 32];

/// Normalizes a question name: ASCII lowercase, fully qualified with a
/// trailing dot. DNS labels are ASCII or punycode, so byte-wise lowering is
/// enough.
pub fn canonical_name(name: &str) -> String {
    let mut out = name.to_ascii_lowercase();
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}

/// Derives a stable 32-byte key for a DNS question: a 5-byte big-endian
/// header (qtype, qclass, dnssec flag) followed by the canonical name, hashed
/// with SHA-512/256.
pub fn cache_key(dnssec: bool, qtype: u16, qclass: u16, name: &str) -> CacheKey {
    let mut header = [0u8; 5];
    header[0..2].copy_from_slice(&qtype.to_be_bytes());
    header[2..4].copy_from_slice(&qclass.to_be_bytes());
    if dnssec {
        header[4] = 1;
    }
    let mut hasher = Sha512_256::new();
    hasher.update(header);
    hasher.update(canonical_name(name).as_bytes());
    hasher.finalize().into()
}
