use crate::crypto::CryptoProvider;

/// Symbols the attestation-service nonce is drawn from.
pub const NONCE_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789?/@#!$%";

/// Length of the report nonce in characters.
pub const REPORT_NONCE_LEN: usize = 32;

/// Generate a single-use printable nonce for a report request.
///
/// Each random byte is reduced modulo the alphabet size; the resulting bias
/// is accepted.
pub fn generate(crypto: &dyn CryptoProvider) -> String {
    let mut raw = [0u8; REPORT_NONCE_LEN];
    crypto.random_bytes(&mut raw);
    raw.iter()
        .map(|b| NONCE_ALPHABET[*b as usize % NONCE_ALPHABET.len()] as char)
        .collect()
}
