use bytes::Buf;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use super::{CryptoProvider, MacTag, SymmetricKey, NONCE_LEN};
use crate::error::{CryptoError, Error, IntegrityError, ProtocolError};
use crate::transport::wire::{b64, b64_array};

/// Length of the little-endian signed timing value the server appends to
/// response payloads, outside the ciphertext.
pub const TIMING_TRAILER_LEN: usize = 8;

/// Nonce used by the two integrity-only messages (handshake confirmation and
/// ORAM configuration). Each is tagged under SK exactly once per session.
pub const ZERO_IV: [u8; NONCE_LEN] = [0u8; NONCE_LEN];

/// The `{iv, payload, mac}` message body exchanged with the enclave service.
///
/// For AEAD traffic `payload` holds the ciphertext (optionally followed by
/// plaintext trailer bytes) and `mac` the detached GCM tag. For signed
/// messages `payload` is plaintext, `iv` is all-zero and `mac` is a CMAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureEnvelope {
    #[serde(with = "b64_array")]
    pub iv: [u8; NONCE_LEN],
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    #[serde(with = "b64_array")]
    pub mac: MacTag,
}

impl SecureEnvelope {
    /// Integrity-only envelope: zero IV, plaintext payload, `CMAC(key, payload)`.
    pub fn signed(crypto: &dyn CryptoProvider, key: &SymmetricKey, payload: Vec<u8>) -> Self {
        let mac = crypto.cmac(key, &payload);
        Self {
            iv: ZERO_IV,
            payload,
            mac,
        }
    }

    /// Constant-time check of a [`SecureEnvelope::signed`] tag.
    pub fn verify_signed(
        &self,
        crypto: &dyn CryptoProvider,
        key: &SymmetricKey,
    ) -> Result<(), IntegrityError> {
        let expected = crypto.cmac(key, &self.payload);
        if bool::from(expected.ct_eq(&self.mac)) {
            Ok(())
        } else {
            Err(IntegrityError::EnvelopeTag)
        }
    }

    /// AEAD-encrypt `plaintext` under a fresh random nonce, then append the
    /// plaintext `trailer` after the ciphertext.
    pub fn seal(
        crypto: &dyn CryptoProvider,
        key: &SymmetricKey,
        plaintext: &[u8],
        trailer: &[u8],
    ) -> Result<Self, CryptoError> {
        let mut iv = [0u8; NONCE_LEN];
        crypto.random_bytes(&mut iv);
        Self::seal_with_nonce(crypto, key, iv, plaintext, trailer)
    }

    pub fn seal_with_nonce(
        crypto: &dyn CryptoProvider,
        key: &SymmetricKey,
        iv: [u8; NONCE_LEN],
        plaintext: &[u8],
        trailer: &[u8],
    ) -> Result<Self, CryptoError> {
        let (mut payload, mac) = crypto.seal(key, &iv, plaintext)?;
        payload.extend_from_slice(trailer);
        Ok(Self { iv, payload, mac })
    }

    /// Decrypt the whole payload.
    pub fn open(&self, crypto: &dyn CryptoProvider, key: &SymmetricKey) -> Result<Vec<u8>, Error> {
        let (plaintext, _) = self.open_split(crypto, key, self.payload.len())?;
        Ok(plaintext)
    }

    /// Decrypt the first `ciphertext_len` payload bytes and return the
    /// remaining plaintext trailer alongside.
    pub fn open_split(
        &self,
        crypto: &dyn CryptoProvider,
        key: &SymmetricKey,
        ciphertext_len: usize,
    ) -> Result<(Vec<u8>, &[u8]), Error> {
        if ciphertext_len > self.payload.len() {
            return Err(ProtocolError::InvalidField {
                field: "payload",
                reason: format!(
                    "expected at least {ciphertext_len} bytes, got {}",
                    self.payload.len()
                ),
            }
            .into());
        }
        let (ciphertext, trailer) = self.payload.split_at(ciphertext_len);
        let plaintext = crypto
            .open(key, &self.iv, ciphertext, &self.mac)
            .map_err(|_| IntegrityError::EnvelopeTag)?;
        Ok((plaintext, trailer))
    }

    /// Decrypt a server response whose payload ends with the timing trailer.
    pub fn open_timed(
        &self,
        crypto: &dyn CryptoProvider,
        key: &SymmetricKey,
    ) -> Result<(Vec<u8>, i64), Error> {
        let ciphertext_len = self
            .payload
            .len()
            .checked_sub(TIMING_TRAILER_LEN)
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "payload",
                reason: format!(
                    "{} bytes cannot hold the {TIMING_TRAILER_LEN}-byte timing trailer",
                    self.payload.len()
                ),
            })?;
        let (plaintext, mut trailer) = self.open_split(crypto, key, ciphertext_len)?;
        Ok((plaintext, trailer.get_i64_le()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;

    fn session_key() -> SymmetricKey {
        SymmetricKey::from_bytes([0x24; 16])
    }

    #[test]
    fn query_response_round_trip_recovers_range() {
        let crypto = RustCryptoProvider::new();
        let sk = session_key();

        let query = SecureEnvelope::seal(&crypto, &sk, &[0, 1, 2, 1], &[]).unwrap();
        assert_eq!(query.open(&crypto, &sk).unwrap(), vec![0, 1, 2, 1]);

        // The server answers under the same key and nonce.
        let mut range = Vec::new();
        range.extend_from_slice(&(-7i32).to_le_bytes());
        range.extend_from_slice(&1_000_000i32.to_le_bytes());
        let response = SecureEnvelope::seal_with_nonce(
            &crypto,
            &sk,
            query.iv,
            &range,
            &4242i64.to_le_bytes(),
        )
        .unwrap();

        let (plaintext, timing) = response.open_timed(&crypto, &sk).unwrap();
        assert_eq!(timing, 4242);
        let start = i32::from_le_bytes(plaintext[0..4].try_into().unwrap());
        let end = i32::from_le_bytes(plaintext[4..8].try_into().unwrap());
        assert_eq!((start, end), (-7, 1_000_000));
    }

    #[test]
    fn signed_envelope_uses_zero_iv_and_cmac() {
        let crypto = RustCryptoProvider::new();
        let sk = session_key();

        let env = SecureEnvelope::signed(&crypto, &sk, b"trusted subtol enclave".to_vec());
        assert_eq!(env.iv, ZERO_IV);
        assert_eq!(env.payload, b"trusted subtol enclave");
        assert_eq!(env.mac, crypto.cmac(&sk, b"trusted subtol enclave"));
        env.verify_signed(&crypto, &sk).unwrap();
    }

    #[test]
    fn signed_envelope_rejects_modified_payload() {
        let crypto = RustCryptoProvider::new();
        let sk = session_key();

        let mut env = SecureEnvelope::signed(&crypto, &sk, vec![1, 2, 3]);
        env.payload[0] ^= 0x80;
        assert!(matches!(
            env.verify_signed(&crypto, &sk),
            Err(IntegrityError::EnvelopeTag)
        ));
    }

    #[test]
    fn trailer_is_left_in_plaintext() {
        let crypto = RustCryptoProvider::new();
        let sk = session_key();

        let env = SecureEnvelope::seal(&crypto, &sk, &[0u8; 64], b"ecoli").unwrap();
        assert_eq!(env.payload.len(), 64 + 5);
        let (pt, trailer) = env.open_split(&crypto, &sk, 64).unwrap();
        assert_eq!(pt, vec![0u8; 64]);
        assert_eq!(trailer, b"ecoli");
    }

    #[test]
    fn tampered_ciphertext_is_an_integrity_error() {
        let crypto = RustCryptoProvider::new();
        let sk = session_key();

        let mut env = SecureEnvelope::seal(&crypto, &sk, b"abcdefgh", &0i64.to_le_bytes()).unwrap();
        env.payload[0] ^= 0x01;
        assert!(matches!(
            env.open_timed(&crypto, &sk),
            Err(Error::Integrity(IntegrityError::EnvelopeTag))
        ));
    }

    #[test]
    fn short_payload_is_a_protocol_error() {
        let crypto = RustCryptoProvider::new();
        let env = SecureEnvelope {
            iv: ZERO_IV,
            payload: vec![0u8; 3],
            mac: [0u8; 16],
        };
        assert!(matches!(
            env.open_timed(&crypto, &session_key()),
            Err(Error::Protocol(ProtocolError::InvalidField { .. }))
        ));
    }

    #[test]
    fn json_form_is_base64() {
        let crypto = RustCryptoProvider::new();
        let env = SecureEnvelope::signed(&crypto, &session_key(), vec![0u8; 3]);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["iv"], "AAAAAAAAAAAAAAAA");
        assert_eq!(json["payload"], "AAAA");

        let back: SecureEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }
}
