//! Label-based key derivation for the attestation key hierarchy.
//!
//! `KDK = CMAC(0^128, shared_secret)` and every other key is one CMAC block
//! over a label `counter || name || 0x00 || output_bits_le16` keyed by KDK.

use super::{CryptoProvider, SymmetricKey, COORD_LEN};

/// Output length encoded in every label: 128 bits.
const OUTPUT_BITS: u16 = 128;

/// Names of the keys derived from the KDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyName {
    /// Sigma-protocol MAC key.
    Smk,
    /// Verification key, bound into the quote's report data.
    Vk,
    /// Master key.
    Mk,
    /// Session key used for all post-handshake traffic.
    Sk,
}

impl KeyName {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Smk => b"SMK",
            Self::Vk => b"VK",
            Self::Mk => b"MK",
            Self::Sk => b"SK",
        }
    }

    /// The derivation label, e.g. `\x01SMK\x00\x80\x00`.
    pub fn label(self) -> Vec<u8> {
        let name = self.as_bytes();
        let mut label = Vec::with_capacity(1 + name.len() + 1 + 2);
        label.push(0x01);
        label.extend_from_slice(name);
        label.push(0x00);
        label.extend_from_slice(&OUTPUT_BITS.to_le_bytes());
        label
    }
}

/// Keys available after the shared secret is established.
#[derive(Debug)]
pub struct PrimaryKeys {
    pub kdk: SymmetricKey,
    pub smk: SymmetricKey,
    pub vk: SymmetricKey,
}

/// Keys available once remote attestation succeeded.
#[derive(Debug)]
pub struct SessionKeys {
    pub mk: SymmetricKey,
    pub sk: SymmetricKey,
}

/// `KDK = CMAC(0^128, shared_secret)`; the secret is already little-endian.
pub fn derive_kdk(crypto: &dyn CryptoProvider, shared_secret: &[u8; COORD_LEN]) -> SymmetricKey {
    SymmetricKey::from_bytes(crypto.cmac(&SymmetricKey::zero(), shared_secret))
}

/// One labelled CMAC block keyed by the KDK.
pub fn derive_key(crypto: &dyn CryptoProvider, kdk: &SymmetricKey, name: KeyName) -> SymmetricKey {
    SymmetricKey::from_bytes(crypto.cmac(kdk, &name.label()))
}

pub fn derive_primary(
    crypto: &dyn CryptoProvider,
    shared_secret: &[u8; COORD_LEN],
) -> PrimaryKeys {
    let kdk = derive_kdk(crypto, shared_secret);
    let smk = derive_key(crypto, &kdk, KeyName::Smk);
    let vk = derive_key(crypto, &kdk, KeyName::Vk);
    PrimaryKeys { kdk, smk, vk }
}

pub fn derive_session(crypto: &dyn CryptoProvider, kdk: &SymmetricKey) -> SessionKeys {
    SessionKeys {
        mk: derive_key(crypto, kdk, KeyName::Mk),
        sk: derive_key(crypto, kdk, KeyName::Sk),
    }
}
