pub mod envelope;
pub mod kdf;

use std::fmt;

use aes::Aes128;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use cmac::{Cmac, Mac};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::{Coordinates, FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// AES-128 key length in bytes. Every key in the hierarchy has this size.
pub const KEY_LEN: usize = 16;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM / AES-CMAC tag length in bytes.
pub const TAG_LEN: usize = 16;

/// P-256 coordinate / scalar length in bytes.
pub const COORD_LEN: usize = 32;

/// 16-byte CMAC or GCM tag.
pub type MacTag = [u8; TAG_LEN];

/// 128-bit symmetric key, wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The all-zero key used to derive the KDK.
    pub const fn zero() -> Self {
        Self([0u8; KEY_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// A P-256 point in wire form: both coordinates little-endian.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EcPoint {
    pub x: [u8; COORD_LEN],
    pub y: [u8; COORD_LEN],
}

impl EcPoint {
    /// Build a point from little-endian coordinate slices.
    pub fn from_le_slices(x: &[u8], y: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            x: to_array(x, "EC x coordinate")?,
            y: to_array(y, "EC y coordinate")?,
        })
    }

    /// `x || y`, little-endian, as hashed and MACed by the protocol.
    pub fn to_bytes(&self) -> [u8; 2 * COORD_LEN] {
        let mut out = [0u8; 2 * COORD_LEN];
        out[..COORD_LEN].copy_from_slice(&self.x);
        out[COORD_LEN..].copy_from_slice(&self.y);
        out
    }
}

impl fmt::Debug for EcPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcPoint")
            .field("x", &hex::encode(self.x))
            .field("y", &hex::encode(self.y))
            .finish()
    }
}

/// A P-256 private scalar, big-endian, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EcSecret([u8; COORD_LEN]);

impl EcSecret {
    pub const fn from_be_bytes(bytes: [u8; COORD_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a scalar from its little-endian encoding.
    pub fn from_le_bytes(mut bytes: [u8; COORD_LEN]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    pub fn as_be_bytes(&self) -> &[u8; COORD_LEN] {
        &self.0
    }
}

impl fmt::Debug for EcSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EcSecret(..)")
    }
}

/// An ephemeral P-256 key pair.
pub struct EphemeralKeyPair {
    pub secret: EcSecret,
    pub public: EcPoint,
}

/// Crypto capability injected into every session.
///
/// Byte order at this boundary: points are in wire form (little-endian),
/// scalars and raw ECDH output are big-endian as the curve library produces
/// them. Callers perform the protocol's explicit reversals.
pub trait CryptoProvider: Send + Sync {
    /// Fill `buf` with cryptographically secure random bytes.
    fn random_bytes(&self, buf: &mut [u8]);

    /// Generate a fresh ephemeral P-256 key pair.
    fn generate_keypair(&self) -> EphemeralKeyPair;

    /// Raw ECDH output: the x coordinate of the shared point, big-endian.
    fn ecdh(
        &self,
        secret: &EcSecret,
        peer: &EcPoint,
    ) -> Result<Zeroizing<[u8; COORD_LEN]>, CryptoError>;

    /// ECDSA-P256 over SHA-256. Returns `(r, s)`, big-endian.
    fn ecdsa_sign(
        &self,
        secret: &EcSecret,
        message: &[u8],
    ) -> Result<([u8; COORD_LEN], [u8; COORD_LEN]), CryptoError>;

    /// Wire-form public point of `secret`.
    fn public_key(&self, secret: &EcSecret) -> Result<EcPoint, CryptoError>;

    /// Verify an ECDSA-P256/SHA-256 signature given as big-endian `(r, s)`.
    fn ecdsa_verify(
        &self,
        public: &EcPoint,
        message: &[u8],
        r: &[u8; COORD_LEN],
        s: &[u8; COORD_LEN],
    ) -> Result<(), CryptoError>;

    /// AES-128-CMAC.
    fn cmac(&self, key: &SymmetricKey, message: &[u8]) -> MacTag;

    /// SHA-256.
    fn sha256(&self, message: &[u8]) -> [u8; 32];

    /// AES-128-GCM with empty AAD. Returns the ciphertext and detached tag.
    fn seal(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, MacTag), CryptoError>;

    /// Inverse of [`CryptoProvider::seal`].
    fn open(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        tag: &MacTag,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// [`CryptoProvider`] backed by the RustCrypto crates (`p256`, `aes`,
/// `cmac`, `aes-gcm`, `sha2`) and the OS RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoProvider;

impl RustCryptoProvider {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for RustCryptoProvider {
    fn random_bytes(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    fn generate_keypair(&self) -> EphemeralKeyPair {
        let secret = SecretKey::random(&mut OsRng);
        let public = encode_point(&secret.public_key());
        let mut scalar = [0u8; COORD_LEN];
        scalar.copy_from_slice(&secret.to_bytes());
        let secret = EcSecret::from_be_bytes(scalar);
        scalar.zeroize();
        EphemeralKeyPair { secret, public }
    }

    fn ecdh(
        &self,
        secret: &EcSecret,
        peer: &EcPoint,
    ) -> Result<Zeroizing<[u8; COORD_LEN]>, CryptoError> {
        let secret = secret_key(secret)?;
        let peer = decode_point(peer)?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = Zeroizing::new([0u8; COORD_LEN]);
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }

    fn ecdsa_sign(
        &self,
        secret: &EcSecret,
        message: &[u8],
    ) -> Result<([u8; COORD_LEN], [u8; COORD_LEN]), CryptoError> {
        let key = SigningKey::from_bytes(FieldBytes::from_slice(secret.as_be_bytes()))
            .map_err(|_| CryptoError::InvalidPrivateKey)?;
        let signature: Signature = key
            .try_sign(message)
            .map_err(|_| CryptoError::SigningFailed)?;
        let (r, s) = signature.split_bytes();
        let mut r_out = [0u8; COORD_LEN];
        let mut s_out = [0u8; COORD_LEN];
        r_out.copy_from_slice(&r);
        s_out.copy_from_slice(&s);
        Ok((r_out, s_out))
    }

    fn public_key(&self, secret: &EcSecret) -> Result<EcPoint, CryptoError> {
        Ok(encode_point(&secret_key(secret)?.public_key()))
    }

    fn ecdsa_verify(
        &self,
        public: &EcPoint,
        message: &[u8],
        r: &[u8; COORD_LEN],
        s: &[u8; COORD_LEN],
    ) -> Result<(), CryptoError> {
        let key = VerifyingKey::from(decode_point(public)?);
        let signature =
            Signature::from_scalars(*FieldBytes::from_slice(r), *FieldBytes::from_slice(s))
                .map_err(|_| CryptoError::BadSignature)?;
        key.verify(message, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }

    fn cmac(&self, key: &SymmetricKey, message: &[u8]) -> MacTag {
        let mut mac = <Cmac<Aes128> as KeyInit>::new(key.as_bytes().into());
        mac.update(message);
        mac.finalize().into_bytes().into()
    }

    fn sha256(&self, message: &[u8]) -> [u8; 32] {
        Sha256::digest(message).into()
    }

    fn seal(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, MacTag), CryptoError> {
        let cipher = Aes128Gcm::new(key.as_bytes().into());
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::SealFailed)?;
        let tag_start = sealed.len() - TAG_LEN;
        let tag = to_array(&sealed[tag_start..], "GCM tag")?;
        sealed.truncate(tag_start);
        Ok((sealed, tag))
    }

    fn open(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        tag: &MacTag,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes128Gcm::new(key.as_bytes().into());
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
            .map_err(|_| CryptoError::OpenFailed)
    }
}

/// Copy a slice into a fixed-size array, reporting the field on mismatch.
pub(crate) fn to_array<const N: usize>(
    bytes: &[u8],
    what: &'static str,
) -> Result<[u8; N], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidLength {
        what,
        expected: N,
        actual: bytes.len(),
    })
}

fn secret_key(secret: &EcSecret) -> Result<SecretKey, CryptoError> {
    SecretKey::from_bytes(FieldBytes::from_slice(secret.as_be_bytes()))
        .map_err(|_| CryptoError::InvalidPrivateKey)
}

/// Wire (little-endian) point to a validated curve point.
pub(crate) fn decode_point(point: &EcPoint) -> Result<PublicKey, CryptoError> {
    let mut x = point.x;
    let mut y = point.y;
    x.reverse();
    y.reverse();
    let encoded = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(&x),
        FieldBytes::from_slice(&y),
        false,
    );
    Option::from(PublicKey::from_encoded_point(&encoded)).ok_or(CryptoError::InvalidPublicKey)
}

/// Curve point to wire (little-endian) form.
pub(crate) fn encode_point(public: &PublicKey) -> EcPoint {
    let encoded = public.to_encoded_point(false);
    match encoded.coordinates() {
        Coordinates::Uncompressed { x, y } => {
            let mut point = EcPoint {
                x: [0u8; COORD_LEN],
                y: [0u8; COORD_LEN],
            };
            point.x.copy_from_slice(x);
            point.y.copy_from_slice(y);
            point.x.reverse();
            point.y.reverse();
            point
        }
        _ => unreachable!("uncompressed encoding of a non-identity point"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmac_matches_rfc4493_vectors() {
        let crypto = RustCryptoProvider::new();
        let key = SymmetricKey::from_bytes(
            hex::decode("2b7e151628aed2a6abf7158809cf4f3c")
                .unwrap()
                .try_into()
                .unwrap(),
        );
        assert_eq!(
            hex::encode(crypto.cmac(&key, b"")),
            "bb1d6929e95937287fa37d129b756746"
        );
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        assert_eq!(
            hex::encode(crypto.cmac(&key, &msg)),
            "070a16b46b4d4144f79bdd9dd04a287c"
        );
    }

    #[test]
    fn ecdh_agrees_in_both_directions() {
        let crypto = RustCryptoProvider::new();
        let alice = crypto.generate_keypair();
        let bob = crypto.generate_keypair();

        let ab = crypto.ecdh(&alice.secret, &bob.public).unwrap();
        let ba = crypto.ecdh(&bob.secret, &alice.public).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn ecdsa_sign_then_verify() {
        let crypto = RustCryptoProvider::new();
        let pair = crypto.generate_keypair();
        assert_eq!(crypto.public_key(&pair.secret).unwrap(), pair.public);

        let (r, s) = crypto.ecdsa_sign(&pair.secret, b"gb || ga").unwrap();
        crypto.ecdsa_verify(&pair.public, b"gb || ga", &r, &s).unwrap();
        assert!(matches!(
            crypto.ecdsa_verify(&pair.public, b"ga || gb", &r, &s),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn point_wire_form_round_trips() {
        let crypto = RustCryptoProvider::new();
        let pair = crypto.generate_keypair();
        let decoded = decode_point(&pair.public).unwrap();
        assert_eq!(encode_point(&decoded), pair.public);
    }

    #[test]
    fn off_curve_point_rejected() {
        let crypto = RustCryptoProvider::new();
        let pair = crypto.generate_keypair();
        let bogus = EcPoint {
            x: [1u8; COORD_LEN],
            y: [2u8; COORD_LEN],
        };
        assert!(matches!(
            crypto.ecdh(&pair.secret, &bogus),
            Err(CryptoError::InvalidPublicKey)
        ));
    }

    #[test]
    fn seal_then_open() {
        let crypto = RustCryptoProvider::new();
        let key = SymmetricKey::from_bytes([0x42; KEY_LEN]);
        let nonce = [7u8; NONCE_LEN];

        let (ct, tag) = crypto.seal(&key, &nonce, b"needle").unwrap();
        assert_eq!(ct.len(), 6);
        let pt = crypto.open(&key, &nonce, &ct, &tag).unwrap();
        assert_eq!(pt, b"needle");
    }

    #[test]
    fn tampered_tag_fails() {
        let crypto = RustCryptoProvider::new();
        let key = SymmetricKey::from_bytes([0x42; KEY_LEN]);
        let nonce = [7u8; NONCE_LEN];

        let (ct, mut tag) = crypto.seal(&key, &nonce, b"needle").unwrap();
        tag[0] ^= 0x01;
        assert!(matches!(
            crypto.open(&key, &nonce, &ct, &tag),
            Err(CryptoError::OpenFailed)
        ));
    }

    #[test]
    fn secret_from_le_reverses() {
        let mut le = [0u8; COORD_LEN];
        le[0] = 0xAB;
        let secret = EcSecret::from_le_bytes(le);
        assert_eq!(secret.as_be_bytes()[COORD_LEN - 1], 0xAB);
    }

    #[test]
    fn debug_redacts_key_material() {
        let key = SymmetricKey::from_bytes([0x42; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "SymmetricKey(..)");
    }
}
