//! Typed remote-attestation handshake.
//!
//! Each step consumes `AttestationSession<S>` and yields the next state, so
//! steps cannot run out of order. A failed step consumes the session: the
//! server-side attestation context is dropped on a best-effort basis and
//! every key held so far is wiped on drop.
//!
//! ```text
//! Init -> SessionStarted -> KeysPrimaryDerived -> Msg2Sent -> Msg3Verified
//!      -> RemoteAttested -> SessionKeysDerived -> Confirmed -> SecureSession
//! ```

use std::fmt;
use std::sync::Arc;

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::client::SecureSession;
use super::{ClientConfig, Services};
use crate::attestation::{nonce, EnclaveIdentity, Quote};
use crate::crypto::envelope::SecureEnvelope;
use crate::crypto::kdf::{self, PrimaryKeys, SessionKeys};
use crate::crypto::{to_array, EcPoint, EcSecret, EphemeralKeyPair, SymmetricKey, COORD_LEN};
use crate::error::{CryptoError, Error, IntegrityError, ProtocolError, Result};
use crate::transport::wire::{Msg2, Msg3, ReportRequest};
use crate::transport::SessionId;

/// Unlinkable quote.
const QUOTE_TYPE: u16 = 0;

/// Default key derivation function.
const KDF_ID: u16 = 1;

/// Service-provider signing scalar, little-endian hex. The same key is
/// compiled into the enclave, which verifies msg2's signature with it.
const SP_SIGNING_KEY_LE_HEX: &str =
    "c6be22605aa47bf76567931eba55d37d2af2b67e08e6a0523776937b6707a129";

/// The fixed service-provider signing key.
pub fn service_provider_key() -> std::result::Result<EcSecret, CryptoError> {
    let bytes = hex::decode(SP_SIGNING_KEY_LE_HEX).map_err(|_| CryptoError::InvalidPrivateKey)?;
    Ok(EcSecret::from_le_bytes(to_array(&bytes, "service provider key")?))
}

// -- States --

mod sealed {
    pub trait Sealed {}
}

/// A handshake state.
pub trait HandshakeState: sealed::Sealed + Send {
    const NAME: &'static str;

    /// Server session, once one exists.
    fn session_id(&self) -> Option<&SessionId>;
}

pub struct Init;

pub struct SessionStarted {
    session: SessionId,
    ga: EcPoint,
    group_id: String,
    /// ECDH x coordinate, little-endian.
    shared_secret: Zeroizing<[u8; COORD_LEN]>,
}

pub struct KeysPrimaryDerived {
    session: SessionId,
    ga: EcPoint,
    group_id: String,
    keys: PrimaryKeys,
}

pub struct Msg2Sent {
    session: SessionId,
    ga: EcPoint,
    keys: PrimaryKeys,
    msg3: Msg3,
}

pub struct Msg3Verified {
    session: SessionId,
    keys: PrimaryKeys,
    quote: Quote,
}

pub struct RemoteAttested {
    session: SessionId,
    kdk: SymmetricKey,
    identity: EnclaveIdentity,
}

pub struct SessionKeysDerived {
    session: SessionId,
    identity: EnclaveIdentity,
    keys: SessionKeys,
}

pub struct Confirmed {
    session: SessionId,
    identity: EnclaveIdentity,
    keys: SessionKeys,
}

macro_rules! handshake_state {
    ($ty:ty, $name:literal) => {
        impl sealed::Sealed for $ty {}
        impl HandshakeState for $ty {
            const NAME: &'static str = $name;

            fn session_id(&self) -> Option<&SessionId> {
                Some(&self.session)
            }
        }
    };
}

impl sealed::Sealed for Init {}
impl HandshakeState for Init {
    const NAME: &'static str = "init";

    fn session_id(&self) -> Option<&SessionId> {
        None
    }
}

handshake_state!(SessionStarted, "session_started");
handshake_state!(KeysPrimaryDerived, "keys_primary_derived");
handshake_state!(Msg2Sent, "msg2_sent");
handshake_state!(Msg3Verified, "msg3_verified");
handshake_state!(RemoteAttested, "remote_attested");
handshake_state!(SessionKeysDerived, "session_keys_derived");
handshake_state!(Confirmed, "confirmed");

// -- Session --

/// Client side of the attestation handshake in state `S`.
pub struct AttestationSession<S: HandshakeState> {
    config: Arc<ClientConfig>,
    services: Services,
    keypair: EphemeralKeyPair,
    state: S,
}

impl<S: HandshakeState> fmt::Debug for AttestationSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestationSession")
            .field("state", &S::NAME)
            .field("session", &self.state.session_id())
            .finish_non_exhaustive()
    }
}

impl<S: HandshakeState> AttestationSession<S> {
    fn advance<T: HandshakeState>(self, state: T) -> AttestationSession<T> {
        AttestationSession {
            config: self.config,
            services: self.services,
            keypair: self.keypair,
            state,
        }
    }

    /// Name of the current state.
    pub fn state_name(&self) -> &'static str {
        S::NAME
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.state.session_id()
    }

    /// Client ephemeral public key (Gb), wire form.
    pub fn public_key(&self) -> &EcPoint {
        &self.keypair.public
    }

    /// Drop the server-side attestation context and return to `Init` with a
    /// fresh ephemeral key. Keys derived so far are wiped.
    pub async fn close(self) -> Result<AttestationSession<Init>> {
        if let Some(session) = self.state.session_id() {
            self.services
                .enclave
                .abort_attestation(session)
                .await
                .map_err(|e| ProtocolError::CloseFailed(e.to_string()))?;
            tracing::info!(state = S::NAME, "attestation session closed");
        }
        Ok(AttestationSession::new(self.config, self.services))
    }
}

impl AttestationSession<Init> {
    pub fn new(config: Arc<ClientConfig>, services: Services) -> Self {
        let keypair = services.crypto.generate_keypair();
        Self {
            config,
            services,
            keypair,
            state: Init,
        }
    }

    /// Run the whole handshake and hand over the confirmed keys.
    pub async fn establish(config: Arc<ClientConfig>, services: Services) -> Result<SecureSession> {
        Self::new(config, services).run().await
    }

    pub async fn run(self) -> Result<SecureSession> {
        let confirmed = self
            .start_session()
            .await?
            .derive_smk()
            .send_msg2()
            .await?
            .check_msg3()
            .await?
            .remote_attest()
            .await?
            .derive_session_keys()
            .final_handshake()
            .await?;
        Ok(confirmed.into_secure_session())
    }

    /// Obtain a server session (msg0/msg1) and perform ECDH.
    pub async fn start_session(self) -> Result<AttestationSession<SessionStarted>> {
        let (session, response) = self.services.enclave.start_session().await?;

        let extended_gid = le_uint(&response.msg0.extended_epid_group_id);
        if extended_gid != 0 {
            let err = ProtocolError::UnsupportedExtendedGroup(extended_gid);
            return Err(abort(&self.services, &session, err.into()).await);
        }

        let ga: EcPoint = response.msg1.sgx_server_ec_pubkey.into();
        let ecdh = self.services.crypto.ecdh(&self.keypair.secret, &ga);
        let mut shared_secret = or_abort(&self.services, &session, ecdh).await?;
        shared_secret.reverse();

        let mut gid = response.msg1.sgx_epid_group_id;
        gid.reverse();
        let group_id = hex::encode(gid);

        tracing::info!(?session, group_id = %group_id, "attestation session started");

        Ok(self.advance(SessionStarted {
            session,
            ga,
            group_id,
            shared_secret,
        }))
    }
}

impl AttestationSession<SessionStarted> {
    /// EPID group id, big-endian hex.
    pub fn group_id(&self) -> &str {
        &self.state.group_id
    }

    /// KDK, then SMK and VK.
    pub fn derive_smk(self) -> AttestationSession<KeysPrimaryDerived> {
        let keys = kdf::derive_primary(self.services.crypto.as_ref(), &self.state.shared_secret);
        let SessionStarted {
            session,
            ga,
            group_id,
            ..
        } = self.state;
        AttestationSession {
            config: self.config,
            services: self.services,
            keypair: self.keypair,
            state: KeysPrimaryDerived {
                session,
                ga,
                group_id,
                keys,
            },
        }
    }
}

impl AttestationSession<KeysPrimaryDerived> {
    /// Build and send msg2, receive msg3.
    pub async fn send_msg2(self) -> Result<AttestationSession<Msg2Sent>> {
        let session = &self.state.session;
        let msg2 = self.build_msg2().await;
        let msg2 = or_abort(&self.services, session, msg2).await?;

        let exchange = self.services.enclave.exchange_msg2(session, &msg2).await;
        let msg3 = or_abort(&self.services, session, exchange).await?;
        tracing::info!(
            quote_len = msg3.quote.len(),
            sigrl_size = msg2.sigrl_size,
            "msg2 exchanged"
        );

        let KeysPrimaryDerived {
            session, ga, keys, ..
        } = self.state;
        Ok(AttestationSession {
            config: self.config,
            services: self.services,
            keypair: self.keypair,
            state: Msg2Sent {
                session,
                ga,
                keys,
                msg3,
            },
        })
    }

    async fn build_msg2(&self) -> Result<Msg2> {
        let crypto = self.services.crypto.as_ref();
        let gb = self.keypair.public;
        let ga = self.state.ga;

        let mut signed = Vec::with_capacity(4 * COORD_LEN);
        signed.extend_from_slice(&gb.to_bytes());
        signed.extend_from_slice(&ga.to_bytes());
        let (mut r, mut s) = crypto.ecdsa_sign(&service_provider_key()?, &signed)?;
        r.reverse();
        s.reverse();

        let mut blob = Vec::with_capacity(2 * COORD_LEN + 16 + 4 + 2 * COORD_LEN);
        blob.extend_from_slice(&gb.to_bytes());
        blob.extend_from_slice(&self.config.spid);
        blob.extend_from_slice(&QUOTE_TYPE.to_le_bytes());
        blob.extend_from_slice(&KDF_ID.to_le_bytes());
        blob.extend_from_slice(&r);
        blob.extend_from_slice(&s);
        let cmac_a = crypto.cmac(&self.state.keys.smk, &blob);

        let sigrl = self
            .services
            .attestation
            .sigrl(&self.state.group_id)
            .await?;
        let sigrl_size = sigrl.as_deref().map_or(0, decoded_base64_len);

        Ok(Msg2 {
            sgx_client_ec_pubkey: gb.into(),
            spid: self.config.spid,
            quote_type: QUOTE_TYPE,
            kdf: KDF_ID,
            sig_sp: EcPoint { x: r, y: s }.into(),
            cmac_a,
            sigrl_size,
            sigrl,
        })
    }
}

impl AttestationSession<Msg2Sent> {
    /// Verify msg3: same Ga as msg1, CMAC under SMK, quote binds the exchange.
    pub async fn check_msg3(self) -> Result<AttestationSession<Msg3Verified>> {
        let checked = self.verify_msg3();
        let quote = or_abort(&self.services, &self.state.session, checked).await?;
        tracing::info!("msg3 verified");

        let Msg2Sent { session, keys, .. } = self.state;
        Ok(AttestationSession {
            config: self.config,
            services: self.services,
            keypair: self.keypair,
            state: Msg3Verified {
                session,
                keys,
                quote,
            },
        })
    }

    fn verify_msg3(&self) -> Result<Quote> {
        let crypto = self.services.crypto.as_ref();
        let msg3 = &self.state.msg3;
        let ga = self.state.ga;

        let received: EcPoint = msg3.sgx_server_ec_pubkey.into();
        if received != ga {
            return Err(ProtocolError::PeerKeyMismatch.into());
        }

        let mut blob =
            Vec::with_capacity(2 * COORD_LEN + msg3.security_prop.len() + msg3.quote.len());
        blob.extend_from_slice(&ga.to_bytes());
        blob.extend_from_slice(&msg3.security_prop);
        blob.extend_from_slice(&msg3.quote);
        let expected = crypto.cmac(&self.state.keys.smk, &blob);
        if !bool::from(expected.ct_eq(&msg3.cmac_m)) {
            return Err(IntegrityError::Msg3Mac.into());
        }

        let quote = Quote::parse(msg3.quote.clone())?;
        quote.verify_binding(crypto, &ga, &self.keypair.public, &self.state.keys.vk)?;
        Ok(quote)
    }
}

impl AttestationSession<Msg3Verified> {
    pub fn quote(&self) -> &Quote {
        &self.state.quote
    }

    /// Have the attestation service verify the quote and validate its report.
    pub async fn remote_attest(self) -> Result<AttestationSession<RemoteAttested>> {
        let attested = self.attest().await;
        let identity = or_abort(&self.services, &self.state.session, attested).await?;

        tracing::info!(
            mr_enclave = %identity.mr_enclave_hex(),
            product_id = identity.product_id,
            svn = identity.svn,
            "remote attestation succeeded"
        );

        let Msg3Verified { session, keys, .. } = self.state;
        let PrimaryKeys { kdk, .. } = keys;
        Ok(AttestationSession {
            config: self.config,
            services: self.services,
            keypair: self.keypair,
            state: RemoteAttested {
                session,
                kdk,
                identity,
            },
        })
    }

    async fn attest(&self) -> Result<EnclaveIdentity> {
        let quote = &self.state.quote;
        let nonce = nonce::generate(self.services.crypto.as_ref());
        let request = ReportRequest {
            isv_enclave_quote: quote.as_bytes().to_vec(),
            nonce: nonce.clone(),
        };

        let report = self.services.attestation.report(&request).await?;
        self.services.validator.validate(&report, quote, &nonce)?;

        let identity = quote.identity();
        if let Some(expected) = self.config.expected_mr_enclave {
            if identity.mr_enclave != expected {
                return Err(IntegrityError::UnexpectedEnclave {
                    expected: hex::encode(expected),
                    actual: identity.mr_enclave_hex(),
                }
                .into());
            }
        }
        Ok(identity)
    }
}

impl AttestationSession<RemoteAttested> {
    pub fn enclave_identity(&self) -> &EnclaveIdentity {
        &self.state.identity
    }

    /// MK and SK.
    pub fn derive_session_keys(self) -> AttestationSession<SessionKeysDerived> {
        let keys = kdf::derive_session(self.services.crypto.as_ref(), &self.state.kdk);
        let RemoteAttested {
            session, identity, ..
        } = self.state;
        AttestationSession {
            config: self.config,
            services: self.services,
            keypair: self.keypair,
            state: SessionKeysDerived {
                session,
                identity,
                keys,
            },
        }
    }
}

impl AttestationSession<SessionKeysDerived> {
    pub fn enclave_identity(&self) -> &EnclaveIdentity {
        &self.state.identity
    }

    /// msg4: the configured acknowledgement, CMAC'd under SK with a zero IV.
    pub async fn final_handshake(self) -> Result<AttestationSession<Confirmed>> {
        let msg4 = SecureEnvelope::signed(
            self.services.crypto.as_ref(),
            &self.state.keys.sk,
            self.config.ack.clone(),
        );
        let confirmed = self.services.enclave.confirm(&self.state.session, &msg4).await;
        or_abort(&self.services, &self.state.session, confirmed).await?;
        tracing::info!("handshake confirmed");

        let SessionKeysDerived {
            session,
            identity,
            keys,
        } = self.state;
        Ok(AttestationSession {
            config: self.config,
            services: self.services,
            keypair: self.keypair,
            state: Confirmed {
                session,
                identity,
                keys,
            },
        })
    }
}

impl AttestationSession<Confirmed> {
    pub fn enclave_identity(&self) -> &EnclaveIdentity {
        &self.state.identity
    }

    pub fn into_secure_session(self) -> SecureSession {
        let Confirmed {
            session,
            identity,
            keys,
        } = self.state;
        SecureSession::new(self.config, self.services, session, identity, keys)
    }
}

// -- Failure handling --

/// Best-effort `DELETE /attestation`; the triggering error is returned.
async fn abort(services: &Services, session: &SessionId, err: Error) -> Error {
    tracing::warn!(?session, error = %err, "handshake failed, aborting server session");
    if let Err(close_err) = services.enclave.abort_attestation(session).await {
        tracing::warn!(?session, error = %close_err, "failed to abort server session");
    }
    err
}

async fn or_abort<T, E: Into<Error>>(
    services: &Services,
    session: &SessionId,
    result: std::result::Result<T, E>,
) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) => Err(abort(services, session, e.into()).await),
    }
}

// -- Wire helpers --

/// Little-endian unsigned integer of any width, saturating at `u64::MAX`.
fn le_uint(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0u64, |acc, b| {
        acc.checked_mul(256)
            .and_then(|v| v.checked_add(u64::from(*b)))
            .unwrap_or(u64::MAX)
    })
}

/// Byte length of a padded base64 text.
fn decoded_base64_len(text: &str) -> u32 {
    let padding = text.bytes().rev().take(2).filter(|b| *b == b'=').count();
    let len = (text.len() / 4 * 3).saturating_sub(padding);
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, RustCryptoProvider};

    #[test]
    fn extended_group_id_is_little_endian() {
        assert_eq!(le_uint(&[]), 0);
        assert_eq!(le_uint(&[0, 0, 0, 0]), 0);
        assert_eq!(le_uint(&[1, 0, 0, 0]), 1);
        assert_eq!(le_uint(&[0, 1]), 256);
        assert_eq!(le_uint(&[1; 12]), u64::MAX);
        assert_eq!(le_uint(&[5, 0, 0, 0, 0, 0, 0, 0, 0, 0]), 5);
    }

    #[test]
    fn sigrl_size_accounts_for_padding() {
        assert_eq!(decoded_base64_len("AAEC"), 3);
        assert_eq!(decoded_base64_len("AAE="), 2);
        assert_eq!(decoded_base64_len("AA=="), 1);
        assert_eq!(decoded_base64_len(""), 0);
    }

    #[test]
    fn service_provider_key_signs() {
        let crypto = RustCryptoProvider::new();
        let key = service_provider_key().unwrap();
        assert_eq!(key.as_be_bytes()[0], 0x29);
        assert_eq!(key.as_be_bytes()[31], 0xc6);
        crypto.ecdsa_sign(&key, b"gb || ga").unwrap();
    }
}
