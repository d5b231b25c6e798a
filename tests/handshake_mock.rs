#![cfg(feature = "mock")]

use std::sync::Arc;

use subtol_client::attestation::nonce::{NONCE_ALPHABET, REPORT_NONCE_LEN};
use subtol_client::crypto::{CryptoProvider, RustCryptoProvider};
use subtol_client::error::{
    Error, IntegrityError, ProtocolError, ReplayError, SessionError, TransportError,
};
use subtol_client::session::handshake::AttestationSession;
use subtol_client::session::{ClientConfig, ClientConfigBuilder, Services};
use subtol_client::transport::mock::{
    sigrl_len, MockAttestationOptions, MockAttestationService, MockEnclave, MockEnclaveOptions,
    Tamper,
};
use subtol_client::PollStatus;

const SPID: &str = "FAA97D6CB2501FD5753E55F399AEF8A3";

struct Harness {
    enclave: Arc<MockEnclave>,
    ias: Arc<MockAttestationService>,
    services: Services,
}

fn harness(enclave: MockEnclaveOptions, ias: MockAttestationOptions) -> Harness {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(RustCryptoProvider::new());
    let enclave = Arc::new(MockEnclave::new(crypto.clone(), enclave));
    let ias = Arc::new(MockAttestationService::new(ias).unwrap());
    let services = Services {
        crypto,
        enclave: enclave.clone(),
        attestation: ias.clone(),
        validator: Arc::new(ias.validator().unwrap()),
    };
    Harness {
        enclave,
        ias,
        services,
    }
}

fn builder() -> ClientConfigBuilder {
    ClientConfig::builder()
        .service_url("http://enclave.invalid")
        .spid(SPID)
        .subscription_key("test-subscription-key")
}

fn config() -> Arc<ClientConfig> {
    Arc::new(builder().build().unwrap())
}

fn tampered(tamper: Tamper) -> Harness {
    harness(
        MockEnclaveOptions {
            tamper: Some(tamper),
            ..Default::default()
        },
        MockAttestationOptions::default(),
    )
}

/// Run the handshake, expect failure, and check the server context was dropped.
async fn expect_abort(h: &Harness) -> Error {
    let err = AttestationSession::establish(config(), h.services.clone())
        .await
        .unwrap_err();
    assert_eq!(h.enclave.calls().last(), Some(&"DELETE /attestation"));
    assert_eq!(h.enclave.open_sessions(), 0);
    err
}

#[tokio::test]
async fn full_handshake_yields_secure_session() {
    let h = harness(MockEnclaveOptions::default(), MockAttestationOptions::default());

    let mut session = AttestationSession::establish(config(), h.services.clone())
        .await
        .unwrap();

    let identity = session.enclave_identity().unwrap();
    assert_eq!(identity.mr_enclave, [0x5A; 32]);
    assert_eq!(identity.product_id, 1);
    assert_eq!(identity.svn, 3);

    assert_eq!(
        h.enclave.calls(),
        vec!["/start_session", "/attestation/1", "/attestation/2"]
    );
    assert_eq!(session.poll().await.unwrap(), PollStatus::Ready);
}

#[tokio::test]
async fn typed_steps_expose_intermediate_state() {
    let h = harness(MockEnclaveOptions::default(), MockAttestationOptions::default());

    let init = AttestationSession::new(config(), h.services.clone());
    assert_eq!(init.state_name(), "init");
    assert!(init.session_id().is_none());

    let started = init.start_session().await.unwrap();
    assert_eq!(started.state_name(), "session_started");
    // msg1 carries 0b 0a 00 00 little-endian.
    assert_eq!(started.group_id(), "00000a0b");

    let sent = started.derive_smk().send_msg2().await.unwrap();
    assert_eq!(h.ias.sigrl_groups(), vec!["00000a0b".to_string()]);

    let verified = sent.check_msg3().await.unwrap();
    let quote = verified.quote().as_bytes().to_vec();

    let attested = verified.remote_attest().await.unwrap();
    let requests = h.ias.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].isv_enclave_quote, quote);
    assert_eq!(requests[0].nonce.len(), REPORT_NONCE_LEN);
    assert!(requests[0].nonce.bytes().all(|b| NONCE_ALPHABET.contains(&b)));

    let confirmed = attested
        .derive_session_keys()
        .final_handshake()
        .await
        .unwrap();
    assert_eq!(confirmed.state_name(), "confirmed");
    let session = confirmed.into_secure_session();
    assert!(!session.is_closed());
}

#[tokio::test]
async fn nonzero_extended_group_is_rejected() {
    let h = harness(
        MockEnclaveOptions {
            extended_group_id: vec![1, 0, 0, 0],
            ..Default::default()
        },
        MockAttestationOptions::default(),
    );

    let err = expect_abort(&h).await;
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::UnsupportedExtendedGroup(1))
    ));
    assert!(h.ias.requests().is_empty());
}

#[tokio::test]
async fn flipped_quote_bit_fails_msg3_mac() {
    let h = tampered(Tamper::QuoteBit);
    let err = expect_abort(&h).await;
    assert!(matches!(err, Error::Integrity(IntegrityError::Msg3Mac)));
}

#[tokio::test]
async fn corrupted_msg3_mac_rejected() {
    let h = tampered(Tamper::Msg3Mac);
    let err = expect_abort(&h).await;
    assert!(matches!(err, Error::Integrity(IntegrityError::Msg3Mac)));
}

#[tokio::test]
async fn unbound_report_data_rejected() {
    let h = tampered(Tamper::ReportData);
    let err = expect_abort(&h).await;
    assert!(matches!(
        err,
        Error::Integrity(IntegrityError::ReportDataBinding)
    ));
    assert!(h.ias.requests().is_empty());
}

#[tokio::test]
async fn substituted_server_key_rejected() {
    let h = tampered(Tamper::ServerKey);
    let err = expect_abort(&h).await;
    assert!(matches!(err, Error::Protocol(ProtocolError::PeerKeyMismatch)));
}

#[tokio::test]
async fn report_nonce_mismatch_is_replay() {
    let h = harness(
        MockEnclaveOptions::default(),
        MockAttestationOptions {
            wrong_nonce: true,
            ..Default::default()
        },
    );
    let err = expect_abort(&h).await;
    assert!(matches!(
        err,
        Error::Replay(ReplayError::NonceMismatch { .. })
    ));
}

#[tokio::test]
async fn group_out_of_date_is_tolerated() {
    let h = harness(
        MockEnclaveOptions::default(),
        MockAttestationOptions {
            status: "GROUP_OUT_OF_DATE".into(),
            ..Default::default()
        },
    );
    AttestationSession::establish(config(), h.services.clone())
        .await
        .unwrap();
}

#[tokio::test]
async fn revoked_quote_status_is_fatal() {
    let h = harness(
        MockEnclaveOptions::default(),
        MockAttestationOptions {
            status: "KEY_REVOKED".into(),
            ..Default::default()
        },
    );
    let err = expect_abort(&h).await;
    assert!(matches!(err, Error::Protocol(ProtocolError::QuoteStatus(ref s)) if s == "KEY_REVOKED"));
}

#[tokio::test]
async fn duplicate_signing_certificates_rejected() {
    let h = harness(
        MockEnclaveOptions::default(),
        MockAttestationOptions {
            duplicate_leaf: true,
            ..Default::default()
        },
    );
    let err = expect_abort(&h).await;
    assert!(matches!(
        err,
        Error::Integrity(IntegrityError::SigningCertificate(_))
    ));
}

#[tokio::test]
async fn bad_report_signature_rejected() {
    let h = harness(
        MockEnclaveOptions::default(),
        MockAttestationOptions {
            bad_signature: true,
            ..Default::default()
        },
    );
    let err = expect_abort(&h).await;
    assert!(matches!(
        err,
        Error::Integrity(IntegrityError::ReportSignature(_))
    ));
}

#[tokio::test]
async fn revocation_list_is_forwarded() {
    let h = harness(
        MockEnclaveOptions::default(),
        MockAttestationOptions {
            sigrl: Some("AAECAwQ=".into()),
            ..Default::default()
        },
    );
    AttestationSession::establish(config(), h.services.clone())
        .await
        .unwrap();
    assert_eq!(h.ias.sigrl_groups().len(), 1);

    let msg2s = h.enclave.msg2s();
    assert_eq!(msg2s.len(), 1);
    assert_eq!(msg2s[0].sigrl.as_deref(), Some("AAECAwQ="));
    assert_eq!(msg2s[0].sigrl_size as usize, sigrl_len("AAECAwQ="));
    assert_eq!(msg2s[0].sigrl_size, 5);
}

#[tokio::test]
async fn empty_revocation_list_is_omitted() {
    let h = harness(MockEnclaveOptions::default(), MockAttestationOptions::default());
    AttestationSession::establish(config(), h.services.clone())
        .await
        .unwrap();

    let msg2s = h.enclave.msg2s();
    assert_eq!(msg2s[0].sigrl, None);
    assert_eq!(msg2s[0].sigrl_size, 0);
}

#[tokio::test]
async fn pinned_measurement_is_enforced() {
    let h = harness(MockEnclaveOptions::default(), MockAttestationOptions::default());

    let pinned = Arc::new(builder().expected_mr_enclave("5a".repeat(32)).build().unwrap());
    AttestationSession::establish(pinned, h.services.clone())
        .await
        .unwrap();

    let other = Arc::new(builder().expected_mr_enclave("00".repeat(32)).build().unwrap());
    let err = AttestationSession::establish(other, h.services.clone())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Integrity(IntegrityError::UnexpectedEnclave { ref actual, .. }) if *actual == "5a".repeat(32)
    ));
}

#[tokio::test]
async fn wrong_acknowledgement_is_refused() {
    let h = harness(
        MockEnclaveOptions {
            ack: b"untrusted enclave".to_vec(),
            ..Default::default()
        },
        MockAttestationOptions::default(),
    );
    let err = expect_abort(&h).await;
    assert!(matches!(
        err,
        Error::Transport(TransportError::Status { status: 400, .. })
    ));
}

#[tokio::test]
async fn close_mid_handshake_returns_to_init() {
    let h = harness(MockEnclaveOptions::default(), MockAttestationOptions::default());

    let started = AttestationSession::new(config(), h.services.clone())
        .start_session()
        .await
        .unwrap();
    let old_key = *started.public_key();
    assert_eq!(h.enclave.open_sessions(), 1);

    let init = started.close().await.unwrap();
    assert_eq!(init.state_name(), "init");
    assert_ne!(*init.public_key(), old_key);
    assert_eq!(h.enclave.open_sessions(), 0);

    // The fresh key pair attests normally.
    init.run().await.unwrap();
}

#[tokio::test]
async fn closed_session_fails_fast() {
    let h = harness(MockEnclaveOptions::default(), MockAttestationOptions::default());
    let mut session = AttestationSession::establish(config(), h.services.clone())
        .await
        .unwrap();

    session.close().await.unwrap();
    assert!(session.is_closed());
    assert_eq!(h.enclave.open_sessions(), 0);

    assert!(matches!(
        session.poll().await,
        Err(Error::Session(SessionError::Closed))
    ));
    assert!(matches!(
        session.query("ana", None).await,
        Err(Error::Session(SessionError::Closed))
    ));
    assert!(matches!(
        session.enclave_identity(),
        Err(Error::Session(SessionError::Closed))
    ));
    assert!(matches!(
        session.close().await,
        Err(Error::Session(SessionError::Closed))
    ));

    // Only a fresh handshake gets back in.
    let mut again = session.restart().run().await.unwrap();
    assert_eq!(again.poll().await.unwrap(), PollStatus::Ready);
}

#[tokio::test]
async fn refused_close_still_wipes_keys() {
    let h = harness(
        MockEnclaveOptions {
            refuse_close: Some(500),
            ..Default::default()
        },
        MockAttestationOptions::default(),
    );
    let mut session = AttestationSession::establish(config(), h.services.clone())
        .await
        .unwrap();

    let err = session.close().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolError::CloseFailed(_))));
    assert!(session.is_closed());
}
