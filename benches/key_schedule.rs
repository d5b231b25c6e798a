use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use subtol_client::crypto::envelope::SecureEnvelope;
use subtol_client::crypto::kdf;
use subtol_client::crypto::{CryptoProvider, RustCryptoProvider};
use subtol_client::session::{ClientConfig, Services};
use subtol_client::transport::mock::{
    MockAttestationOptions, MockAttestationService, MockEnclave, MockEnclaveOptions,
};
use subtol_client::AttestationSession;

fn bench_key_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_schedule");
    let crypto = RustCryptoProvider::new();
    let secret = [0x42u8; 32];

    group.bench_function("primary_and_session_keys", |b| {
        b.iter(|| {
            let primary = kdf::derive_primary(&crypto, black_box(&secret));
            black_box(kdf::derive_session(&crypto, &primary.kdk));
        });
    });

    let sk = kdf::derive_session(&crypto, &kdf::derive_kdk(&crypto, &secret)).sk;
    let pattern = [1u8; 32];
    group.bench_function("seal_query", |b| {
        b.iter(|| black_box(SecureEnvelope::seal(&crypto, &sk, black_box(&pattern), &[]).unwrap()));
    });

    let page = SecureEnvelope::seal(&crypto, &sk, &[7u8; 4 * 256], &0i64.to_le_bytes()).unwrap();
    group.bench_function("open_page", |b| {
        b.iter(|| black_box(page.open_timed(&crypto, &sk).unwrap()));
    });

    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("handshake");
    group.sample_size(20);

    // The mock PKI is generated once; each iteration runs every handshake
    // message against the in-process enclave.
    let crypto: Arc<dyn CryptoProvider> = Arc::new(RustCryptoProvider::new());
    let enclave = Arc::new(MockEnclave::new(crypto.clone(), MockEnclaveOptions::default()));
    let ias = Arc::new(MockAttestationService::new(MockAttestationOptions::default()).unwrap());
    let services = Services {
        crypto,
        enclave,
        attestation: ias.clone(),
        validator: Arc::new(ias.validator().unwrap()),
    };
    let config = Arc::new(
        ClientConfig::builder()
            .service_url("http://enclave.invalid")
            .spid("FAA97D6CB2501FD5753E55F399AEF8A3")
            .subscription_key("bench")
            .build()
            .unwrap(),
    );

    group.bench_function("mock_attestation", |b| {
        let rt = Runtime::new().unwrap();
        b.iter(|| {
            rt.block_on(async {
                let mut session = AttestationSession::establish(config.clone(), services.clone())
                    .await
                    .unwrap();
                session.close().await.unwrap();
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_key_schedule, bench_handshake);
criterion_main!(benches);
