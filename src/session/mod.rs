pub mod client;
pub mod cursor;
pub mod handshake;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::attestation::ReportValidator;
use crate::crypto::{CryptoProvider, RustCryptoProvider};
use crate::error::{ConfigError, Error, ResourceError};
use crate::transport::http::{HttpEnclaveService, IasClient};
use crate::transport::{AttestationService, EnclaveService};

/// Development endpoint of the Intel attestation service.
pub const DEFAULT_IAS_URL: &str = "https://api.trustedservices.intel.com/sgx/dev";

/// Acknowledgement sent in msg4 once the client accepts the enclave.
pub const DEFAULT_ACK: &[u8] = b"trusted subtol enclave";

/// Per-request timeout (default: 30s).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client configuration.
#[non_exhaustive]
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the enclave-hosted service.
    pub service_url: String,

    /// Base URL of the attestation service.
    pub ias_url: String,

    /// Service-provider id registered with the attestation service.
    pub spid: [u8; 16],

    /// Attestation-service subscription key.
    pub subscription_key: String,

    /// Bytes confirmed in msg4.
    pub ack: Vec<u8>,

    pub request_timeout: Duration,

    /// Directory searched for `<dataset>.map` files.
    pub map_dir: PathBuf,

    /// If set, attestation fails unless MRENCLAVE matches.
    pub expected_mr_enclave: Option<[u8; 32]>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("service_url", &self.service_url)
            .field("ias_url", &self.ias_url)
            .field("spid", &self.spid_hex())
            .field("request_timeout", &self.request_timeout)
            .field("map_dir", &self.map_dir)
            .field("expected_mr_enclave", &self.expected_mr_enclave.map(hex::encode))
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Create a builder for constructing a `ClientConfig`.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// SPID as upper-case hex, the form used for key file names.
    pub fn spid_hex(&self) -> String {
        hex::encode_upper(self.spid)
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    service_url: Option<String>,
    ias_url: String,
    spid: Option<String>,
    subscription_key: Option<String>,
    ack: Vec<u8>,
    request_timeout: Duration,
    map_dir: PathBuf,
    expected_mr_enclave: Option<String>,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            service_url: None,
            ias_url: DEFAULT_IAS_URL.to_string(),
            spid: None,
            subscription_key: None,
            ack: DEFAULT_ACK.to_vec(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            map_dir: PathBuf::from("."),
            expected_mr_enclave: None,
        }
    }
}

impl ClientConfigBuilder {
    pub fn service_url(mut self, url: impl Into<String>) -> Self {
        self.service_url = Some(url.into());
        self
    }

    pub fn ias_url(mut self, url: impl Into<String>) -> Self {
        self.ias_url = url.into();
        self
    }

    /// SPID as 32 hex characters.
    pub fn spid(mut self, spid_hex: impl Into<String>) -> Self {
        self.spid = Some(spid_hex.into());
        self
    }

    pub fn subscription_key(mut self, key: impl Into<String>) -> Self {
        self.subscription_key = Some(key.into());
        self
    }

    pub fn ack(mut self, ack: impl Into<Vec<u8>>) -> Self {
        self.ack = ack.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn map_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.map_dir = dir.into();
        self
    }

    /// Expected MRENCLAVE as 64 hex characters.
    pub fn expected_mr_enclave(mut self, mr_enclave_hex: impl Into<String>) -> Self {
        self.expected_mr_enclave = Some(mr_enclave_hex.into());
        self
    }

    /// Build the `ClientConfig`, validating that all values are sensible.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let service_url = self
            .service_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConfigError::InvalidClient("service_url is required".into()))?;
        if self.ias_url.is_empty() {
            return Err(ConfigError::InvalidClient("ias_url must not be empty".into()));
        }

        let spid_hex = self
            .spid
            .ok_or_else(|| ConfigError::InvalidClient("spid is required".into()))?;
        let spid = decode_fixed::<16>("spid", &spid_hex)?;

        let subscription_key = self
            .subscription_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::InvalidClient("subscription_key is required".into()))?;

        if self.ack.is_empty() {
            return Err(ConfigError::InvalidClient("ack must not be empty".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidClient(
                "request_timeout must be > 0".into(),
            ));
        }

        let expected_mr_enclave = self
            .expected_mr_enclave
            .map(|mr| decode_fixed::<32>("expected_mr_enclave", &mr))
            .transpose()?;

        Ok(ClientConfig {
            service_url,
            ias_url: self.ias_url,
            spid,
            subscription_key,
            ack: self.ack,
            request_timeout: self.request_timeout,
            map_dir: self.map_dir,
            expected_mr_enclave,
        })
    }
}

fn decode_fixed<const N: usize>(field: &str, value: &str) -> Result<[u8; N], ConfigError> {
    let bytes = hex::decode(value.trim()).map_err(|e| {
        ConfigError::InvalidClient(format!("{field} must be hex: {e}"))
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ConfigError::InvalidClient(format!(
            "{field} must be {} hex characters, got {}",
            2 * N,
            2 * b.len()
        ))
    })
}

/// `<dir>/<SPID>.key`, where the subscription key is kept by convention.
pub fn subscription_key_path(dir: &Path, spid_hex: &str) -> PathBuf {
    dir.join(format!("{spid_hex}.key"))
}

/// First line of a subscription-key file.
pub async fn read_subscription_key(path: &Path) -> Result<String, ResourceError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ResourceError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(text.lines().next().unwrap_or_default().trim().to_string())
}

/// The collaborators a session talks through.
#[derive(Clone)]
pub struct Services {
    pub crypto: Arc<dyn CryptoProvider>,
    pub enclave: Arc<dyn EnclaveService>,
    pub attestation: Arc<dyn AttestationService>,
    pub validator: Arc<ReportValidator>,
}

impl Services {
    /// HTTP services, RustCrypto primitives and the bundled attestation root.
    pub fn http(config: &ClientConfig) -> Result<Self, Error> {
        Ok(Self {
            crypto: Arc::new(RustCryptoProvider::new()),
            enclave: Arc::new(HttpEnclaveService::new(
                config.service_url.clone(),
                config.request_timeout,
            )?),
            attestation: Arc::new(IasClient::new(
                config.ias_url.clone(),
                config.subscription_key.clone(),
                config.request_timeout,
            )?),
            validator: Arc::new(ReportValidator::new()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPID: &str = "FAA97D6CB2501FD5753E55F399AEF8A3";

    fn base() -> ClientConfigBuilder {
        ClientConfig::builder()
            .service_url("http://127.0.0.1:49000")
            .spid(SPID)
            .subscription_key("0123456789abcdef")
    }

    #[test]
    fn builder_defaults() {
        let config = base().build().unwrap();
        assert_eq!(config.ias_url, DEFAULT_IAS_URL);
        assert_eq!(config.ack, DEFAULT_ACK);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.spid_hex(), SPID);
        assert!(config.expected_mr_enclave.is_none());
    }

    #[test]
    fn spid_must_be_sixteen_bytes() {
        let err = base().spid("FAA97D").build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidClient(m) if m.contains("32 hex")));

        let err = base().spid("not hex at all, not hex at all!!").build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidClient(_)));
    }

    #[test]
    fn required_fields() {
        assert!(ClientConfig::builder().spid(SPID).build().is_err());
        assert!(base().subscription_key("").build().is_err());
        assert!(base().request_timeout(Duration::ZERO).build().is_err());
        assert!(base().ack(Vec::new()).build().is_err());
    }

    #[test]
    fn expected_mr_enclave_parsed() {
        let config = base().expected_mr_enclave("ab".repeat(32)).build().unwrap();
        assert_eq!(config.expected_mr_enclave, Some([0xAB; 32]));
        assert!(base().expected_mr_enclave("abcd").build().is_err());
    }

    #[test]
    fn debug_hides_subscription_key() {
        let config = base().build().unwrap();
        assert!(!format!("{config:?}").contains("0123456789abcdef"));
    }

    #[tokio::test]
    async fn subscription_key_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = subscription_key_path(dir.path(), SPID);
        std::fs::write(&path, "secretkey\nignored\n").unwrap();
        assert_eq!(read_subscription_key(&path).await.unwrap(), "secretkey");
        assert!(path.ends_with(format!("{SPID}.key")));
    }
}
