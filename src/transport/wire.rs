//! JSON messages exchanged with the enclave service and the attestation
//! service. Binary fields are base64 strings.

use serde::{Deserialize, Serialize};

use crate::crypto::{EcPoint, MacTag, COORD_LEN};

// -- Base64 field helpers --

/// `#[serde(with = "b64")]` for `Vec<u8>` fields.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = "b64_array")]` for fixed-size byte arrays.
pub mod b64_array {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        super::b64::serialize(bytes, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let bytes = super::b64::deserialize(deserializer)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::invalid_length(len, &"a fixed-size base64 field"))
    }
}

// -- Handshake messages --

/// A P-256 point (or raw ECDSA signature pair) with little-endian coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEcPoint {
    #[serde(with = "b64_array")]
    pub x_coord: [u8; COORD_LEN],
    #[serde(with = "b64_array")]
    pub y_coord: [u8; COORD_LEN],
}

impl From<EcPoint> for WireEcPoint {
    fn from(p: EcPoint) -> Self {
        Self {
            x_coord: p.x,
            y_coord: p.y,
        }
    }
}

impl From<WireEcPoint> for EcPoint {
    fn from(p: WireEcPoint) -> Self {
        Self {
            x: p.x_coord,
            y: p.y_coord,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg0 {
    /// Little-endian unsigned integer of arbitrary width.
    #[serde(with = "b64")]
    pub extended_epid_group_id: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg1 {
    pub sgx_server_ec_pubkey: WireEcPoint,
    /// Little-endian EPID group id.
    #[serde(with = "b64")]
    pub sgx_epid_group_id: Vec<u8>,
}

/// Body of `GET /start_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub msg0: Msg0,
    pub msg1: Msg1,
}

/// Body of `POST /attestation/1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg2 {
    pub sgx_client_ec_pubkey: WireEcPoint,
    #[serde(with = "b64_array")]
    pub spid: [u8; 16],
    pub quote_type: u16,
    pub kdf: u16,
    /// Service-provider signature; `x_coord` carries `r`, `y_coord` carries `s`.
    pub sig_sp: WireEcPoint,
    #[serde(with = "b64_array")]
    pub cmac_a: MacTag,
    pub sigrl_size: u32,
    pub sigrl: Option<String>,
}

/// Response to `POST /attestation/1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg3 {
    pub sgx_server_ec_pubkey: WireEcPoint,
    #[serde(with = "b64")]
    pub quote: Vec<u8>,
    #[serde(with = "b64")]
    pub security_prop: Vec<u8>,
    #[serde(with = "b64_array")]
    pub cmac_m: MacTag,
}

/// Body of the attestation service's report request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    #[serde(rename = "isvEnclaveQuote", with = "b64")]
    pub isv_enclave_quote: Vec<u8>,
    pub nonce: String,
}

/// Error body returned by the enclave service on any non-success status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
