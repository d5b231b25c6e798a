use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::wire::{ErrorBody, Msg2, Msg3, ReportRequest, StartSessionResponse};
use super::{AttestationService, EnclaveService, PollStatus, ReportResponse, SessionId};
use crate::crypto::envelope::SecureEnvelope;
use crate::error::{ProtocolError, Result, TransportError};

const SESSION_COOKIE: &str = "session-id";
const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const SIGNING_CERT_HEADER: &str = "X-IASReport-Signing-Certificate";
const SIGNATURE_HEADER: &str = "X-IASReport-Signature";

/// [`EnclaveService`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpEnclaveService {
    client: Client,
    base_url: String,
}

impl HttpEnclaveService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_session(&self, request: RequestBuilder, session: &SessionId) -> RequestBuilder {
        request.header(COOKIE, session.cookie())
    }

    async fn send(
        &self,
        endpoint: &'static str,
        request: RequestBuilder,
        expected: StatusCode,
    ) -> Result<Response> {
        tracing::debug!(endpoint, "enclave service request");
        let response = request.send().await?;
        if response.status() != expected {
            return Err(status_error(endpoint, response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl EnclaveService for HttpEnclaveService {
    async fn start_session(&self) -> Result<(SessionId, StartSessionResponse)> {
        let endpoint = "/start_session";
        let response = self
            .send(endpoint, self.client.get(self.url(endpoint)), StatusCode::OK)
            .await?;
        let session = session_cookie(response.headers())?;
        let body = parse_json(endpoint, response).await?;
        Ok((session, body))
    }

    async fn exchange_msg2(&self, session: &SessionId, msg2: &Msg2) -> Result<Msg3> {
        let endpoint = "/attestation/1";
        let request = self.with_session(self.client.post(self.url(endpoint)).json(msg2), session);
        let response = self.send(endpoint, request, StatusCode::OK).await?;
        parse_json(endpoint, response).await
    }

    async fn confirm(&self, session: &SessionId, msg4: &SecureEnvelope) -> Result<()> {
        let endpoint = "/attestation/2";
        let request = self.with_session(self.client.post(self.url(endpoint)).json(msg4), session);
        self.send(endpoint, request, StatusCode::OK).await?;
        Ok(())
    }

    async fn abort_attestation(&self, session: &SessionId) -> Result<()> {
        let endpoint = "/attestation";
        let request = self.with_session(self.client.delete(self.url(endpoint)), session);
        self.send(endpoint, request, StatusCode::OK).await?;
        Ok(())
    }

    async fn poll(&self, session: &SessionId) -> Result<PollStatus> {
        let endpoint = "/poll";
        let request = self.with_session(self.client.get(self.url(endpoint)), session);
        let response = request.send().await?;
        match response.status() {
            StatusCode::OK => Ok(PollStatus::Ready),
            StatusCode::CONFLICT => Ok(PollStatus::Busy),
            StatusCode::NOT_FOUND => Ok(PollStatus::NotFound),
            _ => Err(status_error(endpoint, response).await),
        }
    }

    async fn configure(&self, session: &SessionId, request: &SecureEnvelope) -> Result<()> {
        let endpoint = "/configure";
        let request =
            self.with_session(self.client.post(self.url(endpoint)).json(request), session);
        self.send(endpoint, request, StatusCode::OK).await?;
        Ok(())
    }

    async fn load(&self, session: &SessionId, request: &SecureEnvelope) -> Result<()> {
        let endpoint = "/load";
        let request =
            self.with_session(self.client.post(self.url(endpoint)).json(request), session);
        self.send(endpoint, request, StatusCode::ACCEPTED).await?;
        Ok(())
    }

    async fn substring(
        &self,
        session: &SessionId,
        request: &SecureEnvelope,
    ) -> Result<SecureEnvelope> {
        let endpoint = "/substring";
        // The service reads the query from the body of a GET.
        let request = self.with_session(self.client.get(self.url(endpoint)).json(request), session);
        let response = self.send(endpoint, request, StatusCode::OK).await?;
        parse_json(endpoint, response).await
    }

    async fn suffix(&self, session: &SessionId) -> Result<SecureEnvelope> {
        let endpoint = "/suffix";
        let request = self.with_session(self.client.get(self.url(endpoint)), session);
        let response = self.send(endpoint, request, StatusCode::OK).await?;
        parse_json(endpoint, response).await
    }

    async fn close(&self, session: &SessionId) -> Result<()> {
        let endpoint = "/close";
        let request = self.with_session(self.client.delete(self.url(endpoint)), session);
        self.send(endpoint, request, StatusCode::OK).await?;
        Ok(())
    }
}

/// [`AttestationService`] client for the Intel attestation service (v3 API).
#[derive(Clone)]
pub struct IasClient {
    client: Client,
    base_url: String,
    subscription_key: String,
}

impl IasClient {
    pub fn new(
        base_url: impl Into<String>,
        subscription_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            subscription_key: subscription_key.into(),
        })
    }
}

impl std::fmt::Debug for IasClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IasClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AttestationService for IasClient {
    async fn sigrl(&self, group_id: &str) -> Result<Option<String>> {
        let url = format!("{}/attestation/v3/sigrl/{group_id}", self.base_url);
        let response = self
            .client
            .get(url)
            .header(SUBSCRIPTION_KEY_HEADER, &self.subscription_key)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(ProtocolError::AttestationService(describe_ias_status(
                response.status(),
            ))
            .into());
        }
        let text = response.text().await?;
        Ok(if text.is_empty() { None } else { Some(text) })
    }

    async fn report(&self, request: &ReportRequest) -> Result<ReportResponse> {
        let url = format!("{}/attestation/v3/report", self.base_url);
        let response = self
            .client
            .post(url)
            .header(SUBSCRIPTION_KEY_HEADER, &self.subscription_key)
            .json(request)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(ProtocolError::AttestationService(describe_ias_status(
                response.status(),
            ))
            .into());
        }

        let signing_certificate = header_string(response.headers(), SIGNING_CERT_HEADER)?;
        let signature = header_string(response.headers(), SIGNATURE_HEADER)?;
        let body = response.bytes().await?.to_vec();
        Ok(ReportResponse {
            body,
            signing_certificate,
            signature,
        })
    }
}

// -- Response helpers --

async fn parse_json<T: DeserializeOwned>(endpoint: &'static str, response: Response) -> Result<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        TransportError::MalformedBody {
            endpoint,
            reason: e.to_string(),
        }
        .into()
    })
}

async fn status_error(endpoint: &'static str, response: Response) -> crate::Error {
    let status = response.status().as_u16();
    let message = match response.bytes().await {
        Ok(bytes) => serde_json::from_slice::<ErrorBody>(&bytes)
            .map(|b| b.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => e.to_string(),
    };
    TransportError::Status {
        endpoint,
        status,
        message,
    }
    .into()
}

fn session_cookie(headers: &HeaderMap) -> Result<SessionId> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(parse_session_cookie)
        .ok_or_else(|| TransportError::MissingSessionCookie.into())
}

fn parse_session_cookie(set_cookie: &str) -> Option<SessionId> {
    let pair = set_cookie.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    (name == SESSION_COOKIE && !value.is_empty()).then(|| SessionId::new(value))
}

fn header_string(headers: &HeaderMap, name: &'static str) -> Result<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| TransportError::MissingHeader(name).into())
}

fn describe_ias_status(status: StatusCode) -> String {
    let reason = match status.as_u16() {
        401 => "unauthorized (check the subscription key)",
        404 => "EPID group not found",
        500 => "internal server error",
        503 => "service overloaded",
        _ => "unexpected status",
    };
    format!("status {}: {reason}", status.as_u16())
}
