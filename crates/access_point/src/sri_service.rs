use super::{
    sri_types::{
        authorization_envelope, parse_authorization_response, parse_reception_response,
        reception_envelope,
    },
    AuthorizationResult, FiscalTransport, ReceptionResult, TransportError,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ec_einv_core::access_key::AccessKey;
use ec_einv_core::models::Environment;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const TEST_HOST: &str = "https://celcer.sri.gob.ec";
const PRODUCTION_HOST: &str = "https://cel.sri.gob.ec";
const RECEPTION_PATH: &str = "/comprobantes-electronicos-ws/RecepcionComprobantesOffline";
const AUTHORIZATION_PATH: &str = "/comprobantes-electronicos-ws/AutorizacionComprobantesOffline";
const MAX_ERROR_BODY: usize = 2048;

/// Reception and authorization URLs of one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SriEndpoints {
    pub reception: String,
    pub authorization: String,
}

impl SriEndpoints {
    pub fn for_environment(environment: Environment) -> Self {
        let host = match environment {
            Environment::Test => TEST_HOST,
            Environment::Production => PRODUCTION_HOST,
        };
        Self::with_base(host)
    }

    /// Endpoints under another host, e.g. a local stub.
    pub fn with_base(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            reception: format!("{base}{RECEPTION_PATH}"),
            authorization: format!("{base}{AUTHORIZATION_PATH}"),
        }
    }
}

/// SOAP client for the SRI "offline" reception and authorization services.
///
/// Every call carries an explicit timeout. Non-2xx answers and network failures are
/// reported as [`TransportError`]; protocol outcomes come back as typed results.
#[derive(Clone)]
pub struct SriServiceClient {
    test: SriEndpoints,
    production: SriEndpoints,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl SriServiceClient {
    pub fn new(timeout: Duration) -> Result<Arc<Self>> {
        Self::with_endpoints(
            SriEndpoints::for_environment(Environment::Test),
            SriEndpoints::for_environment(Environment::Production),
            timeout,
        )
    }

    pub fn with_endpoints(
        test: SriEndpoints,
        production: SriEndpoints,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Arc::new(Self {
            test,
            production,
            timeout,
            http_client,
        }))
    }

    pub fn endpoints(&self, environment: Environment) -> &SriEndpoints {
        match environment {
            Environment::Test => &self.test,
            Environment::Production => &self.production,
        }
    }

    async fn post(&self, url: &str, body: String) -> Result<String, TransportError> {
        let response = self
            .http_client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", "")
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.classify(e))?;

        if status.is_server_error() {
            return Err(TransportError::Server {
                status: status.as_u16(),
                body: truncate(&text),
            });
        }
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: truncate(&text),
            });
        }
        Ok(text)
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(format!("no answer within {:?}", self.timeout))
        } else if err.is_decode() || err.is_body() {
            TransportError::MalformedResponse(err.to_string())
        } else {
            TransportError::Connection(err.to_string())
        }
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[async_trait]
impl FiscalTransport for SriServiceClient {
    async fn submit_for_reception(
        &self,
        signed_xml: &str,
        environment: Environment,
    ) -> Result<ReceptionResult, TransportError> {
        let url = &self.endpoints(environment).reception;
        let raw = self.post(url, reception_envelope(signed_xml)).await?;
        let result = parse_reception_response(&raw)?;

        tracing::info!(
            environment = %environment,
            accepted = result.is_accepted(),
            messages = result.messages().len(),
            "Reception response received"
        );
        Ok(result)
    }

    async fn query_authorization(
        &self,
        access_key: &AccessKey,
        environment: Environment,
    ) -> Result<AuthorizationResult, TransportError> {
        let url = &self.endpoints(environment).authorization;
        let raw = self
            .post(url, authorization_envelope(access_key.as_str()))
            .await?;
        let result = parse_authorization_response(&raw)?;

        tracing::debug!(
            access_key = %access_key,
            environment = %environment,
            pending = result.is_pending(),
            "Authorization queried"
        );
        Ok(result)
    }
}
