use super::{AuthorizationResult, FiscalTransport, ReceptionResult, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use ec_einv_core::access_key::AccessKey;
use ec_einv_core::models::Environment;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

/// Scripted transport for tests and offline runs.
///
/// Queued results are handed out in order; once a queue is empty every call
/// answers with the happy path (accepted, then authorized under the access key).
#[derive(Default)]
pub struct MockTransport {
    receptions: Mutex<VecDeque<Result<ReceptionResult, TransportError>>>,
    authorizations: Mutex<VecDeque<Result<AuthorizationResult, TransportError>>>,
    latency: Option<Duration>,
    reception_calls: AtomicUsize,
    authorization_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_reception(mut self, result: Result<ReceptionResult, TransportError>) -> Self {
        self.receptions.get_mut().push_back(result);
        self
    }

    pub fn with_authorization(
        mut self,
        result: Result<AuthorizationResult, TransportError>,
    ) -> Self {
        self.authorizations.get_mut().push_back(result);
        self
    }

    /// Simulated network latency per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn reception_calls(&self) -> usize {
        self.reception_calls.load(Ordering::SeqCst)
    }

    pub fn authorization_calls(&self) -> usize {
        self.authorization_calls.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if let Some(latency) = self.latency {
            sleep(latency).await;
        }
    }
}

#[async_trait]
impl FiscalTransport for MockTransport {
    async fn submit_for_reception(
        &self,
        _signed_xml: &str,
        _environment: Environment,
    ) -> Result<ReceptionResult, TransportError> {
        self.reception_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        match self.receptions.lock().await.pop_front() {
            Some(scripted) => scripted,
            None => Ok(ReceptionResult::Accepted {
                messages: vec![],
                raw_response: "<estado>RECIBIDA</estado>".to_string(),
            }),
        }
    }

    async fn query_authorization(
        &self,
        access_key: &AccessKey,
        _environment: Environment,
    ) -> Result<AuthorizationResult, TransportError> {
        self.authorization_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        match self.authorizations.lock().await.pop_front() {
            Some(scripted) => scripted,
            None => Ok(AuthorizationResult::Authorized {
                authorization_number: access_key.as_str().to_string(),
                authorization_date: Some(Utc::now().to_rfc3339()),
                authorized_document: None,
                messages: vec![],
                raw_response: "<estado>AUTORIZADO</estado>".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuthorityMessage;

    fn key() -> AccessKey {
        AccessKey::parse("1503202401179001167400110010020000001231234567819").unwrap()
    }

    #[tokio::test]
    async fn scripted_results_then_defaults() {
        let mock = MockTransport::new()
            .with_reception(Err(TransportError::Timeout("1s".into())))
            .with_reception(Ok(ReceptionResult::Returned {
                messages: vec![AuthorityMessage::new("35", "ARCHIVO NO CUMPLE ESTRUCTURA XML")],
                raw_response: String::new(),
            }));

        assert!(matches!(
            mock.submit_for_reception("<x/>", Environment::Test).await,
            Err(TransportError::Timeout(_))
        ));
        assert!(!mock
            .submit_for_reception("<x/>", Environment::Test)
            .await
            .unwrap()
            .is_accepted());
        assert!(mock
            .submit_for_reception("<x/>", Environment::Test)
            .await
            .unwrap()
            .is_accepted());
        assert_eq!(mock.reception_calls(), 3);
    }

    #[tokio::test]
    async fn default_authorization_uses_access_key() {
        let mock = MockTransport::new();
        let key = key();
        match mock.query_authorization(&key, Environment::Test).await.unwrap() {
            AuthorizationResult::Authorized { authorization_number, .. } => {
                assert_eq!(authorization_number, key.as_str())
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mock.authorization_calls(), 1);
    }
}
