//! Per-invoice orchestration: build, sign, submit, poll for authorization.
//!
//! This is the only place that decides between retrying and giving up. Lower
//! layers report what happened; the lifecycle maps it onto [`SubmissionState`]
//! and persists every transition before returning.

use crate::audit::{AuditEvent, AuditLog};
use crate::state::{AuthorizationOutcome, FailureReason, ReceptionOutcome, SubmissionState};
use crate::store::{PipelineRecord, PipelineStore, Registration};
use access_point::{
    AuthorityMessage, AuthorizationResult, FiscalTransport, ReceptionResult, TransportError,
};
use ec_einv_core::access_key::{self, AccessKey, AccessKeyError};
use ec_einv_core::document::{CanonicalXmlDocument, DocumentError, InvoiceDocumentBuilder};
use ec_einv_core::models::{
    DocumentType, EmissionType, Environment, InvoiceRecord, SequenceIdentity,
};
use signer::{CertificateStore, CredentialError, SignError, XadesSigner};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep, Duration, Instant};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, counting attempts from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub window: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            window: Duration::from_secs(30),
        }
    }
}

/// PKCS#12 container and passphrase, wiped on drop.
pub struct SigningMaterial {
    p12: Zeroizing<Vec<u8>>,
    passphrase: Zeroizing<String>,
}

impl SigningMaterial {
    pub fn new(p12: Vec<u8>, passphrase: String) -> Self {
        Self {
            p12: Zeroizing::new(p12),
            passphrase: Zeroizing::new(passphrase),
        }
    }

    pub fn from_file(path: impl AsRef<Path>, passphrase: String) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let p12 = std::fs::read(path).map_err(|source| CredentialError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(p12, passphrase))
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    AccessKey(#[from] AccessKeyError),
    #[error("credential unusable: {0}")]
    Credential(#[from] CredentialError),
    #[error("signing failed: {0}")]
    Signing(#[from] SignError),
    #[error("pipeline {access_key}: transport failed after {attempts} attempt(s): {source}")]
    TransportExhausted {
        access_key: AccessKey,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Transport(TransportError),
    #[error("invoice {invoice_id} is already bound to access key {existing}")]
    DuplicateInvoice { invoice_id: String, existing: AccessKey },
    #[error("fiscal number {number} is already used by access key {existing}")]
    DuplicateNumber { number: String, existing: AccessKey },
    #[error("invalid document numbering: {0}")]
    Sequence(String),
    #[error("no pipeline for access key {0}")]
    NotFound(AccessKey),
    #[error("pipeline {access_key} is in terminal state {state}")]
    Terminal { access_key: AccessKey, state: String },
    #[error("pipeline {access_key} is {state}, expected {expected}")]
    InvalidState {
        access_key: AccessKey,
        state: String,
        expected: &'static str,
    },
    #[error("pipeline {0} needs signing material to continue")]
    MissingSigningMaterial(AccessKey),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Result of a step that may end before the authority has decided.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The pipeline reached a terminal state.
    Settled(PipelineRecord),
    /// Authorization still pending after the poll window; query again later.
    Pending {
        record: PipelineRecord,
        elapsed: Duration,
    },
}

impl Outcome {
    pub fn record(&self) -> &PipelineRecord {
        match self {
            Outcome::Settled(record) | Outcome::Pending { record, .. } => record,
        }
    }

    pub fn into_record(self) -> PipelineRecord {
        match self {
            Outcome::Settled(record) | Outcome::Pending { record, .. } => record,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending { .. })
    }
}

pub struct InvoiceLifecycle {
    store: PipelineStore,
    transport: Arc<dyn FiscalTransport>,
    builder: InvoiceDocumentBuilder,
    certificates: CertificateStore,
    signer: XadesSigner,
    audit: AuditLog,
    retry: RetryPolicy,
    poll: PollPolicy,
    locks: KeyLocks,
}

type KeyLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Exclusive hold on one access key. The map entry goes away with its last holder.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

impl InvoiceLifecycle {
    pub fn new(store: PipelineStore, transport: Arc<dyn FiscalTransport>) -> Self {
        Self {
            store,
            transport,
            builder: InvoiceDocumentBuilder::new(),
            certificates: CertificateStore::new(),
            signer: XadesSigner::new(),
            audit: AuditLog::default(),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    async fn lock(&self, key: &AccessKey) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.as_str().to_string()).or_default())
        };
        let mut held = KeyGuard {
            locks: &self.locks,
            key: key.as_str().to_string(),
            guard: None,
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn load(&self, key: &AccessKey) -> Result<PipelineRecord, LifecycleError> {
        self.store
            .load(key)?
            .ok_or_else(|| LifecycleError::NotFound(key.clone()))
    }

    fn advance(
        &self,
        record: &mut PipelineRecord,
        next: SubmissionState,
        note: Option<String>,
    ) -> Result<(), LifecycleError> {
        let from = record.state.name();
        record.advance(next, note).map_err(|refused| {
            if record.state.is_terminal() {
                LifecycleError::Terminal {
                    access_key: record.access_key.clone(),
                    state: record.state.to_string(),
                }
            } else {
                LifecycleError::InvalidState {
                    access_key: record.access_key.clone(),
                    state: record.state.to_string(),
                    expected: refused.name(),
                }
            }
        })?;
        tracing::info!(
            access_key = %record.access_key,
            from,
            to = record.state.name(),
            "Pipeline state changed"
        );
        Ok(())
    }

    fn expect_state(
        &self,
        record: &PipelineRecord,
        ok: bool,
        expected: &'static str,
    ) -> Result<(), LifecycleError> {
        if ok {
            return Ok(());
        }
        if record.state.is_terminal() {
            return Err(LifecycleError::Terminal {
                access_key: record.access_key.clone(),
                state: record.state.to_string(),
            });
        }
        Err(LifecycleError::InvalidState {
            access_key: record.access_key.clone(),
            state: record.state.to_string(),
            expected,
        })
    }

    fn event(&self, event_type: &str, record: &PipelineRecord) -> AuditEvent {
        AuditEvent::new(event_type, record.access_key.as_str(), record.state.name())
            .with_invoice(&record.invoice_id)
            .with_hash(&record.document_hash)
    }

    /// Derives the access key, builds the document and registers the pipeline in `Built`.
    ///
    /// Preparing the same invoice again with the same key returns the stored
    /// pipeline; a different key for an already-bound invoice is refused.
    pub async fn prepare(
        &self,
        invoice_id: &str,
        invoice: &InvoiceRecord,
        sequence: &SequenceIdentity,
        numeric_code: Option<u32>,
    ) -> Result<PipelineRecord, LifecycleError> {
        let numeric_code = numeric_code.unwrap_or_else(access_key::random_numeric_code);
        let key = access_key::encode(
            sequence,
            &invoice.issuer.tax_id,
            invoice.emission_date,
            DocumentType::Invoice,
            numeric_code,
        )?;
        let document = self.builder.build(invoice, &key, sequence)?;

        let _guard = self.lock(&key).await;
        let record = PipelineRecord::new(
            key.clone(),
            invoice_id,
            sequence.environment(),
            document.as_str().to_string(),
            document.sha256_hex(),
        );

        match self.store.register(&record)? {
            Registration::Created => {
                tracing::info!(access_key = %key, invoice_id, "Pipeline prepared");
                self.audit.record(self.event("pipeline_prepared", &record));
                Ok(record)
            }
            Registration::Existing => self.load(&key),
            Registration::Conflict(existing) => {
                tracing::warn!(
                    invoice_id,
                    existing = %existing,
                    refused = %key,
                    "Invoice already has an access key"
                );
                Err(LifecycleError::DuplicateInvoice {
                    invoice_id: invoice_id.to_string(),
                    existing,
                })
            }
            Registration::NumberTaken(existing) => {
                tracing::warn!(
                    invoice_id,
                    number = %sequence.document_number(),
                    existing = %existing,
                    "Fiscal number already in use"
                );
                Err(LifecycleError::DuplicateNumber {
                    number: sequence.document_number(),
                    existing,
                })
            }
        }
    }

    /// Reserves the next unused sequential of the issuer's emission point.
    pub fn reserve_sequence(
        &self,
        issuer_tax_id: &str,
        establishment: &str,
        emission_point: &str,
        environment: Environment,
    ) -> Result<SequenceIdentity, LifecycleError> {
        let identity = |sequential| {
            SequenceIdentity::new(
                establishment,
                emission_point,
                sequential,
                environment,
                EmissionType::Normal,
            )
            .map_err(LifecycleError::Sequence)
        };
        // validate the codes before a number is spent on them
        identity(1)?;
        let series = access_key::series(
            DocumentType::Invoice,
            issuer_tax_id,
            environment,
            establishment,
            emission_point,
        );
        let sequence = identity(self.store.next_sequential(&series)?)?;
        tracing::info!(number = %sequence.document_number(), "Sequential reserved");
        Ok(sequence)
    }

    pub async fn sign(
        &self,
        key: &AccessKey,
        material: &SigningMaterial,
    ) -> Result<PipelineRecord, LifecycleError> {
        let _guard = self.lock(key).await;
        let mut record = self.load(key)?;
        self.sign_locked(&mut record, material)?;
        Ok(record)
    }

    fn sign_locked(
        &self,
        record: &mut PipelineRecord,
        material: &SigningMaterial,
    ) -> Result<(), LifecycleError> {
        self.expect_state(record, record.state == SubmissionState::Built, "built")?;

        let credential = match self.certificates.extract(&material.p12, &material.passphrase) {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(
                    access_key = %record.access_key,
                    error = %e,
                    "Credential extraction failed"
                );
                record.last_error = Some(e.to_string());
                self.store.save(record)?;
                self.audit
                    .record(self.event("credential_rejected", record).with_error(&e));
                return Err(e.into());
            }
        };

        let document = CanonicalXmlDocument::from_xml(record.unsigned_xml.clone());
        let signed = self.signer.sign(&document, &credential);
        drop(credential);

        match signed {
            Ok(signed) => {
                record.signed_xml = Some(signed.into_string());
                record.last_error = None;
                self.advance(record, SubmissionState::Signed, None)?;
                self.store.save(record)?;
                self.audit.record(self.event("document_signed", record));
                Ok(())
            }
            Err(e) => {
                record.last_error = Some(e.to_string());
                self.advance(
                    record,
                    SubmissionState::Failed {
                        reason: FailureReason::Signing { error: e.to_string() },
                    },
                    None,
                )?;
                self.store.save(record)?;
                self.audit.record(self.event("signing_failed", record).with_error(&e));
                Err(e.into())
            }
        }
    }

    /// Sends the signed document, retrying transport failures with backoff.
    ///
    /// On exhaustion the pipeline stays `Signed` so a later call can resume.
    pub async fn submit(&self, key: &AccessKey) -> Result<PipelineRecord, LifecycleError> {
        let _guard = self.lock(key).await;
        let mut record = self.load(key)?;
        self.submit_locked(&mut record).await?;
        Ok(record)
    }

    async fn submit_locked(&self, record: &mut PipelineRecord) -> Result<(), LifecycleError> {
        self.expect_state(record, record.state == SubmissionState::Signed, "signed")?;
        let signed_xml = record.signed_xml.clone().ok_or_else(|| {
            anyhow::anyhow!("signed pipeline {} has no signed document", record.access_key)
        })?;

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            record.reception_attempts += 1;
            tracing::info!(access_key = %record.access_key, attempt, "Submitting for reception");

            match self
                .transport
                .submit_for_reception(&signed_xml, record.environment)
                .await
            {
                Ok(result) => break result,
                Err(e) => {
                    record.last_error = Some(e.to_string());
                    self.store.save(record)?;
                    self.audit.record(
                        self.event("reception_failed", record)
                            .with_attempt(attempt)
                            .with_error(&e),
                    );

                    let key = &record.access_key;
                    if !e.is_retryable() {
                        tracing::error!(access_key = %key, attempt, error = %e, "Reception failed");
                        return Err(LifecycleError::Transport(e));
                    }
                    if attempt >= self.retry.max_attempts {
                        tracing::error!(
                            access_key = %key,
                            attempt,
                            error = %e,
                            "Reception retries exhausted"
                        );
                        return Err(LifecycleError::TransportExhausted {
                            access_key: key.clone(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = self.retry.delay_after(attempt);
                    tracing::warn!(
                        access_key = %key,
                        attempt,
                        ?delay,
                        error = %e,
                        "Reception failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        };

        record.last_error = None;
        self.advance(record, SubmissionState::Sent, Some(format!("attempt {attempt}")))?;
        match result {
            ReceptionResult::Accepted { .. } => {
                self.advance(
                    record,
                    SubmissionState::Received { outcome: ReceptionOutcome::Accepted },
                    None,
                )?;
                self.store.save(record)?;
                self.audit
                    .record(self.event("reception_accepted", record).with_attempt(attempt));
            }
            ReceptionResult::Returned { messages, .. } => {
                self.advance(
                    record,
                    SubmissionState::Received { outcome: ReceptionOutcome::Returned },
                    None,
                )?;
                self.fail_returned(record, messages)?;
            }
        }
        Ok(())
    }

    fn fail_returned(
        &self,
        record: &mut PipelineRecord,
        messages: Vec<AuthorityMessage>,
    ) -> Result<(), LifecycleError> {
        let summary = messages
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        tracing::warn!(
            access_key = %record.access_key,
            messages = %summary,
            "Document returned by the authority"
        );
        record.last_error = Some(summary.clone());
        self.advance(
            record,
            SubmissionState::Failed {
                reason: FailureReason::Returned { messages },
            },
            None,
        )?;
        self.store.save(record)?;
        self.audit
            .record(self.event("reception_returned", record).with_error(summary));
        Ok(())
    }

    /// Polls authorization at a fixed cadence within the poll window.
    pub async fn authorize(&self, key: &AccessKey) -> Result<Outcome, LifecycleError> {
        let _guard = self.lock(key).await;
        let mut record = self.load(key)?;
        self.authorize_locked(&mut record).await
    }

    async fn authorize_locked(
        &self,
        record: &mut PipelineRecord,
    ) -> Result<Outcome, LifecycleError> {
        let accepted = SubmissionState::Received { outcome: ReceptionOutcome::Accepted };
        self.expect_state(record, record.state == accepted, "received.accepted")?;

        let started = Instant::now();
        loop {
            record.authorization_queries += 1;
            let queried = self
                .transport
                .query_authorization(&record.access_key, record.environment)
                .await;

            match queried {
                Ok(AuthorizationResult::Authorized {
                    authorization_number,
                    authorization_date,
                    authorized_document,
                    ..
                }) => {
                    record.authorized_document = authorized_document;
                    record.last_error = None;
                    self.advance(
                        record,
                        SubmissionState::Authorized {
                            outcome: AuthorizationOutcome::Authorized {
                                number: authorization_number,
                                date: authorization_date,
                            },
                        },
                        None,
                    )?;
                    self.store.save(record)?;
                    self.audit.record(self.event("invoice_authorized", record));
                    return Ok(Outcome::Settled(record.clone()));
                }
                Ok(AuthorizationResult::NotAuthorized { messages, .. }) => {
                    let summary = messages
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    record.last_error = Some(summary.clone());
                    self.advance(
                        record,
                        SubmissionState::Authorized {
                            outcome: AuthorizationOutcome::NotAuthorized { messages },
                        },
                        None,
                    )?;
                    self.store.save(record)?;
                    self.audit
                        .record(self.event("invoice_not_authorized", record).with_error(summary));
                    return Ok(Outcome::Settled(record.clone()));
                }
                Ok(AuthorizationResult::Pending { .. }) => {
                    tracing::debug!(
                        access_key = %record.access_key,
                        queries = record.authorization_queries,
                        "Authorization pending"
                    );
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        access_key = %record.access_key,
                        error = %e,
                        "Authorization query failed, polling again"
                    );
                    record.last_error = Some(e.to_string());
                }
                Err(e) => {
                    record.last_error = Some(e.to_string());
                    self.store.save(record)?;
                    self.audit
                        .record(self.event("authorization_query_failed", record).with_error(&e));
                    return Err(LifecycleError::Transport(e));
                }
            }

            let elapsed = started.elapsed();
            if elapsed + self.poll.interval > self.poll.window {
                self.store.save(record)?;
                tracing::info!(
                    access_key = %record.access_key,
                    ?elapsed,
                    "Authorization still pending, try again later"
                );
                self.audit.record(self.event("authorization_pending", record));
                return Ok(Outcome::Pending {
                    record: record.clone(),
                    elapsed,
                });
            }
            sleep(self.poll.interval).await;
        }
    }

    /// Prepare, sign, submit and authorize in one call.
    ///
    /// An invoice that already has a pipeline continues it, provided the invoice still
    /// renders to the stored document.
    pub async fn issue(
        &self,
        invoice_id: &str,
        invoice: &InvoiceRecord,
        sequence: &SequenceIdentity,
        material: &SigningMaterial,
    ) -> Result<Outcome, LifecycleError> {
        let key = match self.store.key_for_invoice(invoice_id)? {
            Some(existing) => {
                let stored = self.load(&existing)?;
                let same_document = self
                    .builder
                    .build(invoice, &existing, sequence)
                    .is_ok_and(|document| document.sha256_hex() == stored.document_hash);
                if !same_document {
                    return Err(LifecycleError::DuplicateInvoice {
                        invoice_id: invoice_id.to_string(),
                        existing,
                    });
                }
                tracing::info!(access_key = %existing, invoice_id, "Invoice already prepared");
                existing
            }
            None => self.prepare(invoice_id, invoice, sequence, None).await?.access_key,
        };
        self.resume(&key, Some(material)).await
    }

    /// Continues a pipeline from its stored state until it settles or stays pending.
    pub async fn resume(
        &self,
        key: &AccessKey,
        material: Option<&SigningMaterial>,
    ) -> Result<Outcome, LifecycleError> {
        let _guard = self.lock(key).await;
        let mut record = self.load(key)?;
        tracing::info!(access_key = %key, state = record.state.name(), "Resuming pipeline");

        loop {
            match record.state.clone() {
                SubmissionState::Built => {
                    let material = material
                        .ok_or_else(|| LifecycleError::MissingSigningMaterial(key.clone()))?;
                    self.sign_locked(&mut record, material)?;
                }
                // Sent is never persisted on its own; treat a stray one as not yet received.
                SubmissionState::Signed | SubmissionState::Sent => {
                    if record.state == SubmissionState::Sent {
                        record.state = SubmissionState::Signed;
                    }
                    self.submit_locked(&mut record).await?;
                }
                SubmissionState::Received { outcome: ReceptionOutcome::Accepted } => {
                    return self.authorize_locked(&mut record).await;
                }
                SubmissionState::Received { outcome: ReceptionOutcome::Returned } => {
                    self.fail_returned(&mut record, vec![])?;
                }
                SubmissionState::Authorized { .. } | SubmissionState::Failed { .. } => {
                    return Ok(Outcome::Settled(record));
                }
            }
        }
    }

    /// Abandons a pipeline that has not been sent yet.
    pub async fn cancel(&self, key: &AccessKey) -> Result<PipelineRecord, LifecycleError> {
        let _guard = self.lock(key).await;
        let mut record = self.load(key)?;
        self.expect_state(&record, record.state.is_cancellable(), "built or signed")?;
        self.advance(
            &mut record,
            SubmissionState::Failed { reason: FailureReason::Cancelled },
            None,
        )?;
        self.store.save(&record)?;
        self.audit.record(self.event("pipeline_cancelled", &record));
        Ok(record)
    }

    pub async fn status(&self, key: &AccessKey) -> Result<PipelineRecord, LifecycleError> {
        self.load(key)
    }

    pub async fn status_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Option<PipelineRecord>, LifecycleError> {
        match self.store.key_for_invoice(invoice_id)? {
            Some(key) => Ok(Some(self.load(&key)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<PipelineRecord>, LifecycleError> {
        Ok(self.store.list()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_grow_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn key_locks_are_dropped_with_their_last_holder() {
        let lifecycle = InvoiceLifecycle::new(
            PipelineStore::temporary().unwrap(),
            access_point::mock::MockTransport::shared(),
        );
        let key = AccessKey::parse("1503202401179001167400110010020000001231234567819").unwrap();

        let first = lifecycle.lock(&key).await;
        assert_eq!(lifecycle.tracked_keys(), 1);

        // a waiter keeps the entry alive after the first holder leaves
        let shared = &lifecycle;
        let (second, ()) = tokio::join!(lifecycle.lock(&key), async move {
            tokio::task::yield_now().await;
            drop(first);
            assert_eq!(shared.tracked_keys(), 1);
        });
        assert_eq!(lifecycle.tracked_keys(), 1);
        drop(second);
        assert_eq!(lifecycle.tracked_keys(), 0);

        let _ = lifecycle.status(&key).await;
        drop(lifecycle.lock(&key).await);
        assert_eq!(lifecycle.tracked_keys(), 0);
    }

    #[test]
    fn default_poll_window() {
        let poll = PollPolicy::default();
        assert_eq!(poll.window, Duration::from_secs(30));
        assert!(poll.interval < poll.window);
    }
}
