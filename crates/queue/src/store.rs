use crate::state::SubmissionState;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use ec_einv_core::access_key::AccessKey;
use ec_einv_core::models::Environment;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, Transactional};
use sled::{Db, IVec};
use std::convert::Infallible;
use std::path::Path;

const PIPELINES_TREE: &str = "pipelines";
const INVOICES_TREE: &str = "invoices";
const NUMBERS_TREE: &str = "numbers";
const SEQUENCES_TREE: &str = "sequences";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: SubmissionState,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

/// Everything known about one access key's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub access_key: AccessKey,
    pub invoice_id: String,
    pub environment: Environment,
    pub state: SubmissionState,
    pub document_hash: String,
    pub unsigned_xml: String,
    pub signed_xml: Option<String>,
    pub authorized_document: Option<String>,
    pub reception_attempts: u32,
    pub authorization_queries: u32,
    pub last_error: Option<String>,
    pub history: Vec<StateChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRecord {
    pub fn new(
        access_key: AccessKey,
        invoice_id: &str,
        environment: Environment,
        unsigned_xml: String,
        document_hash: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            access_key,
            invoice_id: invoice_id.to_string(),
            environment,
            state: SubmissionState::Built,
            document_hash,
            unsigned_xml,
            signed_xml: None,
            authorized_document: None,
            reception_attempts: 0,
            authorization_queries: 0,
            last_error: None,
            history: vec![StateChange {
                state: SubmissionState::Built,
                at: now,
                note: None,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next` if the state machine allows it. Returns the refused state otherwise.
    pub fn advance(
        &mut self,
        next: SubmissionState,
        note: Option<String>,
    ) -> Result<(), SubmissionState> {
        if !self.state.can_transition_to(&next) {
            return Err(next);
        }
        let now = Utc::now();
        self.history.push(StateChange {
            state: next.clone(),
            at: now,
            note,
        });
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Outcome of registering a new pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// The invoice already has a pipeline under this key.
    Existing,
    /// The invoice already has a pipeline under another key.
    Conflict(AccessKey),
    /// Another pipeline already carries this fiscal number.
    NumberTaken(AccessKey),
}

enum Binding {
    Free,
    Invoice(IVec),
    Number(IVec),
}

type BindingResult = ConflictableTransactionResult<Binding, Infallible>;

/// sled-backed persistence for pipeline records.
#[derive(Clone)]
pub struct PipelineStore {
    db: Db,
}

impl PipelineStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("Failed to open pipeline store at {}", path.display()))?;
        Ok(Self { db })
    }

    /// In-memory store removed on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn tree(&self, name: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(name)?)
    }

    /// Binds the invoice and its fiscal number to the record's key and stores the record,
    /// all in one transaction. Nothing is written when either is already bound.
    pub fn register(&self, record: &PipelineRecord) -> Result<Registration> {
        let invoices = self.tree(INVOICES_TREE)?;
        let numbers = self.tree(NUMBERS_TREE)?;
        let sequences = self.tree(SEQUENCES_TREE)?;
        let pipelines = self.tree(PIPELINES_TREE)?;

        let key = record.access_key.as_str();
        let invoice_id = record.invoice_id.as_bytes();
        let number = record.access_key.fiscal_number().as_bytes();
        let series = record.access_key.series().as_bytes();
        let sequential = record.access_key.sequential();
        let value = serde_json::to_vec(record)?;

        let binding = (&invoices, &numbers, &sequences, &pipelines).transaction(
            |(invoices, numbers, sequences, pipelines)| -> BindingResult {
                if let Some(existing) = invoices.get(invoice_id)? {
                    return Ok(Binding::Invoice(existing));
                }
                if let Some(existing) = numbers.get(number)? {
                    return Ok(Binding::Number(existing));
                }
                invoices.insert(invoice_id, key.as_bytes())?;
                numbers.insert(number, key.as_bytes())?;
                // keep the series counter past every number in use
                let last = sequences.get(series)?.map_or(0, |v| decode_counter(&v));
                if sequential > last {
                    sequences.insert(series, &sequential.to_be_bytes()[..])?;
                }
                pipelines.insert(key.as_bytes(), value.as_slice())?;
                Ok(Binding::Free)
            },
        )?;

        match binding {
            Binding::Free => {
                self.db.flush()?;
                Ok(Registration::Created)
            }
            Binding::Invoice(existing) => {
                let existing = parse_key(&existing)?;
                if existing.as_str() == key {
                    Ok(Registration::Existing)
                } else {
                    Ok(Registration::Conflict(existing))
                }
            }
            Binding::Number(existing) => Ok(Registration::NumberTaken(parse_key(&existing)?)),
        }
    }

    /// Reserves the next sequential of a numbering series. Reserved numbers are never handed
    /// out again, whether or not a pipeline is registered with them.
    pub fn next_sequential(&self, series: &str) -> Result<u32> {
        let sequences = self.tree(SEQUENCES_TREE)?;
        let next = sequences
            .update_and_fetch(series.as_bytes(), |old| {
                let last = old.map_or(0, decode_counter);
                Some(last.saturating_add(1).to_be_bytes().to_vec())
            })?
            .ok_or_else(|| anyhow!("sequence counter for {series} vanished"))?;
        sequences.flush()?;
        Ok(decode_counter(&next))
    }

    pub fn save(&self, record: &PipelineRecord) -> Result<()> {
        let pipelines = self.tree(PIPELINES_TREE)?;
        pipelines.insert(record.access_key.as_str().as_bytes(), serde_json::to_vec(record)?)?;
        pipelines.flush()?;
        Ok(())
    }

    pub fn load(&self, key: &AccessKey) -> Result<Option<PipelineRecord>> {
        let pipelines = self.tree(PIPELINES_TREE)?;
        match pipelines.get(key.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn key_for_invoice(&self, invoice_id: &str) -> Result<Option<AccessKey>> {
        let invoices = self.tree(INVOICES_TREE)?;
        match invoices.get(invoice_id.as_bytes())? {
            Some(bytes) => Ok(Some(parse_key(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Key already carrying a fiscal number, see [`AccessKey::fiscal_number`].
    pub fn key_for_number(&self, fiscal_number: &str) -> Result<Option<AccessKey>> {
        let numbers = self.tree(NUMBERS_TREE)?;
        match numbers.get(fiscal_number.as_bytes())? {
            Some(bytes) => Ok(Some(parse_key(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All records, newest first.
    pub fn list(&self) -> Result<Vec<PipelineRecord>> {
        let pipelines = self.tree(PIPELINES_TREE)?;
        let mut out = Vec::new();
        for item in pipelines.iter() {
            let (_k, v) = item?;
            let rec: PipelineRecord = serde_json::from_slice(&v)?;
            out.push(rec);
        }
        out.sort_by_key(|r| r.created_at);
        out.reverse();
        Ok(out)
    }
}

fn parse_key(bytes: &[u8]) -> Result<AccessKey> {
    Ok(AccessKey::parse(std::str::from_utf8(bytes)?)?)
}

fn decode_counter(bytes: &[u8]) -> u32 {
    <[u8; 4]>::try_from(bytes).map_or(0, u32::from_be_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FailureReason, ReceptionOutcome};
    use chrono::NaiveDate;
    use ec_einv_core::access_key;
    use ec_einv_core::models::{DocumentType, EmissionType, SequenceIdentity};

    const KEY: &str = "1503202401179001167400110010020000001231234567819";

    fn record(invoice_id: &str) -> PipelineRecord {
        record_with_key(invoice_id, AccessKey::parse(KEY).unwrap())
    }

    fn record_with_key(invoice_id: &str, key: AccessKey) -> PipelineRecord {
        PipelineRecord::new(key, invoice_id, Environment::Test, "<factura/>".into(), "abc".into())
    }

    fn key(sequential: u32, numeric_code: u32) -> AccessKey {
        let seq =
            SequenceIdentity::new("001", "002", sequential, Environment::Test, EmissionType::Normal)
                .unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        access_key::encode(&seq, "1790011674001", date, DocumentType::Invoice, numeric_code)
            .unwrap()
    }

    #[test]
    fn register_binds_invoice_once() {
        let store = PipelineStore::temporary().unwrap();
        let rec = record("INV-1");
        assert_eq!(store.register(&rec).unwrap(), Registration::Created);
        assert_eq!(store.register(&rec).unwrap(), Registration::Existing);
        assert_eq!(store.key_for_invoice("INV-1").unwrap().unwrap().as_str(), KEY);

        let loaded = store.load(&rec.access_key).unwrap().unwrap();
        assert_eq!(loaded.state, SubmissionState::Built);
        assert_eq!(loaded.history.len(), 1);
    }

    #[test]
    fn fiscal_number_is_bound_to_one_key() {
        let store = PipelineStore::temporary().unwrap();
        let first = record_with_key("INV-1", key(7, 11111111));
        assert_eq!(store.register(&first).unwrap(), Registration::Created);

        // same number under another numeric code, and the very same key, for other invoices
        for other in [key(7, 22222222), key(7, 11111111)] {
            assert_eq!(
                store.register(&record_with_key("INV-2", other.clone())).unwrap(),
                Registration::NumberTaken(first.access_key.clone())
            );
        }

        // refused registrations write nothing
        assert_eq!(store.key_for_invoice("INV-2").unwrap(), None);
        assert_eq!(store.load(&key(7, 22222222)).unwrap().map(|r| r.invoice_id), None);
        assert_eq!(store.load(&first.access_key).unwrap().unwrap().invoice_id, "INV-1");
        assert_eq!(
            store.key_for_number(first.access_key.fiscal_number()).unwrap(),
            Some(first.access_key.clone())
        );

        let conflict = record_with_key("INV-1", key(8, 11111111));
        assert_eq!(
            store.register(&conflict).unwrap(),
            Registration::Conflict(first.access_key.clone())
        );
        assert_eq!(store.key_for_number(conflict.access_key.fiscal_number()).unwrap(), None);
    }

    #[test]
    fn series_counter_skips_numbers_in_use() {
        let store = PipelineStore::temporary().unwrap();
        let used = key(123, 12345678);
        let series = used.series().to_string();
        assert_eq!(store.next_sequential(&series).unwrap(), 1);

        store.register(&record_with_key("INV-1", used)).unwrap();
        assert_eq!(store.next_sequential(&series).unwrap(), 124);
        assert_eq!(store.next_sequential(&series).unwrap(), 125);

        // a lower number registered by hand does not move the counter back
        store.register(&record_with_key("INV-2", key(5, 1))).unwrap();
        assert_eq!(store.next_sequential(&series).unwrap(), 126);
        assert_eq!(store.next_sequential("0117900116740011001003").unwrap(), 1);
    }

    #[test]
    fn advance_records_history_and_refuses_backwards() {
        let mut rec = record("INV-2");
        rec.advance(SubmissionState::Signed, None).unwrap();
        rec.advance(SubmissionState::Sent, Some("attempt 1".into())).unwrap();
        assert!(rec.advance(SubmissionState::Signed, None).is_err());
        rec.advance(
            SubmissionState::Received { outcome: ReceptionOutcome::Returned },
            None,
        )
        .unwrap();
        rec.advance(
            SubmissionState::Failed { reason: FailureReason::Returned { messages: vec![] } },
            None,
        )
        .unwrap();
        assert_eq!(rec.history.len(), 5);
        assert!(rec.state.is_terminal());
        assert!(rec.advance(SubmissionState::Built, None).is_err());
    }

    #[test]
    fn records_survive_a_round_trip_through_the_store() {
        let store = PipelineStore::temporary().unwrap();
        let mut rec = record("INV-3");
        store.register(&rec).unwrap();
        rec.advance(SubmissionState::Signed, None).unwrap();
        rec.signed_xml = Some("<factura><ds:Signature/></factura>".into());
        store.save(&rec).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, SubmissionState::Signed);
        assert_eq!(listed[0].signed_xml, rec.signed_xml);
    }
}
