use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use config::AppConfig;
use ec_einv_core::access_key::{self, AccessKey};
use ec_einv_core::document::{CanonicalXmlDocument, InvoiceDocumentBuilder};
use ec_einv_core::models::{DocumentType, EmissionType, InvoiceRecord, SequenceIdentity};
use ec_einv_core::{parsing, validation};
use queue::{InvoiceLifecycle, Outcome, PipelineRecord, SigningMaterial};
use signer::{CertificateStore, SignedDocument, XadesSigner};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub fn sequence(
    cfg: &AppConfig,
    establishment: Option<String>,
    emission_point: Option<String>,
    sequential: u32,
) -> Result<SequenceIdentity> {
    let establishment = establishment.unwrap_or_else(|| cfg.issuer.establishment.clone());
    let emission_point = emission_point.unwrap_or_else(|| cfg.issuer.emission_point.clone());
    SequenceIdentity::new(
        &establishment,
        &emission_point,
        sequential,
        cfg.environment,
        EmissionType::Normal,
    )
    .map_err(|e| anyhow!(e))
}

pub fn parse_key(key: &str) -> Result<AccessKey> {
    AccessKey::parse(key.trim()).with_context(|| format!("Invalid access key {key:?}"))
}

pub fn access_key(
    seq: &SequenceIdentity,
    tax_id: &str,
    date: NaiveDate,
    document_type: &str,
    numeric_code: Option<u32>,
) -> Result<AccessKey> {
    let document_type = DocumentType::from_code(document_type)
        .ok_or_else(|| anyhow!("Unknown document type code {document_type:?}"))?;
    let numeric_code = numeric_code.unwrap_or_else(access_key::random_numeric_code);
    Ok(access_key::encode(seq, tax_id, date, document_type, numeric_code)?)
}

pub fn check_key(key: &str) -> Result<()> {
    let key = parse_key(key)?;
    println!("access key:     {key}");
    if let Some(date) = key.emission_date() {
        println!("emission date:  {date}");
    }
    if let Some(kind) = key.document_type() {
        println!("document type:  {} ({kind:?})", kind.code());
    }
    println!("issuer:         {}", key.issuer_tax_id());
    if let Some(environment) = key.environment() {
        println!("environment:    {environment}");
    }
    println!(
        "number:         {}-{}-{:09}",
        key.establishment(),
        key.emission_point(),
        key.sequential()
    );
    println!("numeric code:   {}", key.numeric_code());
    println!("check digit:    {}", key.check_digit());
    Ok(())
}

fn read_record(path: &Path) -> Result<InvoiceRecord> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid invoice record in {}", path.display()))
}

pub fn build(path: &Path, seq: &SequenceIdentity, numeric_code: Option<u32>) -> Result<String> {
    let record = read_record(path)?;
    let key = access_key(
        seq,
        &record.issuer.tax_id,
        record.emission_date,
        DocumentType::Invoice.code(),
        numeric_code,
    )?;
    let document = InvoiceDocumentBuilder::new().build(&record, &key, seq)?;
    tracing::info!(access_key = %key, hash = %document.sha256_hex(), "Invoice document built");
    Ok(document.into_string())
}

pub fn validate(path: &Path) -> Result<()> {
    let xml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match validation::validate_document(&xml) {
        Ok(()) => {
            let summary = parsing::parse_invoice(&xml)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(errors) => {
            for e in &errors {
                eprintln!("- {e}");
            }
            Err(anyhow!("{} validation error(s) in {}", errors.len(), path.display()))
        }
    }
}

fn certificate_path(cfg: &AppConfig, certificate: Option<PathBuf>) -> Result<PathBuf> {
    certificate
        .or_else(|| cfg.signing.certificate_path.clone())
        .ok_or_else(|| anyhow!("No certificate given and none configured"))
}

pub fn signing_material(cfg: &AppConfig, certificate: Option<PathBuf>) -> Result<SigningMaterial> {
    let path = certificate_path(cfg, certificate)?;
    let passphrase = config::p12_passphrase()?;
    Ok(SigningMaterial::from_file(path, passphrase)?)
}

pub fn sign(cfg: &AppConfig, input: &Path, certificate: Option<PathBuf>) -> Result<String> {
    let xml = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let path = certificate_path(cfg, certificate)?;
    let passphrase = Zeroizing::new(config::p12_passphrase()?);

    let credential = CertificateStore::new().extract_file(&path, &passphrase)?;
    let signed = XadesSigner::new().sign(&CanonicalXmlDocument::from_xml(xml), &credential)?;
    drop(credential);
    Ok(signed.into_string())
}

pub fn verify(input: &Path) -> Result<()> {
    let xml = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let info = XadesSigner::new().verify(&SignedDocument::from_xml(xml))?;
    println!("signature:      {}", info.signature_id);
    println!("signer:         {}", info.certificate_subject);
    if let Some(time) = info.signing_time {
        println!("signed at:      {time}");
    }
    println!("document digest {}", info.document_digest);
    println!("valid");
    Ok(())
}

/// Where an issued invoice takes its fiscal number from.
pub struct Numbering {
    pub establishment: Option<String>,
    pub emission_point: Option<String>,
    pub sequential: Option<u32>,
}

pub async fn issue(
    cfg: &AppConfig,
    lifecycle: &InvoiceLifecycle,
    path: &Path,
    invoice_id: &str,
    numbering: Numbering,
    material: &SigningMaterial,
) -> Result<()> {
    let record = read_record(path)?;
    let seq = match lifecycle.status_for_invoice(invoice_id).await? {
        // a retried invoice keeps the number it was first given
        Some(existing) => existing
            .access_key
            .sequence()
            .ok_or_else(|| anyhow!("stored access key {} is malformed", existing.access_key))?,
        None => match numbering.sequential {
            Some(sequential) => sequence(
                cfg,
                numbering.establishment,
                numbering.emission_point,
                sequential,
            )?,
            None => {
                let establishment = numbering
                    .establishment
                    .unwrap_or_else(|| cfg.issuer.establishment.clone());
                let emission_point = numbering
                    .emission_point
                    .unwrap_or_else(|| cfg.issuer.emission_point.clone());
                lifecycle.reserve_sequence(
                    &record.issuer.tax_id,
                    &establishment,
                    &emission_point,
                    cfg.environment,
                )?
            }
        },
    };
    let outcome = lifecycle.issue(invoice_id, &record, &seq, material).await?;
    print_outcome(&outcome)
}

pub fn emit(content: &str, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            println!("{content}");
            Ok(())
        }
    }
}

pub fn print_record(record: &PipelineRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

pub fn print_outcome(outcome: &Outcome) -> Result<()> {
    match outcome {
        Outcome::Settled(record) => {
            println!("{} {}", record.access_key, record.state);
        }
        Outcome::Pending { record, elapsed } => {
            println!(
                "{} still pending after {:.1}s; run `ec-einv authorize {}` later",
                record.access_key,
                elapsed.as_secs_f64(),
                record.access_key
            );
        }
    }
    Ok(())
}

pub fn print_summaries(records: &[PipelineRecord]) {
    for r in records {
        println!(
            "{}  {:<12} {:<26} {}",
            r.access_key,
            r.invoice_id,
            r.state.name(),
            r.updated_at.to_rfc3339()
        );
    }
}
