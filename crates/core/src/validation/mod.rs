mod rules;

use crate::models::{InvoiceRecord, SequenceIdentity};

/// Pre-flight checks on an invoice record before rendering.
pub fn validate_record(
    record: &InvoiceRecord,
    sequence: &SequenceIdentity,
) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    rules::issuer_checks(record, &mut errs);
    rules::buyer_checks(record, &mut errs);
    rules::line_checks(record, &mut errs);
    rules::payment_checks(record, &mut errs);
    rules::sequence_checks(sequence, &mut errs);
    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

/// Structural checks on a rendered document.
pub fn validate_document(xml: &str) -> Result<(), Vec<String>> {
    rules::document_checks(xml)
}
