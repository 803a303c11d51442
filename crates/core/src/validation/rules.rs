use crate::models::{
    money_epsilon, IdentificationType, InvoiceRecord, SequenceIdentity, MAX_SEQUENTIAL,
};
use crate::parsing::parse_invoice;
use crate::access_key;
use rust_decimal::Decimal;

pub const FINAL_CONSUMER_ID: &str = "9999999999999";

fn digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

pub fn issuer_checks(record: &InvoiceRecord, errs: &mut Vec<String>) {
    let issuer = &record.issuer;
    if !digits(&issuer.tax_id, 13) {
        errs.push(format!("issuer tax id must be 13 digits: {:?}", issuer.tax_id));
    } else if !issuer.tax_id.ends_with("001") {
        errs.push(format!("issuer tax id must end in 001: {}", issuer.tax_id));
    }
    if issuer.legal_name.trim().is_empty() {
        errs.push("issuer legal name is mandatory".to_string());
    }
    if issuer.head_office_address.trim().is_empty() {
        errs.push("issuer head office address is mandatory".to_string());
    }
    if record.currency.trim().is_empty() {
        errs.push("currency is mandatory".to_string());
    }
}

pub fn buyer_checks(record: &InvoiceRecord, errs: &mut Vec<String>) {
    let buyer = &record.buyer;
    if buyer.name.trim().is_empty() {
        errs.push("buyer name is mandatory".to_string());
    }
    let id = buyer.identification.as_str();
    match buyer.identification_type {
        IdentificationType::Ruc if !digits(id, 13) => {
            errs.push(format!("buyer RUC must be 13 digits: {id:?}"));
        }
        IdentificationType::Cedula if !digits(id, 10) => {
            errs.push(format!("buyer cedula must be 10 digits: {id:?}"));
        }
        IdentificationType::FinalConsumer if id != FINAL_CONSUMER_ID => {
            errs.push(format!("final consumer identification must be {FINAL_CONSUMER_ID}"));
        }
        IdentificationType::Passport | IdentificationType::Foreign if id.trim().is_empty() => {
            errs.push("buyer identification is mandatory".to_string());
        }
        _ => {}
    }
    if let Some(email) = buyer.email.as_deref().filter(|e| !e.trim().is_empty()) {
        let well_formed = email
            .split_once('@')
            .map(|(user, domain)| {
                !user.is_empty() && domain.contains('.') && !domain.starts_with('.')
            })
            .unwrap_or(false);
        if !well_formed {
            errs.push(format!("buyer email is malformed: {email}"));
        }
    }
}

pub fn line_checks(record: &InvoiceRecord, errs: &mut Vec<String>) {
    for (i, line) in record.line_items.iter().enumerate() {
        if line.description.trim().is_empty() {
            errs.push(format!("line {}: description is mandatory", i + 1));
        }
        if line.quantity.is_zero() {
            errs.push(format!("line {}: quantity must be positive", i + 1));
        }
    }
}

pub fn payment_checks(record: &InvoiceRecord, errs: &mut Vec<String>) {
    if record.payments.is_empty() {
        return;
    }
    for (i, p) in record.payments.iter().enumerate() {
        if !digits(&p.method, 2) {
            errs.push(format!("payment {}: method must be a 2-digit code: {:?}", i + 1, p.method));
        }
    }
    let paid: Decimal = record.payments.iter().map(|p| p.amount).sum();
    if (paid - record.totals.grand_total).abs() > money_epsilon() {
        errs.push(format!(
            "payments add up to {paid}, grand total is {}",
            record.totals.grand_total
        ));
    }
}

pub fn sequence_checks(sequence: &SequenceIdentity, errs: &mut Vec<String>) {
    if !digits(sequence.establishment(), 3) {
        errs.push(format!("establishment must be 3 digits: {:?}", sequence.establishment()));
    }
    if !digits(sequence.emission_point(), 3) {
        errs.push(format!("emission point must be 3 digits: {:?}", sequence.emission_point()));
    }
    if sequence.sequential() == 0 || sequence.sequential() > MAX_SEQUENTIAL {
        errs.push(format!("sequential out of range: {}", sequence.sequential()));
    }
}

pub fn document_checks(xml: &str) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();

    let invoice = match parse_invoice(xml) {
        Ok(inv) => inv,
        Err(e) => {
            errs.push(format!("Failed to parse document: {}", e));
            return Err(errs);
        }
    };

    if invoice.root != "factura" {
        errs.push(format!("root element must be factura, found {}", invoice.root));
        return Err(errs);
    }
    if invoice.root_id.as_deref() != Some("comprobante") {
        errs.push("root element must carry id=\"comprobante\"".to_string());
    }
    if let Err(e) = access_key::validate(&invoice.access_key) {
        errs.push(format!("claveAcceso: {e}"));
    }
    if !digits(&invoice.issuer_tax_id, 13) {
        errs.push("ruc must be 13 digits".to_string());
    }
    if !digits(&invoice.sequential, 9) {
        errs.push("secuencial must be 9 digits".to_string());
    }
    if invoice.emission_date.is_empty() {
        errs.push("fechaEmision is mandatory".to_string());
    }
    if invoice.buyer_id.is_empty() {
        errs.push("identificacionComprador is mandatory".to_string());
    }
    if invoice.grand_total.is_none() {
        errs.push("importeTotal is mandatory".to_string());
    }
    if invoice.line_count == 0 {
        errs.push("detalles must contain at least one detalle".to_string());
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}
