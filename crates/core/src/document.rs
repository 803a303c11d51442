//! Rendering of an [`InvoiceRecord`] into the authority's `factura` XML.

use crate::access_key::AccessKey;
use crate::models::{
    money_epsilon, round_money, AdditionalField, DocumentType, IdentificationType, InvoiceRecord,
    LineItem, SequenceIdentity, TaxRate, Totals,
};
use crate::parsing::compute_sha256_hex;
use crate::validation;
use quick_xml::events::{BytesDecl, BytesText, Event};
use quick_xml::Writer;
use rust_decimal::Decimal;
use thiserror::Error;

pub const ROOT_ELEMENT: &str = "factura";
pub const ROOT_ID: &str = "comprobante";
pub const DOCUMENT_VERSION: &str = "1.1.0";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DocumentError {
    #[error("invoice has no line items")]
    EmptyLineItems,
    #[error("negative amount in {field}: {value}")]
    NegativeAmount { field: String, value: Decimal },
    #[error("line {line}: declared base {declared}, quantity x price - discount is {computed}")]
    LineBaseMismatch {
        line: usize,
        declared: Decimal,
        computed: Decimal,
    },
    #[error("line {line}: declared tax {declared}, base x rate is {computed}")]
    LineTaxMismatch {
        line: usize,
        declared: Decimal,
        computed: Decimal,
    },
    #[error("unbalanced totals: declared grand total {declared}, computed {computed}")]
    UnbalancedTotals { declared: Decimal, computed: Decimal },
    #[error("access key does not match the document: {0}")]
    AccessKeyMismatch(String),
    #[error("invalid invoice record: {}", .0.join("; "))]
    InvalidRecord(Vec<String>),
    #[error("failed to render document: {0}")]
    Render(String),
}

impl From<quick_xml::Error> for DocumentError {
    fn from(err: quick_xml::Error) -> Self {
        DocumentError::Render(err.to_string())
    }
}

/// Unsigned document ready for the signer. Byte-identical for identical inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalXmlDocument {
    xml: String,
}

impl CanonicalXmlDocument {
    pub fn from_xml(xml: String) -> Self {
        Self { xml }
    }

    pub fn as_str(&self) -> &str {
        &self.xml
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.xml.as_bytes()
    }

    pub fn into_string(self) -> String {
        self.xml
    }

    pub fn sha256_hex(&self) -> String {
        compute_sha256_hex(&self.xml)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceDocumentBuilder;

impl InvoiceDocumentBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        record: &InvoiceRecord,
        access_key: &AccessKey,
        sequence: &SequenceIdentity,
    ) -> Result<CanonicalXmlDocument, DocumentError> {
        validation::validate_record(record, sequence).map_err(DocumentError::InvalidRecord)?;
        if record.line_items.is_empty() {
            return Err(DocumentError::EmptyLineItems);
        }
        check_amounts(record)?;
        check_access_key(record, access_key, sequence)?;

        let summary = Totals::from_lines(&record.line_items, record.totals.tip);
        let declared = record.totals.grand_total;
        if (summary.grand_total - declared).abs() > money_epsilon() {
            return Err(DocumentError::UnbalancedTotals {
                declared,
                computed: summary.grand_total,
            });
        }

        let xml = render(record, access_key, sequence, &summary)?;
        tracing::debug!(
            access_key = %access_key,
            bytes = xml.len(),
            "invoice document built"
        );
        Ok(CanonicalXmlDocument { xml })
    }
}

fn check_amounts(record: &InvoiceRecord) -> Result<(), DocumentError> {
    let negative = |field: String, value: Decimal| {
        if value.is_sign_negative() && !value.is_zero() {
            Err(DocumentError::NegativeAmount { field, value })
        } else {
            Ok(())
        }
    };

    for (i, line) in record.line_items.iter().enumerate() {
        let n = i + 1;
        negative(format!("line {n} quantity"), line.quantity)?;
        negative(format!("line {n} unit price"), line.unit_price)?;
        negative(format!("line {n} discount"), line.discount)?;
        negative(format!("line {n} base"), line.base)?;
        negative(format!("line {n} tax value"), line.tax_value)?;

        let computed = line.quantity * line.unit_price - line.discount;
        negative(format!("line {n} base"), computed)?;
        if (computed - line.base).abs() > money_epsilon() {
            return Err(DocumentError::LineBaseMismatch {
                line: n,
                declared: line.base,
                computed: round_money(computed),
            });
        }

        let tax = line.tax_rate.tax_on(computed);
        if (tax - line.tax_value).abs() > money_epsilon() {
            return Err(DocumentError::LineTaxMismatch {
                line: n,
                declared: line.tax_value,
                computed: round_money(tax),
            });
        }
    }
    negative("tip".to_string(), record.totals.tip)?;
    negative("grand total".to_string(), record.totals.grand_total)?;
    for (i, payment) in record.payments.iter().enumerate() {
        negative(format!("payment {}", i + 1), payment.amount)?;
    }
    Ok(())
}

fn check_access_key(
    record: &InvoiceRecord,
    key: &AccessKey,
    sequence: &SequenceIdentity,
) -> Result<(), DocumentError> {
    let mismatch = |what: &str, in_key: &str, expected: &str| {
        DocumentError::AccessKeyMismatch(format!(
            "{what} is {in_key} in key, {expected} in document"
        ))
    };

    if key.emission_date() != Some(record.emission_date) {
        return Err(mismatch(
            "emission date",
            &key.as_str()[0..8],
            &record.emission_date.format("%d%m%Y").to_string(),
        ));
    }
    if key.document_type() != Some(DocumentType::Invoice) {
        return Err(mismatch("document type", &key.as_str()[8..10], DocumentType::Invoice.code()));
    }
    let issuer = format!("{:0>13}", record.issuer.tax_id);
    if key.issuer_tax_id() != issuer {
        return Err(mismatch("issuer", key.issuer_tax_id(), &issuer));
    }
    if key.environment() != Some(sequence.environment()) {
        return Err(mismatch(
            "environment",
            &key.as_str()[23..24],
            &sequence.environment().code().to_string(),
        ));
    }
    if key.establishment() != sequence.establishment()
        || key.emission_point() != sequence.emission_point()
        || key.sequential() != sequence.sequential()
    {
        return Err(mismatch(
            "document number",
            &format!("{}-{}-{:09}", key.establishment(), key.emission_point(), key.sequential()),
            &sequence.document_number(),
        ));
    }
    Ok(())
}

fn render(
    record: &InvoiceRecord,
    key: &AccessKey,
    sequence: &SequenceIdentity,
    summary: &Totals,
) -> Result<String, DocumentError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    writer
        .create_element(ROOT_ELEMENT)
        .with_attribute(("id", ROOT_ID))
        .with_attribute(("version", DOCUMENT_VERSION))
        .write_inner_content(|w| {
            write_tax_info(w, record, key, sequence)?;
            write_invoice_info(w, record, summary)?;
            write_details(w, &record.line_items)?;
            write_additional_info(w, record)?;
            Ok::<(), quick_xml::Error>(())
        })?;

    String::from_utf8(writer.into_inner()).map_err(|e| DocumentError::Render(e.to_string()))
}

type XmlWriter = Writer<Vec<u8>>;

fn write_tax_info(
    w: &mut XmlWriter,
    record: &InvoiceRecord,
    key: &AccessKey,
    sequence: &SequenceIdentity,
) -> quick_xml::Result<()> {
    let issuer = &record.issuer;
    element(w, "infoTributaria", |w| {
        text(w, "ambiente", &sequence.environment().code().to_string())?;
        text(w, "tipoEmision", &sequence.emission_type().code().to_string())?;
        text(w, "razonSocial", &normalize_text(&issuer.legal_name))?;
        let trade_name = issuer.trade_name.as_deref().unwrap_or(&issuer.legal_name);
        text(w, "nombreComercial", &normalize_text(trade_name))?;
        text(w, "ruc", &issuer.tax_id)?;
        text(w, "claveAcceso", key.as_str())?;
        text(w, "codDoc", DocumentType::Invoice.code())?;
        text(w, "estab", sequence.establishment())?;
        text(w, "ptoEmi", sequence.emission_point())?;
        text(w, "secuencial", &sequence.sequential_padded())?;
        text(w, "dirMatriz", &normalize_text(&issuer.head_office_address))?;
        Ok(())
    })?;
    Ok(())
}

fn write_invoice_info(
    w: &mut XmlWriter,
    record: &InvoiceRecord,
    summary: &Totals,
) -> quick_xml::Result<()> {
    let buyer = &record.buyer;
    let subtotal: Decimal = summary.by_rate.iter().map(|r| r.base).sum();

    element(w, "infoFactura", |w| {
        text(w, "fechaEmision", &record.emission_date.format("%d/%m/%Y").to_string())?;
        if let Some(address) = &record.issuer.establishment_address {
            text(w, "dirEstablecimiento", &normalize_text(address))?;
        }
        if let Some(keeps) = record.issuer.keeps_accounting {
            text(w, "obligadoContabilidad", if keeps { "SI" } else { "NO" })?;
        }
        text(w, "tipoIdentificacionComprador", buyer.identification_type.code())?;
        text(w, "razonSocialComprador", &normalize_text(&buyer.name))?;
        text(w, "identificacionComprador", &buyer.identification)?;
        if let Some(address) = buyer.address.as_deref().filter(|a| !a.trim().is_empty()) {
            text(w, "direccionComprador", &normalize_text(address))?;
        }
        text(w, "totalSinImpuestos", &money(subtotal))?;
        text(w, "totalDescuento", &money(summary.discount_total))?;

        element(w, "totalConImpuestos", |w| {
            for entry in &summary.by_rate {
                element(w, "totalImpuesto", |w| {
                    text(w, "codigo", TaxRate::IVA_CODE)?;
                    text(w, "codigoPorcentaje", entry.rate.code())?;
                    text(w, "baseImponible", &money(entry.base))?;
                    text(w, "valor", &money(entry.tax))?;
                    Ok(())
                })?;
            }
            Ok(())
        })?;

        text(w, "propina", &money(summary.tip))?;
        text(w, "importeTotal", &money(summary.grand_total))?;
        text(w, "moneda", &currency_name(&record.currency))?;

        element(w, "pagos", |w| {
            if record.payments.is_empty() {
                write_payment(w, "01", summary.grand_total, None, None)?;
            }
            for p in &record.payments {
                write_payment(w, &p.method, p.amount, p.term, p.time_unit.as_deref())?;
            }
            Ok(())
        })?;
        Ok(())
    })?;
    Ok(())
}

fn write_payment(
    w: &mut XmlWriter,
    method: &str,
    amount: Decimal,
    term: Option<u32>,
    time_unit: Option<&str>,
) -> quick_xml::Result<()> {
    element(w, "pago", |w| {
        text(w, "formaPago", method)?;
        text(w, "total", &money(amount))?;
        if let Some(term) = term {
            text(w, "plazo", &term.to_string())?;
            text(w, "unidadTiempo", time_unit.unwrap_or("dias"))?;
        }
        Ok(())
    })?;
    Ok(())
}

fn write_details(w: &mut XmlWriter, lines: &[LineItem]) -> quick_xml::Result<()> {
    element(w, "detalles", |w| {
        for line in lines {
            element(w, "detalle", |w| {
                if let Some(code) = &line.code {
                    text(w, "codigoPrincipal", &normalize_text(code))?;
                }
                text(w, "descripcion", &normalize_text(&line.description))?;
                text(w, "cantidad", &money(line.quantity))?;
                text(w, "precioUnitario", &money(line.unit_price))?;
                text(w, "descuento", &money(line.discount))?;
                text(w, "precioTotalSinImpuesto", &money(line.base))?;
                element(w, "impuestos", |w| {
                    element(w, "impuesto", |w| {
                        text(w, "codigo", TaxRate::IVA_CODE)?;
                        text(w, "codigoPorcentaje", line.tax_rate.code())?;
                        text(w, "tarifa", &money(line.tax_rate.percentage()))?;
                        text(w, "baseImponible", &money(line.base))?;
                        text(w, "valor", &money(line.tax_value))?;
                        Ok(())
                    })?;
                    Ok(())
                })?;
                Ok(())
            })?;
        }
        Ok(())
    })?;
    Ok(())
}

fn write_additional_info(w: &mut XmlWriter, record: &InvoiceRecord) -> quick_xml::Result<()> {
    let fields = additional_fields(record);
    if fields.is_empty() {
        return Ok(());
    }
    element(w, "infoAdicional", |w| {
        for field in &fields {
            w.create_element("campoAdicional")
                .with_attribute(("nombre", normalize_text(&field.name).as_str()))
                .write_text_content(BytesText::new(&normalize_text(&field.value)))?;
        }
        Ok(())
    })?;
    Ok(())
}

/// Record fields first, then buyer contact details.
fn additional_fields(record: &InvoiceRecord) -> Vec<AdditionalField> {
    let mut fields: Vec<AdditionalField> = record
        .additional_fields
        .iter()
        .filter(|f| !f.name.trim().is_empty() && !f.value.trim().is_empty())
        .cloned()
        .collect();
    let contact = [
        ("Email", record.buyer.email.as_deref()),
        ("Telefono", record.buyer.phone.as_deref()),
    ];
    for (name, value) in contact {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            fields.push(AdditionalField {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    }
    fields
}

fn element<F>(w: &mut XmlWriter, name: &str, content: F) -> quick_xml::Result<()>
where
    F: FnOnce(&mut XmlWriter) -> quick_xml::Result<()>,
{
    w.create_element(name).write_inner_content(content)?;
    Ok(())
}

fn text(w: &mut XmlWriter, name: &str, value: &str) -> quick_xml::Result<()> {
    w.create_element(name).write_text_content(BytesText::new(value))?;
    Ok(())
}

fn money(value: Decimal) -> String {
    format!("{:.2}", round_money(value))
}

fn currency_name(code: &str) -> String {
    match code.trim().to_ascii_uppercase().as_str() {
        "USD" | "DOLAR" | "" => "DOLAR".to_string(),
        other => other.to_string(),
    }
}

/// Folds free text into what the authority's schema accepts.
pub fn normalize_text(s: &str) -> String {
    let mut folded = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\x00'..='\x08' | '\x0B' | '\x0C' | '\x0E'..='\x1F' | '\x7F' => {}
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => folded.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => folded.push('"'),
            '\u{2013}' | '\u{2014}' | '\u{2015}' => folded.push('-'),
            '\u{2026}' => folded.push_str("..."),
            '\u{00A0}' => folded.push(' '),
            '\u{00AD}' => {}
            _ => folded.push(ch),
        }
    }
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn is_final_consumer(kind: IdentificationType) -> bool {
    kind == IdentificationType::FinalConsumer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_folds_typography_and_whitespace() {
        assert_eq!(
            normalize_text("  \u{201C}Caf\u{e9}\u{201D}\u{2014}ok\u{2026}\t\n x "),
            "\"Caf\u{e9}\"-ok... x"
        );
        assert_eq!(normalize_text("a\x01b\u{00AD}c"), "abc");
    }

    #[test]
    fn currency_uses_authority_lexicon() {
        assert_eq!(currency_name("usd"), "DOLAR");
        assert_eq!(currency_name("EUR"), "EUR");
    }

    #[test]
    fn money_rounds_half_away_from_zero() {
        assert_eq!(money(Decimal::new(1005, 3)), "1.01");
        assert_eq!(money(Decimal::from(12)), "12.00");
    }
}
