use chrono::{NaiveDate, TimeZone, Utc};
use ec_einv_core::access_key;
use ec_einv_core::document::{CanonicalXmlDocument, InvoiceDocumentBuilder};
use ec_einv_core::models::*;
use rust_decimal_macros::dec;
use signer::test_support;
use signer::xades::{self, SIGNED_PROPERTIES_TYPE};
use signer::{CertificateStore, SignError, SigningCredential, VerificationError, XadesSigner};

fn document() -> CanonicalXmlDocument {
    let line = LineItem::priced("Servicio mensual", dec!(1), dec!(100), dec!(0), TaxRate::Twelve);
    let record = InvoiceRecord {
        issuer: Issuer {
            tax_id: "1790011674001".to_string(),
            legal_name: "ACME S.A.".to_string(),
            trade_name: Some("ACME".to_string()),
            head_office_address: "Quito".to_string(),
            establishment_address: None,
            keeps_accounting: None,
        },
        buyer: Buyer {
            identification_type: IdentificationType::FinalConsumer,
            identification: "9999999999999".to_string(),
            name: "CONSUMIDOR FINAL".to_string(),
            address: None,
            email: Some("cliente@example.com".to_string()),
            phone: None,
        },
        emission_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        currency: "USD".to_string(),
        totals: Totals::from_lines(std::slice::from_ref(&line), dec!(0)),
        line_items: vec![line],
        payments: vec![],
        additional_fields: vec![],
    };
    let seq = SequenceIdentity::new("001", "002", 123, Environment::Test, EmissionType::Normal)
        .unwrap();
    let tax_id = &record.issuer.tax_id;
    let key =
        access_key::encode(&seq, tax_id, record.emission_date, DocumentType::Invoice, 12345678)
            .unwrap();
    InvoiceDocumentBuilder::new().build(&record, &key, &seq).unwrap()
}

fn credential() -> SigningCredential {
    let p12 = test_support::p12("clave", "ACME S.A.").unwrap();
    CertificateStore::new().extract(&p12, "clave").unwrap()
}

#[test]
fn signed_document_verifies_against_extracted_certificate() {
    let cred = credential();
    let signed = XadesSigner::new().sign(&document(), &cred).unwrap();
    let info = XadesSigner::new().verify(&signed).unwrap();
    assert!(info.signature_id.starts_with("Signature"));
    assert!(info.certificate_subject.contains("CN=ACME S.A."));
    assert!(info.signing_time.is_some());
    assert!(xades::is_valid(signed.as_str()));
}

#[test]
fn signature_is_last_child_and_typed() {
    let doc = document();
    let signed = XadesSigner::new().sign(&doc, &credential()).unwrap();
    let xml = signed.as_str();

    let sig_start = xml.find("<ds:Signature ").unwrap();
    let sig_end = xml.find("</ds:Signature>").unwrap() + "</ds:Signature>".len();
    assert_eq!(xml[sig_end..].trim(), "</factura>");
    // the unsigned document is recovered by cutting the signature out
    assert_eq!(format!("{}{}", &xml[..sig_start], &xml[sig_end..]), doc.as_str());

    assert!(xml.contains(&format!("Type=\"{SIGNED_PROPERTIES_TYPE}\"")));
    assert!(xml.contains("URI=\"#comprobante\""));
    assert_eq!(xml.matches("<ds:Reference ").count(), 3);
    assert!(xml.contains("<xades:QualifyingProperties"));
    let object = xml.find("<ds:Object").unwrap();
    assert!(sig_start < object && object < sig_end);
}

#[test]
fn sign_at_records_the_given_instant() {
    let instant = Utc.with_ymd_and_hms(2024, 3, 15, 15, 30, 0).unwrap();
    let signed = XadesSigner::new().sign_at(&document(), &credential(), instant).unwrap();
    assert!(signed
        .as_str()
        .contains("<xades:SigningTime>2024-03-15T15:30:00Z</xades:SigningTime>"));
    let info = XadesSigner::new().verify(&signed).unwrap();
    assert_eq!(info.signing_time, Some(instant));
}

#[test]
fn document_digest_is_stable_across_signatures() {
    let doc = document();
    let cred = credential();
    let a = XadesSigner::new().sign(&doc, &cred).unwrap();
    let b = XadesSigner::new().sign(&doc, &cred).unwrap();
    let da = XadesSigner::new().verify(&a).unwrap().document_digest;
    let db = XadesSigner::new().verify(&b).unwrap().document_digest;
    assert_eq!(da, db);
}

#[test]
fn tampered_content_fails() {
    let signed = XadesSigner::new().sign(&document(), &credential()).unwrap();
    let xml = signed.as_str();

    let total =
        xml.replace("<importeTotal>112.00</importeTotal>", "<importeTotal>113.00</importeTotal>");
    assert_eq!(
        xades::verify_xml(&total),
        Err(VerificationError::DigestMismatch("#comprobante".to_string()))
    );

    let untyped = xml.replace(&format!(" Type=\"{SIGNED_PROPERTIES_TYPE}\""), "");
    assert_eq!(
        xades::verify_xml(&untyped),
        Err(VerificationError::MissingSignedPropertiesReference)
    );

    let start = xml.find("<ds:SignatureValue").unwrap();
    let value_start = xml[start..].find('>').unwrap() + start + 1;
    let mut bytes = xml.as_bytes().to_vec();
    bytes[value_start] = if bytes[value_start] == b'A' { b'B' } else { b'A' };
    assert_eq!(
        xades::verify_xml(&String::from_utf8(bytes).unwrap()),
        Err(VerificationError::SignatureMismatch)
    );
}

fn region(xml: &str, open: &str, close: &str) -> std::ops::Range<usize> {
    let start = xml.find(open).unwrap();
    let end = xml[start..].find(close).unwrap() + start + close.len();
    start..end
}

#[test]
fn any_byte_flip_in_signed_content_fails() {
    let signed = XadesSigner::new().sign(&document(), &credential()).unwrap();
    let xml = signed.as_str();

    let body = xml.find("<factura").unwrap()..xml.find("<ds:Signature ").unwrap();
    let regions = [body, region(xml, "<ds:Signature ", "</ds:Signature>")];
    for range in regions {
        for pos in range {
            let mut bytes = xml.as_bytes().to_vec();
            bytes[pos] = if bytes[pos] == b'X' { b'Y' } else { b'X' };
            let mutated = String::from_utf8_lossy(&bytes);
            assert!(
                !xades::is_valid(&mutated),
                "flip at {pos} ({:?}) verified",
                &xml[pos.saturating_sub(10)..(pos + 10).min(xml.len())]
            );
        }
    }
}

#[test]
fn unsigned_or_double_signed_documents() {
    let doc = document();
    assert_eq!(xades::verify_xml(doc.as_str()), Err(VerificationError::MissingSignature));

    let signed = XadesSigner::new().sign(&doc, &credential()).unwrap();
    let again = CanonicalXmlDocument::from_xml(signed.into_string());
    assert!(matches!(
        XadesSigner::new().sign(&again, &credential()),
        Err(SignError::AlreadySigned)
    ));
}

#[test]
fn signature_must_stay_last() {
    let signed = XadesSigner::new().sign(&document(), &credential()).unwrap();
    let moved = signed
        .as_str()
        .replace("</factura>", "<extra></extra></factura>");
    assert_eq!(xades::verify_xml(&moved), Err(VerificationError::SignatureNotLast));
}

#[test]
fn expired_certificate_is_refused_before_signing() {
    let p12 = test_support::expired_p12("clave").unwrap();
    let cred = CertificateStore::new().extract(&p12, "clave").unwrap();
    assert!(matches!(
        XadesSigner::new().sign(&document(), &cred),
        Err(SignError::CertificateExpired { .. })
    ));
}

#[test]
fn mismatched_key_is_rejected() {
    let (key, _) = test_support::valid_certificate("one").unwrap();
    let (_, cert) = test_support::valid_certificate("two").unwrap();
    let cred = SigningCredential::from_parts(key, cert);
    assert!(matches!(
        XadesSigner::new().sign(&document(), &cred),
        Err(SignError::SigningKeyRejected(_))
    ));
}

#[test]
fn verification_uses_the_embedded_certificate() {
    let signed = XadesSigner::new().sign(&document(), &credential()).unwrap();
    // swap in another certificate: the signed digest no longer matches
    let (_, other) = test_support::valid_certificate("intruder").unwrap();
    let other_b64 = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(other.to_der().unwrap())
    };
    let xml = signed.as_str();
    let range = region(xml, "<ds:X509Certificate>", "</ds:X509Certificate>");
    let swapped = format!(
        "{}<ds:X509Certificate>{other_b64}</ds:X509Certificate>{}",
        &xml[..range.start],
        &xml[range.end..]
    );
    assert!(matches!(
        xades::verify_xml(&swapped),
        Err(VerificationError::DigestMismatch(uri)) if uri.starts_with("#Certificate")
    ));
}

#[test]
fn key_info_must_be_referenced() {
    let signed = XadesSigner::new().sign(&document(), &credential()).unwrap();
    let xml = signed.as_str();
    let start = xml.find("<ds:Reference URI=\"#Certificate").unwrap();
    let end = xml[start..].find("</ds:Reference>").unwrap() + start + "</ds:Reference>".len();
    let unreferenced = format!("{}{}", &xml[..start], &xml[end..]);
    assert_eq!(
        xades::verify_xml(&unreferenced),
        Err(VerificationError::MissingKeyInfoReference)
    );
}

#[test]
fn qualifying_properties_must_target_the_signature() {
    let signed = XadesSigner::new().sign(&document(), &credential()).unwrap();
    let info = XadesSigner::new().verify(&signed).unwrap();
    let id = info.signature_id;
    let xml = signed.as_str();

    let retargeted = xml.replace(&format!("Target=\"#{id}\""), "Target=\"#Signature0\"");
    assert_eq!(
        xades::verify_xml(&retargeted),
        Err(VerificationError::TargetMismatch {
            expected: format!("#{id}"),
            found: "#Signature0".to_string(),
        })
    );

    let renamed = xml.replacen(&format!("Id=\"{id}\""), "Id=\"Signature0\"", 1);
    assert_eq!(
        xades::verify_xml(&renamed),
        Err(VerificationError::TargetMismatch {
            expected: "#Signature0".to_string(),
            found: format!("#{id}"),
        })
    );
}
