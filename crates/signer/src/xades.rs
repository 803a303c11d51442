//! Enveloped XAdES-BES signatures over authority documents.
//!
//! Three references are signed: the `SignedProperties` fragment carrying the signing time and
//! the certificate digest, the `KeyInfo` holding the certificate, and the document root
//! (`#comprobante`, enveloped-signature plus exclusive c14n). Digests and the signature use
//! SHA-256; the key is RSA.

use crate::c14n::{self, canonicalize, C14nError, EXC_C14N};
use crate::credential::SigningCredential;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use ec_einv_core::document::CanonicalXmlDocument;
use ec_einv_core::parsing::compute_sha256_hex;
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKeyRef, Private};
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;
use roxmltree::Node;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XADES_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";
pub const SIGNED_PROPERTIES_TYPE: &str = "http://uri.etsi.org/01903#SignedProperties";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

#[derive(Debug, Error)]
pub enum SignError {
    #[error("signing key rejected: {0}")]
    SigningKeyRejected(String),
    #[error("certificate not valid at signing time (valid {not_before} to {not_after})")]
    CertificateExpired { not_before: String, not_after: String },
    #[error("canonicalization failed: {0}")]
    CanonicalizationFailure(String),
    #[error("document already carries a signature")]
    AlreadySigned,
}

impl From<C14nError> for SignError {
    fn from(err: C14nError) -> Self {
        SignError::CanonicalizationFailure(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum VerificationError {
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("document has no signature")]
    MissingSignature,
    #[error("document has more than one signature")]
    MultipleSignatures,
    #[error("signature is not the last child of the document root")]
    SignatureNotLast,
    #[error("signature is missing {0}")]
    MissingElement(&'static str),
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("reference {0} does not resolve")]
    UnresolvedReference(String),
    #[error("digest mismatch for reference {0}")]
    DigestMismatch(String),
    #[error("no reference covers the document root")]
    MissingDocumentReference,
    #[error("no reference typed as signed properties")]
    MissingSignedPropertiesReference,
    #[error("no reference covers the signature's KeyInfo")]
    MissingKeyInfoReference,
    #[error("qualifying properties target {found:?}, signature is {expected:?}")]
    TargetMismatch { expected: String, found: String },
    #[error("embedded certificate does not match the signed certificate digest")]
    CertificateDigestMismatch,
    #[error("invalid embedded certificate: {0}")]
    Certificate(String),
    #[error("signature value does not verify")]
    SignatureMismatch,
    #[error("canonicalization failed: {0}")]
    Canonicalization(String),
}

impl From<C14nError> for VerificationError {
    fn from(err: C14nError) -> Self {
        VerificationError::Canonicalization(err.to_string())
    }
}

/// Signed document bytes: the original document with a `ds:Signature` as the root's last child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    xml: String,
}

impl SignedDocument {
    /// Wraps previously signed XML, e.g. loaded from storage. Not verified.
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

/// What a successful verification found.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureInfo {
    pub signature_id: String,
    pub signing_time: Option<DateTime<Utc>>,
    pub document_digest: String,
    pub certificate_subject: String,
}

#[derive(Debug, Clone, Default)]
pub struct XadesSigner;

impl XadesSigner {
    pub fn new() -> Self {
        Self
    }

    pub fn sign(
        &self,
        document: &CanonicalXmlDocument,
        credential: &SigningCredential,
    ) -> Result<SignedDocument, SignError> {
        self.sign_at(document, credential, Utc::now())
    }

    pub fn sign_at(
        &self,
        document: &CanonicalXmlDocument,
        credential: &SigningCredential,
        instant: DateTime<Utc>,
    ) -> Result<SignedDocument, SignError> {
        check_key(credential)?;
        check_validity(credential, instant)?;

        let xml = document.as_str();
        let parsed = roxmltree::Document::parse(xml)
            .map_err(|e| SignError::CanonicalizationFailure(e.to_string()))?;
        let root = parsed.root_element();
        if root.children().any(|n| is_ds(n, "Signature")) {
            return Err(SignError::AlreadySigned);
        }
        let root_id = element_id(root).ok_or_else(|| {
            SignError::CanonicalizationFailure("document root has no id attribute".to_string())
        })?;

        let document_digest = digest_b64(canonicalize(root, None)?.as_bytes());

        let der = credential
            .certificate_der()
            .map_err(|e| SignError::SigningKeyRejected(e.to_string()))?;
        let serial = credential
            .serial_decimal()
            .map_err(|e| SignError::SigningKeyRejected(e.to_string()))?;
        let ids = SignatureIds::generate();

        let signed_properties = c14n::canonicalize_str(&signed_properties_xml(
            &ids,
            instant,
            &digest_b64(&der),
            &credential.issuer_dn(),
            &serial,
        ))?;
        let key_info = c14n::canonicalize_str(&key_info_xml(&ids, &BASE64.encode(&der)))?;
        let signed_info = c14n::canonicalize_str(&signed_info_xml(
            &ids,
            root_id,
            &Digests {
                document: &document_digest,
                properties: &digest_b64(signed_properties.as_bytes()),
                key_info: &digest_b64(key_info.as_bytes()),
            },
        ))?;
        let signature_value = rsa_sha256(credential.private_key(), signed_info.as_bytes())?;

        let signature = signature_xml(
            &ids,
            &signed_info,
            &signature_value,
            &key_info,
            &signed_properties,
        );

        let insert_at = closing_tag_offset(xml, root)?;
        let mut signed = String::with_capacity(xml.len() + signature.len());
        signed.push_str(&xml[..insert_at]);
        signed.push_str(&signature);
        signed.push_str(&xml[insert_at..]);

        tracing::info!(
            signature_id = %ids.signature,
            document_digest = %document_digest,
            signing_time = %instant.to_rfc3339_opts(SecondsFormat::Secs, true),
            "document signed"
        );
        Ok(SignedDocument { xml: signed })
    }

    pub fn verify(&self, signed: &SignedDocument) -> Result<SignatureInfo, VerificationError> {
        verify_xml(signed.as_str())
    }
}

/// `verify` as a predicate.
pub fn is_valid(xml: &str) -> bool {
    verify_xml(xml).is_ok()
}

fn check_key(credential: &SigningCredential) -> Result<(), SignError> {
    let key = credential.private_key();
    if key.id() != Id::RSA {
        return Err(SignError::SigningKeyRejected(format!(
            "RSA key required, got {:?}",
            key.id()
        )));
    }
    let public = credential
        .certificate()
        .public_key()
        .map_err(|e| SignError::SigningKeyRejected(e.to_string()))?;
    if !public.public_eq(key) {
        return Err(SignError::SigningKeyRejected(
            "private key does not match the certificate".to_string(),
        ));
    }
    Ok(())
}

fn check_validity(credential: &SigningCredential, instant: DateTime<Utc>) -> Result<(), SignError> {
    let valid = credential
        .is_valid_at(instant)
        .map_err(|e| SignError::SigningKeyRejected(e.to_string()))?;
    if !valid {
        return Err(SignError::CertificateExpired {
            not_before: credential.not_before(),
            not_after: credential.not_after(),
        });
    }
    Ok(())
}

struct SignatureIds {
    signature: String,
    signed_info: String,
    signed_properties: String,
    signed_properties_ref: String,
    document_ref: String,
    key_info: String,
}

impl SignatureIds {
    fn generate() -> Self {
        let n = uuid::Uuid::new_v4().simple().to_string();
        Self {
            signature: format!("Signature{n}"),
            signed_info: format!("Signature{n}-SignedInfo"),
            signed_properties: format!("Signature{n}-SignedProperties"),
            signed_properties_ref: format!("SignedPropertiesID{n}"),
            document_ref: format!("Reference-ID-{n}"),
            key_info: format!("Certificate{n}"),
        }
    }
}

fn signed_properties_xml(
    ids: &SignatureIds,
    instant: DateTime<Utc>,
    cert_digest: &str,
    issuer: &str,
    serial: &str,
) -> String {
    format!(
        concat!(
            r#"<xades:SignedProperties xmlns:ds="{ds}" xmlns:xades="{xades}" Id="{id}">"#,
            "<xades:SignedSignatureProperties>",
            "<xades:SigningTime>{time}</xades:SigningTime>",
            "<xades:SigningCertificate><xades:Cert><xades:CertDigest>",
            r#"<ds:DigestMethod Algorithm="{sha}"></ds:DigestMethod>"#,
            "<ds:DigestValue>{digest}</ds:DigestValue>",
            "</xades:CertDigest><xades:IssuerSerial>",
            "<ds:X509IssuerName>{issuer}</ds:X509IssuerName>",
            "<ds:X509SerialNumber>{serial}</ds:X509SerialNumber>",
            "</xades:IssuerSerial></xades:Cert></xades:SigningCertificate>",
            "</xades:SignedSignatureProperties>",
            "<xades:SignedDataObjectProperties>",
            r##"<xades:DataObjectFormat ObjectReference="#{doc_ref}">"##,
            "<xades:Description>contenido comprobante</xades:Description>",
            "<xades:MimeType>text/xml</xades:MimeType>",
            "</xades:DataObjectFormat>",
            "</xades:SignedDataObjectProperties>",
            "</xades:SignedProperties>"
        ),
        ds = DS_NS,
        xades = XADES_NS,
        id = ids.signed_properties,
        time = instant.to_rfc3339_opts(SecondsFormat::Secs, true),
        sha = SHA256,
        digest = cert_digest,
        issuer = c14n::escaped(issuer),
        serial = serial,
        doc_ref = ids.document_ref,
    )
}

fn key_info_xml(ids: &SignatureIds, certificate: &str) -> String {
    format!(
        concat!(
            r#"<ds:KeyInfo xmlns:ds="{ds}" Id="{id}"><ds:X509Data>"#,
            "<ds:X509Certificate>{cert}</ds:X509Certificate>",
            "</ds:X509Data></ds:KeyInfo>"
        ),
        ds = DS_NS,
        id = ids.key_info,
        cert = certificate,
    )
}

struct Digests<'a> {
    document: &'a str,
    properties: &'a str,
    key_info: &'a str,
}

fn signed_info_xml(ids: &SignatureIds, root_id: &str, digests: &Digests<'_>) -> String {
    format!(
        concat!(
            r#"<ds:SignedInfo xmlns:ds="{ds}" Id="{id}">"#,
            r#"<ds:CanonicalizationMethod Algorithm="{c14n}"></ds:CanonicalizationMethod>"#,
            r#"<ds:SignatureMethod Algorithm="{rsa}"></ds:SignatureMethod>"#,
            r##"<ds:Reference Id="{sp_ref}" Type="{sp_type}" URI="#{sp_id}">"##,
            r#"<ds:Transforms><ds:Transform Algorithm="{c14n}"></ds:Transform></ds:Transforms>"#,
            r#"<ds:DigestMethod Algorithm="{sha}"></ds:DigestMethod>"#,
            "<ds:DigestValue>{sp_digest}</ds:DigestValue>",
            "</ds:Reference>",
            r##"<ds:Reference URI="#{key_id}">"##,
            r#"<ds:Transforms><ds:Transform Algorithm="{c14n}"></ds:Transform></ds:Transforms>"#,
            r#"<ds:DigestMethod Algorithm="{sha}"></ds:DigestMethod>"#,
            "<ds:DigestValue>{key_digest}</ds:DigestValue>",
            "</ds:Reference>",
            r##"<ds:Reference Id="{doc_ref}" URI="#{root_id}">"##,
            "<ds:Transforms>",
            r#"<ds:Transform Algorithm="{enveloped}"></ds:Transform>"#,
            r#"<ds:Transform Algorithm="{c14n}"></ds:Transform>"#,
            "</ds:Transforms>",
            r#"<ds:DigestMethod Algorithm="{sha}"></ds:DigestMethod>"#,
            "<ds:DigestValue>{doc_digest}</ds:DigestValue>",
            "</ds:Reference>",
            "</ds:SignedInfo>"
        ),
        ds = DS_NS,
        id = ids.signed_info,
        c14n = EXC_C14N,
        rsa = RSA_SHA256,
        sp_ref = ids.signed_properties_ref,
        sp_type = SIGNED_PROPERTIES_TYPE,
        sp_id = ids.signed_properties,
        sha = SHA256,
        sp_digest = digests.properties,
        key_id = ids.key_info,
        key_digest = digests.key_info,
        doc_ref = ids.document_ref,
        root_id = root_id,
        enveloped = ENVELOPED_SIGNATURE,
        doc_digest = digests.document,
    )
}

fn signature_xml(
    ids: &SignatureIds,
    signed_info: &str,
    signature_value: &str,
    key_info: &str,
    signed_properties: &str,
) -> String {
    format!(
        concat!(
            r#"<ds:Signature xmlns:ds="{ds}" xmlns:xades="{xades}" Id="{id}">"#,
            "{signed_info}",
            "<ds:SignatureValue>{value}</ds:SignatureValue>",
            "{key_info}",
            "<ds:Object>",
            r##"<xades:QualifyingProperties Target="#{id}">{signed_properties}</xades:QualifyingProperties>"##,
            "</ds:Object>",
            "</ds:Signature>"
        ),
        ds = DS_NS,
        xades = XADES_NS,
        id = ids.signature,
        signed_info = signed_info,
        value = signature_value,
        key_info = key_info,
        signed_properties = signed_properties,
    )
}

fn rsa_sha256(key: &PKeyRef<Private>, data: &[u8]) -> Result<String, SignError> {
    let reject = |e: openssl::error::ErrorStack| SignError::SigningKeyRejected(e.to_string());
    let mut signer = Signer::new(MessageDigest::sha256(), key).map_err(reject)?;
    signer.update(data).map_err(reject)?;
    Ok(BASE64.encode(signer.sign_to_vec().map_err(reject)?))
}

/// Byte offset of the root's closing tag.
fn closing_tag_offset(xml: &str, root: Node<'_, '_>) -> Result<usize, SignError> {
    let end = root.range().end;
    let offset = xml[..end].rfind("</").ok_or_else(|| {
        SignError::CanonicalizationFailure("document root has no closing tag".to_string())
    })?;
    let closing = &xml[offset + 2..end];
    if closing.trim_end_matches('>').trim() != closing_name(xml, root) {
        return Err(SignError::CanonicalizationFailure(
            "document root has no closing tag".to_string(),
        ));
    }
    Ok(offset)
}

fn closing_name<'a>(xml: &'a str, root: Node<'_, '_>) -> &'a str {
    let rest = &xml[root.range().start + 1..];
    let end = rest
        .find(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
        .unwrap_or(rest.len());
    &rest[..end]
}

fn digest_b64(data: &[u8]) -> String {
    BASE64.encode(Sha256::digest(data))
}

fn is_ds(node: Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.has_tag_name((DS_NS, name))
}

fn is_xades(node: Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.has_tag_name((XADES_NS, name))
}

fn element_id<'a>(node: Node<'a, '_>) -> Option<&'a str> {
    node.attribute("id").or_else(|| node.attribute("Id"))
}

fn ds_child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| is_ds(*n, name))
}

fn compact_text(node: Option<Node<'_, '_>>) -> String {
    node.and_then(|n| n.text())
        .map(|t| t.chars().filter(|c| !c.is_whitespace()).collect())
        .unwrap_or_default()
}

/// Recomputes every reference digest and the signature value of a signed document.
pub fn verify_xml(xml: &str) -> Result<SignatureInfo, VerificationError> {
    let doc =
        roxmltree::Document::parse(xml).map_err(|e| VerificationError::Malformed(e.to_string()))?;
    let root = doc.root_element();

    let signatures: Vec<Node> = root.children().filter(|n| is_ds(*n, "Signature")).collect();
    let signature = match signatures.as_slice() {
        [] => return Err(VerificationError::MissingSignature),
        [one] => *one,
        _ => return Err(VerificationError::MultipleSignatures),
    };
    if root.children().filter(|n| n.is_element()).last().map(|n| n.id()) != Some(signature.id()) {
        return Err(VerificationError::SignatureNotLast);
    }
    let signature_id =
        element_id(signature).ok_or(VerificationError::MissingElement("Signature Id"))?;

    let signed_info =
        ds_child(signature, "SignedInfo").ok_or(VerificationError::MissingElement("SignedInfo"))?;
    let algorithms = [("CanonicalizationMethod", EXC_C14N), ("SignatureMethod", RSA_SHA256)];
    for (element, expected) in algorithms {
        let algorithm = ds_child(signed_info, element)
            .and_then(|n| n.attribute("Algorithm"))
            .unwrap_or_default();
        if algorithm != expected {
            return Err(VerificationError::UnsupportedAlgorithm(algorithm.to_string()));
        }
    }

    let mut document_digest = None;
    let mut signed_properties = None;
    let mut key_info = None;
    for reference in signed_info.children().filter(|n| is_ds(*n, "Reference")) {
        let uri = reference.attribute("URI").unwrap_or_default();
        let target = if uri.is_empty() {
            root
        } else {
            let id = uri.strip_prefix('#').unwrap_or(uri);
            doc.descendants()
                .find(|n| n.is_element() && element_id(*n) == Some(id))
                .ok_or_else(|| VerificationError::UnresolvedReference(uri.to_string()))?
        };

        let digest_method = ds_child(reference, "DigestMethod")
            .and_then(|n| n.attribute("Algorithm"))
            .unwrap_or_default();
        if digest_method != SHA256 {
            return Err(VerificationError::UnsupportedAlgorithm(digest_method.to_string()));
        }
        let enveloped = reference
            .descendants()
            .filter(|n| is_ds(*n, "Transform"))
            .any(|n| n.attribute("Algorithm") == Some(ENVELOPED_SIGNATURE));
        let exclude = enveloped.then(|| signature.id());

        let computed = digest_b64(canonicalize(target, exclude)?.as_bytes());
        if computed != compact_text(ds_child(reference, "DigestValue")) {
            return Err(VerificationError::DigestMismatch(uri.to_string()));
        }

        if target.id() == root.id() {
            document_digest = Some(computed);
        } else if reference.attribute("Type") == Some(SIGNED_PROPERTIES_TYPE)
            && is_xades(target, "SignedProperties")
        {
            signed_properties = Some(target);
        } else if is_ds(target, "KeyInfo") && target.parent() == Some(signature) {
            key_info = Some(target);
        }
    }
    let document_digest = document_digest.ok_or(VerificationError::MissingDocumentReference)?;
    let signed_properties =
        signed_properties.ok_or(VerificationError::MissingSignedPropertiesReference)?;
    let key_info = key_info.ok_or(VerificationError::MissingKeyInfoReference)?;
    check_target(signature, signature_id, signed_properties)?;

    let certificate_b64 = compact_text(
        key_info
            .descendants()
            .find(|n| is_ds(*n, "X509Certificate")),
    );
    if certificate_b64.is_empty() {
        return Err(VerificationError::MissingElement("X509Certificate"));
    }
    let der = BASE64
        .decode(certificate_b64.as_bytes())
        .map_err(|e| VerificationError::Certificate(e.to_string()))?;
    let certificate =
        X509::from_der(&der).map_err(|e| VerificationError::Certificate(e.to_string()))?;

    let signed_cert_digest = compact_text(
        signed_properties
            .descendants()
            .find(|n| is_xades(*n, "CertDigest"))
            .and_then(|n| ds_child(n, "DigestValue")),
    );
    if signed_cert_digest != digest_b64(&der) {
        return Err(VerificationError::CertificateDigestMismatch);
    }

    let signature_value = BASE64
        .decode(compact_text(ds_child(signature, "SignatureValue")).as_bytes())
        .map_err(|_| VerificationError::SignatureMismatch)?;
    let canonical_info = canonicalize(signed_info, None)?;
    let public = certificate
        .public_key()
        .map_err(|e| VerificationError::Certificate(e.to_string()))?;
    let verified = Verifier::new(MessageDigest::sha256(), &public)
        .and_then(|mut verifier| {
            verifier.update(canonical_info.as_bytes())?;
            verifier.verify(&signature_value)
        })
        .unwrap_or(false);
    if !verified {
        return Err(VerificationError::SignatureMismatch);
    }

    let signing_time = signed_properties
        .descendants()
        .find(|n| is_xades(*n, "SigningTime"))
        .and_then(|n| n.text())
        .and_then(|t| DateTime::parse_from_rfc3339(t.trim()).ok())
        .map(|t| t.with_timezone(&Utc));
    let certificate_subject = certificate
        .subject_name()
        .entries()
        .filter_map(|e| {
            let key = e.object().nid().short_name().ok()?;
            let value = e.data().as_utf8().ok()?;
            Some(format!("{key}={value}"))
        })
        .collect::<Vec<_>>()
        .join(",");

    Ok(SignatureInfo {
        signature_id: signature_id.to_string(),
        signing_time,
        document_digest,
        certificate_subject,
    })
}

/// The signed properties must sit in this signature's `Object` and name it as their target.
fn check_target(
    signature: Node<'_, '_>,
    signature_id: &str,
    signed_properties: Node<'_, '_>,
) -> Result<(), VerificationError> {
    let expected = format!("#{signature_id}");
    let qualifying = signed_properties
        .parent()
        .filter(|n| is_xades(*n, "QualifyingProperties"))
        .filter(|n| n.parent().is_some_and(|o| is_ds(o, "Object") && o.parent() == Some(signature)))
        .ok_or(VerificationError::MissingElement("QualifyingProperties"))?;
    let found = qualifying.attribute("Target").unwrap_or_default();
    if found != expected {
        return Err(VerificationError::TargetMismatch {
            expected,
            found: found.to_string(),
        });
    }
    Ok(())
}
