use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::error::ErrorStack;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::{X509, X509Ref};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("wrong passphrase for certificate container")]
    WrongPassphrase,
    #[error("certificate container has no private key")]
    MissingKeyBag,
    #[error("certificate container has no certificate matching the private key")]
    MissingCertBag,
    #[error("malformed certificate container: {0}")]
    MalformedContainer(String),
    #[error("failed to read certificate container {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Private key and leaf certificate taken from a PKCS#12 container.
///
/// Lives for one signing operation. OpenSSL clears the key material when the value is dropped.
pub struct SigningCredential {
    key: PKey<Private>,
    certificate: X509,
}

impl SigningCredential {
    pub fn from_parts(key: PKey<Private>, certificate: X509) -> Self {
        Self { key, certificate }
    }

    pub fn private_key(&self) -> &PKeyRef<Private> {
        &self.key
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    pub fn certificate_der(&self) -> Result<Vec<u8>, ErrorStack> {
        self.certificate.to_der()
    }

    /// Subject DN, most specific component last (`C=EC,O=...,CN=...`).
    pub fn subject(&self) -> String {
        distinguished_name(self.certificate.subject_name())
    }

    /// Issuer DN in RFC 4514 order (`CN=...,O=...,C=EC`).
    pub fn issuer_dn(&self) -> String {
        let mut parts: Vec<String> = name_parts(self.certificate.issuer_name());
        parts.reverse();
        parts.join(",")
    }

    pub fn serial_decimal(&self) -> Result<String, ErrorStack> {
        Ok(self.certificate.serial_number().to_bn()?.to_dec_str()?.to_string())
    }

    pub fn not_before(&self) -> String {
        self.certificate.not_before().to_string()
    }

    pub fn not_after(&self) -> String {
        self.certificate.not_after().to_string()
    }

    /// Whether `instant` falls inside the certificate's validity window.
    pub fn is_valid_at(&self, instant: DateTime<Utc>) -> Result<bool, ErrorStack> {
        let now = Asn1Time::from_unix(instant.timestamp())?;
        let started = self.certificate.not_before().compare(&now)? != Ordering::Greater;
        let not_ended = self.certificate.not_after().compare(&now)? != Ordering::Less;
        Ok(started && not_ended)
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("subject", &self.subject())
            .field("not_after", &self.not_after())
            .finish_non_exhaustive()
    }
}

fn name_parts(name: &openssl::x509::X509NameRef) -> Vec<String> {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("OID");
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect()
}

fn distinguished_name(name: &openssl::x509::X509NameRef) -> String {
    name_parts(name).join(",")
}

/// Opens PKCS#12 containers. Holds no key material between calls.
#[derive(Debug, Clone, Default)]
pub struct CertificateStore;

impl CertificateStore {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(
        &self,
        p12: &[u8],
        passphrase: &str,
    ) -> Result<SigningCredential, CredentialError> {
        let container = Pkcs12::from_der(p12)
            .map_err(|e| CredentialError::MalformedContainer(e.to_string()))?;
        let parsed = container.parse2(passphrase).map_err(|e| classify(&e))?;

        let key = parsed.pkey.ok_or(CredentialError::MissingKeyBag)?;
        let certificate = match parsed.cert {
            Some(cert) => cert,
            // a leaf without a local key id lands in the CA list
            None => parsed
                .ca
                .into_iter()
                .flatten()
                .find(|cert| {
                    cert.public_key()
                        .map(|public| public.public_eq(&key))
                        .unwrap_or(false)
                })
                .ok_or(CredentialError::MissingCertBag)?,
        };

        let credential = SigningCredential { key, certificate };
        tracing::debug!(
            subject = %credential.subject(),
            not_after = %credential.not_after(),
            "signing credential extracted"
        );
        Ok(credential)
    }

    pub fn extract_file(
        &self,
        path: impl AsRef<Path>,
        passphrase: &str,
    ) -> Result<SigningCredential, CredentialError> {
        let path = path.as_ref();
        let bytes = Zeroizing::new(std::fs::read(path).map_err(|source| CredentialError::Io {
            path: path.display().to_string(),
            source,
        })?);
        self.extract(&bytes, passphrase)
    }
}

/// MAC and decryption failures mean the passphrase is wrong; anything else is a broken container.
fn classify(stack: &ErrorStack) -> CredentialError {
    let reasons: Vec<String> = stack
        .errors()
        .iter()
        .filter_map(|e| e.reason().map(str::to_ascii_lowercase))
        .collect();
    let wrong_passphrase = reasons.is_empty()
        || reasons
            .iter()
            .any(|r| r.contains("mac verify") || r.contains("decrypt"));
    if wrong_passphrase {
        CredentialError::WrongPassphrase
    } else {
        CredentialError::MalformedContainer(stack.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn extracts_key_and_matching_certificate() {
        let p12 = test_support::p12("s3cret", "ACME S.A.").unwrap();
        let cred = CertificateStore::new().extract(&p12, "s3cret").unwrap();
        let public = cred.certificate().public_key().unwrap();
        assert!(public.public_eq(cred.private_key()));
        assert!(cred.subject().contains("CN=ACME S.A."));
        assert!(cred.issuer_dn().starts_with("CN=ACME S.A."));
        assert!(!cred.serial_decimal().unwrap().is_empty());
        assert!(cred.is_valid_at(Utc::now()).unwrap());
    }

    #[test]
    fn wrong_passphrase_is_distinct_from_corruption() {
        let p12 = test_support::p12("s3cret", "ACME S.A.").unwrap();
        assert!(matches!(
            CertificateStore::new().extract(&p12, "nope"),
            Err(CredentialError::WrongPassphrase)
        ));
        assert!(matches!(
            CertificateStore::new().extract(b"definitely not der", "s3cret"),
            Err(CredentialError::MalformedContainer(_))
        ));
        assert!(matches!(
            CertificateStore::new().extract(&p12[..p12.len() / 2], "s3cret"),
            Err(CredentialError::MalformedContainer(_))
        ));
    }

    #[test]
    fn container_without_key_is_reported() {
        let p12 = test_support::certificate_only_p12("s3cret").unwrap();
        assert!(matches!(
            CertificateStore::new().extract(&p12, "s3cret"),
            Err(CredentialError::MissingKeyBag)
        ));
    }

    #[test]
    fn expired_certificate_is_outside_window() {
        let p12 = test_support::expired_p12("s3cret").unwrap();
        let cred = CertificateStore::new().extract(&p12, "s3cret").unwrap();
        assert!(!cred.is_valid_at(Utc::now()).unwrap());
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            CertificateStore::new().extract_file("/nonexistent/cert.p12", "x"),
            Err(CredentialError::Io { .. })
        ));
    }
}
