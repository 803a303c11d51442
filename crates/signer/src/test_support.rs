//! Throwaway RSA certificates and PKCS#12 containers for tests.

use chrono::{Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};

/// Self-signed RSA-2048 certificate valid between the two unix timestamps.
pub fn certificate(
    common_name: &str,
    not_before: i64,
    not_after: i64,
) -> Result<(PKey<Private>, X509), ErrorStack> {
    let pkey = PKey::from_rsa(Rsa::generate(2048)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("C", "EC")?;
    name.append_entry_by_text("O", "Entidad de Certificacion de Prueba")?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = {
        let mut serial = BigNum::new()?;
        serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
        serial.to_asn1_integer()?
    };
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&pkey)?;
    let not_before = Asn1Time::from_unix(not_before)?;
    let not_after = Asn1Time::from_unix(not_after)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.sign(&pkey, MessageDigest::sha256())?;

    Ok((pkey, builder.build()))
}

/// Certificate valid from yesterday for a year.
pub fn valid_certificate(common_name: &str) -> Result<(PKey<Private>, X509), ErrorStack> {
    let now = Utc::now();
    certificate(
        common_name,
        (now - Duration::days(1)).timestamp(),
        (now + Duration::days(365)).timestamp(),
    )
}

pub fn p12(passphrase: &str, common_name: &str) -> Result<Vec<u8>, ErrorStack> {
    let (pkey, cert) = valid_certificate(common_name)?;
    Pkcs12::builder()
        .name(common_name)
        .pkey(&pkey)
        .cert(&cert)
        .build2(passphrase)?
        .to_der()
}

pub fn expired_p12(passphrase: &str) -> Result<Vec<u8>, ErrorStack> {
    let now = Utc::now();
    let (pkey, cert) = certificate(
        "Expired Signer",
        (now - Duration::days(400)).timestamp(),
        (now - Duration::days(1)).timestamp(),
    )?;
    Pkcs12::builder()
        .name("expired")
        .pkey(&pkey)
        .cert(&cert)
        .build2(passphrase)?
        .to_der()
}

pub fn certificate_only_p12(passphrase: &str) -> Result<Vec<u8>, ErrorStack> {
    let (_, cert) = valid_certificate("No Key")?;
    Pkcs12::builder().cert(&cert).build2(passphrase)?.to_der()
}
