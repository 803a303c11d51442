//! Access key (clave de acceso): the 49-digit identifier of a fiscal document.
//!
//! Layout of the 48 data digits, left to right:
//!
//! | width | field |
//! |---|---|
//! | 8 | emission date `DDMMYYYY` |
//! | 2 | document type code |
//! | 13 | issuer tax id |
//! | 1 | environment |
//! | 6 | establishment + emission point |
//! | 9 | sequential |
//! | 8 | numeric code |
//! | 1 | emission type |
//!
//! followed by one modulo-11 check digit.

use crate::models::{DocumentType, EmissionType, Environment, SequenceIdentity};
use chrono::NaiveDate;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const ACCESS_KEY_LEN: usize = 49;
const BASE_LEN: usize = ACCESS_KEY_LEN - 1;
const MAX_NUMERIC_CODE: u32 = 99_999_999;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessKeyError {
    #[error("access key must be {ACCESS_KEY_LEN} digits, got {0}")]
    InvalidLength(usize),
    #[error("access key contains non-digit {found:?} at position {position}")]
    InvalidCharacter { position: usize, found: char },
    #[error("access key check digit is {found}, expected {expected}")]
    InvalidChecksum { expected: u8, found: u8 },
    #[error("invalid access key field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    /// Parses and validates a 49-digit key.
    pub fn parse(s: &str) -> Result<Self, AccessKeyError> {
        validate(s)?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn check_digit(&self) -> u8 {
        self.0.as_bytes()[BASE_LEN] - b'0'
    }

    pub fn emission_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.0[0..8], "%d%m%Y").ok()
    }

    pub fn document_type(&self) -> Option<DocumentType> {
        DocumentType::from_code(&self.0[8..10])
    }

    pub fn issuer_tax_id(&self) -> &str {
        &self.0[10..23]
    }

    pub fn environment(&self) -> Option<Environment> {
        Environment::from_code(self.0.as_bytes()[23] as char)
    }

    pub fn establishment(&self) -> &str {
        &self.0[24..27]
    }

    pub fn emission_point(&self) -> &str {
        &self.0[27..30]
    }

    pub fn sequential(&self) -> u32 {
        // digits were validated on construction
        self.0[30..39].parse().unwrap_or_default()
    }

    pub fn numeric_code(&self) -> &str {
        &self.0[39..47]
    }

    pub fn emission_type(&self) -> Option<EmissionType> {
        EmissionType::from_code(self.0.as_bytes()[47] as char)
    }

    /// The document numbering the key was derived from.
    pub fn sequence(&self) -> Option<SequenceIdentity> {
        SequenceIdentity::new(
            self.establishment(),
            self.emission_point(),
            self.sequential(),
            self.environment()?,
            self.emission_type()?,
        )
        .ok()
    }

    /// Numbering series of the document, see [`series`].
    pub fn series(&self) -> &str {
        &self.0[8..30]
    }

    /// Series plus sequential: the fiscal number, unique per issued document.
    pub fn fiscal_number(&self) -> &str {
        &self.0[8..39]
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AccessKey {
    type Error = AccessKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value))
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> Self {
        key.0
    }
}

/// Derives the access key of a document.
pub fn encode(
    sequence: &SequenceIdentity,
    issuer_tax_id: &str,
    emission_date: NaiveDate,
    document_type: DocumentType,
    numeric_code: u32,
) -> Result<AccessKey, AccessKeyError> {
    if issuer_tax_id.is_empty() || !issuer_tax_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AccessKeyError::InvalidField {
            field: "issuer_tax_id",
            reason: format!("not numeric: {issuer_tax_id:?}"),
        });
    }
    if issuer_tax_id.len() > 13 {
        return Err(AccessKeyError::InvalidField {
            field: "issuer_tax_id",
            reason: format!("longer than 13 digits: {issuer_tax_id}"),
        });
    }
    if numeric_code > MAX_NUMERIC_CODE {
        return Err(AccessKeyError::InvalidField {
            field: "numeric_code",
            reason: format!("more than 8 digits: {numeric_code}"),
        });
    }

    let mut base = String::with_capacity(ACCESS_KEY_LEN);
    base.push_str(&emission_date.format("%d%m%Y").to_string());
    base.push_str(document_type.code());
    base.push_str(&format!("{issuer_tax_id:0>13}"));
    base.push(sequence.environment().code());
    base.push_str(sequence.establishment());
    base.push_str(sequence.emission_point());
    base.push_str(&sequence.sequential_padded());
    base.push_str(&format!("{numeric_code:08}"));
    base.push(sequence.emission_type().code());

    if base.len() != BASE_LEN {
        return Err(AccessKeyError::InvalidLength(base.len() + 1));
    }

    let digit = check_digit(&base);
    base.push((b'0' + digit) as char);
    tracing::debug!(access_key = %base, "access key encoded");
    Ok(AccessKey(base))
}

/// Numbering series: document type, issuer, environment, establishment and emission point,
/// laid out as in the key. Sequentials are allocated per series.
pub fn series(
    document_type: DocumentType,
    issuer_tax_id: &str,
    environment: Environment,
    establishment: &str,
    emission_point: &str,
) -> String {
    format!(
        "{}{issuer_tax_id:0>13}{}{establishment}{emission_point}",
        document_type.code(),
        environment.code()
    )
}

/// Weighted modulo-11 check digit over an all-digit string.
///
/// Digits are weighted right to left with the cycle 2..=7; `11` maps to 0 and `10` to 1.
pub fn check_digit(base: &str) -> u8 {
    let mut sum: u32 = 0;
    let mut weight: u32 = 2;
    for b in base.bytes().rev() {
        sum += u32::from(b - b'0') * weight;
        weight = if weight == 7 { 2 } else { weight + 1 };
    }
    match 11 - (sum % 11) {
        11 => 0,
        10 => 1,
        d => d as u8,
    }
}

/// Checks length, charset and check digit of a candidate key.
pub fn validate(candidate: &str) -> Result<(), AccessKeyError> {
    let len = candidate.chars().count();
    if len != ACCESS_KEY_LEN {
        return Err(AccessKeyError::InvalidLength(len));
    }
    if let Some((position, found)) = candidate
        .chars()
        .enumerate()
        .find(|(_, c)| !c.is_ascii_digit())
    {
        return Err(AccessKeyError::InvalidCharacter { position, found });
    }
    let expected = check_digit(&candidate[..BASE_LEN]);
    let found = candidate.as_bytes()[BASE_LEN] - b'0';
    if expected != found {
        return Err(AccessKeyError::InvalidChecksum { expected, found });
    }
    Ok(())
}

pub fn is_valid(candidate: &str) -> bool {
    validate(candidate).is_ok()
}

/// Random 8-digit numeric code for a new key.
pub fn random_numeric_code() -> u32 {
    rand::thread_rng().gen_range(0..=MAX_NUMERIC_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(seq: u32) -> SequenceIdentity {
        SequenceIdentity::new("001", "002", seq, Environment::Test, EmissionType::Normal).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    #[test]
    fn encodes_fixed_width_fields() {
        let key = encode(&sequence(123), "1790011674001", date(), DocumentType::Invoice, 12345678)
            .unwrap();
        assert_eq!(key.as_str(), "1503202401179001167400110010020000001231234567819");
        assert_eq!(key.sequence(), Some(sequence(123)));
        assert_eq!(key.series(), "0117900116740011001002");
        assert_eq!(key.fiscal_number(), "0117900116740011001002000000123");
        assert_eq!(
            key.series(),
            series(DocumentType::Invoice, "1790011674001", Environment::Test, "001", "002")
        );
        assert_eq!(key.as_str().len(), ACCESS_KEY_LEN);
        assert_eq!(key.emission_date(), Some(date()));
        assert_eq!(key.document_type(), Some(DocumentType::Invoice));
        assert_eq!(key.issuer_tax_id(), "1790011674001");
        assert_eq!(key.environment(), Some(Environment::Test));
        assert_eq!(key.establishment(), "001");
        assert_eq!(key.emission_point(), "002");
        assert_eq!(key.sequential(), 123);
        assert_eq!(key.numeric_code(), "12345678");
        assert_eq!(key.emission_type(), Some(EmissionType::Normal));
    }

    #[test]
    fn pads_short_issuer_and_numeric_code() {
        let seq =
            SequenceIdentity::new("001", "001", 1, Environment::Production, EmissionType::Normal)
                .unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let key = encode(&seq, "992345678001", date, DocumentType::Invoice, 42).unwrap();
        assert_eq!(&key.as_str()[10..23], "0992345678001");
        assert_eq!(key.numeric_code(), "00000042");
        assert_eq!(key.check_digit(), 8);
    }

    #[test]
    fn check_digit_maps_eleven_to_zero_and_ten_to_one() {
        // sum % 11 == 0 -> 11 -> 0
        let zero = "150320240117900116740011001001000000009123456781";
        assert_eq!(check_digit(zero), 0);
        // sum % 11 == 1 -> 10 -> 1
        let one = "150320240117900116740011001001000000007123456781";
        assert_eq!(check_digit(one), 1);
        let plain = "150320240117900116740011001001000000001123456781";
        assert_eq!(check_digit(plain), 7);
    }

    #[test]
    fn validate_round_trips_encoded_keys() {
        for seq in [1, 7, 9, 123, 999_999_999] {
            let key =
                encode(&sequence(seq), "1790011674001", date(), DocumentType::Invoice, 87654321)
                    .unwrap();
            assert!(is_valid(key.as_str()), "{key}");
            assert_eq!(AccessKey::parse(key.as_str()).unwrap(), key);
        }
    }

    #[test]
    fn any_single_digit_flip_is_detected() {
        let key = "1503202401179001167400110010020000001231234567819";
        assert!(is_valid(key));
        for pos in 0..ACCESS_KEY_LEN {
            for d in b'0'..=b'9' {
                let mut bytes = key.as_bytes().to_vec();
                if bytes[pos] == d {
                    continue;
                }
                bytes[pos] = d;
                let mutated = String::from_utf8(bytes).unwrap();
                assert!(
                    matches!(validate(&mutated), Err(AccessKeyError::InvalidChecksum { .. })),
                    "flip at {pos} to {} went undetected",
                    d as char
                );
            }
        }
    }

    #[test]
    fn validate_reports_specific_errors() {
        assert_eq!(validate("123"), Err(AccessKeyError::InvalidLength(3)));
        let with_letter = format!("{}A", "1".repeat(48));
        assert_eq!(
            validate(&with_letter),
            Err(AccessKeyError::InvalidCharacter { position: 48, found: 'A' })
        );
        assert!(matches!(
            validate("1503202401179001167400110010020000001231234567810"),
            Err(AccessKeyError::InvalidChecksum { expected: 9, found: 0 })
        ));
    }

    #[test]
    fn rejects_oversized_fields() {
        assert!(matches!(
            encode(&sequence(1), "17900116740011", date(), DocumentType::Invoice, 1),
            Err(AccessKeyError::InvalidField { field: "issuer_tax_id", .. })
        ));
        assert!(matches!(
            encode(&sequence(1), "1790011674001", date(), DocumentType::Invoice, 100_000_000),
            Err(AccessKeyError::InvalidField { field: "numeric_code", .. })
        ));
    }

    #[test]
    fn serde_rejects_invalid_keys() {
        let ok: AccessKey =
            serde_json::from_str("\"1503202401179001167400110010020000001231234567819\"").unwrap();
        assert_eq!(ok.sequential(), 123);
        let bad_digit = "\"1503202401179001167400110010020000001231234567818\"";
        assert!(serde_json::from_str::<AccessKey>(bad_digit).is_err());
    }
}
