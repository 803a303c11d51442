use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authority environment the document is issued against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Test,
    Production,
}

impl Environment {
    pub fn code(&self) -> char {
        match self {
            Environment::Test => '1',
            Environment::Production => '2',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            '1' => Some(Environment::Test),
            '2' => Some(Environment::Production),
            _ => None,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Test
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmissionType {
    #[default]
    Normal,
}

impl EmissionType {
    pub fn code(&self) -> char {
        match self {
            EmissionType::Normal => '1',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            '1' => Some(EmissionType::Normal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    #[default]
    Invoice,
    CreditNote,
    DebitNote,
    Waybill,
    Withholding,
}

impl DocumentType {
    pub fn code(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "01",
            DocumentType::CreditNote => "04",
            DocumentType::DebitNote => "05",
            DocumentType::Waybill => "06",
            DocumentType::Withholding => "07",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "01" => Some(DocumentType::Invoice),
            "04" => Some(DocumentType::CreditNote),
            "05" => Some(DocumentType::DebitNote),
            "06" => Some(DocumentType::Waybill),
            "07" => Some(DocumentType::Withholding),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentificationType {
    Ruc,
    Cedula,
    Passport,
    FinalConsumer,
    Foreign,
}

impl IdentificationType {
    pub fn code(&self) -> &'static str {
        match self {
            IdentificationType::Ruc => "04",
            IdentificationType::Cedula => "05",
            IdentificationType::Passport => "06",
            IdentificationType::FinalConsumer => "07",
            IdentificationType::Foreign => "08",
        }
    }
}

/// IVA rate applied to a line. Ordering follows the authority's percentage codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxRate {
    Zero,
    Twelve,
    Fourteen,
    Fifteen,
    Five,
    NotSubject,
    Exempt,
    Thirteen,
}

impl TaxRate {
    /// Tax family code; IVA is always 2.
    pub const IVA_CODE: &'static str = "2";

    pub fn code(&self) -> &'static str {
        match self {
            TaxRate::Zero => "0",
            TaxRate::Twelve => "2",
            TaxRate::Fourteen => "3",
            TaxRate::Fifteen => "4",
            TaxRate::Five => "5",
            TaxRate::NotSubject => "6",
            TaxRate::Exempt => "7",
            TaxRate::Thirteen => "10",
        }
    }

    pub fn percentage(&self) -> Decimal {
        match self {
            TaxRate::Zero | TaxRate::NotSubject | TaxRate::Exempt => Decimal::ZERO,
            TaxRate::Twelve => Decimal::from(12),
            TaxRate::Fourteen => Decimal::from(14),
            TaxRate::Fifteen => Decimal::from(15),
            TaxRate::Five => Decimal::from(5),
            TaxRate::Thirteen => Decimal::from(13),
        }
    }

    /// Unrounded tax due on `base` at this rate.
    pub fn tax_on(&self, base: Decimal) -> Decimal {
        base * self.percentage() / Decimal::ONE_HUNDRED
    }
}

/// Fixed-width numbering of one fiscal document. Immutable once an access key
/// has been derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceIdentity {
    establishment: String,
    emission_point: String,
    sequential: u32,
    environment: Environment,
    emission_type: EmissionType,
}

pub const MAX_SEQUENTIAL: u32 = 999_999_999;

impl SequenceIdentity {
    pub fn new(
        establishment: &str,
        emission_point: &str,
        sequential: u32,
        environment: Environment,
        emission_type: EmissionType,
    ) -> Result<Self, String> {
        if !is_three_digits(establishment) {
            return Err(format!("establishment code must be 3 digits: {establishment:?}"));
        }
        if !is_three_digits(emission_point) {
            return Err(format!("emission point code must be 3 digits: {emission_point:?}"));
        }
        if sequential == 0 || sequential > MAX_SEQUENTIAL {
            return Err(format!("sequential out of range: {sequential}"));
        }
        Ok(Self {
            establishment: establishment.to_string(),
            emission_point: emission_point.to_string(),
            sequential,
            environment,
            emission_type,
        })
    }

    pub fn establishment(&self) -> &str {
        &self.establishment
    }

    pub fn emission_point(&self) -> &str {
        &self.emission_point
    }

    pub fn sequential(&self) -> u32 {
        self.sequential
    }

    /// Sequential zero-padded to 9 digits.
    pub fn sequential_padded(&self) -> String {
        format!("{:09}", self.sequential)
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn emission_type(&self) -> EmissionType {
        self.emission_type
    }

    /// Human-facing document number, e.g. `001-002-000000123`.
    pub fn document_number(&self) -> String {
        format!(
            "{}-{}-{}",
            self.establishment,
            self.emission_point,
            self.sequential_padded()
        )
    }
}

fn is_three_digits(s: &str) -> bool {
    s.len() == 3 && s.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issuer {
    pub tax_id: String,
    pub legal_name: String,
    #[serde(default)]
    pub trade_name: Option<String>,
    pub head_office_address: String,
    #[serde(default)]
    pub establishment_address: Option<String>,
    #[serde(default)]
    pub keeps_accounting: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buyer {
    pub identification_type: IdentificationType,
    pub identification: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub code: Option<String>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    pub tax_rate: TaxRate,
    /// quantity × unit price − discount
    pub base: Decimal,
    pub tax_value: Decimal,
}

impl LineItem {
    /// Builds a line computing base and tax value from quantity, price and discount.
    pub fn priced(
        description: &str,
        quantity: Decimal,
        unit_price: Decimal,
        discount: Decimal,
        tax_rate: TaxRate,
    ) -> Self {
        let base = quantity * unit_price - discount;
        let tax_value = tax_rate.tax_on(base);
        Self {
            code: None,
            description: description.to_string(),
            quantity,
            unit_price,
            discount,
            tax_rate,
            base: round_money(base),
            tax_value: round_money(tax_value),
        }
    }

    /// quantity × unit price − discount, unrounded.
    pub fn exact_base(&self) -> Decimal {
        self.quantity * self.unit_price - self.discount
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTotal {
    pub rate: TaxRate,
    pub base: Decimal,
    pub tax: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    #[serde(default)]
    pub by_rate: Vec<RateTotal>,
    #[serde(default)]
    pub discount_total: Decimal,
    #[serde(default)]
    pub tip: Decimal,
    pub grand_total: Decimal,
}

impl Totals {
    /// Totals derived from the lines. Each rate's base is the exact sum of its line bases and
    /// its tax is that base times the rate, each rounded once.
    pub fn from_lines(lines: &[LineItem], tip: Decimal) -> Self {
        let mut grouped = std::collections::BTreeMap::<TaxRate, Decimal>::new();
        for line in lines {
            *grouped.entry(line.tax_rate).or_default() += line.exact_base();
        }
        let by_rate: Vec<RateTotal> = grouped
            .into_iter()
            .map(|(rate, base)| RateTotal {
                rate,
                base: round_money(base),
                tax: round_money(rate.tax_on(base)),
            })
            .collect();
        let discount_total = round_money(lines.iter().map(|l| l.discount).sum());
        let grand_total = by_rate.iter().map(|r| r.base + r.tax).sum::<Decimal>() + tip;
        Self {
            by_rate,
            discount_total,
            tip,
            grand_total: round_money(grand_total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Authority payment-method code, e.g. `01` cash, `19` card, `20` other.
    pub method: String,
    pub amount: Decimal,
    #[serde(default)]
    pub term: Option<u32>,
    #[serde(default)]
    pub time_unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalField {
    pub name: String,
    pub value: String,
}

/// A finalized invoice as handed over by the upstream invoicing module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub issuer: Issuer,
    pub buyer: Buyer,
    pub emission_date: NaiveDate,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub totals: Totals,
    #[serde(default)]
    pub payments: Vec<Payment>,
    #[serde(default)]
    pub additional_fields: Vec<AdditionalField>,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Half-away-from-zero rounding to cents.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Money tolerance for balance checks.
pub fn money_epsilon() -> Decimal {
    Decimal::new(1, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sequence_identity_rejects_bad_codes() {
        let new = |estab, pto, seq| {
            SequenceIdentity::new(estab, pto, seq, Environment::Test, EmissionType::Normal)
        };
        assert!(new("01", "001", 1).is_err());
        assert!(new("001", "0a1", 1).is_err());
        assert!(new("001", "001", 0).is_err());
        assert!(new("001", "001", 1_000_000_000).is_err());
    }

    #[test]
    fn sequence_identity_formats_document_number() {
        let seq = SequenceIdentity::new("001", "002", 123, Environment::Test, EmissionType::Normal)
            .unwrap();
        assert_eq!(seq.sequential_padded(), "000000123");
        assert_eq!(seq.document_number(), "001-002-000000123");
    }

    #[test]
    fn priced_line_computes_base_and_tax() {
        let line = LineItem::priced("Widget", dec!(3), dec!(10.50), dec!(1.50), TaxRate::Fifteen);
        assert_eq!(line.base, dec!(30.00));
        assert_eq!(line.tax_value, dec!(4.50));
    }

    #[test]
    fn totals_group_per_rate_and_round_once() {
        // three lines of 0.333 tax each: rounding the sum gives 1.00,
        // summing rounded lines would give 0.99
        let lines: Vec<LineItem> = (0..3)
            .map(|i| LineItem {
                code: None,
                description: format!("line {i}"),
                quantity: dec!(1),
                unit_price: dec!(2.775),
                discount: dec!(0),
                tax_rate: TaxRate::Twelve,
                base: dec!(2.775),
                tax_value: dec!(0.333),
            })
            .collect();
        let totals = Totals::from_lines(&lines, dec!(0));
        assert_eq!(totals.by_rate.len(), 1);
        assert_eq!(totals.by_rate[0].base, dec!(8.33));
        assert_eq!(totals.by_rate[0].tax, dec!(1.00));
        assert_eq!(totals.grand_total, dec!(9.33));
    }

    #[test]
    fn rate_tax_comes_from_the_cumulative_base() {
        // each line's own tax rounds to 0.00; the 0.12 base still owes 0.01
        let lines: Vec<LineItem> = (0..3)
            .map(|_| LineItem::priced("Clavo", dec!(1), dec!(0.04), dec!(0), TaxRate::Twelve))
            .collect();
        assert!(lines.iter().all(|l| l.tax_value.is_zero()));

        let totals = Totals::from_lines(&lines, dec!(0));
        assert_eq!(totals.by_rate[0].base, dec!(0.12));
        assert_eq!(totals.by_rate[0].tax, dec!(0.01));
        assert_eq!(totals.grand_total, dec!(0.13));
    }

    #[test]
    fn totals_keep_one_entry_per_rate() {
        let lines = vec![
            LineItem::priced("Pan", dec!(2), dec!(1.25), dec!(0), TaxRate::Zero),
            LineItem::priced("Cuaderno", dec!(1), dec!(10), dec!(0), TaxRate::Fifteen),
            LineItem::priced("Lapiz", dec!(4), dec!(0.50), dec!(0), TaxRate::Fifteen),
        ];
        let totals = Totals::from_lines(&lines, dec!(1));
        assert_eq!(totals.by_rate.len(), 2);
        let fifteen = totals.by_rate.iter().find(|r| r.rate == TaxRate::Fifteen).unwrap();
        assert_eq!(fifteen.base, dec!(12.00));
        assert_eq!(fifteen.tax, dec!(1.80));
        assert_eq!(totals.grand_total, dec!(17.30));
    }

    #[test]
    fn environment_codes_round_trip() {
        let production = Environment::Production;
        assert_eq!(Environment::from_code(production.code()), Some(production));
        assert_eq!(Environment::from_code('3'), None);
    }
}
