use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::error::{ExportError, Result};

pub const PAYMENT_CHANNEL_COLUMN: &str = "Канал оплаты";
pub const PAYMENT_METHOD_COLUMN: &str = "Способ оплаты";
pub const PURCHASE_DETAILS_COLUMN: &str = "Детали покупки";
pub const AMOUNT_COLUMN: &str = "Сумма операции";
pub const DATE_COLUMN: &str = "Дата операции";
pub const OPERATION_NUMBER_COLUMN: &str = "Номер операции";

const REQUIRED_COLUMNS: [&str; 6] = [
    PAYMENT_CHANNEL_COLUMN,
    PAYMENT_METHOD_COLUMN,
    PURCHASE_DETAILS_COLUMN,
    AMOUNT_COLUMN,
    DATE_COLUMN,
    OPERATION_NUMBER_COLUMN,
];

/// Only rows paid through this channel are exported
pub const REMOTE_PAYMENT_MARKER: &str = "Удаленная оплата";

/// Rows with fewer cells are incomplete and ignored
pub const MIN_ROW_LEN: usize = 8;

const KASPI_RED: &str = "Kaspi Red";
const KASPI_GOLD: &str = "Kaspi Gold";

const KASPI_RED_SOURCES: &[&str] = &[
    "Kaspi Kredit",
    "Kaspi Red",
    "Кредит на Покупки",
    "Credit for Purchases",
];
const KASPI_GOLD_SOURCES: &[&str] = &["Счет в Kaspi Pay", "Kaspi Pay Account", "Kaspi Gold"];

/// Column name to column position, built from the header row of the sheet
#[derive(Debug, Clone, Default)]
pub struct HeaderIndex {
    positions: HashMap<String, usize>,
}

impl HeaderIndex {
    pub fn from_header<S: AsRef<str>>(header: &[S]) -> Self {
        let mut positions = HashMap::with_capacity(header.len());
        for (i, name) in header.iter().enumerate() {
            positions.entry(name.as_ref().to_owned()).or_insert(i);
        }
        Self { positions }
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    /// Looks up every column the classifier needs, reporting all the missing ones at once
    pub fn resolve(&self) -> Result<Columns> {
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|column| self.position(column).is_none())
            .map(|column| (*column).to_owned())
            .collect();
        if !missing.is_empty() {
            return Err(ExportError::Schema { missing });
        }
        let position = |column: &str| self.position(column).unwrap_or_default();
        Ok(Columns {
            payment_channel: position(PAYMENT_CHANNEL_COLUMN),
            payment_method: position(PAYMENT_METHOD_COLUMN),
            purchase_details: position(PURCHASE_DETAILS_COLUMN),
            amount: position(AMOUNT_COLUMN),
            date: position(DATE_COLUMN),
            operation_number: position(OPERATION_NUMBER_COLUMN),
        })
    }
}

/// Positions of the required columns, validated against the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Columns {
    payment_channel: usize,
    payment_method: usize,
    purchase_details: usize,
    amount: usize,
    date: usize,
    operation_number: usize,
}

/// Canonical payment method a record is grouped under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PaymentBucket {
    KaspiRed,
    KaspiGold,
    Other(String),
}

impl PaymentBucket {
    pub fn from_method(method: &str) -> Self {
        if KASPI_RED_SOURCES.contains(&method) {
            Self::KaspiRed
        } else if KASPI_GOLD_SOURCES.contains(&method) {
            Self::KaspiGold
        } else {
            Self::Other(method.to_owned())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::KaspiRed => KASPI_RED,
            Self::KaspiGold => KASPI_GOLD,
            Self::Other(name) => name,
        }
    }
}

/// One line of a bucket file. Field order is the column order of the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputRecord {
    pub reference: String,
    pub date: String,
    pub amount: Decimal,
    pub operation_number: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketedRecord {
    pub bucket: PaymentBucket,
    pub record: OutputRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ShortRow,
    NotRemotePayment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Record(BucketedRecord),
    Skip(SkipReason),
}

impl Columns {
    /// Decides what happens to a data row. `row_number` is the 1-based spreadsheet row, used in
    /// error messages only.
    pub fn classify<S: AsRef<str>>(&self, row_number: usize, row: &[S]) -> Result<RowOutcome> {
        if row.len() < MIN_ROW_LEN {
            return Ok(RowOutcome::Skip(SkipReason::ShortRow));
        }
        if cell(row, self.payment_channel) != REMOTE_PAYMENT_MARKER {
            return Ok(RowOutcome::Skip(SkipReason::NotRemotePayment));
        }

        let method = cell(row, self.payment_method);
        let bucket = PaymentBucket::from_method(method);

        let reference = extract_reference(cell(row, self.purchase_details)).to_owned();

        let amount_text = cell(row, self.amount);
        let amount = parse_amount(amount_text)
            .map(round_amount)
            .map_err(|source| ExportError::AmountParse {
                row: row_number,
                text: amount_text.to_owned(),
                source,
            })?;

        Ok(RowOutcome::Record(BucketedRecord {
            bucket,
            record: OutputRecord {
                reference,
                date: cell(row, self.date).to_owned(),
                amount,
                operation_number: cell(row, self.operation_number).to_owned(),
                method: method.to_owned(),
            },
        }))
    }
}

fn cell<S: AsRef<str>>(row: &[S], position: usize) -> &str {
    row.get(position).map_or("", AsRef::as_ref)
}

/// First run of ASCII digits in `text`, or an empty string
pub fn extract_reference(text: &str) -> &str {
    let Some(start) = text.find(|c: char| c.is_ascii_digit()) else {
        return "";
    };
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Parses an amount as exported, e.g. `"15 000"`, `"1,234"` or `"1 234,56 ₸"`.
///
/// Spaces are dropped and commas are thousands separators, except for a final comma followed by
/// one or two digits which separates the decimals.
pub fn parse_amount(text: &str) -> Result<Decimal, rust_decimal::Error> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}'))
        .collect();
    let cleaned = cleaned.trim_end_matches('₸');
    let normalized = match cleaned.rsplit_once(',') {
        Some((int_part, fract_part))
            if !int_part.contains([',', '.'])
                && (1..=2).contains(&fract_part.len())
                && fract_part.bytes().all(|b| b.is_ascii_digit()) =>
        {
            format!("{int_part}.{fract_part}")
        }
        _ => cleaned.replace(',', ""),
    };
    Decimal::from_str(&normalized)
}

/// Rounds to a whole amount, half to even
pub fn round_amount(amount: Decimal) -> Decimal {
    let rounded = amount.round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
    if rounded.is_zero() {
        Decimal::ZERO
    } else {
        rounded
    }
}
