//! Content fingerprints for deduplication.
//!
//! A fingerprint is the SHA-256 of a canonical text rendering of the
//! request: kind, taxpayer, then one line per entry with fields in a fixed
//! order. Entry lines are sorted so input ordering never matters.
//!
//! Only fields that change what the portal produces are hashed. The secret
//! handle, a debt entry's `include_interest` flag and a declaration's
//! payment method are presentation choices and stay out.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::{DebtCalculationEntry, DeclarationEntry, WorkflowPayload, WorkflowRequest};

/// Hex-encoded SHA-256 digest identifying a request's significant content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrate a fingerprint read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 12 hex chars
        let end = self.0.len().min(12);
        f.write_str(&self.0[..end])
    }
}

/// Compute the fingerprint of a request. Total and deterministic.
pub fn fingerprint(request: &WorkflowRequest) -> Fingerprint {
    let canonical = canonical_text(request);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// The text that gets hashed. Exposed for diagnostics.
pub fn canonical_text(request: &WorkflowRequest) -> String {
    let mut lines: Vec<String> = match &request.workflow {
        WorkflowPayload::DebtCalculation(entries) => entries.iter().map(debt_line).collect(),
        WorkflowPayload::Declaration(entries) => entries.iter().map(declaration_line).collect(),
    };
    lines.sort_unstable();

    let mut out = format!(
        "kind={}\ntaxpayer={}\n",
        request.kind(),
        text(&request.credentials.taxpayer_id)
    );
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn debt_line(entry: &DebtCalculationEntry) -> String {
    format!(
        "period_from={}|period_to={}|calculation_date={}|expiration_date={}|payment_method={}|taxpayer_type{}|tax_type{}",
        entry.period_from,
        entry.period_to,
        entry.calculation_date,
        entry.expiration_date,
        entry.payment_method.as_str(),
        optional(&entry.taxpayer_type),
        optional(&entry.tax_type),
    )
}

fn declaration_line(entry: &DeclarationEntry) -> String {
    format!(
        "taxpayer_id={}|concept={}|sub_concept={}|fiscal_period={}|amount={}|tax_code={}|expiration_date={}|form_number={}|payment_type_code={}",
        text(&entry.taxpayer_id),
        text(&entry.concept),
        text(&entry.sub_concept),
        text(&entry.fiscal_period),
        amount(entry.amount),
        text(&entry.tax_code),
        entry.expiration_date,
        text(&entry.form_number),
        text(&entry.payment_type_code),
    )
}

/// Free text: trimmed, upper-cased, `|` and newlines escaped so a field can
/// never forge a separator.
fn text(value: &str) -> String {
    value
        .trim()
        .to_uppercase()
        .replace('\\', "\\\\")
        .replace('|', "\\|")
        .replace('\n', "\\n")
}

/// Renders as `=VALUE` when present and a bare `-` when missing or blank,
/// so no value can read as absent.
fn optional(value: &Option<String>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => format!("={}", text(v)),
        _ => "-".to_string(),
    }
}

/// `105`, `105.0` and `105.00` all render as `105`.
fn amount(value: Decimal) -> String {
    value.normalize().to_string()
}
