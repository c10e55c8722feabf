//! Core data model.
//!
//! A workflow request is something the portal automation must do exactly
//! once. It has identity (kind + fingerprint), an execution record tracking
//! its lifecycle, and a kind-specific payload the engine never interprets
//! beyond validation and fingerprinting.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::secrets::{ExposeSecret, SecretString};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::retry::FailureClass;

// ---------------------------------------------------------------------------
// Exchange identifier
// ---------------------------------------------------------------------------

/// Externally visible handle for one workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(pub Uuid);

impl ExchangeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExchangeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Validation(format!("bad exchange id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Workflow kind and payloads
// ---------------------------------------------------------------------------

/// Which portal workflow a request drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Debt statement calculation and payment slip generation.
    DebtCalculation,
    /// Sworn declaration payment slip generation.
    Declaration,
}

impl WorkflowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowKind::DebtCalculation => "debt_calculation",
            WorkflowKind::Declaration => "declaration",
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debt_calculation" => Ok(WorkflowKind::DebtCalculation),
            "declaration" => Ok(WorkflowKind::Declaration),
            other => Err(Error::Validation(format!("unknown workflow kind: {other}"))),
        }
    }
}

/// Accepted payment channels for a generated payment slip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Qr,
    Link,
    PagoMisCuentas,
    InterBanking,
    XnGroup,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Qr => "qr",
            PaymentMethod::Link => "link",
            PaymentMethod::PagoMisCuentas => "pago_mis_cuentas",
            PaymentMethod::InterBanking => "inter_banking",
            PaymentMethod::XnGroup => "xn_group",
        }
    }
}

/// A fiscal month in `MM/YYYY` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    // Field order matters: derived Ord compares year first.
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(month: u32, year: i32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::Validation(format!(
                "period month must be between 01 and 12, got {month:02}"
            )));
        }
        if !(2000..=2099).contains(&year) {
            return Err(Error::Validation(format!(
                "period year must be between 2000 and 2099, got {year}"
            )));
        }
        Ok(Self { year, month })
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (month, year) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::Validation(format!("period must be MM/YYYY, got {s:?}")))?;
        if month.len() != 2 || year.len() != 4 {
            return Err(Error::Validation(format!("period must be MM/YYYY, got {s:?}")));
        }
        let month = month
            .parse()
            .map_err(|_| Error::Validation(format!("bad period month in {s:?}")))?;
        let year = year
            .parse()
            .map_err(|_| Error::Validation(format!("bad period year in {s:?}")))?;
        Self::new(month, year)
    }
}

impl TryFrom<String> for Period {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Period> for String {
    fn from(p: Period) -> Self {
        p.to_string()
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}/{:04}", self.month, self.year)
    }
}

/// Portal dates arrive as `DD/MM/YYYY` or ISO `YYYY-MM-DD`; both normalise
/// to a calendar date and serialize back as ISO.
pub mod portal_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Option<NaiveDate> {
        let s = s.trim();
        // Tolerate a trailing time component on ISO input.
        let date_part = s.split(['T', ' ']).next().unwrap_or(s);
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(date_part, "%d/%m/%Y"))
            .ok()
    }

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format("%Y-%m-%d").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("date must be DD/MM/YYYY or YYYY-MM-DD, got {raw:?}"))
        })
    }
}

/// One debt-calculation line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtCalculationEntry {
    pub period_from: Period,
    pub period_to: Period,
    #[serde(with = "portal_date")]
    pub calculation_date: NaiveDate,
    #[serde(with = "portal_date")]
    pub expiration_date: NaiveDate,
    pub payment_method: PaymentMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxpayer_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_type: Option<String>,
    #[serde(default)]
    pub include_interest: bool,
}

/// One sworn-declaration line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclarationEntry {
    pub payment_method: PaymentMethod,
    #[serde(with = "portal_date")]
    pub expiration_date: NaiveDate,
    pub form_number: String,
    pub payment_type_code: String,
    pub taxpayer_id: String,
    pub concept: String,
    pub sub_concept: String,
    pub fiscal_period: String,
    pub amount: Decimal,
    pub tax_code: String,
}

/// Kind-specific line items. The tag doubles as the workflow kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entries", rename_all = "snake_case")]
pub enum WorkflowPayload {
    DebtCalculation(Vec<DebtCalculationEntry>),
    Declaration(Vec<DeclarationEntry>),
}

impl WorkflowPayload {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            WorkflowPayload::DebtCalculation(_) => WorkflowKind::DebtCalculation,
            WorkflowPayload::Declaration(_) => WorkflowKind::Declaration,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WorkflowPayload::DebtCalculation(entries) => entries.len(),
            WorkflowPayload::Declaration(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle the runner resolves to the taxpayer's portal secret.
///
/// Accepted on input but never serialized, so it stays out of stored
/// records, `request.json` and published events. `Debug` is redacted.
#[derive(Deserialize)]
#[serde(from = "String")]
pub struct SecretRef(SecretString);

impl SecretRef {
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<String> for SecretRef {
    fn from(s: String) -> Self {
        Self(SecretString::from(s))
    }
}

impl From<&str> for SecretRef {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl Clone for SecretRef {
    fn clone(&self) -> Self {
        Self::from(self.expose())
    }
}

impl PartialEq for SecretRef {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for SecretRef {}

impl std::fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretRef([REDACTED])")
    }
}

/// Who the workflow runs as.
///
/// `secret_ref` is present on submitted requests only. Records read back
/// from the store carry `None`; the runner then resolves credentials from
/// the taxpayer id alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub taxpayer_id: String,
    #[serde(default, skip_serializing)]
    pub secret_ref: Option<SecretRef>,
}

/// A normalized, immutable workflow request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub credentials: CredentialRef,
    pub workflow: WorkflowPayload,
}

impl WorkflowRequest {
    pub fn new(credentials: CredentialRef, workflow: WorkflowPayload) -> Self {
        Self {
            credentials,
            workflow,
        }
    }

    pub fn kind(&self) -> WorkflowKind {
        self.workflow.kind()
    }

    /// The same request with the secret reference dropped, as persisted.
    pub fn without_secret(&self) -> Self {
        let mut request = self.clone();
        request.credentials.secret_ref = None;
        request
    }

    /// Latest expiration date across all entries.
    pub fn latest_expiration(&self) -> Option<NaiveDate> {
        match &self.workflow {
            WorkflowPayload::DebtCalculation(entries) => {
                entries.iter().map(|e| e.expiration_date).max()
            }
            WorkflowPayload::Declaration(entries) => {
                entries.iter().map(|e| e.expiration_date).max()
            }
        }
    }

    /// Parse a request from JSON and validate it.
    pub fn from_json(raw: &str) -> Result<Self> {
        let request: Self = serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("malformed request: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    /// Kind-specific validation. Runs before fingerprinting.
    pub fn validate(&self) -> Result<()> {
        validate_taxpayer_id("credentials.taxpayer_id", &self.credentials.taxpayer_id)?;
        match &self.credentials.secret_ref {
            Some(secret) if !secret.expose().trim().is_empty() => {}
            _ => return Err(Error::Validation("credentials.secret_ref is empty".to_string())),
        }
        if self.workflow.is_empty() {
            return Err(Error::Validation(format!(
                "{} request has no entries",
                self.kind()
            )));
        }

        match &self.workflow {
            WorkflowPayload::DebtCalculation(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    if entry.period_from > entry.period_to {
                        return Err(Error::Validation(format!(
                            "entries[{i}]: period_from {} is after period_to {}",
                            entry.period_from, entry.period_to
                        )));
                    }
                    // Periods built in code bypass the string parser.
                    Period::new(entry.period_from.month, entry.period_from.year)?;
                    Period::new(entry.period_to.month, entry.period_to.year)?;
                }
            }
            WorkflowPayload::Declaration(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    validate_taxpayer_id(&format!("entries[{i}].taxpayer_id"), &entry.taxpayer_id)?;
                    for (name, value) in [
                        ("form_number", &entry.form_number),
                        ("payment_type_code", &entry.payment_type_code),
                        ("concept", &entry.concept),
                        ("sub_concept", &entry.sub_concept),
                        ("fiscal_period", &entry.fiscal_period),
                        ("tax_code", &entry.tax_code),
                    ] {
                        if value.trim().is_empty() {
                            return Err(Error::Validation(format!("entries[{i}].{name} is empty")));
                        }
                    }
                    if entry.amount <= Decimal::ZERO {
                        return Err(Error::Validation(format!(
                            "entries[{i}].amount must be positive, got {}",
                            entry.amount
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_taxpayer_id(field: &str, value: &str) -> Result<()> {
    if value.len() == 11 && value.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(Error::Validation(format!("{field} must be 11 digits, got {value:?}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Persisted lifecycle status of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Reserved, runner not yet invoked.
    Pending,
    /// Runner invoked at least once; retries happen without a status change.
    Running,
    /// Runner succeeded. Terminal.
    Completed,
    /// Retries exhausted or terminal failure. Terminal.
    Failed,
}

impl Status {
    pub const LIVE: [Status; 2] = [Status::Pending, Status::Running];

    /// Can transition from self to `to`?
    ///
    /// `Running -> Running` is the in-place progress update (retry count).
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Running)
                | (Running, Completed)
                | (Pending, Completed)
                | (Running, Failed)
                | (Pending, Failed)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "running" => Ok(Status::Running),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(Error::Other(format!("unknown status: {other}"))),
        }
    }
}

/// Status surfaced in an admission response. `Rejected` is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStatus {
    Pending,
    Rejected,
}

/// What `submit` hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admission {
    pub exchange_id: ExchangeId,
    pub status: AdmissionStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Execution record
// ---------------------------------------------------------------------------

/// Why an execution failed, as stored on the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub class: FailureClass,
    pub message: String,
    pub attempts: u32,
}

/// The unit of orchestration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub exchange_id: ExchangeId,
    pub fingerprint: Fingerprint,
    pub kind: WorkflowKind,
    pub request: WorkflowRequest,
    pub status: Status,
    /// Retries spent on this fingerprint, cumulative across re-admissions.
    pub retry_count: u32,
    /// The failed execution this one re-admits, if any.
    pub retry_of: Option<ExchangeId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal records may be purged once this has passed.
    #[serde(default)]
    pub retain_until: Option<DateTime<Utc>>,
    /// Kind-specific result payload. Opaque to the engine.
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorDetail>,
}

impl ExecutionRecord {
    /// A fresh `pending` record for an admitted request.
    pub fn pending(request: WorkflowRequest, fingerprint: Fingerprint) -> Self {
        let now = Utc::now();
        Self {
            exchange_id: ExchangeId::new(),
            fingerprint,
            kind: request.kind(),
            request,
            status: Status::Pending,
            retry_count: 0,
            retry_of: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            retain_until: None,
            result: None,
            error: None,
        }
    }

    /// A `pending` re-admission of a failed record under the same fingerprint.
    pub fn readmission_of(failed: &ExecutionRecord) -> Self {
        let mut record = Self::pending(failed.request.clone(), failed.fingerprint.clone());
        record.retry_of = Some(failed.exchange_id);
        record.retry_count = failed.retry_count + 1;
        record
    }

    /// Is this record live (pending or running)?
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Apply a patch in place. The store sets `updated_at`.
    pub fn apply(&mut self, status: Status, patch: &RecordPatch, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        if let Some(n) = patch.retry_count {
            self.retry_count = n;
        }
        if let Some(ref result) = patch.result {
            self.result = Some(result.clone());
        }
        if let Some(ref error) = patch.error {
            self.error = Some(error.clone());
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(at) = patch.retain_until {
            self.retain_until = Some(at);
        }
    }
}

/// Fields a transition may set alongside the status change.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub retry_count: Option<u32>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorDetail>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retain_until: Option<DateTime<Utc>>,
}

impl RecordPatch {
    pub fn retry_count(mut self, n: u32) -> Self {
        self.retry_count = Some(n);
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: ErrorDetail) -> Self {
        self.error = Some(error);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn retain_until(mut self, at: DateTime<Utc>) -> Self {
        self.retain_until = Some(at);
        self
    }
}
