//! Canonical domain model for government-contracting opportunity ingest.

pub mod normalize;

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use normalize::ProgramPhase;

pub const CRATE_NAME: &str = "govcon-core";

/// Prefix applied to spending-award keys so they never collide with other sources.
pub const SPENDING_KEY_PREFIX: &str = "usaspending";

/// Prefix applied to agency/tracking-number keys from the small-business award catalog.
pub const SBIR_KEY_PREFIX: &str = "sbir";

/// A subdivision of one source's data fetched as an independent unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionKey {
    Naics { code: String },
    AgencyYear { agency: String, year: i32 },
    Agency { name: String },
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Naics { code } => write!(f, "naics:{code}"),
            PartitionKey::AgencyYear { agency, year } => write!(f, "agency:{agency}/{year}"),
            PartitionKey::Agency { name } => write!(f, "agency:{name}"),
        }
    }
}

/// Source-specific identity fields carried by a candidate, before a key is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateIdentity {
    Solicitation {
        solicitation_number: Option<String>,
    },
    AgencyTracking {
        agency: Option<String>,
        tracking_number: Option<String>,
    },
    SpendingAward {
        award_id: Option<String>,
        internal_id: Option<String>,
    },
}

/// Identity used to deduplicate candidates against canonical records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Computes the natural key for an identity, or `None` when the identity is
    /// incomplete (blank solicitation number, missing agency or tracking number,
    /// or a spending award with neither identifier).
    pub fn from_identity(identity: &CandidateIdentity) -> Option<Self> {
        match identity {
            CandidateIdentity::Solicitation {
                solicitation_number,
            } => non_blank(solicitation_number.as_deref()).map(|n| Self(n.to_string())),
            CandidateIdentity::AgencyTracking {
                agency,
                tracking_number,
            } => {
                let agency = non_blank(agency.as_deref())?;
                let tracking = non_blank(tracking_number.as_deref())?;
                Some(Self(format!(
                    "{SBIR_KEY_PREFIX}:{}:{}",
                    escape_key_part(agency),
                    escape_key_part(tracking)
                )))
            }
            CandidateIdentity::SpendingAward {
                award_id,
                internal_id,
            } => non_blank(award_id.as_deref())
                .or_else(|| non_blank(internal_id.as_deref()))
                .map(|id| Self(format!("{SPENDING_KEY_PREFIX}:{id}"))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Percent-escapes the separator so composite keys split unambiguously.
fn escape_key_part(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Normalized, source-agnostic opportunity attributes. Every field is optional;
/// `None` means "not observed", never "cleared".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpportunityFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub agency: Option<String>,
    pub sub_agency: Option<String>,
    pub notice_type: Option<String>,
    pub naics_code: Option<String>,
    pub classification_code: Option<String>,
    pub set_aside: Option<String>,
    pub topic_code: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub response_deadline: Option<NaiveDate>,
    pub archive_date: Option<NaiveDate>,
    pub award_date: Option<NaiveDate>,
    pub award_amount: Option<Decimal>,
    pub estimated_value_min: Option<Decimal>,
    pub estimated_value_max: Option<Decimal>,
    pub solicitation_number: Option<String>,
    pub contract_number: Option<String>,
    pub award_id: Option<String>,
    pub awardee_name: Option<String>,
    pub source_url: Option<String>,
    pub is_sbir: Option<bool>,
    pub program_phase: Option<ProgramPhase>,
    pub is_defense: Option<bool>,
    pub is_active: Option<bool>,
    pub is_women_owned: Option<bool>,
    pub is_hubzone_owned: Option<bool>,
}

fn override_field_value<T: Clone>(field: &mut Option<T>, value: &Option<T>) {
    if let Some(value) = value {
        *field = Some(value.clone());
    }
}

impl OpportunityFields {
    /// Overlays every field present in `observed`; absent fields keep their value.
    pub fn merge_from(&mut self, observed: &OpportunityFields) {
        override_field_value(&mut self.title, &observed.title);
        override_field_value(&mut self.description, &observed.description);
        override_field_value(&mut self.agency, &observed.agency);
        override_field_value(&mut self.sub_agency, &observed.sub_agency);
        override_field_value(&mut self.notice_type, &observed.notice_type);
        override_field_value(&mut self.naics_code, &observed.naics_code);
        override_field_value(&mut self.classification_code, &observed.classification_code);
        override_field_value(&mut self.set_aside, &observed.set_aside);
        override_field_value(&mut self.topic_code, &observed.topic_code);
        override_field_value(&mut self.posted_date, &observed.posted_date);
        override_field_value(&mut self.response_deadline, &observed.response_deadline);
        override_field_value(&mut self.archive_date, &observed.archive_date);
        override_field_value(&mut self.award_date, &observed.award_date);
        override_field_value(&mut self.award_amount, &observed.award_amount);
        override_field_value(&mut self.estimated_value_min, &observed.estimated_value_min);
        override_field_value(&mut self.estimated_value_max, &observed.estimated_value_max);
        override_field_value(&mut self.solicitation_number, &observed.solicitation_number);
        override_field_value(&mut self.contract_number, &observed.contract_number);
        override_field_value(&mut self.award_id, &observed.award_id);
        override_field_value(&mut self.awardee_name, &observed.awardee_name);
        override_field_value(&mut self.source_url, &observed.source_url);
        override_field_value(&mut self.is_sbir, &observed.is_sbir);
        override_field_value(&mut self.program_phase, &observed.program_phase);
        override_field_value(&mut self.is_defense, &observed.is_defense);
        override_field_value(&mut self.is_active, &observed.is_active);
        override_field_value(&mut self.is_women_owned, &observed.is_women_owned);
        override_field_value(&mut self.is_hubzone_owned, &observed.is_hubzone_owned);
    }
}

/// Normalized handoff contract from adapters into reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityCandidate {
    pub source_id: String,
    pub identity: CandidateIdentity,
    pub observed_at: DateTime<Utc>,
    pub fields: OpportunityFields,
}

impl OpportunityCandidate {
    pub fn natural_key(&self) -> Option<NaturalKey> {
        NaturalKey::from_identity(&self.identity)
    }
}

/// The single merged record stored per natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalOpportunity {
    pub id: Uuid,
    pub natural_key: String,
    pub source_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: OpportunityFields,
}

impl CanonicalOpportunity {
    pub fn from_candidate(
        key: &NaturalKey,
        candidate: &OpportunityCandidate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            natural_key: key.to_string(),
            source_name: candidate.source_id.clone(),
            created_at: now,
            updated_at: now,
            fields: candidate.fields.clone(),
        }
    }

    /// Applies a later observation of the same key. Identity and `created_at`
    /// never change.
    pub fn apply_observation(&mut self, candidate: &OpportunityCandidate, now: DateTime<Utc>) {
        self.fields.merge_from(&candidate.fields);
        self.source_name = candidate.source_id.clone();
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    IdentityMissing,
    StoreFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Skipped(SkipReason),
}

/// Summary of one ingestion run. Returned and logged, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngestionRunResult {
    pub new_count: usize,
    pub updated_count: usize,
    pub skipped_count: usize,
    pub failed_partitions: usize,
    pub duration_ms: u64,
}

impl IngestionRunResult {
    pub fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Created => self.new_count += 1,
            ReconcileOutcome::Updated => self.updated_count += 1,
            ReconcileOutcome::Skipped(_) => self.skipped_count += 1,
        }
    }

    /// Sums counts. Duration is left to the caller, which measures wall-clock.
    pub fn absorb(&mut self, other: &IngestionRunResult) {
        self.new_count += other.new_count;
        self.updated_count += other.updated_count;
        self.skipped_count += other.skipped_count;
        self.failed_partitions += other.failed_partitions;
    }
}
