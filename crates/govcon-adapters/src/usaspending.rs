//! Federal spending-award catalog, partitioned by NAICS code or awarding agency.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use govcon_core::normalize::{clean_text, is_defense_agency, parse_date, parse_decimal};
use govcon_core::{CandidateIdentity, OpportunityCandidate, OpportunityFields, PartitionKey};
use govcon_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{decode_json, loose_string, trim_base_url, unsupported, AdapterContext, FetchError, RawRecord, SourceAdapter};

pub const SOURCE_ID: &str = "usaspending-awards";

const AWARD_FIELDS: &[&str] = &[
    "Award ID",
    "Recipient Name",
    "Start Date",
    "Award Amount",
    "Awarding Agency",
    "Awarding Sub Agency",
    "Contract Award Type",
    "Description",
    "NAICS",
    "PSC",
    "generated_internal_id",
];

#[derive(Debug, Clone, Deserialize)]
pub struct UsaSpendingConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub naics_codes: Vec<String>,
    #[serde(default)]
    pub agencies: Vec<String>,
    #[serde(default = "default_award_type_codes")]
    pub award_type_codes: Vec<String>,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_base_url() -> String {
    "https://api.usaspending.gov".to_string()
}

fn default_award_type_codes() -> Vec<String> {
    ["A", "B", "C", "D"].iter().map(ToString::to_string).collect()
}

fn default_lookback_days() -> i64 {
    365
}

fn default_page_size() -> usize {
    100
}

fn default_max_pages() -> usize {
    10
}

impl Default for UsaSpendingConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            naics_codes: Vec::new(),
            agencies: Vec::new(),
            award_type_codes: default_award_type_codes(),
            lookback_days: default_lookback_days(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SpendingAward {
    #[serde(default, deserialize_with = "loose_string")]
    pub internal_id: Option<String>,
    pub generated_internal_id: Option<String>,
    #[serde(rename = "Award ID")]
    pub award_id: Option<String>,
    #[serde(rename = "Recipient Name")]
    pub recipient_name: Option<String>,
    #[serde(rename = "Start Date")]
    pub start_date: Option<String>,
    #[serde(rename = "Award Amount", default, deserialize_with = "loose_string")]
    pub award_amount: Option<String>,
    #[serde(rename = "Awarding Agency")]
    pub awarding_agency: Option<String>,
    #[serde(rename = "Awarding Sub Agency")]
    pub awarding_sub_agency: Option<String>,
    #[serde(rename = "Contract Award Type")]
    pub contract_award_type: Option<String>,
    #[serde(rename = "Description")]
    pub description: Option<String>,
    #[serde(rename = "NAICS", default, deserialize_with = "loose_string")]
    pub naics: Option<String>,
    #[serde(rename = "PSC", default, deserialize_with = "loose_string")]
    pub psc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpendingPage {
    #[serde(default)]
    results: Vec<SpendingAward>,
    #[serde(default)]
    page_metadata: PageMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct PageMetadata {
    #[serde(rename = "hasNext", default)]
    has_next: bool,
}

pub struct UsaSpendingAdapter {
    http: Arc<HttpFetcher>,
    config: UsaSpendingConfig,
}

impl UsaSpendingAdapter {
    pub fn new(http: Arc<HttpFetcher>, config: UsaSpendingConfig) -> Self {
        Self { http, config }
    }

    fn search_url(&self) -> String {
        format!(
            "{}/api/v2/search/spending_by_award/",
            trim_base_url(&self.config.base_url)
        )
    }

    fn search_body(
        &self,
        partition: &PartitionKey,
        now: DateTime<Utc>,
        page: usize,
    ) -> Option<serde_json::Value> {
        let end = now.date_naive();
        let start = end - Duration::days(self.config.lookback_days.max(1));
        let mut filters = json!({
            "award_type_codes": self.config.award_type_codes,
            "time_period": [{
                "start_date": start.format("%Y-%m-%d").to_string(),
                "end_date": end.format("%Y-%m-%d").to_string(),
            }],
        });
        match partition {
            PartitionKey::Naics { code } => {
                filters["naics_codes"] = json!([code]);
            }
            PartitionKey::Agency { name } => {
                filters["agencies"] = json!([{
                    "type": "awarding",
                    "tier": "toptier",
                    "name": name,
                }]);
            }
            PartitionKey::AgencyYear { .. } => return None,
        }
        Some(json!({
            "filters": filters,
            "fields": AWARD_FIELDS,
            "page": page,
            "limit": self.config.page_size.max(1),
            "sort": "Award Amount",
            "order": "desc",
        }))
    }
}

#[async_trait]
impl SourceAdapter for UsaSpendingAdapter {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    fn list_partitions(&self) -> Vec<PartitionKey> {
        let by_naics = self
            .config
            .naics_codes
            .iter()
            .map(|code| PartitionKey::Naics { code: code.clone() });
        let by_agency = self
            .config
            .agencies
            .iter()
            .map(|name| PartitionKey::Agency { name: name.clone() });
        by_naics.chain(by_agency).collect()
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        partition: &PartitionKey,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let url = self.search_url();
        let max_pages = self.config.max_pages.max(1);
        let mut records = Vec::new();
        for page in 1..=max_pages {
            let request = self
                .search_body(partition, ctx.started_at, page)
                .ok_or_else(|| unsupported(SOURCE_ID, partition))?;
            let body = self
                .http
                .post_json(ctx.run_id, SOURCE_ID, &url, &request)
                .await?;
            let parsed: SpendingPage = decode_json(SOURCE_ID, partition, &body)?;
            let received = parsed.results.len();
            records.extend(parsed.results.into_iter().map(RawRecord::SpendingAward));
            debug!(partition = %partition, page, received, "fetched spending page");
            if !parsed.page_metadata.has_next || received == 0 {
                return Ok(records);
            }
        }
        warn!(
            partition = %partition,
            max_pages,
            fetched = records.len(),
            "page limit reached; remaining records not fetched"
        );
        Ok(records)
    }
}

pub(crate) fn to_candidate(record: &SpendingAward, observed_at: DateTime<Utc>) -> OpportunityCandidate {
    let agency = clean_text(record.awarding_agency.as_deref());
    let internal_id = clean_text(record.generated_internal_id.as_deref())
        .or_else(|| clean_text(record.internal_id.as_deref()));
    let source_url = clean_text(record.generated_internal_id.as_deref())
        .map(|id| format!("https://www.usaspending.gov/award/{id}"));

    OpportunityCandidate {
        source_id: SOURCE_ID.to_string(),
        identity: CandidateIdentity::SpendingAward {
            award_id: clean_text(record.award_id.as_deref()),
            internal_id,
        },
        observed_at,
        fields: OpportunityFields {
            description: clean_text(record.description.as_deref()),
            is_defense: agency.as_deref().map(is_defense_agency),
            agency,
            sub_agency: clean_text(record.awarding_sub_agency.as_deref()),
            notice_type: clean_text(record.contract_award_type.as_deref()),
            naics_code: clean_text(record.naics.as_deref()),
            classification_code: clean_text(record.psc.as_deref()),
            award_date: record.start_date.as_deref().and_then(parse_date),
            award_amount: record.award_amount.as_deref().and_then(parse_decimal),
            award_id: clean_text(record.award_id.as_deref()),
            contract_number: clean_text(record.award_id.as_deref()),
            awardee_name: clean_text(record.recipient_name.as_deref()),
            source_url,
            ..Default::default()
        },
    }
}
