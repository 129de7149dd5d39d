//! Small-business research award catalog, partitioned by agency and award year.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govcon_core::normalize::{clean_text, detect_phase, is_defense_agency, parse_date, parse_decimal, parse_flag};
use govcon_core::{CandidateIdentity, OpportunityCandidate, OpportunityFields, PartitionKey};
use govcon_storage::HttpFetcher;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{decode_json, loose_string, trim_base_url, unsupported, AdapterContext, FetchError, RawRecord, SourceAdapter};

pub const SOURCE_ID: &str = "sbir-awards";

#[derive(Debug, Clone, Deserialize)]
pub struct SbirConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub agencies: Vec<String>,
    #[serde(default)]
    pub years: Vec<i32>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_base_url() -> String {
    "https://api.www.sbir.gov".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_max_pages() -> usize {
    50
}

impl Default for SbirConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            agencies: Vec::new(),
            years: Vec::new(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SbirAward {
    pub firm: Option<String>,
    pub award_title: Option<String>,
    pub agency: Option<String>,
    pub branch: Option<String>,
    pub phase: Option<String>,
    pub program: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub agency_tracking_number: Option<String>,
    pub contract: Option<String>,
    pub proposal_award_date: Option<String>,
    pub contract_end_date: Option<String>,
    pub solicitation_number: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub solicitation_year: Option<String>,
    pub topic_code: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub award_year: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub award_amount: Option<String>,
    pub uei: Option<String>,
    pub hubzone_owned: Option<String>,
    pub women_owned: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub award_link: Option<String>,
}

pub struct SbirAwardsAdapter {
    http: Arc<HttpFetcher>,
    config: SbirConfig,
}

impl SbirAwardsAdapter {
    pub fn new(http: Arc<HttpFetcher>, config: SbirConfig) -> Self {
        Self { http, config }
    }

    fn awards_url(&self) -> String {
        format!("{}/public/api/awards", trim_base_url(&self.config.base_url))
    }

    fn awards_query(&self, agency: &str, year: i32, start: usize) -> Vec<(&'static str, String)> {
        vec![
            ("agency", agency.to_string()),
            ("year", year.to_string()),
            ("start", start.to_string()),
            ("rows", self.config.page_size.max(1).to_string()),
        ]
    }
}

#[async_trait]
impl SourceAdapter for SbirAwardsAdapter {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    fn list_partitions(&self) -> Vec<PartitionKey> {
        self.config
            .agencies
            .iter()
            .flat_map(|agency| {
                self.config.years.iter().map(move |year| PartitionKey::AgencyYear {
                    agency: agency.clone(),
                    year: *year,
                })
            })
            .collect()
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        partition: &PartitionKey,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let PartitionKey::AgencyYear { agency, year } = partition else {
            return Err(unsupported(SOURCE_ID, partition));
        };

        let url = self.awards_url();
        let page_size = self.config.page_size.max(1);
        let max_pages = self.config.max_pages.max(1);
        let mut records = Vec::new();
        for page in 0..max_pages {
            let query = self.awards_query(agency, *year, records.len());
            let body = self.http.get_bytes(ctx.run_id, SOURCE_ID, &url, &query).await?;
            let awards: Vec<SbirAward> = decode_json(SOURCE_ID, partition, &body)?;
            let received = awards.len();
            records.extend(awards.into_iter().map(RawRecord::SbirAward));
            debug!(partition = %partition, page, received, "fetched awards page");
            if received < page_size {
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

pub(crate) fn to_candidate(record: &SbirAward, observed_at: DateTime<Utc>) -> OpportunityCandidate {
    let agency = clean_text(record.agency.as_deref());

    OpportunityCandidate {
        source_id: SOURCE_ID.to_string(),
        identity: CandidateIdentity::AgencyTracking {
            agency: agency.clone(),
            tracking_number: clean_text(record.agency_tracking_number.as_deref()),
        },
        observed_at,
        fields: OpportunityFields {
            title: clean_text(record.award_title.as_deref()),
            description: clean_text(record.abstract_text.as_deref()),
            is_defense: agency.as_deref().map(is_defense_agency),
            agency,
            sub_agency: clean_text(record.branch.as_deref()),
            notice_type: clean_text(record.program.as_deref()).map(|p| format!("{p} Award")),
            topic_code: clean_text(record.topic_code.as_deref()),
            award_date: record.proposal_award_date.as_deref().and_then(parse_date),
            award_amount: record.award_amount.as_deref().and_then(parse_decimal),
            solicitation_number: clean_text(record.solicitation_number.as_deref()),
            contract_number: clean_text(record.contract.as_deref()),
            awardee_name: clean_text(record.firm.as_deref()),
            source_url: clean_text(record.award_link.as_deref()),
            is_sbir: Some(true),
            program_phase: record.phase.as_deref().and_then(detect_phase),
            is_women_owned: record.women_owned.as_deref().and_then(parse_flag),
            is_hubzone_owned: record.hubzone_owned.as_deref().and_then(parse_flag),
            ..Default::default()
        },
    }
}
