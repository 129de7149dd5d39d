//! Federal opportunity catalog (SAM.gov opportunities search), partitioned by NAICS code.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use govcon_core::normalize::{
    clean_text, detect_phase, is_defense_agency, mentions_sbir, parse_date, parse_decimal,
    parse_flag,
};
use govcon_core::{CandidateIdentity, OpportunityCandidate, OpportunityFields, PartitionKey};
use govcon_storage::HttpFetcher;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{decode_json, loose_string, trim_base_url, unsupported, AdapterContext, FetchError, RawRecord, SourceAdapter};

pub const SOURCE_ID: &str = "sam-opportunities";

#[derive(Debug, Clone, Deserialize)]
pub struct SamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub naics_codes: Vec<String>,
    #[serde(default = "default_posted_window_days")]
    pub posted_window_days: i64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Filled from `SAM_API_KEY`; never read from the sources file.
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    "https://api.sam.gov".to_string()
}

fn default_posted_window_days() -> i64 {
    30
}

fn default_page_size() -> usize {
    1000
}

fn default_max_pages() -> usize {
    10
}

impl Default for SamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            naics_codes: Vec::new(),
            posted_window_days: default_posted_window_days(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamOpportunity {
    pub notice_id: Option<String>,
    pub title: Option<String>,
    pub solicitation_number: Option<String>,
    pub full_parent_path_name: Option<String>,
    pub posted_date: Option<String>,
    #[serde(rename = "type")]
    pub notice_type: Option<String>,
    pub archive_date: Option<String>,
    pub type_of_set_aside_description: Option<String>,
    #[serde(rename = "responseDeadLine")]
    pub response_deadline: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub naics_code: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub classification_code: Option<String>,
    pub active: Option<String>,
    pub award: Option<SamAward>,
    pub description: Option<String>,
    pub ui_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SamAward {
    pub date: Option<String>,
    pub number: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub amount: Option<String>,
    pub awardee: Option<SamAwardee>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SamAwardee {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    #[serde(default)]
    total_records: usize,
    #[serde(default)]
    opportunities_data: Vec<SamOpportunity>,
}

pub struct SamOpportunitiesAdapter {
    http: Arc<HttpFetcher>,
    config: SamConfig,
}

impl SamOpportunitiesAdapter {
    pub fn new(http: Arc<HttpFetcher>, config: SamConfig) -> Self {
        Self { http, config }
    }

    fn search_url(&self) -> String {
        format!("{}/opportunities/v2/search", trim_base_url(&self.config.base_url))
    }

    fn search_query(
        &self,
        api_key: &str,
        naics: &str,
        now: DateTime<Utc>,
        offset: usize,
    ) -> Vec<(&'static str, String)> {
        let posted_to = now.date_naive();
        let posted_from = posted_to - Duration::days(self.config.posted_window_days.max(1));
        vec![
            ("api_key", api_key.to_string()),
            ("postedFrom", posted_from.format("%m/%d/%Y").to_string()),
            ("postedTo", posted_to.format("%m/%d/%Y").to_string()),
            ("ncode", naics.to_string()),
            ("limit", self.config.page_size.max(1).to_string()),
            ("offset", offset.to_string()),
        ]
    }
}

#[async_trait]
impl SourceAdapter for SamOpportunitiesAdapter {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    fn list_partitions(&self) -> Vec<PartitionKey> {
        self.config
            .naics_codes
            .iter()
            .map(|code| PartitionKey::Naics { code: code.clone() })
            .collect()
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        partition: &PartitionKey,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let PartitionKey::Naics { code } = partition else {
            return Err(unsupported(SOURCE_ID, partition));
        };
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(FetchError::MissingCredential {
                source_id: SOURCE_ID.to_string(),
                name: "SAM_API_KEY",
            })?;

        let url = self.search_url();
        let max_pages = self.config.max_pages.max(1);
        let mut records = Vec::new();
        for page in 0..max_pages {
            let query = self.search_query(api_key, code, ctx.started_at, records.len());
            let body = self.http.get_bytes(ctx.run_id, SOURCE_ID, &url, &query).await?;
            let parsed: SearchPage = decode_json(SOURCE_ID, partition, &body)?;
            let received = parsed.opportunities_data.len();
            records.extend(parsed.opportunities_data.into_iter().map(RawRecord::SamOpportunity));
            debug!(partition = %partition, page, received, total = parsed.total_records, "fetched search page");
            if received == 0 || records.len() >= parsed.total_records {
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

/// Splits `DEPT OF DEFENSE.DEPT OF THE ARMY.AMC` into top-level agency and
/// issuing office.
fn split_parent_path(path: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(path) = path else {
        return (None, None);
    };
    let segments: Vec<&str> = path
        .split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let agency = segments.first().map(|s| s.to_string());
    let office = if segments.len() > 1 {
        segments.last().map(|s| s.to_string())
    } else {
        None
    };
    (agency, office)
}

/// The search API returns a link to a separate description endpoint; only
/// inline text is kept.
fn inline_description(raw: Option<&str>) -> Option<String> {
    clean_text(raw).filter(|text| !text.starts_with("http://") && !text.starts_with("https://"))
}

pub(crate) fn to_candidate(record: &SamOpportunity, observed_at: DateTime<Utc>) -> OpportunityCandidate {
    let title = clean_text(record.title.as_deref());
    let (agency, sub_agency) = split_parent_path(record.full_parent_path_name.as_deref());
    let is_sbir = title.as_deref().map(mentions_sbir);
    let program_phase = match (is_sbir, title.as_deref()) {
        (Some(true), Some(t)) => detect_phase(t),
        _ => None,
    };
    let award = record.award.as_ref();

    OpportunityCandidate {
        source_id: SOURCE_ID.to_string(),
        identity: CandidateIdentity::Solicitation {
            solicitation_number: clean_text(record.solicitation_number.as_deref()),
        },
        observed_at,
        fields: OpportunityFields {
            title,
            description: inline_description(record.description.as_deref()),
            is_defense: record.full_parent_path_name.as_deref().map(is_defense_agency),
            agency,
            sub_agency,
            notice_type: clean_text(record.notice_type.as_deref()),
            naics_code: clean_text(record.naics_code.as_deref()),
            classification_code: clean_text(record.classification_code.as_deref()),
            set_aside: clean_text(record.type_of_set_aside_description.as_deref()),
            posted_date: record.posted_date.as_deref().and_then(parse_date),
            response_deadline: record.response_deadline.as_deref().and_then(parse_date),
            archive_date: record.archive_date.as_deref().and_then(parse_date),
            award_date: award.and_then(|a| a.date.as_deref()).and_then(parse_date),
            award_amount: award.and_then(|a| a.amount.as_deref()).and_then(parse_decimal),
            solicitation_number: clean_text(record.solicitation_number.as_deref()),
            contract_number: clean_text(award.and_then(|a| a.number.as_deref())),
            awardee_name: clean_text(
                award
                    .and_then(|a| a.awardee.as_ref())
                    .and_then(|a| a.name.as_deref()),
            ),
            source_url: clean_text(record.ui_link.as_deref()),
            is_sbir,
            program_phase,
            is_active: record.active.as_deref().and_then(parse_flag),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{observed_at, read_fixture, serve};
    use chrono::NaiveDate;
    use govcon_core::ProgramPhase;
    use rust_decimal::Decimal;

    fn fixture_records() -> Vec<SamOpportunity> {
        let partition = PartitionKey::Naics {
            code: "541715".into(),
        };
        let page: SearchPage = decode_json(
            SOURCE_ID,
            &partition,
            &read_fixture(SOURCE_ID, "search_page.json"),
        )
        .unwrap();
        assert_eq!(page.total_records, 3);
        page.opportunities_data
    }

    #[test]
    fn search_page_maps_to_candidates() {
        let records = fixture_records();
        let candidate = to_candidate(&records[0], observed_at());

        assert_eq!(candidate.natural_key().unwrap().as_str(), "W911NF-24-S-0001");
        let f = &candidate.fields;
        assert_eq!(f.title.as_deref(), Some("SBIR Phase II: Adaptive Radar Signal Processing"));
        assert_eq!(f.agency.as_deref(), Some("DEPT OF DEFENSE"));
        assert_eq!(f.sub_agency.as_deref(), Some("W6QK ACC-APG"));
        assert_eq!(f.is_defense, Some(true));
        assert_eq!(f.is_sbir, Some(true));
        assert_eq!(f.program_phase, Some(ProgramPhase::Two));
        assert_eq!(f.is_active, Some(true));
        assert_eq!(f.posted_date, NaiveDate::from_ymd_opt(2024, 1, 15));
        assert_eq!(f.response_deadline, NaiveDate::from_ymd_opt(2024, 2, 20));
        assert_eq!(f.naics_code.as_deref(), Some("541715"));
        assert_eq!(f.description, None);
    }

    #[test]
    fn award_notice_amount_is_exact_decimal() {
        let records = fixture_records();
        let candidate = to_candidate(&records[1], observed_at());
        let f = &candidate.fields;

        assert_eq!(f.award_amount, Some(Decimal::new(124_999_950, 2)));
        assert_eq!(f.contract_number.as_deref(), Some("75N93024C00012"));
        assert_eq!(f.awardee_name.as_deref(), Some("Acme Biologics LLC"));
        assert_eq!(f.is_defense, Some(false));
        assert_eq!(f.is_sbir, Some(false));
        assert_eq!(f.program_phase, None);
        assert_eq!(f.award_date, NaiveDate::from_ymd_opt(2024, 1, 10));
    }

    #[test]
    fn blank_solicitation_number_yields_no_key() {
        let records = fixture_records();
        let candidate = to_candidate(&records[2], observed_at());
        assert!(candidate.natural_key().is_none());
        assert_eq!(candidate.fields.title.as_deref(), Some("Janitorial Services, Building 12"));
    }

    #[test]
    fn parent_path_splits_agency_and_office() {
        assert_eq!(
            split_parent_path(Some("HEALTH AND HUMAN SERVICES, DEPARTMENT OF")),
            (Some("HEALTH AND HUMAN SERVICES, DEPARTMENT OF".into()), None)
        );
        assert_eq!(split_parent_path(None), (None, None));
    }

    #[tokio::test]
    async fn missing_api_key_is_a_fetch_error() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let adapter = SamOpportunitiesAdapter::new(
            http,
            SamConfig {
                naics_codes: vec!["541715".into()],
                ..Default::default()
            },
        );
        let ctx = AdapterContext::new(uuid::Uuid::new_v4());
        let partition = adapter.list_partitions().remove(0);
        let err = adapter.fetch(&ctx, &partition).await.unwrap_err();
        assert!(matches!(err, FetchError::MissingCredential { name: "SAM_API_KEY", .. }));
    }

    fn opportunity(solicitation: &str) -> serde_json::Value {
        serde_json::json!({ "solicitationNumber": solicitation, "title": "Radar" })
    }

    #[test]
    fn search_query_windows_posted_dates() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let adapter = SamOpportunitiesAdapter::new(
            http,
            SamConfig {
                base_url: "https://api.sam.gov/".into(),
                posted_window_days: 7,
                page_size: 50,
                ..Default::default()
            },
        );
        assert_eq!(adapter.search_url(), "https://api.sam.gov/opportunities/v2/search");
        let query = adapter.search_query("k", "541715", observed_at(), 100);
        assert_eq!(
            query,
            vec![
                ("api_key", "k".to_string()),
                ("postedFrom", "02/17/2026".to_string()),
                ("postedTo", "02/24/2026".to_string()),
                ("ncode", "541715".to_string()),
                ("limit", "50".to_string()),
                ("offset", "100".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn pages_by_offset_with_an_encoded_api_key() {
        let (base_url, requests) = serve(|query, _| {
            let page = if query.contains("offset=0") {
                vec![opportunity("SOL-1"), opportunity("SOL-2")]
            } else {
                vec![opportunity("SOL-3")]
            };
            serde_json::json!({ "totalRecords": 3, "opportunitiesData": page })
        })
        .await;
        let adapter = SamOpportunitiesAdapter::new(
            Arc::new(HttpFetcher::new(Default::default()).unwrap()),
            SamConfig {
                base_url,
                naics_codes: vec!["541715".into()],
                page_size: 2,
                api_key: Some("k&ncode=1".into()),
                ..Default::default()
            },
        );

        let ctx = AdapterContext::new(uuid::Uuid::new_v4());
        let partition = adapter.list_partitions().remove(0);
        let records = adapter.fetch(&ctx, &partition).await.unwrap();

        assert_eq!(records.len(), 3);
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].0.contains("api_key=k%26ncode%3D1"));
        assert!(requests[0].0.contains("ncode=541715"));
        assert!(requests[1].0.contains("offset=2"));
    }

    #[tokio::test]
    async fn stops_at_the_page_limit_with_records_remaining() {
        let (base_url, requests) = serve(|_, _| {
            serde_json::json!({
                "totalRecords": 10,
                "opportunitiesData": [opportunity("SOL-1"), opportunity("SOL-2")],
            })
        })
        .await;
        let adapter = SamOpportunitiesAdapter::new(
            Arc::new(HttpFetcher::new(Default::default()).unwrap()),
            SamConfig {
                base_url,
                naics_codes: vec!["541715".into()],
                page_size: 2,
                max_pages: 1,
                api_key: Some("k".into()),
                ..Default::default()
            },
        );

        let ctx = AdapterContext::new(uuid::Uuid::new_v4());
        let partition = adapter.list_partitions().remove(0);
        let records = adapter.fetch(&ctx, &partition).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(requests.lock().unwrap().len(), 1);
    }
}
