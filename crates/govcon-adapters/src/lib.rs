//! Source adapter contract and the three upstream catalog adapters.

pub mod sam;
pub mod sbir;
pub mod usaspending;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govcon_core::{OpportunityCandidate, PartitionKey};
use govcon_storage::HttpError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub use sam::{SamConfig, SamOpportunitiesAdapter, SamOpportunity};
pub use sbir::{SbirAward, SbirAwardsAdapter, SbirConfig};
pub use usaspending::{SpendingAward, UsaSpendingAdapter, UsaSpendingConfig};

pub const CRATE_NAME: &str = "govcon-adapters";

/// Per-run context handed to every partition fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

/// The only way a partition fetch reports failure.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream request failed: {0}")]
    Http(#[from] HttpError),
    #[error("decoding {source_id} response for {partition}: {message}")]
    Decode {
        source_id: String,
        partition: String,
        message: String,
    },
    #[error("{source_id} requires credential {name}")]
    MissingCredential {
        source_id: String,
        name: &'static str,
    },
    #[error("{source_id} does not fetch partition {partition}")]
    UnsupportedPartition {
        source_id: String,
        partition: String,
    },
    #[error("{0}")]
    Message(String),
}

impl FetchError {
    /// Rejected or absent credentials; retrying the run will not help.
    pub fn is_auth(&self) -> bool {
        match self {
            FetchError::Http(err) => err.is_auth(),
            FetchError::MissingCredential { .. } => true,
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::Http(err) if err.is_rate_limited())
    }
}

/// A typed upstream payload for one record. Never persisted directly.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    SamOpportunity(SamOpportunity),
    SbirAward(SbirAward),
    SpendingAward(SpendingAward),
}

impl RawRecord {
    /// Maps the raw payload field by field into a normalized candidate.
    pub fn to_candidate(&self, observed_at: DateTime<Utc>) -> OpportunityCandidate {
        match self {
            RawRecord::SamOpportunity(record) => sam::to_candidate(record, observed_at),
            RawRecord::SbirAward(record) => sbir::to_candidate(record, observed_at),
            RawRecord::SpendingAward(record) => usaspending::to_candidate(record, observed_at),
        }
    }
}

/// A pull-based upstream source split into independently fetchable partitions.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable identifier used for provenance and logging.
    fn source_id(&self) -> &str;

    fn list_partitions(&self) -> Vec<PartitionKey>;

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        partition: &PartitionKey,
    ) -> Result<Vec<RawRecord>, FetchError>;
}

pub(crate) fn decode_json<T: DeserializeOwned>(
    source_id: &str,
    partition: &PartitionKey,
    body: &[u8],
) -> Result<T, FetchError> {
    serde_json::from_slice(body).map_err(|err| FetchError::Decode {
        source_id: source_id.to_string(),
        partition: partition.to_string(),
        message: err.to_string(),
    })
}

pub(crate) fn unsupported(source_id: &str, partition: &PartitionKey) -> FetchError {
    FetchError::UnsupportedPartition {
        source_id: source_id.to_string(),
        partition: partition.to_string(),
    }
}

/// Accepts a string, number, bool, or `{ "code": .. }` object and keeps it as
/// text; upstream catalogs disagree on which of these they send.
pub(crate) fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| json_to_text(&v)))
}

fn json_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Object(map) => map.get("code").and_then(json_to_text),
        JsonValue::Null | JsonValue::Array(_) => None,
    }
}

pub(crate) fn trim_base_url(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use axum::extract::RawQuery;
    use axum::Json;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Value;

    /// Raw query strings and bodies seen by a [`serve`] stub, in arrival order.
    pub type Requests = Arc<Mutex<Vec<(String, String)>>>;

    /// Starts a local upstream that answers every request with
    /// `respond(query, body)` and returns its base URL.
    pub async fn serve<F>(respond: F) -> (String, Requests)
    where
        F: Fn(&str, &str) -> Value + Clone + Send + Sync + 'static,
    {
        let seen: Requests = Arc::default();
        let log = seen.clone();
        let app = axum::Router::new().fallback(move |RawQuery(query): RawQuery, body: String| {
            let respond = respond.clone();
            let log = log.clone();
            async move {
                let query = query.unwrap_or_default();
                let reply = respond(&query, &body);
                log.lock().unwrap().push((query, body));
                Json(reply)
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    pub fn fixture_path(source_id: &str, name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(source_id)
            .join(name)
    }

    pub fn read_fixture(source_id: &str, name: &str) -> Vec<u8> {
        std::fs::read(fixture_path(source_id, name)).expect("read fixture")
    }

    pub fn observed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }
}
