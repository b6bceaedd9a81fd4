use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

// ============================================================================
// Tracking inputs
// ============================================================================

/// A place a keyword is searched "near". Coordinates are optional; when both are
/// present the renderer pins the browser geolocation to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Location {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

impl Location {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Trimmed, non-empty location name.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() => Some((lat, lng)),
            _ => None,
        }
    }

    /// Label stored on a `SearchResult`.
    pub fn label(&self) -> String {
        self.display_name().unwrap_or("unknown").to_string()
    }
}

/// An active (keyword, location) pair monitored for a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackingPair {
    pub tracking_id: Uuid,
    pub keyword_id: Uuid,
    pub keyword: String,
    pub location_id: Uuid,
    pub location: Location,
    pub client_id: Uuid,
}

impl TrackingPair {
    pub fn payload(&self) -> TrackingPayload {
        TrackingPayload {
            keyword_id: Some(self.keyword_id),
            keyword: self.keyword.clone(),
            location_id: Some(self.location_id),
            location: self.location.clone(),
            client_id: Some(self.client_id),
        }
    }
}

/// Snapshot of a tracking pair carried by a queued job.
///
/// IDs are optional: an ad-hoc `track` request may name only a keyword and a
/// location, in which case nothing is written to the rankings table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackingPayload {
    #[serde(default)]
    pub keyword_id: Option<Uuid>,
    pub keyword: String,
    #[serde(default)]
    pub location_id: Option<Uuid>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub client_id: Option<Uuid>,
}

impl TrackingPayload {
    pub fn adhoc(keyword: impl Into<String>, location: Location) -> Self {
        Self {
            keyword_id: None,
            keyword: keyword.into(),
            location_id: None,
            location,
            client_id: None,
        }
    }

    /// (keyword, location, client) when the payload identifies a stored pair.
    pub fn tracking_ids(&self) -> Option<(Uuid, Uuid, Uuid)> {
        Some((self.keyword_id?, self.location_id?, self.client_id?))
    }
}

/// Keyword row owned by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientKeyword {
    pub id: Uuid,
    pub keyword: String,
    pub client_id: Uuid,
}

/// Location row owned by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientLocation {
    pub id: Uuid,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub client_id: Uuid,
}

impl ClientLocation {
    pub fn location(&self) -> Location {
        Location {
            name: Some(self.name.clone()),
            lat: self.latitude,
            lng: self.longitude,
        }
    }
}

// ============================================================================
// Extraction output
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrganicResult {
    pub position: u32,
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MapPackResult {
    pub position: u32,
    pub title: String,
    pub address: String,
}

/// Structured rankings parsed out of one rendered results page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub keyword: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    pub organic: Vec<OrganicResult>,
    pub map_pack: Vec<MapPackResult>,
    pub total_results: u64,
}

impl SearchResult {
    pub fn empty(keyword: &str, location: &Location) -> Self {
        Self {
            keyword: keyword.to_string(),
            location: location.label(),
            timestamp: Utc::now(),
            organic: Vec::new(),
            map_pack: Vec::new(),
            total_results: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.organic.is_empty() && self.map_pack.is_empty()
    }
}

// ============================================================================
// Persisted rankings
// ============================================================================

/// One appended row of the rankings time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRecord {
    pub tracking_pair_id: Uuid,
    pub rank: i32,
    pub url_ranking: Option<String>,
    pub map_pack_present: bool,
    pub map_pack_position: Option<i32>,
    pub date_checked: NaiveDate,
}

impl RankingRecord {
    /// Rows for one check: every organic result, then every map-pack entry.
    pub fn from_search_result(
        tracking_pair_id: Uuid,
        results: &SearchResult,
        date_checked: NaiveDate,
    ) -> Vec<Self> {
        let map_pack_present = !results.map_pack.is_empty();

        let organic = results.organic.iter().map(|r| Self {
            tracking_pair_id,
            rank: r.position as i32,
            url_ranking: Some(r.url.clone()),
            map_pack_present,
            map_pack_position: None,
            date_checked,
        });

        let map_pack = results.map_pack.iter().map(|r| Self {
            tracking_pair_id,
            rank: r.position as i32,
            url_ranking: None,
            map_pack_present: true,
            map_pack_position: Some(r.position as i32),
            date_checked,
        });

        organic.chain(map_pack).collect()
    }
}

/// Ranking row joined with its keyword and location, as served to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RankingRow {
    pub id: Uuid,
    pub tracking_pair_id: Uuid,
    pub keyword_id: Uuid,
    pub keyword: String,
    pub location_id: Uuid,
    pub location: String,
    pub rank: i32,
    pub url_ranking: Option<String>,
    pub map_pack_present: bool,
    pub map_pack_position: Option<i32>,
    pub date_checked: NaiveDate,
}

/// One day of a single pair's ranking history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub date_checked: NaiveDate,
    pub best_rank: Option<i32>,
    pub url_ranking: Option<String>,
    pub map_pack_position: Option<i32>,
}

/// Optional filters for the ranking read routes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct RankingFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub keyword_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
}
