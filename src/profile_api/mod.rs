//! Third-party profile API.
//!
//! [`ProfileSource`] is the seam the fetch orchestrator depends on; the
//! shipped implementation is [`client::ProfileApiClient`]. Every call
//! resolves to a [`FetchOutcome`] instead of an error so the retry machine
//! can branch on the variant.

pub mod client;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use client::ProfileApiClient;

/// Profile payload as returned by the API. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiProfile {
    #[serde(default)]
    pub urn: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub geo: Option<GeoData>,
    #[serde(default)]
    pub educations: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub full_positions: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub skills: Option<Vec<serde_json::Value>>,
}

/// Location block. Older responses use `country_name`/`city_name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(rename = "country_name", default, skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(rename = "city_name", default, skip_serializing_if = "Option::is_none")]
    pub city_name: Option<String>,
}

/// A successfully parsed profile plus the exact response bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedProfile {
    pub profile: ApiProfile,
    pub raw: Vec<u8>,
}

/// Classified result of one API call.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(FetchedProfile),
    NotFound(String),
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// Transport failure, unexpected status or unparsable body.
    Failed(String),
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profile(&self, identifier: &str) -> FetchOutcome;
}
