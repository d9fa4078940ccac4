//! Reduce an API profile to the cleaned payload and the normalized row.

use serde::Serialize;
use serde_json::json;

use crate::db::ProfileUpsert;
use crate::profile_api::{ApiProfile, GeoData};

/// Subset of the API payload stored as the cleaned blob and on the entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanedProfile<'a> {
    pub urn: Option<&'a str>,
    pub username: Option<&'a str>,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub headline: Option<&'a str>,
    pub geo: Option<&'a GeoData>,
    pub educations: &'a [serde_json::Value],
    pub full_positions: &'a [serde_json::Value],
    pub skills: &'a [serde_json::Value],
}

pub fn cleaned(profile: &ApiProfile) -> CleanedProfile<'_> {
    CleanedProfile {
        urn: profile.urn.as_deref(),
        username: profile.username.as_deref(),
        first_name: profile.first_name.as_deref(),
        last_name: profile.last_name.as_deref(),
        headline: profile.headline.as_deref(),
        geo: profile.geo.as_ref(),
        educations: profile.educations.as_deref().unwrap_or_default(),
        full_positions: profile.full_positions.as_deref().unwrap_or_default(),
        skills: profile.skills.as_deref().unwrap_or_default(),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

fn json_list(values: &Option<Vec<serde_json::Value>>) -> Option<String> {
    values
        .as_ref()
        .and_then(|v| serde_json::to_string(v).ok())
}

/// Normalized profile row keyed by the entry identifier.
///
/// Country and city prefer `geo.country`/`geo.city` and fall back to the
/// legacy `country_name`/`city_name` fields. The headline doubles as title.
pub fn normalize(
    identifier: &str,
    entry_id: &str,
    profile: &ApiProfile,
    raw_blob_key: &str,
    cleaned_blob_key: &str,
) -> ProfileUpsert {
    let (country, city, geo_data) = match &profile.geo {
        Some(geo) => {
            let country = non_empty(&geo.country)
                .or_else(|| non_empty(&geo.country_name))
                .map(str::to_string);
            let city = non_empty(&geo.city)
                .or_else(|| non_empty(&geo.city_name))
                .map(str::to_string);
            let geo_data = json!({
                "country_name": country,
                "city_name": city,
                "full": geo.full,
                "country_code": geo.country_code,
            });
            (country, city, Some(geo_data.to_string()))
        }
        None => (None, None, None),
    };

    ProfileUpsert {
        urn: identifier.to_string(),
        entry_id: Some(entry_id.to_string()),
        username: profile.username.clone(),
        first_name: profile.first_name.clone(),
        last_name: profile.last_name.clone(),
        headline: profile.headline.clone(),
        title: profile.headline.clone(),
        country,
        city,
        educations: json_list(&profile.educations),
        positions: json_list(&profile.full_positions),
        skills: json_list(&profile.skills),
        geo_data,
        raw_blob_key: Some(raw_blob_key.to_string()),
        cleaned_blob_key: Some(cleaned_blob_key.to_string()),
    }
}
