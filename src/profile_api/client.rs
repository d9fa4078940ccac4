//! HTTP client for the RapidAPI people-data endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use super::{ApiProfile, FetchOutcome, FetchedProfile, ProfileSource};
use crate::error::PipelineError;
use crate::types::ProfileApiConfig;

/// Messages the API uses in a `success: false` body for profiles that do
/// not exist or are private.
const NOT_FOUND_MARKERS: &[&str] = &[
    "not valid linkedin profile",
    "not valid profile",
    "can't be accessed",
    "profile not found",
];

pub struct ProfileApiClient {
    client: reqwest::Client,
    base_url: url::Url,
    api_key: String,
    api_host: String,
}

impl ProfileApiClient {
    pub fn new(config: &ProfileApiConfig) -> Result<Self, PipelineError> {
        let base_url = url::Url::parse(&config.base_url).map_err(|e| {
            PipelineError::Configuration(format!(
                "Invalid profile API base URL '{}': {}",
                config.base_url, e
            ))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            api_host: config.api_host.clone(),
        })
    }

    fn request_url(&self, identifier: &str) -> url::Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair("username", identifier);
        url
    }
}

#[async_trait]
impl ProfileSource for ProfileApiClient {
    async fn fetch_profile(&self, identifier: &str) -> FetchOutcome {
        let url = self.request_url(identifier);
        let started = Instant::now();

        let resp = match self
            .client
            .get(url)
            .header("X-RapidAPI-Key", &self.api_key)
            .header("X-RapidAPI-Host", &self.api_host)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                log::warn!(
                    "Profile API request for {} failed after {:?}: {}",
                    identifier,
                    started.elapsed(),
                    e
                );
                return FetchOutcome::Failed(format!("request failed: {}", e));
            }
        };

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let body = match resp.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => return FetchOutcome::Failed(format!("failed to read response body: {}", e)),
        };

        log::debug!(
            "Profile API {} -> {} ({} bytes, {:?})",
            identifier,
            status,
            body.len(),
            started.elapsed()
        );

        classify_response(status.as_u16(), retry_after, body)
    }
}

/// Map a status code and body onto a [`FetchOutcome`].
pub fn classify_response(status: u16, retry_after: Option<Duration>, body: Vec<u8>) -> FetchOutcome {
    if status == 200 {
        return parse_response(body);
    }
    let text = String::from_utf8_lossy(&body).into_owned();
    match status {
        429 => FetchOutcome::RateLimited {
            retry_after,
            message: text,
        },
        404 => FetchOutcome::NotFound(text),
        other => FetchOutcome::Failed(format!("API returned status {}: {}", other, text)),
    }
}

#[derive(Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Parse a 200 body, which is either `{success, message, data}` or the
/// profile object itself.
pub fn parse_response(body: Vec<u8>) -> FetchOutcome {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return FetchOutcome::Failed(format!("response is not JSON: {}", e)),
    };

    let profile_value = if value.get("success").is_some() {
        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(env) => env,
            Err(e) => return FetchOutcome::Failed(format!("malformed response envelope: {}", e)),
        };
        let message = envelope.message.unwrap_or_default();
        if !envelope.success {
            let lower = message.to_lowercase();
            if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
                return FetchOutcome::NotFound(message);
            }
            return FetchOutcome::Failed(format!("API error: {}", message));
        }
        match envelope.data {
            Some(data) if !data.is_null() => data,
            _ => return FetchOutcome::Failed("API error: success=true but data is null".to_string()),
        }
    } else {
        value
    };

    match serde_json::from_value::<ApiProfile>(profile_value) {
        Ok(profile) => FetchOutcome::Found(FetchedProfile { profile, raw: body }),
        Err(e) => FetchOutcome::Failed(format!("failed to parse profile: {}", e)),
    }
}

/// `Retry-After` in delta-seconds. Zero, negative and HTTP-date forms are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_success() {
        let body = br#"{"success":true,"message":"","data":{"username":"ada","firstName":"Ada","geo":{"country":"UK"}}}"#;
        match parse_response(body.to_vec()) {
            FetchOutcome::Found(f) => {
                assert_eq!(f.profile.username.as_deref(), Some("ada"));
                assert_eq!(f.profile.first_name.as_deref(), Some("Ada"));
                assert_eq!(f.raw, body.to_vec());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_direct_profile() {
        let body = br#"{"urn":"ACoAA","headline":"Engineer","skills":[{"name":"Rust"}]}"#;
        match parse_response(body.to_vec()) {
            FetchOutcome::Found(f) => {
                assert_eq!(f.profile.urn.as_deref(), Some("ACoAA"));
                assert_eq!(f.profile.skills.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_wrapped_not_found_messages() {
        for message in [
            "This is not valid LinkedIn profile URL",
            "Profile can't be accessed",
            "Profile not found",
        ] {
            let body = serde_json::json!({"success": false, "message": message, "data": null});
            let outcome = parse_response(serde_json::to_vec(&body).unwrap());
            assert_eq!(outcome, FetchOutcome::NotFound(message.to_string()));
        }
    }

    #[test]
    fn test_wrapped_failures() {
        let body = br#"{"success":false,"message":"Internal error"}"#;
        assert!(matches!(
            parse_response(body.to_vec()),
            FetchOutcome::Failed(m) if m.contains("Internal error")
        ));

        let body = br#"{"success":true,"data":null}"#;
        assert!(matches!(
            parse_response(body.to_vec()),
            FetchOutcome::Failed(m) if m.contains("data is null")
        ));

        assert!(matches!(
            parse_response(b"<html>".to_vec()),
            FetchOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_response(429, Some(Duration::from_secs(5)), b"slow down".to_vec()),
            FetchOutcome::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
                message: "slow down".into()
            }
        );
        assert_eq!(
            classify_response(404, None, b"gone".to_vec()),
            FetchOutcome::NotFound("gone".into())
        );
        assert!(matches!(
            classify_response(503, None, b"down".to_vec()),
            FetchOutcome::Failed(m) if m.contains("503")
        ));
    }

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("0"), None);
        assert_eq!(parse_retry_after("-3"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_request_url_encodes_identifier() {
        let client = ProfileApiClient::new(&ProfileApiConfig::default()).unwrap();
        let url = client.request_url("urn:li:person/1 2");
        assert_eq!(url.query(), Some("username=urn%3Ali%3Aperson%2F1+2"));
    }

    #[test]
    fn test_invalid_base_url_is_configuration_error() {
        let config = ProfileApiConfig {
            base_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(
            ProfileApiClient::new(&config),
            Err(PipelineError::Configuration(_))
        ));
    }
}
