//! Periscope: the CC Index client (§4.2). Resolves a domain or URL
//! pattern to WARC byte-range records, with HTTP/MIME/date/language
//! filters normalized per the CC Index wire format (§6).
//!
//! Request construction and response-status handling are modeled on the
//! teacher's `tools/search/engines/mod.rs::fetch_html` (capture status
//! before consuming the body) and `detect_block_reason`/`EngineError`
//! (status-code-driven classification into retryable vs. fatal). Retry
//! uses `backoff`'s tokio-aware exponential backoff, the same crate the
//! teacher declares for its own retry paths.

use crate::core::types::CCRecord;
use crate::error::CCIndexError;
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::warn;

/// The CC Index surface `DivePlanner` consumes, behind a trait so tests
/// can substitute a fixture without a live HTTP backend — mirroring
/// `sonar.rs`'s `SonarIndex` trait-object pattern.
#[async_trait]
pub trait CcIndexClient: Send + Sync {
    async fn lookup_domain(&self, domain: &str, archive: &str, filters: &LookupFilters) -> Result<Vec<CCRecord>, CCIndexError>;
    async fn search(&self, url_pattern: &str, archive: &str, filters: &LookupFilters) -> Result<Vec<CCRecord>, CCIndexError>;
}

#[derive(Debug, Clone, Default)]
pub struct LookupFilters {
    pub limit: usize,
    pub filter_status: Option<u16>,
    pub filter_mime: Option<String>,
    pub filter_languages: Option<String>,
    pub from_ts: Option<String>,
    pub to_ts: Option<String>,
    pub url_contains: Option<String>,
}

pub struct Periscope {
    client: reqwest::Client,
    base_url: String,
}

impl Periscope {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub async fn lookup_domain(
        &self,
        domain: &str,
        archive: &str,
        filters: &LookupFilters,
    ) -> Result<Vec<CCRecord>, CCIndexError> {
        let pattern = format!("{}/*", domain);
        self.search(&pattern, archive, filters).await
    }

    pub async fn search(
        &self,
        url_pattern: &str,
        archive: &str,
        filters: &LookupFilters,
    ) -> Result<Vec<CCRecord>, CCIndexError> {
        let url = self.build_url(url_pattern, archive, filters);

        let backoff_policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(Duration::from_secs(15)),
            ..Default::default()
        };

        let client = self.client.clone();
        let attempt_url = url.clone();
        let body = retry(backoff_policy, move || {
            let client = client.clone();
            let url = attempt_url.clone();
            async move {
                let resp = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| backoff::Error::transient(CCIndexError::Transient(e.to_string())))?;

                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();

                match classify(status) {
                    Classification::Ok => Ok(text),
                    Classification::Retry => {
                        warn!("cc index transient status {} for {}", status, url);
                        Err(backoff::Error::transient(CCIndexError::Transient(format!(
                            "http {}",
                            status
                        ))))
                    }
                    Classification::Fatal => Err(backoff::Error::permanent(CCIndexError::Fatal(format!(
                        "http {}",
                        status
                    )))),
                }
            }
        })
        .await?;

        let mut records = parse_ndjson(&body);
        if let Some(needle) = &filters.url_contains {
            records.retain(|r| r.url.contains(needle.as_str()));
        }
        Ok(records)
    }

    fn build_url(&self, url_pattern: &str, archive: &str, filters: &LookupFilters) -> String {
        let mut qs = vec![
            format!("url={}", url_pattern),
            "output=json".to_string(),
        ];
        if filters.limit > 0 {
            qs.push(format!("limit={}", filters.limit));
        }
        if let Some(status) = filters.filter_status {
            qs.push(format!("filter=status:{}", status));
        }
        if let Some(mime) = &filters.filter_mime {
            qs.push(format!("mimetype={}", normalize_mime(mime)));
        }
        if let Some(langs) = &filters.filter_languages {
            qs.push(format!("languages={}", normalize_language(langs)));
        }
        if let Some(from) = &filters.from_ts {
            if let Some(ts) = normalize_timestamp(from, false) {
                qs.push(format!("fromTimestamp={}", ts));
            }
        }
        if let Some(to) = &filters.to_ts {
            if let Some(ts) = normalize_timestamp(to, true) {
                qs.push(format!("toTimestamp={}", ts));
            }
        }
        format!("{}/{}-index?{}", self.base_url, archive, qs.join("&"))
    }
}

#[async_trait]
impl CcIndexClient for Periscope {
    async fn lookup_domain(&self, domain: &str, archive: &str, filters: &LookupFilters) -> Result<Vec<CCRecord>, CCIndexError> {
        Periscope::lookup_domain(self, domain, archive, filters).await
    }

    async fn search(&self, url_pattern: &str, archive: &str, filters: &LookupFilters) -> Result<Vec<CCRecord>, CCIndexError> {
        Periscope::search(self, url_pattern, archive, filters).await
    }
}

enum Classification {
    Ok,
    Retry,
    Fatal,
}

fn classify(status: StatusCode) -> Classification {
    if status.is_success() {
        return Classification::Ok;
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            Classification::Retry
        }
        _ if status.is_server_error() => Classification::Retry,
        _ => Classification::Fatal,
    }
}

fn parse_ndjson(body: &str) -> Vec<CCRecord> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<CCRecord>(line).ok())
        .collect()
}

/// `YYYYMMDDHHMMSS`, `YYYY-MM-DD`, and `YYYYMMDD` are accepted; end-of-day
/// is padded to `235959` when `end=true`, else `000000` (§4.2).
pub fn normalize_timestamp(value: &str, end: bool) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if v.len() == 14 && v.chars().all(|c| c.is_ascii_digit()) {
        return Some(v.to_string());
    }
    let digits_only: String = v.chars().filter(|c| c.is_ascii_digit()).collect();
    if v.len() == 10 && v.matches('-').count() == 2 {
        return Some(format!("{}{}", digits_only, if end { "235959" } else { "000000" }));
    }
    if v.len() == 8 && v.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("{}{}", v, if end { "235959" } else { "000000" }));
    }
    Some(v.to_string())
}

/// `pdf` → `application/pdf`, `html`/`htm` → `text/html` (§4.2).
pub fn normalize_mime(mime: &str) -> String {
    match mime.trim().to_lowercase().as_str() {
        "pdf" | ".pdf" => "application/pdf".to_string(),
        "html" | ".html" | "htm" | ".htm" => "text/html".to_string(),
        other => other.to_string(),
    }
}

/// 2-letter codes mapped to 3-letter CC language codes (§4.2).
pub fn normalize_language(language: &str) -> String {
    let l = language.trim().to_lowercase();
    if l.len() == 2 {
        let mapped = match l.as_str() {
            "en" => "eng",
            "de" => "deu",
            "fr" => "fra",
            "es" => "spa",
            "pt" => "por",
            "ru" => "rus",
            "it" => "ita",
            "nl" => "nld",
            other => other,
        };
        return mapped.to_string();
    }
    l
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_timestamps() {
        assert_eq!(normalize_timestamp("20240101", false), Some("20240101000000".to_string()));
        assert_eq!(normalize_timestamp("20240101", true), Some("20240101235959".to_string()));
        assert_eq!(normalize_timestamp("2024-01-01", true), Some("20240101235959".to_string()));
        assert_eq!(normalize_timestamp("20240101123045", false), Some("20240101123045".to_string()));
    }

    #[test]
    fn normalizes_mime_shorthand() {
        assert_eq!(normalize_mime("pdf"), "application/pdf");
        assert_eq!(normalize_mime("HTML"), "text/html");
        assert_eq!(normalize_mime("application/json"), "application/json");
    }

    #[test]
    fn normalizes_language_codes() {
        assert_eq!(normalize_language("en"), "eng");
        assert_eq!(normalize_language("de"), "deu");
        assert_eq!(normalize_language("eng"), "eng");
    }

    #[test]
    fn parses_ndjson_records() {
        let body = r#"{"url":"http://example.com","filename":"a.warc.gz","offset":1,"length":2,"status":200,"mime":"text/html","timestamp":"20240101000000","digest":"x"}
{"url":"http://example.com/b","filename":"a.warc.gz","offset":3,"length":4,"status":200,"mime":"text/html","timestamp":"20240101000000","digest":"y"}"#;
        let records = parse_ndjson(body);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 1);
    }

    #[test]
    fn url_contains_filters_parsed_records() {
        let body = r#"{"url":"http://example.com/about","filename":"a.warc.gz","offset":1,"length":2,"status":200,"mime":"text/html","timestamp":"20240101000000","digest":"x"}
{"url":"http://example.com/blog","filename":"a.warc.gz","offset":3,"length":4,"status":200,"mime":"text/html","timestamp":"20240101000000","digest":"y"}"#;
        let mut records = parse_ndjson(body);
        let filters = LookupFilters { url_contains: Some("/blog".to_string()), ..Default::default() };
        if let Some(needle) = &filters.url_contains {
            records.retain(|r| r.url.contains(needle.as_str()));
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "http://example.com/blog");
    }
}
