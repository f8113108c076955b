//! Parallel Archive Processor (§4.6): concurrent Common Crawl WAT file
//! download and parse, grounded directly on
//! `modules/linklater/parallel_wat_fetcher.py`'s `ParallelWATFetcher` —
//! same two-tier `download_semaphore`/`process_semaphore` design, same
//! `wat.paths.gz` listing + batched-download shape, same
//! `WARC/1.0`-delimited record split. The batch-then-fan-out shape
//! mirrors `dive_planner.rs`'s `buffer_unordered` idiom; results are
//! streamed off an mpsc channel the way `deep_diver.rs` streams
//! subprocess lines, so a caller consuming one domain's pages doesn't
//! have to wait for every WAT file in a batch to finish parsing.

use crate::core::types::PageRecord;
use crate::error::CCIndexError;
use flate2::read::GzDecoder;
use futures::stream::{self, Stream, StreamExt};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

const PROGRESS_EVERY: u64 = 1000;
const CONTENT_LINK_CAP: usize = 200;
const CHANNEL_CAPACITY: usize = 256;

static URI_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"WARC-Target-URI:\s*(\S+)").unwrap());
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"WARC-Date:\s*(\d{4}-\d{2}-\d{2})").unwrap());

#[derive(Debug, Default)]
struct RawStats {
    wat_files_fetched: AtomicU64,
    pages_processed: AtomicU64,
    domains_matched: AtomicU64,
    bytes_downloaded: AtomicU64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ArchiveStats {
    pub wat_files_fetched: u64,
    pub pages_processed: u64,
    pub domains_matched: u64,
    pub bytes_downloaded: u64,
}

pub struct ParallelArchiveProcessor {
    client: reqwest::Client,
    crawl_id: String,
    base_url: String,
    max_downloads: usize,
    max_processors: usize,
    download_semaphore: Arc<Semaphore>,
    process_semaphore: Arc<Semaphore>,
    stats: Arc<RawStats>,
}

impl ParallelArchiveProcessor {
    pub fn new(client: reqwest::Client, crawl_id: impl Into<String>, max_downloads: usize, max_processors: usize) -> Self {
        let crawl_id = crawl_id.into();
        info!(
            "parallel archive processor initialized: crawl={} max_downloads={} max_processors={}",
            crawl_id, max_downloads, max_processors
        );
        Self {
            client,
            crawl_id,
            base_url: "https://data.commoncrawl.org".to_string(),
            max_downloads,
            max_processors,
            download_semaphore: Arc::new(Semaphore::new(max_downloads.max(1))),
            process_semaphore: Arc::new(Semaphore::new(max_processors.max(1))),
            stats: Arc::new(RawStats::default()),
        }
    }

    pub fn get_stats(&self) -> ArchiveStats {
        ArchiveStats {
            wat_files_fetched: self.stats.wat_files_fetched.load(Ordering::Relaxed),
            pages_processed: self.stats.pages_processed.load(Ordering::Relaxed),
            domains_matched: self.stats.domains_matched.load(Ordering::Relaxed),
            bytes_downloaded: self.stats.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.stats.wat_files_fetched.store(0, Ordering::Relaxed);
        self.stats.pages_processed.store(0, Ordering::Relaxed);
        self.stats.domains_matched.store(0, Ordering::Relaxed);
        self.stats.bytes_downloaded.store(0, Ordering::Relaxed);
    }

    /// Downloads and decompresses `wat.paths.gz` for this crawl.
    pub async fn get_wat_paths(&self) -> Result<Vec<String>, CCIndexError> {
        let url = format!("{}/crawl-data/{}/wat.paths.gz", self.base_url, self.crawl_id);
        info!("fetching WAT paths from {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CCIndexError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CCIndexError::Fatal(format!("failed to fetch WAT paths: {}", resp.status())));
        }
        let compressed = resp.bytes().await.map_err(|e| CCIndexError::Transient(e.to_string()))?;

        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decompressed = String::new();
        decoder
            .read_to_string(&mut decompressed)
            .map_err(|e| CCIndexError::Fatal(format!("failed to decompress WAT paths: {}", e)))?;

        let paths: Vec<String> = decompressed.lines().map(str::to_string).filter(|l| !l.is_empty()).collect();
        info!("found {} WAT files", paths.len());
        Ok(paths)
    }

    /// Fetches and processes WAT files for specific domains. An empty
    /// `domains` list disables domain filtering entirely (used by
    /// `fetch_all`).
    pub async fn fetch_domains(
        &self,
        domains: &[String],
        max_wat_files: Option<usize>,
    ) -> Pin<Box<dyn Stream<Item = PageRecord> + Send>> {
        let target_domains: Option<HashSet<String>> = if domains.is_empty() {
            None
        } else {
            Some(domains.iter().map(|d| d.to_lowercase()).collect())
        };

        let wat_paths = match self.get_wat_paths().await {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to list WAT paths: {}", e);
                return Box::pin(stream::empty());
            }
        };
        let wat_paths = cap_paths(wat_paths, max_wat_files);

        Box::pin(self.stream_pages(wat_paths, target_domains))
    }

    /// Fetches and processes ALL WAT files with no domain filter.
    /// `max_wat_files` should essentially always be set outside of tests
    /// — a full crawl is billions of pages.
    pub async fn fetch_all(&self, max_wat_files: Option<usize>) -> Pin<Box<dyn Stream<Item = PageRecord> + Send>> {
        warn!("fetching ALL pages from crawl (no domain filter)");
        self.fetch_domains(&[], max_wat_files).await
    }

    /// Domain-discovery shortcut: finds pages whose JSON-LD schemas match
    /// a Schema.org `@type`, with optional (possibly one-level-nested)
    /// field filters.
    pub async fn fetch_by_schema(
        &self,
        schema_type: &str,
        schema_filters: Option<HashMap<String, String>>,
        max_wat_files: Option<usize>,
    ) -> Pin<Box<dyn Stream<Item = PageRecord> + Send>> {
        info!("schema search: @type={} filters={:?}", schema_type, schema_filters);
        let schema_type_lower = schema_type.to_lowercase();
        let filters = schema_filters.unwrap_or_default();

        let wat_paths = match self.get_wat_paths().await {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to list WAT paths: {}", e);
                return Box::pin(stream::empty());
            }
        };
        let wat_paths = cap_paths(wat_paths, max_wat_files);

        let unfiltered = self.stream_pages(wat_paths, None);
        let stats = Arc::clone(&self.stats);
        Box::pin(unfiltered.filter(move |page| {
            let is_match = matches_schema(page, &schema_type_lower, &filters);
            if is_match {
                stats.domains_matched.fetch_add(1, Ordering::Relaxed);
            }
            futures::future::ready(is_match)
        }))
    }

    /// Runs `fetch_by_schema` to exhaustion (or until `max_domains` unique
    /// domains are found) and returns the unique domain set.
    pub async fn discover_domains_by_schema(
        &self,
        schema_type: &str,
        schema_filters: Option<HashMap<String, String>>,
        max_wat_files: Option<usize>,
        max_domains: usize,
    ) -> Vec<String> {
        let mut stream = self.fetch_by_schema(schema_type, schema_filters, max_wat_files).await;
        let mut domains = Vec::new();
        let mut seen = HashSet::new();
        while let Some(page) = stream.next().await {
            if seen.insert(page.domain.clone()) {
                domains.push(page.domain);
                if domains.len() >= max_domains {
                    info!("reached max_domains limit: {}", max_domains);
                    break;
                }
            }
        }
        domains
    }

    fn stream_pages(&self, wat_paths: Vec<String>, target_domains: Option<HashSet<String>>) -> impl Stream<Item = PageRecord> {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let download_semaphore = Arc::clone(&self.download_semaphore);
        let process_semaphore = Arc::clone(&self.process_semaphore);
        let stats = Arc::clone(&self.stats);
        let max_downloads = self.max_downloads.max(1);
        let max_processors = self.max_processors.max(1);

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let total_batches = wat_paths.len().div_ceil(max_downloads).max(1);
            for (batch_num, batch) in wat_paths.chunks(max_downloads).enumerate() {
                info!("batch {}/{}: {} WAT files", batch_num + 1, total_batches, batch.len());

                let contents: Vec<Vec<u8>> = stream::iter(batch.to_vec())
                    .map(|path| {
                        let client = client.clone();
                        let base_url = base_url.clone();
                        let sem = Arc::clone(&download_semaphore);
                        let stats = Arc::clone(&stats);
                        async move { download_wat_file(&client, &base_url, &path, &sem, &stats).await }
                    })
                    .buffer_unordered(max_downloads)
                    .collect()
                    .await;

                let target_domains = target_domains.clone();
                let pages: Vec<PageRecord> = stream::iter(contents.into_iter().filter(|c| !c.is_empty()))
                    .map(|content| {
                        let sem = Arc::clone(&process_semaphore);
                        let stats = Arc::clone(&stats);
                        let target_domains = target_domains.clone();
                        async move { process_wat_content(content, target_domains.as_ref(), &sem, &stats).await }
                    })
                    .buffer_unordered(max_processors)
                    .collect::<Vec<_>>()
                    .await
                    .into_iter()
                    .flatten()
                    .collect();

                for page in pages {
                    if tx.send(page).await.is_err() {
                        return;
                    }
                }
            }

            info!(
                "WAT processing complete: {} files fetched, {} pages processed, {} matches",
                stats.wat_files_fetched.load(Ordering::Relaxed),
                stats.pages_processed.load(Ordering::Relaxed),
                stats.domains_matched.load(Ordering::Relaxed),
            );
        });

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
    }
}

fn cap_paths(paths: Vec<String>, max_wat_files: Option<usize>) -> Vec<String> {
    match max_wat_files {
        Some(n) => {
            info!("limited to {} WAT files", n);
            paths.into_iter().take(n).collect()
        }
        None => paths,
    }
}

async fn download_wat_file(
    client: &reqwest::Client,
    base_url: &str,
    wat_path: &str,
    sem: &Arc<Semaphore>,
    stats: &Arc<RawStats>,
) -> Vec<u8> {
    let _permit = sem.acquire().await;
    let url = format!("{}/{}", base_url, wat_path);

    let resp = match client
        .get(&url)
        .timeout(std::time::Duration::from_secs(300))
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!("error downloading {}: {}", wat_path, e);
            return Vec::new();
        }
    };
    if !resp.status().is_success() {
        warn!("failed to download {}: HTTP {}", wat_path, resp.status());
        return Vec::new();
    }

    let compressed = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            warn!("error reading body for {}: {}", wat_path, e);
            return Vec::new();
        }
    };
    stats.bytes_downloaded.fetch_add(compressed.len() as u64, Ordering::Relaxed);

    let mut decoder = GzDecoder::new(&compressed[..]);
    let mut decompressed = Vec::new();
    if let Err(e) = decoder.read_to_end(&mut decompressed) {
        warn!("error decompressing {}: {}", wat_path, e);
        return Vec::new();
    }

    let fetched = stats.wat_files_fetched.fetch_add(1, Ordering::Relaxed) + 1;
    debug!("downloaded WAT {}: {:.1} MB", fetched, compressed.len() as f64 / 1024.0 / 1024.0);
    decompressed
}

/// Splits on the `WARC/1.0` delimiter and parses each record, yielding
/// only pages that pass `target_domains` (`None` = accept all).
async fn process_wat_content(
    wat_content: Vec<u8>,
    target_domains: Option<&HashSet<String>>,
    sem: &Arc<Semaphore>,
    stats: &Arc<RawStats>,
) -> Vec<PageRecord> {
    let _permit = sem.acquire().await;
    if wat_content.is_empty() {
        return Vec::new();
    }

    let mut pages = Vec::new();
    for chunk in split_on_delimiter(&wat_content, b"WARC/1.0") {
        if chunk.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let Some(page) = parse_warc_record(chunk, target_domains) else { continue };

        let processed = stats.pages_processed.fetch_add(1, Ordering::Relaxed) + 1;
        if target_domains.is_none() || target_domains.map(|d| d.contains(&page.domain)).unwrap_or(false) {
            stats.domains_matched.fetch_add(1, Ordering::Relaxed);
            pages.push(page);
        }
        if processed % PROGRESS_EVERY == 0 {
            debug!(
                "processed {} pages, {} matches",
                processed,
                stats.domains_matched.load(Ordering::Relaxed)
            );
        }
    }
    pages
}

fn split_on_delimiter<'a>(content: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut rest = content;
    while let Some(pos) = find_subslice(rest, delimiter) {
        if pos > 0 {
            parts.push(&rest[..pos]);
        }
        rest = &rest[pos + delimiter.len()..];
    }
    if !rest.is_empty() {
        parts.push(rest);
    }
    parts
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_warc_record(record: &[u8], target_domains: Option<&HashSet<String>>) -> Option<PageRecord> {
    let record_str = String::from_utf8_lossy(record);

    let url_str = URI_RE.captures(&record_str)?.get(1)?.as_str().to_string();
    let parsed = Url::parse(&url_str).ok()?;
    let domain = parsed.host_str().unwrap_or("").to_lowercase();
    if domain.is_empty() {
        return None;
    }
    if let Some(targets) = target_domains {
        if !targets.contains(&domain) {
            return None;
        }
    }

    let crawl_date = DATE_RE.captures(&record_str).and_then(|c| c.get(1)).map(|m| m.as_str().to_string());

    let json_start = record_str.find('{')?;
    let mut json_str = &record_str[json_start..];
    if let Some(end) = json_str.rfind('}') {
        json_str = &json_str[..=end];
    }
    let data: serde_json::Value = serde_json::from_str(json_str).ok()?;

    let envelope = data.get("Envelope").cloned().unwrap_or_default();
    let payload = envelope.get("Payload-Metadata").cloned().unwrap_or_default();
    let http_resp = payload.get("HTTP-Response-Metadata").cloned().unwrap_or_default();
    let html_meta = http_resp.get("HTML-Metadata").cloned().unwrap_or_default();

    let head = html_meta.get("Head").cloned().unwrap_or_default();
    let title = head.get("Title").and_then(|v| v.as_str()).unwrap_or("").to_string();

    let mut schemas = Vec::new();
    if let Some(scripts) = head.get("Scripts").and_then(|v| v.as_array()) {
        for script in scripts {
            if script.get("type").and_then(|v| v.as_str()) != Some("application/ld+json") {
                continue;
            }
            match script.get("content") {
                Some(serde_json::Value::Object(_)) => schemas.push(script["content"].clone()),
                Some(serde_json::Value::Array(items)) => schemas.extend(items.iter().cloned()),
                _ => {}
            }
        }
    }

    let links: Vec<serde_json::Value> = html_meta.get("Links").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let link_strings: Vec<String> = links
        .iter()
        .filter_map(|l| l.get("url").and_then(|v| v.as_str()).map(str::to_string))
        .collect();

    let mut content_parts = vec![title.clone()];
    for link in links.iter().take(CONTENT_LINK_CAP) {
        if let Some(text) = link.get("text").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                content_parts.push(text.to_string());
            }
        }
    }
    let content = content_parts.join(" ");

    let http_status = http_resp
        .get("Response-Message")
        .and_then(|m| m.get("Status"))
        .and_then(|v| v.as_u64())
        .unwrap_or(200) as u16;

    Some(PageRecord {
        url: url_str,
        domain,
        title,
        content,
        links: link_strings,
        schemas,
        http_status,
        crawl_date,
        warc_file: String::new(),
    })
}

fn matches_schema(page: &PageRecord, schema_type_lower: &str, filters: &HashMap<String, String>) -> bool {
    for schema in &page.schemas {
        let Some(obj) = schema.as_object() else { continue };
        let s_type = match obj.get("@type") {
            Some(serde_json::Value::String(s)) => s.to_lowercase(),
            Some(serde_json::Value::Array(items)) => items
                .first()
                .and_then(|v| v.as_str())
                .map(str::to_lowercase)
                .unwrap_or_default(),
            _ => String::new(),
        };
        if s_type != schema_type_lower {
            continue;
        }

        let all_match = filters.iter().all(|(key, value)| {
            get_nested_value(obj, key)
                .map(|found| found.to_lowercase().contains(&value.to_lowercase()))
                .unwrap_or(false)
        });
        if all_match {
            return true;
        }
    }
    false
}

fn get_nested_value(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    if let Some(val) = obj.get(key) {
        return Some(match val {
            serde_json::Value::Object(nested) => nested
                .get("name")
                .or_else(|| nested.get("@value"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| val.to_string()),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    for value in obj.values() {
        if let Some(nested) = value.as_object() {
            if let Some(found) = nested.get(key) {
                return Some(found.as_str().map(str::to_string).unwrap_or_else(|| found.to_string()));
            }
        }
    }
    None
}
