//! Deep Diver (§4.5): wraps an external WARC range-fetcher binary
//! (`ccwarc` by default) the same way `deep_dive/diver.py` wraps the Go
//! `ccwarc_linux` binary — write targets to a temp file, spawn the
//! binary, stream NDJSON results off its stdout one line at a time, and
//! checkpoint progress as domains complete. The bounded-fan-out stream
//! idiom mirrors `dive_planner.rs`'s `buffer_unordered` shape, but the
//! unit of work here is "read the next subprocess line", not "run an
//! independent async task", so it's built on an mpsc channel instead.

use crate::core::config::EngineConfig;
use crate::core::types::{CCRecord, DivePlan, DiveResult};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Grace window between SIGTERM and the SIGKILL escalation in
/// `terminate_child`, matching `deep_dive/diver.py`'s teardown.
const KILL_GRACE: Duration = Duration::from_secs(2);
const CHANNEL_CAPACITY: usize = 256;

pub struct DeepDiver {
    binary: String,
    threads: usize,
    timeout_secs: u64,
    available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeEstimate {
    pub record_count: usize,
    pub threads: usize,
    pub est_seconds: f64,
    pub est_minutes: f64,
}

#[derive(Serialize)]
struct FetchRecord {
    url: String,
    filename: String,
    offset: u64,
    length: u64,
    domain: String,
}

struct CheckpointState {
    expected_by_domain: HashMap<String, usize>,
    processed_by_domain: HashMap<String, usize>,
    plan: DivePlan,
    checkpoint_path: PathBuf,
}

impl DeepDiver {
    pub fn new(config: &EngineConfig) -> Self {
        let binary = config.resolve_deep_diver_binary();
        let threads = config.resolve_deep_diver_threads();
        let available = binary_available(&binary);
        if !available {
            error!("deep diver binary not found: {}", binary);
        }
        Self { binary, threads, timeout_secs: DEFAULT_TIMEOUT_SECS, available }
    }

    /// ~100ms per fetch at `self.threads` concurrent connections (§3).
    pub fn estimate_time(&self, record_count: usize) -> TimeEstimate {
        let batches = record_count as f64 / self.threads as f64;
        let est_seconds = batches * 0.1;
        TimeEstimate {
            record_count,
            threads: self.threads,
            est_seconds,
            est_minutes: est_seconds / 60.0,
        }
    }

    /// Executes a dive plan: skips domains already in
    /// `plan.completed_domains`, fetches the rest, and (if
    /// `checkpoint_path` is given) atomically persists newly-completed
    /// domains as their expected record counts are reached.
    pub async fn execute_plan(
        &self,
        plan: &DivePlan,
        checkpoint_path: Option<PathBuf>,
    ) -> Pin<Box<dyn Stream<Item = DiveResult> + Send>> {
        if !self.available {
            warn!("ccwarc binary not available, yielding no results");
            return Box::pin(stream::empty());
        }

        let mut expected_by_domain: HashMap<String, usize> = HashMap::new();
        let mut all_records = Vec::new();
        for target in &plan.targets {
            let domain = target.domain.trim().to_string();
            if domain.is_empty() || plan.completed_domains.contains(&domain) {
                continue;
            }
            *expected_by_domain.entry(domain.clone()).or_insert(0) += target.cc_records.len();
            for record in &target.cc_records {
                all_records.push(FetchRecord {
                    url: record.url.clone(),
                    filename: record.filename.clone(),
                    offset: record.offset,
                    length: record.length,
                    domain: domain.clone(),
                });
            }
        }

        if all_records.is_empty() {
            info!("no records to fetch");
            return Box::pin(stream::empty());
        }

        info!(
            "executing dive plan: {} records from {} domains",
            all_records.len(),
            plan.total_domains
        );

        let records_path = match write_ndjson(&all_records, "records", "ndjson").await {
            Ok(p) => p,
            Err(e) => {
                error!("failed to write records file: {}", e);
                return Box::pin(stream::empty());
            }
        };

        let cmd = self.fetch_command(&records_path);
        let checkpoint = checkpoint_path.map(|path| CheckpointState {
            expected_by_domain,
            processed_by_domain: HashMap::new(),
            plan: plan.clone(),
            checkpoint_path: path,
        });

        Box::pin(run_subprocess_stream(cmd, Some(records_path), self.timeout_secs, checkpoint))
    }

    /// Batch mode: index-and-fetch content for a list of domains directly,
    /// without a pre-built `DivePlan`.
    pub async fn fetch_domains(&self, domains: &[String], archive: &str) -> Pin<Box<dyn Stream<Item = DiveResult> + Send>> {
        if !self.available || domains.is_empty() {
            return Box::pin(stream::empty());
        }
        info!("fetching {} domains from {}", domains.len(), archive);

        let domains_path = match write_lines(domains).await {
            Ok(p) => p,
            Err(e) => {
                error!("failed to write domains file: {}", e);
                return Box::pin(stream::empty());
            }
        };

        let cmd = vec![
            self.binary.clone(),
            "batch".to_string(),
            format!("--input={}", domains_path.display()),
            format!("--archive={}", archive),
            format!("--threads={}", self.threads),
            format!("--timeout={}", self.timeout_secs),
        ];

        Box::pin(run_subprocess_stream(cmd, Some(domains_path), self.timeout_secs, None))
    }

    /// Fetches pre-computed CC Index records directly, bypassing plan
    /// construction entirely.
    pub async fn fetch_records(&self, records: &[CCRecord]) -> Pin<Box<dyn Stream<Item = DiveResult> + Send>> {
        if !self.available || records.is_empty() {
            return Box::pin(stream::empty());
        }
        info!("fetching {} pre-computed records", records.len());

        let fetch_records: Vec<FetchRecord> = records
            .iter()
            .map(|r| FetchRecord {
                url: r.url.clone(),
                filename: r.filename.clone(),
                offset: r.offset,
                length: r.length,
                domain: String::new(),
            })
            .collect();

        let records_path = match write_ndjson(&fetch_records, "records", "ndjson").await {
            Ok(p) => p,
            Err(e) => {
                error!("failed to write records file: {}", e);
                return Box::pin(stream::empty());
            }
        };

        let cmd = self.fetch_command(&records_path);
        Box::pin(run_subprocess_stream(cmd, Some(records_path), self.timeout_secs, None))
    }

    fn fetch_command(&self, records_path: &Path) -> Vec<String> {
        vec![
            self.binary.clone(),
            "fetch".to_string(),
            format!("--records={}", records_path.display()),
            format!("--threads={}", self.threads),
            format!("--timeout={}", self.timeout_secs),
        ]
    }
}

fn binary_available(binary: &str) -> bool {
    let path = Path::new(binary);
    if path.is_absolute() || binary.contains('/') {
        path.exists()
    } else {
        // Bare command name: resolution happens against PATH at spawn
        // time, which we can't cheaply probe here.
        true
    }
}

async fn write_ndjson<T: Serialize>(records: &[T], prefix: &str, ext: &str) -> std::io::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("deepwake-{}-{}.{}", prefix, Uuid::new_v4(), ext));
    let mut buf = String::new();
    for record in records {
        if let Ok(line) = serde_json::to_string(record) {
            buf.push_str(&line);
            buf.push('\n');
        }
    }
    tokio::fs::write(&path, buf).await?;
    Ok(path)
}

async fn write_lines(lines: &[String]) -> std::io::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("deepwake-domains-{}.txt", Uuid::new_v4()));
    let mut content = lines.join("\n");
    content.push('\n');
    tokio::fs::write(&path, content).await?;
    Ok(path)
}

/// Spawns `cmd`, streams parsed `DiveResult`s off its stdout, and tears
/// down the child and temp input file once the stream ends or its
/// consumer stops polling early.
fn run_subprocess_stream(
    cmd: Vec<String>,
    cleanup_path: Option<PathBuf>,
    timeout_secs: u64,
    mut checkpoint: Option<CheckpointState>,
) -> impl Stream<Item = DiveResult> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut child = match spawn_child(&cmd).await {
            Ok(c) => c,
            Err(e) => {
                error!("failed to spawn {}: {}", cmd.first().map(String::as_str).unwrap_or("ccwarc"), e);
                cleanup_file(&cleanup_path).await;
                return;
            }
        };

        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                error!("subprocess stdout was not piped");
                cleanup_file(&cleanup_path).await;
                return;
            }
        };
        let mut lines = BufReader::new(stdout).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Some(result) = parse_line(&line) else { continue };

                    if let Some(state) = checkpoint.as_mut() {
                        update_checkpoint(state, &result).await;
                    }

                    if tx.send(result).await.is_err() {
                        // Consumer dropped the stream before EOF.
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("failed to read subprocess stdout: {}", e);
                    break;
                }
            }
        }

        if let Ok(Some(status)) = child.try_wait() {
            if !status.success() {
                warn!("ccwarc exited with {}", status);
            }
        } else {
            terminate_child(&mut child).await;
        }
        cleanup_file(&cleanup_path).await;
    });

    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

async fn spawn_child(cmd: &[String]) -> std::io::Result<Child> {
    Command::new(&cmd[0])
        .args(&cmd[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// SIGTERM, wait up to `KILL_GRACE`, then SIGKILL if it's still alive —
/// mirroring `deep_dive/diver.py`'s `proc.terminate()` / `proc.kill()`
/// escalation.
async fn terminate_child(child: &mut Child) {
    if send_sigterm(child) {
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("subprocess did not exit within the grace period after SIGTERM, escalating to SIGKILL");
    }

    if let Err(e) = child.kill().await {
        warn!("failed to kill subprocess: {}", e);
        return;
    }
    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else { return false };
    // SAFETY: `pid` is the live child's process id per `Child::id`, and
    // SIGTERM is a standard, no-side-effect-on-us signal to send to it.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!("failed to send SIGTERM to subprocess {}: {}", pid, std::io::Error::last_os_error());
        return false;
    }
    true
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

async fn cleanup_file(path: &Option<PathBuf>) {
    if let Some(p) = path {
        let _ = tokio::fs::remove_file(p).await;
    }
}

fn parse_line(line: &str) -> Option<DiveResult> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(data) => Some(DiveResult {
            url: field_str(&data, "url"),
            domain: field_str(&data, "domain"),
            status: data.get("status").and_then(|v| v.as_u64()).unwrap_or(0) as u16,
            content_type: field_str(&data, "content_type"),
            content: field_str(&data, "content"),
            timestamp: field_str(&data, "timestamp"),
            warc_file: field_str(&data, "warc_file"),
            error: data.get("error").and_then(|v| v.as_str()).map(str::to_string),
        }),
        Err(_) => {
            let preview: String = trimmed.chars().take(100).collect();
            warn!("failed to parse ccwarc output line: {}", preview);
            None
        }
    }
}

fn field_str(data: &serde_json::Value, key: &str) -> String {
    data.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

async fn update_checkpoint(state: &mut CheckpointState, result: &DiveResult) {
    let domain = result.domain.trim();
    if domain.is_empty() {
        return;
    }
    let Some(&expected) = state.expected_by_domain.get(domain) else {
        return;
    };
    let processed = state.processed_by_domain.entry(domain.to_string()).or_insert(0);
    *processed += 1;
    if *processed < expected {
        return;
    }
    if !state.plan.completed_domains.insert(domain.to_string()) {
        return;
    }
    write_checkpoint(&state.checkpoint_path, &state.plan).await;
}

/// Write-to-tmp-then-rename so a concurrent reader never observes a
/// half-written checkpoint. Persists the full plan (`DivePlan::save_full`)
/// so resume can restore targets, CC records, and totals, not just the
/// set of completed domains.
async fn write_checkpoint(path: &Path, plan: &DivePlan) {
    let tmp_path = path.with_extension("tmp");
    let bytes = match plan.save_full() {
        Ok(b) => b,
        Err(e) => {
            warn!("failed to serialize checkpoint: {}", e);
            return;
        }
    };
    if let Err(e) = tokio::fs::write(&tmp_path, bytes).await {
        warn!("failed to write checkpoint tmp file: {}", e);
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        warn!("failed to rename checkpoint into place: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_time_matches_formula() {
        let diver = DeepDiver { binary: "ccwarc".to_string(), threads: 50, timeout_secs: 30, available: true };
        let est = diver.estimate_time(500);
        assert!((est.est_seconds - 1.0).abs() < 1e-9);
        assert_eq!(est.threads, 50);
    }

    #[test]
    fn parse_line_handles_malformed_json() {
        assert!(parse_line("not json").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn parse_line_defaults_missing_fields() {
        let result = parse_line(r#"{"url": "https://example.com/"}"#).unwrap();
        assert_eq!(result.url, "https://example.com/");
        assert_eq!(result.status, 0);
        assert!(result.error.is_none());
    }

    fn target(domain: &str, priority: u8) -> crate::core::types::DiveTarget {
        crate::core::types::DiveTarget {
            domain: domain.to_string(),
            priority,
            source: "domain".to_string(),
            cc_records: vec![CCRecord {
                url: format!("https://{}/", domain),
                filename: format!("{}.warc.gz", domain),
                offset: 0,
                length: 100,
                status: 200,
                mime: "text/html".to_string(),
                timestamp: "20250101000000".to_string(),
                digest: "abc".to_string(),
            }],
            estimated_pages: 1,
        }
    }

    #[tokio::test]
    async fn checkpoint_writes_only_once_domain_completes() {
        let dir = std::env::temp_dir().join(format!("deepwake-test-{}", Uuid::new_v4()));
        let checkpoint_path = dir.join("checkpoint.json");

        let mut state = CheckpointState {
            expected_by_domain: HashMap::from([("example.com".to_string(), 2)]),
            processed_by_domain: HashMap::new(),
            plan: DivePlan::new("example.com", "domain"),
            checkpoint_path: checkpoint_path.clone(),
        };

        let partial = DiveResult {
            url: "https://example.com/a".to_string(),
            domain: "example.com".to_string(),
            status: 200,
            content_type: "text/html".to_string(),
            content: String::new(),
            timestamp: String::new(),
            warc_file: String::new(),
            error: None,
        };
        update_checkpoint(&mut state, &partial).await;
        assert!(!state.plan.completed_domains.contains("example.com"));

        update_checkpoint(&mut state, &partial).await;
        assert!(state.plan.completed_domains.contains("example.com"));
    }

    #[test]
    fn checkpoint_round_trip_preserves_targets_and_completed_domains() {
        let mut plan = DivePlan::new("example.com", "domain");
        plan.add_target(target("a.example.com", 1));
        plan.add_target(target("b.example.com", 2));
        plan.completed_domains.insert("a.example.com".to_string());

        let bytes = plan.save_full().expect("serialize checkpoint");
        let restored = DivePlan::load(&bytes).expect("restore checkpoint");

        assert_eq!(restored.targets.len(), plan.targets.len());
        assert_eq!(restored.total_pages, plan.total_pages);
        assert_eq!(restored.completed_domains, plan.completed_domains);
        assert_eq!(restored.targets[0].cc_records[0].filename, "a.example.com.warc.gz");
    }

    #[tokio::test]
    async fn resume_skips_completed_domains_and_keeps_priority_order() {
        let diver = DeepDiver { binary: "/nonexistent/ccwarc".to_string(), threads: 4, timeout_secs: 1, available: false };

        let mut plan = DivePlan::new("example.com", "domain");
        plan.add_target(target("a.example.com", 1));
        plan.add_target(target("b.example.com", 2));
        plan.add_target(target("c.example.com", 3));
        plan.add_target(target("d.example.com", 4));
        plan.completed_domains.insert("a.example.com".to_string());
        plan.completed_domains.insert("b.example.com".to_string());

        let remaining: Vec<&str> = plan
            .targets
            .iter()
            .map(|t| t.domain.as_str())
            .filter(|d| !plan.completed_domains.contains(*d))
            .collect();
        assert_eq!(remaining, vec!["c.example.com", "d.example.com"]);

        // Binary unavailable: execute_plan must still short-circuit cleanly
        // rather than attempt to fetch completed domains.
        let mut stream = diver.execute_plan(&plan, None).await;
        assert!(stream.next().await.is_none());
    }
}
