//! Extractor (§4.7): a stateless text-to-entities converter. Pattern
//! families are modeled directly on `extract.rs`'s tiered regex shape
//! (`extract_emails`/`extract_phones`: one `regex::Regex` per family, a
//! fixed confidence per family rather than a learned score) — extended
//! here with the identifier/crypto/name tiers the OSINT domain needs
//! that the teacher's contact-extraction crate never had to cover.

use crate::core::types::{ExtractedEntity, ExtractionResult};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Input longer than this is truncated before any regex runs, mirroring
/// the teacher's content-length guards on scrape/extract inputs.
const MAX_INPUT_CHARS: usize = 500_000;

/// Per-family output cap, so a single pathological page (e.g. a word
/// list) can't blow up a chain run's entity count.
const MAX_PER_FAMILY: usize = 200;

const COMPANY_SUFFIXES: &[&str] = &["Ltd", "LLC", "Inc", "Corp", "PLC", "SA", "AG", "GmbH", "BV"];

static SCRIPT_STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</\1>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?\d[\d\-\s().]{7,}\d").unwrap());
static URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).unwrap());

static LEI_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z0-9]{18}\d{2}\b").unwrap());
static IBAN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z]{2}\d{2}[A-Z0-9]{11,30}\b").unwrap());
static SWIFT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z]{4}[A-Z]{2}[A-Z0-9]{2}([A-Z0-9]{3})?\b").unwrap());
static VAT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z]{2}\d{8,12}\b").unwrap());

static BTC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:[13][a-km-zA-HJ-NP-Z1-9]{25,34}|bc1[a-z0-9]{25,39})\b").unwrap());
static ETH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b0x[a-fA-F0-9]{40}\b").unwrap());

static PERSON_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]+(?:\s[A-Z][a-z]+){1,2}\b").unwrap());
static COMPANY_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    let suffixes = COMPANY_SUFFIXES.join("|");
    Regex::new(&format!(r"\b[A-Z][\w&.,'-]{{1,60}}\s(?:{})\.?\b", suffixes)).unwrap()
});

/// Strips `<script>`/`<style>` blocks and remaining tags, then collapses
/// whitespace. Input is capped first so a pathological payload can't
/// make the regex passes expensive.
pub fn strip_html(text: &str) -> String {
    let capped: String = text.chars().take(MAX_INPUT_CHARS).collect();
    let no_scripts = SCRIPT_STYLE_RE.replace_all(&capped, " ");
    let no_tags = TAG_RE.replace_all(&no_scripts, " ");
    WHITESPACE_RE.replace_all(no_tags.trim(), " ").to_string()
}

/// Stateless `extract(text, url?, domain?) -> ExtractionResult` (§4.7).
pub fn extract(text: &str, url: Option<&str>, domain: Option<&str>) -> ExtractionResult {
    let cleaned = strip_html(text);
    let source = url.or(domain).unwrap_or("unknown").to_string();

    let mut entities = Vec::new();
    extract_identifiers(&cleaned, &source, &mut entities);
    extract_contacts(&cleaned, &source, &mut entities);
    extract_crypto(&cleaned, &source, &mut entities);
    extract_names(&cleaned, &source, &mut entities);

    let mut seen = HashSet::new();
    let mut warnings = Vec::new();
    entities.retain(|e| seen.insert(e.dedup_key()));

    if entities.is_empty() && !cleaned.is_empty() {
        warnings.push("no entities matched any extraction family".to_string());
    }

    ExtractionResult { entities, warnings }
}

fn push_capped(entities: &mut Vec<ExtractedEntity>, family_count: &mut usize, entity: ExtractedEntity) {
    if *family_count >= MAX_PER_FAMILY {
        return;
    }
    *family_count += 1;
    entities.push(entity);
}

/// LEI/IBAN/SWIFT/VAT: validated identifier formats, confidence 0.9.
fn extract_identifiers(text: &str, source: &str, entities: &mut Vec<ExtractedEntity>) {
    let mut count = 0usize;
    for (re, entity_type) in [
        (&*LEI_RE, "lei"),
        (&*IBAN_RE, "iban"),
        (&*SWIFT_RE, "swift"),
        (&*VAT_RE, "vat"),
    ] {
        for m in re.find_iter(text) {
            push_capped(
                entities,
                &mut count,
                ExtractedEntity {
                    value: m.as_str().to_string(),
                    entity_type: entity_type.to_string(),
                    confidence: 0.9,
                    source: source.to_string(),
                    context: None,
                    metadata: Default::default(),
                },
            );
        }
    }
}

/// Email/phone/URL: plain regex pass, confidence 0.7.
fn extract_contacts(text: &str, source: &str, entities: &mut Vec<ExtractedEntity>) {
    let mut count = 0usize;
    for m in EMAIL_RE.find_iter(text) {
        push_capped(
            entities,
            &mut count,
            ExtractedEntity {
                value: m.as_str().to_string(),
                entity_type: "email".to_string(),
                confidence: 0.7,
                source: source.to_string(),
                context: None,
                metadata: Default::default(),
            },
        );
    }
    for m in PHONE_RE.find_iter(text) {
        let digits = m.as_str().chars().filter(|c| c.is_ascii_digit()).count();
        if digits < 8 {
            continue;
        }
        push_capped(
            entities,
            &mut count,
            ExtractedEntity {
                value: m.as_str().trim().to_string(),
                entity_type: "phone".to_string(),
                confidence: 0.7,
                source: source.to_string(),
                context: None,
                metadata: Default::default(),
            },
        );
    }
    for m in URL_RE.find_iter(text) {
        push_capped(
            entities,
            &mut count,
            ExtractedEntity {
                value: m.as_str().to_string(),
                entity_type: "url".to_string(),
                confidence: 0.7,
                source: source.to_string(),
                context: None,
                metadata: Default::default(),
            },
        );
    }
}

/// BTC/ETH address prefixes, confidence 0.8 (between plain-regex
/// contacts and validated identifiers: the pattern is distinctive but
/// unchecksummed).
fn extract_crypto(text: &str, source: &str, entities: &mut Vec<ExtractedEntity>) {
    let mut count = 0usize;
    for (re, entity_type) in [(&*BTC_RE, "btc_address"), (&*ETH_RE, "eth_address")] {
        for m in re.find_iter(text) {
            push_capped(
                entities,
                &mut count,
                ExtractedEntity {
                    value: m.as_str().to_string(),
                    entity_type: entity_type.to_string(),
                    confidence: 0.8,
                    source: source.to_string(),
                    context: None,
                    metadata: Default::default(),
                },
            );
        }
    }
}

/// Person/company names via capitalized-token heuristics and the
/// company-suffix dictionary. Confidence is lower and variable since
/// these are the least precise families.
fn extract_names(text: &str, source: &str, entities: &mut Vec<ExtractedEntity>) {
    let mut count = 0usize;
    for m in COMPANY_NAME_RE.find_iter(text) {
        push_capped(
            entities,
            &mut count,
            ExtractedEntity {
                value: m.as_str().trim().to_string(),
                entity_type: "company".to_string(),
                confidence: 0.65,
                source: source.to_string(),
                context: None,
                metadata: Default::default(),
            },
        );
    }
    let mut count = 0usize;
    for m in PERSON_NAME_RE.find_iter(text) {
        let value = m.as_str().to_string();
        if COMPANY_SUFFIXES.iter().any(|s| value.ends_with(*s)) {
            continue;
        }
        push_capped(
            entities,
            &mut count,
            ExtractedEntity {
                value,
                entity_type: "person_name".to_string(),
                confidence: 0.5,
                source: source.to_string(),
                context: None,
                metadata: Default::default(),
            },
        );
    }
}
