//! Synchronous, fire-and-forget event emitter used by the Dive Planner,
//! Deep Diver, and Chain Executor to report progress (§2, §4.9).
//!
//! Python's "swallow exceptions from the callback" contract has no
//! direct Rust analogue — a callback here is a plain closure, and a
//! panicking closure is the caller's bug, not something this module
//! catches. What carries over is that the *emitter* never aborts because
//! of what the callback does with the event: emission is a cheap,
//! in-line call, not a fallible operation the core branches on.

use serde_json::Value;
use std::sync::Arc;

pub type EventCallback = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Invoke `callback` if present. Centralizing this (rather than inlining
/// `if let Some(cb) = callback { cb(...) }` at every call site) is where
/// a future backpressure policy (buffer vs. drop-on-full) would live per
/// §9's re-architecture hint, without touching call sites.
pub fn emit(callback: &Option<EventCallback>, event_type: &str, data: Value) {
    if let Some(cb) = callback {
        cb(event_type, data);
    }
}

/// Emitted at every point the original silently swallowed an exception
/// (WHOIS/date parse failures, list-vs-scalar payload ambiguity, etc.) —
/// see DESIGN.md's Open Question decision. Never aborts the caller.
pub fn emit_warning(callback: &Option<EventCallback>, site: &str, detail: impl Into<String>) {
    emit(
        callback,
        "internal:warning",
        serde_json::json!({ "site": site, "detail": detail.into() }),
    );
}
