//! Archive-first OSINT acquisition and entity-graph construction engine
//! (§1-§2): a pluggable chain executor over typed recursive investigation
//! strategies, a Common Crawl dive planner/deep diver for surgical WARC
//! acquisition, a parallel archive processor for bulk WAT traversal, and
//! a stateless entity extractor. Everything in [`contracts`] is consumed,
//! not implemented, by this crate — callers supply a [`contracts::RuleExecutor`]
//! and optionally a [`contracts::EntityStore`].

pub mod archive;
pub mod chain;
pub mod contracts;
pub mod core;
pub mod error;
pub mod events;
pub mod extract;
pub mod registry;

pub use chain::ChainExecutor;
pub use contracts::{EntityStore, RuleExecutionResult, RuleExecutor};
pub use core::config::EngineConfig;
pub use core::state::ExecutorState;
pub use core::types::*;
pub use error::{CCIndexError, CoreError, CoreResult};
pub use events::EventCallback;
pub use extract::extract;
pub use registry::RuleRegistry;
