//! Archive acquisition components (§4.2-§4.6): Periscope (CC Index
//! client), Sonar (entity lookup), Dive Planner, Deep Diver, and the
//! Parallel Archive Processor.

pub mod deep_diver;
pub mod dive_planner;
pub mod parallel_processor;
pub mod periscope;
pub mod sonar;
