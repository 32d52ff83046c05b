//! Result rendering
//!
//! Renderers consume the aggregated [`Results`](crate::stats::Results)
//! together with the spec that produced them; they never reach back into
//! worker state.

pub mod json;
pub mod text;
