//! strata-lib: layered configuration and instance reconciliation.
//!
//! - [`merge`]: folds layered YAML documents into one, honouring merge directives
//! - [`graph`]: the instance graph built from `node_templates`
//! - [`eval`]: path expressions and functions evaluated against the graph
//! - [`reconcile`]: runs configurators over the graph in dependency order
//! - [`state`]: persisted state documents between passes

pub mod config;
pub mod document;
pub mod ensemble;
pub mod environment;
pub mod eval;
pub mod graph;
pub mod merge;
pub mod reconcile;
pub mod state;
pub mod units;
pub mod util;
pub mod value;
