//! Service layer: the aggregation pipeline stages and the cross-cutting
//! primitives they share.

pub mod addon;
pub mod crypto;
pub mod debrid;
pub mod dedupe;
pub mod enrich;
pub mod expression;
pub mod fetch;
pub mod filter;
pub mod format;
pub mod lock;
pub mod metadata;
pub mod orchestrator;
pub mod parser;
pub mod proxify;
pub mod redis;
pub mod sort;
