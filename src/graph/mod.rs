//! Graph layer: node models, schema DDL and the typed store.
//!
//! The graph is realized on PostgreSQL: entity and pattern nodes are rows,
//! the SUMMARIZES edge is the `(entity_id, entity_type)` reference a summary
//! carries, and MERGE semantics come from `ON CONFLICT` upserts against
//! uniqueness constraints.

pub mod models;
pub mod schema;
pub mod store;

pub use models::{
    scope_id_for, DetectionTrigger, EntitySummary, EntityType, PatternCandidate, PatternMetadata,
    PatternSignals, PatternSummary, RawEntity, RawEntityRef, ScopeData, SignalKind,
};
pub use schema::GraphSchema;
pub use store::{
    DuplicateGroup, EntityStore, KeywordGroup, MemoryCodeGroup, NewSummary, OrphanReport,
    OrphanSummary, SeedSummary, SimilarMatch, TemporalGroup,
};
