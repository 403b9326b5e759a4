//! Context Management Module
//!
//! Keeps a growing conversation inside a fixed token budget: importance
//! pinning, budgeted assembly, and compaction of old history into summaries.

pub mod budget;
pub mod classification;
pub mod compression;
pub mod knowledge;
pub mod style;
pub mod tokens;

// Re-export public types for external use
pub use budget::{AssembledContext, BudgetStatus, ContextAssembler, ThresholdStatus};
pub use classification::{ClassificationReport, ImportanceClassifier, KeywordRule, Verdict};
pub use compression::{CompactionOutcome, Compactor, SUMMARY_PREFIX};
pub use knowledge::{KnowledgeExtractor, KnowledgeOutcome, KnowledgeSource};
pub use style::{StyleAnalyzer, StyleOutcome, StyleSource};
pub use tokens::{estimator_for, Cl100kEstimator, TokenEstimator, WhitespaceEstimator};
