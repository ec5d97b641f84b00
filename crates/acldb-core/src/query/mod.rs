//! Query compilation and evaluation.
//!
//! Requests are written against the schema: paths may cross pointers and
//! relations, and selectors may attach sub-queries or accumulators to a
//! relation. This module lowers them to single-class [`CompiledQuery`]s that
//! a storage backend can run, plus per-record attachments.
//!
//! # Components
//!
//! - [`PathResolver`] classifies each segment of a dotted path
//! - [`RelationExpander`] turns relation segments into visible id sets
//! - [`QueryCompiler`] lowers filter trees, sorts, and updates
//! - [`matches`] evaluates compiled filters in memory
//! - [`AggregationEngine`] reduces document sequences with accumulators
//! - [`Normalizer`] rewrites literals to NFD and bounds their depth

mod aggregate;
mod compiler;
mod evaluator;
mod expr;
mod normalize;
mod numeric;
mod order;
mod path;
mod plan;
mod relation;
mod update;

pub use aggregate::AggregationEngine;
pub use compiler::{validate_filter, QueryCompiler};
pub use evaluator::{matches, Document, ElementDoc, EmptyDocument};
pub use expr::evaluate;
pub use normalize::{nfd, Normalizer};
pub use numeric::Numeric;
pub use order::{compare_documents, compare_to_cursor, paginate, sort_documents, sort_key};
pub use path::{
    split_segments, validate_element_path, PathPlan, PathResolver, PathSegment, SegmentKind,
};
pub use plan::{
    Attachment, AttachmentOutput, AttachmentSource, CompiledFilter, CompiledPlan, CompiledQuery,
    Cursor, Narrowing, PatternRegex, SetOp,
};
pub use relation::RelationExpander;
pub(crate) use relation::reference_ids;
pub use update::apply_update;
