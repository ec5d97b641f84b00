//! acldb protocol types.
//!
//! This crate defines the backend-agnostic data model shared by every layer
//! of the store: dynamic values, stored records, filter trees, update
//! operations, accumulator specifications, and the request/response records
//! that enter and leave the query pipeline.
//!
//! # Modules
//!
//! - [`value`] - Dynamic attribute values
//! - [`record`] - Stored object records
//! - [`filter`] - Filter trees, selectors, and `$expr` expressions
//! - [`update`] - Per-path update operations
//! - [`aggregate`] - Accumulator specifications
//! - [`request`] - Requests, options, and responses
//! - [`error`] - Decoding errors
//!
//! # Serialization
//!
//! Every type is `serde` (de)serializable. Values that JSON cannot express
//! natively are encoded as objects tagged with `__type`:
//!
//! ```ignore
//! use acldb_proto::Value;
//!
//! let json = serde_json::json!({"__type": "Decimal", "value": "10.5"});
//! let value: Value = serde_json::from_value(json).unwrap();
//! ```

pub mod aggregate;
pub mod error;
pub mod filter;
pub mod record;
pub mod request;
pub mod update;
pub mod value;

pub use aggregate::{AccExpr, AccumulatorSpec, PercentileMode};
pub use error::Error;
pub use filter::{
    BinaryOp, CompareOp, Expr, FilterNode, MatchSpec, Selector, SortDirection, SortSpec,
    PLACEHOLDER,
};
pub use record::{acl_from_value, is_builtin, ObjectRecord, BUILTIN_KEYS};
pub use request::{NewObject, Operation, Request, RequestOptions, Response};
pub use update::{Update, UpdateOp};
pub use value::{split_path, FileRef, ObjectRef, Value};
