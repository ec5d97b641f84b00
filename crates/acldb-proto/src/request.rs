//! Transport-independent request and response records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregate::AccumulatorSpec;
use crate::filter::{FilterNode, SortSpec};
use crate::record::ObjectRecord;
use crate::update::Update;
use crate::value::Value;

/// The closed set of operations a request can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Explain,
    Count,
    Find,
    Insert,
    InsertMany,
    UpdateOne,
    UpdateMany,
    UpsertOne,
    UpsertMany,
    FindOneAndDelete,
    FindAndDelete,
    GroupFind,
    Random,
    Nonrefs,
}

impl Operation {
    /// Stable operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Explain => "explain",
            Operation::Count => "count",
            Operation::Find => "find",
            Operation::Insert => "insert",
            Operation::InsertMany => "insertMany",
            Operation::UpdateOne => "updateOne",
            Operation::UpdateMany => "updateMany",
            Operation::UpsertOne => "upsertOne",
            Operation::UpsertMany => "upsertMany",
            Operation::FindOneAndDelete => "findOneAndDelete",
            Operation::FindAndDelete => "findAndDelete",
            Operation::GroupFind => "groupFind",
            Operation::Random => "random",
            Operation::Nonrefs => "nonrefs",
        }
    }

    /// Check if this operation writes.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Insert
                | Operation::InsertMany
                | Operation::UpdateOne
                | Operation::UpdateMany
                | Operation::UpsertOne
                | Operation::UpsertMany
                | Operation::FindOneAndDelete
                | Operation::FindAndDelete
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller identity and execution flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    /// Authenticated caller, if any.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Master key presented by the caller.
    #[serde(default)]
    pub master_key: Option<String>,
    /// Open transaction session to run in.
    #[serde(default)]
    pub session: Option<String>,
    /// Skip triggers. Requires master.
    #[serde(default)]
    pub silent: bool,
}

impl RequestOptions {
    /// Options for an authenticated user.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// Options carrying a master key.
    pub fn master(key: impl Into<String>) -> Self {
        Self {
            master_key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Run inside a transaction session.
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Skip triggers.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Attributes for a new object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewObject {
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(rename = "_rperm", default)]
    pub rperm: Option<Vec<String>>,
    #[serde(rename = "_wperm", default)]
    pub wperm: Option<Vec<String>>,
}

impl NewObject {
    /// An object with no attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set the read ACL.
    pub fn with_read_acl<S: Into<String>>(mut self, acl: impl IntoIterator<Item = S>) -> Self {
        self.rperm = Some(acl.into_iter().map(Into::into).collect());
        self
    }

    /// Set the write ACL.
    pub fn with_write_acl<S: Into<String>>(mut self, acl: impl IntoIterator<Item = S>) -> Self {
        self.wperm = Some(acl.into_iter().map(Into::into).collect());
        self
    }
}

/// A request against one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub operation: Operation,
    pub class_name: String,
    #[serde(default)]
    pub filter: Option<FilterNode>,
    #[serde(default)]
    pub update: Option<Update>,
    #[serde(default)]
    pub set_on_insert: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub accumulators: BTreeMap<String, AccumulatorSpec>,
    #[serde(default)]
    pub objects: Vec<NewObject>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Attribute projection; builtins are always returned.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Pointer/relation paths expanded into the response.
    #[serde(default)]
    pub includes: Vec<String>,
    /// Required row version for `updateOne`.
    #[serde(default)]
    pub expected_version: Option<u64>,
    #[serde(default)]
    pub options: RequestOptions,
}

impl Request {
    /// Create a request with no filter or payload.
    pub fn new(operation: Operation, class_name: impl Into<String>) -> Self {
        Self {
            operation,
            class_name: class_name.into(),
            filter: None,
            update: None,
            set_on_insert: None,
            accumulators: BTreeMap::new(),
            objects: Vec::new(),
            sort: Vec::new(),
            skip: None,
            limit: None,
            keys: Vec::new(),
            includes: Vec::new(),
            expected_version: None,
            options: RequestOptions::default(),
        }
    }

    pub fn find(class_name: impl Into<String>) -> Self {
        Self::new(Operation::Find, class_name)
    }

    pub fn count(class_name: impl Into<String>) -> Self {
        Self::new(Operation::Count, class_name)
    }

    pub fn insert(class_name: impl Into<String>, object: NewObject) -> Self {
        Self::new(Operation::Insert, class_name).with_object(object)
    }

    pub fn update_one(class_name: impl Into<String>, filter: FilterNode, update: Update) -> Self {
        Self::new(Operation::UpdateOne, class_name)
            .with_filter(filter)
            .with_update(update)
    }

    pub fn group_find(class_name: impl Into<String>) -> Self {
        Self::new(Operation::GroupFind, class_name)
    }

    pub fn with_filter(mut self, filter: FilterNode) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    pub fn with_update(mut self, update: Update) -> Self {
        self.update = Some(update);
        self
    }

    pub fn with_set_on_insert(mut self, attributes: BTreeMap<String, Value>) -> Self {
        self.set_on_insert = Some(attributes);
        self
    }

    pub fn with_accumulator(mut self, name: impl Into<String>, spec: AccumulatorSpec) -> Self {
        self.accumulators.insert(name.into(), spec);
        self
    }

    pub fn with_object(mut self, object: NewObject) -> Self {
        self.objects.push(object);
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_include(mut self, path: impl Into<String>) -> Self {
        self.includes.push(path.into());
        self
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Shorthand for running as a user.
    pub fn as_user(self, user_id: impl Into<String>) -> Self {
        self.with_options(RequestOptions::user(user_id))
    }

    /// Shorthand for running with a master key.
    pub fn as_master(self, key: impl Into<String>) -> Self {
        self.with_options(RequestOptions::master(key))
    }
}

/// Result of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "result", rename_all = "camelCase")]
pub enum Response {
    /// Compiled query, not executed.
    Explain(serde_json::Value),
    Count(u64),
    Objects(Vec<ObjectRecord>),
    Object(Option<ObjectRecord>),
    Aggregate(Value),
    Affected(u64),
    /// Ids of rows with dangling references, keyed by field path.
    Nonrefs(BTreeMap<String, Vec<String>>),
}

impl Response {
    /// Take the returned objects, if any.
    pub fn into_objects(self) -> Vec<ObjectRecord> {
        match self {
            Response::Objects(objects) => objects,
            Response::Object(Some(object)) => vec![object],
            _ => Vec::new(),
        }
    }

    /// Take the single returned object.
    pub fn into_object(self) -> Option<ObjectRecord> {
        match self {
            Response::Object(object) => object,
            Response::Objects(objects) => objects.into_iter().next(),
            _ => None,
        }
    }

    /// Count or affected-row total.
    pub fn count(&self) -> Option<u64> {
        match self {
            Response::Count(n) | Response::Affected(n) => Some(*n),
            _ => None,
        }
    }

    /// Aggregation output.
    pub fn aggregate(&self) -> Option<&Value> {
        match self {
            Response::Aggregate(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_json() {
        let json = serde_json::json!({
            "operation": "updateOne",
            "className": "Counter",
            "filter": {"field": {"path": "name", "selector": {"eq": "hits"}}},
            "update": [["value", {"kind": "inc", "value": 1}]],
            "options": {"userId": "u1"}
        });
        let request: Request = serde_json::from_value(json).unwrap();
        assert_eq!(request.operation, Operation::UpdateOne);
        assert_eq!(request.options.user_id.as_deref(), Some("u1"));
        assert!(request.update.is_some());
        assert!(request.includes.is_empty());
    }

    #[test]
    fn test_with_filter_conjoins() {
        let request = Request::find("Post")
            .with_filter(FilterNode::eq("a", 1))
            .with_filter(FilterNode::eq("b", 2));
        assert!(matches!(request.filter, Some(FilterNode::All(ref nodes)) if nodes.len() == 2));
    }
}
