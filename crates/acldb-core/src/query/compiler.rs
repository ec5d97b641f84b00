//! Filter, sort, and update compilation.
//!
//! [`QueryCompiler`] lowers schema-level [`FilterNode`] trees into
//! single-class [`CompiledFilter`]s:
//!
//! - Local paths become plain predicates.
//! - Paths crossing a pointer or relation compile the remainder against the
//!   target class, collect the visible matching ids, and become a
//!   `RefIn`/`IdIn` predicate on the owner.
//! - Predicates on fields the caller cannot read are folded as if the field
//!   were missing, so results never depend on hidden values.
//! - Top-level `match`/`countMatches`/`groupMatches` selectors become
//!   attachments, and conjuncts on their paths become the residual filter.
//!
//! The caller's row filter is always part of the compiled query.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use acldb_proto::{is_builtin, Expr, FilterNode, MatchSpec, Selector, SortSpec, Update, UpdateOp, Value};

use crate::catalog::{ClassDef, Schema};
use crate::error::{Result, ValidationError};
use crate::security::PermissionEnforcer;
use crate::storage::StorageBackend;

use super::evaluator::{matches, EmptyDocument};
use super::path::{validate_element_path, PathPlan, PathResolver, PathSegment, SegmentKind};
use super::plan::{
    Attachment, AttachmentOutput, AttachmentSource, CompiledFilter, CompiledPlan, CompiledQuery,
    Narrowing, PatternRegex, SetOp,
};
use super::relation::{reference_ids, RelationExpander};

/// Compiles requests for one caller against one backend.
pub struct QueryCompiler<'a> {
    expander: RelationExpander<'a>,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(enforcer: PermissionEnforcer<'a>, backend: &'a dyn StorageBackend) -> Self {
        Self {
            expander: RelationExpander::new(enforcer, backend),
        }
    }

    pub fn expander(&self) -> &RelationExpander<'a> {
        &self.expander
    }

    fn enforcer(&self) -> PermissionEnforcer<'a> {
        self.expander.enforcer()
    }

    fn schema(&self) -> &'a Schema {
        self.enforcer().schema()
    }

    fn resolve(&self, class: &ClassDef, path: &str) -> Result<PathPlan> {
        Ok(PathResolver::new(self.schema()).resolve(&class.name, path)?)
    }

    /// Compile a read.
    pub async fn compile(
        &self,
        class: &ClassDef,
        filter: Option<&FilterNode>,
        sort: &[SortSpec],
        skip: Option<usize>,
        limit: Option<usize>,
    ) -> Result<CompiledPlan> {
        let conjuncts: Vec<&FilterNode> = match filter {
            Some(FilterNode::All(nodes)) => nodes.iter().collect(),
            Some(node) => vec![node],
            None => Vec::new(),
        };

        let mut attachments = Vec::new();
        let mut rest = Vec::new();
        for node in conjuncts {
            match node {
                FilterNode::Field { path, selector } if selector.is_attachment() => {
                    attachments.push(self.compile_attachment(class, path, selector).await?);
                }
                other => rest.push(other),
            }
        }

        let mut pushed = vec![self.enforcer().row_filter(class)];
        let mut residual = Vec::new();
        for node in rest {
            match node {
                FilterNode::Field { path, selector } if is_attached(&attachments, path) => {
                    residual.push(compile_local(path, selector)?);
                }
                other => pushed.push(self.compile_filter(class, other).await?),
            }
        }

        let residual = CompiledFilter::and(residual);
        let sort = self.compile_sort(class, sort)?;
        let mut query = CompiledQuery::new(&class.name)
            .with_filter(CompiledFilter::and(pushed))
            .with_sort(sort);
        let (skip, limit) = if residual.is_true() {
            query = query.with_skip(skip).with_limit(limit);
            (None, None)
        } else {
            (skip, limit)
        };
        debug!(
            class = %class.name,
            attachments = attachments.len(),
            pushdown = residual.is_true(),
            "compiled read"
        );
        Ok(CompiledPlan {
            query,
            attachments,
            residual,
            skip,
            limit,
        })
    }

    /// Compile a filter tree on a class.
    pub fn compile_filter<'b>(
        &'b self,
        class: &'b ClassDef,
        node: &'b FilterNode,
    ) -> BoxFuture<'b, Result<CompiledFilter>> {
        async move {
            Ok(match node {
                FilterNode::All(nodes) => {
                    let mut out = Vec::with_capacity(nodes.len());
                    for node in nodes {
                        out.push(self.compile_filter(class, node).await?);
                    }
                    CompiledFilter::and(out)
                }
                FilterNode::Any(nodes) => {
                    let mut out = Vec::with_capacity(nodes.len());
                    for node in nodes {
                        out.push(self.compile_filter(class, node).await?);
                    }
                    CompiledFilter::or(out)
                }
                FilterNode::Not(inner) => {
                    CompiledFilter::negate(self.compile_filter(class, inner).await?)
                }
                FilterNode::Expr(expr) => CompiledFilter::Expr(self.compile_expr(class, expr)?),
                FilterNode::Field { path, selector } => {
                    self.compile_field(class, path, selector).await?
                }
            })
        }
        .boxed()
    }

    async fn compile_field(
        &self,
        class: &ClassDef,
        path: &str,
        selector: &Selector,
    ) -> Result<CompiledFilter> {
        if selector.is_attachment() {
            return Err(ValidationError::InvalidArgument(format!(
                "{path}: match selectors are only allowed at the top level of a read"
            ))
            .into());
        }
        let plan = self.resolve(class, path)?;
        if !self.enforcer().can_read_field(class, plan.top_field()) {
            return fold_missing(path, selector);
        }
        let Some(index) = plan.first_boundary() else {
            return compile_local(path, selector);
        };
        let segment = &plan.segments[index];
        match plan.remainder(index) {
            Some(rest) => {
                let target = self.target_class(segment)?;
                let sub = self
                    .compile_filter(target, &FilterNode::field(rest, selector.clone()))
                    .await?;
                self.having_member(segment, sub).await
            }
            None => self.compile_reference(segment, selector).await,
        }
    }

    /// Selectors applied to a pointer or relation itself.
    async fn compile_reference(
        &self,
        segment: &PathSegment,
        selector: &Selector,
    ) -> Result<CompiledFilter> {
        let target = self.target_class(segment)?;
        let ids_of = |values: &[Value]| -> BTreeSet<String> {
            values.iter().flat_map(reference_ids).collect()
        };
        let any = CompiledFilter::True;
        Ok(match selector {
            Selector::Some(node) => {
                let sub = self.compile_member_filter(target, node).await?;
                self.having_member(segment, sub).await?
            }
            Selector::Every(node) => {
                let sub = self.compile_member_filter(target, node).await?;
                let violating = self.having_member(segment, CompiledFilter::negate(sub)).await?;
                CompiledFilter::negate(violating)
            }
            Selector::Exists(true) | Selector::NotEmpty => self.having_member(segment, any).await?,
            Selector::Exists(false) | Selector::Empty => {
                CompiledFilter::negate(self.having_member(segment, any).await?)
            }
            Selector::Eq(Value::Null) => CompiledFilter::negate(self.having_member(segment, any).await?),
            Selector::Ne(Value::Null) => self.having_member(segment, any).await?,
            Selector::Eq(value) => {
                let ids = reference_ids(value);
                self.having_member(segment, CompiledFilter::IdIn(ids)).await?
            }
            Selector::Ne(value) => {
                let ids = reference_ids(value);
                CompiledFilter::negate(self.having_member(segment, CompiledFilter::IdIn(ids)).await?)
            }
            Selector::ContainedIn(values) => {
                self.having_member(segment, CompiledFilter::IdIn(ids_of(values)))
                    .await?
            }
            Selector::NotContainedIn(values) => CompiledFilter::negate(
                self.having_member(segment, CompiledFilter::IdIn(ids_of(values)))
                    .await?,
            ),
            Selector::Size(_) if segment.kind == SegmentKind::Relation && !segment.is_implicit() => {
                compile_local(&segment.local_path, selector)?
            }
            other => {
                return Err(ValidationError::InvalidArgument(format!(
                    "{other:?} cannot be applied to reference {}",
                    segment.field
                ))
                .into())
            }
        })
    }

    /// Owner filter: some visible member inside the relation's default match
    /// satisfies `sub`.
    async fn having_member(&self, segment: &PathSegment, sub: CompiledFilter) -> Result<CompiledFilter> {
        let target = self.target_class(segment)?;
        let sub = match segment.default_match().and_then(|d| d.filter.as_ref()) {
            Some(node) => CompiledFilter::and([self.compile_filter(target, node).await?, sub]),
            None => sub,
        };
        let members = self.expander.visible_ids(&target.name, sub).await?;
        self.expander.owners_filter(segment, members).await
    }

    /// Compile a quantifier sub-filter over relation members.
    async fn compile_member_filter(&self, target: &ClassDef, node: &FilterNode) -> Result<CompiledFilter> {
        let node = strip_placeholder(node);
        self.compile_filter(target, &node).await
    }

    fn compile_expr(&self, class: &ClassDef, expr: &Expr) -> Result<Expr> {
        Ok(match expr {
            Expr::Key(path) => {
                let plan = self.resolve(class, path)?;
                if plan.crosses_boundary() {
                    return Err(ValidationError::InvalidArgument(format!(
                        "$expr key {path} cannot cross a reference"
                    ))
                    .into());
                }
                if self.enforcer().can_read_field(class, plan.top_field()) {
                    expr.clone()
                } else {
                    Expr::Value(Value::Null)
                }
            }
            Expr::Value(_) => expr.clone(),
            Expr::Array(items) => Expr::Array(self.compile_exprs(class, items)?),
            Expr::And(items) => Expr::And(self.compile_exprs(class, items)?),
            Expr::Or(items) => Expr::Or(self.compile_exprs(class, items)?),
            Expr::Not(inner) => Expr::Not(Box::new(self.compile_expr(class, inner)?)),
            Expr::Compare { op, left, right } => Expr::Compare {
                op: *op,
                left: Box::new(self.compile_expr(class, left)?),
                right: Box::new(self.compile_expr(class, right)?),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(self.compile_expr(class, left)?),
                right: Box::new(self.compile_expr(class, right)?),
            },
        })
    }

    fn compile_exprs(&self, class: &ClassDef, items: &[Expr]) -> Result<Vec<Expr>> {
        items.iter().map(|item| self.compile_expr(class, item)).collect()
    }

    /// Validate sort keys, dropping the ones the caller cannot read.
    pub fn compile_sort(&self, class: &ClassDef, sort: &[SortSpec]) -> Result<Vec<SortSpec>> {
        let mut out = Vec::with_capacity(sort.len());
        for spec in sort {
            let plan = self.resolve(class, &spec.path)?;
            if plan.crosses_boundary() {
                return Err(ValidationError::InvalidArgument(format!(
                    "cannot sort by {} across a reference",
                    spec.path
                ))
                .into());
            }
            if self.enforcer().can_read_field(class, plan.top_field()) {
                out.push(spec.clone());
            }
        }
        Ok(out)
    }

    async fn compile_attachment(
        &self,
        class: &ClassDef,
        path: &str,
        selector: &Selector,
    ) -> Result<Attachment> {
        let (spec, output) = match selector {
            Selector::Match(spec) => (spec, AttachmentOutput::Members),
            Selector::CountMatches(spec) => (spec, AttachmentOutput::Count),
            Selector::GroupMatches { spec, accumulators } => {
                (spec, AttachmentOutput::Group(accumulators.clone()))
            }
            _ => {
                return Err(ValidationError::InvalidArgument(format!("{path} is not an attachment")).into())
            }
        };
        let plan = self.resolve(class, path)?;
        let last = plan.segments.len() - 1;
        let source = match plan.first_boundary() {
            Some(index) if index == last => {
                let segment = plan.last().clone();
                let narrowing = self.relation_narrowing(&segment, Some(spec)).await?;
                AttachmentSource::Relation { segment, narrowing }
            }
            None => AttachmentSource::Elements {
                filter: match &spec.filter {
                    Some(node) => compile_element(node)?,
                    None => CompiledFilter::True,
                },
                sort: spec.sort.clone(),
                skip: spec.skip,
                limit: spec.limit,
            },
            Some(_) => {
                return Err(ValidationError::InvalidArgument(format!(
                    "{path}: attachments must end at a relation or an array"
                ))
                .into())
            }
        };
        Ok(Attachment {
            path: path.to_string(),
            source,
            output,
        })
    }

    /// Narrowing for a relation: its default match composed with `spec`.
    pub async fn relation_narrowing(
        &self,
        segment: &PathSegment,
        spec: Option<&MatchSpec>,
    ) -> Result<Narrowing> {
        let target = self.target_class(segment)?;
        let default = segment.default_match();

        let mut filters = Vec::new();
        if let Some(node) = default.and_then(|d| d.filter.as_ref()) {
            filters.push(self.compile_filter(target, node).await?);
        }
        if let Some(node) = spec.and_then(|s| s.filter.as_deref()) {
            filters.push(self.compile_member_filter(target, node).await?);
        }
        let filter = CompiledFilter::and(filters);

        let requested = spec.map(|s| s.sort.as_slice()).unwrap_or_default();
        let sort = if requested.is_empty() {
            default.map(|d| d.sort.as_slice()).unwrap_or_default()
        } else {
            requested
        };
        let limit = match (spec.and_then(|s| s.limit), default.and_then(|d| d.limit)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        Ok(Narrowing {
            filter: (!filter.is_true()).then_some(filter),
            sort: self.compile_sort(target, sort)?,
            skip: spec.and_then(|s| s.skip),
            limit,
        })
    }

    /// Validate an update: known local paths, writable fields, typed values.
    pub fn check_update(&self, class: &ClassDef, update: &Update) -> Result<()> {
        for (path, op) in &update.ops {
            let plan = self.resolve(class, path)?;
            self.check_writable_path(class, &plan)?;
            if let UpdateOp::Set(value) = op {
                check_type(&plan, value)?;
            }
        }
        Ok(())
    }

    /// Validate the attributes of a new object.
    pub fn check_attributes(&self, class: &ClassDef, attributes: &BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in attributes {
            if is_builtin(name) {
                return Err(ValidationError::InvalidArgument(format!("{name} is managed by the store")).into());
            }
            let plan = self.resolve(class, name)?;
            self.check_writable_path(class, &plan)?;
            check_type(&plan, value)?;
        }
        Ok(())
    }

    fn check_writable_path(&self, class: &ClassDef, plan: &PathPlan) -> Result<()> {
        if plan.crosses_boundary() || plan.ends_at_implicit() {
            return Err(ValidationError::InvalidArgument(format!(
                "{} is not stored on {}",
                plan.path, class.name
            ))
            .into());
        }
        self.enforcer().check_write_field(class, &plan.path)
    }

    fn target_class(&self, segment: &PathSegment) -> Result<&'a ClassDef> {
        let target = segment.target().ok_or_else(|| {
            ValidationError::InvalidArgument(format!("{} is not a reference", segment.field))
        })?;
        Ok(self.schema().require(target)?)
    }
}

fn is_attached(attachments: &[Attachment], path: &str) -> bool {
    attachments.iter().any(|attachment| {
        path == attachment.path
            || path
                .strip_prefix(attachment.path.as_str())
                .map(|rest| rest.starts_with('.'))
                .unwrap_or(false)
    })
}

fn check_type(plan: &PathPlan, value: &Value) -> Result<()> {
    match &plan.last().field_type {
        Some(field_type) if !field_type.accepts(value) => Err(ValidationError::TypeMismatch {
            path: plan.path.clone(),
            expected: field_type.name(),
            actual: value.type_name().to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

/// Evaluate a predicate as if the field at `path` were missing.
fn fold_missing(path: &str, selector: &Selector) -> Result<CompiledFilter> {
    let filter = compile_local(path, selector)?;
    Ok(if matches(&filter, &EmptyDocument) {
        CompiledFilter::True
    } else {
        CompiledFilter::False
    })
}

/// Compile a selector on a stored path.
pub(crate) fn compile_local(path: &str, selector: &Selector) -> Result<CompiledFilter> {
    use acldb_proto::CompareOp;

    let path = path.to_string();
    let compare = |op, value: &Value| CompiledFilter::Compare {
        path: path.clone(),
        op,
        value: value.clone(),
    };
    let set = |op, values: &[Value]| CompiledFilter::Set {
        path: path.clone(),
        op,
        values: values.to_vec(),
    };
    Ok(match selector {
        Selector::Eq(value) => compare(CompareOp::Eq, value),
        Selector::Ne(value) => compare(CompareOp::Ne, value),
        Selector::Lt(value) => compare(CompareOp::Lt, value),
        Selector::Lte(value) => compare(CompareOp::Lte, value),
        Selector::Gt(value) => compare(CompareOp::Gt, value),
        Selector::Gte(value) => compare(CompareOp::Gte, value),
        Selector::Exists(exists) => CompiledFilter::Exists {
            path,
            exists: *exists,
        },
        Selector::StartsWith(prefix) => CompiledFilter::StartsWith {
            path,
            prefix: prefix.clone(),
        },
        Selector::EndsWith(suffix) => CompiledFilter::EndsWith {
            path,
            suffix: suffix.clone(),
        },
        Selector::Pattern {
            regex,
            case_insensitive,
        } => CompiledFilter::Pattern {
            path,
            regex: PatternRegex::new(regex, *case_insensitive)?,
        },
        Selector::Size(size) => CompiledFilter::Size { path, size: *size },
        Selector::Empty => CompiledFilter::Empty { path },
        Selector::NotEmpty => CompiledFilter::NotEmpty { path },
        Selector::ContainedIn(values) => CompiledFilter::In {
            path,
            values: values.clone(),
            negate: false,
        },
        Selector::NotContainedIn(values) => CompiledFilter::In {
            path,
            values: values.clone(),
            negate: true,
        },
        Selector::IsSubset(values) => set(SetOp::Subset, values),
        Selector::IsSuperset(values) => set(SetOp::Superset, values),
        Selector::IsDisjoint(values) => set(SetOp::Disjoint, values),
        Selector::IsIntersect(values) => set(SetOp::Intersect, values),
        Selector::Some(node) => CompiledFilter::Quantified {
            path,
            every: false,
            filter: Box::new(compile_element(node)?),
        },
        Selector::Every(node) => CompiledFilter::Quantified {
            path,
            every: true,
            filter: Box::new(compile_element(node)?),
        },
        Selector::Match(_) | Selector::CountMatches(_) | Selector::GroupMatches { .. } => {
            return Err(ValidationError::InvalidArgument(format!(
                "{path}: match selectors are only allowed at the top level of a read"
            ))
            .into())
        }
    })
}

/// Compile a filter evaluated against one array element.
fn compile_element(node: &FilterNode) -> Result<CompiledFilter> {
    Ok(match node {
        FilterNode::All(nodes) => {
            CompiledFilter::and(nodes.iter().map(compile_element).collect::<Result<Vec<_>>>()?)
        }
        FilterNode::Any(nodes) => {
            CompiledFilter::or(nodes.iter().map(compile_element).collect::<Result<Vec<_>>>()?)
        }
        FilterNode::Not(inner) => CompiledFilter::negate(compile_element(inner)?),
        FilterNode::Expr(expr) => {
            let mut keys = Vec::new();
            expr.keys(&mut keys);
            for key in keys {
                validate_element_path(key)?;
            }
            CompiledFilter::Expr(expr.clone())
        }
        FilterNode::Field { path, selector } => {
            validate_element_path(path)?;
            compile_local(path, selector)?
        }
    })
}

/// Rewrite `$`-relative paths of a member filter to class paths.
fn strip_placeholder(node: &FilterNode) -> FilterNode {
    match node {
        FilterNode::All(nodes) => FilterNode::All(nodes.iter().map(strip_placeholder).collect()),
        FilterNode::Any(nodes) => FilterNode::Any(nodes.iter().map(strip_placeholder).collect()),
        FilterNode::Not(inner) => FilterNode::Not(Box::new(strip_placeholder(inner))),
        FilterNode::Expr(expr) => FilterNode::Expr(expr.clone()),
        FilterNode::Field { path, selector } => {
            let path = if path == acldb_proto::PLACEHOLDER {
                "id".to_string()
            } else {
                path.strip_prefix("$.").unwrap_or(path).to_string()
            };
            let selector = match (path.as_str(), selector) {
                ("id", Selector::Eq(value)) => Selector::ContainedIn(id_values(value)),
                ("id", Selector::Ne(value)) => Selector::NotContainedIn(id_values(value)),
                _ => selector.clone(),
            };
            FilterNode::Field { path, selector }
        }
    }
}

fn id_values(value: &Value) -> Vec<Value> {
    reference_ids(value).into_iter().map(Value::String).collect()
}

/// Resolve every path in a filter tree without compiling it.
///
/// Runs before any permission check, so unknown classes and fields are
/// reported the same way for every caller.
pub fn validate_filter(
    schema: &Schema,
    class_name: &str,
    node: &FilterNode,
) -> std::result::Result<(), ValidationError> {
    let resolver = PathResolver::new(schema);
    match node {
        FilterNode::All(nodes) | FilterNode::Any(nodes) => nodes
            .iter()
            .try_for_each(|node| validate_filter(schema, class_name, node)),
        FilterNode::Not(inner) => validate_filter(schema, class_name, inner),
        FilterNode::Expr(expr) => {
            let mut keys = Vec::new();
            expr.keys(&mut keys);
            keys.into_iter()
                .try_for_each(|key| resolver.resolve(class_name, key).map(|_| ()))
        }
        FilterNode::Field { path, selector } => {
            let plan = resolver.resolve(class_name, path)?;
            let target = plan.last().target().filter(|_| plan.last().is_boundary());
            let spec = match selector {
                Selector::Match(spec) | Selector::CountMatches(spec) => Some(spec),
                Selector::GroupMatches { spec, .. } => Some(spec),
                _ => None,
            };
            let nested: Option<&FilterNode> = match selector {
                Selector::Some(node) | Selector::Every(node) => Some(node.as_ref()),
                _ => spec.and_then(|spec| spec.filter.as_deref()),
            };
            if let (Some(spec), Some(target)) = (spec, target) {
                for sort in &spec.sort {
                    resolver.resolve(target, &sort.path)?;
                }
            }
            match (nested, target) {
                (Some(node), Some(target)) => validate_filter(schema, target, &strip_placeholder(node)),
                (Some(node), None) => validate_element_filter(node),
                (None, _) => Ok(()),
            }
        }
    }
}

fn validate_element_filter(node: &FilterNode) -> std::result::Result<(), ValidationError> {
    match node {
        FilterNode::All(nodes) | FilterNode::Any(nodes) => {
            nodes.iter().try_for_each(validate_element_filter)
        }
        FilterNode::Not(inner) => validate_element_filter(inner),
        FilterNode::Expr(expr) => {
            let mut keys = Vec::new();
            expr.keys(&mut keys);
            keys.into_iter().try_for_each(validate_element_path)
        }
        FilterNode::Field { path, .. } => validate_element_path(path),
    }
}
