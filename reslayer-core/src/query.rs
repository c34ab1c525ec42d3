//! Filter, query and update construction for resource operations.
//!
//! Callers hand the resource layer Mongo-style documents (`{"age": {"$gt": 18}}`,
//! `{"$set": {...}}`). This module parses them into a small typed AST ([`Expr`],
//! [`Update`]) that every backend can execute, and renders that AST back into the
//! Mongo dialect for drivers and change events.
//!
//! # Query Building
//!
//! ```ignore
//! use reslayer::query::{Query, Filter, SortDirection};
//!
//! let query = Query::builder()
//!     .filter(Filter::eq("status", "active"))
//!     .project(["name", "email"])
//!     .sort("create_time", SortDirection::Desc)
//!     .limit(10)
//!     .build();
//! ```
//!
//! # Filter documents
//!
//! [`Filter::from_document`] accepts implicit equality plus `$eq`, `$ne`, `$gt`, `$gte`,
//! `$lt`, `$lte`, `$in`, `$nin`, `$exists`, `$and`, `$or` and `$nor`. Any other operator
//! is rejected with [`ResourceError::ValidationFailed`].

use bson::{Bson, Document, doc};
use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, ResourceResult};

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

/// Sort order for one field of the query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    /// The field name to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

impl Sort {
    /// Parses a sort key in `field` / `-field` form.
    pub fn parse(key: &str) -> ResourceResult<Self> {
        let (field, direction) = match key.strip_prefix('-') {
            Some(field) => (field, SortDirection::Desc),
            None => (key.strip_prefix('+').unwrap_or(key), SortDirection::Asc),
        };

        if field.is_empty() {
            return Err(ResourceError::ValidationFailed(format!("invalid sort key {key:?}")));
        }

        Ok(Sort { field: field.to_string(), direction })
    }
}

/// Field comparison operators for filter expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOp {
    /// Equal to (exact match, or array membership for array fields).
    Eq,
    /// Not equal to.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// Value is one of the given values.
    AnyOf,
    /// Value is none of the given values.
    NoneOf,
}

impl FieldOp {
    fn from_operator(op: &str) -> Option<Self> {
        Some(match op {
            "$eq" => FieldOp::Eq,
            "$ne" => FieldOp::Ne,
            "$gt" => FieldOp::Gt,
            "$gte" => FieldOp::Gte,
            "$lt" => FieldOp::Lt,
            "$lte" => FieldOp::Lte,
            "$in" => FieldOp::AnyOf,
            "$nin" => FieldOp::NoneOf,
            _ => return None,
        })
    }

    /// The Mongo operator this comparison renders to.
    pub fn operator(&self) -> &'static str {
        match self {
            FieldOp::Eq => "$eq",
            FieldOp::Ne => "$ne",
            FieldOp::Gt => "$gt",
            FieldOp::Gte => "$gte",
            FieldOp::Lt => "$lt",
            FieldOp::Lte => "$lte",
            FieldOp::AnyOf => "$in",
            FieldOp::NoneOf => "$nin",
        }
    }
}

/// A filter expression for selecting documents.
///
/// Field names may be dotted paths into nested documents (`metadata.retain`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match). Empty matches everything.
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match). Empty matches nothing.
    Or(Vec<Expr>),
    /// Logical NOT of an expression.
    Not(Box<Expr>),
    /// Checks if a field exists or doesn't exist.
    Exists(String, bool),
    /// Field comparison expression.
    Field {
        /// The field path to compare.
        field: String,
        /// The comparison operator.
        op: FieldOp,
        /// The value to compare against.
        value: Bson,
    },
}

impl Expr {
    /// Creates a field comparison expression.
    pub fn field(field: String, op: FieldOp, value: Bson) -> Self {
        Expr::Field { field, op, value }
    }

    /// Combines this expression with another using logical AND.
    ///
    /// If this expression is already an AND, the other expression is appended
    /// to the list. Otherwise, a new AND expression is created.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression (logical NOT).
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// Renders this expression as a Mongo filter document.
    pub fn to_document(&self) -> Document {
        FilterRenderer.visit_expr(self)
    }
}

/// Helper struct for constructing filter expressions.
///
/// # Example
///
/// ```ignore
/// use reslayer::query::Filter;
///
/// let expr = Filter::eq("name", "Alice")
///     .and(Filter::gt("age", 18));
/// ```
pub struct Filter;

impl Filter {
    /// Matches documents where the field equals the specified value.
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Eq, value.into())
    }

    /// Matches documents where the field does not equal the specified value.
    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Ne, value.into())
    }

    /// Matches documents where the field is greater than the specified value.
    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gt, value.into())
    }

    /// Matches documents where the field is greater than or equal to the specified value.
    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gte, value.into())
    }

    /// Matches documents where the field is less than the specified value.
    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lt, value.into())
    }

    /// Matches documents where the field is less than or equal to the specified value.
    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lte, value.into())
    }

    /// Matches documents where the field is present.
    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), true)
    }

    /// Matches documents where the field is absent.
    pub fn not_exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), false)
    }

    /// Combines multiple expressions such that all must match.
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    /// Combines multiple expressions such that any can match.
    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }

    /// Matches documents where the field is one of the given values.
    pub fn any_of(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Bson>>) -> Expr {
        Expr::field(
            field.into(),
            FieldOp::AnyOf,
            Bson::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Matches documents where the field is none of the given values.
    pub fn none_of(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Bson>>) -> Expr {
        Expr::field(
            field.into(),
            FieldOp::NoneOf,
            Bson::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Matches the document with the given `_id`.
    pub fn id(id: impl Into<Bson>) -> Expr {
        Filter::eq("_id", id)
    }

    /// Parses a Mongo-style filter document.
    ///
    /// Returns `None` for an empty document (match everything).
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::ValidationFailed`] for unsupported operators or
    /// operands of the wrong shape.
    pub fn from_document(document: &Document) -> ResourceResult<Option<Expr>> {
        let mut clauses = Vec::new();

        for (key, value) in document {
            match key.as_str() {
                "$and" => clauses.push(Expr::And(Self::sub_filters(key, value)?)),
                "$or" => clauses.push(Expr::Or(Self::sub_filters(key, value)?)),
                "$nor" => clauses.push(Expr::Or(Self::sub_filters(key, value)?).not()),
                op if op.starts_with('$') => {
                    return Err(ResourceError::ValidationFailed(format!(
                        "unsupported filter operator {op}"
                    )));
                }
                field => clauses.extend(Self::field_clauses(field, value)?),
            }
        }

        Ok(match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(Expr::And(clauses)),
        })
    }

    fn sub_filters(op: &str, value: &Bson) -> ResourceResult<Vec<Expr>> {
        let Bson::Array(items) = value else {
            return Err(ResourceError::ValidationFailed(format!(
                "{op} expects an array of filter documents"
            )));
        };

        items
            .iter()
            .map(|item| match item {
                Bson::Document(doc) => Ok(Self::from_document(doc)?.unwrap_or(Expr::And(vec![]))),
                _ => Err(ResourceError::ValidationFailed(format!(
                    "{op} expects an array of filter documents"
                ))),
            })
            .collect()
    }

    fn field_clauses(field: &str, value: &Bson) -> ResourceResult<Vec<Expr>> {
        let operators = match value {
            Bson::Document(doc) if !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')) => doc,
            _ => return Ok(vec![Filter::eq(field, value.clone())]),
        };

        operators
            .iter()
            .map(|(op, operand)| {
                if op == "$exists" {
                    let should_exist = match operand {
                        Bson::Boolean(b) => *b,
                        Bson::Int32(n) => *n != 0,
                        Bson::Int64(n) => *n != 0,
                        _ => {
                            return Err(ResourceError::ValidationFailed(format!(
                                "$exists on {field} expects a boolean"
                            )));
                        }
                    };
                    return Ok(Expr::Exists(field.to_string(), should_exist));
                }

                let field_op = FieldOp::from_operator(op).ok_or_else(|| {
                    ResourceError::ValidationFailed(format!("unsupported filter operator {op}"))
                })?;

                if matches!(field_op, FieldOp::AnyOf | FieldOp::NoneOf) && !matches!(operand, Bson::Array(_)) {
                    return Err(ResourceError::ValidationFailed(format!(
                        "{op} on {field} expects an array"
                    )));
                }

                Ok(Expr::field(field.to_string(), field_op, operand.clone()))
            })
            .collect()
    }
}

/// A structured query for retrieving documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Optional filter expression to match documents.
    pub filter: Option<Expr>,
    /// Fields to return. `None` returns whole documents.
    pub projection: Option<Vec<String>>,
    /// Sort keys, applied in order.
    pub sort: Vec<Sort>,
    /// Number of documents to skip (for pagination).
    pub offset: Option<usize>,
    /// Maximum number of documents to return.
    pub limit: Option<usize>,
}

impl Query {
    /// Creates a new empty query with no filters or limits.
    pub fn new() -> Self {
        Query::default()
    }

    /// Creates a new query builder for fluent construction.
    pub fn builder() -> QueryBuilder {
        QueryBuilder::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    /// Creates a new query builder.
    pub fn new() -> Self {
        QueryBuilder { query: Query::default() }
    }

    /// Sets the filter expression for this query.
    pub fn filter(mut self, filter: Expr) -> Self {
        self.query.filter = Some(filter);
        self
    }

    /// Sets an optional filter expression, as produced by [`Filter::from_document`].
    pub fn maybe_filter(mut self, filter: Option<Expr>) -> Self {
        self.query.filter = filter;
        self
    }

    /// Restricts returned documents to the given fields.
    pub fn project<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.projection = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the maximum number of documents to return.
    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    /// Sets the number of documents to skip (for pagination).
    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = Some(offset);
        self
    }

    /// Appends a sort key. Earlier keys take precedence.
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.query.sort.push(Sort { field: field.into(), direction });
        self
    }

    /// Builds and returns the final query.
    pub fn build(self) -> Query {
        self.query
    }
}

/// A partial update expressed with update operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// `$set`: field path to new value.
    #[serde(default)]
    pub set: Document,
    /// `$unset`: field paths to remove.
    #[serde(default)]
    pub unset: Vec<String>,
    /// `$inc`: field path to numeric increment.
    #[serde(default)]
    pub inc: Document,
}

impl Update {
    pub fn new() -> Self {
        Update::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    pub fn inc(mut self, field: impl Into<String>, by: impl Into<Bson>) -> Self {
        self.inc.insert(field.into(), by.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.inc.is_empty()
    }

    /// Parses an update-operator document (`$set`, `$unset`, `$inc`).
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::ValidationFailed`] for plain fields (replacement
    /// documents belong to `replace`), unknown operators, or an empty update.
    pub fn from_document(document: &Document) -> ResourceResult<Self> {
        let mut update = Update::new();

        for (op, operand) in document {
            let Bson::Document(fields) = operand else {
                if op == "$unset" {
                    if let Bson::Array(names) = operand {
                        for name in names {
                            match name {
                                Bson::String(name) => update.unset.push(name.clone()),
                                _ => {
                                    return Err(ResourceError::ValidationFailed(
                                        "$unset expects field names".to_string(),
                                    ));
                                }
                            }
                        }
                        continue;
                    }
                }
                return Err(ResourceError::ValidationFailed(format!("{op} expects a document")));
            };

            match op.as_str() {
                "$set" => update.set.extend(fields.clone()),
                "$unset" => update.unset.extend(fields.keys().cloned()),
                "$inc" => {
                    for (field, by) in fields {
                        if !matches!(by, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) {
                            return Err(ResourceError::ValidationFailed(format!(
                                "$inc on {field} expects a number"
                            )));
                        }
                    }
                    update.inc.extend(fields.clone());
                }
                op if op.starts_with('$') => {
                    return Err(ResourceError::ValidationFailed(format!(
                        "unsupported update operator {op}"
                    )));
                }
                field => {
                    return Err(ResourceError::ValidationFailed(format!(
                        "update documents must use operators, found field {field}"
                    )));
                }
            }
        }

        if update.is_empty() {
            return Err(ResourceError::ValidationFailed("update is empty".to_string()));
        }

        Ok(update)
    }

    /// Renders the update as a Mongo update-operator document.
    pub fn to_document(&self) -> Document {
        let mut document = Document::new();

        if !self.set.is_empty() {
            document.insert("$set", self.set.clone());
        }
        if !self.unset.is_empty() {
            document.insert(
                "$unset",
                self.unset
                    .iter()
                    .map(|field| (field.clone(), Bson::String(String::new())))
                    .collect::<Document>(),
            );
        }
        if !self.inc.is_empty() {
            document.insert("$inc", self.inc.clone());
        }

        document
    }
}

pub trait QueryVisitor {
    type Output;

    fn visit_and(&mut self, exprs: &[Expr]) -> Self::Output;
    fn visit_or(&mut self, exprs: &[Expr]) -> Self::Output;
    fn visit_not(&mut self, expr: &Expr) -> Self::Output;
    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Self::Output;
    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Self::Output;

    fn visit_expr(&mut self, expr: &Expr) -> Self::Output {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Exists(field, should_exist) => self.visit_exists(field, *should_exist),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
        }
    }
}

/// Renders expressions into Mongo filter documents.
pub struct FilterRenderer;

impl QueryVisitor for FilterRenderer {
    type Output = Document;

    fn visit_and(&mut self, exprs: &[Expr]) -> Document {
        match exprs {
            [] => doc! {},
            [single] => self.visit_expr(single),
            _ => doc! {
                "$and": exprs
                    .iter()
                    .map(|expr| self.visit_expr(expr))
                    .collect::<Vec<_>>(),
            },
        }
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Document {
        match exprs {
            // Every stored document has an `_id`.
            [] => doc! { "_id": { "$exists": false } },
            _ => doc! {
                "$or": exprs
                    .iter()
                    .map(|expr| self.visit_expr(expr))
                    .collect::<Vec<_>>(),
            },
        }
    }

    fn visit_not(&mut self, expr: &Expr) -> Document {
        match expr {
            Expr::Or(exprs) if !exprs.is_empty() => doc! {
                "$nor": exprs
                    .iter()
                    .map(|expr| self.visit_expr(expr))
                    .collect::<Vec<_>>(),
            },
            _ => doc! { "$nor": [self.visit_expr(expr)] },
        }
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Document {
        doc! {
            field: { "$exists": should_exist },
        }
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Document {
        doc! {
            field: { op.operator(): value.clone() },
        }
    }
}
