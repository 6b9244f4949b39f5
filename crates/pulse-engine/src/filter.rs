//! Compiles filter expressions into predicates over single events.
//!
//! Operator/type table:
//!
//! | operator                 | filter value          | event value        |
//! |--------------------------|-----------------------|--------------------|
//! | `eq`, `ne`               | string, number, bool  | same variant       |
//! | `contains`, `not_contains` | string              | string only        |
//! | `in`, `not_in`           | list of strings       | string only        |

use std::borrow::Cow;
use std::collections::BTreeMap;

use pulse_core::analytics::{Filter, FilterExpr, FilterOperator};
use pulse_core::error::EngineError;
use pulse_core::event::{Event, PropertyValue, ValueKind};

use crate::paths::normalize_path;

/// Declared kinds of event properties, when known ahead of evaluation.
pub type PropertySchema = BTreeMap<String, ValueKind>;

/// A field an event filter can read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Name,
    PageUrl,
    /// `page_url` normalized to a path.
    Path,
    Referrer,
    SessionId,
    VisitorId,
    Property(String),
}

impl Field {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EngineError::InvalidFilter(
                "filter parameter must not be empty".to_string(),
            ));
        }
        Ok(match trimmed {
            "name" | "event" => Field::Name,
            "page_url" | "url" => Field::PageUrl,
            "path" => Field::Path,
            "referrer" => Field::Referrer,
            "session_id" => Field::SessionId,
            "visitor_id" | "user_id" => Field::VisitorId,
            other => {
                let key = other.strip_prefix("properties.").unwrap_or(other);
                if key.is_empty() {
                    return Err(EngineError::InvalidFilter(
                        "property key must not be empty".to_string(),
                    ));
                }
                Field::Property(key.to_string())
            }
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Field::Name => "name",
            Field::PageUrl => "page_url",
            Field::Path => "path",
            Field::Referrer => "referrer",
            Field::SessionId => "session_id",
            Field::VisitorId => "visitor_id",
            Field::Property(key) => key,
        }
    }

    /// Built-in fields are always strings.
    pub fn is_builtin(&self) -> bool {
        !matches!(self, Field::Property(_))
    }

    fn read<'e>(&self, event: &'e Event) -> Option<FieldValue<'e>> {
        match self {
            Field::Name => Some(FieldValue::Text(Cow::Borrowed(&event.name))),
            Field::PageUrl => event
                .page_url
                .as_deref()
                .map(|u| FieldValue::Text(Cow::Borrowed(u))),
            Field::Path => event
                .page_url
                .as_deref()
                .map(|u| FieldValue::Text(Cow::Owned(normalize_path(u)))),
            Field::Referrer => event
                .referrer
                .as_deref()
                .map(|r| FieldValue::Text(Cow::Borrowed(r))),
            Field::SessionId => Some(FieldValue::Text(Cow::Borrowed(&event.session_id))),
            Field::VisitorId => Some(FieldValue::Text(Cow::Borrowed(&event.visitor_id))),
            Field::Property(key) => event.property(key).map(FieldValue::Value),
        }
    }
}

enum FieldValue<'e> {
    Text(Cow<'e, str>),
    Value(&'e PropertyValue),
}

impl FieldValue<'_> {
    fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text.as_ref()),
            FieldValue::Value(value) => value.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
enum Test {
    Equals(PropertyValue),
    Contains(String),
    OneOf(Vec<String>),
}

impl Test {
    /// An empty `in` list decides the outcome without reading the value.
    fn is_constant(&self) -> bool {
        matches!(self, Test::OneOf(options) if options.is_empty())
    }
}

#[derive(Debug, Clone)]
struct Condition {
    field: Field,
    operator: FilterOperator,
    test: Test,
    negated: bool,
}

impl Condition {
    fn compile(filter: &Filter, schema: Option<&PropertySchema>) -> Result<Self, EngineError> {
        let field = Field::parse(&filter.parameter)?;
        let operator = filter.operator;
        let (test, negated) = match operator {
            FilterOperator::Eq | FilterOperator::Ne => {
                if matches!(filter.value, PropertyValue::List(_)) {
                    return Err(EngineError::InvalidFilter(format!(
                        "operator `{}` on `{}` takes a scalar value",
                        operator.as_str(),
                        field.name()
                    )));
                }
                if field.is_builtin() && filter.value.kind() != ValueKind::String {
                    return Err(mismatch(&field, operator));
                }
                (
                    Test::Equals(filter.value.clone()),
                    operator == FilterOperator::Ne,
                )
            }
            FilterOperator::Contains | FilterOperator::NotContains => {
                let PropertyValue::String(needle) = &filter.value else {
                    return Err(EngineError::InvalidFilter(format!(
                        "operator `{}` on `{}` takes a string value",
                        operator.as_str(),
                        field.name()
                    )));
                };
                (
                    Test::Contains(needle.clone()),
                    operator == FilterOperator::NotContains,
                )
            }
            FilterOperator::In | FilterOperator::NotIn => {
                let PropertyValue::List(values) = &filter.value else {
                    return Err(EngineError::InvalidFilter(format!(
                        "operator `{}` on `{}` takes a list of strings",
                        operator.as_str(),
                        field.name()
                    )));
                };
                (
                    Test::OneOf(values.clone()),
                    operator == FilterOperator::NotIn,
                )
            }
        };

        if let (Field::Property(key), Some(schema), false) = (&field, schema, test.is_constant()) {
            let string_only = !matches!(test, Test::Equals(_));
            match schema.get(key) {
                Some(kind) if string_only && *kind != ValueKind::String => {
                    return Err(mismatch(&field, operator));
                }
                Some(kind) if !string_only && *kind != filter.value.kind() => {
                    return Err(mismatch(&field, operator));
                }
                _ => {}
            }
        }

        Ok(Self {
            field,
            operator,
            test,
            negated,
        })
    }

    fn evaluate(&self, event: &Event) -> Result<bool, EngineError> {
        let Some(value) = self.field.read(event) else {
            return Ok(self.negated);
        };
        let matched = match &self.test {
            Test::Equals(expected) => match &value {
                FieldValue::Text(text) => expected.as_str() == Some(text.as_ref()),
                FieldValue::Value(actual) => *actual == expected,
            },
            Test::Contains(needle) => self.text(&value)?.contains(needle.as_str()),
            Test::OneOf(options) if options.is_empty() => false,
            Test::OneOf(options) => {
                let text = self.text(&value)?;
                options.iter().any(|o| o == text)
            }
        };
        Ok(matched != self.negated)
    }

    fn text<'v>(&self, value: &'v FieldValue<'_>) -> Result<&'v str, EngineError> {
        value
            .as_text()
            .ok_or_else(|| mismatch(&self.field, self.operator))
    }
}

fn mismatch(field: &Field, operator: FilterOperator) -> EngineError {
    EngineError::TypeMismatch {
        field: field.name().to_string(),
        operator: operator.as_str().to_string(),
    }
}

#[derive(Debug, Clone)]
enum Node {
    Condition(Condition),
    AnyOf(Vec<Vec<Condition>>),
}

impl Node {
    fn evaluate(&self, event: &Event) -> Result<bool, EngineError> {
        match self {
            Node::Condition(condition) => condition.evaluate(event),
            Node::AnyOf(groups) => {
                for group in groups {
                    if all(group, event)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

fn all(conditions: &[Condition], event: &Event) -> Result<bool, EngineError> {
    for condition in conditions {
        if !condition.evaluate(event)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// A compiled, conjunctive filter list. The empty predicate matches every
/// event.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    nodes: Vec<Node>,
    source: Vec<FilterExpr>,
}

impl Predicate {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The expressions this predicate was compiled from, for store push-down.
    pub fn exprs(&self) -> &[FilterExpr] {
        &self.source
    }

    /// Tests an event, surfacing `TypeMismatch` when a string-only operator
    /// meets a non-string property value.
    pub fn evaluate(&self, event: &Event) -> Result<bool, EngineError> {
        for node in &self.nodes {
            if !node.evaluate(event)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Infallible form of [`evaluate`](Self::evaluate): a type mismatch
    /// tests false.
    pub fn test(&self, event: &Event) -> bool {
        self.evaluate(event).unwrap_or(false)
    }
}

pub fn compile(filters: &[FilterExpr]) -> Result<Predicate, EngineError> {
    compile_inner(filters, None)
}

/// Like [`compile`], but rejects operator/type combinations the schema
/// already rules out.
pub fn compile_with_schema(
    filters: &[FilterExpr],
    schema: &PropertySchema,
) -> Result<Predicate, EngineError> {
    compile_inner(filters, Some(schema))
}

fn compile_inner(
    filters: &[FilterExpr],
    schema: Option<&PropertySchema>,
) -> Result<Predicate, EngineError> {
    let mut nodes = Vec::with_capacity(filters.len());
    for expr in filters {
        let node = match expr {
            FilterExpr::Condition(filter) => Node::Condition(Condition::compile(filter, schema)?),
            FilterExpr::AnyOf { any_of } => {
                if any_of.is_empty() {
                    return Err(EngineError::InvalidFilter(
                        "any_of needs at least one group".to_string(),
                    ));
                }
                let mut groups = Vec::with_capacity(any_of.len());
                for group in any_of {
                    if group.is_empty() {
                        return Err(EngineError::InvalidFilter(
                            "any_of groups must not be empty".to_string(),
                        ));
                    }
                    groups.push(
                        group
                            .iter()
                            .map(|f| Condition::compile(f, schema))
                            .collect::<Result<Vec<_>, _>>()?,
                    );
                }
                Node::AnyOf(groups)
            }
        };
        nodes.push(node);
    }
    Ok(Predicate {
        nodes,
        source: filters.to_vec(),
    })
}
