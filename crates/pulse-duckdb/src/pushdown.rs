//! Splits a filter list into SQL-pushable conditions and a residual
//! predicate evaluated in Rust.
//!
//! Only top-level conditions on built-in string columns are pushed. Path
//! normalization, property lookups and `any_of` groups stay residual. The
//! filter list is a conjunction, so `pushed AND residual` is exact.

use pulse_core::analytics::{Filter, FilterExpr, FilterOperator};
use pulse_core::event::PropertyValue;
use pulse_engine::filter::Field;

#[derive(Debug, Clone, PartialEq)]
enum Check {
    Equals(String),
    Contains(String),
    OneOf(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
struct Pushed {
    column: &'static str,
    nullable: bool,
    check: Check,
    negated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PushDown {
    pushed: Vec<Pushed>,
    /// Filters SQL cannot express.
    pub residual: Vec<FilterExpr>,
}

impl PushDown {
    pub fn split(filters: &[FilterExpr]) -> Self {
        let mut out = PushDown::default();
        for expr in filters {
            match expr {
                FilterExpr::Condition(filter) => match push(filter) {
                    Some(pushed) => out.pushed.push(pushed),
                    None => out.residual.push(expr.clone()),
                },
                FilterExpr::AnyOf { .. } => out.residual.push(expr.clone()),
            }
        }
        out
    }

    pub fn is_exact(&self) -> bool {
        self.residual.is_empty()
    }

    /// Appends ` AND ...` clauses for every pushed condition, numbering
    /// placeholders from `param_idx`.
    pub fn append_event_filters(
        &self,
        filter_sql: &mut String,
        params: &mut Vec<Box<dyn duckdb::types::ToSql>>,
        param_idx: &mut usize,
    ) {
        for cond in &self.pushed {
            let column = cond.column;
            let positive = match &cond.check {
                Check::Equals(value) => {
                    params.push(Box::new(value.clone()));
                    *param_idx += 1;
                    format!("{column} = ?{}", *param_idx - 1)
                }
                Check::Contains(needle) => {
                    params.push(Box::new(needle.clone()));
                    *param_idx += 1;
                    format!("contains({column}, ?{})", *param_idx - 1)
                }
                Check::OneOf(values) if values.is_empty() => "FALSE".to_string(),
                Check::OneOf(values) => {
                    let mut placeholders = Vec::with_capacity(values.len());
                    for value in values {
                        placeholders.push(format!("?{}", *param_idx));
                        params.push(Box::new(value.clone()));
                        *param_idx += 1;
                    }
                    format!("{column} IN ({})", placeholders.join(", "))
                }
            };
            // A missing value satisfies only negated operators.
            let clause = match (cond.negated, cond.nullable) {
                (false, _) => positive,
                (true, false) => format!("NOT ({positive})"),
                (true, true) => format!("({column} IS NULL OR NOT ({positive}))"),
            };
            filter_sql.push_str(" AND ");
            filter_sql.push_str(&clause);
        }
    }
}

fn push(filter: &Filter) -> Option<Pushed> {
    let field = Field::parse(&filter.parameter).ok()?;
    let (column, nullable) = match field {
        Field::Name => ("e.name", false),
        Field::PageUrl => ("e.page_url", true),
        Field::Referrer => ("e.referrer", true),
        Field::SessionId => ("e.session_id", false),
        Field::VisitorId => ("e.visitor_id", false),
        Field::Path | Field::Property(_) => return None,
    };
    let (check, negated) = match (filter.operator, &filter.value) {
        (FilterOperator::Eq, PropertyValue::String(v)) => (Check::Equals(v.clone()), false),
        (FilterOperator::Ne, PropertyValue::String(v)) => (Check::Equals(v.clone()), true),
        (FilterOperator::Contains, PropertyValue::String(v)) => (Check::Contains(v.clone()), false),
        (FilterOperator::NotContains, PropertyValue::String(v)) => {
            (Check::Contains(v.clone()), true)
        }
        (FilterOperator::In, PropertyValue::List(v)) => (Check::OneOf(v.clone()), false),
        (FilterOperator::NotIn, PropertyValue::List(v)) => (Check::OneOf(v.clone()), true),
        // Invalid combinations are rejected by the engine before any scan.
        _ => return None,
    };
    Some(Pushed {
        column,
        nullable,
        check,
        negated,
    })
}
