// Listing predicates, evaluated in SQL on the remote path and in memory on the fallback path

use crate::listing::ListQuery;
use crate::record::{ListedRecord, format_timestamp, parse_timestamp};
use chrono::{Duration, NaiveDate};
use rusqlite::types::Value as SqlValue;
use tracing::warn;

/// Filter for querying listed records
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Field to filter on
    pub field: Field,
    /// Comparison operator
    pub op: FilterOp,
    /// Value to compare against (already normalized)
    pub value: String,
}

/// Record fields that can be filtered on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Category,
    Timestamp,
    /// Title or description
    Text,
}

/// Comparison operators for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,       // ==
    Gte,      // >=
    Lte,      // <=
    Contains, // case-insensitive substring
}

/// SQL name of the case-folding function registered on every remote connection
pub const FOLD_CASE_SQL: &str = "fold_case";

/// Unicode lowercase, shared by the in-memory path and the SQL function
pub fn fold_case(text: &str) -> String {
    text.to_lowercase()
}

impl FilterOp {
    /// SQL comparison operator; `None` for substring matching
    pub(crate) fn comparison(self) -> Option<&'static str> {
        match self {
            FilterOp::Eq => Some("="),
            FilterOp::Gte => Some(">="),
            FilterOp::Lte => Some("<="),
            FilterOp::Contains => None,
        }
    }
}

impl std::fmt::Display for FilterOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterOp::Eq => write!(f, "="),
            FilterOp::Gte => write!(f, ">="),
            FilterOp::Lte => write!(f, "<="),
            FilterOp::Contains => write!(f, "CONTAINS"),
        }
    }
}

impl Filter {
    /// Build the conjunctive filter list for a query.
    ///
    /// Blank strings count as absent. Date bounds that don't parse are
    /// dropped with a warning; a bare `YYYY-MM-DD` end date covers the whole day.
    pub fn for_query(query: &ListQuery) -> Vec<Filter> {
        let mut filters = Vec::new();

        if let Some(category) = non_blank(query.category.as_deref()) {
            filters.push(Filter {
                field: Field::Category,
                op: FilterOp::Eq,
                value: category.to_string(),
            });
        }

        if let Some(start) = non_blank(query.start_date.as_deref()) {
            match parse_timestamp(start) {
                Ok(dt) => filters.push(Filter {
                    field: Field::Timestamp,
                    op: FilterOp::Gte,
                    value: format_timestamp(&dt),
                }),
                Err(e) => warn!(start_date = start, error = %e, "Ignoring unparseable start date"),
            }
        }

        if let Some(end) = non_blank(query.end_date.as_deref()) {
            match end_of_range(end) {
                Some(value) => filters.push(Filter {
                    field: Field::Timestamp,
                    op: FilterOp::Lte,
                    value,
                }),
                None => warn!(end_date = end, "Ignoring unparseable end date"),
            }
        }

        if let Some(search) = non_blank(query.search.as_deref()) {
            filters.push(Filter {
                field: Field::Text,
                op: FilterOp::Contains,
                value: fold_case(search),
            });
        }

        filters
    }

    /// Evaluate against an in-memory record
    pub fn matches(&self, record: &ListedRecord) -> bool {
        match (self.field, self.op) {
            (Field::Text, _) => {
                fold_case(&record.title).contains(&self.value) || fold_case(&record.description).contains(&self.value)
            }
            (field, op) => {
                let actual = match field {
                    Field::Category => record.category.as_str(),
                    _ => record.timestamp.as_str(),
                };
                match op {
                    FilterOp::Eq => actual == self.value,
                    FilterOp::Gte => actual >= self.value.as_str(),
                    FilterOp::Lte => actual <= self.value.as_str(),
                    FilterOp::Contains => fold_case(actual).contains(&self.value),
                }
            }
        }
    }

    /// Render as a SQL predicate, pushing bound parameters onto `params`.
    ///
    /// Substring matches go through `fold_case` on both sides so SQL and
    /// `matches` fold letters identically.
    pub(crate) fn to_sql(&self, params: &mut Vec<SqlValue>) -> String {
        match (self.field, self.op.comparison()) {
            (Field::Text, _) => {
                params.push(SqlValue::Text(self.value.clone()));
                params.push(SqlValue::Text(self.value.clone()));
                format!(
                    "(instr({f}(title), ?) > 0 OR instr({f}(description), ?) > 0)",
                    f = FOLD_CASE_SQL
                )
            }
            (field, None) => {
                params.push(SqlValue::Text(self.value.clone()));
                format!("instr({}({}), ?) > 0", FOLD_CASE_SQL, column(field))
            }
            (field, Some(cmp)) => {
                params.push(SqlValue::Text(self.value.clone()));
                format!("{} {} ?", column(field), cmp)
            }
        }
    }
}

fn column(field: Field) -> &'static str {
    match field {
        Field::Category => "category",
        Field::Timestamp => "timestamp",
        Field::Text => "title",
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn end_of_range(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let next_day = date.succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
        return Some(format_timestamp(&(next_day - Duration::milliseconds(1))));
    }
    parse_timestamp(raw).ok().map(|dt| format_timestamp(&dt))
}
