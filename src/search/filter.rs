//! Query-string filter DSL.
//!
//! Keys take the form `field` or `field__op`; values are parsed according to
//! the field's declared kind and rendered as bound predicates. The special
//! key `date_range` expands to a lower bound on the publication time.
//!
//! ```text
//! sentiment_score__gte=0.25&category__in=tech,science&date_range=7d
//! ```

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sqlx::{QueryBuilder, Sqlite};
use thiserror::Error;

/// Keys consumed by pagination, sorting and search rather than filtering.
pub const RESERVED_KEYS: &[&str] = &[
    "cursor", "limit", "sort", "q", "method", "threshold", "prefix", "hours", "days",
];

/// Upper bound for `in` lists, keeping statements well under SQLite's bind limit.
const MAX_IN_VALUES: usize = 50;

/// Longest window accepted by `date_range` (10 years).
const MAX_RANGE_DAYS: i64 = 3650;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("Unknown filter field: {0}")]
    UnknownField(String),
    #[error("Operator '{op}' is not supported for field '{field}'")]
    UnsupportedOperator { field: String, op: String },
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

// ============================================================================
// Field Registry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Float,
    Text,
    Timestamp,
    /// Membership in the JSON `topics` array
    TopicList,
}

#[derive(Debug)]
pub struct FieldSpec {
    pub name: &'static str,
    /// SQL expression against the `articles a` alias
    pub column: &'static str,
    pub kind: FieldKind,
}

/// Filterable article fields. Unknown names are rejected rather than ignored.
pub const FIELDS: &[FieldSpec] = &[
    FieldSpec { name: "source_id", column: "a.source_id", kind: FieldKind::Integer },
    FieldSpec { name: "view_count", column: "a.view_count", kind: FieldKind::Integer },
    FieldSpec { name: "category", column: "a.category", kind: FieldKind::Text },
    FieldSpec { name: "author", column: "a.author", kind: FieldKind::Text },
    FieldSpec { name: "title", column: "a.title", kind: FieldKind::Text },
    FieldSpec { name: "sentiment_label", column: "a.sentiment_label", kind: FieldKind::Text },
    FieldSpec { name: "processing_status", column: "a.processing_status", kind: FieldKind::Text },
    FieldSpec { name: "sentiment_score", column: "a.sentiment_score", kind: FieldKind::Float },
    FieldSpec { name: "bias_score", column: "a.bias_score", kind: FieldKind::Float },
    FieldSpec { name: "relevance_score", column: "a.relevance_score", kind: FieldKind::Float },
    FieldSpec {
        name: "published_at",
        column: "COALESCE(a.published_at, a.fetched_at)",
        kind: FieldKind::Timestamp,
    },
    FieldSpec { name: "fetched_at", column: "a.fetched_at", kind: FieldKind::Timestamp },
    FieldSpec { name: "topic", column: "a.topics", kind: FieldKind::TopicList },
];

fn field(name: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|f| f.name == name)
}

// ============================================================================
// Operators & Values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
}

impl Op {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "eq" => Op::Eq,
            "ne" => Op::Ne,
            "gt" => Op::Gt,
            "gte" => Op::Gte,
            "lt" => Op::Lt,
            "lte" => Op::Lte,
            "in" => Op::In,
            "contains" => Op::Contains,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "eq",
            Op::Ne => "ne",
            Op::Gt => "gt",
            Op::Gte => "gte",
            Op::Lt => "lt",
            Op::Lte => "lte",
            Op::In => "in",
            Op::Contains => "contains",
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Op::Eq => " = ",
            Op::Ne => " != ",
            Op::Gt => " > ",
            Op::Gte => " >= ",
            Op::Lt => " < ",
            Op::Lte => " <= ",
            Op::In | Op::Contains => unreachable!("rendered separately"),
        }
    }
}

fn allows(kind: FieldKind, op: Op) -> bool {
    match kind {
        FieldKind::Integer => !matches!(op, Op::Contains),
        FieldKind::Float | FieldKind::Timestamp => !matches!(op, Op::Contains | Op::In),
        FieldKind::Text | FieldKind::TopicList => {
            matches!(op, Op::Eq | Op::Ne | Op::In | Op::Contains)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<FilterValue>),
}

#[derive(Debug, Clone)]
pub struct Predicate {
    pub field: &'static FieldSpec,
    pub op: Op,
    pub value: FilterValue,
}

// ============================================================================
// FilterSet
// ============================================================================

/// A conjunction of predicates over article columns.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    predicates: Vec<Predicate>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse query-string pairs. Reserved keys are skipped.
    ///
    /// `now` anchors `date_range`; callers pass `Utc::now().timestamp()`.
    pub fn from_pairs<'a, I>(pairs: I, now: i64) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut set = Self::new();
        for (key, raw) in pairs {
            if RESERVED_KEYS.contains(&key) {
                continue;
            }
            if key == "date_range" {
                let since = parse_date_range(raw, now)?;
                set.push("published_at", Op::Gte, FilterValue::Int(since))?;
                continue;
            }

            let (name, op) = match key.split_once("__") {
                Some((name, op_str)) => {
                    let op = Op::parse(op_str).ok_or_else(|| FilterError::UnsupportedOperator {
                        field: name.to_string(),
                        op: op_str.to_string(),
                    })?;
                    (name, op)
                }
                None => (key, Op::Eq),
            };

            let spec = field(name).ok_or_else(|| FilterError::UnknownField(name.to_string()))?;
            let value = parse_value(spec, op, raw)?;
            set.push_spec(spec, op, value)?;
        }
        Ok(set)
    }

    /// Add a predicate by field name (used for preference-driven feeds).
    pub fn push(&mut self, name: &str, op: Op, value: FilterValue) -> Result<(), FilterError> {
        let spec = field(name).ok_or_else(|| FilterError::UnknownField(name.to_string()))?;
        self.push_spec(spec, op, value)
    }

    fn push_spec(
        &mut self,
        spec: &'static FieldSpec,
        op: Op,
        value: FilterValue,
    ) -> Result<(), FilterError> {
        if !allows(spec.kind, op) {
            return Err(FilterError::UnsupportedOperator {
                field: spec.name.to_string(),
                op: op.as_str().to_string(),
            });
        }
        check_shape(spec, op, &value)?;
        self.predicates.push(Predicate { field: spec, op, value });
        Ok(())
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Append each predicate as ` AND <expr>` with bound values.
    pub fn push_sql(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        for pred in &self.predicates {
            builder.push(" AND ");
            render(pred, builder);
        }
    }
}

fn render(pred: &Predicate, builder: &mut QueryBuilder<'_, Sqlite>) {
    let column = pred.field.column;
    match pred.field.kind {
        FieldKind::TopicList => {
            let negate = pred.op == Op::Ne;
            builder.push(if negate { "NOT EXISTS" } else { "EXISTS" });
            builder.push(" (SELECT 1 FROM json_each(");
            builder.push(column);
            builder.push(") WHERE json_each.value");
            match (&pred.op, &pred.value) {
                (Op::In, FilterValue::List(items)) => push_in_list(builder, items),
                (Op::Contains, value) => {
                    builder.push(" LIKE ");
                    builder.push_bind(like_pattern(value));
                    builder.push(" ESCAPE '\\'");
                }
                (_, value) => {
                    builder.push(" = ");
                    push_value(builder, value);
                }
            }
            builder.push(")");
        }
        FieldKind::Text => {
            builder.push(column);
            match (&pred.op, &pred.value) {
                (Op::In, FilterValue::List(items)) => {
                    builder.push(" COLLATE NOCASE");
                    push_in_list(builder, items);
                }
                (Op::Contains, value) => {
                    builder.push(" LIKE ");
                    builder.push_bind(like_pattern(value));
                    builder.push(" ESCAPE '\\'");
                }
                (op, value) => {
                    builder.push(" COLLATE NOCASE");
                    builder.push(op.sql());
                    push_value(builder, value);
                }
            }
        }
        FieldKind::Integer | FieldKind::Float | FieldKind::Timestamp => {
            builder.push(column);
            match (&pred.op, &pred.value) {
                (Op::In, FilterValue::List(items)) => push_in_list(builder, items),
                (op, value) => {
                    builder.push(op.sql());
                    push_value(builder, value);
                }
            }
        }
    }
}

fn push_in_list(builder: &mut QueryBuilder<'_, Sqlite>, items: &[FilterValue]) {
    builder.push(" IN (");
    let mut separated = builder.separated(", ");
    for item in items {
        match item {
            FilterValue::Int(v) => separated.push_bind(*v),
            FilterValue::Float(v) => separated.push_bind(*v),
            FilterValue::Text(v) => separated.push_bind(v.clone()),
            FilterValue::List(_) => separated.push("NULL"),
        };
    }
    separated.push_unseparated(")");
}

fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &FilterValue) {
    match value {
        FilterValue::Int(v) => builder.push_bind(*v),
        FilterValue::Float(v) => builder.push_bind(*v),
        FilterValue::Text(v) => builder.push_bind(v.clone()),
        FilterValue::List(_) => builder.push("NULL"),
    };
}

fn like_pattern(value: &FilterValue) -> String {
    let text = match value {
        FilterValue::Text(s) => s.as_str(),
        _ => "",
    };
    format!("%{}%", escape_like(text))
}

/// Escape LIKE wildcards so user input matches literally (ESCAPE '\').
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Value Parsing
// ============================================================================

/// `in` takes a non-empty list of scalars, `contains` takes text, every
/// other operator takes a single scalar. `render` relies on this.
fn check_shape(spec: &FieldSpec, op: Op, value: &FilterValue) -> Result<(), FilterError> {
    match (op, value) {
        (Op::In, FilterValue::List(items)) => {
            if items.is_empty() {
                return Err(invalid(spec, "empty list"));
            }
            if items.len() > MAX_IN_VALUES {
                return Err(invalid(spec, format!("at most {MAX_IN_VALUES} values allowed")));
            }
            if items.iter().any(|item| matches!(item, FilterValue::List(_))) {
                return Err(invalid(spec, "nested lists are not allowed"));
            }
            Ok(())
        }
        (Op::In, _) => Err(invalid(spec, "'in' expects a list of values")),
        (Op::Contains, FilterValue::Text(_)) => Ok(()),
        (Op::Contains, _) => Err(invalid(spec, "'contains' expects text")),
        (_, FilterValue::List(_)) => Err(invalid(
            spec,
            format!("'{}' expects a single value", op.as_str()),
        )),
        _ => Ok(()),
    }
}

fn invalid(spec: &FieldSpec, reason: impl Into<String>) -> FilterError {
    FilterError::InvalidValue {
        field: spec.name.to_string(),
        reason: reason.into(),
    }
}

fn parse_value(spec: &'static FieldSpec, op: Op, raw: &str) -> Result<FilterValue, FilterError> {
    if op == Op::In {
        let items: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if items.is_empty() {
            return Err(invalid(spec, "empty list"));
        }
        if items.len() > MAX_IN_VALUES {
            return Err(invalid(spec, format!("at most {MAX_IN_VALUES} values allowed")));
        }
        let values = items
            .into_iter()
            .map(|item| parse_scalar(spec, item))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(FilterValue::List(values));
    }
    parse_scalar(spec, raw.trim())
}

fn parse_scalar(spec: &FieldSpec, raw: &str) -> Result<FilterValue, FilterError> {
    match spec.kind {
        FieldKind::Integer => raw
            .parse::<i64>()
            .map(FilterValue::Int)
            .map_err(|_| invalid(spec, format!("'{raw}' is not an integer"))),
        FieldKind::Float => match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(FilterValue::Float(v)),
            _ => Err(invalid(spec, format!("'{raw}' is not a number"))),
        },
        FieldKind::Timestamp => parse_timestamp(raw)
            .map(FilterValue::Int)
            .ok_or_else(|| invalid(spec, format!("'{raw}' is not a timestamp"))),
        FieldKind::Text => {
            if raw.is_empty() {
                Err(invalid(spec, "empty value"))
            } else {
                Ok(FilterValue::Text(raw.to_string()))
            }
        }
        // Topics are stored lowercase
        FieldKind::TopicList => {
            if raw.is_empty() {
                Err(invalid(spec, "empty value"))
            } else {
                Ok(FilterValue::Text(raw.to_lowercase()))
            }
        }
    }
}

/// Accepts Unix seconds, RFC 3339, or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    if let Ok(secs) = raw.parse::<i64>() {
        return Some(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt).timestamp())
}

/// Resolve a `date_range` value to the earliest included Unix timestamp.
///
/// Accepts `today`, `24h`, `week`, `month`, `<N>h`, `<N>d`.
pub fn parse_date_range(raw: &str, now: i64) -> Result<i64, FilterError> {
    let bad = || FilterError::InvalidValue {
        field: "date_range".to_string(),
        reason: format!("'{raw}' is not a recognised range"),
    };
    let raw = raw.trim().to_lowercase();

    let seconds = match raw.as_str() {
        "today" => {
            let start_of_day = now - now.rem_euclid(86_400);
            return Ok(start_of_day);
        }
        "week" => 7 * 86_400,
        "month" => 30 * 86_400,
        other => {
            let (digits, unit) = other.split_at(other.len().saturating_sub(1));
            let n: i64 = digits.parse().map_err(|_| bad())?;
            if n <= 0 {
                return Err(bad());
            }
            let secs = match unit {
                "h" => n.checked_mul(3_600),
                "d" => n.checked_mul(86_400),
                _ => None,
            }
            .ok_or_else(bad)?;
            if secs > MAX_RANGE_DAYS * 86_400 {
                return Err(bad());
            }
            secs
        }
    };
    Ok(now - seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z

    fn parse(pairs: &[(&str, &str)]) -> Result<FilterSet, FilterError> {
        FilterSet::from_pairs(pairs.iter().copied(), NOW)
    }

    fn sql_of(set: &FilterSet) -> String {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT 1 FROM articles a WHERE 1=1");
        set.push_sql(&mut builder);
        builder.sql().to_string()
    }

    #[test]
    fn test_push_rejects_value_shape_mismatch() {
        let mut set = FilterSet::new();
        assert!(matches!(
            set.push("source_id", Op::In, FilterValue::Int(1)),
            Err(FilterError::InvalidValue { .. })
        ));
        assert!(matches!(
            set.push("source_id", Op::Eq, FilterValue::List(vec![FilterValue::Int(1)])),
            Err(FilterError::InvalidValue { .. })
        ));
        assert!(matches!(
            set.push("category", Op::In, FilterValue::List(Vec::new())),
            Err(FilterError::InvalidValue { .. })
        ));
        assert!(matches!(
            set.push("title", Op::Contains, FilterValue::Int(3)),
            Err(FilterError::InvalidValue { .. })
        ));
        assert!(set.is_empty());

        set.push("source_id", Op::In, FilterValue::List(vec![FilterValue::Int(1), FilterValue::Int(2)]))
            .unwrap();
        assert!(sql_of(&set).contains("a.source_id IN (?, ?)"));
    }

    #[test]
    fn test_plain_key_is_equality() {
        let set = parse(&[("source_id", "3")]).unwrap();
        assert_eq!(set.predicates().len(), 1);
        assert_eq!(set.predicates()[0].op, Op::Eq);
        assert_eq!(set.predicates()[0].value, FilterValue::Int(3));
        assert!(sql_of(&set).ends_with("AND a.source_id = ?"));
    }

    #[test]
    fn test_gte_on_float_field() {
        let set = parse(&[("sentiment_score__gte", "0.25")]).unwrap();
        assert_eq!(set.predicates()[0].value, FilterValue::Float(0.25));
        assert!(sql_of(&set).contains("a.sentiment_score >= ?"));
    }

    #[test]
    fn test_in_list_renders_placeholders() {
        let set = parse(&[("category__in", "tech, science ,world")]).unwrap();
        match &set.predicates()[0].value {
            FilterValue::List(items) => assert_eq!(items.len(), 3),
            other => panic!("expected list, got {other:?}"),
        }
        assert!(sql_of(&set).contains("a.category COLLATE NOCASE IN (?, ?, ?)"));
    }

    #[test]
    fn test_reserved_keys_ignored() {
        let set = parse(&[("cursor", "abc"), ("limit", "10"), ("sort", "-published_at")]).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse(&[("password__eq", "x")]).unwrap_err();
        assert_eq!(err, FilterError::UnknownField("password".into()));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = parse(&[("source_id__between", "1")]).unwrap_err();
        assert!(matches!(err, FilterError::UnsupportedOperator { .. }));
    }

    #[test]
    fn test_operator_not_allowed_for_kind() {
        let err = parse(&[("sentiment_score__contains", "1")]).unwrap_err();
        assert!(matches!(err, FilterError::UnsupportedOperator { .. }));

        let err = parse(&[("category__gt", "a")]).unwrap_err();
        assert!(matches!(err, FilterError::UnsupportedOperator { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            parse(&[("source_id", "three")]).unwrap_err(),
            FilterError::InvalidValue { .. }
        ));
        assert!(matches!(
            parse(&[("bias_score__lt", "NaN")]).unwrap_err(),
            FilterError::InvalidValue { .. }
        ));
        assert!(matches!(
            parse(&[("category__in", " , ")]).unwrap_err(),
            FilterError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(parse_timestamp("1704067200"), Some(NOW));
        assert_eq!(parse_timestamp("2024-01-01T00:00:00Z"), Some(NOW));
        assert_eq!(parse_timestamp("2024-01-01T02:00:00+02:00"), Some(NOW));
        assert_eq!(parse_timestamp("2024-01-01"), Some(NOW));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_date_range_values() {
        assert_eq!(parse_date_range("24h", NOW).unwrap(), NOW - 86_400);
        assert_eq!(parse_date_range("7d", NOW).unwrap(), NOW - 7 * 86_400);
        assert_eq!(parse_date_range("week", NOW).unwrap(), NOW - 7 * 86_400);
        assert_eq!(parse_date_range("month", NOW).unwrap(), NOW - 30 * 86_400);
        assert_eq!(parse_date_range("today", NOW + 3_600).unwrap(), NOW);
        assert!(parse_date_range("0d", NOW).is_err());
        assert!(parse_date_range("5y", NOW).is_err());
        assert!(parse_date_range("99999d", NOW).is_err());
        assert!(parse_date_range("", NOW).is_err());
    }

    #[test]
    fn test_date_range_becomes_published_lower_bound() {
        let set = parse(&[("date_range", "24h")]).unwrap();
        let pred = &set.predicates()[0];
        assert_eq!(pred.field.name, "published_at");
        assert_eq!(pred.op, Op::Gte);
        assert_eq!(pred.value, FilterValue::Int(NOW - 86_400));
    }

    #[test]
    fn test_topic_membership_sql() {
        let set = parse(&[("topic", "AI"), ("topic__ne", "sports")]).unwrap();
        assert_eq!(set.predicates()[0].value, FilterValue::Text("ai".into()));
        let sql = sql_of(&set);
        assert!(sql.contains("AND EXISTS (SELECT 1 FROM json_each(a.topics) WHERE json_each.value = ?)"));
        assert!(sql.contains("AND NOT EXISTS (SELECT 1 FROM json_each(a.topics)"));
    }

    #[test]
    fn test_contains_escapes_wildcards() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        let set = parse(&[("title__contains", "rust")]).unwrap();
        assert!(sql_of(&set).contains("a.title LIKE ? ESCAPE '\\'"));
    }

    #[test]
    fn test_multiple_predicates_are_conjoined() {
        let set = parse(&[
            ("source_id__in", "1,2"),
            ("relevance_score__gt", "0.5"),
            ("processing_status__ne", "failed"),
        ])
        .unwrap();
        let sql = sql_of(&set);
        assert_eq!(sql.matches(" AND ").count(), 3);
    }

    #[test]
    fn test_in_list_size_cap() {
        let many: Vec<String> = (0..=MAX_IN_VALUES).map(|i| i.to_string()).collect();
        let joined = many.join(",");
        let err = parse(&[("source_id__in", joined.as_str())]).unwrap_err();
        assert!(matches!(err, FilterError::InvalidValue { .. }));
    }
}
