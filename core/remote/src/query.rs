//! Table query model shared by backends, the gateway and the cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
}

impl FilterOp {
    /// PostgREST operator name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Like => "like",
            Self::In => "in",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    /// Evaluate against a row. Missing columns never match.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(actual) = row.get(&self.column) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => values_equal(actual, &self.value),
            FilterOp::Neq => !values_equal(actual, &self.value),
            FilterOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Like => match (actual.as_str(), self.value.as_str()) {
                (Some(text), Some(pattern)) => like(text, pattern),
                _ => false,
            },
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|options| options.iter().any(|v| values_equal(actual, v))),
        }
    }

    fn postgrest_value(&self) -> String {
        match (&self.op, &self.value) {
            (FilterOp::Eq, Value::Null) => "is.null".to_string(),
            (FilterOp::Neq, Value::Null) => "not.is.null".to_string(),
            (FilterOp::In, Value::Array(items)) => {
                let items: Vec<_> = items.iter().map(quote_list_item).collect();
                format!("in.({})", items.join(","))
            }
            (op, value) => format!("{}.{}", op, scalar_text(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

/// A table query: selected columns, filters, ordering and limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: String,
    /// Selected columns; empty means all.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    /// Select a comma-separated column list (`"*"` selects all).
    pub fn select(mut self, columns: &str) -> Self {
        self.columns = columns
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty() && *c != "*")
            .map(str::to_string)
            .collect();
        self
    }

    pub fn filter(mut self, column: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            op,
            value,
        });
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Eq, value.into())
    }

    pub fn neq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Neq, value.into())
    }

    pub fn gt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Gt, value.into())
    }

    pub fn gte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Gte, value.into())
    }

    pub fn lt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Lt, value.into())
    }

    pub fn lte(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Lte, value.into())
    }

    pub fn like(self, column: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.filter(column, FilterOp::Like, Value::String(pattern.into()))
    }

    pub fn in_list(self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.filter(column, FilterOp::In, Value::Array(values))
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order.push(OrderBy {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Deterministic cache key over the full query shape.
    pub fn cache_key(&self) -> String {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(",")
        };
        let filters: Vec<_> = self
            .filters
            .iter()
            .map(|f| format!("{}.{}.{}", f.column, f.op, f.value))
            .collect();
        let order: Vec<_> = self
            .order
            .iter()
            .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
            .collect();
        let limit = self.limit.map(|l| l.to_string()).unwrap_or_default();

        format!(
            "query:{}|select={}|where={}|order={}|limit={}",
            self.table,
            columns,
            filters.join("&"),
            order.join(","),
            limit
        )
    }

    /// Whether a row satisfies every filter.
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Filter, sort, truncate and project rows locally.
    pub fn apply(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut rows: Vec<_> = rows.into_iter().filter(|row| self.matches(row)).collect();
        self.sort(&mut rows);
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows.into_iter().map(|row| self.project(row)).collect()
    }

    /// Sort rows by the query's ordering.
    pub fn sort(&self, rows: &mut [Value]) {
        if self.order.is_empty() {
            return;
        }
        rows.sort_by(|a, b| {
            for order in &self.order {
                let ord = match (a.get(&order.column), b.get(&order.column)) {
                    (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                let ord = if order.ascending { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    /// Keep only the selected columns.
    pub fn project(&self, row: Value) -> Value {
        match row {
            Value::Object(map) if !self.columns.is_empty() => Value::Object(
                map.into_iter()
                    .filter(|(key, _)| self.columns.iter().any(|c| c == key))
                    .collect(),
            ),
            other => other,
        }
    }

    /// PostgREST query-string parameters for this query.
    pub fn postgrest_params(&self) -> Vec<(String, String)> {
        let mut params = vec![(
            "select".to_string(),
            if self.columns.is_empty() {
                "*".to_string()
            } else {
                self.columns.join(",")
            },
        )];
        for filter in &self.filters {
            params.push((filter.column.clone(), filter.postgrest_value()));
        }
        if !self.order.is_empty() {
            let order: Vec<_> = self
                .order
                .iter()
                .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
                .collect();
            params.push(("order".to_string(), order.join(",")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn quote_list_item(value: &Value) -> String {
    let text = scalar_text(value);
    if text.contains([',', '(', ')', '"']) {
        format!("\"{}\"", text.replace('"', "\\\""))
    } else {
        text
    }
}

/// Equality that treats `1` and `1.0` (and `"1"` ids against numbers) alike.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL `LIKE`: `%` matches any run, `_` any single character.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn products() -> Vec<Value> {
        vec![
            json!({"id": 1, "name": "Tea", "price": 4, "category": "drinks"}),
            json!({"id": 2, "name": "Teapot", "price": 30, "category": "kitchen"}),
            json!({"id": 3, "name": "Coffee", "price": 6, "category": "drinks"}),
        ]
    }

    #[test]
    fn test_cache_key_covers_shape() {
        let base = Query::new("products").select("id, name").eq("category", "drinks");
        let a = base.clone().order("price", true).limit(10);
        let b = base.clone().order("price", false).limit(10);
        let c = base.clone().order("price", true).limit(10);

        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), c.cache_key());
        assert!(a.cache_key().starts_with("query:products|"));
        assert_ne!(
            Query::new("products").select("*").cache_key(),
            Query::new("orders").select("*").cache_key()
        );
    }

    #[test]
    fn test_apply_filters_orders_limits() {
        let query = Query::new("products")
            .select("id,name")
            .eq("category", "drinks")
            .order("price", false)
            .limit(5);
        let rows = query.apply(products());
        assert_eq!(rows, vec![json!({"id": 3, "name": "Coffee"}), json!({"id": 1, "name": "Tea"})]);
    }

    #[test]
    fn test_operators() {
        let rows = products();
        let count = |q: Query| q.apply(rows.clone()).len();
        assert_eq!(count(Query::new("p").gt("price", 4)), 2);
        assert_eq!(count(Query::new("p").gte("price", 4)), 3);
        assert_eq!(count(Query::new("p").lt("price", 6)), 1);
        assert_eq!(count(Query::new("p").lte("price", 6)), 2);
        assert_eq!(count(Query::new("p").neq("category", "drinks")), 1);
        assert_eq!(count(Query::new("p").like("name", "Tea%")), 2);
        assert_eq!(count(Query::new("p").like("name", "_offee")), 1);
        assert_eq!(count(Query::new("p").in_list("id", vec![json!(1), json!(2)])), 2);
        assert_eq!(count(Query::new("p").eq("missing", 1)), 0);
        // String ids match numeric columns.
        assert_eq!(count(Query::new("p").eq("id", "2")), 1);
    }

    #[test]
    fn test_postgrest_params() {
        let query = Query::new("products")
            .eq("category", "drinks")
            .in_list("id", vec![json!(1), json!("a,b")])
            .eq("deleted_at", Value::Null)
            .order("price", false)
            .limit(2);
        let params = query.postgrest_params();
        assert_eq!(params[0], ("select".into(), "*".into()));
        assert_eq!(params[1], ("category".into(), "eq.drinks".into()));
        assert_eq!(params[2], ("id".into(), "in.(1,\"a,b\")".into()));
        assert_eq!(params[3], ("deleted_at".into(), "is.null".into()));
        assert_eq!(params[4], ("order".into(), "price.desc".into()));
        assert_eq!(params[5], ("limit".into(), "2".into()));
    }

    proptest! {
        #[test]
        fn prop_percent_matches_everything(text in ".*") {
            prop_assert!(like(&text, "%"));
            prop_assert!(like(&text, &text.replace(['%', '_'], "_")));
        }
    }
}
