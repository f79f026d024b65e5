//! Structured queries over document collections.
//!
//! Filters compile to `json_extract` expressions; ordering always breaks ties
//! on the document id so `(value, id)` cursors give stable pagination.

use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::sqlite::{Sqlite, SqliteArguments};

use super::{DocumentStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    /// Field value is one of an array of candidates
    In,
    /// Field is an array holding the value
    ArrayContains,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Position after which a page starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub value: Value,
    pub id: String,
}

/// A stored document with its id.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn into_decoded<T: DeserializeOwned>(self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.data)?)
    }

    /// Cursor positioned on this document for the given ordering.
    pub fn cursor(&self, query: &Query) -> Cursor {
        let value = query
            .order_by
            .as_ref()
            .and_then(|(field, _)| field_value(&self.data, field))
            .cloned()
            .unwrap_or(Value::Null);
        Cursor {
            value,
            id: self.id.clone(),
        }
    }
}

/// Look up a dotted field path inside a document.
pub fn field_value<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |current, key| current.get(key))
}

#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub start_after: Option<Cursor>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            start_after: None,
            limit: None,
            offset: 0,
        }
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn where_eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn where_in(self, field: &str, values: Vec<Value>) -> Self {
        self.filter(field, FilterOp::In, Value::Array(values))
    }

    pub fn array_contains(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::ArrayContains, value)
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Compile into SQL plus positional bind values.
    pub(crate) fn to_sql(&self, count_only: bool) -> Result<(String, Vec<Value>), StoreError> {
        let mut sql = if count_only {
            String::from("SELECT COUNT(*) AS n FROM documents WHERE collection = ?")
        } else {
            String::from("SELECT id, data FROM documents WHERE collection = ?")
        };
        let mut binds = vec![Value::String(self.collection.clone())];

        for filter in &self.filters {
            let path = json_path(&filter.field)?;
            let expr = format!("json_extract(data, '{}')", path);
            match filter.op {
                FilterOp::Eq if filter.value.is_null() => {
                    sql.push_str(&format!(" AND {} IS NULL", expr));
                }
                FilterOp::Eq => push_compare(&mut sql, &mut binds, &expr, "=", &filter.value),
                FilterOp::Lt => push_compare(&mut sql, &mut binds, &expr, "<", &filter.value),
                FilterOp::Le => push_compare(&mut sql, &mut binds, &expr, "<=", &filter.value),
                FilterOp::Gt => push_compare(&mut sql, &mut binds, &expr, ">", &filter.value),
                FilterOp::Ge => push_compare(&mut sql, &mut binds, &expr, ">=", &filter.value),
                FilterOp::In => {
                    let candidates = filter.value.as_array().cloned().unwrap_or_default();
                    if candidates.is_empty() {
                        sql.push_str(" AND 0");
                    } else {
                        let marks = vec!["?"; candidates.len()].join(", ");
                        sql.push_str(&format!(" AND {} IN ({})", expr, marks));
                        binds.extend(candidates);
                    }
                }
                FilterOp::ArrayContains => {
                    sql.push_str(&format!(
                        " AND EXISTS (SELECT 1 FROM json_each(data, '{}') WHERE json_each.value = ?)",
                        path
                    ));
                    binds.push(filter.value.clone());
                }
            }
        }

        if count_only {
            return Ok((sql, binds));
        }

        let ordering = match &self.order_by {
            Some((field, direction)) => Some((json_path(field)?, *direction)),
            None => None,
        };

        if let Some(cursor) = &self.start_after {
            match &ordering {
                Some((path, direction)) => {
                    let expr = format!("json_extract(data, '{}')", path);
                    let cmp = if *direction == Direction::Asc { ">" } else { "<" };
                    if cursor.value.is_null() {
                        // NULLs sort first ascending and last descending
                        match direction {
                            Direction::Asc => {
                                sql.push_str(&format!(
                                    " AND ({} IS NOT NULL OR id {} ?)",
                                    expr, cmp
                                ));
                            }
                            Direction::Desc => {
                                sql.push_str(&format!(" AND ({} IS NULL AND id {} ?)", expr, cmp));
                            }
                        }
                        binds.push(Value::String(cursor.id.clone()));
                    } else {
                        sql.push_str(&format!(
                            " AND ({e} {c} ? OR ({e} = ? AND id {c} ?))",
                            e = expr,
                            c = cmp
                        ));
                        binds.push(cursor.value.clone());
                        binds.push(cursor.value.clone());
                        binds.push(Value::String(cursor.id.clone()));
                    }
                }
                None => {
                    sql.push_str(" AND id > ?");
                    binds.push(Value::String(cursor.id.clone()));
                }
            }
        }

        match &ordering {
            Some((path, Direction::Asc)) => {
                sql.push_str(&format!(" ORDER BY json_extract(data, '{}') ASC, id ASC", path))
            }
            Some((path, Direction::Desc)) => {
                sql.push_str(&format!(" ORDER BY json_extract(data, '{}') DESC, id DESC", path))
            }
            None => sql.push_str(" ORDER BY id ASC"),
        }

        match self.limit {
            Some(limit) => sql.push_str(&format!(" LIMIT {}", limit)),
            None if self.offset > 0 => sql.push_str(" LIMIT -1"),
            None => {}
        }
        if self.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", self.offset));
        }

        Ok((sql, binds))
    }
}

fn push_compare(sql: &mut String, binds: &mut Vec<Value>, expr: &str, op: &str, value: &Value) {
    sql.push_str(&format!(" AND {} {} ?", expr, op));
    binds.push(value.clone());
}

/// Convert a dotted field path into a JSON path, rejecting anything that could escape the literal.
pub(crate) fn json_path(field: &str) -> Result<String, StoreError> {
    let valid = !field.is_empty()
        && field.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(format!("$.{}", field))
    } else {
        Err(StoreError::InvalidField(field.to_string()))
    }
}

/// Bind a JSON value the way `json_extract` would surface it.
pub(crate) fn bind_json<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Lazily walks a query page by page using `(value, id)` cursors.
pub struct QueryPager {
    store: DocumentStore,
    query: Query,
    page_size: usize,
    remaining: Option<usize>,
    done: bool,
}

impl QueryPager {
    pub(crate) fn new(store: DocumentStore, mut query: Query, page_size: usize) -> Self {
        let remaining = query.limit.take();
        Self {
            store,
            query,
            page_size: page_size.max(1),
            remaining,
            done: false,
        }
    }

    /// Fetch the next page, or `None` once the query is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Document>>, StoreError> {
        if self.done {
            return Ok(None);
        }
        let take = match self.remaining {
            Some(0) => {
                self.done = true;
                return Ok(None);
            }
            Some(remaining) => remaining.min(self.page_size),
            None => self.page_size,
        };

        let mut page_query = self.query.clone();
        page_query.limit = Some(take);
        let docs = self.store.query(&page_query).await?;

        if docs.len() < take {
            self.done = true;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= docs.len();
        }
        if let Some(last) = docs.last() {
            self.query.start_after = Some(last.cursor(&self.query));
            self.query.offset = 0;
        }

        if docs.is_empty() {
            Ok(None)
        } else {
            Ok(Some(docs))
        }
    }

    /// Drain every remaining page.
    pub async fn collect_all(mut self) -> Result<Vec<Document>, StoreError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rejects_injection_in_field_names() {
        assert!(json_path("metrics.views").is_ok());
        assert!(json_path("a') OR 1=1 --").is_err());
        assert!(json_path("a..b").is_err());
        assert!(json_path("").is_err());
    }

    #[test]
    fn test_cursor_clause_breaks_ties_on_id() {
        let query = Query::collection("feed")
            .where_eq("nodeId", "n1")
            .order_by("createdAt", Direction::Desc)
            .start_after(Some(Cursor {
                value: json!(100),
                id: "f3".to_string(),
            }))
            .limit(10);
        let (sql, binds) = query.to_sql(false).unwrap();
        assert!(sql.contains("json_extract(data, '$.createdAt') < ?"));
        assert!(sql.contains("id < ?"));
        assert!(sql.ends_with("ORDER BY json_extract(data, '$.createdAt') DESC, id DESC LIMIT 10"));
        assert_eq!(binds, vec![json!("feed"), json!("n1"), json!(100), json!(100), json!("f3")]);
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let (sql, _) = Query::collection("feed")
            .where_in("nodeId", vec![])
            .to_sql(false)
            .unwrap();
        assert!(sql.contains("AND 0"));
    }

    #[test]
    fn test_field_value_walks_nested_objects() {
        let doc = json!({"metrics": {"views": 3}});
        assert_eq!(field_value(&doc, "metrics.views"), Some(&json!(3)));
        assert_eq!(field_value(&doc, "metrics.likes"), None);
    }
}
