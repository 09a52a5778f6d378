//! Queries and their results.

pub mod qom;
pub mod row;

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::transport::RawRow;
use crate::value::Value;

pub use qom::QueryObjectModel;
pub use row::{Row, RowIterator};

/// Statement language understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryLanguage {
    XPath,
    Sql,
    JcrSql2,
    JcrJqom,
}

impl QueryLanguage {
    pub fn name(self) -> &'static str {
        match self {
            QueryLanguage::XPath => "xpath",
            QueryLanguage::Sql => "sql",
            QueryLanguage::JcrSql2 => "JCR-SQL2",
            QueryLanguage::JcrJqom => "JCR-JQOM",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "xpath" => Ok(QueryLanguage::XPath),
            "sql" => Ok(QueryLanguage::Sql),
            "JCR-SQL2" => Ok(QueryLanguage::JcrSql2),
            "JCR-JQOM" => Ok(QueryLanguage::JcrJqom),
            other => Err(Error::unsupported(format!("query language '{}'", other))),
        }
    }
}

/// A query statement with its paging and bound variables
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    statement: String,
    language: QueryLanguage,
    limit: Option<u64>,
    offset: Option<u64>,
    bindings: BTreeMap<String, Value>,
}

impl Query {
    pub fn new(statement: impl Into<String>, language: QueryLanguage) -> Self {
        Self {
            statement: statement.into(),
            language,
            limit: None,
            offset: None,
            bindings: BTreeMap::new(),
        }
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn language(&self) -> QueryLanguage {
        self.language
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn set_limit(&mut self, limit: u64) {
        self.limit = Some(limit);
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = Some(offset);
    }

    /// Bind `$name` in a JCR-SQL2 statement.
    pub fn bind_value(&mut self, name: &str, value: Value) -> Result<()> {
        if self.language != QueryLanguage::JcrSql2 && self.language != QueryLanguage::JcrJqom {
            return Err(Error::unsupported(format!(
                "bind variables in {} queries",
                self.language.name()
            )));
        }
        if !self.bind_variable_names().iter().any(|n| n == name) {
            return Err(Error::InvalidItemState(format!("no bind variable ${} in query", name)));
        }
        self.bindings.insert(name.to_string(), value);
        Ok(())
    }

    /// Names of every `$variable` in the statement, in order of appearance.
    pub fn bind_variable_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (start, end) in variable_spans(&self.statement) {
            let name = self.statement[start + 1..end].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Statement with bound variables substituted as literals.
    pub fn effective_statement(&self) -> Result<String> {
        if self.bindings.is_empty() {
            return Ok(self.statement.clone());
        }
        let mut out = String::with_capacity(self.statement.len());
        let mut last = 0;
        for (start, end) in variable_spans(&self.statement) {
            let name = &self.statement[start + 1..end];
            let value = self
                .bindings
                .get(name)
                .ok_or_else(|| Error::InvalidItemState(format!("unbound variable ${}", name)))?;
            out.push_str(&self.statement[last..start]);
            out.push_str(&qom::literal(value));
            last = end;
        }
        out.push_str(&self.statement[last..]);
        Ok(out)
    }

    /// Copy with bindings substituted, ready to send.
    pub fn resolved(&self) -> Result<Query> {
        Ok(Query {
            statement: self.effective_statement()?,
            language: self.language,
            limit: self.limit,
            offset: self.offset,
            bindings: BTreeMap::new(),
        })
    }
}

/// Byte spans of `$name` tokens outside quoted literals.
fn variable_spans(statement: &str) -> Vec<(usize, usize)> {
    let bytes = statement.as_bytes();
    let mut spans = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let mut end = i + 1;
                while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                    end += 1;
                }
                if end > i + 1 {
                    spans.push((i, end));
                    i = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    spans
}

/// Buffered outcome of an executed query
#[derive(Debug, Clone)]
pub struct QueryResult {
    rows: Vec<Row>,
}

impl QueryResult {
    pub fn new(raw: Vec<RawRow>) -> Self {
        Self {
            rows: raw.into_iter().map(Row::new).collect(),
        }
    }

    /// Column names of the first row, qualified by selector.
    pub fn column_names(&self) -> Vec<String> {
        self.rows
            .first()
            .map(|row| row.values().into_keys().collect())
            .unwrap_or_default()
    }

    pub fn selector_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        if let Some(row) = self.rows.first() {
            for name in row.selector_names() {
                if !name.is_empty() && !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    pub fn rows(&self) -> RowIterator {
        RowIterator::new(self.rows.clone())
    }

    /// Paths of the node each row yields for `selector`, skipping rows
    /// without one.
    pub fn node_paths(&self, selector: Option<&str>) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.path(selector).ok().map(str::to_string))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawColumn;

    #[test]
    fn test_language_names() {
        for lang in [
            QueryLanguage::XPath,
            QueryLanguage::Sql,
            QueryLanguage::JcrSql2,
            QueryLanguage::JcrJqom,
        ] {
            assert_eq!(QueryLanguage::from_name(lang.name()).unwrap(), lang);
        }
        assert!(QueryLanguage::from_name("lucene").is_err());
    }

    #[test]
    fn test_bind_variables() {
        let mut query = Query::new(
            "SELECT * FROM [nt:base] WHERE [title] = $title AND [note] = '$notavar' AND [n] > $min",
            QueryLanguage::JcrSql2,
        );
        assert_eq!(query.bind_variable_names(), vec!["title", "min"]);
        assert!(query.bind_value("other", Value::from("x")).is_err());

        query.bind_value("title", Value::from("it's")).unwrap();
        assert!(query.effective_statement().is_err());
        query.bind_value("min", Value::Long(3)).unwrap();
        assert_eq!(
            query.effective_statement().unwrap(),
            "SELECT * FROM [nt:base] WHERE [title] = 'it''s' AND [note] = '$notavar' AND [n] > 3"
        );
    }

    #[test]
    fn test_xpath_rejects_bindings() {
        let mut query = Query::new("//element(*, nt:file)", QueryLanguage::XPath);
        assert!(query.bind_value("x", Value::Long(1)).is_err());
        assert_eq!(query.effective_statement().unwrap(), "//element(*, nt:file)");
    }

    #[test]
    fn test_result_accessors() {
        let result = QueryResult::new(vec![
            vec![
                RawColumn::new("s.jcr:path", None, Some("/a")),
                RawColumn::new("s.title", None, Some("A")),
            ],
            vec![
                RawColumn::new("s.jcr:path", None, Some("/b")),
                RawColumn::new("s.title", None, None),
            ],
        ]);
        assert_eq!(result.len(), 2);
        assert_eq!(result.column_names(), vec!["s.title"]);
        assert_eq!(result.selector_names(), vec!["s"]);
        assert_eq!(result.node_paths(None), vec!["/a", "/b"]);
        let mut rows = result.rows();
        rows.seek(1).unwrap();
        assert_eq!(rows.current().unwrap().value("title").unwrap(), None);
    }
}
