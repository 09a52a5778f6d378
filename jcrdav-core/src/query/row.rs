//! Query result rows.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::item::Node;
use crate::session::Session;
use crate::transport::{RawColumn, RawRow};

/// One row of a query result, normalized per selector.
///
/// Column names arrive either as `selector.property`, with an explicit
/// selector name, or untagged. `jcr:score` and `jcr:path` columns are pulled
/// out into per-selector score and path maps.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<RawColumn>,
    scores: BTreeMap<String, f64>,
    paths: BTreeMap<String, String>,
    values: BTreeMap<String, BTreeMap<String, Option<String>>>,
    default_selector: String,
}

impl Row {
    pub fn new(raw: RawRow) -> Self {
        let mut row = Row::default();
        let mut default_selector: Option<String> = None;

        for mut column in raw {
            let selector = match column.name.find('.') {
                Some(pos) => {
                    let selector = column.name[..pos].to_string();
                    column.name = column.name[pos + 1..].to_string();
                    selector
                }
                None => column.selector.clone().unwrap_or_default(),
            };

            match column.name.as_str() {
                "jcr:score" => {
                    let score = column
                        .value
                        .as_deref()
                        .and_then(|v| v.trim().parse::<f64>().ok())
                        .unwrap_or(0.0);
                    row.scores.insert(selector, score);
                }
                "jcr:path" => {
                    if let Some(path) = column.value.clone() {
                        row.paths.insert(selector, path);
                    }
                }
                name => {
                    if name.ends_with("jcr:primaryType") {
                        default_selector = Some(selector.clone());
                    }
                    row.values
                        .entry(selector)
                        .or_default()
                        .insert(name.to_string(), column.value.clone());
                    row.columns.push(column);
                }
            }
        }

        if default_selector.is_none() && row.paths.len() == 1 {
            default_selector = row.paths.keys().next().cloned();
        }
        row.default_selector = default_selector.unwrap_or_default();

        if let Some(untagged) = row.values.remove("") {
            row.values
                .entry(row.default_selector.clone())
                .or_default()
                .extend(untagged);
        }
        row
    }

    pub fn default_selector(&self) -> &str {
        &self.default_selector
    }

    /// Every value keyed `selector.column`.
    pub fn values(&self) -> BTreeMap<String, Option<String>> {
        let mut out = BTreeMap::new();
        for (selector, columns) in &self.values {
            for (name, value) in columns {
                out.insert(format!("{}.{}", selector, name), value.clone());
            }
        }
        out
    }

    /// Value of a column; undotted names resolve against the default selector.
    pub fn value(&self, column: &str) -> Result<Option<String>> {
        let (selector, name) = match column.find('.') {
            Some(pos) => (&column[..pos], &column[pos + 1..]),
            None => (self.default_selector.as_str(), column),
        };
        self.values
            .get(selector)
            .and_then(|columns| columns.get(name))
            .cloned()
            .ok_or_else(|| Error::ItemNotFound(format!("column '{}.{}' not found", selector, name)))
    }

    pub fn path(&self, selector: Option<&str>) -> Result<&str> {
        let selector = selector.unwrap_or(&self.default_selector);
        self.paths
            .get(selector)
            .map(String::as_str)
            .ok_or_else(|| Error::Protocol(format!("no path for selector '{}'", selector)))
    }

    pub fn score(&self, selector: Option<&str>) -> Result<f64> {
        let selector = selector.unwrap_or(&self.default_selector);
        self.scores
            .get(selector)
            .copied()
            .ok_or_else(|| Error::Protocol(format!("no score for selector '{}'", selector)))
    }

    /// Resolve the row's node for `selector` through the session.
    pub async fn node<'s>(&self, session: &'s mut Session, selector: Option<&str>) -> Result<&'s Node> {
        let path = self.path(selector)?.to_string();
        session.node(&path).await
    }

    /// Columns other than score and path, with selector prefixes stripped.
    pub fn columns(&self) -> &[RawColumn] {
        &self.columns
    }

    pub(crate) fn selector_names(&self) -> impl Iterator<Item = &String> {
        self.paths.keys().chain(self.values.keys())
    }
}

/// Seekable cursor over fully buffered rows
#[derive(Debug, Clone)]
pub struct RowIterator {
    rows: Vec<Row>,
    position: usize,
}

impl RowIterator {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows, position: 0 }
    }

    /// Jump to `position`; fails when out of range.
    pub fn seek(&mut self, position: usize) -> Result<()> {
        self.position = position;
        if position >= self.rows.len() {
            return Err(Error::ItemNotFound(format!("invalid seek position ({})", position)));
        }
        Ok(())
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn current(&self) -> Option<&Row> {
        self.rows.get(self.position)
    }
}

impl Iterator for RowIterator {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        let row = self.rows.get(self.position).cloned()?;
        self.position += 1;
        Some(row)
    }
}
