//! Query object model.
//!
//! A tree of sources, constraints, operands, orderings and columns that
//! renders itself as a JCR-SQL2 statement.

use std::fmt::{self, Write};

use super::{Query, QueryLanguage};
use crate::value::{PropertyType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
}

impl JoinType {
    fn keyword(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::LeftOuter => "LEFT OUTER JOIN",
            JoinType::RightOuter => "RIGHT OUTER JOIN",
        }
    }
}

/// Where rows come from
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Selector {
        node_type: String,
        name: Option<String>,
    },
    Join {
        left: Box<Source>,
        right: Box<Source>,
        join_type: JoinType,
        condition: JoinCondition,
    },
}

impl Source {
    pub fn selector(node_type: &str, name: Option<&str>) -> Self {
        Source::Selector {
            node_type: node_type.to_string(),
            name: name.map(str::to_string),
        }
    }

    pub fn join(left: Source, right: Source, join_type: JoinType, condition: JoinCondition) -> Self {
        Source::Join {
            left: Box::new(left),
            right: Box::new(right),
            join_type,
            condition,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinCondition {
    Equi {
        selector1: String,
        property1: String,
        selector2: String,
        property2: String,
    },
    SameNode {
        selector1: String,
        selector2: String,
        path: Option<String>,
    },
    ChildNode {
        child: String,
        parent: String,
    },
    DescendantNode {
        descendant: String,
        ancestor: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    EqualTo,
    NotEqualTo,
    LessThan,
    LessThanOrEqualTo,
    GreaterThan,
    GreaterThanOrEqualTo,
    Like,
}

impl Operator {
    fn symbol(self) -> &'static str {
        match self {
            Operator::EqualTo => "=",
            Operator::NotEqualTo => "<>",
            Operator::LessThan => "<",
            Operator::LessThanOrEqualTo => "<=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqualTo => ">=",
            Operator::Like => "LIKE",
        }
    }
}

/// Operand evaluated per row
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicOperand {
    PropertyValue {
        selector: Option<String>,
        property: String,
    },
    Length {
        selector: Option<String>,
        property: String,
    },
    NodeName(Option<String>),
    NodeLocalName(Option<String>),
    FullTextSearchScore(Option<String>),
    LowerCase(Box<DynamicOperand>),
    UpperCase(Box<DynamicOperand>),
}

impl DynamicOperand {
    pub fn property(selector: Option<&str>, property: &str) -> Self {
        DynamicOperand::PropertyValue {
            selector: selector.map(str::to_string),
            property: property.to_string(),
        }
    }

    pub fn lower(self) -> Self {
        DynamicOperand::LowerCase(Box::new(self))
    }

    pub fn upper(self) -> Self {
        DynamicOperand::UpperCase(Box::new(self))
    }
}

/// Operand fixed for the whole query
#[derive(Debug, Clone, PartialEq)]
pub enum StaticOperand {
    Literal(Value),
    BindVariable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    And(Box<Constraint>, Box<Constraint>),
    Or(Box<Constraint>, Box<Constraint>),
    Not(Box<Constraint>),
    Comparison {
        operand1: DynamicOperand,
        operator: Operator,
        operand2: StaticOperand,
    },
    PropertyExistence {
        selector: Option<String>,
        property: String,
    },
    FullTextSearch {
        selector: Option<String>,
        /// `None` searches every property
        property: Option<String>,
        expression: String,
    },
    SameNode {
        selector: Option<String>,
        path: String,
    },
    ChildNode {
        selector: Option<String>,
        path: String,
    },
    DescendantNode {
        selector: Option<String>,
        path: String,
    },
}

impl Constraint {
    pub fn and(self, other: Constraint) -> Self {
        Constraint::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Constraint) -> Self {
        Constraint::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Constraint::Not(Box::new(self))
    }

    pub fn compare(operand1: DynamicOperand, operator: Operator, operand2: StaticOperand) -> Self {
        Constraint::Comparison {
            operand1,
            operator,
            operand2,
        }
    }

    pub fn descendant_of(selector: Option<&str>, path: &str) -> Self {
        Constraint::DescendantNode {
            selector: selector.map(str::to_string),
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ordering {
    pub operand: DynamicOperand,
    pub order: Order,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub selector: Option<String>,
    /// `None` selects every property of the selector
    pub property: Option<String>,
    pub column_name: Option<String>,
}

/// A query expressed as an object tree
#[derive(Debug, Clone, PartialEq)]
pub struct QueryObjectModel {
    pub source: Source,
    pub constraint: Option<Constraint>,
    pub orderings: Vec<Ordering>,
    pub columns: Vec<Column>,
}

impl QueryObjectModel {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            constraint: None,
            orderings: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    pub fn order_by(mut self, operand: DynamicOperand, order: Order) -> Self {
        self.orderings.push(Ordering { operand, order });
        self
    }

    pub fn column(mut self, selector: Option<&str>, property: Option<&str>, column_name: Option<&str>) -> Self {
        self.columns.push(Column {
            selector: selector.map(str::to_string),
            property: property.map(str::to_string),
            column_name: column_name.map(str::to_string),
        });
        self
    }

    /// Render as JCR-SQL2.
    pub fn statement(&self) -> String {
        self.to_string()
    }

    /// A query running the rendered statement.
    pub fn to_query(&self) -> Query {
        Query::new(self.statement(), QueryLanguage::JcrSql2)
    }
}

impl fmt::Display for QueryObjectModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        if self.columns.is_empty() {
            f.write_str("*")?;
        } else {
            let columns: Vec<String> = self.columns.iter().map(render_column).collect();
            f.write_str(&columns.join(", "))?;
        }
        write!(f, " FROM {}", render_source(&self.source))?;
        if let Some(constraint) = &self.constraint {
            write!(f, " WHERE {}", render_constraint(constraint))?;
        }
        if !self.orderings.is_empty() {
            let orderings: Vec<String> = self
                .orderings
                .iter()
                .map(|o| {
                    let dir = match o.order {
                        Order::Ascending => "ASC",
                        Order::Descending => "DESC",
                    };
                    format!("{} {}", render_operand(&o.operand), dir)
                })
                .collect();
            write!(f, " ORDER BY {}", orderings.join(", "))?;
        }
        Ok(())
    }
}

fn quote(name: &str) -> String {
    format!("[{}]", name)
}

fn qualified(selector: &Option<String>, property: &str) -> String {
    match selector {
        Some(s) => format!("{}.{}", quote(s), quote(property)),
        None => quote(property),
    }
}

fn render_column(column: &Column) -> String {
    let mut out = match (&column.selector, &column.property) {
        (Some(s), Some(p)) => format!("{}.{}", quote(s), quote(p)),
        (None, Some(p)) => quote(p),
        (Some(s), None) => format!("{}.*", quote(s)),
        (None, None) => "*".to_string(),
    };
    if let Some(name) = &column.column_name {
        let _ = write!(out, " AS {}", quote(name));
    }
    out
}

fn render_source(source: &Source) -> String {
    match source {
        Source::Selector { node_type, name } => match name {
            Some(name) => format!("{} AS {}", quote(node_type), quote(name)),
            None => quote(node_type),
        },
        Source::Join {
            left,
            right,
            join_type,
            condition,
        } => format!(
            "{} {} {} ON {}",
            render_source(left),
            join_type.keyword(),
            render_source(right),
            render_join_condition(condition)
        ),
    }
}

fn render_join_condition(condition: &JoinCondition) -> String {
    match condition {
        JoinCondition::Equi {
            selector1,
            property1,
            selector2,
            property2,
        } => format!(
            "{}.{} = {}.{}",
            quote(selector1),
            quote(property1),
            quote(selector2),
            quote(property2)
        ),
        JoinCondition::SameNode {
            selector1,
            selector2,
            path,
        } => match path {
            Some(path) => format!("ISSAMENODE({}, {}, {})", quote(selector1), quote(selector2), quote(path)),
            None => format!("ISSAMENODE({}, {})", quote(selector1), quote(selector2)),
        },
        JoinCondition::ChildNode { child, parent } => {
            format!("ISCHILDNODE({}, {})", quote(child), quote(parent))
        }
        JoinCondition::DescendantNode { descendant, ancestor } => {
            format!("ISDESCENDANTNODE({}, {})", quote(descendant), quote(ancestor))
        }
    }
}

fn path_function(name: &str, selector: &Option<String>, path: &str) -> String {
    match selector {
        Some(s) => format!("{}({}, {})", name, quote(s), quote(path)),
        None => format!("{}({})", name, quote(path)),
    }
}

fn render_constraint(constraint: &Constraint) -> String {
    match constraint {
        Constraint::And(a, b) => format!("({} AND {})", render_constraint(a), render_constraint(b)),
        Constraint::Or(a, b) => format!("({} OR {})", render_constraint(a), render_constraint(b)),
        Constraint::Not(c) => format!("NOT {}", render_constraint(c)),
        Constraint::Comparison {
            operand1,
            operator,
            operand2,
        } => format!(
            "{} {} {}",
            render_operand(operand1),
            operator.symbol(),
            render_static(operand2)
        ),
        Constraint::PropertyExistence { selector, property } => {
            format!("{} IS NOT NULL", qualified(selector, property))
        }
        Constraint::FullTextSearch {
            selector,
            property,
            expression,
        } => {
            let target = match (selector, property) {
                (Some(s), Some(p)) => format!("{}.{}", quote(s), quote(p)),
                (None, Some(p)) => quote(p),
                (Some(s), None) => format!("{}.*", quote(s)),
                (None, None) => "*".to_string(),
            };
            format!("CONTAINS({}, {})", target, string_literal(expression))
        }
        Constraint::SameNode { selector, path } => path_function("ISSAMENODE", selector, path),
        Constraint::ChildNode { selector, path } => path_function("ISCHILDNODE", selector, path),
        Constraint::DescendantNode { selector, path } => path_function("ISDESCENDANTNODE", selector, path),
    }
}

fn selector_arg(selector: &Option<String>) -> String {
    selector.as_deref().map(quote).unwrap_or_default()
}

fn render_operand(operand: &DynamicOperand) -> String {
    match operand {
        DynamicOperand::PropertyValue { selector, property } => qualified(selector, property),
        DynamicOperand::Length { selector, property } => format!("LENGTH({})", qualified(selector, property)),
        DynamicOperand::NodeName(selector) => format!("NAME({})", selector_arg(selector)),
        DynamicOperand::NodeLocalName(selector) => format!("LOCALNAME({})", selector_arg(selector)),
        DynamicOperand::FullTextSearchScore(selector) => format!("SCORE({})", selector_arg(selector)),
        DynamicOperand::LowerCase(inner) => format!("LOWER({})", render_operand(inner)),
        DynamicOperand::UpperCase(inner) => format!("UPPER({})", render_operand(inner)),
    }
}

fn render_static(operand: &StaticOperand) -> String {
    match operand {
        StaticOperand::Literal(value) => literal(value),
        StaticOperand::BindVariable(name) => format!("${}", name),
    }
}

fn string_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// JCR-SQL2 literal for a value; non-string types are cast explicitly.
pub fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => string_literal(s),
        Value::Long(v) => v.to_string(),
        other => {
            let type_name = match other.kind() {
                PropertyType::Uri => "URI".to_string(),
                kind => kind.name().to_ascii_uppercase(),
            };
            format!("CAST({} AS {})", string_literal(&other.to_jcr_string()), type_name)
        }
    }
}
