//! Staged writes.
//!
//! Mutations are not sent when they happen: the object manager replays the
//! session's pending changes into an ordered log of typed operations, and the
//! transport flushes the whole log in one request on `finish_save`.

use crate::value::{PropertyType, Value};

/// Everything a transport needs to persist one property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySnapshot {
    pub name: String,
    pub kind: PropertyType,
    pub multiple: bool,
    pub values: Vec<Value>,
}

impl PropertySnapshot {
    pub fn single(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            kind: value.kind(),
            multiple: false,
            values: vec![value],
        }
    }

    pub fn multiple(name: impl Into<String>, kind: PropertyType, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            multiple: true,
            values,
        }
    }
}

/// A single staged operation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create a node with its initial properties.
    AddNode {
        path: String,
        properties: Vec<PropertySnapshot>,
    },
    /// Set (create or overwrite) a property at `path`.
    SetProperty {
        path: String,
        property: PropertySnapshot,
    },
    RemoveNode { path: String },
    RemoveProperty { path: String },
    Move { src: String, dst: String },
    /// Place `child` of `parent` before `before`, or last when `None`.
    Reorder {
        parent: String,
        child: String,
        before: Option<String>,
    },
}

impl WriteOp {
    /// Path the operation applies to (source path for moves).
    pub fn path(&self) -> &str {
        match self {
            WriteOp::AddNode { path, .. }
            | WriteOp::SetProperty { path, .. }
            | WriteOp::RemoveNode { path }
            | WriteOp::RemoveProperty { path } => path,
            WriteOp::Move { src, .. } => src,
            WriteOp::Reorder { parent, .. } => parent,
        }
    }
}

/// Ordered, in-memory log of staged operations.
#[derive(Debug, Clone, Default)]
pub struct WriteLog {
    ops: Vec<WriteOp>,
}

impl WriteLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Take every staged operation, leaving the log empty.
    pub fn drain(&mut self) -> Vec<WriteOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_keeps_order_and_drains() {
        let mut log = WriteLog::new();
        assert!(log.is_empty());

        log.push(WriteOp::Move { src: "/a".into(), dst: "/b".into() });
        log.push(WriteOp::RemoveNode { path: "/c".into() });
        log.push(WriteOp::SetProperty {
            path: "/b/x".into(),
            property: PropertySnapshot::single("x", Value::from("hello")),
        });
        assert_eq!(log.len(), 3);
        assert_eq!(log.ops()[0].path(), "/a");
        assert_eq!(log.ops()[2].path(), "/b/x");

        let ops = log.drain();
        assert_eq!(ops.len(), 3);
        assert!(log.is_empty());
        assert!(matches!(ops[1], WriteOp::RemoveNode { .. }));
    }

    #[test]
    fn test_snapshot_constructors() {
        let single = PropertySnapshot::single("n", Value::Long(3));
        assert_eq!(single.kind, PropertyType::Long);
        assert!(!single.multiple);

        let multi = PropertySnapshot::multiple(
            "tags",
            PropertyType::String,
            vec![Value::from("a"), Value::from("b")],
        );
        assert!(multi.multiple);
        assert_eq!(multi.values.len(), 2);
    }
}
