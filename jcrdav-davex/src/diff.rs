//! Diff encoding of staged writes.
//!
//! A save is sent as one POST carrying a `:diff` of line-oriented change
//! instructions. Values that cannot travel inline as JSON (binaries,
//! references, dates, ...) become separate `multipart/form-data` parts named
//! by the property path, and the diff only marks their property with an
//! empty `^path : ` (or `^path : []`) line.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value as Json;

use jcrdav_core::error::{Error, Result};
use jcrdav_core::value::{PropertyType, Value};
use jcrdav_core::write_log::{PropertySnapshot, WriteOp};

/// A request body ready to be POSTed
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedSave {
    pub content_type: String,
    pub body: Bytes,
}

/// Turns a batch of staged operations into one request body
pub trait WriteEncoder: Send + Sync {
    /// `None` when there is nothing to send
    fn encode(&self, ops: &[WriteOp]) -> Result<Option<EncodedSave>>;
}

/// Encoder producing the Davex diff format
#[derive(Debug, Clone)]
pub struct DiffEncoder {
    boundary: Option<String>,
}

impl DiffEncoder {
    pub fn new() -> Self {
        Self { boundary: None }
    }

    /// Use a fixed multipart boundary instead of a random one
    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: Some(boundary.into()),
        }
    }
}

impl Default for DiffEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// One value sent outside the diff
#[derive(Debug, Clone, PartialEq)]
struct ValuePart {
    name: String,
    kind: PropertyType,
    data: Bytes,
}

#[derive(Debug, Default)]
struct DiffBuilder {
    lines: Vec<String>,
    parts: Vec<ValuePart>,
}

impl DiffBuilder {
    fn push(&mut self, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::AddNode { path, properties } => self.add_node(path, properties),
            WriteOp::SetProperty { path, property } => self.set_property(path, property),
            WriteOp::RemoveNode { path } | WriteOp::RemoveProperty { path } => {
                self.lines.push(format!("-{} : ", path));
                Ok(())
            }
            WriteOp::Move { src, dst } => {
                self.lines.push(format!(">{} : {}", src, dst));
                Ok(())
            }
            WriteOp::Reorder { parent, child, before } => {
                let target = child_path(parent, child);
                match before {
                    Some(before) => self.lines.push(format!(">{} : {}#before", target, before)),
                    None => self.lines.push(format!(">{} : #last", target)),
                }
                Ok(())
            }
        }
    }

    fn add_node(&mut self, path: &str, properties: &[PropertySnapshot]) -> Result<()> {
        let mut object = serde_json::Map::new();
        let mut deferred = Vec::new();

        // node creation properties go first
        for name in ["jcr:primaryType", "jcr:mixinTypes"] {
            if let Some(property) = properties.iter().find(|p| p.name == name) {
                object.insert(name.to_string(), inline_json(property)?);
            }
        }
        for property in properties {
            if property.name == "jcr:primaryType" || property.name == "jcr:mixinTypes" {
                continue;
            }
            if is_inline(property) {
                object.insert(property.name.clone(), inline_json(property)?);
            } else {
                deferred.push(property);
            }
        }

        self.lines
            .push(format!("+{} : {}", path, Json::Object(object)));
        for property in deferred {
            self.set_property(&child_path(path, &property.name), property)?;
        }
        Ok(())
    }

    fn set_property(&mut self, path: &str, property: &PropertySnapshot) -> Result<()> {
        if is_inline(property) {
            self.lines
                .push(format!("^{} : {}", path, inline_json(property)?));
            return Ok(());
        }

        for value in &property.values {
            let data = match value {
                Value::Binary(bytes) => bytes.clone(),
                other => Bytes::from(other.to_jcr_string()),
            };
            self.parts.push(ValuePart {
                name: path.to_string(),
                kind: property.kind,
                data,
            });
        }
        if property.multiple {
            self.lines.push(format!("^{} : []", path));
        } else {
            self.lines.push(format!("^{} : ", path));
        }
        Ok(())
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Whether the property's values travel inside the diff as JSON
fn is_inline(property: &PropertySnapshot) -> bool {
    match property.kind {
        PropertyType::String | PropertyType::Long | PropertyType::Double | PropertyType::Boolean => true,
        PropertyType::Name => property.name == "jcr:primaryType" || property.name == "jcr:mixinTypes",
        _ => false,
    }
}

fn inline_json(property: &PropertySnapshot) -> Result<Json> {
    if property.multiple {
        let values = property
            .values
            .iter()
            .map(value_json)
            .collect::<Result<Vec<_>>>()?;
        return Ok(Json::Array(values));
    }
    match property.values.first() {
        Some(value) => value_json(value),
        None => Err(Error::ValueFormat(format!(
            "single valued property '{}' has no value",
            property.name
        ))),
    }
}

fn value_json(value: &Value) -> Result<Json> {
    Ok(match value {
        Value::Long(v) => Json::from(*v),
        Value::Double(v) => serde_json::Number::from_f64(*v)
            .map(Json::Number)
            .ok_or_else(|| Error::ValueFormat(format!("cannot encode {} as JSON", v)))?,
        Value::Boolean(v) => Json::Bool(*v),
        other => Json::String(other.to_jcr_string()),
    })
}

fn write_part(body: &mut BytesMut, boundary: &str, part: &ValuePart) {
    body.put_slice(format!("--{}\r\n", boundary).as_bytes());
    if part.kind == PropertyType::Binary {
        body.put_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                part.name, part.name
            )
            .as_bytes(),
        );
    } else {
        body.put_slice(format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name).as_bytes());
    }
    body.put_slice(
        format!(
            "Content-Type: jcr-value/{}; charset=UTF-8\r\n",
            part.kind.name().to_lowercase()
        )
        .as_bytes(),
    );
    let encoding = if part.kind == PropertyType::Binary { "binary" } else { "8bit" };
    body.put_slice(format!("Content-Transfer-Encoding: {}\r\n\r\n", encoding).as_bytes());
    body.put_slice(&part.data);
    body.put_slice(b"\r\n");
}

impl WriteEncoder for DiffEncoder {
    fn encode(&self, ops: &[WriteOp]) -> Result<Option<EncodedSave>> {
        if ops.is_empty() {
            return Ok(None);
        }

        let mut builder = DiffBuilder::default();
        for op in ops {
            builder.push(op)?;
        }
        let diff = builder.lines.join("\r");

        if builder.parts.is_empty() {
            let body = format!("{}={}", urlencoding::encode(":diff"), urlencoding::encode(&diff));
            return Ok(Some(EncodedSave {
                content_type: "application/x-www-form-urlencoded; charset=utf-8".to_string(),
                body: Bytes::from(body),
            }));
        }

        let boundary = self
            .boundary
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let mut body = BytesMut::new();
        for part in &builder.parts {
            write_part(&mut body, &boundary, part);
        }
        body.put_slice(format!("--{}\r\n", boundary).as_bytes());
        body.put_slice(b"Content-Disposition: form-data; name=\":diff\"\r\n");
        body.put_slice(b"Content-Type: text/plain; charset=UTF-8\r\n");
        body.put_slice(b"Content-Transfer-Encoding: 8bit\r\n\r\n");
        body.put_slice(diff.as_bytes());
        body.put_slice(b"\r\n");
        body.put_slice(format!("--{}--\r\n\r\n", boundary).as_bytes());

        Ok(Some(EncodedSave {
            content_type: format!("multipart/form-data; boundary={}", boundary),
            body: body.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn diff_of(ops: &[WriteOp]) -> String {
        let encoded = DiffEncoder::new().encode(ops).unwrap().unwrap();
        assert!(encoded.content_type.starts_with("application/x-www-form-urlencoded"));
        let body = String::from_utf8(encoded.body.to_vec()).unwrap();
        let value = body.strip_prefix("%3Adiff=").unwrap();
        urlencoding::decode(value).unwrap().into_owned()
    }

    #[test]
    fn test_empty_log_encodes_nothing() {
        assert!(DiffEncoder::new().encode(&[]).unwrap().is_none());
    }

    #[test]
    fn test_set_string_property() {
        let ops = vec![WriteOp::SetProperty {
            path: "/a/x".to_string(),
            property: PropertySnapshot::single("x", Value::from("hello")),
        }];
        assert_eq!(diff_of(&ops), "^/a/x : \"hello\"");
    }

    #[test]
    fn test_line_grammar() {
        let ops = vec![
            WriteOp::Move {
                src: "/a/b".to_string(),
                dst: "/c/b".to_string(),
            },
            WriteOp::RemoveNode { path: "/old".to_string() },
            WriteOp::RemoveProperty { path: "/a/p".to_string() },
            WriteOp::Reorder {
                parent: "/a".to_string(),
                child: "z".to_string(),
                before: Some("x".to_string()),
            },
            WriteOp::Reorder {
                parent: "/".to_string(),
                child: "a".to_string(),
                before: None,
            },
            WriteOp::SetProperty {
                path: "/a/n".to_string(),
                property: PropertySnapshot::multiple(
                    "n",
                    PropertyType::Long,
                    vec![Value::Long(1), Value::Long(2)],
                ),
            },
        ];
        let expected = [
            ">/a/b : /c/b",
            "-/old : ",
            "-/a/p : ",
            ">/a/z : x#before",
            ">/a : #last",
            "^/a/n : [1,2]",
        ]
        .join("\r");
        assert_eq!(diff_of(&ops), expected);
    }

    #[test]
    fn test_add_node_puts_creation_properties_first() {
        let ops = vec![WriteOp::AddNode {
            path: "/a/c".to_string(),
            properties: vec![
                PropertySnapshot::single("title", Value::from("T")),
                PropertySnapshot::multiple(
                    "jcr:mixinTypes",
                    PropertyType::Name,
                    vec![Value::Name("mix:referenceable".to_string())],
                ),
                PropertySnapshot::single("jcr:primaryType", Value::Name("nt:unstructured".to_string())),
                PropertySnapshot::single("flag", Value::Boolean(true)),
            ],
        }];
        assert_eq!(
            diff_of(&ops),
            r#"+/a/c : {"jcr:primaryType":"nt:unstructured","jcr:mixinTypes":["mix:referenceable"],"title":"T","flag":true}"#
        );
    }

    #[test]
    fn test_excluded_values_become_parts() {
        let date = DateTime::parse_from_rfc3339("2011-04-21T14:34:20.431+01:00").unwrap();
        let ops = vec![
            WriteOp::AddNode {
                path: "/n".to_string(),
                properties: vec![
                    PropertySnapshot::single("jcr:primaryType", Value::Name("nt:unstructured".to_string())),
                    PropertySnapshot::single("when", Value::Date(date)),
                ],
            },
            WriteOp::SetProperty {
                path: "/n/data".to_string(),
                property: PropertySnapshot::multiple(
                    "data",
                    PropertyType::Binary,
                    vec![Value::from(b"ab".to_vec()), Value::from(b"cd".to_vec())],
                ),
            },
        ];
        let encoded = DiffEncoder::with_boundary("XYZ").encode(&ops).unwrap().unwrap();
        assert_eq!(encoded.content_type, "multipart/form-data; boundary=XYZ");

        let body = String::from_utf8(encoded.body.to_vec()).unwrap();
        let expected = concat!(
            "--XYZ\r\n",
            "Content-Disposition: form-data; name=\"/n/when\"\r\n",
            "Content-Type: jcr-value/date; charset=UTF-8\r\n",
            "Content-Transfer-Encoding: 8bit\r\n\r\n",
            "2011-04-21T14:34:20.431+01:00\r\n",
            "--XYZ\r\n",
            "Content-Disposition: form-data; name=\"/n/data\"; filename=\"/n/data\"\r\n",
            "Content-Type: jcr-value/binary; charset=UTF-8\r\n",
            "Content-Transfer-Encoding: binary\r\n\r\n",
            "ab\r\n",
            "--XYZ\r\n",
            "Content-Disposition: form-data; name=\"/n/data\"; filename=\"/n/data\"\r\n",
            "Content-Type: jcr-value/binary; charset=UTF-8\r\n",
            "Content-Transfer-Encoding: binary\r\n\r\n",
            "cd\r\n",
            "--XYZ\r\n",
            "Content-Disposition: form-data; name=\":diff\"\r\n",
            "Content-Type: text/plain; charset=UTF-8\r\n",
            "Content-Transfer-Encoding: 8bit\r\n\r\n",
            "+/n : {\"jcr:primaryType\":\"nt:unstructured\"}\r^/n/when : \r^/n/data : []\r\n",
            "--XYZ--\r\n\r\n",
        );
        assert_eq!(body, expected);
    }

    #[test]
    fn test_name_and_reference_are_excluded() {
        let ops = vec![
            WriteOp::SetProperty {
                path: "/a/kind".to_string(),
                property: PropertySnapshot::single("kind", Value::Name("nt:file".to_string())),
            },
            WriteOp::SetProperty {
                path: "/a/ref".to_string(),
                property: PropertySnapshot::single("ref", Value::Reference("u1".to_string())),
            },
        ];
        let encoded = DiffEncoder::with_boundary("B").encode(&ops).unwrap().unwrap();
        let body = String::from_utf8(encoded.body.to_vec()).unwrap();
        assert!(body.contains("Content-Type: jcr-value/name; charset=UTF-8\r\nContent-Transfer-Encoding: 8bit\r\n\r\nnt:file\r\n"));
        assert!(body.contains("Content-Type: jcr-value/reference; charset=UTF-8"));
        assert!(body.contains("^/a/kind : \r^/a/ref : \r\n"));
    }

    #[test]
    fn test_non_finite_double_is_rejected() {
        let ops = vec![WriteOp::SetProperty {
            path: "/a/d".to_string(),
            property: PropertySnapshot::single("d", Value::Double(f64::NAN)),
        }];
        assert!(DiffEncoder::new().encode(&ops).is_err());
    }
}
