//! Binary property reads.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;

use jcrdav_core::error::{Error, Result};
use jcrdav_core::BinarySource;

use crate::request::{encode_path, Connection, DavRequest, Reply};

/// Serves a workspace's binaries out of band, for deferred streams
#[derive(Debug, Clone)]
pub struct DavexBinaries {
    connection: Connection,
    workspace_root: String,
}

impl DavexBinaries {
    pub(crate) fn new(connection: Connection, workspace_root: String) -> Self {
        Self {
            connection,
            workspace_root,
        }
    }
}

#[async_trait]
impl BinarySource for DavexBinaries {
    async fn fetch(&self, path: &str) -> Result<Vec<Bytes>> {
        let url = format!("{}{}", self.workspace_root, encode_path(path));
        fetch_binary(&self.connection, url).await
    }
}

pub(crate) async fn fetch_binary(connection: &Connection, url: String) -> Result<Vec<Bytes>> {
    let reply = connection.send(DavRequest::new("GET", url)).await?;
    decode_binary(&reply)
}

/// Split a binary answer into its values
pub(crate) fn decode_binary(reply: &Reply) -> Result<Vec<Bytes>> {
    let content_type = reply.content_type.as_deref().unwrap_or_default();
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "jcr-value/binary" => Ok(vec![reply.body.clone()]),
        "text/xml" => {
            let dom = reply.dom()?;
            if dom.local_name() != "values" {
                return Err(Error::protocol(format!(
                    "expected dcr:values in binary answer, got {}",
                    dom.name
                )));
            }
            dom.children_named("value")
                .map(|value| {
                    let packed: String = value.text().chars().filter(|c| !c.is_whitespace()).collect();
                    base64::engine::general_purpose::STANDARD
                        .decode(packed)
                        .map(Bytes::from)
                        .map_err(|e| Error::protocol(format!("invalid base64 binary value: {}", e)))
                })
                .collect()
        }
        _ => Err(Error::protocol(format!(
            "unexpected content type '{}' for binary value",
            content_type
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(content_type: &str, body: &str) -> Reply {
        Reply {
            status: 200,
            content_type: Some(content_type.to_string()),
            location: None,
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn test_single_value() {
        let values = decode_binary(&reply("jcr-value/binary; charset=utf-8", "hello")).unwrap();
        assert_eq!(values, vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn test_multi_value_list() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<dcr:values xmlns:dcr="http://www.day.com/jcr/webdav/1.0">
  <dcr:value dcr:type="Binary">b25l</dcr:value>
  <dcr:value dcr:type="Binary">dGhy
ZWU=</dcr:value>
</dcr:values>"#;
        let values = decode_binary(&reply("text/xml; charset=utf-8", body)).unwrap();
        assert_eq!(values, vec![Bytes::from_static(b"one"), Bytes::from_static(b"three")]);
    }

    #[test]
    fn test_unknown_content_type() {
        let err = decode_binary(&reply("application/json", "{}")).unwrap_err();
        assert_eq!(err.kind(), jcrdav_core::ErrorKind::Protocol);
    }
}
