//! Davex XML parsing and generation utilities
//!
//! Responses are read into a small element tree matched on local names, so
//! `D:href` and `href` are the same element. Request bodies are written with
//! the quick-xml element writer.

use quick_xml::events::{BytesCData, BytesDecl, BytesStart, BytesText, Event};
use quick_xml::writer::Writer;
use std::io::Cursor;

use jcrdav_core::query::{Query, QueryLanguage};
use jcrdav_core::transport::LockRequest;

/// WebDAV XML namespace
pub const DAV_NS: &str = "DAV:";

/// Repository (dcr) XML namespace
pub const DCR_NS: &str = "http://www.day.com/jcr/webdav/1.0";

/// Errors raised while reading or writing XML bodies
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),

    #[error("XML serialization error: {0}")]
    Serialization(String),

    #[error("Invalid XML structure: {0}")]
    InvalidStructure(String),
}

impl From<XmlError> for jcrdav_core::Error {
    fn from(e: XmlError) -> Self {
        jcrdav_core::Error::Xml(e.to_string())
    }
}

/// One parsed XML element
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    /// Qualified name as sent, e.g. `D:href`
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, XmlError> {
        let mut element = Element {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            ..Default::default()
        };
        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Parse(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| XmlError::Parse(e.to_string()))?
                .into_owned();
            element.attributes.push((key, value));
        }
        Ok(element)
    }

    /// Name without namespace prefix
    pub fn local_name(&self) -> &str {
        local(&self.name)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Attribute value by local name
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| local(k) == name)
            .map(|(_, v)| v.as_str())
    }

    /// First direct child named `name`
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.local_name() == name)
    }

    /// Direct children named `name`
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.local_name() == name)
    }

    /// Text of the first direct child named `name`
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(Element::text)
    }

    /// Every element named `name` below this one, in document order
    pub fn descendants(&self, name: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        self.collect(name, &mut found);
        found
    }

    /// First element named `name` below this one
    pub fn find(&self, name: &str) -> Option<&Element> {
        for child in &self.children {
            if child.local_name() == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    fn collect<'a>(&'a self, name: &str, found: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.local_name() == name {
                found.push(child);
            }
            child.collect(name, found);
        }
    }
}

fn local(name: &str) -> &str {
    name.split_once(':').map_or(name, |(_, l)| l)
}

/// Parse a complete XML document into its root element
pub fn parse(xml: &str) -> Result<Element, XmlError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => stack.push(Element::from_start(e)?),
            Ok(Event::Empty(ref e)) => {
                let element = Element::from_start(e)?;
                attach(&mut stack, &mut root, element);
            }
            Ok(Event::End(_)) => {
                if let Some(element) = stack.pop() {
                    attach(&mut stack, &mut root, element);
                }
            }
            Ok(Event::Text(ref t)) => {
                if let Some(top) = stack.last_mut() {
                    let text = t.unescape().map_err(|e| XmlError::Parse(e.to_string()))?;
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(ref t)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(t));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(XmlError::Parse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(XmlError::InvalidStructure("unclosed element".to_string()));
    }
    root.ok_or_else(|| XmlError::InvalidStructure("empty document".to_string()))
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn document<F>(build: F) -> Result<String, XmlError>
where
    F: FnOnce(&mut XmlWriter) -> std::io::Result<()>,
{
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| XmlError::Serialization(e.to_string()))?;
    build(&mut writer).map_err(|e| XmlError::Serialization(e.to_string()))?;
    Ok(String::from_utf8_lossy(writer.into_inner().get_ref()).to_string())
}

/// PROPFIND body asking for a single property
pub fn propfind(property: &str) -> Result<String, XmlError> {
    document(|w| {
        w.create_element("D:propfind")
            .with_attributes([("xmlns:D", DAV_NS), ("xmlns:dcr", DCR_NS)])
            .write_inner_content(|w| {
                w.create_element("D:prop").write_inner_content(|w| {
                    w.create_element(property).write_empty()?;
                    Ok::<(), std::io::Error>(())
                })?;
                Ok::<(), std::io::Error>(())
            })?;
        Ok(())
    })
}

/// REPORT body consisting of one empty dcr element
pub fn empty_report(name: &str) -> Result<String, XmlError> {
    document(|w| {
        w.create_element(format!("dcr:{}", name))
            .with_attribute(("xmlns:dcr", DCR_NS))
            .write_empty()?;
        Ok(())
    })
}

/// REPORT body wrapping one `D:href`, used by uuid lookups and privileges
pub fn href_report(name: &str, href: &str) -> Result<String, XmlError> {
    document(|w| {
        w.create_element(format!("dcr:{}", name))
            .with_attribute(("xmlns:dcr", DCR_NS))
            .write_inner_content(|w| {
                w.create_element("D:href")
                    .with_attribute(("xmlns:D", DAV_NS))
                    .write_text_content(BytesText::new(href))?;
                Ok::<(), std::io::Error>(())
            })?;
        Ok(())
    })
}

/// Node type REPORT body; empty `names` asks for all types
pub fn node_types_report(names: &[String]) -> Result<String, XmlError> {
    document(|w| {
        w.create_element("jcr:nodetypes")
            .with_attribute(("xmlns:jcr", DCR_NS))
            .write_inner_content(|w| {
                if names.is_empty() {
                    w.create_element("jcr:all-nodetypes").write_empty()?;
                }
                for name in names {
                    w.create_element("jcr:nodetype").write_inner_content(|w| {
                        w.create_element("jcr:nodetypename")
                            .write_text_content(BytesText::new(name))?;
                        Ok::<(), std::io::Error>(())
                    })?;
                }
                Ok::<(), std::io::Error>(())
            })?;
        Ok(())
    })
}

fn property_update<F>(build: F) -> Result<String, XmlError>
where
    F: FnOnce(&mut XmlWriter) -> std::io::Result<()>,
{
    document(|w| {
        w.create_element("D:propertyupdate")
            .with_attribute(("xmlns:D", DAV_NS))
            .write_inner_content(|w| {
                w.create_element("D:set").write_inner_content(|w| {
                    w.create_element("D:prop").write_inner_content(build)?;
                    Ok::<(), std::io::Error>(())
                })?;
                Ok::<(), std::io::Error>(())
            })?;
        Ok(())
    })
}

/// PROPPATCH body carrying the complete namespace table
pub fn register_namespaces<'a, I>(namespaces: I) -> Result<String, XmlError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    property_update(|w| {
        w.create_element("dcr:namespaces")
            .with_attribute(("xmlns:dcr", DCR_NS))
            .write_inner_content(|w| {
                for (prefix, uri) in namespaces {
                    w.create_element("dcr:namespace").write_inner_content(|w| {
                        w.create_element("dcr:prefix")
                            .write_text_content(BytesText::new(prefix))?;
                        w.create_element("dcr:uri").write_text_content(BytesText::new(uri))?;
                        Ok::<(), std::io::Error>(())
                    })?;
                }
                Ok::<(), std::io::Error>(())
            })?;
        Ok(())
    })
}

/// PROPPATCH body registering node types from CND text
pub fn register_cnd(cnd: &str, allow_update: bool) -> Result<String, XmlError> {
    property_update(|w| {
        w.create_element("dcr:nodetypes-cnd")
            .with_attribute(("xmlns:dcr", DCR_NS))
            .write_inner_content(|w| {
                w.create_element("dcr:cnd").write_text_content(BytesText::new(cnd))?;
                w.create_element("dcr:allowupdate")
                    .write_text_content(BytesText::new(if allow_update { "true" } else { "false" }))?;
                Ok::<(), std::io::Error>(())
            })?;
        Ok(())
    })
}

/// LOCK body
pub fn lock_info(request: &LockRequest, owner: &str) -> Result<String, XmlError> {
    document(|w| {
        w.create_element("D:lockinfo")
            .with_attribute(("xmlns:D", DAV_NS))
            .write_inner_content(|w| {
                w.create_element("D:lockscope").write_inner_content(|w| {
                    if request.session_scoped {
                        w.create_element("dcr:exclusive-session-scoped")
                            .with_attribute(("xmlns:dcr", DCR_NS))
                            .write_empty()?;
                    } else {
                        w.create_element("D:exclusive").write_empty()?;
                    }
                    Ok::<(), std::io::Error>(())
                })?;
                w.create_element("D:locktype").write_inner_content(|w| {
                    w.create_element("D:write").write_empty()?;
                    Ok::<(), std::io::Error>(())
                })?;
                w.create_element("D:owner").write_text_content(BytesText::new(owner))?;
                Ok::<(), std::io::Error>(())
            })?;
        Ok(())
    })
}

/// UPDATE body restoring a version
pub fn restore(version_href: &str, remove_existing: bool) -> Result<String, XmlError> {
    document(|w| {
        w.create_element("D:update")
            .with_attribute(("xmlns:D", DAV_NS))
            .write_inner_content(|w| {
                w.create_element("D:version").write_inner_content(|w| {
                    w.create_element("D:href")
                        .write_text_content(BytesText::new(version_href))?;
                    Ok::<(), std::io::Error>(())
                })?;
                if remove_existing {
                    w.create_element("dcr:removeexisting")
                        .with_attribute(("xmlns:dcr", DCR_NS))
                        .write_empty()?;
                }
                Ok::<(), std::io::Error>(())
            })?;
        Ok(())
    })
}

/// SEARCH body for a query
pub fn search_request(query: &Query) -> Result<String, XmlError> {
    let language = match query.language() {
        QueryLanguage::XPath => "dcr:xpath",
        QueryLanguage::Sql => "dcr:sql",
        QueryLanguage::JcrSql2 | QueryLanguage::JcrJqom => "JCR-SQL2",
    };
    document(|w| {
        w.create_element("D:searchrequest")
            .with_attributes([("xmlns:D", DAV_NS), ("xmlns:dcr", DCR_NS)])
            .write_inner_content(|w| {
                w.create_element(language)
                    .write_cdata_content(BytesCData::new(query.statement()))?;
                if query.limit().is_some() || query.offset().is_some() {
                    w.create_element("D:limit").write_inner_content(|w| {
                        if let Some(limit) = query.limit() {
                            w.create_element("D:nresults")
                                .write_text_content(BytesText::new(&limit.to_string()))?;
                        }
                        if let Some(offset) = query.offset() {
                            w.create_element("offset")
                                .write_text_content(BytesText::new(&offset.to_string()))?;
                        }
                        Ok::<(), std::io::Error>(())
                    })?;
                }
                Ok::<(), std::io::Error>(())
            })?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matches_local_names() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>http://localhost/a%20b/</D:href>
    <D:propstat><D:status>HTTP/1.1 200 OK</D:status></D:propstat>
  </D:response>
  <response><href>/second</href></response>
</D:multistatus>"#;
        let root = parse(xml).unwrap();
        assert_eq!(root.local_name(), "multistatus");
        let hrefs: Vec<&str> = root.descendants("href").iter().map(|e| e.text()).collect();
        assert_eq!(hrefs, vec!["http://localhost/a%20b/", "/second"]);
        assert_eq!(root.find("status").unwrap().text(), "HTTP/1.1 200 OK");
        assert_eq!(root.children_named("response").count(), 2);
    }

    #[test]
    fn test_parse_attributes_entities_and_cdata() {
        let xml = r#"<nodeTypes><nodeType name="nt:file" isMixin="false">
<supertypes><supertype>nt:hierarchyNode</supertype></supertypes>
<note>a &amp; b</note><raw><![CDATA[<x>]]></raw></nodeType></nodeTypes>"#;
        let root = parse(xml).unwrap();
        let node_type = root.child("nodeType").unwrap();
        assert_eq!(node_type.attribute("name"), Some("nt:file"));
        assert_eq!(node_type.attribute("isMixin"), Some("false"));
        assert_eq!(node_type.find("supertype").unwrap().text(), "nt:hierarchyNode");
        assert_eq!(node_type.child_text("note"), Some("a & b"));
        assert_eq!(node_type.child_text("raw"), Some("<x>"));
    }

    #[test]
    fn test_parse_rejects_broken_documents() {
        assert!(parse("").is_err());
        assert!(parse("<a><b></a>").is_err());
    }

    #[test]
    fn test_search_request_with_limit() {
        let mut query = Query::new("SELECT * FROM [nt:base]", QueryLanguage::JcrSql2);
        query.set_limit(10);
        query.set_offset(5);
        let body = search_request(&query).unwrap();
        assert!(body.contains("<JCR-SQL2><![CDATA[SELECT * FROM [nt:base]]]></JCR-SQL2>"));
        assert!(body.contains("<D:limit><D:nresults>10</D:nresults><offset>5</offset></D:limit>"));

        let xpath = Query::new("//*", QueryLanguage::XPath);
        let body = search_request(&xpath).unwrap();
        assert!(body.contains("<dcr:xpath><![CDATA[//*]]></dcr:xpath>"));
        assert!(!body.contains("D:limit"));
    }

    #[test]
    fn test_lock_info_scopes() {
        let request = LockRequest {
            deep: false,
            session_scoped: true,
            timeout: None,
            owner: None,
        };
        let body = lock_info(&request, "admin").unwrap();
        assert!(body.contains("<dcr:exclusive-session-scoped"));
        assert!(body.contains("<D:owner>admin</D:owner>"));

        let open = LockRequest {
            session_scoped: false,
            ..request
        };
        assert!(lock_info(&open, "x").unwrap().contains("<D:exclusive/>"));
    }

    #[test]
    fn test_bodies_escape_text() {
        let body = register_cnd("<ns = 'http://x'>", true).unwrap();
        assert!(body.contains("<dcr:cnd>&lt;ns = "));
        assert!(!body.contains("<ns"));
        assert!(body.contains("<dcr:allowupdate>true</dcr:allowupdate>"));

        let body = restore("http://h/v", true).unwrap();
        assert!(body.contains("<D:version><D:href>http://h/v</D:href></D:version>"));
        assert!(body.contains("<dcr:removeexisting"));
    }
}
