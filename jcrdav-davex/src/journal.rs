//! Event journal feed parsing.
//!
//! The journal is an Atom feed; each entry carries the events of one
//! persisted change set inside its content:
//!
//! ```xml
//! <entry>
//!   <author><name>admin</name></author>
//!   <content><dcr:events>
//!     <dcr:event>
//!       <dcr:href>http://host/server/default/jcr%3aroot/a/b</dcr:href>
//!       <dcr:eventtype><dcr:nodeadded/></dcr:eventtype>
//!       <dcr:eventdate>1331652655099</dcr:eventdate>
//!       ...
//!     </dcr:event>
//!   </dcr:events></content>
//! </entry>
//! ```

use chrono::{TimeZone, Utc};

use jcrdav_core::error::{Error, Result};
use jcrdav_core::{Event, EventType};

use crate::request::{decode, href_path, strip_base};
use crate::xml::{self, Element};

/// Parse a journal feed; hrefs are made relative to `encoded_root`, the
/// workspace root as the server spells it (`jcr%3aroot`).
pub(crate) fn parse_feed(feed: &str, encoded_root: &str) -> Result<Vec<Event>> {
    let dom = xml::parse(feed)?;
    if dom.local_name() != "feed" {
        return Err(Error::protocol(format!("expected an Atom feed, got {}", dom.name)));
    }

    let mut events = Vec::new();
    for entry in dom.children_named("entry") {
        let user_id = entry
            .child("author")
            .and_then(|author| author.child_text("name"))
            .and_then(non_empty);
        for item in entry.descendants("event") {
            let mut event = parse_event(item, encoded_root)?;
            event.user_id = user_id.clone();
            events.push(event);
        }
    }
    Ok(events)
}

fn parse_event(item: &Element, encoded_root: &str) -> Result<Event> {
    let type_name = item
        .child("eventtype")
        .and_then(|t| t.children.first())
        .map(|t| t.local_name())
        .ok_or_else(|| Error::protocol("journal event without type"))?;
    let kind = EventType::from_wire_name(type_name)
        .ok_or_else(|| Error::protocol(format!("unknown journal event type '{}'", type_name)))?;

    let mut event = Event::new(kind);
    event.path = item.child_text("href").map(|href| {
        let rest = strip_base(href, encoded_root).unwrap_or(href);
        href_path(&decode(rest))
    });
    event.date = item
        .child_text("eventdate")
        .and_then(|d| d.trim().parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single());
    event.user_data = item.child_text("eventuserdata").and_then(non_empty);
    event.identifier = item.child_text("eventidentifier").and_then(non_empty);
    event.primary_node_type = item.child_text("eventprimarynodetype").and_then(non_empty);
    event.mixin_node_types = item
        .children_named("eventmixinnodetype")
        .map(|m| m.text().to_string())
        .collect();
    if let Some(info) = item.child("eventinfo") {
        for entry in &info.children {
            event.info.insert(entry.local_name().to_string(), entry.text().to_string());
        }
    }
    Ok(event)
}

fn non_empty(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "http://localhost:8080/server/default/jcr%3aroot";

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>EventJournal for default</title>
  <entry>
    <title>operations: 2</title>
    <author><name>admin</name></author>
    <content type="application/vnd.apache.jackrabbit.event+xml">
      <dcr:events xmlns:dcr="http://www.day.com/jcr/webdav/1.0">
        <dcr:event>
          <dcr:href>http://localhost:8080/server/default/jcr%3aroot/a/new%20node</dcr:href>
          <dcr:eventtype><dcr:nodeadded/></dcr:eventtype>
          <dcr:eventdate>1331652655099</dcr:eventdate>
          <dcr:eventuserdata>import-42</dcr:eventuserdata>
          <dcr:eventprimarynodetype>nt:unstructured</dcr:eventprimarynodetype>
          <dcr:eventmixinnodetype>mix:referenceable</dcr:eventmixinnodetype>
          <dcr:eventidentifier>u1</dcr:eventidentifier>
        </dcr:event>
        <dcr:event>
          <dcr:href>http://localhost:8080/server/default/jcr%3aroot/b</dcr:href>
          <dcr:eventtype><dcr:nodemoved/></dcr:eventtype>
          <dcr:eventinfo><dcr:srcAbsPath>/a/b</dcr:srcAbsPath><dcr:destAbsPath>/b</dcr:destAbsPath></dcr:eventinfo>
        </dcr:event>
      </dcr:events>
    </content>
  </entry>
  <entry>
    <author><name>other</name></author>
    <content><dcr:events xmlns:dcr="http://www.day.com/jcr/webdav/1.0">
      <dcr:event><dcr:href>/server/default/jcr%3aroot/</dcr:href><dcr:eventtype><dcr:persist/></dcr:eventtype></dcr:event>
    </dcr:events></content>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_feed() {
        let events = parse_feed(FEED, ROOT).unwrap();
        assert_eq!(events.len(), 3);

        let added = &events[0];
        assert_eq!(added.kind, EventType::NodeAdded);
        assert_eq!(added.path.as_deref(), Some("/a/new node"));
        assert_eq!(added.user_id.as_deref(), Some("admin"));
        assert_eq!(added.user_data.as_deref(), Some("import-42"));
        assert_eq!(added.identifier.as_deref(), Some("u1"));
        assert_eq!(added.primary_node_type.as_deref(), Some("nt:unstructured"));
        assert_eq!(added.mixin_node_types, vec!["mix:referenceable"]);
        assert_eq!(added.date.unwrap().timestamp_millis(), 1331652655099);

        let moved = &events[1];
        assert_eq!(moved.kind, EventType::NodeMoved);
        assert_eq!(moved.info.get("srcAbsPath").map(String::as_str), Some("/a/b"));
        assert!(moved.date.is_none());

        let persist = &events[2];
        assert_eq!(persist.kind, EventType::Persist);
        assert_eq!(persist.path.as_deref(), Some("/"));
        assert_eq!(persist.user_id.as_deref(), Some("other"));
    }

    #[test]
    fn test_unknown_event_type_is_an_error() {
        let feed = r#"<feed><entry><content><events><event><eventtype><exploded/></eventtype></event></events></content></entry></feed>"#;
        assert!(parse_feed(feed, ROOT).is_err());
        assert!(parse_feed("<rss/>", ROOT).is_err());
    }
}
