// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Minimal element tree for the XML activity dialects.
//!
//! Element and attribute names are reduced to their lower-cased local part,
//! so `gpxtpx:hr`, `ns3:HR` and `hr` all compare equal.

use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, Default)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First direct child with the given local name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text of the first direct child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }

    /// Depth-first search for the first descendant with any of the names.
    pub fn find(&self, names: &[&str]) -> Option<&XmlNode> {
        for child in &self.children {
            if names.contains(&child.name.as_str()) {
                return Some(child);
            }
            if let Some(found) = child.find(names) {
                return Some(found);
            }
        }
        None
    }

    /// Numeric text of the first descendant with any of the names.
    pub fn find_f64(&self, names: &[&str]) -> Option<f64> {
        self.find(names)
            .and_then(|n| n.text.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    /// All descendants with the given name, in document order.
    pub fn descendants<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlNode>) {
        for child in &self.children {
            if child.name == name {
                out.push(child);
            }
            child.descendants(name, out);
        }
    }
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}

fn open_node(start: &BytesStart<'_>) -> XmlNode {
    let attrs = start
        .attributes()
        .flatten()
        .filter_map(|attr| {
            let key = local_name(attr.key.local_name().as_ref());
            let value = attr.unescape_value().ok()?.into_owned();
            Some((key, value))
        })
        .collect();
    XmlNode {
        name: local_name(start.local_name().as_ref()),
        attrs,
        text: String::new(),
        children: Vec::new(),
    }
}

/// Parse a whole document into a synthetic root node.
///
/// Unclosed elements at end of input are closed implicitly, so a truncated
/// upload still yields the points that were read.
pub fn parse_document(bytes: &[u8], format: &'static str) -> Result<XmlNode> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = vec![XmlNode::default()];
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| AppError::parse(format, format!("malformed XML: {}", e)))?;
        match event {
            Event::Start(start) => stack.push(open_node(&start)),
            Event::Empty(start) => {
                let node = open_node(&start);
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Event::End(_) => {
                if stack.len() > 1 {
                    if let Some(node) = stack.pop() {
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(node);
                        }
                    }
                }
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&text).into_owned());
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&value);
                }
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    while stack.len() > 1 {
        if let Some(node) = stack.pop() {
            if let Some(parent) = stack.last_mut() {
                parent.children.push(node);
            }
        }
    }
    stack
        .pop()
        .ok_or_else(|| AppError::parse(format, "empty document"))
}

/// Parse an XML timestamp.
///
/// Accepts RFC3339 and naive `YYYY-MM-DDTHH:MM:SS[.fff]`, which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_prefixes_are_stripped() {
        let doc = br#"<?xml version="1.0"?>
            <gpx xmlns:gpxtpx="x"><trk><trkpt lat="1.5" lon="2.5">
              <extensions><gpxtpx:TrackPointExtension><gpxtpx:hr>140</gpxtpx:hr>
              </gpxtpx:TrackPointExtension></extensions></trkpt></trk></gpx>"#;
        let root = parse_document(doc, "gpx").unwrap();
        let mut points = Vec::new();
        root.descendants("trkpt", &mut points);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].attr("lat"), Some("1.5"));
        assert_eq!(points[0].find_f64(&["hr"]), Some(140.0));
    }

    #[test]
    fn test_cdata_and_entities() {
        let doc = br#"<a><name><![CDATA[Morning & Ride]]></name><b>x &amp; y</b></a>"#;
        let root = parse_document(doc, "gpx").unwrap();
        let a = root.child("a").unwrap();
        assert_eq!(a.child_text("name"), Some("Morning & Ride"));
        assert_eq!(a.child_text("b"), Some("x & y"));
    }

    #[test]
    fn test_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-06-01T08:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-06-01T10:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-06-01T08:30:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
