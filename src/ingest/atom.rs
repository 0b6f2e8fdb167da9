// src/ingest/atom.rs
use metrics::{counter, histogram};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use std::fmt;

use crate::ingest::types::{FeedMeta, ParsedEntry, ParsedFeed};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure(pub String);

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feed parse failure: {}", self.0)
    }
}

impl std::error::Error for ParseFailure {}

// --- wire shapes (Atom, plus RSS-style pubDate some publishers mix in) ---

#[derive(Debug, Default, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    title: Option<Text>,
    subtitle: Option<Text>,
    updated: Option<Text>,
    id: Option<Text>,
    rights: Option<Text>,
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<Text>,
    id: Option<Text>,
    updated: Option<Text>,
    published: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<Text>,
    author: Option<Author>,
    #[serde(rename = "link", default)]
    links: Vec<Link>,
    content: Option<Text>,
}

#[derive(Debug, Deserialize)]
struct Author {
    name: Option<Text>,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
    #[serde(rename = "$text", default)]
    text: String,
}

fn clean(t: Option<Text>) -> Option<String> {
    t.map(|t| t.value.trim().to_string()).filter(|s| !s.is_empty())
}

fn pick_link(links: Vec<Link>) -> Option<String> {
    let mut alternate = None;
    let mut first = None;
    for l in links {
        let target = l
            .href
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .or_else(|| Some(l.text.trim().to_string()).filter(|t| !t.is_empty()));
        let Some(target) = target else { continue };
        let is_alt = l.rel.as_deref().map_or(true, |r| r == "alternate");
        if is_alt && alternate.is_none() {
            alternate = Some(target);
        } else if first.is_none() {
            first = Some(target);
        }
    }
    alternate.or(first)
}

/// Local name of the document's root element, if any.
fn root_element(xml: &str) -> Result<String, ParseFailure> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Ok(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Eof) => return Err(ParseFailure("empty document".into())),
            Ok(_) => {}
            Err(e) => return Err(ParseFailure(e.to_string())),
        }
    }
}

/// Parse an Atom document into feed metadata and raw entries.
///
/// Entries without an `<id>` fall back to their link as identity; entries with
/// neither are dropped because they cannot be stored idempotently.
pub fn parse(payload: &[u8]) -> Result<ParsedFeed, ParseFailure> {
    let t0 = std::time::Instant::now();
    let out = parse_inner(payload);
    histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
    if out.is_err() {
        counter!("ingest_parse_failures_total").increment(1);
    }
    out
}

fn parse_inner(payload: &[u8]) -> Result<ParsedFeed, ParseFailure> {
    let xml = std::str::from_utf8(payload).map_err(|e| ParseFailure(format!("not utf-8: {e}")))?;
    let root = root_element(xml)?;
    if root != "feed" {
        return Err(ParseFailure(format!("root element <{root}> is not an Atom feed")));
    }
    let feed: AtomFeed =
        quick_xml::de::from_str(xml).map_err(|e| ParseFailure(e.to_string()))?;

    let meta = FeedMeta {
        title: clean(feed.title),
        subtitle: clean(feed.subtitle),
        updated: clean(feed.updated),
        atom_id: clean(feed.id),
        rights: clean(feed.rights),
    };

    let mut entries = Vec::with_capacity(feed.entries.len());
    for e in feed.entries {
        let link = pick_link(e.links);
        let Some(entry_id) = clean(e.id).or_else(|| link.clone()) else {
            tracing::debug!(target: "ingest", title = ?e.title.as_ref().map(|t| &t.value), "entry without id or link dropped");
            continue;
        };
        entries.push(ParsedEntry {
            entry_id,
            title: clean(e.title),
            link,
            updated: clean(e.updated)
                .or_else(|| clean(e.published))
                .or_else(|| clean(e.pub_date)),
            content: clean(e.content),
            author: e.author.and_then(|a| clean(a.name)),
        });
    }
    counter!("ingest_events_total").increment(entries.len() as u64);

    Ok(ParsedFeed { meta, entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" lang="ja">
  <title>高頻度（随時）</title>
  <subtitle>JMAXML publishing feed</subtitle>
  <updated>2025-09-06T09:00:00+09:00</updated>
  <id>urn:uuid:feed-extra</id>
  <link href="https://www.jma.go.jp/" rel="related"/>
  <rights type="html">&lt;a href="https://www.jma.go.jp/jma/kishou/info/coment.html"&gt;利用規約&lt;/a&gt;</rights>
  <entry>
    <title>気象警報・注意報</title>
    <id>https://www.data.jma.go.jp/developer/xml/data/a.xml</id>
    <updated>2025-09-06T08:55:00Z</updated>
    <author><name>東京管区気象台</name></author>
    <link type="application/xml" href="https://www.data.jma.go.jp/developer/xml/data/a.xml"/>
    <content type="text">【東京都気象警報・注意報】大雨警報を発表しています。</content>
  </entry>
  <entry>
    <title>気象特別警報・警報・注意報</title>
    <id>urn:entry:b</id>
    <published>2025-09-06T08:50:00Z</published>
    <content type="text">注意報を解除します。</content>
  </entry>
</feed>"#;

    #[test]
    fn extracts_feed_meta_and_entries() {
        let parsed = parse(FEED.as_bytes()).expect("parse ok");
        assert_eq!(parsed.meta.title.as_deref(), Some("高頻度（随時）"));
        assert_eq!(parsed.meta.atom_id.as_deref(), Some("urn:uuid:feed-extra"));
        assert!(parsed.meta.rights.unwrap().contains("利用規約"));
        assert_eq!(parsed.entries.len(), 2);

        let a = &parsed.entries[0];
        assert_eq!(a.author.as_deref(), Some("東京管区気象台"));
        assert_eq!(a.updated.as_deref(), Some("2025-09-06T08:55:00Z"));
        assert_eq!(
            a.link.as_deref(),
            Some("https://www.data.jma.go.jp/developer/xml/data/a.xml")
        );
        assert!(a.content.as_deref().unwrap().contains("東京都"));
    }

    #[test]
    fn updated_falls_back_to_published() {
        let parsed = parse(FEED.as_bytes()).unwrap();
        let b = &parsed.entries[1];
        assert_eq!(b.updated.as_deref(), Some("2025-09-06T08:50:00Z"));
        assert_eq!(b.author, None);
        assert_eq!(b.link, None);
    }

    #[test]
    fn malformed_document_is_a_failure() {
        assert!(parse(b"<feed><entry><title>x</entry></feed>").is_err());
        assert!(parse(b"").is_err());
        assert!(parse(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn non_atom_root_is_a_failure() {
        let rss = r#"<rss version="2.0"><channel><title>x</title></channel></rss>"#;
        let err = parse(rss.as_bytes()).unwrap_err();
        assert!(err.0.contains("rss"));
    }

    #[test]
    fn empty_feed_has_no_entries() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>Empty</title><id>urn:x</id></feed>"#;
        let parsed = parse(xml.as_bytes()).unwrap();
        assert!(parsed.entries.is_empty());
        assert_eq!(parsed.meta.subtitle, None);
    }
}
