// src/ingest/detail.rs
//! Reader for the per-entry detail documents (JMAXML `Report`).
//!
//! Only two fixed locations are read:
//! - area names: any `Area/Name` below `Report/Head`
//! - publishing office: `Report/Control/PublishingOffice`

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::ingest::atom::ParseFailure;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailInfo {
    /// Area names in document order, without duplicates.
    pub areas: Vec<String>,
    pub publishing_office: Option<String>,
}

fn is_area_name(path: &[String]) -> bool {
    path.len() >= 4
        && path[0] == "Report"
        && path[1] == "Head"
        && path[path.len() - 2] == "Area"
        && path[path.len() - 1] == "Name"
}

fn is_publishing_office(path: &[String]) -> bool {
    path.len() == 3 && path[0] == "Report" && path[1] == "Control" && path[2] == "PublishingOffice"
}

pub fn parse_detail(payload: &[u8]) -> Result<DetailInfo, ParseFailure> {
    let mut reader = Reader::from_reader(payload);
    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut out = DetailInfo::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let want_area = is_area_name(&path);
                let want_office = out.publishing_office.is_none() && is_publishing_office(&path);
                if want_area || want_office {
                    let text = t.unescape().map_err(|e| ParseFailure(e.to_string()))?;
                    let text = text.trim();
                    if want_area {
                        if !text.is_empty() && !out.areas.iter().any(|a| a == text) {
                            out.areas.push(text.to_string());
                        }
                    } else if !text.is_empty() {
                        out.publishing_office = Some(text.to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseFailure(e.to_string())),
        }
        buf.clear();
    }

    if path.first().is_some() {
        return Err(ParseFailure("unexpected end of detail document".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Report xmlns="http://xml.kishou.go.jp/jmaxml1/">
  <Control>
    <Title>気象警報・注意報</Title>
    <PublishingOffice>銚子地方気象台</PublishingOffice>
  </Control>
  <Head xmlns="http://xml.kishou.go.jp/jmaxml1/informationBasis1/">
    <Title>千葉県気象警報・注意報</Title>
    <Headline>
      <Information type="気象警報・注意報（府県予報区等）">
        <Item>
          <Areas codeType="気象・地震・火山情報／府県予報区等">
            <Area><Name>千葉県</Name><Code>120000</Code></Area>
          </Areas>
        </Item>
      </Information>
      <Information type="気象警報・注意報（市町村等）">
        <Item>
          <Areas codeType="気象・地震・火山情報／市町村等">
            <Area><Name>銚子市</Name></Area>
            <Area><Name>千葉県</Name></Area>
          </Areas>
        </Item>
      </Information>
    </Headline>
  </Head>
  <Body>
    <Warning><Item><Area><Name>ignored body area</Name></Area></Item></Warning>
  </Body>
</Report>"#;

    #[test]
    fn reads_head_areas_and_office() {
        let info = parse_detail(REPORT.as_bytes()).unwrap();
        assert_eq!(info.areas, vec!["千葉県".to_string(), "銚子市".to_string()]);
        assert_eq!(info.publishing_office.as_deref(), Some("銚子地方気象台"));
    }

    #[test]
    fn flat_head_area_path_is_accepted() {
        let xml = "<Report><Head><Area><Name>奈良県</Name></Area></Head></Report>";
        let info = parse_detail(xml.as_bytes()).unwrap();
        assert_eq!(info.areas, vec!["奈良県".to_string()]);
        assert_eq!(info.publishing_office, None);
    }

    #[test]
    fn truncated_document_fails() {
        assert!(parse_detail(b"<Report><Head><Area><Name>x").is_err());
    }
}
