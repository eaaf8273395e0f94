//! Parses a `.dbg` (C64 debugger XML) document into a [`SymbolModel`].

use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{Error, Result};
use crate::symbol::{BlockEntry, Label, Segment, SourceRange, SymbolModel};

/// Parses the `.dbg` file at `path` into a [`SymbolModel`].
///
/// # Errors
///
/// Fails if the root element is missing, the version isn't `1.0`, a
/// `Sources`/`Segment`/`Labels` element's `values` attribute doesn't match
/// its expected column-header literal, a CSV row (read from the element's
/// text body, not from `values`) has the wrong column count, or the XML is
/// otherwise malformed.
pub fn load(path: &Path) -> Result<SymbolModel> {
    let text = std::fs::read_to_string(path).map_err(Error::from)?;
    parse(&text)
}

/// Literal `values` header asserted on `<Sources>`, checked once and never
/// used as row data — the CSV rows themselves live in the element's text.
const SOURCES_HEADER: &str = "INDEX,FILE";
/// Literal `values` header asserted on `<Segment>`; its `<Block>` children
/// share this column layout but carry no `values` attribute of their own.
const BLOCK_HEADER: &str = "START,END,FILE_IDX,LINE1,COL1,LINE2,COL2";
/// Literal `values` header asserted on `<Labels>`.
const LABELS_HEADER: &str = "SEGMENT,ADDRESS,NAME,FILE_IDX,LINE1,COL1,LINE2,COL2";

/// Parses `.dbg` document text directly (used by `load` and by tests).
pub fn parse(text: &str) -> Result<SymbolModel> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut model = SymbolModel::default();
    let mut saw_root = false;
    let mut buf = Vec::new();
    let mut pending_segment: Option<(String, Vec<(String, Vec<BlockEntry>)>)> = None;

    loop {
        match reader.read_event_into(&mut buf).map_err(|e| Error::Domain(format!("malformed .dbg: {e}")))? {
            Event::Eof => break,
            Event::Start(tag) => {
                let name = tag.name();
                let name = std::str::from_utf8(name.as_ref()).unwrap_or_default().to_string();
                let attrs = attrs_of(&tag)?;
                match name.as_str() {
                    "C64debugger" => {
                        saw_root = true;
                        let version = attrs.get("version").map(String::as_str).unwrap_or_default();
                        if version != "1.0" {
                            return Err(Error::Domain(format!("unsupported .dbg version: {version}")));
                        }
                    }
                    "Sources" => {
                        require_header(&attrs, SOURCES_HEADER)?;
                        let text = reader.read_text(tag.name()).map_err(|e| Error::Domain(format!("malformed .dbg: {e}")))?;
                        model.files = parse_sources(&split_rows(&text, 2)?)?;
                    }
                    "Segment" => {
                        require_header(&attrs, BLOCK_HEADER)?;
                        let seg_name = attrs.get("name").cloned().unwrap_or_default();
                        pending_segment = Some((seg_name, Vec::new()));
                    }
                    "Block" => {
                        let block_name = attrs.get("name").cloned().unwrap_or_default();
                        let text = reader.read_text(tag.name()).map_err(|e| Error::Domain(format!("malformed .dbg: {e}")))?;
                        let entries = parse_block_rows(&split_rows(&text, 7)?)?;
                        if let Some((_, blocks)) = pending_segment.as_mut() {
                            blocks.push((block_name, entries));
                        }
                    }
                    "Labels" => {
                        require_header(&attrs, LABELS_HEADER)?;
                        let text = reader.read_text(tag.name()).map_err(|e| Error::Domain(format!("malformed .dbg: {e}")))?;
                        model.labels = parse_label_rows(&split_rows(&text, 8)?)?;
                    }
                    _ => {}
                }
            }
            Event::Empty(tag) => {
                let name = tag.name();
                let name = std::str::from_utf8(name.as_ref()).unwrap_or_default().to_string();
                let attrs = attrs_of(&tag)?;
                match name.as_str() {
                    "C64debugger" => {
                        saw_root = true;
                        let version = attrs.get("version").map(String::as_str).unwrap_or_default();
                        if version != "1.0" {
                            return Err(Error::Domain(format!("unsupported .dbg version: {version}")));
                        }
                    }
                    "Sources" => {
                        require_header(&attrs, SOURCES_HEADER)?;
                        model.files = parse_sources(&[])?;
                    }
                    "Segment" => {
                        require_header(&attrs, BLOCK_HEADER)?;
                        let seg_name = attrs.get("name").cloned().unwrap_or_default();
                        model.segments.push(Segment::new(seg_name, Vec::new()));
                    }
                    "Block" => {
                        let block_name = attrs.get("name").cloned().unwrap_or_default();
                        if let Some((_, blocks)) = pending_segment.as_mut() {
                            blocks.push((block_name, Vec::new()));
                        }
                    }
                    "Labels" => {
                        require_header(&attrs, LABELS_HEADER)?;
                        model.labels = parse_label_rows(&[])?;
                    }
                    _ => {}
                }
            }
            Event::End(tag) => {
                let tag_name = tag.name();
                let name = std::str::from_utf8(tag_name.as_ref()).unwrap_or_default();
                if name == "Segment" {
                    if let Some((seg_name, blocks)) = pending_segment.take() {
                        model.segments.push(Segment::new(seg_name, blocks));
                    }
                }
            }
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(Error::Domain("missing C64debugger root element".into()));
    }

    Ok(model)
}

fn attrs_of(tag: &quick_xml::events::BytesStart) -> Result<std::collections::HashMap<String, String>> {
    let mut map = std::collections::HashMap::new();
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| Error::Domain(format!("malformed .dbg attribute: {e}")))?;
        let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or_default().to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Domain(format!("malformed .dbg attribute value: {e}")))?
            .into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

/// Asserts that the element's `values` attribute equals the literal,
/// expected column-header string (a one-time format check, not row data).
fn require_header(attrs: &std::collections::HashMap<String, String>, expected: &str) -> Result<()> {
    match attrs.get("values").map(String::as_str) {
        Some(values) if values == expected => Ok(()),
        Some(values) => Err(Error::Domain(format!("unsupported `values` header: expected `{expected}`, got `{values}`"))),
        None => Err(Error::Domain("missing `values` attribute".into())),
    }
}

/// Splits an element's text body into `width`-column CSV rows, skipping
/// blank lines.
fn split_rows(text: &str, width: usize) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<String> = line.split(',').map(str::trim).map(str::to_string).collect();
        if fields.len() != width {
            return Err(Error::Domain(format!("expected {width} columns, got {}: `{line}`", fields.len())));
        }
        rows.push(fields);
    }
    Ok(rows)
}

fn parse_addr(s: &str) -> Result<u32> {
    let hex = s.strip_prefix('$').ok_or_else(|| Error::Domain(format!("expected `$`-prefixed address: `{s}`")))?;
    if hex.is_empty() || hex.len() > 7 {
        return Err(Error::Domain(format!("invalid address literal: `{s}`")));
    }
    u32::from_str_radix(hex, 16).map_err(|e| Error::Domain(format!("invalid address literal `{s}`: {e}")))
}

fn parse_sources(rows: &[Vec<String>]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for row in rows {
        let idx: usize = row[0].parse().map_err(|e| Error::Domain(format!("bad source index: {e}")))?;
        if idx >= files.len() {
            files.resize(idx + 1, PathBuf::new());
        }
        files[idx] = PathBuf::from(&row[1]);
    }
    Ok(files)
}

fn parse_block_rows(rows: &[Vec<String>]) -> Result<Vec<BlockEntry>> {
    rows.iter()
        .map(|row| {
            Ok(BlockEntry {
                start: parse_addr(&row[0])?,
                end: parse_addr(&row[1])?,
                file_index: row[2].parse().map_err(|e| Error::Domain(format!("bad file index: {e}")))?,
                range: SourceRange {
                    line1: row[3].parse().unwrap_or_default(),
                    col1: row[4].parse().unwrap_or_default(),
                    line2: row[5].parse().unwrap_or_default(),
                    col2: row[6].parse().unwrap_or_default(),
                },
            })
        })
        .collect()
}

fn parse_label_rows(rows: &[Vec<String>]) -> Result<Vec<Label>> {
    rows.iter()
        .map(|row| {
            Ok(Label {
                segment: row[0].clone(),
                address: parse_addr(&row[1])?,
                name: row[2].clone(),
                file_index: row[3].parse().map_err(|e| Error::Domain(format!("bad file index: {e}")))?,
                range: SourceRange {
                    line1: row[4].parse().unwrap_or_default(),
                    col1: row[5].parse().unwrap_or_default(),
                    line2: row[6].parse().unwrap_or_default(),
                    col2: row[7].parse().unwrap_or_default(),
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<C64debugger version="1.0">
  <Sources values="INDEX,FILE">0,/tmp/main.asm</Sources>
  <Segment name="Code" values="START,END,FILE_IDX,LINE1,COL1,LINE2,COL2">
    <Block name="main">$2000,$2010,0,70,1,90,1</Block>
  </Segment>
  <Labels values="SEGMENT,ADDRESS,NAME,FILE_IDX,LINE1,COL1,LINE2,COL2">Code,$2000,start,0,70,1,70,5</Labels>
</C64debugger>"#;

    #[test]
    fn parses_minimal_document() {
        let model = parse(DOC).unwrap();
        assert_eq!(model.files, vec![PathBuf::from("/tmp/main.asm")]);
        assert_eq!(model.segments.len(), 1);
        assert_eq!(model.segments[0].blocks[0].entries[0].start, 0x2000);
        assert_eq!(model.labels[0].name, "start");
    }

    #[test]
    fn rejects_mismatched_header() {
        let doc = DOC.replace("INDEX,FILE", "INDEX_ONLY");
        let err = parse(&doc).unwrap_err();
        assert!(matches!(err, Error::Domain(_)));
    }

    #[test]
    fn rejects_wrong_version() {
        let err = parse(r#"<C64debugger version="2.0"></C64debugger>"#).unwrap_err();
        assert!(matches!(err, Error::Domain(_)));
    }

    #[test]
    fn rejects_missing_root() {
        let err = parse("<Foo/>").unwrap_err();
        assert!(matches!(err, Error::Domain(_)));
    }
}
