use anyhow::{Context, Result};
use quick_xml::escape::unescape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::fs;
use std::path::Path;

use crate::error::ParseError;

/// A program file element: name, attributes, direct text and child elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn push(&mut self, child: Element) -> &mut Element {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub fn push_text(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.children.push(Element::with_text(name, text));
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// First direct child with this name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Trimmed text of a direct child, `None` when missing or blank.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.trim()).filter(|t| !t.is_empty())
    }

    /// First descendant (depth-first, document order) with this name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.find_where(&|e: &Element| e.name == name)
    }

    /// First descendant, in document order, accepted by `predicate`.
    pub fn find_where<P: Fn(&Element) -> bool>(&self, predicate: &P) -> Option<&Element> {
        self.children
            .iter()
            .find_map(|c| if predicate(c) { Some(c) } else { c.find_where(predicate) })
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Element> {
        for child in self.children.iter_mut() {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find_mut(name) {
                return Some(found);
            }
        }
        None
    }

    /// Every descendant with this name, in document order.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut out = Vec::new();
        self.collect_named(name, &mut out);
        out
    }

    fn collect_named<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                out.push(child);
            }
            child.collect_named(name, out);
        }
    }
}

/// Reads a program file into an element tree. Anything that is not well-formed XML
/// with exactly one root element is `MalformedDocument`.
pub fn load_document(path: &Path) -> Result<Element, ParseError> {
    let bytes = fs::read(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8_lossy(&bytes);
    parse_document(&text).map_err(|e| ParseError::MalformedDocument {
        path: path.to_path_buf(),
        reason: format!("{:#}", e),
    })
}

pub fn parse_document(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml.trim_start_matches('\u{feff}'));
    // Trimming would eat the spaces around entity references, so whitespace is
    // dropped per element on close instead.
    reader.config_mut().trim_text(false);
    reader.config_mut().expand_empty_elements = false;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let position = reader.buffer_position();
        match reader
            .read_event()
            .with_context(|| format!("XML error near byte {}", position))?
        {
            Event::Start(e) => stack.push(element_from_start(&e)?),
            Event::Empty(e) => {
                let element = element_from_start(&e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let mut element = stack
                    .pop()
                    .ok_or_else(|| anyhow::anyhow!("closing tag without an open element"))?;
                if !element.children.is_empty() && element.text.trim().is_empty() {
                    element.text.clear();
                }
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(e) => {
                let raw = std::str::from_utf8(&e).context("text is not valid UTF-8")?;
                push_text(&mut stack, &unescape(raw).context("bad escape in text")?);
            }
            Event::CData(e) => {
                let raw = std::str::from_utf8(&e).context("CDATA is not valid UTF-8")?;
                push_text(&mut stack, raw);
            }
            Event::GeneralRef(e) => {
                let name = std::str::from_utf8(&e).context("entity name is not valid UTF-8")?;
                let reference = format!("&{};", name);
                let resolved = unescape(&reference).with_context(|| format!("unknown entity {}", reference))?;
                push_text(&mut stack, &resolved);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        anyhow::bail!("unexpected end of document inside <{}>", open.name);
    }
    root.ok_or_else(|| anyhow::anyhow!("document has no root element"))
}

fn element_from_start(start: &BytesStart) -> Result<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).to_string());
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let raw = String::from_utf8_lossy(&attr.value).to_string();
        let value = unescape(&raw).map(|v| v.to_string()).unwrap_or(raw);
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => anyhow::bail!("second root element <{}>", element.name),
    }
    Ok(())
}

fn push_text(stack: &mut [Element], text: &str) {
    if let Some(current) = stack.last_mut() {
        current.text.push_str(text);
    }
}

/// Serializes the tree with an XML declaration and two-space indentation.
pub fn to_xml_string(root: &Element) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_element(&mut writer, root)?;
    let mut xml = String::from_utf8(writer.into_inner()).context("serialized XML is not UTF-8")?;
    xml.push('\n');
    Ok(xml)
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if element.children.is_empty() && element.text.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    if !element.text.is_empty() {
        writer.write_event(Event::Text(BytesText::new(&element.text)))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}

pub fn write_document(root: &Element, path: &Path) -> Result<()> {
    let xml = to_xml_string(root)?;
    fs::write(path, xml).with_context(|| format!("Failed to write {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nested_elements_text_and_attributes() {
        let doc = parse_document(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <MPCVObject>
              <Program type="Keygroup">
                <ProgramName>Tom &amp; Jerry</ProgramName>
                <Instruments>
                  <Instrument number="1"><LowNote>0</LowNote><Empty/></Instrument>
                </Instruments>
              </Program>
            </MPCVObject>"#,
        )
        .unwrap();
        assert_eq!(doc.name, "MPCVObject");
        let program = doc.child("Program").unwrap();
        assert_eq!(program.attribute("type"), Some("Keygroup"));
        assert_eq!(program.child_text("ProgramName"), Some("Tom & Jerry"));
        let inst = doc.find("Instrument").unwrap();
        assert_eq!(inst.child_text("LowNote"), Some("0"));
        assert!(inst.child("Empty").unwrap().is_leaf());
        assert_eq!(inst.child_text("Empty"), None);
    }

    #[test]
    fn escaped_json_text_comes_back_verbatim() {
        let doc = parse_document(r#"<P><Pads>{&quot;pads&quot;: {&quot;value0&quot;: 0}}</Pads></P>"#).unwrap();
        assert_eq!(doc.child_text("Pads"), Some(r#"{"pads": {"value0": 0}}"#));
    }

    #[test]
    fn broken_documents_are_rejected() {
        assert!(parse_document("<A><B></A>").is_err());
        assert!(parse_document("<A>").is_err());
        assert!(parse_document("").is_err());
        assert!(parse_document("<A/><B/>").is_err());
    }

    #[test]
    fn written_documents_parse_back() {
        let mut root = Element::new("MPCVObject");
        let program = root.push(Element::new("Program").with_attribute("type", "Keygroup"));
        program.push_text("ProgramName", "<Strings> & \"Pads\"");
        program.push_text("Blank", "");

        let xml = to_xml_string(&root).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        let back = parse_document(&xml).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn find_all_is_document_order() {
        let doc = parse_document("<R><L>1</L><G><L>2</L></G><L>3</L></R>").unwrap();
        let texts: Vec<&str> = doc.find_all("L").iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["1", "2", "3"]);
    }
}
