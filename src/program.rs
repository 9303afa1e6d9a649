use quick_xml::escape::unescape;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Diagnostic, ParseError};
use crate::firmware::is_pad_container_tag;
use crate::key_range::assign_grouped_ranges;
use crate::mapping::{
    DEFAULT_ROOT_NOTE, MIDI_MAX, MidiNote, PRESERVED_LAYER_PARAMS, ProgramParameters, SampleMapping, clamp_midi,
    resolve_sample_path,
};
use crate::program_xml::{self, Element};

/// Instrument children that describe the keygroup itself rather than its sound.
const INSTRUMENT_STRUCTURE: &[&str] = &["LowNote", "HighNote", "Layers"];

/// Which generation of the format a document was read as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// JSON pad map embedded in a pad-container element.
    Modern,
    /// `Instruments/Instrument/Layers/Layer` tree.
    Legacy,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Modern => f.write_str("modern"),
            Format::Legacy => f.write_str("legacy"),
        }
    }
}

/// Canonical model of one program file plus everything worth reporting about it.
#[derive(Debug, Clone)]
pub struct ParsedProgram {
    pub format: Format,
    pub program_name: Option<String>,
    pub application_version: Option<String>,
    pub mappings: Vec<SampleMapping>,
    pub parameters: ProgramParameters,
    pub diagnostics: Vec<Diagnostic>,
}

impl ParsedProgram {
    pub fn declared_keygroups(&self) -> Option<usize> {
        self.parameters
            .get(crate::mapping::NUM_KEYGROUPS_PARAM)
            .and_then(|v| v.trim().parse().ok())
    }
}

#[derive(Debug, Deserialize)]
struct PadContainer {
    #[serde(default)]
    pads: Map<String, Value>,
}

/// Numbers in pad maps are sometimes written as strings or floats.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LenientInt {
    Int(i64),
    Float(f64),
    Text(String),
}

impl LenientInt {
    fn value(&self) -> Option<i64> {
        match self {
            LenientInt::Int(i) => Some(*i),
            LenientInt::Float(f) if f.is_finite() => Some(f.round() as i64),
            LenientInt::Float(_) => None,
            LenientInt::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PadEntry {
    #[serde(default)]
    sample_path: String,
    root_note: Option<LenientInt>,
    low_note: Option<LenientInt>,
    high_note: Option<LenientInt>,
    velocity_low: Option<LenientInt>,
    velocity_high: Option<LenientInt>,
}

/// Outcome of format detection: a decoded pad map, or the legacy tree
/// (with the reason when an undecodable pad container was passed over).
enum Detected {
    Modern(PadContainer),
    Legacy { unreadable: Option<String> },
}

#[derive(Default)]
struct Extraction {
    mappings: Vec<SampleMapping>,
    diagnostics: Vec<Diagnostic>,
}

/// The element holding the pad-container JSON, under any container tag.
pub fn find_pad_container(root: &Element) -> Option<&Element> {
    root.find_where(&|e: &Element| is_pad_container_tag(&e.name))
}

fn detect(root: &Element) -> Detected {
    let Some(container) = find_pad_container(root) else {
        return Detected::Legacy { unreadable: None };
    };
    match decode_pad_container(&container.text) {
        Ok(pads) => Detected::Modern(pads),
        Err(reason) => Detected::Legacy {
            unreadable: Some(reason),
        },
    }
}

/// Decodes the pad JSON. Some writers escape it twice, so one more unescape is
/// tried before giving up.
fn decode_pad_container(text: &str) -> Result<PadContainer, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("pad container is empty".to_string());
    }
    match serde_json::from_str::<PadContainer>(text) {
        Ok(pads) => Ok(pads),
        Err(first) => unescape(text)
            .ok()
            .and_then(|once_more| serde_json::from_str::<PadContainer>(&once_more).ok())
            .ok_or_else(|| first.to_string()),
    }
}

fn pad_index(key: &str) -> Option<usize> {
    key.strip_prefix("value")?.parse().ok()
}

fn midi_field(field: &str, raw: Option<&LenientInt>, default: MidiNote, diagnostics: &mut Vec<Diagnostic>) -> MidiNote {
    match raw.and_then(LenientInt::value) {
        None => default,
        Some(value) => {
            let (clamped, changed) = clamp_midi(value);
            if changed {
                diagnostics.push(Diagnostic::ValueOutOfRange {
                    field: field.to_string(),
                    value,
                    clamped,
                });
            }
            clamped
        }
    }
}

fn order_velocities(mapping: &mut SampleMapping) {
    if mapping.velocity_low > mapping.velocity_high {
        std::mem::swap(&mut mapping.velocity_low, &mut mapping.velocity_high);
    }
}

/// Swaps reversed bounds and widens the key range to contain the root.
fn normalize_bounds(mapping: &mut SampleMapping) {
    if mapping.low_note > mapping.high_note {
        std::mem::swap(&mut mapping.low_note, &mut mapping.high_note);
    }
    order_velocities(mapping);
    if mapping.root_note < mapping.low_note || mapping.root_note > mapping.high_note {
        log::warn!(
            "[Parser] Root {} of {} lies outside {}-{}, widening the range",
            mapping.root_note,
            mapping.sample_path.display(),
            mapping.low_note,
            mapping.high_note
        );
        mapping.low_note = mapping.low_note.min(mapping.root_note);
        mapping.high_note = mapping.high_note.max(mapping.root_note);
    }
}

fn extract_modern(pads: &PadContainer, program_dir: &Path) -> Extraction {
    let mut out = Extraction::default();
    let mut slots: Vec<(usize, &Value)> = pads
        .pads
        .iter()
        .filter_map(|(key, value)| pad_index(key).map(|i| (i, value)))
        .collect();
    slots.sort_by_key(|(i, _)| *i);

    for (index, value) in slots {
        if !value.is_object() {
            continue;
        }
        let entry = match PadEntry::deserialize(value) {
            Ok(entry) => entry,
            Err(e) => {
                out.diagnostics.push(Diagnostic::SkippedElement {
                    element: format!("pads.value{}", index),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if entry.sample_path.trim().is_empty() {
            continue;
        }
        let diags = &mut out.diagnostics;
        let mut mapping = SampleMapping {
            sample_path: resolve_sample_path(program_dir, &entry.sample_path),
            root_note: midi_field("rootNote", entry.root_note.as_ref(), DEFAULT_ROOT_NOTE, diags),
            low_note: midi_field("lowNote", entry.low_note.as_ref(), 0, diags),
            high_note: midi_field("highNote", entry.high_note.as_ref(), MIDI_MAX, diags),
            velocity_low: midi_field("velocityLow", entry.velocity_low.as_ref(), 0, diags),
            velocity_high: midi_field("velocityHigh", entry.velocity_high.as_ref(), MIDI_MAX, diags),
            layer_params: None,
        };
        normalize_bounds(&mut mapping);
        out.mappings.push(mapping);
    }
    out
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    text.parse::<i64>()
        .ok()
        .or_else(|| text.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64))
}

/// Reads an optional MIDI value. `Err` carries the raw text when it is not a number.
fn optional_midi(
    parent: &Element,
    name: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Option<MidiNote>, String> {
    let Some(text) = parent.child_text(name) else {
        return Ok(None);
    };
    let value = parse_int(text).ok_or_else(|| text.to_string())?;
    let (clamped, changed) = clamp_midi(value);
    if changed {
        diagnostics.push(Diagnostic::ValueOutOfRange {
            field: name.to_string(),
            value,
            clamped,
        });
    }
    Ok(Some(clamped))
}

fn layer_sample_reference(layer: &Element) -> Option<String> {
    if let Some(file) = layer.child_text("SampleFile") {
        return Some(file.to_string());
    }
    layer.child_text("SampleName").map(|name| format!("{}.wav", name))
}

fn extract_legacy(root: &Element, program_dir: &Path) -> Extraction {
    let mut out = Extraction::default();
    let mut needs_ranges: Vec<Vec<usize>> = Vec::new();

    for (inst_index, instrument) in root.find_all("Instrument").into_iter().enumerate() {
        let label = instrument
            .attribute("number")
            .map(|n| format!("Instrument {}", n))
            .unwrap_or_else(|| format!("Instrument #{}", inst_index + 1));

        let bounds = optional_midi(instrument, "LowNote", &mut out.diagnostics)
            .and_then(|low| Ok((low, optional_midi(instrument, "HighNote", &mut out.diagnostics)?)));
        let (low, high) = match bounds {
            Ok(bounds) => bounds,
            Err(raw) => {
                out.diagnostics.push(Diagnostic::SkippedElement {
                    element: label,
                    reason: format!("unreadable key bound '{}'", raw),
                });
                continue;
            }
        };
        let declared = low.zip(high);
        let mut group = Vec::new();

        for layer in instrument.find_all("Layer") {
            let Some(reference) = layer_sample_reference(layer) else {
                continue;
            };
            let layer_params: BTreeMap<String, String> = PRESERVED_LAYER_PARAMS
                .iter()
                .filter_map(|name| layer.child_text(name).map(|v| (name.to_string(), v.to_string())))
                .collect();

            let root_note = optional_midi(layer, "RootNote", &mut out.diagnostics)
                .ok()
                .flatten()
                .unwrap_or(DEFAULT_ROOT_NOTE);
            let velocity_low = velocity(layer, "VelStart", 0, &label, &mut out.diagnostics);
            let velocity_high = velocity(layer, "VelEnd", MIDI_MAX, &label, &mut out.diagnostics);
            let (low_note, high_note) = declared.unwrap_or((root_note, root_note));

            let mut mapping = SampleMapping {
                sample_path: resolve_sample_path(program_dir, &reference),
                root_note,
                low_note,
                high_note,
                velocity_low,
                velocity_high,
                layer_params: Some(layer_params),
            };
            if declared.is_some() {
                normalize_bounds(&mut mapping);
            } else {
                order_velocities(&mut mapping);
                group.push(out.mappings.len());
            }
            out.mappings.push(mapping);
        }

        if !group.is_empty() {
            needs_ranges.push(group);
        }
    }

    if !needs_ranges.is_empty() {
        log::debug!("[Parser] Calculating key ranges for {} keygroups without bounds", needs_ranges.len());
        assign_grouped_ranges(&mut out.mappings, &needs_ranges);
    }
    out
}

fn velocity(layer: &Element, name: &str, default: MidiNote, label: &str, diagnostics: &mut Vec<Diagnostic>) -> MidiNote {
    match optional_midi(layer, name, diagnostics) {
        Ok(value) => value.unwrap_or(default),
        Err(raw) => {
            log::warn!("[Parser] {}: {} '{}' is not a number, using {}", label, name, raw, default);
            default
        }
    }
}

/// The `Program` element, or the root itself for documents without the wrapper.
pub fn program_element(root: &Element) -> &Element {
    if root.name == "Program" {
        return root;
    }
    root.find("Program").unwrap_or(root)
}

fn collect_parameters(program: &Element) -> ProgramParameters {
    let mut params = ProgramParameters::new();
    for child in &program.children {
        let skip = !child.is_leaf()
            || child.name == crate::mapping::PROGRAM_NAME_PARAM
            || is_pad_container_tag(&child.name);
        if !skip {
            params.insert(child.name.clone(), child.text.trim().to_string());
        }
    }
    if let Some(instrument) = program.find("Instrument") {
        for child in instrument.children.iter().filter(|c| c.is_leaf()) {
            if !INSTRUMENT_STRUCTURE.contains(&child.name.as_str()) {
                params
                    .entry(child.name.clone())
                    .or_insert_with(|| child.text.trim().to_string());
            }
        }
    }
    params
}

/// Builds the canonical model from an already loaded document.
pub fn parse_program_document(root: &Element, program_dir: &Path) -> ParsedProgram {
    let program = program_element(root);
    let mut diagnostics = Vec::new();

    let (format, extraction) = match detect(program) {
        Detected::Modern(pads) => {
            let modern = extract_modern(&pads, program_dir);
            if modern.mappings.is_empty() {
                diagnostics.extend(modern.diagnostics);
                diagnostics.push(Diagnostic::ModernContainerUnreadable {
                    reason: "pad container holds no sample entries".to_string(),
                });
                (Format::Legacy, extract_legacy(program, program_dir))
            } else {
                (Format::Modern, modern)
            }
        }
        Detected::Legacy { unreadable } => {
            if let Some(reason) = unreadable {
                diagnostics.push(Diagnostic::ModernContainerUnreadable { reason });
            }
            (Format::Legacy, extract_legacy(program, program_dir))
        }
    };
    diagnostics.extend(extraction.diagnostics);
    let mappings = extraction.mappings;

    for mapping in &mappings {
        if !mapping.sample_path.exists() {
            diagnostics.push(Diagnostic::UnresolvedSample {
                sample_path: mapping.sample_path.clone(),
            });
        }
    }
    if mappings.is_empty() {
        diagnostics.push(Diagnostic::NoMappings);
    }

    ParsedProgram {
        format,
        program_name: program.child_text(crate::mapping::PROGRAM_NAME_PARAM).map(str::to_string),
        application_version: root.find("Application_Version").map(|e| e.text.trim().to_string()),
        mappings,
        parameters: collect_parameters(program),
        diagnostics,
    }
}

/// Absolute directory of a program file. Sample references resolve against it,
/// so a program given as `Pad.xpm` still yields absolute sample paths.
pub fn program_dir(path: &Path) -> Result<PathBuf, ParseError> {
    let absolute = std::path::absolute(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(absolute.parent().map(Path::to_path_buf).unwrap_or(absolute))
}

/// Parses a program file. Only I/O and XML syntax errors are fatal.
pub fn parse(path: &Path) -> Result<ParsedProgram, ParseError> {
    let root = program_xml::load_document(path)?;
    let program_dir = program_dir(path)?;
    let parsed = parse_program_document(&root, &program_dir);
    log::info!(
        "[Parser] {:?}: {} format, {} mappings, {} diagnostics",
        path,
        parsed.format,
        parsed.mappings.len(),
        parsed.diagnostics.len()
    );
    for diagnostic in &parsed.diagnostics {
        diagnostic.log(&path.display().to_string());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn parse_str(xml: &str) -> ParsedProgram {
        let root = program_xml::parse_document(xml).unwrap();
        parse_program_document(&root, Path::new("/banks/keys"))
    }

    fn modern(pads_json: &str) -> String {
        let escaped = pads_json.replace('&', "&amp;").replace('"', "&quot;");
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<MPCVObject>
  <Version><Application_Version>3.5.0</Application_Version></Version>
  <Program type="Keygroup">
    <ProgramName>Keys</ProgramName>
    <ProgramPads-v2.10>{}</ProgramPads-v2.10>
    <KeygroupNumKeygroups>2</KeygroupNumKeygroups>
  </Program>
</MPCVObject>"#,
            escaped
        )
    }

    #[test]
    fn modern_pads_are_read_in_slot_order_with_defaults() {
        let parsed = parse_str(&modern(
            r#"{"pads": {
                "value10": {"samplePath": "b.wav", "rootNote": "72", "lowNote": 61, "highNote": 127.0},
                "value2": {"samplePath": "a.wav", "rootNote": 48, "lowNote": 0, "highNote": 60,
                           "velocityLow": 0, "velocityHigh": 100},
                "value3": 0,
                "value4": {"samplePath": ""}
            }}"#,
        ));
        assert_eq!(parsed.format, Format::Modern);
        assert_eq!(parsed.program_name.as_deref(), Some("Keys"));
        assert_eq!(parsed.application_version.as_deref(), Some("3.5.0"));
        assert_eq!(parsed.declared_keygroups(), Some(2));
        let got: Vec<(PathBuf, u8, u8, u8, u8, u8)> = parsed
            .mappings
            .iter()
            .map(|m| (m.sample_path.clone(), m.root_note, m.low_note, m.high_note, m.velocity_low, m.velocity_high))
            .collect();
        assert_eq!(
            got,
            vec![
                (PathBuf::from("/banks/keys/a.wav"), 48, 0, 60, 0, 100),
                (PathBuf::from("/banks/keys/b.wav"), 72, 61, 127, 0, 127),
            ]
        );
        assert!(parsed.mappings.iter().all(|m| m.layer_params.is_none()));
    }

    #[test]
    fn out_of_range_pad_values_are_clamped() {
        let parsed = parse_str(&modern(r#"{"pads": {"value0": {"samplePath": "a.wav", "rootNote": 200}}}"#));
        assert_eq!(parsed.mappings[0].root_note, 127);
        assert!(parsed.diagnostics.contains(&Diagnostic::ValueOutOfRange {
            field: "rootNote".to_string(),
            value: 200,
            clamped: 127
        }));
    }

    #[test]
    fn corrupt_container_without_legacy_content_is_empty_not_an_error() {
        let parsed = parse_str(&modern(r#"{"pads": {"value0": {"samplePath": "a.wav""#));
        assert!(parsed.mappings.is_empty());
        assert_eq!(parsed.format, Format::Legacy);
        assert!(matches!(parsed.diagnostics[0], Diagnostic::ModernContainerUnreadable { .. }));
        assert!(parsed.diagnostics.contains(&Diagnostic::NoMappings));
    }

    #[test]
    fn doubly_escaped_container_is_still_read() {
        let json = r#"{"pads": {"value0": {"samplePath": "a.wav", "rootNote": 50}}}"#;
        let once = json.replace('"', "&quot;");
        let parsed = parse_str(&modern(&once));
        assert_eq!(parsed.format, Format::Modern);
        assert_eq!(parsed.mappings[0].root_note, 50);
    }

    const LEGACY: &str = r#"<MPCVObject>
  <Program type="Keygroup">
    <ProgramName>Old</ProgramName>
    <KeygroupNumKeygroups>3</KeygroupNumKeygroups>
    <Instruments>
      <Instrument number="1">
        <Polyphony>8</Polyphony>
        <VolumeAttack>0.1</VolumeAttack>
        <Layers>
          <Layer number="1"><SampleName>soft_c3</SampleName><RootNote>60</RootNote>
            <VelStart>0</VelStart><VelEnd>63</VelEnd><Tune>0.5</Tune><Loop>On</Loop></Layer>
          <Layer number="2"><SampleName>loud_c3</SampleName><RootNote>60</RootNote>
            <VelStart>64</VelStart><VelEnd>127</VelEnd></Layer>
          <Layer number="3"><SampleName></SampleName></Layer>
        </Layers>
      </Instrument>
      <Instrument number="2">
        <Layers><Layer><SampleFile>sub/g3.wav</SampleFile><RootNote>67</RootNote></Layer></Layers>
      </Instrument>
      <Instrument number="3">
        <LowNote>100</LowNote><HighNote>127</HighNote>
        <Layers><Layer><SampleFile>top.wav</SampleFile><RootNote>110</RootNote></Layer></Layers>
      </Instrument>
      <Instrument number="4">
        <LowNote>abc</LowNote>
        <Layers><Layer><SampleFile>skipped.wav</SampleFile></Layer></Layers>
      </Instrument>
    </Instruments>
  </Program>
</MPCVObject>"#;

    #[test]
    fn legacy_tree_with_missing_bounds() {
        let parsed = parse_str(LEGACY);
        assert_eq!(parsed.format, Format::Legacy);
        let got: Vec<(String, u8, u8, u8, u8, u8)> = parsed
            .mappings
            .iter()
            .map(|m| (m.file_name(), m.root_note, m.low_note, m.high_note, m.velocity_low, m.velocity_high))
            .collect();
        assert_eq!(
            got,
            vec![
                ("soft_c3.wav".to_string(), 60, 0, 63, 0, 63),
                ("loud_c3.wav".to_string(), 60, 0, 63, 64, 127),
                ("g3.wav".to_string(), 67, 64, 127, 0, 127),
                ("top.wav".to_string(), 110, 100, 127, 0, 127),
            ]
        );
        assert_eq!(parsed.mappings[2].sample_path, PathBuf::from("/banks/keys/sub/g3.wav"));

        let params = parsed.mappings[0].layer_params.as_ref().unwrap();
        assert_eq!(params.get("Tune").map(String::as_str), Some("0.5"));
        assert_eq!(params.get("Loop").map(String::as_str), Some("On"));
        assert!(!params.contains_key("SampleName"));

        assert!(parsed.diagnostics.iter().any(|d| matches!(
            d,
            Diagnostic::SkippedElement { element, .. } if element == "Instrument 4"
        )));
    }

    #[test]
    fn parameters_come_from_program_and_first_instrument() {
        let parsed = parse_str(LEGACY);
        assert_eq!(parsed.parameters.get("KeygroupNumKeygroups").map(String::as_str), Some("3"));
        assert_eq!(parsed.parameters.get("VolumeAttack").map(String::as_str), Some("0.1"));
        assert_eq!(parsed.parameters.get("Polyphony").map(String::as_str), Some("8"));
        assert!(!parsed.parameters.contains_key("ProgramName"));
        assert!(!parsed.parameters.contains_key("LowNote"));
        assert_eq!(parsed.program_name.as_deref(), Some("Old"));
    }

    #[test]
    fn missing_samples_are_reported_but_kept() {
        let parsed = parse_str(LEGACY);
        let unresolved = parsed
            .diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::UnresolvedSample { .. }))
            .count();
        assert_eq!(unresolved, parsed.mappings.len());
    }

    #[test]
    fn reversed_velocities_are_swapped_without_declared_bounds() {
        let parsed = parse_str(
            r#"<MPCVObject><Program type="Keygroup"><Instruments>
              <Instrument number="1">
                <Layers><Layer><SampleFile>hit.wav</SampleFile><RootNote>60</RootNote>
                  <VelStart>100</VelStart><VelEnd>20</VelEnd></Layer></Layers>
              </Instrument>
            </Instruments></Program></MPCVObject>"#,
        );
        let m = &parsed.mappings[0];
        assert_eq!((m.velocity_low, m.velocity_high), (20, 100));
        assert_eq!(m.key_range(), (0, 127));
    }

    #[test]
    fn newer_container_versions_are_detected() {
        let xml = modern(r#"{"pads": {"value0": {"samplePath": "a.wav", "rootNote": 50}}}"#)
            .replace("ProgramPads-v2.10", "ProgramPads-v2.11");
        let parsed = parse_str(&xml);
        assert_eq!(parsed.format, Format::Modern);
        assert_eq!(parsed.mappings.len(), 1);
        assert!(!parsed.parameters.contains_key("ProgramPads-v2.11"));
    }

    #[test]
    fn program_dir_is_absolute_for_relative_paths() {
        let dir = program_dir(Path::new("Pad.xpm")).unwrap();
        assert!(dir.is_absolute());
        assert_eq!(dir, std::env::current_dir().unwrap());
        assert_eq!(program_dir(Path::new("/banks/keys/Pad.xpm")).unwrap(), PathBuf::from("/banks/keys"));
    }

    #[test]
    fn malformed_xml_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.xpm");
        std::fs::write(&path, "<MPCVObject><Program>").unwrap();
        assert!(matches!(parse(&path), Err(ParseError::MalformedDocument { .. })));
        assert!(matches!(parse(&dir.path().join("absent.xpm")), Err(ParseError::Io { .. })));
    }
}
