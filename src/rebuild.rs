use anyhow::Result;
use itertools::Itertools;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::Diagnostic;
use crate::firmware::{EngineMode, FirmwareProfile, FirmwareProfileProvider};
use crate::mapping::{
    MidiNote, NUM_KEYGROUPS_PARAM, PROGRAM_NAME_PARAM, ProgramParameters, SampleMapping, relative_sample_reference,
};
use crate::program_xml::{self, Element};
use crate::wav;

pub const PAD_SLOTS: usize = 128;
/// The sampler plays at most this many velocity layers per keygroup.
pub const MAX_LAYERS_PER_KEYGROUP: usize = 8;
const DEFAULT_POLYPHONY: u32 = 16;

/// How a program document should be emitted.
#[derive(Debug, Clone)]
pub struct RebuildOptions {
    pub firmware_id: String,
    pub engine: Option<EngineMode>,
    /// Directory the program file will live in; sample paths are written relative to it.
    pub output_dir: PathBuf,
    /// Emit the `Instruments` tree next to the pad container.
    pub emit_instruments: bool,
    pub polyphony: u32,
}

impl RebuildOptions {
    pub fn new(firmware_id: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            firmware_id: firmware_id.into(),
            engine: None,
            output_dir: output_dir.into(),
            emit_instruments: true,
            polyphony: DEFAULT_POLYPHONY,
        }
    }
}

/// A rebuilt program, ready to be written out.
#[derive(Debug, Clone)]
pub struct ProgramDocument {
    pub root: Element,
    pub profile: FirmwareProfile,
    pub keygroup_count: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl ProgramDocument {
    pub fn to_xml_string(&self) -> Result<String> {
        program_xml::to_xml_string(&self.root)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        program_xml::write_document(&self.root, path)?;
        log::info!("[Rebuild] Wrote {:?} ({} keygroups)", path, self.keygroup_count);
        Ok(())
    }
}

/// Mappings sharing one `(low_note, high_note)` pair, layers in velocity order.
struct Keygroup<'a> {
    range: (MidiNote, MidiNote),
    layers: Vec<&'a SampleMapping>,
}

fn group_keygroups(mappings: &[SampleMapping]) -> Vec<Keygroup<'_>> {
    let ordered: Vec<&SampleMapping> = mappings
        .iter()
        .sorted_by_key(|m| (m.low_note, m.high_note, m.velocity_low))
        .collect();
    let chunks = ordered.into_iter().chunk_by(|m| m.key_range());
    chunks
        .into_iter()
        .map(|(range, layers)| Keygroup {
            range,
            layers: layers.collect(),
        })
        .collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PadEntry {
    sample_path: String,
    root_note: MidiNote,
    low_note: MidiNote,
    high_note: MidiNote,
    velocity_low: MidiNote,
    velocity_high: MidiNote,
}

/// Dense `value0..value127` map; empty slots are written as `0`.
struct PadSlots(Vec<Option<PadEntry>>);

impl Serialize for PadSlots {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (index, slot) in self.0.iter().enumerate() {
            let key = format!("value{}", index);
            match slot {
                Some(entry) => map.serialize_entry(&key, entry)?,
                None => map.serialize_entry(&key, &0)?,
            }
        }
        map.end()
    }
}

#[derive(Serialize)]
struct FirstValue<T> {
    value0: T,
}

#[derive(Serialize)]
struct PadContainer<'a> {
    #[serde(rename = "Universal")]
    universal: FirstValue<bool>,
    #[serde(rename = "Type")]
    pad_type: FirstValue<u32>,
    #[serde(rename = "universalPad")]
    universal_pad: u32,
    pads: PadSlots,
    #[serde(rename = "UnusedPads")]
    unused_pads: FirstValue<u32>,
    #[serde(rename = "PadsFollowTrackColour")]
    pads_follow_track_colour: FirstValue<bool>,
    engine: &'a str,
}

/// Gives every layer its own slot: the root note's slot when free, else the next
/// free one (wrapping). Returns how many layers found no slot.
fn allocate_pads(
    keygroups: &[Keygroup<'_>],
    output_dir: &Path,
) -> (Vec<Option<PadEntry>>, usize) {
    let mut slots: Vec<Option<PadEntry>> = (0..PAD_SLOTS).map(|_| None).collect();
    let mut dropped = 0;
    for mapping in keygroups.iter().flat_map(|kg| kg.layers.iter()) {
        let preferred = mapping.root_note as usize % PAD_SLOTS;
        let free = (0..PAD_SLOTS)
            .map(|step| (preferred + step) % PAD_SLOTS)
            .find(|&i| slots[i].is_none());
        let Some(index) = free else {
            dropped += 1;
            continue;
        };
        slots[index] = Some(PadEntry {
            sample_path: relative_sample_reference(output_dir, &mapping.sample_path),
            root_note: mapping.root_note,
            low_note: mapping.low_note,
            high_note: mapping.high_note,
            velocity_low: mapping.velocity_low,
            velocity_high: mapping.velocity_high,
        });
    }
    (slots, dropped)
}

fn is_instrument_param(name: &str, instrument_defaults: &ProgramParameters) -> bool {
    instrument_defaults.contains_key(name)
        || name == "Polyphony"
        || name.starts_with("Volume")
        || name.starts_with("Filter")
}

fn layer_element(index: usize, mapping: &SampleMapping, output_dir: &Path) -> Element {
    let sample_name = mapping
        .sample_path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let frames = match wav::wav_frame_count(&mapping.sample_path) {
        Ok(frames) => frames.unwrap_or(0),
        Err(_) => 0,
    };

    let mut fields: Vec<(String, String)> = vec![
        ("SampleName".into(), sample_name),
        ("SampleFile".into(), relative_sample_reference(output_dir, &mapping.sample_path)),
        ("VelStart".into(), mapping.velocity_low.to_string()),
        ("VelEnd".into(), mapping.velocity_high.to_string()),
        ("RootNote".into(), mapping.root_note.to_string()),
        ("SampleStart".into(), "0".into()),
        ("SampleEnd".into(), frames.to_string()),
        ("Direction".into(), "0".into()),
        ("Offset".into(), "0".into()),
        ("Volume".into(), "1.0".into()),
        ("Pan".into(), "0.5".into()),
        ("Tune".into(), "0.0".into()),
        ("MuteGroup".into(), "0".into()),
    ];
    // A loop stored by the sampler that recorded the file; preserved layer values still win.
    match wav::read_sampler_info(&mapping.sample_path).ok().flatten().and_then(|info| info.first_loop) {
        Some((start, end)) => {
            fields.push(("Loop".into(), "On".into()));
            fields.push(("LoopStart".into(), start.to_string()));
            fields.push(("LoopEnd".into(), end.to_string()));
        }
        None => fields.push(("Loop".into(), "Off".into())),
    }
    if let Some(preserved) = &mapping.layer_params {
        for (name, value) in preserved {
            // Velocity always comes from the mapping itself.
            if name == "VelStart" || name == "VelEnd" {
                continue;
            }
            match fields.iter_mut().find(|(k, _)| k == name) {
                Some(field) => field.1 = value.clone(),
                None => fields.push((name.clone(), value.clone())),
            }
        }
    }

    let mut layer = Element::new("Layer").with_attribute("number", (index + 1).to_string());
    for (name, value) in fields {
        layer.push_text(name, value);
    }
    layer
}

/// Regenerates a complete program document from the canonical model.
pub fn rebuild(
    name: &str,
    mappings: &[SampleMapping],
    provider: &dyn FirmwareProfileProvider,
    parameters: &ProgramParameters,
    options: &RebuildOptions,
) -> Result<ProgramDocument> {
    let profile = provider.resolve(&options.firmware_id, options.engine);
    let instrument_defaults = provider.default_instrument_params();
    let mut diagnostics = Vec::new();

    let keygroups = group_keygroups(mappings);
    let keygroup_count = keygroups.len();

    let (slots, dropped) = allocate_pads(&keygroups, &options.output_dir);
    if dropped > 0 {
        diagnostics.push(Diagnostic::PadCapacityExceeded { dropped });
    }
    let container = PadContainer {
        universal: FirstValue { value0: true },
        pad_type: FirstValue { value0: profile.pad_type },
        universal_pad: profile.universal_pad,
        pads: PadSlots(slots),
        unused_pads: FirstValue { value0: 1 },
        pads_follow_track_colour: FirstValue { value0: false },
        engine: profile.engine.as_str(),
    };
    let pads_json = serde_json::to_string_pretty(&container)?;

    // Defaults first, then the caller's values, then what the profile forbids or we compute.
    let mut program_params = provider.default_program_params();
    let mut instrument_params = instrument_defaults.clone();
    for (key, value) in parameters {
        if key == PROGRAM_NAME_PARAM {
            continue;
        }
        if is_instrument_param(key, &instrument_defaults) {
            instrument_params.insert(key.clone(), value.clone());
        } else {
            program_params.insert(key.clone(), value.clone());
        }
    }
    for removed in &profile.removed_parameters {
        program_params.remove(removed);
    }
    program_params.insert(NUM_KEYGROUPS_PARAM.to_string(), keygroup_count.to_string());
    let legacy_mode = options.engine.unwrap_or(profile.engine) == EngineMode::Legacy;
    program_params.insert("KeygroupLegacyMode".to_string(), if legacy_mode { "True" } else { "False" }.to_string());

    let polyphony = instrument_params
        .remove("Polyphony")
        .unwrap_or_else(|| options.polyphony.to_string());

    let mut root = Element::new("MPCVObject");
    let version = root.push(Element::new("Version"));
    version.push_text("File_Version", "2.1");
    version.push_text("Application", "MPC-V");
    version.push_text("Application_Version", profile.firmware_id.clone());
    version.push_text("Platform", "Linux");

    let program = root.push(Element::new("Program").with_attribute("type", "Keygroup"));
    program.push_text(PROGRAM_NAME_PARAM, name);
    program.push_text(profile.container_tag.clone(), pads_json);
    for (key, value) in &program_params {
        program.push_text(key.clone(), value.clone());
    }

    if options.emit_instruments {
        let instruments = program.push(Element::new("Instruments"));
        for (index, keygroup) in keygroups.iter().enumerate() {
            let instrument = instruments.push(Element::new("Instrument").with_attribute("number", (index + 1).to_string()));
            instrument.push_text("Polyphony", polyphony.clone());
            instrument.push_text("LowNote", keygroup.range.0.to_string());
            instrument.push_text("HighNote", keygroup.range.1.to_string());
            for (key, value) in &instrument_params {
                instrument.push_text(key.clone(), value.clone());
            }

            if keygroup.layers.len() > MAX_LAYERS_PER_KEYGROUP {
                diagnostics.push(Diagnostic::SkippedElement {
                    element: format!("Instrument {}", index + 1),
                    reason: format!(
                        "{} layers, only the first {} are written to the instrument tree",
                        keygroup.layers.len(),
                        MAX_LAYERS_PER_KEYGROUP
                    ),
                });
            }
            let layers = instrument.push(Element::new("Layers"));
            for (layer_index, mapping) in keygroup.layers.iter().take(MAX_LAYERS_PER_KEYGROUP).enumerate() {
                layers.children.push(layer_element(layer_index, mapping, &options.output_dir));
            }
        }
    }

    log::debug!(
        "[Rebuild] '{}' for firmware {} ({} engine): {} mappings in {} keygroups",
        name,
        profile.firmware_id,
        profile.engine.as_str(),
        mappings.len(),
        keygroup_count
    );

    Ok(ProgramDocument {
        root,
        profile,
        keygroup_count,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{BuiltinFirmwareTable, LEGACY_PADS_TAG, MODERN_PADS_TAG};
    use crate::program::{Format, find_pad_container, parse_program_document};
    use pretty_assertions::assert_eq;

    fn mapping(file: &str, root: u8, low: u8, high: u8, vlo: u8, vhi: u8) -> SampleMapping {
        SampleMapping {
            sample_path: PathBuf::from("/banks/keys").join(file),
            root_note: root,
            low_note: low,
            high_note: high,
            velocity_low: vlo,
            velocity_high: vhi,
            layer_params: None,
        }
    }

    fn options(firmware: &str) -> RebuildOptions {
        RebuildOptions::new(firmware, "/banks/keys")
    }

    fn build(mappings: &[SampleMapping], params: &ProgramParameters, opts: &RebuildOptions) -> ProgramDocument {
        rebuild("Keys", mappings, &BuiltinFirmwareTable, params, opts).unwrap()
    }

    fn layer_files(doc: &ProgramDocument) -> Vec<String> {
        doc.root
            .find_all("Layer")
            .iter()
            .filter_map(|l| l.child_text("SampleFile").map(str::to_string))
            .collect()
    }

    #[test]
    fn velocity_layers_keep_a_stable_order() {
        let maps = vec![
            mapping("soft.wav", 60, 0, 127, 0, 63),
            mapping("loud.wav", 60, 0, 127, 64, 127),
            mapping("soft_dup.wav", 60, 0, 127, 0, 63),
        ];
        let doc = build(&maps, &ProgramParameters::new(), &options("3.5.0"));
        assert_eq!(doc.keygroup_count, 1);
        assert_eq!(layer_files(&doc), vec!["soft.wav", "soft_dup.wav", "loud.wav"]);
    }

    #[test]
    fn keygroups_are_emitted_in_key_order() {
        let maps = vec![
            mapping("hi.wav", 72, 66, 127, 0, 127),
            mapping("lo.wav", 48, 0, 53, 0, 127),
            mapping("mid.wav", 60, 54, 65, 0, 127),
        ];
        let doc = build(&maps, &ProgramParameters::new(), &options("3.5.0"));
        let lows: Vec<&str> = doc
            .root
            .find_all("Instrument")
            .iter()
            .filter_map(|i| i.child_text("LowNote"))
            .collect();
        assert_eq!(lows, vec!["0", "54", "66"]);
        assert_eq!(
            doc.root.find("Program").unwrap().child_text(NUM_KEYGROUPS_PARAM),
            Some("3")
        );
    }

    #[test]
    fn round_trip_through_the_modern_container() {
        let maps = vec![
            mapping("a.wav", 48, 0, 53, 0, 127),
            mapping("b_soft.wav", 60, 54, 65, 0, 63),
            mapping("b_loud.wav", 60, 54, 65, 64, 127),
            mapping("sub/c.wav", 72, 66, 127, 0, 127),
        ];
        let doc = build(&maps, &ProgramParameters::new(), &options("3.5.0"));
        let xml = doc.to_xml_string().unwrap();
        let reparsed = parse_program_document(&program_xml::parse_document(&xml).unwrap(), Path::new("/banks/keys"));
        assert_eq!(reparsed.format, Format::Modern);

        let key = |m: &SampleMapping| {
            (m.sample_path.clone(), m.root_note, m.low_note, m.high_note, m.velocity_low, m.velocity_high)
        };
        let mut expected: Vec<_> = maps.iter().map(key).collect();
        let mut got: Vec<_> = reparsed.mappings.iter().map(key).collect();
        expected.sort();
        got.sort();
        assert_eq!(got, expected);
    }

    #[test]
    fn firmware_decides_container_and_parameters() {
        let maps = vec![mapping("a.wav", 60, 0, 127, 0, 127)];
        let mut params = ProgramParameters::new();
        params.insert("KeygroupWheelToLfo2".into(), "0.7".into());
        params.insert("VolumeAttack".into(), "0.3".into());
        params.insert("KeygroupNumKeygroups".into(), "99".into());

        let old = build(&maps, &params, &options("2.6.0.17"));
        let program = old.root.find("Program").unwrap();
        assert!(program.child(LEGACY_PADS_TAG).is_some());
        assert!(program.child("KeygroupWheelToLfo2").is_none());
        assert_eq!(program.child_text("KeygroupNumKeygroups"), Some("1"));
        assert_eq!(program.child_text("KeygroupLegacyMode"), Some("True"));
        assert_eq!(program.child_text("HarmoniserMix"), Some("0.5"));
        assert!(program.child("VolumeAttack").is_none());
        assert_eq!(old.root.find("Instrument").unwrap().child_text("VolumeAttack"), Some("0.3"));

        let new = build(&maps, &params, &options("3.5.0"));
        let program = new.root.find("Program").unwrap();
        assert!(program.child(MODERN_PADS_TAG).is_some());
        assert_eq!(program.child_text("KeygroupWheelToLfo2"), Some("0.7"));
        assert_eq!(program.child_text("KeygroupLegacyMode"), Some("False"));
        assert_eq!(new.root.find("Application_Version").unwrap().text, "3.5.0");
    }

    #[test]
    fn pad_json_carries_profile_constants() {
        let maps = vec![mapping("a.wav", 60, 0, 127, 0, 127)];
        let doc = build(&maps, &ProgramParameters::new(), &options("2.3.0.0"));
        let container = find_pad_container(&doc.root).unwrap();
        let json: serde_json::Value = serde_json::from_str(&container.text).unwrap();
        assert_eq!(json["Type"]["value0"], 1);
        assert_eq!(json["universalPad"], 32512);
        assert_eq!(json["engine"], "legacy");
        assert_eq!(json["pads"]["value60"]["samplePath"], "a.wav");
        assert_eq!(json["pads"]["value0"], 0);
        assert_eq!(json["pads"].as_object().unwrap().len(), PAD_SLOTS);
    }

    #[test]
    fn shared_roots_spill_into_free_slots_and_overflow_is_reported() {
        let maps: Vec<SampleMapping> = (0..130)
            .map(|i| mapping(&format!("s{}.wav", i), 127, 0, 127, 0, 127))
            .collect();
        let doc = build(&maps, &ProgramParameters::new(), &options("3.5.0"));
        assert!(doc.diagnostics.contains(&Diagnostic::PadCapacityExceeded { dropped: 2 }));
        let container = find_pad_container(&doc.root).unwrap();
        let json: serde_json::Value = serde_json::from_str(&container.text).unwrap();
        assert_eq!(json["pads"]["value127"]["samplePath"], "s0.wav");
        assert_eq!(json["pads"]["value0"]["samplePath"], "s1.wav");
    }

    #[test]
    fn preserved_layer_params_override_defaults() {
        let mut m = mapping("a.wav", 60, 0, 127, 10, 90);
        m.layer_params = Some(
            [("Tune", "0.25"), ("LoopStart", "100"), ("VelStart", "0")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let doc = build(&[m], &ProgramParameters::new(), &options("3.5.0"));
        let layer = doc.root.find("Layer").unwrap();
        assert_eq!(layer.child_text("Tune"), Some("0.25"));
        assert_eq!(layer.child_text("LoopStart"), Some("100"));
        assert_eq!(layer.child_text("VelStart"), Some("10"));
        assert_eq!(layer.child_text("SampleName"), Some("a"));
    }

    /// A 16-bit mono WAV of `frames` silent frames whose smpl chunk loops `start..end`.
    fn looped_wav(path: &Path, frames: u32, start: u32, end: u32) {
        let mut smpl = vec![0u8; 60];
        smpl[12..16].copy_from_slice(&60u32.to_le_bytes());
        smpl[28..32].copy_from_slice(&1u32.to_le_bytes());
        smpl[44..48].copy_from_slice(&start.to_le_bytes());
        smpl[48..52].copy_from_slice(&end.to_le_bytes());

        let mut body = b"WAVE".to_vec();
        body.extend_from_slice(b"fmt ");
        body.extend_from_slice(&16u32.to_le_bytes());
        for word in [1u16, 1] {
            body.extend_from_slice(&word.to_le_bytes());
        }
        body.extend_from_slice(&44100u32.to_le_bytes());
        body.extend_from_slice(&88200u32.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(&16u16.to_le_bytes());
        body.extend_from_slice(b"data");
        body.extend_from_slice(&(frames * 2).to_le_bytes());
        body.extend(std::iter::repeat_n(0u8, (frames * 2) as usize));
        body.extend_from_slice(b"smpl");
        body.extend_from_slice(&(smpl.len() as u32).to_le_bytes());
        body.extend_from_slice(&smpl);

        let mut image = b"RIFF".to_vec();
        image.extend_from_slice(&(body.len() as u32).to_le_bytes());
        image.extend_from_slice(&body);
        std::fs::write(path, image).unwrap();
    }

    #[test]
    fn sampler_loops_become_layer_loops() {
        let dir = tempfile::tempdir().unwrap();
        looped_wav(&dir.path().join("pad.wav"), 200, 20, 180);
        let mut looped = SampleMapping::single_key(dir.path().join("pad.wav"), 60);
        looped.high_note = 127;
        let mut preserved = looped.clone();
        preserved.low_note = 0;
        preserved.high_note = 59;
        preserved.layer_params = Some([("Loop".to_string(), "Off".to_string())].into_iter().collect());

        let opts = RebuildOptions::new("3.5.0", dir.path());
        let doc = build(&[looped, preserved], &ProgramParameters::new(), &opts);
        let layers = doc.root.find_all("Layer");
        // Keygroups come out in key order, so the preserved one is first.
        assert_eq!(layers[0].child_text("Loop"), Some("Off"));
        assert_eq!(layers[1].child_text("Loop"), Some("On"));
        assert_eq!(layers[1].child_text("LoopStart"), Some("20"));
        assert_eq!(layers[1].child_text("LoopEnd"), Some("180"));
        assert_eq!(layers[1].child_text("SampleEnd"), Some("200"));
    }

    #[test]
    fn instruments_can_be_left_out() {
        let maps = vec![mapping("a.wav", 60, 0, 127, 0, 127)];
        let mut opts = options("3.5.0");
        opts.emit_instruments = false;
        let doc = build(&maps, &ProgramParameters::new(), &opts);
        assert!(doc.root.find("Instruments").is_none());
    }
}
