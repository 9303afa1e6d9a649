use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A MIDI note or velocity value, always within 0..=127.
pub type MidiNote = u8;

pub const MIDI_MAX: u8 = 127;
pub const DEFAULT_ROOT_NOTE: MidiNote = 60;

/// Layer parameters carried through a parse/rebuild cycle untouched.
pub const PRESERVED_LAYER_PARAMS: &[&str] = &[
    "VelStart",
    "VelEnd",
    "SampleStart",
    "SampleEnd",
    "Loop",
    "LoopStart",
    "LoopEnd",
    "Direction",
    "Offset",
    "Volume",
    "Pan",
    "Tune",
    "MuteGroup",
];

/// Flat bag of program and instrument level parameters, keyed by element name.
pub type ProgramParameters = BTreeMap<String, String>;

pub const NUM_KEYGROUPS_PARAM: &str = "KeygroupNumKeygroups";
pub const PROGRAM_NAME_PARAM: &str = "ProgramName";

/// One audio sample's placement in the instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleMapping {
    /// Absolute path, already resolved against the program's directory.
    pub sample_path: PathBuf,
    pub root_note: MidiNote,
    pub low_note: MidiNote,
    pub high_note: MidiNote,
    pub velocity_low: MidiNote,
    pub velocity_high: MidiNote,
    /// `None` when the source format cannot express layer parameters.
    pub layer_params: Option<BTreeMap<String, String>>,
}

impl SampleMapping {
    /// A mapping covering only its own root key, full velocity range.
    pub fn single_key(sample_path: PathBuf, root_note: MidiNote) -> Self {
        Self {
            sample_path,
            root_note,
            low_note: root_note,
            high_note: root_note,
            velocity_low: 0,
            velocity_high: MIDI_MAX,
            layer_params: None,
        }
    }

    pub fn key_range(&self) -> (MidiNote, MidiNote) {
        (self.low_note, self.high_note)
    }

    pub fn overlaps(&self, other: &SampleMapping) -> bool {
        self.low_note <= other.high_note
            && other.low_note <= self.high_note
            && self.velocity_low <= other.velocity_high
            && other.velocity_low <= self.velocity_high
    }

    pub fn file_name(&self) -> String {
        self.sample_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }
}

/// Clamps a raw integer into the MIDI range. Returns the value and whether it was changed.
pub fn clamp_midi(value: i64) -> (MidiNote, bool) {
    let clamped = value.clamp(0, MIDI_MAX as i64) as MidiNote;
    (clamped, clamped as i64 != value)
}

/// Number of distinct `(low_note, high_note)` pairs, the format's keygroup unit.
pub fn count_keygroups(mappings: &[SampleMapping]) -> usize {
    let mut ranges: Vec<(MidiNote, MidiNote)> = mappings.iter().map(SampleMapping::key_range).collect();
    ranges.sort_unstable();
    ranges.dedup();
    ranges.len()
}

/// Pairs of indices whose key and velocity ranges both overlap.
pub fn find_overlaps(mappings: &[SampleMapping]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (i, a) in mappings.iter().enumerate() {
        for (j, b) in mappings.iter().enumerate().skip(i + 1) {
            if a.overlaps(b) && a.key_range() != b.key_range() {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// Joins a sample reference onto the program directory and folds `.`/`..` components.
/// Backslashes written by Windows tools are treated as separators.
pub fn resolve_sample_path(program_dir: &Path, reference: &str) -> PathBuf {
    let normalized = reference.trim().replace('\\', "/");
    let joined = program_dir.join(normalized);
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Expresses `sample_path` relative to `program_dir` when it lives below it,
/// otherwise returns the absolute path as-is.
pub fn relative_sample_reference(program_dir: &Path, sample_path: &Path) -> String {
    match sample_path.strip_prefix(program_dir) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => sample_path.to_string_lossy().to_string(),
    }
}
