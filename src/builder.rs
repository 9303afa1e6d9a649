use anyhow::{Context, Result};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

use crate::config::RuntimeConfig;
use crate::error::Diagnostic;
use crate::firmware::FirmwareProfileProvider;
use crate::key_range::assign_grouped_ranges;
use crate::mapping::{DEFAULT_ROOT_NOTE, MIDI_MAX, MidiNote, ProgramParameters, SampleMapping};
use crate::note_inference::infer_root_note;
use crate::note_name::{midi_to_name, name_to_midi};
use crate::rebuild::{self, MAX_LAYERS_PER_KEYGROUP, RebuildOptions};
use crate::repair::{backup_once, is_audio_file};
use crate::wav;

/// How the samples of a folder become programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BuildMode {
    /// One chromatic program per instrument, ranges split between roots.
    MultiSample,
    /// One program per sample, played at its own pitch across the keyboard.
    OneShot,
    /// One program per kit, one key per sample upwards from C3.
    DrumKit,
}

/// Words that name an instrument when they appear in a sample's path.
const INSTRUMENT_TAGS: &[&str] = &[
    "piano", "bell", "pad", "keys", "guitar", "bass", "lead", "pluck", "drum", "fx", "vocal", "ambient", "brass",
    "strings", "woodwind", "world", "horn",
];
const FALLBACK_PROGRAM_NAME: &str = "instrument";

/// Key and velocity placement spelled out in a file name such as `Strings_A2-B2_1-64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameMapping {
    /// Everything before the note token, the instrument the sample belongs to.
    pub group: String,
    pub low_note: MidiNote,
    pub high_note: MidiNote,
    pub velocity: Option<(MidiNote, MidiNote)>,
}

impl FilenameMapping {
    /// A single note names the root; a note range is a fixed key range.
    pub fn has_range(&self) -> bool {
        self.low_note != self.high_note
    }
}

fn layered_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(.*?)[ _-]([a-g][#b]?\d+)(?:-([a-g][#b]?\d+))?[ _-](\d{1,3})-(\d{1,3})$")
            .expect("invalid regex pattern")
    })
}

fn ranged_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(.*?)[ _-]([a-g][#b]?\d+)(?:-([a-g][#b]?\d+))?$").expect("invalid regex pattern")
    })
}

fn ordered(a: MidiNote, b: MidiNote) -> (MidiNote, MidiNote) {
    (a.min(b), a.max(b))
}

fn note_range(caps: &Captures) -> Option<(MidiNote, MidiNote)> {
    let low = name_to_midi(caps.get(2)?.as_str())?;
    let high = match caps.get(3) {
        Some(high) => name_to_midi(high.as_str())?,
        None => low,
    };
    Some(ordered(low, high))
}

/// Reads `<name>_<note>[-<note>][_<vel>-<vel>]` from a file stem. Separators may be
/// space, underscore or hyphen; note names follow the C3 = 60 convention.
pub fn parse_filename_mapping(stem: &str) -> Option<FilenameMapping> {
    let stem = stem.trim();
    if let Some(caps) = layered_name_regex().captures(stem) {
        let velocity = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok().map(|v| v.min(MIDI_MAX as u32) as MidiNote);
        if let (Some((low, high)), Some(vlo), Some(vhi)) = (note_range(&caps), velocity(4), velocity(5)) {
            return Some(FilenameMapping {
                group: caps[1].trim().to_string(),
                low_note: low,
                high_note: high,
                velocity: Some(ordered(vlo, vhi)),
            });
        }
    }
    let caps = ranged_name_regex().captures(stem)?;
    let (low, high) = note_range(&caps)?;
    Some(FilenameMapping {
        group: caps[1].trim().to_string(),
        low_note: low,
        high_note: high,
        velocity: None,
    })
}

/// Program names lose the characters file systems reject.
pub fn sanitize_program_name(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| !r#"\/*?:"<>|"#.contains(*c)).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        FALLBACK_PROGRAM_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem().unwrap_or_default().to_string_lossy().to_string()
}

/// Instrument name for grouping: the name part of a mapped file name, else an
/// instrument word in the path below `folder`, else the parent folder's name.
fn instrument_group(folder: &Path, path: &Path, mode: BuildMode) -> String {
    if mode == BuildMode::MultiSample
        && let Some(named) = parse_filename_mapping(&file_stem(path)).filter(|n| !n.group.is_empty())
    {
        return named.group;
    }
    let relative = path.strip_prefix(folder).unwrap_or(path).to_string_lossy().to_lowercase();
    if let Some(tag) = INSTRUMENT_TAGS.iter().find(|tag| relative.contains(*tag)) {
        return tag.to_string();
    }
    let parent = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().replace(['_', '-'], " "))
        .unwrap_or_default();
    let parent = parent.trim();
    if parent.is_empty() {
        FALLBACK_PROGRAM_NAME.to_string()
    } else {
        parent.to_string()
    }
}

/// Audio files in `folder` (and below it when `recursive`), sorted by name.
/// Rendered previews (`*.xpm.wav`) and resource forks are skipped.
pub fn collect_samples(folder: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut samples = Vec::new();
    for entry in WalkDir::new(folder).min_depth(1).max_depth(max_depth).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to list {:?}", folder))?;
        let preview = entry.file_name().to_string_lossy().to_lowercase().contains(".xpm.");
        if entry.file_type().is_file() && is_audio_file(entry.path()) && !preview {
            samples.push(entry.into_path());
        }
    }
    Ok(samples)
}

/// Samples per program name, in name order.
pub fn group_samples(folder: &Path, samples: &[PathBuf], mode: BuildMode) -> BTreeMap<String, Vec<PathBuf>> {
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for sample in samples {
        let name = match mode {
            BuildMode::OneShot => file_stem(sample),
            BuildMode::MultiSample | BuildMode::DrumKit => instrument_group(folder, sample, mode),
        };
        groups.entry(sanitize_program_name(&name)).or_default().push(sample.clone());
    }
    groups
}

/// Velocity band `index` of `count` equal bands over 0..=127.
pub fn velocity_split(index: usize, count: usize) -> (MidiNote, MidiNote) {
    let count = count.max(1);
    let low = index * 128 / count;
    let high = (index + 1) * 128 / count - 1;
    (low.min(127) as MidiNote, high.min(127) as MidiNote)
}

struct Planned {
    mapping: SampleMapping,
    fixed_range: bool,
    fixed_velocity: bool,
}

fn plan_sample(path: &Path, config: &RuntimeConfig, diagnostics: &mut Vec<Diagnostic>) -> Planned {
    let named = parse_filename_mapping(&file_stem(path));
    let embedded = wav::read_embedded_root_note(path).ok().flatten();
    let root = match (embedded, &named) {
        (Some(note), _) => note,
        (None, Some(named)) => named.low_note,
        (None, None) => infer_root_note(path, &config.inference).unwrap_or_else(|| {
            diagnostics.push(Diagnostic::AmbiguousNoteInference {
                sample_path: path.to_path_buf(),
                fallback: config.fallback_root_note,
            });
            config.fallback_root_note
        }),
    };

    let mut planned = Planned {
        mapping: SampleMapping::single_key(path.to_path_buf(), root),
        fixed_range: false,
        fixed_velocity: false,
    };
    if let Some(named) = named {
        if named.has_range() {
            planned.mapping.low_note = named.low_note.min(root);
            planned.mapping.high_note = named.high_note.max(root);
            planned.fixed_range = true;
        }
        if let Some((low, high)) = named.velocity {
            planned.mapping.velocity_low = low;
            planned.mapping.velocity_high = high;
            planned.fixed_velocity = true;
        }
    }
    planned
}

fn plan_multi_sample(samples: &[PathBuf], config: &RuntimeConfig) -> (Vec<SampleMapping>, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();
    let mut planned: Vec<Planned> = samples.iter().map(|s| plan_sample(s, config, &mut diagnostics)).collect();

    // Samples sharing a root without named velocities become velocity layers.
    let mut layers: BTreeMap<MidiNote, Vec<usize>> = BTreeMap::new();
    for (i, p) in planned.iter().enumerate() {
        if !p.fixed_velocity {
            layers.entry(p.mapping.root_note).or_default().push(i);
        }
    }
    let mut dropped = HashSet::new();
    for (root, members) in &layers {
        if members.len() < 2 {
            continue;
        }
        let kept = members.len().min(MAX_LAYERS_PER_KEYGROUP);
        for &i in &members[kept..] {
            diagnostics.push(Diagnostic::SkippedElement {
                element: planned[i].mapping.file_name(),
                reason: format!("more than {} velocity layers at {}", MAX_LAYERS_PER_KEYGROUP, midi_to_name(*root)),
            });
            dropped.insert(i);
        }
        for (band, &i) in members[..kept].iter().enumerate() {
            let (low, high) = velocity_split(band, kept);
            planned[i].mapping.velocity_low = low;
            planned[i].mapping.velocity_high = high;
        }
    }

    let (mut mappings, fixed): (Vec<SampleMapping>, Vec<bool>) = planned
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !dropped.contains(i))
        .map(|(_, p)| (p.mapping, p.fixed_range))
        .unzip();

    let mut by_root: BTreeMap<MidiNote, Vec<usize>> = BTreeMap::new();
    for (i, mapping) in mappings.iter().enumerate() {
        if !fixed[i] {
            by_root.entry(mapping.root_note).or_default().push(i);
        }
    }
    let groups: Vec<Vec<usize>> = by_root.into_values().collect();
    assign_grouped_ranges(&mut mappings, &groups);
    (mappings, diagnostics)
}

/// Mappings for one program's samples.
pub fn plan_mappings(samples: &[PathBuf], mode: BuildMode, config: &RuntimeConfig) -> (Vec<SampleMapping>, Vec<Diagnostic>) {
    match mode {
        BuildMode::MultiSample => plan_multi_sample(samples, config),
        BuildMode::OneShot => {
            let mappings = samples
                .iter()
                .map(|s| SampleMapping {
                    low_note: 0,
                    high_note: MIDI_MAX,
                    ..SampleMapping::single_key(s.clone(), DEFAULT_ROOT_NOTE)
                })
                .collect();
            (mappings, Vec::new())
        }
        BuildMode::DrumKit => {
            let mut mappings = Vec::new();
            let mut diagnostics = Vec::new();
            for (i, sample) in samples.iter().enumerate() {
                match u8::try_from(DEFAULT_ROOT_NOTE as usize + i).ok().filter(|n| *n <= MIDI_MAX) {
                    Some(note) => mappings.push(SampleMapping::single_key(sample.clone(), note)),
                    None => diagnostics.push(Diagnostic::SkippedElement {
                        element: sample.file_name().unwrap_or_default().to_string_lossy().to_string(),
                        reason: "no key left above the kit".to_string(),
                    }),
                }
            }
            (mappings, diagnostics)
        }
    }
}

#[derive(Debug)]
pub struct BuiltProgram {
    pub path: PathBuf,
    pub mappings: usize,
    pub keygroups: usize,
    pub diagnostics: Vec<Diagnostic>,
}

/// Creates one program per sample group in `folder`, written next to the samples.
pub fn build_folder(
    folder: &Path,
    mode: BuildMode,
    recursive: bool,
    config: &RuntimeConfig,
    provider: &dyn FirmwareProfileProvider,
) -> Result<Vec<BuiltProgram>> {
    let folder = std::path::absolute(folder).with_context(|| format!("Failed to resolve {:?}", folder))?;
    let samples = collect_samples(&folder, recursive)?;
    if samples.is_empty() {
        anyhow::bail!("No audio samples in {:?}", folder);
    }

    let mut built = Vec::new();
    for (name, files) in group_samples(&folder, &samples, mode) {
        let (mappings, mut diagnostics) = plan_mappings(&files, mode, config);
        if mappings.is_empty() {
            continue;
        }
        let mut options = RebuildOptions::new(config.firmware.clone(), folder.clone());
        options.engine = config.engine;
        options.emit_instruments = config.emit_instruments;
        let document = rebuild::rebuild(&name, &mappings, provider, &ProgramParameters::new(), &options)?;

        let path = folder.join(format!("{}.xpm", name));
        if config.backup && path.exists() {
            backup_once(&path)?;
        }
        document.write(&path)?;
        diagnostics.extend(document.diagnostics);
        for diagnostic in &diagnostics {
            diagnostic.log(&path.display().to_string());
        }
        built.push(BuiltProgram {
            path,
            mappings: mappings.len(),
            keygroups: document.keygroup_count,
            diagnostics,
        });
    }
    log::info!("[Build] {:?}: {} programs from {} samples", folder, built.len(), samples.len());
    Ok(built)
}
