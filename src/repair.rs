use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::RuntimeConfig;
use crate::error::{Diagnostic, ParseError};
use crate::firmware::FirmwareProfileProvider;
use crate::key_range::assign_grouped_ranges;
use crate::mapping::{
    MidiNote, NUM_KEYGROUPS_PARAM, ProgramParameters, SampleMapping, count_keygroups, find_overlaps,
    resolve_sample_path,
};
use crate::note_inference::{InferenceConfig, infer_root_note};
use crate::program::{self, Format, ParsedProgram};
use crate::rebuild::{self, RebuildOptions};
use crate::transpose::{MASTER_TRANSPOSE_PARAM, format_transpose, stale_master_transpose};

pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "aif", "aiff", "flac"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteChange {
    pub sample_path: PathBuf,
    pub old_root: MidiNote,
    pub new_root: MidiNote,
}

#[derive(Debug, Default)]
pub struct NoteRepair {
    pub changes: Vec<NoteChange>,
    /// Notes that were inferred, whether or not they changed anything.
    pub inferred: Vec<(PathBuf, MidiNote)>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Re-infers every root note. When any root moves, key ranges are recomputed with
/// one entry per existing key-range group. A second pass over the result finds nothing.
pub fn repair_root_notes(mappings: &mut [SampleMapping], config: &InferenceConfig, fallback: MidiNote) -> NoteRepair {
    let mut report = NoteRepair::default();
    for mapping in mappings.iter_mut() {
        match infer_root_note(&mapping.sample_path, config) {
            Some(note) => {
                report.inferred.push((mapping.sample_path.clone(), note));
                if note != mapping.root_note {
                    report.changes.push(NoteChange {
                        sample_path: mapping.sample_path.clone(),
                        old_root: mapping.root_note,
                        new_root: note,
                    });
                    mapping.root_note = note;
                }
            }
            None => report.diagnostics.push(Diagnostic::AmbiguousNoteInference {
                sample_path: mapping.sample_path.clone(),
                fallback,
            }),
        }
    }

    if !report.changes.is_empty() {
        let mut groups: BTreeMap<(MidiNote, MidiNote), Vec<usize>> = BTreeMap::new();
        for (index, mapping) in mappings.iter().enumerate() {
            groups.entry(mapping.key_range()).or_default().push(index);
        }
        let groups: Vec<Vec<usize>> = groups.into_values().collect();
        assign_grouped_ranges(mappings, &groups);
    }
    report
}

/// `InconsistentKeygroupCount` when the declared count disagrees with the mappings.
pub fn check_keygroup_count(parameters: &ProgramParameters, mappings: &[SampleMapping]) -> Option<Diagnostic> {
    let declared = parameters
        .get(NUM_KEYGROUPS_PARAM)
        .and_then(|v| v.trim().parse::<usize>().ok());
    let actual = count_keygroups(mappings);
    match declared {
        Some(declared) if declared == actual => None,
        Some(_) => Some(Diagnostic::InconsistentKeygroupCount { declared, actual }),
        None if parameters.contains_key(NUM_KEYGROUPS_PARAM) => {
            Some(Diagnostic::InconsistentKeygroupCount { declared: None, actual })
        }
        None => None,
    }
}

pub fn is_audio_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("._"));
    !hidden
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Audio files directly inside `program_dir` that no mapping points at, sorted by name.
/// Paths are folded the same way mapping paths are, so the two compare equal.
pub fn find_unreferenced_samples(program_dir: &Path, mappings: &[SampleMapping]) -> Result<Vec<PathBuf>> {
    let referenced: HashSet<&Path> = mappings.iter().map(|m| m.sample_path.as_path()).collect();
    let mut found = Vec::new();
    for entry in WalkDir::new(program_dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to list {:?}", program_dir))?;
        if !entry.file_type().is_file() || !is_audio_file(entry.path()) {
            continue;
        }
        let path = resolve_sample_path(program_dir, &entry.file_name().to_string_lossy());
        if !referenced.contains(path.as_path()) {
            found.push(path);
        }
    }
    Ok(found)
}

#[derive(Debug, Default)]
pub struct Reconciliation {
    pub added: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Appends unreferenced audio files as single-key mappings and rewrites the declared
/// keygroup count to match.
pub fn reconcile_keygroups(
    mappings: &mut Vec<SampleMapping>,
    parameters: &mut ProgramParameters,
    program_dir: &Path,
    config: &InferenceConfig,
    fallback: MidiNote,
) -> Result<Reconciliation> {
    let mut report = Reconciliation::default();
    for path in find_unreferenced_samples(program_dir, mappings)? {
        let root = infer_root_note(&path, config).unwrap_or_else(|| {
            report.diagnostics.push(Diagnostic::AmbiguousNoteInference {
                sample_path: path.clone(),
                fallback,
            });
            fallback
        });
        log::info!("[Reconcile] Adding {:?} at root {}", path, root);
        mappings.push(SampleMapping::single_key(path.clone(), root));
        report.added.push(path);
    }
    parameters.insert(NUM_KEYGROUPS_PARAM.to_string(), count_keygroups(mappings).to_string());
    Ok(report)
}

/// Copies `path` to `<path>.bak` unless a backup already exists.
pub fn backup_once(path: &Path) -> Result<Option<PathBuf>> {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    let backup = PathBuf::from(name);
    if backup.exists() {
        return Ok(None);
    }
    fs::copy(path, &backup).with_context(|| format!("Failed to back up {:?}", path))?;
    log::info!("[Backup] {:?} -> {:?}", path, backup);
    Ok(Some(backup))
}

fn program_name(path: &Path, parsed: &ParsedProgram) -> String {
    parsed.program_name.clone().unwrap_or_else(|| {
        path.file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    })
}

/// Regenerates `parsed` into `path` for `firmware`, after a one-time backup.
pub fn write_program(
    path: &Path,
    parsed: &ParsedProgram,
    firmware: &str,
    provider: &dyn FirmwareProfileProvider,
    config: &RuntimeConfig,
) -> Result<Vec<Diagnostic>> {
    let mut options = RebuildOptions::new(firmware, program::program_dir(path)?);
    options.engine = config.engine;
    options.emit_instruments = config.emit_instruments;
    let document = rebuild::rebuild(&program_name(path, parsed), &parsed.mappings, provider, &parsed.parameters, &options)?;
    if config.backup {
        backup_once(path)?;
    }
    document.write(path)?;
    Ok(document.diagnostics)
}

#[derive(Debug)]
pub struct FixNotesOutcome {
    pub changes: Vec<NoteChange>,
    /// Previous master transpose, when it was reset to zero.
    pub transpose_reset: Option<f64>,
    pub wav_files_updated: usize,
    pub written: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// The `fix-notes` workflow for one program file.
pub fn fix_notes_file(
    path: &Path,
    config: &RuntimeConfig,
    provider: &dyn FirmwareProfileProvider,
) -> Result<FixNotesOutcome> {
    let mut parsed = program::parse(path)?;
    let repair = repair_root_notes(&mut parsed.mappings, &config.inference, config.fallback_root_note);
    let mut diagnostics = std::mem::take(&mut parsed.diagnostics);
    diagnostics.extend(repair.diagnostics);

    let mut wav_files_updated = 0;
    if config.update_wav {
        for (sample, note) in &repair.inferred {
            let is_wav = sample
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
            if !is_wav || !sample.exists() {
                continue;
            }
            match crate::wav::write_wav_root_note(sample, *note) {
                Ok(true) => wav_files_updated += 1,
                Ok(false) => {}
                Err(e) => log::warn!("[FixNotes] Could not tag {:?}: {:#}", sample, e),
            }
        }
    }

    let written = !repair.changes.is_empty();
    let mut transpose_reset = None;
    if written {
        let firmware = parsed.application_version.clone().unwrap_or_else(|| config.firmware.clone());
        parsed
            .parameters
            .insert(NUM_KEYGROUPS_PARAM.to_string(), count_keygroups(&parsed.mappings).to_string());
        transpose_reset = stale_master_transpose(&parsed.parameters, &repair.changes);
        if let Some(old) = transpose_reset {
            log::info!("[FixNotes] {:?}: master transpose {} compensated the old roots, resetting", path, old);
            parsed
                .parameters
                .insert(MASTER_TRANSPOSE_PARAM.to_string(), format_transpose(0.0));
        }
        diagnostics.extend(write_program(path, &parsed, &firmware, provider, config)?);
        log::info!("[FixNotes] {:?}: {} root notes changed", path, repair.changes.len());
    }

    Ok(FixNotesOutcome {
        changes: repair.changes,
        transpose_reset,
        wav_files_updated,
        written,
        diagnostics,
    })
}

#[derive(Debug)]
pub struct RebuildOutcome {
    pub format: Format,
    pub firmware: String,
    pub mappings: usize,
    pub keygroups: usize,
    pub added_samples: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

/// The `rebuild` workflow: re-emit a program for the configured firmware, optionally
/// pulling unreferenced samples in first.
pub fn rebuild_file(path: &Path, config: &RuntimeConfig, provider: &dyn FirmwareProfileProvider) -> Result<RebuildOutcome> {
    let mut parsed = program::parse(path)?;
    let mut diagnostics = std::mem::take(&mut parsed.diagnostics);
    diagnostics.extend(check_keygroup_count(&parsed.parameters, &parsed.mappings));

    let mut added_samples = Vec::new();
    if config.reconcile_keygroups {
        let reconciliation = reconcile_keygroups(
            &mut parsed.mappings,
            &mut parsed.parameters,
            &program::program_dir(path)?,
            &config.inference,
            config.fallback_root_note,
        )?;
        diagnostics.extend(reconciliation.diagnostics);
        added_samples = reconciliation.added;
    }
    if parsed.mappings.is_empty() {
        anyhow::bail!("{:?} has no sample mappings to rebuild", path);
    }

    diagnostics.extend(write_program(path, &parsed, &config.firmware, provider, config)?);
    Ok(RebuildOutcome {
        format: parsed.format,
        firmware: config.firmware.clone(),
        mappings: parsed.mappings.len(),
        keygroups: count_keygroups(&parsed.mappings),
        added_samples,
        diagnostics,
    })
}

#[derive(Debug)]
pub struct ValidationReport {
    pub format: Format,
    pub application_version: Option<String>,
    pub mapping_count: usize,
    pub keygroup_count: usize,
    pub overlaps: Vec<(usize, usize)>,
    /// Referenced samples that are not on disk.
    pub missing_samples: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
    pub valid: bool,
}

/// Checks a program without modifying it. A program is invalid when it maps no
/// samples, or when it has a pad container that yielded no sample entries.
pub fn validate(path: &Path) -> Result<ValidationReport, ParseError> {
    let root = crate::program_xml::load_document(path)?;
    let has_container = program::find_pad_container(&root).is_some();
    let parsed = program::parse_program_document(&root, &program::program_dir(path)?);

    let mut diagnostics = parsed.diagnostics;
    diagnostics.extend(check_keygroup_count(&parsed.parameters, &parsed.mappings));
    let valid = !parsed.mappings.is_empty() && !(has_container && parsed.format != Format::Modern);

    Ok(ValidationReport {
        format: parsed.format,
        application_version: parsed.application_version,
        mapping_count: parsed.mappings.len(),
        keygroup_count: count_keygroups(&parsed.mappings),
        overlaps: find_overlaps(&parsed.mappings),
        missing_samples: parsed
            .mappings
            .iter()
            .filter(|m| !m.sample_path.exists())
            .map(|m| m.sample_path.clone())
            .collect(),
        diagnostics,
        valid,
    })
}
