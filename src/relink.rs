use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::RuntimeConfig;
use crate::error::Diagnostic;
use crate::firmware::FirmwareProfileProvider;
use crate::program;
use crate::repair::{is_audio_file, write_program};

/// Audio files below `search_dir`, keyed by lower-cased file name. The first hit in
/// walk order (sorted by name) wins.
pub fn index_samples(search_dir: &Path) -> Result<HashMap<String, PathBuf>> {
    if !search_dir.is_dir() {
        anyhow::bail!("Sample folder {:?} does not exist", search_dir);
    }
    let mut index = HashMap::new();
    for entry in WalkDir::new(search_dir).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_file() && is_audio_file(entry.path()) => {
                let key = entry.file_name().to_string_lossy().to_lowercase();
                index.entry(key).or_insert_with(|| entry.into_path());
            }
            Ok(_) => {}
            Err(e) => log::warn!("[Relink] Skipping unreadable entry under {:?}: {}", search_dir, e),
        }
    }
    log::debug!("[Relink] Indexed {} samples under {:?}", index.len(), search_dir);
    Ok(index)
}

#[derive(Debug, Default)]
pub struct RelinkOutcome {
    /// (old sample path, new sample path) for every mapping that was pointed elsewhere.
    pub relinked: Vec<(PathBuf, PathBuf)>,
    pub still_missing: Vec<PathBuf>,
    /// Files copied into the program's folder.
    pub copied: usize,
    pub written: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Finds replacements for the program's missing samples in `search_dir`, matching
/// file names case-insensitively. Matches are copied next to the program (unless a
/// file of that name is already there) and the program is rewritten to use them.
pub fn relink_file(
    path: &Path,
    search_dir: &Path,
    config: &RuntimeConfig,
    provider: &dyn FirmwareProfileProvider,
) -> Result<RelinkOutcome> {
    let mut parsed = program::parse(path)?;
    let mut outcome = RelinkOutcome::default();
    let missing: Vec<usize> = parsed
        .mappings
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.sample_path.exists())
        .map(|(i, _)| i)
        .collect();
    if missing.is_empty() {
        outcome.diagnostics = parsed.diagnostics;
        return Ok(outcome);
    }

    let index = index_samples(search_dir)?;
    let program_dir = program::program_dir(path)?;
    for i in missing {
        let old = parsed.mappings[i].sample_path.clone();
        let Some(found) = index.get(&parsed.mappings[i].file_name().to_lowercase()) else {
            outcome.still_missing.push(old);
            continue;
        };
        let target = program_dir.join(found.file_name().unwrap_or_default());
        if !target.exists() {
            fs::copy(found, &target).with_context(|| format!("Failed to copy {:?} to {:?}", found, target))?;
            outcome.copied += 1;
        }
        log::info!("[Relink] {:?}: {:?} -> {:?}", path, old, target);
        parsed.mappings[i].sample_path = target.clone();
        outcome.relinked.push((old, target));
    }

    let fixed: HashSet<&PathBuf> = outcome.relinked.iter().map(|(old, _)| old).collect();
    outcome.diagnostics = std::mem::take(&mut parsed.diagnostics)
        .into_iter()
        .filter(|d| !matches!(d, Diagnostic::UnresolvedSample { sample_path } if fixed.contains(sample_path)))
        .collect();

    if !outcome.relinked.is_empty() {
        let firmware = parsed.application_version.clone().unwrap_or_else(|| config.firmware.clone());
        let written = write_program(path, &parsed, &firmware, provider, config)?;
        outcome.diagnostics.extend(written);
        outcome.written = true;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::BuiltinFirmwareTable;
    use crate::note_inference::InferenceConfig;

    const PROGRAM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPCVObject>
  <Version><Application_Version>3.5.0</Application_Version></Version>
  <Program type="Keygroup">
    <ProgramName>Lost</ProgramName>
    <Instruments>
      <Instrument number="1">
        <Layers><Layer><SampleFile>Lost_C3.wav</SampleFile><RootNote>60</RootNote></Layer></Layers>
      </Instrument>
      <Instrument number="2">
        <Layers><Layer><SampleFile>Gone_C4.wav</SampleFile><RootNote>72</RootNote></Layer></Layers>
      </Instrument>
    </Instruments>
  </Program>
</MPCVObject>"#;

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            inference: InferenceConfig {
                spectral_analysis: false,
                ..InferenceConfig::default()
            },
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn missing_samples_are_found_and_copied_in() {
        let programs = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let nested = library.path().join("Expansion/Samples");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("lost_c3.WAV"), b"RIFF").unwrap();
        let path = programs.path().join("Lost.xpm");
        fs::write(&path, PROGRAM).unwrap();

        let outcome = relink_file(&path, library.path(), &config(), &BuiltinFirmwareTable).unwrap();
        let copied = programs.path().join("lost_c3.WAV");
        assert_eq!(outcome.relinked, vec![(programs.path().join("Lost_C3.wav"), copied.clone())]);
        assert_eq!(outcome.still_missing, vec![programs.path().join("Gone_C4.wav")]);
        assert_eq!(outcome.copied, 1);
        assert!(outcome.written);
        assert!(copied.exists());
        assert!(programs.path().join("Lost.xpm.bak").exists());

        let reparsed = program::parse(&path).unwrap();
        let paths: Vec<&PathBuf> = reparsed.mappings.iter().map(|m| &m.sample_path).collect();
        assert!(paths.contains(&&copied));

        // Nothing left that the library can fix.
        let again = relink_file(&path, library.path(), &config(), &BuiltinFirmwareTable).unwrap();
        assert!(again.relinked.is_empty());
        assert!(!again.written);
    }

    #[test]
    fn complete_programs_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Lost.xpm");
        fs::write(&path, PROGRAM).unwrap();
        fs::write(dir.path().join("Lost_C3.wav"), b"").unwrap();
        fs::write(dir.path().join("Gone_C4.wav"), b"").unwrap();

        let outcome = relink_file(&path, Path::new("/definitely/not/here"), &config(), &BuiltinFirmwareTable).unwrap();
        assert!(outcome.relinked.is_empty());
        assert!(!outcome.written);
        assert_eq!(fs::read_to_string(&path).unwrap(), PROGRAM);
    }
}
