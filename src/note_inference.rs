use anyhow::Result;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use crate::mapping::{MIDI_MAX, MidiNote};
use crate::note_name::note_to_midi;
use crate::{spectral, wav};

/// Settings for the inference chain, built from the runtime config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceConfig {
    pub spectral_analysis: bool,
    pub analysis_seconds: f32,
    pub silence_threshold: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            spectral_analysis: true,
            analysis_seconds: 1.0,
            silence_threshold: 1e-4,
        }
    }
}

/// One detector in the chain. `DetectionStage::ORDER` is the precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStage {
    EmbeddedMetadata,
    Filename,
    Spectral,
}

impl DetectionStage {
    pub const ORDER: [DetectionStage; 3] = [
        DetectionStage::EmbeddedMetadata,
        DetectionStage::Filename,
        DetectionStage::Spectral,
    ];

    /// Runs this stage alone. `Err` means the source could not be read, which the
    /// chain treats the same as no match.
    pub fn try_detect(self, path: &Path, config: &InferenceConfig) -> Result<Option<MidiNote>> {
        match self {
            DetectionStage::EmbeddedMetadata => wav::read_embedded_root_note(path),
            DetectionStage::Filename => Ok(infer_from_filename(path)),
            DetectionStage::Spectral => {
                if !config.spectral_analysis {
                    return Ok(None);
                }
                spectral::estimate_root_note(path, config.analysis_seconds, config.silence_threshold)
            }
        }
    }
}

impl fmt::Display for DetectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectionStage::EmbeddedMetadata => "embedded metadata",
            DetectionStage::Filename => "filename",
            DetectionStage::Spectral => "spectral",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Detected(MidiNote),
    NoMatch,
    Unreadable(String),
}

/// Result of every stage, used by the `infer` command to show its work.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceTrace {
    pub outcomes: Vec<(DetectionStage, StageOutcome)>,
}

impl InferenceTrace {
    /// The winning note: the first stage, in precedence order, that detected one.
    pub fn note(&self) -> Option<MidiNote> {
        self.outcomes.iter().find_map(|(_, outcome)| match outcome {
            StageOutcome::Detected(note) => Some(*note),
            _ => None,
        })
    }
}

/// Best-guess root note for a sample, stopping at the first stage that succeeds.
pub fn infer_root_note(path: &Path, config: &InferenceConfig) -> Option<MidiNote> {
    for stage in DetectionStage::ORDER {
        match stage.try_detect(path, config) {
            Ok(Some(note)) => {
                log::debug!("[infer_root_note] {:?}: {} -> {}", path, stage, note);
                return Some(note);
            }
            Ok(None) => {}
            Err(e) => log::debug!("[infer_root_note] {:?}: {} stage failed: {:#}", path, stage, e),
        }
    }
    None
}

/// Runs all stages regardless of earlier successes.
pub fn trace_root_note(path: &Path, config: &InferenceConfig) -> InferenceTrace {
    let outcomes = DetectionStage::ORDER
        .into_iter()
        .map(|stage| {
            let outcome = match stage.try_detect(path, config) {
                Ok(Some(note)) => StageOutcome::Detected(note),
                Ok(None) => StageOutcome::NoMatch,
                Err(e) => StageOutcome::Unreadable(format!("{:#}", e)),
            };
            (stage, outcome)
        })
        .collect();
    InferenceTrace { outcomes }
}

// mtmonch library names are consistently off from true pitch; these are the
// observed roots, not a formula.
const MTMONCH_ROOTS: &[(&str, MidiNote)] = &[
    ("g2", 44),
    ("g#2", 45),
    ("a2", 46),
    ("a#2", 47),
    ("b2", 48),
    ("c3", 49),
    ("c#3", 50),
    ("d3", 51),
    ("d#3", 52),
    ("e3", 53),
    ("e#3", 54),
    ("f3", 55),
    ("g3", 56),
    ("g#3", 57),
    ("a3", 58),
    ("a#3", 59),
    ("b3", 60),
    ("c4", 61),
    ("c#4", 62),
    ("d4", 63),
    ("d#4", 64),
    ("e4", 65),
    ("e#4", 66),
    ("f4", 67),
    ("g4", 68),
    ("g#4", 69),
    ("a4", 70),
    ("a#4", 71),
    ("b4", 72),
    ("c5", 73),
    ("c#5", 74),
    ("d5", 75),
    ("d#5", 76),
    ("e5", 77),
    ("e#5", 78),
];

/// MPC exports name samples `<take>_<NNN>_<note>`; the real root is NNN + 1.
const MPC_POSITIONAL_OFFSET: u8 = 1;

fn mtmonch_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^mtmonch([a-g]#?\d)$").expect("invalid regex pattern"))
}

fn mpc_positional_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:^|[^0-9a-z])\d+_(\d{3})_[a-g][#b]?-?\d$").expect("invalid regex pattern")
    })
}

#[derive(Debug, PartialEq, Eq)]
enum VendorMatch {
    Root(MidiNote),
    /// The name follows a vendor convention but the token is not in its table.
    Unknown,
}

fn vendor_idiom(stem: &str) -> Option<VendorMatch> {
    if stem.to_ascii_lowercase().starts_with("mtmonch") {
        let root = mtmonch_regex().captures(stem).and_then(|caps| {
            let token = caps[1].to_ascii_lowercase();
            MTMONCH_ROOTS.iter().find(|(name, _)| *name == token).map(|(_, root)| *root)
        });
        return Some(root.map_or(VendorMatch::Unknown, VendorMatch::Root));
    }
    let caps = mpc_positional_regex().captures(stem)?;
    let index: u16 = caps[1].parse().ok()?;
    let root = index + MPC_POSITIONAL_OFFSET as u16;
    Some(if root <= MIDI_MAX as u16 {
        VendorMatch::Root(root as MidiNote)
    } else {
        VendorMatch::Unknown
    })
}

/// Infers a root from the file name alone. Vendor idioms win, then the rightmost
/// note-name token, then the rightmost standalone 2-3 digit MIDI number.
pub fn infer_from_filename(path: &Path) -> Option<MidiNote> {
    let stem = path.file_stem()?.to_str()?;
    match vendor_idiom(stem) {
        Some(VendorMatch::Root(root)) => return Some(root),
        Some(VendorMatch::Unknown) => {
            log::warn!("[infer_from_filename] {:?} looks like a vendor naming scheme with an unknown token", stem);
            return None;
        }
        None => {}
    }
    rightmost_note_name(stem).or_else(|| rightmost_midi_number(stem))
}

/// Scans for `<letter>[#|b|B][-]<octave>` tokens. A token must start at a word
/// boundary or a lower-to-upper case change, and must not run into more digits.
fn rightmost_note_name(stem: &str) -> Option<MidiNote> {
    let chars: Vec<char> = stem.chars().collect();
    let mut found = None;
    for start in 0..chars.len() {
        let at_boundary = match start.checked_sub(1).map(|i| chars[i]) {
            None => true,
            Some(prev) => !prev.is_alphabetic() || (prev.is_lowercase() && chars[start].is_uppercase()),
        };
        if at_boundary && let Some(note) = note_token_at(&chars, start) {
            found = Some(note);
        }
    }
    found
}

fn note_token_at(chars: &[char], start: usize) -> Option<MidiNote> {
    let letter = *chars.get(start)?;
    if !matches!(letter.to_ascii_uppercase(), 'A'..='G') {
        return None;
    }
    let mut pos = start + 1;
    let accidental = match chars.get(pos) {
        Some(&c @ ('#' | 'b' | 'B')) => {
            pos += 1;
            Some(c)
        }
        _ => None,
    };
    let negative = chars.get(pos) == Some(&'-');
    if negative {
        pos += 1;
    }
    let digit = chars.get(pos)?.to_digit(10)? as i32;
    if chars.get(pos + 1).is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }
    let octave = if negative { -digit } else { digit };
    note_to_midi(letter, accidental, octave)
}

fn rightmost_midi_number(stem: &str) -> Option<MidiNote> {
    stem.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| (2..=3).contains(&token.len()) && token.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|token| token.parse::<u16>().ok())
        .filter(|n| *n <= MIDI_MAX as u16)
        .last()
        .map(|n| n as MidiNote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;
    use std::path::PathBuf;

    fn name(n: &str) -> Option<MidiNote> {
        infer_from_filename(Path::new(n))
    }

    fn no_spectral() -> InferenceConfig {
        InferenceConfig {
            spectral_analysis: false,
            ..InferenceConfig::default()
        }
    }

    fn write_sine(path: &Path, freq: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..44100 {
            let s = 0.5 * (2.0 * PI * freq * i as f32 / 44100.0).sin();
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn plain_note_names() {
        assert_eq!(name("sample_c3.wav"), Some(60));
        assert_eq!(name("sample_cb3.wav"), Some(59));
        assert_eq!(name("Piano-F#2.wav"), Some(54));
        assert_eq!(name("bass_a-1.aif"), Some(21));
        assert_eq!(name("StringsC3"), Some(60));
    }

    #[test]
    fn note_names_beat_numbers_and_rightmost_wins() {
        assert_eq!(name("take_12_C3.wav"), Some(60));
        assert_eq!(name("C2_to_E3.wav"), Some(64));
        assert_eq!(name("Pad 064.wav"), Some(64));
        assert_eq!(name("Pad_30_72.wav"), Some(72));
        assert_eq!(name("Kick_200.wav"), None);
    }

    #[test]
    fn words_do_not_look_like_notes() {
        assert_eq!(name("grab3.wav"), None);
        assert_eq!(name("cello_E10.wav"), None);
        assert_eq!(name("ambient.wav"), None);
    }

    #[test]
    fn mtmonch_table_is_exact() {
        assert_eq!(name("mtmonchg2.wav"), Some(44));
        assert_eq!(name("mtmonchb3.wav"), Some(60));
        assert_eq!(name("mtmonchf4.wav"), Some(67));
        assert_eq!(name("MTMONCHE#5.wav"), Some(78));
        assert_eq!(name("mtmonchf5.wav"), None);
    }

    #[test]
    fn mpc_positional_names_are_shifted_by_one() {
        assert_eq!(name("1_021_a-1.wav"), Some(22));
        assert_eq!(name("0_024_c0.wav"), Some(25));
        assert_eq!(name("0_027_d#0.wav"), Some(28));
    }

    #[test]
    fn embedded_metadata_beats_filename_and_spectrum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample_c3.wav");
        write_sine(&path, 440.0);
        wav::write_wav_root_note(&path, 50).unwrap();
        assert_eq!(infer_root_note(&path, &InferenceConfig::default()), Some(50));
    }

    #[test]
    fn filename_beats_spectrum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample_c3.wav");
        write_sine(&path, 440.0);
        assert_eq!(infer_root_note(&path, &InferenceConfig::default()), Some(60));

        let trace = trace_root_note(&path, &InferenceConfig::default());
        assert_eq!(trace.outcomes[0], (DetectionStage::EmbeddedMetadata, StageOutcome::NoMatch));
        assert_eq!(trace.outcomes[1], (DetectionStage::Filename, StageOutcome::Detected(60)));
        assert_eq!(trace.outcomes[2], (DetectionStage::Spectral, StageOutcome::Detected(69)));
        assert_eq!(trace.note(), Some(60));
    }

    #[test]
    fn spectrum_is_the_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_sine(&path, 440.0);
        assert_eq!(infer_root_note(&path, &InferenceConfig::default()), Some(69));
        assert_eq!(infer_root_note(&path, &no_spectral()), None);
    }

    #[test]
    fn missing_file_still_uses_the_name() {
        let path = PathBuf::from("/nonexistent/dir/sample_c3.wav");
        assert_eq!(infer_root_note(&path, &InferenceConfig::default()), Some(60));
        assert_eq!(infer_root_note(Path::new("/nonexistent/noise.wav"), &InferenceConfig::default()), None);
    }
}
