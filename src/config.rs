use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::firmware::{EngineMode, FALLBACK_FIRMWARE, JsonFirmwareTable};
use crate::mapping::{DEFAULT_ROOT_NOTE, MIDI_MAX, MidiNote};
use crate::note_inference::InferenceConfig;
use crate::note_name::name_to_midi;

const APP_NAME: &str = "rusty-keygroups";
const CONFIG_NAME: &str = "settings";

/// Settings that are saved to the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub default_firmware: String,
    pub engine_override: Option<EngineMode>,
    pub fallback_root_note: MidiNote,
    pub spectral_analysis: bool,
    pub analysis_seconds: f32,
    pub silence_threshold: f32,
    pub backup: bool,
    pub emit_instruments: bool,
    pub reconcile_keygroups: bool,
    pub firmware_table: Option<PathBuf>,
}

/// Default settings for a new installation.
impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_firmware: FALLBACK_FIRMWARE.to_string(),
            engine_override: None,
            fallback_root_note: DEFAULT_ROOT_NOTE,
            spectral_analysis: true,
            analysis_seconds: 1.0,
            silence_threshold: 1e-4,
            backup: true,
            emit_instruments: true,
            reconcile_keygroups: false,
            firmware_table: None,
        }
    }
}

/// Settings for one run: saved settings merged with command line flags.
/// This is *not* saved to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    // --- Saved Settings ---
    pub firmware: String,
    pub engine: Option<EngineMode>,
    pub fallback_root_note: MidiNote,
    pub inference: InferenceConfig,
    pub backup: bool,
    pub emit_instruments: bool,
    pub reconcile_keygroups: bool,
    pub firmware_table: Option<PathBuf>,

    // --- Runtime-Only Settings ---
    pub update_wav: bool,
}

impl RuntimeConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            firmware: settings.default_firmware.clone(),
            engine: settings.engine_override,
            fallback_root_note: settings.fallback_root_note.min(crate::mapping::MIDI_MAX),
            inference: InferenceConfig {
                spectral_analysis: settings.spectral_analysis,
                analysis_seconds: settings.analysis_seconds.max(0.05),
                silence_threshold: settings.silence_threshold.max(0.0),
            },
            backup: settings.backup,
            emit_instruments: settings.emit_instruments,
            reconcile_keygroups: settings.reconcile_keygroups,
            firmware_table: settings.firmware_table.clone(),
            update_wav: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_settings(&AppSettings::default())
    }
}

/// Loads settings from disk.
pub fn load_settings() -> Result<AppSettings> {
    let settings: AppSettings = confy::load(APP_NAME, CONFIG_NAME)?;
    Ok(settings)
}

/// Saves settings to disk.
pub fn save_settings(settings: &AppSettings) -> Result<()> {
    confy::store(APP_NAME, CONFIG_NAME, settings)?;
    Ok(())
}

pub fn settings_path() -> Result<PathBuf> {
    Ok(confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)?)
}

/// A note given as a name (`C3`, `F#-1`) or a MIDI number.
pub fn parse_note(text: &str) -> Result<MidiNote, String> {
    let text = text.trim();
    if let Some(note) = name_to_midi(text) {
        return Ok(note);
    }
    match text.parse::<u8>() {
        Ok(note) if note <= MIDI_MAX => Ok(note),
        _ => Err(format!("'{}' is neither a note name nor a MIDI note 0-127", text)),
    }
}

/// Changes to the saved settings requested on the command line.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub firmware: Option<String>,
    pub engine: Option<EngineMode>,
    pub clear_engine: bool,
    pub fallback_root_note: Option<MidiNote>,
    pub spectral_analysis: Option<bool>,
    pub backup: Option<bool>,
    pub emit_instruments: Option<bool>,
    pub reconcile_keygroups: Option<bool>,
    pub firmware_table: Option<PathBuf>,
    pub clear_firmware_table: bool,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.firmware.is_none()
            && self.engine.is_none()
            && !self.clear_engine
            && self.fallback_root_note.is_none()
            && self.spectral_analysis.is_none()
            && self.backup.is_none()
            && self.emit_instruments.is_none()
            && self.reconcile_keygroups.is_none()
            && self.firmware_table.is_none()
            && !self.clear_firmware_table
    }

    /// Applies the update. A firmware table is loaded once so a broken file is
    /// rejected before it is saved.
    pub fn apply(&self, settings: &mut AppSettings) -> Result<()> {
        if let Some(firmware) = &self.firmware {
            if firmware.trim().is_empty() {
                bail!("Firmware version must not be empty");
            }
            settings.default_firmware = firmware.trim().to_string();
        }
        if self.clear_engine {
            settings.engine_override = None;
        }
        if self.engine.is_some() {
            settings.engine_override = self.engine;
        }
        if let Some(note) = self.fallback_root_note {
            settings.fallback_root_note = note.min(MIDI_MAX);
        }
        if let Some(on) = self.spectral_analysis {
            settings.spectral_analysis = on;
        }
        if let Some(on) = self.backup {
            settings.backup = on;
        }
        if let Some(on) = self.emit_instruments {
            settings.emit_instruments = on;
        }
        if let Some(on) = self.reconcile_keygroups {
            settings.reconcile_keygroups = on;
        }
        if self.clear_firmware_table {
            settings.firmware_table = None;
        }
        if let Some(table) = &self.firmware_table {
            JsonFirmwareTable::load(table)?;
            settings.firmware_table = Some(table.clone());
        }
        Ok(())
    }
}
