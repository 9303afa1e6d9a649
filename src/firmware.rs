use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::mapping::ProgramParameters;

/// Pad-container variants, one per firmware cohort.
pub const MODERN_PADS_TAG: &str = "ProgramPads-v2.10";
pub const LEGACY_PADS_TAG: &str = "ProgramPads";
const VERSIONED_PADS_PREFIX: &str = "ProgramPads-v";

pub const FALLBACK_FIRMWARE: &str = "3.5.0";
const LEGACY_REFERENCE_FIRMWARE: &str = "2.3.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Legacy,
    Advanced,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Legacy => "legacy",
            EngineMode::Advanced => "advanced",
        }
    }
}

/// Whether an element name is a pad container: the bare legacy tag or any
/// versioned `ProgramPads-v<version>` tag.
pub fn is_pad_container_tag(tag: &str) -> bool {
    tag == LEGACY_PADS_TAG
        || tag
            .strip_prefix(VERSIONED_PADS_PREFIX)
            .is_some_and(|version| !version.is_empty())
}

/// Everything a rebuild needs to know about one firmware release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareProfile {
    pub firmware_id: String,
    pub pad_type: u32,
    pub universal_pad: u32,
    pub engine: EngineMode,
    pub container_tag: String,
    #[serde(default)]
    pub removed_parameters: Vec<String>,
}

/// Supplies firmware profiles and default parameter sets to the rebuilder.
pub trait FirmwareProfileProvider: Send + Sync {
    /// Profile for this firmware; unknown ids resolve to the fallback profile.
    fn lookup(&self, firmware_id: &str) -> FirmwareProfile;

    fn default_program_params(&self) -> ProgramParameters;

    fn default_instrument_params(&self) -> ProgramParameters;

    /// `lookup` with the user's engine choice applied. Firmware that only runs the
    /// advanced engine keeps it even when `legacy` is requested.
    fn resolve(&self, firmware_id: &str, engine: Option<EngineMode>) -> FirmwareProfile {
        let mut profile = self.lookup(firmware_id);
        let natively_advanced = profile.engine == EngineMode::Advanced;
        let reference = match engine {
            None => return profile,
            Some(EngineMode::Advanced) => self.lookup(FALLBACK_FIRMWARE),
            Some(EngineMode::Legacy) if natively_advanced => return profile,
            Some(EngineMode::Legacy) => self.lookup(LEGACY_REFERENCE_FIRMWARE),
        };
        profile.pad_type = reference.pad_type;
        profile.universal_pad = reference.universal_pad;
        profile.engine = reference.engine;
        profile
    }
}

/// The firmware releases this tool knows about out of the box.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinFirmwareTable;

const OLD_FIRMWARE_REMOVED: &[&str] = &["KeygroupWheelToLfo2", "KeygroupAftertouchToFilter2"];

const DEFAULT_PROGRAM_PARAMS: &[(&str, &str)] = &[
    ("PortamentoTime", "0.0"),
    ("PortamentoLegato", "False"),
    ("PortamentoQuantized", "False"),
    ("MonoRetrigger", "False"),
    ("GlobalDriftSpeed", "0.0"),
    ("KeygroupMasterTranspose", "0.0"),
    ("KeygroupPitchBendRange", "2.0"),
    ("KeygroupWheelToLfo", "0.0"),
    ("KeygroupAftertouchToFilter", "0.0"),
    ("KeygroupPressureToFilter", "0.0"),
    ("KeygroupPitchBendPositiveRange", "2"),
    ("KeygroupPitchBendNegativeRange", "2"),
    ("KeygroupLegacyMode", "False"),
    ("KeygroupWheelToLfo2", "0.0"),
    ("KeygroupAftertouchToFilter2", "0.0"),
    ("KeygroupTimbreShift", "0"),
    ("AmpEnvGlobal", "False"),
    ("FltEnvGlobal", "False"),
    ("PitchEnvGlobal", "False"),
    ("AuxEnvGlobal", "False"),
    ("StackProcessorMode", "0"),
    ("UnisonMode", "0"),
    ("UnisonVoices", "0"),
    ("UnisonDetune", "0.0"),
    ("UnisonSpread", "0.0"),
    ("HarmoniserMix", "0.5"),
];

const DEFAULT_INSTRUMENT_PARAMS: &[(&str, &str)] = &[
    ("Volume", "1.0"),
    ("Pan", "0.5"),
    ("Tune", "0.0"),
    ("MuteGroup", "0"),
    ("VoiceOverlap", "Poly"),
    ("VolumeAttack", "0.0"),
    ("VolumeDecay", "0.0"),
    ("VolumeSustain", "1.0"),
    ("VolumeRelease", "0.05"),
    ("FilterType", "Off"),
    ("Cutoff", "1.0"),
    ("Resonance", "0.0"),
    ("FilterKeytrack", "0.0"),
    ("FilterAttack", "0.0"),
    ("FilterDecay", "0.0"),
    ("FilterSustain", "1.0"),
    ("FilterRelease", "0.0"),
    ("FilterEnvAmount", "0.0"),
];

fn to_params(pairs: &[(&str, &str)]) -> ProgramParameters {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

impl FirmwareProfileProvider for BuiltinFirmwareTable {
    fn lookup(&self, firmware_id: &str) -> FirmwareProfile {
        let (firmware_id, legacy) = match firmware_id {
            "2.3.0.0" | "2.6.0.17" => (firmware_id, true),
            "3.4.0" | "3.5.0" => (firmware_id, false),
            other => {
                log::info!("[Firmware] Unknown firmware '{}', using {}", other, FALLBACK_FIRMWARE);
                (FALLBACK_FIRMWARE, false)
            }
        };
        if legacy {
            FirmwareProfile {
                firmware_id: firmware_id.to_string(),
                pad_type: 1,
                universal_pad: 32512,
                engine: EngineMode::Legacy,
                container_tag: LEGACY_PADS_TAG.to_string(),
                removed_parameters: OLD_FIRMWARE_REMOVED.iter().map(|s| s.to_string()).collect(),
            }
        } else {
            FirmwareProfile {
                firmware_id: firmware_id.to_string(),
                pad_type: 4,
                universal_pad: 6238976,
                engine: EngineMode::Advanced,
                container_tag: MODERN_PADS_TAG.to_string(),
                removed_parameters: Vec::new(),
            }
        }
    }

    fn default_program_params(&self) -> ProgramParameters {
        to_params(DEFAULT_PROGRAM_PARAMS)
    }

    fn default_instrument_params(&self) -> ProgramParameters {
        to_params(DEFAULT_INSTRUMENT_PARAMS)
    }
}

/// A firmware table read from JSON, for setups the builtin table does not cover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonFirmwareTable {
    pub fallback: String,
    pub profiles: Vec<FirmwareProfile>,
    #[serde(default)]
    pub program_defaults: ProgramParameters,
    #[serde(default)]
    pub instrument_defaults: ProgramParameters,
}

impl JsonFirmwareTable {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read firmware table {:?}", path))?;
        let table: JsonFirmwareTable =
            serde_json::from_str(&text).with_context(|| format!("Invalid firmware table {:?}", path))?;
        if !table.profiles.iter().any(|p| p.firmware_id == table.fallback) {
            return Err(anyhow!(
                "Firmware table {:?} has no profile for its fallback '{}'",
                path,
                table.fallback
            ));
        }
        // The parser only finds containers under these tags, anything else could
        // never be read back.
        if let Some(profile) = table.profiles.iter().find(|p| !is_pad_container_tag(&p.container_tag)) {
            return Err(anyhow!(
                "Firmware table {:?}: profile '{}' uses container tag '{}', expected ProgramPads or ProgramPads-v<version>",
                path,
                profile.firmware_id,
                profile.container_tag
            ));
        }
        Ok(table)
    }
}

impl FirmwareProfileProvider for JsonFirmwareTable {
    fn lookup(&self, firmware_id: &str) -> FirmwareProfile {
        let found = self
            .profiles
            .iter()
            .find(|p| p.firmware_id == firmware_id)
            .or_else(|| {
                log::info!("[Firmware] Unknown firmware '{}', using {}", firmware_id, self.fallback);
                self.profiles.iter().find(|p| p.firmware_id == self.fallback)
            })
            .or_else(|| self.profiles.first());
        match found {
            Some(profile) => profile.clone(),
            None => BuiltinFirmwareTable.lookup(firmware_id),
        }
    }

    fn default_program_params(&self) -> ProgramParameters {
        self.program_defaults.clone()
    }

    fn default_instrument_params(&self) -> ProgramParameters {
        self.instrument_defaults.clone()
    }
}

/// The builtin table, or the JSON one when a path is configured.
pub fn provider_from_config(table: Option<&Path>) -> Result<Box<dyn FirmwareProfileProvider>> {
    match table {
        Some(path) => Ok(Box::new(JsonFirmwareTable::load(path)?)),
        None => Ok(Box::new(BuiltinFirmwareTable)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_cohorts() {
        let old = BuiltinFirmwareTable.lookup("2.6.0.17");
        assert_eq!((old.pad_type, old.universal_pad, old.engine), (1, 32512, EngineMode::Legacy));
        assert_eq!(old.container_tag, LEGACY_PADS_TAG);
        assert!(old.removed_parameters.contains(&"KeygroupWheelToLfo2".to_string()));

        let new = BuiltinFirmwareTable.lookup("3.4.0");
        assert_eq!((new.pad_type, new.universal_pad, new.engine), (4, 6238976, EngineMode::Advanced));
        assert_eq!(new.container_tag, MODERN_PADS_TAG);
        assert!(new.removed_parameters.is_empty());
    }

    #[test]
    fn unknown_firmware_falls_back() {
        assert_eq!(BuiltinFirmwareTable.lookup("9.9.9").firmware_id, FALLBACK_FIRMWARE);
    }

    #[test]
    fn engine_overrides() {
        let table = BuiltinFirmwareTable;
        let forced = table.resolve("2.3.0.0", Some(EngineMode::Advanced));
        assert_eq!((forced.pad_type, forced.universal_pad, forced.engine), (4, 6238976, EngineMode::Advanced));
        assert_eq!(forced.container_tag, LEGACY_PADS_TAG);

        let stays = table.resolve("3.5.0", Some(EngineMode::Legacy));
        assert_eq!(stays.engine, EngineMode::Advanced);
        assert_eq!(stays.pad_type, 4);

        let legacy = table.resolve("2.6.0.17", Some(EngineMode::Legacy));
        assert_eq!((legacy.pad_type, legacy.engine), (1, EngineMode::Legacy));
        assert_eq!(table.resolve("3.4.0", None), table.lookup("3.4.0"));
    }

    #[test]
    fn json_table_substitutes_fixtures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.json");
        fs::write(
            &path,
            r#"{
                "fallback": "1.0",
                "profiles": [
                    {"firmware_id": "1.0", "pad_type": 7, "universal_pad": 99,
                     "engine": "legacy", "container_tag": "ProgramPads"}
                ],
                "program_defaults": {"HarmoniserMix": "0.25"}
            }"#,
        )
        .unwrap();
        let table = JsonFirmwareTable::load(&path).unwrap();
        let profile = table.lookup("whatever");
        assert_eq!(profile.pad_type, 7);
        assert_eq!(table.default_program_params().get("HarmoniserMix").map(String::as_str), Some("0.25"));
        assert!(table.default_instrument_params().is_empty());
    }

    #[test]
    fn json_table_without_its_fallback_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.json");
        fs::write(&path, r#"{"fallback": "x", "profiles": []}"#).unwrap();
        assert!(JsonFirmwareTable::load(&path).is_err());
    }

    #[test]
    fn container_tags_accept_any_version() {
        assert!(is_pad_container_tag("ProgramPads"));
        assert!(is_pad_container_tag("ProgramPads-v2.10"));
        assert!(is_pad_container_tag("ProgramPads-v2.11"));
        assert!(!is_pad_container_tag("ProgramPads-v"));
        assert!(!is_pad_container_tag("Pads"));
        assert!(!is_pad_container_tag("ProgramPadsExtra"));
    }

    #[test]
    fn json_table_with_unreadable_container_tag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.json");
        fs::write(
            &path,
            r#"{
                "fallback": "4.0",
                "profiles": [
                    {"firmware_id": "4.0", "pad_type": 4, "universal_pad": 6238976,
                     "engine": "advanced", "container_tag": "PadMap"}
                ]
            }"#,
        )
        .unwrap();
        let err = JsonFirmwareTable::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("PadMap"));
    }
}
