use anyhow::{Result, anyhow};
use std::path::Path;

use crate::mapping::ProgramParameters;
use crate::program_xml::{self, Element};
use crate::repair::{NoteChange, backup_once};

pub const MASTER_TRANSPOSE_PARAM: &str = "KeygroupMasterTranspose";

/// Parses a `KeygroupMasterTranspose` value, `None` when absent or not a number.
pub fn master_transpose(parameters: &ProgramParameters) -> Option<f64> {
    parameters.get(MASTER_TRANSPOSE_PARAM).and_then(|v| parse_semitones(v))
}

fn parse_semitones(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Master transpose is written with six decimals, like the sampler does.
pub fn format_transpose(semitones: f64) -> String {
    format!("{:.6}", semitones)
}

/// A master transpose that only compensated for wrong root notes. When every root
/// moved by the same number of semitones and the transpose is exactly the inverse
/// of that move, it has to go back to zero. Returns the stale value.
pub fn stale_master_transpose(parameters: &ProgramParameters, changes: &[NoteChange]) -> Option<f64> {
    let transpose = master_transpose(parameters).filter(|t| *t != 0.0)?;
    let first = changes.first()?;
    let shift = first.new_root as i32 - first.old_root as i32;
    let uniform = changes
        .iter()
        .all(|c| c.new_root as i32 - c.old_root as i32 == shift);
    (uniform && (transpose + shift as f64).abs() < 1e-6).then_some(transpose)
}

/// Before and after values of one transpose edit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransposeChange {
    pub old: f64,
    pub new: f64,
}

/// The transpose element, created under `Program` when the document has none.
fn transpose_element(root: &mut Element) -> Option<&mut Element> {
    if root.find(MASTER_TRANSPOSE_PARAM).is_none() {
        let wrapped = root.name != "Program" && root.find("Program").is_some();
        if wrapped {
            root.find_mut("Program")?.push_text(MASTER_TRANSPOSE_PARAM, "");
        } else {
            root.push_text(MASTER_TRANSPOSE_PARAM, "");
        }
    }
    root.find_mut(MASTER_TRANSPOSE_PARAM)
}

/// Sets `KeygroupMasterTranspose` to `semitones`, or shifts it by that much when
/// `relative`. Only that one element changes; the rest of the document is written
/// back as read.
pub fn transpose_file(path: &Path, semitones: f64, relative: bool, backup: bool) -> Result<TransposeChange> {
    if !semitones.is_finite() {
        return Err(anyhow!("Transpose amount must be a finite number"));
    }
    let mut root = program_xml::load_document(path)?;
    let element = transpose_element(&mut root)
        .ok_or_else(|| anyhow!("{:?} has no place for {}", path, MASTER_TRANSPOSE_PARAM))?;
    let old = parse_semitones(&element.text).unwrap_or(0.0);
    let new = if relative { old + semitones } else { semitones };
    element.text = format_transpose(new);

    if backup {
        backup_once(path)?;
    }
    program_xml::write_document(&root, path)?;
    log::info!("[Transpose] {:?}: {:.1} -> {:.1} semitones", path, old, new);
    Ok(TransposeChange { old, new })
}
