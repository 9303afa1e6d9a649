// src/main.rs

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use simplelog::{Config, LevelFilter, WriteLogger};
use std::fs::File;
use std::path::{Path, PathBuf};

use rusty_keygroups::batch::{self, BatchTally};
use rusty_keygroups::builder::{self, BuildMode};
use rusty_keygroups::config::{self, RuntimeConfig, SettingsUpdate};
use rusty_keygroups::error::Diagnostic;
use rusty_keygroups::firmware::{EngineMode, FirmwareProfileProvider, provider_from_config};
use rusty_keygroups::mapping::{MidiNote, count_keygroups, relative_sample_reference};
use rusty_keygroups::note_inference::{StageOutcome, trace_root_note};
use rusty_keygroups::note_name::midi_to_name;
use rusty_keygroups::{program, relink, repair, transpose};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[value(rename_all = "lower")]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, arg_required_else_help = true)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Set the application log level
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Skip the FFT pitch estimate when inferring root notes
    #[arg(long, global = true)]
    no_spectral: bool,

    /// Do not write `.bak` copies before modifying a program
    #[arg(long, global = true)]
    no_backup: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every sample mapping and diagnostic
    Inspect {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },
    /// Check programs without modifying them
    Validate {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },
    /// Re-infer root notes and fix key ranges
    FixNotes {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Also write the inferred root into each WAV file's smpl chunk
        #[arg(long)]
        update_wav: bool,
    },
    /// Rewrite programs for a firmware version
    Rebuild {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Target firmware (e.g. 2.6.0.17, 3.5.0)
        #[arg(long, value_name = "ID")]
        firmware: Option<String>,

        #[arg(long, value_name = "MODE")]
        engine: Option<EngineMode>,

        /// Leave out the Instruments tree
        #[arg(long)]
        no_instruments: bool,

        /// Add unreferenced samples from the program's folder as new keygroups
        #[arg(long)]
        reconcile: bool,
    },
    /// Create programs from folders of samples
    Build {
        #[arg(value_name = "FOLDER", required = true)]
        folders: Vec<PathBuf>,

        #[arg(long, value_name = "MODE", default_value = "multi-sample")]
        mode: BuildMode,

        /// Include samples in subfolders
        #[arg(long)]
        recursive: bool,

        /// Target firmware (e.g. 2.6.0.17, 3.5.0)
        #[arg(long, value_name = "ID")]
        firmware: Option<String>,

        #[arg(long, value_name = "MODE")]
        engine: Option<EngineMode>,

        /// Leave out the Instruments tree
        #[arg(long)]
        no_instruments: bool,
    },
    /// Set the master transpose of programs
    Transpose {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Semitones, fractional values allowed
        #[arg(long, allow_negative_numbers = true)]
        semitones: f64,

        /// Add to the current transpose instead of replacing it
        #[arg(long)]
        relative: bool,
    },
    /// Find missing samples in a library folder and point programs at them
    Relink {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Folder searched (recursively) for the missing files
        #[arg(long, value_name = "DIR")]
        from: PathBuf,
    },
    /// Run the root note inference chain on one sample
    Infer {
        #[arg(value_name = "SAMPLE")]
        sample: PathBuf,
    },
    /// Show or change the saved settings
    Settings {
        /// Default target firmware
        #[arg(long, value_name = "ID")]
        firmware: Option<String>,

        #[arg(long, value_name = "MODE", conflicts_with = "clear_engine")]
        engine: Option<EngineMode>,

        /// Follow each firmware's own engine again
        #[arg(long)]
        clear_engine: bool,

        /// Root used when inference fails, as a name (C3) or MIDI number
        #[arg(long, value_name = "NOTE", value_parser = config::parse_note)]
        fallback_note: Option<MidiNote>,

        #[arg(long, value_name = "BOOL")]
        spectral: Option<bool>,

        #[arg(long, value_name = "BOOL")]
        backup: Option<bool>,

        #[arg(long, value_name = "BOOL")]
        instruments: Option<bool>,

        #[arg(long, value_name = "BOOL")]
        reconcile: Option<bool>,

        /// JSON firmware table used instead of the built-in profiles
        #[arg(long, value_name = "FILE", conflicts_with = "clear_firmware_table")]
        firmware_table: Option<PathBuf>,

        #[arg(long)]
        clear_firmware_table: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // --- Setup logging ---
    let log_level = match args.log_level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    };
    WriteLogger::init(log_level, Config::default(), File::create("rusty-keygroups.log")?)?;

    let mut settings = config::load_settings().unwrap_or_else(|e| {
        log::warn!("[Config] Could not load settings, using defaults: {:#}", e);
        config::AppSettings::default()
    });
    if let Ok(path) = config::settings_path() {
        log::info!("[Config] Settings file: {:?}", path);
    }
    let mut runtime = RuntimeConfig::from_settings(&settings);
    if args.no_spectral {
        runtime.inference.spectral_analysis = false;
    }
    if args.no_backup {
        runtime.backup = false;
    }

    let (action, paths) = match args.command {
        Command::Infer { sample } => return run_infer(&sample, &runtime),
        Command::Settings {
            firmware,
            engine,
            clear_engine,
            fallback_note,
            spectral,
            backup,
            instruments,
            reconcile,
            firmware_table,
            clear_firmware_table,
        } => {
            let update = SettingsUpdate {
                firmware,
                engine,
                clear_engine,
                fallback_root_note: fallback_note,
                spectral_analysis: spectral,
                backup,
                emit_instruments: instruments,
                reconcile_keygroups: reconcile,
                firmware_table,
                clear_firmware_table,
            };
            return run_settings(&mut settings, &update);
        }
        Command::Inspect { paths } => (Action::Inspect, paths),
        Command::Validate { paths } => (Action::Validate, paths),
        Command::FixNotes { paths, update_wav } => {
            runtime.update_wav = update_wav;
            (Action::FixNotes, paths)
        }
        Command::Rebuild {
            paths,
            firmware,
            engine,
            no_instruments,
            reconcile,
        } => {
            apply_target(&mut runtime, firmware, engine, no_instruments);
            runtime.reconcile_keygroups |= reconcile;
            (Action::Rebuild, paths)
        }
        Command::Build {
            folders,
            mode,
            recursive,
            firmware,
            engine,
            no_instruments,
        } => {
            apply_target(&mut runtime, firmware, engine, no_instruments);
            (Action::Build { mode, recursive }, folders)
        }
        Command::Transpose {
            paths,
            semitones,
            relative,
        } => (Action::Transpose { semitones, relative }, paths),
        Command::Relink { paths, from } => (Action::Relink { from }, paths),
    };

    let provider = provider_from_config(runtime.firmware_table.as_deref())?;
    let targets = match action {
        Action::Build { .. } => paths,
        _ => batch::collect_programs(&paths),
    };
    if targets.is_empty() {
        return Err(anyhow!("No program files found"));
    }

    let (reports, tally) = batch::run(&targets, |path| match &action {
        Action::Inspect => inspect(path),
        Action::Validate => validate(path),
        Action::FixNotes => fix_notes(path, &runtime, provider.as_ref()),
        Action::Rebuild => rebuild(path, &runtime, provider.as_ref()),
        Action::Build { mode, recursive } => build(path, *mode, *recursive, &runtime, provider.as_ref()),
        Action::Transpose { semitones, relative } => transpose(path, *semitones, *relative, runtime.backup),
        Action::Relink { from } => relink(path, from, &runtime, provider.as_ref()),
    });

    for (_, report) in &reports {
        print!("{}", report);
    }
    print_tally(&tally);
    if !tally.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

#[derive(Clone, Debug)]
enum Action {
    Inspect,
    Validate,
    FixNotes,
    Rebuild,
    Build { mode: BuildMode, recursive: bool },
    Transpose { semitones: f64, relative: bool },
    Relink { from: PathBuf },
}

fn apply_target(runtime: &mut RuntimeConfig, firmware: Option<String>, engine: Option<EngineMode>, no_instruments: bool) {
    if let Some(firmware) = firmware {
        runtime.firmware = firmware;
    }
    if engine.is_some() {
        runtime.engine = engine;
    }
    runtime.emit_instruments &= !no_instruments;
}

fn diagnostics_block(out: &mut String, diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        out.push_str(&format!("    ! {}\n", diagnostic));
    }
}

fn inspect(path: &Path) -> Result<String> {
    let parsed = program::parse(path)?;
    let dir = program::program_dir(path)?;
    let mut out = format!(
        "{} [{} format, {} mappings, {} keygroups]\n",
        path.display(),
        parsed.format,
        parsed.mappings.len(),
        count_keygroups(&parsed.mappings)
    );
    if let Some(name) = &parsed.program_name {
        out.push_str(&format!("  Program: {}\n", name));
    }
    for mapping in &parsed.mappings {
        out.push_str(&format!(
            "  {:>4} {:<5} keys {:>3}-{:<3} vel {:>3}-{:<3} {}\n",
            mapping.root_note,
            midi_to_name(mapping.root_note),
            mapping.low_note,
            mapping.high_note,
            mapping.velocity_low,
            mapping.velocity_high,
            relative_sample_reference(&dir, &mapping.sample_path)
        ));
    }
    diagnostics_block(&mut out, &parsed.diagnostics);
    Ok(out)
}

fn validate(path: &Path) -> Result<String> {
    let report = repair::validate(path)?;
    let mut out = format!(
        "{}: {} format, firmware {}, {} mappings, {} keygroups, {} overlapping pairs, {} missing samples\n",
        path.display(),
        report.format,
        report.application_version.as_deref().unwrap_or("unknown"),
        report.mapping_count,
        report.keygroup_count,
        report.overlaps.len(),
        report.missing_samples.len()
    );
    diagnostics_block(&mut out, &report.diagnostics);
    if !report.valid {
        return Err(anyhow!("{}invalid program", out));
    }
    Ok(out)
}

fn fix_notes(path: &Path, runtime: &RuntimeConfig, provider: &dyn FirmwareProfileProvider) -> Result<String> {
    let outcome = repair::fix_notes_file(path, runtime, provider)?;
    let status = if outcome.written { "rewritten" } else { "unchanged" };
    let mut out = format!("{}: {} root notes changed, {}\n", path.display(), outcome.changes.len(), status);
    for change in &outcome.changes {
        out.push_str(&format!(
            "  {} {} -> {}\n",
            change.sample_path.file_name().unwrap_or_default().to_string_lossy(),
            midi_to_name(change.old_root),
            midi_to_name(change.new_root)
        ));
    }
    if let Some(old) = outcome.transpose_reset {
        out.push_str(&format!("  master transpose {} -> 0\n", old));
    }
    if outcome.wav_files_updated > 0 {
        out.push_str(&format!("  {} WAV files tagged\n", outcome.wav_files_updated));
    }
    diagnostics_block(&mut out, &outcome.diagnostics);
    Ok(out)
}

fn rebuild(path: &Path, runtime: &RuntimeConfig, provider: &dyn FirmwareProfileProvider) -> Result<String> {
    let outcome = repair::rebuild_file(path, runtime, provider)?;
    let mut out = format!(
        "{}: {} -> firmware {}, {} mappings in {} keygroups\n",
        path.display(),
        outcome.format,
        outcome.firmware,
        outcome.mappings,
        outcome.keygroups
    );
    for added in &outcome.added_samples {
        out.push_str(&format!("  + {}\n", added.display()));
    }
    diagnostics_block(&mut out, &outcome.diagnostics);
    Ok(out)
}

fn build(
    folder: &Path,
    mode: BuildMode,
    recursive: bool,
    runtime: &RuntimeConfig,
    provider: &dyn FirmwareProfileProvider,
) -> Result<String> {
    let built = builder::build_folder(folder, mode, recursive, runtime, provider)?;
    let mut out = format!("{}: {} programs\n", folder.display(), built.len());
    for program in &built {
        out.push_str(&format!(
            "  {} ({} samples in {} keygroups)\n",
            program.path.display(),
            program.mappings,
            program.keygroups
        ));
        diagnostics_block(&mut out, &program.diagnostics);
    }
    Ok(out)
}

fn transpose(path: &Path, semitones: f64, relative: bool, backup: bool) -> Result<String> {
    let change = transpose::transpose_file(path, semitones, relative, backup)?;
    Ok(format!("{}: master transpose {} -> {}\n", path.display(), change.old, change.new))
}

fn relink(path: &Path, from: &Path, runtime: &RuntimeConfig, provider: &dyn FirmwareProfileProvider) -> Result<String> {
    let outcome = relink::relink_file(path, from, runtime, provider)?;
    let status = if outcome.written { "rewritten" } else { "unchanged" };
    let mut out = format!(
        "{}: {} relinked ({} copied), {} still missing, {}\n",
        path.display(),
        outcome.relinked.len(),
        outcome.copied,
        outcome.still_missing.len(),
        status
    );
    for (old, new) in &outcome.relinked {
        out.push_str(&format!("  {} -> {}\n", old.display(), new.display()));
    }
    for missing in &outcome.still_missing {
        out.push_str(&format!("  ? {}\n", missing.display()));
    }
    diagnostics_block(&mut out, &outcome.diagnostics);
    Ok(out)
}

fn run_infer(sample: &Path, runtime: &RuntimeConfig) -> Result<()> {
    let trace = trace_root_note(sample, &runtime.inference);
    println!("{}", sample.display());
    for (stage, outcome) in &trace.outcomes {
        match outcome {
            StageOutcome::Detected(note) => println!("  {:<18} {} ({})", stage.to_string(), note, midi_to_name(*note)),
            StageOutcome::NoMatch => println!("  {:<18} no match", stage.to_string()),
            StageOutcome::Unreadable(reason) => println!("  {:<18} unreadable: {}", stage.to_string(), reason),
        }
    }
    match trace.note() {
        Some(note) => println!("Root note: {} ({})", note, midi_to_name(note)),
        None => {
            println!(
                "Root note: undetermined (fallback {})",
                midi_to_name(runtime.fallback_root_note)
            );
            std::process::exit(1);
        }
    }
    Ok(())
}

fn run_settings(settings: &mut config::AppSettings, update: &SettingsUpdate) -> Result<()> {
    if !update.is_empty() {
        update.apply(settings)?;
        config::save_settings(settings)?;
        log::info!("[Config] Settings saved");
    }
    println!("{}", serde_json::to_string_pretty(settings)?);
    if let Ok(path) = config::settings_path() {
        println!("({})", path.display());
    }
    Ok(())
}

fn print_tally(tally: &BatchTally) {
    println!("\n{} succeeded, {} failed", tally.succeeded, tally.failed.len());
    for (path, error) in &tally.failed {
        println!("  FAILED {}: {}", path.display(), error);
    }
}
