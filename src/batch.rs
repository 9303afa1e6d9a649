use anyhow::Result;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use walkdir::WalkDir;

pub const PROGRAM_EXTENSION: &str = "xpm";

/// How many files a batch run handled, and which ones failed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchTally {
    pub succeeded: usize,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchTally {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn is_program_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    !name.starts_with("._")
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(PROGRAM_EXTENSION))
}

/// Expands the command line targets: files are taken as given, directories are
/// walked recursively for program files. Resource-fork companions (`._*`) are skipped.
pub fn collect_programs(targets: &[PathBuf]) -> Vec<PathBuf> {
    let mut programs = Vec::new();
    for target in targets {
        if target.is_dir() {
            for entry in WalkDir::new(target).sort_by_file_name() {
                match entry {
                    Ok(entry) if entry.file_type().is_file() && is_program_file(entry.path()) => {
                        programs.push(entry.into_path());
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("[Batch] Skipping unreadable entry under {:?}: {}", target, e),
                }
            }
        } else {
            programs.push(target.clone());
        }
    }
    programs
}

/// Runs `job` over every program in parallel. A failing file is logged and counted,
/// it never stops the others.
pub fn run<T, F>(programs: &[PathBuf], job: F) -> (Vec<(PathBuf, T)>, BatchTally)
where
    T: Send,
    F: Fn(&Path) -> Result<T> + Sync,
{
    let total = programs.len();
    let done = AtomicUsize::new(0);
    log::info!("[Batch] Processing {} program files...", total);

    let results: Vec<(PathBuf, Result<T>)> = programs
        .par_iter()
        .map(|path| {
            let result = job(path);
            let count = done.fetch_add(1, Ordering::SeqCst) + 1;
            log::debug!("[Batch] {}/{} {:?}", count, total, path);
            (path.clone(), result)
        })
        .collect();

    let mut tally = BatchTally::default();
    let mut outputs = Vec::new();
    for (path, result) in results {
        match result {
            Ok(output) => {
                tally.succeeded += 1;
                outputs.push((path, output));
            }
            Err(e) => {
                log::error!("[Batch] {:?}: {:#}", path, e);
                tally.failed.push((path, format!("{:#}", e)));
            }
        }
    }
    (outputs, tally)
}
