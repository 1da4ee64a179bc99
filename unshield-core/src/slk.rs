//! External object-data repair tool. Maps that ship their object data as SLK
//! tables are handed to the tool inside a throwaway archive; the object-data
//! sections it writes to `OUT` replace the extracted ones.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use crate::mapfiles::{map_files, root_file};
use crate::mpq;
use crate::report::ProtectionReport;
use crate::{CancellationToken, LogFn, Result, UnshieldError};

const TEMP_MAP: &str = "slk.w3x";
const OUTPUT_DIR: &str = "OUT";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sections the tool regenerates from the tables.
pub const RECOVERED_SECTIONS: &[&str] = &[
    "war3map.w3a",
    "war3map.w3c",
    "war3map.w3h",
    "war3map.w3q",
    "war3map.w3r",
    "war3map.w3t",
    "war3map.w3u",
];

/// Object-data sections left out of the temporary map so the tool rebuilds them.
const OMITTED_SECTIONS: &[&str] = &["w3a", "w3b", "w3d"];

#[derive(Debug, Clone)]
pub struct ObjectDataRepair {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory of the tool; `slk.w3x` and `OUT` live here.
    pub tool_dir: PathBuf,
}

fn is_slk(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.to_string_lossy().eq_ignore_ascii_case("slk"))
}

fn is_companion(files_dir: &Path, path: &Path) -> bool {
    if path.parent() != Some(files_dir) {
        return false;
    }
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return false;
    };
    if !(name.starts_with("war3map") || name.starts_with("war3campaign")) {
        return false;
    }
    let extension = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    !OMITTED_SECTIONS.contains(&extension)
}

/// Whether the extracted map carries any SLK tables.
pub fn has_tables(files_dir: &Path) -> bool {
    map_files(files_dir).iter().any(|path| is_slk(path))
}

impl ObjectDataRepair {
    pub fn new(exe: &Path) -> Self {
        let tool_dir = exe
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            program: exe.to_path_buf(),
            args: Vec::new(),
            tool_dir,
        }
    }

    fn build_input(&self, files_dir: &Path, log: &LogFn) -> Result<()> {
        log(&format!("Generating temporary map for SLK Recover: {TEMP_MAP}"));
        let files: Vec<PathBuf> = map_files(files_dir)
            .into_iter()
            .filter(|path| is_slk(path) || is_companion(files_dir, path))
            .collect();
        mpq::rebuild(&self.tool_dir.join(TEMP_MAP), files_dir, &files, None)?;
        log(&format!("{TEMP_MAP} generated"));
        Ok(())
    }

    /// Blocks until the tool exits. Returns `false` when it was cancelled.
    fn execute(&self, cancel: &CancellationToken, log: &LogFn) -> Result<bool> {
        log("Running SilkObjectOptimizer");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.tool_dir)
            .spawn()
            .map_err(|e| {
                UnshieldError::Config(format!("cannot start {}: {e}", self.program.display()))
            })?;
        loop {
            if let Some(status) = child.try_wait()? {
                if !status.success() {
                    log::warn!("object data tool exited with {status}");
                }
                break;
            }
            if cancel.is_cancelled() {
                child.kill()?;
                child.wait()?;
                log("SilkObjectOptimizer cancelled");
                return Ok(false);
            }
            thread::sleep(POLL_INTERVAL);
        }
        log("SilkObjectOptimizer completed");
        Ok(true)
    }

    /// Runs the tool over the extracted map and merges its output. Returns the
    /// number of sections replaced.
    pub fn run(
        &self,
        files_dir: &Path,
        cancel: &CancellationToken,
        report: &mut ProtectionReport,
        log: &LogFn,
    ) -> Result<usize> {
        self.build_input(files_dir, log)?;
        let out_dir = self.tool_dir.join(OUTPUT_DIR);
        if out_dir.exists() {
            fs::remove_dir_all(&out_dir)?;
        }
        fs::create_dir_all(&out_dir)?;

        if !self.execute(cancel, log)? {
            return Ok(0);
        }

        let mut replaced = 0;
        for name in RECOVERED_SECTIONS {
            let Some(source) = root_file(&out_dir, name) else {
                continue;
            };
            let target = match root_file(files_dir, name) {
                Some(existing) => existing,
                None => {
                    report.protection();
                    files_dir.join(name)
                }
            };
            log(&format!("Replacing {name} with SLKRecover version"));
            fs::copy(&source, &target)?;
            replaced += 1;
        }
        Ok(replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quiet(_: &str) {}

    fn shell(tool_dir: &Path, script: &str) -> ObjectDataRepair {
        ObjectDataRepair {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            tool_dir: tool_dir.to_path_buf(),
        }
    }

    #[test]
    fn tool_directory_is_the_executable_parent() {
        let repair = ObjectDataRepair::new(Path::new("/opt/tools/SilkObjectOptimizer.exe"));
        assert_eq!(repair.tool_dir, PathBuf::from("/opt/tools"));
        assert_eq!(ObjectDataRepair::new(Path::new("tool.exe")).tool_dir, PathBuf::from("."));
    }

    #[test]
    fn companion_files_exclude_rebuilt_sections() {
        let files = Path::new("/map");
        assert!(is_companion(files, Path::new("/map/war3map.w3u")));
        assert!(is_companion(files, Path::new("/map/war3mapMisc.txt")));
        assert!(!is_companion(files, Path::new("/map/war3map.w3a")));
        assert!(!is_companion(files, Path::new("/map/Units/war3map.w3u")));
        assert!(!is_companion(files, Path::new("/map/readme.txt")));
    }

    #[test]
    fn tool_output_replaces_sections() {
        let files = tempdir().unwrap();
        let tool = tempdir().unwrap();
        fs::create_dir_all(files.path().join("Units")).unwrap();
        fs::write(files.path().join("Units").join("UnitData.slk"), b"ID;PWXL;N;E\n").unwrap();
        fs::write(files.path().join("war3map.w3u"), b"old").unwrap();
        fs::create_dir_all(tool.path().join("OUT")).unwrap();
        fs::write(tool.path().join("OUT").join("stale.txt"), b"").unwrap();
        assert!(has_tables(files.path()));

        let repair = shell(
            tool.path(),
            "test -f slk.w3x && test ! -f OUT/stale.txt && printf new > OUT/war3map.w3u && printf t > OUT/war3map.w3t",
        );
        let mut report = ProtectionReport::default();
        let replaced = repair
            .run(files.path(), &CancellationToken::new(), &mut report, &quiet)
            .unwrap();

        assert_eq!(replaced, 2);
        assert_eq!(fs::read(files.path().join("war3map.w3u")).unwrap(), b"new");
        assert_eq!(fs::read(files.path().join("war3map.w3t")).unwrap(), b"t");
        assert_eq!(report.protections_found, 1);
    }

    #[test]
    fn cancellation_kills_the_tool() {
        let files = tempdir().unwrap();
        let tool = tempdir().unwrap();
        fs::write(files.path().join("war3map.w3u"), b"old").unwrap();
        let repair = shell(tool.path(), "sleep 30; printf new > OUT/war3map.w3u");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut report = ProtectionReport::default();

        let replaced = repair.run(files.path(), &cancel, &mut report, &quiet).unwrap();
        assert_eq!(replaced, 0);
        assert_eq!(fs::read(files.path().join("war3map.w3u")).unwrap(), b"old");
    }
}
