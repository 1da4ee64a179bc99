//! Fix-ups applied to the extracted map files between resolution and rebuild.

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::decompile::{FormatCandidate, SectionKind, VersionHints};
use crate::mpq::archive_name;
use crate::report::ProtectionReport;
use crate::sections::{CAMERAS_FILE, REGIONS_FILE, SOUNDS_FILE, UNITS_FILE};
use crate::triggers::{TRIGGERS_FILE, TRIGGER_TEXT_FILE};
use crate::{LogFn, Result, UnshieldError};

pub const SCRIPT_FILE: &str = "war3map.j";
pub const LUA_SCRIPT_FILE: &str = "war3map.lua";
pub const MAP_INFO_FILE: &str = "war3map.w3i";
pub const IMPORT_FILE: &str = "war3map.imp";

/// Directory below the files directory holding payloads that were never named.
pub const UNKNOWNS_DIR: &str = "unknowns";

const ARCHIVE_METADATA: &[&str] = &["(attributes)", "(listfile)", "(signature)"];

/// Editor-only sections that protection usually tampers with. They are rebuilt
/// from the script.
const EDITOR_SECTIONS: &[&str] = &[UNITS_FILE, TRIGGER_TEXT_FILE, TRIGGERS_FILE, REGIONS_FILE];

const STANDARD_MAP_FILE: &str = r"(?i)^war3(map|campaign)(\.(w[a-zA-Z0-9]{2}|doo|shd|mmp|j|imp)|misc\.txt|skin\.txt|map\.blp|units\.doo|extra\.txt)$";

const CONFIG_FUNCTION: &str = r"(?i)function\s+config\s+takes\s+nothing\s+returns\s+nothing";

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| UnshieldError::Config(e.to_string()))
}

/// A file directly inside `dir` whose name matches `name` ignoring ASCII case.
pub fn root_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let exact = dir.join(name);
    if exact.is_file() {
        return Some(exact);
    }
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.is_file()
                && path
                    .file_name()
                    .map_or(false, |f| f.to_string_lossy().eq_ignore_ascii_case(name))
        })
}

pub fn delete_root_file(dir: &Path, name: &str) -> Result<bool> {
    match root_file(dir, name) {
        Some(path) => {
            fs::remove_file(path)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Every file that belongs in the rebuilt archive: everything below `files_dir`
/// except unnamed payloads.
pub fn map_files(files_dir: &Path) -> Vec<PathBuf> {
    let unknowns = files_dir.join(UNKNOWNS_DIR);
    WalkDir::new(files_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| !path.starts_with(&unknowns))
        .collect()
}

/// Removes the archive's own bookkeeping files; the rebuild writes fresh ones.
pub fn delete_archive_metadata(files_dir: &Path, log: &LogFn) -> Result<()> {
    for name in ARCHIVE_METADATA {
        if root_file(files_dir, name).is_some() {
            log(&format!("Deleting {name}..."));
            delete_root_file(files_dir, name)?;
        }
    }
    Ok(())
}

/// Protectors overwrite the last byte of `war3map.w3i` with `0xFF`, which the
/// editor rejects. The byte is replaced by a zeroed 32-bit field.
pub fn patch_map_info(files_dir: &Path, report: &mut ProtectionReport, log: &LogFn) -> Result<bool> {
    let Some(path) = root_file(files_dir, MAP_INFO_FILE) else {
        log("war3map.w3i not found; skipping patch");
        return Ok(false);
    };
    log("Patching war3map.w3i...");
    let mut data = fs::read(&path)?;
    if data.last() != Some(&0xFF) {
        log("war3map.w3i is undamaged or already patched; skipping");
        return Ok(false);
    }
    report.protection();
    data.pop();
    data.extend_from_slice(&[0; 4]);
    fs::write(&path, data)?;
    log("war3map.w3i patched successfully");
    Ok(true)
}

fn read_i32(data: &[u8], at: usize) -> Option<i32> {
    let bytes = data.get(at..at + 4)?;
    Some(i32::from_le_bytes(bytes.try_into().ok()?))
}

/// Format versions of the sections present before they are discarded.
pub fn read_version_hints(files_dir: &Path) -> VersionHints {
    let read = |name: &str| root_file(files_dir, name).and_then(|path| fs::read(path).ok());
    let mut hints = VersionHints {
        map_info: read(MAP_INFO_FILE).and_then(|data| read_i32(&data, 0)),
        ..VersionHints::default()
    };

    for (kind, name) in [
        (SectionKind::Sounds, SOUNDS_FILE),
        (SectionKind::Cameras, CAMERAS_FILE),
        (SectionKind::Regions, REGIONS_FILE),
    ] {
        if let Some(version) = read(name).and_then(|data| read_i32(&data, 0)) {
            hints.sections.insert(kind, FormatCandidate::new(version, 0));
        }
    }
    if let Some(data) = read(TRIGGERS_FILE).filter(|d| d.starts_with(b"WTG!")) {
        if let Some(version) = read_i32(&data, 4) {
            hints
                .sections
                .insert(SectionKind::Triggers, FormatCandidate::new(version, 0));
        }
    }
    if let Some(data) = read(UNITS_FILE).filter(|d| d.starts_with(b"W3do")) {
        if let (Some(version), Some(sub_version)) = (read_i32(&data, 4), read_i32(&data, 8)) {
            hints
                .sections
                .insert(SectionKind::Units, FormatCandidate::new(version, sub_version));
        }
    }
    hints
}

/// Deletes the sections that are regenerated from the script.
pub fn discard_editor_sections(files_dir: &Path) -> Result<()> {
    for name in EDITOR_SECTIONS {
        delete_root_file(files_dir, name)?;
    }
    Ok(())
}

/// Makes sure a root `war3map.j` exists when one can be found among the unnamed
/// payloads. Returns whether the map has any script at all.
pub fn locate_script(
    files_dir: &Path,
    unknown_paths: &[PathBuf],
    report: &mut ProtectionReport,
    log: &LogFn,
) -> Result<bool> {
    let has_jass = root_file(files_dir, SCRIPT_FILE).is_some();
    if has_jass || root_file(files_dir, LUA_SCRIPT_FILE).is_some() {
        return Ok(true);
    }
    report.protection();

    let config = regex(CONFIG_FUNCTION)?;
    for path in unknown_paths {
        let Ok(data) = fs::read(path) else {
            continue;
        };
        if config.is_match(&String::from_utf8_lossy(&data)) {
            log(&format!("Using {} as war3map.j", path.display()));
            fs::copy(path, files_dir.join(SCRIPT_FILE))?;
            return Ok(true);
        }
    }
    Ok(has_nested_script(files_dir))
}

fn is_script_name(path: &Path) -> bool {
    path.file_name().map_or(false, |name| {
        let name = name.to_string_lossy();
        name.eq_ignore_ascii_case(SCRIPT_FILE) || name.eq_ignore_ascii_case(LUA_SCRIPT_FILE)
    })
}

fn nested_scripts(files_dir: &Path) -> Vec<PathBuf> {
    map_files(files_dir)
        .into_iter()
        .filter(|path| path.parent() != Some(files_dir) && is_script_name(path))
        .collect()
}

fn has_nested_script(files_dir: &Path) -> bool {
    !nested_scripts(files_dir).is_empty()
}

/// Moves script files found in sub-directories (`scripts\war3map.j`) to the
/// archive root, where the game loads them from.
pub fn gather_nested_scripts(
    files_dir: &Path,
    work_dir: &Path,
    report: &mut ProtectionReport,
    log: &LogFn,
) -> Result<usize> {
    let mut moved = 0;
    for source in nested_scripts(files_dir) {
        let Some(name) = source.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
            continue;
        };
        let target = root_file(files_dir, &name).unwrap_or_else(|| files_dir.join(&name));
        if target.exists() && fs::read(&source)? != fs::read(&target)? {
            report.critical(
                "WARNING: Multiple possible script files found. Please review TempFiles to see which one is correct and copy/paste directly into trigger editor or use MPQ tool to replace war3map.j or war3map.lua file",
            );
            report.warn(format!("TempFilePath: {}", work_dir.display()));
        }
        fs::rename(&source, &target)?;
        log(&format!("Moving '{}' to '{}'", source.display(), target.display()));
        moved += 1;
    }
    Ok(moved)
}

/// Puts a baseline copy of `name` in place, from `base_dir` when it has one and
/// from `builtin` otherwise.
pub fn substitute_baseline(
    files_dir: &Path,
    base_dir: Option<&Path>,
    name: &str,
    builtin: &[u8],
) -> Result<()> {
    let target = files_dir.join(name);
    match base_dir.and_then(|dir| root_file(dir, name)) {
        Some(source) => {
            fs::copy(source, &target)?;
        }
        None => fs::write(&target, builtin)?,
    }
    Ok(())
}

/// Writes `war3map.imp` listing every file the editor would not otherwise keep.
pub fn build_import_list(files_dir: &Path, log: &LogFn) -> Result<usize> {
    log("Building war3map.imp...");
    let standard = regex(STANDARD_MAP_FILE)?;
    let mut names: Vec<String> = Vec::new();
    for path in map_files(files_dir) {
        let Some(name) = archive_name(files_dir, &path) else {
            continue;
        };
        if standard.is_match(&name) || names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
            continue;
        }
        names.push(name);
    }

    let mut out = Vec::new();
    out.extend_from_slice(&1i32.to_le_bytes());
    out.extend_from_slice(&(names.len() as i32).to_le_bytes());
    out.push(b'\r');
    for name in &names {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.push(b'\r');
    }
    delete_root_file(files_dir, IMPORT_FILE)?;
    fs::write(files_dir.join(IMPORT_FILE), out)?;
    log(&format!("{} files added to import list", names.len()));
    Ok(names.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn quiet(_: &str) {}

    fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = crate::join_candidate(dir, name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn map_info_trailer_is_patched_once() {
        let dir = tempdir().unwrap();
        write(dir.path(), "war3map.w3i", &[28, 0, 0, 0, 0xFF]);
        let mut report = ProtectionReport::default();

        assert!(patch_map_info(dir.path(), &mut report, &quiet).unwrap());
        assert_eq!(
            fs::read(dir.path().join("war3map.w3i")).unwrap(),
            vec![28, 0, 0, 0, 0, 0, 0, 0]
        );
        assert!(!patch_map_info(dir.path(), &mut report, &quiet).unwrap());
        assert_eq!(report.protections_found, 1);
    }

    #[test]
    fn hints_come_from_section_headers() {
        let dir = tempdir().unwrap();
        write(dir.path(), "war3map.w3i", &31i32.to_le_bytes());
        write(dir.path(), "war3map.w3s", &2i32.to_le_bytes());
        let mut wtg = b"WTG!".to_vec();
        wtg.extend_from_slice(&4i32.to_le_bytes());
        write(dir.path(), "war3map.wtg", &wtg);
        let mut doo = b"W3do".to_vec();
        doo.extend_from_slice(&7i32.to_le_bytes());
        doo.extend_from_slice(&9i32.to_le_bytes());
        write(dir.path(), "WAR3MAPUNITS.DOO", &doo);

        let hints = read_version_hints(dir.path());
        assert_eq!(hints.map_info, Some(31));
        assert_eq!(hints.section(SectionKind::Sounds), Some(FormatCandidate::new(2, 0)));
        assert_eq!(hints.section(SectionKind::Triggers), Some(FormatCandidate::new(4, 0)));
        assert_eq!(hints.section(SectionKind::Units), Some(FormatCandidate::new(7, 9)));
        assert_eq!(hints.section(SectionKind::Cameras), None);

        discard_editor_sections(dir.path()).unwrap();
        assert!(root_file(dir.path(), UNITS_FILE).is_none());
        assert!(root_file(dir.path(), TRIGGERS_FILE).is_none());
        assert!(root_file(dir.path(), SOUNDS_FILE).is_some());
    }

    #[test]
    fn script_is_recovered_from_unknown_payloads() {
        let dir = tempdir().unwrap();
        let noise = write(dir.path(), "unknowns\\unknown_1", b"\x00\x01binary");
        let script = write(
            dir.path(),
            "unknowns\\unknown_2",
            b"function config takes nothing returns nothing\nendfunction\n",
        );
        let mut report = ProtectionReport::default();

        assert!(locate_script(dir.path(), &[noise, script], &mut report, &quiet).unwrap());
        assert_eq!(report.protections_found, 1);
        assert!(fs::read_to_string(dir.path().join("war3map.j"))
            .unwrap()
            .starts_with("function config"));

        // already present: nothing to do
        assert!(locate_script(dir.path(), &[], &mut report, &quiet).unwrap());
        assert_eq!(report.protections_found, 1);
    }

    #[test]
    fn differing_nested_scripts_raise_a_critical_warning() {
        let dir = tempdir().unwrap();
        write(dir.path(), "war3map.j", b"// one");
        write(dir.path(), "scripts\\war3map.j", b"// two");
        let logs = Mutex::new(Vec::new());
        let log = |line: &str| logs.lock().unwrap().push(line.to_string());
        let mut report = ProtectionReport::default();

        let moved = gather_nested_scripts(dir.path(), Path::new("/tmp/work"), &mut report, &log).unwrap();
        assert_eq!(moved, 1);
        assert_eq!(report.critical_warning_count, 1);
        assert_eq!(report.warnings[1], "TempFilePath: /tmp/work");
        assert_eq!(fs::read(dir.path().join("war3map.j")).unwrap(), b"// two");
        assert!(!dir.path().join("scripts").join("war3map.j").exists());
        assert!(logs.into_inner().unwrap()[0].starts_with("Moving '"));
    }

    #[test]
    fn import_list_skips_standard_files_and_unknowns() {
        let dir = tempdir().unwrap();
        write(dir.path(), "war3map.j", b"");
        write(dir.path(), "war3map.w3e", b"");
        write(dir.path(), "war3mapMisc.txt", b"");
        write(dir.path(), "Units\\Hero.mdx", b"");
        write(dir.path(), "Sounds\\theme.mp3", b"");
        write(dir.path(), "unknowns\\unknown_1", b"");

        assert_eq!(build_import_list(dir.path(), &quiet).unwrap(), 2);
        let imp = fs::read(dir.path().join("war3map.imp")).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&1i32.to_le_bytes());
        expected.extend_from_slice(&2i32.to_le_bytes());
        expected.push(b'\r');
        expected.extend_from_slice(b"Sounds\\theme.mp3\0\r");
        expected.extend_from_slice(b"Units\\Hero.mdx\0\r");
        assert_eq!(imp, expected);

        // rebuilding the list does not import the list itself
        assert_eq!(build_import_list(dir.path(), &quiet).unwrap(), 2);
    }

    #[test]
    fn baseline_prefers_the_base_directory() {
        let files = tempdir().unwrap();
        let base = tempdir().unwrap();
        write(base.path(), "war3map.wtg", b"base");

        substitute_baseline(files.path(), Some(base.path()), "war3map.wtg", b"builtin").unwrap();
        assert_eq!(fs::read(files.path().join("war3map.wtg")).unwrap(), b"base");

        substitute_baseline(files.path(), None, UNITS_FILE, b"builtin").unwrap();
        assert_eq!(fs::read(files.path().join(UNITS_FILE)).unwrap(), b"builtin");
    }

    #[test]
    fn archive_metadata_is_removed() {
        let dir = tempdir().unwrap();
        write(dir.path(), "(listfile)", b"war3map.j");
        write(dir.path(), "(attributes)", b"");
        delete_archive_metadata(dir.path(), &quiet).unwrap();
        assert!(map_files(dir.path()).is_empty());
    }
}
