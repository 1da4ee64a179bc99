use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub mod decompile;
pub mod hash;
pub mod jass;
pub mod listfile;
pub mod mapfiles;
pub mod mpq;
pub mod normalize;
pub mod report;
pub mod resolver;
pub mod sections;
pub mod slk;
pub mod triggers;

pub use report::ProtectionReport;

use decompile::{Decompiled, SectionKind, SectionState, VersionHints};
use listfile::ListfileStore;
use mpq::Archive;
use resolver::Resolver;
use sections::{MapUnits, UNITS_FILE};
use triggers::{MapTriggers, BANNER, TRIGGERS_FILE, TRIGGER_TEXT_FILE};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BruteForceSettings {
    pub max_length: usize,
    pub alphabet: String,
    pub extensions: Vec<String>,
}

impl Default for BruteForceSettings {
    fn default() -> Self {
        Self {
            max_length: 75,
            alphabet: "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_!&()' .[]".to_string(),
            extensions: ["blp", "tga", "mdl", "mdx", "dds"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeprotectSettings {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub listfile_path: Option<PathBuf>,
    /// Directory holding baseline copies of sections that could not be recovered.
    pub base_files_path: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub create_visual_triggers: bool,
    pub brute_force_unknowns: bool,
    pub brute_force: BruteForceSettings,
    pub object_data_repair_exe: Option<PathBuf>,
}

impl DeprotectSettings {
    /// Reads settings from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| UnshieldError::Config(format!("{}: {e}", path.display())))
    }
}

#[derive(Debug, Error)]
pub enum UnshieldError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("container corrupt: {0}")]
    ContainerCorrupt(String),
    #[error("table corrupt: {0}")]
    TableCorrupt(String),
    #[error("cannot write output {}: {source}", path.display())]
    OutputLocked {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("script error: {0}")]
    Script(#[from] jass::ParseError),
}

pub type Result<T> = std::result::Result<T, UnshieldError>;

/// Progress sink. One human-readable line per call.
pub type LogFn<'a> = dyn Fn(&str) + Sync + 'a;

/// Cooperative cancellation owned by the caller of [`run`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub(crate) fn join_candidate(base: &Path, candidate: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in candidate.split(['/', '\\']) {
        if !part.is_empty() {
            path.push(part);
        }
    }
    path
}

/// Fails with `OutputLocked` when `output` cannot be opened for writing. A file
/// created only for the check is removed again.
fn check_output(output: &Path) -> Result<()> {
    let existed = output.exists();
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(output)
        .map_err(|source| UnshieldError::OutputLocked {
            path: output.to_path_buf(),
            source,
        })?;
    if !existed {
        fs::remove_file(output)?;
    }
    Ok(())
}

fn default_work_dir(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "map".to_string());
    std::env::temp_dir().join("Unshield").join(stem)
}

fn write_section(files_dir: &Path, name: &str, data: &[u8], report: &mut ProtectionReport) -> Result<()> {
    if mapfiles::root_file(files_dir, name).is_none() {
        report.protection();
    }
    mapfiles::delete_root_file(files_dir, name)?;
    fs::write(files_dir.join(name), data)?;
    Ok(())
}

/// Sections that have no baseline copy. When exhausted they are left out.
const OPTIONAL_SECTIONS: [SectionKind; 3] =
    [SectionKind::Sounds, SectionKind::Cameras, SectionKind::Regions];

fn report_exhausted(decompiled: &Decompiled, report: &mut ProtectionReport) {
    for kind in OPTIONAL_SECTIONS {
        if decompiled.state(kind) == SectionState::Exhausted {
            report.protection();
            report.warn(format!(
                "WARNING: {} could not be recovered and are missing from the map. They still exist in the war3map.j or war3map.lua script file.",
                kind.label()
            ));
        }
    }
}

/// Decompiles the script into editor sections and returns the script the trigger
/// fallback should use. A script that does not parse is returned as it was found,
/// with nothing decompiled.
fn recover_sections(
    files_dir: &Path,
    hints: &VersionHints,
    settings: &DeprotectSettings,
    report: &mut ProtectionReport,
    log: &LogFn,
) -> Result<Option<String>> {
    let Some(path) = mapfiles::root_file(files_dir, mapfiles::SCRIPT_FILE) else {
        return Ok(None);
    };
    let raw = String::from_utf8_lossy(&fs::read(&path)?).into_owned();
    let normalized = match normalize::normalize_script(&raw, report, log) {
        Ok(text) => text,
        Err(err) => {
            log(&format!("Unable to parse war3map.j: {err}"));
            report.warn("WARNING: war3map.j could not be parsed; editor sections were not recovered");
            return Ok(Some(format!("// {BANNER}{raw}")));
        }
    };
    let script = format!("// {BANNER}{normalized}");
    fs::write(&path, &script)?;

    let decompiled =
        decompile::decompile(&script, hints, settings.create_visual_triggers, report, log)?;
    for (name, data) in decompiled.files() {
        write_section(files_dir, name, &data, report)?;
    }
    report_exhausted(&decompiled, report);
    Ok(Some(script))
}

fn note_triggers(files_dir: &Path, visual: bool, report: &mut ProtectionReport) -> Result<()> {
    if !visual {
        mapfiles::delete_root_file(files_dir, TRIGGER_TEXT_FILE)?;
        mapfiles::delete_root_file(files_dir, TRIGGERS_FILE)?;
    } else if mapfiles::root_file(files_dir, TRIGGERS_FILE).is_some() {
        report.warn("Note: Visual trigger recovery is experimental. If world editor crashes, or you have too many compiler errors when saving in WorldEditor, try disabling this feature.");
    } else {
        report.warn("Note: Visual triggers could not be recovered. Using custom script instead.");
    }
    Ok(())
}

const CLOSING_NOTES: &[&str] = &[
    "NOTE: You may need to fix script compiler errors before saving in world editor.",
    "NOTE: Objects added directly to editor render screen, like units/doodads/items/etc are stored in an editor-only file called war3mapunits.doo and converted to script code on save. Protection deletes the editor file and obfuscates the script code to make it harder to recover. Decompiling the war3map script file back into war3mapunits.doo is not 100% perfect for most maps. Please do extensive testing to ensure everything still behaves correctly, you may have to do many manual bug fixes in world editor after deprotection.",
    "NOTE: If deprotected map works correctly, but becomes corrupted after saving in world editor, it is due to editor-generated code in your war3map.j or war3map.lua. You should delete WorldEditor triggers, keep a backup of the war3map.j or war3map.lua script file, edit with visual studio code, and add it with MPQ tool after saving in WorldEditor. The downside to this approach is any objects you manually add to the rendering screen will get saved to the broken script file, so you will need to use a tool like WinMerge to diff the old/new script file and copy any editor-generated changes to your backup script file.",
    "NOTE: Editor-generated functions in trigger window have been renamed with a suffix of _old. If saving in world editor causes game to become corrupted, check the _old functions to find code that may need to be moved to an initialization script.",
];

/// Deprotects `settings.input_path` into `settings.output_path`.
pub fn run(
    settings: &DeprotectSettings,
    cancel: &CancellationToken,
    log: &LogFn,
) -> Result<ProtectionReport> {
    if !settings.input_path.is_file() {
        return Err(UnshieldError::Config(format!(
            "Input map does not exist: {}",
            settings.input_path.display()
        )));
    }
    check_output(&settings.output_path)?;

    let listfile = match &settings.listfile_path {
        Some(path) => ListfileStore::load(path)?,
        None => ListfileStore::in_memory(),
    };
    let work_dir = settings
        .work_dir
        .clone()
        .unwrap_or_else(|| default_work_dir(&settings.input_path));
    let files_dir = work_dir.join("files");
    if files_dir.exists() {
        fs::remove_dir_all(&files_dir)?;
    }
    fs::create_dir_all(&files_dir)?;

    let mut report = ProtectionReport::default();
    let mut raw = fs::read(&settings.input_path)?;
    if mpq::normalize_header(&mut raw, &mut report) {
        log("Corrected invalid MPQ Header Format Version");
    }
    let prefix = mpq::wrapper_prefix(&raw).map(<[u8]>::to_vec);

    let (mut archive, reconstructed) = Archive::open_or_reconstruct(raw)?;
    if reconstructed {
        log("MPQ Header corrupted. Attempting to repair.");
        report.protection();
    }
    let repaired = archive.repair();
    if repaired > 0 {
        log::debug!("{repaired} dangling hash entries marked deleted");
    }
    if archive.count_unknown() > 0 {
        report.protection();
    }

    if let Ok(data) = archive.read_file("(listfile)") {
        listfile.merge(String::from_utf8_lossy(&data).lines());
    }
    let mut resolver = Resolver::new(&files_dir, &listfile, log);
    let mut names = listfile.names();
    names.extend(resolver::WELL_KNOWN_NAMES.iter().map(|name| name.to_string()));
    resolver.lookup_names(&mut archive, names.iter().map(String::as_str));

    let unknown_paths = resolver.extract_all(&archive, &mut report)?;
    log(&format!("Unknown file count: {}", archive.count_unknown()));
    if archive.count_unknown() > 0 {
        let mut scanned = resolver.extracted_paths().to_vec();
        scanned.extend(unknown_paths.iter().cloned());
        let scan = resolver::scan_files(&scanned)?;
        resolver.directory_projection(&mut archive, &scan, &mut report)?;
        resolver.reference_scan(&mut archive, &scan, &unknown_paths, &mut report)?;
        if settings.brute_force_unknowns && archive.count_unknown() > 0 {
            resolver.brute_force(&mut archive, &settings.brute_force, cancel, &mut report)?;
        }
    }
    report.unknown_file_count = archive.count_unknown();
    if report.unknown_file_count > 0 {
        report.warn(format!(
            "WARNING: {} files have unresolved names",
            report.unknown_file_count
        ));
        report.warn("These files will be lost and deprotected map may be incomplete or even unusable!");
        report.warn("You can try fixing by searching online for listfile.txt, using 'Brute force unknown files (SLOW)' option, or by using 'W3X Name Scanner' tool in MPQEditor.exe");
    }

    mapfiles::delete_archive_metadata(&files_dir, log)?;
    mapfiles::patch_map_info(&files_dir, &mut report, log)?;
    let hints = mapfiles::read_version_hints(&files_dir);
    mapfiles::discard_editor_sections(&files_dir)?;
    mapfiles::locate_script(&files_dir, &unknown_paths, &mut report, log)?;
    mapfiles::gather_nested_scripts(&files_dir, &work_dir, &mut report, log)?;

    let script = recover_sections(&files_dir, &hints, settings, &mut report, log)?;
    note_triggers(&files_dir, settings.create_visual_triggers, &mut report)?;
    if mapfiles::root_file(&files_dir, TRIGGERS_FILE).is_none() {
        if let Some(script) = &script {
            log("Converting war3map.j to a custom script trigger");
            let fallback = triggers::fallback_from_script(script, log)?;
            write_section(&files_dir, TRIGGERS_FILE, &fallback.wtg, &mut report)?;
            write_section(&files_dir, TRIGGER_TEXT_FILE, &fallback.wct, &mut report)?;
        }
    }

    if let Some(exe) = &settings.object_data_repair_exe {
        if slk::has_tables(&files_dir) {
            let repair = slk::ObjectDataRepair::new(exe);
            if let Err(err) = repair.run(&files_dir, cancel, &mut report, log) {
                log(&format!("SLK recovery failed: {err}"));
                report.warn(format!("WARNING: object data could not be recovered from SLK tables: {err}"));
            }
        }
    }

    let base_dir = settings.base_files_path.as_deref();
    if mapfiles::root_file(&files_dir, UNITS_FILE).is_none() {
        mapfiles::substitute_baseline(&files_dir, base_dir, UNITS_FILE, &MapUnits::empty().encode())?;
        report.protection();
        report.critical("WARNING: war3mapunits.doo could not be recovered. Map will still open in WorldEditor & run, but units will not be visible in WorldEditor rendering and saving in world editor will corrupt your war3map.j or war3map.lua script file.");
    }
    if mapfiles::root_file(&files_dir, TRIGGERS_FILE).is_none() {
        mapfiles::substitute_baseline(&files_dir, base_dir, TRIGGERS_FILE, &MapTriggers::empty().encode_wtg())?;
        report.protection();
        report.critical("WARNING: triggers could not be recovered. Map will still open in WorldEditor & run, but saving in world editor will corrupt your war3map.j or war3map.lua script file.");
    }

    mapfiles::build_import_list(&files_dir, log)?;
    let files = mapfiles::map_files(&files_dir);
    let written = mpq::rebuild(&settings.output_path, &files_dir, &files, prefix.as_deref())?;
    log(&format!("{written} files written to {}", settings.output_path.display()));

    if report.new_listfile_entries_found > 0 {
        let stored = listfile
            .path()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string());
        log(&format!(
            "{} new List File Entries Found! File stored at: {stored}",
            report.new_listfile_entries_found
        ));
    }
    listfile.persist()?;

    for note in CLOSING_NOTES {
        report.warn(*note);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpq::ArchiveBuilder;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const SCRIPT: &str = "\
globals
    unit gg_unit_hfoo_0001 = null
endglobals
function CreateAllUnits takes nothing returns nothing
    set gg_unit_hfoo_0001 = CreateUnit(Player(0), 'hfoo', 0.0, 0.0, 270.0)
endfunction
function main takes nothing returns nothing
    call CreateAllUnits()
endfunction
function config takes nothing returns nothing
    call DefineStartLocation(0, 0.0, 0.0)
endfunction
";

    fn protected_map() -> Vec<u8> {
        map_with_script(SCRIPT)
    }

    fn map_with_script(script: &str) -> Vec<u8> {
        let mut builder = ArchiveBuilder::new().include_listfile(false);
        builder.add_file("war3map.j", script.as_bytes().to_vec());
        builder.add_file("war3map.w3i", vec![25, 0, 0, 0, 0xFF]);
        builder.add_file("Textures\\Banner.blp", vec![1; 64]);
        builder.add_file("Models\\Secret.mdx", vec![2; 64]);
        builder.add_file("Sound\\Hidden.wav", vec![3; 64]);
        builder.build().unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        settings: DeprotectSettings,
    }

    fn fixture(map: Vec<u8>) -> Fixture {
        let dir = tempdir().unwrap();
        let input = dir.path().join("protected.w3x");
        fs::write(&input, map).unwrap();
        let listfile = dir.path().join("listfile.txt");
        fs::write(&listfile, "Textures\\Banner.blp\n").unwrap();
        let settings = DeprotectSettings {
            input_path: input,
            output_path: dir.path().join("deprotected.w3x"),
            listfile_path: Some(listfile),
            work_dir: Some(dir.path().join("work")),
            ..DeprotectSettings::default()
        };
        Fixture { _dir: dir, settings }
    }

    #[test]
    fn unresolved_names_are_reported_and_the_rest_rebuilt() {
        let fixture = fixture(protected_map());
        let logs = Mutex::new(Vec::new());
        let log = |line: &str| logs.lock().unwrap().push(line.to_string());

        let report = run(&fixture.settings, &CancellationToken::new(), &log).unwrap();

        assert_eq!(report.unknown_file_count, 2);
        assert!(report.warnings.contains(&"WARNING: 2 files have unresolved names".to_string()));
        assert!(report.warnings.iter().any(|w| w.starts_with("NOTE: Editor-generated functions")));
        let mut deduped = report.warnings.clone();
        deduped.dedup();
        assert_eq!(deduped, report.warnings);

        let mut output = Archive::open(fs::read(&fixture.settings.output_path).unwrap()).unwrap();
        assert!(output.resolve("war3map.j"));
        assert!(output.resolve("Textures\\Banner.blp"));
        assert!(!output.resolve("Models\\Secret.mdx"));
        assert!(output.resolve(UNITS_FILE));
        assert!(output.resolve(TRIGGERS_FILE));
        assert!(output.resolve(mapfiles::IMPORT_FILE));
        assert_eq!(
            output.read_file("war3map.w3i").unwrap(),
            vec![25, 0, 0, 0, 0, 0, 0, 0]
        );
        let script = String::from_utf8(output.read_file("war3map.j").unwrap()).unwrap();
        assert!(script.starts_with("// Map recovered by Unshield"));

        assert!(logs.into_inner().unwrap().iter().any(|l| l == "Unknown file count: 2"));
        assert!(!fixture.settings.output_path.with_extension("w3x.partial").exists());
    }

    #[test]
    fn unparseable_script_still_gets_text_triggers() {
        let broken = SCRIPT.replace(
            "    call CreateAllUnits()\n",
            "    call CreateAllUnits()\n    JUNK\n",
        );
        let fixture = fixture(map_with_script(&broken));

        let report = run(&fixture.settings, &CancellationToken::new(), &|_: &str| {}).unwrap();
        assert!(report
            .warnings
            .iter()
            .any(|w| w.starts_with("WARNING: war3map.j could not be parsed")));
        assert!(!report
            .warnings
            .iter()
            .any(|w| w.starts_with("WARNING: triggers could not be recovered")));

        let mut output = Archive::open(fs::read(&fixture.settings.output_path).unwrap()).unwrap();
        assert!(output.resolve(TRIGGER_TEXT_FILE));
        let wct = output.read_file(TRIGGER_TEXT_FILE).unwrap();
        let text = String::from_utf8_lossy(&wct);
        assert!(text.contains("JUNK"));
        assert!(text.contains("call ExecuteFunc(\"main2\")"));
        assert!(output.read_file(TRIGGERS_FILE).unwrap().len() > 24);
    }

    #[test]
    fn unrecoverable_cameras_are_reported() {
        let script = SCRIPT
            .replace(
                "    unit gg_unit_hfoo_0001 = null\n",
                "    unit gg_unit_hfoo_0001 = null\n    camerasetup gg_cam_View = null\n",
            )
            .replace(
                "    call CreateAllUnits()\n",
                "    call CreateAllUnits()\n    set gg_cam_View = CreateCameraSetup()\n    call CameraSetupSetField(gg_cam_View, CAMERA_FIELD_WOBBLE, 1.0, 0.0)\n",
            );
        let fixture = fixture(map_with_script(&script));
        let baseline = run(
            &fixture.settings,
            &CancellationToken::new(),
            &|_: &str| {},
        )
        .unwrap();
        assert!(baseline
            .warnings
            .iter()
            .any(|w| w.starts_with("WARNING: map cameras could not be recovered")));
        assert!(!baseline
            .warnings
            .iter()
            .any(|w| w.starts_with("WARNING: map sounds could not be recovered")));

        let mut output = Archive::open(fs::read(&fixture.settings.output_path).unwrap()).unwrap();
        assert!(!output.resolve(sections::CAMERAS_FILE));
        assert!(output.resolve(sections::SOUNDS_FILE));
    }

    #[test]
    fn exhausted_optional_sections_count_as_protections() {
        let mut decompiled = Decompiled::default();
        decompiled.states.insert(SectionKind::Regions, SectionState::Exhausted);
        decompiled.states.insert(SectionKind::Sounds, SectionState::Recovered);
        decompiled.states.insert(SectionKind::Units, SectionState::Exhausted);
        let mut report = ProtectionReport::default();

        report_exhausted(&decompiled, &mut report);
        assert_eq!(report.protections_found, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("WARNING: map regions could not be recovered"));
    }

    #[test]
    fn header_format_version_is_corrected() {
        let mut map = protected_map();
        map[12] = 1;
        let fixture = fixture(map);
        let logs = Mutex::new(Vec::new());
        let log = |line: &str| logs.lock().unwrap().push(line.to_string());

        let report = run(&fixture.settings, &CancellationToken::new(), &log).unwrap();
        assert!(report.protections_found >= 2);
        assert!(logs
            .into_inner()
            .unwrap()
            .iter()
            .any(|l| l == "Corrected invalid MPQ Header Format Version"));

        let output = fs::read(&fixture.settings.output_path).unwrap();
        assert_eq!(&output[12..14], &[0, 0]);
    }

    #[test]
    fn settings_file_overrides_only_given_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"input_path": "in.w3x", "brute_force_unknowns": true, "brute_force": {"max_length": 12}}"#,
        )
        .unwrap();

        let settings = DeprotectSettings::load(&path).unwrap();
        assert_eq!(settings.input_path, PathBuf::from("in.w3x"));
        assert!(settings.brute_force_unknowns);
        assert!(!settings.create_visual_triggers);
        assert_eq!(settings.brute_force.max_length, 12);
        assert_eq!(settings.brute_force.alphabet.len(), 47);

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            DeprotectSettings::load(&path),
            Err(UnshieldError::Config(_))
        ));
    }

    #[test]
    fn missing_input_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let settings = DeprotectSettings {
            input_path: dir.path().join("missing.w3x"),
            output_path: dir.path().join("out.w3x"),
            ..DeprotectSettings::default()
        };
        let err = run(&settings, &CancellationToken::new(), &|_: &str| {}).unwrap_err();
        assert!(matches!(err, UnshieldError::Config(_)));
        assert!(!settings.output_path.exists());
    }

    #[test]
    fn unwritable_output_fails_before_any_work() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.w3x");
        fs::write(&input, protected_map()).unwrap();
        let settings = DeprotectSettings {
            input_path: input,
            output_path: dir.path().join("no-such-dir").join("out.w3x"),
            work_dir: Some(dir.path().join("work")),
            ..DeprotectSettings::default()
        };
        let err = run(&settings, &CancellationToken::new(), &|_: &str| {}).unwrap_err();
        assert!(matches!(err, UnshieldError::OutputLocked { .. }));
        assert!(!dir.path().join("work").exists());
    }
}
