//! Recovery of archive entries whose names were stripped.
//!
//! Strategies escalate in cost: direct lookup of names we already know, guesses
//! projected from the directories of resolved files, paths referenced inside
//! extracted payloads, and finally an exhaustive search over short names. Every
//! strategy stops as soon as nothing is left unknown.

use rayon::prelude::*;
use regex::bytes::Regex;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::hash::{Fingerprint, NamePair};
use crate::listfile::ListfileStore;
use crate::mpq::Archive;
use crate::report::ProtectionReport;
use crate::{join_candidate, BruteForceSettings, CancellationToken, LogFn, Result};

/// File names every map or campaign may contain.
pub const WELL_KNOWN_NAMES: &[&str] = &[
    "war3map.j",
    "scripts\\war3map.j",
    "war3map.lua",
    "war3map.w3i",
    "war3map.w3e",
    "war3map.wpm",
    "war3map.doo",
    "war3mapUnits.doo",
    "war3map.shd",
    "war3map.mmp",
    "war3map.w3r",
    "war3map.w3c",
    "war3map.w3s",
    "war3map.wtg",
    "war3map.wct",
    "war3map.wts",
    "war3map.imp",
    "war3map.w3u",
    "war3map.w3t",
    "war3map.w3a",
    "war3map.w3b",
    "war3map.w3d",
    "war3map.w3q",
    "war3map.w3h",
    "war3map.w3o",
    "war3mapMap.blp",
    "war3mapMap.tga",
    "war3mapPreview.tga",
    "war3mapPath.tga",
    "war3mapMisc.txt",
    "war3mapSkin.txt",
    "war3mapExtra.txt",
    "war3campaign.w3u",
    "war3campaign.w3t",
    "war3campaign.w3a",
    "war3campaign.w3b",
    "war3campaign.w3d",
    "war3campaign.w3q",
    "war3campaign.w3h",
    "war3campaign.w3f",
    "war3campaign.imp",
    "war3campaignMisc.txt",
    "war3campaignSkin.txt",
    "Units\\UnitData.slk",
    "Units\\UnitBalance.slk",
    "Units\\UnitUI.slk",
    "Units\\UnitWeapons.slk",
    "Units\\UnitAbilities.slk",
    "Units\\AbilityData.slk",
    "Units\\ItemData.slk",
    "Units\\UpgradeData.slk",
    "Units\\DestructableData.slk",
    "Doodads\\Doodads.slk",
    "(listfile)",
    "(attributes)",
    "(signature)",
];

/// Extensions recognised when scanning payloads for referenced paths.
pub const COMMON_EXTENSIONS: &[&str] = &[
    "lua", "ai", "asi", "ax", "blp", "ccd", "clh", "css", "dds", "dll", "dls", "doo", "exe",
    "exp", "fdf", "flt", "gid", "html", "ifl", "imp", "ini", "j", "jpg", "js", "log", "m3d",
    "mdl", "mdx", "mid", "mmp", "mp3", "mpq", "mrf", "pld", "png", "shd", "slk", "tga", "toc",
    "ttf", "txt", "url", "w3a", "w3b", "w3c", "w3d", "w3e", "w3g", "w3h", "w3i", "w3m", "w3n",
    "w3q", "w3r", "w3s", "w3t", "w3u", "w3x", "wai", "wav", "wct", "wpm", "wpp", "wtg", "wts",
];

const DISABLED_ICON_DIR: &str = "ReplaceableTextures\\CommandButtonsDisabled\\";

/// Uses the format's separator and drops leading separators.
fn archive_path(name: &str) -> String {
    name.trim()
        .replace('/', "\\")
        .trim_start_matches('\\')
        .to_string()
}

fn directory_of(name: &str) -> &str {
    name.rfind('\\').map_or("", |i| &name[..i])
}

fn base_name(name: &str) -> &str {
    name.rfind('\\').map_or(name, |i| &name[i + 1..])
}

fn join_archive(directory: &str, file: &str) -> String {
    if directory.is_empty() {
        file.to_string()
    } else {
        format!("{directory}\\{file}")
    }
}

fn reference_pattern() -> Result<Regex> {
    let mut extensions: Vec<&str> = COMMON_EXTENSIONS.to_vec();
    // Longer extensions first so ".js" is not cut short at ".j".
    extensions.sort_by_key(|ext| std::cmp::Reverse(ext.len()));
    let pattern = format!(
        r"(?i-u)([\)\(\\/a-zA-Z_0-9. -]{{1,1000}})\.({})",
        extensions.join("|")
    );
    Regex::new(&pattern).map_err(|e| crate::UnshieldError::Config(e.to_string()))
}

/// Paths referenced from inside payloads, plus the sibling names the editor
/// derives from them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReferenceScan {
    pub paths: BTreeSet<String>,
}

impl ReferenceScan {
    pub fn add_reference(&mut self, stem: &str, extension: &str) {
        let stem = stem.replace("\\\\", "\\");
        let stem = stem.trim();
        if stem.is_empty() {
            return;
        }
        let extension = extension.to_ascii_lowercase();
        let base = base_name(&archive_path(stem)).trim().to_string();

        self.paths.insert(format!("{stem}.{extension}"));
        match extension.as_str() {
            "tga" | "blp" => {
                self.paths.insert(format!("{stem}.blp"));
                self.paths.insert(format!("{stem}.tga"));
                self.paths.insert(format!("{DISABLED_ICON_DIR}DIS{base}.tga"));
                self.paths.insert(format!("{DISABLED_ICON_DIR}DIS{base}.blp"));
            }
            "mdl" | "mdx" => {
                self.paths.insert(format!("{stem}.mdl"));
                self.paths.insert(format!("{stem}.mdx"));
                self.paths.insert(format!("{stem}_Portrait.mdx"));
            }
            _ => {}
        }
    }

    pub fn scan_bytes(&mut self, pattern: &Regex, data: &[u8]) {
        for captures in pattern.captures_iter(data) {
            let (Some(stem), Some(ext)) = (captures.get(1), captures.get(2)) else {
                continue;
            };
            let stem = String::from_utf8_lossy(stem.as_bytes());
            let ext = String::from_utf8_lossy(ext.as_bytes());
            self.add_reference(&stem, &ext);
        }
    }

    /// Upper-cased bare file names of every referenced path.
    pub fn file_names(&self) -> BTreeSet<String> {
        self.paths
            .iter()
            .map(|p| base_name(&archive_path(p)).to_uppercase())
            .filter(|n| !n.is_empty())
            .collect()
    }

    pub fn directories(&self) -> BTreeSet<String> {
        self.paths
            .iter()
            .map(|p| directory_of(&archive_path(p)).to_uppercase())
            .collect()
    }
}

pub fn scan_files(files: &[PathBuf]) -> Result<ReferenceScan> {
    let pattern = reference_pattern()?;
    let mut scan = ReferenceScan::default();
    for file in files {
        let Ok(data) = fs::read(file) else {
            continue;
        };
        scan.scan_bytes(&pattern, &data);
    }
    Ok(scan)
}

/// Every ancestor of every directory, spelled with both separators.
fn prefix_closure(directories: &BTreeSet<String>) -> BTreeSet<String> {
    let mut closure = BTreeSet::new();
    for directory in directories {
        let parts: Vec<&str> = directory.split(['\\', '/']).collect();
        for depth in 1..=parts.len() {
            closure.insert(parts[..depth].join("/"));
            closure.insert(parts[..depth].join("\\"));
        }
    }
    closure
}

struct BruteShared {
    extracted: HashSet<String>,
    resolved_blocks: HashSet<u32>,
    found: Vec<String>,
    unreadable: Vec<(String, String)>,
    remaining: usize,
}

struct BruteContext<'a> {
    archive: &'a Archive,
    unknown: &'a HashSet<Fingerprint>,
    alphabet: &'a [u8],
    extensions: &'a [Vec<u8>],
    max_length: usize,
    files_dir: &'a Path,
    listfile: &'a ListfileStore,
    log: &'a LogFn<'a>,
    shared: Mutex<BruteShared>,
    done: AtomicBool,
    cancel: &'a CancellationToken,
}

impl BruteContext<'_> {
    fn stopped(&self) -> bool {
        self.done.load(Ordering::Relaxed) || self.cancel.is_cancelled()
    }

    fn confirm(&self, directory: &str, body: &[u8], extension: &[u8]) {
        let mut name = String::with_capacity(directory.len() + body.len() + extension.len());
        name.push_str(directory);
        name.push_str(&String::from_utf8_lossy(body));
        name.push_str(&String::from_utf8_lossy(extension));

        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.extracted.contains(&name.to_lowercase()) {
            return;
        }
        let Some(block) = self.archive.block_of(&name) else {
            log::debug!("fingerprint collision on {name}");
            return;
        };
        if self.archive.is_block_named(block) || !shared.resolved_blocks.insert(block) {
            return;
        }

        match self.archive.read_file(&name) {
            Ok(data) => {
                if let Err(err) = write_extracted(self.files_dir, &name, &data) {
                    log::warn!("failed to write {name}: {err}");
                }
            }
            Err(err) => {
                log::warn!("failed to extract {name}: {err}");
                shared.unreadable.push((name.clone(), err.to_string()));
            }
        }
        shared.extracted.insert(name.to_lowercase());
        self.listfile.append(&name);
        (self.log)(&format!("added to global listfile: {name}"));
        shared.found.push(name);
        shared.remaining = shared.remaining.saturating_sub(1);
        (self.log)(&format!("unknown files remaining: {}", shared.remaining));
        if shared.remaining == 0 {
            self.done.store(true, Ordering::Relaxed);
        }
    }

    fn search_directory(&self, directory: &str) {
        let base = NamePair::new().feed(directory.as_bytes());
        let symbols = self.alphabet.len();

        for length in 1..=self.max_length {
            if self.stopped() {
                return;
            }
            (self.log)(&format!(
                "Brute forcing length {length}. Directory: {directory}"
            ));

            let mut digits = vec![0usize; length];
            let mut body = vec![self.alphabet[0]; length];
            let mut states = vec![base; length + 1];
            for i in 0..length {
                states[i + 1] = states[i];
                states[i + 1].feed_byte(body[i]);
            }

            'candidates: loop {
                let state = states[length];
                for extension in self.extensions {
                    if self.unknown.contains(&state.feed(extension).fingerprint()) {
                        self.confirm(directory, &body, extension);
                    }
                }

                let mut pos = length;
                loop {
                    if pos == 0 {
                        break 'candidates;
                    }
                    pos -= 1;
                    digits[pos] += 1;
                    if digits[pos] < symbols {
                        break;
                    }
                    digits[pos] = 0;
                }

                // The last digit wrapped: a whole generation of candidates is done.
                if pos + 1 < length && self.stopped() {
                    return;
                }

                for i in pos..length {
                    body[i] = self.alphabet[digits[i]];
                    states[i + 1] = states[i];
                    states[i + 1].feed_byte(body[i]);
                }
            }
        }
    }
}

/// Writes an extracted payload below `files_dir`, ignoring `.`/`..` components.
pub fn write_extracted(files_dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    let safe: Vec<&str> = name
        .split(['\\', '/'])
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect();
    let path = join_candidate(files_dir, &safe.join("\\"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, data)?;
    Ok(path)
}

pub struct Resolver<'a> {
    files_dir: PathBuf,
    listfile: &'a ListfileStore,
    log: &'a LogFn<'a>,
    extracted: HashSet<String>,
    extracted_paths: Vec<PathBuf>,
}

impl<'a> Resolver<'a> {
    pub fn new(files_dir: &Path, listfile: &'a ListfileStore, log: &'a LogFn<'a>) -> Self {
        Self {
            files_dir: files_dir.to_path_buf(),
            listfile,
            log,
            extracted: HashSet::new(),
            extracted_paths: Vec::new(),
        }
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn extracted_paths(&self) -> &[PathBuf] {
        &self.extracted_paths
    }

    /// Names every entry matching a known name. These are not discoveries, so
    /// nothing is added to the listfile.
    pub fn lookup_names<'n>(
        &mut self,
        archive: &mut Archive,
        names: impl IntoIterator<Item = &'n str>,
    ) -> usize {
        let mut resolved = 0;
        for name in names {
            let name = archive_path(name);
            if !name.is_empty() && archive.resolve(&name) {
                resolved += 1;
            }
        }
        (self.log)(&format!("Resolved {resolved} names by direct lookup"));
        resolved
    }

    /// Extracts every named entry and returns the paths of unknown payloads, which
    /// are written to `unknowns/unknown_N` for scanning.
    pub fn extract_all(
        &mut self,
        archive: &Archive,
        report: &mut ProtectionReport,
    ) -> Result<Vec<PathBuf>> {
        let mut unknown_paths = Vec::new();
        for entry in archive.entries() {
            let data = match archive.extract(&entry) {
                Ok(data) => data,
                Err(err) => {
                    let label = entry.name.clone().unwrap_or_else(|| {
                        format!("block {}", entry.block_index)
                    });
                    (self.log)(&format!("Unable to extract {label}: {err}"));
                    report.unreadable(&label, err);
                    continue;
                }
            };
            match &entry.name {
                Some(name) => {
                    if !self.extracted.insert(name.to_lowercase()) {
                        continue;
                    }
                    let path = write_extracted(&self.files_dir, name, &data)?;
                    (self.log)(&format!("Extracted from MPQ: {name}"));
                    self.extracted_paths.push(path);
                }
                None => {
                    let name = format!("unknowns\\unknown_{}", unknown_paths.len() + 1);
                    unknown_paths.push(write_extracted(&self.files_dir, &name, &data)?);
                }
            }
        }
        Ok(unknown_paths)
    }

    fn try_candidate(
        &mut self,
        archive: &mut Archive,
        candidate: &str,
        report: &mut ProtectionReport,
    ) -> Result<bool> {
        let name = archive_path(candidate);
        if name.is_empty() || self.extracted.contains(&name.to_lowercase()) {
            return Ok(false);
        }
        if !archive.resolve(&name) {
            return Ok(false);
        }

        match archive.read_file(&name) {
            Ok(data) => {
                let path = write_extracted(&self.files_dir, &name, &data)?;
                self.extracted_paths.push(path);
            }
            Err(err) => {
                (self.log)(&format!("Unable to extract {name}: {err}"));
                report.unreadable(&name, err);
            }
        }
        self.extracted.insert(name.to_lowercase());
        self.listfile.append(&name);
        report.new_listfile_entries_found += 1;
        (self.log)(&format!("added to global listfile: {name}"));
        Ok(true)
    }

    fn try_candidates(
        &mut self,
        archive: &mut Archive,
        candidates: impl IntoIterator<Item = String>,
        report: &mut ProtectionReport,
    ) -> Result<usize> {
        let mut remaining = archive.count_unknown();
        let mut found = 0;
        for candidate in candidates {
            if remaining == 0 {
                break;
            }
            if self.try_candidate(archive, &candidate, report)? {
                found += 1;
                remaining -= 1;
            }
        }
        Ok(found)
    }

    /// Projects well-known and referenced file names into every directory that
    /// already holds a resolved file.
    pub fn directory_projection(
        &mut self,
        archive: &mut Archive,
        scan: &ReferenceScan,
        report: &mut ProtectionReport,
    ) -> Result<usize> {
        if archive.count_unknown() == 0 {
            return Ok(0);
        }
        (self.log)("Projecting known names into resolved directories...");

        let mut directories: BTreeSet<String> = archive
            .known_names()
            .iter()
            .map(|name| directory_of(&archive_path(name)).to_string())
            .collect();
        directories.insert(String::new());

        let mut names: BTreeSet<String> = WELL_KNOWN_NAMES
            .iter()
            .map(|name| base_name(name).to_string())
            .collect();
        names.extend(scan.file_names());

        let mut candidates = Vec::with_capacity(directories.len() * names.len());
        for directory in &directories {
            for name in &names {
                candidates.push(join_archive(directory, name));
            }
        }
        let found = self.try_candidates(archive, candidates, report)?;
        (self.log)(&format!("Directory projection found {found} files"));
        Ok(found)
    }

    /// Tries every path referenced inside extracted payloads, then every
    /// referenced file name inside every ancestor of every known directory.
    pub fn reference_scan(
        &mut self,
        archive: &mut Archive,
        scan: &ReferenceScan,
        unknown_paths: &[PathBuf],
        report: &mut ProtectionReport,
    ) -> Result<usize> {
        if archive.count_unknown() == 0 {
            return Ok(0);
        }
        (self.log)("Performing deep scan for unknown files ...");

        let mut found = self.try_candidates(archive, scan.paths.iter().cloned(), report)?;

        let mut directories = scan.directories();
        for path in self.extracted_paths.iter().chain(unknown_paths) {
            if let Some(name) = crate::mpq::archive_name(&self.files_dir, path) {
                directories.insert(directory_of(&name).to_uppercase());
            }
        }
        let closure = prefix_closure(&directories);
        let file_names = scan.file_names();

        let mut candidates = Vec::with_capacity(closure.len() * file_names.len());
        for directory in &closure {
            for name in &file_names {
                candidates.push(join_archive(directory, name));
            }
        }
        found += self.try_candidates(archive, candidates, report)?;
        (self.log)(&format!("Scanning completed, {found} filenames found"));
        Ok(found)
    }

    /// Exhaustive search over short names in every known directory. Returns what
    /// was found so far when `cancel` fires.
    pub fn brute_force(
        &mut self,
        archive: &mut Archive,
        settings: &BruteForceSettings,
        cancel: &CancellationToken,
        report: &mut ProtectionReport,
    ) -> Result<usize> {
        let remaining = archive.count_unknown();
        (self.log)(&format!("unknown files remaining: {remaining}"));
        if remaining == 0 {
            return Ok(0);
        }

        let unknown = archive.unknown_fingerprints();
        let directories: BTreeSet<String> = archive
            .known_names()
            .iter()
            .map(|name| {
                let directory = directory_of(&archive_path(name)).to_uppercase();
                if directory.is_empty() {
                    directory
                } else {
                    format!("{directory}\\")
                }
            })
            .collect();
        let directories: Vec<String> = directories.into_iter().collect();

        let mut alphabet: Vec<u8> = Vec::new();
        for byte in settings.alphabet.to_ascii_uppercase().bytes() {
            if !alphabet.contains(&byte) {
                alphabet.push(byte);
            }
        }
        if alphabet.is_empty() || directories.is_empty() {
            return Ok(0);
        }
        let extensions: Vec<Vec<u8>> = settings
            .extensions
            .iter()
            .map(|ext| format!(".{}", ext.trim_start_matches('.')).to_uppercase().into_bytes())
            .collect();

        (self.log)(&format!(
            "Brute forcing filenames from length 1 to {}",
            settings.max_length
        ));

        let ctx = BruteContext {
            archive: &*archive,
            unknown: &unknown,
            alphabet: &alphabet,
            extensions: &extensions,
            max_length: settings.max_length,
            files_dir: &self.files_dir,
            listfile: self.listfile,
            log: self.log,
            shared: Mutex::new(BruteShared {
                extracted: self.extracted.clone(),
                resolved_blocks: HashSet::new(),
                found: Vec::new(),
                unreadable: Vec::new(),
                remaining,
            }),
            done: AtomicBool::new(false),
            cancel,
        };

        directories
            .par_iter()
            .for_each(|directory| ctx.search_directory(directory));

        let BruteShared {
            found, unreadable, ..
        } = ctx.shared.into_inner().unwrap_or_else(PoisonError::into_inner);
        for name in &found {
            archive.resolve(name);
            self.extracted.insert(name.to_lowercase());
            if !unreadable.iter().any(|(failed, _)| failed == name) {
                self.extracted_paths.push(join_candidate(&self.files_dir, name));
            }
        }
        for (name, reason) in &unreadable {
            report.unreadable(name, reason);
        }
        report.new_listfile_entries_found += found.len();
        (self.log)(&format!("Brute force found {} files", found.len()));
        Ok(found.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpq::ArchiveBuilder;

    fn quiet(_: &str) {}

    fn archive_with(files: &[(&str, &[u8])]) -> Archive {
        let mut builder = ArchiveBuilder::new().include_listfile(false);
        for (name, data) in files {
            builder.add_file(name, data.to_vec());
        }
        Archive::open(builder.build().unwrap()).unwrap()
    }

    #[test]
    fn scan_expands_texture_and_model_variants() {
        let pattern = reference_pattern().unwrap();
        let mut scan = ReferenceScan::default();
        scan.scan_bytes(
            &pattern,
            b"\x00\x01ReplaceableTextures\\\\CommandButtons\\\\BTNHero.blp\x00 model=Units\\Hero.MDX;",
        );
        let expected = [
            "ReplaceableTextures\\CommandButtons\\BTNHero.blp",
            "ReplaceableTextures\\CommandButtons\\BTNHero.tga",
            "ReplaceableTextures\\CommandButtonsDisabled\\DISBTNHero.blp",
            "ReplaceableTextures\\CommandButtonsDisabled\\DISBTNHero.tga",
            "Units\\Hero.mdx",
            "Units\\Hero.mdl",
            "Units\\Hero_Portrait.mdx",
        ];
        for path in expected {
            assert!(scan.paths.contains(path), "missing {path}: {:?}", scan.paths);
        }
        assert!(scan.file_names().contains("HERO_PORTRAIT.MDX"));
    }

    #[test]
    fn longer_extensions_win_over_prefixes() {
        let pattern = reference_pattern().unwrap();
        let mut scan = ReferenceScan::default();
        scan.scan_bytes(&pattern, b"\"scripts\\init.js\"");
        assert!(scan.paths.contains("scripts\\init.js"));
        assert!(!scan.paths.contains("scripts\\init.j"));
    }

    #[test]
    fn prefix_closure_covers_every_ancestor() {
        let dirs: BTreeSet<String> = ["A\\B\\C".to_string()].into_iter().collect();
        let closure = prefix_closure(&dirs);
        for expected in ["A", "A\\B", "A/B", "A\\B\\C", "A/B/C"] {
            assert!(closure.contains(expected));
        }
    }

    #[test]
    fn listfile_lookup_runs_before_any_search() {
        let mut archive = archive_with(&[
            ("data\\alpha.bin", b"alpha"),
            ("data\\beta.bin", b"beta"),
            ("data\\gamma.bin", b"gamma"),
        ]);
        assert_eq!(archive.count_unknown(), 3);

        let dir = tempfile::tempdir().unwrap();
        let listfile = ListfileStore::in_memory();
        listfile.merge(["DATA\\BETA.BIN", "other.txt"]);
        let names = listfile.names();
        let mut resolver = Resolver::new(dir.path(), &listfile, &quiet);
        assert_eq!(resolver.lookup_names(&mut archive, names.iter().map(String::as_str)), 1);
        assert_eq!(archive.count_unknown(), 2);
        assert!(listfile.appended().is_empty());
    }

    #[test]
    fn reference_scan_is_idempotent() {
        let mut archive = archive_with(&[
            ("war3map.j", b"call Preload(\"war3mapImported\\\\intro.mp3\")"),
            ("war3mapImported\\intro.mp3", b"ID3"),
            ("war3mapImported\\hidden.bin", b"?"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let listfile = ListfileStore::in_memory();
        let mut report = ProtectionReport::default();
        let mut resolver = Resolver::new(dir.path(), &listfile, &quiet);

        resolver.lookup_names(&mut archive, ["war3map.j"]);
        let unknown_paths = resolver.extract_all(&archive, &mut report).unwrap();
        assert_eq!(unknown_paths.len(), 2);

        let scan = scan_files(resolver.extracted_paths()).unwrap();
        let found = resolver
            .reference_scan(&mut archive, &scan, &unknown_paths, &mut report)
            .unwrap();
        assert_eq!(found, 1);
        assert_eq!(archive.count_unknown(), 1);
        assert_eq!(report.new_listfile_entries_found, 1);
        assert!(dir.path().join("war3mapImported").join("intro.mp3").exists());

        let again = resolver
            .reference_scan(&mut archive, &scan, &unknown_paths, &mut report)
            .unwrap();
        assert_eq!(again, 0);
        assert_eq!(archive.count_unknown(), 1);
        assert_eq!(listfile.len(), 1);
        assert_eq!(report.new_listfile_entries_found, 1);
    }

    #[test]
    fn undecodable_entries_are_reported() {
        let mut builder = ArchiveBuilder::new().include_listfile(false);
        builder.add_file("Textures\\Packed.blp", vec![7u8; 10_000]);
        builder.add_file("war3map.j", b"// script".to_vec());
        let mut raw = builder.build().unwrap();
        // First block: 32-byte header, then a four-entry sector table.
        assert_eq!(raw[48], 0x02);
        raw[48] = 0x08;
        let mut archive = Archive::open(raw).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let listfile = ListfileStore::in_memory();
        let mut report = ProtectionReport::default();
        let mut resolver = Resolver::new(dir.path(), &listfile, &quiet);
        resolver.lookup_names(&mut archive, ["Textures\\Packed.blp", "war3map.j"]);
        let unknown_paths = resolver.extract_all(&archive, &mut report).unwrap();

        assert!(unknown_paths.is_empty());
        assert_eq!(report.unreadable_file_count, 1);
        assert!(report.warnings[0].starts_with("WARNING: Textures\\Packed.blp could not be extracted"));
        assert!(dir.path().join("war3map.j").exists());
        assert!(!dir.path().join("Textures").join("Packed.blp").exists());
    }

    #[test]
    fn directory_projection_finds_well_known_siblings() {
        let mut archive = archive_with(&[
            ("war3map.j", b"// script"),
            ("war3map.w3e", b"W3E!"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let listfile = ListfileStore::in_memory();
        let mut report = ProtectionReport::default();
        let mut resolver = Resolver::new(dir.path(), &listfile, &quiet);
        resolver.lookup_names(&mut archive, ["war3map.j"]);

        let found = resolver
            .directory_projection(&mut archive, &ReferenceScan::default(), &mut report)
            .unwrap();
        assert_eq!(found, 1);
        assert_eq!(archive.count_unknown(), 0);
        assert_eq!(listfile.appended(), vec!["war3map.w3e".to_string()]);
    }

    #[test]
    fn brute_force_recovers_hidden_names_without_false_matches() {
        let hidden = ["Textures\\Q.blp", "Textures\\ZZ.mdx", "X7.dds"];
        let mut archive = archive_with(&[
            ("war3map.j", b"// script"),
            ("Textures\\known.txt", b"known"),
            (hidden[0], b"q"),
            (hidden[1], b"zz"),
            (hidden[2], b"x7"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let listfile = ListfileStore::in_memory();
        let mut report = ProtectionReport::default();
        let mut resolver = Resolver::new(dir.path(), &listfile, &quiet);
        resolver.lookup_names(&mut archive, ["war3map.j", "Textures\\known.txt"]);
        assert_eq!(archive.count_unknown(), 3);

        let settings = BruteForceSettings {
            max_length: 2,
            ..BruteForceSettings::default()
        };
        let found = resolver
            .brute_force(&mut archive, &settings, &CancellationToken::new(), &mut report)
            .unwrap();

        assert_eq!(found, 3);
        assert_eq!(archive.count_unknown(), 0);
        assert_eq!(report.new_listfile_entries_found, 3);
        let mut appended: Vec<String> = listfile.appended();
        appended.sort();
        let mut expected: Vec<String> = hidden.iter().map(|n| n.to_uppercase()).collect();
        expected.sort();
        assert_eq!(appended, expected);
        for name in &appended {
            assert!(archive.contains(name));
        }
        assert_eq!(fs::read(dir.path().join("TEXTURES").join("ZZ.MDX")).unwrap(), b"zz");
    }

    #[test]
    fn cancelled_brute_force_returns_quietly() {
        let mut archive = archive_with(&[("war3map.j", b"// script"), ("A.blp", b"a")]);
        let dir = tempfile::tempdir().unwrap();
        let listfile = ListfileStore::in_memory();
        let mut report = ProtectionReport::default();
        let mut resolver = Resolver::new(dir.path(), &listfile, &quiet);
        resolver.lookup_names(&mut archive, ["war3map.j"]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let found = resolver
            .brute_force(&mut archive, &BruteForceSettings::default(), &cancel, &mut report)
            .unwrap();
        assert_eq!(found, 0);
        assert_eq!(archive.count_unknown(), 1);
    }
}
