//! Recovers editor metadata from the map script.
//!
//! The editor writes placed objects, sounds, cameras, regions and triggers into a
//! fixed set of generated functions. Protection tools strip the binary files the
//! editor reads but must keep the script working, so the same information can be
//! read back out of everything `config` and `main` execute.
//!
//! Each section has a [`SectionExtractor`] that tries the section's file formats
//! newest first, with the version found in the input map tried before the rest.
//! The whole set is retried under every map-info version until every section is
//! recovered. When units had to be renumbered, their variables are renamed to the
//! editor's names and the decompile runs once more.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::jass::{self, walk, Function, Statement, Unit};
use crate::normalize::{flatten, inline_functions};
use crate::report::ProtectionReport;
use crate::sections::{
    MapCameras, MapRegions, MapSounds, MapUnits, CAMERAS_FILE, REGIONS_FILE, SOUNDS_FILE,
    UNITS_FILE,
};
use crate::triggers::{MapTriggers, TRIGGERS_FILE, TRIGGER_TEXT_FILE};
use crate::{LogFn, Result};

mod environment;
mod eval;
mod triggers;
mod units;

/// Functions the editor regenerates on save.
pub const NATIVE_EDITOR_FUNCTIONS: &[&str] = &[
    "config",
    "main",
    "CreateAllUnits",
    "CreateAllItems",
    "CreateNeutralPassiveBuildings",
    "CreatePlayerBuildings",
    "CreatePlayerUnits",
    "InitCustomPlayerSlots",
    "InitGlobals",
    "InitCustomTriggers",
    "RunInitializationTriggers",
    "CreateRegions",
    "CreateCameras",
    "InitSounds",
    "InitCustomTeams",
    "InitAllyPriorities",
    "CreateNeutralPassive",
    "CreateNeutralHostile",
];

/// Known `war3map.w3i` format versions, newest first.
pub const MAP_INFO_VERSIONS: &[i32] = &[33, 32, 31, 28, 27, 26, 25, 24, 23, 18, 15];

/// First map-info version with 24 player slots and extended camera records.
const NEW_FORMAT_MAP_INFO: i32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionKind {
    Sounds,
    Cameras,
    Regions,
    Triggers,
    Units,
}

impl SectionKind {
    pub const ALL: [SectionKind; 5] = [
        SectionKind::Sounds,
        SectionKind::Cameras,
        SectionKind::Regions,
        SectionKind::Triggers,
        SectionKind::Units,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SectionKind::Sounds => "map sounds",
            SectionKind::Cameras => "map cameras",
            SectionKind::Regions => "map regions",
            SectionKind::Triggers => "map triggers",
            SectionKind::Units => "map units",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatCandidate {
    pub version: i32,
    pub sub_version: i32,
}

impl FormatCandidate {
    pub const fn new(version: i32, sub_version: i32) -> Self {
        Self {
            version,
            sub_version,
        }
    }
}

/// Format versions read from the sections that survived in the input map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionHints {
    pub map_info: Option<i32>,
    pub sections: BTreeMap<SectionKind, FormatCandidate>,
}

impl VersionHints {
    pub fn section(&self, kind: SectionKind) -> Option<FormatCandidate> {
        self.sections.get(&kind).copied()
    }
}

/// `all` with `hint` moved to the front when it is one of them.
pub fn ordered_candidates<T: Copy + PartialEq>(all: &[T], hint: Option<T>) -> Vec<T> {
    let mut out = Vec::with_capacity(all.len());
    if let Some(hint) = hint.filter(|h| all.contains(h)) {
        out.push(hint);
    }
    out.extend(all.iter().copied().filter(|c| Some(*c) != hint));
    out
}

/// Why a format candidate did not fit the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Miss(pub String);

#[derive(Debug, Clone, PartialEq)]
pub enum SectionData {
    Sounds(MapSounds),
    Cameras(MapCameras),
    Regions(MapRegions),
    Triggers(MapTriggers),
    Units {
        units: MapUnits,
        /// Variables whose names do not match the recovered creation numbers.
        renames: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    NotAttempted,
    Recovered,
    Exhausted,
}

/// What one extractor sees for one map-info version.
pub struct DecompileContext<'a> {
    /// The script with editor functions renamed and regenerated.
    pub unit: &'a Unit,
    /// Everything `config` and `main` execute, in order.
    pub body: &'a [Statement],
    pub map_info_version: i32,
    pub new_format: bool,
}

impl<'a> DecompileContext<'a> {
    pub fn new(unit: &'a Unit, body: &'a [Statement], map_info_version: i32) -> Self {
        Self {
            unit,
            body,
            map_info_version,
            new_format: map_info_version >= NEW_FORMAT_MAP_INFO,
        }
    }
}

pub trait SectionExtractor: Sync {
    fn kind(&self) -> SectionKind;

    /// Formats this extractor can write, newest first.
    fn candidates(&self) -> &'static [FormatCandidate];

    fn extract(
        &self,
        ctx: &DecompileContext<'_>,
        format: FormatCandidate,
    ) -> std::result::Result<SectionData, Miss>;
}

static EXTRACTORS: &[&dyn SectionExtractor] = &[
    &environment::SoundExtractor,
    &environment::CameraExtractor,
    &environment::RegionExtractor,
    &triggers::TriggerExtractor,
    &units::UnitExtractor,
];

/// Builds the script the extractors read: helper functions reached from `config`
/// and `main` are inlined, the editor's own functions are renamed with an `_old`
/// suffix, and each editor function is redefined to run the whole flattened
/// program. Returns the new unit and that program.
pub fn synthesize(source: &Unit, log: &LogFn) -> (Unit, Vec<Statement>) {
    let config = flatten(source, "config");
    let main = flatten(source, "main");
    let include: HashSet<String> = config.expanded.into_iter().chain(main.expanded).collect();
    let mut body = config.statements;
    body.extend(main.statements);

    let mut unit = source.clone();
    inline_functions(&mut unit, Some(&include), log);

    let renames: HashMap<String, String> = NATIVE_EDITOR_FUNCTIONS
        .iter()
        .map(|name| {
            let mut new_name = format!("{name}_old");
            while unit.has_function(&new_name) {
                new_name.push_str("_old");
            }
            (name.to_string(), new_name)
        })
        .collect();
    walk::rename_functions(&mut unit, &renames);

    for name in NATIVE_EDITOR_FUNCTIONS {
        let mut func = Function::new(name);
        func.body = body.clone();
        unit.push_function(func);
    }
    (unit, body)
}

/// Sections recovered from a script.
#[derive(Debug, Clone, Default)]
pub struct Decompiled {
    pub sounds: Option<MapSounds>,
    pub cameras: Option<MapCameras>,
    pub regions: Option<MapRegions>,
    pub triggers: Option<MapTriggers>,
    pub units: Option<MapUnits>,
    pub states: BTreeMap<SectionKind, SectionState>,
    /// Unit and item variables renamed before the second pass.
    pub unit_renames: Vec<(String, String)>,
}

impl Decompiled {
    pub fn state(&self, kind: SectionKind) -> SectionState {
        self.states
            .get(&kind)
            .copied()
            .unwrap_or(SectionState::NotAttempted)
    }

    /// Encoded files for every recovered section.
    pub fn files(&self) -> Vec<(&'static str, Vec<u8>)> {
        let mut files = Vec::new();
        if let Some(sounds) = &self.sounds {
            files.push((SOUNDS_FILE, sounds.encode()));
        }
        if let Some(cameras) = &self.cameras {
            files.push((CAMERAS_FILE, cameras.encode()));
        }
        if let Some(regions) = &self.regions {
            files.push((REGIONS_FILE, regions.encode()));
        }
        if let Some(triggers) = &self.triggers {
            files.push((TRIGGERS_FILE, triggers.encode_wtg()));
            files.push((TRIGGER_TEXT_FILE, triggers.encode_wct()));
        }
        if let Some(units) = &self.units {
            files.push((UNITS_FILE, units.encode()));
        }
        files
    }
}

struct Pass {
    found: BTreeMap<SectionKind, SectionData>,
    states: BTreeMap<SectionKind, SectionState>,
}

fn run_pass(
    unit: &Unit,
    body: &[Statement],
    hints: &VersionHints,
    create_visual_triggers: bool,
    report: &mut ProtectionReport,
    log: &LogFn,
) -> Pass {
    let wanted: Vec<SectionKind> = SectionKind::ALL
        .into_iter()
        .filter(|kind| *kind != SectionKind::Triggers || create_visual_triggers)
        .collect();
    let mut found: BTreeMap<SectionKind, SectionData> = BTreeMap::new();

    for version in ordered_candidates(MAP_INFO_VERSIONS, hints.map_info) {
        log("Decompiling war3map script file");
        let ctx = DecompileContext::new(unit, body, version);
        for extractor in EXTRACTORS {
            let kind = extractor.kind();
            if found.contains_key(&kind) || !wanted.contains(&kind) {
                continue;
            }
            log(&format!("Decompiling {}", kind.label()));
            for format in ordered_candidates(extractor.candidates(), hints.section(kind)) {
                match extractor.extract(&ctx, format) {
                    Ok(data) => {
                        log(&format!("{} recovered", kind.label()));
                        if let SectionData::Units { units, .. } = &data {
                            if units.only_start_locations() {
                                report.warn(
                                    "WARNING: Only unit start locations could be recovered. Map will still open in WorldEditor & run, but units will not be visible in WorldEditor rendering and saving in world editor will corrupt your war3map.j or war3map.lua script file.",
                                );
                            }
                        }
                        found.insert(kind, data);
                        break;
                    }
                    Err(Miss(reason)) => log::debug!(
                        "{} format {}.{} under map info {version}: {reason}",
                        kind.label(),
                        format.version,
                        format.sub_version
                    ),
                }
            }
        }
        if wanted.iter().all(|kind| found.contains_key(kind)) {
            log("Decompiling script finished");
            break;
        }
    }

    let states = SectionKind::ALL
        .into_iter()
        .map(|kind| {
            let state = if found.contains_key(&kind) {
                SectionState::Recovered
            } else if wanted.contains(&kind) {
                SectionState::Exhausted
            } else {
                SectionState::NotAttempted
            };
            (kind, state)
        })
        .collect();
    Pass { found, states }
}

fn collect(pass: Pass) -> Decompiled {
    let mut out = Decompiled {
        states: pass.states,
        ..Decompiled::default()
    };
    for data in pass.found.into_values() {
        match data {
            SectionData::Sounds(sounds) => out.sounds = Some(sounds),
            SectionData::Cameras(cameras) => out.cameras = Some(cameras),
            SectionData::Regions(regions) => out.regions = Some(regions),
            SectionData::Triggers(triggers) => out.triggers = Some(triggers),
            SectionData::Units { units, renames } => {
                out.units = Some(units);
                out.unit_renames = renames;
            }
        }
    }
    out
}

/// Decompiles the metadata sections of a normalized script.
pub fn decompile(
    script: &str,
    hints: &VersionHints,
    create_visual_triggers: bool,
    report: &mut ProtectionReport,
    log: &LogFn,
) -> Result<Decompiled> {
    let source = jass::parse(script)?;
    let (mut unit, body) = synthesize(&source, log);

    let first = collect(run_pass(&unit, &body, hints, create_visual_triggers, report, log));
    if first.unit_renames.is_empty() {
        return Ok(first);
    }

    // a later rename of the same variable wins
    let renames: HashMap<String, String> = first.unit_renames.iter().cloned().collect();
    walk::rename_globals(&mut unit, &renames);
    log("Global generated variables renamed.");
    log("Starting decompile war3map script 2nd pass.");

    let body = unit
        .function("main")
        .map(|main| main.body.clone())
        .unwrap_or_default();
    let mut second = collect(run_pass(&unit, &body, hints, create_visual_triggers, report, log));
    second.unit_renames = first.unit_renames;
    Ok(second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    pub(super) fn context_for(script: &str) -> (Unit, Vec<Statement>) {
        let source = jass::parse(script).unwrap();
        synthesize(&source, &|_: &str| {})
    }

    const MAP: &str = "\
globals
    trigger gg_trg_Start = null
    trigger gg_trg_Tick = null
    unit gg_unit_hfoo_guard = null
    unit gg_unit_hpea_0003 = null
    rect gg_rct_Base = null
    camerasetup gg_cam_Overview = null
    sound gg_snd_Horn = null
endglobals
function InitSounds takes nothing returns nothing
    set gg_snd_Horn = CreateSound(\"Sound\\\\Horn.wav\", false, false, false, 10, 10, \"DefaultEAXON\")
endfunction
function CreateRegions takes nothing returns nothing
    set gg_rct_Base = Rect(0.0, 0.0, 256.0, 256.0)
endfunction
function CreateCameras takes nothing returns nothing
    set gg_cam_Overview = CreateCameraSetup()
    call CameraSetupSetField(gg_cam_Overview, CAMERA_FIELD_LOCAL_YAW, 10.0, 0.0)
endfunction
function CreateUnits takes nothing returns nothing
    set gg_unit_hfoo_guard = CreateUnit(Player(0), 'hfoo', 10.0, 20.0, 0.0)
    set gg_unit_hpea_0003 = CreateUnit(Player(0), 'hpea', 30.0, 40.0, 0.0)
    call SetUnitColor(gg_unit_hfoo_guard, ConvertPlayerColor(3))
endfunction
function Trig_Start_Actions takes nothing returns nothing
    call KillUnit(gg_unit_hfoo_guard)
endfunction
function Trig_Tick_Actions takes nothing returns nothing
    call DoNothing()
endfunction
function InitTrig_Start takes nothing returns nothing
    set gg_trg_Start = CreateTrigger()
    call TriggerAddAction(gg_trg_Start, function Trig_Start_Actions)
endfunction
function InitTrig_Tick takes nothing returns nothing
    set gg_trg_Tick = CreateTrigger()
    call TriggerAddAction(gg_trg_Tick, function Trig_Tick_Actions)
endfunction
function InitCustomTriggers takes nothing returns nothing
    call InitTrig_Start()
    call InitTrig_Tick()
endfunction
function main takes nothing returns nothing
    call InitSounds()
    call CreateRegions()
    call CreateCameras()
    call CreateUnits()
    call InitCustomTriggers()
endfunction
function config takes nothing returns nothing
    call DefineStartLocation(0, 0.0, 0.0)
endfunction
";

    #[test]
    fn candidates_put_the_hint_first() {
        assert_eq!(ordered_candidates(&[3, 2, 1], Some(1)), vec![1, 3, 2]);
        assert_eq!(ordered_candidates(&[3, 2, 1], Some(9)), vec![3, 2, 1]);
        assert_eq!(ordered_candidates(&[3, 2, 1], None), vec![3, 2, 1]);
    }

    #[test]
    fn editor_functions_are_regenerated_over_the_whole_program() {
        let (unit, body) = context_for(MAP);
        assert!(unit.has_function("main_old"));
        assert!(unit.has_function("config_old"));
        assert!(!unit.has_function("InitSounds_old"));
        let main = unit.function("main").unwrap();
        assert_eq!(main.body, body);
        assert!(body
            .iter()
            .any(|s| matches!(s, Statement::Call { name, .. } if name == "DefineStartLocation")));
        for name in NATIVE_EDITOR_FUNCTIONS {
            assert!(unit.has_function(name), "{name} missing");
        }
    }

    #[test]
    fn every_section_is_recovered_with_a_second_pass() {
        let logs = Mutex::new(Vec::new());
        let log = |line: &str| logs.lock().unwrap().push(line.to_string());
        let mut report = ProtectionReport::default();
        let hints = VersionHints {
            map_info: Some(31),
            ..VersionHints::default()
        };

        let decompiled = decompile(MAP, &hints, true, &mut report, &log).unwrap();
        for kind in SectionKind::ALL {
            assert_eq!(decompiled.state(kind), SectionState::Recovered, "{kind:?}");
        }
        assert_eq!(
            decompiled.unit_renames,
            vec![("gg_unit_hfoo_guard".to_string(), "gg_unit_hfoo_0005".to_string())]
        );

        let triggers = decompiled.triggers.as_ref().unwrap();
        let start = &triggers.triggers[0];
        assert!(start.text.contains("KillUnit(gg_unit_hfoo_0005)"));

        let units = decompiled.units.as_ref().unwrap();
        assert_eq!(units.units[1].color, 3);

        let logs = logs.into_inner().unwrap();
        assert!(logs.iter().any(|l| l == "Starting decompile war3map script 2nd pass."));
        assert!(logs.iter().any(|l| l == "map units recovered"));
        assert_eq!(logs.iter().filter(|l| *l == "Decompiling script finished").count(), 2);

        let names: Vec<&str> = decompiled.files().iter().map(|(name, _)| *name).collect();
        assert_eq!(names.len(), 6);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn camera_local_fields_retry_newer_map_info() {
        let hints = VersionHints {
            map_info: Some(25),
            ..VersionHints::default()
        };
        let mut report = ProtectionReport::default();
        let decompiled = decompile(MAP, &hints, false, &mut report, &|_: &str| {}).unwrap();
        let cameras = decompiled.cameras.as_ref().unwrap();
        assert!(cameras.new_format);
        assert_eq!(cameras.cameras[0].local_yaw, 10.0);
        assert_eq!(decompiled.state(SectionKind::Triggers), SectionState::NotAttempted);
        assert!(decompiled.triggers.is_none());
    }

    #[test]
    fn unit_hint_is_tried_first() {
        let mut sections = BTreeMap::new();
        sections.insert(SectionKind::Units, FormatCandidate::new(7, 9));
        let hints = VersionHints {
            map_info: Some(31),
            sections,
        };
        let mut report = ProtectionReport::default();
        let decompiled = decompile(MAP, &hints, false, &mut report, &|_: &str| {}).unwrap();
        let units = decompiled.units.as_ref().unwrap();
        assert_eq!((units.version, units.sub_version), (7, 9));
    }

    #[test]
    fn start_locations_alone_are_reported() {
        let script = "\
function main takes nothing returns nothing
endfunction
function config takes nothing returns nothing
    call DefineStartLocation(0, 0.0, 0.0)
endfunction
";
        let mut report = ProtectionReport::default();
        let decompiled =
            decompile(script, &VersionHints::default(), false, &mut report, &|_: &str| {}).unwrap();
        assert!(decompiled.units.as_ref().unwrap().only_start_locations());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("WARNING: Only unit start locations"));
        assert_eq!(decompiled.state(SectionKind::Sounds), SectionState::Recovered);
    }
}
