//! Sounds, camera setups and regions declared by the editor's init functions.

use super::eval::{interpret, Event, Scope, Value};
use super::{DecompileContext, FormatCandidate, Miss, SectionData, SectionExtractor, SectionKind};
use crate::sections::{
    Camera, MapCameras, MapRegions, MapSounds, Region, Sound, SoundFlags,
};

fn editor_name(variable: &str, prefix: &str) -> String {
    variable
        .strip_prefix(prefix)
        .unwrap_or(variable)
        .replace('_', " ")
}

fn arg(args: &[Value], index: usize) -> Option<&Value> {
    args.get(index)
}

fn real(args: &[Value], index: usize) -> Result<f32, Miss> {
    arg(args, index)
        .and_then(Value::as_f32)
        .ok_or_else(|| Miss(format!("argument {index} is not a number")))
}

fn integer(args: &[Value], index: usize) -> Result<i32, Miss> {
    arg(args, index)
        .and_then(Value::as_i32)
        .ok_or_else(|| Miss(format!("argument {index} is not an integer")))
}

fn text(args: &[Value], index: usize) -> Result<String, Miss> {
    arg(args, index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Miss(format!("argument {index} is not a string")))
}

/// `TRIGSTR_012` or a plain integer.
fn string_key(value: Option<&Value>) -> Option<i32> {
    match value? {
        Value::Str(s) => s.trim_start_matches("TRIGSTR_").parse().ok(),
        other => other.as_i32(),
    }
}

pub struct SoundExtractor;

const SOUND_VERSIONS: &[FormatCandidate] = &[
    FormatCandidate::new(3, 0),
    FormatCandidate::new(2, 0),
    FormatCandidate::new(1, 0),
];

fn create_sound(target: &str, args: &[Value]) -> Result<Sound, Miss> {
    let mut sound = Sound::new(target, &text(args, 0)?);
    let mut flags = SoundFlags::empty();
    for (index, flag) in [
        (1, SoundFlags::LOOPING),
        (2, SoundFlags::IS_3D),
        (3, SoundFlags::STOP_OUT_OF_RANGE),
    ] {
        if arg(args, index).and_then(Value::as_bool) == Some(true) {
            flags |= flag;
        }
    }
    sound.flags = flags;
    sound.fade_in = integer(args, 4)?;
    sound.fade_out = integer(args, 5)?;
    sound.eax = text(args, 6)?;
    Ok(sound)
}

fn apply_sound_setter(sound: &mut Sound, name: &str, args: &[Value], version: i32) -> Result<(), Miss> {
    let needs = |required: i32| {
        if version < required {
            Err(Miss(format!("{name} needs sound format {required}")))
        } else {
            Ok(())
        }
    };
    match name {
        "SetSoundParamsFromLabel" => {
            needs(2)?;
            sound.label = text(args, 1)?;
        }
        "SetSoundChannel" => sound.channel = integer(args, 1)?,
        "SetSoundVolume" => sound.volume = integer(args, 1)?,
        "SetSoundPitch" => sound.pitch = real(args, 1)?,
        "SetSoundDistances" => {
            sound.min_distance = real(args, 1)?;
            sound.max_distance = real(args, 2)?;
        }
        "SetSoundDistanceCutoff" => sound.distance_cutoff = real(args, 1)?,
        "SetSoundConeAngles" => {
            sound.cone_inside = real(args, 1)?;
            sound.cone_outside = real(args, 2)?;
            sound.cone_outside_volume = integer(args, 3)?;
        }
        "SetSoundConeOrientation" => {
            sound.cone_orientation = [real(args, 1)?, real(args, 2)?, real(args, 3)?];
        }
        "SetSoundFacialAnimationLabel" => {
            needs(3)?;
            sound.facial_label = text(args, 1)?;
        }
        "SetSoundFacialAnimationGroupLabel" => {
            needs(3)?;
            sound.facial_group_label = text(args, 1)?;
        }
        "SetSoundFacialAnimationSetFilepath" => {
            needs(3)?;
            sound.facial_set_path = text(args, 1)?;
        }
        "SetDialogueSpeakerNameKey" => {
            needs(3)?;
            sound.speaker_name_key = string_key(arg(args, 1)).unwrap_or(-1);
        }
        "SetDialogueTextKey" => {
            needs(3)?;
            sound.dialogue_text_key = string_key(arg(args, 1)).unwrap_or(-1);
        }
        _ => {}
    }
    Ok(())
}

impl SectionExtractor for SoundExtractor {
    fn kind(&self) -> SectionKind {
        SectionKind::Sounds
    }

    fn candidates(&self) -> &'static [FormatCandidate] {
        SOUND_VERSIONS
    }

    fn extract(&self, ctx: &DecompileContext<'_>, format: FormatCandidate) -> Result<SectionData, Miss> {
        let mut sounds: Vec<Sound> = Vec::new();
        let mut scope = Scope::new(ctx.new_format);
        interpret(ctx.body, &mut scope, &mut |_, event| match event {
            Event::Call {
                name: "CreateSound",
                args,
                target: Some(target),
            } if target.starts_with("gg_snd_") => {
                sounds.push(create_sound(target, args)?);
                Ok(Some(Value::Object(sounds.len() - 1)))
            }
            // music is a plain path assigned to the sound variable
            Event::Assign {
                target,
                value: Value::Str(path),
            } if target.starts_with("gg_snd_") => {
                let mut music = Sound::new(target, path);
                music.flags = SoundFlags::MUSIC;
                sounds.push(music);
                Ok(Some(Value::Object(sounds.len() - 1)))
            }
            Event::Call { name, args, .. }
                if name.starts_with("SetSound") || name.starts_with("SetDialogue") =>
            {
                if let Some(index) = args.first().and_then(Value::as_object) {
                    apply_sound_setter(&mut sounds[index], name, args, format.version)?;
                }
                Ok(None)
            }
            _ => Ok(None),
        })?;
        Ok(SectionData::Sounds(MapSounds {
            version: format.version,
            sounds,
        }))
    }
}

pub struct CameraExtractor;

const CAMERA_VERSIONS: &[FormatCandidate] = &[FormatCandidate::new(0, 0)];

fn apply_camera_field(camera: &mut Camera, field: &str, value: f32, new_format: bool) -> Result<(), Miss> {
    let slot = match field {
        "CAMERA_FIELD_ZOFFSET" => &mut camera.z_offset,
        "CAMERA_FIELD_ROTATION" => &mut camera.rotation,
        "CAMERA_FIELD_ANGLE_OF_ATTACK" => &mut camera.angle_of_attack,
        "CAMERA_FIELD_TARGET_DISTANCE" => &mut camera.distance,
        "CAMERA_FIELD_ROLL" => &mut camera.roll,
        "CAMERA_FIELD_FIELD_OF_VIEW" => &mut camera.field_of_view,
        "CAMERA_FIELD_FARZ" => &mut camera.far_z,
        "CAMERA_FIELD_NEARZ" => &mut camera.near_z,
        "CAMERA_FIELD_LOCAL_PITCH" | "CAMERA_FIELD_LOCAL_YAW" | "CAMERA_FIELD_LOCAL_ROLL"
            if !new_format =>
        {
            return Err(Miss(format!("{field} needs the extended camera format")));
        }
        "CAMERA_FIELD_LOCAL_PITCH" => &mut camera.local_pitch,
        "CAMERA_FIELD_LOCAL_YAW" => &mut camera.local_yaw,
        "CAMERA_FIELD_LOCAL_ROLL" => &mut camera.local_roll,
        other => return Err(Miss(format!("unknown camera field {other}"))),
    };
    *slot = value;
    Ok(())
}

impl SectionExtractor for CameraExtractor {
    fn kind(&self) -> SectionKind {
        SectionKind::Cameras
    }

    fn candidates(&self) -> &'static [FormatCandidate] {
        CAMERA_VERSIONS
    }

    fn extract(&self, ctx: &DecompileContext<'_>, format: FormatCandidate) -> Result<SectionData, Miss> {
        let mut cameras: Vec<Camera> = Vec::new();
        let mut scope = Scope::new(ctx.new_format);
        interpret(ctx.body, &mut scope, &mut |_, event| {
            let Event::Call { name, args, target } = event else {
                return Ok(None);
            };
            match (name, target) {
                ("CreateCameraSetup", Some(target)) if target.starts_with("gg_cam_") => {
                    cameras.push(Camera::new(&editor_name(target, "gg_cam_")));
                    return Ok(Some(Value::Object(cameras.len() - 1)));
                }
                ("CameraSetupSetField", _) => {
                    if let Some(index) = args.first().and_then(Value::as_object) {
                        let Some(Value::Handle(field)) = args.get(1) else {
                            return Err(Miss("camera field is not a constant".to_string()));
                        };
                        let value = real(args, 2)?;
                        apply_camera_field(&mut cameras[index], field, value, ctx.new_format)?;
                    }
                }
                ("CameraSetupSetDestPosition", _) => {
                    if let Some(index) = args.first().and_then(Value::as_object) {
                        cameras[index].target = [real(args, 1)?, real(args, 2)?];
                    }
                }
                _ => {}
            }
            Ok(None)
        })?;
        Ok(SectionData::Cameras(MapCameras {
            version: format.version,
            new_format: ctx.new_format,
            cameras,
        }))
    }
}

pub struct RegionExtractor;

const REGION_VERSIONS: &[FormatCandidate] = &[FormatCandidate::new(5, 0)];

impl SectionExtractor for RegionExtractor {
    fn kind(&self) -> SectionKind {
        SectionKind::Regions
    }

    fn candidates(&self) -> &'static [FormatCandidate] {
        REGION_VERSIONS
    }

    fn extract(&self, ctx: &DecompileContext<'_>, format: FormatCandidate) -> Result<SectionData, Miss> {
        let mut regions: Vec<Region> = Vec::new();
        let mut scope = Scope::new(ctx.new_format);
        interpret(ctx.body, &mut scope, &mut |_, event| {
            let Event::Call { name, args, target } = event else {
                return Ok(None);
            };
            match (name, target) {
                ("Rect", Some(target)) if target.starts_with("gg_rct_") => {
                    regions.push(Region {
                        name: editor_name(target, "gg_rct_"),
                        left: real(args, 0)?,
                        bottom: real(args, 1)?,
                        right: real(args, 2)?,
                        top: real(args, 3)?,
                        creation_number: regions.len() as i32,
                        weather: None,
                        ambient_sound: String::new(),
                        color: [0xFF; 3],
                    });
                    Ok(Some(Value::Object(regions.len() - 1)))
                }
                ("AddWeatherEffect", _) => {
                    if let Some(index) = args.first().and_then(Value::as_object) {
                        regions[index].weather = arg(args, 1).and_then(Value::as_object_id);
                    }
                    Ok(None)
                }
                _ => Ok(None),
            }
        })?;
        Ok(SectionData::Regions(MapRegions {
            version: format.version,
            regions,
        }))
    }
}
