//! Binary encoders for the editor-only metadata sections rebuilt from the script.
//!
//! Everything is little-endian and strings are NUL-terminated.

use bitflags::bitflags;

/// Four-character object identifier such as `hfoo`.
pub type ObjectId = [u8; 4];

pub const START_LOCATION: ObjectId = *b"sloc";

pub const SOUNDS_FILE: &str = "war3map.w3s";
pub const CAMERAS_FILE: &str = "war3map.w3c";
pub const REGIONS_FILE: &str = "war3map.w3r";
pub const UNITS_FILE: &str = "war3mapUnits.doo";

pub fn object_id(text: &str) -> Option<ObjectId> {
    text.as_bytes().try_into().ok()
}

/// Byte sink shared by the section and trigger encoders.
#[derive(Debug, Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.i32(value as i32)
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn cstr(&mut self, value: &str) -> &mut Self {
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SoundFlags: u32 {
        const LOOPING = 0x1;
        const IS_3D = 0x2;
        const STOP_OUT_OF_RANGE = 0x4;
        const MUSIC = 0x8;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sound {
    /// Global variable name, `gg_snd_*`.
    pub name: String,
    pub path: String,
    pub eax: String,
    pub flags: SoundFlags,
    pub fade_in: i32,
    pub fade_out: i32,
    pub volume: i32,
    pub pitch: f32,
    pub pitch_variance: f32,
    pub priority: i32,
    pub channel: i32,
    pub min_distance: f32,
    pub max_distance: f32,
    pub distance_cutoff: f32,
    pub cone_inside: f32,
    pub cone_outside: f32,
    pub cone_outside_volume: i32,
    pub cone_orientation: [f32; 3],
    pub label: String,
    pub asset_label: String,
    pub dialogue_text_key: i32,
    pub speaker_name_key: i32,
    pub facial_label: String,
    pub facial_group_label: String,
    pub facial_set_path: String,
}

impl Sound {
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            eax: "DefaultEAXON".to_string(),
            flags: SoundFlags::empty(),
            fade_in: 10,
            fade_out: 10,
            volume: -1,
            pitch: 1.0,
            pitch_variance: 0.0,
            priority: -1,
            channel: 0,
            min_distance: -1.0,
            max_distance: -1.0,
            distance_cutoff: -1.0,
            cone_inside: -1.0,
            cone_outside: -1.0,
            cone_outside_volume: -1,
            cone_orientation: [-1.0; 3],
            label: String::new(),
            asset_label: String::new(),
            dialogue_text_key: -1,
            speaker_name_key: -1,
            facial_label: String::new(),
            facial_group_label: String::new(),
            facial_set_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapSounds {
    pub version: i32,
    pub sounds: Vec<Sound>,
}

impl MapSounds {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i32(self.version).i32(self.sounds.len() as i32);
        for s in &self.sounds {
            w.cstr(&s.name)
                .cstr(&s.path)
                .cstr(&s.eax)
                .i32(s.flags.bits() as i32)
                .i32(s.fade_in)
                .i32(s.fade_out)
                .i32(s.volume)
                .f32(s.pitch)
                .f32(s.pitch_variance)
                .i32(s.priority)
                .i32(s.channel)
                .f32(s.min_distance)
                .f32(s.max_distance)
                .f32(s.distance_cutoff)
                .f32(s.cone_inside)
                .f32(s.cone_outside)
                .i32(s.cone_outside_volume);
            for axis in s.cone_orientation {
                w.f32(axis);
            }
            if self.version >= 2 {
                w.cstr(&s.label).cstr(&s.asset_label);
            }
            if self.version >= 3 {
                w.i32(s.dialogue_text_key)
                    .i32(s.speaker_name_key)
                    .cstr(&s.facial_label)
                    .cstr(&s.facial_group_label)
                    .cstr(&s.facial_set_path);
            }
        }
        w.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub name: String,
    pub target: [f32; 2],
    pub z_offset: f32,
    pub rotation: f32,
    pub angle_of_attack: f32,
    pub distance: f32,
    pub roll: f32,
    pub field_of_view: f32,
    pub far_z: f32,
    pub near_z: f32,
    pub local_pitch: f32,
    pub local_yaw: f32,
    pub local_roll: f32,
}

impl Camera {
    /// Values of a fresh camera object in the editor.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            target: [0.0; 2],
            z_offset: 0.0,
            rotation: 90.0,
            angle_of_attack: 304.0,
            distance: 1650.0,
            roll: 0.0,
            field_of_view: 70.0,
            far_z: 5000.0,
            near_z: 16.0,
            local_pitch: 0.0,
            local_yaw: 0.0,
            local_roll: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapCameras {
    pub version: i32,
    /// Extended layout with local pitch, yaw and roll.
    pub new_format: bool,
    pub cameras: Vec<Camera>,
}

impl MapCameras {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i32(self.version).i32(self.cameras.len() as i32);
        for c in &self.cameras {
            w.f32(c.target[0])
                .f32(c.target[1])
                .f32(c.z_offset)
                .f32(c.rotation)
                .f32(c.angle_of_attack)
                .f32(c.distance)
                .f32(c.roll)
                .f32(c.field_of_view)
                .f32(c.far_z)
                .f32(c.near_z);
            if self.new_format {
                w.f32(c.local_pitch).f32(c.local_yaw).f32(c.local_roll);
            }
            w.cstr(&c.name);
        }
        w.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub name: String,
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
    pub top: f32,
    pub creation_number: i32,
    pub weather: Option<ObjectId>,
    pub ambient_sound: String,
    /// Red, green, blue.
    pub color: [u8; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapRegions {
    pub version: i32,
    pub regions: Vec<Region>,
}

impl MapRegions {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i32(self.version).i32(self.regions.len() as i32);
        for r in &self.regions {
            w.f32(r.left)
                .f32(r.bottom)
                .f32(r.right)
                .f32(r.top)
                .cstr(&r.name)
                .i32(r.creation_number)
                .bytes(&r.weather.unwrap_or([0; 4]))
                .cstr(&r.ambient_sound);
            let [red, green, blue] = r.color;
            w.u8(blue).u8(green).u8(red).u8(0xFF);
        }
        w.finish()
    }
}

/// One unit, item or start location placed on the map.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedObject {
    pub type_id: ObjectId,
    pub variation: i32,
    pub position: [f32; 3],
    /// Radians.
    pub facing: f32,
    pub scale: [f32; 3],
    pub skin_id: ObjectId,
    pub flags: u8,
    pub owner: i32,
    pub hp: i32,
    pub mp: i32,
    pub item_table: i32,
    pub gold: i32,
    pub acquisition_range: f32,
    pub hero_level: i32,
    /// Strength, agility, intelligence.
    pub hero_attributes: [i32; 3],
    pub color: i32,
    pub waygate: i32,
    pub creation_number: i32,
}

impl PlacedObject {
    pub fn new(type_id: ObjectId) -> Self {
        Self {
            type_id,
            variation: 0,
            position: [0.0; 3],
            facing: 0.0,
            scale: [1.0; 3],
            skin_id: type_id,
            flags: 2,
            owner: 0,
            hp: -1,
            mp: -1,
            item_table: -1,
            gold: 12500,
            acquisition_range: -1.0,
            hero_level: 1,
            hero_attributes: [0; 3],
            color: -1,
            waygate: -1,
            creation_number: 0,
        }
    }

    pub fn is_start_location(&self) -> bool {
        self.type_id == START_LOCATION
    }

    /// Editor variable name, `gg_unit_hfoo_0007` or `gg_item_ratf_0012`.
    pub fn variable_name(&self, is_item: bool) -> String {
        let kind = if is_item { "item" } else { "unit" };
        format!(
            "gg_{kind}_{}_{:04}",
            String::from_utf8_lossy(&self.type_id),
            self.creation_number
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapUnits {
    pub version: i32,
    pub sub_version: i32,
    pub units: Vec<PlacedObject>,
}

impl MapUnits {
    pub fn empty() -> Self {
        Self {
            version: 8,
            sub_version: 11,
            units: Vec::new(),
        }
    }

    pub fn only_start_locations(&self) -> bool {
        self.units.iter().all(PlacedObject::is_start_location)
    }

    pub fn encode(&self) -> Vec<u8> {
        let extended = self.sub_version >= 11;
        let mut w = Writer::new();
        w.bytes(b"W3do")
            .i32(self.version)
            .i32(self.sub_version)
            .i32(self.units.len() as i32);
        for u in &self.units {
            w.bytes(&u.type_id)
                .i32(u.variation)
                .f32(u.position[0])
                .f32(u.position[1])
                .f32(u.position[2])
                .f32(u.facing)
                .f32(u.scale[0])
                .f32(u.scale[1])
                .f32(u.scale[2]);
            if self.version >= 8 {
                w.bytes(&u.skin_id);
            }
            w.u8(u.flags).i32(u.owner).u8(0).u8(0).i32(u.hp).i32(u.mp);
            if extended {
                w.i32(u.item_table);
            }
            w.i32(0).i32(u.gold).f32(u.acquisition_range).i32(u.hero_level);
            if extended {
                for attribute in u.hero_attributes {
                    w.i32(attribute);
                }
            }
            // inventory, abilities, random flag and its empty payload
            w.i32(0).i32(0).i32(0).bytes(&[0; 4]);
            w.i32(u.color).i32(u.waygate).i32(u.creation_number);
        }
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_i32(bytes: &[u8], at: usize) -> i32 {
        i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn le_f32(bytes: &[u8], at: usize) -> f32 {
        f32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn region_layout_is_bgr_with_alpha() {
        let regions = MapRegions {
            version: 5,
            regions: vec![Region {
                name: "Spawn".to_string(),
                left: -128.0,
                bottom: 0.0,
                right: 256.0,
                top: 512.0,
                creation_number: 3,
                weather: object_id("RAhr"),
                ambient_sound: String::new(),
                color: [10, 20, 30],
            }],
        };
        let bytes = regions.encode();
        assert_eq!(le_i32(&bytes, 0), 5);
        assert_eq!(le_i32(&bytes, 4), 1);
        assert_eq!(le_f32(&bytes, 8), -128.0);
        assert_eq!(le_f32(&bytes, 20), 512.0);
        assert_eq!(&bytes[24..30], b"Spawn\0");
        assert_eq!(le_i32(&bytes, 30), 3);
        assert_eq!(&bytes[34..38], b"RAhr");
        assert_eq!(bytes[38], 0);
        assert_eq!(&bytes[39..], &[30, 20, 10, 0xFF]);
    }

    #[test]
    fn camera_local_rotation_only_in_new_format() {
        let mut cameras = MapCameras {
            version: 0,
            new_format: false,
            cameras: vec![Camera::new("Intro")],
        };
        let old = cameras.encode();
        cameras.new_format = true;
        let new = cameras.encode();
        assert_eq!(old.len(), 8 + 10 * 4 + 6);
        assert_eq!(new.len(), old.len() + 12);
        assert!(new.ends_with(b"Intro\0"));
        assert_eq!(le_f32(&old, 8 + 3 * 4), 90.0);
    }

    #[test]
    fn sound_versions_append_fields() {
        let mut sounds = MapSounds {
            version: 1,
            sounds: vec![Sound::new("gg_snd_Rain", "Sound\\Rain.wav")],
        };
        sounds.sounds[0].flags = SoundFlags::LOOPING | SoundFlags::MUSIC;
        let v1 = sounds.encode();
        let fixed = 8 + "gg_snd_Rain\0Sound\\Rain.wav\0DefaultEAXON\0".len();
        assert_eq!(le_i32(&v1, fixed), 9);
        assert_eq!(v1.len(), fixed + 4 * 17);

        sounds.version = 2;
        assert_eq!(sounds.encode().len(), v1.len() + 2);
        sounds.version = 3;
        assert_eq!(sounds.encode().len(), v1.len() + 2 + 8 + 3);
    }

    #[test]
    fn unit_record_sizes_follow_version() {
        let mut footman = PlacedObject::new(*b"hfoo");
        footman.creation_number = 7;
        let mut units = MapUnits {
            version: 7,
            sub_version: 9,
            units: vec![footman],
        };
        let base = units.encode();
        assert_eq!(&base[..4], b"W3do");
        assert_eq!(le_i32(&base, 12), 1);
        // id, variation, 7 floats, flags, owner, two unknown bytes, hp, mp,
        // dropped sets, gold, acquisition, level, inventory, abilities, random,
        // random payload, color, waygate, creation number
        let record = 4 + 4 + 28 + 1 + 4 + 2 + 8 + 16 + 12 + 4 + 12;
        assert_eq!(base.len(), 16 + record);
        assert_eq!(le_i32(&base, base.len() - 4), 7);

        units.version = 8;
        units.sub_version = 11;
        assert_eq!(units.encode().len(), 16 + record + 4 + 4 + 12);
    }

    #[test]
    fn variable_names_pad_creation_number() {
        let mut rat = PlacedObject::new(*b"ratf");
        rat.creation_number = 12;
        assert_eq!(rat.variable_name(true), "gg_item_ratf_0012");
        assert_eq!(rat.variable_name(false), "gg_unit_ratf_0012");
    }
}
