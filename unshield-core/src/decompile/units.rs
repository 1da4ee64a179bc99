//! Placed units, items and start locations.

use std::collections::HashSet;

use super::eval::{interpret, Event, Scope, Value};
use super::{DecompileContext, FormatCandidate, Miss, SectionData, SectionExtractor, SectionKind};
use crate::sections::{MapUnits, PlacedObject, START_LOCATION};

pub struct UnitExtractor;

const UNIT_VERSIONS: &[FormatCandidate] = &[
    FormatCandidate::new(8, 11),
    FormatCandidate::new(8, 9),
    FormatCandidate::new(7, 9),
];

struct Placement {
    object: PlacedObject,
    is_item: bool,
    variable: Option<String>,
}

fn real(args: &[Value], index: usize) -> Result<f32, Miss> {
    args.get(index)
        .and_then(Value::as_f32)
        .ok_or_else(|| Miss(format!("argument {index} is not a number")))
}

fn rawcode(args: &[Value], index: usize) -> Result<[u8; 4], Miss> {
    args.get(index)
        .and_then(Value::as_object_id)
        .ok_or_else(|| Miss(format!("argument {index} is not a rawcode")))
}

/// Creation number encoded in an editor variable name such as `gg_unit_hfoo_0012`.
fn numbered(variable: &str) -> Option<i32> {
    let rest = variable
        .strip_prefix("gg_unit_")
        .or_else(|| variable.strip_prefix("gg_item_"))?;
    let (_, digits) = rest.rsplit_once('_')?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn assign_creation_numbers(placements: &mut [Placement]) {
    let mut used = HashSet::new();
    for placement in placements.iter_mut() {
        if let Some(number) = placement.variable.as_deref().and_then(numbered) {
            if used.insert(number) {
                placement.object.creation_number = number;
                continue;
            }
        }
        placement.object.creation_number = -1;
    }
    let mut next = used.iter().max().map_or(0, |max| max + 1);
    for placement in placements.iter_mut().filter(|p| p.object.creation_number < 0) {
        placement.object.creation_number = next;
        next += 1;
    }
}

impl UnitExtractor {
    fn create(
        &self,
        scope: &Scope,
        format: FormatCandidate,
        name: &str,
        args: &[Value],
    ) -> Result<Option<Placement>, Miss> {
        let skinned = name.starts_with("Blz");
        if skinned && format.version < 8 {
            return Err(Miss(format!("{name} needs unit format 8")));
        }
        let placement = match name {
            "CreateUnit" | "BlzCreateUnitWithSkin" => {
                let mut unit = PlacedObject::new(rawcode(args, 1)?);
                unit.owner = args
                    .first()
                    .and_then(Value::as_player)
                    .ok_or_else(|| Miss("unit owner is not a player".to_string()))?;
                unit.position = [real(args, 2)?, real(args, 3)?, 0.0];
                unit.facing = real(args, 4)?.to_radians();
                if skinned {
                    unit.skin_id = rawcode(args, 5)?;
                }
                Placement {
                    object: unit,
                    is_item: false,
                    variable: None,
                }
            }
            "CreateItem" | "BlzCreateItemWithSkin" => {
                let mut item = PlacedObject::new(rawcode(args, 0)?);
                item.owner = scope.neutral_passive();
                item.position = [real(args, 1)?, real(args, 2)?, 0.0];
                if skinned {
                    item.skin_id = rawcode(args, 3)?;
                }
                Placement {
                    object: item,
                    is_item: true,
                    variable: None,
                }
            }
            "DefineStartLocation" => {
                let mut start = PlacedObject::new(START_LOCATION);
                start.owner = args
                    .first()
                    .and_then(Value::as_i32)
                    .ok_or_else(|| Miss("start location index is not an integer".to_string()))?;
                start.position = [real(args, 1)?, real(args, 2)?, 0.0];
                Placement {
                    object: start,
                    is_item: false,
                    variable: None,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(placement))
    }
}

fn apply_setter(
    object: &mut PlacedObject,
    format: FormatCandidate,
    name: &str,
    args: &[Value],
) -> Result<(), Miss> {
    let integer = |index: usize| {
        args.get(index)
            .and_then(Value::as_i32)
            .ok_or_else(|| Miss(format!("{name} argument {index} is not an integer")))
    };
    match name {
        "SetHeroLevel" => object.hero_level = integer(1)?,
        "SetHeroStr" | "SetHeroAgi" | "SetHeroInt" => {
            if format.sub_version < 11 {
                return Err(Miss(format!("{name} needs unit sub-format 11")));
            }
            let slot = match name {
                "SetHeroStr" => 0,
                "SetHeroAgi" => 1,
                _ => 2,
            };
            object.hero_attributes[slot] = integer(1)?;
        }
        "SetResourceAmount" => object.gold = integer(1)?,
        "SetUnitColor" => object.color = integer(1)?,
        "SetUnitAcquireRange" => object.acquisition_range = real(args, 1)?,
        "SetUnitState" => {
            if let Some(Value::Handle(state)) = args.get(1) {
                if state == "UNIT_STATE_MANA" {
                    object.mp = integer(2)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

impl SectionExtractor for UnitExtractor {
    fn kind(&self) -> SectionKind {
        SectionKind::Units
    }

    fn candidates(&self) -> &'static [FormatCandidate] {
        UNIT_VERSIONS
    }

    fn extract(&self, ctx: &DecompileContext<'_>, format: FormatCandidate) -> Result<SectionData, Miss> {
        let mut placements: Vec<Placement> = Vec::new();
        let mut scope = Scope::new(ctx.new_format);
        interpret(ctx.body, &mut scope, &mut |scope, event| {
            let Event::Call { name, args, target } = event else {
                return Ok(None);
            };
            if let Some(mut placement) = self.create(scope, format, name, args)? {
                placement.variable = target
                    .filter(|t| t.starts_with("gg_"))
                    .map(str::to_string);
                placements.push(placement);
                return Ok(Some(Value::Object(placements.len() - 1)));
            }
            if let Some(index) = args.first().and_then(Value::as_object) {
                if let Some(placement) = placements.get_mut(index) {
                    apply_setter(&mut placement.object, format, name, args)?;
                }
            }
            Ok(None)
        })?;

        if placements.is_empty() {
            return Err(Miss("no placed objects".to_string()));
        }
        assign_creation_numbers(&mut placements);

        let mut renames = Vec::new();
        for placement in &placements {
            if let Some(variable) = &placement.variable {
                let canonical = placement.object.variable_name(placement.is_item);
                if *variable != canonical {
                    renames.push((variable.clone(), canonical));
                }
            }
        }
        let units = MapUnits {
            version: format.version,
            sub_version: format.sub_version,
            units: placements.into_iter().map(|p| p.object).collect(),
        };
        Ok(SectionData::Units { units, renames })
    }
}
