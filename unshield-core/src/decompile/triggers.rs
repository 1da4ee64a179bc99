//! Triggers rebuilt as custom-text triggers, one per `gg_trg_*` handle.
//!
//! Every statement of the generated body that acts on a trigger handle is
//! claimed by that trigger and becomes its `InitTrig_` function. Functions the
//! trigger references, and any named `Trig_<name>_*`, move into the trigger text.
//! Whatever is left over becomes the map header script.

use std::collections::HashSet;

use super::{
    DecompileContext, FormatCandidate, Miss, SectionData, SectionExtractor, SectionKind,
    NATIVE_EDITOR_FUNCTIONS,
};
use crate::jass::{render, walk, Expr, Function, Statement};
use crate::triggers::{MapTriggers, Trigger, TriggerCategory, TriggerVariable, BANNER};

pub struct TriggerExtractor;

const TRIGGER_VERSIONS: &[FormatCandidate] = &[FormatCandidate::new(7, 0), FormatCandidate::new(4, 0)];

const CATEGORY: i32 = 0;

fn acts_on(stmt: &Statement, handle: &str) -> bool {
    match stmt {
        Statement::Set { name, .. } => name == handle,
        Statement::Call { args, .. } => {
            matches!(args.first().map(Expr::unparen), Some(Expr::Var(name)) if name == handle)
        }
        _ => false,
    }
}

fn literal(init: &Expr) -> Option<String> {
    match init.unparen() {
        Expr::Integer(raw) | Expr::Real(raw) => Some(raw.clone()),
        Expr::Str(_) => init.unparen().string_value(),
        Expr::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn variables(ctx: &DecompileContext<'_>) -> Vec<TriggerVariable> {
    ctx.unit
        .globals()
        .filter_map(|g| {
            let name = g.name.strip_prefix("udg_")?;
            Some(TriggerVariable {
                name: name.to_string(),
                type_name: g.type_name.clone(),
                is_array: g.is_array,
                array_size: if g.is_array { 1 } else { 0 },
                initial_value: g.init.as_ref().and_then(literal),
            })
        })
        .collect()
}

struct Claim {
    trigger: Trigger,
    short: String,
    functions: Vec<String>,
    /// Statements that become the trigger's `InitTrig_` body.
    init: Vec<Statement>,
    /// Every statement acting on the handle, including the ones folded into flags.
    statements: Vec<Statement>,
}

fn claim(ctx: &DecompileContext<'_>, handle: &str, taken: &mut HashSet<String>) -> Claim {
    let short = handle.strip_prefix("gg_trg_").unwrap_or(handle);
    let mut trigger = Trigger::custom(&short.replace('_', " "), CATEGORY, String::new());
    let mut init = Vec::new();
    let mut statements = Vec::new();
    for stmt in ctx.body.iter().filter(|s| acts_on(s, handle)) {
        statements.push(stmt.clone());
        match stmt {
            Statement::Call { name, .. }
                if name == "ConditionalTriggerExecute" || name == "TriggerExecute" =>
            {
                trigger.run_on_init = true;
            }
            Statement::Call { name, .. } if name == "DisableTrigger" => trigger.initially_off = true,
            other => init.push(other.clone()),
        }
    }

    let mut referenced: HashSet<String> = HashSet::new();
    walk::visit_body_exprs(&init, &mut |e| {
        if let Expr::FunctionRef(name) = e {
            referenced.insert(name.clone());
        }
    });
    let prefix = format!("Trig_{short}_");
    let functions: Vec<String> = ctx
        .unit
        .functions()
        .map(|f| f.name.clone())
        .filter(|name| referenced.contains(name) || name.starts_with(&prefix))
        .filter(|name| !NATIVE_EDITOR_FUNCTIONS.contains(&name.as_str()))
        .filter(|name| taken.insert(name.clone()))
        .collect();

    Claim {
        trigger,
        short: short.to_string(),
        functions,
        init,
        statements,
    }
}

impl SectionExtractor for TriggerExtractor {
    fn kind(&self) -> SectionKind {
        SectionKind::Triggers
    }

    fn candidates(&self) -> &'static [FormatCandidate] {
        TRIGGER_VERSIONS
    }

    fn extract(&self, ctx: &DecompileContext<'_>, format: FormatCandidate) -> Result<SectionData, Miss> {
        let handles: Vec<String> = ctx
            .unit
            .globals()
            .filter(|g| g.type_name == "trigger" && !g.is_array && g.name.starts_with("gg_trg_"))
            .filter(|g| {
                ctx.body.iter().any(|s| {
                    matches!(s, Statement::Set { name, value: Expr::Call(callee, _), .. }
                        if *name == g.name && callee == "CreateTrigger")
                })
            })
            .map(|g| g.name.clone())
            .collect();
        if handles.len() < 2 {
            return Err(Miss(format!("{} trigger definitions", handles.len())));
        }

        let mut taken = HashSet::new();
        let claims: Vec<Claim> = handles
            .iter()
            .map(|handle| claim(ctx, handle, &mut taken))
            .collect();
        let claimed: Vec<Statement> = claims.iter().flat_map(|c| c.statements.clone()).collect();
        let init_functions: HashSet<String> = handles
            .iter()
            .map(|h| format!("InitTrig_{}", h.trim_start_matches("gg_trg_")))
            .collect();

        let mut triggers = Vec::with_capacity(claims.len());
        for Claim {
            mut trigger,
            short,
            functions,
            init,
            ..
        } in claims
        {
            let mut text = String::new();
            for name in &functions {
                if let Some(func) = ctx.unit.function(name) {
                    render::function(&mut text, func);
                }
            }
            let mut init_function = Function::new(&format!("InitTrig_{short}"));
            init_function.body = init;
            render::function(&mut text, &init_function);
            trigger.text = text;
            triggers.push(trigger);
        }
        if let Some(first) = triggers.first_mut() {
            first.description = format!("{BANNER}{}", first.description);
        }

        let mut header = String::new();
        for func in ctx.unit.functions() {
            if taken.contains(&func.name)
                || init_functions.contains(&func.name)
                || NATIVE_EDITOR_FUNCTIONS.contains(&func.name.as_str())
            {
                continue;
            }
            let mut func = func.clone();
            func.body.retain(|s| !claimed.contains(s));
            render::function(&mut header, &func);
        }

        Ok(SectionData::Triggers(MapTriggers {
            version: format.version,
            categories: vec![TriggerCategory {
                id: CATEGORY,
                name: "Triggers".to_string(),
                is_comment: false,
            }],
            variables: variables(ctx),
            triggers,
            header_comment: String::new(),
            header_text: header,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::context_for;
    use super::*;

    const TRIGGERS: &str = "\
globals
    trigger gg_trg_Melee_Initialization = null
    trigger gg_trg_Spawn = null
    integer udg_int_waves = 3
    unit array udg_unit_array_heroes
endglobals
function Helper takes integer i returns integer
    return i * 2
endfunction
function Trig_Melee_Initialization_Actions takes nothing returns nothing
    call MeleeStartingVisibility()
endfunction
function Trig_Spawn_Conditions takes nothing returns boolean
    return udg_int_waves > Helper(1)
endfunction
function SpawnActions takes nothing returns nothing
    set udg_int_waves = udg_int_waves - 1
endfunction
function InitTrig_Melee_Initialization takes nothing returns nothing
    set gg_trg_Melee_Initialization = CreateTrigger()
    call TriggerAddAction(gg_trg_Melee_Initialization, function Trig_Melee_Initialization_Actions)
endfunction
function InitTrig_Spawn takes nothing returns nothing
    set gg_trg_Spawn = CreateTrigger()
    call DisableTrigger(gg_trg_Spawn)
    call TriggerRegisterTimerEventPeriodic(gg_trg_Spawn, 30.0)
    call TriggerAddCondition(gg_trg_Spawn, Condition(function Trig_Spawn_Conditions))
    call TriggerAddAction(gg_trg_Spawn, function SpawnActions)
endfunction
function InitCustomTriggers takes nothing returns nothing
    call InitTrig_Melee_Initialization()
    call InitTrig_Spawn()
endfunction
function RunInitializationTriggers takes nothing returns nothing
    call ConditionalTriggerExecute(gg_trg_Melee_Initialization)
endfunction
function main takes nothing returns nothing
    call InitCustomTriggers()
    call RunInitializationTriggers()
endfunction
function config takes nothing returns nothing
endfunction
";

    fn triggers_of(data: SectionData) -> MapTriggers {
        match data {
            SectionData::Triggers(triggers) => triggers,
            other => panic!("unexpected section {other:?}"),
        }
    }

    #[test]
    fn statements_are_claimed_per_handle() {
        let (unit, body) = context_for(TRIGGERS);
        let ctx = DecompileContext::new(&unit, &body, 31);
        let map = triggers_of(TriggerExtractor.extract(&ctx, FormatCandidate::new(7, 0)).unwrap());

        assert_eq!(map.triggers.len(), 2);
        let melee = &map.triggers[0];
        assert_eq!(melee.name, "Melee Initialization");
        assert!(melee.description.starts_with(BANNER));
        assert!(melee.run_on_init);
        assert!(!melee.initially_off);
        assert!(melee.text.contains("function Trig_Melee_Initialization_Actions takes nothing"));
        assert!(melee.text.contains("function InitTrig_Melee_Initialization takes nothing"));
        assert!(!melee.text.contains("ConditionalTriggerExecute"));

        let spawn = &map.triggers[1];
        assert!(spawn.initially_off);
        assert!(!spawn.run_on_init);
        assert!(spawn.text.contains("function SpawnActions"));
        assert!(spawn.text.contains("function Trig_Spawn_Conditions"));
        assert!(spawn.text.contains("TriggerRegisterTimerEventPeriodic(gg_trg_Spawn, 30.0)"));
        assert!(!spawn.text.contains("DisableTrigger"));
    }

    #[test]
    fn leftovers_go_to_the_header() {
        let (unit, body) = context_for(TRIGGERS);
        let ctx = DecompileContext::new(&unit, &body, 31);
        let map = triggers_of(TriggerExtractor.extract(&ctx, FormatCandidate::new(7, 0)).unwrap());

        assert!(map.header_text.contains("function Helper takes integer i returns integer"));
        assert!(map.header_text.contains("function main_old takes nothing"));
        assert!(map.header_text.contains("function config_old takes nothing"));
        assert!(!map.header_text.contains("ConditionalTriggerExecute"));
        assert!(!map.header_text.contains("function SpawnActions"));
        assert!(!map.header_text.contains("function main takes"));

        assert_eq!(map.variables.len(), 2);
        assert_eq!(map.variables[0].name, "int_waves");
        assert_eq!(map.variables[0].initial_value.as_deref(), Some("3"));
        assert!(map.variables[1].is_array);
        assert_eq!(map.categories.len(), 1);
    }

    #[test]
    fn a_single_trigger_is_not_enough() {
        let script = TRIGGERS.replace("    call InitTrig_Spawn()\n", "");
        let (unit, body) = context_for(&script);
        let ctx = DecompileContext::new(&unit, &body, 31);
        assert!(TriggerExtractor.extract(&ctx, FormatCandidate::new(7, 0)).is_err());
    }
}
