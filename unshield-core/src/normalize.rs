//! Clean-up of an obfuscated map script: rawcode literals, global variable names
//! and single-use helper functions.

use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};

use crate::jass::{self, render, walk, Expr, Function, Statement, Unit};
use crate::report::ProtectionReport;
use crate::{LogFn, Result, UnshieldError};

/// Types whose globals the editor declares for placed objects.
const TOOL_OWNED_TYPES: &[&str] = &["rect", "camerasetup", "sound", "unit", "destructable", "item"];

const SHORT_TYPES: &[(&str, &str)] = &[
    ("rect", "rct"),
    ("sound", "snd"),
    ("trigger", "trg"),
    ("unit", "unit"),
    ("destructable", "dest"),
    ("camerasetup", "cam"),
    ("item", "item"),
    ("integer", "int"),
    ("boolean", "bool"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierClass {
    UserDefined,
    ToolGenerated,
}

fn printable_rawcode(bytes: &[u8; 4]) -> bool {
    bytes
        .iter()
        .all(|&b| (0x20..=0x7E).contains(&b) && b != b'\'' && b != b'\\')
}

/// Rewrites `$XXXXXXXX` literals that spell four printable characters as rawcode
/// literals. Returns whether anything changed.
pub fn deobfuscate_fourcc(script: &str) -> Result<(String, bool)> {
    let pattern = Regex::new(r"\$([0-9a-fA-F]{8})\b")
        .map_err(|e| UnshieldError::Config(e.to_string()))?;
    let mut changed = false;
    let result = pattern.replace_all(script, |caps: &Captures| {
        let hex = &caps[1];
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap_or(0);
        }
        if printable_rawcode(&bytes) {
            changed = true;
            format!("'{}'", String::from_utf8_lossy(&bytes))
        } else {
            caps[0].to_string()
        }
    });
    Ok((result.into_owned(), changed))
}

fn executed_function(stmt: &Statement) -> Option<String> {
    let Statement::Call { name, args } = stmt else {
        return None;
    };
    if name.eq_ignore_ascii_case("ExecuteFunc") {
        return args.first().and_then(Expr::string_value);
    }
    Some(name.clone())
}

/// Statements run by `start`, with every call into a script function followed by
/// that function's own statements.
#[derive(Debug, Default, Clone)]
pub struct Flattened {
    pub statements: Vec<Statement>,
    /// Functions whose bodies were pulled in, in order of first expansion.
    pub expanded: Vec<String>,
}

pub fn flatten(unit: &Unit, start: &str) -> Flattened {
    fn expand<'u>(
        unit: &'u Unit,
        body: &'u [Statement],
        stack: &mut Vec<&'u str>,
        out: &mut Flattened,
    ) {
        for stmt in body {
            out.statements.push(stmt.clone());
            let Some(target) = executed_function(stmt) else {
                continue;
            };
            let Some(callee) = unit.function(&target) else {
                continue;
            };
            if stack.contains(&callee.name.as_str()) {
                continue;
            }
            if !out.expanded.contains(&callee.name) {
                out.expanded.push(callee.name.clone());
            }
            stack.push(&callee.name);
            expand(unit, &callee.body, stack, out);
            stack.pop();
        }
    }

    let mut out = Flattened::default();
    if let Some(func) = unit.function(start) {
        let mut stack = vec![func.name.as_str()];
        expand(unit, &func.body, &mut stack, &mut out);
    }
    out
}

/// Splits globals into editor-owned and hand-written ones.
///
/// Anything referenced from `InitBlizzard` onwards in the flattened `main` was
/// probably written by hand. Trigger handles are always treated as editor-owned.
pub fn classify_globals(unit: &Unit) -> Vec<(String, IdentifierClass)> {
    let main = flatten(unit, "main");
    let mut after_init: HashSet<String> = HashSet::new();
    if let Some(index) = main.statements.iter().position(|stmt| {
        matches!(stmt, Statement::Call { name, .. } if name.eq_ignore_ascii_case("InitBlizzard"))
    }) {
        after_init.extend(walk::identifiers(&main.statements[index..]));
    }

    unit.globals()
        .map(|g| {
            let type_name = g.type_name.to_ascii_lowercase();
            let class = if type_name == "trigger" {
                IdentifierClass::ToolGenerated
            } else if g.is_array
                || after_init.contains(&g.name)
                || !TOOL_OWNED_TYPES.contains(&type_name.as_str())
            {
                IdentifierClass::UserDefined
            } else {
                IdentifierClass::ToolGenerated
            };
            (g.name.clone(), class)
        })
        .collect()
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let head = name.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &name[prefix.len()..])
}

fn starts_with_ignore_case(name: &str, prefix: &str) -> bool {
    strip_prefix_ignore_case(name, prefix).is_some()
}

/// New names for every global: `gg_`/`udg_`, a short type tag unless the name
/// already starts with one, `array_` for arrays, then the old name without its
/// prefix. Collisions get `_2`, `_3`, ...
pub fn global_renames(unit: &Unit, classes: &[(String, IdentifierClass)]) -> HashMap<String, String> {
    let class_of: HashMap<&str, IdentifierClass> =
        classes.iter().map(|(n, c)| (n.as_str(), *c)).collect();
    let mut taken: HashSet<String> = unit.globals().map(|g| g.name.to_lowercase()).collect();
    let mut renames: Vec<(String, String)> = Vec::new();

    for g in unit.globals() {
        let generated = class_of.get(g.name.as_str()) == Some(&IdentifierClass::ToolGenerated);
        let base = strip_prefix_ignore_case(&g.name, "udg_")
            .or_else(|| strip_prefix_ignore_case(&g.name, "gg_"))
            .unwrap_or(&g.name);
        let type_lower = g.type_name.to_ascii_lowercase();
        let short = SHORT_TYPES
            .iter()
            .find(|(long, _)| *long == type_lower)
            .map_or(g.type_name.as_str(), |(_, short)| short);

        let mut name = if generated { "gg_" } else { "udg_" }.to_string();
        if !starts_with_ignore_case(base, &g.type_name) && !starts_with_ignore_case(base, short) {
            name.push_str(short);
            name.push('_');
        }
        if g.is_array && !base.to_lowercase().contains("array") {
            name.push_str("array_");
        }
        name.push_str(base);

        let mut counter = 1;
        while taken.contains(&format!("{name}_{counter}").to_lowercase()) {
            counter += 1;
        }
        let unique = format!("{name}_{counter}");
        taken.insert(unique.to_lowercase());
        renames.push((g.name.clone(), unique));
    }

    renames
        .into_iter()
        .map(|(old, new)| {
            let new = match new.strip_suffix("_1") {
                Some(stem) if !taken.contains(&format!("{stem}_2").to_lowercase()) => {
                    stem.to_string()
                }
                _ => new,
            };
            (old, new)
        })
        .collect()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Occurrences of `name` in `text` not embedded in a longer identifier.
pub fn count_identifier(text: &str, name: &str) -> usize {
    if name.is_empty() {
        return 0;
    }
    let bytes = text.as_bytes();
    text.match_indices(name)
        .filter(|(start, _)| {
            let end = start + name.len();
            let before = *start == 0 || !is_ident_byte(bytes[start - 1]);
            let after = end >= bytes.len() || !is_ident_byte(bytes[end]);
            before && after
        })
        .count()
}

fn body_text(body: &[Statement]) -> String {
    let mut out = String::new();
    render::statements(&mut out, body, 0);
    out
}

fn returns_early(body: &[Statement]) -> bool {
    let mut found = false;
    walk::visit_statements(body, &mut |stmt| {
        if matches!(stmt, Statement::Return(_)) {
            found = true;
        }
    });
    found
}

/// The caller `func` could be spliced into, if it qualifies.
fn inline_parent(
    func: &Function,
    texts: &[(String, String)],
    include: Option<&HashSet<String>>,
) -> Option<String> {
    if include.map_or(false, |set| !set.contains(&func.name)) {
        return None;
    }
    if !func.params.is_empty() || func.has_locals() || returns_early(&func.body) {
        return None;
    }

    let mut parent = None;
    for (name, text) in texts {
        let hits = count_identifier(text, &func.name);
        if hits == 0 {
            continue;
        }
        if name == &func.name || hits > 1 || parent.is_some() {
            return None;
        }
        parent = Some(name.clone());
    }
    parent
}

fn inline_one(unit: &mut Unit, include: Option<&HashSet<String>>) -> Option<String> {
    let texts: Vec<(String, String)> = unit
        .functions()
        .map(|f| (f.name.clone(), body_text(&f.body)))
        .collect();

    let (name, body, parent) = unit.functions().find_map(|func| {
        let parent = inline_parent(func, &texts, include)?;
        let calls_at_top = unit.function(&parent)?.body.iter().any(
            |s| matches!(s, Statement::Call { name, .. } if *name == func.name),
        );
        calls_at_top.then(|| (func.name.clone(), func.body.clone(), parent))
    })?;

    let target = unit.function_mut(&parent)?;
    let old = std::mem::take(&mut target.body);
    for stmt in old {
        match stmt {
            Statement::Call { name: called, .. } if called == name => {
                target.body.extend(body.iter().cloned())
            }
            other => target.body.push(other),
        }
    }
    unit.remove_function(&name);
    Some(name)
}

/// Splices every parameterless, local-free function with exactly one caller into
/// that caller until nothing more can be inlined. With `include`, only the named
/// functions are candidates. Returns the number of functions removed.
pub fn inline_functions(unit: &mut Unit, include: Option<&HashSet<String>>, log: &LogFn) -> usize {
    log("Inlining functions...");
    let mut count = 0;
    while let Some(name) = inline_one(unit, include) {
        log(&format!("Inlining function {name}..."));
        count += 1;
    }
    log(&format!("Inlined {count} functions"));
    count
}

/// Rawcode clean-up, global renaming and inlining of a whole script.
pub fn normalize_script(script: &str, report: &mut ProtectionReport, log: &LogFn) -> Result<String> {
    let original = jass::parse(script)?;
    let classes = classify_globals(&original);

    let (script, changed) = deobfuscate_fourcc(script)?;
    if changed {
        report.protection();
        log("FourCC codes de-obfuscated");
    }

    let mut unit = jass::parse(&script)?;
    let renames = global_renames(&unit, &classes);
    jass::walk::rename_globals(&mut unit, &renames);
    inline_functions(&mut unit, None, log);
    Ok(unit.render())
}
