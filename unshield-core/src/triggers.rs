//! Trigger definition (`war3map.wtg`) and trigger text (`war3map.wct`) files.
//!
//! [`MapTriggers`] writes the structured files produced by the decompiler. When the
//! script could not be decompiled, [`fallback_from_script`] packs the whole script
//! into a single custom-text trigger so the map still opens in the editor.

use regex::{Captures, Regex};
use std::collections::HashMap;

use crate::decompile::NATIVE_EDITOR_FUNCTIONS;
use crate::sections::Writer;
use crate::{LogFn, Result, UnshieldError};

pub const TRIGGERS_FILE: &str = "war3map.wtg";
pub const TRIGGER_TEXT_FILE: &str = "war3map.wct";

/// First line written into recovered trigger text.
pub const BANNER: &str = "Map recovered by Unshield\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerCategory {
    pub id: i32,
    pub name: String,
    pub is_comment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerVariable {
    /// Name without the `udg_` prefix.
    pub name: String,
    pub type_name: String,
    pub is_array: bool,
    pub array_size: i32,
    pub initial_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub name: String,
    pub description: String,
    pub is_comment: bool,
    pub enabled: bool,
    pub custom_text: bool,
    pub initially_off: bool,
    pub run_on_init: bool,
    pub category: i32,
    /// Script text for custom-text triggers.
    pub text: String,
}

impl Trigger {
    pub fn custom(name: &str, category: i32, text: String) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            is_comment: false,
            enabled: true,
            custom_text: true,
            initially_off: false,
            run_on_init: false,
            category,
            text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapTriggers {
    /// 4 for the original game, 7 for the expansion.
    pub version: i32,
    pub categories: Vec<TriggerCategory>,
    pub variables: Vec<TriggerVariable>,
    pub triggers: Vec<Trigger>,
    pub header_comment: String,
    /// Map-wide custom script shown above all triggers.
    pub header_text: String,
}

impl MapTriggers {
    /// A file with nothing in it, used when triggers cannot be recovered at all.
    pub fn empty() -> Self {
        Self {
            version: 7,
            categories: Vec::new(),
            variables: Vec::new(),
            triggers: Vec::new(),
            header_comment: String::new(),
            header_text: String::new(),
        }
    }

    pub fn encode_wtg(&self) -> Vec<u8> {
        let expansion = self.version >= 7;
        let mut w = Writer::new();
        w.bytes(b"WTG!").i32(self.version);

        w.i32(self.categories.len() as i32);
        for c in &self.categories {
            w.i32(c.id).bytes(&ascii_lossy(&c.name)).u8(0);
            if expansion {
                w.bool(c.is_comment);
            }
        }

        w.i32(2).i32(self.variables.len() as i32);
        for v in &self.variables {
            w.bytes(&ascii_lossy(&v.name))
                .u8(0)
                .bytes(&ascii_lossy(&v.type_name))
                .u8(0)
                .i32(1)
                .bool(v.is_array);
            if expansion {
                w.i32(v.array_size);
            }
            w.bool(v.initial_value.is_some());
            w.bytes(&ascii_lossy(v.initial_value.as_deref().unwrap_or("")))
                .u8(0);
        }

        w.i32(self.triggers.len() as i32);
        for t in &self.triggers {
            w.bytes(&ascii_lossy(&t.name))
                .u8(0)
                .bytes(&ascii_lossy(&t.description))
                .u8(0);
            if expansion {
                w.bool(t.is_comment);
            }
            w.bool(t.enabled).bool(t.custom_text).bool(t.initially_off);
            if expansion {
                w.bool(t.run_on_init);
            }
            // custom-text triggers carry no editor functions
            w.i32(t.category).i32(0);
        }
        w.finish()
    }

    pub fn encode_wct(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.i32(1).bytes(&ascii_lossy(&self.header_comment)).u8(0);
        framed_text(&mut w, &self.header_text);
        w.i32(self.triggers.len() as i32);
        for t in &self.triggers {
            framed_text(&mut w, &t.text);
        }
        w.finish()
    }
}

/// ASCII bytes with one `?` per UTF-16 unit of anything else.
fn ascii_lossy(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii() {
            out.push(c as u8);
        } else {
            out.extend(std::iter::repeat(b'?').take(c.len_utf16()));
        }
    }
    out
}

fn crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Length-prefixed, NUL-terminated text. Empty text is a bare zero length.
fn framed_text(w: &mut Writer, text: &str) {
    if text.is_empty() {
        w.i32(0);
        return;
    }
    let bytes = ascii_lossy(&crlf(text));
    w.i32(bytes.len() as i32 + 1).bytes(&bytes).u8(0);
}

/// Output of the plain-text fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFiles {
    pub wtg: Vec<u8>,
    pub wct: Vec<u8>,
}

struct PlainGlobal {
    type_name: String,
    is_array: bool,
    name: String,
    initial: String,
    initialized: bool,
}

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| UnshieldError::Config(e.to_string()))
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whitespace runs become one space, kept only between two word characters.
fn squeeze_line(line: &str) -> String {
    let words: Vec<&str> = line.split_whitespace().collect();
    let mut out = String::with_capacity(line.len());
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            let before = out.chars().last().map_or(false, is_word);
            let after = word.chars().next().map_or(false, is_word);
            if before && after {
                out.push(' ');
            }
        }
        out.push_str(word);
    }
    out
}

/// Replaces whole-word `from` unless it directly follows a quote or `$`.
fn replace_identifier(text: &str, from: &str, to: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, _) in text.match_indices(from) {
        if start < last {
            continue;
        }
        let end = start + from.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        let free_before = before.map_or(true, |c| !is_word(c) && c != '\'' && c != '$');
        let free_after = after.map_or(true, |c| !is_word(c));
        if free_before && free_after {
            out.push_str(&text[last..start]);
            out.push_str(to);
            last = end;
        }
    }
    out.push_str(&text[last..]);
    out
}

fn restore_strings(text: &str, strings: &[String], placeholder: &Regex) -> String {
    placeholder
        .replace_all(text, |caps: &Captures| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|i| strings.get(i))
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Packs a script that could not be decompiled into one custom-text trigger.
///
/// Globals become trigger-editor variables named `{type}{nn}`, editor-reserved
/// functions are renamed with an `_old` suffix and `main` is started from the
/// trigger's initializer through `ExecuteFunc`.
pub fn fallback_from_script(script: &str, log: &LogFn) -> Result<TriggerFiles> {
    let literal = regex(r#""(?:\\.|[^"\\])*""#)?;
    let placeholder = regex(r"###DEP_STRING_(\d+)###")?;

    let mut strings: Vec<String> = Vec::new();
    let script = literal.replace_all(script, |caps: &Captures| {
        strings.push(caps[0].to_string());
        format!("###DEP_STRING_{}###", strings.len() - 1)
    });

    let mut script = script
        .split("\r\n")
        .flat_map(|chunk| chunk.split(['\r', '\n']))
        .map(squeeze_line)
        .collect::<Vec<_>>()
        .join("\n");

    log("Renaming reserved functions...");
    let mut reserved: Vec<(String, String)> = Vec::new();
    for func in NATIVE_EDITOR_FUNCTIONS.iter().filter(|f| **f != "main") {
        if !regex(&format!(r"function {func}\s"))?.is_match(&script) {
            continue;
        }
        let mut new_name = format!("{func}_old");
        while regex(&format!(r"function {new_name}\s"))?.is_match(&script) {
            new_name.push_str("_old");
        }
        log(&format!("Renaming {func} to {new_name}"));
        reserved.push((func.to_string(), new_name));
    }
    for (from, to) in &reserved {
        script = replace_identifier(&script, from, to);
    }
    log(&format!("Renamed {} reserved functions", reserved.len()));

    let declaration = regex(r"^(\w+)( | array )(\w+)(?:|=(.*))$")?;
    let mut globals: Vec<PlainGlobal> = Vec::new();
    for line in script.split('\n').filter(|line| !line.is_empty()) {
        let line = line.trim();
        if line == "endglobals" {
            break;
        }
        if let Some(caps) = declaration.captures(line) {
            globals.push(PlainGlobal {
                type_name: caps[1].to_string(),
                is_array: &caps[2] == " array ",
                name: caps[3].to_string(),
                initial: caps.get(4).map_or("", |m| m.as_str()).to_string(),
                initialized: false,
            });
        }
    }

    let mut counters: HashMap<String, u32> = HashMap::new();
    let mut renames: Vec<(String, String)> = Vec::new();
    for g in globals.iter_mut() {
        let key = format!("{}{}", g.type_name, if g.is_array { "s" } else { "" });
        let counter = counters.entry(key.clone()).or_insert(0);
        *counter += 1;
        let new_name = format!("{key}{:02}", counter);
        renames.push((std::mem::replace(&mut g.name, new_name.clone()), format!("udg_{new_name}")));
    }
    for (from, to) in &renames {
        script = replace_identifier(&script, from, to);
    }

    let mut main_name = "main2".to_string();
    while script.contains(&format!("function {main_name}")) {
        main_name.push('2');
    }
    let script = regex(r"(?s)^.*?\sendglobals")?.replace(&script, "");
    let script = regex(r"(?s)\sfunction InitCustomTeams takes nothing returns nothing.*?\sendfunction")?
        .replace_all(&script, "");
    let script = script.replace(
        "\nfunction main takes nothing returns nothing",
        &format!("\nfunction {main_name} takes nothing returns nothing"),
    );
    let mut body = regex(r"\scall InitBlizzard\(\)")?
        .replace_all(&script, "")
        .into_owned();

    let trivial = regex(r#"^(|""|false|0|null|Create(Timer|Group|Force)\(\))$"#)?;
    let mut init_code = String::new();
    for g in globals.iter_mut() {
        if g.initial.is_empty() || trivial.is_match(&g.initial) {
            continue;
        }
        if matches!(g.type_name.as_str(), "boolean" | "real" | "integer" | "string") {
            g.initialized = true;
        } else {
            init_code.push_str(&format!("set udg_{} = {}\n", g.name, g.initial));
        }
    }
    body.push_str(&format!(
        "\nfunction InitTrig_init takes nothing returns nothing\n{init_code}\ncall ExecuteFunc(\"{main_name}\")\nendfunction\n"
    ));

    log("Creating war3map.wtg...");
    let mut w = Writer::new();
    w.bytes(b"WTG!").i32(7);
    w.i32(1).i32(1).cstr("triggers").i32(0);
    w.i32(2).i32(globals.len() as i32);
    for g in &globals {
        w.bytes(&ascii_lossy(&g.name))
            .u8(0)
            .bytes(&ascii_lossy(&g.type_name))
            .u8(0)
            .i32(1)
            .bool(g.is_array)
            .i32(1)
            .bool(g.initialized);
        if g.initialized {
            let value = restore_strings(&g.initial, &strings, &placeholder);
            w.bytes(&ascii_lossy(value.trim_matches('"')));
        }
        w.u8(0);
    }
    w.i32(1);
    w.cstr("init").cstr("").i32(0);
    w.bool(true).bool(true).bool(false).bool(false);
    w.i32(1).i32(0);
    let wtg = w.finish();

    log("Creating war3map.wct...");
    let header = format!("// {BANNER}");
    let mut w = Writer::new();
    w.i32(1).u8(0);
    w.i32(header.len() as i32 + 1).bytes(header.as_bytes()).u8(0);
    w.i32(1);
    let section = crlf(&restore_strings(&format!("{header}{body}\0"), &strings, &placeholder));
    let bytes = ascii_lossy(&section);
    w.i32(bytes.len() as i32).bytes(&bytes);
    let wct = w.finish();

    Ok(TriggerFiles { wtg, wct })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet(_: &str) {}

    fn le_i32(bytes: &[u8], at: usize) -> i32 {
        i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn squeeze_keeps_spaces_between_words_only() {
        assert_eq!(squeeze_line("  set  x  =  f( a ,  b )  "), "set x=f(a,b)");
        assert_eq!(squeeze_line("function main takes nothing returns nothing"),
            "function main takes nothing returns nothing");
    }

    #[test]
    fn identifier_replacement_respects_boundaries() {
        let text = "call config()\nset a='config'\nset b=$config\nconfigX\nconfig";
        assert_eq!(
            replace_identifier(text, "config", "config_old"),
            "call config_old()\nset a='config'\nset b=$config\nconfigX\nconfig_old"
        );
    }

    const SCRIPT: &str = "globals\n\
        integer    count = 5\n\
        unit array heroes\n\
        timer   clock = CreateTimer()\n\
        group pool = CreateGroup()\n\
        string title = \"Hello world\"\n\
        endglobals\n\
        function InitCustomTeams takes nothing returns nothing\n\
        call SetPlayerTeam(Player(0), 0)\n\
        endfunction\n\
        function config takes nothing returns nothing\n\
        call SetMapName(\"config\")\n\
        endfunction\n\
        function main takes nothing returns nothing\n\
        call InitBlizzard()\n\
        set count = count + 1\n\
        call config()\n\
        endfunction\n";

    #[test]
    fn fallback_wtg_layout() {
        let files = fallback_from_script(SCRIPT, &quiet).unwrap();
        let wtg = &files.wtg;
        assert_eq!(&wtg[..4], b"WTG!");
        assert_eq!(le_i32(wtg, 4), 7);
        assert_eq!(le_i32(wtg, 8), 1);
        assert_eq!(le_i32(wtg, 12), 1);
        assert_eq!(&wtg[16..25], b"triggers\0");
        assert_eq!(le_i32(wtg, 25), 0);
        assert_eq!(le_i32(wtg, 29), 2);
        assert_eq!(le_i32(wtg, 33), 5);

        let mut expected = Vec::new();
        for (name, ty, array, init) in [
            ("integer01", "integer", 0, Some("5")),
            ("units01", "unit", 1, None),
            ("timer01", "timer", 0, None),
            ("group01", "group", 0, None),
            ("string01", "string", 0, Some("Hello world")),
        ] {
            expected.extend_from_slice(name.as_bytes());
            expected.push(0);
            expected.extend_from_slice(ty.as_bytes());
            expected.push(0);
            for v in [1, array, 1, init.is_some() as i32] {
                expected.extend_from_slice(&(v as i32).to_le_bytes());
            }
            if let Some(init) = init {
                expected.extend_from_slice(init.as_bytes());
            }
            expected.push(0);
        }
        expected.extend_from_slice(&1i32.to_le_bytes());
        expected.extend_from_slice(b"init\0\0");
        for v in [0, 1, 1, 0, 0, 1, 0] {
            expected.extend_from_slice(&(v as i32).to_le_bytes());
        }
        assert_eq!(&wtg[37..], &expected[..]);
    }

    #[test]
    fn fallback_wct_carries_rewritten_script() {
        let files = fallback_from_script(SCRIPT, &quiet).unwrap();
        let wct = &files.wct;
        let header = format!("// {BANNER}");
        assert_eq!(le_i32(wct, 0), 1);
        assert_eq!(wct[4], 0);
        assert_eq!(le_i32(wct, 5) as usize, header.len() + 1);
        let after_header = 9 + header.len() + 1;
        assert_eq!(le_i32(wct, after_header), 1);
        let length = le_i32(wct, after_header + 4) as usize;
        let text = std::str::from_utf8(&wct[after_header + 8..]).unwrap();
        assert_eq!(text.len(), length);
        assert!(text.ends_with('\0'));

        assert!(text.starts_with(&header));
        assert!(!text.contains("endglobals"));
        // renamed as a reserved name before the team setup could be dropped
        assert!(text.contains("function InitCustomTeams_old takes nothing returns nothing"));
        assert!(!text.contains("InitBlizzard"));
        assert!(text.contains("function config_old takes nothing returns nothing"));
        assert!(text.contains("call SetMapName(\"config\")"));
        assert!(text.contains("function main2 takes nothing returns nothing"));
        assert!(text.contains("set udg_integer01=udg_integer01+1"));
        assert!(text.contains("call config_old()"));
        assert!(text.contains("call ExecuteFunc(\"main2\")\r\nendfunction\r\n"));
        assert!(!text.contains("\r\r"));
    }

    #[test]
    fn fallback_initializes_handles_in_init_trigger() {
        let script = "globals\nunit boss = CreateUnit(Player(0), 'hfoo', 0, 0, 0)\nendglobals\n\
                      function main takes nothing returns nothing\nendfunction\n";
        let files = fallback_from_script(script, &quiet).unwrap();
        let text = String::from_utf8_lossy(&files.wct);
        assert!(text.contains(
            "function InitTrig_init takes nothing returns nothing\r\nset udg_unit01 = CreateUnit(Player(0),'hfoo',0,0,0)\r\n"
        ));
    }

    #[test]
    fn structured_versions_differ_in_optional_fields() {
        let mut triggers = MapTriggers::empty();
        triggers.categories.push(TriggerCategory {
            id: 0,
            name: "Setup".to_string(),
            is_comment: false,
        });
        triggers.variables.push(TriggerVariable {
            name: "Score".to_string(),
            type_name: "integer".to_string(),
            is_array: true,
            array_size: 12,
            initial_value: None,
        });
        let mut trigger = Trigger::custom("Melee", 0, "function Trig_Melee_Actions takes nothing returns nothing\nendfunction".to_string());
        trigger.run_on_init = true;
        triggers.triggers.push(trigger);

        let v7 = triggers.encode_wtg();
        triggers.version = 4;
        let v4 = triggers.encode_wtg();
        // category comment flag, array size, trigger comment flag, run on init
        assert_eq!(v7.len(), v4.len() + 16);
        assert_eq!(le_i32(&v4, 4), 4);

        let wct = triggers.encode_wct();
        assert_eq!(le_i32(&wct, 0), 1);
        assert_eq!(wct[4], 0);
        assert_eq!(le_i32(&wct, 5), 0);
        assert_eq!(le_i32(&wct, 9), 1);
        let length = le_i32(&wct, 13) as usize;
        assert_eq!(wct.len(), 17 + length);
        assert!(wct[17..].starts_with(b"function Trig_Melee_Actions takes nothing returns nothing\r\nendfunction\0"));
    }

    #[test]
    fn non_ascii_becomes_question_marks() {
        assert_eq!(ascii_lossy("a\u{e9}\u{1F600}"), b"a???".to_vec());
    }
}
