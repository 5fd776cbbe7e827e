//! Reader for the persisted commands file.
//!
//! The file holds either one `[Command]` group or a `[Commands]` array whose
//! keys look like `3\Name=...` next to a `size=` count; entries past `size`, or
//! every entry when `size=` is missing, are ignored. Values may be wrapped in
//! double quotes and use `\n`, `\t`, `\"` and `\\` escapes; lists are comma
//! separated.

use crate::command::{CommandDefinition, MatchPattern, Separator};
use crate::error::EngineError;
use crate::item::MIME_TEXT;
use anyhow::{Context as _, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const SINGLE_GROUP: &str = "Command";
const ARRAY_GROUP: &str = "Commands";
const SOURCE_NAME: &str = "commands.ini";

type Keys = BTreeMap<String, String>;

pub fn load_commands_ini(path: &Path) -> Result<Vec<CommandDefinition>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read commands file: {}", path.display()))?;
    let commands = parse_commands_ini(&raw)
        .with_context(|| format!("parse commands file: {}", path.display()))?;
    Ok(commands)
}

pub fn parse_commands_ini(text: &str) -> Result<Vec<CommandDefinition>, EngineError> {
    let mut section = String::new();
    let mut single: Option<Keys> = None;
    let mut array: BTreeMap<usize, Keys> = BTreeMap::new();
    let mut size = 0usize;

    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            section = name.trim().to_string();
            if section == SINGLE_GROUP && single.is_none() {
                single = Some(Keys::new());
            }
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(malformed(line_no, "expected key=value"));
        };
        let key = key.trim();
        let value = value.trim().to_string();

        match section.as_str() {
            SINGLE_GROUP => {
                if let Some(keys) = single.as_mut() {
                    keys.insert(key.to_string(), value);
                }
            }
            ARRAY_GROUP => {
                if key == "size" {
                    let parsed = value
                        .parse::<usize>()
                        .map_err(|_| malformed(line_no, "size is not a number"))?;
                    size = parsed;
                    continue;
                }
                let Some((index, name)) = key.split_once('\\') else {
                    continue;
                };
                let index = index
                    .parse::<usize>()
                    .map_err(|_| malformed(line_no, "array index is not a number"))?;
                array
                    .entry(index)
                    .or_default()
                    .insert(name.to_string(), value);
            }
            _ => {}
        }
    }

    let mut commands = Vec::new();
    if let Some(keys) = single {
        commands.push(definition_from_keys(&keys)?);
    }
    let listed = array.iter().filter(|(index, _)| (1..=size).contains(*index));
    for (_, keys) in listed {
        commands.push(definition_from_keys(keys)?);
    }
    Ok(commands)
}

fn malformed(line_no: usize, detail: &str) -> EngineError {
    EngineError::configuration(SOURCE_NAME, format!("line {}: {detail}", line_no + 1))
}

fn definition_from_keys(keys: &Keys) -> Result<CommandDefinition, EngineError> {
    let text = |key: &str| keys.get(key).map(|raw| decode_scalar(raw));
    let non_empty = |key: &str| text(key).filter(|value| !value.is_empty());
    let flag = |key: &str| keys.get(key).map(|raw| decode_bool(raw)).unwrap_or(false);

    let mut definition = CommandDefinition::new(text("Name").unwrap_or_default());
    let name = definition.name.clone();
    definition.enabled = keys.get("Enable").map(|raw| decode_bool(raw)).unwrap_or(true);

    let flags = text("MatchFlags").unwrap_or_default();
    if let Some(pattern) = non_empty("Match") {
        definition.content_match = Some(
            MatchPattern::new(pattern)
                .with_flags(&flags)
                .map_err(|detail| EngineError::configuration(&name, detail))?,
        );
    }
    if let Some(pattern) = non_empty("Window") {
        definition.window_match = Some(MatchPattern::new(pattern));
    }
    definition.filter_program = non_empty("MatchCommand");
    if let Some(line) = non_empty("Command") {
        definition = definition.with_command_line(&line)?;
    }

    if let Some(separator) = non_empty("Separator") {
        definition.separator = Some(if flag("SeparatorRegex") {
            Separator::Regex(separator)
        } else {
            Separator::Literal(separator)
        });
    }
    definition.keep_empty_segments = flag("KeepEmpty");
    definition.input_mime = text("Input").and_then(|value| legacy_mime(&value));
    definition.output_mime = text("Output").and_then(|value| legacy_mime(&value));
    definition.required_mime = non_empty("InputRequired");
    definition.forbidden_mime = non_empty("InputForbidden");

    definition.wait_for_confirmation = flag("Wait");
    definition.automatic = flag("Automatic");
    definition.in_menu = flag("InMenu");
    definition.transform = flag("Transform");
    definition.hide_main_window = flag("HideWindow");
    definition.tag_with_captures = flag("TagWithMatch");
    if flag("Ignore") {
        definition.remove_item = true;
        definition.automatic = true;
    } else {
        definition.remove_item = flag("Remove");
    }

    definition.icon = non_empty("Icon");
    definition.shortcuts = keys.get("Shortcut").map(|raw| decode_list(raw)).unwrap_or_default();
    definition.global_shortcuts = keys
        .get("GlobalShortcut")
        .map(|raw| decode_list(raw))
        .unwrap_or_default();
    definition.copy_to_tab = non_empty("Tab");
    definition.output_tab = non_empty("OutputTab");

    if let Some(value) = non_empty("MaxRunMs") {
        let limit = value.parse::<u64>().map_err(|_| {
            EngineError::configuration(&name, format!("MaxRunMs is not a number: {value}"))
        })?;
        definition.max_run_ms = Some(limit);
    }

    Ok(definition)
}

/// `true`/`false` are legacy spellings of plain text and no format.
fn legacy_mime(value: &str) -> Option<String> {
    match value {
        "" | "false" => None,
        "true" => Some(MIME_TEXT.to_string()),
        other => Some(other.to_string()),
    }
}

fn decode_bool(raw: &str) -> bool {
    let value = decode_scalar(raw);
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
}

fn decode_list(raw: &str) -> Vec<String> {
    split_unquoted_commas(raw)
        .iter()
        .map(|item| decode_scalar(item))
        .filter(|item| !item.is_empty())
        .collect()
}

fn split_unquoted_commas(raw: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                current.push(ch);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => items.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    items.push(current);
    items
}

fn decode_scalar(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(trimmed);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::TriggerMode;
    use crate::error::ErrorCode;

    #[test]
    fn parses_command_array() {
        let text = r#"
[General]
ignored=1

[Commands]
1\Name=Fetch links
1\Match=^https?://
1\MatchFlags=i
1\Command=curl -s %1
1\Automatic=true
1\OutputTab=links
1\Output=text/plain
2\Name=Lines
2\Command="sh -c \"cat | sort\""
2\Separator=\n
2\InMenu=true
2\Shortcut=ctrl+shift+l, alt+l
size=2
"#;
        let commands = parse_commands_ini(text).expect("parse");
        assert_eq!(commands.len(), 2);

        let fetch = &commands[0];
        assert_eq!(fetch.name, "Fetch links");
        assert_eq!(fetch.trigger_mode(), TriggerMode::Automatic);
        assert_eq!(fetch.program, vec!["curl", "-s", "%1"]);
        assert_eq!(fetch.output_tab.as_deref(), Some("links"));
        let pattern = fetch.content_match.as_ref().expect("content match");
        assert!(pattern.case_insensitive);
        assert!(fetch.enabled);

        let lines = &commands[1];
        assert_eq!(lines.program, vec!["sh", "-c", "cat | sort"]);
        assert_eq!(lines.separator, Some(Separator::Literal("\n".to_string())));
        assert_eq!(lines.shortcuts, vec!["ctrl+shift+l", "alt+l"]);
        assert_eq!(lines.trigger_mode(), TriggerMode::Menu);
    }

    #[test]
    fn parses_single_command_group() {
        let text = "[Command]\nName=Only\nCommand=cat\nEnable=false\nTab=archive\n";
        let commands = parse_commands_ini(text).expect("parse");
        assert_eq!(commands.len(), 1);
        assert!(!commands[0].enabled);
        assert_eq!(commands[0].copy_to_tab.as_deref(), Some("archive"));
    }

    #[test]
    fn legacy_values_are_translated() {
        let text = "[Commands]\n1\\Name=Old\n1\\Ignore=true\n1\\Input=true\n1\\Output=false\nsize=1\n";
        let commands = parse_commands_ini(text).expect("parse");
        let old = &commands[0];
        assert!(old.remove_item);
        assert!(old.automatic);
        assert_eq!(old.input_mime.as_deref(), Some(MIME_TEXT));
        assert_eq!(old.output_mime, None);
        assert!(!old.has_program());
    }

    #[test]
    fn entries_beyond_size_are_ignored() {
        let text = "[Commands]\n1\\Name=a\n2\\Name=b\n3\\Name=c\nsize=2\n";
        let names = parse_commands_ini(text)
            .expect("parse")
            .into_iter()
            .map(|command| command.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn array_without_size_is_empty() {
        let text = "[Commands]\n1\\Name=a\n1\\Command=true\n";
        assert!(parse_commands_ini(text).expect("parse").is_empty());
    }

    #[test]
    fn extension_keys_fill_extra_fields() {
        let text = "[Command]\nName=x\nSeparator=\\\\s+\nSeparatorRegex=true\nKeepEmpty=1\n\
                    InputRequired=image/png\nInputForbidden=text/html\nTagWithMatch=true\nMaxRunMs=1500\n";
        let command = parse_commands_ini(text).expect("parse").remove(0);
        assert_eq!(command.separator, Some(Separator::Regex(r"\s+".to_string())));
        assert!(command.keep_empty_segments);
        assert_eq!(command.required_mime.as_deref(), Some("image/png"));
        assert_eq!(command.forbidden_mime.as_deref(), Some("text/html"));
        assert!(command.tag_with_captures);
        assert_eq!(command.max_run_ms, Some(1500));
    }

    #[test]
    fn malformed_input_is_configuration_error() {
        for text in [
            "[Commands]\nthis line has no separator\n",
            "[Commands]\nsize=many\n",
            "[Command]\nName=x\nCommand=echo 'unterminated\n",
            "[Command]\nName=x\nMaxRunMs=soon\n",
        ] {
            let err = parse_commands_ini(text).expect_err("malformed");
            assert_eq!(err.code(), ErrorCode::Configuration);
        }
    }

    #[test]
    fn load_reports_missing_file_path() {
        let path = std::env::temp_dir().join(format!(
            "clipcmd_core_missing_commands_{}.ini",
            std::process::id()
        ));
        let err = load_commands_ini(&path).expect_err("missing file");
        assert!(format!("{err:#}").contains("read commands file"));
    }
}
