use crate::command::{CommandDefinition, ESCAPED_PIPE_TOKEN, PIPE_TOKEN};
use crate::error::EngineError;
use crate::item::ItemData;
use crate::matcher::MatchCaptures;
use std::time::Duration;

const MAX_PLACEHOLDER: usize = 9;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl StageSpec {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputPayload {
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineSpec {
    pub command_name: String,
    pub stages: Vec<StageSpec>,
    pub input: Option<InputPayload>,
    /// Values for `%1..%9`, index 0 is `%1`.
    pub substitutions: Vec<String>,
    pub max_run: Option<Duration>,
    pub requires_confirmation: bool,
}

impl PipelineSpec {
    pub fn display(&self) -> String {
        self.stages
            .iter()
            .map(StageSpec::display)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Turns a matched definition into the stage chain to execute. Pure.
pub fn build(
    definition: &CommandDefinition,
    item: &dyn ItemData,
    captures: &MatchCaptures,
) -> Result<PipelineSpec, EngineError> {
    let substitutions = substitutions_for(item, captures);
    let stages = interpolated_stages(&definition.program, &substitutions)
        .map_err(|detail| EngineError::configuration(&definition.name, detail))?;

    let input = definition
        .input_mime
        .as_deref()
        .filter(|mime| !mime.trim().is_empty())
        .and_then(|mime| {
            item.representation(mime).map(|bytes| InputPayload {
                mime: mime.to_string(),
                bytes: if mime.starts_with("text/") {
                    interpolate_bytes(bytes, &substitutions)
                } else {
                    bytes.to_vec()
                },
            })
        });

    Ok(PipelineSpec {
        command_name: definition.name.clone(),
        stages,
        input,
        substitutions,
        max_run: definition.max_run_ms.map(Duration::from_millis),
        requires_confirmation: definition.wait_for_confirmation,
    })
}

/// Splits program tokens on unescaped pipe tokens.
pub fn split_stages(program: &[String]) -> Result<Vec<Vec<String>>, String> {
    if program.is_empty() {
        return Err("command has no program".to_string());
    }

    let mut stages = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for token in program {
        if token == PIPE_TOKEN {
            if current.is_empty() {
                return Err("empty pipeline stage".to_string());
            }
            stages.push(std::mem::take(&mut current));
        } else if token == ESCAPED_PIPE_TOKEN {
            current.push(PIPE_TOKEN.to_string());
        } else {
            current.push(token.clone());
        }
    }
    if current.is_empty() {
        return Err("empty pipeline stage".to_string());
    }
    stages.push(current);

    if stages.iter().any(|stage| stage[0].trim().is_empty()) {
        return Err("pipeline stage has an empty program name".to_string());
    }
    Ok(stages)
}

/// Splits `program` into stages and interpolates every argument.
pub fn interpolated_stages(
    program: &[String],
    substitutions: &[String],
) -> Result<Vec<StageSpec>, String> {
    Ok(split_stages(program)?
        .into_iter()
        .map(|tokens| {
            let mut tokens = tokens.into_iter();
            let program = tokens.next().unwrap_or_default();
            StageSpec {
                program,
                args: tokens
                    .map(|arg| interpolate(&arg, substitutions))
                    .collect(),
            }
        })
        .collect())
}

pub fn substitutions_for(item: &dyn ItemData, captures: &MatchCaptures) -> Vec<String> {
    let mut out = Vec::with_capacity(MAX_PLACEHOLDER);
    out.push(item.primary_text().unwrap_or_default());
    for group in 1..MAX_PLACEHOLDER {
        out.push(captures.group(group).unwrap_or_default().to_string());
    }
    out
}

/// Replaces `%1..%9`; any other `%` sequence is kept verbatim.
pub fn interpolate(template: &str, substitutions: &[String]) -> String {
    String::from_utf8_lossy(&interpolate_bytes(template.as_bytes(), substitutions)).into_owned()
}

/// Byte-level `interpolate`; bytes outside placeholders pass through untouched,
/// so text that is not valid UTF-8 survives.
pub fn interpolate_bytes(template: &[u8], substitutions: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(template.len());
    let mut index = 0;
    while index < template.len() {
        let byte = template[index];
        let placeholder = template
            .get(index + 1)
            .filter(|_| byte == b'%')
            .and_then(|next| placeholder_index(*next));
        match placeholder {
            Some(slot) => {
                if let Some(value) = substitutions.get(slot) {
                    out.extend_from_slice(value.as_bytes());
                }
                index += 2;
            }
            None => {
                out.push(byte);
                index += 1;
            }
        }
    }
    out
}

fn placeholder_index(digit: u8) -> Option<usize> {
    let slot = usize::from(digit.checked_sub(b'1')?);
    (slot < MAX_PLACEHOLDER).then_some(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ClipboardItem, MIME_TEXT};

    fn captures(groups: &[&str]) -> MatchCaptures {
        MatchCaptures::from_groups(groups.iter().map(|g| Some(g.to_string())).collect())
    }

    #[test]
    fn builds_single_stage_with_item_text() {
        let definition = CommandDefinition::new("links").with_program(["curl", "-s", "%1"]);
        let item = ClipboardItem::from_text(1, "clipboard", "http://example.com");

        let spec = build(&definition, &item, &MatchCaptures::default()).expect("build");
        assert_eq!(spec.stages.len(), 1);
        assert_eq!(spec.stages[0].program, "curl");
        assert_eq!(spec.stages[0].args, vec!["-s", "http://example.com"]);
        assert_eq!(spec.input, None);
        assert_eq!(spec.display(), "curl -s http://example.com");
    }

    #[test]
    fn splits_stages_and_interpolates_captures() {
        let definition =
            CommandDefinition::new("pick").with_program(["echo", "%2-%3", "|", "tr", "a-z", "A-Z"]);
        let item = ClipboardItem::from_text(1, "clipboard", "ab");

        let spec = build(&definition, &item, &captures(&["ab", "a", "b"])).expect("build");
        assert_eq!(spec.stages.len(), 2);
        assert_eq!(spec.stages[0].args, vec!["a-b"]);
        assert_eq!(spec.stages[1].program, "tr");
    }

    #[test]
    fn undefined_groups_become_empty() {
        let subs = vec!["text".to_string()];
        assert_eq!(interpolate("[%1][%5][%0][%%]", &subs), "[text][][%0][%%]");
    }

    #[test]
    fn escaped_pipe_is_an_argument() {
        let stages = split_stages(&[
            "echo".to_string(),
            ESCAPED_PIPE_TOKEN.to_string(),
        ])
        .expect("split");
        assert_eq!(stages, vec![vec!["echo".to_string(), "|".to_string()]]);
    }

    #[test]
    fn malformed_pipelines_are_configuration_errors() {
        let item = ClipboardItem::from_text(1, "clipboard", "x");
        for program in [vec!["|", "cat"], vec!["cat", "|"], vec!["cat", "|", "|", "wc"], vec![]] {
            let definition = CommandDefinition::new("bad").with_program(program);
            let err = build(&definition, &item, &MatchCaptures::default())
                .expect_err("malformed pipeline");
            assert_eq!(err.code(), crate::error::ErrorCode::Configuration);
        }
    }

    #[test]
    fn input_payload_bound_from_declared_mime() {
        let mut definition = CommandDefinition::new("wc").with_program(["wc", "-c"]);
        definition.input_mime = Some("image/png".to_string());
        let item = ClipboardItem::from_text(1, "clipboard", "x").with_format("image/png", vec![9, 9]);

        let spec = build(&definition, &item, &MatchCaptures::default()).expect("build");
        assert_eq!(
            spec.input,
            Some(InputPayload {
                mime: "image/png".to_string(),
                bytes: vec![9, 9],
            })
        );
    }

    #[test]
    fn missing_input_representation_means_no_stdin() {
        let mut definition = CommandDefinition::new("wc").with_program(["wc"]);
        definition.input_mime = Some("text/html".to_string());
        let item = ClipboardItem::from_text(1, "clipboard", "x");

        let spec = build(&definition, &item, &MatchCaptures::default()).expect("build");
        assert_eq!(spec.input, None);
    }

    #[test]
    fn text_input_is_interpolated() {
        let mut definition = CommandDefinition::new("cat").with_program(["cat"]);
        definition.input_mime = Some(MIME_TEXT.to_string());
        let item = ClipboardItem::from_text(1, "clipboard", "id=%2");

        let spec = build(&definition, &item, &captures(&["id=%2", "42"])).expect("build");
        assert_eq!(spec.input.map(|input| input.bytes), Some(b"id=42".to_vec()));
    }

    #[test]
    fn text_input_keeps_invalid_utf8() {
        let mut definition = CommandDefinition::new("cat").with_program(["cat"]);
        definition.input_mime = Some("text/x-raw".to_string());
        let raw = vec![b'a', 0xff, 0xfe, b'%', b'1', b'%', b'x'];
        let item = ClipboardItem::from_text(1, "clipboard", "t").with_format("text/x-raw", raw);

        let spec = build(&definition, &item, &MatchCaptures::default()).expect("build");
        assert_eq!(
            spec.input.map(|input| input.bytes),
            Some(vec![b'a', 0xff, 0xfe, b't', b'%', b'x'])
        );
    }

    #[test]
    fn build_is_repeatable() {
        let mut definition = CommandDefinition::new("x").with_program(["a", "%1", "|", "b"]);
        definition.input_mime = Some(MIME_TEXT.to_string());
        definition.max_run_ms = Some(500);
        let item = ClipboardItem::from_text(7, "t", "payload");
        let caps = captures(&["payload", "pay"]);

        let first = build(&definition, &item, &caps).expect("first build");
        let second = build(&definition, &item, &caps).expect("second build");
        assert_eq!(first, second);
    }
}
