use crate::command::{CommandDefinition, MatchPattern};
use crate::command_line::tokenize_command_line;
use crate::error::EngineError;
use crate::item::ItemData;
use crate::pipeline::{self, InputPayload, PipelineSpec};
use crate::runner::{self, RunnerPolicy};
use crate::supervisor::ProcessState;
use regex::Regex;
use std::time::Duration;

/// Capture groups of a content match; group 0 is the whole match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchCaptures {
    groups: Vec<Option<String>>,
}

impl MatchCaptures {
    pub fn from_groups(groups: Vec<Option<String>>) -> Self {
        Self { groups }
    }

    fn from_regex(regex: &Regex, text: &str) -> Option<Self> {
        let captures = regex.captures(text)?;
        Some(Self {
            groups: captures
                .iter()
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect(),
        })
    }

    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|group| group.as_deref())
    }

    /// Non-empty groups after the whole match, used as item tags.
    pub fn tags(&self) -> Vec<String> {
        self.groups
            .iter()
            .skip(1)
            .flatten()
            .filter(|group| !group.is_empty())
            .cloned()
            .collect()
    }
}

/// Predicates of one definition, validated once when the registry loads it.
#[derive(Clone, Debug)]
pub struct CompiledPredicates {
    content: Option<Regex>,
    window: Option<Regex>,
    required_mime: Option<String>,
    forbidden_mime: Option<String>,
    filter: Option<Vec<String>>,
}

impl CompiledPredicates {
    pub fn compile(definition: &CommandDefinition) -> Result<Self, EngineError> {
        let name = definition.name.as_str();
        let content = compile_pattern(definition.content_match.as_ref(), name, "content")?;
        let window = compile_pattern(definition.window_match.as_ref(), name, "window")?;

        let filter = match definition.filter_program.as_deref().map(str::trim) {
            Some(line) if !line.is_empty() => {
                let tokens = tokenize_command_line(line)
                    .map_err(|detail| EngineError::configuration(name, detail))?;
                pipeline::split_stages(&tokens).map_err(|detail| {
                    EngineError::configuration(name, format!("filter: {detail}"))
                })?;
                Some(tokens)
            }
            _ => None,
        };

        Ok(Self {
            content,
            window,
            required_mime: non_empty(definition.required_mime.as_deref()),
            forbidden_mime: non_empty(definition.forbidden_mime.as_deref()),
            filter,
        })
    }

    /// Capture groups of the content pattern, without judging the match.
    pub fn content_captures(&self, item: &dyn ItemData) -> MatchCaptures {
        let text = item.primary_text().unwrap_or_default();
        self.content
            .as_ref()
            .and_then(|regex| MatchCaptures::from_regex(regex, &text))
            .unwrap_or_default()
    }
}

fn compile_pattern(
    pattern: Option<&MatchPattern>,
    command: &str,
    what: &str,
) -> Result<Option<Regex>, EngineError> {
    match pattern {
        Some(pattern) if !pattern.is_empty() => pattern.compile().map(Some).map_err(|err| {
            EngineError::configuration(command, format!("invalid {what} pattern: {err}"))
        }),
        _ => Ok(None),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Evaluates predicates in order: formats, content, window title, filter.
#[derive(Clone, Debug)]
pub struct Matcher {
    filter_timeout: Duration,
    policy: RunnerPolicy,
}

impl Matcher {
    pub fn new(filter_timeout: Duration, policy: RunnerPolicy) -> Self {
        Self {
            filter_timeout,
            policy,
        }
    }

    /// Returns the content captures when every predicate holds.
    pub fn evaluate(
        &self,
        definition: &CommandDefinition,
        predicates: &CompiledPredicates,
        item: &dyn ItemData,
    ) -> Option<MatchCaptures> {
        if let Some(mime) = predicates.required_mime.as_deref() {
            if !item.has_format(mime) {
                return None;
            }
        }
        if let Some(mime) = predicates.forbidden_mime.as_deref() {
            if item.has_format(mime) {
                return None;
            }
        }

        let text = item.primary_text().unwrap_or_default();
        let captures = match predicates.content.as_ref() {
            Some(regex) => MatchCaptures::from_regex(regex, &text)?,
            None => MatchCaptures::default(),
        };

        if let Some(regex) = predicates.window.as_ref() {
            if !regex.is_match(item.source_window_title().unwrap_or_default()) {
                return None;
            }
        }

        if let Some(tokens) = predicates.filter.as_deref() {
            if !self.run_filter(&definition.name, tokens, &text, item, &captures) {
                return None;
            }
        }

        Some(captures)
    }

    pub fn matches(
        &self,
        definition: &CommandDefinition,
        predicates: &CompiledPredicates,
        item: &dyn ItemData,
    ) -> bool {
        self.evaluate(definition, predicates, item).is_some()
    }

    fn run_filter(
        &self,
        command: &str,
        tokens: &[String],
        text: &str,
        item: &dyn ItemData,
        captures: &MatchCaptures,
    ) -> bool {
        let substitutions = pipeline::substitutions_for(item, captures);
        let Ok(stages) = pipeline::interpolated_stages(tokens, &substitutions) else {
            return false;
        };
        let spec = PipelineSpec {
            command_name: format!("{command} (filter)"),
            stages,
            input: Some(InputPayload {
                mime: crate::item::MIME_TEXT.to_string(),
                bytes: text.as_bytes().to_vec(),
            }),
            substitutions,
            max_run: Some(self.filter_timeout),
            requires_confirmation: false,
        };

        let snapshot = runner::run_blocking(spec, &self.policy);
        match snapshot.state {
            ProcessState::Finished => true,
            _ => {
                if let Some(err @ EngineError::Timeout { .. }) = &snapshot.error {
                    log::warn!("{err}; treating as no match");
                } else {
                    log::debug!(
                        "filter of '{}' rejected item ({})",
                        command,
                        snapshot.state.as_tag()
                    );
                }
                false
            }
        }
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(Duration::from_millis(3000), RunnerPolicy::default())
    }
}
