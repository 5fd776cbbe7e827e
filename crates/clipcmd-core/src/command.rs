use crate::command_line::tokenize_command_line;
use crate::error::EngineError;
use crate::item::MIME_TEXT;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Token separating pipeline stages inside `CommandDefinition::program`.
pub const PIPE_TOKEN: &str = "|";
/// A literal `|` argument, escaped so it is not taken as a stage separator.
pub const ESCAPED_PIPE_TOKEN: &str = "\\|";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Automatic,
    Menu,
}

impl TriggerKind {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Menu => "menu",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriggerMode {
    Automatic,
    Menu,
    Both,
    /// Reachable only through an explicit invocation such as a shortcut.
    Manual,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPattern {
    pub pattern: String,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub multi_line: bool,
    #[serde(default)]
    pub dot_matches_new_line: bool,
}

impl MatchPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            case_insensitive: false,
            multi_line: false,
            dot_matches_new_line: false,
        }
    }

    /// Applies flag letters `i`, `m` and `s`; unknown letters are rejected.
    pub fn with_flags(mut self, flags: &str) -> Result<Self, String> {
        for flag in flags.chars().filter(|c| !c.is_whitespace()) {
            match flag.to_ascii_lowercase() {
                'i' => self.case_insensitive = true,
                'm' => self.multi_line = true,
                's' => self.dot_matches_new_line = true,
                other => return Err(format!("unknown match flag: {other}")),
            }
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    pub fn compile(&self) -> Result<Regex, regex::Error> {
        RegexBuilder::new(&self.pattern)
            .case_insensitive(self.case_insensitive)
            .multi_line(self.multi_line)
            .dot_matches_new_line(self.dot_matches_new_line)
            .build()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Separator {
    Literal(String),
    Regex(String),
}

impl Separator {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Literal(value) | Self::Regex(value) => value.is_empty(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub name: String,
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub in_menu: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub content_match: Option<MatchPattern>,
    #[serde(default)]
    pub window_match: Option<MatchPattern>,
    #[serde(default)]
    pub required_mime: Option<String>,
    #[serde(default)]
    pub forbidden_mime: Option<String>,
    #[serde(default)]
    pub filter_program: Option<String>,
    #[serde(default)]
    pub program: Vec<String>,
    #[serde(default)]
    pub input_mime: Option<String>,
    #[serde(default)]
    pub output_mime: Option<String>,
    #[serde(default)]
    pub separator: Option<Separator>,
    #[serde(default)]
    pub keep_empty_segments: bool,
    #[serde(default)]
    pub output_tab: Option<String>,
    #[serde(default)]
    pub copy_to_tab: Option<String>,
    #[serde(default)]
    pub transform: bool,
    #[serde(default)]
    pub remove_item: bool,
    #[serde(default)]
    pub hide_main_window: bool,
    #[serde(default)]
    pub wait_for_confirmation: bool,
    #[serde(default)]
    pub tag_with_captures: bool,
    #[serde(default)]
    pub shortcuts: Vec<String>,
    #[serde(default)]
    pub global_shortcuts: Vec<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub max_run_ms: Option<u64>,
}

impl Default for CommandDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            automatic: false,
            in_menu: false,
            enabled: default_enabled(),
            content_match: None,
            window_match: None,
            required_mime: None,
            forbidden_mime: None,
            filter_program: None,
            program: Vec::new(),
            input_mime: None,
            output_mime: None,
            separator: None,
            keep_empty_segments: false,
            output_tab: None,
            copy_to_tab: None,
            transform: false,
            remove_item: false,
            hide_main_window: false,
            wait_for_confirmation: false,
            tag_with_captures: false,
            shortcuts: Vec::new(),
            global_shortcuts: Vec::new(),
            icon: None,
            max_run_ms: None,
        }
    }
}

impl CommandDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_program<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_command_line(mut self, line: &str) -> Result<Self, EngineError> {
        self.program = tokenize_command_line(line)
            .map_err(|detail| EngineError::configuration(&self.name, detail))?;
        Ok(self)
    }

    pub fn with_content_match(mut self, pattern: impl Into<String>) -> Self {
        self.content_match = Some(MatchPattern::new(pattern));
        self
    }

    pub fn with_window_match(mut self, pattern: impl Into<String>) -> Self {
        self.window_match = Some(MatchPattern::new(pattern));
        self
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        match (self.automatic, self.in_menu) {
            (true, true) => TriggerMode::Both,
            (true, false) => TriggerMode::Automatic,
            (false, true) => TriggerMode::Menu,
            (false, false) => TriggerMode::Manual,
        }
    }

    pub fn responds_to(&self, trigger: TriggerKind) -> bool {
        match trigger {
            TriggerKind::Automatic => self.automatic,
            TriggerKind::Menu => self.in_menu,
        }
    }

    pub fn has_program(&self) -> bool {
        self.program.iter().any(|token| token != PIPE_TOKEN)
    }

    pub fn routes_output(&self) -> bool {
        self.transform || self.output_mime.is_some() || self.output_tab.is_some()
    }

    pub fn effective_output_mime(&self) -> &str {
        self.output_mime
            .as_deref()
            .filter(|mime| !mime.trim().is_empty())
            .unwrap_or(MIME_TEXT)
    }
}

const fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_mode_follows_flags() {
        let mut definition = CommandDefinition::new("x");
        assert_eq!(definition.trigger_mode(), TriggerMode::Manual);
        definition.automatic = true;
        assert_eq!(definition.trigger_mode(), TriggerMode::Automatic);
        definition.in_menu = true;
        assert_eq!(definition.trigger_mode(), TriggerMode::Both);
        assert!(definition.responds_to(TriggerKind::Menu));
    }

    #[test]
    fn match_flags_build_case_insensitive_regex() {
        let pattern = MatchPattern::new("^http")
            .with_flags("i")
            .expect("valid flags");
        let regex = pattern.compile().expect("compile");
        assert!(regex.is_match("HTTP://example.com"));
        assert!(MatchPattern::new("x").with_flags("q").is_err());
    }

    #[test]
    fn command_line_fills_program_tokens() {
        let definition = CommandDefinition::new("count")
            .with_command_line("cat | wc -l")
            .expect("parse command line");
        assert_eq!(definition.program, vec!["cat", "|", "wc", "-l"]);
        assert!(definition.has_program());
    }

    #[test]
    fn output_mime_defaults_to_plain_text() {
        let mut definition = CommandDefinition::new("x");
        assert!(!definition.routes_output());
        definition.output_tab = Some("links".to_string());
        assert!(definition.routes_output());
        assert_eq!(definition.effective_output_mime(), MIME_TEXT);
        definition.output_mime = Some("image/png".to_string());
        assert_eq!(definition.effective_output_mime(), "image/png");
    }

    #[test]
    fn definition_deserializes_with_defaults() {
        let definition: CommandDefinition = serde_json::from_str(
            r#"{"name":"links","automatic":true,"program":["curl","-s","%1"],
                "separator":{"kind":"literal","value":"\n"}}"#,
        )
        .expect("deserialize");
        assert!(definition.enabled);
        assert!(definition.automatic);
        assert_eq!(
            definition.separator,
            Some(Separator::Literal("\n".to_string()))
        );
    }
}
