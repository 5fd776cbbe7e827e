use crate::command::{CommandDefinition, Separator};
use crate::item::{ItemMutation, ItemOrigin};
use crate::matcher::MatchCaptures;
use crate::supervisor::{ProcessState, RunSnapshot};
use regex::Regex;

#[derive(Clone, Debug)]
pub enum Splitter {
    Whole,
    Literal(String),
    Pattern(Regex),
}

impl Splitter {
    pub fn compile(separator: Option<&Separator>) -> Result<Self, regex::Error> {
        Ok(match separator {
            None => Self::Whole,
            Some(separator) if separator.is_empty() => Self::Whole,
            Some(Separator::Literal(value)) => Self::Literal(value.clone()),
            Some(Separator::Regex(pattern)) => Self::Pattern(Regex::new(pattern)?),
        })
    }

    pub fn split<'a>(&self, text: &'a str) -> Vec<&'a str> {
        match self {
            Self::Whole => vec![text],
            Self::Literal(separator) => text.split(separator.as_str()).collect(),
            Self::Pattern(regex) => regex.split(text).collect(),
        }
    }
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/")
}

/// Describes what a finished run changes in the history store.
///
/// Runs that did not finish successfully, and definitions that do not route
/// output, produce nothing.
pub fn route(
    definition: &CommandDefinition,
    origin: &ItemOrigin,
    captures: &MatchCaptures,
    result: &RunSnapshot,
) -> Vec<ItemMutation> {
    if result.state != ProcessState::Finished || !definition.routes_output() {
        return Vec::new();
    }

    let mime = definition.effective_output_mime().to_string();
    if definition.transform {
        let mut mutations = vec![ItemMutation::Replace {
            item_id: origin.item_id,
            tab: origin.tab.clone(),
            mime: mime.clone(),
            data: result.stdout.clone(),
        }];
        if let Some(input) = definition.input_mime.as_deref() {
            if !input.trim().is_empty() && input != mime {
                mutations.push(ItemMutation::RemoveFormats {
                    item_id: origin.item_id,
                    tab: origin.tab.clone(),
                    formats: vec![input.to_string()],
                });
            }
        }
        return mutations;
    }

    let tab = definition
        .output_tab
        .as_deref()
        .filter(|tab| !tab.trim().is_empty())
        .unwrap_or(&origin.tab)
        .to_string();
    let tags = if definition.tag_with_captures {
        captures.tags()
    } else {
        Vec::new()
    };

    if !is_text_mime(&mime) {
        if result.stdout.is_empty() && !definition.keep_empty_segments {
            return Vec::new();
        }
        return vec![ItemMutation::Create {
            tab,
            mime,
            data: result.stdout.clone(),
            tags,
        }];
    }

    let splitter = match Splitter::compile(definition.separator.as_ref()) {
        Ok(splitter) => splitter,
        Err(err) => {
            log::warn!(
                "command '{}' has an invalid separator, keeping output whole: {err}",
                definition.name
            );
            Splitter::Whole
        }
    };
    let text = result.stdout_text();
    splitter
        .split(&text)
        .into_iter()
        .filter(|segment| definition.keep_empty_segments || !segment.is_empty())
        .map(|segment| ItemMutation::Create {
            tab: tab.clone(),
            mime: mime.clone(),
            data: segment.as_bytes().to_vec(),
            tags: tags.clone(),
        })
        .collect()
}

/// Effects of an automatic match that need no process output.
pub fn automatic_effects(definition: &CommandDefinition, origin: &ItemOrigin) -> Vec<ItemMutation> {
    let mut mutations = Vec::new();
    if let Some(tab) = definition
        .copy_to_tab
        .as_deref()
        .filter(|tab| !tab.trim().is_empty())
    {
        mutations.push(ItemMutation::CopyItem {
            item_id: origin.item_id,
            source_tab: origin.tab.clone(),
            tab: tab.to_string(),
        });
    }
    if definition.remove_item {
        mutations.push(ItemMutation::RemoveItem {
            item_id: origin.item_id,
            tab: origin.tab.clone(),
        });
    }
    mutations
}
