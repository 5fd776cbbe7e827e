use crate::command::{CommandDefinition, TriggerKind};
use crate::error::EngineError;
use crate::item::ItemData;
use crate::keybind::ShortcutMap;
use crate::matcher::{CompiledPredicates, MatchCaptures, Matcher};
use crate::pipeline;
use crate::router::Splitter;

#[derive(Clone, Debug)]
struct RegisteredCommand {
    definition: CommandDefinition,
    predicates: Result<CompiledPredicates, EngineError>,
}

impl RegisteredCommand {
    fn compile(definition: CommandDefinition) -> Self {
        let predicates = CompiledPredicates::compile(&definition).and_then(|predicates| {
            if !definition.program.is_empty() {
                pipeline::split_stages(&definition.program)
                    .map_err(|detail| EngineError::configuration(&definition.name, detail))?;
            }
            Splitter::compile(definition.separator.as_ref()).map_err(|err| {
                EngineError::configuration(&definition.name, format!("invalid separator: {err}"))
            })?;
            Ok(predicates)
        });
        Self {
            definition,
            predicates,
        }
    }
}

/// A definition selected for an item, with the captures its content match produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub definition: CommandDefinition,
    pub captures: MatchCaptures,
}

/// Ordered command definitions; order is priority.
#[derive(Clone, Debug, Default)]
pub struct CommandRegistry {
    entries: Vec<RegisteredCommand>,
    shortcuts: ShortcutMap,
    errors: Vec<EngineError>,
}

impl CommandRegistry {
    pub fn new(definitions: Vec<CommandDefinition>) -> Self {
        let entries = definitions
            .into_iter()
            .map(RegisteredCommand::compile)
            .collect::<Vec<_>>();

        let mut errors = Vec::new();
        for entry in &entries {
            if let Err(err) = &entry.predicates {
                log::warn!("{err}");
                errors.push(err.clone());
            }
        }

        let mut registry = Self {
            entries,
            shortcuts: ShortcutMap::default(),
            errors,
        };
        for (command, chord) in registry.rebuild_shortcuts() {
            let err = EngineError::configuration(command, format!("invalid shortcut: {chord}"));
            log::warn!("{err}");
            registry.errors.push(err);
        }
        registry
    }

    fn rebuild_shortcuts(&mut self) -> Vec<(String, String)> {
        let usable = self
            .entries
            .iter()
            .filter(|entry| entry.predicates.is_ok())
            .map(|entry| &entry.definition);
        let (shortcuts, invalid) = ShortcutMap::from_definitions(usable);
        self.shortcuts = shortcuts;
        invalid
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn configuration_errors(&self) -> &[EngineError] {
        &self.errors
    }

    pub fn definitions(&self) -> impl Iterator<Item = &CommandDefinition> {
        self.entries.iter().map(|entry| &entry.definition)
    }

    pub fn find(&self, name: &str) -> Option<&CommandDefinition> {
        self.entry(name).map(|entry| &entry.definition)
    }

    fn entry(&self, name: &str) -> Option<&RegisteredCommand> {
        self.entries
            .iter()
            .find(|entry| entry.definition.name == name)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.definition.name == name)
        else {
            return false;
        };
        entry.definition.enabled = enabled;
        self.rebuild_shortcuts();
        true
    }

    pub fn shortcuts(&self) -> &ShortcutMap {
        &self.shortcuts
    }

    pub fn resolve_shortcut(&self, chord: &str) -> Option<&CommandDefinition> {
        self.shortcuts.resolve(chord).and_then(|name| self.find(name))
    }

    /// Matching definitions in priority order.
    ///
    /// Automatic selection stops after the first match that removes the item;
    /// menu selection returns every enabled match.
    pub fn candidates(
        &self,
        trigger: TriggerKind,
        item: &dyn ItemData,
        matcher: &Matcher,
    ) -> Vec<Candidate> {
        let mut out = Vec::new();
        for entry in &self.entries {
            let definition = &entry.definition;
            if !definition.enabled || !definition.responds_to(trigger) {
                continue;
            }
            let Ok(predicates) = &entry.predicates else {
                continue;
            };
            let Some(captures) = matcher.evaluate(definition, predicates, item) else {
                continue;
            };
            log::debug!("{} command '{}' matched", trigger.as_tag(), definition.name);

            out.push(Candidate {
                definition: definition.clone(),
                captures,
            });
            if trigger == TriggerKind::Automatic && definition.remove_item {
                log::debug!(
                    "'{}' removes the item, skipping later automatic commands",
                    definition.name
                );
                break;
            }
        }
        out
    }

    /// Selects a definition for an explicit invocation without checking predicates.
    pub fn explicit(&self, name: &str, item: &dyn ItemData) -> Result<Candidate, EngineError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| EngineError::UnknownCommand(name.to_string()))?;
        if !entry.definition.enabled {
            return Err(EngineError::CommandDisabled(name.to_string()));
        }
        let predicates = entry.predicates.as_ref().map_err(|err| err.clone())?;
        Ok(Candidate {
            definition: entry.definition.clone(),
            captures: predicates.content_captures(item),
        })
    }
}
