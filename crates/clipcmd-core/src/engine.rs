use crate::command::{CommandDefinition, TriggerKind};
use crate::error::EngineError;
use crate::item::{ClipboardItem, ItemMutation, ItemOrigin, MutationSink};
use crate::matcher::Matcher;
use crate::pipeline;
use crate::registry::{Candidate, CommandRegistry};
use crate::router;
use crate::runner::CompletionHook;
use crate::settings::EngineSettings;
use crate::supervisor::{RunId, RunSnapshot, ShutdownReport, Supervisor};
use parking_lot::RwLock;
use std::sync::Arc;

/// What an automatic pass over one clipboard item did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutomaticDispatch {
    pub started: Vec<RunId>,
    pub item_removed: bool,
    pub hide_main_window: bool,
    pub failed: Vec<EngineError>,
}

pub struct CommandEngine {
    registry: RwLock<Arc<CommandRegistry>>,
    matcher: Matcher,
    supervisor: Arc<Supervisor>,
    sink: Arc<dyn MutationSink>,
}

impl CommandEngine {
    pub fn new(
        commands: Vec<CommandDefinition>,
        settings: EngineSettings,
        sink: Arc<dyn MutationSink>,
    ) -> Self {
        let settings = settings.normalized();
        let policy = settings.to_runner_policy();
        let registry = CommandRegistry::new(commands);
        log::info!(
            "command engine ready with {} command(s), {} configuration error(s)",
            registry.len(),
            registry.configuration_errors().len()
        );
        Self {
            registry: RwLock::new(Arc::new(registry)),
            matcher: Matcher::new(settings.filter_timeout(), policy.clone()),
            supervisor: Arc::new(Supervisor::new(policy, settings.max_retained_runs)),
            sink,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn configuration_errors(&self) -> Vec<EngineError> {
        self.registry.read().configuration_errors().to_vec()
    }

    /// Swaps the definition list; running pipelines keep their own copy.
    pub fn replace_commands(&self, commands: Vec<CommandDefinition>) -> Vec<EngineError> {
        let registry = CommandRegistry::new(commands);
        let errors = registry.configuration_errors().to_vec();
        *self.registry.write() = Arc::new(registry);
        errors
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut registry = self.registry.write();
        Arc::make_mut(&mut *registry).set_enabled(name, enabled)
    }

    /// Snapshot of the current definitions; the lock is never held across
    /// filter processes.
    fn registry(&self) -> Arc<CommandRegistry> {
        self.registry.read().clone()
    }

    pub fn menu_commands(&self, item: &ClipboardItem) -> Vec<String> {
        self.registry()
            .candidates(TriggerKind::Menu, item, &self.matcher)
            .into_iter()
            .map(|candidate| candidate.definition.name)
            .collect()
    }

    pub fn global_shortcuts(&self) -> Vec<String> {
        self.registry
            .read()
            .shortcuts()
            .global_chords()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Runs every automatic command matching a new clipboard item.
    pub fn on_clipboard_item(&self, item: &ClipboardItem) -> AutomaticDispatch {
        let candidates = self
            .registry()
            .candidates(TriggerKind::Automatic, item, &self.matcher);
        let origin = ItemOrigin::of(item);

        let mut dispatch = AutomaticDispatch::default();
        let mut effects = Vec::new();
        for candidate in candidates {
            let definition = &candidate.definition;
            dispatch.item_removed |= definition.remove_item;
            dispatch.hide_main_window |= definition.hide_main_window;
            effects.extend(router::automatic_effects(definition, &origin));

            if !definition.has_program() {
                continue;
            }
            match self.start(candidate, item) {
                Ok(id) => dispatch.started.push(id),
                Err(err) => {
                    log::warn!("{err}");
                    dispatch.failed.push(err);
                }
            }
        }

        deliver(self.sink.as_ref(), effects);
        dispatch
    }

    /// Runs one command explicitly, without checking its predicates.
    pub fn invoke(&self, name: &str, item: &ClipboardItem) -> Result<RunId, EngineError> {
        let candidate = self.registry().explicit(name, item)?;
        if !candidate.definition.has_program() {
            return Err(EngineError::configuration(name, "command has no program"));
        }
        self.start(candidate, item)
    }

    pub fn invoke_shortcut(&self, chord: &str, item: &ClipboardItem) -> Result<RunId, EngineError> {
        let name = self
            .registry
            .read()
            .resolve_shortcut(chord)
            .map(|definition| definition.name.clone())
            .ok_or_else(|| EngineError::UnknownCommand(format!("shortcut {chord}")))?;
        self.invoke(&name, item)
    }

    fn start(&self, candidate: Candidate, item: &ClipboardItem) -> Result<RunId, EngineError> {
        let Candidate {
            definition,
            captures,
        } = candidate;
        let spec = pipeline::build(&definition, item, &captures)?;
        let origin = ItemOrigin::of(item);
        let sink = self.sink.clone();

        let on_complete: CompletionHook = Box::new(move |snapshot: RunSnapshot| {
            let mutations = router::route(&definition, &origin, &captures, &snapshot);
            deliver(sink.as_ref(), mutations);
        });
        let handle = self.supervisor.launch(
            spec,
            Some(item.id),
            item.data().clone(),
            Some(on_complete),
        );
        log::info!("started '{}' as run {}", handle.command_name(), handle.id());
        Ok(handle.id())
    }

    pub fn list(&self) -> Vec<RunSnapshot> {
        self.supervisor.list()
    }

    pub fn cancel(&self, id: RunId) -> bool {
        self.supervisor.cancel(id)
    }

    pub fn shutdown(&self) -> ShutdownReport {
        let report = self.supervisor.shutdown();
        if report.still_running > 0 {
            log::warn!(
                "{} command(s) still running after shutdown",
                report.still_running
            );
        }
        report
    }
}

/// Hands mutations to the sink once per destination tab, in first-seen order.
fn deliver(sink: &dyn MutationSink, mutations: Vec<ItemMutation>) {
    let mut groups: Vec<(String, Vec<ItemMutation>)> = Vec::new();
    for mutation in mutations {
        let tab = mutation.destination_tab();
        match groups.iter().position(|(existing, _)| existing == tab) {
            Some(index) => groups[index].1.push(mutation),
            None => groups.push((tab.to_string(), vec![mutation])),
        }
    }
    for (tab, group) in groups {
        sink.apply_mutations(group, &tab);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, Vec<ItemMutation>)>>,
    }

    impl MutationSink for RecordingSink {
        fn apply_mutations(&self, mutations: Vec<ItemMutation>, destination_tab: &str) {
            self.calls
                .lock()
                .push((destination_tab.to_string(), mutations));
        }
    }

    fn engine(commands: Vec<CommandDefinition>) -> (CommandEngine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let engine = CommandEngine::new(commands, EngineSettings::default(), sink.clone());
        (engine, sink)
    }

    #[test]
    fn deliver_groups_by_tab() {
        let sink = RecordingSink::default();
        let create = |tab: &str| ItemMutation::Create {
            tab: tab.to_string(),
            mime: "text/plain".to_string(),
            data: Vec::new(),
            tags: Vec::new(),
        };
        deliver(&sink, vec![create("a"), create("b"), create("a")]);

        let calls = sink.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "a");
        assert_eq!(calls[0].1.len(), 2);
        assert_eq!(calls[1].0, "b");
    }

    #[test]
    fn copy_and_remove_need_no_program() {
        let mut archive = CommandDefinition::new("archive").with_content_match("^secret");
        archive.automatic = true;
        archive.copy_to_tab = Some("vault".to_string());
        archive.remove_item = true;
        archive.hide_main_window = true;
        let (engine, sink) = engine(vec![archive]);

        let item = ClipboardItem::from_text(4, "clipboard", "secret token");
        let dispatch = engine.on_clipboard_item(&item);
        assert!(dispatch.started.is_empty());
        assert!(dispatch.item_removed);
        assert!(dispatch.hide_main_window);

        let calls = sink.calls.lock();
        let tabs = calls.iter().map(|(tab, _)| tab.as_str()).collect::<Vec<_>>();
        assert_eq!(tabs, vec!["vault", "clipboard"]);
    }

    #[test]
    fn invoke_reports_lookup_errors() {
        let mut disabled = CommandDefinition::new("off").with_program(["true"]);
        disabled.enabled = false;
        let (engine, _) = engine(vec![disabled, CommandDefinition::new("empty")]);
        let item = ClipboardItem::from_text(1, "clipboard", "x");

        assert_eq!(
            engine.invoke("nope", &item),
            Err(EngineError::UnknownCommand("nope".to_string()))
        );
        assert_eq!(
            engine.invoke("off", &item),
            Err(EngineError::CommandDisabled("off".to_string()))
        );
        assert!(matches!(
            engine.invoke("empty", &item),
            Err(EngineError::Configuration { .. })
        ));
        assert!(engine.invoke_shortcut("ctrl+q", &item).is_err());
    }

    #[test]
    fn replace_commands_reports_new_errors() {
        let (engine, _) = engine(Vec::new());
        assert!(engine.configuration_errors().is_empty());

        let errors = engine.replace_commands(vec![
            CommandDefinition::new("bad").with_content_match("[")
        ]);
        assert_eq!(errors.len(), 1);
        assert_eq!(engine.configuration_errors(), errors);
    }

    #[cfg(unix)]
    #[test]
    fn registry_updates_do_not_wait_for_filters() {
        let mut slow = CommandDefinition::new("slow").with_program(["true"]);
        slow.automatic = true;
        slow.filter_program = Some("sleep 1".to_string());
        let (engine, _) = engine(vec![slow, CommandDefinition::new("other")]);
        let item = ClipboardItem::from_text(2, "clipboard", "x");

        std::thread::scope(|scope| {
            let matching = scope.spawn(|| engine.on_clipboard_item(&item));
            std::thread::sleep(std::time::Duration::from_millis(200));

            let started = std::time::Instant::now();
            assert!(engine.set_enabled("other", false));
            assert!(started.elapsed() < std::time::Duration::from_millis(500));

            let dispatch = matching.join().expect("matching thread");
            assert_eq!(dispatch.started.len(), 1);
        });
        engine.shutdown();
    }

    #[test]
    fn menu_commands_list_matching_names() {
        let mut upper = CommandDefinition::new("upper")
            .with_content_match("[a-z]")
            .with_program(["tr", "a-z", "A-Z"]);
        upper.in_menu = true;
        let mut digits = CommandDefinition::new("digits").with_content_match("^[0-9]+$");
        digits.in_menu = true;
        let (engine, _) = engine(vec![upper, digits]);

        let item = ClipboardItem::from_text(1, "clipboard", "abc");
        assert_eq!(engine.menu_commands(&item), vec!["upper"]);
    }
}
