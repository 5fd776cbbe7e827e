use crate::command::CommandDefinition;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyModifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
}

impl KeyModifiers {
    /// Sets the modifier named by `token`; false when it names a key instead.
    fn apply(&mut self, token: &str) -> bool {
        let flag = match token {
            "ctrl" | "control" => &mut self.ctrl,
            "alt" | "option" => &mut self.alt,
            "shift" => &mut self.shift,
            "meta" | "cmd" | "command" | "super" | "win" => &mut self.meta,
            _ => return false,
        };
        *flag = true;
        true
    }

    fn labels(self) -> impl Iterator<Item = &'static str> {
        [
            (self.ctrl, "Ctrl"),
            (self.alt, "Alt"),
            (self.shift, "Shift"),
            (self.meta, "Meta"),
        ]
        .into_iter()
        .filter_map(|(set, label)| set.then_some(label))
    }
}

/// One modifier set plus a single key, e.g. `Ctrl+Shift+V`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyChord {
    pub mods: KeyModifiers,
    /// Lowercase key name with aliases folded (`esc` becomes `escape`).
    pub key: String,
}

fn canonical_key(token: &str) -> String {
    match token {
        "esc" => "escape",
        "return" => "enter",
        "del" => "delete",
        "ins" => "insert",
        "pgup" => "pageup",
        "pgdown" => "pagedown",
        other => other,
    }
    .to_string()
}

impl KeyChord {
    pub fn parse(input: &str) -> Option<Self> {
        let mut mods = KeyModifiers::default();
        let mut keys = input
            .split('+')
            .map(|part| part.trim().to_ascii_lowercase())
            .filter(|part| !part.is_empty())
            .filter(|part| !mods.apply(part));

        let key = keys.next()?;
        if keys.next().is_some() {
            return None;
        }
        Some(Self {
            mods,
            key: canonical_key(&key),
        })
    }

    pub fn normalize_string(input: &str) -> Option<String> {
        Self::parse(input).map(|chord| chord.to_string())
    }

    pub fn matches_event(&self, event_key: &str, mods: KeyModifiers) -> bool {
        self.mods == mods && self.key == canonical_key(&event_key.to_ascii_lowercase())
    }
}

impl std::fmt::Display for KeyChord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for label in self.mods.labels() {
            write!(f, "{label}+")?;
        }
        let mut chars = self.key.chars();
        if let Some(first) = chars.next() {
            write!(f, "{}{}", first.to_ascii_uppercase(), chars.as_str())?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct ShortcutEntry {
    command: String,
    chord: KeyChord,
    chord_text: String,
    global: bool,
}

/// Chord bindings collected from command definitions, first definition wins.
#[derive(Clone, Debug, Default)]
pub struct ShortcutMap {
    entries: Vec<ShortcutEntry>,
}

impl ShortcutMap {
    /// Builds the map from enabled definitions; unparsable chords are returned
    /// as `(command, chord)` pairs.
    pub fn from_definitions<'a, I>(definitions: I) -> (Self, Vec<(String, String)>)
    where
        I: IntoIterator<Item = &'a CommandDefinition>,
    {
        let mut map = Self::default();
        let mut invalid = Vec::new();
        for definition in definitions.into_iter().filter(|d| d.enabled) {
            let local = definition.shortcuts.iter().map(|chord| (chord, false));
            let global = definition.global_shortcuts.iter().map(|chord| (chord, true));
            for (chord, is_global) in local.chain(global) {
                if let Err(chord) = map.bind(&definition.name, chord, is_global) {
                    invalid.push((definition.name.clone(), chord));
                }
            }
        }
        (map, invalid)
    }

    pub fn bind(&mut self, command: &str, chord: &str, global: bool) -> Result<(), String> {
        let Some(parsed) = KeyChord::parse(chord) else {
            return Err(chord.to_string());
        };
        self.entries.push(ShortcutEntry {
            command: command.to_string(),
            chord_text: parsed.to_string(),
            chord: parsed,
            global,
        });
        Ok(())
    }

    pub fn resolve(&self, chord: &str) -> Option<&str> {
        let normalized = KeyChord::normalize_string(chord)?;
        self.entries
            .iter()
            .find(|entry| entry.chord_text.eq_ignore_ascii_case(&normalized))
            .map(|entry| entry.command.as_str())
    }

    pub fn resolve_event(&self, event_key: &str, mods: KeyModifiers) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.chord.matches_event(event_key, mods))
            .map(|entry| entry.command.as_str())
    }

    pub fn global_chords(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.global)
            .map(|entry| entry.chord_text.as_str())
            .collect()
    }

    pub fn shortcuts_for(&self, command: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.command == command)
            .map(|entry| entry.chord_text.as_str())
            .collect()
    }
}
