use std::collections::BTreeMap;

pub const MIME_TEXT: &str = "text/plain";

/// Read-only view of a clipboard history entry.
pub trait ItemData {
    fn representation(&self, mime: &str) -> Option<&[u8]>;

    fn formats(&self) -> Vec<String>;

    fn source_window_title(&self) -> Option<&str>;

    fn primary_text(&self) -> Option<String> {
        self.representation(MIME_TEXT)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    fn has_format(&self, mime: &str) -> bool {
        self.representation(mime).is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClipboardItem {
    pub id: u64,
    pub tab: String,
    pub window_title: Option<String>,
    data: BTreeMap<String, Vec<u8>>,
}

impl ClipboardItem {
    pub fn new(id: u64, tab: impl Into<String>) -> Self {
        Self {
            id,
            tab: tab.into(),
            ..Self::default()
        }
    }

    pub fn from_text(id: u64, tab: impl Into<String>, text: &str) -> Self {
        Self::new(id, tab).with_format(MIME_TEXT, text.as_bytes().to_vec())
    }

    pub fn with_format(mut self, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.data.insert(mime.into(), bytes);
        self
    }

    pub fn with_window_title(mut self, title: impl Into<String>) -> Self {
        self.window_title = Some(title.into());
        self
    }

    pub fn data(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.data
    }
}

impl ItemData for ClipboardItem {
    fn representation(&self, mime: &str) -> Option<&[u8]> {
        self.data.get(mime).map(Vec::as_slice)
    }

    fn formats(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    fn source_window_title(&self) -> Option<&str> {
        self.window_title.as_deref()
    }
}

/// Where a run came from, kept so results can be routed back to the item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemOrigin {
    pub item_id: u64,
    pub tab: String,
}

impl ItemOrigin {
    pub fn of(item: &ClipboardItem) -> Self {
        Self {
            item_id: item.id,
            tab: item.tab.clone(),
        }
    }
}

/// Change requested from the external history store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemMutation {
    Create {
        tab: String,
        mime: String,
        data: Vec<u8>,
        tags: Vec<String>,
    },
    Replace {
        item_id: u64,
        tab: String,
        mime: String,
        data: Vec<u8>,
    },
    RemoveFormats {
        item_id: u64,
        tab: String,
        formats: Vec<String>,
    },
    CopyItem {
        item_id: u64,
        source_tab: String,
        tab: String,
    },
    RemoveItem {
        item_id: u64,
        tab: String,
    },
}

impl ItemMutation {
    pub fn destination_tab(&self) -> &str {
        match self {
            Self::Create { tab, .. }
            | Self::Replace { tab, .. }
            | Self::RemoveFormats { tab, .. }
            | Self::CopyItem { tab, .. }
            | Self::RemoveItem { tab, .. } => tab,
        }
    }
}

pub trait MutationSink: Send + Sync {
    fn apply_mutations(&self, mutations: Vec<ItemMutation>, destination_tab: &str);
}
