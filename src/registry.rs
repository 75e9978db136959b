//! Durable tab -> session registry for one working directory.
//!
//! The whole table is serialized to a single JSON document and rewritten on
//! every mutation. One live server process per working directory is assumed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredTab {
    pub tab_id: String,
    pub session_id: String,
    pub tab_name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub order: i64,
    pub has_unviewed_completion: bool,
}

/// On-disk shape. Older documents may lack `order` and `hasUnviewedCompletion`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredTab {
    tab_id: String,
    session_id: String,
    tab_name: String,
    created_at: DateTime<Utc>,
    last_activity_at: Option<DateTime<Utc>>,
    order: Option<i64>,
    has_unviewed_completion: Option<bool>,
}

#[derive(Debug)]
pub struct TabRegistry {
    file_path: PathBuf,
    tabs: BTreeMap<String, RegisteredTab>,
}

impl TabRegistry {
    /// Loads the registry. A missing file is an empty registry; a malformed
    /// one is logged and also treated as empty (it is rewritten on the next
    /// mutation).
    pub fn load(file_path: &Path) -> Self {
        let tabs = match std::fs::read_to_string(file_path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, StoredTab>>(&raw) {
                Ok(stored) => backfill(stored),
                Err(e) => {
                    error!(path = %file_path.display(), error = %e, "Tab registry is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                error!(path = %file_path.display(), error = %e, "Failed to read tab registry, starting empty");
                BTreeMap::new()
            }
        };
        info!(path = %file_path.display(), tabs = tabs.len(), "Loaded tab registry");
        Self {
            file_path: file_path.to_path_buf(),
            tabs,
        }
    }

    /// Registers a tab, or re-points an existing one at `session_id`.
    pub fn register_tab(&mut self, tab_id: &str, session_id: &str, name: Option<&str>) -> RegisteredTab {
        let now = Utc::now();
        let tab = match self.tabs.get_mut(tab_id) {
            Some(existing) => {
                existing.session_id = session_id.to_string();
                existing.last_activity_at = now;
                if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                    existing.tab_name = name.to_string();
                }
                existing.clone()
            }
            None => {
                let tab_name = match name.filter(|n| !n.trim().is_empty()) {
                    Some(name) => name.to_string(),
                    None => self.next_default_name(),
                };
                let tab = RegisteredTab {
                    tab_id: tab_id.to_string(),
                    session_id: session_id.to_string(),
                    tab_name,
                    created_at: now,
                    last_activity_at: now,
                    order: self.next_order(),
                    has_unviewed_completion: false,
                };
                self.tabs.insert(tab_id.to_string(), tab.clone());
                tab
            }
        };
        debug!(tab_id, session_id, "Registered tab");
        self.save();
        tab
    }

    pub fn unregister_tab(&mut self, tab_id: &str) -> bool {
        let removed = self.tabs.remove(tab_id).is_some();
        if removed {
            self.save();
        }
        removed
    }

    pub fn get(&self, tab_id: &str) -> Option<&RegisteredTab> {
        self.tabs.get(tab_id)
    }

    pub fn get_tab_session(&self, tab_id: &str) -> Option<String> {
        self.tabs.get(tab_id).map(|t| t.session_id.clone())
    }

    pub fn update_tab_session(&mut self, tab_id: &str, new_session_id: &str) -> bool {
        self.mutate(tab_id, |tab| {
            tab.session_id = new_session_id.to_string();
            tab.last_activity_at = Utc::now();
        })
    }

    pub fn touch(&mut self, tab_id: &str) -> bool {
        self.mutate(tab_id, |tab| tab.last_activity_at = Utc::now())
    }

    pub fn update_name(&mut self, tab_id: &str, name: &str) -> bool {
        let name = name.trim().to_string();
        if name.is_empty() {
            return false;
        }
        self.mutate(tab_id, |tab| tab.tab_name = name)
    }

    pub fn mark_viewed(&mut self, tab_id: &str) -> bool {
        self.mutate(tab_id, |tab| tab.has_unviewed_completion = false)
    }

    pub fn mark_unviewed(&mut self, tab_id: &str) -> bool {
        self.mutate(tab_id, |tab| {
            tab.has_unviewed_completion = true;
            tab.last_activity_at = Utc::now();
        })
    }

    /// Assigns ascending order to `ordered_ids`. Known tabs missing from the
    /// list keep their relative order and go after the listed ones.
    pub fn reorder(&mut self, ordered_ids: &[String]) {
        let mut next = 0i64;
        let mut seen = HashSet::new();
        for tab_id in ordered_ids {
            if let Some(tab) = self.tabs.get_mut(tab_id) {
                if seen.insert(tab_id.clone()) {
                    tab.order = next;
                    next += 1;
                }
            } else {
                warn!(tab_id = %tab_id, "Ignoring unknown tab in reorder request");
            }
        }
        let mut rest: Vec<&mut RegisteredTab> = self
            .tabs
            .values_mut()
            .filter(|t| !seen.contains(&t.tab_id))
            .collect();
        rest.sort_by_key(|t| (t.order, t.created_at));
        for tab in rest {
            tab.order = next;
            next += 1;
        }
        self.save();
    }

    /// All tabs sorted by `order`.
    pub fn get_all(&self) -> Vec<RegisteredTab> {
        let mut tabs: Vec<RegisteredTab> = self.tabs.values().cloned().collect();
        tabs.sort_by(|a, b| a.order.cmp(&b.order).then(a.created_at.cmp(&b.created_at)));
        tabs
    }

    pub fn tabs_for_session(&self, session_id: &str) -> Vec<String> {
        self.tabs
            .values()
            .filter(|t| t.session_id == session_id)
            .map(|t| t.tab_id.clone())
            .collect()
    }

    fn mutate(&mut self, tab_id: &str, f: impl FnOnce(&mut RegisteredTab)) -> bool {
        match self.tabs.get_mut(tab_id) {
            Some(tab) => {
                f(tab);
                self.save();
                true
            }
            None => false,
        }
    }

    /// Lowest unused "Chat N", so names freed by deletions are reused.
    fn next_default_name(&self) -> String {
        let taken: HashSet<&str> = self.tabs.values().map(|t| t.tab_name.as_str()).collect();
        let mut n = 1usize;
        loop {
            let candidate = format!("Chat {}", n);
            if !taken.contains(candidate.as_str()) {
                return candidate;
            }
            n += 1;
        }
    }

    fn next_order(&self) -> i64 {
        self.tabs.values().map(|t| t.order + 1).max().unwrap_or(0)
    }

    fn save(&self) {
        if let Err(e) = self.try_save() {
            error!(path = %self.file_path.display(), error = %e, "Failed to persist tab registry");
        }
    }

    fn try_save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.tabs)?;
        let tmp_path = self.file_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.file_path)
    }
}

fn backfill(stored: BTreeMap<String, StoredTab>) -> BTreeMap<String, RegisteredTab> {
    let mut entries: Vec<StoredTab> = stored
        .into_iter()
        .map(|(key, mut tab)| {
            tab.tab_id = key;
            tab
        })
        .collect();
    // Stable: equal timestamps keep document order.
    entries.sort_by_key(|t| t.created_at);

    let mut next_order = entries.iter().filter_map(|t| t.order).map(|o| o + 1).max().unwrap_or(0);
    let mut backfilled = 0usize;
    let mut tabs = BTreeMap::new();
    for tab in entries {
        let order = match tab.order {
            Some(order) => order,
            None => {
                backfilled += 1;
                let order = next_order;
                next_order += 1;
                order
            }
        };
        let registered = RegisteredTab {
            last_activity_at: tab.last_activity_at.unwrap_or(tab.created_at),
            has_unviewed_completion: tab.has_unviewed_completion.unwrap_or(false),
            tab_id: tab.tab_id,
            session_id: tab.session_id,
            tab_name: tab.tab_name,
            created_at: tab.created_at,
            order,
        };
        tabs.insert(registered.tab_id.clone(), registered);
    }
    if backfilled > 0 {
        info!(backfilled, "Backfilled tab order for legacy registry entries");
    }
    tabs
}
