use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::config::{ConfigProvider, presets_dir};
use crate::error::ProxyError;
use crate::events::{EventBus, ProxyEvent};
use crate::tag_query::TagQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetStrategy {
    Or,
    And,
    Advanced,
}

/// A named, persisted tag query selecting a subset of outbound servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub strategy: PresetStrategy,
    pub tag_query: TagQuery,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<chrono::DateTime<chrono::Utc>>,
}

impl Preset {
    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        self.tag_query.matches(tags)
    }
}

/// Outcome of a membership recompute for one preset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub has_changed: bool,
}

pub type SubscriptionId = u64;
type Callback = Arc<dyn Fn(&Preset) + Send + Sync>;

#[derive(Default)]
struct Inner {
    presets: HashMap<String, Preset>,
    previous_membership: HashMap<String, Vec<String>>,
    subscribers: HashMap<String, Vec<(SubscriptionId, Callback)>>,
    next_subscription: SubscriptionId,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PresetIndex {
    presets: Vec<String>,
}

/// Named persistent filters: one JSON per preset plus an index, guarded by
/// an in-process mutex; disk writes are atomic (temp + rename).
pub struct PresetManager {
    cp: Arc<dyn ConfigProvider>,
    events: EventBus,
    inner: Mutex<Inner>,
}

impl PresetManager {
    fn dir(&self) -> PathBuf {
        presets_dir(self.cp.as_ref())
    }

    fn preset_path(&self, name: &str) -> Result<PathBuf, ProxyError> {
        if !crate::config::ServerDescriptor::is_valid_name(name) {
            return Err(ProxyError::Validation(format!("invalid preset name '{name}'")));
        }
        Ok(self.dir().join(format!("{name}.json")))
    }

    fn load_from_disk(&self) {
        let index_path = self.dir().join("index.json");
        let Ok(content) = fs::read_to_string(&index_path) else {
            return;
        };
        let Ok(index) = serde_json::from_str::<PresetIndex>(&content) else {
            tracing::warn!(target = "preset", "index.json unreadable, starting empty");
            return;
        };
        let mut inner = self.inner.lock().expect("preset lock");
        for name in index.presets {
            let Ok(path) = self.preset_path(&name) else {
                continue;
            };
            match fs::read_to_string(&path)
                .map_err(ProxyError::storage)
                .and_then(|s| serde_json::from_str::<Preset>(&s).map_err(ProxyError::storage))
            {
                Ok(preset) => {
                    inner.presets.insert(name, preset);
                }
                Err(e) => {
                    tracing::warn!(target = "preset", preset = %name, "unreadable: {e}");
                }
            }
        }
    }

    fn write_atomic(&self, path: &PathBuf, content: &str) -> Result<(), ProxyError> {
        let dir = path.parent().ok_or_else(|| ProxyError::Storage("no parent dir".into()))?;
        fs::create_dir_all(dir).map_err(ProxyError::storage)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(ProxyError::storage)?;
        fs::rename(&tmp, path).map_err(ProxyError::storage)
    }

    fn persist_index(&self, inner: &Inner) -> Result<(), ProxyError> {
        let mut names: Vec<String> = inner.presets.keys().cloned().collect();
        names.sort();
        let index = PresetIndex { presets: names };
        let content = serde_json::to_string_pretty(&index).map_err(ProxyError::storage)?;
        self.write_atomic(&self.dir().join("index.json"), &content)
    }

    pub fn save(&self, preset: Preset) -> Result<(), ProxyError> {
        let path = self.preset_path(&preset.name)?;
        let content = serde_json::to_string_pretty(&preset).map_err(ProxyError::storage)?;
        self.write_atomic(&path, &content)?;
        let name = preset.name.clone();
        let callbacks = {
            let mut inner = self.inner.lock().expect("preset lock");
            inner.presets.insert(name.clone(), preset.clone());
            self.persist_index(&inner)?;
            inner
                .subscribers
                .get(&name)
                .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect::<Vec<_>>())
                .unwrap_or_default()
        };
        tracing::info!(target = "preset", preset = %name, "saved");
        self.events.publish(ProxyEvent::PresetSaved { name: name.clone() });
        for cb in callbacks {
            cb(&preset);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Preset> {
        self.inner.lock().expect("preset lock").presets.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.lock().expect("preset lock").presets.contains_key(name)
    }

    pub fn list(&self) -> Vec<Preset> {
        let mut presets: Vec<Preset> = self
            .inner
            .lock()
            .expect("preset lock")
            .presets
            .values()
            .cloned()
            .collect();
        presets.sort_by(|a, b| a.name.cmp(&b.name));
        presets
    }

    pub fn delete(&self, name: &str) -> Result<bool, ProxyError> {
        let path = self.preset_path(name)?;
        let existed = {
            let mut inner = self.inner.lock().expect("preset lock");
            let existed = inner.presets.remove(name).is_some();
            inner.previous_membership.remove(name);
            if existed {
                self.persist_index(&inner)?;
            }
            existed
        };
        if existed {
            if path.exists() {
                fs::remove_file(&path).map_err(ProxyError::storage)?;
            }
            self.events.publish(ProxyEvent::PresetDeleted { name: name.to_string() });
        }
        Ok(existed)
    }

    pub fn mark_used(&self, name: &str) {
        let mut inner = self.inner.lock().expect("preset lock");
        if let Some(preset) = inner.presets.get_mut(name) {
            preset.last_used = Some(chrono::Utc::now());
        }
    }

    /// Names of the given servers whose tags currently satisfy the preset,
    /// sorted.
    pub fn test(
        &self,
        name: &str,
        servers: &[(String, BTreeSet<String>)],
    ) -> Result<Vec<String>, ProxyError> {
        let preset = self
            .get(name)
            .ok_or_else(|| ProxyError::NotFound("preset", name.to_string()))?;
        let mut matched: Vec<String> = servers
            .iter()
            .filter(|(_, tags)| preset.matches(tags))
            .map(|(n, _)| n.clone())
            .collect();
        matched.sort();
        Ok(matched)
    }

    /// Recompute a preset's membership and report the set difference
    /// against the previous run. Subscribers fire when the set moved.
    pub fn refresh_membership(
        &self,
        name: &str,
        servers: &[(String, BTreeSet<String>)],
    ) -> Result<MembershipChange, ProxyError> {
        let current = self.test(name, servers)?;
        let (change, callbacks, preset) = {
            let mut inner = self.inner.lock().expect("preset lock");
            let previous = inner
                .previous_membership
                .insert(name.to_string(), current.clone())
                .unwrap_or_default();
            let added: Vec<String> = current
                .iter()
                .filter(|n| !previous.contains(n))
                .cloned()
                .collect();
            let removed: Vec<String> = previous
                .iter()
                .filter(|n| !current.contains(n))
                .cloned()
                .collect();
            let unchanged: Vec<String> = current
                .iter()
                .filter(|n| previous.contains(n))
                .cloned()
                .collect();
            let change = MembershipChange {
                has_changed: !added.is_empty() || !removed.is_empty(),
                added,
                removed,
                unchanged,
            };
            let callbacks = if change.has_changed {
                inner
                    .subscribers
                    .get(name)
                    .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect::<Vec<_>>())
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            (change, callbacks, inner.presets.get(name).cloned())
        };
        if let Some(preset) = preset {
            for cb in callbacks {
                cb(&preset);
            }
        }
        Ok(change)
    }

    /// Callback fires when the preset definition or its membership set
    /// changes. Unsubscribe on session close.
    pub fn subscribe(
        &self,
        name: &str,
        callback: impl Fn(&Preset) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock().expect("preset lock");
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner
            .subscribers
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().expect("preset lock");
        for subs in inner.subscribers.values_mut() {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

// Process-wide singleton with explicit initialize/cleanup; tests swap it
// out via `reset`.
static GLOBAL_MANAGER: OnceLock<RwLock<Option<Arc<PresetManager>>>> = OnceLock::new();

fn cell() -> &'static RwLock<Option<Arc<PresetManager>>> {
    GLOBAL_MANAGER.get_or_init(|| RwLock::new(None))
}

pub fn initialize(cp: Arc<dyn ConfigProvider>, events: EventBus) -> Arc<PresetManager> {
    let manager = Arc::new(PresetManager {
        cp,
        events,
        inner: Mutex::new(Inner::default()),
    });
    manager.load_from_disk();
    *cell().write().expect("preset global lock") = Some(manager.clone());
    manager
}

pub fn global() -> Option<Arc<PresetManager>> {
    cell().read().expect("preset global lock").clone()
}

pub fn cleanup() {
    *cell().write().expect("preset global lock") = None;
}

/// Test hook: identical to cleanup, named for intent at call sites.
pub fn reset() {
    cleanup();
}
