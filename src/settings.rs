// settings.rs — key/value settings persistence (the extension's synced storage)
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub type SettingsMap = Map<String, Value>;

/// Per-provider API keys: `{ "<provider>": "<key>" }`
pub const API_KEYS: &str         = "apiKeys";
/// Per-provider model names
pub const MODELS: &str           = "models";
/// Per-provider sampling temperatures
pub const TEMPERATURES: &str     = "temperatures";
pub const CURRENT_PROVIDER: &str = "currentProvider";

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Values for `keys`; missing keys are simply absent. An empty slice returns everything.
    async fn get(&self, keys: &[&str]) -> anyhow::Result<SettingsMap>;
    async fn set(&self, values: SettingsMap) -> anyhow::Result<()>;
}

fn select(all: &SettingsMap, keys: &[&str]) -> SettingsMap {
    if keys.is_empty() {
        return all.clone();
    }
    keys.iter()
        .filter_map(|k| all.get(*k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

// ── In-memory ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySettingsStore {
    values: Mutex<SettingsMap>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: Value) -> Self {
        let values = match values {
            Value::Object(map) => map,
            _ => SettingsMap::new(),
        };
        MemorySettingsStore { values: Mutex::new(values) }
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, keys: &[&str]) -> anyhow::Result<SettingsMap> {
        Ok(select(&*self.values.lock().await, keys))
    }

    async fn set(&self, values: SettingsMap) -> anyhow::Result<()> {
        self.values.lock().await.extend(values);
        Ok(())
    }
}

// ── JSON file ───────────────────────────────────────────────────────────

/// Settings persisted as one pretty-printed JSON object.
pub struct JsonFileSettingsStore {
    path:   PathBuf,
    values: Mutex<SettingsMap>,
}

impl JsonFileSettingsStore {
    /// Load `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => SettingsMap::new(),
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("settings file {} is not a JSON object", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SettingsMap::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        log::info!("settings loaded from {} ({} keys)", path.display(), values.len());
        Ok(JsonFileSettingsStore { path, values: Mutex::new(values) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for JsonFileSettingsStore {
    async fn get(&self, keys: &[&str]) -> anyhow::Result<SettingsMap> {
        Ok(select(&*self.values.lock().await, keys))
    }

    async fn set(&self, values: SettingsMap) -> anyhow::Result<()> {
        let mut current = self.values.lock().await;
        current.extend(values);
        let raw = serde_json::to_string_pretty(&*current)?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        tokio::fs::write(&self.path, raw)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }
}
