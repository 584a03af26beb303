use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrMode {
    #[default]
    Inherit,
    Pipe,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartPolicy {
    #[serde(default)]
    pub on_exit: bool,
    #[serde(default)]
    pub max: Option<u32>,
    #[serde(default = "default_restart_delay_ms")]
    pub delay_ms: u64,
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            on_exit: false,
            max: None,
            delay_ms: default_restart_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub auto_register: bool,
}

/// One configured outbound MCP server. Immutable per configuration epoch;
/// `name` is the sole stable identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerDescriptor {
    /// Filled from the `mcpServers` map key at load time.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, rename = "type")]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub restart: RestartPolicy,

    // stdio
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub inherit_parent_env: bool,
    #[serde(default)]
    pub env_filter: Vec<String>,
    #[serde(default)]
    pub stderr_mode: StderrMode,

    // http/sse
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
}

fn default_true() -> bool {
    true
}

pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

impl ServerDescriptor {
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    }

    /// Resolve the transport kind, inferring it when the config omits `type`:
    /// a command means stdio, a url ending in `/mcp` means streamable HTTP,
    /// any other url means SSE.
    pub fn transport_kind(&self) -> Result<TransportKind, ProxyError> {
        if let Some(kind) = self.transport {
            return Ok(kind);
        }
        if self.command.is_some() {
            return Ok(TransportKind::Stdio);
        }
        match self.url.as_deref() {
            Some(url) if url.trim_end_matches('/').ends_with("/mcp") => Ok(TransportKind::Http),
            Some(_) => Ok(TransportKind::Sse),
            None => Err(ProxyError::Validation(format!(
                "server '{}': neither command nor url given",
                self.name
            ))),
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if !Self::is_valid_name(&self.name) {
            return Err(ProxyError::Validation(format!(
                "invalid server name '{}'",
                self.name
            )));
        }
        if self.command.is_some() && self.url.is_some() {
            return Err(ProxyError::Validation(format!(
                "server '{}': command and url are mutually exclusive",
                self.name
            )));
        }
        for tag in &self.tags {
            if !Self::is_valid_name(tag) {
                return Err(ProxyError::Validation(format!(
                    "server '{}': invalid tag '{tag}'",
                    self.name
                )));
            }
        }
        match self.transport_kind()? {
            TransportKind::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(ProxyError::Validation(format!(
                        "server '{}': stdio transport requires a command",
                        self.name
                    )));
                }
            }
            TransportKind::Http | TransportKind::Sse => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(ProxyError::Validation(format!(
                        "server '{}': http/sse transport requires a url",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn call_timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS)
    }
}

/// Options recognized by the loading manager. Unknown keys fail at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LoadingOptions {
    #[serde(default = "default_server_timeout_ms")]
    pub server_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_concurrent_loads")]
    pub max_concurrent_loads: usize,
    #[serde(default = "default_true")]
    pub continue_on_failure: bool,
    #[serde(default = "default_true")]
    pub enable_background_retry: bool,
    #[serde(default = "default_background_retry_interval_ms")]
    pub background_retry_interval_ms: u64,
}

fn default_server_timeout_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2_000
}
fn default_max_concurrent_loads() -> usize {
    5
}
fn default_background_retry_interval_ms() -> u64 {
    60_000
}

impl Default for LoadingOptions {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults deserialize")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: HashMap<String, ServerDescriptor>,
    #[serde(default)]
    pub loading: Option<LoadingOptions>,
}

impl Config {
    /// Enabled, validated descriptors sorted by name. Entries that fail
    /// validation are dropped individually with a warning so one bad server
    /// never takes the rest of the configuration down.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        let mut out: Vec<ServerDescriptor> = Vec::new();
        for (name, desc) in &self.mcp_servers {
            let mut desc = desc.clone();
            desc.name = name.clone();
            if desc.disabled {
                continue;
            }
            match desc.validate() {
                Ok(()) => out.push(desc),
                Err(e) => {
                    tracing::warn!(target = "config", server = %name, "skipping: {e}");
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn loading_options(&self) -> LoadingOptions {
        self.loading.clone().unwrap_or_default()
    }
}

/// Substitute `${VAR}` on string leaves. Unresolved variables fall through
/// literally with a warning.
pub fn substitute_env_vars(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if let Some(expanded) = expand_env(s) {
                *s = expanded;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_env_vars(item);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_env_vars(item);
            }
        }
        _ => {}
    }
}

fn expand_env(input: &str) -> Option<String> {
    if !input.contains("${") {
        return None;
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                match std::env::var(var) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => {
                        tracing::warn!(target = "config", var = %var, "unresolved ${{VAR}} left literal");
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Some(out)
}

// Config paths abstraction to make IO testable
pub trait ConfigProvider: Send + Sync {
    fn base_dir(&self) -> PathBuf;
}

#[derive(Default, Clone)]
pub struct OsConfigProvider;

impl ConfigProvider for OsConfigProvider {
    fn base_dir(&self) -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
        base.join("1mcp")
    }
}

pub fn config_dir(cp: &dyn ConfigProvider) -> PathBuf {
    cp.base_dir().join("config")
}

pub fn mcp_config_path(cp: &dyn ConfigProvider) -> PathBuf {
    config_dir(cp).join("mcp.json")
}

pub fn presets_dir(cp: &dyn ConfigProvider) -> PathBuf {
    config_dir(cp).join("presets")
}

pub fn sessions_dir(cp: &dyn ConfigProvider) -> PathBuf {
    cp.base_dir().join("sessions")
}

pub fn load_config_with(cp: &dyn ConfigProvider) -> Result<Config, ProxyError> {
    let path = mcp_config_path(cp);
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(&path).map_err(ProxyError::storage)?;
    let mut raw: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| ProxyError::Validation(e.to_string()))?;
    substitute_env_vars(&mut raw);
    serde_json::from_value(raw).map_err(|e| ProxyError::Validation(e.to_string()))
}

pub fn save_config_with(cp: &dyn ConfigProvider, config: &Config) -> Result<(), ProxyError> {
    let path = mcp_config_path(cp);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(ProxyError::storage)?;
    }
    let content = serde_json::to_string_pretty(config).map_err(ProxyError::storage)?;
    fs::write(&path, content).map_err(ProxyError::storage)
}

/// Descriptor-level difference between two configuration epochs, used to
/// drive connection transitions on config reload.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DescriptorDiff {
    pub added: Vec<ServerDescriptor>,
    pub removed: Vec<String>,
    pub changed: Vec<ServerDescriptor>,
}

impl DescriptorDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn diff_descriptors(prev: &[ServerDescriptor], curr: &[ServerDescriptor]) -> DescriptorDiff {
    let prev_by_name: HashMap<&str, &ServerDescriptor> =
        prev.iter().map(|d| (d.name.as_str(), d)).collect();
    let curr_names: BTreeSet<&str> = curr.iter().map(|d| d.name.as_str()).collect();
    let mut diff = DescriptorDiff::default();
    for desc in curr {
        match prev_by_name.get(desc.name.as_str()) {
            None => diff.added.push(desc.clone()),
            Some(old) if *old != desc => diff.changed.push(desc.clone()),
            Some(_) => {}
        }
    }
    for desc in prev {
        if !curr_names.contains(desc.name.as_str()) {
            diff.removed.push(desc.name.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> ServerDescriptor {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "command": "echo",
        }))
        .unwrap()
    }

    #[test]
    fn transport_inference() {
        let stdio = descriptor("a");
        assert_eq!(stdio.transport_kind().unwrap(), TransportKind::Stdio);

        let http: ServerDescriptor = serde_json::from_value(serde_json::json!({
            "name": "h", "url": "http://localhost:3000/mcp"
        }))
        .unwrap();
        assert_eq!(http.transport_kind().unwrap(), TransportKind::Http);

        let sse: ServerDescriptor = serde_json::from_value(serde_json::json!({
            "name": "s", "url": "http://localhost:3000/sse"
        }))
        .unwrap();
        assert_eq!(sse.transport_kind().unwrap(), TransportKind::Sse);
    }

    #[test]
    fn validation_rejects_bad_names_and_dual_endpoints() {
        let mut d = descriptor("ok-name_1.2");
        assert!(d.validate().is_ok());
        d.name = "spaced name".into();
        assert!(d.validate().is_err());

        let both: ServerDescriptor = serde_json::from_value(serde_json::json!({
            "name": "x", "command": "echo", "url": "http://x/mcp"
        }))
        .unwrap();
        assert!(both.validate().is_err());
    }

    #[test]
    fn unknown_loading_keys_fail_at_parse_time() {
        let res: Result<LoadingOptions, _> = serde_json::from_value(serde_json::json!({
            "serverTimeoutMs": 10, "bogus": true
        }));
        assert!(res.is_err());
        let opts = LoadingOptions::default();
        assert_eq!(opts.server_timeout_ms, 30_000);
        assert_eq!(opts.max_retries, 3);
        assert_eq!(opts.max_concurrent_loads, 5);
        assert!(opts.continue_on_failure);
    }

    #[test]
    fn env_substitution_leaves_unresolved_literal() {
        // Safety: single-threaded within this test; no reader races.
        unsafe { std::env::set_var("ONEMCP_TEST_TOKEN", "s3cret") };
        let mut val = serde_json::json!({
            "headers": {"authorization": "Bearer ${ONEMCP_TEST_TOKEN}"},
            "args": ["${ONEMCP_TEST_MISSING}"]
        });
        substitute_env_vars(&mut val);
        assert_eq!(val["headers"]["authorization"], "Bearer s3cret");
        assert_eq!(val["args"][0], "${ONEMCP_TEST_MISSING}");
    }

    #[test]
    fn descriptors_fill_names_and_skip_invalid() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "mcpServers": {
                "good": {"command": "echo", "tags": ["web"]},
                "disabled": {"command": "echo", "disabled": true},
                "bad": {}
            }
        }))
        .unwrap();
        let descs = cfg.descriptors();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].name, "good");
        assert!(descs[0].tags.contains("web"));
    }

    #[test]
    fn diff_reports_added_removed_changed() {
        let a = descriptor("a");
        let mut a2 = a.clone();
        a2.args = vec!["--flag".into()];
        let b = descriptor("b");
        let c = descriptor("c");

        let diff = diff_descriptors(&[a.clone(), b], &[a2, c]);
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].name, "a");
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].name, "c");
        assert_eq!(diff.removed, vec!["b".to_string()]);
    }
}
