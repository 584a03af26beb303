use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use rmcp::transport::auth::{AuthClient, OAuthClientConfig, OAuthState, OAuthTokenResponse};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigProvider, sessions_dir};

pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:19876/oauth/callback";
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Collapse an outbound server name into a safe file-name component:
/// `[^A-Za-z0-9_-]` becomes `_`, runs collapse, ends are stripped, length
/// capped at 100, empty falls back to `default`.
pub fn sanitize_server_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_');
    let mut result: String = trimmed.chars().take(100).collect();
    result = result.trim_matches('_').to_string();
    if result.is_empty() {
        "default".to_string()
    } else {
        result
    }
}

/// Registered client credentials for one outbound server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInformation {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Raw token response plus an absolute expiry, persisted per server.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedTokens {
    data: serde_json::Value,
    /// Unix milliseconds; absent for non-expiring tokens.
    #[serde(default)]
    expires: Option<i64>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ClientFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client: Option<ClientInformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tokens: Option<PersistedTokens>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SDK-compatible OAuth credential store, keyed by outbound server name.
pub struct OAuthClientProvider<'a> {
    cp: &'a dyn ConfigProvider,
    server_name: String,
}

impl<'a> OAuthClientProvider<'a> {
    pub fn new(cp: &'a dyn ConfigProvider, server_name: impl Into<String>) -> Self {
        Self {
            cp,
            server_name: server_name.into(),
        }
    }

    fn path(&self) -> Result<PathBuf> {
        let dir = sessions_dir(self.cp);
        let file = format!("client_{}.json", sanitize_server_name(&self.server_name));
        let path = dir.join(&file);
        // The sanitized name cannot contain separators, but verify anyway.
        if path.parent() != Some(dir.as_path()) {
            return Err(anyhow!("client path escapes session directory"));
        }
        Ok(path)
    }

    fn read(&self) -> Result<ClientFile> {
        let path = self.path()?;
        if !path.exists() {
            return Ok(ClientFile::default());
        }
        let content = fs::read_to_string(&path).context("read client file")?;
        Ok(serde_json::from_str(&content).unwrap_or_default())
    }

    fn write(&self, file: &ClientFile) -> Result<()> {
        let path = self.path()?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("create session dir")?;
        }
        let content = serde_json::to_string_pretty(file).context("serialize client file")?;
        fs::write(&path, content).context("write client file")
    }

    pub fn client_information(&self) -> Option<ClientInformation> {
        self.read().ok().and_then(|f| f.client)
    }

    pub fn save_client_information(&self, client: ClientInformation) -> Result<()> {
        let mut file = self.read()?;
        file.client = Some(client);
        self.write(&file)
    }

    /// Current tokens, with expiry checked on read; an expired row is
    /// deleted lazily and reads as absent.
    pub fn tokens(&self) -> Option<OAuthTokenResponse> {
        let file = self.read().ok()?;
        let tokens = file.tokens.as_ref()?;
        if let Some(expires) = tokens.expires {
            if expires <= now_ms() {
                let mut cleared = file.clone();
                cleared.tokens = None;
                let _ = self.write(&cleared);
                return None;
            }
        }
        let mut data = tokens.data.clone();
        if let (Some(expires), Some(obj)) = (tokens.expires, data.as_object_mut()) {
            let remaining_s = ((expires - now_ms()).max(0) / 1000) as u64;
            obj.insert("expires_in".to_string(), serde_json::json!(remaining_s));
        }
        serde_json::from_value(data).ok()
    }

    pub fn save_tokens(&self, tokens: &OAuthTokenResponse) -> Result<()> {
        let data = serde_json::to_value(tokens).context("serialize tokens")?;
        let expires = data
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .filter(|rel| *rel > 0)
            .map(|rel| now_ms() + rel * 1000);
        let mut file = self.read()?;
        file.tokens = Some(PersistedTokens { data, expires });
        self.write(&file)
    }

    pub fn redirect_url(&self) -> String {
        self.client_information()
            .and_then(|c| c.redirect_uri)
            .unwrap_or_else(|| DEFAULT_REDIRECT_URL.to_string())
    }

    /// RFC 7591 registration metadata for auto-registering providers.
    pub fn client_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "client_name": "1mcp",
            "redirect_uris": [self.redirect_url()],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "client_secret_post",
        })
    }
}

/// Build an authorized HTTP client for a server that has persisted
/// credentials. Returns None when nothing is stored; the caller falls back
/// to a plain client and flags 401s as awaiting authorization.
pub async fn build_auth_client(
    cp: &dyn ConfigProvider,
    server_name: &str,
    endpoint: &str,
) -> Result<Option<AuthClient<reqwest::Client>>> {
    let provider = OAuthClientProvider::new(cp, server_name);
    let Some(client_info) = provider.client_information() else {
        return Ok(None);
    };
    let Some(token) = provider.tokens() else {
        return Ok(None);
    };

    let url = reqwest::Url::parse(endpoint).context("url parse")?;
    let mut base = url.clone();
    base.set_path("");

    let mut state = OAuthState::new(base.as_str(), None)
        .await
        .context("oauth init")?;
    state
        .set_credentials(&client_info.client_id, token)
        .await
        .context("oauth set")?;
    let mut manager = state
        .into_authorization_manager()
        .ok_or_else(|| anyhow!("oauth state"))?;
    if let Some(secret) = &client_info.client_secret {
        let config = OAuthClientConfig {
            client_id: client_info.client_id.clone(),
            client_secret: Some(secret.clone()),
            scopes: client_info.scopes.clone(),
            redirect_uri: provider.redirect_url(),
        };
        if let Err(err) = manager.configure_client(config) {
            tracing::warn!(
                target = "oauth",
                server = %server_name,
                "failed to restore oauth client secret: {err}"
            );
        }
    }
    Ok(Some(AuthClient::new(reqwest::Client::default(), manager)))
}

/// Heuristic for dial/call failures that actually mean "authorize me".
pub fn looks_unauthorized(err: &(impl std::fmt::Display + ?Sized)) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("401") || text.contains("unauthorized") || text.contains("auth required")
}

fn expires_of(path: &Path) -> Option<i64> {
    let content = fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&content).ok()?;
    value.get("expires").and_then(|v| v.as_i64())
}

/// One pass of the session-store sweep: drop expired session and auth-code
/// artifacts.
pub fn cleanup_expired(cp: &dyn ConfigProvider) -> usize {
    let dir = sessions_dir(cp);
    let Ok(entries) = fs::read_dir(&dir) else {
        return 0;
    };
    let now = now_ms();
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with("session_") || name.starts_with("auth_code_")) {
            continue;
        }
        if let Some(expires) = expires_of(&entry.path()) {
            if expires <= now && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        tracing::debug!(target = "oauth", removed, "expired session artifacts removed");
    }
    removed
}

pub fn spawn_cleanup_sweep(
    cp: std::sync::Arc<dyn ConfigProvider>,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    cleanup_expired(cp.as_ref());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempProvider(tempfile::TempDir);

    impl TempProvider {
        fn new() -> Self {
            Self(tempfile::tempdir().unwrap())
        }
    }

    impl ConfigProvider for TempProvider {
        fn base_dir(&self) -> PathBuf {
            self.0.path().to_path_buf()
        }
    }

    #[test]
    fn sanitization_rules() {
        assert_eq!(sanitize_server_name("my server!"), "my_server");
        assert_eq!(sanitize_server_name("a//b"), "a_b");
        assert_eq!(sanitize_server_name("___"), "default");
        assert_eq!(sanitize_server_name(""), "default");
        assert_eq!(sanitize_server_name("ok-name"), "ok-name");
        let long = "x".repeat(150);
        assert_eq!(sanitize_server_name(&long).len(), 100);
        assert_eq!(sanitize_server_name("../../etc/passwd"), "etc_passwd");
    }

    #[test]
    fn client_information_round_trip() {
        let cp = TempProvider::new();
        let provider = OAuthClientProvider::new(&cp, "srv");
        assert!(provider.client_information().is_none());
        provider
            .save_client_information(ClientInformation {
                client_id: "cid".into(),
                client_secret: Some("secret".into()),
                redirect_uri: None,
                scopes: vec!["mcp".into()],
            })
            .unwrap();
        let loaded = provider.client_information().unwrap();
        assert_eq!(loaded.client_id, "cid");
        assert_eq!(provider.redirect_url(), DEFAULT_REDIRECT_URL);
    }

    #[test]
    fn expired_tokens_read_as_absent_and_are_deleted() {
        let cp = TempProvider::new();
        let provider = OAuthClientProvider::new(&cp, "srv");
        let mut file = ClientFile::default();
        file.tokens = Some(PersistedTokens {
            data: serde_json::json!({"access_token": "tok", "token_type": "Bearer"}),
            expires: Some(now_ms() - 1_000),
        });
        provider.write(&file).unwrap();
        assert!(provider.tokens().is_none());
        // second read still absent (row was cleared)
        assert!(provider.read().unwrap().tokens.is_none());
    }

    #[test]
    fn cleanup_removes_only_expired_prefixed_files() {
        let cp = TempProvider::new();
        let dir = sessions_dir(&cp);
        fs::create_dir_all(&dir).unwrap();
        let stale = dir.join("session_sess-1.json");
        fs::write(&stale, format!(r#"{{"expires": {}}}"#, now_ms() - 10)).unwrap();
        let fresh = dir.join("auth_code_code-2.json");
        fs::write(&fresh, format!(r#"{{"expires": {}}}"#, now_ms() + 60_000)).unwrap();
        let other = dir.join("client_srv.json");
        fs::write(&other, "{}").unwrap();

        assert_eq!(cleanup_expired(&cp), 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }

    #[test]
    fn unauthorized_heuristic() {
        assert!(looks_unauthorized("HTTP status 401 Unauthorized"));
        assert!(!looks_unauthorized("connection refused"));
    }
}
