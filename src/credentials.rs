use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variables consulted when no key has been selected, in order
pub const API_KEY_ENV_VARS: [&str; 3] = ["GEMINI_API_KEY", "GOOGLE_AI_KEY", "GOOGLE_API_KEY"];

pub const BILLING_URL: &str = "https://ai.google.dev/gemini-api/docs/billing";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Cannot determine the user config directory")]
    NoConfigDir,

    #[error("No API key entered")]
    EmptyKey,

    #[error("Key selection needs an interactive terminal")]
    SelectionUnavailable,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Credentials file is corrupt: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CredentialError>;

/// Source of the API key the studio runs with.
///
/// `has_selected_key` reports readiness, `select_key` runs the selection
/// flow and `api_key` returns whatever key is currently usable.
pub trait KeySelector {
    fn has_selected_key(&self) -> Result<bool>;
    fn select_key(&mut self) -> Result<()>;
    fn api_key(&self) -> Result<Option<String>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
}

/// Selected key persisted as JSON, with environment fallback
#[derive(Debug, Clone)]
pub struct ApiKeyStore {
    path: PathBuf,
    env_fallback: bool,
}

impl ApiKeyStore {
    /// `<config dir>/animate-studio/credentials.json`
    pub fn open_default() -> Result<Self> {
        let dir = dirs::config_dir().ok_or(CredentialError::NoConfigDir)?;
        Ok(Self::with_path(
            dir.join("animate-studio").join("credentials.json"),
        ))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env_fallback: true,
        }
    }

    /// Ignore environment variables; only the stored key counts
    pub fn without_env(mut self) -> Self {
        self.env_fallback = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoredCredentials> {
        if !self.path.exists() {
            return Ok(StoredCredentials::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, creds: &StoredCredentials) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(creds)?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;

        // mode() only applies on create; an existing file keeps its bits
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(content.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Stored key only
    pub fn get(&self) -> Result<Option<String>> {
        Ok(self.load()?.api_key.filter(|k| !k.is_empty()))
    }

    pub fn set(&self, key: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(CredentialError::EmptyKey);
        }
        self.save(&StoredCredentials {
            api_key: Some(key.to_string()),
        })?;
        info!("API key stored in {}", self.path.display());
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            debug!("Removed {}", self.path.display());
        }
        Ok(())
    }

    /// Stored key first, then the environment
    pub fn resolve(&self) -> Result<Option<String>> {
        if let Some(key) = self.get()? {
            return Ok(Some(key));
        }
        if !self.env_fallback {
            return Ok(None);
        }
        Ok(API_KEY_ENV_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|key| !key.trim().is_empty()))
    }
}

/// Non-interactive selector: ready when a key is stored or exported
impl KeySelector for ApiKeyStore {
    fn has_selected_key(&self) -> Result<bool> {
        Ok(self.resolve()?.is_some())
    }

    fn select_key(&mut self) -> Result<()> {
        Err(CredentialError::SelectionUnavailable)
    }

    fn api_key(&self) -> Result<Option<String>> {
        self.resolve()
    }
}

/// Interactive selection: asks for a key on `output`, reads it from `input`
pub struct PromptSelector<R, W> {
    store: ApiKeyStore,
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptSelector<R, W> {
    pub fn new(store: ApiKeyStore, input: R, output: W) -> Self {
        Self {
            store,
            input,
            output,
        }
    }

    pub fn store(&self) -> &ApiKeyStore {
        &self.store
    }
}

impl<R: BufRead, W: Write> KeySelector for PromptSelector<R, W> {
    fn has_selected_key(&self) -> Result<bool> {
        self.store.has_selected_key()
    }

    fn select_key(&mut self) -> Result<()> {
        writeln!(
            self.output,
            "Veo needs an API key from a paid Google Cloud project."
        )?;
        writeln!(self.output, "Learn more about billing: {}", BILLING_URL)?;
        write!(self.output, "API key: ")?;
        self.output.flush()?;

        let mut line = String::new();
        self.input.read_line(&mut line)?;
        self.store.set(&line)
    }

    fn api_key(&self) -> Result<Option<String>> {
        self.store.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn temp_store() -> (ApiKeyStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ApiKeyStore::with_path(dir.path().join("conf/credentials.json")).without_env();
        (store, dir)
    }

    #[test]
    fn test_get_returns_none_when_no_file() {
        let (store, _dir) = temp_store();
        assert!(store.get().unwrap().is_none());
        assert!(store.resolve().unwrap().is_none());
    }

    #[test]
    fn test_set_get_remove() {
        let (store, _dir) = temp_store();
        store.set("  AIza-test \n").unwrap();
        assert_eq!(store.get().unwrap().as_deref(), Some("AIza-test"));

        store.remove().unwrap();
        assert!(store.get().unwrap().is_none());
        // removing twice is fine
        store.remove().unwrap();
    }

    #[test]
    fn test_set_rejects_empty_key() {
        let (store, _dir) = temp_store();
        assert!(matches!(store.set("   "), Err(CredentialError::EmptyKey)));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let (store, _dir) = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.get(), Err(CredentialError::JsonError(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_stored_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let (store, _dir) = temp_store();
        store.set("secret").unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_readable_file_is_tightened_before_write() {
        use std::os::unix::fs::PermissionsExt;
        let (store, _dir) = temp_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{}").unwrap();
        std::fs::set_permissions(store.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        store.set("secret").unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(store.get().unwrap().as_deref(), Some("secret"));
    }

    #[test]
    fn test_store_cannot_select_interactively() {
        let (mut store, _dir) = temp_store();
        assert!(!store.has_selected_key().unwrap());
        assert!(matches!(
            store.select_key(),
            Err(CredentialError::SelectionUnavailable)
        ));

        store.set("AIza-stored").unwrap();
        assert!(store.has_selected_key().unwrap());
        assert_eq!(store.api_key().unwrap().as_deref(), Some("AIza-stored"));
    }

    #[test]
    fn test_prompt_selector_stores_key() {
        let (store, _dir) = temp_store();
        let mut output = Vec::new();
        let mut selector = PromptSelector::new(store, Cursor::new("AIza-from-prompt\n"), &mut output);

        assert!(!selector.has_selected_key().unwrap());
        selector.select_key().unwrap();
        assert!(selector.has_selected_key().unwrap());
        assert_eq!(
            selector.api_key().unwrap().as_deref(),
            Some("AIza-from-prompt")
        );
        drop(selector);

        let shown = String::from_utf8(output).unwrap();
        assert!(shown.contains(BILLING_URL));
        assert!(shown.ends_with("API key: "));
    }

    #[test]
    fn test_prompt_selector_empty_input_fails() {
        let (store, _dir) = temp_store();
        let mut selector = PromptSelector::new(store, Cursor::new(""), Vec::new());
        assert!(matches!(
            selector.select_key(),
            Err(CredentialError::EmptyKey)
        ));
        assert!(!selector.has_selected_key().unwrap());
    }
}
