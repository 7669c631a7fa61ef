//! User preferences persisted as a small JSON file

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Vi,
    En,
}

impl Language {
    pub fn toggled(self) -> Self {
        match self {
            Language::Vi => Language::En,
            Language::En => Language::Vi,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Language::Vi => "vi",
            Language::En => "en",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub language: Language,
    pub theme: Theme,
    /// Client id handed out by the real-time server, reused on reconnect
    pub client_id: Option<String>,
}

impl Preferences {
    /// Read preferences from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no preferences file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write preferences to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Shared in-memory preferences, written through to disk when a path is set
#[derive(Debug, Clone, Default)]
pub struct PreferenceStore {
    path: Option<PathBuf>,
    current: Arc<Mutex<Preferences>>,
}

impl PreferenceStore {
    /// Load from `path` if given. A corrupt file is logged and replaced by defaults.
    pub fn open(path: Option<PathBuf>) -> Self {
        let current = match path.as_deref().map(Preferences::load) {
            Some(Ok(prefs)) => prefs,
            Some(Err(e)) => {
                warn!(error = %e, "could not read preferences, using defaults");
                Preferences::default()
            }
            None => Preferences::default(),
        };
        Self {
            path,
            current: Arc::new(Mutex::new(current)),
        }
    }

    pub fn get(&self) -> Preferences {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `change` and persist; a failed write is logged and the in-memory value kept
    pub fn update(&self, change: impl FnOnce(&mut Preferences)) -> Preferences {
        let updated = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            change(&mut current);
            current.clone()
        };
        if let Some(path) = &self.path {
            if let Err(e) = updated.save(path) {
                warn!(path = %path.display(), error = %e, "could not save preferences");
            }
        }
        updated
    }
}
