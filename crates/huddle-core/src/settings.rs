use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::errors::HuddleError;

/// STUN/TURN server, in the browser's `RTCIceServer` shape.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub signaling_url: Option<String>,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun("stun:stun.l.google.com:19302")]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            signaling_url: None,
            ice_servers: default_ice_servers(),
        }
    }
}

/// Settings persisted as `settings.json` in a data directory.
pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) -> Result<(), HuddleError> {
        self.lock().display_name = name;
        self.save()
    }

    pub fn set_signaling_url(&self, url: Option<String>) -> Result<(), HuddleError> {
        self.lock().signaling_url = url;
        self.save()
    }

    pub fn set_ice_servers(&self, servers: Vec<IceServer>) -> Result<(), HuddleError> {
        self.lock().ice_servers = servers;
        self.save()
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self) -> Result<(), HuddleError> {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HuddleError::Settings(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&settings)
            .map_err(|e| HuddleError::Settings(e.to_string()))?;
        std::fs::write(&self.file_path, json).map_err(|e| {
            tracing::warn!(path = %self.file_path.display(), "cannot write settings: {e}");
            HuddleError::Settings(e.to_string())
        })
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "ignoring unreadable settings: {e}");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}
