//! Host settings

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Presentation settings for the interactive console, optionally overridden
/// by a JSON file next to the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub prompt: String,
    pub continuation_prompt: String,
    pub banner: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prompt: "> ".to_string(),
            continuation_prompt: ">> ".to_string(),
            banner: true,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(path = %path.display(), %err, "malformed settings file, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.prompt, "> ");
        assert_eq!(settings.continuation_prompt, ">> ");
        assert!(settings.banner);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"prompt": "$ "}"#).unwrap();
        assert_eq!(settings.prompt, "$ ");
        assert_eq!(settings.continuation_prompt, ">> ");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load(Path::new("definitely/not/here.json"));
        assert_eq!(settings.prompt, "> ");
    }
}
