use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::state::{Mode, PersonaSelection};

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_state_folder")]
    pub state_folder: String,

    #[serde(default = "default_export_folder")]
    pub export_folder: String,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_folder: default_state_folder(),
            export_folder: default_export_folder(),
            api: ApiConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_seconds: default_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub default_mode: Mode,
    #[serde(default = "default_model")]
    pub model: String,
    /// Second model for side-by-side generation. Comparison mode is on
    /// whenever this is set.
    #[serde(default)]
    pub comparison_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_image_provider")]
    pub image_provider: String,
    #[serde(default = "default_tts_provider")]
    pub tts_provider: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_bgm_volume")]
    pub bgm_volume: f32,
    #[serde(default)]
    pub mode_defaults: ModeDefaults,
    /// Persona library JSON used when the backend can't serve one.
    #[serde(default)]
    pub persona_file: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_mode: Mode::default(),
            model: default_model(),
            comparison_model: None,
            temperature: default_temperature(),
            image_provider: default_image_provider(),
            tts_provider: default_tts_provider(),
            voice: None,
            bgm_volume: default_bgm_volume(),
            mode_defaults: ModeDefaults::default(),
            persona_file: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PersonaDefault {
    pub category: String,
    pub persona: String,
}

impl PersonaDefault {
    fn new(category: &str, persona: &str) -> Self {
        Self {
            category: category.to_string(),
            persona: persona.to_string(),
        }
    }
}

/// Persona every mode starts from. Switching mode always lands here,
/// whatever was selected before.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModeDefaults {
    #[serde(default = "default_image_persona")]
    pub image: PersonaDefault,
    #[serde(default = "default_video_persona")]
    pub video: PersonaDefault,
    #[serde(default = "default_wechat_persona")]
    pub wechat: PersonaDefault,
}

impl Default for ModeDefaults {
    fn default() -> Self {
        Self {
            image: default_image_persona(),
            video: default_video_persona(),
            wechat: default_wechat_persona(),
        }
    }
}

impl ModeDefaults {
    pub fn for_mode(&self, mode: Mode) -> PersonaSelection {
        let entry = match mode {
            Mode::Image => &self.image,
            Mode::Video => &self.video,
            Mode::Wechat => &self.wechat,
        };
        PersonaSelection::named(entry.category.clone(), entry.persona.clone())
    }
}

fn default_state_folder() -> String {
    "state".to_string()
}
fn default_export_folder() -> String {
    "output".to_string()
}
fn default_base_url() -> String {
    "http://127.0.0.1:8501".to_string()
}
fn default_timeout() -> u64 {
    300
}
fn default_model() -> String {
    "deepseek/deepseek-chat".to_string()
}
fn default_temperature() -> f32 {
    0.8
}
fn default_image_provider() -> String {
    "replicate".to_string()
}
fn default_tts_provider() -> String {
    "edge".to_string()
}
fn default_bgm_volume() -> f32 {
    0.12
}
fn default_image_persona() -> PersonaDefault {
    PersonaDefault::new("生活方式", "治愈系姐姐")
}
fn default_video_persona() -> PersonaDefault {
    PersonaDefault::new("剧情口播", "毒舌闺蜜")
}
fn default_wechat_persona() -> PersonaDefault {
    PersonaDefault::new("硬核技术/AI", "全栈AI架构师")
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.state_folder)?;
        fs::create_dir_all(&self.export_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_yaml("api:\n  base_url: http://localhost:9000\n").unwrap();

        assert_eq!(config.api.base_url, "http://localhost:9000");
        assert_eq!(config.api.timeout_seconds, 300);
        assert_eq!(config.workflow.model, "deepseek/deepseek-chat");
        assert_eq!(config.workflow.default_mode, Mode::Image);
        assert!(config.workflow.comparison_model.is_none());
        assert!(config.workflow.persona_file.is_none());
        assert_eq!(config.state_folder, "state");
    }

    #[test]
    fn test_mode_defaults_override() {
        let yaml = r#"
workflow:
  default_mode: video
  comparison_model: anthropic/claude-3.5-sonnet
  persona_file: state/personas.json
  mode_defaults:
    video:
      category: 知识科普
      persona: 冷知识博主
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let defaults = &config.workflow.mode_defaults;

        assert_eq!(config.workflow.default_mode, Mode::Video);
        assert_eq!(config.workflow.persona_file.as_deref(), Some("state/personas.json"));
        assert_eq!(
            config.workflow.comparison_model.as_deref(),
            Some("anthropic/claude-3.5-sonnet")
        );
        assert_eq!(
            defaults.for_mode(Mode::Video),
            PersonaSelection::named("知识科普", "冷知识博主")
        );
        assert_eq!(
            defaults.for_mode(Mode::Wechat),
            PersonaSelection::named("硬核技术/AI", "全栈AI架构师")
        );
    }

    #[test]
    fn test_save_and_load_round_trip() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("config.yml");

        let mut config = Config::default();
        config.workflow.temperature = 0.3;
        config.save(&path)?;

        let loaded = Config::load(&path)?;
        assert!((loaded.workflow.temperature - 0.3).abs() < f32::EPSILON);
        assert_eq!(loaded.workflow.mode_defaults, ModeDefaults::default());
        Ok(())
    }

    #[test]
    fn test_missing_config_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let err = Config::load(temp_dir.path().join("config.yml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
