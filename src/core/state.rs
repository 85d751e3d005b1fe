use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;

/// Pipeline variant. Decides the default persona and which kind of visual
/// element the backend returns.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Image,
    Video,
    Wechat,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Image, Mode::Video, Mode::Wechat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Image => "image",
            Mode::Video => "video",
            Mode::Wechat => "wechat",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(Mode::Image),
            "video" => Ok(Mode::Video),
            "wechat" => Ok(Mode::Wechat),
            other => Err(anyhow!("Unknown mode: {}", other)),
        }
    }
}

/// Ordered pipeline stages. Data owned by a stage depends on every stage
/// before it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Topic,
    Persona,
    Preview,
    Studio,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Topic {
    pub title: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub outline: Vec<String>,
    #[serde(default)]
    pub why_hot: String,
}

impl Topic {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Category name that switches the persona to free text.
pub const CUSTOM_CATEGORY: &str = "custom";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PersonaChoice {
    #[default]
    Unset,
    Named(String),
    Custom(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PersonaSelection {
    pub category: String,
    pub persona: PersonaChoice,
}

impl PersonaSelection {
    pub fn named(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            persona: PersonaChoice::Named(name.into()),
        }
    }

    pub fn persona_name(&self) -> Option<&str> {
        match &self.persona {
            PersonaChoice::Named(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_custom(&self) -> bool {
        self.category == CUSTOM_CATEGORY
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ImageDesign {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub sentiment: String,
    /// Overlay text, only present on the cover image.
    #[serde(default)]
    pub cover_text: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VideoScene {
    #[serde(default)]
    pub scene_index: usize,
    #[serde(default)]
    pub narration: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sentiment: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiagramType {
    #[default]
    Architecture,
    Flow,
    Comparison,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Diagram {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub diagram_type: DiagramType,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VisualElement {
    ImageDesign(ImageDesign),
    VideoScene(VideoScene),
    Diagram(Diagram),
}

impl VisualElement {
    pub fn prompt(&self) -> &str {
        match self {
            VisualElement::ImageDesign(d) => &d.prompt,
            VisualElement::VideoScene(s) => &s.prompt,
            VisualElement::Diagram(d) => &d.prompt,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            VisualElement::ImageDesign(d) => &d.description,
            VisualElement::VideoScene(s) => &s.description,
            VisualElement::Diagram(d) => &d.description,
        }
    }

    pub fn sentiment(&self) -> Option<&str> {
        match self {
            VisualElement::ImageDesign(d) => Some(&d.sentiment),
            VisualElement::VideoScene(s) => Some(&s.sentiment),
            VisualElement::Diagram(_) => None,
        }
    }

    /// Text spoken over this element. Only video scenes carry narration;
    /// other kinds fall back to their description.
    pub fn narration(&self) -> &str {
        match self {
            VisualElement::VideoScene(s) if !s.narration.is_empty() => &s.narration,
            other => other.description(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct GeneratedContent {
    pub titles: Vec<String>,
    pub content: String,
    pub visual_elements: Vec<VisualElement>,
}

impl GeneratedContent {
    /// A result the backend returned without rejecting can still be unusable.
    pub fn is_valid(&self) -> bool {
        self.titles.iter().any(|t| !t.trim().is_empty()) && !self.content.trim().is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Image => f.write_str("image"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MediaResult {
    pub index: usize,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl MediaResult {
    pub fn empty(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.url.is_none() && self.error.is_none()
    }

    pub fn is_success(&self) -> bool {
        self.path.is_some()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VideoArtifact {
    pub video_path: String,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub srt_path: Option<String>,
    #[serde(default)]
    pub srt_url: Option<String>,
    #[serde(default)]
    pub duration: f64,
}

/// Which of the two comparison lanes a result came from.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Primary,
    Secondary,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DualResult {
    pub primary_model: String,
    pub primary: GeneratedContent,
    pub secondary_model: String,
    pub secondary: GeneratedContent,
}

impl DualResult {
    pub fn take(self, lane: Lane) -> GeneratedContent {
        match lane {
            Lane::Primary => self.primary,
            Lane::Secondary => self.secondary,
        }
    }
}

/// In-flight flags, one per operation kind.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Activity {
    pub analyzing: bool,
    pub generating: bool,
    pub rendering_images: bool,
    pub rendering_audio: bool,
    pub composing_video: bool,
}

impl Activity {
    pub fn is_idle(&self) -> bool {
        *self == Activity::default()
    }
}

/// Immutable snapshot of the whole pipeline. Listeners receive one per
/// store mutation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkflowState {
    /// Bumped by every committed change. Listeners on several threads can
    /// see deliveries interleave; the higher revision is the newer state.
    #[serde(default)]
    pub revision: u64,
    pub mode: Mode,
    pub stage: Stage,
    pub keyword: String,
    pub topics: Vec<Topic>,
    pub topic_source: Option<String>,
    pub selected_topic: Option<Topic>,
    pub persona: PersonaSelection,
    pub reference_url: Option<String>,
    pub model_id: String,
    pub comparison_model: Option<String>,
    pub temperature: f32,
    pub generated_content: Option<GeneratedContent>,
    pub dual_result: Option<DualResult>,
    pub image_results: Vec<MediaResult>,
    pub audio_results: Vec<MediaResult>,
    pub video: Option<VideoArtifact>,
    pub activity: Activity,
}

impl WorkflowState {
    pub fn media(&self, kind: MediaKind) -> &[MediaResult] {
        match kind {
            MediaKind::Image => &self.image_results,
            MediaKind::Audio => &self.audio_results,
        }
    }

    pub(crate) fn media_mut(&mut self, kind: MediaKind) -> &mut Vec<MediaResult> {
        match kind {
            MediaKind::Image => &mut self.image_results,
            MediaKind::Audio => &mut self.audio_results,
        }
    }

    /// Everything that depends on the generated content.
    pub(crate) fn clear_studio(&mut self) {
        self.image_results.clear();
        self.audio_results.clear();
        self.video = None;
    }

    /// Everything that depends on the selected topic.
    pub(crate) fn clear_downstream_of_topic(&mut self) {
        self.generated_content = None;
        self.dual_result = None;
        self.clear_studio();
    }

    pub(crate) fn replace_content(&mut self, content: Option<GeneratedContent>) {
        self.clear_studio();
        if let Some(content) = &content {
            let n = content.visual_elements.len();
            self.image_results = (0..n).map(MediaResult::empty).collect();
            self.audio_results = (0..n).map(MediaResult::empty).collect();
        }
        self.generated_content = content;
    }

    /// Furthest stage whose prerequisites are present.
    pub fn reachable_stage(&self) -> Stage {
        if self.generated_content.is_some() {
            Stage::Studio
        } else if self.dual_result.is_some() {
            Stage::Preview
        } else if self.selected_topic.is_some() {
            Stage::Persona
        } else {
            Stage::Topic
        }
    }
}

/// The subset of state that survives across sessions. Loading flags,
/// generated content and media results are deliberately absent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PersistedState {
    pub mode: Mode,
    pub model_id: String,
    pub temperature: f32,
    pub persona_category: String,
    #[serde(default)]
    pub persona_name: Option<String>,
    /// Free-text persona, set when the category is `custom`.
    #[serde(default)]
    pub custom_persona: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(narration: &str, description: &str) -> VisualElement {
        VisualElement::VideoScene(VideoScene {
            narration: narration.to_string(),
            description: description.to_string(),
            prompt: "p".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("wechat".parse::<Mode>().unwrap(), Mode::Wechat);
        assert_eq!(" Video ".parse::<Mode>().unwrap(), Mode::Video);
        assert!("podcast".parse::<Mode>().is_err());
        assert_eq!(serde_json::to_string(&Mode::Image).unwrap(), "\"image\"");
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::Topic < Stage::Persona);
        assert!(Stage::Persona < Stage::Preview);
        assert!(Stage::Preview < Stage::Studio);
    }

    #[test]
    fn test_generated_content_validity() {
        let mut content = GeneratedContent {
            titles: vec!["标题".to_string()],
            content: "正文".to_string(),
            visual_elements: vec![],
        };
        assert!(content.is_valid());

        content.titles = vec!["  ".to_string()];
        assert!(!content.is_valid());

        content.titles = vec!["标题".to_string()];
        content.content = "\n".to_string();
        assert!(!content.is_valid());
    }

    #[test]
    fn test_narration_falls_back_to_description() {
        assert_eq!(scene("旁白", "画面").narration(), "旁白");
        assert_eq!(scene("", "画面").narration(), "画面");

        let diagram = VisualElement::Diagram(Diagram {
            description: "架构图".to_string(),
            ..Default::default()
        });
        assert_eq!(diagram.narration(), "架构图");
        assert_eq!(diagram.sentiment(), None);
    }

    #[test]
    fn test_persona_choice_serialization() {
        let selection = PersonaSelection::named("硬核技术/AI", "全栈AI架构师");
        let json = serde_json::to_string(&selection).unwrap();
        assert!(json.contains("\"kind\":\"named\""));

        let back: PersonaSelection = serde_json::from_str(&json).unwrap();
        assert_eq!(back.persona_name(), Some("全栈AI架构师"));
        assert!(!back.is_custom());
    }
}
