use crate::core::io::Storage;
use crate::core::state::{Mode, WorkflowState};
use crate::utils::text::sanitize_filename;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::info;
use std::path::Path;

const MAX_NAME_CHARS: usize = 50;

/// A finished piece of content, ready to be written as Markdown.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub topic: String,
    pub title: String,
    pub content: String,
    pub image_urls: Vec<Option<String>>,
    pub tags: Vec<String>,
}

fn default_tags(mode: Mode) -> Vec<String> {
    let platform = match mode {
        Mode::Image => "小红书",
        Mode::Video => "短视频",
        Mode::Wechat => "公众号",
    };
    vec![platform.to_string(), "自动生成".to_string()]
}

impl Note {
    /// Builds a note from the current workflow. Needs a selected topic and
    /// generated content; images without a URL fall back to their local path.
    pub fn from_state(state: &WorkflowState) -> Result<Self> {
        let topic = state
            .selected_topic
            .as_ref()
            .ok_or_else(|| anyhow!("No topic selected"))?;
        let content = state
            .generated_content
            .as_ref()
            .ok_or_else(|| anyhow!("Nothing to export yet"))?;

        Ok(Self {
            topic: topic.title.clone(),
            title: content.titles.first().cloned().unwrap_or_else(|| topic.title.clone()),
            content: content.content.clone(),
            image_urls: state
                .image_results
                .iter()
                .map(|r| r.url.clone().or_else(|| r.path.clone()))
                .collect(),
            tags: default_tags(state.mode),
        })
    }

    pub fn to_markdown(&self, created: &str) -> String {
        let mut lines = vec![
            "---".to_string(),
            format!("title: {}", self.title),
            format!("topic: {}", self.topic),
            format!("created: {}", created),
            format!("tags: [{}]", self.tags.join(", ")),
            "---".to_string(),
            String::new(),
            format!("# {}", self.title),
            String::new(),
            // Models sometimes return escaped newlines.
            self.content.replace("\\n", "\n"),
            String::new(),
        ];

        if self.image_urls.iter().any(Option::is_some) {
            lines.extend(["---".to_string(), String::new(), "## 配图".to_string(), String::new()]);
            for (i, url) in self.image_urls.iter().enumerate() {
                if let Some(url) = url {
                    lines.push(format!("### 图片 {}", i + 1));
                    lines.push(format!("![{}_image_{}]({})", self.topic, i + 1, url));
                    lines.push(String::new());
                }
            }
        }

        lines.join("\n")
    }
}

const CREATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Writes `note` into `folder` and returns the path written. The file name
/// comes from the topic and the time; an existing file is never replaced.
pub async fn export_note(
    storage: &dyn Storage,
    folder: &str,
    note: &Note,
    at: DateTime<Utc>,
) -> Result<String> {
    let created = at.format(CREATED_FORMAT).to_string();
    let stamp = at.format(STAMP_FORMAT).to_string();
    let stem = format!("{}_{}", sanitize_filename(&note.topic, MAX_NAME_CHARS), stamp);

    let mut path = Path::new(folder).join(format!("{}.md", stem));
    let mut attempt = 1;
    while storage.exists(&path.to_string_lossy()).await? {
        attempt += 1;
        path = Path::new(folder).join(format!("{}_{}.md", stem, attempt));
    }

    let path = path.to_string_lossy().to_string();
    storage.write(&path, note.to_markdown(&created).as_bytes()).await?;
    info!("Exported note to {}", path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::state::{GeneratedContent, MediaResult, Topic};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn note() -> Note {
        Note {
            topic: "AI 工具/推荐".to_string(),
            title: "5 个神器".to_string(),
            content: "第一段\\n第二段".to_string(),
            image_urls: vec![Some("https://cdn/1.png".to_string()), None],
            tags: default_tags(Mode::Image),
        }
    }

    #[test]
    fn test_timestamp_formats() {
        let t = at(1_700_000_000);
        assert_eq!(t.format(CREATED_FORMAT).to_string(), "2023-11-14T22:13:20");
        assert_eq!(t.format(STAMP_FORMAT).to_string(), "20231114_221320");
        assert_eq!(at(0).format(CREATED_FORMAT).to_string(), "1970-01-01T00:00:00");
    }

    #[test]
    fn test_markdown_layout() {
        let md = note().to_markdown("2024-01-01T00:00:00");
        assert!(md.starts_with("---\ntitle: 5 个神器\ntopic: AI 工具/推荐\ncreated: 2024-01-01T00:00:00\ntags: [小红书, 自动生成]\n---\n"));
        assert!(md.contains("# 5 个神器\n\n第一段\n第二段\n"));
        assert!(md.contains("### 图片 1\n![AI 工具/推荐_image_1](https://cdn/1.png)"));
        assert!(!md.contains("图片 2"));
    }

    #[test]
    fn test_markdown_without_images_has_no_gallery() {
        let mut note = note();
        note.image_urls = vec![None, None];
        assert!(!note.to_markdown("now").contains("## 配图"));
    }

    #[test]
    fn test_note_from_state() {
        let mut state: WorkflowState = serde_json::from_value(serde_json::json!({
            "mode": "wechat", "stage": "preview", "keyword": "", "topics": [],
            "topic_source": null, "selected_topic": null,
            "persona": {"category": "", "persona": {"kind": "unset"}},
            "reference_url": null, "model_id": "m", "comparison_model": null,
            "temperature": 0.8, "generated_content": null, "dual_result": null,
            "image_results": [], "audio_results": [], "video": null,
            "activity": {"analyzing": false, "generating": false, "rendering_images": false,
                         "rendering_audio": false, "composing_video": false}
        }))
        .unwrap();
        assert!(Note::from_state(&state).is_err());

        state.selected_topic = Some(Topic::new("大模型架构"));
        state.generated_content = Some(GeneratedContent {
            titles: vec!["深入浅出".to_string()],
            content: "正文".to_string(),
            visual_elements: vec![],
        });
        state.image_results = vec![MediaResult {
            index: 0,
            path: Some("/out/0.png".to_string()),
            ..Default::default()
        }];

        let note = Note::from_state(&state).unwrap();
        assert_eq!(note.title, "深入浅出");
        assert_eq!(note.image_urls, vec![Some("/out/0.png".to_string())]);
        assert_eq!(note.tags[0], "公众号");
    }

    #[tokio::test]
    async fn test_export_never_overwrites() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let folder = temp_dir.path().to_string_lossy().to_string();
        let storage = NativeStorage::new();
        let created = at(1_700_000_000);

        let first = export_note(&storage, &folder, &note(), created).await?;
        let second = export_note(&storage, &folder, &note(), created).await?;

        assert!(first.ends_with("AI_工具_推荐_20231114_221320.md"));
        assert!(second.ends_with("AI_工具_推荐_20231114_221320_2.md"));
        let written = storage.read_to_string(&first).await?;
        assert!(written.contains("created: 2023-11-14T22:13:20"));
        Ok(())
    }
}
