use crate::core::io::Storage;
use crate::core::state::{PersonaChoice, PersonaSelection, CUSTOM_CATEGORY};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonaItem {
    pub name: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonaCategory {
    pub category: String,
    #[serde(default)]
    pub personas: Vec<PersonaItem>,
}

/// Writing personas grouped by category, in display order.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PersonaLibrary {
    pub categories: Vec<PersonaCategory>,
}

impl PersonaLibrary {
    pub async fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let content = storage.read_to_string(path).await?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse persona library {}", path))
    }

    pub fn category_names(&self) -> Vec<&str> {
        self.categories.iter().map(|c| c.category.as_str()).collect()
    }

    pub fn personas(&self, category: &str) -> &[PersonaItem] {
        self.categories
            .iter()
            .find(|c| c.category == category)
            .map(|c| c.personas.as_slice())
            .unwrap_or(&[])
    }

    pub fn find(&self, category: &str, name: &str) -> Option<&PersonaItem> {
        self.personas(category).iter().find(|p| p.name == name)
    }

    /// Prompt text sent to the generator for `selection`. A named persona
    /// missing from the library falls back to its bare name.
    pub fn resolve_prompt(&self, selection: &PersonaSelection) -> Result<String> {
        match &selection.persona {
            PersonaChoice::Custom(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            PersonaChoice::Custom(_) => bail!("Custom persona text is empty"),
            PersonaChoice::Named(name) if selection.category != CUSTOM_CATEGORY => Ok(self
                .find(&selection.category, name)
                .map(|p| p.prompt.clone())
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| name.clone())),
            _ => bail!("No persona selected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;

    fn library() -> PersonaLibrary {
        serde_json::from_str(
            r#"{"categories": [
                {"category": "硬核技术/AI", "personas": [
                    {"name": "全栈AI架构师", "prompt": "你是一位全栈AI架构师"},
                    {"name": "极客", "prompt": ""}
                ]},
                {"category": "生活方式", "personas": [{"name": "治愈系姐姐", "prompt": "温柔"}]}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_preserves_order() {
        let lib = library();
        assert_eq!(lib.category_names(), vec!["硬核技术/AI", "生活方式"]);
        assert_eq!(lib.personas("硬核技术/AI").len(), 2);
        assert!(lib.personas("不存在").is_empty());
    }

    #[test]
    fn test_resolve_prompt() {
        let lib = library();

        let named = PersonaSelection::named("硬核技术/AI", "全栈AI架构师");
        assert_eq!(lib.resolve_prompt(&named).unwrap(), "你是一位全栈AI架构师");

        let blank_prompt = PersonaSelection::named("硬核技术/AI", "极客");
        assert_eq!(lib.resolve_prompt(&blank_prompt).unwrap(), "极客");

        let custom = PersonaSelection {
            category: CUSTOM_CATEGORY.to_string(),
            persona: PersonaChoice::Custom(" 毒舌闺蜜 ".to_string()),
        };
        assert_eq!(lib.resolve_prompt(&custom).unwrap(), "毒舌闺蜜");

        let unset = PersonaSelection {
            category: "生活方式".to_string(),
            persona: PersonaChoice::Unset,
        };
        assert!(lib.resolve_prompt(&unset).is_err());

        let empty_custom = PersonaSelection {
            category: CUSTOM_CATEGORY.to_string(),
            persona: PersonaChoice::Custom("  ".to_string()),
        };
        assert!(lib.resolve_prompt(&empty_custom).is_err());
    }

    #[tokio::test]
    async fn test_load_from_storage() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("personas.json");
        std::fs::write(&path, serde_json::to_string(&library())?)?;

        let loaded = PersonaLibrary::load(&NativeStorage::new(), &path.to_string_lossy()).await?;
        assert_eq!(loaded, library());
        Ok(())
    }
}
