use anyhow::Result;
use chrono::Utc;
use content_workflow::core::clock::TokioClock;
use content_workflow::core::config::{Config, DEFAULT_CONFIG_PATH};
use content_workflow::core::io::NativeStorage;
use content_workflow::core::state::{Lane, MediaKind, Mode, Stage, Topic, CUSTOM_CATEGORY};
use content_workflow::services::api::HttpContentApi;
use content_workflow::services::export::{export_note, Note};
use content_workflow::services::workflow::WorkflowStore;
use content_workflow::ui::{self, StepBar};
use content_workflow::utils::text::preview;
use indicatif::MultiProgress;
use log::warn;
use std::path::Path;
use std::sync::Arc;

enum Flow {
    Continue,
    Quit,
}

struct App {
    config: Config,
    store: WorkflowStore,
    storage: NativeStorage,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    if !Path::new(DEFAULT_CONFIG_PATH).exists() {
        Config::default().save(DEFAULT_CONFIG_PATH)?;
        println!("Created default {}", DEFAULT_CONFIG_PATH);
    }
    let config = match Config::load(DEFAULT_CONFIG_PATH) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let api = Arc::new(HttpContentApi::new(&config.api)?);
    let store = WorkflowStore::new(config.workflow.clone(), api, Arc::new(TokioClock));
    let app = App {
        config,
        store,
        storage: NativeStorage::new(),
    };

    if let Err(e) = app.store.load_session(&app.storage, &app.config.state_folder).await {
        warn!("Ignoring saved session: {:#}", e);
    }
    if let Err(e) = app.store.load_personas(&app.storage).await {
        warn!("Persona library unavailable, only custom personas can be used: {:#}", e);
    }

    loop {
        let flow = match app.store.snapshot().stage {
            Stage::Topic => app.topic_stage().await?,
            Stage::Persona => app.persona_stage().await?,
            Stage::Preview => app.preview_stage().await?,
            Stage::Studio => app.studio_stage().await?,
        };
        if let Flow::Quit = flow {
            break;
        }
    }

    app.store
        .save_session(&app.storage, &app.config.state_folder)
        .await?;
    Ok(())
}

impl App {
    async fn topic_stage(&self) -> Result<Flow> {
        let state = self.store.snapshot();
        let modes: Vec<String> = Mode::ALL.iter().map(|m| m.to_string()).collect();
        let mode = Mode::ALL[ui::select(&format!("内容模式 (当前 {}):", state.mode), modes)?];
        if mode != state.mode {
            self.store.set_mode(mode);
        }

        let keyword = ui::text("搜索关键词 (留空直接输入选题, 输入 q 退出):", None)?;
        if keyword == "q" {
            return Ok(Flow::Quit);
        }
        if keyword.is_empty() {
            let title = ui::text("选题:", None)?;
            if !title.is_empty() {
                self.store.select_topic(Topic::new(title));
            }
            return Ok(Flow::Continue);
        }

        let bar = StepBar::new("选题");
        let result = self.store.analyze_topics(&keyword, bar.observer()).await;
        bar.finish(result.is_ok());
        let topics = match result {
            Ok(topics) => topics,
            Err(e) => {
                println!("搜索失败: {:#}", e);
                return Ok(Flow::Continue);
            }
        };

        let mut options: Vec<String> = topics
            .iter()
            .map(|t| format!("{}  {}", t.title, preview(&t.why_hot, 30)))
            .collect();
        options.push("重新搜索".to_string());
        let choice = ui::select("选择选题:", options)?;
        if choice < topics.len() {
            self.store.select_topic_at(choice);
        }
        Ok(Flow::Continue)
    }

    async fn persona_stage(&self) -> Result<Flow> {
        let state = self.store.snapshot();
        let library = self.store.personas();

        let mut categories: Vec<String> =
            library.category_names().into_iter().map(str::to_string).collect();
        categories.push(CUSTOM_CATEGORY.to_string());
        let category = categories[ui::select(
            &format!("人设分类 (当前 {}):", state.persona.category),
            categories.clone(),
        )?]
        .clone();

        if category == CUSTOM_CATEGORY {
            let prompt = ui::text("自定义人设描述:", None)?;
            self.store.set_custom_persona(&prompt);
        } else {
            self.store.set_persona_category(&category);
            let names: Vec<String> = library
                .personas(&category)
                .iter()
                .map(|p| p.name.clone())
                .collect();
            if !names.is_empty() {
                let name = names[ui::select("选择人设:", names.clone())?].clone();
                self.store.set_persona_name(&name);
            }
        }

        match self.store.models().await {
            Ok(models) if !models.is_empty() => {
                let labels: Vec<String> = models
                    .iter()
                    .map(|m| format!("{} ({})", m.label, m.value))
                    .collect();
                let chosen = &models[ui::select(&format!("模型 (当前 {}):", state.model_id), labels)?];
                self.store.set_model(&chosen.value);
            }
            Ok(_) => {}
            Err(e) => warn!("Model list unavailable, keeping {}: {:#}", state.model_id, e),
        }

        let reference = ui::text("参考链接 (可选):", state.reference_url.as_deref())?;
        self.store.set_reference_url(Some(&reference));

        let options = vec!["开始生成".to_string(), "返回选题".to_string(), "退出".to_string()];
        match ui::select("下一步:", options)? {
            0 => self.generate().await,
            1 => {
                self.store.navigate(Stage::Topic);
                Ok(Flow::Continue)
            }
            _ => Ok(Flow::Quit),
        }
    }

    async fn generate(&self) -> Result<Flow> {
        if self.store.is_comparison_enabled() {
            let multi = MultiProgress::new();
            let primary = StepBar::attach(&multi, "主模型");
            let secondary = StepBar::attach(&multi, "对比模型");
            let (p, s) = (primary.clone(), secondary.clone());
            let result = self
                .store
                .generate_comparison(move |lane, steps| match lane {
                    Lane::Primary => p.update(&steps),
                    Lane::Secondary => s.update(&steps),
                })
                .await;
            primary.finish(result.is_ok());
            secondary.finish(result.is_ok());
            if let Err(e) = result {
                println!("生成失败: {:#}", e);
            }
        } else {
            let bar = StepBar::new("生成");
            let result = self.store.generate(bar.observer()).await;
            bar.finish(result.is_ok());
            if let Err(e) = result {
                println!("生成失败: {:#}", e);
            }
        }
        Ok(Flow::Continue)
    }

    async fn preview_stage(&self) -> Result<Flow> {
        let state = self.store.snapshot();

        if let Some(dual) = &state.dual_result {
            for (label, model, content) in [
                ("A", &dual.primary_model, &dual.primary),
                ("B", &dual.secondary_model, &dual.secondary),
            ] {
                println!("\n=== 方案 {} ({}) ===", label, model);
                println!("{}", content.titles.join(" / "));
                println!("{}", preview(&content.content, 200));
            }
            let options = vec!["采用方案 A".to_string(), "采用方案 B".to_string()];
            let lane = match ui::select("选择结果:", options)? {
                0 => Lane::Primary,
                _ => Lane::Secondary,
            };
            self.store.choose_result(lane);
            return Ok(Flow::Continue);
        }

        let Some(content) = &state.generated_content else {
            self.store.navigate(Stage::Persona);
            return Ok(Flow::Continue);
        };
        println!("\n{}", content.titles.join(" / "));
        println!("{}", preview(&content.content, 400));
        for element in &content.visual_elements {
            println!("  - {}", preview(element.description(), 60));
        }

        let options = vec![
            "进入工作室".to_string(),
            "重新生成".to_string(),
            "导出 Markdown".to_string(),
            "重新开始".to_string(),
            "退出".to_string(),
        ];
        match ui::select("下一步:", options)? {
            0 => {
                self.store.navigate(Stage::Studio);
            }
            1 => {
                self.store.navigate(Stage::Persona);
            }
            2 => self.export().await,
            3 => self.store.reset_all(),
            _ => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    async fn studio_stage(&self) -> Result<Flow> {
        let state = self.store.snapshot();
        for kind in [MediaKind::Image, MediaKind::Audio] {
            let media = state.media(kind);
            let done = media.iter().filter(|r| r.is_success()).count();
            println!("{}: {}/{}", kind, done, media.len());
        }
        if let Some(video) = &state.video {
            println!("video: {} ({:.1}s)", video.video_path, video.duration);
        }

        let mut options = vec![
            "生成配图".to_string(),
            "生成配音".to_string(),
            "重试失败项".to_string(),
        ];
        if state.mode == Mode::Video {
            options.push("合成视频".to_string());
        }
        options.extend([
            "导出 Markdown".to_string(),
            "返回预览".to_string(),
            "重新开始".to_string(),
            "退出".to_string(),
        ]);
        let choice = options[ui::select("工作室:", options.clone())?].clone();

        match choice.as_str() {
            "生成配图" => self.render(MediaKind::Image).await,
            "生成配音" => self.render(MediaKind::Audio).await,
            "重试失败项" => self.retry_failed().await,
            "合成视频" => {
                let bgm = ui::text("背景音乐路径 (可选):", None)?;
                let bgm = if bgm.is_empty() { None } else { Some(bgm) };
                let bar = StepBar::new("视频");
                let result = self.store.compose_video(bgm, bar.observer()).await;
                bar.finish(result.is_ok());
                if let Err(e) = result {
                    println!("视频合成失败: {:#}", e);
                }
            }
            "导出 Markdown" => self.export().await,
            "返回预览" => {
                self.store.navigate(Stage::Preview);
            }
            "重新开始" => self.store.reset_all(),
            _ => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    async fn render(&self, kind: MediaKind) {
        let bar = StepBar::new(&kind.to_string());
        let result = self.store.generate_media(kind, bar.observer()).await;
        bar.finish(result.is_ok());
        if let Err(e) = result {
            println!("{} 生成失败: {:#}", kind, e);
        }
    }

    async fn retry_failed(&self) {
        let state = self.store.snapshot();
        for kind in [MediaKind::Image, MediaKind::Audio] {
            let failed: Vec<usize> = state
                .media(kind)
                .iter()
                .filter(|r| r.error.is_some())
                .map(|r| r.index)
                .collect();
            for index in failed {
                match self.store.retry_media(kind, index).await {
                    Ok(_) => println!("{} #{} 已重新生成", kind, index + 1),
                    Err(e) => println!("{} #{} 仍然失败: {:#}", kind, index + 1, e),
                }
            }
        }
    }

    async fn export(&self) {
        let result = match Note::from_state(&self.store.snapshot()) {
            Ok(note) => {
                export_note(&self.storage, &self.config.export_folder, &note, Utc::now()).await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(path) => println!("已导出: {}", path),
            Err(e) => println!("导出失败: {:#}", e),
        }
    }
}
