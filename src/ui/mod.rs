//! Terminal rendering of progress snapshots and the interactive prompts.

use crate::services::progress::{ProgressStep, StepStatus};
use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use inquire::{Select, Text};
use std::time::Duration;

fn completed(steps: &[ProgressStep]) -> u64 {
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count() as u64
}

/// The step currently shown to the user: the failed one, else the loading one.
fn current_label(steps: &[ProgressStep]) -> Option<&str> {
    steps
        .iter()
        .find(|s| s.status == StepStatus::Error)
        .or_else(|| steps.iter().find(|s| s.status == StepStatus::Loading))
        .map(|s| s.label.as_str())
}

/// A progress bar driven by simulator snapshots.
#[derive(Clone)]
pub struct StepBar {
    bar: ProgressBar,
}

impl StepBar {
    pub fn new(prefix: &str) -> Self {
        Self::with_bar(ProgressBar::new(0), prefix)
    }

    /// A bar that sits under `multi` next to others.
    pub fn attach(multi: &MultiProgress, prefix: &str) -> Self {
        Self::with_bar(multi.add(ProgressBar::new(0)), prefix)
    }

    fn with_bar(bar: ProgressBar, prefix: &str) -> Self {
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_prefix(prefix.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    pub fn update(&self, steps: &[ProgressStep]) {
        self.bar.set_length(steps.len() as u64);
        self.bar.set_position(completed(steps));
        match current_label(steps) {
            Some(label) => self.bar.set_message(label.to_string()),
            None => self.bar.set_message(String::new()),
        }
    }

    pub fn observer(&self) -> impl FnMut(Vec<ProgressStep>) + Send + 'static {
        let bar = self.clone();
        move |steps| bar.update(&steps)
    }

    pub fn finish(&self, ok: bool) {
        if ok {
            self.bar.finish_with_message("完成");
        } else {
            self.bar.abandon();
        }
    }
}

/// Returns the index of the chosen option.
pub fn select(prompt: &str, options: Vec<String>) -> Result<usize> {
    Ok(Select::new(prompt, options).raw_prompt()?.index)
}

pub fn text(prompt: &str, default: Option<&str>) -> Result<String> {
    let mut input = Text::new(prompt);
    if let Some(default) = default {
        input = input.with_default(default);
    }
    Ok(input.prompt()?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: usize, label: &str, status: StepStatus) -> ProgressStep {
        ProgressStep {
            id,
            label: label.to_string(),
            status,
            estimated_seconds: 1.0,
        }
    }

    #[test]
    fn test_completed_and_current() {
        let steps = vec![
            step(0, "分析选题", StepStatus::Completed),
            step(1, "撰写正文", StepStatus::Loading),
            step(2, "质量检测", StepStatus::Pending),
        ];
        assert_eq!(completed(&steps), 1);
        assert_eq!(current_label(&steps), Some("撰写正文"));
    }

    #[test]
    fn test_error_label_wins() {
        let steps = vec![
            step(0, "a", StepStatus::Error),
            step(1, "b", StepStatus::Pending),
        ];
        assert_eq!(current_label(&steps), Some("a"));
        assert_eq!(current_label(&[]), None);
    }

    #[test]
    fn test_bar_tracks_snapshots() {
        let bar = StepBar::with_bar(ProgressBar::hidden(), "test");
        let mut observe = bar.observer();
        observe(vec![
            step(0, "a", StepStatus::Completed),
            step(1, "b", StepStatus::Loading),
        ]);
        assert_eq!(bar.bar.length(), Some(2));
        assert_eq!(bar.bar.position(), 1);
        assert_eq!(bar.bar.message(), "b");
    }
}
