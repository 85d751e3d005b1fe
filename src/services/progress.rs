//! Scripted progress over a single real task of unknown duration.
//!
//! The simulator walks an ordered list of steps on a timer while the real
//! task runs in the background. Whenever the loop reaches a step boundary it
//! looks at the task: an early success finishes every remaining step at
//! once, a failure marks the current step as failed. Cancellation is only
//! observed at those same boundaries, so a cancel issued mid-step takes
//! effect once that step's delay has elapsed.

use crate::core::clock::Clock;
use crate::core::state::{MediaKind, Mode};
use anyhow::{anyhow, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Loading,
    Completed,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StepSpec {
    pub label: String,
    pub estimated_seconds: f64,
}

impl StepSpec {
    pub fn new(label: impl Into<String>, estimated_seconds: f64) -> Self {
        Self {
            label: label.into(),
            estimated_seconds,
        }
    }

    fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.estimated_seconds).unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProgressStep {
    pub id: usize,
    pub label: String,
    pub status: StepStatus,
    pub estimated_seconds: f64,
}

/// Error produced when a simulated operation is cancelled before it settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Cancelled>().is_some()
}

/// Ordered steps of one operation. Every snapshot it produces is a fresh
/// vector.
#[derive(Debug, Clone, Default)]
pub struct StepModel {
    specs: Vec<StepSpec>,
}

impl StepModel {
    pub fn new(specs: Vec<StepSpec>) -> Self {
        Self { specs }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Steps before `index` completed, step `index` in `current` (pending
    /// when `None`), everything after pending.
    pub fn at(&self, index: usize, current: Option<StepStatus>) -> Vec<ProgressStep> {
        self.specs
            .iter()
            .enumerate()
            .map(|(id, spec)| {
                let status = if id < index {
                    StepStatus::Completed
                } else if id == index {
                    current.unwrap_or(StepStatus::Pending)
                } else {
                    StepStatus::Pending
                };
                ProgressStep {
                    id,
                    label: spec.label.clone(),
                    status,
                    estimated_seconds: spec.estimated_seconds,
                }
            })
            .collect()
    }

    pub fn initial(&self) -> Vec<ProgressStep> {
        self.at(0, None)
    }

    pub fn completed(&self) -> Vec<ProgressStep> {
        self.at(self.len(), None)
    }

    fn duration(&self, index: usize) -> Duration {
        self.specs[index].duration()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Whether both handles control the same simulation.
    pub fn same_as(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

/// Handle to a running simulation. Await it for the real task's outcome.
///
/// Cancelling stops the scripted loop and rejects with [`Cancelled`]; the
/// real task is left running in the background. Callers that need the
/// underlying request aborted must wire their own signal into the task.
pub struct SimulatedTask<T> {
    handle: JoinHandle<Result<T>>,
    cancel: CancelHandle,
}

impl<T> SimulatedTask<T> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl<T> Future for SimulatedTask<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(e)) => Poll::Ready(Err(anyhow!("Progress loop aborted: {}", e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Clone)]
pub struct ProgressSimulator {
    clock: Arc<dyn Clock>,
}

impl ProgressSimulator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Starts `task` immediately and walks `steps` alongside it, reporting
    /// every status change to `on_step`. Must be called inside a tokio
    /// runtime.
    pub fn run<T, F, Fut, O>(&self, steps: Vec<StepSpec>, task: F, on_step: O) -> SimulatedTask<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        O: FnMut(Vec<ProgressStep>) + Send + 'static,
    {
        let real = tokio::spawn(task());
        let cancel = CancelHandle::default();
        let handle = tokio::spawn(drive(
            self.clock.clone(),
            StepModel::new(steps),
            real,
            cancel.clone(),
            on_step,
        ));
        SimulatedTask { handle, cancel }
    }
}

async fn drive<T, O>(
    clock: Arc<dyn Clock>,
    model: StepModel,
    mut real: JoinHandle<Result<T>>,
    cancel: CancelHandle,
    mut on_step: O,
) -> Result<T>
where
    O: FnMut(Vec<ProgressStep>),
{
    if model.is_empty() {
        let outcome = join(&mut real).await;
        on_step(Vec::new());
        return outcome;
    }

    let last = model.len() - 1;
    for i in 0..model.len() {
        if cancel.is_cancelled() {
            return abandon(&model, i, &mut on_step);
        }

        on_step(model.at(i, Some(StepStatus::Loading)));
        if real.is_finished() {
            return settle(&model, i, join(&mut real).await, &mut on_step);
        }

        clock.sleep(model.duration(i)).await;

        if cancel.is_cancelled() {
            return abandon(&model, i, &mut on_step);
        }
        if real.is_finished() {
            return settle(&model, i, join(&mut real).await, &mut on_step);
        }
        // The last step stays loading until the real task settles.
        if i < last {
            on_step(model.at(i + 1, None));
        }
    }

    debug!("Scripted steps exhausted, waiting on the real task");
    let outcome = join(&mut real).await;
    settle(&model, last, outcome, &mut on_step)
}

async fn join<T>(real: &mut JoinHandle<Result<T>>) -> Result<T> {
    match real.await {
        Ok(outcome) => outcome,
        Err(e) => Err(anyhow!("Task did not complete: {}", e)),
    }
}

fn settle<T, O>(model: &StepModel, index: usize, outcome: Result<T>, on_step: &mut O) -> Result<T>
where
    O: FnMut(Vec<ProgressStep>),
{
    match outcome {
        Ok(value) => {
            on_step(model.completed());
            Ok(value)
        }
        Err(e) => {
            debug!("Task failed during step {}: {}", index, e);
            on_step(model.at(index, Some(StepStatus::Error)));
            Err(e)
        }
    }
}

fn abandon<T, O>(model: &StepModel, index: usize, on_step: &mut O) -> Result<T>
where
    O: FnMut(Vec<ProgressStep>),
{
    debug!("Progress cancelled before step {}", index);
    on_step(model.at(index, None));
    Err(Cancelled.into())
}

// --- Step scripts ---

pub fn topic_steps() -> Vec<StepSpec> {
    vec![
        StepSpec::new("联网搜索热点", 6.0),
        StepSpec::new("分析热度趋势", 8.0),
        StepSpec::new("整理候选选题", 4.0),
    ]
}

pub fn generation_steps(mode: Mode) -> Vec<StepSpec> {
    let middle = match mode {
        Mode::Image => [
            StepSpec::new("构思大纲与标题", 6.0),
            StepSpec::new("撰写正文", 20.0),
            StepSpec::new("设计配图方案", 10.0),
        ],
        Mode::Video => [
            StepSpec::new("构思口播脚本", 6.0),
            StepSpec::new("撰写旁白", 15.0),
            StepSpec::new("拆分分镜画面", 10.0),
        ],
        Mode::Wechat => [
            StepSpec::new("梳理技术要点", 8.0),
            StepSpec::new("撰写长文", 30.0),
            StepSpec::new("设计架构图表", 10.0),
        ],
    };

    let mut steps = vec![StepSpec::new("分析选题", 3.0)];
    steps.extend(middle);
    steps.push(StepSpec::new("质量检测", 5.0));
    steps
}

pub fn media_steps(kind: MediaKind, count: usize) -> Vec<StepSpec> {
    let count = count.max(1) as f64;
    match kind {
        MediaKind::Image => vec![
            StepSpec::new("提交生图任务", 2.0),
            StepSpec::new("生成图片", 8.0 * count),
            StepSpec::new("保存图片", 2.0),
        ],
        MediaKind::Audio => vec![
            StepSpec::new("合成语音", 3.0 * count),
            StepSpec::new("保存音频", 1.0),
        ],
    }
}

pub fn video_steps() -> Vec<StepSpec> {
    vec![
        StepSpec::new("对齐音画", 3.0),
        StepSpec::new("渲染视频", 20.0),
        StepSpec::new("生成字幕", 3.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::TokioClock;
    use std::sync::Mutex;
    use tokio::time::{sleep, Instant};

    type Log = Arc<Mutex<Vec<Vec<ProgressStep>>>>;

    fn recorder() -> (Log, impl FnMut(Vec<ProgressStep>) + Send + 'static) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |snapshot| sink.lock().unwrap().push(snapshot))
    }

    fn statuses(snapshot: &[ProgressStep]) -> Vec<StepStatus> {
        snapshot.iter().map(|s| s.status).collect()
    }

    fn last_snapshot(log: &Log) -> Vec<ProgressStep> {
        log.lock().unwrap().last().cloned().expect("no snapshot emitted")
    }

    /// Once a step reaches completed or error it never changes again.
    fn assert_monotonic(log: &Log) {
        let log = log.lock().unwrap();
        for pair in log.windows(2) {
            for (before, after) in pair[0].iter().zip(pair[1].iter()) {
                if matches!(before.status, StepStatus::Completed | StepStatus::Error) {
                    assert_eq!(
                        before.status, after.status,
                        "step {} regressed from {:?} to {:?}",
                        before.id, before.status, after.status
                    );
                }
            }
        }
    }

    fn simulator() -> ProgressSimulator {
        ProgressSimulator::new(Arc::new(TokioClock))
    }

    #[test]
    fn test_step_model_snapshots() {
        let model = StepModel::new(vec![
            StepSpec::new("a", 1.0),
            StepSpec::new("b", 1.0),
            StepSpec::new("c", 1.0),
        ]);

        assert_eq!(
            statuses(&model.at(1, Some(StepStatus::Loading))),
            vec![StepStatus::Completed, StepStatus::Loading, StepStatus::Pending]
        );
        assert_eq!(
            statuses(&model.initial()),
            vec![StepStatus::Pending, StepStatus::Pending, StepStatus::Pending]
        );
        assert_eq!(
            statuses(&model.completed()),
            vec![StepStatus::Completed, StepStatus::Completed, StepStatus::Completed]
        );
        assert_eq!(model.at(2, None)[2].label, "c");
    }

    #[test]
    fn test_invalid_estimates_do_not_panic() {
        assert_eq!(StepSpec::new("neg", -1.0).duration(), Duration::ZERO);
        assert_eq!(StepSpec::new("nan", f64::NAN).duration(), Duration::ZERO);
        assert_eq!(StepSpec::new("ok", 1.5).duration(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_task_short_circuits_remaining_steps() {
        let (log, observer) = recorder();
        let start = Instant::now();

        let task = simulator().run(
            vec![StepSpec::new("prep", 1.0), StepSpec::new("work", 1.0)],
            || async {
                sleep(Duration::from_millis(50)).await;
                Ok::<_, anyhow::Error>("V")
            },
            observer,
        );

        assert_eq!(task.await.unwrap(), "V");
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(
            statuses(&last_snapshot(&log)),
            vec![StepStatus::Completed, StepStatus::Completed]
        );
        assert_monotonic(&log);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_during_step_marks_that_step() {
        let (log, observer) = recorder();

        let task = simulator().run(
            vec![StepSpec::new("a", 1.0), StepSpec::new("b", 1.0)],
            || async {
                sleep(Duration::from_millis(500)).await;
                Err::<(), _>(anyhow!("E"))
            },
            observer,
        );

        let err = task.await.unwrap_err();
        assert_eq!(err.to_string(), "E");
        assert!(!is_cancelled(&err));
        assert_eq!(
            statuses(&last_snapshot(&log)),
            vec![StepStatus::Error, StepStatus::Pending]
        );
        assert_monotonic(&log);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_observed_at_next_boundary() {
        let (log, observer) = recorder();
        let start = Instant::now();

        let task = simulator().run(
            vec![
                StepSpec::new("a", 1.0),
                StepSpec::new("b", 1.0),
                StepSpec::new("c", 1.0),
            ],
            || async {
                sleep(Duration::from_secs(10)).await;
                Ok::<_, anyhow::Error>(())
            },
            observer,
        );

        let cancel = task.cancel_handle();
        tokio::spawn(async move {
            sleep(Duration::from_millis(1500)).await;
            cancel.cancel();
        });

        let err = task.await.unwrap_err();
        assert!(is_cancelled(&err));
        // Latency is bounded by the rest of step b's delay.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(
            statuses(&last_snapshot(&log)),
            vec![StepStatus::Completed, StepStatus::Pending, StepStatus::Pending]
        );
        assert_monotonic(&log);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_step() {
        let (log, observer) = recorder();

        let task = simulator().run(
            vec![StepSpec::new("a", 1.0), StepSpec::new("b", 1.0)],
            || async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, anyhow::Error>(1)
            },
            observer,
        );
        task.cancel();

        assert!(is_cancelled(&task.await.unwrap_err()));
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(statuses(&log[0]), vec![StepStatus::Pending, StepStatus::Pending]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_does_not_abort_real_task() {
        let (_log, observer) = recorder();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let task = simulator().run(
            vec![StepSpec::new("a", 1.0)],
            move || async move {
                sleep(Duration::from_secs(3)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            },
            observer,
        );
        task.cancel();
        assert!(task.await.is_err());

        sleep(Duration::from_secs(4)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_task_keeps_last_step_loading() {
        let (log, observer) = recorder();
        let start = Instant::now();

        let task = simulator().run(
            vec![StepSpec::new("a", 1.0), StepSpec::new("b", 1.0)],
            || async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, anyhow::Error>(42)
            },
            observer,
        );

        assert_eq!(task.await.unwrap(), 42);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(6));

        let log = log.lock().unwrap();
        let before_last = &log[log.len() - 2];
        assert_eq!(
            statuses(before_last),
            vec![StepStatus::Completed, StepStatus::Loading]
        );
        assert_eq!(
            statuses(log.last().unwrap()),
            vec![StepStatus::Completed, StepStatus::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_failure_marks_last_step() {
        let (log, observer) = recorder();

        let task = simulator().run(
            vec![StepSpec::new("a", 1.0), StepSpec::new("b", 1.0)],
            || async {
                sleep(Duration::from_secs(5)).await;
                Err::<(), _>(anyhow!("backend timeout"))
            },
            observer,
        );

        assert!(task.await.is_err());
        assert_eq!(
            statuses(&last_snapshot(&log)),
            vec![StepStatus::Completed, StepStatus::Error]
        );
        assert_monotonic(&log);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_script_waits_for_task() {
        let (log, observer) = recorder();

        let task = simulator().run(
            Vec::new(),
            || async {
                sleep(Duration::from_secs(1)).await;
                Ok::<_, anyhow::Error>("done")
            },
            observer,
        );

        assert_eq!(task.await.unwrap(), "done");
        assert_eq!(log.lock().unwrap().as_slice(), &[Vec::<ProgressStep>::new()]);
    }

    #[test]
    fn test_generation_scripts_bracket_every_mode() {
        for mode in Mode::ALL {
            let steps = generation_steps(mode);
            assert_eq!(steps.first().unwrap().label, "分析选题");
            assert_eq!(steps.last().unwrap().label, "质量检测");
            assert!(steps.iter().all(|s| s.estimated_seconds > 0.0));
        }
        assert_eq!(media_steps(MediaKind::Image, 4)[1].estimated_seconds, 32.0);
    }
}
