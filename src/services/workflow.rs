//! The pipeline state container.
//!
//! Stages run `topic → persona → preview → studio`. Whatever a stage owns is
//! derived from the stages before it, so every mutation clears the data of
//! all later stages inside the same transition. Listeners only ever see
//! snapshots taken after a transition is complete.
//!
//! Long-running operations (topic search, generation, media, video) are
//! single-flight per kind and run through [`ProgressSimulator`]. Their
//! results are committed only if nothing upstream changed while they were
//! running; otherwise they are dropped and the caller gets [`Superseded`].

use crate::core::clock::Clock;
use crate::core::config::WorkflowConfig;
use crate::core::io::Storage;
use crate::core::state::{
    Activity, DualResult, GeneratedContent, Lane, MediaKind, MediaResult, Mode, PersistedState,
    PersonaChoice, PersonaSelection, Stage, Topic, VideoArtifact, WorkflowState, CUSTOM_CATEGORY,
};
use crate::services::api::{
    BatchMediaResult, ContentApi, GenerateRequest, MediaBatchRequest, MediaItem, ModelOption,
    SceneNarration, SingleMediaRequest, VideoRequest,
};
use crate::services::persona::PersonaLibrary;
use crate::services::progress::{self, CancelHandle, ProgressSimulator, ProgressStep};
use anyhow::{anyhow, bail, Context, Result};
use futures_util::future;
use log::{debug, info, warn};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

pub const SESSION_FILE: &str = "session.json";

pub type Listener = Arc<dyn Fn(Arc<WorkflowState>) + Send + Sync>;

/// The backend answered, but without usable titles or content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRejected;

impl fmt::Display for GenerationRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("content generation failed, please retry")
    }
}

impl std::error::Error for GenerationRejected {}

/// The workflow moved on while an operation was running; its result was
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superseded;

impl fmt::Display for Superseded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("result discarded because the workflow changed while it was running")
    }
}

impl std::error::Error for Superseded {}

pub fn is_superseded(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Superseded>().is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Busy {
    Analyzing,
    Generating,
    Images,
    Audio,
    Video,
}

impl Busy {
    const COUNT: usize = 5;

    fn media(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Image => Busy::Images,
            MediaKind::Audio => Busy::Audio,
        }
    }

    fn flag(self, activity: &mut Activity) -> &mut bool {
        match self {
            Busy::Analyzing => &mut activity.analyzing,
            Busy::Generating => &mut activity.generating,
            Busy::Images => &mut activity.rendering_images,
            Busy::Audio => &mut activity.rendering_audio,
            Busy::Video => &mut activity.composing_video,
        }
    }

    fn is_set(self, activity: &Activity) -> bool {
        let mut copy = *activity;
        *self.flag(&mut copy)
    }

    fn describe(self) -> &'static str {
        match self {
            Busy::Analyzing => "Topic analysis",
            Busy::Generating => "Content generation",
            Busy::Images => "Image generation",
            Busy::Audio => "Audio generation",
            Busy::Video => "Video composition",
        }
    }
}

/// Counters used to recognise results that arrive after their inputs were
/// invalidated.
#[derive(Debug, Clone, Copy, Default)]
struct Epochs {
    /// Bumped by mode switches, restores and resets.
    session: u64,
    /// Bumped whenever the generated content changes or is cleared.
    content: u64,
    /// Latest run per operation kind; only that run may clear its flag.
    runs: [u64; Busy::COUNT],
}

impl Epochs {
    fn invalidate_content(&mut self) {
        self.content += 1;
    }

    fn invalidate_session(&mut self) {
        self.session += 1;
        self.content += 1;
    }

    fn abandon_runs(&mut self) {
        for run in self.runs.iter_mut() {
            *run += 1;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    busy: Busy,
    run: u64,
    epochs: Epochs,
}

impl Ticket {
    fn release(&self, state: &mut WorkflowState, epochs: &Epochs) {
        if epochs.runs[self.busy as usize] == self.run {
            *self.busy.flag(&mut state.activity) = false;
        }
    }

    fn is_current(&self, epochs: &Epochs) -> bool {
        match self.busy {
            Busy::Analyzing => self.epochs.session == epochs.session,
            _ => self.epochs.content == epochs.content,
        }
    }
}

/// One started operation. Owns the in-flight flag and the cancel handles
/// until [`Run::finish`]; dropping it unfinished (the caller dropped the
/// operation's future) cancels the handles and clears the flag.
struct Run<'a> {
    store: &'a WorkflowStore,
    ticket: Ticket,
    handles: Vec<CancelHandle>,
    settled: bool,
}

impl Run<'_> {
    fn track(&mut self, handle: CancelHandle) {
        lock(&self.store.running).push(handle.clone());
        self.handles.push(handle);
    }

    fn untrack(&mut self) -> Vec<CancelHandle> {
        let handles = std::mem::take(&mut self.handles);
        lock(&self.store.running).retain(|h| !handles.iter().any(|own| own.same_as(h)));
        handles
    }

    /// Clears the operation's flag (unless a newer run owns it) and hands
    /// `commit` a flag telling whether the result is still current.
    fn finish<R>(mut self, commit: impl FnOnce(&mut WorkflowState, &mut Epochs, bool) -> R) -> R {
        self.settled = true;
        self.untrack();
        let ticket = self.ticket;
        self.store.transition(|state, epochs| {
            ticket.release(state, epochs);
            let current = ticket.is_current(epochs);
            if !current {
                warn!("{} finished after the workflow changed, dropping its result", ticket.busy.describe());
            }
            commit(state, epochs, current)
        })
    }
}

impl Drop for Run<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        for handle in self.untrack() {
            handle.cancel();
        }
        let ticket = self.ticket;
        warn!("{} was abandoned before it finished", ticket.busy.describe());
        self.store.transition(|state, epochs| ticket.release(state, epochs));
    }
}

struct Inner {
    state: Arc<WorkflowState>,
    epochs: Epochs,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Returned by [`WorkflowStore::subscribe`].
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn initial_state(config: &WorkflowConfig) -> WorkflowState {
    let mode = config.default_mode;
    WorkflowState {
        revision: 0,
        mode,
        stage: Stage::Topic,
        keyword: String::new(),
        topics: Vec::new(),
        topic_source: None,
        selected_topic: None,
        persona: config.mode_defaults.for_mode(mode),
        reference_url: None,
        model_id: config.model.clone(),
        comparison_model: config.comparison_model.clone(),
        temperature: clamp_temperature(config.temperature).unwrap_or(0.8),
        generated_content: None,
        dual_result: None,
        image_results: Vec::new(),
        audio_results: Vec::new(),
        video: None,
        activity: Activity::default(),
    }
}

fn clamp_temperature(value: f32) -> Option<f32> {
    if value.is_nan() {
        None
    } else {
        Some(value.clamp(0.0, 2.0))
    }
}

fn clamp_stage(state: &mut WorkflowState) {
    state.stage = state.stage.min(state.reachable_stage());
}

/// Clears everything derived from the persona stage's inputs.
fn invalidate_generation(state: &mut WorkflowState, epochs: &mut Epochs) {
    if state.generated_content.is_some() || state.dual_result.is_some() {
        debug!("Generation inputs changed, clearing generated content and media");
    }
    state.clear_downstream_of_topic();
    epochs.invalidate_content();
    clamp_stage(state);
}

fn validate(content: GeneratedContent) -> Result<GeneratedContent> {
    if content.is_valid() {
        Ok(content)
    } else {
        Err(GenerationRejected.into())
    }
}

fn build_request(
    state: &WorkflowState,
    personas: &PersonaLibrary,
    model: String,
) -> Result<GenerateRequest> {
    let topic = state
        .selected_topic
        .clone()
        .ok_or_else(|| anyhow!("No topic selected"))?;
    let persona = personas.resolve_prompt(&state.persona)?;
    let outline = if topic.outline.is_empty() {
        None
    } else {
        Some(topic.outline.clone())
    };

    Ok(GenerateRequest {
        topic: topic.title.clone(),
        persona: Some(persona),
        reference_url: state.reference_url.clone(),
        mode: state.mode,
        llm_model: model,
        temperature: state.temperature,
        outline,
        search_data: Some(topic),
    })
}

/// Persona to resume with. No category, or a custom one without its text,
/// falls back to the mode default.
fn restored_persona(persisted: &PersistedState, fallback: PersonaSelection) -> PersonaSelection {
    let category = persisted.persona_category.as_str();
    if category.is_empty() {
        return fallback;
    }
    if category == CUSTOM_CATEGORY {
        return match &persisted.custom_persona {
            Some(text) if !text.trim().is_empty() => PersonaSelection {
                category: CUSTOM_CATEGORY.to_string(),
                persona: PersonaChoice::Custom(text.clone()),
            },
            _ => fallback,
        };
    }
    PersonaSelection {
        category: category.to_string(),
        persona: persisted
            .persona_name
            .clone()
            .map(PersonaChoice::Named)
            .unwrap_or(PersonaChoice::Unset),
    }
}

fn require_content(state: &WorkflowState) -> Result<&GeneratedContent> {
    state
        .generated_content
        .as_ref()
        .ok_or_else(|| anyhow!("No generated content yet"))
}

pub struct WorkflowStore {
    config: WorkflowConfig,
    api: Arc<dyn ContentApi>,
    simulator: ProgressSimulator,
    personas: RwLock<Arc<PersonaLibrary>>,
    inner: Mutex<Inner>,
    listeners: Arc<Mutex<Listeners>>,
    running: Mutex<Vec<CancelHandle>>,
}

impl WorkflowStore {
    pub fn new(config: WorkflowConfig, api: Arc<dyn ContentApi>, clock: Arc<dyn Clock>) -> Self {
        let state = initial_state(&config);
        Self {
            config,
            api,
            simulator: ProgressSimulator::new(clock),
            personas: RwLock::new(Arc::new(PersonaLibrary::default())),
            inner: Mutex::new(Inner {
                state: Arc::new(state),
                epochs: Epochs::default(),
            }),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<WorkflowState> {
        lock(&self.inner).state.clone()
    }

    /// Registers `listener` for every snapshot produced from now on.
    /// Delivery is synchronous, on the thread that made the change, so
    /// changes made on different threads may arrive out of order. Compare
    /// [`WorkflowState::revision`] to keep only the newest.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Arc<WorkflowState>) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.listeners);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn notify(&self, snapshot: Arc<WorkflowState>) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(snapshot.clone());
        }
    }

    /// Applies `f` and notifies listeners if the state changed. A change
    /// bumps the revision; a no-op keeps the current snapshot.
    fn transition<R>(&self, f: impl FnOnce(&mut WorkflowState, &mut Epochs) -> R) -> R {
        let (result, snapshot) = {
            let mut inner = lock(&self.inner);
            let Inner { state: shared, epochs } = &mut *inner;
            let before = shared.clone();
            let result = f(Arc::make_mut(shared), epochs);
            if **shared == *before {
                *shared = before;
                (result, None)
            } else {
                let revision = before.revision + 1;
                drop(before);
                Arc::make_mut(shared).revision = revision;
                (result, Some(shared.clone()))
            }
        };
        if let Some(snapshot) = snapshot {
            self.notify(snapshot);
        }
        result
    }

    /// Marks `busy` as running after `plan` succeeds against the current
    /// state. A failed plan or an operation already in flight leaves the
    /// state untouched and notifies nobody.
    fn begin<R>(
        &self,
        busy: Busy,
        plan: impl FnOnce(&WorkflowState) -> Result<R>,
        prepare: impl FnOnce(&mut WorkflowState, &mut Epochs),
    ) -> Result<(R, Run<'_>)> {
        let (planned, ticket, snapshot) = {
            let mut inner = lock(&self.inner);
            if busy.is_set(&inner.state.activity) {
                bail!("{} is already in progress", busy.describe());
            }
            let planned = plan(&inner.state)?;

            let Inner { state: shared, epochs } = &mut *inner;
            let state = Arc::make_mut(shared);
            *busy.flag(&mut state.activity) = true;
            prepare(state, epochs);
            state.revision += 1;
            epochs.runs[busy as usize] += 1;
            let ticket = Ticket {
                busy,
                run: epochs.runs[busy as usize],
                epochs: *epochs,
            };
            (planned, ticket, shared.clone())
        };
        self.notify(snapshot);
        Ok((
            planned,
            Run {
                store: self,
                ticket,
                handles: Vec::new(),
                settled: false,
            },
        ))
    }

    /// Stops observing every running operation. Each rejects with
    /// [`progress::Cancelled`] at its next step boundary; the requests
    /// themselves keep running on the backend.
    pub fn cancel_running(&self) {
        let handles: Vec<CancelHandle> = lock(&self.running).drain(..).collect();
        if !handles.is_empty() {
            info!("Cancelling {} running operation(s)", handles.len());
        }
        for handle in handles {
            handle.cancel();
        }
    }

    // --- Persona library ---

    pub fn personas(&self) -> Arc<PersonaLibrary> {
        self.personas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_persona_library(&self, library: PersonaLibrary) {
        *self.personas.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(library);
    }

    /// Fetches the persona library from the backend, falling back to the
    /// configured `persona_file` when the backend fails.
    pub async fn load_personas(&self, storage: &dyn Storage) -> Result<()> {
        let library = match self.api.list_personas().await {
            Ok(library) => library,
            Err(e) => {
                let Some(path) = self.config.persona_file.as_deref() else {
                    return Err(e.context("Failed to load persona library"));
                };
                warn!("Backend persona library unavailable ({:#}), reading {}", e, path);
                PersonaLibrary::load(storage, path).await?
            }
        };
        info!("Loaded {} persona categories", library.categories.len());
        self.set_persona_library(library);
        Ok(())
    }

    /// Models the backend can generate with.
    pub async fn models(&self) -> Result<Vec<ModelOption>> {
        self.api.list_models().await
    }

    // --- Mutators ---

    pub fn set_mode(&self, mode: Mode) {
        let persona = self.config.mode_defaults.for_mode(mode);
        self.transition(|state, epochs| {
            debug!("Switching mode {} -> {}", state.mode, mode);
            state.mode = mode;
            state.persona = persona;
            state.selected_topic = None;
            state.clear_downstream_of_topic();
            state.stage = Stage::Topic;
            epochs.invalidate_session();
        });
    }

    pub fn select_topic(&self, topic: Topic) {
        self.transition(|state, epochs| {
            debug!("Selecting topic: {}", topic.title);
            state.selected_topic = Some(topic);
            state.clear_downstream_of_topic();
            state.stage = Stage::Persona;
            epochs.invalidate_content();
        });
    }

    /// Selects one of the current search results. Returns `false` when
    /// `index` is out of range.
    pub fn select_topic_at(&self, index: usize) -> bool {
        match self.snapshot().topics.get(index).cloned() {
            Some(topic) => {
                self.select_topic(topic);
                true
            }
            None => false,
        }
    }

    pub fn set_persona_category(&self, category: &str) {
        let category = category.to_string();
        self.transition(|state, epochs| {
            if state.persona.category == category {
                return;
            }
            state.persona = PersonaSelection {
                category,
                persona: PersonaChoice::Unset,
            };
            invalidate_generation(state, epochs);
        });
    }

    pub fn set_persona_name(&self, name: &str) {
        let choice = PersonaChoice::Named(name.to_string());
        self.transition(|state, epochs| {
            if state.persona.is_custom() || state.persona.persona == choice {
                return;
            }
            state.persona.persona = choice;
            invalidate_generation(state, epochs);
        });
    }

    pub fn set_custom_persona(&self, text: &str) {
        let next = PersonaSelection {
            category: CUSTOM_CATEGORY.to_string(),
            persona: PersonaChoice::Custom(text.to_string()),
        };
        self.transition(|state, epochs| {
            if state.persona == next {
                return;
            }
            state.persona = next;
            invalidate_generation(state, epochs);
        });
    }

    pub fn set_reference_url(&self, url: Option<&str>) {
        let url = url.map(str::trim).filter(|u| !u.is_empty()).map(str::to_string);
        self.transition(|state, epochs| {
            if state.reference_url == url {
                return;
            }
            state.reference_url = url;
            invalidate_generation(state, epochs);
        });
    }

    pub fn set_model(&self, model_id: &str) {
        let model_id = model_id.trim().to_string();
        self.transition(|state, epochs| {
            if model_id.is_empty() || state.model_id == model_id {
                return;
            }
            state.model_id = model_id;
            invalidate_generation(state, epochs);
        });
    }

    /// Clamped to `0.0..=2.0`; NaN is ignored.
    pub fn set_temperature(&self, temperature: f32) {
        self.transition(|state, epochs| {
            let Some(temperature) = clamp_temperature(temperature) else {
                return;
            };
            if state.temperature == temperature {
                return;
            }
            state.temperature = temperature;
            invalidate_generation(state, epochs);
        });
    }

    /// Second model for side-by-side generation; `None` turns comparison
    /// mode off.
    pub fn set_comparison_model(&self, model_id: Option<&str>) {
        let model_id = model_id.map(str::trim).filter(|m| !m.is_empty()).map(str::to_string);
        self.transition(|state, _| {
            state.comparison_model = model_id;
        });
    }

    pub fn set_generated_content(&self, content: Option<GeneratedContent>) {
        self.transition(|state, epochs| {
            let advance = content.is_some();
            state.dual_result = None;
            state.replace_content(content);
            epochs.invalidate_content();
            if advance {
                state.stage = Stage::Preview;
            } else {
                clamp_stage(state);
            }
        });
    }

    /// Collapses a comparison result into the chosen lane. Returns `false`
    /// when there is nothing to choose from.
    pub fn choose_result(&self, lane: Lane) -> bool {
        self.transition(|state, epochs| {
            let Some(dual) = state.dual_result.take() else {
                return false;
            };
            info!("Keeping {:?} result from {}", lane, match lane {
                Lane::Primary => &dual.primary_model,
                Lane::Secondary => &dual.secondary_model,
            });
            state.replace_content(Some(dual.take(lane)));
            state.stage = Stage::Preview;
            epochs.invalidate_content();
            true
        })
    }

    /// Moves to `stage`, or to the furthest stage before it whose
    /// prerequisites exist. Returns the stage reached.
    pub fn navigate(&self, stage: Stage) -> Stage {
        self.transition(|state, _| {
            state.stage = stage.min(state.reachable_stage());
            state.stage
        })
    }

    pub fn reset_all(&self) {
        let initial = initial_state(&self.config);
        self.transition(|state, epochs| {
            debug!("Resetting workflow");
            *state = WorkflowState {
                revision: state.revision,
                ..initial
            };
            epochs.invalidate_session();
            epochs.abandon_runs();
        });
    }

    // --- Persistence ---

    pub fn persisted(&self) -> PersistedState {
        let state = self.snapshot();
        let custom_persona = match &state.persona.persona {
            PersonaChoice::Custom(text) => Some(text.clone()),
            _ => None,
        };
        PersistedState {
            mode: state.mode,
            model_id: state.model_id.clone(),
            temperature: state.temperature,
            persona_category: state.persona.category.clone(),
            persona_name: state.persona.persona_name().map(str::to_string),
            custom_persona,
        }
    }

    /// Applies a persisted snapshot. Everything not in the persisted field
    /// set starts over, as after a mode switch.
    pub fn restore(&self, persisted: PersistedState) {
        let persona = restored_persona(
            &persisted,
            self.config.mode_defaults.for_mode(persisted.mode),
        );
        self.transition(|state, epochs| {
            state.mode = persisted.mode;
            if !persisted.model_id.trim().is_empty() {
                state.model_id = persisted.model_id;
            }
            if let Some(temperature) = clamp_temperature(persisted.temperature) {
                state.temperature = temperature;
            }
            state.persona = persona;
            state.selected_topic = None;
            state.clear_downstream_of_topic();
            state.stage = Stage::Topic;
            epochs.invalidate_session();
        });
    }

    pub async fn save_session(&self, storage: &dyn Storage, folder: &str) -> Result<()> {
        let path = Path::new(folder).join(SESSION_FILE);
        let content = serde_json::to_string_pretty(&self.persisted())?;
        storage
            .write(&path.to_string_lossy(), content.as_bytes())
            .await?;
        debug!("Saved session to {:?}", path);
        Ok(())
    }

    /// Restores the saved session if there is one. Returns whether anything
    /// was restored.
    pub async fn load_session(&self, storage: &dyn Storage, folder: &str) -> Result<bool> {
        let path = Path::new(folder).join(SESSION_FILE);
        let path_str = path.to_string_lossy();
        if !storage.exists(&path_str).await? {
            return Ok(false);
        }
        let content = storage.read_to_string(&path_str).await?;
        let persisted: PersistedState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse session file {}", path_str))?;
        self.restore(persisted);
        info!("Restored session from {}", path_str);
        Ok(true)
    }

    // --- Long-running operations ---

    /// Searches topics for `keyword` and replaces the topic list wholesale.
    /// On failure the previous list stays as it was.
    pub async fn analyze_topics<O>(&self, keyword: &str, on_step: O) -> Result<Vec<Topic>>
    where
        O: FnMut(Vec<ProgressStep>) + Send + 'static,
    {
        let keyword = keyword.trim().to_string();
        if keyword.is_empty() {
            bail!("Keyword is empty");
        }

        let (_, mut run) = self.begin(
            Busy::Analyzing,
            |_| Ok(()),
            |state, _| state.keyword = keyword.clone(),
        )?;

        let api = self.api.clone();
        let task = self.simulator.run(
            progress::topic_steps(),
            move || async move { api.analyze_topics(&keyword).await },
            on_step,
        );
        run.track(task.cancel_handle());
        let outcome = task.await;

        run.finish(|state, epochs, current| {
            let analysis = outcome?;
            if !current {
                return Err(Superseded.into());
            }
            info!("Found {} topics ({})", analysis.topics.len(), analysis.source);
            state.topics = analysis.topics.clone();
            state.topic_source = Some(analysis.source);
            state.selected_topic = None;
            state.clear_downstream_of_topic();
            state.stage = Stage::Topic;
            epochs.invalidate_content();
            Ok(analysis.topics)
        })
    }

    /// Generates content for the selected topic and persona. The previous
    /// content is cleared before the request goes out; on any failure the
    /// store ends with no content at all.
    pub async fn generate<O>(&self, on_step: O) -> Result<GeneratedContent>
    where
        O: FnMut(Vec<ProgressStep>) + Send + 'static,
    {
        let personas = self.personas();
        let (request, mut run) = self.begin(
            Busy::Generating,
            |state| build_request(state, &personas, state.model_id.clone()),
            |state, epochs| {
                state.dual_result = None;
                state.replace_content(None);
                epochs.invalidate_content();
            },
        )?;

        info!("Generating {} content with {}", request.mode, request.llm_model);
        let api = self.api.clone();
        let task = self.simulator.run(
            progress::generation_steps(request.mode),
            move || async move { api.generate_content(&request).await },
            on_step,
        );
        run.track(task.cancel_handle());
        let outcome = task.await.and_then(validate);

        run.finish(|state, epochs, current| {
            if !current {
                outcome?;
                return Err(Superseded.into());
            }
            match outcome {
                Ok(content) => {
                    info!(
                        "Generated {} titles and {} visual elements",
                        content.titles.len(),
                        content.visual_elements.len()
                    );
                    state.replace_content(Some(content.clone()));
                    state.stage = Stage::Preview;
                    epochs.invalidate_content();
                    Ok(content)
                }
                Err(e) => {
                    warn!("Content generation failed: {:#}", e);
                    state.replace_content(None);
                    Err(e)
                }
            }
        })
    }

    pub fn is_comparison_enabled(&self) -> bool {
        self.snapshot().comparison_model.is_some()
    }

    /// Generates with the primary and the comparison model at the same
    /// time. Nothing is exposed until both have settled, and only if both
    /// succeeded.
    pub async fn generate_comparison<O>(&self, on_step: O) -> Result<DualResult>
    where
        O: Fn(Lane, Vec<ProgressStep>) + Send + Sync + 'static,
    {
        let personas = self.personas();
        let ((primary, secondary), mut run) = self.begin(
            Busy::Generating,
            |state| {
                let secondary_model = state
                    .comparison_model
                    .clone()
                    .ok_or_else(|| anyhow!("No comparison model configured"))?;
                let primary = build_request(state, &personas, state.model_id.clone())?;
                let mut secondary = primary.clone();
                secondary.llm_model = secondary_model;
                Ok((primary, secondary))
            },
            |state, epochs| {
                state.dual_result = None;
                state.replace_content(None);
                epochs.invalidate_content();
            },
        )?;

        info!(
            "Comparing {} against {}",
            primary.llm_model, secondary.llm_model
        );
        let primary_model = primary.llm_model.clone();
        let secondary_model = secondary.llm_model.clone();
        let steps = progress::generation_steps(primary.mode);
        let on_step = Arc::new(on_step);

        let primary_task = {
            let api = self.api.clone();
            let observer = on_step.clone();
            self.simulator.run(
                steps.clone(),
                move || async move { api.generate_content(&primary).await },
                move |snapshot| observer(Lane::Primary, snapshot),
            )
        };
        let secondary_task = {
            let api = self.api.clone();
            let observer = on_step;
            self.simulator.run(
                steps,
                move || async move { api.generate_content(&secondary).await },
                move |snapshot| observer(Lane::Secondary, snapshot),
            )
        };

        run.track(primary_task.cancel_handle());
        run.track(secondary_task.cancel_handle());
        let (a, b) = future::join(primary_task, secondary_task).await;

        let outcome = match (a.and_then(validate), b.and_then(validate)) {
            (Ok(primary), Ok(secondary)) => Ok(DualResult {
                primary_model,
                primary,
                secondary_model,
                secondary,
            }),
            (Err(e), _) | (_, Err(e)) => Err(e),
        };

        run.finish(|state, epochs, current| {
            if !current {
                outcome?;
                return Err(Superseded.into());
            }
            match outcome {
                Ok(dual) => {
                    state.dual_result = Some(dual.clone());
                    state.stage = Stage::Preview;
                    epochs.invalidate_content();
                    Ok(dual)
                }
                Err(e) => {
                    warn!("Comparison generation failed: {:#}", e);
                    state.dual_result = None;
                    state.replace_content(None);
                    Err(e)
                }
            }
        })
    }

    /// Renders one media item per visual element. Results are placed by
    /// index; the arrays never change length.
    pub async fn generate_media<O>(&self, kind: MediaKind, on_step: O) -> Result<BatchMediaResult>
    where
        O: FnMut(Vec<ProgressStep>) + Send + 'static,
    {
        let provider = match kind {
            MediaKind::Image => self.config.image_provider.clone(),
            MediaKind::Audio => self.config.tts_provider.clone(),
        };
        let voice = match kind {
            MediaKind::Image => None,
            MediaKind::Audio => self.config.voice.clone(),
        };

        let (request, mut run) = self.begin(
            Busy::media(kind),
            |state| {
                let content = require_content(state)?;
                if content.visual_elements.is_empty() {
                    bail!("Generated content has no visual elements");
                }
                Ok(MediaBatchRequest {
                    scenes: content.visual_elements.iter().map(MediaItem::from_element).collect(),
                    provider,
                    mode: state.mode,
                    voice,
                    topic: state.selected_topic.as_ref().map(|t| t.title.clone()),
                })
            },
            |state, _| {
                let n = state.media(kind).len();
                *state.media_mut(kind) = (0..n).map(MediaResult::empty).collect();
                state.video = None;
            },
        )?;

        let count = request.scenes.len();
        info!("Generating {} {} item(s) via {}", count, kind, request.provider);
        let api = self.api.clone();
        let task = self.simulator.run(
            progress::media_steps(kind, count),
            move || async move {
                match kind {
                    MediaKind::Image => api.generate_images(&request).await,
                    MediaKind::Audio => api.generate_audio(&request).await,
                }
            },
            on_step,
        );
        run.track(task.cancel_handle());
        let outcome = task.await;

        run.finish(|state, _, current| {
            let batch = outcome?;
            if !current {
                return Err(Superseded.into());
            }
            let slots = state.media_mut(kind);
            for result in &batch.results {
                match slots.get_mut(result.index) {
                    Some(slot) => *slot = result.clone(),
                    None => warn!("Ignoring {} result for unknown index {}", kind, result.index),
                }
            }
            state.stage = Stage::Studio;
            info!("{}/{} {} item(s) succeeded", batch.success_count, batch.total, kind);
            Ok(batch)
        })
    }

    /// Regenerates a single media item in place.
    pub async fn retry_media(&self, kind: MediaKind, index: usize) -> Result<MediaResult> {
        let provider = match kind {
            MediaKind::Image => self.config.image_provider.clone(),
            MediaKind::Audio => self.config.tts_provider.clone(),
        };
        let voice = match kind {
            MediaKind::Image => None,
            MediaKind::Audio => self.config.voice.clone(),
        };

        let (request, run) = self.begin(
            Busy::media(kind),
            |state| {
                let content = require_content(state)?;
                let element = content
                    .visual_elements
                    .get(index)
                    .ok_or_else(|| anyhow!("No visual element at index {}", index))?;
                Ok(SingleMediaRequest {
                    scene: MediaItem::from_element(element),
                    index,
                    provider,
                    voice,
                    topic: state.selected_topic.as_ref().map(|t| t.title.clone()),
                })
            },
            |state, _| {
                if let Some(slot) = state.media_mut(kind).get_mut(index) {
                    *slot = MediaResult::empty(index);
                }
                state.video = None;
            },
        )?;

        debug!("Retrying {} item {}", kind, index);
        let outcome = match kind {
            MediaKind::Image => self.api.generate_single_image(&request).await,
            MediaKind::Audio => self.api.generate_single_audio(&request).await,
        };

        run.finish(|state, _, current| {
            if !current {
                outcome?;
                return Err(Superseded.into());
            }
            let slot = state.media_mut(kind).get_mut(index);
            match (outcome, slot) {
                (Ok(result), Some(slot)) => {
                    *slot = MediaResult { index, ..result };
                    Ok(slot.clone())
                }
                (Err(e), Some(slot)) => {
                    slot.error = Some(e.to_string());
                    Err(e)
                }
                (outcome, None) => outcome,
            }
        })
    }

    /// Stitches rendered images and narration into a video. Only available
    /// in video mode, once every item has both an image and an audio file.
    pub async fn compose_video<O>(&self, bgm_path: Option<String>, on_step: O) -> Result<VideoArtifact>
    where
        O: FnMut(Vec<ProgressStep>) + Send + 'static,
    {
        let bgm_volume = self.config.bgm_volume;
        let (request, mut run) = self.begin(
            Busy::Video,
            |state| {
                if state.mode != Mode::Video {
                    bail!("Video composition is only available in video mode");
                }
                let content = require_content(state)?;
                let image_paths: Option<Vec<String>> =
                    state.image_results.iter().map(|r| r.path.clone()).collect();
                let audio_paths: Option<Vec<String>> =
                    state.audio_results.iter().map(|r| r.path.clone()).collect();
                let (Some(image_paths), Some(audio_paths)) = (image_paths, audio_paths) else {
                    bail!("Every scene needs an image and an audio file first");
                };
                if image_paths.is_empty() {
                    bail!("Generated content has no scenes");
                }
                Ok(VideoRequest {
                    image_paths,
                    audio_paths,
                    scenes: content
                        .visual_elements
                        .iter()
                        .map(|e| SceneNarration {
                            narration: e.narration().to_string(),
                        })
                        .collect(),
                    bgm_path,
                    bgm_volume,
                    topic: state.selected_topic.as_ref().map(|t| t.title.clone()),
                })
            },
            |state, _| state.video = None,
        )?;

        info!("Composing video from {} scenes", request.image_paths.len());
        let api = self.api.clone();
        let task = self.simulator.run(
            progress::video_steps(),
            move || async move { api.create_video(&request).await },
            on_step,
        );
        run.track(task.cancel_handle());
        let outcome = task.await;

        run.finish(|state, _, current| {
            let artifact = outcome?;
            if !current {
                return Err(Superseded.into());
            }
            info!("Video ready at {} ({:.1}s)", artifact.video_path, artifact.duration);
            state.video = Some(artifact.clone());
            state.stage = Stage::Studio;
            Ok(artifact)
        })
    }
}
