//! Runs resolve, prepare, generate and apply for one material at a time.
//!
//! A run is split in two halves so the network part can move to a worker thread:
//! [`Orchestrator::plan`] and [`Orchestrator::execute`] only read the graph, and
//! [`Orchestrator::apply`] mutates it on the caller's thread. The material key stays
//! claimed from `plan` until the outcome has been applied or dropped, and each claim carries
//! its own cancel flag.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::applier::{ApplyReport, apply_maps};
use crate::client::GenerationClient;
use crate::dsl::MaterialDocument;
use crate::error::{ErrorClass, ErrorRecord, PipelineResult};
use crate::graph::{GraphMutation, GraphQuery};
use crate::protocol::{GenerationOptions, GenerationRequest, GenerationResult, MapSelection};
use crate::resolver::{Resolution, resolve_base_texture};
use crate::settings::{CredentialStore, GenerationSettings};
use crate::temp_store::TempStore;
use crate::transport::{DEFAULT_MAX_BYTES, prepare_image};

/// Identity of a material slot: the owning object and the material on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialKey {
    pub object: String,
    pub material: String,
}

impl MaterialKey {
    pub fn new(object: impl Into<String>, material: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            material: material.into(),
        }
    }

    /// Key from document metadata; missing ids fall back to the document name.
    pub fn for_document(doc: &MaterialDocument) -> Self {
        let name = &doc.metadata.name;
        Self::new(
            doc.metadata.object_id.as_deref().unwrap_or(name),
            doc.metadata.material_id.as_deref().unwrap_or(name),
        )
    }
}

impl std::fmt::Display for MaterialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.object, self.material)
    }
}

/// Progress on a 0..=100 scale.
pub trait ProgressSink {
    fn begin(&self) {}
    fn update(&self, percent: u8);
    fn end(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _percent: u8) {}
}

/// Reports progress through the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn update(&self, percent: u8) {
        info!(percent, "progress");
    }
}

struct ProgressScope<'a> {
    sink: &'a dyn ProgressSink,
}

impl<'a> ProgressScope<'a> {
    fn begin(sink: &'a dyn ProgressSink) -> Self {
        sink.begin();
        Self { sink }
    }
}

impl Drop for ProgressScope<'_> {
    fn drop(&mut self) {
        self.sink.end();
    }
}

type KeySet = Arc<Mutex<HashSet<MaterialKey>>>;
/// Running materials and their cancel flags.
type RunMap = Arc<Mutex<HashMap<MaterialKey, Arc<AtomicBool>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Claim on a material key; released on drop.
#[derive(Debug)]
struct InFlight {
    runs: RunMap,
    key: MaterialKey,
    cancelled: Arc<AtomicBool>,
}

impl InFlight {
    fn check_cancelled(&self) -> PipelineResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ErrorRecord::new(ErrorClass::Cancelled, "Generation cancelled."));
        }
        Ok(())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.runs).remove(&self.key);
        debug!(key = %self.key, "released material");
    }
}

/// Validated inputs for one generation, holding the material claim.
#[derive(Debug)]
pub struct FetchPlan {
    pub key: MaterialKey,
    pub source: PathBuf,
    pub auto_resolved: bool,
    pub api_key: String,
    pub kinds: MapSelection,
    pub options: GenerationOptions,
    claim: InFlight,
}

/// Service response for a plan, not yet applied.
#[derive(Debug)]
pub struct FetchOutcome {
    pub key: MaterialKey,
    pub source: PathBuf,
    pub auto_resolved: bool,
    pub payload_bytes: usize,
    pub recompressed: bool,
    pub kinds: MapSelection,
    pub result: GenerationResult,
    claim: InFlight,
}

#[derive(Debug)]
pub enum FetchEvent {
    Progress(u8),
    Finished(PipelineResult<FetchOutcome>),
}

struct ChannelProgress(Sender<FetchEvent>);

impl ProgressSink for ChannelProgress {
    fn update(&self, percent: u8) {
        // The receiver may have hung up; the outcome is then simply dropped.
        let _ = self.0.send(FetchEvent::Progress(percent));
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub key: MaterialKey,
    pub source: PathBuf,
    pub auto_resolved: bool,
    pub payload_bytes: usize,
    pub recompressed: bool,
    pub apply: ApplyReport,
    pub usage: Option<serde_json::Value>,
}

/// Per-session pipeline state. Clones share the same session.
#[derive(Clone)]
pub struct Orchestrator {
    client: GenerationClient,
    max_bytes: usize,
    in_flight: RunMap,
    auto_load: KeySet,
    temp: TempStore,
}

impl Orchestrator {
    pub fn new(client: GenerationClient) -> anyhow::Result<Self> {
        Ok(Self {
            client,
            max_bytes: DEFAULT_MAX_BYTES,
            in_flight: Arc::default(),
            auto_load: Arc::default(),
            temp: TempStore::new()?,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Session temp files (materialized packed images).
    pub fn temp_store(&self) -> &TempStore {
        &self.temp
    }

    pub fn is_in_flight(&self, key: &MaterialKey) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    /// Ask the run on `key` to stop at its next stage boundary. `false` if none is running.
    pub fn cancel(&self, key: &MaterialKey) -> bool {
        let runs = lock(&self.in_flight);
        let Some(flag) = runs.get(key) else {
            return false;
        };
        info!(key = %key, "cancellation requested");
        flag.store(true, Ordering::SeqCst);
        true
    }

    /// Cancel every run of this session.
    pub fn cancel_all(&self) {
        let runs = lock(&self.in_flight);
        info!(runs = runs.len(), "cancelling all runs");
        for flag in runs.values() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Resolve, prepare, generate and apply in one call on the current thread.
    pub fn run<G>(
        &self,
        key: &MaterialKey,
        graph: &mut G,
        settings: &mut GenerationSettings,
        credentials: &dyn CredentialStore,
        progress: &dyn ProgressSink,
    ) -> PipelineResult<RunReport>
    where
        G: GraphQuery + GraphMutation,
    {
        let _scope = ProgressScope::begin(progress);
        let outcome = self
            .plan(key, &*graph, settings, credentials)
            .and_then(|plan| self.execute(plan, progress))
            .and_then(|outcome| self.apply(graph, outcome, progress));
        match &outcome {
            Ok(report) => info!(
                key = %report.key,
                applied = report.apply.applied.len(),
                warnings = report.apply.warnings.len(),
                "PBR maps generated"
            ),
            Err(e) => error!(key = %key, class = %e.class, code = e.code, message = %e.message, "generation failed"),
        }
        outcome
    }

    /// Local checks and source resolution. Claims `key` for the lifetime of the plan.
    pub fn plan(
        &self,
        key: &MaterialKey,
        graph: &dyn GraphQuery,
        settings: &mut GenerationSettings,
        credentials: &dyn CredentialStore,
    ) -> PipelineResult<FetchPlan> {
        let Some(api_key) = credentials.api_key() else {
            return Err(ErrorRecord::new(
                ErrorClass::HttpUnauthorized,
                "Please enter your API key.",
            ));
        };
        let kinds = settings.selection();
        if kinds.is_empty() {
            return Err(ErrorRecord::new(
                ErrorClass::HttpBadRequest,
                "Please select at least one texture type to generate.",
            ));
        }

        let claim = {
            let mut runs = lock(&self.in_flight);
            if runs.contains_key(key) {
                return Err(ErrorRecord::new(
                    ErrorClass::Busy,
                    format!("Generation already running for {key}."),
                ));
            }
            let cancelled = Arc::new(AtomicBool::new(false));
            runs.insert(key.clone(), cancelled.clone());
            InFlight {
                runs: self.in_flight.clone(),
                key: key.clone(),
                cancelled,
            }
        };

        let mut auto_resolved = false;
        let mut source = settings.base_texture().filter(|p| p.is_file());
        if settings.base_texture().is_none() {
            match resolve_base_texture(graph, &self.temp) {
                Ok(Resolution::Found(img)) if img.path.is_file() => {
                    info!(path = %img.path.display(), "using base texture from material");
                    // Settings only keep paths that outlive the session.
                    if !img.materialized {
                        settings.base_texture_path = img.path.display().to_string();
                    }
                    source = Some(img.path);
                    auto_resolved = true;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        key = %key,
                        error = %format!("{e:#}"),
                        "could not read base texture from material"
                    );
                }
            }
        }
        let Some(source) = source else {
            return Err(ErrorRecord::not_found(
                "No valid base texture file selected, and none found in the material.",
            ));
        };

        Ok(FetchPlan {
            key: key.clone(),
            source,
            auto_resolved,
            api_key,
            kinds,
            options: settings.sanitized().options,
            claim,
        })
    }

    /// Prepare the image and call the service. Touches no graph, so it may run on any thread.
    pub fn execute(
        &self,
        plan: FetchPlan,
        progress: &dyn ProgressSink,
    ) -> PipelineResult<FetchOutcome> {
        progress.update(5);
        plan.claim.check_cancelled()?;
        let payload = prepare_image(&plan.source, self.max_bytes)?;
        progress.update(10);
        plan.claim.check_cancelled()?;

        let request = GenerationRequest {
            payload,
            kinds: plan.kinds.clone(),
            options: plan.options,
        };
        progress.update(15);
        let result = self.client.generate(&request, &plan.api_key)?;
        progress.update(30);
        plan.claim.check_cancelled()?;
        progress.update(40);

        Ok(FetchOutcome {
            key: plan.key,
            source: plan.source,
            auto_resolved: plan.auto_resolved,
            payload_bytes: request.payload.len(),
            recompressed: request.payload.recompressed,
            kinds: plan.kinds,
            result,
            claim: plan.claim,
        })
    }

    /// [`Self::plan`] then [`Self::execute`] on the current thread.
    pub fn fetch(
        &self,
        key: &MaterialKey,
        graph: &dyn GraphQuery,
        settings: &mut GenerationSettings,
        credentials: &dyn CredentialStore,
        progress: &dyn ProgressSink,
    ) -> PipelineResult<FetchOutcome> {
        let plan = self.plan(key, graph, settings, credentials)?;
        self.execute(plan, progress)
    }

    /// Run [`Self::execute`] on a worker thread, streaming progress then the outcome.
    pub fn spawn_fetch(&self, plan: FetchPlan) -> Receiver<FetchEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let this = self.clone();
        std::thread::spawn(move || {
            let sink = ChannelProgress(tx.clone());
            let outcome = this.execute(plan, &sink);
            let _ = tx.send(FetchEvent::Finished(outcome));
        });
        rx
    }

    /// Bind a fetched result into the graph. Releases the material claim when done.
    pub fn apply(
        &self,
        graph: &mut dyn GraphMutation,
        outcome: FetchOutcome,
        progress: &dyn ProgressSink,
    ) -> PipelineResult<RunReport> {
        outcome.claim.check_cancelled()?;
        let run_temp = TempStore::new()?;
        let applied = apply_maps(
            graph,
            Some(&outcome.source),
            &outcome.result,
            &outcome.kinds,
            &run_temp,
        );
        progress.update(60);
        run_temp.cleanup();
        let apply = applied?;
        for w in &apply.warnings {
            warn!(kind = ?w.kind, message = %w.message, "map warning");
        }
        progress.update(100);

        let FetchOutcome {
            key,
            source,
            auto_resolved,
            payload_bytes,
            recompressed,
            result,
            claim,
            ..
        } = outcome;
        drop(claim);
        Ok(RunReport {
            key,
            source,
            auto_resolved,
            payload_bytes,
            recompressed,
            apply,
            usage: result.usage,
        })
    }

    /// Register an auto-load attempt; `false` if one is already pending for `key`.
    pub fn request_auto_load(&self, key: &MaterialKey) -> bool {
        lock(&self.auto_load).insert(key.clone())
    }

    /// Detect the material's base texture and store it in `settings` when it is a real file.
    ///
    /// Packed images are not stored; a run resolves them again from the material.
    ///
    /// Always clears the pending auto-load entry for `key`. Misses are not errors.
    pub fn auto_load_texture(
        &self,
        key: &MaterialKey,
        graph: &dyn GraphQuery,
        settings: &mut GenerationSettings,
    ) -> Option<PathBuf> {
        let resolved = resolve_base_texture(graph, &self.temp);
        lock(&self.auto_load).remove(key);
        match resolved {
            Ok(Resolution::Found(img)) if img.path.is_file() && !img.materialized => {
                settings.base_texture_path = img.path.display().to_string();
                debug!(key = %key, path = %img.path.display(), "auto-loaded base texture");
                Some(img.path)
            }
            Ok(Resolution::Found(_)) => None,
            Ok(Resolution::NotFound(reason)) => {
                debug!(key = %key, ?reason, "no base texture to auto-load");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %format!("{e:#}"), "auto-load failed");
                None
            }
        }
    }

    /// Delete session temp files. Also happens when the last clone is dropped.
    pub fn cleanup(&self) {
        self.temp.cleanup();
    }
}
