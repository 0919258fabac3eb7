//! Session coordinator: the single owner of all memory state.
//!
//! One session owns one `memory_base_path` (enforced by an advisory lock
//! file) and serializes every write.  Each `chat()` turn runs the strict
//! pipeline: reconstruct → generate → ingest → working-memory update →
//! counter persist.  A failure at any step aborts the remainder of the turn;
//! prior steps stay persisted.
//!
//! There is no global state anywhere in the engine — everything mutable
//! lives here, and two sessions on different paths are fully independent.

pub mod metadata;
pub mod prompt;

use std::fs::File;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use fs2::FileExt;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use anima_config::AppConfig;
use anima_llm::{EmbeddingPort, GenerateOptions, LlmPort};
use anima_memory::consolidate::ConsolidationEngine;
use anima_memory::records::load_all_notes;
use anima_memory::response::ResponseHandler;
use anima_memory::schema::{ActionSource, ExperientialNote, Reflection, ReflectionDepth};
use anima_memory::{
    AnchorService, ConsolidationMode, ConsolidationReport, ConsolidationScheduler,
    ContextReconstructor, FocusLevel, IndexConfig, IndexKind, Library, LibraryDocument,
    MemoryStore, ProfileManager, QueryEmbeddingCache, ReconstructionTrace, SearchFilter,
    SemanticMemory, TaskQueue, VectorIndex, WorkingMemory,
};

pub use metadata::{METADATA_FILE, SessionEntry, SessionMetadata};

const LOCK_FILE: &str = ".lock";
const INDEX_FILE: &str = ".memory_index.redb";
const RECENT_TAIL: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    Running,
    Consolidating,
    Closed,
}

pub struct MemorySession {
    config: AppConfig,
    store: MemoryStore,
    working: WorkingMemory,
    semantic: SemanticMemory,
    library: Library,
    profiles: ProfileManager,
    anchors: AnchorService,
    consolidator: ConsolidationEngine,
    scheduler: ConsolidationScheduler,
    queue: TaskQueue,
    index: Option<VectorIndex>,
    index_config: IndexConfig,
    index_warned: bool,
    query_cache: QueryEmbeddingCache,
    llm: Arc<dyn LlmPort>,
    embedder: Option<Arc<dyn EmbeddingPort>>,
    metadata: SessionMetadata,
    session_id: String,
    session_started: chrono::DateTime<Utc>,
    session_interactions: u64,
    recent_turns: Vec<String>,
    last_trace: Option<ReconstructionTrace>,
    state: SessionState,
    _lock: File,
}

impl MemorySession {
    /// Open a session on `config.memory.base_path`.  Restores cumulative
    /// counters — a new session does not reset counts.  Fails when another
    /// session already holds the path.
    pub async fn open(
        config: AppConfig,
        llm: Arc<dyn LlmPort>,
        embedder: Option<Arc<dyn EmbeddingPort>>,
    ) -> Result<Self> {
        let store = MemoryStore::open(&config.memory.base_path)?;

        let lock = File::create(store.base().join(LOCK_FILE))
            .with_context(|| format!("creating lock file under {}", store.base().display()))?;
        if lock.try_lock_exclusive().is_err() {
            bail!(
                "another session owns {} - one writer per memory base path",
                store.base().display()
            );
        }

        let metadata = SessionMetadata::load(&store)?;

        let previous_flags = IndexConfig::load(&store)?;
        let mut index_config = previous_flags.clone();
        index_config.notes = config.memory.index_notes;
        index_config.verbatim = config.memory.index_verbatim;
        index_config.library = config.memory.index_library;
        index_config.save(&store)?;

        let index = match VectorIndex::open(store.base().join(INDEX_FILE)) {
            Ok(index) => Some(index),
            Err(err) => {
                warn!(%err, "vector index unavailable; session degrades to linear scans");
                None
            }
        };

        let scheduler = ConsolidationScheduler::load(store.clone())?;
        let queue = TaskQueue::load(store.clone(), config.memory.queue_max_attempts)?;

        let session_id = format!("session_{}", Uuid::new_v4().simple());
        let session = Self {
            working: WorkingMemory::with_cap(store.clone(), config.memory.working_cap),
            semantic: SemanticMemory::new(store.clone()),
            library: Library::new(store.clone()),
            profiles: ProfileManager::with_threshold(store.clone(), config.memory.profile_threshold),
            anchors: AnchorService::new(store.clone()),
            consolidator: ConsolidationEngine::new(store.clone()),
            scheduler,
            queue,
            index,
            index_config,
            index_warned: false,
            query_cache: QueryEmbeddingCache::default(),
            llm,
            embedder,
            metadata,
            session_id: session_id.clone(),
            session_started: Utc::now(),
            session_interactions: 0,
            recent_turns: Vec::new(),
            last_trace: None,
            state: SessionState::Initialized,
            _lock: lock,
            store,
            config,
        };
        info!(
            session_id,
            total_interactions = session.metadata.total_interactions,
            "session opened"
        );
        let mut session = session;

        // Enabling an index tier triggers a rebuild from the filesystem
        // authority (the index is only a cache of it).
        for kind in [IndexKind::Notes, IndexKind::Verbatim, IndexKind::Library] {
            if session.index_config.enabled(kind)
                && !previous_flags.enabled(kind)
                && session.index.is_some()
            {
                if let Err(err) = session.rebuild_index(kind).await {
                    warn!(%err, kind = kind.slug(), "rebuild after enabling tier failed");
                }
            }
        }

        session.state = SessionState::Running;
        Ok(session)
    }

    // ── Chat pipeline ──────────────────────────────────────────────────────

    /// One user turn through the full pipeline.  Returns the answer text.
    #[instrument(skip(self, user_input))]
    pub async fn chat(&mut self, user_input: &str, user_id: &str, location: &str) -> Result<String> {
        if self.state == SessionState::Closed {
            bail!("session is closed");
        }
        let now = Utc::now();

        // 1. Reconstruct context.
        let context = self.reconstruct_internal(user_id, user_input, location, FocusLevel::new(2)).await?;

        // 2-3. Compose the augmented prompt and call the LLM.  A transport
        // failure aborts here with nothing written.
        let full_prompt = prompt::compose(&context.rendered, user_input);
        let options = GenerateOptions {
            max_tokens: self.config.llm.max_tokens,
            temperature: self.config.llm.temperature,
            top_p: self.config.llm.top_p,
            repeat_penalty: self.config.llm.repeat_penalty,
            stop: Vec::new(),
        };
        let reply = self.llm.generate(&full_prompt, &options).await?;

        // 4. Ingest the structured response.
        let mut handler = ResponseHandler {
            store: &self.store,
            anchors: &self.anchors,
            working: &self.working,
            index: self.index.as_mut(),
            index_config: &self.index_config,
            embedder: self.embedder.as_deref(),
        };
        let outcome = handler
            .ingest(user_id, location, user_input, &reply.content, now)
            .await?;

        // A degraded turn keeps its verbatim but lost its memory actions;
        // queue a deferred extraction pass over the transcript.
        if outcome.degraded {
            self.queue.add(
                "fact_extraction",
                "re-extract memory actions from a degraded turn",
                serde_json::json!({
                    "verbatim_id": outcome.verbatim_id,
                    "user_id": user_id,
                }),
                now,
            )?;
        }

        // 5. Working memory snapshot.
        self.recent_turns.push(format!(
            "{user_id}: {} -> {}",
            truncate(user_input, 120),
            truncate(&outcome.answer, 160)
        ));
        if self.recent_turns.len() > RECENT_TAIL {
            let overflow = self.recent_turns.len() - RECENT_TAIL;
            self.recent_turns.drain(..overflow);
        }
        self.working.rewrite_current_context(
            user_id,
            location,
            user_input,
            &self.recent_turns,
            outcome.emotional_tone.as_deref().unwrap_or("neutral"),
            now,
        )?;

        // 6. Counters and the interval consolidation trigger.
        self.metadata.total_interactions += 1;
        self.session_interactions += 1;
        self.metadata.total_memories +=
            outcome.created_ids.len() as u64 + u64::from(outcome.note_id.is_some());

        let frequency = self.config.memory.consolidation_frequency;
        if frequency > 0 && self.metadata.total_interactions % frequency as u64 == 0 {
            self.state = SessionState::Consolidating;
            match self.consolidator.consolidate(self.llm.as_ref(), ConsolidationMode::Daily, now).await {
                Ok(report) => {
                    self.scheduler.mark_ran(ConsolidationMode::Daily, now)?;
                    info!(
                        updated = report.updated.values().filter(|v| **v).count(),
                        "interval consolidation complete"
                    );
                }
                Err(err) => warn!(%err, "interval consolidation failed; chat continues"),
            }
            self.state = SessionState::Running;
        }

        // 7. Profile refresh when the user's count crosses the threshold.
        let count = self.profiles.interaction_count(user_id)?;
        let threshold = self.profiles.threshold();
        if threshold > 0 && count >= threshold && count % threshold == 0 {
            if let Err(err) = self.profiles.update_profile(user_id, self.llm.as_ref(), now).await {
                warn!(%err, user_id, "profile update failed; chat continues");
            }
        }

        // 8. Persist session metadata.
        self.metadata.save(&self.store)?;

        // 9. Answer.
        Ok(outcome.answer)
    }

    // ── Tool surface ───────────────────────────────────────────────────────

    /// Store a fact through validation.  Returns `None` when rejected —
    /// a normal outcome, not an error.
    #[allow(clippy::too_many_arguments)]
    pub async fn remember_fact(
        &mut self,
        user_id: &str,
        content: &str,
        importance: f64,
        alignment_with_values: f64,
        reason: &str,
        emotion: Option<&str>,
        source: ActionSource,
        evidence: Option<&str>,
        links_to: &[String],
    ) -> Result<Option<String>> {
        let now = Utc::now();
        let mut handler = ResponseHandler {
            store: &self.store,
            anchors: &self.anchors,
            working: &self.working,
            index: self.index.as_mut(),
            index_config: &self.index_config,
            embedder: self.embedder.as_deref(),
        };
        let created = handler
            .remember_fact(
                user_id,
                content,
                importance,
                alignment_with_values,
                reason,
                emotion,
                source,
                evidence,
                links_to,
                None,
                now,
            )
            .await?;
        if created.is_some() {
            self.metadata.total_memories += 1;
            self.metadata.save(&self.store)?;
        }
        Ok(created)
    }

    /// Search experiential notes.  Uses the vector index when healthy; falls
    /// back to a linear lexical scan and warns exactly once per session when
    /// the index is gone.
    pub async fn search_memories(
        &mut self,
        query: &str,
        limit: usize,
        user_id: Option<&str>,
        min_intensity: Option<f64>,
    ) -> Result<Vec<ExperientialNote>> {
        let filter = SearchFilter {
            user_id: user_id.map(ToString::to_string),
            min_intensity,
            ..Default::default()
        };

        if self.index.is_none() {
            self.warn_degraded_once();
        }
        let vector = if self.index.is_some() {
            self.query_embedding(query).await
        } else {
            None
        };
        let mut search_error = None;
        let mut hits = Vec::new();
        if let (Some(index), Some(vector)) = (self.index.as_ref(), vector.as_deref()) {
            match index.search(IndexKind::Notes, vector, limit, &filter) {
                Ok(found) => hits = found,
                Err(err) => search_error = Some(err.to_string()),
            }
        }
        if let Some(err) = search_error {
            self.degrade_index(&err);
        }
        if !hits.is_empty() {
            let mut notes = Vec::new();
            for (id, _) in hits {
                if let Some(note) = anima_memory::records::find_note_by_id(&self.store, &id)? {
                    notes.push(note);
                }
            }
            if !notes.is_empty() {
                return Ok(notes);
            }
        }

        // Linear scan over the filesystem authority.
        let needle: Vec<String> = query
            .split_whitespace()
            .map(|term| term.to_lowercase())
            .filter(|term| term.len() >= 3)
            .collect();
        let mut notes: Vec<ExperientialNote> = load_all_notes(&self.store)?
            .into_iter()
            .filter(|note| {
                user_id.is_none_or(|u| note.user_id == u)
                    && min_intensity.is_none_or(|min| note.emotion.intensity >= min)
            })
            .filter(|note| {
                let content = note.content.to_lowercase();
                needle.is_empty() || needle.iter().any(|term| content.contains(term))
            })
            .collect();
        notes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        notes.truncate(limit);
        Ok(notes)
    }

    pub async fn search_library(
        &mut self,
        query: &str,
        limit: usize,
        content_types: &[String],
        tags: &[String],
    ) -> Result<Vec<LibraryDocument>> {
        let vector = if self.index.is_some() {
            self.query_embedding(query).await
        } else {
            None
        };
        let mut search_error = None;
        let mut hits = Vec::new();
        if let (Some(index), Some(vector)) = (self.index.as_ref(), vector.as_deref()) {
            let filter = SearchFilter { tags: tags.to_vec(), ..Default::default() };
            match index.search(IndexKind::Library, vector, limit, &filter) {
                Ok(found) => hits = found,
                Err(err) => search_error = Some(err.to_string()),
            }
        }
        if let Some(err) = search_error {
            self.degrade_index(&err);
        }
        if !hits.is_empty() {
            let mut docs = Vec::new();
            for (doc_id, _) in hits {
                if let Some(doc) = self.library.get(&doc_id)? {
                    if content_types.is_empty() || content_types.contains(&doc.meta.content_type) {
                        self.library.track_access(&doc_id, Some("search"), Utc::now())?;
                        docs.push(doc);
                    }
                }
            }
            return Ok(docs);
        }
        let docs = self.library.search_substring(query, limit, content_types, tags)?;
        for doc in &docs {
            self.library.track_access(&doc.meta.doc_id, Some("search"), Utc::now())?;
        }
        Ok(docs)
    }

    pub async fn reflect_on(&mut self, topic: &str, depth: ReflectionDepth) -> Result<Reflection> {
        self.consolidator
            .reflect_on(self.llm.as_ref(), topic, depth, Utc::now())
            .await
    }

    pub async fn capture_document(
        &mut self,
        source_path: &str,
        content: &str,
        content_type: &str,
        context: Option<&str>,
        tags: &[String],
    ) -> Result<String> {
        let now = Utc::now();
        let doc_id = self
            .library
            .capture(source_path, content, content_type, context, tags, now)?;
        // Opportunistic indexing keeps semantic library search warm.
        if self.index_config.enabled(IndexKind::Library) {
            let embedding = match self.embedder.as_deref() {
                Some(port) => port
                    .embed_texts(&[content.to_string()])
                    .await
                    .unwrap_or_default()
                    .pop()
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            if let Some(index) = self.index.as_mut() {
                let row = anima_memory::IndexedRow {
                    id: doc_id.clone(),
                    content_hash: MemoryStore::content_hash(content),
                    embedding,
                    timestamp: now,
                    user_id: None,
                    intensity: 0.0,
                    valence: None,
                    tags: tags.to_vec(),
                };
                if let Err(err) = index.add(IndexKind::Library, &row) {
                    warn!(%err, doc_id, "library index insert failed");
                }
            }
        }
        Ok(doc_id)
    }

    /// Public reconstruction entry point (tool surface and `/trace`).
    pub async fn reconstruct_context(
        &mut self,
        user_id: &str,
        query: &str,
        location: &str,
        focus_level: u8,
    ) -> Result<String> {
        let context = self
            .reconstruct_internal(user_id, query, location, FocusLevel::new(focus_level))
            .await?;
        self.metadata.save(&self.store)?;
        Ok(context.rendered)
    }

    // ── Maintenance surface ────────────────────────────────────────────────

    pub async fn consolidate_now(&mut self, mode: ConsolidationMode) -> Result<ConsolidationReport> {
        self.state = SessionState::Consolidating;
        let result = self
            .consolidator
            .consolidate(self.llm.as_ref(), mode, Utc::now())
            .await;
        self.state = SessionState::Running;
        let report = result?;
        self.scheduler.mark_ran(mode, Utc::now())?;
        Ok(report)
    }

    /// Run whichever scheduled consolidations are due.
    pub async fn check_scheduled_consolidation(&mut self) -> Result<Vec<ConsolidationMode>> {
        let due = self.scheduler.due_modes(Utc::now());
        let mut ran = Vec::new();
        for mode in due {
            self.consolidate_now(mode).await?;
            ran.push(mode);
        }
        Ok(ran)
    }

    /// Rebuild one index tier from the filesystem authority.
    pub async fn rebuild_index(&mut self, kind: IndexKind) -> Result<usize> {
        let Some(index) = self.index.as_mut() else {
            bail!("vector index unavailable; nothing to rebuild");
        };
        index.rebuild(kind, &self.store, self.embedder.as_deref()).await
    }

    pub fn queue(&mut self) -> &mut TaskQueue {
        &mut self.queue
    }

    /// Drain the background task queue.  Returns how many tasks completed;
    /// failures are recorded on the tasks and retried on later drains until
    /// their attempt cap.
    pub async fn run_background_tasks(&mut self) -> Result<usize> {
        let pending: Vec<_> = self.queue.queued().into_iter().cloned().collect();
        let mut completed = 0;
        for task in pending {
            let started = Utc::now();
            let outcome = match task.name.as_str() {
                "fact_extraction" => self.run_fact_extraction(&task).await,
                other => Err(anyhow::anyhow!("unknown task kind: {other}")),
            };
            let ok = outcome.is_ok();
            self.queue.record_attempt(&task.id, started, outcome)?;
            if ok {
                completed += 1;
            }
        }
        Ok(completed)
    }

    async fn run_fact_extraction(&mut self, task: &anima_memory::BackgroundTask) -> Result<()> {
        let user_id = task
            .parameters
            .get("user_id")
            .and_then(|v| v.as_str())
            .unwrap_or("user")
            .to_string();
        let verbatim_id = task
            .parameters
            .get("verbatim_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let records = anima_memory::records::load_user_verbatims(&self.store, &user_id)?;
        let Some(record) = records.into_iter().find(|r| r.id == verbatim_id) else {
            // The transcript is gone; nothing left to extract.
            return Ok(());
        };

        let extraction_prompt = format!(
            "Extract durable facts worth remembering from this exchange.\n\n\
             User: {}\n\
             Assistant: {}\n\n\
             Respond with JSON: {{\"memory_actions\": [{{\"action\": \"remember\", \
             \"content\": \"...\", \"importance\": 0.0-1.0, \
             \"alignment_with_values\": -1.0 to 1.0, \"reason\": \"...\", \
             \"source\": \"user_stated|ai_observed|ai_inferred\", \
             \"evidence\": \"what the user actually said\"}}]}}.\n\
             Use an empty array when nothing is worth keeping.",
            record.user_query, record.agent_response,
        );
        let reply = self.llm.generate(&extraction_prompt, &GenerateOptions::default()).await?;
        let actions = anima_memory::parse_action_list(&reply.content);

        let mut handler = ResponseHandler {
            store: &self.store,
            anchors: &self.anchors,
            working: &self.working,
            index: self.index.as_mut(),
            index_config: &self.index_config,
            embedder: self.embedder.as_deref(),
        };
        let now = Utc::now();
        let mut created = 0u64;
        for action in actions {
            if let anima_memory::MemoryAction::Remember {
                content,
                importance,
                alignment_with_values,
                reason,
                emotion,
                source,
                evidence,
                links_to,
                moment_kind,
            } = action
            {
                if handler
                    .remember_fact(
                        &user_id,
                        &content,
                        importance,
                        alignment_with_values,
                        &reason,
                        emotion.as_deref(),
                        source,
                        evidence.as_deref(),
                        &links_to,
                        moment_kind,
                        now,
                    )
                    .await?
                    .is_some()
                {
                    created += 1;
                }
            }
        }
        if created > 0 {
            self.metadata.total_memories += created;
            self.metadata.save(&self.store)?;
        }
        Ok(())
    }

    pub fn last_trace(&self) -> Option<&ReconstructionTrace> {
        self.last_trace.as_ref()
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn semantic(&self) -> &SemanticMemory {
        &self.semantic
    }

    /// Deterministic teardown: append the session history entry, persist
    /// metadata, and release the path lock.
    pub fn close(mut self) -> Result<()> {
        self.state = SessionState::Closed;
        self.metadata.sessions.push(SessionEntry {
            session_id: self.session_id.clone(),
            started: self.session_started,
            ended: Some(Utc::now()),
            interactions: self.session_interactions,
        });
        self.metadata.save(&self.store)?;
        let _ = fs2::FileExt::unlock(&self._lock);
        info!(session_id = %self.session_id, interactions = self.session_interactions, "session closed");
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────────────────

    async fn reconstruct_internal(
        &mut self,
        user_id: &str,
        query: &str,
        location: &str,
        focus: FocusLevel,
    ) -> Result<anima_memory::ReconstructedContext> {
        let mut reconstructor = ContextReconstructor {
            store: &self.store,
            index: self.index.as_ref(),
            embedder: self.embedder.as_deref(),
            query_cache: &mut self.query_cache,
            library: &self.library,
            profiles: &self.profiles,
            working: &self.working,
            anchors: &self.anchors,
        };
        let context = reconstructor.reconstruct(user_id, query, location, focus).await?;
        self.metadata.total_reconstructions += 1;
        self.last_trace = Some(context.trace.clone());
        Ok(context)
    }

    async fn query_embedding(&mut self, query: &str) -> Option<Vec<f32>> {
        if let Some(cached) = self.query_cache.get(query) {
            return Some(cached);
        }
        let port = self.embedder.as_deref()?;
        match port.embed_texts(&[query.to_string()]).await {
            Ok(mut vectors) => {
                let vector = vectors.pop()?;
                self.query_cache.put(query, vector.clone());
                Some(vector)
            }
            Err(_) => None,
        }
    }

    fn degrade_index(&mut self, reason: &str) {
        self.index = None;
        self.warn_degraded_once();
        tracing::debug!(reason, "index dropped for the rest of the session");
    }

    fn warn_degraded_once(&mut self) {
        if !self.index_warned {
            warn!("vector index unavailable; falling back to linear scans for this session");
            self.index_warned = true;
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect::<String>() + "..."
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::Result;
    use async_trait::async_trait;
    use uuid::Uuid;

    use anima_config::AppConfig;
    use anima_llm::{GenerateOptions, GenerateResponse, LlmPort};
    use anima_memory::schema::ActionSource;

    use super::{MemorySession, SessionMetadata, SessionState};

    /// Deterministic LLM stand-in: pops queued replies, repeats the last.
    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn one(reply: &str) -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(vec![reply.to_string()]) })
        }
    }

    #[async_trait]
    impl LlmPort for ScriptedLlm {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<GenerateResponse> {
            let mut replies = self.replies.lock().unwrap();
            let content = if replies.len() > 1 {
                replies.pop().unwrap()
            } else {
                replies.last().cloned().unwrap_or_default()
            };
            Ok(GenerateResponse { content })
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmPort for FailingLlm {
        async fn generate(&self, _p: &str, _o: &GenerateOptions) -> Result<GenerateResponse> {
            anyhow::bail!("connection refused")
        }
    }

    const PLAIN_REPLY: &str = r#"{
        "answer": "Hello. I do not know you yet, but I will remember this.",
        "experiential_note": "A first meeting; nothing to assume yet.",
        "emotional_resonance": {"importance": 0.3, "alignment_with_values": 0.2, "reason": "first contact"},
        "memory_actions": [],
        "unresolved_questions": []
    }"#;

    fn config_for(base: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.memory.base_path = base.display().to_string();
        // Keep interval consolidation out of the way unless a test wants it.
        config.memory.consolidation_frequency = 1000;
        config
    }

    fn temp_base(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("anima-session-{tag}-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn hello_does_not_hallucinate_preferences() {
        let base = temp_base("hello");
        let mut session =
            MemorySession::open(config_for(&base), ScriptedLlm::one(PLAIN_REPLY), None).await.unwrap();

        let answer = session.chat("hello", "alice", "terminal").await.unwrap();
        assert!(answer.starts_with("Hello."));

        let rejected = session
            .remember_fact(
                "alice",
                "User has interest in science fiction",
                0.8,
                0.9,
                "observed",
                None,
                ActionSource::AiObserved,
                Some(""),
                &[],
            )
            .await
            .unwrap();
        assert!(rejected.is_none(), "unsupported user claim must be rejected");

        // Profile is absent or a pure template.
        let profile_path = session.store().person_dir("alice").join("profile.md");
        if let Some(profile) = session.store().read_opt(&profile_path).unwrap() {
            assert!(profile.contains("Template"));
            assert!(!profile.contains("science fiction"));
        }
        session.close().unwrap();
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn session_continuity_restores_counters() {
        let base = temp_base("continuity");

        let mut first =
            MemorySession::open(config_for(&base), ScriptedLlm::one(PLAIN_REPLY), None).await.unwrap();
        for _ in 0..3 {
            first.chat("hello again", "alice", "terminal").await.unwrap();
        }
        assert_eq!(first.metadata().total_interactions, 3);
        first.close().unwrap();

        let mut second =
            MemorySession::open(config_for(&base), ScriptedLlm::one(PLAIN_REPLY), None).await.unwrap();
        assert_eq!(second.metadata().total_interactions, 3, "counters restore, never reset");
        second.chat("one more", "alice", "terminal").await.unwrap();
        assert_eq!(second.metadata().total_interactions, 4);
        second.close().unwrap();

        let store = anima_memory::MemoryStore::open(&base).unwrap();
        let metadata = SessionMetadata::load(&store).unwrap();
        assert_eq!(metadata.total_interactions, 4);
        assert_eq!(metadata.sessions.len(), 2);
        assert!(metadata.sessions.iter().all(|entry| entry.ended.is_some()));
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn second_session_on_same_path_is_refused() {
        let base = temp_base("lock");
        let session =
            MemorySession::open(config_for(&base), ScriptedLlm::one(PLAIN_REPLY), None).await.unwrap();
        let refused = MemorySession::open(config_for(&base), ScriptedLlm::one(PLAIN_REPLY), None).await;
        assert!(refused.is_err());
        session.close().unwrap();
        // After close the path is free again.
        let reopened =
            MemorySession::open(config_for(&base), ScriptedLlm::one(PLAIN_REPLY), None).await.unwrap();
        reopened.close().unwrap();
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn transport_failure_aborts_turn_without_writes() {
        let base = temp_base("transport");
        let mut session =
            MemorySession::open(config_for(&base), Arc::new(FailingLlm), None).await.unwrap();

        let result = session.chat("hello", "alice", "terminal").await;
        assert!(result.is_err());
        assert_eq!(session.metadata().total_interactions, 0);
        assert!(!session.store().verbatim_dir("alice").exists());
        session.close().unwrap();
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn broken_index_degrades_to_linear_scans() {
        let base = temp_base("degraded");
        // Occupy the index path with a directory so the redb open fails.
        std::fs::create_dir_all(base.join(super::INDEX_FILE)).unwrap();
        let mut session =
            MemorySession::open(config_for(&base), ScriptedLlm::one(PLAIN_REPLY), None).await.unwrap();

        session.chat("my project is about async runtimes", "alice", "terminal").await.unwrap();
        let hits = session.search_memories("meeting", 5, None, None).await.unwrap();
        assert_eq!(hits.len(), 1, "linear scan must still find the note");

        // A second search must not crash either.
        let again = session.search_memories("meeting", 5, None, None).await.unwrap();
        assert_eq!(again.len(), 1);
        session.close().unwrap();
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn chat_answer_comes_from_structured_reply() {
        let base = temp_base("answer");
        let reply_with_action = r#"{
            "answer": "Noted - milestone planning it is.",
            "experiential_note": "The user told me how they like to plan.",
            "emotional_resonance": {"importance": 0.7, "alignment_with_values": 0.6, "reason": "learning the user"},
            "memory_actions": [
                {"action": "remember",
                 "content": "User prefers milestone-based planning",
                 "importance": 0.7,
                 "alignment_with_values": 0.5,
                 "reason": "stated directly",
                 "source": "user_stated"}
            ],
            "unresolved_questions": ["Which milestone cadence suits them?"]
        }"#;
        let mut session =
            MemorySession::open(config_for(&base), ScriptedLlm::one(reply_with_action), None)
                .await
                .unwrap();

        let answer = session
            .chat("I like milestone-based planning", "bob", "office")
            .await
            .unwrap();
        assert_eq!(answer, "Noted - milestone planning it is.");

        // note + user_stated fact.
        assert_eq!(session.metadata().total_memories, 2);
        let facts = session.search_memories("milestone", 10, None, None).await.unwrap();
        assert!(!facts.is_empty());

        // The open question landed in working memory and current_context
        // reflects this turn.
        let working = session.store().read_opt(
            session.store().working_dir().join("unresolved.md"),
        ).unwrap().unwrap();
        assert!(working.contains("milestone cadence"));
        assert_eq!(session.state(), SessionState::Running);

        assert!(session.last_trace().is_some());
        session.close().unwrap();
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn degraded_turn_queues_deferred_extraction() {
        let base = temp_base("queue");
        let extraction_reply = r#"{"memory_actions": [
            {"action": "remember",
             "content": "User is building a game engine",
             "importance": 0.6,
             "alignment_with_values": 0.4,
             "reason": "stated project",
             "source": "user_stated"}
        ]}"#;
        // First reply is not JSON (degraded turn); second serves the
        // deferred extraction.
        let llm = Arc::new(ScriptedLlm {
            replies: Mutex::new(vec![
                extraction_reply.to_string(),
                "just plain prose, no structure".to_string(),
            ]),
        });
        let mut session = MemorySession::open(config_for(&base), llm, None).await.unwrap();

        session.chat("I'm building a game engine", "alice", "terminal").await.unwrap();
        assert_eq!(session.queue().queued().len(), 1);
        // A degraded turn writes no note and no actions.
        assert_eq!(session.metadata().total_memories, 0);

        let completed = session.run_background_tasks().await.unwrap();
        assert_eq!(completed, 1);
        assert!(session.queue().queued().is_empty());
        assert_eq!(session.metadata().total_memories, 1);

        let facts = session.search_memories("game engine", 5, None, None).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert!(facts[0].content.contains("game engine"));
        session.close().unwrap();
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn capture_and_search_library_through_session() {
        let base = temp_base("library");
        let mut session =
            MemorySession::open(config_for(&base), ScriptedLlm::one(PLAIN_REPLY), None).await.unwrap();

        let doc_id = session
            .capture_document("/docs/tokio.md", "tokio task scheduling notes", "markdown", None, &[])
            .await
            .unwrap();
        let hits = session.search_library("scheduling", 5, &[], &[]).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta.doc_id, doc_id);
        session.close().unwrap();
        let _ = std::fs::remove_dir_all(&base);
    }
}
