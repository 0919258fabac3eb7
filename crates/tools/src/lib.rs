//! Memory tool surface.
//!
//! Exactly six tools, fixed by the engine's contract: remember a fact,
//! search memories, search the library, reflect on a topic, capture a
//! document, reconstruct context.  The set never grows at runtime, so there
//! is no pluggable machinery here — a [`MemoryTool`] enum names the tools,
//! their specs are static data, and dispatch is one `match`.  Whatever
//! harness drives the LLM's tool calls (ReAct or otherwise) is a client of
//! [`MemoryToolbox`]; the engine exposes tools, it runs no loops.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde::Serialize;
use tokio::sync::Mutex;

use anima_memory::schema::{ActionSource, ReflectionDepth};
use anima_session::MemorySession;

/// One argument a tool accepts, as advertised to the LLM.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ToolParam {
    pub name: &'static str,
    pub hint: &'static str,
    pub required: bool,
}

/// Name, purpose, and argument list of one tool.  With a closed tool set
/// these are compile-time constants, not runtime state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub purpose: &'static str,
    pub params: &'static [ToolParam],
}

/// Text handed back to the LLM after a call.  `ok = false` is an expected
/// refusal (a validation rejection, an empty result set is still `ok`);
/// transport and I/O failures surface as `Err` instead.
#[derive(Debug, Clone, Serialize)]
pub struct ToolReply {
    pub ok: bool,
    pub text: String,
}

const fn p(name: &'static str, hint: &'static str, required: bool) -> ToolParam {
    ToolParam { name, hint, required }
}

const REMEMBER_FACT_PARAMS: &[ToolParam] = &[
    p("content", "the fact to remember", true),
    p("importance", "0.0-1.0 significance", true),
    p("alignment_with_values", "-1.0 to 1.0 value alignment", true),
    p("reason", "why this matters", true),
    p("emotion", "emotion label", false),
    p("source", "user_stated|ai_observed|ai_inferred|ai_reflection", true),
    p("evidence", "what the user actually said", false),
    p("user_id", "user this relates to", false),
    p("links_to", "comma-separated record ids", false),
];

const SEARCH_MEMORIES_PARAMS: &[ToolParam] = &[
    p("query", "what to search for", true),
    p("limit", "max results (default 5)", false),
    p("user_id", "filter by user", false),
    p("min_intensity", "minimum emotion intensity 0.0-1.0", false),
];

const SEARCH_LIBRARY_PARAMS: &[ToolParam] = &[
    p("query", "what to search for", true),
    p("limit", "max results (default 5)", false),
    p("content_types", "comma-separated type filter", false),
    p("tags", "comma-separated tag filter", false),
];

const REFLECT_ON_PARAMS: &[ToolParam] = &[
    p("topic", "topic to reflect on", true),
    p("depth", "shallow|deep|exhaustive (default deep)", false),
];

const CAPTURE_DOCUMENT_PARAMS: &[ToolParam] = &[
    p("source_path", "origin of the content", true),
    p("content", "the content itself", true),
    p("content_type", "markdown|text|code|...", true),
    p("context", "why this was captured", false),
    p("tags", "comma-separated tags", false),
];

const RECONSTRUCT_CONTEXT_PARAMS: &[ToolParam] = &[
    p("user_id", "user to reconstruct for", true),
    p("query", "the query driving retrieval", true),
    p("location", "current location tag", false),
    p("focus_level", "0-5 breadth control (default 2)", false),
];

/// The closed set of memory tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTool {
    RememberFact,
    SearchMemories,
    SearchLibrary,
    ReflectOn,
    CaptureDocument,
    ReconstructContext,
}

impl MemoryTool {
    pub const ALL: [MemoryTool; 6] = [
        MemoryTool::RememberFact,
        MemoryTool::SearchMemories,
        MemoryTool::SearchLibrary,
        MemoryTool::ReflectOn,
        MemoryTool::CaptureDocument,
        MemoryTool::ReconstructContext,
    ];

    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.spec().name == name)
    }

    pub fn spec(&self) -> ToolSpec {
        match self {
            MemoryTool::RememberFact => ToolSpec {
                name: "remember_fact",
                purpose: "Store an important fact with emotional weighting. \
                          Claims about a user need evidence unless user_stated.",
                params: REMEMBER_FACT_PARAMS,
            },
            MemoryTool::SearchMemories => ToolSpec {
                name: "search_memories",
                purpose: "Search experiential memory; returns full note contents.",
                params: SEARCH_MEMORIES_PARAMS,
            },
            MemoryTool::SearchLibrary => ToolSpec {
                name: "search_library",
                purpose: "Search captured documents; returns excerpts.",
                params: SEARCH_LIBRARY_PARAMS,
            },
            MemoryTool::ReflectOn => ToolSpec {
                name: "reflect_on",
                purpose: "Reflect on a topic across accumulated memories.",
                params: REFLECT_ON_PARAMS,
            },
            MemoryTool::CaptureDocument => ToolSpec {
                name: "capture_document",
                purpose: "Capture external content into the library.",
                params: CAPTURE_DOCUMENT_PARAMS,
            },
            MemoryTool::ReconstructContext => ToolSpec {
                name: "reconstruct_context",
                purpose: "Run the full context reconstruction pipeline.",
                params: RECONSTRUCT_CONTEXT_PARAMS,
            },
        }
    }
}

/// Shared handle a toolbox operates through.
pub type SessionHandle = Arc<Mutex<MemorySession>>;

/// All six tools bound to one session.
pub struct MemoryToolbox {
    session: SessionHandle,
}

impl MemoryToolbox {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }

    /// Specs for every tool, in the order the LLM should see them.
    pub fn specs(&self) -> Vec<ToolSpec> {
        MemoryTool::ALL.iter().map(MemoryTool::spec).collect()
    }

    /// Dispatch by tool name, as it arrives in an LLM tool call.
    pub async fn invoke_by_name(
        &self,
        name: &str,
        args: &HashMap<String, String>,
    ) -> Result<ToolReply> {
        let Some(tool) = MemoryTool::from_name(name) else {
            bail!("unknown tool: {name}");
        };
        self.invoke(tool, args).await
    }

    pub async fn invoke(&self, tool: MemoryTool, args: &HashMap<String, String>) -> Result<ToolReply> {
        match tool {
            MemoryTool::RememberFact => self.remember_fact(args).await,
            MemoryTool::SearchMemories => self.search_memories(args).await,
            MemoryTool::SearchLibrary => self.search_library(args).await,
            MemoryTool::ReflectOn => self.reflect_on(args).await,
            MemoryTool::CaptureDocument => self.capture_document(args).await,
            MemoryTool::ReconstructContext => self.reconstruct_context(args).await,
        }
    }

    async fn remember_fact(&self, args: &HashMap<String, String>) -> Result<ToolReply> {
        let content = require(args, "content")?;
        let importance: f64 = require(args, "importance")?.parse().unwrap_or(0.5);
        let alignment: f64 = arg(args, "alignment_with_values")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let reason = arg(args, "reason").unwrap_or("");
        let links: Vec<String> = csv(args, "links_to");
        let user_id = arg(args, "user_id").unwrap_or("user").to_string();

        let mut session = self.session.lock().await;
        let created = session
            .remember_fact(
                &user_id,
                content,
                importance,
                alignment,
                reason,
                arg(args, "emotion"),
                parse_source(arg(args, "source")),
                arg(args, "evidence"),
                &links,
            )
            .await?;

        Ok(match created {
            Some(id) => ToolReply {
                ok: true,
                text: format!("remembered as {id}"),
            },
            None => ToolReply {
                ok: false,
                text: "rejected: claims about a user need evidence unless user_stated".to_string(),
            },
        })
    }

    async fn search_memories(&self, args: &HashMap<String, String>) -> Result<ToolReply> {
        let query = require(args, "query")?;
        let limit: usize = arg(args, "limit").and_then(|v| v.parse().ok()).unwrap_or(5);
        let min_intensity = arg(args, "min_intensity").and_then(|v| v.parse().ok());

        let mut session = self.session.lock().await;
        let notes = session
            .search_memories(query, limit, arg(args, "user_id"), min_intensity)
            .await?;

        if notes.is_empty() {
            return Ok(ToolReply {
                ok: true,
                text: format!("no memories found for '{query}'"),
            });
        }
        let mut text = format!("found {} memories for '{query}':\n", notes.len());
        for note in notes {
            text.push_str(&format!(
                "- {} ({}, intensity {:.2}): {}\n",
                note.id,
                note.timestamp.format("%Y-%m-%d"),
                note.emotion.intensity,
                note.content,
            ));
        }
        Ok(ToolReply { ok: true, text })
    }

    async fn search_library(&self, args: &HashMap<String, String>) -> Result<ToolReply> {
        let query = require(args, "query")?;
        let limit: usize = arg(args, "limit").and_then(|v| v.parse().ok()).unwrap_or(5);

        let mut session = self.session.lock().await;
        let docs = session
            .search_library(query, limit, &csv(args, "content_types"), &csv(args, "tags"))
            .await?;

        if docs.is_empty() {
            return Ok(ToolReply {
                ok: true,
                text: format!("no documents found for '{query}'"),
            });
        }
        let mut text = format!("found {} documents:\n", docs.len());
        for doc in docs {
            let excerpt: String = doc.content.chars().take(500).collect();
            text.push_str(&format!(
                "- {} ({}): {excerpt}\n",
                doc.meta.doc_id, doc.meta.source_path,
            ));
        }
        Ok(ToolReply { ok: true, text })
    }

    async fn reflect_on(&self, args: &HashMap<String, String>) -> Result<ToolReply> {
        let topic = require(args, "topic")?;
        let depth = match arg(args, "depth").unwrap_or("deep") {
            "shallow" => ReflectionDepth::Shallow,
            "exhaustive" => ReflectionDepth::Exhaustive,
            _ => ReflectionDepth::Deep,
        };

        let mut session = self.session.lock().await;
        let reflection = session.reflect_on(topic, depth).await?;
        let mut text = format!(
            "reflection {} on '{}' (confidence {:.2})\n",
            reflection.id, reflection.topic, reflection.confidence,
        );
        for insight in &reflection.insights {
            text.push_str(&format!("- insight: {insight}\n"));
        }
        for contradiction in &reflection.contradictions {
            text.push_str(&format!("- contradiction: {contradiction}\n"));
        }
        text.push_str(&reflection.evolution_narrative);
        Ok(ToolReply { ok: true, text })
    }

    async fn capture_document(&self, args: &HashMap<String, String>) -> Result<ToolReply> {
        let source_path = require(args, "source_path")?;
        let content = require(args, "content")?;
        let content_type = arg(args, "content_type").unwrap_or("text");

        let mut session = self.session.lock().await;
        let doc_id = session
            .capture_document(
                source_path,
                content,
                content_type,
                arg(args, "context"),
                &csv(args, "tags"),
            )
            .await?;
        Ok(ToolReply {
            ok: true,
            text: format!("captured as {doc_id}"),
        })
    }

    async fn reconstruct_context(&self, args: &HashMap<String, String>) -> Result<ToolReply> {
        let user_id = require(args, "user_id")?;
        let query = require(args, "query")?;
        let location = arg(args, "location").unwrap_or("terminal");
        let focus: u8 = arg(args, "focus_level").and_then(|v| v.parse().ok()).unwrap_or(2);

        let mut session = self.session.lock().await;
        let context = session.reconstruct_context(user_id, query, location, focus).await?;
        Ok(ToolReply { ok: true, text: context })
    }
}

// ── Argument helpers ─────────────────────────────────────────────────────────

fn arg<'a>(args: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    args.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn require<'a>(args: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    arg(args, key).ok_or_else(|| anyhow::anyhow!("missing required argument: {key}"))
}

fn csv(args: &HashMap<String, String>, key: &str) -> Vec<String> {
    arg(args, key)
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

fn parse_source(raw: Option<&str>) -> ActionSource {
    match raw.unwrap_or("ai_observed") {
        "user_stated" => ActionSource::UserStated,
        "ai_inferred" => ActionSource::AiInferred,
        "ai_reflection" => ActionSource::AiReflection,
        _ => ActionSource::AiObserved,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use anima_config::AppConfig;
    use anima_llm::{GenerateOptions, GenerateResponse, LlmPort};
    use anima_session::MemorySession;

    use super::{MemoryTool, MemoryToolbox};

    struct EchoLlm;

    #[async_trait]
    impl LlmPort for EchoLlm {
        async fn generate(&self, _p: &str, _o: &GenerateOptions) -> Result<GenerateResponse> {
            Ok(GenerateResponse {
                content: r#"{"insights": ["i"], "patterns": [], "summary": "s",
                             "contradictions": [], "evolution_narrative": "n",
                             "confidence": 0.5}"#
                    .to_string(),
            })
        }
    }

    async fn toolbox() -> (std::path::PathBuf, MemoryToolbox) {
        let base = std::env::temp_dir().join(format!("anima-tools-{}", Uuid::new_v4()));
        let mut config = AppConfig::default();
        config.memory.base_path = base.display().to_string();
        let session = MemorySession::open(config, Arc::new(EchoLlm), None).await.unwrap();
        (base, MemoryToolbox::new(Arc::new(Mutex::new(session))))
    }

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn the_six_tools_resolve_by_name() {
        let (base, toolbox) = toolbox().await;
        let names: Vec<&str> = toolbox.specs().iter().map(|spec| spec.name).collect();
        assert_eq!(
            names,
            vec![
                "remember_fact",
                "search_memories",
                "search_library",
                "reflect_on",
                "capture_document",
                "reconstruct_context",
            ]
        );
        for name in names {
            assert!(MemoryTool::from_name(name).is_some());
        }
        assert!(MemoryTool::from_name("unknown").is_none());
        let refused = toolbox.invoke_by_name("unknown", &HashMap::new()).await;
        assert!(refused.is_err());
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn remember_then_search_round_trip() {
        let (base, toolbox) = toolbox().await;

        let remembered = toolbox
            .invoke(
                MemoryTool::RememberFact,
                &args(&[
                    ("content", "The build pipeline caches dependencies"),
                    ("importance", "0.6"),
                    ("alignment_with_values", "0.4"),
                    ("reason", "recurring workflow detail"),
                    ("source", "ai_reflection"),
                ]),
            )
            .await
            .unwrap();
        assert!(remembered.ok);
        assert!(remembered.text.contains("fact_"));

        let found = toolbox
            .invoke(MemoryTool::SearchMemories, &args(&[("query", "pipeline caches")]))
            .await
            .unwrap();
        assert!(found.ok);
        assert!(found.text.contains("caches dependencies"));
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn unsupported_user_claim_is_rejected_through_the_tool() {
        let (base, toolbox) = toolbox().await;

        let rejected = toolbox
            .invoke(
                MemoryTool::RememberFact,
                &args(&[
                    ("content", "User has interest in science fiction"),
                    ("importance", "0.8"),
                    ("alignment_with_values", "0.9"),
                    ("reason", "guess"),
                    ("source", "ai_observed"),
                    ("user_id", "alice"),
                ]),
            )
            .await
            .unwrap();
        assert!(!rejected.ok);
        assert!(rejected.text.contains("rejected"));
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn capture_and_reconstruct_through_tools() {
        let (base, toolbox) = toolbox().await;

        let captured = toolbox
            .invoke(
                MemoryTool::CaptureDocument,
                &args(&[
                    ("source_path", "/docs/design.md"),
                    ("content", "retrieval is reconstruction, not playback"),
                    ("content_type", "markdown"),
                ]),
            )
            .await
            .unwrap();
        assert!(captured.ok);

        let context = toolbox
            .invoke(
                MemoryTool::ReconstructContext,
                &args(&[
                    ("user_id", "alice"),
                    ("query", "retrieval reconstruction"),
                    ("focus_level", "1"),
                ]),
            )
            .await
            .unwrap();
        assert!(context.ok);
        assert!(context.text.contains("[Core Identity]"));
        assert!(context.text.contains("[Relevant Documents]"));
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn missing_required_argument_errors() {
        let (base, toolbox) = toolbox().await;
        let result = toolbox.invoke(MemoryTool::SearchMemories, &HashMap::new()).await;
        assert!(result.is_err());
        let _ = std::fs::remove_dir_all(&base);
    }
}
