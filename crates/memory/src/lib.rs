pub mod anchor;
pub mod consolidate;
pub mod emotion;
pub mod error;
pub mod index;
pub mod library;
pub mod profile;
pub mod queue;
pub mod reconstruct;
pub mod records;
pub mod response;
pub mod schedule;
pub mod schema;
pub mod semantic;
pub mod store;
pub mod working;

pub use anchor::{AnchorService, TimelineEntry};
pub use consolidate::{ConsolidationEngine, ConsolidationMode, ConsolidationReport};
pub use emotion::{ANCHOR_THRESHOLD, format_for_display, resonance};
pub use error::MemoryError;
pub use index::{IndexConfig, IndexKind, IndexedRow, QueryEmbeddingCache, SearchFilter, VectorIndex};
pub use library::{Library, LibraryDocument};
pub use profile::{ProfileManager, ProfileUpdate};
pub use queue::{BackgroundTask, TaskQueue, TaskStatus};
pub use reconstruct::{ContextReconstructor, FocusLevel, ReconstructedContext, ReconstructionTrace};
pub use records::{parse_note, parse_verbatim, render_note, render_verbatim};
pub use response::{
    MemoryAction, ParsedResponse, ResponseHandler, ResponseOutcome, parse_action_list,
    parse_structured,
};
pub use schedule::{ConsolidationScheduler, Schedule};
pub use schema::{
    ActionSource, EmotionalResonance, ExperientialNote, MomentKind, Reflection, ReflectionDepth,
    SemanticInsight, Valence, VerbatimRecord, new_record_id, record_id_timestamp, truncate_str,
};
pub use semantic::SemanticMemory;
pub use store::{CORE_COMPONENTS, MemoryStore, identity_components};
pub use working::{WorkingFile, WorkingMemory};
