//! Conversation-facing side: routing, intent synthesis and the orchestrator
//! that sequences them against the ledger and tool gateway.

pub mod intent;
pub mod orchestrator;
mod prompts;
pub mod router;

pub use intent::{IntentSynthesizer, SynthesizedIntent};
pub use orchestrator::{Orchestrator, OrchestratorOutcome};
pub use router::{ConversationMessage, Role, Router, RouterAction, RouterDecision};
