//! Agent harness: prompt packs, redaction, record/replay cassettes, output
//! guards and per-job LLM budgets around deterministic agent producers.

pub mod agents;
pub mod cassette;
pub mod guards;
pub mod harness;
pub mod promptpack;
pub mod provider;
pub mod redaction;
pub mod usage;

pub use agents::{AgentKind, STRATEGY_TEMPLATES};
pub use harness::{run_agent, run_agent_with_budget, AgentRunRequest, AgentRunResult, AGENT_RUN_FILE};
pub use provider::{check_provider_id, LlmEnv, LlmMode};
pub use usage::{is_budget_stopped, BudgetThresholds};
