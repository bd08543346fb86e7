pub mod executor;
pub mod planner;

pub use executor::{ToolData, ToolExecution, ToolExecutor, ToolOutcome};
pub use planner::{clarification_message, ToolPlanner};

pub use persona_error::{PersonaError, Result};
