//! Composite functions and their execution machinery.

mod function;
mod memory;
mod plan;
mod state;

pub use function::CompositeFunction;
pub use plan::{PlanKey, PlanStats, PlanSummary};
pub use state::BackpropState;
