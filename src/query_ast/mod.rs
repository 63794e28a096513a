//! Calls query layer: request model, expression compiler, optimization
//! passes and SQL assembly for the merged calls table.
//!
//! Entry point is `CallsQuery`; `compile()` yields SQL with `{name:Type}`
//! placeholders plus the parameter table that binds them.

pub mod ast;
pub mod columns;
pub mod compiler;
pub mod costs;
pub mod descendants;
pub mod emitter;
pub mod errors;
pub mod expand;
pub mod feedback;
pub mod logical;
pub mod params;
pub mod planner;
pub mod rewrite;
pub mod structural;

pub use ast::{ConvertTarget, Expr};
pub use columns::{CallPart, ColumnRegistry, FieldDescriptor};
pub use costs::{CostFragment, CostQueryGenerator};
pub use errors::*;
pub use logical::*;
pub use params::{Param, ParamBuilder, ParamTable, ParamType};
pub use planner::{CompiledQuery, PhasePlan};
