pub mod config;
pub mod format;
pub mod query_ast;

pub use config::CompilerConfig;
pub use query_ast::{
    CallsQuery, CompiledQuery, CostFragment, CostQueryGenerator, DescendantScope, Expr, OrderDirection, PhasePlan,
    QueryBuilderError, StructuralFilter,
};
