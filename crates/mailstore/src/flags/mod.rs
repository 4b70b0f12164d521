//! Flag updates: pure calculation, write statements and the persistence engine

mod calculator;
mod engine;
mod statement;

pub use calculator::{FlagsUpdateMode, FlagsUpdateRequest};
pub use engine::FlagsMutationEngine;
pub use statement::{FlagsUpdateStatement, UserFlagsChange};
