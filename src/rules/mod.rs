//! The rules engine: board representation lives in [`crate::types`], move
//! generation and legality in [`movegen`], notation in [`san`].

pub mod movegen;
pub mod san;

pub use movegen::*;
