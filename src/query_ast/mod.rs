//! Query AST layer: logical plans in, dialect SQL out.
//!
//! `logical` holds the backend-agnostic plan trees handed to a device,
//! `ast` the SQL statement tree the translator builds, `emitter` renders it.

pub mod ast;
pub mod emitter;
pub mod errors;
pub mod logical;
pub mod plan_cache;
pub mod rewrite;
pub mod validate;

pub use errors::*;
pub use logical::*;
