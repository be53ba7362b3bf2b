//! rowguard - attribute-based row and field access control
//!
//! Policies compile into row predicates that filter in memory or push down
//! into SQL, and a formula engine computes properties over the visible rows.
//! All modules are exposed for testing purposes.

pub mod abac;
pub mod entities;
pub mod errors;
pub mod formula;
pub mod settings;
pub mod storage;
