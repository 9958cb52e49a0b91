//! Shared runtime state and the host helper seam.
//!
//! Two cross-compilation data live here, both append-only with per-entry
//! interior mutability: the compiled-method registry and the cctor
//! contexts. Everything else a compilation touches is owned by its own
//! compiler instance.

pub mod cctor;
pub mod helpers;
pub mod object;
pub mod registry;

pub use cctor::{CctorContext, CctorRegistry};
pub use helpers::RuntimeHelpers;
pub use registry::{MethodRegistry, RegistryEntry, NATIVE_CODE_OFFSET};
