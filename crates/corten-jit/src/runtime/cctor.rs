//! Static-constructor trigger contexts.
//!
//! A type with a class constructor registers a context holding the cctor's
//! entry address. Emitted static-field accesses load the context, test the
//! word, and when non-zero clear it and call through it, so the cctor runs
//! at most once per process on the first static touch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// One type's cctor trigger word.
///
/// `#[repr(C)]`: emitted code addresses the word as `[context + 0]`.
#[repr(C)]
pub struct CctorContext {
    /// Entry address of the cctor; zeroed by the trigger preamble just
    /// before the call.
    pub cctor: AtomicUsize,
}

impl CctorContext {
    pub fn pending(&self) -> bool {
        self.cctor.load(Ordering::Acquire) != 0
    }

    pub fn address(self: &Arc<CctorContext>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// Registry of cctor contexts keyed by `(assembly_id, type_token)`.
pub struct CctorRegistry {
    contexts: RwLock<FxHashMap<(u32, u32), Arc<CctorContext>>>,
}

static GLOBAL: Lazy<CctorRegistry> = Lazy::new(CctorRegistry::new);

impl CctorRegistry {
    pub fn new() -> CctorRegistry {
        CctorRegistry { contexts: RwLock::new(FxHashMap::default()) }
    }

    pub fn global() -> &'static CctorRegistry {
        &GLOBAL
    }

    /// Register a type's cctor. Returns the existing context if the type
    /// was already registered.
    pub fn register(&self, assembly_id: u32, type_token: u32, cctor_code: usize) -> Arc<CctorContext> {
        let key = (assembly_id, type_token);
        if let Some(existing) = self.contexts.read().get(&key) {
            return existing.clone();
        }
        let context = Arc::new(CctorContext { cctor: AtomicUsize::new(cctor_code) });
        self.contexts.write().entry(key).or_insert(context).clone()
    }

    /// Context address for a type, if one is registered.
    pub fn context_address(&self, assembly_id: u32, type_token: u32) -> Option<usize> {
        self.contexts
            .read()
            .get(&(assembly_id, type_token))
            .map(|c| c.address())
    }
}

impl Default for CctorRegistry {
    fn default() -> Self {
        CctorRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = CctorRegistry::new();
        assert!(registry.context_address(1, 2).is_none());

        let ctx = registry.register(1, 2, 0xAB);
        assert!(ctx.pending());
        assert_eq!(registry.context_address(1, 2), Some(ctx.address()));

        // Re-registration keeps the original context.
        let again = registry.register(1, 2, 0xCD);
        assert_eq!(again.address(), ctx.address());
        assert_eq!(again.cctor.load(Ordering::Relaxed), 0xAB);
    }

    #[test]
    fn test_trigger_word_is_first() {
        let registry = CctorRegistry::new();
        let ctx = registry.register(3, 4, 0x77);
        let read = unsafe { *(ctx.address() as *const usize) };
        assert_eq!(read, 0x77);
    }
}
