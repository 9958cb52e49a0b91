//! Compiled-method registry.
//!
//! The one datum shared across compilations. Entries are append-only and
//! keyed by `(assembly_id, method_token)`; each entry's native-code word
//! starts at 0 and is published exactly once when the method finishes
//! compiling. Emitted code reads that word through a plain 64-bit load at
//! offset 0 of the entry, so mutually recursive methods can call each
//! other before both are done: the caller goes through `EnsureCompiled`
//! and then the forwarding slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// One method's registry descriptor.
///
/// `#[repr(C)]` with the native-code word first: emitted code addresses
/// the slot as `[entry + 0]`.
#[repr(C)]
pub struct RegistryEntry {
    /// 0 until the method is compiled, then its entry address. Published
    /// with `Release`; emitted code reads it as a plain load.
    pub native_code: AtomicUsize,
    pub method_token: u32,
    pub assembly_id: u32,
}

/// Byte offset of the forwarding slot inside an entry.
pub const NATIVE_CODE_OFFSET: i32 = 0;

impl RegistryEntry {
    pub fn is_compiled(&self) -> bool {
        self.native_code.load(Ordering::Acquire) != 0
    }

    /// Stable address of this entry for embedding in emitted code.
    pub fn address(self: &Arc<RegistryEntry>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// Process-wide registry of methods known to the JIT.
pub struct MethodRegistry {
    entries: DashMap<(u32, u32), Arc<RegistryEntry>>,
    compiled: AtomicUsize,
}

static GLOBAL: Lazy<MethodRegistry> = Lazy::new(MethodRegistry::new);

impl MethodRegistry {
    pub fn new() -> MethodRegistry {
        MethodRegistry { entries: DashMap::new(), compiled: AtomicUsize::new(0) }
    }

    /// The process-wide instance used by compilations.
    pub fn global() -> &'static MethodRegistry {
        &GLOBAL
    }

    /// Fetch or reserve the entry for a method. A reserved entry has a
    /// zero native-code word until `publish` runs.
    pub fn entry(&self, assembly_id: u32, method_token: u32) -> Arc<RegistryEntry> {
        self.entries
            .entry((assembly_id, method_token))
            .or_insert_with(|| {
                Arc::new(RegistryEntry {
                    native_code: AtomicUsize::new(0),
                    method_token,
                    assembly_id,
                })
            })
            .clone()
    }

    /// Look up an entry without reserving one.
    pub fn get(&self, assembly_id: u32, method_token: u32) -> Option<Arc<RegistryEntry>> {
        self.entries.get(&(assembly_id, method_token)).map(|e| e.clone())
    }

    /// Publish a method's native code, making the forwarding slot live.
    pub fn publish(&self, assembly_id: u32, method_token: u32, native_code: usize) {
        let entry = self.entry(assembly_id, method_token);
        if entry.native_code.swap(native_code, Ordering::Release) == 0 && native_code != 0 {
            self.compiled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn compiled_count(&self) -> usize {
        self.compiled.load(Ordering::Relaxed)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        MethodRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_then_publish() {
        let registry = MethodRegistry::new();
        let entry = registry.entry(1, 0x0600_0001);
        assert!(!entry.is_compiled());
        assert_eq!(registry.entry_count(), 1);
        assert_eq!(registry.compiled_count(), 0);

        registry.publish(1, 0x0600_0001, 0x1234);
        assert!(entry.is_compiled());
        assert_eq!(registry.compiled_count(), 1);
        // Same key returns the same entry.
        assert_eq!(registry.entry(1, 0x0600_0001).address(), entry.address());
    }

    #[test]
    fn test_forwarding_slot_is_first_word() {
        let registry = MethodRegistry::new();
        let entry = registry.entry(7, 42);
        registry.publish(7, 42, 0xBEEF);
        let slot = entry.address() + NATIVE_CODE_OFFSET as usize;
        let read = unsafe { *(slot as *const usize) };
        assert_eq!(read, 0xBEEF);
    }

    #[test]
    fn test_entries_are_per_assembly() {
        let registry = MethodRegistry::new();
        let a = registry.entry(1, 5);
        let b = registry.entry(2, 5);
        assert_ne!(a.address(), b.address());
        assert_eq!(registry.entry_count(), 2);
    }
}
