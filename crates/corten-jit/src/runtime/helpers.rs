//! Host helper table.
//!
//! The C-ABI seam between emitted code and the host runtime: allocation,
//! type tests, interface dispatch, lazy compilation, and exception
//! dispatch all go through these function pointers. Every helper follows
//! the same Win64 convention the managed code uses, so the compiler can
//! call them like any other target.

/// Function pointers the emitted code may call.
///
/// All addresses are embedded as 64-bit immediates at compile time; the
/// table must therefore outlive every method compiled against it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RuntimeHelpers {
    /// Allocate a zeroed object of a type: `(method_table) -> object`.
    pub new_fast: unsafe extern "win64" fn(usize) -> usize,
    /// Allocate an SZ-array: `(array_method_table, length) -> array`.
    pub new_array: unsafe extern "win64" fn(usize, i64) -> usize,
    /// Allocate a rank-N array: `(method_table, dim0, dim1, dim2) -> array`.
    pub new_md_array: unsafe extern "win64" fn(usize, i64, i64, i64) -> usize,
    /// `(object_method_table, target_method_table) -> non-zero if assignable`.
    pub is_assignable_to: unsafe extern "win64" fn(usize, usize) -> i32,
    /// `(this, interface_method_table, method_index) -> code address`.
    pub get_interface_method: unsafe extern "win64" fn(usize, usize, u32) -> usize,
    /// Compile a method if its registry slot is still empty:
    /// `(method_token, assembly_id)`.
    pub ensure_compiled: unsafe extern "win64" fn(u32, u32),
    /// Compile the method behind a vtable slot: `(this, slot)`.
    pub ensure_vtable_slot: unsafe extern "win64" fn(usize, u32),
    /// Throw a managed exception object. Does not return.
    pub throw: unsafe extern "win64" fn(usize) -> !,
    /// Rethrow the in-flight exception. Does not return.
    pub rethrow: unsafe extern "win64" fn() -> !,
}

impl RuntimeHelpers {
    pub fn new_fast_addr(&self) -> usize {
        self.new_fast as usize
    }

    pub fn new_array_addr(&self) -> usize {
        self.new_array as usize
    }

    pub fn new_md_array_addr(&self) -> usize {
        self.new_md_array as usize
    }

    pub fn is_assignable_to_addr(&self) -> usize {
        self.is_assignable_to as usize
    }

    pub fn get_interface_method_addr(&self) -> usize {
        self.get_interface_method as usize
    }

    pub fn ensure_compiled_addr(&self) -> usize {
        self.ensure_compiled as usize
    }

    pub fn ensure_vtable_slot_addr(&self) -> usize {
        self.ensure_vtable_slot as usize
    }

    pub fn throw_addr(&self) -> usize {
        self.throw as usize
    }

    pub fn rethrow_addr(&self) -> usize {
        self.rethrow as usize
    }
}
