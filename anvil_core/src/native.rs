//! The native-call ABI: the contract by which a host-provided callback reads
//! arguments from the current frame and writes a result, without the VM
//! pushing or popping anything on its behalf.

/// Index into an [`crate::exec::Executable`]'s native-function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeId(pub u64);

/// A host callback. Receives the whole register file and the whole data stack;
/// it is responsible for locating its own arguments (at a known offset below
/// the caller's `fp`, per the calling convention) and writing its result into
/// the conventional return register. Returns a status code: `0` is success,
/// anything else is fatal (surfaces as [`crate::error::NativeError`]).
pub type NativeFn = fn(registers: &mut [u64; 64], stack: &mut [u8]) -> i32;

/// An ordered table of native callbacks, indexed by [`NativeId`]. Built by the
/// linker from whatever the host registers before linking.
#[derive(Clone, Default)]
pub struct NativeTable {
    callbacks: Vec<NativeFn>,
}

impl NativeTable {
    pub fn new() -> Self {
        NativeTable::default()
    }

    pub fn register(&mut self, f: NativeFn) -> NativeId {
        let id = NativeId(self.callbacks.len() as u64);
        self.callbacks.push(f);
        id
    }

    pub fn get(&self, id: NativeId) -> Option<NativeFn> {
        self.callbacks.get(id.0 as usize).copied()
    }

    /// The full callback table in registration order, i.e. indexed by
    /// `NativeId`. Consumed by the linker when building an [`crate::exec::Executable`].
    pub fn callbacks(&self) -> &[NativeFn] {
        &self.callbacks
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl std::fmt::Debug for NativeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeTable")
            .field("len", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(_registers: &mut [u64; 64], _stack: &mut [u8]) -> i32 {
        0
    }

    #[test]
    fn register_assigns_sequential_ids() {
        let mut table = NativeTable::new();
        let a = table.register(identity);
        let b = table.register(identity);
        assert_eq!(a, NativeId(0));
        assert_eq!(b, NativeId(1));
        assert!(table.get(a).is_some());
        assert!(table.get(NativeId(99)).is_none());
    }
}
