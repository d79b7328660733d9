use crate::error::BoxError;

/// The unkeyed pool's factory contract (§6.1): the only I/O surface the pool
/// consumes. Every hook is invoked outside any pool lock, so implementations
/// are free to block.
///
/// `create`/`destroy`/`validate`/`activate`/`passivate` match the design
/// doc's five hooks one for one; there is no sixth "recycle"-style
/// convenience hook the way `deadpool`'s `Manager` has, since the spec keeps
/// creation and validation/activation deliberately separate steps that the
/// pool sequences itself.
pub trait Factory<T>: Send + Sync {
    /// Create a new instance. Fail-fast: errors surface to the borrower
    /// unchanged (wrapped in [`crate::Error::FactoryFailed`]).
    fn create(&self) -> Result<T, BoxError>;

    /// Destroy an instance that will never be reused. Must not panic;
    /// implementations that can fail should log and swallow the error.
    fn destroy(&self, object: T);

    /// Side-effect-free liveness check. Must not panic.
    fn validate(&self, _object: &T) -> bool {
        true
    }

    /// Called before handing an entry out to a borrower. Failure destroys
    /// the entry.
    fn activate(&self, _object: &mut T) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called before an entry is returned to idle. Failure destroys the
    /// entry.
    fn passivate(&self, _object: &mut T) -> Result<(), BoxError> {
        Ok(())
    }
}

/// The keyed pool's factory contract: identical to [`Factory`] but every hook
/// takes the key explicitly (see design doc: "avoid wiring the sub-pool back
/// to a factory-adapter holding a thread-local key").
pub trait KeyedFactory<K, T>: Send + Sync {
    fn create(&self, key: &K) -> Result<T, BoxError>;

    fn destroy(&self, key: &K, object: T);

    fn validate(&self, _key: &K, _object: &T) -> bool {
        true
    }

    fn activate(&self, _key: &K, _object: &mut T) -> Result<(), BoxError> {
        Ok(())
    }

    fn passivate(&self, _key: &K, _object: &mut T) -> Result<(), BoxError> {
        Ok(())
    }
}
