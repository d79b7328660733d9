use std::error::Error as StdError;
use std::fmt;

/// A boxed, type-erased error coming out of a factory hook.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Everything that can go wrong borrowing from, returning to, or otherwise
/// operating on a pool.
///
/// This mirrors the taxonomy of kinds in the design doc rather than wrapping
/// every possible failure in its own type: callers match on `kind()` and, for
/// the hook-wrapping variants, can still get at the underlying cause via
/// [`std::error::Error::source`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The pool has been closed; `borrow` always fails this way afterwards.
    PoolClosed,
    /// No idle entry was available and the cap prevented creating one, either
    /// immediately (`blockWhenExhausted = false`) or after `maxWait` elapsed.
    PoolExhausted { timed_out: bool },
    /// The factory's `create` hook failed.
    FactoryFailed(BoxError),
    /// A freshly created entry failed `activate`.
    ActivationFailed(BoxError),
    /// A freshly created entry failed `validate`.
    ValidationFailed(BoxError),
    /// `return_object`/`invalidate` was called with an object this pool never
    /// handed out. Fatal: the caller has a bug.
    NotFromThisPool,
    /// `return_object` was called twice for the same borrow. Fatal.
    AlreadyReturned,
    /// A blocked borrower was woken by something other than an available
    /// entry (currently: only `close()`); no residual wait state is left
    /// behind.
    Interrupted,
}

impl Error {
    pub(crate) fn factory_failed<E: Into<BoxError>>(e: E) -> Self {
        Error::FactoryFailed(e.into())
    }

    pub(crate) fn activation_failed<E: Into<BoxError>>(e: E) -> Self {
        Error::ActivationFailed(e.into())
    }

    pub(crate) fn validation_failed<E: Into<BoxError>>(e: E) -> Self {
        Error::ValidationFailed(e.into())
    }

    /// True for the kinds that are expected to show up under ordinary
    /// operation (exhaustion, timeouts) rather than caller misuse or a
    /// misbehaving factory.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PoolClosed => f.write_str("pool is closed"),
            Error::PoolExhausted { timed_out: true } => {
                f.write_str("pool exhausted: timed out waiting for an idle entry")
            }
            Error::PoolExhausted { timed_out: false } => f.write_str("pool exhausted"),
            Error::FactoryFailed(_) => f.write_str("factory failed to create an object"),
            Error::ActivationFailed(_) => f.write_str("object failed activation"),
            Error::ValidationFailed(_) => f.write_str("object failed validation"),
            Error::NotFromThisPool => f.write_str("object was not borrowed from this pool"),
            Error::AlreadyReturned => f.write_str("object was already returned"),
            Error::Interrupted => f.write_str("borrow was interrupted"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::FactoryFailed(e) | Error::ActivationFailed(e) | Error::ValidationFailed(e) => {
                Some(e.as_ref())
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
