use thiserror::Error;

/// Promotion of a `WeakPtr` failed because the managed object was already
/// destroyed (its strong count reached zero).
///
/// This is the only error the pointer types surface; every other misuse is
/// a documented precondition on an `unsafe` entry point.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Error)]
#[error("weak pointer expired: target already destroyed")]
pub struct ExpiredError;
