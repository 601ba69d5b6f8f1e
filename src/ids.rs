//! Identifier Generation
//!
//! Monotonic ULIDs: lexicographically sortable, and strictly increasing even
//! when several are minted within the same millisecond.

use std::sync::Mutex;
use ulid::{Generator, Ulid};

static GENERATOR: Mutex<Option<Generator>> = Mutex::new(None);

/// Mint a new identifier, strictly greater than every one minted before it
/// by this process.
pub fn new_id() -> String {
    next_ulid().to_string()
}

fn next_ulid() -> Ulid {
    let mut guard = match GENERATOR.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let generator = guard.get_or_insert_with(Generator::new);

    // Overflow needs 2^80 ids in one millisecond; fall back to a fresh random id.
    generator.generate().unwrap_or_else(|_| Ulid::new())
}
