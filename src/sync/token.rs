//! Creation tokens for idempotent object creation.

use rand::distr::Alphanumeric;
use rand::Rng;

const TOKEN_LEN: usize = 32;

/// Generate a fresh creation token.
///
/// One token is drawn per file-data update attempt and handed to every
/// create call of that attempt, so a transport retry of the same call
/// resolves to the same object.
pub fn new_nonce() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}
