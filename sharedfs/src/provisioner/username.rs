//! Account name generation.

use rand::prelude::RngExt;
use rand::rng;

/// Length of a generated account name.
pub const USERNAME_LEN: usize = 10;

/// A fresh account name: 16 random bytes, hex encoded, keeping the last ten characters.
pub fn generate_username() -> String {
    let mut bytes = [0u8; 16];
    rng().fill(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    hex[hex.len() - USERNAME_LEN..].to_string()
}

/// Whether `name` has the shape of a generated account name.
///
/// Only such names are ever joined onto the home root, so a corrupted record cannot
/// point `rm -rf` outside of its own home.
pub fn is_generated_username(name: &str) -> bool {
    name.len() == USERNAME_LEN && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
