//! PKI engine abstraction and the Vault implementation.

mod types;
mod vault;

pub use types::*;
pub use vault::VaultPkiClient;
