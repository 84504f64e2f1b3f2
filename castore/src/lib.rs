#[cfg(test)]
use rstest_reuse;

mod digests;
mod errors;

pub mod contentstore;
pub mod export;
pub mod fixtures;
pub mod oci;
pub mod pull;
pub mod reference;
pub mod remotes;
pub mod tracker;

pub use digests::{Digest, Error as DigestError, SHA256_LEN};
pub use errors::Error;
