pub mod digest;
pub mod fs;
pub mod seal;

pub use digest::{keyed_digest, verify_keyed_digest};
pub use fs::{load_or_create_salt, write_atomic};
pub use seal::{MasterKey, Sealer};
