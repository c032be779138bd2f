pub mod api_key;
pub mod password;

pub use api_key::generate_api_key;
pub use password::{hash_secret, verify_secret};
