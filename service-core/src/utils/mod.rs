pub mod signature;

pub use signature::{SignedHeaders, generate_signature, sign_request, verify_signature};
