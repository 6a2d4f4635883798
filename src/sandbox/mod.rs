pub mod types;
pub mod sandbox;

pub use types::{SandboxOptions, FileContent, FileEncoding};
pub use sandbox::Sandbox;
