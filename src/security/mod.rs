//! Security kernel: path, command, environment and URL primitives.
//!
//! Every component that touches the OS or untrusted input goes through this
//! module. Nothing here is async — the primitives are called from both sync
//! and async contexts and must stay cheap and deterministic.

pub mod command;
pub mod env;
pub mod path;
pub mod url;

pub use command::{tokenize, validate_command_secure};
pub use env::sanitize_environment;
pub use path::{
    is_path_within_dir, is_sensitive_path, open_secure_file, validate_path_secure, OpenMode,
    PathPolicy,
};
pub use url::validate_url;
