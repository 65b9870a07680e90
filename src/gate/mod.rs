//! Read-only access plane for golden images: a client-side allowlist
//! validator and the server-side restricted shell it pairs with, plus the
//! prepare flow that installs the server half.

pub mod prepare;
pub mod shell;
pub mod validator;

pub use prepare::{PrepareOutcome, PrepareProgress, ProgressFn, prepare_source};
pub use shell::{READONLY_USER, RESTRICTED_SHELL_PATH, RESTRICTED_SHELL_SCRIPT};
pub use validator::validate_read_only;
