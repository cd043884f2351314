//! Shell executable handling and the completion-sentinel protocol.
//!
//! Provides:
//! - Shell detection and executable path validation
//! - `Sentinel` - Begin/end markers and the command rewrites that emit them

pub mod sentinel;
pub mod shell;

pub use sentinel::{MarkerKind, MarkerMatch, Sentinel};
pub use shell::{
    ShellError, UnixShell, get_interactive_shell, resolve_executable_path,
    validate_executable_path,
};
