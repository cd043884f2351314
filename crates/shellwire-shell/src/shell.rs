//! Shell executable detection and validation.

use std::{
    ffi::OsStr,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;

/// Fallback used when `$SHELL` is unset or unusable.
const DEFAULT_SHELL: &str = "/bin/sh";

/// Shell executable error.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Shell path must be absolute: {0}")]
    NotAbsolute(PathBuf),
    #[error("Shell path is malformed: {0}")]
    Malformed(PathBuf),
    #[error("Shell executable not found: {0}")]
    NotFound(PathBuf),
    #[error("Shell path is not an executable file: {0}")]
    NotExecutable(PathBuf),
}

/// Check that `path` names an absolute, well-formed executable file.
///
/// Runs synchronously and never spawns anything.
///
/// # Errors
/// Returns the first rule the path violates.
pub fn validate_executable_path(path: &Path) -> Result<(), ShellError> {
    if path.as_os_str().is_empty() || path.to_string_lossy().contains('\0') {
        return Err(ShellError::Malformed(path.to_path_buf()));
    }
    if !path.is_absolute() {
        return Err(ShellError::NotAbsolute(path.to_path_buf()));
    }
    if path.file_name().is_none() || path.components().any(|c| c == Component::ParentDir) {
        return Err(ShellError::Malformed(path.to_path_buf()));
    }

    let metadata =
        std::fs::metadata(path).map_err(|_| ShellError::NotFound(path.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(ShellError::NotExecutable(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(ShellError::NotExecutable(path.to_path_buf()));
        }
    }

    Ok(())
}

/// Returns the path to the user's interactive shell.
///
/// Reads `$SHELL`, falling back to `/bin/sh`.
#[must_use]
pub fn get_interactive_shell() -> PathBuf {
    UnixShell::current_shell().path().to_path_buf()
}

/// Resolve an executable by name to an absolute path.
///
/// Absolute paths are returned as-is when they point at a file; anything else
/// is looked up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    let found = tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok);
    if let Some(ref found) = found {
        tracing::debug!(path = %found.display(), "Resolved shell executable");
    }
    found
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Get the rc file this shell reads in interactive mode, if it exists.
    #[must_use]
    pub fn config_file(&self) -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        let config_file = match self {
            Self::Zsh(_) => Some(home.join(".zshrc")),
            Self::Bash(_) => Some(home.join(".bashrc")),
            Self::Sh(_) | Self::Other(_) => None,
        };
        config_file.filter(|p| p.is_file())
    }

    /// Get the command that sources the rc file.
    #[must_use]
    pub fn source_command(&self) -> Option<String> {
        let source_file = self.config_file()?;
        let lossy = source_file.to_string_lossy();
        let escaped = shlex::try_quote(&lossy).ok()?;
        Some(format!(". {escaped}"))
    }

    /// Get the current shell from `$SHELL`.
    #[must_use]
    pub fn current_shell() -> Self {
        if let Ok(shell) = std::env::var("SHELL") {
            if let Some(shell) = Self::from_path(Path::new(&shell)) {
                return shell;
            }
        }
        Self::Sh(PathBuf::from(DEFAULT_SHELL))
    }

    /// Classify an absolute path by its file name.
    ///
    /// Returns `None` for relative paths.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !path.is_absolute() {
            return None;
        }
        let path_buf = path.to_path_buf();
        let shell = match path.file_name().and_then(OsStr::to_str) {
            Some("zsh") => Self::Zsh(path_buf),
            Some("bash") => Self::Bash(path_buf),
            Some("sh" | "dash" | "ash") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        };
        Some(shell)
    }
}
