use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{CoachError, Result};

pub const CONFIG_FILE: &str = "security-coach-config.json";
pub const RULES_FILE: &str = "security-coach-rules.json";
pub const AUDIT_FILE: &str = "security-coach-audit.jsonl";
pub const HISTORY_FILE: &str = "security-coach-history.jsonl";

/// The state directory holding config, rules, audit, and history files.
///
/// Created with mode `0o700`; every file written through this type is
/// symlink-checked first and created with mode `0o600`.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&root, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { root })
    }

    /// Platform default: `<data dir>/security-coach`.
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("security-coach")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn rules_path(&self) -> PathBuf {
        self.root.join(RULES_FILE)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.root.join(AUDIT_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }
}

/// Refuse to touch a path that is currently a symlink. A missing path is
/// fine; anything else surfaces the underlying IO error.
pub fn ensure_not_symlink(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            Err(CoachError::SymlinkRefused(path.display().to_string()))
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn restrict_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Atomic replace: write `<path>.<uuid>.tmp`, chmod `0o600`, rename over the
/// target. The target and tmp paths are both symlink-checked.
pub fn atomic_replace(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_not_symlink(path)?;
    let tmp = PathBuf::from(format!("{}.{}.tmp", path.display(), Uuid::new_v4()));
    ensure_not_symlink(&tmp)?;

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
    }
    restrict_mode(&tmp)?;

    if let Err(e) = fs::rename(&tmp, path) {
        fs::remove_file(&tmp).ok();
        return Err(e.into());
    }
    Ok(())
}

/// Append a single line (newline-terminated) and return the resulting file
/// size. Mode `0o600` is re-applied on every append for platforms that only
/// honor it at creation.
pub fn append_line(path: &Path, line: &str) -> Result<u64> {
    ensure_not_symlink(path)?;
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    restrict_mode(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(file.metadata()?.len())
}

/// Move a corrupt file aside as `<path>.corrupt.<epoch-ms>` so a fresh one
/// can be started. Returns the backup path.
pub fn backup_corrupt(path: &Path) -> Result<PathBuf> {
    let backup = PathBuf::from(format!(
        "{}.corrupt.{}",
        path.display(),
        crate::types::now_ms()
    ));
    fs::rename(path, &backup)?;
    Ok(backup)
}
