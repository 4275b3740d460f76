use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sibling path used while rewriting `path`.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace the contents of `path` so readers see either the old or the new
/// file, never a partial one: write a sibling temp file, sync it, rename it
/// over the original.
pub(crate) fn replace_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_replace_file_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("accounts.db");
        fs::write(&path, b"old").unwrap();

        replace_file(&path, b"new").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let tmp = temp_path(Path::new("/var/lib/parley/blacklist.txt"));
        assert_eq!(tmp, Path::new("/var/lib/parley/blacklist.txt.tmp"));
    }
}
