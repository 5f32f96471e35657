use crate::error::CoreError;
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

const SALT_FILE: &str = ".salt";
const SALT_SIZE: usize = 16;

/// Replace `path` with `bytes` so that readers see either the old or the new
/// content, never a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    sync_dir(dir)
}

/// Make a rename in `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), CoreError> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), CoreError> {
    Ok(())
}

/// Per-directory KDF salt, created on first use.
pub fn load_or_create_salt(dir: &Path) -> Result<Vec<u8>, CoreError> {
    let path = dir.join(SALT_FILE);
    match fs::read(&path) {
        Ok(salt) if salt.len() == SALT_SIZE => Ok(salt),
        Ok(salt) => Err(CoreError::KeyDerivation(format!(
            "Salt file {} has {} bytes, expected {}",
            path.display(),
            salt.len(),
            SALT_SIZE
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut salt = vec![0u8; SALT_SIZE];
            rand::thread_rng().fill_bytes(&mut salt);
            write_atomic(&path, &salt)?;
            tracing::info!(path = %path.display(), "Created new store salt");
            Ok(salt)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No temp files left behind
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_write_atomic_with_bare_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.sealed");
        write_atomic(&path, b"sealed").unwrap();
        sync_dir(dir.path()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"sealed");
    }

    #[test]
    fn test_salt_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_salt(dir.path()).unwrap();
        let second = load_or_create_salt(dir.path()).unwrap();
        assert_eq!(first.len(), SALT_SIZE);
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_salt_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SALT_FILE), b"short").unwrap();
        assert!(matches!(
            load_or_create_salt(dir.path()),
            Err(CoreError::KeyDerivation(_))
        ));
    }
}
