//! ALFA Docs Vault - Secure Filesystem Operations
//!
//! Atomic writes, overwrite-before-delete, and the scoped ephemeral
//! plaintext file handed out by the cipher engine.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use crate::error::{VaultError, VaultResult};

const WIPE_CHUNK: usize = 1024 * 1024;

/// Write a file atomically (temp file + rename), owner-only permissions
pub fn write_atomic(path: &Path, data: &[u8]) -> VaultResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    // NamedTempFile is created 0600 in the destination directory
    let mut temp = NamedTempFile::new_in(&parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| VaultError::IoError(e.error))?;
    Ok(())
}

/// Stream into a temporary file in `dir`, then move it to the path `place`
/// derives from the writer's result. A failed write or move leaves
/// nothing behind in `dir`.
pub fn write_streamed<T>(
    dir: &Path,
    write: impl FnOnce(&mut BufWriter<&mut File>) -> VaultResult<T>,
    place: impl FnOnce(&T) -> PathBuf,
) -> VaultResult<T> {
    fs::create_dir_all(dir)?;
    let mut temp = NamedTempFile::new_in(dir)?;

    let value = {
        let mut out = BufWriter::new(temp.as_file_mut());
        let value = write(&mut out)?;
        out.flush()?;
        value
    };
    temp.as_file().sync_all()?;

    temp.persist(place(&value)).map_err(|e| VaultError::IoError(e.error))?;
    Ok(value)
}

/// Overwrite a file with zeros, then remove it
pub fn secure_delete(path: &Path) -> VaultResult<()> {
    if !path.exists() {
        return Ok(());
    }

    let size = fs::metadata(path)?.len();
    if size > 0 {
        let mut file = OpenOptions::new().write(true).open(path)?;
        overwrite_with_zeros(&mut file, size)?;
    }

    fs::remove_file(path)?;
    Ok(())
}

fn overwrite_with_zeros(file: &mut File, size: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let zeros = vec![0u8; WIPE_CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(WIPE_CHUNK as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()
}

// ═══════════════════════════════════════════════════════════════════════════
// EPHEMERAL PLAINTEXT
// ═══════════════════════════════════════════════════════════════════════════

/// Decrypted document content living in an owner-only scratch file.
///
/// The file is wiped and unlinked exactly once: by [`release`](Self::release)
/// or, failing that, on drop. Every exit path of the owning scope (including
/// `?` and panics unwinding through it) therefore destroys the plaintext.
pub struct EphemeralPlaintext {
    file: Option<NamedTempFile>,
    len: u64,
}

impl EphemeralPlaintext {
    /// Create an empty scratch file in `dir` (or the OS temp dir)
    pub(crate) fn create(dir: Option<&Path>) -> VaultResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".alfa-docs-").suffix(".plain");

        let file = match dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                builder.tempfile_in(dir)?
            }
            None => builder.tempfile()?,
        };

        restrict_to_owner(file.path())?;

        Ok(Self {
            file: Some(file),
            len: 0,
        })
    }

    pub(crate) fn append(&mut self, data: &[u8]) -> VaultResult<()> {
        let file = self.file_mut()?;
        file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> VaultResult<()> {
        let file = self.file_mut()?;
        file.flush()?;
        file.as_file().sync_all()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn file_mut(&mut self) -> VaultResult<&mut NamedTempFile> {
        self.file
            .as_mut()
            .ok_or_else(|| VaultError::InvalidState("ephemeral plaintext already released".into()))
    }

    /// Plaintext length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Location of the scratch file, valid until release
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path())
    }

    /// Independent read handle positioned at the start
    pub fn reader(&self) -> VaultResult<File> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| VaultError::InvalidState("ephemeral plaintext already released".into()))?;
        let mut handle = file.reopen()?;
        handle.seek(SeekFrom::Start(0))?;
        Ok(handle)
    }

    /// Copy the plaintext into zeroizing memory
    pub fn read_to_vec(&self) -> VaultResult<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(Vec::with_capacity(self.len as usize));
        self.reader()?.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Wipe and delete the scratch file now
    pub fn release(mut self) -> VaultResult<()> {
        self.destroy()
    }

    fn destroy(&mut self) -> VaultResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        let wiped = overwrite_with_zeros(file.as_file_mut(), self.len);
        self.len = 0;
        // unlink even when the wipe failed
        let closed = file.close();

        wiped?;
        closed?;
        Ok(())
    }
}

impl Drop for EphemeralPlaintext {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::error!("Failed to destroy ephemeral plaintext: {}", e);
        }
    }
}

impl std::fmt::Debug for EphemeralPlaintext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralPlaintext")
            .field("path", &self.path())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> io::Result<()> {
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// SECURE FS (storage collaborator helper)
// ═══════════════════════════════════════════════════════════════════════════

/// Rooted directory of opaque encrypted files
pub struct SecureFs {
    root: PathBuf,
}

impl SecureFs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn full_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn write_file(&self, relative_path: &str, data: &[u8]) -> VaultResult<()> {
        write_atomic(&self.full_path(relative_path), data)
    }

    /// Open an encrypted file for streaming
    pub fn open_file(&self, relative_path: &str) -> VaultResult<File> {
        Ok(File::open(self.full_path(relative_path))?)
    }

    pub fn delete_file(&self, relative_path: &str) -> VaultResult<()> {
        secure_delete(&self.full_path(relative_path))
    }

    pub fn exists(&self, relative_path: &str) -> bool {
        self.full_path(relative_path).exists()
    }

    pub fn list_dir(&self, relative_path: &str) -> VaultResult<Vec<String>> {
        let path = self.full_path(relative_path);
        let mut files = Vec::new();

        if path.exists() {
            for entry in fs::read_dir(&path)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }
}
