use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use sysinfo::Disks;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::FileError;
use crate::protocol::BLOCK_SIZE;

/// Used when sanitizing leaves nothing of the offered name.
pub const FALLBACK_FILE_NAME: &str = "received_file";

/// Create (or truncate) `path` at exactly `size` bytes.
///
/// Free space is checked up front where the disk can be identified; a late
/// `ENOSPC` from the filesystem maps to the same error.
pub async fn preallocate(path: &Path, size: u64) -> Result<(), FileError> {
    let probe = path.to_path_buf();
    let available = tokio::task::spawn_blocking(move || available_space(&probe))
        .await
        .ok()
        .flatten();
    if let Some(available) = available {
        if available < size {
            return Err(FileError::InsufficientSpace { path: path.to_path_buf(), needed: size, available });
        }
    }

    let file = File::create(path).await.map_err(FileError::io(path))?;
    if let Err(e) = file.set_len(size).await {
        return Err(if is_out_of_space(&e) {
            FileError::InsufficientSpace { path: path.to_path_buf(), needed: size, available: available.unwrap_or(0) }
        } else {
            FileError::Io { path: path.to_path_buf(), source: e }
        });
    }
    debug!("Preallocated {} ({} bytes)", path.display(), size);
    Ok(())
}

/// Open an existing file for positioned writes. Each worker holds its own.
pub async fn open_for_write(path: &Path) -> Result<File, FileError> {
    OpenOptions::new().write(true).open(path).await.map_err(FileError::io(path))
}

/// Write `bytes` at `offset`. Callers own disjoint ranges.
pub async fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await
}

/// Fill `buf` from `offset`. Returns fewer bytes only at end of file.
pub async fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Hex SHA-256 of `length` bytes at `offset`, read in fixed blocks.
pub async fn chunk_sha256(path: &Path, offset: u64, length: u64) -> Result<String, FileError> {
    let mut file = File::open(path).await.map_err(FileError::io(path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut pos = offset;
    let end = offset + length;
    while pos < end {
        let want = (end - pos).min(BLOCK_SIZE as u64) as usize;
        let n = read_at(&mut file, pos, &mut buf[..want]).await.map_err(FileError::io(path))?;
        if n < want {
            return Err(FileError::Io {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::UnexpectedEof, format!("range ends past end of file at {}", pos + n as u64)),
            });
        }
        hasher.update(&buf[..n]);
        pos += n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a whole file.
pub async fn file_sha256(path: &Path) -> Result<String, FileError> {
    let mut file = File::open(path).await.map_err(FileError::io(path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(FileError::io(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// True if the file's SHA-256 equals `expected_hex` (case-insensitive).
pub async fn verify_file(path: &Path, expected_hex: &str) -> Result<bool, FileError> {
    let actual = file_sha256(path).await?;
    Ok(actual.eq_ignore_ascii_case(expected_hex.trim()))
}

/// Reduce an offered name to a safe base name.
///
/// Keeps letters, digits, space, `.`, `-` and `_`, replacing anything else
/// with `_`. Drops path components and leading dots.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .trim()
        .trim_start_matches('.')
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, ' ' | '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// First free path for `name` in `dir`: `name`, then `stem_1.ext`, `stem_2.ext`, ...
pub async fn unique_destination(dir: &Path, name: &str) -> Result<PathBuf, FileError> {
    let candidate = dir.join(name);
    if !exists(&candidate).await? {
        return Ok(candidate);
    }

    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{n}{ext}"));
        if !exists(&candidate).await? {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Free bytes on the disk holding `path`, if any mounted disk contains it.
///
/// Blocking: enumerates disks.
pub fn available_space(path: &Path) -> Option<u64> {
    let mut target = path.to_path_buf();
    while !target.exists() {
        if !target.pop() {
            target = PathBuf::from(".");
            break;
        }
    }
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let score = mount.as_os_str().len();
            match best {
                Some((best_score, _)) if best_score >= score => {}
                _ => best = Some((score, disk.available_space())),
            }
        }
    }
    best.map(|(_, available)| available)
}

/// Create `dir` and its parents if missing.
pub async fn ensure_dir(dir: &Path) -> Result<(), FileError> {
    if !exists(dir).await? {
        fs::create_dir_all(dir).await.map_err(FileError::io(dir))?;
        info!("Created output directory {}", dir.display());
    }
    Ok(())
}

async fn exists(path: &Path) -> Result<bool, FileError> {
    fs::try_exists(path).await.map_err(FileError::io(path))
}

fn is_out_of_space(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::StorageFull
}
