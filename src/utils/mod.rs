use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use filetime::FileTime;

pub mod path_security;

use crate::models::Fingerprint;

/// Returns true for dot-prefixed names.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Short stable hash of a path, used to name stored copies.
pub fn path_hash(path: &Path) -> String {
    let hash = blake3::hash(path.to_string_lossy().as_bytes());
    hash.to_hex()[..16].to_string()
}

/// First free sibling of `path`: `name (1).ext`, `name (2).ext`, ...
pub fn unique_destination(path: &Path) -> PathBuf {
    unique_destination_with(path, |_| false)
}

/// Like `unique_destination`, also skipping names for which `reserved` is true.
pub fn unique_destination_with(path: &Path, reserved: impl Fn(&Path) -> bool) -> PathBuf {
    let taken = |p: &Path| fs::symlink_metadata(p).is_ok() || reserved(p);
    if !taken(path) {
        return path.to_path_buf();
    }

    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());

    let mut n = 1u32;
    loop {
        let name = match ext {
            Some(ref ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = parent.join(name);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Copies a file keeping its modification time and permissions.
pub fn copy_file_preserving(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::metadata(src)?;
    let mut input = File::open(src)?;
    let mut output = File::create(dst)?;
    io::copy(&mut input, &mut output)?;
    if let Ok(modified) = meta.modified() {
        output.set_modified(modified)?;
    }
    drop(output);
    fs::set_permissions(dst, meta.permissions())?;
    Ok(())
}

/// Recursively copies `src` (file or directory) to `dst`. Directory
/// modification times are carried over too.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        return copy_file_preserving(src, dst);
    }

    let mut dirs = Vec::new();
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            let mtime = FileTime::from_last_modification_time(&entry.metadata().map_err(io::Error::other)?);
            dirs.push((target, mtime));
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            copy_file_preserving(entry.path(), &target)?;
        }
    }

    // Filling a directory bumps its mtime, so stamp them last, children first.
    for (target, mtime) in dirs.iter().rev() {
        filetime::set_file_mtime(target, *mtime)?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path) -> io::Result<()> {
    log::warn!("Skipping symlink {:?}", src);
    Ok(())
}

/// Removes a file or a whole directory. A missing path is not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Moves `src` to `dst`, falling back to copy + delete when a plain rename is
/// not possible (e.g. across volumes).
pub fn move_path(src: &Path, dst: &Path) -> Result<(), crate::models::EngineError> {
    match fs::rename(src, dst) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(e.into()),
        Err(e) => {
            log::info!("Rename {:?} -> {:?} failed ({}), falling back to copy", src, dst, e);
            if src.is_dir() {
                let options = fs_extra::dir::CopyOptions::new().copy_inside(true);
                fs_extra::dir::move_dir(src, dst, &options)?;
            } else {
                let options = fs_extra::file::CopyOptions::new();
                fs_extra::file::move_file(src, dst, &options)?;
            }
            Ok(())
        }
    }
}

fn hash_file(path: &Path, hasher: &mut blake3::Hasher) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 65536];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    Ok(total)
}

/// Content identity of `path`: file bytes, or the names, kinds and file
/// contents of a whole directory tree.
pub fn fingerprint(path: &Path) -> io::Result<Fingerprint> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Fingerprint::Absent),
        Err(e) => return Err(e),
    };

    if !meta.is_dir() {
        let mut hasher = blake3::Hasher::new();
        let len = if meta.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            hasher.update(target.to_string_lossy().as_bytes());
            0
        } else {
            hash_file(path, &mut hasher)?
        };
        return Ok(Fingerprint::File { len, digest: hasher.finalize().to_hex().to_string() });
    }

    let mut hasher = blake3::Hasher::new();
    let mut entries = 0usize;
    for entry in walkdir::WalkDir::new(path).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(path).map_err(io::Error::other)?;
        hasher.update(relative.to_string_lossy().as_bytes());
        let file_type = entry.file_type();
        if file_type.is_dir() {
            hasher.update(b"/d");
        } else if file_type.is_symlink() {
            hasher.update(b"/l");
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
        } else {
            hasher.update(b"/f");
            let mut file_hasher = blake3::Hasher::new();
            let len = hash_file(entry.path(), &mut file_hasher)?;
            hasher.update(&len.to_le_bytes());
            hasher.update(file_hasher.finalize().as_bytes());
        }
        entries += 1;
    }
    Ok(Fingerprint::Directory { entries, digest: hasher.finalize().to_hex().to_string() })
}
