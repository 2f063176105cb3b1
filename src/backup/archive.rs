use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};

pub fn checksum_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Pack a session directory into a gzipped tarball. Entry paths are relative
/// to `dir`; symlinks are stored as links, never followed.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("Failed to archive {}", dir.display()))?;
    let encoder = builder
        .into_inner()
        .context("Failed to finish session archive")?;
    encoder.finish().context("Failed to compress session archive")
}

/// Install a tarball into `dest`. Entries are first unpacked into a staging
/// directory next to `dest`; an existing `dest` is renamed aside, then
/// staging takes its place. Nothing at `dest` changes unless the whole
/// archive unpacks cleanly. Returns the file count and where the old
/// directory went.
pub fn install_archive(bytes: &[u8], dest: &Path) -> Result<(usize, Option<PathBuf>)> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow::anyhow!("session dir has no parent"))?;
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("session dir has no name"))?;
    std::fs::create_dir_all(parent)?;

    let staging = parent.join(format!(".{name}.restore-{}", uuid::Uuid::new_v4()));
    let files = match unpack_into(bytes, &staging) {
        Ok(0) => {
            let _ = std::fs::remove_dir_all(&staging);
            anyhow::bail!("Session archive contains no files");
        }
        Ok(files) => files,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    let moved_to = if dest.exists() {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let aside = parent.join(format!("{name}.bak-{stamp}-{}", short_id()));
        std::fs::rename(dest, &aside).with_context(|| {
            format!("Failed to move existing session {} aside", dest.display())
        })?;
        Some(aside)
    } else {
        None
    };

    std::fs::rename(&staging, dest)
        .with_context(|| format!("Failed to install restored session at {}", dest.display()))?;
    Ok((files, moved_to))
}

/// Only regular files and directories are accepted; an entry that would land
/// outside `dir` fails the whole unpack.
fn unpack_into(bytes: &[u8], dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(dir)?;
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut files = 0;
    for entry in archive.entries().context("Backup is not a session archive")? {
        let mut entry = entry.context("Corrupt session archive")?;
        let path = entry.path().context("Corrupt session archive")?.into_owned();
        let is_file = match entry.header().entry_type() {
            EntryType::Regular => true,
            EntryType::Directory => false,
            other => anyhow::bail!(
                "Unsupported entry {other:?} in session archive: '{}'",
                path.display()
            ),
        };
        let unpacked = entry
            .unpack_in(dir)
            .with_context(|| format!("Failed to extract '{}'", path.display()))?;
        if !unpacked {
            anyhow::bail!("Unsafe path in session archive: '{}'", path.display());
        }
        if is_file {
            files += 1;
        }
    }
    Ok(files)
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
