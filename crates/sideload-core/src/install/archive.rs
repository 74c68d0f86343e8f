//! App archive handling: unpacking `.ipa` files, copying `.app` bundles and
//! re-packing a signed `Payload` directory.
//!
//! The zip work is blocking, so the async entry points move it onto the
//! blocking pool. Both directions check a cancellation token between entries
//! and report progress as the fraction of entries processed.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::session::ProgressFn;

/// Unpack `archive` into `dest`.
pub async fn unarchive(
    archive: &Path,
    dest: &Path,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract(&archive, &dest, &*progress, &cancel))
        .await
        .context("Extraction task failed")?
}

/// Pack `directory` into a zip at `output`. Entries are stored uncompressed
/// and prefixed with the directory's own name.
pub async fn archive(
    directory: &Path,
    output: &Path,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let directory = directory.to_path_buf();
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || compress(&directory, &output, &*progress, &cancel))
        .await
        .context("Packaging task failed")?
}

fn check_cancelled(cancel: &CancellationToken) -> anyhow::Result<()> {
    if cancel.is_cancelled() {
        anyhow::bail!("Cancelled");
    }
    Ok(())
}

/// Extract a zip archive to a directory
pub fn extract(
    archive: &Path,
    dest: &Path,
    progress: &(dyn Fn(f64) + Send + Sync),
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create extract directory: {}", dest.display()))?;

    let file = fs::File::open(archive)
        .with_context(|| format!("Failed to open archive: {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read {} as zip archive", archive.display()))?;

    let total = zip.len();
    for i in 0..total {
        check_cancelled(cancel)?;

        let mut entry = zip
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry {}", i))?;

        // Entries escaping the destination are skipped
        let Some(outpath) = entry.enclosed_name().map(|path| dest.join(path)) else {
            continue;
        };

        if entry.is_dir() {
            fs::create_dir_all(&outpath)
                .with_context(|| format!("Failed to create directory: {}", outpath.display()))?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create parent directory: {}", parent.display())
                })?;
            }

            let mut buffer = Vec::new();
            entry
                .read_to_end(&mut buffer)
                .with_context(|| format!("Failed to read zip entry: {}", entry.name()))?;
            fs::write(&outpath, &buffer)
                .with_context(|| format!("Failed to write file: {}", outpath.display()))?;

            // App executables need their mode bits
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    fs::set_permissions(&outpath, fs::Permissions::from_mode(mode)).ok();
                }
            }
        }

        progress((i + 1) as f64 / total as f64);
    }

    Ok(())
}

/// Files and directories under `root`, sorted, relative to `root`.
fn collect_entries(root: &Path) -> anyhow::Result<Vec<(PathBuf, bool)>> {
    let mut out = Vec::new();
    collect_recursive(root, Path::new(""), &mut out)?;
    Ok(out)
}

fn collect_recursive(
    dir: &Path,
    base: &Path,
    out: &mut Vec<(PathBuf, bool)>,
) -> anyhow::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read directory entries: {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let rel = base.join(entry.file_name());
        let ty = entry
            .file_type()
            .with_context(|| format!("Failed to stat file: {}", entry.path().display()))?;

        if ty.is_dir() {
            out.push((rel.clone(), true));
            collect_recursive(&entry.path(), &rel, out)?;
        } else if ty.is_file() {
            out.push((rel, false));
        } else {
            anyhow::bail!(
                "Unsupported filesystem entry type: {}",
                entry.path().display()
            );
        }
    }
    Ok(())
}

fn zip_name(prefix: &str, rel: &Path) -> String {
    let mut name = prefix.to_string();
    for component in rel.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}

/// Zip `directory` into `output` using stored entries
pub fn compress(
    directory: &Path,
    output: &Path,
    progress: &(dyn Fn(f64) + Send + Sync),
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let prefix = directory
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Cannot archive unnamed directory: {}", directory.display()))?;
    let entries = collect_entries(directory)?;

    let file = fs::File::create(output)
        .with_context(|| format!("Failed to create archive: {}", output.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let stored =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

    zip.add_directory(format!("{prefix}/"), stored)
        .context("Failed to write archive root")?;

    let total = entries.len().max(1);
    for (i, (rel, is_dir)) in entries.iter().enumerate() {
        check_cancelled(cancel)?;

        let name = zip_name(&prefix, rel);
        let path = directory.join(rel);
        if *is_dir {
            zip.add_directory(format!("{name}/"), stored)
                .with_context(|| format!("Failed to add directory: {}", name))?;
        } else {
            let mut options = stored;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = fs::metadata(&path)
                    .with_context(|| format!("Failed to stat file: {}", path.display()))?
                    .permissions()
                    .mode();
                options = options.unix_permissions(mode);
            }
            let content = fs::read(&path)
                .with_context(|| format!("Failed to read file: {}", path.display()))?;
            zip.start_file(name.as_str(), options)
                .with_context(|| format!("Failed to add file: {}", name))?;
            zip.write_all(&content)
                .with_context(|| format!("Failed to write file: {}", name))?;
        }

        progress((i + 1) as f64 / total as f64);
    }

    zip.finish().context("Failed to finish archive")?;
    Ok(())
}

/// Recursively copy an app bundle directory.
pub fn copy_dir(src: &Path, dest: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;
    for (rel, is_dir) in collect_entries(src)? {
        let target = dest.join(&rel);
        if is_dir {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?;
        } else {
            fs::copy(src.join(&rel), &target)
                .with_context(|| format!("Failed to copy file: {}", target.display()))?;
        }
    }
    Ok(())
}
