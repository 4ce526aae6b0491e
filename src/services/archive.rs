//! Packs a directory tree into a single zip archive.

use crate::error::Result;
use std::fs::File;
use std::io;
use std::path::Path;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Writes `outfile` containing every regular file under `dir` with its
/// relative path. Symlinks are skipped, and the output file is excluded from
/// its own contents (it usually lives inside `dir`). On error, partially
/// written output is left in place for the caller to treat as a failed job.
pub fn pack(outfile: &Path, dir: &Path) -> Result<()> {
    let file = File::create(outfile)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    let outfile_abs = std::path::absolute(outfile)?;

    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(io::Error::from)?;
        let file_type = entry.file_type();

        if file_type.is_dir() || file_type.is_symlink() {
            continue;
        }
        if std::path::absolute(entry.path())? == outfile_abs {
            continue;
        }

        let name = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();

        writer.start_file(name, options)?;
        let mut source = File::open(entry.path())?;
        io::copy(&mut source, &mut writer)?;
    }

    writer.finish()?;
    Ok(())
}
