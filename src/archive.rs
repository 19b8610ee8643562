//! Packaging of a Flutter project into the zip archive uploaded with a build

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Largest archive the server accepts
pub const MAX_ARCHIVE_SIZE: u64 = 500_000_000;

/// Name of the per-project file listing extra exclusions
pub const IGNORE_FILE: &str = ".odevioignore";

const EXCLUDED_DIRS: &[&str] = &[
    "build",
    "windows",
    "linux",
    ".dart_tool",
    ".pub-cache",
    ".pub",
    ".git",
    ".gradle",
];

const EXCLUDED_FILES: &[&str] = &["source.zip", ".app.zip", "odevio.patch"];

/// Temporary source archive. The file is removed when this value is dropped.
#[derive(Debug)]
pub struct SourceArchive {
    file: NamedTempFile,
}

impl SourceArchive {
    pub fn new(file: NamedTempFile) -> Self {
        Self { file }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self
            .file
            .as_file()
            .metadata()
            .context("Failed to read archive size")?
            .len())
    }
}

/// Names of directories and files left out of the archive
#[derive(Debug, Clone, PartialEq)]
pub struct Exclusions {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

impl Default for Exclusions {
    fn default() -> Self {
        Self {
            dirs: EXCLUDED_DIRS.iter().map(|d| d.to_string()).collect(),
            files: EXCLUDED_FILES.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl Exclusions {
    /// Defaults plus the entries of an ignore file, if it exists.
    ///
    /// One entry per line; directories end with `/`.
    pub fn with_ignore_file(path: &Path) -> Result<Self> {
        let mut exclusions = Self::default();
        if !path.is_file() {
            return Ok(exclusions);
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.strip_suffix('/') {
                Some(dir) => exclusions.dirs.push(dir.to_string()),
                None => exclusions.files.push(line.to_string()),
            }
        }
        Ok(exclusions)
    }

    /// An entry matches by name at any depth, or by its path relative to the
    /// project root
    fn excludes(list: &[String], name: &str, relative: &str) -> bool {
        list.iter().any(|entry| entry == name || entry == relative)
    }

    fn excludes_dir(&self, name: &str, relative: &str) -> bool {
        Self::excludes(&self.dirs, name, relative)
    }

    fn excludes_file(&self, name: &str, relative: &str) -> bool {
        Self::excludes(&self.files, name, relative)
    }
}

/// Zip `directory` into a fresh temporary file
pub fn zip_directory(directory: &Path, exclusions: &Exclusions) -> Result<SourceArchive> {
    let temp = tempfile::Builder::new()
        .prefix("odevio-source-")
        .suffix(".zip")
        .tempfile()
        .context("Failed to create temporary archive")?;

    let mut writer = ZipWriter::new(
        temp.reopen()
            .context("Failed to open temporary archive for writing")?,
    );
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut entries = 0usize;
    add_directory(
        &mut writer,
        directory,
        PathBuf::new(),
        exclusions,
        options,
        &mut entries,
    )?;
    writer.finish().context("Failed to finalize archive")?;

    debug!(
        "Archived {} entries of {} into {}",
        entries,
        directory.display(),
        temp.path().display()
    );
    Ok(SourceArchive::new(temp))
}

fn add_directory(
    writer: &mut ZipWriter<File>,
    root: &Path,
    relative: PathBuf,
    exclusions: &Exclusions,
    options: SimpleFileOptions,
    entries: &mut usize,
) -> Result<()> {
    let dir = root.join(&relative);
    let mut children = fs::read_dir(&dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("Failed to list directory {}", dir.display()))?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let name = child.file_name().to_string_lossy().into_owned();
        let child_relative = relative.join(&name);
        let archive_name = archive_path(&child_relative);
        let path = child.path();

        let file_type = child.file_type()?;
        // Symlinked directories are recorded but not followed
        let is_dir = file_type.is_dir()
            || (file_type.is_symlink() && fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false));

        if is_dir {
            if exclusions.excludes_dir(&name, &archive_name) {
                debug!("Skipping directory {}", archive_name);
                continue;
            }
            writer
                .add_directory(format!("{}/", archive_name), options)
                .with_context(|| format!("Failed to add {} to archive", archive_name))?;
            *entries += 1;
            if file_type.is_dir() {
                add_directory(writer, root, child_relative, exclusions, options, entries)?;
            }
        } else if path.is_file() {
            if exclusions.excludes_file(&name, &archive_name) {
                debug!("Skipping file {}", archive_name);
                continue;
            }
            writer
                .start_file(archive_name.as_str(), options)
                .with_context(|| format!("Failed to add {} to archive", archive_name))?;
            let mut source = File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            io::copy(&mut source, writer)
                .with_context(|| format!("Failed to compress {}", path.display()))?;
            *entries += 1;
        }
    }

    Ok(())
}

/// Archive entry names always use `/` separators
fn archive_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::io::Read;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn names_in(archive: &SourceArchive) -> BTreeSet<String> {
        let mut zip = zip::ZipArchive::new(File::open(archive.path()).unwrap()).unwrap();
        (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_default_exclusions() {
        let project = tempfile::tempdir().unwrap();
        let root = project.path();
        write(root, "pubspec.yaml", "name: demo\nversion: 1.0.0+1\n");
        write(root, "lib/main.dart", "void main() {}");
        write(root, "build/ios/app.o", "junk");
        write(root, ".dart_tool/package_config.json", "{}");
        write(root, "ios/.git/HEAD", "ref");
        write(root, "odevio.patch", "diff");
        write(root, "assets/source.zip", "zip");

        let archive = zip_directory(root, &Exclusions::default()).unwrap();
        let names = names_in(&archive);

        assert!(names.contains("pubspec.yaml"));
        assert!(names.contains("lib/"));
        assert!(names.contains("lib/main.dart"));
        assert!(names.contains("ios/"));
        assert!(names.contains("assets/"));
        assert!(!names.iter().any(|n| n.starts_with("build")));
        assert!(!names.iter().any(|n| n.contains(".dart_tool")));
        assert!(!names.iter().any(|n| n.contains(".git")));
        assert!(!names.contains("odevio.patch"));
        assert!(!names.contains("assets/source.zip"));
    }

    #[test]
    fn test_ignore_file_entries() {
        let project = tempfile::tempdir().unwrap();
        let root = project.path();
        write(root, "lib/main.dart", "void main() {}");
        write(root, "secrets/key.pem", "private");
        write(root, "notes.txt", "todo");
        write(root, IGNORE_FILE, "secrets/\n\nnotes.txt\n");

        let exclusions = Exclusions::with_ignore_file(&root.join(IGNORE_FILE)).unwrap();
        assert!(exclusions.dirs.contains(&"secrets".to_string()));
        assert!(exclusions.files.contains(&"notes.txt".to_string()));

        let archive = zip_directory(root, &exclusions).unwrap();
        let names = names_in(&archive);
        assert!(names.contains("lib/main.dart"));
        assert!(!names.iter().any(|n| n.starts_with("secrets")));
        assert!(!names.contains("notes.txt"));
    }

    #[test]
    fn test_contents_survive_compression() {
        let project = tempfile::tempdir().unwrap();
        write(project.path(), "lib/main.dart", "void main() => runApp();");

        let archive = zip_directory(project.path(), &Exclusions::default()).unwrap();
        let mut zip = zip::ZipArchive::new(File::open(archive.path()).unwrap()).unwrap();
        let mut contents = String::new();
        zip.by_name("lib/main.dart")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "void main() => runApp();");
    }

    #[test]
    fn test_archive_is_removed_on_drop() {
        let project = tempfile::tempdir().unwrap();
        write(project.path(), "pubspec.yaml", "name: demo");

        let archive = zip_directory(project.path(), &Exclusions::default()).unwrap();
        let path = archive.path().to_path_buf();
        assert!(path.exists());
        assert!(archive.size().unwrap() > 0);

        drop(archive);
        assert!(!path.exists());
    }
}
