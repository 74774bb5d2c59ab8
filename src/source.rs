use std::{fs, io, path::{Path, PathBuf}};

use log::debug;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::{compiler::CancelToken, error::{CompileError, CompileResult}};

/// Immutable snapshot of the source directory. Paths are relative to the
/// source root; children are sorted by file name.
#[derive(Debug, Clone)]
pub enum SourceNode {
    File(SourceFile),
    Directory(SourceDirectory),
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub name: String,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SourceDirectory {
    pub path: PathBuf,
    pub name: String,
    pub children: Vec<SourceNode>,
}

impl SourceNode {
    pub fn name(&self) -> &str {
        match self {
            SourceNode::File(file) => &file.name,
            SourceNode::Directory(dir) => &dir.name,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            SourceNode::File(file) => &file.path,
            SourceNode::Directory(dir) => &dir.path,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            SourceNode::File(_) => 1,
            SourceNode::Directory(dir) => dir.count(),
        }
    }
}

impl SourceDirectory {
    /// Entries in this subtree, the directory itself included.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(|c| c.count()).sum::<usize>()
    }
}

/// Reads a directory tree. Sibling entries are read on a bounded rayon pool,
/// results are merged back in name order so the tree never depends on
/// scheduling.
pub struct Walker<'a> {
    threads: usize,
    cancel: CancelToken,
    skip: Option<&'a (dyn Fn(&str) -> bool + Sync)>,
    progress: Option<&'a (dyn Fn(&Path) + Sync)>,
}

impl<'a> Walker<'a> {
    pub fn new(threads: usize, cancel: CancelToken) -> Self {
        Self { threads: threads.max(1), cancel, skip: None, progress: None }
    }

    /// Entries whose name matches are left out without being read, along
    /// with everything below them.
    pub fn skipping(mut self, skip: &'a (dyn Fn(&str) -> bool + Sync)) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Called with the relative path of each directory as it is entered.
    pub fn on_directory(mut self, progress: &'a (dyn Fn(&Path) + Sync)) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn walk(&self, root: &Path) -> CompileResult<SourceDirectory> {
        let metadata = fs::symlink_metadata(root).map_err(|e| CompileError::io(root, e))?;
        if !metadata.is_dir() {
            return Err(CompileError::io(root, io::Error::new(io::ErrorKind::InvalidInput, "source root is not a directory")));
        }

        let name = root_name(root);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| CompileError::io(root, io::Error::new(io::ErrorKind::Other, e.to_string())))?;

        pool.install(|| self.walk_directory(root, PathBuf::new(), name))
    }

    fn walk_directory(&self, root: &Path, relative: PathBuf, name: String) -> CompileResult<SourceDirectory> {
        if self.cancel.is_cancelled() {
            return Err(CompileError::Cancelled);
        }
        if let Some(progress) = self.progress {
            progress(relative.as_path());
        }

        let absolute = root.join(&relative);
        let mut names = vec![];
        for entry in fs::read_dir(&absolute).map_err(|e| CompileError::io(&absolute, e))? {
            let entry = entry.map_err(|e| CompileError::io(&absolute, e))?;
            let Ok(entry_name) = entry.file_name().into_string() else {
                return Err(CompileError::io(entry.path(), io::Error::new(io::ErrorKind::InvalidData, "file name is not valid UTF-8")));
            };
            if self.skip.is_some_and(|skip| skip(entry_name.as_str())) {
                debug!("skipping {}", absolute.join(&entry_name).display());
                continue;
            }
            names.push(entry_name);
        }
        names.sort();

        // indexed collect keeps the sorted order, the first error in that order wins
        let results: Vec<CompileResult<SourceNode>> = names
            .par_iter()
            .map(|entry_name| self.walk_entry(root, relative.join(entry_name), entry_name.clone()))
            .collect();

        let mut children = Vec::with_capacity(results.len());
        for result in results {
            children.push(result?);
        }

        debug!("walked {} ({} entries)", absolute.display(), children.len());
        return Ok(SourceDirectory { path: relative, name, children });
    }

    fn walk_entry(&self, root: &Path, relative: PathBuf, name: String) -> CompileResult<SourceNode> {
        let absolute = root.join(&relative);
        let metadata = fs::symlink_metadata(&absolute).map_err(|e| CompileError::io(&absolute, e))?;
        let file_type = metadata.file_type();

        if file_type.is_symlink() {
            return Err(CompileError::io(absolute, io::Error::new(io::ErrorKind::Unsupported, "symbolic links are not followed")));
        }
        if file_type.is_dir() {
            return self.walk_directory(root, relative, name).map(SourceNode::Directory);
        }
        if !file_type.is_file() {
            return Err(CompileError::io(absolute, io::Error::new(io::ErrorKind::Unsupported, "not a regular file or directory")));
        }

        let contents = fs::read(&absolute).map_err(|e| CompileError::io(&absolute, e))?;
        Ok(SourceNode::File(SourceFile { path: relative, name, contents }))
    }
}

fn root_name(root: &Path) -> String {
    let canonical = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    canonical
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("root")
        .to_string()
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;

    fn names(dir: &SourceDirectory) -> Vec<&str> {
        dir.children.iter().map(|c| c.name()).collect()
    }

    #[test]
    fn walk_sorts_children_and_reads_contents() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("b.lua"), "return 2").unwrap();
        fs::write(tmp.path().join("a.lua"), "return 1").unwrap();
        fs::create_dir(tmp.path().join("c")).unwrap();
        fs::write(tmp.path().join("c").join("z.txt"), "z").unwrap();

        let tree = Walker::new(4, CancelToken::new()).walk(tmp.path()).unwrap();
        assert_eq!(names(&tree), vec!["a.lua", "b.lua", "c"]);

        let SourceNode::File(a) = &tree.children[0] else { panic!("expected file") };
        assert_eq!(a.contents, b"return 1");
        assert_eq!(a.path, PathBuf::from("a.lua"));

        let SourceNode::Directory(c) = &tree.children[2] else { panic!("expected directory") };
        assert_eq!(c.children[0].path(), Path::new("c/z.txt"));
        assert_eq!(tree.count(), 5);
    }

    #[test]
    fn walk_is_independent_of_thread_count() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..20 {
            let dir = tmp.path().join(format!("d{:02}", 19 - i));
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join("m.lua"), format!("return {}", i)).unwrap();
        }

        let single = Walker::new(1, CancelToken::new()).walk(tmp.path()).unwrap();
        let many = Walker::new(8, CancelToken::new()).walk(tmp.path()).unwrap();
        assert_eq!(names(&single), names(&many));
        assert_eq!(names(&single)[0], "d00");
    }

    #[test]
    fn missing_root_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Walker::new(1, CancelToken::new()).walk(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, CompileError::Io { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_aborts_walk_naming_path() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("real.lua"), "return 1").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("real.lua"), tmp.path().join("link.lua")).unwrap();

        let err = Walker::new(2, CancelToken::new()).walk(tmp.path()).unwrap_err();
        let CompileError::Io { path, .. } = err else { panic!("expected io error") };
        assert!(path.ends_with("link.lua"));
    }

    #[test]
    fn cancelled_walk_returns_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.lua"), "return 1").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = Walker::new(2, cancel).walk(tmp.path()).unwrap_err();
        assert!(matches!(err, CompileError::Cancelled));
    }

    #[test]
    fn cancel_during_walk_discards_partial_tree() {
        let tmp = tempfile::tempdir().unwrap();
        for dir in ["a", "b", "b/inner", "c"] {
            fs::create_dir(tmp.path().join(dir)).unwrap();
            fs::write(tmp.path().join(dir).join("m.lua"), "return 1").unwrap();
        }

        let cancel = CancelToken::new();
        let token = cancel.clone();
        let cancel_in_b = move |path: &Path| {
            if path == Path::new("b") {
                token.cancel();
            }
        };
        let res = Walker::new(1, cancel.clone()).on_directory(&cancel_in_b).walk(tmp.path());
        assert!(matches!(res, Err(CompileError::Cancelled)));
        assert!(cancel.is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn skipped_entries_are_never_read() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join(".git")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("nowhere"), tmp.path().join(".git").join("HEADLINK")).unwrap();
        fs::write(tmp.path().join("a.lua"), "return 1").unwrap();

        let skip_hidden = |name: &str| name.starts_with('.');
        let tree = Walker::new(2, CancelToken::new()).skipping(&skip_hidden).walk(tmp.path()).unwrap();
        assert_eq!(names(&tree), vec!["a.lua"]);
    }
}
