use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::Debug,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, RwLock};
use zip::{ZipArchive, result::ZipError};

use crate::error::LoadingError;

/// Somewhere class bytes can be found by internal name (`java/lang/Object`).
pub trait ClassSource: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when this source does not have the class.
    fn find_class(&self, class_name: &str) -> Result<Option<Cow<'_, [u8]>>, LoadingError>;
}

/// Builds the sources for a `:`-separated class path; entries ending in
/// `.jar` or `.zip` are archives, everything else is a directory.
pub fn class_path_sources(class_path: &str) -> Result<Vec<Box<dyn ClassSource>>, LoadingError> {
    let mut sources: Vec<Box<dyn ClassSource>> = Vec::new();
    for entry in std::env::split_paths(class_path) {
        if entry.as_os_str().is_empty() {
            continue;
        }
        sources.push(source_for_path(entry)?);
    }
    Ok(sources)
}

/// The source for one class path entry.
pub fn source_for_path(entry: PathBuf) -> Result<Box<dyn ClassSource>, LoadingError> {
    let is_archive = entry
        .extension()
        .is_some_and(|ext| ext == "jar" || ext == "zip");
    if is_archive {
        Ok(Box::new(JarSource::open(entry)?))
    } else {
        Ok(Box::new(DirectorySource::new(entry)))
    }
}

fn io_error(path: &Path, err: impl ToString) -> LoadingError {
    LoadingError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

#[derive(Debug)]
pub struct DirectorySource {
    name: String,
    base_path: PathBuf,
}

impl DirectorySource {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            name: base_path.display().to_string(),
            base_path,
        }
    }
}

impl ClassSource for DirectorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_class(&self, class_name: &str) -> Result<Option<Cow<'_, [u8]>>, LoadingError> {
        let path = self.base_path.join(format!("{class_name}.class"));
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(Cow::Owned(bytes))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&path, err)),
        }
    }
}

#[derive(Debug)]
pub struct JarSource {
    name: String,
    path: PathBuf,
    archive: Mutex<ZipArchive<File>>,
}

impl JarSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LoadingError> {
        let path = path.into();
        let file = File::open(&path).map_err(|err| io_error(&path, err))?;
        let archive = ZipArchive::new(file).map_err(|err| io_error(&path, err))?;
        Ok(Self {
            name: path.display().to_string(),
            path,
            archive: Mutex::new(archive),
        })
    }
}

impl ClassSource for JarSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_class(&self, class_name: &str) -> Result<Option<Cow<'_, [u8]>>, LoadingError> {
        let mut archive = self.archive.lock();
        let mut class_file = match archive.by_name(&format!("{class_name}.class")) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(err) => return Err(io_error(&self.path, err)),
        };
        let mut content = Vec::with_capacity(class_file.size() as usize);
        class_file
            .read_to_end(&mut content)
            .map_err(|err| io_error(&self.path, err))?;
        Ok(Some(Cow::Owned(content)))
    }
}

/// Class bytes held in memory, e.g. produced by the class assembler.
#[derive(Debug, Default)]
pub struct MemorySource {
    name: String,
    classes: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classes: Default::default(),
        }
    }

    pub fn insert(&self, class_name: impl Into<String>, bytes: Vec<u8>) {
        self.classes.write().insert(class_name.into(), bytes);
    }

    pub fn with_class(self, class_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(class_name, bytes);
        self
    }
}

impl ClassSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn find_class(&self, class_name: &str) -> Result<Option<Cow<'_, [u8]>>, LoadingError> {
        Ok(self
            .classes
            .read()
            .get(class_name)
            .map(|bytes| Cow::Owned(bytes.clone())))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    #[test]
    fn test_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/A.class"), [1, 2, 3]).unwrap();

        let source = DirectorySource::new(dir.path());
        assert_eq!(source.find_class("pkg/A").unwrap().unwrap().as_ref(), &[1, 2, 3]);
        assert!(source.find_class("pkg/B").unwrap().is_none());
    }

    #[test]
    fn test_jar_source() {
        let dir = tempfile::tempdir().unwrap();
        let jar_path = dir.path().join("lib.jar");
        let mut writer = zip::ZipWriter::new(File::create(&jar_path).unwrap());
        writer
            .start_file("pkg/A.class", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&[0xCA, 0xFE]).unwrap();
        writer.finish().unwrap();

        let source = JarSource::open(&jar_path).unwrap();
        assert_eq!(source.find_class("pkg/A").unwrap().unwrap().as_ref(), &[0xCA, 0xFE]);
        assert!(source.find_class("pkg/Missing").unwrap().is_none());
    }

    #[test]
    fn test_class_path_sources() {
        let dir = tempfile::tempdir().unwrap();
        let sources = class_path_sources(&dir.path().display().to_string()).unwrap();
        assert_eq!(sources.len(), 1);
        assert!(class_path_sources("/definitely/missing.jar").is_err());
    }
}
