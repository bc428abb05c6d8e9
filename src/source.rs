use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};

use crate::error::UploadError;

pub trait FileSource: Send + Sync {
    fn name(&self) -> &str;
    fn len(&self) -> u64;
    fn modified(&self) -> DateTime<Utc>;
    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>, UploadError>;
    fn reader(&self) -> Result<Box<dyn Read + Send + '_>, UploadError>;
    fn local_paths(&self) -> Vec<Utf8PathBuf> {
        Vec::new()
    }
}

#[derive(Clone)]
pub struct RawFile(Arc<dyn FileSource>);

impl RawFile {
    pub fn new<S: FileSource + 'static>(source: S) -> Self {
        Self(Arc::new(source))
    }

    pub fn open(path: &Utf8Path) -> Result<Self, UploadError> {
        Ok(Self::new(LocalFile::open(path)?))
    }

    pub fn in_memory(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::new(MemoryFile::new(name, content))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.0.modified()
    }

    pub fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>, UploadError> {
        self.0.read_range(start, end)
    }

    pub fn reader(&self) -> Result<Box<dyn Read + Send + '_>, UploadError> {
        self.0.reader()
    }

    pub fn local_paths(&self) -> Vec<Utf8PathBuf> {
        self.0.local_paths()
    }

    pub fn fingerprint(&self) -> FileFingerprint {
        FileFingerprint {
            name: self.name().to_string(),
            size: self.len(),
            modified: self.modified().timestamp_millis(),
        }
    }
}

impl fmt::Debug for RawFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFile")
            .field("name", &self.name())
            .field("size", &self.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileFingerprint {
    pub name: String,
    pub size: u64,
    pub modified: i64,
}

#[derive(Debug, Clone)]
pub struct LocalFile {
    path: Utf8PathBuf,
    name: String,
    size: u64,
    modified: DateTime<Utc>,
}

impl LocalFile {
    pub fn open(path: &Utf8Path) -> Result<Self, UploadError> {
        let meta = std::fs::metadata(path.as_std_path())
            .map_err(|err| UploadError::Filesystem(format!("stat {path}: {err}")))?;
        if !meta.is_file() {
            return Err(UploadError::Filesystem(format!("not a regular file: {path}")));
        }
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let name = path
            .file_name()
            .ok_or_else(|| UploadError::Filesystem(format!("no file name in {path}")))?
            .to_string();
        Ok(Self {
            path: path.to_path_buf(),
            name,
            size: meta.len(),
            modified,
        })
    }

    fn open_handle(&self) -> Result<File, UploadError> {
        File::open(self.path.as_std_path())
            .map_err(|err| UploadError::Filesystem(format!("open {}: {err}", self.path)))
    }
}

impl FileSource for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.size
    }

    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>, UploadError> {
        let end = end.min(self.size);
        if start >= end {
            return Ok(Vec::new());
        }
        let mut file = self.open_handle()?;
        file.seek(SeekFrom::Start(start))
            .map_err(|err| UploadError::Filesystem(format!("seek {}: {err}", self.path)))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)
            .map_err(|err| UploadError::Filesystem(format!("read {}: {err}", self.path)))?;
        Ok(buf)
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>, UploadError> {
        Ok(Box::new(io::BufReader::new(self.open_handle()?)))
    }

    fn local_paths(&self) -> Vec<Utf8PathBuf> {
        vec![self.path.clone()]
    }
}

#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    content: Vec<u8>,
    modified: DateTime<Utc>,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            modified: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = modified;
        self
    }
}

impl FileSource for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.content.len() as u64
    }

    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>, UploadError> {
        let end = end.min(self.len()) as usize;
        let start = (start as usize).min(end);
        Ok(self.content[start..end].to_vec())
    }

    fn reader(&self) -> Result<Box<dyn Read + Send + '_>, UploadError> {
        Ok(Box::new(self.content.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_range_is_clamped() {
        let file = RawFile::in_memory("a.fastq", b"@r1\nACGT\n+\nIIII\n".to_vec());
        assert_eq!(file.read_range(0, 3).unwrap(), b"@r1");
        assert_eq!(file.read_range(14, 100).unwrap(), b"I\n");
        assert!(file.read_range(50, 60).unwrap().is_empty());
    }

    #[test]
    fn local_file_reads_ranges() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("x_R1.fq")).unwrap();
        std::fs::write(path.as_std_path(), b"0123456789").unwrap();

        let file = RawFile::open(&path).unwrap();
        assert_eq!(file.name(), "x_R1.fq");
        assert_eq!(file.len(), 10);
        assert_eq!(file.read_range(8, 20).unwrap(), b"89");
        assert_eq!(file.local_paths(), vec![path]);
    }
}
