use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use flate2::read::MultiGzDecoder;
use tracing::debug;

use crate::domain::FileType;
use crate::error::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeMode {
    Fasta,
    Native,
}

pub trait FormatInspector: Send + Sync {
    fn sniff_type(&self, name: &str, slice: &[u8]) -> Result<FileType, UploadError>;
    /// Re-emits the complete records found in `slice`. An incomplete trailing
    /// record is dropped.
    fn normalize_slice(
        &self,
        name: &str,
        slice: &[u8],
        mode: NormalizeMode,
    ) -> Result<String, UploadError>;
}

impl<T: FormatInspector + ?Sized> FormatInspector for Box<T> {
    fn sniff_type(&self, name: &str, slice: &[u8]) -> Result<FileType, UploadError> {
        (**self).sniff_type(name, slice)
    }

    fn normalize_slice(
        &self,
        name: &str,
        slice: &[u8],
        mode: NormalizeMode,
    ) -> Result<String, UploadError> {
        (**self).normalize_slice(name, slice, mode)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeInspector;

impl FormatInspector for NativeInspector {
    fn sniff_type(&self, name: &str, slice: &[u8]) -> Result<FileType, UploadError> {
        let text = decode_slice(name, slice);
        Ok(sniff_text(&text))
    }

    fn normalize_slice(
        &self,
        name: &str,
        slice: &[u8],
        mode: NormalizeMode,
    ) -> Result<String, UploadError> {
        let text = decode_slice(name, slice);
        Ok(normalize_text(&text, mode))
    }
}

pub fn decode_slice(name: &str, slice: &[u8]) -> String {
    let gz = slice.starts_with(&[0x1f, 0x8b]) || name.to_ascii_lowercase().ends_with(".gz");
    if !gz {
        return String::from_utf8_lossy(slice).into_owned();
    }
    let mut decoder = MultiGzDecoder::new(slice);
    let mut out = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) => {
                debug!(file = name, error = %err, "gzip slice ended early");
                break;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn sniff_text(text: &str) -> FileType {
    if text.contains('\0') {
        return FileType::Unknown;
    }
    let mut lines = text.lines().skip_while(|line| line.trim().is_empty());
    let Some(first) = lines.next() else {
        return FileType::Unknown;
    };
    if first.starts_with('>') && first.len() > 1 {
        return FileType::Fasta;
    }
    if first.starts_with('@') && first.len() > 1 {
        let sequence = lines.next();
        let separator = lines.next();
        if let (Some(sequence), Some(separator)) = (sequence, separator) {
            if is_sequence(sequence) && separator.starts_with('+') {
                return FileType::Fastq;
            }
        }
    }
    FileType::Unknown
}

fn is_sequence(line: &str) -> bool {
    line.bytes()
        .all(|byte| byte.is_ascii_alphabetic() || byte == b'*' || byte == b'-' || byte == b'.')
}

fn normalize_text(text: &str, mode: NormalizeMode) -> String {
    let lines = text.lines().collect::<Vec<_>>();
    let mut out = String::new();
    let mut idx = 0usize;

    // Like kseq, skip anything before the first header line.
    while idx < lines.len() && !lines[idx].starts_with('>') && !lines[idx].starts_with('@') {
        idx += 1;
    }

    while idx < lines.len() {
        let header = lines[idx];
        if let Some(name) = header.strip_prefix('>') {
            let mut sequence = String::new();
            idx += 1;
            while idx < lines.len() && !lines[idx].starts_with('>') {
                sequence.push_str(lines[idx].trim_end());
                idx += 1;
            }
            out.push('>');
            out.push_str(name);
            out.push('\n');
            out.push_str(&sequence);
            out.push('\n');
        } else if let Some(name) = header.strip_prefix('@') {
            let (Some(sequence), Some(separator), Some(quality)) =
                (lines.get(idx + 1), lines.get(idx + 2), lines.get(idx + 3))
            else {
                break;
            };
            if !separator.starts_with('+') || quality.len() != sequence.len() {
                break;
            }
            match mode {
                NormalizeMode::Fasta => {
                    out.push('>');
                    out.push_str(name);
                    out.push('\n');
                    out.push_str(sequence);
                    out.push('\n');
                }
                NormalizeMode::Native => {
                    out.push('@');
                    out.push_str(name);
                    out.push('\n');
                    out.push_str(sequence);
                    out.push_str("\n+\n");
                    out.push_str(quality);
                    out.push('\n');
                }
            }
            idx += 4;
        } else {
            break;
        }
    }
    out
}

pub struct SystemInspector {
    htsfile: PathBuf,
    seqtk: PathBuf,
    exec_lock: Mutex<()>,
}

impl SystemInspector {
    pub fn new() -> Result<Self, UploadError> {
        let htsfile =
            find_in_path("htsfile").ok_or_else(|| UploadError::MissingTool("htsfile".to_string()))?;
        let seqtk =
            find_in_path("seqtk").ok_or_else(|| UploadError::MissingTool("seqtk".to_string()))?;
        Ok(Self {
            htsfile,
            seqtk,
            exec_lock: Mutex::new(()),
        })
    }

    fn run(&self, program: &Path, args: &[&str], name: &str, slice: &[u8]) -> Result<String, UploadError> {
        let _guard = self
            .exec_lock
            .lock()
            .map_err(|_| UploadError::Inspector("inspector lock poisoned".to_string()))?;
        let suffix = if name.to_ascii_lowercase().ends_with(".gz") {
            ".slice.gz"
        } else {
            ".slice"
        };
        let mut temp = tempfile::Builder::new()
            .prefix("sample-upload")
            .suffix(suffix)
            .tempfile()
            .map_err(|err| UploadError::Filesystem(err.to_string()))?;
        temp.write_all(slice)
            .map_err(|err| UploadError::Filesystem(err.to_string()))?;
        temp.flush()
            .map_err(|err| UploadError::Filesystem(err.to_string()))?;

        let output = Command::new(program)
            .args(args)
            .arg(temp.path())
            .output()
            .map_err(|err| UploadError::Inspector(format!("{}: {err}", program.display())))?;
        // seqtk exits non-zero on a truncated last record but still prints
        // every complete record before it.
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl FormatInspector for SystemInspector {
    fn sniff_type(&self, name: &str, slice: &[u8]) -> Result<FileType, UploadError> {
        let description = self.run(&self.htsfile, &[], name, slice)?;
        debug!(file = name, description = description.trim(), "htsfile");
        Ok(if description.contains("FASTQ") {
            FileType::Fastq
        } else if description.contains("FASTA") {
            FileType::Fasta
        } else {
            FileType::Unknown
        })
    }

    fn normalize_slice(
        &self,
        name: &str,
        slice: &[u8],
        mode: NormalizeMode,
    ) -> Result<String, UploadError> {
        let args: &[&str] = match mode {
            NormalizeMode::Fasta => &["seq", "-A", "-l0"],
            NormalizeMode::Native => &["seq"],
        };
        self.run(&self.seqtk, args, name, slice)
    }
}

pub(crate) fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    const FASTQ: &str = "@r1 1:N:0:1\nACGT\n+\nIIII\n@r2 1:N:0:1\nGGCC\n+\nIIII\n";

    #[test]
    fn sniff_formats() {
        let inspector = NativeInspector;
        assert_eq!(
            inspector.sniff_type("a.fq", FASTQ.as_bytes()).unwrap(),
            FileType::Fastq
        );
        assert_eq!(
            inspector.sniff_type("a.fa", b">c1\nACGT\n").unwrap(),
            FileType::Fasta
        );
        assert_eq!(
            inspector.sniff_type("a.fa", b"hello world\n").unwrap(),
            FileType::Unknown
        );
    }

    #[test]
    fn normalize_drops_incomplete_tail() {
        let text = format!("{FASTQ}@r3\nAC");
        let fasta = NativeInspector
            .normalize_slice("a.fq", text.as_bytes(), NormalizeMode::Fasta)
            .unwrap();
        assert_eq!(fasta, ">r1 1:N:0:1\nACGT\n>r2 1:N:0:1\nGGCC\n");
    }

    #[test]
    fn normalize_joins_multiline_fasta() {
        let fasta = NativeInspector
            .normalize_slice("a.fa", b">c1\nAC\nGT\n>c2\nTT\n", NormalizeMode::Fasta)
            .unwrap();
        assert_eq!(fasta, ">c1\nACGT\n>c2\nTT\n");
    }

    #[test]
    fn gzip_prefix_is_decoded() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(FASTQ.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        let partial = &compressed[..compressed.len() - 4];
        assert_eq!(
            NativeInspector.sniff_type("a.fq.gz", partial).unwrap(),
            FileType::Fastq
        );
    }
}
