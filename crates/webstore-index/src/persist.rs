//! Index file format
//!
//! One JSON record per line: a header, then one section per entry that has
//! a data file, then the context's policy overrides. The file is replaced
//! atomically and read back line by line; a damaged line only loses that
//! record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use webstore_policy::{PolicyOverride, StorageClass};

use crate::Result;

pub const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySection {
    /// Section key, derived from class, origin and name.
    pub key: String,
    pub class: StorageClass,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Path relative to the context root, always `/`-separated.
    pub data_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl EntrySection {
    pub fn new(
        class: StorageClass,
        origin: &str,
        name: Option<&str>,
        data_file: &Path,
        version: Option<&str>,
    ) -> Self {
        Self {
            key: section_key(class, origin, name),
            class,
            origin: origin.to_string(),
            name: name.map(str::to_string),
            data_file: relative_to_string(data_file),
            version: version.map(str::to_string),
        }
    }

    pub fn data_file_path(&self) -> PathBuf {
        self.data_file.split('/').collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum IndexRecord {
    Header {
        format: u32,
        written_at: DateTime<Utc>,
    },
    Entry(EntrySection),
    Policy(PolicyOverride),
}

/// SHA-256 hex of `"<class> <origin> <name>"`.
pub fn section_key(class: StorageClass, origin: &str, name: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(class.description().as_bytes());
    hasher.update(b" ");
    hasher.update(origin.as_bytes());
    hasher.update(b" ");
    hasher.update(name.unwrap_or("").as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn relative_to_string(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Replaces `path` with the given records. Nothing is left behind if
/// writing fails halfway.
pub fn write_index_file(
    path: &Path,
    entries: &[EntrySection],
    policies: &[PolicyOverride],
) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".to_string());
    let temp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let written = write_records(&temp, entries, policies).and_then(|()| {
        fs::rename(&temp, path)?;
        Ok(())
    });
    if written.is_err() {
        let _ = fs::remove_file(&temp);
    }
    written
}

fn write_records(path: &Path, entries: &[EntrySection], policies: &[PolicyOverride]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    let header = IndexRecord::Header {
        format: INDEX_FORMAT_VERSION,
        written_at: Utc::now(),
    };
    write_line(&mut out, &header)?;
    for entry in entries {
        write_line(&mut out, &IndexRecord::Entry(entry.clone()))?;
    }
    for policy in policies {
        write_line(&mut out, &IndexRecord::Policy(policy.clone()))?;
    }
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn write_line(out: &mut impl Write, record: &IndexRecord) -> Result<()> {
    serde_json::to_writer(&mut *out, record)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Reads every well-formed record. A missing file reads as empty.
pub fn read_index_file(path: &Path) -> Result<Vec<IndexRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IndexRecord>(&line) {
            Ok(record) => {
                if let IndexRecord::Header { format, .. } = &record {
                    if *format > INDEX_FORMAT_VERSION {
                        tracing::warn!(
                            path = %path.display(),
                            format,
                            "Index file has a newer format, reading what is understood"
                        );
                    }
                }
                records.push(record);
            }
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = number + 1,
                error = %e,
                "Skipping malformed index record"
            ),
        }
    }
    Ok(records)
}
