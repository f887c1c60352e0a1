//! Durable response store: one sealed file per canonical key.
//!
//! Files live in a single directory, named by the base32-encoded key so the
//! store survives case-insensitive file systems. Each file holds one HTTP
//! response:
//!
//! | Field        | Type              | Description                          |
//! |--------------|-------------------|--------------------------------------|
//! | magic        | `[4]byte`         | `STS1`                               |
//! | body_size    | `u64` LE          | length of the body in bytes          |
//! | body_sha256  | `[32]byte`        | SHA-256 digest of the body           |
//! | json_size    | `u32` LE          | length of the metadata JSON          |
//! | json_crc32   | `u32` LE          | CRC-32/IEEE of the metadata JSON     |
//! | body_data    | `[body_size]byte` | raw response body                    |
//! | json_data    | `[json_size]byte` | JSON metadata describing the fetch   |
//!
//! A writer works on a `tmp-`-prefixed temp file and publishes it with a
//! single atomic rename, so a file either exists fully sealed or not at all.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"STS1";
const HEADER_SIZE: u64 = 52;
const TEMP_PREFIX: &str = "tmp-";
const FILE_SUFFIX: &str = ".bin";

/// Response headers as stored on disk: canonical-cased name to ordered
/// values.
pub type HeaderValues = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("incorrect magic")]
    CorruptMagic,
    #[error("metadata region is corrupt")]
    CorruptMetadata,
    #[error("metadata json too large: {0} bytes")]
    MetadataTooLarge(usize),
    #[error("encoding metadata: {0}")]
    EncodeMetadata(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Metadata describing one stored response.
///
/// Field names are part of the on-disk format; unknown fields are ignored
/// when reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "DownloadStartedTime")]
    pub download_started_time: DateTime<Utc>,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "StatusCode", default)]
    pub status_code: u16,
    #[serde(rename = "Proto", default)]
    pub proto: String,
    #[serde(rename = "Headers", default)]
    pub headers: HeaderValues,
    #[serde(rename = "Trailers", default)]
    pub trailers: HeaderValues,
}

impl DocumentMetadata {
    /// Returns the first value of a header, matching the name
    /// case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }
}

/// A directory of stored responses.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Opens a streaming writer for a new document.
    ///
    /// The writer owns a private temp file; nothing is visible in the store
    /// until [`DocumentWriter::close`] succeeds.
    pub fn writer(&self) -> Result<DocumentWriter, StoreError> {
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)?;
        file.as_file_mut().seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(DocumentWriter {
            file,
            dir: self.dir.clone(),
            hasher: Sha256::new(),
            body_len: 0,
        })
    }

    /// Loads the document stored under `key`.
    pub fn load(&self, key: &str) -> Result<Document, StoreError> {
        Document::open(self.dir.join(key_to_filename(key)))
    }

    /// Enumerates sealed documents, skipping temp files and foreign names.
    pub fn list(&self) -> Result<Vec<Entry>, StoreError> {
        let mut entries = Vec::new();
        for item in fs::read_dir(&self.dir)? {
            let item = item?;
            let name = item.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TEMP_PREFIX) || !name.ends_with(FILE_SUFFIX) {
                continue;
            }
            entries.push(Entry { path: item.path() });
        }
        Ok(entries)
    }
}

/// A sealed document found by [`Store::list`].
#[derive(Debug, Clone)]
pub struct Entry {
    path: PathBuf,
}

impl Entry {
    pub fn open(&self) -> Result<Document, StoreError> {
        Document::open(self.path.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Streaming writer that tees body bytes to disk and a running SHA-256.
pub struct DocumentWriter {
    file: NamedTempFile,
    dir: PathBuf,
    hasher: Sha256,
    body_len: u64,
}

impl Write for DocumentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.as_file_mut().write(buf)?;
        self.hasher.update(&buf[..n]);
        self.body_len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_file_mut().flush()
    }
}

impl DocumentWriter {
    /// Appends the metadata, seals the header, and atomically renames the
    /// file into place under `metadata.key`.
    ///
    /// Any failure before the rename removes the temp file and leaves no
    /// observable document.
    pub fn close(self, metadata: &DocumentMetadata) -> Result<(), StoreError> {
        let DocumentWriter {
            mut file,
            dir,
            hasher,
            body_len,
        } = self;

        let json = serde_json::to_vec(metadata).map_err(StoreError::EncodeMetadata)?;
        if json.len() > u32::MAX as usize {
            return Err(StoreError::MetadataTooLarge(json.len()));
        }

        let f = file.as_file_mut();
        f.write_all(&json)?;
        f.seek(SeekFrom::Start(0))?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(MAGIC);
        header[4..12].copy_from_slice(&body_len.to_le_bytes());
        header[12..44].copy_from_slice(&hasher.finalize());
        header[44..48].copy_from_slice(&(json.len() as u32).to_le_bytes());
        header[48..52].copy_from_slice(&crc32fast::hash(&json).to_le_bytes());
        f.write_all(&header)?;
        f.flush()?;

        let path = dir.join(key_to_filename(&metadata.key));
        file.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

/// An open, sealed document.
pub struct Document {
    pub metadata: DocumentMetadata,
    pub body_size: u64,
    pub body_sha256: [u8; 32],
    file: File,
}

impl Document {
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let mut file = File::open(path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        read_exact(&mut file, &mut header)?;
        if &header[0..4] != MAGIC {
            return Err(StoreError::CorruptMagic);
        }
        let body_size = le_u64(&header[4..12]);
        let mut body_sha256 = [0u8; 32];
        body_sha256.copy_from_slice(&header[12..44]);
        let json_size = le_u32(&header[44..48]);
        let json_crc32 = le_u32(&header[48..52]);

        file.seek(SeekFrom::Start(HEADER_SIZE + body_size))?;
        let mut json = vec![0u8; json_size as usize];
        read_exact(&mut file, &mut json)?;
        if crc32fast::hash(&json) != json_crc32 {
            return Err(StoreError::CorruptMetadata);
        }
        let metadata =
            serde_json::from_slice(&json).map_err(|_| StoreError::CorruptMetadata)?;

        Ok(Document {
            metadata,
            body_size,
            body_sha256,
            file,
        })
    }

    /// Returns a reader over the body region.
    pub fn body(&mut self) -> Result<impl Read + '_, StoreError> {
        self.file.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok((&mut self.file).take(self.body_size))
    }

    /// Reads the whole body into memory.
    pub fn read_body(&mut self) -> Result<Vec<u8>, StoreError> {
        let mut buf = Vec::with_capacity(self.body_size as usize);
        self.body()?.read_to_end(&mut buf)?;
        if (buf.len() as u64) < self.body_size {
            return Err(StoreError::UnexpectedEof);
        }
        Ok(buf)
    }

    /// Recomputes the body digest and compares it with the header.
    ///
    /// Loading never does this; callers that need the body verified ask for
    /// it explicitly.
    pub fn verify_body(&mut self) -> Result<bool, StoreError> {
        let body_size = self.body_size;
        let body_sha256 = self.body_sha256;
        let mut hasher = Sha256::new();
        let mut reader = self.body()?;
        let mut chunk = [0u8; 8192];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
            total += n as u64;
        }
        drop(reader);
        if total < body_size {
            return Err(StoreError::UnexpectedEof);
        }
        Ok(hasher.finalize()[..] == body_sha256)
    }
}

fn key_to_filename(key: &str) -> String {
    let mut name = base32::encode(base32::Alphabet::Rfc4648 { padding: true }, key.as_bytes());
    name.push_str(FILE_SUFFIX);
    name
}

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), StoreError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            StoreError::UnexpectedEof
        } else {
            StoreError::Io(e)
        }
    })
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}
