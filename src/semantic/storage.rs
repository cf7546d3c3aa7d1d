//! vectors.bin: the on-disk embedding store.
//!
//! A fixed 51-byte header followed by packed entries, everything
//! little-endian:
//!
//! ```text
//! magic        [u8; 4]   "PIXV"
//! version      u8        currently 1
//! model_id     [u8; 32]  SHA-256 of the embedding model name
//! dimensions   u16
//! entry_count  u64
//! checksum     u32       CRC32 over the 47 header bytes above
//!
//! entry: photo_id u64, content_hash u64, [f32; dimensions]
//! ```
//!
//! The content hash is the caption hash at embedding time; a load that
//! disagrees with the live caption marks the photo stale. Saves go
//! through a temp file, fsync, then rename.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::photos::StoredEmbedding;
use crate::semantic::index::{VectorEntry, VectorIndex};

const MAGIC: [u8; 4] = *b"PIXV";
const FORMAT_VERSION: u8 = 1;
const HEADER_SIZE: usize = 51;

/// Offset of the checksum field, i.e. how many header bytes it covers.
const CHECKSUM_OFFSET: usize = HEADER_SIZE - 4;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a vectors.bin file: {0}")]
    InvalidFormat(String),

    #[error("file written by format version {0}, this build reads up to {1}")]
    VersionMismatch(u8, u8),

    #[error("file belongs to a different embedding model")]
    ModelMismatch,

    #[error("header checksum does not match, file is corrupted")]
    ChecksumMismatch,

    #[error("expected {expected}-dimensional vectors, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Reads and writes one vectors.bin file.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Fill a prepared index from the file and return how many entries
    /// made it in.
    ///
    /// The index dictates the expected dimensions and keeps its cluster
    /// layout. Entries the index rejects (zero norm) are logged and
    /// skipped rather than failing the load.
    pub fn load_into(
        &self,
        index: &mut VectorIndex,
        expected_model_id: &[u8; 32],
    ) -> Result<usize, VectorStorageError> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let header = read_header(&mut reader)?;

        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }
        if header.dimensions as usize != index.dimensions() {
            return Err(VectorStorageError::DimensionMismatch {
                expected: index.dimensions(),
                got: header.dimensions as usize,
            });
        }

        let mut loaded = 0;
        for _ in 0..header.entry_count {
            let (id, content_hash, embedding) =
                read_entry(&mut reader, header.dimensions as usize)?;
            match index.insert(id, content_hash, embedding) {
                Ok(()) => loaded += 1,
                Err(err) => {
                    log::warn!("skipping unusable stored vector for photo {id}: {err}");
                }
            }
        }

        Ok(loaded)
    }

    /// Raw entry dump, no index involved.
    ///
    /// This is how staleness checks learn which photos already carry an
    /// embedding for the model without paying for index construction.
    pub fn load_entries(
        &self,
        expected_model_id: &[u8; 32],
    ) -> Result<Vec<StoredEmbedding>, VectorStorageError> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let header = read_header(&mut reader)?;

        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            let (photo_id, content_hash, vector) =
                read_entry(&mut reader, header.dimensions as usize)?;
            entries.push(StoredEmbedding {
                photo_id,
                content_hash,
                vector,
            });
        }

        Ok(entries)
    }

    /// Persist the whole index, replacing the previous file atomically.
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        if let Err(err) = self.write_to(&temp_path, index, model_id) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_to(
        &self,
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let mut writer = BufWriter::new(File::create(path)?);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions: index.dimensions() as u16,
            entry_count: index.len() as u64,
        };
        writer.write_all(&header.encode())?;

        // Entries go out in id order so identical indexes produce
        // identical files
        let mut ids: Vec<u64> = index.iter().map(|(id, _)| id).collect();
        ids.sort_unstable();
        for id in ids {
            let entry = index.get(id).ok_or_else(|| {
                VectorStorageError::InvalidFormat(format!("entry {id} vanished during save"))
            })?;
            write_entry(&mut writer, id, entry)?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&MAGIC);
        bytes[4] = self.version;
        bytes[5..37].copy_from_slice(&self.model_id);
        bytes[37..39].copy_from_slice(&self.dimensions.to_le_bytes());
        bytes[39..47].copy_from_slice(&self.entry_count.to_le_bytes());
        let checksum = crc32fast::hash(&bytes[..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Header, VectorStorageError> {
        if bytes[0..4] != MAGIC {
            return Err(VectorStorageError::InvalidFormat(
                "missing PIXV magic".to_string(),
            ));
        }

        let version = bytes[4];
        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored = u32::from_le_bytes(take(&bytes[CHECKSUM_OFFSET..]));
        if stored != crc32fast::hash(&bytes[..CHECKSUM_OFFSET]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&bytes[5..37]);

        Ok(Header {
            version,
            model_id,
            dimensions: u16::from_le_bytes(take(&bytes[37..39])),
            entry_count: u64::from_le_bytes(take(&bytes[39..47])),
        })
    }
}

/// Copy the first N bytes of a slice into an array for from_le_bytes.
fn take<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}

fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;
    Header::decode(&bytes)
}

fn read_entry(
    reader: &mut impl Read,
    dimensions: usize,
) -> Result<(u64, u64, Vec<f32>), VectorStorageError> {
    let mut word = [0u8; 8];
    reader.read_exact(&mut word)?;
    let id = u64::from_le_bytes(word);

    reader.read_exact(&mut word)?;
    let content_hash = u64::from_le_bytes(word);

    let mut raw = vec![0u8; dimensions * 4];
    reader.read_exact(&mut raw)?;
    let embedding = raw
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(take(chunk)))
        .collect();

    Ok((id, content_hash, embedding))
}

fn write_entry(
    writer: &mut impl Write,
    id: u64,
    entry: &VectorEntry,
) -> Result<(), VectorStorageError> {
    writer.write_all(&id.to_le_bytes())?;
    writer.write_all(&entry.content_hash.to_le_bytes())?;
    for &value in &entry.embedding {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}
