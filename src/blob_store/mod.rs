//! Content-addressed blob store (§4.3): a directory of files named by the
//! SHA-1 digest of their contents.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// A raw 20-byte SHA-1 digest, the unique identifier of a blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlobKey(pub [u8; 20]);

impl BlobKey {
    pub fn compute_from(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        BlobKey(bytes)
    }

    pub fn base64_string(&self) -> String {
        base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, self.0)
    }

    pub fn filename(&self) -> String {
        format!("{}.blob", self.base64_string())
    }
}

/// Encryption algorithm applied to blob files at rest. `None` is fully
/// implemented; other variants are a named but unimplemented seam rather
/// than silently ignored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[default]
    None,
    Aes256,
}

#[derive(Clone, Debug)]
pub struct BlobStoreOptions {
    pub create: bool,
    pub writeable: bool,
    pub encryption_algorithm: EncryptionAlgorithm,
    pub encryption_key: Option<Vec<u8>>,
}

impl Default for BlobStoreOptions {
    fn default() -> Self {
        Self {
            create: true,
            writeable: true,
            encryption_algorithm: EncryptionAlgorithm::None,
            encryption_key: None,
        }
    }
}

/// A handle to a (possibly nonexistent) blob on disk.
pub struct Blob {
    path: PathBuf,
    key: BlobKey,
}

impl Blob {
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn key(&self) -> BlobKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size on disk. An overestimate of the plaintext length when the
    /// store is encrypted; callers must treat it as an upper bound.
    pub fn content_length(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    pub fn contents(&self) -> Result<Vec<u8>> {
        let mut f = File::open(&self.path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn read(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }

    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Manages a content-addressable store of binary blobs, stored as files in
/// a directory.
pub struct BlobStore {
    dir: PathBuf,
    options: BlobStoreOptions,
}

impl BlobStore {
    pub fn open(dir: impl AsRef<Path>, options: BlobStoreOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            if options.create {
                fs::create_dir_all(&dir)?;
            } else {
                return Err(Error::CantOpenFile(dir));
            }
        }
        Ok(Self { dir, options })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &BlobStoreOptions {
        &self.options
    }

    pub fn is_encrypted(&self) -> bool {
        self.options.encryption_algorithm != EncryptionAlgorithm::None
    }

    /// Changes the algorithm/key new blobs are written with. Existing blob
    /// files are never re-encrypted in place (this binding has no blob
    /// encryption to re-encrypt with in the first place — see
    /// [`BlobWriteStream::new`]) — rekeying to anything but
    /// [`EncryptionAlgorithm::None`] reports [`Error::Unimplemented`].
    pub fn rekey(&mut self, algorithm: EncryptionAlgorithm, key: Option<Vec<u8>>) -> Result<()> {
        if algorithm != EncryptionAlgorithm::None {
            return Err(Error::Unimplemented("blob store rekeying to an encrypted algorithm"));
        }
        self.options.encryption_algorithm = algorithm;
        self.options.encryption_key = key;
        Ok(())
    }

    pub fn has(&self, key: &BlobKey) -> bool {
        self.get(key).exists()
    }

    pub fn get(&self, key: &BlobKey) -> Blob {
        Blob {
            path: self.dir.join(key.filename()),
            key: *key,
        }
    }

    /// Write `data` in one shot and install it, the common-case convenience
    /// wrapper over the streaming [`BlobWriteStream`] protocol.
    pub fn put(&self, data: &[u8]) -> Result<Blob> {
        let mut writer = self.new_write_stream()?;
        writer.write(data)?;
        writer.install()
    }

    pub fn new_write_stream(&self) -> Result<BlobWriteStream> {
        BlobWriteStream::new(&self.dir, self.options.encryption_algorithm)
    }

    pub fn delete_store(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self.iter_blob_files()?.count() as u64)
    }

    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in self.iter_blob_files()? {
            total += entry.metadata()?.len();
        }
        Ok(total)
    }

    fn iter_blob_files(&self) -> Result<impl Iterator<Item = fs::DirEntry>> {
        Ok(fs::read_dir(&self.dir)?.filter_map(|e| e.ok()).filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.ends_with(".blob"))
        }))
    }
}

/// A stream for writing a new blob: compute the digest while streaming, then
/// atomically install the finished file under its content-addressed name.
pub struct BlobWriteStream {
    dir: PathBuf,
    tmp_path: PathBuf,
    file: File,
    hasher: Sha1,
    key: Option<BlobKey>,
    encryption: EncryptionAlgorithm,
}

impl BlobWriteStream {
    fn new(dir: &Path, encryption: EncryptionAlgorithm) -> Result<Self> {
        if encryption != EncryptionAlgorithm::None {
            return Err(Error::Unimplemented("blob file encryption"));
        }
        let tmp_name = format!("{:x}.tmp", rand::random::<u64>());
        let tmp_path = dir.join(tmp_name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            tmp_path,
            file,
            hasher: Sha1::new(),
            key: None,
            encryption,
        })
    }

    /// Append bytes and feed the running digest. May be called repeatedly.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.key.is_some() {
            return Err(Error::InvalidParameter(
                "cannot write after computeKey()".into(),
            ));
        }
        self.file.write_all(data)?;
        self.hasher.update(data);
        Ok(())
    }

    /// Finalizes the digest and returns the blob key. No more writes are
    /// permitted afterward.
    pub fn compute_key(&mut self) -> BlobKey {
        if let Some(key) = self.key {
            return key;
        }
        let digest = self.hasher.clone().finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        let key = BlobKey(bytes);
        self.key = Some(key);
        key
    }

    /// Closes the temp file and renames it into place under its key. If a
    /// file with that name already exists, the temp file is discarded
    /// instead — dedup by construction, idempotent either way.
    pub fn install(mut self) -> Result<Blob> {
        let key = self.compute_key();
        self.file.flush()?;
        drop(self.file);

        let final_path = self.dir.join(key.filename());
        if final_path.exists() {
            fs::remove_file(&self.tmp_path)?;
        } else {
            fs::rename(&self.tmp_path, &final_path)?;
        }
        Ok(Blob {
            path: final_path,
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_and_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path(), BlobStoreOptions::default()).unwrap();

        let data = b"hello blob store";
        let blob = store.put(data).unwrap();
        assert!(blob.exists());
        assert_eq!(blob.contents().unwrap(), data);

        let key = BlobKey::compute_from(data);
        assert_eq!(blob.path().file_name().unwrap(), key.filename().as_str());
    }

    #[test]
    fn duplicate_put_does_not_duplicate_file() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path(), BlobStoreOptions::default()).unwrap();

        let data = vec![7u8; 1024];
        let blob1 = store.put(&data).unwrap();
        let blob2 = store.put(&data).unwrap();
        assert_eq!(blob1.path(), blob2.path());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn has_reflects_existence() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path(), BlobStoreOptions::default()).unwrap();
        let key = BlobKey::compute_from(b"not written");
        assert!(!store.has(&key));

        let blob = store.put(b"not written").unwrap();
        assert!(store.has(&blob.key()));
    }

    #[test]
    fn write_after_compute_key_rejected() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path(), BlobStoreOptions::default()).unwrap();
        let mut writer = store.new_write_stream().unwrap();
        writer.write(b"part one").unwrap();
        writer.compute_key();
        assert!(writer.write(b"part two").is_err());
    }

    #[test]
    fn total_size_and_count_aggregate_directory() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path(), BlobStoreOptions::default()).unwrap();
        store.put(b"aaaa").unwrap();
        store.put(b"bbbbbbbb").unwrap();
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.total_size().unwrap(), 12);
    }
}
