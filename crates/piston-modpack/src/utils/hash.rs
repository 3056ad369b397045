use crate::error::{InstallError, InstallResult, IoResultExt};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha512;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

const READ_CHUNK_SIZE: usize = 8192;

/// Digest algorithms understood by the pipeline. Hex names match the keys used
/// in `modrinth.index.json` hash maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(format!("unsupported hash algorithm: {}", other)),
        }
    }
}

/// Every identifier the catalogs can look a file up by, computed in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHashes {
    pub sha1: String,
    pub sha512: String,
    /// CurseForge fingerprint (MurmurHash2 over non-whitespace bytes)
    pub fingerprint: u32,
    pub size: u64,
}

/// An expected digest attached to a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedHash {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl ExpectedHash {
    pub fn sha1(hex: impl Into<String>) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha1,
            hex: hex.into(),
        }
    }

    pub fn sha512(hex: impl Into<String>) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha512,
            hex: hex.into(),
        }
    }
}

/// Incremental hasher for streaming downloads.
pub enum StreamingHasher {
    Sha1(Sha1),
    Sha512(Sha512),
}

impl StreamingHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => StreamingHasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha512 => StreamingHasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            StreamingHasher::Sha1(h) => h.update(bytes),
            StreamingHasher::Sha512(h) => h.update(bytes),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            StreamingHasher::Sha1(h) => format!("{:x}", h.finalize()),
            StreamingHasher::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

pub fn digests_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> InstallResult<String> {
    let mut file = File::open(path).at_path(path)?;
    let mut hasher = StreamingHasher::new(algorithm);
    let mut buffer = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = file.read(&mut buffer).at_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize_hex())
}

pub fn sha1_file(path: &Path) -> InstallResult<String> {
    hash_file(path, HashAlgorithm::Sha1)
}

pub fn sha512_file(path: &Path) -> InstallResult<String> {
    hash_file(path, HashAlgorithm::Sha512)
}

/// Calculates sha1, sha512 and the CurseForge fingerprint of a file.
pub fn content_hashes(path: &Path) -> InstallResult<ContentHashes> {
    let mut file = File::open(path).at_path(path)?;
    let mut sha1 = Sha1::new();
    let mut sha512 = Sha512::new();
    let mut fingerprint_input = Vec::new();
    let mut size = 0u64;
    let mut buffer = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = file.read(&mut buffer).at_path(path)?;
        if n == 0 {
            break;
        }
        let chunk = &buffer[..n];
        sha1.update(chunk);
        sha512.update(chunk);
        fingerprint_input.extend(chunk.iter().copied().filter(|b| !is_fingerprint_whitespace(*b)));
        size += n as u64;
    }

    Ok(ContentHashes {
        sha1: format!("{:x}", sha1.finalize()),
        sha512: format!("{:x}", sha512.finalize()),
        fingerprint: murmur2::murmur2(&fingerprint_input, 1),
        size,
    })
}

/// CurseForge fingerprint: MurmurHash2 (seed 1) skipping TAB, LF, CR and SPACE.
pub fn curseforge_fingerprint(bytes: &[u8]) -> u32 {
    let filtered: Vec<u8> = bytes
        .iter()
        .copied()
        .filter(|b| !is_fingerprint_whitespace(*b))
        .collect();
    murmur2::murmur2(&filtered, 1)
}

fn is_fingerprint_whitespace(b: u8) -> bool {
    matches!(b, 9 | 10 | 13 | 32)
}

/// Verify a file against an expected digest.
pub fn verify_file(path: &Path, expected: &ExpectedHash) -> InstallResult<()> {
    let actual = hash_file(path, expected.algorithm)?;
    if digests_match(&actual, &expected.hex) {
        Ok(())
    } else {
        Err(InstallError::IntegrityMismatch {
            path: path.to_path_buf(),
            algorithm: expected.algorithm.to_string(),
            expected: expected.hex.clone(),
            actual,
        })
    }
}

pub async fn hash_file_async(path: PathBuf, algorithm: HashAlgorithm) -> InstallResult<String> {
    tokio::task::spawn_blocking(move || hash_file(&path, algorithm))
        .await
        .map_err(|e| InstallError::io(PathBuf::new(), std::io::Error::other(e)))?
}

pub async fn content_hashes_async(path: PathBuf) -> InstallResult<ContentHashes> {
    tokio::task::spawn_blocking(move || content_hashes(&path))
        .await
        .map_err(|e| InstallError::io(PathBuf::new(), std::io::Error::other(e)))?
}
