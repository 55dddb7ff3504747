//! ALFA Docs Vault - Cipher Engine
//!
//! Chunked authenticated encryption of document streams.
//!
//! Blob format (big-endian):
//! ```text
//! [MAGIC 8B]["ALFADOCS"]
//! [VERSION 1B][0x01]
//! [ALGORITHM 1B][1 = AES-256-GCM, 2 = XChaCha20-Poly1305]
//! [CHUNK SIZE 4B][plaintext bytes per chunk]
//! [CIPHERTEXT LEN 8B][total length of all chunks below]
//! [KEY SALT 32B][per-blob HKDF salt]
//! [NONCE PREFIX 7B | 19B][random]
//! [CHUNK 0][ciphertext][TAG 16B]
//! ...
//! [CHUNK n][ciphertext][TAG 16B]
//! ```
//!
//! Every blob gets a fresh subkey `HKDF(DEK, salt, "ALFA:DOCS:BLOB:v1" || alg)`
//! and chunk `i` uses nonce `prefix || i (u32) || last flag`, so a nonce is
//! never reused under one key and chunks cannot be reordered, dropped or
//! truncated without failing authentication. The header (except the length
//! field, which is checked structurally) is bound to each chunk as AAD.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::crypto::{
    aead, contexts, derive_key, fill_random, CipherSuite, ScopedKey, KEY_LEN, SALT_LEN, TAG_LEN,
};
use crate::error::{VaultError, VaultResult};
use crate::secure_fs::EphemeralPlaintext;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic bytes identifying an ALFA Docs encrypted blob
pub const MAGIC: &[u8; 8] = b"ALFADOCS";

/// Current format version
pub const FORMAT_VERSION: u8 = 0x01;

/// Default plaintext bytes per chunk (64 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

pub const MIN_CHUNK_SIZE: u32 = 4 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Counter (4) + last-chunk flag (1)
const NONCE_SUFFIX_LEN: usize = 5;

/// Offset of the ciphertext length field: MAGIC(8) + VERSION(1) + ALG(1) + CHUNK(4)
const CT_LEN_OFFSET: usize = 14;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Parsed blob header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    pub version: u8,
    pub suite: CipherSuite,
    pub chunk_size: u32,
    pub ciphertext_len: u64,
    pub key_salt: [u8; SALT_LEN],
    pub nonce_prefix: Vec<u8>,
}

impl BlobHeader {
    fn generate(suite: CipherSuite, chunk_size: u32) -> Self {
        let mut key_salt = [0u8; SALT_LEN];
        fill_random(&mut key_salt);
        let mut nonce_prefix = vec![0u8; suite.nonce_len() - NONCE_SUFFIX_LEN];
        fill_random(&mut nonce_prefix);

        Self {
            version: FORMAT_VERSION,
            suite,
            chunk_size,
            ciphertext_len: 0,
            key_salt,
            nonce_prefix,
        }
    }

    /// Encoded size for a suite
    pub fn encoded_len(suite: CipherSuite) -> usize {
        CT_LEN_OFFSET + 8 + SALT_LEN + suite.nonce_len() - NONCE_SUFFIX_LEN
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(self.suite));
        out.extend_from_slice(MAGIC);
        out.push(self.version);
        out.push(self.suite.id());
        out.extend_from_slice(&self.chunk_size.to_be_bytes());
        out.extend_from_slice(&self.ciphertext_len.to_be_bytes());
        out.extend_from_slice(&self.key_salt);
        out.extend_from_slice(&self.nonce_prefix);
        out
    }

    /// Header bytes authenticated with every chunk
    fn aad(&self) -> Vec<u8> {
        let encoded = self.encode();
        let mut aad = Vec::with_capacity(encoded.len() - 8);
        aad.extend_from_slice(&encoded[..CT_LEN_OFFSET]);
        aad.extend_from_slice(&encoded[CT_LEN_OFFSET + 8..]);
        aad
    }

    pub fn read_from<R: Read>(reader: &mut R) -> VaultResult<Self> {
        let mut fixed = [0u8; CT_LEN_OFFSET + 8 + SALT_LEN];
        read_exact_or_malformed(reader, &mut fixed, "truncated header")?;

        if &fixed[..8] != MAGIC {
            return Err(VaultError::MalformedBlob("not an ALFA Docs blob (bad magic)".into()));
        }

        let version = fixed[8];
        if version != FORMAT_VERSION {
            return Err(VaultError::MalformedBlob(format!(
                "unsupported format version {}",
                version
            )));
        }

        let suite = CipherSuite::from_id(fixed[9])
            .ok_or_else(|| VaultError::MalformedBlob(format!("unknown algorithm id {}", fixed[9])))?;

        let chunk_size = u32::from_be_bytes([fixed[10], fixed[11], fixed[12], fixed[13]]);
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(VaultError::MalformedBlob(format!("chunk size {} out of range", chunk_size)));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&fixed[CT_LEN_OFFSET..CT_LEN_OFFSET + 8]);
        let ciphertext_len = u64::from_be_bytes(len_bytes);

        let mut key_salt = [0u8; SALT_LEN];
        key_salt.copy_from_slice(&fixed[CT_LEN_OFFSET + 8..]);

        let mut nonce_prefix = vec![0u8; suite.nonce_len() - NONCE_SUFFIX_LEN];
        read_exact_or_malformed(reader, &mut nonce_prefix, "truncated header")?;

        Ok(Self {
            version,
            suite,
            chunk_size,
            ciphertext_len,
            key_salt,
            nonce_prefix,
        })
    }

    fn chunk_nonce(&self, counter: u32, last: bool) -> Vec<u8> {
        let mut nonce = Vec::with_capacity(self.suite.nonce_len());
        nonce.extend_from_slice(&self.nonce_prefix);
        nonce.extend_from_slice(&counter.to_be_bytes());
        nonce.push(last as u8);
        nonce
    }

    fn subkey(&self, key: &ScopedKey) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
        let mut info = contexts::BLOB.to_vec();
        info.push(self.suite.id());
        derive_key(key.expose(), &self.key_salt, &info)
    }

    /// Chunk layout implied by `ciphertext_len`: (count, length of last chunk)
    fn chunk_layout(&self) -> VaultResult<(u32, usize)> {
        let full = self.chunk_size as u64 + TAG_LEN as u64;
        if self.ciphertext_len < TAG_LEN as u64 {
            return Err(VaultError::MalformedBlob("ciphertext shorter than one tag".into()));
        }

        let count = self.ciphertext_len.div_ceil(full);
        let last = self.ciphertext_len - (count - 1) * full;
        if last < TAG_LEN as u64 {
            return Err(VaultError::MalformedBlob("final chunk shorter than tag".into()));
        }
        let count = u32::try_from(count)
            .map_err(|_| VaultError::MalformedBlob("too many chunks".into()))?;

        Ok((count, last as usize))
    }
}

// ---------------------------------------------------------------------------
// Blob and helpers
// ---------------------------------------------------------------------------

/// In-memory encrypted blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    bytes: Vec<u8>,
}

impl EncryptedBlob {
    /// Wrap stored bytes after a structural header check
    pub fn from_bytes(bytes: Vec<u8>) -> VaultResult<Self> {
        BlobHeader::read_from(&mut bytes.as_slice())?;
        Ok(Self { bytes })
    }

    pub fn header(&self) -> VaultResult<BlobHeader> {
        BlobHeader::read_from(&mut self.bytes.as_slice())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// What an encryption pass produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobSummary {
    pub suite: CipherSuite,
    pub chunk_size: u32,
    pub chunks: u32,
    pub plaintext_len: u64,
    pub ciphertext_len: u64,
    pub total_len: u64,
}

/// Cooperative cancellation, checked between chunks
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn check_cancel(cancel: Option<&CancelFlag>) -> VaultResult<()> {
    match cancel {
        Some(flag) if flag.is_cancelled() => Err(VaultError::Cancelled),
        _ => Ok(()),
    }
}

fn read_exact_or_malformed<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> VaultResult<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => VaultError::MalformedBlob(what.to_string()),
        _ => VaultError::IoError(e),
    })
}

/// Read until `buf` is full or the stream ends
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// CipherEngine
// ---------------------------------------------------------------------------

/// Stateless engine; calls may run in parallel
#[derive(Debug, Clone)]
pub struct CipherEngine {
    suite: CipherSuite,
    chunk_size: u32,
    scratch_dir: Option<PathBuf>,
}

impl Default for CipherEngine {
    fn default() -> Self {
        Self {
            suite: CipherSuite::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            scratch_dir: None,
        }
    }
}

impl CipherEngine {
    pub fn new(suite: CipherSuite, chunk_size: u32) -> VaultResult<Self> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(VaultError::InvalidConfig(format!(
                "chunk size must be between {} and {} bytes",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        Ok(Self {
            suite,
            chunk_size,
            scratch_dir: None,
        })
    }

    /// Directory for ephemeral plaintext files (default: OS temp dir)
    pub fn with_scratch_dir(mut self, dir: &Path) -> Self {
        self.scratch_dir = Some(dir.to_path_buf());
        self
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ENCRYPT
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt a stream chunk by chunk. Peak memory is two chunks.
    ///
    /// The length field is patched in place once the stream ends, hence `Seek`.
    pub fn encrypt_stream<R: Read, W: Write + Seek>(
        &self,
        reader: &mut R,
        writer: &mut W,
        key: &ScopedKey,
        cancel: Option<&CancelFlag>,
    ) -> VaultResult<BlobSummary> {
        check_cancel(cancel)?;

        let mut header = BlobHeader::generate(self.suite, self.chunk_size);
        let subkey = header.subkey(key)?;
        let aad = header.aad();

        let start = writer.stream_position()?;
        writer.write_all(&header.encode())?;

        let chunk_len = self.chunk_size as usize;
        let mut current = Zeroizing::new(vec![0u8; chunk_len]);
        let mut next = Zeroizing::new(vec![0u8; chunk_len]);
        let mut current_len = read_full(reader, &mut current)?;

        let mut counter: u32 = 0;
        let mut plaintext_len: u64 = 0;
        let mut ciphertext_len: u64 = 0;

        loop {
            check_cancel(cancel)?;

            // one chunk of lookahead decides the last-chunk flag
            let next_len = if current_len == chunk_len {
                read_full(reader, &mut next)?
            } else {
                0
            };
            let last = next_len == 0;

            let nonce = header.chunk_nonce(counter, last);
            let sealed = aead::seal(self.suite, &subkey, &nonce, &current[..current_len], &aad)?;
            writer.write_all(&sealed)?;

            plaintext_len += current_len as u64;
            ciphertext_len += sealed.len() as u64;

            if last {
                break;
            }

            counter = counter
                .checked_add(1)
                .ok_or_else(|| VaultError::Crypto("chunk counter exhausted".into()))?;
            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
        }

        header.ciphertext_len = ciphertext_len;
        let end = writer.stream_position()?;
        writer.seek(SeekFrom::Start(start + CT_LEN_OFFSET as u64))?;
        writer.write_all(&ciphertext_len.to_be_bytes())?;
        writer.seek(SeekFrom::Start(end))?;
        writer.flush()?;

        log::debug!(
            "Encrypted {} bytes in {} chunks ({})",
            plaintext_len,
            counter + 1,
            self.suite.name()
        );

        Ok(BlobSummary {
            suite: self.suite,
            chunk_size: self.chunk_size,
            chunks: counter + 1,
            plaintext_len,
            ciphertext_len,
            total_len: end - start,
        })
    }

    /// Encrypt an in-memory buffer
    pub fn encrypt(&self, plaintext: &[u8], key: &ScopedKey) -> VaultResult<EncryptedBlob> {
        let mut out = Cursor::new(Vec::new());
        self.encrypt_stream(&mut &plaintext[..], &mut out, key, None)?;
        Ok(EncryptedBlob {
            bytes: out.into_inner(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DECRYPT
    // ═══════════════════════════════════════════════════════════════════════

    /// Decrypt into an ephemeral plaintext file.
    ///
    /// Nothing is returned unless every chunk authenticated; on any error the
    /// partially written scratch file is wiped before this returns.
    pub fn decrypt<R: Read>(
        &self,
        reader: &mut R,
        key: &ScopedKey,
        cancel: Option<&CancelFlag>,
    ) -> VaultResult<EphemeralPlaintext> {
        check_cancel(cancel)?;
        let header = BlobHeader::read_from(reader)?;
        let mut plaintext = EphemeralPlaintext::create(self.scratch_dir.as_deref())?;

        self.decrypt_chunks(&header, reader, key, cancel, |chunk| plaintext.append(chunk))?;

        plaintext.finish()?;
        Ok(plaintext)
    }

    /// Decrypt an in-memory blob straight into zeroizing memory
    pub fn decrypt_to_vec(
        &self,
        blob: &EncryptedBlob,
        key: &ScopedKey,
    ) -> VaultResult<Zeroizing<Vec<u8>>> {
        let mut reader = blob.as_bytes();
        let header = BlobHeader::read_from(&mut reader)?;
        let mut out = Zeroizing::new(Vec::new());

        self.decrypt_chunks(&header, &mut reader, key, None, |chunk| {
            out.extend_from_slice(chunk);
            Ok(())
        })?;

        Ok(out)
    }

    fn decrypt_chunks<R, F>(
        &self,
        header: &BlobHeader,
        reader: &mut R,
        key: &ScopedKey,
        cancel: Option<&CancelFlag>,
        mut sink: F,
    ) -> VaultResult<()>
    where
        R: Read,
        F: FnMut(&[u8]) -> VaultResult<()>,
    {
        let (count, last_len) = header.chunk_layout()?;
        let subkey = header.subkey(key)?;
        let aad = header.aad();

        let full_len = header.chunk_size as usize + TAG_LEN;
        let mut buf = vec![0u8; full_len];

        for counter in 0..count {
            check_cancel(cancel)?;

            let last = counter + 1 == count;
            let len = if last { last_len } else { full_len };
            read_exact_or_malformed(reader, &mut buf[..len], "blob truncated")?;

            let nonce = header.chunk_nonce(counter, last);
            let chunk = aead::open(header.suite, &subkey, &nonce, &buf[..len], &aad)?;
            sink(chunk.as_slice())?;
        }

        let mut probe = [0u8; 1];
        if read_full(reader, &mut probe)? != 0 {
            return Err(VaultError::MalformedBlob("trailing data after final chunk".into()));
        }

        Ok(())
    }
}
