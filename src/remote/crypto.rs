//! Per-file encryption envelope for remote uploads.
//!
//! Each logical file gets a one-time 32-byte data key. The key is never
//! stored: it is derived from an ML-KEM-768 encapsulation against the
//! operator's long-lived public key, and the encapsulation ciphertext (plus
//! the KDF salt) travels in a header prepended to the file's first chunk.
//! Every chunk's plaintext is sealed as one self-contained AEAD record
//! whose associated data is the chunk's sequence number, so a downstream
//! decryptor processes the file as an ordered sequence of records without
//! seeking backward, and out-of-order records fail authentication.
//!
//! Wire layout:
//!   chunk 0:  [u64 LE header_len][base64 header][record]
//!   chunk N:  [record]
//!   header:   base64 of [u32 LE kem_ct_len][kem_ct][u32 LE info_len][info]
//!   record:   [u32 LE payload_len][nonce(12) | ciphertext | tag(16)]

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Upper bound on the encoded key header; ML-KEM-768 ciphertext is 1088
/// bytes, so anything near this limit is corrupt input.
const MAX_KEY_HEADER_LEN: u64 = 16 * 1024;

/// Upper bound on a single record, to keep corrupt length prefixes from
/// allocating unbounded memory.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Long-lived recipient public key, held by the recorder.
#[derive(Clone)]
pub struct RecipientPublicKey {
    key: kyber768::PublicKey,
}

/// Recipient secret key, held only by the offline decryption tool.
#[derive(Clone)]
pub struct RecipientSecretKey {
    key: kyber768::SecretKey,
}

/// Generate a fresh recipient keypair.
pub fn generate_keypair() -> (RecipientPublicKey, RecipientSecretKey) {
    let (public, secret) = kyber768::keypair();
    (
        RecipientPublicKey { key: public },
        RecipientSecretKey { key: secret },
    )
}

impl RecipientPublicKey {
    pub fn from_hex_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read public key file {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("decode public key hex")?;
        let key = kyber768::PublicKey::from_bytes(&bytes)
            .map_err(|_| anyhow!("invalid recipient public key"))?;
        Ok(Self { key })
    }

    pub fn write_hex_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, format!("{}\n", hex::encode(self.key.as_bytes())))
            .with_context(|| format!("write public key file {}", path.display()))
    }
}

impl RecipientSecretKey {
    pub fn from_hex_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read secret key file {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("decode secret key hex")?;
        let key = kyber768::SecretKey::from_bytes(&bytes)
            .map_err(|_| anyhow!("invalid recipient secret key"))?;
        Ok(Self { key })
    }

    pub fn write_hex_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, format!("{}\n", hex::encode(self.key.as_bytes())))
            .with_context(|| format!("write secret key file {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// Seals one logical file's chunks. Construction derives the file's data
/// key; the key material is zeroized when the encryptor is dropped.
pub struct FileEncryptor {
    dek: [u8; 32],
    header: Vec<u8>,
}

impl FileEncryptor {
    pub fn new(recipient: &RecipientPublicKey) -> Result<Self> {
        let (shared, kem_ct) = kyber768::encapsulate(&recipient.key);
        let mut kdf_info = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut kdf_info);
        let dek = derive_dek(shared.as_bytes(), &kdf_info);

        let mut raw = Vec::with_capacity(kem_ct.as_bytes().len() + kdf_info.len() + 8);
        raw.extend_from_slice(&(kem_ct.as_bytes().len() as u32).to_le_bytes());
        raw.extend_from_slice(kem_ct.as_bytes());
        raw.extend_from_slice(&(kdf_info.len() as u32).to_le_bytes());
        raw.extend_from_slice(&kdf_info);

        Ok(Self {
            dek,
            header: raw,
        })
    }

    /// Encoded key header, prepended (once) to the file's first chunk.
    pub fn key_header(&self) -> Vec<u8> {
        let encoded = BASE64.encode(&self.header);
        let mut out = Vec::with_capacity(8 + encoded.len());
        out.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
        out.extend_from_slice(encoded.as_bytes());
        out
    }

    /// Seal one chunk's plaintext into a length-prefixed record bound to
    /// its sequence number.
    pub fn seal_record(&self, sequence: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut buffer = plaintext.to_vec();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.dek));
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &sequence.to_le_bytes(), &mut buffer)
            .map_err(|_| anyhow!("chunk encryption failed"))?;

        let payload_len = NONCE_LEN + buffer.len() + TAG_LEN;
        let mut out = Vec::with_capacity(4 + payload_len);
        out.extend_from_slice(&(payload_len as u32).to_le_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&buffer);
        out.extend_from_slice(tag.as_slice());
        Ok(out)
    }
}

impl Drop for FileEncryptor {
    fn drop(&mut self) {
        self.dek.zeroize();
    }
}

/// Opens a sealed file front to back: key header first, then records in
/// sequence order. Never seeks backward.
pub struct FileDecryptor {
    dek: [u8; 32],
}

impl FileDecryptor {
    /// Read the key header from the start of the stream and recover the
    /// file's data key with the recipient secret key.
    pub fn from_stream<R: Read>(secret: &RecipientSecretKey, reader: &mut R) -> Result<Self> {
        let mut len_bytes = [0u8; 8];
        reader
            .read_exact(&mut len_bytes)
            .context("read key header length")?;
        let header_len = u64::from_le_bytes(len_bytes);
        if header_len == 0 || header_len > MAX_KEY_HEADER_LEN {
            return Err(anyhow!("key header length {} out of bounds", header_len));
        }
        let mut encoded = vec![0u8; header_len as usize];
        reader.read_exact(&mut encoded).context("read key header")?;
        let raw = BASE64
            .decode(&encoded)
            .map_err(|_| anyhow!("key header is not valid base64"))?;

        let mut cursor = 0usize;
        let kem_ct_len = read_u32(&raw, &mut cursor)? as usize;
        let kem_ct_bytes = read_slice(&raw, &mut cursor, kem_ct_len)?;
        let info_len = read_u32(&raw, &mut cursor)? as usize;
        let kdf_info = read_slice(&raw, &mut cursor, info_len)?;

        let kem_ct = kyber768::Ciphertext::from_bytes(kem_ct_bytes)
            .map_err(|_| anyhow!("invalid key encapsulation in header"))?;
        let shared = kyber768::decapsulate(&kem_ct, &secret.key);
        Ok(Self {
            dek: derive_dek(shared.as_bytes(), kdf_info),
        })
    }

    /// Read the next record's payload. `Ok(None)` at a clean end of stream.
    pub fn read_record<R: Read>(&self, reader: &mut R) -> Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        if !read_exact_or_eof(reader, &mut len_bytes)? {
            return Ok(None);
        }
        let payload_len = u32::from_le_bytes(len_bytes);
        if payload_len as usize > MAX_RECORD_LEN as usize {
            return Err(anyhow!("record length {} out of bounds", payload_len));
        }
        if (payload_len as usize) < NONCE_LEN + TAG_LEN {
            return Err(anyhow!("record length {} too short", payload_len));
        }
        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload).context("read record")?;
        Ok(Some(payload))
    }

    /// Decrypt one record payload, bound to its expected sequence number.
    pub fn open_record(&self, sequence: u64, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(anyhow!("record payload truncated"));
        }
        let (nonce, rest) = payload.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let mut buffer = ciphertext.to_vec();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.dek));
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                &sequence.to_le_bytes(),
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| anyhow!("record {} failed authentication", sequence))?;
        Ok(buffer)
    }

    /// Decrypt a whole sealed file into `writer`. Returns the number of
    /// plaintext bytes produced.
    pub fn decrypt_stream<R: Read, W: std::io::Write>(
        secret: &RecipientSecretKey,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<u64> {
        let decryptor = Self::from_stream(secret, reader)?;
        let mut sequence = 0u64;
        let mut total = 0u64;
        while let Some(payload) = decryptor.read_record(reader)? {
            let plaintext = decryptor.open_record(sequence, &payload)?;
            writer.write_all(&plaintext).context("write plaintext")?;
            total += plaintext.len() as u64;
            sequence += 1;
        }
        Ok(total)
    }
}

impl Drop for FileDecryptor {
    fn drop(&mut self) {
        self.dek.zeroize();
    }
}

fn derive_dek(shared_secret: &[u8], kdf_info: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(kdf_info);
    hasher.finalize().into()
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, cursor, 4)?;
    let mut out = [0u8; 4];
    out.copy_from_slice(slice);
    Ok(u32::from_le_bytes(out))
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .ok_or_else(|| anyhow!("key header truncated"))?;
    if end > bytes.len() {
        return Err(anyhow!("key header truncated"));
    }
    let slice = &bytes[*cursor..end];
    *cursor = end;
    Ok(slice)
}

/// Like `read_exact`, but distinguishes a clean end of stream (nothing
/// read at all) from a truncated read.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).context("read stream")?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(anyhow!("stream truncated mid-record"));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sealed_file(chunks: &[&[u8]]) -> (Vec<u8>, RecipientSecretKey) {
        let (public, secret) = generate_keypair();
        let encryptor = FileEncryptor::new(&public).unwrap();
        let mut file = encryptor.key_header();
        for (seq, chunk) in chunks.iter().enumerate() {
            file.extend(encryptor.seal_record(seq as u64, chunk).unwrap());
        }
        (file, secret)
    }

    #[test]
    fn round_trip_across_records() {
        let chunks: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 1000]).collect();
        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
        let (file, secret) = sealed_file(&refs);

        let mut out = Vec::new();
        let total =
            FileDecryptor::decrypt_stream(&secret, &mut Cursor::new(file), &mut out).unwrap();
        assert_eq!(total, 4000);
        assert_eq!(out, chunks.concat());
    }

    #[test]
    fn out_of_order_record_fails_authentication() {
        let (file, secret) = sealed_file(&[b"first", b"second"]);
        let mut reader = Cursor::new(file);
        let decryptor = FileDecryptor::from_stream(&secret, &mut reader).unwrap();
        let first = decryptor.read_record(&mut reader).unwrap().unwrap();
        let second = decryptor.read_record(&mut reader).unwrap().unwrap();
        // Records are bound to their position: swapping them must fail.
        assert!(decryptor.open_record(0, &second).is_err());
        assert!(decryptor.open_record(1, &first).is_err());
        assert_eq!(decryptor.open_record(0, &first).unwrap(), b"first");
    }

    #[test]
    fn tampered_record_fails_authentication() {
        let (mut file, secret) = sealed_file(&[b"payload"]);
        let last = file.len() - 1;
        file[last] ^= 0x01;
        let mut out = Vec::new();
        assert!(FileDecryptor::decrypt_stream(&secret, &mut Cursor::new(file), &mut out).is_err());
    }

    #[test]
    fn empty_final_record_round_trips() {
        let (file, secret) = sealed_file(&[b"data", b""]);
        let mut out = Vec::new();
        FileDecryptor::decrypt_stream(&secret, &mut Cursor::new(file), &mut out).unwrap();
        assert_eq!(out, b"data");
    }

    #[test]
    fn key_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (public, secret) = generate_keypair();
        let pub_path = dir.path().join("vigil.pub");
        let sec_path = dir.path().join("vigil.key");
        public.write_hex_file(&pub_path).unwrap();
        secret.write_hex_file(&sec_path).unwrap();

        let public2 = RecipientPublicKey::from_hex_file(&pub_path).unwrap();
        let secret2 = RecipientSecretKey::from_hex_file(&sec_path).unwrap();

        // A file sealed against the reloaded public key opens with the
        // reloaded secret key.
        let encryptor = FileEncryptor::new(&public2).unwrap();
        let mut file = encryptor.key_header();
        file.extend(encryptor.seal_record(0, b"check").unwrap());
        let mut out = Vec::new();
        FileDecryptor::decrypt_stream(&secret2, &mut Cursor::new(file), &mut out).unwrap();
        assert_eq!(out, b"check");
    }

    #[test]
    fn oversized_header_is_rejected() {
        let (_, secret) = generate_keypair();
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&(MAX_KEY_HEADER_LEN + 1).to_le_bytes());
        bogus.extend_from_slice(&[0u8; 64]);
        assert!(FileDecryptor::from_stream(&secret, &mut Cursor::new(bogus)).is_err());
    }
}
