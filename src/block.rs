//! Block codec: compression, encryption, and the digest-prefix padding loop.
//!
//! A block travels through up to three transforms before it reaches a
//! store: deflate (only when a plaintext digest will ride in the URL),
//! AES-256-CBC (key derived from contents or from a passphrase), and a
//! random suffix that perturbs the stored digest until it lands near a
//! chosen target identifier.

use std::io::{Read, Write};

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::RngCore;

use crate::error::{LibernetError, Result};
use crate::hash::{match_score, Identifier};
use crate::store::BlockStore;
use crate::url::{self, UrlKind};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Largest block the system will persist.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Default number of leading bits a padded block must share with its target.
pub const DEFAULT_MATCH: u32 = 12;

/// Deflate level for all block compression.
pub const COMPRESS_LEVEL: u32 = 9;

/// CBC initialization vector: sixteen ASCII zero characters, a fixed value
/// so identical plaintext encrypts to identical ciphertext and deduplicates.
const AES_IV: [u8; 16] = [b'0'; 16];

/// How block plaintext is protected at rest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Encryption {
    /// Stored as-is; the URL carries the plaintext digest.
    None,
    /// AES key is the SHA-256 of the plaintext itself.
    ContentKey,
    /// AES key is the SHA-256 of this UTF-8 passphrase.
    Passphrase(String),
}

impl Encryption {
    fn is_encrypted(&self) -> bool {
        !matches!(self, Encryption::None)
    }
}

/// Codec tunables, threaded through call sites instead of living in
/// process-wide state so tests can shrink limits per instance.
#[derive(Clone, Debug)]
pub struct CodecConfig {
    pub max_block_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            max_block_size: MAX_BLOCK_SIZE,
        }
    }
}

pub(crate) fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        Compression::new(COMPRESS_LEVEL),
    );
    // writing to a Vec cannot fail
    encoder.write_all(data).expect("write to Vec");
    encoder.finish().expect("finish to Vec")
}

pub(crate) fn zlib_decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut output = Vec::new();
    decoder.read_to_end(&mut output).ok()?;
    Some(output)
}

fn aes_encrypt(key: &Identifier, data: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.as_bytes().into(), &AES_IV.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
}

fn aes_decrypt(key: &Identifier, data: &[u8]) -> Option<Vec<u8>> {
    Aes256CbcDec::new(key.as_bytes().into(), &AES_IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .ok()
}

/// Random suffixes for address matching.
///
/// The suffix is a 0x00 delimiter followed by non-zero random bytes. It
/// rides after the ciphertext when encrypting (so the recoverable
/// plaintext is untouched) and on the plaintext itself otherwise.
fn padding_suffixes(similar: bool, encrypting: bool, score: u32) -> (Vec<u8>, Vec<u8>) {
    if !similar {
        return (Vec::new(), Vec::new());
    }

    let mut random = vec![0u8; (score / 8 + 1) as usize];
    rand::thread_rng().fill_bytes(&mut random);
    let mut suffix = vec![0u8];
    suffix.extend(random.into_iter().filter(|b| *b != 0));

    if encrypting {
        (Vec::new(), suffix)
    } else {
        (suffix, Vec::new())
    }
}

/// Compressed form, kept only when it does not grow the data.
fn maybe_compress(data: &[u8]) -> Vec<u8> {
    let compressed = zlib_compress(data);

    if compressed.len() <= data.len() {
        compressed
    } else {
        data.to_vec()
    }
}

/// Drop the padding suffix: everything from the rightmost 0x00 on.
fn unpad(data: &[u8]) -> Option<&[u8]> {
    let delimiter = data.iter().rposition(|b| *b == 0)?;
    Some(&data[..delimiter])
}

/// Prepare `data` for storage, write it, and return the URL plus the
/// stored bytes.
///
/// When `similar` is given the preparation loops, drawing fresh random
/// suffixes until the stored digest shares at least `score` leading bits
/// with the target.
pub fn store(
    data: &[u8],
    store: &dyn BlockStore,
    encrypt: &Encryption,
    similar: Option<&Identifier>,
    score: u32,
) -> Result<(String, Vec<u8>)> {
    store_with(&CodecConfig::default(), data, store, encrypt, similar, score)
}

/// `store` with explicit limits.
pub fn store_with(
    config: &CodecConfig,
    data: &[u8],
    store: &dyn BlockStore,
    encrypt: &Encryption,
    similar: Option<&Identifier>,
    score: u32,
) -> Result<(String, Vec<u8>)> {
    if data.len() > config.max_block_size {
        return Err(LibernetError::BlockTooLarge {
            size: data.len(),
            max: config.max_block_size,
        });
    }

    loop {
        let (data_suffix, stored_suffix) =
            padding_suffixes(similar.is_some(), encrypt.is_encrypted(), score);
        let padded = [data, &data_suffix].concat();

        let (stored, address, block_url) = match encrypt {
            Encryption::None => {
                let address = Identifier::of(&padded);
                let block_url = url::for_data_block(&address, false);
                (padded, address, block_url)
            }
            Encryption::ContentKey => {
                let key = Identifier::of(&padded);
                let mut stored = aes_encrypt(&key, &maybe_compress(&padded));
                stored.extend_from_slice(&stored_suffix);
                let address = Identifier::of(&stored);
                let block_url = url::for_encrypted(&address, &key, UrlKind::Aes256);
                (stored, address, block_url)
            }
            Encryption::Passphrase(passphrase) => {
                let key = Identifier::of(passphrase.as_bytes());
                let mut stored = aes_encrypt(&key, &padded);
                stored.extend_from_slice(&stored_suffix);
                let address = Identifier::of(&stored);
                let block_url = url::for_encrypted(&address, &key, UrlKind::Passphrase);
                (stored, address, block_url)
            }
        };

        if let Some(target) = similar {
            if match_score(target, &address) < score {
                continue;
            }
        }

        if stored.len() > config.max_block_size {
            return Err(LibernetError::BlockTooLarge {
                size: stored.len(),
                max: config.max_block_size,
            });
        }

        store.put(&url::for_data_block(&address, false), &stored)?;
        return Ok((block_url, stored));
    }
}

/// Decode stored bytes back to the plaintext a URL promises.
///
/// Returns `Ok(None)` for bytes that do not decode under this URL (wrong
/// key, alien block found through a `like` query) and an error for bytes
/// that decode but fail their digest check.
pub fn unpack(block_url: &str, stored: &[u8], was_similar: bool) -> Result<Option<Vec<u8>>> {
    let parsed = url::parse(block_url)?;

    if parsed.kind == UrlKind::Like {
        return Err(LibernetError::InvalidUrl(block_url.to_string()));
    }

    let decrypted = match parsed.key {
        None => stored.to_vec(),
        Some(key) => {
            let ciphertext = if was_similar {
                match unpad(stored) {
                    Some(trimmed) => trimmed,
                    None => return Ok(None),
                }
            } else {
                stored
            };

            match aes_decrypt(&key, ciphertext) {
                Some(plain) => plain,
                None => return Ok(None),
            }
        }
    };

    if was_similar && parsed.key.is_none() {
        if Identifier::of(&decrypted) == parsed.address {
            return match unpad(&decrypted) {
                Some(plain) => Ok(Some(plain.to_vec())),
                None => Err(LibernetError::CorruptBlock {
                    url: block_url.to_string(),
                }),
            };
        }
        // fall through: older blocks may be compressed under a plaintext digest
    }

    if parsed.kind == UrlKind::Passphrase {
        // no plaintext digest to check against, and the payload was never
        // compressed by the codec
        return Ok(Some(decrypted));
    }

    let contents = parsed
        .contents
        .expect("data and aes256 URLs always carry a contents digest");

    if Identifier::of(&decrypted) == contents {
        return Ok(Some(decrypted));
    }

    let uncompressed = match zlib_decompress(&decrypted) {
        Some(plain) => plain,
        None => return Ok(None),
    };

    if Identifier::of(&uncompressed) != contents {
        return Err(LibernetError::CorruptBlock {
            url: block_url.to_string(),
        });
    }

    if parsed.key.is_none() && was_similar {
        return match unpad(&uncompressed) {
            Some(plain) => Ok(Some(plain.to_vec())),
            None => Err(LibernetError::CorruptBlock {
                url: block_url.to_string(),
            }),
        };
    }

    Ok(Some(uncompressed))
}

/// Read a block through a store and decode it.
///
/// A `password` on a data-shaped URL rewrites it to the passphrase form
/// before the read, which is how discovery probes candidate blocks.
pub fn fetch(
    block_url: &str,
    store: &dyn BlockStore,
    was_similar: bool,
    password: Option<&str>,
) -> Result<Option<Vec<u8>>> {
    let mut target = block_url.to_string();

    if let Some(passphrase) = password {
        let parsed = url::parse(block_url)?;

        if parsed.kind == UrlKind::Data {
            let key = Identifier::of(passphrase.as_bytes());
            target = url::for_encrypted(&parsed.address, &key, UrlKind::Passphrase);
        }
    }

    match store.get(&url::address_of(&target)?)? {
        None => Ok(None),
        Some(stored) => unpack(&target, &stored, was_similar),
    }
}
