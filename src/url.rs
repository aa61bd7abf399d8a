//! The four-kind block URL grammar.
//!
//! ```text
//! /sha256/{addr}                       plain stored bytes
//! /sha256/{addr}/aes256/{contents}     AES-CBC ciphertext, key = SHA-256 of plaintext
//! /sha256/{addr}/passphrase/{key}      AES-CBC ciphertext, key = SHA-256 of a passphrase
//! /sha256/like/{target}                query for neighbors of `target`
//! ```
//!
//! Bundles embed these strings; the grammar is a stable wire contract.

use crate::error::{LibernetError, Result};
use crate::hash::Identifier;

pub const SHA256: &str = "sha256";
pub const AES256: &str = "aes256";
pub const PASSPHRASE: &str = "passphrase";
pub const LIKE: &str = "like";

/// Which of the four URL shapes a string parsed as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UrlKind {
    /// `/sha256/{addr}`
    Data,
    /// `/sha256/like/{target}`
    Like,
    /// `/sha256/{addr}/aes256/{contents}`
    Aes256,
    /// `/sha256/{addr}/passphrase/{key}`
    Passphrase,
}

/// The decomposed pieces of a block URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedUrl {
    /// The storage address (or the query target, for `Like`).
    pub address: Identifier,
    /// The decryption key identifier, when the URL names one.
    pub key: Option<Identifier>,
    /// The digest of the recoverable plaintext, when the URL carries one.
    pub contents: Option<Identifier>,
    pub kind: UrlKind,
}

/// Parse a URL string, rejecting anything outside the four shapes.
pub fn parse(url: &str) -> Result<ParsedUrl> {
    let bad = || LibernetError::InvalidUrl(url.to_string());
    let parts: Vec<&str> = url.split('/').collect();

    if parts.len() < 3 || !parts[0].is_empty() || parts[1] != SHA256 {
        return Err(bad());
    }

    let is_like = parts[2] == LIKE;

    if is_like {
        if parts.len() != 4 {
            return Err(bad());
        }

        let target: Identifier = parts[3].parse()?;
        return Ok(ParsedUrl {
            address: target,
            key: None,
            contents: None,
            kind: UrlKind::Like,
        });
    }

    let address: Identifier = parts[2].parse()?;

    match parts.len() {
        3 => Ok(ParsedUrl {
            address,
            key: None,
            contents: Some(address),
            kind: UrlKind::Data,
        }),
        5 => {
            let key: Identifier = parts[4].parse()?;
            match parts[3] {
                AES256 => Ok(ParsedUrl {
                    address,
                    key: Some(key),
                    contents: Some(key),
                    kind: UrlKind::Aes256,
                }),
                PASSPHRASE => Ok(ParsedUrl {
                    address,
                    key: Some(key),
                    contents: None,
                    kind: UrlKind::Passphrase,
                }),
                _ => Err(bad()),
            }
        }
        _ => Err(bad()),
    }
}

/// URL for a stored block, or for a neighbor query when `like` is set.
pub fn for_data_block(identifier: &Identifier, like: bool) -> String {
    if like {
        format!("/{SHA256}/{LIKE}/{identifier}")
    } else {
        format!("/{SHA256}/{identifier}")
    }
}

/// URL for an encrypted block. `kind` must be `Aes256` or `Passphrase`.
pub fn for_encrypted(address: &Identifier, key: &Identifier, kind: UrlKind) -> String {
    let token = match kind {
        UrlKind::Aes256 => AES256,
        UrlKind::Passphrase => PASSPHRASE,
        _ => unreachable!("only encrypted kinds carry a key"),
    };
    format!("/{SHA256}/{address}/{token}/{key}")
}

/// Reduce a URL to its bare address form, dropping any key suffix.
pub fn address_of(url: &str) -> Result<String> {
    let parsed = parse(url)?;
    Ok(for_data_block(&parsed.address, false))
}
