//! Minimal Solidity ABI encoding for the vault contract calls.
//!
//! Only the shapes the vault uses: no-arg calls, `(address)`, `(address[], uint256[])`,
//! and `uint256` / `address[]` return values.

use anyhow::{anyhow, bail, Context, Result};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use sha3::{Digest, Keccak256};

const WORD: usize = 32;

/// First four bytes of keccak-256 of the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

fn address_word(address: &str) -> Result<[u8; WORD]> {
    let raw = hex::decode(strip_0x(address.trim()))
        .with_context(|| format!("address {address} is not hex"))?;
    if raw.len() != 20 {
        bail!("address {address} must be 20 bytes, got {}", raw.len());
    }
    let mut word = [0u8; WORD];
    word[12..].copy_from_slice(&raw);
    Ok(word)
}

fn uint_word(value: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn to_hex_call(selector: [u8; 4], body: &[u8]) -> String {
    let mut data = Vec::with_capacity(4 + body.len());
    data.extend_from_slice(&selector);
    data.extend_from_slice(body);
    format!("0x{}", hex::encode(data))
}

/// Calldata for a function without arguments, e.g. `totalMON()`.
pub fn encode_call(signature: &str) -> String {
    to_hex_call(selector(signature), &[])
}

/// Calldata for a single-address function, e.g. `balanceOf(address)`.
pub fn encode_address_call(signature: &str, address: &str) -> Result<String> {
    Ok(to_hex_call(selector(signature), &address_word(address)?))
}

/// Calldata for `batchUpdateUserWeights(address[],uint256[])`.
pub fn encode_batch_update(signature: &str, users: &[String], weights: &[u64]) -> Result<String> {
    if users.len() != weights.len() {
        bail!(
            "{} users but {} weights in batch update",
            users.len(),
            weights.len()
        );
    }
    let n = users.len();
    let first_offset = 2 * WORD;
    let second_offset = first_offset + WORD * (1 + n);

    let mut body = Vec::with_capacity(WORD * (4 + 2 * n));
    body.extend_from_slice(&uint_word(first_offset as u64));
    body.extend_from_slice(&uint_word(second_offset as u64));

    body.extend_from_slice(&uint_word(n as u64));
    for user in users {
        body.extend_from_slice(&address_word(user)?);
    }
    body.extend_from_slice(&uint_word(n as u64));
    for weight in weights {
        body.extend_from_slice(&uint_word(*weight));
    }
    Ok(to_hex_call(selector(signature), &body))
}

fn decode_bytes(data: &str) -> Result<Vec<u8>> {
    hex::decode(strip_0x(data.trim())).context("return data is not hex")
}

fn word_at(bytes: &[u8], offset: usize) -> Result<&[u8]> {
    offset
        .checked_add(WORD)
        .and_then(|end| bytes.get(offset..end))
        .ok_or_else(|| anyhow!("return data truncated at byte {offset}"))
}

fn word_as_usize(word: &[u8]) -> Result<usize> {
    BigUint::from_bytes_be(word)
        .to_usize()
        .ok_or_else(|| anyhow!("ABI offset or length out of range"))
}

/// Single `uint256` return value. An empty result (`0x`) decodes to zero.
pub fn decode_uint(data: &str) -> Result<BigUint> {
    let hex_part = strip_0x(data.trim());
    if hex_part.is_empty() {
        return Ok(BigUint::default());
    }
    BigUint::parse_bytes(hex_part.as_bytes(), 16)
        .ok_or_else(|| anyhow!("invalid uint256 return data {data}"))
}

/// Dynamic `address[]` return value, lowercased with `0x` prefix.
pub fn decode_address_array(data: &str) -> Result<Vec<String>> {
    let bytes = decode_bytes(data)?;
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let offset = word_as_usize(word_at(&bytes, 0)?)?;
    let len = word_as_usize(word_at(&bytes, offset)?)?;

    let mut out = Vec::with_capacity(len.min(bytes.len() / WORD));
    for i in 0..len {
        let word = word_at(&bytes, offset + WORD * (1 + i))?;
        out.push(format!("0x{}", hex::encode(&word[12..])));
    }
    Ok(out)
}
