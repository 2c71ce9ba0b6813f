use crate::error::Result;
use sha2::{Digest, Sha256};
use std::{fs::File, io, path::Path};

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut f, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_sha256(path: &Path, expected_hex: &str) -> Result<bool> {
    // Reject malformed digests up front instead of reporting a mismatch.
    hex::decode(expected_hex)?;
    Ok(file_sha256(path)?.eq_ignore_ascii_case(expected_hex))
}
