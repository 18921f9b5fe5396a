//! Source file checksums. The expected digest's length picks the algorithm:
//! 32 hex digits for MD5, 64 for SHA-256.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::anyhow;
use md5::Context as Md5Context;
use sha2::{Digest, Sha256};

use crate::error::{InstallError, InstallResult};
use crate::task_control::TaskControl;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Md5,
    Sha256,
}

impl ChecksumKind {
    pub fn for_digest(expected: &str) -> Option<Self> {
        if !expected.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match expected.len() {
            32 => Some(ChecksumKind::Md5),
            64 => Some(ChecksumKind::Sha256),
            _ => None,
        }
    }
}

fn hash_reader(
    reader: &mut dyn Read,
    on_chunk: &mut dyn FnMut(&[u8]),
    control: &TaskControl,
) -> InstallResult<()> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        control.ensure_not_cancelled("checksum")?;
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            return Ok(());
        }
        on_chunk(&buffer[..n]);
    }
}

/// Lower-case hex digest of the file at `path`
pub fn compute(path: &Path, kind: ChecksumKind, control: &TaskControl) -> InstallResult<String> {
    let mut file = fs::File::open(path).map_err(|e| InstallError::fs(path, e))?;
    match kind {
        ChecksumKind::Md5 => {
            let mut hasher = Md5Context::new();
            hash_reader(&mut file, &mut |chunk| hasher.consume(chunk), control)?;
            Ok(format!("{:x}", hasher.compute()))
        }
        ChecksumKind::Sha256 => {
            let mut hasher = Sha256::new();
            hash_reader(&mut file, &mut |chunk| hasher.update(chunk), control)?;
            Ok(format!("{:x}", hasher.finalize()))
        }
    }
}

/// Fails with [`InstallError::ChecksumMismatch`] unless the file matches `expected`
pub fn verify(path: &Path, expected: &str, control: &TaskControl) -> InstallResult<()> {
    let expected = expected.trim();
    let kind = ChecksumKind::for_digest(expected)
        .ok_or_else(|| anyhow!("Unsupported checksum format: {:?}", expected))?;
    let actual = compute(path, kind, control)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(InstallError::ChecksumMismatch {
            expected: expected.to_lowercase(),
            actual,
        });
    }
    Ok(())
}
