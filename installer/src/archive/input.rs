//! Archive format detection and multi-volume preparation.

use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{InstallError, InstallResult};
use crate::logger;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const SEVENZ_MAGIC: &[u8] = b"7z\xBC\xAF\x27\x1C";
const RAR_MAGIC: &[u8] = b"Rar!\x1A\x07";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    SevenZ,
    Rar,
}

impl ArchiveFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::SevenZ => "7z",
            ArchiveFormat::Rar => "rar",
        }
    }

    /// 7z and rar members are decoded in one linear stream per archive
    pub fn is_solid(self) -> bool {
        !matches!(self, ArchiveFormat::Zip)
    }
}

/// Archive ready to be opened; owns the joined temp file for split archives
#[derive(Debug)]
pub struct PreparedArchive {
    read_path: PathBuf,
    _joined: Option<NamedTempFile>,
}

impl PreparedArchive {
    pub fn read_path(&self) -> &Path {
        &self.read_path
    }
}

/// `name.zip.001` / `name.7z.003`: `(prefix including the dot, digit width)`
fn numbered_volume(file_name: &str, marker: &str) -> Option<(String, usize)> {
    let lower = file_name.to_ascii_lowercase();
    let at = lower.rfind(marker)? + marker.len();
    let digits = &file_name[at..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((file_name[..at].to_string(), digits.len()))
}

/// Extension like `z01` or `r00`
fn is_lettered_volume(path: &Path, letter: char) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let mut chars = ext.chars();
            chars.next().map(|c| c.to_ascii_lowercase()) == Some(letter)
                && ext.len() >= 3
                && chars.all(|c| c.is_ascii_digit())
        })
        .unwrap_or(false)
}

/// `name.part2.rar`: `(name, digit width)`
fn rar_part(file_name: &str) -> Option<(String, usize)> {
    let lower = file_name.to_ascii_lowercase();
    let body = lower.strip_suffix(".rar")?;
    let at = body.rfind(".part")?;
    let digits = &file_name[at + ".part".len()..body.len()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((file_name[..at].to_string(), digits.len()))
}

fn sibling(dir: &Path, name: &str) -> Option<PathBuf> {
    let direct = dir.join(name);
    if direct.is_file() {
        return Some(direct);
    }
    fs::read_dir(dir).ok()?.flatten().find_map(|entry| {
        let file_name = entry.file_name();
        let file_name = file_name.to_str()?;
        file_name.eq_ignore_ascii_case(name).then(|| entry.path())
    })
}

fn sniff(path: &Path) -> Option<ArchiveFormat> {
    let mut head = [0u8; 8];
    let mut file = fs::File::open(path).ok()?;
    let read = file.read(&mut head).ok()?;
    let head = &head[..read];
    if head.starts_with(ZIP_MAGIC) {
        Some(ArchiveFormat::Zip)
    } else if head.starts_with(SEVENZ_MAGIC) {
        Some(ArchiveFormat::SevenZ)
    } else if head.starts_with(RAR_MAGIC) {
        Some(ArchiveFormat::Rar)
    } else {
        None
    }
}

/// Format by file name, then by signature bytes. `None` means a plain file.
pub fn detect_archive_format(path: &Path) -> Option<ArchiveFormat> {
    let file_name = path.file_name()?.to_str()?;
    let lower = file_name.to_ascii_lowercase();

    if lower.ends_with(".zip")
        || numbered_volume(file_name, ".zip.").is_some()
        || is_lettered_volume(path, 'z')
    {
        return Some(ArchiveFormat::Zip);
    }
    if lower.ends_with(".7z") || numbered_volume(file_name, ".7z.").is_some() {
        return Some(ArchiveFormat::SevenZ);
    }
    if lower.ends_with(".rar") || is_lettered_volume(path, 'r') {
        return Some(ArchiveFormat::Rar);
    }
    sniff(path)
}

/// Any volume of a split set maps to the volume readers expect to be given
pub fn first_volume(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return path.to_path_buf();
    };

    for marker in [".zip.", ".7z."] {
        if let Some((prefix, width)) = numbered_volume(file_name, marker) {
            if let Some(first) = sibling(dir, &format!("{}{:0width$}", prefix, 1, width = width)) {
                return first;
            }
        }
    }

    if let Some((name, width)) = rar_part(file_name) {
        let first = format!("{}.part{:0width$}.rar", name, 1, width = width);
        if let Some(first) = sibling(dir, &first) {
            return first;
        }
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(file_name);
    if is_lettered_volume(path, 'z') {
        if let Some(last) = sibling(dir, &format!("{}.zip", stem)) {
            return last;
        }
    }
    if is_lettered_volume(path, 'r') {
        if let Some(first) = sibling(dir, &format!("{}.rar", stem)) {
            return first;
        }
    }

    path.to_path_buf()
}

/// Volumes that must be joined, in order, or `None` for a single-file archive
fn volumes_to_join(path: &Path, format: ArchiveFormat) -> Option<Vec<PathBuf>> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name()?.to_str()?;

    let numbered = match format {
        ArchiveFormat::Zip => numbered_volume(file_name, ".zip."),
        ArchiveFormat::SevenZ => numbered_volume(file_name, ".7z."),
        ArchiveFormat::Rar => return None,
    };
    if let Some((prefix, width)) = numbered {
        let parts: Vec<PathBuf> = (1u32..)
            .map_while(|index| sibling(dir, &format!("{}{:0width$}", prefix, index, width = width)))
            .collect();
        return (!parts.is_empty()).then_some(parts);
    }

    if format == ArchiveFormat::Zip && file_name.to_ascii_lowercase().ends_with(".zip") {
        let stem = &file_name[..file_name.len() - ".zip".len()];
        let mut parts: Vec<PathBuf> = (1u32..)
            .map_while(|index| sibling(dir, &format!("{}.z{:02}", stem, index)))
            .collect();
        if parts.is_empty() {
            return None;
        }
        parts.push(path.to_path_buf());
        return Some(parts);
    }

    None
}

fn join_volumes(parts: &[PathBuf], format: ArchiveFormat) -> InstallResult<PreparedArchive> {
    let suffix = format!(".{}", format.as_str());
    let mut joined = NamedTempFile::with_suffix(&suffix)
        .map_err(|e| InstallError::fs(std::env::temp_dir(), e))?;
    {
        let mut writer = BufWriter::new(joined.as_file_mut());
        for part in parts {
            let mut input = fs::File::open(part).map_err(|e| InstallError::fs(part, e))?;
            std::io::copy(&mut input, &mut writer).map_err(|e| InstallError::fs(part, e))?;
        }
        writer.flush()?;
    }
    logger::log_info(
        &format!("Joined {} volumes into {:?}", parts.len(), joined.path()),
        Some("archive"),
    );
    Ok(PreparedArchive {
        read_path: joined.path().to_path_buf(),
        _joined: Some(joined),
    })
}

pub fn prepare_archive_for_read(path: &Path, format: ArchiveFormat) -> InstallResult<PreparedArchive> {
    let first = first_volume(path);
    match volumes_to_join(&first, format) {
        Some(parts) if parts.len() > 1 => join_volumes(&parts, format),
        _ => Ok(PreparedArchive {
            read_path: first,
            _joined: None,
        }),
    }
}
