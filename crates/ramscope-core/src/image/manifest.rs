//! Dump manifest parsing.
//!
//! Two manifest formats ride along with captured dumps:
//!
//! - a debugger command script (`load.cmm`) whose relevant lines have four
//!   columns `[command, filename, hex_base_addr, ...]`;
//! - a plain whitespace table (`dump_info.txt`) with lines
//!   `[*, hex_base_addr, decimal_size, filename]`, where the recorded size
//!   must equal the on-disk file size.
//!
//! Only files matching the DDR/EBI/IMEM naming convention are segments;
//! everything else in the directory (CPU register files, trace buffers) is
//! skipped. A size mismatch in the table format skips that one file with a
//! warning instead of failing the load.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{AnalysisError, Result};
use crate::image::{MemoryImage, MemorySegment};

const SCRIPT_MANIFEST: &str = "load.cmm";
const TABLE_MANIFEST: &str = "dump_info.txt";

/// Does this filename look like a RAM segment file?
fn is_dump_file(name: &str) -> bool
{
    let upper = name.to_ascii_uppercase();
    if upper.contains("IMEM") && upper.ends_with(".BIN") {
        return true;
    }
    let Some(rest) = upper.strip_prefix("DDR").or_else(|| upper.strip_prefix("EBI")) else {
        return false;
    };
    let Some(mid) = rest.strip_suffix(".BIN") else {
        return false;
    };
    !mid.is_empty() && mid.bytes().all(|b| b.is_ascii_digit() || b == b'_' || b == b'C' || b == b'S')
}

fn parse_hex(text: &str) -> Option<u64>
{
    let trimmed = text.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(trimmed, 16).ok()
}

/// Segment source id: the file stem of the segment file, e.g. `DDRCS0`.
fn source_id(name: &str) -> String
{
    name.rsplit_once('.').map_or(name, |(stem, _)| stem).to_string()
}

fn segment_for(dir: &Path, name: &str, base: u64) -> Option<MemorySegment>
{
    let path = dir.join(name);
    let meta = fs::metadata(&path).ok()?;
    if meta.len() == 0 {
        return None;
    }
    let end = base + meta.len() - 1;
    Some(MemorySegment::new(path, base, end, source_id(name)))
}

/// Parse the whitespace-table manifest. `None` when the file is absent.
fn parse_table_manifest(dir: &Path) -> Option<Vec<MemorySegment>>
{
    let text = fs::read_to_string(dir.join(TABLE_MANIFEST)).ok()?;
    let mut segments = Vec::new();
    for line in text.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = words.last() else {
            continue;
        };
        if !is_dump_file(name) || words.len() < 3 {
            continue;
        }
        let Some(base) = parse_hex(words[1]) else {
            continue;
        };
        let Ok(size) = words[2].parse::<u64>() else {
            continue;
        };
        let on_disk = fs::metadata(dir.join(name)).map(|m| m.len()).unwrap_or(0);
        if size != on_disk {
            warn!(
                "size of {name} on disk ({on_disk}) doesn't match size from {TABLE_MANIFEST} ({size}); skipping"
            );
            continue;
        }
        if let Some(segment) = segment_for(dir, name, base) {
            segments.push(segment);
        }
    }
    Some(segments)
}

/// Parse the command-script manifest. `None` when the file is absent.
fn parse_script_manifest(dir: &Path) -> Option<Vec<MemorySegment>>
{
    let text = fs::read_to_string(dir.join(SCRIPT_MANIFEST)).ok()?;
    let mut segments = Vec::new();
    for line in text.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() != 4 || !is_dump_file(words[1]) {
            continue;
        }
        let Some(base) = parse_hex(words[2]) else {
            continue;
        };
        if let Some(segment) = segment_for(dir, words[1], base) {
            segments.push(segment);
        }
    }
    Some(segments)
}

/// Load a memory image from a dump directory.
///
/// The table manifest takes priority over the command script; whichever
/// yields at least one segment wins. Zero usable segments is fatal.
pub fn load_dump_directory(dir: &Path) -> Result<MemoryImage>
{
    for parser in [parse_table_manifest, parse_script_manifest] {
        let Some(segments) = parser(dir) else {
            continue;
        };
        if segments.is_empty() {
            continue;
        }
        let image = MemoryImage::new(segments);
        for (start, end, source) in image.extents() {
            info!("adding {source} {start}--{end}");
        }
        return Ok(image);
    }
    Err(AnalysisError::NoSegments(PathBuf::from(dir)))
}

/// Build an image from explicitly supplied `(path, base_addr)` pairs,
/// bypassing manifest discovery.
pub fn load_segment_files(files: &[(PathBuf, u64)]) -> Result<MemoryImage>
{
    let mut segments = Vec::new();
    for (path, base) in files {
        let meta = fs::metadata(path)?;
        if meta.len() == 0 {
            warn!("{} is empty; skipping", path.display());
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        segments.push(MemorySegment::new(
            path.clone(),
            *base,
            base + meta.len() - 1,
            source_id(&name),
        ));
    }
    if segments.is_empty() {
        let dir = files.first().map(|(p, _)| p.clone()).unwrap_or_default();
        return Err(AnalysisError::NoSegments(dir));
    }
    Ok(MemoryImage::new(segments))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_dump_file_naming()
    {
        assert!(is_dump_file("DDRCS0.BIN"));
        assert!(is_dump_file("DDRCS1_0.BIN"));
        assert!(is_dump_file("EBI1CS0.bin"));
        assert!(is_dump_file("OCIMEM.BIN"));
        assert!(!is_dump_file("DDR.BIN"));
        assert!(!is_dump_file("load.cmm"));
        assert!(!is_dump_file("CPU_regs.BIN"));
    }

    #[test]
    fn test_parse_hex_accepts_prefix()
    {
        assert_eq!(parse_hex("0x80000000"), Some(0x8000_0000));
        assert_eq!(parse_hex("80000000"), Some(0x8000_0000));
        assert_eq!(parse_hex("zz"), None);
    }

    #[test]
    fn test_source_id_strips_extension()
    {
        assert_eq!(source_id("DDRCS0.BIN"), "DDRCS0");
        assert_eq!(source_id("plain"), "plain");
    }
}
