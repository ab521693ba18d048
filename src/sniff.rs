//! Container sniffer: identify the container kind and locate the encrypted
//! manifest, trusting nothing but the bytes near the end of the file.
//!
//! Format-A containers end with a trailer page carrying a magic word; the
//! page size (512 or 4096) is discovered, not assumed, by probing the magic
//! at a handful of known positions and falling back to a byte-wise scan of
//! the file tail.  Format-B containers always end with a fixed 512-byte
//! trailer.  Plain ZIP is recognised by its `PK` signature.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

use crate::LogFn;

/// Format-A trailer magic, little-endian.
pub const FORMAT_A_MAGIC: u32 = 0x7CEF;
/// Fixed Format-B trailer length.
pub const FORMAT_B_TRAILER_LEN: u64 = 0x200;
/// How far back from end-of-file the fallback magic scan looks.
const TAIL_SCAN_LEN: u64 = 0x2000;

#[derive(Error, Debug)]
pub enum SniffError {
    #[error("container magic not found — not a recognised firmware container")]
    FormatNotRecognized,
    #[error("container too small ({0} bytes)")]
    TooSmall(u64),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Detected container flavour.  Immutable once identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// `.ofp`: discovered page size, AES-CFB manifest.
    FormatA,
    /// `.ops`: fixed 512-byte trailer, vendor block cipher.
    FormatB,
    /// Plain ZIP archive.
    Zip,
}

/// Classify a container file.
///
/// ZIP wins on content (`PK` signature); otherwise the `.ops` extension
/// selects Format-B — the Format-A probe is the only content-based check
/// for the encrypted formats, and it does not understand Format-B.
pub fn detect_kind(path: &Path) -> Result<ContainerKind, SniffError> {
    let mut f = File::open(path)?;
    let mut sig = [0u8; 2];
    f.read_exact(&mut sig)?;
    if &sig == b"PK" {
        return Ok(ContainerKind::Zip);
    }
    let is_ops = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("ops"))
        .unwrap_or(false);
    Ok(if is_ops {
        ContainerKind::FormatB
    } else {
        ContainerKind::FormatA
    })
}

// ── Format-A ─────────────────────────────────────────────────────────────────

/// Located Format-A manifest region.
#[derive(Debug)]
pub struct FormatAHeader {
    /// Discovered trailer/alignment granularity (512 or 4096, or a rounded
    /// multiple from the fallback scan).
    pub pagesize: u64,
    /// Raw manifest ciphertext, ready for the key resolver.
    pub ciphertext: Vec<u8>,
}

/// Find the trailer page, then read the manifest ciphertext it points at.
pub fn locate_format_a(path: &Path, log: &LogFn) -> Result<FormatAHeader, SniffError> {
    let mut f = File::open(path)?;
    let filesize = f.metadata()?.len();
    let pagesize = probe_pagesize(&mut f, filesize, log)?;

    // The fallback scan can estimate a page larger than the file itself.
    let xmloffset = filesize
        .checked_sub(pagesize)
        .ok_or(SniffError::FormatNotRecognized)?;
    f.seek(SeekFrom::Start(xmloffset + 0x14))?;
    let offset = f.read_u32::<LittleEndian>()? as u64 * pagesize;
    let mut length = f.read_u32::<LittleEndian>()? as u64;
    log(&format!("Manifest offset: 0x{offset:X}, length: {length}"));

    // Some containers declare a bogus tiny length; recompute it as the gap
    // up to the trailer page minus the fixed header allowance.
    if length < 200 {
        length = xmloffset
            .checked_sub(offset)
            .and_then(|gap| gap.checked_sub(0x57))
            .ok_or(SniffError::FormatNotRecognized)?;
    }

    f.seek(SeekFrom::Start(offset))?;
    let mut ciphertext = vec![0u8; length as usize];
    f.read_exact(&mut ciphertext)?;
    Ok(FormatAHeader { pagesize, ciphertext })
}

/// Probe the magic at each page-size/offset combination; fall back to a
/// byte-wise scan of the last `0x2000` bytes.
fn probe_pagesize(f: &mut File, filesize: u64, log: &LogFn) -> Result<u64, SniffError> {
    for pagesize in [0x200u64, 0x1000] {
        for off in [0x10u64, 0x14, 0x0] {
            if filesize < pagesize {
                continue;
            }
            f.seek(SeekFrom::Start(filesize - pagesize + off))?;
            let magic = f.read_u32::<LittleEndian>()?;
            log(&format!(
                "Probing pagesize 0x{pagesize:X} offset 0x{off:X}: magic=0x{magic:X}"
            ));
            if magic == FORMAT_A_MAGIC {
                log(&format!("Found pagesize: 0x{pagesize:X}"));
                return Ok(pagesize);
            }
        }
    }

    log("Scanning file tail for magic 0x7CEF...");
    let scan = filesize.min(TAIL_SCAN_LEN) as usize;
    f.seek(SeekFrom::Start(filesize - scan as u64))?;
    let mut tail = vec![0u8; scan];
    f.read_exact(&mut tail)?;

    for (i, window) in tail.windows(4).enumerate() {
        let magic = u32::from_le_bytes([window[0], window[1], window[2], window[3]]);
        if magic != FORMAT_A_MAGIC {
            continue;
        }
        let from_end = (scan - i) as u64;
        log(&format!("Found magic at offset -0x{from_end:X} from end"));
        let pagesize = if from_end <= 0x200 {
            0x200
        } else if from_end <= 0x1000 {
            0x1000
        } else {
            (from_end / 0x200 + 1) * 0x200
        };
        log(&format!("Estimated pagesize: 0x{pagesize:X}"));
        return Ok(pagesize);
    }

    log("Magic 0x7CEF not found");
    Err(SniffError::FormatNotRecognized)
}

// ── Format-B ─────────────────────────────────────────────────────────────────

/// Located Format-B manifest region.
#[derive(Debug)]
pub struct FormatBHeader {
    /// Manifest ciphertext, padded to a 512-byte boundary on disk.
    pub ciphertext: Vec<u8>,
    /// Declared plaintext length (the padding is not part of the XML).
    pub plain_len: usize,
}

/// Read the fixed trailer and the manifest ciphertext preceding it.
pub fn locate_format_b(path: &Path, log: &LogFn) -> Result<FormatBHeader, SniffError> {
    let mut f = File::open(path)?;
    let filesize = f.metadata()?.len();
    if filesize < FORMAT_B_TRAILER_LEN {
        return Err(SniffError::TooSmall(filesize));
    }

    f.seek(SeekFrom::Start(filesize - FORMAT_B_TRAILER_LEN))?;
    let mut trailer = [0u8; FORMAT_B_TRAILER_LEN as usize];
    f.read_exact(&mut trailer)?;
    let plain_len = (&trailer[0x18..]).read_u32::<LittleEndian>()? as u64;
    log(&format!("Manifest length: {plain_len}"));

    let padded = plain_len.div_ceil(FORMAT_B_TRAILER_LEN) * FORMAT_B_TRAILER_LEN;
    let start = filesize
        .checked_sub(FORMAT_B_TRAILER_LEN + padded)
        .ok_or(SniffError::FormatNotRecognized)?;
    f.seek(SeekFrom::Start(start))?;
    let mut ciphertext = vec![0u8; padded as usize];
    f.read_exact(&mut ciphertext)?;
    Ok(FormatBHeader { ciphertext, plain_len: plain_len as usize })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn silent(_: &str) {}

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    #[test]
    fn zip_signature_wins() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "fw.ofp", b"PK\x03\x04rest");
        assert_eq!(detect_kind(&path).unwrap(), ContainerKind::Zip);
    }

    #[test]
    fn ops_extension_selects_format_b() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "fw.ops", &[0u8; 16]);
        assert_eq!(detect_kind(&path).unwrap(), ContainerKind::FormatB);
        let path = write_file(&dir, "fw.ofp", &[0u8; 16]);
        assert_eq!(detect_kind(&path).unwrap(), ContainerKind::FormatA);
    }

    #[test]
    fn probe_finds_4096_page_at_offset_0x14() {
        let dir = TempDir::new().unwrap();
        let mut data = vec![0u8; 0x2000];
        let at = data.len() - 0x1000 + 0x14;
        data[at..at + 4].copy_from_slice(&FORMAT_A_MAGIC.to_le_bytes());
        let path = write_file(&dir, "fw.ofp", &data);

        let mut f = File::open(&path).unwrap();
        let pagesize = probe_pagesize(&mut f, 0x2000, &silent).unwrap();
        assert_eq!(pagesize, 0x1000);
    }

    #[test]
    fn probe_finds_512_page_at_offset_0x10() {
        let dir = TempDir::new().unwrap();
        let mut data = vec![0u8; 0x800];
        let at = data.len() - 0x200 + 0x10;
        data[at..at + 4].copy_from_slice(&FORMAT_A_MAGIC.to_le_bytes());
        let path = write_file(&dir, "fw.ofp", &data);

        let mut f = File::open(&path).unwrap();
        assert_eq!(probe_pagesize(&mut f, 0x800, &silent).unwrap(), 0x200);
    }

    // Magic at an unaligned position: only the fallback scan can find it,
    // and the page size must round up to the enclosing 512 multiple.
    #[test]
    fn fallback_scan_rounds_to_512_multiple() {
        let dir = TempDir::new().unwrap();
        let mut data = vec![0u8; 0x3000];
        let from_end = 0x1234u64; // > 0x1000, not page-aligned
        let at = data.len() - from_end as usize;
        data[at..at + 4].copy_from_slice(&FORMAT_A_MAGIC.to_le_bytes());
        let path = write_file(&dir, "fw.ofp", &data);

        let mut f = File::open(&path).unwrap();
        let pagesize = probe_pagesize(&mut f, 0x3000, &silent).unwrap();
        assert_eq!(pagesize % 0x200, 0);
        assert!(pagesize >= from_end);
        assert_eq!(pagesize, (from_end / 0x200 + 1) * 0x200);
    }

    #[test]
    fn missing_magic_is_not_recognised() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "fw.ofp", &[0u8; 0x1000]);
        let mut f = File::open(&path).unwrap();
        assert!(matches!(
            probe_pagesize(&mut f, 0x1000, &silent),
            Err(SniffError::FormatNotRecognized)
        ));
    }

    // A file smaller than the estimated page has no room for a trailer
    // page; that is a recognition failure, not an arithmetic one.
    #[test]
    fn magic_in_tiny_file_is_not_recognised() {
        let dir = TempDir::new().unwrap();
        let mut data = vec![0u8; 0x100];
        data[0xb0..0xb4].copy_from_slice(&FORMAT_A_MAGIC.to_le_bytes());
        let path = write_file(&dir, "fw.ofp", &data);

        assert!(matches!(
            locate_format_a(&path, &silent),
            Err(SniffError::FormatNotRecognized)
        ));
    }

    #[test]
    fn format_b_trailer_and_padding() {
        let dir = TempDir::new().unwrap();
        // 300-byte manifest padded to 512, then the 512-byte trailer.
        let mut data = vec![0xabu8; 0x200];
        let mut trailer = vec![0u8; 0x200];
        trailer[0x18..0x1c].copy_from_slice(&300u32.to_le_bytes());
        data.extend_from_slice(&trailer);
        let path = write_file(&dir, "fw.ops", &data);

        let header = locate_format_b(&path, &silent).unwrap();
        assert_eq!(header.plain_len, 300);
        assert_eq!(header.ciphertext.len(), 0x200);
        assert!(header.ciphertext.iter().all(|&b| b == 0xab));
    }
}
