//! Extraction pipeline: container file in, directory of firmware images out.
//!
//! [`Extractor`] ties the other modules together.  It sniffs the container
//! flavour, recovers the manifest (trying key material until one candidate
//! produces XML), interprets the manifest into entries, then streams each
//! entry to disk.  Entries are processed strictly in manifest order.
//!
//! # Bounded decryption
//!
//! For ordinary Format-A sections only a fixed-size prefix of each entry is
//! ciphertext that the vendor tool decrypts; any bytes past that prefix are
//! copied to the output unchanged.  That tail copy is observed vendor-tool
//! behaviour and is reproduced here as-is.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::crypto::ops::{self, OpsCipher};
use crate::crypto;
use crate::keys::{self, KeyError};
use crate::manifest::{
    self, DecryptChunk, EntryKind, ManifestEntry, ManifestError, BOUNDED_DECRYPT_SIZE,
};
use crate::sniff::{self, ContainerKind, SniffError};

/// Streaming copy granularity.
const COPY_BUF_SIZE: usize = 0x10_0000;

/// Manifest file name written for Format-A containers.
const FORMAT_A_MANIFEST: &str = "ProFile.xml";
/// Manifest file name written for Format-B containers.
const FORMAT_B_MANIFEST: &str = "settings.xml";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error(transparent)]
    Sniff(#[from] SniffError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("plain ZIP archives carry no encrypted manifest")]
    NoManifest,
}

/// Container extractor.
///
/// Progress lines go to an optional log sink; the default sink discards
/// them.  The sink borrows for `'a`, so a CLI can hand in a closure over
/// its own state.
pub struct Extractor<'a> {
    container: PathBuf,
    log: Box<dyn Fn(&str) + 'a>,
}

impl<'a> Extractor<'a> {
    pub fn new(container: impl Into<PathBuf>) -> Self {
        Self { container: container.into(), log: Box::new(|_| {}) }
    }

    /// Replace the log sink.
    pub fn with_log(mut self, log: impl Fn(&str) + 'a) -> Self {
        self.log = Box::new(log);
        self
    }

    fn emit(&self, line: &str) {
        (self.log)(line);
    }

    // ── Top-level operations ─────────────────────────────────────────────

    /// Extract every manifest entry (plus the manifest itself) into
    /// `output_dir`, defaulting to a sibling directory named `extract`.
    /// An existing output directory is replaced.
    ///
    /// Returns the output directory path.
    pub fn extract(&self, output_dir: Option<&Path>) -> Result<PathBuf, ExtractError> {
        let out = self.prepare_output_dir(output_dir)?;
        match sniff::detect_kind(&self.container)? {
            ContainerKind::Zip => self.extract_zip(&out)?,
            ContainerKind::FormatA => self.extract_format_a(&out)?,
            ContainerKind::FormatB => self.extract_format_b(&out)?,
        }
        self.emit("Done.");
        Ok(out)
    }

    /// Recover the decrypted manifest XML without extracting anything.
    pub fn manifest_xml(&self) -> Result<String, ExtractError> {
        match sniff::detect_kind(&self.container)? {
            ContainerKind::Zip => Err(ExtractError::NoManifest),
            ContainerKind::FormatA => {
                let header = sniff::locate_format_a(&self.container, &*self.log)?;
                let found = keys::resolve(&header.ciphertext, &*self.log)?;
                Ok(found.xml)
            }
            ContainerKind::FormatB => {
                let header = sniff::locate_format_b(&self.container, &*self.log)?;
                let (_, xml) =
                    ops::resolve_mbox(&header.ciphertext, header.plain_len, &*self.log)
                        .ok_or(KeyError::NotFound)?;
                Ok(xml)
            }
        }
    }

    // ── Per-format pipelines ─────────────────────────────────────────────

    fn extract_format_a(&self, out: &Path) -> Result<(), ExtractError> {
        let header = sniff::locate_format_a(&self.container, &*self.log)?;
        let found = keys::resolve(&header.ciphertext, &*self.log)?;
        self.emit(&format!("Matched key material: {}", found.version));
        fs::write(out.join(FORMAT_A_MANIFEST), &found.xml)?;

        let entries = manifest::parse_format_a(&found.xml, header.pagesize)?;
        let mut src = File::open(&self.container)?;
        for entry in &entries {
            match entry.kind {
                EntryKind::Copy => self.copy_entry(&mut src, out, entry)?,
                EntryKind::Decrypt { chunk } => {
                    let bound = match chunk {
                        DecryptChunk::WholeEntry => entry.length,
                        DecryptChunk::Bounded => BOUNDED_DECRYPT_SIZE,
                    };
                    self.decrypt_entry_a(&mut src, out, entry, bound, &found.key, &found.iv)?;
                }
            }
        }
        Ok(())
    }

    fn extract_format_b(&self, out: &Path) -> Result<(), ExtractError> {
        let header = sniff::locate_format_b(&self.container, &*self.log)?;
        let (mbox, xml) =
            ops::resolve_mbox(&header.ciphertext, header.plain_len, &*self.log)
                .ok_or(KeyError::NotFound)?;
        fs::write(out.join(FORMAT_B_MANIFEST), &xml)?;

        let entries = manifest::parse_format_b(&xml)?;
        let mut src = File::open(&self.container)?;
        for entry in &entries {
            match entry.kind {
                EntryKind::Copy => self.copy_entry(&mut src, out, entry)?,
                EntryKind::Decrypt { .. } => self.decrypt_entry_b(&mut src, out, entry, mbox)?,
            }
        }
        Ok(())
    }

    fn extract_zip(&self, out: &Path) -> Result<(), ExtractError> {
        self.emit("Plain ZIP archive; unpacking.");
        let mut archive = zip::ZipArchive::new(File::open(&self.container)?)?;
        archive.extract(out)?;
        Ok(())
    }

    // ── Entry writers ────────────────────────────────────────────────────

    /// Verbatim byte-range copy.
    fn copy_entry(&self, src: &mut File, out: &Path, entry: &ManifestEntry) -> io::Result<()> {
        self.emit(&format!("Extracting {} ({} bytes)", entry.path, entry.length));
        let mut dest = create_dest(out, &entry.path)?;
        src.seek(SeekFrom::Start(entry.offset))?;
        copy_range(src, &mut dest, entry.length)
    }

    /// Decrypt up to `bound` bytes, then copy any remainder verbatim.
    ///
    /// The remainder is raw ciphertext; the vendor tool writes it
    /// undecrypted and consumers accept the result, so the behaviour is
    /// kept byte-for-byte.
    fn decrypt_entry_a(
        &self,
        src: &mut File,
        out: &Path,
        entry: &ManifestEntry,
        bound: u64,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> io::Result<()> {
        self.emit(&format!("Decrypting {} ({} bytes)", entry.path, entry.length));
        let decrypt_len = entry.length.min(bound) as usize;

        let mut data = vec![0u8; decrypt_len.next_multiple_of(4)];
        src.seek(SeekFrom::Start(entry.offset))?;
        src.read_exact(&mut data[..decrypt_len])?;
        let plain = crypto::aes_cfb_decrypt(&data, key, iv);

        let mut dest = create_dest(out, &entry.path)?;
        dest.write_all(&plain[..decrypt_len])?;
        if entry.length > decrypt_len as u64 {
            src.seek(SeekFrom::Start(entry.offset + decrypt_len as u64))?;
            copy_range(src, &mut dest, entry.length - decrypt_len as u64)?;
        }
        Ok(())
    }

    /// Format-B full-entry decryption.  Each entry gets a fresh cipher,
    /// re-seeded from the fixed register values.
    fn decrypt_entry_b(
        &self,
        src: &mut File,
        out: &Path,
        entry: &ManifestEntry,
        mbox: &ops::Mbox,
    ) -> io::Result<()> {
        self.emit(&format!("Decrypting {} ({} bytes)", entry.path, entry.length));
        let len = entry.length as usize;

        let mut data = vec![0u8; len.next_multiple_of(4)];
        src.seek(SeekFrom::Start(entry.offset))?;
        src.read_exact(&mut data[..len])?;
        let plain = OpsCipher::new(mbox).decrypt(&data);

        let mut dest = create_dest(out, &entry.path)?;
        dest.write_all(&plain[..len.min(plain.len())])?;
        Ok(())
    }

    // ── Setup ────────────────────────────────────────────────────────────

    fn prepare_output_dir(&self, output_dir: Option<&Path>) -> io::Result<PathBuf> {
        let out = match output_dir {
            Some(dir) => dir.to_path_buf(),
            None => self
                .container
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("extract"),
        };
        if out.exists() {
            fs::remove_dir_all(&out)?;
        }
        fs::create_dir_all(&out)?;
        Ok(out)
    }
}

/// Open the destination file for an entry, creating parent directories as
/// needed (entry paths may contain subdirectories).
fn create_dest(out: &Path, rel: &str) -> io::Result<File> {
    let dest = out.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(dest)
}

/// Copy exactly `len` bytes in [`COPY_BUF_SIZE`] chunks.  A short source
/// ends the copy early rather than erroring; container trailers sometimes
/// overlap the final declared entry.
fn copy_range<R: Read, W: Write>(src: &mut R, dest: &mut W, len: u64) -> io::Result<()> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(COPY_BUF_SIZE as u64) as usize;
        let got = src.read(&mut buf[..want])?;
        if got == 0 {
            break;
        }
        dest.write_all(&buf[..got])?;
        remaining -= got as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_range_is_exact() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut src = io::Cursor::new(data.clone());
        let mut dest = Vec::new();
        copy_range(&mut src, &mut dest, 40).unwrap();
        assert_eq!(dest, &data[..40]);
    }

    #[test]
    fn copy_range_tolerates_short_source() {
        let mut src = io::Cursor::new(vec![7u8; 10]);
        let mut dest = Vec::new();
        copy_range(&mut src, &mut dest, 1000).unwrap();
        assert_eq!(dest.len(), 10);
    }

    #[test]
    fn dest_paths_gain_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = create_dest(dir.path(), "images/super/super.1.img").unwrap();
        f.write_all(b"x").unwrap();
        assert!(dir.path().join("images/super/super.1.img").is_file());
    }
}
