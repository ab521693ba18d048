//! Manifest interpreter: the decrypted XML tree becomes a flat list of
//! typed extraction entries.
//!
//! Both formats describe their payload as sections of `File`-like elements.
//! The enclosing section name decides how an entry's bytes are treated:
//! some sections are stored verbatim, the rest are encrypted (entirely, or
//! only a bounded prefix — see [`DecryptChunk`]).  Elements without a
//! `Path`/`filename` attribute are not file entries and are skipped.

use roxmltree::{Document, Node};
use thiserror::Error;

/// Format-B containers always use 512-byte sectors.
pub const FORMAT_B_PAGESIZE: u64 = 0x200;
/// Bounded decrypt prefix for ordinary Format-A sections.
pub const BOUNDED_DECRYPT_SIZE: u64 = 0x40000;

/// Format-A sections whose entries are stored verbatim.
const FORMAT_A_COPY_SECTIONS: [&str; 3] = ["DigestsToSign", "ChainedTableOfDigests", "Firmware"];

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest XML is malformed: {0}")]
    Malformed(#[from] roxmltree::Error),
}

/// Where an entry's source offset comes from.  Both resolve to
/// `value × pagesize`, but which attribute supplied the value matters for
/// diagnostics and mirrors the container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSource {
    /// `FileOffsetInSrc` — offset expressed in page-size units.
    PageUnits(u64),
    /// `SizeInSectorInSrc` pressed into service as the offset when the
    /// offset attribute is absent.  Observed vendor-tool behaviour.
    SectorCount(u64),
}

impl OffsetSource {
    /// Resolve to an absolute byte offset.
    pub fn resolve(self, pagesize: u64) -> u64 {
        match self {
            OffsetSource::PageUnits(n) | OffsetSource::SectorCount(n) => n * pagesize,
        }
    }
}

/// How much of a decrypt-tagged entry is actually decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptChunk {
    /// The whole entry — Sahara programmer images must be fully usable.
    WholeEntry,
    /// A [`BOUNDED_DECRYPT_SIZE`] prefix; the remainder is copied verbatim
    /// (as ciphertext) by the pipeline.
    Bounded,
}

/// How the extraction pipeline treats an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Verbatim byte-range copy.
    Copy,
    /// Decrypt a prefix, then copy any remainder.
    Decrypt { chunk: DecryptChunk },
}

/// One file to be written by the extraction pipeline.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    /// Output path relative to the extraction directory.
    pub path: String,
    /// Enclosing section name (diagnostics).
    pub section: String,
    /// Absolute byte offset in the container.
    pub offset: u64,
    /// Byte length in the container.
    pub length: u64,
    pub kind: EntryKind,
}

// ── Format-A ─────────────────────────────────────────────────────────────────

/// Interpret a Format-A manifest.  Entries live one and two levels beneath
/// each section element; both levels are collected, in document order.
pub fn parse_format_a(xml: &str, pagesize: u64) -> Result<Vec<ManifestEntry>, ManifestError> {
    let doc = Document::parse(xml)?;
    let mut entries = Vec::new();
    for section in elements(doc.root_element()) {
        let section_name = section.tag_name().name();
        for item in elements(section) {
            push_format_a_entry(&mut entries, item, section_name, pagesize);
            for sub in elements(item) {
                push_format_a_entry(&mut entries, sub, section_name, pagesize);
            }
        }
    }
    Ok(entries)
}

fn push_format_a_entry(
    entries: &mut Vec<ManifestEntry>,
    node: Node,
    section: &str,
    pagesize: u64,
) {
    let Some(path) = node.attribute("Path").or_else(|| node.attribute("filename")) else {
        return;
    };
    if path.is_empty() {
        return;
    }

    let offset = if let Some(v) = attr_u64(node, "FileOffsetInSrc") {
        OffsetSource::PageUnits(v)
    } else if let Some(v) = attr_u64(node, "SizeInSectorInSrc") {
        OffsetSource::SectorCount(v)
    } else {
        return;
    };
    let length = match attr_u64(node, "SizeInByteInSrc") {
        Some(v) => v,
        None => attr_u64(node, "SizeInSectorInSrc").unwrap_or(0) * pagesize,
    };

    let kind = if FORMAT_A_COPY_SECTIONS.contains(&section) {
        EntryKind::Copy
    } else if section == "Sahara" {
        EntryKind::Decrypt { chunk: DecryptChunk::WholeEntry }
    } else {
        EntryKind::Decrypt { chunk: DecryptChunk::Bounded }
    };

    entries.push(ManifestEntry {
        path: path.to_string(),
        section: section.to_string(),
        offset: offset.resolve(pagesize),
        length,
        kind,
    });
}

// ── Format-B ─────────────────────────────────────────────────────────────────

/// Interpret a Format-B manifest.  `SAHARA` files are decrypted in full,
/// `UFS_PROVISION` files and everything under `*Program*` sections are
/// stored verbatim; offsets are in fixed 512-byte sectors.
pub fn parse_format_b(xml: &str) -> Result<Vec<ManifestEntry>, ManifestError> {
    let doc = Document::parse(xml)?;
    let mut entries = Vec::new();
    for section in elements(doc.root_element()) {
        let name = section.tag_name().name();
        if name == "SAHARA" {
            for item in elements(section).filter(|n| n.has_tag_name("File")) {
                push_format_b_entry(
                    &mut entries,
                    item,
                    name,
                    "Path",
                    EntryKind::Decrypt { chunk: DecryptChunk::WholeEntry },
                );
            }
        } else if name == "UFS_PROVISION" {
            for item in elements(section).filter(|n| n.has_tag_name("File")) {
                push_format_b_entry(&mut entries, item, name, "Path", EntryKind::Copy);
            }
        } else if name.contains("Program") {
            for item in elements(section) {
                push_format_b_entry(&mut entries, item, name, "filename", EntryKind::Copy);
                for sub in elements(item) {
                    push_format_b_entry(&mut entries, sub, name, "filename", EntryKind::Copy);
                }
            }
        }
    }
    Ok(entries)
}

fn push_format_b_entry(
    entries: &mut Vec<ManifestEntry>,
    node: Node,
    section: &str,
    path_attr: &str,
    kind: EntryKind,
) {
    let Some(path) = node.attribute(path_attr) else { return };
    if path.is_empty() {
        return;
    }
    let offset = attr_u64(node, "FileOffsetInSrc").unwrap_or(0) * FORMAT_B_PAGESIZE;
    let length = attr_u64(node, "SizeInByteInSrc").unwrap_or(0);
    entries.push(ManifestEntry {
        path: path.to_string(),
        section: section.to_string(),
        offset,
        length,
        kind,
    });
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn attr_u64(node: Node, name: &str) -> Option<u64> {
    node.attribute(name).and_then(|v| v.parse().ok())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const OFP_XML: &str = r#"<?xml version="1.0"?>
<ProFileInfo>
  <Firmware>
    <File Path="xbl.elf" FileOffsetInSrc="0" SizeInByteInSrc="1024"/>
  </Firmware>
  <Sahara>
    <File Path="prog_firehose.elf" FileOffsetInSrc="2" SizeInByteInSrc="4096"/>
  </Sahara>
  <Data>
    <Program filename="userdata.img" FileOffsetInSrc="10" SizeInByteInSrc="300000"/>
    <Program label="no-path-here"/>
  </Data>
  <Sparse>
    <Img SizeInSectorInSrc="4" SizeInByteInSrc="2048" Path="super.img">
      <Piece filename="super.1.img" FileOffsetInSrc="8" SizeInByteInSrc="512"/>
    </Img>
  </Sparse>
</ProFileInfo>"#;

    #[test]
    fn format_a_sections_classify() {
        let entries = parse_format_a(OFP_XML, 512).unwrap();
        assert_eq!(entries.len(), 5);

        let xbl = &entries[0];
        assert_eq!(xbl.path, "xbl.elf");
        assert_eq!(xbl.kind, EntryKind::Copy);
        assert_eq!(xbl.offset, 0);
        assert_eq!(xbl.length, 1024);

        let sahara = &entries[1];
        assert_eq!(sahara.kind, EntryKind::Decrypt { chunk: DecryptChunk::WholeEntry });
        assert_eq!(sahara.offset, 2 * 512);

        let data = &entries[2];
        assert_eq!(data.kind, EntryKind::Decrypt { chunk: DecryptChunk::Bounded });
        assert_eq!(data.length, 300000);
    }

    // An entry may give only a sector count; it then supplies the offset.
    #[test]
    fn format_a_sector_offset_fallback() {
        let entries = parse_format_a(OFP_XML, 512).unwrap();
        let sparse = entries.iter().find(|e| e.path == "super.img").unwrap();
        assert_eq!(sparse.offset, 4 * 512);
        assert_eq!(sparse.length, 2048);
    }

    // Nested items one level below a section item are collected too.
    #[test]
    fn format_a_nested_entries() {
        let entries = parse_format_a(OFP_XML, 512).unwrap();
        let piece = entries.iter().find(|e| e.path == "super.1.img").unwrap();
        assert_eq!(piece.offset, 8 * 512);
        assert_eq!(piece.section, "Sparse");
    }

    #[test]
    fn format_a_pathless_entries_skipped() {
        let entries = parse_format_a(OFP_XML, 512).unwrap();
        assert!(entries.iter().all(|e| !e.path.is_empty()));
    }

    const OPS_XML: &str = r#"<?xml version="1.0"?>
<BasicInfo>
  <SAHARA>
    <File Path="prog_emmc.mbn" FileOffsetInSrc="0" SizeInByteInSrc="64"/>
  </SAHARA>
  <UFS_PROVISION>
    <File Path="provision.xml" FileOffsetInSrc="1" SizeInByteInSrc="32"/>
  </UFS_PROVISION>
  <ProgramList>
    <Program filename="boot.img" FileOffsetInSrc="2" SizeInByteInSrc="128">
      <SubProgram filename="dtbo.img" FileOffsetInSrc="4" SizeInByteInSrc="16"/>
    </Program>
  </ProgramList>
  <Ignored>
    <File Path="never.bin" FileOffsetInSrc="9" SizeInByteInSrc="1"/>
  </Ignored>
</BasicInfo>"#;

    #[test]
    fn format_b_sections_classify() {
        let entries = parse_format_b(OPS_XML).unwrap();
        assert_eq!(entries.len(), 4);

        assert_eq!(entries[0].path, "prog_emmc.mbn");
        assert_eq!(entries[0].kind, EntryKind::Decrypt { chunk: DecryptChunk::WholeEntry });
        assert_eq!(entries[0].offset, 0);

        assert_eq!(entries[1].path, "provision.xml");
        assert_eq!(entries[1].kind, EntryKind::Copy);
        assert_eq!(entries[1].offset, 0x200);

        assert_eq!(entries[2].path, "boot.img");
        assert_eq!(entries[3].path, "dtbo.img");
        assert_eq!(entries[3].offset, 4 * 0x200);
    }

    // Sections outside the known set are not extracted.
    #[test]
    fn format_b_unknown_sections_ignored() {
        let entries = parse_format_b(OPS_XML).unwrap();
        assert!(entries.iter().all(|e| e.path != "never.bin"));
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_format_a("<unclosed", 512).is_err());
        assert!(parse_format_b("not xml at all").is_err());
    }

    #[test]
    fn offset_source_resolution() {
        assert_eq!(OffsetSource::PageUnits(3).resolve(4096), 3 * 4096);
        assert_eq!(OffsetSource::SectorCount(7).resolve(512), 7 * 512);
    }
}
