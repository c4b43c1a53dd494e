//! Hot-patch metadata format.
//!
//! The metadata section describes every block prepared for hot-patching:
//!
//! ```text
//! u32 version
//! u32 count
//! { u32 rva; u16 block_size; u16 code_size } x count
//! ```
//!
//! All fields are packed little-endian. The version changes with any
//! backward-incompatible change, and readers refuse other versions.

use crate::error::{Error, Result};
use crate::pe::{MappedImage, PeHeaders};

/// Name of the section holding hot-patch metadata.
pub const HOTPATCH_METADATA_SECTION_NAME: &str = ".hpmeta";

/// Current metadata version.
pub const HOTPATCH_METADATA_VERSION: u32 = 1;

/// Size of the metadata header.
pub const HEADER_SIZE: usize = 8;

/// Size of one packed entry.
pub const ENTRY_SIZE: usize = 8;

/// Offset of `rva` within an entry.
pub const ENTRY_RVA_OFFSET: usize = 0;
/// Offset of `block_size` within an entry.
pub const ENTRY_BLOCK_SIZE_OFFSET: usize = 4;
/// Offset of `code_size` within an entry.
pub const ENTRY_CODE_SIZE_OFFSET: usize = 6;

/// One hot-patchable block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetadataEntry {
    /// RVA of the block.
    pub rva: u32,
    /// Size of the block, including trailing data.
    pub block_size: u16,
    /// Size of the code at the start of the block.
    pub code_size: u16,
}

impl MetadataEntry {
    pub fn end(&self) -> u64 {
        self.rva as u64 + self.block_size as u64
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.rva.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.code_size.to_le_bytes());
    }

    fn read(bytes: &[u8]) -> Self {
        Self {
            rva: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            block_size: u16::from_le_bytes([bytes[4], bytes[5]]),
            code_size: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

/// Decoded hot-patch metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HotPatchingMetadata {
    entries: Vec<MetadataEntry>,
}

impl HotPatchingMetadata {
    /// Build metadata from entries, validating them.
    pub fn new(entries: Vec<MetadataEntry>) -> Result<Self> {
        validate(&entries)?;
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialized size for `count` entries.
    pub fn encoded_size(count: usize) -> usize {
        HEADER_SIZE + count * ENTRY_SIZE
    }

    /// Serialize to the packed on-disk layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_size(self.entries.len()));
        out.extend_from_slice(&HOTPATCH_METADATA_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            entry.write(&mut out);
        }
        out
    }

    /// Parse the packed layout. Trailing bytes (section padding) are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::MetadataTruncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if version != HOTPATCH_METADATA_VERSION {
            return Err(Error::MetadataVersion {
                found: version,
                expected: HOTPATCH_METADATA_VERSION,
            });
        }

        let count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let needed = Self::encoded_size(count);
        if bytes.len() < needed {
            return Err(Error::MetadataTruncated {
                needed,
                available: bytes.len(),
            });
        }

        let entries: Vec<MetadataEntry> = bytes[HEADER_SIZE..needed]
            .chunks_exact(ENTRY_SIZE)
            .map(MetadataEntry::read)
            .collect();

        Self::new(entries)
    }

    /// Locate and parse the metadata section of a mapped image, checking that
    /// every entry lies inside a code section.
    pub fn from_image(image: &MappedImage<'_>) -> Result<Self> {
        let headers = image.headers()?;
        Self::from_image_with_headers(image, &headers)
    }

    pub fn from_image_with_headers(image: &MappedImage<'_>, headers: &PeHeaders) -> Result<Self> {
        let section = headers.section_by_name(HOTPATCH_METADATA_SECTION_NAME)?;
        let bytes = image
            .slice(section.virtual_address, section.mapped_size() as usize)
            .ok_or(Error::MetadataTruncated {
                needed: (section.virtual_address + section.mapped_size()) as usize,
                available: image.bytes.len(),
            })?;

        let metadata = Self::parse(bytes)?;
        for entry in &metadata.entries {
            if !headers.is_code_range(entry.rva, entry.block_size as u32) {
                return Err(Error::InvalidMetadataEntry {
                    rva: entry.rva,
                    reason: "entry is not inside a code section",
                });
            }
        }
        Ok(metadata)
    }
}

fn validate(entries: &[MetadataEntry]) -> Result<()> {
    for entry in entries {
        if entry.code_size > entry.block_size {
            return Err(Error::InvalidMetadataEntry {
                rva: entry.rva,
                reason: "code size exceeds block size",
            });
        }
    }
    for pair in entries.windows(2) {
        if pair[1].rva <= pair[0].rva {
            return Err(Error::InvalidMetadataEntry {
                rva: pair[1].rva,
                reason: "entries are not sorted by RVA",
            });
        }
        if (pair[1].rva as u64) < pair[0].end() {
            return Err(Error::InvalidMetadataEntry {
                rva: pair[1].rva,
                reason: "entry overlaps its predecessor",
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::{MappedImageBuilder, CODE_SECTION_CHARACTERISTICS, METADATA_SECTION_CHARACTERISTICS};

    fn entry(rva: u32, block_size: u16, code_size: u16) -> MetadataEntry {
        MetadataEntry {
            rva,
            block_size,
            code_size,
        }
    }

    #[test]
    fn test_packed_layout() {
        let metadata = HotPatchingMetadata::new(vec![entry(0x1000, 0x20, 0x10)]).unwrap();
        assert_eq!(
            metadata.to_bytes(),
            vec![1, 0, 0, 0, 1, 0, 0, 0, 0x00, 0x10, 0, 0, 0x20, 0, 0x10, 0]
        );
    }

    #[test]
    fn test_parse_ignores_trailing_padding() {
        let mut bytes = HotPatchingMetadata::new(vec![entry(0x1000, 8, 8), entry(0x1010, 4, 2)])
            .unwrap()
            .to_bytes();
        bytes.extend_from_slice(&[0; 16]);
        let metadata = HotPatchingMetadata::parse(&bytes).unwrap();
        assert_eq!(metadata.entries(), &[entry(0x1000, 8, 8), entry(0x1010, 4, 2)]);
    }

    #[test]
    fn test_version_mismatch_refused() {
        let mut bytes = HotPatchingMetadata::default().to_bytes();
        bytes[0] = 2;
        assert!(matches!(
            HotPatchingMetadata::parse(&bytes),
            Err(Error::MetadataVersion { found: 2, expected: 1 })
        ));
    }

    #[test]
    fn test_truncated() {
        let mut bytes = HotPatchingMetadata::new(vec![entry(0x1000, 8, 8)]).unwrap().to_bytes();
        bytes.truncate(12);
        assert!(matches!(
            HotPatchingMetadata::parse(&bytes),
            Err(Error::MetadataTruncated { needed: 16, available: 12 })
        ));
    }

    #[test]
    fn test_invalid_entries() {
        assert!(HotPatchingMetadata::new(vec![entry(0x1000, 4, 8)]).is_err());
        assert!(HotPatchingMetadata::new(vec![entry(0x1010, 4, 4), entry(0x1000, 4, 4)]).is_err());
        assert!(HotPatchingMetadata::new(vec![entry(0x1000, 0x20, 4), entry(0x1010, 4, 4)]).is_err());
        assert!(HotPatchingMetadata::new(vec![entry(0x1000, 0x10, 4), entry(0x1010, 4, 4)]).is_ok());
    }

    #[test]
    fn test_from_image_checks_code_sections() {
        let good = HotPatchingMetadata::new(vec![entry(0x1000, 0x10, 0x10)]).unwrap();
        let image = MappedImageBuilder::new(0x0040_0000)
            .section(".text", 0x1000, vec![0x90; 0x10], CODE_SECTION_CHARACTERISTICS)
            .section(HOTPATCH_METADATA_SECTION_NAME, 0x2000, good.to_bytes(), METADATA_SECTION_CHARACTERISTICS)
            .build();
        let mapped = MappedImage::new(0x0040_0000, &image);
        assert_eq!(HotPatchingMetadata::from_image(&mapped).unwrap(), good);

        let bad = HotPatchingMetadata::new(vec![entry(0x2000, 4, 4)]).unwrap();
        let image = MappedImageBuilder::new(0x0040_0000)
            .section(".text", 0x1000, vec![0x90; 0x10], CODE_SECTION_CHARACTERISTICS)
            .section(HOTPATCH_METADATA_SECTION_NAME, 0x2000, bad.to_bytes(), METADATA_SECTION_CHARACTERISTICS)
            .build();
        let mapped = MappedImage::new(0x0040_0000, &image);
        assert!(matches!(
            HotPatchingMetadata::from_image(&mapped),
            Err(Error::InvalidMetadataEntry { rva: 0x2000, .. })
        ));
    }
}
