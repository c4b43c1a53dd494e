//! PE format parsing and types.
//!
//! This module parses PE headers out of a mapped image (a byte view in which
//! every section sits at its RVA, as the loader lays it out) and provides the
//! section map the decomposer and the agents need. It also converts an on-disk
//! file into that mapped layout, and builds small synthetic images.

use crate::error::{Error, Result};

// PE format constants
pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const MACHINE_AMD64: u16 = 0x8664;
pub const MACHINE_I386: u16 = 0x014C;
pub const OPTIONAL_MAGIC_PE32: u16 = 0x10B;
/// Index of the debug directory among the optional header's data directories.
pub const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;

// Section characteristics
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;

/// Characteristics of a typical code section.
pub const CODE_SECTION_CHARACTERISTICS: u32 =
    IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;

/// Characteristics of the hot-patch metadata section (read-only data).
pub const METADATA_SECTION_CHARACTERISTICS: u32 =
    IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ;

/// DOS header (64 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct DosHeader {
    pub e_magic: u16,      // Magic number ("MZ")
    pub e_cblp: u16,       // Bytes on last page of file
    pub e_cp: u16,         // Pages in file
    pub e_crlc: u16,       // Relocations
    pub e_cparhdr: u16,    // Size of header in paragraphs
    pub e_minalloc: u16,   // Minimum extra paragraphs needed
    pub e_maxalloc: u16,   // Maximum extra paragraphs needed
    pub e_ss: u16,         // Initial SS value
    pub e_sp: u16,         // Initial SP value
    pub e_csum: u16,       // Checksum
    pub e_ip: u16,         // Initial IP value
    pub e_cs: u16,         // Initial CS value
    pub e_lfarlc: u16,     // File address of relocation table
    pub e_ovno: u16,       // Overlay number
    pub e_res: [u16; 4],   // Reserved words
    pub e_oemid: u16,      // OEM identifier
    pub e_oeminfo: u16,    // OEM information
    pub e_res2: [u16; 10], // Reserved words
    pub e_lfanew: i32,     // File address of new exe header (PE offset)
}

impl DosHeader {
    /// Create a minimal valid DOS header.
    pub fn minimal(pe_offset: u32) -> Self {
        Self {
            e_magic: DOS_MAGIC,
            e_cblp: 0x90,
            e_cp: 0x03,
            e_crlc: 0,
            e_cparhdr: 0x04,
            e_minalloc: 0,
            e_maxalloc: 0xFFFF,
            e_ss: 0,
            e_sp: 0xB8,
            e_csum: 0,
            e_ip: 0,
            e_cs: 0,
            e_lfarlc: 0x40,
            e_ovno: 0,
            e_res: [0; 4],
            e_oemid: 0,
            e_oeminfo: 0,
            e_res2: [0; 10],
            e_lfanew: pe_offset as i32,
        }
    }
}

/// COFF file header (20 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Data directory entry.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// Optional header (PE32+, 64-bit).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// Optional header (PE32, 32-bit).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct OptionalHeader32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// Section header (40 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Get the section name as a string (trimmed of null bytes).
    pub fn name_str(&self) -> &str {
        let name_slice = &self.name;
        let end = name_slice.iter().position(|&b| b == 0).unwrap_or(8);
        std::str::from_utf8(&name_slice[..end]).unwrap_or("")
    }

    /// Create a new section header with the given name.
    pub fn new(name: &str) -> Self {
        let mut header = Self {
            name: [0; 8],
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics: 0,
        };
        let name_bytes = name.as_bytes();
        let len = name_bytes.len().min(8);
        header.name[..len].copy_from_slice(&name_bytes[..len]);
        header
    }
}

/// Parsed section information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionInfo {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionInfo {
    /// Whether the section holds executable code.
    pub fn is_code(&self) -> bool {
        self.characteristics & (IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE) != 0
    }

    /// Size the section occupies once mapped.
    pub fn mapped_size(&self) -> u32 {
        if self.virtual_size != 0 {
            self.virtual_size
        } else {
            self.size_of_raw_data
        }
    }

    /// Whether `rva` falls inside the mapped extent of the section.
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.mapped_size()
    }
}

impl From<&SectionHeader> for SectionInfo {
    fn from(header: &SectionHeader) -> Self {
        Self {
            name: header.name_str().to_string(),
            virtual_size: header.virtual_size,
            virtual_address: header.virtual_address,
            size_of_raw_data: header.size_of_raw_data,
            pointer_to_raw_data: header.pointer_to_raw_data,
            characteristics: header.characteristics,
        }
    }
}

/// Read a packed header out of `bytes` at `offset`.
fn read_struct<T: Copy>(bytes: &[u8], offset: usize) -> Result<T> {
    let needed = offset + std::mem::size_of::<T>();
    if bytes.len() < needed {
        return Err(Error::HeadersTooSmall {
            expected: needed,
            actual: bytes.len(),
        });
    }
    // SAFETY: bounds checked above; T is a packed POD header.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr().add(offset) as *const T) })
}

/// View a packed header as raw bytes.
fn struct_bytes<T: Copy>(value: &T) -> &[u8] {
    // SAFETY: T is a packed POD header without padding.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
}

/// Headers of a PE image.
#[derive(Clone, Debug)]
pub struct PeHeaders {
    /// Offset to PE signature (e_lfanew).
    pub pe_offset: u32,
    /// Machine type.
    pub machine: u16,
    /// Timestamp.
    pub time_date_stamp: u32,
    /// File characteristics.
    pub characteristics: u16,
    /// Preferred image base.
    pub image_base: u64,
    /// Section alignment.
    pub section_alignment: u32,
    /// File alignment.
    pub file_alignment: u32,
    /// Size of image.
    pub size_of_image: u32,
    /// Size of headers.
    pub size_of_headers: u32,
    /// Image checksum.
    pub check_sum: u32,
    /// Is this a 64-bit PE?
    pub is_64bit: bool,
    /// Parsed section information.
    pub sections: Vec<SectionInfo>,
    /// The debug data directory, when present and non-empty.
    pub debug_directory: Option<DataDirectory>,
}

impl PeHeaders {
    /// Parse PE headers from the first bytes of an image (mapped or on disk).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let dos_header: DosHeader = read_struct(bytes, 0)?;
        if dos_header.e_magic != DOS_MAGIC {
            return Err(Error::InvalidDosSignature(0));
        }

        let pe_offset = dos_header.e_lfanew as u32;
        let pe_header_start = pe_offset as usize;

        let pe_sig: u32 = read_struct(bytes, pe_header_start)?;
        if pe_sig != PE_SIGNATURE {
            return Err(Error::InvalidPeSignature(pe_header_start));
        }

        let file_header: FileHeader = read_struct(bytes, pe_header_start + 4)?;
        let machine = file_header.machine;
        if machine != MACHINE_AMD64 && machine != MACHINE_I386 {
            return Err(Error::UnsupportedMachine(machine));
        }
        let is_64bit = machine == MACHINE_AMD64;

        let opt_header_start = pe_header_start + 4 + std::mem::size_of::<FileHeader>();
        let (image_base, section_alignment, file_alignment, size_of_image, size_of_headers, check_sum, directories) =
            if is_64bit {
                let opt: OptionalHeader64 = read_struct(bytes, opt_header_start)?;
                (
                    opt.image_base,
                    opt.section_alignment,
                    opt.file_alignment,
                    opt.size_of_image,
                    opt.size_of_headers,
                    opt.check_sum,
                    (std::mem::size_of::<OptionalHeader64>(), opt.number_of_rva_and_sizes),
                )
            } else {
                let opt: OptionalHeader32 = read_struct(bytes, opt_header_start)?;
                (
                    opt.image_base as u64,
                    opt.section_alignment,
                    opt.file_alignment,
                    opt.size_of_image,
                    opt.size_of_headers,
                    opt.check_sum,
                    (std::mem::size_of::<OptionalHeader32>(), opt.number_of_rva_and_sizes),
                )
            };

        // Data directories trail the fixed optional header and must fit in
        // the size the file header declares for it.
        let (fixed_len, directory_count) = directories;
        let debug_offset = fixed_len + IMAGE_DIRECTORY_ENTRY_DEBUG * std::mem::size_of::<DataDirectory>();
        let debug_directory = if (directory_count as usize) > IMAGE_DIRECTORY_ENTRY_DEBUG
            && debug_offset + std::mem::size_of::<DataDirectory>() <= file_header.size_of_optional_header as usize
        {
            read_struct::<DataDirectory>(bytes, opt_header_start + debug_offset)
                .ok()
                .filter(|dir| {
                    let (rva, size) = (dir.virtual_address, dir.size);
                    rva != 0 && size != 0
                })
        } else {
            None
        };

        let section_header_start = opt_header_start + file_header.size_of_optional_header as usize;
        let number_of_sections = file_header.number_of_sections as usize;
        let mut sections = Vec::with_capacity(number_of_sections);
        for i in 0..number_of_sections {
            let offset = section_header_start + i * std::mem::size_of::<SectionHeader>();
            let header: SectionHeader = read_struct(bytes, offset)?;
            sections.push(SectionInfo::from(&header));
        }

        Ok(Self {
            pe_offset,
            machine,
            time_date_stamp: file_header.time_date_stamp,
            characteristics: file_header.characteristics,
            image_base,
            section_alignment,
            file_alignment,
            size_of_image,
            size_of_headers,
            check_sum,
            is_64bit,
            sections,
            debug_directory,
        })
    }

    /// Find a section by name.
    pub fn section_by_name(&self, name: &str) -> Result<&SectionInfo> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::SectionNotFound {
                name: name.to_string(),
            })
    }

    /// Find the section containing an RVA.
    pub fn section_containing(&self, rva: u32) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// Whether `[rva, rva + size)` lies entirely inside one code section.
    pub fn is_code_range(&self, rva: u32, size: u32) -> bool {
        match self.section_containing(rva) {
            Some(section) if section.is_code() => {
                let end = rva as u64 + size as u64;
                end <= section.virtual_address as u64 + section.mapped_size() as u64
            }
            _ => false,
        }
    }

    /// Align a value up to the given alignment.
    #[inline]
    pub fn align_up(value: usize, alignment: usize) -> usize {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// Identity of a loaded module, as recorded in trace segment headers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModuleIdentity {
    /// Address the module is loaded at.
    pub base: u64,
    /// Size of the mapped image.
    pub size: u32,
    /// Checksum from the optional header.
    pub checksum: u32,
    /// Time/date stamp from the file header.
    pub time_date_stamp: u32,
}

/// A PE image as the loader maps it: every section sits at its RVA.
#[derive(Clone, Copy, Debug)]
pub struct MappedImage<'a> {
    /// Address the image is (or is considered to be) loaded at. Pointers
    /// embedded in the code are interpreted against this address.
    pub load_address: u64,
    /// The mapped bytes, indexed by RVA.
    pub bytes: &'a [u8],
}

impl<'a> MappedImage<'a> {
    pub fn new(load_address: u64, bytes: &'a [u8]) -> Self {
        Self {
            load_address,
            bytes,
        }
    }

    /// View a module loaded in the current process.
    ///
    /// # Safety
    /// `base` must point to a mapped image of at least `size` readable bytes
    /// that stays mapped for the lifetime `'a`.
    pub unsafe fn from_raw(base: *const u8, size: usize) -> Self {
        Self {
            load_address: base as u64,
            bytes: std::slice::from_raw_parts(base, size),
        }
    }

    /// View the module containing `hmodule` in the current process.
    #[cfg(target_os = "windows")]
    pub fn from_hmodule(hmodule: windows::Win32::Foundation::HMODULE) -> Result<MappedImage<'static>> {
        use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
        use windows::Win32::System::Threading::GetCurrentProcess;

        let mut info = MODULEINFO::default();
        unsafe {
            GetModuleInformation(
                GetCurrentProcess(),
                hmodule,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )?;
            Ok(MappedImage::from_raw(
                info.lpBaseOfDll as *const u8,
                info.SizeOfImage as usize,
            ))
        }
    }

    /// Parse the image headers.
    pub fn headers(&self) -> Result<PeHeaders> {
        PeHeaders::parse(self.bytes)
    }

    /// Bytes of `[rva, rva + len)`, if mapped.
    pub fn slice(&self, rva: u32, len: usize) -> Option<&'a [u8]> {
        let start = rva as usize;
        self.bytes.get(start..start.checked_add(len)?)
    }

    /// The identity recorded for this module in trace segments.
    pub fn identity(&self) -> Result<ModuleIdentity> {
        let headers = self.headers()?;
        Ok(ModuleIdentity {
            base: self.load_address,
            size: headers.size_of_image,
            checksum: headers.check_sum,
            time_date_stamp: headers.time_date_stamp,
        })
    }
}

/// Convert an on-disk PE file into its mapped layout.
pub fn map_file_image(file: &[u8]) -> Result<Vec<u8>> {
    let headers = PeHeaders::parse(file)?;
    let mut mapped = vec![0u8; headers.size_of_image as usize];

    let header_len = (headers.size_of_headers as usize).min(file.len()).min(mapped.len());
    mapped[..header_len].copy_from_slice(&file[..header_len]);

    for section in &headers.sections {
        let raw_start = section.pointer_to_raw_data as usize;
        let raw_len = section.size_of_raw_data.min(section.mapped_size()) as usize;
        let dst_start = section.virtual_address as usize;
        if raw_start == 0 || raw_len == 0 {
            continue;
        }
        let Some(src) = file.get(raw_start..raw_start + raw_len) else {
            return Err(Error::HeadersTooSmall {
                expected: raw_start + raw_len,
                actual: file.len(),
            });
        };
        let Some(dst) = mapped.get_mut(dst_start..dst_start + raw_len) else {
            return Err(Error::HeadersTooSmall {
                expected: dst_start + raw_len,
                actual: headers.size_of_image as usize,
            });
        };
        dst.copy_from_slice(src);
    }

    Ok(mapped)
}

/// A section to place in a synthetic mapped image.
#[derive(Clone, Debug)]
struct PendingSection {
    name: String,
    rva: u32,
    data: Vec<u8>,
    virtual_size: u32,
    characteristics: u32,
}

/// Builds small mapped PE32 images, for instrumented test modules and for
/// tooling that needs an image around a handful of blocks.
#[derive(Clone, Debug)]
pub struct MappedImageBuilder {
    image_base: u32,
    section_alignment: u32,
    time_date_stamp: u32,
    check_sum: u32,
    sections: Vec<PendingSection>,
}

impl MappedImageBuilder {
    /// Size reserved for headers; sections start at or after this RVA.
    pub const HEADERS_SIZE: u32 = 0x400;

    pub fn new(image_base: u32) -> Self {
        Self {
            image_base,
            section_alignment: 0x1000,
            time_date_stamp: 0,
            check_sum: 0,
            sections: Vec::new(),
        }
    }

    pub fn time_date_stamp(mut self, stamp: u32) -> Self {
        self.time_date_stamp = stamp;
        self
    }

    pub fn check_sum(mut self, check_sum: u32) -> Self {
        self.check_sum = check_sum;
        self
    }

    /// Add a section at an explicit RVA.
    pub fn section(mut self, name: &str, rva: u32, data: Vec<u8>, characteristics: u32) -> Self {
        let virtual_size = data.len() as u32;
        self.sections.push(PendingSection {
            name: name.to_string(),
            rva,
            data,
            virtual_size,
            characteristics,
        });
        self
    }

    /// RVA at which the next section would be placed.
    pub fn next_section_rva(&self) -> u32 {
        self.sections
            .iter()
            .map(|s| s.rva + s.virtual_size.max(1))
            .max()
            .map(|end| PeHeaders::align_up(end as usize, self.section_alignment as usize) as u32)
            .unwrap_or(self.section_alignment)
    }

    /// Lay the image out in memory.
    pub fn build(&self) -> Vec<u8> {
        let size_of_image = PeHeaders::align_up(
            self.next_section_rva().max(self.section_alignment) as usize,
            self.section_alignment as usize,
        );
        let mut image = vec![0u8; size_of_image];

        let pe_offset = 0x80u32;
        let dos = DosHeader::minimal(pe_offset);
        image[..64].copy_from_slice(struct_bytes(&dos));

        let mut cursor = pe_offset as usize;
        image[cursor..cursor + 4].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
        cursor += 4;

        let file_header = FileHeader {
            machine: MACHINE_I386,
            number_of_sections: self.sections.len() as u16,
            time_date_stamp: self.time_date_stamp,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: std::mem::size_of::<OptionalHeader32>() as u16,
            characteristics: 0x0102,
        };
        image[cursor..cursor + 20].copy_from_slice(struct_bytes(&file_header));
        cursor += 20;

        let optional = OptionalHeader32 {
            magic: OPTIONAL_MAGIC_PE32,
            major_linker_version: 14,
            minor_linker_version: 0,
            size_of_code: 0,
            size_of_initialized_data: 0,
            size_of_uninitialized_data: 0,
            address_of_entry_point: 0,
            base_of_code: 0,
            base_of_data: 0,
            image_base: self.image_base,
            section_alignment: self.section_alignment,
            file_alignment: 0x200,
            major_operating_system_version: 6,
            minor_operating_system_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 6,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image: size_of_image as u32,
            size_of_headers: Self::HEADERS_SIZE,
            check_sum: self.check_sum,
            subsystem: 3,
            dll_characteristics: 0,
            size_of_stack_reserve: 0x10_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x10_0000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            number_of_rva_and_sizes: 0,
        };
        let opt_len = std::mem::size_of::<OptionalHeader32>();
        image[cursor..cursor + opt_len].copy_from_slice(struct_bytes(&optional));
        cursor += opt_len;

        for section in &self.sections {
            let mut header = SectionHeader::new(&section.name);
            header.virtual_size = section.virtual_size;
            header.virtual_address = section.rva;
            header.size_of_raw_data = section.data.len() as u32;
            header.pointer_to_raw_data = section.rva;
            header.characteristics = section.characteristics;
            image[cursor..cursor + 40].copy_from_slice(struct_bytes(&header));
            cursor += 40;

            let start = section.rva as usize;
            image[start..start + section.data.len()].copy_from_slice(&section.data);
        }

        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dos_header_size() {
        assert_eq!(std::mem::size_of::<DosHeader>(), 64);
    }

    #[test]
    fn test_file_header_size() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 20);
    }

    #[test]
    fn test_section_header_size() {
        assert_eq!(std::mem::size_of::<SectionHeader>(), 40);
    }

    #[test]
    fn test_section_name() {
        let mut header = SectionHeader::new(".text");
        assert_eq!(header.name_str(), ".text");

        header = SectionHeader::new(".verylongname");
        assert_eq!(header.name_str(), ".verylon"); // Truncated to 8 chars
    }

    #[test]
    fn test_align_up() {
        assert_eq!(PeHeaders::align_up(0, 4096), 0);
        assert_eq!(PeHeaders::align_up(1, 4096), 4096);
        assert_eq!(PeHeaders::align_up(4096, 4096), 4096);
        assert_eq!(PeHeaders::align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_builder_round_trip() {
        let image = MappedImageBuilder::new(0x0040_0000)
            .time_date_stamp(0x5EED_5EED)
            .check_sum(0x1234)
            .section(".text", 0x1000, vec![0x90; 0x20], CODE_SECTION_CHARACTERISTICS)
            .section(".rdata", 0x2000, vec![1, 2, 3, 4], METADATA_SECTION_CHARACTERISTICS)
            .build();

        let headers = PeHeaders::parse(&image).unwrap();
        assert!(!headers.is_64bit);
        assert_eq!(headers.image_base, 0x0040_0000);
        assert_eq!(headers.time_date_stamp, 0x5EED_5EED);
        assert_eq!(headers.check_sum, 0x1234);
        assert_eq!(headers.sections.len(), 2);
        assert!(headers.section_by_name(".text").unwrap().is_code());
        assert!(!headers.section_by_name(".rdata").unwrap().is_code());
        assert!(headers.is_code_range(0x1000, 0x20));
        assert!(!headers.is_code_range(0x1010, 0x20));
        assert!(!headers.is_code_range(0x2000, 1));
        assert_eq!(&image[0x2000..0x2004], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_missing_section() {
        let image = MappedImageBuilder::new(0x0040_0000).build();
        let headers = PeHeaders::parse(&image).unwrap();
        assert!(matches!(
            headers.section_by_name(".hpmeta"),
            Err(Error::SectionNotFound { .. })
        ));
    }

    #[test]
    fn test_bad_signature() {
        let mut image = MappedImageBuilder::new(0x0040_0000).build();
        image[0] = b'X';
        assert!(matches!(PeHeaders::parse(&image), Err(Error::InvalidDosSignature(0))));
    }

    #[test]
    fn test_map_file_image() {
        // A mapped image whose raw pointers equal its RVAs is also a valid file.
        let image = MappedImageBuilder::new(0x0040_0000)
            .section(".text", 0x1000, vec![0xCC; 0x10], CODE_SECTION_CHARACTERISTICS)
            .build();
        let mapped = map_file_image(&image).unwrap();
        assert_eq!(mapped.len(), image.len());
        assert_eq!(&mapped[0x1000..0x1010], &[0xCC; 0x10]);
    }

    #[test]
    fn test_identity() {
        let bytes = MappedImageBuilder::new(0x1000_0000)
            .time_date_stamp(7)
            .check_sum(9)
            .build();
        let image = MappedImage::new(0x1000_0000, &bytes);
        let id = image.identity().unwrap();
        assert_eq!(id.base, 0x1000_0000);
        assert_eq!(id.checksum, 9);
        assert_eq!(id.time_date_stamp, 7);
        assert_eq!(id.size as usize, bytes.len());
    }
}
