use std::{mem::size_of, slice};

use bytemuck::{Pod, Zeroable};

pub(crate) const DOS_MAGIC: u16 = 0x5A4D; // MZ
pub(crate) const NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
pub(crate) const PE32_MAGIC: u16 = 0x10B;
pub(crate) const PE32_PLUS_MAGIC: u16 = 0x20B;

pub(crate) const FILE_HEADER_LEN: usize = 20;
pub(crate) const OPTIONAL_HEADER_OFFSET: usize = 4 + FILE_HEADER_LEN;
pub(crate) const SIZE_OF_IMAGE_OFFSET: usize = 56;
pub(crate) const IMPORT_DIRECTORY_INDEX: u32 = 1;

// Same cap the Windows loader applies to e_lfanew.
const MAX_NT_OFFSET: usize = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("image does not start with an MZ header")]
    BadDosSignature,
    #[error("image has no PE signature at offset {0:#x}")]
    BadNtSignature(usize),
    #[error("unknown optional header magic {0:#06x}")]
    UnknownMagic(u16),
    #[error("{len} bytes at rva {rva:#x} fall outside the image")]
    OutOfBounds { rva: usize, len: usize },
    #[error("image has no import directory")]
    NoImportDirectory,
    #[error("{0} is not among the image's imports")]
    ModuleNotImported(String),
    #[error("{symbol} is not imported from {module}")]
    SymbolNotImported { module: String, symbol: String },
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[allow(dead_code)]
pub(crate) struct DosHeader {
    pub e_magic: u16,
    pub e_rest: [u16; 29],
    pub e_lfanew: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[allow(dead_code)]
pub(crate) struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[allow(dead_code)]
pub(crate) struct RawImportDescriptor {
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name: u32,
    pub first_thunk: u32,
}

/// Width of one thunk entry, which is also the width of an import address slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThunkWidth {
    /// PE32
    U32,
    /// PE32+
    U64,
}

impl ThunkWidth {
    pub const fn size(self) -> usize {
        match self {
            ThunkWidth::U32 => 4,
            ThunkWidth::U64 => 8,
        }
    }

    pub(crate) const fn ordinal_flag(self) -> u64 {
        match self {
            ThunkWidth::U32 => 0x8000_0000,
            ThunkWidth::U64 => 0x8000_0000_0000_0000,
        }
    }

    /// The width matching pointers of the running process.
    pub const fn native() -> Self {
        if size_of::<usize>() == 8 { ThunkWidth::U64 } else { ThunkWidth::U32 }
    }

    const fn data_directory_offset(self) -> usize {
        match self {
            ThunkWidth::U32 => 96,
            ThunkWidth::U64 => 112,
        }
    }
}

pub(crate) fn read<T: Pod>(image: &[u8], rva: usize) -> Result<T, ImageError> {
    let len = size_of::<T>();
    let bytes = rva
        .checked_add(len)
        .and_then(|end| image.get(rva..end))
        .ok_or(ImageError::OutOfBounds { rva, len })?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

pub(crate) fn read_thunk(image: &[u8], rva: usize, width: ThunkWidth) -> Result<u64, ImageError> {
    match width {
        ThunkWidth::U32 => read::<u32>(image, rva).map(u64::from),
        ThunkWidth::U64 => read::<u64>(image, rva),
    }
}

/// Null-terminated string at `rva`, without the terminator.
pub(crate) fn cstr_at(image: &[u8], rva: usize) -> Result<&[u8], ImageError> {
    let tail = image.get(rva..).ok_or(ImageError::OutOfBounds { rva, len: 1 })?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ImageError::OutOfBounds { rva, len: tail.len() + 1 })?;
    Ok(&tail[..len])
}

/// The parts of the DOS/NT headers the import walk depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headers {
    pub nt_offset: usize,
    pub width: ThunkWidth,
    pub size_of_image: u32,
    pub import_directory: DataDirectory,
}

fn nt_offset(image: &[u8]) -> Result<usize, ImageError> {
    let dos: DosHeader = read(image, 0).map_err(|_| ImageError::BadDosSignature)?;
    if dos.e_magic != DOS_MAGIC {
        return Err(ImageError::BadDosSignature);
    }
    let nt_offset = dos.e_lfanew as usize;
    if nt_offset > MAX_NT_OFFSET {
        return Err(ImageError::BadNtSignature(nt_offset));
    }
    Ok(nt_offset)
}

fn nt_prefix(image: &[u8], nt_offset: usize) -> Result<(ThunkWidth, u32), ImageError> {
    let signature: u32 =
        read(image, nt_offset).map_err(|_| ImageError::BadNtSignature(nt_offset))?;
    if signature != NT_SIGNATURE {
        return Err(ImageError::BadNtSignature(nt_offset));
    }
    let optional = nt_offset + OPTIONAL_HEADER_OFFSET;
    let width = match read::<u16>(image, optional)? {
        PE32_MAGIC => ThunkWidth::U32,
        PE32_PLUS_MAGIC => ThunkWidth::U64,
        other => return Err(ImageError::UnknownMagic(other)),
    };
    let size_of_image: u32 = read(image, optional + SIZE_OF_IMAGE_OFFSET)?;
    Ok((width, size_of_image))
}

impl Headers {
    pub fn parse(image: &[u8]) -> Result<Self, ImageError> {
        let nt_offset = nt_offset(image)?;
        let (width, size_of_image) = nt_prefix(image, nt_offset)?;
        let optional = nt_offset + OPTIONAL_HEADER_OFFSET;

        let file_header: FileHeader = read(image, nt_offset + 4)?;
        let directories = optional + width.data_directory_offset();
        let count: u32 = read(image, directories - 4)?;
        let within_optional_header = width.data_directory_offset()
            + (IMPORT_DIRECTORY_INDEX as usize + 1) * size_of::<DataDirectory>()
            <= file_header.size_of_optional_header as usize;

        let import_directory = if count > IMPORT_DIRECTORY_INDEX && within_optional_header {
            read(
                image,
                directories + IMPORT_DIRECTORY_INDEX as usize * size_of::<DataDirectory>(),
            )?
        } else {
            DataDirectory::default()
        };

        Ok(Self {
            nt_offset,
            width,
            size_of_image,
            import_directory,
        })
    }
}

/// Reads `SizeOfImage` from the headers of an image mapped at `base`.
///
/// # Safety
/// `base` must point to readable memory that either holds an image's headers or
/// is at least as large as the headers would claim to be.
pub unsafe fn mapped_len(base: *const u8) -> Result<usize, ImageError> {
    let dos = unsafe { slice::from_raw_parts(base, size_of::<DosHeader>()) };
    let nt_offset = nt_offset(dos)?;
    let probe_len = nt_offset + OPTIONAL_HEADER_OFFSET + SIZE_OF_IMAGE_OFFSET + 4;
    let probe = unsafe { slice::from_raw_parts(base, probe_len) };
    let (_, size_of_image) = nt_prefix(probe, nt_offset)?;
    Ok(size_of_image as usize)
}
