use std::mem::size_of;

use crate::header::{
    Headers, ImageError, RawImportDescriptor, ThunkWidth, cstr_at, read, read_thunk,
};

/// An import address slot: where the loader stored the resolved address of one
/// imported symbol, and what it currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSlot {
    pub rva: u32,
    pub width: ThunkWidth,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportName<'a> {
    Name(&'a [u8]),
    Ordinal(u16),
}

#[derive(Debug, Clone, Copy)]
pub struct ImportThunk<'a> {
    pub name: ImportName<'a>,
    pub slot: ImportSlot,
}

pub struct ImportTable<'a> {
    image: &'a [u8],
    headers: Headers,
}

impl<'a> ImportTable<'a> {
    pub fn parse(image: &'a [u8]) -> Result<Self, ImageError> {
        let headers = Headers::parse(image)?;
        let directory = headers.import_directory;
        if directory.virtual_address == 0 || directory.size == 0 {
            return Err(ImageError::NoImportDirectory);
        }
        Ok(Self { image, headers })
    }

    pub fn width(&self) -> ThunkWidth {
        self.headers.width
    }

    /// Import descriptors in table order, up to the zero-name terminator.
    pub fn descriptors(&self) -> Descriptors<'a> {
        Descriptors {
            image: self.image,
            width: self.headers.width,
            next_rva: Some(self.headers.import_directory.virtual_address as usize),
        }
    }

    /// Finds the address slot of `symbol` imported from `module`.
    ///
    /// Module names compare ASCII case-insensitively, symbol names exactly. The
    /// first match in table order wins, and a matching module that lacks the
    /// symbol does not end the search.
    pub fn locate(&self, module: &str, symbol: &str) -> Result<ImportSlot, ImageError> {
        let mut module_seen = false;
        for descriptor in self.descriptors() {
            let descriptor = descriptor?;
            if !descriptor.name().eq_ignore_ascii_case(module.as_bytes()) {
                continue;
            }
            module_seen = true;
            for thunk in descriptor.thunks() {
                let thunk = thunk?;
                match thunk.name {
                    ImportName::Name(name) if name == symbol.as_bytes() => {
                        return Ok(thunk.slot);
                    }
                    _ => {}
                }
            }
        }
        if module_seen {
            Err(ImageError::SymbolNotImported {
                module: module.to_owned(),
                symbol: symbol.to_owned(),
            })
        } else {
            Err(ImageError::ModuleNotImported(module.to_owned()))
        }
    }
}

pub struct ImportDescriptor<'a> {
    image: &'a [u8],
    width: ThunkWidth,
    name: &'a [u8],
    raw: RawImportDescriptor,
}

impl<'a> ImportDescriptor<'a> {
    pub fn name(&self) -> &'a [u8] {
        self.name
    }

    /// Walks the name thunks and the address thunks side by side. Descriptors
    /// without a name table yield nothing: their address thunks are already
    /// overwritten by the loader and carry no names.
    pub fn thunks(&self) -> Thunks<'a> {
        let next = if self.raw.original_first_thunk == 0 {
            None
        } else {
            Some((
                self.raw.original_first_thunk as usize,
                self.raw.first_thunk as usize,
            ))
        };
        Thunks {
            image: self.image,
            width: self.width,
            next,
        }
    }
}

pub struct Descriptors<'a> {
    image: &'a [u8],
    width: ThunkWidth,
    next_rva: Option<usize>,
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = Result<ImportDescriptor<'a>, ImageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rva = self.next_rva.take()?;
        let raw: RawImportDescriptor = match read(self.image, rva) {
            Ok(raw) => raw,
            Err(err) => return Some(Err(err)),
        };
        if raw.name == 0 {
            return None;
        }
        let name = match cstr_at(self.image, raw.name as usize) {
            Ok(name) => name,
            Err(err) => return Some(Err(err)),
        };
        self.next_rva = Some(rva + size_of::<RawImportDescriptor>());
        Some(Ok(ImportDescriptor {
            image: self.image,
            width: self.width,
            name,
            raw,
        }))
    }
}

pub struct Thunks<'a> {
    image: &'a [u8],
    width: ThunkWidth,
    // (name thunk rva, address thunk rva)
    next: Option<(usize, usize)>,
}

impl<'a> Thunks<'a> {
    fn thunk_at(&self, name_rva: usize, slot_rva: usize) -> Result<Option<ImportThunk<'a>>, ImageError> {
        let value = read_thunk(self.image, slot_rva, self.width)?;
        let name_thunk = read_thunk(self.image, name_rva, self.width)?;
        if value == 0 || name_thunk == 0 {
            return Ok(None);
        }
        let name = if name_thunk & self.width.ordinal_flag() != 0 {
            ImportName::Ordinal(name_thunk as u16)
        } else {
            // IMAGE_IMPORT_BY_NAME: u16 hint, then the name
            let by_name = usize::try_from(name_thunk)
                .map_err(|_| ImageError::OutOfBounds { rva: usize::MAX, len: 2 })?;
            ImportName::Name(cstr_at(self.image, by_name + 2)?)
        };
        let rva = u32::try_from(slot_rva)
            .map_err(|_| ImageError::OutOfBounds { rva: slot_rva, len: self.width.size() })?;
        Ok(Some(ImportThunk {
            name,
            slot: ImportSlot {
                rva,
                width: self.width,
                value,
            },
        }))
    }
}

impl<'a> Iterator for Thunks<'a> {
    type Item = Result<ImportThunk<'a>, ImageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (name_rva, slot_rva) = self.next.take()?;
        match self.thunk_at(name_rva, slot_rva) {
            Ok(Some(thunk)) => {
                let step = self.width.size();
                self.next = Some((name_rva + step, slot_rva + step));
                Some(Ok(thunk))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
