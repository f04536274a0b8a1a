//! Writes minimal PE images that carry nothing but headers and an import
//! table, laid out the way the loader leaves them in memory.

use std::mem::size_of;

use bytemuck::{Pod, bytes_of};

use crate::header::{
    DOS_MAGIC, DataDirectory, FileHeader, NT_SIGNATURE, OPTIONAL_HEADER_OFFSET, PE32_MAGIC,
    PE32_PLUS_MAGIC, RawImportDescriptor, SIZE_OF_IMAGE_OFFSET, ThunkWidth,
};

const NT_OFFSET: usize = 0x80;
const IMPORTS_START: usize = 0x400;
const PAGE: usize = 0x1000;
const DIRECTORY_COUNT: u32 = 16;

enum Entry {
    Name(String, u64),
    Ordinal(u16, u64),
}

struct Module {
    name: String,
    entries: Vec<Entry>,
    with_name_table: bool,
}

pub struct ImageBuilder {
    width: ThunkWidth,
    modules: Vec<Module>,
    import_directory: bool,
}

/// A built image plus the rva of every address slot, indexed by
/// `[descriptor][entry]` in insertion order.
pub struct BuiltImage {
    pub bytes: Vec<u8>,
    pub slots: Vec<Vec<u32>>,
}

impl BuiltImage {
    pub fn slot_value(&self, descriptor: usize, entry: usize, width: ThunkWidth) -> u64 {
        let rva = self.slots[descriptor][entry] as usize;
        let mut raw = [0u8; 8];
        raw[..width.size()].copy_from_slice(&self.bytes[rva..rva + width.size()]);
        u64::from_le_bytes(raw)
    }
}

fn put<T: Pod>(bytes: &mut [u8], offset: usize, value: T) {
    let raw = bytes_of(&value);
    bytes[offset..offset + raw.len()].copy_from_slice(raw);
}

fn put_thunk(bytes: &mut [u8], offset: usize, width: ThunkWidth, value: u64) {
    match width {
        ThunkWidth::U32 => put(bytes, offset, value as u32),
        ThunkWidth::U64 => put(bytes, offset, value),
    }
}

fn align(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

impl ImageBuilder {
    pub fn new(width: ThunkWidth) -> Self {
        Self {
            width,
            modules: Vec::new(),
            import_directory: true,
        }
    }

    /// An image whose thunks match the running process.
    pub fn native() -> Self {
        Self::new(ThunkWidth::native())
    }

    /// Starts a new import descriptor.
    pub fn module(mut self, name: &str) -> Self {
        self.modules.push(Module {
            name: name.to_owned(),
            entries: Vec::new(),
            with_name_table: true,
        });
        self
    }

    /// Drops the name table (OriginalFirstThunk = 0) of the current descriptor.
    pub fn bound_only(mut self) -> Self {
        self.current().with_name_table = false;
        self
    }

    pub fn import(mut self, symbol: &str, address: u64) -> Self {
        self.current().entries.push(Entry::Name(symbol.to_owned(), address));
        self
    }

    pub fn import_ordinal(mut self, ordinal: u16, address: u64) -> Self {
        self.current().entries.push(Entry::Ordinal(ordinal, address));
        self
    }

    pub fn without_import_directory(mut self) -> Self {
        self.import_directory = false;
        self
    }

    fn current(&mut self) -> &mut Module {
        self.modules
            .last_mut()
            .expect("call ImageBuilder::module before adding imports")
    }

    pub fn build(&self) -> BuiltImage {
        let width = self.width;
        let step = width.size();
        let descriptors_len = (self.modules.len() + 1) * size_of::<RawImportDescriptor>();

        // Lay out thunk arrays first, then the strings they point at.
        let mut cursor = align(IMPORTS_START + descriptors_len, 8);
        let mut tables = Vec::new();
        for module in &self.modules {
            let array_len = (module.entries.len() + 1) * step;
            let names = cursor;
            let addresses = cursor + array_len;
            cursor = addresses + array_len;
            tables.push((names, addresses));
        }
        let mut strings = Vec::new();
        for module in &self.modules {
            let mut entry_names = Vec::new();
            for entry in &module.entries {
                match entry {
                    Entry::Name(name, _) => {
                        cursor = align(cursor, 2);
                        entry_names.push(Some(cursor));
                        cursor += 2 + name.len() + 1;
                    }
                    Entry::Ordinal(..) => entry_names.push(None),
                }
            }
            let module_name = cursor;
            cursor += module.name.len() + 1;
            strings.push((module_name, entry_names));
        }
        let size_of_image = align(cursor, PAGE);

        let mut bytes = vec![0u8; size_of_image];
        write_headers(&mut bytes, width, size_of_image, self.import_directory.then(|| {
            DataDirectory {
                virtual_address: IMPORTS_START as u32,
                size: descriptors_len as u32,
            }
        }));

        let mut slots = Vec::new();
        for (index, module) in self.modules.iter().enumerate() {
            let (names, addresses) = tables[index];
            let (module_name, entry_names) = &strings[index];

            put(
                &mut bytes,
                IMPORTS_START + index * size_of::<RawImportDescriptor>(),
                RawImportDescriptor {
                    original_first_thunk: if module.with_name_table { names as u32 } else { 0 },
                    time_date_stamp: 0,
                    forwarder_chain: 0,
                    name: *module_name as u32,
                    first_thunk: addresses as u32,
                },
            );
            bytes[*module_name..*module_name + module.name.len()]
                .copy_from_slice(module.name.as_bytes());

            let mut module_slots = Vec::new();
            for (i, entry) in module.entries.iter().enumerate() {
                let (name_thunk, address) = match (entry, entry_names[i]) {
                    (Entry::Name(name, address), Some(by_name)) => {
                        put(&mut bytes, by_name, i as u16);
                        bytes[by_name + 2..by_name + 2 + name.len()]
                            .copy_from_slice(name.as_bytes());
                        (by_name as u64, *address)
                    }
                    (Entry::Ordinal(ordinal, address), _) => {
                        (width.ordinal_flag() | u64::from(*ordinal), *address)
                    }
                    (Entry::Name(..), None) => unreachable!(),
                };
                if module.with_name_table {
                    put_thunk(&mut bytes, names + i * step, width, name_thunk);
                }
                put_thunk(&mut bytes, addresses + i * step, width, address);
                module_slots.push((addresses + i * step) as u32);
            }
            slots.push(module_slots);
        }

        BuiltImage { bytes, slots }
    }
}

fn write_headers(
    bytes: &mut [u8],
    width: ThunkWidth,
    size_of_image: usize,
    imports: Option<DataDirectory>,
) {
    put(bytes, 0, DOS_MAGIC);
    put(bytes, 0x3C, NT_OFFSET as u32);
    put(bytes, NT_OFFSET, NT_SIGNATURE);

    let (machine, magic, optional_len, directories) = match width {
        ThunkWidth::U32 => (0x014Cu16, PE32_MAGIC, 224u16, 96usize),
        ThunkWidth::U64 => (0x8664u16, PE32_PLUS_MAGIC, 240u16, 112usize),
    };
    put(
        bytes,
        NT_OFFSET + 4,
        FileHeader {
            machine,
            number_of_sections: 0,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: optional_len,
            characteristics: 0x2022,
        },
    );

    let optional = NT_OFFSET + OPTIONAL_HEADER_OFFSET;
    put(bytes, optional, magic);
    put(bytes, optional + SIZE_OF_IMAGE_OFFSET, size_of_image as u32);
    put(bytes, optional + SIZE_OF_IMAGE_OFFSET + 4, IMPORTS_START as u32);
    put(bytes, optional + directories - 4, DIRECTORY_COUNT);
    if let Some(imports) = imports {
        put(bytes, optional + directories + size_of::<DataDirectory>(), imports);
    }
}
