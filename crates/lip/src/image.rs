//! Position-independent function images.
//!
//! A function image is one contiguous byte buffer holding a header, the
//! source-name record, import and constant pools, nested-function offsets,
//! instructions, a location table, interned strings and, recursively, the
//! images of nested functions. All cross-references are byte offsets, so an
//! image can be copied, written to disk and read back as a single blob.
//!
//! Layout, in order (each block aligned per [`layout`]):
//!
//! ```text
//! header            : size u32, then six u16 counts
//! source name       : string record (u32 length + bytes)
//! imports           : num_imports x { name_offset u32, value ImageValue }
//! constants         : num_constants x ImageValue
//! fn offsets        : num_functions x u32 (relative to this function)
//! instructions      : num_instructions x u32
//! locations         : (num_instructions + 1) x LocRange, [0] = whole function
//! interned strings  : string records referenced by offset
//! nested functions  : complete images, recursively
//! ```
//!
//! String and symbol constants store the byte offset of their string record
//! relative to the owning function's start. Import slots are serialized as
//! placeholders; resolution happens in a per-script link table and never
//! mutates the image.

use crate::loc::{Loc, LocRange};
use crate::memblock::{MemBlock, pack};

/// Size of the fixed header in bytes.
pub(crate) const HEADER_SIZE: usize = 16;
/// Size of one serialized value in bytes.
pub(crate) const IMAGE_VALUE_SIZE: usize = 16;
/// Size of one import record in bytes.
pub(crate) const IMPORT_SIZE: usize = 24;
/// Size of one serialized location range in bytes.
pub(crate) const LOC_RANGE_SIZE: usize = 16;

/// Bit of the `num_args` field marking a vararg function.
const VARARG_BIT: u16 = 0x8000;

/// A value as it is stored inside an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ImageValue {
    /// Serialized import slot awaiting resolution.
    Placeholder,
    /// Numeric constant.
    Number(f64),
    /// String constant; offset of its record, relative to the function.
    Str(u32),
    /// Symbol constant; offset of its record, relative to the function.
    Sym(u32),
}

impl ImageValue {
    pub(crate) fn write(self, out: &mut [u8]) {
        out[..IMAGE_VALUE_SIZE].fill(0);
        match self {
            Self::Placeholder => out[0] = 7,
            Self::Number(value) => {
                out[0] = 1;
                out[8..16].copy_from_slice(&value.to_bits().to_le_bytes());
            }
            Self::Str(offset) => {
                out[0] = 3;
                out[8..16].copy_from_slice(&u64::from(offset).to_le_bytes());
            }
            Self::Sym(offset) => {
                out[0] = 4;
                out[8..16].copy_from_slice(&u64::from(offset).to_le_bytes());
            }
        }
    }

    pub(crate) fn read(bytes: &[u8]) -> Option<Self> {
        let payload = u64::from_le_bytes(bytes.get(8..16)?.try_into().ok()?);
        match bytes.first()? {
            7 => Some(Self::Placeholder),
            1 => Some(Self::Number(f64::from_bits(payload))),
            3 => Some(Self::Str(u32::try_from(payload).ok()?)),
            4 => Some(Self::Sym(u32::try_from(payload).ok()?)),
            _ => None,
        }
    }
}

/// Decoded header counts of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FnHeader {
    /// Total byte size of the function, nested functions included.
    pub size: u32,
    /// Declared parameter count (vararg bit stripped).
    pub num_args: u16,
    /// Whether the last parameter is a vararg.
    pub is_vararg: bool,
    /// Local slot count.
    pub num_locals: u16,
    /// Import pool size.
    pub num_imports: u16,
    /// Constant pool size.
    pub num_constants: u16,
    /// Instruction count.
    pub num_instructions: u16,
    /// Nested function count.
    pub num_functions: u16,
}

impl FnHeader {
    pub(crate) fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        let args = self.num_args | if self.is_vararg { VARARG_BIT } else { 0 };
        out[4..6].copy_from_slice(&args.to_le_bytes());
        out[6..8].copy_from_slice(&self.num_locals.to_le_bytes());
        out[8..10].copy_from_slice(&self.num_imports.to_le_bytes());
        out[10..12].copy_from_slice(&self.num_constants.to_le_bytes());
        out[12..14].copy_from_slice(&self.num_instructions.to_le_bytes());
        out[14..16].copy_from_slice(&self.num_functions.to_le_bytes());
    }

    pub(crate) fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let args = u16_at(4);
        Some(Self {
            size: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            num_args: args & !VARARG_BIT,
            is_vararg: args & VARARG_BIT != 0,
            num_locals: u16_at(6),
            num_imports: u16_at(8),
            num_constants: u16_at(10),
            num_instructions: u16_at(12),
            num_functions: u16_at(14),
        })
    }
}

/// Byte offsets of one function's fixed blocks, relative to the function.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FnLayout {
    pub source_name: usize,
    pub imports: usize,
    pub constants: usize,
    pub fn_offsets: usize,
    pub instructions: usize,
    pub locations: usize,
    /// End of the location table; interned strings start at or after this.
    pub fixed_end: usize,
}

/// Computes the fixed-block layout from the header counts and the source
/// name length. Both the writer and the readers use this.
pub(crate) fn layout(header: &FnHeader, source_name_len: usize) -> FnLayout {
    let mut blocks = [
        MemBlock::new(HEADER_SIZE, 1, 4),
        MemBlock::new(4 + source_name_len, 1, 4),
        MemBlock::new(IMPORT_SIZE, header.num_imports as usize, 8),
        MemBlock::new(IMAGE_VALUE_SIZE, header.num_constants as usize, 8),
        MemBlock::new(4, header.num_functions as usize, 4),
        MemBlock::new(4, header.num_instructions as usize, 4),
        MemBlock::new(LOC_RANGE_SIZE, header.num_instructions as usize + 1, 4),
    ];
    let info = pack(&mut blocks);
    FnLayout {
        source_name: blocks[1].offset,
        imports: blocks[2].offset,
        constants: blocks[3].offset,
        fn_offsets: blocks[4].offset,
        instructions: blocks[5].offset,
        locations: blocks[6].offset,
        fixed_end: info.total_size,
    }
}

pub(crate) fn write_loc_range(range: LocRange, out: &mut [u8]) {
    out[0..4].copy_from_slice(&range.start.line.to_le_bytes());
    out[4..8].copy_from_slice(&range.start.column.to_le_bytes());
    out[8..12].copy_from_slice(&range.end.line.to_le_bytes());
    out[12..16].copy_from_slice(&range.end.column.to_le_bytes());
}

fn read_loc_range(bytes: &[u8]) -> LocRange {
    let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
    LocRange::new(
        Loc::new(u32_at(0), u32_at(4)),
        Loc::new(u32_at(8), u32_at(12)),
    )
}

/// An immutable, freestanding function image.
#[derive(Debug, PartialEq, Eq)]
pub struct FunctionImage {
    bytes: Box<[u8]>,
}

impl FunctionImage {
    /// Wraps and validates an image buffer.
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Result<Self, String> {
        let image = Self {
            bytes: bytes.into_boxed_slice(),
        };
        image.validate_function(0)?;
        Ok(image)
    }

    /// Total size in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        u32::try_from(self.bytes.len()).unwrap_or(u32::MAX)
    }

    /// The raw image bytes, suitable for dumping.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn header(&self, fn_offset: u32) -> FnHeader {
        FnHeader::read(&self.bytes[fn_offset as usize..]).unwrap_or(FnHeader {
            size: 0,
            num_args: 0,
            is_vararg: false,
            num_locals: 0,
            num_imports: 0,
            num_constants: 0,
            num_instructions: 0,
            num_functions: 0,
        })
    }

    pub(crate) fn layout(&self, fn_offset: u32) -> FnLayout {
        let header = self.header(fn_offset);
        let name_len = self.string_len(fn_offset as usize + layout(&header, 0).source_name);
        layout(&header, name_len)
    }

    fn string_len(&self, abs_offset: usize) -> usize {
        self.bytes
            .get(abs_offset..abs_offset + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .unwrap_or(0)
    }

    /// Reads the string record at an absolute byte offset.
    pub(crate) fn string_at(&self, abs_offset: usize) -> Option<&[u8]> {
        let len = self
            .bytes
            .get(abs_offset..abs_offset + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)?;
        self.bytes.get(abs_offset + 4..abs_offset + 4 + len)
    }

    /// The function's source name.
    pub(crate) fn source_name(&self, fn_offset: u32) -> String {
        let layout = self.layout(fn_offset);
        self.string_at(fn_offset as usize + layout.source_name)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    /// Instruction `index` of the function, if in range.
    pub(crate) fn instruction(&self, fn_offset: u32, index: usize) -> Option<u32> {
        let header = self.header(fn_offset);
        if index >= header.num_instructions as usize {
            return None;
        }
        let base = fn_offset as usize + self.layout(fn_offset).instructions + index * 4;
        let b = self.bytes.get(base..base + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Location entry `index`; entry 0 is the whole-function range and entry
    /// `i + 1` belongs to instruction `i`.
    pub(crate) fn location(&self, fn_offset: u32, index: usize) -> LocRange {
        let header = self.header(fn_offset);
        let index = index.min(header.num_instructions as usize);
        let base = fn_offset as usize + self.layout(fn_offset).locations + index * LOC_RANGE_SIZE;
        match self.bytes.get(base..base + LOC_RANGE_SIZE) {
            Some(bytes) => read_loc_range(bytes),
            None => crate::loc::NOWHERE,
        }
    }

    /// Constant `k` of the function.
    pub(crate) fn constant(&self, fn_offset: u32, index: usize) -> Option<ImageValue> {
        let header = self.header(fn_offset);
        if index >= header.num_constants as usize {
            return None;
        }
        let base = fn_offset as usize + self.layout(fn_offset).constants + index * IMAGE_VALUE_SIZE;
        ImageValue::read(self.bytes.get(base..base + IMAGE_VALUE_SIZE)?)
    }

    /// Name of import `i` of the function.
    pub(crate) fn import_name(&self, fn_offset: u32, index: usize) -> Option<String> {
        let header = self.header(fn_offset);
        if index >= header.num_imports as usize {
            return None;
        }
        let base = fn_offset as usize + self.layout(fn_offset).imports + index * IMPORT_SIZE;
        let b = self.bytes.get(base..base + 4)?;
        let name_offset = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize;
        self.string_at(fn_offset as usize + name_offset)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Absolute offset of nested function `i`.
    pub(crate) fn nested_offset(&self, fn_offset: u32, index: usize) -> Option<u32> {
        let header = self.header(fn_offset);
        if index >= header.num_functions as usize {
            return None;
        }
        let base = fn_offset as usize + self.layout(fn_offset).fn_offsets + index * 4;
        let b = self.bytes.get(base..base + 4)?;
        Some(fn_offset + u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Offsets of every function in the image, root first, depth first.
    pub(crate) fn all_function_offsets(&self) -> Vec<u32> {
        let mut offsets = vec![0];
        let mut index = 0;
        while index < offsets.len() {
            let offset = offsets[index];
            let header = self.header(offset);
            for i in 0..header.num_functions as usize {
                if let Some(nested) = self.nested_offset(offset, i) {
                    offsets.push(nested);
                }
            }
            index += 1;
        }
        offsets
    }

    fn validate_function(&self, fn_offset: u32) -> Result<(), String> {
        let start = fn_offset as usize;
        let Some(header) = FnHeader::read(self.bytes.get(start..).unwrap_or(&[])) else {
            return Err("Malformed bytecode".to_owned());
        };
        let end = start + header.size as usize;
        if header.size as usize <= HEADER_SIZE || end > self.bytes.len() {
            return Err("Malformed bytecode".to_owned());
        }
        let layout = self.layout(fn_offset);
        if start + layout.fixed_end > end {
            return Err("Malformed bytecode".to_owned());
        }
        for i in 0..header.num_functions as usize {
            let nested = self
                .nested_offset(fn_offset, i)
                .ok_or_else(|| "Malformed bytecode".to_owned())?;
            if nested as usize <= start || nested as usize >= end {
                return Err("Malformed bytecode".to_owned());
            }
            self.validate_function(nested)?;
        }
        Ok(())
    }
}
