//! Assembler: mutable instruction buffer to immutable function image.
//!
//! Collects tagged instructions, labels, jump sites and the constant,
//! import and string pools, then [`Assembler::end`] runs the optimization
//! passes in order — dead-load elimination, jump-to-return folding,
//! primitive-op inlining, tail-call rewriting, label resolution — and packs
//! everything into a [`FunctionImage`].

use ahash::AHashMap;

use crate::arena::{Arena, ArenaRef};
use crate::image::{
    FnHeader, HEADER_SIZE, IMAGE_VALUE_SIZE, IMPORT_SIZE, ImageValue, LOC_RANGE_SIZE,
    FunctionImage, write_loc_range,
};
use crate::loc::LocRange;
use crate::memblock::{MemBlock, pack};
use crate::op::{OP_LABEL, Opcode, decode_raw, encode, encode_raw};

/// Identifier of an assembler label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LabelId(pub u32);

/// Symbols that pass 3 rewrites into dedicated opcodes.
const PRIM_OPS: &[(&str, Opcode)] = &[
    ("+", Opcode::Add),
    ("-", Opcode::Sub),
    ("*", Opcode::Mul),
    ("/", Opcode::Fdiv),
    ("!", Opcode::Not),
    ("cmp", Opcode::Cmp),
    ("==", Opcode::Eq),
    ("!=", Opcode::Neq),
    (">", Opcode::Gt),
    ("<", Opcode::Lt),
    (">=", Opcode::Gte),
    ("<=", Opcode::Lte),
];

#[derive(Debug, Clone, Copy)]
struct TaggedInstr {
    instruction: u32,
    location: LocRange,
}

#[derive(Debug, Clone, Copy)]
enum AsmConstant {
    Number(f64),
    Str(u32),
    Sym(u32),
}

/// Accumulates one function's instructions and pools.
pub(crate) struct Assembler {
    source_name: String,
    location: LocRange,
    instructions: Vec<TaggedInstr>,
    num_labels: u32,
    nested: Vec<(ArenaRef, u32)>,
    imports: Vec<u32>,
    constants: Vec<AsmConstant>,
    string_pool: Vec<String>,
    string_index: AHashMap<String, u32>,
}

impl Assembler {
    /// Starts assembling a function covering `location` of `source_name`.
    pub fn new(source_name: impl Into<String>, location: LocRange) -> Self {
        Self {
            source_name: source_name.into(),
            location,
            instructions: Vec::new(),
            num_labels: 0,
            nested: Vec::new(),
            imports: Vec::new(),
            constants: Vec::new(),
            string_pool: Vec::new(),
            string_index: AHashMap::new(),
        }
    }

    /// Appends an instruction.
    pub fn add(&mut self, opcode: Opcode, operand: i32, location: LocRange) {
        self.instructions.push(TaggedInstr {
            instruction: encode(opcode, operand),
            location,
        });
    }

    /// Allocates a fresh label id.
    pub fn new_label(&mut self) -> LabelId {
        let id = self.num_labels;
        self.num_labels += 1;
        LabelId(id)
    }

    /// Appends a label pseudo-instruction.
    pub fn add_label(&mut self, label: LabelId, location: LocRange) {
        self.instructions.push(TaggedInstr {
            instruction: encode_raw(OP_LABEL, label.0.cast_signed()),
            location,
        });
    }

    /// Registers a nested function image; its bytes live in the compile
    /// arena until `end` copies them into the parent image.
    pub fn new_function(&mut self, image: &FunctionImage, arena: &mut Arena) -> u32 {
        let handle = arena.alloc_bytes(image.as_bytes());
        let index = self.nested.len();
        self.nested.push((handle, image.size()));
        u32::try_from(index).expect("nested function count exceeds u32")
    }

    /// Interns a string in the pool, returning its pool index.
    fn alloc_string(&mut self, string: &str) -> u32 {
        if let Some(&index) = self.string_index.get(string) {
            return index;
        }
        let index = u32::try_from(self.string_pool.len()).expect("string pool exceeds u32");
        self.string_pool.push(string.to_owned());
        self.string_index.insert(string.to_owned(), index);
        index
    }

    /// Allocates (or reuses) an import slot for `name`.
    pub fn alloc_import(&mut self, name: &str) -> u32 {
        let string = self.alloc_string(name);
        for (index, &existing) in self.imports.iter().enumerate() {
            if existing == string {
                return u32::try_from(index).expect("import pool exceeds u32");
            }
        }
        let index = u32::try_from(self.imports.len()).expect("import pool exceeds u32");
        self.imports.push(string);
        index
    }

    /// Allocates (or reuses) a numeric constant.
    pub fn alloc_numeric_constant(&mut self, number: f64) -> u32 {
        for (index, constant) in self.constants.iter().enumerate() {
            if let AsmConstant::Number(existing) = constant
                && existing.to_bits() == number.to_bits()
            {
                return u32::try_from(index).expect("constant pool exceeds u32");
            }
        }
        let index = u32::try_from(self.constants.len()).expect("constant pool exceeds u32");
        self.constants.push(AsmConstant::Number(number));
        index
    }

    /// Allocates (or reuses) a string constant.
    pub fn alloc_string_constant(&mut self, string: &str) -> u32 {
        self.alloc_string_typed(string, false)
    }

    /// Allocates (or reuses) a symbol constant.
    pub fn alloc_symbol(&mut self, symbol: &str) -> u32 {
        self.alloc_string_typed(symbol, true)
    }

    fn alloc_string_typed(&mut self, string: &str, symbol: bool) -> u32 {
        let pool_index = self.alloc_string(string);
        for (index, constant) in self.constants.iter().enumerate() {
            let matches = match constant {
                AsmConstant::Str(existing) => !symbol && *existing == pool_index,
                AsmConstant::Sym(existing) => symbol && *existing == pool_index,
                AsmConstant::Number(_) => false,
            };
            if matches {
                return u32::try_from(index).expect("constant pool exceeds u32");
            }
        }
        let index = u32::try_from(self.constants.len()).expect("constant pool exceeds u32");
        self.constants.push(if symbol {
            AsmConstant::Sym(pool_index)
        } else {
            AsmConstant::Str(pool_index)
        });
        index
    }

    /// Runs the optimization passes and packs the image.
    pub fn end(
        mut self,
        num_args: u16,
        is_vararg: bool,
        num_locals: u16,
        arena: &Arena,
    ) -> FunctionImage {
        self.eliminate_dead_loads();
        self.fold_jump_to_return();
        self.inline_prim_ops();
        self.rewrite_tail_calls();
        self.resolve_labels();
        self.pack_image(num_args, is_vararg, num_locals, arena)
    }

    /// Pass 1: drop `[NIL; POP 1]` pairs, except when the `POP 1` is within
    /// the last two instructions — the trailing pop may be needed for the
    /// program's final result.
    fn eliminate_dead_loads(&mut self) {
        let n = self.instructions.len();
        let mut out = Vec::with_capacity(n);
        let mut i = 0;
        while i < n {
            if i + 2 < n {
                let (op1, _) = decode_raw(self.instructions[i].instruction);
                let (op2, operand2) = decode_raw(self.instructions[i + 1].instruction);
                if op1 == Opcode::Nil as u8 && op2 == Opcode::Pop as u8 && operand2 == 1 {
                    i += 2;
                    continue;
                }
            }
            out.push(self.instructions[i]);
            i += 1;
        }
        self.instructions = out;
    }

    /// Pass 2: a `JMP` to a label that is immediately followed by `RET`
    /// becomes `RET` directly.
    fn fold_jump_to_return(&mut self) {
        let n = self.instructions.len();
        for i in 0..n {
            let (opcode, operand) = decode_raw(self.instructions[i].instruction);
            if opcode != Opcode::Jmp as u8 {
                continue;
            }
            let label = encode_raw(OP_LABEL, operand);
            for j in 0..n {
                if self.instructions[j].instruction == label && j + 1 < n {
                    let (target, _) = decode_raw(self.instructions[j + 1].instruction);
                    if target == Opcode::Ret as u8 {
                        self.instructions[i].instruction = encode(Opcode::Ret, 0);
                    }
                }
            }
        }
    }

    /// Pass 3: `[IMP op; CALL n]` where `op` names a primitive becomes the
    /// corresponding arithmetic/comparison opcode with operand `n`.
    fn inline_prim_ops(&mut self) {
        let n = self.instructions.len();
        let mut out = Vec::with_capacity(n);
        let mut i = 0;
        while i < n {
            if i + 1 < n {
                let (op1, operand1) = decode_raw(self.instructions[i].instruction);
                let (op2, operand2) = decode_raw(self.instructions[i + 1].instruction);
                if op1 == Opcode::Imp as u8 && op2 == Opcode::Call as u8 {
                    let pool_index = self.imports[operand1.cast_unsigned() as usize];
                    let symbol = self.string_pool[pool_index as usize].as_str();
                    if let Some((_, opcode)) = PRIM_OPS.iter().find(|(name, _)| *name == symbol) {
                        out.push(TaggedInstr {
                            instruction: encode(*opcode, operand2),
                            location: self.instructions[i].location,
                        });
                        i += 2;
                        continue;
                    }
                }
            }
            out.push(self.instructions[i]);
            i += 1;
        }
        self.instructions = out;
    }

    /// Pass 4: `[CALL n; LABEL l; RET]` keeps its label but calls with
    /// `TAIL`; then `[CALL n; RET]` collapses into a lone `TAIL n`.
    fn rewrite_tail_calls(&mut self) {
        let n = self.instructions.len();
        for i in 0..n {
            if i + 2 < n {
                let (op1, operand1) = decode_raw(self.instructions[i].instruction);
                let (op2, _) = decode_raw(self.instructions[i + 1].instruction);
                let (op3, _) = decode_raw(self.instructions[i + 2].instruction);
                if op1 == Opcode::Call as u8 && op2 == OP_LABEL && op3 == Opcode::Ret as u8 {
                    self.instructions[i].instruction = encode(Opcode::Tail, operand1);
                }
            }
        }

        let mut out = Vec::with_capacity(n);
        let mut i = 0;
        while i < n {
            let mut instr = self.instructions[i];
            if i + 1 < n {
                let (op1, operand1) = decode_raw(instr.instruction);
                let (op2, _) = decode_raw(self.instructions[i + 1].instruction);
                if op1 == Opcode::Call as u8 && op2 == Opcode::Ret as u8 {
                    instr.instruction = encode(Opcode::Tail, operand1);
                    i += 1;
                }
            }
            out.push(instr);
            i += 1;
        }
        self.instructions = out;
    }

    /// Pass 5: remove label pseudo-instructions, then rewrite every
    /// `JMP`/`JOF` operand from a label id to its absolute address.
    fn resolve_labels(&mut self) {
        let mut addresses = vec![0u32; self.num_labels as usize];
        let mut jumps = Vec::new();
        let mut out = Vec::with_capacity(self.instructions.len());

        for instr in &self.instructions {
            let (opcode, operand) = decode_raw(instr.instruction);
            if opcode == OP_LABEL {
                addresses[operand.cast_unsigned() as usize] =
                    u32::try_from(out.len()).expect("instruction count exceeds u32");
                continue;
            }
            if opcode == Opcode::Jmp as u8 || opcode == Opcode::Jof as u8 {
                jumps.push(out.len());
            }
            out.push(*instr);
        }

        for index in jumps {
            let (opcode, operand) = decode_raw(out[index].instruction);
            let address = addresses[operand.cast_unsigned() as usize];
            out[index].instruction = encode_raw(opcode, address.cast_signed());
        }

        self.instructions = out;
    }

    fn pack_image(
        &self,
        num_args: u16,
        is_vararg: bool,
        num_locals: u16,
        arena: &Arena,
    ) -> FunctionImage {
        let num_imports =
            u16::try_from(self.imports.len()).expect("import pool exceeds u16 range (65535)");
        let num_constants =
            u16::try_from(self.constants.len()).expect("constant pool exceeds u16 range (65535)");
        let num_instructions = u16::try_from(self.instructions.len())
            .expect("instruction count exceeds u16 range (65535)");
        let num_functions =
            u16::try_from(self.nested.len()).expect("nested function count exceeds u16 range");

        // Fixed blocks first, in the same shape `image::layout` computes,
        // then one block per pooled string and per nested function.
        let mut blocks = vec![
            MemBlock::new(HEADER_SIZE, 1, 4),
            MemBlock::new(4 + self.source_name.len(), 1, 4),
            MemBlock::new(IMPORT_SIZE, self.imports.len(), 8),
            MemBlock::new(IMAGE_VALUE_SIZE, self.constants.len(), 8),
            MemBlock::new(4, self.nested.len(), 4),
            MemBlock::new(4, self.instructions.len(), 4),
            MemBlock::new(LOC_RANGE_SIZE, self.instructions.len() + 1, 4),
        ];
        let strings_base = blocks.len();
        for string in &self.string_pool {
            blocks.push(MemBlock::new(4 + string.len(), 1, 4));
        }
        let nested_base = blocks.len();
        for &(_, size) in &self.nested {
            blocks.push(MemBlock::new(size as usize, 1, 8));
        }
        let info = pack(&mut blocks);

        let mut bytes = vec![0u8; info.total_size];
        let header = FnHeader {
            size: u32::try_from(info.total_size).expect("function image exceeds u32 bytes"),
            num_args,
            is_vararg,
            num_locals,
            num_imports,
            num_constants,
            num_instructions,
            num_functions,
        };
        header.write(&mut bytes[0..HEADER_SIZE]);

        // Source name record.
        let name_offset = blocks[1].offset;
        write_string_record(&mut bytes, name_offset, &self.source_name);

        // Imports: name offset plus a placeholder slot for the resolved
        // value; linking fills a side table, never the image.
        for (i, &pool_index) in self.imports.iter().enumerate() {
            let base = blocks[2].offset + i * IMPORT_SIZE;
            let string_offset = u32::try_from(blocks[strings_base + pool_index as usize].offset)
                .expect("string offset exceeds u32");
            bytes[base..base + 4].copy_from_slice(&string_offset.to_le_bytes());
            ImageValue::Placeholder.write(&mut bytes[base + 8..base + 8 + IMAGE_VALUE_SIZE]);
        }

        // Constants; string and symbol constants point at their records.
        for (i, constant) in self.constants.iter().enumerate() {
            let base = blocks[3].offset + i * IMAGE_VALUE_SIZE;
            let value = match constant {
                AsmConstant::Number(number) => ImageValue::Number(*number),
                AsmConstant::Str(pool_index) => ImageValue::Str(
                    u32::try_from(blocks[strings_base + *pool_index as usize].offset)
                        .expect("string offset exceeds u32"),
                ),
                AsmConstant::Sym(pool_index) => ImageValue::Sym(
                    u32::try_from(blocks[strings_base + *pool_index as usize].offset)
                        .expect("string offset exceeds u32"),
                ),
            };
            value.write(&mut bytes[base..base + IMAGE_VALUE_SIZE]);
        }

        // Nested-function offsets.
        for i in 0..self.nested.len() {
            let base = blocks[4].offset + i * 4;
            let offset = u32::try_from(blocks[nested_base + i].offset)
                .expect("nested function offset exceeds u32");
            bytes[base..base + 4].copy_from_slice(&offset.to_le_bytes());
        }

        // Instructions and the location table; entry 0 covers the whole
        // function, entry i + 1 belongs to instruction i.
        for (i, instr) in self.instructions.iter().enumerate() {
            let base = blocks[5].offset + i * 4;
            bytes[base..base + 4].copy_from_slice(&instr.instruction.to_le_bytes());
        }
        write_loc_range(
            self.location,
            &mut bytes[blocks[6].offset..blocks[6].offset + LOC_RANGE_SIZE],
        );
        for (i, instr) in self.instructions.iter().enumerate() {
            let base = blocks[6].offset + (i + 1) * LOC_RANGE_SIZE;
            write_loc_range(instr.location, &mut bytes[base..base + LOC_RANGE_SIZE]);
        }

        // Interned strings.
        for (i, string) in self.string_pool.iter().enumerate() {
            write_string_record(&mut bytes, blocks[strings_base + i].offset, string);
        }

        // Nested images, verbatim.
        for (i, &(handle, size)) in self.nested.iter().enumerate() {
            let base = blocks[nested_base + i].offset;
            bytes[base..base + size as usize].copy_from_slice(arena.bytes(handle));
        }

        FunctionImage::from_bytes(bytes).expect("assembler produced a malformed image")
    }
}

fn write_string_record(bytes: &mut [u8], offset: usize, string: &str) {
    let len = u32::try_from(string.len()).expect("string length exceeds u32");
    bytes[offset..offset + 4].copy_from_slice(&len.to_le_bytes());
    bytes[offset + 4..offset + 4 + string.len()].copy_from_slice(string.as_bytes());
}
