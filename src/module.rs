use std::collections::HashMap;
use std::rc::Rc;

use crate::byte_iter::*;
use crate::error::Error::*;
use crate::error::*;
use crate::leb128::*;
use crate::signature::*;
use crate::validator::{validate_const, Validator};

pub const MAGIC_HEADER: &[u8; 4] = b"\0asm";

// ---------------- Import/Export related ----------------
#[derive(Clone, Debug)]
pub struct ImportRef {
    pub module: String,
    pub field: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternType {
    Func = 0,
    Table = 1,
    Mem = 2,
    Global = 3,
}

impl ExternType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ExternType::Func),
            1 => Some(ExternType::Table),
            2 => Some(ExternType::Mem),
            3 => Some(ExternType::Global),
            _ => None,
        }
    }
}

// ---------------- Structures ----------------
#[derive(Clone)]
pub struct Function {
    /// Byte range of the body expression within the module bytes.
    /// Empty for imported functions.
    pub body: std::ops::Range<usize>,
    pub ty: Signature,
    /// Parameters followed by declared locals.
    pub locals: Vec<ValType>,
    pub import: Option<ImportRef>,
    /// Maximum operand-stack height over any execution of the body,
    /// measured from the frame base. Computed by the validator; the
    /// dispatcher pre-reserves exactly this many slots.
    pub max_stack_height: u32,
}

#[derive(Clone)]
pub struct Table {
    pub min: u32,
    pub max: u32,
    pub import: Option<ImportRef>,
}

#[derive(Clone)]
pub struct Memory {
    pub min: u32,
    pub max: u32,
    pub import: Option<ImportRef>,
}

#[derive(Clone)]
pub struct Global {
    pub ty: ValType,
    pub is_mutable: bool,
    /// Offset of the constant initializer expression; 0 for imports.
    pub initializer_offset: usize,
    pub import: Option<ImportRef>,
}

#[derive(Clone)]
pub struct Export {
    pub extern_type: ExternType,
    pub idx: u32,
}

#[derive(Clone)]
pub struct ElemSegment {
    /// Offset of the i32 constant expression computing the table offset.
    pub initializer_offset: usize,
    pub func_indices: Vec<u32>,
}

#[derive(Clone)]
pub struct DataSegment {
    pub data_range: std::ops::Range<usize>,
    pub initializer_offset: usize,
}

/// Forward-jump targets for an `if`: position of the matching `else`
/// opcode (== end_offset when there is no else arm) and of the matching
/// `end` opcode.
#[derive(Clone, Copy)]
pub struct IfJump {
    pub else_offset: usize,
    pub end_offset: usize,
}

// ---------------- Module Structure ----------------
/// Decoded module. Immutable after `compile` returns; instances keep it by
/// shared reference.
pub struct Module {
    pub bytes: Rc<Vec<u8>>,
    pub types: Vec<Signature>,
    pub table: Option<Table>,
    pub memory: Option<Memory>,
    pub globals: Vec<Global>,
    pub exports: HashMap<String, Export>,
    pub start: Option<u32>,
    pub elements: Vec<ElemSegment>,
    /// Imported functions first, then defined functions, forming the
    /// module-local function index space.
    pub functions: Vec<Function>,
    pub data_segments: Vec<DataSegment>,
    /// if opcode position -> matching else/end positions.
    pub if_jumps: HashMap<usize, IfJump>,
    /// block opcode position -> matching end position; also else opcode
    /// position -> matching end position (to skip an else arm).
    pub block_ends: HashMap<usize, usize>,
}

macro_rules! assert_not_empty {
    ($it:expr) => {
        if $it.empty() {
            return Err(Malformed(UNEXPECTED_END));
        }
    };
}

impl Module {
    pub const MAX_PAGES: u32 = 65536;
    pub const MAX_LOCALS: usize = 50000;

    pub fn compile(bytes: Vec<u8>) -> Result<Self, Error> {
        let mut m = Module {
            bytes: Rc::new(bytes),
            types: Vec::new(),
            table: None,
            memory: None,
            globals: Vec::new(),
            exports: HashMap::new(),
            start: None,
            elements: Vec::new(),
            functions: Vec::new(),
            data_segments: Vec::new(),
            if_jumps: HashMap::new(),
            block_ends: HashMap::new(),
        };
        m.initialize()?;
        Ok(m)
    }

    pub fn imported_function_count(&self) -> usize {
        self.functions.iter().filter(|f| f.import.is_some()).count()
    }

    fn initialize(&mut self) -> Result<(), Error> {
        let bytes_rc = self.bytes.clone();
        let bytes: &[u8] = &bytes_rc[..];

        if bytes.len() < 8 {
            return Err(Malformed(UNEXPECTED_END));
        }
        if &bytes[0..4] != MAGIC_HEADER {
            return Err(Malformed(NO_MAGIC_HEADER));
        }
        if u32::from_le_bytes(bytes[4..8].try_into().unwrap()) != 1 {
            return Err(Malformed(UNKNOWN_BINARY_VERSION));
        }
        let mut it = ByteIter::new(bytes, 8);

        section(&mut it, bytes, 1, |it| self.parse_type_section(bytes, it))?;
        section(&mut it, bytes, 2, |it| self.parse_import_section(bytes, it))?;
        section(&mut it, bytes, 3, |it| self.parse_function_section(bytes, it))?;
        section(&mut it, bytes, 4, |it| self.parse_table_section(bytes, it))?;
        section(&mut it, bytes, 5, |it| self.parse_memory_section(bytes, it))?;
        section(&mut it, bytes, 6, |it| self.parse_global_section(bytes, it))?;
        section(&mut it, bytes, 7, |it| self.parse_export_section(bytes, it))?;
        section(&mut it, bytes, 8, |it| self.parse_start_section(bytes, it))?;
        section(&mut it, bytes, 9, |it| self.parse_element_section(bytes, it))?;
        section(&mut it, bytes, 10, |it| self.parse_code_section(bytes, it))?;
        section(&mut it, bytes, 11, |it| self.parse_data_section(bytes, it))?;

        if !it.empty() {
            return Err(Malformed(JUNK_AFTER_LAST));
        }
        Ok(())
    }

    fn parse_type_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_types: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        self.types.reserve_exact(n_types as usize);

        for _ in 0..n_types {
            assert_not_empty!(it);
            let byte = it.read_u8()?;
            if byte != 0x60 {
                return Err(Malformed(INVALID_VALUE_TYPE));
            }

            let n_params: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            let mut sig = Signature::default();
            sig.params.reserve_exact(n_params as usize);

            for _ in 0..n_params {
                let ty = it.read_u8()?;
                sig.params.push(val_type_from_byte(ty).ok_or(Malformed(INVALID_VALUE_TYPE))?);
            }

            let n_results: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            if n_results > 1 {
                return Err(Validation(INVALID_RESULT_ARITY));
            }
            if n_results == 1 {
                let ty = it.read_u8()?;
                sig.result = Some(val_type_from_byte(ty).ok_or(Malformed(INVALID_RESULT_TYPE))?);
            }

            self.types.push(sig);
        }

        Ok(())
    }

    fn parse_name(bytes: &[u8], it: &mut ByteIter) -> Result<String, Error> {
        let len: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        let start = it.idx;
        let end = start.checked_add(len as usize).ok_or(Malformed(UNEXPECTED_END))?;
        if end > bytes.len() {
            return Err(Malformed(UNEXPECTED_END));
        }
        if !is_valid_utf8(&bytes[start..end]) {
            return Err(Malformed(INVALID_UTF8));
        }
        it.idx = end;
        Ok(String::from_utf8(bytes[start..end].to_vec()).unwrap())
    }

    fn parse_import_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_imports: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

        for _ in 0..n_imports {
            assert_not_empty!(it);

            let module_name = Self::parse_name(bytes, it)?;
            let field_name = Self::parse_name(bytes, it)?;

            let byte = it.read_u8()?;
            let extern_type = ExternType::from_byte(byte).ok_or(Malformed(MALFORMED_IMPORT_KIND))?;
            let import = Some(ImportRef { module: module_name, field: field_name });

            match extern_type {
                ExternType::Func => {
                    let type_idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
                    if (type_idx as usize) >= self.types.len() {
                        return Err(Validation(UNKNOWN_TYPE));
                    }
                    self.functions.push(Function {
                        body: 0..0,
                        ty: self.types[type_idx as usize].clone(),
                        locals: vec![],
                        import,
                        max_stack_height: 0,
                    });
                }
                ExternType::Table => {
                    if self.table.is_some() {
                        return Err(Validation(MULTIPLE_TABLES));
                    }
                    // Only funcref (0x70) exists in the MVP
                    let reftype = it.read_u8()?;
                    if reftype != 0x70 {
                        return Err(Malformed(MALFORMED_REF_TYPE));
                    }
                    let (min, max) = get_table_limits(bytes, it)?;
                    self.table = Some(Table { min, max, import });
                }
                ExternType::Mem => {
                    if self.memory.is_some() {
                        return Err(Validation(MULTIPLE_MEMORIES));
                    }
                    let (min, max) = get_memory_limits(bytes, it)?;
                    self.memory = Some(Memory { min, max, import });
                }
                ExternType::Global => {
                    let ty = it.read_u8()?;
                    let ty = val_type_from_byte(ty).ok_or(Malformed(INVALID_GLOBAL_TYPE))?;
                    let mut_byte = it.read_u8()?;
                    let is_mutable =
                        mutability_from_byte(mut_byte).ok_or(Malformed(INVALID_MUTABILITY))?;
                    self.globals.push(Global { ty, is_mutable, initializer_offset: 0, import });
                }
            }
        }
        Ok(())
    }

    fn parse_function_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_functions: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        self.functions.reserve(n_functions as usize);

        for _ in 0..n_functions {
            assert_not_empty!(it);
            let type_idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            if (type_idx as usize) >= self.types.len() {
                return Err(Validation(UNKNOWN_TYPE));
            }
            self.functions.push(Function {
                body: 0..0,
                ty: self.types[type_idx as usize].clone(),
                locals: vec![],
                import: None,
                max_stack_height: 0,
            });
        }
        Ok(())
    }

    fn parse_table_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_tables: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        if n_tables > 1 || (n_tables == 1 && self.table.is_some()) {
            return Err(Validation(MULTIPLE_TABLES));
        }

        if n_tables == 1 {
            assert_not_empty!(it);
            let elem_type = it.read_u8()?;
            if elem_type != 0x70 {
                return Err(Validation(INVALID_ELEM_TYPE));
            }
            let (min, max) = get_table_limits(bytes, it)?;
            self.table = Some(Table { min, max, import: None });
        }
        Ok(())
    }

    fn parse_memory_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_memories: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        if n_memories > 1 || (n_memories == 1 && self.memory.is_some()) {
            return Err(Validation(MULTIPLE_MEMORIES));
        }

        if n_memories == 1 {
            assert_not_empty!(it);
            let (min, max) = get_memory_limits(bytes, it)?;
            self.memory = Some(Memory { min, max, import: None });
        }
        Ok(())
    }

    fn parse_global_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_globals: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

        for _ in 0..n_globals {
            assert_not_empty!(it);
            let ty = it.read_u8()?;
            let ty = val_type_from_byte(ty).ok_or(Malformed(INVALID_GLOBAL_TYPE))?;
            let mut_byte = it.read_u8()?;
            let is_mutable = mutability_from_byte(mut_byte).ok_or(Malformed(INVALID_MUTABILITY))?;
            let initializer_offset = it.cur();
            self.globals.push(Global { ty, is_mutable, initializer_offset, import: None });
            validate_const(bytes, it, ty, &self.globals)?;
        }
        Ok(())
    }

    fn parse_export_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_exports: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

        for _ in 0..n_exports {
            assert_not_empty!(it);

            let name = Self::parse_name(bytes, it)?;
            let byte = it.read_u8()?;
            let extern_type = ExternType::from_byte(byte).ok_or(Validation(INVALID_EXPORT_DESC))?;
            let export_idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

            if self.exports.contains_key(&name) {
                return Err(Validation(DUP_EXPORT_NAME));
            }

            match extern_type {
                ExternType::Func => {
                    if (export_idx as usize) >= self.functions.len() {
                        return Err(Validation(UNKNOWN_FUNC));
                    }
                }
                ExternType::Table => {
                    if export_idx != 0 || self.table.is_none() {
                        return Err(Validation(UNKNOWN_TABLE));
                    }
                }
                ExternType::Mem => {
                    if export_idx != 0 || self.memory.is_none() {
                        return Err(Validation(UNKNOWN_MEMORY));
                    }
                }
                ExternType::Global => {
                    if (export_idx as usize) >= self.globals.len() {
                        return Err(Validation(UNKNOWN_GLOBAL));
                    }
                }
            }

            self.exports.insert(name, Export { extern_type, idx: export_idx });
        }
        Ok(())
    }

    fn parse_start_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let start: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        let func = self.functions.get(start as usize).ok_or(Validation(UNKNOWN_FUNC))?;
        if !func.ty.params.is_empty() || func.ty.result.is_some() {
            return Err(Validation(START_FUNC));
        }
        self.start = Some(start);
        Ok(())
    }

    fn parse_element_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_elements: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

        for _ in 0..n_elements {
            assert_not_empty!(it);
            let flags: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            if flags != 0 {
                return Err(Malformed(INVALID_VALUE_TYPE));
            }
            if self.table.is_none() {
                return Err(Validation(UNKNOWN_TABLE));
            }
            let initializer_offset = it.cur();
            validate_const(bytes, it, ValType::I32, &self.globals)?;

            let n_elems: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            let mut func_indices = Vec::with_capacity(n_elems as usize);
            for _ in 0..n_elems {
                let elem_idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
                if (elem_idx as usize) >= self.functions.len() {
                    return Err(Validation(UNKNOWN_FUNC));
                }
                func_indices.push(elem_idx);
            }
            self.elements.push(ElemSegment { initializer_offset, func_indices });
        }
        Ok(())
    }

    fn parse_code_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_functions: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        let n_imports = self.imported_function_count() as u32;
        if (n_functions as u64 + n_imports as u64) != self.functions.len() as u64 {
            return Err(Malformed(FUNC_CODE_INCONSISTENT));
        }

        for i in 0..self.functions.len() {
            if self.functions[i].import.is_some() {
                continue;
            }

            // Locals start out as the parameters
            self.functions[i].locals = self.functions[i].ty.params.clone();

            let function_length: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            let func_start = it.cur();
            if !it.has_n_left(function_length as usize) {
                return Err(Malformed(UNEXPECTED_END));
            }

            // Local declarations: run-length encoded (count, type) pairs
            let n_local_decls: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            for _ in 0..n_local_decls {
                let n_locals: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
                let ty = it.read_u8()?;
                let vt = val_type_from_byte(ty).ok_or(Validation(INVALID_LOCAL_TYPE))?;
                let function = &mut self.functions[i];
                if function.locals.len() + n_locals as usize > Module::MAX_LOCALS {
                    return Err(Malformed(TOO_MANY_LOCALS));
                }
                function.locals.extend(std::iter::repeat(vt).take(n_locals as usize));
            }

            let body_start = it.cur();
            let consumed = body_start - func_start;
            let body_length = (function_length as usize)
                .checked_sub(consumed)
                .ok_or(Malformed(SECTION_SIZE_MISMATCH))?;
            self.functions[i].body = body_start..body_start + body_length;

            // Validate the body immediately; this also computes the
            // function's max_stack_height and fills the jump tables.
            Validator::new(self).validate_function(i)?;
            it.advance(body_length);
        }
        Ok(())
    }

    fn parse_data_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_data_segments: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

        for _ in 0..n_data_segments {
            assert_not_empty!(it);
            let segment_flag: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            if segment_flag != 0 {
                return Err(Validation(INVALID_DATA_SEG_FLAG));
            }
            if self.memory.is_none() {
                return Err(Validation(UNKNOWN_MEMORY));
            }

            let initializer_offset = it.cur();
            validate_const(bytes, it, ValType::I32, &self.globals)?;

            let data_length: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            if !it.has_n_left(data_length as usize) {
                return Err(Malformed(UNEXPECTED_END));
            }

            let data_start = it.cur();
            it.advance(data_length as usize);
            let data_end = it.cur();

            self.data_segments.push(DataSegment { data_range: data_start..data_end, initializer_offset });
        }
        Ok(())
    }
}

// ---------------- Helper Functions ----------------
fn skip_custom_sections(bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
    while !it.empty() && it.peek_u8()? == 0 {
        it.advance(1);
        let section_length: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        let section_start = it.cur();
        if section_start + section_length as usize > bytes.len() {
            return Err(Malformed(UNEXPECTED_END));
        }

        // The name must be present and valid even though the payload is skipped
        let name_len: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        let name_start = it.cur();
        if name_start + name_len as usize > bytes.len() {
            return Err(Malformed(UNEXPECTED_END));
        }
        it.advance(name_len as usize);
        if !is_valid_utf8(&bytes[name_start..name_start + name_len as usize]) {
            return Err(Malformed(INVALID_UTF8));
        }
        if it.cur() > section_start + section_length as usize {
            return Err(Malformed(UNEXPECTED_END));
        }

        it.idx = section_start + section_length as usize;
    }
    Ok(())
}

fn section<F>(it: &mut ByteIter, bytes: &[u8], id: u8, mut reader: F) -> Result<(), Error>
where
    F: FnMut(&mut ByteIter) -> Result<(), Error>,
{
    skip_custom_sections(bytes, it)?;
    if !it.empty() && it.peek_u8()? == id {
        it.advance(1);
        let section_length: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        let section_start = it.cur();
        if section_start + section_length as usize > bytes.len() {
            return Err(Malformed(UNEXPECTED_END));
        }
        reader(it)?;
        if it.cur() - section_start != section_length as usize {
            return Err(Malformed(SECTION_SIZE_MISMATCH));
        }
        skip_custom_sections(bytes, it)?;
    } else if !it.empty() && it.peek_u8()? > 11 {
        return Err(Malformed(INVALID_SECTION_ID));
    }
    Ok(())
}

fn get_limits(bytes: &[u8], it: &mut ByteIter, upper: u32) -> Result<(u32, u32), Error> {
    let flags: u32 = safe_read_leb128(bytes, &mut it.idx, 1)?;
    let initial: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
    let max = if flags == 1 { safe_read_leb128::<u32>(bytes, &mut it.idx, 32)? } else { upper };

    if max < initial {
        return Err(Validation(MIN_GREATER_THAN_MAX));
    }
    Ok((initial, max))
}

fn get_memory_limits(bytes: &[u8], it: &mut ByteIter) -> Result<(u32, u32), Error> {
    let (initial, max) = get_limits(bytes, it, Module::MAX_PAGES)?;
    if initial > Module::MAX_PAGES || max > Module::MAX_PAGES {
        return Err(Validation(MEMORY_SIZE_LIMIT));
    }
    Ok((initial, max))
}

fn get_table_limits(bytes: &[u8], it: &mut ByteIter) -> Result<(u32, u32), Error> {
    get_limits(bytes, it, u32::MAX)
}
