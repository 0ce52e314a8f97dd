use crate::word::{DataType, Word, op};

// ── Code writer / linker ────────────────────────────────────────────
//
// Accumulates an ordered token list plus a deduplicated table of
// literal strings too long to pack in place. While writing, a string
// reference's payload is its table index; `serialize` lays out the
// final binary (code-start word, data section, code) and rewrites
// every reference to the absolute token offset of its length header.
//
// Fragments compile bottom-up: each nested block gets its own writer
// and `merge` splices it in, remapping string references so indices
// stay valid in the combined table.

/// Packed strings top out at 6 ASCII bytes; anything longer goes to
/// the data area.
pub const MAX_PACKED_STR: usize = 6;

/// Data-area payload words are padded to the 8-byte boundary with
/// underscores.
const PAD_BYTE: u8 = b'_';

#[derive(Debug, Default)]
pub struct CodeWriter {
    tokens: Vec<Word>,
    strings: Vec<String>,
    notes: Vec<(usize, String)>,
}

impl CodeWriter {
    pub fn new() -> Self {
        CodeWriter::default()
    }

    /// Token count written so far. The unit of addressing everywhere
    /// is token index, never bytes.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[Word] {
        &self.tokens
    }

    // ── Instruction builders ────────────────────────────────────────

    pub fn variable_reference(&mut self, hash: u32) {
        self.tokens.push(Word::name(hash));
    }

    pub fn memory(&mut self, action: u8, hash: u32) {
        self.tokens.push(Word::opcode_wide(op::CLASS_MEMORY, action, hash));
    }

    pub fn function_call(&mut self, hash: u32, argc: u16) {
        self.tokens.push(Word::name(hash));
        self.tokens.push(Word::opcode(op::CLASS_FUNCTION, op::FN_CALL, argc, 0));
    }

    /// `skip` counts every token after the define opcode that belongs
    /// to the function: the body plus its return trailer.
    pub fn function_define(&mut self, hash: u32, argc: u16, skip: u16) {
        self.tokens.push(Word::name(hash));
        self.tokens.push(Word::opcode(op::CLASS_FUNCTION, op::FN_DEFINE, argc, skip));
    }

    pub fn return_op(&mut self) {
        self.tokens.push(Word::opcode_wide(op::CLASS_CONTROL, op::CTRL_RETURN, 0));
    }

    /// Runtime trap: reaching it means a value-returning function fell
    /// through without an explicit `return`.
    pub fn invalid_return(&mut self) {
        self.tokens.push(Word::opcode_wide(op::CLASS_CONTROL, op::CTRL_TRAP, 0));
    }

    pub fn compare_jump(&mut self, skip: u32) {
        self.tokens.push(Word::opcode_wide(op::CLASS_CONTROL, op::CTRL_COMPARE_SKIP, skip));
    }

    pub fn unconditional_jump(&mut self, back: u32) {
        self.tokens.push(Word::opcode_wide(op::CLASS_CONTROL, op::CTRL_JUMP_BACK, back));
    }

    pub fn skip(&mut self, forward: u32) {
        self.tokens.push(Word::opcode_wide(op::CLASS_CONTROL, op::CTRL_SKIP, forward));
    }

    pub fn compound_compare_jump(&mut self, cmp: u8, argc: u16, skip: u16) {
        self.tokens.push(Word::opcode(op::CLASS_COMPARE, cmp, argc, skip));
    }

    pub fn increment(&mut self, delta: i8, hash: u32) {
        self.tokens.push(Word::opcode_wide(op::CLASS_INCREMENT, delta as u8, hash));
    }

    pub fn number(&mut self, n: f64) {
        self.tokens.push(Word::number(n));
    }

    pub fn boolean(&mut self, b: bool) {
        self.tokens.push(Word::boolean(b));
    }

    /// Short strings pack in place; longer ones get (or reuse) a
    /// string-table slot. Identical literals share one slot.
    pub fn string(&mut self, s: &str) {
        if let Ok(packed) = Word::short_str(s) {
            self.tokens.push(packed);
        } else {
            let idx = self.intern(s);
            self.tokens.push(Word::str_ref(idx as u64));
        }
    }

    pub fn word(&mut self, w: Word) {
        self.tokens.push(w);
    }

    /// Diagnostic note attached to the next token position. Never
    /// reaches the token stream.
    pub fn comment(&mut self, text: impl Into<String>) {
        self.notes.push((self.tokens.len(), text.into()));
    }

    pub fn notes(&self) -> &[(usize, String)] {
        &self.notes
    }

    fn intern(&mut self, s: &str) -> usize {
        if let Some(idx) = self.strings.iter().position(|existing| existing == s) {
            return idx;
        }
        self.strings.push(s.to_string());
        self.strings.len() - 1
    }

    // ── Linking ─────────────────────────────────────────────────────

    /// Splice another writer's tokens onto the end of this one,
    /// re-interning its strings so every reference stays valid.
    pub fn merge(&mut self, fragment: CodeWriter) {
        let base = self.tokens.len();
        let remap: Vec<usize> = fragment.strings.iter().map(|s| self.intern(s)).collect();
        for token in fragment.tokens {
            if token.data_type().is_ok_and(|t| t == DataType::StrRef) {
                let idx = token.as_str_offset() as usize;
                self.tokens.push(Word::str_ref(remap[idx] as u64));
            } else {
                self.tokens.push(token);
            }
        }
        for (pos, text) in fragment.notes {
            self.notes.push((base + pos, text));
        }
    }

    /// Final binary layout: a leading code-start opcode whose 32-bit
    /// parameter is the data-section token count, then each string
    /// literal (UInt32 length header + underscore-padded raw words),
    /// then the code with string references rewritten to absolute
    /// token offsets.
    pub fn serialize(&self) -> Vec<Word> {
        let mut header_offsets = Vec::with_capacity(self.strings.len());
        let mut data: Vec<Word> = Vec::new();
        for s in &self.strings {
            header_offsets.push(1 + append_string(&mut data, s));
        }

        let mut out = Vec::with_capacity(1 + data.len() + self.tokens.len());
        out.push(Word::opcode_wide(op::CLASS_CONTROL, op::CTRL_SKIP, data.len() as u32));
        out.extend(data);
        for &token in &self.tokens {
            if token.data_type().is_ok_and(|t| t == DataType::StrRef) {
                let idx = token.as_str_offset() as usize;
                out.push(Word::str_ref(header_offsets[idx]));
            } else {
                out.push(token);
            }
        }
        out
    }
}

/// Append a string in data-area layout (length header plus padded
/// payload words), returning the token offset of the header. The
/// engine uses this to allocate strings built at runtime onto the end
/// of a loaded program.
pub fn append_string(program: &mut Vec<Word>, s: &str) -> u64 {
    let offset = program.len() as u64;
    program.push(Word::uint(s.len() as u32));
    for chunk in s.as_bytes().chunks(8) {
        let mut bytes = [PAD_BYTE; 8];
        bytes[..chunk.len()].copy_from_slice(chunk);
        program.push(Word::from_bits(u64::from_le_bytes(bytes)));
    }
    offset
}

/// Read a string out of a serialized program, given the absolute token
/// offset of its length header.
pub fn read_string(program: &[Word], offset: usize) -> Option<String> {
    let header = program.get(offset)?;
    if header.data_type().ok()? != DataType::Uint {
        return None;
    }
    let len = header.as_uint() as usize;
    let word_count = len.div_ceil(8);
    let mut bytes = Vec::with_capacity(word_count * 8);
    for i in 0..word_count {
        bytes.extend_from_slice(&program.get(offset + 1 + i)?.bits().to_le_bytes());
    }
    bytes.truncate(len);
    String::from_utf8(bytes).ok()
}
