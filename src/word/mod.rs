use serde::Serialize;

// ── Tagged word layout ──────────────────────────────────────────────
//
// Every runtime value and every instruction is one 64-bit IEEE-754
// double. Plain numbers are any bit pattern outside the tag space; the
// tag space is the negative-NaN range (sign + exponent all ones) with a
// nonzero type nibble in mantissa bits 48..51:
//
//   [ 0xFFF:12 | nibble:4 | payload:48 ]
//
// -inf has a zero nibble, so it stays a plain number. Arithmetic NaNs
// are canonicalized to the positive quiet NaN on encode, which keeps
// the tag space disjoint from every number the system can produce.
// The nibble's high bit marks allocated references (values a collector
// would have to track).

const TAG_SPACE: u64 = 0xFFF0_0000_0000_0000;
const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;
const NIBBLE_SHIFT: u32 = 48;
const NIBBLE_MASK: u64 = 0x000F_0000_0000_0000;
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
const ALLOCATED_NIBBLE_BIT: u64 = 0x8;

const NIB_OPCODE: u64 = 0x1;
const NIB_NAME: u64 = 0x2;
const NIB_INT: u64 = 0x3;
const NIB_UINT: u64 = 0x4;
const NIB_SHORT_STR: u64 = 0x5;
const NIB_STATUS: u64 = 0x6;
const NIB_STR_REF: u64 = 0x9; // allocated

/// What a tagged word holds. `data_type` is total over every pattern
/// this system emits; foreign nibbles decode to `WordError::InvalidTag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataType {
    Number,
    Opcode,
    Name,
    Int,
    Uint,
    ShortStr,
    Status,
    StrRef,
}

/// Non-value markers carried by the Status tag. Void and NotAResult
/// propagate "absence" through expressions without exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Void,
    Unit,
    NotAResult,
}

#[derive(Debug, thiserror::Error)]
pub enum WordError {
    #[error("invalid type tag {nibble:#x} — corrupted or foreign binary")]
    InvalidTag { nibble: u8 },
    #[error("invalid status code {code}")]
    InvalidStatus { code: u32 },
    #[error("string does not fit a packed word: {text:?}")]
    NotPackable { text: String },
}

// ── Opcode classes and actions ──────────────────────────────────────
//
// The two-character discriminator of the binary contract. Control-class
// opcodes always use the wide (32-bit) parameter form so jumps are not
// limited to 64K tokens; function and compound-compare opcodes use the
// short (16+16) form; memory and increment opcodes are wide, carrying a
// crushed name.

pub mod op {
    pub const CLASS_FUNCTION: u8 = b'f';
    pub const CLASS_CONTROL: u8 = b'c';
    pub const CLASS_COMPARE: u8 = b'C';
    pub const CLASS_MEMORY: u8 = b'm';
    pub const CLASS_INCREMENT: u8 = b'i';

    pub const FN_CALL: u8 = b'c';
    pub const FN_DEFINE: u8 = b'd';

    /// Pop a boolean, skip forward on false.
    pub const CTRL_COMPARE_SKIP: u8 = b'c';
    /// Unconditional backward jump.
    pub const CTRL_JUMP_BACK: u8 = b'j';
    /// Unconditional forward skip. Word 0 of every program is one of
    /// these ("code-start"), measuring the string data section.
    pub const CTRL_SKIP: u8 = b's';
    /// Fatal trap: a value-returning function fell through.
    pub const CTRL_TRAP: u8 = b't';
    pub const CTRL_RETURN: u8 = b'r';

    pub const CMP_EQUAL: u8 = b'e';
    pub const CMP_NOT_EQUAL: u8 = b'n';
    pub const CMP_LESS: u8 = b'l';
    pub const CMP_GREATER: u8 = b'g';

    pub const MEM_GET: u8 = b'g';
    pub const MEM_SET: u8 = b's';
    pub const MEM_ISSET: u8 = b'i';
    pub const MEM_UNSET: u8 = b'u';
    /// Indexed read, e.g. character indexing into a string.
    pub const MEM_INDEX: u8 = b'G';
}

/// One 64-bit tagged word. Copy, bit-exact, no interior allocation —
/// the whole program and operand stack are `Vec<Word>`-equivalent.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Word(u64);

impl Word {
    pub const TRUE: Word = Word(TAG_SPACE | (NIB_INT << NIBBLE_SHIFT) | 0xFFFF_FFFF);
    pub const FALSE: Word = Word(TAG_SPACE | (NIB_INT << NIBBLE_SHIFT));
    pub const VOID: Word = Word(TAG_SPACE | (NIB_STATUS << NIBBLE_SHIFT));

    #[inline]
    pub fn from_bits(bits: u64) -> Word {
        Word(bits)
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn number(n: f64) -> Word {
        if n.is_nan() {
            Word(CANONICAL_NAN) // keep arithmetic NaNs out of the tag space
        } else {
            Word(n.to_bits())
        }
    }

    #[inline]
    pub fn int(v: i32) -> Word {
        Word::tagged(NIB_INT, u64::from(v as u32))
    }

    #[inline]
    pub fn uint(v: u32) -> Word {
        Word::tagged(NIB_UINT, u64::from(v))
    }

    /// Booleans are Int32 words: -1 is true, 0 is false.
    #[inline]
    pub fn boolean(b: bool) -> Word {
        if b { Word::TRUE } else { Word::FALSE }
    }

    #[inline]
    pub fn name(hash: u32) -> Word {
        Word::tagged(NIB_NAME, u64::from(hash))
    }

    pub fn status(s: Status) -> Word {
        let code = match s {
            Status::Void => 0,
            Status::Unit => 1,
            Status::NotAResult => 2,
        };
        Word::tagged(NIB_STATUS, code)
    }

    /// Pack up to 6 ASCII bytes directly into the payload, NUL-padded.
    /// Longer or non-ASCII strings belong in the program data area.
    pub fn short_str(s: &str) -> Result<Word, WordError> {
        let bytes = s.as_bytes();
        if bytes.len() > 6 || bytes.iter().any(|&b| b == 0 || b > 0x7F) {
            return Err(WordError::NotPackable { text: s.to_string() });
        }
        let mut payload: u64 = 0;
        for (i, &b) in bytes.iter().enumerate() {
            payload |= u64::from(b) << (i * 8);
        }
        Ok(Word::tagged(NIB_SHORT_STR, payload))
    }

    /// Reference into the program's string data area: a 48-bit token
    /// offset (string-table index before linking, absolute after).
    #[inline]
    pub fn str_ref(offset: u64) -> Word {
        Word::tagged(NIB_STR_REF, offset & PAYLOAD_MASK)
    }

    /// Short opcode form: two 16-bit parameters.
    #[inline]
    pub fn opcode(class: u8, action: u8, p1: u16, p2: u16) -> Word {
        let payload = u64::from(class) << 40
            | u64::from(action) << 32
            | u64::from(p1) << 16
            | u64::from(p2);
        Word::tagged(NIB_OPCODE, payload)
    }

    /// Wide opcode form: one merged 32-bit parameter.
    #[inline]
    pub fn opcode_wide(class: u8, action: u8, p: u32) -> Word {
        let payload = u64::from(class) << 40 | u64::from(action) << 32 | u64::from(p);
        Word::tagged(NIB_OPCODE, payload)
    }

    #[inline]
    fn tagged(nibble: u64, payload: u64) -> Word {
        Word(TAG_SPACE | (nibble << NIBBLE_SHIFT) | (payload & PAYLOAD_MASK))
    }

    #[inline]
    fn nibble(self) -> u64 {
        (self.0 & NIBBLE_MASK) >> NIBBLE_SHIFT
    }

    #[inline]
    pub fn is_number(self) -> bool {
        (self.0 & TAG_SPACE) != TAG_SPACE || self.nibble() == 0
    }

    #[inline]
    pub fn is_opcode(self) -> bool {
        !self.is_number() && self.nibble() == NIB_OPCODE
    }

    /// True for values a collector would have to track.
    #[inline]
    pub fn is_allocated(self) -> bool {
        !self.is_number() && self.nibble() & ALLOCATED_NIBBLE_BIT != 0
    }

    pub fn data_type(self) -> Result<DataType, WordError> {
        if self.is_number() {
            return Ok(DataType::Number);
        }
        match self.nibble() {
            NIB_OPCODE => Ok(DataType::Opcode),
            NIB_NAME => Ok(DataType::Name),
            NIB_INT => Ok(DataType::Int),
            NIB_UINT => Ok(DataType::Uint),
            NIB_SHORT_STR => Ok(DataType::ShortStr),
            NIB_STATUS => Ok(DataType::Status),
            NIB_STR_REF => Ok(DataType::StrRef),
            other => Err(WordError::InvalidTag { nibble: other as u8 }),
        }
    }

    // ── Payload decoders ────────────────────────────────────────────
    // Each decoder mirrors exactly one encoder; callers check
    // `data_type` first (the engine dispatches on it).

    #[inline]
    pub fn as_number(self) -> f64 {
        f64::from_bits(self.0)
    }

    #[inline]
    pub fn as_int(self) -> i32 {
        (self.0 & 0xFFFF_FFFF) as u32 as i32
    }

    #[inline]
    pub fn as_uint(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    #[inline]
    pub fn as_name(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn as_short_str(self) -> String {
        let payload = self.0 & PAYLOAD_MASK;
        let mut out = String::with_capacity(6);
        for i in 0..6 {
            let b = ((payload >> (i * 8)) & 0xFF) as u8;
            if b == 0 {
                break;
            }
            out.push(b as char);
        }
        out
    }

    #[inline]
    pub fn as_str_offset(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    pub fn as_status(self) -> Result<Status, WordError> {
        match self.as_uint() {
            0 => Ok(Status::Void),
            1 => Ok(Status::Unit),
            2 => Ok(Status::NotAResult),
            code => Err(WordError::InvalidStatus { code }),
        }
    }

    #[inline]
    pub fn op_class(self) -> u8 {
        ((self.0 >> 40) & 0xFF) as u8
    }

    #[inline]
    pub fn op_action(self) -> u8 {
        ((self.0 >> 32) & 0xFF) as u8
    }

    #[inline]
    pub fn op_p1(self) -> u16 {
        ((self.0 >> 16) & 0xFFFF) as u16
    }

    #[inline]
    pub fn op_p2(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    #[inline]
    pub fn op_wide(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Human-readable form for trace mode and `--emit tokens`.
    pub fn describe(self) -> String {
        match self.data_type() {
            Ok(DataType::Number) => format!("num {}", fmt_number(self.as_number())),
            Ok(DataType::Opcode) => {
                let class = self.op_class() as char;
                let action = self.op_action() as char;
                format!(
                    "op {}/{} p1={} p2={} wide={}",
                    class,
                    action,
                    self.op_p1(),
                    self.op_p2(),
                    self.op_wide()
                )
            }
            Ok(DataType::Name) => format!("name #{:08x}", self.as_name()),
            Ok(DataType::Int) => format!("int {}", self.as_int()),
            Ok(DataType::Uint) => format!("uint {}", self.as_uint()),
            Ok(DataType::ShortStr) => format!("str {:?}", self.as_short_str()),
            Ok(DataType::Status) => match self.as_status() {
                Ok(Status::Void) => "void".to_string(),
                Ok(Status::Unit) => "unit".to_string(),
                Ok(Status::NotAResult) => "not-a-result".to_string(),
                Err(_) => format!("status? {}", self.as_uint()),
            },
            Ok(DataType::StrRef) => format!("strref @{}", self.as_str_offset()),
            Err(_) => format!("invalid {:#018x}", self.0),
        }
    }
}

impl std::fmt::Debug for Word {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Word({})", self.describe())
    }
}

/// Integral numbers print without a trailing `.0`.
pub fn fmt_number(n: f64) -> String {
    if n == (n as i64) as f64 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

// ── Crushed names ───────────────────────────────────────────────────

/// 32-bit hash standing in for a source identifier at runtime. Jenkins
/// one-at-a-time, seeded with the identifier's length so that short
/// names avalanche too. Pure: equal strings always hash equal;
/// cross-name collisions are rejected at registration (symbol table).
pub fn crush(name: &str) -> u32 {
    let mut h = name.len() as u32;
    for b in name.bytes() {
        h = h.wrapping_add(u32::from(b));
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}
