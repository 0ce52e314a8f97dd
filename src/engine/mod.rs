use std::io::Write;
use std::path::PathBuf;

use crate::compiler::{CompileError, Compiler};
use crate::map::CrushMap;
use crate::parser;
use crate::scope::{ScopeChain, ScopeError};
use crate::word::{DataType, Status, Word, WordError, crush, fmt_number, op};
use crate::writer;

// ── Execution engine ────────────────────────────────────────────────
//
// A single-threaded stack machine over a serialized token stream.
// One step reads the token at `pc`, advances, and either pushes it
// (plain value) or dispatches on its opcode class. Jumps are relative
// token counts; call and return go through a separate return stack so
// the operand stack stays purely data.
//
// Strings built at runtime (concat, replace, substring) are appended
// to the program's tail in data-area layout and referenced by offset,
// exactly like compile-time literals. Execution stops at the code end
// recorded on construction, so appended data is never dispatched as
// tokens.

/// Operand-stack bound check runs every this many steps.
const STACK_CHECK_INTERVAL: u64 = 128;

/// When checked, a stack deeper than this is pruned to its most recent
/// entries. Leaked intermediates from expression statements never
/// accumulate past it.
const STACK_KEEP: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Word(#[from] WordError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("return outside of a function call")]
    ReturnOutsideCall,
    #[error("undefined function `{name}`")]
    UndefinedFunction { name: String },
    #[error("function `{name}` is already defined")]
    DuplicateDefinition { name: String },
    #[error("function fell through without returning a value")]
    MissingReturn,
    #[error("`{function}` expects {expected} argument(s), got {got}")]
    Arity { function: String, expected: usize, got: usize },
    #[error("assertion failed: {message}")]
    AssertionFailed { message: String },
    #[error("`{op}` needs at least two arguments")]
    UnsupportedUnary { op: char },
    #[error("string data at offset {offset} is corrupt")]
    CorruptString { offset: u64 },
    #[error("jump target out of range")]
    BadJump,
    #[error("unrecognized instruction: {0}")]
    UnknownOpcode(String),
}

type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Equal,
    NotEqual,
    Less,
    Greater,
    Assert,
    Random,
    Eval,
    Call,
    Not,
    Or,
    And,
    Print,
    Substring,
    Length,
    Replace,
    Concat,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

const BUILTINS: &[(&str, Builtin)] = &[
    ("=", Builtin::Equal),
    ("equals", Builtin::Equal),
    ("<>", Builtin::NotEqual),
    ("not-equal", Builtin::NotEqual),
    ("<", Builtin::Less),
    (">", Builtin::Greater),
    ("assert", Builtin::Assert),
    ("random", Builtin::Random),
    ("eval", Builtin::Eval),
    ("call", Builtin::Call),
    ("not", Builtin::Not),
    ("or", Builtin::Or),
    ("and", Builtin::And),
    ("print", Builtin::Print),
    ("substring", Builtin::Substring),
    ("length", Builtin::Length),
    ("replace", Builtin::Replace),
    ("concat", Builtin::Concat),
    ("+", Builtin::Add),
    ("-", Builtin::Sub),
    ("*", Builtin::Mul),
    ("/", Builtin::Div),
    ("%", Builtin::Mod),
];

#[derive(Debug, Clone, Copy)]
enum FunctionDef {
    /// User definition: body start as absolute token index.
    Custom { start: usize, params: u16 },
    Builtin(Builtin),
}

pub struct Engine<'io> {
    program: Vec<Word>,
    /// Token count of the program as loaded. Runtime string
    /// allocations grow `program` past this; `pc` never crosses it.
    code_end: usize,
    symbols: CrushMap<String>,
    functions: CrushMap<FunctionDef>,
    scopes: ScopeChain,
    stack: Vec<Word>,
    return_stack: Vec<usize>,
    pc: usize,
    steps: u64,
    rng: fastrand::Rng,
    out: &'io mut dyn Write,
    verbose: bool,
    base_dir: PathBuf,
}

impl<'io> Engine<'io> {
    pub fn new(program: Vec<Word>, symbols: CrushMap<String>, out: &'io mut dyn Write) -> Self {
        Self::with_scopes(program, symbols, ScopeChain::new(), out)
    }

    fn with_scopes(
        program: Vec<Word>,
        symbols: CrushMap<String>,
        scopes: ScopeChain,
        out: &'io mut dyn Write,
    ) -> Self {
        let mut functions = CrushMap::new();
        for &(name, b) in BUILTINS {
            functions.replace(crush(name), FunctionDef::Builtin(b));
        }
        let code_end = program.len();
        Engine {
            program,
            code_end,
            symbols,
            functions,
            scopes,
            stack: Vec::new(),
            return_stack: Vec::new(),
            pc: 0,
            steps: 0,
            rng: fastrand::Rng::new(),
            out,
            verbose: false,
            base_dir: PathBuf::from("."),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = fastrand::Rng::with_seed(seed);
        self
    }

    pub fn verbose(mut self, on: bool) -> Self {
        self.verbose = on;
        self
    }

    /// Directory `import` inside an `eval` resolves against.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn stack(&self) -> &[Word] {
        &self.stack
    }

    pub fn scopes(&self) -> &ScopeChain {
        &self.scopes
    }

    /// Run to the end of the program; the result is the value left on
    /// top of the stack, or void for a program that leaves none.
    pub fn run(&mut self) -> Result<Word> {
        while self.step()? {}
        Ok(self.stack.last().copied().unwrap_or(Word::VOID))
    }

    /// Execute one token. Returns false once past the code end.
    pub fn step(&mut self) -> Result<bool> {
        if self.pc >= self.code_end {
            return Ok(false);
        }
        self.steps += 1;
        if self.steps % STACK_CHECK_INTERVAL == 0 && self.stack.len() > STACK_KEEP {
            let excess = self.stack.len() - STACK_KEEP;
            self.stack.drain(..excess);
        }

        let word = self.program[self.pc];
        if self.verbose {
            eprintln!("{:>6} @{:<5} {:<28} {:?}", self.steps, self.pc, word.describe(), self.stack);
        }
        self.pc += 1;

        if !word.is_opcode() {
            self.stack.push(word);
            return Ok(true);
        }

        match word.op_class() {
            op::CLASS_FUNCTION => match word.op_action() {
                op::FN_CALL => self.op_call(word.op_p1())?,
                op::FN_DEFINE => self.op_define(word.op_p1(), word.op_p2())?,
                _ => return Err(EngineError::UnknownOpcode(word.describe())),
            },
            op::CLASS_CONTROL => match word.op_action() {
                op::CTRL_SKIP => self.pc += word.op_wide() as usize,
                op::CTRL_COMPARE_SKIP => {
                    let condition = self.pop()?;
                    if !self.truthy(condition) {
                        self.pc += word.op_wide() as usize;
                    }
                }
                op::CTRL_JUMP_BACK => {
                    self.pc = self
                        .pc
                        .checked_sub(word.op_wide() as usize)
                        .ok_or(EngineError::BadJump)?;
                }
                op::CTRL_RETURN => {
                    let addr = self.return_stack.pop().ok_or(EngineError::ReturnOutsideCall)?;
                    self.scopes.drop_scope();
                    self.pc = addr;
                }
                op::CTRL_TRAP => return Err(EngineError::MissingReturn),
                _ => return Err(EngineError::UnknownOpcode(word.describe())),
            },
            op::CLASS_COMPARE => {
                let args = self.pop_args(word.op_p1())?;
                if !self.fold_compare(word.op_action(), &args)? {
                    self.pc += word.op_p2() as usize;
                }
            }
            op::CLASS_MEMORY => self.op_memory(word)?,
            op::CLASS_INCREMENT => {
                self.scopes.mutate_number(word.op_wide(), word.op_action() as i8)?;
            }
            _ => return Err(EngineError::UnknownOpcode(word.describe())),
        }
        Ok(true)
    }

    // ── Dispatch helpers ────────────────────────────────────────────

    fn pop(&mut self) -> Result<Word> {
        self.stack.pop().ok_or(EngineError::StackUnderflow)
    }

    /// Pop `argc` values, restoring evaluation order.
    fn pop_args(&mut self, argc: u16) -> Result<Vec<Word>> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }

    fn op_call(&mut self, argc: u16) -> Result<()> {
        let name = self.pop()?;
        if !matches!(name.data_type(), Ok(DataType::Name)) {
            return Err(EngineError::UnknownOpcode(name.describe()));
        }
        let hash = name.as_name();
        let args = self.pop_args(argc)?;
        self.invoke(hash, args)
    }

    fn invoke(&mut self, hash: u32, args: Vec<Word>) -> Result<()> {
        match self.functions.try_get(hash).copied() {
            None => Err(EngineError::UndefinedFunction { name: self.symbol_name(hash) }),
            Some(FunctionDef::Custom { start, params }) => {
                if args.len() != params as usize {
                    return Err(EngineError::Arity {
                        function: self.symbol_name(hash),
                        expected: params as usize,
                        got: args.len(),
                    });
                }
                self.scopes.push_scope(&args)?;
                self.return_stack.push(self.pc);
                self.pc = start;
                Ok(())
            }
            Some(FunctionDef::Builtin(b)) => {
                let result = self.builtin(b, args)?;
                if result != Word::VOID {
                    self.stack.push(result);
                }
                Ok(())
            }
        }
    }

    /// Registration happens when execution reaches the define opcode;
    /// the body is then skipped over.
    fn op_define(&mut self, argc: u16, skip: u16) -> Result<()> {
        let name = self.pop()?;
        if !matches!(name.data_type(), Ok(DataType::Name)) {
            return Err(EngineError::UnknownOpcode(name.describe()));
        }
        let hash = name.as_name();
        if self.functions.contains_key(hash) {
            return Err(EngineError::DuplicateDefinition { name: self.symbol_name(hash) });
        }
        self.functions
            .replace(hash, FunctionDef::Custom { start: self.pc, params: argc });
        self.pc += skip as usize;
        Ok(())
    }

    fn op_memory(&mut self, word: Word) -> Result<()> {
        let hash = word.op_wide();
        match word.op_action() {
            op::MEM_GET => {
                let value = self.scopes.resolve(hash)?;
                self.stack.push(value);
            }
            op::MEM_SET => {
                let value = self.pop()?;
                self.scopes.set_value(hash, value);
            }
            op::MEM_ISSET => self.stack.push(Word::boolean(self.scopes.can_resolve(hash))),
            op::MEM_UNSET => {
                self.scopes.remove(hash);
            }
            op::MEM_INDEX => {
                let index = self.pop()?;
                let index = self.to_number(index);
                let value = self.scopes.resolve(hash)?;
                let text = self.stringify(value)?;
                let picked = if index >= 0.0 { text.chars().nth(index as usize) } else { None };
                let result = match picked {
                    Some(c) => self.alloc_string(&c.to_string())?,
                    None => Word::status(Status::NotAResult),
                };
                self.stack.push(result);
            }
            _ => return Err(EngineError::UnknownOpcode(word.describe())),
        }
        Ok(())
    }

    /// Render a value the way `print` would. The CLI uses this for a
    /// program's final value.
    pub fn render(&self, word: Word) -> Result<String> {
        self.stringify(word)
    }

    fn symbol_name(&self, hash: u32) -> String {
        self.symbols
            .try_get(hash)
            .cloned()
            .unwrap_or_else(|| format!("#{hash:08x}"))
    }

    // ── Value casting ───────────────────────────────────────────────

    /// Chase variable references to the value they name. Unresolvable
    /// or cyclic references come back unchanged.
    fn deref(&self, mut word: Word) -> Word {
        let mut hops = 0;
        while matches!(word.data_type(), Ok(DataType::Name)) && hops < 32 {
            match self.scopes.resolve(word.as_name()) {
                Ok(next) if next != word => word = next,
                _ => break,
            }
            hops += 1;
        }
        word
    }

    fn truthy(&self, word: Word) -> bool {
        let word = self.deref(word);
        match word.data_type() {
            Ok(DataType::Number) => word.as_number().abs() > f64::EPSILON,
            Ok(DataType::Int) => word.as_int() != 0,
            Ok(DataType::Uint) => word.as_uint() != 0,
            Ok(DataType::ShortStr) => truthy_str(&word.as_short_str()),
            Ok(DataType::StrRef) => self.load_string(word).map(|s| truthy_str(&s)).unwrap_or(false),
            _ => false,
        }
    }

    fn to_number(&self, word: Word) -> f64 {
        let word = self.deref(word);
        match word.data_type() {
            Ok(DataType::Number) => word.as_number(),
            Ok(DataType::Int) => f64::from(word.as_int()),
            Ok(DataType::Uint) => f64::from(word.as_uint()),
            Ok(DataType::ShortStr) => word.as_short_str().trim().parse().unwrap_or(f64::NAN),
            Ok(DataType::StrRef) => self
                .load_string(word)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    fn stringify(&self, word: Word) -> Result<String> {
        let word = self.deref(word);
        Ok(match word.data_type() {
            Ok(DataType::Number) => fmt_number(word.as_number()),
            Ok(DataType::Int) => word.as_int().to_string(),
            Ok(DataType::Uint) => word.as_uint().to_string(),
            Ok(DataType::ShortStr) => word.as_short_str(),
            Ok(DataType::StrRef) => self.load_string(word)?,
            Ok(DataType::Opcode) => word.describe(),
            _ => String::new(),
        })
    }

    fn load_string(&self, word: Word) -> Result<String> {
        let offset = word.as_str_offset();
        writer::read_string(&self.program, offset as usize)
            .ok_or(EngineError::CorruptString { offset })
    }

    /// Short strings pack in place; longer (or non-ASCII) ones are
    /// appended to the program tail as fresh allocations.
    fn alloc_string(&mut self, s: &str) -> Result<Word> {
        if let Ok(packed) = Word::short_str(s) {
            return Ok(packed);
        }
        let offset = writer::append_string(&mut self.program, s);
        Ok(Word::str_ref(offset))
    }

    // ── Comparison ──────────────────────────────────────────────────

    /// Pairwise in order, failing fast: `<(a b c)` is a < b && b < c.
    fn fold_compare(&self, action: u8, args: &[Word]) -> Result<bool> {
        for pair in args.windows(2) {
            if !self.compare(action, pair[0], pair[1])? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn compare(&self, action: u8, a: Word, b: Word) -> Result<bool> {
        let a = self.deref(a);
        let b = self.deref(b);
        Ok(match action {
            op::CMP_EQUAL => self.values_equal(a, b)?,
            op::CMP_NOT_EQUAL => !self.values_equal(a, b)?,
            op::CMP_LESS => self.to_number(a) < self.to_number(b),
            op::CMP_GREATER => self.to_number(a) > self.to_number(b),
            _ => return Err(EngineError::UnknownOpcode(format!("compare action {action:#x}"))),
        })
    }

    /// Two strings compare textually; any other combination compares
    /// numerically, so `"5"` equals `5`.
    fn values_equal(&self, a: Word, b: Word) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        let stringish =
            |w: Word| matches!(w.data_type(), Ok(DataType::ShortStr | DataType::StrRef));
        if stringish(a) && stringish(b) {
            return Ok(self.stringify(a)? == self.stringify(b)?);
        }
        let (x, y) = (self.to_number(a), self.to_number(b));
        Ok((x - y).abs() <= f64::EPSILON)
    }

    // ── Builtins ────────────────────────────────────────────────────

    fn builtin(&mut self, b: Builtin, args: Vec<Word>) -> Result<Word> {
        match b {
            Builtin::Equal => Ok(Word::boolean(self.fold_compare(op::CMP_EQUAL, &args)?)),
            Builtin::NotEqual => Ok(Word::boolean(self.fold_compare(op::CMP_NOT_EQUAL, &args)?)),
            Builtin::Less => Ok(Word::boolean(self.fold_compare(op::CMP_LESS, &args)?)),
            Builtin::Greater => Ok(Word::boolean(self.fold_compare(op::CMP_GREATER, &args)?)),

            Builtin::Assert => {
                let ok = args.first().is_some_and(|&w| self.truthy(w));
                if ok {
                    return Ok(Word::VOID);
                }
                let mut parts = Vec::new();
                for &w in args.iter().skip(1) {
                    parts.push(self.stringify(w)?);
                }
                let message = if parts.is_empty() {
                    "condition was false".to_string()
                } else {
                    parts.join(" ")
                };
                Err(EngineError::AssertionFailed { message })
            }

            Builtin::Random => {
                let n = match args.len() {
                    0 => self.rng.f64(),
                    1 => self.rng.f64() * self.to_number(args[0]),
                    _ => {
                        let lo = self.to_number(args[0]);
                        let hi = self.to_number(args[1]);
                        lo + self.rng.f64() * (hi - lo)
                    }
                };
                Ok(Word::number(n))
            }

            Builtin::Eval => self.eval(args),

            Builtin::Call => {
                let name = self.stringify(args.first().copied().unwrap_or(Word::VOID))?;
                let rest = args.get(1..).unwrap_or_default().to_vec();
                self.invoke(crush(&name), rest)?;
                // a custom callee pushes its own result after returning
                Ok(Word::VOID)
            }

            Builtin::Not => Ok(Word::boolean(!args.first().is_some_and(|&w| self.truthy(w)))),
            Builtin::Or => Ok(Word::boolean(args.iter().any(|&w| self.truthy(w)))),
            Builtin::And => {
                Ok(Word::boolean(!args.is_empty() && args.iter().all(|&w| self.truthy(w))))
            }

            Builtin::Print => {
                let mut text = String::new();
                let mut last = String::new();
                for &w in &args {
                    last = self.stringify(w)?;
                    text.push_str(&last);
                }
                // a trailing empty string suppresses the newline
                if args.is_empty() || !last.is_empty() {
                    text.push('\n');
                }
                self.out.write_all(text.as_bytes())?;
                Ok(Word::VOID)
            }

            Builtin::Substring => {
                let s = self.stringify(args.first().copied().unwrap_or(Word::VOID))?;
                let start = self.to_number(args.get(1).copied().unwrap_or(Word::number(0.0)));
                let start = if start >= 0.0 { start as usize } else { 0 };
                let taken: String = match args.get(2) {
                    Some(&len) => {
                        let len = self.to_number(len).max(0.0) as usize;
                        s.chars().skip(start).take(len).collect()
                    }
                    None => s.chars().skip(start).collect(),
                };
                self.alloc_string(&taken)
            }

            Builtin::Length => {
                let s = self.stringify(args.first().copied().unwrap_or(Word::VOID))?;
                Ok(Word::number(s.chars().count() as f64))
            }

            Builtin::Replace => {
                let s = self.stringify(args.first().copied().unwrap_or(Word::VOID))?;
                let from = self.stringify(args.get(1).copied().unwrap_or(Word::VOID))?;
                let to = self.stringify(args.get(2).copied().unwrap_or(Word::VOID))?;
                if from.is_empty() {
                    return self.alloc_string(&s);
                }
                self.alloc_string(&s.replace(&from, &to))
            }

            Builtin::Concat => {
                let mut joined = String::new();
                for &w in &args {
                    joined.push_str(&self.stringify(w)?);
                }
                self.alloc_string(&joined)
            }

            Builtin::Add => self.arithmetic('+', &args),
            Builtin::Sub => self.arithmetic('-', &args),
            Builtin::Mul => self.arithmetic('*', &args),
            Builtin::Div => self.arithmetic('/', &args),
            Builtin::Mod => self.arithmetic('%', &args),
        }
    }

    /// N-ary left fold. Unary minus negates, unary `%` is mod 2,
    /// unary `*` and `/` have no meaning.
    fn arithmetic(&self, opc: char, args: &[Word]) -> Result<Word> {
        let nums: Vec<f64> = args.iter().map(|&w| self.to_number(w)).collect();
        let n = match (opc, nums.as_slice()) {
            (_, []) => {
                return Err(EngineError::Arity {
                    function: opc.to_string(),
                    expected: 1,
                    got: 0,
                });
            }
            ('+', [x]) => *x,
            ('-', [x]) => -x,
            ('%', [x]) => x % 2.0,
            ('*' | '/', [_]) => return Err(EngineError::UnsupportedUnary { op: opc }),
            (_, [first, rest @ ..]) => rest.iter().fold(*first, |acc, &x| match opc {
                '+' => acc + x,
                '-' => acc - x,
                '*' => acc * x,
                '/' => acc / x,
                _ => acc % x,
            }),
        };
        Ok(Word::number(n))
    }

    /// Compile and run a source string in a child engine. The child
    /// sees a flattened copy of the caller's variables; changes made
    /// inside never propagate back, and the caller's user-defined
    /// functions are out of reach.
    fn eval(&mut self, args: Vec<Word>) -> Result<Word> {
        let source = self.stringify(args.first().copied().unwrap_or(Word::VOID))?;
        let root = parser::parse(&source).map_err(CompileError::from)?;
        let mut compiler = Compiler::new(self.base_dir.clone());
        let fragment = compiler.compile_program(&root)?;
        let program = fragment.writer.serialize();
        let symbols = compiler.into_symbols();

        let scopes = ScopeChain::from_parent(&self.scopes);
        let rng = self.rng.fork();
        let verbose = self.verbose;
        let base_dir = self.base_dir.clone();
        let mut child = Engine::with_scopes(program, symbols, scopes, &mut *self.out);
        child.rng = rng;
        child.verbose = verbose;
        child.base_dir = base_dir;
        child.run()
    }
}

fn truthy_str(s: &str) -> bool {
    !(s.is_empty() || s.eq_ignore_ascii_case("false") || s == "0")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (Word, String) {
        run_seeded(source, 7)
    }

    fn run_seeded(source: &str, seed: u64) -> (Word, String) {
        let root = parser::parse(source).unwrap();
        let mut compiler = Compiler::new(".");
        let fragment = compiler.compile_program(&root).unwrap();
        let program = fragment.writer.serialize();
        let symbols = compiler.into_symbols();
        let mut out = Vec::new();
        let result = Engine::new(program, symbols, &mut out)
            .with_seed(seed)
            .run()
            .unwrap();
        (result, String::from_utf8(out).unwrap())
    }

    fn run_err(source: &str) -> EngineError {
        let root = parser::parse(source).unwrap();
        let mut compiler = Compiler::new(".");
        let fragment = compiler.compile_program(&root).unwrap();
        let program = fragment.writer.serialize();
        let symbols = compiler.into_symbols();
        let mut out = Vec::new();
        Engine::new(program, symbols, &mut out).run().unwrap_err()
    }

    #[test]
    fn literal_is_final_value() {
        let (result, _) = run("42");
        assert_eq!(result, Word::number(42.0));
    }

    #[test]
    fn arithmetic_folds_left() {
        assert_eq!(run("+(1 2 3)").0, Word::number(6.0));
        assert_eq!(run("-(10 3 2)").0, Word::number(5.0));
        assert_eq!(run("*(2 3 4)").0, Word::number(24.0));
        assert_eq!(run("/(20 2 5)").0, Word::number(2.0));
        assert_eq!(run("%(10 3)").0, Word::number(1.0));
    }

    #[test]
    fn unary_arithmetic() {
        assert_eq!(run("-(5)").0, Word::number(-5.0));
        assert_eq!(run("%(5)").0, Word::number(1.0));
        assert!(matches!(run_err("*(5)"), EngineError::UnsupportedUnary { op: '*' }));
    }

    #[test]
    fn set_get_print() {
        let (_, output) = run("set(x 5) print(get(x))");
        assert_eq!(output, "5\n");
    }

    #[test]
    fn set_of_name_is_a_live_reference() {
        // y holds a reference to x, so a later change to x shows
        // through y
        let (_, output) = run("set(x 5) set(y x) set(x 7) print(get(y))");
        assert_eq!(output, "7\n");
    }

    #[test]
    fn unset_then_isset() {
        let (result, _) = run("set(x 1) unset(x) isset(x)");
        assert_eq!(result, Word::FALSE);
    }

    #[test]
    fn reading_unset_variable_is_fatal() {
        assert!(matches!(run_err("get(missing)"), EngineError::Scope(_)));
    }

    #[test]
    fn if_skips_false_body() {
        let (_, output) = run("if(=(1 2) print(\"skipped\")) print(\"done\")");
        assert_eq!(output, "done\n");
    }

    #[test]
    fn if_runs_true_body() {
        let (_, output) = run("if(=(1 1) print(\"yes\"))");
        assert_eq!(output, "yes\n");
    }

    #[test]
    fn while_counts_down() {
        let (_, output) = run("set(i 3) while(>(get(i) 0) set(i -(i 1))) print(get(i))");
        assert_eq!(output, "0\n");
    }

    #[test]
    fn while_body_runs_per_iteration() {
        let (_, output) = run("set(i 0) while(<(get(i) 3) print(get(i)) set(i +(i 1)))");
        assert_eq!(output, "0\n1\n2\n");
    }

    #[test]
    fn increment_opcode_updates_in_place() {
        let (_, output) = run("set(x 1) set(x +(x 10)) print(get(x))");
        assert_eq!(output, "11\n");
    }

    #[test]
    fn function_defines_and_calls() {
        let (result, output) =
            run("def(add (a b) (return(+(get(a) get(b))))) print(add(2 3)) add(4 5)");
        assert_eq!(output, "5\n");
        assert_eq!(result, Word::number(9.0));
    }

    #[test]
    fn function_params_are_positional() {
        // the body refers to params by bare name; they resolve through
        // the positional bindings of the call scope
        let (result, _) = run("def(first (a b) (return(a))) first(\"x\" \"y\")");
        assert_eq!(result, Word::short_str("x").unwrap());
    }

    #[test]
    fn recursion_works() {
        let source = "
            def(fact (n) (
                if(<(get(n) 2) return(1))
                return(*(get(n) fact(-(n 1))))
            ))
            fact(6)
        ";
        assert_eq!(run(source).0, Word::number(720.0));
    }

    #[test]
    fn runaway_recursion_is_fatal() {
        let source = "def(loop () (return(loop()))) loop()";
        assert!(matches!(run_err(source), EngineError::Scope(ScopeError::DepthExceeded)));
    }

    #[test]
    fn value_function_falling_through_traps() {
        let source = "def(f (n) (if(>(get(n) 0) return(1)))) f(0)";
        assert!(matches!(run_err(source), EngineError::MissingReturn));
    }

    #[test]
    fn duplicate_definition_is_fatal() {
        let source = "def(f () (return(1))) def(f () (return(2)))";
        assert!(matches!(run_err(source), EngineError::DuplicateDefinition { .. }));
    }

    #[test]
    fn undefined_function_names_the_source_symbol() {
        match run_err("nope(1)") {
            EngineError::UndefinedFunction { name } => assert_eq!(name, "nope"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn arity_mismatch_is_fatal() {
        let source = "def(f (a) (return(get(a)))) f(1 2)";
        assert!(matches!(run_err(source), EngineError::Arity { .. }));
    }

    #[test]
    fn comparisons_fold_pairwise() {
        assert_eq!(run("<(1 2 3)").0, Word::TRUE);
        assert_eq!(run("<(1 3 2)").0, Word::FALSE);
        assert_eq!(run("=(2 2 2)").0, Word::TRUE);
        assert_eq!(run("<>(1 2)").0, Word::TRUE);
        assert_eq!(run(">(3 2 1)").0, Word::TRUE);
    }

    #[test]
    fn string_and_number_compare_numerically() {
        assert_eq!(run("=(\"5\" 5)").0, Word::TRUE);
        assert_eq!(run("=(\"hello\" \"hello\")").0, Word::TRUE);
        assert_eq!(run("=(\"hello\" \"world\")").0, Word::FALSE);
    }

    #[test]
    fn stored_boolean_literal_keeps_its_truth() {
        let (_, output) = run("set(x true) if(x print(\"yes\")) print(\"done\")");
        assert_eq!(output, "yes\ndone\n");
        let (_, output) = run("set(x false) if(x print(\"yes\")) print(\"done\")");
        assert_eq!(output, "done\n");
    }

    #[test]
    fn logic_builtins() {
        assert_eq!(run("not(false)").0, Word::TRUE);
        assert_eq!(run("or(false true)").0, Word::TRUE);
        assert_eq!(run("and(true false)").0, Word::FALSE);
        assert_eq!(run("and(1 \"yes\")").0, Word::TRUE);
    }

    #[test]
    fn truthiness_of_strings() {
        assert_eq!(run("not(\"\")").0, Word::TRUE);
        assert_eq!(run("not(\"FALSE\")").0, Word::TRUE);
        assert_eq!(run("not(\"0\")").0, Word::TRUE);
        assert_eq!(run("not(\"x\")").0, Word::FALSE);
    }

    #[test]
    fn string_builtins() {
        assert_eq!(run("length(\"hello\")").0, Word::number(5.0));
        let (result, _) = run("concat(\"foo\" \"bar\")");
        assert_eq!(result, Word::short_str("foobar").unwrap());
        let (_, output) = run("print(substring(\"example\" 0 3))");
        assert_eq!(output, "exa\n");
        let (_, output) = run("print(replace(\"a tale of tails\" \"ta\" \"sn\"))");
        assert_eq!(output, "a snle of snils\n");
    }

    #[test]
    fn runtime_strings_allocate_on_the_program_tail() {
        let (_, output) = run("set(s concat(\"longer than \" \"six bytes\")) print(get(s))");
        assert_eq!(output, "longer than six bytes\n");
    }

    #[test]
    fn tail_allocations_are_never_executed() {
        // the allocation grows the program past the loaded code; the
        // final value must be the string reference, not the raw data
        // words behind it
        let root = parser::parse("concat(\"aaaaaaaa\" \"bb\")").unwrap();
        let mut compiler = Compiler::new(".");
        let fragment = compiler.compile_program(&root).unwrap();
        let program = fragment.writer.serialize();
        let symbols = compiler.into_symbols();
        let mut out = Vec::new();
        let mut engine = Engine::new(program, symbols, &mut out);
        let result = engine.run().unwrap();
        assert!(matches!(result.data_type(), Ok(DataType::StrRef)));
        assert_eq!(engine.render(result).unwrap(), "aaaaaaaabb");
    }

    #[test]
    fn indexed_read() {
        let (_, output) = run("set(s \"example\") print(get(s 2))");
        assert_eq!(output, "a\n");
        let (result, _) = run("set(s \"ab\") get(s 9)");
        assert_eq!(result, Word::status(Status::NotAResult));
    }

    #[test]
    fn print_concatenates_and_terminates() {
        let (_, output) = run("print(\"a\" 1 \"b\")");
        assert_eq!(output, "a1b\n");
    }

    #[test]
    fn trailing_empty_string_suppresses_newline() {
        let (_, output) = run("print(\"a\" \"\") print(\"b\")");
        assert_eq!(output, "ab\n");
    }

    #[test]
    fn assert_passes_and_fails() {
        let (result, _) = run("assert(=(1 1))");
        assert_eq!(result, Word::VOID);
        match run_err("assert(false \"boom\" 7)") {
            EngineError::AssertionFailed { message } => assert_eq!(message, "boom 7"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn random_is_seed_stable() {
        let a = run_seeded("random(10)", 42).0;
        let b = run_seeded("random(10)", 42).0;
        assert_eq!(a, b);
        let n = a.as_number();
        assert!((0.0..10.0).contains(&n));
        let ranged = run_seeded("random(5 6)", 42).0.as_number();
        assert!((5.0..6.0).contains(&ranged));
    }

    #[test]
    fn eval_sees_caller_variables() {
        let (_, output) = run("set(x 2) print(eval(\"+(x 3)\"))");
        assert_eq!(output, "5\n");
    }

    #[test]
    fn eval_changes_do_not_propagate() {
        let (_, output) = run("set(x 2) eval(\"set(x 99)\") print(get(x))");
        assert_eq!(output, "2\n");
    }

    #[test]
    fn call_by_name() {
        let (_, output) = run("def(double (n) (return(+(n n)))) print(call(\"double\" 4))");
        assert_eq!(output, "8\n");
    }

    #[test]
    fn call_of_undefined_name_is_fatal() {
        assert!(matches!(run_err("call(\"nope\")"), EngineError::UndefinedFunction { .. }));
    }

    #[test]
    fn call_of_builtin_by_name() {
        let (result, _) = run("call(\"+\" 2 3)");
        assert_eq!(result, Word::number(5.0));
    }

    #[test]
    fn pick_selects_first_match() {
        let source = "
            set(n 7)
            pick(
                if(<(get(n) 5) \"small\")
                if(<(get(n) 10) \"medium\")
                if(true \"large\")
            )
        ";
        assert_eq!(run(source).0, Word::short_str("medium").unwrap());
    }

    #[test]
    fn stack_is_pruned_in_long_loops() {
        // each iteration leaks one literal onto the stack
        let source = "set(i 0) while(<(get(i) 500) set(i +(i 1)) 7)";
        let root = parser::parse(source).unwrap();
        let mut compiler = Compiler::new(".");
        let fragment = compiler.compile_program(&root).unwrap();
        let program = fragment.writer.serialize();
        let symbols = compiler.into_symbols();
        let mut out = Vec::new();
        let mut engine = Engine::new(program, symbols, &mut out);
        engine.run().unwrap();
        assert!(engine.stack().len() <= STACK_KEEP + STACK_CHECK_INTERVAL as usize);
    }

    #[test]
    fn dropped_scope_strings_become_garbage() {
        let source = "def(f () (set(local concat(\"not short at\" \" all\")))) f()";
        let root = parser::parse(source).unwrap();
        let mut compiler = Compiler::new(".");
        let fragment = compiler.compile_program(&root).unwrap();
        let program = fragment.writer.serialize();
        let symbols = compiler.into_symbols();
        let mut out = Vec::new();
        let mut engine = Engine::new(program, symbols, &mut out);
        engine.run().unwrap();
        assert_eq!(engine.scopes().potential_garbage().len(), 1);
    }

    #[test]
    fn single_stepping_matches_run() {
        let root = parser::parse("set(x 1) get(x)").unwrap();
        let mut compiler = Compiler::new(".");
        let fragment = compiler.compile_program(&root).unwrap();
        let program = fragment.writer.serialize();
        let symbols = compiler.into_symbols();
        let mut out = Vec::new();
        let mut engine = Engine::new(program, symbols, &mut out);
        let mut steps = 0;
        while engine.step().unwrap() {
            steps += 1;
        }
        assert!(steps > 0);
        assert_eq!(engine.stack().last(), Some(&Word::number(1.0)));
    }
}
