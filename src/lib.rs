//! crush is a small call-form scripting language: every construct is
//! `name(args…)`, names are 32-bit hashes, and both code and data
//! live in a single stream of NaN-boxed 64-bit words. The pipeline is
//! lexer → parser → compiler → serialized word stream → stack engine.

pub mod ast;
pub mod compiler;
pub mod engine;
pub mod lexer;
pub mod map;
pub mod parser;
pub mod scope;
pub mod word;
pub mod writer;

use std::io::Write;
use std::path::PathBuf;

pub use compiler::{CompileError, Compiler, Fragment};
pub use engine::{Engine, EngineError};
pub use map::CrushMap;
pub use word::{Word, crush};

/// A serialized program plus the symbol table that maps crushed names
/// back to source identifiers for diagnostics.
pub struct Compiled {
    pub program: Vec<Word>,
    pub symbols: CrushMap<String>,
}

/// Parse and compile a source string. `base_dir` anchors `import`
/// paths.
pub fn compile_source(
    source: &str,
    base_dir: impl Into<PathBuf>,
) -> Result<Compiled, CompileError> {
    let root = parser::parse(source)?;
    let mut compiler = Compiler::new(base_dir);
    let fragment = compiler.compile_program(&root)?;
    Ok(Compiled {
        program: fragment.writer.serialize(),
        symbols: compiler.into_symbols(),
    })
}

/// Compile and run in one shot, writing program output to `out`.
/// Returns the program's final value.
pub fn run_source(
    source: &str,
    base_dir: impl Into<PathBuf>,
    out: &mut dyn Write,
) -> Result<Word, EngineError> {
    let base_dir = base_dir.into();
    let compiled = compile_source(source, &base_dir)?;
    Engine::new(compiled.program, compiled.symbols, out)
        .base_dir(base_dir)
        .run()
}
