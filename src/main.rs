use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

/// crush: compile and run call-form scripts on the word engine.
#[derive(Parser)]
#[command(name = "crush", version, about)]
struct Cli {
    /// Path to a script; anything that is not an existing file runs as
    /// inline source
    source: String,

    /// Stop after a pipeline stage and dump its output
    #[arg(long, value_enum)]
    emit: Option<Emit>,

    /// Trace every executed token to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Fix the random number generator seed
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Emit {
    /// Lexer tokens with byte spans
    Tokens,
    /// Program tree as JSON
    Ast,
    /// Serialized words, disassembled
    Code,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let path = PathBuf::from(&cli.source);
    let (source, base_dir) = if path.is_file() {
        let dir = path.parent().map_or_else(|| PathBuf::from("."), PathBuf::from);
        (std::fs::read_to_string(&path)?, dir)
    } else {
        (cli.source.clone(), PathBuf::from("."))
    };

    match cli.emit {
        Some(Emit::Tokens) => {
            for (token, span) in crush::lexer::lex(&source)? {
                println!("{:>3}..{:<3} {token:?}", span.start, span.end);
            }
            return Ok(());
        }
        Some(Emit::Ast) => {
            let root = crush::parser::parse(&source)?;
            println!("{}", serde_json::to_string_pretty(&root)?);
            return Ok(());
        }
        Some(Emit::Code) => {
            let compiled = crush::compile_source(&source, &base_dir)?;
            for (i, word) in compiled.program.iter().enumerate() {
                println!("{i:>5} {}", word.describe());
            }
            return Ok(());
        }
        None => {}
    }

    let compiled = crush::compile_source(&source, &base_dir)?;
    let mut stdout = std::io::stdout().lock();
    let mut engine = crush::Engine::new(compiled.program, compiled.symbols, &mut stdout)
        .base_dir(base_dir)
        .verbose(cli.verbose);
    if let Some(seed) = cli.seed {
        engine = engine.with_seed(seed);
    }
    let result = engine.run()?;
    let rendered = if result == crush::Word::VOID {
        None
    } else {
        Some(engine.render(result)?)
    };
    drop(engine);
    if let Some(text) = rendered {
        use std::io::Write;
        writeln!(stdout, "{text}")?;
    }
    Ok(())
}
