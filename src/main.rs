//! Dhad Compiler
//!
//! A whole-program compiler for a small imperative language written in
//! Arabic script, emitting x86-64 GNU assembler text for Linux.
//!
//! The pipeline is strictly linear: source text is tokenized, parsed
//! into an AST, validated, and lowered to assembly. Each phase fails on
//! the first error; the assembly file is only written when every phase
//! succeeded.

mod ast;
mod codegen;
mod lexer;
mod parser;
mod semantic;

use clap::Parser as ClapParser;
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(ClapParser, Debug)]
#[command(name = "dhad")]
#[command(version = "0.1.0")]
#[command(about = "Dhad compiler for x86-64 Linux", long_about = None)]
struct Args {
    /// Input source file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Output assembly file (default: input with .s extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print tokens (for debugging)
    #[arg(long)]
    tokens: bool,

    /// Print AST (for debugging)
    #[arg(long)]
    ast: bool,
}

fn main() {
    let args = Args::parse();

    // Read source file
    let source = match fs::read_to_string(&args.input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", args.input.display(), e);
            process::exit(1);
        }
    };

    // Tokenize
    let tokens = match lexer::tokenize(&source) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if args.tokens {
        println!("=== Tokens ===");
        for tok in &tokens {
            println!("{:?}", tok);
        }
        println!();
    }

    // Parse
    let program = match parser::parse(tokens) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if args.ast {
        println!("=== AST ===");
        println!("{:#?}", program);
        println!();
    }

    // Validate
    if let Err(e) = semantic::analyze(&program) {
        eprintln!("{}", e);
        process::exit(1);
    }

    // Generate code
    let mut codegen = codegen::CodeGen::new();
    let asm = match codegen.compile(&program) {
        Ok(asm) => asm,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    // Determine output path
    let asm_path = args.output.clone().unwrap_or_else(|| {
        let mut p = args.input.clone();
        p.set_extension("s");
        p
    });

    // Write assembly output
    match fs::write(&asm_path, &asm) {
        Ok(_) => {
            println!("Compiled {} -> {}", args.input.display(), asm_path.display());
        }
        Err(e) => {
            eprintln!("Error writing {}: {}", asm_path.display(), e);
            process::exit(1);
        }
    }
}
