use bpfjit::bpf::opcode::JMP_CALL;
use bpfjit::{BytecodeProgram, CodeMap, JitConfig, compile, compile_to_code};
use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum InputFormat {
    /// Little-endian 8-byte instruction slots
    #[default]
    Raw,
    /// Text listing produced by `llvm-objdump -d`
    Objdump,
}

#[derive(Parser)]
#[command(name = "bpfjit")]
#[command(about = "An eBPF to x86-64 JIT compiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct InputArgs {
    /// The eBPF program to compile
    file: PathBuf,

    /// Input format (raw, objdump)
    #[arg(long, value_enum, default_value = "raw")]
    format: InputFormat,

    /// JIT configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Trace JIT compilation events
    #[arg(long)]
    trace_jit: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a program and run it
    Run {
        #[command(flatten)]
        input: InputArgs,

        /// Value for the next argument register (R1 to R5), may be repeated
        #[arg(long = "arg", value_name = "N", num_args = 1, action = clap::ArgAction::Append)]
        args: Vec<u64>,

        /// Fail unless the program returns this value
        #[arg(long, value_name = "N")]
        expect: Option<u64>,
    },
    /// Print the generated code annotated with the source instructions
    Dump {
        #[command(flatten)]
        input: InputArgs,

        /// Print the code map as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the generated code as a C source file
    EmitC {
        #[command(flatten)]
        input: InputArgs,

        /// Output file (defaults to stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Also emit a main() that calls the code and prints the result
        #[arg(long)]
        harness: bool,
    },
    /// Decode and compile a program without running it
    Check {
        #[command(flatten)]
        input: InputArgs,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { input, args, expect } => run(&input, &args, expect),
        Commands::Dump { input, json } => dump(&input, json),
        Commands::EmitC {
            input,
            output,
            harness,
        } => emit_c(&input, output.as_deref(), harness),
        Commands::Check { input } => check(&input),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn load(input: &InputArgs) -> Result<(BytecodeProgram, JitConfig), String> {
    let mut config = match &input.config {
        Some(path) => JitConfig::load(path).map_err(|e| e.to_string())?,
        None => JitConfig::default(),
    };
    if input.trace_jit {
        config.trace_jit = true;
    }

    let program = read_program(&input.file, input.format)?;
    Ok((program, config))
}

fn read_program(path: &Path, format: InputFormat) -> Result<BytecodeProgram, String> {
    let program = match format {
        InputFormat::Raw => {
            let bytes = std::fs::read(path)
                .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
            BytecodeProgram::from_bytes(&bytes)
        }
        InputFormat::Objdump => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
            BytecodeProgram::from_objdump(&text)
        }
    };
    program.map_err(|e| format!("{}: {}", path.display(), e))
}

fn run(input: &InputArgs, args: &[u64], expect: Option<u64>) -> Result<(), String> {
    if args.len() > 5 {
        return Err(format!("at most 5 arguments are passed (got {})", args.len()));
    }
    let mut regs = [0u64; 5];
    regs[..args.len()].copy_from_slice(args);

    let (program, config) = load(input)?;
    let compiled = compile(&program, &config).map_err(|e| e.to_string())?;
    let entry = compiled.entry();
    // SAFETY: the program is unverified; the caller vouches for it
    let value = unsafe { entry.invoke(regs[0], regs[1], regs[2], regs[3], regs[4]) };
    println!("{}", value);

    match expect {
        Some(expected) if expected != value => {
            Err(format!("expected {}, program returned {}", expected, value))
        }
        _ => Ok(()),
    }
}

fn generate(input: &InputArgs) -> Result<CodeMap, String> {
    let (program, config) = load(input)?;
    compile_to_code(&program, &config, &bpfjit::HelperTable::new()).map_err(|e| e.to_string())
}

fn dump(input: &InputArgs, json: bool) -> Result<(), String> {
    let map = generate(input)?;
    if json {
        println!("{}", map.to_json().map_err(|e| e.to_string())?);
    } else {
        println!("{}", map);
    }
    Ok(())
}

fn emit_c(input: &InputArgs, output: Option<&Path>, harness: bool) -> Result<(), String> {
    let map = generate(input)?;
    if map.instructions.iter().any(|insn| insn.opcode == JMP_CALL) {
        return Err("programs with helper calls cannot be emitted as C".to_string());
    }

    let source = c_source(&map, harness);
    match output {
        Some(path) => std::fs::write(path, source)
            .map_err(|e| format!("failed to write {}: {}", path.display(), e)),
        None => {
            print!("{}", source);
            Ok(())
        }
    }
}

fn c_source(map: &CodeMap, harness: bool) -> String {
    let mut out = String::new();
    out.push_str("#include <stdint.h>\n");
    if harness {
        out.push_str("#include <inttypes.h>\n#include <stdio.h>\n#include <stdlib.h>\n");
    }
    out.push('\n');

    out.push_str(
        "typedef uint64_t (*bpfjit_func_t)(uint64_t, uint64_t, uint64_t, uint64_t, uint64_t);\n\n",
    );
    let _ = writeln!(out, "const uint64_t JIT_CODE_SIZE = {};\n", map.code_size);
    out.push_str("__attribute__((section(\".text\"), aligned(16)))\n");
    out.push_str("const uint8_t JIT_CODE[] = {");
    for (i, byte) in map.code.iter().enumerate() {
        if i % 12 == 0 {
            out.push_str("\n   ");
        }
        let _ = write!(out, " 0x{:02x},", byte);
    }
    out.push_str("\n};\n");

    if harness {
        out.push_str(concat!(
            "\nint main(int argc, char **argv) {\n",
            "    uint64_t args[5] = {0, 0, 0, 0, 0};\n",
            "    for (int i = 1; i < argc && i <= 5; i++) {\n",
            "        args[i - 1] = strtoull(argv[i], NULL, 0);\n",
            "    }\n",
            "    bpfjit_func_t func = (bpfjit_func_t)JIT_CODE;\n",
            "    uint64_t result = func(args[0], args[1], args[2], args[3], args[4]);\n",
            "    printf(\"%\" PRIu64 \"\\n\", result);\n",
            "    return 0;\n",
            "}\n",
        ));
    }
    out
}

fn check(input: &InputArgs) -> Result<(), String> {
    let map = generate(input)?;
    println!(
        "ok: {} instructions, {} bytes of code",
        map.instructions.len(),
        map.code_size
    );
    Ok(())
}
