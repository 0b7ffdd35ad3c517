//! Demand Pager - Simulation Driver
//!
//! Usage: demand-pager [OPTIONS] <trace_file>
//!
//! Arguments:
//!   trace_file  - Operation trace to run against the simulated machine
//!
//! Options:
//!   --frames N     Physical frames in the pool (default 256)
//!   --swap N       Swap capacity in pages (default 1024)
//!   -v, --verbose  Print each operation and its outcome
//!   -h, --help     Print help information

use std::collections::HashMap;
use std::env;
use std::process;

use demand_pager::constants::{DEFAULT_FRAMES, DEFAULT_SWAP_PAGES};
use demand_pager::file::FileHandle;
use demand_pager::io::{self, TraceOp};
use demand_pager::vm_manager::{VmConfig, VmManager};

struct Config {
    trace_file: String,
    frames: usize,
    swap_pages: usize,
    verbose: bool,
}

fn main() {
    env_logger::init();

    let config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(&config) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn print_help(program: &str) {
    eprintln!("Demand Pager - runs an operation trace against a simulated VM core");
    eprintln!();
    eprintln!("Usage: {} [OPTIONS] <trace_file>", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --frames N     Physical frames in the pool (default {})", DEFAULT_FRAMES);
    eprintln!("  --swap N       Swap capacity in pages (default {})", DEFAULT_SWAP_PAGES);
    eprintln!("  -v, --verbose  Print each operation and its outcome");
    eprintln!("  -h, --help     Print this help message");
}

fn parse_args() -> Result<Config, String> {
    let args: Vec<String> = env::args().collect();
    let program = &args[0];

    let mut frames = DEFAULT_FRAMES;
    let mut swap_pages = DEFAULT_SWAP_PAGES;
    let mut verbose = false;
    let mut positional: Vec<&String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help(program);
                process::exit(0);
            }
            "-v" | "--verbose" => {
                verbose = true;
            }
            "--frames" | "--swap" => {
                let flag = args[i].clone();
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{} requires a value", flag))?
                    .parse::<usize>()
                    .map_err(|_| format!("{} requires a number", flag))?;
                if value == 0 {
                    return Err(format!("{} must be positive", flag));
                }
                if flag == "--frames" {
                    frames = value;
                } else {
                    swap_pages = value;
                }
            }
            arg if arg.starts_with('-') => {
                return Err(format!(
                    "Unknown option: {}\nUse --help for usage information.",
                    arg
                ));
            }
            _ => {
                positional.push(&args[i]);
            }
        }
        i += 1;
    }

    if positional.len() != 1 {
        print_help(program);
        return Err(format!("\nError: Expected 1 argument, got {}", positional.len()));
    }

    Ok(Config {
        trace_file: positional[0].clone(),
        frames,
        swap_pages,
        verbose,
    })
}

fn run(config: &Config) -> Result<(), String> {
    let ops = io::from_file(&config.trace_file).map_err(|e| e.to_string())?;

    if config.verbose {
        eprintln!("=== Demand Pager ===");
        eprintln!("Trace:  {}", config.trace_file);
        eprintln!("Frames: {}", config.frames);
        eprintln!("Swap:   {} pages", config.swap_pages);
        eprintln!("Ops:    {}", ops.len());
        eprintln!();
    }

    let vm = VmManager::new(VmConfig {
        frames: config.frames,
        swap_pages: config.swap_pages,
    });
    let mut files: HashMap<String, FileHandle> = HashMap::new();

    for op in &ops {
        execute(&vm, &mut files, op, config.verbose)?;
    }

    if config.verbose {
        eprintln!();
        eprintln!("=== Summary ===");
    }
    println!("{}", vm.stats());
    Ok(())
}

fn execute(
    vm: &VmManager,
    files: &mut HashMap<String, FileHandle>,
    op: &TraceOp,
    verbose: bool,
) -> Result<(), String> {
    match op {
        TraceOp::File { name, len } => {
            files.insert(name.clone(), FileHandle::with_len(*len));
            if verbose {
                eprintln!("file {} ({} bytes)", name, len);
            }
        }
        TraceOp::Spawn { ctx } => {
            vm.spawn(*ctx);
            if verbose {
                eprintln!("spawn {}", ctx);
            }
        }
        TraceOp::Segment {
            ctx,
            file,
            addr,
            offset,
            read_bytes,
            zero_bytes,
            writable,
        } => {
            let handle = lookup_file(files, file)?;
            vm.register_segment(*ctx, &handle, *addr, *offset, *read_bytes, *zero_bytes, *writable);
            if verbose {
                eprintln!(
                    "segment {} {} at {:#x} ({} read, {} zero)",
                    ctx, file, addr, read_bytes, zero_bytes
                );
            }
        }
        TraceOp::SetSp { ctx, addr } => {
            if let Some(context) = vm.context(*ctx) {
                context.set_user_sp(*addr);
            }
            if verbose {
                eprintln!("setsp {} {:#x}", ctx, addr);
            }
        }
        TraceOp::Read { ctx, addr } => match vm.read_byte(*ctx, *addr) {
            Some(value) => {
                if verbose {
                    eprintln!("read {} {:#x} -> {}", ctx, addr, value);
                }
            }
            None => {
                if verbose {
                    eprintln!("read {} {:#x} -> killed", ctx, addr);
                }
            }
        },
        TraceOp::Write { ctx, addr, value } => {
            let ok = vm.write_byte(*ctx, *addr, *value);
            if verbose {
                if ok {
                    eprintln!("write {} {:#x} <- {}", ctx, addr, value);
                } else {
                    eprintln!("write {} {:#x} -> killed", ctx, addr);
                }
            }
        }
        TraceOp::Mmap { ctx, file, addr } => {
            let handle = lookup_file(files, file)?;
            match vm.register_mapping(*ctx, &handle, *addr) {
                Ok(id) => {
                    if verbose {
                        eprintln!("mmap {} {} at {:#x} -> id {}", ctx, file, addr, id);
                    }
                }
                Err(e) => {
                    if verbose {
                        eprintln!("mmap {} {} at {:#x} -> error: {}", ctx, file, addr, e);
                    }
                }
            }
        }
        TraceOp::Munmap { ctx, id } => {
            vm.unregister_mapping(*ctx, *id);
            if verbose {
                eprintln!("munmap {} {}", ctx, id);
            }
        }
        TraceOp::Exit { ctx } => {
            vm.teardown(*ctx);
            if verbose {
                eprintln!("exit {}", ctx);
            }
        }
    }
    Ok(())
}

fn lookup_file(files: &HashMap<String, FileHandle>, name: &str) -> Result<FileHandle, String> {
    files
        .get(name)
        .map(|f| f.reopen())
        .ok_or_else(|| format!("trace references unknown file: {}", name))
}
