#![deny(clippy::all)]

use anyhow::{bail, Context};
use boxvm::{
    assemble_listing, assemble_listing_as, RegClass, RegCounts, Vm,
    NUM_REG_CLASSES,
};
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    process,
};
use structopt::StructOpt;

/// Number of global registers made available to listings, per class.
const GLOBAL_REGS: u32 = 16;
/// Number of global variables made available to listings, per class.
const GLOBAL_VARS: u32 = 8;

/// Assemble, link and execute a Box VM listing.
#[derive(Debug, StructOpt)]
#[structopt(name = "boxvm")]
struct Opt {
    /// Input listing; standard input when omitted or `-`
    #[structopt(parse(from_os_str))]
    input: Option<PathBuf>,

    /// Write a disassembly of every installed procedure to this file
    #[structopt(parse(from_os_str), long = "output", short = "o")]
    output: Option<PathBuf>,

    /// Listing assembled (and run) before the input, e.g. library setup
    #[structopt(parse(from_os_str), long = "setup", short = "s")]
    setup: Option<PathBuf>,

    /// Assemble and link-check only; do not execute
    #[structopt(long = "test-only", short = "t")]
    test_only: bool,

    /// Execute even if the link check reports problems
    #[structopt(long = "force", short = "f")]
    force: bool,

    /// Increase verbosity (repeat for more)
    #[structopt(long = "verbose", short = "v", parse(from_occurrences))]
    verbose: u8,
}

fn read_input(path: &Option<PathBuf>) -> anyhow::Result<String> {
    match path {
        Some(path) if path.as_path() != Path::new("-") => {
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read file {:?}", path))
        }
        _ => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("Failed to read standard input")?;
            Ok(source)
        }
    }
}

fn run(opt: Opt) -> anyhow::Result<()> {
    let mut vm = Vm::new();
    vm.dasm_settings(opt.verbose >= 2);

    // Listings get a fixed complement of global registers and variables
    let counts = RegCounts {
        num_reg: [GLOBAL_REGS; NUM_REG_CLASSES],
        num_var: [GLOBAL_VARS; NUM_REG_CLASSES],
    };
    vm.globals_alloc(&counts);

    // The setup listing is assembled first; its entry runs before the
    // program's so it can initialize globals
    let setup_entry = match &opt.setup {
        Some(path) => {
            let source = fs::read_to_string(path)
                .with_context(|| format!("Failed to read file {:?}", path))?;
            let entry = assemble_listing_as(&mut vm, &source, "setup")
                .map_err(|error| anyhow::anyhow!("{:#}", error))?;
            Some(entry)
        }
        None => None,
    };

    let source = read_input(&opt.input)?;
    let main = assemble_listing(&mut vm, &source)
        .map_err(|error| anyhow::anyhow!("{:#}", error))?;

    if opt.verbose >= 1 {
        for warning in vm.warnings() {
            eprintln!("warning: {}", warning);
        }
    }

    // Refuse to run a program with unresolved references, unless forced
    let problems = vm.link_check();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("link error: {}", problem);
        }
        if !opt.force {
            bail!("{} unresolved reference(s)", problems.len());
        }
    }

    if let Some(path) = &opt.output {
        let mut listing = Vec::new();
        vm.disassemble_all(&mut listing)
            .context("Failed to render the disassembly")?;
        fs::write(path, listing)
            .with_context(|| format!("Failed to write file {:?}", path))?;
    }

    if !opt.test_only {
        if let Some(entry) = setup_entry {
            vm.execute(entry).context("Setup failed")?;
        }
        vm.execute(main).context("Execution failed")?;
        if opt.verbose >= 1 {
            eprintln!("executed {} instructions", vm.stats().cycles);
            print_globals(&vm);
        }
    }
    Ok(())
}

/// Show the nonzero global registers, the observable result of a run.
fn print_globals(vm: &Vm) {
    use boxvm::Value;
    for class in RegClass::ALL.iter() {
        for index in 1..=i64::from(GLOBAL_REGS) {
            let value = match vm.global_get(*class, index) {
                Ok(value) => value,
                Err(_) => continue,
            };
            let interesting = !matches!(
                value,
                Value::Char(0)
                    | Value::Int(0)
                    | Value::Obj(boxvm::ObjVal {
                        block: 0,
                        offset: 0
                    })
            ) && value != Value::Real(0.0)
                && value != Value::Point(boxvm::Point { x: 0.0, y: 0.0 });
            if interesting {
                eprintln!("gr{}{} = {:?}", class.tag(), index, value);
            }
        }
    }
}

fn main() {
    let exit_code = match run(Opt::from_args()) {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("{:#}", err);
            1
        }
    };
    process::exit(exit_code);
}
