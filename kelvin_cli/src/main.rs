//! The `kelvin` launcher: parse arguments, build a VM, run `main`, and
//! map the outcome onto the process exit code (0 normal, 127 fatal
//! internal error, 128 uncaught exception).

mod argument;
mod logging;

use argument::Arguments;
use clap::Parser;
use kelvin_vm::{ClassPath, ConfigurationBuilder, Error, Vm, EXIT_FATAL};
use tracing::debug;

fn main() {
    let cli = Arguments::parse();
    logging::initialize();
    std::process::exit(run(cli));
}

fn run(cli: Arguments) -> i32 {
    debug!("kelvin/{}", env!("CARGO_PKG_VERSION"));

    let mut builder = ConfigurationBuilder::new().main_class(cli.mainclass.clone());
    if let Some(classpath) = &cli.classpath {
        builder = builder.class_path(ClassPath::from_string(classpath));
    }
    if let Some(heap_cells) = cli.heap_cells {
        builder = builder.heap_cells(heap_cells);
    }
    builder = builder.collect_on_every_allocation(cli.stress_gc);

    let configuration = match builder.build() {
        Ok(configuration) => configuration,
        Err(error) => return fatal(&error),
    };
    let mut vm = match Vm::new(configuration) {
        Ok(vm) => vm,
        Err(error) => return fatal(&error),
    };
    match vm.invoke_main(&cli.parameters) {
        Ok(code) => code,
        Err(error) => fatal(&error),
    }
}

fn fatal(error: &Error) -> i32 {
    eprintln!("kelvin: {error}");
    EXIT_FATAL
}
