use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use jvm_engine::{GcStrategy, MainError, Vm, VmConfig, config::parse_size};
use log::{debug, error};

/// Runs a compiled class's `public static void main(String[])`.
#[derive(Debug, Parser)]
#[command(name = "java", version, about)]
struct Args {
    /// Directories and jar files to load classes from, `:`-separated.
    #[arg(long = "class-path", visible_aliases = ["cp", "classpath"], env = "CLASSPATH", default_value = "")]
    class_path: String,

    /// Heap budget, e.g. `64m`.
    #[arg(long = "heap-size", env = "JVM_HEAP_SIZE", value_parser = parse_size)]
    heap_size: Option<usize>,

    /// Garbage collector.
    #[arg(long, env = "JVM_GC", value_enum, ignore_case = true)]
    gc: Option<GcStrategy>,

    #[arg(long = "gc-threads")]
    gc_threads: Option<usize>,

    /// Invocations plus loop iterations before a method is compiled; 0
    /// turns the compiler off.
    #[arg(long = "jit-threshold", env = "JVM_JIT_THRESHOLD")]
    jit_threshold: Option<u32>,

    #[arg(long = "jit-workers")]
    jit_workers: Option<usize>,

    /// Interpret only.
    #[arg(long = "int")]
    interpret_only: bool,

    #[arg(long = "max-stack-depth")]
    max_stack_depth: Option<usize>,

    /// Stack size of threads the program starts, e.g. `512k`.
    #[arg(long = "thread-stack-size", value_parser = parse_size)]
    thread_stack_size: Option<usize>,

    /// Directories searched by `System.loadLibrary`, `:`-separated.
    #[arg(long = "library-path", env = "JVM_LIBRARY_PATH")]
    library_path: Option<String>,

    /// Main class, in binary (`pkg.Main`) or internal (`pkg/Main`) form.
    main_class: String,

    /// Arguments passed to `main`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Args {
    fn config(&self) -> VmConfig {
        let mut config = VmConfig {
            class_path: split_paths(&self.class_path),
            ..VmConfig::default()
        };
        if config.class_path.is_empty() {
            config.class_path.push(PathBuf::from("."));
        }
        if let Some(size) = self.heap_size {
            config.heap_size = size;
        }
        if let Some(gc) = self.gc {
            config.gc = gc;
        }
        if let Some(threads) = self.gc_threads {
            config.gc_threads = threads;
        }
        if let Some(threshold) = self.jit_threshold {
            config.jit_threshold = threshold;
        }
        if self.interpret_only {
            config.jit_threshold = 0;
        }
        if let Some(workers) = self.jit_workers {
            config.jit_workers = workers;
        }
        if let Some(depth) = self.max_stack_depth {
            config.max_stack_depth = depth;
        }
        if let Some(size) = self.thread_stack_size {
            config.thread_stack_size = size;
        }
        if let Some(path) = &self.library_path {
            config.native_library_path = split_paths(path);
        }
        config
    }
}

fn split_paths(paths: &str) -> Vec<PathBuf> {
    std::env::split_paths(paths)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let config = args.config();
    debug!("{config:?}");

    let vm = match Vm::new(config) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("Error: could not create the virtual machine: {err}");
            let code = MainError::Startup(err).exit_code();
            return ExitCode::from(code as u8);
        }
    };
    match vm.run_main(&args.main_class, &args.args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match &err {
                MainError::Uncaught { .. } => eprint!("{err}"),
                MainError::Startup(cause) => {
                    eprintln!("Error: could not run main class {}: {cause}", args.main_class)
                }
                MainError::Fatal(cause) => {
                    error!("fatal: {cause:?}");
                    eprintln!("Error: internal error: {cause}")
                }
            }
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("java").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_options_override_defaults() {
        let args = parse(&[
            "--gc", "Parallel", "--heap-size", "2m", "--thread-stack-size", "256k", "--int",
            "--cp", "a:b.jar", "app.Main", "x", "-y",
        ]);
        let config = args.config();
        assert_eq!(config.gc, GcStrategy::Parallel);
        assert_eq!(config.heap_size, 2 << 20);
        assert_eq!(config.thread_stack_size, 256 << 10);
        assert!(!config.jit_enabled());
        assert_eq!(config.class_path, [PathBuf::from("a"), PathBuf::from("b.jar")]);
        assert_eq!(args.main_class, "app.Main");
        assert_eq!(args.args, ["x", "-y"]);
    }

    #[test]
    fn test_bad_values_are_rejected() {
        for bad in [["--gc", "g1", "Main"], ["--heap-size", "12q", "Main"]] {
            let args = std::iter::once("java").chain(bad.iter().copied());
            assert!(Args::try_parse_from(args).is_err(), "{bad:?}");
        }
    }
}
