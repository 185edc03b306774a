//! `wavm run`: load a module (binary, text or precompiled), link it against
//! the ABI its imports ask for, instantiate it and invoke its entry point.

use crate::utils::{is_wasm_binary, read_file_contents};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use structopt::StructOpt;
use wavm_interp_backend::InterpCompiler;
use wavm_runtime_core::{
    backend::Compiler,
    compartment::Compartment,
    context::Context,
    error::RuntimeError,
    features::{feature_list_help_text, parse_and_set_feature, FeatureSpec},
    instance::Instance,
    invoke::{catch_runtime_exceptions, invoke_function_checked},
    linker::{link_module, LinkResult, NullResolver, RootResolver},
    module::Module,
    object::Function,
    types::{Type, Value},
};
use wavm_wasi::SyscallTraceLevel;

/// The user section a precompiled module carries its object code in.
pub const PRECOMPILED_SECTION_NAME: &str = "wavm.precompiled_object";

const EXIT_FAILURE: i32 = 1;

/// Run a WebAssembly file. Formats accepted: wasm, wast
#[derive(Debug, StructOpt)]
pub struct Run {
    /// Specify function name to run in module (default:main)
    #[structopt(short = "f", long = "function")]
    pub function: Option<String>,

    /// Use precompiled object code in program file
    #[structopt(long = "precompiled")]
    pub precompiled: bool,

    /// Enable the specified feature
    #[structopt(long = "enable", number_of_values = 1)]
    pub enable: Vec<String>,

    /// Specifies the ABI used by the WASM module: bare, emscripten or wasi.
    /// The default is to detect the ABI based on the module imports/exports
    #[structopt(long = "abi")]
    pub abi: Option<String>,

    /// Mounts a directory as the WASI root directory
    #[structopt(long = "mount-root", parse(from_os_str))]
    pub mount_root: Option<PathBuf>,

    /// Sets the level of WASI tracing: syscalls or syscalls-with-callstacks
    #[structopt(long = "wasi-trace")]
    pub wasi_trace: Option<String>,

    /// The WebAssembly module (.wast/.wasm) to run
    #[structopt(parse(from_os_str))]
    pub path: PathBuf,

    /// The arguments to pass to the WebAssembly function
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abi {
    Bare,
    Emscripten,
    Wasi,
}

fn abi_list_help_text() -> &'static str {
    concat!(
        "  bare        No ABI: bare virtual metal.\n",
        "  emscripten  Emscripten ABI, such as it is.\n",
        "  wasi        WebAssembly System Interface ABI.\n",
    )
}

/// Runs the command, bounding any runtime exception that escapes: an
/// unhandled exception is a fatal error.
pub fn execute(options: &Run) -> i32 {
    catch_runtime_exceptions(
        || run(options),
        |exception| {
            eprintln!("Runtime exception: {}", exception);
            std::process::abort();
        },
    )
}

fn setup_object_cache(compiler: &InterpCompiler) -> Result<(), String> {
    let cache_path = match std::env::var("WAVM_OBJECT_CACHE_DIR") {
        Ok(path) if !path.is_empty() => path,
        _ => return Ok(()),
    };

    let mut max_bytes: u64 = 1024 * 1024 * 1024;
    if let Ok(max_megabytes) = std::env::var("WAVM_OBJECT_CACHE_MAX_MB") {
        if !max_megabytes.is_empty() {
            match max_megabytes.parse::<i64>() {
                Ok(megabytes) if megabytes > 0 => {
                    max_bytes = megabytes as u64 * 1_000_000;
                }
                _ => {
                    return Err(format!(
                        "Invalid object cache size \"{}\". Expected an integer greater than 1.",
                        max_megabytes
                    ));
                }
            }
        }
    }

    match wavm_cache::open_and_install(&cache_path, max_bytes, compiler.code_key()) {
        Ok(()) => Ok(()),
        Err(wavm_cache::OpenError::DoesNotExist) => Err(format!(
            "Object cache directory \"{}\" does not exist.",
            cache_path
        )),
        Err(wavm_cache::OpenError::NotDirectory) => Err(format!(
            "Object cache path \"{}\" does not refer to a directory.",
            cache_path
        )),
        Err(wavm_cache::OpenError::NotAccessible) => Err(format!(
            "Object cache path \"{}\" is not accessible.",
            cache_path
        )),
        Err(wavm_cache::OpenError::InvalidDatabase) => Err(format!(
            "Object cache database in \"{}\" is not valid.",
            cache_path
        )),
        Err(wavm_cache::OpenError::TooManyReaders) => Err(format!(
            "Object cache database in \"{}\" has too many concurrent readers.",
            cache_path
        )),
    }
}

fn load_precompiled_module(
    bytes: &[u8],
    features: &FeatureSpec,
    compiler: &InterpCompiler,
) -> Result<Module, String> {
    let (info, _) = wavm_runtime_core::parse::read_module(bytes, features)
        .map_err(|error| format!("Error loading WebAssembly binary file: {}", error))?;

    let object = info
        .custom_sections
        .get(PRECOMPILED_SECTION_NAME)
        .ok_or_else(|| {
            format!(
                "Input file did not contain '{}' section.",
                PRECOMPILED_SECTION_NAME
            )
        })?;

    unsafe { wavm_runtime_core::load_object_with(object, compiler) }
        .map_err(|error| format!("{}", error))
}

fn load_text_or_binary_module(
    bytes: Vec<u8>,
    features: &FeatureSpec,
    compiler: &InterpCompiler,
) -> Result<Module, String> {
    let binary = if is_wasm_binary(&bytes) {
        bytes
    } else {
        wabt::wat2wasm(&bytes)
            .map_err(|error| format!("Error parsing WebAssembly text file: {:?}", error))?
    };

    wavm_runtime_core::compile_with(&binary, features, compiler)
        .map_err(|error| format!("Error loading WebAssembly binary file: {}", error))
}

fn report_link_errors(link_result: &LinkResult) {
    eprintln!("Failed to link module:");
    for missing_import in &link_result.missing_imports {
        eprintln!("{}", missing_import);
    }
}

fn parse_invoke_args(
    function: &Arc<Function>,
    function_name: &str,
    args: &[String],
) -> Result<Vec<Value>, String> {
    let params = function.signature().params();
    if params.len() != args.len() {
        return Err(format!(
            "'{}' expects {} argument(s), but command line had {}.",
            function_name,
            params.len(),
            args.len()
        ));
    }

    let mut invoke_args = Vec::with_capacity(args.len());
    for (param, arg) in params.iter().zip(args) {
        let value = match param {
            Type::I32 => Value::I32(arg.parse::<i32>().unwrap_or(0)),
            Type::I64 => Value::I64(arg.parse::<i64>().unwrap_or(0)),
            Type::F32 => Value::F32(arg.parse::<f32>().unwrap_or(0.0)),
            Type::F64 => Value::F64(arg.parse::<f64>().unwrap_or(0.0)),
            other => {
                return Err(format!(
                    "Cannot parse command-line argument for {} function parameter",
                    other
                ));
            }
        };
        invoke_args.push(value);
    }
    Ok(invoke_args)
}

fn run(options: &Run) -> Result<i32, RuntimeError> {
    macro_rules! fail {
        ($($arg:tt)*) => {{
            eprintln!($($arg)*);
            return Ok(EXIT_FAILURE);
        }};
    }

    // Features.
    let mut features = FeatureSpec::default();
    for feature in &options.enable {
        if !parse_and_set_feature(feature, &mut features, true) {
            fail!(
                "Unknown feature '{}'. Supported features:\n{}",
                feature,
                feature_list_help_text()
            );
        }
    }

    // The object cache, when the environment asks for one.
    let compiler = InterpCompiler::new();
    if let Err(message) = setup_object_cache(&compiler) {
        fail!("{}", message);
    }

    // Load the module.
    let bytes = match read_file_contents(&options.path) {
        Ok(bytes) => bytes,
        Err(error) => fail!("Couldn't read {}: {}", options.path.display(), error),
    };
    let module = if options.precompiled {
        match load_precompiled_module(&bytes, &features, &compiler) {
            Ok(module) => module,
            Err(message) => fail!("{}", message),
        }
    } else {
        match load_text_or_binary_module(bytes, &features, &compiler) {
            Ok(module) => module,
            Err(message) => fail!("{}", message),
        }
    };
    let info = module.info();

    // Pick the ABI: forced on the command line, or detected from imports.
    let abi = match options.abi.as_deref() {
        Some("bare") => Abi::Bare,
        Some("emscripten") => Abi::Emscripten,
        Some("wasi") => Abi::Wasi,
        Some(other) => fail!(
            "Unknown ABI '{}'. Supported ABIs:\n{}",
            other,
            abi_list_help_text()
        ),
        None => {
            if wavm_wasi::is_wasi_module(info) {
                log::debug!("Module appears to be a WASI module.");
                Abi::Wasi
            } else if wavm_emscripten::is_emscripten_module(info) {
                log::debug!("Module appears to be an Emscripten module.");
                Abi::Emscripten
            } else {
                Abi::Bare
            }
        }
    };

    // The sandbox filesystem for --mount-root.
    let sandbox_fs = match &options.mount_root {
        Some(root) => {
            if abi != Abi::Wasi {
                fail!("--mount-root may only be used with the WASI ABI.");
            }
            let absolute_root = if root.is_absolute() {
                root.clone()
            } else {
                match std::env::current_dir() {
                    Ok(cwd) => cwd.join(root),
                    Err(error) => fail!("Couldn't resolve the working directory: {}", error),
                }
            };
            Some(wavm_wasi::make_sandbox_fs(absolute_root))
        }
        None => None,
    };

    // The syscall trace level; the level string follows `--wasi-trace=`.
    let wasi_trace_level = match options.wasi_trace.as_deref() {
        None => SyscallTraceLevel::None,
        Some("syscalls") => SyscallTraceLevel::Syscalls,
        Some("syscalls-with-callstacks") => SyscallTraceLevel::SyscallsWithCallstacks,
        Some(other) => fail!("Invalid WASI trace level: {}", other),
    };
    if wasi_trace_level != SyscallTraceLevel::None && abi != Abi::Wasi {
        fail!("--wasi-trace may only be used with the WASI ABI.");
    }

    // The compartment everything lives in, and the per-ABI environment.
    let compartment = Compartment::new();

    let emscripten_instance = if abi == Abi::Emscripten {
        match wavm_emscripten::instantiate(&compartment, info) {
            Ok(instance) => instance,
            Err(error) => fail!("Couldn't instantiate the Emscripten environment: {}", error),
        }
    } else {
        None
    };

    let wasi_process = if abi == Abi::Wasi {
        let mut args = vec!["/proc/1/exe".to_string()];
        args.extend(options.args.iter().cloned());
        let process = wavm_wasi::create_process(
            &compartment,
            args,
            vec![],
            sandbox_fs,
            Box::new(wavm_wasi::HostStdin),
            Box::new(wavm_wasi::HostStdout),
            Box::new(wavm_wasi::HostStderr),
        );
        wavm_wasi::set_syscall_trace_level(&process, wasi_trace_level);
        Some(process)
    } else {
        None
    };

    // Link the module against its ABI's resolver.
    let link_result = match abi {
        Abi::Emscripten => {
            let mut resolver = RootResolver::new();
            if let Some(emscripten) = &emscripten_instance {
                resolver.register("env", Arc::clone(&emscripten.env));
                resolver.register("asm2wasm", Arc::clone(&emscripten.asm2wasm));
                resolver.register("global", Arc::clone(&emscripten.global));
            }
            link_module(info, &mut resolver)
        }
        Abi::Wasi => {
            let process = wasi_process.as_ref().expect("created above for WASI");
            let mut resolver = wavm_wasi::get_process_resolver(process);
            link_module(info, &mut resolver)
        }
        Abi::Bare => link_module(info, &mut NullResolver),
    };

    if !link_result.success() {
        report_link_errors(&link_result);
        return Ok(EXIT_FAILURE);
    }

    // Instantiate the module.
    let instance = match Instance::new(
        &compartment,
        &module,
        &link_result.resolved_imports,
        &options.path.to_string_lossy(),
    ) {
        Ok(instance) => instance,
        Err(error) => fail!("Error instantiating module: {}", error),
    };

    // Take the module's memory as the WASI process memory.
    if let Some(process) = &wasi_process {
        let memory = instance
            .get_export("memory")
            .and_then(|object| object.as_memory().cloned());
        match memory {
            Some(memory) => wavm_wasi::set_process_memory(process, memory),
            None => fail!("WASM module doesn't export WASI memory."),
        }
    }

    // Create a WASM execution context.
    let ctx = Context::new(&compartment);

    // Look up the function export to call, validate its type, and set up the
    // invoke arguments.
    let (function, function_name, invoke_args) = if let Some(name) = &options.function {
        let function = match instance
            .get_export(name)
            .and_then(|object| object.as_function().cloned())
        {
            Some(function) => function,
            None => fail!("Module does not export '{}'", name),
        };
        let invoke_args = match parse_invoke_args(&function, name, &options.args) {
            Ok(invoke_args) => invoke_args,
            Err(message) => fail!("{}", message),
        };
        (function, name.clone(), invoke_args)
    } else if abi == Abi::Wasi {
        // WASI just calls a _start function with the signature ()->().
        let function = match instance
            .get_export("_start")
            .and_then(|object| object.as_function().cloned())
        {
            Some(function) => function,
            None => fail!("WASM module doesn't export WASI _start function."),
        };
        if !function.signature().params().is_empty()
            || !function.signature().returns().is_empty()
        {
            fail!(
                "WASI module exported _start : {} but expected _start : [] -> [].",
                function.signature()
            );
        }
        (function, "_start".to_string(), Vec::new())
    } else {
        // Emscripten and bare modules call main or _main.
        let (name, function) = match instance
            .get_export("main")
            .and_then(|object| object.as_function().cloned())
        {
            Some(function) => ("main", function),
            None => match instance
                .get_export("_main")
                .and_then(|object| object.as_function().cloned())
            {
                Some(function) => ("_main", function),
                None => fail!("Module does not export main function"),
            },
        };

        let num_params = function.signature().params().len();
        let invoke_args = if num_params == 2 {
            match &emscripten_instance {
                Some(emscripten) => {
                    let mut command_args = vec![options.path.to_string_lossy().into_owned()];
                    command_args.extend(options.args.iter().cloned());
                    emscripten.inject_command_args(&command_args)?
                }
                None => {
                    fail!("Module does not declare a default memory object to put arguments in.")
                }
            }
        } else if num_params > 0 {
            fail!(
                "WebAssembly function requires {} argument(s), but only 0 or 2 can be passed!",
                num_params
            );
        } else {
            Vec::new()
        };
        (function, name.to_string(), invoke_args)
    };

    // Call the module start function, if it has one.
    if let Some(start_function) = instance.inner().start_function() {
        match invoke_function_checked(&ctx, start_function, &[]) {
            Ok(_) => {}
            Err(RuntimeError::HostExit(code)) => return Ok(code),
            Err(error) => return Err(error),
        }
    }

    // Call the Emscripten global initializers.
    if let Some(emscripten) = &emscripten_instance {
        emscripten.initialize_globals(&ctx, &instance);
    }

    // Invoke the function.
    let execution_timer = Instant::now();
    let results = match invoke_function_checked(&ctx, &function, &invoke_args) {
        Ok(results) => results,
        Err(RuntimeError::HostExit(code)) => return Ok(code),
        Err(error) => return Err(error),
    };
    log::debug!(
        "Invoked function in {:.1}ms",
        execution_timer.elapsed().as_secs_f64() * 1000.0
    );

    if options.function.is_some() {
        log::debug!("{} returned: {:?}", function_name, results);
    }

    // A single i32 result becomes the process exit code.
    match results.as_slice() {
        [Value::I32(code)] => Ok(*code),
        _ => Ok(0),
    }
}
