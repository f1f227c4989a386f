use clap::Parser;
use std::fs;
use std::path::PathBuf;

use wisp::module::ExternType;
use wisp::{execute, find_exported_function, instantiate, Module, ValType, WasmValue};

#[derive(Parser, Debug)]
#[command(name = "wisp-run")]
#[command(about = "Execute WebAssembly modules with the wisp interpreter")]
#[command(long_about = "
Run a WebAssembly module from the command line: list its exports or invoke
an exported function with typed arguments.

Examples:
  # Invoke a function with no arguments
  wisp-run module.wasm --invoke main

  # Invoke a function with arguments (i32, i64, f32, f64 supported)
  wisp-run module.wasm --invoke add --args 10:i32 20:i32

  # List all exports instead of running
  wisp-run module.wasm --list-exports
")]
struct Args {
    /// Path to the WebAssembly module file
    wasm_file: PathBuf,

    /// Function to invoke (defaults to _start if available)
    #[arg(short, long)]
    invoke: Option<String>,

    /// Arguments to pass to the function (format: value:type, e.g. 42:i32)
    #[arg(short, long, value_delimiter = ' ', num_args = 0..)]
    args: Vec<String>,

    /// List all exports instead of running
    #[arg(short, long)]
    list_exports: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

fn parse_value(arg: &str) -> Result<WasmValue, String> {
    let (value_str, type_str) = arg
        .split_once(':')
        .ok_or_else(|| format!("invalid argument '{}', expected value:type (e.g. 42:i32)", arg))?;

    match type_str {
        "i32" => value_str
            .parse::<i32>()
            .map(WasmValue::from_i32)
            .map_err(|_| format!("failed to parse '{}' as i32", value_str)),
        "i64" => value_str
            .parse::<i64>()
            .map(WasmValue::from_i64)
            .map_err(|_| format!("failed to parse '{}' as i64", value_str)),
        "f32" => value_str
            .parse::<f32>()
            .map(WasmValue::from_f32)
            .map_err(|_| format!("failed to parse '{}' as f32", value_str)),
        "f64" => value_str
            .parse::<f64>()
            .map(WasmValue::from_f64)
            .map_err(|_| format!("failed to parse '{}' as f64", value_str)),
        _ => Err(format!("unknown type '{}', supported: i32, i64, f32, f64", type_str)),
    }
}

fn type_name(ty: ValType) -> &'static str {
    match ty {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
        ValType::Any => "any",
    }
}

fn format_result(value: WasmValue, result_type: ValType) -> String {
    match result_type {
        ValType::I32 => format!("{} (i32)", value.as_i32()),
        ValType::I64 => format!("{} (i64)", value.as_i64()),
        ValType::F32 => format!("{} (f32)", value.as_f32()),
        ValType::F64 => format!("{} (f64)", value.as_f64()),
        ValType::Any => format!("0x{:016x}", value.as_u64()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let bytes = fs::read(&args.wasm_file)
        .map_err(|e| format!("failed to read {}: {}", args.wasm_file.display(), e))?;
    if args.debug {
        eprintln!("module size: {} bytes", bytes.len());
    }

    let module = Module::compile(bytes).map_err(|e| format!("failed to compile module: {}", e))?;
    let module = std::rc::Rc::new(module);

    if module.imported_function_count() > 0 {
        return Err("module has function imports; wisp-run only runs self-contained modules".into());
    }

    let instance = instantiate(module.clone(), vec![], None, None, vec![])
        .map_err(|e| format!("failed to instantiate module: {}", e))?;

    if args.list_exports {
        println!("Exports:");
        let mut names: Vec<_> = module.exports.keys().collect();
        names.sort();
        for name in names {
            let export = &module.exports[name];
            match export.extern_type {
                ExternType::Func => {
                    let ty = &module.functions[export.idx as usize].ty;
                    let params: Vec<_> = ty.params.iter().map(|&p| type_name(p)).collect();
                    let result = ty.result.map(type_name).unwrap_or("()");
                    println!("  func   {} ({}) -> {}", name, params.join(", "), result);
                }
                ExternType::Table => println!("  table  {}", name),
                ExternType::Mem => println!("  memory {}", name),
                ExternType::Global => println!("  global {}", name),
            }
        }
        return Ok(());
    }

    let func_name = args.invoke.as_deref().unwrap_or("_start");
    let func_idx = find_exported_function(&module, func_name)
        .ok_or_else(|| format!("function '{}' not found in exports", func_name))?;
    let ty = module.functions[func_idx as usize].ty.clone();

    let mut wasm_args = Vec::new();
    for arg in &args.args {
        wasm_args.push(parse_value(arg)?);
    }
    if wasm_args.len() != ty.params.len() {
        return Err(format!(
            "function '{}' expects {} arguments, but {} provided",
            func_name,
            ty.params.len(),
            wasm_args.len()
        )
        .into());
    }

    let result = execute(&instance, func_idx as usize, &wasm_args, 0);
    if result.trapped {
        return Err(format!("function '{}' trapped", func_name).into());
    }
    match (result.value, ty.result) {
        (Some(value), Some(result_type)) => println!("{}", format_result(value, result_type)),
        _ => {
            if args.debug {
                eprintln!("function completed with no return value");
            }
        }
    }

    Ok(())
}
