mod common;

use common::from_hex;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use wisp::{execute, find_exported_function, instantiate, Module, WasmValue};

#[derive(Deserialize)]
struct ValueJSON {
    r#type: String,
    value: String,
}

#[derive(Deserialize)]
struct Action {
    invoke: String,
    #[serde(default)]
    args: Vec<ValueJSON>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum Command {
    #[serde(rename = "assert_return")]
    AssertReturn {
        action: Action,
        #[serde(default)]
        expected: Vec<ValueJSON>,
    },
    #[serde(rename = "assert_trap")]
    AssertTrap { action: Action },
}

#[derive(Deserialize)]
struct Fixture {
    module: String,
    commands: Vec<Command>,
}

fn to_wasm_values(values: &[ValueJSON]) -> Vec<WasmValue> {
    values
        .iter()
        .map(|v| match v.r#type.as_str() {
            "i32" | "f32" => WasmValue::from_u32(v.value.parse().unwrap()),
            "i64" | "f64" => WasmValue::from_u64(v.value.parse().unwrap()),
            other => panic!("unknown value type: {}", other),
        })
        .collect()
}

fn run_fixture(path: &Path) {
    let text = fs::read_to_string(path).expect("failed to read fixture");
    let fixture: Fixture = serde_json::from_str(&text).expect("failed to parse fixture");

    let module = Rc::new(Module::compile(from_hex(&fixture.module)).expect("module should compile"));
    let instance =
        instantiate(module.clone(), vec![], None, None, vec![]).expect("instantiation should succeed");

    for (i, command) in fixture.commands.iter().enumerate() {
        let action = match command {
            Command::AssertReturn { action, .. } => action,
            Command::AssertTrap { action } => action,
        };
        let func_idx = find_exported_function(&module, &action.invoke)
            .unwrap_or_else(|| panic!("{}: export '{}' not found", path.display(), action.invoke));
        let args = to_wasm_values(&action.args);
        let result = execute(&instance, func_idx as usize, &args, 0);

        match command {
            Command::AssertReturn { expected, .. } => {
                assert!(
                    !result.trapped,
                    "{} command {}: unexpected trap invoking '{}'",
                    path.display(),
                    i,
                    action.invoke
                );
                let expected = to_wasm_values(expected);
                let produced: Vec<WasmValue> = result.value.into_iter().collect();
                assert_eq!(
                    produced.iter().map(|v| v.as_u64()).collect::<Vec<_>>(),
                    expected.iter().map(|v| v.as_u64()).collect::<Vec<_>>(),
                    "{} command {}: wrong result from '{}'",
                    path.display(),
                    i,
                    action.invoke
                );
            }
            Command::AssertTrap { .. } => {
                assert!(
                    result.trapped,
                    "{} command {}: expected a trap from '{}'",
                    path.display(),
                    i,
                    action.invoke
                );
            }
        }
    }
}

#[test]
fn run_fixtures() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    let mut ran = 0;
    for entry in fs::read_dir(&dir).expect("failed to read fixtures directory") {
        let path = entry.expect("failed to read entry").path();
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            run_fixture(&path);
            ran += 1;
        }
    }
    assert!(ran > 0, "no fixtures found in {}", dir.display());
}
