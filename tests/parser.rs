mod common;

use common::from_hex;
use wisp::{Error, Module};

fn compile_err(hex: &str) -> Error {
    Module::compile(from_hex(hex)).err().expect("module should be rejected")
}

#[test]
fn truncated_and_malformed_headers() {
    assert_eq!(compile_err(""), Error::Malformed("unexpected end of section or function"));
    assert_eq!(compile_err("0061736d"), Error::Malformed("unexpected end of section or function"));
    // wrong magic
    assert_eq!(compile_err("0061736e01000000"), Error::Malformed("magic header not detected"));
    // version 2
    assert_eq!(compile_err("0061736d02000000"), Error::Malformed("unknown binary version"));
}

#[test]
fn empty_module_parses() {
    let module = Module::compile(from_hex("0061736d01000000")).unwrap();
    assert!(module.functions.is_empty());
    assert!(module.exports.is_empty());
    assert!(module.start.is_none());
}

#[test]
fn out_of_order_sections_are_junk() {
    // A second type section after the first: no later section can consume
    // it, so it survives to the end of the buffer.
    assert_eq!(
        compile_err("0061736d01000000010401600000010401600000"),
        Error::Malformed("junk after last section")
    );
}

#[test]
fn unknown_section_id_is_rejected() {
    assert_eq!(compile_err("0061736d010000000c0100"), Error::Malformed("invalid section id"));
}

#[test]
fn custom_sections_are_skipped() {
    /* custom section named "note" with 3 payload bytes, then a type section */
    let module = Module::compile(from_hex("0061736d010000000008046e6f7465010203010401600000")).unwrap();
    assert_eq!(module.types.len(), 1);
}

#[test]
fn function_and_code_counts_must_agree() {
    // One declared function, empty code section
    assert_eq!(
        compile_err("0061736d01000000010401600000030201000a0100"),
        Error::Malformed("function and code section have inconsistent lengths")
    );
}

#[test]
fn duplicate_export_names_are_rejected() {
    /* two functions both exported as "f" */
    assert_eq!(
        compile_err(
            "0061736d01000000010401600000030302000007090201660000016600010a070202000b02000b"
        ),
        Error::Validation("duplicate export name")
    );
}

#[test]
fn missing_result_is_a_type_error() {
    /* (func (result i32)) with an empty body */
    assert_eq!(
        compile_err("0061736d010000000105016000017f030201000a040102000b"),
        Error::Validation("type mismatch")
    );
}

#[test]
fn call_to_unknown_function_is_rejected() {
    /* (func call 5) */
    assert_eq!(
        compile_err("0061736d01000000010401600000030201000a0601040010050b"),
        Error::Validation("unknown function")
    );
}

#[test]
fn overaligned_memory_access_is_rejected() {
    /* (func (drop (i32.load align=8 (i32.const 0)))) with (memory 1) */
    assert_eq!(
        compile_err("0061736d010000000104016000000302010005030100010a0a01080041002803001a0b"),
        Error::Validation("alignment must not be larger than natural")
    );
}

#[test]
fn memory_instruction_without_memory_is_rejected() {
    /* (func (drop (i32.load (i32.const 0)))) and no memory section */
    assert_eq!(
        compile_err("0061736d01000000010401600000030201000a0a01080041002802001a0b"),
        Error::Validation("unknown memory")
    );
}

#[test]
fn start_function_must_have_empty_type() {
    /* (func (result i32) i32.const 1) (start 0) */
    assert_eq!(
        compile_err("0061736d010000000105016000017f030201000801000a0601040041010b"),
        Error::Validation("invalid start function type")
    );
}

#[test]
fn oversized_memory_limit_is_rejected() {
    /* (memory 1 65537) */
    assert_eq!(
        compile_err("0061736d010000000506010101818004"),
        Error::Validation("memory size must be at most 65536 pages (4GiB)")
    );
}

#[test]
fn stack_height_annotations_are_computed() {
    /* wat2wasm
    (func (param i32 i32) (result i32)
      local.get 1
      local.get 0
      i32.sub)
    (func (result i32)
      i32.const 13
      i32.const 17
      call 0)
    */
    let module = Module::compile(from_hex(
        "0061736d01000000010b0260027f7f017f6000017f03030200010a12020700200120006b0b0800410d411110000b",
    ))
    .unwrap();

    // Two operands live at the widest point of each body
    assert_eq!(module.functions[0].max_stack_height, 2);
    assert_eq!(module.functions[1].max_stack_height, 2);

    /* (func nop) has an empty operand stack throughout */
    let module =
        Module::compile(from_hex("0061736d01000000010401600000030201000a05010300010b")).unwrap();
    assert_eq!(module.functions[0].max_stack_height, 0);
}
