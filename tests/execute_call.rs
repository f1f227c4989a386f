mod common;

use common::from_hex;
use std::rc::Rc;
use wisp::{
    execute, find_exported_function, find_exported_table, instantiate, Error, Instance, Module,
    RuntimeFunction, Signature, TableFunction, TableTarget, ValType, WasmTable, WasmValue,
    CALL_STACK_LIMIT,
};

fn compile(hex: &str) -> Rc<Module> {
    Rc::new(Module::compile(from_hex(hex)).expect("module should compile"))
}

fn instantiate_simple(module: Rc<Module>) -> Rc<Instance> {
    instantiate(module, vec![], None, None, vec![]).expect("instantiation should succeed")
}

fn args(values: &[u64]) -> Vec<WasmValue> {
    values.iter().map(|&v| WasmValue::from_u64(v)).collect()
}

#[test]
fn direct_call() {
    /* wat2wasm
    (func (result i32) (i32.const 0x2a002a))
    (func (result i32) (call 0))
    */
    let module = compile("0061736d010000000105016000017f03030200000a0e02070041aa80a8010b040010000b");
    let instance = instantiate_simple(module);

    let result = execute(&instance, 1, &[], 0);
    assert!(!result.trapped);
    assert_eq!(result.value.map(|v| v.as_u32()), Some(0x2a002a));
}

#[test]
fn call_trap_propagates() {
    /* wat2wasm
    (func (result i32) (unreachable))
    (func (result i32) (call 0))
    */
    let module = compile("0061736d010000000105016000017f03030200000a0a020300000b040010000b");
    let instance = instantiate_simple(module);

    let result = execute(&instance, 1, &[], 0);
    assert!(result.trapped);
    assert_eq!(result.value, None);
}

#[test]
fn call_with_arguments() {
    /* wat2wasm
    (module
      (func $calc (param $a i32) (param $b i32) (result i32)
        local.get 1
        local.get 0
        i32.sub ;; a - b
      )
      (func (result i32)
        i32.const 13
        i32.const 17
        call $calc ;; 17 - 13 => 4
      )
    )
    */
    let module = compile(
        "0061736d01000000010b0260027f7f017f6000017f03030200010a12020700200120006b0b0800410d411110000b",
    );
    let instance = instantiate_simple(module);

    let result = execute(&instance, 1, &[], 0);
    assert!(!result.trapped);
    assert_eq!(result.value.map(|v| v.as_u32()), Some(4));
}

#[test]
fn call_nonempty_stack() {
    /* wat2wasm
    (func (param i32) (result i32)
      local.get 0
    )
    (func (result i32)
      i32.const 1
      i32.const 2
      call 0
      i32.add
    )
    */
    let module =
        compile("0061736d01000000010a0260017f017f6000017f03030200010a1002040020000b09004101410210006a0b");
    let instance = instantiate_simple(module);

    let result = execute(&instance, 1, &[], 0);
    assert!(!result.trapped);
    assert_eq!(result.value.map(|v| v.as_u32()), Some(3));
}

#[test]
fn call_indirect_dispatch_and_traps() {
    /* wat2wasm
      (type $out-i32 (func (result i32)))

      (table anyfunc (elem $f3 $f2 $f1 $f4 $f5))

      (func $f1 (result i32) i32.const 1)
      (func $f2 (result i32) i32.const 2)
      (func $f3 (result i32) i32.const 3)
      (func $f4 (result i64) i64.const 4)
      (func $f5 (result i32) unreachable)

      (func (param i32) (result i32)
        (call_indirect (type $out-i32) (get_local 0))
      )
    */
    let module = compile(
        "0061736d01000000010e036000017f6000017e60017f017f03070600000001000204050170010505090b010041\
         000b0502010003040a2106040041010b040041020b040041030b040042040b0300000b070020001100000b",
    );
    let instance = instantiate_simple(module);

    for (param, expected) in [(0u64, 3u32), (1, 2), (2, 1)] {
        let result = execute(&instance, 5, &args(&[param]), 0);
        assert!(!result.trapped);
        assert_eq!(result.value.map(|v| v.as_u32()), Some(expected));
    }

    // stored function has the wrong type (f4 returns i64)
    assert!(execute(&instance, 5, &args(&[3]), 0).trapped);
    // called function traps
    assert!(execute(&instance, 5, &args(&[4]), 0).trapped);
    // table index out of bounds
    assert!(execute(&instance, 5, &args(&[5]), 0).trapped);
}

#[test]
fn call_indirect_with_argument() {
    /* wat2wasm
    (module
      (type $bin_func (func (param i32 i32) (result i32)))
      (table anyfunc (elem $f1 $f2 $f3))

      (func $f1 (param i32 i32) (result i32) (i32.div_u (get_local 0) (get_local 1)))
      (func $f2 (param i32 i32) (result i32) (i32.sub (get_local 0) (get_local 1)))
      (func $f3 (param i32) (result i32) (i32.mul (get_local 0) (get_local 0)))

      (func (param i32) (result i32)
        i32.const 31
        i32.const 7
        (call_indirect (type $bin_func) (get_local 0))
      )
    )
    */
    let module = compile(
        "0061736d01000000010c0260027f7f017f60017f017f03050400000101040501700103030909010041000b0300\
         01020a25040700200020016e0b0700200020016b0b0700200020006c0b0b00411f410720001100000b",
    );
    let instance = instantiate_simple(module);

    assert_eq!(execute(&instance, 3, &args(&[0]), 0).value.map(|v| v.as_u32()), Some(31 / 7));
    assert_eq!(execute(&instance, 3, &args(&[1]), 0).value.map(|v| v.as_u32()), Some(31 - 7));
    // f3 has a different signature
    assert!(execute(&instance, 3, &args(&[2]), 0).trapped);
}

#[test]
fn call_indirect_uninitialized_slot() {
    /* wat2wasm
      (type $out-i32 (func (result i32)))

      (table 5 anyfunc)
      (elem (i32.const 0) $f3 $f2 $f1)

      (func $f1 (result i32) i32.const 1)
      (func $f2 (result i32) i32.const 2)
      (func $f3 (result i32) i32.const 3)

      (func (param i32) (result i32)
        (call_indirect (type $out-i32) (get_local 0))
      )
    */
    let module = compile(
        "0061736d01000000010a026000017f60017f017f030504000000010404017000050909010041000b030201000a\
         1804040041010b040041020b040041030b070020001100000b",
    );
    let instance = instantiate_simple(module);

    assert_eq!(execute(&instance, 3, &args(&[0]), 0).value.map(|v| v.as_u32()), Some(3));
    // slots 3 and 4 were never initialized
    assert!(execute(&instance, 3, &args(&[3]), 0).trapped);
    assert!(execute(&instance, 3, &args(&[4]), 0).trapped);
}

fn out_i32() -> Signature {
    Signature { params: vec![], result: Some(ValType::I32) }
}

fn host_const(value: u32) -> TableFunction {
    TableFunction {
        ty: out_i32(),
        target: TableTarget::Host {
            thunk: Rc::new(move |_, _, _| wisp::ExecutionResult::value(WasmValue::from_u32(value))),
        },
    }
}

#[test]
fn call_indirect_through_imported_table() {
    /* wat2wasm
    (module
      (type $out_i32 (func (result i32)))
      (import "m" "t" (table 5 20 anyfunc))

      (func (param i32) (result i32)
        (call_indirect (type $out_i32) (get_local 0))
      )
    )
    */
    let module = compile(
        "0061736d01000000010a026000017f60017f017f020a01016d01740170010514030201010a0901070020001100000b",
    );

    let table = Rc::new(std::cell::RefCell::new(WasmTable::new(5, 20)));
    {
        let mut t = table.borrow_mut();
        t.set(0, Some(host_const(3))).unwrap();
        t.set(1, Some(host_const(2))).unwrap();
        t.set(2, Some(host_const(1))).unwrap();
        // wrong type in slot 3
        t.set(
            3,
            Some(TableFunction {
                ty: Signature { params: vec![], result: Some(ValType::I64) },
                target: TableTarget::Host {
                    thunk: Rc::new(|_, _, _| wisp::ExecutionResult::value(WasmValue::from_u64(4))),
                },
            }),
        )
        .unwrap();
        // trapping host function in slot 4
        t.set(
            4,
            Some(TableFunction {
                ty: out_i32(),
                target: TableTarget::Host { thunk: Rc::new(|_, _, _| wisp::ExecutionResult::trap()) },
            }),
        )
        .unwrap();
    }

    let instance =
        instantiate(module, vec![], Some(table), None, vec![]).expect("instantiation should succeed");

    for (param, expected) in [(0u64, 3u32), (1, 2), (2, 1)] {
        let result = execute(&instance, 0, &args(&[param]), 0);
        assert!(!result.trapped);
        assert_eq!(result.value.map(|v| v.as_u32()), Some(expected));
    }
    assert!(execute(&instance, 0, &args(&[3]), 0).trapped); // type mismatch
    assert!(execute(&instance, 0, &args(&[4]), 0).trapped); // callee traps
    assert!(execute(&instance, 0, &args(&[5]), 0).trapped); // out of bounds
}

#[test]
fn imported_function_call() {
    /* wat2wasm
    (import "mod" "foo" (func (result i32)))
    (func (result i32)
      call 0
    )
    */
    let module =
        compile("0061736d010000000105016000017f020b01036d6f6403666f6f0000030201000a0601040010000b");

    let host_foo = RuntimeFunction::new_host(vec![], Some(ValType::I32), |_, _, _| {
        wisp::ExecutionResult::value(WasmValue::from_u32(42))
    });
    let instance =
        instantiate(module, vec![host_foo], None, None, vec![]).expect("instantiation should succeed");

    assert_eq!(execute(&instance, 1, &[], 0).value.map(|v| v.as_u32()), Some(42));
}

#[test]
fn imported_function_call_with_arguments() {
    /* wat2wasm
    (import "mod" "foo" (func (param i32) (result i32)))
    (func (param i32) (result i32)
      get_local 0
      call 0
      i32.const 2
      i32.add
    )
    */
    let module = compile(
        "0061736d0100000001060160017f017f020b01036d6f6403666f6f0000030201000a0b0109002000100041026a0b",
    );

    let host_foo = RuntimeFunction::new_host(vec![ValType::I32], Some(ValType::I32), |_, a, _| {
        wisp::ExecutionResult::value(WasmValue::from_u64(a[0].as_u64() * 2))
    });
    let instance =
        instantiate(module, vec![host_foo], None, None, vec![]).expect("instantiation should succeed");

    assert_eq!(execute(&instance, 1, &args(&[20]), 0).value.map(|v| v.as_u32()), Some(42));
}

#[test]
fn imported_functions_called_indirectly() {
    /* wat2wasm
    (module
      (type $ft (func (param i32) (result i64)))
      (func $sqr    (import "env" "sqr") (param i32) (result i64))
      (func $isqrt  (import "env" "isqrt") (param i32) (result i64))
      (func $double (param i32) (result i64)
        get_local 0
        i64.extend_u/i32
        get_local 0
        i64.extend_u/i32
        i64.add
      )

      (func $main (param i32) (param i32) (result i64)
        get_local 1
        get_local 0
        call_indirect (type $ft)
      )

      (table anyfunc (elem $double $sqr $isqrt))
    )
    */
    let module = compile(
        "0061736d01000000010c0260017f017e60027f7f017e02170203656e7603737172000003656e76056973717274\
         00000303020001040501700103030909010041000b030200010a150209002000ad2000ad7c0b09002001200011\
         00000b",
    );

    let sqr = RuntimeFunction::new_host(vec![ValType::I32], Some(ValType::I64), |_, a, _| {
        wisp::ExecutionResult::value(WasmValue::from_u64(a[0].as_u64() * a[0].as_u64()))
    });
    let isqrt = RuntimeFunction::new_host(vec![ValType::I32], Some(ValType::I64), |_, a, _| {
        wisp::ExecutionResult::value(WasmValue::from_u64((11 + a[0].as_u64() / 11) / 2))
    });
    let instance = instantiate(module, vec![sqr, isqrt], None, None, vec![])
        .expect("instantiation should succeed");

    // double(10)
    assert_eq!(execute(&instance, 3, &args(&[0, 10]), 0).value.map(|v| v.as_u64()), Some(20));
    // sqr(9)
    assert_eq!(execute(&instance, 3, &args(&[1, 9]), 0).value.map(|v| v.as_u64()), Some(81));
    // isqrt(50)
    assert_eq!(execute(&instance, 3, &args(&[2, 50]), 0).value.map(|v| v.as_u64()), Some(7));
}

#[test]
fn imported_function_from_another_instance() {
    /* wat2wasm
    (module
      (func $sub (param $lhs i32) (param $rhs i32) (result i32)
        get_local $lhs
        get_local $rhs
        i32.sub)
      (export "sub" (func $sub))
    )
    */
    let module1 =
        compile("0061736d0100000001070160027f7f017f030201000707010373756200000a09010700200020016b0b");
    let instance1 = instantiate_simple(module1.clone());

    /* wat2wasm
    (module
      (func $sub (import "m1" "sub") (param $lhs i32) (param $rhs i32) (result i32))

      (func $main (param i32) (param i32) (result i32)
        get_local 0
        get_local 1
        call $sub
      )
    )
    */
    let module2 = compile(
        "0061736d0100000001070160027f7f017f020a01026d31037375620000030201000a0a0108002000200110000b",
    );

    let sub_idx = find_exported_function(&module1, "sub").expect("sub should be exported");
    let sub = RuntimeFunction::exported(&instance1, sub_idx);
    let instance2 =
        instantiate(module2, vec![sub], None, None, vec![]).expect("instantiation should succeed");

    let result = execute(&instance2, 1, &args(&[44, 2]), 0);
    assert!(!result.trapped);
    assert_eq!(result.value.map(|v| v.as_u32()), Some(42));
}

#[test]
fn imported_table_from_another_instance() {
    /* wat2wasm
    (module
      (func $sub (param $lhs i32) (param $rhs i32) (result i32)
        get_local $lhs
        get_local $rhs
        i32.sub)
      (table (export "tab") 1 funcref)
      (elem (i32.const 0) $sub)
    )
    */
    let module1 = compile(
        "0061736d0100000001070160027f7f017f030201000404017000010707010374616201000907010041000b0100\
         0a09010700200020016b0b",
    );
    let instance1 = instantiate_simple(module1);

    /* wat2wasm
    (module
      (type $t1 (func (param $lhs i32) (param $rhs i32) (result i32)))
      (import "m1" "tab" (table 1 funcref))

      (func $main (param i32) (param i32) (result i32)
        get_local 0
        get_local 1
        (call_indirect (type $t1) (i32.const 0))
      )
    )
    */
    let module2 = compile(
        "0061736d0100000001070160027f7f017f020c01026d310374616201700001030201000a0d010b002000200141\
         001100000b",
    );

    let table = find_exported_table(&instance1, "tab").expect("tab should be exported");
    let instance2 =
        instantiate(module2, vec![], Some(table), None, vec![]).expect("instantiation should succeed");

    assert_eq!(execute(&instance2, 0, &args(&[44, 2]), 0).value.map(|v| v.as_u32()), Some(42));
}

#[test]
fn imported_table_keeps_writes_of_failed_instantiation() {
    /* wat2wasm
    (module
      (type $t1 (func (param $lhs i32) (param $rhs i32) (result i32)))
      (func (param i32) (param i32) (result i32)
        get_local 0
        get_local 1
        (call_indirect (type $t1) (i32.const 0))
      )
      (table (export "tab") 1 funcref)
    )
    */
    let module1 = compile(
        "0061736d0100000001070160027f7f017f030201000404017000010707010374616201000a0d010b0020002001\
         41001100000b",
    );
    let instance1 = instantiate_simple(module1);

    /* wat2wasm
    (module
      (import "m1" "tab" (table 1 funcref))
      (func $sub (param $lhs i32) (param $rhs i32) (result i32)
        get_local $lhs
        get_local $rhs
        i32.sub)
      (elem (i32.const 0) $sub)
      (func $main (unreachable))
      (start $main)
    )
    */
    let module2 = compile(
        "0061736d01000000010a0260027f7f017f600000020c01026d3103746162017000010303020001080101090701\
         0041000b01000a0d020700200020016b0b0300000b",
    );

    let table = find_exported_table(&instance1, "tab").expect("tab should be exported");
    let error = instantiate(module2, vec![], Some(table), None, vec![])
        .err()
        .expect("instantiation should fail in the start function");
    assert_eq!(error, Error::Uninstantiable("start function failed to execute"));

    // The element write performed before the start trap is still visible
    // and callable through the table's owner.
    let result = execute(&instance1, 0, &args(&[44, 2]), 0);
    assert!(!result.trapped);
    assert_eq!(result.value.map(|v| v.as_u32()), Some(42));
}

/// The depth limit permits ~2048 nested native frames; give those tests a
/// thread with room to spare.
fn with_large_stack(f: impl FnOnce() + Send + 'static) {
    std::thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .spawn(f)
        .unwrap()
        .join()
        .unwrap();
}

#[test]
fn infinite_recursion_hits_depth_limit() {
    with_large_stack(|| {
        /* wat2wasm
        (module (func call 0))
        */
        let module = compile("0061736d01000000010401600000030201000a0601040010000b");
        let instance = instantiate_simple(module);

        assert!(execute(&instance, 0, &[], 0).trapped);
    });
}

#[test]
fn indirect_infinite_recursion_hits_depth_limit() {
    with_large_stack(|| {
        /* wat2wasm
          (type $out-i32 (func (result i32)))
          (table anyfunc (elem $foo))
          (func $foo (result i32)
            (call_indirect (type $out-i32) (i32.const 0))
          )
        */
        let module = compile(
            "0061736d010000000105016000017f03020100040501700101010907010041000b01000a0901070041001100\
             000b",
        );
        let instance = instantiate_simple(module);

        assert!(execute(&instance, 0, &[], 0).trapped);
    });
}

#[test]
fn imported_recursion_cannot_bypass_depth_limit() {
    with_large_stack(|| {
        /* wat2wasm
        (import "mod" "foo" (func (result i32)))
        (func (result i32)
          call 0
        )
        */
        let module =
            compile("0061736d010000000105016000017f020b01036d6f6403666f6f0000030201000a0601040010000b");

        // The host import re-enters the engine with the depth it was handed.
        let host_foo = RuntimeFunction::new_host(vec![], Some(ValType::I32), |instance, _, depth| {
            execute(instance, 0, &[], depth)
        });
        let instance = instantiate(module, vec![host_foo], None, None, vec![])
            .expect("instantiation should succeed");

        assert!(execute(&instance, 0, &[], 0).trapped);
    });
}

#[test]
fn entry_at_exactly_the_depth_limit_succeeds() {
    with_large_stack(|| {
        /* wat2wasm
        (func (result i32) (i32.const 42))
        (func (result i32) (call 0))
        */
        let module = compile("0061736d010000000105016000017f03030200000a0b020400412a0b040010000b");
        let instance = instantiate_simple(module);

        let result = execute(&instance, 0, &[], CALL_STACK_LIMIT);
        assert!(!result.trapped);
        assert_eq!(result.value.map(|v| v.as_u32()), Some(42));

        // One nested call from the limit is one too many.
        assert!(execute(&instance, 1, &[], CALL_STACK_LIMIT).trapped);
    });
}

#[test]
fn trapped_instance_stays_usable() {
    /* wat2wasm
    (func (result i32) (unreachable))
    (func (result i32) (call 0))
    */
    let module = compile("0061736d010000000105016000017f03030200000a0a020300000b040010000b");
    let instance = instantiate_simple(module);

    assert!(execute(&instance, 1, &[], 0).trapped);
    // Traps unwind completely; the next invocation starts clean.
    assert!(execute(&instance, 1, &[], 0).trapped);
}

#[test]
fn dropped_call_result_and_stack_height_annotation() {
    /* wat2wasm
      (func $const-i32 (result i32) (i32.const 0x132))
      (func (export "drop_call_result")
        call $const-i32
        drop
      )
    */
    let module = compile(
        "0061736d010000000108026000017f60000003030200010714011064726f705f63616c6c5f726573756c740001\
         0a0d02050041b2020b050010001a0b",
    );

    assert_eq!(module.functions[0].max_stack_height, 1);
    assert_eq!(module.functions[1].max_stack_height, 1);

    let func_idx = find_exported_function(&module, "drop_call_result").unwrap();
    let instance = instantiate_simple(module);
    let result = execute(&instance, func_idx as usize, &[], 0);
    assert!(!result.trapped);
    assert_eq!(result.value, None);
}
