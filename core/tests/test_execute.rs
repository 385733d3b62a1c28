//! End-to-end tests: assemble a listing, link it, run it, and check the
//! observable machine state.

use boxvm::{
    assemble_listing, error::ExecError, RegClass, RegCounts, Value, Vm,
    NUM_REG_CLASSES,
};

/// A VM with a uniform complement of global registers.
fn new_vm() -> Vm {
    let mut vm = Vm::new();
    let counts = RegCounts {
        num_reg: [8; NUM_REG_CLASSES],
        num_var: [4; NUM_REG_CLASSES],
    };
    vm.globals_alloc(&counts);
    vm
}

fn run(source: &str) -> Vm {
    let mut vm = new_vm();
    let main = assemble_listing(&mut vm, source).unwrap();
    assert!(vm.link_check().is_empty());
    vm.execute(main).unwrap();
    vm
}

fn global_int(vm: &Vm, index: i64) -> i64 {
    match vm.global_get(RegClass::Int, index).unwrap() {
        Value::Int(value) => value,
        other => panic!("unexpected value {:?}", other),
    }
}

fn global_real(vm: &Vm, index: i64) -> f64 {
    match vm.global_get(RegClass::Real, index).unwrap() {
        Value::Real(value) => value,
        other => panic!("unexpected value {:?}", other),
    }
}

#[test]
fn test_straight_line_arithmetic() {
    let vm = run("mov gri1, 6\n\
                  mov gri2, 7\n\
                  mul gri1, gri2\n\
                  mov gri3, 100\n\
                  sub gri3, gri1\n");
    assert_eq!(global_int(&vm, 1), 42);
    assert_eq!(global_int(&vm, 3), 58);
}

#[test]
fn test_locals_with_manual_prologue() {
    let vm = run("newi 2, 3\n\
                  mov vi1, 30\n\
                  mov ri3, 12\n\
                  add vi1, ri3\n\
                  mov gri1, vi1\n");
    assert_eq!(global_int(&vm, 1), 42);
}

#[test]
fn test_countdown_loop() {
    let vm = run("mov gri1, 0\n\
                  mov gri2, 10\n\
                  top: add gri1, gri2\n\
                  dec gri2\n\
                  mov ri0, gri2\n\
                  jc top\n");
    assert_eq!(global_int(&vm, 1), 55);
    assert_eq!(global_int(&vm, 2), 0);
}

#[test]
fn test_recursive_factorial_through_named_calls() {
    // fact: while gri1 != 0 { gri2 *= gri1; gri1 -= 1; recurse }
    let vm = run("mov gri1, 5\n\
                  mov gri2, 1\n\
                  call fact\n\
                  %proc fact\n\
                  mov ri0, gri1\n\
                  jc go\n\
                  ret\n\
                  go: mul gri2, gri1\n\
                  dec gri1\n\
                  call fact\n");
    assert_eq!(global_int(&vm, 2), 120);
}

#[test]
fn test_real_arithmetic_and_coercion() {
    let vm = run("mov grr1, 1.5\n\
                  mov grr2, 2.5\n\
                  add grr1, grr2\n\
                  real gri1\n\
                  mov gri1, 9\n\
                  real gri1\n\
                  mov grr3, rr0\n");
    assert_eq!(global_real(&vm, 1), 4.0);
    assert_eq!(global_real(&vm, 3), 9.0);
}

#[test]
fn test_point_arithmetic() {
    let vm = run("mov grp1, (1.0, 2.0)\n\
                  mov grp2, (0.5, -1.0)\n\
                  add grp1, grp2\n");
    match vm.global_get(RegClass::Point, 1).unwrap() {
        Value::Point(point) => {
            assert_eq!(point.x, 1.5);
            assert_eq!(point.y, 1.0);
        }
        other => panic!("unexpected value {:?}", other),
    }
}

#[test]
fn test_heap_object_lifecycle() {
    let vm = run("malloc 32, 0\n\
                  mov gro1, ro0\n\
                  mov i[ro0+16], 1234\n\
                  mov gri1, i[ro0+16]\n");
    assert_eq!(global_int(&vm, 1), 1234);
    // The handle survives in gro1
    match vm.global_get(RegClass::Obj, 1).unwrap() {
        Value::Obj(obj) => assert!(!obj.is_null()),
        other => panic!("unexpected value {:?}", other),
    }
}

#[test]
fn test_division_by_zero_is_reported() {
    let mut vm = new_vm();
    let main = assemble_listing(
        &mut vm,
        "line 3\n\
         mov gri1, 7\n\
         div gri1, 0\n",
    )
    .unwrap();
    assert_eq!(
        vm.execute(main),
        Err(ExecError::DivideByZero { line: 3 })
    );
}

#[test]
fn test_unlinked_call_fails_the_link_check() {
    let mut vm = new_vm();
    let main = assemble_listing(&mut vm, "call missing\n").unwrap();
    // The reference to `missing` is still unresolved
    let problems = vm.link_check();
    assert_eq!(problems.len(), 1);
    assert!(problems[0].to_string().contains("missing"));

    // Forcing execution runs into the placeholder call number
    assert_eq!(
        vm.execute(main),
        Err(ExecError::UndefinedProcedure(0))
    );
}

#[test]
fn test_sections_share_globals() {
    let vm = run("call init\n\
                  add gri1, 2\n\
                  %proc init\n\
                  mov gri1, 40\n");
    assert_eq!(global_int(&vm, 1), 42);
}

#[test]
fn test_cycle_statistics() {
    let vm = run("mov gri1, 1\nmov gri2, 2\n");
    // Two moves plus the appended ret
    assert_eq!(vm.stats().cycles, 3);
}
