use crate::object::{Value, FALSE, NIL, TRUE};

use super::{RuntimeError, Vm};

pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>;

pub(super) fn install(vm: &mut Vm) {
    vm.define_native("clock", Some(0), clock);
    vm.define_native("print", None, print);
    vm.define_native("assert", None, assert);
    vm.define_native("callable?", Some(1), callable);
}

/// Seconds since the VM was created.
fn clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(vm.started.elapsed().as_secs_f64()))
}

fn print(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut out = vm.stdout.borrow_mut();
    for arg in args {
        write!(out, "{}", arg)?;
    }
    writeln!(out)?;
    Ok(NIL)
}

fn assert(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let (condition, message) = match args {
        [condition] => (condition, None),
        [condition, message] => (condition, Some(message)),
        _ => {
            return Err(RuntimeError::NativeArgument {
                name: "assert",
                message: format!("Expected 1 or 2 arguments but got {}.", args.len()),
            })
        }
    };

    if condition.is_falsey() {
        let message = message.map_or_else(|| "Assertion failed.".to_string(), Value::to_string);
        return Err(RuntimeError::AssertionFailed(message));
    }
    Ok(NIL)
}

fn callable(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(if args[0].is_callable() { TRUE } else { FALSE })
}
