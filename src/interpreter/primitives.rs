//! Built-in slots of the standard prototypes.

use std::{rc::Rc, time::Duration};

use futures::{future::LocalBoxFuture, FutureExt};

use crate::{
    error::{ErrorKind, EvalResult, Unwind},
    runtime::Protos,
};

use super::{
    callable::{
        Arity, AsyncFn, CallMessage, Callable, LazyBody, LazyFn, StrictBody, SyncFn, Thunk,
    },
    tags, Interpreter, Object, Spawn, Value, Work,
};

fn def_sync(object: &Object, name: &str, arity: Arity, f: SyncFn) {
    object.set_slot(
        name,
        Value::Code(Rc::new(Callable::Strict(StrictBody::Sync(f, arity)))),
    );
}

fn def_async(object: &Object, name: &str, arity: Arity, f: AsyncFn) {
    object.set_slot(
        name,
        Value::Code(Rc::new(Callable::Strict(StrictBody::Async(f, arity)))),
    );
}

fn def_lazy(object: &Object, name: &str, f: LazyFn) {
    object.set_slot(name, Value::Code(Rc::new(Callable::Lazy(LazyBody::Native(f)))));
}

pub fn install(protos: &Protos) {
    let global = &protos.global;
    global.set_slot("true", Value::Boolean(true));
    global.set_slot("false", Value::Boolean(false));
    global.set_slot("nil", Value::Nil);
    global.set_slot("void", Value::Void);
    for proto in [
        &protos.global,
        &protos.object,
        &protos.boolean,
        &protos.float,
        &protos.string,
        &protos.list,
        &protos.code,
        &protos.call,
        &protos.tag,
    ] {
        if let Some(name) = &proto.name {
            global.set_slot(name, Value::Object(proto.clone()));
        }
    }
    def_async(global, "sleep", Arity::Exact(1), sleep);
    def_async(global, "yield", Arity::Exact(0), yield_);
    def_sync(global, "echo", Arity::Exact(1), echo);
    def_sync(global, "time", Arity::Exact(0), time);
    def_lazy(global, "timeout", timeout);
    def_lazy(global, "detach", detach);
    def_lazy(global, "nonInterruptible", non_interruptible);

    let object = &protos.object;
    def_sync(object, "clone", Arity::Exact(0), clone);
    def_sync(object, "setSlot", Arity::Exact(2), set_slot);
    def_sync(object, "getSlot", Arity::Exact(1), get_slot);
    def_sync(object, "updateSlot", Arity::Exact(2), update_slot);
    def_sync(object, "hasSlot", Arity::Exact(1), has_slot);
    def_sync(object, "removeSlot", Arity::Exact(1), remove_slot);
    def_sync(object, "slotNames", Arity::Exact(0), slot_names);
    def_sync(object, "set", Arity::Exact(1), set);
    def_sync(object, "get", Arity::Exact(0), get);
    def_sync(object, "==", Arity::Exact(1), equal);
    def_sync(object, "!=", Arity::Exact(1), not_equal);
    def_sync(object, "asString", Arity::Exact(0), as_string);

    def_sync(&protos.boolean, "!", Arity::Exact(0), not);

    let float = &protos.float;
    def_sync(float, "+", Arity::Exact(1), add);
    def_sync(float, "-", Arity::Exact(1), sub);
    def_sync(float, "*", Arity::Exact(1), mul);
    def_sync(float, "/", Arity::Exact(1), div);
    def_sync(float, "%", Arity::Exact(1), rem);
    def_sync(float, "<", Arity::Exact(1), less);
    def_sync(float, "<=", Arity::Exact(1), less_equal);
    def_sync(float, ">", Arity::Exact(1), greater);
    def_sync(float, ">=", Arity::Exact(1), greater_equal);

    let string = &protos.string;
    def_sync(string, "+", Arity::Exact(1), concat);
    def_sync(string, "size", Arity::Exact(0), size);

    let list = &protos.list;
    def_sync(list, "size", Arity::Exact(0), size);
    def_sync(list, "[]", Arity::Exact(1), index);
    def_sync(list, "+", Arity::Exact(1), concat);
    def_sync(list, "push", Arity::Exact(1), push);

    def_async(&protos.code, "apply", Arity::Exact(1), apply);

    let call = &protos.call;
    def_async(call, "evalArgAt", Arity::Exact(1), eval_arg_at);
    def_sync(call, "argsCount", Arity::Exact(0), args_count);
    def_sync(call, "message", Arity::Exact(0), message);
    def_sync(call, "target", Arity::Exact(0), target);
    def_sync(call, "sender", Arity::Exact(0), sender);

    let tag = &protos.tag;
    def_sync(tag, "stop", Arity::Range(0, 1), tags::stop);
    def_sync(tag, "block", Arity::Range(0, 1), tags::block);
    def_sync(tag, "unblock", Arity::Exact(0), tags::unblock);
    def_async(tag, "freeze", Arity::Exact(0), tags::freeze);
    def_sync(tag, "unfreeze", Arity::Exact(0), tags::unfreeze);
    def_sync(tag, "frozen", Arity::Exact(0), tags::frozen);
    def_sync(tag, "blocked", Arity::Exact(0), tags::blocked);
    def_sync(tag, "name", Arity::Exact(0), tags::name);
    def_sync(tag, "parent", Arity::Exact(0), tags::parent);
    def_sync(tag, "new", Arity::Range(0, 1), tags::new);
    def_sync(tag, "scope", Arity::Exact(0), tags::scope);
    def_sync(tag, "enterCount", Arity::Exact(0), tags::enter_count);
    def_sync(tag, "leaveCount", Arity::Exact(0), tags::leave_count);
}

fn type_error(routine: &str, expected: &'static str, found: &Value) -> ErrorKind {
    ErrorKind::ArgumentType {
        routine: routine.to_string(),
        expected,
        found: found.type_name().to_string(),
    }
}

pub(super) fn expect_float(routine: &str, value: &Value) -> Result<f64, ErrorKind> {
    match value {
        Value::Float(v) => Ok(*v),
        other => Err(type_error(routine, "Float", other)),
    }
}

pub(super) fn expect_string(routine: &str, value: &Value) -> Result<Rc<str>, ErrorKind> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(type_error(routine, "String", other)),
    }
}

pub(super) fn optional_string(
    routine: &str,
    value: Option<&Value>,
) -> Result<Option<Rc<str>>, ErrorKind> {
    value.map(|value| expect_string(routine, value)).transpose()
}

pub(super) fn expect_object(routine: &str, value: &Value) -> Result<Rc<Object>, ErrorKind> {
    match value {
        Value::Object(object) => Ok(object.clone()),
        other => Err(type_error(routine, "Object", other)),
    }
}

/// A non-negative number of seconds.
pub(super) fn duration(routine: &str, value: &Value) -> Result<Duration, ErrorKind> {
    let seconds = expect_float(routine, value)?;
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| ErrorKind::Primitive(format!("{}: invalid duration {}", routine, seconds)))
}

fn sleep(
    interpreter: &mut Interpreter,
    _target: Value,
    args: Vec<Value>,
) -> LocalBoxFuture<'_, EvalResult<Value>> {
    async move {
        let delay = duration("sleep", &args[0])?;
        interpreter.sleep(delay).await?;
        Ok(Value::Void)
    }
    .boxed_local()
}

fn yield_(
    interpreter: &mut Interpreter,
    _target: Value,
    _args: Vec<Value>,
) -> LocalBoxFuture<'_, EvalResult<Value>> {
    async move {
        interpreter.yield_now().await?;
        Ok(Value::Void)
    }
    .boxed_local()
}

fn echo(interpreter: &mut Interpreter, _target: &Value, args: &[Value]) -> EvalResult<Value> {
    interpreter.runtime.send("output", &args[0].as_text());
    Ok(Value::Void)
}

fn time(interpreter: &mut Interpreter, _target: &Value, _args: &[Value]) -> EvalResult<Value> {
    Ok(Value::Float(interpreter.runtime.scheduler().now().as_secs_f64()))
}

fn expect_args(call: &CallMessage, count: usize) -> Result<(), ErrorKind> {
    Arity::Exact(count).check(&call.message, call.args.len())
}

/// `timeout(delay, expr)`: a timer job stops `expr` through a private tag unless
/// `expr` finishes first, in which case the timer is killed.
fn timeout(
    interpreter: &mut Interpreter,
    call: Rc<CallMessage>,
) -> LocalBoxFuture<'_, EvalResult<Value>> {
    async move {
        expect_args(&call, 2)?;
        let value = interpreter.eval_arg(&call, 0).await?;
        let delay = duration("timeout", &value)?;
        let (tag, _) = interpreter.runtime.create_tag("timeout", None);
        let timer = interpreter.spawn("timeout", Work::Timer { delay, tag }, Spawn::Isolated);

        let depth = interpreter.job.push_tag(tag);
        let result = interpreter.eval_arg(&call, 1).await;
        interpreter.job.pop_tag(tag);
        interpreter.runtime.scheduler().terminate(timer.id);
        interpreter.runtime.release_tag(tag);

        match result {
            Err(Unwind::Tag(signal)) if signal.depth == depth && signal.tag == tag => {
                tracing::debug!("timed out");
                Ok(Value::Void)
            }
            other => other,
        }
    }
    .boxed_local()
}

/// `detach(expr)`: runs `expr` in an independent job that holds none of the
/// caller's tags.
fn detach(
    interpreter: &mut Interpreter,
    call: Rc<CallMessage>,
) -> LocalBoxFuture<'_, EvalResult<Value>> {
    async move {
        expect_args(&call, 1)?;
        let work = match &call.args[0] {
            Thunk::Pending(node) => Work::Eval(node.clone()),
            Thunk::Ready(value) => return Ok(value.clone()),
        };
        interpreter.spawn_with(
            "detach",
            work,
            Spawn::Isolated,
            call.scope.clone(),
            call.sender.clone(),
        );
        Ok(Value::Void)
    }
    .boxed_local()
}

fn non_interruptible(
    interpreter: &mut Interpreter,
    call: Rc<CallMessage>,
) -> LocalBoxFuture<'_, EvalResult<Value>> {
    async move {
        expect_args(&call, 1)?;
        let previous = interpreter.job.non_interruptible();
        interpreter.job.set_non_interruptible(true);
        let result = interpreter.eval_arg(&call, 0).await;
        interpreter.job.set_non_interruptible(previous);
        result
    }
    .boxed_local()
}

fn clone(_interpreter: &mut Interpreter, target: &Value, _args: &[Value]) -> EvalResult<Value> {
    let proto = expect_object("clone", target)?;
    Ok(Value::Object(Object::clone_of(&proto)))
}

fn set_slot(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let object = expect_object("setSlot", target)?;
    let name = expect_string("setSlot", &args[0])?;
    object.set_slot(&name, args[1].clone());
    Ok(args[1].clone())
}

fn get_slot(interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let name = expect_string("getSlot", &args[0])?;
    interpreter
        .runtime
        .lookup(target, &name)
        .ok_or_else(|| ErrorKind::Lookup(name.to_string()).into())
}

fn update_slot(
    _interpreter: &mut Interpreter,
    target: &Value,
    args: &[Value],
) -> EvalResult<Value> {
    let object = expect_object("updateSlot", target)?;
    let name = expect_string("updateSlot", &args[0])?;
    object
        .update_slot(&name, args[1].clone())
        .ok_or_else(|| ErrorKind::Lookup(name.to_string()).into())
}

fn has_slot(interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let name = expect_string("hasSlot", &args[0])?;
    Ok(Value::Boolean(
        interpreter.runtime.lookup(target, &name).is_some(),
    ))
}

fn remove_slot(
    _interpreter: &mut Interpreter,
    target: &Value,
    args: &[Value],
) -> EvalResult<Value> {
    let object = expect_object("removeSlot", target)?;
    let name = expect_string("removeSlot", &args[0])?;
    Ok(object.remove_slot(&name).unwrap_or(Value::Void))
}

fn slot_names(
    _interpreter: &mut Interpreter,
    target: &Value,
    _args: &[Value],
) -> EvalResult<Value> {
    let object = expect_object("slotNames", target)?;
    Ok(Value::list(
        object
            .slot_names()
            .into_iter()
            .map(|name| Value::String(name.into()))
            .collect(),
    ))
}

/// `o.set(v)` stores `v` in the own `value` slot of `o`.
fn set(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let object = expect_object("set", target)?;
    object.set_slot("value", args[0].clone());
    Ok(args[0].clone())
}

fn get(_interpreter: &mut Interpreter, target: &Value, _args: &[Value]) -> EvalResult<Value> {
    let object = expect_object("get", target)?;
    object
        .lookup("value")
        .ok_or_else(|| ErrorKind::Lookup("value".to_string()).into())
}

fn equal(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    Ok(Value::Boolean(*target == args[0]))
}

fn not_equal(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    Ok(Value::Boolean(*target != args[0]))
}

fn as_string(_interpreter: &mut Interpreter, target: &Value, _args: &[Value]) -> EvalResult<Value> {
    Ok(Value::String(target.as_text().into()))
}

fn not(_interpreter: &mut Interpreter, target: &Value, _args: &[Value]) -> EvalResult<Value> {
    Ok(Value::Boolean(!target.is_true()))
}

fn operands(routine: &str, target: &Value, args: &[Value]) -> Result<(f64, f64), ErrorKind> {
    Ok((expect_float(routine, target)?, expect_float(routine, &args[0])?))
}

fn add(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let (a, b) = operands("+", target, args)?;
    Ok(Value::Float(a + b))
}

fn sub(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let (a, b) = operands("-", target, args)?;
    Ok(Value::Float(a - b))
}

fn mul(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let (a, b) = operands("*", target, args)?;
    Ok(Value::Float(a * b))
}

fn div(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let (a, b) = operands("/", target, args)?;
    if b == 0.0 {
        return Err(ErrorKind::Primitive("/: division by zero".to_string()).into());
    }
    Ok(Value::Float(a / b))
}

fn rem(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let (a, b) = operands("%", target, args)?;
    if b == 0.0 {
        return Err(ErrorKind::Primitive("%: division by zero".to_string()).into());
    }
    Ok(Value::Float(a % b))
}

fn less(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let (a, b) = operands("<", target, args)?;
    Ok(Value::Boolean(a < b))
}

fn less_equal(
    _interpreter: &mut Interpreter,
    target: &Value,
    args: &[Value],
) -> EvalResult<Value> {
    let (a, b) = operands("<=", target, args)?;
    Ok(Value::Boolean(a <= b))
}

fn greater(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let (a, b) = operands(">", target, args)?;
    Ok(Value::Boolean(a > b))
}

fn greater_equal(
    _interpreter: &mut Interpreter,
    target: &Value,
    args: &[Value],
) -> EvalResult<Value> {
    let (a, b) = operands(">=", target, args)?;
    Ok(Value::Boolean(a >= b))
}

/// `+` on strings appends the text of any value; on lists it concatenates two lists.
fn concat(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    match (target, &args[0]) {
        (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, b.as_text()).into())),
        (Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (Value::List(_), other) => Err(type_error("+", "List", other).into()),
        (other, _) => Err(type_error("+", "String", other).into()),
    }
}

fn size(_interpreter: &mut Interpreter, target: &Value, _args: &[Value]) -> EvalResult<Value> {
    match target {
        Value::String(s) => Ok(Value::Float(s.chars().count() as f64)),
        Value::List(items) => Ok(Value::Float(items.borrow().len() as f64)),
        other => Err(type_error("size", "List", other).into()),
    }
}

fn index(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let Value::List(items) = target else {
        return Err(type_error("[]", "List", target).into());
    };
    let position = expect_float("[]", &args[0])?;
    let items = items.borrow();
    if position < 0.0 || position.fract() != 0.0 || position as usize >= items.len() {
        return Err(ErrorKind::Primitive(format!(
            "[]: invalid index {} for a list of size {}",
            position,
            items.len()
        ))
        .into());
    }
    Ok(items[position as usize].clone())
}

fn push(_interpreter: &mut Interpreter, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let Value::List(items) = target else {
        return Err(type_error("push", "List", target).into());
    };
    items.borrow_mut().push(args[0].clone());
    Ok(target.clone())
}

/// `f.apply([args])` calls `f` with values that are already evaluated.
fn apply(
    interpreter: &mut Interpreter,
    target: Value,
    args: Vec<Value>,
) -> LocalBoxFuture<'_, EvalResult<Value>> {
    async move {
        let Value::Code(callable) = target else {
            return Err(type_error("apply", "Code", &target).into());
        };
        let Value::List(items) = &args[0] else {
            return Err(type_error("apply", "List", &args[0]).into());
        };
        let values = items.borrow().clone();
        let this = interpreter.this.clone();
        interpreter.apply_code(callable, "apply", this, values).await
    }
    .boxed_local()
}

fn expect_call(routine: &str, value: &Value) -> Result<Rc<CallMessage>, ErrorKind> {
    match value {
        Value::Call(call) => Ok(call.clone()),
        other => Err(type_error(routine, "CallMessage", other)),
    }
}

fn eval_arg_at(
    interpreter: &mut Interpreter,
    target: Value,
    args: Vec<Value>,
) -> LocalBoxFuture<'_, EvalResult<Value>> {
    async move {
        let call = expect_call("evalArgAt", &target)?;
        let position = expect_float("evalArgAt", &args[0])?;
        if position < 0.0 || position.fract() != 0.0 {
            return Err(ErrorKind::Primitive(format!(
                "evalArgAt: invalid index {}",
                position
            ))
            .into());
        }
        interpreter.eval_arg(&call, position as usize).await
    }
    .boxed_local()
}

fn args_count(_interpreter: &mut Interpreter, target: &Value, _args: &[Value]) -> EvalResult<Value> {
    let call = expect_call("argsCount", target)?;
    Ok(Value::Float(call.args.len() as f64))
}

fn message(_interpreter: &mut Interpreter, target: &Value, _args: &[Value]) -> EvalResult<Value> {
    let call = expect_call("message", target)?;
    Ok(Value::String(call.message.as_str().into()))
}

fn target(_interpreter: &mut Interpreter, target: &Value, _args: &[Value]) -> EvalResult<Value> {
    Ok(expect_call("target", target)?.target.clone())
}

fn sender(_interpreter: &mut Interpreter, target: &Value, _args: &[Value]) -> EvalResult<Value> {
    Ok(expect_call("sender", target)?.sender.clone())
}
