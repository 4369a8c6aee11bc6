use std::rc::Rc;

use futures::{future::LocalBoxFuture, FutureExt};

use crate::{
    ast::Node,
    error::{ErrorKind, EvalResult, SignalKind, Unwind},
    scheduler::tag::TagId,
};

use super::{primitives::optional_string, Interpreter, Value};

impl Interpreter {
    /// `tag: expr`. The tag stays pushed for exactly the evaluation of `expr`; a
    /// stop or block aimed at this level completes the statement with its payload.
    pub(super) async fn visit_tagged(
        &mut self,
        tag: &Rc<Node>,
        expr: &Rc<Node>,
    ) -> EvalResult<Value> {
        let tag = self.resolve_tag(tag).await?;
        let scheduler = self.runtime.scheduler();
        let blocked = scheduler.tags().borrow().blocked(tag);
        if let Some(payload) = blocked {
            tracing::trace!(%tag, "skipping blocked statement");
            return Ok(payload);
        }

        let depth = self.job.push_tag(tag);
        scheduler.tags().borrow_mut().record_enter(tag);
        let result = if scheduler.is_frozen(&self.job) {
            match self.yield_now().await {
                Ok(()) => self.eval(expr).await,
                Err(unwind) => Err(unwind),
            }
        } else {
            self.eval(expr).await
        };
        self.job.pop_tag(tag);
        self.runtime
            .scheduler()
            .tags()
            .borrow_mut()
            .record_leave(tag);

        match result {
            Err(Unwind::Tag(signal)) if signal.depth == depth => {
                tracing::debug!(%tag, kind = ?signal.kind, "tagged statement interrupted");
                Ok(signal.payload)
            }
            other => other,
        }
    }

    async fn resolve_tag(&mut self, expr: &Rc<Node>) -> EvalResult<TagId> {
        if let Some(chain) = expr.tag_chain() {
            return Ok(self.resolve_tag_chain(&chain)?);
        }
        let value = self.eval(expr).await?;
        Ok(self.runtime.expect_tag("tag", &value)?)
    }

    /// Resolves `a.b.c`, creating the missing components as tags. A new component
    /// is stored as a slot on the previous one (the first one on `this`) and is a
    /// child of the previous component's tag.
    fn resolve_tag_chain(&mut self, chain: &[String]) -> Result<TagId, ErrorKind> {
        let mut current: Option<Value> = None;
        for name in chain {
            let found = match &current {
                None => self
                    .scope
                    .borrow()
                    .get(name)
                    .or_else(|| self.runtime.lookup(&self.this, name)),
                Some(Value::Object(object)) if object.tag().is_some() => object.own_slot(name),
                Some(value) => self.runtime.lookup(value, name),
            };
            let next = match found {
                Some(value) => value,
                None => {
                    let owner = current.clone().unwrap_or_else(|| self.this.clone());
                    let Value::Object(owner) = owner else {
                        return Err(ErrorKind::ArgumentType {
                            routine: name.clone(),
                            expected: "Object",
                            found: owner.type_name().to_string(),
                        });
                    };
                    let parent = current.as_ref().and_then(Value::as_tag);
                    let (_, tag) = self.runtime.create_tag(name, parent);
                    owner.set_slot(name, Value::Object(tag.clone()));
                    Value::Object(tag)
                }
            };
            current = Some(next);
        }
        let value = current.unwrap_or(Value::Void);
        self.runtime.expect_tag("tag", &value)
    }

    /// The tag of the innermost `{ }`, created and pushed on first use and stopped
    /// when the scope is left.
    pub(super) fn scope_tag(&mut self) -> Result<Value, ErrorKind> {
        let Some(frame) = self.scopes.last_mut() else {
            return Err(ErrorKind::Primitive(
                "Tag.scope: not inside a scope".to_string(),
            ));
        };
        if let Some((tag, _)) = frame.tag {
            return self
                .runtime
                .tag_object(tag)
                .map(Value::Object)
                .ok_or_else(|| ErrorKind::Lookup(tag.to_string()));
        }
        let (tag, object) = self.runtime.create_tag("scope", None);
        let depth = self.job.push_tag(tag);
        self.runtime
            .scheduler()
            .tags()
            .borrow_mut()
            .record_enter(tag);
        frame.tag = Some((tag, depth));
        Ok(Value::Object(object))
    }
}

fn signal(
    interpreter: &Interpreter,
    tag: TagId,
    kind: SignalKind,
    payload: Value,
) -> EvalResult<Value> {
    match interpreter
        .runtime
        .scheduler()
        .signal_tag(tag, kind, payload)
    {
        Some(unwind) => Err(unwind),
        None => Ok(Value::Void),
    }
}

pub(super) fn stop(
    interpreter: &mut Interpreter,
    target: &Value,
    args: &[Value],
) -> EvalResult<Value> {
    let tag = interpreter.runtime.expect_tag("stop", target)?;
    let payload = args.first().cloned().unwrap_or(Value::Void);
    tracing::debug!(%tag, "stop");
    signal(interpreter, tag, SignalKind::Stop, payload)
}

pub(super) fn block(
    interpreter: &mut Interpreter,
    target: &Value,
    args: &[Value],
) -> EvalResult<Value> {
    let tag = interpreter.runtime.expect_tag("block", target)?;
    let payload = args.first().cloned().unwrap_or(Value::Void);
    interpreter
        .runtime
        .scheduler()
        .tags()
        .borrow_mut()
        .block(tag, payload.clone());
    signal(interpreter, tag, SignalKind::Block, payload)
}

pub(super) fn unblock(
    interpreter: &mut Interpreter,
    target: &Value,
    _args: &[Value],
) -> EvalResult<Value> {
    let tag = interpreter.runtime.expect_tag("unblock", target)?;
    interpreter
        .runtime
        .scheduler()
        .tags()
        .borrow_mut()
        .unblock(tag);
    Ok(Value::Void)
}

/// Freezing a tag the current job holds suspends the job on the spot.
pub(super) fn freeze(
    interpreter: &mut Interpreter,
    target: Value,
    _args: Vec<Value>,
) -> LocalBoxFuture<'_, EvalResult<Value>> {
    async move {
        let tag = interpreter.runtime.expect_tag("freeze", &target)?;
        interpreter
            .runtime
            .scheduler()
            .tags()
            .borrow_mut()
            .freeze(tag);
        if interpreter.runtime.scheduler().is_frozen(&interpreter.job) {
            interpreter.yield_now().await?;
        }
        Ok(Value::Void)
    }
    .boxed_local()
}

pub(super) fn unfreeze(
    interpreter: &mut Interpreter,
    target: &Value,
    _args: &[Value],
) -> EvalResult<Value> {
    let tag = interpreter.runtime.expect_tag("unfreeze", target)?;
    interpreter
        .runtime
        .scheduler()
        .tags()
        .borrow_mut()
        .unfreeze(tag);
    Ok(Value::Void)
}

pub(super) fn frozen(
    interpreter: &mut Interpreter,
    target: &Value,
    _args: &[Value],
) -> EvalResult<Value> {
    let tag = interpreter.runtime.expect_tag("frozen", target)?;
    let frozen = interpreter.runtime.scheduler().tags().borrow().is_frozen(tag);
    Ok(Value::Boolean(frozen))
}

pub(super) fn blocked(
    interpreter: &mut Interpreter,
    target: &Value,
    _args: &[Value],
) -> EvalResult<Value> {
    let tag = interpreter.runtime.expect_tag("blocked", target)?;
    let blocked = interpreter
        .runtime
        .scheduler()
        .tags()
        .borrow()
        .blocked(tag)
        .is_some();
    Ok(Value::Boolean(blocked))
}

pub(super) fn name(
    interpreter: &mut Interpreter,
    target: &Value,
    _args: &[Value],
) -> EvalResult<Value> {
    let tag = interpreter.runtime.expect_tag("name", target)?;
    let name = interpreter
        .runtime
        .scheduler()
        .tags()
        .borrow()
        .name(tag)
        .map(str::to_string)
        .ok_or_else(|| ErrorKind::Lookup(tag.to_string()))?;
    Ok(Value::String(name.into()))
}

pub(super) fn parent(
    interpreter: &mut Interpreter,
    target: &Value,
    _args: &[Value],
) -> EvalResult<Value> {
    let tag = interpreter.runtime.expect_tag("parent", target)?;
    let parent = interpreter.runtime.scheduler().tags().borrow().parent(tag);
    Ok(parent
        .and_then(|parent| interpreter.runtime.tag_object(parent))
        .map_or(Value::Nil, Value::Object))
}

/// `Tag.new(name)` makes a child of the root tag; `t.new(name)` a child of `t`.
pub(super) fn new(
    interpreter: &mut Interpreter,
    target: &Value,
    args: &[Value],
) -> EvalResult<Value> {
    let name = optional_string("new", args.first())?.unwrap_or_else(|| "tag".into());
    let parent = target.as_tag();
    let (_, object) = interpreter.runtime.create_tag(&name, parent);
    Ok(Value::Object(object))
}

pub(super) fn scope(
    interpreter: &mut Interpreter,
    _target: &Value,
    _args: &[Value],
) -> EvalResult<Value> {
    Ok(interpreter.scope_tag()?)
}

pub(super) fn enter_count(
    interpreter: &mut Interpreter,
    target: &Value,
    _args: &[Value],
) -> EvalResult<Value> {
    let tag = interpreter.runtime.expect_tag("enterCount", target)?;
    let count = interpreter.runtime.scheduler().tags().borrow().enters(tag);
    Ok(Value::Float(count as f64))
}

pub(super) fn leave_count(
    interpreter: &mut Interpreter,
    target: &Value,
    _args: &[Value],
) -> EvalResult<Value> {
    let tag = interpreter.runtime.expect_tag("leaveCount", target)?;
    let count = interpreter.runtime.scheduler().tags().borrow().leaves(tag);
    Ok(Value::Float(count as f64))
}
