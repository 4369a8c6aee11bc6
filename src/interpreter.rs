mod callable;
mod control;
mod object;
pub(crate) mod primitives;
mod scope;
mod tags;

use std::{
    cell::RefCell,
    fmt::{Debug, Display},
    mem,
    rc::Rc,
    time::Duration,
};

use futures::{future::LocalBoxFuture, FutureExt};

use crate::{
    ast::{Flavor, Node, NodeKind},
    error::{DomainError, ErrorKind, EvalResult, FlowSignal, Frame, SignalKind, Unwind},
    runtime::Runtime,
    scheduler::{
        job::{Job, Suspend, Suspension},
        tag::TagId,
        JobOutcome,
    },
    span::Span,
};

pub use self::{
    callable::{Arity, Callable, CallMessage, Capture, LazyBody, StrictBody, Thunk},
    object::{Object, ObjectKind},
    scope::Scope,
};

#[derive(Debug, Clone)]
pub enum Value {
    Void,
    Nil,
    Boolean(bool),
    Float(f64),
    String(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Object(Rc<Object>),
    Code(Rc<Callable>),
    Call(Rc<CallMessage>),
}

impl Value {
    pub fn list(values: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(values)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Nil => "nil",
            Value::Boolean(_) => "Boolean",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::List(_) => "List",
            Value::Object(object) if object.tag().is_some() => "Tag",
            Value::Object(_) => "Object",
            Value::Code(_) => "Code",
            Value::Call(_) => "CallMessage",
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn is_true(&self) -> bool {
        match self {
            Value::Void | Value::Nil => false,
            Value::Boolean(b) => *b,
            Value::Float(v) => *v != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Object(_) | Value::Code(_) | Value::Call(_) => true,
        }
    }

    pub fn as_tag(&self) -> Option<TagId> {
        match self {
            Value::Object(object) => object.tag(),
            _ => None,
        }
    }

    /// Text without quotes, as `echo` prints it.
    pub fn as_text(&self) -> String {
        match self {
            Value::String(s) => s.to_string(),
            other => other.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) | (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Code(a), Value::Code(b)) => Rc::ptr_eq(a, b),
            (Value::Call(a), Value::Call(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(object) => match (&object.kind, &object.name) {
                (ObjectKind::Tag(_), Some(name)) => write!(f, "Tag<{}>", name),
                (_, Some(name)) => write!(f, "{}", name),
                (_, None) => write!(f, "Object"),
            },
            Value::Code(callable) => write!(f, "{}", callable),
            Value::Call(call) => write!(f, "call<{}>", call.message),
        }
    }
}

/// What a job runs.
#[derive(Debug)]
pub enum Work {
    Eval(Rc<Node>),
    Apply {
        function: Value,
        args: Vec<Value>,
    },
    /// The polling loop behind `at`.
    At {
        test: Rc<Node>,
        body: Rc<Node>,
        onleave: Option<Rc<Node>>,
    },
    /// Stops `tag` once `delay` has elapsed.
    Timer {
        delay: Duration,
        tag: TagId,
    },
}

/// Where a job started by the host leaves its result.
pub type Sink = Rc<RefCell<Option<Result<Value, DomainError>>>>;

/// How a spawned job relates to the spawning one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spawn {
    /// Dies with the spawner, reports errors to it, inherits its tags.
    Linked,
    /// Independent, reports its own errors, inherits the spawner's tags.
    Detached,
    /// Independent and tag-free.
    Isolated,
}

#[derive(Debug, Default)]
struct ScopeFrame {
    tag: Option<(TagId, usize)>,
    spawned: Vec<Rc<Job>>,
}

/// The evaluator running inside one job.
pub struct Interpreter {
    runtime: Rc<Runtime>,
    job: Rc<Job>,
    scope: Rc<RefCell<Scope>>,
    this: Value,
    call: Option<Rc<CallMessage>>,
    frames: Vec<Frame>,
    result: Value,
    scopes: Vec<ScopeFrame>,
    caught: Vec<DomainError>,
    sink: Option<Sink>,
}

impl Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("job", &self.job.id)
            .field("this", &self.this)
            .field("frames", &self.frames)
            .field("result", &self.result)
            .finish()
    }
}

impl Interpreter {
    pub fn new(
        runtime: Rc<Runtime>,
        job: Rc<Job>,
        scope: Rc<RefCell<Scope>>,
        this: Value,
        call: Option<Rc<CallMessage>>,
        sink: Option<Sink>,
    ) -> Self {
        Interpreter {
            runtime,
            job,
            scope,
            this,
            call,
            frames: Vec::new(),
            result: Value::Void,
            scopes: Vec::new(),
            caught: Vec::new(),
            sink,
        }
    }

    pub fn job(&self) -> &Rc<Job> {
        &self.job
    }

    pub fn runtime(&self) -> &Rc<Runtime> {
        &self.runtime
    }

    /// The value of the last completed node.
    pub fn result(&self) -> &Value {
        &self.result
    }

    /// Entry point of every job: runs `work` and turns whatever escapes into the
    /// job's outcome. Stop and termination end the job quietly.
    pub async fn work(mut self, work: Work) -> JobOutcome {
        let result = match self.check_pending() {
            Ok(()) => self.run_work(work).await,
            Err(unwind) => Err(unwind),
        };
        let mut error = match result {
            Ok(value) => {
                if let Some(sink) = &self.sink {
                    *sink.borrow_mut() = Some(Ok(value));
                }
                return JobOutcome::Done;
            }
            Err(Unwind::Error(error)) => error,
            Err(Unwind::Flow(signal)) => signal.stray(),
            Err(Unwind::Tag(_) | Unwind::Terminate) => {
                tracing::debug!(id = %self.job.id, "job stopped");
                if let Some(sink) = &self.sink {
                    *sink.borrow_mut() = Some(Ok(Value::Void));
                }
                return JobOutcome::Done;
            }
        };
        error.attach_backtrace(&self.frames);
        if let Some(sink) = &self.sink {
            *sink.borrow_mut() = Some(Err(error.clone()));
        } else if self.job.parent.is_none() {
            self.runtime.show_error(&error);
        }
        JobOutcome::Failed(error)
    }

    async fn run_work(&mut self, work: Work) -> EvalResult<Value> {
        match work {
            Work::Eval(node) => self.eval(&node).await,
            Work::Apply { function, args } => match function {
                Value::Code(callable) => {
                    let this = self.this.clone();
                    self.apply_code(callable, "apply", this, args).await
                }
                other => Err(ErrorKind::ArgumentType {
                    routine: "apply".to_string(),
                    expected: "Code",
                    found: other.type_name().to_string(),
                }
                .into()),
            },
            Work::At {
                test,
                body,
                onleave,
            } => self.watch(&test, &body, onleave.as_ref()).await,
            Work::Timer { delay, tag } => {
                self.sleep(delay).await?;
                tracing::debug!(%tag, "timeout expired");
                match self.runtime.scheduler().signal_tag(tag, SignalKind::Stop, Value::Void) {
                    Some(unwind) => Err(unwind),
                    None => Ok(Value::Void),
                }
            }
        }
    }

    /// Evaluates a node. Errors get the node's location if they have none yet, and
    /// any unwinding resets the current value to void.
    pub fn eval<'a>(&'a mut self, node: &'a Rc<Node>) -> LocalBoxFuture<'a, EvalResult<Value>> {
        async move {
            let mut result = self.visit(node).await;
            match &mut result {
                Ok(value) => self.result = value.clone(),
                Err(unwind) => {
                    if let Unwind::Error(error) = unwind {
                        error.locate(&node.span);
                    }
                    self.result = Value::Void;
                }
            }
            result
        }
        .boxed_local()
    }

    async fn visit(&mut self, node: &Rc<Node>) -> EvalResult<Value> {
        match &node.kind {
            NodeKind::Float(v) => Ok(Value::Float(*v)),
            NodeKind::String(s) => Ok(Value::String(s.as_str().into())),
            NodeKind::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item).await?);
                }
                Ok(Value::list(values))
            }
            NodeKind::Call { target, name, args } => {
                self.visit_call(target.as_ref(), name, args.as_deref(), &node.span)
                    .await
            }
            NodeKind::Declare { name, value } => {
                let value = match value {
                    Some(value) => self.eval(value).await?,
                    None => Value::Void,
                };
                self.scope
                    .borrow_mut()
                    .declare(name.clone(), value.clone());
                Ok(value)
            }
            NodeKind::Assign {
                target,
                name,
                value,
            } => self.visit_assign(target.as_ref(), name, value).await,
            NodeKind::Nary { children, toplevel } => {
                if *toplevel {
                    self.visit_toplevel(children).await
                } else {
                    self.visit_sequence(children).await
                }
            }
            NodeKind::Stmt { expr, .. } => self.eval(expr).await,
            NodeKind::And { lhs, rhs } => self.visit_and(lhs, rhs).await,
            NodeKind::Pipe { lhs, rhs } => {
                self.eval(lhs).await?;
                self.eval(rhs).await
            }
            NodeKind::Scope(body) => self.visit_scope(body).await,
            NodeKind::Do { target, body } => {
                let target = self.eval(target).await?;
                let this = mem::replace(&mut self.this, target.clone());
                let result = self.visit_scope(body).await;
                self.this = this;
                result?;
                Ok(target)
            }
            NodeKind::If {
                test,
                then,
                otherwise,
            } => {
                if self.eval(test).await?.is_true() {
                    self.eval(then).await
                } else if let Some(otherwise) = otherwise {
                    self.eval(otherwise).await
                } else {
                    Ok(Value::Void)
                }
            }
            NodeKind::While { flavor, test, body } => self.visit_while(*flavor, test, body).await,
            NodeKind::Foreach {
                flavor,
                index,
                list,
                body,
            } => self.visit_foreach(*flavor, index, list, body).await,
            NodeKind::Every {
                flavor,
                period,
                body,
            } => self.visit_every(*flavor, period, body).await,
            NodeKind::At {
                test,
                body,
                onleave,
            } => {
                self.spawn(
                    "at",
                    Work::At {
                        test: test.clone(),
                        body: body.clone(),
                        onleave: onleave.clone(),
                    },
                    Spawn::Detached,
                );
                Ok(Value::Void)
            }
            NodeKind::TaggedStmt { tag, expr } => self.visit_tagged(tag, expr).await,
            NodeKind::Throw(value) => match value {
                Some(value) => {
                    let value = self.eval(value).await?;
                    Err(ErrorKind::Thrown(value).into())
                }
                None => match self.caught.last() {
                    Some(error) => Err(Unwind::Error(error.clone())),
                    None => Err(ErrorKind::Primitive(
                        "throw: no exception to rethrow".to_string(),
                    )
                    .into()),
                },
            },
            NodeKind::Try {
                body,
                binding,
                handler,
            } => match self.eval(body).await {
                Err(Unwind::Error(error)) => {
                    tracing::debug!(%error, "caught");
                    let scope = Scope::boxed(Some(self.scope.clone()));
                    if let Some(name) = binding {
                        scope.borrow_mut().declare(name.clone(), error.value());
                    }
                    let saved = mem::replace(&mut self.scope, scope);
                    self.caught.push(error);
                    let result = self.eval(handler).await;
                    self.caught.pop();
                    self.scope = saved;
                    result
                }
                other => other,
            },
            NodeKind::Break => Err(Unwind::Flow(FlowSignal::Break)),
            NodeKind::Continue => Err(Unwind::Flow(FlowSignal::Continue)),
            NodeKind::Return(value) => {
                let value = match value {
                    Some(value) => self.eval(value).await?,
                    None => Value::Void,
                };
                Err(Unwind::Flow(FlowSignal::Return(value)))
            }
            NodeKind::Function {
                params,
                body,
                closure,
            } => {
                let capture = closure.then(|| Capture {
                    scope: self.scope.clone(),
                    this: self.this.clone(),
                });
                let callable = match params {
                    Some(params) => Callable::Strict(StrictBody::Routine {
                        params: params.clone(),
                        body: body.clone(),
                        capture,
                    }),
                    None => Callable::Lazy(LazyBody::Routine {
                        body: body.clone(),
                        capture,
                    }),
                };
                Ok(Value::Code(Rc::new(callable)))
            }
            NodeKind::This => Ok(self.this.clone()),
            NodeKind::CallMsg => match &self.call {
                Some(call) => Ok(Value::Call(call.clone())),
                None => Err(ErrorKind::Lookup("call".to_string()).into()),
            },
            NodeKind::Message { channel, text } => {
                self.runtime.send(channel, text);
                Ok(Value::Void)
            }
            NodeKind::Noop => Ok(Value::Void),
        }
    }

    async fn visit_assign(
        &mut self,
        target: Option<&Rc<Node>>,
        name: &str,
        value: &Rc<Node>,
    ) -> EvalResult<Value> {
        let target = match target {
            Some(target) => Some(self.eval(target).await?),
            None => None,
        };
        let value = self.eval(value).await?;
        match target {
            Some(Value::Object(object)) => object.set_slot(name, value.clone()),
            Some(other) => {
                return Err(ErrorKind::ArgumentType {
                    routine: format!("{} =", name),
                    expected: "Object",
                    found: other.type_name().to_string(),
                }
                .into())
            }
            None => {
                if self.scope.borrow_mut().assign(name, &value).is_none() {
                    let updated = match &self.this {
                        Value::Object(object) => object.update_slot(name, value.clone()),
                        _ => None,
                    };
                    if updated.is_none() {
                        return Err(ErrorKind::Lookup(name.to_string()).into());
                    }
                }
            }
        }
        Ok(value)
    }

    /// Statements run in order with a scheduler round between them; `,` and `&`
    /// statements are spawned and left running.
    async fn visit_sequence(&mut self, children: &[Rc<Node>]) -> EvalResult<Value> {
        let mut value = Value::Void;
        let mut previous: Option<Flavor> = None;
        for child in children {
            if previous.is_some_and(separates) {
                self.yield_now().await?;
            }
            let flavor = statement_flavor(child);
            if flavor.is_concurrent() {
                self.spawn_statement(child, false);
                value = Value::Void;
            } else {
                value = self.eval(child).await?;
            }
            previous = Some(flavor);
        }
        Ok(value)
    }

    /// Like a sequence, but each statement fails on its own: errors and stray
    /// signals are reported and the next statement runs.
    async fn visit_toplevel(&mut self, children: &[Rc<Node>]) -> EvalResult<Value> {
        let mut value = Value::Void;
        let mut previous: Option<Flavor> = None;
        for child in children {
            if previous.is_some_and(separates) {
                let pending = self.yield_now().await;
                self.report(pending.map(|()| Value::Void))?;
            }
            let flavor = statement_flavor(child);
            previous = Some(flavor);
            if flavor.is_concurrent() {
                self.spawn_statement(child, true);
                continue;
            }
            let result = self.eval(child).await;
            value = self.report(result)?;
        }
        Ok(value)
    }

    fn report(&mut self, result: EvalResult<Value>) -> EvalResult<Value> {
        match result {
            Ok(value) => {
                if !value.is_void() && self.runtime.config().report_results {
                    self.runtime.send("result", &value.to_string());
                }
                Ok(value)
            }
            Err(Unwind::Error(error)) => {
                self.runtime.show_error(&error);
                Ok(Value::Void)
            }
            Err(Unwind::Flow(signal)) => {
                self.runtime.show_error(&signal.stray());
                Ok(Value::Void)
            }
            Err(other) => Err(other),
        }
    }

    fn spawn_statement(&mut self, statement: &Rc<Node>, toplevel: bool) {
        let expr = match &statement.kind {
            NodeKind::Stmt { expr, .. } => expr.clone(),
            _ => statement.clone(),
        };
        if toplevel {
            self.spawn("comma", Work::Eval(expr), Spawn::Detached);
            return;
        }
        let job = self.spawn("comma", Work::Eval(expr), Spawn::Linked);
        if let Some(frame) = self.scopes.last_mut() {
            frame.spawned.push(job);
        }
    }

    async fn visit_and(&mut self, lhs: &Rc<Node>, rhs: &Rc<Node>) -> EvalResult<Value> {
        let child = self.spawn("and", Work::Eval(lhs.clone()), Spawn::Linked);
        let result = match self.eval(rhs).await {
            Ok(_) => self.join(&child).await,
            Err(unwind) => Err(unwind),
        };
        if result.is_err() {
            self.abandon(std::slice::from_ref(&child));
        }
        result.map(|()| Value::Void)
    }

    async fn visit_scope(&mut self, body: &Rc<Node>) -> EvalResult<Value> {
        let scope = Scope::boxed(Some(self.scope.clone()));
        let saved = mem::replace(&mut self.scope, scope);
        self.scopes.push(ScopeFrame::default());

        let mut result = self.eval(body).await;
        let frame = self.scopes.pop().unwrap_or_default();
        if result.is_ok() {
            for job in &frame.spawned {
                if let Err(unwind) = self.join(job).await {
                    result = Err(unwind);
                    break;
                }
            }
        }
        if result.is_err() {
            self.abandon(&frame.spawned);
        }
        if let Some((tag, depth)) = frame.tag {
            self.job.pop_tag(tag);
            let scheduler = self.runtime.scheduler();
            scheduler.tags().borrow_mut().record_leave(tag);
            scheduler.signal_tag(tag, SignalKind::Stop, Value::Void);
            self.runtime.release_tag(tag);
            result = match result {
                Err(Unwind::Tag(signal)) if signal.depth == depth => Ok(signal.payload),
                other => other,
            };
        }

        self.scope = saved;
        result
    }

    async fn visit_call(
        &mut self,
        target: Option<&Rc<Node>>,
        name: &str,
        args: Option<&[Rc<Node>]>,
        span: &Span,
    ) -> EvalResult<Value> {
        let (receiver, found) = match target {
            Some(target) => {
                let receiver = self.eval(target).await?;
                let found = self.runtime.lookup(&receiver, name);
                (receiver, found)
            }
            None => {
                let local = self.scope.borrow().get(name);
                let found = local.or_else(|| self.runtime.lookup(&self.this, name));
                (self.this.clone(), found)
            }
        };
        let Some(value) = found else {
            return Err(ErrorKind::Lookup(name.to_string()).into());
        };
        match value {
            Value::Code(callable) => {
                self.invoke(callable, name, receiver, args.unwrap_or(&[]), span)
                    .await
            }
            value => match args {
                Some(args) if !args.is_empty() => Err(ErrorKind::Primitive(format!(
                    "{}: {} is not callable",
                    name,
                    value.type_name()
                ))
                .into()),
                _ => Ok(value),
            },
        }
    }

    /// Calls `callable` with argument expressions: strict callables get them
    /// evaluated first, lazy ones get a call message.
    async fn invoke(
        &mut self,
        callable: Rc<Callable>,
        name: &str,
        receiver: Value,
        args: &[Rc<Node>],
        span: &Span,
    ) -> EvalResult<Value> {
        match &*callable {
            Callable::Strict(body) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg).await?);
                }
                self.call_strict(body, name, receiver, values, Some(span))
                    .await
            }
            Callable::Lazy(body) => {
                let message = Rc::new(CallMessage {
                    target: receiver,
                    message: name.to_string(),
                    args: args.iter().cloned().map(Thunk::Pending).collect(),
                    scope: self.scope.clone(),
                    sender: self.this.clone(),
                    sender_call: self.call.clone(),
                });
                self.call_lazy(body, name, message, Some(span)).await
            }
        }
    }

    /// Calls `callable` with values that are already computed.
    pub async fn apply_code(
        &mut self,
        callable: Rc<Callable>,
        name: &str,
        receiver: Value,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        match &*callable {
            Callable::Strict(body) => self.call_strict(body, name, receiver, args, None).await,
            Callable::Lazy(body) => {
                let message = Rc::new(CallMessage {
                    target: receiver,
                    message: name.to_string(),
                    args: args.into_iter().map(Thunk::Ready).collect(),
                    scope: self.scope.clone(),
                    sender: self.this.clone(),
                    sender_call: self.call.clone(),
                });
                self.call_lazy(body, name, message, None).await
            }
        }
    }

    async fn call_strict(
        &mut self,
        body: &StrictBody,
        name: &str,
        receiver: Value,
        args: Vec<Value>,
        span: Option<&Span>,
    ) -> EvalResult<Value> {
        self.enter_frame(name, span);
        let result = match body {
            StrictBody::Routine {
                params,
                body,
                capture,
            } => match Arity::Exact(params.len()).check(name, args.len()) {
                Ok(()) => {
                    let (scope, this) = self.routine_context(capture.as_ref(), receiver);
                    {
                        let mut scope = scope.borrow_mut();
                        for (param, arg) in params.iter().zip(args) {
                            scope.declare(param.clone(), arg);
                        }
                    }
                    self.run_body(body, scope, this, None).await
                }
                Err(kind) => Err(kind.into()),
            },
            StrictBody::Sync(f, arity) => match arity.check(name, args.len()) {
                Ok(()) => f(self, &receiver, &args),
                Err(kind) => Err(kind.into()),
            },
            StrictBody::Async(f, arity) => match arity.check(name, args.len()) {
                Ok(()) => f(self, receiver, args).await,
                Err(kind) => Err(kind.into()),
            },
        };
        self.leave_frame(result)
    }

    async fn call_lazy(
        &mut self,
        body: &LazyBody,
        name: &str,
        message: Rc<CallMessage>,
        span: Option<&Span>,
    ) -> EvalResult<Value> {
        self.enter_frame(name, span);
        let result = match body {
            LazyBody::Routine { body, capture } => {
                let (scope, this) = self.routine_context(capture.as_ref(), message.target.clone());
                self.run_body(body, scope, this, Some(message)).await
            }
            LazyBody::Native(f) => f(self, message).await,
        };
        self.leave_frame(result)
    }

    fn enter_frame(&mut self, name: &str, span: Option<&Span>) {
        self.frames.push(Frame {
            name: name.to_string(),
            span: span.filter(|s| !s.is_unknown()).cloned(),
        });
    }

    fn leave_frame(&mut self, mut result: EvalResult<Value>) -> EvalResult<Value> {
        if let Err(Unwind::Error(error)) = &mut result {
            error.attach_backtrace(&self.frames);
        }
        self.frames.pop();
        result
    }

    /// Closures run in the scope and `this` they were written in; plain routines
    /// run under the root scope with `this` bound to the receiver.
    fn routine_context(
        &self,
        capture: Option<&Capture>,
        receiver: Value,
    ) -> (Rc<RefCell<Scope>>, Value) {
        match capture {
            Some(capture) => (
                Scope::boxed(Some(capture.scope.clone())),
                capture.this.clone(),
            ),
            None => (
                Scope::boxed(Some(self.runtime.root_scope().clone())),
                receiver,
            ),
        }
    }

    async fn run_body(
        &mut self,
        body: &Rc<Node>,
        scope: Rc<RefCell<Scope>>,
        this: Value,
        call: Option<Rc<CallMessage>>,
    ) -> EvalResult<Value> {
        let saved_scope = mem::replace(&mut self.scope, scope);
        let saved_this = mem::replace(&mut self.this, this);
        let saved_call = mem::replace(&mut self.call, call);
        let result = self.eval(body).await;
        self.scope = saved_scope;
        self.this = saved_this;
        self.call = saved_call;
        match result {
            Err(Unwind::Flow(FlowSignal::Return(value))) => Ok(value),
            Err(Unwind::Flow(signal)) => Err(signal.stray().into()),
            other => other,
        }
    }

    /// Forces argument `index` of a lazy call, in the caller's context.
    pub async fn eval_arg(&mut self, call: &CallMessage, index: usize) -> EvalResult<Value> {
        match call.args.get(index) {
            Some(Thunk::Ready(value)) => Ok(value.clone()),
            Some(Thunk::Pending(node)) => {
                let saved_scope = mem::replace(&mut self.scope, call.scope.clone());
                let saved_this = mem::replace(&mut self.this, call.sender.clone());
                let saved_call = mem::replace(&mut self.call, call.sender_call.clone());
                let result = self.eval(node).await;
                self.scope = saved_scope;
                self.this = saved_this;
                self.call = saved_call;
                result
            }
            None => Err(ErrorKind::ArgumentCount {
                routine: call.message.clone(),
                expected: format!("at least {}", index + 1),
                given: call.args.len(),
            }
            .into()),
        }
    }

    pub fn spawn(&mut self, name: &str, work: Work, mode: Spawn) -> Rc<Job> {
        let scope = self.scope.clone();
        let this = self.this.clone();
        self.spawn_with(name, work, mode, scope, this)
    }

    pub fn spawn_with(
        &mut self,
        name: &str,
        work: Work,
        mode: Spawn,
        scope: Rc<RefCell<Scope>>,
        this: Value,
    ) -> Rc<Job> {
        let (parent, tags) = match mode {
            Spawn::Linked => (Some(self.job.id), self.job.tags()),
            Spawn::Detached => (None, self.job.tags()),
            Spawn::Isolated => (None, Vec::new()),
        };
        self.runtime
            .spawn(name, work, parent, tags, scope, this, self.call.clone(), None)
    }

    /// Kills whichever of `jobs` are still running.
    fn abandon(&self, jobs: &[Rc<Job>]) {
        for job in jobs.iter().filter(|job| !job.is_terminated()) {
            tracing::debug!(id = %job.id, "abandoning job");
            self.runtime.scheduler().terminate(job.id);
        }
    }

    /// Raises the signal other jobs left for this one, if any.
    pub fn check_pending(&self) -> EvalResult<()> {
        match self.job.take_pending() {
            Some(unwind) => Err(unwind),
            None => Ok(()),
        }
    }

    /// Lets every other runnable job run once. A no-op in non-interruptible
    /// mode unless the job is frozen.
    pub async fn yield_now(&mut self) -> EvalResult<()> {
        if self.job.non_interruptible() && !self.runtime.scheduler().is_frozen(&self.job) {
            return Ok(());
        }
        Suspend::new(&self.job, Suspension::Yield).await;
        self.check_pending()
    }

    pub async fn sleep(&mut self, duration: Duration) -> EvalResult<()> {
        if self.job.non_interruptible() {
            return Err(
                ErrorKind::Scheduling("cannot sleep in non-interruptible mode".to_string()).into(),
            );
        }
        let deadline = self.runtime.scheduler().now() + duration;
        loop {
            Suspend::new(&self.job, Suspension::Sleep(deadline)).await;
            self.check_pending()?;
            if self.runtime.scheduler().now() >= deadline {
                return Ok(());
            }
        }
    }

    /// Waits for `job` to terminate.
    pub async fn join(&mut self, job: &Rc<Job>) -> EvalResult<()> {
        if job.is_terminated() {
            return self.check_pending();
        }
        if self.job.non_interruptible() {
            return Err(ErrorKind::Scheduling(format!(
                "cannot wait for {} in non-interruptible mode",
                job.id
            ))
            .into());
        }
        while !job.is_terminated() {
            Suspend::new(&self.job, Suspension::Join(job.id)).await;
            self.check_pending()?;
        }
        Ok(())
    }
}

fn statement_flavor(node: &Node) -> Flavor {
    match &node.kind {
        NodeKind::Stmt { flavor, .. } => *flavor,
        _ => Flavor::None,
    }
}

/// Whether a statement of this flavor is followed by a scheduler round.
fn separates(flavor: Flavor) -> bool {
    flavor.yields() && !flavor.is_concurrent()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Void.is_true());
        assert!(!Value::Nil.is_true());
        assert!(!Value::Float(0.0).is_true());
        assert!(Value::Float(2.0).is_true());
        assert!(!Value::String("".into()).is_true());
        assert!(Value::list(vec![Value::Nil]).is_true());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Float(3.0).to_string(), "3");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
        assert_eq!(Value::String("hi".into()).to_string(), "\"hi\"");
        assert_eq!(Value::String("hi".into()).as_text(), "hi");
        assert_eq!(
            Value::list(vec![Value::Float(1.0), Value::Boolean(true)]).to_string(),
            "[1, true]"
        );
    }

    #[test]
    fn test_equality() {
        assert_eq!(
            Value::list(vec![Value::Float(1.0)]),
            Value::list(vec![Value::Float(1.0)])
        );
        assert_ne!(Value::Float(1.0), Value::String("1".into()));
        let object = Object::new(None, ObjectKind::Plain, Vec::new());
        assert_eq!(Value::Object(object.clone()), Value::Object(object));
    }

    #[test]
    fn test_separators() {
        assert!(separates(Flavor::Semicolon));
        assert!(separates(Flavor::None));
        assert!(!separates(Flavor::Pipe));
        assert!(!separates(Flavor::Comma));
    }
}
