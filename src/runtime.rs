use std::{cell::RefCell, rc::Rc};

use futures::FutureExt;
use rustc_hash::FxHashMap;

use crate::{
    ast::Node,
    config::RuntimeConfig,
    connection::{Connection, Message},
    error::{DomainError, ErrorKind},
    interpreter::{
        primitives, CallMessage, Interpreter, Object, ObjectKind, Scope, Sink, Value, Work,
    },
    scheduler::{
        job::{Job, JobId},
        tag::TagId,
        Scheduler,
    },
};

/// The standard prototypes. Every object reaches `Global` through `Object`.
#[derive(Debug)]
pub struct Protos {
    pub global: Rc<Object>,
    pub object: Rc<Object>,
    pub boolean: Rc<Object>,
    pub float: Rc<Object>,
    pub string: Rc<Object>,
    pub list: Rc<Object>,
    pub code: Rc<Object>,
    pub call: Rc<Object>,
    pub tag: Rc<Object>,
}

impl Protos {
    fn new() -> Self {
        let global = Object::new(Some("Global"), ObjectKind::Plain, Vec::new());
        let object = Object::new(Some("Object"), ObjectKind::Plain, vec![global.clone()]);
        let derived = |name: &str| Object::new(Some(name), ObjectKind::Plain, vec![object.clone()]);
        Protos {
            boolean: derived("Boolean"),
            float: derived("Float"),
            string: derived("String"),
            list: derived("List"),
            code: derived("Code"),
            call: derived("CallMessage"),
            tag: derived("Tag"),
            global,
            object,
        }
    }
}

/// Owns everything a running program shares: the scheduler and its tags, the
/// object world and the connection messages go to.
pub struct Runtime {
    config: RuntimeConfig,
    scheduler: Scheduler,
    protos: Protos,
    lobby: Rc<Object>,
    root_scope: Rc<RefCell<Scope>>,
    tag_objects: RefCell<FxHashMap<TagId, Rc<Object>>>,
    connection: Rc<RefCell<dyn Connection>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .field("lobby", &self.lobby)
            .finish()
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig, connection: Rc<RefCell<dyn Connection>>) -> Rc<Self> {
        let protos = Protos::new();
        primitives::install(&protos);
        let lobby = Object::new(Some("Lobby"), ObjectKind::Plain, vec![protos.object.clone()]);
        protos.global.set_slot("Lobby", Value::Object(lobby.clone()));

        let runtime = Rc::new(Runtime {
            scheduler: Scheduler::new(config.real_time, config.cycle_time()),
            config,
            protos,
            lobby,
            root_scope: Scope::boxed(None),
            tag_objects: RefCell::new(FxHashMap::default()),
            connection,
        });
        let root = runtime.scheduler.tags().borrow().root();
        let root_object = runtime.tag_object_for(root);
        runtime
            .protos
            .global
            .set_slot("tags", Value::Object(root_object));
        runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn protos(&self) -> &Protos {
        &self.protos
    }

    /// `this` of toplevel code.
    pub fn lobby(&self) -> &Rc<Object> {
        &self.lobby
    }

    pub fn root_scope(&self) -> &Rc<RefCell<Scope>> {
        &self.root_scope
    }

    /// Starts a job evaluating `program` at toplevel and returns it without running it.
    pub fn execute(self: &Rc<Self>, program: &Rc<Node>) -> Rc<Job> {
        tracing::debug!("executing program");
        self.spawn(
            "toplevel",
            Work::Eval(program.clone()),
            None,
            Vec::new(),
            self.root_scope.clone(),
            Value::Object(self.lobby.clone()),
            None,
            None,
        )
    }

    /// Executes `program` and runs the scheduler until it goes idle.
    pub fn interpret(self: &Rc<Self>, program: &Rc<Node>) -> u64 {
        self.execute(program);
        self.run_until_idle()
    }

    /// Runs until no job can make progress, or for `max_cycles` if configured.
    pub fn run_until_idle(&self) -> u64 {
        self.scheduler.run(self.config.max_cycles)
    }

    /// Runs at most `cycles` scheduler rounds.
    pub fn step(&self, cycles: u64) -> u64 {
        self.scheduler.run(Some(cycles))
    }

    /// Calls `function` with `args` in a job of its own and runs the scheduler
    /// until that job is done. Other jobs keep running meanwhile.
    pub fn apply(self: &Rc<Self>, function: &Value, args: Vec<Value>) -> Result<Value, DomainError> {
        self.run_to_completion(
            "apply",
            Work::Apply {
                function: function.clone(),
                args,
            },
        )
    }

    /// Evaluates `node` at the lobby in a job of its own and waits for its value.
    pub fn eval(self: &Rc<Self>, node: &Rc<Node>) -> Result<Value, DomainError> {
        self.run_to_completion("eval", Work::Eval(node.clone()))
    }

    fn run_to_completion(self: &Rc<Self>, name: &str, work: Work) -> Result<Value, DomainError> {
        let sink: Sink = Rc::new(RefCell::new(None));
        let job = self.spawn(
            name,
            work,
            None,
            Vec::new(),
            self.root_scope.clone(),
            Value::Object(self.lobby.clone()),
            None,
            Some(sink.clone()),
        );
        self.scheduler
            .run_until_terminated(&job, self.config.max_cycles);
        let result = sink.borrow_mut().take();
        result.unwrap_or_else(|| {
            Err(DomainError::new(ErrorKind::Scheduling(format!(
                "{} did not complete",
                job.id
            ))))
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        self: &Rc<Self>,
        name: &str,
        work: Work,
        parent: Option<JobId>,
        tags: Vec<TagId>,
        scope: Rc<RefCell<Scope>>,
        this: Value,
        call: Option<Rc<CallMessage>>,
        sink: Option<Sink>,
    ) -> Rc<Job> {
        let job = self.scheduler.create_job(name, parent, tags);
        let interpreter = Interpreter::new(self.clone(), job.clone(), scope, this, call, sink);
        self.scheduler
            .start(&job, interpreter.work(work).boxed_local());
        job
    }

    pub fn send(&self, channel: &str, text: &str) {
        self.connection.borrow_mut().send(Message {
            channel: channel.to_string(),
            text: text.to_string(),
        });
    }

    /// Reports an error on the `error` channel, followed by its backtrace.
    pub fn show_error(&self, error: &DomainError) {
        tracing::debug!(%error, "reporting error");
        self.send("error", &format!("!!! {}", error));
        if let Some(frames) = &error.backtrace {
            for frame in frames.iter().rev().take(self.config.backtrace_depth) {
                self.send("error", &format!("!!!    called from: {}", frame));
            }
        }
    }

    /// Finds slot `name` on `value`, or on the prototype of its type.
    pub fn lookup(&self, value: &Value, name: &str) -> Option<Value> {
        let proto = match value {
            Value::Object(object) => return object.lookup(name),
            Value::Void | Value::Nil => &self.protos.object,
            Value::Boolean(_) => &self.protos.boolean,
            Value::Float(_) => &self.protos.float,
            Value::String(_) => &self.protos.string,
            Value::List(_) => &self.protos.list,
            Value::Code(_) => &self.protos.code,
            Value::Call(_) => &self.protos.call,
        };
        proto.lookup(name)
    }

    /// Creates a tag under `parent` (the root tag by default) along with the object
    /// programs see it as.
    pub fn create_tag(&self, name: &str, parent: Option<TagId>) -> (TagId, Rc<Object>) {
        let id = self.scheduler.tags().borrow_mut().create(name, parent);
        (id, self.tag_object_for(id))
    }

    /// Frees a tag created for one evaluation, such as a timeout's or a scope's.
    pub fn release_tag(&self, id: TagId) {
        self.scheduler.tags().borrow_mut().release(id);
        self.tag_objects.borrow_mut().remove(&id);
    }

    pub fn tag_object(&self, id: TagId) -> Option<Rc<Object>> {
        self.tag_objects.borrow().get(&id).cloned()
    }

    fn tag_object_for(&self, id: TagId) -> Rc<Object> {
        if let Some(object) = self.tag_object(id) {
            return object;
        }
        let name = self
            .scheduler
            .tags()
            .borrow()
            .name(id)
            .unwrap_or_default()
            .to_string();
        let object = Object::new(
            Some(&name),
            ObjectKind::Tag(id),
            vec![self.protos.tag.clone()],
        );
        self.tag_objects.borrow_mut().insert(id, object.clone());
        object
    }

    pub fn expect_tag(&self, routine: &str, value: &Value) -> Result<TagId, ErrorKind> {
        value.as_tag().ok_or_else(|| ErrorKind::ArgumentType {
            routine: routine.to_string(),
            expected: "Tag",
            found: value.type_name().to_string(),
        })
    }

    /// Looks `name` up from the lobby, as toplevel code would.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.root_scope
            .borrow()
            .get(name)
            .or_else(|| self.lobby.lookup(name))
    }

    /// Drops every job still alive. Jobs hold the runtime, so this is what lets
    /// it be freed.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
