use std::{mem, rc::Rc};

use crate::{
    ast::{Flavor, Node},
    error::{ErrorKind, EvalResult, FlowSignal, Unwind},
    scheduler::job::Job,
};

use super::{primitives::duration, Interpreter, Scope, Spawn, Value, Work};

/// What a loop does with the outcome of one iteration.
enum Step {
    Next,
    Exit,
}

fn iteration(result: EvalResult<Value>) -> EvalResult<Step> {
    match result {
        Ok(_) | Err(Unwind::Flow(FlowSignal::Continue)) => Ok(Step::Next),
        Err(Unwind::Flow(FlowSignal::Break)) => Ok(Step::Exit),
        Err(other) => Err(other),
    }
}

impl Interpreter {
    pub(super) async fn visit_while(
        &mut self,
        flavor: Flavor,
        test: &Rc<Node>,
        body: &Rc<Node>,
    ) -> EvalResult<Value> {
        let mut first = true;
        loop {
            if !first && flavor.yields() {
                self.yield_now().await?;
            }
            first = false;
            if !self.eval(test).await?.is_true() {
                break;
            }
            let result = self.eval(body).await;
            if let Step::Exit = iteration(result)? {
                break;
            }
        }
        Ok(Value::Void)
    }

    pub(super) async fn visit_foreach(
        &mut self,
        flavor: Flavor,
        index: &str,
        list: &Rc<Node>,
        body: &Rc<Node>,
    ) -> EvalResult<Value> {
        let items = match self.eval(list).await? {
            Value::List(items) => items.borrow().clone(),
            other => {
                return Err(ErrorKind::ArgumentType {
                    routine: "for".to_string(),
                    expected: "List",
                    found: other.type_name().to_string(),
                }
                .into())
            }
        };

        if flavor.is_concurrent() {
            let mut jobs = Vec::with_capacity(items.len());
            for item in items {
                let scope = Scope::boxed(Some(self.scope.clone()));
                scope.borrow_mut().declare(index.to_string(), item);
                let this = self.this.clone();
                jobs.push(self.spawn_with(
                    "for",
                    Work::Eval(body.clone()),
                    Spawn::Linked,
                    scope,
                    this,
                ));
            }
            for job in &jobs {
                if let Err(unwind) = self.join(job).await {
                    self.abandon(&jobs);
                    return Err(unwind);
                }
            }
            return Ok(Value::Void);
        }

        for (i, item) in items.into_iter().enumerate() {
            if i > 0 && flavor.yields() {
                self.yield_now().await?;
            }
            let scope = Scope::boxed(Some(self.scope.clone()));
            scope.borrow_mut().declare(index.to_string(), item);
            let saved = mem::replace(&mut self.scope, scope);
            let result = self.eval(body).await;
            self.scope = saved;
            if let Step::Exit = iteration(result)? {
                break;
            }
        }
        Ok(Value::Void)
    }

    /// Runs `body` once per period until broken out of or stopped. With `,` each
    /// run gets its own job, so a slow body does not delay the next one.
    pub(super) async fn visit_every(
        &mut self,
        flavor: Flavor,
        period: &Rc<Node>,
        body: &Rc<Node>,
    ) -> EvalResult<Value> {
        let value = self.eval(period).await?;
        let period = duration("every", &value)?;
        let mut spawned: Vec<Rc<Job>> = Vec::new();
        let result = loop {
            let start = self.runtime.scheduler().now();
            if flavor.is_concurrent() {
                spawned.retain(|job| !job.is_terminated());
                spawned.push(self.spawn("every", Work::Eval(body.clone()), Spawn::Linked));
            } else {
                match iteration(self.eval(body).await) {
                    Ok(Step::Next) => {}
                    Ok(Step::Exit) => break Ok(Value::Void),
                    Err(unwind) => break Err(unwind),
                }
            }
            let elapsed = self.runtime.scheduler().now() - start;
            let waited = if elapsed < period {
                self.sleep(period - elapsed).await
            } else {
                self.yield_now().await
            };
            if let Err(unwind) = waited {
                break Err(unwind);
            }
        };
        if result.is_err() {
            self.abandon(&spawned);
        }
        result
    }

    /// Body of the job behind `at`: evaluates `test` once per cycle and runs the
    /// matching branch on each edge. Errors are reported without ending the watch.
    pub(super) async fn watch(
        &mut self,
        test: &Rc<Node>,
        body: &Rc<Node>,
        onleave: Option<&Rc<Node>>,
    ) -> EvalResult<Value> {
        let mut previous = false;
        loop {
            let current = match self.eval(test).await {
                Ok(value) => value.is_true(),
                Err(Unwind::Error(error)) => {
                    self.runtime.show_error(&error);
                    false
                }
                Err(other) => return Err(other),
            };
            if current != previous {
                let branch = if current { Some(body) } else { onleave };
                if let Some(branch) = branch {
                    match self.eval(branch).await {
                        Ok(_) => {}
                        Err(Unwind::Error(error)) => self.runtime.show_error(&error),
                        Err(Unwind::Flow(signal)) => self.runtime.show_error(&signal.stray()),
                        Err(other) => return Err(other),
                    }
                }
                previous = current;
            }
            self.yield_now().await?;
        }
    }
}
