use std::{cell::RefCell, fmt::Display, rc::Rc};

use futures::future::LocalBoxFuture;

use crate::{
    ast::Node,
    error::{ErrorKind, EvalResult},
};

use super::{scope::Scope, Interpreter, Value};

pub type SyncFn = fn(&mut Interpreter, &Value, &[Value]) -> EvalResult<Value>;
pub type AsyncFn =
    for<'a> fn(&'a mut Interpreter, Value, Vec<Value>) -> LocalBoxFuture<'a, EvalResult<Value>>;
pub type LazyFn =
    for<'a> fn(&'a mut Interpreter, Rc<CallMessage>) -> LocalBoxFuture<'a, EvalResult<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    Range(usize, usize),
}

impl Arity {
    pub fn check(self, routine: &str, given: usize) -> Result<(), ErrorKind> {
        let ok = match self {
            Arity::Exact(n) => given == n,
            Arity::Range(min, max) => (min..=max).contains(&given),
        };
        if ok {
            Ok(())
        } else {
            Err(ErrorKind::ArgumentCount {
                routine: routine.to_string(),
                expected: self.to_string(),
                given,
            })
        }
    }
}

impl Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::Range(min, max) => write!(f, "{} to {}", min, max),
        }
    }
}

/// What a `closure` remembers from where it was written.
#[derive(Debug, Clone)]
pub struct Capture {
    pub scope: Rc<RefCell<Scope>>,
    pub this: Value,
}

#[derive(Clone)]
pub enum StrictBody {
    Routine {
        params: Vec<String>,
        body: Rc<Node>,
        capture: Option<Capture>,
    },
    Sync(SyncFn, Arity),
    Async(AsyncFn, Arity),
}

#[derive(Clone)]
pub enum LazyBody {
    Routine {
        body: Rc<Node>,
        capture: Option<Capture>,
    },
    Native(LazyFn),
}

/// Strict callables get evaluated arguments; lazy ones get a call message and
/// decide themselves which arguments to evaluate, and when.
#[derive(Clone)]
pub enum Callable {
    Strict(StrictBody),
    Lazy(LazyBody),
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callable::Strict(StrictBody::Routine {
                params, capture, ..
            }) => write!(
                f,
                "{} ({})",
                if capture.is_some() {
                    "closure"
                } else {
                    "function"
                },
                params.join(", ")
            ),
            Callable::Strict(StrictBody::Sync(_, arity) | StrictBody::Async(_, arity)) => {
                write!(f, "<primitive {}>", arity)
            }
            Callable::Lazy(LazyBody::Routine { capture, .. }) => write!(
                f,
                "{}",
                if capture.is_some() {
                    "closure"
                } else {
                    "function"
                }
            ),
            Callable::Lazy(LazyBody::Native(_)) => write!(f, "<lazy primitive>"),
        }
    }
}

/// An argument of a lazy call: an expression still to evaluate in the caller's
/// context, or a value supplied up front by `apply`.
#[derive(Debug, Clone)]
pub enum Thunk {
    Pending(Rc<Node>),
    Ready(Value),
}

/// The argument bundle handed to lazy callables, reachable as `call`.
#[derive(Debug)]
pub struct CallMessage {
    pub target: Value,
    pub message: String,
    pub args: Vec<Thunk>,
    pub scope: Rc<RefCell<Scope>>,
    pub sender: Value,
    /// The `call` of the sender, so forwarded arguments resolve against it.
    pub sender_call: Option<Rc<CallMessage>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity() {
        assert!(Arity::Exact(1).check("f", 1).is_ok());
        assert!(Arity::Range(0, 2).check("f", 2).is_ok());
        let error = Arity::Range(1, 2).check("f", 3).unwrap_err();
        assert_eq!(error.to_string(), "f: expected 1 to 2 argument(s), given 3");
    }
}
