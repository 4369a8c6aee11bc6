use std::fmt::Display;

use crate::{interpreter::Value, scheduler::tag::TagId, span::Span};

/// One pending routine call, as shown in backtraces.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub name: String,
    pub span: Option<Span>,
}

impl Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.span {
            Some(span) if !span.is_unknown() => write!(f, "{}: {}", span, self.name),
            _ => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("{routine}: expected {expected} argument(s), given {given}")]
    ArgumentCount {
        routine: String,
        expected: String,
        given: usize,
    },
    #[error("{routine}: unexpected {found}, expected a {expected}")]
    ArgumentType {
        routine: String,
        expected: &'static str,
        found: String,
    },
    #[error("{0}")]
    Thrown(Value),
    #[error("{0}")]
    Primitive(String),
    #[error("scheduling error: {0}")]
    Scheduling(String),
    #[error("{0}: outside a loop")]
    StrayLoopSignal(&'static str),
    #[error("return: outside a function")]
    StrayReturn,
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

/// A user-visible language error.
#[derive(Debug, Clone)]
pub struct DomainError {
    pub kind: ErrorKind,
    pub span: Option<Span>,
    pub backtrace: Option<Vec<Frame>>,
}

impl DomainError {
    pub fn new(kind: ErrorKind) -> Self {
        DomainError {
            kind,
            span: None,
            backtrace: None,
        }
    }

    /// Records where the error happened; only the innermost location is kept.
    pub fn locate(&mut self, span: &Span) {
        if self.span.is_none() && !span.is_unknown() {
            self.span = Some(span.clone());
        }
    }

    /// Records the call stack the first time it is available.
    pub fn attach_backtrace(&mut self, frames: &[Frame]) {
        if self.backtrace.is_none() {
            self.backtrace = Some(frames.to_vec());
        }
    }

    /// The value a `catch` clause binds.
    pub fn value(&self) -> Value {
        match &self.kind {
            ErrorKind::Thrown(value) => value.clone(),
            kind => Value::String(kind.to_string().into()),
        }
    }
}

impl Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.span {
            Some(span) => write!(f, "{}: {}", span, self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for DomainError {}

impl From<ErrorKind> for DomainError {
    fn from(kind: ErrorKind) -> Self {
        DomainError::new(kind)
    }
}

#[derive(Debug, Clone)]
pub enum FlowSignal {
    Break,
    Continue,
    Return(Value),
}

impl FlowSignal {
    /// The diagnostic reported when the signal escapes every construct that handles it.
    pub fn stray(&self) -> DomainError {
        DomainError::new(match self {
            FlowSignal::Break => ErrorKind::StrayLoopSignal("break"),
            FlowSignal::Continue => ErrorKind::StrayLoopSignal("continue"),
            FlowSignal::Return(_) => ErrorKind::StrayReturn,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Stop,
    Block,
}

/// Delivered to a job holding a stopped or blocked tag. `depth` is the position
/// of the affected tag in the job's tag stack, so the right `TaggedStmt` claims it.
#[derive(Debug, Clone)]
pub struct TagSignal {
    pub kind: SignalKind,
    pub tag: TagId,
    pub depth: usize,
    pub payload: Value,
}

/// Everything that can unwind an evaluation.
#[derive(Debug, Clone)]
pub enum Unwind {
    Error(DomainError),
    Flow(FlowSignal),
    Tag(TagSignal),
    /// The job is being killed; nothing may intercept it.
    Terminate,
}

impl From<DomainError> for Unwind {
    fn from(error: DomainError) -> Self {
        Unwind::Error(error)
    }
}

impl From<ErrorKind> for Unwind {
    fn from(kind: ErrorKind) -> Self {
        Unwind::Error(DomainError::new(kind))
    }
}

pub type EvalResult<T> = Result<T, Unwind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_location_wins() {
        let mut error = DomainError::new(ErrorKind::Lookup("x".to_string()));
        error.locate(&Span::default());
        assert!(error.span.is_none());
        error.locate(&Span::new(2, 1, 3));
        error.locate(&Span::new(1, 1, 9));
        assert_eq!(error.to_string(), "2.1-3: lookup failed: x");
    }

    #[test]
    fn test_backtrace_attached_once() {
        let mut error = DomainError::new(ErrorKind::StrayReturn);
        let outer = Frame {
            name: "f".to_string(),
            span: None,
        };
        error.attach_backtrace(&[outer.clone()]);
        error.attach_backtrace(&[]);
        assert_eq!(error.backtrace, Some(vec![outer]));
    }

    #[test]
    fn test_thrown_value_is_caught_as_is() {
        let error = DomainError::new(ErrorKind::Thrown(Value::Float(4.0)));
        assert!(matches!(error.value(), Value::Float(v) if v == 4.0));
        assert_eq!(error.to_string(), "4");
    }
}
