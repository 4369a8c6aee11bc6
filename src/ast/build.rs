//! Constructors for assembling trees by hand, used by embedders and tests
//! in place of a parser. Every node gets an unknown span.

use std::rc::Rc;

use super::{Flavor, Node, NodeKind};
use crate::span::Span;

fn node(kind: NodeKind) -> Rc<Node> {
    Node::new(Span::default(), kind)
}

pub fn float(value: f64) -> Rc<Node> {
    node(NodeKind::Float(value))
}

pub fn string(value: &str) -> Rc<Node> {
    node(NodeKind::String(value.to_string()))
}

pub fn list(items: Vec<Rc<Node>>) -> Rc<Node> {
    node(NodeKind::List(items))
}

pub fn call(target: Option<Rc<Node>>, name: &str, args: Option<Vec<Rc<Node>>>) -> Rc<Node> {
    node(NodeKind::Call {
        target,
        name: name.to_string(),
        args,
    })
}

/// `name`: a local variable, or a slot of `this`.
pub fn ident(name: &str) -> Rc<Node> {
    call(None, name, None)
}

/// `name(args)` on the implicit target.
pub fn apply(name: &str, args: Vec<Rc<Node>>) -> Rc<Node> {
    call(None, name, Some(args))
}

/// `target.name(args)`.
pub fn send(target: Rc<Node>, name: &str, args: Vec<Rc<Node>>) -> Rc<Node> {
    call(Some(target), name, Some(args))
}

pub fn declare(name: &str, value: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Declare {
        name: name.to_string(),
        value: Some(value),
    })
}

pub fn assign(name: &str, value: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Assign {
        target: None,
        name: name.to_string(),
        value,
    })
}

pub fn assign_slot(target: Rc<Node>, name: &str, value: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Assign {
        target: Some(target),
        name: name.to_string(),
        value,
    })
}

/// `name = name + 1`.
pub fn increment(name: &str) -> Rc<Node> {
    assign(name, send(ident(name), "+", vec![float(1.0)]))
}

pub fn stmt(flavor: Flavor, expr: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Stmt { flavor, expr })
}

pub fn semicolon(expr: Rc<Node>) -> Rc<Node> {
    stmt(Flavor::Semicolon, expr)
}

pub fn comma(expr: Rc<Node>) -> Rc<Node> {
    stmt(Flavor::Comma, expr)
}

fn wrap(children: Vec<Rc<Node>>) -> Vec<Rc<Node>> {
    children
        .into_iter()
        .map(|child| {
            if matches!(child.kind, NodeKind::Stmt { .. }) {
                child
            } else {
                semicolon(child)
            }
        })
        .collect()
}

/// A statement list; children that are not already statements get `;`.
pub fn sequence(children: Vec<Rc<Node>>) -> Rc<Node> {
    node(NodeKind::Nary {
        children: wrap(children),
        toplevel: false,
    })
}

/// The statement list of a whole program, as handed over by the parser.
pub fn toplevel(children: Vec<Rc<Node>>) -> Rc<Node> {
    node(NodeKind::Nary {
        children: wrap(children),
        toplevel: true,
    })
}

pub fn and(lhs: Rc<Node>, rhs: Rc<Node>) -> Rc<Node> {
    node(NodeKind::And { lhs, rhs })
}

pub fn pipe(lhs: Rc<Node>, rhs: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Pipe { lhs, rhs })
}

/// `{ children }`.
pub fn scope(children: Vec<Rc<Node>>) -> Rc<Node> {
    node(NodeKind::Scope(sequence(children)))
}

pub fn do_(target: Rc<Node>, children: Vec<Rc<Node>>) -> Rc<Node> {
    node(NodeKind::Do {
        target,
        body: sequence(children),
    })
}

pub fn if_(test: Rc<Node>, then: Rc<Node>, otherwise: Option<Rc<Node>>) -> Rc<Node> {
    node(NodeKind::If {
        test,
        then,
        otherwise,
    })
}

pub fn while_(flavor: Flavor, test: Rc<Node>, body: Rc<Node>) -> Rc<Node> {
    node(NodeKind::While { flavor, test, body })
}

/// `loop body`.
pub fn loop_(body: Rc<Node>) -> Rc<Node> {
    while_(Flavor::Loop, ident("true"), body)
}

pub fn foreach(flavor: Flavor, index: &str, list: Rc<Node>, body: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Foreach {
        flavor,
        index: index.to_string(),
        list,
        body,
    })
}

pub fn every(flavor: Flavor, period: Rc<Node>, body: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Every {
        flavor,
        period,
        body,
    })
}

pub fn at(test: Rc<Node>, body: Rc<Node>, onleave: Option<Rc<Node>>) -> Rc<Node> {
    node(NodeKind::At {
        test,
        body,
        onleave,
    })
}

pub fn tagged(tag: Rc<Node>, expr: Rc<Node>) -> Rc<Node> {
    node(NodeKind::TaggedStmt { tag, expr })
}

pub fn throw(value: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Throw(Some(value)))
}

pub fn rethrow() -> Rc<Node> {
    node(NodeKind::Throw(None))
}

pub fn try_(body: Rc<Node>, binding: Option<&str>, handler: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Try {
        body,
        binding: binding.map(str::to_string),
        handler,
    })
}

pub fn break_() -> Rc<Node> {
    node(NodeKind::Break)
}

pub fn continue_() -> Rc<Node> {
    node(NodeKind::Continue)
}

pub fn return_(value: Option<Rc<Node>>) -> Rc<Node> {
    node(NodeKind::Return(value))
}

pub fn function(params: &[&str], body: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Function {
        params: Some(params.iter().map(|p| p.to_string()).collect()),
        body,
        closure: false,
    })
}

pub fn closure(params: &[&str], body: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Function {
        params: Some(params.iter().map(|p| p.to_string()).collect()),
        body,
        closure: true,
    })
}

/// A routine without a parameter list; its arguments stay unevaluated.
pub fn lazy_function(body: Rc<Node>) -> Rc<Node> {
    node(NodeKind::Function {
        params: None,
        body,
        closure: false,
    })
}

pub fn this() -> Rc<Node> {
    node(NodeKind::This)
}

pub fn call_msg() -> Rc<Node> {
    node(NodeKind::CallMsg)
}

pub fn message(channel: &str, text: &str) -> Rc<Node> {
    node(NodeKind::Message {
        channel: channel.to_string(),
        text: text.to_string(),
    })
}

pub fn noop() -> Rc<Node> {
    node(NodeKind::Noop)
}
