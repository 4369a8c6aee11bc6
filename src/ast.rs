pub mod build;

use std::{fmt::Display, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::span::Span;

/// Connective attached to a statement or loop, deciding how it is scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    None,
    Semicolon,
    Comma,
    Pipe,
    Ampersand,
    At,
    Every,
    For,
    Loop,
    While,
}

impl Flavor {
    /// Whether iterations are separated by a scheduler round.
    pub fn yields(self) -> bool {
        !matches!(self, Flavor::Pipe)
    }

    /// Whether each iteration (or statement) gets its own job.
    pub fn is_concurrent(self) -> bool {
        matches!(self, Flavor::Comma | Flavor::Ampersand)
    }

    fn symbol(self) -> &'static str {
        match self {
            Flavor::None => "",
            Flavor::Semicolon => ";",
            Flavor::Comma => ",",
            Flavor::Pipe => "|",
            Flavor::Ampersand => "&",
            Flavor::At => "at",
            Flavor::Every => "every",
            Flavor::For => "for",
            Flavor::Loop => "loop",
            Flavor::While => "while",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub span: Span,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Float(f64),
    String(String),
    List(Vec<Rc<Node>>),
    /// Message send. A missing target means "local variable, else slot of `this`";
    /// missing arguments mean the name was written without parentheses.
    Call {
        target: Option<Rc<Node>>,
        name: String,
        args: Option<Vec<Rc<Node>>>,
    },
    Declare {
        name: String,
        value: Option<Rc<Node>>,
    },
    Assign {
        target: Option<Rc<Node>>,
        name: String,
        value: Rc<Node>,
    },
    Nary {
        children: Vec<Rc<Node>>,
        toplevel: bool,
    },
    Stmt {
        flavor: Flavor,
        expr: Rc<Node>,
    },
    And {
        lhs: Rc<Node>,
        rhs: Rc<Node>,
    },
    Pipe {
        lhs: Rc<Node>,
        rhs: Rc<Node>,
    },
    Scope(Rc<Node>),
    Do {
        target: Rc<Node>,
        body: Rc<Node>,
    },
    If {
        test: Rc<Node>,
        then: Rc<Node>,
        otherwise: Option<Rc<Node>>,
    },
    While {
        flavor: Flavor,
        test: Rc<Node>,
        body: Rc<Node>,
    },
    Foreach {
        flavor: Flavor,
        index: String,
        list: Rc<Node>,
        body: Rc<Node>,
    },
    Every {
        flavor: Flavor,
        period: Rc<Node>,
        body: Rc<Node>,
    },
    At {
        test: Rc<Node>,
        body: Rc<Node>,
        onleave: Option<Rc<Node>>,
    },
    TaggedStmt {
        tag: Rc<Node>,
        expr: Rc<Node>,
    },
    Throw(Option<Rc<Node>>),
    Try {
        body: Rc<Node>,
        binding: Option<String>,
        handler: Rc<Node>,
    },
    Break,
    Continue,
    Return(Option<Rc<Node>>),
    /// Routine literal. `params: None` declares a lazy routine that reads its
    /// arguments through `call`.
    Function {
        params: Option<Vec<String>>,
        body: Rc<Node>,
        closure: bool,
    },
    This,
    CallMsg,
    Message {
        channel: String,
        text: String,
    },
    Noop,
}

impl Node {
    pub fn new(span: Span, kind: NodeKind) -> Rc<Node> {
        Rc::new(Node { span, kind })
    }

    /// Rebuilds the whole tree with fresh allocations. The original is left untouched.
    pub fn deep_clone(&self) -> Rc<Node> {
        fn copy(node: &Rc<Node>) -> Rc<Node> {
            node.deep_clone()
        }
        fn copy_opt(node: &Option<Rc<Node>>) -> Option<Rc<Node>> {
            node.as_ref().map(|n| n.deep_clone())
        }
        fn copy_all(nodes: &[Rc<Node>]) -> Vec<Rc<Node>> {
            nodes.iter().map(|n| n.deep_clone()).collect()
        }

        let kind = match &self.kind {
            NodeKind::Float(v) => NodeKind::Float(*v),
            NodeKind::String(s) => NodeKind::String(s.clone()),
            NodeKind::List(items) => NodeKind::List(copy_all(items)),
            NodeKind::Call { target, name, args } => NodeKind::Call {
                target: copy_opt(target),
                name: name.clone(),
                args: args.as_ref().map(|a| copy_all(a)),
            },
            NodeKind::Declare { name, value } => NodeKind::Declare {
                name: name.clone(),
                value: copy_opt(value),
            },
            NodeKind::Assign {
                target,
                name,
                value,
            } => NodeKind::Assign {
                target: copy_opt(target),
                name: name.clone(),
                value: copy(value),
            },
            NodeKind::Nary { children, toplevel } => NodeKind::Nary {
                children: copy_all(children),
                toplevel: *toplevel,
            },
            NodeKind::Stmt { flavor, expr } => NodeKind::Stmt {
                flavor: *flavor,
                expr: copy(expr),
            },
            NodeKind::And { lhs, rhs } => NodeKind::And {
                lhs: copy(lhs),
                rhs: copy(rhs),
            },
            NodeKind::Pipe { lhs, rhs } => NodeKind::Pipe {
                lhs: copy(lhs),
                rhs: copy(rhs),
            },
            NodeKind::Scope(body) => NodeKind::Scope(copy(body)),
            NodeKind::Do { target, body } => NodeKind::Do {
                target: copy(target),
                body: copy(body),
            },
            NodeKind::If {
                test,
                then,
                otherwise,
            } => NodeKind::If {
                test: copy(test),
                then: copy(then),
                otherwise: copy_opt(otherwise),
            },
            NodeKind::While { flavor, test, body } => NodeKind::While {
                flavor: *flavor,
                test: copy(test),
                body: copy(body),
            },
            NodeKind::Foreach {
                flavor,
                index,
                list,
                body,
            } => NodeKind::Foreach {
                flavor: *flavor,
                index: index.clone(),
                list: copy(list),
                body: copy(body),
            },
            NodeKind::Every {
                flavor,
                period,
                body,
            } => NodeKind::Every {
                flavor: *flavor,
                period: copy(period),
                body: copy(body),
            },
            NodeKind::At {
                test,
                body,
                onleave,
            } => NodeKind::At {
                test: copy(test),
                body: copy(body),
                onleave: copy_opt(onleave),
            },
            NodeKind::TaggedStmt { tag, expr } => NodeKind::TaggedStmt {
                tag: copy(tag),
                expr: copy(expr),
            },
            NodeKind::Throw(value) => NodeKind::Throw(copy_opt(value)),
            NodeKind::Try {
                body,
                binding,
                handler,
            } => NodeKind::Try {
                body: copy(body),
                binding: binding.clone(),
                handler: copy(handler),
            },
            NodeKind::Break => NodeKind::Break,
            NodeKind::Continue => NodeKind::Continue,
            NodeKind::Return(value) => NodeKind::Return(copy_opt(value)),
            NodeKind::Function {
                params,
                body,
                closure,
            } => NodeKind::Function {
                params: params.clone(),
                body: copy(body),
                closure: *closure,
            },
            NodeKind::This => NodeKind::This,
            NodeKind::CallMsg => NodeKind::CallMsg,
            NodeKind::Message { channel, text } => NodeKind::Message {
                channel: channel.clone(),
                text: text.clone(),
            },
            NodeKind::Noop => NodeKind::Noop,
        };

        Node::new(self.span.clone(), kind)
    }

    /// Splits `a.b.c` (argument-less sends only) into `["a", "b", "c"]`.
    pub fn tag_chain(&self) -> Option<Vec<String>> {
        match &self.kind {
            NodeKind::Call {
                target,
                name,
                args: None,
            } => {
                let mut chain = match target {
                    Some(target) => target.tag_chain()?,
                    None => Vec::new(),
                };
                chain.push(name.clone());
                Some(chain)
            }
            _ => None,
        }
    }
}

fn write_list(f: &mut std::fmt::Formatter<'_>, nodes: &[Rc<Node>]) -> std::fmt::Result {
    for (i, node) in nodes.iter().enumerate() {
        write!(f, "{}", node)?;
        if i != nodes.len() - 1 {
            write!(f, ", ")?;
        }
    }
    Ok(())
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            NodeKind::Float(v) => write!(f, "{}", v),
            NodeKind::String(s) => write!(f, "{:?}", s),
            NodeKind::List(items) => {
                write!(f, "[")?;
                write_list(f, items)?;
                write!(f, "]")
            }
            NodeKind::Call { target, name, args } => {
                if let Some(target) = target {
                    write!(f, "{}.", target)?;
                }
                write!(f, "{}", name)?;
                if let Some(args) = args {
                    write!(f, "(")?;
                    write_list(f, args)?;
                    write!(f, ")")?;
                }
                Ok(())
            }
            NodeKind::Declare { name, value } => match value {
                Some(value) => write!(f, "var {} = {}", name, value),
                None => write!(f, "var {}", name),
            },
            NodeKind::Assign {
                target,
                name,
                value,
            } => {
                if let Some(target) = target {
                    write!(f, "{}.", target)?;
                }
                write!(f, "{} = {}", name, value)
            }
            NodeKind::Nary { children, .. } => {
                for (i, child) in children.iter().enumerate() {
                    write!(f, "{}", child)?;
                    if i != children.len() - 1 {
                        writeln!(f)?;
                    }
                }
                Ok(())
            }
            NodeKind::Stmt { flavor, expr } => write!(f, "{}{}", expr, flavor.symbol()),
            NodeKind::And { lhs, rhs } => write!(f, "{} & {}", lhs, rhs),
            NodeKind::Pipe { lhs, rhs } => write!(f, "{} | {}", lhs, rhs),
            NodeKind::Scope(body) => write!(f, "{{\n{}\n}}", body),
            NodeKind::Do { target, body } => write!(f, "do ({}) {{\n{}\n}}", target, body),
            NodeKind::If {
                test,
                then,
                otherwise,
            } => {
                write!(f, "if ({}) {}", test, then)?;
                if let Some(otherwise) = otherwise {
                    write!(f, " else {}", otherwise)?;
                }
                Ok(())
            }
            NodeKind::While { flavor, test, body } => {
                write!(f, "while{} ({}) {}", flavor.symbol(), test, body)
            }
            NodeKind::Foreach {
                flavor,
                index,
                list,
                body,
            } => write!(f, "for{} ({} : {}) {}", flavor.symbol(), index, list, body),
            NodeKind::Every {
                flavor,
                period,
                body,
            } => write!(f, "every{} ({}) {}", flavor.symbol(), period, body),
            NodeKind::At {
                test,
                body,
                onleave,
            } => {
                write!(f, "at ({}) {}", test, body)?;
                if let Some(onleave) = onleave {
                    write!(f, " onleave {}", onleave)?;
                }
                Ok(())
            }
            NodeKind::TaggedStmt { tag, expr } => write!(f, "{}: {}", tag, expr),
            NodeKind::Throw(value) => match value {
                Some(value) => write!(f, "throw {}", value),
                None => write!(f, "throw"),
            },
            NodeKind::Try {
                body,
                binding,
                handler,
            } => match binding {
                Some(name) => write!(f, "try {} catch ({}) {}", body, name, handler),
                None => write!(f, "try {} catch {}", body, handler),
            },
            NodeKind::Break => write!(f, "break"),
            NodeKind::Continue => write!(f, "continue"),
            NodeKind::Return(value) => match value {
                Some(value) => write!(f, "return {}", value),
                None => write!(f, "return"),
            },
            NodeKind::Function {
                params,
                body,
                closure,
            } => {
                write!(f, "{}", if *closure { "closure" } else { "function" })?;
                if let Some(params) = params {
                    write!(f, " ({})", params.join(", "))?;
                }
                write!(f, " {}", body)
            }
            NodeKind::This => write!(f, "this"),
            NodeKind::CallMsg => write!(f, "call"),
            NodeKind::Message { channel, text } => write!(f, "{}<< {:?}", channel, text),
            NodeKind::Noop => write!(f, "{{}}"),
        }
    }
}
