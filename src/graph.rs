//! Compiled execution graph
//!
//! A program arrives as an immutable graph of primitive instructions. Each
//! node names its successor(s) by `NodeId`; tokens walk the graph. Variables
//! are De Bruijn indices into the token's environment, with index 0 being the
//! most recently bound value.
//!
//! Graphs are produced by an external compiler. They can be built in code
//! with [`GraphBuilder`] or loaded from JSON with [`Graph::from_json`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::GraphError;
use crate::value::Value;

/// Position of a node in its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A constant embedded in the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Literal {
    Signal,
    Bool(bool),
    Int(i64),
    Str(String),
    Nil,
    Tuple(Vec<Literal>),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Signal => Value::Signal,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(n) => Value::Int(*n),
            Literal::Str(s) => Value::str(s),
            Literal::Nil => Value::Nil,
            Literal::Tuple(items) => Value::tuple(items.iter().map(Literal::to_value)),
        }
    }
}

impl From<i64> for Literal {
    fn from(n: i64) -> Self {
        Literal::Int(n)
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Bool(b)
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::Str(s.to_string())
    }
}

/// An operand: a variable, a constant, or a site by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arg {
    Var(usize),
    Lit(Literal),
    Site(String),
}

impl Arg {
    pub fn var(index: usize) -> Self {
        Arg::Var(index)
    }

    pub fn lit(lit: impl Into<Literal>) -> Self {
        Arg::Lit(lit.into())
    }

    pub fn site(name: impl Into<String>) -> Self {
        Arg::Site(name.into())
    }
}

/// A function definition: body entry point and arity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Def {
    #[serde(default)]
    pub name: Option<String>,
    pub arity: usize,
    pub body: NodeId,
}

impl Def {
    pub fn new(arity: usize, body: NodeId) -> Self {
        Self {
            name: None,
            arity,
            body,
        }
    }

    pub fn named(name: impl Into<String>, arity: usize, body: NodeId) -> Self {
        Self {
            name: Some(name.into()),
            arity,
            body,
        }
    }
}

/// One primitive instruction of the execution graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Node {
    /// Call a closure or site with resolved arguments, continuing at `next`
    /// with the callee's publication as the result
    Call {
        callee: Arg,
        args: Vec<Arg>,
        next: NodeId,
    },
    /// Parallel composition: continue at both `left` and `right`
    Fork { left: NodeId, right: NodeId },
    /// Push the current result as a new variable
    Bind { next: NodeId },
    /// Drop `width` variables when leaving a binding scope
    Unwind { width: usize, next: NodeId },
    /// Resolve an operand into the current result
    Load { value: Arg, next: NodeId },

    /// Pruning entry: run `right` as a producer in its own region and
    /// continue at `left` with a future for its first publication bound
    Pruning { left: NodeId, right: NodeId },
    /// Producer publication: resolve the pruning cell and cancel the producer
    Store,

    /// Otherwise entry: run `left`, falling back to `right` only if `left`
    /// halts without publishing
    Otherwise { left: NodeId, right: NodeId },
    /// Left-side publication of an otherwise: suppress the fallback and exit
    /// the otherwise region
    Leave { next: NodeId },

    /// Define a group of mutually recursive closures, binding them in order
    Defs { defs: Vec<Def>, next: NodeId },
    /// Return the current result to the caller's continuation
    Return,

    /// Install `handler` around `body`; publications of the handler and of
    /// the body both continue at `next`
    Catch { handler: Def, body: NodeId, next: NodeId },
    /// Body publication of a catch: uninstall the handler
    PopHandler { next: NodeId },
    /// Raise an error value to the nearest installed handler
    Throw { value: Arg },

    /// Emit the current result to the publication sink
    Publish,
    /// Halt silently
    Stop,
}

impl Node {
    /// Successor node ids named directly by this node
    pub fn successors(&self) -> Vec<NodeId> {
        match self {
            Node::Call { next, .. }
            | Node::Bind { next }
            | Node::Unwind { next, .. }
            | Node::Load { next, .. }
            | Node::Leave { next }
            | Node::PopHandler { next } => vec![*next],
            Node::Fork { left, right }
            | Node::Pruning { left, right }
            | Node::Otherwise { left, right } => vec![*left, *right],
            Node::Defs { defs, next } => {
                let mut out: Vec<NodeId> = defs.iter().map(|d| d.body).collect();
                out.push(*next);
                out
            }
            Node::Catch {
                handler,
                body,
                next,
            } => vec![handler.body, *body, *next],
            Node::Store | Node::Return | Node::Throw { .. } | Node::Publish | Node::Stop => {
                Vec::new()
            }
        }
    }

    /// Operands read by this node
    pub fn operands(&self) -> Vec<&Arg> {
        match self {
            Node::Call { callee, args, .. } => std::iter::once(callee).chain(args.iter()).collect(),
            Node::Load { value, .. } | Node::Throw { value } => vec![value],
            _ => Vec::new(),
        }
    }

    /// True for nodes after which a token never continues
    pub fn is_terminal(&self) -> bool {
        matches!(self, Node::Stop)
    }
}

/// An immutable compiled program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub root: NodeId,
    pub nodes: Vec<Node>,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parse a graph from its JSON form
    pub fn from_json(source: &str) -> Result<Graph, GraphError> {
        serde_json::from_str(source).map_err(|e| GraphError::Json(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, GraphError> {
        serde_json::to_string_pretty(self).map_err(|e| GraphError::Json(e.to_string()))
    }

    /// Check that every node reference is in range, every site name is known
    /// and every handler takes exactly one argument
    pub fn validate(&self, has_site: impl Fn(&str) -> bool) -> Result<(), GraphError> {
        let in_range = |id: NodeId| (id.0 as usize) < self.nodes.len();
        if !in_range(self.root) {
            return Err(GraphError::RootOutOfRange {
                root: self.root,
                len: self.nodes.len(),
            });
        }
        for (i, node) in self.nodes.iter().enumerate() {
            let at = NodeId(i as u32);
            for target in node.successors() {
                if !in_range(target) {
                    return Err(GraphError::DanglingNode { at, target });
                }
            }
            for arg in node.operands() {
                if let Arg::Site(name) = arg {
                    if !has_site(name) {
                        return Err(GraphError::UnknownSite {
                            at,
                            name: name.clone(),
                        });
                    }
                }
            }
            if let Node::Catch { handler, .. } = node {
                if handler.arity != 1 {
                    return Err(GraphError::HandlerArity {
                        at,
                        arity: handler.arity,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Incremental graph construction, continuations first
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Reserve a node to be filled in later with [`GraphBuilder::set`]
    pub fn reserve(&mut self) -> NodeId {
        self.push(Node::Stop)
    }

    pub fn set(&mut self, id: NodeId, node: Node) {
        self.nodes[id.0 as usize] = node;
    }

    pub fn publish(&mut self) -> NodeId {
        self.push(Node::Publish)
    }

    pub fn stop(&mut self) -> NodeId {
        self.push(Node::Stop)
    }

    pub fn ret(&mut self) -> NodeId {
        self.push(Node::Return)
    }

    pub fn store(&mut self) -> NodeId {
        self.push(Node::Store)
    }

    pub fn load(&mut self, value: Arg, next: NodeId) -> NodeId {
        self.push(Node::Load { value, next })
    }

    pub fn call(&mut self, callee: Arg, args: Vec<Arg>, next: NodeId) -> NodeId {
        self.push(Node::Call { callee, args, next })
    }

    pub fn fork(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.push(Node::Fork { left, right })
    }

    pub fn bind(&mut self, next: NodeId) -> NodeId {
        self.push(Node::Bind { next })
    }

    pub fn unwind(&mut self, width: usize, next: NodeId) -> NodeId {
        self.push(Node::Unwind { width, next })
    }

    pub fn pruning(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.push(Node::Pruning { left, right })
    }

    pub fn otherwise(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.push(Node::Otherwise { left, right })
    }

    pub fn leave(&mut self, next: NodeId) -> NodeId {
        self.push(Node::Leave { next })
    }

    pub fn defs(&mut self, defs: Vec<Def>, next: NodeId) -> NodeId {
        self.push(Node::Defs { defs, next })
    }

    pub fn catch(&mut self, handler: Def, body: NodeId, next: NodeId) -> NodeId {
        self.push(Node::Catch {
            handler,
            body,
            next,
        })
    }

    pub fn pop_handler(&mut self, next: NodeId) -> NodeId {
        self.push(Node::PopHandler { next })
    }

    pub fn throw(&mut self, value: Arg) -> NodeId {
        self.push(Node::Throw { value })
    }

    pub fn finish(self, root: NodeId) -> Graph {
        Graph {
            root,
            nodes: self.nodes,
        }
    }
}
