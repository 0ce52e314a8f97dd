use serde::Serialize;

// ── Program tree ────────────────────────────────────────────────────
//
// The compiler consumes this as an opaque tree: typed leaves plus
// call-form branches. A call form `name(a b)` is an Atom node with
// children and the call flag set (the flag matters for zero-argument
// calls like `random()`, which would otherwise look like a bare
// identifier). A bare `(a b)` group is an anonymous Group node. The
// root of every parse is a Group wrapping the program's statements.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    Numeric,
    StringLiteral,
    Atom,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub text: String,
    pub kind: NodeKind,
    pub call_form: bool,
    pub children: Vec<Node>,
}

impl Node {
    pub fn numeric(text: impl Into<String>) -> Node {
        Node { text: text.into(), kind: NodeKind::Numeric, call_form: false, children: Vec::new() }
    }

    pub fn string(text: impl Into<String>) -> Node {
        Node {
            text: text.into(),
            kind: NodeKind::StringLiteral,
            call_form: false,
            children: Vec::new(),
        }
    }

    pub fn atom(text: impl Into<String>) -> Node {
        Node { text: text.into(), kind: NodeKind::Atom, call_form: false, children: Vec::new() }
    }

    pub fn call(text: impl Into<String>, children: Vec<Node>) -> Node {
        Node { text: text.into(), kind: NodeKind::Atom, call_form: true, children }
    }

    pub fn group(children: Vec<Node>) -> Node {
        Node { text: String::new(), kind: NodeKind::Group, call_form: false, children }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && !self.call_form && self.kind != NodeKind::Group
    }

    /// True for a call form: an atom applied to (possibly zero)
    /// arguments.
    pub fn is_call(&self) -> bool {
        self.kind == NodeKind::Atom && self.call_form
    }
}
