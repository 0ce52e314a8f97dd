use std::collections::HashSet;
use std::path::PathBuf;

use crate::ast::{Node, NodeKind};
use crate::map::CrushMap;
use crate::parser::{self, ParseError};
use crate::scope::ScopeChain;
use crate::word::{Word, crush, op};
use crate::writer::CodeWriter;

// ── Compiler ────────────────────────────────────────────────────────
//
// Walks the program tree and emits tokens through per-node writers
// that merge bottom-up. Identifier references compile to crushed
// names; inside a `def` body, parameter names are rewritten to the
// positional `__p0…` bindings through a compile-time scope chain, so
// the emitted code never mentions the source parameter names.

/// Increment peephole bound: `set(x +(x k))` folds to one opcode only
/// for integer `k` with `0 < |k| <= 100`.
const MAX_INCREMENT: f64 = 100.0;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{form} expects {expected} argument(s), got {got}")]
    Arity { form: &'static str, expected: usize, got: usize },
    #[error("`{form}` target must be a bare name, got {got:?}")]
    BadTarget { form: &'static str, got: String },
    #[error("duplicate parameter `{name}` in definition of `{function}`")]
    DuplicateParameter { function: String, name: String },
    #[error("parameter of `{function}` must be a simple name, got {got:?}")]
    BadParameter { function: String, got: String },
    #[error("name hash collision: `{existing}` and `{incoming}` crush to {hash:#010x}")]
    HashCollision { existing: String, incoming: String, hash: u32 },
    #[error("import is only legal at the program root")]
    NestedImport,
    #[error("cannot import {path}: {source}")]
    Import { path: PathBuf, source: std::io::Error },
    #[error("`pick` may only contain `if` forms, got `{got}`")]
    MalformedPick { got: String },
    #[error("`def` expects a name+parameter-list and a body group")]
    MalformedDef,
    #[error("function body of `{function}` exceeds the definable size")]
    BodyTooLarge { function: String },
    #[error("`{form}` condition block exceeds the skippable size")]
    BlockTooLarge { form: &'static str },
    #[error("definitions nested too deeply")]
    DefTooDeep,
}

type Result<T> = std::result::Result<T, CompileError>;

/// Where an expression sits. Inside the target position of a memory
/// form, a bare name compiles to a variable reference instead of an
/// implicit `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Default,
    MemoryAccess,
}

/// A compiled subtree: its tokens plus whether it can leave a value on
/// the stack via `return` (decides the Return vs InvalidReturn trailer
/// of a definition).
#[derive(Debug, Default)]
pub struct Fragment {
    pub writer: CodeWriter,
    pub returns_value: bool,
}

impl Fragment {
    fn merge(&mut self, other: Fragment) {
        self.returns_value |= other.returns_value;
        self.writer.merge(other.writer);
    }
}

pub struct Compiler {
    symbols: CrushMap<String>,
    base_dir: PathBuf,
    imported: HashSet<PathBuf>,
    synthetic: usize,
}

impl Compiler {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Compiler {
            symbols: CrushMap::new(),
            base_dir: base_dir.into(),
            imported: HashSet::new(),
            synthetic: 0,
        }
    }

    /// Crushed name → source identifier, for runtime diagnostics.
    pub fn into_symbols(self) -> CrushMap<String> {
        self.symbols
    }

    pub fn compile_program(&mut self, root: &Node) -> Result<Fragment> {
        let mut scope = ScopeChain::new();
        let mut out = Fragment::default();
        for child in &root.children {
            let frag = self.compile(child, &mut scope, Context::Default, true)?;
            out.merge(frag);
        }
        Ok(out)
    }

    fn compile(
        &mut self,
        node: &Node,
        scope: &mut ScopeChain,
        ctx: Context,
        at_root: bool,
    ) -> Result<Fragment> {
        if node.kind == NodeKind::Group {
            let mut out = Fragment::default();
            for child in &node.children {
                let frag = self.compile(child, scope, Context::Default, false)?;
                out.merge(frag);
            }
            return Ok(out);
        }
        if node.is_leaf() {
            return self.compile_leaf(node, scope, ctx);
        }

        match node.text.as_str() {
            "get" | "isset" | "unset" | "set" => self.compile_memory(node, scope),
            "if" | "while" => self.compile_block(node, scope),
            "import" => self.compile_import(node, scope, at_root),
            "def" => self.compile_def(node, scope),
            "pick" => self.compile_pick(node, scope),
            "return" => self.compile_return(node, scope),
            _ => self.compile_call(node, scope),
        }
    }

    fn compile_leaf(&mut self, node: &Node, scope: &mut ScopeChain, ctx: Context) -> Result<Fragment> {
        let mut frag = Fragment::default();
        match node.kind {
            NodeKind::Numeric => {
                let n: f64 = node.text.parse().unwrap_or(f64::NAN);
                frag.writer.number(n);
            }
            NodeKind::StringLiteral => frag.writer.string(&node.text),
            NodeKind::Atom => match node.text.as_str() {
                // boolean literals in every position, including the
                // value slot of `set`
                "true" => frag.writer.boolean(true),
                "false" => frag.writer.boolean(false),
                name => {
                    let hash = self.effective_hash(scope, name)?;
                    if ctx == Context::MemoryAccess {
                        frag.writer.variable_reference(hash);
                    } else {
                        // sugar: a bare identifier reads itself
                        frag.writer.memory(op::MEM_GET, hash);
                    }
                }
            },
            NodeKind::Group => unreachable!("groups handled by compile"),
        }
        Ok(frag)
    }

    /// Parameter names resolve through the compile-time scope to their
    /// positional `__pN` hash; everything else registers in the symbol
    /// table (which is also the cross-name collision check).
    fn effective_hash(&mut self, scope: &ScopeChain, name: &str) -> Result<u32> {
        let hash = crush(name);
        if let Ok(word) = scope.resolve(hash) {
            return Ok(word.as_name());
        }
        self.register_symbol(name)
    }

    fn register_symbol(&mut self, name: &str) -> Result<u32> {
        let hash = crush(name);
        match self.symbols.try_get(hash) {
            Some(existing) if existing != name => Err(CompileError::HashCollision {
                existing: existing.clone(),
                incoming: name.to_string(),
                hash,
            }),
            Some(_) => Ok(hash),
            None => {
                // fresh key, add cannot fail
                let _ = self.symbols.add(hash, name.to_string());
                Ok(hash)
            }
        }
    }

    // ── Memory forms ────────────────────────────────────────────────

    fn compile_memory(&mut self, node: &Node, scope: &mut ScopeChain) -> Result<Fragment> {
        let form: &'static str = match node.text.as_str() {
            "get" => "get",
            "set" => "set",
            "isset" => "isset",
            "unset" => "unset",
            _ => unreachable!(),
        };
        // get takes an optional second argument: an index into the
        // string value, compiled to the indexed-read opcode
        let indexed = form == "get" && node.children.len() == 2;
        let expected = if form == "set" { 2 } else { 1 };
        if node.children.len() != expected && !indexed {
            return Err(CompileError::Arity { form, expected, got: node.children.len() });
        }
        let target = &node.children[0];
        if !(target.is_leaf() && target.kind == NodeKind::Atom) {
            return Err(CompileError::BadTarget { form, got: target.text.clone() });
        }

        if form == "set" {
            if let Some((delta, name)) = increment_pattern(node) {
                let hash = self.effective_hash(scope, name)?;
                let mut frag = Fragment::default();
                frag.writer.increment(delta, hash);
                return Ok(frag);
            }
        }

        let hash = self.effective_hash(scope, &target.text)?;
        let mut frag = Fragment::default();
        if form == "set" {
            let value = self.compile(&node.children[1], scope, Context::MemoryAccess, false)?;
            frag.merge(value);
        }
        if indexed {
            let index = self.compile(&node.children[1], scope, Context::Default, false)?;
            frag.merge(index);
            frag.writer.memory(op::MEM_INDEX, hash);
            return Ok(frag);
        }
        let action = match form {
            "get" => op::MEM_GET,
            "set" => op::MEM_SET,
            "isset" => op::MEM_ISSET,
            "unset" => op::MEM_UNSET,
            _ => unreachable!(),
        };
        frag.writer.memory(action, hash);
        Ok(frag)
    }

    // ── Control blocks ──────────────────────────────────────────────

    fn compile_block(&mut self, node: &Node, scope: &mut ScopeChain) -> Result<Fragment> {
        let is_while = node.text == "while";
        let form: &'static str = if is_while { "while" } else { "if" };
        if node.children.len() < 2 {
            return Err(CompileError::Arity { form, expected: 2, got: node.children.len() });
        }
        let condition = &node.children[0];

        // body first, so the skip distance is known exactly
        let mut body = Fragment::default();
        for child in &node.children[1..] {
            let frag = self.compile(child, scope, Context::Default, false)?;
            body.merge(frag);
        }
        let body_len = body.writer.len();
        let skip = body_len + usize::from(is_while); // also skip the back-jump

        let mut out = Fragment::default();
        let fused = fused_compare(condition).filter(|_| skip <= usize::from(u16::MAX));
        match fused {
            Some(cmp) => {
                let operands = &condition.children;
                for operand in operands {
                    let frag = self.compile_compare_operand(operand, scope)?;
                    out.merge(frag);
                }
                out.writer.compound_compare_jump(cmp, operands.len() as u16, skip as u16);
            }
            None => {
                let cond = self.compile(condition, scope, Context::Default, false)?;
                out.merge(cond);
                let skip = u32::try_from(skip)
                    .map_err(|_| CompileError::BlockTooLarge { form })?;
                out.writer.compare_jump(skip);
            }
        }
        out.merge(body);
        if is_while {
            // lands back on the first condition token
            let back = u32::try_from(out.writer.len() + 1)
                .map_err(|_| CompileError::BlockTooLarge { form })?;
            out.writer.unconditional_jump(back);
        }
        Ok(out)
    }

    /// Operands of a fused comparison push either a literal or a raw
    /// variable reference; the engine resolves references while
    /// folding.
    fn compile_compare_operand(&mut self, operand: &Node, scope: &mut ScopeChain) -> Result<Fragment> {
        let mut frag = Fragment::default();
        match operand.kind {
            NodeKind::Numeric | NodeKind::StringLiteral => {
                return self.compile_leaf(operand, scope, Context::Default);
            }
            NodeKind::Atom if operand.is_leaf() => {
                match operand.text.as_str() {
                    "true" => frag.writer.boolean(true),
                    "false" => frag.writer.boolean(false),
                    name => {
                        let hash = self.effective_hash(scope, name)?;
                        frag.writer.variable_reference(hash);
                    }
                }
            }
            _ => {
                // one-level get(x)
                let hash = self.effective_hash(scope, &operand.children[0].text)?;
                frag.writer.variable_reference(hash);
            }
        }
        Ok(frag)
    }

    // ── Imports ─────────────────────────────────────────────────────

    fn compile_import(&mut self, node: &Node, scope: &mut ScopeChain, at_root: bool) -> Result<Fragment> {
        if !at_root {
            return Err(CompileError::NestedImport);
        }
        if node.children.len() != 1 {
            return Err(CompileError::Arity { form: "import", expected: 1, got: node.children.len() });
        }
        let path = self.base_dir.join(&node.children[0].text);
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());

        let mut out = Fragment::default();
        if !self.imported.insert(canonical) {
            // importing the same file twice is a no-op, not an error
            out.writer.comment(format!("import skipped (already loaded): {}", path.display()));
            return Ok(out);
        }

        let source = std::fs::read_to_string(&path)
            .map_err(|source| CompileError::Import { path: path.clone(), source })?;
        let root = parser::parse(&source)?;
        for child in &root.children {
            let frag = self.compile(child, scope, Context::Default, true)?;
            out.merge(frag);
        }
        Ok(out)
    }

    // ── Definitions ─────────────────────────────────────────────────

    fn compile_def(&mut self, node: &Node, scope: &mut ScopeChain) -> Result<Fragment> {
        if node.children.len() != 2 {
            return Err(CompileError::MalformedDef);
        }
        let head = &node.children[0];
        let body_node = &node.children[1];
        if head.kind != NodeKind::Atom || body_node.kind != NodeKind::Group {
            return Err(CompileError::MalformedDef);
        }
        let function = head.text.clone();
        let name_hash = self.register_symbol(&function)?;

        // parameters bind to positional names for the body's duration
        scope.push_scope(&[]).map_err(|_| CompileError::DefTooDeep)?;
        let mut seen = HashSet::new();
        for (i, param) in head.children.iter().enumerate() {
            if !(param.is_leaf() && param.kind == NodeKind::Atom) {
                return Err(CompileError::BadParameter {
                    function,
                    got: param.text.clone(),
                });
            }
            if !seen.insert(crush(&param.text)) {
                return Err(CompileError::DuplicateParameter {
                    function,
                    name: param.text.clone(),
                });
            }
            self.register_symbol(&param.text)?;
            let positional = self.register_symbol(&format!("__p{i}"))?;
            scope.bind_local(crush(&param.text), Word::name(positional));
        }

        let mut body = Fragment::default();
        for child in &body_node.children {
            let frag = self.compile(child, scope, Context::Default, false)?;
            body.merge(frag);
        }
        scope.drop_scope();

        // body + one trailer token
        let skip = u16::try_from(body.writer.len() + 1)
            .map_err(|_| CompileError::BodyTooLarge { function: head.text.clone() })?;

        let mut out = Fragment::default();
        out.writer.function_define(name_hash, head.children.len() as u16, skip);
        let returns_value = body.returns_value;
        out.writer.merge(body.writer);
        if returns_value {
            // reaching this trap means the function fell through
            out.writer.invalid_return();
        } else {
            out.writer.return_op();
        }
        Ok(out)
    }

    // ── pick desugaring ─────────────────────────────────────────────
    //
    // `pick(if(c1 v1) if(c2 v2) …)` rewrites into a synthetic
    // zero-argument function whose ifs each end in a bare `return`,
    // defined and immediately called.

    fn compile_pick(&mut self, node: &Node, scope: &mut ScopeChain) -> Result<Fragment> {
        let mut arms = Vec::with_capacity(node.children.len());
        for child in &node.children {
            if !(child.is_call() && child.text == "if") {
                return Err(CompileError::MalformedPick { got: child.text.clone() });
            }
            let mut arm = child.clone();
            arm.children.push(Node::call("return", Vec::new()));
            arms.push(arm);
        }
        let name = format!("__pick{}", self.synthetic);
        self.synthetic += 1;

        let def = Node::call("def", vec![Node::call(&name, Vec::new()), Node::group(arms)]);
        let call = Node::call(&name, Vec::new());

        let mut out = self.compile(&def, scope, Context::Default, false)?;
        let frag = self.compile(&call, scope, Context::Default, false)?;
        out.merge(frag);
        Ok(out)
    }

    // ── Calls and return ────────────────────────────────────────────

    fn compile_return(&mut self, node: &Node, scope: &mut ScopeChain) -> Result<Fragment> {
        let mut out = Fragment::default();
        for child in &node.children {
            let frag = self.compile(child, scope, Context::Default, false)?;
            out.merge(frag);
        }
        out.writer.return_op();
        out.returns_value = !node.children.is_empty();
        Ok(out)
    }

    fn compile_call(&mut self, node: &Node, scope: &mut ScopeChain) -> Result<Fragment> {
        let mut out = Fragment::default();
        for child in &node.children {
            let frag = self.compile(child, scope, Context::Default, false)?;
            out.merge(frag);
        }
        let hash = self.register_symbol(&node.text)?;
        out.writer.function_call(hash, node.children.len() as u16);
        Ok(out)
    }
}

/// Detect `set(x +(x k))`, `set(x +(k x))` and `set(x -(x k))` for a
/// small nonzero integer literal `k`. Both `x` and `get(x)` spellings
/// count on either side.
fn increment_pattern(set_node: &Node) -> Option<(i8, &str)> {
    let target = &set_node.children[0];
    let value = &set_node.children[1];
    if !value.is_call() || value.children.len() != 2 {
        return None;
    }
    let (lhs, rhs) = (&value.children[0], &value.children[1]);
    match value.text.as_str() {
        "+" => {
            if let Some(k) = small_literal(rhs).filter(|_| reads_name(lhs, &target.text)) {
                return Some((k, &target.text));
            }
            if let Some(k) = small_literal(lhs).filter(|_| reads_name(rhs, &target.text)) {
                return Some((k, &target.text));
            }
            None
        }
        "-" => small_literal(rhs)
            .filter(|_| reads_name(lhs, &target.text))
            .map(|k| (-k, target.text.as_str())),
        _ => None,
    }
}

/// `x` or `get(x)`.
fn reads_name(node: &Node, name: &str) -> bool {
    if node.is_leaf() && node.kind == NodeKind::Atom {
        return node.text == name;
    }
    node.is_call()
        && node.text == "get"
        && node.children.len() == 1
        && node.children[0].is_leaf()
        && node.children[0].text == name
}

fn small_literal(node: &Node) -> Option<i8> {
    if node.kind != NodeKind::Numeric {
        return None;
    }
    let n: f64 = node.text.parse().ok()?;
    if n == 0.0 || n.fract() != 0.0 || n.abs() > MAX_INCREMENT {
        return None;
    }
    Some(n as i8)
}

/// A condition qualifies for the fused compare-and-jump when it is a
/// single known comparison whose operands are all simple: a literal, a
/// bare identifier, or a one-level `get`.
fn fused_compare(condition: &Node) -> Option<u8> {
    if !condition.is_call() || condition.children.len() < 2 {
        return None;
    }
    let cmp = match condition.text.as_str() {
        "=" | "equals" => op::CMP_EQUAL,
        "<>" | "not-equal" => op::CMP_NOT_EQUAL,
        "<" => op::CMP_LESS,
        ">" => op::CMP_GREATER,
        _ => return None,
    };
    let all_simple = condition.children.iter().all(|operand| {
        operand.is_leaf()
            || (operand.is_call()
                && operand.text == "get"
                && operand.children.len() == 1
                && operand.children[0].is_leaf()
                && operand.children[0].kind == NodeKind::Atom)
    });
    if all_simple { Some(cmp) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::DataType;

    fn compile(source: &str) -> Fragment {
        let root = parser::parse(source).unwrap();
        Compiler::new(".").compile_program(&root).unwrap()
    }

    fn opcode_at(frag: &Fragment, idx: usize) -> (u8, u8) {
        let w = frag.writer.tokens()[idx];
        (w.op_class(), w.op_action())
    }

    #[test]
    fn bare_identifier_is_implicit_get() {
        let frag = compile("x");
        assert_eq!(frag.writer.len(), 1);
        assert_eq!(opcode_at(&frag, 0), (op::CLASS_MEMORY, op::MEM_GET));
        assert_eq!(frag.writer.tokens()[0].op_wide(), crush("x"));
    }

    #[test]
    fn true_false_are_literals() {
        let frag = compile("true false");
        assert_eq!(frag.writer.tokens()[0], Word::boolean(true));
        assert_eq!(frag.writer.tokens()[1], Word::boolean(false));
    }

    #[test]
    fn set_compiles_value_then_store() {
        let frag = compile("set(x 5)");
        assert_eq!(frag.writer.len(), 2);
        assert_eq!(frag.writer.tokens()[0], Word::number(5.0));
        assert_eq!(opcode_at(&frag, 1), (op::CLASS_MEMORY, op::MEM_SET));
    }

    #[test]
    fn set_of_bare_name_stores_a_reference() {
        let frag = compile("set(x y)");
        assert_eq!(frag.writer.tokens()[0].data_type().unwrap(), DataType::Name);
        assert_eq!(frag.writer.tokens()[0].as_name(), crush("y"));
    }

    #[test]
    fn set_of_boolean_literal_stores_the_boolean() {
        let frag = compile("set(x true)");
        assert_eq!(frag.writer.tokens()[0], Word::TRUE);
        let frag = compile("set(x false)");
        assert_eq!(frag.writer.tokens()[0], Word::FALSE);
    }

    #[test]
    fn increment_peephole_all_three_forms() {
        for source in [
            "set(x +(x 3))",
            "set(x +(3 x))",
            "set(x -(x 3))",
            "set(x +(get(x) 3))",
            "set(x +(3 get(x)))",
            "set(x -(get(x) 3))",
        ] {
            let frag = compile(source);
            assert_eq!(frag.writer.len(), 1, "{source} must fold to one opcode");
            let w = frag.writer.tokens()[0];
            assert_eq!(w.op_class(), op::CLASS_INCREMENT, "{source}");
            let delta = w.op_action() as i8;
            assert_eq!(delta.abs(), 3);
            assert_eq!(w.op_wide(), crush("x"));
        }
    }

    #[test]
    fn increment_peephole_rejects_out_of_range() {
        for source in ["set(x +(x 0))", "set(x +(x 101))", "set(x +(x 1.5))", "set(x -(3 x))"] {
            let frag = compile(source);
            assert!(
                frag.writer.tokens()[0].op_class() != op::CLASS_INCREMENT,
                "{source} must not fold"
            );
        }
    }

    #[test]
    fn if_skip_equals_body_length() {
        // condition is not a simple compare, so the generic path emits
        // cond + compare_jump(body_len)
        let frag = compile("if(isset(x) print(1) print(2))");
        let tokens = frag.writer.tokens();
        let jump = tokens
            .iter()
            .find(|w| w.is_opcode() && w.op_class() == op::CLASS_CONTROL)
            .unwrap();
        assert_eq!(jump.op_action(), op::CTRL_COMPARE_SKIP);
        // body: (1, name, call) x2 = 6 tokens
        assert_eq!(jump.op_wide(), 6);
    }

    #[test]
    fn while_skip_includes_back_jump() {
        let frag = compile("while(>(get(i) 0) set(i -(i 1)))");
        let tokens = frag.writer.tokens();
        // fused compare: ref(i), 0, C-op, increment, back-jump
        assert_eq!(tokens.len(), 5);
        let cmp = tokens[2];
        assert_eq!(cmp.op_class(), op::CLASS_COMPARE);
        assert_eq!(cmp.op_action(), op::CMP_GREATER);
        assert_eq!(cmp.op_p1(), 2);
        assert_eq!(cmp.op_p2(), 2); // body (1) + back-jump (1)
        let back = tokens[4];
        assert_eq!(back.op_action(), op::CTRL_JUMP_BACK);
        assert_eq!(back.op_wide(), 5); // back to the first operand
    }

    #[test]
    fn fused_compare_requires_simple_operands() {
        let frag = compile("if(=(+(a 1) 2) print(1))");
        let has_compound = frag
            .writer
            .tokens()
            .iter()
            .any(|w| w.is_opcode() && w.op_class() == op::CLASS_COMPARE);
        assert!(!has_compound);
    }

    #[test]
    fn def_emits_define_body_trailer() {
        let frag = compile("def(add (a b) (return(+(get(a) get(b)))))");
        let tokens = frag.writer.tokens();
        // name, define, body…, trailer
        assert_eq!(tokens[0].as_name(), crush("add"));
        let define = tokens[1];
        assert_eq!(define.op_class(), op::CLASS_FUNCTION);
        assert_eq!(define.op_action(), op::FN_DEFINE);
        assert_eq!(define.op_p1(), 2);
        assert_eq!(define.op_p2() as usize, tokens.len() - 2);
        // value-returning body ends in the fell-through trap
        let trailer = tokens[tokens.len() - 1];
        assert_eq!(trailer.op_action(), op::CTRL_TRAP);
    }

    #[test]
    fn def_without_return_gets_plain_trailer() {
        let frag = compile("def(noop () (set(x 1)))");
        let tokens = frag.writer.tokens();
        assert_eq!(tokens[tokens.len() - 1].op_action(), op::CTRL_RETURN);
    }

    #[test]
    fn def_params_compile_positionally() {
        let frag = compile("def(add (a b) (return(+(get(a) get(b)))))");
        let gets: Vec<u32> = frag
            .writer
            .tokens()
            .iter()
            .filter(|w| w.is_opcode() && w.op_class() == op::CLASS_MEMORY)
            .map(|w| w.op_wide())
            .collect();
        assert_eq!(gets, vec![crush("__p0"), crush("__p1")]);
    }

    #[test]
    fn duplicate_parameter_rejected() {
        let root = parser::parse("def(f (a a) (return(1)))").unwrap();
        let err = Compiler::new(".").compile_program(&root).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateParameter { .. }));
    }

    #[test]
    fn pick_desugars_to_define_and_call() {
        let frag = compile("pick(if(true 1) if(true 2))");
        let tokens = frag.writer.tokens();
        let define = tokens[1];
        assert_eq!(define.op_action(), op::FN_DEFINE);
        assert_eq!(define.op_p1(), 0);
        let call = tokens[tokens.len() - 1];
        assert_eq!(call.op_action(), op::FN_CALL);
    }

    #[test]
    fn pick_rejects_non_if() {
        let root = parser::parse("pick(print(1))").unwrap();
        let err = Compiler::new(".").compile_program(&root).unwrap_err();
        assert!(matches!(err, CompileError::MalformedPick { .. }));
    }

    #[test]
    fn nested_import_rejected() {
        let root = parser::parse("if(true import(\"lib.crush\"))").unwrap();
        let err = Compiler::new(".").compile_program(&root).unwrap_err();
        assert!(matches!(err, CompileError::NestedImport));
    }

    #[test]
    fn get_with_index_compiles_indexed_read() {
        let frag = compile("get(s 2)");
        let tokens = frag.writer.tokens();
        assert_eq!(tokens[0], Word::number(2.0));
        assert_eq!(opcode_at(&frag, 1), (op::CLASS_MEMORY, op::MEM_INDEX));
        assert_eq!(tokens[1].op_wide(), crush("s"));
    }

    #[test]
    fn memory_arity_checked() {
        let root = parser::parse("set(x)").unwrap();
        let err = Compiler::new(".").compile_program(&root).unwrap_err();
        assert!(matches!(err, CompileError::Arity { form: "set", .. }));
    }
}
