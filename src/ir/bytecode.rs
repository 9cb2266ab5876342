//! The stack bytecode accepted by the compiler.
//!
//! Programs arrive as JSON. Each method carries its key, the kinds of its
//! extra locals (parameters come from the descriptor), the instruction list
//! and an exception-handler table. Branch targets and handler bounds are
//! instruction indices.

use super::kind::{Kind, ObjectRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Most arguments a call can pass in registers.
pub const MAX_ARGUMENTS: usize = 8;

/// Holder of the runtime support routines that allocation, array access and
/// throwing are lowered to.
pub const SNIPPET_HOLDER: &str = "Snippets";

/// Malformed input bytecode.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BytecodeError {
    #[error("{method}: stack underflow at {pc}")]
    StackUnderflow { method: String, pc: usize },
    #[error("{method}: expected {expected} at {pc}, found {found}")]
    KindMismatch { method: String, pc: usize, expected: Kind, found: Kind },
    #[error("{method}: branch at {pc} targets {target}, outside the method")]
    BadBranchTarget { method: String, pc: usize, target: usize },
    #[error("{method}: local {index} used at {pc} does not exist")]
    BadLocal { method: String, pc: usize, index: u16 },
    #[error("{method}: stack shapes disagree at the merge into {pc}")]
    StackMismatch { method: String, pc: usize },
    #[error("{method}: execution falls off the end of the code")]
    FallsOffEnd { method: String },
    #[error("{method}: exception handler {index} has an invalid range")]
    BadHandler { method: String, index: usize },
    #[error("bad method descriptor {0:?}")]
    BadDescriptor(String),
    #[error("{method}: {count} arguments exceed the limit of {MAX_ARGUMENTS}")]
    TooManyArguments { method: String, count: usize },
    #[error("malformed program: {0}")]
    Json(String),
}

/// Logical identity of a method, independent of any compiled version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey {
    pub holder: String,
    pub name: String,
    pub descriptor: String,
}

impl MethodKey {
    pub fn new(holder: &str, name: &str, descriptor: &str) -> Self {
        Self { holder: holder.to_string(), name: name.to_string(), descriptor: descriptor.to_string() }
    }

    pub fn snippet(name: &str, descriptor: &str) -> Self {
        Self::new(SNIPPET_HOLDER, name, descriptor)
    }

    pub fn signature(&self) -> Result<Signature, BytecodeError> {
        Signature::parse(&self.descriptor)
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.holder, self.name, self.descriptor)
    }
}

/// Parameter and return kinds of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<Kind>,
    pub ret: Kind,
}

impl Signature {
    /// Parse a descriptor such as `(IJLjava/lang/Object;[D)V`.
    pub fn parse(descriptor: &str) -> Result<Self, BytecodeError> {
        let bad = || BytecodeError::BadDescriptor(descriptor.to_string());
        let rest = descriptor.strip_prefix('(').ok_or_else(bad)?;
        let (params_text, ret_text) = rest.split_once(')').ok_or_else(bad)?;

        let mut params = Vec::new();
        let mut chars = params_text.chars().peekable();
        while chars.peek().is_some() {
            let kind = parse_field(&mut chars).ok_or_else(bad)?;
            if kind == Kind::Void {
                return Err(bad());
            }
            params.push(kind);
        }

        let mut ret_chars = ret_text.chars().peekable();
        let ret = parse_field(&mut ret_chars).ok_or_else(bad)?;
        if ret_chars.next().is_some() {
            return Err(bad());
        }
        Ok(Self { params, ret })
    }
}

fn parse_field(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<Kind> {
    match chars.next()? {
        'I' | 'Z' | 'B' | 'C' | 'S' => Some(Kind::Int),
        'J' => Some(Kind::Long),
        'D' => Some(Kind::Double),
        'W' => Some(Kind::Word),
        'V' => Some(Kind::Void),
        'L' => {
            let mut name_len = 0;
            for c in chars.by_ref() {
                if c == ';' {
                    return (name_len > 0).then_some(Kind::Reference);
                }
                name_len += 1;
            }
            None
        }
        '[' => match parse_field(chars)? {
            Kind::Void => None,
            _ => Some(Kind::Reference),
        },
        _ => None,
    }
}

/// Branch conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Comparison {
    pub fn eval<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Ge => lhs >= rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Le => lhs <= rhs,
        }
    }

    pub fn negate(self) -> Self {
        match self {
            Comparison::Eq => Comparison::Ne,
            Comparison::Ne => Comparison::Eq,
            Comparison::Lt => Comparison::Ge,
            Comparison::Ge => Comparison::Lt,
            Comparison::Gt => Comparison::Le,
            Comparison::Le => Comparison::Gt,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Lt => "<",
            Comparison::Ge => ">=",
            Comparison::Gt => ">",
            Comparison::Le => "<=",
        };
        f.write_str(s)
    }
}

/// A bytecode instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    IConst(i32),
    LConst(i64),
    DConst(f64),
    AConstNull,
    /// Push a constant object handle.
    Ldc(ObjectRef),
    Load(u16),
    Store(u16),
    Pop,
    Dup,
    IAdd, ISub, IMul, IDiv, IRem, IAnd, IOr, IXor, INeg,
    LAdd, LSub, LMul, LDiv, LRem, LAnd, LOr, LXor, LNeg,
    DAdd, DSub, DMul, DDiv,
    #[serde(rename = "i2l")]
    I2L,
    #[serde(rename = "l2i")]
    L2I,
    /// Compare the top int with zero.
    If { cond: Comparison, target: usize },
    /// Compare the two top values, which must have the same kind.
    IfCmp { cond: Comparison, target: usize },
    IfNull(usize),
    IfNonNull(usize),
    Goto(usize),
    NewArray(Kind),
    NewInstance(ObjectRef),
    ArrayLength,
    ArrayLoad(Kind),
    ArrayStore(Kind),
    InvokeStatic(MethodKey),
    InvokeNative(MethodKey),
    /// Call through a word-sized code address on top of the stack.
    InvokeIndirect(String),
    Throw,
    Return,
    ReturnValue,
    Safepoint,
}

impl Instruction {
    /// Branch target, if this instruction can transfer control.
    pub fn branch_target(&self) -> Option<usize> {
        match self {
            Instruction::If { target, .. }
            | Instruction::IfCmp { target, .. }
            | Instruction::IfNull(target)
            | Instruction::IfNonNull(target)
            | Instruction::Goto(target) => Some(*target),
            _ => None,
        }
    }

    /// Whether control never continues with the next instruction.
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            Instruction::Goto(_) | Instruction::Throw | Instruction::Return | Instruction::ReturnValue
        )
    }
}

/// One exception-handler table entry covering `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BytecodeMethod {
    pub key: MethodKey,
    /// Kinds of the locals that follow the parameters.
    #[serde(default)]
    pub locals: Vec<Kind>,
    pub code: Vec<Instruction>,
    #[serde(default)]
    pub handlers: Vec<Handler>,
}

impl BytecodeMethod {
    pub fn signature(&self) -> Result<Signature, BytecodeError> {
        self.key.signature()
    }

    /// Kinds of every local slot, parameters first.
    pub fn local_kinds(&self) -> Result<Vec<Kind>, BytecodeError> {
        let mut kinds = self.signature()?.params;
        kinds.extend(self.locals.iter().copied());
        Ok(kinds)
    }

    /// The first handler covering `pc`, in table order.
    pub fn handler_for(&self, pc: usize) -> Option<&Handler> {
        self.handlers.iter().find(|h| h.start <= pc && pc < h.end)
    }
}

/// A set of methods compiled together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Program {
    pub methods: Vec<BytecodeMethod>,
}

impl Program {
    pub fn from_json(text: &str) -> Result<Self, BytecodeError> {
        serde_json::from_str(text).map_err(|e| BytecodeError::Json(e.to_string()))
    }

    pub fn get(&self, key: &MethodKey) -> Option<&BytecodeMethod> {
        self.methods.iter().find(|m| &m.key == key)
    }
}

/// Source of callee bodies for inlining.
pub trait MethodProvider: Sync {
    fn method(&self, key: &MethodKey) -> Option<&BytecodeMethod>;
}

impl MethodProvider for Program {
    fn method(&self, key: &MethodKey) -> Option<&BytecodeMethod> {
        self.get(key)
    }
}

/// A provider with no methods; disables inlining.
pub struct NoMethods;

impl MethodProvider for NoMethods {
    fn method(&self, _key: &MethodKey) -> Option<&BytecodeMethod> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        let sig = Signature::parse("(IJLjava/lang/Object;[D)V").unwrap();
        assert_eq!(sig.params, vec![Kind::Int, Kind::Long, Kind::Reference, Kind::Reference]);
        assert_eq!(sig.ret, Kind::Void);
    }

    #[test]
    fn test_bad_descriptors() {
        for bad in ["II", "(I", "(V)I", "(L;)V", "(Lfoo)V", "()", "()IJ", "(F)V"] {
            assert!(Signature::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_program_from_json() {
        let json = r#"[{
            "key": {"holder": "Demo", "name": "inc", "descriptor": "(I)I"},
            "code": [{"load": 0}, {"i_const": 1}, "i_add", "return_value"]
        }]"#;
        let program = Program::from_json(json).unwrap();
        assert_eq!(program.methods[0].code[2], Instruction::IAdd);
        assert_eq!(program.methods[0].key.to_string(), "Demo.inc(I)I");
    }

    #[test]
    fn test_handler_lookup_uses_table_order() {
        let method = BytecodeMethod {
            key: MethodKey::new("A", "m", "()V"),
            locals: vec![],
            code: vec![Instruction::Return],
            handlers: vec![
                Handler { start: 0, end: 4, handler: 10 },
                Handler { start: 0, end: 8, handler: 20 },
            ],
        };
        assert_eq!(method.handler_for(2).map(|h| h.handler), Some(10));
        assert_eq!(method.handler_for(6).map(|h| h.handler), Some(20));
        assert!(method.handler_for(8).is_none());
    }
}
