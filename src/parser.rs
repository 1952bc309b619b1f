//! Lexer and parser for the lowered-procedure text format.
//!
//! Syntax:
//! - `global @name <cells> [= "literal"]`
//! - `declare @name(<arity>)`
//! - `define @name(%a: i32, %b: i32) -> i32 { <blocks> }`
//! - Blocks: `label:` followed by phis, instructions and one terminator
//! - Comments: `;` to end of line, `/* ... */` anywhere

use crate::error::{Error, Result};
use crate::ir::{
    BinOp, Block, BlockId, CastKind, Constant, Declaration, Global, Instr, InstrOp, Module,
    Operand, Phi, Predicate, Procedure, Terminator, Type, ValueId, ValueKind,
};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Local(String),
    At(String),
    Number(i64),
    StringLit(String),
    Colon,
    Comma,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Arrow,
    Equals,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

/// Tokenize source code. Block comments (including annotation directives)
/// and line comments are skipped.
fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;

    while i < chars.len() {
        match chars[i] {
            '\n' => {
                line += 1;
                i += 1;
            }
            ' ' | '\t' | '\r' => i += 1,
            ';' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < chars.len() && chars[i + 1] == '*' => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 2;
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                        match chars[i] {
                            'n' => s.push('\n'),
                            't' => s.push('\t'),
                            '0' => s.push('\0'),
                            c => s.push(c),
                        }
                    } else {
                        s.push(chars[i]);
                    }
                    i += 1;
                }
                i += 1;
                tokens.push(Token {
                    tok: Tok::StringLit(s),
                    line,
                });
            }
            '%' | '@' => {
                let sigil = chars[i];
                i += 1;
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '.'
                        || chars[i] == '$')
                {
                    i += 1;
                }
                if start == i {
                    return Err(Error::Parse {
                        line,
                        message: format!("dangling '{}'", sigil),
                    });
                }
                let name: String = chars[start..i].iter().collect();
                tokens.push(Token {
                    tok: if sigil == '%' {
                        Tok::Local(name)
                    } else {
                        Tok::At(name)
                    },
                    line,
                });
            }
            ':' => {
                tokens.push(Token {
                    tok: Tok::Colon,
                    line,
                });
                i += 1;
            }
            ',' => {
                tokens.push(Token {
                    tok: Tok::Comma,
                    line,
                });
                i += 1;
            }
            '(' => {
                tokens.push(Token {
                    tok: Tok::LParen,
                    line,
                });
                i += 1;
            }
            ')' => {
                tokens.push(Token {
                    tok: Tok::RParen,
                    line,
                });
                i += 1;
            }
            '{' => {
                tokens.push(Token {
                    tok: Tok::LBrace,
                    line,
                });
                i += 1;
            }
            '}' => {
                tokens.push(Token {
                    tok: Tok::RBrace,
                    line,
                });
                i += 1;
            }
            '[' => {
                tokens.push(Token {
                    tok: Tok::LBracket,
                    line,
                });
                i += 1;
            }
            ']' => {
                tokens.push(Token {
                    tok: Tok::RBracket,
                    line,
                });
                i += 1;
            }
            '=' => {
                tokens.push(Token {
                    tok: Tok::Equals,
                    line,
                });
                i += 1;
            }
            '-' if i + 1 < chars.len() && chars[i + 1] == '>' => {
                tokens.push(Token {
                    tok: Tok::Arrow,
                    line,
                });
                i += 2;
            }
            c if c == '-' || c.is_ascii_digit() => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<i64>().map_err(|_| Error::Parse {
                    line,
                    message: format!("bad number '{}'", text),
                })?;
                tokens.push(Token {
                    tok: Tok::Number(n),
                    line,
                });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token {
                    tok: Tok::Word(word),
                    line,
                });
            }
            c => {
                return Err(Error::Parse {
                    line,
                    message: format!("unexpected character '{}'", c),
                })
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum RawOperand {
    Local(String),
    Num(i64),
    True,
    False,
    Null,
    Global(String),
}

#[derive(Debug, Clone)]
enum RawInstr {
    Bin(BinOp, RawOperand, RawOperand),
    Cmp(Predicate, RawOperand, RawOperand),
    Cast(CastKind, RawOperand, Type),
    Select(RawOperand, RawOperand, RawOperand),
    Load(Option<Type>, RawOperand),
    Store(RawOperand, RawOperand),
    Gep(RawOperand, Vec<(i64, RawOperand)>),
    Alloca(u64),
    Call(Option<Type>, String, Vec<RawOperand>),
}

#[derive(Debug, Clone)]
enum RawTerm {
    Br(String),
    CondBr(RawOperand, String, String),
    Switch(RawOperand, String, Vec<(i64, String)>),
    Ret(Option<RawOperand>),
    Unreachable,
}

#[derive(Debug, Clone)]
struct RawBlock {
    name: String,
    phis: Vec<(String, Vec<(String, RawOperand)>)>,
    instrs: Vec<(Option<String>, RawInstr, usize)>,
    term: RawTerm,
    line: usize,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(Error::Parse {
            line: self.line(),
            message: message.into(),
        })
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn next(&mut self) -> Result<Tok> {
        match self.tokens.get(self.pos) {
            Some(t) => {
                self.pos += 1;
                Ok(t.tok.clone())
            }
            None => self.err("unexpected end of input"),
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<()> {
        let got = self.next()?;
        if got == tok {
            Ok(())
        } else {
            self.pos -= 1;
            self.err(format!("expected {:?}, found {:?}", tok, got))
        }
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn name(&mut self) -> Result<String> {
        match self.next()? {
            Tok::At(s) | Tok::Word(s) => Ok(s),
            t => {
                self.pos -= 1;
                self.err(format!("expected a name, found {:?}", t))
            }
        }
    }

    fn number(&mut self) -> Result<i64> {
        match self.next()? {
            Tok::Number(n) => Ok(n),
            t => {
                self.pos -= 1;
                self.err(format!("expected a number, found {:?}", t))
            }
        }
    }

    fn type_of_word(word: &str) -> Option<Type> {
        match word {
            "ptr" => Some(Type::Pointer),
            "f32" => Some(Type::Float(32)),
            "f64" => Some(Type::Float(64)),
            _ => {
                let width: u32 = word.strip_prefix('i')?.parse().ok()?;
                if width == 1 {
                    Some(Type::Bool)
                } else if width <= 64 {
                    Some(Type::Int(width))
                } else {
                    None
                }
            }
        }
    }

    fn ty(&mut self) -> Result<Type> {
        match self.next()? {
            Tok::Word(w) => match Self::type_of_word(&w) {
                Some(t) => Ok(t),
                None => {
                    self.pos -= 1;
                    self.err(format!("unknown type '{}'", w))
                }
            },
            t => {
                self.pos -= 1;
                self.err(format!("expected a type, found {:?}", t))
            }
        }
    }

    /// An optional type token, consumed only if the next word names a type.
    fn optional_ty(&mut self) -> Option<Type> {
        let ty = match self.peek() {
            Some(Tok::Word(w)) => Self::type_of_word(w),
            _ => None,
        };
        if ty.is_some() {
            self.pos += 1;
        }
        ty
    }

    fn operand(&mut self) -> Result<RawOperand> {
        match self.next()? {
            Tok::Local(s) => Ok(RawOperand::Local(s)),
            Tok::Number(n) => Ok(RawOperand::Num(n)),
            Tok::At(s) => Ok(RawOperand::Global(s)),
            Tok::Word(w) if w == "true" => Ok(RawOperand::True),
            Tok::Word(w) if w == "false" => Ok(RawOperand::False),
            Tok::Word(w) if w == "null" => Ok(RawOperand::Null),
            t => {
                self.pos -= 1;
                self.err(format!("expected an operand, found {:?}", t))
            }
        }
    }

    fn parse_module(&mut self) -> Result<Module> {
        let mut module = Module::default();
        while let Some(tok) = self.peek() {
            match tok {
                Tok::Word(w) if w == "global" => {
                    self.pos += 1;
                    let name = self.name()?;
                    let size = self.number()?;
                    if size <= 0 {
                        return self.err("global size must be positive");
                    }
                    let init = if self.eat(&Tok::Equals) {
                        match self.next()? {
                            Tok::StringLit(s) => Some(s),
                            _ => {
                                self.pos -= 1;
                                return self.err("expected a string literal");
                            }
                        }
                    } else {
                        None
                    };
                    module.globals.push(Global {
                        name,
                        size: size as u64,
                        init,
                    });
                }
                Tok::Word(w) if w == "declare" => {
                    self.pos += 1;
                    let name = self.name()?;
                    self.expect(Tok::LParen)?;
                    let arity = self.number()?;
                    self.expect(Tok::RParen)?;
                    module.declarations.push(Declaration {
                        name,
                        arity: arity as usize,
                    });
                }
                Tok::Word(w) if w == "define" => {
                    self.pos += 1;
                    let proc = self.parse_define()?;
                    module.procedures.push(proc);
                }
                t => return self.err(format!("expected a top-level item, found {:?}", t)),
            }
        }
        Ok(module)
    }

    fn parse_define(&mut self) -> Result<Procedure> {
        let name = self.name()?;
        self.expect(Tok::LParen)?;
        let mut params: Vec<(String, Type)> = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                let pname = match self.next()? {
                    Tok::Local(s) => s,
                    _ => {
                        self.pos -= 1;
                        return self.err("expected a parameter name");
                    }
                };
                self.expect(Tok::Colon)?;
                let pty = self.ty()?;
                params.push((pname, pty));
                if self.eat(&Tok::RParen) {
                    break;
                }
                self.expect(Tok::Comma)?;
            }
        }
        self.expect(Tok::Arrow)?;
        let ret_ty = self.ty()?;
        self.expect(Tok::LBrace)?;

        let mut raw_blocks = Vec::new();
        while !self.eat(&Tok::RBrace) {
            raw_blocks.push(self.parse_block()?);
        }
        if raw_blocks.is_empty() {
            return self.err(format!("function '{}' has no blocks", name));
        }
        self.resolve(name, params, ret_ty, raw_blocks)
    }

    fn parse_block(&mut self) -> Result<RawBlock> {
        let line = self.line();
        let name = self.name()?;
        self.expect(Tok::Colon)?;
        let mut phis = Vec::new();
        let mut instrs = Vec::new();
        loop {
            let instr_line = self.line();
            match self.peek() {
                Some(Tok::Word(w)) if w == "br" => {
                    self.pos += 1;
                    let first = self.operand_or_label()?;
                    let term = match first {
                        Ok(cond) => {
                            self.expect(Tok::Comma)?;
                            let t = self.name()?;
                            self.expect(Tok::Comma)?;
                            let e = self.name()?;
                            RawTerm::CondBr(cond, t, e)
                        }
                        Err(label) => RawTerm::Br(label),
                    };
                    return Ok(RawBlock {
                        name,
                        phis,
                        instrs,
                        term,
                        line,
                    });
                }
                Some(Tok::Word(w)) if w == "switch" => {
                    self.pos += 1;
                    let cond = self.operand()?;
                    self.expect(Tok::Comma)?;
                    let default = self.name()?;
                    self.expect(Tok::LBracket)?;
                    let mut cases = Vec::new();
                    if !self.eat(&Tok::RBracket) {
                        loop {
                            let val = self.number()?;
                            self.expect(Tok::Colon)?;
                            let target = self.name()?;
                            cases.push((val, target));
                            if self.eat(&Tok::RBracket) {
                                break;
                            }
                            self.expect(Tok::Comma)?;
                        }
                    }
                    return Ok(RawBlock {
                        name,
                        phis,
                        instrs,
                        term: RawTerm::Switch(cond, default, cases),
                        line,
                    });
                }
                Some(Tok::Word(w)) if w == "ret" => {
                    self.pos += 1;
                    let value = match self.peek() {
                        Some(Tok::Local(_)) | Some(Tok::Number(_)) | Some(Tok::At(_)) => {
                            Some(self.operand()?)
                        }
                        Some(Tok::Word(w)) if w == "true" || w == "false" || w == "null" => {
                            Some(self.operand()?)
                        }
                        _ => None,
                    };
                    return Ok(RawBlock {
                        name,
                        phis,
                        instrs,
                        term: RawTerm::Ret(value),
                        line,
                    });
                }
                Some(Tok::Word(w)) if w == "unreachable" => {
                    self.pos += 1;
                    return Ok(RawBlock {
                        name,
                        phis,
                        instrs,
                        term: RawTerm::Unreachable,
                        line,
                    });
                }
                Some(Tok::Word(w)) if w == "store" => {
                    self.pos += 1;
                    let value = self.operand()?;
                    self.expect(Tok::Comma)?;
                    let addr = self.operand()?;
                    instrs.push((None, RawInstr::Store(value, addr), instr_line));
                }
                Some(Tok::Word(w)) if w == "call" => {
                    self.pos += 1;
                    let (ty, callee, args) = self.parse_call()?;
                    instrs.push((None, RawInstr::Call(ty, callee, args), instr_line));
                }
                Some(Tok::Local(_)) => {
                    let result = match self.next()? {
                        Tok::Local(s) => s,
                        _ => unreachable!(),
                    };
                    self.expect(Tok::Equals)?;
                    match self.next()? {
                        Tok::Word(op) if op == "phi" => {
                            let mut incoming = Vec::new();
                            loop {
                                self.expect(Tok::LBracket)?;
                                let label = self.name()?;
                                self.expect(Tok::Colon)?;
                                let val = self.operand()?;
                                self.expect(Tok::RBracket)?;
                                incoming.push((label, val));
                                if !self.eat(&Tok::Comma) {
                                    break;
                                }
                            }
                            phis.push((result, incoming));
                        }
                        Tok::Word(op) => {
                            let instr = self.parse_instr(&op)?;
                            instrs.push((Some(result), instr, instr_line));
                        }
                        t => {
                            self.pos -= 1;
                            return self.err(format!("expected an opcode, found {:?}", t));
                        }
                    }
                }
                _ => return self.err("expected an instruction or terminator"),
            }
        }
    }

    /// Either an operand (for a conditional branch) or a bare label.
    #[allow(clippy::type_complexity)]
    fn operand_or_label(&mut self) -> Result<std::result::Result<RawOperand, String>> {
        match self.next()? {
            Tok::Local(s) => Ok(Ok(RawOperand::Local(s))),
            Tok::Word(w) if w == "true" => Ok(Ok(RawOperand::True)),
            Tok::Word(w) if w == "false" => Ok(Ok(RawOperand::False)),
            Tok::Word(w) => Ok(Err(w)),
            Tok::At(w) => Ok(Err(w)),
            t => {
                self.pos -= 1;
                self.err(format!("expected a condition or label, found {:?}", t))
            }
        }
    }

    fn parse_call(&mut self) -> Result<(Option<Type>, String, Vec<RawOperand>)> {
        let ty = self.optional_ty();
        let callee = self.name()?;
        self.expect(Tok::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                args.push(self.operand()?);
                if self.eat(&Tok::RParen) {
                    break;
                }
                self.expect(Tok::Comma)?;
            }
        }
        Ok((ty, callee, args))
    }

    fn parse_instr(&mut self, op: &str) -> Result<RawInstr> {
        let bin = |p: &mut Self, op: BinOp| -> Result<RawInstr> {
            let lhs = p.operand()?;
            p.expect(Tok::Comma)?;
            let rhs = p.operand()?;
            Ok(RawInstr::Bin(op, lhs, rhs))
        };
        match op {
            "add" => bin(self, BinOp::Add),
            "sub" => bin(self, BinOp::Sub),
            "mul" => bin(self, BinOp::Mul),
            "sdiv" => bin(self, BinOp::SDiv),
            "udiv" => bin(self, BinOp::UDiv),
            "srem" => bin(self, BinOp::SRem),
            "urem" => bin(self, BinOp::URem),
            "shl" => bin(self, BinOp::Shl),
            "lshr" => bin(self, BinOp::LShr),
            "ashr" => bin(self, BinOp::AShr),
            "and" => bin(self, BinOp::And),
            "or" => bin(self, BinOp::Or),
            "xor" => bin(self, BinOp::Xor),
            "icmp" => {
                let pred = match self.name()?.as_str() {
                    "eq" => Predicate::Eq,
                    "ne" => Predicate::Ne,
                    "slt" => Predicate::Slt,
                    "sle" => Predicate::Sle,
                    "sgt" => Predicate::Sgt,
                    "sge" => Predicate::Sge,
                    "ult" => Predicate::Ult,
                    "ule" => Predicate::Ule,
                    "ugt" => Predicate::Ugt,
                    "uge" => Predicate::Uge,
                    p => return self.err(format!("unknown predicate '{}'", p)),
                };
                let lhs = self.operand()?;
                self.expect(Tok::Comma)?;
                let rhs = self.operand()?;
                Ok(RawInstr::Cmp(pred, lhs, rhs))
            }
            "zext" | "sext" | "trunc" | "ptrtoint" | "inttoptr" => {
                let kind = match op {
                    "zext" => CastKind::ZExt,
                    "sext" => CastKind::SExt,
                    "trunc" => CastKind::Trunc,
                    "ptrtoint" => CastKind::PtrToInt,
                    _ => CastKind::IntToPtr,
                };
                let value = self.operand()?;
                match self.next()? {
                    Tok::Word(w) if w == "to" => {}
                    _ => {
                        self.pos -= 1;
                        return self.err("expected 'to' in cast");
                    }
                }
                let ty = self.ty()?;
                Ok(RawInstr::Cast(kind, value, ty))
            }
            "select" => {
                let cond = self.operand()?;
                self.expect(Tok::Comma)?;
                let t = self.operand()?;
                self.expect(Tok::Comma)?;
                let e = self.operand()?;
                Ok(RawInstr::Select(cond, t, e))
            }
            "load" => {
                let ty = self.optional_ty();
                let addr = self.operand()?;
                Ok(RawInstr::Load(ty, addr))
            }
            "gep" => {
                let base = self.operand()?;
                let mut offsets = Vec::new();
                while self.eat(&Tok::Comma) {
                    let scale = self.number()?;
                    match self.next()? {
                        Tok::Word(w) if w == "x" => {}
                        _ => {
                            self.pos -= 1;
                            return self.err("expected 'x' in gep offset");
                        }
                    }
                    let idx = self.operand()?;
                    offsets.push((scale, idx));
                }
                Ok(RawInstr::Gep(base, offsets))
            }
            "alloca" => {
                let cells = self.number()?;
                if cells <= 0 {
                    return self.err("alloca size must be positive");
                }
                Ok(RawInstr::Alloca(cells as u64))
            }
            "call" => {
                let (ty, callee, args) = self.parse_call()?;
                Ok(RawInstr::Call(ty, callee, args))
            }
            other => self.err(format!("unknown opcode '{}'", other)),
        }
    }

    fn resolve(
        &self,
        name: String,
        params: Vec<(String, Type)>,
        ret_ty: Type,
        raw_blocks: Vec<RawBlock>,
    ) -> Result<Procedure> {
        let mut proc = Procedure {
            name,
            params: Vec::new(),
            ret_ty,
            blocks: Vec::new(),
            values: Vec::new(),
            entry: BlockId(0),
        };

        let mut block_ids: HashMap<String, BlockId> = HashMap::new();
        for (i, rb) in raw_blocks.iter().enumerate() {
            if block_ids.insert(rb.name.clone(), BlockId(i as u32)).is_some() {
                return Err(Error::Parse {
                    line: rb.line,
                    message: format!("duplicate block label '{}'", rb.name),
                });
            }
        }

        let mut value_ids: HashMap<String, ValueId> = HashMap::new();
        for (i, (pname, pty)) in params.iter().enumerate() {
            let id = proc.push_value(pname.clone(), pty.clone(), ValueKind::Argument { index: i });
            value_ids.insert(pname.clone(), id);
            proc.params.push(id);
        }
        // Pre-register every result so phis may reference forward.
        for (bi, rb) in raw_blocks.iter().enumerate() {
            let block = BlockId(bi as u32);
            for (rname, _) in &rb.phis {
                let id =
                    proc.push_value(rname.clone(), Type::Int(32), ValueKind::Instruction { block });
                if value_ids.insert(rname.clone(), id).is_some() {
                    return Err(Error::Parse {
                        line: rb.line,
                        message: format!("duplicate value name '%{}'", rname),
                    });
                }
            }
            for (result, _, iline) in &rb.instrs {
                if let Some(rname) = result {
                    let id = proc.push_value(
                        rname.clone(),
                        Type::Int(32),
                        ValueKind::Instruction { block },
                    );
                    if value_ids.insert(rname.clone(), id).is_some() {
                        return Err(Error::Parse {
                            line: *iline,
                            message: format!("duplicate value name '%{}'", rname),
                        });
                    }
                }
            }
        }

        let lookup_block = |label: &str, line: usize| -> Result<BlockId> {
            block_ids.get(label).copied().ok_or_else(|| Error::Parse {
                line,
                message: format!("unknown block label '{}'", label),
            })
        };
        let lookup_operand = |raw: &RawOperand, line: usize| -> Result<Operand> {
            Ok(match raw {
                RawOperand::Local(n) => {
                    Operand::Value(*value_ids.get(n).ok_or_else(|| Error::Parse {
                        line,
                        message: format!("unknown value '%{}'", n),
                    })?)
                }
                RawOperand::Num(v) => Operand::Const(Constant::Int {
                    value: *v,
                    ty: Type::Int(32),
                }),
                RawOperand::True => Operand::Const(Constant::Bool(true)),
                RawOperand::False => Operand::Const(Constant::Bool(false)),
                RawOperand::Null => Operand::Const(Constant::Null),
                RawOperand::Global(n) => Operand::Global(n.clone()),
            })
        };

        for rb in &raw_blocks {
            let mut phis = Vec::new();
            for (rname, incoming) in &rb.phis {
                let result = value_ids[rname];
                let mut inc = Vec::new();
                for (label, raw) in incoming {
                    inc.push((lookup_block(label, rb.line)?, lookup_operand(raw, rb.line)?));
                }
                phis.push(Phi {
                    result,
                    incoming: inc,
                });
            }
            let mut instrs = Vec::new();
            for (result, raw, iline) in &rb.instrs {
                let result = result.as_ref().map(|n| value_ids[n]);
                let op = match raw {
                    RawInstr::Bin(op, a, b) => InstrOp::Binary {
                        op: *op,
                        lhs: lookup_operand(a, *iline)?,
                        rhs: lookup_operand(b, *iline)?,
                    },
                    RawInstr::Cmp(pred, a, b) => InstrOp::Cmp {
                        pred: *pred,
                        lhs: lookup_operand(a, *iline)?,
                        rhs: lookup_operand(b, *iline)?,
                    },
                    RawInstr::Cast(kind, v, ty) => {
                        if let Some(id) = result {
                            proc.values[id.0 as usize].ty = ty.clone();
                        }
                        InstrOp::Cast {
                            kind: *kind,
                            value: lookup_operand(v, *iline)?,
                        }
                    }
                    RawInstr::Select(c, t, e) => InstrOp::Select {
                        cond: lookup_operand(c, *iline)?,
                        then_value: lookup_operand(t, *iline)?,
                        else_value: lookup_operand(e, *iline)?,
                    },
                    RawInstr::Load(ty, addr) => {
                        if let (Some(id), Some(ty)) = (result, ty) {
                            proc.values[id.0 as usize].ty = ty.clone();
                        }
                        InstrOp::Load {
                            addr: lookup_operand(addr, *iline)?,
                            stack: false,
                        }
                    }
                    RawInstr::Store(v, addr) => InstrOp::Store {
                        addr: lookup_operand(addr, *iline)?,
                        value: lookup_operand(v, *iline)?,
                        stack: false,
                    },
                    RawInstr::Gep(base, offsets) => {
                        if let Some(id) = result {
                            proc.values[id.0 as usize].ty = Type::Pointer;
                        }
                        let mut offs = Vec::new();
                        for (scale, idx) in offsets {
                            offs.push((*scale, lookup_operand(idx, *iline)?));
                        }
                        InstrOp::Gep {
                            base: lookup_operand(base, *iline)?,
                            offsets: offs,
                        }
                    }
                    RawInstr::Alloca(cells) => {
                        if let Some(id) = result {
                            proc.values[id.0 as usize].ty = Type::Pointer;
                        }
                        InstrOp::Alloca { cells: *cells }
                    }
                    RawInstr::Call(ty, callee, args) => {
                        if let (Some(id), Some(ty)) = (result, ty) {
                            proc.values[id.0 as usize].ty = ty.clone();
                        }
                        let mut resolved = Vec::new();
                        for a in args {
                            resolved.push(lookup_operand(a, *iline)?);
                        }
                        InstrOp::Call {
                            callee: callee.clone(),
                            args: resolved,
                        }
                    }
                };
                if let (Some(id), InstrOp::Cmp { .. }) = (result, &op) {
                    proc.values[id.0 as usize].ty = Type::Bool;
                }
                instrs.push(Instr { result, op });
            }
            let term = match &rb.term {
                RawTerm::Br(label) => Terminator::Br {
                    target: lookup_block(label, rb.line)?,
                },
                RawTerm::CondBr(cond, t, e) => Terminator::CondBr {
                    cond: lookup_operand(cond, rb.line)?,
                    then_block: lookup_block(t, rb.line)?,
                    else_block: lookup_block(e, rb.line)?,
                },
                RawTerm::Switch(cond, default, cases) => {
                    let mut cs = Vec::new();
                    for (val, label) in cases {
                        cs.push((*val, lookup_block(label, rb.line)?));
                    }
                    Terminator::Switch {
                        cond: lookup_operand(cond, rb.line)?,
                        cases: cs,
                        default: lookup_block(default, rb.line)?,
                    }
                }
                RawTerm::Ret(value) => Terminator::Ret {
                    value: match value {
                        Some(raw) => Some(lookup_operand(raw, rb.line)?),
                        None => None,
                    },
                },
                RawTerm::Unreachable => Terminator::Unreachable,
            };
            proc.blocks.push(Block {
                name: rb.name.clone(),
                phis,
                instrs,
                term,
            });
        }

        propagate_types(&mut proc);
        Ok(proc)
    }
}

/// Fill in result types that the syntax leaves implicit: binary operations,
/// selects and phis take the type of their first typed operand. A few
/// passes reach a fixpoint on any realistic input.
fn propagate_types(proc: &mut Procedure) {
    for _ in 0..3 {
        let mut updates: Vec<(ValueId, Type)> = Vec::new();
        for block in &proc.blocks {
            for phi in &block.phis {
                if let Some(ty) = phi
                    .incoming
                    .iter()
                    .find_map(|(_, op)| operand_type(proc, op))
                {
                    updates.push((phi.result, ty));
                }
            }
            for instr in &block.instrs {
                let result = match instr.result {
                    Some(r) => r,
                    None => continue,
                };
                let ty = match &instr.op {
                    InstrOp::Binary { lhs, rhs, .. } => {
                        operand_type(proc, lhs).or_else(|| operand_type(proc, rhs))
                    }
                    InstrOp::Select {
                        then_value,
                        else_value,
                        ..
                    } => operand_type(proc, then_value).or_else(|| operand_type(proc, else_value)),
                    _ => None,
                };
                if let Some(ty) = ty {
                    updates.push((result, ty));
                }
            }
        }
        let mut changed = false;
        for (id, ty) in updates {
            if proc.values[id.0 as usize].ty != ty {
                proc.values[id.0 as usize].ty = ty;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn operand_type(proc: &Procedure, op: &Operand) -> Option<Type> {
    match op {
        Operand::Value(id) => Some(proc.value(*id).ty.clone()),
        Operand::Global(_) => Some(Type::Pointer),
        Operand::Const(Constant::Bool(_)) => Some(Type::Bool),
        Operand::Const(_) => None,
    }
}

/// Parse a translation unit from source text.
pub fn parse_module(source: &str) -> Result<Module> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse_module()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity() {
        let m = parse_module("define @f(%x: i32) -> i32 {\nentry:\n  ret %x\n}").unwrap();
        assert_eq!(m.procedures.len(), 1);
        let f = &m.procedures[0];
        assert_eq!(f.name, "f");
        assert_eq!(f.params.len(), 1);
        assert_eq!(f.blocks.len(), 1);
    }

    #[test]
    fn parses_loop_with_phi() {
        let src = "
define @sum(%n: i32) -> i32 {
entry:
  br loop
loop:
  %i = phi [entry: 0], [loop: %i1]
  %s = phi [entry: 0], [loop: %s1]
  %m = call @__mark(1)
  %c = icmp sle %i, %n
  %g = and %m, %c
  br %g, body, done
body:
  %i1 = add %i, 1
  %s1 = add %s, %i
  br loop
done:
  ret %s
}";
        let m = parse_module(src).unwrap();
        let f = &m.procedures[0];
        assert_eq!(f.blocks.len(), 4);
        assert_eq!(f.block(BlockId(1)).phis.len(), 2);
        // %i picks up the i32 type from %i1 through the phi.
        let i = f
            .values
            .iter()
            .find(|v| v.name == "i")
            .expect("value named i");
        assert_eq!(i.ty, Type::Int(32));
    }

    #[test]
    fn parses_globals_and_declares() {
        let src = "global @tab 256\nglobal @msg 6 = \"hello\"\ndeclare @g(2)\n";
        let m = parse_module(src).unwrap();
        assert_eq!(m.globals.len(), 2);
        assert_eq!(m.globals[1].init.as_deref(), Some("hello"));
        assert_eq!(m.declarations[0].arity, 2);
    }

    #[test]
    fn rejects_unknown_label() {
        let err =
            parse_module("define @f(%x: i32) -> i32 {\nentry:\n  br nowhere\n}").unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn skips_annotation_comments() {
        let src =
            "/*@ rel_in default ((= x$1 x$2)) @*/\ndefine @f(%x: i32) -> i32 {\nentry:\n  ret %x\n}";
        assert!(parse_module(src).is_ok());
    }
}
