//! Lexical analysis for assembler source lines
//!
//! The source language is line-oriented; operands are recognised with
//! compiled regexes rather than a token stream. This module covers the
//! shared operand forms: size suffixes, registers, immediates (with equate
//! lookup), label references, bracketed indirect operands and jump targets.

mod paren;

pub use paren::{parse_string, Sexp};

use crate::error::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Immediate values are carried wide enough to range-check every field width
pub type Imm = i128;

/// Process-scoped equate table, shared by every section assembler
pub type Equates = HashMap<String, Imm>;

lazy_static! {
    static ref SIZE_RE: Regex = Regex::new(r"\.([bwlq])$").unwrap();
    static ref OCTAL_RE: Regex = Regex::new(r"^0\d+$").unwrap();
    static ref DECIMAL_RE: Regex = Regex::new(r"^\d+$").unwrap();
    static ref HEX_RE: Regex = Regex::new(r"^0x[0-9a-fA-F]+$").unwrap();
    static ref REGISTER_RE: Regex = Regex::new(r"^(?:r(\d+)|(fp))$").unwrap();
    static ref LABEL_RE: Regex = Regex::new(r"^[A-Za-z_]\w*$").unwrap();
    static ref LABEL_DEF_RE: Regex = Regex::new(r"^([A-Za-z_]\w*):$").unwrap();
}

/// Operand width suffix: `.b`, `.w`, `.l` or `.q` (8/16/32/64 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Size {
    /// Byte (8 bits)
    B,
    /// Half word (16 bits)
    W,
    /// Word (32 bits)
    L,
    /// Double word (64 bits)
    Q,
}

impl Size {
    /// Recognise a suffix letter
    pub fn from_suffix(c: char) -> Option<Size> {
        match c {
            'b' => Some(Size::B),
            'w' => Some(Size::W),
            'l' => Some(Size::L),
            'q' => Some(Size::Q),
            _ => None,
        }
    }

    /// The two-bit size field of the opcode byte
    pub fn code(self) -> u8 {
        match self {
            Size::L => 0x00,
            Size::W => 0x08,
            Size::B => 0x10,
            Size::Q => 0x18,
        }
    }

    /// The suffix letter, for error messages
    pub fn suffix(self) -> char {
        match self {
            Size::B => 'b',
            Size::W => 'w',
            Size::L => 'l',
            Size::Q => 'q',
        }
    }

    /// Width in bits
    pub fn bits(self) -> u32 {
        match self {
            Size::B => 8,
            Size::W => 16,
            Size::L => 32,
            Size::Q => 64,
        }
    }
}

/// The direct part of an operand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Direct {
    /// A register, r0..r10
    Reg(u8),
    /// A numeric immediate
    Imm(Imm),
    /// A symbolic reference, resolved later
    Sym(String),
}

/// A fully lexed operand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    /// Size suffix, if the outermost position carried one
    pub size: Option<Size>,
    /// Register, immediate or symbol
    pub direct: Direct,
    /// Signed displacement inside brackets
    pub disp: Option<Imm>,
    /// Whether the operand was bracketed
    pub indirect: bool,
}

impl Operand {
    fn direct_form(size: Option<Size>, direct: Direct) -> Operand {
        Operand {
            size,
            direct,
            disp: None,
            indirect: false,
        }
    }

    /// The register number, if the direct part is a register
    pub fn reg(&self) -> Option<u8> {
        match self.direct {
            Direct::Reg(r) => Some(r),
            _ => None,
        }
    }
}

/// Target of a jump or pseudo-call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JumpTarget {
    /// A signed pc-relative offset, written `+n` or `-n`
    Off(Imm),
    /// A label, resolved at `resolve_symbols`
    Label(String),
}

/// Parse an immediate: C-style octal, decimal or hex, optionally negated,
/// or a known equate. Immediates never bear a unary `+`.
pub fn parse_immediate(text: &str, equates: &Equates) -> Result<Imm> {
    let (neg, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = if OCTAL_RE.is_match(body) {
        Imm::from_str_radix(body, 8).map_err(|_| Error::BadImmediate(text.to_string()))?
    } else if DECIMAL_RE.is_match(body) {
        body.parse::<Imm>()
            .map_err(|_| Error::BadImmediate(text.to_string()))?
    } else if HEX_RE.is_match(body) {
        Imm::from_str_radix(&body[2..], 16).map_err(|_| Error::BadImmediate(text.to_string()))?
    } else if let Some(v) = equates.get(body) {
        *v
    } else {
        return Err(Error::BadImmediate(text.to_string()));
    };
    Ok(if neg { -value } else { value })
}

/// Strip a trailing size suffix, returning the remainder and the size
fn split_size(text: &str) -> (&str, Option<Size>) {
    if let Some(cap) = SIZE_RE.captures(text) {
        let letter = cap.get(1).unwrap().as_str().chars().next().unwrap();
        (&text[..text.len() - 2], Size::from_suffix(letter))
    } else {
        (text, None)
    }
}

/// Parse a direct operand: register, immediate or label reference,
/// optionally size-suffixed.
pub fn parse_direct_operand(text: &str, equates: &Equates) -> Result<Operand> {
    let (body, size) = split_size(text);
    if let Some(cap) = REGISTER_RE.captures(body) {
        let reg = if cap.get(2).is_some() {
            10
        } else {
            let n: u32 = cap
                .get(1)
                .unwrap()
                .as_str()
                .parse()
                .map_err(|_| Error::BadRegister(body.to_string()))?;
            if n > 10 {
                return Err(Error::BadRegister(body.to_string()));
            }
            n as u8
        };
        return Ok(Operand::direct_form(size, Direct::Reg(reg)));
    }
    if let Ok(imm) = parse_immediate(body, equates) {
        return Ok(Operand::direct_form(size, Direct::Imm(imm)));
    }
    if LABEL_RE.is_match(body) {
        return Ok(Operand::direct_form(size, Direct::Sym(body.to_string())));
    }
    Err(Error::BadDirectOperand(text.to_string()))
}

/// Parse the inside of a bracketed operand: a direct operand with an
/// optional `+imm`/`-imm` displacement. The base may not carry a size.
fn parse_offset_operand(text: &str, equates: &Equates) -> Result<Operand> {
    if let Some(pos) = text.find('+') {
        let (base, disp) = (&text[..pos], &text[pos + 1..]);
        let mut d = parse_direct_operand(base, equates)?;
        if d.size.is_some() {
            return Err(Error::BadSizeInOffsetOperand(base.to_string()));
        }
        d.disp = Some(parse_immediate(disp, equates)?);
        return Ok(d);
    }
    // A leading '-' belongs to an immediate base, not a displacement
    if let Some(pos) = text.get(1..).and_then(|t| t.find('-')) {
        let pos = pos + 1;
        let (base, disp) = (&text[..pos], &text[pos + 1..]);
        let mut d = parse_direct_operand(base, equates)?;
        if d.size.is_some() {
            return Err(Error::BadSizeInOffsetOperand(base.to_string()));
        }
        d.disp = Some(-parse_immediate(disp, equates)?);
        return Ok(d);
    }
    let d = parse_direct_operand(text, equates)?;
    if d.size.is_some() {
        return Err(Error::BadSizeInIndirectOperand(text.to_string()));
    }
    Ok(d)
}

/// Parse a full operand: direct, `[direct]`, `[direct±imm]` or `[imm]`.
/// Only the outermost position may carry a size suffix.
pub fn parse_operand(text: &str, equates: &Equates) -> Result<Operand> {
    if let Some(rest) = text.strip_prefix('[') {
        let (body, size) = split_size(rest);
        let inner = body
            .strip_suffix(']')
            .ok_or_else(|| Error::BadIndirectOperand(text.to_string()))?;
        let mut d = parse_offset_operand(inner, equates)?;
        d.size = size;
        d.indirect = true;
        return Ok(d);
    }
    parse_direct_operand(text, equates)
}

/// Parse a jump target: `+imm`, `-imm` or a label. A bare numeric literal
/// is rejected to avoid the off-by-one trap.
pub fn parse_jump_target(text: &str, equates: &Equates) -> Result<JumpTarget> {
    if let Some(rest) = text.strip_prefix('+') {
        return Ok(JumpTarget::Off(parse_immediate(rest, equates)?));
    }
    if let Some(rest) = text.strip_prefix('-') {
        return Ok(JumpTarget::Off(-parse_immediate(rest, equates)?));
    }
    if parse_immediate(text, equates).is_ok() {
        return Err(Error::BadJumpOffsetSign(text.to_string()));
    }
    if LABEL_RE.is_match(text) {
        return Ok(JumpTarget::Label(text.to_string()));
    }
    Err(Error::BadJumpOffset(text.to_string()))
}

/// Split a line into its leading op and the argument remainder
pub fn split_op_args(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim_start()),
        None => (line, ""),
    }
}

/// Split a comma-separated argument list, trimming each piece
pub fn split_args(rest: &str) -> Vec<String> {
    if rest.trim().is_empty() {
        return Vec::new();
    }
    rest.split(',').map(|a| a.trim().to_string()).collect()
}

/// Recognise a `LABEL:` line, returning the label name
pub fn label_def(line: &str) -> Option<&str> {
    LABEL_DEF_RE
        .captures(line)
        .map(|cap| cap.get(1).unwrap().as_str())
}
