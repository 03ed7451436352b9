//! Program-section assembler
//!
//! Each line parses into a semantic record, which lowers to one or two
//! encoded 8-byte slots. Label references are encoded with a `-1`
//! placeholder so that resolution is additive: the final field value is
//! `-1 + (label_index - insn_index)`, the canonical pc-relative offset.

use crate::asm::insn::{self, check_s16, check_s32, check_u64, jump_cond, Insn};
use crate::error::{Error, Result};
use crate::lexer::{
    self, parse_direct_operand, parse_immediate, parse_jump_target, parse_operand, Direct, Equates,
    Imm, JumpTarget, Operand, Size,
};

/// An unresolved imm-field reference
#[derive(Debug, Clone, PartialEq)]
pub enum ImmRef {
    /// External symbol; survives as a relocation for the linker
    Sym(String),
    /// Local call target; patched and dropped at `resolve_symbols`
    PseudoCall(String),
}

/// One encoded slot plus its unresolved references
struct Slot {
    insn: Insn,
    off_sym: Option<String>,
    imm_ref: Option<ImmRef>,
}

impl Slot {
    fn plain(insn: Insn) -> Slot {
        Slot {
            insn,
            off_sym: None,
            imm_ref: None,
        }
    }
}

/// Semantic record for one parsed instruction
#[derive(Debug, Clone)]
enum Parsed {
    Ld {
        dst: Operand,
        src: Operand,
    },
    Ldpkt {
        dst: Operand,
        src: Operand,
    },
    Alu {
        code: u8,
        name: String,
        dst: Operand,
        src: Operand,
    },
    Neg {
        dst: Operand,
    },
    End {
        big: bool,
        dst: Operand,
    },
    Ja {
        off: JumpTarget,
    },
    Jcc {
        cond: u8,
        dst: Operand,
        src: Operand,
        off: JumpTarget,
    },
    CallHelper {
        func: Imm,
    },
    CallPseudo {
        target: JumpTarget,
    },
    Exit,
    Xadd {
        dst: Operand,
        src: Operand,
    },
}

/// Assembler for one program section
#[derive(Debug, Default)]
pub struct ProgAssembler {
    insns: Vec<[u8; 8]>,
    labels: Vec<(String, usize)>,
    off_refs: Vec<(usize, String)>,
    imm_refs: Vec<(usize, ImmRef)>,
}

impl ProgAssembler {
    /// Create an empty program section
    pub fn new() -> ProgAssembler {
        ProgAssembler::default()
    }

    /// Number of instruction slots so far
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    /// Whether no instructions have been assembled yet
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// The encoded section bytes
    pub fn binary(&self) -> Vec<u8> {
        self.insns.concat()
    }

    /// Labels with their byte offsets, in definition order
    pub fn symbols(&self) -> Vec<(String, u64)> {
        self.labels
            .iter()
            .map(|(name, idx)| (name.clone(), (*idx as u64) * 8))
            .collect()
    }

    /// Remaining external imm-field references, by instruction index.
    /// Pseudo-call entries have been resolved away by `resolve_symbols`.
    pub fn relocs(&self) -> Vec<(usize, String)> {
        self.imm_refs
            .iter()
            .map(|(idx, r)| match r {
                ImmRef::Sym(s) | ImmRef::PseudoCall(s) => (*idx, s.clone()),
            })
            .collect()
    }

    fn label_index(&self, name: &str) -> Option<usize> {
        self.labels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, i)| *i)
    }

    /// Ingest one trimmed source line: a label definition or an instruction
    pub fn feed_line(&mut self, line: &str, equates: &Equates) -> Result<()> {
        if let Some(name) = lexer::label_def(line) {
            if self.label_index(name).is_some() {
                return Err(Error::DuplicateLabel(name.to_string()));
            }
            self.labels.push((name.to_string(), self.insns.len()));
            return Ok(());
        }
        let parsed = self.parse_line(line, equates)?;
        let slots = lower(parsed, line)?;
        for slot in slots {
            let index = self.insns.len();
            if let Some(sym) = slot.off_sym {
                self.off_refs.push((index, sym));
            }
            if let Some(r) = slot.imm_ref {
                self.imm_refs.push((index, r));
            }
            self.insns.push(slot.insn.encode());
        }
        Ok(())
    }

    fn parse_line(&self, line: &str, equates: &Equates) -> Result<Parsed> {
        let (op, rest) = lexer::split_op_args(line);
        let args = lexer::split_args(rest);
        match op {
            "ld" => {
                if args.len() != 2 {
                    return Err(Error::arity("ld", "2 args", &args));
                }
                Ok(Parsed::Ld {
                    dst: parse_operand(&args[0], equates)?,
                    src: parse_operand(&args[1], equates)?,
                })
            }
            "ldpkt" => {
                if args.len() != 2 {
                    return Err(Error::arity("ldpkt", "2 args", &args));
                }
                let dst = parse_direct_operand(&args[0], equates)?;
                if dst.reg().is_none() {
                    return Err(Error::LdpktDstNotReg(args[0].clone()));
                }
                let src = parse_operand(&args[1], equates)?;
                if !src.indirect {
                    return Err(Error::LdpktSrcNotIndirect(args[1].clone()));
                }
                Ok(Parsed::Ldpkt { dst, src })
            }
            "add" | "sub" | "mul" | "div" | "or" | "and" | "lsh" | "rsh" | "mod" | "xor"
            | "arsh" => {
                if args.len() != 2 {
                    return Err(Error::arity(op, "2 args", &args));
                }
                let code = match op {
                    "add" => insn::alu::ADD,
                    "sub" => insn::alu::SUB,
                    "mul" => insn::alu::MUL,
                    "div" => insn::alu::DIV,
                    "or" => insn::alu::OR,
                    "and" => insn::alu::AND,
                    "lsh" => insn::alu::LSH,
                    "rsh" => insn::alu::RSH,
                    "mod" => insn::alu::MOD,
                    "xor" => insn::alu::XOR,
                    "arsh" => insn::alu::ARSH,
                    _ => unreachable!(),
                };
                Ok(Parsed::Alu {
                    code,
                    name: op.to_string(),
                    dst: parse_direct_operand(&args[0], equates)?,
                    src: parse_direct_operand(&args[1], equates)?,
                })
            }
            "neg" => {
                if args.len() != 1 {
                    return Err(Error::arity("neg", "1 arg", &args));
                }
                Ok(Parsed::Neg {
                    dst: parse_direct_operand(&args[0], equates)?,
                })
            }
            "end" => {
                if args.len() != 2 {
                    return Err(Error::arity("end", "2 args", &args));
                }
                let big = match args[0].as_str() {
                    "le" => false,
                    "be" => true,
                    _ => return Err(Error::BadEndDirection(format!("{:?}", args))),
                };
                Ok(Parsed::End {
                    big,
                    dst: parse_direct_operand(&args[1], equates)?,
                })
            }
            "jr" => match args.len() {
                1 => Ok(Parsed::Ja {
                    off: parse_jump_target(&args[0], equates)?,
                }),
                4 => {
                    let cond = jump_cond(&args[0])
                        .ok_or_else(|| Error::BadJumpOp(args[0].clone()))?;
                    let dst = parse_direct_operand(&args[1], equates)?;
                    if dst.size.is_some() {
                        return Err(Error::BadSizeInJumpDst(args[1].clone()));
                    }
                    let src = parse_direct_operand(&args[2], equates)?;
                    if src.size.is_some() {
                        return Err(Error::BadSizeInJumpSrc(args[2].clone()));
                    }
                    Ok(Parsed::Jcc {
                        cond,
                        dst,
                        src,
                        off: parse_jump_target(&args[3], equates)?,
                    })
                }
                _ => Err(Error::arity("jr", "1 or 4 args", &args)),
            },
            "call" => {
                if args.len() != 1 {
                    return Err(Error::arity("call", "1 arg", &args));
                }
                if let Ok(func) = parse_immediate(&args[0], equates) {
                    return Ok(Parsed::CallHelper { func });
                }
                match parse_jump_target(&args[0], equates) {
                    Ok(target) => Ok(Parsed::CallPseudo { target }),
                    Err(_) => Err(Error::BadCall(args[0].clone())),
                }
            }
            "exit" => {
                if !args.is_empty() {
                    return Err(Error::arity("exit", "no args", &args));
                }
                Ok(Parsed::Exit)
            }
            "xadd" => {
                if args.len() != 2 {
                    return Err(Error::arity("xadd", "2 args", &args));
                }
                Ok(Parsed::Xadd {
                    dst: parse_operand(&args[0], equates)?,
                    src: parse_direct_operand(&args[1], equates)?,
                })
            }
            _ => Err(Error::UnrecognisedInstruction(line.to_string())),
        }
    }

    /// Finalize intra-section references. Off-field label refs must resolve
    /// locally; pseudo-call imm refs are patched and dropped from the
    /// relocation set; any other imm refs stay for the linker.
    pub fn resolve_symbols(&mut self) -> Result<()> {
        for (index, sym) in std::mem::take(&mut self.off_refs) {
            let target = self
                .label_index(&sym)
                .ok_or_else(|| Error::UndefinedSymbol(sym.clone()))?;
            let mut insn = Insn::decode(&self.insns[index]);
            let off = insn.off as Imm + (target as Imm - index as Imm);
            insn.off = check_s16(off)?;
            self.insns[index] = insn.encode();
        }
        let mut remaining = Vec::new();
        for (index, imm_ref) in std::mem::take(&mut self.imm_refs) {
            let sym = match imm_ref {
                ImmRef::Sym(_) => {
                    remaining.push((index, imm_ref));
                    continue;
                }
                ImmRef::PseudoCall(sym) => sym,
            };
            let target = self
                .label_index(&sym)
                .ok_or_else(|| Error::UndefinedSymbol(sym.clone()))?;
            let mut insn = Insn::decode(&self.insns[index]);
            let imm = insn.imm as Imm + (target as Imm - index as Imm);
            insn.imm = check_s32(imm)?;
            self.insns[index] = insn.encode();
        }
        self.imm_refs = remaining;
        Ok(())
    }
}

/// The size shared by a two-operand form: at most one explicit suffix, or
/// two matching ones.
fn merged_size(dst: &Operand, src: &Operand, line: &str) -> Result<Option<Size>> {
    if let (Some(d), Some(s)) = (dst.size, src.size) {
        if d != s {
            return Err(Error::MismatchedSizes(line.to_string()));
        }
    }
    Ok(src.size.or(dst.size))
}

fn lower(parsed: Parsed, line: &str) -> Result<Vec<Slot>> {
    match parsed {
        Parsed::Ld { dst, src } => lower_ld(dst, src, line),
        Parsed::Ldpkt { dst, src } => lower_ldpkt(dst, src, line),
        Parsed::Alu {
            code,
            name,
            dst,
            src,
        } => lower_alu(code, &name, dst, src, line),
        Parsed::Neg { dst } => lower_neg(dst, line),
        Parsed::End { big, dst } => lower_end(big, dst, line),
        Parsed::Ja { off } => Ok(vec![jump_slot(insn::class::JMP | insn::jmp::JA, 0, 0, 0, off)?]),
        Parsed::Jcc {
            cond,
            dst,
            src,
            off,
        } => lower_jcc(cond, dst, src, off, line),
        Parsed::CallHelper { func } => Ok(vec![Slot::plain(Insn::new(
            insn::class::JMP | insn::jmp::CALL,
            0,
            0,
            0,
            check_s32(func)?,
        ))]),
        Parsed::CallPseudo { target } => lower_call_pseudo(target),
        Parsed::Exit => Ok(vec![Slot::plain(Insn::new(
            insn::class::JMP | insn::jmp::EXIT,
            0,
            0,
            0,
            0,
        ))]),
        Parsed::Xadd { dst, src } => lower_xadd(dst, src, line),
    }
}

fn lower_ld(dst: Operand, src: Operand, line: &str) -> Result<Vec<Slot>> {
    let size = merged_size(&dst, &src, line)?;
    if matches!(dst.direct, Direct::Imm(_) | Direct::Sym(_)) {
        return Err(Error::illegal("ld imm,...", line));
    }
    let dreg = dst
        .reg()
        .ok_or_else(|| Error::internal(format!("ld dst not a register: {}", line)))?;
    if dst.indirect {
        // BPF_ST[X]_MEM
        if src.indirect {
            return Err(Error::illegal("ld mem,mem", line));
        }
        if src.disp.is_some() {
            return Err(Error::illegal("ld mem,reg+disp", line));
        }
        let sz = size.unwrap_or(Size::Q);
        let off = check_s16(dst.disp.unwrap_or(0))?;
        return match src.direct {
            Direct::Reg(sreg) => Ok(vec![Slot::plain(Insn::new(
                insn::class::STX | insn::mode::MEM | sz.code(),
                dreg,
                sreg,
                off,
                0,
            ))]),
            Direct::Imm(v) => Ok(vec![Slot::plain(Insn::new(
                insn::class::ST | insn::mode::MEM | sz.code(),
                dreg,
                0,
                off,
                check_s32(v)?,
            ))]),
            Direct::Sym(s) => Err(Error::BadImmediate(s)),
        };
    }
    if dst.disp.is_some() {
        return Err(Error::MissingBrackets {
            what: "ld reg+disp,...".to_string(),
            line: line.to_string(),
        });
    }
    if src.indirect {
        // BPF_LDX_MEM
        let sreg = match src.direct {
            Direct::Reg(r) => r,
            _ => return Err(Error::illegal("ld ...,[imm]", line)),
        };
        let sz = size.unwrap_or(Size::Q);
        return Ok(vec![Slot::plain(Insn::new(
            insn::class::LDX | insn::mode::MEM | sz.code(),
            dreg,
            sreg,
            check_s16(src.disp.unwrap_or(0))?,
            0,
        ))]);
    }
    if src.disp.is_some() {
        return Err(Error::MissingBrackets {
            what: "ld ...,reg+disp".to_string(),
            line: line.to_string(),
        });
    }
    let sz = size.unwrap_or(Size::Q);
    if sz != Size::Q && sz != Size::L {
        return Err(Error::BadSizeFor {
            size: sz.suffix(),
            what: "register load",
            line: line.to_string(),
        });
    }
    match src.direct {
        Direct::Reg(sreg) => {
            // Register move, 64- or 32-bit ALU class
            let klass = if sz == Size::Q {
                insn::class::ALU64
            } else {
                insn::class::ALU
            };
            Ok(vec![Slot::plain(Insn::new(
                klass | insn::BPF_X | insn::alu::MOV,
                dreg,
                sreg,
                0,
                0,
            ))])
        }
        Direct::Imm(v) => {
            if sz == Size::Q {
                // BPF_LD_IMM64, two slots
                let wide = check_u64(v)?;
                let lo = wide as u32 as i32;
                let hi = (wide >> 32) as u32 as i32;
                Ok(vec![
                    Slot::plain(Insn::new(
                        insn::class::LD | insn::mode::IMM | Size::Q.code(),
                        dreg,
                        0,
                        0,
                        lo,
                    )),
                    Slot::plain(Insn::new(0, 0, 0, 0, hi)),
                ])
            } else {
                Ok(vec![Slot::plain(Insn::new(
                    insn::class::ALU | insn::BPF_K | insn::alu::MOV,
                    dreg,
                    0,
                    0,
                    check_s32(v)?,
                ))])
            }
        }
        Direct::Sym(sym) => {
            if sz == Size::Q {
                // External symbol, e.g. a map reference: a relocation against
                // the low half of the wide immediate
                Ok(vec![
                    Slot {
                        insn: Insn::new(
                            insn::class::LD | insn::mode::IMM | Size::Q.code(),
                            dreg,
                            0,
                            0,
                            -1,
                        ),
                        off_sym: None,
                        imm_ref: Some(ImmRef::Sym(sym)),
                    },
                    Slot::plain(Insn::new(0, 0, 0, 0, 0)),
                ])
            } else {
                Err(Error::BadImmediate(sym))
            }
        }
    }
}

fn lower_ldpkt(dst: Operand, src: Operand, line: &str) -> Result<Vec<Slot>> {
    let size = merged_size(&dst, &src, line)?;
    let sz = size.unwrap_or(Size::L);
    if sz == Size::Q {
        return Err(Error::illegal("ldpkt .q", line));
    }
    let dreg = dst
        .reg()
        .ok_or_else(|| Error::internal(format!("ldpkt dst not a register: {}", line)))?;
    if dreg != 0 {
        return Err(Error::LdpktDst(dreg));
    }
    match src.direct {
        Direct::Reg(sreg) => {
            // LD_IND: displacement lives in the imm field
            let disp = check_s32(src.disp.unwrap_or(0))?;
            Ok(vec![Slot::plain(Insn::new(
                insn::class::LD | insn::mode::IND | sz.code(),
                0,
                sreg,
                0,
                disp,
            ))])
        }
        Direct::Imm(v) => Ok(vec![Slot::plain(Insn::new(
            insn::class::LD | insn::mode::ABS | sz.code(),
            0,
            0,
            0,
            check_s32(v)?,
        ))]),
        Direct::Sym(s) => Err(Error::BadImmediate(s)),
    }
}

fn lower_alu(code: u8, name: &str, dst: Operand, src: Operand, line: &str) -> Result<Vec<Slot>> {
    let size = merged_size(&dst, &src, line)?;
    let klass = match size {
        None | Some(Size::Q) => insn::class::ALU64,
        Some(Size::L) => insn::class::ALU,
        Some(sz) => {
            return Err(Error::BadSizeFor {
                size: sz.suffix(),
                what: "ALU op",
                line: line.to_string(),
            })
        }
    };
    if matches!(dst.direct, Direct::Imm(_) | Direct::Sym(_)) {
        return Err(Error::illegal(format!("{} imm,...", name), line));
    }
    let dreg = dst
        .reg()
        .ok_or_else(|| Error::internal(format!("{} dst not a register: {}", name, line)))?;
    match src.direct {
        Direct::Reg(sreg) => Ok(vec![Slot::plain(Insn::new(
            klass | insn::BPF_X | code,
            dreg,
            sreg,
            0,
            0,
        ))]),
        Direct::Imm(v) => Ok(vec![Slot::plain(Insn::new(
            klass | insn::BPF_K | code,
            dreg,
            0,
            0,
            check_s32(v)?,
        ))]),
        Direct::Sym(s) => Err(Error::BadImmediate(s)),
    }
}

fn lower_neg(dst: Operand, line: &str) -> Result<Vec<Slot>> {
    let klass = match dst.size {
        None | Some(Size::Q) => insn::class::ALU64,
        Some(Size::L) => insn::class::ALU,
        Some(sz) => {
            return Err(Error::BadSizeFor {
                size: sz.suffix(),
                what: "ALU op",
                line: line.to_string(),
            })
        }
    };
    let dreg = match dst.direct {
        Direct::Reg(r) => r,
        _ => return Err(Error::illegal("neg imm", line)),
    };
    Ok(vec![Slot::plain(Insn::new(
        klass | insn::BPF_K | insn::alu::NEG,
        dreg,
        0,
        0,
        0,
    ))])
}

fn lower_end(big: bool, dst: Operand, line: &str) -> Result<Vec<Slot>> {
    let sz = dst.size.unwrap_or(Size::Q);
    let imm = match sz {
        Size::Q => 64,
        Size::L => 32,
        Size::W => 16,
        Size::B => {
            return Err(Error::BadSizeFor {
                size: sz.suffix(),
                what: "endian op",
                line: line.to_string(),
            })
        }
    };
    let dreg = match dst.direct {
        Direct::Reg(r) => r,
        _ => return Err(Error::illegal("end ..., imm", line)),
    };
    // Every BPF_END uses the 32-bit ALU class; TO_LE is the K source form
    // and TO_BE the X form with a zero source register.
    let source = if big { insn::BPF_X } else { insn::BPF_K };
    Ok(vec![Slot::plain(Insn::new(
        insn::class::ALU | source | insn::alu::END,
        dreg,
        0,
        0,
        imm,
    ))])
}

fn jump_slot(op: u8, dst: u8, src: u8, imm: i32, off: JumpTarget) -> Result<Slot> {
    match off {
        JumpTarget::Off(v) => Ok(Slot {
            insn: Insn::new(op, dst, src, check_s16(v)?, imm),
            off_sym: None,
            imm_ref: None,
        }),
        JumpTarget::Label(l) => Ok(Slot {
            insn: Insn::new(op, dst, src, -1, imm),
            off_sym: Some(l),
            imm_ref: None,
        }),
    }
}

fn lower_jcc(
    cond: u8,
    dst: Operand,
    src: Operand,
    off: JumpTarget,
    line: &str,
) -> Result<Vec<Slot>> {
    let dreg = match dst.direct {
        Direct::Reg(r) => r,
        _ => return Err(Error::illegal("jr cc,imm,...", line)),
    };
    match src.direct {
        Direct::Reg(sreg) => Ok(vec![jump_slot(
            insn::class::JMP | insn::BPF_X | cond,
            dreg,
            sreg,
            0,
            off,
        )?]),
        Direct::Imm(v) => Ok(vec![jump_slot(
            insn::class::JMP | insn::BPF_K | cond,
            dreg,
            0,
            check_s32(v)?,
            off,
        )?]),
        Direct::Sym(s) => Err(Error::BadImmediate(s)),
    }
}

fn lower_call_pseudo(target: JumpTarget) -> Result<Vec<Slot>> {
    let op = insn::class::JMP | insn::jmp::CALL;
    match target {
        JumpTarget::Off(v) => Ok(vec![Slot::plain(Insn::new(
            op,
            0,
            insn::BPF_PSEUDO_CALL,
            0,
            check_s32(v)?,
        ))]),
        JumpTarget::Label(l) => Ok(vec![Slot {
            insn: Insn::new(op, 0, insn::BPF_PSEUDO_CALL, 0, -1),
            off_sym: None,
            imm_ref: Some(ImmRef::PseudoCall(l)),
        }]),
    }
}

fn lower_xadd(dst: Operand, src: Operand, line: &str) -> Result<Vec<Slot>> {
    let size = merged_size(&dst, &src, line)?;
    if !dst.indirect {
        return Err(Error::illegal("xadd direct_operand,...", line));
    }
    let dreg = match dst.direct {
        Direct::Reg(r) => r,
        _ => return Err(Error::illegal("xadd [imm],...", line)),
    };
    let sreg = match src.direct {
        Direct::Reg(r) => r,
        _ => return Err(Error::illegal("xadd ...,imm", line)),
    };
    let sz = size.unwrap_or(Size::Q);
    if sz != Size::Q && sz != Size::L {
        return Err(Error::BadSizeFor {
            size: sz.suffix(),
            what: "xadd",
            line: line.to_string(),
        });
    }
    Ok(vec![Slot::plain(Insn::new(
        insn::class::STX | insn::mode::XADD | sz.code(),
        dreg,
        sreg,
        check_s16(dst.disp.unwrap_or(0))?,
        0,
    ))])
}
