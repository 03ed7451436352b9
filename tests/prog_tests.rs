//! Instruction encoding tests for the program-section assembler

use ebas::{Assembler, Error, Insn};

fn assemble(body: &str) -> Vec<Insn> {
    let mut asm = Assembler::new(false);
    asm.feed_line(".text").unwrap();
    asm.feed_line(".section prog").unwrap();
    for line in body.lines() {
        asm.feed_line(line).unwrap();
    }
    asm.resolve_symbols().unwrap();
    let bin = asm.sections()[0].1.binary();
    assert_eq!(bin.len() % 8, 0);
    bin.chunks(8)
        .map(|c| {
            let arr: [u8; 8] = c.try_into().unwrap();
            Insn::decode(&arr)
        })
        .collect()
}

fn assemble_err(body: &str) -> Error {
    let mut asm = Assembler::new(false);
    asm.feed_line(".text").unwrap();
    asm.feed_line(".section prog").unwrap();
    for line in body.lines() {
        if let Err(e) = asm.feed_line(line) {
            return e;
        }
    }
    asm.resolve_symbols().unwrap_err()
}

// ====================
// ld - operand-shape dispatch
// ====================

#[test]
fn ld_imm_default_is_wide() {
    let insns = assemble("ld r0, 1");
    assert_eq!(insns.len(), 2);
    assert_eq!(insns[0].op, 0x18);
    assert_eq!(insns[0].dst, 0);
    assert_eq!(insns[0].imm, 1);
    // the second slot carries only the high half
    assert_eq!(insns[1], Insn::new(0, 0, 0, 0, 0));
}

#[test]
fn ld_wide_imm_splits_halves() {
    let insns = assemble("ld r5, 0x123456789abcdef0");
    assert_eq!(insns.len(), 2);
    assert_eq!(insns[0].imm as u32, 0x9abcdef0);
    assert_eq!(insns[1].imm as u32, 0x12345678);
    assert_eq!(insns[0].dst, 5);
}

#[test]
fn ld_wide_imm_u64_range() {
    let insns = assemble("ld r0, 0xffffffffffffffff");
    assert_eq!(insns[0].imm, -1);
    assert_eq!(insns[1].imm, -1);
    let err = assemble_err("ld r0, -1");
    assert!(err.to_string().starts_with("Value out of range for u64"));
}

#[test]
fn ld_imm_long_is_mov() {
    let insns = assemble("ld r1.l, 5");
    assert_eq!(insns.len(), 1);
    assert_eq!(insns[0], Insn::new(0xb4, 1, 0, 0, 5));
}

#[test]
fn ld_reg_reg_sizes() {
    assert_eq!(assemble("ld r1, r2")[0], Insn::new(0xbf, 1, 2, 0, 0));
    assert_eq!(assemble("ld r1.l, r2")[0], Insn::new(0xbc, 1, 2, 0, 0));
    // the size may ride on either operand
    assert_eq!(assemble("ld r1, r2.l")[0], Insn::new(0xbc, 1, 2, 0, 0));
}

#[test]
fn ld_reg_reg_bad_sizes() {
    let err = assemble_err("ld r1.w, r2");
    assert!(err.to_string().starts_with("Bad size w for register load"));
    let err = assemble_err("ld r1.b, r2");
    assert!(err.to_string().starts_with("Bad size b for register load"));
    let err = assemble_err("ld r1.l, r2.q");
    assert!(err.to_string().starts_with("Mismatched sizes"));
}

#[test]
fn ld_memory_forms() {
    assert_eq!(assemble("ld r1, [r2+8]")[0], Insn::new(0x79, 1, 2, 8, 0));
    assert_eq!(assemble("ld r1.w, [r2]")[0], Insn::new(0x69, 1, 2, 0, 0));
    assert_eq!(assemble("ld [r1+4], r2")[0], Insn::new(0x7b, 1, 2, 4, 0));
    assert_eq!(assemble("ld [r1-4], r2.b")[0], Insn::new(0x73, 1, 2, -4, 0));
    assert_eq!(assemble("ld [r1+4].b, 7")[0], Insn::new(0x72, 1, 0, 4, 7));
}

#[test]
fn ld_illegal_shapes() {
    assert!(assemble_err("ld 5, r0")
        .to_string()
        .starts_with("ld imm,... illegal"));
    assert!(assemble_err("ld [r1], [r2]")
        .to_string()
        .starts_with("ld mem,mem illegal"));
    assert!(assemble_err("ld [r1], [5]")
        .to_string()
        .starts_with("ld mem,mem illegal"));
    assert!(assemble_err("ld r1, [5+3]")
        .to_string()
        .starts_with("ld ...,[imm] illegal"));
    // a displaced operand without brackets never lexes as an operand at all
    assert!(assemble_err("ld r1+4, r2")
        .to_string()
        .starts_with("Bad direct operand"));
    assert!(assemble_err("ld r1, r2+4")
        .to_string()
        .starts_with("Bad direct operand"));
}

#[test]
fn ld_arity() {
    let err = assemble_err("ld r0");
    assert!(err.to_string().starts_with("Bad ld, expected 2 args"));
}

// ====================
// ALU and unary ops
// ====================

#[test]
fn alu_encodings() {
    assert_eq!(assemble("add r1, r2")[0], Insn::new(0x0f, 1, 2, 0, 0));
    assert_eq!(assemble("add r1, 10")[0], Insn::new(0x07, 1, 0, 0, 10));
    assert_eq!(assemble("add r1.l, 10")[0], Insn::new(0x04, 1, 0, 0, 10));
    assert_eq!(assemble("sub r3, r4")[0], Insn::new(0x1f, 3, 4, 0, 0));
    assert_eq!(assemble("xor r3.l, r4")[0], Insn::new(0xac, 3, 4, 0, 0));
    assert_eq!(assemble("arsh r2, 3")[0], Insn::new(0xc7, 2, 0, 0, 3));
}

#[test]
fn alu_imm_bounds() {
    assert_eq!(assemble("add r0, 2147483647")[0].imm, i32::MAX);
    assert_eq!(assemble("add r0, -2147483648")[0].imm, i32::MIN);
    assert!(assemble_err("add r0, 2147483648")
        .to_string()
        .starts_with("Value out of range for s32"));
    assert!(assemble_err("add r0, -2147483649")
        .to_string()
        .starts_with("Value out of range for s32"));
}

#[test]
fn alu_bad_shapes() {
    assert!(assemble_err("add 1, r0")
        .to_string()
        .starts_with("add imm,... illegal"));
    assert!(assemble_err("add r0.w, 1")
        .to_string()
        .starts_with("Bad size w for ALU op"));
}

#[test]
fn neg_and_end() {
    assert_eq!(assemble("neg r1")[0], Insn::new(0x87, 1, 0, 0, 0));
    assert_eq!(assemble("neg r1.l")[0], Insn::new(0x84, 1, 0, 0, 0));
    assert_eq!(assemble("end le, r1.w")[0], Insn::new(0xd4, 1, 0, 0, 16));
    assert_eq!(assemble("end le, r1.l")[0], Insn::new(0xd4, 1, 0, 0, 32));
    assert_eq!(assemble("end be, r1")[0], Insn::new(0xdc, 1, 0, 0, 64));
    assert!(assemble_err("end be, r1.b")
        .to_string()
        .starts_with("Bad size b for endian op"));
    assert!(assemble_err("end up, r1")
        .to_string()
        .starts_with("Bad end, expected le or be"));
}

// ====================
// Jumps
// ====================

#[test]
fn jump_unconditional() {
    assert_eq!(assemble("jr +2")[0], Insn::new(0x05, 0, 0, 2, 0));
    assert_eq!(assemble("jr -1")[0], Insn::new(0x05, 0, 0, -1, 0));
}

#[test]
fn jump_requires_sign() {
    let err = assemble_err("jr 2");
    assert!(err
        .to_string()
        .starts_with("Bad jump offset (missing + sign?)"));
}

#[test]
fn jump_conditional_forms() {
    assert_eq!(assemble("jr z, r1, 0, +1")[0], Insn::new(0x15, 1, 0, 1, 0));
    assert_eq!(assemble("jr z, r1, r2, +1")[0], Insn::new(0x1d, 1, 2, 1, 0));
    // aliases map onto the canonical ops
    assert_eq!(assemble("jr p, r1, 0, +1")[0].op, 0x75);
    assert_eq!(assemble("jr n, r1, 0, +1")[0].op, 0xc5);
    assert_eq!(assemble("jr !=, r1, 0, +1")[0].op, 0x55);
}

#[test]
fn jump_size_suffix_rejected() {
    assert!(assemble_err("jr z, r1.q, r2, +1")
        .to_string()
        .starts_with("Bad size in jump dst"));
    assert!(assemble_err("jr z, r1, r2.l, +1")
        .to_string()
        .starts_with("Bad size in jump src"));
    assert!(assemble_err("jr zz, r1, r2, +1")
        .to_string()
        .starts_with("Bad jump op"));
}

#[test]
fn jump_offset_bounds() {
    assert_eq!(assemble("jr +32767")[0].off, 32767);
    assert_eq!(assemble("jr -32768")[0].off, -32768);
    assert!(assemble_err("jr +32768")
        .to_string()
        .starts_with("Value out of range for s16"));
    assert!(assemble_err("jr -32769")
        .to_string()
        .starts_with("Value out of range for s16"));
}

#[test]
fn jump_to_label_forward_and_back() {
    let insns = assemble("back:\nexit\njr back\njr fwd\nexit\nfwd:\nexit");
    // jr back at index 1: 0 - 1 - 1 = -2
    assert_eq!(insns[1].off, -2);
    // jr fwd at index 2, fwd at index 4: 4 - 2 - 1 = 1
    assert_eq!(insns[2].off, 1);
}

#[test]
fn jump_conditional_to_label() {
    let insns = assemble("jr z, r1, r2, out\nexit\nout:\nexit");
    assert_eq!(insns[0], Insn::new(0x1d, 1, 2, 1, 0));
}

#[test]
fn undefined_jump_label() {
    let err = assemble_err("jr nowhere\nexit");
    assert!(err.to_string().starts_with("Undefined symbol nowhere"));
}

#[test]
fn duplicate_label_rejected() {
    let err = assemble_err("x:\nexit\nx:\nexit");
    assert!(err.to_string().starts_with("Duplicate label x"));
}

// ====================
// Calls and exit
// ====================

#[test]
fn helper_call() {
    assert_eq!(assemble("call 1")[0], Insn::new(0x85, 0, 0, 0, 1));
}

#[test]
fn helper_call_via_equate() {
    let mut asm = Assembler::new(false);
    asm.feed_line(".equ get_prandom_u32, 7").unwrap();
    asm.feed_line(".text").unwrap();
    asm.feed_line(".section prog").unwrap();
    asm.feed_line("call get_prandom_u32").unwrap();
    asm.resolve_symbols().unwrap();
    let bin = asm.sections()[0].1.binary();
    let arr: [u8; 8] = bin[0..8].try_into().unwrap();
    let insn = Insn::decode(&arr);
    assert_eq!(insn.src, 0);
    assert_eq!(insn.imm, 7);
}

#[test]
fn pseudo_call_patches_imm() {
    // A at index 0, call at index 1: imm = 0 - 1 - 1 = -2
    let insns = assemble("A:\nexit\ncall A");
    assert_eq!(insns[1].op, 0x85);
    assert_eq!(insns[1].src, 1);
    assert_eq!(insns[1].imm, -2);
}

#[test]
fn pseudo_call_numeric_offset() {
    let insns = assemble("call +2");
    assert_eq!(insns[0].op, 0x85);
    assert_eq!(insns[0].src, 1);
    assert_eq!(insns[0].imm, 2);
}

#[test]
fn pseudo_call_undefined_label() {
    let err = assemble_err("call nowhere");
    assert!(err.to_string().starts_with("Undefined symbol nowhere"));
}

#[test]
fn exit_takes_no_args() {
    assert_eq!(assemble("exit")[0], Insn::new(0x95, 0, 0, 0, 0));
    let err = assemble_err("exit r0");
    assert!(err.to_string().starts_with("Bad exit, expected no args"));
}

// ====================
// xadd and ldpkt
// ====================

#[test]
fn xadd_encodings() {
    assert_eq!(assemble("xadd [r1+8], r2")[0], Insn::new(0xdb, 1, 2, 8, 0));
    assert_eq!(assemble("xadd [r1], r2.l")[0], Insn::new(0xc3, 1, 2, 0, 0));
}

#[test]
fn xadd_bad_shapes() {
    assert!(assemble_err("xadd r1, r2")
        .to_string()
        .starts_with("xadd direct_operand,... illegal"));
    assert!(assemble_err("xadd [5], r2")
        .to_string()
        .starts_with("xadd [imm],... illegal"));
    assert!(assemble_err("xadd [r1], 5")
        .to_string()
        .starts_with("xadd ...,imm illegal"));
    assert!(assemble_err("xadd [r1], r2.w")
        .to_string()
        .starts_with("Bad size w for xadd"));
}

#[test]
fn ldpkt_forms() {
    assert_eq!(assemble("ldpkt r0, [42]")[0], Insn::new(0x20, 0, 0, 0, 42));
    assert_eq!(
        assemble("ldpkt r0.b, [r2+4]")[0],
        Insn::new(0x50, 0, 2, 0, 4)
    );
    assert_eq!(assemble("ldpkt r0.w, [r2]")[0], Insn::new(0x48, 0, 2, 0, 0));
}

#[test]
fn ldpkt_constraints() {
    assert!(assemble_err("ldpkt r0.q, [42]")
        .to_string()
        .starts_with("ldpkt .q illegal"));
    assert!(assemble_err("ldpkt r1, [42]")
        .to_string()
        .starts_with("ldpkt dst must be r0, not r1"));
    assert!(assemble_err("ldpkt r0, r2")
        .to_string()
        .starts_with("Bad ldpkt, src must be indirect"));
    assert!(assemble_err("ldpkt 7, [42]")
        .to_string()
        .starts_with("Bad ldpkt, dst must be reg"));
}

// ====================
// Operand lexing through the assembler
// ====================

#[test]
fn fp_is_r10() {
    let a = assemble("ld r0, [fp-8]");
    let b = assemble("ld r0, [r10-8]");
    assert_eq!(a, b);
    assert_eq!(a[0].src, 10);
    assert_eq!(a[0].off, -8);
}

#[test]
fn r11_rejected() {
    let err = assemble_err("ld r11, 0");
    assert!(err.to_string().starts_with("Bad register"));
}

#[test]
fn indirect_size_placement() {
    assert!(assemble_err("ld r0, [r1.l]")
        .to_string()
        .starts_with("Bad size in indirect operand"));
    assert!(assemble_err("ld r0, [r1.l+4]")
        .to_string()
        .starts_with("Bad size in offset operand"));
    assert!(assemble_err("ld r0, [r1+4.l]")
        .to_string()
        .starts_with("Bad immediate"));
}

#[test]
fn unrecognised_instruction() {
    let err = assemble_err("frob r1, r2");
    assert!(err.to_string().starts_with("Unrecognised instruction"));
}

#[test]
fn octal_and_hex_immediates() {
    assert_eq!(assemble("add r0, 017")[0].imm, 15);
    assert_eq!(assemble("add r0, 0x1f")[0].imm, 31);
    assert_eq!(assemble("add r0, -0x10")[0].imm, -16);
}
