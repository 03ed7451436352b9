//! BTF section serialization tests

use ebas::{BtfAssembler, Equates};

fn assemble_btf(source: &str) -> BtfAssembler {
    let mut asm = BtfAssembler::new();
    for line in source.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        asm.feed_line(line, &Equates::new()).unwrap();
    }
    asm.resolve_symbols().unwrap();
    asm
}

fn u32_at(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
}

#[test]
fn bitfield_struct_record() {
    // Three int members of 3, 5 and 8 bits: offsets 0, 3 and 8, total 2
    // bytes. The third stays packed because ints may be bitfields.
    let asm = assemble_btf(
        "bits: struct ((int unsigned 3) x) ((int unsigned 5) y) ((int unsigned 8) z)",
    );
    let bin = asm.binary();
    // records: void (nothing), three 16-byte ints, then the struct
    let struct_off = 24 + 3 * 16;
    let info = u32_at(&bin, struct_off + 4);
    assert_eq!(info >> 24, 4); // struct kind
    assert_eq!(info & 0xffff, 3); // vlen
    assert_eq!(u32_at(&bin, struct_off + 8), 2); // byte size
    for (i, expect) in [0u32, 3, 8].iter().enumerate() {
        let member_off = struct_off + 12 + i * 12;
        assert_eq!(u32_at(&bin, member_off + 8), *expect);
    }
}

#[test]
fn int_record_encoding() {
    let asm = assemble_btf("schar: int (signed char) 8");
    let bin = asm.binary();
    // the single int record follows the header
    let info = u32_at(&bin, 24 + 4);
    assert_eq!(info >> 24, 1); // int kind
    assert_eq!(u32_at(&bin, 24 + 8), 1); // byte size
    let intdata = u32_at(&bin, 24 + 12);
    assert_eq!(intdata >> 24, 3); // signed | char
    assert_eq!(intdata & 0xff, 8); // bits
}

#[test]
fn array_record_carries_index_type() {
    let asm = assemble_btf("quad: array (int unsigned 16) 4");
    let bin = asm.binary();
    // records: u16 element int, s64 index int, then the array
    let array_off = 24 + 2 * 16;
    let info = u32_at(&bin, array_off + 4);
    assert_eq!(info >> 24, 3); // array kind
    let elem = u32_at(&bin, array_off + 12);
    let index = u32_at(&bin, array_off + 16);
    let nelems = u32_at(&bin, array_off + 20);
    assert_eq!(elem, 1);
    assert_eq!(index, 2);
    assert_eq!(nelems, 4);
    // the index type is the shared signed 64-bit int
    let index_info = u32_at(&bin, 24 + 16 + 4);
    assert_eq!(index_info >> 24, 1);
    let index_data = u32_at(&bin, 24 + 16 + 12);
    assert_eq!(index_data >> 24, 1); // signed
    assert_eq!(index_data & 0xff, 64);
}

#[test]
fn union_members_at_offset_zero() {
    let asm = assemble_btf("u: union ((int unsigned 32) a) ((int unsigned 8) b)");
    let bin = asm.binary();
    let union_off = 24 + 2 * 16;
    let info = u32_at(&bin, union_off + 4);
    assert_eq!(info >> 24, 5); // union kind
    assert_eq!(u32_at(&bin, union_off + 8), 4); // max member size
    assert_eq!(u32_at(&bin, union_off + 12 + 8), 0);
    assert_eq!(u32_at(&bin, union_off + 24 + 8), 0);
}

#[test]
fn enum_record() {
    let asm = assemble_btf("e: enum 4 (A 1) (B -1)");
    let bin = asm.binary();
    let off = 24;
    let info = u32_at(&bin, off + 4);
    assert_eq!(info >> 24, 6); // enum kind
    assert_eq!(info & 0xffff, 2);
    assert_eq!(u32_at(&bin, off + 8), 4); // explicit size
    // enum members are 8-byte (name, value) pairs
    assert_eq!(u32_at(&bin, off + 16), 1);
    assert_eq!(u32_at(&bin, off + 24) as i32, -1);
}

#[test]
fn string_section_layout() {
    // member names come first in traversal order, then top-level names
    let asm = assemble_btf("s: struct ((int unsigned 8) first)");
    let bin = asm.binary();
    let type_len = u32_at(&bin, 12) as usize;
    let strings = &bin[24 + type_len..];
    assert_eq!(strings[0], 0);
    let first_pos = strings.windows(6).position(|w| w == b"first\0").unwrap();
    let void_pos = strings.windows(5).position(|w| w == b"void\0").unwrap();
    let s_pos = strings.windows(2).position(|w| w == b"s\0").unwrap();
    assert!(first_pos < void_pos);
    assert!(void_pos < s_pos);
}

#[test]
fn duplicate_type_rejected() {
    let mut asm = BtfAssembler::new();
    asm.feed_line("t: int unsigned 8", &Equates::new()).unwrap();
    let err = asm
        .feed_line("t: int unsigned 16", &Equates::new())
        .unwrap_err();
    assert!(err.to_string().starts_with("Duplicate type t"));
}
