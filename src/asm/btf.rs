//! BTF-section assembler
//!
//! Type lines take the form `name: kind args...` with whitespace-separated
//! terminals and parenthesized children. Inline nested types are
//! structurally deduplicated against the type vector before being appended;
//! forward declarations may be overwritten by a later full definition.

use crate::error::{Error, Result};
use crate::lexer::{self, parse_immediate, Equates, Sexp};

/// BTF section magic
pub const BTF_MAGIC: u16 = 0xEB9F;
/// BTF format version
pub const BTF_VERSION: u8 = 1;
/// Size of the fixed section header
pub const BTF_HDR_LEN: u32 = 24;

/// `int` encoding bits
pub mod int_encoding {
    /// Signed integer
    pub const SIGNED: u32 = 1 << 0;
    /// Character type
    pub const CHAR: u32 = 1 << 1;
    /// Boolean type
    pub const BOOL: u32 = 1 << 2;
}

/// A struct or union member
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    /// Member name
    pub name: String,
    /// Referenced type index
    pub ty: u32,
}

/// One BTF type record
#[derive(Debug, Clone, PartialEq)]
pub enum BtfType {
    /// The void sentinel at index 0; serializes to no bytes
    Unknown,
    /// Integer with encoding bits and bit width
    Int {
        /// Encoding bitmask (signed/char/bool)
        encoding: u32,
        /// Width in bits
        bits: u32,
    },
    /// Pointer to another type; always 8 bytes in eBPF
    Pointer {
        /// Referenced type index
        ty: u32,
    },
    /// Fixed-length array
    Array {
        /// Element type index
        elem: u32,
        /// Index type (always signed 64-bit int)
        index: u32,
        /// Element count
        nelems: u32,
    },
    /// Struct with ordered members
    Struct {
        /// Members in declaration order
        members: Vec<Member>,
    },
    /// Union with ordered members, all at offset zero
    Union {
        /// Members in declaration order
        members: Vec<Member>,
    },
    /// Enum with an explicit byte size
    Enum {
        /// Byte size
        size: u32,
        /// Named values
        members: Vec<(String, i32)>,
    },
    /// Forward declaration; has no size
    Forward,
    /// Type alias
    Typedef {
        /// Referenced type index
        ty: u32,
    },
    /// `volatile` qualifier
    Volatile {
        /// Referenced type index
        ty: u32,
    },
    /// `const` qualifier
    Const {
        /// Referenced type index
        ty: u32,
    },
    /// `restrict` qualifier
    Restrict {
        /// Referenced type index
        ty: u32,
    },
}

impl BtfType {
    /// The BTF kind number
    pub fn kind(&self) -> u8 {
        match self {
            BtfType::Unknown => 0,
            BtfType::Int { .. } => 1,
            BtfType::Pointer { .. } => 2,
            BtfType::Array { .. } => 3,
            BtfType::Struct { .. } => 4,
            BtfType::Union { .. } => 5,
            BtfType::Enum { .. } => 6,
            BtfType::Forward => 7,
            BtfType::Typedef { .. } => 8,
            BtfType::Volatile { .. } => 9,
            BtfType::Const { .. } => 10,
            BtfType::Restrict { .. } => 11,
        }
    }

    /// The member count carried in the info word
    pub fn vlen(&self) -> u16 {
        match self {
            BtfType::Struct { members } | BtfType::Union { members } => members.len() as u16,
            BtfType::Enum { members, .. } => members.len() as u16,
            _ => 0,
        }
    }
}

enum TypeOrRef {
    Ref(u32),
    New(BtfType),
}

/// Assembler for the `.BTF` section
#[derive(Debug)]
pub struct BtfAssembler {
    types: Vec<BtfType>,
    named: Vec<(String, usize)>,
    section: Vec<u8>,
}

impl Default for BtfAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl BtfAssembler {
    /// Create an assembler holding only the void sentinel
    pub fn new() -> BtfAssembler {
        BtfAssembler {
            types: vec![BtfType::Unknown],
            named: vec![("void".to_string(), 0)],
            section: Vec::new(),
        }
    }

    /// The serialized section; valid after `resolve_symbols`
    pub fn binary(&self) -> Vec<u8> {
        self.section.clone()
    }

    /// The type vector with top-level names attached, for the merger
    pub fn types(&self) -> Vec<(Option<String>, BtfType)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let name = self
                    .named
                    .iter()
                    .find(|(_, ti)| *ti == i)
                    .map(|(n, _)| n.clone());
                (name, t.clone())
            })
            .collect()
    }

    /// Index of a named type, if defined
    pub fn named_index(&self, name: &str) -> Option<usize> {
        self.named.iter().find(|(n, _)| n == name).map(|(_, i)| *i)
    }

    /// Ingest one trimmed type-definition line
    pub fn feed_line(&mut self, line: &str, equates: &Equates) -> Result<()> {
        let (name, rest) = line
            .split_once(": ")
            .ok_or_else(|| Error::BadType(line.to_string()))?;
        let sexps = lexer::parse_string(rest)?;
        let old = self.named_index(name);
        if let Some(oi) = old {
            if self.types[oi] != BtfType::Forward {
                return Err(Error::DuplicateType(name.to_string()));
            }
        }
        let ty = match self.parse_type(&sexps, equates)? {
            TypeOrRef::New(t) => t,
            TypeOrRef::Ref(_) => return Err(Error::BadType(rest.to_string())),
        };
        match old {
            // Overwrite the forward declaration in place
            Some(oi) => self.types[oi] = ty,
            None => {
                self.named.push((name.to_string(), self.types.len()));
                self.types.push(ty);
            }
        }
        Ok(())
    }

    fn parse_type(&mut self, args: &[Sexp], equates: &Equates) -> Result<TypeOrRef> {
        let head = args
            .first()
            .and_then(Sexp::atom)
            .ok_or_else(|| Error::BadType(format!("{:?}", args)))?
            .to_string();
        if let Some(idx) = self.named_index(&head) {
            if args.len() != 1 {
                return Err(Error::NamedTypeArgs(head));
            }
            return Ok(TypeOrRef::Ref(idx as u32));
        }
        let body = &args[1..];
        let ty = match head.as_str() {
            "int" => self.parse_int(body, equates)?,
            "*" => BtfType::Pointer {
                ty: self.nested(body, equates)?,
            },
            "array" => self.parse_array(body, equates)?,
            "struct" => BtfType::Struct {
                members: self.parse_members(body, equates)?,
            },
            "union" => BtfType::Union {
                members: self.parse_members(body, equates)?,
            },
            "enum" => self.parse_enum(body, equates)?,
            "..." => {
                if !body.is_empty() {
                    return Err(Error::BadType(format!("{:?}", args)));
                }
                BtfType::Forward
            }
            "typedef" => BtfType::Typedef {
                ty: self.nested(body, equates)?,
            },
            "volatile" => BtfType::Volatile {
                ty: self.nested(body, equates)?,
            },
            "const" => BtfType::Const {
                ty: self.nested(body, equates)?,
            },
            "restrict" => BtfType::Restrict {
                ty: self.nested(body, equates)?,
            },
            _ => return Err(Error::BadType(head)),
        };
        Ok(TypeOrRef::New(ty))
    }

    /// Resolve a nested type expression to an index, deduplicating inline
    /// definitions against the existing type vector.
    fn nested(&mut self, args: &[Sexp], equates: &Equates) -> Result<u32> {
        let unwrapped;
        let args = match args {
            [Sexp::List(children)] => {
                unwrapped = children.clone();
                &unwrapped[..]
            }
            _ => args,
        };
        match self.parse_type(args, equates)? {
            TypeOrRef::Ref(i) => Ok(i),
            TypeOrRef::New(t) => {
                if let Some(i) = self.types.iter().position(|u| *u == t) {
                    return Ok(i as u32);
                }
                self.types.push(t);
                Ok((self.types.len() - 1) as u32)
            }
        }
    }

    fn parse_int(&mut self, args: &[Sexp], equates: &Equates) -> Result<BtfType> {
        if args.len() != 2 {
            return Err(Error::Arity {
                op: "int".to_string(),
                expected: "2 args",
                got: format!("{:?}", args),
            });
        }
        let flags: Vec<&Sexp> = match &args[0] {
            Sexp::List(children) => children.iter().collect(),
            atom => vec![atom],
        };
        let mut encoding = 0;
        for flag in flags {
            let word = flag
                .atom()
                .ok_or_else(|| Error::BadIntEncoding(format!("{:?}", flag)))?;
            encoding |= match word {
                "signed" => int_encoding::SIGNED,
                "unsigned" => 0,
                "char" => int_encoding::CHAR,
                "bool" => int_encoding::BOOL,
                _ => return Err(Error::BadIntEncoding(word.to_string())),
            };
        }
        let bits_text = args[1]
            .atom()
            .ok_or_else(|| Error::BadType(format!("{:?}", args)))?;
        let bits = parse_immediate(bits_text, equates)? as u32;
        Ok(BtfType::Int { encoding, bits })
    }

    fn parse_array(&mut self, args: &[Sexp], equates: &Equates) -> Result<BtfType> {
        if args.len() != 2 {
            return Err(Error::Arity {
                op: "array".to_string(),
                expected: "2 args",
                got: format!("{:?}", args),
            });
        }
        let elem = self.nested(&args[0..1], equates)?;
        let index = self.index_type(equates)?;
        let nelems_text = args[1]
            .atom()
            .ok_or_else(|| Error::BadType(format!("{:?}", args)))?;
        let nelems = parse_immediate(nelems_text, equates)? as u32;
        Ok(BtfType::Array {
            elem,
            index,
            nelems,
        })
    }

    /// The shared array index type, `(int signed 64)`
    fn index_type(&mut self, equates: &Equates) -> Result<u32> {
        let words = [
            Sexp::Atom("int".to_string()),
            Sexp::Atom("signed".to_string()),
            Sexp::Atom("64".to_string()),
        ];
        self.nested(&words, equates)
    }

    fn parse_members(&mut self, args: &[Sexp], equates: &Equates) -> Result<Vec<Member>> {
        let mut members = Vec::new();
        for arg in args {
            let children = match arg {
                Sexp::List(children) if children.len() == 2 => children,
                _ => return Err(Error::BadMember(format!("{:?}", arg))),
            };
            let ty = self.nested(&children[0..1], equates)?;
            let name = children[1]
                .atom()
                .ok_or_else(|| Error::BadMember(format!("{:?}", arg)))?
                .to_string();
            members.push(Member { name, ty });
        }
        Ok(members)
    }

    fn parse_enum(&mut self, args: &[Sexp], equates: &Equates) -> Result<BtfType> {
        let size_text = args
            .first()
            .and_then(Sexp::atom)
            .ok_or_else(|| Error::BadType(format!("{:?}", args)))?;
        let size = parse_immediate(size_text, equates)? as u32;
        let mut members = Vec::new();
        for arg in &args[1..] {
            let children = match arg {
                Sexp::List(children) if children.len() == 2 => children,
                _ => return Err(Error::BadMember(format!("{:?}", arg))),
            };
            let name = children[0]
                .atom()
                .ok_or_else(|| Error::BadMember(format!("{:?}", arg)))?
                .to_string();
            let value_text = children[1]
                .atom()
                .ok_or_else(|| Error::BadMember(format!("{:?}", arg)))?;
            let value = crate::asm::insn::check_s32(parse_immediate(value_text, equates)?)?;
            members.push((name, value));
        }
        Ok(BtfType::Enum { size, members })
    }

    fn type_at(&self, index: u32) -> Result<&BtfType> {
        self.types
            .get(index as usize)
            .ok_or_else(|| Error::internal(format!("type index {} out of range", index)))
    }

    /// Byte size of a type
    pub fn type_size(&self, index: u32) -> Result<u64> {
        self.size_inner(index, &mut Vec::new())
    }

    fn size_inner(&self, index: u32, stack: &mut Vec<u32>) -> Result<u64> {
        // A cycle can only arise through a forward declaration that was
        // overwritten with a definition referring back to itself.
        if stack.contains(&index) {
            return Err(Error::ForwardSize);
        }
        stack.push(index);
        let size = match self.type_at(index)? {
            BtfType::Unknown => return Err(Error::VoidSize),
            BtfType::Int { bits, .. } => (*bits as u64 + 7) / 8,
            BtfType::Pointer { .. } => 8,
            BtfType::Array { elem, nelems, .. } => {
                *nelems as u64 * self.size_inner(*elem, stack)?
            }
            BtfType::Struct { members } => {
                let (_, bits) = self.layout_inner(members, stack)?;
                (bits + 7) / 8
            }
            BtfType::Union { members } => {
                let mut max = 0;
                for m in members {
                    max = max.max(self.size_inner(m.ty, stack)?);
                }
                max
            }
            BtfType::Enum { size, .. } => *size as u64,
            BtfType::Forward => return Err(Error::ForwardSize),
            BtfType::Typedef { ty }
            | BtfType::Volatile { ty }
            | BtfType::Const { ty }
            | BtfType::Restrict { ty } => self.size_inner(*ty, stack)?,
        };
        stack.pop();
        Ok(size)
    }

    fn size_bits_inner(&self, index: u32, stack: &mut Vec<u32>) -> Result<u64> {
        // Only ints may occupy a non-byte-aligned width
        if let BtfType::Int { bits, .. } = self.type_at(index)? {
            return Ok(*bits as u64);
        }
        Ok(self.size_inner(index, stack)? * 8)
    }

    /// Member bit offsets and total bit length for a struct layout.
    /// If the running offset is unaligned and the next member is not an
    /// int (the only kind that may be a bitfield), it rounds up to the
    /// next byte.
    fn layout_inner(&self, members: &[Member], stack: &mut Vec<u32>) -> Result<(Vec<u32>, u64)> {
        let mut bits_offset: u64 = 0;
        let mut offsets = Vec::with_capacity(members.len());
        for m in members {
            let is_int = matches!(self.type_at(m.ty)?, BtfType::Int { .. });
            if bits_offset % 8 != 0 && !is_int {
                bits_offset = (bits_offset & !7) + 8;
            }
            offsets.push(bits_offset as u32);
            bits_offset += self.size_bits_inner(m.ty, stack)?;
        }
        Ok((offsets, bits_offset))
    }

    /// Member bit offsets of the struct at `index`
    pub fn member_bit_offsets(&self, index: u32) -> Result<Vec<u32>> {
        match self.type_at(index)? {
            BtfType::Struct { members } => {
                let mut stack = vec![index];
                Ok(self.layout_inner(members, &mut stack)?.0)
            }
            _ => Err(Error::internal(format!("type {} is not a struct", index))),
        }
    }

    /// Serialize the section: type records then the string table, behind
    /// the fixed 24-byte header.
    pub fn resolve_symbols(&mut self) -> Result<()> {
        let mut names: Vec<u8> = vec![0];
        let mut add_name = |names: &mut Vec<u8>, name: &str| -> u32 {
            let off = names.len() as u32;
            names.extend_from_slice(name.as_bytes());
            names.push(0);
            off
        };
        // Member names first, in type-traversal order
        let mut member_offs: Vec<Vec<u32>> = Vec::with_capacity(self.types.len());
        for t in &self.types {
            let offs = match t {
                BtfType::Struct { members } | BtfType::Union { members } => members
                    .iter()
                    .map(|m| add_name(&mut names, &m.name))
                    .collect(),
                BtfType::Enum { members, .. } => members
                    .iter()
                    .map(|(n, _)| add_name(&mut names, n))
                    .collect(),
                _ => Vec::new(),
            };
            member_offs.push(offs);
        }
        // Then top-level type names
        let mut name_offs = vec![0u32; self.types.len()];
        for (name, ti) in &self.named {
            name_offs[*ti] = add_name(&mut names, name);
        }
        let mut records = Vec::new();
        for (i, t) in self.types.iter().enumerate() {
            self.encode_type(t, name_offs[i], &member_offs[i], &mut records)?;
        }
        let mut section = Vec::with_capacity(24 + records.len() + names.len());
        section.extend_from_slice(&BTF_MAGIC.to_le_bytes());
        section.push(BTF_VERSION);
        section.push(0); // flags
        section.extend_from_slice(&BTF_HDR_LEN.to_le_bytes());
        section.extend_from_slice(&0u32.to_le_bytes()); // type_off
        section.extend_from_slice(&(records.len() as u32).to_le_bytes());
        section.extend_from_slice(&(records.len() as u32).to_le_bytes()); // str_off
        section.extend_from_slice(&(names.len() as u32).to_le_bytes());
        section.extend_from_slice(&records);
        section.extend_from_slice(&names);
        self.section = section;
        Ok(())
    }

    fn encode_type(
        &self,
        t: &BtfType,
        name_off: u32,
        member_offs: &[u32],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let push_u32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());
        let ti: u32 = match t {
            // void owns no record bytes at all
            BtfType::Unknown => return Ok(()),
            BtfType::Int { bits, .. } => (*bits + 7) / 8,
            BtfType::Pointer { ty } => *ty,
            BtfType::Array { .. } => 0,
            BtfType::Struct { members } => {
                let (_, bits) = self.layout_inner(members, &mut Vec::new())?;
                ((bits + 7) / 8) as u32
            }
            BtfType::Union { .. } => self.union_size(t)? as u32,
            BtfType::Enum { size, .. } => *size,
            BtfType::Forward => 0,
            BtfType::Typedef { ty }
            | BtfType::Volatile { ty }
            | BtfType::Const { ty }
            | BtfType::Restrict { ty } => *ty,
        };
        push_u32(out, name_off);
        push_u32(out, ((t.kind() as u32) << 24) | (t.vlen() as u32));
        push_u32(out, ti);
        match t {
            BtfType::Int { encoding, bits } => {
                push_u32(out, (encoding << 24) | (bits & 0xff));
            }
            BtfType::Array {
                elem,
                index,
                nelems,
            } => {
                push_u32(out, *elem);
                push_u32(out, *index);
                push_u32(out, *nelems);
            }
            BtfType::Struct { members } => {
                let (offsets, _) = self.layout_inner(members, &mut Vec::new())?;
                for ((m, bit_off), name) in members.iter().zip(offsets).zip(member_offs) {
                    push_u32(out, *name);
                    push_u32(out, m.ty);
                    push_u32(out, bit_off);
                }
            }
            BtfType::Union { members } => {
                for (m, name) in members.iter().zip(member_offs) {
                    push_u32(out, *name);
                    push_u32(out, m.ty);
                    push_u32(out, 0);
                }
            }
            BtfType::Enum { members, .. } => {
                for ((_, value), name_off) in members.iter().zip(member_offs) {
                    push_u32(out, *name_off);
                    push_u32(out, *value as u32);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn union_size(&self, t: &BtfType) -> Result<u64> {
        match t {
            BtfType::Union { members } => {
                let mut max = 0;
                for m in members {
                    max = max.max(self.type_size(m.ty)?);
                }
                Ok(max)
            }
            _ => Err(Error::internal("union_size on non-union".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(asm: &mut BtfAssembler, line: &str) {
        asm.feed_line(line, &Equates::new()).unwrap();
    }

    #[test]
    fn nested_types_deduplicate() {
        let mut asm = BtfAssembler::new();
        feed(&mut asm, "u32: int unsigned 32");
        feed(&mut asm, "p1: * u32");
        feed(&mut asm, "p2: * (int unsigned 32)");
        // p2's inline int folds onto the named u32
        assert_eq!(
            asm.types[asm.named_index("p1").unwrap()],
            asm.types[asm.named_index("p2").unwrap()]
        );
    }

    #[test]
    fn forward_overwrite_allowed() {
        let mut asm = BtfAssembler::new();
        feed(&mut asm, "node: ...");
        feed(&mut asm, "pnode: * node");
        feed(&mut asm, "node: struct ((int signed 32) v) ((* node) next)");
        let ni = asm.named_index("node").unwrap();
        assert!(matches!(asm.types[ni], BtfType::Struct { .. }));
        // but a second full definition is rejected
        let err = asm
            .feed_line("node: int signed 8", &Equates::new())
            .unwrap_err();
        assert!(err.to_string().starts_with("Duplicate type"));
    }

    #[test]
    fn bitfield_layout() {
        let mut asm = BtfAssembler::new();
        feed(
            &mut asm,
            "bits: struct ((int unsigned 3) x) ((int unsigned 5) y) ((int unsigned 8) z)",
        );
        let si = asm.named_index("bits").unwrap() as u32;
        assert_eq!(asm.member_bit_offsets(si).unwrap(), vec![0, 3, 8]);
        assert_eq!(asm.type_size(si).unwrap(), 2);
    }

    #[test]
    fn bitfield_pads_before_non_int() {
        let mut asm = BtfAssembler::new();
        feed(&mut asm, "u8p: * (int unsigned 8)");
        feed(
            &mut asm,
            "mix: struct ((int unsigned 3) x) ((u8p) p) ((int unsigned 1) t)",
        );
        let si = asm.named_index("mix").unwrap() as u32;
        // the pointer rounds 3 bits up to the next byte
        assert_eq!(asm.member_bit_offsets(si).unwrap(), vec![0, 8, 72]);
    }

    #[test]
    fn forward_has_no_size() {
        let mut asm = BtfAssembler::new();
        feed(&mut asm, "later: ...");
        let i = asm.named_index("later").unwrap() as u32;
        assert!(matches!(asm.type_size(i), Err(Error::ForwardSize)));
    }

    #[test]
    fn array_size_multiplies() {
        let mut asm = BtfAssembler::new();
        feed(&mut asm, "quad: array (int unsigned 16) 4");
        let i = asm.named_index("quad").unwrap() as u32;
        assert_eq!(asm.type_size(i).unwrap(), 8);
    }

    #[test]
    fn section_header_fields() {
        let mut asm = BtfAssembler::new();
        feed(&mut asm, "u8: int unsigned 8");
        asm.resolve_symbols().unwrap();
        let bin = asm.binary();
        assert_eq!(u16::from_le_bytes([bin[0], bin[1]]), BTF_MAGIC);
        assert_eq!(bin[2], 1);
        assert_eq!(bin[3], 0);
        let hdr_len = u32::from_le_bytes(bin[4..8].try_into().unwrap());
        assert_eq!(hdr_len, 24);
        let type_len = u32::from_le_bytes(bin[12..16].try_into().unwrap());
        let str_off = u32::from_le_bytes(bin[16..20].try_into().unwrap());
        let str_len = u32::from_le_bytes(bin[20..24].try_into().unwrap());
        // one int record: 3 header words plus the int data word
        assert_eq!(type_len, 16);
        assert_eq!(str_off, type_len);
        assert_eq!(bin.len() as u32, 24 + type_len + str_len);
        // string table: NUL, then "void" and "u8"
        let strings = &bin[24 + type_len as usize..];
        assert_eq!(strings[0], 0);
        assert!(strings.windows(5).any(|w| w == b"void\0"));
        assert!(strings.windows(3).any(|w| w == b"u8\0"));
    }
}
