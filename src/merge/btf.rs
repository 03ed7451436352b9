//! BTF type graphs as annotated directed graphs
//!
//! The annotation of a node is the kind-dependent tuple without its
//! references: bare kind for pointers, typedefs and qualifiers; kind plus
//! element count for arrays; kind plus ordered member names for structs and
//! unions; the full tuple for ints, enums, forwards and the void sentinel.
//! A top-level type name participates in annotation equality, except that
//! an empty name on either side matches anything.

use crate::asm::btf::{BtfType, Member};
use crate::error::{Error, Result};
use crate::merge::adg::Adg;

/// Annotation shape: everything about a type except its references
#[derive(Debug, Clone, PartialEq)]
pub enum AnnoShape {
    /// The void sentinel
    Unknown,
    /// Integer, full tuple
    Int {
        /// Encoding bitmask
        encoding: u32,
        /// Width in bits
        bits: u32,
    },
    /// Pointer; the referent travels as an edge
    Pointer,
    /// Array with its element count; the element travels as an edge
    Array {
        /// Element count
        nelems: u32,
    },
    /// Struct member names in order; member types travel as edges
    Struct {
        /// Member names
        member_names: Vec<String>,
    },
    /// Union member names in order; member types travel as edges
    Union {
        /// Member names
        member_names: Vec<String>,
    },
    /// Enum, full tuple
    Enum {
        /// Byte size
        size: u32,
        /// Named values
        members: Vec<(String, i32)>,
    },
    /// Forward declaration
    Forward,
    /// Typedef; the referent travels as an edge
    Typedef,
    /// Volatile qualifier
    Volatile,
    /// Const qualifier
    Const,
    /// Restrict qualifier
    Restrict,
}

/// A BTF node annotation: optional top-level name plus the shape
#[derive(Debug, Clone)]
pub struct BtfAnno {
    /// Top-level type name, if any
    pub name: Option<String>,
    /// Kind-dependent shape
    pub shape: AnnoShape,
}

impl PartialEq for BtfAnno {
    fn eq(&self, other: &Self) -> bool {
        if self.shape != other.shape {
            return false;
        }
        // A name mismatch disqualifies only when both sides carry one.
        match (&self.name, &other.name) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

fn annotate(name: Option<&String>, ty: &BtfType) -> BtfAnno {
    let shape = match ty {
        BtfType::Unknown => AnnoShape::Unknown,
        BtfType::Int { encoding, bits } => AnnoShape::Int {
            encoding: *encoding,
            bits: *bits,
        },
        BtfType::Pointer { .. } => AnnoShape::Pointer,
        BtfType::Array { nelems, .. } => AnnoShape::Array { nelems: *nelems },
        BtfType::Struct { members } => AnnoShape::Struct {
            member_names: members.iter().map(|m| m.name.clone()).collect(),
        },
        BtfType::Union { members } => AnnoShape::Union {
            member_names: members.iter().map(|m| m.name.clone()).collect(),
        },
        BtfType::Enum { size, members } => AnnoShape::Enum {
            size: *size,
            members: members.clone(),
        },
        BtfType::Forward => AnnoShape::Forward,
        BtfType::Typedef { .. } => AnnoShape::Typedef,
        BtfType::Volatile { .. } => AnnoShape::Volatile,
        BtfType::Const { .. } => AnnoShape::Const,
        BtfType::Restrict { .. } => AnnoShape::Restrict,
    };
    BtfAnno {
        name: name.cloned(),
        shape,
    }
}

/// Build the graph for one BTF type vector. Reference-carrying kinds
/// contribute one edge per referent, in member order; the array index type
/// is not carried as an edge.
pub fn btf_to_adg(types: &[(Option<String>, BtfType)]) -> Adg<BtfAnno> {
    let mut g = Adg::new();
    for (name, ty) in types {
        g.add_node(annotate(name.as_ref(), ty));
    }
    for (i, (_, ty)) in types.iter().enumerate() {
        match ty {
            BtfType::Pointer { ty }
            | BtfType::Typedef { ty }
            | BtfType::Volatile { ty }
            | BtfType::Const { ty }
            | BtfType::Restrict { ty } => g.link(i, *ty as usize),
            BtfType::Array { elem, .. } => g.link(i, *elem as usize),
            BtfType::Struct { members } | BtfType::Union { members } => {
                for m in members {
                    g.link(i, m.ty as usize);
                }
            }
            _ => {}
        }
    }
    g
}

fn node_to_type(g: &Adg<BtfAnno>, index: usize) -> Result<(Option<String>, BtfType)> {
    let node = &g.nodes[index];
    let outs = g.outs_of(index)?;
    let single = |what: &str| -> Result<u32> {
        match outs.as_slice() {
            [t] => Ok(*t as u32),
            _ => Err(Error::internal(format!(
                "{} node {} has {} edges",
                what,
                index,
                outs.len()
            ))),
        }
    };
    let ty = match &node.anno.shape {
        AnnoShape::Unknown => BtfType::Unknown,
        AnnoShape::Int { encoding, bits } => BtfType::Int {
            encoding: *encoding,
            bits: *bits,
        },
        AnnoShape::Pointer => BtfType::Pointer {
            ty: single("pointer")?,
        },
        // The merged graph does not track the index type; it is re-emitted
        // as the void index.
        AnnoShape::Array { nelems } => BtfType::Array {
            elem: single("array")?,
            index: 0,
            nelems: *nelems,
        },
        AnnoShape::Struct { member_names } | AnnoShape::Union { member_names } => {
            if member_names.len() != outs.len() {
                return Err(Error::internal(format!(
                    "aggregate node {} member/edge mismatch",
                    index
                )));
            }
            let members = member_names
                .iter()
                .zip(&outs)
                .map(|(n, &t)| Member {
                    name: n.clone(),
                    ty: t as u32,
                })
                .collect();
            match &node.anno.shape {
                AnnoShape::Struct { .. } => BtfType::Struct { members },
                _ => BtfType::Union { members },
            }
        }
        AnnoShape::Enum { size, members } => BtfType::Enum {
            size: *size,
            members: members.clone(),
        },
        AnnoShape::Forward => BtfType::Forward,
        AnnoShape::Typedef => BtfType::Typedef {
            ty: single("typedef")?,
        },
        AnnoShape::Volatile => BtfType::Volatile {
            ty: single("volatile")?,
        },
        AnnoShape::Const => BtfType::Const {
            ty: single("const")?,
        },
        AnnoShape::Restrict => BtfType::Restrict {
            ty: single("restrict")?,
        },
    };
    Ok((node.anno.name.clone(), ty))
}

/// Merges BTF type vectors into one minimal equivalent vector
#[derive(Debug, Default)]
pub struct BtfMerger {
    graph: Adg<BtfAnno>,
}

impl BtfMerger {
    /// Create an empty merger
    pub fn new() -> BtfMerger {
        BtfMerger::default()
    }

    /// Absorb one type vector, returning each input type's merged index
    pub fn merge(&mut self, types: &[(Option<String>, BtfType)]) -> Result<Vec<usize>> {
        let src = btf_to_adg(types);
        self.graph.merge(&src)
    }

    /// The current merged graph
    pub fn graph(&self) -> &Adg<BtfAnno> {
        &self.graph
    }

    /// The unified type vector
    pub fn types(&self) -> Result<Vec<(Option<String>, BtfType)>> {
        (0..self.graph.nodes.len())
            .map(|i| node_to_type(&self.graph, i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str, ty: BtfType) -> (Option<String>, BtfType) {
        (Some(name.to_string()), ty)
    }

    fn anon(ty: BtfType) -> (Option<String>, BtfType) {
        (None, ty)
    }

    #[test]
    fn identical_inputs_do_not_grow() {
        let types = vec![
            anon(BtfType::Unknown),
            named(
                "u32",
                BtfType::Int {
                    encoding: 0,
                    bits: 32,
                },
            ),
            named("pu32", BtfType::Pointer { ty: 1 }),
        ];
        let mut m = BtfMerger::new();
        m.merge(&types).unwrap();
        assert_eq!(m.graph().nodes.len(), 3);
        m.merge(&types).unwrap();
        assert_eq!(m.graph().nodes.len(), 3);
    }

    #[test]
    fn one_sided_empty_name_matches() {
        let a = BtfAnno {
            name: Some("x".to_string()),
            shape: AnnoShape::Pointer,
        };
        let b = BtfAnno {
            name: None,
            shape: AnnoShape::Pointer,
        };
        let c = BtfAnno {
            name: Some("y".to_string()),
            shape: AnnoShape::Pointer,
        };
        assert!(a == b);
        assert!(b == a);
        assert!(a != c);
    }

    #[test]
    fn cyclic_structs_merge_minimally() {
        // struct node { s32 v; struct node *next; } as a self-cycle
        let types = vec![
            anon(BtfType::Int {
                encoding: 1,
                bits: 32,
            }),
            named(
                "node",
                BtfType::Struct {
                    members: vec![
                        Member {
                            name: "v".to_string(),
                            ty: 0,
                        },
                        Member {
                            name: "next".to_string(),
                            ty: 2,
                        },
                    ],
                },
            ),
            anon(BtfType::Pointer { ty: 1 }),
        ];
        let mut m = BtfMerger::new();
        m.merge(&types).unwrap();
        m.merge(&types).unwrap();
        assert_eq!(m.graph().nodes.len(), 3);
        let back = m.types().unwrap();
        assert!(matches!(back[1].1, BtfType::Struct { .. }));
        assert_eq!(back[1].0.as_deref(), Some("node"));
    }
}
