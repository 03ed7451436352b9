//! Graph merging
//!
//! `adg` is the generic annotated-directed-graph merger; `btf` bridges BTF
//! type vectors onto it.

pub mod adg;
pub mod btf;

pub use adg::{Adg, EdgeTarget, Node};
pub use btf::{AnnoShape, BtfAnno, BtfMerger};
