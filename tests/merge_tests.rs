//! BTF merger integration tests and merger properties

use ebas::merge::Adg;
use ebas::{BtfAssembler, BtfMerger, BtfType, Equates};
use proptest::prelude::*;

fn btf(source: &str) -> Vec<(Option<String>, BtfType)> {
    let mut asm = BtfAssembler::new();
    for line in source.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        asm.feed_line(line, &Equates::new()).unwrap();
    }
    asm.types()
}

const LIST_NODE: &str = "
node: ...
pnode: * node
node: struct ((int signed 64) v) ((pnode) next)
";

#[test]
fn self_merge_is_idempotent() {
    let types = btf(LIST_NODE);
    let mut m = BtfMerger::new();
    let first = m.merge(&types).unwrap();
    let count = m.graph().nodes.len();
    let second = m.merge(&types).unwrap();
    assert_eq!(m.graph().nodes.len(), count);
    assert_eq!(first, second);
}

#[test]
fn merge_is_monotone() {
    let g1 = btf(LIST_NODE);
    let g2 = btf(
        "
u32: int unsigned 32
pair: struct ((u32) lo) ((u32) hi)
",
    );
    let mut m = BtfMerger::new();
    let map1 = m.merge(&g1).unwrap();
    let map2 = m.merge(&g2).unwrap();
    // every node of both inputs has an image preserving annotation and
    // ordered out-edges
    for (src, map) in [(&g1, &map1), (&g2, &map2)] {
        let src_graph = ebas::merge::btf::btf_to_adg(src);
        for (i, &ui) in map.iter().enumerate() {
            assert_eq!(m.graph().nodes[ui].anno, src_graph.nodes[i].anno);
            let image: Vec<usize> = m.graph().outs_of(ui).unwrap();
            let expect: Vec<usize> = src_graph
                .outs_of(i)
                .unwrap()
                .into_iter()
                .map(|r| map[r])
                .collect();
            assert_eq!(image, expect);
        }
    }
}

#[test]
fn shared_types_fold_across_sources() {
    let g1 = btf("u32: int unsigned 32\npu: * u32\n");
    let g2 = btf("u32: int unsigned 32\npu: * u32\nq: * (* u32)\n");
    let mut m = BtfMerger::new();
    m.merge(&g1).unwrap();
    let before = m.graph().nodes.len();
    m.merge(&g2).unwrap();
    // only the pointer-to-pointer is new
    assert_eq!(m.graph().nodes.len(), before + 1);
}

#[test]
fn anonymous_type_matches_named() {
    // the same struct shape, named in one source and inline in the other
    let g1 = btf("s: struct ((int unsigned 8) x)\n");
    let g2 = btf("p: * (struct ((int unsigned 8) x))\n");
    let mut m = BtfMerger::new();
    m.merge(&g1).unwrap();
    let before = m.graph().nodes.len();
    m.merge(&g2).unwrap();
    // only the pointer is new; the anonymous struct folded onto s
    assert_eq!(m.graph().nodes.len(), before + 1);
}

#[test]
fn conflicting_names_stay_separate() {
    let g1 = btf("a: int unsigned 8\n");
    let g2 = btf("b: int unsigned 8\n");
    let mut m = BtfMerger::new();
    m.merge(&g1).unwrap();
    let before = m.graph().nodes.len();
    m.merge(&g2).unwrap();
    assert_eq!(m.graph().nodes.len(), before + 1);
}

#[test]
fn cyclic_merge_reconstructs_types() {
    let types = btf(LIST_NODE);
    let mut m = BtfMerger::new();
    m.merge(&types).unwrap();
    let merged = m.types().unwrap();
    let node = merged
        .iter()
        .find(|(n, _)| n.as_deref() == Some("node"))
        .unwrap();
    let members = match &node.1 {
        BtfType::Struct { members } => members,
        other => panic!("node is {:?}", other),
    };
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].name, "v");
    assert_eq!(members[1].name, "next");
    // next points at a pointer which points back at the struct
    let next = &merged[members[1].ty as usize].1;
    match next {
        BtfType::Pointer { ty } => {
            assert!(matches!(merged[*ty as usize].1, BtfType::Struct { .. }))
        }
        other => panic!("next is {:?}", other),
    }
}

// ====================
// Merger properties over random graphs
// ====================

fn arb_graph() -> impl Strategy<Value = Adg<String>> {
    // eight distinctly annotated nodes with arbitrary edges, cycles allowed
    proptest::collection::vec((0usize..8, 0usize..8), 0..16).prop_map(|edges| {
        let mut g = Adg::new();
        for i in 0..8 {
            g.add_node(format!("n{}", i));
        }
        for (a, b) in edges {
            g.link(a, b);
        }
        g
    })
}

proptest! {
    #[test]
    fn absorb_twice_changes_nothing(g in arb_graph()) {
        let mut m = Adg::new();
        let map1 = m.merge(&g).unwrap();
        let count = m.nodes.len();
        let map2 = m.merge(&g).unwrap();
        prop_assert_eq!(m.nodes.len(), count);
        prop_assert_eq!(&map1, &map2);
        // the image preserves annotations and ordered out-edges
        for (i, &ui) in map2.iter().enumerate() {
            prop_assert_eq!(&m.nodes[ui].anno, &g.nodes[i].anno);
            let image = m.outs_of(ui).unwrap();
            let expect: Vec<usize> = g.outs_of(i).unwrap().into_iter().map(|r| map2[r]).collect();
            prop_assert_eq!(image, expect);
        }
    }

    #[test]
    fn sequential_absorb_embeds_both(g1 in arb_graph(), g2 in arb_graph()) {
        let mut m = Adg::new();
        let map1 = m.merge(&g1).unwrap();
        let map2 = m.merge(&g2).unwrap();
        for (g, map) in [(&g1, &map1), (&g2, &map2)] {
            for (i, &ui) in map.iter().enumerate() {
                prop_assert_eq!(&m.nodes[ui].anno, &g.nodes[i].anno);
                let image = m.outs_of(ui).unwrap();
                let expect: Vec<usize> =
                    g.outs_of(i).unwrap().into_iter().map(|r| map[r]).collect();
                prop_assert_eq!(image, expect);
            }
        }
    }
}
