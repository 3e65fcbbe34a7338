//! Kept to a single test: the live-object counter is process-wide.

use std::thread;

use tefuse::refcount::live_objects;
use tefuse::{fuse_tensor_exprs, parse_graph, FuserConfig, Graph, Ref};

#[test]
#[cfg(debug_assertions)]
fn fusing_and_dropping_graphs_leaks_nothing() {
    let baseline = live_objects();
    {
        let mut graph = parse_graph(
            r#"
            graph(%x : Float(8:1, device=cuda:0)):
              %a : Float(8:1, device=cuda:0) = aten::neg(%x)
              %b : Float(8:1, device=cuda:0) = aten::exp(%a)
              %c : Float(8:1, device=cuda:0) = aten::relu(%b)
              return (%c)
            "#,
        )
        .unwrap();
        fuse_tensor_exprs(&mut graph, &FuserConfig::default()).unwrap();
        let copy = graph.clone();
        assert!(live_objects() > baseline);
        drop(copy);
    }
    assert_eq!(live_objects(), baseline);

    // Shared subgraphs cloned and dropped from several threads at once.
    {
        let mut graph = parse_graph(
            r#"
            graph(%x : Float(8:1, device=cuda:0), %y : Float(8:1, device=cuda:0)):
              %a : Float(8:1, device=cuda:0) = aten::mul(%x, %y)
              %b : Float(8:1, device=cuda:0) = aten::sigmoid(%a)
              return (%b)
            "#,
        )
        .unwrap();
        fuse_tensor_exprs(&mut graph, &FuserConfig::default()).unwrap();
        let subgraph = graph
            .nodes_in_order()
            .find_map(|node| node.subgraph.clone())
            .expect("fused group");
        let before = live_objects();
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1_000 {
                        let shared = subgraph.clone();
                        let owned = Graph::clone(&graph);
                        drop(shared);
                        drop(owned);
                    }
                });
            }
        });
        assert_eq!(Ref::count(&subgraph), 2);
        assert_eq!(live_objects(), before);
        drop(subgraph);
    }
    assert_eq!(live_objects(), baseline);
    assert_eq!(baseline, 0);
    assert!(tefuse::refcount::check_no_live_objects());
}
