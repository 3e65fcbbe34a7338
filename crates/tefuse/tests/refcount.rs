use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tefuse::{Ref, RefCount, RefCounted};

struct Node {
    refs: RefCount,
    payload: u64,
    destroyed: Arc<AtomicUsize>,
}

unsafe impl RefCounted for Node {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

fn node(payload: u64) -> (Ref<Node>, Arc<AtomicUsize>) {
    let destroyed = Arc::new(AtomicUsize::new(0));
    let handle = Ref::new(Node {
        refs: RefCount::new(),
        payload,
        destroyed: Arc::clone(&destroyed),
    });
    (handle, destroyed)
}

#[test]
fn many_acquires_and_releases_destroy_once() {
    let (handle, destroyed) = node(7);
    let ptr = Ref::into_raw(handle);
    for _ in 0..100 {
        unsafe { Ref::acquire(ptr) };
    }
    assert_eq!(unsafe { ptr.as_ref() }.refs.get(), 101);
    for _ in 0..100 {
        unsafe { Ref::release(ptr) };
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    }
    let last = unsafe { Ref::from_raw(ptr) };
    assert!(Ref::is_unique(&last));
    assert_eq!(last.payload, 7);
    drop(last);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_clones_and_drops_destroy_once() {
    let (handle, destroyed) = node(1);
    thread::scope(|scope| {
        for _ in 0..8 {
            let local = handle.clone();
            scope.spawn(move || {
                let mut held = Vec::with_capacity(64);
                for round in 0..1_000 {
                    held.push(local.clone());
                    if round % 3 == 0 {
                        held.clear();
                    }
                }
                assert_eq!(local.payload, 1);
            });
        }
    });
    assert_eq!(Ref::count(&handle), 1);
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    drop(handle);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn last_release_on_another_thread_destroys() {
    let (handle, destroyed) = node(3);
    let other = handle.clone();
    drop(handle);
    thread::spawn(move || drop(other)).join().unwrap();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn make_mut_copies_shared_graphs() {
    let mut graph = Ref::new(tefuse::Graph::new());
    let shared = graph.clone();
    Ref::make_mut(&mut graph).add_input("x", tefuse::ir::ValueType::Int);
    assert!(!Ref::ptr_eq(&graph, &shared));
    assert_eq!(graph.inputs().len(), 1);
    assert!(shared.inputs().is_empty());
    assert!(Ref::is_unique(&shared));
}
