#![cfg(unix)]
use std::{
    alloc::{GlobalAlloc, Layout},
    collections::HashMap,
};

#[global_allocator]
static A: tagheap::GlobalTagHeap = tagheap::GlobalTagHeap::INIT;

#[test]
fn foo() {
    println!("hello");
}

#[test]
fn map() {
    let mut m = HashMap::new();
    m.insert(1, 2);
    m.insert(5, 3);
    drop(m);
}

#[test]
fn strings() {
    let _ = format!("foo, bar, {}", "baz");
}

#[test]
fn threads() {
    assert!(std::thread::spawn(|| panic!()).join().is_err());
}

#[test]
fn many_threads() {
    let handles: Vec<_> = (0..8)
        .map(|i| {
            std::thread::spawn(move || {
                let mut v = Vec::new();
                for k in 0..1000 {
                    v.push(vec![i as u8; k % 300 + 1]);
                    if k % 3 == 0 {
                        v.swap_remove(k % v.len());
                    }
                }
                v.iter().map(|x| x.len()).sum::<usize>()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap() > 0);
    }
    assert!(A.check());
}

#[test]
fn word_alignment() {
    for size in 1..200 {
        let b = vec![0u8; size].into_boxed_slice();
        assert_eq!(b.as_ptr() as usize % tagheap::GRANULARITY, 0);
    }
}

#[test]
fn test_larger_than_word_alignment() {
    use std::mem;

    // Align to 32 bytes.
    #[repr(align(32))]
    struct Align32(u8);

    assert_eq!(mem::align_of::<Align32>(), 32);

    for _ in 0..1000 {
        let b = Box::new(Align32(42));

        let p = Box::into_raw(b);
        assert_eq!(p as usize % 32, 0, "{:p} should be aligned to 32", p);

        unsafe {
            let b = Box::from_raw(p);
            assert_eq!(b.0, 42);
        }
    }
}

#[test]
fn channel_round_trip() {
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || {
        for i in 0..1000u32 {
            tx.send(vec![i; (i % 50) as usize + 1]).unwrap();
        }
    });
    for i in 0..1000u32 {
        assert_eq!(rx.recv().unwrap(), vec![i; (i % 50) as usize + 1]);
    }
    handle.join().unwrap();
    assert!(A.check());
}

#[test]
fn large_alignment_layouts() {
    for shift in 0..13 {
        let align = 1usize << shift;
        let layout = Layout::from_size_align(100, align).unwrap();
        unsafe {
            let p = A.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "{:p} should be aligned to {}", p, align);
            p.write_bytes(0x5a, 100);

            let p = A.realloc(p, layout, 5000);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "{:p} should be aligned to {}", p, align);
            assert!(std::slice::from_raw_parts(p, 100).iter().all(|&x| x == 0x5a));
            A.dealloc(p, Layout::from_size_align(5000, align).unwrap());

            let p = A.alloc_zeroed(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "{:p} should be aligned to {}", p, align);
            assert!(std::slice::from_raw_parts(p, 100).iter().all(|&x| x == 0));
            A.dealloc(p, layout);
        }
    }
    assert!(A.check());
}

#[test]
fn alloc_zeroed() {
    let layout = Layout::from_size_align(1000, 8).unwrap();
    unsafe {
        let p = A.alloc(layout);
        assert!(!p.is_null());
        p.write_bytes(0xff, 1000);
        A.dealloc(p, layout);

        let p = A.alloc_zeroed(layout);
        assert!(!p.is_null());
        assert!(std::slice::from_raw_parts(p, 1000).iter().all(|&x| x == 0));
        A.dealloc(p, layout);
    }
}

#[test]
fn realloc_preserves_contents() {
    let mut v: Vec<u32> = Vec::new();
    for i in 0..10000 {
        v.push(i);
    }
    assert!(v.iter().enumerate().all(|(i, &x)| x == i as u32));
    v.truncate(10);
    v.shrink_to_fit();
    assert_eq!(v, (0..10).collect::<Vec<_>>());
}

#[test]
fn cannot_alloc_max_usize_minus_some() {
    // The test should complete without causing OOM
    for offset in (0..64).step_by(8) {
        let layout = Layout::from_size_align(isize::MAX as usize - offset, 1).unwrap();
        for _ in 0..10000 {
            let result = unsafe { A.alloc(layout) };
            assert!(result.is_null());
        }
    }
    assert!(A.check());
}
