//! Fork scenarios run against the hosted kernel.

use std::sync::atomic::{AtomicBool, Ordering};

use skerry_common::memlayout::{page_round_down, PGSIZE, USTACKTOP, UTEXT, UXSTACKTOP, WORD_SIZE};
use skerry_common::{Access, EnvId, FaultError, PageState, SysError, UserFaultRecord};
use skerry_kernel::testutil::Harness;
use skerry_sdk::{fork, page_alloc, page_map, pgfault, set_pgfault_handler, sfork, UserRuntime};

const DATA: u64 = UTEXT + 16 * PGSIZE;
const DATA2: u64 = DATA + PGSIZE;
const SHARED: u64 = DATA + 2 * PGSIZE;
const STACK: u64 = USTACKTOP - PGSIZE;

fn rw() -> skerry_common::PteFlags {
    PageState::Private(Access::ReadWrite).flags()
}

fn state(h: &mut Harness, env: EnvId, va: u64) -> Option<PageState> {
    h.process(env).pte(va).and_then(|pte| pte.state())
}

/// A booted kernel with one environment owning a writable page at `DATA`
/// full of 0x41.
fn parent() -> (Harness, EnvId) {
    let mut h = Harness::boot(1);
    let parent = h.spawn().unwrap();
    let mut p = h.process(parent);
    page_alloc(&mut p, EnvId::CURRENT, DATA, rw()).unwrap();
    p.write(DATA, &[0x41; PGSIZE as usize]).unwrap();
    (h, parent)
}

#[test]
fn test_child_write_is_private() {
    let (mut h, parent) = parent();
    let child = fork(&mut h.process(parent)).unwrap();
    assert!(!child.is_current());

    {
        let mut c = h.process(child);
        assert_eq!(fork(&mut c), Ok(EnvId::CURRENT));
        assert_eq!(c.this_env(), child);
        let mut page = [0u8; PGSIZE as usize];
        c.read(DATA, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 0x41));
        c.write_u8(DATA, 0x42).unwrap();
    }

    assert_eq!(h.process(parent).read_u8(DATA), Ok(0x41));
    assert_eq!(h.process(child).read_u8(DATA), Ok(0x42));
    assert_eq!(h.process(child).read_u8(DATA + 1), Ok(0x41));
    assert_eq!(state(&mut h, parent, DATA), Some(PageState::CopyOnWrite));
    assert_eq!(state(&mut h, child, DATA), Some(PageState::Private(Access::ReadWrite)));
}

#[test]
fn test_fork_out_of_memory_destroys_child() {
    let (mut h, parent) = parent();
    set_pgfault_handler(&mut h.process(parent), pgfault).unwrap();
    let envs = h.kernel.envs.iter().count();

    let mut hoard = Vec::new();
    while let Ok(pfn) = h.kernel.memory.alloc_zeroed() {
        hoard.push(pfn);
    }
    // the child exists by the time its exception stack cannot be allocated
    assert_eq!(fork(&mut h.process(parent)), Err(SysError::NoMem));
    assert_eq!(h.kernel.envs.iter().count(), envs);
    assert_eq!(h.process(parent).read_u8(DATA), Ok(0x41));

    for pfn in hoard {
        h.kernel.memory.decref(pfn);
    }
    h.process(parent).write_u8(DATA, 0x42).unwrap();
    assert_eq!(h.process(parent).read_u8(DATA), Ok(0x42));
    assert_eq!(state(&mut h, parent, DATA), Some(PageState::Private(Access::ReadWrite)));
}

#[test]
fn test_parent_write_leaves_child_mapping() {
    let (mut h, parent) = parent();
    let child = fork(&mut h.process(parent)).unwrap();
    let before = h.process(child).pte(DATA);

    h.process(parent).write_u8(DATA + 7, 0x99).unwrap();

    assert_eq!(h.process(child).pte(DATA), before);
    assert_eq!(h.process(child).read_u8(DATA + 7), Ok(0x41));
    assert_eq!(h.process(parent).read_u8(DATA + 7), Ok(0x99));
}

#[test]
fn test_fork_sharing_policy() {
    let (mut h, parent) = parent();
    {
        let mut p = h.process(parent);
        page_alloc(&mut p, EnvId::CURRENT, SHARED, PageState::SharedDirect(Access::ReadWrite).flags()).unwrap();
        p.write_u8(SHARED, 1).unwrap();
    }
    let child = fork(&mut h.process(parent)).unwrap();

    for env in [parent, child] {
        assert_eq!(state(&mut h, env, DATA), Some(PageState::CopyOnWrite));
        assert_eq!(state(&mut h, env, STACK), Some(PageState::CopyOnWrite));
        assert_eq!(state(&mut h, env, SHARED), Some(PageState::SharedDirect(Access::ReadWrite)));
        assert_eq!(state(&mut h, env, UTEXT), Some(PageState::Private(Access::ReadOnly)));
    }
    // the child's exception stack is its own
    assert_eq!(state(&mut h, child, UXSTACKTOP - PGSIZE), Some(PageState::Private(Access::ReadWrite)));
    let frame = |h: &mut Harness, env: EnvId| h.process(env).pte(UXSTACKTOP - PGSIZE).map(|pte| pte.frame());
    assert_ne!(frame(&mut h, parent), frame(&mut h, child));

    h.process(child).write_u8(SHARED, 2).unwrap();
    assert_eq!(h.process(parent).read_u8(SHARED), Ok(2));
    h.process(parent).write_u8(SHARED + 1, 3).unwrap();
    assert_eq!(h.process(child).read_u8(SHARED + 1), Ok(3));
}

#[test]
fn test_write_to_read_only_page_kills_only_the_writer() {
    let (mut h, parent) = parent();
    let child = fork(&mut h.process(parent)).unwrap();
    h.machine.take_output();

    let err = h.process(child).write_u8(UTEXT, 0xcc);
    assert!(err.is_err());
    assert!(!h.alive(child));
    assert!(h.alive(parent));

    let out = h.machine.take_output();
    assert!(out.contains("user panic in page fault handler"), "{out}");
    assert!(out.contains("is not a write to a copy-on-write page"), "{out}");
    assert_eq!(h.process(parent).read_u8(DATA), Ok(0x41));
    assert_eq!(state(&mut h, parent, DATA), Some(PageState::CopyOnWrite));
}

#[test]
fn test_refork_keeps_every_side_copy_on_write() {
    let (mut h, parent) = parent();
    let first = fork(&mut h.process(parent)).unwrap();
    let second = fork(&mut h.process(parent)).unwrap();

    for env in [parent, first, second] {
        assert_eq!(state(&mut h, env, DATA), Some(PageState::CopyOnWrite));
    }
    h.process(parent).write_u8(DATA, 0x50).unwrap();
    h.process(second).write_u8(DATA, 0x52).unwrap();

    assert_eq!(h.process(first).read_u8(DATA), Ok(0x41));
    assert_eq!(h.process(parent).read_u8(DATA), Ok(0x50));
    assert_eq!(h.process(second).read_u8(DATA), Ok(0x52));
}

#[test]
fn test_sfork_shares_all_but_the_stack() {
    let (mut h, parent) = parent();
    h.process(parent).write_u8(STACK, 0x10).unwrap();
    let child = sfork(&mut h.process(parent)).unwrap();
    assert_eq!(sfork(&mut h.process(child)), Ok(EnvId::CURRENT));

    h.process(child).write_u8(DATA, 0x77).unwrap();
    assert_eq!(h.process(parent).read_u8(DATA), Ok(0x77));
    h.process(parent).write_u8(DATA + 1, 0x78).unwrap();
    assert_eq!(h.process(child).read_u8(DATA + 1), Ok(0x78));

    h.process(child).write_u8(STACK, 0x20).unwrap();
    assert_eq!(h.process(parent).read_u8(STACK), Ok(0x10));
    assert_eq!(state(&mut h, parent, STACK), Some(PageState::CopyOnWrite));
    // text stays read-only even when shared
    assert_eq!(state(&mut h, child, UTEXT), Some(PageState::Private(Access::ReadOnly)));
}

#[test]
fn test_cow_page_cannot_be_mapped_writable() {
    let (mut h, parent) = parent();
    fork(&mut h.process(parent)).unwrap();
    let mut p = h.process(parent);
    assert_eq!(
        page_map(&mut p, EnvId::CURRENT, DATA, EnvId::CURRENT, DATA2, rw()),
        Err(SysError::Invalid)
    );
}

static NESTED: AtomicBool = AtomicBool::new(false);

/// Touches `DATA2` on the first fault, so that its own copy faults again
/// while the first record is still pending.
fn nesting(rt: &mut dyn UserRuntime, record: &UserFaultRecord) -> Result<(), FaultError> {
    if page_round_down(record.fault_va) == DATA && !NESTED.swap(true, Ordering::SeqCst) {
        rt.copy_page(DATA2, DATA2)?;
    }
    pgfault(rt, record)
}

#[test]
fn test_nested_fault_records_are_one_word_apart() {
    let (mut h, parent) = parent();
    {
        let mut p = h.process(parent);
        page_alloc(&mut p, EnvId::CURRENT, DATA2, rw()).unwrap();
        p.write_u8(DATA2, 0x61).unwrap();
    }
    let child = fork(&mut h.process(parent)).unwrap();
    set_pgfault_handler(&mut h.process(parent), nesting).unwrap();

    h.process(parent).write_u8(DATA + 3, 0x33).unwrap();

    let outer = UXSTACKTOP - UserFaultRecord::SIZE;
    assert_eq!(h.upcalls, vec![outer, outer - UserFaultRecord::SIZE - WORD_SIZE]);

    // the pending outer record survived the nested delivery
    let mut bytes = [0u8; UserFaultRecord::SIZE as usize];
    let env = h.kernel.envs.get(parent).unwrap();
    env.space.read(&h.kernel.memory, outer, &mut bytes).unwrap();
    assert_eq!(UserFaultRecord::from_bytes(&bytes).map(|r| r.fault_va), Some(DATA + 3));

    assert_eq!(h.process(parent).read_u8(DATA + 3), Ok(0x33));
    assert_eq!(h.process(parent).read_u8(DATA2), Ok(0x61));
    assert_eq!(state(&mut h, parent, DATA2), Some(PageState::Private(Access::ReadWrite)));
    assert_eq!(h.process(child).read_u8(DATA + 3), Ok(0x41));
}
