//! The process/thread lifecycle.
//!
//! Every task occupies one slot of the fixed task table; the slot index is
//! its tid. Threads of one group share an [`AddressSpace`] and an
//! [`FdTable`] through reference counts, so the last releaser (normally
//! the reap of the group's last thread) tears them down. The parent/child
//! hierarchy is one-directional: parents own a list of child tids, children
//! point back with a bare tid.
//!
//! Lifecycle: spawn/fork/clone create a Runnable task; blocking flips it
//! Runnable ↔ Blocked; `exit` makes it Broken; `waitpid` reaps Broken
//! children and clears their slots.

pub mod image;

use crate::mm::page_table::PageTable;
use crate::mm::Page;
use crate::sync::{SpinLock, wait_until};
use crate::thread::{
    self, Task, TaskRecord, TaskState, WAITPID_WQ, clock, current_record, scheduler, with_current,
};
use crate::vfs::{self, FdTable};
use crate::KernelError;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use roost::addressing::{PAGE_SIZE, Pa, Va, VA_USER_END};
use roost::interrupt::Registers;

/// Number of task-table slots.
pub const NTASK: usize = 64;
/// The init task's tid and group id; orphans are re-parented to it.
pub const INIT_TID: usize = 1;
/// Top of the user stack; one stack page is mapped right below.
pub const USER_STACK_TOP: usize = VA_USER_END;

/// `waitpid` option: report instead of blocking.
pub const W_NOHANG: usize = 1;

/// An address space: the level-4 page table plus the lock serializing
/// mutations to it.
pub struct AddressSpace {
    root_pa: Pa,
    /// The page table. Mutations take this lock; the root's physical
    /// address is cached outside it for the context switch.
    pub table: SpinLock<PageTable>,
}

impl AddressSpace {
    /// A fresh address space with only the kernel half mapped.
    pub fn new() -> Option<Arc<Self>> {
        let table = PageTable::new()?;
        Some(Arc::new(Self {
            root_pa: table.pa(),
            table: SpinLock::new(table),
        }))
    }

    /// The physical address to load into CR3.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.root_pa
    }
}

/// A task's share of its group's resources. `clone` copies the references;
/// `fork` builds new ones.
#[derive(Clone)]
pub struct Process {
    /// The process group id (the group leader's tid).
    pub group_id: usize,
    /// The group's address space.
    pub address_space: Arc<AddressSpace>,
    /// The group's descriptor table.
    pub fdtable: Arc<FdTable>,
}

type Slots = [Option<Arc<TaskRecord>>; NTASK];

/// The task table. This lock is the process-table lock at the top of the
/// locking hierarchy.
static PTABLE: SpinLock<Slots> = SpinLock::new([const { None }; NTASK]);

// Physical address of the console MMIO page, if the platform has one.
static CONSOLE_PA: AtomicUsize = AtomicUsize::new(0);

/// Record the console MMIO frame so process setup can map it.
pub fn register_console_mmio(pa: Pa) {
    CONSOLE_PA.store(pa.into_usize(), Ordering::SeqCst);
}

fn console_pa() -> Option<Pa> {
    Pa::new(CONSOLE_PA.load(Ordering::SeqCst)).filter(|pa| pa.into_usize() != 0)
}

/// The registered console MMIO frame, if any.
pub fn console_mmio() -> Option<Pa> {
    console_pa()
}

/// Look up a live task record by tid.
pub fn find_record(tid: usize) -> Option<Arc<TaskRecord>> {
    let guard = PTABLE.lock();
    let record = guard.get(tid).and_then(|r| r.clone());
    guard.unlock();
    record
}

/// Allocate a fresh task-table slot. The new record starts Blank.
fn allocate_record(
    group_of: impl FnOnce(usize) -> usize,
    parent: usize,
) -> Result<Arc<TaskRecord>, KernelError> {
    let mut guard = PTABLE.lock();
    let slot = guard.iter().skip(1).position(|s| s.is_none()).map(|i| i + 1);
    let r = match slot {
        Some(tid) => {
            let record = TaskRecord::new(tid, group_of(tid), parent);
            guard[tid] = Some(record.clone());
            Ok(record)
        }
        None => Err(KernelError::NoMemory),
    };
    guard.unlock();
    r
}

fn release_record(tid: usize) {
    let mut guard = PTABLE.lock();
    guard[tid] = None;
    guard.unlock();
}

// First code a new user task runs: return to user mode through the saved
// frame.
fn user_task_entry() {
    let regs = with_current(|task| &task.regs as *const Registers);
    unsafe { (*regs).launch() }
}

/// Attach resources and register frame to a Blank record, make it
/// Runnable, and hand it to the scheduler.
fn commit_task(record: Arc<TaskRecord>, process: Process, regs: Registers) {
    let mut resources = record.resources.lock();
    *resources = Some(process.clone());
    resources.unlock();

    let mut task = Task::new(record.clone());
    task.regs = regs;
    task.process = Some(process);
    task.prepare(user_task_entry);

    record.set_state(TaskState::Runnable);
    scheduler::enqueue(task);
}

fn register_child(parent: usize, child: usize) {
    if let Some(parent) = find_record(parent) {
        let mut children = parent.children.lock();
        children.push(child);
        children.unlock();
    }
}

/// Spawn a fresh process running the named program.
///
/// Builds a new address space, loads the image (initfs first, then the
/// on-disk filesystem), maps a stack page at the top of the low half and
/// the console MMIO page, installs the keyboard/console at fds 0-2, and
/// enqueues the task on CPU `tid % ncpu` as a child of init.
pub fn spawn(name: &str) -> Result<usize, KernelError> {
    let aspace = AddressSpace::new().ok_or(KernelError::NoMemory)?;
    let entry = load_named_image(&aspace, name)?;

    let stack = Page::new().ok_or(KernelError::NoMemory)?;
    {
        use crate::mm::page_table::Permission;
        let mut table = aspace.table.lock();
        let r = table.map_page(
            Va::new(USER_STACK_TOP - PAGE_SIZE).unwrap(),
            stack,
            Permission::READ | Permission::WRITE | Permission::USER,
        );
        let r = r.and_then(|_| match console_pa() {
            Some(pa) => table.map_raw(
                Va::new(pa.into_usize()).unwrap(),
                pa,
                Permission::READ | Permission::WRITE | Permission::USER,
            ),
            None => Ok(()),
        });
        table.unlock();
        r?;
    }

    let fdtable = FdTable::new();
    for _ in 0..3 {
        fdtable.install(vfs::console_file())?;
    }

    let record = allocate_record(|tid| tid, INIT_TID)?;
    let tid = record.tid;

    let mut regs = Registers::new();
    regs.frame.rip = entry;
    regs.frame.rsp = USER_STACK_TOP - 8;

    if tid != INIT_TID {
        register_child(INIT_TID, tid);
    }
    commit_task(
        record,
        Process {
            group_id: tid,
            address_space: aspace,
            fdtable,
        },
        regs,
    );
    Ok(tid)
}

fn load_named_image(aspace: &AddressSpace, name: &str) -> Result<usize, KernelError> {
    if let Some(blob) = image::initfs_lookup(name) {
        image::load(aspace, &blob)
    } else {
        let file = crate::nestfs::DiskFile::open(name)?;
        image::load(aspace, &file)
    }
}

// Re-own the frame behind an owned mapping and mint another owner for it,
// leaving the original mapping intact. Read-only sharing across fork.
fn share_frame(pa: Pa) -> Page {
    let original = unsafe { Page::from_pa(pa) };
    let shared = original.clone();
    let _ = original.into_raw();
    shared
}

/// Fork the current process.
///
/// The child gets a byte-copy of every writable user page, shares
/// read-only pages and the console mapping, and holds a duplicated
/// descriptor table. The child's saved frame is the parent's with the
/// return value replaced by 0; the parent receives the child's tid.
pub fn fork() -> Result<usize, KernelError> {
    let (parent_process, parent_regs) = with_current(|task| {
        (
            task.process.clone().expect("fork from a kernel task"),
            task.regs,
        )
    });
    // Children hang off the group, not the individual thread that forked.
    let parent_group = parent_process.group_id;

    let aspace = AddressSpace::new().ok_or(KernelError::NoMemory)?;
    let console = console_pa();

    // Copy or share every user mapping of the parent.
    let mut copy_error = None;
    {
        use crate::mm::page_table::Permission;
        let parent_table = parent_process.address_space.table.lock();
        let mut child_table = aspace.table.lock();
        parent_table.for_each_user(|m| {
            if copy_error.is_some() {
                return;
            }
            let r = if !m.owned() {
                child_table.map_raw(m.va, m.pa, m.permission())
            } else if m.writable() && Some(m.pa) != console {
                match Page::new() {
                    Some(mut page) => {
                        let src = unsafe {
                            core::slice::from_raw_parts(
                                m.pa.into_kva().into_usize() as *const u8,
                                PAGE_SIZE,
                            )
                        };
                        page.inner_mut().copy_from_slice(src);
                        child_table.map_page(m.va, page, m.permission())
                    }
                    None => Err(KernelError::NoMemory),
                }
            } else {
                child_table.map_page(m.va, share_frame(m.pa), m.permission())
            };
            if let Err(e) = r {
                copy_error = Some(e);
            }
        });
        child_table.unlock();
        parent_table.unlock();
    }
    if let Some(e) = copy_error {
        return Err(e);
    }

    let record = allocate_record(|tid| tid, parent_group)?;
    let tid = record.tid;

    let mut regs = parent_regs;
    regs.gprs.rax = 0;

    register_child(parent_group, tid);
    commit_task(
        record,
        Process {
            group_id: tid,
            address_space: aspace,
            fdtable: parent_process.fdtable.duplicate(),
        },
        regs,
    );
    Ok(tid)
}

/// Create a thread in the caller's group, sharing its address space,
/// descriptor table, and children list. The new task returns 0 from the
/// syscall.
pub fn clone_thread() -> Result<usize, KernelError> {
    let (parent, group, process, parent_regs) = with_current(|task| {
        (
            task.record.parent.load(Ordering::SeqCst),
            task.record.group_id,
            task.process.clone().expect("clone from a kernel task"),
            task.regs,
        )
    });

    let record = allocate_record(|_| group, parent)?;
    let tid = record.tid;

    let mut regs = parent_regs;
    regs.gprs.rax = 0;
    commit_task(record, process, regs);
    Ok(tid)
}

/// Replace the current image.
///
/// Everything that can fail (validation, loading, the argv layout) runs
/// against a fresh address space first, so a bad image (`NoExec`) or
/// exhaustion (`NoMemory`) leaves the caller untouched. On success the old
/// address space is dropped (and torn down if this was its last user) and
/// the saved frame is rebuilt so the syscall returns into the new entry
/// point with `argc` and `argv` in the first two argument registers.
pub fn exec(path: &str, argv: &[&str]) -> Result<(), KernelError> {
    let aspace = AddressSpace::new().ok_or(KernelError::NoMemory)?;
    let entry = load_named_image(&aspace, path)?;

    let mut stack = Page::new().ok_or(KernelError::NoMemory)?;
    let (argc, argv_va, rsp) = image::StackBuilder::new(&mut stack).build_argv(argv)?;
    {
        use crate::mm::page_table::Permission;
        let mut table = aspace.table.lock();
        let r = table.map_page(
            Va::new(USER_STACK_TOP - PAGE_SIZE).unwrap(),
            stack,
            Permission::READ | Permission::WRITE | Permission::USER,
        );
        let r = r.and_then(|_| match console_pa() {
            Some(pa) => table.map_raw(
                Va::new(pa.into_usize()).unwrap(),
                pa,
                Permission::READ | Permission::WRITE | Permission::USER,
            ),
            None => Ok(()),
        });
        table.unlock();
        r?;
    }

    with_current(|task| {
        let process = task.process.as_mut().expect("exec from a kernel task");
        process.address_space = aspace.clone();

        let mut resources = task.record.resources.lock();
        if let Some(p) = resources.as_mut() {
            p.address_space = aspace.clone();
        }
        resources.unlock();

        let mut regs = Registers::new();
        regs.frame.rip = entry;
        regs.frame.rsp = rsp;
        regs.gprs.rdi = argc;
        regs.gprs.rsi = argv_va;
        task.regs = regs;

        // The old table may still be in CR3; switch before it can be freed.
        unsafe { roost::x86_64::Cr3(aspace.pa().into_usize()).apply() };
    });
    Ok(())
}

fn group_siblings(table: &Slots, group: usize, exclude: usize) -> impl Iterator<Item = &Arc<TaskRecord>> {
    table
        .iter()
        .flatten()
        .filter(move |r| r.group_id == group && r.tid != exclude)
}

/// Group exit.
///
/// Cancels every sibling thread and waits for them to reach Broken, closes
/// every descriptor exactly once, hands the children to init (waking any
/// that are blocked, with `interrupted` set), notifies the parent, and
/// finally goes Broken itself. Never returns.
pub fn exit(status: isize) -> ! {
    let record = current_record().expect("exit without a task");
    record.exit_status.store(status, Ordering::SeqCst);
    // This task is exiting deliberately; do not let a racing sibling's
    // cancellation divert it in predicate-wait.
    record.exiting.store(false, Ordering::SeqCst);

    // Cancel sibling threads and wait until every one of them is Broken.
    {
        let guard = PTABLE.lock();
        let mut any = false;
        for sibling in group_siblings(&guard, record.group_id, record.tid) {
            if sibling.state() != TaskState::Broken {
                sibling.exiting.store(true, Ordering::SeqCst);
                any = true;
            }
        }
        guard.unlock();
        if any {
            clock::wake_all_spokes();
            WAITPID_WQ.wake_all();
            let guard = PTABLE.lock();
            let mut guard = wait_until(&WAITPID_WQ, &PTABLE, guard, |table| {
                group_siblings(table, record.group_id, record.tid)
                    .all(|r| r.state() == TaskState::Broken)
            });
            // The siblings are joined; drop their records here since they
            // are not independently waitable.
            let group = record.group_id;
            for tid in 1..NTASK {
                let broken_sibling = matches!(
                    guard[tid].as_ref(),
                    Some(r) if r.group_id == group && r.tid != record.tid
                );
                if broken_sibling {
                    guard[tid] = None;
                }
            }
            guard.unlock();
        }
    }

    // Drop every open file exactly once. The table itself is freed at reap.
    with_current(|task| {
        if let Some(process) = task.process.as_ref() {
            process.fdtable.close_all();
        }
    });

    // Re-parent children to init, interrupting any that are blocked. The
    // children list lives on the group leader's record.
    let mut wake_sleepers = false;
    {
        let guard = PTABLE.lock();
        let init = guard[INIT_TID].clone();
        guard.unlock();
        let leader = find_record(record.group_id).unwrap_or_else(|| record.clone());
        let mut children = leader.children.lock();
        let orphans: arrayvec::ArrayVec<usize, NTASK> = children.drain(..).collect();
        children.unlock();
        for tid in orphans.iter().copied() {
            if let Some(child) = find_record(tid) {
                child.parent.store(INIT_TID, Ordering::SeqCst);
                if child.state() == TaskState::Blocked {
                    child.interrupted.store(true, Ordering::SeqCst);
                    wake_sleepers = true;
                }
            }
            if let Some(init) = init.as_ref() {
                let mut list = init.children.lock();
                list.push(tid);
                list.unlock();
            }
        }
    }
    if wake_sleepers {
        clock::wake_all_spokes();
    }

    // Notify the parent: mark it interrupted if it is blocked, and wake the
    // waitpid queue so it can reap us.
    if let Some(parent) = find_record(record.parent.load(Ordering::SeqCst)) {
        if parent.state() == TaskState::Blocked {
            parent.interrupted.store(true, Ordering::SeqCst);
        }
    }

    thread::exit_broken()
}

/// The page-fault entry, called by the fault vector with the hardware
/// error code and the faulting address.
///
/// A fault taken in kernel mode is fatal. A fault taken in user mode
/// breaks the task; its parent observes the failure through `waitpid`.
pub fn page_fault(ec: roost::interrupt::PFErrorCode, addr: usize) -> ! {
    if !ec.contains(roost::interrupt::PFErrorCode::USER) {
        panic!("kernel page fault at {:#x} ({:?})", addr, ec);
    }
    let record = current_record().expect("user fault without a task");
    warning!(
        "task {}: user page fault at {:#x} ({:?})",
        record.tid,
        addr,
        ec
    );
    record
        .exit_status
        .store(KernelError::BadAddress.into_isize(), Ordering::SeqCst);
    thread::exit_broken()
}

/// Thread exit: the group's last live thread turns this into a group exit.
pub fn texit(status: isize) -> ! {
    let record = current_record().expect("texit without a task");
    let guard = PTABLE.lock();
    let last = group_siblings(&guard, record.group_id, record.tid)
        .all(|r| r.state() == TaskState::Broken);
    guard.unlock();
    if last {
        exit(status)
    }
    record.exit_status.store(status, Ordering::SeqCst);
    thread::exit_broken()
}

fn find_broken_child(
    table: &Slots,
    parent: &TaskRecord,
    pid: usize,
) -> Result<Option<Arc<TaskRecord>>, KernelError> {
    let children = parent.children.lock();
    let mut matched = false;
    let mut broken = None;
    for &tid in children.iter() {
        if pid != 0 && tid != pid {
            continue;
        }
        if let Some(child) = table.get(tid).and_then(|r| r.as_ref()) {
            matched = true;
            if child.state() == TaskState::Broken {
                broken = Some(child.clone());
                break;
            }
        }
    }
    children.unlock();
    if matched {
        Ok(broken)
    } else {
        Err(KernelError::NoChild)
    }
}

fn reap(parent: &TaskRecord, child: &TaskRecord) {
    let mut children = parent.children.lock();
    if let Some(at) = children.iter().position(|&t| t == child.tid) {
        children.remove(at);
    }
    children.unlock();

    // Dropping the record's resource share frees the descriptor table and
    // the full page table if this was the group's last thread.
    let mut resources = child.resources.lock();
    let dropped = resources.take();
    resources.unlock();
    drop(dropped);

    release_record(child.tid);
}

/// Wait for a child to exit and reap it.
///
/// `pid == 0` waits for any child. Fails with `NoChild` when no matching
/// child exists; with `W_NOHANG`, returns `WouldBlock` instead of
/// blocking. On success returns the reaped child's tid and exit status.
pub fn waitpid(pid: usize, options: usize) -> Result<(usize, isize), KernelError> {
    let me = current_record().expect("waitpid without a task");
    // Children are recorded against the group, so any thread of the group
    // may wait for them.
    let parent = find_record(me.group_id).unwrap_or(me);
    loop {
        let guard = PTABLE.lock();
        let found = find_broken_child(&guard, &parent, pid);
        match found {
            Err(e) => {
                guard.unlock();
                return Err(e);
            }
            Ok(Some(child)) => {
                guard.unlock();
                reap(&parent, &child);
                let status = child.exit_status.load(Ordering::SeqCst);
                return Ok((child.tid, status));
            }
            Ok(None) if options & W_NOHANG != 0 => {
                guard.unlock();
                return Err(KernelError::WouldBlock);
            }
            Ok(None) => {
                let guard = wait_until(&WAITPID_WQ, &PTABLE, guard, |table| {
                    !matches!(find_broken_child(table, &parent, pid), Ok(None))
                });
                guard.unlock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Plant a parent/child pair directly in the task table.
    fn plant_pair() -> (Arc<TaskRecord>, Arc<TaskRecord>) {
        let parent = allocate_record(|tid| tid, INIT_TID).unwrap();
        parent.set_state(TaskState::Runnable);
        let child = allocate_record(|tid| tid, parent.tid).unwrap();
        register_child(parent.tid, child.tid);
        (parent, child)
    }

    fn clear_table() {
        let mut guard = PTABLE.lock();
        for slot in guard.iter_mut() {
            *slot = None;
        }
        guard.unlock();
    }

    #[test]
    fn broken_child_is_found_and_reaped_once() {
        let _mm = crate::mm::testing::lock();
        clear_table();
        let (parent, child) = plant_pair();
        child.exit_status.store(7, Ordering::SeqCst);

        // Not broken yet: visible as a child but not reapable.
        let guard = PTABLE.lock();
        let r = find_broken_child(&guard, &parent, 0);
        guard.unlock();
        assert!(matches!(r, Ok(None)));

        child.set_state(TaskState::Broken);
        let guard = PTABLE.lock();
        let found = find_broken_child(&guard, &parent, 0).unwrap().unwrap();
        guard.unlock();
        assert_eq!(found.tid, child.tid);
        assert_eq!(found.exit_status.load(Ordering::SeqCst), 7);

        reap(&parent, &found);
        assert!(find_record(child.tid).is_none(), "slot is null after reap");
        let children = parent.children.lock();
        assert!(children.is_empty());
        children.unlock();

        // A second wait finds no children at all.
        let guard = PTABLE.lock();
        let r = find_broken_child(&guard, &parent, 0);
        guard.unlock();
        assert!(matches!(r, Err(KernelError::NoChild)));
        clear_table();
    }

    #[test]
    fn pid_filter_ignores_other_children() {
        let _mm = crate::mm::testing::lock();
        clear_table();
        let (parent, child_a) = plant_pair();
        let child_b = allocate_record(|tid| tid, parent.tid).unwrap();
        register_child(parent.tid, child_b.tid);
        child_a.set_state(TaskState::Broken);

        let guard = PTABLE.lock();
        let targeted = find_broken_child(&guard, &parent, child_b.tid).unwrap();
        let any = find_broken_child(&guard, &parent, 0).unwrap().unwrap();
        guard.unlock();
        assert!(targeted.is_none(), "b is alive, targeted wait stays pending");
        assert_eq!(any.tid, child_a.tid);
        clear_table();
    }

    #[test]
    fn slots_are_scarce_and_recycled() {
        let _mm = crate::mm::testing::lock();
        clear_table();
        let mut records = alloc::vec::Vec::new();
        for _ in 1..NTASK {
            records.push(allocate_record(|tid| tid, INIT_TID).unwrap());
        }
        assert!(matches!(
            allocate_record(|tid| tid, INIT_TID),
            Err(KernelError::NoMemory)
        ));
        let freed = records[10].tid;
        release_record(freed);
        assert_eq!(allocate_record(|tid| tid, INIT_TID).unwrap().tid, freed);
        clear_table();
    }
}
