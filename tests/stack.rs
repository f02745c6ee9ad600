//! Stack growth scenarios

mod common;

use common::{pattern, Machine, User};
use demand_pager::copyio::{copy_out, CopyError};
use demand_pager::trap::{self, TrapFrame, TrapOutcome};
use demand_pager::vm::fault::{PF_U, PF_W};
use demand_pager::vm::{
    FaultError, PageKind, VmConfig, VmError, KERN_BASE, PAGE_SIZE, STACK_LIMIT, USER_STACK,
};

const PAGE: u64 = PAGE_SIZE as u64;

#[test]
fn test_initial_stack_page() {
    let machine = Machine::new(4, 4);
    let (space, _) = machine.space();
    assert_eq!(space.setup_stack(), Ok(USER_STACK));

    let info = space.page_info(USER_STACK - PAGE).unwrap();
    assert!(info.resident && info.stack && info.writable);
    assert_eq!(info.kind, PageKind::Anon);

    let user = User::with_sp(&space, USER_STACK - 16);
    user.write_u64(USER_STACK - 16, 42).unwrap();
    assert_eq!(user.read_u64(USER_STACK - 16).unwrap(), 42);
    assert_eq!(machine.vm.stats().snapshot().stack_growths, 0);
}

#[test]
fn test_push_just_below_sp_grows_the_stack() {
    let machine = Machine::new(4, 4);
    let (space, _) = machine.space();
    space.setup_stack().unwrap();

    let sp = USER_STACK - PAGE;
    let user = User::with_sp(&space, sp);
    user.write_u64(sp - 8, pattern(1)).unwrap();

    let grown = space.page_info(sp - PAGE).unwrap();
    assert!(grown.stack && grown.resident && grown.writable);
    assert_eq!(user.read_u64(sp - 8).unwrap(), pattern(1));
    assert_eq!(user.read_u64(sp - PAGE).unwrap(), 0);
    assert_eq!(machine.vm.stats().snapshot().stack_growths, 1);
}

#[test]
fn test_access_further_below_sp_is_refused() {
    let machine = Machine::new(4, 4);
    let (space, _) = machine.space();
    space.setup_stack().unwrap();

    let sp = USER_STACK - PAGE;
    let user = User::with_sp(&space, sp);
    assert_eq!(user.read(sp - 9, 1), Err(FaultError::NotMapped(sp - 9)));
    assert_eq!(space.pages().len(), 1);
}

#[test]
fn test_access_above_sp_grows_the_stack() {
    let machine = Machine::new(4, 4);
    let (space, _) = machine.space();

    // Stack pointer moved down several pages before the first touch.
    let sp = USER_STACK - 4 * PAGE;
    let user = User::with_sp(&space, sp);
    user.write_u64(USER_STACK - 2 * PAGE + 16, 5).unwrap();
    user.write_u64(sp, 6).unwrap();

    assert!(space.page_info(USER_STACK - 2 * PAGE).unwrap().stack);
    assert!(space.page_info(sp).unwrap().stack);
    assert!(space.page_info(USER_STACK - 3 * PAGE).is_none());
}

#[test]
fn test_stack_stops_at_limit() {
    let machine = Machine::new(4, 4);
    let (space, _) = machine.space();
    let floor = USER_STACK - STACK_LIMIT;

    let user = User::with_sp(&space, floor);
    user.write_u64(floor, 1).unwrap();
    assert!(space.page_info(floor).unwrap().stack);

    assert_eq!(
        user.write_u64(floor - 8, 1),
        Err(FaultError::NotMapped(floor - 8))
    );
    assert!(space.page_info(floor - PAGE).is_none());
}

#[test]
fn test_stack_pages_survive_eviction() {
    let machine = Machine::new(1, 8);
    let (space, _) = machine.space();
    space.setup_stack().unwrap();

    let mut sp = USER_STACK;
    for i in 0..4 {
        sp -= PAGE;
        let user = User::with_sp(&space, sp);
        user.write_u64(sp, pattern(i)).unwrap();
    }
    let user = User::with_sp(&space, sp);
    for i in 0..4 {
        assert_eq!(user.read_u64(USER_STACK - (i + 1) * PAGE).unwrap(), pattern(i));
    }
    assert_eq!(space.resident_count(), 1);
}

#[test]
fn test_kernel_fault_uses_saved_user_sp() {
    let machine = Machine::new(4, 4);
    let (space, _) = machine.space();
    space.setup_stack().unwrap();
    let kernel = TrapFrame::new(KERN_BASE + 0x8000);

    // The system call was entered with sp at the top of the stack.
    space.set_saved_user_sp(USER_STACK - 8);
    let below = USER_STACK - 2 * PAGE;
    assert_eq!(
        copy_out(&space, &kernel, &[1, 2, 3], below),
        Err(CopyError::Fault(FaultError::NotMapped(below)))
    );

    space.set_saved_user_sp(below + 8);
    assert_eq!(copy_out(&space, &kernel, &[1, 2, 3], below), Ok(3));
    assert!(space.page_info(below).unwrap().stack);
}

#[test]
fn test_trap_kills_on_wild_stack_access() {
    let machine = Machine::new(4, 4);
    let (space, _) = machine.space();
    space.setup_stack().unwrap();

    let sp = USER_STACK - PAGE;
    let frame = TrapFrame::new(sp).with_error_code(PF_U | PF_W);
    assert_eq!(trap::page_fault(&space, sp - 8, &frame), TrapOutcome::Resume);
    assert_eq!(
        trap::page_fault(&space, sp - PAGE - 64, &frame),
        TrapOutcome::Kill {
            status: trap::KILLED_EXIT_STATUS
        }
    );
}

#[test]
fn test_custom_layout_bounds_the_stack() {
    const TOP: u64 = 0x10_0000;
    let config = VmConfig::default()
        .with_user_stack(TOP)
        .with_kern_base(2 * TOP)
        .with_stack_limit(4 * PAGE);
    let machine = Machine::with_config(config, 8, 8);
    let (space, _) = machine.space();
    assert_eq!(space.saved_user_sp(), TOP);
    assert_eq!(space.setup_stack(), Ok(TOP));

    let floor = TOP - 4 * PAGE;
    let user = User::with_sp(&space, floor);
    for i in 1..=4 {
        user.write_u64(TOP - i * PAGE, pattern(i)).unwrap();
    }
    assert_eq!(space.pages().len(), 4);
    assert_eq!(
        user.write_u64(floor - 8, 1),
        Err(FaultError::NotMapped(floor - 8))
    );

    // The default stack top is kernel space under this layout.
    assert_eq!(
        space.create_uninitialized_page(2 * TOP, true, PageKind::Anon, None),
        Err(VmError::KernelAddress(2 * TOP))
    );
    assert!(space.create_uninitialized_page(TOP, true, PageKind::Anon, None).is_ok());
}
