//! Kernel monitor scenarios.

use skerry_common::memlayout::UTEXT;
use skerry_common::trap::{T_BRKPT, T_DEBUG};
use skerry_kernel::monitor::{self, DebugInfo, KernelLayout, MonitorAction};
use skerry_kernel::testutil::{Harness, Insn, Symbol};
use skerry_kernel::{TerminalAction, Transfer};

fn symbol(start: u64, end: u64, file: &'static str, line: u32, fn_name: &'static str) -> Symbol {
    Symbol {
        start,
        end,
        info: DebugInfo {
            file,
            line,
            fn_name,
            fn_addr: start,
        },
    }
}

#[test]
fn test_stepi_advances_by_one_instruction() {
    let mut h = Harness::boot(1);
    let env = h.spawn().unwrap();
    h.machine.symbols.push(symbol(UTEXT, UTEXT + 0x100, "user/hello.c", 7, "umain"));
    h.machine.script(["stepi", "continue"]);

    let mut p = h.process(env);
    p.execute(Insn::Int3).unwrap();
    assert_eq!(p.resume().unwrap().rip, UTEXT + 1);
    assert!(p.resume().unwrap().single_step());

    p.execute(Insn::Nop { len: 3 }).unwrap();
    let frame = p.resume().unwrap();
    assert_eq!(frame.rip, UTEXT + 4);
    assert!(!frame.single_step());

    // with single-stepping off the next instruction runs without a trap
    p.execute(Insn::Nop { len: 2 }).unwrap();
    assert_eq!(p.resume().unwrap().rip, UTEXT + 6);

    let trapnos: Vec<u64> = h.traps.iter().map(|t| t.trapno).collect();
    assert_eq!(trapnos, vec![u64::from(T_BRKPT), u64::from(T_DEBUG)]);
    assert!(h.traps.iter().all(|t| t.action == TerminalAction::Resume(env)));

    let out = h.machine.take_output();
    assert!(out.contains("Welcome to the Skerry kernel monitor!"), "{out}");
    assert!(out.contains("trap 0x00000003 Breakpoint"), "{out}");
    assert!(out.contains("K> stepi\nuser/hello.c:7: umain+1\n"), "{out}");
    assert!(out.contains("trap 0x00000001 Debug"), "{out}");
}

#[test]
fn test_monitor_without_input_halts_the_cpu() {
    let mut h = Harness::boot(1);
    let env = h.spawn().unwrap();

    h.process(env).execute(Insn::Int3).unwrap();

    let last = h.traps.last().copied().unwrap();
    assert_eq!(last.action, TerminalAction::Halt);
    assert_eq!(last.transfer, Transfer::Stopped);
    assert!(!h.kernel.is_panicked());
}

#[test]
fn test_backtrace_walks_frame_chain() {
    let mut h = Harness::boot(1);
    let fps = h.machine.push_frames(0x7000, &[0xffff_ffff_8010_0040, 0xffff_ffff_8010_0110]);
    h.machine
        .symbols
        .push(symbol(0xffff_ffff_8010_0000, 0xffff_ffff_8010_0100, "kern/init.c", 42, "i386_init"));
    h.machine.script(["backtrace"]);

    let action = monitor::run(&mut h.machine, &h.cpus[0], None);

    assert_eq!(action, MonitorAction::Stay);
    let out = h.machine.take_output();
    let lines: Vec<&str> = out.lines().collect();
    let start = lines.iter().position(|l| *l == "Stack backtrace:").unwrap();
    assert_eq!(
        lines[start + 1],
        format!(
            "  rbp {:016x}  rip ffffffff80100040  args 0000000000000000 0000000000000001 \
             0000000000000002 0000000000000003 0000000000000004",
            fps[0]
        )
    );
    assert_eq!(lines[start + 2], "\tkern/init.c:42: i386_init+64");
    assert_eq!(
        lines[start + 3],
        format!(
            "  rbp {:016x}  rip ffffffff80100110  args 0000000000000100 0000000000000101 \
             0000000000000102 0000000000000103 0000000000000104",
            fps[1]
        )
    );
    // no debug information for the second return address
    assert_eq!(lines[start + 4], "\t");
    assert_eq!(lines[start + 5], "K> ");
}

#[test]
fn test_kerninfo_reports_layout() {
    let mut h = Harness::boot(1);
    h.machine.layout = KernelLayout {
        start: 0x10_0000,
        entry: 0xffff_ffff_8010_000c,
        etext: 0xffff_ffff_8010_4000,
        edata: 0xffff_ffff_8010_8000,
        end: 0xffff_ffff_8011_000d,
    };
    h.machine.script(["kerninfo"]);

    monitor::run(&mut h.machine, &h.cpus[0], None);

    let out = h.machine.take_output();
    assert!(out.contains("  _start                  0000000000100000 (phys)\n"), "{out}");
    assert!(out.contains("  entry  ffffffff8010000c (virt)  000000000010000c (phys)\n"), "{out}");
    assert!(out.contains("  end    ffffffff8011000d (virt)  000000000011000d (phys)\n"), "{out}");
    assert!(out.contains("Kernel executable memory footprint: 65KB\n"), "{out}");
}

#[test]
fn test_help_and_bad_input() {
    let mut h = Harness::boot(1);
    h.machine
        .script(["help", "", "frobnicate", "help 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15", "continue"]);

    assert_eq!(monitor::run(&mut h.machine, &h.cpus[0], None), MonitorAction::Stay);

    let out = h.machine.take_output();
    assert!(out.contains("help - Display this list of commands\n"), "{out}");
    assert!(out.contains("stepi - Execute one instruction and trap again\n"), "{out}");
    assert!(out.contains("Unknown command 'frobnicate'\n"), "{out}");
    assert!(out.contains("Too many arguments (max 16)\n"), "{out}");
    assert!(out.contains("continue: not entered from a trap\n"), "{out}");
}

#[test]
fn test_empty_system_drops_into_monitor() {
    let mut h = Harness::boot(1);
    h.machine.script(["help"]);

    assert_eq!(h.schedule(0), Transfer::Stopped);

    let out = h.machine.take_output();
    assert!(out.contains("No runnable environments in the system!"), "{out}");
    assert!(out.contains("K> help\n"), "{out}");
    assert!(!out.contains("TRAP frame"), "{out}");
}
