/*
 * Thread Shell Commands
 *
 * The `thread` command family for an embedding kernel shell. Output
 * goes to whatever `fmt::Write` sink the shell hands in; the return
 * value is the command's exit code, 0 on success and non-zero on any
 * returned error.
 *
 *   thread ls            list live threads
 *   thread join <id>     join the child thread with the given id
 *   thread kick [cpu]    kick a CPU's scheduler (default: this CPU)
 *   thread test          run the TLS self test
 */

use alloc::sync::Arc;
use core::fmt::Write;

use crate::arch;
use crate::sched::{self, CPU_ANY};
use crate::thread::{self, Thread, ThreadId, tls};

/// Dispatch one command line. Unknown commands print a usage line and
/// return 1.
pub fn handle_command(line: &str, out: &mut dyn Write) -> i32 {
    let mut parts = line.split_whitespace();

    match parts.next() {
        Some("thread") => match parts.next() {
            Some("ls") => cmd_ls(out),
            Some("join") => cmd_join(parts.next(), out),
            Some("kick") => cmd_kick(parts.next(), out),
            Some("test") => cmd_test(out),
            _ => {
                let _ = writeln!(out, "usage: thread ls | join <id> | kick [cpu] | test");
                1
            }
        },
        _ => {
            let _ = writeln!(out, "unknown command: {line}");
            1
        }
    }
}

fn cmd_ls(out: &mut dyn Write) -> i32 {
    let _ = writeln!(out, "{:<8} {:<18} {:<10} {:>4} {:>5}", "ID", "NAME", "STATUS", "CPU", "REFS");
    sched::ops().map_threads(CPU_ANY, &mut |t: &Arc<Thread>| {
        let _ = writeln!(
            out,
            "{:<8} {:<18} {:<10} {:>4} {:>5}",
            t.id().as_u64(),
            t.name(),
            t.status(),
            t.current_cpu(),
            t.refcount(),
        );
    });
    0
}

fn cmd_join(arg: Option<&str>, out: &mut dyn Write) -> i32 {
    let Some(id) = arg.and_then(|s| s.parse::<u64>().ok()) else {
        let _ = writeln!(out, "usage: thread join <id>");
        return 1;
    };
    let id = ThreadId(id);

    let mut target: Option<Arc<Thread>> = None;
    sched::ops().map_threads(CPU_ANY, &mut |t: &Arc<Thread>| {
        if t.id() == id {
            target = Some(t.clone());
        }
    });

    let Some(target) = target else {
        let _ = writeln!(out, "no such thread: {id}");
        return 1;
    };

    match thread::join(&target) {
        Ok(output) => {
            let _ = writeln!(out, "{id} joined, output {output:#x}");
            0
        }
        Err(e) => {
            let _ = writeln!(out, "join {id} failed: {e}");
            1
        }
    }
}

fn cmd_kick(arg: Option<&str>, out: &mut dyn Write) -> i32 {
    let cpu = match arg {
        None => arch::my_cpu_id(),
        Some(s) => match s.parse::<u32>() {
            Ok(cpu) if cpu < arch::cpu_count() => cpu,
            _ => {
                let _ = writeln!(out, "bad cpu index");
                return 1;
            }
        },
    };
    sched::ops().kick_cpu(cpu);
    let _ = writeln!(out, "kicked cpu {cpu}");
    0
}

fn cmd_test(out: &mut dyn Write) -> i32 {
    match tls::self_test() {
        Ok(()) => {
            let _ = writeln!(out, "thread test passed");
            0
        }
        Err(e) => {
            let _ = writeln!(out, "thread test failed: {e}");
            1
        }
    }
}
