//! Seccomp-bpf syscall filtering for the sandbox.
//!
//! This is a blacklist (default action allow) and is acknowledged to be
//! weaker than a whitelist. It is installed last, both in the app child and
//! in the supervisor's own mini-sandbox, so that setup steps like
//! `unshare(2)` can still run beforehand.

use anyhow::{anyhow, Context, Result};
use libc::sock_filter;
use std::io::Write;

// Classic BPF opcode pieces.
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_JSET: u16 = 0x40;
const BPF_JA: u16 = 0x00;
const BPF_RET: u16 = 0x06;
const BPF_K: u16 = 0x00;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

// Offsets into struct seccomp_data.
const DATA_OFF_NR: u32 = 0;
const DATA_OFF_ARCH: u32 = 4;
const DATA_OFF_ARGS: u32 = 16;

const fn stmt(code: u16, k: u32) -> sock_filter {
    sock_filter { code, jt: 0, jf: 0, k }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

const fn load_abs(k: u32) -> sock_filter {
    stmt(BPF_LD | BPF_W | BPF_ABS, k)
}

const fn ret(k: u32) -> sock_filter {
    stmt(BPF_RET | BPF_K, k)
}

const fn ret_errno(errno: i32) -> sock_filter {
    ret(SECCOMP_RET_ERRNO | (errno as u32 & 0xffff))
}

/// One comparison against the low word of a syscall argument.
#[derive(Clone, Copy)]
enum ArgCmp {
    Eq(u32),
    Ge(u32),
    MaskSet(u32),
}

/// The generated filter program.
pub struct FilterProgram {
    program: Vec<sock_filter>,
}

struct Builder {
    program: Vec<sock_filter>,
}

impl Builder {
    fn new() -> Self {
        Builder { program: Vec::new() }
    }

    fn inst(&mut self, ins: sock_filter) {
        self.program.push(ins);
    }

    /// Denies `nr` unconditionally with the given errno. The accumulator
    /// must hold the syscall number on entry, and still does afterwards.
    fn deny(&mut self, nr: libc::c_long, errno: i32) {
        self.inst(jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, 0, 1));
        self.inst(ret_errno(errno));
    }

    /// Denies `nr` with `errno` when any of the comparisons against argument
    /// `arg` matches. The accumulator holds the syscall number on entry and
    /// on exit; within the block it is clobbered by the argument load, so
    /// the block restores it before falling through.
    fn deny_on_arg(&mut self, nr: libc::c_long, arg: u32, cmps: &[ArgCmp], errno: i32) {
        let m = u8::try_from(cmps.len()).expect("too many comparisons");
        assert!(m >= 1);
        // Interior layout: [ld arg] [m comparisons] [ja 1] [ret] [ld nr].
        self.inst(jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, 0, m + 4));
        self.inst(load_abs(DATA_OFF_ARGS + 8 * arg));
        for (i, cmp) in cmps.iter().enumerate() {
            // Jump forward to the ret instruction on a match.
            let jt = m - i as u8;
            let ins = match cmp {
                ArgCmp::Eq(k) => jump(BPF_JMP | BPF_JEQ | BPF_K, *k, jt, 0),
                ArgCmp::Ge(k) => jump(BPF_JMP | BPF_JGE | BPF_K, *k, jt, 0),
                ArgCmp::MaskSet(k) => jump(BPF_JMP | BPF_JSET | BPF_K, *k, jt, 0),
            };
            self.inst(ins);
        }
        self.inst(stmt(BPF_JMP | BPF_JA, 1));
        self.inst(ret_errno(errno));
        self.inst(load_abs(DATA_OFF_NR));
    }
}

impl FilterProgram {
    /// Builds the sandbox policy.
    ///
    /// In dev mode `ptrace` stays available for debuggers, except for the
    /// register-write requests: the ability to rewrite `orig_ax` is a
    /// complete seccomp bypass.
    pub fn build(dev_mode: bool) -> FilterProgram {
        let mut b = Builder::new();

        // Syscalls from the wrong architecture should fail, but an
        // accidental x32 invocation is no reason to kill the process.
        b.inst(load_abs(DATA_OFF_ARCH));
        b.inst(jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 1, 0));
        b.inst(ret_errno(libc::ENOSYS));

        b.inst(load_abs(DATA_OFF_NR));

        if dev_mode {
            b.deny_on_arg(
                libc::SYS_ptrace,
                0,
                &[
                    ArgCmp::Eq(libc::PTRACE_POKEUSER as u32),
                    ArgCmp::Eq(libc::PTRACE_SETREGS as u32),
                    ArgCmp::Eq(libc::PTRACE_SETFPREGS as u32),
                    ArgCmp::Eq(libc::PTRACE_SETREGSET as u32),
                ],
                libc::EPERM,
            );
        } else {
            b.deny(libc::SYS_ptrace, libc::EPERM);
        }

        // Restrict the set of allowable network protocol families. Netlink
        // itself stays allowed (libc needs it); everything above it and the
        // exotic legacy families report no support.
        b.deny_on_arg(
            libc::SYS_socket,
            0,
            &[
                ArgCmp::Ge(libc::AF_NETLINK as u32 + 1),
                ArgCmp::Eq(libc::AF_AX25 as u32),
                ArgCmp::Eq(libc::AF_IPX as u32),
                ArgCmp::Eq(libc::AF_APPLETALK as u32),
                ArgCmp::Eq(libc::AF_NETROM as u32),
                ArgCmp::Eq(libc::AF_BRIDGE as u32),
                ArgCmp::Eq(libc::AF_ATMPVC as u32),
                ArgCmp::Eq(libc::AF_X25 as u32),
                ArgCmp::Eq(libc::AF_ROSE as u32),
                ArgCmp::Eq(libc::AF_DECnet as u32),
                ArgCmp::Eq(libc::AF_NETBEUI as u32),
                ArgCmp::Eq(libc::AF_SECURITY as u32),
                ArgCmp::Eq(libc::AF_KEY as u32),
            ],
            libc::EAFNOSUPPORT,
        );

        // Kernel keyrings.
        b.deny(libc::SYS_add_key, libc::ENOSYS);
        b.deny(libc::SYS_request_key, libc::ENOSYS);
        b.deny(libc::SYS_keyctl, libc::ENOSYS);

        b.deny(libc::SYS_syslog, libc::ENOSYS);
        b.deny(libc::SYS_uselib, libc::ENOSYS);
        b.deny(libc::SYS_personality, libc::ENOSYS);
        b.deny(libc::SYS_acct, libc::ENOSYS);

        // 16-bit code is unnecessary in the sandbox, and modify_ldt is a
        // historic source of interesting information leaks.
        b.deny(libc::SYS_modify_ldt, libc::ENOSYS);

        // Despite existing as a 64-bit syscall, set_thread_area is only
        // useful for 32-bit programs; 64-bit programs use arch_prctl.
        b.deny(libc::SYS_set_thread_area, libc::ENOSYS);

        // No nested sandboxes: the attack surface is large.
        b.deny(libc::SYS_unshare, libc::ENOSYS);
        b.deny(libc::SYS_mount, libc::ENOSYS);
        b.deny(libc::SYS_pivot_root, libc::ENOSYS);
        b.deny(libc::SYS_quotactl, libc::ENOSYS);
        b.deny_on_arg(
            libc::SYS_clone,
            0,
            &[ArgCmp::MaskSet(libc::CLONE_NEWUSER as u32)],
            libc::EPERM,
        );

        // AIO.
        b.deny(libc::SYS_io_setup, libc::ENOSYS);
        b.deny(libc::SYS_io_destroy, libc::ENOSYS);
        b.deny(libc::SYS_io_getevents, libc::ENOSYS);
        b.deny(libc::SYS_io_submit, libc::ENOSYS);
        b.deny(libc::SYS_io_cancel, libc::ENOSYS);

        // VM policy surface.
        b.deny(libc::SYS_remap_file_pages, libc::ENOSYS);
        b.deny(libc::SYS_mbind, libc::ENOSYS);
        b.deny(libc::SYS_get_mempolicy, libc::ENOSYS);
        b.deny(libc::SYS_set_mempolicy, libc::ENOSYS);
        b.deny(libc::SYS_migrate_pages, libc::ENOSYS);
        b.deny(libc::SYS_move_pages, libc::ENOSYS);
        b.deny(libc::SYS_vmsplice, libc::ENOSYS);

        // Robust futex lists.
        b.deny(libc::SYS_set_robust_list, libc::ENOSYS);
        b.deny(libc::SYS_get_robust_list, libc::ENOSYS);

        // Profiling.
        b.deny(libc::SYS_perf_event_open, libc::ENOSYS);

        b.inst(ret(SECCOMP_RET_ALLOW));

        FilterProgram { program: b.program }
    }

    /// Installs the filter on the current process.
    ///
    /// `no_new_privs` must already be set or the kernel refuses the filter
    /// for unprivileged callers.
    pub fn install(&self) -> Result<()> {
        let len = u16::try_from(self.program.len()).context("seccomp filter is too long")?;
        let prog = libc::sock_fprog {
            len,
            // The kernel takes a mutable pointer but does not write through it.
            filter: self.program.as_ptr() as *mut sock_filter,
        };

        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER,
                &prog as *const libc::sock_fprog as libc::c_ulong,
                0,
                0,
            )
        };
        if rc != 0 {
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::EINVAL {
                return Err(anyhow!(
                    "prctl(PR_SET_SECCOMP) reported EINVAL. (Hint: this requires a kernel \
                     configured with CONFIG_SECCOMP and CONFIG_SECCOMP_FILTER.)"
                ));
            }
            return Err(anyhow!(errno)).context("prctl(PR_SET_SECCOMP) failed");
        }
        Ok(())
    }

    /// Writes a human-readable listing of the filter, one instruction per
    /// line. Enabled by `--seccomp-dump-pfc`.
    pub fn dump<W: Write>(&self, mut out: W) -> Result<()> {
        for (i, ins) in self.program.iter().enumerate() {
            let text = match ins.code {
                c if c == BPF_LD | BPF_W | BPF_ABS => format!("ld data[{}]", ins.k),
                c if c == BPF_RET | BPF_K => match ins.k {
                    SECCOMP_RET_ALLOW => "ret ALLOW".to_string(),
                    k => format!("ret ERRNO({})", k & 0xffff),
                },
                c if c == BPF_JMP | BPF_JA => format!("ja +{}", ins.k),
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    format!("jeq #{:#x} jt={} jf={}", ins.k, ins.jt, ins.jf)
                }
                c if c == BPF_JMP | BPF_JGE | BPF_K => {
                    format!("jge #{:#x} jt={} jf={}", ins.k, ins.jt, ins.jf)
                }
                c if c == BPF_JMP | BPF_JSET | BPF_K => {
                    format!("jset #{:#x} jt={} jf={}", ins.k, ins.jt, ins.jf)
                }
                c => format!("raw code={:#06x} k={:#x}", c, ins.k),
            };
            writeln!(out, "{i:04}: {text}").context("failed to write filter dump")?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn instructions(&self) -> &[sock_filter] {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A small classic-BPF evaluator, enough to execute the filters this
    /// module generates against a fabricated seccomp_data.
    fn eval(prog: &[sock_filter], nr: i64, arch: u32, args: [u64; 6]) -> u32 {
        let data_at = |off: u32| -> u32 {
            match off {
                DATA_OFF_NR => nr as u32,
                DATA_OFF_ARCH => arch,
                off if off >= DATA_OFF_ARGS => {
                    let rel = (off - DATA_OFF_ARGS) as usize;
                    let arg = args[rel / 8];
                    if rel % 8 == 0 {
                        arg as u32
                    } else {
                        (arg >> 32) as u32
                    }
                }
                _ => panic!("unexpected load offset {off}"),
            }
        };

        let mut acc: u32 = 0;
        let mut pc = 0usize;
        loop {
            let ins = prog[pc];
            pc += 1;
            match ins.code {
                c if c == BPF_LD | BPF_W | BPF_ABS => acc = data_at(ins.k),
                c if c == BPF_RET | BPF_K => return ins.k,
                c if c == BPF_JMP | BPF_JA => pc += ins.k as usize,
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    pc += usize::from(if acc == ins.k { ins.jt } else { ins.jf });
                }
                c if c == BPF_JMP | BPF_JGE | BPF_K => {
                    pc += usize::from(if acc >= ins.k { ins.jt } else { ins.jf });
                }
                c if c == BPF_JMP | BPF_JSET | BPF_K => {
                    pc += usize::from(if acc & ins.k != 0 { ins.jt } else { ins.jf });
                }
                c => panic!("unexpected opcode {c:#x}"),
            }
        }
    }

    fn run(prog: &FilterProgram, nr: i64, args: [u64; 6]) -> u32 {
        eval(prog.instructions(), nr, AUDIT_ARCH_X86_64, args)
    }

    const ALLOW: u32 = SECCOMP_RET_ALLOW;

    fn errno(e: i32) -> u32 {
        SECCOMP_RET_ERRNO | e as u32
    }

    #[test]
    fn allows_ordinary_syscalls() {
        let prog = FilterProgram::build(false);
        assert_eq!(run(&prog, libc::SYS_write, [1, 0, 0, 0, 0, 0]), ALLOW);
        assert_eq!(run(&prog, libc::SYS_openat, [0; 6]), ALLOW);
    }

    #[test]
    fn bad_architecture_reports_enosys_instead_of_killing() {
        let prog = FilterProgram::build(false);
        let verdict = eval(prog.instructions(), libc::SYS_write, 0x4000_003e, [0; 6]);
        assert_eq!(verdict, errno(libc::ENOSYS));
    }

    #[test]
    fn namespace_escapes_are_denied() {
        let prog = FilterProgram::build(false);
        assert_eq!(run(&prog, libc::SYS_unshare, [0; 6]), errno(libc::ENOSYS));
        assert_eq!(run(&prog, libc::SYS_mount, [0; 6]), errno(libc::ENOSYS));
        assert_eq!(run(&prog, libc::SYS_pivot_root, [0; 6]), errno(libc::ENOSYS));
    }

    #[test]
    fn clone_is_denied_only_with_newuser() {
        let prog = FilterProgram::build(false);
        let newuser = libc::CLONE_NEWUSER as u64;
        assert_eq!(run(&prog, libc::SYS_clone, [newuser, 0, 0, 0, 0, 0]), errno(libc::EPERM));
        let thread_flags = (libc::CLONE_VM | libc::CLONE_THREAD | libc::CLONE_SIGHAND) as u64;
        assert_eq!(run(&prog, libc::SYS_clone, [thread_flags, 0, 0, 0, 0, 0]), ALLOW);
    }

    #[test]
    fn socket_families_are_restricted() {
        let prog = FilterProgram::build(false);
        assert_eq!(run(&prog, libc::SYS_socket, [libc::AF_INET as u64, 0, 0, 0, 0, 0]), ALLOW);
        assert_eq!(run(&prog, libc::SYS_socket, [libc::AF_UNIX as u64, 0, 0, 0, 0, 0]), ALLOW);
        // Netlink itself is needed by libc.
        assert_eq!(
            run(&prog, libc::SYS_socket, [libc::AF_NETLINK as u64, 0, 0, 0, 0, 0]),
            ALLOW
        );
        assert_eq!(
            run(&prog, libc::SYS_socket, [libc::AF_X25 as u64, 0, 0, 0, 0, 0]),
            errno(libc::EAFNOSUPPORT)
        );
        assert_eq!(
            run(&prog, libc::SYS_socket, [libc::AF_NETLINK as u64 + 1, 0, 0, 0, 0, 0]),
            errno(libc::EAFNOSUPPORT)
        );
        assert_eq!(
            run(&prog, libc::SYS_socket, [1000, 0, 0, 0, 0, 0]),
            errno(libc::EAFNOSUPPORT)
        );
    }

    #[test]
    fn ptrace_fully_denied_in_production() {
        let prog = FilterProgram::build(false);
        assert_eq!(
            run(&prog, libc::SYS_ptrace, [libc::PTRACE_ATTACH as u64, 0, 0, 0, 0, 0]),
            errno(libc::EPERM)
        );
    }

    #[test]
    fn dev_mode_ptrace_blocks_only_register_writes() {
        let prog = FilterProgram::build(true);
        assert_eq!(
            run(&prog, libc::SYS_ptrace, [libc::PTRACE_ATTACH as u64, 0, 0, 0, 0, 0]),
            ALLOW
        );
        assert_eq!(
            run(&prog, libc::SYS_ptrace, [libc::PTRACE_POKEUSER as u64, 0, 0, 0, 0, 0]),
            errno(libc::EPERM)
        );
        assert_eq!(
            run(&prog, libc::SYS_ptrace, [libc::PTRACE_SETREGS as u64, 0, 0, 0, 0, 0]),
            errno(libc::EPERM)
        );
    }

    #[test]
    fn dump_lists_every_instruction() {
        let prog = FilterProgram::build(false);
        let mut buf = Vec::new();
        prog.dump(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), prog.instructions().len());
        assert!(text.contains("ret ALLOW"));
    }
}
