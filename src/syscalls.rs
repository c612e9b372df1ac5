//! Darwin BSD system call names by number.

use std::collections::HashMap;

use lazy_static::lazy_static;

lazy_static! {
    static ref SYSCALLS: HashMap<u32, &'static str> = {
        let names: &[(u32, &str)] = &[
            (1, "exit"),
            (2, "fork"),
            (3, "read"),
            (4, "write"),
            (5, "open"),
            (6, "close"),
            (7, "wait4"),
            (9, "link"),
            (10, "unlink"),
            (12, "chdir"),
            (13, "fchdir"),
            (14, "mknod"),
            (15, "chmod"),
            (16, "chown"),
            (18, "getfsstat"),
            (20, "getpid"),
            (23, "setuid"),
            (24, "getuid"),
            (25, "geteuid"),
            (26, "ptrace"),
            (27, "recvmsg"),
            (28, "sendmsg"),
            (29, "recvfrom"),
            (30, "accept"),
            (31, "getpeername"),
            (32, "getsockname"),
            (33, "access"),
            (34, "chflags"),
            (35, "fchflags"),
            (36, "sync"),
            (37, "kill"),
            (39, "getppid"),
            (41, "dup"),
            (42, "pipe"),
            (43, "getegid"),
            (46, "sigaction"),
            (47, "getgid"),
            (48, "sigprocmask"),
            (49, "getlogin"),
            (50, "setlogin"),
            (51, "acct"),
            (52, "sigpending"),
            (53, "sigaltstack"),
            (54, "ioctl"),
            (55, "reboot"),
            (56, "revoke"),
            (57, "symlink"),
            (58, "readlink"),
            (59, "execve"),
            (60, "umask"),
            (61, "chroot"),
            (65, "msync"),
            (66, "vfork"),
            (73, "munmap"),
            (74, "mprotect"),
            (75, "madvise"),
            (78, "mincore"),
            (79, "getgroups"),
            (80, "setgroups"),
            (81, "getpgrp"),
            (82, "setpgid"),
            (83, "setitimer"),
            (85, "swapon"),
            (86, "getitimer"),
            (89, "getdtablesize"),
            (90, "dup2"),
            (92, "fcntl"),
            (93, "select"),
            (95, "fsync"),
            (96, "setpriority"),
            (97, "socket"),
            (98, "connect"),
            (100, "getpriority"),
            (104, "bind"),
            (105, "setsockopt"),
            (106, "listen"),
            (111, "sigsuspend"),
            (116, "gettimeofday"),
            (117, "getrusage"),
            (118, "getsockopt"),
            (120, "readv"),
            (121, "writev"),
            (122, "settimeofday"),
            (123, "fchown"),
            (124, "fchmod"),
            (126, "setreuid"),
            (127, "setregid"),
            (128, "rename"),
            (131, "flock"),
            (132, "mkfifo"),
            (133, "sendto"),
            (134, "shutdown"),
            (135, "socketpair"),
            (136, "mkdir"),
            (137, "rmdir"),
            (138, "utimes"),
            (139, "futimes"),
            (140, "adjtime"),
            (147, "setsid"),
            (151, "getpgid"),
            (152, "setprivexec"),
            (153, "pread"),
            (154, "pwrite"),
            (157, "statfs"),
            (158, "fstatfs"),
            (159, "unmount"),
            (165, "quotactl"),
            (167, "mount"),
            (173, "waitid"),
            (181, "setgid"),
            (182, "setegid"),
            (183, "seteuid"),
            (188, "stat"),
            (189, "fstat"),
            (190, "lstat"),
            (191, "pathconf"),
            (192, "fpathconf"),
            (194, "getrlimit"),
            (195, "setrlimit"),
            (196, "getdirentries"),
            (197, "mmap"),
            (199, "lseek"),
            (200, "truncate"),
            (201, "ftruncate"),
            (202, "__sysctl"),
            (203, "mlock"),
            (204, "munlock"),
            (205, "undelete"),
            (220, "getattrlist"),
            (221, "setattrlist"),
            (222, "getdirentriesattr"),
            (223, "exchangedata"),
            (225, "searchfs"),
            (226, "delete"),
            (227, "copyfile"),
            (230, "poll"),
            (231, "watchevent"),
            (232, "waitevent"),
            (233, "modwatch"),
            (234, "getxattr"),
            (235, "fgetxattr"),
            (236, "setxattr"),
            (237, "fsetxattr"),
            (238, "removexattr"),
            (239, "fremovexattr"),
            (240, "listxattr"),
            (241, "flistxattr"),
            (242, "fsctl"),
            (243, "initgroups"),
            (250, "minherit"),
            (266, "shm_open"),
            (267, "shm_unlink"),
            (268, "sem_open"),
            (269, "sem_close"),
            (270, "sem_unlink"),
            (271, "sem_wait"),
            (272, "sem_trywait"),
            (273, "sem_post"),
            (296, "load_shared_file"),
            (297, "reset_shared_file"),
            (298, "new_system_shared_regions"),
            (310, "getsid"),
            (324, "mlockall"),
            (325, "munlockall"),
            (327, "issetugid"),
            (328, "__pthread_kill"),
            (329, "__pthread_sigmask"),
            (330, "__sigwait"),
            (331, "__disable_threadsignal"),
            (334, "semwait_signal"),
            (340, "stat64"),
            (341, "fstat64"),
            (342, "lstat64"),
            (344, "getdirentries64"),
            (345, "statfs64"),
            (346, "fstatfs64"),
            (347, "getfsstat64"),
            (360, "bsdthread_create"),
            (361, "bsdthread_terminate"),
            (362, "kqueue"),
            (363, "kevent"),
            (366, "bsdthread_register"),
            (367, "workq_open"),
            (368, "workq_ops"),
        ];
        names.iter().copied().collect()
    };
}

pub fn syscall_name(number: u32) -> Option<&'static str> {
    SYSCALLS.get(&number).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_names() {
        assert_eq!(syscall_name(4), Some("write"));
        assert_eq!(syscall_name(1), Some("exit"));
        assert_eq!(syscall_name(197), Some("mmap"));
        assert_eq!(syscall_name(0), None);
        assert_eq!(syscall_name(9999), None);
    }
}
