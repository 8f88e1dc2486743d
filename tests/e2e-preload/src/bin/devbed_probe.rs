// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Device client used by the end-to-end tests.
//!
//! Every subcommand talks to the kernel interfaces through plain libc calls so
//! that a preloaded library sees exactly what a real device client would do.

use std::env;
use std::ffi::CString;
use std::io::{self, Write};
use std::mem;
use std::os::raw::{c_int, c_ulong, c_void};
use std::time::Duration;

fn usage() -> ! {
    eprintln!(
        "usage: devbed-probe stat|lstat|access|cat <path>\n\
         \x20      devbed-probe ioctl <path> <request-hex>...\n\
         \x20      devbed-probe write <path> <chunk|+ms>...\n\
         \x20      devbed-probe io <path> <read:N|fread:SIZE:N|fgets:N|write:TEXT|fwrite:SIZE:TEXT>...\n\
         \x20      devbed-probe uevent"
    );
    std::process::exit(2)
}

fn errno() -> c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn c_path(path: &str) -> CString {
    CString::new(path).unwrap_or_else(|_| usage())
}

fn kind(mode: libc::mode_t) -> &'static str {
    match mode & libc::S_IFMT {
        libc::S_IFCHR => "char",
        libc::S_IFBLK => "block",
        libc::S_IFDIR => "dir",
        libc::S_IFREG => "file",
        libc::S_IFLNK => "link",
        _ => "other",
    }
}

fn stat(path: &str, follow: bool) {
    let path = c_path(path);
    let mut st: libc::stat = unsafe { mem::zeroed() };
    let ret = unsafe {
        if follow {
            libc::stat(path.as_ptr(), &mut st)
        } else {
            libc::lstat(path.as_ptr(), &mut st)
        }
    };
    if ret != 0 {
        println!("errno={}", errno());
        return;
    }
    // older libc releases declare these unsafe
    #[allow(unused_unsafe)]
    let (major, minor) = unsafe { (libc::major(st.st_rdev), libc::minor(st.st_rdev)) };
    println!(
        "type={} rdev={}:{} sticky={}",
        kind(st.st_mode),
        major,
        minor,
        st.st_mode & libc::S_ISVTX != 0
    );
}

fn access(path: &str) {
    let path = c_path(path);
    if unsafe { libc::access(path.as_ptr(), libc::F_OK) } == 0 {
        println!("ok");
    } else {
        println!("errno={}", errno());
    }
}

fn cat(path: &str) {
    match std::fs::read_to_string(path) {
        Ok(text) => print!("{text}"),
        Err(err) => println!("errno={}", err.raw_os_error().unwrap_or(0)),
    }
}

fn ioctl(path: &str, requests: &[String]) {
    let path = c_path(path);
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) };
    if fd < 0 {
        println!("open errno={}", errno());
        std::process::exit(1);
    }
    for request in requests {
        let request = c_ulong::from_str_radix(request.trim_start_matches("0x"), 16)
            .unwrap_or_else(|_| usage());
        let mut value: u32 = 0;
        let ret = unsafe { libc::ioctl(fd, request as _, &mut value as *mut u32 as *mut c_void) };
        let err = if ret == -1 { errno() } else { 0 };
        println!("ret={ret} errno={err} value={value}");
    }
    unsafe { libc::close(fd) };
}

fn write(path: &str, chunks: &[String]) {
    let path = c_path(path);
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY) };
    if fd < 0 {
        println!("open errno={}", errno());
        std::process::exit(1);
    }
    for chunk in chunks {
        if let Some(ms) = chunk.strip_prefix('+').and_then(|ms| ms.parse().ok()) {
            std::thread::sleep(Duration::from_millis(ms));
            continue;
        }
        let bytes = chunk.replace("\\n", "\n");
        let ret = unsafe { libc::write(fd, bytes.as_ptr() as *const c_void, bytes.len()) };
        println!("wrote {ret}");
    }
    unsafe { libc::close(fd) };
}

/// Mixed raw and stdio traffic on one descriptor, for script recording.
fn io(path: &str, steps: &[String]) {
    let path = c_path(path);
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        println!("open errno={}", errno());
        std::process::exit(1);
    }
    let stream = unsafe { libc::fdopen(fd, b"r+\0".as_ptr() as *const libc::c_char) };
    if stream.is_null() {
        println!("fdopen errno={}", errno());
        std::process::exit(1);
    }

    let mut buf = [0u8; 256];
    let buf_ptr = buf.as_mut_ptr() as *mut c_void;
    let number = |text: &str| text.parse::<usize>().unwrap_or_else(|_| usage());
    for step in steps {
        let (op, arg) = step.split_once(':').unwrap_or_else(|| usage());
        match op {
            "read" => {
                let count = number(arg).min(buf.len());
                let ret = unsafe { libc::read(fd, buf_ptr, count) };
                println!("read {ret}");
            }
            "fread" => {
                let (size, items) = arg.split_once(':').unwrap_or_else(|| usage());
                let (size, items) = (number(size), number(items));
                if size * items > buf.len() {
                    usage();
                }
                let ret = unsafe { libc::fread(buf_ptr, size, items, stream) };
                println!("fread {ret}");
            }
            "fgets" => {
                let size = number(arg).min(buf.len()) as c_int;
                let ret = unsafe { libc::fgets(buf.as_mut_ptr() as *mut libc::c_char, size, stream) };
                println!("fgets {}", if ret.is_null() { "null" } else { "ok" });
            }
            "write" => {
                let ret = unsafe { libc::write(fd, arg.as_ptr() as *const c_void, arg.len()) };
                println!("write {ret}");
            }
            "fwrite" => {
                let (size, text) = arg.split_once(':').unwrap_or_else(|| usage());
                let size = number(size).max(1);
                unsafe { libc::fflush(stream) };
                let ret = unsafe {
                    libc::fwrite(text.as_ptr() as *const c_void, size, text.len() / size, stream)
                };
                unsafe { libc::fflush(stream) };
                println!("fwrite {ret}");
            }
            _ => usage(),
        }
    }
    unsafe { libc::fclose(stream) };
}

fn uevent() {
    unsafe {
        let fd = libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_KOBJECT_UEVENT,
        );
        if fd < 0 {
            println!("socket errno={}", errno());
            std::process::exit(1);
        }
        let on: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &on as *const c_int as *const c_void,
            mem::size_of::<c_int>() as libc::socklen_t,
        );
        let timeout = libc::timeval {
            tv_sec: 10,
            tv_usec: 0,
        };
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout as *const libc::timeval as *const c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_nl = mem::zeroed();
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = 2;
        let ret = libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        );
        if ret != 0 {
            println!("bind errno={}", errno());
            std::process::exit(1);
        }
        println!("bound {fd}");
        let _ = io::stdout().flush();

        let mut payload = [0u8; 512];
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut c_void,
            iov_len: payload.len(),
        };
        let mut sender: libc::sockaddr_nl = mem::zeroed();
        let mut control = [0u64; 16];
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_name = &mut sender as *mut libc::sockaddr_nl as *mut c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = mem::size_of_val(&control) as _;

        let len = libc::recvmsg(fd, &mut msg, 0);
        if len < 0 {
            println!("recvmsg errno={}", errno());
            std::process::exit(1);
        }

        let mut uid = None;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS {
                let cred = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::ucred);
                uid = Some(cred.uid);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        let payload = String::from_utf8_lossy(&payload[..len as usize]).replace('\0', "|");
        println!(
            "sender family={} pid={} groups={} uid={} payload={}",
            sender.nl_family,
            sender.nl_pid,
            sender.nl_groups,
            uid.map_or_else(|| "none".to_string(), |uid| uid.to_string()),
            payload
        );
        libc::close(fd);
    }
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        usage()
    };

    match (command.as_str(), rest) {
        ("stat", [path]) => stat(path, true),
        ("lstat", [path]) => stat(path, false),
        ("access", [path]) => access(path),
        ("cat", [path]) => cat(path),
        ("ioctl", [path, requests @ ..]) if !requests.is_empty() => ioctl(path, requests),
        ("write", [path, chunks @ ..]) => write(path, chunks),
        ("io", [path, steps @ ..]) if !steps.is_empty() => io(path, steps),
        ("uevent", []) => uevent(),
        _ => usage(),
    }
}
