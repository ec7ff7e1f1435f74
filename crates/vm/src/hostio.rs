// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// the VM's window onto the host: a 256-slot descriptor table with the
// standard streams pre-wired, a 64-slot directory-handle table, and
// the process primitives that need libc on unix.
//
// every operation returns the (r1, r2, err) triple of the OS-call
// convention: err 0 on success, the absolute native error (and zeroed
// results) on failure.

use std::fs::File;
use std::io::{Read, Write};

pub const ENOSYS: i64 = 38;
pub const EBADF: i64 = 9;
pub const EMFILE: i64 = 24;
pub const EIO: i64 = 5;

pub type SysTriple = (i64, i64, i64);

pub fn ok(r1: i64, r2: i64) -> SysTriple {
    (r1, r2, 0)
}

pub fn fail(err: i64) -> SysTriple {
    (0, 0, err)
}

fn io_err(error: std::io::Error) -> SysTriple {
    fail(error.raw_os_error().unwrap_or(EIO as i32) as i64)
}

enum FdEntry {
    Stdin,
    Stdout,
    Stderr,
    File(File),
}

pub struct HostIo {
    fds: Vec<Option<FdEntry>>,
    dirs: Vec<Option<std::fs::ReadDir>>,
}

impl HostIo {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let mut fds: Vec<Option<FdEntry>> = Vec::with_capacity(256);
        fds.push(Some(FdEntry::Stdin));
        fds.push(Some(FdEntry::Stdout));
        fds.push(Some(FdEntry::Stderr));
        fds.resize_with(256, || None);

        let mut dirs: Vec<Option<std::fs::ReadDir>> = Vec::new();
        dirs.resize_with(64, || None);

        Self { fds, dirs }
    }

    fn free_fd(&mut self) -> Option<usize> {
        self.fds.iter().position(|entry| entry.is_none())
    }

    pub fn read(&mut self, fd: i64, buf: &mut [u8]) -> SysTriple {
        let Some(Some(entry)) = self.fds.get_mut(fd as usize) else {
            return fail(EBADF);
        };
        let result = match entry {
            FdEntry::Stdin => std::io::stdin().read(buf),
            FdEntry::Stdout | FdEntry::Stderr => return fail(EBADF),
            FdEntry::File(file) => file.read(buf),
        };
        match result {
            Ok(count) => ok(count as i64, 0),
            Err(error) => io_err(error),
        }
    }

    pub fn write(&mut self, fd: i64, data: &[u8]) -> SysTriple {
        let Some(Some(entry)) = self.fds.get_mut(fd as usize) else {
            return fail(EBADF);
        };
        let result = match entry {
            FdEntry::Stdin => return fail(EBADF),
            FdEntry::Stdout => std::io::stdout().write(data),
            FdEntry::Stderr => std::io::stderr().write(data),
            FdEntry::File(file) => file.write(data),
        };
        match result {
            Ok(count) => ok(count as i64, 0),
            Err(error) => io_err(error),
        }
    }

    /// flags 0 opens for reading, anything else truncates or creates
    /// for writing (the subset the source language's runtime uses)
    pub fn open(&mut self, path: &[u8], flags: i64, _mode: i64) -> SysTriple {
        let Some(slot) = self.free_fd() else {
            return fail(EMFILE);
        };
        let path = String::from_utf8_lossy(path).into_owned();
        let result = if flags == 0 {
            File::open(&path)
        } else {
            File::create(&path)
        };
        match result {
            Ok(file) => {
                self.fds[slot] = Some(FdEntry::File(file));
                ok(slot as i64, 0)
            }
            Err(error) => io_err(error),
        }
    }

    pub fn close(&mut self, fd: i64) -> SysTriple {
        match self.fds.get_mut(fd as usize) {
            Some(entry @ Some(_)) => {
                *entry = None;
                ok(0, 0)
            }
            _ => fail(EBADF),
        }
    }

    pub fn stat(&mut self, path: &[u8]) -> SysTriple {
        let path = String::from_utf8_lossy(path).into_owned();
        match std::fs::metadata(&path) {
            Ok(meta) => {
                #[cfg(unix)]
                let mode = {
                    use std::os::unix::fs::PermissionsExt;
                    meta.permissions().mode() as i64
                };
                #[cfg(not(unix))]
                let mode = 0;
                ok(meta.len() as i64, mode)
            }
            Err(error) => io_err(error),
        }
    }

    pub fn mkdir(&mut self, path: &[u8], _mode: i64) -> SysTriple {
        let path = String::from_utf8_lossy(path).into_owned();
        match std::fs::create_dir(&path) {
            Ok(()) => ok(0, 0),
            Err(error) => io_err(error),
        }
    }

    pub fn rmdir(&mut self, path: &[u8]) -> SysTriple {
        let path = String::from_utf8_lossy(path).into_owned();
        match std::fs::remove_dir(&path) {
            Ok(()) => ok(0, 0),
            Err(error) => io_err(error),
        }
    }

    pub fn unlink(&mut self, path: &[u8]) -> SysTriple {
        let path = String::from_utf8_lossy(path).into_owned();
        match std::fs::remove_file(&path) {
            Ok(()) => ok(0, 0),
            Err(error) => io_err(error),
        }
    }

    pub fn getcwd(&mut self) -> Result<Vec<u8>, SysTriple> {
        match std::env::current_dir() {
            Ok(dir) => Ok(dir.to_string_lossy().into_owned().into_bytes()),
            Err(error) => Err(io_err(error)),
        }
    }

    pub fn chmod(&mut self, path: &[u8], mode: i64) -> SysTriple {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = String::from_utf8_lossy(path).into_owned();
            match std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode as u32)) {
                Ok(()) => ok(0, 0),
                Err(error) => io_err(error),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
            ok(0, 0)
        }
    }

    pub fn getpid(&self) -> SysTriple {
        ok(std::process::id() as i64, 0)
    }

    //
    // directory streams
    //

    pub fn opendir(&mut self, path: &[u8]) -> SysTriple {
        let Some(slot) = self.dirs.iter().position(|entry| entry.is_none()) else {
            return fail(EMFILE);
        };
        let path = String::from_utf8_lossy(path).into_owned();
        match std::fs::read_dir(&path) {
            Ok(reader) => {
                self.dirs[slot] = Some(reader);
                ok(slot as i64, 0)
            }
            Err(error) => io_err(error),
        }
    }

    /// the next entry name, or an empty name at the end of the stream
    pub fn readdir(&mut self, handle: i64) -> Result<Vec<u8>, SysTriple> {
        let Some(Some(reader)) = self.dirs.get_mut(handle as usize) else {
            return Err(fail(EBADF));
        };
        match reader.next() {
            None => Ok(Vec::new()),
            Some(Ok(entry)) => Ok(entry.file_name().to_string_lossy().into_owned().into_bytes()),
            Some(Err(error)) => Err(io_err(error)),
        }
    }

    pub fn closedir(&mut self, handle: i64) -> SysTriple {
        match self.dirs.get_mut(handle as usize) {
            Some(entry @ Some(_)) => {
                *entry = None;
                ok(0, 0)
            }
            _ => fail(EBADF),
        }
    }

    //
    // process primitives, unix only
    //

    #[cfg(unix)]
    pub fn dup2(&mut self, old_fd: i64, new_fd: i64) -> SysTriple {
        let result = unsafe { libc::dup2(old_fd as i32, new_fd as i32) };
        if result < 0 {
            fail(last_errno())
        } else {
            ok(result as i64, 0)
        }
    }

    #[cfg(unix)]
    pub fn fork(&mut self) -> SysTriple {
        let result = unsafe { libc::fork() };
        if result < 0 {
            fail(last_errno())
        } else {
            ok(result as i64, 0)
        }
    }

    #[cfg(unix)]
    pub fn execve(&mut self, path: &[u8], argv: Vec<Vec<u8>>, envp: Vec<Vec<u8>>) -> SysTriple {
        use std::ffi::CString;

        let Ok(c_path) = CString::new(path.to_vec()) else {
            return fail(EIO);
        };
        let c_argv: Vec<CString> = argv
            .into_iter()
            .filter_map(|arg| CString::new(arg).ok())
            .collect();
        let c_envp: Vec<CString> = envp
            .into_iter()
            .filter_map(|env| CString::new(env).ok())
            .collect();
        let mut argv_ptrs: Vec<*const libc::c_char> =
            c_argv.iter().map(|arg| arg.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> =
            c_envp.iter().map(|env| env.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        unsafe { libc::execve(c_path.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) };
        // execve only returns on failure
        fail(last_errno())
    }

    #[cfg(unix)]
    pub fn wait4(&mut self, pid: i64) -> SysTriple {
        let mut status: libc::c_int = 0;
        let result = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, 0) };
        if result < 0 {
            fail(last_errno())
        } else {
            ok(result as i64, status as i64)
        }
    }

    #[cfg(unix)]
    pub fn pipe(&mut self) -> SysTriple {
        let mut fds = [0 as libc::c_int; 2];
        let result = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if result < 0 {
            return fail(last_errno());
        }
        // wrap the raw descriptors so the table owns them
        use std::os::fd::FromRawFd;
        let read_end = unsafe { File::from_raw_fd(fds[0]) };
        let write_end = unsafe { File::from_raw_fd(fds[1]) };
        let Some(read_slot) = self.free_fd() else {
            return fail(EMFILE);
        };
        self.fds[read_slot] = Some(FdEntry::File(read_end));
        let Some(write_slot) = self.free_fd() else {
            self.fds[read_slot] = None;
            return fail(EMFILE);
        };
        self.fds[write_slot] = Some(FdEntry::File(write_end));
        ok(read_slot as i64, write_slot as i64)
    }

    #[cfg(not(unix))]
    pub fn dup2(&mut self, _old_fd: i64, _new_fd: i64) -> SysTriple {
        fail(ENOSYS)
    }

    #[cfg(not(unix))]
    pub fn fork(&mut self) -> SysTriple {
        fail(ENOSYS)
    }

    #[cfg(not(unix))]
    pub fn execve(&mut self, _path: &[u8], _argv: Vec<Vec<u8>>, _envp: Vec<Vec<u8>>) -> SysTriple {
        fail(ENOSYS)
    }

    #[cfg(not(unix))]
    pub fn wait4(&mut self, _pid: i64) -> SysTriple {
        fail(ENOSYS)
    }

    #[cfg(not(unix))]
    pub fn pipe(&mut self) -> SysTriple {
        fail(ENOSYS)
    }
}

#[cfg(unix)]
fn last_errno() -> i64 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(EIO as i32) as i64
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{HostIo, EBADF};

    #[test]
    fn test_standard_streams_prewired() {
        let mut io = HostIo::new();
        // reading from stdout is refused, not a crash
        let (_, _, err) = io.read(1, &mut [0u8; 4]);
        assert_eq!(err, EBADF);
        let (_, _, err) = io.write(0, b"x");
        assert_eq!(err, EBADF);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = std::env::temp_dir().join("rtg-vm-hostio-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("data.txt");
        let path_bytes = path.to_string_lossy().into_owned().into_bytes();

        let mut io = HostIo::new();
        let (fd, _, err) = io.open(&path_bytes, 1, 0o644);
        assert_eq!(err, 0);
        assert!(fd >= 3);
        let (written, _, err) = io.write(fd, b"hello");
        assert_eq!((written, err), (5, 0));
        io.close(fd);

        let (fd, _, err) = io.open(&path_bytes, 0, 0);
        assert_eq!(err, 0);
        let mut buf = [0u8; 16];
        let (count, _, err) = io.read(fd, &mut buf);
        assert_eq!((count, err), (5, 0));
        assert_eq!(&buf[..5], b"hello");
        io.close(fd);

        let (size, _, err) = io.stat(&path_bytes);
        assert_eq!((size, err), (5, 0));
    }

    #[test]
    fn test_bad_descriptor() {
        let mut io = HostIo::new();
        let (_, _, err) = io.write(77, b"x");
        assert_eq!(err, EBADF);
        let (_, _, err) = io.close(500);
        assert_eq!(err, EBADF);
    }

    #[test]
    fn test_directory_stream() {
        let dir = std::env::temp_dir().join("rtg-vm-hostio-dir-test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("file.txt"), b"x").unwrap();
        let path_bytes = dir.to_string_lossy().into_owned().into_bytes();

        let mut io = HostIo::new();
        let (handle, _, err) = io.opendir(&path_bytes);
        assert_eq!(err, 0);
        let mut names = Vec::new();
        loop {
            let name = io.readdir(handle).unwrap();
            if name.is_empty() {
                break;
            }
            names.push(String::from_utf8(name).unwrap());
        }
        names.sort();
        assert_eq!(names, vec!["file.txt".to_owned(), "sub".to_owned()]);
        let (_, _, err) = io.closedir(handle);
        assert_eq!(err, 0);
    }
}
