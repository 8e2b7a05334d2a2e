use std::{
    ffi::CString,
    fs::OpenOptions,
    os::fd::{AsRawFd, OwnedFd},
    path::Path,
};

use anyhow::{bail, Context};
use log::{debug, error, info};
use nix::{
    fcntl::OFlag,
    libc::SIGCHLD,
    mount::{mount, MsFlags},
    sched::{clone, CloneFlags},
    sys::wait::{waitpid, WaitStatus},
    unistd::{close, dup2, execv, execvp, getpid, pipe2, read, write, Pid},
};

/// Entry point the child re-executes itself into.
pub const INIT_COMMAND: &str = "init";

const SELF_EXE: &str = "/proc/self/exe";
const STACK_SIZE: usize = 1024 * 1024;

/// A cloned child sitting in its new namespaces, blocked until told to go on.
#[derive(Debug)]
pub struct ContainerProcess {
    pid: Pid,
    ctrl: OwnedFd,
}

impl ContainerProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Lets the child exec into init and run the command.
    pub fn start(&self) -> anyhow::Result<()> {
        write(&self.ctrl, b"CONT").context("Failed to signal container")?;
        Ok(())
    }

    /// Makes the child exit without running anything.
    pub fn abort(&self) {
        if let Err(e) = write(&self.ctrl, b"EXIT") {
            error!("Failed to abort container {}: {}", self.pid, e);
        }
    }

    pub fn wait(&self) -> anyhow::Result<WaitStatus> {
        let status = waitpid(self.pid, None).context("Failed to wait for container")?;
        info!("Container process {} exited with status: {:?}", self.pid, status);

        Ok(status)
    }
}

/// Clones a child into new UTS, PID, mount, network and IPC namespaces in a
/// single step. Once started, the child re-executes this binary as
/// `init <command>`, which becomes PID 1 of the new PID namespace. With
/// `tty` the child keeps the caller's stdio, otherwise it gets `/dev/null`.
pub fn launch(tty: bool, command: &[String]) -> anyhow::Result<ContainerProcess> {
    if command.is_empty() {
        bail!("Missing container command");
    }

    let exe = CString::new(SELF_EXE)?;
    let mut argv = vec![CString::new(SELF_EXE)?, CString::new(INIT_COMMAND)?, CString::new("--")?];
    for arg in command {
        argv.push(CString::new(arg.as_str()).context("Command contains a NUL byte")?);
    }

    let devnull = if tty {
        None
    } else {
        Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/null")
                .context("Failed to open /dev/null")?,
        )
    };

    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC)?;
    let write_raw = write_fd.as_raw_fd();

    let flags = CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWIPC;

    let mut child_stack: Vec<u8> = vec![0; STACK_SIZE];

    let child_func = || {
        // Only the parent may signal; a dead parent must read as EOF here.
        let _ = close(write_raw);

        if let Some(null) = &devnull {
            for fd in [
                nix::libc::STDIN_FILENO,
                nix::libc::STDOUT_FILENO,
                nix::libc::STDERR_FILENO,
            ] {
                if dup2(null.as_raw_fd(), fd).is_err() {
                    return -1;
                }
            }
        }

        // Wait for the network to be set up.
        let mut buffer = [0u8; 4];
        match read(read_fd.as_raw_fd(), &mut buffer) {
            Ok(4) => (),
            _ => return -1,
        }

        match &buffer {
            b"CONT" => (),
            b"EXIT" => return 0,
            _ => {
                error!("Container received an unexpected signal: {:?}", buffer);
                return -1;
            }
        }

        if let Err(e) = execv(&exe, &argv) {
            error!("Failed to re-exec into init: {}", e);
        }
        -1
    };

    let pid = unsafe { clone(Box::new(child_func), &mut child_stack, flags, Some(SIGCHLD)) }
        .context("Failed to clone container process")?;
    drop(read_fd);

    debug!("Container process {} created", pid);
    Ok(ContainerProcess {
        pid,
        ctrl: write_fd,
    })
}

/// Runs once, as PID 1 of the container: makes the mount tree private,
/// mounts a fresh `/proc` and replaces itself with `command`.
pub fn init(command: &[String]) -> anyhow::Result<()> {
    if getpid().as_raw() != 1 {
        bail!("init must run as PID 1 of a new PID namespace");
    }
    let Some(program) = command.first() else {
        bail!("Missing container command");
    };

    setup_mount()?;

    let program_cstr = CString::new(program.as_str())?;
    let args_cstr = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<_>, _>>()?;

    info!("Ready to run command: {:?}", command);
    execvp(&program_cstr, &args_cstr).with_context(|| format!("Failed to exec {program}"))?;

    Ok(())
}

fn setup_mount() -> anyhow::Result<()> {
    // Keep mount changes inside this namespace.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("Failed to make / private")?;

    if !Path::new("/proc").exists() {
        std::fs::create_dir("/proc")?;
    }

    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .context("Failed to mount /proc")?;

    Ok(())
}
