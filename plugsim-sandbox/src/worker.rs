//! Worker processes for `DomainKind::Worker` domains.
//!
//! Each invocation forks a worker. The worker confines itself before the
//! entry point runs:
//! - Its channel is renumbered to descriptors 3 and 4 and every other
//!   descriptor above stderr is closed
//! - Without `file-io` or `network` the descriptor limit is pinned at 5, so
//!   opening a file, socket or pipe fails with `EMFILE`
//! - Without `environment` the process environment is emptied
//! - The domain's CPU and address-space ceilings are applied
//!
//! Frames are length-prefixed JSON. The worker sends host calls and a final
//! outcome; the host answers host calls. When the outcome arrives (or the
//! channel closes) the host kills the worker's process group and reaps it,
//! so nothing the entry point started outlives the invocation.

use crate::boundary::{Domain, DomainScope, HostLink, Statics, panic_message};
use crate::error::{BoundaryError, HandlerFault, HandlerPanic};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Read, Write};

/// Largest frame either side accepts.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
enum WorkerFrame {
    HostCall {
        request: Value,
    },
    Returned {
        result: Value,
        statics: HashMap<String, Value>,
    },
    Failed {
        fault: Fault,
        statics: HashMap<String, Value>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
enum HostFrame {
    Reply { value: Value },
    Fault { token: usize, message: String },
}

/// How an entry point failed, in a form that survives the process boundary.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Fault {
    /// A host call failed and the entry point passed the error on. The host
    /// still holds the original error under `token`.
    Host { token: usize },
    PermissionDenied { component: String, permission: String },
    Panic { message: String },
    Marshal { message: String },
    Error { message: String, causes: Vec<String> },
}

impl Fault {
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(host) = error.chain().find_map(|e| e.downcast_ref::<HostFault>()) {
            return Fault::Host { token: host.token };
        }
        if let Some(BoundaryError::PermissionDenied {
            component,
            permission,
        }) = error.downcast_ref::<BoundaryError>()
        {
            return Fault::PermissionDenied {
                component: component.clone(),
                permission: permission.clone(),
            };
        }
        Fault::Error {
            message: error.to_string(),
            causes: error.chain().skip(1).map(ToString::to_string).collect(),
        }
    }

    fn into_error(self, component: &str, held: &mut [Option<anyhow::Error>]) -> BoundaryError {
        let error = match self {
            Fault::Host { token } => match held.get_mut(token).and_then(Option::take) {
                Some(original) => original,
                None => anyhow::Error::new(HandlerFault {
                    component: component.to_string(),
                    message: format!("host error #{token} was already reported"),
                    causes: Vec::new(),
                }),
            },
            Fault::PermissionDenied {
                component,
                permission,
            } => anyhow::Error::new(BoundaryError::PermissionDenied {
                component,
                permission,
            }),
            Fault::Panic { message } => anyhow::Error::new(HandlerPanic {
                component: component.to_string(),
                message,
            }),
            Fault::Marshal { message } => {
                return BoundaryError::Marshal(<serde_json::Error as serde::de::Error>::custom(message));
            }
            Fault::Error { message, causes } => anyhow::Error::new(HandlerFault {
                component: component.to_string(),
                message,
                causes,
            }),
        };
        BoundaryError::Handler(error)
    }
}

/// A host call error as seen inside the worker.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct HostFault {
    token: usize,
    message: String,
}

fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> io::Result<()> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Reads one frame. `None` when the other side closed the channel.
fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body) {
        Ok(()) => Ok(Some(serde_json::from_slice(&body)?)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
pub(crate) use imp::{invoke, terminate_all};

#[cfg(unix)]
mod imp {
    use super::*;
    use crate::policy::ResourceLimits;
    use crate::permissions::Permission;
    use std::cell::RefCell;
    use std::fs::File;
    use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
    use std::panic::{self, AssertUnwindSafe};
    use tracing::{debug, warn};

    /// Descriptors the worker keeps: stdio plus its two channel ends.
    const CHANNEL_IN: RawFd = 3;
    const CHANNEL_OUT: RawFd = 4;
    const KEPT_DESCRIPTORS: u64 = 5;

    /// Exit code of a worker that could not confine itself.
    const EXIT_UNCONFINED: i32 = 71;

    struct Confinement {
        cap_descriptors: bool,
        clear_environment: bool,
        limits: ResourceLimits,
    }

    impl Confinement {
        fn for_caller(domain: &Domain, full_trust: bool) -> Self {
            let granted = |p: Permission| full_trust || domain.profile.is_granted(p);
            Self {
                cap_descriptors: !granted(Permission::FileIo) && !granted(Permission::Network),
                clear_environment: !granted(Permission::Environment),
                limits: domain.limits,
            }
        }
    }

    enum Finished {
        Returned(Value, HashMap<String, Value>),
        Failed(Fault, HashMap<String, Value>),
        Vanished,
    }

    fn channel() -> io::Result<(File, File)> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` is a valid two-element buffer.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            // SAFETY: `fd` was just returned by pipe(2).
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
        // SAFETY: both descriptors are open and owned by nobody else.
        Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
    }

    pub(crate) fn invoke<A, R, F, H>(
        domain: &Domain,
        caller: &str,
        full_trust: bool,
        inbound: Value,
        entry: F,
        mut host: H,
    ) -> Result<R, BoundaryError>
    where
        A: DeserializeOwned,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&DomainScope<'_>, A) -> anyhow::Result<R>,
        H: FnMut(Value) -> anyhow::Result<Value>,
    {
        let failed = |e: io::Error| BoundaryError::Worker {
            boundary: domain.name.clone(),
            reason: e.to_string(),
        };
        let (mut from_worker, worker_out) = channel().map_err(failed)?;
        let (worker_in, mut to_worker) = channel().map_err(failed)?;
        let statics = domain.statics().clone();
        let confinement = Confinement::for_caller(domain, full_trust);

        // SAFETY: the child only uses its own copy of the address space and
        // leaves through `_exit`, never returning into the caller.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(failed(io::Error::last_os_error()));
        }
        if pid == 0 {
            drop(from_worker);
            drop(to_worker);
            worker_main(
                domain,
                caller,
                full_trust,
                &confinement,
                worker_in.into_raw_fd(),
                worker_out.into_raw_fd(),
                statics,
                inbound,
                entry,
            );
        }

        drop(worker_in);
        drop(worker_out);
        // SAFETY: `pid` is our child; it also calls setpgid itself.
        unsafe { libc::setpgid(pid, pid) };
        domain.workers().insert(pid);
        debug!(boundary = %domain.name, caller = %caller, pid, "Worker started");

        let mut held: Vec<Option<anyhow::Error>> = Vec::new();
        let finished = serve(&mut from_worker, &mut to_worker, &mut host, &mut held);
        drop(to_worker);
        let status = reap(pid);
        domain.workers().remove(&pid);

        match finished {
            Err(e) => Err(failed(e)),
            Ok(Finished::Vanished) => {
                warn!(boundary = %domain.name, caller = %caller, pid, %status, "Worker terminated without a result");
                Err(BoundaryError::WorkerTerminated {
                    component: caller.to_string(),
                    status,
                })
            }
            Ok(Finished::Returned(result, written)) => {
                domain.statics().extend(written);
                Ok(serde_json::from_value(result)?)
            }
            Ok(Finished::Failed(fault, written)) => {
                domain.statics().extend(written);
                if let Fault::Panic { message } = &fault {
                    warn!(boundary = %domain.name, caller = %caller, "Handler panicked: {}", message);
                }
                Err(fault.into_error(caller, &mut held))
            }
        }
    }

    fn serve<H>(
        reader: &mut File,
        writer: &mut File,
        host: &mut H,
        held: &mut Vec<Option<anyhow::Error>>,
    ) -> io::Result<Finished>
    where
        H: FnMut(Value) -> anyhow::Result<Value>,
    {
        loop {
            let Some(frame) = read_frame::<_, WorkerFrame>(reader)? else {
                return Ok(Finished::Vanished);
            };
            match frame {
                WorkerFrame::HostCall { request } => {
                    let reply = match host(request) {
                        Ok(value) => HostFrame::Reply { value },
                        Err(e) => {
                            let message = e.to_string();
                            held.push(Some(e));
                            HostFrame::Fault {
                                token: held.len() - 1,
                                message,
                            }
                        }
                    };
                    write_frame(writer, &reply)?;
                }
                WorkerFrame::Returned { result, statics } => {
                    return Ok(Finished::Returned(result, statics));
                }
                WorkerFrame::Failed { fault, statics } => {
                    return Ok(Finished::Failed(fault, statics));
                }
            }
        }
    }

    /// Kills whatever is left of the worker's process group and collects its status.
    fn reap(pid: libc::pid_t) -> String {
        // SAFETY: signalling our own child's process group.
        unsafe { libc::kill(-pid, libc::SIGKILL) };
        let mut status: libc::c_int = 0;
        loop {
            // SAFETY: `status` is a valid out-pointer.
            let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
            if rc == pid {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return format!("not collected: {err}");
            }
        }
        if libc::WIFEXITED(status) {
            format!("exited with status {}", libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            format!("killed by signal {}", libc::WTERMSIG(status))
        } else {
            format!("wait status {status}")
        }
    }

    /// Kills every worker of `domain` still running. Returns how many there were.
    pub(crate) fn terminate_all(domain: &Domain) -> usize {
        let live: Vec<libc::pid_t> = domain.workers().iter().copied().collect();
        for pid in &live {
            // SAFETY: signalling our own children and their process groups.
            unsafe {
                libc::kill(-*pid, libc::SIGKILL);
                libc::kill(*pid, libc::SIGKILL);
            }
        }
        live.len()
    }

    struct WorkerChannel {
        reader: RefCell<File>,
        writer: RefCell<File>,
    }

    impl HostLink for WorkerChannel {
        fn call(&self, request: Value) -> anyhow::Result<Value> {
            write_frame(&mut *self.writer.try_borrow_mut()?, &WorkerFrame::HostCall { request })?;
            let reply: HostFrame = read_frame(&mut *self.reader.try_borrow_mut()?)?
                .ok_or_else(|| anyhow::anyhow!("host closed the worker channel"))?;
            match reply {
                HostFrame::Reply { value } => Ok(value),
                HostFrame::Fault { token, message } => Err(HostFault { token, message }.into()),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn worker_main<A, R, F>(
        domain: &Domain,
        caller: &str,
        full_trust: bool,
        confinement: &Confinement,
        channel_in: RawFd,
        channel_out: RawFd,
        statics: HashMap<String, Value>,
        inbound: Value,
        entry: F,
    ) -> !
    where
        A: DeserializeOwned,
        R: Serialize,
        F: FnOnce(&DomainScope<'_>, A) -> anyhow::Result<R>,
    {
        let code = match confine(confinement, channel_in, channel_out) {
            Ok(()) => {
                // SAFETY: `confine` moved the channel onto these descriptors.
                let channel = unsafe {
                    WorkerChannel {
                        reader: RefCell::new(File::from_raw_fd(CHANNEL_IN)),
                        writer: RefCell::new(File::from_raw_fd(CHANNEL_OUT)),
                    }
                };
                let scope = DomainScope::new(domain, caller, full_trust, Statics::copied(statics), &channel);
                let frame = execute(&scope, inbound, entry);
                match write_frame(&mut *channel.writer.borrow_mut(), &frame) {
                    Ok(()) => 0,
                    Err(_) => 1,
                }
            }
            Err(_) => EXIT_UNCONFINED,
        };
        // SAFETY: ends the worker without running the parent's destructors or atexit hooks.
        unsafe { libc::_exit(code) }
    }

    fn execute<A, R, F>(scope: &DomainScope<'_>, inbound: Value, entry: F) -> WorkerFrame
    where
        A: DeserializeOwned,
        R: Serialize,
        F: FnOnce(&DomainScope<'_>, A) -> anyhow::Result<R>,
    {
        let fault = match serde_json::from_value::<A>(inbound) {
            Err(e) => Fault::Marshal {
                message: e.to_string(),
            },
            Ok(args) => match panic::catch_unwind(AssertUnwindSafe(|| entry(scope, args))) {
                Ok(Ok(result)) => match serde_json::to_value(&result) {
                    Ok(result) => {
                        return WorkerFrame::Returned {
                            result,
                            statics: scope.take_written(),
                        };
                    }
                    Err(e) => Fault::Marshal {
                        message: e.to_string(),
                    },
                },
                Ok(Err(e)) => Fault::from_error(&e),
                Err(payload) => Fault::Panic {
                    message: panic_message(payload.as_ref()),
                },
            },
        };
        WorkerFrame::Failed {
            fault,
            statics: scope.take_written(),
        }
    }

    fn check(rc: libc::c_int) -> io::Result<()> {
        if rc == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn rlimit(soft: u64, hard: u64) -> libc::rlimit {
        libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        }
    }

    /// Runs in the freshly forked worker, before any entry point code.
    fn confine(confinement: &Confinement, channel_in: RawFd, channel_out: RawFd) -> io::Result<()> {
        // SAFETY: plain syscalls on descriptors this process owns; the
        // worker is single-threaded at this point.
        unsafe {
            check(libc::setpgid(0, 0))?;

            // Lift both ends clear of 3 and 4 first so neither dup2 clobbers the other.
            let high_in = libc::fcntl(channel_in, libc::F_DUPFD, KEPT_DESCRIPTORS as libc::c_int);
            check(high_in)?;
            let high_out = libc::fcntl(channel_out, libc::F_DUPFD, KEPT_DESCRIPTORS as libc::c_int);
            check(high_out)?;
            check(libc::dup2(high_in, CHANNEL_IN))?;
            check(libc::dup2(high_out, CHANNEL_OUT))?;
            close_descriptors_from(KEPT_DESCRIPTORS as libc::c_int);

            if confinement.cap_descriptors {
                check(libc::setrlimit(
                    libc::RLIMIT_NOFILE,
                    &rlimit(KEPT_DESCRIPTORS, KEPT_DESCRIPTORS),
                ))?;
            }
            if let Some(seconds) = confinement.limits.cpu_seconds {
                check(libc::setrlimit(libc::RLIMIT_CPU, &rlimit(seconds, seconds + 1)))?;
            }
            if let Some(bytes) = confinement.limits.max_memory_bytes {
                check(libc::setrlimit(libc::RLIMIT_AS, &rlimit(bytes, bytes)))?;
            }
            if confinement.clear_environment {
                let keys: Vec<_> = std::env::vars_os().map(|(key, _)| key).collect();
                for key in keys {
                    std::env::remove_var(key);
                }
            }
        }
        Ok(())
    }

    /// Closes every descriptor numbered `first` or above.
    unsafe fn close_descriptors_from(first: libc::c_int) {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: close_range(2) only closes descriptors.
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_close_range,
                    first as libc::c_long,
                    libc::c_uint::MAX as libc::c_long,
                    0 as libc::c_long,
                )
            };
            if rc == 0 {
                return;
            }
        }
        // SAFETY: sysconf has no preconditions.
        let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let max = if max <= 0 { 1024 } else { max.min(65_536) as libc::c_int };
        for fd in first..max {
            // SAFETY: closing a descriptor that may or may not be open.
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn invoke<A, R, F, H>(
    domain: &Domain,
    _caller: &str,
    _full_trust: bool,
    _inbound: Value,
    _entry: F,
    _host: H,
) -> Result<R, BoundaryError>
where
    F: FnOnce(&DomainScope<'_>, A) -> anyhow::Result<R>,
    H: FnMut(Value) -> anyhow::Result<Value>,
{
    Err(BoundaryError::Worker {
        boundary: domain.name.clone(),
        reason: "worker processes need a unix host".to_string(),
    })
}

#[cfg(not(unix))]
pub(crate) fn terminate_all(_domain: &Domain) -> usize {
    0
}
