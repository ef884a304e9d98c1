//! Forks one process per stage, wires its standard streams and reaps it.

use crate::command::{EXEC_FAILURE_CODE, StageStatus};
use crate::error::{PipelineError, Result, SyntaxFault};
use crate::pipeline::{Pipe, Pipeline};
use crate::stage::{End, PipeEnd, Sink, Source, Stage};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, close, dup2, fork};
use std::ffi::{CString, c_char};
use std::fmt;
use std::io::Write;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::{debug, warn};

/// A forked child that has not been reaped yet.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    command: String,
}

impl ProcessHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Block until the child terminates and retire the handle.
    pub fn wait(self) -> StageStatus {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(status) = StageStatus::from_wait(status) {
                        debug!(command = %self.command, pid = %self.pid, ?status, "reaped child");
                        return status;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(
                        command = %self.command,
                        pid = %self.pid,
                        error = %e,
                        "failed to wait for child"
                    );
                    return StageStatus::Unknown;
                }
            }
        }
    }
}

/// Everything `execv` needs, converted before forking so the child never allocates.
struct ProcessImage {
    command: String,
    executable: PathBuf,
    path: CString,
    argv: Vec<CString>,
    /// NUL-terminated pointers into `argv`; the `CString` buffers never move.
    argv_ptrs: Vec<*const c_char>,
}

impl ProcessImage {
    fn new(stage: &Stage) -> Result<Self> {
        let to_cstring = |text: &[u8]| {
            CString::new(text).map_err(|_| SyntaxFault::NulByte {
                token: String::from_utf8_lossy(text).into_owned(),
            })
        };
        let path = to_cstring(stage.executable_path.as_os_str().as_bytes())?;
        let argv = stage
            .arguments
            .iter()
            .map(|arg| to_cstring(arg.as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let argv_ptrs = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain([ptr::null()])
            .collect();
        Ok(ProcessImage {
            command: stage.display_name.clone(),
            executable: stage.executable_path.clone(),
            path,
            argv,
            argv_ptrs,
        })
    }
}

/// Descriptor plumbing for one child, resolved to raw numbers in the parent.
#[derive(Debug, Default)]
struct Wiring {
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    close: Vec<RawFd>,
}

impl Wiring {
    /// Descriptors the child closes once its own streams are installed. Everything in the
    /// close list goes, low numbers included, except a target `dup2` just filled.
    fn child_closes(&self) -> impl Iterator<Item = RawFd> + '_ {
        let installed_stdin = self.stdin.map(|_| libc::STDIN_FILENO);
        let installed_stdout = self.stdout.map(|_| libc::STDOUT_FILENO);
        self.close
            .iter()
            .copied()
            .filter(move |&fd| Some(fd) != installed_stdin && Some(fd) != installed_stdout)
    }
}

/// Descriptors the parent still holds while the pipeline is being launched.
struct Live {
    stages: Vec<Option<Stage>>,
    pipes: Vec<Option<Pipe>>,
    close_sets: Vec<Vec<PipeEnd>>,
}

impl Live {
    fn new(pipeline: Pipeline) -> Self {
        let close_sets = pipeline
            .stages
            .iter()
            .map(|stage| stage.close_set.clone())
            .collect();
        Live {
            stages: pipeline.stages.into_iter().map(Some).collect(),
            pipes: pipeline.pipes.into_iter().map(Some).collect(),
            close_sets,
        }
    }

    fn pipe_fd(&self, end: PipeEnd) -> Option<RawFd> {
        self.pipes[end.pipe]
            .as_ref()
            .map(|pipe| pipe.raw_fd(end.end))
    }

    fn wiring(&self, index: usize) -> Wiring {
        let mut wiring = Wiring::default();
        if let Some(stage) = &self.stages[index] {
            wiring.stdin = match &stage.stdin {
                Source::Inherit => None,
                Source::Pipe(pipe) => self.pipe_fd(PipeEnd {
                    pipe: *pipe,
                    end: End::Read,
                }),
                Source::File(file) => Some(file.raw_fd()),
            };
            wiring.stdout = match &stage.stdout {
                Sink::Inherit => None,
                Sink::Pipe(pipe) => self.pipe_fd(PipeEnd {
                    pipe: *pipe,
                    end: End::Write,
                }),
                Sink::File(file) => Some(file.raw_fd()),
            };
        }

        // Every pipe end named by any close-set that the parent still holds, plus the
        // redirection files of every stage not launched yet.
        let pipe_ends = self
            .close_sets
            .iter()
            .flatten()
            .filter_map(|end| self.pipe_fd(*end));
        let files = self.stages.iter().flatten().flat_map(Stage::file_fds);
        wiring.close = pipe_ends.chain(files).collect();
        wiring.close.sort_unstable();
        wiring.close.dedup();
        wiring
    }

    /// Parent-side cleanup once stage `index` has a child: its files are no longer needed,
    /// and the pipe into it now has both of its users forked.
    fn release(&mut self, index: usize) {
        self.stages[index] = None;
        if index > 0 {
            self.pipes[index - 1] = None;
        }
    }
}

/// Launch every stage of `pipeline` and wait for all of them.
///
/// Children are forked in order and reaped in the same order. If a fork fails, launching
/// stops, every descriptor the parent still holds is closed, the children already running
/// are waited on, and the fork error is returned.
pub fn launch(pipeline: Pipeline) -> Result<Vec<StageStatus>> {
    launch_with(pipeline, fork_stage)
}

fn launch_with<F>(pipeline: Pipeline, mut fork_fn: F) -> Result<Vec<StageStatus>>
where
    F: FnMut(&ProcessImage, &Wiring) -> Result<Pid>,
{
    let images = pipeline
        .stages
        .iter()
        .map(ProcessImage::new)
        .collect::<Result<Vec<_>>>()?;

    let mut live = Live::new(pipeline);
    let mut handles = Vec::with_capacity(images.len());
    let mut failure = None;

    for (index, image) in images.iter().enumerate() {
        let wiring = live.wiring(index);
        match fork_fn(image, &wiring) {
            Ok(pid) => handles.push(launch_and_track(&mut live, index, image, pid)),
            Err(e) => {
                warn!(command = %image.command, error = %e, "aborting pipeline launch");
                failure = Some(e);
                break;
            }
        }
    }

    // Readers only see end-of-input once the parent's copies are gone.
    drop(live);

    let statuses: Vec<StageStatus> = handles.into_iter().map(ProcessHandle::wait).collect();
    match failure {
        Some(e) => Err(e),
        None => Ok(statuses),
    }
}

/// Split into two processes; the child never returns from here.
fn fork_stage(image: &ProcessImage, wiring: &Wiring) -> Result<Pid> {
    // SAFETY: the child only runs `prepare_and_replace`, which leaves through `execv` or
    // `_exit` and never returns into shared code.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => prepare_and_replace(image, wiring),
        Ok(ForkResult::Parent { child }) => Ok(child),
        Err(source) => Err(PipelineError::Fork {
            command: image.command.clone(),
            source,
        }),
    }
}

/// Parent continuation: drop what the parent no longer needs and hand back the handle.
fn launch_and_track(
    live: &mut Live,
    index: usize,
    image: &ProcessImage,
    pid: Pid,
) -> ProcessHandle {
    debug!(
        command = %image.command,
        %pid,
        stage = index,
        args = image.argv.len() - 1,
        "forked child"
    );
    live.release(index);
    ProcessHandle {
        pid,
        command: image.command.clone(),
    }
}

/// Child continuation: install the stage's descriptors and become the program.
///
/// Nothing here allocates; every buffer was prepared by the parent.
fn prepare_and_replace(image: &ProcessImage, wiring: &Wiring) -> ! {
    // SAFETY: restoring the default disposition is async-signal-safe. The Rust runtime
    // ignores SIGPIPE and that would otherwise survive the exec.
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
    }

    let mut stdout = wiring.stdout;
    if wiring.stdin.is_some() && stdout == Some(libc::STDIN_FILENO) {
        // Installing stdin would overwrite the descriptor stdout still has to read from.
        // SAFETY: F_DUPFD only duplicates a descriptor this process owns.
        let moved = unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_DUPFD_CLOEXEC, 3) };
        if moved < 0 {
            exec_fail(image, Errno::last(), 1);
        }
        stdout = Some(moved);
    }

    for (fd, target) in [
        (wiring.stdin, libc::STDIN_FILENO),
        (stdout, libc::STDOUT_FILENO),
    ] {
        let Some(fd) = fd else { continue };
        if let Err(errno) = dup2(fd, target) {
            exec_fail(image, errno, 1);
        }
        if fd != target {
            let _ = close(fd);
        }
    }

    for fd in wiring.child_closes() {
        let _ = close(fd);
    }

    // SAFETY: `path` and every `argv` entry are NUL-terminated strings owned by `image`,
    // and `argv_ptrs` ends with a null pointer.
    unsafe {
        libc::execv(image.path.as_ptr(), image.argv_ptrs.as_ptr());
    }
    exec_fail(image, Errno::last(), EXEC_FAILURE_CODE)
}

/// Report an exec failure on stderr without allocating or locking, then leave.
fn exec_fail(image: &ProcessImage, errno: Errno, code: i32) -> ! {
    let mut buf = [0u8; 512];
    let message = exec_message(&mut buf, &image.executable, errno);
    // SAFETY: `message` points into `buf`, which outlives both calls; `_exit` skips the
    // parent's atexit handlers and buffered streams.
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
        libc::_exit(code)
    }
}

/// Same text as [`PipelineError::Exec`], rendered without touching the heap.
fn exec_message<'a>(buf: &'a mut [u8], executable: &Path, errno: Errno) -> &'a [u8] {
    render(
        buf,
        format_args!(
            "failed to exec {}: {}",
            executable.display(),
            errno.desc()
        ),
    )
}

/// Format one line into `buf`, truncating if it does not fit.
fn render<'a>(buf: &'a mut [u8], args: fmt::Arguments<'_>) -> &'a [u8] {
    let capacity = buf.len();
    let mut cursor = &mut buf[..];
    let _ = cursor.write_fmt(args);
    let _ = cursor.write_all(b"\n");
    let len = capacity - cursor.len();
    &buf[..len]
}
