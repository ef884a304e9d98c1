use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

/// A file opened for a `<` or `>` redirection.
#[derive(Debug)]
pub struct Redirection {
    path: PathBuf,
    fd: OwnedFd,
}

impl Redirection {
    pub(crate) fn new(path: PathBuf, fd: OwnedFd) -> Self {
        Self { path, fd }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Where a stage reads its standard input from.
#[derive(Debug, Default)]
pub enum Source {
    #[default]
    Inherit,
    /// Read end of the pipe at this index in the owning [`crate::pipeline::Pipeline`].
    Pipe(usize),
    File(Redirection),
}

/// Where a stage writes its standard output to.
#[derive(Debug, Default)]
pub enum Sink {
    #[default]
    Inherit,
    /// Write end of the pipe at this index in the owning [`crate::pipeline::Pipeline`].
    Pipe(usize),
    File(Redirection),
}

/// Which half of a pipe a descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Read,
    Write,
}

/// A pipe descriptor referenced by pipe index rather than by raw number, so it can never
/// go stale after the parent closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeEnd {
    pub pipe: usize,
    pub end: End,
}

/// One command of a pipeline: what to run and how its standard streams are wired.
#[derive(Debug)]
pub struct Stage {
    pub(crate) executable_path: PathBuf,
    pub(crate) display_name: String,
    pub(crate) arguments: Vec<String>,
    pub(crate) stdin: Source,
    pub(crate) stdout: Sink,
    pub(crate) close_set: Vec<PipeEnd>,
}

impl Stage {
    pub(crate) fn new(executable_path: PathBuf, display_name: String) -> Self {
        Self {
            arguments: vec![display_name.clone()],
            executable_path,
            display_name,
            stdin: Source::Inherit,
            stdout: Sink::Inherit,
            close_set: Vec::new(),
        }
    }

    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    /// The invoked name, passed as `argv[0]`.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Full argument vector; the first element is always [`Stage::display_name`].
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn stdin(&self) -> &Source {
        &self.stdin
    }

    pub fn stdout(&self) -> &Sink {
        &self.stdout
    }

    /// Pipe ends of neighbouring stages that this stage's child must not keep open.
    pub fn close_set(&self) -> &[PipeEnd] {
        &self.close_set
    }

    /// Raw numbers of the redirection files this stage owns.
    pub(crate) fn file_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        let input = match &self.stdin {
            Source::File(file) => Some(file.raw_fd()),
            _ => None,
        };
        let output = match &self.stdout {
            Sink::File(file) => Some(file.raw_fd()),
            _ => None,
        };
        input.into_iter().chain(output)
    }
}
