use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong between a token sequence and a set of exit statuses.
///
/// `Resolution`, `Redirection`, `Syntax` and `Pipe` happen while the pipeline is being
/// built, before any process exists. `Fork` happens while launching; `Exec` is only ever
/// observed inside a child, which reports it on its standard error before exiting.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{command}: command not found")]
    Resolution { command: String },

    #[error(transparent)]
    Redirection(#[from] RedirectionFault),

    #[error(transparent)]
    Syntax(#[from] SyntaxFault),

    #[error("failed to create a pipe after '{command}'")]
    Pipe {
        command: String,
        #[source]
        source: Errno,
    },

    #[error("failed to fork '{command}'")]
    Fork {
        command: String,
        #[source]
        source: Errno,
    },

    #[error("failed to exec {}: {}", .path.display(), .source.desc())]
    Exec {
        path: PathBuf,
        #[source]
        source: Errno,
    },
}

impl PipelineError {
    /// True for failures that abort the build before anything is forked.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            PipelineError::Resolution { .. }
                | PipelineError::Redirection(_)
                | PipelineError::Syntax(_)
                | PipelineError::Pipe { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum RedirectionFault {
    #[error("expected filename after '{symbol}'")]
    MissingFilename { symbol: char },

    #[error("error opening {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' already redirects with '{symbol}'")]
    Duplicate { command: String, symbol: char },

    #[error("'{command}' already has redirected output")]
    OutputConflictsWithPipe { command: String },

    #[error("'{command}' already has redirected input")]
    InputConflictsWithPipe { command: String },
}

#[derive(Debug, Error)]
pub enum SyntaxFault {
    #[error("empty pipeline")]
    EmptyPipeline,

    #[error("expected a command at token {position}")]
    MissingCommand { position: usize },

    #[error("unsupported flow-control symbol '{token}' at token {position}")]
    UnexpectedToken { token: String, position: usize },

    #[error("token {token:?} contains a NUL byte")]
    NulByte { token: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
