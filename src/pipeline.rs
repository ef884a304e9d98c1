//! Links stages into a chain and owns the pipes between them.

use crate::env::Environment;
use crate::error::{PipelineError, RedirectionFault, Result, SyntaxFault};
use crate::parser::{Symbol, TokenCursor, parse_stage};
use crate::stage::{End, PipeEnd, Sink, Source, Stage};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::debug;

/// An OS pipe joining two adjacent stages.
#[derive(Debug)]
pub struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    /// Both ends are close-on-exec from the moment they exist, so a child forked by
    /// another thread in between can never inherit them.
    fn open() -> nix::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Pipe { read, write })
    }

    pub fn raw_fd(&self, end: End) -> RawFd {
        match end {
            End::Read => self.read.as_raw_fd(),
            End::Write => self.write.as_raw_fd(),
        }
    }
}

/// An ordered chain of stages, ready to be launched.
///
/// Pipe `i` always connects stage `i` (writer) to stage `i + 1` (reader). Dropping a
/// `Pipeline` closes every descriptor it still owns.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) stages: Vec<Stage>,
    pub(crate) pipes: Vec<Pipe>,
}

impl Pipeline {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn pipes(&self) -> &[Pipe] {
        &self.pipes
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Build the full stage chain for `tokens`.
///
/// Stages are split on `|`; one pipe is allocated per separator. A stage that already
/// sends its output to a file cannot feed a pipe, and a stage fed by a pipe cannot also
/// read from a file. Nothing is handed back on failure: every file and pipe opened so far
/// is closed when the partial pipeline is dropped.
pub fn build_pipeline<S: AsRef<str>>(tokens: &[S], env: &Environment) -> Result<Pipeline> {
    build_with(tokens, env, Pipe::open)
}

fn build_with<S, F>(tokens: &[S], env: &Environment, mut open_pipe: F) -> Result<Pipeline>
where
    S: AsRef<str>,
    F: FnMut() -> nix::Result<Pipe>,
{
    if tokens.is_empty() {
        return Err(SyntaxFault::EmptyPipeline.into());
    }

    let mut cursor = TokenCursor::new(tokens);
    let mut pipeline = Pipeline {
        stages: Vec::new(),
        pipes: Vec::new(),
    };
    let mut feeding: Option<usize> = None;

    loop {
        let mut stage = parse_stage(&mut cursor, env)?;

        if let Some(pipe) = feeding.take() {
            if !matches!(stage.stdin, Source::Inherit) {
                return Err(RedirectionFault::InputConflictsWithPipe {
                    command: stage.display_name,
                }
                .into());
            }
            stage.stdin = Source::Pipe(pipe);
            stage.close_set.push(PipeEnd {
                pipe,
                end: End::Write,
            });
        }

        let position = cursor.pos();
        match cursor.peek() {
            None => {
                pipeline.stages.push(stage);
                break;
            }
            Some(token) if Symbol::decode(token) == Some(Symbol::PipeSeparator) => {
                cursor.consume();
                if !matches!(stage.stdout, Sink::Inherit) {
                    return Err(RedirectionFault::OutputConflictsWithPipe {
                        command: stage.display_name,
                    }
                    .into());
                }

                let index = pipeline.pipes.len();
                let pipe = open_pipe().map_err(|source| PipelineError::Pipe {
                    command: stage.display_name.clone(),
                    source,
                })?;
                debug!(
                    index,
                    read = pipe.raw_fd(End::Read),
                    write = pipe.raw_fd(End::Write),
                    "allocated pipe"
                );
                pipeline.pipes.push(pipe);

                stage.stdout = Sink::Pipe(index);
                stage.close_set.push(PipeEnd {
                    pipe: index,
                    end: End::Read,
                });
                pipeline.stages.push(stage);
                feeding = Some(index);
            }
            Some(token) => {
                return Err(SyntaxFault::UnexpectedToken {
                    token: token.to_string(),
                    position,
                }
                .into());
            }
        }
    }

    debug!(
        stages = pipeline.stages.len(),
        pipes = pipeline.pipes.len(),
        "built pipeline"
    );
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fake_search_path, open_fds, serial};
    use nix::errno::Errno;
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    fn tokens(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn no_separator_means_one_stage() {
        let _serial = serial();
        let (_dir, env) = fake_search_path(&["echo"]);
        let pipeline = build_pipeline(&tokens("echo hi there"), &env).unwrap();
        assert_eq!(pipeline.len(), 1);
        assert!(pipeline.pipes().is_empty());
        let stage = &pipeline.stages()[0];
        assert_eq!(stage.arguments(), ["echo", "hi", "there"]);
        assert!(matches!(stage.stdin(), Source::Inherit));
        assert!(matches!(stage.stdout(), Sink::Inherit));
        assert!(stage.close_set().is_empty());
    }

    #[test]
    fn k_separators_give_k_pipes() {
        let _serial = serial();
        let (_dir, env) = fake_search_path(&["cat", "sort", "uniq", "wc"]);
        let pipeline = build_pipeline(&tokens("cat | sort | uniq -c | wc -l"), &env).unwrap();
        assert_eq!(pipeline.len(), 4);
        assert_eq!(pipeline.pipes().len(), 3);

        for (i, stage) in pipeline.stages().iter().enumerate() {
            match stage.stdin() {
                Source::Pipe(p) => assert_eq!(*p + 1, i),
                Source::Inherit => assert_eq!(i, 0),
                Source::File(_) => panic!("unexpected file input"),
            }
            match stage.stdout() {
                Sink::Pipe(p) => assert_eq!(*p, i),
                Sink::Inherit => assert_eq!(i, 3),
                Sink::File(_) => panic!("unexpected file output"),
            }
        }
    }

    #[test]
    fn close_sets_hold_the_sibling_ends() {
        let _serial = serial();
        let (_dir, env) = fake_search_path(&["ls", "wc"]);
        let pipeline = build_pipeline(&tokens("ls | wc"), &env).unwrap();
        let [ls, wc] = pipeline.stages() else {
            panic!("expected two stages");
        };
        assert!(matches!(ls.stdout(), Sink::Pipe(0)));
        assert!(matches!(wc.stdin(), Source::Pipe(0)));
        assert_eq!(ls.close_set(), [PipeEnd { pipe: 0, end: End::Read }]);
        assert_eq!(wc.close_set(), [PipeEnd { pipe: 0, end: End::Write }]);
    }

    #[test]
    fn redirected_output_cannot_feed_a_pipe() {
        let _serial = serial();
        let (dir, env) = fake_search_path(&["cat", "wc"]);
        let out = dir.path().join("a").display().to_string();
        let toks = vec![
            "cat".to_string(),
            ">".into(),
            out,
            "|".into(),
            "wc".into(),
        ];

        let before = open_fds();
        let err = build_pipeline(&toks, &env).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Redirection(RedirectionFault::OutputConflictsWithPipe { ref command })
                if command == "cat"
        ));
        assert_eq!(open_fds(), before);
    }

    #[test]
    fn piped_stage_cannot_read_a_file() {
        let _serial = serial();
        let (dir, env) = fake_search_path(&["ls", "wc"]);
        let input = dir.path().join("in");
        std::fs::write(&input, "").unwrap();
        let toks = vec![
            "ls".to_string(),
            "|".into(),
            "wc".into(),
            "<".into(),
            input.display().to_string(),
        ];

        let before = open_fds();
        let err = build_pipeline(&toks, &env).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Redirection(RedirectionFault::InputConflictsWithPipe { .. })
        ));
        assert_eq!(open_fds(), before);
    }

    #[test]
    fn late_failure_releases_earlier_stages() {
        let _serial = serial();
        let (dir, env) = fake_search_path(&["cat", "sort"]);
        let input = dir.path().join("in");
        std::fs::write(&input, "").unwrap();
        let toks = vec![
            "cat".to_string(),
            "<".into(),
            input.display().to_string(),
            "|".into(),
            "sort".into(),
            "|".into(),
            "nosuchcmd".into(),
        ];

        let before = open_fds();
        let err = build_pipeline(&toks, &env).unwrap_err();
        assert!(matches!(err, PipelineError::Resolution { ref command } if command == "nosuchcmd"));
        assert_eq!(open_fds(), before);
    }

    #[test]
    fn pipe_exhaustion_releases_earlier_stages() {
        let _serial = serial();
        let (dir, env) = fake_search_path(&["cat", "sort", "uniq"]);
        let input = dir.path().join("in");
        std::fs::write(&input, "").unwrap();
        let toks = vec![
            "cat".to_string(),
            "<".into(),
            input.display().to_string(),
            "|".into(),
            "sort".into(),
            "|".into(),
            "uniq".into(),
        ];

        let before = open_fds();
        let mut allowed = 1;
        let err = build_with(&toks, &env, || {
            if allowed == 0 {
                return Err(Errno::EMFILE);
            }
            allowed -= 1;
            Pipe::open()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Pipe { ref command, source: Errno::EMFILE } if command == "sort"
        ));
        assert!(err.is_construction());
        assert_eq!(open_fds(), before);
    }

    #[test]
    fn pipes_are_close_on_exec() {
        let _serial = serial();
        let pipe = Pipe::open().unwrap();
        for end in [End::Read, End::Write] {
            let flags = fcntl(pipe.raw_fd(end), FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn dropping_a_built_pipeline_closes_everything() {
        let _serial = serial();
        let (dir, env) = fake_search_path(&["sort", "uniq"]);
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::write(&input, "").unwrap();
        let toks = vec![
            "sort".to_string(),
            "<".into(),
            input.display().to_string(),
            "|".into(),
            "uniq".into(),
            ">".into(),
            output.display().to_string(),
        ];

        let before = open_fds();
        let pipeline = build_pipeline(&toks, &env).unwrap();
        // two files and both ends of one pipe
        assert_eq!(open_fds(), before + 4);
        drop(pipeline);
        assert_eq!(open_fds(), before);
    }

    #[test]
    fn syntax_errors() {
        let _serial = serial();
        let (dir, env) = fake_search_path(&["ls", "wc", "cat"]);
        let empty: [&str; 0] = [];
        assert!(matches!(
            build_pipeline(&empty, &env),
            Err(PipelineError::Syntax(SyntaxFault::EmptyPipeline))
        ));

        for (line, at) in [("| ls", 0), ("ls |", 2), ("ls | | wc", 2)] {
            let err = build_pipeline(&tokens(line), &env).unwrap_err();
            assert!(
                matches!(err, PipelineError::Syntax(SyntaxFault::MissingCommand { position }) if position == at),
                "{line}: {err:?}"
            );
        }

        let out = dir.path().join("out").display().to_string();
        let toks = vec!["cat".to_string(), ">".into(), out, "extra".into()];
        let err = build_pipeline(&toks, &env).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Syntax(SyntaxFault::UnexpectedToken { ref token, position: 3 })
                if token == "extra"
        ));
    }

    #[test]
    fn unresolvable_command() {
        let _serial = serial();
        let (_dir, env) = fake_search_path(&[]);
        let err = build_pipeline(&["nosuchcmd"], &env).unwrap_err();
        assert!(err.is_construction());
        assert_eq!(err.to_string(), "nosuchcmd: command not found");
    }
}
