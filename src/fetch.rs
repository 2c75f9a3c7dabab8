//! Batch fetch protocol
//!
//! Missing content is never fetched one object at a time. Callers open a
//! [`FetchSession`], stream every id they discover into it with
//! [`FetchSession::request`], and block only at [`FetchSession::finish`].
//!
//! [`ProcessFetcher`] talks to an external helper over stdin:
//!
//! ```text
//! fetch <id>\n      (one line per request, written as discovered)
//! done\n            (written by finish, then stdin is closed)
//! ```
//!
//! The helper's exit status is the result of the whole batch. A non-zero
//! exit is a hard failure.

use std::cell::RefCell;
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::rc::Rc;

use tracing::debug;

use crate::error::{Error, Result};

/// Starts fetch sessions.
pub trait Fetcher {
    fn start(&self) -> Result<Box<dyn FetchSession>>;
}

/// One pipelined batch of fetch requests.
pub trait FetchSession {
    /// Queue an id for fetching. Must not block on the network.
    fn request(&mut self, id: &str) -> Result<()>;

    /// Signal the end of the batch and wait for the helper to finish.
    fn finish(self: Box<Self>) -> Result<()>;
}

// ── Process helper ─────────────────────────────────────────────────────

/// Runs an external helper program per session.
#[derive(Debug, Clone)]
pub struct ProcessFetcher {
    program: String,
    args: Vec<String>,
}

impl ProcessFetcher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a command line such as `["helper", "--stdin"]`.
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Usage("fetch helper command is empty".into()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

impl Fetcher for ProcessFetcher {
    fn start(&self) -> Result<Box<dyn FetchSession>> {
        debug!(program = %self.program, "starting fetch helper");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::FetchFailed("helper stdin unavailable".into()))?;
        Ok(Box::new(ProcessSession {
            child,
            stdin: Some(stdin),
            requested: 0,
        }))
    }
}

struct ProcessSession {
    child: Child,
    stdin: Option<ChildStdin>,
    requested: usize,
}

impl FetchSession for ProcessSession {
    fn request(&mut self, id: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::FetchFailed("session already finished".into()))?;
        writeln!(stdin, "fetch {id}")?;
        self.requested += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            // The helper may exit early; a broken pipe is reported via the exit status.
            let _ = writeln!(stdin, "done");
            drop(stdin);
        }
        let status = self.child.wait()?;
        debug!(requested = self.requested, %status, "fetch helper finished");
        if status.success() {
            Ok(())
        } else {
            Err(Error::FetchFailed(format!(
                "helper exited with {status} after {} request(s)",
                self.requested
            )))
        }
    }
}

// ── Recording fetcher ──────────────────────────────────────────────────

/// In-process fetcher that records batches. Every id requested in a
/// session is recorded when the session finishes.
#[derive(Debug, Clone, Default)]
pub struct RecordingFetcher {
    batches: Rc<RefCell<Vec<Vec<String>>>>,
    fail: bool,
}

impl RecordingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fetcher whose sessions always fail at `finish`.
    pub fn failing() -> Self {
        Self {
            batches: Rc::default(),
            fail: true,
        }
    }

    /// Batches completed so far.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.borrow().clone()
    }
}

impl Fetcher for RecordingFetcher {
    fn start(&self) -> Result<Box<dyn FetchSession>> {
        Ok(Box::new(RecordingSession {
            batches: Rc::clone(&self.batches),
            ids: Vec::new(),
            fail: self.fail,
        }))
    }
}

struct RecordingSession {
    batches: Rc<RefCell<Vec<Vec<String>>>>,
    ids: Vec<String>,
    fail: bool,
}

impl FetchSession for RecordingSession {
    fn request(&mut self, id: &str) -> Result<()> {
        self.ids.push(id.to_string());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.batches.borrow_mut().push(self.ids);
        if self.fail {
            Err(Error::FetchFailed("recording fetcher set to fail".into()))
        } else {
            Ok(())
        }
    }
}

/// Run one session over `ids`.
pub fn fetch_batch<'a>(
    fetcher: &dyn Fetcher,
    ids: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let mut session = fetcher.start()?;
    for id in ids {
        session.request(id)?;
    }
    session.finish()
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_fetcher_one_batch_per_session() {
        let fetcher = RecordingFetcher::new();
        fetch_batch(&fetcher, ["a", "b", "c"]).unwrap();
        fetch_batch(&fetcher, ["d"]).unwrap();
        assert_eq!(
            fetcher.batches(),
            vec![vec!["a".to_string(), "b".into(), "c".into()], vec!["d".to_string()]]
        );
    }

    #[test]
    fn test_failing_fetcher_reports_failure() {
        let fetcher = RecordingFetcher::failing();
        let err = fetch_batch(&fetcher, ["a"]).unwrap_err();
        assert!(matches!(err, Error::FetchFailed(_)));
    }

    #[test]
    fn test_process_fetcher_success() {
        let fetcher = ProcessFetcher::new("sh", vec!["-c".into(), "cat > /dev/null".into()]);
        fetch_batch(&fetcher, ["abc", "def"]).unwrap();
    }

    #[test]
    fn test_process_fetcher_nonzero_exit_is_hard_failure() {
        let fetcher = ProcessFetcher::new(
            "sh",
            vec!["-c".into(), "cat > /dev/null; exit 3".into()],
        );
        let err = fetch_batch(&fetcher, ["abc"]).unwrap_err();
        assert!(matches!(err, Error::FetchFailed(_)));
    }

    #[test]
    fn test_from_command_rejects_empty() {
        assert!(ProcessFetcher::from_command(&[]).is_err());
        let f = ProcessFetcher::from_command(&["helper".into(), "--x".into()]).unwrap();
        assert_eq!(f.program, "helper");
        assert_eq!(f.args, vec!["--x".to_string()]);
    }
}
