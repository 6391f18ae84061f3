//! User-facing output, confirmation prompts, and tracing setup.

use crate::config::RuntimeConfig;
use ctn_error::{CtnError, Result};
use ctn_types::Cx;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fmt;
use std::io::{self, BufRead, BufReader, Stdin};
use std::os::fd::AsFd;
use tracing::level_filters::LevelFilter;

/// Verbosity at which errors and ordinary prompts are printed.
pub const VERBOSITY_ERROR: i32 = 1;
/// Critical prompts print even when errors are silenced.
pub const VERBOSITY_CRITICAL: i32 = 0;

/// Map the signed command-line verbosity to a tracing level.
#[must_use]
pub fn level_for_verbosity(verbosity: i32) -> LevelFilter {
    match verbosity {
        i32::MIN..=0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the stderr fmt subscriber. A second call is a no-op.
pub fn init_tracing(verbosity: i32) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level_for_verbosity(verbosity))
        .with_target(false)
        .try_init();
}

/// How long a prompt waits for input before looking at the stop flag again.
const PROMPT_POLL_MS: u16 = 100;

/// Where prompt answers come from.
trait PromptInput: Send {
    /// Wait up to `timeout_ms` for a line to become readable.
    fn wait_readable(&mut self, timeout_ms: u16) -> io::Result<bool>;

    fn read_line(&mut self, line: &mut String) -> io::Result<usize>;
}

/// Standard input, polled so a termination request can interrupt a prompt.
struct StdinInput {
    reader: BufReader<Stdin>,
}

impl PromptInput for StdinInput {
    fn wait_readable(&mut self, timeout_ms: u16) -> io::Result<bool> {
        if !self.reader.buffer().is_empty() {
            return Ok(true);
        }
        let stdin = io::stdin();
        let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms)).map_err(io::Error::from)?;
        Ok(ready > 0)
    }

    fn read_line(&mut self, line: &mut String) -> io::Result<usize> {
        self.reader.read_line(line)
    }
}

/// Any in-memory reader; always ready.
struct ReaderInput(Box<dyn BufRead + Send>);

impl PromptInput for ReaderInput {
    fn wait_readable(&mut self, _timeout_ms: u16) -> io::Result<bool> {
        Ok(true)
    }

    fn read_line(&mut self, line: &mut String) -> io::Result<usize> {
        self.0.read_line(line)
    }
}

pub struct Console {
    progname: String,
    verbosity: i32,
    interactive: bool,
    cx: Cx,
    input: Box<dyn PromptInput>,
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("progname", &self.progname)
            .field("verbosity", &self.verbosity)
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}

impl Console {
    /// Console reading answers from standard input.
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            progname: config.progname.clone(),
            verbosity: config.verbosity,
            interactive: config.interactive,
            cx: Cx::for_request(),
            input: Box::new(StdinInput {
                reader: BufReader::new(io::stdin()),
            }),
        }
    }

    /// Replace the answer source.
    #[must_use]
    pub fn with_input(mut self, input: impl BufRead + Send + 'static) -> Self {
        self.input = Box::new(ReaderInput(Box::new(input)));
        self
    }

    /// Abandon prompts once `cx` is asked to stop.
    #[must_use]
    pub fn with_cx(mut self, cx: Cx) -> Self {
        self.set_cx(cx);
        self
    }

    pub(crate) fn set_cx(&mut self, cx: Cx) {
        self.cx = cx;
    }

    #[must_use]
    pub fn progname(&self) -> &str {
        &self.progname
    }

    #[must_use]
    pub fn verbosity(&self) -> i32 {
        self.verbosity
    }

    #[must_use]
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Print `<progname>: <message>` on stderr unless errors are silenced.
    pub fn error(&self, message: impl fmt::Display) {
        if self.verbosity >= VERBOSITY_ERROR {
            eprintln!("{}", self.format_error(message));
        }
    }

    #[must_use]
    pub fn format_error(&self, message: impl fmt::Display) -> String {
        format!("{}: {message}", self.progname)
    }

    /// Ask a yes/no question in interactive mode; otherwise assume yes.
    pub fn confirm(&mut self, question: impl fmt::Display) -> Result<bool> {
        if !self.interactive {
            return Ok(true);
        }
        self.ask(VERBOSITY_ERROR, question)
    }

    /// Ask even without `--interactive`.
    pub fn confirm_critical(&mut self, question: impl fmt::Display) -> Result<bool> {
        self.ask(VERBOSITY_CRITICAL, question)
    }

    /// Unreadable input declines. A stop request while waiting is
    /// [`CtnError::Cancelled`].
    fn ask(&mut self, level: i32, question: impl fmt::Display) -> Result<bool> {
        if self.verbosity >= level {
            eprint!("{question} ");
        }
        loop {
            self.cx.checkpoint().map_err(|_| CtnError::Cancelled)?;
            match self.input.wait_readable(PROMPT_POLL_MS) {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Ok(false),
            }
        }
        let mut answer = String::new();
        match self.input.read_line(&mut answer) {
            Ok(0) | Err(_) => Ok(false),
            Ok(_) => Ok(matches!(answer.chars().next(), Some('y' | 'Y'))),
        }
    }
}
