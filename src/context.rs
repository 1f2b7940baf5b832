//! Per-invocation execution context.
//!
//! Every operation receives one of these instead of consulting global state:
//! whether an operator can be asked questions, how confirmations are answered
//! when nobody is asked, and which servers are forced to count as local.

use crate::error::Result;
use std::collections::HashSet;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// How confirmation prompts are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmPolicy {
    /// Ask the operator.
    #[default]
    Ask,
    /// Answer yes without asking.
    AcceptAll,
    /// Answer no without asking.
    DeclineAll,
}

/// Source of operator answers.
pub trait Prompter: Send + Sync {
    /// Shows `message` and returns the raw answer line.
    ///
    /// End of input is reported as [`io::ErrorKind::UnexpectedEof`].
    fn ask(&self, message: &str) -> io::Result<String>;
}

/// Prompts on stderr and reads answers from stdin.
#[derive(Debug, Default)]
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn ask(&self, message: &str) -> io::Result<String> {
        let mut stderr = io::stderr().lock();
        write!(stderr, "{} [y/n] ", message)?;
        stderr.flush()?;

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"));
        }
        Ok(line)
    }
}

/// Settings of one invocation.
///
/// # Examples
///
/// ```
/// use mongo_runner::context::{ConfirmPolicy, ExecutionContext};
///
/// let context = ExecutionContext::new()
///     .with_confirm(ConfirmPolicy::AcceptAll)
///     .assume_local("alpha");
///
/// assert!(context.is_assumed_local("alpha"));
/// assert!(!context.is_assumed_local("beta"));
/// assert!(context.confirm("Proceed?").unwrap());
/// ```
#[derive(Clone)]
pub struct ExecutionContext {
    /// Correlates log lines of one invocation.
    pub invocation_id: Uuid,
    /// Whether an operator is attached.
    pub interactive: bool,
    /// How confirmations are answered.
    pub confirm: ConfirmPolicy,
    /// Server ids treated as local regardless of their address.
    pub assume_local: HashSet<String>,
    /// Extra diagnostic output requested.
    pub verbose: bool,
    prompter: Arc<dyn Prompter>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("invocation_id", &self.invocation_id)
            .field("interactive", &self.interactive)
            .field("confirm", &self.confirm)
            .field("assume_local", &self.assume_local)
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Interactive context asking on the console.
    pub fn new() -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            interactive: true,
            confirm: ConfirmPolicy::Ask,
            assume_local: HashSet::new(),
            verbose: false,
            prompter: Arc::new(StdinPrompter),
        }
    }

    /// Context for unattended runs. Every prompt is declined.
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            ..Self::new()
        }
    }

    /// Replaces the answer source.
    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Sets the confirmation policy.
    pub fn with_confirm(mut self, confirm: ConfirmPolicy) -> Self {
        self.confirm = confirm;
        self
    }

    /// Treats a server as local regardless of its address.
    pub fn assume_local(mut self, server_id: impl Into<String>) -> Self {
        self.assume_local.insert(server_id.into());
        self
    }

    /// Whether a server was forced local.
    pub fn is_assumed_local(&self, server_id: &str) -> bool {
        self.assume_local.contains(server_id)
    }

    /// Asks the operator a yes/no question.
    ///
    /// A non-interactive context answers no whatever the policy. Otherwise
    /// blanket policies answer without asking, closed input answers no and
    /// unrecognized answers repeat the question.
    pub fn confirm(&self, message: &str) -> Result<bool> {
        if !self.interactive {
            debug!(question = message, "Not interactive; answering no");
            return Ok(false);
        }
        match self.confirm {
            ConfirmPolicy::DeclineAll => return Ok(false),
            ConfirmPolicy::AcceptAll => return Ok(true),
            ConfirmPolicy::Ask => {}
        }

        loop {
            let answer = match self.prompter.ask(message) {
                Ok(answer) => answer,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("Input closed while prompting; answering no");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };
            match answer.trim().to_lowercase().as_str() {
                "yes" | "ye" | "y" => return Ok(true),
                "no" | "n" => return Ok(false),
                other => debug!(answer = other, "Unrecognized answer, asking again"),
            }
        }
    }
}
