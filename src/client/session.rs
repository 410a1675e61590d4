use std::fmt;

use crate::client::snapshot::Invocation;

/// Where the page is in one Execute cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Waiting for every upload to settle; `failed` is set once any of them failed
    Uploading {
        pending: usize,
        failed: bool,
    },
    Executing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Execute clicked with `uploads` file pickers holding files
    ExecuteClicked { uploads: usize },
    UploadFinished,
    UploadFailed(String),
    Response { status: u16, body: String },
    TransportFailed(String),
}

/// What the page must do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    StartUploads(usize),
    /// Collect the visible containers and send one execution request
    Execute,
    /// Put the inputs back the way they were before Execute was clicked
    RestoreInputs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Sent,
    Received,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub kind: LogKind,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let glyph = match self.kind {
            LogKind::Sent => '→',
            LogKind::Received => '←',
            LogKind::Failed => '⤬',
        };
        write!(f, "{glyph} {}", self.text)
    }
}

/// Execute button and log of one page load
#[derive(Debug, Clone)]
pub struct Session {
    phase: Phase,
    log: Vec<LogLine>,
    /// Output already arrives over the live connection, so responses only mark completion
    live: bool,
}

impl Session {
    #[must_use]
    pub fn new(live: bool) -> Self {
        Session {
            phase: Phase::Idle,
            log: Vec::new(),
            live,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn execute_enabled(&self) -> bool {
        self.phase == Phase::Idle
    }

    #[must_use]
    pub fn log(&self) -> &[LogLine] {
        &self.log
    }

    pub fn set_live(&mut self, live: bool) {
        self.live = live;
    }

    fn push(&mut self, kind: LogKind, text: impl Into<String>) {
        self.log.push(LogLine {
            kind,
            text: text.into(),
        });
    }

    /// Log the request about to be sent
    pub fn sending(&mut self, invocation: &Invocation) {
        self.push(LogKind::Sent, invocation.command_line());
    }

    /// One upload settled. Nothing happens until the last one does, so a late
    /// success can never overwrite inputs that were restored after a failure.
    fn settle(&mut self, pending: usize, failed: bool) -> Option<Effect> {
        if pending > 1 {
            self.phase = Phase::Uploading {
                pending: pending - 1,
                failed,
            };
            None
        } else if failed {
            self.phase = Phase::Idle;
            Some(Effect::RestoreInputs)
        } else {
            self.phase = Phase::Executing;
            Some(Effect::Execute)
        }
    }

    /// Advance the state machine. Events that do not apply to the current
    /// phase (a click while busy, a late response) are ignored.
    pub fn handle(&mut self, event: Event) -> Option<Effect> {
        match (self.phase, event) {
            (Phase::Idle, Event::ExecuteClicked { uploads: 0 }) => {
                self.phase = Phase::Executing;
                Some(Effect::Execute)
            }
            (Phase::Idle, Event::ExecuteClicked { uploads }) => {
                self.phase = Phase::Uploading {
                    pending: uploads,
                    failed: false,
                };
                Some(Effect::StartUploads(uploads))
            }
            (Phase::Uploading { pending, failed }, Event::UploadFinished) => {
                self.settle(pending, failed)
            }
            (Phase::Uploading { pending, failed }, Event::UploadFailed(message)) => {
                if !failed {
                    self.push(LogKind::Failed, message);
                }
                self.settle(pending, true)
            }
            (Phase::Executing, Event::Response { status, body }) => {
                if !(200..300).contains(&status) {
                    self.push(LogKind::Failed, body);
                } else if self.live {
                    self.push(LogKind::Received, "Finished.");
                } else {
                    self.push(LogKind::Received, body);
                }
                self.phase = Phase::Idle;
                None
            }
            (Phase::Executing, Event::TransportFailed(message)) => {
                self.push(LogKind::Failed, message);
                self.phase = Phase::Idle;
                None
            }
            _ => None,
        }
    }
}
