//! Interactive run control: commands, where they come from, and progress output.
//!
//! Commands are single letters typed on stdin followed by Enter:
//!
//! | Key | Effect |
//! |-----|--------|
//! | `p` | toggle pause |
//! | `n` | process one more record while paused |
//! | `l` | print the last committed record |
//! | `v<level>` | set verbosity, level `0`-`4` or `s`, `e`, `i`, `d`, `x` |
//! | `d [file]` | detach: ignore hangups, send progress to `file`, stop reading stdin |
//! | `q` | stop after the records in flight |
//!
//! The coordinator polls a [`CommandSource`] from its own thread and never
//! blocks on it.

mod progress;

pub use progress::{progress_bar, progress_percent, ProgressEstimator, ProgressReport, SAMPLE_WINDOW};

use crate::config::Verbosity;
use crate::record::Record;
use crate::{PipelineError, Result};
use crossbeam_channel::{Receiver, TryRecvError};
use std::fs::File;
use std::io::{BufRead, BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A request from the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    TogglePause,
    Step,
    PrintLast,
    Verbosity(Verbosity),
    Detach(Option<PathBuf>),
    Quit,
}

impl ControlCommand {
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        let mut chars = line.chars();
        let Some(key) = chars.next() else {
            return Err("empty command".to_string());
        };
        let rest = chars.as_str().trim();

        match (key.to_ascii_lowercase(), rest) {
            ('p', "") => Ok(ControlCommand::TogglePause),
            ('n', "") => Ok(ControlCommand::Step),
            ('l', "") => Ok(ControlCommand::PrintLast),
            ('q', "") => Ok(ControlCommand::Quit),
            ('d', "") => Ok(ControlCommand::Detach(None)),
            ('d', path) => Ok(ControlCommand::Detach(Some(PathBuf::from(path)))),
            ('v', level) => level
                .parse::<Verbosity>()
                .map(ControlCommand::Verbosity)
                .map_err(|_| format!("unknown verbosity level '{}', use 0-4 or s/e/i/d/x", level)),
            _ => Err(format!("unknown command '{}'", line)),
        }
    }
}

/// Where control commands come from.
pub trait CommandSource: Send {
    /// Commands that arrived since the last poll. Must not block.
    ///
    /// `committed` is the number of commit slots consumed so far.
    fn poll(&mut self, committed: u64) -> Vec<ControlCommand>;

    /// Stop listening for good.
    fn detach(&mut self) {}
}

/// Reads command lines from stdin on a background thread.
///
/// The thread feeds a channel, so polling only drains what already arrived.
pub struct StdinCommands {
    receiver: Option<Receiver<ControlCommand>>,
    detached: Arc<AtomicBool>,
}

impl StdinCommands {
    pub fn spawn() -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let detached = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&detached);

        std::thread::Builder::new()
            .name("stdin-commands".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match ControlCommand::parse(&line) {
                        Ok(command) => {
                            if sender.send(command).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("{}", e),
                    }
                }
            })
            .map_err(|e| PipelineError::io("spawn stdin reader", e))?;

        Ok(Self {
            receiver: Some(receiver),
            detached,
        })
    }
}

impl CommandSource for StdinCommands {
    fn poll(&mut self, _committed: u64) -> Vec<ControlCommand> {
        let Some(receiver) = &self.receiver else {
            return Vec::new();
        };
        let mut commands = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(command) => commands.push(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.receiver = None;
                    break;
                }
            }
        }
        commands
    }

    fn detach(&mut self) {
        self.detached.store(true, Ordering::Relaxed);
        self.receiver = None;
    }
}

/// When a scripted command fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Once this many commit slots were consumed.
    Committed(u64),
    /// After this many polls since the previous command fired.
    Polls(u64),
}

/// Replays a fixed list of commands, one after another.
#[derive(Debug, Default)]
pub struct ScriptedCommands {
    script: std::collections::VecDeque<(Trigger, ControlCommand)>,
    polls: u64,
}

impl ScriptedCommands {
    pub fn new(script: Vec<(Trigger, ControlCommand)>) -> Self {
        Self {
            script: script.into(),
            polls: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.script.is_empty()
    }
}

impl CommandSource for ScriptedCommands {
    fn poll(&mut self, committed: u64) -> Vec<ControlCommand> {
        self.polls += 1;
        let mut fired = Vec::new();
        while let Some((trigger, _)) = self.script.front() {
            let ready = match *trigger {
                Trigger::Committed(n) => committed >= n,
                Trigger::Polls(n) => self.polls >= n,
            };
            if !ready {
                break;
            }
            if let Some((_, command)) = self.script.pop_front() {
                fired.push(command);
            }
            self.polls = 0;
        }
        fired
    }

    fn detach(&mut self) {
        self.script.clear();
    }
}

/// Destination of progress lines.
pub enum ProgressOutput {
    /// Redraw one line on a terminal.
    Terminal,
    /// One line per whole percent, for logs and pipes.
    Lines,
    File(BufWriter<File>),
    Discard,
}

impl ProgressOutput {
    /// `Terminal` when stderr is a TTY, `Lines` otherwise.
    pub fn detect() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressOutput::Terminal
        } else {
            ProgressOutput::Lines
        }
    }
}

/// Callback applying a verbosity change to the log filter.
pub type VerbosityHook = Box<dyn Fn(Verbosity) + Send>;

const BAR_WIDTH: usize = 40;

/// Command polling plus progress display, owned by the coordinator.
pub struct ControlPlane {
    commands: Option<Box<dyn CommandSource>>,
    output: ProgressOutput,
    estimator: ProgressEstimator,
    verbosity_hook: Option<VerbosityHook>,
    pause_enabled: bool,
    last_whole_percent: Option<u64>,
    detached: bool,
}

impl ControlPlane {
    pub fn new(commands: Option<Box<dyn CommandSource>>, output: ProgressOutput) -> Self {
        Self {
            commands,
            output,
            estimator: ProgressEstimator::new(Instant::now()),
            verbosity_hook: None,
            pause_enabled: true,
            last_whole_percent: None,
            detached: false,
        }
    }

    /// No commands, no progress output.
    pub fn quiet() -> Self {
        Self::new(None, ProgressOutput::Discard)
    }

    pub fn with_verbosity_hook(mut self, hook: VerbosityHook) -> Self {
        self.verbosity_hook = Some(hook);
        self
    }

    pub fn set_pause_enabled(&mut self, enabled: bool) {
        self.pause_enabled = enabled;
    }

    pub fn pause_enabled(&self) -> bool {
        self.pause_enabled
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn poll(&mut self, committed: u64) -> Vec<ControlCommand> {
        match self.commands.as_mut() {
            Some(source) => source.poll(committed),
            None => Vec::new(),
        }
    }

    pub fn apply_verbosity(&self, level: Verbosity) {
        if let Some(hook) = &self.verbosity_hook {
            hook(level);
        }
    }

    /// Stop reading commands, ignore SIGHUP and move progress output.
    pub fn detach(&mut self, path: Option<PathBuf>) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{signal, SigHandler, Signal};
            // SAFETY: installs SIG_IGN, no handler code runs
            unsafe { signal(Signal::SIGHUP, SigHandler::SigIgn) }
                .map_err(|e| PipelineError::io("ignore SIGHUP", e.into()))?;
        }

        self.end_line();
        self.output = match &path {
            Some(path) => {
                let file = File::create(path)
                    .map_err(|e| PipelineError::io_path("create", path, e))?;
                ProgressOutput::File(BufWriter::new(file))
            }
            None => ProgressOutput::Discard,
        };
        if let Some(mut source) = self.commands.take() {
            source.detach();
        }
        self.detached = true;
        self.pause_enabled = false;

        match path {
            Some(path) => tracing::info!("Detached, progress goes to {}", path.display()),
            None => tracing::info!("Detached, progress output discarded"),
        }
        Ok(())
    }

    /// Sample progress and print it.
    pub fn report(&mut self, bytes_read: u64, percent: f64, processed: u64, state_hint: &str) {
        let report = self
            .estimator
            .update(bytes_read, percent, processed, Instant::now());
        let hint = if !state_hint.is_empty() {
            state_hint
        } else if self.pause_enabled && !self.detached {
            "(Pause: \"p\")"
        } else {
            "(Pause Disabled)"
        };

        match self.output {
            ProgressOutput::Discard => {}
            ProgressOutput::Terminal => {
                eprint!("\r{}", report.render(BAR_WIDTH, hint));
                let _ = std::io::stderr().flush();
            }
            ProgressOutput::Lines | ProgressOutput::File(_) => {
                let whole = report.percent.floor() as u64;
                if self.last_whole_percent.is_some_and(|last| whole <= last) {
                    return;
                }
                self.last_whole_percent = Some(whole);
                let line = report.render(BAR_WIDTH, hint);
                self.write_line(&line);
            }
        }
    }

    /// Print a message (such as the last committed record) to the progress output.
    pub fn show(&mut self, message: &str) {
        self.end_line();
        self.write_line(message);
    }

    pub fn show_record(&mut self, last: Option<&(u64, Record)>) {
        match last {
            Some((seq, record)) => self.show(&format!("Last committed (seq {}): {}", seq, record)),
            None => self.show("No record committed yet"),
        }
    }

    fn write_line(&mut self, line: &str) {
        match &mut self.output {
            ProgressOutput::Discard => {}
            ProgressOutput::Terminal | ProgressOutput::Lines => eprintln!("{}", line),
            ProgressOutput::File(file) => {
                if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                    tracing::warn!("Failed to write progress: {}", e);
                }
            }
        }
    }

    /// Terminate a redrawn terminal line.
    fn end_line(&mut self) {
        if matches!(self.output, ProgressOutput::Terminal) {
            eprintln!();
        }
    }

    pub fn finish(&mut self) {
        self.end_line();
        if let ProgressOutput::File(file) = &mut self.output {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ControlCommand::parse("p"), Ok(ControlCommand::TogglePause));
        assert_eq!(ControlCommand::parse(" n \n"), Ok(ControlCommand::Step));
        assert_eq!(ControlCommand::parse("L"), Ok(ControlCommand::PrintLast));
        assert_eq!(ControlCommand::parse("q"), Ok(ControlCommand::Quit));
        assert_eq!(
            ControlCommand::parse("v3"),
            Ok(ControlCommand::Verbosity(Verbosity::Debug))
        );
        assert_eq!(
            ControlCommand::parse("v x"),
            Ok(ControlCommand::Verbosity(Verbosity::Extreme))
        );
        assert_eq!(ControlCommand::parse("d"), Ok(ControlCommand::Detach(None)));
        assert_eq!(
            ControlCommand::parse("d /tmp/progress.log"),
            Ok(ControlCommand::Detach(Some(PathBuf::from("/tmp/progress.log"))))
        );
        assert!(ControlCommand::parse("v9").is_err());
        assert!(ControlCommand::parse("pause").is_err());
        assert!(ControlCommand::parse("").is_err());
    }

    #[test]
    fn test_scripted_triggers_in_order() {
        let mut script = ScriptedCommands::new(vec![
            (Trigger::Committed(10), ControlCommand::TogglePause),
            (Trigger::Polls(2), ControlCommand::Step),
            (Trigger::Polls(1), ControlCommand::TogglePause),
        ]);

        assert!(script.poll(5).is_empty());
        assert_eq!(script.poll(10), vec![ControlCommand::TogglePause]);
        assert!(script.poll(10).is_empty());
        assert_eq!(script.poll(10), vec![ControlCommand::Step]);
        assert_eq!(script.poll(11), vec![ControlCommand::TogglePause]);
        assert!(script.is_done());
    }

    #[test]
    fn test_detach_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("progress.log");
        let mut plane = ControlPlane::new(
            Some(Box::new(ScriptedCommands::new(vec![(
                Trigger::Polls(1),
                ControlCommand::Quit,
            )]))),
            ProgressOutput::Discard,
        );

        plane.detach(Some(log.clone())).unwrap();
        assert!(plane.is_detached());
        assert!(!plane.pause_enabled());
        assert!(plane.poll(0).is_empty());

        plane.report(0, 12.5, 10, "");
        plane.report(0, 12.9, 11, "");
        plane.report(0, 13.0, 12, "");
        plane.finish();

        let text = std::fs::read_to_string(&log).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("(Pause Disabled)"));
    }

    #[test]
    fn test_verbosity_hook() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let plane = ControlPlane::quiet().with_verbosity_hook(Box::new(move |level| {
            sink.lock().unwrap().push(level);
        }));
        plane.apply_verbosity(Verbosity::Debug);
        assert_eq!(*seen.lock().unwrap(), vec![Verbosity::Debug]);
    }
}
