//! Key injection sinks.
//!
//! The scheduler talks to a [`KeySender`] and nothing else. The real sink
//! shells out to `xdotool`; [`TimedSender`] moves any sink onto its own thread
//! so a stalled injection can't hold up the scheduling loop.

use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::SendError;
use crate::events::ActionKind;
use crate::keymap::{Layout, LogicalKey};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(50);

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub trait KeySender: Send {
    fn send(&mut self, key: LogicalKey, kind: ActionKind) -> Result<(), SendError>;

    /// Checks that the injection facility is there at all.
    fn probe(&mut self) -> Result<(), SendError> {
        Ok(())
    }

    fn set_layout(&mut self, _layout: Layout) {}
}

impl<S: KeySender + ?Sized> KeySender for Box<S> {
    fn send(&mut self, key: LogicalKey, kind: ActionKind) -> Result<(), SendError> {
        (**self).send(key, kind)
    }

    fn probe(&mut self) -> Result<(), SendError> {
        (**self).probe()
    }

    fn set_layout(&mut self, layout: Layout) {
        (**self).set_layout(layout)
    }
}

/// Injects keys into the focused X11 window through `xdotool`.
#[derive(Debug, Clone)]
pub struct XdotoolSender {
    program: String,
    layout: Layout,
}

impl XdotoolSender {
    pub fn new(layout: Layout) -> Self {
        Self {
            program: "xdotool".to_string(),
            layout,
        }
    }

    /// Title of the window that will receive the keys, if it can be found.
    pub fn active_window_name(&self) -> Option<String> {
        let output = Command::new(&self.program)
            .args(["getactivewindow", "getwindowname"])
            .stderr(Stdio::null())
            .output()
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run(&self, args: &[&str]) -> Result<(), SendError> {
        let status = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    SendError::Unavailable(format!("{} not found", self.program))
                }
                _ => SendError::Failed(e.to_string()),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(SendError::Failed(format!("{} exited with {status}", self.program)))
        }
    }
}

impl KeySender for XdotoolSender {
    fn send(&mut self, key: LogicalKey, kind: ActionKind) -> Result<(), SendError> {
        let name = self.layout.physical_key(key);
        match kind {
            ActionKind::Tap => self.run(&["key", "--clearmodifiers", name]),
            ActionKind::Press => self.run(&["keydown", "--clearmodifiers", name]),
            ActionKind::Release => self.run(&["keyup", "--clearmodifiers", name]),
        }
    }

    fn probe(&mut self) -> Result<(), SendError> {
        self.run(&["version"])
    }

    fn set_layout(&mut self, layout: Layout) {
        self.layout = layout;
    }
}

enum Job {
    Send {
        key: LogicalKey,
        kind: ActionKind,
        deadline: Instant,
        reply: Sender<Result<(), SendError>>,
    },
    Probe {
        deadline: Instant,
        reply: Sender<Result<(), SendError>>,
    },
    Layout(Layout),
}

/// Runs a sink on a worker thread and gives up on any call that takes longer
/// than `timeout`. Jobs still queued when their caller gave up are dropped
/// unsent. A call already running when it times out finishes on the worker
/// and its result is discarded.
pub struct TimedSender {
    jobs: Sender<Job>,
    timeout: Duration,
}

impl TimedSender {
    pub fn spawn<S: KeySender + 'static>(mut inner: S, timeout: Duration) -> Self {
        let (jobs, job_rx) = channel::bounded::<Job>(64);

        thread::spawn(move || {
            for job in job_rx {
                match job {
                    Job::Send {
                        key,
                        kind,
                        deadline,
                        reply,
                    } => {
                        if Instant::now() >= deadline {
                            debug!(%key, ?kind, "dropping key that timed out in the queue");
                            continue;
                        }
                        let _ = reply.send(inner.send(key, kind));
                    }
                    Job::Probe { deadline, reply } => {
                        if Instant::now() < deadline {
                            let _ = reply.send(inner.probe());
                        }
                    }
                    Job::Layout(layout) => inner.set_layout(layout),
                }
            }
            debug!("key sender worker finished");
        });

        Self { jobs, timeout }
    }

    fn call(
        &self,
        timeout: Duration,
        job: impl FnOnce(Instant, Sender<Result<(), SendError>>) -> Job,
    ) -> Result<(), SendError> {
        let deadline = Instant::now() + timeout;
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.jobs
            .send_deadline(job(deadline, reply_tx), deadline)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SendError::TimedOut(timeout),
                SendTimeoutError::Disconnected(_) => SendError::Disconnected,
            })?;
        match reply_rx.recv_deadline(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SendError::TimedOut(timeout)),
            // the worker drops jobs it reaches after their deadline
            Err(RecvTimeoutError::Disconnected) if Instant::now() >= deadline => {
                Err(SendError::TimedOut(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SendError::Disconnected),
        }
    }
}

impl KeySender for TimedSender {
    fn send(&mut self, key: LogicalKey, kind: ActionKind) -> Result<(), SendError> {
        self.call(self.timeout, |deadline, reply| Job::Send {
            key,
            kind,
            deadline,
            reply,
        })
    }

    fn probe(&mut self) -> Result<(), SendError> {
        self.call(PROBE_TIMEOUT.max(self.timeout), |deadline, reply| Job::Probe {
            deadline,
            reply,
        })
    }

    fn set_layout(&mut self, layout: Layout) {
        if self.jobs.try_send(Job::Layout(layout)).is_err() {
            warn!(%layout, "could not hand layout change to key sender worker");
        }
    }
}

/// Logs every key instead of injecting it.
#[derive(Debug, Clone, Default)]
pub struct DryRunSender {
    layout: Layout,
}

impl DryRunSender {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

impl KeySender for DryRunSender {
    fn send(&mut self, key: LogicalKey, kind: ActionKind) -> Result<(), SendError> {
        info!(
            key = self.layout.physical_key(key),
            note = key.note_name(),
            ?kind,
            "dry run"
        );
        Ok(())
    }

    fn set_layout(&mut self, layout: Layout) {
        self.layout = layout;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentKey {
    pub key: LogicalKey,
    pub kind: ActionKind,
}

/// Remembers every call. Clones share the same log, so a test can keep one
/// handle while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingSender {
    log: Arc<Mutex<Vec<SentKey>>>,
    fail: bool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records each attempt but reports it as failed.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentKey> {
        self.log.lock().clone()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl KeySender for RecordingSender {
    fn send(&mut self, key: LogicalKey, kind: ActionKind) -> Result<(), SendError> {
        self.log.lock().push(SentKey { key, kind });
        if self.fail {
            Err(SendError::Failed("recording sender set to fail".to_string()))
        } else {
            Ok(())
        }
    }

    fn probe(&mut self) -> Result<(), SendError> {
        if self.fail {
            Err(SendError::Unavailable("recording sender set to fail".to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct StuckSender;

    impl KeySender for StuckSender {
        fn send(&mut self, _key: LogicalKey, _kind: ActionKind) -> Result<(), SendError> {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }
    }

    fn c4() -> LogicalKey {
        LogicalKey::new(7).unwrap()
    }

    #[test]
    fn timed_sender_forwards_results() {
        let recorder = RecordingSender::new();
        let mut sender = TimedSender::spawn(recorder.clone(), DEFAULT_SEND_TIMEOUT);
        assert_eq!(sender.send(c4(), ActionKind::Tap), Ok(()));
        assert_eq!(
            recorder.sent(),
            vec![SentKey {
                key: c4(),
                kind: ActionKind::Tap
            }]
        );
        assert!(sender.probe().is_ok());
    }

    #[test]
    fn timed_sender_gives_up_on_a_stuck_sink() {
        let timeout = Duration::from_millis(20);
        let mut sender = TimedSender::spawn(StuckSender, timeout);
        let started = Instant::now();
        assert_eq!(
            sender.send(c4(), ActionKind::Press),
            Err(SendError::TimedOut(timeout))
        );
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    struct SlowSender {
        delivered: RecordingSender,
    }

    impl KeySender for SlowSender {
        fn send(&mut self, key: LogicalKey, kind: ActionKind) -> Result<(), SendError> {
            thread::sleep(Duration::from_millis(100));
            self.delivered.send(key, kind)
        }
    }

    #[test]
    fn keys_that_timed_out_in_the_queue_are_never_sent() {
        let delivered = RecordingSender::new();
        let timeout = Duration::from_millis(20);
        let mut sender = TimedSender::spawn(
            SlowSender {
                delivered: delivered.clone(),
            },
            timeout,
        );
        for _ in 0..3 {
            assert_eq!(
                sender.send(c4(), ActionKind::Tap),
                Err(SendError::TimedOut(timeout))
            );
        }
        thread::sleep(Duration::from_millis(400));
        // only the first call reached the sink before its deadline
        assert_eq!(delivered.sent().len(), 1);
    }

    #[test]
    fn failing_recorder_reports_every_call() {
        let mut sender = RecordingSender::failing();
        assert!(sender.send(c4(), ActionKind::Tap).is_err());
        assert!(sender.probe().is_err());
        assert_eq!(sender.sent().len(), 1);
    }
}
