//! Stream Relay: forwards a script's stdout into the HTTP response as it is
//! produced, then waits for the exit status.

use crate::error::{generate_error_response, GatewayError};
use crate::http::{Framing, Response};
use crate::launcher::ScriptProcess;
use crate::resolver::ScriptTarget;
use log::{debug, info, warn};
use mio::unix::pipe::Receiver;
use std::io::{self, Read};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 8 * 1024;

/// Lifecycle of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolving,
    Checking,
    Spawning,
    Streaming,
    /// Output hit end-of-stream; waiting for the exit status.
    Draining,
    Completed,
    Errored,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Pump {
    /// The pipe has nothing more right now.
    Pending,
    /// Stopped reading because the client is not keeping up.
    Backlogged,
    Eof,
}

/// How a relayed request ended.
#[derive(Debug)]
pub enum Ending {
    /// The body was terminated normally.
    Completed { exit_code: Option<i32> },
    /// Output had already started; the stream must be cut without a terminator.
    Truncated(GatewayError),
    /// Nothing was sent yet; a full error response was written instead.
    Failed(GatewayError),
}

pub struct Relay {
    target: ScriptTarget,
    process: ScriptProcess,
    framing: Framing,
    phase: Phase,
    head_sent: bool,
    started: Instant,
    timeout: Option<Duration>,
    relayed: u64,
}

impl Relay {
    pub fn new(target: ScriptTarget, process: ScriptProcess, framing: Framing, timeout: Option<Duration>) -> Self {
        Relay {
            target,
            process,
            framing,
            phase: Phase::Streaming,
            head_sent: false,
            started: Instant::now(),
            timeout,
            relayed: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn script(&self) -> &str {
        &self.target.name
    }

    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    pub fn output(&mut self) -> Option<&mut Receiver> {
        self.process.output()
    }

    pub fn take_output(&mut self) -> Option<Receiver> {
        self.process.take_output()
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|limit| self.started + limit)
    }

    /// Moves whatever the pipe holds into `out`, framed for the client.
    /// Stops early once `out` reaches `high_water` bytes.
    pub fn pump(&mut self, out: &mut Vec<u8>, high_water: usize) -> Result<Pump, GatewayError> {
        if self.phase != Phase::Streaming {
            return Ok(Pump::Eof);
        }
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if out.len() >= high_water {
                return Ok(Pump::Backlogged);
            }
            let read = match self.process.output() {
                Some(pipe) => pipe.read(&mut buf),
                None => Ok(0),
            };
            match read {
                Ok(0) => {
                    self.transition(Phase::Draining);
                    return Ok(Pump::Eof);
                }
                Ok(n) => self.forward(out, &buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Pump::Pending),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(GatewayError::Stream {
                        script: self.target.name.clone(),
                        reason: format!("reading output: {}", e),
                    })
                }
            }
        }
    }

    /// Completes the request once the drained process has exited.
    pub fn poll_exit(&mut self, out: &mut Vec<u8>) -> Option<Ending> {
        if self.phase != Phase::Draining {
            return None;
        }
        match self.process.try_wait() {
            Ok(Some(status)) => Some(self.finish(status, out)),
            Ok(None) => None,
            Err(e) => {
                let err = GatewayError::Stream {
                    script: self.target.name.clone(),
                    reason: format!("waiting for exit: {}", e),
                };
                Some(self.fail(err, out))
            }
        }
    }

    /// Periodic check. A script that already exited completes even if the
    /// deadline passed before its exit was noticed.
    pub fn poll(&mut self, now: Instant, out: &mut Vec<u8>) -> Option<Ending> {
        match self.poll_exit(out) {
            Some(ending) => Some(ending),
            None => self.poll_deadline(now, out),
        }
    }

    /// Kills the script if its execution limit has passed.
    pub fn poll_deadline(&mut self, now: Instant, out: &mut Vec<u8>) -> Option<Ending> {
        if !matches!(self.phase, Phase::Streaming | Phase::Draining) {
            return None;
        }
        match (self.deadline(), self.timeout) {
            (Some(deadline), Some(limit)) if now >= deadline => {
                let err = GatewayError::Timeout {
                    script: self.target.name.clone(),
                    limit,
                };
                Some(self.fail(err, out))
            }
            _ => None,
        }
    }

    /// Kills the script and ends the request with `err`.
    pub fn fail(&mut self, err: GatewayError, out: &mut Vec<u8>) -> Ending {
        self.reap_by_force();
        self.transition(Phase::Errored);
        if self.head_sent {
            warn!(
                "{} (pid {}): {}; truncating after {} bytes",
                self.target.name,
                self.process.id(),
                err,
                self.relayed
            );
            Ending::Truncated(err)
        } else {
            warn!("{} (pid {}): {}", self.target.name, self.process.id(), err);
            out.extend_from_slice(&generate_error_response(&err).to_bytes());
            Ending::Failed(err)
        }
    }

    /// The client went away; nothing more can be delivered.
    pub fn abort(&mut self, reason: &str) {
        if matches!(self.phase, Phase::Completed | Phase::Errored) {
            return;
        }
        warn!(
            "{} (pid {}): {}; killing script after {} bytes",
            self.target.name,
            self.process.id(),
            reason,
            self.relayed
        );
        self.reap_by_force();
        self.transition(Phase::Errored);
    }

    fn forward(&mut self, out: &mut Vec<u8>, data: &[u8]) {
        self.write_head(out);
        self.framing.encode_chunk(out, data);
        self.relayed += data.len() as u64;
    }

    fn write_head(&mut self, out: &mut Vec<u8>) {
        if !self.head_sent {
            out.extend_from_slice(&Response::streaming(self.framing, &self.target.name).to_bytes());
            self.head_sent = true;
        }
    }

    fn finish(&mut self, status: ExitStatus, out: &mut Vec<u8>) -> Ending {
        if let Some(signal) = status.signal() {
            let err = GatewayError::Stream {
                script: self.target.name.clone(),
                reason: format!("terminated by signal {}", signal),
            };
            return self.fail(err, out);
        }

        let exit_code = status.code();
        self.write_head(out);
        self.framing.encode_end(out, exit_code);
        self.transition(Phase::Completed);
        info!(
            "{} (pid {}) exited with {:?} after {} bytes in {:?}",
            self.target.name,
            self.process.id(),
            exit_code,
            self.relayed,
            self.started.elapsed()
        );
        Ending::Completed { exit_code }
    }

    fn reap_by_force(&mut self) {
        if let Err(e) = self.process.kill() {
            warn!("failed to kill pid {}: {}", self.process.id(), e);
        }
    }

    fn transition(&mut self, next: Phase) {
        debug!("{} (pid {}): {:?} -> {:?}", self.target.name, self.process.id(), self.phase, next);
        self.phase = next;
    }
}
