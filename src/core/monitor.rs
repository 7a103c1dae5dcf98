//! Host-side supervision of one execution.
//!
//! Sleeps on the return pipe in slices of at most the poll interval, samples
//! the cgroup after every wakeup and enforces the limits the kernel does not
//! enforce by itself (CPU time, disk I/O, wall clock).

use crate::config::types::{
    ExecutionRequest, ExitInfo, IsolateError, LimitViolation, ResourceAmounts, ResourceUsage,
    Result, Termination,
};
use crate::core::container::{Container, ContainerState};
use crate::core::protocol::InitMessage;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// Counters of the current epoch, as last read from the cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Sample {
    pub cpu_ms: u64,
    pub memory_kb: u64,
    pub disk_io_kb: u64,
    /// Peak concurrent user processes, init excluded
    pub processes: u64,
    pub oom_kills: u64,
    pub pid_limit_hits: u64,
}

impl Sample {
    /// A program that reported back existed, even when it was gone before
    /// the first sample saw it.
    fn program_ran(self) -> Self {
        Self {
            processes: self.processes.max(1),
            ..self
        }
    }
}

/// Pick the limit to blame. Checked in [`LimitViolation`] priority order, so
/// the first match is the winner.
pub(crate) fn classify(
    sample: &Sample,
    limits: &ResourceAmounts,
    wall_expired: bool,
) -> Option<LimitViolation> {
    let over = |used: u64, limit: Option<u64>| limit.is_some_and(|limit| used > limit);

    if over(sample.cpu_ms, limits.cpu_time_ms) {
        return Some(LimitViolation::CpuTime);
    }
    if limits.memory_kb.is_some() && (sample.oom_kills > 0 || over(sample.memory_kb, limits.memory_kb))
    {
        return Some(LimitViolation::Memory);
    }
    if limits.processes.is_some()
        && (sample.pid_limit_hits > 0 || over(sample.processes, limits.processes))
    {
        return Some(LimitViolation::Processes);
    }
    if over(sample.disk_io_kb, limits.disk_io_kb) {
        return Some(LimitViolation::DiskIo);
    }
    if wall_expired {
        return Some(LimitViolation::WallTime);
    }
    None
}

/// Block until `source` is readable or `timeout` passes. A signal
/// interrupting the wait counts as a timeout.
pub(crate) fn wait_readable<F: AsRawFd>(source: &F, timeout: Duration) -> bool {
    let mut timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    if timeout_ms == 0 && !timeout.is_zero() {
        timeout_ms = 1;
    }
    let mut fds = [libc::pollfd {
        fd: source.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    // SAFETY: `fds` is a valid array of one pollfd for the whole call.
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
    ret > 0 && fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
}

fn exit_info(exit_code: Option<i32>, signal: Option<i32>) -> ExitInfo {
    match (exit_code, signal) {
        (Some(code), _) => ExitInfo::Exited { code },
        (None, Some(signal)) => ExitInfo::Signaled { signal },
        (None, None) => ExitInfo::Signaled {
            signal: libc::SIGKILL,
        },
    }
}

/// What init said, if anything, since the last look at the pipe.
enum Report {
    Message(InitMessage),
    Pending,
    Closed,
}

enum Waited {
    Reported(InitMessage),
    Breached(LimitViolation),
    InitGone,
}

impl Container {
    pub(crate) fn monitor_init(&mut self, request: &ExecutionRequest) -> Result<Termination> {
        let started = Instant::now();
        let wall_limit = request
            .limits
            .wall_time_ms
            .map(Duration::from_millis)
            .unwrap_or(self.spec.default_wall_time);
        let deadline = started + wall_limit;
        let mut sample = Sample::default();

        let waited = loop {
            match self.next_report() {
                Ok(Report::Message(message)) => break Waited::Reported(message),
                Ok(Report::Closed) => break Waited::InitGone,
                Ok(Report::Pending) => {}
                Err(e) => return Err(self.fault(request, e)),
            }

            self.refresh(&mut sample);
            let now = Instant::now();
            if let Some(violation) = classify(&sample, &request.limits, now >= deadline) {
                break Waited::Breached(violation);
            }
            let slice = self
                .spec
                .poll_interval
                .min(deadline.saturating_duration_since(now));
            wait_readable(&self.return_pipe, slice);
        };

        match waited {
            Waited::Reported(message) => {
                self.refresh(&mut sample);
                let violation = classify(&sample, &request.limits, false);
                self.conclude(request, message, sample, violation, started)
            }
            Waited::Breached(violation) => {
                log::info!(
                    "Request {} exceeded {:?} after {:?}: {:?}",
                    request.id,
                    violation,
                    started.elapsed(),
                    sample
                );
                self.enforce(request, violation, sample, started)
            }
            Waited::InitGone => {
                self.refresh(&mut sample);
                let violation =
                    classify(&sample, &request.limits, Instant::now() >= deadline);
                match violation {
                    // The kernel took init down with the program, e.g. on OOM
                    Some(violation) => {
                        if let Err(e) = self.cgroup.kill_members(self.init_pid()) {
                            log::warn!("Failed to kill members of {}: {}", self.cgroup.name(), e);
                        }
                        self.kill_init();
                        Ok(self.killed(request, violation, sample, started))
                    }
                    None => Err(self.fault(
                        request,
                        IsolateError::Process("init closed the return pipe".to_string()),
                    )),
                }
            }
        }
    }

    /// Kill the program tree, then give init `kill_grace` to report. Init is
    /// killed too if it stays silent.
    fn enforce(
        &mut self,
        request: &ExecutionRequest,
        violation: LimitViolation,
        mut sample: Sample,
        started: Instant,
    ) -> Result<Termination> {
        let grace_deadline = Instant::now() + self.spec.kill_grace;
        let init_pid = self.init_pid();
        loop {
            if let Err(e) = self.cgroup.kill_members(init_pid) {
                log::warn!("Failed to kill members of {}: {}", self.cgroup.name(), e);
            }

            match self.next_report() {
                Ok(Report::Message(message)) => {
                    self.refresh(&mut sample);
                    let post = classify(&sample, &request.limits, false);
                    let violation = post.map_or(violation, |post| post.min(violation));
                    return self.conclude(request, message, sample, Some(violation), started);
                }
                Ok(Report::Pending) => {}
                Ok(Report::Closed) => break,
                Err(e) => return Err(self.fault(request, e)),
            }

            let now = Instant::now();
            if now >= grace_deadline {
                log::warn!(
                    "Init of {} silent {:?} after kill; killing it",
                    self.id().name(),
                    self.spec.kill_grace
                );
                break;
            }
            wait_readable(
                &self.return_pipe,
                self.spec.poll_interval.min(grace_deadline - now),
            );
        }

        self.refresh(&mut sample);
        self.kill_init();
        Ok(self.killed(request, violation, sample, started))
    }

    /// Turn init's report into the result of the request.
    fn conclude(
        &mut self,
        request: &ExecutionRequest,
        message: InitMessage,
        sample: Sample,
        violation: Option<LimitViolation>,
        started: Instant,
    ) -> Result<Termination> {
        match message {
            InitMessage::Finished {
                request_id,
                exit_code,
                signal,
                reaped_descendants,
            } if request_id == request.id => {
                self.state = ContainerState::Idle;
                log::debug!(
                    "Request {} finished: code {:?}, signal {:?}, {} descendants reaped",
                    request_id,
                    exit_code,
                    signal,
                    reaped_descendants
                );
                Ok(Termination {
                    request_id,
                    exit: exit_info(exit_code, signal),
                    usage: usage(&sample.program_ran(), started),
                    violation,
                })
            }
            InitMessage::LaunchFailed { request_id, reason } if request_id == request.id => {
                self.state = ContainerState::Idle;
                Err(IsolateError::Process(format!(
                    "Failed to launch request {}: {}",
                    request_id, reason
                )))
            }
            other => Err(self.fault(
                request,
                IsolateError::Protocol(format!("unexpected report {:?}", other)),
            )),
        }
    }

    /// The protocol broke mid-request. Nothing init says can be trusted any
    /// more, so the program tree and init go down and the container is dead.
    fn fault(&mut self, request: &ExecutionRequest, cause: IsolateError) -> IsolateError {
        log::error!(
            "Container {} lost track of request {}: {}",
            self.id().name(),
            request.id,
            cause
        );
        if let Err(e) = self.cgroup.kill_members(self.init_pid()) {
            log::warn!("Failed to kill members of {}: {}", self.cgroup.name(), e);
        }
        self.kill_init();
        IsolateError::InternalFault(format!("request {}: {}", request.id, cause))
    }

    fn killed(
        &self,
        request: &ExecutionRequest,
        violation: LimitViolation,
        sample: Sample,
        started: Instant,
    ) -> Termination {
        Termination {
            request_id: request.id.clone(),
            exit: ExitInfo::Signaled {
                signal: libc::SIGKILL,
            },
            usage: usage(&sample, started),
            violation: Some(violation),
        }
    }

    fn next_report(&mut self) -> Result<Report> {
        if let Some(message) = self.frames.next_frame()? {
            return Ok(Report::Message(message));
        }
        let fill = self.frames.fill_from(&mut self.return_pipe)?;
        match self.frames.next_frame()? {
            Some(message) => Ok(Report::Message(message)),
            None if fill.eof => Ok(Report::Closed),
            None => Ok(Report::Pending),
        }
    }

    /// Read every counter. One that cannot be read keeps its last value.
    fn refresh(&self, sample: &mut Sample) {
        let cgroup = &self.cgroup;
        if let Ok(cpu) = cgroup.cpu_used() {
            sample.cpu_ms = cpu;
        }
        if let Ok(memory) = cgroup.memory_used() {
            sample.memory_kb = memory;
        }
        if let Ok(io) = cgroup.disk_io_used() {
            sample.disk_io_kb = io;
        }
        if let Ok(count) = cgroup.processes_used() {
            sample.processes = sample.processes.max(count.saturating_sub(1));
        }
        if let Ok(kills) = cgroup.oom_kills() {
            sample.oom_kills = kills;
        }
        if let Ok(hits) = cgroup.process_limit_hits() {
            sample.pid_limit_hits = hits;
        }
    }
}

fn usage(sample: &Sample, started: Instant) -> ResourceUsage {
    ResourceUsage {
        cpu_ms: sample.cpu_ms,
        memory_kb: sample.memory_kb,
        disk_io_kb: sample.disk_io_kb,
        processes: sample.processes,
        wall_ms: started.elapsed().as_millis() as u64,
    }
}
