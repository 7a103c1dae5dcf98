//! End-to-end container lifecycle tests.
//!
//! These need root and a mounted cgroup hierarchy; without them every test
//! returns early.

use sandcell::kernel::cgroup::backend::{detected_backend, DEFAULT_CGROUP_ROOT};
use sandcell::{
    Container, ContainerId, ContainerSpec, ContainerState, ExecutionRequest, ExitInfo,
    IsolateError, LimitViolation, ResourceAmounts, SandboxConfig, TerminationStatus,
};
use std::path::Path;
use std::time::{Duration, Instant};

fn privileged() -> bool {
    let ok = nix::unistd::geteuid().is_root()
        && detected_backend(Path::new(DEFAULT_CGROUP_ROOT)).is_some();
    if !ok {
        eprintln!("skipping: requires root and cgroups");
    }
    ok
}

fn container() -> Container {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut config = SandboxConfig::default();
    // Shared lock dir: ids double as cgroup names across parallel tests
    config.container.lock_dir = std::env::temp_dir().join("sandcell-it-locks");
    config.container.root_dir =
        std::env::temp_dir().join(format!("sandcell-it-{}", uuid::Uuid::new_v4()));

    let id = ContainerId::allocate(&config.container.lock_dir, 256).unwrap();
    let spec = ContainerSpec::from_config(&config).unwrap();
    Container::new(id, spec).unwrap()
}

fn sh(script: &str, limits: ResourceAmounts) -> ExecutionRequest {
    ExecutionRequest::new(["/bin/sh", "-c", script]).with_limits(limits)
}

/// Only init may be left in the cgroup once a request is over.
fn assert_only_init_left(container: &Container) {
    assert_eq!(container.cgroup().members().unwrap(), vec![container.init_pid()]);
}

fn wall(ms: u64) -> ResourceAmounts {
    ResourceAmounts {
        wall_time_ms: Some(ms),
        ..ResourceAmounts::default()
    }
}

#[test]
fn test_new_container_is_idle() {
    if !privileged() {
        return;
    }
    let mut container = container();
    assert_eq!(container.state(), ContainerState::Idle);
    assert!(!container.is_dead());
    assert!(container.init_pid() > 0);
}

#[test]
fn test_exit_code_is_reported() {
    if !privileged() {
        return;
    }
    let mut container = container();
    let request = sh("exit 42", wall(5000));
    let termination = container.execute(&request).unwrap();

    assert_eq!(termination.request_id, request.id);
    assert_eq!(termination.exit, ExitInfo::Exited { code: 42 });
    assert_eq!(termination.violation, None);
    assert_eq!(termination.status(), TerminationStatus::RuntimeError);
    assert!(termination.usage.cpu_ms > 0 || termination.usage.memory_kb > 0);
    assert!(termination.usage.processes >= 1);
    assert_eq!(container.state(), ContainerState::Idle);
}

#[test]
fn test_short_program_counts_as_a_process() {
    if !privileged() {
        return;
    }
    let mut container = container();
    let termination = container
        .execute(&ExecutionRequest::new(["/bin/true"]))
        .unwrap();
    assert!(termination.exit.is_clean_exit());
    assert_eq!(termination.usage.processes, 1);
}

#[test]
fn test_busy_loop_hits_cpu_limit() {
    if !privileged() {
        return;
    }
    let mut container = container();
    let limits = ResourceAmounts {
        cpu_time_ms: Some(300),
        wall_time_ms: Some(10_000),
        ..ResourceAmounts::default()
    };
    // The detached loop leaves the program's session and process group
    let termination = container
        .execute(&sh(
            "setsid sh -c 'while :; do :; done' & while :; do :; done",
            limits,
        ))
        .unwrap();

    assert_eq!(termination.violation, Some(LimitViolation::CpuTime));
    assert!(termination.exit.signal().is_some());
    assert!(termination.usage.cpu_ms > 300);
    assert!(!container.is_dead());
    assert_only_init_left(&container);
}

#[test]
fn test_sleep_hits_wall_limit() {
    if !privileged() {
        return;
    }
    let mut container = container();
    let started = Instant::now();
    let termination = container.execute(&sh("sleep 30", wall(300))).unwrap();

    assert_eq!(termination.violation, Some(LimitViolation::WallTime));
    assert_eq!(termination.status(), TerminationStatus::TimeLimit);
    assert!(termination.usage.wall_ms >= 300);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_memory_hog_hits_memory_limit() {
    if !privileged() {
        return;
    }
    let mut container = container();
    let limits = ResourceAmounts {
        memory_kb: Some(32 * 1024),
        wall_time_ms: Some(20_000),
        ..ResourceAmounts::default()
    };
    // tail keeps a line without newline in memory
    let termination = container
        .execute(&sh("head -c 268435456 /dev/zero | tail", limits))
        .unwrap();

    assert_eq!(termination.violation, Some(LimitViolation::Memory));
    assert_eq!(termination.status(), TerminationStatus::MemoryLimit);
}

#[test]
fn test_fork_bomb_hits_process_limit() {
    if !privileged() {
        return;
    }
    let mut container = container();
    let limits = ResourceAmounts {
        processes: Some(3),
        wall_time_ms: Some(10_000),
        ..ResourceAmounts::default()
    };
    let termination = container
        .execute(&sh(
            "setsid sleep 30 & for i in 1 2 3 4 5 6 7 8; do sleep 5 & done; wait",
            limits,
        ))
        .unwrap();

    assert_eq!(termination.violation, Some(LimitViolation::Processes));
    assert!(termination.usage.processes <= 3);
    assert_only_init_left(&container);
}

#[test]
fn test_zero_process_limit_is_a_config_error() {
    if !privileged() {
        return;
    }
    let mut container = container();
    let limits = ResourceAmounts {
        processes: Some(0),
        ..wall(5000)
    };
    assert!(matches!(
        container.execute(&sh("true", limits)),
        Err(IsolateError::Config(_))
    ));
    assert_eq!(container.state(), ContainerState::Idle);

    let single = ResourceAmounts {
        processes: Some(1),
        ..wall(5000)
    };
    let termination = container
        .execute(&ExecutionRequest::new(["/bin/true"]).with_limits(single))
        .unwrap();
    assert_eq!(termination.violation, None);
    assert!(termination.exit.is_clean_exit());
}

#[test]
fn test_reset_starts_a_new_epoch() {
    if !privileged() {
        return;
    }
    let mut container = container();
    let limits = ResourceAmounts {
        cpu_time_ms: Some(200),
        wall_time_ms: Some(10_000),
        ..ResourceAmounts::default()
    };
    let busy = container
        .execute(&sh("while :; do :; done", limits.clone()))
        .unwrap();
    assert_eq!(busy.violation, Some(LimitViolation::CpuTime));
    assert_only_init_left(&container);

    container.reset().unwrap();
    let idle = container.execute(&sh("true", limits)).unwrap();
    assert_eq!(idle.violation, None);
    assert_eq!(idle.status(), TerminationStatus::Ok);
    assert!(idle.usage.cpu_ms < busy.usage.cpu_ms);
}

#[test]
fn test_missing_program_keeps_container_usable() {
    if !privileged() {
        return;
    }
    let mut container = container();
    let missing = ExecutionRequest::new(["sandcell-definitely-missing"]);
    assert!(matches!(
        container.execute(&missing),
        Err(IsolateError::Process(_))
    ));
    assert_eq!(container.state(), ContainerState::Idle);

    container.reset().unwrap();
    let termination = container.execute(&sh("exit 0", wall(5000))).unwrap();
    assert!(termination.exit.is_clean_exit());
}

#[test]
fn test_killed_init_makes_container_dead() {
    if !privileged() {
        return;
    }
    let mut container = container();
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(container.init_pid()),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !container.is_dead() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(container.is_dead());
    assert_eq!(container.state(), ContainerState::Dead);
    assert!(matches!(
        container.execute(&sh("true", wall(1000))),
        Err(IsolateError::DeadContainer)
    ));
    assert!(matches!(container.reset(), Err(IsolateError::DeadContainer)));
}

#[test]
fn test_container_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<Container>();
}
