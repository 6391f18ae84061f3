//! The two-phase operation runner end to end.

use ctn_core::{OpContext, Operation, Runtime, run_operation};
use ctn_error::{CtnError, Result};
use ctn_harness::{DEVICE, FakeCluster, FakeHost, answering, runtime, test_config};
use ctn_ondisk::ImageBuilder;
use ctn_types::OpenFlags;

/// Records what it was handed and optionally talks to the live mount.
struct Recorder {
    flags: OpenFlags,
    runs: Vec<OpenFlags>,
    request: Option<u64>,
    fail: bool,
    stop: bool,
    ask: bool,
}

impl Recorder {
    fn new(flags: OpenFlags) -> Self {
        Self {
            flags,
            runs: Vec::new(),
            request: None,
            fail: false,
            stop: false,
            ask: false,
        }
    }
}

impl Operation for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn open_flags(&self) -> OpenFlags {
        self.flags
    }

    fn parse_arg(&mut self, _arg: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        self.runs.push(ctx.flags());
        if self.stop {
            ctx.cx().request_stop();
            return Err(CtnError::Cancelled);
        }
        if self.ask {
            ctx.cx().request_stop();
            if !ctx.console_mut().confirm("Proceed?")? {
                return Ok(());
            }
        }
        if let Some(request) = self.request {
            ctx.online_control(request, &mut [0_u8; 16])?;
        }
        if self.fail {
            return Err(CtnError::Internal("operation failure".to_owned()));
        }
        Ok(())
    }
}

fn setup(builder: ImageBuilder) -> (FakeHost, FakeCluster, Runtime) {
    let host = FakeHost::new();
    host.add_image(DEVICE, builder.build().expect("build").bytes);
    let cluster = FakeCluster::new("o2cb");
    let rt = runtime(&host, &cluster, &test_config());
    (host, cluster, rt)
}

#[test]
fn offline_run_sees_plain_flags_and_releases_everything() {
    let (_host, cluster, mut rt) = setup(ImageBuilder::new());
    let declared = OpenFlags::RW | OpenFlags::ALLOCATION | OpenFlags::ONLINE;
    let mut op = Recorder::new(declared);

    run_operation(&mut rt, &mut op, DEVICE).expect("run");
    assert_eq!(op.runs, vec![OpenFlags::RW | OpenFlags::ALLOCATION]);
    assert_eq!(cluster.lock_attempts(), 1, "working open must adopt the master lock");
    assert!(!cluster.is_locked(DEVICE));
    assert!(rt.registry().is_empty());
}

#[test]
fn online_master_makes_the_run_online() {
    let (host, cluster, mut rt) = setup(ImageBuilder::new());
    cluster.hold_elsewhere(DEVICE);
    host.mount(DEVICE, "/mnt/ctn", false);

    let mut op = Recorder::new(OpenFlags::RW | OpenFlags::ONLINE);
    op.request = Some(0x4f07);
    run_operation(&mut rt, &mut op, DEVICE).expect("run");

    assert_eq!(op.runs, vec![OpenFlags::RW | OpenFlags::ONLINE]);
    assert_eq!(host.online_requests(), vec![0x4f07]);
    assert!(rt.registry().is_empty());
    assert!(cluster.is_locked(DEVICE), "the other node keeps its lock");
}

#[test]
fn online_failures_are_classified() {
    for (errno, internal) in [(libc::ENOTTY, true), (libc::EINVAL, false)] {
        let (host, cluster, mut rt) = setup(ImageBuilder::new());
        cluster.hold_elsewhere(DEVICE);
        host.mount(DEVICE, "/mnt/ctn", false);
        host.fail_requests(errno);

        let mut op = Recorder::new(OpenFlags::RW | OpenFlags::ONLINE);
        op.request = Some(1);
        let err = run_operation(&mut rt, &mut op, DEVICE).unwrap_err();
        if internal {
            assert!(matches!(err, CtnError::Internal(_)), "{err:?}");
        } else {
            assert!(matches!(err, CtnError::OnlineFailed(_)), "{err:?}");
        }
        assert!(rt.registry().is_empty());
    }
}

#[test]
fn stack_mismatch_is_passed_to_the_run() {
    let (_host, cluster, mut rt) = setup(ImageBuilder::new().cluster_stack("pcmk"));
    let mut op = Recorder::new(OpenFlags::RW | OpenFlags::NOCLUSTER);
    run_operation(&mut rt, &mut op, DEVICE).expect("run");
    assert_eq!(op.runs, vec![OpenFlags::RW | OpenFlags::NOCLUSTER]);
    assert_eq!(cluster.lock_attempts(), 0);
}

#[test]
fn operation_errors_still_close_both_sessions() {
    let (_host, cluster, mut rt) = setup(ImageBuilder::new());
    let mut op = Recorder::new(OpenFlags::RW);
    op.fail = true;
    let err = run_operation(&mut rt, &mut op, DEVICE).unwrap_err();
    assert!(matches!(err, CtnError::Internal(ref msg) if msg == "operation failure"));
    assert!(rt.registry().is_empty());
    assert!(!cluster.is_locked(DEVICE));
}

#[test]
fn failed_master_open_never_runs_the_operation() {
    let (_host, _cluster, mut rt) = setup(ImageBuilder::new().dirty_journal(1));
    let mut op = Recorder::new(OpenFlags::RW);
    let err = run_operation(&mut rt, &mut op, DEVICE).unwrap_err();
    assert!(matches!(err, CtnError::JournalDirty { slot: 1 }));
    assert!(op.runs.is_empty());
}

#[test]
fn termination_during_run_unwinds_and_closes() {
    let (_host, cluster, mut rt) = setup(ImageBuilder::new());
    let mut op = Recorder::new(OpenFlags::RW);
    op.stop = true;
    let err = run_operation(&mut rt, &mut op, DEVICE).unwrap_err();
    assert!(matches!(err, CtnError::Cancelled));
    assert!(rt.registry().is_empty());
    assert!(!cluster.is_locked(DEVICE));

    // Nothing new starts once termination is requested.
    let err = rt.open(DEVICE, OpenFlags::RO).unwrap_err();
    assert!(matches!(err, CtnError::Cancelled));
}

#[test]
fn termination_while_prompting_unwinds_and_closes() {
    let host = FakeHost::new();
    let mem = host.add_image(DEVICE, ImageBuilder::new().build().expect("build").bytes);
    let cluster = FakeCluster::new("o2cb");
    let config = test_config().with_interactive(true);
    let mut rt = runtime(&host, &cluster, &config).with_console(answering(&config, "y\n"));
    let before = mem.snapshot();

    let mut op = Recorder::new(OpenFlags::RW);
    op.ask = true;
    let err = run_operation(&mut rt, &mut op, DEVICE).unwrap_err();
    assert!(matches!(err, CtnError::Cancelled));
    assert_eq!(op.runs.len(), 1);
    assert!(rt.registry().is_empty());
    assert!(!cluster.is_locked(DEVICE));
    assert_eq!(mem.snapshot(), before);
}

#[test]
fn dropping_the_runtime_releases_what_it_holds() {
    let (host, cluster, mut rt) = setup(ImageBuilder::new().local());
    rt.open(DEVICE, OpenFlags::RW).expect("open");
    assert!(host.is_claimed(DEVICE));
    drop(rt);
    assert!(!host.is_claimed(DEVICE));
    assert_eq!(cluster.lock_attempts(), 0);
}
