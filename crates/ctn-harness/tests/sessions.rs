//! Opening devices from several simulated processes at once.

use ctn_block::MemByteDevice;
use ctn_core::config::LOCK_ENV;
use ctn_core::{Handoff, LockDecision, OpenOutcome, Runtime};
use ctn_error::CtnError;
use ctn_harness::{DEVICE, FakeCluster, FakeHost, peek, runtime, test_config};
use ctn_ondisk::{FsImage, ImageBuilder, OpenMode};
use ctn_types::{Cx, OpenFlags};
use std::process::Command;
use std::sync::Arc;

const RW: OpenFlags = OpenFlags::RW;
const RW_ONLINE: OpenFlags = OpenFlags(OpenFlags::RW.0 | OpenFlags::ONLINE.0);
const RW_ALLOC: OpenFlags = OpenFlags(OpenFlags::RW.0 | OpenFlags::ALLOCATION.0);

struct World {
    host: FakeHost,
    cluster: FakeCluster,
    mem: MemByteDevice,
}

impl World {
    fn new(builder: ImageBuilder) -> Self {
        let host = FakeHost::new();
        let mem = host.add_image(DEVICE, builder.build().expect("build").bytes);
        Self {
            host,
            cluster: FakeCluster::new("o2cb"),
            mem,
        }
    }

    fn process(&self) -> Runtime {
        runtime(&self.host, &self.cluster, &test_config())
    }

    fn child(&self, handoff: Handoff) -> Runtime {
        runtime(&self.host, &self.cluster, &test_config().with_handoff(handoff))
    }
}

fn decision(rt: &Runtime, id: ctn_core::SessionId) -> Option<LockDecision> {
    rt.session(id).expect("session").decision()
}

// ── Local filesystems ───────────────────────────────────────────────────────

#[test]
fn local_device_admits_one_writer() {
    let world = World::new(ImageBuilder::new().local());
    let mut first = world.process();
    let mut second = world.process();

    let opened = first.open(DEVICE, RW).expect("first writer");
    assert_eq!(decision(&first, opened.id), Some(LockDecision::LocalExclusive));
    assert!(world.host.is_claimed(DEVICE));

    let err = second.open(DEVICE, RW).unwrap_err();
    assert!(matches!(err, CtnError::DeviceBusy), "{err:?}");
    // Being online-capable does not help when the holder is not a mount.
    let err = second.open(DEVICE, RW_ONLINE).unwrap_err();
    assert!(matches!(err, CtnError::DeviceBusy), "{err:?}");
    assert!(second.registry().is_empty());

    first.close(opened.id).expect("close");
    assert!(!world.host.is_claimed(DEVICE));
    let reopened = second.open(DEVICE, RW).expect("writer after release");
    second.close(reopened.id).expect("close");
}

#[test]
fn sessions_in_one_process_share_the_local_claim() {
    let world = World::new(ImageBuilder::new().local());
    let mut rt = world.process();
    let key = ctn_core::DeviceKey::new(DEVICE);

    let a = rt.open(DEVICE, RW).expect("a");
    let b = rt.open(DEVICE, RW).expect("b");
    assert_eq!(rt.coordinator().local_holders(&key), 2);

    rt.close(b.id).expect("close b");
    assert!(world.host.is_claimed(DEVICE));
    rt.close(a.id).expect("close a");
    assert!(!world.host.is_claimed(DEVICE));
    assert_eq!(rt.coordinator().local_holders(&key), 0);
}

#[test]
fn mounted_local_device_defers_online_capable_callers() {
    let world = World::new(ImageBuilder::new().local());
    world.host.mount(DEVICE, "/mnt/ctn", false);
    let mut rt = world.process();

    let err = rt.open(DEVICE, RW).unwrap_err();
    assert!(matches!(err, CtnError::DeviceBusy), "{err:?}");

    let opened = rt.open(DEVICE, RW_ONLINE).expect("online open");
    assert_eq!(opened.outcome, OpenOutcome::PerformOnline);
    assert!(rt.session(opened.id).expect("session").is_online());
    rt.close(opened.id).expect("close");
}

#[test]
fn read_only_mount_is_simply_busy() {
    let world = World::new(ImageBuilder::new().local());
    world.host.mount(DEVICE, "/mnt/ctn", true);
    let mut rt = world.process();
    let err = rt.open(DEVICE, RW_ONLINE).unwrap_err();
    assert!(matches!(err, CtnError::DeviceBusy), "{err:?}");
}

#[test]
fn swap_device_is_busy_even_for_online_callers() {
    let world = World::new(ImageBuilder::new().local());
    world.host.add_swap(DEVICE);
    let mut rt = world.process();
    let err = rt.open(DEVICE, RW_ONLINE).unwrap_err();
    assert!(matches!(err, CtnError::DeviceBusy), "{err:?}");
}

#[test]
fn missing_device_is_reported() {
    let world = World::new(ImageBuilder::new());
    let mut rt = world.process();
    let err = rt.open("/dev/ctn-missing", RW).unwrap_err();
    assert!(matches!(err, CtnError::DeviceNotFound(ref path) if path == "/dev/ctn-missing"));
}

// ── Clustered filesystems ───────────────────────────────────────────────────

#[test]
fn master_lock_is_adopted_by_the_second_open() {
    let world = World::new(ImageBuilder::new());
    let mut rt = world.process();

    let master = rt.open(DEVICE, RW).expect("master");
    assert_eq!(decision(&rt, master.id), Some(LockDecision::ClusterLocked));
    assert_eq!(rt.handoff(), Handoff::Locked);
    assert_eq!(world.cluster.lock_attempts(), 1);

    let op = rt.open(DEVICE, RW).expect("op");
    assert_eq!(decision(&rt, op.id), Some(LockDecision::Adopted));
    assert_eq!(world.cluster.lock_attempts(), 1);

    rt.close(op.id).expect("close op");
    assert!(world.cluster.is_locked(DEVICE));
    rt.close(master.id).expect("close master");
    assert!(!world.cluster.is_locked(DEVICE));
    assert_eq!(rt.handoff(), Handoff::Absent);
}

#[test]
fn cleared_handoff_forces_a_new_lock_attempt() {
    let world = World::new(ImageBuilder::new());
    let mut rt = world.process();
    let master = rt.open(DEVICE, RW).expect("master");

    rt.clear_handoff();
    let err = rt.open(DEVICE, RW).unwrap_err();
    assert!(matches!(err, CtnError::TrylockFailed), "{err:?}");
    assert_eq!(world.cluster.lock_attempts(), 2);
    // The failed attempt must not disturb the master's lock.
    assert!(world.cluster.is_locked(DEVICE));
    assert!(rt.coordinator().cluster_locked());

    rt.close(master.id).expect("close master");
    assert!(!world.cluster.is_locked(DEVICE));
}

#[test]
fn child_process_adopts_the_parent_lock() {
    let world = World::new(ImageBuilder::new());
    let mut parent = world.process();
    let master = parent.open(DEVICE, RW).expect("parent");

    let mut child = world.child(parent.handoff());
    let opened = child.open(DEVICE, RW).expect("child");
    assert_eq!(decision(&child, opened.id), Some(LockDecision::Adopted));
    assert_eq!(world.cluster.lock_attempts(), 1);
    child.close(opened.id).expect("child close");
    assert!(world.cluster.is_locked(DEVICE), "child must not drop the parent's lock");

    parent.close(master.id).expect("parent close");
}

#[test]
fn lock_held_elsewhere_defers_online_callers() {
    let world = World::new(ImageBuilder::new());
    world.cluster.hold_elsewhere(DEVICE);
    world.host.mount(DEVICE, "/mnt/ctn", false);
    let mut rt = world.process();

    let err = rt.open(DEVICE, RW).unwrap_err();
    assert!(matches!(err, CtnError::TrylockFailed), "{err:?}");
    assert_eq!(rt.handoff(), Handoff::Absent);

    let opened = rt.open(DEVICE, RW_ONLINE).expect("online");
    assert_eq!(opened.outcome, OpenOutcome::PerformOnline);
    assert_eq!(rt.handoff(), Handoff::Online);

    let second = rt.open(DEVICE, RW_ONLINE).expect("second online");
    assert_eq!(decision(&rt, second.id), Some(LockDecision::PerformOnline));
    assert_eq!(rt.online_holders(second.id), 2);
    rt.close_all().expect("close all");
}

#[test]
fn offline_lock_is_available_once_the_other_node_lets_go() {
    let world = World::new(ImageBuilder::new());
    world.cluster.hold_elsewhere(DEVICE);
    world.host.mount(DEVICE, "/mnt/ctn", false);

    let mut rt = world.process();
    let online = rt.open(DEVICE, RW_ONLINE).expect("online");
    assert_eq!(online.outcome, OpenOutcome::PerformOnline);
    rt.close(online.id).expect("close");

    world.host.unmount(DEVICE);
    world.cluster.release_elsewhere(DEVICE);
    let opened = rt.open(DEVICE, RW_ONLINE).expect("offline");
    assert_eq!(opened.outcome, OpenOutcome::Ready);
    assert_eq!(decision(&rt, opened.id), Some(LockDecision::ClusterLocked));
    assert!(!rt.session(opened.id).expect("session").is_online());
}

#[test]
fn handoff_is_exported_to_child_commands() {
    let world = World::new(ImageBuilder::new());
    let mut rt = world.process();
    let master = rt.open(DEVICE, RW).expect("master");

    let mut child = Command::new("true");
    child.env(LOCK_ENV, "online");
    rt.export_handoff(&mut child);
    assert_eq!(lock_env(&child), Some(Some("locked")));

    rt.close(master.id).expect("close");
    rt.export_handoff(&mut child);
    assert_eq!(lock_env(&child), Some(None), "a released lock clears the marker");
}

fn lock_env(command: &Command) -> Option<Option<&str>> {
    command
        .get_envs()
        .find(|(key, _)| *key == LOCK_ENV)
        .map(|(_, value)| value.and_then(|v| v.to_str()))
}

#[test]
fn online_deferral_requires_a_writable_mount() {
    let world = World::new(ImageBuilder::new());
    world.cluster.hold_elsewhere(DEVICE);
    world.host.mount(DEVICE, "/mnt/ctn", true);
    let mut rt = world.process();

    let err = rt.open(DEVICE, RW_ONLINE).unwrap_err();
    assert!(matches!(err, CtnError::NotMounted), "{err:?}");
    assert_eq!(rt.handoff(), Handoff::Absent);
    assert!(rt.registry().is_empty());
}

#[test]
fn busy_mount_point_is_busy() {
    let world = World::new(ImageBuilder::new());
    world.cluster.hold_elsewhere(DEVICE);
    world.host.mount(DEVICE, "/mnt/ctn", false);
    world.host.fail_mount_point(libc::EBUSY);
    let mut rt = world.process();
    let err = rt.open(DEVICE, RW_ONLINE).unwrap_err();
    assert!(matches!(err, CtnError::DeviceBusy), "{err:?}");
}

#[test]
fn online_handoff_is_ignored_by_offline_callers() {
    let world = World::new(ImageBuilder::new());
    let mut rt = world.child(Handoff::Online);
    let opened = rt.open(DEVICE, RW).expect("open");
    assert_eq!(decision(&rt, opened.id), Some(LockDecision::ClusterLocked));
    assert_eq!(world.cluster.lock_attempts(), 1);
}

#[test]
fn stack_mismatch_is_tolerated_only_when_asked() {
    let world = World::new(ImageBuilder::new().cluster_stack("pcmk"));
    let mut rt = world.process();

    let err = rt.open(DEVICE, RW).unwrap_err();
    assert!(matches!(err, CtnError::InvalidStackName), "{err:?}");

    let opened = rt
        .open(DEVICE, RW.with(OpenFlags::NOCLUSTER))
        .expect("tolerant open");
    assert_eq!(opened.outcome, OpenOutcome::InvalidStackName);
    assert!(!world.cluster.is_locked(DEVICE));
    assert_eq!(world.cluster.lock_attempts(), 0);
}

#[test]
fn matching_stack_with_nocluster_joins_without_locking() {
    let world = World::new(ImageBuilder::new());
    let mut rt = world.process();
    let opened = rt
        .open(DEVICE, RW.with(OpenFlags::NOCLUSTER))
        .expect("open");
    assert_eq!(opened.outcome, OpenOutcome::Ready);
    assert_eq!(decision(&rt, opened.id), Some(LockDecision::StackJoined));
    assert_eq!(world.cluster.joins(), 1);
    assert_eq!(world.cluster.lock_attempts(), 0);
}

#[test]
fn unreachable_cluster_stack_fails_the_open() {
    let world = World::new(ImageBuilder::new());
    world.cluster.set_down(true);
    let mut rt = world.process();
    let err = rt.open(DEVICE, RW).unwrap_err();
    assert!(matches!(err, CtnError::ClusterStack(_)), "{err:?}");
}

// ── Validation gating ───────────────────────────────────────────────────────

#[test]
fn dirty_journal_blocks_offline_opens_without_writing() {
    let world = World::new(ImageBuilder::new().slots(3, 4).dirty_journal(2));
    let before = world.mem.snapshot();
    let mut rt = world.process();

    let err = rt.open(DEVICE, RW_ALLOC).unwrap_err();
    assert!(matches!(err, CtnError::JournalDirty { slot: 2 }), "{err:?}");
    assert!(err.is_precondition());
    assert_eq!(world.mem.snapshot(), before);
    assert!(!world.cluster.is_locked(DEVICE));
    assert_eq!(rt.journal_clusters(), None);
}

#[test]
fn clean_journals_record_the_largest_size() {
    let world = World::new(
        ImageBuilder::new()
            .slots(3, 4)
            .journal_clusters(1, 9)
            .journal_clusters(2, 5),
    );
    let mut rt = world.process();
    let opened = rt.open(DEVICE, RW_ALLOC).expect("open");
    assert_eq!(rt.journal_clusters(), Some(9));
    rt.close(opened.id).expect("close");
}

#[test]
fn online_sessions_skip_offline_validation() {
    let world = World::new(ImageBuilder::new().dirty_journal(0));
    world.cluster.hold_elsewhere(DEVICE);
    world.host.mount(DEVICE, "/mnt/ctn", false);
    let mut rt = world.process();
    let opened = rt.open(DEVICE, RW_ALLOC.with(OpenFlags::ONLINE)).expect("online");
    assert_eq!(opened.outcome, OpenOutcome::PerformOnline);
}

fn tamper_group_free_count(mem: &MemByteDevice, group: ctn_types::BlockNumber) {
    let cx = Cx::for_testing();
    let image = FsImage::open(&cx, "tamper", Arc::new(mem.clone()), OpenMode::ReadWrite)
        .expect("open");
    let mut gd = image.read_group_desc(&cx, group).expect("group");
    gd.free_bits_count -= 1;
    image.write_group_desc(&cx, &gd).expect("write group");
    image.close(&cx).expect("close");
}

#[test]
fn inconsistent_bitmap_blocks_allocating_opens() {
    let built = ImageBuilder::new().build().expect("build");
    let group = built.groups[1];
    let host = FakeHost::new();
    let mem = host.add_image(DEVICE, built.bytes);
    tamper_group_free_count(&mem, group);
    let cluster = FakeCluster::new("o2cb");
    let mut rt = runtime(&host, &cluster, &test_config());

    let err = rt.open(DEVICE, RW_ALLOC).unwrap_err();
    match err {
        CtnError::CorruptChain { block, .. } => assert_eq!(block, group.0),
        other => panic!("expected chain corruption, got {other:?}"),
    }
    assert!(!cluster.is_locked(DEVICE));

    // Without ALLOCATION the bitmap is not consulted.
    let opened = rt.open(DEVICE, RW).expect("non-allocating open");
    rt.close(opened.id).expect("close");
}

#[test]
fn interrupted_feature_change_is_fenced_on_disk() {
    let world = World::new(ImageBuilder::new());
    let mut rt = world.process();
    let opened = rt.open(DEVICE, RW).expect("open");
    rt.set_in_progress(
        opened.id,
        ctn_core::InProgress::Tunefs(ctn_types::TunefsFlags::INLINE_EXPAND),
    )
    .expect("mark");
    rt.close(opened.id).expect("close");

    let err = rt.open(DEVICE, RW).unwrap_err();
    assert!(matches!(err, CtnError::TunefsInProgress(0x4)), "{err:?}");
    // Read-only inspection is still allowed.
    let ro = rt.open(DEVICE, OpenFlags::RO).expect("ro");
    rt.close(ro.id).expect("close ro");
    assert!(peek(&world.mem).expect("peek").superblock().tunefs_flag.bits() != 0);
}
