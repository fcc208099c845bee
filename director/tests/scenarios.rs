//! End-to-end scenarios against the public director API, with mock ports.

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use director::lockable::LockedStore;
use director::locks::{Grants, LockSet, LockTable, LockTimeouts};
use director::ports::mock::{MockPortConfig, MockPorts};
use director::records::{Blade, Ownership, ResourceState};
use director::store;
use director::{
    BladeSpec, DirectorConfig, HostDb, HostStateManager, ManualClock, MemoryHostDb, ResourceStatus,
    ResultCode, SqliteHostDb, VmCapacity, VmHardwareSpec, VmSoftwareSpec,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn blades(ips: &[&str]) -> Vec<BladeSpec> {
    ips.iter().copied().map(BladeSpec::from_ip).collect()
}

struct Lab {
    manager: HostStateManager,
    ports: Arc<MockPorts>,
    clock: ManualClock,
}

fn lab(ips: &[&str], mock: MockPortConfig, config: DirectorConfig) -> Lab {
    init_tracing();
    let ports = MockPorts::new(mock);
    let clock = ManualClock::default();
    let manager = HostStateManager::with_clock(
        config,
        Arc::new(MemoryHostDb::new()),
        ports.ports(),
        Arc::new(clock.clone()),
    );
    manager.init_with_resources(blades(ips)).unwrap();
    Lab { manager, ports, clock }
}

fn fast_config() -> DirectorConfig {
    DirectorConfig {
        boot_poll_interval: Duration::from_millis(10),
        ..DirectorConfig::default()
    }
}

#[test]
fn basic_claim() {
    let lab = lab(&["1.1.1.1"], MockPortConfig::default(), fast_config());
    let manager = &lab.manager;

    let outcome = manager.request("1.1.1.1", "A").unwrap();
    assert_eq!(outcome.code, ResultCode::Success);
    assert_eq!(outcome.resource.as_deref(), Some("1.1.1.1"));
    assert_eq!(manager.get_status("1.1.1.1", "A").unwrap(), ResourceStatus::Yours);
    assert_eq!(manager.get_status("1.1.1.1", "B").unwrap(), ResourceStatus::NotYours);
    assert!(manager.is_mine("1.1.1.1", "A").unwrap());
    assert_eq!(manager.owned_by("A").unwrap(), vec!["1.1.1.1".to_string()]);
    assert_eq!(lab.ports.tracker().notification_count(), 1);

    assert_eq!(manager.release("1.1.1.1", "A", false).unwrap().code, ResultCode::Success);
    assert_eq!(manager.get_status("1.1.1.1", "A").unwrap(), ResourceStatus::Unused);
    assert!(manager.locks_idle());
}

#[test]
fn queued_requestor_gets_the_blade_on_release() {
    let lab = lab(&["1.1.1.1"], MockPortConfig::default(), fast_config());
    let manager = &lab.manager;

    manager.request("1.1.1.1", "A").unwrap();
    assert_eq!(manager.request("1.1.1.1", "B").unwrap().code, ResultCode::Pending);
    assert_eq!(
        manager.get_status("1.1.1.1", "A").unwrap(),
        ResourceStatus::ReleasePending
    );
    assert_eq!(
        manager.get_status("1.1.1.1", "B").unwrap(),
        ResourceStatus::ReleasePending
    );

    assert_eq!(manager.release("1.1.1.1", "A", false).unwrap().code, ResultCode::Success);
    assert_eq!(manager.get_status("1.1.1.1", "B").unwrap(), ResourceStatus::Yours);
    assert_eq!(manager.get_status("1.1.1.1", "A").unwrap(), ResourceStatus::NotYours);

    let blade = manager.blade("1.1.1.1").unwrap().unwrap();
    assert_eq!(blade.ownership().state, ResourceState::InUse);
    assert_eq!(blade.ownership().next_owner, None);
    assert!(blade.ownership().is_consistent());

    let log: Vec<String> = manager
        .resource_log("1.1.1.1")
        .unwrap()
        .into_iter()
        .map(|event| event.message)
        .collect();
    assert!(log.iter().any(|line| line == "claimed by A"));
    assert!(log.iter().any(|line| line == "B queued"));
    assert!(log.iter().any(|line| line == "released by A, now owned by B"));
}

#[test]
fn single_queue_slot() {
    let lab = lab(&["1.1.1.1"], MockPortConfig::default(), fast_config());
    let manager = &lab.manager;

    manager.request("1.1.1.1", "A").unwrap();
    manager.request("1.1.1.1", "B").unwrap();
    assert_eq!(manager.request("1.1.1.1", "C").unwrap().code, ResultCode::QueueFull);
    // the owner may not queue behind itself
    assert_eq!(manager.request("1.1.1.1", "A").unwrap().code, ResultCode::QueueFull);
}

#[test]
fn concurrent_requests_fill_the_queue_slot_once() {
    let lab = lab(&["1.1.1.1"], MockPortConfig::default(), fast_config());
    let manager = &lab.manager;
    manager.request("1.1.1.1", "A").unwrap();

    let contenders: Vec<String> = (0..8).map(|n| format!("R{}", n)).collect();
    let barrier = Barrier::new(contenders.len());
    let codes: Vec<ResultCode> = thread::scope(|scope| {
        let running: Vec<_> = contenders
            .iter()
            .map(|who| {
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    manager.request("1.1.1.1", who).unwrap().code
                })
            })
            .collect();
        running.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(codes.iter().filter(|code| **code == ResultCode::Pending).count(), 1);
    assert_eq!(
        codes.iter().filter(|code| **code == ResultCode::QueueFull).count(),
        contenders.len() - 1
    );

    let blade = manager.blade("1.1.1.1").unwrap().unwrap();
    let ownership = blade.ownership();
    assert!(ownership.is_consistent());
    assert!(ownership.is_owned_by("A"));
    let queued = ownership.next_owner.clone().unwrap();
    assert!(contenders.contains(&queued));
    assert!(manager.locks_idle());
}

#[test]
fn repeated_requests_are_idempotent() {
    let lab = lab(&["1.1.1.1"], MockPortConfig::default(), fast_config());
    let manager = &lab.manager;

    manager.request("1.1.1.1", "A").unwrap();
    manager.request("1.1.1.1", "B").unwrap();
    for _ in 0..3 {
        assert_eq!(manager.request("1.1.1.1", "B").unwrap().code, ResultCode::Success);
    }
    let blade = manager.blade("1.1.1.1").unwrap().unwrap();
    assert!(blade.ownership().is_owned_by("A"));
    assert!(blade.ownership().is_queued_for("B"));
}

#[test]
fn request_any_fills_unused_then_queues_then_gives_up() {
    let lab = lab(&["1.1.1.1", "2.2.2.2"], MockPortConfig::default(), fast_config());
    let manager = &lab.manager;

    assert_eq!(manager.request_any("A").unwrap().code, ResultCode::Success);
    assert_eq!(manager.request_any("B").unwrap().code, ResultCode::Success);
    assert_eq!(manager.request_any("C").unwrap().code, ResultCode::Pending);
    assert_eq!(manager.request_any("D").unwrap().code, ResultCode::Pending);
    assert_eq!(manager.request_any("E").unwrap().code, ResultCode::ClusterFull);
}

#[test]
fn keepalive_expiry_evicts_and_promotes() {
    let lab = lab(&["1.1.1.1"], MockPortConfig::default(), fast_config());
    let manager = &lab.manager;

    manager.request("1.1.1.1", "A").unwrap();
    manager.request("1.1.1.1", "B").unwrap();

    lab.clock.advance(chrono::Duration::seconds(299));
    assert!(manager.is_mine("1.1.1.1", "A").unwrap());

    lab.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(manager.get_status("1.1.1.1", "B").unwrap(), ResourceStatus::Yours);
    assert!(!manager.is_mine("1.1.1.1", "A").unwrap());
    assert!(manager.locks_idle());
}

#[test]
fn vm_packing_spills_to_a_second_server() {
    let config = DirectorConfig {
        vm_capacity: VmCapacity {
            max_vms: 20,
            max_memory_mb: 20480,
            max_cpus: 12,
        },
        ..fast_config()
    };
    let lab = lab(&["10.0.1.1", "10.0.1.2", "10.0.1.3"], MockPortConfig::default(), config);
    let manager = &lab.manager;

    let mut tokens = Vec::new();
    for n in 0..8 {
        let outcome = manager
            .request_vm(
                VmHardwareSpec {
                    memory_mb: 4096,
                    cpu_count: 1,
                },
                VmSoftwareSpec::default(),
                &format!("user{}", n),
            )
            .unwrap();
        assert_eq!(outcome.code, ResultCode::Pending, "{}", outcome);
        tokens.push(outcome.token.unwrap());
    }
    for token in &tokens {
        let done = manager.wait(token, Duration::from_secs(10));
        assert_eq!(done.code, ResultCode::Success, "{}", done);
    }

    let fleet = manager.list_resources().unwrap();
    assert_eq!(fleet.children_of("10.0.1.1").count(), 5);
    assert_eq!(fleet.children_of("10.0.1.2").count(), 3);
    assert_eq!(fleet.children_of("10.0.1.3").count(), 0);

    let server = manager.blade("10.0.1.1").unwrap().unwrap();
    assert!(server.is_vm_server());
    assert_eq!(server.ownership().state, ResourceState::InUseByDirector);
    assert!(server.ownership().is_owned_by("vmserver"));

    let vms: Vec<String> = fleet.children_of("10.0.1.2").map(|vm| vm.ip().to_string()).collect();
    assert_eq!(vms, vec!["10.0.2.2", "10.0.3.2", "10.0.4.2"]);
    // one power cycle per server, not per VM
    assert_eq!(lab.ports.tracker().power_on_count(), 2);
    assert!(manager.locks_idle());
}

#[test]
fn vm_request_without_room_is_cluster_full() {
    let lab = lab(&["10.0.1.1"], MockPortConfig::default(), fast_config());
    let manager = &lab.manager;
    manager.request("10.0.1.1", "A").unwrap();

    let outcome = manager
        .request_vm(
            VmHardwareSpec {
                memory_mb: 4096,
                cpu_count: 1,
            },
            VmSoftwareSpec::default(),
            "B",
        )
        .unwrap();
    assert_eq!(outcome.code, ResultCode::ClusterFull);
}

#[test]
fn expired_vms_are_evicted_and_the_server_demoted() {
    let lab = lab(&["10.0.1.1"], MockPortConfig::default(), fast_config());
    let manager = &lab.manager;

    let outcome = manager
        .request_vm(
            VmHardwareSpec {
                memory_mb: 2048,
                cpu_count: 2,
            },
            VmSoftwareSpec::default(),
            "A",
        )
        .unwrap();
    let vm = outcome.resource.clone().unwrap();
    manager.wait(&outcome.token.unwrap(), Duration::from_secs(10));
    assert!(manager.is_mine(&vm, "A").unwrap());

    lab.clock.advance(chrono::Duration::minutes(6));
    assert_eq!(manager.get_status("10.0.1.1", "A").unwrap(), ResourceStatus::Unused);
    assert!(manager.vm(&vm).unwrap().is_none());
    assert!(!manager.blade("10.0.1.1").unwrap().unwrap().is_vm_server());
}

#[test]
fn release_cancels_a_running_bios_deploy() {
    let mock = MockPortConfig {
        bios_delay: Duration::from_secs(5 * 60),
        ..Default::default()
    };
    let lab = lab(&["1.1.1.1"], mock, fast_config());
    let manager = &lab.manager;

    manager.request("1.1.1.1", "A").unwrap();
    let started = manager.deploy_bios("1.1.1.1", "<bios/>", "A").unwrap();
    assert_eq!(started.code, ResultCode::Pending);
    let token = started.token.unwrap();
    assert_eq!(manager.progress(&token).code, ResultCode::Pending);

    let began = Instant::now();
    assert_eq!(manager.release("1.1.1.1", "A", false).unwrap().code, ResultCode::Success);
    assert!(began.elapsed() < Duration::from_secs(60));

    assert_eq!(manager.progress(&token).code, ResultCode::Cancelled);
    assert_eq!(manager.get_status("1.1.1.1", "A").unwrap(), ResourceStatus::Unused);
    let blade = manager.blade("1.1.1.1").unwrap().unwrap();
    assert_eq!(blade.bios().last_deployed, None);
    assert!(manager.locks_idle());
}

#[test]
fn upgrade_sees_writes_made_by_another_handle() {
    init_tracing();
    let db: Arc<dyn HostDb> = Arc::new(MemoryHostDb::new());
    store::insert_record(db.as_ref(), &Blade::new(BladeSpec::from_ip("1.1.1.1"), "clean", Utc::now()))
        .unwrap();
    let store = LockedStore::new(db, Arc::new(LockTable::new(LockTimeouts::default())));

    let mut watcher = store.lock::<Blade>("1.1.1.1", Grants::none()).unwrap();

    let writer_store = store.clone();
    let (done_tx, done_rx) = mpsc::channel();
    let writer = thread::spawn(move || {
        let mut handle = writer_store
            .lock::<Blade>("1.1.1.1", Grants::write(LockSet::OWNERSHIP))
            .unwrap();
        handle.write::<Ownership>().unwrap().claim("B", Utc::now());
        drop(handle);
        done_tx.send(()).unwrap();
    });
    done_rx.recv().unwrap();
    writer.join().unwrap();

    watcher.upgrade(Grants::read(LockSet::OWNERSHIP)).unwrap();
    assert!(watcher.read::<Ownership>().unwrap().is_owned_by("B"));
    drop(watcher);
    assert!(store.locks().all_unlocked());
}

#[test]
fn state_survives_in_sqlite() {
    init_tracing();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let db = SqliteHostDb::open("sqlite::memory:", runtime.handle().clone()).unwrap();
    let manager = HostStateManager::new(
        fast_config(),
        Arc::new(db),
        MockPorts::new(MockPortConfig::default()).ports(),
    );
    manager.init_with_resources(blades(&["1.1.1.1"])).unwrap();

    manager.request("1.1.1.1", "A").unwrap();
    manager.request("1.1.1.1", "B").unwrap();
    assert_eq!(manager.release("1.1.1.1", "A", false).unwrap().code, ResultCode::Success);
    assert!(manager.is_mine("1.1.1.1", "B").unwrap());
    assert!(manager.resource_log("1.1.1.1").unwrap().len() >= 3);
}
