// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::{Duration, Instant};

use drv_mock_smbus::{MockChipset, MockSmbus, PCH_SMBUS};
use drv_pc_smbus::{
    AccessMode, PageSelect, PlatformFamily, ResponseCode, SmbusConfig,
    SmbusController, SmbusSession, Status, Transaction,
};

const INTEL: MockChipset = MockChipset::Intel { device_id: 0x7aa3 };

const ALL: [MockChipset; 4] = [
    INTEL,
    MockChipset::Amd,
    MockChipset::Nvidia,
    MockChipset::SkylakeX,
];

fn config() -> SmbusConfig {
    SmbusConfig {
        timeout_ms: 200,
        write_settle_ms: 0,
        lock_timeout_ms: 200,
        cross_process_lock: false,
        ..Default::default()
    }
}

fn session(mock: &Arc<MockSmbus>, config: SmbusConfig) -> SmbusSession {
    SmbusSession::new(mock.clone(), config).unwrap()
}

fn open(chipset: MockChipset) -> (Arc<MockSmbus>, SmbusSession) {
    let mock = MockSmbus::new(chipset);
    let session = session(&mock, config());
    (mock, session)
}

fn controller(mock: &Arc<MockSmbus>, session: &SmbusSession) -> SmbusController {
    session.open(&**mock).unwrap()
}

#[test]
fn detects_each_platform() {
    let expected = [
        (PlatformFamily::Default, Some(0x7a84)),
        (PlatformFamily::Default, None),
        (PlatformFamily::Default, None),
        (PlatformFamily::SkylakeX, None),
    ];

    for (chipset, (family, chipset_id)) in ALL.into_iter().zip(expected) {
        let (mock, session) = open(chipset);
        let ctl = controller(&mock, &session);

        assert_eq!(ctl.platform_family(), family, "{chipset:?}");
        assert_eq!(ctl.chipset_id(), chipset_id, "{chipset:?}");
    }
}

#[test]
fn unknown_controller_is_refused() {
    let (mock, session) = open(MockChipset::Intel { device_id: 0x1234 });
    assert_eq!(
        session.open(&*mock).err(),
        Some(ResponseCode::NoController)
    );
}

#[test]
fn controller_for_explicit_location() {
    let (mock, session) = open(INTEL);
    let ctl = session.controller_for(PCH_SMBUS, None).unwrap();

    assert_eq!(ctl.vendor_id(), 0x8086);
    assert_eq!(ctl.device_id(), 0x7aa3);
    assert_eq!(ctl.chipset_id(), None);
    drop(mock);
}

#[test]
fn scan_returns_every_responder() {
    let (mock, session) = open(INTEL);
    mock.add_ddr4(0, 0x50);
    mock.add_ddr4(0, 0x52);

    let ctl = controller(&mock, &session);
    assert_eq!(ctl.scan(false), vec![0x50, 0x52]);
}

#[test]
fn minimal_scan_stops_at_first_hit() {
    let (mock, session) = open(INTEL);
    mock.add_ddr4(0, 0x50);
    mock.add_ddr4(0, 0x52);

    let ctl = controller(&mock, &session);
    mock.reset_stats();

    assert_eq!(ctl.scan(true), vec![0x50]);
    assert_eq!(mock.stats().transactions, 1);
    assert!(ctl.probe_address(0x52));
    assert!(!ctl.probe_address(0x51));
}

#[test]
fn reads_and_writes_on_every_platform() {
    for chipset in ALL {
        let (mock, session) = open(chipset);
        mock.add_ddr4(0, 0x50);

        let ctl = controller(&mock, &session);

        assert_eq!(ctl.read_byte_data(2), Ok(0x0c), "{chipset:?}");
        assert_eq!(ctl.read_word_data(0), Ok(0x1123), "{chipset:?}");

        ctl.write_byte_data(0x10, 0x5a).unwrap();
        assert_eq!(ctl.read_byte_data(0x10), Ok(0x5a), "{chipset:?}");
        assert_eq!(mock.nvm(0, 0x50)[0x10], 0x5a);

        // Receive byte continues from where the last access left off
        assert_eq!(ctl.read_byte_data(0), Ok(0x23));
        assert_eq!(ctl.receive_byte(), Ok(0x11), "{chipset:?}");
    }
}

#[test]
fn nack_is_a_device_error() {
    for chipset in ALL {
        let (mock, session) = open(chipset);
        let ctl = controller(&mock, &session);

        let mut txn = Transaction::read_byte_data(0, 0x57, 0);
        assert_eq!(ctl.execute(&mut txn), Err(ResponseCode::DeviceError));
        assert_eq!(txn.status, Status::Error, "{chipset:?}");
    }
}

#[test]
fn slow_controller_still_completes() {
    for chipset in ALL {
        let (mock, session) = open(chipset);
        mock.add_ddr4(0, 0x50);
        mock.set_busy_polls(500);

        let ctl = controller(&mock, &session);
        let mut txn = Transaction::read_byte_data(0, 0x50, 2);

        assert_eq!(ctl.execute(&mut txn), Ok(()));
        assert_eq!(txn.status, Status::Success);
        assert_eq!(txn.output_byte(), 0x0c, "{chipset:?}");
    }
}

#[test]
fn stuck_controller_times_out() {
    for chipset in ALL {
        let mock = MockSmbus::new(chipset);
        mock.add_ddr4(0, 0x50);

        let session = session(
            &mock,
            SmbusConfig {
                timeout_ms: 50,
                ..config()
            },
        );
        let ctl = controller(&mock, &session);
        mock.set_stuck_busy(true);

        let mut txn = Transaction::read_byte_data(0, 0x50, 0);
        let start = Instant::now();

        assert_eq!(ctl.execute(&mut txn), Err(ResponseCode::Timeout));
        assert_eq!(txn.status, Status::Timeout, "{chipset:?}");

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "{chipset:?}");
        assert!(elapsed < Duration::from_millis(550), "{chipset:?}");
    }
}

#[test]
fn piix_timeout_kills_the_transaction() {
    let mock = MockSmbus::new(INTEL);
    mock.add_ddr4(0, 0x50);

    let session = session(
        &mock,
        SmbusConfig {
            timeout_ms: 20,
            ..config()
        },
    );
    let ctl = controller(&mock, &session);

    mock.set_stuck_busy(true);
    assert_eq!(ctl.read_byte_data(0), Err(ResponseCode::Timeout));
    assert_eq!(mock.stats().kills, 1);

    // The host is usable again once it comes unstuck
    mock.set_stuck_busy(false);
    assert_eq!(ctl.read_byte_data(2), Ok(0x0c));
}

#[test]
fn intel_has_only_one_bus() {
    let (mock, session) = open(INTEL);
    let mut ctl = controller(&mock, &session);

    assert_eq!(ctl.set_bus(1), Err(ResponseCode::Unsupported));
    assert_eq!(ctl.bus(), 0);

    let mut txn = Transaction::quick(1, 0x50, AccessMode::Read);
    assert_eq!(ctl.execute(&mut txn), Err(ResponseCode::Unsupported));
    assert_eq!(txn.status, Status::Aborted);
}

#[test]
fn amd_second_bus() {
    let (mock, session) = open(MockChipset::Amd);
    mock.add_ddr4(1, 0x53);

    let mut ctl = controller(&mock, &session);
    assert!(ctl.scan(false).is_empty());

    ctl.set_bus(1).unwrap();
    ctl.set_address(0x53).unwrap();
    assert_eq!(ctl.scan(false), vec![0x53]);
    assert_eq!(ctl.max_spd_size(), 512);
}

#[test]
fn find_bus_restores_selection() {
    let (mock, session) = open(MockChipset::Amd);
    mock.add_ddr4(1, 0x56);

    let mut ctl = controller(&mock, &session);
    assert_eq!(ctl.find_bus(), vec![1]);
    assert_eq!(ctl.bus(), 0);

    mock.add_ddr3(0, 0x50);
    assert_eq!(ctl.find_bus(), vec![0, 1]);
    assert_eq!(ctl.bus(), 0);
}

#[test]
fn addressing_probes_the_module() {
    let (mock, session) = open(INTEL);
    mock.add_ddr4(0, 0x50);
    mock.add_ddr5(0, 0x51);
    mock.add_ddr3(0, 0x52);

    let mut ctl = controller(&mock, &session);

    ctl.set_address(0x51).unwrap();
    assert!(ctl.is_ddr5_present());
    assert_eq!(ctl.max_spd_size(), 1024);

    ctl.select_page(3, PageSelect::Register(0x0b)).unwrap();
    assert_eq!(ctl.cached_page(), Some(3));

    ctl.set_address(0x50).unwrap();
    assert!(!ctl.is_ddr5_present());
    assert_eq!(ctl.max_spd_size(), 512);
    assert_eq!(ctl.cached_page(), Some(0));

    ctl.set_address(0x52).unwrap();
    assert_eq!(ctl.max_spd_size(), 256);
    assert_eq!(ctl.cached_page(), None);

    ctl.set_address(0x53).unwrap();
    assert_eq!(ctl.max_spd_size(), 0);
    assert!(!ctl.is_ddr5_present());

    assert_eq!(ctl.set_address(0x80), Err(ResponseCode::BadArg));
    assert_eq!(ctl.address(), 0x53);
}

#[test]
fn addressing_rewinds_ee1004_pages() {
    let (mock, session) = open(INTEL);
    mock.add_ddr4(0, 0x50);
    mock.add_ddr4(0, 0x51);

    let mut ctl = controller(&mock, &session);
    ctl.set_address(0x50).unwrap();

    // SPA1 is heard by both modules
    ctl.select_page(1, PageSelect::Command(0x37)).unwrap();
    assert_eq!(ctl.cached_page(), Some(1));
    assert_eq!(mock.page(0, 0x51), 1);

    ctl.set_address(0x51).unwrap();
    assert_eq!(ctl.max_spd_size(), 512);
    assert_eq!(ctl.cached_page(), Some(0));
    assert_eq!(mock.page(0, 0x50), 0);
    assert_eq!(mock.page(0, 0x51), 0);
}

#[test]
fn addressing_leaves_ee1002_protection_alone() {
    let (mock, session) = open(INTEL);
    mock.add_ddr3(0, 0x56);

    let mut ctl = controller(&mock, &session);
    mock.reset_stats();

    // 0x36 is this module's permanent protection address
    ctl.set_address(0x56).unwrap();
    assert_eq!(ctl.max_spd_size(), 256);
    assert!(!mock.pswp(0, 0x56));
    assert!(!mock
        .log()
        .iter()
        .any(|t| t.address == 0x36 && t.access == AccessMode::Write));
}

#[test]
fn failed_page_select_forgets_the_page() {
    let (mock, session) = open(INTEL);
    mock.add_ddr5(0, 0x51);

    let mut ctl = controller(&mock, &session);
    ctl.set_address(0x51).unwrap();
    ctl.select_page(2, PageSelect::Register(0x0b)).unwrap();
    assert_eq!(mock.page(0, 0x51), 2);

    ctl.set_address(0x53).unwrap();
    assert_eq!(
        ctl.select_page(2, PageSelect::Register(0x0b)),
        Err(ResponseCode::DeviceError)
    );
    assert_eq!(ctl.cached_page(), None);
}

#[test]
fn probe_failure_is_reported() {
    let mock = MockSmbus::new(INTEL);
    mock.add_ddr4(0, 0x50);

    let session = session(
        &mock,
        SmbusConfig {
            timeout_ms: 20,
            ..config()
        },
    );
    let mut ctl = controller(&mock, &session);

    mock.set_stuck_busy(true);
    assert_eq!(ctl.set_address(0x50), Err(ResponseCode::Timeout));
    assert_eq!(ctl.address(), 0x50);
    assert_eq!(ctl.max_spd_size(), 0);
    assert!(!ctl.is_ddr5_present());
    assert_eq!(ctl.cached_page(), None);

    mock.set_stuck_busy(false);
    ctl.set_address(0x50).unwrap();
    assert_eq!(ctl.max_spd_size(), 512);
}

#[test]
fn firmware_write_lockout_is_reported() {
    for chipset in [INTEL, MockChipset::SkylakeX] {
        let (mock, session) = open(chipset);
        mock.set_spd_write_disabled(true);

        let ctl = controller(&mock, &session);
        assert!(ctl.spd_write_disabled(), "{chipset:?}");
    }

    let (mock, session) = open(INTEL);
    assert!(!controller(&mock, &session).spd_write_disabled());
}

#[test]
fn nvidia_doubles_write_settle() {
    let mock = MockSmbus::new(MockChipset::Nvidia);
    mock.add_ddr4(0, 0x50);

    let session = session(
        &mock,
        SmbusConfig {
            write_settle_ms: 15,
            ..config()
        },
    );
    let ctl = controller(&mock, &session);

    let start = Instant::now();
    ctl.write_byte_data(0x20, 1).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn busy_bus_lock_aborts() {
    let (mock, session) = open(INTEL);
    mock.add_ddr4(0, 0x50);

    let ctl = controller(&mock, &session);
    let guard = session
        .bus_lock()
        .acquire(Duration::from_millis(10))
        .unwrap();

    let mut txn = Transaction::read_byte_data(0, 0x50, 0);
    assert_eq!(ctl.execute(&mut txn), Err(ResponseCode::LockUnavailable));
    assert_eq!(txn.status, Status::Aborted);

    drop(guard);
    assert_eq!(ctl.execute(&mut txn), Ok(()));
}

#[test]
fn transactions_never_overlap() {
    let (mock, session) = open(INTEL);
    mock.add_ddr4(0, 0x50);
    mock.set_busy_polls(20);

    let controllers = [controller(&mock, &session), controller(&mock, &session)];

    let handles: Vec<_> = controllers
        .into_iter()
        .map(|ctl| {
            std::thread::spawn(move || {
                for _ in 0..100 {
                    assert_eq!(ctl.read_byte_data(2), Ok(0x0c));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = mock.stats();
    assert!(stats.transactions >= 200);
    assert_eq!(stats.max_in_flight, 1);
}

#[test]
fn machine_mutex_guards_io_access() {
    let mock = MockSmbus::new(INTEL);
    mock.add_ddr4(0, 0x50);

    let session = session(
        &mock,
        SmbusConfig {
            cross_process_lock: true,
            isa_mutex_name: format!("pc-smbus-test-{}", std::process::id()),
            ..config()
        },
    );

    let ctl = controller(&mock, &session);
    assert_eq!(ctl.read_byte_data(2), Ok(0x0c));
}
