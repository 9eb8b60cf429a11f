//! End-to-end scenarios against the in-process controller simulator. The
//! driver code under test is the same code that drives real hardware; only
//! the platform binding differs.

use std::time::Duration;

use nvme_host::cmd::admin::LogSupportedPages;
use nvme_host::{
    Command, ControllerConfig, NvmeController, NvmeError, SimConfig, SimNamespaceConfig,
    SyncOptions, NVSIM_SLOT,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A simulator with one small namespace so test backings stay tiny.
fn small_sim(num_lbas: u64, block_size: u32) -> SimConfig {
    SimConfig {
        namespaces: vec![SimNamespaceConfig::with_num_lbas(num_lbas, block_size)],
        ..SimConfig::default()
    }
}

fn bring_up(config: SimConfig) -> NvmeController {
    init_logging();
    let mut ctrl = NvmeController::open_sim(config).unwrap();
    ctrl.init_admin_queues(64, 256).unwrap();
    ctrl.cc_enable().unwrap();
    ctrl
}

#[test]
fn test_bring_up_with_config() {
    init_logging();
    let mut ctrl = NvmeController::open_sim(small_sim(1024, 512)).unwrap();
    let config = ControllerConfig {
        num_io_queues: 2,
        queue_entries: 64,
        ..ControllerConfig::default()
    };
    ctrl.bring_up(&config).unwrap();
    assert_eq!(ctrl.io_sq_count(), 2);

    let done = ctrl.sync_cmd(Command::flush(1)).unwrap();
    ctrl.release_command(done).unwrap();
}

#[test]
fn test_list_devices_reports_nvsim() {
    init_logging();
    let rows = nvme_host::list_devices();

    let sims: Vec<_> = rows.iter().filter(|r| r.slot == NVSIM_SLOT).collect();
    assert_eq!(sims.len(), 1);
    let sim = sims[0];
    assert_eq!(sim.serial, "EDDAE771");
    assert_eq!(sim.model, "nvsim_0.1");
    assert_eq!(sim.firmware, "0.001");
    assert_eq!(sim.namespace_count, 1);
    assert_eq!(sim.block_size, Some(512));
    assert!(sim.error.is_none());
}

#[test]
fn test_single_write_read() {
    let mut ctrl = bring_up(small_sim(8192, 512));
    ctrl.create_io_queues(1, 256).unwrap();

    let payload = vec![0xED_u8; 4096];
    let write = Command::write(1, 0, 7, payload.clone());
    let done = ctrl.sync_cmd(write).unwrap();
    assert!(done.cqe().unwrap().status_field().is_success());
    ctrl.release_command(done).unwrap();

    let read = Command::read(1, 0, 7, 4096);
    let done = ctrl.sync_cmd(read).unwrap();
    assert_eq!(done.data_in().unwrap(), payload.as_slice());
    ctrl.release_command(done).unwrap();
}

#[test]
fn test_write_read_round_trip_across_lba_range() {
    let mut ctrl = bring_up(small_sim(4096, 512));
    ctrl.create_io_queues(1, 64).unwrap();

    for (lba, blocks) in [(0u64, 1u16), (17, 3), (1000, 16), (4095, 1)] {
        let bytes = blocks as usize * 512;
        let pattern: Vec<u8> = (0..bytes).map(|i| (i as u64 + lba) as u8).collect();

        let done = ctrl
            .sync_cmd(Command::write(1, lba, blocks - 1, pattern.clone()))
            .unwrap();
        ctrl.release_command(done).unwrap();

        let done = ctrl
            .sync_cmd(Command::read(1, lba, blocks - 1, bytes))
            .unwrap();
        assert_eq!(done.data_in().unwrap(), pattern.as_slice(), "lba {}", lba);
        ctrl.release_command(done).unwrap();
    }
}

#[test]
fn test_flr_preserves_controller_identity() {
    let mut ctrl = bring_up(small_sim(1024, 512));
    ctrl.identify().unwrap();
    let before = ctrl.identify_data().unwrap();
    let sn = before.controller.sn;
    let mn = before.controller.mn;
    let fr = before.controller.fr;

    ctrl.initiate_flr().unwrap();
    assert!(!ctrl.nvme_regs().cc().en(), "FLR leaves the controller reset");
    assert!(ctrl.identify_data().is_none(), "FLR invalidates the cache");

    ctrl.init_admin_queues(64, 256).unwrap();
    ctrl.cc_enable().unwrap();
    ctrl.identify().unwrap();
    let after = ctrl.identify_data().unwrap();
    assert_eq!(sn, after.controller.sn);
    assert_eq!(mn, after.controller.mn);
    assert_eq!(fr, after.controller.fr);
}

#[test]
fn test_admin_queue_full_rejected_then_recovers() {
    init_logging();
    // Ring capacity is entries - 1: a 3-entry queue holds two commands.
    let mut ctrl = NvmeController::open_sim(small_sim(1024, 512)).unwrap();
    ctrl.init_admin_queues(3, 8).unwrap();
    ctrl.cc_enable().unwrap();

    ctrl.start_cmd(Command::get_feature_power_management(), None, None)
        .unwrap();
    ctrl.start_cmd(Command::get_feature_power_management(), None, None)
        .unwrap();
    let err = ctrl
        .start_cmd(Command::get_feature_power_management(), None, None)
        .unwrap_err();
    assert_eq!(err, NvmeError::QueueFull(0));

    // QueueFull is recoverable: reap, then post again.
    let reaped = ctrl.process_completions(&[], 2, Duration::from_secs(5));
    assert_eq!(reaped, 2);
    assert_eq!(ctrl.outstanding_count(), 0);
    ctrl.start_cmd(Command::get_feature_power_management(), None, None)
        .unwrap();
    let reaped = ctrl.process_completions(&[], 1, Duration::from_secs(5));
    assert_eq!(reaped, 1);
}

#[test]
fn test_read_beyond_namespace_fails_lba_out_of_range() {
    let num_lbas = 2048;
    let mut ctrl = bring_up(small_sim(num_lbas, 512));
    ctrl.create_io_queues(1, 64).unwrap();

    let err = ctrl
        .sync_cmd(Command::read(1, num_lbas, 0, 512))
        .unwrap_err();
    match err {
        NvmeError::CommandFailed { sct, sc, name } => {
            assert_eq!(sct, 1);
            assert_eq!(sc, 0x80);
            assert_eq!(name, "LBA Out of Range");
        }
        other => panic!("expected CommandFailed, got {:?}", other),
    }
}

#[test]
fn test_flush_nsid_handling() {
    let mut ctrl = bring_up(small_sim(1024, 512));
    ctrl.create_io_queues(1, 64).unwrap();

    let done = ctrl.sync_cmd(Command::flush(1)).unwrap();
    ctrl.release_command(done).unwrap();

    let done = ctrl.sync_cmd(Command::flush(0xFFFF_FFFF)).unwrap();
    ctrl.release_command(done).unwrap();

    let err = ctrl.sync_cmd(Command::flush(0)).unwrap_err();
    match err {
        NvmeError::CommandFailed { sct, sc, name } => {
            assert_eq!((sct, sc), (0, 0x0B));
            assert_eq!(name, "Invalid Namespace or Format");
        }
        other => panic!("expected CommandFailed, got {:?}", other),
    }
}

#[test]
fn test_outstanding_table_returns_to_size() {
    let mut ctrl = bring_up(small_sim(1024, 512));
    ctrl.create_io_queues(1, 64).unwrap();

    let before = ctrl.outstanding_count();
    for _ in 0..32 {
        let done = ctrl.sync_cmd(Command::flush(1)).unwrap();
        ctrl.release_command(done).unwrap();
    }
    assert_eq!(ctrl.outstanding_count(), before);
}

#[test]
fn test_disable_is_idempotent() {
    let mut ctrl = bring_up(small_sim(1024, 512));

    ctrl.cc_disable().unwrap();
    ctrl.cc_disable().unwrap();
    assert!(!ctrl.nvme_regs().cc().en());
    assert!(!ctrl.nvme_regs().csts().rdy());
    assert_eq!(ctrl.outstanding_count(), 0);
    // Queue memory went back to the pool with the queues.
    assert!(ctrl.allocated_dma().is_empty());
}

#[test]
fn test_timeout_leaves_cid_with_device() {
    let mut ctrl = bring_up(small_sim(1024, 512));

    // A zero deadline usually expires before the simulator answers; the
    // command then still belongs to the device until reaped.
    let result = ctrl.sync_cmd_with(
        Command::get_feature_power_management(),
        SyncOptions {
            timeout: Duration::ZERO,
            ..Default::default()
        },
    );
    match result {
        Err(NvmeError::Timeout) => {
            assert_eq!(ctrl.outstanding_count(), 1);
            let reaped = ctrl.process_completions(&[], 1, Duration::from_secs(5));
            assert_eq!(reaped, 1);
            assert_eq!(ctrl.outstanding_count(), 0);
        }
        // The simulator can win the race; then the command just completed.
        Ok(_) => assert_eq!(ctrl.outstanding_count(), 0),
        Err(other) => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_power_state_round_trip() {
    let mut ctrl = bring_up(small_sim(1024, 512));

    assert_eq!(ctrl.power_state().unwrap(), 0);
    ctrl.set_power_state(3).unwrap();
    assert_eq!(ctrl.power_state().unwrap(), 3);
}

#[test]
fn test_get_log_supported_pages() {
    let mut ctrl = bring_up(small_sim(1024, 512));

    let done = ctrl.sync_cmd(Command::get_log_supported_pages()).unwrap();
    let log = LogSupportedPages::from_bytes(done.data_in().unwrap());
    assert!(log.supported(0x00));
    assert!(log.supported(0x02));
    ctrl.release_command(done).unwrap();

    // Only LID 0 is implemented; others fail with Invalid Log Page.
    let err = ctrl.sync_cmd(Command::get_log_smart()).unwrap_err();
    match err {
        NvmeError::CommandFailed { sct, sc, .. } => assert_eq!((sct, sc), (1, 0x09)),
        other => panic!("expected CommandFailed, got {:?}", other),
    }
}

#[test]
fn test_format_nvm_clears_data() {
    let mut ctrl = bring_up(small_sim(1024, 512));
    ctrl.create_io_queues(1, 64).unwrap();

    let done = ctrl
        .sync_cmd(Command::write(1, 5, 0, vec![0x77; 512]))
        .unwrap();
    ctrl.release_command(done).unwrap();

    let done = ctrl.sync_cmd(Command::format_nvm(1, 0, 0)).unwrap();
    ctrl.release_command(done).unwrap();

    let done = ctrl.sync_cmd(Command::read(1, 5, 0, 512)).unwrap();
    assert_eq!(done.data_in().unwrap(), vec![0u8; 512].as_slice());
    ctrl.release_command(done).unwrap();
}

#[test]
fn test_identify_cache_contents() {
    let mut ctrl = bring_up(small_sim(2048, 512));
    ctrl.identify().unwrap();

    let data = ctrl.identify_data().unwrap();
    assert_eq!(data.serial, "EDDAE771");
    assert_eq!(data.namespaces.len(), 1);
    let ns = &data.namespaces[0];
    assert_eq!(ns.nsid, 1);
    assert_eq!(ns.block_size, 512);
    assert_eq!(ns.nsze, 2048);
    assert_eq!(ns.lba_size, "512 B");
    // The simulator serves the UUID list.
    assert!(data.uuid_list.is_some());
    assert_eq!(data.uuid_list.as_ref().unwrap().entries[0].uuid[0], 1);
}

#[test]
fn test_two_namespace_config() {
    let config = SimConfig {
        namespaces: vec![
            SimNamespaceConfig::with_num_lbas(1024, 512),
            SimNamespaceConfig::with_num_lbas(256, 4096),
        ],
        ..SimConfig::default()
    };
    let mut ctrl = bring_up(config);
    ctrl.identify().unwrap();

    let data = ctrl.identify_data().unwrap();
    assert_eq!(data.namespaces.len(), 2);
    assert_eq!(data.namespaces[1].nsid, 2);
    assert_eq!(data.namespaces[1].block_size, 4096);
    assert_eq!(data.namespaces[1].lba_size, "4 KiB");
}

#[test]
fn test_msix_completions() {
    let mut ctrl = bring_up(small_sim(4096, 512));
    ctrl.init_msix_interrupts(4, 0).unwrap();
    ctrl.create_io_queues(2, 64).unwrap();

    let payload = vec![0x5A_u8; 512];
    let done = ctrl
        .sync_cmd(Command::write(1, 9, 0, payload.clone()))
        .unwrap();
    ctrl.release_command(done).unwrap();

    let done = ctrl.sync_cmd(Command::read(1, 9, 0, 512)).unwrap();
    assert_eq!(done.data_in().unwrap(), payload.as_slice());
    ctrl.release_command(done).unwrap();
}

#[test]
fn test_io_commands_round_robin_across_queues() {
    let mut ctrl = bring_up(small_sim(4096, 512));
    ctrl.create_io_queues(3, 64).unwrap();
    assert_eq!(ctrl.io_sq_count(), 3);

    for lba in 0..6u64 {
        let done = ctrl
            .sync_cmd(Command::write(1, lba, 0, vec![lba as u8; 512]))
            .unwrap();
        ctrl.release_command(done).unwrap();
    }
    for lba in 0..6u64 {
        let done = ctrl.sync_cmd(Command::read(1, lba, 0, 512)).unwrap();
        assert_eq!(done.data_in().unwrap()[0], lba as u8);
        ctrl.release_command(done).unwrap();
    }
}

#[test]
fn test_delete_io_queues() {
    let mut ctrl = bring_up(small_sim(1024, 512));
    ctrl.create_io_queues(2, 64).unwrap();
    assert_eq!(ctrl.io_sq_count(), 2);

    ctrl.delete_io_queues().unwrap();
    assert_eq!(ctrl.io_sq_count(), 0);

    // No I/O SQ left to round-robin onto.
    let err = ctrl
        .start_cmd(Command::flush(1), None, None)
        .unwrap_err();
    assert!(matches!(err, NvmeError::UnknownQueuePair(_, _)));
}

#[test]
fn test_unsupported_admin_opcode_rejected() {
    let mut ctrl = bring_up(small_sim(1024, 512));

    // Sanitize has a typed constructor but no simulator handler.
    let err = ctrl
        .sync_cmd(Command::sanitize(nvme_host::cmd::admin::SanitizeAction::BlockErase))
        .unwrap_err();
    match err {
        NvmeError::CommandFailed { sct, sc, name } => {
            assert_eq!((sct, sc), (0, 0x02));
            assert_eq!(name, "Invalid Field in Command");
        }
        other => panic!("expected CommandFailed, got {:?}", other),
    }
}

#[test]
fn test_large_transfer_uses_chained_prp() {
    // 3 MiB crosses the single-list-page boundary.
    let blocks = 3 * 1024 * 1024 / 512;
    let mut ctrl = bring_up(small_sim(blocks as u64 + 64, 512));
    ctrl.create_io_queues(1, 64).unwrap();

    let bytes = 3 * 1024 * 1024;
    let pattern: Vec<u8> = (0..bytes).map(|i| (i / 512) as u8).collect();
    let done = ctrl
        .sync_cmd(Command::write(1, 0, (blocks - 1) as u16, pattern.clone()))
        .unwrap();
    ctrl.release_command(done).unwrap();

    let done = ctrl
        .sync_cmd(Command::read(1, 0, (blocks - 1) as u16, bytes))
        .unwrap();
    assert_eq!(done.data_in().unwrap(), pattern.as_slice());
    ctrl.release_command(done).unwrap();
}
