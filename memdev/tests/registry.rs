//! Registry naming, the control-plane privilege gate and teardown.

use std::sync::Arc;

use memdev::{Config, ControlRequest, Credentials, DeviceError, Registry};

fn registry_with(devices: usize) -> Registry {
    let config = Config {
        devices,
        capacity_ceiling: 64,
        ..Config::default()
    };
    Registry::new(&config)
}

#[test]
fn test_open_resolves_exact_names_only() {
    let registry = registry_with(2);
    assert_eq!(registry.device_count(), 2);
    assert_eq!(registry.capacity_ceiling(), 64);

    assert!(registry.open("memdev0", Credentials::user()).is_ok());
    assert!(registry.open("memdev1", Credentials::user()).is_ok());

    for bad in ["memdev2", "memdev", "other0", "memdev1x", "MEMDEV0"] {
        assert_eq!(
            registry.open(bad, Credentials::user()).unwrap_err(),
            DeviceError::NotFound,
            "expected NotFound for [{bad}]"
        );
    }
}

#[test]
fn test_names_follow_prefix() {
    let config = Config {
        devices: 3,
        prefix: "blk".to_string(),
        ..Config::default()
    };
    let registry = Registry::new(&config);
    let names: Vec<&str> = registry.names().collect();
    assert_eq!(names, ["blk0", "blk1", "blk2"]);
    assert!(registry.open("blk2", Credentials::user()).is_ok());
    assert_eq!(
        registry.open("memdev0", Credentials::user()).unwrap_err(),
        DeviceError::NotFound
    );
}

#[test]
fn test_open_leaves_stream_untouched() {
    let registry = registry_with(1);
    let mut h = registry.open("memdev0", Credentials::user()).unwrap();
    h.write(b"data").unwrap();

    let h2 = registry.open("memdev0", Credentials::user()).unwrap();
    assert_eq!(h2.cursor(), 0);
    assert_eq!(h2.stream().len(), 4);
}

#[test]
fn test_unprivileged_print_is_allowed() {
    let registry = registry_with(1);
    let h = registry.open("memdev0", Credentials::user()).unwrap();
    let req = ControlRequest::parse("print", b"hello from a plain user\0").unwrap();
    h.control(&req).unwrap();
}

#[test]
fn test_unprivileged_crash_requests_are_denied() {
    let registry = registry_with(1);
    let h = registry.open("memdev0", Credentials::user()).unwrap();

    let panic_req = ControlRequest::parse("panic", b"nope\0").unwrap();
    assert_eq!(
        h.control(&panic_req).unwrap_err(),
        DeviceError::PermissionDenied
    );
    let oops_req = ControlRequest::parse("oops", b"").unwrap();
    assert_eq!(
        h.control(&oops_req).unwrap_err(),
        DeviceError::PermissionDenied
    );

    // Still here: the deny path never reached the fault injection.
    let mut h = h;
    assert_eq!(h.write(b"alive").unwrap(), 5);
}

#[test]
fn test_admin_oops_kills_the_process() {
    // The drill below aborts the process, so it runs in a child: re-run
    // this binary filtered to the drill with the gate variable set.
    let exe = std::env::current_exe().unwrap();
    let status = std::process::Command::new(exe)
        .args(["admin_oops_drill", "--exact"])
        .env("MEMDEV_OOPS_DRILL", "1")
        .status()
        .unwrap();

    // The process must die of the abort itself; a caught unwind would
    // surface as an ordinary failed-test exit instead.
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(
            status.signal(),
            Some(libc::SIGABRT),
            "drill outcome: {status:?}"
        );
    }
    #[cfg(not(unix))]
    assert!(!status.success(), "drill outcome: {status:?}");
}

/// Only acts when [`test_admin_oops_kills_the_process`] re-runs the binary
/// with the gate set; in a normal run it is a no-op.
#[test]
fn admin_oops_drill() {
    if std::env::var("MEMDEV_OOPS_DRILL").is_err() {
        return;
    }
    let registry = registry_with(1);
    let h = registry.open("memdev0", Credentials::admin()).unwrap();
    let req = ControlRequest::parse("oops", b"").unwrap();
    let _ = h.control(&req);
    unreachable!("oops returned control to the caller");
}

#[test]
fn test_teardown_releases_every_stream_once() {
    let registry = registry_with(2);
    let weak0 = Arc::downgrade(registry.stream(0).unwrap());
    let weak1 = Arc::downgrade(registry.stream(1).unwrap());

    drop(registry);

    assert!(weak0.upgrade().is_none());
    assert!(weak1.upgrade().is_none());
}

#[test]
fn test_handles_keep_their_stream_alive_until_dropped() {
    let registry = registry_with(1);
    let h = registry.open("memdev0", Credentials::user()).unwrap();
    let weak = Arc::downgrade(h.stream());

    drop(registry);
    assert!(weak.upgrade().is_some());

    drop(h);
    assert!(weak.upgrade().is_none());
}
