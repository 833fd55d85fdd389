//! Driver lifecycle over real POSIX shared memory.
//!
//! Skipped where the sandbox denies `shm_open`.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=courier=debug cargo test --features tracing --test driver_launch -- --nocapture
//! ```

use std::sync::Arc;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;

use courier::control::{DriverConnection, DriverListener};
use courier::driver::{Driver, DriverConfig, DriverError, IdleStrategyKind, TokenTermination};
use courier::ipc::shmem::ShmPath;
use courier::runtime::{EpochClock, SystemEpochClock};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        courier::init_tracing();
    });
}

fn config(suffix: &str) -> DriverConfig {
    DriverConfig {
        cnc_path: ShmPath::new(format!("/courier-launch-{}-{suffix}", std::process::id())).unwrap(),
        to_driver_buffer_capacity: 64 * 1024,
        to_clients_buffer_capacity: 64 * 1024,
        idle_strategy: IdleStrategyKind::Sleeping(Duration::from_millis(1)),
        termination_validator: Arc::new(TokenTermination(b"shutdown".to_vec())),
        ..DriverConfig::default()
    }
}

/// Launches a driver, or returns `None` when shared memory is unavailable.
fn launch(config: DriverConfig) -> Option<Driver> {
    match Driver::launch(config) {
        Ok(driver) => Some(driver),
        Err(DriverError::Shm(err)) if err.is_access_denied() => {
            eprintln!("Skipping: {err}");
            None
        }
        Err(err) => panic!("driver launch failed: {err}"),
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[derive(Default)]
struct Subscriptions {
    ready: Vec<i64>,
}

impl DriverListener for Subscriptions {
    fn on_subscription_ready(&mut self, correlation_id: i64, _channel_status_id: i32) {
        self.ready.push(correlation_id);
    }
}

#[test]
#[serial]
fn client_round_trip_through_shared_memory() {
    init_test_tracing();
    let Some(driver) = launch(config("round-trip")) else {
        return;
    };

    let connection = DriverConnection::connect(driver.cnc_path(), Duration::from_secs(1)).unwrap();
    assert!(connection.is_driver_active(SystemEpochClock.time_millis()));

    let mut adapter = connection.listener_adapter(Subscriptions::default());
    let correlation_id = connection
        .proxy()
        .add_subscription("aeron:ipc", 10)
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        adapter.receive_messages().unwrap();
        !adapter.listener().ready.is_empty()
    }));
    assert_eq!(adapter.listener().ready, vec![correlation_id]);

    driver.shutdown();
}

#[test]
#[serial]
fn second_driver_on_live_cnc_is_rejected() {
    init_test_tracing();
    let Some(driver) = launch(config("twice")) else {
        return;
    };

    let second = Driver::launch(config("twice"));
    assert!(matches!(second, Err(DriverError::AlreadyActive { .. })));
    assert!(driver.is_running());

    driver.shutdown();
}

#[test]
#[serial]
fn terminate_request_stops_conductor() {
    init_test_tracing();
    let Some(driver) = launch(config("terminate")) else {
        return;
    };

    let connection = DriverConnection::connect(driver.cnc_path(), Duration::from_secs(1)).unwrap();
    connection.proxy().terminate_driver(b"wrong").unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(driver.is_running());

    connection.proxy().terminate_driver(b"shutdown").unwrap();
    assert!(wait_until(Duration::from_secs(2), || !driver.is_running()));
    assert!(driver.is_terminated());

    driver.shutdown();
}
