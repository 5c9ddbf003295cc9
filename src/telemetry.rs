//! Telemetry metrics for the packet loop.
//!
//! Currently exported metrics:
//! - `packets_received_total`: Datagrams handed to an engine's `incoming_packet`.
//! - `packets_sent_total`: Datagrams successfully transmitted by the drain loop.
//! - `send_errors_total`: Failed `sendto` calls, unreachable or not.
//! - `destination_unreachable_total`: Send failures classified as unreachable.
//! - `migrations_total`: Successful `shallow_migrate` handoffs.
//! - `hot_spin_events_total`: Hot-spin diagnostics emitted (100 idle iterations).
//! - `ownership_table_size`: Current number of peer keys routed to the backup.
//! - `memory_usage_bytes`: Resident memory usage of the process.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder};
use sysinfo::{PidExt, SystemExt};

lazy_static! {
    pub static ref PACKETS_RECEIVED_TOTAL: IntCounter =
        register_int_counter!("packets_received_total", "Datagrams submitted to an engine").unwrap();
    pub static ref PACKETS_SENT_TOTAL: IntCounter =
        register_int_counter!("packets_sent_total", "Datagrams transmitted").unwrap();
    pub static ref SEND_ERRORS_TOTAL: IntCounter =
        register_int_counter!("send_errors_total", "Failed send attempts").unwrap();
    pub static ref DESTINATION_UNREACHABLE_TOTAL: IntCounter = register_int_counter!(
        "destination_unreachable_total",
        "Send failures classified as destination-unreachable"
    )
    .unwrap();
    pub static ref MIGRATIONS_TOTAL: IntCounter =
        register_int_counter!("migrations_total", "Successful shallow_migrate handoffs").unwrap();
    pub static ref HOT_SPIN_EVENTS_TOTAL: IntCounter = register_int_counter!(
        "hot_spin_events_total",
        "Hot-spin diagnostics emitted (100 idle iterations)"
    )
    .unwrap();
    pub static ref OWNERSHIP_TABLE_SIZE: IntGauge =
        register_int_gauge!("ownership_table_size", "Peer keys routed to the backup engine").unwrap();
    pub static ref MEMORY_USAGE_BYTES: IntGauge =
        register_int_gauge!("memory_usage_bytes", "Resident memory usage of the process").unwrap();
}

pub fn update_memory_usage() {
    let mut sys = sysinfo::System::new();
    sys.refresh_process(sysinfo::get_current_pid().unwrap());
    if let Some(proc) = sys.process(sysinfo::get_current_pid().unwrap()) {
        MEMORY_USAGE_BYTES.set(proc.memory() as i64 * 1024);
    }
}

pub fn serve(addr: &str) {
    use std::io::Write;
    use std::net::TcpListener;
    let listener = TcpListener::bind(addr).expect("bind metrics");
    std::thread::spawn(move || {
        let encoder = TextEncoder::new();
        for stream in listener.incoming() {
            if let Ok(mut s) = stream {
                let metrics = prometheus::gather();
                let mut buf = Vec::new();
                encoder.encode(&metrics, &mut buf).unwrap();
                let _ = s.write_all(&buf);
            }
        }
    });
}

pub fn flush() {
    let encoder = TextEncoder::new();
    let metrics = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&metrics, &mut buf).is_ok() {
        log::info!("\n{}", String::from_utf8_lossy(&buf));
    }
}
