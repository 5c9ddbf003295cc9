//! Minimal runnable demonstration of the packet loop: binds a single
//! `AF_INET` socket on a positional port and drives it with a `quiche`
//! server connection until interrupted.
//!
//! Deliberately has no flag-parsing library: one positional port argument,
//! defaulting to an ephemeral port. Not a reimplementation of any sample
//! file-transfer protocol.

use quicloop::engine::{LoopCallback, LoopEvent};
use quicloop::quiche_engine::QuicheEngine;
use quicloop::{run_loop, Family, LoopConfig};

struct LoggingCallback;

impl LoopCallback for LoggingCallback {
    fn on_event(&mut self, event: LoopEvent, now_us: u64) -> i32 {
        log::info!("loop event {:?} at {} us", event, now_us);
        0
    }
}

fn main() {
    quicloop::logging::init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let mut quiche_config = quiche::Config::new(quiche::PROTOCOL_VERSION).expect("quiche config");
    quiche_config
        .set_application_protos(&[b"hq-interop"])
        .expect("set alpn");

    let mut engine = QuicheEngine::new(quiche_config, true);
    let mut callback = LoggingCallback;
    let config = LoopConfig::new(port, Family::V4);

    match run_loop(&mut engine, config, &mut callback) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("packet loop failed: {}", e);
            std::process::exit(1);
        }
    }
}
