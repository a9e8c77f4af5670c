use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::unbounded;
use log::{error, info, warn};

use panelmq::{
    AppConfig, BrokerLink, EVENTS_EXCHANGE, EventPipeline, EventPublisher, ExtenderController,
    FaultIndicator, KeepaliveSender, LineManager, Spool,
};

#[cfg(feature = "hardware")]
use panelmq::{LibgpiodBackend, LinuxBusFactory};
#[cfg(not(feature = "hardware"))]
use panelmq::{MockBusFactory, MockGpioBackend};

fn main() {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PANELMQ_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

    info!(
        "panel bridge starting for board {} ({})",
        config.board.id, config.board.name
    );

    let backend = {
        #[cfg(feature = "hardware")]
        {
            Arc::new(
                LibgpiodBackend::new(&config.gpio_chip)
                    .unwrap_or_else(|e| panic!("Failed to init libgpiod backend: {e}")),
            )
        }
        #[cfg(not(feature = "hardware"))]
        {
            Arc::new(MockGpioBackend::default())
        }
    };
    let gpio = Arc::new(LineManager::new(backend));

    let bus_factory = {
        #[cfg(feature = "hardware")]
        {
            LinuxBusFactory::new(&config.i2c_device)
        }
        #[cfg(not(feature = "hardware"))]
        {
            MockBusFactory::default()
        }
    };

    let fault = Arc::new(FaultIndicator::default());
    let spool = Arc::new(
        Spool::open(&config.spool_dir).unwrap_or_else(|e| panic!("Failed to open spool: {e}")),
    );
    let publisher = EventPublisher::start(
        spool,
        BrokerLink::new(&config.broker, EVENTS_EXCHANGE),
        fault.clone(),
    );

    let controller = Arc::new(ExtenderController::new(gpio.clone(), config.debounce_ms));
    let (tx, rx) = unbounded();

    for chip in &config.board.chips {
        if let Err(e) = controller.register_chip(chip, &bus_factory, tx.clone()) {
            // A missing chip means the board is miswired or incomplete;
            // starting without it would silently drop its selectors.
            fault.raise("chip registration failure");
            publisher.shutdown();
            gpio.release_all();
            panic!("Failed to register chip {} ({}): {e}", chip.id, chip.name);
        }
    }

    let monitor = controller.start_monitor(
        Duration::from_millis(config.scan_interval_ms),
        tx.clone(),
    );
    drop(tx);

    let pipeline = EventPipeline::new(config.board.id, controller, publisher.clone());
    let pipeline_thread = pipeline.run(rx);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            shutdown.store(true, Ordering::Relaxed);
        })
        .unwrap_or_else(|e| panic!("Failed to install signal handler: {e}"));
    }

    let mut keepalive = KeepaliveSender::new(&config.broker);
    let interval = Duration::from_secs(config.keepalive_interval_secs);
    info!("entering keepalive loop, interval {interval:?}");
    while !shutdown.load(Ordering::Relaxed) {
        match keepalive.publish_keepalive(config.board.id) {
            Ok(()) => fault.clear(),
            Err(e) => {
                warn!("keepalive publish failed: {e}");
                fault.raise("keepalive publish failure");
            }
        }
        sleep_for(interval, &shutdown);
    }

    // Shutdown order: publisher first (flushes nothing, just stops the
    // drain), then the monitor, then the watchers and lines. The pipeline
    // thread ends once every transition sender is gone.
    info!("shutting down");
    publisher.shutdown();
    monitor.stop();
    gpio.release_all();
    if pipeline_thread.join().is_err() {
        error!("pipeline thread panicked during shutdown");
    }
    info!("shutdown complete");
}

fn sleep_for(duration: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut remaining = duration;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
}
