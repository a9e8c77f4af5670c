use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Utc;
use crossbeam_channel::Receiver;
use log::{info, warn};

use crate::event::HardwareEvent;
use crate::extender::{BitTransition, ExtenderController};
use crate::gpio::GpioBackend;
use crate::publisher::EventPublisher;

/// Orchestrator between the decode paths and the durable publisher. Pure
/// construction: resolves a transition against the chip arena, stamps the
/// capture time, hands the event off. Performs no I/O of its own; publish
/// failures are the publisher's problem and never surface here.
pub struct EventPipeline<B: GpioBackend> {
    board_id: i64,
    controller: Arc<ExtenderController<B>>,
    publisher: Arc<EventPublisher>,
}

impl<B: GpioBackend> EventPipeline<B> {
    pub fn new(
        board_id: i64,
        controller: Arc<ExtenderController<B>>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            board_id,
            controller,
            publisher,
        }
    }

    /// Builds the event for one decoded transition and enqueues it.
    /// Returns the constructed event, or None for transitions that no
    /// longer resolve to an input bit (a bit cannot change role after
    /// registration, so this is a programming error worth a warning).
    pub fn on_transition(&self, transition: BitTransition) -> Option<HardwareEvent> {
        let chip = match self.controller.chip(transition.chip) {
            Ok(chip) => chip,
            Err(e) => {
                warn!("transition for unknown chip dropped: {e}");
                return None;
            }
        };
        let Some(bit) = chip.bit(transition.bit_index) else {
            warn!(
                "transition for unmapped bit {} on chip {} dropped",
                transition.bit_index, chip.name
            );
            return None;
        };
        let selector = bit.input_selector()?;

        let event = HardwareEvent {
            hardware_board_id: self.board_id,
            extender_bus_id: chip.id,
            extender_bus_name: chip.name.clone(),
            extender_bit_id: bit.id,
            extender_bit_name: bit.name.clone(),
            bit_index: bit.index,
            input_selector_id: selector.id,
            input_selector_name: selector.name.clone(),
            pressed: transition.pressed,
            timestamp: Utc::now(),
        };
        info!(
            "input selector {} ({}) {}",
            event.input_selector_name,
            event.input_selector_id,
            if event.pressed { "pressed" } else { "released" }
        );
        self.publisher.enqueue(&event);
        Some(event)
    }

    /// Consumes the shared transition channel until every sender (edge
    /// watchers and the fallback monitor) is gone.
    pub fn run(self, rx: Receiver<BitTransition>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            for transition in rx {
                self.on_transition(transition);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::unbounded;
    use tempfile::TempDir;

    use super::*;
    use crate::backend::MockGpioBackend;
    use crate::config::{BitConfig, ChipConfig, SelectorConfig};
    use crate::gpio::LineManager;
    use crate::i2c::MockBusFactory;
    use crate::publisher::RetryPolicy;
    use crate::publisher::test_sink::MemorySink;
    use crate::spool::Spool;
    use crate::status::FaultIndicator;

    fn chip_config() -> ChipConfig {
        ChipConfig {
            id: 7,
            name: "Bus0".into(),
            address: 0x20,
            interrupt_line: 16,
            bits: vec![BitConfig {
                id: 100,
                name: "Bus0_Bit3".into(),
                input_selector: Some(SelectorConfig {
                    id: 42,
                    name: "PANEL_PUSH".into(),
                }),
                output_selector: None,
            }],
        }
    }

    #[test]
    fn transition_becomes_a_spooled_event() {
        let dir = TempDir::new().unwrap();
        let spool = Arc::new(Spool::open(dir.path()).unwrap());
        let fault = Arc::new(FaultIndicator::default());
        let (sink, state) = MemorySink::new();
        let publisher = EventPublisher::start_with_policy(
            spool,
            sink,
            fault,
            RetryPolicy {
                base: Duration::from_millis(5),
                cap: Duration::from_millis(20),
                attempts: 3,
            },
        );

        let backend = Arc::new(MockGpioBackend::default());
        let controller = Arc::new(ExtenderController::new(
            Arc::new(LineManager::new(backend)),
            10,
        ));
        let factory = MockBusFactory::default();
        let (tx, _rx) = unbounded();
        let chip_id = controller
            .register_chip(&chip_config(), &factory, tx)
            .unwrap();

        let pipeline = EventPipeline::new(1, controller, publisher.clone());
        let event = pipeline
            .on_transition(BitTransition {
                chip: chip_id,
                bit_index: 3,
                pressed: true,
            })
            .expect("transition resolves to an event");

        assert_eq!(event.hardware_board_id, 1);
        assert_eq!(event.extender_bus_name, "Bus0");
        assert_eq!(event.bit_index, 3);
        assert_eq!(event.input_selector_id, 42);
        assert!(event.pressed);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline && state.lock().published.is_empty() {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(state.lock().published.len(), 1);

        publisher.shutdown();
    }

    #[test]
    fn unmapped_transition_is_dropped() {
        let dir = TempDir::new().unwrap();
        let spool = Arc::new(Spool::open(dir.path()).unwrap());
        let fault = Arc::new(FaultIndicator::default());
        let (sink, _state) = MemorySink::new();
        let publisher = EventPublisher::start(spool, sink, fault);

        let backend = Arc::new(MockGpioBackend::default());
        let controller = Arc::new(ExtenderController::new(
            Arc::new(LineManager::new(backend)),
            10,
        ));
        let factory = MockBusFactory::default();
        let (tx, _rx) = unbounded();
        let chip_id = controller
            .register_chip(&chip_config(), &factory, tx)
            .unwrap();

        let pipeline = EventPipeline::new(1, controller, publisher.clone());
        assert!(
            pipeline
                .on_transition(BitTransition {
                    chip: chip_id,
                    bit_index: 9,
                    pressed: true,
                })
                .is_none()
        );

        publisher.shutdown();
    }
}
