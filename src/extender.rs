use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::{ChipConfig, SelectorConfig};
use crate::error::AppError;
use crate::gpio::{Bias, GpioBackend, LineManager};
use crate::i2c::BusFactory;
use crate::mcp23017::Mcp23017;

/// Stable arena index of a registered chip. Edge handlers and the fallback
/// monitor refer to chips by id, never by reference.
pub type ChipId = usize;

/// One decoded bit-level transition. `pressed` is true on a transition to
/// low: inputs are wired with pull-ups, so asserted means pulled to ground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTransition {
    pub chip: ChipId,
    pub bit_index: u8,
    pub pressed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BitRole {
    Input(SelectorConfig),
    /// Unmapped bits are normalized to outputs: left floating they sit at an
    /// undefined level and storm the interrupt line.
    Output(Option<SelectorConfig>),
}

pub struct ExtenderBit {
    pub id: i64,
    pub name: String,
    pub index: u8,
    pub role: BitRole,
    last_level: AtomicU8,
}

impl ExtenderBit {
    pub fn is_input(&self) -> bool {
        matches!(self.role, BitRole::Input(_))
    }

    pub fn input_selector(&self) -> Option<&SelectorConfig> {
        match &self.role {
            BitRole::Input(sel) => Some(sel),
            BitRole::Output(_) => None,
        }
    }

    /// Atomically replaces the last-observed level, returning true when it
    /// changed. The swap is the single commit point shared by the interrupt
    /// decoder and the fallback scan, so only one of them can claim a given
    /// physical edge.
    fn observe(&self, level: u8) -> bool {
        self.last_level.swap(level, Ordering::AcqRel) != level
    }
}

pub struct ExtenderChip {
    pub id: i64,
    pub name: String,
    pub address: u16,
    pub interrupt_line: u32,
    pub interrupt_mask: u16,
    dev: Mutex<Mcp23017>,
    bits: Vec<ExtenderBit>,
    by_index: [Option<usize>; 16],
}

impl ExtenderChip {
    pub fn bit(&self, index: u8) -> Option<&ExtenderBit> {
        self.by_index
            .get(usize::from(index))
            .copied()
            .flatten()
            .map(|slot| &self.bits[slot])
    }

    pub fn bits(&self) -> impl Iterator<Item = &ExtenderBit> {
        self.bits.iter()
    }
}

/// Owns the chip arena. Registration runs once at startup; afterwards the
/// arena is read-mostly, the only mutable state being each bit's
/// last-observed level slot.
pub struct ExtenderController<B: GpioBackend> {
    gpio: Arc<LineManager<B>>,
    debounce_ms: u64,
    chips: RwLock<Vec<Arc<ExtenderChip>>>,
}

impl<B: GpioBackend> ExtenderController<B> {
    pub fn new(gpio: Arc<LineManager<B>>, debounce_ms: u64) -> Self {
        Self {
            gpio,
            debounce_ms,
            chips: RwLock::new(Vec::new()),
        }
    }

    pub fn chip(&self, id: ChipId) -> Result<Arc<ExtenderChip>, AppError> {
        self.chips
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::Gpio(format!("unknown chip id {id}")))
    }

    pub fn chip_count(&self) -> usize {
        self.chips.read().len()
    }

    /// Registers one expander chip. The sequence is strictly ordered: open
    /// the device, write the core registers, classify bits, configure
    /// pull-ups and clear stale flags, write the interrupt-enable union,
    /// then attach the edge watcher and drain any already-pending interrupt.
    pub fn register_chip(
        self: &Arc<Self>,
        cfg: &ChipConfig,
        factory: &dyn BusFactory,
        tx: Sender<BitTransition>,
    ) -> Result<ChipId, AppError> {
        info!(
            "Registering extender chip id {} ({}) at address {:#04x}",
            cfg.id, cfg.name, cfg.address
        );

        let mut dev = Mcp23017::new(factory.open(cfg.address)?);
        dev.configure().map_err(|e| {
            AppError::Registration(format!("chip {} core register write: {e}", cfg.name))
        })?;

        let (bits, by_index) = classify_bits(cfg);

        let input_mask: u16 = bits
            .iter()
            .filter(|b| b.is_input())
            .map(|b| 1u16 << b.index)
            .fold(0, |acc, m| acc | m);

        dev.set_directions(input_mask).map_err(|e| {
            AppError::Registration(format!("chip {} direction setup: {e}", cfg.name))
        })?;
        dev.clear_interrupts().map_err(|e| {
            AppError::Registration(format!("chip {} stale flag clear: {e}", cfg.name))
        })?;
        dev.set_interrupt_enable(input_mask).map_err(|e| {
            AppError::Registration(format!("chip {} interrupt enable: {e}", cfg.name))
        })?;
        if input_mask == 0 {
            warn!(
                "chip {} has no input bits: its interrupt line will never fire",
                cfg.name
            );
        }

        // Seed last-observed levels from a live read so neither decode path
        // emits phantom transitions for the startup state.
        let levels = dev
            .levels()
            .map_err(|e| AppError::Registration(format!("chip {} level read: {e}", cfg.name)))?;
        for bit in bits.iter().filter(|b| b.is_input()) {
            bit.last_level
                .store(((levels >> bit.index) & 1) as u8, Ordering::Relaxed);
        }

        let chip = Arc::new(ExtenderChip {
            id: cfg.id,
            name: cfg.name.clone(),
            address: cfg.address,
            interrupt_line: cfg.interrupt_line,
            interrupt_mask: input_mask,
            dev: Mutex::new(dev),
            bits,
            by_index,
        });

        let chip_id = {
            let mut chips = self.chips.write();
            chips.push(chip.clone());
            chips.len() - 1
        };

        self.gpio.claim_input(cfg.interrupt_line, Bias::PullUp)?;
        let controller = Arc::clone(self);
        let decode_tx = tx.clone();
        self.gpio
            .watch_falling_edge(cfg.interrupt_line, self.debounce_ms, move |_| {
                for transition in controller.decode_interrupt(chip_id)? {
                    let _ = decode_tx.send(transition);
                }
                Ok(())
            })?;

        // A line already asserted here means an interrupt latched before the
        // watcher existed; drain it or it will never be released.
        if self.gpio.read(cfg.interrupt_line)? == 0 {
            for transition in self.decode_interrupt(chip_id)? {
                let _ = tx.send(transition);
            }
        }

        Ok(chip_id)
    }

    /// Reads the chip's interrupt flags and emits one transition per flagged
    /// `Input` bit whose level actually changed. Flags are cleared before
    /// returning, on success and on error alike, so the interrupt line is
    /// always released.
    pub fn decode_interrupt(&self, chip_id: ChipId) -> Result<Vec<BitTransition>, AppError> {
        let chip = self.chip(chip_id)?;
        let mut dev = chip.dev.lock();

        let decoded = decode_flags(&chip, &mut dev, chip_id);
        let cleared = dev.clear_interrupts();

        let transitions = decoded?;
        cleared?;
        Ok(transitions)
    }

    /// Fallback path for interrupts the chip coalesced: compares every
    /// `Input` bit's live level against its last-observed level. The chip
    /// lock is held across the whole read-and-swap pass, same as the
    /// interrupt decoder, so neither path can swap in a level snapshot the
    /// other has already superseded.
    pub fn scan_chip(&self, chip_id: ChipId) -> Result<Vec<BitTransition>, AppError> {
        let chip = self.chip(chip_id)?;
        let mut dev = chip.dev.lock();
        let levels = dev.levels()?;

        let mut out = Vec::new();
        for bit in chip.bits.iter().filter(|b| b.is_input()) {
            let level = ((levels >> bit.index) & 1) as u8;
            if bit.observe(level) {
                out.push(BitTransition {
                    chip: chip_id,
                    bit_index: bit.index,
                    pressed: level == 0,
                });
            }
        }
        Ok(out)
    }

    pub fn scan_all(&self, tx: &Sender<BitTransition>) {
        let count = self.chip_count();
        for chip_id in 0..count {
            match self.scan_chip(chip_id) {
                Ok(transitions) => {
                    for transition in transitions {
                        let _ = tx.send(transition);
                    }
                }
                Err(e) => warn!("fallback scan of chip {chip_id}: {e}"),
            }
        }
    }

    /// Spawns the fallback monitor thread scanning all chips at `interval`.
    pub fn start_monitor(
        self: &Arc<Self>,
        interval: Duration,
        tx: Sender<BitTransition>,
    ) -> MonitorHandle {
        let controller = Arc::clone(self);
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();

        let handle = std::thread::spawn(move || {
            // Sleep in short slices so stop() joins promptly even with a
            // long scan interval.
            let step = Duration::from_millis(20);
            'monitor: loop {
                let mut remaining = interval;
                while !remaining.is_zero() {
                    if cancel_flag.load(Ordering::Relaxed) {
                        break 'monitor;
                    }
                    let chunk = remaining.min(step);
                    std::thread::sleep(chunk);
                    remaining -= chunk;
                }
                controller.scan_all(&tx);
            }
        });

        MonitorHandle {
            cancel,
            handle: Some(handle),
        }
    }
}

fn decode_flags(
    chip: &ExtenderChip,
    dev: &mut Mcp23017,
    chip_id: ChipId,
) -> Result<Vec<BitTransition>, AppError> {
    let flags = dev.interrupt_flags()?;
    if flags == 0 {
        return Ok(Vec::new());
    }
    let levels = dev.levels()?;

    let mut out = Vec::new();
    for index in 0..16u8 {
        if flags & (1 << index) == 0 {
            continue;
        }
        // A flag on a bit with no descriptor or a non-input role is
        // observed and cleared but emits nothing.
        let Some(bit) = chip.bit(index) else { continue };
        if !bit.is_input() {
            continue;
        }
        let level = ((levels >> index) & 1) as u8;
        if bit.observe(level) {
            out.push(BitTransition {
                chip: chip_id,
                bit_index: index,
                pressed: level == 0,
            });
        }
    }
    Ok(out)
}

/// Classifies every configured bit into its role. Malformed names and
/// duplicate indices are per-bit faults: logged and skipped, registration
/// continues with the remaining bits.
fn classify_bits(cfg: &ChipConfig) -> (Vec<ExtenderBit>, [Option<usize>; 16]) {
    let mut bits = Vec::with_capacity(cfg.bits.len());
    let mut by_index: [Option<usize>; 16] = [None; 16];

    for bit_cfg in &cfg.bits {
        let index = match parse_bit_index(&bit_cfg.name) {
            Ok(i) => i,
            Err(e) => {
                warn!("chip {}: skipping bit '{}': {e}", cfg.name, bit_cfg.name);
                continue;
            }
        };
        if by_index[usize::from(index)].is_some() {
            warn!(
                "chip {}: skipping bit '{}': index {index} already mapped",
                cfg.name, bit_cfg.name
            );
            continue;
        }

        let role = match (&bit_cfg.input_selector, &bit_cfg.output_selector) {
            (Some(input), Some(output)) => {
                warn!(
                    "chip {}: bit '{}' claims both selector roles ({} / {}); treating as input",
                    cfg.name, bit_cfg.name, input.name, output.name
                );
                BitRole::Input(input.clone())
            }
            (Some(input), None) => BitRole::Input(input.clone()),
            (None, output) => BitRole::Output(output.clone()),
        };

        by_index[usize::from(index)] = Some(bits.len());
        bits.push(ExtenderBit {
            id: bit_cfg.id,
            name: bit_cfg.name.clone(),
            index,
            role,
            // Pull-up idle; inputs are re-seeded from a live read during
            // registration.
            last_level: AtomicU8::new(1),
        });
    }

    (bits, by_index)
}

/// Bit position from the trailing decimal digits of a bit name
/// (e.g. "Bus0_Bit12" -> 12), validated against the 16-bit range.
fn parse_bit_index(name: &str) -> Result<u8, AppError> {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return Err(AppError::Parse(format!(
            "bit name '{name}' carries no index"
        )));
    }
    let index: u8 = digits
        .parse()
        .map_err(|_| AppError::Parse(format!("bit name '{name}' index out of range")))?;
    if index > 15 {
        return Err(AppError::Parse(format!(
            "bit name '{name}' index {index} outside 0-15"
        )));
    }
    Ok(index)
}

pub struct MonitorHandle {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use super::*;
    use crate::backend::MockGpioBackend;
    use crate::config::BitConfig;
    use crate::i2c::MockBusFactory;

    fn selector(id: i64, name: &str) -> Option<SelectorConfig> {
        Some(SelectorConfig {
            id,
            name: name.to_string(),
        })
    }

    fn bit(id: i64, name: &str, input: Option<SelectorConfig>, output: Option<SelectorConfig>) -> BitConfig {
        BitConfig {
            id,
            name: name.to_string(),
            input_selector: input,
            output_selector: output,
        }
    }

    fn controller() -> Arc<ExtenderController<MockGpioBackend>> {
        let backend = Arc::new(MockGpioBackend::default());
        Arc::new(ExtenderController::new(
            Arc::new(LineManager::new(backend)),
            10,
        ))
    }

    fn bus0_config() -> ChipConfig {
        ChipConfig {
            id: 7,
            name: "Bus0".into(),
            address: 0x20,
            interrupt_line: 16,
            bits: vec![
                bit(100, "Bus0_Bit3", selector(42, "PANEL_PUSH"), None),
                bit(101, "Bus0_Bit5", None, selector(9, "PANEL_LED")),
                bit(102, "Bus0_Bit6", None, None),
            ],
        }
    }

    #[test]
    fn classification_is_deterministic() {
        let cfg = ChipConfig {
            id: 1,
            name: "Bus1".into(),
            address: 0x21,
            interrupt_line: 17,
            bits: vec![
                bit(1, "Bit0", selector(10, "IN"), None),
                bit(2, "Bit1", None, selector(11, "OUT")),
                bit(3, "Bit2", None, None),
                bit(4, "Bit3", selector(12, "IN2"), selector(13, "OUT2")),
                bit(5, "NoIndexHere", None, None),
                bit(6, "Bit99", None, None),
            ],
        };
        let (bits, by_index) = classify_bits(&cfg);

        // Malformed and out-of-range names are skipped.
        assert_eq!(bits.len(), 4);
        assert!(matches!(bits[0].role, BitRole::Input(_)));
        assert!(matches!(bits[1].role, BitRole::Output(Some(_))));
        assert!(matches!(bits[2].role, BitRole::Output(None)));
        // Conflicting roles resolve to input.
        assert_eq!(
            bits[3].role,
            BitRole::Input(SelectorConfig {
                id: 12,
                name: "IN2".into()
            })
        );
        assert!(by_index[3].is_some());
        assert!(by_index[4].is_none());
    }

    #[test]
    fn press_and_release_decode_on_bus0_bit3() {
        let controller = controller();
        let factory = MockBusFactory::default();
        let (tx, _rx) = unbounded();
        let chip_id = controller
            .register_chip(&bus0_config(), &factory, tx)
            .unwrap();

        let state = factory.state(0x20);
        // Registration configured the chip.
        {
            let s = state.lock();
            assert_eq!(s.intcon, 0x0000);
            assert_eq!(s.defval, 0xFFFF);
            assert_eq!(s.gpinten, 1 << 3);
            assert_eq!(s.iodir, 1 << 3);
        }

        state.lock().drive_input(3, 0);
        let transitions = controller.decode_interrupt(chip_id).unwrap();
        assert_eq!(
            transitions,
            vec![BitTransition {
                chip: chip_id,
                bit_index: 3,
                pressed: true
            }]
        );
        // Decode cleared the flags.
        assert_eq!(state.lock().intf, 0);

        state.lock().drive_input(3, 1);
        let transitions = controller.decode_interrupt(chip_id).unwrap();
        assert_eq!(
            transitions,
            vec![BitTransition {
                chip: chip_id,
                bit_index: 3,
                pressed: false
            }]
        );
    }

    #[test]
    fn decode_and_scan_never_double_count_one_edge() {
        let controller = controller();
        let factory = MockBusFactory::default();
        let (tx, _rx) = unbounded();
        let chip_id = controller
            .register_chip(&bus0_config(), &factory, tx)
            .unwrap();

        factory.state(0x20).lock().drive_input(3, 0);

        let decoded = controller.decode_interrupt(chip_id).unwrap();
        assert_eq!(decoded.len(), 1);
        // The scan sees the same edge but the level slot is already taken.
        let scanned = controller.scan_chip(chip_id).unwrap();
        assert!(scanned.is_empty());
    }

    #[test]
    fn scan_racing_decode_emits_each_edge_exactly_once() {
        let controller = controller();
        let factory = MockBusFactory::default();
        let (tx, rx) = unbounded();
        let chip_id = controller
            .register_chip(&bus0_config(), &factory, tx.clone())
            .unwrap();
        let state = factory.state(0x20);

        // A scanner hammering the chip while the decoder processes real
        // edges. Were the scan's level snapshot taken outside the chip
        // lock, a stale snapshot swapped in after a decode would emit a
        // phantom reverse transition and desync the level slot.
        let stop = Arc::new(AtomicBool::new(false));
        let scanner = {
            let controller = controller.clone();
            let tx = tx.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    controller.scan_all(&tx);
                }
            })
        };

        let rounds = 500;
        for _ in 0..rounds {
            state.lock().drive_input(3, 0);
            for t in controller.decode_interrupt(chip_id).unwrap() {
                tx.send(t).unwrap();
            }
            state.lock().drive_input(3, 1);
            for t in controller.decode_interrupt(chip_id).unwrap() {
                tx.send(t).unwrap();
            }
        }

        stop.store(true, Ordering::Relaxed);
        scanner.join().unwrap();
        drop(tx);

        let transitions: Vec<BitTransition> = rx.try_iter().collect();
        assert_eq!(transitions.len(), rounds * 2);
        let presses = transitions.iter().filter(|t| t.pressed).count();
        assert_eq!(presses, rounds);
    }

    #[test]
    fn monitor_stop_joins_promptly_despite_a_long_interval() {
        let controller = controller();
        let factory = MockBusFactory::default();
        let (tx, _rx) = unbounded();
        controller
            .register_chip(&bus0_config(), &factory, tx.clone())
            .unwrap();

        let monitor = controller.start_monitor(Duration::from_secs(60), tx);
        std::thread::sleep(Duration::from_millis(50));
        let begun = std::time::Instant::now();
        monitor.stop();
        assert!(begun.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn scan_picks_up_missed_transition() {
        let controller = controller();
        let factory = MockBusFactory::default();
        let (tx, rx) = unbounded();
        let chip_id = controller
            .register_chip(&bus0_config(), &factory, tx.clone())
            .unwrap();

        // Level change without a latched flag, as after a coalesced
        // interrupt.
        factory.state(0x20).lock().gpio &= !(1 << 3);

        assert!(controller.decode_interrupt(chip_id).unwrap().is_empty());
        controller.scan_all(&tx);
        let transition = rx.try_recv().unwrap();
        assert_eq!(transition.bit_index, 3);
        assert!(transition.pressed);
    }

    #[test]
    fn chip_without_inputs_never_emits() {
        let controller = controller();
        let factory = MockBusFactory::default();
        let cfg = ChipConfig {
            id: 2,
            name: "Bus2".into(),
            address: 0x22,
            interrupt_line: 22,
            bits: vec![bit(1, "Bit0", None, selector(5, "LED"))],
        };
        let (tx, rx) = unbounded();
        let chip_id = controller.register_chip(&cfg, &factory, tx.clone()).unwrap();

        let state = factory.state(0x22);
        assert_eq!(state.lock().gpinten, 0);

        // Toggling a pin latches nothing (GPINTEN is zero) and neither path
        // emits.
        state.lock().drive_input(0, 1);
        state.lock().drive_input(0, 0);
        assert!(controller.decode_interrupt(chip_id).unwrap().is_empty());
        controller.scan_all(&tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn flag_on_unmapped_bit_is_cleared_but_not_emitted() {
        let controller = controller();
        let factory = MockBusFactory::default();
        let (tx, _rx) = unbounded();
        let chip_id = controller
            .register_chip(&bus0_config(), &factory, tx)
            .unwrap();

        let state = factory.state(0x20);
        state.lock().intf = 1 << 9; // no descriptor at index 9

        assert!(controller.decode_interrupt(chip_id).unwrap().is_empty());
        assert_eq!(state.lock().intf, 0);
    }

    #[test]
    fn missing_chip_is_a_registration_fault() {
        let controller = controller();
        let factory = MockBusFactory::default();
        factory.mark_missing(0x20);
        let (tx, _rx) = unbounded();
        let result = controller.register_chip(&bus0_config(), &factory, tx);
        assert!(matches!(result, Err(AppError::Registration(_))));
        assert_eq!(controller.chip_count(), 0);
    }

    #[test]
    fn asserted_interrupt_line_is_drained_at_registration() {
        let backend = Arc::new(MockGpioBackend::default());
        let controller = Arc::new(ExtenderController::new(
            Arc::new(LineManager::new(backend.clone())),
            10,
        ));
        let factory = MockBusFactory::default();

        // A flag latched before startup keeps the INT line asserted.
        let state = factory.state(0x20);
        state.lock().intf = 1 << 3;
        backend.set_level(16, 0);

        let (tx, _rx) = unbounded();
        controller
            .register_chip(&bus0_config(), &factory, tx)
            .unwrap();

        // Drained: the stale flag is gone.
        assert_eq!(state.lock().intf, 0);
    }

    #[test]
    fn bit_index_parsing() {
        assert_eq!(parse_bit_index("Bus0_Bit12").unwrap(), 12);
        assert_eq!(parse_bit_index("Bit 3").unwrap(), 3);
        assert!(matches!(parse_bit_index("Bit16"), Err(AppError::Parse(_))));
        assert!(matches!(parse_bit_index("NoDigits"), Err(AppError::Parse(_))));
    }
}
