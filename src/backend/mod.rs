#[cfg(feature = "hardware")]
pub mod libgpiod;
pub mod mock;

#[cfg(feature = "hardware")]
pub use libgpiod::LibgpiodBackend;
pub use mock::MockGpioBackend;
