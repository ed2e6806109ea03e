//! Event stream production and consumption
//!
//! - `producer`: append events to the platform, notification and activity streams
//! - `processor`: resumable batched consumer with auto-reconnect
//! - `back_pressure`: delay signalling toward a remote producer

pub mod back_pressure;
pub mod codec;
pub mod processor;
pub mod producer;

pub use back_pressure::{BackPressureController, DelayControl, HttpDelayControl, PressureMode};
pub use codec::{decode_entry, encode_fields, is_external};
pub use processor::{StreamBatch, StreamHandler, StreamOptions, StreamProcessor};
pub use producer::StreamProducer;
