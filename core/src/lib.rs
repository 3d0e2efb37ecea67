//! Acoustic data-over-sound modem.
//!
//! Bits are framed behind a length field, packed into symbols and sent as
//! simultaneous tones, one per frequency band, after a linear chirp preamble
//! and a silent guard gap. The receiver finds the chirp with a matched
//! filter, steps over the guard gap and reads each band's strongest tone.
//!
//! All geometry comes from one [`Params`] value derived at startup from a
//! [`ModemConfig`].

pub mod bands;
pub mod bits;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod fft_correlation;
pub mod framing;
pub mod loopback;
pub mod stream;
pub mod sync;
pub mod tones;

pub use bits::{format_bits, parse_bits, Symbol};
pub use config::{ModemConfig, Params};
pub use decoder::Decoder;
pub use encoder::{Encoder, Transmission};
pub use error::{ConfigError, DecodeError, DeviceError, ModemError, Result, SyncError};
pub use loopback::{run_loopback, LoopbackConfig, LoopbackDevice};
pub use stream::{capture, playback, Receiver, StopHandle, Transmitter};
pub use sync::{detect_preamble, generate_chirp, PreambleDetector, SyncPoint};
