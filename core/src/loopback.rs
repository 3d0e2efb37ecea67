//! In-process stand-in for a full-duplex sound card.
//!
//! A device thread calls [`PlaybackEndpoint::fill`] and feeds the same block,
//! delayed by a fixed latency, into [`CaptureEndpoint::drain`], pacing itself
//! like a real audio clock.

use crate::config::Params;
use crate::error::{ModemError, Result};
use crate::stream::{self, CaptureEndpoint, PlaybackEndpoint};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackConfig {
    /// Samples per device callback.
    pub block_size: usize,
    /// Delay between playback and capture, in samples.
    pub latency: usize,
    /// Clock speed relative to real time.
    pub speed: f64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            block_size: 256,
            latency: 0,
            speed: 1.0,
        }
    }
}

/// Running simulated device. Stops and joins its thread on drop.
pub struct LoopbackDevice {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl LoopbackDevice {
    pub fn start(
        params: &Params,
        config: &LoopbackConfig,
        mut playback: PlaybackEndpoint,
        mut capture: CaptureEndpoint,
    ) -> Result<Self> {
        if config.block_size == 0 || !(config.speed > 0.0) {
            return Err(ModemError::InvalidInput(format!(
                "loopback needs a non-empty block and a positive speed, got {} samples at {}x",
                config.block_size, config.speed
            )));
        }

        let period = Duration::from_secs_f64(
            config.block_size as f64 / params.sample_rate() / config.speed,
        );
        let block_size = config.block_size;
        let latency = config.latency;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = thread::spawn(move || {
            let mut line: VecDeque<f32> = VecDeque::from(vec![0.0; latency]);
            let mut out = vec![0.0f32; block_size];
            let mut heard = vec![0.0f32; block_size];

            while flag.load(Ordering::Acquire) {
                playback.fill(&mut out);
                line.extend(out.iter().copied());
                for (slot, sample) in heard.iter_mut().zip(line.drain(..block_size)) {
                    *slot = sample;
                }
                capture.drain(&heard);
                thread::sleep(period);
            }
        });

        log::debug!(
            "loopback device: {} samples per block, {} samples latency, {}x",
            block_size,
            latency,
            config.speed
        );
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("loopback device thread panicked");
            }
        }
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Send `bits` through a simulated device and return what the receiver decoded.
///
/// The transmitter runs on its own thread, the receiver on the calling one.
pub fn run_loopback(params: &Params, bits: &[bool], config: &LoopbackConfig) -> Result<Vec<bool>> {
    let (mut transmitter, playback) = stream::playback(params);
    let (mut receiver, capture) = stream::capture(params);
    let device = LoopbackDevice::start(params, config, playback, capture)?;

    let payload = bits.to_vec();
    let sender = thread::spawn(move || transmitter.transmit(&payload));

    let received = receiver.receive();
    let sent = sender
        .join()
        .map_err(|_| ModemError::InvalidInput("transmit thread panicked".into()))?;
    device.stop();

    sent?;
    received
}
