//! Real-time streaming engine.
//!
//! Two execution contexts meet here. The audio device calls
//! [`PlaybackEndpoint::fill`] and [`CaptureEndpoint::drain`] on its own
//! cadence; those calls copy samples, advance a cursor and post at most one
//! completion per phase. They never block, allocate, free or log.
//!
//! Everything else runs in the orchestrating context: [`Transmitter`]
//! synthesizes all phases up front and blocks on each phase's completion,
//! [`Receiver`] correlates and demodulates the capture as it fills.
//!
//! ```text
//! transmit: Idle -> SendingPreamble -> GuardGap -> SendingData -> Done
//! receive:  Idle -> Listening -> Synced -> ReceivingData -> Done
//! ```

use crate::config::Params;
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::{DecodeError, DeviceError, ModemError, Result};
use crate::sync::SyncPoint;
use crossbeam_channel::{bounded, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Preamble-sized steps per listening window.
const SEARCH_WINDOW_PREAMBLES: usize = 4;

/// Chirp, guard gap and data.
const PLAYBACK_PHASES: usize = 3;

/// How a phase ended, as reported by the audio context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEnd {
    /// Every sample of the phase was delivered.
    Drained,
    /// The stream was stopped; undelivered samples were replaced by silence.
    Stopped,
}

/// Sending half of a one-shot completion signal.
///
/// `notify` consumes the notifier, so a phase can complete at most once.
/// Dropping it without notifying disconnects the waiter.
pub struct Notifier<T> {
    tx: Sender<T>,
}

/// Waiting half of a one-shot completion signal.
pub struct Completion<T> {
    rx: crossbeam_channel::Receiver<T>,
}

/// Create a single-set, single-wait completion pair.
pub fn completion<T>() -> (Notifier<T>, Completion<T>) {
    let (tx, rx) = bounded(1);
    (Notifier { tx }, Completion { rx })
}

impl<T> Notifier<T> {
    /// Post the completion. Never blocks; the channel slot is reserved for it.
    pub fn notify(self, value: T) {
        // The waiter may already have timed out and gone away.
        let _ = self.tx.try_send(value);
    }
}

impl<T> Completion<T> {
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| DeviceError::Disconnected.into())
    }

    pub fn wait_timeout(self, timeout: Duration, phase: &'static str) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(DeviceError::Timeout { phase }.into()),
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::Disconnected.into()),
        }
    }
}

/// Shared stop flag. Stopping ends the current phase at the next device
/// callback, which still posts its completion exactly once.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Expected duration of `samples` plus the configured slack.
fn phase_deadline(params: &Params, samples: usize) -> Duration {
    Duration::from_secs_f64(samples as f64 / params.sample_rate() + params.config().phase_timeout)
}

fn send_to_device<T>(tx: &Sender<T>, value: T, timeout: Duration, phase: &'static str) -> Result<()> {
    tx.send_timeout(value, timeout).map_err(|e| -> ModemError {
        match e {
            SendTimeoutError::Timeout(_) => DeviceError::Timeout { phase }.into(),
            SendTimeoutError::Disconnected(_) => DeviceError::Disconnected.into(),
        }
    })
}

// ---------------------------------------------------------------------------
// Transmit
// ---------------------------------------------------------------------------

/// Completion payload of a playback phase. The sample buffer travels back
/// with it so it is freed outside the audio context.
#[derive(Debug)]
pub struct PlaybackDone {
    pub end: PhaseEnd,
    pub delivered: usize,
    pub buffer: Vec<f32>,
}

struct PlaybackPhase {
    samples: Vec<f32>,
    cursor: usize,
    notifier: Notifier<PlaybackDone>,
}

/// Device-side half of a transmit stream.
pub struct PlaybackEndpoint {
    phases: crossbeam_channel::Receiver<PlaybackPhase>,
    current: Option<PlaybackPhase>,
    stop: StopHandle,
}

impl PlaybackEndpoint {
    /// Fill one device buffer from the queued phases.
    ///
    /// Returns the number of phase samples written; the rest of `out` is
    /// silence. A phase that runs out mid-buffer completes here and the next
    /// queued phase continues in the same buffer, so phases play back to back
    /// whatever the device block size.
    pub fn fill(&mut self, out: &mut [f32]) -> usize {
        if self.stop.is_stopped() {
            out.fill(0.0);
            self.finish(PhaseEnd::Stopped);
            while let Ok(phase) = self.phases.try_recv() {
                self.current = Some(phase);
                self.finish(PhaseEnd::Stopped);
            }
            return 0;
        }

        let mut written = 0;
        while written < out.len() {
            if self.current.is_none() {
                self.current = self.phases.try_recv().ok();
            }
            let Some(phase) = self.current.as_mut() else {
                break;
            };

            let count = (phase.samples.len() - phase.cursor).min(out.len() - written);
            out[written..written + count]
                .copy_from_slice(&phase.samples[phase.cursor..phase.cursor + count]);
            phase.cursor += count;
            written += count;

            if phase.cursor == phase.samples.len() {
                self.finish(PhaseEnd::Drained);
            }
        }
        out[written..].fill(0.0);
        written
    }

    /// True when no phase is in progress.
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    fn finish(&mut self, end: PhaseEnd) {
        if let Some(phase) = self.current.take() {
            phase.notifier.notify(PlaybackDone {
                end,
                delivered: phase.cursor,
                buffer: phase.samples,
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitState {
    Idle,
    SendingPreamble,
    GuardGap,
    SendingData,
    Done,
}

/// Orchestrating half of a transmit stream.
pub struct Transmitter {
    encoder: Encoder,
    phases: Sender<PlaybackPhase>,
    stop: StopHandle,
    state: TransmitState,
}

/// Create a transmit stream: the orchestrator and the endpoint to hand to
/// the audio device.
pub fn playback(params: &Params) -> (Transmitter, PlaybackEndpoint) {
    let (tx, rx) = bounded(PLAYBACK_PHASES);
    let stop = StopHandle::default();
    let transmitter = Transmitter {
        encoder: Encoder::new(params),
        phases: tx,
        stop: stop.clone(),
        state: TransmitState::Idle,
    };
    let endpoint = PlaybackEndpoint {
        phases: rx,
        current: None,
        stop,
    };
    (transmitter, endpoint)
}

impl Transmitter {
    pub fn state(&self) -> TransmitState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Play one frame carrying `bits`: chirp, guard gap, data.
    ///
    /// All three phases are synthesized and queued before the first one
    /// starts, so the device plays them without a gap. The call then follows
    /// the device through each phase's completion.
    ///
    /// A stream carries one frame, like a receive stream: the transmitter
    /// ends in `Done` whether or not the frame went out, and rejects further
    /// calls.
    pub fn transmit(&mut self, bits: &[bool]) -> Result<()> {
        if self.state != TransmitState::Idle {
            return Err(ModemError::InvalidInput(format!(
                "transmitter is {:?}, a stream carries one frame",
                self.state
            )));
        }
        let result = self.run(bits);
        if let Err(e) = &result {
            log::warn!("transmit failed in {:?}: {}", self.state, e);
        }
        self.enter(TransmitState::Done);
        result
    }

    fn run(&mut self, bits: &[bool]) -> Result<()> {
        let transmission = self.encoder.prepare(bits)?;
        if self.stop.is_stopped() {
            return Err(ModemError::Cancelled);
        }

        let phases = [
            (TransmitState::SendingPreamble, "preamble", transmission.preamble),
            (TransmitState::GuardGap, "guard gap", transmission.guard),
            (TransmitState::SendingData, "data", transmission.data),
        ];
        let params = self.encoder.params().clone();
        let mut queued = Vec::with_capacity(PLAYBACK_PHASES);
        let mut elapsed = 0;
        for (state, name, samples) in phases {
            elapsed += samples.len();
            let deadline = phase_deadline(&params, elapsed);
            let (notifier, done) = completion();
            let phase = PlaybackPhase {
                samples,
                cursor: 0,
                notifier,
            };
            send_to_device(&self.phases, phase, deadline, name)?;
            queued.push((state, name, deadline, done));
        }

        for (state, name, deadline, done) in queued {
            self.enter(state);
            let done = done.wait_timeout(deadline, name)?;
            match done.end {
                PhaseEnd::Drained => {
                    log::debug!("{} phase delivered {} samples", name, done.delivered);
                }
                PhaseEnd::Stopped => {
                    log::info!(
                        "{} phase stopped after {} of {} samples",
                        name,
                        done.delivered,
                        done.buffer.len()
                    );
                    return Err(ModemError::Cancelled);
                }
            }
        }
        Ok(())
    }

    fn enter(&mut self, state: TransmitState) {
        log::info!("transmit: {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

// ---------------------------------------------------------------------------
// Receive
// ---------------------------------------------------------------------------

/// Preallocated, append-only capture store shared by one writer (the device)
/// and one reader (the receiver). Samples are stored as `f32` bit patterns in
/// atomic slots; the published length is released after the slots are
/// written.
struct CaptureBuffer {
    slots: Box<[AtomicU32]>,
    written: AtomicUsize,
    dropped: AtomicUsize,
}

impl CaptureBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            written: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn written(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }

    fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Acquire)
    }

    /// Copy out published samples in `start..end`.
    fn read(&self, start: usize, end: usize) -> Vec<f32> {
        let end = end.min(self.written());
        let start = start.min(end);
        self.slots[start..end]
            .iter()
            .map(|slot| f32::from_bits(slot.load(Ordering::Relaxed)))
            .collect()
    }

    /// Writer side. Returns how many samples fit.
    fn append(&self, input: &[f32]) -> usize {
        let start = self.written.load(Ordering::Relaxed);
        let accepted = input.len().min(self.slots.len() - start);
        for (slot, &sample) in self.slots[start..start + accepted].iter().zip(input) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }
        self.written.store(start + accepted, Ordering::Release);

        if accepted < input.len() {
            self.dropped
                .fetch_add(input.len() - accepted, Ordering::Release);
        }
        accepted
    }
}

struct CaptureTarget {
    until: usize,
    notifier: Notifier<PhaseEnd>,
}

/// Device-side half of a receive stream.
pub struct CaptureEndpoint {
    buffer: Arc<CaptureBuffer>,
    targets: crossbeam_channel::Receiver<CaptureTarget>,
    pending: Option<CaptureTarget>,
    stop: StopHandle,
}

impl CaptureEndpoint {
    /// Append one device buffer to the capture.
    ///
    /// Returns the number of samples kept. Samples past the preallocated
    /// capacity are counted as dropped and reported to the receiver as an
    /// overrun.
    pub fn drain(&mut self, input: &[f32]) -> usize {
        let accepted = self.buffer.append(input);

        if self.pending.is_none() {
            self.pending = self.targets.try_recv().ok();
        }
        let end = match &self.pending {
            Some(_) if self.stop.is_stopped() => Some(PhaseEnd::Stopped),
            Some(target)
                if self.buffer.written() >= target.until || accepted < input.len() =>
            {
                Some(PhaseEnd::Drained)
            }
            _ => None,
        };
        if let Some(end) = end {
            if let Some(target) = self.pending.take() {
                target.notifier.notify(end);
            }
        }
        accepted
    }

    pub fn captured(&self) -> usize {
        self.buffer.written()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Idle,
    Listening,
    Synced,
    ReceivingData,
    Done,
}

/// Orchestrating half of a receive stream.
pub struct Receiver {
    params: Params,
    decoder: Decoder,
    buffer: Arc<CaptureBuffer>,
    targets: Sender<CaptureTarget>,
    stop: StopHandle,
    state: ReceiveState,
}

/// Samples a receive stream must hold: the whole listening window, the
/// chirp, guard gap and slack after a chirp found at its very end, and the
/// largest accepted frame.
pub fn capture_capacity(params: &Params) -> usize {
    params.listen_samples()
        + params.preamble_samples()
        + params.guard_samples()
        + params.guard_slack_samples()
        + params.frame_symbols(params.config().max_payload_bits) * params.samples_per_symbol()
}

/// Create a receive stream. The capture store is allocated here, once.
pub fn capture(params: &Params) -> (Receiver, CaptureEndpoint) {
    let buffer = Arc::new(CaptureBuffer::new(capture_capacity(params)));
    let (tx, rx) = bounded(1);
    let stop = StopHandle::default();
    let receiver = Receiver {
        params: params.clone(),
        decoder: Decoder::new(params),
        buffer: buffer.clone(),
        targets: tx,
        stop: stop.clone(),
        state: ReceiveState::Idle,
    };
    let endpoint = CaptureEndpoint {
        buffer,
        targets: rx,
        pending: None,
        stop,
    };
    (receiver, endpoint)
}

impl Receiver {
    pub fn state(&self) -> ReceiveState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Listen for a preamble and decode the frame that follows it.
    ///
    /// A capture is consumed by one call; the receiver ends in `Done` whether
    /// or not a frame was decoded.
    pub fn receive(&mut self) -> Result<Vec<bool>> {
        if self.state != ReceiveState::Idle {
            return Err(ModemError::InvalidInput(format!(
                "receiver is {:?}, a stream carries one frame",
                self.state
            )));
        }
        let result = self.run();
        if let Err(e) = &result {
            log::warn!("receive failed in {:?}: {}", self.state, e);
        }
        self.enter(ReceiveState::Done);
        result
    }

    fn run(&mut self) -> Result<Vec<bool>> {
        self.enter(ReceiveState::Listening);
        let sync = self.listen()?;

        self.enter(ReceiveState::Synced);
        let onset = self.locate_onset(&sync)?;

        self.enter(ReceiveState::ReceivingData);
        self.read_frame(onset)
    }

    fn enter(&mut self, state: ReceiveState) {
        log::info!("receive: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Search the capture in overlapping windows until a chirp shows up or
    /// the listening window is exhausted. Consecutive windows share
    /// `preamble_samples - 1` samples, so every start offset is tested once.
    fn listen(&self) -> Result<SyncPoint> {
        let preamble = self.params.preamble_samples();
        let window = SEARCH_WINDOW_PREAMBLES * preamble;
        let listen_end = self.params.listen_samples() + preamble;
        let detector = self.decoder.detector();

        let mut start = 0;
        loop {
            let end = (start + window).min(listen_end);
            self.wait_for(end, "listen")?;

            match detector.detect(&self.buffer.read(start, end)) {
                Ok(local) => {
                    return Ok(SyncPoint {
                        offset: start + local.offset,
                        score: local.score,
                    })
                }
                Err(ModemError::Sync(err)) if end < listen_end => {
                    log::debug!("no preamble in samples {}..{}: {}", start, end, err);
                }
                Err(e) => return Err(e),
            }
            start = end + 1 - preamble;
        }
    }

    fn locate_onset(&self, sync: &SyncPoint) -> Result<usize> {
        let end = sync.offset
            + self.params.preamble_samples()
            + self.params.guard_samples()
            + self.params.guard_slack_samples()
            + self.params.samples_per_symbol();
        self.wait_for(end, "guard gap")?;

        let local = SyncPoint {
            offset: 0,
            score: sync.score,
        };
        let region = self.buffer.read(sync.offset, end);
        let onset = sync.offset + self.decoder.detector().locate_data_start(&region, &local)?;
        log::info!("data region starts at sample {}", onset);
        Ok(onset)
    }

    fn read_frame(&self, onset: usize) -> Result<Vec<bool>> {
        let symbol = self.params.samples_per_symbol();
        let header_end = onset + self.params.header_symbols() * symbol;
        self.wait_for(header_end, "data")?;
        let payload_bits = self
            .decoder
            .payload_length(&self.buffer.read(onset, header_end))?;

        let capacity_bits = self.params.config().max_payload_bits;
        if payload_bits > capacity_bits as u64 {
            return Err(DecodeError::FrameTooLong {
                payload_bits,
                capacity_bits,
            }
            .into());
        }

        let frame_end = onset + self.params.frame_symbols(payload_bits as usize) * symbol;
        self.wait_for(frame_end, "data")?;
        self.decoder
            .decode_frame(&self.buffer.read(onset, frame_end), payload_bits)
    }

    /// Block until the capture holds `until` samples.
    fn wait_for(&self, until: usize, phase: &'static str) -> Result<()> {
        if until > self.buffer.capacity() {
            return Err(DeviceError::CaptureOverrun {
                dropped: until - self.buffer.capacity(),
            }
            .into());
        }

        loop {
            if self.stop.is_stopped() {
                return Err(ModemError::Cancelled);
            }
            let written = self.buffer.written();
            if written >= until {
                return Ok(());
            }
            let dropped = self.buffer.dropped();
            if dropped > 0 {
                return Err(DeviceError::CaptureOverrun { dropped }.into());
            }

            let deadline = phase_deadline(&self.params, until - written);
            let (notifier, done) = completion();
            send_to_device(&self.targets, CaptureTarget { until, notifier }, deadline, phase)?;
            if done.wait_timeout(deadline, phase)? == PhaseEnd::Stopped {
                return Err(ModemError::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModemConfig;
    use crate::error::SyncError;
    use std::thread;
    use std::time::Instant;

    fn voice_params() -> Params {
        Params::derive(&ModemConfig::voice_band()).unwrap()
    }

    fn submit(transmitter: &Transmitter, samples: Vec<f32>) -> Completion<PlaybackDone> {
        let (notifier, done) = completion();
        transmitter
            .phases
            .send(PlaybackPhase {
                samples,
                cursor: 0,
                notifier,
            })
            .unwrap();
        done
    }

    #[test]
    fn test_completion_delivers_value() {
        let (notifier, done) = completion();
        notifier.notify(7u32);
        assert_eq!(done.wait().unwrap(), 7);
    }

    #[test]
    fn test_dropped_notifier_disconnects() {
        let (notifier, done) = completion::<PhaseEnd>();
        drop(notifier);
        assert!(matches!(
            done.wait_timeout(Duration::from_secs(1), "data"),
            Err(ModemError::Device(DeviceError::Disconnected))
        ));
    }

    #[test]
    fn test_completion_times_out() {
        let (_notifier, done) = completion::<PhaseEnd>();
        assert!(matches!(
            done.wait_timeout(Duration::from_millis(10), "data"),
            Err(ModemError::Device(DeviceError::Timeout { phase: "data" }))
        ));
    }

    #[test]
    fn test_fill_copies_then_pads_with_silence() {
        let (transmitter, mut endpoint) = playback(&voice_params());
        let samples: Vec<f32> = (1..=10).map(|i| i as f32).collect();
        let done = submit(&transmitter, samples.clone());

        let mut block = [9.0f32; 4];
        assert_eq!(endpoint.fill(&mut block), 4);
        assert_eq!(block, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(endpoint.fill(&mut block), 4);
        assert!(!endpoint.is_idle());
        assert_eq!(endpoint.fill(&mut block), 2);
        assert_eq!(block, [9.0, 10.0, 0.0, 0.0]);
        assert!(endpoint.is_idle());

        let done = done.wait().unwrap();
        assert_eq!(done.end, PhaseEnd::Drained);
        assert_eq!(done.delivered, 10);
        assert_eq!(done.buffer, samples);

        assert_eq!(endpoint.fill(&mut block), 0);
        assert_eq!(block, [0.0; 4]);
    }

    #[test]
    fn test_queued_phase_continues_in_same_buffer() {
        let (transmitter, mut endpoint) = playback(&voice_params());
        let first = submit(&transmitter, vec![1.0; 3]);
        let second = submit(&transmitter, vec![2.0; 3]);

        let mut block = [0.0f32; 4];
        assert_eq!(endpoint.fill(&mut block), 4);
        assert_eq!(block, [1.0, 1.0, 1.0, 2.0]);
        assert_eq!(first.wait().unwrap().end, PhaseEnd::Drained);

        assert_eq!(endpoint.fill(&mut block), 2);
        assert_eq!(block, [2.0, 2.0, 0.0, 0.0]);
        let second = second.wait().unwrap();
        assert_eq!(second.end, PhaseEnd::Drained);
        assert_eq!(second.delivered, 3);
    }

    #[test]
    fn test_late_phase_starts_on_next_buffer() {
        let (transmitter, mut endpoint) = playback(&voice_params());
        let first = submit(&transmitter, vec![1.0; 3]);
        let mut block = [0.0f32; 4];
        assert_eq!(endpoint.fill(&mut block), 3);
        first.wait().unwrap();

        let second = submit(&transmitter, vec![2.0; 3]);
        assert_eq!(endpoint.fill(&mut block), 3);
        assert_eq!(block, [2.0, 2.0, 2.0, 0.0]);
        assert_eq!(second.wait().unwrap().end, PhaseEnd::Drained);
    }

    #[test]
    fn test_stop_completes_every_queued_phase() {
        let (transmitter, mut endpoint) = playback(&voice_params());
        let first = submit(&transmitter, vec![1.0; 10]);
        let second = submit(&transmitter, vec![2.0; 10]);

        let mut block = [0.0f32; 4];
        endpoint.fill(&mut block);
        transmitter.stop_handle().stop();
        assert_eq!(endpoint.fill(&mut block), 0);

        let first = first.wait().unwrap();
        assert_eq!((first.end, first.delivered), (PhaseEnd::Stopped, 4));
        let second = second.wait().unwrap();
        assert_eq!((second.end, second.delivered), (PhaseEnd::Stopped, 0));
        assert!(endpoint.is_idle());
    }

    #[test]
    fn test_stop_mid_phase_completes_once_with_silence() {
        let (transmitter, mut endpoint) = playback(&voice_params());
        let done = submit(&transmitter, vec![0.5; 100]);

        let mut block = [0.0f32; 16];
        endpoint.fill(&mut block);
        transmitter.stop_handle().stop();
        block.fill(1.0);
        assert_eq!(endpoint.fill(&mut block), 0);
        assert_eq!(block, [0.0; 16]);

        let done = done.wait().unwrap();
        assert_eq!(done.end, PhaseEnd::Stopped);
        assert_eq!(done.delivered, 16);
        assert!(endpoint.is_idle());
    }

    #[test]
    fn test_dropped_endpoint_disconnects_transmitter() {
        let (mut transmitter, endpoint) = playback(&voice_params());
        drop(endpoint);
        assert!(matches!(
            transmitter.transmit(&[true]),
            Err(ModemError::Device(DeviceError::Disconnected))
        ));
        assert_eq!(transmitter.state(), TransmitState::Done);
    }

    #[test]
    fn test_transmitter_walks_all_phases() {
        let params = voice_params();
        let (mut transmitter, mut endpoint) = playback(&params);
        let expected = Encoder::new(&params).encode(&[true, false, true]).unwrap();

        let sender = thread::spawn(move || {
            let result = transmitter.transmit(&[true, false, true]);
            let again = transmitter.transmit(&[true]);
            (result, again, transmitter.state())
        });

        // A block much larger than the guard gap: phases still play back to back.
        let mut played = Vec::new();
        let mut block = vec![0.0f32; 3 * params.guard_samples()];
        let started = Instant::now();
        while !sender.is_finished() && started.elapsed() < Duration::from_secs(10) {
            let written = endpoint.fill(&mut block);
            played.extend_from_slice(&block[..written]);
            thread::sleep(Duration::from_micros(100));
        }

        let (result, again, state) = sender.join().unwrap();
        result.unwrap();
        assert!(matches!(again, Err(ModemError::InvalidInput(_))));
        assert_eq!(state, TransmitState::Done);
        assert_eq!(played, expected);
    }

    #[test]
    fn test_transmitter_stop_is_cancellation() {
        let params = voice_params();
        let (mut transmitter, mut endpoint) = playback(&params);
        let stop = transmitter.stop_handle();
        let sender = thread::spawn(move || transmitter.transmit(&[true; 64]));

        let mut block = [0.0f32; 64];
        let mut played = 0;
        while !sender.is_finished() {
            played += endpoint.fill(&mut block);
            if played > 500 {
                stop.stop();
            }
            thread::sleep(Duration::from_micros(100));
        }
        assert!(matches!(sender.join().unwrap(), Err(ModemError::Cancelled)));
        assert!(played < params.transmission_samples(64));
    }

    #[test]
    fn test_capture_overrun_is_counted() {
        let buffer = CaptureBuffer::new(8);
        assert_eq!(buffer.append(&[1.0; 5]), 5);
        assert_eq!(buffer.append(&[2.0; 5]), 3);
        assert_eq!(buffer.written(), 8);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.read(3, 100), vec![1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_drain_releases_armed_target() {
        let (receiver, mut endpoint) = capture(&voice_params());
        let (notifier, done) = completion();
        receiver
            .targets
            .send(CaptureTarget { until: 10, notifier })
            .unwrap();

        assert_eq!(endpoint.drain(&[0.1; 6]), 6);
        assert_eq!(endpoint.drain(&[0.2; 6]), 6);
        assert_eq!(done.wait().unwrap(), PhaseEnd::Drained);
        assert_eq!(endpoint.captured(), 12);
        assert_eq!(receiver.buffer.read(4, 8), vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_wait_beyond_capacity_is_an_overrun() {
        let params = voice_params();
        let (receiver, _endpoint) = capture(&params);
        let capacity = capture_capacity(&params);
        assert!(matches!(
            receiver.wait_for(capacity + 5, "data"),
            Err(ModemError::Device(DeviceError::CaptureOverrun { dropped: 5 }))
        ));
    }

    #[test]
    fn test_silence_exhausts_listening_window() {
        let config = ModemConfig {
            listen_duration: 1.0,
            ..ModemConfig::voice_band()
        };
        let params = Params::derive(&config).unwrap();
        let (mut receiver, mut endpoint) = capture(&params);

        let device = thread::spawn(move || {
            let block = [0.0f32; 256];
            while endpoint.drain(&block) == block.len() {
                thread::sleep(Duration::from_micros(200));
            }
        });

        let err = receiver.receive().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, ModemError::Sync(SyncError::PreambleNotFound { .. })));
        assert_eq!(receiver.state(), ReceiveState::Done);
        device.join().unwrap();

        assert!(matches!(receiver.receive(), Err(ModemError::InvalidInput(_))));
    }

    #[test]
    fn test_stopping_receiver_cancels_listen() {
        let (mut receiver, mut endpoint) = capture(&voice_params());
        let stop = receiver.stop_handle();

        let device = thread::spawn(move || {
            let block = [0.0f32; 64];
            for round in 0..200 {
                if round == 20 {
                    stop.stop();
                }
                endpoint.drain(&block);
                thread::sleep(Duration::from_millis(1));
            }
        });

        assert!(matches!(receiver.receive(), Err(ModemError::Cancelled)));
        device.join().unwrap();
    }
}
