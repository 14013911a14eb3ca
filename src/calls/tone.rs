//! Two-tone ring synthesis.
//!
//! [`ToneEngine::ring`] renders nothing at call time: the ring pattern is
//! rendered once per engine at the sink's sample rate and handed to the sink
//! on each ring. Repetition is driven by the controller's ring timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToneError {
    #[error("no audio output device available")]
    NoOutputDevice,

    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("tone sink is closed")]
    Closed,
}

/// The ring sound: two identical short tones, the second offset from the first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingPattern {
    pub frequency_hz: f32,
    pub tone_duration: Duration,
    pub second_tone_offset: Duration,
    pub start_gain: f32,
    pub end_gain: f32,
}

impl Default for RingPattern {
    fn default() -> Self {
        Self {
            frequency_hz: 880.0,
            tone_duration: Duration::from_millis(200),
            second_tone_offset: Duration::from_millis(350),
            start_gain: 0.3,
            end_gain: 0.01,
        }
    }
}

impl RingPattern {
    /// Total length of the rendered pattern.
    pub fn total_duration(&self) -> Duration {
        self.second_tone_offset + self.tone_duration
    }

    /// Render mono samples at `sample_rate`.
    ///
    /// Each tone decays exponentially from `start_gain` to `end_gain`; the
    /// space between the tones is silence.
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        let rate = sample_rate as f64;
        let total = (self.total_duration().as_secs_f64() * rate).round() as usize;
        let tone_len = (self.tone_duration.as_secs_f64() * rate).round() as usize;
        let second_start = (self.second_tone_offset.as_secs_f64() * rate).round() as usize;

        let mut samples = vec![0.0f32; total];
        for start in [0, second_start] {
            self.write_tone(&mut samples, start, tone_len, rate);
        }
        samples
    }

    fn write_tone(&self, out: &mut [f32], start: usize, len: usize, rate: f64) {
        if len == 0 {
            return;
        }
        let ratio = (self.end_gain / self.start_gain) as f64;
        let omega = 2.0 * std::f64::consts::PI * self.frequency_hz as f64;
        for i in 0..len {
            let Some(slot) = out.get_mut(start + i) else {
                break;
            };
            let progress = i as f64 / len as f64;
            let gain = self.start_gain as f64 * ratio.powf(progress);
            let t = i as f64 / rate;
            *slot = (gain * (omega * t).sin()) as f32;
        }
    }
}

/// Audio output used by the engine. `play` must not block.
pub trait ToneSink: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn play(&self, samples: &Arc<[f32]>) -> Result<(), ToneError>;

    fn close(&self) {}
}

struct ActiveSink {
    sink: Box<dyn ToneSink>,
    rendered: Arc<[f32]>,
}

/// Produces the ring sound. Degrades to a silent engine when no sink could
/// be created, so call signaling never depends on audio.
pub struct ToneEngine {
    active: Option<ActiveSink>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ToneEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToneEngine")
            .field("audible", &self.active.is_some())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ToneEngine {
    pub fn new(sink: Box<dyn ToneSink>) -> Self {
        Self::with_pattern(sink, RingPattern::default())
    }

    pub fn with_pattern(sink: Box<dyn ToneSink>, pattern: RingPattern) -> Self {
        let rendered: Arc<[f32]> = pattern.render(sink.sample_rate()).into();
        Self {
            active: Some(ActiveSink { sink, rendered }),
            closed: AtomicBool::new(false),
        }
    }

    /// An engine whose `ring()` does nothing.
    pub fn silent() -> Self {
        Self {
            active: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Build from a fallible sink constructor, degrading to silence on error.
    pub fn from_sink_result(result: Result<Box<dyn ToneSink>, ToneError>) -> Self {
        match result {
            Ok(sink) => Self::new(sink),
            Err(e) => {
                warn!(target: "Call/Tone", "Ringtone unavailable, ringing silently: {e}");
                Self::silent()
            }
        }
    }

    /// Engine on the default output device when built with the `audio`
    /// feature, silent otherwise.
    pub fn system() -> Self {
        #[cfg(feature = "audio")]
        {
            Self::from_sink_result(
                cpal_sink::CpalToneSink::open().map(|s| Box::new(s) as Box<dyn ToneSink>),
            )
        }
        #[cfg(not(feature = "audio"))]
        {
            debug!(target: "Call/Tone", "Built without audio output, ringing silently");
            Self::silent()
        }
    }

    pub fn is_audible(&self) -> bool {
        self.active.is_some() && !self.closed.load(Ordering::Acquire)
    }

    pub fn ring(&self) {
        if self.closed.load(Ordering::Acquire) {
            trace!(target: "Call/Tone", "ring() after close ignored");
            return;
        }
        let Some(active) = &self.active else {
            return;
        };
        if let Err(e) = active.sink.play(&active.rendered) {
            debug!(target: "Call/Tone", "Failed to play ringtone: {e}");
        }
    }

    /// Release the audio output. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(active) = &self.active {
            active.sink.close();
        }
        debug!(target: "Call/Tone", "Tone engine closed");
    }
}

impl Drop for ToneEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "audio")]
mod cpal_sink {
    //! Output through `cpal`. The stream is `!Send`, so it lives on its own
    //! thread and is fed through a shared sample queue.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::thread::JoinHandle;
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use log::{error, info};

    use super::{ToneError, ToneSink};

    /// Queue bound in seconds of audio; extra rings are dropped rather than
    /// piling up behind a stalled device.
    const MAX_QUEUED_SECS: usize = 2;

    pub struct CpalToneSink {
        sample_rate: u32,
        queue: Arc<Mutex<VecDeque<f32>>>,
        stop: Arc<AtomicBool>,
        thread: Mutex<Option<JoinHandle<()>>>,
    }

    impl CpalToneSink {
        pub fn open() -> Result<Self, ToneError> {
            let queue = Arc::new(Mutex::new(VecDeque::new()));
            let stop = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = mpsc::channel();

            let thread = std::thread::spawn({
                let queue = queue.clone();
                let stop = stop.clone();
                move || run_output(queue, stop, ready_tx)
            });

            let sample_rate = ready_rx
                .recv()
                .map_err(|_| ToneError::Device("audio thread exited".into()))??;

            Ok(Self {
                sample_rate,
                queue,
                stop,
                thread: Mutex::new(Some(thread)),
            })
        }
    }

    fn run_output(
        queue: Arc<Mutex<VecDeque<f32>>>,
        stop: Arc<AtomicBool>,
        ready: mpsc::Sender<Result<u32, ToneError>>,
    ) {
        let stream = match build_stream(queue) {
            Ok((stream, rate)) => {
                let _ = ready.send(Ok(rate));
                stream
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        while !stop.load(Ordering::Acquire) {
            std::thread::park_timeout(Duration::from_millis(200));
        }
        drop(stream);
    }

    fn build_stream(
        queue: Arc<Mutex<VecDeque<f32>>>,
    ) -> Result<(cpal::Stream, u32), ToneError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(ToneError::NoOutputDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| ToneError::Device(e.to_string()))?;
        if supported.sample_format() != cpal::SampleFormat::F32 {
            return Err(ToneError::UnsupportedFormat(format!(
                "{:?}",
                supported.sample_format()
            )));
        }

        let config: cpal::StreamConfig = supported.into();
        let channels = config.channels as usize;
        let sample_rate = config.sample_rate.0;
        info!(
            target: "Call/Tone",
            "Ringtone output: {} ({} Hz, {} channel(s))",
            device.name().unwrap_or_default(),
            sample_rate,
            channels
        );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = match queue.lock() {
                        Ok(q) => q,
                        Err(_) => {
                            data.fill(0.0);
                            return;
                        }
                    };
                    for frame in data.chunks_mut(channels) {
                        let sample = queue.pop_front().unwrap_or(0.0);
                        frame.fill(sample);
                    }
                },
                |err| error!(target: "Call/Tone", "Ringtone output stream error: {err}"),
                None,
            )
            .map_err(|e| ToneError::Device(e.to_string()))?;
        stream
            .play()
            .map_err(|e| ToneError::Device(e.to_string()))?;

        Ok((stream, sample_rate))
    }

    impl ToneSink for CpalToneSink {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn play(&self, samples: &Arc<[f32]>) -> Result<(), ToneError> {
            if self.stop.load(Ordering::Acquire) {
                return Err(ToneError::Closed);
            }
            let mut queue = self
                .queue
                .lock()
                .map_err(|_| ToneError::Device("sample queue poisoned".into()))?;
            if queue.len() + samples.len() > self.sample_rate as usize * MAX_QUEUED_SECS {
                return Ok(());
            }
            queue.extend(samples.iter().copied());
            Ok(())
        }

        fn close(&self) {
            self.stop.store(true, Ordering::Release);
            if let Ok(mut thread) = self.thread.lock()
                && let Some(handle) = thread.take()
            {
                handle.thread().unpark();
            }
        }
    }
}
