//! Real-time audio mixing engine.
//!
//! Combines up to [`MIXER_MAX_CHANNELS`] live 16-bit PCM streams into
//! per-output mixes, one fixed-size tick at a time. The engine is driven
//! externally by a periodic tick (no internal threads): the caller invokes
//! [`AudioMixer::preprocess`] once before the first tick,
//! [`AudioMixer::process`] once per tick, and
//! [`AudioMixer::postprocess`] after the last tick.
//!
//! Input and output ports are caller-owned packet queues, index = port
//! number. Each tick the engine:
//!
//! 1. checks for the single-contributor **bypass** optimization,
//! 2. pulls one tick of samples per active channel into a shared 32-bit
//!    accumulator,
//! 3. applies per-channel **flow control** to bound queue growth,
//! 4. dispatches the saturated mix to every enabled output — in
//!    **conferencing mode** each contributing port gets its own samples
//!    subtracted, so a participant never hears their own voice.
//!
//! `process` never blocks; the internal lock only serializes a tick
//! against concurrent control calls.

pub mod bufferizer;
mod simd;

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

pub use bufferizer::Bufferizer;

use crate::error::{MediaError, Result};

/// Fixed size of the channel table; port numbers index into it.
pub const MIXER_MAX_CHANNELS: usize = 128;

/// A port with no packets still counts as contributing for this many time
/// units after its last activity, debouncing bypass-mode transitions.
const BYPASS_MODE_TIMEOUT: u64 = 1000;

/// Length of the flow-control sampling window, in time units.
const FLOW_CONTROL_INTERVAL: u64 = 5000;

/// Default flow-control threshold, in ticks of buffered audio.
const DEFAULT_SKIP_THRESHOLD_TICKS: usize = 4;

/// Clamp a widened sample to the symmetric 16-bit range.
fn saturate(s: i32) -> i16 {
    s.clamp(-32767, 32767) as i16
}

fn samples_to_bytes(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &s in samples {
        buf.put_i16_ne(s);
    }
    buf.freeze()
}

/// Per-input-port state.
#[derive(Debug)]
struct Channel {
    bufferizer: Bufferizer,
    /// The channel's contribution this tick, kept for conferencing removal.
    input: Vec<i16>,
    min_fullness: Option<usize>,
    last_flow_control: Option<u64>,
    last_activity: Option<u64>,
    active: bool,
    output_enabled: bool,
    had_input: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            bufferizer: Bufferizer::new(),
            input: Vec::new(),
            min_fullness: None,
            last_flow_control: None,
            last_activity: None,
            active: true,
            output_enabled: true,
            had_input: false,
        }
    }

    fn prepare(&mut self, samples_per_tick: usize) {
        self.input = vec![0; samples_per_tick];
        self.last_flow_control = None;
        self.last_activity = None;
        self.min_fullness = None;
        self.had_input = false;
    }

    fn unprepare(&mut self) {
        self.input = Vec::new();
    }

    /// Track minimum buffered fullness over a sampling window; when it
    /// stays at or above `threshold` bytes for a whole window, discard
    /// down to half the threshold. Returns the number of bytes skipped.
    fn flow_control(&mut self, threshold: usize, time: u64) -> usize {
        let Some(last) = self.last_flow_control else {
            self.last_flow_control = Some(time);
            self.min_fullness = None;
            return 0;
        };
        let size = self.bufferizer.available();
        if self.min_fullness.is_none_or(|min| size < min) {
            self.min_fullness = Some(size);
        }
        let mut skipped = 0;
        if time - last >= FLOW_CONTROL_INTERVAL {
            if let Some(min) = self.min_fullness {
                if min >= threshold {
                    skipped = self.bufferizer.skip(min - threshold / 2);
                    tracing::debug!(skipped, fullness = min, "flow control: discarding excess");
                }
            }
            self.last_flow_control = Some(time);
            self.min_fullness = None;
        }
        skipped
    }
}

#[derive(Debug)]
struct MixerState {
    nchannels: u32,
    rate: u32,
    samples_per_tick: usize,
    channels: Vec<Channel>,
    conf_mode: bool,
    sum: Vec<i32>,
    scratch: Vec<u8>,
    outbuf: Vec<i16>,
    skip_threshold: usize,
    skip_threshold_ticks: usize,
    bypass_mode: bool,
}

impl MixerState {
    fn has_single_output(&self, outputs: &[VecDeque<Bytes>]) -> bool {
        let count = self
            .channels
            .iter()
            .take(outputs.len().min(MIXER_MAX_CHANNELS))
            .filter(|chan| chan.output_enabled)
            .count();
        count == 1
    }

    /// Bypass is an optimization for a single contributing channel: no
    /// synchronization or summing is needed, packets are distributed
    /// directly to the outputs. Returns true when this tick needs no mix
    /// (one contributor handled here, or none at all).
    fn check_bypass(
        &mut self,
        inputs: &mut [VecDeque<Bytes>],
        outputs: &mut [VecDeque<Bytes>],
        time: u64,
    ) -> bool {
        let mut active_cnt = 0;
        let mut active_input = None;

        for (i, q) in inputs.iter().enumerate().take(MIXER_MAX_CHANNELS) {
            let chan = &mut self.channels[i];
            if !q.is_empty() {
                chan.last_activity = Some(time);
                active_cnt += 1;
                active_input = Some(i);
            } else {
                match chan.last_activity {
                    None => chan.last_activity = Some(time),
                    Some(last) if time - last < BYPASS_MODE_TIMEOUT => {
                        active_cnt += 1;
                        active_input = Some(i);
                    }
                    Some(_) => {}
                }
            }
        }

        match active_cnt {
            1 => {
                if !self.bypass_mode {
                    self.bypass_mode = true;
                    tracing::debug!("entering bypass mode");
                }
                if let Some(idx) = active_input {
                    self.dispatch_bypass(inputs, outputs, idx);
                }
                true
            }
            0 => true, // no contributing channels at all, nothing to do
            _ => {
                if self.bypass_mode {
                    self.bypass_mode = false;
                    tracing::debug!("leaving bypass mode");
                }
                false
            }
        }
    }

    /// Forward the single contributor's packets verbatim: moved when
    /// exactly one output is enabled, duplicated by reference-counted
    /// clone otherwise.
    fn dispatch_bypass(
        &mut self,
        inputs: &mut [VecDeque<Bytes>],
        outputs: &mut [VecDeque<Bytes>],
        active_input: usize,
    ) {
        let single_output = self.has_single_output(outputs);
        for (i, outq) in outputs.iter_mut().enumerate().take(MIXER_MAX_CHANNELS) {
            let chan = &self.channels[i];
            if !chan.output_enabled {
                continue;
            }
            if self.conf_mode && i == active_input {
                continue;
            }
            if single_output {
                while let Some(m) = inputs[active_input].pop_front() {
                    outq.push_back(m);
                }
                break;
            }
            for m in inputs[active_input].iter() {
                outq.push_back(m.clone());
            }
        }
        inputs[active_input].clear();
    }

    fn mix(&mut self, inputs: &mut [VecDeque<Bytes>], outputs: &mut [VecDeque<Bytes>], time: u64) {
        let samples_per_tick = self.samples_per_tick;
        let skip_threshold = self.skip_threshold;
        let conf_mode = self.conf_mode;
        let lanes_ok = samples_per_tick % simd::LANES == 0;

        let MixerState {
            channels,
            sum,
            scratch,
            outbuf,
            ..
        } = self;

        sum.fill(0);

        // read one tick from every input and sum the active contributions
        for (i, q) in inputs.iter_mut().enumerate().take(MIXER_MAX_CHANNELS) {
            let chan = &mut channels[i];
            chan.had_input = false;
            chan.bufferizer.put_from_queue(q);
            if chan.bufferizer.read(scratch) {
                for (dst, src) in chan.input.iter_mut().zip(scratch.chunks_exact(2)) {
                    *dst = i16::from_ne_bytes([src[0], src[1]]);
                }
                if chan.active {
                    if lanes_ok {
                        simd::accumulate(sum, &chan.input);
                    } else {
                        for (s, v) in sum.iter_mut().zip(&chan.input) {
                            *s += *v as i32;
                        }
                    }
                    chan.had_input = true;
                }
            }
            chan.flow_control(skip_threshold, time);
        }

        // dispatch: the plain mix is computed once and shared by
        // reference-counted clone across all ports that use it
        let mut cached: Option<Bytes> = None;
        for (i, outq) in outputs.iter_mut().enumerate().take(MIXER_MAX_CHANNELS) {
            let chan = &channels[i];
            if !chan.output_enabled {
                continue;
            }
            let om = if conf_mode && chan.active && chan.had_input {
                // remove this participant's own contribution
                if lanes_ok {
                    simd::subtract_saturated(outbuf, sum, &chan.input);
                } else {
                    for ((o, s), v) in outbuf.iter_mut().zip(sum.iter()).zip(&chan.input) {
                        *o = saturate(*s - *v as i32);
                    }
                }
                samples_to_bytes(outbuf)
            } else if let Some(m) = &cached {
                m.clone()
            } else {
                if lanes_ok {
                    simd::copy_saturated(outbuf, sum);
                } else {
                    for (o, s) in outbuf.iter_mut().zip(sum.iter()) {
                        *o = saturate(*s);
                    }
                }
                let m = samples_to_bytes(outbuf);
                cached = Some(m.clone());
                m
            };
            outq.push_back(om);
        }
    }
}

/// Tick-driven mixer for 16-bit PCM audio streams.
///
/// See the [module documentation](self) for the per-tick algorithm.
/// All methods take `&self`: one internal lock serializes
/// [`process`](Self::process) against control-method calls, so a tick's
/// mix is atomic with respect to configuration changes.
#[derive(Debug)]
pub struct AudioMixer {
    state: Mutex<MixerState>,
}

impl AudioMixer {
    /// Create a mixer with default configuration: 16 kHz sample rate,
    /// mono interleaving, conferencing off, all channels active with
    /// outputs enabled.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MixerState {
                nchannels: 1,
                rate: 16000,
                samples_per_tick: 0,
                channels: (0..MIXER_MAX_CHANNELS).map(|_| Channel::new()).collect(),
                conf_mode: false,
                sum: Vec::new(),
                scratch: Vec::new(),
                outbuf: Vec::new(),
                skip_threshold: 0,
                skip_threshold_ticks: DEFAULT_SKIP_THRESHOLD_TICKS,
                bypass_mode: false,
            }),
        }
    }

    /// Set the sample rate in Hz; must be an integer multiple of 8000,
    /// otherwise the call is rejected and the prior rate is retained.
    pub fn set_sample_rate(&self, rate: u32) -> Result<()> {
        if rate % 8000 != 0 {
            tracing::warn!(rate, "unsupported sampling rate");
            return Err(MediaError::UnsupportedSampleRate(rate));
        }
        self.state.lock().rate = rate;
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().rate
    }

    /// Set the interleaved channel count (1 = mono, 2 = stereo).
    pub fn set_channels(&self, nchannels: u32) {
        self.state.lock().nchannels = nchannels;
    }

    pub fn channels(&self) -> u32 {
        self.state.lock().nchannels
    }

    /// In conferencing mode, each contributing port's own samples are
    /// subtracted from its mix.
    pub fn enable_conference_mode(&self, enabled: bool) {
        self.state.lock().conf_mode = enabled;
    }

    /// Include or exclude a port's samples from the mix.
    pub fn set_active(&self, port: usize, active: bool) -> Result<()> {
        let mut state = self.state.lock();
        let chan = Self::channel_mut(&mut state, port)?;
        chan.active = active;
        Ok(())
    }

    /// Enable or disable delivery to an output port.
    pub fn enable_output(&self, port: usize, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        let chan = Self::channel_mut(&mut state, port)?;
        chan.output_enabled = enabled;
        Ok(())
    }

    /// Accepted for interface compatibility; has no effect.
    pub fn set_master_channel(&self, _port: usize) {}

    /// Per-channel input gain is not supported by this engine.
    pub fn set_input_gain(&self, _port: usize, _gain: f32) -> Result<()> {
        tracing::warn!("set_input_gain: not implemented");
        Err(MediaError::Unsupported("input gain"))
    }

    /// Tune the flow-control threshold, in ticks of buffered audio
    /// (default 4).
    pub fn set_skip_threshold_ticks(&self, ticks: usize) {
        let mut state = self.state.lock();
        state.skip_threshold_ticks = ticks;
        state.skip_threshold = state.samples_per_tick * 2 * ticks;
    }

    /// Allocate tick-sized buffers; call once before the first tick.
    pub fn preprocess(&self, tick_interval_ms: u32) {
        let mut state = self.state.lock();
        let samples_per_tick = (state.nchannels * state.rate * tick_interval_ms / 1000) as usize;
        state.samples_per_tick = samples_per_tick;
        state.sum = vec![0; samples_per_tick];
        state.scratch = vec![0; samples_per_tick * 2];
        state.outbuf = vec![0; samples_per_tick];
        for chan in &mut state.channels {
            chan.prepare(samples_per_tick);
        }
        state.skip_threshold = samples_per_tick * 2 * state.skip_threshold_ticks;
        state.bypass_mode = false;
        tracing::debug!(
            samples_per_tick,
            rate = state.rate,
            nchannels = state.nchannels,
            "mixer prepared"
        );
    }

    /// Release tick-sized buffers; call once after the last tick.
    pub fn postprocess(&self) {
        let mut state = self.state.lock();
        state.samples_per_tick = 0;
        state.sum = Vec::new();
        state.scratch = Vec::new();
        state.outbuf = Vec::new();
        for chan in &mut state.channels {
            chan.unprepare();
        }
    }

    /// Run one tick: mix the input port queues into the output port
    /// queues. `time` is the scheduler's current time in the same units
    /// as the tick interval (milliseconds).
    ///
    /// Slices index by port number; ports beyond
    /// [`MIXER_MAX_CHANNELS`] are ignored. Never blocks.
    pub fn process(
        &self,
        inputs: &mut [VecDeque<Bytes>],
        outputs: &mut [VecDeque<Bytes>],
        time: u64,
    ) {
        let mut state = self.state.lock();
        if state.samples_per_tick == 0 {
            tracing::warn!("process called before preprocess");
            return;
        }
        if state.check_bypass(inputs, outputs, time) {
            return;
        }
        state.mix(inputs, outputs, time);
    }

    fn channel_mut(state: &mut MixerState, port: usize) -> Result<&mut Channel> {
        if port >= MIXER_MAX_CHANNELS {
            tracing::warn!(port, "invalid port number");
            return Err(MediaError::InvalidPort {
                port,
                max: MIXER_MAX_CHANNELS,
            });
        }
        Ok(&mut state.channels[port])
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new()
    }
}
