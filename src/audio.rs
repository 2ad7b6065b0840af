//! Audio-track emulation.
//!
//! Models what a VCR does to sound: the track's band limit, record
//! preemphasis and playback deemphasis, tape hiss, and on linear
//! (non-Hi-Fi) tracks the faint sync buzz that crosstalks over from the
//! video signal plus the high boost some decks apply on playback.

use rand::Rng;

use crate::config::{AudioParams, Config, TvStandard};
use crate::filter::{HiLoPass, LowpassFilter};

/// Scale factor that takes a full-scale sample down by `db` decibels.
#[inline]
pub fn dbfs(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

const OVERSAMPLE: u64 = 16;

/// Stateful per-channel filter graph. Feed it interleaved s16 PCM in
/// presentation order; state carries across calls.
pub struct AudioChain {
    params: AudioParams,
    tv: TvStandard,
    band: Vec<HiLoPass>,
    preemphasis: Vec<LowpassFilter>,
    deemphasis: Vec<LowpassFilter>,
    high_boost: Vec<LowpassFilter>,
    linear_buzz: f32,
    sample_count: u64,
}

impl AudioChain {
    pub fn new(cfg: &Config) -> Self {
        let p = cfg.audio;
        let rate = p.rate as f32;
        Self {
            params: p,
            tv: cfg.tv,
            band: (0..p.channels)
                .map(|_| HiLoPass::new(p.band_passes, rate, p.lowpass_hz, p.highpass_hz))
                .collect(),
            preemphasis: vec![LowpassFilter::new(rate, p.emphasis_cut_hz); p.channels],
            deemphasis: vec![LowpassFilter::new(rate, p.emphasis_cut_hz); p.channels],
            high_boost: vec![LowpassFilter::new(rate, 10_000.0); p.channels],
            linear_buzz: dbfs(p.linear_buzz_db),
            sample_count: 0,
        }
    }

    /// Process interleaved samples in place.
    pub fn process(&mut self, samples: &mut [i16], rng: &mut impl Rng) {
        let channels = self.params.channels;
        let rate = f64::from(self.params.rate);
        let hsync_hz = f64::from(self.tv.line_rate_hz());
        let half_frame_lines = f64::from(self.tv.total_lines()) / 2.0;
        let vpulse_end = self.tv.vpulse_end() as i64;
        let hpulse_end = f64::from(self.tv.hpulse_end());
        let buzz_active = self.params.linear_track && self.linear_buzz > 1e-9;

        for frame in samples.chunks_mut(channels) {
            for (c, sample) in frame.iter_mut().enumerate() {
                let mut s = f32::from(*sample) / 32768.0;

                s = self.band[c].filter(s);

                if self.params.preemphasis {
                    s += self.preemphasis[c].highpass(s);
                }

                if buzz_active {
                    // track the virtual raster position to find the sync
                    // windows that bleed into the linear track
                    for oi in 0..OVERSAMPLE {
                        let t = ((self.sample_count * OVERSAMPLE + oi) as f64 * hsync_hz)
                            / rate
                            / OVERSAMPLE as f64;
                        let hpos = t.fract();
                        let vline = ((t + 0.0001 - hpos).floor() % half_frame_lines) as i64;
                        if hpos < hpulse_end || vline < vpulse_end {
                            s -= self.linear_buzz / OVERSAMPLE as f32 / 2.0;
                        }
                    }
                }

                // analog limiter
                s = s.clamp(-1.0, 1.0);

                let hiss = self.params.hiss_level;
                if hiss != 0 {
                    s += (rng.random_range(0..=hiss * 2) - hiss) as f32 / 20000.0;
                }

                if self.params.linear_track && self.params.high_boost > 0.0 {
                    s += self.high_boost[c].highpass(s) * self.params.high_boost;
                }

                if self.params.deemphasis {
                    s = self.deemphasis[c].lowpass(s);
                }

                *sample = (s * 32768.0).clamp(-32768.0, 32767.0) as i16;
            }
            self.sample_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TapeSpeed, VhsParams};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn linear_sp_config() -> Config {
        let mut cfg = Config::default();
        cfg.vhs = Some(VhsParams {
            hifi: false,
            speed: TapeSpeed::Sp,
            ..VhsParams::default()
        });
        cfg.audio.preemphasis = false;
        cfg.audio.deemphasis = false;
        cfg.audio.hiss_db = -120.0;
        cfg.audio.linear_buzz_db = -120.0;
        cfg.audio.high_boost = 0.0;
        cfg.finalize();
        cfg
    }

    fn sine(freq: f32, rate: f32, n: usize, amp: f32) -> Vec<i16> {
        (0..n)
            .map(|t| {
                let x = (std::f32::consts::TAU * freq * t as f32 / rate).sin() * amp;
                (x * 32767.0) as i16
            })
            .collect()
    }

    fn rms(samples: &[i16]) -> f64 {
        let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    #[test]
    fn linear_sp_attenuates_high_frequencies() {
        let rate = 44_100.0;
        let n = 8_820;
        let mut rng = StdRng::seed_from_u64(1);

        let cfg = linear_sp_config();
        let mut chain = AudioChain::new(&cfg);
        let mut hi = sine(18_000.0, rate, n, 0.5);
        chain.process(&mut hi, &mut rng);

        let mut chain = AudioChain::new(&cfg);
        let mut lo = sine(1_000.0, rate, n, 0.5);
        chain.process(&mut lo, &mut rng);

        // skip the warmup half, compare steady state
        let hi_rms = rms(&hi[n / 2..]);
        let lo_rms = rms(&lo[n / 2..]);
        let db = 20.0 * (hi_rms / lo_rms).log10();
        assert!(db <= -20.0, "only {db:.1} dB down");
    }

    #[test]
    fn hiss_silent_at_floor_and_loud_at_zero() {
        let mut rng = StdRng::seed_from_u64(2);

        let mut cfg = linear_sp_config();
        cfg.audio.hiss_db = -120.0;
        cfg.finalize();
        assert_eq!(cfg.audio.hiss_level, 0);
        let mut chain = AudioChain::new(&cfg);
        let mut silent = vec![0i16; 4_410];
        chain.process(&mut silent, &mut rng);
        assert!(silent.iter().all(|&s| s == 0), "noise injected at the floor");

        let mut cfg = linear_sp_config();
        cfg.audio.hiss_db = 0.0;
        cfg.finalize();
        let mut chain = AudioChain::new(&cfg);
        let mut noisy = vec![0i16; 4_410];
        chain.process(&mut noisy, &mut rng);
        let peak = noisy.iter().map(|&s| i32::from(s).abs()).max().unwrap();
        assert!(peak > 8_000, "hiss peak only {peak}");
    }

    #[test]
    fn buzz_only_reaches_linear_tracks() {
        let mut rng = StdRng::seed_from_u64(3);

        let mut cfg = linear_sp_config();
        cfg.audio.linear_buzz_db = -42.0;
        cfg.finalize();
        let mut chain = AudioChain::new(&cfg);
        let mut linear = vec![0i16; 44_100];
        chain.process(&mut linear, &mut rng);
        assert!(linear.iter().any(|&s| s != 0), "no crosstalk on linear track");

        // hi-fi never hears the video signal
        let mut cfg = Config::default();
        cfg.audio.preemphasis = false;
        cfg.audio.deemphasis = false;
        cfg.audio.hiss_db = -120.0;
        cfg.finalize();
        let mut chain = AudioChain::new(&cfg);
        let mut hifi = vec![0i16; 44_100 * 2];
        chain.process(&mut hifi, &mut rng);
        assert!(hifi.iter().all(|&s| s == 0));
    }

    #[test]
    fn limiter_clips_hot_signal_without_wrapping() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut cfg = Config::default();
        cfg.audio.preemphasis = true;
        cfg.audio.deemphasis = false;
        cfg.audio.hiss_db = -120.0;
        cfg.finalize();
        let mut chain = AudioChain::new(&cfg);
        // square wave at nearly full scale, stereo
        let mut samples: Vec<i16> = (0..8_820)
            .flat_map(|t| {
                let v = if (t / 50) % 2 == 0 { 32_000 } else { -32_000 };
                [v, v]
            })
            .collect();
        chain.process(&mut samples, &mut rng);
        assert!(samples.iter().all(|&s| (-32_768..=32_767).contains(&i32::from(s))));
        assert!(samples.iter().any(|&s| s.abs() > 20_000));
    }

    #[test]
    fn deemphasis_tames_preemphasized_highs() {
        let rate = 44_100.0;
        let n = 8_820;
        let mut rng = StdRng::seed_from_u64(5);

        let mut cfg = Config::default();
        cfg.audio.preemphasis = true;
        cfg.audio.deemphasis = true;
        cfg.audio.hiss_db = -120.0;
        cfg.finalize();
        let mut chain = AudioChain::new(&cfg);
        let src = sine(1_000.0, rate, n, 0.25);
        let mut out: Vec<i16> = src.iter().flat_map(|&s| [s, s]).collect();
        chain.process(&mut out, &mut rng);

        let left: Vec<i16> = out.chunks(2).map(|f| f[0]).collect();
        let in_rms = rms(&src[n / 2..]);
        let out_rms = rms(&left[n / 2..]);
        let db = 20.0 * (out_rms / in_rms).log10();
        // matched emphasis roughly cancels at midband
        assert!(db.abs() < 3.0, "midband shifted {db:.1} dB");
    }
}
