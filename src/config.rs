//! Pipeline configuration.
//!
//! The CLI surface collapses into one immutable [`Config`] value before any
//! frame is touched. Presets (VHS, tape speed, Hi-Fi, CATV) are folded in
//! first, explicit flags override them, and the derived quantities (back
//! amplitude, hiss level, audio band limits) are computed last.

use crate::audio::dbfs;
use crate::error::{Result, TranscodeError};

/// Composite sample rate assumed by every video-rate filter: four times
/// the NTSC color subcarrier, 315/88 MHz * 4.
pub const COMPOSITE_RATE: f32 = 315_000_000.0 * 4.0 / 88.0;

/// NTSC color subcarrier, 315/88 MHz.
pub const SUBCARRIER_HZ: f32 = 315_000_000.0 / 88.0;

// ────────────────────────────────────────────────────────────────────────────
// Enumerated options
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TvStandard {
    Ntsc,
    Pal,
}

impl TvStandard {
    pub fn width(self) -> usize {
        720
    }

    pub fn height(self) -> usize {
        match self {
            Self::Ntsc => 480,
            Self::Pal => 576,
        }
    }

    /// Field rate as an exact rational for the encoder collaborator.
    pub fn field_rate(self) -> &'static str {
        match self {
            Self::Ntsc => "60000/1001",
            Self::Pal => "50",
        }
    }

    pub fn field_rate_hz(self) -> f64 {
        match self {
            Self::Ntsc => 60000.0 / 1001.0,
            Self::Pal => 50.0,
        }
    }

    /// Scanlines per field, including the half line.
    pub fn lines_per_field(self) -> f32 {
        match self {
            Self::Ntsc => 262.5,
            Self::Pal => 312.5,
        }
    }

    /// Rows between total and visible lines, times two fields.
    pub fn vsync_hidden_rows(self) -> i64 {
        match self {
            Self::Ntsc => (262 - 240) * 2,
            Self::Pal => (312 - 288) * 2,
        }
    }

    pub fn line_rate_hz(self) -> f32 {
        match self {
            Self::Ntsc => 15_734.0,
            Self::Pal => 15_625.0,
        }
    }

    pub fn total_lines(self) -> u32 {
        match self {
            Self::Ntsc => 525,
            Self::Pal => 625,
        }
    }

    /// Lines of vertical sync at the top of each half frame.
    pub fn vpulse_end(self) -> u32 {
        match self {
            Self::Ntsc => 10,
            Self::Pal => 12,
        }
    }

    /// Horizontal sync pulse width as a fraction of the line period.
    pub fn hpulse_end(self) -> f32 {
        match self {
            Self::Ntsc => self.line_rate_hz() * (4.7 / 1_000_000.0),
            Self::Pal => self.line_rate_hz() * (4.0 / 1_000_000.0),
        }
    }
}

/// Subcarrier phase advance per scanline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanlinePhase {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl ScanlinePhase {
    pub fn from_degrees(deg: u32) -> Result<Self> {
        match deg {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => Err(TranscodeError::InvalidArgument(format!(
                "comp-phase must be 0, 90, 180 or 270 (got {other})"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TapeSpeed {
    Sp,
    Lp,
    Ep,
}

impl TapeSpeed {
    /// Tape-path band limits: (luma cutoff Hz, chroma cutoff Hz, chroma
    /// delay in samples).
    pub fn band_limits(self) -> (f32, f32, usize) {
        match self {
            Self::Sp => (2_400_000.0, 320_000.0, 9),
            Self::Lp => (1_900_000.0, 300_000.0, 12),
            Self::Ep => (1_400_000.0, 280_000.0, 14),
        }
    }

    /// Bundle of noise levels implied by selecting this speed:
    /// (chroma phase noise, chroma noise, chroma loss, luma noise).
    pub fn noise_bundle(self) -> (i32, i32, i32, i32) {
        match self {
            Self::Sp => (4, 16, 4, 4),
            Self::Lp => (5, 19, 6, 5),
            Self::Ep => (6, 22, 8, 6),
        }
    }

    /// Linear audio track passband (highpass Hz, lowpass Hz).
    pub fn linear_audio_band(self) -> (f32, f32) {
        match self {
            Self::Sp => (100.0, 10_000.0),
            Self::Lp => (100.0, 7_000.0),
            Self::Ep => (100.0, 4_000.0),
        }
    }
}

/// CATV distribution presets, modeled as composite preemphasis plus a dose
/// of chroma phase noise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatvPreset {
    Catv1,
    Catv2,
    Catv3,
    Catv4,
}

impl CatvPreset {
    /// (preemphasis scale, preemphasis cutoff Hz, chroma phase noise).
    pub fn params(self) -> (f32, f32, i32) {
        match self {
            Self::Catv1 => (7.0, SUBCARRIER_HZ, 2),
            Self::Catv2 => (15.0, SUBCARRIER_HZ, 4),
            Self::Catv3 => (25.0, SUBCARRIER_HZ * 2.0, 6),
            Self::Catv4 => (40.0, SUBCARRIER_HZ * 4.0, 6),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Parameter groups
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct CompositeParams {
    pub phase: ScanlinePhase,
    pub phase_offset: i32,
    pub preemphasis: f32,
    pub preemphasis_cut: f32,
    pub subcarrier_amplitude: i32,
    pub subcarrier_amplitude_back: i32,
    pub in_chroma_lowpass: bool,
    pub out_chroma_lowpass: bool,
    pub out_chroma_lowpass_lite: bool,
    pub nocolor_subcarrier: bool,
    pub nocolor_subcarrier_after_yc_sep: bool,
    pub yc_recombine: u32,
}

impl Default for CompositeParams {
    fn default() -> Self {
        Self {
            phase: ScanlinePhase::Deg180,
            phase_offset: 0,
            preemphasis: 0.0,
            preemphasis_cut: 1_000_000.0,
            subcarrier_amplitude: 50,
            subcarrier_amplitude_back: 50,
            in_chroma_lowpass: true,
            out_chroma_lowpass: true,
            out_chroma_lowpass_lite: true,
            nocolor_subcarrier: false,
            nocolor_subcarrier_after_yc_sep: false,
            yc_recombine: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NoiseParams {
    pub video_noise: i32,
    pub chroma_noise: i32,
    pub chroma_phase_noise: i32,
    /// Per-row chroma dropout probability, out of 100000.
    pub chroma_loss: i32,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            video_noise: 2,
            chroma_noise: 0,
            chroma_phase_noise: 0,
            chroma_loss: 0,
        }
    }
}

/// Head-switching line shift near the bottom of each field.
#[derive(Clone, Copy, Debug)]
pub struct HeadSwitching {
    /// Vertical switch point, fraction of a field.
    pub point: f32,
    /// Horizontal displacement, fraction of a field.
    pub phase: f32,
    /// Random variation added to both, per field.
    pub noise_level: f32,
}

impl Default for HeadSwitching {
    fn default() -> Self {
        // a few scanlines up from vsync, with the slight error real decks have
        Self {
            point: 1.0 - ((4.5 + 0.01) / 262.5),
            phase: (1.0 - 0.01) / 262.5,
            noise_level: (1.0 / 500.0) / 262.5,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct VhsParams {
    pub speed: TapeSpeed,
    pub hifi: bool,
    pub svideo_out: bool,
    pub chroma_vert_blend: bool,
    pub sharpen: f32,
}

impl Default for VhsParams {
    fn default() -> Self {
        Self {
            speed: TapeSpeed::Sp,
            hifi: true,
            svideo_out: false,
            chroma_vert_blend: true,
            sharpen: 1.5,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AudioParams {
    pub channels: usize,
    pub rate: u32,
    pub lowpass_hz: f32,
    pub highpass_hz: f32,
    pub band_passes: usize,
    pub preemphasis: bool,
    pub deemphasis: bool,
    pub emphasis_cut_hz: f32,
    pub hiss_db: f32,
    /// Precomputed hiss amplitude, out of 10000.
    pub hiss_level: i32,
    /// Crosstalk buzz loudness in dBFS; only audible on linear tracks.
    pub linear_buzz_db: f32,
    pub high_boost: f32,
    /// True when audio rides the linear track rather than Hi-Fi heads.
    pub linear_track: bool,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            channels: 2,
            rate: 44_100,
            lowpass_hz: 20_000.0,
            highpass_hz: 20.0,
            band_passes: 6,
            preemphasis: true,
            deemphasis: true,
            emphasis_cut_hz: 16_000.0,
            hiss_db: -72.0,
            hiss_level: 0,
            linear_buzz_db: -42.0,
            high_boost: 0.25,
            linear_track: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Top-level config
// ────────────────────────────────────────────────────────────────────────────

/// Immutable pipeline configuration, fully resolved before any frame is
/// processed.
#[derive(Clone, Debug)]
pub struct Config {
    pub tv: TvStandard,
    pub frame_delay: usize,
    pub composite: CompositeParams,
    pub noise: NoiseParams,
    pub head_switching: Option<HeadSwitching>,
    pub vhs: Option<VhsParams>,
    pub audio: AudioParams,
    pub emulate_video: bool,
    pub emulate_audio: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tv: TvStandard::Ntsc,
            frame_delay: 1,
            composite: CompositeParams::default(),
            noise: NoiseParams::default(),
            head_switching: None,
            vhs: None,
            audio: AudioParams::default(),
            emulate_video: true,
            emulate_audio: true,
        }
    }
}

impl Config {
    pub fn width(&self) -> usize {
        self.tv.width()
    }

    pub fn height(&self) -> usize {
        self.tv.height()
    }

    /// Fold in the derived quantities that depend on other options: the
    /// demodulation back-amplitude under preemphasis, the integer hiss
    /// level, and the audio passband for the selected tape mode.
    pub fn finalize(&mut self) {
        let c = &mut self.composite;
        c.subcarrier_amplitude_back = c.subcarrier_amplitude;
        if c.preemphasis != 0.0 && c.preemphasis_cut > 0.0 {
            c.subcarrier_amplitude_back +=
                ((50.0 * c.preemphasis * SUBCARRIER_HZ) / (2.0 * c.preemphasis_cut)) as i32;
        }

        match self.vhs {
            Some(vhs) if !vhs.hifi => {
                let (hp, lp) = vhs.speed.linear_audio_band();
                self.audio.highpass_hz = hp;
                self.audio.lowpass_hz = lp;
                self.audio.channels = 1;
                self.audio.linear_track = true;
                self.audio.emphasis_cut_hz = 8_000.0;
            }
            _ => {
                self.audio.highpass_hz = 20.0;
                self.audio.lowpass_hz = 20_000.0;
                self.audio.channels = 2;
                self.audio.linear_track = false;
                self.audio.emphasis_cut_hz = 16_000.0;
            }
        }

        self.audio.hiss_level = (dbfs(self.audio.hiss_db) * 5000.0) as i32;
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=256).contains(&self.frame_delay) {
            return Err(TranscodeError::InvalidArgument(format!(
                "delay must be 1..256 (got {})",
                self.frame_delay
            )));
        }
        if !(0..=100).contains(&self.composite.subcarrier_amplitude) {
            return Err(TranscodeError::InvalidArgument(format!(
                "subcarrier-amp must be 0..100 (got {})",
                self.composite.subcarrier_amplitude
            )));
        }
        for (name, value) in [
            ("noise", self.noise.video_noise),
            ("chroma-noise", self.noise.chroma_noise),
            ("chroma-phase-noise", self.noise.chroma_phase_noise),
        ] {
            if value < 0 {
                return Err(TranscodeError::InvalidArgument(format!(
                    "{name} must not be negative (got {value})"
                )));
            }
        }
        if !(0..=10_000).contains(&self.noise.chroma_loss) {
            return Err(TranscodeError::InvalidArgument(format!(
                "chroma-dropout must be 0..10000 (got {})",
                self.noise.chroma_loss
            )));
        }
        if !(-120.0..=0.0).contains(&self.audio.hiss_db) {
            return Err(TranscodeError::InvalidArgument(format!(
                "audio-hiss must be -120..0 (got {})",
                self.audio.hiss_db
            )));
        }
        if self.composite.preemphasis != 0.0 && self.composite.preemphasis_cut <= 0.0 {
            return Err(TranscodeError::InvalidParameter(
                "comp-cut must be positive".into(),
            ));
        }
        if let Some(hs) = &self.head_switching {
            if !(0.0..=1.0).contains(&hs.point) {
                return Err(TranscodeError::InvalidArgument(format!(
                    "vhs-head-switching-point must be 0..1 (got {})",
                    hs.point
                )));
            }
            if !(-1.0..=1.0).contains(&hs.phase) {
                return Err(TranscodeError::InvalidArgument(format!(
                    "vhs-head-switching-phase must be -1..1 (got {})",
                    hs.phase
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut cfg = Config::default();
        cfg.finalize();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.composite.subcarrier_amplitude_back, 50);
        assert_eq!(cfg.audio.channels, 2);
    }

    #[test]
    fn preemphasis_raises_back_amplitude() {
        let mut cfg = Config::default();
        cfg.composite.preemphasis = 7.0;
        cfg.composite.preemphasis_cut = SUBCARRIER_HZ;
        cfg.finalize();
        // 50 + 50 * 7 / 2
        assert_eq!(cfg.composite.subcarrier_amplitude_back, 50 + 175);
    }

    #[test]
    fn linear_vhs_narrows_audio_to_mono() {
        let mut cfg = Config::default();
        cfg.vhs = Some(VhsParams {
            hifi: false,
            speed: TapeSpeed::Ep,
            ..VhsParams::default()
        });
        cfg.finalize();
        assert_eq!(cfg.audio.channels, 1);
        assert!(cfg.audio.linear_track);
        assert_eq!(cfg.audio.lowpass_hz, 4_000.0);
        assert_eq!(cfg.audio.highpass_hz, 100.0);
        assert_eq!(cfg.audio.emphasis_cut_hz, 8_000.0);
    }

    #[test]
    fn hiss_level_scales_from_dbfs() {
        let mut cfg = Config::default();
        cfg.audio.hiss_db = 0.0;
        cfg.finalize();
        assert_eq!(cfg.audio.hiss_level, 5000);

        cfg.audio.hiss_db = -120.0;
        cfg.finalize();
        assert_eq!(cfg.audio.hiss_level, 0);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut cfg = Config::default();
        cfg.frame_delay = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.composite.subcarrier_amplitude = 101;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.noise.chroma_loss = 20_000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.head_switching = Some(HeadSwitching {
            point: 1.5,
            ..HeadSwitching::default()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn catv_presets_scale_up() {
        let (pre1, cut1, pn1) = CatvPreset::Catv1.params();
        let (pre4, cut4, pn4) = CatvPreset::Catv4.params();
        assert_eq!(pre1, 7.0);
        assert_eq!(pn1, 2);
        assert_eq!(pre4, 40.0);
        assert_eq!(pn4, 6);
        assert!(cut4 > cut1);
    }

    #[test]
    fn tape_speed_tables() {
        let (luma, chroma, delay) = TapeSpeed::Ep.band_limits();
        assert_eq!(luma, 1_400_000.0);
        assert_eq!(chroma, 280_000.0);
        assert_eq!(delay, 14);
        assert_eq!(TapeSpeed::Lp.noise_bundle(), (5, 19, 6, 5));
    }
}
