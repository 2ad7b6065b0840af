//! Composite chroma pipeline.
//!
//! The path a frame takes through a composite connection: chroma is
//! band-limited, modulated onto a fake subcarrier riding in the luma
//! plane, degraded (preemphasis ringing, snow, head-switching shear),
//! then demodulated back out with a box-blur Y/C separator. Everything
//! runs per scanline of the current field; filter state never crosses
//! rows.
//!
//! The subcarrier is sampled at exactly four samples per cycle, so the
//! two quadrature carriers collapse to the amplitude tables `U_MULT` and
//! `V_MULT` indexed by `(xi + x) & 3`, where `xi` is the scanline phase.

use rand::Rng;
use rayon::prelude::*;

use crate::config::{HeadSwitching, ScanlinePhase, TvStandard, COMPOSITE_RATE};
use crate::filter::LowpassFilter;
use crate::yiq::FieldBuffer;

const U_MULT: [i32; 4] = [1, 0, -1, 0];
const V_MULT: [i32; 4] = [0, 1, 0, -1];

/// Subcarrier phase for one scanline, as an offset 0..4 into the
/// amplitude tables.
#[inline]
pub fn scanline_xi(phase: ScanlinePhase, offset: i32, fieldno: u64, row: usize) -> usize {
    let f = fieldno as i64;
    let o = i64::from(offset);
    let y = row as i64;
    let xi = match phase {
        ScanlinePhase::Deg90 => (f + o + (y >> 1)) & 3,
        ScanlinePhase::Deg180 => (((f + y) & 2) + o) & 3,
        ScanlinePhase::Deg270 => (f + o - (y >> 1)) & 3,
        ScanlinePhase::Deg0 => o & 3,
    };
    xi as usize
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChromaLowpass {
    /// Broadcast bandwidth: 1.3 MHz for I, 0.6 MHz for Q.
    Full,
    /// What a TV set does to tame fringes: 2.6 MHz on both planes.
    Lite,
}

/// Three cascaded one-pole lowpass sections over one row, writing the
/// output `delay` samples early to compensate the group delay.
pub(crate) fn lowpass_row_cascade3(row: &mut [i32], cutoff: f32, delay: usize) {
    let mut lp = [LowpassFilter::new(COMPOSITE_RATE, cutoff); 3];
    for f in &mut lp {
        f.reset(0.0);
    }
    for x in 0..row.len() {
        let mut s = row[x] as f32;
        for f in &mut lp {
            s = f.lowpass(s);
        }
        if x >= delay {
            row[x - delay] = s as i32;
        }
    }
}

/// Band-limit the chroma planes of one field. Composite video gives color
/// far less bandwidth than luma.
pub fn chroma_lowpass(fb: &mut FieldBuffer, field: usize, mode: ChromaLowpass) {
    let width = fb.width;
    for (plane, is_i) in [(&mut fb.i, true), (&mut fb.q, false)] {
        let (cutoff, delay) = match (mode, is_i) {
            (ChromaLowpass::Full, true) => (1_300_000.0, 2),
            (ChromaLowpass::Full, false) => (600_000.0, 4),
            (ChromaLowpass::Lite, _) => (2_600_000.0, 1),
        };
        plane
            .par_chunks_mut(width)
            .skip(field)
            .step_by(2)
            .for_each(|row| lowpass_row_cascade3(row, cutoff, delay));
    }
}

/// Mix I and Q into Y at quadrature and zero the chroma planes. The
/// planes stay zeroed until [`chroma_from_luma`] recovers them.
pub fn chroma_into_luma(
    fb: &mut FieldBuffer,
    field: usize,
    fieldno: u64,
    phase: ScanlinePhase,
    phase_offset: i32,
    amplitude: i32,
) {
    let width = fb.width;
    for y in (field..fb.height).step_by(2) {
        let xi = scanline_xi(phase, phase_offset, fieldno, y);
        let base = y * width;
        for x in 0..width {
            let sxi = (xi + x) & 3;
            let chroma =
                fb.i[base + x] * amplitude * U_MULT[sxi] + fb.q[base + x] * amplitude * V_MULT[sxi];
            fb.y[base + x] += chroma / 50;
            fb.i[base + x] = 0;
            fb.q[base + x] = 0;
        }
    }
}

/// Recover I and Q from the subcarrier left in Y.
///
/// A 4-tap box blur separates filtered luma from the chroma residual,
/// the residual's negative quadrants are folded back, and the two
/// components are demultiplexed at even positions with odd positions
/// linearly interpolated. `discard_chroma` runs the separation but
/// leaves the chroma planes zeroed.
pub fn chroma_from_luma(
    fb: &mut FieldBuffer,
    field: usize,
    fieldno: u64,
    phase: ScanlinePhase,
    phase_offset: i32,
    amplitude: i32,
    discard_chroma: bool,
) {
    let width = fb.width;
    if width < 2 {
        return;
    }
    let mut chroma = vec![0i32; width];

    for y in (field..fb.height).step_by(2) {
        let base = y * width;
        let yrow = &mut fb.y[base..base + width];

        // precharge by 2 samples to center the box blur
        let mut delay = [0i32, 0, yrow[0], yrow[1]];
        let mut sum: i32 = delay[2] + delay[3];
        for x in 0..width {
            let c = if x + 2 < width { yrow[x + 2] } else { 0 };
            sum -= delay[0];
            delay[0] = delay[1];
            delay[1] = delay[2];
            delay[2] = delay[3];
            delay[3] = c;
            sum += c;
            yrow[x] = sum / 4;
            chroma[x] = c - yrow[x];
        }

        if discard_chroma {
            continue;
        }

        let irow = &mut fb.i[base..base + width];
        let qrow = &mut fb.q[base..base + width];

        if amplitude <= 0 {
            irow.fill(0);
            qrow.fill(0);
            continue;
        }

        let xi = scanline_xi(phase, phase_offset, fieldno, y);

        // fold the part of the sine wave that carried negative U and V
        let mut x = (4 - xi) & 3;
        while x + 3 < width {
            chroma[x + 2] = -chroma[x + 2];
            chroma[x + 3] = -chroma[x + 3];
            x += 4;
        }

        for c in chroma.iter_mut() {
            *c = *c * 50 / amplitude;
        }

        let mut x = 0;
        while x + xi + 1 < width {
            irow[x] = -chroma[x + xi];
            qrow[x] = -chroma[x + xi + 1];
            x += 2;
        }
        while x < width {
            irow[x] = 0;
            qrow[x] = 0;
            x += 2;
        }
        let mut x = 0;
        while x + 2 < width {
            irow[x + 1] = (irow[x] + irow[x + 2]) >> 1;
            qrow[x + 1] = (qrow[x] + qrow[x + 2]) >> 1;
            x += 2;
        }
        while x < width {
            irow[x] = 0;
            qrow[x] = 0;
            x += 1;
        }
    }
}

/// High-frequency boost on the modulated signal, the kind CATV plants and
/// cheap modulators leave behind as edge ringing.
pub fn composite_preemphasis(fb: &mut FieldBuffer, field: usize, scale: f32, cut_hz: f32) {
    let width = fb.width;
    fb.y
        .par_chunks_mut(width)
        .skip(field)
        .step_by(2)
        .for_each(|yrow| {
            let mut pre = LowpassFilter::new(COMPOSITE_RATE, cut_hz);
            pre.reset(16.0);
            for v in yrow.iter_mut() {
                let mut s = *v as f32;
                s += pre.highpass(s) * scale;
                *v = s as i32;
            }
        });
}

/// Random-walk snow on the luma plane. The walk restarts on every row.
pub fn luma_noise(fb: &mut FieldBuffer, field: usize, rng: &mut impl Rng, amplitude: i32) {
    let width = fb.width;
    for y in (field..fb.height).step_by(2) {
        let base = y * width;
        let mut noise = 0i32;
        for v in fb.y[base..base + width].iter_mut() {
            noise += rng.random_range(-amplitude..=amplitude);
            noise /= 2;
            *v += noise;
        }
    }
}

/// Random-walk noise on both chroma planes, independent walks per plane,
/// restarting on every row.
pub fn chroma_noise(fb: &mut FieldBuffer, field: usize, rng: &mut impl Rng, amplitude: i32) {
    let width = fb.width;
    for y in (field..fb.height).step_by(2) {
        let base = y * width;
        let mut noise_u = 0i32;
        let mut noise_v = 0i32;
        for x in 0..width {
            noise_u += rng.random_range(-amplitude..=amplitude);
            noise_u /= 2;
            noise_v += rng.random_range(-amplitude..=amplitude);
            noise_v /= 2;
            fb.i[base + x] += noise_u;
            fb.q[base + x] += noise_v;
        }
    }
}

/// Rotate the chroma vector of each scanline by a slowly walking angle.
/// The walk persists across rows of the field and halves every row, so
/// hue wander is correlated vertically.
pub fn chroma_phase_noise(fb: &mut FieldBuffer, field: usize, rng: &mut impl Rng, amplitude: i32) {
    let width = fb.width;
    let mut noise = 0i32;
    for y in (field..fb.height).step_by(2) {
        noise += rng.random_range(-amplitude..=amplitude);
        noise /= 2;
        let theta = noise as f32 * std::f32::consts::PI / 100.0;
        let (sin_t, cos_t) = theta.sin_cos();
        let base = y * width;
        for x in 0..width {
            let u = fb.i[base + x] as f32;
            let v = fb.q[base + x] as f32;
            fb.i[base + x] = (u * cos_t - v * sin_t) as i32;
            fb.q[base + x] = (u * sin_t + v * cos_t) as i32;
        }
    }
}

/// Whole-scanline chroma dropouts: each row of the field loses its color
/// with probability `loss / 100000`.
pub fn chroma_dropout(fb: &mut FieldBuffer, field: usize, rng: &mut impl Rng, loss: i32) {
    for y in (field..fb.height).step_by(2) {
        if rng.random_range(0..100_000) < loss {
            let row = fb.row_range(y);
            fb.i[row.clone()].fill(0);
            fb.q[row].fill(0);
        }
    }
}

/// Helical-scan head change: the last scanlines of the field shear
/// horizontally, and the shear decays by 7/8 per row pair going down.
///
/// The shift wraps over a virtual line width of `W + W/10`, standing in
/// for the horizontal blanking interval that is not part of the visible
/// buffer.
pub fn head_switching(
    fb: &mut FieldBuffer,
    field: usize,
    tv: TvStandard,
    hs: &HeadSwitching,
    rng: &mut impl Rng,
) {
    let width = fb.width;
    let twidth = width + width / 10;

    let mut noise = 0.0f32;
    if hs.noise_level != 0.0 {
        noise = (rng.random::<f32>() * 2.0 - 1.0) * hs.noise_level;
    }

    let t = twidth as f32 * tv.lines_per_field();

    let p = ((hs.point + noise).rem_euclid(1.0) * t) as i64;
    let mut y = (p / twidth as i64) * 2 + field as i64;

    let p = ((hs.phase + noise).rem_euclid(1.0) * t) as i64;
    let x = (p % twidth as i64) as usize;

    y -= tv.vsync_hidden_rows();

    let ishif: i32 = if x >= twidth / 2 {
        x as i32 - twidth as i32
    } else {
        x as i32
    };
    let mut shif: i32 = 0;
    let mut tx = x;
    let mut shy = 0u32;
    let mut tmp = vec![0i32; twidth];

    while y < fb.height as i64 {
        if y >= 0 {
            let base = (y as usize) * width;
            let yrow = &mut fb.y[base..base + width];
            if shif != 0 {
                // the chroma subcarrier is riding in luma, so shifting Y
                // shears the color along with it
                let mut x2 = ((tx + twidth) as i64 + i64::from(shif)) as usize % twidth;
                tmp.fill(0);
                tmp[..width].copy_from_slice(yrow);
                for slot in yrow[tx..].iter_mut() {
                    *slot = tmp[x2];
                    x2 += 1;
                    if x2 == twidth {
                        x2 = 0;
                    }
                }
            }
        }

        shif = if shy == 0 { ishif } else { shif * 7 / 8 };
        tx = 0;
        y += 2;
        shy += 1;
    }
}
