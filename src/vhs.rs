//! VHS tape-path artifacts.
//!
//! The color-under system stores luma FM and chroma at a far lower
//! bandwidth than broadcast, delays the chroma relative to luma, smears
//! it vertically through the deck's 1H delay line, and sharpens luma on
//! playback. Composite output decks then push the whole thing through
//! one more subcarrier round trip.

use rayon::prelude::*;

use crate::composite::{self, lowpass_row_cascade3};
use crate::config::{CompositeParams, VhsParams, COMPOSITE_RATE};
use crate::filter::LowpassFilter;
use crate::yiq::FieldBuffer;

/// Run the full tape pass over one field.
pub fn vhs_pass(
    fb: &mut FieldBuffer,
    field: usize,
    fieldno: u64,
    vhs: &VhsParams,
    composite: &CompositeParams,
    ntsc: bool,
) {
    let (luma_cut, chroma_cut, chroma_delay) = vhs.speed.band_limits();

    luma_lowpass(fb, field, luma_cut);
    chroma_lowpass(fb, field, chroma_cut, chroma_delay);

    if vhs.chroma_vert_blend && ntsc {
        chroma_vert_blend(fb, field);
    }

    sharpen(fb, field, luma_cut, vhs.sharpen);

    if !vhs.svideo_out {
        composite::chroma_into_luma(
            fb,
            field,
            fieldno,
            composite.phase,
            composite.phase_offset,
            composite.subcarrier_amplitude,
        );
        composite::chroma_from_luma(
            fb,
            field,
            fieldno,
            composite.phase,
            composite.phase_offset,
            composite.subcarrier_amplitude,
            false,
        );
    }
}

/// Tape luma band limit with a mild preemphasis added back, which is why
/// VHS edges ring the way they do.
fn luma_lowpass(fb: &mut FieldBuffer, field: usize, luma_cut: f32) {
    let width = fb.width;
    fb.y
        .par_chunks_mut(width)
        .skip(field)
        .step_by(2)
        .for_each(|yrow| {
            let mut lp = [LowpassFilter::new(COMPOSITE_RATE, luma_cut); 3];
            for f in &mut lp {
                f.reset(16.0);
            }
            let mut pre = LowpassFilter::new(COMPOSITE_RATE, luma_cut);
            pre.reset(16.0);
            for v in yrow.iter_mut() {
                let mut s = *v as f32;
                for f in &mut lp {
                    s = f.lowpass(s);
                }
                s += pre.highpass(s) * 1.6;
                *v = s as i32;
            }
        });
}

/// Color-under chroma band limit; the output lands `chroma_delay`
/// samples early to undo the filter group delay.
fn chroma_lowpass(fb: &mut FieldBuffer, field: usize, chroma_cut: f32, chroma_delay: usize) {
    let width = fb.width;
    for plane in [&mut fb.i, &mut fb.q] {
        plane
            .par_chunks_mut(width)
            .skip(field)
            .step_by(2)
            .for_each(|row| lowpass_row_cascade3(row, chroma_cut, chroma_delay));
    }
}

/// 1H delay-line blend: every chroma row is averaged with the previous
/// row's pre-blend chroma. The deck lines subcarrier phase up between
/// scanlines, which is what makes the summation constructive.
fn chroma_vert_blend(fb: &mut FieldBuffer, field: usize) {
    let width = fb.width;
    if field >= fb.height {
        return;
    }
    let first = field * width;
    let mut delay_i = fb.i[first..first + width].to_vec();
    let mut delay_q = fb.q[first..first + width].to_vec();

    for y in ((field + 2)..fb.height).step_by(2) {
        let base = y * width;
        for x in 0..width {
            let ci = fb.i[base + x];
            let cq = fb.q[base + x];
            fb.i[base + x] = (delay_i[x] + ci + 1) >> 1;
            fb.q[base + x] = (delay_q[x] + cq + 1) >> 1;
            delay_i[x] = ci;
            delay_q[x] = cq;
        }
    }
}

/// Playback peaking: boost luma by its distance from a heavily lowpassed
/// copy.
fn sharpen(fb: &mut FieldBuffer, field: usize, luma_cut: f32, gain: f32) {
    let width = fb.width;
    fb.y
        .par_chunks_mut(width)
        .skip(field)
        .step_by(2)
        .for_each(|yrow| {
            let mut lp = [LowpassFilter::new(COMPOSITE_RATE, luma_cut * 4.0); 3];
            for f in &mut lp {
                f.reset(0.0);
            }
            for v in yrow.iter_mut() {
                let s = *v as f32;
                let mut ts = s;
                for f in &mut lp {
                    ts = f.lowpass(ts);
                }
                *v = (s + (s - ts) * gain * 2.0) as i32;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompositeParams, TapeSpeed, VhsParams};

    #[test]
    fn vert_blend_averages_with_previous_row() {
        let width = 16;
        let mut fb = FieldBuffer::new(width, 8);
        // rows 0, 2, 4, 6 of field 0 get chroma 100, 200, 300, 400
        for (n, y) in (0..8).step_by(2).enumerate() {
            let v = 100 * (n as i32 + 1);
            let r = fb.row_range(y);
            fb.i[r.clone()].fill(v);
            fb.q[r].fill(v);
        }
        chroma_vert_blend(&mut fb, 0);

        assert!(fb.i[fb.row_range(0)].iter().all(|&v| v == 100));
        assert!(fb.i[fb.row_range(2)].iter().all(|&v| v == (100 + 200 + 1) >> 1));
        assert!(fb.i[fb.row_range(4)].iter().all(|&v| v == (200 + 300 + 1) >> 1));
        assert!(fb.i[fb.row_range(6)].iter().all(|&v| v == (300 + 400 + 1) >> 1));
        // odd field untouched
        assert!(fb.i[fb.row_range(1)].iter().all(|&v| v == 0));
    }

    #[test]
    fn vert_blend_raises_row_correlation() {
        let width = 64;
        let mut fb = FieldBuffer::new(width, 8);
        // alternate strongly between field rows
        for (n, y) in (0..8).step_by(2).enumerate() {
            let v = if n % 2 == 0 { 8_000 } else { -8_000 };
            let r = fb.row_range(y);
            fb.i[r].fill(v);
        }
        chroma_vert_blend(&mut fb, 0);
        // rows that alternated at full swing now overlap in range
        let r2 = fb.i[fb.row_range(2)][0];
        let r4 = fb.i[fb.row_range(4)][0];
        assert!((r2 - r4).abs() < 8_000, "rows still swing {r2} vs {r4}");
    }

    #[test]
    fn sharpen_rings_around_a_pulse() {
        let width = 255;
        let mut fb = FieldBuffer::new(width, 2);
        for x in 0..width {
            fb.y[x] = if (85..170).contains(&x) { 24_000 } else { 8_000 };
        }
        sharpen(&mut fb, 0, 2_400_000.0, 1.5);
        let peak = *fb.y[..width].iter().max().unwrap();
        let dip = *fb.y[..width].iter().min().unwrap();
        assert!(peak > 24_000, "no overshoot, peak {peak}");
        assert!(dip < 8_000, "no undershoot, dip {dip}");
    }

    #[test]
    fn tape_speed_softens_more_at_ep() {
        let width = 256;
        let edge = |speed: TapeSpeed| {
            let mut fb = FieldBuffer::new(width, 2);
            for x in 0..width {
                fb.y[x] = if x < width / 2 { 0 } else { 25_600 };
            }
            let (cut, _, _) = speed.band_limits();
            luma_lowpass(&mut fb, 0, cut);
            // width of the transition band after filtering
            fb.y[..width]
                .iter()
                .filter(|&&v| v > 2_560 && v < 23_000)
                .count()
        };
        assert!(edge(TapeSpeed::Ep) > edge(TapeSpeed::Sp));
    }

    #[test]
    fn svideo_skips_the_subcarrier_round_trip() {
        let width = 128;
        let mut base = FieldBuffer::new(width, 2);
        base.y.fill(20_000);
        base.i.fill(4_000);
        base.q.fill(-4_000);

        let mut svideo = base.clone();
        let vhs = VhsParams {
            svideo_out: true,
            chroma_vert_blend: false,
            ..VhsParams::default()
        };
        vhs_pass(&mut svideo, 0, 0, &vhs, &CompositeParams::default(), true);

        let mut comp = base.clone();
        let vhs = VhsParams {
            svideo_out: false,
            chroma_vert_blend: false,
            ..VhsParams::default()
        };
        vhs_pass(&mut comp, 0, 0, &vhs, &CompositeParams::default(), true);

        // the composite round trip leaves box-blur edge damage the
        // s-video path does not have
        assert_ne!(&svideo.y[..8], &comp.y[..8]);
    }
}
