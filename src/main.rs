//! Composite/VHS video transcoder.
//!
//! Decodes input video through an ffmpeg collaborator, pushes every
//! field through the composite and tape emulation chain, and encodes
//! the result at field rate. Audio takes a parallel trip through the
//! tape audio chain and is muxed in at the end.

mod audio;
mod composite;
mod compositor;
mod config;
mod error;
mod ffio;
mod filter;
mod vhs;
mod yiq;

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::audio::AudioChain;
use crate::compositor::{FieldCompositor, Layer};
use crate::config::{
    CatvPreset, Config, HeadSwitching, NoiseParams, ScanlinePhase, TapeSpeed, TvStandard,
    VhsParams,
};
use crate::error::TranscodeError;

/// Interrupts accumulate; the first asks for a soft stop at the next
/// field boundary, and piling up this many hard-aborts the process.
const HARD_ABORT_SIGNALS: usize = 20;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TvStdArg {
    Ntsc,
    Pal,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SpeedArg {
    Sp,
    Lp,
    Ep,
}

impl From<SpeedArg> for TapeSpeed {
    fn from(s: SpeedArg) -> Self {
        match s {
            SpeedArg::Sp => TapeSpeed::Sp,
            SpeedArg::Lp => TapeSpeed::Lp,
            SpeedArg::Ep => TapeSpeed::Ep,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CLI surface
// ────────────────────────────────────────────────────────────────────────────

/// Composite signal path options.
#[derive(clap::Args, Clone)]
struct CompositeArgs {
    /// Subcarrier phase advance per scanline, degrees (0, 90, 180, 270)
    #[arg(long = "comp-phase", default_value_t = 180)]
    comp_phase: u32,
    /// Integer offset added to the scanline phase
    #[arg(long = "comp-phase-offset", default_value_t = 0)]
    comp_phase_offset: i32,
    /// Composite preemphasis scale
    #[arg(long = "comp-pre")]
    comp_pre: Option<f32>,
    /// Composite preemphasis cutoff frequency, Hz
    #[arg(long = "comp-cut")]
    comp_cut: Option<f32>,
    /// Composite preemphasis preset, as if CATV #1
    #[arg(long = "comp-catv")]
    comp_catv: bool,
    /// Composite preemphasis preset, as if CATV #2
    #[arg(long = "comp-catv2")]
    comp_catv2: bool,
    /// Composite preemphasis preset, as if CATV #3
    #[arg(long = "comp-catv3")]
    comp_catv3: bool,
    /// Composite preemphasis preset, as if CATV #4
    #[arg(long = "comp-catv4")]
    comp_catv4: bool,
    /// Subcarrier amplitude, 0 to 100 percent of luma
    #[arg(long = "subcarrier-amp")]
    subcarrier_amp: Option<i32>,
    /// Chroma lowpass on composite in (0|1)
    #[arg(long = "in-composite-lowpass")]
    in_composite_lowpass: Option<u8>,
    /// Chroma lowpass on composite out (0|1)
    #[arg(long = "out-composite-lowpass")]
    out_composite_lowpass: Option<u8>,
    /// Lighter TV-style chroma lowpass on composite out (0|1)
    #[arg(long = "out-composite-lowpass-lite")]
    out_composite_lowpass_lite: Option<u8>,
    /// Emulate the color subcarrier but never decode it back (debug)
    #[arg(long = "nocolor-subcarrier")]
    nocolor_subcarrier: bool,
    /// Run Y/C separation but discard the recovered chroma (debug)
    #[arg(long = "nocolor-subcarrier-after-yc-sep")]
    nocolor_subcarrier_after_yc_sep: bool,
    /// Extra Y/C recombine round trips
    #[arg(long = "yc-recomb", default_value_t = 0)]
    yc_recomb: u32,
}

/// Noise injection options.
#[derive(clap::Args, Clone)]
struct NoiseArgs {
    /// Luma noise amplitude
    #[arg(long)]
    noise: Option<i32>,
    /// Chroma noise amplitude
    #[arg(long = "chroma-noise")]
    chroma_noise: Option<i32>,
    /// Chroma phase noise amplitude
    #[arg(long = "chroma-phase-noise")]
    chroma_phase_noise: Option<i32>,
    /// Chroma scanline dropouts, 0 to 10000
    #[arg(long = "chroma-dropout")]
    chroma_dropout: Option<i32>,
}

/// VHS tape-path options.
#[derive(clap::Args, Clone)]
struct VhsArgs {
    /// Emulate VHS artifacts
    #[arg(long)]
    vhs: bool,
    /// Tape speed (implies --vhs)
    #[arg(long = "vhs-speed")]
    vhs_speed: Option<SpeedArg>,
    /// Hi-Fi audio tracks (0|1, implies --vhs)
    #[arg(long = "vhs-hifi")]
    vhs_hifi: Option<u8>,
    /// Take luma and chroma out over S-Video instead of composite (0|1)
    #[arg(long = "vhs-svideo")]
    vhs_svideo: Option<u8>,
    /// Vertically blend chroma scanlines as the deck's delay line does (0|1)
    #[arg(long = "vhs-chroma-vblend")]
    vhs_chroma_vblend: Option<u8>,
    /// High-frequency boost on linear track playback
    #[arg(long = "vhs-linear-high-boost")]
    vhs_linear_high_boost: Option<f32>,
    /// Video crosstalk buzz loudness in the audio, dBFS
    #[arg(long = "vhs-linear-video-crosstalk")]
    vhs_linear_video_crosstalk: Option<f32>,
    /// Head switching emulation (0|1)
    #[arg(long = "vhs-head-switching")]
    vhs_head_switching: Option<u8>,
    /// Head switching point, 0 to 1
    #[arg(long = "vhs-head-switching-point")]
    vhs_head_switching_point: Option<f32>,
    /// Head switching displacement, -1 to 1
    #[arg(long = "vhs-head-switching-phase")]
    vhs_head_switching_phase: Option<f32>,
    /// Head switching point/phase variation per field
    #[arg(long = "vhs-head-switching-noise-level")]
    vhs_head_switching_noise_level: Option<f32>,
}

/// Audio chain options.
#[derive(clap::Args, Clone)]
struct AudioArgs {
    /// Record preemphasis (0|1)
    #[arg(long)]
    preemphasis: Option<u8>,
    /// Playback deemphasis (0|1)
    #[arg(long)]
    deemphasis: Option<u8>,
    /// Tape hiss loudness, dBFS (-120 to 0)
    #[arg(long = "audio-hiss", allow_hyphen_values = true)]
    audio_hiss: Option<f32>,
}

#[derive(Parser)]
#[command(
    name = "vhs-transcoder",
    version,
    about = "Transcode video through an emulated composite signal path and VHS deck",
    long_about = "Round-trips every video field through a synthesized NTSC/PAL composite \
                  signal, optionally through a VHS tape path, and degrades the audio the \
                  way consumer tape decks do. Output is encoded at field rate."
)]
struct Cli {
    /// Input file; repeat to stack layers, composited first to last
    #[arg(short = 'i', long = "input", required = true)]
    input: Vec<PathBuf>,

    /// Output file
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Output frame ring depth, 1 to 256
    #[arg(short = 'd', long = "delay", default_value_t = 1)]
    delay: usize,

    /// Television standard
    #[arg(long, value_enum, default_value = "ntsc")]
    tvstd: TvStdArg,

    #[command(flatten)]
    composite: CompositeArgs,

    #[command(flatten)]
    noise: NoiseArgs,

    #[command(flatten)]
    vhs: VhsArgs,

    #[command(flatten)]
    audio: AudioArgs,

    /// Transcode without any emulation
    #[arg(long)]
    nocomp: bool,

    /// Start transcoding this many seconds in
    #[arg(long)]
    start: Option<f64>,

    /// Transcode only this many seconds
    #[arg(long)]
    duration: Option<f64>,
}

impl Cli {
    fn to_config(&self) -> crate::error::Result<Config> {
        let mut cfg = Config::default();
        cfg.tv = match self.tvstd {
            TvStdArg::Ntsc => TvStandard::Ntsc,
            TvStdArg::Pal => TvStandard::Pal,
        };
        cfg.frame_delay = self.delay;

        // presets fold in first, explicit flags win below; each VHS flag
        // switches the tape path on but carries only its own side effects
        let v = &self.vhs;
        if v.vhs || v.vhs_speed.is_some() || v.vhs_hifi.is_some() {
            let mut vp = VhsParams::default();

            if v.vhs {
                cfg.head_switching = Some(HeadSwitching::default());
                cfg.audio.preemphasis = false;
                cfg.audio.deemphasis = false;
                cfg.audio.hiss_db = -70.0;
                cfg.noise = NoiseParams {
                    video_noise: 4,
                    chroma_noise: 16,
                    chroma_phase_noise: 4,
                    chroma_loss: 4,
                };
            }

            if let Some(speed) = v.vhs_speed {
                vp.speed = speed.into();
                let (phase_noise, chroma, loss, luma) = vp.speed.noise_bundle();
                cfg.noise = NoiseParams {
                    video_noise: luma,
                    chroma_noise: chroma,
                    chroma_phase_noise: phase_noise,
                    chroma_loss: loss,
                };
            }

            if let Some(x) = v.vhs_hifi {
                vp.hifi = x > 0;
                if vp.hifi {
                    cfg.audio.preemphasis = true;
                    cfg.audio.deemphasis = true;
                    cfg.audio.hiss_db = -70.0;
                } else {
                    cfg.audio.hiss_db = -42.0;
                }
            }
            if let Some(x) = v.vhs_svideo {
                vp.svideo_out = x > 0;
            }
            if let Some(x) = v.vhs_chroma_vblend {
                vp.chroma_vert_blend = x > 0;
            }
            cfg.vhs = Some(vp);
        }

        let c = &self.composite;
        for (selected, preset) in [
            (c.comp_catv, CatvPreset::Catv1),
            (c.comp_catv2, CatvPreset::Catv2),
            (c.comp_catv3, CatvPreset::Catv3),
            (c.comp_catv4, CatvPreset::Catv4),
        ] {
            if selected {
                let (pre, cut, phase_noise) = preset.params();
                cfg.composite.preemphasis = pre;
                cfg.composite.preemphasis_cut = cut;
                cfg.noise.chroma_phase_noise = phase_noise;
            }
        }

        cfg.composite.phase = ScanlinePhase::from_degrees(c.comp_phase)?;
        cfg.composite.phase_offset = c.comp_phase_offset;
        if let Some(x) = c.comp_pre {
            cfg.composite.preemphasis = x;
        }
        if let Some(x) = c.comp_cut {
            cfg.composite.preemphasis_cut = x;
        }
        if let Some(x) = c.subcarrier_amp {
            cfg.composite.subcarrier_amplitude = x;
        }
        if let Some(x) = c.in_composite_lowpass {
            cfg.composite.in_chroma_lowpass = x > 0;
        }
        if let Some(x) = c.out_composite_lowpass {
            cfg.composite.out_chroma_lowpass = x > 0;
        }
        if let Some(x) = c.out_composite_lowpass_lite {
            cfg.composite.out_chroma_lowpass_lite = x > 0;
        }
        cfg.composite.nocolor_subcarrier = c.nocolor_subcarrier;
        cfg.composite.nocolor_subcarrier_after_yc_sep = c.nocolor_subcarrier_after_yc_sep;
        cfg.composite.yc_recombine = c.yc_recomb;

        let n = &self.noise;
        if let Some(x) = n.noise {
            cfg.noise.video_noise = x;
        }
        if let Some(x) = n.chroma_noise {
            cfg.noise.chroma_noise = x;
        }
        if let Some(x) = n.chroma_phase_noise {
            cfg.noise.chroma_phase_noise = x;
        }
        if let Some(x) = n.chroma_dropout {
            cfg.noise.chroma_loss = x;
        }

        if let Some(x) = v.vhs_head_switching {
            cfg.head_switching = (x > 0).then(|| cfg.head_switching.unwrap_or_default());
        }
        if let Some(hs) = cfg.head_switching.as_mut() {
            if let Some(x) = v.vhs_head_switching_point {
                hs.point = x;
            }
            if let Some(x) = v.vhs_head_switching_phase {
                hs.phase = x;
            }
            if let Some(x) = v.vhs_head_switching_noise_level {
                hs.noise_level = x;
            }
        }
        if let Some(x) = v.vhs_linear_high_boost {
            cfg.audio.high_boost = x;
        }
        if let Some(x) = v.vhs_linear_video_crosstalk {
            cfg.audio.linear_buzz_db = x;
        }

        let a = &self.audio;
        if let Some(x) = a.preemphasis {
            cfg.audio.preemphasis = x > 0;
        }
        if let Some(x) = a.deemphasis {
            cfg.audio.deemphasis = x > 0;
        }
        if let Some(x) = a.audio_hiss {
            cfg.audio.hiss_db = x;
        }

        if self.nocomp {
            cfg.emulate_video = false;
            cfg.emulate_audio = false;
        }

        cfg.finalize();
        cfg.validate()?;
        Ok(cfg)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pipeline
// ────────────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e)
            if e.kind() == clap::error::ErrorKind::DisplayHelp
                || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            print!("{e}");
            return Ok(());
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let cfg = cli.to_config()?;
    let (width, height) = (cfg.width(), cfg.height());
    let frame_bytes = width * height * 4;

    let cancel = install_signal_handler()?;

    let mut probes = Vec::with_capacity(cli.input.len());
    for path in &cli.input {
        let probe = ffio::probe(path)?;
        info!(
            "input {}: {}x{} @ {:.3} fps, field order {}, audio {}",
            path.display(),
            probe.width,
            probe.height,
            probe.fps,
            probe.field_order,
            if probe.has_audio { "yes" } else { "no" }
        );
        probes.push(probe);
    }

    info!(
        "output {}: {}x{} @ {} fields/s",
        cli.output.display(),
        width,
        height,
        cfg.tv.field_rate()
    );

    let mut readers = Vec::with_capacity(cli.input.len());
    for path in &cli.input {
        let mut child = ffio::spawn_frame_reader(
            path,
            width,
            height,
            cfg.tv.field_rate(),
            cli.start,
            cli.duration,
        )?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscodeError::CodecInit("reader has no stdout pipe".into()))?;
        readers.push((child, BufReader::new(stdout)));
    }

    let mut writer = ffio::spawn_video_writer(&cli.output, width, height, cfg.tv.field_rate())?;
    let writer_stdin = writer
        .stdin
        .take()
        .ok_or_else(|| TranscodeError::CodecInit("encoder has no stdin pipe".into()))?;

    // the processed audio track lands in a side file and is muxed last,
    // from the first input only
    let audio_worker = if probes[0].has_audio {
        Some(spawn_audio_worker(
            &cli.input[0],
            &cli.output,
            &cfg,
            cli.start,
            cli.duration,
            Arc::clone(&cancel),
        )?)
    } else {
        None
    };

    // zero capacity on purpose: the producer blocks until the encoder
    // takes each frame, which is what bounds memory
    let (tx, rx) = crossbeam_channel::bounded::<(Vec<u8>, u64)>(0);

    let consumer = thread::spawn(move || -> std::result::Result<u64, TranscodeError> {
        let mut out = BufWriter::new(writer_stdin);
        let mut fields = 0u64;
        for (frame, _field_index) in rx {
            out.write_all(&frame)
                .map_err(|e| TranscodeError::Encode(e.to_string()))?;
            fields += 1;
        }
        out.flush()
            .map_err(|e| TranscodeError::Encode(e.to_string()))?;
        Ok(fields)
    });

    let total_fields = estimated_fields(&probes[0], &cli, &cfg);
    let pb = make_progress_bar(total_fields);

    let mut compositor = FieldCompositor::new(cfg.clone());
    let mut rng = rand::rng();
    let mut frames: Vec<Vec<u8>> = Vec::with_capacity(readers.len());
    for _ in 0..readers.len() {
        let mut buf = Vec::new();
        buf.try_reserve_exact(frame_bytes).map_err(|_| {
            TranscodeError::ResourceExhausted(format!("layer frame buffer of {frame_bytes} bytes"))
        })?;
        buf.resize(frame_bytes, 0);
        frames.push(buf);
    }
    let mut alive = vec![true; readers.len()];
    let mut primed = vec![false; readers.len()];

    let mut field_index = 0u64;
    let mut soft_cancelled = false;
    loop {
        if cancel.load(Ordering::SeqCst) > 0 {
            soft_cancelled = true;
            break;
        }

        let mut got_any = false;
        for (i, (_, stdout)) in readers.iter_mut().enumerate() {
            if !alive[i] {
                continue;
            }
            match stdout.read_exact(&mut frames[i]) {
                Ok(()) => {
                    got_any = true;
                    primed[i] = true;
                }
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    alive[i] = false;
                }
                Err(e) => {
                    // the layer's last good frame keeps contributing
                    warn!("decode error on input {}: {e}", cli.input[i].display());
                    alive[i] = false;
                }
            }
        }
        if !got_any && alive.iter().all(|a| !a) {
            break;
        }

        let layers: Vec<Layer> = frames
            .iter()
            .zip(&primed)
            .zip(&probes)
            .filter(|((_, &primed), _)| primed)
            .map(|((frame, _), probe)| Layer {
                bgra: frame,
                opposite: probe.opposite(),
            })
            .collect();

        let out = compositor
            .composite_field(&layers, field_index, &mut rng)
            .to_vec();
        if tx.send((out, field_index)).is_err() {
            // encoder side hung up; its error surfaces on join
            break;
        }
        field_index += 1;
        pb.inc(1);
    }

    drop(tx);
    let encoded_fields = consumer
        .join()
        .map_err(|_| anyhow!("encoder thread panicked"))??;
    pb.finish_and_clear();

    let status = writer.wait().context("waiting for video encoder")?;
    if !status.success() {
        bail!(TranscodeError::Encode(format!(
            "video encoder exited with {status}"
        )));
    }
    for (mut child, _) in readers {
        let _ = child.kill();
        let _ = child.wait();
    }

    if soft_cancelled {
        info!("interrupted: stopped after field {field_index}");
    }
    info!("encoded {encoded_fields} fields");

    if let Some(worker) = audio_worker {
        let pcm_path = worker
            .join()
            .map_err(|_| anyhow!("audio thread panicked"))??;
        ffio::mux_audio(&cli.output, &pcm_path, cfg.audio.rate, cfg.audio.channels)?;
        let _ = std::fs::remove_file(&pcm_path);
        info!("muxed {} audio channel(s)", cfg.audio.channels);
    }

    Ok(())
}

fn install_signal_handler() -> Result<Arc<AtomicUsize>> {
    let cancel = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&cancel);
    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGHUP, SIGQUIT]).context("installing signal handler")?;
    thread::spawn(move || {
        for _ in signals.forever() {
            if flag.fetch_add(1, Ordering::SeqCst) + 1 >= HARD_ABORT_SIGNALS {
                std::process::abort();
            }
        }
    });
    Ok(cancel)
}

fn estimated_fields(probe: &ffio::StreamProbe, cli: &Cli, cfg: &Config) -> u64 {
    let mut seconds = probe.duration_secs;
    if let Some(ss) = cli.start {
        seconds = (seconds - ss).max(0.0);
    }
    if let Some(t) = cli.duration {
        seconds = seconds.min(t);
    }
    (seconds * cfg.tv.field_rate_hz()).round() as u64
}

fn make_progress_bar(total_fields: u64) -> ProgressBar {
    if total_fields > 0 {
        let pb = ProgressBar::new(total_fields);
        pb.set_style(
            ProgressStyle::with_template(
                "Transcoding {bar:40.cyan/blue} {pos}/{len} fields [{elapsed_precise}<{eta_precise}]",
            )
            .unwrap()
            .progress_chars("##-"),
        );
        pb
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("Transcoding {spinner} {pos} fields [{elapsed_precise}]")
                .unwrap(),
        );
        pb
    }
}

/// Pull the first input's audio through the tape chain into a raw PCM
/// side file, concurrently with the video pass.
fn spawn_audio_worker(
    input: &std::path::Path,
    output: &std::path::Path,
    cfg: &Config,
    start: Option<f64>,
    duration: Option<f64>,
    cancel: Arc<AtomicUsize>,
) -> Result<thread::JoinHandle<std::result::Result<PathBuf, TranscodeError>>> {
    let mut child =
        ffio::spawn_audio_reader(input, cfg.audio.rate, cfg.audio.channels, start, duration)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TranscodeError::CodecInit("audio reader has no stdout pipe".into()))?;
    let pcm_path = PathBuf::from(format!("{}.audio.pcm", output.display()));
    let cfg = cfg.clone();

    Ok(thread::spawn(move || {
        let mut src = BufReader::new(stdout);
        let file = File::create(&pcm_path).map_err(|e| TranscodeError::OpenOutput {
            path: pcm_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut dst = BufWriter::new(file);
        let mut chain = AudioChain::new(&cfg);
        let mut rng = rand::rng();

        // 4096 sample periods per chunk
        let chunk_bytes = 4096 * 2 * cfg.audio.channels;
        let mut raw = vec![0u8; chunk_bytes];
        let mut samples: Vec<i16> = Vec::with_capacity(chunk_bytes / 2);

        loop {
            if cancel.load(Ordering::SeqCst) > 0 {
                break;
            }
            let got = read_full(&mut src, &mut raw)
                .map_err(|e| TranscodeError::Decode(format!("audio read: {e}")))?;
            if got == 0 {
                break;
            }
            let whole = got - got % (2 * cfg.audio.channels);

            samples.clear();
            samples.extend(
                raw[..whole]
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]])),
            );
            if cfg.emulate_audio {
                chain.process(&mut samples, &mut rng);
            }
            for s in &samples {
                dst.write_all(&s.to_le_bytes())
                    .map_err(|e| TranscodeError::Encode(format!("audio write: {e}")))?;
            }
            if got < raw.len() {
                break;
            }
        }
        dst.flush()
            .map_err(|e| TranscodeError::Encode(format!("audio flush: {e}")))?;
        let _ = child.kill();
        let _ = child.wait();
        Ok(pcm_path)
    }))
}

/// Read until the buffer is full or the stream ends; returns bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
