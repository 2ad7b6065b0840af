//! External collaborators, reached over subprocess pipes.
//!
//! Demuxing, codec work, scaling, color-space conversion and sample-rate
//! conversion all belong to `ffmpeg`/`ffprobe`. This module only moves
//! raw BGRA frames and s16le PCM across stdin/stdout and stitches the
//! processed audio back in at the end.

use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::error::{Result, TranscodeError};

/// What `ffprobe` reports about an input's first video stream.
#[derive(Clone, Debug)]
pub struct StreamProbe {
    pub width: usize,
    pub height: usize,
    pub field_order: String,
    pub fps: f64,
    pub duration_secs: f64,
    pub has_audio: bool,
}

impl StreamProbe {
    pub fn interlaced(&self) -> bool {
        matches!(self.field_order.as_str(), "tt" | "bb" | "tb" | "bt")
    }

    pub fn top_field_first(&self) -> bool {
        matches!(self.field_order.as_str(), "tt" | "tb")
    }

    /// Source rows must be fetched one down when an interlaced source
    /// leads with its top field.
    pub fn opposite(&self) -> bool {
        self.interlaced() && self.top_field_first()
    }
}

pub fn probe(path: &Path) -> Result<StreamProbe> {
    let path_str = path.to_string_lossy();
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,field_order,r_frame_rate,duration",
            "-of",
            "csv=p=0",
            &path_str,
        ])
        .output()
        .map_err(|e| TranscodeError::OpenInput {
            path: path_str.to_string(),
            reason: format!("cannot run ffprobe: {e}"),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let parts: Vec<&str> = stdout.trim().split(',').collect();
    if parts.len() < 2 {
        return Err(TranscodeError::OpenInput {
            path: path_str.to_string(),
            reason: format!("no video stream (ffprobe said: {})", stdout.trim()),
        });
    }

    let width: usize = parts[0].parse().unwrap_or(0);
    let height: usize = parts[1].parse().unwrap_or(0);
    let field_order = parts.get(2).copied().unwrap_or("progressive").to_string();
    let fps = parts
        .get(3)
        .map(|s| parse_rational(s))
        .unwrap_or(0.0);
    let duration_secs: f64 = parts
        .get(4)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);

    if width == 0 || height == 0 {
        return Err(TranscodeError::OpenInput {
            path: path_str.to_string(),
            reason: "could not determine video dimensions".into(),
        });
    }

    Ok(StreamProbe {
        width,
        height,
        field_order,
        fps,
        duration_secs,
        has_audio: probe_has_audio(&path_str),
    })
}

fn parse_rational(s: &str) -> f64 {
    if let Some((num, den)) = s.split_once('/') {
        let n: f64 = num.parse().unwrap_or(0.0);
        let d: f64 = den.parse().unwrap_or(1.0);
        if d != 0.0 {
            n / d
        } else {
            0.0
        }
    } else {
        s.parse().unwrap_or(0.0)
    }
}

fn probe_has_audio(path: &str) -> bool {
    let probe = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "a",
            "-show_entries",
            "stream=codec_type",
            "-of",
            "csv=p=0",
            path,
        ])
        .output();

    match probe {
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains("audio"),
        Err(_) => false,
    }
}

/// Decode one input to raw BGRA frames at the output raster and field
/// rate. The collaborator handles scaling, frame duplication and color
/// conversion.
pub fn spawn_frame_reader(
    path: &Path,
    width: usize,
    height: usize,
    field_rate: &str,
    start: Option<f64>,
    duration: Option<f64>,
) -> Result<Child> {
    let path_str = path.to_string_lossy().to_string();
    let mut args: Vec<String> = Vec::new();
    if let Some(ss) = start {
        args.extend(["-ss".into(), format!("{ss}")]);
    }
    args.extend(["-i".into(), path_str.clone()]);
    if let Some(t) = duration {
        args.extend(["-t".into(), format!("{t}")]);
    }
    args.extend([
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "bgra".into(),
        "-s".into(),
        format!("{width}x{height}"),
        "-r".into(),
        field_rate.into(),
        "-an".into(),
        "-v".into(),
        "error".into(),
        "pipe:1".into(),
    ]);

    Command::new("ffmpeg")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TranscodeError::OpenInput {
            path: path_str,
            reason: format!("failed to spawn ffmpeg reader (is ffmpeg installed?): {e}"),
        })
}

/// Decode one input's audio to interleaved s16le PCM at the output rate.
pub fn spawn_audio_reader(
    path: &Path,
    rate: u32,
    channels: usize,
    start: Option<f64>,
    duration: Option<f64>,
) -> Result<Child> {
    let path_str = path.to_string_lossy().to_string();
    let mut args: Vec<String> = Vec::new();
    if let Some(ss) = start {
        args.extend(["-ss".into(), format!("{ss}")]);
    }
    args.extend(["-i".into(), path_str.clone()]);
    if let Some(t) = duration {
        args.extend(["-t".into(), format!("{t}")]);
    }
    args.extend([
        "-vn".into(),
        "-f".into(),
        "s16le".into(),
        "-acodec".into(),
        "pcm_s16le".into(),
        "-ar".into(),
        format!("{rate}"),
        "-ac".into(),
        format!("{channels}"),
        "-v".into(),
        "error".into(),
        "pipe:1".into(),
    ]);

    Command::new("ffmpeg")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TranscodeError::OpenInput {
            path: path_str,
            reason: format!("failed to spawn ffmpeg audio reader: {e}"),
        })
}

/// Encode raw BGRA frames from stdin to the output container. Every
/// frame is one field period.
pub fn spawn_video_writer(
    path: &Path,
    width: usize,
    height: usize,
    field_rate: &str,
) -> Result<Child> {
    let path_str = path.to_string_lossy().to_string();
    let args: Vec<String> = vec![
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "bgra".into(),
        "-s".into(),
        format!("{width}x{height}"),
        "-r".into(),
        field_rate.into(),
        "-i".into(),
        "pipe:0".into(),
        "-an".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-tune".into(),
        "zerolatency".into(),
        "-crf".into(),
        "0".into(),
        "-pix_fmt".into(),
        "yuv444p".into(),
        "-colorspace".into(),
        "smpte170m".into(),
        "-v".into(),
        "error".into(),
        path_str.clone(),
    ];

    Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TranscodeError::OpenOutput {
            path: path_str,
            reason: format!("failed to spawn ffmpeg writer (is ffmpeg installed?): {e}"),
        })
}

/// Remux the finished video with the processed PCM track, then swap the
/// result over the video-only file.
pub fn mux_audio(output: &Path, pcm: &Path, rate: u32, channels: usize) -> Result<()> {
    let out_str = output.to_string_lossy().to_string();
    let ext = output
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "mkv".into());
    let tmp = format!("{out_str}.mux.{ext}");

    let status = Command::new("ffmpeg")
        .args([
            "-y",
            "-i",
            &out_str,
            "-f",
            "s16le",
            "-ar",
            &rate.to_string(),
            "-ac",
            &channels.to_string(),
            "-i",
            &pcm.to_string_lossy(),
            "-map",
            "0:v",
            "-map",
            "1:a",
            "-c:v",
            "copy",
            "-c:a",
            "pcm_s16le",
            "-shortest",
            "-v",
            "error",
            &tmp,
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(st) if st.success() => {
            std::fs::rename(&tmp, output).map_err(|e| TranscodeError::Encode(format!(
                "failed to replace output with muxed file: {e}"
            )))?;
            Ok(())
        }
        Ok(st) => {
            let _ = std::fs::remove_file(&tmp);
            Err(TranscodeError::Encode(format!(
                "audio mux failed with status {st}"
            )))
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(TranscodeError::Encode(format!("audio mux failed: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_rates_parse() {
        assert!((parse_rational("60000/1001") - 59.94).abs() < 0.01);
        assert_eq!(parse_rational("50"), 50.0);
        assert_eq!(parse_rational("0/0"), 0.0);
        assert_eq!(parse_rational("garbage"), 0.0);
    }

    #[test]
    fn field_order_classification() {
        let mut p = StreamProbe {
            width: 720,
            height: 480,
            field_order: "progressive".into(),
            fps: 29.97,
            duration_secs: 0.0,
            has_audio: false,
        };
        assert!(!p.interlaced());
        assert!(!p.opposite());

        p.field_order = "tt".into();
        assert!(p.interlaced());
        assert!(p.top_field_first());
        assert!(p.opposite());

        p.field_order = "bb".into();
        assert!(p.interlaced());
        assert!(!p.opposite());
    }
}
