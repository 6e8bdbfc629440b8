// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Stream-copy concatenation and extraction via an `ffmpeg` subprocess.
//!
//! No Rust ffmpeg binding crate is used: ffmpeg is an external dependency
//! of the *process*, invoked the same way the example pack's watermark and
//! preview utilities are invoked — as an opaque external transformation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base::{err, Error, ErrorKind};
use jiff::SignedDuration;
use tokio::process::Command;

const DEFAULT_CONCAT_TIMEOUT: Duration = Duration::from_secs(600);

pub struct FfmpegRunner {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for FfmpegRunner {
    fn default() -> Self {
        FfmpegRunner {
            binary: PathBuf::from("ffmpeg"),
            timeout: DEFAULT_CONCAT_TIMEOUT,
        }
    }
}

impl FfmpegRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        FfmpegRunner { binary: binary.into(), timeout: DEFAULT_CONCAT_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[std::ffi::OsString], output: &Path) -> Result<(), Error> {
        let run = async {
            let status = Command::new(&self.binary)
                .args(args)
                .kill_on_drop(true)
                .status()
                .await
                .map_err(|e| Error::wrap(ErrorKind::Transient, "spawning ffmpeg", e))?;
            if !status.success() {
                return Err(err!(Integrity, "ffmpeg exited with {status}"));
            }
            Ok(())
        };
        match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => {
                if result.is_err() {
                    let _ = tokio::fs::remove_file(output).await;
                }
                result
            }
            Err(_) => {
                let _ = tokio::fs::remove_file(output).await;
                Err(err!(Transient, "ffmpeg timed out after {:?}", self.timeout))
            }
        }
    }

    /// Stream-copy concatenates `inputs`, already in time order, into
    /// `output` using ffmpeg's concat demuxer. Negative-timestamp artifacts
    /// at segment boundaries are normalized away.
    pub async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), Error> {
        if inputs.is_empty() {
            return Err(err!(InvalidArgument, "concat requires at least one input"));
        }
        let list_file = output.with_extension("concat_list.txt");
        let mut list = String::new();
        for input in inputs {
            let escaped = input.to_string_lossy().replace('\'', "'\\''");
            list.push_str(&format!("file '{escaped}'\n"));
        }
        tokio::fs::write(&list_file, list)
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "writing concat list", e))?;
        let args = [
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_file.clone().into_os_string(),
            "-c".into(),
            "copy".into(),
            "-avoid_negative_ts".into(),
            "make_zero".into(),
            output.as_os_str().to_owned(),
        ];
        let result = self.run(&args, output).await;
        let _ = tokio::fs::remove_file(&list_file).await;
        result
    }

    /// Stream-copy extracts `[offset, offset + duration)` of `input` into
    /// `output`, preserving the source codec.
    pub async fn extract(
        &self,
        input: &Path,
        offset: SignedDuration,
        duration: SignedDuration,
        output: &Path,
    ) -> Result<(), Error> {
        let args = [
            "-y".into(),
            "-ss".into(),
            format!("{:.3}", offset.as_secs_f64()).into(),
            "-i".into(),
            input.as_os_str().to_owned(),
            "-t".into(),
            format!("{:.3}", duration.as_secs_f64()).into(),
            "-c".into(),
            "copy".into(),
            "-avoid_negative_ts".into(),
            "make_zero".into(),
            output.as_os_str().to_owned(),
        ];
        self.run(&args, output).await
    }
}

/// The watermark/preview/thumbnail utilities: opaque external
/// transformations consumed, not implemented, by this crate (per scope).
/// Modeled as a capability interface so the extractor can be tested without
/// invoking a real tool.
#[async_trait::async_trait]
pub trait ExternalTransforms: Send + Sync + 'static {
    async fn apply_watermark(&self, input: &Path, output: &Path) -> Result<(), Error>;
    async fn generate_preview(
        &self,
        input: &Path,
        intervals: &[(SignedDuration, SignedDuration)],
        output: &Path,
    ) -> Result<(), Error>;
    async fn generate_thumbnail(&self, input: &Path, at: SignedDuration, output: &Path) -> Result<(), Error>;
}

/// Invokes configured external binaries taking `(input, output, ...)`
/// positional arguments, the same shape as the teacher's subprocess
/// invocations elsewhere in the pack.
pub struct ProcessExternalTransforms {
    pub watermark_bin: PathBuf,
    pub preview_bin: PathBuf,
    pub thumbnail_bin: PathBuf,
}

#[async_trait::async_trait]
impl ExternalTransforms for ProcessExternalTransforms {
    async fn apply_watermark(&self, input: &Path, output: &Path) -> Result<(), Error> {
        let status = Command::new(&self.watermark_bin)
            .arg(input)
            .arg(output)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "spawning watermark tool", e))?;
        if !status.success() {
            return Err(err!(Transient, "watermark tool exited with {status}"));
        }
        Ok(())
    }

    async fn generate_preview(
        &self,
        input: &Path,
        intervals: &[(SignedDuration, SignedDuration)],
        output: &Path,
    ) -> Result<(), Error> {
        let spec = intervals
            .iter()
            .map(|(offset, dur)| format!("{:.3}:{:.3}", offset.as_secs_f64(), dur.as_secs_f64()))
            .collect::<Vec<_>>()
            .join(",");
        let status = Command::new(&self.preview_bin)
            .arg(input)
            .arg("--intervals")
            .arg(spec)
            .arg(output)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "spawning preview tool", e))?;
        if !status.success() {
            return Err(err!(Transient, "preview tool exited with {status}"));
        }
        Ok(())
    }

    async fn generate_thumbnail(&self, input: &Path, at: SignedDuration, output: &Path) -> Result<(), Error> {
        let status = Command::new(&self.thumbnail_bin)
            .arg(input)
            .arg("--at")
            .arg(format!("{:.3}", at.as_secs_f64()))
            .arg(output)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Transient, "spawning thumbnail tool", e))?;
        if !status.success() {
            return Err(err!(Transient, "thumbnail tool exited with {status}"));
        }
        Ok(())
    }
}
