// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The segment/chunk archive: coalesces raw segments into chunks, answers
//! "give me camera C from T1 to T2" via hybrid discovery, extracts and
//! watermarks clips, and ages out both chunks and settled clips.

pub mod coalescer;
pub mod discovery;
pub mod extractor;
pub mod ffmpeg;
pub mod filenames;
pub mod intervals;
pub mod retention;

pub use coalescer::{ChunkCoalescer, CoalesceOutcome};
pub use discovery::{Discovery, SegmentSource, SourceKind};
pub use extractor::ClipExtractor;
pub use ffmpeg::{ExternalTransforms, FfmpegRunner, ProcessExternalTransforms};
pub use retention::ClipRetention;
