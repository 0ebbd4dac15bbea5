//! Codec parameter derivation.
//!
//! Everything an encoder needs to know about a track is computed here once, at
//! configure time, and never touched again. Backends share these helpers; what
//! they do with the result is up to each of them.

use std::{fmt, time::Duration};

use crate::{
    codec::CodecDescriptor,
    frame::VideoFramePixelFormat,
    track::{KeyFrameIntervalType, TrackConfig},
};

/// Microsecond time base; the largest denominator a framerate may get.
pub const MAX_FRAMERATE_DENOMINATOR: i64 = 1_000_000;

/// Time-based keyframe policies leave GOP placement to the timer and only cap
/// the GOP at this many seconds.
pub const TIME_POLICY_GOP_SECONDS: f64 = 10.;

pub const TICKS_PER_FRAME: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.abs()
}

impl Rational {
    pub fn new(num: i64, den: i64) -> Self {
        let divisor = gcd(num, den).max(1);
        let sign = if den < 0 { -1 } else { 1 };
        Self {
            num: sign * num / divisor,
            den: sign * den / divisor,
        }
    }

    /// Best rational approximation of `value` whose denominator does not
    /// exceed `max_den`, from the continued fraction expansion.
    pub fn from_f64(value: f64, max_den: i64) -> Self {
        if !value.is_finite() || value <= 0. {
            return Self { num: 0, den: 1 };
        }

        let (mut p0, mut q0, mut p1, mut q1) = (0i64, 1i64, 1i64, 0i64);
        let mut x = value;
        loop {
            let a = x.floor() as i64;
            let next = a
                .checked_mul(p1)
                .and_then(|p| p.checked_add(p0))
                .zip(a.checked_mul(q1).and_then(|q| q.checked_add(q0)));
            let Some((p2, q2)) = next else { break };
            if q2 > max_den {
                break;
            }
            (p0, q0, p1, q1) = (p1, q1, p2, q2);

            let frac = x - a as f64;
            if frac.abs() < f64::EPSILON {
                break;
            }
            x = 1. / frac;
        }

        Self::new(p1, q1.max(1))
    }

    pub fn invert(&self) -> Self {
        Self::new(self.den, self.num)
    }

    pub fn mul(&self, other: Rational) -> Self {
        Self::new(self.num * other.num, self.den * other.den)
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Hardware encoder preset tiers, P1 fastest to P7 strongest compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncoderPreset {
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
}

impl EncoderPreset {
    /// Map a track preset name onto a tier. Unknown or missing names get the
    /// strongest compression tier.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("slower") => Self::P7,
            Some("slow") => Self::P6,
            Some("medium") => Self::P5,
            Some("fast") => Self::P4,
            Some("faster") => Self::P3,
            _ => Self::P7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P1 => "p1",
            Self::P2 => "p2",
            Self::P3 => "p3",
            Self::P4 => "p4",
            Self::P5 => "p5",
            Self::P6 => "p6",
            Self::P7 => "p7",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tune {
    UltraLowLatency,
}

impl Tune {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UltraLowLatency => "ull",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    ConstantBitrate,
}

impl RateControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConstantBitrate => "cbr",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodecParams {
    pub framerate: Rational,
    pub ticks_per_frame: i64,
    pub time_base: Rational,

    /// Bits per second; min and max rate are pinned to it.
    pub bit_rate: u64,
    pub rc_min_rate: u64,
    pub rc_max_rate: u64,
    pub rc_buffer_size: u64,

    pub gop_size: u32,
    pub max_b_frames: u32,

    /// Format of the pictures the codec consumes.
    pub pixel_format: VideoFramePixelFormat,
    /// Format of the frames callers push.
    pub sw_format: VideoFramePixelFormat,
    pub width: u32,
    pub height: u32,
    pub sample_aspect_ratio: Rational,

    pub preset: EncoderPreset,
    pub tune: Tune,
    pub rate_control: RateControl,

    /// Forced keyframes must be IDR pictures.
    pub forced_idr: bool,
    /// Period of the keyframe forcing timer, when one is armed.
    pub keyframe_period: Option<Duration>,
}

impl CodecParams {
    pub fn derive(track: &TrackConfig, codec: &CodecDescriptor) -> Self {
        let framerate = Rational::from_f64(track.timing_framerate(), MAX_FRAMERATE_DENOMINATOR);
        let time_base = framerate
            .mul(Rational::new(TICKS_PER_FRAME, 1))
            .invert();

        let bit_rate = track.bitrate;
        let forced_idr = track.key_frame_interval_type == KeyFrameIntervalType::Time;

        Self {
            framerate,
            ticks_per_frame: TICKS_PER_FRAME,
            time_base,

            bit_rate,
            rc_min_rate: bit_rate,
            rc_max_rate: bit_rate,
            rc_buffer_size: bit_rate / 2,

            gop_size: gop_size(track, framerate),
            max_b_frames: 0,

            pixel_format: codec.pixel_format,
            sw_format: track.pixel_format,
            width: track.width,
            height: track.height,
            sample_aspect_ratio: Rational::new(1, 1),

            preset: EncoderPreset::from_name(track.preset.as_deref()),
            tune: Tune::UltraLowLatency,
            rate_control: RateControl::ConstantBitrate,

            forced_idr,
            keyframe_period: track.key_frame_period(),
        }
    }

    /// Private codec options, in the key/value form option-based encoders take.
    pub fn options(&self) -> Vec<(&'static str, String)> {
        let mut options = vec![
            ("preset", self.preset.as_str().to_string()),
            ("tune", self.tune.as_str().to_string()),
            ("rc", self.rate_control.as_str().to_string()),
        ];
        if self.forced_idr {
            options.push(("forced-idr", "1".to_string()));
        }
        options
    }
}

/// GOP length for a track.
///
/// Time-based policies get a 10 second GOP and rely on the forcing timer for
/// the actual cadence. Frame-based policies use the configured interval, or
/// one second worth of frames when it is zero.
pub fn gop_size(track: &TrackConfig, framerate: Rational) -> u32 {
    let gop = match track.key_frame_interval_type {
        KeyFrameIntervalType::Time => {
            (track.timing_framerate() * TIME_POLICY_GOP_SECONDS).round() as u32
        }
        KeyFrameIntervalType::Frame if track.key_frame_interval == 0 => {
            framerate.as_f64().round() as u32
        }
        KeyFrameIntervalType::Frame => track.key_frame_interval,
    };
    gop.max(1)
}
