use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFramePixelFormat {
    I420,
    NV12,
    UYVY,
    /// Device-resident surfaces. Only ever a codec's native format, never a
    /// format of frames pushed by callers.
    Cuda,
}

impl VideoFramePixelFormat {
    /// Whether frames in this format carry 4:2:0 chroma and therefore need
    /// even dimensions.
    pub fn is_420(&self) -> bool {
        matches!(self, Self::I420 | Self::NV12)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: usize,
    pub height: usize,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A raw picture handed to an encoder. `pts` is in the track's time base and is
/// carried over untouched to the packets the frame produces.
#[derive(Clone)]
pub struct VideoFrameBuffer {
    pub pix_fmt: VideoFramePixelFormat,
    pub width: usize,
    pub height: usize,
    pub line_stride: usize,
    pub pts: i64,
    pub data: Bytes,
}

impl VideoFrameBuffer {
    /// Wrap a tightly packed I420 picture.
    pub fn i420(width: usize, height: usize, pts: i64, data: Bytes) -> Self {
        Self {
            pix_fmt: VideoFramePixelFormat::I420,
            width,
            height,
            line_stride: width,
            pts,
            data,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    /// Size in bytes the buffer must have for its format and stride.
    pub fn expected_len(&self) -> usize {
        let luma = self.line_stride * self.height;
        match self.pix_fmt {
            VideoFramePixelFormat::I420 | VideoFramePixelFormat::NV12 => luma + luma / 2,
            VideoFramePixelFormat::UYVY => luma,
            VideoFramePixelFormat::Cuda => 0,
        }
    }

    pub fn y(&self) -> &[u8] {
        &self.data[..self.line_stride * self.height]
    }

    /// U plane of an I420 frame, or the interleaved UV plane of an NV12 frame.
    pub fn u(&self) -> &[u8] {
        let base_u = self.line_stride * self.height;
        match self.pix_fmt {
            VideoFramePixelFormat::NV12 => &self.data[base_u..base_u + base_u / 2],
            _ => &self.data[base_u..base_u + base_u / 4],
        }
    }

    /// V plane of an I420 frame. Empty for every other format.
    pub fn v(&self) -> &[u8] {
        if self.pix_fmt != VideoFramePixelFormat::I420 {
            return &[];
        }
        let base_u = self.line_stride * self.height;
        let base_v = base_u + base_u / 4;
        &self.data[base_v..base_v + base_u / 4]
    }
}

impl fmt::Debug for VideoFrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrameBuffer")
            .field("pix_fmt", &self.pix_fmt)
            .field("resolution", &self.resolution())
            .field("line_stride", &self.line_stride)
            .field("pts", &self.pts)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitstreamFormat {
    H264AnnexB,
    H265AnnexB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Raw NAL unit stream.
    Nalu,
}

/// One unit of encoder output. `bitstream_format` and `packet_type` never vary
/// within a single encoder's stream.
#[derive(Clone)]
pub struct EncodedPacket {
    pub bitstream_format: BitstreamFormat,
    pub packet_type: PacketType,
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
    /// Index of the submitted frame this packet encodes, matched by pts.
    pub submission_index: u64,
    pub data: Bytes,
}

impl fmt::Debug for EncodedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedPacket")
            .field("bitstream_format", &self.bitstream_format)
            .field("packet_type", &self.packet_type)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("keyframe", &self.keyframe)
            .field("submission_index", &self.submission_index)
            .field("len", &self.data.len())
            .finish()
    }
}
