//! Annex-B start code scanning.

use crate::track::VideoCodec;

/// Iterator over the NAL units of an Annex-B byte stream, start codes removed.
pub struct NalUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

/// Offset of the next start code at or after `from`, with its length.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 3 < data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

impl<'a> NalUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let pos = match find_start_code(data, 0) {
            Some((offset, len)) => offset + len,
            None => data.len(),
        };
        Self { data, pos }
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.data.len() {
            let start = self.pos;
            let end = match find_start_code(self.data, start) {
                Some((offset, len)) => {
                    self.pos = offset + len;
                    offset
                }
                None => {
                    self.pos = self.data.len();
                    self.data.len()
                }
            };
            if end > start {
                return Some(&self.data[start..end]);
            }
        }
        None
    }
}

/// Whether the access unit carries a random access point: an IDR slice for
/// H.264, any IRAP picture for H.265.
pub fn is_keyframe(codec: VideoCodec, data: &[u8]) -> bool {
    NalUnits::new(data).any(|nal| match codec {
        VideoCodec::H264 => nal[0] & 0x1f == 5,
        VideoCodec::H265 => (16..=23).contains(&((nal[0] >> 1) & 0x3f)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_three_and_four_byte_start_codes() {
        let stream = [0, 0, 0, 1, 0x67, 0xaa, 0, 0, 1, 0x68, 0xbb, 0, 0, 0, 1, 0x65, 0xcc];
        let nals: Vec<&[u8]> = NalUnits::new(&stream).collect();
        assert_eq!(nals, vec![&[0x67, 0xaa][..], &[0x68, 0xbb], &[0x65, 0xcc]]);
    }

    #[test]
    fn h264_idr_is_a_keyframe() {
        let idr = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88];
        let non_idr = [0, 0, 0, 1, 0x41, 0x9a];
        assert!(is_keyframe(VideoCodec::H264, &idr));
        assert!(!is_keyframe(VideoCodec::H264, &non_idr));
    }

    #[test]
    fn h265_irap_is_a_keyframe() {
        // VPS, then IDR_W_RADL (type 19)
        let idr = [0, 0, 0, 1, 0x40, 0x01, 0, 0, 0, 1, 0x26, 0x01];
        // TRAIL_R (type 1)
        let trail = [0, 0, 0, 1, 0x02, 0x01];
        assert!(is_keyframe(VideoCodec::H265, &idr));
        assert!(!is_keyframe(VideoCodec::H265, &trail));
    }

    #[test]
    fn garbage_has_no_units() {
        assert_eq!(NalUnits::new(&[1, 2, 3]).count(), 0);
        assert!(!is_keyframe(VideoCodec::H264, &[]));
    }
}
