//! Frame demultiplexing and per-channel accumulation
//!
//! A frame carries `S` sample instants for `N` channels, interleaved
//! instant by instant. Channel `c` owns every `N`-th float starting at `c`.
//! Samples enter each channel's accumulation buffer one at a time. A buffer
//! is drained the moment it holds exactly `A` samples, and filling then
//! resumes with the rest of the frame.

use emg_core::{DeviceProfile, EmgError, EmgResult, BYTES_PER_SAMPLE};

/// A drained accumulation window for one channel
#[derive(Debug, Clone, PartialEq)]
pub struct DrainedWindow {
    pub channel: usize,
    pub samples: Vec<f64>,
}

/// Splits raw frames into channels and emits fixed-size windows
#[derive(Debug, Clone)]
pub struct FrameDemuxer {
    profile: DeviceProfile,
    window: usize,
    buffers: Vec<Vec<f64>>,
    framing_errors: u64,
}

impl FrameDemuxer {
    pub fn new(profile: DeviceProfile, window: usize) -> EmgResult<Self> {
        if window == 0 {
            return Err(EmgError::config("accumulation window must be at least 1 sample"));
        }

        Ok(FrameDemuxer {
            profile,
            window,
            buffers: (0..profile.channel_count)
                .map(|_| Vec::with_capacity(window))
                .collect(),
            framing_errors: 0,
        })
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Frames discarded for having the wrong length
    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    /// Switch to a newly negotiated profile, discarding partial windows
    pub fn set_profile(&mut self, profile: DeviceProfile) {
        self.profile = profile;
        self.buffers = (0..profile.channel_count)
            .map(|_| Vec::with_capacity(self.window))
            .collect();
    }

    /// Number of samples currently buffered for `channel`
    pub fn buffered(&self, channel: usize) -> usize {
        self.buffers.get(channel).map_or(0, Vec::len)
    }

    /// Empty every accumulation buffer
    pub fn clear(&mut self) {
        for buffer in &mut self.buffers {
            buffer.clear();
        }
    }

    /// Decode a frame into one sample vector per channel
    pub fn split(&self, frame: &[u8]) -> EmgResult<Vec<Vec<f64>>> {
        let expected = self.profile.frame_bytes();
        if frame.len() != expected {
            return Err(EmgError::FrameSize {
                expected,
                actual: frame.len(),
            });
        }

        let channels = self.profile.channel_count;
        let mut slices = vec![Vec::with_capacity(self.profile.samples_per_frame()); channels];

        for (i, bytes) in frame.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
            let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            slices[i % channels].push(value as f64);
        }

        Ok(slices)
    }

    /// Accumulate one frame and return every window that filled up
    ///
    /// A frame of the wrong length is counted and rejected without touching
    /// the buffers.
    pub fn push_frame(&mut self, frame: &[u8]) -> EmgResult<Vec<DrainedWindow>> {
        let slices = match self.split(frame) {
            Ok(slices) => slices,
            Err(e) => {
                self.framing_errors += 1;
                return Err(e);
            }
        };

        let mut drained = Vec::new();
        for (channel, samples) in slices.into_iter().enumerate() {
            let buffer = &mut self.buffers[channel];
            for sample in samples {
                buffer.push(sample);
                if buffer.len() == self.window {
                    let full = std::mem::replace(buffer, Vec::with_capacity(self.window));
                    drained.push(DrainedWindow {
                        channel,
                        samples: full,
                    });
                }
            }
        }

        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emg_core::RateProfile;

    fn frame_from(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_zero_frame_splits_per_channel() {
        for (rate, s) in [(RateProfile::Standard, 27), (RateProfile::Alternate, 26)] {
            let profile = DeviceProfile::new(16, rate).unwrap();
            let demuxer = FrameDemuxer::new(profile, 75).unwrap();
            let frame = vec![0u8; rate.frame_bytes()];

            let slices = demuxer.split(&frame).unwrap();
            assert_eq!(slices.len(), 16);
            for slice in &slices {
                assert_eq!(slice.len(), s);
                assert!(slice.iter().all(|&v| v == 0.0));
            }
        }
    }

    #[test]
    fn test_stride_demultiplexing() {
        let profile = DeviceProfile::default();
        let demuxer = FrameDemuxer::new(profile, 75).unwrap();
        // value encodes instant * 100 + channel
        let values: Vec<f32> = (0..432).map(|i| ((i / 16) * 100 + i % 16) as f32).collect();

        let slices = demuxer.split(&frame_from(&values)).unwrap();
        assert_eq!(slices[3][0], 3.0);
        assert_eq!(slices[3][1], 103.0);
        assert_eq!(slices[15][26], 2615.0);
    }

    #[test]
    fn test_windows_are_exactly_window_long() {
        let mut demuxer = FrameDemuxer::new(DeviceProfile::default(), 75).unwrap();
        let frame = vec![0u8; 1728];
        let mut windows = Vec::new();

        for _ in 0..10 {
            windows.extend(demuxer.push_frame(&frame).unwrap());
        }

        // 10 frames * 27 samples = 270 per channel -> 3 windows, 45 left over
        assert_eq!(windows.len(), 16 * 3);
        assert!(windows.iter().all(|w| w.samples.len() == 75));
        assert_eq!(demuxer.buffered(0), 45);
    }

    #[test]
    fn test_no_samples_lost_across_drains() {
        let mut demuxer = FrameDemuxer::new(DeviceProfile::default(), 75).unwrap();
        let mut counter = 0.0f32;
        let mut received = Vec::new();

        for _ in 0..6 {
            let values: Vec<f32> = (0..432)
                .map(|i| {
                    if i % 16 == 0 {
                        counter += 1.0;
                        counter
                    } else {
                        0.0
                    }
                })
                .collect();
            for window in demuxer.push_frame(&frame_from(&values)).unwrap() {
                if window.channel == 0 {
                    received.extend(window.samples);
                }
            }
        }

        let expected: Vec<f64> = (1..=150).map(|v| v as f64).collect();
        assert_eq!(received, expected);
        assert_eq!(demuxer.buffered(0), 162 - 150);
    }

    #[test]
    fn test_wrong_frame_size_rejected() {
        let mut demuxer = FrameDemuxer::new(DeviceProfile::default(), 75).unwrap();

        let result = demuxer.push_frame(&vec![0u8; 1664]);
        assert_eq!(
            result,
            Err(EmgError::FrameSize {
                expected: 1728,
                actual: 1664
            })
        );
        assert_eq!(demuxer.framing_errors(), 1);
        assert_eq!(demuxer.buffered(0), 0);
    }

    #[test]
    fn test_set_profile_and_clear() {
        let mut demuxer = FrameDemuxer::new(DeviceProfile::default(), 75).unwrap();
        demuxer.push_frame(&vec![0u8; 1728]).unwrap();
        assert_eq!(demuxer.buffered(5), 27);

        demuxer.clear();
        assert_eq!(demuxer.buffered(5), 0);

        demuxer.set_profile(DeviceProfile::new(16, RateProfile::Alternate).unwrap());
        demuxer.push_frame(&vec![0u8; 1664]).unwrap();
        assert_eq!(demuxer.buffered(5), 26);
    }
}
