//! Outbound video track fed from the capture path on the media clock

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::encoder::{KeyframeRequest, VideoEncoder};
use crate::capture::decoder::to_packed;
use crate::capture::{Frame, PixelFormat};
use crate::session::peer::FrameReader;
use crate::MediaConfig;

/// RTP video clock rate
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

const POLL_STEP: Duration = Duration::from_millis(5);

/// Maps tick instants to frame slots and slots to 90 kHz presentation timestamps.
///
/// A slot is the number of frame periods since the first tick, to the nearest
/// period, so ticks lost to a stall show up as a jump in the slot number.
#[derive(Debug, Clone)]
pub struct MediaClock {
    fps: u32,
    period: Duration,
    start: Option<Instant>,
    last: Option<u64>,
}

impl MediaClock {
    pub fn new(fps: u32) -> Self {
        let fps = fps.max(1);
        Self {
            fps,
            period: Duration::from_secs(1) / fps,
            start: None,
            last: None,
        }
    }

    /// Slot for a tick observed at `now`. Strictly increasing.
    pub fn slot_at(&mut self, now: Instant) -> u64 {
        let start = *self.start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        let period = self.period.as_nanos();
        let mut slot = ((elapsed.as_nanos() + period / 2) / period) as u64;
        if let Some(last) = self.last {
            slot = slot.max(last + 1);
        }
        self.last = Some(slot);
        slot
    }

    pub fn pts(&self, slot: u64) -> u32 {
        (slot * VIDEO_CLOCK_RATE as u64 / self.fps as u64) as u32
    }
}

/// Frame picked for one media tick
#[derive(Debug, Clone)]
pub struct TimedFrame {
    pub frame: Frame,
    pub slot: u64,
    pub pts: u32,
    /// Timestamp the following slot will carry
    pub next_pts: u32,
    /// No captured frame arrived within the tick; `frame` is the blank fallback.
    pub starved: bool,
}

/// Turns presentation timestamps into track samples.
///
/// The track stamps each sample with the sum of the previous durations, so a
/// payload-less filler sample is written first whenever slots were skipped.
#[derive(Debug, Default)]
pub struct RtpTimeline {
    expected: Option<u32>,
}

impl RtpTimeline {
    pub fn samples(&mut self, data: Bytes, pts: u32, next_pts: u32) -> (Option<Sample>, Sample) {
        let gap = self.expected.map_or(0, |expected| pts.wrapping_sub(expected));
        self.expected = Some(next_pts);

        let filler = (gap > 0).then(|| Sample {
            duration: ticks_to_duration(gap),
            ..Default::default()
        });
        let sample = Sample {
            data,
            duration: ticks_to_duration(next_pts.wrapping_sub(pts)),
            ..Default::default()
        };
        (filler, sample)
    }
}

/// Rounded up so the track's tick count truncates back to `ticks`.
fn ticks_to_duration(ticks: u32) -> Duration {
    Duration::from_nanos(ticks as u64 * 1_000_000_000 / VIDEO_CLOCK_RATE as u64 + 1)
}

/// Samples the freshest captured frame once per tick, never buffering.
pub struct MediaTrackAdapter {
    reader: FrameReader,
    interval: Duration,
    clock: MediaClock,
    blank: Frame,
    timer: Option<Interval>,
}

impl MediaTrackAdapter {
    pub fn new(reader: FrameReader, config: &MediaConfig) -> Self {
        Self {
            reader,
            interval: config.frame_interval(),
            clock: MediaClock::new(config.fps),
            blank: Frame::blank(config.blank_width, config.blank_height),
            timer: None,
        }
    }

    /// Wait for the next tick and return the frame to send on it.
    pub async fn next_frame(&mut self) -> TimedFrame {
        let interval = self.interval;
        let timer = self.timer.get_or_insert_with(|| {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });
        timer.tick().await;

        let slot = self.clock.slot_at(Instant::now());
        let (pts, next_pts) = (self.clock.pts(slot), self.clock.pts(slot + 1));
        let (frame, starved) = match self.poll_within_tick().await {
            Some(frame) => (frame, false),
            None => {
                metrics::counter!("media_blank_frames_total").increment(1);
                trace!("No frame within tick, sending blank");
                (self.blank.clone(), true)
            }
        };
        TimedFrame {
            frame,
            slot,
            pts,
            next_pts,
            starved,
        }
    }

    async fn poll_within_tick(&self) -> Option<Frame> {
        let attempts = (self.interval.as_millis() / POLL_STEP.as_millis()).max(1);
        for attempt in 0..attempts {
            if let Some(frame) = (self.reader)() {
                return Some(frame);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(POLL_STEP).await;
            }
        }
        None
    }

    /// Encode and write one sample per tick until cancelled.
    pub async fn pump(
        mut self,
        track: Arc<TrackLocalStaticSample>,
        mut encoder: Box<dyn VideoEncoder>,
        keyframes: KeyframeRequest,
        cancel: CancellationToken,
    ) {
        info!("Outbound video track running at {:?} per frame", self.interval);
        let mut timeline = RtpTimeline::default();
        let mut sent: u64 = 0;

        loop {
            let timed = tokio::select! {
                _ = cancel.cancelled() => break,
                timed = self.next_frame() => timed,
            };

            if keyframes.take() {
                debug!("Keyframe requested");
                encoder.force_keyframe();
            }

            let rgb = to_packed(&timed.frame, PixelFormat::Rgb24);
            let encoded = match encoder.encode(&rgb, timed.frame.width(), timed.frame.height()) {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Encode failed: {}", e);
                    continue;
                }
            };

            let (filler, sample) = timeline.samples(encoded, timed.pts, timed.next_pts);
            for sample in filler.iter().chain(Some(&sample)) {
                if let Err(e) = track.write_sample(sample).await {
                    if sent % 100 == 0 {
                        debug!("write_sample failed (no peer yet?): {}", e);
                    }
                }
            }
            sent += 1;
        }

        info!("Outbound video track stopped after {} samples", sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::pipeline::LatestValueChannel;

    fn media_config() -> MediaConfig {
        MediaConfig {
            fps: 25,
            blank_width: 64,
            blank_height: 48,
            ..MediaConfig::default()
        }
    }

    fn still_frame(seq: u64) -> Option<Frame> {
        Frame::packed(vec![0u8; 12], 2, 2, PixelFormat::Bgr24, seq).ok()
    }

    #[test]
    fn clock_counts_elapsed_frame_periods() {
        let mut clock = MediaClock::new(25);
        let t0 = Instant::now();
        assert_eq!(clock.slot_at(t0), 0);
        assert_eq!(clock.slot_at(t0 + Duration::from_millis(41)), 1);
        assert_eq!(clock.slot_at(t0 + Duration::from_millis(125)), 3);
        // never reuses a slot, even for a late duplicate tick
        assert_eq!(clock.slot_at(t0 + Duration::from_millis(125)), 4);
        assert_eq!(clock.pts(3), 10_800);
    }

    #[test]
    fn pts_stays_exact_for_uneven_rates() {
        let clock = MediaClock::new(30);
        assert_eq!(clock.pts(1), 3000);
        assert_eq!(clock.pts(30), VIDEO_CLOCK_RATE);
        assert_eq!(clock.pts(7) - clock.pts(6), 3000);
    }

    #[test]
    fn sample_duration_converts_back_to_exact_ticks() {
        for ticks in [1u32, 2999, 3000, 3600, 12_857, 90_000] {
            let back = (ticks_to_duration(ticks).as_secs_f64() * VIDEO_CLOCK_RATE as f64) as u32;
            assert_eq!(back, ticks);
        }
    }

    #[test]
    fn timeline_fills_skipped_slots() {
        let clock = MediaClock::new(25);
        let mut timeline = RtpTimeline::default();

        let (filler, first) = timeline.samples(Bytes::from_static(b"a"), clock.pts(0), clock.pts(1));
        assert!(filler.is_none());
        assert_eq!(first.duration, ticks_to_duration(3600));

        let (filler, _) = timeline.samples(Bytes::from_static(b"b"), clock.pts(1), clock.pts(2));
        assert!(filler.is_none());

        // slots 2 and 3 never made it out
        let (filler, sample) = timeline.samples(Bytes::from_static(b"c"), clock.pts(4), clock.pts(5));
        let filler = filler.expect("gap must be carried");
        assert!(filler.data.is_empty());
        assert_eq!(filler.duration, ticks_to_duration(7200));
        assert_eq!(sample.data, Bytes::from_static(b"c"));
        assert_eq!(sample.duration, ticks_to_duration(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_tick_advances_timestamp_by_elapsed_periods() {
        let mut adapter = MediaTrackAdapter::new(Arc::new(|| still_frame(1)), &media_config());
        let first = adapter.next_frame().await;
        assert_eq!((first.slot, first.pts), (0, 0));

        // the consumer stalls for more than two frame periods
        tokio::time::advance(Duration::from_millis(90)).await;
        let second = adapter.next_frame().await;
        assert_eq!(second.slot, 2);
        assert_eq!(second.pts, 7200);
        assert_eq!(second.next_pts, 10_800);
    }

    #[tokio::test(start_paused = true)]
    async fn starved_tick_substitutes_blank() {
        let mut adapter = MediaTrackAdapter::new(Arc::new(|| None), &media_config());
        let timed = adapter.next_frame().await;
        assert!(timed.starved);
        assert_eq!((timed.frame.width(), timed.frame.height()), (64, 48));
        assert_eq!(timed.pts, 0);

        let timed = adapter.next_frame().await;
        assert!(timed.starved);
        assert_eq!((timed.slot, timed.pts), (1, 3600));
    }

    #[tokio::test(start_paused = true)]
    async fn late_frame_within_tick_is_used() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reader: FrameReader = {
            let calls = Arc::clone(&calls);
            Arc::new(move || {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    None
                } else {
                    still_frame(7)
                }
            })
        };

        let mut adapter = MediaTrackAdapter::new(reader, &media_config());
        let timed = adapter.next_frame().await;
        assert!(!timed.starved);
        assert_eq!(timed.frame.meta.sequence, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn each_tick_reflects_only_latest_frame() {
        let outbound = Arc::new(LatestValueChannel::new());
        for seq in 0..5 {
            outbound.put(Frame::packed(vec![0u8; 12], 2, 2, PixelFormat::Bgr24, seq).unwrap());
        }

        let mut adapter = MediaTrackAdapter::new(outbound.reader(), &media_config());
        let first = adapter.next_frame().await;
        assert_eq!(first.frame.meta.sequence, 4);

        let second = adapter.next_frame().await;
        assert!(second.starved, "no backlog may be replayed");
    }
}
