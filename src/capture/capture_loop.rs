//! Dedicated capture thread fanning frames out to render and network

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::frame::Frame;
use super::source::{DeviceInfo, FrameSource};
use crate::error::{Error, Result};
use crate::pipeline::LatestValueChannel;
use crate::CaptureConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Running,
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Owns the frame source across run/stop cycles.
///
/// Every frame read goes to the render context through a queued dispatch and
/// into the outbound latest-value channel for the media path.
pub struct CaptureLoop {
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    outbound: Arc<LatestValueChannel<Frame>>,
    render_tx: Sender<Frame>,
    backoff: Duration,
    join_timeout: Duration,
    worker: Option<Worker>,
}

impl CaptureLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        outbound: Arc<LatestValueChannel<Frame>>,
        render_tx: Sender<Frame>,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            outbound,
            render_tx,
            backoff: Duration::from_millis(config.read_backoff_ms),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
            worker: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        match self.worker {
            Some(_) => CaptureState::Running,
            None => CaptureState::Stopped,
        }
    }

    pub fn is_device_open(&self) -> bool {
        self.source.lock().is_open()
    }

    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.source.lock().list_devices()
    }

    /// Stop any running loop, then acquire device `index` and start reading.
    pub fn open_device(&mut self, index: u32) -> Result<()> {
        self.stop();
        {
            let mut source = self.source.lock();
            source.open(index)?;
        }
        info!("Opened capture device {}", index);
        self.start()
    }

    /// Stop the loop and release the device.
    pub fn close_device(&mut self) {
        self.stop();
        self.source.lock().close();
    }

    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        if !self.source.lock().is_open() {
            return Err(Error::Capture("device is not open".into()));
        }

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done) = flume::bounded(1);

        let handle = {
            let running = Arc::clone(&running);
            let source = Arc::clone(&self.source);
            let outbound = Arc::clone(&self.outbound);
            let render_tx = self.render_tx.clone();
            let backoff = self.backoff;

            thread::Builder::new()
                .name("capture".into())
                .spawn(move || {
                    run_loop(&running, &source, &outbound, &render_tx, backoff);
                    let _ = done_tx.send(());
                })?
        };

        self.worker = Some(Worker {
            running,
            handle,
            done,
        });
        info!("Capture loop started");
        Ok(())
    }

    /// Signal the loop to exit and join it within the configured timeout.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        worker.running.store(false, Ordering::SeqCst);
        match worker.done.recv_timeout(self.join_timeout) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("Capture thread panicked");
                }
                info!("Capture loop stopped");
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                warn!(
                    "Capture thread did not exit within {:?}, detaching",
                    self.join_timeout
                );
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
        self.source.lock().close();
    }
}

fn run_loop(
    running: &AtomicBool,
    source: &Mutex<Box<dyn FrameSource>>,
    outbound: &LatestValueChannel<Frame>,
    render_tx: &Sender<Frame>,
    backoff: Duration,
) {
    debug!("Capture thread running");

    while running.load(Ordering::SeqCst) {
        let read = {
            let mut source = source.lock();
            // Re-check under the lock: a device switch may have happened while we waited.
            if !running.load(Ordering::SeqCst) {
                break;
            }
            source.read()
        };

        match read {
            Ok(Some(frame)) => {
                metrics::counter!("capture_frames_total").increment(1);
                match render_tx.try_send(frame.clone()) {
                    Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                    Err(TrySendError::Full(_)) => {
                        metrics::counter!("render_dispatch_dropped_total").increment(1);
                    }
                }
                outbound.put(frame);
            }
            Ok(None) => {
                metrics::counter!("capture_read_misses_total").increment(1);
                thread::sleep(backoff);
            }
            Err(e) => {
                trace!("Capture read failed: {}", e);
                metrics::counter!("capture_read_misses_total").increment(1);
                thread::sleep(backoff);
            }
        }
    }

    debug!("Capture thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counters {
        opens: AtomicUsize,
        releases: AtomicUsize,
        readers: AtomicUsize,
        max_readers: AtomicUsize,
        reads: AtomicUsize,
    }

    struct FakeSource {
        counters: Arc<Counters>,
        open: bool,
        miss_every: usize,
    }

    impl FrameSource for FakeSource {
        fn open(&mut self, _index: u32) -> Result<()> {
            self.close();
            self.open = true;
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn read(&mut self) -> Result<Option<Frame>> {
            let active = self.counters.readers.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_readers.fetch_max(active, Ordering::SeqCst);
            let n = self.counters.reads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            self.counters.readers.fetch_sub(1, Ordering::SeqCst);

            if self.miss_every > 0 && n % self.miss_every == 0 {
                return Ok(None);
            }
            Frame::packed(vec![0u8; 12], 2, 2, PixelFormat::Bgr24, n as u64).map(Some)
        }

        fn close(&mut self) {
            if self.open {
                self.open = false;
                self.counters.releases.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn list_devices(&self) -> Vec<DeviceInfo> {
            vec![DeviceInfo {
                index: 0,
                name: "Fake".into(),
            }]
        }
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            read_backoff_ms: 1,
            join_timeout_ms: 1000,
            ..CaptureConfig::default()
        }
    }

    fn fixture(miss_every: usize) -> (CaptureLoop, Arc<Counters>, Arc<LatestValueChannel<Frame>>, Receiver<Frame>) {
        let counters = Arc::new(Counters::default());
        let source = FakeSource {
            counters: Arc::clone(&counters),
            open: false,
            miss_every,
        };
        let outbound = Arc::new(LatestValueChannel::new());
        let (tx, rx) = flume::bounded(4);
        let capture = CaptureLoop::new(Box::new(source), Arc::clone(&outbound), tx, &config());
        (capture, counters, outbound, rx)
    }

    #[test]
    fn start_requires_open_device() {
        let (mut capture, _, _, _) = fixture(0);
        assert!(capture.start().is_err());
        assert_eq!(capture.state(), CaptureState::Stopped);
    }

    #[test]
    fn frames_reach_both_consumers() {
        let (mut capture, _, outbound, rx) = fixture(3);
        capture.open_device(0).unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.format(), PixelFormat::Bgr24);
        thread::sleep(Duration::from_millis(20));
        assert!(outbound.try_get().is_some());

        capture.stop();
        assert_eq!(capture.state(), CaptureState::Stopped);
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut capture, _, _, _rx) = fixture(0);
        capture.open_device(0).unwrap();
        capture.stop();
        capture.stop();
        assert_eq!(capture.state(), CaptureState::Stopped);
    }

    #[test]
    fn repeated_device_switches_keep_one_reader() {
        let (mut capture, counters, _, _rx) = fixture(2);
        for index in 0..5 {
            capture.open_device(index).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        capture.close_device();
        capture.close_device();

        assert_eq!(counters.max_readers.load(Ordering::SeqCst), 1);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 5);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn drop_releases_device_once() {
        let (mut capture, counters, _, _rx) = fixture(0);
        capture.open_device(0).unwrap();
        drop(capture);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_misses_do_not_stop_the_loop() {
        let (mut capture, counters, _, rx) = fixture(1);
        // miss_every = 1 means every read misses
        capture.open_device(0).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(capture.state(), CaptureState::Running);
        assert!(counters.reads.load(Ordering::SeqCst) > 1);
        assert!(rx.try_recv().is_err());
        capture.stop();
    }
}
