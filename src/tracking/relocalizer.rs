//! Relocalizer: parallel rapid SE(3) probing of keyframe candidates after
//! tracking loss.
//!
//! A pool of workers draws candidates from a shared cursor and probes the
//! most recently published query frame against each from a neutral initial
//! pose. The first successful probe wins; `stop` halts the pool
//! cooperatively and is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::geometry::SE3;
use crate::kernels::{Se3Tracker, SlamKernels};
use crate::map::Frame;

use super::reference::TrackingReference;

/// A successful relocalization probe.
pub struct RelocalizerResult {
    /// The keyframe the query frame was localized against.
    pub keyframe: Arc<Frame>,
    /// The query frame that tracked successfully.
    pub successful_frame: Arc<Frame>,
    /// Frame-to-keyframe transform of the successful probe, used as the
    /// initial estimate for the verification re-track.
    pub frame_to_keyframe: SE3,
}

struct RelocState {
    candidates: Vec<Arc<Frame>>,
    current_frame: Option<Arc<Frame>>,
    /// Shared probe cursor. Each published query frame extends the window
    /// by one lap over the candidate set.
    next_idx: usize,
    max_idx: usize,
    continue_running: bool,
    result: Option<RelocalizerResult>,
}

/// Relocalization worker pool. Idle → Running → (Succeeded | Stopped) → Idle.
pub struct Relocalizer {
    state: Mutex<RelocState>,
    new_frame: Condvar,
    result_ready: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    num_threads: usize,
    min_good_ratio: f32,
    kernels: Arc<dyn SlamKernels>,
}

impl Relocalizer {
    pub fn new(num_threads: usize, min_good_ratio: f32, kernels: Arc<dyn SlamKernels>) -> Self {
        Self {
            state: Mutex::new(RelocState {
                candidates: Vec::new(),
                current_frame: None,
                next_idx: 0,
                max_idx: 0,
                continue_running: false,
                result: None,
            }),
            new_frame: Condvar::new(),
            result_ready: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            num_threads,
            min_good_ratio,
            kernels,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launch the probe workers against a candidate library. No-op when
    /// already running.
    pub fn start(self: &Arc<Self>, library: Vec<Arc<Frame>>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let num_candidates = library.len();
        {
            let mut state = self.state.lock();
            state.candidates = library;
            state.next_idx = 0;
            state.max_idx = num_candidates;
            state.continue_running = true;
            state.result = None;
        }

        let mut workers = self.workers.lock();
        for _ in 0..self.num_threads {
            let this = Arc::clone(self);
            let tracker = self.kernels.se3_tracker();
            workers.push(thread::spawn(move || this.worker_loop(tracker)));
        }

        info!(candidates = num_candidates, "relocalizer started");
    }

    /// Publish the most recent query frame; workers pick up the latest.
    pub fn update_current_frame(&self, frame: Arc<Frame>) {
        let mut state = self.state.lock();
        if state.result.is_some() {
            return;
        }
        if state.current_frame.as_ref().map(|f| f.id()) == Some(frame.id()) {
            return;
        }
        state.current_frame = Some(frame);
        state.max_idx = state.next_idx + state.candidates.len();
        self.new_frame.notify_all();
    }

    /// Halt the workers cooperatively. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock();
            state.continue_running = false;
        }
        self.new_frame.notify_all();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("relocalizer stopped");
    }

    /// Block until a probe succeeds or the timeout elapses.
    pub fn wait_result(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.result.is_none() {
            self.result_ready.wait_for(&mut state, timeout);
        }
        state.result.is_some()
    }

    /// Take the pending result, if any.
    pub fn take_result(&self) -> Option<RelocalizerResult> {
        self.state.lock().result.take()
    }

    fn worker_loop(self: Arc<Self>, mut tracker: Box<dyn Se3Tracker>) {
        let mut reference = TrackingReference::new();
        loop {
            let (frame, candidate) = {
                let mut state = self.state.lock();
                loop {
                    if !state.continue_running || state.result.is_some() {
                        return;
                    }
                    let have_work = state.current_frame.is_some()
                        && !state.candidates.is_empty()
                        && state.next_idx < state.max_idx;
                    if have_work {
                        break;
                    }
                    self.new_frame.wait(&mut state);
                }
                let idx = state.next_idx;
                state.next_idx += 1;
                let candidate = Arc::clone(&state.candidates[idx % state.candidates.len()]);
                let frame = match state.current_frame.as_ref() {
                    Some(f) => Arc::clone(f),
                    None => continue,
                };
                (frame, candidate)
            };

            if candidate.id() == frame.id() {
                continue;
            }

            reference.import_frame(&candidate);
            let probe = tracker.track(&reference, &frame, &SE3::identity());

            if probe.tracking_was_good && probe.good_per_goodbad() >= self.min_good_ratio {
                let mut state = self.state.lock();
                // First reporter wins.
                if state.result.is_none() {
                    info!(
                        frame = %frame.id(),
                        keyframe = %candidate.id(),
                        "relocalization probe succeeded"
                    );
                    state.result = Some(RelocalizerResult {
                        keyframe: candidate,
                        successful_frame: frame,
                        frame_to_keyframe: probe.ref_to_frame.inverse(),
                    });
                    state.continue_running = false;
                    self.result_ready.notify_all();
                    self.new_frame.notify_all();
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{DepthMap, PoseGraphSolver, Se3TrackingResult, Sim3Tracker};
    use crate::map::{FrameId, ImagePyramid};

    struct ProbeTracker {
        succeed_on: FrameId,
    }

    impl Se3Tracker for ProbeTracker {
        fn track(
            &mut self,
            reference: &TrackingReference,
            _frame: &Frame,
            _initial: &SE3,
        ) -> Se3TrackingResult {
            let good = reference.frame_id() == Some(self.succeed_on);
            Se3TrackingResult {
                ref_to_frame: SE3::identity(),
                residual: 0.0,
                point_usage: 1.0,
                good_count: if good { 90.0 } else { 10.0 },
                bad_count: if good { 10.0 } else { 90.0 },
                diverged: false,
                tracking_was_good: good,
            }
        }
    }

    struct ProbeKernels {
        succeed_on: FrameId,
    }

    impl SlamKernels for ProbeKernels {
        fn se3_tracker(&self) -> Box<dyn Se3Tracker> {
            Box::new(ProbeTracker {
                succeed_on: self.succeed_on,
            })
        }

        fn sim3_tracker(&self) -> Box<dyn Sim3Tracker> {
            unimplemented!("not used by the relocalizer")
        }

        fn depth_map(&self) -> Box<dyn DepthMap> {
            unimplemented!("not used by the relocalizer")
        }

        fn pose_graph_solver(&self) -> Box<dyn PoseGraphSolver> {
            unimplemented!("not used by the relocalizer")
        }
    }

    fn test_frame(id: u64) -> Arc<Frame> {
        Frame::new(FrameId(id), id as f64, ImagePyramid::build(4, 4, vec![0.0; 16], 1))
    }

    fn library() -> Vec<Arc<Frame>> {
        (0..4).map(test_frame).collect()
    }

    #[test]
    fn test_first_success_wins_and_stop_is_idempotent() {
        let kernels = Arc::new(ProbeKernels {
            succeed_on: FrameId(2),
        });
        let reloc = Arc::new(Relocalizer::new(2, 0.625, kernels));

        reloc.start(library());
        reloc.update_current_frame(test_frame(100));

        assert!(reloc.wait_result(Duration::from_secs(5)));
        let result = reloc.take_result().unwrap();
        assert_eq!(result.keyframe.id(), FrameId(2));
        assert_eq!(result.successful_frame.id(), FrameId(100));

        reloc.stop();
        reloc.stop();
        assert!(!reloc.is_running());
    }

    #[test]
    fn test_no_success_times_out() {
        let kernels = Arc::new(ProbeKernels {
            succeed_on: FrameId(999),
        });
        let reloc = Arc::new(Relocalizer::new(2, 0.625, kernels));

        reloc.start(library());
        reloc.update_current_frame(test_frame(100));

        assert!(!reloc.wait_result(Duration::from_millis(100)));
        assert!(reloc.take_result().is_none());
        reloc.stop();
    }

    #[test]
    fn test_start_is_idempotent_while_running() {
        let kernels = Arc::new(ProbeKernels {
            succeed_on: FrameId(999),
        });
        let reloc = Arc::new(Relocalizer::new(1, 0.625, kernels));
        reloc.start(library());
        reloc.start(library());
        assert!(reloc.is_running());
        reloc.stop();
    }
}
