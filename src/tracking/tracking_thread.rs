//! Tracking: the real-time per-frame SE(3) pipeline, the keyframe-switch
//! decision and the tracking-loss state machine.
//!
//! Runs on the frame-ingestion thread; everything else in the system is
//! asynchronous to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::SlamError;
use crate::geometry::{Sim3, Sim3f};
use crate::kernels::Se3Tracker;
use crate::map::Frame;
use crate::system::core::SystemCore;
use crate::system::messages::MappingMsg;

use super::reference::TrackingReference;
use super::relocalizer::{Relocalizer, RelocalizerResult};

struct TrackerState {
    tracker: Box<dyn Se3Tracker>,
    reference: TrackingReference,
}

/// The tracking front end.
pub struct TrackingThread {
    core: Arc<SystemCore>,
    search: Arc<crate::constraints::TrackableKeyframeSearch>,
    relocalizer: Arc<Relocalizer>,
    mapping_tx: Sender<MappingMsg>,
    state: Mutex<TrackerState>,
    tracking_good: AtomicBool,
    manual_tracking_loss: AtomicBool,
}

impl TrackingThread {
    pub(crate) fn new(
        core: Arc<SystemCore>,
        search: Arc<crate::constraints::TrackableKeyframeSearch>,
        relocalizer: Arc<Relocalizer>,
        mapping_tx: Sender<MappingMsg>,
        tracker: Box<dyn Se3Tracker>,
    ) -> Self {
        Self {
            core,
            search,
            relocalizer,
            mapping_tx,
            state: Mutex::new(TrackerState {
                tracker,
                reference: TrackingReference::new(),
            }),
            tracking_good: AtomicBool::new(true),
            manual_tracking_loss: AtomicBool::new(false),
        }
    }

    pub fn is_tracking_good(&self) -> bool {
        self.tracking_good.load(Ordering::SeqCst)
    }

    pub fn set_tracking_bad(&self) {
        self.tracking_good.store(false, Ordering::SeqCst);
    }

    fn set_tracking_good(&self) {
        self.tracking_good.store(true, Ordering::SeqCst);
    }

    /// Force a tracking loss before the next frame (test/debug hook).
    pub fn indicate_manual_tracking_loss(&self) {
        self.manual_tracking_loss.store(true, Ordering::SeqCst);
    }

    /// Track one frame against the current keyframe.
    pub fn track_frame(
        &self,
        frame: Arc<Frame>,
        block_until_mapped: bool,
    ) -> Result<(), SlamError> {
        if self.core.is_shutdown() {
            debug!(frame = %frame.id(), "dropping frame submitted during shutdown");
            return Ok(());
        }

        if !self.is_tracking_good() {
            // Hand the frame to the relocalizer; mapping drives recovery.
            self.relocalizer.update_current_frame(frame);
            return Ok(());
        }

        let keyframe = self
            .core
            .current_keyframe
            .get()
            .ok_or(SlamError::NotInitialized)?;

        let result = {
            let mut state = self.state.lock();

            if state.reference.frame_id() != Some(keyframe.id()) || keyframe.depth_was_updated()
            {
                debug!(keyframe = %keyframe.id(), "importing tracking reference");
                state.reference.import_frame(&keyframe);
                keyframe.clear_depth_updated();
            }

            // Identity-motion prediction: the last tracked pose relative to
            // the reference, read consistently against optimization.
            let frame_to_reference_initial = {
                let _guard = self.core.pose_consistency.read();
                let last = self
                    .core
                    .all_frame_poses
                    .last()
                    .ok_or(SlamError::NotInitialized)?;
                keyframe
                    .pose()
                    .cam_to_world()
                    .inverse()
                    .compose(&last.cam_to_world())
                    .to_se3()
            };

            let state = &mut *state;
            state
                .tracker
                .track(&state.reference, &frame, &frame_to_reference_initial)
        };

        keyframe.count_tracked();
        keyframe.set_point_usage(result.point_usage);

        let manual_loss = self.manual_tracking_loss.load(Ordering::SeqCst);
        let past_init_phase =
            self.core.graph.keyframe_count() > self.core.conf.init_phase_count;
        if manual_loss || result.diverged || (past_init_phase && !result.tracking_was_good) {
            warn!(
                frame = %frame.id(),
                diverged = result.diverged,
                good = result.tracking_was_good,
                manual = manual_loss,
                "tracking lost"
            );
            self.state.lock().reference.invalidate();
            self.set_tracking_bad();
            self.manual_tracking_loss.store(false, Ordering::SeqCst);
            return Ok(());
        }

        frame.pose().set_tracked(
            keyframe.id(),
            keyframe
                .pose()
                .cam_to_world()
                .compose(&Sim3::from_se3(&result.ref_to_frame.inverse())),
        );
        self.core.store_pose(&frame)?;

        self.core.output.publish_tracked_frame(&frame);
        self.core
            .output
            .publish_pose(Sim3f::from(&frame.cam_to_world()));

        // Forward to mapping, optionally waiting for the depth update.
        let ack = if block_until_mapped {
            let (tx, rx) = bounded(1);
            let _ = self.mapping_tx.send(MappingMsg::TrackedFrame {
                frame: Arc::clone(&frame),
                mapped: Some(tx),
            });
            Some(rx)
        } else {
            let _ = self.mapping_tx.send(MappingMsg::TrackedFrame {
                frame: Arc::clone(&frame),
                mapped: None,
            });
            None
        };
        if let Some(rx) = ack {
            let _ = rx.recv();
        }

        // Keyframe-switch decision.
        if keyframe.num_mapped_on_this() > self.core.conf.min_num_mapped {
            let dist = result.ref_to_frame.translation * keyframe.mean_idepth();
            let dist_squared = dist.dot(&dist) as f32;
            let score = self.search.ref_frame_score(dist_squared, result.point_usage);

            let graph_size = self.core.graph.keyframe_count();
            let init_phase = self.core.conf.init_phase_count;
            let mut min_val =
                (0.2 + graph_size as f32 * 0.8 / init_phase as f32).min(1.0);
            if graph_size < init_phase {
                min_val *= 0.7;
            }

            if score > min_val {
                info!(
                    frame = %frame.id(),
                    score,
                    threshold = min_val,
                    "selecting new keyframe"
                );
                self.change_keyframe(frame, false, true, 1.0);
            }
        }

        Ok(())
    }

    /// Switch the current keyframe: re-activate a nearby existing keyframe
    /// when possible, otherwise promote `candidate` (or, when creation is
    /// disallowed, fall into relocalization).
    pub fn change_keyframe(
        &self,
        candidate: Arc<Frame>,
        no_create: bool,
        force: bool,
        max_score: f32,
    ) {
        let mut new_reference = None;
        if self.core.conf.do_kf_reactivation && self.core.conf.slam_enabled {
            new_reference = self.search.find_reposition_candidate(&candidate, max_score);
        }

        if let Some(keyframe) = new_reference {
            info!(keyframe = %keyframe.id(), "re-activating existing keyframe");
            self.load_new_current_keyframe(keyframe);
        } else if force {
            if no_create {
                info!("moved outside of known map, starting relocalizer");
                self.set_tracking_bad();
            } else {
                self.create_new_current_keyframe(candidate);
            }
        }
    }

    fn load_new_current_keyframe(&self, keyframe: Arc<Frame>) {
        let _ = self.mapping_tx.send(MappingMsg::ReactivateKeyframe {
            keyframe: Arc::clone(&keyframe),
        });
        keyframe.clear_depth_updated();
        self.core.current_keyframe.set(keyframe);
    }

    fn create_new_current_keyframe(&self, frame: Arc<Frame>) {
        info!(frame = %frame.id(), "promoting frame to keyframe");
        self.core.current_keyframe.set(Arc::clone(&frame));
        let _ = self
            .mapping_tx
            .send(MappingMsg::PromoteKeyframe { frame });
    }

    /// Verify a relocalization result by re-tracking the successful frame
    /// against the found keyframe; on success, tracking resumes.
    ///
    /// Called from the mapping thread.
    pub fn take_relocalize_result(&self, result: RelocalizerResult) {
        self.core.current_keyframe.set(Arc::clone(&result.keyframe));

        let retrack = {
            let mut state = self.state.lock();
            state.reference.import_frame(&result.keyframe);
            result.keyframe.clear_depth_updated();

            let state = &mut *state;
            state.tracker.track(
                &state.reference,
                &result.successful_frame,
                &result.frame_to_keyframe,
            )
        };

        let min_ratio = self.core.conf.relocalization_min_ratio();
        if !retrack.tracking_was_good || retrack.good_per_goodbad() < min_ratio {
            debug!("relocalization failed badly, discarding result");
            self.state.lock().reference.invalidate();
            return;
        }

        result.successful_frame.pose().set_tracked(
            result.keyframe.id(),
            result
                .keyframe
                .pose()
                .cam_to_world()
                .compose(&Sim3::from_se3(&retrack.ref_to_frame.inverse())),
        );
        if let Err(err) = self.core.store_pose(&result.successful_frame) {
            warn!(%err, "discarding relocalized pose");
            return;
        }

        self.core
            .output
            .publish_tracked_frame(&result.successful_frame);
        self.core
            .output
            .publish_pose(Sim3f::from(&result.successful_frame.cam_to_world()));

        // Mapping is the caller; forward without blocking on its queue.
        let _ = self.mapping_tx.send(MappingMsg::TrackedFrame {
            frame: result.successful_frame,
            mapped: None,
        });

        info!(keyframe = %result.keyframe.id(), "relocalization succeeded");
        self.set_tracking_good();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::TrackableKeyframeSearch;
    use crate::geometry::SE3;
    use crate::kernels::{
        DepthMap, NullOutput, PoseGraphSolver, Se3TrackingResult, Sim3Tracker, SlamKernels,
    };
    use crate::map::{FrameId, ImagePyramid};
    use crate::system::config::Settings;
    use crossbeam_channel::{unbounded, Receiver};
    use nalgebra::Vector3;

    /// Tracker that reports a fixed translation with configurable health.
    struct ScriptedTracker {
        translation: Vector3<f64>,
        diverged: bool,
    }

    impl Se3Tracker for ScriptedTracker {
        fn track(
            &mut self,
            _reference: &TrackingReference,
            _frame: &Frame,
            _initial: &SE3,
        ) -> Se3TrackingResult {
            Se3TrackingResult {
                ref_to_frame: SE3::from_translation(self.translation),
                residual: 0.1,
                point_usage: 1.0,
                good_count: 100.0,
                bad_count: 0.0,
                diverged: self.diverged,
                tracking_was_good: !self.diverged,
            }
        }
    }

    struct ScriptedKernels {
        translation: Vector3<f64>,
    }

    impl SlamKernels for ScriptedKernels {
        fn se3_tracker(&self) -> Box<dyn Se3Tracker> {
            Box::new(ScriptedTracker {
                translation: self.translation,
                diverged: false,
            })
        }

        fn sim3_tracker(&self) -> Box<dyn Sim3Tracker> {
            unimplemented!("not used in tracking tests")
        }

        fn depth_map(&self) -> Box<dyn DepthMap> {
            unimplemented!("not used in tracking tests")
        }

        fn pose_graph_solver(&self) -> Box<dyn PoseGraphSolver> {
            unimplemented!("not used in tracking tests")
        }
    }

    fn test_frame(id: u64) -> Arc<Frame> {
        Frame::new(FrameId(id), id as f64, ImagePyramid::build(4, 4, vec![0.0; 16], 1))
    }

    struct Fixture {
        tracking: TrackingThread,
        mapping_rx: Receiver<MappingMsg>,
        keyframe: Arc<Frame>,
    }

    /// A core seeded with keyframe 0 current and its pose registered, as
    /// `initialize` leaves it.
    fn fixture(translation: Vector3<f64>, reactivation: bool) -> Fixture {
        let mut conf = Settings::default();
        conf.do_kf_reactivation = reactivation;

        let core = Arc::new(SystemCore::new(conf, Arc::new(NullOutput)));
        let keyframe = test_frame(0);
        core.graph.insert_keyframe(&keyframe).unwrap();
        core.store_pose(&keyframe).unwrap();
        core.current_keyframe.set(Arc::clone(&keyframe));
        core.set_initialized();

        let kernels = Arc::new(ScriptedKernels { translation });
        let search = Arc::new(TrackableKeyframeSearch::new(
            Arc::clone(&core.graph),
            kernels.se3_tracker(),
            None,
            &core.conf,
        ));
        let relocalizer = Arc::new(Relocalizer::new(1, 0.625, kernels.clone()));
        let (mapping_tx, mapping_rx) = unbounded();

        let tracking = TrackingThread::new(
            core,
            search,
            relocalizer,
            mapping_tx,
            kernels.se3_tracker(),
        );
        Fixture {
            tracking,
            mapping_rx,
            keyframe,
        }
    }

    #[test]
    fn test_small_motion_appends_pose_without_switch() {
        let fx = fixture(Vector3::new(0.01, 0.0, 0.0), false);
        fx.tracking.track_frame(test_frame(1), false).unwrap();
        fx.tracking.track_frame(test_frame(2), false).unwrap();

        assert_eq!(fx.tracking.core.all_frame_poses.len(), 3);
        assert_eq!(
            fx.tracking.core.current_keyframe.get().map(|kf| kf.id()),
            Some(FrameId(0))
        );
        // Two tracked-frame messages, no promotion.
        let msgs: Vec<_> = fx.mapping_rx.try_iter().collect();
        assert_eq!(msgs.len(), 2);
        assert!(msgs
            .iter()
            .all(|m| matches!(m, MappingMsg::TrackedFrame { .. })));
    }

    #[test]
    fn test_manual_loss_routes_to_relocalizer() {
        let fx = fixture(Vector3::new(0.01, 0.0, 0.0), false);
        fx.tracking.track_frame(test_frame(1), false).unwrap();

        fx.tracking.indicate_manual_tracking_loss();
        fx.tracking.track_frame(test_frame(5), false).unwrap();

        // The lost frame's pose is absent and tracking is bad.
        assert_eq!(fx.tracking.core.all_frame_poses.len(), 2);
        assert!(!fx.tracking.is_tracking_good());

        // The next frame goes to the relocalizer, not SE(3) tracking.
        fx.tracking.track_frame(test_frame(6), false).unwrap();
        assert_eq!(fx.tracking.core.all_frame_poses.len(), 2);
    }

    #[test]
    fn test_large_motion_promotes_keyframe() {
        let fx = fixture(Vector3::new(0.5, 0.0, 0.0), false);
        // Pass the mapped-on-this gate.
        for _ in 0..=fx.tracking.core.conf.min_num_mapped {
            fx.keyframe.count_mapped();
        }

        let frame = test_frame(15);
        fx.tracking.track_frame(Arc::clone(&frame), false).unwrap();

        assert_eq!(
            fx.tracking.core.current_keyframe.get().map(|kf| kf.id()),
            Some(FrameId(15))
        );
        let msgs: Vec<_> = fx.mapping_rx.try_iter().collect();
        assert!(msgs
            .iter()
            .any(|m| matches!(m, MappingMsg::PromoteKeyframe { frame } if frame.id() == FrameId(15))));
    }

    #[test]
    fn test_score_equal_to_threshold_does_not_switch() {
        // With 5 keyframes the threshold is exactly 1.0; a 0.25 translation
        // at unit mean inverse depth lands the score exactly on it.
        let fx = fixture(Vector3::new(0.25, 0.0, 0.0), false);
        for id in 100..104 {
            fx.tracking.core.graph.insert_keyframe(&test_frame(id)).unwrap();
        }
        assert_eq!(fx.tracking.core.graph.keyframe_count(), 5);
        for _ in 0..=fx.tracking.core.conf.min_num_mapped {
            fx.keyframe.count_mapped();
        }

        fx.tracking.track_frame(test_frame(200), false).unwrap();

        assert_eq!(
            fx.tracking.core.current_keyframe.get().map(|kf| kf.id()),
            Some(FrameId(0))
        );
    }

    #[test]
    fn test_relocalize_result_restores_tracking() {
        let fx = fixture(Vector3::new(0.01, 0.0, 0.0), false);
        fx.tracking.track_frame(test_frame(1), false).unwrap();

        fx.tracking.set_tracking_bad();
        assert!(!fx.tracking.is_tracking_good());

        let result = RelocalizerResult {
            keyframe: Arc::clone(&fx.keyframe),
            successful_frame: test_frame(6),
            frame_to_keyframe: SE3::identity(),
        };
        fx.tracking.take_relocalize_result(result);

        assert!(fx.tracking.is_tracking_good());
        assert_eq!(fx.tracking.core.all_frame_poses.len(), 3);
        assert_eq!(
            fx.tracking
                .core
                .all_frame_poses
                .last()
                .map(|p| p.frame_id()),
            Some(FrameId(6))
        );
    }

    #[test]
    fn test_change_keyframe_reactivates_nearby_keyframe() {
        let fx = fixture(Vector3::new(0.01, 0.0, 0.0), true);

        // Keyframe 10 sits where frame 25 is; keyframe 0 stays at the origin,
        // outside the re-position distance gate.
        let near = test_frame(10);
        let mut pose = near.cam_to_world();
        pose.translation = Vector3::new(1.0, 0.0, 0.0);
        near.pose().set_cam_to_world(pose.clone());
        fx.tracking.core.graph.insert_keyframe(&near).unwrap();

        let incoming = test_frame(25);
        incoming.pose().set_cam_to_world(pose);
        fx.tracking.change_keyframe(incoming, false, true, 1.0);

        assert_eq!(
            fx.tracking.core.current_keyframe.get().map(|kf| kf.id()),
            Some(FrameId(10))
        );
        let msgs: Vec<_> = fx.mapping_rx.try_iter().collect();
        assert!(msgs
            .iter()
            .any(|m| matches!(m, MappingMsg::ReactivateKeyframe { keyframe } if keyframe.id() == FrameId(10))));
    }

    #[test]
    fn test_change_keyframe_no_create_marks_tracking_bad() {
        let fx = fixture(Vector3::new(0.01, 0.0, 0.0), false);
        fx.tracking.change_keyframe(test_frame(25), true, true, 1.0);
        assert!(!fx.tracking.is_tracking_good());
        // Current keyframe is untouched.
        assert_eq!(
            fx.tracking.core.current_keyframe.get().map(|kf| kf.id()),
            Some(FrameId(0))
        );
    }
}
