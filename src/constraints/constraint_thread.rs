//! Constraint-search worker: for each new keyframe, find and verify
//! Sim(3) edges against the rest of the graph.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::kernels::Sim3Tracker;
use crate::map::{Constraint, Frame};
use crate::system::core::SystemCore;
use crate::system::messages::{ConstraintMsg, OptimizationMsg};
use crate::tracking::TrackingReference;

use super::search::TrackableKeyframeSearch;

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Handle to the constraint-search worker.
pub struct ConstraintSearchThread {
    handle: Option<JoinHandle<()>>,
}

impl ConstraintSearchThread {
    pub(crate) fn spawn(
        core: Arc<SystemCore>,
        search: Arc<TrackableKeyframeSearch>,
        tracker: Box<dyn Sim3Tracker>,
        rx: Receiver<ConstraintMsg>,
        optimization_tx: Sender<OptimizationMsg>,
    ) -> Self {
        let handle = thread::spawn(move || {
            let mut worker = ConstraintWorker {
                core,
                search,
                tracker,
                optimization_tx,
            };
            worker.run(rx);
        });
        Self {
            handle: Some(handle),
        }
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct ConstraintWorker {
    core: Arc<SystemCore>,
    search: Arc<TrackableKeyframeSearch>,
    tracker: Box<dyn Sim3Tracker>,
    optimization_tx: Sender<OptimizationMsg>,
}

impl ConstraintWorker {
    fn run(&mut self, rx: Receiver<ConstraintMsg>) {
        info!("constraint-search thread started");
        loop {
            if self.core.is_shutdown() {
                break;
            }
            match rx.recv_timeout(RECV_TIMEOUT) {
                Ok(ConstraintMsg::NewKeyframe(kf)) => {
                    self.search.add_to_appearance_index(&kf);
                    let added = self.find_constraints_for(&kf);
                    if added > 0 {
                        let _ = self.optimization_tx.send(OptimizationMsg::NewConstraints);
                    }
                }
                Ok(ConstraintMsg::FullReConstraintTrack) => {
                    self.full_reconstraint_track();
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("constraint-search thread exiting");
    }

    /// Revisit every keyframe to densify the edge set, then signal
    /// completion.
    fn full_reconstraint_track(&mut self) {
        info!("full re-constraint track over the whole graph");
        let keyframes = self.core.graph.snapshot_keyframes();
        let mut added = 0;
        for kf in &keyframes {
            added += self.find_constraints_for(kf);
        }
        if added > 0 {
            let _ = self.optimization_tx.send(OptimizationMsg::NewConstraints);
        }
        debug!(edges = added, "full re-constraint track complete");
        self.core.full_reconstraint_done.notify();
    }

    /// Search for edges from one keyframe. Returns the number added.
    fn find_constraints_for(&mut self, keyframe: &Arc<Frame>) -> usize {
        let candidates = self.search.find_candidates(keyframe, true, 1.0);

        let mut added = 0;
        for candidate in candidates {
            if candidate.id() == keyframe.id() {
                continue;
            }
            if self.already_constrained(keyframe, &candidate) {
                continue;
            }
            if let Some((forward, backward)) = self.verify_pair(keyframe, &candidate) {
                let from_ok = self.core.graph.add_edge(forward).is_ok();
                let to_ok = self.core.graph.add_edge(backward).is_ok();
                if from_ok && to_ok {
                    added += 2;
                    debug!(a = %candidate.id(), b = %keyframe.id(), "constraint accepted");
                } else {
                    warn!(a = %candidate.id(), b = %keyframe.id(), "edge endpoint vanished");
                }
            }
        }
        added
    }

    fn already_constrained(&self, a: &Arc<Frame>, b: &Arc<Frame>) -> bool {
        self.core.graph.snapshot_edges().iter().any(|edge| {
            (edge.from == a.id() && edge.to == b.id())
                || (edge.from == b.id() && edge.to == a.id())
        })
    }

    /// Track the pair in both directions; accept iff both passes succeed
    /// within the residual gate and the two estimates agree within the
    /// information-weighted consistency gate.
    fn verify_pair(
        &mut self,
        keyframe: &Arc<Frame>,
        candidate: &Arc<Frame>,
    ) -> Option<(Constraint, Constraint)> {
        let residual_gate = self.core.conf.constraint_residual_gate;
        let consistency_gate = self.core.conf.constraint_consistency_gate;

        let mut reference = TrackingReference::new();

        // candidate → keyframe
        reference.import_frame(candidate);
        let init_frame_to_cand = candidate
            .cam_to_world()
            .inverse()
            .compose(&keyframe.cam_to_world());
        let forward = self
            .tracker
            .track(&reference, keyframe, &init_frame_to_cand);
        if forward.diverged || !forward.tracking_was_good || forward.residual > residual_gate {
            return None;
        }

        // keyframe → candidate
        reference.import_frame(keyframe);
        let init_cand_to_kf = keyframe
            .cam_to_world()
            .inverse()
            .compose(&candidate.cam_to_world());
        let backward = self
            .tracker
            .track(&reference, candidate, &init_cand_to_kf);
        if backward.diverged || !backward.tracking_was_good || backward.residual > residual_gate
        {
            return None;
        }

        // Reciprocal consistency: forward ∘ backward should be identity.
        let err = forward.ref_to_frame.compose(&backward.ref_to_frame).log();
        let info = (forward.information + backward.information) * 0.5;
        let weighted = err.dot(&(info * err));
        if !weighted.is_finite() || weighted > consistency_gate {
            debug!(
                a = %candidate.id(),
                b = %keyframe.id(),
                error = weighted,
                "constraint rejected by reciprocal consistency"
            );
            return None;
        }

        Some((
            Constraint {
                from: candidate.id(),
                to: keyframe.id(),
                measurement: forward.ref_to_frame.clone(),
                information: forward.information,
            },
            Constraint {
                from: keyframe.id(),
                to: candidate.id(),
                measurement: backward.ref_to_frame.clone(),
                information: backward.information,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Matrix7, Sim3};
    use crate::kernels::{NullOutput, Sim3TrackingResult};
    use crate::map::{FrameId, ImagePyramid, KeyFrameGraph};
    use crate::system::config::Settings;
    use crossbeam_channel::unbounded;
    use nalgebra::Vector3;

    /// Sim(3) tracker that reproduces the graph-relative transform exactly.
    struct ConsistentSim3Tracker;

    impl Sim3Tracker for ConsistentSim3Tracker {
        fn track(
            &mut self,
            _reference: &TrackingReference,
            _frame: &Frame,
            initial: &Sim3,
        ) -> Sim3TrackingResult {
            Sim3TrackingResult {
                ref_to_frame: initial.inverse(),
                residual: 0.1,
                information: Matrix7::identity(),
                diverged: false,
                tracking_was_good: true,
            }
        }
    }

    struct AgreeableSe3;

    impl crate::kernels::Se3Tracker for AgreeableSe3 {
        fn track(
            &mut self,
            _reference: &TrackingReference,
            _frame: &Frame,
            initial: &crate::geometry::SE3,
        ) -> crate::kernels::Se3TrackingResult {
            crate::kernels::Se3TrackingResult {
                ref_to_frame: initial.inverse(),
                residual: 0.0,
                point_usage: 1.0,
                good_count: 100.0,
                bad_count: 0.0,
                diverged: false,
                tracking_was_good: true,
            }
        }
    }

    fn frame_at(id: u64, x: f64) -> Arc<Frame> {
        let frame = Frame::new(FrameId(id), id as f64, ImagePyramid::build(4, 4, vec![0.0; 16], 1));
        let mut pose = frame.cam_to_world();
        pose.translation = Vector3::new(x, 0.0, 0.0);
        frame.pose().set_cam_to_world(pose);
        frame
    }

    fn worker_over(keyframes: &[Arc<Frame>]) -> (ConstraintWorker, Receiver<OptimizationMsg>) {
        let core = Arc::new(SystemCore::new(Settings::default(), Arc::new(NullOutput)));
        for kf in keyframes {
            core.graph.insert_keyframe(kf).unwrap();
        }
        let graph: Arc<KeyFrameGraph> = Arc::clone(&core.graph);
        let search = Arc::new(TrackableKeyframeSearch::new(
            graph,
            Box::new(AgreeableSe3),
            None,
            &core.conf,
        ));
        let (tx, rx) = unbounded();
        let worker = ConstraintWorker {
            core,
            search,
            tracker: Box::new(ConsistentSim3Tracker),
            optimization_tx: tx,
        };
        (worker, rx)
    }

    #[test]
    fn test_reciprocal_pair_adds_both_directions() {
        let a = frame_at(0, 0.0);
        let b = frame_at(15, 0.05);
        let (mut worker, _rx) = worker_over(&[a.clone(), b.clone()]);

        let added = worker.find_constraints_for(&b);
        assert_eq!(added, 2);
        let edges = worker.core.graph.snapshot_edges();
        assert!(edges
            .iter()
            .any(|e| e.from == FrameId(0) && e.to == FrameId(15)));
        assert!(edges
            .iter()
            .any(|e| e.from == FrameId(15) && e.to == FrameId(0)));
    }

    #[test]
    fn test_pair_is_not_constrained_twice() {
        let a = frame_at(0, 0.0);
        let b = frame_at(15, 0.05);
        let (mut worker, _rx) = worker_over(&[a, b.clone()]);

        assert_eq!(worker.find_constraints_for(&b), 2);
        assert_eq!(worker.find_constraints_for(&b), 0);
        assert_eq!(worker.core.graph.edge_count(), 2);
    }
}
