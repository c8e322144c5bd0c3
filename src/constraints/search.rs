//! Trackable-keyframe search: given a query keyframe, propose other
//! keyframes likely trackable from it, for constraint creation or
//! re-activation.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::geometry::SE3;
use crate::kernels::{AppearanceIndex, Se3Tracker};
use crate::map::{Frame, KeyFrameGraph};
use crate::system::config::Settings;
use crate::tracking::TrackingReference;

/// Bound on the SE(3) log-norm between a probe result and the
/// graph-predicted relative pose for a re-activation candidate.
const MAX_REPOSITION_DISCREPANCY: f64 = 0.2;

/// A candidate keyframe with its predicted relative transform.
#[derive(Clone)]
pub struct TrackableKf {
    pub keyframe: Arc<Frame>,
    /// Predicted reference-to-query transform from the graph poses.
    pub ref_to_frame: SE3,
    /// Scaled squared camera-center distance.
    pub dist_squared: f64,
    /// Viewing-direction alignment (dot product).
    pub angle: f64,
}

/// Geometric + appearance candidate selection against the keyframe graph.
pub struct TrackableKeyframeSearch {
    graph: Arc<KeyFrameGraph>,
    /// Probe tracker for verifying re-activation candidates.
    tracker: Mutex<Box<dyn Se3Tracker>>,
    appearance: Mutex<Option<Box<dyn AppearanceIndex>>>,
    kf_dist_weight: f32,
    kf_usage_weight: f32,
    /// fowX + fowY of the camera, radians.
    fov_sum: f64,
}

impl TrackableKeyframeSearch {
    pub fn new(
        graph: Arc<KeyFrameGraph>,
        tracker: Box<dyn Se3Tracker>,
        appearance: Option<Box<dyn AppearanceIndex>>,
        conf: &Settings,
    ) -> Self {
        let fov_sum = conf.camera.fov_x(conf.slam_image.width)
            + conf.camera.fov_y(conf.slam_image.height);
        Self {
            graph,
            tracker: Mutex::new(tracker),
            appearance: Mutex::new(appearance),
            kf_dist_weight: conf.kf_dist_weight,
            kf_usage_weight: conf.kf_usage_weight,
            fov_sum,
        }
    }

    /// Closeness score of a reference: smaller is better.
    ///
    /// score = d² · w_dist² + (1 − usage)² · w_usage²
    pub fn ref_frame_score(&self, dist_squared: f32, usage: f32) -> f32 {
        dist_squared * self.kf_dist_weight * self.kf_dist_weight
            + (1.0 - usage) * (1.0 - usage) * self.kf_usage_weight * self.kf_usage_weight
    }

    /// Register a new keyframe with the appearance index, if one is wired.
    pub fn add_to_appearance_index(&self, keyframe: &Arc<Frame>) {
        if let Some(index) = self.appearance.lock().as_mut() {
            index.add(keyframe);
        }
    }

    /// Candidates whose camera centers and viewing directions overlap the
    /// query's, with thresholds scaled to the reference's depth.
    ///
    /// `dist_threshold` bounds the idepth-scaled squared center distance;
    /// `angle_threshold` scales the viewing-angle gate relative to the
    /// camera field of view. With `check_both_scales` the distance is also
    /// tested under the query's own depth scale.
    pub fn find_euclidean_overlap_frames(
        &self,
        frame: &Arc<Frame>,
        dist_threshold: f64,
        angle_threshold: f64,
        check_both_scales: bool,
    ) -> Vec<TrackableKf> {
        let cos_angle_threshold = (angle_threshold * 0.5 * self.fov_sum).cos();

        let frame_pose = frame.cam_to_world();
        let pos = frame_pose.translation;
        let viewing_dir = frame_pose.viewing_direction();
        let dist_fac_reciprocal = frame.mean_idepth() / frame_pose.scale;

        let mut candidates = Vec::new();
        self.graph.for_each_keyframe(|kf| {
            if kf.id() == frame.id() {
                return;
            }
            let other_pose = kf.cam_to_world();

            // Distance between camera centers, scaled to the potential
            // reference frame's depth.
            let mut dist_fac = kf.mean_idepth() / other_pose.scale;
            if check_both_scales && dist_fac_reciprocal < dist_fac {
                dist_fac = dist_fac_reciprocal;
            }
            let dist = (pos - other_pose.translation) * dist_fac;
            let dist_squared = dist.dot(&dist);
            if dist_squared > dist_threshold {
                return;
            }

            let angle = other_pose.viewing_direction().dot(&viewing_dir);
            if angle < cos_angle_threshold {
                return;
            }

            let ref_to_frame = other_pose
                .inverse()
                .compose(&frame_pose)
                .to_se3()
                .inverse();
            candidates.push(TrackableKf {
                keyframe: Arc::clone(kf),
                ref_to_frame,
                dist_squared,
                angle,
            });
        });
        candidates
    }

    /// Candidate set for constraint creation, ordered by decreasing
    /// likelihood (ascending score, graph index breaking ties). The query
    /// itself is never returned.
    pub fn find_candidates(
        &self,
        keyframe: &Arc<Frame>,
        include_appearance: bool,
        closeness_threshold: f32,
    ) -> Vec<Arc<Frame>> {
        let closeness = closeness_threshold as f64;
        let dist_threshold =
            closeness * 15.0 / (self.kf_dist_weight as f64 * self.kf_dist_weight as f64);
        let angle_threshold = 1.0 - 0.25 * closeness;

        let mut scored: Vec<(f32, usize, Arc<Frame>)> = self
            .find_euclidean_overlap_frames(keyframe, dist_threshold, angle_threshold, true)
            .into_iter()
            .map(|c| {
                let score =
                    self.ref_frame_score(c.dist_squared as f32, c.keyframe.point_usage());
                let index = c.keyframe.graph_index().unwrap_or(usize::MAX);
                (score, index, c.keyframe)
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut results: Vec<Arc<Frame>> = Vec::with_capacity(scored.len());
        for (_, _, kf) in scored {
            if !results.iter().any(|r| r.id() == kf.id()) {
                results.push(kf);
            }
        }

        if include_appearance {
            if let Some(index) = self.appearance.lock().as_mut() {
                if let Some(hit) = index.query(keyframe) {
                    if hit != keyframe.id() && !results.iter().any(|r| r.id() == hit) {
                        if let Some(kf) = self.graph.lookup(hit) {
                            debug!(query = %keyframe.id(), hit = %hit, "appearance candidate");
                            results.push(kf);
                        }
                    }
                }
            }
        }

        results
    }

    /// Best re-activation candidate with score ≤ `max_score`, verified by a
    /// quick SE(3) probe, or none.
    pub fn find_reposition_candidate(
        &self,
        frame: &Arc<Frame>,
        max_score: f32,
    ) -> Option<Arc<Frame>> {
        let dist_threshold =
            max_score as f64 / (self.kf_dist_weight as f64 * self.kf_dist_weight as f64);
        let candidates = self.find_euclidean_overlap_frames(frame, dist_threshold, 0.75, false);

        let mut tracker = self.tracker.lock();
        let mut reference = TrackingReference::new();
        let mut best: Option<(f32, usize, Arc<Frame>)> = None;

        for candidate in candidates {
            reference.import_frame(&candidate.keyframe);
            let probe = tracker.track(
                &reference,
                frame,
                &candidate.ref_to_frame.inverse(),
            );
            if !probe.tracking_was_good || probe.diverged {
                continue;
            }

            let discrepancy = probe
                .ref_to_frame
                .compose(&candidate.ref_to_frame.inverse())
                .log()
                .norm();
            if discrepancy >= MAX_REPOSITION_DISCREPANCY {
                continue;
            }

            let score = self.ref_frame_score(candidate.dist_squared as f32, probe.point_usage);
            if score > max_score {
                continue;
            }

            let index = candidate.keyframe.graph_index().unwrap_or(usize::MAX);
            let better = match &best {
                None => true,
                Some((best_score, best_index, _)) => {
                    score < *best_score || (score == *best_score && index < *best_index)
                }
            };
            if better {
                best = Some((score, index, candidate.keyframe));
            }
        }

        best.map(|(_, _, kf)| kf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::Se3TrackingResult;
    use crate::map::{FrameId, ImagePyramid};
    use nalgebra::Vector3;

    /// Probe that reports perfect tracking at the predicted pose.
    struct AgreeableTracker;

    impl Se3Tracker for AgreeableTracker {
        fn track(
            &mut self,
            _reference: &TrackingReference,
            _frame: &Frame,
            initial: &SE3,
        ) -> Se3TrackingResult {
            Se3TrackingResult {
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

    fn search_over(keyframes: &[Arc<Frame>]) -> TrackableKeyframeSearch {
        let graph = Arc::new(KeyFrameGraph::new());
        for kf in keyframes {
            graph.insert_keyframe(kf).unwrap();
        }
        TrackableKeyframeSearch::new(graph, Box::new(AgreeableTracker), None, &Settings::default())
    }

    #[test]
    fn test_empty_graph_returns_empty_set() {
        let search = search_over(&[]);
        let query = frame_at(99, 0.0);
        assert!(search.find_candidates(&query, true, 1.0).is_empty());
        assert!(search.find_reposition_candidate(&query, 1.0).is_none());
    }

    #[test]
    fn test_self_is_never_a_candidate() {
        let kf = frame_at(0, 0.0);
        let search = search_over(&[kf.clone()]);
        assert!(search.find_candidates(&kf, false, 1.0).is_empty());
    }

    #[test]
    fn test_closer_keyframe_scores_first() {
        let near = frame_at(0, 0.05);
        let far = frame_at(10, 0.4);
        let search = search_over(&[far.clone(), near.clone()]);
        let query = frame_at(25, 0.0);

        let candidates = search.find_candidates(&query, false, 1.0);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id(), FrameId(0));
        assert_eq!(candidates[1].id(), FrameId(10));
    }

    #[test]
    fn test_reposition_prefers_best_score() {
        let near = frame_at(10, 0.01);
        let far = frame_at(0, 0.3);
        let search = search_over(&[far, near]);
        let query = frame_at(25, 0.0);

        let found = search.find_reposition_candidate(&query, 1.0);
        assert_eq!(found.map(|kf| kf.id()), Some(FrameId(10)));
    }

    #[test]
    fn test_reposition_with_zero_max_score_needs_perfect_match() {
        let offset = frame_at(0, 0.1);
        let search = search_over(&[offset]);
        let query = frame_at(25, 0.0);
        // Distance term is nonzero, so no candidate passes a zero bound.
        assert!(search.find_reposition_candidate(&query, 0.0).is_none());

        let exact = frame_at(1, 0.0);
        let search = search_over(&[exact]);
        let found = search.find_reposition_candidate(&query, 0.0);
        assert_eq!(found.map(|kf| kf.id()), Some(FrameId(1)));
    }
}
