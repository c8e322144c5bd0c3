//! Frame: an immutable image capture plus its pose-bearing record and,
//! once promoted to a keyframe, the semi-dense inverse-depth hypothesis
//! field with its bookkeeping counters.
//!
//! Frames are shared by identity (`Arc<Frame>`) and cross-referenced by
//! `FrameId` handles rather than pointers, which keeps the frame ↔ tracking
//! parent relation acyclic.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::geometry::Sim3;

use super::pose::FramePose;

/// Unique identifier for a frame, assigned by the camera source.
///
/// Ids are strictly increasing over a run; a keyframe keeps the id of the
/// frame it was promoted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u64);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// One pyramid level: intensity and per-pixel gradient.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    pub width: usize,
    pub height: usize,
    pub intensity: Vec<f32>,
    /// (dx, dy) per pixel, central differences.
    pub gradient: Vec<[f32; 2]>,
}

/// Multi-level intensity/gradient pyramid. Immutable once built.
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    levels: Vec<PyramidLevel>,
}

impl ImagePyramid {
    /// Build a pyramid by 2x2 mean downsampling from a base intensity image.
    pub fn build(width: usize, height: usize, intensity: Vec<f32>, num_levels: usize) -> Self {
        assert_eq!(intensity.len(), width * height);

        let mut levels = Vec::with_capacity(num_levels);
        levels.push(Self::make_level(width, height, intensity));

        while levels.len() < num_levels {
            let next = {
                let prev = &levels[levels.len() - 1];
                let (w, h) = (prev.width / 2, prev.height / 2);
                if w == 0 || h == 0 {
                    break;
                }
                let mut down = vec![0.0f32; w * h];
                for y in 0..h {
                    for x in 0..w {
                        let i = 2 * y * prev.width + 2 * x;
                        down[y * w + x] = 0.25
                            * (prev.intensity[i]
                                + prev.intensity[i + 1]
                                + prev.intensity[i + prev.width]
                                + prev.intensity[i + prev.width + 1]);
                    }
                }
                Self::make_level(w, h, down)
            };
            levels.push(next);
        }

        Self { levels }
    }

    fn make_level(width: usize, height: usize, intensity: Vec<f32>) -> PyramidLevel {
        let mut gradient = vec![[0.0f32; 2]; width * height];
        for y in 0..height {
            for x in 0..width {
                let c = y * width + x;
                let dx = if x > 0 && x + 1 < width {
                    0.5 * (intensity[c + 1] - intensity[c - 1])
                } else {
                    0.0
                };
                let dy = if y > 0 && y + 1 < height {
                    0.5 * (intensity[c + width] - intensity[c - width])
                } else {
                    0.0
                };
                gradient[c] = [dx, dy];
            }
        }
        PyramidLevel {
            width,
            height,
            intensity,
            gradient,
        }
    }

    pub fn level(&self, i: usize) -> &PyramidLevel {
        &self.levels[i]
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn width(&self) -> usize {
        self.levels[0].width
    }

    pub fn height(&self) -> usize {
        self.levels[0].height
    }
}

/// Per-pixel inverse-depth hypothesis field of a keyframe.
#[derive(Debug, Clone)]
pub struct DepthHypotheses {
    /// Inverse depth per pixel; non-positive entries are holes.
    pub idepth: Vec<f32>,
    /// Hypothesis variance per pixel.
    pub variance: Vec<f32>,
    /// Mean inverse depth over valid pixels.
    pub mean_idepth: f32,
    /// Number of valid hypotheses.
    pub num_points: usize,
    /// Fraction of tracked points the reference supplied on the last
    /// tracking pass against this keyframe.
    pub point_usage: f32,
}

impl DepthHypotheses {
    /// Derive the aggregate fields from the per-pixel data.
    pub fn from_fields(idepth: Vec<f32>, variance: Vec<f32>) -> Self {
        let mut sum = 0.0f64;
        let mut n = 0usize;
        for &d in &idepth {
            if d > 0.0 {
                sum += d as f64;
                n += 1;
            }
        }
        let mean = if n > 0 { (sum / n as f64) as f32 } else { 1.0 };
        Self {
            idepth,
            variance,
            mean_idepth: mean,
            num_points: n,
            point_usage: 1.0,
        }
    }
}

/// An image frame.
///
/// Pixel contents never change after construction. The pose record and the
/// keyframe-only state (depth hypotheses, counters, graph index) are
/// interior-mutable so the frame can be shared across threads by `Arc`.
pub struct Frame {
    id: FrameId,
    timestamp: f64,
    pyramid: ImagePyramid,
    pose: Arc<FramePose>,

    depth: RwLock<Option<DepthHypotheses>>,
    /// Position in the graph's insertion order, -1 until inserted.
    graph_index: AtomicI64,
    /// Frames tracked against this keyframe.
    num_tracked_on_this: AtomicUsize,
    /// Frames mapped into this keyframe's depth field.
    num_mapped_on_this: AtomicUsize,
    /// Set by Mapping when the depth field changed; cleared by Tracking
    /// when it re-imports its reference.
    depth_updated: AtomicBool,
}

impl Frame {
    pub fn new(id: FrameId, timestamp: f64, pyramid: ImagePyramid) -> Arc<Self> {
        Arc::new(Self {
            id,
            timestamp,
            pyramid,
            pose: Arc::new(FramePose::new(id)),
            depth: RwLock::new(None),
            graph_index: AtomicI64::new(-1),
            num_tracked_on_this: AtomicUsize::new(0),
            num_mapped_on_this: AtomicUsize::new(0),
            depth_updated: AtomicBool::new(false),
        })
    }

    /// Construct with an externally supplied inverse-depth field, e.g. from
    /// a depth sensor. `initialize` uses it instead of random initialization.
    pub fn with_initial_depth(
        id: FrameId,
        timestamp: f64,
        pyramid: ImagePyramid,
        depth: DepthHypotheses,
    ) -> Arc<Self> {
        let frame = Self::new(id, timestamp, pyramid);
        *frame.depth.write() = Some(depth);
        frame
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn pyramid(&self) -> &ImagePyramid {
        &self.pyramid
    }

    pub fn pose(&self) -> &Arc<FramePose> {
        &self.pose
    }

    /// Shorthand for the pose's current cam-to-world similarity.
    pub fn cam_to_world(&self) -> Sim3 {
        self.pose.cam_to_world()
    }

    // ── keyframe state ──────────────────────────────────────────────────

    pub fn has_depth(&self) -> bool {
        self.depth.read().is_some()
    }

    /// Replace the depth hypothesis field and raise the depth-updated flag.
    pub fn set_depth(&self, depth: DepthHypotheses) {
        *self.depth.write() = Some(depth);
        self.depth_updated.store(true, Ordering::SeqCst);
    }

    /// Mean inverse depth, 1.0 when no hypotheses exist yet.
    pub fn mean_idepth(&self) -> f64 {
        self.depth
            .read()
            .as_ref()
            .map(|d| d.mean_idepth as f64)
            .unwrap_or(1.0)
    }

    /// Number of valid depth hypotheses.
    pub fn num_depth_points(&self) -> usize {
        self.depth.read().as_ref().map(|d| d.num_points).unwrap_or(0)
    }

    /// Point usage reported by the last tracking pass against this keyframe.
    pub fn point_usage(&self) -> f32 {
        self.depth
            .read()
            .as_ref()
            .map(|d| d.point_usage)
            .unwrap_or(0.0)
    }

    pub fn set_point_usage(&self, usage: f32) {
        if let Some(depth) = self.depth.write().as_mut() {
            depth.point_usage = usage;
        }
    }

    pub fn graph_index(&self) -> Option<usize> {
        let idx = self.graph_index.load(Ordering::SeqCst);
        (idx >= 0).then_some(idx as usize)
    }

    pub(crate) fn set_graph_index(&self, idx: usize) {
        self.graph_index.store(idx as i64, Ordering::SeqCst);
    }

    pub fn num_tracked_on_this(&self) -> usize {
        self.num_tracked_on_this.load(Ordering::SeqCst)
    }

    pub fn count_tracked(&self) {
        self.num_tracked_on_this.fetch_add(1, Ordering::SeqCst);
    }

    pub fn num_mapped_on_this(&self) -> usize {
        self.num_mapped_on_this.load(Ordering::SeqCst)
    }

    pub fn count_mapped(&self) {
        self.num_mapped_on_this.fetch_add(1, Ordering::SeqCst);
    }

    pub fn depth_was_updated(&self) -> bool {
        self.depth_updated.load(Ordering::SeqCst)
    }

    /// Raise the depth-updated flag without touching the hypotheses, e.g.
    /// after an optimization merge changed this keyframe's frame of
    /// reference.
    pub fn mark_depth_updated(&self) {
        self.depth_updated.store(true, Ordering::SeqCst);
    }

    pub fn clear_depth_updated(&self) {
        self.depth_updated.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("graph_index", &self.graph_index())
            .finish()
    }
}
