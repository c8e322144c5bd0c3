//! KeyFrameGraph: the shared store of keyframes and constraints.
//!
//! Holds the id→keyframe map, the insertion-ordered keyframe list, the edge
//! multiset and the aggregate counters. Each structure carries its own lock
//! so the hot readers (candidate search, optimization snapshots) take shared
//! holds without serializing against each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::SlamError;
use crate::geometry::{Matrix7, Sim3};

use super::frame::{Frame, FrameId};

/// A verified Sim(3) constraint between two keyframes. Immutable once added.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub from: FrameId,
    pub to: FrameId,
    /// Relative similarity taking `from`-camera coordinates to `to`.
    pub measurement: Sim3,
    pub information: Matrix7,
}

/// The keyframe graph.
#[derive(Default)]
pub struct KeyFrameGraph {
    keyframes_all: RwLock<Vec<Arc<Frame>>>,
    id_to_keyframe: Mutex<HashMap<FrameId, Arc<Frame>>>,
    edges: RwLock<Vec<Arc<Constraint>>>,
    total_vertices: AtomicUsize,
    total_points: AtomicUsize,
}

impl KeyFrameGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a keyframe, assigning it the next dense graph index.
    ///
    /// Rejects a second insertion of the same frame id.
    pub fn insert_keyframe(&self, kf: &Arc<Frame>) -> Result<usize, SlamError> {
        let mut ids = self.id_to_keyframe.lock();
        if ids.contains_key(&kf.id()) {
            return Err(SlamError::DuplicateKeyframe(kf.id()));
        }
        ids.insert(kf.id(), Arc::clone(kf));

        let mut all = self.keyframes_all.write();
        let index = all.len();
        kf.set_graph_index(index);
        all.push(Arc::clone(kf));

        self.total_vertices.fetch_add(1, Ordering::SeqCst);
        self.total_points
            .fetch_add(kf.num_depth_points(), Ordering::SeqCst);
        Ok(index)
    }

    pub fn lookup(&self, id: FrameId) -> Option<Arc<Frame>> {
        self.id_to_keyframe.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.id_to_keyframe.lock().contains_key(&id)
    }

    /// Add a verified constraint. Both endpoints must already be inserted.
    pub fn add_edge(&self, constraint: Constraint) -> Result<(), SlamError> {
        {
            let ids = self.id_to_keyframe.lock();
            for id in [constraint.from, constraint.to] {
                if !ids.contains_key(&id) {
                    return Err(SlamError::UnknownKeyframe(id));
                }
            }
        }
        self.edges.write().push(Arc::new(constraint));
        Ok(())
    }

    /// Keyframes in insertion order.
    pub fn snapshot_keyframes(&self) -> Vec<Arc<Frame>> {
        self.keyframes_all.read().clone()
    }

    pub fn snapshot_edges(&self) -> Vec<Arc<Constraint>> {
        self.edges.read().clone()
    }

    /// Current cam-to-world pose of every keyframe, in insertion order.
    pub fn snapshot_all_poses(&self) -> Vec<Sim3> {
        self.keyframes_all
            .read()
            .iter()
            .map(|kf| kf.cam_to_world())
            .collect()
    }

    /// Visit every keyframe under the shared lock, in insertion order.
    pub fn for_each_keyframe(&self, mut f: impl FnMut(&Arc<Frame>)) {
        for kf in self.keyframes_all.read().iter() {
            f(kf);
        }
    }

    pub fn keyframe_count(&self) -> usize {
        self.keyframes_all.read().len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.read().len()
    }

    pub fn total_points(&self) -> usize {
        self.total_points.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::frame::ImagePyramid;

    fn test_frame(id: u64) -> Arc<Frame> {
        Frame::new(FrameId(id), id as f64, ImagePyramid::build(4, 4, vec![0.0; 16], 1))
    }

    #[test]
    fn test_insert_assigns_dense_indices() {
        let graph = KeyFrameGraph::new();
        let a = test_frame(0);
        let b = test_frame(10);
        assert_eq!(graph.insert_keyframe(&a).unwrap(), 0);
        assert_eq!(graph.insert_keyframe(&b).unwrap(), 1);
        assert_eq!(a.graph_index(), Some(0));
        assert_eq!(b.graph_index(), Some(1));
        assert_eq!(graph.keyframe_count(), 2);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let graph = KeyFrameGraph::new();
        let a = test_frame(5);
        graph.insert_keyframe(&a).unwrap();
        assert!(matches!(
            graph.insert_keyframe(&a),
            Err(SlamError::DuplicateKeyframe(FrameId(5)))
        ));
        assert_eq!(graph.keyframe_count(), 1);
    }

    #[test]
    fn test_edge_requires_both_endpoints() {
        let graph = KeyFrameGraph::new();
        let a = test_frame(0);
        graph.insert_keyframe(&a).unwrap();
        let edge = Constraint {
            from: FrameId(0),
            to: FrameId(1),
            measurement: Sim3::identity(),
            information: Matrix7::identity(),
        };
        assert!(matches!(
            graph.add_edge(edge.clone()),
            Err(SlamError::UnknownKeyframe(FrameId(1)))
        ));

        let b = test_frame(1);
        graph.insert_keyframe(&b).unwrap();
        graph.add_edge(edge).unwrap();
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_lookup_by_id() {
        let graph = KeyFrameGraph::new();
        let a = test_frame(42);
        graph.insert_keyframe(&a).unwrap();
        assert_eq!(graph.lookup(FrameId(42)).map(|f| f.id()), Some(FrameId(42)));
        assert!(graph.lookup(FrameId(43)).is_none());
    }
}
