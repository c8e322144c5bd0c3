//! Optimization: pose-graph solves and write-back of updated similarities.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::kernels::{GraphEdge, GraphVertex, PoseGraphSolver};
use crate::system::core::SystemCore;
use crate::system::messages::{MappingMsg, OptimizationMsg};

/// Timeout for receiving trigger signals. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Handle to the optimization worker.
pub struct OptimizationThread {
    handle: Option<JoinHandle<()>>,
}

impl OptimizationThread {
    pub(crate) fn spawn(
        core: Arc<SystemCore>,
        solver: Box<dyn PoseGraphSolver>,
        rx: Receiver<OptimizationMsg>,
        mapping_tx: Sender<MappingMsg>,
    ) -> Self {
        let handle = thread::spawn(move || {
            let mut worker = OptimizationWorker {
                core,
                solver,
                mapping_tx,
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

struct OptimizationWorker {
    core: Arc<SystemCore>,
    solver: Box<dyn PoseGraphSolver>,
    mapping_tx: Sender<MappingMsg>,
}

impl OptimizationWorker {
    fn run(&mut self, rx: Receiver<OptimizationMsg>) {
        info!("optimization thread started");
        loop {
            if self.core.is_shutdown() {
                break;
            }
            match rx.recv_timeout(RECV_TIMEOUT) {
                Ok(OptimizationMsg::NewConstraints) => {
                    if self.optimize(self.core.conf.optimization_iterations) {
                        let _ = self.mapping_tx.send(MappingMsg::MergeOptimization);
                    }
                }
                Ok(OptimizationMsg::FinalOptimization) => {
                    info!("running final optimization");
                    self.optimize(self.core.conf.final_optimization_iterations);
                    // Mapping acknowledges the merge even when nothing
                    // moved, so finalization never hangs on an empty graph.
                    let _ = self.mapping_tx.send(MappingMsg::MergeOptimization);
                    self.core.final_optimization_done.notify();
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("optimization thread exiting");
    }

    /// One snapshot → solve → write-back pass. Returns whether updated
    /// poses were written back.
    fn optimize(&mut self, iterations: usize) -> bool {
        // Snapshot under shared holds; the solver runs without any lock.
        let keyframes = self.core.graph.snapshot_keyframes();
        if keyframes.is_empty() {
            return false;
        }

        let vertices: Vec<GraphVertex> = {
            let _guard = self.core.pose_consistency.read();
            keyframes
                .iter()
                .map(|kf| GraphVertex {
                    id: kf.id(),
                    pose: kf.cam_to_world(),
                })
                .collect()
        };
        let edges: Vec<GraphEdge> = self
            .core
            .graph
            .snapshot_edges()
            .iter()
            .map(|c| GraphEdge {
                from: c.from,
                to: c.to,
                measurement: c.measurement.clone(),
                information: c.information,
            })
            .collect();

        let updated = self.solver.optimize(&vertices, &edges, iterations);

        if updated.iter().any(|v| !v.pose.is_finite()) {
            warn!("pose-graph solver diverged, skipping merge");
            return false;
        }

        // Write back under the exclusive pose-consistency hold.
        {
            let _guard = self.core.pose_consistency.write();
            for vertex in &updated {
                if let Some(kf) = self.core.graph.lookup(vertex.id) {
                    kf.pose().set_cam_to_world(vertex.pose.clone());
                }
            }
        }
        debug!(
            vertices = updated.len(),
            edges = edges.len(),
            "optimization pass written back"
        );
        true
    }
}
