//! Mapping: depth-map maintenance over the current keyframe, keyframe
//! promotion, relocalizer lifecycle and optimization merges.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::kernels::DepthMap;
use crate::map::Frame;
use crate::system::core::SystemCore;
use crate::system::messages::{ConstraintMsg, MappingMsg};
use crate::tracking::{Relocalizer, TrackingThread};

/// Timeout for receiving tracked frames. Allows periodic shutdown and
/// relocalization checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// How long one mapping iteration waits on a relocalization result.
const RELOC_POLL: Duration = Duration::from_millis(50);

/// Handle to the mapping worker.
pub struct MappingThread {
    handle: Option<JoinHandle<()>>,
}

impl MappingThread {
    pub(crate) fn spawn(
        core: Arc<SystemCore>,
        depth_map: Box<dyn DepthMap>,
        relocalizer: Arc<Relocalizer>,
        tracking: Arc<TrackingThread>,
        rx: Receiver<MappingMsg>,
        constraint_tx: Option<Sender<ConstraintMsg>>,
    ) -> Self {
        let handle = thread::spawn(move || {
            let mut worker = MappingWorker {
                core,
                depth_map,
                relocalizer,
                tracking,
                constraint_tx,
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

struct MappingWorker {
    core: Arc<SystemCore>,
    depth_map: Box<dyn DepthMap>,
    relocalizer: Arc<Relocalizer>,
    tracking: Arc<TrackingThread>,
    constraint_tx: Option<Sender<ConstraintMsg>>,
}

impl MappingWorker {
    fn run(&mut self, rx: Receiver<MappingMsg>) {
        info!("mapping thread started");
        loop {
            if self.core.is_shutdown() {
                break;
            }

            self.drive_relocalizer();

            match rx.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => self.handle(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.relocalizer.stop();
        info!("mapping thread exiting");
    }

    /// Run the relocalizer while tracking is bad; hand a success back to
    /// tracking.
    fn drive_relocalizer(&mut self) {
        if self.tracking.is_tracking_good() || !self.core.is_initialized() {
            if self.relocalizer.is_running() {
                self.relocalizer.stop();
            }
            return;
        }

        if !self.relocalizer.is_running() {
            self.relocalizer.start(self.core.graph.snapshot_keyframes());
        }

        if self.relocalizer.wait_result(RELOC_POLL) {
            if let Some(result) = self.relocalizer.take_result() {
                self.relocalizer.stop();
                self.tracking.take_relocalize_result(result);
            }
        }
    }

    fn handle(&mut self, msg: MappingMsg) {
        match msg {
            MappingMsg::Init { frame, done } => {
                if frame.has_depth() {
                    info!(frame = %frame.id(), "seeding depth from supplied estimate");
                    self.depth_map.gt_depth_init(&frame);
                } else {
                    info!(frame = %frame.id(), "random depth initialization");
                    self.depth_map.random_init(&frame);
                }
                let _ = done.send(());
            }

            MappingMsg::TrackedFrame { frame, mapped } => {
                self.update_from_tracked_frame(&frame);
                if let Some(ack) = mapped {
                    let _ = ack.send(());
                }
            }

            MappingMsg::PromoteKeyframe { frame } => {
                self.promote_keyframe(frame);
            }

            MappingMsg::ReactivateKeyframe { keyframe } => {
                debug!(keyframe = %keyframe.id(), "re-activating keyframe depth");
                self.depth_map.set_from_existing_kf(&keyframe);
                self.publish_depth_visualization();
            }

            MappingMsg::MergeOptimization => {
                self.merge_optimization_update();
            }
        }
    }

    /// Fold one tracked frame into the current keyframe's depth map.
    fn update_from_tracked_frame(&mut self, frame: &Arc<Frame>) {
        if !self.tracking.is_tracking_good() {
            return;
        }
        let Some(keyframe) = self.core.current_keyframe.get() else {
            return;
        };

        let changed = self.depth_map.update_keyframe(frame);
        keyframe.count_mapped();
        if changed {
            debug!(
                frame = %frame.id(),
                keyframe = %keyframe.id(),
                "depth map refined"
            );
        }
        self.publish_depth_visualization();
    }

    /// Propagate depth into a promoted keyframe, register it in the graph
    /// and hand it to constraint search.
    fn promote_keyframe(&mut self, frame: Arc<Frame>) {
        self.depth_map.create_keyframe(&frame);

        if self.core.conf.slam_enabled {
            match self.core.graph.insert_keyframe(&frame) {
                Ok(index) => {
                    debug!(keyframe = %frame.id(), index, "keyframe registered in graph");
                    if let Some(tx) = &self.constraint_tx {
                        let _ = tx.send(ConstraintMsg::NewKeyframe(Arc::clone(&frame)));
                    }
                }
                Err(err) => {
                    // Double promotion of one frame is a programming error.
                    error!(%err, "failed to register keyframe");
                }
            }
        }

        if self.core.conf.continuous_pc_output {
            self.core.output.publish_keyframe(&frame);
        }
        self.publish_depth_visualization();
    }

    /// Optimization wrote back updated poses: force the tracking reference
    /// to re-import against the moved frame of reference and acknowledge
    /// the merge.
    fn merge_optimization_update(&mut self) {
        if let Some(keyframe) = self.core.current_keyframe.get() {
            self.depth_map.set_from_existing_kf(&keyframe);
            keyframe.mark_depth_updated();
        }
        debug!("optimization offsets merged");
        self.core.optimization_merged.notify();
        self.core.output.publish_keyframe_graph(&self.core.graph);
    }

    fn publish_depth_visualization(&self) {
        if !self.core.conf.display_depth_map {
            return;
        }
        if let Some(bytes) = self.depth_map.visualization() {
            self.core.output.publish_depth_image(&bytes);
        }
    }
}
