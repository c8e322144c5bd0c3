//! SlamSystem - main entry point and thread orchestration.
//!
//! Owns the shared core and the background workers (mapping, constraint
//! search, optimization, relocalizer pool). Tracking runs on the calling
//! thread; everything else is asynchronous to it.

use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{debug, info};

use crate::constraints::{ConstraintSearchThread, TrackableKeyframeSearch};
use crate::geometry::{Sim3, Sim3f, SE3};
use crate::kernels::{OutputSink, SlamKernels};
use crate::map::{Frame, FrameId, KeyFrameGraph};
use crate::mapping::MappingThread;
use crate::optimization::OptimizationThread;
use crate::tracking::{Relocalizer, TrackingThread};

use super::config::Settings;
use super::core::SystemCore;
use super::messages::{ConstraintMsg, MappingMsg, OptimizationMsg};

/// The SLAM coordination engine.
pub struct SlamSystem {
    core: Arc<SystemCore>,
    kernels: Arc<dyn SlamKernels>,
    tracking: Arc<TrackingThread>,
    relocalizer: Arc<Relocalizer>,

    mapping_tx: Sender<MappingMsg>,
    constraint_tx: Option<Sender<ConstraintMsg>>,
    optimization_tx: Option<Sender<OptimizationMsg>>,

    mapping: MappingThread,
    constraint: Option<ConstraintSearchThread>,
    optimization: Option<OptimizationThread>,
}

impl SlamSystem {
    /// Build a system around the injected numerical collaborators and
    /// output sink, and spawn the background workers.
    pub fn new(
        conf: Settings,
        kernels: Arc<dyn SlamKernels>,
        output: Arc<dyn OutputSink>,
    ) -> Result<Self> {
        ensure!(conf.relocalize_threads > 0, "relocalize_threads must be positive");
        ensure!(conf.pyramid_levels > 0, "pyramid_levels must be positive");

        let core = Arc::new(SystemCore::new(conf, output));

        let (mapping_tx, mapping_rx) = unbounded::<MappingMsg>();
        let (constraint_tx, constraint_rx) = unbounded::<ConstraintMsg>();
        let (optimization_tx, optimization_rx) = unbounded::<OptimizationMsg>();

        let search = Arc::new(TrackableKeyframeSearch::new(
            Arc::clone(&core.graph),
            kernels.se3_tracker(),
            kernels.appearance_index(),
            &core.conf,
        ));
        let relocalizer = Arc::new(Relocalizer::new(
            core.conf.relocalize_threads,
            core.conf.relocalization_min_ratio(),
            Arc::clone(&kernels),
        ));
        let tracking = Arc::new(TrackingThread::new(
            Arc::clone(&core),
            Arc::clone(&search),
            Arc::clone(&relocalizer),
            mapping_tx.clone(),
            kernels.se3_tracker(),
        ));

        let slam_enabled = core.conf.slam_enabled;
        let constraint = slam_enabled.then(|| {
            ConstraintSearchThread::spawn(
                Arc::clone(&core),
                Arc::clone(&search),
                kernels.sim3_tracker(),
                constraint_rx,
                optimization_tx.clone(),
            )
        });
        let optimization = slam_enabled.then(|| {
            OptimizationThread::spawn(
                Arc::clone(&core),
                kernels.pose_graph_solver(),
                optimization_rx,
                mapping_tx.clone(),
            )
        });
        let mapping = MappingThread::spawn(
            Arc::clone(&core),
            kernels.depth_map(),
            Arc::clone(&relocalizer),
            Arc::clone(&tracking),
            mapping_rx,
            slam_enabled.then(|| constraint_tx.clone()),
        );

        Ok(Self {
            core,
            kernels,
            tracking,
            relocalizer,
            mapping_tx,
            constraint_tx: slam_enabled.then_some(constraint_tx),
            optimization_tx: slam_enabled.then_some(optimization_tx),
            mapping,
            constraint,
            optimization,
        })
    }

    /// Seed the map from the first frame: from its supplied inverse-depth
    /// field when it has one, otherwise by random initialization.
    pub fn initialize(&self, frame: Arc<Frame>) -> Result<()> {
        ensure!(
            self.core.conf.do_mapping,
            "mapping is disabled, but initialization requires it"
        );
        if self.core.is_initialized() {
            return Ok(());
        }
        if self.core.is_shutdown() {
            debug!("dropping initialization during shutdown");
            return Ok(());
        }

        let (done_tx, done_rx) = bounded(1);
        self.mapping_tx
            .send(MappingMsg::Init {
                frame: Arc::clone(&frame),
                done: done_tx,
            })
            .ok()
            .context("mapping thread is gone")?;
        done_rx
            .recv()
            .context("depth initialization did not complete")?;

        self.core.store_pose(&frame)?;
        if self.core.conf.slam_enabled {
            self.core.graph.insert_keyframe(&frame)?;
        }
        self.core.current_keyframe.set(Arc::clone(&frame));

        if self.core.conf.continuous_pc_output {
            self.core.output.publish_keyframe(&frame);
        }

        self.core.set_initialized();
        info!(frame = %frame.id(), "initialized");
        Ok(())
    }

    /// Submit a new frame. Initializes lazily on the first call. With
    /// `block_until_mapped` the call returns only after mapping consumed
    /// the frame.
    pub fn track_frame(&self, frame: Arc<Frame>, block_until_mapped: bool) -> Result<()> {
        if self.core.is_shutdown() {
            debug!(frame = %frame.id(), "dropping frame submitted during shutdown");
            return Ok(());
        }
        if !self.core.is_initialized() {
            return self.initialize(frame);
        }
        self.tracking.track_frame(frame, block_until_mapped)?;
        Ok(())
    }

    /// Synchronous finalization: full constraint search, final
    /// optimization, merge, then the finalized latch. Idempotent once
    /// complete.
    pub fn finalize(&self) -> Result<()> {
        if self.core.finalized.is_set() {
            return Ok(());
        }
        if self.core.is_shutdown() {
            debug!("ignoring finalize during shutdown");
            return Ok(());
        }

        info!("finalizing graph, adding final constraints");
        self.do_full_reconstraint_track()?;

        info!("finalizing graph, optimizing");
        self.do_final_optimization()?;
        if self.optimization_tx.is_some() {
            self.core.optimization_merged.wait();
        }

        info!("done finalizing graph");
        self.core.finalized.notify();
        Ok(())
    }

    /// Revisit all keyframes to densify the edge set; returns once the
    /// constraint-search thread signals completion.
    pub fn do_full_reconstraint_track(&self) -> Result<()> {
        if let Some(tx) = &self.constraint_tx {
            tx.send(ConstraintMsg::FullReConstraintTrack)
                .ok()
                .context("constraint thread is gone")?;
            self.core.full_reconstraint_done.wait();
        }
        Ok(())
    }

    /// Force one deep synchronous optimization pass.
    pub fn do_final_optimization(&self) -> Result<()> {
        if let Some(tx) = &self.optimization_tx {
            tx.send(OptimizationMsg::FinalOptimization)
                .ok()
                .context("optimization thread is gone")?;
            self.core.final_optimization_done.wait();
        }
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.core.finalized.is_set()
    }

    /// Block until `finalize` has completed (possibly on another thread).
    pub fn wait_until_finalized(&self) {
        self.core.finalized.wait();
    }

    /// A fresh system instance wired to the same output sink and kernels.
    pub fn full_reset(&self) -> Result<SlamSystem> {
        SlamSystem::new(
            self.core.conf.clone(),
            Arc::clone(&self.kernels),
            Arc::clone(&self.core.output),
        )
    }

    // ── observers ───────────────────────────────────────────────────────

    pub fn conf(&self) -> &Settings {
        &self.core.conf
    }

    pub fn graph(&self) -> &Arc<KeyFrameGraph> {
        &self.core.graph
    }

    pub fn is_tracking_good(&self) -> bool {
        self.tracking.is_tracking_good()
    }

    /// Force a tracking loss before the next frame.
    pub fn indicate_manual_tracking_loss(&self) {
        self.tracking.indicate_manual_tracking_loss();
    }

    pub fn current_keyframe_id(&self) -> Option<FrameId> {
        self.core.current_keyframe.get().map(|kf| kf.id())
    }

    /// SE(3) pose of the most recently tracked frame.
    pub fn get_current_pose_estimate(&self) -> Option<SE3> {
        self.core.current_pose_estimate()
    }

    /// Sim(3) pose of the most recently tracked frame, as 32-bit floats.
    pub fn get_current_pose_estimate_scale(&self) -> Option<Sim3f> {
        self.core.current_pose_estimate_scale()
    }

    /// Poses of every tracked frame, in tracking-completion order.
    pub fn get_all_poses(&self) -> Vec<Sim3> {
        self.core.all_poses()
    }

    /// Signal all workers to stop and wait for them.
    pub fn shutdown(&mut self) {
        self.core.request_shutdown();
        self.relocalizer.stop();

        self.mapping.join();
        if let Some(constraint) = &mut self.constraint {
            constraint.join();
        }
        if let Some(optimization) = &mut self.optimization {
            optimization.join();
        }
        info!("all threads exited");
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
