//! Storage Xen Motion (SXM) coordinator.
//!
//! A library embedded inside the source host's storage control process
//! that orchestrates live migration of an attached VDI from a local
//! storage repository to a remote one while the owning VM keeps running.
//!
//! The public surface is [`facade::Coordinator`]: it exposes the five verbs
//! (`start`, `stop`, `copy`, `stat`, `list`), the three remote-side entry
//! points (`receive_start`, `receive_finalize`, `receive_cancel`), and the
//! two lifecycle hooks (`pre_deactivate_hook`, `post_detach_hook`) that the
//! surrounding storage stack invokes.

pub mod cleanup;
pub mod config;
pub mod copy_engine;
pub mod datapath;
pub mod facade;
pub mod fdhandoff;
pub mod hooks;
pub mod logging;
pub mod mirror_engine;
pub mod receive_engine;
pub mod registry;
pub mod scheduler;
pub mod storage_api;

pub use sxm_common::ids;
pub use sxm_common::{
    AttachBackend, AttachInfo, DpId, Error, Result, SrId, TapDiskHandle, TapDiskStats, VdiId,
    VdiInfo,
};

pub use facade::Coordinator;
