//! Application-level orchestration.
//!
//! This module owns the submission lifecycle (select, upload, progress, polling) and
//! post-completion processing such as auto-save and exports. UI/CLI layers call into
//! this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{spawn_controller, ControllerHandle, Services, MIN_PROGRESS_TICK};
pub(crate) use post_process::{process_completion, OutputTargets, ProcessedScan};
