//! Shared types for the `vu-core` virtual-user execution workspace.
//!
//! This crate provides foundational, dependency-light types used by
//! `vu-core` and by anything embedding it (a CLI, a dashboard, an output
//! backend) without pulling in the scripting engine or transport stack.
//!
//! ## Layout
//!
//! - [`options`] — the `Options` record parsed from a script's `options`
//!   export, and `Runner::set_options`'s override argument.
//! - [`tags`] — `TagSet` and `Group`, merged onto every emitted sample.
//! - [`sample`] — `SampleContainer`/`Trail`, the samples-channel payload.
//! - [`archive`] — the portable bundle archive format.
//! - [`error`] — `RunnerError`, the error kinds from `spec.md` §7.

pub mod archive;
pub mod error;
pub mod options;
pub mod sample;
pub mod tags;

pub use archive::Archive;
pub use error::{RunnerError, Stage};
pub use options::{CompatibilityMode, Options, SystemTags, TlsAuth};
pub use sample::{ConnectTiming, SampleContainer, Trail};
pub use tags::{Group, TagSet};
