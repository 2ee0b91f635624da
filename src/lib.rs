//! # linux-restore-point
//!
//! Point-in-time restore points of a Linux host's configuration, user data and
//! removable volumes.
//!
//! ## Features
//!
//! - **Restore Point Kinds**: system (`/etc`) or full (`/etc` plus `/home`)
//! - **Removable Volumes**: mounted USB and removable media can be added on demand
//! - **Compression**: XZ (LZMA) with parallel processing
//! - **Safe Publishing**: artifacts are staged and renamed into place, never listed half-written
//! - **Operation Logs**: one owner-only log file per create, restore or delete
//!
//! ## Quick Start
//!
//! ```no_run
//! use linux_restore_point::restore_point::config::RestorePointConfig;
//! use linux_restore_point::restore_point::orchestrator::{CreateRequest, Orchestrator};
//! use linux_restore_point::restore_point::registry::RestorePointKind;
//!
//! let config = RestorePointConfig::load(None)?;
//! let orchestrator = Orchestrator::new(config)?;
//! let report = orchestrator.create(
//!     &CreateRequest::builder()
//!         .label("pre_update")
//!         .kind(RestorePointKind::System)
//!         .build(),
//! );
//! println!("{} (log: {:?})", report.status(), report.log_file);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod restore_point;
