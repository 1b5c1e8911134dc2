//! Backend-neutral OCI container image manipulation.
//!
//! `imgutil` mutates and republishes container images without caring where they live:
//! a Docker daemon, an OCI registry, or an on-disk `oci-layout` directory. Open an
//! [`Image`] from one [`backend::Backend`], mutate its [`config::Config`] and layer
//! stack in memory, then save it back to the same backend or a different one.
//!
//! # Architecture
//!
//! ```text
//! Image (backend-neutral core: Config + layer stack + history)
//!  ├── backend::daemon::DaemonBackend    — Docker Engine API, via bollard
//!  ├── backend::registry::RegistryBackend — OCI Distribution API, via oci-client
//!  └── backend::layout::LayoutBackend    — on-disk oci-layout directory
//!
//! rebase::rebase   — swap an image's base at a shared layer seam
//! index::Index     — multi-platform manifest list, with per-descriptor overlays
//! tarutil          — layer tar writing, including the Windows base-layer shape
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use imgutil::backend::layout::LayoutBackend;
//! use imgutil::backend::{Backend, SaveOptions};
//! use imgutil::Cancellation;
//!
//! # async fn run() -> imgutil::error::Result<()> {
//! let backend = LayoutBackend::new("/var/lib/imgutil/layout");
//! let mut image = backend.open("myapp:v1", &Cancellation::none()).await?;
//! image.set_label("maintainer", "ops@example.com");
//! backend.save(&image, "myapp:v2", SaveOptions::default(), &Cancellation::none()).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cancel;
pub mod config;
pub mod digest;
pub mod error;
pub mod image;
pub mod index;
pub mod layer;
pub mod manifest;
pub mod platform;
pub mod rebase;
pub mod reference;
pub mod tarutil;

pub use cancel::{Cancellation, Canceller};
pub use digest::Digest;
pub use error::{Error, Result};
pub use image::Image;
pub use index::Index;
pub use reference::Reference;
