//! Backend polymorphism: one capability interface, three implementations.
//!
//! §9's "Backend polymorphism" design note: daemon, registry, and on-disk layout share a
//! `{Open, Save, Delete, GetLayer}` contract but have distinct data sources. Each backend
//! is a concrete type implementing [`Backend`]; callers pick one and pass it through the
//! image core rather than the core subclassing anything.

pub mod daemon;
pub mod layout;
pub mod registry;

use crate::cancel::Cancellation;
use crate::error::{Error, Result, TagDiagnostic};
use crate::image::Image;

/// Extra names to additionally publish a save under, beyond the primary name.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Additional tags/names to publish the same content under.
    pub extra_names: Vec<String>,
}

/// Outcome of a [`Backend::save`] call: the primary name always either fully succeeds
/// (this variant) or the whole call returns `Err` (never a partial-success `Ok` for the
/// primary name).
#[derive(Debug)]
pub struct SaveResult {
    /// Backend-assigned identifier for the saved artifact.
    pub identifier: String,
    /// One entry per extra name that failed, empty when every extra name published too.
    pub extra_failures: Vec<TagDiagnostic>,
}

impl SaveResult {
    /// Turn extra-name failures into the `MultiTagError` shape callers match against, or
    /// `Ok(self)` if every extra name succeeded. The primary name's own failure is never
    /// folded in here — it is always a direct `Err` from `save` itself (§4.3, §7).
    pub fn into_result(self) -> Result<String> {
        if self.extra_failures.is_empty() {
            Ok(self.identifier)
        } else {
            Err(Error::MultiTagError {
                diagnostics: self.extra_failures,
            })
        }
    }
}

/// The capability interface every backend implements.
///
/// Declared with native `async fn` rather than boxed futures: nothing in this crate needs
/// `Box<dyn Backend>`, so the non-object-safe form is the simpler one.
pub trait Backend: std::fmt::Debug + Send + Sync {
    /// Resolve `name` in this backend and return a populated (possibly `found = false`)
    /// core. `cancel` is checked before any transport call; pass [`Cancellation::none`] if
    /// the caller has no cancellation source of its own.
    fn open(&self, name: &str, cancel: &Cancellation) -> impl std::future::Future<Output = Result<Image>> + Send;

    /// Publish `image` under `name`, and under every name in `options.extra_names`.
    /// `cancel` is checked before each blob/layer operation and before the retry in any
    /// backend that performs one (§5, §7).
    fn save(
        &self,
        image: &Image,
        name: &str,
        options: SaveOptions,
        cancel: &Cancellation,
    ) -> impl std::future::Future<Output = Result<SaveResult>> + Send;

    /// Remove the named artifact from this backend.
    fn delete(&self, name: &str, cancel: &Cancellation) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Run `op` for the primary name, then every extra name, aggregating extra-name failures
/// without letting them mask a primary-name failure. Shared by every backend's `save` so
/// the aggregation policy in §4.3/§4.4/§7 is implemented once.
pub(crate) async fn publish_with_extras<F, Fut>(
    name: &str,
    extras: &[String],
    cancel: &Cancellation,
    mut op: F,
) -> Result<SaveResult>
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    cancel.check()?;
    let identifier = op(name.to_owned()).await?;

    let mut extra_failures = Vec::new();
    for extra in extras {
        cancel.check()?;
        if let Err(err) = op(extra.clone()).await {
            extra_failures.push(TagDiagnostic {
                name: extra.clone(),
                cause: Box::new(err),
            });
        }
    }

    Ok(SaveResult {
        identifier,
        extra_failures,
    })
}
