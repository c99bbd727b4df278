#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::cache::Cache;
use crate::changes::ChangeApplier;
use crate::loader::BulkLoader;
use crate::ports::PortRegistry;
use crate::router::Router;
use crate::upstream::UpstreamHandle;

/// The handles wired together at startup.
///
/// No module-level mutable state anywhere in the worker; everything a task
/// needs hangs off this context.
pub struct WorkerContext {
	pub cache: Cache,
	pub loader: Arc<dyn BulkLoader>,
	pub ports: PortRegistry,
	pub upstream: UpstreamHandle,
}

impl WorkerContext {
	pub fn new(cache: Cache, loader: Arc<dyn BulkLoader>, ports: PortRegistry, upstream: UpstreamHandle) -> Self {
		Self {
			cache,
			loader,
			ports,
			upstream,
		}
	}

	/// Build the central router over this context's handles.
	pub fn router(&self) -> Router {
		let applier = ChangeApplier::new(self.cache.clone(), Arc::clone(&self.loader), self.ports.clone());
		Router::new(
			self.cache.clone(),
			Arc::clone(&self.loader),
			self.ports.clone(),
			self.upstream.clone(),
			applier,
		)
	}
}
